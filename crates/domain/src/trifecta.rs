//! Seams for the vault (durable memory) and lens (summarization)
//! subsystems.
//!
//! The core only consumes these traits; concrete stores live outside
//! this workspace. Absence of either (no trait object configured) is a
//! valid configuration; the session then drops compacted content
//! instead of archiving it.

use crate::chat::Message;
use crate::error::Result;

/// Durable key-value memory surviving context compactions.
#[async_trait::async_trait]
pub trait Vault: Send + Sync {
    /// Store a note; returns the note id.
    async fn note(&self, key: &str, value: &str) -> Result<String>;

    /// Archive raw tool messages dropped by compaction; returns the
    /// number archived.
    async fn archive_tool_messages(&self, messages: &[Message]) -> Result<usize>;

    /// Search stored notes.
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<VaultRow>>;
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct VaultRow {
    pub id: String,
    pub key: String,
    pub value: String,
}

/// Optional summarization service for compressing tool output and diffs.
#[async_trait::async_trait]
pub trait Lens: Send + Sync {
    /// Summarize a file diff; `None` means "no useful summary".
    async fn summarize_diff(&self, before: &str, after: &str, path: &str) -> Result<Option<String>>;

    /// Summarize a tool invocation's output.
    async fn summarize_tool_output(
        &self,
        tool: &str,
        args: &serde_json::Value,
        result: &str,
    ) -> Result<Option<String>>;
}
