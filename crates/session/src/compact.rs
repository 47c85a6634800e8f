//! Between-turn context compaction.
//!
//! When the estimated prompt size crosses the configured fraction of
//! the context window, the oldest tool-call groups go first (an
//! assistant message with tool calls plus its tool results), then the
//! oldest non-system messages. Dropped content is archived through the
//! vault when one is configured, and a digest line takes its place so
//! the model knows history was removed. Compaction never runs
//! mid-stream.

use ih_domain::chat::{Message, Role};
use ih_domain::config::SessionConfig;
use ih_domain::tokens::estimate_messages;
use ih_domain::trifecta::{Lens, Vault};

/// Messages at the tail that are never compacted away (the active
/// exchange the model is working on).
const KEEP_RECENT: usize = 4;

#[derive(Debug, Clone, Default)]
pub struct CompactionReport {
    pub dropped_messages: usize,
    pub freed_tokens: u32,
    pub summary_used: bool,
}

/// True when the estimated prompt exceeds the compaction threshold.
pub fn needs_compaction(messages: &[Message], config: &SessionConfig) -> bool {
    let budget = (config.context_window_tokens as f32 * config.compact_threshold) as u32;
    estimate_messages(messages) > budget
}

/// Compact `messages` in place. Returns what was dropped; a zeroed
/// report means there was nothing safe to drop.
pub async fn compact_messages(
    messages: &mut Vec<Message>,
    vault: Option<&dyn Vault>,
    lens: Option<&dyn Lens>,
    config: &SessionConfig,
) -> CompactionReport {
    let before_tokens = estimate_messages(messages);
    let budget = (config.context_window_tokens as f32 * config.compact_threshold) as u32;

    let mut dropped: Vec<Message> = Vec::new();
    let mut summary_used = false;
    let mut digests: Vec<String> = Vec::new();

    // Pass 1: oldest tool-call groups.
    while estimate_messages(messages) > budget {
        let Some(group) = oldest_tool_group(messages) else {
            break;
        };
        let group_msgs: Vec<Message> = messages.drain(group.clone()).collect();

        if let Some(lens) = lens {
            if let Some(digest) = digest_group(lens, &group_msgs).await {
                digests.push(digest);
                summary_used = true;
            }
        }
        dropped.extend(group_msgs);
    }

    // Pass 2: oldest non-system messages, sparing the active tail.
    while estimate_messages(messages) > budget {
        let Some(index) = messages
            .iter()
            .position(|m| m.role != Role::System)
            .filter(|&i| i + KEEP_RECENT < messages.len())
        else {
            break;
        };
        dropped.push(messages.remove(index));
    }

    if dropped.is_empty() {
        return CompactionReport::default();
    }

    // Archive the originals before they only exist in this report.
    if let Some(vault) = vault {
        if let Err(e) = vault.archive_tool_messages(&dropped).await {
            tracing::warn!(error = %e, "vault archive failed; compacted content is lost");
        }
    }

    // A single marker keeps the model oriented.
    let marker = if digests.is_empty() {
        format!("[{} earlier messages archived to vault]", dropped.len())
    } else {
        format!(
            "[{} earlier messages archived to vault]\n{}",
            dropped.len(),
            digests.join("\n")
        )
    };
    let insert_at = messages
        .iter()
        .position(|m| m.role != Role::System)
        .unwrap_or(messages.len());
    messages.insert(insert_at, Message::system(marker));

    let after_tokens = estimate_messages(messages);
    let report = CompactionReport {
        dropped_messages: dropped.len(),
        freed_tokens: before_tokens.saturating_sub(after_tokens),
        summary_used,
    };
    tracing::info!(
        dropped = report.dropped_messages,
        freed_tokens = report.freed_tokens,
        summary_used,
        "context compacted"
    );
    report
}

/// Index range of the oldest assistant-with-tool-calls message plus its
/// trailing tool results.
fn oldest_tool_group(messages: &[Message]) -> Option<std::ops::Range<usize>> {
    let start = messages
        .iter()
        .position(|m| m.role == Role::Assistant && !m.tool_calls.is_empty())?;
    if start + KEEP_RECENT >= messages.len() {
        return None;
    }
    let mut end = start + 1;
    while end < messages.len() && messages[end].role == Role::Tool {
        end += 1;
    }
    Some(start..end)
}

async fn digest_group(lens: &dyn Lens, group: &[Message]) -> Option<String> {
    let assistant = group.first()?;
    let call = assistant.tool_calls.first()?;
    let result = group
        .iter()
        .find(|m| m.role == Role::Tool)
        .map(|m| m.content.text())
        .unwrap_or_default();
    lens.summarize_tool_output(&call.tool_name, &call.arguments, &result)
        .await
        .ok()
        .flatten()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ih_domain::chat::ToolCall;
    use ih_domain::Result;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingVault {
        archived: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl Vault for CountingVault {
        async fn note(&self, _key: &str, _value: &str) -> Result<String> {
            Ok("id".into())
        }
        async fn archive_tool_messages(&self, messages: &[Message]) -> Result<usize> {
            self.archived.fetch_add(messages.len(), Ordering::SeqCst);
            Ok(messages.len())
        }
        async fn search(&self, _q: &str, _l: usize) -> Result<Vec<ih_domain::trifecta::VaultRow>> {
            Ok(Vec::new())
        }
    }

    struct FixedLens;

    #[async_trait::async_trait]
    impl Lens for FixedLens {
        async fn summarize_diff(&self, _b: &str, _a: &str, _p: &str) -> Result<Option<String>> {
            Ok(None)
        }
        async fn summarize_tool_output(
            &self,
            tool: &str,
            _args: &serde_json::Value,
            _result: &str,
        ) -> Result<Option<String>> {
            Ok(Some(format!("digest of {tool} output")))
        }
    }

    fn tool_group(id: &str, payload_kb: usize) -> Vec<Message> {
        vec![
            Message::assistant_with_tools(
                "",
                vec![ToolCall {
                    call_id: id.into(),
                    tool_name: "read_file".into(),
                    arguments: serde_json::json!({"path": "big.rs"}),
                }],
            ),
            Message::tool_result(id, "x".repeat(payload_kb * 1024)),
        ]
    }

    fn small_config() -> SessionConfig {
        SessionConfig {
            context_window_tokens: 4000,
            compact_threshold: 0.85,
            ..Default::default()
        }
    }

    #[test]
    fn small_history_needs_nothing() {
        let messages = vec![Message::system("sys"), Message::user("hi")];
        assert!(!needs_compaction(&messages, &small_config()));
    }

    #[tokio::test]
    async fn tool_groups_dropped_oldest_first() {
        let mut messages = vec![Message::system("sys"), Message::user("do the thing")];
        messages.extend(tool_group("c1", 8));
        messages.extend(tool_group("c2", 8));
        messages.push(Message::user("latest question"));
        messages.push(Message::assistant("latest answer"));

        assert!(needs_compaction(&messages, &small_config()));
        let report = compact_messages(&mut messages, None, None, &small_config()).await;

        assert!(report.dropped_messages >= 2);
        assert!(report.freed_tokens > 0);
        // The active tail survived.
        assert!(messages.iter().any(|m| m.content.text() == "latest question"));
        // The oldest group went first.
        assert!(!messages.iter().any(|m| m.tool_call_id.as_deref() == Some("c1")));
    }

    #[tokio::test]
    async fn dropped_messages_are_archived() {
        let vault = CountingVault { archived: AtomicUsize::new(0) };
        let mut messages = vec![Message::system("sys")];
        messages.extend(tool_group("c1", 8));
        messages.extend(tool_group("c2", 8));
        messages.push(Message::user("tail"));
        messages.push(Message::assistant("tail answer"));

        let report = compact_messages(&mut messages, Some(&vault), None, &small_config()).await;
        assert_eq!(vault.archived.load(Ordering::SeqCst), report.dropped_messages);
        // Marker message inserted after the system prompt.
        assert!(messages[1].content.text().contains("archived to vault"));
    }

    #[tokio::test]
    async fn lens_digest_lands_in_marker() {
        let mut messages = vec![Message::system("sys")];
        messages.extend(tool_group("c1", 8));
        messages.extend(tool_group("c2", 8));
        messages.push(Message::user("tail"));
        messages.push(Message::assistant("tail answer"));

        let report =
            compact_messages(&mut messages, None, Some(&FixedLens), &small_config()).await;
        assert!(report.summary_used);
        assert!(messages[1].content.text().contains("digest of read_file output"));
    }

    #[tokio::test]
    async fn nothing_safe_to_drop_returns_empty_report() {
        // Oversized but everything is in the protected tail.
        let mut messages = vec![
            Message::system("sys"),
            Message::user("x".repeat(32 * 1024)),
        ];
        let report = compact_messages(&mut messages, None, None, &small_config()).await;
        assert_eq!(report.dropped_messages, 0);
        assert_eq!(messages.len(), 2);
    }
}
