//! The LLM seam.
//!
//! The session only needs a streaming chat call; everything else about
//! the model server (lifecycle, readiness) belongs to the runtime
//! orchestrator.

use ih_domain::chat::{Message, ToolDefinition};
use ih_domain::stream::{BoxStream, StreamEvent};
use ih_domain::Result;

/// A chat completion request.
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    /// Model identifier; local servers usually accept anything but echo
    /// it back in `/v1/models`.
    pub model: String,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

/// A streaming chat-completions client.
#[async_trait::async_trait]
pub trait ChatClient: Send + Sync {
    /// Open a streaming completion. Events end with
    /// [`StreamEvent::Done`]; transport failures surface as `Err`
    /// items in the stream or as an immediate error.
    async fn chat_stream(&self, req: &ChatRequest) -> Result<BoxStream<'static, Result<StreamEvent>>>;
}
