//! The agent session: one conversation with an LLM, streamed, with
//! synchronous tool execution, token budgets, tool-loop detection, and
//! between-turn context compaction.
//!
//! The LLM itself is behind the [`client::ChatClient`] trait; the
//! bundled implementation speaks the OpenAI-compatible SSE wire format
//! the runtime orchestrator's servers expose.

pub mod client;
pub mod compact;
pub mod loop_detect;
pub mod openai;
pub mod path_safety;
pub mod session;
mod sse;
pub mod toolspec;

pub use client::{ChatClient, ChatRequest};
pub use loop_detect::{LoopDetector, LoopLevel, LoopSignal};
pub use openai::OpenAiCompatClient;
pub use path_safety::{classify_path, PathTier};
pub use session::{AgentSession, AskOutcome, SessionHooks};
pub use toolspec::{tool_definitions, ToolExecutor, TOOL_NAMES};
