//! One conversation with the LLM.
//!
//! `ask` drives the turn loop: send messages + tool schema, stream the
//! reply, execute any tool calls synchronously in declaration order,
//! append their results, repeat. Budgets are enforced before dispatch
//! (prompt estimate) and after every turn (cumulative usage); the loop
//! detector watches every completed tool call; compaction runs between
//! turns, never mid-stream.

use std::sync::Arc;

use futures_util::StreamExt;
use ih_domain::chat::{Message, ToolCall};
use ih_domain::config::SessionConfig;
use ih_domain::stream::{StreamEvent, Usage};
use ih_domain::tokens::{estimate_messages, estimate_tokens};
use ih_domain::trifecta::{Lens, Vault};
use ih_domain::{CancelToken, Error, Result};

use crate::client::{ChatClient, ChatRequest};
use crate::compact::{compact_messages, needs_compaction, CompactionReport};
use crate::loop_detect::{LoopDetector, LoopLevel, LoopSignal};
use crate::toolspec::{tool_definitions, ToolExecutor};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Public surface
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Where the session currently is in its per-ask state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Sending,
    Streaming,
    ExecutingTool,
    Complete,
    Cancelled,
    Failed,
}

/// Optional per-ask callbacks.
#[derive(Default)]
pub struct SessionHooks {
    pub on_delta: Option<Box<dyn Fn(&str) + Send + Sync>>,
    pub on_tool_call: Option<Box<dyn Fn(&ToolCall) + Send + Sync>>,
    pub on_tool_result: Option<Box<dyn Fn(&ToolCall, &str, bool) + Send + Sync>>,
    pub on_tool_loop: Option<Box<dyn Fn(&LoopSignal) + Send + Sync>>,
    pub on_compaction: Option<Box<dyn Fn(&CompactionReport) + Send + Sync>>,
}

#[derive(Debug, Clone)]
pub struct AskOutcome {
    pub text: String,
    /// Total tool calls executed; zero iff the reply was direct text.
    pub tool_calls: u32,
    pub turns: u32,
    pub usage: Usage,
}

pub struct AgentSession {
    client: Arc<dyn ChatClient>,
    tools: Option<Arc<dyn ToolExecutor>>,
    vault: Option<Arc<dyn Vault>>,
    lens: Option<Arc<dyn Lens>>,
    config: SessionConfig,
    model: String,
    slim_tools: bool,
    /// Per-attempt token ceiling (prompt estimate and cumulative usage).
    max_prompt_tokens: Option<u32>,
    messages: Vec<Message>,
    phase: Phase,
    detector: LoopDetector,
    cancel: CancelToken,
    /// Corrective nudges injected at the critical loop level, capped so
    /// a stuck model cannot fill the context with them.
    nudges_injected: u32,
}

impl AgentSession {
    pub fn new(
        client: Arc<dyn ChatClient>,
        model: impl Into<String>,
        system_prompt: impl Into<String>,
        config: SessionConfig,
    ) -> Self {
        let detector = LoopDetector::new(config.loop_detect.clone());
        Self {
            client,
            tools: None,
            vault: None,
            lens: None,
            config,
            model: model.into(),
            slim_tools: false,
            max_prompt_tokens: None,
            messages: vec![Message::system(system_prompt)],
            phase: Phase::Idle,
            detector,
            cancel: CancelToken::new(),
            nudges_injected: 0,
        }
    }

    pub fn with_tools(mut self, tools: Arc<dyn ToolExecutor>) -> Self {
        self.tools = Some(tools);
        self
    }

    pub fn with_vault(mut self, vault: Arc<dyn Vault>) -> Self {
        self.vault = Some(vault);
        self
    }

    pub fn with_lens(mut self, lens: Arc<dyn Lens>) -> Self {
        self.lens = Some(lens);
        self
    }

    /// Drop every mutating tool and `spawn_task` from the schema.
    pub fn with_slim_tools(mut self) -> Self {
        self.slim_tools = true;
        self
    }

    pub fn with_prompt_budget(mut self, max_tokens: u32) -> Self {
        self.max_prompt_tokens = Some(max_tokens);
        self
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Handle for external cancellation. Refetch after a cancelled ask:
    /// the next `ask` starts with a fresh token.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Replace conversation state atomically. Valid only between asks.
    pub fn restore(&mut self, messages: Vec<Message>) {
        self.messages = messages;
        self.detector.reset();
        self.phase = Phase::Idle;
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Switch models. Valid only between turns (enforced by `&mut`).
    pub fn set_model(&mut self, model: impl Into<String>) {
        self.model = model.into();
    }

    /// Raise the turn cap (used by preflight stages that hit it).
    pub fn set_max_iterations(&mut self, max: u32) {
        self.config.max_iterations = max;
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // ask
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    pub async fn ask(&mut self, prompt: &str, hooks: &SessionHooks) -> Result<AskOutcome> {
        // A cancelled previous ask must not poison this one.
        if self.cancel.is_cancelled() {
            self.cancel = CancelToken::new();
        }
        self.phase = Phase::Sending;

        // Budget gate before any dispatch.
        if let Some(max) = self.max_prompt_tokens {
            let estimated = estimate_messages(&self.messages) + estimate_tokens(prompt);
            if estimated > max {
                self.phase = Phase::Failed;
                return Err(Error::Budget(format!(
                    "prompt-budget-exceeded: estimated={estimated} max={max}"
                )));
            }
        }

        self.messages.push(Message::user(prompt));

        let tool_defs = if self.tools.is_some() {
            tool_definitions(self.slim_tools)
        } else {
            Vec::new()
        };

        let mut total_usage = Usage::default();
        let mut total_tool_calls = 0u32;

        for turn in 1..=self.config.max_iterations {
            // Compaction between turns, never mid-stream.
            if needs_compaction(&self.messages, &self.config) {
                let report = compact_messages(
                    &mut self.messages,
                    self.vault.as_deref(),
                    self.lens.as_deref(),
                    &self.config,
                )
                .await;
                if report.dropped_messages > 0 {
                    if let Some(ref hook) = hooks.on_compaction {
                        hook(&report);
                    }
                }
            }

            if self.cancel.is_cancelled() {
                self.phase = Phase::Cancelled;
                return Err(Error::Cancelled);
            }

            let req = ChatRequest {
                model: self.model.clone(),
                messages: self.messages.clone(),
                tools: tool_defs.clone(),
                temperature: Some(self.config.temperature),
                max_tokens: None,
            };

            self.phase = Phase::Sending;
            let mut stream = match self.client.chat_stream(&req).await {
                Ok(s) => s,
                Err(e) => {
                    self.phase = Phase::Failed;
                    return Err(e);
                }
            };
            self.phase = Phase::Streaming;

            let mut text_buf = String::new();
            let mut pending: Vec<ToolCall> = Vec::new();
            let mut turn_usage: Option<Usage> = None;

            while let Some(event) = stream.next().await {
                if self.cancel.is_cancelled() {
                    drop(stream);
                    self.phase = Phase::Cancelled;
                    return Err(Error::Cancelled);
                }
                let event = match event {
                    Ok(e) => e,
                    Err(e) => {
                        self.phase = Phase::Failed;
                        return Err(e);
                    }
                };
                match event {
                    StreamEvent::Token { text } => {
                        if let Some(ref hook) = hooks.on_delta {
                            hook(&text);
                        }
                        text_buf.push_str(&text);
                    }
                    StreamEvent::ToolCallFinished {
                        call_id,
                        tool_name,
                        arguments,
                    } => {
                        pending.push(ToolCall {
                            call_id,
                            tool_name,
                            arguments,
                        });
                    }
                    StreamEvent::UsageUpdate { usage } => {
                        turn_usage = Some(usage);
                    }
                    StreamEvent::Done { usage, .. } => {
                        if usage.is_some() {
                            turn_usage = usage;
                        }
                        break;
                    }
                    StreamEvent::Error { message } => {
                        self.phase = Phase::Failed;
                        return Err(Error::Session(message));
                    }
                    // Start/delta events only matter for live display.
                    StreamEvent::ToolCallStarted { .. } | StreamEvent::ToolCallDelta { .. } => {}
                }
            }

            // Servers without usage reporting still consume budget.
            let turn_usage = turn_usage.unwrap_or_else(|| {
                let prompt_est = estimate_messages(&self.messages);
                let completion_est = estimate_tokens(&text_buf);
                Usage {
                    prompt_tokens: prompt_est,
                    completion_tokens: completion_est,
                    total_tokens: prompt_est + completion_est,
                }
            });
            total_usage.add(&turn_usage);

            if let Some(max) = self.max_prompt_tokens {
                if total_usage.total_tokens > max {
                    self.phase = Phase::Failed;
                    return Err(Error::Budget(format!(
                        "attempt-token-budget-exceeded: used={} max={max}",
                        total_usage.total_tokens
                    )));
                }
            }

            if pending.is_empty() {
                self.messages.push(Message::assistant(text_buf.clone()));
                self.phase = Phase::Complete;
                return Ok(AskOutcome {
                    text: text_buf,
                    tool_calls: total_tool_calls,
                    turns: turn,
                    usage: total_usage,
                });
            }

            // ── Tool dispatch, strictly in declaration order ────────
            self.messages
                .push(Message::assistant_with_tools(text_buf.clone(), pending.clone()));

            for call in &pending {
                if self.cancel.is_cancelled() {
                    self.phase = Phase::Cancelled;
                    return Err(Error::Cancelled);
                }
                if let Some(ref hook) = hooks.on_tool_call {
                    hook(call);
                }

                self.phase = Phase::ExecutingTool;
                let (content, is_error) = match self.tools {
                    Some(ref tools) => tools.execute(call).await,
                    None => (
                        format!("tool '{}' is unavailable in this session", call.tool_name),
                        true,
                    ),
                };
                total_tool_calls += 1;

                if let Some(ref hook) = hooks.on_tool_result {
                    hook(call, &content, is_error);
                }
                self.messages
                    .push(Message::tool_result(&call.call_id, &content));

                if let Some(signal) =
                    self.detector
                        .record(&call.tool_name, &call.arguments, Some(&content))
                {
                    if let Some(ref hook) = hooks.on_tool_loop {
                        hook(&signal);
                    }
                    match signal.level {
                        LoopLevel::Warn => {
                            tracing::debug!(tool = %signal.tool_name, count = signal.count, "tool loop warning");
                        }
                        LoopLevel::Critical => {
                            if self.nudges_injected < 3 {
                                self.nudges_injected += 1;
                                self.messages.push(Message::user(format!(
                                    "You have called {} with the same arguments {} times. \
                                     Stop repeating it; summarize what you know and take a different action.",
                                    signal.tool_name, signal.count
                                )));
                            }
                        }
                        LoopLevel::Break => {
                            self.phase = Phase::Failed;
                            return Err(Error::Session(format!(
                                "tool-loop circuit breaker: {}",
                                signal.message
                            )));
                        }
                    }
                }

                self.phase = Phase::Streaming;
            }
        }

        self.phase = Phase::Failed;
        Err(Error::Session(format!(
            "max iterations exceeded ({}) — the task may need decomposition",
            self.config.max_iterations
        )))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
