//! OpenAI-compatible streaming chat client.
//!
//! This is the one wire format the runtime orchestrator's servers
//! (llama.cpp, vLLM, and friends) expose: `POST /v1/chat/completions`
//! with `stream: true`, SSE deltas, `data: [DONE]` terminator.

use std::collections::HashMap;
use std::time::Duration;

use ih_domain::chat::{Message, MessageContent, Role};
use ih_domain::stream::{BoxStream, StreamEvent, Usage};
use ih_domain::{Error, Result};
use serde_json::{json, Value};

use crate::client::{ChatClient, ChatRequest};
use crate::sse::sse_response_stream;

pub struct OpenAiCompatClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl OpenAiCompatClient {
    /// `base_url` is the endpoint base ending in `/v1` (the active
    /// runtime record's `endpoint` field).
    pub fn new(base_url: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            // No overall timeout: completions stream for minutes.
            .build()
            .unwrap_or_default();
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: None,
        }
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    fn build_payload(&self, req: &ChatRequest) -> Value {
        let messages: Vec<Value> = req.messages.iter().map(wire_message).collect();
        let mut payload = json!({
            "model": req.model,
            "messages": messages,
            "stream": true,
            "stream_options": { "include_usage": true },
        });
        if !req.tools.is_empty() {
            payload["tools"] = Value::Array(
                req.tools
                    .iter()
                    .map(|t| {
                        json!({
                            "type": "function",
                            "function": {
                                "name": t.name,
                                "description": t.description,
                                "parameters": t.parameters,
                            }
                        })
                    })
                    .collect(),
            );
        }
        if let Some(t) = req.temperature {
            payload["temperature"] = json!(t);
        }
        if let Some(m) = req.max_tokens {
            payload["max_tokens"] = json!(m);
        }
        payload
    }
}

#[async_trait::async_trait]
impl ChatClient for OpenAiCompatClient {
    async fn chat_stream(&self, req: &ChatRequest) -> Result<BoxStream<'static, Result<StreamEvent>>> {
        let url = format!("{}/chat/completions", self.base_url);
        let mut request = self.http.post(&url).json(&self.build_payload(req));
        if let Some(ref key) = self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let preview: String = body.chars().take(300).collect();
            return Err(Error::Http(format!("HTTP {}: {preview}", status.as_u16())));
        }

        let mut state = StreamState::default();
        Ok(sse_response_stream(response, move |data| state.handle(data)))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Wire encoding
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn wire_message(msg: &Message) -> Value {
    let role = match msg.role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    };
    let mut out = json!({ "role": role });

    match &msg.content {
        MessageContent::Text(t) => {
            out["content"] = json!(t);
        }
        MessageContent::Parts(parts) => {
            out["content"] = serde_json::to_value(parts).unwrap_or(Value::Null);
        }
    }

    if !msg.tool_calls.is_empty() {
        out["tool_calls"] = Value::Array(
            msg.tool_calls
                .iter()
                .map(|tc| {
                    json!({
                        "id": tc.call_id,
                        "type": "function",
                        "function": {
                            "name": tc.tool_name,
                            "arguments": tc.arguments.to_string(),
                        }
                    })
                })
                .collect(),
        );
    }
    if let Some(ref id) = msg.tool_call_id {
        out["tool_call_id"] = json!(id);
    }
    out
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Delta parsing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Tool-call assembly state across SSE payloads. Deltas arrive keyed by
/// a numeric index; the id and name show up on the first fragment only.
#[derive(Default)]
struct StreamState {
    calls: HashMap<u64, PendingCall>,
    usage: Option<Usage>,
    finished: bool,
}

struct PendingCall {
    call_id: String,
    tool_name: String,
    args: String,
}

impl StreamState {
    fn handle(&mut self, data: &str) -> Vec<Result<StreamEvent>> {
        if data == "[DONE]" {
            if self.finished {
                return Vec::new();
            }
            self.finished = true;
            let mut events = self.flush_calls();
            events.push(Ok(StreamEvent::Done {
                usage: self.usage,
                finish_reason: None,
            }));
            return events;
        }

        let value: Value = match serde_json::from_str(data) {
            Ok(v) => v,
            Err(e) => {
                tracing::debug!(error = %e, "unparseable SSE payload skipped");
                return Vec::new();
            }
        };

        let mut events = Vec::new();

        if let Some(u) = value.get("usage").filter(|u| !u.is_null()) {
            let usage = Usage {
                prompt_tokens: u["prompt_tokens"].as_u64().unwrap_or(0) as u32,
                completion_tokens: u["completion_tokens"].as_u64().unwrap_or(0) as u32,
                total_tokens: u["total_tokens"].as_u64().unwrap_or(0) as u32,
            };
            self.usage = Some(usage);
            events.push(Ok(StreamEvent::UsageUpdate { usage }));
        }

        let Some(choice) = value["choices"].get(0) else {
            return events;
        };
        let delta = &choice["delta"];

        if let Some(text) = delta["content"].as_str() {
            if !text.is_empty() {
                events.push(Ok(StreamEvent::Token { text: text.to_string() }));
            }
        }

        if let Some(tool_calls) = delta["tool_calls"].as_array() {
            for tc in tool_calls {
                let index = tc["index"].as_u64().unwrap_or(0);
                let entry = self.calls.entry(index);
                match entry {
                    std::collections::hash_map::Entry::Vacant(v) => {
                        let call_id = tc["id"]
                            .as_str()
                            .map(String::from)
                            .unwrap_or_else(|| format!("call_{index}"));
                        let tool_name = tc["function"]["name"]
                            .as_str()
                            .unwrap_or_default()
                            .to_string();
                        events.push(Ok(StreamEvent::ToolCallStarted {
                            call_id: call_id.clone(),
                            tool_name: tool_name.clone(),
                        }));
                        let args = tc["function"]["arguments"]
                            .as_str()
                            .unwrap_or_default()
                            .to_string();
                        if !args.is_empty() {
                            events.push(Ok(StreamEvent::ToolCallDelta {
                                call_id: call_id.clone(),
                                delta: args.clone(),
                            }));
                        }
                        v.insert(PendingCall {
                            call_id,
                            tool_name,
                            args,
                        });
                    }
                    std::collections::hash_map::Entry::Occupied(mut o) => {
                        if let Some(fragment) = tc["function"]["arguments"].as_str() {
                            if !fragment.is_empty() {
                                o.get_mut().args.push_str(fragment);
                                events.push(Ok(StreamEvent::ToolCallDelta {
                                    call_id: o.get().call_id.clone(),
                                    delta: fragment.to_string(),
                                }));
                            }
                        }
                        // A late name fragment (some servers split it).
                        if let Some(name) = tc["function"]["name"].as_str() {
                            if o.get().tool_name.is_empty() {
                                o.get_mut().tool_name = name.to_string();
                            }
                        }
                    }
                }
            }
        }

        if let Some(reason) = choice["finish_reason"].as_str() {
            if reason == "tool_calls" {
                events.extend(self.flush_calls());
            }
        }

        events
    }

    /// Emit `ToolCallFinished` for everything assembled so far.
    fn flush_calls(&mut self) -> Vec<Result<StreamEvent>> {
        let mut indices: Vec<u64> = self.calls.keys().copied().collect();
        indices.sort_unstable();
        indices
            .into_iter()
            .filter_map(|i| self.calls.remove(&i))
            .map(|call| {
                let arguments = if call.args.trim().is_empty() {
                    Value::Object(Default::default())
                } else {
                    serde_json::from_str(&call.args).unwrap_or_else(|e| {
                        tracing::warn!(
                            tool = %call.tool_name,
                            error = %e,
                            "tool call arguments are not valid JSON; defaulting to empty object"
                        );
                        Value::Object(Default::default())
                    })
                };
                Ok(StreamEvent::ToolCallFinished {
                    call_id: call.call_id,
                    tool_name: call.tool_name,
                    arguments,
                })
            })
            .collect()
    }
}
