//! Token estimation for budget enforcement.
//!
//! Budgets only need a monotone estimate, not an exact count. The local
//! inference servers IdleHands drives use per-model vocabularies that no
//! fixed tokenizer matches anyway. The heuristic here (chars/4, floored
//! by the whitespace word count) tracks real counts closely enough for
//! trim decisions.

use crate::chat::Message;

/// Estimate the token count of a text.
pub fn estimate_tokens(text: &str) -> u32 {
    let by_chars = text.len() / 4;
    let by_words = text.split_whitespace().count();
    by_chars.max(by_words) as u32
}

/// Estimate the prompt size of a message list, including a small
/// per-message framing overhead.
pub fn estimate_messages(messages: &[Message]) -> u32 {
    messages
        .iter()
        .map(|m| {
            let content = m.content.char_len() as u32 / 4;
            let tools: u32 = m
                .tool_calls
                .iter()
                .map(|tc| (tc.arguments.to_string().len() as u32 / 4) + 8)
                .sum();
            content + tools + 4
        })
        .sum()
}
