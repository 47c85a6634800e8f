//! Parsing of an agent session's terminal reply into a structured
//! verdict.
//!
//! The attempt prompt instructs the agent to use the `DECOMPOSE:` /
//! `BLOCKED:` / `FAILED:` markers; anything else is an implicit pass
//! candidate that goes to verification.

/// Structured outcome of an attempt's final reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentVerdict {
    /// The agent split the task; texts are the proposed subtasks.
    Decompose(Vec<String>),
    Blocked(String),
    Failed(String),
    /// Pass candidate; verification decides.
    Done,
}

pub fn parse_agent_reply(text: &str) -> AgentVerdict {
    for (i, line) in text.lines().enumerate() {
        let trimmed = line.trim();

        if let Some(rest) = strip_marker(trimmed, "DECOMPOSE") {
            let mut subtasks: Vec<String> = Vec::new();
            // Inline form: `DECOMPOSE: a; b; c`
            if !rest.is_empty() {
                subtasks.extend(
                    rest.split(';')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty()),
                );
            }
            // Bullet form on the following lines.
            for following in text.lines().skip(i + 1) {
                let t = following.trim();
                if let Some(item) = t.strip_prefix("- ") {
                    let item = item.trim_start_matches("[ ]").trim();
                    if !item.is_empty() {
                        subtasks.push(item.to_string());
                    }
                } else if !t.is_empty() {
                    break;
                }
            }
            return AgentVerdict::Decompose(subtasks);
        }
        if let Some(reason) = strip_marker(trimmed, "BLOCKED") {
            return AgentVerdict::Blocked(nonempty_or(reason, "no reason given"));
        }
        if let Some(reason) = strip_marker(trimmed, "FAILED") {
            return AgentVerdict::Failed(nonempty_or(reason, "no reason given"));
        }
    }
    AgentVerdict::Done
}

/// Discovery-stage reply: is the task already done?
pub fn parse_discovery_reply(text: &str) -> bool {
    text.lines()
        .map(str::trim)
        .any(|l| l.eq_ignore_ascii_case("ALREADY_DONE") || l.starts_with("ALREADY_DONE:"))
}

fn strip_marker<'a>(line: &'a str, marker: &str) -> Option<&'a str> {
    let rest = line.strip_prefix(marker)?;
    let rest = rest.trim_start();
    Some(rest.strip_prefix(':').unwrap_or(rest).trim())
}

fn nonempty_or(s: &str, fallback: &str) -> String {
    if s.is_empty() {
        fallback.to_string()
    } else {
        s.to_string()
    }
}
