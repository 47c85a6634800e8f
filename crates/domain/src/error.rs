/// Shared error type used across all IdleHands crates.
///
/// User-facing variants carry a one-sentence remediation hint in the
/// message where the operator can act on it.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP: {0}")]
    Http(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("config: {0}")]
    Config(String),

    #[error("validation: {0}")]
    Validation(String),

    #[error("lock held: {0}")]
    LockHeld(String),

    #[error("runtime: {0}")]
    Runtime(String),

    #[error("session: {0}")]
    Session(String),

    #[error("tool: {0}")]
    Tool(String),

    #[error("{0}")]
    Budget(String),

    #[error("blocked: {0}")]
    Blocked(String),

    #[error("git: {0}")]
    Git(String),

    #[error("verification failed: {0}")]
    Verification(String),

    #[error("cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Failure taxonomy
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Recovery-oriented classification of a failure.
///
/// The orchestrator switches on this (never on error message text) to
/// decide between retry-with-recovery, retry-with-context, skip, and
/// abort.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Bad request or config; never retried.
    Validation,
    /// The inference endpoint is unreachable (connection refused, DNS).
    InfraDown,
    /// The endpoint answered 503: model still loading.
    Loading,
    /// A tool raised or a patch failed to apply; consumes retry budget.
    ToolingError,
    /// Build/test/lint failed on the diff.
    VerificationFailed,
    PromptBudgetExceeded,
    AttemptTokenBudgetExceeded,
    Timeout,
    /// The agent reported it cannot proceed.
    Blocked,
    LockHeld,
    Cancelled,
}

impl Error {
    /// Classify this error for recovery decisions.
    ///
    /// HTTP/transport errors are sniffed for the connection-level causes
    /// that distinguish a dead endpoint from a loading one.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Error::Validation(_) | Error::Config(_) => FailureKind::Validation,
            Error::LockHeld(_) => FailureKind::LockHeld,
            Error::Cancelled => FailureKind::Cancelled,
            Error::Timeout(_) => FailureKind::Timeout,
            Error::Blocked(_) => FailureKind::Blocked,
            Error::Tool(_) => FailureKind::ToolingError,
            Error::Verification(_) => FailureKind::VerificationFailed,
            Error::Budget(msg) => {
                if msg.starts_with("attempt-token-budget-exceeded") {
                    FailureKind::AttemptTokenBudgetExceeded
                } else {
                    FailureKind::PromptBudgetExceeded
                }
            }
            Error::Http(msg) | Error::Runtime(msg) | Error::Session(msg) => {
                classify_transport(msg)
            }
            Error::Io(e) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
                FailureKind::InfraDown
            }
            _ => FailureKind::ToolingError,
        }
    }
}

fn classify_transport(msg: &str) -> FailureKind {
    let lower = msg.to_ascii_lowercase();
    if lower.contains("503") || lower.contains("loading") {
        FailureKind::Loading
    } else if lower.contains("connection refused")
        || lower.contains("connect error")
        || lower.contains("fetch failed")
        || lower.contains("dns")
        || lower.contains("no route to host")
    {
        FailureKind::InfraDown
    } else {
        FailureKind::ToolingError
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_refused_is_infra_down() {
        let e = Error::Http("error sending request: connection refused (os error 111)".into());
        assert_eq!(e.failure_kind(), FailureKind::InfraDown);
    }

    #[test]
    fn fetch_failed_is_infra_down() {
        let e = Error::Session("fetch failed".into());
        assert_eq!(e.failure_kind(), FailureKind::InfraDown);
    }

    #[test]
    fn http_503_is_loading() {
        let e = Error::Http("HTTP 503: model is loading".into());
        assert_eq!(e.failure_kind(), FailureKind::Loading);
    }

    #[test]
    fn budget_variants_split_by_prefix() {
        let prompt = Error::Budget("prompt-budget-exceeded: estimated=50000 max=8000".into());
        assert_eq!(prompt.failure_kind(), FailureKind::PromptBudgetExceeded);

        let attempt = Error::Budget("attempt-token-budget-exceeded: used=9000 max=8000".into());
        assert_eq!(attempt.failure_kind(), FailureKind::AttemptTokenBudgetExceeded);
    }

    #[test]
    fn validation_never_classified_as_infra() {
        let e = Error::Validation("unknown model id 'llama-99b'".into());
        assert_eq!(e.failure_kind(), FailureKind::Validation);
    }

    #[test]
    fn unknown_http_error_is_tooling() {
        let e = Error::Http("HTTP 418: short and stout".into());
        assert_eq!(e.failure_kind(), FailureKind::ToolingError);
    }
}
