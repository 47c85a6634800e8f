//! Structured run records: per-task attempts and the terminal result.

use serde::{Deserialize, Serialize};

use crate::verify::Verification;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Attempts
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Passed,
    Failed,
    Error,
    Timeout,
    Blocked,
    Decomposed,
    Skipped,
}

impl AttemptStatus {
    /// Statuses that count against a task's final outcome.
    pub fn is_failure(self) -> bool {
        matches!(
            self,
            AttemptStatus::Failed | AttemptStatus::Error | AttemptStatus::Timeout | AttemptStatus::Blocked
        )
    }
}

/// One run of one task by one agent session. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attempt {
    pub task_key: String,
    pub task_text: String,
    pub attempt: u32,
    pub duration_ms: u64,
    pub tokens_used: u64,
    pub status: AttemptStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verification: Option<Verification>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit_hash: Option<String>,
}

/// One preflight stage outcome (discovery, requirements review, or a
/// runtime recovery).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreflightRecord {
    pub task_key: Option<String>,
    pub stage: String,
    pub ok: bool,
    pub detail: String,
    pub duration_ms: u64,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Terminal result
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Stable enum at the process boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    AllDone,
    Abort,
    MaxIterations,
    TotalTimeout,
    TokenBudget,
    MaxTasksExceeded,
    FatalError,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub total_tasks: usize,
    /// Tasks already checked when the run started.
    pub pre_completed: usize,
    /// Tasks completed by attempts during this run.
    pub completed: usize,
    /// Tasks checked by discovery ("already done") or ancestor cascade.
    pub auto_completed: usize,
    pub skipped: usize,
    /// Tasks whose *final* outcome is a failure (a later pass erases an
    /// earlier failure).
    pub failed: usize,
    pub remaining: usize,
    pub attempts: Vec<Attempt>,
    pub preflight_records: Vec<PreflightRecord>,
    pub total_duration_ms: u64,
    pub total_tokens: u64,
    pub total_commits: usize,
    pub completed_all: bool,
    pub stop_reason: StopReason,
}

impl RunResult {
    /// Count failed tasks by final per-task outcome.
    pub fn count_final_failures(attempts: &[Attempt]) -> usize {
        let mut last: std::collections::HashMap<&str, AttemptStatus> = Default::default();
        for a in attempts {
            last.insert(a.task_key.as_str(), a.status);
        }
        last.values().filter(|s| s.is_failure()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attempt(key: &str, n: u32, status: AttemptStatus) -> Attempt {
        Attempt {
            task_key: key.into(),
            task_text: key.into(),
            attempt: n,
            duration_ms: 10,
            tokens_used: 100,
            status,
            verification: None,
            error: None,
            commit_hash: None,
        }
    }

    #[test]
    fn later_pass_erases_earlier_failure() {
        let attempts = vec![
            attempt("t1", 1, AttemptStatus::Failed),
            attempt("t1", 2, AttemptStatus::Passed),
            attempt("t2", 1, AttemptStatus::Timeout),
        ];
        assert_eq!(RunResult::count_final_failures(&attempts), 1);
    }

    #[test]
    fn decomposed_and_skipped_are_not_failures() {
        let attempts = vec![
            attempt("t1", 1, AttemptStatus::Decomposed),
            attempt("t2", 1, AttemptStatus::Skipped),
        ];
        assert_eq!(RunResult::count_final_failures(&attempts), 0);
    }

    #[test]
    fn stop_reason_wire_names() {
        assert_eq!(serde_json::to_string(&StopReason::AllDone).unwrap(), "\"all_done\"");
        assert_eq!(
            serde_json::to_string(&StopReason::MaxTasksExceeded).unwrap(),
            "\"max_tasks_exceeded\""
        );
        assert_eq!(serde_json::to_string(&StopReason::TokenBudget).unwrap(), "\"token_budget\"");
    }

    #[test]
    fn attempt_status_wire_names() {
        assert_eq!(serde_json::to_string(&AttemptStatus::Passed).unwrap(), "\"passed\"");
        assert_eq!(serde_json::to_string(&AttemptStatus::Decomposed).unwrap(), "\"decomposed\"");
    }
}
