use serde::{Deserialize, Serialize};

use super::d_true;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Anton configuration
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Budgets and policies for an autonomous Anton run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AntonConfig {
    /// Model id to preflight and run attempts against.
    #[serde(default)]
    pub model_id: String,

    /// Hard cap on loop iterations (attempts + skips).
    #[serde(default = "d_max_iterations")]
    pub max_iterations: u32,
    /// Retry budget per task.
    #[serde(default = "d_max_retries")]
    pub max_retries_per_task: u32,
    /// Consecutive identical-failure cap before skip-or-fatal.
    #[serde(default = "d_max_identical")]
    pub max_identical_failures: u32,
    /// Wall-clock budget for the whole run.
    #[serde(default = "d_total_timeout")]
    pub total_timeout_sec: u64,
    /// Wall-clock budget per attempt.
    #[serde(default = "d_task_timeout")]
    pub task_timeout_sec: u64,
    /// Token budget for the whole run.
    #[serde(default = "d_max_total_tokens")]
    pub max_total_tokens: u64,
    /// Prompt-size ceiling per attempt (estimate, pre-dispatch).
    #[serde(default = "d_max_prompt_tokens")]
    pub max_prompt_tokens_per_attempt: u32,
    /// Cap on total tasks in the file (guards runaway decomposition).
    #[serde(default = "d_max_total_tasks")]
    pub max_total_tasks: usize,

    /// Skip a failing task and continue instead of aborting the run.
    #[serde(default = "d_true")]
    pub skip_on_fail: bool,
    /// Skip a blocked task and continue instead of stopping.
    #[serde(default)]
    pub skip_on_blocked: bool,
    /// Restore tracked changes (and delete new untracked files) after a
    /// failed attempt.
    #[serde(default = "d_true")]
    pub rollback_on_fail: bool,
    /// Commit after each verified attempt.
    #[serde(default = "d_true")]
    pub auto_commit: bool,
    /// Permit a dirty working tree at startup.
    #[serde(default)]
    pub allow_dirty: bool,
    /// Create an `anton-{timestamp}` branch before the first attempt.
    #[serde(default)]
    pub branch: bool,
    /// Print the plan and exit without touching anything.
    #[serde(default)]
    pub dry_run: bool,

    /// Allow the agent to decompose complex tasks into subtasks.
    #[serde(default = "d_true")]
    pub decompose: bool,
    /// Maximum nesting depth decomposition may reach.
    #[serde(default = "d_decompose_depth")]
    pub max_decompose_depth: u32,

    #[serde(default)]
    pub preflight: PreflightConfig,
    #[serde(default)]
    pub tool_loop_auto_continue: ToolLoopAutoContinue,
    #[serde(default)]
    pub commands: VerifyCommands,

    /// Timeout for each verification command.
    #[serde(default = "d_verify_timeout")]
    pub verify_timeout_sec: u64,
    /// Ask an auxiliary session for a pass/fail on the diff after L1.
    #[serde(default)]
    pub ai_review: bool,
}

impl Default for AntonConfig {
    fn default() -> Self {
        Self {
            model_id: String::new(),
            max_iterations: d_max_iterations(),
            max_retries_per_task: d_max_retries(),
            max_identical_failures: d_max_identical(),
            total_timeout_sec: d_total_timeout(),
            task_timeout_sec: d_task_timeout(),
            max_total_tokens: d_max_total_tokens(),
            max_prompt_tokens_per_attempt: d_max_prompt_tokens(),
            max_total_tasks: d_max_total_tasks(),
            skip_on_fail: true,
            skip_on_blocked: false,
            rollback_on_fail: true,
            auto_commit: true,
            allow_dirty: false,
            branch: false,
            dry_run: false,
            decompose: true,
            max_decompose_depth: d_decompose_depth(),
            preflight: PreflightConfig::default(),
            tool_loop_auto_continue: ToolLoopAutoContinue::default(),
            commands: VerifyCommands::default(),
            verify_timeout_sec: d_verify_timeout(),
            ai_review: false,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Preflight pipeline
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The two-stage preflight run before a task's first attempt:
/// discovery ("is this already done?") then requirements review.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreflightConfig {
    #[serde(default = "d_true")]
    pub enabled: bool,
    /// Retry budget per preflight stage.
    #[serde(default = "d_preflight_retries")]
    pub max_retries: u32,
    /// Timeout per preflight stage.
    #[serde(default = "d_preflight_timeout")]
    pub timeout_sec: u64,
    /// Session iteration cap for preflight stages; raised on
    /// "max iterations exceeded" up to `iteration_cap_ceiling`.
    #[serde(default = "d_preflight_iterations")]
    pub session_iterations: u32,
    #[serde(default = "d_preflight_ceiling")]
    pub iteration_cap_ceiling: u32,
}

impl Default for PreflightConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: d_preflight_retries(),
            timeout_sec: d_preflight_timeout(),
            session_iterations: d_preflight_iterations(),
            iteration_cap_ceiling: d_preflight_ceiling(),
        }
    }
}

/// Auto-continue policy after a tool-loop circuit break inside a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolLoopAutoContinue {
    #[serde(default = "d_true")]
    pub enabled: bool,
    #[serde(default = "d_autocontinue_retries")]
    pub max_retries: u32,
}

impl Default for ToolLoopAutoContinue {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: d_autocontinue_retries(),
        }
    }
}

/// Verification command overrides. `None` means auto-detect from the
/// project files.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct VerifyCommands {
    #[serde(default)]
    pub build: Option<String>,
    #[serde(default)]
    pub test: Option<String>,
    #[serde(default)]
    pub lint: Option<String>,
}

// ── serde default helpers ───────────────────────────────────────────

fn d_max_iterations() -> u32 {
    50
}
fn d_max_retries() -> u32 {
    2
}
fn d_max_identical() -> u32 {
    3
}
fn d_total_timeout() -> u64 {
    7200
}
fn d_task_timeout() -> u64 {
    600
}
fn d_max_total_tokens() -> u64 {
    2_000_000
}
fn d_max_prompt_tokens() -> u32 {
    24_000
}
fn d_max_total_tasks() -> usize {
    200
}
fn d_decompose_depth() -> u32 {
    2
}
fn d_verify_timeout() -> u64 {
    600
}
fn d_preflight_retries() -> u32 {
    2
}
fn d_preflight_timeout() -> u64 {
    180
}
fn d_preflight_iterations() -> u32 {
    12
}
fn d_preflight_ceiling() -> u32 {
    40
}
fn d_autocontinue_retries() -> u32 {
    2
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_budgets_match_contract() {
        let cfg = AntonConfig::default();
        assert_eq!(cfg.total_timeout_sec, 7200);
        assert_eq!(cfg.task_timeout_sec, 600);
        assert_eq!(cfg.max_identical_failures, 3);
        assert!(cfg.skip_on_fail);
        assert!(!cfg.skip_on_blocked);
    }

    #[test]
    fn preflight_defaults() {
        let cfg = PreflightConfig::default();
        assert!(cfg.enabled);
        assert!(cfg.session_iterations < cfg.iteration_cap_ceiling);
    }
}
