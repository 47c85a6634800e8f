use serde::{Deserialize, Serialize};
use std::path::PathBuf;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Runtime orchestrator settings
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Knobs for host command execution and health probing. The registry of
/// hosts/backends/models lives in `runtimes.json`, not here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeSettings {
    /// Override for the state directory holding `runtimes.json`,
    /// `active_runtime.json`, and the Anton lock. `None` resolves to the
    /// platform state dir.
    #[serde(default)]
    pub state_dir: Option<PathBuf>,

    /// Timeout for a single host shell command.
    #[serde(default = "d_host_timeout")]
    pub host_cmd_timeout_sec: u64,
    /// Timeout for a single health probe attempt.
    #[serde(default = "d_probe_timeout")]
    pub probe_timeout_sec: u64,
    /// Total budget for `wait_for_models_ready`.
    #[serde(default = "d_wait_ready_timeout")]
    pub wait_ready_timeout_sec: u64,
    /// Poll interval inside `wait_for_models_ready`.
    #[serde(default = "d_wait_ready_interval")]
    pub wait_ready_interval_ms: u64,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            state_dir: None,
            host_cmd_timeout_sec: d_host_timeout(),
            probe_timeout_sec: d_probe_timeout(),
            wait_ready_timeout_sec: d_wait_ready_timeout(),
            wait_ready_interval_ms: d_wait_ready_interval(),
        }
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_host_timeout() -> u64 {
    5
}
fn d_probe_timeout() -> u64 {
    8
}
fn d_wait_ready_timeout() -> u64 {
    60
}
fn d_wait_ready_interval() -> u64 {
    1500
}
