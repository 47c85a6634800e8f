mod anton;
mod runtime;
mod session;

pub use anton::*;
pub use runtime::*;
pub use session::*;

use serde::{Deserialize, Serialize};
use std::fmt;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The operator-facing configuration tree (`idlehands.toml`).
///
/// The runtime *registry* (hosts/backends/models) is a separate JSON
/// file owned by the runtime store; this tree only carries knobs.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub runtime: RuntimeSettings,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub anton: AntonConfig,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Config validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Severity level for a configuration issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Error,
    Warning,
}

/// A single configuration validation issue.
#[derive(Debug, Clone)]
pub struct ConfigIssue {
    pub severity: ConfigSeverity,
    pub field: String,
    pub message: String,
}

impl fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.severity {
            ConfigSeverity::Error => "ERROR",
            ConfigSeverity::Warning => "WARN",
        };
        write!(f, "[{tag}] {}: {}", self.field, self.message)
    }
}

impl Config {
    /// Validate knob ranges. Errors make the config unusable; warnings
    /// are logged and tolerated.
    pub fn validate(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();

        let mut err = |field: &str, message: String| {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                field: field.into(),
                message,
            });
        };

        if self.anton.max_iterations == 0 {
            err("anton.max_iterations", "must be at least 1".into());
        }
        if self.anton.max_total_tasks == 0 {
            err("anton.max_total_tasks", "must be at least 1".into());
        }
        if self.anton.max_prompt_tokens_per_attempt == 0 {
            err(
                "anton.max_prompt_tokens_per_attempt",
                "must be at least 1".into(),
            );
        }
        if self.session.max_iterations == 0 {
            err("session.max_iterations", "must be at least 1".into());
        }
        if !(0.1..=1.0).contains(&self.session.compact_threshold) {
            err(
                "session.compact_threshold",
                format!(
                    "must be within 0.1..=1.0, got {}",
                    self.session.compact_threshold
                ),
            );
        }
        if self.session.loop_detect.warn_threshold >= self.session.loop_detect.break_threshold {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Warning,
                field: "session.loop_detect".into(),
                message: "warn_threshold should be below break_threshold".into(),
            });
        }

        issues
    }

    /// True if validation produced no `Error`-severity issues.
    pub fn is_valid(&self) -> bool {
        !self
            .validate()
            .iter()
            .any(|i| i.severity == ConfigSeverity::Error)
    }
}

// ── serde default helpers shared by submodules ─────────────────────

pub(crate) fn d_true() -> bool {
    true
}
