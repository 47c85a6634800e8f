use serde::{Deserialize, Serialize};

use super::d_true;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Agent session configuration
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Turn cap per `ask` call.
    #[serde(default = "d_session_iterations")]
    pub max_iterations: u32,
    /// Context window of the serving model, in tokens.
    #[serde(default = "d_context_window")]
    pub context_window_tokens: u32,
    /// Fraction of the context window at which compaction kicks in.
    #[serde(default = "d_compact_threshold")]
    pub compact_threshold: f32,
    /// Sampling temperature for attempts.
    #[serde(default = "d_temperature")]
    pub temperature: f32,

    #[serde(default)]
    pub loop_detect: LoopDetectConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_iterations: d_session_iterations(),
            context_window_tokens: d_context_window(),
            compact_threshold: d_compact_threshold(),
            temperature: d_temperature(),
            loop_detect: LoopDetectConfig::default(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tool-loop detection
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Thresholds over a sliding window of `(tool, args-fingerprint)`
/// repeats. Warn notifies, critical injects a corrective message,
/// break terminates the turn with a retryable error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopDetectConfig {
    #[serde(default = "d_window")]
    pub window: usize,
    #[serde(default = "d_warn")]
    pub warn_threshold: usize,
    #[serde(default = "d_critical")]
    pub critical_threshold: usize,
    #[serde(default = "d_break")]
    pub break_threshold: usize,
    #[serde(default)]
    pub detectors: DetectorToggles,
}

impl Default for LoopDetectConfig {
    fn default() -> Self {
        Self {
            window: d_window(),
            warn_threshold: d_warn(),
            critical_threshold: d_critical(),
            break_threshold: d_break(),
            detectors: DetectorToggles::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorToggles {
    #[serde(default = "d_true")]
    pub generic_repeat: bool,
    #[serde(default = "d_true")]
    pub known_poll_no_progress: bool,
    #[serde(default = "d_true")]
    pub ping_pong: bool,
}

impl Default for DetectorToggles {
    fn default() -> Self {
        Self {
            generic_repeat: true,
            known_poll_no_progress: true,
            ping_pong: true,
        }
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_session_iterations() -> u32 {
    24
}
fn d_context_window() -> u32 {
    32_768
}
fn d_compact_threshold() -> f32 {
    0.85
}
fn d_temperature() -> f32 {
    0.2
}
fn d_window() -> usize {
    30
}
fn d_warn() -> usize {
    6
}
fn d_critical() -> usize {
    10
}
fn d_break() -> usize {
    14
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_compact_threshold_is_085() {
        let cfg = SessionConfig::default();
        assert!((cfg.compact_threshold - 0.85).abs() < f32::EPSILON);
    }

    #[test]
    fn default_window_is_thirty() {
        assert_eq!(LoopDetectConfig::default().window, 30);
    }

    #[test]
    fn all_detectors_on_by_default() {
        let t = DetectorToggles::default();
        assert!(t.generic_repeat && t.known_poll_no_progress && t.ping_pong);
    }
}
