//! Tool-loop detection.
//!
//! A sliding window of recent tool calls is checked by three detectors:
//! `generic_repeat` (same tool + same arguments), `known_poll_no_progress`
//! (polling tools returning byte-identical results), and `ping_pong`
//! (strict alternation between two calls). The highest repeat count is
//! measured against the warn/critical/break thresholds.

use std::collections::VecDeque;

use ih_domain::config::LoopDetectConfig;
use sha2::{Digest, Sha256};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Signals
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LoopLevel {
    Warn,
    Critical,
    Break,
}

#[derive(Debug, Clone)]
pub struct LoopSignal {
    pub level: LoopLevel,
    pub tool_name: String,
    pub count: usize,
    pub detector: &'static str,
    pub message: String,
}

/// Tools whose repetition with unchanged output means "polling without
/// progress" rather than legitimate re-reads.
const POLL_TOOLS: &[&str] = &["exec", "read_file", "list_dir", "search_files"];

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Detector
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct CallRecord {
    tool: String,
    args_fp: String,
    result_fp: Option<String>,
}

pub struct LoopDetector {
    config: LoopDetectConfig,
    window: VecDeque<CallRecord>,
}

impl LoopDetector {
    pub fn new(config: LoopDetectConfig) -> Self {
        Self {
            config,
            window: VecDeque::new(),
        }
    }

    /// Record a completed tool call and evaluate the detectors.
    /// `result` is the tool output (used by the no-progress detector).
    pub fn record(
        &mut self,
        tool: &str,
        args: &serde_json::Value,
        result: Option<&str>,
    ) -> Option<LoopSignal> {
        let record = CallRecord {
            tool: tool.to_string(),
            args_fp: fingerprint(&format!("{tool}|{args}")),
            result_fp: result.map(fingerprint_str),
        };
        self.window.push_back(record);
        while self.window.len() > self.config.window {
            self.window.pop_front();
        }

        let mut best: Option<(usize, &'static str)> = None;
        let mut consider = |count: usize, detector: &'static str| {
            if count > best.map(|(c, _)| c).unwrap_or(0) {
                best = Some((count, detector));
            }
        };

        let newest = self.window.back().unwrap();

        if self.config.detectors.generic_repeat {
            let count = self
                .window
                .iter()
                .filter(|r| r.args_fp == newest.args_fp)
                .count();
            consider(count, "generic_repeat");
        }

        if self.config.detectors.known_poll_no_progress
            && POLL_TOOLS.contains(&tool)
            && newest.result_fp.is_some()
        {
            let count = self
                .window
                .iter()
                .filter(|r| r.args_fp == newest.args_fp && r.result_fp == newest.result_fp)
                .count();
            consider(count, "known_poll_no_progress");
        }

        if self.config.detectors.ping_pong {
            consider(self.ping_pong_len(), "ping_pong");
        }

        let (count, detector) = best?;
        let level = if count >= self.config.break_threshold {
            LoopLevel::Break
        } else if count >= self.config.critical_threshold {
            LoopLevel::Critical
        } else if count >= self.config.warn_threshold {
            LoopLevel::Warn
        } else {
            return None;
        };

        Some(LoopSignal {
            level,
            tool_name: tool.to_string(),
            count,
            detector,
            message: format!(
                "{tool} repeated {count} times ({detector}) — change approach instead of retrying the same call"
            ),
        })
    }

    /// Length of the strict A/B alternation ending at the newest call.
    /// Anything shorter than two full rounds does not count.
    fn ping_pong_len(&self) -> usize {
        if self.window.len() < 4 {
            return 0;
        }
        let records: Vec<&CallRecord> = self.window.iter().collect();
        let n = records.len();
        let a = &records[n - 1].args_fp;
        let b = &records[n - 2].args_fp;
        if a == b {
            return 0;
        }
        let mut len = 2;
        for i in (0..n - 2).rev() {
            let expected = if (n - 1 - i) % 2 == 0 { a } else { b };
            if &records[i].args_fp == expected {
                len += 1;
            } else {
                break;
            }
        }
        if len >= 4 {
            len
        } else {
            0
        }
    }

    pub fn reset(&mut self) {
        self.window.clear();
    }
}

fn fingerprint(material: &str) -> String {
    hex::encode(&Sha256::digest(material.as_bytes())[..8])
}

fn fingerprint_str(s: &str) -> String {
    fingerprint(s)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config(warn: usize, critical: usize, brk: usize) -> LoopDetectConfig {
        LoopDetectConfig {
            window: 30,
            warn_threshold: warn,
            critical_threshold: critical,
            break_threshold: brk,
            ..Default::default()
        }
    }

    #[test]
    fn distinct_calls_stay_quiet() {
        let mut det = LoopDetector::new(config(3, 5, 7));
        for i in 0..10 {
            let signal = det.record("read_file", &json!({"path": format!("f{i}.rs")}), None);
            assert!(signal.is_none(), "iteration {i}");
        }
    }

    #[test]
    fn repeats_escalate_warn_critical_break() {
        let mut det = LoopDetector::new(config(3, 5, 7));
        let args = json!({"path": "same.rs"});
        let mut levels = Vec::new();
        for _ in 0..7 {
            levels.push(det.record("read_file", &args, None).map(|s| s.level));
        }
        assert_eq!(levels[1], None);
        assert_eq!(levels[2], Some(LoopLevel::Warn));
        assert_eq!(levels[4], Some(LoopLevel::Critical));
        assert_eq!(levels[6], Some(LoopLevel::Break));
    }

    #[test]
    fn window_forgets_old_calls() {
        let mut det = LoopDetector::new(LoopDetectConfig {
            window: 4,
            warn_threshold: 3,
            critical_threshold: 5,
            break_threshold: 7,
            ..Default::default()
        });
        let args = json!({"path": "same.rs"});
        det.record("read_file", &args, None);
        det.record("read_file", &args, None);
        // Push the repeats out of the window.
        for i in 0..4 {
            det.record("list_dir", &json!({"path": format!("d{i}")}), None);
        }
        assert!(det.record("read_file", &args, None).is_none());
    }

    #[test]
    fn poll_without_progress_detected() {
        let mut det = LoopDetector::new(config(3, 5, 7));
        let args = json!({"command": "git status"});
        for _ in 0..2 {
            det.record("exec", &args, Some("clean"));
        }
        let signal = det.record("exec", &args, Some("clean")).unwrap();
        assert_eq!(signal.detector, "generic_repeat"); // same count, first wins
        assert_eq!(signal.count, 3);
    }

    #[test]
    fn changing_output_is_progress_for_generic_too() {
        let mut det = LoopDetector::new(LoopDetectConfig {
            window: 30,
            warn_threshold: 3,
            critical_threshold: 5,
            break_threshold: 7,
            detectors: ih_domain::config::DetectorToggles {
                generic_repeat: false,
                known_poll_no_progress: true,
                ping_pong: false,
            },
        });
        let args = json!({"command": "tail build.log"});
        assert!(det.record("exec", &args, Some("line 1")).is_none());
        assert!(det.record("exec", &args, Some("line 2")).is_none());
        assert!(det.record("exec", &args, Some("line 3")).is_none());
        // Output stalls: three identical results trip the warn level.
        det.record("exec", &args, Some("stalled"));
        det.record("exec", &args, Some("stalled"));
        let signal = det.record("exec", &args, Some("stalled")).unwrap();
        assert_eq!(signal.detector, "known_poll_no_progress");
        assert_eq!(signal.level, LoopLevel::Warn);
    }

    #[test]
    fn ping_pong_alternation_detected() {
        let mut det = LoopDetector::new(LoopDetectConfig {
            window: 30,
            warn_threshold: 4,
            critical_threshold: 8,
            break_threshold: 12,
            detectors: ih_domain::config::DetectorToggles {
                generic_repeat: false,
                known_poll_no_progress: false,
                ping_pong: true,
            },
        });
        let a = json!({"path": "a.rs"});
        let b = json!({"path": "b.rs"});
        let mut last = None;
        for i in 0..6 {
            let args = if i % 2 == 0 { &a } else { &b };
            last = det.record("read_file", args, None);
        }
        let signal = last.unwrap();
        assert_eq!(signal.detector, "ping_pong");
        assert!(signal.count >= 4);
    }

    #[test]
    fn disabled_detector_is_silent() {
        let mut det = LoopDetector::new(LoopDetectConfig {
            window: 30,
            warn_threshold: 2,
            critical_threshold: 4,
            break_threshold: 6,
            detectors: ih_domain::config::DetectorToggles {
                generic_repeat: false,
                known_poll_no_progress: false,
                ping_pong: false,
            },
        });
        let args = json!({"path": "same.rs"});
        for _ in 0..10 {
            assert!(det.record("read_file", &args, None).is_none());
        }
    }
}
