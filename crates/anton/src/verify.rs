//! Verification of a task attempt's diff.
//!
//! L1 runs the configured build/test/lint commands. Lint failures are
//! judged against the baseline captured at run start; only *new*
//! errors fail the attempt, so a repo with pre-existing lint debt is
//! still workable. L2 optionally asks an auxiliary agent session for a
//! pass/fail on the diff.

use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;

use ih_domain::config::VerifyCommands;
use ih_session::{AgentSession, SessionHooks};
use regex::Regex;
use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Result type
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Verification {
    pub passed: bool,
    pub summary: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub l1_build: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub l1_test: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub l1_lint: Option<bool>,
    #[serde(default)]
    pub new_lint_errors: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub l2_ai: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub l2_reason: Option<String>,
    /// Filtered output of the failing command, for retry context.
    #[serde(default)]
    pub command_output: String,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Command detection
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Detect build/test/lint commands from project files. Explicit config
/// overrides win field by field.
pub fn detect_commands(project_dir: &Path, overrides: &VerifyCommands) -> VerifyCommands {
    let detected = if project_dir.join("Cargo.toml").exists() {
        VerifyCommands {
            build: Some("cargo build --quiet".into()),
            test: Some("cargo test --quiet".into()),
            lint: Some("cargo clippy --quiet --message-format short".into()),
        }
    } else if project_dir.join("package.json").exists() {
        VerifyCommands {
            build: Some("npm run build --if-present".into()),
            test: Some("npm test --if-present".into()),
            lint: Some("npm run lint --if-present".into()),
        }
    } else if project_dir.join("Makefile").exists() {
        VerifyCommands {
            build: Some("make build".into()),
            test: Some("make test".into()),
            lint: None,
        }
    } else {
        VerifyCommands::default()
    };

    VerifyCommands {
        build: overrides.build.clone().or(detected.build),
        test: overrides.test.clone().or(detected.test),
        lint: overrides.lint.clone().or(detected.lint),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Lint output analysis
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn lint_patterns() -> &'static [Regex; 3] {
    static RES: OnceLock<[Regex; 3]> = OnceLock::new();
    RES.get_or_init(|| {
        [
            // generic: `path:12:3: error something` or `12:3  error  ...`
            Regex::new(r"(?m)^\s*(\S+:)?\d+:\d+:?\s+error\b").unwrap(),
            // TypeScript: `error TS2304: Cannot find name`
            Regex::new(r"(?m)\berror TS\d+:").unwrap(),
            // Rust: `error[E0308]:` (and bare `error:` from rustc)
            Regex::new(r"(?m)^error(\[E\d+\])?:").unwrap(),
        ]
    })
}

/// Count lint errors across the recognized formats.
pub fn count_lint_errors(output: &str) -> usize {
    lint_patterns().iter().map(|re| re.find_iter(output).count()).sum()
}

/// Keep only error lines plus the file-path header lines preceding
/// them, so a retrying agent can locate each error.
pub fn filter_lint_errors(output: &str) -> String {
    static PATH_RE: OnceLock<Regex> = OnceLock::new();
    let path_re = PATH_RE.get_or_init(|| {
        Regex::new(r"^\s*(-->\s+)?[\w./-]+\.(rs|ts|tsx|js|jsx|py|go|c|cpp|h)\b").unwrap()
    });

    let lines: Vec<&str> = output.lines().collect();
    let mut keep = vec![false; lines.len()];
    let mut last_path: Option<usize> = None;

    for (i, line) in lines.iter().enumerate() {
        if path_re.is_match(line) {
            last_path = Some(i);
        }
        let is_error = lint_patterns().iter().any(|re| re.is_match(line));
        if is_error {
            keep[i] = true;
            if let Some(p) = last_path {
                keep[p] = true;
            }
            // Rust puts the location on the `-->` line after the error.
            if let Some(next) = lines.get(i + 1) {
                if next.trim_start().starts_with("-->") {
                    keep[i + 1] = true;
                }
            }
        }
    }

    lines
        .iter()
        .zip(&keep)
        .filter(|(_, &k)| k)
        .map(|(l, _)| *l)
        .collect::<Vec<_>>()
        .join("\n")
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Verification pipeline
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct VerifyRequest<'a> {
    pub commands: &'a VerifyCommands,
    pub project_dir: &'a Path,
    pub baseline_lint_errors: usize,
    pub timeout: Duration,
    /// The working-tree diff, handed to the L2 reviewer.
    pub diff: &'a str,
}

/// Run the L1 pipeline and, when all of it passes and a review session
/// is supplied, the L2 AI check.
pub async fn run_verification(
    req: &VerifyRequest<'_>,
    review_session: Option<&mut AgentSession>,
) -> Verification {
    let mut v = Verification {
        passed: false,
        summary: String::new(),
        l1_build: None,
        l1_test: None,
        l1_lint: None,
        new_lint_errors: 0,
        l2_ai: None,
        l2_reason: None,
        command_output: String::new(),
    };

    if let Some(ref build) = req.commands.build {
        let (ok, output) = run_command(build, req.project_dir, req.timeout).await;
        v.l1_build = Some(ok);
        if !ok {
            v.command_output = filter_command_output(&output);
            v.summary = format!("build failed: {build}");
            return v;
        }
    }

    if let Some(ref test) = req.commands.test {
        let (ok, output) = run_command(test, req.project_dir, req.timeout).await;
        v.l1_test = Some(ok);
        if !ok {
            v.command_output = filter_command_output(&output);
            v.summary = format!("tests failed: {test}");
            return v;
        }
    }

    if let Some(ref lint) = req.commands.lint {
        let (exit_ok, output) = run_command(lint, req.project_dir, req.timeout).await;
        let total = count_lint_errors(&output);
        let new_errors = total.saturating_sub(req.baseline_lint_errors);
        v.new_lint_errors = new_errors;
        let ok = new_errors == 0 && (exit_ok || total <= req.baseline_lint_errors);
        v.l1_lint = Some(ok);
        if !ok {
            v.command_output = filter_lint_errors(&output);
            v.summary = format!("lint introduced {new_errors} new error(s)");
            return v;
        }
    }

    // L2 only runs on a clean L1.
    if let Some(session) = review_session {
        let prompt = format!(
            "Review this diff for correctness and obvious regressions. \
             Reply with exactly PASS or FAIL on the first line, then one sentence of reasoning.\n\n\
             ```diff\n{}\n```",
            truncate(req.diff, 20_000)
        );
        match session.ask(&prompt, &SessionHooks::default()).await {
            Ok(outcome) => {
                let first = outcome.text.lines().next().unwrap_or("").trim().to_uppercase();
                let pass = first.starts_with("PASS");
                v.l2_ai = Some(pass);
                v.l2_reason = Some(
                    outcome
                        .text
                        .lines()
                        .skip(1)
                        .collect::<Vec<_>>()
                        .join(" ")
                        .trim()
                        .to_string(),
                );
                if !pass {
                    v.summary = format!(
                        "AI review rejected the diff: {}",
                        v.l2_reason.as_deref().unwrap_or("no reason given")
                    );
                    return v;
                }
            }
            Err(e) => {
                // A broken reviewer must not fail a green L1.
                tracing::warn!(error = %e, "L2 review session failed; accepting L1 result");
            }
        }
    }

    v.passed = true;
    v.summary = "verification passed".into();
    v
}

async fn run_command(cmd: &str, project_dir: &Path, timeout: Duration) -> (bool, String) {
    let mut command = tokio::process::Command::new("sh");
    command
        .arg("-c")
        .arg(cmd)
        .current_dir(project_dir)
        .stdin(std::process::Stdio::null())
        .kill_on_drop(true);

    let run = async {
        match command.output().await {
            Ok(out) => {
                let mut text = String::from_utf8_lossy(&out.stdout).into_owned();
                text.push_str(&String::from_utf8_lossy(&out.stderr));
                (out.status.success(), text)
            }
            Err(e) => (false, format!("failed to spawn `{cmd}`: {e}")),
        }
    };
    match tokio::time::timeout(timeout, run).await {
        Ok(result) => result,
        Err(_) => (false, format!("`{cmd}` timed out after {}s", timeout.as_secs())),
    }
}

/// Trim non-lint command output to the interesting tail.
fn filter_command_output(output: &str) -> String {
    let error_lines: Vec<&str> = output
        .lines()
        .filter(|l| {
            let lower = l.to_ascii_lowercase();
            lower.contains("error") || lower.contains("failed") || lower.contains("panic")
        })
        .collect();
    if error_lines.is_empty() {
        truncate(output, 4000)
    } else {
        truncate(&error_lines.join("\n"), 4000)
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let boundary = (0..=max).rev().find(|&i| s.is_char_boundary(i)).unwrap_or(0);
        format!("{}…", &s[..boundary])
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    const RUST_LINT: &str = "\
warning: unused variable `x`
error[E0308]: mismatched types
 --> src/main.rs:4:9
error[E0425]: cannot find value `y`
 --> src/lib.rs:10:5
";

    const TS_LINT: &str = "\
src/app.ts(12,5): error TS2304: Cannot find name 'foo'.
src/app.ts(20,1): error TS2551: Property 'bar' does not exist.
";

    const ESLINT: &str = "\
src/index.js
  12:5  error  'foo' is not defined  no-undef
  20:1  error  Unexpected console statement  no-console
";

    #[test]
    fn counts_rust_errors() {
        assert_eq!(count_lint_errors(RUST_LINT), 2);
    }

    #[test]
    fn counts_typescript_errors() {
        assert_eq!(count_lint_errors(TS_LINT), 2);
    }

    #[test]
    fn counts_generic_line_col_errors() {
        assert_eq!(count_lint_errors(ESLINT), 2);
    }

    #[test]
    fn warnings_do_not_count() {
        assert_eq!(count_lint_errors("warning: something\nnote: hint\n"), 0);
    }

    #[test]
    fn filter_keeps_rust_locations() {
        let filtered = filter_lint_errors(RUST_LINT);
        assert!(filtered.contains("error[E0308]"));
        assert!(filtered.contains("--> src/main.rs:4:9"));
        assert!(!filtered.contains("unused variable"));
    }

    #[test]
    fn filter_keeps_eslint_path_header() {
        let filtered = filter_lint_errors(ESLINT);
        assert!(filtered.contains("src/index.js"));
        assert!(filtered.contains("no-undef"));
    }

    #[test]
    fn detect_prefers_cargo() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Cargo.toml"), "[package]").unwrap();
        let cmds = detect_commands(dir.path(), &VerifyCommands::default());
        assert!(cmds.build.unwrap().starts_with("cargo build"));
        assert!(cmds.lint.unwrap().contains("clippy"));
    }

    #[test]
    fn overrides_win_field_by_field() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Cargo.toml"), "[package]").unwrap();
        let overrides = VerifyCommands {
            test: Some("cargo nextest run".into()),
            ..Default::default()
        };
        let cmds = detect_commands(dir.path(), &overrides);
        assert_eq!(cmds.test.as_deref(), Some("cargo nextest run"));
        assert!(cmds.build.unwrap().starts_with("cargo build"));
    }

    #[test]
    fn no_project_files_detects_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let cmds = detect_commands(dir.path(), &VerifyCommands::default());
        assert!(cmds.build.is_none() && cmds.test.is_none() && cmds.lint.is_none());
    }

    // ── Pipeline ────────────────────────────────────────────────────

    fn req<'a>(commands: &'a VerifyCommands, dir: &'a Path, baseline: usize) -> VerifyRequest<'a> {
        VerifyRequest {
            commands,
            project_dir: dir,
            baseline_lint_errors: baseline,
            timeout: Duration::from_secs(30),
            diff: "",
        }
    }

    #[tokio::test]
    async fn all_commands_green_passes() {
        let dir = tempfile::tempdir().unwrap();
        let commands = VerifyCommands {
            build: Some("true".into()),
            test: Some("true".into()),
            lint: Some("true".into()),
        };
        let v = run_verification(&req(&commands, dir.path(), 0), None).await;
        assert!(v.passed);
        assert_eq!(v.l1_build, Some(true));
        assert_eq!(v.l1_test, Some(true));
        assert_eq!(v.l1_lint, Some(true));
    }

    #[tokio::test]
    async fn build_failure_short_circuits() {
        let dir = tempfile::tempdir().unwrap();
        let commands = VerifyCommands {
            build: Some("echo 'error: boom' >&2; false".into()),
            test: Some("true".into()),
            lint: None,
        };
        let v = run_verification(&req(&commands, dir.path(), 0), None).await;
        assert!(!v.passed);
        assert_eq!(v.l1_build, Some(false));
        assert_eq!(v.l1_test, None, "test must not run after a failed build");
        assert!(v.command_output.contains("boom"));
    }

    #[tokio::test]
    async fn baseline_lint_errors_are_forgiven() {
        let dir = tempfile::tempdir().unwrap();
        // Lint "finds" two errors; baseline already had two.
        let commands = VerifyCommands {
            build: None,
            test: None,
            lint: Some(
                "printf 'error[E0308]: a\\nerror[E0425]: b\\n'; exit 1".into(),
            ),
        };
        let v = run_verification(&req(&commands, dir.path(), 2), None).await;
        assert!(v.passed, "{}", v.summary);
        assert_eq!(v.new_lint_errors, 0);
    }

    #[tokio::test]
    async fn new_lint_error_fails_with_filtered_output() {
        let dir = tempfile::tempdir().unwrap();
        let commands = VerifyCommands {
            build: None,
            test: None,
            lint: Some(
                "printf 'warning: meh\\nerror[E0308]: mismatched types\\n'; exit 1".into(),
            ),
        };
        let v = run_verification(&req(&commands, dir.path(), 0), None).await;
        assert!(!v.passed);
        assert_eq!(v.new_lint_errors, 1);
        assert!(v.command_output.contains("E0308"));
        assert!(!v.command_output.contains("meh"));
    }

    #[tokio::test]
    async fn command_timeout_is_a_failure() {
        let dir = tempfile::tempdir().unwrap();
        let commands = VerifyCommands {
            build: Some("sleep 30".into()),
            test: None,
            lint: None,
        };
        let mut request = req(&commands, dir.path(), 0);
        request.timeout = Duration::from_millis(200);
        let v = run_verification(&request, None).await;
        assert!(!v.passed);
        assert!(v.command_output.contains("timed out"));
    }
}
