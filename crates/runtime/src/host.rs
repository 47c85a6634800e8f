//! Host command execution: local shell or non-interactive ssh.
//!
//! Output is captured, never a TTY. On timeout the child's process
//! group is killed and the partial output comes back with the −1
//! sentinel exit code.

use std::process::Stdio;
use std::time::Duration;

use ih_domain::Result;
use tokio::io::AsyncReadExt;
use tokio::process::Command;

use crate::registry::{Host, Transport};

/// Exit code reported when a command was killed at its deadline.
pub const EXIT_TIMEOUT: i32 = -1;

#[derive(Debug, Clone)]
pub struct HostOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl HostOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Short combined-output preview for error reporting.
    pub fn preview(&self, max: usize) -> String {
        let combined = if self.stderr.trim().is_empty() {
            self.stdout.trim()
        } else {
            self.stderr.trim()
        };
        let mut s: String = combined.chars().take(max).collect();
        if combined.chars().count() > max {
            s.push('…');
        }
        s
    }
}

/// Run a shell command on a host, bounded by `timeout`.
///
/// Shell metacharacters in interpolated arguments must already be
/// escaped by the caller (the planner quotes every template value).
pub async fn run_on_host(cmd: &str, host: &Host, timeout: Duration) -> Result<HostOutput> {
    let mut command = build_command(cmd, host);
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    command.process_group(0);

    let mut child = command.spawn()?;
    let pid = child.id();

    let mut stdout_pipe = child.stdout.take();
    let mut stderr_pipe = child.stderr.take();
    let stdout_task = tokio::spawn(async move {
        let mut buf = String::new();
        if let Some(ref mut pipe) = stdout_pipe {
            let _ = pipe.read_to_string(&mut buf).await;
        }
        buf
    });
    let stderr_task = tokio::spawn(async move {
        let mut buf = String::new();
        if let Some(ref mut pipe) = stderr_pipe {
            let _ = pipe.read_to_string(&mut buf).await;
        }
        buf
    });

    let exit_code = tokio::select! {
        status = child.wait() => status?.code().unwrap_or(EXIT_TIMEOUT),
        _ = tokio::time::sleep(timeout) => {
            kill_process_group(pid);
            let _ = child.kill().await;
            let _ = child.wait().await;
            tracing::warn!(host = %host.id, cmd, timeout_ms = timeout.as_millis() as u64, "host command timed out");
            EXIT_TIMEOUT
        }
    };

    let stdout = stdout_task.await.unwrap_or_default();
    let stderr = stderr_task.await.unwrap_or_default();

    tracing::debug!(host = %host.id, exit_code, "host command finished");
    Ok(HostOutput {
        exit_code,
        stdout,
        stderr,
    })
}

/// Build the subprocess for a host. Remote commands are wrapped in a
/// batch-mode ssh invocation so a missing key can never hang on a
/// password prompt.
fn build_command(cmd: &str, host: &Host) -> Command {
    match host.transport {
        Transport::Local => {
            let mut c = Command::new("sh");
            c.arg("-c").arg(cmd);
            c
        }
        Transport::Ssh => {
            let conn = &host.connection;
            let mut c = Command::new("ssh");
            c.arg("-o")
                .arg("BatchMode=yes")
                .arg("-o")
                .arg("ConnectTimeout=10")
                .arg("-o")
                .arg("StrictHostKeyChecking=accept-new");
            if let Some(port) = conn.port {
                c.arg("-p").arg(port.to_string());
            }
            if let Some(ref key) = conn.key_path {
                c.arg("-i").arg(key);
            }
            let target = match (&conn.user, &conn.host) {
                (Some(user), Some(h)) => format!("{user}@{h}"),
                (None, Some(h)) => h.clone(),
                // Validation guarantees connection.host for ssh hosts;
                // fall back to the id so a broken record fails loudly.
                _ => host.id.clone(),
            };
            c.arg(target).arg(cmd);
            c
        }
    }
}

#[cfg(unix)]
fn kill_process_group(pid: Option<u32>) {
    if let Some(pid) = pid {
        unsafe {
            libc::killpg(pid as libc::pid_t, libc::SIGKILL);
        }
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: Option<u32>) {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::tests::host_fixture;

    #[tokio::test]
    async fn local_command_captures_stdout() {
        let host = host_fixture("local");
        let out = run_on_host("echo hello", &host, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(out.exit_code, 0);
        assert_eq!(out.stdout.trim(), "hello");
        assert!(out.success());
    }

    #[tokio::test]
    async fn nonzero_exit_propagates() {
        let host = host_fixture("local");
        let out = run_on_host("exit 3", &host, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(out.exit_code, 3);
        assert!(!out.success());
    }

    #[tokio::test]
    async fn stderr_captured_separately() {
        let host = host_fixture("local");
        let out = run_on_host("echo oops 1>&2", &host, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(out.stderr.trim(), "oops");
        assert!(out.stdout.trim().is_empty());
    }

    #[tokio::test]
    async fn timeout_returns_sentinel_with_partial_output() {
        let host = host_fixture("local");
        let start = std::time::Instant::now();
        let out = run_on_host("echo early; sleep 30", &host, Duration::from_millis(300))
            .await
            .unwrap();
        assert_eq!(out.exit_code, EXIT_TIMEOUT);
        assert_eq!(out.stdout.trim(), "early");
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn ssh_command_is_batch_mode() {
        let mut host = host_fixture("remote");
        host.transport = Transport::Ssh;
        host.connection.host = Some("10.0.0.7".into());
        host.connection.user = Some("ops".into());
        host.connection.port = Some(2222);
        let command = build_command("uptime", &host);
        let args: Vec<String> = command
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert!(args.contains(&"BatchMode=yes".to_string()));
        assert!(args.contains(&"ops@10.0.0.7".to_string()));
        assert!(args.contains(&"2222".to_string()));
        assert_eq!(args.last().unwrap(), "uptime");
    }

    #[test]
    fn preview_truncates() {
        let out = HostOutput {
            exit_code: 1,
            stdout: String::new(),
            stderr: "x".repeat(500),
        };
        assert_eq!(out.preview(100).chars().count(), 101); // 100 + ellipsis
    }
}
