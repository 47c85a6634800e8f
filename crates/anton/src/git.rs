//! Git plumbing for the Anton loop: clean-tree checks, branch
//! creation, per-attempt rollback, and auto-commits.
//!
//! Everything shells out to `git`; Anton only ever needs the porcelain
//! subset and must work with whatever git the project already uses.

use std::path::Path;
use std::time::Duration;

use ih_domain::{Error, Result};

const GIT_TIMEOUT: Duration = Duration::from_secs(60);

async fn git(project_dir: &Path, args: &[&str]) -> Result<String> {
    let mut command = tokio::process::Command::new("git");
    command
        .args(args)
        .current_dir(project_dir)
        .stdin(std::process::Stdio::null())
        .kill_on_drop(true);

    let output = tokio::time::timeout(GIT_TIMEOUT, command.output())
        .await
        .map_err(|_| Error::Git(format!("git {} timed out", args.join(" "))))??;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::Git(format!(
            "git {} failed: {}",
            args.join(" "),
            stderr.trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// True when the working tree has no staged, unstaged, or untracked
/// changes.
pub async fn is_clean(project_dir: &Path) -> Result<bool> {
    let status = git(project_dir, &["status", "--porcelain"]).await?;
    Ok(status.trim().is_empty())
}

/// Working-tree diff against HEAD (staged + unstaged).
pub async fn diff_head(project_dir: &Path) -> Result<String> {
    git(project_dir, &["diff", "HEAD"]).await
}

/// Untracked files, one path per line.
pub async fn untracked_files(project_dir: &Path) -> Result<Vec<String>> {
    let out = git(
        project_dir,
        &["ls-files", "--others", "--exclude-standard"],
    )
    .await?;
    Ok(out.lines().map(String::from).collect())
}

pub async fn create_branch(project_dir: &Path, name: &str) -> Result<()> {
    git(project_dir, &["checkout", "-b", name]).await?;
    tracing::info!(branch = name, "created anton branch");
    Ok(())
}

/// Stage everything and commit; returns the new commit hash.
pub async fn commit_all(project_dir: &Path, message: &str) -> Result<String> {
    git(project_dir, &["add", "-A"]).await?;
    git(project_dir, &["commit", "-m", message, "--no-verify"]).await?;
    let hash = git(project_dir, &["rev-parse", "HEAD"]).await?;
    Ok(hash.trim().to_string())
}

/// Restore tracked files to HEAD and optionally delete untracked files
/// the attempt created (`baseline` is the untracked set captured before
/// the attempt ran).
pub async fn rollback(project_dir: &Path, baseline_untracked: &[String]) -> Result<()> {
    git(project_dir, &["checkout", "--", "."]).await?;
    git(project_dir, &["reset", "--quiet"]).await?;

    for file in untracked_files(project_dir).await? {
        if baseline_untracked.iter().any(|b| b == &file) {
            continue;
        }
        let path = project_dir.join(&file);
        if let Err(e) = std::fs::remove_file(&path) {
            tracing::warn!(file = %file, error = %e, "failed to delete attempt artifact");
        }
    }
    tracing::info!("attempt changes rolled back");
    Ok(())
}
