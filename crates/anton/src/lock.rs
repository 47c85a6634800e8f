//! The Anton lock: at most one run per project at a time.
//!
//! A JSON file in the state directory records the holder; a heartbeat
//! refreshes `last_heartbeat_at` every few seconds. A lock whose
//! heartbeat is older than [`LOCK_STALE_AFTER`] belongs to a crashed
//! run and is reclaimed without operator intervention.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use ih_domain::{Error, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Heartbeats older than this mark an abandoned lock.
pub const LOCK_STALE_AFTER: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AntonLock {
    pub pid: u32,
    pub acquired_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
    pub task_file: PathBuf,
    pub project_dir: PathBuf,
}

/// Lock file path for a project: one lock per project directory, so
/// concurrent runs on different task files of the same project still
/// exclude each other.
pub fn lock_path(state_dir: &Path, project_dir: &Path) -> PathBuf {
    let digest = Sha256::digest(project_dir.to_string_lossy().as_bytes());
    state_dir.join(format!("anton-{}.lock.json", hex::encode(&digest[..6])))
}

/// Acquire the lock, reclaiming a stale one.
pub fn acquire_anton_lock(state_dir: &Path, task_file: &Path, project_dir: &Path) -> Result<PathBuf> {
    let path = lock_path(state_dir, project_dir);

    if let Some(existing) = read_lock(&path)? {
        let age = Utc::now().signed_duration_since(existing.last_heartbeat_at);
        let stale = age.num_seconds() >= LOCK_STALE_AFTER.as_secs() as i64;
        if !stale {
            return Err(Error::LockHeld(format!(
                "another Anton run (pid {}) holds the lock for {} — heartbeat {}s ago; use `/anton stop` first or wait for it to go stale",
                existing.pid,
                existing.project_dir.display(),
                age.num_seconds().max(0)
            )));
        }
        tracing::warn!(
            pid = existing.pid,
            age_sec = age.num_seconds(),
            "reclaiming stale anton lock"
        );
    }

    let lock = AntonLock {
        pid: std::process::id(),
        acquired_at: Utc::now(),
        last_heartbeat_at: Utc::now(),
        task_file: task_file.to_path_buf(),
        project_dir: project_dir.to_path_buf(),
    };
    write_lock(&path, &lock)?;
    tracing::info!(path = %path.display(), pid = lock.pid, "anton lock acquired");
    Ok(path)
}

/// Refresh the heartbeat in place.
pub fn touch_anton_lock(path: &Path) -> Result<()> {
    let Some(mut lock) = read_lock(path)? else {
        return Err(Error::LockHeld(format!(
            "lock file {} vanished mid-run — another process may have reclaimed it",
            path.display()
        )));
    };
    lock.last_heartbeat_at = Utc::now();
    write_lock(path, &lock)
}

/// Remove the lock. A missing file is not an error.
pub fn release_anton_lock(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn read_lock(path: &Path) -> Result<Option<AntonLock>> {
    if !path.exists() {
        return Ok(None);
    }
    let text = std::fs::read_to_string(path)?;
    match serde_json::from_str(&text) {
        Ok(lock) => Ok(Some(lock)),
        Err(e) => {
            // A corrupt lock is as good as stale.
            tracing::warn!(error = %e, "unreadable lock file treated as stale");
            Ok(None)
        }
    }
}

fn write_lock(path: &Path, lock: &AntonLock) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let tmp = tempfile::NamedTempFile::new_in(dir)?;
    std::fs::write(tmp.path(), serde_json::to_string_pretty(lock)?)?;
    tmp.persist(path).map_err(|e| Error::Io(e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dirs() -> (tempfile::TempDir, PathBuf, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let task_file = dir.path().join("TASKS.md");
        let project = dir.path().join("project");
        (dir, task_file, project)
    }

    #[test]
    fn acquire_release_cycle() {
        let (dir, task_file, project) = dirs();
        let path = acquire_anton_lock(dir.path(), &task_file, &project).unwrap();
        assert!(path.exists());

        let lock: AntonLock =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(lock.pid, std::process::id());
        assert_eq!(lock.project_dir, project);

        release_anton_lock(&path).unwrap();
        assert!(!path.exists());
        // Releasing again is fine.
        release_anton_lock(&path).unwrap();
    }

    #[test]
    fn fresh_lock_blocks_second_acquisition() {
        let (dir, task_file, project) = dirs();
        acquire_anton_lock(dir.path(), &task_file, &project).unwrap();
        let err = acquire_anton_lock(dir.path(), &task_file, &project).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains(&std::process::id().to_string()));
        assert!(msg.contains("/anton stop"));
    }

    #[test]
    fn stale_lock_is_reclaimed() {
        let (dir, task_file, project) = dirs();
        let path = lock_path(dir.path(), &project);
        let stale = AntonLock {
            pid: 12345,
            acquired_at: Utc::now() - chrono::Duration::seconds(900),
            last_heartbeat_at: Utc::now() - chrono::Duration::seconds(600),
            task_file: task_file.clone(),
            project_dir: project.clone(),
        };
        write_lock(&path, &stale).unwrap();

        acquire_anton_lock(dir.path(), &task_file, &project).unwrap();
        let lock: AntonLock =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(lock.pid, std::process::id());
    }

    #[test]
    fn heartbeat_just_inside_threshold_is_not_stale() {
        let (dir, task_file, project) = dirs();
        let path = lock_path(dir.path(), &project);
        let holder = AntonLock {
            pid: 12345,
            acquired_at: Utc::now() - chrono::Duration::seconds(500),
            last_heartbeat_at: Utc::now() - chrono::Duration::seconds(110),
            task_file: task_file.clone(),
            project_dir: project.clone(),
        };
        write_lock(&path, &holder).unwrap();
        assert!(acquire_anton_lock(dir.path(), &task_file, &project).is_err());
    }

    #[test]
    fn touch_refreshes_heartbeat() {
        let (dir, task_file, project) = dirs();
        let path = acquire_anton_lock(dir.path(), &task_file, &project).unwrap();

        let before: AntonLock =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        touch_anton_lock(&path).unwrap();
        let after: AntonLock =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert!(after.last_heartbeat_at > before.last_heartbeat_at);
        assert_eq!(after.acquired_at, before.acquired_at);
    }

    #[test]
    fn corrupt_lock_treated_as_stale() {
        let (dir, task_file, project) = dirs();
        let path = lock_path(dir.path(), &project);
        std::fs::create_dir_all(dir.path()).unwrap();
        std::fs::write(&path, "{ not json").unwrap();
        assert!(acquire_anton_lock(dir.path(), &task_file, &project).is_ok());
    }

    #[test]
    fn different_projects_do_not_collide() {
        let (dir, task_file, project) = dirs();
        let other_project = dir.path().join("other");
        acquire_anton_lock(dir.path(), &task_file, &project).unwrap();
        assert!(acquire_anton_lock(dir.path(), &task_file, &other_project).is_ok());
    }
}
