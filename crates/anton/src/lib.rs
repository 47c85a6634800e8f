//! Anton, the autonomous task loop.
//!
//! Anton consumes a markdown task list: it acquires the single-writer
//! lock, preflights runtime readiness, then iterates runnable tasks
//! (one fresh agent session per attempt), verifying every diff before it
//! commits and rolling back everything that fails.

pub mod git;
pub mod lock;
pub mod progress;
pub mod prompt;
pub mod reply;
pub mod report;
pub mod run;
pub mod runtime_control;
pub mod verify;

pub use lock::{acquire_anton_lock, release_anton_lock, touch_anton_lock, AntonLock, LOCK_STALE_AFTER};
pub use progress::ProgressCallback;
pub use report::{Attempt, AttemptStatus, PreflightRecord, RunResult, StopReason};
pub use run::{run_anton, AntonDeps, SessionFactory, SessionSpec};
pub use runtime_control::{OrchestratorRuntime, RuntimeControl};
pub use verify::{detect_commands, run_verification, Verification};
