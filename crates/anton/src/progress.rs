//! Typed progress surface emitted by the Anton loop.
//!
//! Every method has a no-op default so consumers implement only what
//! they render. One trait object serves terminal output, bots, and
//! tests alike.

use ih_session::loop_detect::LoopSignal;
use ih_taskfile::Task;

use crate::report::{Attempt, RunResult};
use crate::verify::Verification;

pub trait ProgressCallback: Send + Sync {
    fn on_stage(&self, _msg: &str) {}
    fn on_heartbeat(&self) {}
    fn on_task_start(&self, _task: &Task, _attempt: u32) {}
    fn on_task_end(&self, _task: &Task, _attempt: &Attempt) {}
    fn on_task_skip(&self, _task: &Task, _reason: &str) {}
    fn on_tool_loop(&self, _task: &Task, _signal: &LoopSignal) {}
    fn on_compaction(&self, _task: &Task, _dropped: usize, _freed_tokens: u32) {}
    fn on_verification(&self, _task: &Task, _verification: &Verification) {}
    fn on_run_complete(&self, _result: &RunResult) {}
}

/// Silent progress for tests and embedding.
pub struct NullProgress;

impl ProgressCallback for NullProgress {}
