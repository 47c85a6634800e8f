//! Runtime orchestration: declarative registry of hosts, backends, and
//! models; a pure planner that turns a desired model into an ordered
//! step list; and an executor that drives the steps across hosts and
//! maintains the active-runtime record.

pub mod executor;
pub mod host;
pub mod planner;
pub mod probe;
pub mod registry;
pub mod store;
pub mod template;

pub use executor::{execute_plan, ExecFailure, ExecOutcome, StepPhase};
pub use planner::{plan, Plan, PlanError, PlanErrorCode, PlanMode, PlanOutcome, PlanRequest, PlanStep, StepKind};
pub use probe::{probe_models_endpoint, wait_for_models_ready, ProbeResult, ProbeStatus, WaitOptions, WaitReport};
pub use registry::{ActiveRuntime, Backend, BackendType, Host, Model, Policy, Registry, Transport};
pub use store::RuntimeStore;
