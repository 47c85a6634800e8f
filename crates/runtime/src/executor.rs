//! Plan execution: drives steps strictly in order across hosts and
//! owns the active-runtime record.
//!
//! The record is written exactly once, after every step has succeeded;
//! any failure leaves the previous record untouched.

use std::time::Duration;

use chrono::Utc;
use ih_domain::config::RuntimeSettings;
use ih_domain::{CancelToken, Result};

use crate::host::{run_on_host, HostOutput};
use crate::planner::{Plan, PlanError, PlanStep, StepKind};
use crate::registry::{ActiveRuntime, Registry};
use crate::store::RuntimeStore;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Outcome types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepPhase {
    Start,
    Done,
    Error,
}

/// Per-step progress callback: `(step, phase, detail)`.
pub type OnStep<'a> = &'a (dyn Fn(&PlanStep, StepPhase, Option<&str>) + Send + Sync);

/// Failure taxonomy surfaced to callers.
#[derive(Debug, Clone)]
pub enum ExecFailure {
    PlanError(PlanError),
    StepExecFailed { step: StepKind, host_id: String, detail: String },
    ProbeTimeout { host_id: String, detail: String },
    RollbackApplied { step: StepKind, host_id: String, detail: String },
    Cancelled,
}

impl ExecFailure {
    /// Stable label used in logs and attempt records.
    pub fn label(&self) -> &'static str {
        match self {
            ExecFailure::PlanError(_) => "plan-error",
            ExecFailure::StepExecFailed { .. } => "step-exec-failed",
            ExecFailure::ProbeTimeout { .. } => "probe-timeout",
            ExecFailure::RollbackApplied { .. } => "rollback-applied",
            ExecFailure::Cancelled => "cancelled",
        }
    }

    pub fn detail(&self) -> String {
        match self {
            ExecFailure::PlanError(e) => e.reason.clone(),
            ExecFailure::StepExecFailed { detail, .. }
            | ExecFailure::ProbeTimeout { detail, .. }
            | ExecFailure::RollbackApplied { detail, .. } => detail.clone(),
            ExecFailure::Cancelled => "cancelled".into(),
        }
    }
}

#[derive(Debug)]
pub struct ExecOutcome {
    pub ok: bool,
    pub failure: Option<ExecFailure>,
    pub steps_run: usize,
    /// Set on success: the endpoint the new active runtime serves.
    pub endpoint: Option<String>,
    /// True when a reuse plan failed; the caller may retry with
    /// `force_restart=true`.
    pub reuse_failed: bool,
}

impl ExecOutcome {
    fn failed(failure: ExecFailure, steps_run: usize, reuse: bool) -> Self {
        Self {
            ok: false,
            failure: Some(failure),
            steps_run,
            endpoint: None,
            reuse_failed: reuse,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Execution
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Drive a plan to completion.
///
/// Steps run sequentially; `probe_health` steps retry at their interval
/// until success or the step deadline. On success the active-runtime
/// record is persisted with the derived endpoint.
pub async fn execute_plan(
    plan: &Plan,
    registry: &Registry,
    store: &RuntimeStore,
    settings: &RuntimeSettings,
    cancel: &CancelToken,
    on_step: OnStep<'_>,
) -> Result<ExecOutcome> {
    let mut steps_run = 0usize;

    for step in &plan.steps {
        if cancel.is_cancelled() {
            return Ok(ExecOutcome::failed(ExecFailure::Cancelled, steps_run, plan.reuse));
        }

        on_step(step, StepPhase::Start, None);
        let result = run_step(step, registry, settings, cancel).await;
        steps_run += 1;

        match result {
            StepResult::Ok => {
                on_step(step, StepPhase::Done, None);
            }
            StepResult::Cancelled => {
                on_step(step, StepPhase::Error, Some("cancelled"));
                return Ok(ExecOutcome::failed(ExecFailure::Cancelled, steps_run, plan.reuse));
            }
            StepResult::Failed(detail) => {
                on_step(step, StepPhase::Error, Some(&detail));
                tracing::warn!(
                    kind = ?step.kind,
                    host = %step.host_id,
                    detail = %detail,
                    "plan step failed"
                );

                // Backend apply gets its recorded undo, best effort.
                if step.kind == StepKind::ApplyBackend {
                    if let Some(ref rollback) = step.rollback_cmd {
                        if let Some(host) = registry.host(&step.host_id) {
                            let timeout = Duration::from_secs(step.timeout_sec);
                            match run_on_host(rollback, host, timeout).await {
                                Ok(out) if out.success() => {
                                    tracing::info!(host = %host.id, "backend rollback applied");
                                }
                                Ok(out) => {
                                    tracing::warn!(host = %host.id, detail = %out.preview(200), "backend rollback failed");
                                }
                                Err(e) => {
                                    tracing::warn!(host = %host.id, error = %e, "backend rollback errored");
                                }
                            }
                        }
                        return Ok(ExecOutcome::failed(
                            ExecFailure::RollbackApplied {
                                step: step.kind,
                                host_id: step.host_id.clone(),
                                detail,
                            },
                            steps_run,
                            plan.reuse,
                        ));
                    }
                }

                let failure = if step.kind == StepKind::ProbeHealth {
                    ExecFailure::ProbeTimeout {
                        host_id: step.host_id.clone(),
                        detail,
                    }
                } else {
                    ExecFailure::StepExecFailed {
                        step: step.kind,
                        host_id: step.host_id.clone(),
                        detail,
                    }
                };
                return Ok(ExecOutcome::failed(failure, steps_run, plan.reuse));
            }
        }
    }

    // All steps succeeded: persist the new active runtime.
    let endpoint = derive_endpoint(plan, registry);
    let active = ActiveRuntime {
        model_id: plan.model_id.clone(),
        backend_id: plan.backend_id.clone(),
        host_ids: plan.all_host_ids(),
        healthy: true,
        endpoint: Some(endpoint.clone()),
        started_at: Utc::now(),
    };
    store.save_active(&active)?;
    tracing::info!(model = %plan.model_id, endpoint = %endpoint, reuse = plan.reuse, "runtime active");

    Ok(ExecOutcome {
        ok: true,
        failure: None,
        steps_run,
        endpoint: Some(endpoint),
        reuse_failed: false,
    })
}

/// `http://{host-or-loopback}:{port}/v1` for the first target host.
pub fn derive_endpoint(plan: &Plan, registry: &Registry) -> String {
    let host = plan
        .host_ids
        .first()
        .and_then(|id| registry.host(id))
        .and_then(|h| h.connection.host.clone())
        .unwrap_or_else(|| "127.0.0.1".into());
    format!("http://{host}:{}/v1", plan.port)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Step runners
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

enum StepResult {
    Ok,
    Failed(String),
    Cancelled,
}

async fn run_step(
    step: &PlanStep,
    registry: &Registry,
    _settings: &RuntimeSettings,
    cancel: &CancelToken,
) -> StepResult {
    let Some(host) = registry.host(&step.host_id) else {
        return StepResult::Failed(format!("host '{}' disappeared from the registry", step.host_id));
    };

    match step.kind {
        StepKind::ProbeHealth => {
            let interval = Duration::from_millis(step.probe_interval_ms.unwrap_or(1000));
            let deadline =
                tokio::time::Instant::now() + Duration::from_secs(step.timeout_sec);
            let mut last = String::from("no probe attempted");
            loop {
                if cancel.is_cancelled() {
                    return StepResult::Cancelled;
                }
                // Each probe attempt is bounded by the remaining budget.
                let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
                if remaining.is_zero() {
                    return StepResult::Failed(format!("probe deadline exceeded: {last}"));
                }
                match run_on_host(&step.command, host, remaining.min(interval * 4)).await {
                    Ok(out) if out.success() => return StepResult::Ok,
                    Ok(out) => last = format!("exit {}: {}", out.exit_code, out.preview(200)),
                    Err(e) => last = e.to_string(),
                }
                if tokio::time::Instant::now() + interval >= deadline {
                    return StepResult::Failed(format!("probe deadline exceeded: {last}"));
                }
                tokio::time::sleep(interval).await;
            }
        }
        _ => {
            let timeout = Duration::from_secs(step.timeout_sec);
            match run_on_host(&step.command, host, timeout).await {
                Ok(out) if out.success() => StepResult::Ok,
                Ok(out) => StepResult::Failed(step_failure_detail(step, &out)),
                Err(e) => StepResult::Failed(e.to_string()),
            }
        }
    }
}

fn step_failure_detail(step: &PlanStep, out: &HostOutput) -> String {
    let preview = out.preview(400);
    match step.kind {
        StepKind::VerifyModelSource => format!(
            "model weights missing or unreadable on {} (exit {})",
            step.host_id, out.exit_code
        ),
        _ => format!("exit {}: {preview}", out.exit_code),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::{plan, PlanMode, PlanRequest};
    use crate::registry::tests::host_fixture;
    use crate::registry::{Launch, Model, Policy, RuntimeDefaults};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn model_with(start_cmd: &str, probe_cmd: &str) -> Model {
        Model {
            id: "m1".into(),
            display_name: "m1".into(),
            enabled: true,
            source: "/dev/null".into(),
            host_policy: Policy::Any,
            backend_policy: Policy::Any,
            launch: Launch {
                start_cmd: start_cmd.into(),
                probe_cmd: probe_cmd.into(),
                probe_timeout_sec: 2,
                probe_interval_ms: 100,
            },
            runtime_defaults: RuntimeDefaults::default(),
            chat_template: None,
            split_policy: None,
        }
    }

    fn registry_with(model: Model) -> Registry {
        let mut host = host_fixture("h1");
        host.model_control.stop_cmd = "true".into();
        Registry {
            hosts: vec![host],
            models: vec![model],
            ..Default::default()
        }
    }

    fn noop_on_step() -> impl Fn(&PlanStep, StepPhase, Option<&str>) + Send + Sync {
        |_, _, _| {}
    }

    async fn run(
        registry: &Registry,
        store: &RuntimeStore,
        req: PlanRequest,
    ) -> ExecOutcome {
        let settings = RuntimeSettings::default();
        let active = store.load_active().unwrap();
        let outcome = plan(&req, registry, active.as_ref(), &settings);
        let plan = outcome.ok().expect("plan should succeed");
        execute_plan(
            &plan,
            registry,
            store,
            &settings,
            &CancelToken::new(),
            &noop_on_step(),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn successful_plan_persists_active_runtime() {
        let dir = tempfile::tempdir().unwrap();
        let store = RuntimeStore::with_dir(dir.path());
        let registry = registry_with(model_with("true", "true"));

        let outcome = run(&registry, &store, PlanRequest {
            model_id: "m1".into(),
            ..Default::default()
        })
        .await;

        assert!(outcome.ok, "{:?}", outcome.failure);
        assert_eq!(outcome.endpoint.as_deref(), Some("http://127.0.0.1:8080/v1"));
        let active = store.load_active().unwrap().unwrap();
        assert_eq!(active.model_id, "m1");
        assert!(active.healthy);
        assert_eq!(active.host_ids, vec!["h1"]);
    }

    #[tokio::test]
    async fn failed_step_leaves_prior_record_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let store = RuntimeStore::with_dir(dir.path());

        let prior = ActiveRuntime {
            model_id: "old".into(),
            backend_id: None,
            host_ids: vec!["h1".into()],
            healthy: true,
            endpoint: None,
            started_at: Utc::now(),
        };
        store.save_active(&prior).unwrap();

        // start_cmd fails before the probe is reached.
        let mut model = model_with("false", "true");
        model.source = "/nonexistent/weights.gguf".into();
        let registry = registry_with(model);

        let outcome = run(&registry, &store, PlanRequest {
            model_id: "m1".into(),
            force_restart: true,
            ..Default::default()
        })
        .await;

        assert!(!outcome.ok);
        let failure = outcome.failure.unwrap();
        assert_eq!(failure.label(), "step-exec-failed");
        assert!(failure.detail().contains("weights missing"));

        let active = store.load_active().unwrap().unwrap();
        assert_eq!(active.model_id, "old");
    }

    #[tokio::test]
    async fn probe_retries_until_deadline_then_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let store = RuntimeStore::with_dir(dir.path());
        let registry = registry_with(model_with("true", "false"));

        let attempts = AtomicUsize::new(0);
        let on_step = |step: &PlanStep, phase: StepPhase, _: Option<&str>| {
            if step.kind == StepKind::ProbeHealth && phase == StepPhase::Error {
                attempts.fetch_add(1, Ordering::SeqCst);
            }
        };

        let settings = RuntimeSettings::default();
        let planned = plan(
            &PlanRequest { model_id: "m1".into(), ..Default::default() },
            &registry,
            None,
            &settings,
        )
        .ok()
        .unwrap();
        let outcome = execute_plan(
            &planned,
            &registry,
            &store,
            &settings,
            &CancelToken::new(),
            &on_step,
        )
        .await
        .unwrap();

        assert!(!outcome.ok);
        assert_eq!(outcome.failure.as_ref().unwrap().label(), "probe-timeout");
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert!(store.load_active().unwrap().is_none());
    }

    #[tokio::test]
    async fn apply_failure_triggers_rollback() {
        let dir = tempfile::tempdir().unwrap();
        let store = RuntimeStore::with_dir(dir.path());
        let marker = dir.path().join("rolled-back");

        let mut registry = registry_with(model_with("true", "true"));
        registry.backends.push(crate::registry::Backend {
            id: "cuda".into(),
            display_name: "cuda".into(),
            enabled: true,
            backend_type: crate::registry::BackendType::Cuda,
            host_filters: Policy::Any,
            apply_cmd: Some("false".into()),
            verify_cmd: None,
            rollback_cmd: Some(format!("touch {}", marker.display())),
            env: None,
            args: None,
        });
        registry.models[0].backend_policy = Policy::Ids(vec!["cuda".into()]);

        let outcome = run(&registry, &store, PlanRequest {
            model_id: "m1".into(),
            ..Default::default()
        })
        .await;

        assert!(!outcome.ok);
        assert_eq!(outcome.failure.as_ref().unwrap().label(), "rollback-applied");
        assert!(marker.exists(), "rollback command should have run");
        assert!(store.load_active().unwrap().is_none());
    }

    #[tokio::test]
    async fn cancellation_aborts_before_next_step() {
        let dir = tempfile::tempdir().unwrap();
        let store = RuntimeStore::with_dir(dir.path());
        let registry = registry_with(model_with("true", "true"));

        let settings = RuntimeSettings::default();
        let planned = plan(
            &PlanRequest { model_id: "m1".into(), ..Default::default() },
            &registry,
            None,
            &settings,
        )
        .ok()
        .unwrap();

        let cancel = CancelToken::new();
        cancel.cancel();
        let outcome = execute_plan(
            &planned,
            &registry,
            &store,
            &settings,
            &cancel,
            &noop_on_step(),
        )
        .await
        .unwrap();

        assert!(!outcome.ok);
        assert!(matches!(outcome.failure, Some(ExecFailure::Cancelled)));
        assert_eq!(outcome.steps_run, 0);
    }

    #[tokio::test]
    async fn reuse_plan_failure_flags_retry() {
        let dir = tempfile::tempdir().unwrap();
        let store = RuntimeStore::with_dir(dir.path());
        let registry = registry_with(model_with("true", "false"));

        // Probe-mode plan stands in for a reuse validation.
        let settings = RuntimeSettings::default();
        let planned = plan(
            &PlanRequest {
                model_id: "m1".into(),
                mode: PlanMode::Probe,
                ..Default::default()
            },
            &registry,
            None,
            &settings,
        )
        .ok()
        .unwrap();
        let outcome = execute_plan(
            &planned,
            &registry,
            &store,
            &settings,
            &CancelToken::new(),
            &noop_on_step(),
        )
        .await
        .unwrap();

        assert!(!outcome.ok);
        assert!(outcome.reuse_failed);
    }
}
