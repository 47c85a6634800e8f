//! The runtime seam the Anton loop depends on.
//!
//! "Ready" means an inference endpoint answering `/v1/models`, not a
//! process that merely started. The production implementation drives
//! the planner/executor and then waits for readiness; tests substitute
//! a scripted control.

use std::time::Duration;

use ih_domain::config::RuntimeSettings;
use ih_domain::{CancelToken, Error, Result};
use ih_runtime::{
    execute_plan, plan, probe::WaitOptions, wait_for_models_ready, PlanOutcome, PlanRequest,
    Registry, RuntimeStore, StepPhase,
};

/// Brings the runtime to readiness and reports the endpoint.
#[async_trait::async_trait]
pub trait RuntimeControl: Send + Sync {
    /// Ensure the configured model is serving; returns the endpoint
    /// base URL (`…/v1`). `force_restart` skips reuse.
    async fn ensure_ready(&self, force_restart: bool) -> Result<String>;
}

/// Production control: plan → execute → wait for `/v1/models`.
pub struct OrchestratorRuntime {
    pub store: RuntimeStore,
    pub registry: Registry,
    pub settings: RuntimeSettings,
    pub model_id: String,
    pub cancel: CancelToken,
    pub http: reqwest::Client,
}

impl OrchestratorRuntime {
    pub fn new(
        store: RuntimeStore,
        registry: Registry,
        settings: RuntimeSettings,
        model_id: impl Into<String>,
        cancel: CancelToken,
    ) -> Self {
        Self {
            store,
            registry,
            settings,
            model_id: model_id.into(),
            cancel,
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait::async_trait]
impl RuntimeControl for OrchestratorRuntime {
    async fn ensure_ready(&self, force_restart: bool) -> Result<String> {
        let active = self.store.load_active()?;
        let request = PlanRequest {
            model_id: self.model_id.clone(),
            force_restart,
            ..Default::default()
        };

        let planned = match plan(&request, &self.registry, active.as_ref(), &self.settings) {
            PlanOutcome::Ok(p) => p,
            PlanOutcome::Err(e) => {
                return Err(Error::Validation(format!("{:?}: {}", e.code, e.reason)));
            }
        };

        tracing::info!(
            model = %planned.model_id,
            reuse = planned.reuse,
            steps = planned.steps.len(),
            "executing runtime plan"
        );
        let on_step = |step: &ih_runtime::PlanStep, phase: StepPhase, detail: Option<&str>| {
            match phase {
                StepPhase::Start => tracing::debug!(desc = %step.description, "step start"),
                StepPhase::Done => tracing::debug!(desc = %step.description, "step done"),
                StepPhase::Error => {
                    tracing::warn!(desc = %step.description, detail = detail.unwrap_or(""), "step failed");
                }
            }
        };
        let outcome = execute_plan(
            &planned,
            &self.registry,
            &self.store,
            &self.settings,
            &self.cancel,
            &on_step,
        )
        .await?;

        if !outcome.ok {
            // A failed reuse validation gets one forced restart.
            if outcome.reuse_failed && !force_restart {
                tracing::warn!("reuse validation failed; retrying with force_restart");
                return self.ensure_ready(true).await;
            }
            let (label, detail) = outcome
                .failure
                .map(|f| (f.label(), f.detail()))
                .unwrap_or(("step-exec-failed", "unknown failure".into()));
            return Err(Error::Runtime(format!(
                "{label}: {detail} — check the host and `idlehands runtime status`"
            )));
        }

        let endpoint = match outcome.endpoint {
            Some(e) => e,
            None => return Err(Error::Runtime("plan succeeded without an endpoint".into())),
        };

        // Probe the HTTP surface the sessions will actually use.
        let (host, port) = endpoint_host_port(&endpoint, planned.port);
        let wait = WaitOptions {
            timeout: Duration::from_secs(self.settings.wait_ready_timeout_sec),
            interval: Duration::from_millis(self.settings.wait_ready_interval_ms),
            probe_timeout: Duration::from_secs(self.settings.probe_timeout_sec),
            expected_model_id: Some(self.model_id.clone()),
        };
        let report = wait_for_models_ready(&self.http, &host, port, &wait).await;
        if !report.ok {
            return Err(Error::Runtime(report.reason.unwrap_or_else(|| {
                format!("endpoint {endpoint} did not become ready")
            })));
        }

        Ok(endpoint)
    }
}

fn endpoint_host_port(endpoint: &str, default_port: u16) -> (String, u16) {
    let stripped = endpoint
        .trim_start_matches("http://")
        .trim_end_matches("/v1");
    let mut parts = stripped.split(':');
    let host = parts.next().unwrap_or("127.0.0.1").to_string();
    let port = parts
        .next()
        .and_then(|p| p.parse().ok())
        .unwrap_or(default_port);
    (host, port)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_parsing() {
        assert_eq!(
            endpoint_host_port("http://10.0.0.7:8080/v1", 1234),
            ("10.0.0.7".into(), 8080)
        );
        assert_eq!(
            endpoint_host_port("http://127.0.0.1:18080/v1", 1234),
            ("127.0.0.1".into(), 18080)
        );
    }
}
