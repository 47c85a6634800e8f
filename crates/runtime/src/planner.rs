//! Plan computation: a pure function from (request, registry, active
//! state) to an ordered step list.
//!
//! No I/O happens here; identical inputs always produce an identical
//! plan, step text included. Execution belongs to [`crate::executor`].

use std::collections::BTreeMap;

use ih_domain::config::RuntimeSettings;
use serde::Serialize;

use crate::registry::{ActiveRuntime, Backend, Host, Model, Policy, Registry};
use crate::template;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request / outcome types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlanMode {
    /// Reach the requested state, reusing a matching healthy runtime.
    #[default]
    Ensure,
    /// Probe the planned target hosts only; start or stop nothing.
    Probe,
}

#[derive(Debug, Clone, Default)]
pub struct PlanRequest {
    pub model_id: String,
    pub backend_override: Option<String>,
    pub host_override: Option<String>,
    pub force_restart: bool,
    pub mode: PlanMode,
}

/// Closed error-code set surfaced to callers and the CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlanErrorCode {
    ModelNotFound,
    NoEligibleHost,
    HostPolicyViolation,
    BackendNotFound,
    SplitNotImplemented,
}

#[derive(Debug, Clone)]
pub struct PlanError {
    pub code: PlanErrorCode,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PlanOutcome {
    Err(PlanError),
    Ok(Plan),
}

impl PlanOutcome {
    pub fn ok(self) -> Option<Plan> {
        match self {
            PlanOutcome::Ok(plan) => Some(plan),
            PlanOutcome::Err(_) => None,
        }
    }
}

impl PartialEq for PlanError {
    fn eq(&self, other: &Self) -> bool {
        self.code == other.code && self.reason == other.reason
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    VerifyModelSource,
    StopModel,
    ApplyBackend,
    VerifyBackend,
    StartModel,
    ProbeHealth,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlanStep {
    pub kind: StepKind,
    pub host_id: String,
    pub command: String,
    pub timeout_sec: u64,
    /// Poll interval for `probe_health` retry loops.
    pub probe_interval_ms: Option<u64>,
    /// Best-effort undo, recorded for `apply_backend` steps.
    pub rollback_cmd: Option<String>,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Plan {
    /// Current active state already matches; steps only verify it.
    pub reuse: bool,
    pub model_id: String,
    pub backend_id: Option<String>,
    /// Target hosts that run the server.
    pub host_ids: Vec<String>,
    /// RPC helper hosts (stop/apply/verify only, no start/probe).
    pub helper_host_ids: Vec<String>,
    pub port: u16,
    pub steps: Vec<PlanStep>,
}

impl Plan {
    /// Target hosts followed by helpers, the order recorded in the
    /// active-runtime record.
    pub fn all_host_ids(&self) -> Vec<String> {
        let mut all = self.host_ids.clone();
        all.extend(self.helper_host_ids.iter().cloned());
        all
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Planning
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Compute a plan. Pure: same inputs, same output, no I/O.
pub fn plan(
    req: &PlanRequest,
    registry: &Registry,
    active: Option<&ActiveRuntime>,
    settings: &RuntimeSettings,
) -> PlanOutcome {
    let fail = |code: PlanErrorCode, reason: String| PlanOutcome::Err(PlanError { code, reason });

    // 1. Resolve the model.
    let Some(model) = registry.model(&req.model_id).filter(|m| m.enabled) else {
        return fail(
            PlanErrorCode::ModelNotFound,
            format!(
                "model '{}' is unknown or disabled — run `idlehands runtime status` to list models",
                req.model_id
            ),
        );
    };
    if model.split_policy.is_some() {
        return fail(
            PlanErrorCode::SplitNotImplemented,
            format!(
                "model '{}' declares split_policy, which is not implemented — remove it to plan",
                model.id
            ),
        );
    }

    // 2. Resolve the target host.
    let host = match resolve_host(req, model, registry) {
        Ok(h) => h,
        Err(outcome) => return outcome,
    };

    // 3. Resolve the backend.
    let backend = match resolve_backend(req, model, registry) {
        Ok(b) => b,
        Err(outcome) => return outcome,
    };

    // 4. RPC helper hosts declared in the backend args.
    let helper_host_ids: Vec<String> = backend
        .map(|b| resolve_rpc_helpers(b, registry, &host.id))
        .unwrap_or_default();

    let backend_id = backend.map(|b| b.id.clone());
    let port = model.runtime_defaults.port;
    let vars = step_vars(model, host, backend);

    if req.mode == PlanMode::Probe {
        let steps = vec![probe_step(model, host, &vars, settings)];
        return PlanOutcome::Ok(Plan {
            reuse: true,
            model_id: model.id.clone(),
            backend_id,
            host_ids: vec![host.id.clone()],
            helper_host_ids,
            port,
            steps,
        });
    }

    // 5. Reuse detection.
    let planned_hosts = vec![host.id.clone()];
    if !req.force_restart && helper_host_ids.is_empty() {
        if let Some(active) = active {
            if active.healthy
                && active.model_id == model.id
                && active.backend_id == backend_id
                && active.host_ids == planned_hosts
            {
                let steps = vec![probe_step(model, host, &vars, settings)];
                return PlanOutcome::Ok(Plan {
                    reuse: true,
                    model_id: model.id.clone(),
                    backend_id,
                    host_ids: planned_hosts,
                    helper_host_ids,
                    port,
                    steps,
                });
            }
        }
    }

    // 6. Full plan.
    let mut steps = Vec::new();

    // Fail fast if the weights are missing on the target.
    steps.push(PlanStep {
        kind: StepKind::VerifyModelSource,
        host_id: host.id.clone(),
        command: render_or_unreachable("test -r {source}", &vars),
        timeout_sec: settings.host_cmd_timeout_sec,
        probe_interval_ms: None,
        rollback_cmd: None,
        description: format!("check model weights for {} on {}", model.id, host.id),
    });

    // Stop whatever was serving before, once per host.
    let mut stopped: Vec<String> = Vec::new();
    let mut push_stop = |steps: &mut Vec<PlanStep>, host_id: &str| {
        if stopped.iter().any(|s| s == host_id) {
            return;
        }
        if let Some(h) = registry.host(host_id) {
            if !h.model_control.stop_cmd.is_empty() {
                steps.push(PlanStep {
                    kind: StepKind::StopModel,
                    host_id: h.id.clone(),
                    command: h.model_control.stop_cmd.clone(),
                    timeout_sec: settings.host_cmd_timeout_sec,
                    probe_interval_ms: None,
                    rollback_cmd: None,
                    description: format!("stop running model on {}", h.id),
                });
            }
            stopped.push(host_id.to_string());
        }
    };

    if let Some(active) = active {
        for host_id in &active.host_ids {
            push_stop(&mut steps, host_id);
        }
    }
    // RPC runs pre-clear every participant to free GPU memory.
    if !helper_host_ids.is_empty() {
        push_stop(&mut steps, &host.id);
        for helper in &helper_host_ids {
            push_stop(&mut steps, helper);
        }
    }

    // Backend apply/verify across target + helpers.
    let mut backend_hosts = vec![host.id.clone()];
    backend_hosts.extend(helper_host_ids.iter().cloned());

    if let Some(backend) = backend {
        let backend_changed = active
            .map(|a| a.backend_id != backend_id)
            .unwrap_or(true);
        if backend_changed {
            if let Some(ref apply) = backend.apply_cmd {
                let rollback = backend
                    .rollback_cmd
                    .as_ref()
                    .map(|r| render_or_unreachable(r, &vars));
                for host_id in &backend_hosts {
                    steps.push(PlanStep {
                        kind: StepKind::ApplyBackend,
                        host_id: host_id.clone(),
                        command: render_or_unreachable(apply, &vars),
                        timeout_sec: settings.host_cmd_timeout_sec,
                        probe_interval_ms: None,
                        rollback_cmd: rollback.clone(),
                        description: format!("apply backend {} on {}", backend.id, host_id),
                    });
                }
            }
        }
        if let Some(ref verify) = backend.verify_cmd {
            for host_id in &backend_hosts {
                steps.push(PlanStep {
                    kind: StepKind::VerifyBackend,
                    host_id: host_id.clone(),
                    command: render_or_unreachable(verify, &vars),
                    timeout_sec: settings.host_cmd_timeout_sec,
                    probe_interval_ms: None,
                    rollback_cmd: None,
                    description: format!("verify backend {} on {}", backend.id, host_id),
                });
            }
        }
    }

    // Only the target runs the server; helpers never get start/probe.
    steps.push(PlanStep {
        kind: StepKind::StartModel,
        host_id: host.id.clone(),
        command: render_or_unreachable(&model.launch.start_cmd, &vars),
        timeout_sec: settings.host_cmd_timeout_sec,
        probe_interval_ms: None,
        rollback_cmd: None,
        description: format!("start {} on {}", model.id, host.id),
    });
    steps.push(probe_step(model, host, &vars, settings));

    PlanOutcome::Ok(Plan {
        reuse: false,
        model_id: model.id.clone(),
        backend_id,
        host_ids: planned_hosts,
        helper_host_ids,
        port,
        steps,
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Selection rules
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn resolve_host<'a>(
    req: &PlanRequest,
    model: &Model,
    registry: &'a Registry,
) -> std::result::Result<&'a Host, PlanOutcome> {
    let fail = |code, reason: String| Err(PlanOutcome::Err(PlanError { code, reason }));

    if let Some(ref override_id) = req.host_override {
        let Some(host) = registry.host(override_id).filter(|h| h.enabled) else {
            return fail(
                PlanErrorCode::NoEligibleHost,
                format!("host override '{override_id}' is unknown or disabled"),
            );
        };
        if !model.host_policy.permits(&host.id) {
            return fail(
                PlanErrorCode::HostPolicyViolation,
                format!(
                    "host '{}' is outside model '{}' host_policy — pick a listed host or widen the policy",
                    host.id, model.id
                ),
            );
        }
        return Ok(host);
    }

    let host = match &model.host_policy {
        Policy::Any => registry.hosts.iter().find(|h| h.enabled),
        Policy::Ids(ids) => ids
            .iter()
            .filter_map(|id| registry.host(id))
            .find(|h| h.enabled),
    };
    match host {
        Some(h) => Ok(h),
        None => fail(
            PlanErrorCode::NoEligibleHost,
            format!(
                "no enabled host satisfies model '{}' — run `idlehands setup` to add a host",
                model.id
            ),
        ),
    }
}

fn resolve_backend<'a>(
    req: &PlanRequest,
    model: &Model,
    registry: &'a Registry,
) -> std::result::Result<Option<&'a Backend>, PlanOutcome> {
    let fail = |reason: String| {
        Err(PlanOutcome::Err(PlanError {
            code: PlanErrorCode::BackendNotFound,
            reason,
        }))
    };

    if let Some(ref override_id) = req.backend_override {
        return match registry.backend(override_id).filter(|b| b.enabled) {
            Some(b) => Ok(Some(b)),
            None => fail(format!("backend override '{override_id}' is unknown or disabled")),
        };
    }

    match &model.backend_policy {
        Policy::Any => Ok(None),
        Policy::Ids(ids) => {
            let found = ids
                .iter()
                .filter_map(|id| registry.backend(id))
                .find(|b| b.enabled);
            match found {
                Some(b) => Ok(Some(b)),
                None => fail(format!(
                    "no enabled backend satisfies model '{}' backend_policy {:?}",
                    model.id, ids
                )),
            }
        }
    }
}

/// Pull `--rpc host:port[,host:port…]` endpoints out of backend args and
/// map each hostname to a registry host id. The target host itself and
/// unresolvable names are skipped.
fn resolve_rpc_helpers(backend: &Backend, registry: &Registry, target_host_id: &str) -> Vec<String> {
    let Some(ref args) = backend.args else {
        return Vec::new();
    };
    let mut tokens = args.split_whitespace();
    let mut endpoints = None;
    while let Some(token) = tokens.next() {
        if token == "--rpc" {
            endpoints = tokens.next();
            break;
        }
    }
    let Some(endpoints) = endpoints else {
        return Vec::new();
    };

    let mut helpers = Vec::new();
    for endpoint in endpoints.split(',') {
        let name = endpoint.split(':').next().unwrap_or("").trim();
        if name.is_empty() {
            continue;
        }
        let resolved = registry
            .hosts
            .iter()
            .find(|h| h.connection.host.as_deref() == Some(name) || h.id == name);
        match resolved {
            Some(h) if h.id != target_host_id && !helpers.contains(&h.id) => {
                helpers.push(h.id.clone());
            }
            Some(_) => {}
            None => {
                tracing::debug!(endpoint = name, "rpc helper endpoint has no registry host");
            }
        }
    }
    helpers
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Step helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn step_vars(model: &Model, host: &Host, backend: Option<&Backend>) -> BTreeMap<&'static str, String> {
    let mut vars = BTreeMap::new();
    vars.insert("source", model.source.clone());
    vars.insert("port", model.runtime_defaults.port.to_string());
    vars.insert(
        "host",
        host.connection
            .host
            .clone()
            .unwrap_or_else(|| "127.0.0.1".into()),
    );
    vars.insert("host_id", host.id.clone());
    vars.insert("model_id", model.id.clone());
    vars.insert("backend_id", backend.map(|b| b.id.clone()).unwrap_or_default());
    vars.insert(
        "backend_args",
        backend.and_then(|b| b.args.clone()).unwrap_or_default(),
    );
    vars.insert(
        "backend_env",
        backend.and_then(|b| b.env.clone()).unwrap_or_default(),
    );
    vars.insert(
        "chat_template_args",
        template::chat_template_args(model.chat_template.as_deref()),
    );
    vars
}

/// Registry validation already rejected unknown variables, so rendering
/// with the full variable set cannot fail; an empty command would only
/// mean that invariant broke.
fn render_or_unreachable(tpl: &str, vars: &BTreeMap<&'static str, String>) -> String {
    template::render(tpl, vars).unwrap_or_default()
}

fn probe_step(
    model: &Model,
    host: &Host,
    vars: &BTreeMap<&'static str, String>,
    _settings: &RuntimeSettings,
) -> PlanStep {
    PlanStep {
        kind: StepKind::ProbeHealth,
        host_id: host.id.clone(),
        command: render_or_unreachable(&model.launch.probe_cmd, vars),
        timeout_sec: model.launch.probe_timeout_sec,
        probe_interval_ms: Some(model.launch.probe_interval_ms),
        rollback_cmd: None,
        description: format!("probe {} health on {}", model.id, host.id),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
