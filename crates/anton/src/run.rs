//! The Anton main loop.
//!
//! Startup: lock → heartbeat → baseline capture → clean-tree check →
//! runtime preflight. Loop: pick the first runnable task, preflight it
//! (discovery, requirements review), run one fresh agent session,
//! verify the diff, commit or roll back, record the attempt. Budgets
//! are checked in a fixed order at the top of every iteration.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ih_domain::config::Config;
use ih_domain::trifecta::{Lens, Vault};
use ih_domain::{CancelToken, Error, FailureKind, Result};
use ih_session::{AgentSession, SessionHooks};
use ih_taskfile::{
    append_task_note, auto_complete_ancestors, insert_sub_tasks, mark_task_checked,
    parse_task_file, Task, TaskFile,
};

use crate::git;
use crate::lock::{acquire_anton_lock, release_anton_lock, touch_anton_lock};
use crate::progress::ProgressCallback;
use crate::prompt::{build_attempt_prompt, PromptParts, RetryContext};
use crate::reply::{parse_agent_reply, parse_discovery_reply, AgentVerdict};
use crate::report::{Attempt, AttemptStatus, PreflightRecord, RunResult, StopReason};
use crate::runtime_control::RuntimeControl;
use crate::verify::{count_lint_errors, detect_commands, run_verification, VerifyRequest};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Dependencies
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// What a session factory needs to build one fresh session.
#[derive(Debug, Clone)]
pub struct SessionSpec {
    pub endpoint: String,
    pub model_id: String,
    pub system_prompt: String,
    /// Read-only tool schema (discovery, review, decomposition).
    pub slim: bool,
    pub max_iterations: u32,
    pub prompt_budget: u32,
}

/// Builds a fresh [`AgentSession`] per attempt. Production wires the
/// OpenAI-compatible client plus a tool executor; tests wire scripted
/// clients.
pub type SessionFactory = Arc<dyn Fn(&SessionSpec) -> AgentSession + Send + Sync>;

pub struct AntonDeps {
    pub config: Config,
    pub task_file: PathBuf,
    pub project_dir: PathBuf,
    /// Holds the lock file; usually the runtime store's state dir.
    pub state_dir: PathBuf,
    pub runtime: Arc<dyn RuntimeControl>,
    pub progress: Arc<dyn ProgressCallback>,
    pub abort: CancelToken,
    pub vault: Option<Arc<dyn Vault>>,
    pub lens: Option<Arc<dyn Lens>>,
    pub make_session: SessionFactory,
}

/// Heartbeat cadence while a run holds the lock.
const HEARTBEAT_EVERY: Duration = Duration::from_secs(5);
/// Abort propagation cadence during an active attempt.
const ABORT_POLL: Duration = Duration::from_millis(250);
/// Runtime preflight budget.
const PREFLIGHT_TIMEOUT: Duration = Duration::from_secs(120);
/// Task-file excerpt cap in the attempt prompt.
const EXCERPT_MAX_CHARS: usize = 6000;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Entry point
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn run_anton(deps: AntonDeps) -> Result<RunResult> {
    for issue in deps.config.validate() {
        if issue.severity == ih_domain::config::ConfigSeverity::Error {
            return Err(Error::Config(issue.to_string()));
        }
        tracing::warn!(%issue, "config");
    }

    let lock_path = acquire_anton_lock(&deps.state_dir, &deps.task_file, &deps.project_dir)?;

    // Heartbeat keeps the lock fresh and the UI alive.
    let heartbeat = {
        let lock_path = lock_path.clone();
        let progress = deps.progress.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(HEARTBEAT_EVERY).await;
                if let Err(e) = touch_anton_lock(&lock_path) {
                    tracing::warn!(error = %e, "lock heartbeat failed");
                }
                progress.on_heartbeat();
            }
        })
    };

    let result = run_inner(&deps).await;

    heartbeat.abort();
    if let Err(e) = release_anton_lock(&lock_path) {
        tracing::warn!(error = %e, "failed to release anton lock");
    }

    if let Ok(ref run) = result {
        persist_run_result(&deps.task_file, run);
        deps.progress.on_run_complete(run);
    }
    result
}

fn persist_run_result(task_file: &Path, result: &RunResult) {
    let path = task_file.with_extension("anton.json");
    match serde_json::to_string_pretty(result) {
        Ok(json) => {
            if let Err(e) = std::fs::write(&path, json) {
                tracing::warn!(error = %e, "failed to persist run result");
            }
        }
        Err(e) => tracing::warn!(error = %e, "failed to serialize run result"),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Run state
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct RunState {
    started: Instant,
    attempts: Vec<Attempt>,
    preflight_records: Vec<PreflightRecord>,
    retry_counts: HashMap<String, u32>,
    identical_failures: HashMap<String, u32>,
    last_failure_reason: HashMap<String, String>,
    retry_context: HashMap<String, RetryContext>,
    /// Keys excluded from selection because the operator policy said
    /// to move on.
    skipped: HashSet<String>,
    /// Decomposed parents: excluded from selection so their children
    /// become runnable; checked later by ancestor completion.
    decomposed: HashSet<String>,
    preflighted: HashSet<String>,
    completed: usize,
    auto_completed: usize,
    total_tokens: u64,
    total_commits: usize,
    iterations_used: u32,
    pre_completed: usize,
    endpoint: String,
    uses_git: bool,
    baseline_lint_errors: usize,
}

impl RunState {
    fn selection_excluded(&self) -> Vec<String> {
        self.skipped
            .iter()
            .chain(self.decomposed.iter())
            .cloned()
            .collect()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Startup + main loop
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn run_inner(deps: &AntonDeps) -> Result<RunResult> {
    let cfg = deps.config.anton.clone();
    let progress = deps.progress.clone();

    let initial = load_task_file(&deps.task_file)?;
    progress.on_stage(&format!(
        "task file: {} tasks, {} already complete",
        initial.total(),
        initial.completed()
    ));

    let commands = detect_commands(&deps.project_dir, &cfg.commands);
    let uses_git = deps.project_dir.join(".git").exists();

    // Only new lint errors fail verification.
    let baseline_lint_errors = match commands.lint {
        Some(ref lint) => {
            let (_, output) = run_capture(lint, &deps.project_dir, cfg.verify_timeout_sec).await;
            let count = count_lint_errors(&output);
            tracing::info!(count, "lint baseline captured");
            count
        }
        None => 0,
    };

    if !cfg.allow_dirty && uses_git && !git::is_clean(&deps.project_dir).await? {
        return Err(Error::Validation(
            "working tree is dirty — commit or stash your changes, or set anton.allow_dirty".into(),
        ));
    }

    if cfg.branch && uses_git {
        let name = format!("anton-{}", chrono::Utc::now().format("%Y%m%d-%H%M%S"));
        git::create_branch(&deps.project_dir, &name).await?;
    }

    let mut state = RunState {
        started: Instant::now(),
        attempts: Vec::new(),
        preflight_records: Vec::new(),
        retry_counts: HashMap::new(),
        identical_failures: HashMap::new(),
        last_failure_reason: HashMap::new(),
        retry_context: HashMap::new(),
        skipped: HashSet::new(),
        decomposed: HashSet::new(),
        preflighted: HashSet::new(),
        completed: 0,
        auto_completed: 0,
        total_tokens: 0,
        total_commits: 0,
        iterations_used: 0,
        pre_completed: initial.completed(),
        endpoint: String::new(),
        uses_git,
        baseline_lint_errors,
    };

    if cfg.dry_run {
        let runnable = initial.find_runnable_pending_tasks(&[]);
        progress.on_stage(&format!("dry run: {} runnable task(s)", runnable.len()));
        for task in &runnable {
            progress.on_stage(&format!("  would run: {}", task.text));
        }
        return Ok(finish(&state, &initial, None, &cfg));
    }

    // Runtime preflight: no point burning tokens against a dead
    // endpoint.
    progress.on_stage("preflight: ensuring runtime readiness");
    let preflight_started = Instant::now();
    let endpoint = tokio::time::timeout(PREFLIGHT_TIMEOUT, deps.runtime.ensure_ready(false))
        .await
        .map_err(|_| Error::Timeout("runtime preflight exceeded 120s".into()))??;
    state.preflight_records.push(PreflightRecord {
        task_key: None,
        stage: "runtime-preflight".into(),
        ok: true,
        detail: endpoint.clone(),
        duration_ms: preflight_started.elapsed().as_millis() as u64,
    });
    state.endpoint = endpoint;
    progress.on_stage(&format!("runtime ready at {}", state.endpoint));

    // ── Main loop ───────────────────────────────────────────────────
    let stop_override = loop {
        let parsed = load_task_file(&deps.task_file)?;
        let excluded = state.selection_excluded();
        let runnable: Vec<Task> = parsed
            .find_runnable_pending_tasks(&excluded)
            .into_iter()
            .cloned()
            .collect();
        if runnable.is_empty() {
            break None;
        }

        // Stop conditions, strictly in this order.
        if deps.abort.is_cancelled() {
            break Some(StopReason::Abort);
        }
        if state.iterations_used >= cfg.max_iterations {
            break Some(StopReason::MaxIterations);
        }
        if state.started.elapsed().as_secs() >= cfg.total_timeout_sec {
            break Some(StopReason::TotalTimeout);
        }
        if state.total_tokens >= cfg.max_total_tokens {
            break Some(StopReason::TokenBudget);
        }
        if parsed.total() > cfg.max_total_tasks {
            break Some(StopReason::MaxTasksExceeded);
        }

        let task = runnable[0].clone();
        state.iterations_used += 1;
        let retries = state.retry_counts.get(&task.key).copied().unwrap_or(0);

        // Caps: identical failures, then retry budget.
        let identical = state
            .identical_failures
            .get(&task.key)
            .copied()
            .unwrap_or(0);
        if identical >= cfg.max_identical_failures || retries >= cfg.max_retries_per_task {
            let reason = if identical >= cfg.max_identical_failures {
                format!("{identical} identical failures")
            } else {
                format!("retry budget exhausted ({retries})")
            };
            if cfg.skip_on_fail {
                progress.on_task_skip(&task, &reason);
                let _ = append_task_note(&deps.task_file, &task.key, &format!("skipped: {reason}"));
                state.skipped.insert(task.key.clone());
                continue;
            }
            tracing::error!(task = %task.text, %reason, "fatal: skip_on_fail disabled");
            break None;
        }

        // Two-stage preflight before the first attempt of a task.
        if retries == 0 && cfg.preflight.enabled && !state.preflighted.contains(&task.key) {
            state.preflighted.insert(task.key.clone());
            if run_task_preflight(deps, &mut state, &task).await? {
                // Discovery says it is already done.
                continue;
            }
        }

        // Build the attempt prompt with trimmed retry context.
        let excerpt = excerpt_of(&deps.task_file)?;
        let plan_content = read_plan_file(&deps.task_file);
        let parts = PromptParts {
            task: &task,
            task_file_excerpt: &excerpt,
            plan_file: plan_content.as_deref(),
            retry: state.retry_context.get(&task.key).cloned(),
        };
        let prompt = match build_attempt_prompt(&parts, cfg.max_prompt_tokens_per_attempt) {
            Ok(p) => p,
            Err(e) => {
                let attempt = Attempt {
                    task_key: task.key.clone(),
                    task_text: task.text.clone(),
                    attempt: retries + 1,
                    duration_ms: 0,
                    tokens_used: 0,
                    status: AttemptStatus::Error,
                    verification: None,
                    error: Some(e.to_string()),
                    commit_hash: None,
                };
                progress.on_task_end(&task, &attempt);
                state.attempts.push(attempt);
                // No retry can shrink the prompt.
                state
                    .retry_counts
                    .insert(task.key.clone(), cfg.max_retries_per_task);
                continue;
            }
        };

        // ── One attempt ─────────────────────────────────────────────
        let attempt_no = retries + 1;
        progress.on_task_start(&task, attempt_no);
        let attempt_started = Instant::now();

        let baseline_untracked = if cfg.rollback_on_fail && state.uses_git {
            git::untracked_files(&deps.project_dir).await.unwrap_or_default()
        } else {
            Vec::new()
        };

        let (ask_result, tokens) = run_attempt(deps, &mut state, &task, &prompt).await;
        state.total_tokens += tokens;

        let mut attempt = Attempt {
            task_key: task.key.clone(),
            task_text: task.text.clone(),
            attempt: attempt_no,
            duration_ms: attempt_started.elapsed().as_millis() as u64,
            tokens_used: tokens,
            status: AttemptStatus::Error,
            verification: None,
            error: None,
            commit_hash: None,
        };

        match ask_result {
            Err(e) => {
                let kind = e.failure_kind();
                attempt.error = Some(e.to_string());
                attempt.status = match kind {
                    FailureKind::Timeout => AttemptStatus::Timeout,
                    _ => AttemptStatus::Error,
                };
                match kind {
                    FailureKind::PromptBudgetExceeded | FailureKind::AttemptTokenBudgetExceeded => {
                        state
                            .retry_counts
                            .insert(task.key.clone(), cfg.max_retries_per_task);
                    }
                    FailureKind::Cancelled => {
                        // Loop top turns this into StopReason::Abort.
                    }
                    _ => {
                        *state.retry_counts.entry(task.key.clone()).or_insert(0) += 1;
                    }
                }
                if cfg.rollback_on_fail && state.uses_git {
                    let _ = git::rollback(&deps.project_dir, &baseline_untracked).await;
                }
            }
            Ok(outcome) => match parse_agent_reply(&outcome.text) {
                AgentVerdict::Decompose(subtasks) => {
                    handle_decompose(deps, &cfg, &mut state, &task, subtasks, &parsed, &mut attempt)?;
                }
                AgentVerdict::Blocked(reason) => {
                    attempt.status = AttemptStatus::Blocked;
                    attempt.error = Some(reason.clone());
                    let _ = append_task_note(&deps.task_file, &task.key, &format!("blocked: {reason}"));
                    // Blocked never retries.
                    state
                        .retry_counts
                        .insert(task.key.clone(), cfg.max_retries_per_task);
                }
                AgentVerdict::Failed(reason) => {
                    attempt.status = AttemptStatus::Failed;
                    attempt.error = Some(reason.clone());
                    *state.retry_counts.entry(task.key.clone()).or_insert(0) += 1;
                    state.retry_context.insert(
                        task.key.clone(),
                        RetryContext {
                            attempt: attempt_no,
                            failure_summary: reason,
                            command_output: String::new(),
                        },
                    );
                    if cfg.rollback_on_fail && state.uses_git {
                        let _ = git::rollback(&deps.project_dir, &baseline_untracked).await;
                    }
                }
                AgentVerdict::Done => {
                    verify_and_finish(
                        deps,
                        &cfg,
                        &mut state,
                        &task,
                        attempt_no,
                        &baseline_untracked,
                        &mut attempt,
                    )
                    .await?;
                }
            },
        }

        // Identical-failure tracking.
        if attempt.status.is_failure() {
            let reason = attempt
                .error
                .clone()
                .or_else(|| attempt.verification.as_ref().map(|v| v.summary.clone()))
                .unwrap_or_default();
            let prior = state.last_failure_reason.get(&task.key);
            let streak = if prior == Some(&reason) {
                state.identical_failures.get(&task.key).copied().unwrap_or(0) + 1
            } else {
                1
            };
            state.identical_failures.insert(task.key.clone(), streak);
            state.last_failure_reason.insert(task.key.clone(), reason);
        } else {
            state.identical_failures.remove(&task.key);
            state.last_failure_reason.remove(&task.key);
        }

        progress.on_task_end(&task, &attempt);
        let status = attempt.status;
        state.attempts.push(attempt);

        // Step-13 break rules.
        if status == AttemptStatus::Blocked {
            if cfg.skip_on_blocked {
                state.skipped.insert(task.key.clone());
            } else {
                break None;
            }
        }
        if status.is_failure() && status != AttemptStatus::Blocked {
            let exhausted = state.retry_counts.get(&task.key).copied().unwrap_or(0)
                >= cfg.max_retries_per_task;
            if exhausted && !cfg.skip_on_fail {
                break None;
            }
        }
    };

    let final_parse = load_task_file(&deps.task_file)?;
    Ok(finish(&state, &final_parse, stop_override, &cfg))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Attempt execution (session + abort poll + recovery)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn attempt_session(
    deps: &AntonDeps,
    endpoint: &str,
    slim: bool,
    max_iterations: u32,
) -> AgentSession {
    let cfg = &deps.config.anton;
    let spec = SessionSpec {
        endpoint: endpoint.to_string(),
        model_id: cfg.model_id.clone(),
        system_prompt: format!(
            "You are Anton, an autonomous coding agent working in {}. \
             Make focused changes with the available tools; never touch unrelated code.",
            deps.project_dir.display()
        ),
        slim,
        max_iterations,
        prompt_budget: cfg.max_prompt_tokens_per_attempt,
    };
    let mut session = (deps.make_session)(&spec);
    if let Some(ref vault) = deps.vault {
        session = session.with_vault(vault.clone());
    }
    if let Some(ref lens) = deps.lens {
        session = session.with_lens(lens.clone());
    }
    session
}

fn attempt_hooks(deps: &AntonDeps, task: &Task) -> SessionHooks {
    let progress = deps.progress.clone();
    let task_for_loop = task.clone();
    let progress2 = deps.progress.clone();
    let task_for_compact = task.clone();
    SessionHooks {
        on_tool_loop: Some(Box::new(move |signal| {
            progress.on_tool_loop(&task_for_loop, signal);
        })),
        on_compaction: Some(Box::new(move |report| {
            progress2.on_compaction(
                &task_for_compact,
                report.dropped_messages,
                report.freed_tokens,
            );
        })),
        ..Default::default()
    }
}

/// Run one attempt: fresh session, 250 ms abort propagation, the task
/// timeout, one runtime recovery, and tool-loop auto-continue.
async fn run_attempt(
    deps: &AntonDeps,
    state: &mut RunState,
    task: &Task,
    prompt: &str,
) -> (Result<ih_session::AskOutcome>, u64) {
    let cfg = &deps.config.anton;
    let mut tokens: u64 = 0;
    let mut recovered = false;
    let mut auto_continues = 0u32;

    'attempt: loop {
        let mut session =
            attempt_session(deps, &state.endpoint, false, deps.config.session.max_iterations);
        let hooks = attempt_hooks(deps, task);

        let cancel_handle = session.cancel_token();
        let abort = deps.abort.clone();
        let poller = tokio::spawn(async move {
            loop {
                if abort.is_cancelled() {
                    cancel_handle.cancel();
                    return;
                }
                tokio::time::sleep(ABORT_POLL).await;
            }
        });

        let mut ask_prompt = prompt.to_string();
        let result = loop {
            let timed = tokio::time::timeout(
                Duration::from_secs(cfg.task_timeout_sec),
                session.ask(&ask_prompt, &hooks),
            )
            .await;

            match timed {
                Err(_) => {
                    session.cancel();
                    break Err(Error::Timeout(format!(
                        "attempt exceeded {}s",
                        cfg.task_timeout_sec
                    )));
                }
                Ok(Ok(outcome)) => {
                    tokens += outcome.usage.total_tokens as u64;
                    break Ok(outcome);
                }
                Ok(Err(e)) => {
                    // Tool-loop break: nudge the same session forward.
                    let is_tool_loop = e.to_string().contains("tool-loop circuit breaker");
                    if is_tool_loop
                        && cfg.tool_loop_auto_continue.enabled
                        && auto_continues < cfg.tool_loop_auto_continue.max_retries
                    {
                        auto_continues += 1;
                        tracing::info!(auto_continues, "tool loop break; auto-continuing");
                        ask_prompt = "The previous approach looped. Continue the task with a \
                                      different approach; do not repeat earlier tool calls."
                            .into();
                        continue;
                    }
                    break Err(e);
                }
            }
        };
        poller.abort();

        if let Err(ref e) = result {
            let kind = e.failure_kind();
            if matches!(kind, FailureKind::InfraDown | FailureKind::Loading) && !recovered {
                recovered = true;
                let force = kind == FailureKind::InfraDown;
                let recovery_started = Instant::now();
                let recovery = deps.runtime.ensure_ready(force).await;
                let ok = recovery.is_ok();
                state.preflight_records.push(PreflightRecord {
                    task_key: Some(task.key.clone()),
                    stage: "runtime-recovery".into(),
                    ok,
                    detail: match &recovery {
                        Ok(endpoint) => format!("force_restart={force}, endpoint={endpoint}"),
                        Err(err) => err.to_string(),
                    },
                    duration_ms: recovery_started.elapsed().as_millis() as u64,
                });
                if ok {
                    // Same attempt, fresh session, no retry counted.
                    tracing::info!(force, "runtime recovered; retrying attempt");
                    continue 'attempt;
                }
            }
        }

        return (result, tokens);
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Verdict handlers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn handle_decompose(
    deps: &AntonDeps,
    cfg: &ih_domain::config::AntonConfig,
    state: &mut RunState,
    task: &Task,
    subtasks: Vec<String>,
    parsed: &TaskFile,
    attempt: &mut Attempt,
) -> Result<()> {
    let depth_ok = (task.depth as u32) < cfg.max_decompose_depth;
    if !cfg.decompose || !depth_ok {
        attempt.status = AttemptStatus::Blocked;
        attempt.error = Some(if cfg.decompose {
            format!("decomposition depth limit ({}) reached", cfg.max_decompose_depth)
        } else {
            "decomposition is disabled".into()
        });
        state
            .retry_counts
            .insert(task.key.clone(), cfg.max_retries_per_task);
        return Ok(());
    }
    if parsed.total() + subtasks.len() > cfg.max_total_tasks {
        attempt.status = AttemptStatus::Blocked;
        attempt.error = Some(format!(
            "decomposing into {} subtasks would exceed max_total_tasks ({})",
            subtasks.len(),
            cfg.max_total_tasks
        ));
        state
            .retry_counts
            .insert(task.key.clone(), cfg.max_retries_per_task);
        return Ok(());
    }

    let inserted = insert_sub_tasks(&deps.task_file, &task.key, &subtasks)?;
    tracing::info!(task = %task.text, count = inserted.len(), "task decomposed");
    attempt.status = AttemptStatus::Decomposed;
    state.decomposed.insert(task.key.clone());
    Ok(())
}

async fn verify_and_finish(
    deps: &AntonDeps,
    cfg: &ih_domain::config::AntonConfig,
    state: &mut RunState,
    task: &Task,
    attempt_no: u32,
    baseline_untracked: &[String],
    attempt: &mut Attempt,
) -> Result<()> {
    let commands = detect_commands(&deps.project_dir, &cfg.commands);
    let diff = if state.uses_git {
        git::diff_head(&deps.project_dir).await.unwrap_or_default()
    } else {
        String::new()
    };

    let mut review_session = if cfg.ai_review {
        Some(attempt_session(
            deps,
            &state.endpoint,
            true,
            deps.config.session.max_iterations,
        ))
    } else {
        None
    };

    let request = VerifyRequest {
        commands: &commands,
        project_dir: &deps.project_dir,
        baseline_lint_errors: state.baseline_lint_errors,
        timeout: Duration::from_secs(cfg.verify_timeout_sec),
        diff: &diff,
    };
    let verification = run_verification(&request, review_session.as_mut()).await;
    deps.progress.on_verification(task, &verification);

    if verification.passed {
        if cfg.auto_commit && state.uses_git && !git::is_clean(&deps.project_dir).await? {
            let message = format!("anton: {}", task.text);
            match git::commit_all(&deps.project_dir, &message).await {
                Ok(hash) => {
                    attempt.commit_hash = Some(hash);
                    state.total_commits += 1;
                }
                Err(e) => tracing::warn!(error = %e, "auto-commit failed"),
            }
        }
        mark_task_checked(&deps.task_file, &task.key)?;
        auto_complete_ancestors(&deps.task_file, &task.key)?;
        state.completed += 1;
        state.retry_context.remove(&task.key);
        attempt.status = AttemptStatus::Passed;
    } else {
        attempt.status = AttemptStatus::Failed;
        *state.retry_counts.entry(task.key.clone()).or_insert(0) += 1;
        state.retry_context.insert(
            task.key.clone(),
            RetryContext {
                attempt: attempt_no,
                failure_summary: verification.summary.clone(),
                command_output: verification.command_output.clone(),
            },
        );
        if cfg.rollback_on_fail && state.uses_git {
            let _ = git::rollback(&deps.project_dir, baseline_untracked).await;
        }
    }
    attempt.verification = Some(verification);
    Ok(())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Task preflight (discovery + requirements review)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Returns true when discovery found the task already done (it has
/// been checked off).
async fn run_task_preflight(
    deps: &AntonDeps,
    state: &mut RunState,
    task: &Task,
) -> Result<bool> {
    let cfg = &deps.config.anton;

    // Stage 1: discovery.
    let discovery_prompt = format!(
        "Inspect the project and decide whether this task is already implemented:\n\n{}\n\n\
         Reply with exactly ALREADY_DONE or NOT_DONE on the first line, then one sentence of evidence.",
        task.text
    );
    let (ok, text, tokens) =
        run_preflight_stage(deps, &state.endpoint, "discovery", &discovery_prompt).await;
    state.total_tokens += tokens;
    state.preflight_records.push(PreflightRecord {
        task_key: Some(task.key.clone()),
        stage: "discovery".into(),
        ok,
        detail: first_line(&text),
        duration_ms: 0,
    });

    if ok && parse_discovery_reply(&text) {
        mark_task_checked(&deps.task_file, &task.key)?;
        auto_complete_ancestors(&deps.task_file, &task.key)?;
        state.auto_completed += 1;
        deps.progress
            .on_task_skip(task, "discovery: already implemented");
        return Ok(true);
    }

    // Stage 2: requirements review maintains the plan file.
    let existing_plan = read_plan_file(&deps.task_file).unwrap_or_default();
    let review_prompt = format!(
        "Produce a short implementation plan for this task (refine the existing notes if useful):\n\n\
         Task: {}\n\nExisting notes:\n{}\n\nReply with the plan only.",
        task.text, existing_plan
    );
    let (ok, text, tokens) =
        run_preflight_stage(deps, &state.endpoint, "requirements-review", &review_prompt).await;
    state.total_tokens += tokens;
    if ok && !text.trim().is_empty() {
        let plan_path = plan_file_path(&deps.task_file);
        if let Err(e) = std::fs::write(&plan_path, text.trim()) {
            tracing::warn!(error = %e, "failed to write plan file");
        }
    }
    state.preflight_records.push(PreflightRecord {
        task_key: Some(task.key.clone()),
        stage: "requirements-review".into(),
        ok,
        detail: String::new(),
        duration_ms: 0,
    });

    Ok(false)
}

/// Run a slim preflight session with its own retry budget; the
/// iteration cap is raised when the session runs out of turns.
async fn run_preflight_stage(
    deps: &AntonDeps,
    endpoint: &str,
    stage: &str,
    prompt: &str,
) -> (bool, String, u64) {
    let cfg = &deps.config.anton.preflight;
    let mut iteration_cap = cfg.session_iterations;
    let mut tokens: u64 = 0;
    let mut last_error = String::new();

    for attempt in 0..=cfg.max_retries {
        if deps.abort.is_cancelled() {
            return (false, "aborted".into(), tokens);
        }
        let mut session = attempt_session(deps, endpoint, true, iteration_cap);
        let timed = tokio::time::timeout(
            Duration::from_secs(cfg.timeout_sec),
            session.ask(prompt, &SessionHooks::default()),
        )
        .await;

        match timed {
            Ok(Ok(outcome)) => {
                tokens += outcome.usage.total_tokens as u64;
                return (true, outcome.text, tokens);
            }
            Ok(Err(e)) => {
                last_error = e.to_string();
                if last_error.contains("max iterations exceeded")
                    && iteration_cap < cfg.iteration_cap_ceiling
                {
                    iteration_cap = (iteration_cap * 2).min(cfg.iteration_cap_ceiling);
                    tracing::info!(stage, iteration_cap, "raising preflight iteration cap");
                }
            }
            Err(_) => {
                last_error = format!("{stage} timed out after {}s", cfg.timeout_sec);
            }
        }
        tracing::warn!(stage, attempt, error = %last_error, "preflight stage retry");
    }
    (false, last_error, tokens)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn load_task_file(path: &Path) -> Result<TaskFile> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        Error::Validation(format!(
            "cannot read task file {} ({e}) — create it or fix the path",
            path.display()
        ))
    })?;
    Ok(parse_task_file(&text, path))
}

fn excerpt_of(path: &Path) -> Result<String> {
    let text = std::fs::read_to_string(path)?;
    if text.len() <= EXCERPT_MAX_CHARS {
        return Ok(text);
    }
    let boundary = (0..=EXCERPT_MAX_CHARS)
        .rev()
        .find(|&i| text.is_char_boundary(i))
        .unwrap_or(0);
    Ok(format!("{}\n[task file truncated]", &text[..boundary]))
}

fn plan_file_path(task_file: &Path) -> PathBuf {
    task_file.with_extension("plan.md")
}

fn read_plan_file(task_file: &Path) -> Option<String> {
    std::fs::read_to_string(plan_file_path(task_file)).ok()
}

fn first_line(s: &str) -> String {
    s.lines().next().unwrap_or("").to_string()
}

async fn run_capture(cmd: &str, dir: &Path, timeout_sec: u64) -> (bool, String) {
    let mut command = tokio::process::Command::new("sh");
    command
        .arg("-c")
        .arg(cmd)
        .current_dir(dir)
        .stdin(std::process::Stdio::null())
        .kill_on_drop(true);
    let run = async {
        match command.output().await {
            Ok(out) => {
                let mut text = String::from_utf8_lossy(&out.stdout).into_owned();
                text.push_str(&String::from_utf8_lossy(&out.stderr));
                (out.status.success(), text)
            }
            Err(e) => (false, e.to_string()),
        }
    };
    tokio::time::timeout(Duration::from_secs(timeout_sec), run)
        .await
        .unwrap_or((false, "timed out".into()))
}

/// Assemble the terminal result. `stop_override` carries a budget/abort
/// reason detected at the loop top; otherwise the reason is derived
/// from the final state.
fn finish(
    state: &RunState,
    parsed: &TaskFile,
    stop_override: Option<StopReason>,
    cfg: &ih_domain::config::AntonConfig,
) -> RunResult {
    let failed = RunResult::count_final_failures(&state.attempts);
    let remaining = parsed.pending();
    let stop_reason = stop_override.unwrap_or_else(|| {
        if failed > 0 && !cfg.skip_on_fail {
            StopReason::FatalError
        } else {
            StopReason::AllDone
        }
    });

    RunResult {
        total_tasks: parsed.total(),
        pre_completed: state.pre_completed,
        completed: state.completed,
        auto_completed: state.auto_completed,
        skipped: state.skipped.len(),
        failed,
        remaining,
        attempts: state.attempts.clone(),
        preflight_records: state.preflight_records.clone(),
        total_duration_ms: state.started.elapsed().as_millis() as u64,
        total_tokens: state.total_tokens,
        total_commits: state.total_commits,
        completed_all: remaining == 0,
        stop_reason,
    }
}
