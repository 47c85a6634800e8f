//! `idlehands`: thin entry point over the runtime orchestrator and
//! the Anton loop. All real behavior lives in the library crates; this
//! binary only parses arguments, loads config, and wires the pieces.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use ih_anton::progress::ProgressCallback;
use ih_anton::report::{Attempt, RunResult};
use ih_anton::run::{run_anton, AntonDeps, SessionFactory, SessionSpec};
use ih_anton::runtime_control::{OrchestratorRuntime, RuntimeControl};
use ih_anton::verify::Verification;
use ih_domain::config::Config;
use ih_domain::CancelToken;
use ih_runtime::store::redact_registry;
use ih_runtime::RuntimeStore;
use ih_session::{AgentSession, OpenAiCompatClient};
use ih_taskfile::Task;

#[derive(Parser)]
#[command(name = "idlehands", about = "Local-first autonomous coding agent")]
struct Cli {
    /// Path to idlehands.toml (defaults to ./idlehands.toml when present).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run Anton against a markdown task list.
    Run {
        task_file: PathBuf,
        /// Project directory (defaults to the current directory).
        #[arg(long)]
        project: Option<PathBuf>,
        /// Print the plan without touching anything.
        #[arg(long)]
        dry_run: bool,
    },
    /// Runtime orchestrator commands.
    #[command(subcommand)]
    Runtime(RuntimeCommand),
}

#[derive(Subcommand)]
enum RuntimeCommand {
    /// Show the registry (secrets redacted) and the active runtime.
    Status,
    /// Bring a model to readiness.
    Start {
        model_id: String,
        #[arg(long)]
        force_restart: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Command::Run {
            task_file,
            project,
            dry_run,
        } => run_command(config, task_file, project, dry_run).await,
        Command::Runtime(RuntimeCommand::Status) => runtime_status(config),
        Command::Runtime(RuntimeCommand::Start {
            model_id,
            force_restart,
        }) => runtime_start(config, model_id, force_restart).await,
    }
}

fn load_config(path: Option<&std::path::Path>) -> anyhow::Result<Config> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => {
            let default = PathBuf::from("idlehands.toml");
            if !default.exists() {
                return Ok(Config::default());
            }
            default
        }
    };
    let text = std::fs::read_to_string(&path)
        .with_context(|| format!("reading config {}", path.display()))?;
    let config: Config =
        toml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    Ok(config)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// anton run
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn run_command(
    mut config: Config,
    task_file: PathBuf,
    project: Option<PathBuf>,
    dry_run: bool,
) -> anyhow::Result<()> {
    if dry_run {
        config.anton.dry_run = true;
    }
    let project_dir = match project {
        Some(p) => p,
        None => std::env::current_dir()?,
    };

    let store = RuntimeStore::new(&config.runtime);
    let registry = store.load_registry()?;
    let state_dir = store.state_dir().to_path_buf();

    let abort = CancelToken::new();
    {
        // Ctrl-C begins cancellation; the loop notices within 250 ms.
        let abort = abort.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("interrupt received, stopping after the current step");
                abort.cancel();
            }
        });
    }

    let runtime = Arc::new(OrchestratorRuntime::new(
        RuntimeStore::new(&config.runtime),
        registry,
        config.runtime.clone(),
        config.anton.model_id.clone(),
        abort.clone(),
    ));

    let session_config = config.session.clone();
    // Sessions here carry no tool executor: embedders supply one via
    // the library API; the binary alone can still plan, decompose, and
    // verify.
    let make_session: SessionFactory = Arc::new(move |spec: &SessionSpec| {
        let mut session_config = session_config.clone();
        session_config.max_iterations = spec.max_iterations;
        AgentSession::new(
            Arc::new(OpenAiCompatClient::new(spec.endpoint.clone())),
            spec.model_id.clone(),
            spec.system_prompt.clone(),
            session_config,
        )
        .with_prompt_budget(spec.prompt_budget)
    });

    let result = run_anton(AntonDeps {
        config,
        task_file,
        project_dir,
        state_dir,
        runtime,
        progress: Arc::new(TermProgress),
        abort,
        vault: None,
        lens: None,
        make_session,
    })
    .await?;

    println!(
        "\n{} completed, {} auto-completed, {} skipped, {} failed, {} remaining ({:?})",
        result.completed,
        result.auto_completed,
        result.skipped,
        result.failed,
        result.remaining,
        result.stop_reason,
    );
    if !result.completed_all {
        std::process::exit(1);
    }
    Ok(())
}

/// Minimal terminal progress: one line per event.
struct TermProgress;

impl ProgressCallback for TermProgress {
    fn on_stage(&self, msg: &str) {
        println!("» {msg}");
    }
    fn on_task_start(&self, task: &Task, attempt: u32) {
        println!("▶ {} (attempt {attempt})", task.text);
    }
    fn on_task_end(&self, _task: &Task, attempt: &Attempt) {
        println!("  {:?} in {}ms", attempt.status, attempt.duration_ms);
    }
    fn on_task_skip(&self, task: &Task, reason: &str) {
        println!("↷ {}: {reason}", task.text);
    }
    fn on_verification(&self, _task: &Task, verification: &Verification) {
        println!("  verify: {}", verification.summary);
    }
    fn on_run_complete(&self, _result: &RunResult) {}
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// runtime status / start
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn runtime_status(config: Config) -> anyhow::Result<()> {
    let store = RuntimeStore::new(&config.runtime);
    let registry = store.load_registry()?;
    println!("{}", serde_json::to_string_pretty(&redact_registry(&registry))?);
    match store.load_active()? {
        Some(active) => println!(
            "active: {} on {:?} ({}healthy) at {}",
            active.model_id,
            active.host_ids,
            if active.healthy { "" } else { "un" },
            active.endpoint.as_deref().unwrap_or("unknown"),
        ),
        None => println!("active: none"),
    }
    Ok(())
}

async fn runtime_start(config: Config, model_id: String, force_restart: bool) -> anyhow::Result<()> {
    let store = RuntimeStore::new(&config.runtime);
    let registry = store.load_registry()?;
    let runtime = OrchestratorRuntime::new(
        store,
        registry,
        config.runtime.clone(),
        model_id,
        CancelToken::new(),
    );
    let endpoint = runtime.ensure_ready(force_restart).await?;
    println!("ready: {endpoint}");
    Ok(())
}
