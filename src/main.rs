use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;

use sitegen::core::TaskGraph;
use sitegen::models::{
    FallbackRequest, ModelClient, ModelClientFactory, ModelError, ModelPoolManager, ModelRole,
};
use sitegen::orchestration::{
    EchoHandler, ExecutorRegistry, HandlerRegistry, Scheduler, TaskEvent,
};
use sitegen::{util, Config, Error, Plan, PlanSpec, Result};

/// sitegen - dependency-graph task runner for site generation pipelines
#[derive(Parser, Debug)]
#[command(name = "sitegen")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    SITEGEN_DEBUG=1   Enable debug logging (alternative to --debug)\n    RUST_LOG          Full tracing filter, overrides both")]
pub struct Cli {
    /// Enable debug logging on stderr
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    /// Config file (default: ~/.sitegen/sitegen.toml)
    #[arg(short = 'c', long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Validate a plan file and print its dependency waves
    Check {
        /// Plan JSON file
        plan: PathBuf,
    },

    /// Execute a plan with the built-in echo handler, printing events as JSON lines
    Run {
        /// Plan JSON file
        plan: PathBuf,

        /// Override scheduler.max_concurrent_tasks
        #[arg(long)]
        max_concurrent: Option<usize>,

        /// Override scheduler.task_timeout_seconds
        #[arg(long)]
        timeout: Option<u64>,

        /// Simulated work per task, in milliseconds
        #[arg(long, default_value_t = 0)]
        delay_ms: u64,
    },

    /// Print the ordered candidate models for a role
    Models {
        /// classifier, writer, expander, validator or style_refiner
        role: ModelRole,

        #[arg(long)]
        product_type: Option<String>,

        #[arg(long)]
        preferred: Option<String>,

        /// Required capability (repeatable)
        #[arg(long = "capability")]
        capabilities: Vec<String>,
    },

    /// Print the effective configuration as TOML
    Config {
        /// Also write it to the config path
        #[arg(long)]
        write: bool,
    },
}

impl Command {
    /// Whether the command reads the config file. `check` works without a
    /// home directory.
    pub fn needs_config(&self) -> bool {
        !matches!(self, Command::Check { .. })
    }
}

/// Load from `--config` when given, else from the default path.
fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    sitegen::log::init(cli.debug);
    let config_path = cli.config.as_deref();
    let config = if cli.command.needs_config() {
        load_config(config_path)?
    } else {
        Config::default()
    };

    match cli.command {
        Command::Check { plan } => run_check(&plan),
        Command::Run {
            plan,
            max_concurrent,
            timeout,
            delay_ms,
        } => {
            let mut config = config;
            if let Some(n) = max_concurrent {
                config.scheduler.max_concurrent_tasks = n;
            }
            if let Some(secs) = timeout {
                config.scheduler.task_timeout_seconds = secs;
            }
            let rt = tokio::runtime::Runtime::new()?;
            let complete = rt.block_on(run_plan(plan, config, Duration::from_millis(delay_ms)))?;
            if !complete {
                std::process::exit(2);
            }
            Ok(())
        }
        Command::Models {
            role,
            product_type,
            preferred,
            capabilities,
        } => run_models(config, role, product_type, preferred, capabilities),
        Command::Config { write } => {
            print!("{}", toml::to_string_pretty(&config)?);
            if write {
                match config_path {
                    Some(path) => {
                        config.save_to(path)?;
                        eprintln!("wrote {}", path.display());
                    }
                    None => {
                        config.save()?;
                        eprintln!("wrote {}", Config::config_path()?.display());
                    }
                }
            }
            Ok(())
        }
    }
}

fn load_plan(path: &Path) -> Result<Plan> {
    let spec = PlanSpec::load(path)?;
    let default_retries = Config::default().scheduler.max_retries;
    Plan::build(spec, default_retries)
}

/// Validate a plan and show which tasks can run together.
fn run_check(path: &Path) -> Result<()> {
    let plan = load_plan(path)?;
    let graph: TaskGraph = plan.graph()?;

    println!(
        "plan ok: {} tasks, {} dependencies",
        graph.task_count(),
        graph.dependency_count()
    );
    for (i, wave) in graph.waves().iter().enumerate() {
        let ids: Vec<&str> = wave.iter().map(|id| id.as_str()).collect();
        println!("  wave {}: {}", i + 1, ids.join(", "));
    }
    Ok(())
}

async fn run_plan(path: PathBuf, config: Config, delay: Duration) -> Result<bool> {
    let spec = util::blocking(move || PlanSpec::load(&path)).await?;
    let plan = Plan::build(spec, config.scheduler.max_retries)?;
    let handlers = HandlerRegistry::uniform(Arc::new(EchoHandler::with_delay(delay)));
    let scheduler = Arc::new(Scheduler::new(plan, handlers, config.scheduler.clone())?);
    let plan_id = scheduler.plan_id();

    let registry = Arc::new(ExecutorRegistry::new());
    let (tx, mut rx) = mpsc::channel::<TaskEvent>(config.scheduler.event_buffer.max(1));

    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match serde_json::to_string(&event) {
                Ok(line) => println!("{}", line),
                Err(e) => tracing::warn!(error = %e, "failed to encode event"),
            }
        }
    });

    let interrupt = {
        let registry = registry.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("interrupt received, cancelling plan {}", plan_id.short());
                registry.cancel(&plan_id);
            }
        })
    };

    let summary = registry.run(scheduler, tx).await;
    interrupt.abort();
    printer
        .await
        .map_err(|e| Error::TaskJoin(e.to_string()))?;
    let summary = summary?;

    eprintln!(
        "plan {}: {} done, {} failed, {} blocked, {} skipped in {:.2}s{}",
        summary.plan_id.short(),
        summary.done,
        summary.failed,
        summary.blocked,
        summary.skipped,
        summary.duration.as_secs_f64(),
        if summary.cancelled { " (cancelled)" } else { "" }
    );
    Ok(summary.is_complete())
}

/// Factory for commands that only inspect the pool and never call a model.
struct NoTransport;

impl ModelClientFactory for NoTransport {
    fn create(&self, model_id: &str) -> std::result::Result<Arc<dyn ModelClient>, ModelError> {
        Err(ModelError::Other(format!(
            "no transport configured for {}",
            model_id
        )))
    }
}

fn run_models(
    config: Config,
    role: ModelRole,
    product_type: Option<String>,
    preferred: Option<String>,
    capabilities: Vec<String>,
) -> Result<()> {
    let pool = ModelPoolManager::new(config.models, Arc::new(NoTransport));
    let mut request = FallbackRequest::new(role);
    request.product_type = product_type;
    request.preferred_model = preferred;
    request.required_capabilities = capabilities;
    let candidates = pool.candidates(&request);

    if candidates.is_empty() {
        println!("no candidates for role {}", role);
        return Ok(());
    }
    for (i, candidate) in candidates.iter().enumerate() {
        match &candidate.product_type {
            Some(scope) => println!("{}. {} [{}]", i + 1, candidate.model_id, scope),
            None => println!("{}. {}", i + 1, candidate.model_id),
        }
    }
    Ok(())
}
