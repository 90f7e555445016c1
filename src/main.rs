//! podfork CLI - distributed test runs on Kubernetes.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use podfork::cluster::ClusterClient;
use podfork::cluster::kubectl::KubectlCluster;
use podfork::command::BuildCommand;
use podfork::config::{self, Config, LogLevel};
use podfork::durations::TestDurations;
use podfork::identity::{RunIdentity, task_path};
use podfork::orchestrator::{
    CleanupRegistry, Orchestrator, PreWarmPool, RetryPolicy, WorkerLifecycle, WorkerSettings,
    delete_run_resources, prewarm_spec,
};
use podfork::report;
use podfork::scheduler::{CandidateGroup, ForkPlan, ShardSeed, parse_candidates, plan_forks};

const EXIT_FAILED: u8 = 1;
const EXIT_INTERRUPTED: u8 = 130;

#[derive(Parser)]
#[command(name = "podfork")]
#[command(about = "Distributed test runs on Kubernetes", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "podfork.toml")]
    config: PathBuf,

    /// Verbose output (overrides the configured log level)
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Plan and run the tests on the cluster
    Run {
        #[command(flatten)]
        selection: Selection,

        /// Log level: INFO, WARN, QUIET or DEBUG
        #[arg(long)]
        log_level: Option<LogLevel>,

        /// Echo container output to the console
        #[arg(long)]
        echo: bool,

        /// Hide the progress bar
        #[arg(long)]
        no_progress: bool,
    },

    /// Print what each fork would run without touching the cluster
    Plan {
        #[command(flatten)]
        selection: Selection,

        /// Print the plan as JSON
        #[arg(long)]
        json: bool,
    },

    /// Validate configuration file
    Validate,

    /// Delete pods and volume claims left behind by a build
    Cleanup {
        /// Task keys the run was started for, as in the candidate list
        #[arg(long = "task", required = true)]
        tasks: Vec<String>,

        /// Build id of the run to clean up (defaults to config, then BUILD_ID)
        #[arg(long)]
        build_id: Option<String>,
    },

    /// Maintain the duration store
    Durations {
        #[command(subcommand)]
        action: DurationsAction,
    },
}

#[derive(clap::Args)]
struct Selection {
    /// Candidate list: `task<TAB>prefix` or bare prefixes, one per line
    #[arg(short, long)]
    tests: PathBuf,

    /// Task for lines that name none
    #[arg(long)]
    task: Option<String>,

    /// Override the number of forks
    #[arg(short, long)]
    forks: Option<usize>,
}

#[derive(Subcommand)]
enum DurationsAction {
    /// Fold JUnit XML results into the duration store
    Update {
        /// Directory searched recursively for JUnit XML
        #[arg(long)]
        results: PathBuf,

        /// Duration store CSV (defaults to the configured one)
        #[arg(long)]
        store: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            selection,
            log_level,
            echo,
            no_progress,
        } => {
            let mut config = load(&cli.config, &selection)?;
            if let Some(level) = log_level {
                config.podfork.log_level = level;
            }
            config.podfork.echo_output |= echo;
            init_tracing(&config, cli.verbose)?;
            run(config, &selection, !no_progress).await
        }
        Commands::Plan { selection, json } => {
            let config = load(&cli.config, &selection)?;
            init_tracing(&config, cli.verbose)?;
            let candidates = load_candidates(&selection)?;
            let plan = make_plan(&config, &candidates)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&plan)?);
            } else {
                report::print_plan(&plan);
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Validate => validate_config(&cli.config),
        Commands::Cleanup { tasks, build_id } => {
            let config = config::load_config(&cli.config)?;
            init_tracing(&config, cli.verbose)?;
            cleanup(&config, &tasks, build_id).await
        }
        Commands::Durations {
            action: DurationsAction::Update { results, store },
        } => {
            let store = match store {
                Some(store) => store,
                None => config::load_config(&cli.config)
                    .context("No --store given and no config to read it from")?
                    .distribution
                    .durations_file,
            };
            init_tracing_with(LogLevel::Info, cli.verbose)?;
            update_durations(&[results], &store)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn init_tracing(config: &Config, verbose: bool) -> Result<()> {
    init_tracing_with(config.podfork.log_level, verbose)
}

/// `RUST_LOG` wins over the configured level.
fn init_tracing_with(level: LogLevel, verbose: bool) -> Result<()> {
    let directive = if verbose {
        LogLevel::Debug.directive()
    } else {
        level.directive()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow!("Failed to install tracing subscriber: {}", e))
}

fn load(config_path: &Path, selection: &Selection) -> Result<Config> {
    let mut config = config::load_config(config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;
    if let Some(forks) = selection.forks {
        config.podfork.fork_count = forks;
    }
    config.validate()?;
    Ok(config)
}

fn load_candidates(selection: &Selection) -> Result<Vec<CandidateGroup>> {
    let content = std::fs::read_to_string(&selection.tests)
        .with_context(|| format!("Failed to read {}", selection.tests.display()))?;
    let candidates = parse_candidates(&content, selection.task.as_deref())?;
    info!(
        "Loaded {} candidates from {}",
        candidates.len(),
        selection.tests.display()
    );
    Ok(candidates)
}

fn make_plan(config: &Config, candidates: &[CandidateGroup]) -> Result<ForkPlan> {
    let durations = TestDurations::load_or_empty(&config.distribution.durations_file);
    let seed = ShardSeed {
        external: config.distribution.seed,
        revision: config.distribution.revision.clone(),
    };
    let plan = plan_forks(config.podfork.fork_count, &durations, candidates, &seed)?;
    Ok(plan)
}

fn cluster_for(config: &Config) -> Arc<dyn ClusterClient> {
    Arc::new(
        KubectlCluster::new(&config.cluster.kubectl, &config.cluster.namespace)
            .with_context(config.cluster.context.clone()),
    )
}

async fn run(config: Config, selection: &Selection, show_progress: bool) -> Result<ExitCode> {
    let candidates = load_candidates(selection)?;
    let task = task_path(candidates.iter().map(|c| c.task_key.as_str()));
    let cluster = cluster_for(&config);
    let identity = RunIdentity::from_environment(&task, config.podfork.build_id.as_deref());
    let registry = CleanupRegistry::new();
    let settings = WorkerSettings::from_config(&config);

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        let registry = registry.clone();
        let cluster = Arc::clone(&cluster);
        tokio::spawn(async move {
            shutdown_signal().await;
            warn!("Interrupted, deleting pods");
            cancel.cancel();
            registry.drain(cluster.as_ref()).await;
            std::process::exit(i32::from(EXIT_INTERRUPTED));
        });
    }

    // Capacity is reserved while the plan is computed.
    let pool = if config.prewarm.enabled {
        let spec = prewarm_spec(&identity, &settings, config.prewarm_pods());
        Some(
            PreWarmPool::start(Arc::clone(&cluster), spec, registry.clone())
                .await
                .context("Failed to start pre-warm pool")?,
        )
    } else {
        None
    };

    let plan = make_plan(&config, &candidates)?;

    if let Some(pool) = pool {
        if let Err(e) = pool
            .tear_down(Duration::from_secs(config.prewarm.timeout_secs))
            .await
        {
            warn!("Pre-warm pool did not go away cleanly: {}", e);
        }
    }

    let lifecycle = WorkerLifecycle::new(
        Arc::clone(&cluster),
        identity.clone(),
        settings,
        BuildCommand::from_config(&config),
        registry.clone(),
        RetryPolicy::fixed(config.podfork.retry_attempts),
    );
    let orchestrator = Orchestrator::new(Arc::clone(&cluster), identity, lifecycle)
        .with_cancellation(cancel)
        .with_progress(show_progress);

    let run_report = orchestrator.run(&plan).await;

    report::print_summary(&run_report);
    match report::write_summary_json(&run_report, &config.podfork.output_dir) {
        Ok(path) => info!("Summary written to {}", path.display()),
        Err(e) => warn!("{:#}", e),
    }

    let result_roots = run_report.result_roots(&config.podfork.output_dir);
    if let Err(e) = update_durations(&result_roots, &config.distribution.durations_file) {
        warn!("Could not update duration store: {:#}", e);
    }

    Ok(match run_report.exit_code() {
        0 => ExitCode::SUCCESS,
        130 => ExitCode::from(EXIT_INTERRUPTED),
        _ => ExitCode::from(EXIT_FAILED),
    })
}

/// Resolves on Ctrl-C, or on SIGTERM where there is one.
async fn shutdown_signal() {
    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Could not listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Could not listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = interrupt => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

async fn cleanup(config: &Config, tasks: &[String], build_id: Option<String>) -> Result<ExitCode> {
    let cluster = cluster_for(config);
    let build_id = build_id.or_else(|| config.podfork.build_id.clone());
    let task = task_path(tasks.iter().map(String::as_str));
    let identity = RunIdentity::from_environment(&task, build_id.as_deref());
    info!("Cleaning up run {}", identity.stable_id());

    let deleted = delete_run_resources(cluster.as_ref(), &identity).await;
    println!("Deleted {} resources", deleted);
    Ok(ExitCode::SUCCESS)
}

fn update_durations(roots: &[PathBuf], store: &Path) -> Result<()> {
    let mut durations = TestDurations::load_or_empty(store);
    let added = durations.ingest_junit_dirs(roots.iter().map(PathBuf::as_path));
    durations
        .save(store)
        .with_context(|| format!("Failed to write {}", store.display()))?;
    info!(
        "Recorded {} durations, {} tests in {}",
        added,
        durations.len(),
        store.display()
    );
    Ok(())
}

fn validate_config(config_path: &Path) -> Result<ExitCode> {
    match config::load_config(config_path).and_then(|c| c.validate().map(|_| c)) {
        Ok(config) => {
            println!("Configuration is valid");
            println!("  Image: {}", config.cluster.image);
            println!("  Namespace: {}", config.cluster.namespace);
            println!("  Forks: {}", config.podfork.fork_count);
            println!("  Retry attempts: {}", config.podfork.retry_attempts);
            println!("  Granularity: {}", config.distribution.granularity);
            println!(
                "  Duration store: {}",
                config.distribution.durations_file.display()
            );
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            eprintln!("Configuration error: {:#}", e);
            Ok(ExitCode::from(EXIT_FAILED))
        }
    }
}
