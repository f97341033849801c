use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use autobuild::access::declare_dependencies;
use autobuild::backend::{LocalExecutor, Worker};
use autobuild::config::EngineConfig;
use autobuild::engine::Engine;
use autobuild::error::Result;
use autobuild::interface::{BuildInterface, CancelToken};
use autobuild::rule::CallbackRegistry;

#[derive(Parser)]
#[command(name = "autobuild", version, about = "Incremental builds with automatic dependency discovery")]
struct Args {
    /// Log filter, e.g. "info" or "autobuild=debug"
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Bring targets up to date
    Build {
        /// Configuration file, <root>/autobuild.toml by default
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long, default_value = ".")]
        root: PathBuf,
        #[arg(required = true)]
        targets: Vec<String>,
    },
    /// Declare dependencies from inside a running job
    Depend {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },
    /// Execute jobs submitted to a spool directory
    Worker {
        #[arg(long)]
        spool: PathBuf,
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long, default_value = ".")]
        root: PathBuf,
        #[arg(long, default_value_t = 50)]
        poll_ms: u64,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    // jobs calling back into us must not pollute their own output
    if !matches!(args.command, Commands::Depend { .. }) {
        let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("warn"));
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_target(false).with_writer(std::io::stderr))
            .init();
    }
    let outcome = match args.command {
        Commands::Build { config, root, targets } => build(config, root, targets).await,
        Commands::Depend { paths } => declare_dependencies(&paths).map(|_| true),
        Commands::Worker { spool, config, root, poll_ms } => work(spool, config, root, poll_ms).await,
    };
    match outcome {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!(kind = e.kind(), error = %e, "autobuild failed");
            eprintln!("autobuild: {}", e);
            ExitCode::from(2)
        }
    }
}

fn load(config: Option<PathBuf>, root: PathBuf) -> Result<EngineConfig> {
    let mut config = EngineConfig::load(config.as_deref(), &root)?;
    if config.runtime.is_none() {
        config.runtime = std::env::current_exe().ok();
    }
    Ok(config)
}

async fn build(config: Option<PathBuf>, root: PathBuf, targets: Vec<String>) -> Result<bool> {
    let config = load(config, root)?;
    let rules = config.rule_set()?;
    let interface = BuildInterface::new(Engine::open(config, rules)?);
    let handle = interface.submit(targets);
    let report = tokio::select! {
        report = handle.join() => report?,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, cancelling the build");
            interface.cancel_all();
            return Ok(false);
        }
    };
    for target in &report.targets {
        match &target.error {
            Some(e) => println!("{}\t{}\t{}", target.state, target.target, e),
            None => println!("{}\t{}", target.state, target.target),
        }
    }
    println!("{}", report.counts);
    Ok(report.ok())
}

async fn work(spool: PathBuf, config: Option<PathBuf>, root: PathBuf, poll_ms: u64) -> Result<bool> {
    let config = load(config, root)?;
    let executor = LocalExecutor::new(&config.tmp_root(), config.interposer.clone(), config.runtime.clone(), CallbackRegistry::new())?;
    let worker = Worker::new(&spool, executor, Duration::from_millis(poll_ms))?;
    let shutdown = CancelToken::new();
    let stop = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            stop.cancel();
        }
    });
    worker.run(shutdown).await?;
    Ok(true)
}
