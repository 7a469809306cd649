//! The `metarelay` binary: relay webhook events from the cloud store to
//! local handler commands.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use tokio::sync::watch;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

use metarelay_cloud::SupabaseCloudClient;
use metarelay_core::{load_config, redact, EventStore};
use metarelay_dispatch::ProcessDispatcher;
use metarelay_handlers::HandlerRegistry;
use metarelay_runtime::Daemon;
use metarelay_store::SqliteEventStore;

const EXIT_CONFIG: u8 = 1;
const EXIT_RUNTIME: u8 = 2;

#[derive(Debug, Parser)]
#[command(
    name = "metarelay",
    about = "Webhook event relay: bridges a cloud event stream to local handler commands",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Debug, Subcommand)]
enum CliCommand {
    /// Start the relay daemon (foreground).
    Start(RunArgs),
    /// One-shot catch-up sync, no live subscription.
    Sync(RunArgs),
    /// Show per-repo cursor positions.
    Status {
        #[arg(
            short = 'c',
            long = "config",
            help = "Path to config file (default: ~/.metarelay/config.yaml)"
        )]
        config: Option<PathBuf>,
    },
}

#[derive(Debug, Args)]
struct RunArgs {
    #[arg(
        short = 'c',
        long = "config",
        help = "Path to config file (default: ~/.metarelay/config.yaml)"
    )]
    config: Option<PathBuf>,

    #[arg(short = 'v', long, help = "Enable verbose (debug) logging")]
    verbose: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Daemon,
    SyncOnce,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match cli.command {
        CliCommand::Start(args) => run_relay(args, Mode::Daemon).await,
        CliCommand::Sync(args) => run_relay(args, Mode::SyncOnce).await,
        CliCommand::Status { config } => run_status(config.as_deref()),
    }
}

async fn run_relay(args: RunArgs, mode: Mode) -> ExitCode {
    let config = match load_config(args.config.as_deref()) {
        Ok(config) => config,
        Err(error) => {
            eprintln!("error loading config: {error}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };
    init_tracing(args.verbose, &config.log_level);

    let registry = match HandlerRegistry::load(config.handlers.clone()) {
        Ok(registry) => Arc::new(registry),
        Err(error) => {
            eprintln!("error loading handlers: {error}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };
    let cloud = match SupabaseCloudClient::new(&config.cloud.url, &config.cloud.key) {
        Ok(cloud) => Arc::new(cloud),
        Err(error) => {
            eprintln!("error building cloud client: {error}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };
    let store = match SqliteEventStore::open(&config.db_path) {
        Ok(store) => Arc::new(store),
        Err(error) => {
            tracing::error!(%error, "failed to open local event store");
            return ExitCode::from(EXIT_RUNTIME);
        }
    };

    let dispatcher = Arc::new(ProcessDispatcher::new(store.clone(), config.concurrency));
    let daemon = Daemon::new(
        store,
        cloud,
        dispatcher,
        registry,
        config.repos.clone(),
    );

    let result = match mode {
        Mode::SyncOnce => daemon.sync_once().await,
        Mode::Daemon => {
            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            tokio::spawn(async move {
                wait_for_shutdown_signal().await;
                tracing::info!("shutdown signal received");
                let _ = shutdown_tx.send(true);
            });
            tracing::info!(
                repos = config.repos.len(),
                handlers = config.handlers.len(),
                "metarelay daemon starting"
            );
            daemon.run(shutdown_rx).await
        }
    };

    match result {
        Ok(()) => {
            if mode == Mode::SyncOnce {
                println!("Sync complete.");
            }
            ExitCode::SUCCESS
        }
        Err(error) => {
            let summary = redact(&format!("{error:#}"), &[config.cloud.key.as_str()]);
            tracing::error!("{summary}");
            ExitCode::from(EXIT_RUNTIME)
        }
    }
}

fn run_status(config_path: Option<&Path>) -> ExitCode {
    let config = match load_config(config_path) {
        Ok(config) => config,
        Err(error) => {
            eprintln!("error loading config: {error}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };
    let store = match SqliteEventStore::open(&config.db_path) {
        Ok(store) => store,
        Err(error) => {
            eprintln!("error opening event store: {error}");
            return ExitCode::from(EXIT_RUNTIME);
        }
    };

    println!("Metarelay Status");
    println!("{}", "=".repeat(40));
    for repo in &config.repos {
        match store.get_cursor(&repo.name) {
            Ok(Some(cursor)) => println!("  {}: last_event_id={cursor}", repo.name),
            Ok(None) => println!("  {}: no cursor (not yet synced)", repo.name),
            Err(error) => {
                eprintln!("error reading cursor for {}: {error}", repo.name);
                return ExitCode::from(EXIT_RUNTIME);
            }
        }
    }
    ExitCode::SUCCESS
}

fn init_tracing(verbose: bool, log_level: &str) {
    let default_directive: tracing_subscriber::filter::Directive = if verbose {
        LevelFilter::DEBUG.into()
    } else {
        log_level.parse().unwrap_or(LevelFilter::INFO.into())
    };
    let env_filter = EnvFilter::builder()
        .with_default_directive(default_directive)
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .init();
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let Ok(mut term) = signal(SignalKind::terminate()) else {
        let _ = tokio::signal::ctrl_c().await;
        return;
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
