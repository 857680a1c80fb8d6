use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use drawanim_core::config::{config_path, data_dir, initialize_data_dir, AppConfig};
use drawanim_core::logging::{
    self, FileSinkPlan, LoggingInitOptions, RuntimeLogMode, DEFAULT_LOG_FILTER,
};
use drawanim_core::rpc::{render_host_router, RenderHostClient};
use drawanim_core::scheduler::{ProcessPool, Scheduler};
use drawanim_core::server::{app_router, AppState};
use drawanim_core::workspace::Workspace;

#[derive(Parser)]
#[command(
    name = "drawanim",
    about = "Render gateway and render host for animated drawings",
    args_conflicts_with_subcommands = true
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[arg(
        short = 'v',
        long = "verbose",
        action = ArgAction::Count,
        global = true,
        help = "Increase log verbosity (-v: debug, -vv: trace)"
    )]
    verbose: u8,

    #[arg(
        long = "log-filter",
        value_name = "FILTER",
        global = true,
        help = "Explicit tracing filter (overrides RUST_LOG and -v)"
    )]
    log_filter: Option<String>,

    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(flatten)]
    listen: ListenArgs,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the client-facing status WebSocket (the default)
    Gateway(ListenArgs),
    /// Run the job scheduler and render workers behind the RPC endpoint
    RenderHost(ListenArgs),
}

#[derive(Args, Default)]
struct ListenArgs {
    #[arg(short, long)]
    port: Option<u16>,

    #[arg(long)]
    host: Option<String>,
}

pub async fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let (mode, listen) = match cli.command {
        Some(Commands::Gateway(listen)) => (RuntimeLogMode::Gateway, listen),
        Some(Commands::RenderHost(listen)) => (RuntimeLogMode::RenderHost, listen),
        None => (RuntimeLogMode::Gateway, cli.listen),
    };
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());

    init_logging(
        mode,
        Some(resolved_data_dir.as_path()),
        cli.verbose,
        cli.log_filter.as_deref(),
    );
    log_startup_metadata(mode, Some(resolved_data_dir.as_path()));

    let config = load_config(&resolved_data_dir);
    match mode {
        RuntimeLogMode::Gateway => run_gateway(config, listen, resolved_data_dir).await,
        RuntimeLogMode::RenderHost => run_render_host(config, listen).await,
    }
}

#[cfg(test)]
fn select_log_filter(
    noise_base: &str,
    rust_log_env: Option<&str>,
    verbose: u8,
    cli_log_filter: Option<&str>,
) -> String {
    let options = LoggingInitOptions {
        verbose,
        cli_log_filter: cli_log_filter.map(ToString::to_string),
        rust_log_env: rust_log_env.map(ToString::to_string),
        noise_filter: noise_base.to_string(),
        ..Default::default()
    };

    logging::compose_logging_filters(&options).console_filter
}

fn init_logging(
    mode: RuntimeLogMode,
    data_dir: Option<&Path>,
    verbose: u8,
    cli_log_filter: Option<&str>,
) {
    let init_options = LoggingInitOptions {
        mode,
        data_dir: data_dir.map(Path::to_path_buf),
        verbose,
        cli_log_filter: cli_log_filter.map(ToString::to_string),
        rust_log_env: std::env::var("RUST_LOG").ok(),
        ..Default::default()
    };
    let init_plan = logging::compose_logging_init_plan(&init_options);
    let console_filter = init_plan.filters.console_filter;
    let file_filter = init_plan.filters.file_filter;

    match init_plan.file_sink {
        FileSinkPlan::Ready(ready) => {
            let console_env_filter = parse_env_filter_with_fallback(&console_filter, "console");
            let file_env_filter = parse_env_filter_with_fallback(&file_filter, "file");

            let subscriber = tracing_subscriber::registry()
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(std::io::stderr)
                        .with_filter(console_env_filter),
                )
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(ready.appender)
                        .with_filter(file_env_filter),
                );

            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
            }
        }
        FileSinkPlan::Fallback(fallback) => {
            let attempted_log_dir = fallback
                .attempted_log_dir
                .as_ref()
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "<none>".to_string());

            let console_env_filter = parse_env_filter_with_fallback(&console_filter, "console");
            let subscriber = tracing_subscriber::registry().with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_filter(console_env_filter),
            );

            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
                return;
            }

            warn!(
                attempted_log_dir = %attempted_log_dir,
                reason = %fallback.reason,
                "Persistent file logging unavailable; continuing with console-only logging"
            );
        }
    }
}

fn parse_env_filter_with_fallback(filter: &str, sink_name: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_new(filter).unwrap_or_else(|error| {
        eprintln!(
            "Invalid {sink_name} log filter '{filter}': {error}. Falling back to '{DEFAULT_LOG_FILTER}'."
        );
        tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)
    })
}

fn log_startup_metadata(mode: RuntimeLogMode, data_dir: Option<&Path>) {
    let pid = std::process::id();
    if let Some(data_dir) = data_dir {
        let cfg_path = config_path(data_dir);
        info!(
            mode = mode.as_str(),
            pid,
            data_dir = %data_dir.display(),
            config_path = %cfg_path.display(),
            "Runtime startup metadata"
        );
    } else {
        info!(mode = mode.as_str(), pid, "Runtime startup metadata");
    }
}

fn load_config(data_dir: &Path) -> AppConfig {
    if let Err(e) = initialize_data_dir(data_dir) {
        warn!(error = %e, "Failed to initialize data directory");
    }
    let cfg_path = config_path(data_dir);
    match AppConfig::load_from_path(&cfg_path) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %format!("{err:#}"), "Failed to load config file, using defaults");
            AppConfig::default()
        }
    }
}

fn bind_address(listen: ListenArgs, default_host: &str, default_port: u16) -> String {
    let port = listen
        .port
        .or_else(|| std::env::var("PORT").ok().and_then(|v| v.parse().ok()))
        .unwrap_or(default_port);
    let host = listen.host.unwrap_or_else(|| default_host.to_string());
    format!("{host}:{port}")
}

async fn run_gateway(config: AppConfig, listen: ListenArgs, data_dir: PathBuf) -> Result<()> {
    let backend = RenderHostClient::new(&config.render_host.url, &config.rpc)?;
    let workspace = Workspace::new(config.resolved_paths(&data_dir));
    info!(
        render_host = %backend.rpc_url(),
        files_dir = %workspace.files_dir().display(),
        "Gateway configured"
    );

    let state = AppState::new(&config, workspace, Arc::new(backend));
    let app = app_router(state);

    let addr = bind_address(listen, &config.server.host, config.server.port);
    info!(%addr, "Starting drawanim gateway");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind gateway to {addr}"))?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn run_render_host(config: AppConfig, listen: ListenArgs) -> Result<()> {
    let pool = ProcessPool::new(&config.worker);
    let scheduler = Arc::new(Scheduler::new(config.scheduler.clone(), Box::new(pool)));
    let app = render_host_router(scheduler.clone());

    let addr = bind_address(listen, &config.render_host.host, config.render_host.port);
    info!(
        %addr,
        max_concurrent_jobs = config.scheduler.max_concurrent_jobs,
        max_queue_length = config.scheduler.max_queue_length,
        worker = %config.worker.program,
        "Starting drawanim render host"
    );

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "Failed to listen for shutdown signal");
            return;
        }
        info!("Shutdown signal received");
        signal_token.cancel();
    });

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind render host to {addr}"))?;
    let serve_result = axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await;

    // Reap every worker before exiting, whether or not serving failed.
    let stopping = scheduler.clone();
    tokio::task::spawn_blocking(move || stopping.shutdown())
        .await
        .context("scheduler shutdown task failed")?;

    serve_result?;
    Ok(())
}
