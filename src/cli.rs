//! Command-line interface: thin HTTP clients of the Supervisor control API
//! for `start`/`stop`/`restart`/`status`/`reload`/`logs`, plus a `serve`
//! command that boots the full object graph in-process.
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, level_filters::LevelFilter, warn};

use crate::config;
use crate::constants::{
    CONTROL_PLANE_TIMEOUT, DEFAULT_EVENT_RETENTION, DEFAULT_RECONCILE_INTERVAL,
    DEFAULT_STORE_PORT, DEFAULT_SUPERVISOR_PORT, HTTP_SHUTDOWN_DEADLINE, SHUTDOWN_DEADLINE,
    SUPERVISOR_PORT_ENV,
};
use crate::eventlog::EventPublisher;
use crate::http::{store_router, supervisor_router};
use crate::live_view::LiveView;
use crate::providers::{NullMachinesProvider, NullRoutingProvider};
use crate::reconciler::Reconciler;
use crate::runtime;
use crate::store::Store;
use crate::supervisor::Supervisor;

/// Wrapper so clap can parse `--log-level` from either a name (`info`,
/// `debug`, ...) or one of its numeric shorthands (0-5).
#[derive(Clone, Copy, Debug)]
pub struct LogLevelArg(pub LevelFilter);

impl LogLevelArg {
    /// String form suitable for seeding `RUST_LOG`.
    pub fn as_str(&self) -> &'static str {
        match self.0 {
            LevelFilter::OFF => "off",
            LevelFilter::ERROR => "error",
            LevelFilter::WARN => "warn",
            LevelFilter::INFO => "info",
            LevelFilter::DEBUG => "debug",
            LevelFilter::TRACE => "trace",
        }
    }
}

impl FromStr for LogLevelArg {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if let Ok(number) = trimmed.parse::<u8>() {
            let level = match number {
                0 => LevelFilter::OFF,
                1 => LevelFilter::ERROR,
                2 => LevelFilter::WARN,
                3 => LevelFilter::INFO,
                4 => LevelFilter::DEBUG,
                5 => LevelFilter::TRACE,
                _ => return Err(format!("unsupported log level number '{number}' (expected 0-5)")),
            };
            return Ok(LogLevelArg(level));
        }
        let level = match trimmed.to_ascii_lowercase().as_str() {
            "off" => LevelFilter::OFF,
            "error" | "err" => LevelFilter::ERROR,
            "warn" | "warning" => LevelFilter::WARN,
            "info" => LevelFilter::INFO,
            "debug" => LevelFilter::DEBUG,
            "trace" => LevelFilter::TRACE,
            other => return Err(format!("invalid log level '{other}'")),
        };
        Ok(LogLevelArg(level))
    }
}

/// `orchestra`: a deterministic local/edge service orchestrator.
#[derive(Parser)]
#[command(name = "orchestra", version, about, long_about = None)]
pub struct Cli {
    /// Override the logging verbosity for this invocation only.
    #[arg(long, value_name = "LEVEL", global = true)]
    pub log_level: Option<LogLevelArg>,

    /// Supervisor control API address, e.g. `http://127.0.0.1:28081`.
    /// Defaults to the local supervisor port.
    #[arg(long, global = true)]
    pub supervisor_addr: Option<String>,

    /// The command to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands.
#[derive(Subcommand)]
pub enum Commands {
    /// Boot the full object graph: registry, supervisor, event log,
    /// desired-state store, reconciler, and live view.
    Serve {
        /// Path to the process configuration file (defaults to `systemg.yaml`).
        #[arg(short, long)]
        config: Option<String>,
        /// Path to a desired-state services document, if any.
        #[arg(long)]
        services: Option<String>,
    },
    /// Start a registered process.
    Start {
        /// Process name.
        name: String,
    },
    /// Stop one process, or every process if none is given.
    Stop {
        /// Process name; omit to stop everything.
        name: Option<String>,
    },
    /// Restart a registered process.
    Restart {
        /// Process name.
        name: String,
    },
    /// Show the status of supervised processes.
    Status {
        /// Limit to a single process.
        name: Option<String>,
        /// Emit machine-readable JSON instead of a table.
        #[arg(long)]
        json: bool,
    },
    /// Reload the process registry from its configuration file.
    Reload,
    /// Show recent log lines for a process.
    Logs {
        /// Process name.
        name: String,
        /// Number of lines to show.
        #[arg(short, long, default_value_t = 50)]
        lines: usize,
        /// Lines to skip from the end before taking the tail.
        #[arg(long, default_value_t = 0)]
        offset: i64,
    },
}

/// Parses `std::env::args`.
pub fn parse_args() -> Cli {
    Cli::parse()
}

fn resolve_supervisor_addr(explicit: Option<&str>) -> String {
    if let Some(addr) = explicit {
        return addr.trim_end_matches('/').to_string();
    }
    let port = std::env::var(SUPERVISOR_PORT_ENV)
        .ok()
        .and_then(|v| v.parse::<u16>().ok())
        .unwrap_or(DEFAULT_SUPERVISOR_PORT);
    format!("http://127.0.0.1:{port}")
}

fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(CONTROL_PLANE_TIMEOUT)
        .build()
        .expect("valid http client")
}

/// Dispatches a parsed `Cli` invocation.
pub async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Commands::Serve { config, services } => run_serve(config, services).await,
        Commands::Start { name } => {
            let addr = resolve_supervisor_addr(cli.supervisor_addr.as_deref());
            let response = http_client()
                .post(format!("{addr}/process/start/{name}"))
                .send()
                .await?;
            report_status(&response, &format!("start '{name}'")).await
        }
        Commands::Stop { name } => {
            let addr = resolve_supervisor_addr(cli.supervisor_addr.as_deref());
            let response = match name {
                Some(name) => {
                    http_client()
                        .patch(format!("{addr}/process/stop/{name}"))
                        .send()
                        .await?
                }
                None => {
                    let names: Vec<String> = http_client()
                        .get(format!("{addr}/processes"))
                        .send()
                        .await?
                        .json::<serde_json::Value>()
                        .await?
                        .get("data")
                        .and_then(|d| d.as_array())
                        .map(|entries| {
                            entries
                                .iter()
                                .filter_map(|e| e.get("name").and_then(|n| n.as_str()).map(str::to_string))
                                .collect()
                        })
                        .unwrap_or_default();
                    http_client()
                        .patch(format!("{addr}/processes/stop"))
                        .json(&names)
                        .send()
                        .await?
                }
            };
            report_status(&response, "stop").await
        }
        Commands::Restart { name } => {
            let addr = resolve_supervisor_addr(cli.supervisor_addr.as_deref());
            let response = http_client()
                .post(format!("{addr}/process/restart/{name}"))
                .send()
                .await?;
            report_status(&response, &format!("restart '{name}'")).await
        }
        Commands::Status { name, json } => {
            let addr = resolve_supervisor_addr(cli.supervisor_addr.as_deref());
            let body = http_client()
                .get(format!("{addr}/processes"))
                .send()
                .await?
                .json::<serde_json::Value>()
                .await?;
            let entries = body.get("data").and_then(|d| d.as_array()).cloned().unwrap_or_default();
            let filtered: Vec<_> = match &name {
                Some(name) => entries
                    .into_iter()
                    .filter(|e| e.get("name").and_then(|n| n.as_str()) == Some(name.as_str()))
                    .collect(),
                None => entries,
            };
            if json {
                println!("{}", serde_json::to_string_pretty(&filtered)?);
            } else {
                for entry in &filtered {
                    let name = entry.get("name").and_then(|n| n.as_str()).unwrap_or("?");
                    let status = entry.get("status").and_then(|s| s.as_str()).unwrap_or("?");
                    let replicas = entry.get("replicas").and_then(|r| r.as_u64()).unwrap_or(0);
                    println!("{name:<24} {status:<12} replicas={replicas}");
                }
            }
            Ok(())
        }
        Commands::Reload => {
            let addr = resolve_supervisor_addr(cli.supervisor_addr.as_deref());
            let response = http_client()
                .post(format!("{addr}/project/configuration"))
                .send()
                .await?;
            report_status(&response, "reload").await
        }
        Commands::Logs { name, lines, offset } => {
            let addr = resolve_supervisor_addr(cli.supervisor_addr.as_deref());
            let response = http_client()
                .get(format!("{addr}/process/logs/{name}/{offset}/{lines}"))
                .send()
                .await?;
            let body: serde_json::Value = response.json().await?;
            if let Some(lines) = body.get("logs").and_then(|l| l.as_array()) {
                for line in lines {
                    if let Some(line) = line.as_str() {
                        println!("{line}");
                    }
                }
            }
            Ok(())
        }
    }
}

async fn report_status(response: &reqwest::Response, what: &str) -> Result<(), Box<dyn std::error::Error>> {
    if response.status().is_success() {
        info!("{what}: ok");
        Ok(())
    } else {
        Err(format!("{what} failed: {}", response.status()).into())
    }
}

async fn run_serve(
    config_path: Option<String>,
    services_path: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let config_path = config::resolve_path(config_path.as_deref().map(Path::new));
    let registry = config::load(&config_path)?;

    std::fs::create_dir_all(runtime::state_dir())?;
    std::fs::create_dir_all(runtime::log_dir())?;
    let publisher = Arc::new(EventPublisher::open(
        runtime::state_dir().join("events"),
        DEFAULT_EVENT_RETENTION,
    )?);

    let supervisor = Supervisor::new(registry, Some(Arc::clone(&publisher)));

    let services_path = services_path
        .map(PathBuf::from)
        .or_else(|| default_services_path(&config_path));
    let store = match services_path {
        Some(path) if path.exists() => Store::load(&path).await?,
        _ => Store::empty(),
    };

    let machines = Arc::new(NullMachinesProvider);
    let routing = Arc::new(NullRoutingProvider);
    let reconciler = Arc::new(Reconciler::new(
        Arc::clone(&store),
        machines,
        routing,
        DEFAULT_RECONCILE_INTERVAL,
    ));

    let live_view = LiveView::new();

    let shutdown = CancellationToken::new();
    let mut tasks = Vec::new();
    tasks.push(supervisor.spawn_poll_loop(shutdown.clone()));
    tasks.push(publisher.spawn_retention_sweep(DEFAULT_EVENT_RETENTION / 24, shutdown.clone()));
    tasks.push(tokio::spawn({
        let reconciler = Arc::clone(&reconciler);
        let shutdown = shutdown.clone();
        async move { reconciler.run(shutdown).await }
    }));
    tasks.push(live_view.start_supervisor_sync(Arc::clone(&supervisor), shutdown.clone()));
    tasks.push(live_view.start_event_stream(Arc::clone(&publisher), "pc.>", shutdown.clone()));
    tasks.push(live_view.start_controller_stream(
        format!("http://127.0.0.1:{DEFAULT_STORE_PORT}"),
        shutdown.clone(),
    ));

    let supervisor_port = std::env::var(SUPERVISOR_PORT_ENV)
        .ok()
        .and_then(|v| v.parse::<u16>().ok())
        .unwrap_or(DEFAULT_SUPERVISOR_PORT);
    let supervisor_addr = SocketAddr::from(([127, 0, 0, 1], supervisor_port));
    let supervisor_listener = TcpListener::bind(supervisor_addr).await?;
    info!(addr = %supervisor_addr, "supervisor control API listening");

    let store_addr = SocketAddr::from(([127, 0, 0, 1], DEFAULT_STORE_PORT));
    let store_listener = TcpListener::bind(store_addr).await?;
    info!(addr = %store_addr, "desired-state store listening");

    let supervisor_shutdown = shutdown.clone();
    let supervisor_server = tokio::spawn(async move {
        let app = supervisor_router(supervisor.clone());
        let result = axum::serve(supervisor_listener, app)
            .with_graceful_shutdown(async move { supervisor_shutdown.cancelled().await })
            .await;
        if let Err(err) = result {
            error!(error = %err, "supervisor control API server failed");
        }
        supervisor
    });

    let store_shutdown = shutdown.clone();
    let store_for_server = Arc::clone(&store);
    let store_server = tokio::spawn(async move {
        let app = store_router(store_for_server);
        if let Err(err) = axum::serve(store_listener, app)
            .with_graceful_shutdown(async move { store_shutdown.cancelled().await })
            .await
        {
            error!(error = %err, "desired-state store server failed");
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    shutdown.cancel();

    let supervisor = supervisor_server.await?;
    let _ = store_server.await;
    for task in tasks {
        let _ = tokio::time::timeout(HTTP_SHUTDOWN_DEADLINE, task).await;
    }
    if let Err(err) = supervisor.shutdown(SHUTDOWN_DEADLINE).await {
        warn!(error = %err, "supervisor shutdown did not complete cleanly");
    }
    store.close().await?;
    Ok(())
}

fn default_services_path(config_path: &Path) -> Option<PathBuf> {
    let dir = config_path.parent()?;
    let candidate = dir.join("services.yaml");
    Some(candidate)
}
