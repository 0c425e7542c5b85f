use std::process;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use tether::{CpuBackend, Dispatcher, HttpArtifactStore, ServerConfig, TETHER_VERSION};

fn main() {
    let args: Vec<String> = std::env::args().collect();

    let config = match parse_args(&args, ServerConfig::from_env()) {
        Ok(config) => config,
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("error: {msg}");
                eprintln!();
            }
            eprintln!("Usage: tether-server [--host <addr>] [--port <port>] [--idle-ttl <secs>]");
            eprintln!();
            eprintln!("Options:");
            eprintln!("  --host <addr>      Bind address [env: TETHER_HOST, default: 0.0.0.0]");
            eprintln!("  --port <port>      Listen port [env: TETHER_PORT, default: 3060]");
            eprintln!(
                "  --idle-ttl <secs>  Evict values untouched this long [env: TETHER_IDLE_TTL_SECS, default: never]"
            );
            process::exit(2);
        }
    };

    init_tracing();

    if let Err(e) = run(config) {
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}

fn parse_args(args: &[String], mut config: ServerConfig) -> Result<ServerConfig, String> {
    let mut i = 1; // skip argv[0]
    while i < args.len() {
        match args[i].as_str() {
            "--host" => {
                i += 1;
                config.host = args.get(i).ok_or("--host requires a value")?.clone();
            }
            "--port" => {
                i += 1;
                let raw = args.get(i).ok_or("--port requires a value")?;
                config.port = raw.parse().map_err(|_| format!("invalid port '{raw}'"))?;
            }
            "--idle-ttl" => {
                i += 1;
                let raw = args.get(i).ok_or("--idle-ttl requires a value")?;
                let secs: u64 = raw.parse().map_err(|_| format!("invalid idle ttl '{raw}'"))?;
                config.idle_ttl = Some(Duration::from_secs(secs));
            }
            "--help" | "-h" => return Err(String::new()),
            arg => return Err(format!("unexpected argument: {arg}")),
        }
        i += 1;
    }
    Ok(config)
}

/// Initialize tracing with TETHER_LOG and LOG_FORMAT support.
fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match std::env::var("TETHER_LOG").as_deref() {
            Ok("debug") => "debug",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!("tether={level},tether_server={level}"))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init();
    } else {
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init();
    }
}

#[tokio::main]
async fn run(config: ServerConfig) -> anyhow::Result<()> {
    info!(version = TETHER_VERSION, "Starting tether server");

    let dispatcher = Arc::new(Dispatcher::with_policy(
        CpuBackend::new(),
        Arc::new(HttpArtifactStore::new()),
        config.eviction_policy(),
    ));

    let addr = config.addr();
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    tether::serve(listener, dispatcher, &config, shutdown_signal()).await?;
    Ok(())
}

/// Resolves on SIGINT or SIGTERM. A handler that fails to install is logged
/// and never fires.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT, shutting down...");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down...");
        }
    }
}
