mod auth;
mod capture;
mod cli;
mod config;
mod error;
mod frame;
mod server;
mod source;

use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use cli::Cli;
use config::{ServerConfig, Transport};
use server::{ListenerManager, RunningServer};

/// How often client and capture counters are logged
const STATS_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse_args();
    init_logging(cli.verbose);

    let config = ServerConfig::from_cli(&cli)?;
    let mut server = ListenerManager::new(config)
        .start()
        .await
        .context("Failed to start the camera server")?;

    print_banner(&server);
    wait_for_shutdown(&server).await;
    server.shutdown().await;

    Ok(())
}

fn init_logging(verbose: bool) {
    let default = if verbose { "vcam=debug" } else { "vcam=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn print_banner(server: &RunningServer) {
    println!();
    println!("📷 Virtual Security Camera");
    println!("🎞️  Source: {}", server.capture_status().source());
    for listener in server.listeners() {
        let host = if listener.addr.ip().is_unspecified() {
            "localhost".to_string()
        } else {
            listener.addr.ip().to_string()
        };
        let base = format!("{}://{}:{}", listener.transport.scheme(), host, listener.addr.port());
        println!("🌐 Viewer: {}/", base);
        println!("📡 Stream: {}/stream", base);
        if listener.transport == Transport::Secure {
            println!("⚠️  Self-signed certificates need to be accepted in the browser first");
        }
    }
    println!("Press Ctrl+C to stop");
    println!();
}

/// Block until Ctrl-C or SIGTERM, logging stats in the meantime.
async fn wait_for_shutdown(server: &RunningServer) {
    let mut stats = tokio::time::interval(STATS_INTERVAL);
    stats.tick().await;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received interrupt");
                break;
            }
            _ = terminate() => {
                info!("Received SIGTERM");
                break;
            }
            _ = stats.tick() => {
                let status = server.capture_status();
                let clients = server.clients();
                info!(
                    "Stats: frame #{}, {} clients ({} total), {} frames sent, {} capture failures{}",
                    server.buffer().sequence(),
                    clients.active(),
                    clients.total(),
                    clients.frames_sent(),
                    status.capture_failures(),
                    if status.degraded() { ", degraded to synthetic" } else { "" }
                );
            }
        }
    }
}

#[cfg(unix)]
async fn terminate() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            warn!("Cannot listen for SIGTERM: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    std::future::pending::<()>().await;
}
