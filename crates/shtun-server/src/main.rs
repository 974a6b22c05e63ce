//! shtun-server: shell-to-HTTP tunnel broker.
//!
//! Accepts SSH sessions and HTTP requests on separate ports. Each SSH session
//! is given a tunnel id; an HTTP request carrying that id receives everything
//! the SSH client writes, streamed as the response body.

mod config;
mod relay;
mod server;
mod session;
mod transport;

use clap::Parser;
use config::{CliOverrides, ServerConfig};
use server::TunnelServer;
use std::net::IpAddr;
use std::path::PathBuf;
use tracing::{error, info, warn};

/// shtun-server — shell-to-HTTP tunnel broker
#[derive(Parser, Debug)]
#[command(name = "shtun-server", version, about = "Shell-to-HTTP tunnel broker")]
struct Cli {
    /// Address both listeners bind to
    #[arg(long)]
    bind: Option<IpAddr>,

    /// SSH listen port
    #[arg(long)]
    ssh_port: Option<u16>,

    /// HTTP listen port
    #[arg(long)]
    http_port: Option<u16>,

    /// SSH host key (OpenSSH format, generated if missing)
    #[arg(long)]
    host_key: Option<String>,

    /// Config file path
    #[arg(long, default_value = "~/.shtun/config.toml")]
    config: String,

    /// Seconds a tunnel waits for a viewer before expiring
    #[arg(long)]
    expiry: Option<u64>,

    /// Seconds without progress before a streaming tunnel is dropped
    #[arg(long)]
    idle_timeout: Option<u64>,

    /// Maximum tunnels waiting for a viewer at once (unlimited if unset)
    #[arg(long)]
    max_pending: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting shtun-server");

    // Load server config (file + CLI overrides)
    let config_path = PathBuf::from(&cli.config);
    let overrides = CliOverrides {
        bind: cli.bind,
        ssh_port: cli.ssh_port,
        http_port: cli.http_port,
        host_key: cli.host_key,
        expiry_secs: cli.expiry,
        idle_timeout_secs: cli.idle_timeout,
        max_pending: cli.max_pending,
    };
    let server_config = match ServerConfig::load(Some(&config_path), overrides) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    let host_key = match transport::ssh::load_host_key(&server_config.host_key_path).await {
        Ok(key) => key,
        Err(e) => {
            error!(
                path = %server_config.host_key_path.display(),
                error = %e,
                "failed to load host key"
            );
            std::process::exit(1);
        }
    };

    let server = TunnelServer::new(server_config);

    tokio::select! {
        result = server.run(host_key) => {
            if let Err(e) = result {
                error!(error = %e, "server error");
                std::process::exit(1);
            }
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
    }

    info!("shtun-server stopped");
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
