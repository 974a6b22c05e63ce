//! Core server: binds both listeners and runs them side by side.
//!
//! Owns the tunnel registry, the only state shared between the SSH side and
//! the HTTP side.

use crate::config::ServerConfig;
use crate::relay::TunnelRegistry;
use crate::transport::{http, ssh};
use russh::keys::PrivateKey;
use shtun_core::{TunnelError, TunnelResult};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{debug, info};

/// How often orphaned registry entries are swept.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// The shtun server instance.
pub struct TunnelServer {
    /// Server configuration.
    config: ServerConfig,
    /// Tunnels waiting for a viewer.
    registry: Arc<TunnelRegistry>,
}

impl TunnelServer {
    /// Create a new server instance.
    pub fn new(config: ServerConfig) -> Self {
        let registry = Arc::new(TunnelRegistry::new(config.max_pending));
        Self { config, registry }
    }

    /// Bind both listeners and serve until one of them fails.
    ///
    /// Bind failures are returned before anything is served.
    pub async fn run(self, host_key: PrivateKey) -> TunnelResult<()> {
        let ssh_listener = bind(self.config.ssh_addr, "SSH").await?;
        let http_listener = bind(self.config.http_addr, "HTTP").await?;
        info!(addr = %self.config.ssh_addr, "SSH listener started");
        info!(addr = %self.config.http_addr, "HTTP listener started");

        let sweep_registry = self.registry.clone();
        let sweeper = tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                interval.tick().await;
                let removed = sweep_registry.sweep();
                let pending = sweep_registry.list();
                let oldest_secs = pending.iter().map(|t| t.age.as_secs()).max().unwrap_or(0);
                debug!(
                    removed = removed.len(),
                    pending = pending.len(),
                    oldest_secs,
                    "registry sweep"
                );
            }
        });

        let ssh_config = Arc::new(ssh::server_config(host_key));
        let bridge = http::BridgeState {
            registry: self.registry.clone(),
            buffer_chunks: self.config.tunnel.buffer_chunks,
        };

        let result = tokio::select! {
            () = ssh::accept_loop(
                ssh_listener,
                ssh_config,
                self.registry.clone(),
                self.config.tunnel.clone(),
            ) => Err(TunnelError::Transport("SSH listener stopped".into())),
            result = http::serve(http_listener, bridge) => result,
        };

        sweeper.abort();
        result
    }
}

async fn bind(addr: SocketAddr, label: &str) -> TunnelResult<TcpListener> {
    TcpListener::bind(addr)
        .await
        .map_err(|e| TunnelError::Transport(format!("{label} bind on {addr} failed: {e}")))
}
