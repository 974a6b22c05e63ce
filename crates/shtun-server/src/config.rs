//! Server configuration: TOML file + CLI overrides.

use serde::Deserialize;
use shtun_core::{TunnelError, TunnelResult};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub tunnel: TunnelSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_bind")]
    pub bind: IpAddr,
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    #[serde(default = "default_host_key_path")]
    pub host_key: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            ssh_port: default_ssh_port(),
            http_port: default_http_port(),
            host_key: default_host_key_path(),
        }
    }
}

/// `[tunnel]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct TunnelSection {
    #[serde(default = "default_expiry_secs")]
    pub expiry_secs: u64,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Unset means no limit on tunnels waiting for a viewer.
    #[serde(default)]
    pub max_pending: Option<usize>,
    #[serde(default = "default_buffer_chunks")]
    pub buffer_chunks: usize,
}

impl Default for TunnelSection {
    fn default() -> Self {
        Self {
            expiry_secs: default_expiry_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
            max_pending: None,
            buffer_chunks: default_buffer_chunks(),
        }
    }
}

fn default_bind() -> IpAddr {
    IpAddr::from([0, 0, 0, 0])
}
fn default_ssh_port() -> u16 {
    2222
}
fn default_http_port() -> u16 {
    3000
}
fn default_host_key_path() -> String {
    "~/.shtun/host_key".to_string()
}
fn default_expiry_secs() -> u64 {
    300
}
fn default_idle_timeout_secs() -> u64 {
    600
}
fn default_buffer_chunks() -> usize {
    16
}

/// Per-tunnel timing and buffering, shared by every session.
#[derive(Debug, Clone)]
pub struct TunnelSettings {
    /// How long a shell session waits for a viewer.
    pub expiry: Duration,
    /// Deadline for each read from the shell and each write to the viewer.
    pub idle_timeout: Duration,
    /// Chunks buffered between the shell reader and the HTTP body.
    pub buffer_chunks: usize,
}

impl Default for TunnelSettings {
    fn default() -> Self {
        Self {
            expiry: Duration::from_secs(default_expiry_secs()),
            idle_timeout: Duration::from_secs(default_idle_timeout_secs()),
            buffer_chunks: default_buffer_chunks(),
        }
    }
}

/// Values given on the command line; each one wins over the file.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub bind: Option<IpAddr>,
    pub ssh_port: Option<u16>,
    pub http_port: Option<u16>,
    pub host_key: Option<String>,
    pub expiry_secs: Option<u64>,
    pub idle_timeout_secs: Option<u64>,
    pub max_pending: Option<usize>,
}

/// Resolved server configuration (all paths expanded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub ssh_addr: SocketAddr,
    pub http_addr: SocketAddr,
    pub host_key_path: PathBuf,
    pub max_pending: Option<usize>,
    pub tunnel: TunnelSettings,
}

impl ServerConfig {
    /// Load config from TOML file, then apply CLI overrides.
    pub fn load(config_path: Option<&Path>, cli: CliOverrides) -> TunnelResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    Self::parse(&content)?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };

        Ok(Self::merge(file_config, cli))
    }

    fn parse(content: &str) -> TunnelResult<ConfigFile> {
        toml::from_str::<ConfigFile>(content)
            .map_err(|e| TunnelError::Other(format!("config parse error: {e}")))
    }

    fn merge(file: ConfigFile, cli: CliOverrides) -> Self {
        let bind = cli.bind.unwrap_or(file.server.bind);
        let ssh_port = cli.ssh_port.unwrap_or(file.server.ssh_port);
        let http_port = cli.http_port.unwrap_or(file.server.http_port);
        let host_key = cli.host_key.unwrap_or(file.server.host_key);
        let expiry_secs = cli.expiry_secs.unwrap_or(file.tunnel.expiry_secs);
        let idle_timeout_secs = cli
            .idle_timeout_secs
            .unwrap_or(file.tunnel.idle_timeout_secs);

        Self {
            ssh_addr: SocketAddr::new(bind, ssh_port),
            http_addr: SocketAddr::new(bind, http_port),
            host_key_path: expand_tilde_str(&host_key),
            max_pending: cli.max_pending.or(file.tunnel.max_pending),
            tunnel: TunnelSettings {
                expiry: Duration::from_secs(expiry_secs),
                idle_timeout: Duration::from_secs(idle_timeout_secs),
                buffer_chunks: file.tunnel.buffer_chunks.max(1),
            },
        }
    }
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}
