//! SSH listener using russh.
//!
//! Every accepted TCP connection runs its own russh session. The first
//! session channel a client opens becomes a tunnel: the id is printed to the
//! client's terminal, and whatever the client writes afterwards is streamed
//! to the viewer that claims that id.
//!
//! ```text
//! ssh -p 2222 host < file        # prints "tunnel id -> <id>"
//! curl 'http://host:3000/?id=<id>'
//! ```

use crate::config::TunnelSettings;
use crate::relay::TunnelRegistry;
use crate::session::tunnel;
use rand::Rng;
use russh::keys::ssh_key::private::Ed25519Keypair;
use russh::keys::ssh_key::{self, LineEnding};
use russh::keys::{decode_secret_key, PrivateKey};
use russh::server::{Auth, Config, Handler, Msg, Session};
use russh::{Channel, ChannelId, ChannelMsg};
use shtun_core::{ShellChannel, TunnelError, TunnelResult};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Build the russh server configuration around `host_key`.
pub fn server_config(host_key: PrivateKey) -> Config {
    Config {
        auth_rejection_time: Duration::from_secs(1),
        auth_rejection_time_initial: Some(Duration::from_secs(0)),
        keepalive_interval: Some(Duration::from_secs(30)),
        keys: vec![host_key],
        ..Default::default()
    }
}

/// Load the server's host key, generating and saving an Ed25519 key if the
/// file does not exist yet.
pub async fn load_host_key(path: &Path) -> TunnelResult<PrivateKey> {
    match tokio::fs::read_to_string(path).await {
        Ok(encoded) => decode_secret_key(&encoded, None).map_err(|e| {
            TunnelError::Other(format!("cannot decode host key {}: {e}", path.display()))
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!(path = %path.display(), "host key not found, generating");
            let seed: [u8; 32] = rand::thread_rng().gen();
            let key = PrivateKey::from(Ed25519Keypair::from_seed(&seed));
            let encoded = key
                .to_openssh(LineEnding::LF)
                .map_err(|e| TunnelError::Other(format!("cannot encode host key: {e}")))?;

            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(path, encoded.as_bytes()).await?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await?;
            }
            Ok(key)
        }
        Err(e) => Err(TunnelError::Io(e)),
    }
}

/// Accept SSH connections forever, serving each on its own task.
pub async fn accept_loop(
    listener: TcpListener,
    config: Arc<Config>,
    registry: Arc<TunnelRegistry>,
    settings: TunnelSettings,
) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!(peer = %peer, "SSH connection accepted");
                let handler = ShellHandler::new(peer, registry.clone(), settings.clone());
                let config = config.clone();
                tokio::spawn(async move {
                    let session = match russh::server::run_stream(config, stream, handler).await {
                        Ok(session) => session,
                        Err(e) => {
                            warn!(peer = %peer, error = %e, "SSH handshake failed");
                            return;
                        }
                    };
                    match session.await {
                        Ok(()) => debug!(peer = %peer, "SSH connection closed"),
                        Err(e) => warn!(peer = %peer, error = %e, "SSH connection closed with error"),
                    }
                });
            }
            Err(e) => {
                error!(error = %e, "TCP accept failed");
            }
        }
    }
}

/// russh handler for one SSH connection.
///
/// Cancels its token when dropped, which tells the tunnel task that the
/// connection is gone.
pub struct ShellHandler {
    peer: SocketAddr,
    registry: Arc<TunnelRegistry>,
    settings: TunnelSettings,
    cancel: CancellationToken,
    tunnel_opened: bool,
}

impl ShellHandler {
    pub fn new(peer: SocketAddr, registry: Arc<TunnelRegistry>, settings: TunnelSettings) -> Self {
        Self {
            peer,
            registry,
            settings,
            cancel: CancellationToken::new(),
            tunnel_opened: false,
        }
    }
}

impl Drop for ShellHandler {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl Handler for ShellHandler {
    type Error = russh::Error;

    async fn auth_none(&mut self, user: &str) -> Result<Auth, Self::Error> {
        debug!(peer = %self.peer, user, "accepting client");
        Ok(Auth::Accept)
    }

    async fn auth_password(&mut self, user: &str, _password: &str) -> Result<Auth, Self::Error> {
        debug!(peer = %self.peer, user, "accepting client");
        Ok(Auth::Accept)
    }

    async fn auth_publickey(
        &mut self,
        user: &str,
        _public_key: &ssh_key::PublicKey,
    ) -> Result<Auth, Self::Error> {
        debug!(peer = %self.peer, user, "accepting client");
        Ok(Auth::Accept)
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        if self.tunnel_opened {
            warn!(peer = %self.peer, "refusing second session channel");
            return Ok(false);
        }
        self.tunnel_opened = true;

        let peer = self.peer;
        let registry = self.registry.clone();
        let settings = self.settings.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let state = tunnel::serve(SshChannel::new(channel), registry, settings, cancel).await;
            debug!(peer = %peer, state = %state, "tunnel task finished");
        });
        Ok(true)
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        session.channel_success(channel)?;
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        _data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        session.channel_success(channel)?;
        Ok(())
    }
}

/// [`ShellChannel`] over a russh server channel.
pub struct SshChannel {
    channel: Channel<Msg>,
    eof: bool,
}

impl SshChannel {
    pub fn new(channel: Channel<Msg>) -> Self {
        Self {
            channel,
            eof: false,
        }
    }
}

impl ShellChannel for SshChannel {
    async fn recv(&mut self) -> TunnelResult<Option<Vec<u8>>> {
        if self.eof {
            return Ok(None);
        }
        loop {
            match self.channel.wait().await {
                Some(ChannelMsg::Data { data }) => return Ok(Some(data.to_vec())),
                Some(ChannelMsg::Eof) => {
                    self.eof = true;
                    return Ok(None);
                }
                Some(ChannelMsg::Close) | None => {
                    return Err(TunnelError::Stream(
                        "channel closed before end of stream".into(),
                    ))
                }
                // stderr, window adjustments, requests
                Some(_) => continue,
            }
        }
    }

    async fn send(&mut self, data: &[u8]) -> TunnelResult<()> {
        self.channel
            .data(data)
            .await
            .map_err(|e| TunnelError::Transport(format!("SSH send failed: {e}")))
    }

    async fn finish(&mut self, exit_status: u32) -> TunnelResult<()> {
        let map = |e: russh::Error| TunnelError::Transport(format!("SSH close failed: {e}"));
        self.channel.exit_status(exit_status).await.map_err(map)?;
        self.channel.eof().await.map_err(map)?;
        self.channel.close().await.map_err(map)
    }
}
