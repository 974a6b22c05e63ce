//! The shell side of one tunnel.
//!
//! A [`TunnelSession`] registers a slot, prints its id to the shell client,
//! waits for a viewer, then copies everything the client sends into the
//! viewer's HTTP body:
//!
//! ```text
//! Started → Registered → AwaitingHandoff → Streaming → Completed
//!                              │                │
//!                              ├→ Expired       └→ StreamError
//!                              └→ Cancelled
//! ```
//!
//! Whatever happens while streaming, the handoff's completion signal fires
//! exactly once, so the HTTP side never hangs on a dead shell.

use crate::config::TunnelSettings;
use crate::relay::TunnelRegistry;
use shtun_core::{ShellChannel, StreamSink, TunnelError, TunnelId, TunnelOutcome, TunnelResult};
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Sent to the shell client after a clean end-of-stream.
pub const CLOSING_MESSAGE: &[u8] = b"We are done!";

/// Where a tunnel is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Started,
    Registered,
    AwaitingHandoff,
    Streaming,
    Completed,
    Expired,
    StreamError,
    Cancelled,
}

impl TunnelState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TunnelState::Completed
                | TunnelState::Expired
                | TunnelState::StreamError
                | TunnelState::Cancelled
        )
    }
}

impl fmt::Display for TunnelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TunnelState::Started => "started",
            TunnelState::Registered => "registered",
            TunnelState::AwaitingHandoff => "awaiting_handoff",
            TunnelState::Streaming => "streaming",
            TunnelState::Completed => "completed",
            TunnelState::Expired => "expired",
            TunnelState::StreamError => "stream_error",
            TunnelState::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Drives one shell connection through the tunnel lifecycle.
pub struct TunnelSession<C> {
    channel: C,
    registry: Arc<TunnelRegistry>,
    settings: TunnelSettings,
    /// Cancelled when the shell connection goes away.
    cancel: CancellationToken,
    state: TunnelState,
    id: Option<TunnelId>,
}

impl<C: ShellChannel> TunnelSession<C> {
    pub fn new(
        channel: C,
        registry: Arc<TunnelRegistry>,
        settings: TunnelSettings,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            channel,
            registry,
            settings,
            cancel,
            state: TunnelState::Started,
            id: None,
        }
    }

    pub fn state(&self) -> TunnelState {
        self.state
    }

    fn transition(&mut self, next: TunnelState) {
        debug!(
            tunnel = %self.id.map(|id| id.to_string()).unwrap_or_default(),
            from = %self.state,
            to = %next,
            "tunnel state change"
        );
        self.state = next;
    }

    /// Run the tunnel to a terminal state.
    ///
    /// Returns the outcome reported to the viewer, or the error that ended
    /// the tunnel before a viewer arrived.
    pub async fn run(&mut self) -> TunnelResult<TunnelOutcome> {
        let slot = match self.registry.register_fresh() {
            Ok(slot) => slot,
            Err(e) => {
                warn!(error = %e, "could not register tunnel");
                self.notify(&format!("could not open tunnel: {e}\r\n")).await;
                self.close(1).await;
                return Err(e);
            }
        };
        let id = slot.id();
        self.id = Some(id);
        self.transition(TunnelState::Registered);
        info!(
            tunnel = %id,
            pending = self.registry.count(),
            "tunnel open, waiting for viewer"
        );

        if let Err(e) = self.channel.send(format!("tunnel id -> {id}\r\n").as_bytes()).await {
            // Dropping the slot releases the registry entry.
            warn!(tunnel = %id, error = %e, "could not send tunnel id to shell");
            self.transition(TunnelState::Cancelled);
            return Err(e);
        }
        self.transition(TunnelState::AwaitingHandoff);

        let cancel = self.cancel.clone();
        let handoff = tokio::select! {
            biased;
            result = slot.await_handoff(self.settings.expiry) => result,
            _ = cancel.cancelled() => Err(TunnelError::Cancelled),
        };
        let handoff = match handoff {
            Ok(handoff) => handoff,
            Err(TunnelError::TunnelExpired(id)) => {
                self.transition(TunnelState::Expired);
                self.notify(&format!(
                    "no viewer connected within {:?}, tunnel {id} expired.\r\n",
                    self.settings.expiry
                ))
                .await;
                self.close(1).await;
                return Err(TunnelError::TunnelExpired(id));
            }
            Err(e) => {
                info!(tunnel = %id, error = %e, "shell left before a viewer arrived");
                self.transition(TunnelState::Cancelled);
                return Err(e);
            }
        };

        info!(tunnel = %id, "viewer attached, streaming");
        self.transition(TunnelState::Streaming);

        let (sink, done) = handoff.into_parts();
        match self.pump(sink).await {
            Ok(bytes) => {
                let outcome = TunnelOutcome::Completed { bytes };
                done.fire(outcome.clone());
                self.transition(TunnelState::Completed);
                info!(tunnel = %id, bytes, "tunnel completed");
                self.notify_bytes(CLOSING_MESSAGE).await;
                self.close(0).await;
                Ok(outcome)
            }
            Err(e) => {
                let outcome = TunnelOutcome::Failed(e.to_string());
                done.fire(outcome.clone());
                self.transition(TunnelState::StreamError);
                warn!(tunnel = %id, error = %e, "tunnel stream failed");
                self.notify(&format!("tunnel {id} failed: {e}\r\n")).await;
                self.close(1).await;
                Ok(outcome)
            }
        }
    }

    /// Copy shell bytes into the sink until end-of-stream. The sink is
    /// dropped on return, before the caller fires completion.
    async fn pump(&mut self, sink: StreamSink) -> TunnelResult<u64> {
        let idle = self.settings.idle_timeout;
        let mut total: u64 = 0;

        loop {
            // Drain whatever the shell already sent before noticing a hangup.
            let chunk = tokio::select! {
                biased;
                read = tokio::time::timeout(idle, self.channel.recv()) => match read {
                    Ok(chunk) => chunk?,
                    Err(_) => {
                        return Err(TunnelError::Stream(format!(
                            "no data from shell for {idle:?}"
                        )))
                    }
                },
                _ = self.cancel.cancelled() => {
                    return Err(TunnelError::Stream("shell connection lost".into()));
                }
                () = sink.closed() => {
                    return Err(TunnelError::Stream("viewer disconnected".into()));
                }
            };
            let Some(chunk) = chunk else {
                return Ok(total);
            };
            if chunk.is_empty() {
                continue;
            }

            let len = chunk.len() as u64;
            match tokio::time::timeout(idle, sink.write(chunk)).await {
                Ok(written) => written?,
                Err(_) => {
                    return Err(TunnelError::Stream(format!("viewer stalled for {idle:?}")))
                }
            }
            total += len;
        }
    }

    async fn notify(&mut self, message: &str) {
        self.notify_bytes(message.as_bytes()).await;
    }

    /// Best-effort write to the shell client; it may already be gone.
    async fn notify_bytes(&mut self, message: &[u8]) {
        if let Err(e) = self.channel.send(message).await {
            debug!(error = %e, "could not write to shell");
        }
    }

    async fn close(&mut self, exit_status: u32) {
        if let Err(e) = self.channel.finish(exit_status).await {
            debug!(error = %e, "could not close shell channel");
        }
    }
}

/// Run a session to completion, logging instead of returning errors.
pub async fn serve<C: ShellChannel>(
    channel: C,
    registry: Arc<TunnelRegistry>,
    settings: TunnelSettings,
    cancel: CancellationToken,
) -> TunnelState {
    let mut session = TunnelSession::new(channel, registry, settings, cancel);
    if let Err(e) = session.run().await {
        debug!(error = %e, state = %session.state(), "tunnel session ended early");
    }
    debug_assert!(session.state().is_terminal());
    session.state()
}

#[cfg(test)]
mod tests {
    use super::*;
    use shtun_core::handoff;
    use std::time::Duration;
    use tokio::sync::mpsc;

    enum Inbound {
        Data(&'static [u8]),
        Eof,
        Hangup,
    }

    /// In-memory shell client.
    struct MockShell {
        inbound: mpsc::UnboundedReceiver<Inbound>,
        outbound: mpsc::UnboundedSender<Vec<u8>>,
        exit: mpsc::UnboundedSender<u32>,
    }

    struct MockClient {
        inbound: mpsc::UnboundedSender<Inbound>,
        outbound: mpsc::UnboundedReceiver<Vec<u8>>,
        exit: mpsc::UnboundedReceiver<u32>,
    }

    fn mock_shell() -> (MockShell, MockClient) {
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();
        (
            MockShell {
                inbound: in_rx,
                outbound: out_tx,
                exit: exit_tx,
            },
            MockClient {
                inbound: in_tx,
                outbound: out_rx,
                exit: exit_rx,
            },
        )
    }

    impl ShellChannel for MockShell {
        async fn recv(&mut self) -> TunnelResult<Option<Vec<u8>>> {
            match self.inbound.recv().await {
                Some(Inbound::Data(data)) => Ok(Some(data.to_vec())),
                Some(Inbound::Eof) => Ok(None),
                Some(Inbound::Hangup) | None => {
                    Err(TunnelError::Stream("channel closed before end of stream".into()))
                }
            }
        }

        async fn send(&mut self, data: &[u8]) -> TunnelResult<()> {
            self.outbound
                .send(data.to_vec())
                .map_err(|_| TunnelError::Transport("client gone".into()))
        }

        async fn finish(&mut self, exit_status: u32) -> TunnelResult<()> {
            let _ = self.exit.send(exit_status);
            Ok(())
        }
    }

    impl MockClient {
        /// Read the id out of the first line the session prints.
        async fn tunnel_id(&mut self) -> TunnelId {
            let line = self.outbound.recv().await.unwrap();
            let line = String::from_utf8(line).unwrap();
            line.trim()
                .strip_prefix("tunnel id -> ")
                .unwrap()
                .parse()
                .unwrap()
        }

        async fn remaining_output(&mut self) -> String {
            let mut out = Vec::new();
            while let Some(chunk) = self.outbound.recv().await {
                out.extend(chunk);
            }
            String::from_utf8(out).unwrap()
        }
    }

    fn settings(expiry: Duration) -> TunnelSettings {
        TunnelSettings {
            expiry,
            idle_timeout: Duration::from_secs(5),
            buffer_chunks: 4,
        }
    }

    fn short_idle() -> TunnelSettings {
        TunnelSettings {
            idle_timeout: Duration::from_millis(100),
            ..settings(Duration::from_secs(5))
        }
    }

    async fn drain(rx: &mut shtun_core::HandoffReceiver) -> Vec<u8> {
        let mut body = Vec::new();
        while let Some(chunk) = rx.next_chunk().await {
            body.extend(chunk);
        }
        body
    }

    #[tokio::test]
    async fn streams_to_viewer_then_says_goodbye() {
        let registry = Arc::new(TunnelRegistry::new(None));
        let (shell, mut client) = mock_shell();
        let task = tokio::spawn(serve(
            shell,
            registry.clone(),
            settings(Duration::from_secs(5)),
            CancellationToken::new(),
        ));

        let id = client.tunnel_id().await;
        let (handoff, mut rx) = handoff::channel(4);
        registry.lookup_and_consume(id).unwrap().deliver(handoff).unwrap();

        client.inbound.send(Inbound::Data(b"hello ")).unwrap();
        client.inbound.send(Inbound::Data(b"world")).unwrap();
        client.inbound.send(Inbound::Eof).unwrap();

        assert_eq!(drain(&mut rx).await, b"hello world");
        assert_eq!(rx.outcome().await, TunnelOutcome::Completed { bytes: 11 });
        assert_eq!(task.await.unwrap(), TunnelState::Completed);
        assert_eq!(client.remaining_output().await, "We are done!");
        assert_eq!(client.exit.recv().await, Some(0));
    }

    #[tokio::test]
    async fn bytes_sent_before_viewer_arrives_are_kept() {
        let registry = Arc::new(TunnelRegistry::new(None));
        let (shell, mut client) = mock_shell();
        let task = tokio::spawn(serve(
            shell,
            registry.clone(),
            settings(Duration::from_secs(5)),
            CancellationToken::new(),
        ));

        let id = client.tunnel_id().await;
        client.inbound.send(Inbound::Data(b"early")).unwrap();
        client.inbound.send(Inbound::Eof).unwrap();

        let (handoff, mut rx) = handoff::channel(4);
        registry.lookup_and_consume(id).unwrap().deliver(handoff).unwrap();

        assert_eq!(drain(&mut rx).await, b"early");
        assert!(rx.outcome().await.is_success());
        assert_eq!(task.await.unwrap(), TunnelState::Completed);
    }

    #[tokio::test]
    async fn hangup_mid_stream_still_completes_viewer() {
        let registry = Arc::new(TunnelRegistry::new(None));
        let (shell, mut client) = mock_shell();
        let task = tokio::spawn(serve(
            shell,
            registry.clone(),
            settings(Duration::from_secs(5)),
            CancellationToken::new(),
        ));

        let id = client.tunnel_id().await;
        let (handoff, mut rx) = handoff::channel(4);
        registry.lookup_and_consume(id).unwrap().deliver(handoff).unwrap();

        client.inbound.send(Inbound::Data(b"partial")).unwrap();
        client.inbound.send(Inbound::Hangup).unwrap();

        assert_eq!(drain(&mut rx).await, b"partial");
        assert!(matches!(rx.outcome().await, TunnelOutcome::Failed(_)));
        assert_eq!(task.await.unwrap(), TunnelState::StreamError);
        assert_eq!(client.exit.recv().await, Some(1));
    }

    #[tokio::test]
    async fn viewer_leaving_mid_stream_is_a_stream_error() {
        let registry = Arc::new(TunnelRegistry::new(None));
        let (shell, mut client) = mock_shell();
        let task = tokio::spawn(serve(
            shell,
            registry.clone(),
            settings(Duration::from_secs(5)),
            CancellationToken::new(),
        ));

        let id = client.tunnel_id().await;
        let (handoff, rx) = handoff::channel(1);
        registry.lookup_and_consume(id).unwrap().deliver(handoff).unwrap();
        drop(rx);

        client.inbound.send(Inbound::Data(b"nobody listening")).unwrap();
        assert_eq!(task.await.unwrap(), TunnelState::StreamError);
        assert!(client.remaining_output().await.contains("viewer disconnected"));
    }

    #[tokio::test]
    async fn silent_shell_hits_read_deadline() {
        let registry = Arc::new(TunnelRegistry::new(None));
        let (shell, mut client) = mock_shell();
        let task = tokio::spawn(serve(
            shell,
            registry.clone(),
            short_idle(),
            CancellationToken::new(),
        ));

        let id = client.tunnel_id().await;
        let (handoff, mut rx) = handoff::channel(4);
        registry.lookup_and_consume(id).unwrap().deliver(handoff).unwrap();

        assert!(drain(&mut rx).await.is_empty());
        match rx.outcome().await {
            TunnelOutcome::Failed(reason) => {
                assert!(reason.contains("no data from shell for 100ms"), "{reason}")
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(task.await.unwrap(), TunnelState::StreamError);
        assert_eq!(client.exit.recv().await, Some(1));
    }

    #[tokio::test]
    async fn stalled_viewer_hits_write_deadline() {
        let registry = Arc::new(TunnelRegistry::new(None));
        let (shell, mut client) = mock_shell();
        let task = tokio::spawn(serve(
            shell,
            registry.clone(),
            short_idle(),
            CancellationToken::new(),
        ));

        let id = client.tunnel_id().await;
        // Held but never read until the session gives up.
        let (handoff, mut rx) = handoff::channel(1);
        registry.lookup_and_consume(id).unwrap().deliver(handoff).unwrap();

        for _ in 0..3 {
            client.inbound.send(Inbound::Data(b"chunk")).unwrap();
        }
        assert_eq!(task.await.unwrap(), TunnelState::StreamError);

        assert_eq!(drain(&mut rx).await, b"chunk");
        match rx.outcome().await {
            TunnelOutcome::Failed(reason) => {
                assert!(reason.contains("viewer stalled for 100ms"), "{reason}")
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(client.exit.recv().await, Some(1));
    }

    #[tokio::test]
    async fn viewer_leaving_while_shell_is_idle_ends_tunnel() {
        let registry = Arc::new(TunnelRegistry::new(None));
        let (shell, mut client) = mock_shell();
        let task = tokio::spawn(serve(
            shell,
            registry.clone(),
            settings(Duration::from_secs(5)),
            CancellationToken::new(),
        ));

        let id = client.tunnel_id().await;
        let (handoff, rx) = handoff::channel(4);
        registry.lookup_and_consume(id).unwrap().deliver(handoff).unwrap();
        drop(rx);

        // Well inside the 5s idle deadline.
        let state = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state, TunnelState::StreamError);
        assert!(client.remaining_output().await.contains("viewer disconnected"));
    }

    #[tokio::test]
    async fn unclaimed_tunnel_expires() {
        let registry = Arc::new(TunnelRegistry::new(None));
        let (shell, mut client) = mock_shell();
        let task = tokio::spawn(serve(
            shell,
            registry.clone(),
            settings(Duration::from_millis(50)),
            CancellationToken::new(),
        ));

        let id = client.tunnel_id().await;
        assert_eq!(task.await.unwrap(), TunnelState::Expired);
        assert!(!registry.contains(id));
        let output = client.remaining_output().await;
        assert!(output.contains("within 50ms"), "{output}");
        assert!(output.contains("expired"));
        assert_eq!(client.exit.recv().await, Some(1));
    }

    #[tokio::test]
    async fn disconnect_while_waiting_releases_slot() {
        let registry = Arc::new(TunnelRegistry::new(None));
        let (shell, mut client) = mock_shell();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(serve(
            shell,
            registry.clone(),
            settings(Duration::from_secs(60)),
            cancel.clone(),
        ));

        let id = client.tunnel_id().await;
        assert!(registry.contains(id));
        cancel.cancel();

        assert_eq!(task.await.unwrap(), TunnelState::Cancelled);
        assert!(!registry.contains(id));
        assert_eq!(registry.count(), 0);
    }

    #[tokio::test]
    async fn concurrent_tunnels_do_not_mix() {
        let registry = Arc::new(TunnelRegistry::new(None));
        let (shell_a, mut client_a) = mock_shell();
        let (shell_b, mut client_b) = mock_shell();
        let cfg = settings(Duration::from_secs(5));
        let task_a = tokio::spawn(serve(
            shell_a,
            registry.clone(),
            cfg.clone(),
            CancellationToken::new(),
        ));
        let task_b = tokio::spawn(serve(
            shell_b,
            registry.clone(),
            cfg,
            CancellationToken::new(),
        ));

        let id_a = client_a.tunnel_id().await;
        let id_b = client_b.tunnel_id().await;
        assert_ne!(id_a, id_b);

        let (handoff_a, mut rx_a) = handoff::channel(4);
        let (handoff_b, mut rx_b) = handoff::channel(4);
        registry.lookup_and_consume(id_b).unwrap().deliver(handoff_b).unwrap();
        registry.lookup_and_consume(id_a).unwrap().deliver(handoff_a).unwrap();

        client_a.inbound.send(Inbound::Data(b"from a")).unwrap();
        client_b.inbound.send(Inbound::Data(b"from b")).unwrap();
        client_a.inbound.send(Inbound::Eof).unwrap();
        client_b.inbound.send(Inbound::Eof).unwrap();

        assert_eq!(drain(&mut rx_a).await, b"from a");
        assert_eq!(drain(&mut rx_b).await, b"from b");
        assert_eq!(task_a.await.unwrap(), TunnelState::Completed);
        assert_eq!(task_b.await.unwrap(), TunnelState::Completed);
    }

    #[test]
    fn terminal_states() {
        assert!(TunnelState::Completed.is_terminal());
        assert!(TunnelState::Expired.is_terminal());
        assert!(!TunnelState::Streaming.is_terminal());
        assert!(!TunnelState::AwaitingHandoff.is_terminal());
    }
}
