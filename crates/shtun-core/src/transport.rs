//! Abstract shell channel for shtun.
//!
//! The tunnel state machine talks to the shell client only through this
//! trait. The SSH listener implements it over a russh channel; tests
//! implement it in memory.

use crate::error::TunnelResult;
use std::future::Future;

/// One shell-protocol channel, as seen by the tunnel.
pub trait ShellChannel: Send {
    /// Next chunk of bytes sent by the client.
    ///
    /// `Ok(None)` means a clean end-of-stream. An error means the channel
    /// went away before the client signalled end-of-stream.
    fn recv(&mut self) -> impl Future<Output = TunnelResult<Option<Vec<u8>>>> + Send;

    /// Write bytes to the client's terminal.
    fn send(&mut self, data: &[u8]) -> impl Future<Output = TunnelResult<()>> + Send;

    /// Report `exit_status` and close the channel.
    fn finish(&mut self, exit_status: u32) -> impl Future<Output = TunnelResult<()>> + Send;
}
