//! The one-shot transfer between the HTTP side and the shell side.
//!
//! The HTTP bridge creates a [`Handoff`] and keeps the matching
//! [`HandoffReceiver`]. The shell session takes the handoff apart into a
//! [`StreamSink`] (where it writes the bytes it reads) and a
//! [`CompletionSignal`] (fired once the copy is over).
//!
//! The session must drop the sink before firing the signal, so that the
//! receiver drains every chunk before it learns the outcome.

use crate::error::{TunnelError, TunnelResult};
use tokio::sync::{mpsc, oneshot};

/// How a tunnel's stream ended, as reported to the HTTP side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelOutcome {
    /// The shell side reached end-of-stream and everything was forwarded.
    Completed { bytes: u64 },
    /// Copying stopped on an error.
    Failed(String),
    /// The shell side went away without reporting anything.
    Aborted,
}

impl TunnelOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, TunnelOutcome::Completed { .. })
    }
}

/// Create a connected handoff pair. `buffer` is the number of chunks that may
/// be in flight before the writer waits for the reader.
pub fn channel(buffer: usize) -> (Handoff, HandoffReceiver) {
    let (chunk_tx, chunk_rx) = mpsc::channel(buffer.max(1));
    let (done_tx, done_rx) = oneshot::channel();
    (
        Handoff {
            sink: StreamSink { tx: chunk_tx },
            completion: CompletionSignal { tx: Some(done_tx) },
        },
        HandoffReceiver {
            chunks: chunk_rx,
            done: done_rx,
        },
    )
}

/// Everything the shell side needs to serve one viewer.
#[derive(Debug)]
pub struct Handoff {
    sink: StreamSink,
    completion: CompletionSignal,
}

impl Handoff {
    pub fn into_parts(self) -> (StreamSink, CompletionSignal) {
        (self.sink, self.completion)
    }
}

/// Write half of the tunnel body.
#[derive(Debug)]
pub struct StreamSink {
    tx: mpsc::Sender<Vec<u8>>,
}

impl StreamSink {
    /// Forward one chunk. Waits while the reader is `buffer` chunks behind.
    pub async fn write(&self, chunk: Vec<u8>) -> TunnelResult<()> {
        self.tx
            .send(chunk)
            .await
            .map_err(|_| TunnelError::Stream("viewer disconnected".into()))
    }

    /// Resolves once the HTTP side has stopped reading.
    pub async fn closed(&self) {
        self.tx.closed().await
    }
}

/// Fires exactly once: explicitly through [`CompletionSignal::fire`], or
/// with [`TunnelOutcome::Aborted`] when dropped unfired.
#[derive(Debug)]
pub struct CompletionSignal {
    tx: Option<oneshot::Sender<TunnelOutcome>>,
}

impl CompletionSignal {
    pub fn fire(mut self, outcome: TunnelOutcome) {
        if let Some(tx) = self.tx.take() {
            // The viewer may already be gone; nobody is left to tell.
            let _ = tx.send(outcome);
        }
    }
}

impl Drop for CompletionSignal {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(TunnelOutcome::Aborted);
        }
    }
}

/// The HTTP side's end of a handoff.
#[derive(Debug)]
pub struct HandoffReceiver {
    chunks: mpsc::Receiver<Vec<u8>>,
    done: oneshot::Receiver<TunnelOutcome>,
}

impl HandoffReceiver {
    /// Next chunk in write order; `None` once the sink has been dropped.
    pub async fn next_chunk(&mut self) -> Option<Vec<u8>> {
        self.chunks.recv().await
    }

    /// Wait for the completion signal.
    pub async fn outcome(self) -> TunnelOutcome {
        self.done.await.unwrap_or(TunnelOutcome::Aborted)
    }
}
