//! shtun-core: shared primitives for the shell-to-HTTP tunnel broker.
//!
//! Provides tunnel identifiers, the one-shot handoff between the HTTP and
//! shell sides, the error taxonomy, and the abstract shell channel trait.

pub mod error;
pub mod handoff;
pub mod identity;
pub mod transport;

// Re-export commonly used items at crate root.
pub use error::{TunnelError, TunnelResult};
pub use handoff::{CompletionSignal, Handoff, HandoffReceiver, StreamSink, TunnelOutcome};
pub use identity::TunnelId;
pub use transport::ShellChannel;
