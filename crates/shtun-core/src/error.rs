use crate::identity::TunnelId;
use thiserror::Error;

/// Errors produced while brokering a tunnel.
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("tunnel does not exist: {0}")]
    NotFound(TunnelId),

    #[error("duplicate tunnel identifier: {0}")]
    DuplicateIdentifier(TunnelId),

    #[error("tunnel {0} expired before a viewer connected")]
    TunnelExpired(TunnelId),

    #[error("tunnel {0} was abandoned by the shell side")]
    Abandoned(TunnelId),

    #[error("stream error: {0}")]
    Stream(String),

    #[error("too many pending tunnels (max {0})")]
    CapacityExceeded(usize),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("cancelled")]
    Cancelled,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type TunnelResult<T> = Result<T, TunnelError>;
