//! Tunnel identifiers.
//!
//! An identifier is the only thing the shell side and the HTTP side share:
//! the broker prints it into the shell session, and the viewer passes it back
//! as `?id=<identifier>`. Identifiers are drawn at random rather than counted
//! so that they cannot be guessed from one another.

use crate::error::TunnelError;
use rand::Rng;
use std::fmt;
use std::str::FromStr;

/// Mask keeping the low 63 bits, so identifiers also fit a signed 64-bit int.
const ID_MASK: u64 = i64::MAX as u64;

/// Correlation key between one shell session and one HTTP request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TunnelId(u64);

impl TunnelId {
    /// Draw a fresh 63-bit identifier from the thread-local CSPRNG.
    ///
    /// Collisions with other open tunnels are not ruled out here; the
    /// registry rejects them with `DuplicateIdentifier`.
    pub fn generate() -> Self {
        Self(rand::thread_rng().gen::<u64>() & ID_MASK)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl From<u64> for TunnelId {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for TunnelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TunnelId {
    type Err = TunnelError;

    /// Accepts plain decimal digits only: no sign, no whitespace.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(TunnelError::BadRequest(format!(
                "tunnel id must be a decimal integer, got {s:?}"
            )));
        }
        s.parse::<u64>()
            .map(Self)
            .map_err(|e| TunnelError::BadRequest(format!("tunnel id out of range: {e}")))
    }
}
