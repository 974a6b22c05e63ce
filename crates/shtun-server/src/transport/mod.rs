//! Network transports: the SSH listener (shell side) and the HTTP bridge
//! (viewer side).

pub mod http;
pub mod ssh;
