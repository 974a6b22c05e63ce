//! Shell-side tunnel sessions.

pub mod tunnel;
