//! Tunnel rendezvous: the registry where shell sessions wait for viewers.

pub mod registry;

pub use registry::TunnelRegistry;
