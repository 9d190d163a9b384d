//! pairlink Client Library
//!
//! Peer sessions on top of the pairlink core: the per-peer protocol state
//! machine, its direct and relayed links, connection negotiation and the
//! registry that routes signaling traffic to sessions.

pub mod config;
pub mod events;
pub mod loopback;
pub mod registry;
pub mod session;
