//! Local forwarding proxy
//!
//! Accepts inbound TCP connections, optionally negotiates a minimal SOCKS5
//! handshake, and relays bytes bidirectionally between the client and a
//! destination until either side closes.
//!
//! Architecture:
//! - `core/`: session state machine, relay engine, accept loop, hooks
//! - `pool`: fixed-size worker pool bounding concurrent sessions
//! - `config`: CLI arguments and shared per-server options
//! - `logger`: tracing setup and structured log helpers

pub mod config;
pub mod core;
pub mod error;
pub mod logger;
pub mod pool;
