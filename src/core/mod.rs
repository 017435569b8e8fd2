//! Core proxy module
//!
//! This module contains the core forwarding functionality:
//! - Protocol parsing (SOCKS5 subset)
//! - Session lifecycle
//! - Bidirectional relay
//! - Hook traits for data observation

pub mod hooks;
mod relay;
mod server;
mod session;
mod socks5;

pub use relay::{relay, READ_CHUNK};
pub use server::ForwardServer;
pub use session::Session;
pub use socks5::{DestAddr, Socks5Cmd, Socks5Request};
