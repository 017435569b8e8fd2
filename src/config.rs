//! Configuration module for the forwarding proxy
//!
//! This module handles CLI argument parsing with environment variable support
//! and holds the shared per-server options that sessions read at runtime.

use anyhow::{anyhow, Result};
use clap::{Parser, ValueEnum};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::core::hooks::{DataHook, HookRegistry};

/// Parse duration string (e.g., "30s", "2m", "1h") or plain seconds
fn parse_duration(s: &str) -> Result<Duration, String> {
    // Try parsing as humantime duration first (e.g., "30s", "2m", "1h30m")
    if let Ok(d) = humantime::parse_duration(s) {
        return Ok(d);
    }
    // Fall back to parsing as plain seconds for backwards compatibility
    s.parse::<u64>().map(Duration::from_secs).map_err(|_| {
        format!(
            "Invalid duration '{}'. Use formats like '30s', '2m', '1h' or plain seconds",
            s
        )
    })
}

/// Forwarding backend selected for every accepted connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ForwardMode {
    /// Relay to the preconfigured remote address, no handshake
    Raw,
    /// Negotiate a minimal SOCKS5 handshake and relay to the requested destination
    Socks5,
}

impl fmt::Display for ForwardMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ForwardMode::Raw => write!(f, "raw"),
            ForwardMode::Socks5 => write!(f, "socks5"),
        }
    }
}

/// CLI arguments for the forwarding proxy
///
/// Supports environment variables with LOCALFORWARD_ prefix
#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Local raw/SOCKS5 forwarding proxy")]
pub struct CliArgs {
    /// Which host is listened
    #[arg(
        short = 'l',
        long = "listen-host",
        env = "LOCALFORWARD_LISTEN_HOST",
        default_value = "127.0.0.1"
    )]
    pub host: String,

    /// The port that will be listened
    #[arg(short = 'p', long, env = "LOCALFORWARD_PORT", default_value_t = 8010)]
    pub port: u16,

    /// Which host raw mode forwards to
    #[arg(long = "remote-host", env = "LOCALFORWARD_REMOTE_HOST")]
    pub remote_host: Option<String>,

    /// The port of the remote host
    #[arg(long = "remote-port", env = "LOCALFORWARD_REMOTE_PORT")]
    pub remote_port: Option<u16>,

    /// Timeout bounding handshake and outbound dial (e.g., "30s", "1m", or plain seconds)
    #[arg(long, env = "LOCALFORWARD_TIMEOUT", default_value = "30s", value_parser = parse_duration)]
    pub timeout: Duration,

    /// How many connections are handled at the same time (also the listen backlog)
    #[arg(long, env = "LOCALFORWARD_SIZE", default_value_t = 20)]
    pub size: usize,

    /// What type of forward
    #[arg(
        long = "type",
        env = "LOCALFORWARD_TYPE",
        value_enum,
        default_value_t = ForwardMode::Socks5
    )]
    pub mode: ForwardMode,

    /// Log level: trace, debug, info, warn, error (default: info)
    #[arg(long, env = "LOCALFORWARD_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl CliArgs {
    /// Parse CLI arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Validate the CLI arguments
    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(anyhow!("listen host cannot be empty"));
        }
        if self.size == 0 {
            return Err(anyhow!("size must be at least 1"));
        }
        if self.mode == ForwardMode::Raw
            && (self.remote_host.is_none() || self.remote_port.is_none())
        {
            return Err(anyhow!(
                "raw forwarding requires --remote-host and --remote-port"
            ));
        }
        Ok(())
    }

    /// Build the server configuration from the parsed arguments
    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            host: self.host.clone(),
            port: self.port,
            mode: self.mode,
            size: self.size,
        }
    }

    /// Build the shared session options from the parsed arguments
    pub fn options(&self) -> Options {
        let remote_addr = match (&self.remote_host, self.remote_port) {
            (Some(host), Some(port)) => Some((host.clone(), port)),
            _ => None,
        };
        Options::new(self.timeout, remote_addr)
    }
}

/// Listener-side configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub mode: ForwardMode,
    /// Worker pool size; also used as the listen backlog
    pub size: usize,
}

/// Shared per-server options read by every session
///
/// Written only during setup (hook registration happens before the accept
/// loop starts); read-only once the server is serving.
pub struct Options {
    /// Bounds handshake reads and the outbound dial; relaying itself has no idle timeout
    pub timeout: Duration,
    /// Destination for raw passthrough, unused in socks5 mode
    pub remote_addr: Option<(String, u16)>,
    /// Observation points for per-session byte flow
    pub hooks: HookRegistry,
}

impl Options {
    pub fn new(timeout: Duration, remote_addr: Option<(String, u16)>) -> Self {
        Self {
            timeout,
            remote_addr,
            hooks: HookRegistry::default(),
        }
    }

    /// Register a hook observing client → destination bytes
    pub fn set_outbound_hook(&mut self, hook: Arc<dyn DataHook>) {
        self.hooks.set_outbound(hook);
    }

    /// Register a hook observing destination → client bytes
    pub fn set_inbound_hook(&mut self, hook: Arc<dyn DataHook>) {
        self.hooks.set_inbound(hook);
    }
}

impl Default for Options {
    fn default() -> Self {
        Self::new(Duration::from_secs(30), None)
    }
}
