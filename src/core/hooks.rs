//! Hook traits for extensibility
//!
//! Defines the observation points that let callers watch per-session byte
//! flow without touching the relay itself.

use std::net::SocketAddr;
use std::sync::Arc;

/// Observer for one direction of a session's byte flow
///
/// Synchronous: hooks run on the relay hot path between drain and forward,
/// so an implementation must not block.
pub trait DataHook: Send + Sync {
    /// Called with every drained buffer before it is forwarded to the peer
    fn on_data(&self, peer: SocketAddr, data: &[u8]);
}

impl<F> DataHook for F
where
    F: Fn(SocketAddr, &[u8]) + Send + Sync,
{
    fn on_data(&self, peer: SocketAddr, data: &[u8]) {
        self(peer, data)
    }
}

/// Optional outbound/inbound observers shared by all sessions of one server
///
/// Registered into the options before the accept loop starts; read-only
/// afterward.
#[derive(Clone, Default)]
pub struct HookRegistry {
    outbound: Option<Arc<dyn DataHook>>,
    inbound: Option<Arc<dyn DataHook>>,
}

impl HookRegistry {
    /// Register the observer for client → destination bytes
    pub fn set_outbound(&mut self, hook: Arc<dyn DataHook>) {
        self.outbound = Some(hook);
    }

    /// Register the observer for destination → client bytes
    pub fn set_inbound(&mut self, hook: Arc<dyn DataHook>) {
        self.inbound = Some(hook);
    }

    pub fn observe_outbound(&self, peer: SocketAddr, data: &[u8]) {
        if let Some(hook) = &self.outbound {
            hook.on_data(peer, data);
        }
    }

    pub fn observe_inbound(&self, peer: SocketAddr, data: &[u8]) {
        if let Some(hook) = &self.inbound {
            hook.on_data(peer, data);
        }
    }
}
