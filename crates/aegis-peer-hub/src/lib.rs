//! Concurrent registry of connected agents: O(1) lookup by stable identity
//! and by the synthetic hostname derived from it.

#[macro_use]
extern crate tracing;

mod id;

use std::collections::HashMap;
use std::sync::Arc;

use aegis_muxer::Muxer;
use parking_lot::RwLock;

pub use id::AgentId;

/// Descriptive metadata about a peer, gathered at handshake time. None of
/// this is required for routing; it only informs logging/diagnostics.
#[derive(Debug, Clone, Default)]
pub struct PeerInfo {
    pub machine_id: String,
    pub os: Option<String>,
    pub arch: Option<String>,
    pub hostname: Option<String>,
    pub external_ip: Option<String>,
    pub semver: Option<String>,
}

pub struct Peer {
    id: AgentId,
    info: PeerInfo,
    muxer: Arc<dyn Muxer>,
}

impl Peer {
    #[must_use]
    pub fn new(id: AgentId, info: PeerInfo, muxer: Arc<dyn Muxer>) -> Self {
        Self { id, info, muxer }
    }

    #[must_use]
    pub fn id(&self) -> &AgentId {
        &self.id
    }

    #[must_use]
    pub fn info(&self) -> &PeerInfo {
        &self.info
    }

    #[must_use]
    pub fn muxer(&self) -> &Arc<dyn Muxer> {
        &self.muxer
    }

    /// Hostname derivation is total and deterministic from the identity.
    #[must_use]
    pub fn hostname(&self, domain: &str) -> String {
        self.id.hostname(domain)
    }
}

struct HubState {
    by_id: HashMap<AgentId, Arc<Peer>>,
    by_hostname: HashMap<String, AgentId>,
}

/// Capacity is advisory: exceeding it never breaks correctness, only logs a
/// warning.
pub struct PeerHub {
    domain: String,
    capacity: Option<usize>,
    state: RwLock<HubState>,
}

impl PeerHub {
    #[must_use]
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            capacity: None,
            state: RwLock::new(HubState {
                by_id: HashMap::new(),
                by_hostname: HashMap::new(),
            }),
        }
    }

    #[must_use]
    pub fn with_capacity(domain: impl Into<String>, capacity: usize) -> Self {
        let mut hub = Self::new(domain);
        hub.capacity = Some(capacity);
        hub
    }

    #[must_use]
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Returns `false` iff a peer with the same identity is already present.
    pub fn put(&self, peer: Peer) -> bool {
        let hostname = peer.hostname(&self.domain);
        let id = peer.id.clone();

        let mut state = self.state.write();
        if state.by_id.contains_key(&id) {
            return false;
        }

        if let Some(capacity) = self.capacity {
            if state.by_id.len() >= capacity {
                warn!(capacity, current = state.by_id.len(), "peer hub exceeding advisory capacity");
            }
        }

        state.by_id.insert(id.clone(), Arc::new(peer));
        state.by_hostname.insert(hostname, id);
        true
    }

    #[must_use]
    pub fn get(&self, hostname: &str) -> Option<Arc<Peer>> {
        let state = self.state.read();
        let id = state.by_hostname.get(hostname)?;
        state.by_id.get(id).cloned()
    }

    #[must_use]
    pub fn get_by_id(&self, id: &AgentId) -> Option<Arc<Peer>> {
        self.state.read().by_id.get(id).cloned()
    }

    /// Idempotent.
    pub fn del(&self, hostname: &str) {
        let mut state = self.state.write();
        if let Some(id) = state.by_hostname.remove(hostname) {
            state.by_id.remove(&id);
        }
    }

    /// Idempotent.
    pub fn del_by_id(&self, id: &AgentId) {
        let hostname = id.hostname(&self.domain);
        let mut state = self.state.write();
        state.by_id.remove(id);
        state.by_hostname.remove(&hostname);
    }

    #[must_use]
    pub fn peers(&self) -> Vec<Arc<Peer>> {
        self.state.read().by_id.values().cloned().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.state.read().by_id.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
