//! Per-peer session state.
//!
//! Sessions live in an arena keyed by [`PeerId`]; the template engine holds
//! ids, never references, so no cycle exists between the connection manager
//! and the engine. One mutex guards each session, one guards the map.

use std::{collections::HashMap, sync::Arc};

use tp_codec::{parser::TpMessage, template_distribution::CoinbaseOutputConstraints};

use crate::{
    error::TpError,
    mining::{CoinbaseTemplate, TxEntry},
    utils::Mutex,
};

pub type PeerId = u64;

/// Where a connection is in its lifecycle. The Noise handshake happens
/// before a session exists; a session is created in `Setup`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    /// Waiting for `SetupConnection`.
    Setup,
    /// Setup accepted; waiting for `CoinbaseOutputConstraints`.
    ConstrainedWait,
    /// Receiving templates; may submit solutions.
    Streaming,
    Closed,
}

/// A template as sent to one peer, kept until its prev-hash epoch ends.
#[derive(Debug, Clone)]
pub struct TemplateRecord {
    pub template_id: u64,
    pub prev_hash: [u8; 32],
    pub coinbase: CoinbaseTemplate,
    pub transactions: Vec<TxEntry>,
    pub fees: i64,
}

/// Everything the provider tracks about one connected peer.
#[derive(Debug)]
pub struct ClientSession {
    pub id: PeerId,
    pub phase: Phase,
    pub used_version: u16,
    /// Flags the peer declared in `SetupConnection`; advisory.
    pub flags: u32,
    pub constraints: Option<CoinbaseOutputConstraints>,
    /// Templates sent to this peer and still submittable.
    pub templates: HashMap<u64, TemplateRecord>,
    /// Fingerprint of the last template delivered, to suppress redundant
    /// pushes.
    pub last_fingerprint: Option<[u8; 32]>,
    /// Bounded queue drained by the peer's send task. Each item is queued
    /// atomically, so a template pair can never interleave.
    pub outbound: async_channel::Sender<Vec<TpMessage>>,
}

impl ClientSession {
    pub fn new(id: PeerId, outbound: async_channel::Sender<Vec<TpMessage>>) -> Self {
        Self {
            id,
            phase: Phase::Setup,
            used_version: 0,
            flags: 0,
            constraints: None,
            templates: HashMap::new(),
            last_fingerprint: None,
            outbound,
        }
    }

    /// Drops every record outside the given prev-hash epoch.
    pub fn prune_epoch(&mut self, prev_hash: [u8; 32]) {
        self.templates.retain(|_, record| record.prev_hash == prev_hash);
    }
}

pub type SharedSession = Arc<Mutex<ClientSession>>;

/// The arena of live sessions.
#[derive(Default)]
pub struct PeerMap {
    inner: Mutex<HashMap<PeerId, SharedSession>>,
}

impl PeerMap {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert(&self, id: PeerId, session: SharedSession) -> Result<(), TpError> {
        self.inner.safe_lock(|map| {
            map.insert(id, session);
        })?;
        Ok(())
    }

    pub fn remove(&self, id: PeerId) -> Result<Option<SharedSession>, TpError> {
        Ok(self.inner.safe_lock(|map| map.remove(&id))?)
    }

    pub fn get(&self, id: PeerId) -> Result<Option<SharedSession>, TpError> {
        Ok(self.inner.safe_lock(|map| map.get(&id).cloned())?)
    }

    pub fn len(&self) -> Result<usize, TpError> {
        Ok(self.inner.safe_lock(|map| map.len())?)
    }

    pub fn is_empty(&self) -> Result<bool, TpError> {
        Ok(self.len()? == 0)
    }

    /// Snapshot of sessions currently in [`Phase::Streaming`].
    pub fn streaming(&self) -> Result<Vec<SharedSession>, TpError> {
        let sessions =
            self.inner.safe_lock(|map| map.values().cloned().collect::<Vec<_>>())?;
        let mut streaming = Vec::new();
        for session in sessions {
            if session.safe_lock(|s| s.phase == Phase::Streaming)? {
                streaming.push(session);
            }
        }
        Ok(streaming)
    }

    /// Closes every session and empties the arena. Used on node loss and at
    /// shutdown.
    pub fn close_all(&self) -> Result<(), TpError> {
        let sessions = self.inner.safe_lock(|map| {
            let all: Vec<_> = map.values().cloned().collect();
            map.clear();
            all
        })?;
        for session in sessions {
            session.safe_lock(|s| {
                s.phase = Phase::Closed;
                s.outbound.close();
            })?;
        }
        Ok(())
    }
}
