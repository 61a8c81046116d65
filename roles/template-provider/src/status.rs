//! Status reporting and shutdown coordination.
//!
//! Tasks send a [`Status`] through a channel, tagged with a [`Sender`] to
//! show where it came from; the supervisor decides whether the event is
//! routine or ends the process. Shutdown itself is a single watch flag every
//! task checks between suspension points.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::session::PeerId;

/// Counters exposed for logs and tests.
#[derive(Debug, Default)]
pub struct Stats {
    pub handshake_failed: AtomicU64,
    pub peers_connected: AtomicU64,
    pub peers_disconnected: AtomicU64,
    pub templates_sent: AtomicU64,
    pub solutions_received: AtomicU64,
}

impl Stats {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

#[derive(Debug)]
pub enum State {
    /// A peer task ended; routine.
    PeerShutdown { peer: PeerId, reason: String },
    /// The template engine stopped and cannot recover.
    EngineShutdown(String),
    /// Informational.
    Healthy(String),
}

#[derive(Debug)]
pub struct Status {
    pub state: State,
}

/// Tags the sending side of the status channel with its component.
#[derive(Debug, Clone)]
pub enum Sender {
    Listener(async_channel::Sender<Status>),
    Peer(async_channel::Sender<Status>),
    Engine(async_channel::Sender<Status>),
}

impl Sender {
    /// Clones the listener's sender into one owned by a peer task.
    pub fn listener_to_peer(&self) -> Self {
        match self {
            Self::Listener(inner) => Self::Peer(inner.clone()),
            other => other.clone(),
        }
    }

    pub async fn send(&self, status: Status) -> Result<(), async_channel::SendError<Status>> {
        match self {
            Self::Listener(inner) | Self::Peer(inner) | Self::Engine(inner) => {
                inner.send(status).await
            }
        }
    }
}
