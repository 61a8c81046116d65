//! Stratum v2 Template Provider.
//!
//! Serves Bitcoin block templates to Template Distribution clients (Job
//! Declarators, Pool servers) over Noise-secured TCP connections. Consensus,
//! mempool, and block assembly stay behind the [`mining::Mining`] trait; this
//! crate owns the listener, the per-peer state machines, and the template
//! engine that decides what to push and when.

pub mod coinbase;
pub mod config;
pub mod connman;
pub mod engine;
pub mod error;
pub mod keys;
pub mod merkle;
pub mod mining;
pub mod mock_mining;
pub mod session;
pub mod status;
pub mod utils;

use std::{
    net::SocketAddr,
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use tokio::{net::TcpListener, sync::watch, task::JoinHandle, time::timeout};
use tracing::{debug, info, warn};

use tp_noise::Certificate;

use crate::{
    config::TpOptions,
    connman::ConnCtx,
    engine::TemplateEngine,
    error::TpResult,
    keys::TpKeys,
    mining::Mining,
    session::PeerMap,
    status::{State, Stats, Status},
};

/// Validity of the certificate starts this far in the past to absorb clock
/// skew between provider and clients.
const CERT_BACKDATE_SECS: u32 = 3600;

/// A running provider: listener, per-peer tasks, and the template engine.
pub struct TemplateProvider {
    options: TpOptions,
    local_addr: SocketAddr,
    authority_public: [u8; 32],
    static_public: [u8; 32],
    peers: Arc<PeerMap>,
    stats: Arc<Stats>,
    shutdown_tx: watch::Sender<bool>,
    status_rx: async_channel::Receiver<Status>,
    tasks: Vec<JoinHandle<()>>,
}

impl TemplateProvider {
    /// Binds the listener, loads (or creates) the key material, signs the
    /// session certificate, and spawns the listener and engine tasks.
    pub async fn start(options: TpOptions, mining: Arc<dyn Mining>) -> TpResult<Self> {
        options.validate()?;

        let keys = TpKeys::load_or_generate(&options.data_dir)?;
        keys.log_identity();

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let now = u32::try_from(now).unwrap_or(u32::MAX);
        let certificate = Certificate::sign(
            0,
            now.saturating_sub(CERT_BACKDATE_SECS),
            u32::MAX,
            keys.static_public(),
            &keys.authority,
        );

        let listener = TcpListener::bind((options.host.as_str(), options.port)).await?;
        let local_addr = listener.local_addr()?;
        info!("Listening for Stratum v2 connections on {local_addr}");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (status_tx, status_rx) = async_channel::bounded(64);
        let (engine_tx, engine_rx) = async_channel::bounded(64);
        let peers = PeerMap::new();
        let stats = Arc::new(Stats::default());

        let engine = TemplateEngine::new(
            mining,
            peers.clone(),
            engine_rx,
            engine_tx.clone(),
            options.clone(),
            stats.clone(),
            status::Sender::Engine(status_tx.clone()),
            shutdown_rx.clone(),
        );

        let ctx = Arc::new(ConnCtx {
            options: options.clone(),
            static_secret: keys.static_secret,
            certificate,
            peers: peers.clone(),
            engine_tx,
            stats: stats.clone(),
            shutdown: shutdown_rx,
        });

        let tasks = vec![
            tokio::spawn(engine.run()),
            tokio::spawn(connman::accept_loop(
                listener,
                ctx,
                status::Sender::Listener(status_tx),
            )),
        ];

        Ok(Self {
            options,
            local_addr,
            authority_public: keys.authority_public(),
            static_public: keys.static_public(),
            peers,
            stats,
            shutdown_tx,
            status_rx,
            tasks,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The x-only authority public key clients pin.
    pub fn authority_public(&self) -> [u8; 32] {
        self.authority_public
    }

    pub fn static_public(&self) -> [u8; 32] {
        self.static_public
    }

    pub fn stats(&self) -> Arc<Stats> {
        self.stats.clone()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len().unwrap_or(0)
    }

    /// Consumes status reports until one is fatal; returns its reason.
    pub async fn wait_fatal(&mut self) -> String {
        loop {
            match self.status_rx.recv().await {
                Ok(Status {
                    state: State::EngineShutdown(reason),
                }) => return reason,
                Ok(Status {
                    state: State::PeerShutdown { peer, reason },
                }) => debug!("Client id={peer} task ended: {reason}"),
                Ok(Status {
                    state: State::Healthy(message),
                }) => debug!("{message}"),
                Err(_) => return "status channel closed".to_string(),
            }
        }
    }

    /// Signals every task, closes the peers, and waits up to the configured
    /// grace period for the tasks to drain.
    pub async fn shutdown(mut self) {
        info!("Shutting down");
        let _ = self.shutdown_tx.send(true);
        let _ = self.peers.close_all();
        for task in self.tasks.drain(..) {
            let aborter = task.abort_handle();
            if timeout(self.options.shutdown_grace, task).await.is_err() {
                warn!("Task did not stop within the grace period, aborting");
                aborter.abort();
            }
        }
        let _ = self.status_rx.close();
    }
}

/// Re-exported event type for embedders that drive the engine directly.
pub use engine::fingerprint;
pub use engine::EngineEvent as TemplateEngineEvent;
