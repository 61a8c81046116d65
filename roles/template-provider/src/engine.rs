//! The template engine.
//!
//! One process-wide task owns the [`Mining`] handle. It reacts to tip
//! changes (pushed by a watcher sub-task), a periodic fee check, peers
//! entering the streaming phase, transaction-data requests, and submitted
//! solutions. Template ids are monotonic across the process, starting at 1;
//! every broadcast queues `NewTemplate` and `SetNewPrevHash` back-to-back,
//! and all peers see template N before any peer sees N+1.

use std::{
    collections::HashMap,
    convert::TryFrom,
    sync::Arc,
    time::{Duration, Instant},
};

use async_channel::{Receiver, Sender, TrySendError};
use secp256k1::hashes::{sha256::Hash as Sha256Hash, Hash};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use tp_codec::{
    datatypes::{Seq064K, B016M, B064K, U256},
    parser::TpMessage,
    template_distribution::{
        NewTemplate, RequestTransactionDataError, RequestTransactionDataSuccess, SetNewPrevHash,
        SubmitSolution, ERROR_CODE_STALE_TEMPLATE_ID, ERROR_CODE_TEMPLATE_ID_NOT_FOUND,
    },
};

use crate::{
    coinbase,
    config::TpOptions,
    error::{TpError, TpResult},
    merkle,
    mining::{BlockCreateOptions, BlockRef, BlockTemplate, BlockWaitOptions, Mining, NodeError, TemplateData},
    session::{PeerId, PeerMap, TemplateRecord},
    status::{self, Stats},
};

/// How long submitted-against templates from a previous epoch stay cached.
const PRUNE_GRACE: Duration = Duration::from_secs(10);

/// Everything the engine reacts to.
#[derive(Debug)]
pub enum EngineEvent {
    TipChanged(BlockRef),
    /// A peer finished setup and declared its coinbase constraints.
    PeerStreaming(PeerId),
    PeerGone(PeerId),
    Solution {
        peer: PeerId,
        solution: SubmitSolution,
    },
    TxDataRequest {
        peer: PeerId,
        template_id: u64,
    },
}

/// Digest that detects material template changes:
/// `SHA256(prev_hash || coinbase_skeleton || tx_count:u32 || txids)`.
pub fn fingerprint(data: &TemplateData) -> [u8; 32] {
    let skeleton = coinbase::serialize_skeleton(&data.coinbase);
    let mut buf =
        Vec::with_capacity(32 + skeleton.len() + 4 + data.transactions.len() * 32);
    buf.extend_from_slice(&data.prev_hash);
    buf.extend_from_slice(&skeleton);
    buf.extend_from_slice(&(data.transactions.len() as u32).to_le_bytes());
    for tx in &data.transactions {
        buf.extend_from_slice(&tx.txid);
    }
    Sha256Hash::hash(&buf).to_byte_array()
}

pub struct TemplateEngine {
    mining: Arc<dyn Mining>,
    peers: Arc<PeerMap>,
    events: Receiver<EngineEvent>,
    events_tx: Sender<EngineEvent>,
    options: TpOptions,
    stats: Arc<Stats>,
    status_tx: status::Sender,
    shutdown: watch::Receiver<bool>,
    next_id: u64,
    current: Option<Arc<dyn BlockTemplate>>,
    /// Process-wide template lookup for solution submission. Entries survive
    /// their epoch for a grace window so late solutions still resolve.
    cache: HashMap<u64, Arc<dyn BlockTemplate>>,
    best_prev_hash: Option<[u8; 32]>,
    last_sent_fees: i64,
    last_tip_change: Instant,
}

impl TemplateEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        mining: Arc<dyn Mining>,
        peers: Arc<PeerMap>,
        events: Receiver<EngineEvent>,
        events_tx: Sender<EngineEvent>,
        options: TpOptions,
        stats: Arc<Stats>,
        status_tx: status::Sender,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            mining,
            peers,
            events,
            events_tx,
            options,
            stats,
            status_tx,
            shutdown,
            next_id: 1,
            current: None,
            cache: HashMap::new(),
            best_prev_hash: None,
            last_sent_fees: 0,
            last_tip_change: Instant::now(),
        }
    }

    pub async fn run(mut self) {
        let watcher = tokio::spawn(tip_watcher(
            self.mining.clone(),
            self.events_tx.clone(),
            self.shutdown.clone(),
        ));

        let mut fee_timer = tokio::time::interval(self.options.fee_check_interval);
        fee_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let mut shutdown = self.shutdown.clone();
        let events = self.events.clone();
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                event = events.recv() => match event {
                    Ok(event) => {
                        if let Err(error) = self.handle_event(event).await {
                            error!("Template engine stopping: {error}");
                            break;
                        }
                    }
                    Err(_) => break,
                },
                _ = fee_timer.tick() => {
                    if let Err(error) = self.check_fee_improvement().await {
                        error!("Template engine stopping: {error}");
                        break;
                    }
                }
            }
        }
        watcher.abort();
        debug!("Template engine stopped");
    }

    async fn handle_event(&mut self, event: EngineEvent) -> TpResult<()> {
        match event {
            EngineEvent::TipChanged(tip) => self.handle_tip_changed(tip).await,
            EngineEvent::PeerStreaming(id) => self.handle_peer_streaming(id).await,
            EngineEvent::PeerGone(id) => {
                debug!("Client id={id} gone");
                Ok(())
            }
            EngineEvent::Solution { peer, solution } => self.handle_solution(peer, solution).await,
            EngineEvent::TxDataRequest { peer, template_id } => {
                self.handle_tx_data(peer, template_id)
            }
        }
    }

    async fn handle_tip_changed(&mut self, tip: BlockRef) -> TpResult<()> {
        info!("New best tip at height {}", tip.height);
        self.last_tip_change = Instant::now();
        self.best_prev_hash = Some(tip.hash);

        if self.peers.streaming()?.is_empty() {
            self.current = None;
            return Ok(());
        }
        match self.build_template().await {
            Ok(handle) => self.broadcast(handle)?,
            Err(error) => self.node_failure(error).await,
        }
        Ok(())
    }

    async fn handle_peer_streaming(&mut self, id: PeerId) -> TpResult<()> {
        debug!("Client id={id} declared constraints, serving templates");
        match self.build_template().await {
            Ok(handle) => self.broadcast(handle),
            Err(error) => {
                self.node_failure(error).await;
                Ok(())
            }
        }
    }

    /// Builds a candidate reserving the most permissive constraints any
    /// streaming peer declared; reserving more than a peer asked for is
    /// always safe.
    async fn build_template(&self) -> Result<Arc<dyn BlockTemplate>, NodeError> {
        let mut max_size = 0u32;
        let mut max_sigops = 0u16;
        if let Ok(streaming) = self.peers.streaming() {
            for session in streaming {
                if let Ok(Some(constraints)) = session.safe_lock(|s| s.constraints) {
                    max_size = max_size.max(constraints.coinbase_output_max_additional_size);
                    max_sigops = max_sigops.max(constraints.coinbase_output_max_sigops);
                }
            }
        }
        self.mining
            .create_new_block(BlockCreateOptions {
                use_mempool: true,
                coinbase_output_max_additional_size: max_size,
                coinbase_output_max_sigops: max_sigops,
            })
            .await
    }

    /// Periodic fee check: ask the node for a better candidate on the
    /// current tip and push it when the improvement clears the configured
    /// delta.
    async fn check_fee_improvement(&mut self) -> TpResult<()> {
        self.prune_cache();

        let Some(current) = self.current.clone() else {
            return Ok(());
        };
        if self.peers.streaming()?.is_empty() {
            return Ok(());
        }

        let wait = BlockWaitOptions {
            timeout: if self.options.is_test {
                Duration::from_millis(50)
            } else {
                Duration::from_secs(1)
            },
            fee_threshold: self.options.fee_delta,
        };
        let Some(next) = current.wait_next(wait).await else {
            return Ok(());
        };

        if Some(next.data().prev_hash) != self.best_prev_hash {
            // The tip watcher delivers the authoritative event; push now and
            // let its rebuild be fingerprint-suppressed.
            self.last_tip_change = Instant::now();
            self.best_prev_hash = Some(next.data().prev_hash);
            return self.broadcast(next);
        }

        let fees = next.data().total_fees();
        let improvement = fees - self.last_sent_fees;
        if improvement >= self.options.fee_delta {
            debug!("Fees improved by {improvement} sat, pushing update");
            self.broadcast(next)
        } else {
            debug!("Fee improvement of {improvement} sat below delta, suppressing");
            Ok(())
        }
    }

    fn alloc_template_id(&mut self) -> TpResult<u64> {
        if self.next_id == u64::MAX {
            error!("Template id counter exhausted");
            return Err(TpError::TemplateIdExhausted);
        }
        let id = self.next_id;
        self.next_id += 1;
        Ok(id)
    }

    /// Sends the template pair to every streaming peer whose last delivered
    /// fingerprint differs. A template id is only consumed when at least one
    /// peer needs the push.
    fn broadcast(&mut self, handle: Arc<dyn BlockTemplate>) -> TpResult<()> {
        let data = handle.data().clone();
        let digest = fingerprint(&data);
        let fees = data.total_fees();

        let mut eligible = Vec::new();
        for session in self.peers.streaming()? {
            if session.safe_lock(|s| s.last_fingerprint != Some(digest))? {
                eligible.push(session);
            }
        }
        if eligible.is_empty() {
            debug!("Template unchanged for all peers, nothing to push");
            return Ok(());
        }

        let template_id = self.alloc_template_id()?;
        let new_template = TpMessage::NewTemplate(NewTemplate {
            template_id,
            future_template: false,
            version: data.version,
            coinbase_tx_version: data.coinbase.version,
            coinbase_prefix: data
                .coinbase
                .script_sig_prefix
                .clone()
                .try_into()
                .map_err(TpError::Codec)?,
            coinbase_tx_input_sequence: data.coinbase.input_sequence,
            coinbase_tx_value_remaining: data.coinbase.value_remaining,
            coinbase_tx_outputs_count: data.coinbase.required_outputs_count,
            coinbase_tx_outputs: data
                .coinbase
                .required_outputs
                .clone()
                .try_into()
                .map_err(TpError::Codec)?,
            coinbase_tx_locktime: data.coinbase.lock_time,
            merkle_path: data
                .merkle_path
                .iter()
                .map(|hash| U256::from(*hash))
                .collect::<Vec<_>>()
                .try_into()
                .map_err(TpError::Codec)?,
        });
        let set_new_prev_hash = TpMessage::SetNewPrevHash(SetNewPrevHash {
            template_id,
            prev_hash: data.prev_hash.into(),
            header_timestamp: data.timestamp,
            n_bits: data.n_bits,
            target: data.target.into(),
        });

        let record = TemplateRecord {
            template_id,
            prev_hash: data.prev_hash,
            coinbase: data.coinbase.clone(),
            transactions: data.transactions.clone(),
            fees,
        };

        for session in eligible {
            session.safe_lock(|s| {
                // Both frames queued as one unit: NewTemplate always
                // precedes its SetNewPrevHash with nothing in between.
                match s
                    .outbound
                    .try_send(vec![new_template.clone(), set_new_prev_hash.clone()])
                {
                    Ok(()) => {
                        debug!(
                            "Send 0x71 NewTemplate and 0x72 SetNewPrevHash id={template_id} to client id={}",
                            s.id
                        );
                        s.templates.insert(template_id, record.clone());
                        s.prune_epoch(data.prev_hash);
                        s.last_fingerprint = Some(digest);
                        Stats::bump(&self.stats.templates_sent);
                    }
                    Err(TrySendError::Full(_)) => {
                        // Only the latest template matters; this peer will
                        // catch up on the next broadcast.
                        warn!(
                            "Outbound queue full, dropping template id={template_id} for client id={}",
                            s.id
                        );
                    }
                    Err(TrySendError::Closed(_)) => {}
                }
            })?;
        }

        info!("Template {template_id} includes {fees} sat in fees");
        self.cache.insert(template_id, handle.clone());
        self.current = Some(handle);
        self.best_prev_hash = Some(data.prev_hash);
        self.last_sent_fees = fees;
        Ok(())
    }

    async fn handle_solution(&mut self, peer: PeerId, solution: SubmitSolution) -> TpResult<()> {
        Stats::bump(&self.stats.solutions_received);
        debug!(
            "SubmitSolution template_id={} version={} timestamp={} nonce={} from client id={peer}",
            solution.template_id, solution.version, solution.header_timestamp, solution.header_nonce
        );

        let record = match self.peers.get(peer)? {
            Some(session) => {
                session.safe_lock(|s| s.templates.get(&solution.template_id).cloned())?
            }
            None => None,
        };
        let Some(record) = record else {
            // The protocol defines no solution-error reply; log and drop.
            warn!(
                "Solution for unknown or superseded template id={} from client id={peer}",
                solution.template_id
            );
            return Ok(());
        };

        let parsed =
            match coinbase::validate_submitted(solution.coinbase_tx.as_bytes(), &record.coinbase) {
                Ok(parsed) => parsed,
                Err(error) => {
                    warn!(
                        "Dropping solution for template id={}: {error}",
                        solution.template_id
                    );
                    return Ok(());
                }
            };

        let txids: Vec<[u8; 32]> = record.transactions.iter().map(|tx| tx.txid).collect();
        let path = merkle::merkle_path_for_coinbase(&txids);
        let root = merkle::root_from_path(parsed.txid, &path);
        debug!(
            "Solution coinbase spends {} sat, merkle root {}",
            parsed.output_value,
            hex::encode(root)
        );

        // The record stays cached: a second solution for the same template
        // can still arrive, and the node may keep the competing block.
        let Some(handle) = self.cache.get(&solution.template_id).cloned() else {
            debug!("Template id={} no longer in cache", solution.template_id);
            return Ok(());
        };
        let accepted = handle
            .submit_solution(
                solution.version,
                solution.header_timestamp,
                solution.header_nonce,
                solution.coinbase_tx.as_bytes().to_vec(),
            )
            .await;
        // Acceptance is advisory; clients observe the tip change instead.
        debug!(
            "submitSolution for template id={} accepted={accepted}",
            solution.template_id
        );
        Ok(())
    }

    fn handle_tx_data(&mut self, peer: PeerId, template_id: u64) -> TpResult<()> {
        let Some(session) = self.peers.get(peer)? else {
            return Ok(());
        };
        let record = session.safe_lock(|s| s.templates.get(&template_id).cloned())?;

        let reply = match record {
            None => {
                debug!(
                    "Send 0x75 RequestTransactionData.Error (template-id-not-found: {template_id}) to client id={peer}"
                );
                tx_data_error(template_id, ERROR_CODE_TEMPLATE_ID_NOT_FOUND)?
            }
            Some(record) if Some(record.prev_hash) != self.best_prev_hash => {
                debug!(
                    "Send 0x75 RequestTransactionData.Error (stale-template-id: {template_id}) to client id={peer}"
                );
                tx_data_error(template_id, ERROR_CODE_STALE_TEMPLATE_ID)?
            }
            Some(record) => {
                let raw: Result<Vec<B016M>, _> = record
                    .transactions
                    .iter()
                    .map(|tx| B016M::try_from(tx.raw.clone()))
                    .collect();
                let list = raw.and_then(Seq064K::try_from);
                match list {
                    Ok(transaction_list) => {
                        debug!(
                            "Send 0x74 RequestTransactionData.Success to client id={peer}"
                        );
                        TpMessage::RequestTransactionDataSuccess(RequestTransactionDataSuccess {
                            template_id,
                            excess_data: B064K::default(),
                            transaction_list,
                        })
                    }
                    Err(error) => {
                        warn!("Transaction list for template id={template_id} not representable: {error}");
                        return Ok(());
                    }
                }
            }
        };

        session.safe_lock(|s| {
            let _ = s.outbound.try_send(vec![reply]);
        })?;
        Ok(())
    }

    fn prune_cache(&mut self) {
        let grace = if self.options.is_test {
            Duration::from_millis(200)
        } else {
            PRUNE_GRACE
        };
        // Leave a window for solutions against the previous tip.
        if self.last_tip_change.elapsed() < grace {
            return;
        }
        if let Some(best) = self.best_prev_hash {
            self.cache.retain(|_, handle| handle.data().prev_hash == best);
        }
    }

    /// Node outage: close every peer and probe with exponential backoff
    /// until the node returns or the give-up threshold passes.
    async fn node_failure(&mut self, error: NodeError) {
        error!("Mining interface unavailable: {error}; disconnecting all clients");
        let _ = self.peers.close_all();
        self.current = None;
        self.cache.clear();
        self.best_prev_hash = None;
        self.last_sent_fees = 0;

        let started = Instant::now();
        let mut delay = self.options.node_retry_initial;
        let mut shutdown = self.shutdown.clone();
        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            if self.mining.get_tip().await.is_some() {
                info!(
                    "Mining interface recovered after {:.1}s",
                    started.elapsed().as_secs_f64()
                );
                return;
            }
            if started.elapsed() >= self.options.node_give_up {
                let _ = self
                    .status_tx
                    .send(status::Status {
                        state: status::State::EngineShutdown(
                            "mining interface unavailable past threshold".to_string(),
                        ),
                    })
                    .await;
                return;
            }
            delay = (delay * 2).min(self.options.node_retry_cap);
            warn!(
                "Mining interface still unavailable, retrying in {:.1}s",
                delay.as_secs_f64()
            );
        }
    }
}

fn tx_data_error(template_id: u64, code: &str) -> TpResult<TpMessage> {
    Ok(TpMessage::RequestTransactionDataError(
        RequestTransactionDataError {
            template_id,
            error_code: code.try_into().map_err(TpError::Codec)?,
        },
    ))
}

/// Watches the node's best tip and feeds changes into the engine's event
/// queue.
async fn tip_watcher(
    mining: Arc<dyn Mining>,
    events: Sender<EngineEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut current = match mining.get_tip().await {
        Some(tip) => tip.hash,
        None => [0u8; 32],
    };
    loop {
        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            _ = shutdown.changed() => break,
            changed = mining.wait_tip_changed(current, Duration::from_secs(10)) => {
                if let Some(tip) = changed {
                    if tip.hash != current {
                        current = tip.hash;
                        if events.send(EngineEvent::TipChanged(tip)).await.is_err() {
                            break;
                        }
                    }
                }
            }
        }
    }
}
