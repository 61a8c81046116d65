//! An in-process [`Mining`] backend.
//!
//! Serves deterministic templates from a fake chain whose tip and fee level
//! are advanced by explicit triggers. Conformance tests drive it directly;
//! the `--ipcconnect=mock` backend wraps it with a timer. It records every
//! `createNewBlock` call and submitted solution for inspection.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::sync::watch;

use crate::{
    merkle,
    mining::{
        BlockCreateOptions, BlockRef, BlockTemplate, BlockWaitOptions, CoinbaseTemplate, Mining,
        NodeError, TemplateData, TxEntry,
    },
    utils::Mutex,
};

const SUBSIDY: u64 = 5_000_000_000;
const MOCK_N_BITS: u32 = 0x207f_ffff;
const MOCK_BASE_TIME: u32 = 1_700_000_000;

/// A solution as it reached the node.
#[derive(Debug, Clone)]
pub struct RecordedSolution {
    pub prev_hash: [u8; 32],
    pub version: u32,
    pub header_timestamp: u32,
    pub header_nonce: u32,
    pub coinbase_tx: Vec<u8>,
}

#[derive(Debug, Default)]
struct ChainState {
    height: u64,
    tip_hash: [u8; 32],
    transactions: Vec<TxEntry>,
    tx_counter: u64,
    unavailable: bool,
    shutdown: bool,
}

impl ChainState {
    fn total_fees(&self) -> i64 {
        self.transactions.iter().map(|tx| tx.fee).sum()
    }
}

#[derive(Debug, Default)]
struct Recorded {
    create_calls: Vec<BlockCreateOptions>,
    solutions: Vec<RecordedSolution>,
}

pub struct MockMining {
    state: Arc<Mutex<ChainState>>,
    recorded: Arc<Mutex<Recorded>>,
    // Generation counter bumped on every state change; waiters watch it.
    events: watch::Sender<u64>,
}

impl MockMining {
    pub fn new() -> Arc<Self> {
        let (events, _) = watch::channel(0);
        let mock = Self {
            state: Arc::new(Mutex::new(ChainState {
                height: 0,
                tip_hash: block_hash(0),
                ..Default::default()
            })),
            recorded: Arc::new(Mutex::new(Recorded::default())),
            events,
        };
        Arc::new(mock)
    }

    fn bump(&self) {
        self.events.send_modify(|generation| *generation += 1);
    }

    /// Advances the chain by one block; pending transactions confirm.
    pub fn trigger_new_tip(&self) {
        let _ = self.state.safe_lock(|state| {
            state.height += 1;
            state.tip_hash = block_hash(state.height);
            state.transactions.clear();
        });
        self.bump();
    }

    /// Adds a transaction paying `fee` satoshis to the candidate set.
    pub fn trigger_fee_increase(&self, fee: i64) {
        let _ = self.state.safe_lock(|state| {
            state.tx_counter += 1;
            let raw = mock_tx_bytes(state.height, state.tx_counter);
            state.transactions.push(TxEntry {
                txid: merkle::sha256d(&raw),
                raw,
                fee,
            });
        });
        self.bump();
    }

    /// Makes every node call fail until re-enabled.
    pub fn set_unavailable(&self, unavailable: bool) {
        let _ = self.state.safe_lock(|state| state.unavailable = unavailable);
        self.bump();
    }

    pub fn shutdown(&self) {
        let _ = self.state.safe_lock(|state| state.shutdown = true);
        self.bump();
    }

    pub fn tip(&self) -> BlockRef {
        self.state
            .safe_lock(|state| BlockRef {
                hash: state.tip_hash,
                height: state.height,
            })
            .expect("mock state lock")
    }

    pub fn create_calls(&self) -> Vec<BlockCreateOptions> {
        self.recorded
            .safe_lock(|r| r.create_calls.clone())
            .expect("mock state lock")
    }

    pub fn solutions(&self) -> Vec<RecordedSolution> {
        self.recorded
            .safe_lock(|r| r.solutions.clone())
            .expect("mock state lock")
    }

    fn template_data(state: &ChainState) -> TemplateData {
        let txids: Vec<[u8; 32]> = state.transactions.iter().map(|tx| tx.txid).collect();
        TemplateData {
            version: 0x2000_0000,
            prev_hash: state.tip_hash,
            timestamp: MOCK_BASE_TIME + state.height as u32,
            n_bits: MOCK_N_BITS,
            target: target_from_n_bits(MOCK_N_BITS),
            coinbase: CoinbaseTemplate {
                version: 2,
                input_sequence: u32::MAX,
                script_sig_prefix: height_prefix(state.height + 1),
                witness_reserved: Some([0u8; 32]),
                value_remaining: SUBSIDY + state.total_fees().max(0) as u64,
                required_outputs: witness_commitment_output(),
                required_outputs_count: 1,
                lock_time: 0,
            },
            merkle_path: merkle::merkle_path_for_coinbase(&txids),
            transactions: state.transactions.clone(),
        }
    }
}

struct MockBlockTemplate {
    data: TemplateData,
    state: Arc<Mutex<ChainState>>,
    recorded: Arc<Mutex<Recorded>>,
    events: watch::Sender<u64>,
}

#[async_trait]
impl BlockTemplate for MockBlockTemplate {
    fn data(&self) -> &TemplateData {
        &self.data
    }

    async fn submit_solution(
        &self,
        version: u32,
        header_timestamp: u32,
        header_nonce: u32,
        coinbase_tx: Vec<u8>,
    ) -> bool {
        let prev_hash = self.data.prev_hash;
        let _ = self.recorded.safe_lock(|r| {
            r.solutions.push(RecordedSolution {
                prev_hash,
                version,
                header_timestamp,
                header_nonce,
                coinbase_tx,
            });
        });
        true
    }

    async fn wait_next(&self, options: BlockWaitOptions) -> Option<Arc<dyn BlockTemplate>> {
        let deadline = tokio::time::Instant::now() + options.timeout;
        let mut events = self.events.subscribe();
        loop {
            enum Check {
                Better(TemplateData),
                Shutdown,
                Wait,
            }
            let check = self
                .state
                .safe_lock(|state| {
                    if state.shutdown || state.unavailable {
                        return Check::Shutdown;
                    }
                    if state.tip_hash != self.data.prev_hash {
                        return Check::Better(MockMining::template_data(state));
                    }
                    if state.total_fees() - self.data.total_fees() >= options.fee_threshold {
                        return Check::Better(MockMining::template_data(state));
                    }
                    Check::Wait
                })
                .ok()?;
            match check {
                Check::Shutdown => return None,
                Check::Better(data) => {
                    return Some(Arc::new(MockBlockTemplate {
                        data,
                        state: self.state.clone(),
                        recorded: self.recorded.clone(),
                        events: self.events.clone(),
                    }))
                }
                Check::Wait => {}
            }
            tokio::select! {
                changed = events.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                }
                _ = tokio::time::sleep_until(deadline) => return None,
            }
        }
    }
}

#[async_trait]
impl Mining for MockMining {
    async fn get_tip(&self) -> Option<BlockRef> {
        self.state
            .safe_lock(|state| {
                if state.unavailable || state.shutdown {
                    None
                } else {
                    Some(BlockRef {
                        hash: state.tip_hash,
                        height: state.height,
                    })
                }
            })
            .ok()
            .flatten()
    }

    async fn wait_tip_changed(&self, current: [u8; 32], timeout: Duration) -> Option<BlockRef> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut events = self.events.subscribe();
        loop {
            let tip = self
                .state
                .safe_lock(|state| {
                    if state.shutdown || state.unavailable {
                        None
                    } else if state.tip_hash != current {
                        Some(BlockRef {
                            hash: state.tip_hash,
                            height: state.height,
                        })
                    } else {
                        None
                    }
                })
                .ok()?;
            if tip.is_some() {
                return tip;
            }
            tokio::select! {
                changed = events.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                }
                _ = tokio::time::sleep_until(deadline) => return None,
            }
        }
    }

    async fn create_new_block(
        &self,
        options: BlockCreateOptions,
    ) -> Result<Arc<dyn BlockTemplate>, NodeError> {
        let _ = self.recorded.safe_lock(|r| r.create_calls.push(options));
        let data = self
            .state
            .safe_lock(|state| {
                if state.unavailable {
                    return Err(NodeError::Unavailable("mock offline".to_string()));
                }
                if state.shutdown {
                    return Err(NodeError::ShuttingDown);
                }
                Ok(MockMining::template_data(state))
            })
            .map_err(|e| NodeError::Unavailable(e.to_string()))??;
        Ok(Arc::new(MockBlockTemplate {
            data,
            state: self.state.clone(),
            recorded: self.recorded.clone(),
            events: self.events.clone(),
        }))
    }
}

fn block_hash(height: u64) -> [u8; 32] {
    let mut seed = b"mock-block".to_vec();
    seed.extend_from_slice(&height.to_le_bytes());
    merkle::sha256d(&seed)
}

fn mock_tx_bytes(height: u64, counter: u64) -> Vec<u8> {
    // Shaped like a one-in one-out transaction; content only needs to be
    // deterministic and unique.
    let mut raw = Vec::with_capacity(96);
    raw.extend_from_slice(&2u32.to_le_bytes());
    raw.push(1);
    raw.extend_from_slice(&merkle::sha256d(&counter.to_le_bytes()));
    raw.extend_from_slice(&0u32.to_le_bytes());
    raw.push(0);
    raw.extend_from_slice(&u32::MAX.to_le_bytes());
    raw.push(1);
    raw.extend_from_slice(&(SUBSIDY / 100).to_le_bytes());
    raw.extend_from_slice(&[0x02, 0x51, 0x51]);
    raw.extend_from_slice(&(height as u32).to_le_bytes());
    raw
}

// BIP 34 style height push, minimally encoded, at most 8 bytes total.
fn height_prefix(height: u64) -> Vec<u8> {
    let bytes = height.to_le_bytes();
    let significant = 8 - height.leading_zeros() as usize / 8;
    let significant = significant.max(1).min(7);
    let mut prefix = Vec::with_capacity(1 + significant);
    prefix.push(significant as u8);
    prefix.extend_from_slice(&bytes[..significant]);
    prefix
}

fn witness_commitment_output() -> Vec<u8> {
    // Zero value, then an OP_RETURN script with the commitment header.
    let commitment = merkle::sha256d(b"mock-witness-commitment");
    let mut out = Vec::with_capacity(8 + 1 + 38);
    out.extend_from_slice(&0u64.to_le_bytes());
    out.push(38);
    out.extend_from_slice(&[0x6a, 0x24, 0xaa, 0x21, 0xa9, 0xed]);
    out.extend_from_slice(&commitment);
    out
}

fn target_from_n_bits(n_bits: u32) -> [u8; 32] {
    let exponent = (n_bits >> 24) as usize;
    let mantissa = n_bits & 0x007f_ffff;
    let mut target = [0u8; 32];
    if exponent >= 3 {
        let bytes = mantissa.to_le_bytes();
        for i in 0..3 {
            let position = exponent - 3 + i;
            if position < 32 {
                target[position] = bytes[i];
            }
        }
    }
    target
}
