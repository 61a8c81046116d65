//! The upstream node interface.
//!
//! The provider never touches consensus, mempool, or block assembly; it
//! consumes them through [`Mining`] and [`BlockTemplate`]. Production
//! deployments back these traits with an out-of-process node (IPC); tests
//! and the built-in `mock` backend use
//! [`MockMining`](crate::mock_mining::MockMining).

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;

/// A block in the best chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRef {
    pub hash: [u8; 32],
    pub height: u64,
}

/// Options for [`Mining::create_new_block`].
#[derive(Debug, Clone, Copy)]
pub struct BlockCreateOptions {
    /// Set false to omit mempool transactions from the template.
    pub use_mempool: bool,
    /// Serialized bytes the client may add to the coinbase outputs; the
    /// assembler reserves weight for them.
    pub coinbase_output_max_additional_size: u32,
    /// Sigops the client may add to the coinbase outputs.
    pub coinbase_output_max_sigops: u16,
}

impl Default for BlockCreateOptions {
    fn default() -> Self {
        Self {
            use_mempool: true,
            coinbase_output_max_additional_size: 0,
            coinbase_output_max_sigops: 0,
        }
    }
}

/// Options for [`BlockTemplate::wait_next`].
#[derive(Debug, Clone, Copy)]
pub struct BlockWaitOptions {
    /// Return `None` after this long without a better template.
    pub timeout: Duration,
    /// Required fee improvement, in satoshis, before a same-tip template
    /// counts as better.
    pub fee_threshold: i64,
}

/// The coinbase skeleton of a template. The client appends its own outputs
/// and up to 92 scriptSig bytes to complete the transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoinbaseTemplate {
    pub version: u32,
    /// nSequence of the only input.
    pub input_sequence: u32,
    /// At most 8 bytes placed at the start of the scriptSig.
    pub script_sig_prefix: Vec<u8>,
    /// First witness stack element of the coinbase input; absent for
    /// templates without witness data.
    pub witness_reserved: Option<[u8; 32]>,
    /// Subsidy plus fees, minus any value in the required outputs.
    pub value_remaining: u64,
    /// Serialized outputs placed last in the coinbase transaction.
    pub required_outputs: Vec<u8>,
    pub required_outputs_count: u32,
    pub lock_time: u32,
}

/// One non-coinbase transaction of a template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxEntry {
    pub txid: [u8; 32],
    pub raw: Vec<u8>,
    pub fee: i64,
}

/// Everything a template pair of messages is built from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateData {
    /// Block header version.
    pub version: u32,
    pub prev_hash: [u8; 32],
    pub timestamp: u32,
    pub n_bits: u32,
    pub target: [u8; 32],
    pub coinbase: CoinbaseTemplate,
    /// Merkle path from the coinbase to the root, deepest first.
    pub merkle_path: Vec<[u8; 32]>,
    /// Non-coinbase transactions in template order.
    pub transactions: Vec<TxEntry>,
}

impl TemplateData {
    pub fn total_fees(&self) -> i64 {
        self.transactions.iter().map(|tx| tx.fee).sum()
    }
}

/// The node is unreachable or refused the call. Triggers peer teardown and
/// exponential-backoff reconnection; fatal past a configured threshold.
#[derive(Debug)]
pub enum NodeError {
    Unavailable(String),
    ShuttingDown,
}

impl core::fmt::Display for NodeError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            NodeError::Unavailable(reason) => write!(f, "node unavailable: {reason}"),
            NodeError::ShuttingDown => write!(f, "node shutting down"),
        }
    }
}

impl std::error::Error for NodeError {}

/// A handle on one assembled block candidate.
#[async_trait]
pub trait BlockTemplate: Send + Sync {
    fn data(&self) -> &TemplateData;

    /// Submits a solved block built on this template. The return value is
    /// advisory; clients learn about acceptance through the next
    /// `SetNewPrevHash`.
    async fn submit_solution(
        &self,
        version: u32,
        header_timestamp: u32,
        header_nonce: u32,
        coinbase_tx: Vec<u8>,
    ) -> bool;

    /// Waits for a better template: a new tip, or fees improved by at least
    /// `fee_threshold` on the same tip. `None` on timeout or node shutdown.
    async fn wait_next(&self, options: BlockWaitOptions) -> Option<Arc<dyn BlockTemplate>>;
}

/// The node-side mining interface.
#[async_trait]
pub trait Mining: Send + Sync {
    async fn get_tip(&self) -> Option<BlockRef>;

    /// Blocks until the best tip differs from `current`, or `timeout`
    /// elapses (`None`).
    async fn wait_tip_changed(&self, current: [u8; 32], timeout: Duration) -> Option<BlockRef>;

    async fn create_new_block(
        &self,
        options: BlockCreateOptions,
    ) -> Result<Arc<dyn BlockTemplate>, NodeError>;
}
