//! Template Distribution sub-protocol messages.

use crate::{
    codec::{Decodable, Encodable, Reader},
    datatypes::{Seq0255, Seq064K, Str0255, B016M, B0255, B064K, U256},
    error::Result,
};

/// Error code for a transaction-data request naming an unknown template.
pub const ERROR_CODE_TEMPLATE_ID_NOT_FOUND: &str = "template-id-not-found";
/// Error code for a transaction-data request naming a template from a
/// previous prev-hash epoch.
pub const ERROR_CODE_STALE_TEMPLATE_ID: &str = "stale-template-id";

/// Declares how much the client will add to the coinbase transaction.
/// Client → Server, once before templates flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoinbaseOutputConstraints {
    /// Maximum additional serialized bytes in the client's coinbase outputs.
    pub coinbase_output_max_additional_size: u32,
    /// Maximum additional sigops in the client's coinbase outputs.
    pub coinbase_output_max_sigops: u16,
}

impl Encodable for CoinbaseOutputConstraints {
    fn encoded_len(&self) -> usize {
        6
    }

    fn encode(&self, out: &mut Vec<u8>) {
        self.coinbase_output_max_additional_size.encode(out);
        self.coinbase_output_max_sigops.encode(out);
    }
}

impl Decodable for CoinbaseOutputConstraints {
    fn decode(reader: &mut Reader<'_>) -> Result<Self> {
        Ok(Self {
            coinbase_output_max_additional_size: u32::decode(reader)?,
            coinbase_output_max_sigops: u16::decode(reader)?,
        })
    }
}

/// The primary template-providing message. Server → Client.
///
/// The coinbase skeleton carried here, plus the client's own outputs, fully
/// determines the coinbase transaction for the job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTemplate {
    /// Strictly increasing server identification of the template.
    pub template_id: u64,
    /// True when the template anchors on a prev-hash not yet announced on
    /// the channel. This provider always anchors on the announced tip.
    pub future_template: bool,
    /// Valid block header version per current consensus.
    pub version: u32,
    pub coinbase_tx_version: u32,
    /// Up to 8 bytes placed at the start of the coinbase scriptSig.
    pub coinbase_prefix: B0255,
    pub coinbase_tx_input_sequence: u32,
    /// Satoshis spendable by client outputs: subsidy plus fees, minus
    /// required outputs.
    pub coinbase_tx_value_remaining: u64,
    pub coinbase_tx_outputs_count: u32,
    /// Serialized outputs placed last in the coinbase transaction.
    pub coinbase_tx_outputs: B064K,
    pub coinbase_tx_locktime: u32,
    /// Merkle path from the coinbase, deepest first.
    pub merkle_path: Seq0255<U256>,
}

impl Encodable for NewTemplate {
    fn encoded_len(&self) -> usize {
        8 + 1
            + 4
            + 4
            + self.coinbase_prefix.encoded_len()
            + 4
            + 8
            + 4
            + self.coinbase_tx_outputs.encoded_len()
            + 4
            + self.merkle_path.encoded_len()
    }

    fn encode(&self, out: &mut Vec<u8>) {
        self.template_id.encode(out);
        self.future_template.encode(out);
        self.version.encode(out);
        self.coinbase_tx_version.encode(out);
        self.coinbase_prefix.encode(out);
        self.coinbase_tx_input_sequence.encode(out);
        self.coinbase_tx_value_remaining.encode(out);
        self.coinbase_tx_outputs_count.encode(out);
        self.coinbase_tx_outputs.encode(out);
        self.coinbase_tx_locktime.encode(out);
        self.merkle_path.encode(out);
    }
}

impl Decodable for NewTemplate {
    fn decode(reader: &mut Reader<'_>) -> Result<Self> {
        Ok(Self {
            template_id: u64::decode(reader)?,
            future_template: bool::decode(reader)?,
            version: u32::decode(reader)?,
            coinbase_tx_version: u32::decode(reader)?,
            coinbase_prefix: B0255::decode(reader)?,
            coinbase_tx_input_sequence: u32::decode(reader)?,
            coinbase_tx_value_remaining: u64::decode(reader)?,
            coinbase_tx_outputs_count: u32::decode(reader)?,
            coinbase_tx_outputs: B064K::decode(reader)?,
            coinbase_tx_locktime: u32::decode(reader)?,
            merkle_path: Seq0255::decode(reader)?,
        })
    }
}

/// Announces the prev-hash epoch a template belongs to. Server → Client,
/// always directly after the paired [`NewTemplate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetNewPrevHash {
    pub template_id: u64,
    pub prev_hash: U256,
    pub header_timestamp: u32,
    pub n_bits: u32,
    pub target: U256,
}

impl Encodable for SetNewPrevHash {
    fn encoded_len(&self) -> usize {
        8 + 32 + 4 + 4 + 32
    }

    fn encode(&self, out: &mut Vec<u8>) {
        self.template_id.encode(out);
        self.prev_hash.encode(out);
        self.header_timestamp.encode(out);
        self.n_bits.encode(out);
        self.target.encode(out);
    }
}

impl Decodable for SetNewPrevHash {
    fn decode(reader: &mut Reader<'_>) -> Result<Self> {
        Ok(Self {
            template_id: u64::decode(reader)?,
            prev_hash: U256::decode(reader)?,
            header_timestamp: u32::decode(reader)?,
            n_bits: u32::decode(reader)?,
            target: U256::decode(reader)?,
        })
    }
}

/// Requests the full transaction list of a template. Client → Server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestTransactionData {
    pub template_id: u64,
}

impl Encodable for RequestTransactionData {
    fn encoded_len(&self) -> usize {
        8
    }

    fn encode(&self, out: &mut Vec<u8>) {
        self.template_id.encode(out);
    }
}

impl Decodable for RequestTransactionData {
    fn decode(reader: &mut Reader<'_>) -> Result<Self> {
        Ok(Self {
            template_id: u64::decode(reader)?,
        })
    }
}

/// Raw transactions of a template, in template order, coinbase excluded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestTransactionDataSuccess {
    pub template_id: u64,
    pub excess_data: B064K,
    pub transaction_list: Seq064K<B016M>,
}

impl Encodable for RequestTransactionDataSuccess {
    fn encoded_len(&self) -> usize {
        8 + self.excess_data.encoded_len() + self.transaction_list.encoded_len()
    }

    fn encode(&self, out: &mut Vec<u8>) {
        self.template_id.encode(out);
        self.excess_data.encode(out);
        self.transaction_list.encode(out);
    }
}

impl Decodable for RequestTransactionDataSuccess {
    fn decode(reader: &mut Reader<'_>) -> Result<Self> {
        Ok(Self {
            template_id: u64::decode(reader)?,
            excess_data: B064K::decode(reader)?,
            transaction_list: Seq064K::decode(reader)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestTransactionDataError {
    pub template_id: u64,
    pub error_code: Str0255,
}

impl Encodable for RequestTransactionDataError {
    fn encoded_len(&self) -> usize {
        8 + self.error_code.encoded_len()
    }

    fn encode(&self, out: &mut Vec<u8>) {
        self.template_id.encode(out);
        self.error_code.encode(out);
    }
}

impl Decodable for RequestTransactionDataError {
    fn decode(reader: &mut Reader<'_>) -> Result<Self> {
        Ok(Self {
            template_id: u64::decode(reader)?,
            error_code: Str0255::decode(reader)?,
        })
    }
}

/// A solved block for a previously distributed template. Client → Server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitSolution {
    pub template_id: u64,
    pub version: u32,
    pub header_timestamp: u32,
    pub header_nonce: u32,
    /// The full serialized coinbase transaction the client constructed.
    pub coinbase_tx: B064K,
}

impl Encodable for SubmitSolution {
    fn encoded_len(&self) -> usize {
        8 + 4 + 4 + 4 + self.coinbase_tx.encoded_len()
    }

    fn encode(&self, out: &mut Vec<u8>) {
        self.template_id.encode(out);
        self.version.encode(out);
        self.header_timestamp.encode(out);
        self.header_nonce.encode(out);
        self.coinbase_tx.encode(out);
    }
}

impl Decodable for SubmitSolution {
    fn decode(reader: &mut Reader<'_>) -> Result<Self> {
        Ok(Self {
            template_id: u64::decode(reader)?,
            version: u32::decode(reader)?,
            header_timestamp: u32::decode(reader)?,
            header_nonce: u32::decode(reader)?,
            coinbase_tx: B064K::decode(reader)?,
        })
    }
}
