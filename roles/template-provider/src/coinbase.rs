//! Coinbase serialization and validation.
//!
//! Two duties: serialize the coinbase skeleton deterministically for the
//! template fingerprint, and check a client-submitted coinbase against the
//! template it claims to solve before the block goes to the node.

use core::fmt;

use crate::mining::CoinbaseTemplate;

#[derive(Debug, PartialEq, Eq)]
pub enum CoinbaseError {
    Truncated,
    /// Not exactly one input, or the input does not spend the null prevout.
    NotACoinbase,
    /// scriptSig does not start with the template's prefix.
    PrefixMismatch,
    /// Outputs spend more than the template's `value_remaining`.
    ValueOverflow { spent: u64, available: u64 },
    /// A var-int field used a non-canonical or oversized encoding.
    BadVarInt,
}

impl fmt::Display for CoinbaseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoinbaseError::Truncated => write!(f, "coinbase truncated"),
            CoinbaseError::NotACoinbase => write!(f, "not a coinbase transaction"),
            CoinbaseError::PrefixMismatch => write!(f, "scriptSig prefix mismatch"),
            CoinbaseError::ValueOverflow { spent, available } => {
                write!(f, "outputs spend {spent} of {available} available")
            }
            CoinbaseError::BadVarInt => write!(f, "invalid compact size"),
        }
    }
}

/// What validation learned about a submitted coinbase.
#[derive(Debug, PartialEq)]
pub struct ParsedCoinbase {
    /// Txid over the witness-stripped serialization.
    pub txid: [u8; 32],
    pub output_value: u64,
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8], CoinbaseError> {
        if self.buf.len() - self.pos < len {
            return Err(CoinbaseError::Truncated);
        }
        let out = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    fn u32_le(&mut self) -> Result<u32, CoinbaseError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64_le(&mut self) -> Result<u64, CoinbaseError> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    fn compact_size(&mut self) -> Result<u64, CoinbaseError> {
        let first = self.take(1)?[0];
        Ok(match first {
            0..=0xfc => first as u64,
            0xfd => {
                let b = self.take(2)?;
                u16::from_le_bytes([b[0], b[1]]) as u64
            }
            0xfe => self.u32_le()? as u64,
            0xff => self.u64_le()?,
        })
    }
}

fn write_compact_size(out: &mut Vec<u8>, value: u64) {
    match value {
        0..=0xfc => out.push(value as u8),
        0xfd..=0xffff => {
            out.push(0xfd);
            out.extend_from_slice(&(value as u16).to_le_bytes());
        }
        0x10000..=0xffff_ffff => {
            out.push(0xfe);
            out.extend_from_slice(&(value as u32).to_le_bytes());
        }
        _ => {
            out.push(0xff);
            out.extend_from_slice(&value.to_le_bytes());
        }
    }
}

/// Serializes the template's coinbase skeleton: prefix-only scriptSig, the
/// required outputs, no witness. Input to the template fingerprint.
pub fn serialize_skeleton(coinbase: &CoinbaseTemplate) -> Vec<u8> {
    let mut out = Vec::with_capacity(64 + coinbase.required_outputs.len());
    out.extend_from_slice(&coinbase.version.to_le_bytes());
    // One input spending the null prevout.
    write_compact_size(&mut out, 1);
    out.extend_from_slice(&[0u8; 32]);
    out.extend_from_slice(&u32::MAX.to_le_bytes());
    write_compact_size(&mut out, coinbase.script_sig_prefix.len() as u64);
    out.extend_from_slice(&coinbase.script_sig_prefix);
    out.extend_from_slice(&coinbase.input_sequence.to_le_bytes());
    // Outputs arrive pre-serialized from the node.
    write_compact_size(&mut out, coinbase.required_outputs_count as u64);
    out.extend_from_slice(&coinbase.required_outputs);
    out.extend_from_slice(&coinbase.lock_time.to_le_bytes());
    out
}

/// Validates a client-submitted coinbase against its template: well-formed,
/// spends the null prevout, scriptSig starts with the template prefix, and
/// outputs stay within `value_remaining`. Returns the witness-stripped txid
/// for merkle-root recomputation.
pub fn validate_submitted(
    raw: &[u8],
    coinbase: &CoinbaseTemplate,
) -> Result<ParsedCoinbase, CoinbaseError> {
    let mut cursor = Cursor { buf: raw, pos: 0 };

    let version_start = cursor.pos;
    cursor.u32_le()?;
    let version_end = cursor.pos;

    // BIP 144 marker and flag.
    let segwit = raw.len() > cursor.pos + 1 && raw[cursor.pos] == 0x00 && raw[cursor.pos + 1] == 0x01;
    if segwit {
        cursor.take(2)?;
    }

    let body_start = cursor.pos;
    if cursor.compact_size()? != 1 {
        return Err(CoinbaseError::NotACoinbase);
    }
    let prevout_hash = cursor.take(32)?;
    if prevout_hash.iter().any(|&b| b != 0) {
        return Err(CoinbaseError::NotACoinbase);
    }
    if cursor.u32_le()? != u32::MAX {
        return Err(CoinbaseError::NotACoinbase);
    }

    let script_len = cursor.compact_size()? as usize;
    if script_len > 10_000 {
        return Err(CoinbaseError::BadVarInt);
    }
    let script_sig = cursor.take(script_len)?;
    if !script_sig.starts_with(&coinbase.script_sig_prefix) {
        return Err(CoinbaseError::PrefixMismatch);
    }
    cursor.u32_le()?; // nSequence

    let output_count = cursor.compact_size()?;
    if output_count == 0 || output_count > 10_000 {
        return Err(CoinbaseError::NotACoinbase);
    }
    let mut output_value: u64 = 0;
    for _ in 0..output_count {
        let value = cursor.u64_le()?;
        output_value = output_value
            .checked_add(value)
            .ok_or(CoinbaseError::ValueOverflow {
                spent: u64::MAX,
                available: coinbase.value_remaining,
            })?;
        let script_len = cursor.compact_size()? as usize;
        if script_len > 10_000 {
            return Err(CoinbaseError::BadVarInt);
        }
        cursor.take(script_len)?;
    }
    let body_end = cursor.pos;

    if segwit {
        // One witness stack, for the single input.
        let items = cursor.compact_size()?;
        for _ in 0..items {
            let len = cursor.compact_size()? as usize;
            if len > 10_000 {
                return Err(CoinbaseError::BadVarInt);
            }
            cursor.take(len)?;
        }
    }
    cursor.u32_le()?; // nLockTime
    let lock_time_start = cursor.pos - 4;

    if cursor.pos != raw.len() {
        return Err(CoinbaseError::Truncated);
    }

    // Clients may burn part of the reward, but never mint.
    if output_value > coinbase.value_remaining + required_output_value(coinbase) {
        return Err(CoinbaseError::ValueOverflow {
            spent: output_value,
            available: coinbase.value_remaining,
        });
    }

    // Txid excludes marker, flag, and witness.
    let txid = if segwit {
        let mut stripped =
            Vec::with_capacity(raw.len() - 2 - (lock_time_start - body_end));
        stripped.extend_from_slice(&raw[version_start..version_end]);
        stripped.extend_from_slice(&raw[body_start..body_end]);
        stripped.extend_from_slice(&raw[lock_time_start..]);
        crate::merkle::sha256d(&stripped)
    } else {
        crate::merkle::sha256d(raw)
    };

    Ok(ParsedCoinbase {
        txid,
        output_value,
    })
}

// Value already committed in the template's required outputs; a client that
// copies them does not mint by doing so.
fn required_output_value(coinbase: &CoinbaseTemplate) -> u64 {
    let mut cursor = Cursor {
        buf: &coinbase.required_outputs,
        pos: 0,
    };
    let mut total: u64 = 0;
    for _ in 0..coinbase.required_outputs_count {
        let Ok(value) = cursor.u64_le() else { break };
        total = total.saturating_add(value);
        let Ok(len) = cursor.compact_size() else { break };
        if cursor.take(len as usize).is_err() {
            break;
        }
    }
    total
}

/// Builds a complete, valid coinbase for a template. Used by conformance
/// tests to play the client side.
pub fn build_for_template(
    coinbase: &CoinbaseTemplate,
    extra_script: &[u8],
    payout_script: &[u8],
) -> Vec<u8> {
    let segwit = coinbase.witness_reserved.is_some();
    let mut out = Vec::new();
    out.extend_from_slice(&coinbase.version.to_le_bytes());
    if segwit {
        out.extend_from_slice(&[0x00, 0x01]);
    }
    write_compact_size(&mut out, 1);
    out.extend_from_slice(&[0u8; 32]);
    out.extend_from_slice(&u32::MAX.to_le_bytes());
    let script_len = coinbase.script_sig_prefix.len() + extra_script.len();
    write_compact_size(&mut out, script_len as u64);
    out.extend_from_slice(&coinbase.script_sig_prefix);
    out.extend_from_slice(extra_script);
    out.extend_from_slice(&coinbase.input_sequence.to_le_bytes());

    write_compact_size(&mut out, 1 + coinbase.required_outputs_count as u64);
    out.extend_from_slice(&coinbase.value_remaining.to_le_bytes());
    write_compact_size(&mut out, payout_script.len() as u64);
    out.extend_from_slice(payout_script);
    out.extend_from_slice(&coinbase.required_outputs);

    if let Some(reserved) = coinbase.witness_reserved {
        write_compact_size(&mut out, 1);
        write_compact_size(&mut out, 32);
        out.extend_from_slice(&reserved);
    }
    out.extend_from_slice(&coinbase.lock_time.to_le_bytes());
    out
}
