//! Message-type dispatch.
//!
//! Maps the §message-type byte of a frame header to the typed message and
//! back. Only the messages the Template Distribution role exchanges are
//! defined; anything else surfaces as [`Error::UnknownMessageType`].

use crate::{
    codec::{from_bytes, to_bytes},
    common::{SetupConnection, SetupConnectionError, SetupConnectionSuccess},
    error::{Error, Result},
    template_distribution::{
        CoinbaseOutputConstraints, NewTemplate, RequestTransactionData,
        RequestTransactionDataError, RequestTransactionDataSuccess, SetNewPrevHash, SubmitSolution,
    },
};

pub const MESSAGE_TYPE_SETUP_CONNECTION: u8 = 0x00;
pub const MESSAGE_TYPE_SETUP_CONNECTION_SUCCESS: u8 = 0x01;
pub const MESSAGE_TYPE_SETUP_CONNECTION_ERROR: u8 = 0x02;
pub const MESSAGE_TYPE_COINBASE_OUTPUT_CONSTRAINTS: u8 = 0x70;
pub const MESSAGE_TYPE_NEW_TEMPLATE: u8 = 0x71;
pub const MESSAGE_TYPE_SET_NEW_PREV_HASH: u8 = 0x72;
pub const MESSAGE_TYPE_REQUEST_TRANSACTION_DATA: u8 = 0x73;
pub const MESSAGE_TYPE_REQUEST_TRANSACTION_DATA_SUCCESS: u8 = 0x74;
pub const MESSAGE_TYPE_REQUEST_TRANSACTION_DATA_ERROR: u8 = 0x75;
pub const MESSAGE_TYPE_SUBMIT_SOLUTION: u8 = 0x76;

/// Every message the Template Provider sends or receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TpMessage {
    SetupConnection(SetupConnection),
    SetupConnectionSuccess(SetupConnectionSuccess),
    SetupConnectionError(SetupConnectionError),
    CoinbaseOutputConstraints(CoinbaseOutputConstraints),
    NewTemplate(NewTemplate),
    SetNewPrevHash(SetNewPrevHash),
    RequestTransactionData(RequestTransactionData),
    RequestTransactionDataSuccess(RequestTransactionDataSuccess),
    RequestTransactionDataError(RequestTransactionDataError),
    SubmitSolution(SubmitSolution),
}

impl TpMessage {
    pub fn message_type(&self) -> u8 {
        match self {
            TpMessage::SetupConnection(_) => MESSAGE_TYPE_SETUP_CONNECTION,
            TpMessage::SetupConnectionSuccess(_) => MESSAGE_TYPE_SETUP_CONNECTION_SUCCESS,
            TpMessage::SetupConnectionError(_) => MESSAGE_TYPE_SETUP_CONNECTION_ERROR,
            TpMessage::CoinbaseOutputConstraints(_) => MESSAGE_TYPE_COINBASE_OUTPUT_CONSTRAINTS,
            TpMessage::NewTemplate(_) => MESSAGE_TYPE_NEW_TEMPLATE,
            TpMessage::SetNewPrevHash(_) => MESSAGE_TYPE_SET_NEW_PREV_HASH,
            TpMessage::RequestTransactionData(_) => MESSAGE_TYPE_REQUEST_TRANSACTION_DATA,
            TpMessage::RequestTransactionDataSuccess(_) => {
                MESSAGE_TYPE_REQUEST_TRANSACTION_DATA_SUCCESS
            }
            TpMessage::RequestTransactionDataError(_) => {
                MESSAGE_TYPE_REQUEST_TRANSACTION_DATA_ERROR
            }
            TpMessage::SubmitSolution(_) => MESSAGE_TYPE_SUBMIT_SOLUTION,
        }
    }

    /// Decodes a payload for a known message type byte.
    pub fn from_payload(msg_type: u8, payload: &[u8]) -> Result<Self> {
        match msg_type {
            MESSAGE_TYPE_SETUP_CONNECTION => Ok(TpMessage::SetupConnection(from_bytes(payload)?)),
            MESSAGE_TYPE_SETUP_CONNECTION_SUCCESS => {
                Ok(TpMessage::SetupConnectionSuccess(from_bytes(payload)?))
            }
            MESSAGE_TYPE_SETUP_CONNECTION_ERROR => {
                Ok(TpMessage::SetupConnectionError(from_bytes(payload)?))
            }
            MESSAGE_TYPE_COINBASE_OUTPUT_CONSTRAINTS => {
                Ok(TpMessage::CoinbaseOutputConstraints(from_bytes(payload)?))
            }
            MESSAGE_TYPE_NEW_TEMPLATE => Ok(TpMessage::NewTemplate(from_bytes(payload)?)),
            MESSAGE_TYPE_SET_NEW_PREV_HASH => Ok(TpMessage::SetNewPrevHash(from_bytes(payload)?)),
            MESSAGE_TYPE_REQUEST_TRANSACTION_DATA => {
                Ok(TpMessage::RequestTransactionData(from_bytes(payload)?))
            }
            MESSAGE_TYPE_REQUEST_TRANSACTION_DATA_SUCCESS => Ok(
                TpMessage::RequestTransactionDataSuccess(from_bytes(payload)?),
            ),
            MESSAGE_TYPE_REQUEST_TRANSACTION_DATA_ERROR => Ok(
                TpMessage::RequestTransactionDataError(from_bytes(payload)?),
            ),
            MESSAGE_TYPE_SUBMIT_SOLUTION => Ok(TpMessage::SubmitSolution(from_bytes(payload)?)),
            other => Err(Error::UnknownMessageType(other)),
        }
    }

    /// Encodes the message payload, without the frame header.
    pub fn encode_payload(&self) -> Vec<u8> {
        match self {
            TpMessage::SetupConnection(m) => to_bytes(m),
            TpMessage::SetupConnectionSuccess(m) => to_bytes(m),
            TpMessage::SetupConnectionError(m) => to_bytes(m),
            TpMessage::CoinbaseOutputConstraints(m) => to_bytes(m),
            TpMessage::NewTemplate(m) => to_bytes(m),
            TpMessage::SetNewPrevHash(m) => to_bytes(m),
            TpMessage::RequestTransactionData(m) => to_bytes(m),
            TpMessage::RequestTransactionDataSuccess(m) => to_bytes(m),
            TpMessage::RequestTransactionDataError(m) => to_bytes(m),
            TpMessage::SubmitSolution(m) => to_bytes(m),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::PROTOCOL_TEMPLATE_DISTRIBUTION;
    use core::convert::TryInto;
    use quickcheck::{Arbitrary, Gen};
    use quickcheck_macros::quickcheck;

    fn roundtrip(msg: TpMessage) -> bool {
        let payload = msg.encode_payload();
        TpMessage::from_payload(msg.message_type(), &payload) == Ok(msg)
    }

    fn arb_bytes(g: &mut Gen, max: usize) -> Vec<u8> {
        let len = usize::arbitrary(g) % (max + 1);
        (0..len).map(|_| u8::arbitrary(g)).collect()
    }

    fn arb_str(g: &mut Gen, max: usize) -> crate::datatypes::Str0255 {
        let len = usize::arbitrary(g) % (max + 1);
        let s: String = (0..len).map(|_| char::from(b'a' + u8::arbitrary(g) % 26)).collect();
        s.try_into().unwrap()
    }

    #[quickcheck]
    fn setup_connection_roundtrip(seed: u64) -> bool {
        let mut g = Gen::new(seed as usize % 64 + 1);
        let g = &mut g;
        roundtrip(TpMessage::SetupConnection(SetupConnection {
            protocol: PROTOCOL_TEMPLATE_DISTRIBUTION,
            min_version: u16::arbitrary(g),
            max_version: u16::arbitrary(g),
            flags: u32::arbitrary(g),
            endpoint_host: arb_str(g, 40),
            endpoint_port: u16::arbitrary(g),
            vendor: arb_str(g, 20),
            hardware_version: arb_str(g, 20),
            firmware: arb_str(g, 20),
            device_id: arb_str(g, 20),
        }))
    }

    #[quickcheck]
    fn setup_connection_replies_roundtrip(used_version: u16, flags: u32) -> bool {
        roundtrip(TpMessage::SetupConnectionSuccess(SetupConnectionSuccess {
            used_version,
            flags,
        })) && roundtrip(TpMessage::SetupConnectionError(SetupConnectionError {
            flags,
            error_code: "protocol-version-mismatch".try_into().unwrap(),
        }))
    }

    #[quickcheck]
    fn coinbase_output_constraints_roundtrip(size: u32, sigops: u16) -> bool {
        roundtrip(TpMessage::CoinbaseOutputConstraints(
            CoinbaseOutputConstraints {
                coinbase_output_max_additional_size: size,
                coinbase_output_max_sigops: sigops,
            },
        ))
    }

    #[quickcheck]
    fn new_template_roundtrip(seed: u64) -> bool {
        let mut g = Gen::new(seed as usize % 64 + 1);
        let g = &mut g;
        let path_len = usize::arbitrary(g) % 16;
        let merkle_path: Vec<crate::datatypes::U256> = (0..path_len)
            .map(|_| {
                let mut h = [0u8; 32];
                for b in h.iter_mut() {
                    *b = u8::arbitrary(g);
                }
                h.into()
            })
            .collect();
        roundtrip(TpMessage::NewTemplate(NewTemplate {
            template_id: u64::arbitrary(g),
            future_template: bool::arbitrary(g),
            version: u32::arbitrary(g),
            coinbase_tx_version: u32::arbitrary(g),
            coinbase_prefix: arb_bytes(g, 8).try_into().unwrap(),
            coinbase_tx_input_sequence: u32::arbitrary(g),
            coinbase_tx_value_remaining: u64::arbitrary(g),
            coinbase_tx_outputs_count: u32::arbitrary(g),
            coinbase_tx_outputs: arb_bytes(g, 200).try_into().unwrap(),
            coinbase_tx_locktime: u32::arbitrary(g),
            merkle_path: merkle_path.try_into().unwrap(),
        }))
    }

    #[quickcheck]
    fn set_new_prev_hash_roundtrip(template_id: u64, timestamp: u32, n_bits: u32) -> bool {
        roundtrip(TpMessage::SetNewPrevHash(SetNewPrevHash {
            template_id,
            prev_hash: [3u8; 32].into(),
            header_timestamp: timestamp,
            n_bits,
            target: [0xffu8; 32].into(),
        }))
    }

    #[quickcheck]
    fn transaction_data_messages_roundtrip(template_id: u64, seed: u64) -> bool {
        let mut g = Gen::new(seed as usize % 64 + 1);
        let g = &mut g;
        let tx_count = usize::arbitrary(g) % 8;
        let txs: Vec<crate::datatypes::B016M> = (0..tx_count)
            .map(|_| arb_bytes(g, 512).try_into().unwrap())
            .collect();
        roundtrip(TpMessage::RequestTransactionData(RequestTransactionData {
            template_id,
        })) && roundtrip(TpMessage::RequestTransactionDataSuccess(
            RequestTransactionDataSuccess {
                template_id,
                excess_data: arb_bytes(g, 64).try_into().unwrap(),
                transaction_list: txs.try_into().unwrap(),
            },
        )) && roundtrip(TpMessage::RequestTransactionDataError(
            RequestTransactionDataError {
                template_id,
                error_code: "template-id-not-found".try_into().unwrap(),
            },
        ))
    }

    #[quickcheck]
    fn submit_solution_roundtrip(template_id: u64, version: u32, ts: u32, nonce: u32) -> bool {
        roundtrip(TpMessage::SubmitSolution(SubmitSolution {
            template_id,
            version,
            header_timestamp: ts,
            header_nonce: nonce,
            coinbase_tx: vec![1u8; 100].try_into().unwrap(),
        }))
    }

    #[test]
    fn unknown_message_type_rejected() {
        assert_eq!(
            TpMessage::from_payload(0x50, &[]),
            Err(Error::UnknownMessageType(0x50))
        );
    }
}
