//! Encrypted record layer.
//!
//! After the handshake every byte on the wire is a record:
//! `length:u24-LE || ciphertext || tag`, with `length` capped at 65535. The
//! AEAD nonce is the cipher state's record counter; associated data is empty.
//! Framed messages larger than one record are split across consecutive
//! records and reassembled on the far side.
//!
//! Key rotation is silent: both directions count records and plaintext bytes
//! per key, and each endpoint rekeys its cipher state at the same record
//! index, so no rekey signal ever crosses the wire.

use tp_noise::{CipherPair, CipherState, AEAD_MAC_LEN, DEFAULT_REKEY_BYTE_CEILING};

use crate::{
    error::{Error, Result},
    header::{Header, EXTENSION_TYPE_NO_EXTENSION},
    parser::TpMessage,
};

/// Maximum bytes in one record after the length prefix.
pub const MAX_RECORD_LEN: usize = 65535;

/// Maximum plaintext bytes carried by one record.
pub const MAX_RECORD_PLAINTEXT: usize = MAX_RECORD_LEN - AEAD_MAC_LEN;

/// Width of the record length prefix.
pub const RECORD_LENGTH_PREFIX: usize = 3;

/// One unit yielded by [`Transport::received_bytes`].
#[derive(Debug, PartialEq, Eq)]
pub enum Incoming {
    Message(TpMessage),
    /// A frame that decrypted fine but did not parse as a known message.
    /// Dropped; the connection stays up.
    Unknown { msg_type: u8, length: usize },
}

/// Framing, encryption, and reassembly for one established connection.
pub struct Transport {
    send: CipherState,
    recv: CipherState,
    byte_ceiling: u64,
    // Raw socket bytes not yet forming a complete record.
    raw_in: Vec<u8>,
    // Decrypted framed-message stream awaiting a complete message.
    assembly: Vec<u8>,
    // Encrypted records ready for the socket.
    outbound: Vec<u8>,
}

impl Transport {
    pub fn new(keys: CipherPair) -> Self {
        Self::with_byte_ceiling(keys, DEFAULT_REKEY_BYTE_CEILING)
    }

    pub fn with_byte_ceiling(keys: CipherPair, byte_ceiling: u64) -> Self {
        Self {
            send: keys.send,
            recv: keys.recv,
            byte_ceiling,
            raw_in: Vec::new(),
            assembly: Vec::new(),
            outbound: Vec::new(),
        }
    }

    /// Feeds raw socket bytes in and yields every message that completed.
    ///
    /// Partial records and partial messages are buffered; feeding a prefix is
    /// always safe and yields nothing until the remainder arrives.
    pub fn received_bytes(&mut self, bytes: &[u8]) -> Result<Vec<Incoming>> {
        self.raw_in.extend_from_slice(bytes);

        let mut consumed = 0;
        while self.raw_in.len() - consumed >= RECORD_LENGTH_PREFIX {
            let at = &self.raw_in[consumed..];
            let len = u32::from_le_bytes([at[0], at[1], at[2], 0]) as usize;
            if len > MAX_RECORD_LEN {
                return Err(Error::FrameTooLarge(len));
            }
            if len < AEAD_MAC_LEN {
                return Err(Error::DecryptFailure);
            }
            if at.len() < RECORD_LENGTH_PREFIX + len {
                break;
            }

            let mut record = at[RECORD_LENGTH_PREFIX..RECORD_LENGTH_PREFIX + len].to_vec();
            consumed += RECORD_LENGTH_PREFIX + len;

            self.recv
                .decrypt_with_ad(&[], &mut record)
                .map_err(|_| Error::DecryptFailure)?;
            self.recv.record_processed(record.len());
            if self.recv.rekey_due(self.byte_ceiling) {
                self.recv.rekey()?;
            }
            self.assembly.extend_from_slice(&record);
        }
        self.raw_in.drain(..consumed);

        let mut yielded = Vec::new();
        while self.assembly.len() >= Header::SIZE {
            let header = Header::from_bytes(&self.assembly[..Header::SIZE])?;
            let total = Header::SIZE + header.len();
            if self.assembly.len() < total {
                break;
            }
            let payload = &self.assembly[Header::SIZE..total];
            // Unknown types and malformed payloads are dropped without
            // tearing the connection down.
            match TpMessage::from_payload(header.msg_type(), payload) {
                Ok(message) => yielded.push(Incoming::Message(message)),
                Err(_) => yielded.push(Incoming::Unknown {
                    msg_type: header.msg_type(),
                    length: header.len(),
                }),
            }
            self.assembly.drain(..total);
        }
        Ok(yielded)
    }

    /// Frames, splits, and encrypts a message into the outbound buffer.
    pub fn set_message_to_send(&mut self, message: &TpMessage) -> Result<()> {
        let payload = message.encode_payload();
        let header = Header::new(
            EXTENSION_TYPE_NO_EXTENSION,
            message.message_type(),
            payload.len() as u32,
        )?;

        let mut framed = Vec::with_capacity(Header::SIZE + payload.len());
        framed.extend_from_slice(&header.to_bytes());
        framed.extend_from_slice(&payload);

        for chunk in framed.chunks(MAX_RECORD_PLAINTEXT) {
            let mut record = chunk.to_vec();
            self.send.encrypt_with_ad(&[], &mut record)?;
            self.send.record_processed(chunk.len());

            let len = record.len() as u32;
            self.outbound.extend_from_slice(&len.to_le_bytes()[..RECORD_LENGTH_PREFIX]);
            self.outbound.extend_from_slice(&record);

            if self.send.rekey_due(self.byte_ceiling) {
                self.send.rekey()?;
            }
        }
        Ok(())
    }

    /// Drains the bytes ready for the socket.
    pub fn bytes_to_send(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.outbound)
    }

    pub fn has_bytes_to_send(&self) -> bool {
        !self.outbound.is_empty()
    }
}

impl core::fmt::Debug for Transport {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Transport")
            .field("buffered_in", &self.raw_in.len())
            .field("assembly", &self.assembly.len())
            .field("outbound", &self.outbound.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template_distribution::{RequestTransactionData, RequestTransactionDataSuccess};
    use core::convert::TryInto;
    use quickcheck_macros::quickcheck;
    use tp_noise::REKEY_RECORD_LIMIT;

    fn transport_pair() -> (Transport, Transport) {
        let client = CipherPair {
            send: CipherState::new([0xaa; 32]),
            recv: CipherState::new([0xbb; 32]),
        };
        let server = CipherPair {
            send: CipherState::new([0xbb; 32]),
            recv: CipherState::new([0xaa; 32]),
        };
        (Transport::new(client), Transport::new(server))
    }

    fn request(template_id: u64) -> TpMessage {
        TpMessage::RequestTransactionData(RequestTransactionData { template_id })
    }

    fn big_message(tx_len: usize) -> TpMessage {
        TpMessage::RequestTransactionDataSuccess(RequestTransactionDataSuccess {
            template_id: 9,
            excess_data: Vec::new().try_into().unwrap(),
            transaction_list: vec![vec![0x5au8; tx_len].try_into().unwrap()]
                .try_into()
                .unwrap(),
        })
    }

    fn count_records(wire: &[u8]) -> usize {
        let mut count = 0;
        let mut pos = 0;
        while pos < wire.len() {
            let len = u32::from_le_bytes([wire[pos], wire[pos + 1], wire[pos + 2], 0]) as usize;
            assert!(len <= MAX_RECORD_LEN);
            pos += RECORD_LENGTH_PREFIX + len;
            count += 1;
        }
        assert_eq!(pos, wire.len());
        count
    }

    #[test]
    fn single_message_roundtrip() {
        let (mut a, mut b) = transport_pair();
        a.set_message_to_send(&request(42)).unwrap();
        let wire = a.bytes_to_send();
        assert_eq!(count_records(&wire), 1);

        let incoming = b.received_bytes(&wire).unwrap();
        assert_eq!(incoming, vec![Incoming::Message(request(42))]);
    }

    #[test]
    fn partial_input_is_buffered() {
        let (mut a, mut b) = transport_pair();
        a.set_message_to_send(&request(7)).unwrap();
        let wire = a.bytes_to_send();

        for &byte in &wire[..wire.len() - 1] {
            assert!(b.received_bytes(&[byte]).unwrap().is_empty());
        }
        let incoming = b.received_bytes(&wire[wire.len() - 1..]).unwrap();
        assert_eq!(incoming, vec![Incoming::Message(request(7))]);
    }

    #[test]
    fn large_message_fragments_and_reassembles() {
        let (mut a, mut b) = transport_pair();
        let message = big_message(200_000);
        let framed_len = Header::SIZE + message.encode_payload().len();

        a.set_message_to_send(&message).unwrap();
        let wire = a.bytes_to_send();
        let expected_records = framed_len.div_ceil(MAX_RECORD_PLAINTEXT);
        assert_eq!(count_records(&wire), expected_records);

        let incoming = b.received_bytes(&wire).unwrap();
        assert_eq!(incoming, vec![Incoming::Message(message)]);
    }

    #[quickcheck]
    fn fragmentation_record_count(extra: u32) -> bool {
        let len = (extra as usize % 150_000) + 1;
        let message = big_message(len);
        let framed_len = Header::SIZE + message.encode_payload().len();

        let (mut a, mut b) = transport_pair();
        a.set_message_to_send(&message).unwrap();
        let wire = a.bytes_to_send();

        count_records(&wire) == framed_len.div_ceil(MAX_RECORD_PLAINTEXT)
            && b.received_bytes(&wire).unwrap() == vec![Incoming::Message(message)]
    }

    #[test]
    fn pipelined_messages_all_arrive_in_order() {
        let (mut a, mut b) = transport_pair();
        for id in 0..10 {
            a.set_message_to_send(&request(id)).unwrap();
        }
        let incoming = b.received_bytes(&a.bytes_to_send()).unwrap();
        let expected: Vec<Incoming> = (0..10).map(|id| Incoming::Message(request(id))).collect();
        assert_eq!(incoming, expected);
    }

    #[test]
    fn unknown_message_type_dropped_connection_kept() {
        let (mut a, mut b) = transport_pair();

        // Hand-frame a type byte outside the protocol.
        let header = Header::new(EXTENSION_TYPE_NO_EXTENSION, 0x5f, 3).unwrap();
        let mut framed = header.to_bytes().to_vec();
        framed.extend_from_slice(&[1, 2, 3]);
        let mut record = framed;
        a.send.encrypt_with_ad(&[], &mut record).unwrap();
        a.send.record_processed(record.len() - AEAD_MAC_LEN);
        let mut wire = (record.len() as u32).to_le_bytes()[..3].to_vec();
        wire.extend_from_slice(&record);

        let incoming = b.received_bytes(&wire).unwrap();
        assert_eq!(
            incoming,
            vec![Incoming::Unknown {
                msg_type: 0x5f,
                length: 3
            }]
        );

        // The stream is still usable afterwards.
        a.set_message_to_send(&request(1)).unwrap();
        let incoming = b.received_bytes(&a.bytes_to_send()).unwrap();
        assert_eq!(incoming, vec![Incoming::Message(request(1))]);
    }

    #[test]
    fn tampered_record_is_fatal() {
        let (mut a, mut b) = transport_pair();
        a.set_message_to_send(&request(3)).unwrap();
        let mut wire = a.bytes_to_send();
        let last = wire.len() - 1;
        wire[last] ^= 0x80;
        assert_eq!(b.received_bytes(&wire), Err(Error::DecryptFailure));
    }

    #[test]
    fn oversized_record_length_is_fatal() {
        let (_, mut b) = transport_pair();
        // 0xffffff is far above the 65535 cap.
        assert_eq!(
            b.received_bytes(&[0xff, 0xff, 0xff]),
            Err(Error::FrameTooLarge(0xffffff))
        );
    }

    #[test]
    fn rekey_lockstep_via_byte_ceiling() {
        let client = CipherPair {
            send: CipherState::new([1; 32]),
            recv: CipherState::new([2; 32]),
        };
        let server = CipherPair {
            send: CipherState::new([2; 32]),
            recv: CipherState::new([1; 32]),
        };
        // A ceiling small enough that rekeys happen every couple of records.
        let mut a = Transport::with_byte_ceiling(client, 64);
        let mut b = Transport::with_byte_ceiling(server, 64);

        for id in 0..200 {
            a.set_message_to_send(&request(id)).unwrap();
            let incoming = b.received_bytes(&a.bytes_to_send()).unwrap();
            assert_eq!(incoming, vec![Incoming::Message(request(id))]);
        }
    }

    #[test]
    fn rekey_lockstep_at_record_limit() {
        let mut send = CipherState::new([7; 32]);
        let mut recv = CipherState::new([7; 32]);

        // Drive both states across the 2^16-record boundary and confirm they
        // keep agreeing without exchanging anything.
        for i in 0..=REKEY_RECORD_LIMIT {
            let mut buf = vec![(i & 0xff) as u8];
            send.encrypt_with_ad(&[], &mut buf).unwrap();
            send.record_processed(1);
            recv.decrypt_with_ad(&[], &mut buf).unwrap();
            recv.record_processed(1);
            assert_eq!(buf, vec![(i & 0xff) as u8]);

            let send_due = send.rekey_due(DEFAULT_REKEY_BYTE_CEILING);
            let recv_due = recv.rekey_due(DEFAULT_REKEY_BYTE_CEILING);
            assert_eq!(send_due, recv_due);
            if send_due {
                send.rekey().unwrap();
                recv.rekey().unwrap();
            }
        }
        assert!(send.records_with_key() < REKEY_RECORD_LIMIT);
    }
}
