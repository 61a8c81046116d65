//! Post-handshake symmetric cipher state.
//!
//! [`Split`](crate::handshake::HandshakeOp::split_ciphers) produces one
//! [`CipherState`] per direction. Each state tracks its 64-bit nonce plus the
//! record and plaintext-byte counters that drive the silent rekey schedule:
//! both endpoints count the same records, so they derive the same fresh key at
//! the same record index without any on-wire signal.

use core::ptr;

use chacha20poly1305::{
    aead::{AeadInPlace, Buffer},
    ChaCha20Poly1305, Key, KeyInit, Nonce,
};

use crate::error::{Error, Result};

/// Records processed under a single key before a rekey is due.
pub const REKEY_RECORD_LIMIT: u64 = 1 << 16;

/// Default plaintext byte ceiling per key (1 GiB).
pub const DEFAULT_REKEY_BYTE_CEILING: u64 = 1 << 30;

/// Nonce value reserved for key derivation; never used for a record.
const REKEY_NONCE: u64 = u64::MAX;

/// One direction of an established Noise session.
pub struct CipherState {
    pub(crate) k: [u8; 32],
    n: u64,
    cipher: ChaCha20Poly1305,
    records_with_key: u64,
    bytes_with_key: u64,
}

impl CipherState {
    pub fn new(key: [u8; 32]) -> Self {
        Self {
            k: key,
            n: 0,
            cipher: ChaCha20Poly1305::new(Key::from_slice(&key)),
            records_with_key: 0,
            bytes_with_key: 0,
        }
    }

    /// Current nonce counter. Strictly increasing under a given key.
    pub fn nonce(&self) -> u64 {
        self.n
    }

    /// Records processed since the last rekey.
    pub fn records_with_key(&self) -> u64 {
        self.records_with_key
    }

    // The 8-byte counter sits in the last eight bytes, little-endian, with
    // four leading zero bytes (RFC 7539 nonce layout).
    fn nonce_bytes(n: u64) -> [u8; 12] {
        let mut out = [0u8; 12];
        out[4..].copy_from_slice(&n.to_le_bytes());
        out
    }

    /// Encrypts `data` in place, appending the 16-byte tag, using the current
    /// nonce. The nonce advances only on success.
    pub fn encrypt_with_ad<T: Buffer>(&mut self, ad: &[u8], data: &mut T) -> Result<()> {
        if self.n == REKEY_NONCE {
            return Err(Error::NonceExhausted);
        }
        let nonce = Self::nonce_bytes(self.n);
        self.cipher
            .encrypt_in_place(Nonce::from_slice(&nonce), ad, data)
            .map_err(|_| Error::HandshakeAuth)?;
        self.n += 1;
        Ok(())
    }

    /// Decrypts `data` in place, stripping the tag. Fails without advancing
    /// the nonce when the tag does not verify.
    pub fn decrypt_with_ad<T: Buffer>(&mut self, ad: &[u8], data: &mut T) -> Result<()> {
        if self.n == REKEY_NONCE {
            return Err(Error::NonceExhausted);
        }
        let nonce = Self::nonce_bytes(self.n);
        self.cipher
            .decrypt_in_place(Nonce::from_slice(&nonce), ad, data)
            .map_err(|_| Error::HandshakeAuth)?;
        self.n += 1;
        Ok(())
    }

    /// Accounts for one transport record of `plaintext_len` bytes.
    pub fn record_processed(&mut self, plaintext_len: usize) {
        self.records_with_key += 1;
        self.bytes_with_key = self.bytes_with_key.saturating_add(plaintext_len as u64);
    }

    /// Whether the rekey schedule requires a fresh key before the next record.
    pub fn rekey_due(&self, byte_ceiling: u64) -> bool {
        self.records_with_key >= REKEY_RECORD_LIMIT || self.bytes_with_key >= byte_ceiling
    }

    /// Derives a fresh key from the current one and resets nonce and counters.
    ///
    /// `new_k = AEAD(k, n = 2^64-1, ad = [], pt = zeros[32])[0..32]`. Both
    /// endpoints apply this at the same record index, so no signal is
    /// exchanged.
    pub fn rekey(&mut self) -> Result<()> {
        let mut derived = vec![0u8; 32];
        let nonce = Self::nonce_bytes(REKEY_NONCE);
        self.cipher
            .encrypt_in_place(Nonce::from_slice(&nonce), &[], &mut derived)
            .map_err(|_| Error::HandshakeAuth)?;
        self.erase_key();
        self.k.copy_from_slice(&derived[..32]);
        self.cipher = ChaCha20Poly1305::new(Key::from_slice(&self.k));
        self.n = 0;
        self.records_with_key = 0;
        self.bytes_with_key = 0;
        Ok(())
    }

    fn erase_key(&mut self) {
        for b in self.k.iter_mut() {
            unsafe { ptr::write_volatile(b, 0) };
        }
    }
}

impl Drop for CipherState {
    fn drop(&mut self) {
        self.erase_key();
    }
}

impl core::fmt::Debug for CipherState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CipherState")
            .field("n", &self.n)
            .field("records_with_key", &self.records_with_key)
            .finish()
    }
}

/// The two directions produced by a completed handshake.
#[derive(Debug)]
pub struct CipherPair {
    pub send: CipherState,
    pub recv: CipherState,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_with_ad() {
        let mut tx = CipherState::new([7; 32]);
        let mut rx = CipherState::new([7; 32]);

        let ad = [1, 2, 3];
        let data = vec![1, 7, 92, 3, 4, 5];

        let mut buf = data.clone();
        tx.encrypt_with_ad(&ad, &mut buf).unwrap();
        assert_ne!(buf, data);
        assert_eq!(buf.len(), data.len() + 16);

        rx.decrypt_with_ad(&ad, &mut buf).unwrap();
        assert_eq!(buf, data);
    }

    #[test]
    fn nonce_advances_per_message() {
        let mut tx = CipherState::new([0; 32]);
        let mut buf = vec![0u8; 4];
        tx.encrypt_with_ad(&[], &mut buf).unwrap();
        assert_eq!(tx.nonce(), 1);
        let mut buf = vec![0u8; 4];
        tx.encrypt_with_ad(&[], &mut buf).unwrap();
        assert_eq!(tx.nonce(), 2);
    }

    #[test]
    fn tampered_tag_rejected_without_nonce_advance() {
        let mut tx = CipherState::new([9; 32]);
        let mut rx = CipherState::new([9; 32]);

        let mut buf = vec![42u8; 10];
        tx.encrypt_with_ad(&[], &mut buf).unwrap();
        let last = buf.len() - 1;
        buf[last] ^= 0xff;

        assert!(rx.decrypt_with_ad(&[], &mut buf).is_err());
        assert_eq!(rx.nonce(), 0);
    }

    #[test]
    fn rekey_is_deterministic_and_resets_counters() {
        let mut a = CipherState::new([3; 32]);
        let mut b = CipherState::new([3; 32]);

        for _ in 0..5 {
            a.record_processed(100);
            b.record_processed(100);
        }
        a.rekey().unwrap();
        b.rekey().unwrap();

        assert_eq!(a.k, b.k);
        assert_ne!(a.k, [3; 32]);
        assert_eq!(a.nonce(), 0);
        assert_eq!(a.records_with_key(), 0);

        // Both sides still agree after the swap.
        let mut buf = vec![5u8; 8];
        a.encrypt_with_ad(&[], &mut buf).unwrap();
        b.decrypt_with_ad(&[], &mut buf).unwrap();
        assert_eq!(buf, vec![5u8; 8]);
    }

    #[test]
    fn rekey_due_at_record_limit() {
        let mut cs = CipherState::new([0; 32]);
        for _ in 0..REKEY_RECORD_LIMIT - 1 {
            cs.record_processed(1);
        }
        assert!(!cs.rekey_due(DEFAULT_REKEY_BYTE_CEILING));
        cs.record_processed(1);
        assert!(cs.rekey_due(DEFAULT_REKEY_BYTE_CEILING));
    }

    #[test]
    fn rekey_due_at_byte_ceiling() {
        let mut cs = CipherState::new([0; 32]);
        cs.record_processed(1024);
        assert!(!cs.rekey_due(2048));
        cs.record_processed(1024);
        assert!(cs.rekey_due(2048));
    }
}
