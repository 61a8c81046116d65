use core::ptr;
use std::time::{SystemTime, UNIX_EPOCH};

use chacha20poly1305::ChaCha20Poly1305;
use rand::{CryptoRng, RngCore};
use secp256k1::XOnlyPublicKey;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::{
    certificate::Certificate,
    cipher_state::CipherPair,
    error::{Error, Result},
    handshake::HandshakeOp,
    CERTIFICATE_WIRE_SIZE, HANDSHAKE_STEP1_SIZE, HANDSHAKE_STEP2_SIZE,
};

/// Client side of the handshake. Knows the authority public key and verifies
/// the responder certificate before accepting the session.
pub struct Initiator {
    handshake_cipher: Option<ChaCha20Poly1305>,
    k: Option<[u8; 32]>,
    n: u64,
    // Chaining key
    ck: [u8; 32],
    // Transcript hash
    h: [u8; 32],
    e_secret: StaticSecret,
    e_public: PublicKey,
    authority_pub: Option<XOnlyPublicKey>,
    responder_static: Option<[u8; 32]>,
}

impl core::fmt::Debug for Initiator {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Initiator").finish()
    }
}

impl HandshakeOp for Initiator {
    fn get_h(&mut self) -> &mut [u8; 32] {
        &mut self.h
    }
    fn get_ck(&mut self) -> &mut [u8; 32] {
        &mut self.ck
    }
    fn set_h(&mut self, data: [u8; 32]) {
        self.h = data;
    }
    fn set_ck(&mut self, data: [u8; 32]) {
        self.ck = data;
    }
    fn get_k(&mut self) -> &mut Option<[u8; 32]> {
        &mut self.k
    }
    fn set_k(&mut self, k: Option<[u8; 32]>) {
        self.k = k;
    }
    fn get_n(&self) -> u64 {
        self.n
    }
    fn set_n(&mut self, n: u64) {
        self.n = n;
    }
    fn get_cipher(&mut self) -> &mut Option<ChaCha20Poly1305> {
        &mut self.handshake_cipher
    }
    fn set_handshake_cipher(&mut self, cipher: ChaCha20Poly1305) {
        self.handshake_cipher = Some(cipher);
    }
}

impl Initiator {
    /// `authority_pub` is the known 32-byte x-only authority key; without it
    /// the certificate signature is not checked (test rigs only).
    pub fn new(authority_pub: Option<[u8; 32]>) -> Result<Box<Self>> {
        Self::with_rng(authority_pub, &mut rand::thread_rng())
    }

    pub fn with_rng<R: RngCore + CryptoRng>(
        authority_pub: Option<[u8; 32]>,
        rng: &mut R,
    ) -> Result<Box<Self>> {
        let authority_pub = match authority_pub {
            Some(raw) => {
                Some(XOnlyPublicKey::from_slice(&raw).map_err(|_| Error::InvalidRawPublicKey)?)
            }
            None => None,
        };
        let (e_secret, e_public) = Self::generate_key_with_rng(rng);
        let mut initiator = Self {
            handshake_cipher: None,
            k: None,
            n: 0,
            ck: [0; 32],
            h: [0; 32],
            e_secret,
            e_public,
            authority_pub,
            responder_static: None,
        };
        initiator.initialize_self();
        Ok(Box::new(initiator))
    }

    /// Produces handshake message 1: the 32-byte ephemeral public key.
    pub fn step_0(&mut self) -> Result<[u8; HANDSHAKE_STEP1_SIZE]> {
        let e_public = self.e_public;
        self.mix_hash(e_public.as_bytes());
        self.encrypt_and_hash(&mut vec![])?;
        Ok(*e_public.as_bytes())
    }

    /// Processes handshake message 2 and completes the session.
    ///
    /// Decrypts the responder static key and certificate, verifies the
    /// certificate window and authority signature, and splits into transport
    /// keys: the initiator sends with `k2` and receives with `k1`.
    pub fn step_2(&mut self, message: [u8; HANDSHAKE_STEP2_SIZE]) -> Result<CipherPair> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or(0);
        self.step_2_with_now(message, now)
    }

    pub fn step_2_with_now(
        &mut self,
        message: [u8; HANDSHAKE_STEP2_SIZE],
        now: u32,
    ) -> Result<CipherPair> {
        // e
        let mut re_bytes = [0u8; 32];
        re_bytes.copy_from_slice(&message[..32]);
        self.mix_hash(&re_bytes);
        let re = PublicKey::from(re_bytes);

        // ee
        let ee = Self::dh(&self.e_secret, &re);
        self.mix_key(ee.as_bytes());

        // s
        let mut encrypted_static = message[32..80].to_vec();
        self.decrypt_and_hash(&mut encrypted_static)?;
        let rs_bytes: [u8; 32] = encrypted_static
            .try_into()
            .map_err(|_| Error::HandshakeMalformed)?;
        let rs = PublicKey::from(rs_bytes);

        // es
        let es = Self::dh(&self.e_secret, &rs);
        self.mix_key(es.as_bytes());

        // SIGNATURE_NOISE_MESSAGE
        let mut encrypted_cert = message[80..HANDSHAKE_STEP2_SIZE].to_vec();
        self.decrypt_and_hash(&mut encrypted_cert)?;
        let wire: [u8; CERTIFICATE_WIRE_SIZE] = encrypted_cert
            .try_into()
            .map_err(|_| Error::HandshakeMalformed)?;
        let certificate = Certificate::from_wire(wire, rs_bytes);
        if let Some(authority) = &self.authority_pub {
            certificate.verify_with_now(authority, now)?;
        }
        self.responder_static = Some(rs_bytes);

        let (k1, k2) = self.split_ciphers();
        Ok(CipherPair {
            send: k2,
            recv: k1,
        })
    }

    /// The responder static key learned in step 2.
    pub fn responder_static(&self) -> Option<[u8; 32]> {
        self.responder_static
    }

    fn erase(&mut self) {
        if let Some(k) = self.k.as_mut() {
            for b in k.iter_mut() {
                unsafe { ptr::write_volatile(b, 0) };
            }
        }
        for b in self.ck.iter_mut() {
            unsafe { ptr::write_volatile(b, 0) };
        }
        for b in self.h.iter_mut() {
            unsafe { ptr::write_volatile(b, 0) };
        }
    }
}

impl Drop for Initiator {
    fn drop(&mut self) {
        self.erase();
    }
}
