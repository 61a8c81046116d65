use core::ptr;

use chacha20poly1305::ChaCha20Poly1305;
use rand::{CryptoRng, RngCore};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::{
    certificate::Certificate,
    cipher_state::CipherPair,
    error::{Error, Result},
    handshake::HandshakeOp,
    HANDSHAKE_STEP1_SIZE, HANDSHAKE_STEP2_SIZE,
};

/// Server side of the handshake. Holds the static keypair and the
/// pre-signed authority certificate; one instance per inbound connection.
pub struct Responder {
    handshake_cipher: Option<ChaCha20Poly1305>,
    k: Option<[u8; 32]>,
    n: u64,
    // Chaining key
    ck: [u8; 32],
    // Transcript hash
    h: [u8; 32],
    s_secret: StaticSecret,
    s_public: PublicKey,
    certificate: Certificate,
}

impl core::fmt::Debug for Responder {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Responder").finish()
    }
}

impl HandshakeOp for Responder {
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

impl Responder {
    /// Builds a responder from the raw static secret and its certificate.
    /// The certificate must commit to the matching public key.
    pub fn new(static_secret: [u8; 32], certificate: Certificate) -> Result<Box<Self>> {
        let s_secret = StaticSecret::from(static_secret);
        let s_public = PublicKey::from(&s_secret);
        if certificate.static_pub() != s_public.as_bytes() {
            return Err(Error::CertificateKeyMismatch);
        }
        let mut responder = Self {
            handshake_cipher: None,
            k: None,
            n: 0,
            ck: [0; 32],
            h: [0; 32],
            s_secret,
            s_public,
            certificate,
        };
        responder.initialize_self();
        Ok(Box::new(responder))
    }

    /// Processes handshake message 1 and produces message 2.
    ///
    /// Message 1 is the initiator's 32-byte ephemeral X25519 public key.
    /// Message 2 is `e_r || EncryptAndHash(s_r) || EncryptAndHash(cert)`,
    /// 32 + 48 + 90 = 170 bytes. On success the session is established and
    /// the returned pair carries the transport keys: the responder sends
    /// with `k1` and receives with `k2`.
    pub fn step_1(
        &mut self,
        their_ephemeral: [u8; HANDSHAKE_STEP1_SIZE],
    ) -> Result<([u8; HANDSHAKE_STEP2_SIZE], CipherPair)> {
        self.step_1_with_rng(their_ephemeral, &mut rand::thread_rng())
    }

    pub fn step_1_with_rng<R: RngCore + CryptoRng>(
        &mut self,
        their_ephemeral: [u8; HANDSHAKE_STEP1_SIZE],
        rng: &mut R,
    ) -> Result<([u8; HANDSHAKE_STEP2_SIZE], CipherPair)> {
        // Receive: MixHash(e_i), then DecryptAndHash on the (empty) rest.
        self.mix_hash(&their_ephemeral);
        self.decrypt_and_hash(&mut vec![])?;
        let re = PublicKey::from(their_ephemeral);

        let mut out = [0u8; HANDSHAKE_STEP2_SIZE];

        // e
        let (e_secret, e_public) = Self::generate_key_with_rng(rng);
        out[..32].copy_from_slice(e_public.as_bytes());
        self.mix_hash(e_public.as_bytes());

        // ee
        let ee = Self::dh(&e_secret, &re);
        self.mix_key(ee.as_bytes());

        // s
        let mut encrypted_static = self.s_public.as_bytes().to_vec();
        self.encrypt_and_hash(&mut encrypted_static)?;
        out[32..80].copy_from_slice(&encrypted_static);

        // es
        let es = Self::dh(&self.s_secret, &re);
        self.mix_key(es.as_bytes());

        // SIGNATURE_NOISE_MESSAGE
        let mut encrypted_cert = self.certificate.to_wire().to_vec();
        self.encrypt_and_hash(&mut encrypted_cert)?;
        out[80..HANDSHAKE_STEP2_SIZE].copy_from_slice(&encrypted_cert);

        let (k1, k2) = self.split_ciphers();
        Ok((
            out,
            CipherPair {
                send: k1,
                recv: k2,
            },
        ))
    }

    pub fn static_public(&self) -> [u8; 32] {
        *self.s_public.as_bytes()
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

impl Drop for Responder {
    fn drop(&mut self) {
        self.erase();
    }
}
