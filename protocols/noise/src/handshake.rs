// Handshake symmetric-state operations.
//
// The [`HandshakeOp`] trait carries the chaining key `ck`, transcript hash
// `h`, and the optional in-handshake cipher shared by the
// [`crate::Initiator`] and [`crate::Responder`]. Provided methods implement
// the Noise symmetric primitives: `MixHash`, `MixKey`, `EncryptAndHash`,
// `DecryptAndHash`, HKDF over HMAC-SHA256, and the final `Split` into a pair
// of transport cipher states.
//
// Diffie-Hellman is X25519; the in-handshake AEAD is ChaCha20-Poly1305 with
// the transcript hash as associated data.

use chacha20poly1305::{
    aead::AeadInPlace, ChaCha20Poly1305, Key as ChaChaKey, KeyInit, Nonce,
};
use rand::{CryptoRng, RngCore};
use secp256k1::hashes::{sha256::Hash as Sha256Hash, Hash};
use x25519_dalek::{PublicKey, SharedSecret, StaticSecret};

use crate::{
    cipher_state::CipherState,
    error::{Error, Result},
    NOISE_PROTOCOL_NAME,
};

/// `SHA256(protocol_name)`, the initial value of both `h` and `ck`.
pub fn hashed_protocol_name() -> [u8; 32] {
    Sha256Hash::hash(NOISE_PROTOCOL_NAME.as_bytes()).to_byte_array()
}

pub trait HandshakeOp {
    fn get_h(&mut self) -> &mut [u8; 32];
    fn get_ck(&mut self) -> &mut [u8; 32];
    fn set_h(&mut self, data: [u8; 32]);
    fn set_ck(&mut self, data: [u8; 32]);
    fn get_k(&mut self) -> &mut Option<[u8; 32]>;
    fn set_k(&mut self, k: Option<[u8; 32]>);
    fn get_n(&self) -> u64;
    fn set_n(&mut self, n: u64);
    fn get_cipher(&mut self) -> &mut Option<ChaCha20Poly1305>;
    fn set_handshake_cipher(&mut self, cipher: ChaCha20Poly1305);

    /// `h ← SHA256(h || data)`
    fn mix_hash(&mut self, data: &[u8]) {
        let h = self.get_h();
        let mut to_hash = Vec::with_capacity(32 + data.len());
        to_hash.extend_from_slice(h);
        to_hash.extend_from_slice(data);
        *h = Sha256Hash::hash(&to_hash).to_byte_array();
    }

    fn hmac_hash(key: &[u8; 32], data: &[u8]) -> [u8; 32] {
        let mut ipad = [0x36u8; 64];
        let mut opad = [0x5cu8; 64];
        for i in 0..32 {
            ipad[i] = key[i] ^ 0x36;
            opad[i] = key[i] ^ 0x5c;
        }

        let mut to_hash = Vec::with_capacity(64 + data.len());
        to_hash.extend_from_slice(&ipad);
        to_hash.extend_from_slice(data);
        let inner = Sha256Hash::hash(&to_hash).to_byte_array();

        to_hash.clear();
        to_hash.extend_from_slice(&opad);
        to_hash.extend_from_slice(&inner);
        Sha256Hash::hash(&to_hash).to_byte_array()
    }

    fn hkdf_2(chaining_key: &[u8; 32], input_key_material: &[u8]) -> ([u8; 32], [u8; 32]) {
        let temp_key = Self::hmac_hash(chaining_key, input_key_material);
        let out_1 = Self::hmac_hash(&temp_key, &[0x01]);
        let out_2 = Self::hmac_hash(&temp_key, &[&out_1[..], &[0x02][..]].concat());
        (out_1, out_2)
    }

    /// `(ck', temp_k) ← HKDF(ck, input)`; reinitializes the handshake cipher
    /// with `temp_k` and nonce zero.
    fn mix_key(&mut self, input_key_material: &[u8]) {
        let ck = self.get_ck();
        let (ck, temp_k) = Self::hkdf_2(ck, input_key_material);
        self.set_ck(ck);
        self.initialize_key(temp_k);
    }

    fn initialize_key(&mut self, key: [u8; 32]) {
        self.set_n(0);
        self.set_handshake_cipher(ChaCha20Poly1305::new(ChaChaKey::from_slice(&key)));
        self.set_k(Some(key));
    }

    /// Sets `h` and `ck` to the hashed protocol name and mixes in the empty
    /// prologue.
    fn initialize_self(&mut self) {
        let name_hash = hashed_protocol_name();
        self.set_h(name_hash);
        self.set_ck(name_hash);
        self.set_k(None);
        self.mix_hash(&[]);
    }

    fn handshake_nonce(&self) -> [u8; 12] {
        let mut out = [0u8; 12];
        out[4..].copy_from_slice(&self.get_n().to_le_bytes());
        out
    }

    /// Encrypts `plaintext` in place (appending the tag) with `ad = h`, then
    /// mixes the ciphertext into the transcript. With no key yet, reduces to
    /// `MixHash(plaintext)`.
    fn encrypt_and_hash(&mut self, plaintext: &mut Vec<u8>) -> Result<()> {
        if self.get_k().is_some() {
            let h = *self.get_h();
            let nonce = self.handshake_nonce();
            let cipher = self
                .get_cipher()
                .as_mut()
                .ok_or(Error::HandshakeMalformed)?;
            cipher
                .encrypt_in_place(Nonce::from_slice(&nonce), &h, plaintext)
                .map_err(|_| Error::HandshakeAuth)?;
            self.set_n(self.get_n() + 1);
        }
        let ciphertext = plaintext.clone();
        self.mix_hash(&ciphertext);
        Ok(())
    }

    /// Inverse of [`Self::encrypt_and_hash`]; fails with `HandshakeAuth` on a
    /// tag mismatch.
    fn decrypt_and_hash(&mut self, ciphertext: &mut Vec<u8>) -> Result<()> {
        let received = ciphertext.clone();
        if self.get_k().is_some() {
            let h = *self.get_h();
            let nonce = self.handshake_nonce();
            let cipher = self
                .get_cipher()
                .as_mut()
                .ok_or(Error::HandshakeMalformed)?;
            cipher
                .decrypt_in_place(Nonce::from_slice(&nonce), &h, ciphertext)
                .map_err(|_| Error::HandshakeAuth)?;
            self.set_n(self.get_n() + 1);
        }
        self.mix_hash(&received);
        Ok(())
    }

    fn generate_key_with_rng<R: RngCore + CryptoRng>(rng: &mut R) -> (StaticSecret, PublicKey) {
        let secret = StaticSecret::random_from_rng(rng);
        let public = PublicKey::from(&secret);
        (secret, public)
    }

    fn dh(secret: &StaticSecret, public: &PublicKey) -> SharedSecret {
        secret.diffie_hellman(public)
    }

    /// `HKDF(ck, "") → (k1, k2)`, each wrapped in a fresh transport cipher
    /// state with nonce zero. The caller assigns directions: the responder
    /// sends with `k1` and receives with `k2`; the initiator is swapped.
    fn split_ciphers(&mut self) -> (CipherState, CipherState) {
        let ck = self.get_ck();
        let (k1, k2) = Self::hkdf_2(ck, &[]);
        (CipherState::new(k1), CipherState::new(k2))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestHandshake {
        k: Option<[u8; 32]>,
        n: u64,
        cipher: Option<ChaCha20Poly1305>,
        h: [u8; 32],
        ck: [u8; 32],
    }

    impl TestHandshake {
        fn new() -> Self {
            let mut hs = TestHandshake {
                k: None,
                n: 0,
                cipher: None,
                h: [0; 32],
                ck: [0; 32],
            };
            hs.initialize_self();
            hs
        }
    }

    impl HandshakeOp for TestHandshake {
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
            &mut self.cipher
        }
        fn set_handshake_cipher(&mut self, cipher: ChaCha20Poly1305) {
            self.cipher = Some(cipher);
        }
    }

    #[test]
    fn hmac_hash_matches_manual_construction() {
        let k = [0u8; 32];
        let data = [0u8; 90];
        let value = TestHandshake::hmac_hash(&k, &data);

        let mut to_hash = vec![0x36u8; 64];
        to_hash.extend_from_slice(&data);
        let inner = Sha256Hash::hash(&to_hash).to_byte_array();

        let mut to_hash = vec![0x5cu8; 64];
        to_hash.extend_from_slice(&inner);
        let expected = Sha256Hash::hash(&to_hash).to_byte_array();

        assert_eq!(value, expected);
    }

    #[test]
    fn hkdf_2_expands_in_order() {
        let ck = [0u8; 32];
        let ikm = [0u8; 32];
        let temp = TestHandshake::hmac_hash(&ck, &ikm);
        let expected_1 = TestHandshake::hmac_hash(&temp, &[0x01]);
        let mut second = expected_1.to_vec();
        second.push(0x02);
        let expected_2 = TestHandshake::hmac_hash(&temp, &second);

        let (out_1, out_2) = TestHandshake::hkdf_2(&ck, &ikm);
        assert_eq!(out_1, expected_1);
        assert_eq!(out_2, expected_2);
    }

    #[test]
    fn mix_key_updates_ck_and_k() {
        let ikm = [0u8; 32];
        let mut hs = TestHandshake::new();
        hs.set_ck([0; 32]);

        let (ck, temp_k) = TestHandshake::hkdf_2(&[0; 32], &ikm);
        hs.mix_key(&ikm);

        assert_eq!(*hs.get_ck(), ck);
        assert_eq!(hs.get_k().unwrap(), temp_k);
    }

    #[test]
    fn mix_hash_appends_and_rehashes() {
        let mut hs = TestHandshake::new();
        hs.set_h([0; 32]);

        let mut to_hash = [0u8; 32].to_vec();
        to_hash.extend_from_slice(&[1, 2, 3]);
        let expected = Sha256Hash::hash(&to_hash).to_byte_array();

        hs.mix_hash(&[1, 2, 3]);
        assert_eq!(*hs.get_h(), expected);
    }

    #[test]
    fn encrypt_then_decrypt_with_hash_agree() {
        let mut a = TestHandshake::new();
        let mut b = TestHandshake::new();
        a.initialize_key([1; 32]);
        b.initialize_key([1; 32]);
        a.set_h([0; 32]);
        b.set_h([0; 32]);

        let data = vec![1, 7, 92, 3, 4, 5];
        let mut buf = data.clone();
        a.encrypt_and_hash(&mut buf).unwrap();
        assert_ne!(buf, data);

        b.decrypt_and_hash(&mut buf).unwrap();
        assert_eq!(buf, data);
        assert_eq!(*a.get_h(), *b.get_h());
    }

    #[test]
    fn encrypt_and_hash_without_key_only_mixes() {
        let mut hs = TestHandshake::new();
        let h_before = *hs.get_h();
        let mut buf = vec![9, 9, 9];
        hs.encrypt_and_hash(&mut buf).unwrap();
        assert_eq!(buf, vec![9, 9, 9]);
        assert_ne!(*hs.get_h(), h_before);
    }

    #[test]
    fn x25519_shared_secret_agrees() {
        let mut rng = rand::thread_rng();
        let (sec_1, pub_1) = TestHandshake::generate_key_with_rng(&mut rng);
        let (sec_2, pub_2) = TestHandshake::generate_key_with_rng(&mut rng);

        let dh_1 = TestHandshake::dh(&sec_1, &pub_2);
        let dh_2 = TestHandshake::dh(&sec_2, &pub_1);
        assert_eq!(dh_1.as_bytes(), dh_2.as_bytes());
    }

    #[test]
    fn split_is_symmetric_given_equal_ck() {
        let mut a = TestHandshake::new();
        let mut b = TestHandshake::new();
        a.set_ck([5; 32]);
        b.set_ck([5; 32]);

        let (a1, a2) = a.split_ciphers();
        let (b1, b2) = b.split_ciphers();
        assert_eq!(a1.k, b1.k);
        assert_eq!(a2.k, b2.k);
        assert_ne!(a1.k, a2.k);
    }
}
