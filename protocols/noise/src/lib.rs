//! Noise handshake and transport crypto for the Stratum v2 Template Provider.
//!
//! Secures every connection between the Template Provider (always the
//! responder) and its clients with a one-round-trip, responder-authenticated
//! handshake, modeled on the `NX` pattern:
//!
//! 1. Initiator → Responder: 32-byte ephemeral X25519 public key.
//! 2. Responder → Initiator: ephemeral key, encrypted static key, and an
//!    encrypted [`Certificate`] binding the static key under the long-lived
//!    authority key (Schnorr/BIP340 over secp256k1).
//!
//! Primitives: X25519 Diffie-Hellman, HKDF over HMAC-SHA256,
//! ChaCha20-Poly1305 AEAD, SHA-256 transcript hashing. After the handshake
//! both directions run an independent [`CipherState`] with silent key
//! rotation at fixed record and byte thresholds.

mod certificate;
mod cipher_state;
mod error;
mod handshake;
mod initiator;
mod responder;
#[cfg(test)]
mod test;

/// Size of the AEAD authentication tag.
pub const AEAD_MAC_LEN: usize = 16;

/// Size of an X25519 public key on the wire.
pub const EPHEMERAL_PUBLIC_SIZE: usize = 32;

/// Handshake message 1: the initiator's plaintext ephemeral public key.
pub const HANDSHAKE_STEP1_SIZE: usize = EPHEMERAL_PUBLIC_SIZE;

/// Encrypted responder static key: 32 bytes ciphertext plus tag.
pub const ENCRYPTED_STATIC_PUBLIC_SIZE: usize = EPHEMERAL_PUBLIC_SIZE + AEAD_MAC_LEN;

/// Encrypted certificate: 74 bytes plaintext plus tag.
pub const ENCRYPTED_CERTIFICATE_SIZE: usize = certificate::CERTIFICATE_WIRE_SIZE + AEAD_MAC_LEN;

/// Handshake message 2: `e || EncryptAndHash(s) || EncryptAndHash(cert)`.
pub const HANDSHAKE_STEP2_SIZE: usize =
    EPHEMERAL_PUBLIC_SIZE + ENCRYPTED_STATIC_PUBLIC_SIZE + ENCRYPTED_CERTIFICATE_SIZE;

/// Protocol name hashed into the initial chaining key and transcript.
pub const NOISE_PROTOCOL_NAME: &str = "Noise_NX_25519_ChaChaPoly_SHA256";

pub use certificate::{Certificate, CERTIFICATE_WIRE_SIZE};
pub use cipher_state::{CipherPair, CipherState, DEFAULT_REKEY_BYTE_CEILING, REKEY_RECORD_LIMIT};
pub use error::{Error, Result};
pub use handshake::HandshakeOp;
pub use initiator::Initiator;
pub use responder::Responder;

/// Derives the X25519 public key for a raw 32-byte static secret.
pub fn static_public_key(static_secret: &[u8; 32]) -> [u8; 32] {
    let secret = x25519_dalek::StaticSecret::from(*static_secret);
    *x25519_dalek::PublicKey::from(&secret).as_bytes()
}
