// Authority-signed binding of the responder static key.
//
// The certificate commits to a validity window and the responder's static
// X25519 public key, under a Schnorr (BIP340) signature by the long-lived
// authority key. The static key itself is not part of the wire form: the
// initiator already received it encrypted earlier in the handshake and pairs
// it back up before verifying.

use rand::{CryptoRng, Rng};
use secp256k1::{
    hashes::{sha256::Hash as Sha256Hash, Hash},
    schnorr::Signature,
    Keypair, Message, Secp256k1, XOnlyPublicKey,
};

use crate::error::{Error, Result};

/// Length of the certificate as transmitted: version, validity window and
/// signature. 2 + 4 + 4 + 64 bytes.
pub const CERTIFICATE_WIRE_SIZE: usize = 74;

// Domain separation for the signed digest.
const SIGNING_TAG: &[u8] = b"SV2-CERT";

/// An authority-signed certificate for a responder static key.
#[derive(Clone)]
pub struct Certificate {
    pub version: u16,
    pub valid_from: u32,
    pub valid_to: u32,
    static_pub: [u8; 32],
    signature: [u8; 64],
}

impl Certificate {
    /// Signs a certificate over `static_pub` with the authority keypair.
    pub fn sign(
        version: u16,
        valid_from: u32,
        valid_to: u32,
        static_pub: [u8; 32],
        authority: &Keypair,
    ) -> Self {
        Self::sign_with_rng(
            version,
            valid_from,
            valid_to,
            static_pub,
            authority,
            &mut rand::thread_rng(),
        )
    }

    pub fn sign_with_rng<R: Rng + CryptoRng>(
        version: u16,
        valid_from: u32,
        valid_to: u32,
        static_pub: [u8; 32],
        authority: &Keypair,
        rng: &mut R,
    ) -> Self {
        let secp = Secp256k1::signing_only();
        let digest = Self::signed_digest(version, valid_from, valid_to, &static_pub);
        let signature = secp.sign_schnorr_with_rng(&digest, authority, rng);
        let mut sig = [0u8; 64];
        sig.copy_from_slice(signature.as_ref());
        Self {
            version,
            valid_from,
            valid_to,
            static_pub,
            signature: sig,
        }
    }

    // m = SHA256("SV2-CERT" || version || valid_from || valid_to || static_pub),
    // all integers little-endian.
    fn signed_digest(
        version: u16,
        valid_from: u32,
        valid_to: u32,
        static_pub: &[u8; 32],
    ) -> Message {
        let mut data = Vec::with_capacity(SIGNING_TAG.len() + 2 + 4 + 4 + 32);
        data.extend_from_slice(SIGNING_TAG);
        data.extend_from_slice(&version.to_le_bytes());
        data.extend_from_slice(&valid_from.to_le_bytes());
        data.extend_from_slice(&valid_to.to_le_bytes());
        data.extend_from_slice(static_pub);
        Message::from_digest(Sha256Hash::hash(&data).to_byte_array())
    }

    /// Checks the validity window against `now` and the Schnorr signature
    /// against the authority public key.
    pub fn verify_with_now(&self, authority: &XOnlyPublicKey, now: u32) -> Result<()> {
        if now < self.valid_from || now > self.valid_to {
            return Err(Error::HandshakeExpired {
                valid_from: self.valid_from,
                valid_to: self.valid_to,
                now,
            });
        }
        let secp = Secp256k1::verification_only();
        let signature = Signature::from_slice(&self.signature).map_err(|_| Error::HandshakeAuth)?;
        let digest = Self::signed_digest(
            self.version,
            self.valid_from,
            self.valid_to,
            &self.static_pub,
        );
        secp.verify_schnorr(&signature, &digest, authority)
            .map_err(|_| Error::HandshakeAuth)
    }

    /// Serializes the transmitted portion: version, window, signature.
    pub fn to_wire(&self) -> [u8; CERTIFICATE_WIRE_SIZE] {
        let mut out = [0u8; CERTIFICATE_WIRE_SIZE];
        out[0..2].copy_from_slice(&self.version.to_le_bytes());
        out[2..6].copy_from_slice(&self.valid_from.to_le_bytes());
        out[6..10].copy_from_slice(&self.valid_to.to_le_bytes());
        out[10..74].copy_from_slice(&self.signature);
        out
    }

    /// Reconstructs a certificate from its wire form, pairing it with the
    /// static key transmitted separately during the handshake.
    pub fn from_wire(bytes: [u8; CERTIFICATE_WIRE_SIZE], static_pub: [u8; 32]) -> Self {
        let version = u16::from_le_bytes([bytes[0], bytes[1]]);
        let valid_from = u32::from_le_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]);
        let valid_to = u32::from_le_bytes([bytes[6], bytes[7], bytes[8], bytes[9]]);
        let mut signature = [0u8; 64];
        signature.copy_from_slice(&bytes[10..74]);
        Self {
            version,
            valid_from,
            valid_to,
            static_pub,
            signature,
        }
    }

    pub fn static_pub(&self) -> &[u8; 32] {
        &self.static_pub
    }
}

impl core::fmt::Debug for Certificate {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Certificate")
            .field("version", &self.version)
            .field("valid_from", &self.valid_from)
            .field("valid_to", &self.valid_to)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secp256k1::SecretKey;

    fn authority() -> Keypair {
        let secp = Secp256k1::new();
        let secret = SecretKey::from_slice(&[0xcd; 32]).unwrap();
        Keypair::from_secret_key(&secp, &secret)
    }

    const NOW: u32 = 1_700_000_000;

    #[test]
    fn sign_verify_roundtrip() {
        let kp = authority();
        let cert = Certificate::sign(0, NOW - 3600, NOW + 3600, [7; 32], &kp);
        cert.verify_with_now(&kp.x_only_public_key().0, NOW)
            .unwrap();
    }

    #[test]
    fn wire_roundtrip_preserves_signature() {
        let kp = authority();
        let cert = Certificate::sign(0, NOW - 3600, NOW + 3600, [7; 32], &kp);
        let restored = Certificate::from_wire(cert.to_wire(), [7; 32]);
        restored
            .verify_with_now(&kp.x_only_public_key().0, NOW)
            .unwrap();
    }

    #[test]
    fn not_yet_valid_rejected() {
        let kp = authority();
        let cert = Certificate::sign(0, NOW + 1, NOW + 3600, [7; 32], &kp);
        let err = cert
            .verify_with_now(&kp.x_only_public_key().0, NOW)
            .unwrap_err();
        assert!(matches!(err, Error::HandshakeExpired { .. }));
    }

    #[test]
    fn expired_rejected() {
        let kp = authority();
        let cert = Certificate::sign(0, NOW - 3600, NOW - 1, [7; 32], &kp);
        let err = cert
            .verify_with_now(&kp.x_only_public_key().0, NOW)
            .unwrap_err();
        assert!(matches!(err, Error::HandshakeExpired { .. }));
    }

    #[test]
    fn window_edges_accepted() {
        let kp = authority();
        let pk = kp.x_only_public_key().0;
        let cert = Certificate::sign(0, NOW, NOW, [7; 32], &kp);
        cert.verify_with_now(&pk, NOW).unwrap();
    }

    #[test]
    fn wrong_authority_rejected() {
        let secp = Secp256k1::new();
        let kp = authority();
        let other = Keypair::from_secret_key(&secp, &SecretKey::from_slice(&[0xee; 32]).unwrap());
        let cert = Certificate::sign(0, NOW - 1, NOW + 1, [7; 32], &kp);
        let err = cert
            .verify_with_now(&other.x_only_public_key().0, NOW)
            .unwrap_err();
        assert!(matches!(err, Error::HandshakeAuth));
    }

    #[test]
    fn signature_binds_static_key() {
        let kp = authority();
        let cert = Certificate::sign(0, NOW - 1, NOW + 1, [7; 32], &kp);
        // Same wire bytes paired with a different static key must not verify.
        let forged = Certificate::from_wire(cert.to_wire(), [8; 32]);
        let err = forged
            .verify_with_now(&kp.x_only_public_key().0, NOW)
            .unwrap_err();
        assert!(matches!(err, Error::HandshakeAuth));
    }
}
