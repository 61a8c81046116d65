use secp256k1::{Keypair, Secp256k1, SecretKey};

use crate::{
    Certificate, Error, Initiator, Responder, HANDSHAKE_STEP2_SIZE,
};

const NOW: u32 = 1_700_000_000;

fn authority() -> Keypair {
    let secp = Secp256k1::new();
    Keypair::from_secret_key(&secp, &SecretKey::from_slice(&[0xab; 32]).unwrap())
}

fn responder_with_window(valid_from: u32, valid_to: u32) -> Box<Responder> {
    let static_secret = [0x11; 32];
    let static_pub = crate::static_public_key(&static_secret);
    let cert = Certificate::sign(0, valid_from, valid_to, static_pub, &authority());
    Responder::new(static_secret, cert).unwrap()
}

fn run_handshake(
    initiator: &mut Initiator,
    responder: &mut Responder,
) -> (crate::CipherPair, crate::CipherPair) {
    let step_0 = initiator.step_0().unwrap();
    let (step_1, responder_keys) = responder.step_1(step_0).unwrap();
    let initiator_keys = initiator.step_2_with_now(step_1, NOW).unwrap();
    (initiator_keys, responder_keys)
}

#[test]
fn handshake_produces_mirrored_cipher_keys() {
    let authority_pub = authority().x_only_public_key().0.serialize();
    let mut responder = responder_with_window(NOW - 3600, NOW + 3600);
    let mut initiator = Initiator::new(Some(authority_pub)).unwrap();

    let (initiator_keys, responder_keys) = run_handshake(&mut initiator, &mut responder);

    assert_eq!(initiator_keys.send.k, responder_keys.recv.k);
    assert_eq!(initiator_keys.recv.k, responder_keys.send.k);
    assert_ne!(initiator_keys.send.k, initiator_keys.recv.k);
}

#[test]
fn transport_ciphers_interoperate_both_directions() {
    let authority_pub = authority().x_only_public_key().0.serialize();
    let mut responder = responder_with_window(NOW - 3600, NOW + 3600);
    let mut initiator = Initiator::new(Some(authority_pub)).unwrap();

    let (mut initiator_keys, mut responder_keys) = run_handshake(&mut initiator, &mut responder);

    let payload = b"template distribution".to_vec();

    let mut buf = payload.clone();
    responder_keys.send.encrypt_with_ad(&[], &mut buf).unwrap();
    initiator_keys.recv.decrypt_with_ad(&[], &mut buf).unwrap();
    assert_eq!(buf, payload);

    let mut buf = payload.clone();
    initiator_keys.send.encrypt_with_ad(&[], &mut buf).unwrap();
    responder_keys.recv.decrypt_with_ad(&[], &mut buf).unwrap();
    assert_eq!(buf, payload);
}

#[test]
fn handshake_message_sizes_are_fixed() {
    let mut responder = responder_with_window(NOW - 3600, NOW + 3600);
    let mut initiator = Initiator::new(None).unwrap();

    let step_0 = initiator.step_0().unwrap();
    assert_eq!(step_0.len(), 32);
    let (step_1, _) = responder.step_1(step_0).unwrap();
    assert_eq!(step_1.len(), HANDSHAKE_STEP2_SIZE);
    assert_eq!(step_1.len(), 170);
}

#[test]
fn initiator_learns_responder_static_key() {
    let static_secret = [0x11; 32];
    let expected = crate::static_public_key(&static_secret);

    let authority_pub = authority().x_only_public_key().0.serialize();
    let mut responder = responder_with_window(NOW - 3600, NOW + 3600);
    let mut initiator = Initiator::new(Some(authority_pub)).unwrap();

    run_handshake(&mut initiator, &mut responder);
    assert_eq!(initiator.responder_static(), Some(expected));
}

#[test]
fn certificate_not_yet_valid_fails_handshake() {
    let authority_pub = authority().x_only_public_key().0.serialize();
    let mut responder = responder_with_window(NOW + 1, NOW + 3600);
    let mut initiator = Initiator::new(Some(authority_pub)).unwrap();

    let step_0 = initiator.step_0().unwrap();
    let (step_1, _) = responder.step_1(step_0).unwrap();
    let err = initiator.step_2_with_now(step_1, NOW).unwrap_err();
    assert!(matches!(err, Error::HandshakeExpired { .. }));
}

#[test]
fn certificate_expired_fails_handshake() {
    let authority_pub = authority().x_only_public_key().0.serialize();
    let mut responder = responder_with_window(NOW - 3600, NOW - 1);
    let mut initiator = Initiator::new(Some(authority_pub)).unwrap();

    let step_0 = initiator.step_0().unwrap();
    let (step_1, _) = responder.step_1(step_0).unwrap();
    let err = initiator.step_2_with_now(step_1, NOW).unwrap_err();
    assert!(matches!(err, Error::HandshakeExpired { .. }));
}

#[test]
fn wrong_authority_fails_handshake() {
    let secp = Secp256k1::new();
    let other = Keypair::from_secret_key(&secp, &SecretKey::from_slice(&[0x42; 32]).unwrap());
    let other_pub = other.x_only_public_key().0.serialize();

    let mut responder = responder_with_window(NOW - 3600, NOW + 3600);
    let mut initiator = Initiator::new(Some(other_pub)).unwrap();

    let step_0 = initiator.step_0().unwrap();
    let (step_1, _) = responder.step_1(step_0).unwrap();
    let err = initiator.step_2_with_now(step_1, NOW).unwrap_err();
    assert!(matches!(err, Error::HandshakeAuth));
}

#[test]
fn tampered_step_2_fails_decryption() {
    let authority_pub = authority().x_only_public_key().0.serialize();
    let mut responder = responder_with_window(NOW - 3600, NOW + 3600);
    let mut initiator = Initiator::new(Some(authority_pub)).unwrap();

    let step_0 = initiator.step_0().unwrap();
    let (mut step_1, _) = responder.step_1(step_0).unwrap();
    // Corrupt a byte of the encrypted static key section.
    step_1[40] ^= 0x01;
    let err = initiator.step_2_with_now(step_1, NOW).unwrap_err();
    assert!(matches!(err, Error::HandshakeAuth));
}

#[test]
fn responder_rejects_certificate_for_other_key() {
    let static_secret = [0x11; 32];
    let other_pub = crate::static_public_key(&[0x22; 32]);
    let cert = Certificate::sign(0, NOW - 1, NOW + 1, other_pub, &authority());
    let err = Responder::new(static_secret, cert).unwrap_err();
    assert!(matches!(err, Error::CertificateKeyMismatch));
}

#[test]
fn fresh_handshakes_use_fresh_ephemerals() {
    let mut responder = responder_with_window(NOW - 3600, NOW + 3600);
    let mut initiator_a = Initiator::new(None).unwrap();
    let mut initiator_b = Initiator::new(None).unwrap();

    let (keys_a, _) = {
        let step_0 = initiator_a.step_0().unwrap();
        let (step_1, responder_keys) = responder.step_1(step_0).unwrap();
        (initiator_a.step_2_with_now(step_1, NOW).unwrap(), responder_keys)
    };

    let mut responder_b = responder_with_window(NOW - 3600, NOW + 3600);
    let keys_b = {
        let step_0 = initiator_b.step_0().unwrap();
        let (step_1, _) = responder_b.step_1(step_0).unwrap();
        initiator_b.step_2_with_now(step_1, NOW).unwrap()
    };

    assert_ne!(keys_a.send.k, keys_b.send.k);
}
