use core::fmt;

/// Errors raised while establishing or operating a Noise session.
///
/// All handshake variants are fatal to the connection: no session key exists
/// yet, so the peer is closed without emitting a frame.
#[derive(Debug)]
pub enum Error {
    /// A handshake frame had the wrong size or could not be parsed.
    HandshakeMalformed,
    /// An AEAD tag or certificate signature failed verification.
    HandshakeAuth,
    /// The responder certificate is outside its validity window.
    HandshakeExpired {
        valid_from: u32,
        valid_to: u32,
        now: u32,
    },
    /// A raw 32-byte secret key did not parse as a valid key.
    InvalidRawPrivateKey,
    /// A raw 32-byte public key did not parse as a valid key.
    InvalidRawPublicKey,
    /// The certificate does not commit to the static key it was paired with.
    CertificateKeyMismatch,
    /// The send nonce reached its reserved maximum; the cipher must be
    /// rekeyed before further use.
    NonceExhausted,
}

pub type Result<T> = core::result::Result<T, Error>;

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::HandshakeMalformed => write!(f, "malformed handshake frame"),
            Error::HandshakeAuth => write!(f, "handshake authentication failed"),
            Error::HandshakeExpired {
                valid_from,
                valid_to,
                now,
            } => write!(
                f,
                "certificate outside validity window [{valid_from}, {valid_to}] at {now}"
            ),
            Error::InvalidRawPrivateKey => write!(f, "invalid raw private key"),
            Error::InvalidRawPublicKey => write!(f, "invalid raw public key"),
            Error::CertificateKeyMismatch => {
                write!(f, "certificate does not match the presented static key")
            }
            Error::NonceExhausted => write!(f, "cipher nonce exhausted"),
        }
    }
}

impl std::error::Error for Error {}

impl From<chacha20poly1305::aead::Error> for Error {
    fn from(_: chacha20poly1305::aead::Error) -> Self {
        Error::HandshakeAuth
    }
}
