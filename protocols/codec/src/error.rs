use core::fmt;

/// Errors raised while encoding, decoding, or transporting Sv2 messages.
#[derive(Debug, PartialEq, Eq)]
pub enum Error {
    /// Input ended before a field was complete.
    TruncatedField {
        expected: usize,
        remaining: usize,
    },
    /// A length prefix or payload exceeds its type bound.
    LengthOverflow(usize),
    /// An enum discriminant had no defined variant.
    UnknownEnum(u8),
    /// A message type byte with no mapping for this protocol. The message is
    /// dropped and the connection kept.
    UnknownMessageType(u8),
    /// A record advertised a length above the 65535-byte maximum.
    FrameTooLarge(usize),
    /// AEAD authentication failed on a transport record. Fatal: indicates
    /// tampering or key desynchronization.
    DecryptFailure,
    /// An outbound message cannot be represented (payload above 2^24-1).
    MessageTooLarge(usize),
    /// Trailing bytes after a fully decoded message payload.
    TrailingBytes(usize),
}

pub type Result<T> = core::result::Result<T, Error>;

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::TruncatedField {
                expected,
                remaining,
            } => write!(
                f,
                "truncated field: expected {expected} bytes, {remaining} remaining"
            ),
            Error::LengthOverflow(len) => write!(f, "length {len} exceeds type bound"),
            Error::UnknownEnum(value) => write!(f, "unknown enum discriminant {value}"),
            Error::UnknownMessageType(msg_type) => {
                write!(f, "unknown message type 0x{msg_type:02x}")
            }
            Error::FrameTooLarge(len) => write!(f, "record length {len} exceeds maximum"),
            Error::DecryptFailure => write!(f, "record decryption failed"),
            Error::MessageTooLarge(len) => write!(f, "message length {len} exceeds u24"),
            Error::TrailingBytes(len) => write!(f, "{len} trailing bytes after message"),
        }
    }
}

impl std::error::Error for Error {}

impl From<tp_noise::Error> for Error {
    fn from(_: tp_noise::Error) -> Self {
        Error::DecryptFailure
    }
}
