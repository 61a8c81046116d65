use core::fmt;

use crate::{config::ConfigError, mining::NodeError};

/// Role-level errors. Most close one peer; `Config` and a node outage past
/// its threshold end the process.
#[derive(Debug)]
pub enum TpError {
    Config(ConfigError),
    Io(std::io::Error),
    Noise(tp_noise::Error),
    Codec(tp_codec::Error),
    Node(NodeError),
    /// A persisted key file did not contain a usable secret.
    InvalidKeyFile,
    /// An inter-task channel closed while the receiver still needed it.
    ChannelClosed,
    PoisonLock(String),
    /// The monotonic template-id counter reached its ceiling.
    TemplateIdExhausted,
    Shutdown,
}

pub type TpResult<T> = Result<T, TpError>;

impl fmt::Display for TpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TpError::Config(e) => write!(f, "configuration error: {e}"),
            TpError::Io(e) => write!(f, "io error: {e}"),
            TpError::Noise(e) => write!(f, "noise error: {e}"),
            TpError::Codec(e) => write!(f, "codec error: {e}"),
            TpError::Node(e) => write!(f, "node error: {e}"),
            TpError::InvalidKeyFile => write!(f, "persisted key file is invalid"),
            TpError::ChannelClosed => write!(f, "channel closed"),
            TpError::PoisonLock(e) => write!(f, "poisoned lock: {e}"),
            TpError::TemplateIdExhausted => write!(f, "template id counter exhausted"),
            TpError::Shutdown => write!(f, "shutting down"),
        }
    }
}

impl std::error::Error for TpError {}

impl From<ConfigError> for TpError {
    fn from(e: ConfigError) -> Self {
        TpError::Config(e)
    }
}

impl From<std::io::Error> for TpError {
    fn from(e: std::io::Error) -> Self {
        TpError::Io(e)
    }
}

impl From<tp_noise::Error> for TpError {
    fn from(e: tp_noise::Error) -> Self {
        TpError::Noise(e)
    }
}

impl From<tp_codec::Error> for TpError {
    fn from(e: tp_codec::Error) -> Self {
        TpError::Codec(e)
    }
}

impl From<NodeError> for TpError {
    fn from(e: NodeError) -> Self {
        TpError::Node(e)
    }
}

impl<T> From<std::sync::PoisonError<T>> for TpError {
    fn from(e: std::sync::PoisonError<T>) -> Self {
        TpError::PoisonLock(e.to_string())
    }
}
