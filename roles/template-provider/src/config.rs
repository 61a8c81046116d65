//! Runtime options for the Template Provider.

use core::fmt;
use std::{path::PathBuf, time::Duration};

/// Networks the provider can serve, with their default Stratum v2 ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Chain {
    Mainnet,
    Testnet,
    Testnet4,
    Signet,
    Regtest,
}

impl Chain {
    pub fn default_sv2_port(&self) -> u16 {
        match self {
            Chain::Mainnet => 8442,
            Chain::Testnet => 18442,
            Chain::Testnet4 => 48442,
            Chain::Signet => 38442,
            Chain::Regtest => 28442,
        }
    }
}

impl core::str::FromStr for Chain {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, ConfigError> {
        match value {
            "main" | "mainnet" => Ok(Chain::Mainnet),
            "test" | "testnet" | "testnet3" => Ok(Chain::Testnet),
            "testnet4" => Ok(Chain::Testnet4),
            "signet" => Ok(Chain::Signet),
            "regtest" => Ok(Chain::Regtest),
            other => Err(ConfigError::UnknownChain(other.to_string())),
        }
    }
}

/// Everything the provider needs to run; defaults mirror the wrapper's CLI
/// defaults.
#[derive(Debug, Clone)]
pub struct TpOptions {
    pub chain: Chain,
    /// Address to bind the listener to.
    pub host: String,
    pub port: u16,
    /// Directory holding the persisted key material.
    pub data_dir: PathBuf,
    /// How often fee improvements are checked.
    pub fee_check_interval: Duration,
    /// Minimum fee improvement, in satoshis, before a template update is
    /// pushed on an unchanged tip.
    pub fee_delta: i64,
    /// Plaintext bytes per transport key before a silent rekey.
    pub rekey_byte_ceiling: u64,
    /// Time a peer gets to complete the Noise handshake.
    pub handshake_timeout: Duration,
    /// Bound of each peer's outbound message queue.
    pub outbound_queue_limit: usize,
    /// First retry delay after the node becomes unavailable.
    pub node_retry_initial: Duration,
    /// Retry delay cap.
    pub node_retry_cap: Duration,
    /// Give up and shut down after the node has been unavailable this long.
    pub node_give_up: Duration,
    /// How long shutdown waits for in-flight work to drain.
    pub shutdown_grace: Duration,
    /// Shortens waits so tests run quickly.
    pub is_test: bool,
}

impl Default for TpOptions {
    fn default() -> Self {
        let chain = Chain::Mainnet;
        Self {
            chain,
            host: "127.0.0.1".to_string(),
            port: chain.default_sv2_port(),
            data_dir: PathBuf::from("."),
            fee_check_interval: Duration::from_secs(30),
            fee_delta: 1000,
            rekey_byte_ceiling: tp_noise::DEFAULT_REKEY_BYTE_CEILING,
            handshake_timeout: Duration::from_secs(10),
            outbound_queue_limit: 64,
            node_retry_initial: Duration::from_secs(1),
            node_retry_cap: Duration::from_secs(60),
            node_give_up: Duration::from_secs(600),
            shutdown_grace: Duration::from_secs(5),
            is_test: false,
        }
    }
}

impl TpOptions {
    /// Validates option combinations the wrapper cannot express as types.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.fee_check_interval < Duration::from_secs(1) && !self.is_test {
            return Err(ConfigError::IntervalTooShort);
        }
        if self.fee_delta < 0 {
            return Err(ConfigError::NegativeFeeDelta(self.fee_delta));
        }
        if self.outbound_queue_limit == 0 {
            return Err(ConfigError::EmptyQueueLimit);
        }
        Ok(())
    }
}

/// Unusable option; fatal at startup.
#[derive(Debug)]
pub enum ConfigError {
    IntervalTooShort,
    NegativeFeeDelta(i64),
    EmptyQueueLimit,
    UnknownChain(String),
    InvalidBind(String),
    UnsupportedBackend(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::IntervalTooShort => {
                write!(f, "-sv2interval must be at least one second")
            }
            ConfigError::NegativeFeeDelta(delta) => {
                write!(f, "-sv2feedelta must not be negative, got {delta}")
            }
            ConfigError::EmptyQueueLimit => write!(f, "outbound queue limit must be nonzero"),
            ConfigError::UnknownChain(chain) => write!(f, "unknown chain \"{chain}\""),
            ConfigError::InvalidBind(bind) => write!(f, "invalid -sv2bind value \"{bind}\""),
            ConfigError::UnsupportedBackend(backend) => {
                write!(
                    f,
                    "unsupported -ipcconnect value \"{backend}\"; this build only supports \"mock\""
                )
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_validate() {
        TpOptions::default().validate().unwrap();
    }

    #[test]
    fn sub_second_interval_rejected() {
        let options = TpOptions {
            fee_check_interval: Duration::from_millis(500),
            ..Default::default()
        };
        assert!(matches!(
            options.validate(),
            Err(ConfigError::IntervalTooShort)
        ));
    }

    #[test]
    fn test_mode_allows_fast_interval() {
        let options = TpOptions {
            fee_check_interval: Duration::from_millis(50),
            is_test: true,
            ..Default::default()
        };
        options.validate().unwrap();
    }

    #[test]
    fn chain_ports() {
        assert_eq!(Chain::Mainnet.default_sv2_port(), 8442);
        assert_eq!("signet".parse::<Chain>().unwrap(), Chain::Signet);
        assert!("florin".parse::<Chain>().is_err());
    }
}
