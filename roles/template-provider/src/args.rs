//! CLI argument parsing for the `sv2-tp` binary.

use std::{path::PathBuf, time::Duration};

use clap::Parser;

use template_provider_sv2::config::{Chain, ConfigError, TpOptions};

#[derive(Parser, Debug)]
#[command(
    name = "sv2-tp",
    about = "Stratum v2 Template Provider",
    long_about = "Serves Bitcoin block templates to Stratum v2 Template Distribution \
                  clients. The node is reached through the Mining interface; this build \
                  ships with the built-in \"mock\" backend for protocol testing."
)]
pub struct Args {
    /// Bind to the given address, [host]:port notation for IPv6.
    #[arg(long = "sv2bind", value_name = "addr[:port]")]
    pub sv2_bind: Option<String>,

    /// Listen for Stratum v2 connections on this port.
    #[arg(long = "sv2port", value_name = "port")]
    pub sv2_port: Option<u16>,

    /// Template update interval in seconds.
    #[arg(long = "sv2interval", value_name = "seconds")]
    pub sv2_interval: Option<u64>,

    /// Minimum fee delta in satoshis before an update is pushed.
    #[arg(long = "sv2feedelta", value_name = "sat")]
    pub sv2_fee_delta: Option<i64>,

    /// Node backend to connect to. Only "mock" is built in.
    #[arg(long = "ipcconnect", value_name = "address", default_value = "mock")]
    pub ipc_connect: String,

    /// Chain to serve: mainnet, testnet, testnet4, signet, regtest.
    #[arg(long = "chain", value_name = "chain", default_value = "mainnet")]
    pub chain: String,

    /// Directory for persisted keys.
    #[arg(long = "datadir", value_name = "dir", default_value = ".")]
    pub data_dir: PathBuf,

    /// Log filter, e.g. "debug" or "template_provider_sv2=trace".
    #[arg(long = "log-level", value_name = "filter", default_value = "info")]
    pub log_level: String,
}

/// Turns parsed flags into validated provider options.
pub fn options_from_args(args: &Args) -> Result<TpOptions, ConfigError> {
    let chain: Chain = args.chain.parse()?;
    let mut options = TpOptions {
        chain,
        port: chain.default_sv2_port(),
        data_dir: args.data_dir.clone(),
        ..Default::default()
    };

    if let Some(bind) = &args.sv2_bind {
        let (host, port) = split_bind(bind).ok_or_else(|| ConfigError::InvalidBind(bind.clone()))?;
        options.host = host;
        if let Some(port) = port {
            options.port = port;
        }
    }
    if let Some(port) = args.sv2_port {
        options.port = port;
    }
    if let Some(interval) = args.sv2_interval {
        options.fee_check_interval = Duration::from_secs(interval);
    }
    if let Some(fee_delta) = args.sv2_fee_delta {
        options.fee_delta = fee_delta;
    }

    options.validate()?;
    Ok(options)
}

// Accepts "host", "host:port", and "[v6]:port".
fn split_bind(bind: &str) -> Option<(String, Option<u16>)> {
    if bind.is_empty() {
        return None;
    }
    if let Some(rest) = bind.strip_prefix('[') {
        let (host, rest) = rest.split_once(']')?;
        return match rest.strip_prefix(':') {
            Some(port) => Some((host.to_string(), Some(port.parse().ok()?))),
            None if rest.is_empty() => Some((host.to_string(), None)),
            None => None,
        };
    }
    match bind.rsplit_once(':') {
        // A bare IPv6 address without brackets has more than one colon.
        Some((host, port)) if !host.contains(':') => {
            Some((host.to_string(), Some(port.parse().ok()?)))
        }
        Some(_) => Some((bind.to_string(), None)),
        None => Some((bind.to_string(), None)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_bind_variants() {
        assert_eq!(split_bind("127.0.0.1"), Some(("127.0.0.1".into(), None)));
        assert_eq!(
            split_bind("127.0.0.1:8442"),
            Some(("127.0.0.1".into(), Some(8442)))
        );
        assert_eq!(split_bind("[::1]:8442"), Some(("::1".into(), Some(8442))));
        assert_eq!(split_bind("::1"), Some(("::1".into(), None)));
        assert_eq!(split_bind(""), None);
        assert_eq!(split_bind("host:notaport"), None);
    }

    #[test]
    fn defaults_follow_chain() {
        let args = Args::parse_from(["sv2-tp", "--chain", "regtest"]);
        let options = options_from_args(&args).unwrap();
        assert_eq!(options.port, Chain::Regtest.default_sv2_port());
    }

    #[test]
    fn explicit_port_wins() {
        let args = Args::parse_from(["sv2-tp", "--sv2bind", "0.0.0.0:9000", "--sv2port", "9001"]);
        let options = options_from_args(&args).unwrap();
        assert_eq!(options.host, "0.0.0.0");
        assert_eq!(options.port, 9001);
    }

    #[test]
    fn zero_interval_rejected() {
        let args = Args::parse_from(["sv2-tp", "--sv2interval", "0"]);
        assert!(options_from_args(&args).is_err());
    }
}
