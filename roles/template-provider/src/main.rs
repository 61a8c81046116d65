mod args;

use std::{process::ExitCode, sync::Arc, time::Duration};

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use template_provider_sv2::{
    config::ConfigError, error::TpError, mining::Mining, mock_mining::MockMining,
    TemplateProvider,
};

#[tokio::main]
async fn main() -> ExitCode {
    let args = args::Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(args.log_level.clone())),
        )
        .init();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            error!("{error}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: args::Args) -> Result<(), TpError> {
    let options = args::options_from_args(&args)?;

    let mining: Arc<dyn Mining> = match args.ipc_connect.as_str() {
        "mock" => {
            warn!(
                "Serving templates from the built-in mock chain; \
                 point --ipcconnect at a node for real templates"
            );
            let mock = MockMining::new();
            spawn_mock_chain(mock.clone(), options.fee_check_interval, options.fee_delta);
            mock
        }
        other => {
            return Err(ConfigError::UnsupportedBackend(other.to_string()).into());
        }
    };

    let mut provider = TemplateProvider::start(options, mining).await?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Interrupt received"),
        reason = provider.wait_fatal() => error!("Fatal: {reason}"),
    }

    provider.shutdown().await;
    Ok(())
}

// Keeps the mock chain alive: fee bumps every interval, a new block every
// few intervals, so connected clients see realistic template churn.
fn spawn_mock_chain(mock: Arc<MockMining>, interval: Duration, fee_delta: i64) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval.max(Duration::from_secs(1)));
        let mut ticks = 0u64;
        loop {
            ticker.tick().await;
            ticks += 1;
            if ticks % 4 == 0 {
                mock.trigger_new_tip();
            } else {
                mock.trigger_fee_increase(fee_delta * 2);
            }
        }
    });
}
