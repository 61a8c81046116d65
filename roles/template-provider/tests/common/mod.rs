//! Shared rig for the integration scenarios: a provider over a real loopback
//! socket, the mock node behind it, and a protocol-conformant client.

use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    time::timeout,
};

use template_provider_sv2::{
    coinbase,
    config::{Chain, TpOptions},
    mining::CoinbaseTemplate,
    mock_mining::MockMining,
    TemplateProvider,
};
use tp_codec::{
    common::{SetupConnection, PROTOCOL_TEMPLATE_DISTRIBUTION},
    parser::TpMessage,
    template_distribution::{CoinbaseOutputConstraints, NewTemplate, SetNewPrevHash},
    transport::{Incoming, Transport},
};
use tp_noise::{Initiator, HANDSHAKE_STEP2_SIZE};

pub struct Harness {
    pub provider: TemplateProvider,
    pub mock: Arc<MockMining>,
    #[allow(dead_code)]
    pub data_dir: PathBuf,
}

pub async fn start_provider(tag: &str) -> Harness {
    let data_dir = std::env::temp_dir().join(format!(
        "sv2-tp-test-{tag}-{}",
        std::process::id()
    ));
    std::fs::create_dir_all(&data_dir).unwrap();

    let options = TpOptions {
        chain: Chain::Regtest,
        host: "127.0.0.1".to_string(),
        port: 0,
        data_dir: data_dir.clone(),
        fee_check_interval: Duration::from_millis(100),
        fee_delta: 1000,
        handshake_timeout: Duration::from_millis(300),
        is_test: true,
        ..Default::default()
    };

    let mock = MockMining::new();
    let provider = TemplateProvider::start(options, mock.clone())
        .await
        .expect("provider starts");
    Harness {
        provider,
        mock,
        data_dir,
    }
}

pub struct TestClient {
    pub stream: TcpStream,
    transport: Transport,
    pending: Vec<TpMessage>,
}

impl TestClient {
    /// Full Noise handshake against a running provider.
    pub async fn connect(addr: SocketAddr, authority: [u8; 32]) -> Self {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let mut initiator = Initiator::new(Some(authority)).unwrap();
        let step_0 = initiator.step_0().unwrap();
        stream.write_all(&step_0).await.unwrap();

        let mut step_2 = [0u8; HANDSHAKE_STEP2_SIZE];
        stream.read_exact(&mut step_2).await.unwrap();
        let keys = initiator.step_2(step_2).unwrap();

        Self {
            stream,
            transport: Transport::new(keys),
            pending: Vec::new(),
        }
    }

    pub async fn send(&mut self, message: TpMessage) {
        self.transport.set_message_to_send(&message).unwrap();
        let bytes = self.transport.bytes_to_send();
        self.stream.write_all(&bytes).await.unwrap();
    }

    /// Next decoded message, or `None` after `wait` with nothing complete.
    pub async fn recv(&mut self, wait: Duration) -> Option<TpMessage> {
        if !self.pending.is_empty() {
            return Some(self.pending.remove(0));
        }
        let deadline = tokio::time::Instant::now() + wait;
        let mut buf = [0u8; 4096];
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let n = match timeout(remaining, self.stream.read(&mut buf)).await {
                Ok(Ok(0)) | Ok(Err(_)) | Err(_) => return None,
                Ok(Ok(n)) => n,
            };
            for item in self.transport.received_bytes(&buf[..n]).unwrap() {
                if let Incoming::Message(message) = item {
                    self.pending.push(message);
                }
            }
            if !self.pending.is_empty() {
                return Some(self.pending.remove(0));
            }
        }
    }

    pub async fn expect(&mut self, wait: Duration) -> TpMessage {
        self.recv(wait).await.expect("expected a message in time")
    }

    pub fn setup_connection() -> TpMessage {
        TpMessage::SetupConnection(SetupConnection {
            protocol: PROTOCOL_TEMPLATE_DISTRIBUTION,
            min_version: 2,
            max_version: 2,
            flags: 0,
            endpoint_host: "127.0.0.1".try_into().unwrap(),
            endpoint_port: 8442,
            vendor: "test-rig".try_into().unwrap(),
            hardware_version: "v1".try_into().unwrap(),
            firmware: "fw-0".try_into().unwrap(),
            device_id: "".try_into().unwrap(),
        })
    }

    pub fn constraints(max_additional_size: u32, max_sigops: u16) -> TpMessage {
        TpMessage::CoinbaseOutputConstraints(CoinbaseOutputConstraints {
            coinbase_output_max_additional_size: max_additional_size,
            coinbase_output_max_sigops: max_sigops,
        })
    }
}

/// Runs setup and constraint declaration, returning the first template pair.
pub async fn into_streaming(harness: &Harness) -> (TestClient, NewTemplate, SetNewPrevHash) {
    let mut client = TestClient::connect(
        harness.provider.local_addr(),
        harness.provider.authority_public(),
    )
    .await;

    client.send(TestClient::setup_connection()).await;
    match client.expect(Duration::from_secs(2)).await {
        TpMessage::SetupConnectionSuccess(success) => {
            assert_eq!(success.used_version, 2);
            assert_eq!(success.flags, 0);
        }
        other => panic!("expected SetupConnection.Success, got {other:?}"),
    }

    client.send(TestClient::constraints(1, 0)).await;
    let new_template = match client.expect(Duration::from_secs(2)).await {
        TpMessage::NewTemplate(m) => m,
        other => panic!("expected NewTemplate, got {other:?}"),
    };
    let prev_hash = match client.expect(Duration::from_secs(2)).await {
        TpMessage::SetNewPrevHash(m) => m,
        other => panic!("expected SetNewPrevHash, got {other:?}"),
    };
    (client, new_template, prev_hash)
}

/// Rebuilds the coinbase skeleton a `NewTemplate` describes and completes it
/// the way a mining client would.
pub fn coinbase_for(template: &NewTemplate, extra_script: &[u8]) -> Vec<u8> {
    let skeleton = CoinbaseTemplate {
        version: template.coinbase_tx_version,
        input_sequence: template.coinbase_tx_input_sequence,
        script_sig_prefix: template.coinbase_prefix.as_bytes().to_vec(),
        witness_reserved: Some([0u8; 32]),
        value_remaining: template.coinbase_tx_value_remaining,
        required_outputs: template.coinbase_tx_outputs.as_bytes().to_vec(),
        required_outputs_count: template.coinbase_tx_outputs_count,
        lock_time: template.coinbase_tx_locktime,
    };
    coinbase::build_for_template(&skeleton, extra_script, &[0x51])
}
