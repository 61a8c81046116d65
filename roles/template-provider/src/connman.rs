//! Connection manager.
//!
//! One listener task accepts sockets; each connection gets a receive task
//! (this module's `handle_connection`) and a send task draining the peer's
//! bounded outbound queue. The receive task runs the Noise handshake under a
//! deadline, then drives the per-peer state machine:
//! `Setup → ConstrainedWait → Streaming`.

use std::{sync::Arc, time::Duration};

use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpListener,
    sync::{watch, Mutex as AsyncMutex},
    time::timeout,
};
use tracing::{debug, error, info, warn};

use tp_codec::{
    common::{
        SetupConnection, SetupConnectionError, SetupConnectionSuccess,
        ERROR_CODE_PROTOCOL_VERSION_MISMATCH, ERROR_CODE_UNEXPECTED_MESSAGE,
        ERROR_CODE_UNSUPPORTED_PROTOCOL, PROTOCOL_TEMPLATE_DISTRIBUTION, SUPPORTED_VERSION,
    },
    parser::TpMessage,
    transport::{Incoming, Transport},
};
use tp_noise::{Certificate, Responder, HANDSHAKE_STEP1_SIZE};

use crate::{
    config::TpOptions,
    engine::EngineEvent,
    error::{TpError, TpResult},
    session::{ClientSession, PeerId, PeerMap, Phase, SharedSession},
    status::{self, State, Stats, Status},
    utils::Mutex,
};

/// Shared dependencies of every connection task.
pub struct ConnCtx {
    pub options: TpOptions,
    pub static_secret: [u8; 32],
    pub certificate: Certificate,
    pub peers: Arc<PeerMap>,
    pub engine_tx: async_channel::Sender<EngineEvent>,
    pub stats: Arc<Stats>,
    pub shutdown: watch::Receiver<bool>,
}

pub async fn accept_loop(listener: TcpListener, ctx: Arc<ConnCtx>, status_tx: status::Sender) {
    let mut next_peer_id: PeerId = 1;
    let mut shutdown = ctx.shutdown.clone();
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, address)) => {
                    let id = next_peer_id;
                    next_peer_id += 1;
                    debug!("New connection from {address}, client id={id}");
                    let ctx = ctx.clone();
                    let status_tx = status_tx.listener_to_peer();
                    tokio::spawn(async move {
                        let reason = match handle_connection(stream, id, ctx).await {
                            Ok(()) => "disconnected".to_string(),
                            Err(error) => error.to_string(),
                        };
                        let _ = status_tx
                            .send(Status {
                                state: State::PeerShutdown { peer: id, reason },
                            })
                            .await;
                    });
                }
                Err(error) => error!("Failed to accept connection: {error}"),
            }
        }
    }
    debug!("Listener stopped");
}

/// Runs one peer from handshake to disconnect. Generic over the stream so
/// tests can drive in-memory pipes.
pub async fn handle_connection<S>(stream: S, id: PeerId, ctx: Arc<ConnCtx>) -> TpResult<()>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (mut reader, mut writer) = tokio::io::split(stream);

    // Nothing is written until the full 32-byte ephemeral arrived; a failed
    // or overdue handshake closes the socket with no reply.
    let handshake = async {
        let mut step_1 = [0u8; HANDSHAKE_STEP1_SIZE];
        reader.read_exact(&mut step_1).await?;
        let mut responder = Responder::new(ctx.static_secret, ctx.certificate.clone())?;
        let (step_2, keys) = responder.step_1(step_1)?;
        writer.write_all(&step_2).await?;
        writer.flush().await?;
        Ok::<_, TpError>(keys)
    };
    let keys = match timeout(ctx.options.handshake_timeout, handshake).await {
        Ok(Ok(keys)) => keys,
        Ok(Err(error)) => {
            Stats::bump(&ctx.stats.handshake_failed);
            debug!("Handshake with client id={id} failed: {error}");
            return Err(error);
        }
        Err(_) => {
            Stats::bump(&ctx.stats.handshake_failed);
            debug!("Handshake with client id={id} timed out");
            return Err(TpError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "handshake timeout",
            )));
        }
    };

    let transport = Arc::new(AsyncMutex::new(Transport::with_byte_ceiling(
        keys,
        ctx.options.rekey_byte_ceiling,
    )));
    let (out_tx, out_rx) = async_channel::bounded(ctx.options.outbound_queue_limit);
    let session: SharedSession = Arc::new(Mutex::new(ClientSession::new(id, out_tx.clone())));
    ctx.peers.insert(id, session.clone())?;
    Stats::bump(&ctx.stats.peers_connected);
    info!("Client id={id} connected");

    let send_task = tokio::spawn(send_loop(
        out_rx,
        transport.clone(),
        writer,
        ctx.shutdown.clone(),
    ));

    let result = receive_loop(&mut reader, id, &session, &transport, &ctx).await;

    session.safe_lock(|s| s.phase = Phase::Closed)?;
    ctx.peers.remove(id)?;
    let _ = ctx.engine_tx.try_send(EngineEvent::PeerGone(id));
    out_tx.close();
    let _ = timeout(Duration::from_secs(1), send_task).await;
    Stats::bump(&ctx.stats.peers_disconnected);
    info!("Client id={id} disconnected");
    result
}

async fn receive_loop<R>(
    reader: &mut R,
    id: PeerId,
    session: &SharedSession,
    transport: &Arc<AsyncMutex<Transport>>,
    ctx: &Arc<ConnCtx>,
) -> TpResult<()>
where
    R: AsyncRead + Unpin,
{
    let mut shutdown = ctx.shutdown.clone();
    let mut buf = vec![0u8; 8192];
    loop {
        let read = tokio::select! {
            _ = shutdown.changed() => return Ok(()),
            read = reader.read(&mut buf) => read,
        };
        let n = match read {
            Ok(0) => return Ok(()),
            Ok(n) => n,
            Err(error) => return Err(TpError::Io(error)),
        };

        let incoming = {
            let mut transport = transport.lock().await;
            transport.received_bytes(&buf[..n])
        };
        let items = match incoming {
            Ok(items) => items,
            Err(error) => {
                // Oversized record or failed decryption: protocol violation
                // or key desync. Close with no reply.
                debug!("Fatal transport error for client id={id}: {error}");
                return Err(TpError::Codec(error));
            }
        };
        for item in items {
            match item {
                Incoming::Unknown { msg_type, length } => {
                    debug!(
                        "Discarding unknown message type 0x{msg_type:02x} ({length} bytes) from client id={id}"
                    );
                }
                Incoming::Message(message) => {
                    if dispatch(id, session, message, ctx).await? == Flow::Close {
                        return Ok(());
                    }
                }
            }
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Close,
}

async fn dispatch(
    id: PeerId,
    session: &SharedSession,
    message: TpMessage,
    ctx: &Arc<ConnCtx>,
) -> TpResult<Flow> {
    let phase = session.safe_lock(|s| s.phase)?;
    match (phase, message) {
        (Phase::Setup, TpMessage::SetupConnection(setup)) => {
            handle_setup(id, session, setup).await
        }
        (Phase::ConstrainedWait, TpMessage::CoinbaseOutputConstraints(constraints)) => {
            debug!(
                "Received 0x70 CoinbaseOutputConstraints (max_additional_size={}, max_sigops={}) from client id={id}",
                constraints.coinbase_output_max_additional_size,
                constraints.coinbase_output_max_sigops
            );
            session.safe_lock(|s| {
                s.constraints = Some(constraints);
                s.phase = Phase::Streaming;
            })?;
            ctx.engine_tx
                .send(EngineEvent::PeerStreaming(id))
                .await
                .map_err(|_| TpError::ChannelClosed)?;
            Ok(Flow::Continue)
        }
        (Phase::Streaming, TpMessage::CoinbaseOutputConstraints(constraints)) => {
            // A client may revise its reservation mid-stream.
            debug!(
                "Client id={id} revised coinbase constraints (max_additional_size={})",
                constraints.coinbase_output_max_additional_size
            );
            session.safe_lock(|s| s.constraints = Some(constraints))?;
            ctx.engine_tx
                .send(EngineEvent::PeerStreaming(id))
                .await
                .map_err(|_| TpError::ChannelClosed)?;
            Ok(Flow::Continue)
        }
        (Phase::Streaming, TpMessage::SubmitSolution(solution)) => {
            debug!(
                "Received 0x76 SubmitSolution for template id={} from client id={id}",
                solution.template_id
            );
            ctx.engine_tx
                .send(EngineEvent::Solution { peer: id, solution })
                .await
                .map_err(|_| TpError::ChannelClosed)?;
            Ok(Flow::Continue)
        }
        (Phase::Streaming, TpMessage::RequestTransactionData(request)) => {
            debug!(
                "Received 0x73 RequestTransactionData for template id={} from client id={id}",
                request.template_id
            );
            ctx.engine_tx
                .send(EngineEvent::TxDataRequest {
                    peer: id,
                    template_id: request.template_id,
                })
                .await
                .map_err(|_| TpError::ChannelClosed)?;
            Ok(Flow::Continue)
        }
        (phase, message) => {
            warn!(
                "Protocol violation from client id={id}: message type 0x{:02x} in phase {phase:?}",
                message.message_type()
            );
            // Before streaming the peer still gets told why; afterwards the
            // connection just closes.
            if phase < Phase::Streaming {
                send_setup_error(session, 0, ERROR_CODE_UNEXPECTED_MESSAGE).await?;
            }
            Ok(Flow::Close)
        }
    }
}

async fn handle_setup(
    id: PeerId,
    session: &SharedSession,
    setup: SetupConnection,
) -> TpResult<Flow> {
    debug!(
        "Received 0x00 SetupConnection: protocol={} min_version={} max_version={} flags=0x{:08x} from client id={id}",
        setup.protocol, setup.min_version, setup.max_version, setup.flags
    );

    if setup.protocol != PROTOCOL_TEMPLATE_DISTRIBUTION {
        info!(
            "Rejecting client id={id}: unsupported protocol {}",
            setup.protocol
        );
        send_setup_error(session, setup.flags, ERROR_CODE_UNSUPPORTED_PROTOCOL).await?;
        return Ok(Flow::Close);
    }
    if setup.min_version > SUPPORTED_VERSION || setup.max_version < SUPPORTED_VERSION {
        info!(
            "Rejecting client id={id}: version window [{}, {}] excludes {SUPPORTED_VERSION}",
            setup.min_version, setup.max_version
        );
        send_setup_error(session, setup.flags, ERROR_CODE_PROTOCOL_VERSION_MISMATCH).await?;
        return Ok(Flow::Close);
    }

    // Flags are advisory for this sub-protocol; remembered, never rejected.
    session.safe_lock(|s| {
        s.used_version = SUPPORTED_VERSION;
        s.flags = setup.flags;
        s.phase = Phase::ConstrainedWait;
    })?;
    queue_message(
        session,
        TpMessage::SetupConnectionSuccess(SetupConnectionSuccess {
            used_version: SUPPORTED_VERSION,
            flags: 0,
        }),
    )
    .await?;
    debug!("Send 0x01 SetupConnection.Success to client id={id}");
    Ok(Flow::Continue)
}

async fn send_setup_error(session: &SharedSession, flags: u32, code: &str) -> TpResult<()> {
    let message = TpMessage::SetupConnectionError(SetupConnectionError {
        flags,
        error_code: code.try_into().map_err(TpError::Codec)?,
    });
    queue_message(session, message).await
}

async fn queue_message(session: &SharedSession, message: TpMessage) -> TpResult<()> {
    let outbound = session.safe_lock(|s| s.outbound.clone())?;
    outbound
        .send(vec![message])
        .await
        .map_err(|_| TpError::ChannelClosed)
}

/// Drains the peer's outbound queue through the transport onto the socket.
/// Each batch is framed in one go, so a template pair hits the wire intact.
async fn send_loop<W>(
    out_rx: async_channel::Receiver<Vec<TpMessage>>,
    transport: Arc<AsyncMutex<Transport>>,
    mut writer: W,
    mut shutdown: watch::Receiver<bool>,
) where
    W: AsyncWrite + Send + Unpin,
{
    loop {
        let batch = tokio::select! {
            _ = shutdown.changed() => break,
            batch = out_rx.recv() => match batch {
                Ok(batch) => batch,
                Err(_) => break,
            },
        };
        let bytes = {
            let mut transport = transport.lock().await;
            let mut failed = false;
            for message in &batch {
                if let Err(error) = transport.set_message_to_send(message) {
                    error!("Failed to frame outbound message: {error}");
                    failed = true;
                    break;
                }
            }
            if failed {
                break;
            }
            transport.bytes_to_send()
        };
        if writer.write_all(&bytes).await.is_err() {
            break;
        }
        if writer.flush().await.is_err() {
            break;
        }
    }
    let _ = writer.shutdown().await;
}
