//! session-gate/src/connection.rs
//! Core connection handling logic.

use crate::{
    admission::{AdmissionGate, PlayerConnection},
    error::{CredentialError, ProtocolError},
    protocol::{self, NEXT_STATE_LOGIN, NEXT_STATE_STATUS, NEXT_STATE_TRANSFER, RawPacket},
    types::{GateOptions, HandshakeData},
};
use ppp::v2;
use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};
use tokio::{
    io::AsyncWriteExt,
    net::{
        TcpListener, TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub type ConnectionId = u64;

/// First protocol version (1.20.5) whose clients answer cookie requests.
const COOKIE_MIN_PROTOCOL: i32 = 766;

/// Accepts players until `shutdown` fires, one task per connection.
pub async fn serve(
    listener: TcpListener,
    gate: AdmissionGate,
    options: Arc<GateOptions>,
    shutdown: CancellationToken,
) {
    let counter = AtomicU64::new(1);
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((inbound, peer)) => {
                let conn_id = counter.fetch_add(1, Ordering::Relaxed);
                debug!(conn = conn_id, %peer, "Accepted connection");
                tokio::spawn(handle_conn(
                    conn_id,
                    inbound,
                    gate.clone(),
                    options.clone(),
                    shutdown.child_token(),
                ));
            }
            Err(e) => {
                error!("Accept error: {}", e);
            }
        }
    }
    info!("Listener stopped");
}

/// Main connection workflow
pub async fn handle_conn(
    conn_id: ConnectionId,
    mut inbound: TcpStream,
    gate: AdmissionGate,
    options: Arc<GateOptions>,
    context: CancellationToken,
) {
    let _guard = context.clone().drop_guard();

    let read_timeout = options.credential_timeout();
    let handshake = tokio::select! {
        _ = context.cancelled() => return,
        packet = tokio::time::timeout(read_timeout, read_handshake(&mut inbound)) => packet,
    };
    let (hs, hs_packet) = match handshake {
        Ok(Ok(h)) => h,
        Ok(Err(e)) => {
            debug!(conn = conn_id, "Handshake failed: {}", e);
            return;
        }
        Err(_) => {
            debug!(conn = conn_id, "No handshake within {:?}", read_timeout);
            return;
        }
    };

    match hs.next_state {
        NEXT_STATE_STATUS => {
            let outbound = match connect_backend(conn_id, &options).await {
                Some(s) => s,
                None => return,
            };
            proxy(conn_id, inbound, outbound, &[hs_packet.raw], &context).await;
        }
        NEXT_STATE_LOGIN | NEXT_STATE_TRANSFER => {
            let login_packet = tokio::select! {
                _ = context.cancelled() => return,
                packet = tokio::time::timeout(read_timeout, protocol::read_packet(&mut inbound)) => packet,
            };
            let login_packet = match login_packet {
                Ok(Ok(p)) => p,
                Ok(Err(e)) => {
                    warn!(conn = conn_id, "Login failed: {}", e);
                    return;
                }
                Err(_) => {
                    debug!(conn = conn_id, "No login start within {:?}", read_timeout);
                    return;
                }
            };
            let username = match protocol::parse_login_start(&login_packet).await {
                Ok(name) => name,
                Err(e) => {
                    warn!(conn = conn_id, "Login failed: {}", e);
                    return;
                }
            };
            info!(
                conn = conn_id,
                %username,
                host = %hs.host,
                protocol = hs.protocol_version,
                "Player connecting"
            );

            let mut player =
                LoginConnection::new(inbound, username, hs.protocol_version, context.clone());
            if gate.admit(&mut player).await.is_err() {
                return;
            }
            let username = player.username.clone();
            let inbound = match player.into_stream().await {
                Ok(s) => s,
                Err(e) => {
                    warn!(
                        conn = conn_id,
                        %username,
                        "Player connection lost after admission: {}", e
                    );
                    return;
                }
            };
            let mut outbound = match connect_backend(conn_id, &options).await {
                Some(s) => s,
                None => {
                    let mut inbound = inbound;
                    let _ = protocol::write_disconnect(
                        &mut inbound,
                        "Could not connect to the destination server.",
                    )
                    .await;
                    return;
                }
            };
            if options.proxy_protocol {
                if let Err(e) = write_proxy_header(&inbound, &mut outbound).await {
                    error!(conn = conn_id, "Failed to write PROXY protocol header: {}", e);
                    return;
                }
            }
            info!(conn = conn_id, %username, "Player admitted");
            proxy(
                conn_id,
                inbound,
                outbound,
                &[hs_packet.raw, login_packet.raw],
                &context,
            )
            .await;
        }
        other => {
            debug!(conn = conn_id, next_state = other, "Unsupported next state");
        }
    }
}

async fn read_handshake(
    inbound: &mut TcpStream,
) -> Result<(HandshakeData, RawPacket), ProtocolError> {
    let packet = protocol::read_packet(inbound).await?;
    let hs = protocol::parse_handshake(&packet).await?;
    Ok((hs, packet))
}

async fn connect_backend(conn_id: ConnectionId, options: &GateOptions) -> Option<TcpStream> {
    let backend = options.backend_addr();
    match tokio::time::timeout(options.probe_timeout(), TcpStream::connect(&backend)).await {
        Ok(Ok(stream)) => Some(stream),
        Ok(Err(e)) => {
            error!(conn = conn_id, %backend, "Failed to connect to backend: {}", e);
            None
        }
        Err(_) => {
            error!(conn = conn_id, %backend, "Timed out connecting to backend");
            None
        }
    }
}

fn proxy_header(client: SocketAddr, local: SocketAddr) -> std::io::Result<Vec<u8>> {
    v2::Builder::with_addresses(
        v2::Version::Two | v2::Command::Proxy,
        v2::Protocol::Stream,
        (client, local),
    )
    .build()
}

async fn write_proxy_header(inbound: &TcpStream, outbound: &mut TcpStream) -> std::io::Result<()> {
    let header = proxy_header(inbound.peer_addr()?, inbound.local_addr()?)?;
    outbound.write_all(&header).await
}

/// Replays the already consumed packets to the backend, then pipes both ways.
async fn proxy(
    conn_id: ConnectionId,
    mut inbound: TcpStream,
    mut outbound: TcpStream,
    replay: &[Vec<u8>],
    context: &CancellationToken,
) {
    for packet in replay {
        if let Err(e) = outbound.write_all(packet).await {
            error!(conn = conn_id, "Failed to replay packet to backend: {}", e);
            return;
        }
    }
    tokio::select! {
        _ = context.cancelled() => {
            debug!(conn = conn_id, "Connection cancelled");
        }
        result = tokio::io::copy_bidirectional(&mut inbound, &mut outbound) => match result {
            Ok((sent, recv)) => info!(conn = conn_id, sent, recv, "Connection closed"),
            Err(e) => debug!(conn = conn_id, "Connection proxy ended: {}", e),
        },
    }
}

fn fetch_error(e: impl std::fmt::Display) -> CredentialError {
    CredentialError::Fetch(e.to_string())
}

/// A player sitting in the login phase, as seen by the admission gate.
struct LoginConnection {
    username: String,
    protocol_version: i32,
    context: CancellationToken,
    reader: Option<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    watcher: Option<(CancellationToken, JoinHandle<OwnedReadHalf>)>,
}

impl LoginConnection {
    fn new(
        stream: TcpStream,
        username: String,
        protocol_version: i32,
        context: CancellationToken,
    ) -> Self {
        let (reader, writer) = stream.into_split();
        Self {
            username,
            protocol_version,
            context,
            reader: Some(reader),
            writer,
            watcher: None,
        }
    }

    /// Cancels the context if the client hangs up while the gate holds it.
    /// The client sends nothing during this phase, so EOF is the only signal.
    fn watch_disconnect(&mut self) {
        let Some(mut reader) = self.reader.take() else {
            return;
        };
        let stop = CancellationToken::new();
        let context = self.context.clone();
        let stopped = stop.clone();
        let handle = tokio::spawn(async move {
            let mut buf = [0u8; 1];
            tokio::select! {
                _ = stopped.cancelled() => {}
                _ = context.cancelled() => {}
                peeked = reader.peek(&mut buf) => {
                    if matches!(peeked, Ok(0) | Err(_)) {
                        context.cancel();
                    }
                }
            }
            reader
        });
        self.watcher = Some((stop, handle));
    }

    async fn into_stream(mut self) -> std::io::Result<TcpStream> {
        let reader = match (self.reader.take(), self.watcher.take()) {
            (Some(reader), _) => reader,
            (None, Some((stop, handle))) => {
                stop.cancel();
                handle.await.map_err(std::io::Error::other)?
            }
            (None, None) => {
                return Err(std::io::Error::other("read half missing"));
            }
        };
        if self.context.is_cancelled() {
            return Err(std::io::ErrorKind::ConnectionAborted.into());
        }
        reader.reunite(self.writer).map_err(std::io::Error::other)
    }
}

impl PlayerConnection for LoginConnection {
    fn username(&self) -> &str {
        &self.username
    }

    fn context(&self) -> &CancellationToken {
        &self.context
    }

    async fn fetch_credential(&mut self, key: &str) -> Result<Option<Vec<u8>>, CredentialError> {
        if self.protocol_version < COOKIE_MIN_PROTOCOL {
            return Err(CredentialError::Fetch(format!(
                "client protocol {} predates cookies",
                self.protocol_version
            )));
        }
        let reader = self
            .reader
            .as_mut()
            .ok_or_else(|| fetch_error("credential already fetched"))?;
        self.writer
            .write_all(&protocol::create_cookie_request_packet(key))
            .await
            .map_err(fetch_error)?;
        let packet = protocol::read_packet(reader).await.map_err(fetch_error)?;
        let cookie = protocol::parse_cookie_response(&packet, key)
            .await
            .map_err(fetch_error)?;
        self.watch_disconnect();
        Ok(cookie)
    }

    async fn reject(&mut self, message: &str) {
        if let Err(e) = protocol::write_disconnect(&mut self.writer, message).await {
            debug!(username = %self.username, "Failed to send disconnect: {}", e);
        }
        self.context.cancel();
    }
}
