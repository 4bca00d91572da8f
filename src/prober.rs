//! session-gate/src/prober.rs
//! Backend liveness probe over the server list ping protocol.

use crate::{
    error::ProbeError,
    protocol::{self, NEXT_STATE_STATUS, PROBE_PROTOCOL_VERSION},
    types::{HandshakeData, StatusPayload},
};
use std::time::Duration;
use tokio::{io::AsyncWriteExt, net::TcpStream, time::Instant};

/// Result of one successful probe.
#[derive(Debug, Clone)]
pub struct ProbeReport {
    pub status: StatusPayload,
    /// Measured from dial start to the parsed response.
    pub latency: Duration,
}

/// Dials the backend, runs handshake + status request and parses the reply.
/// `timeout` bounds the whole exchange; the socket is dropped on every path.
pub async fn probe(host: &str, port: u16, timeout: Duration) -> Result<ProbeReport, ProbeError> {
    let start = Instant::now();
    let status = match tokio::time::timeout(timeout, exchange(host, port)).await {
        Ok(result) => result?,
        Err(_) => return Err(ProbeError::Timeout(timeout)),
    };
    Ok(ProbeReport {
        status,
        latency: start.elapsed(),
    })
}

async fn exchange(host: &str, port: u16) -> Result<StatusPayload, ProbeError> {
    let addr = format!("{}:{}", host, port);
    let mut stream = TcpStream::connect(&addr)
        .await
        .map_err(|source| ProbeError::Connect { addr, source })?;

    let handshake = protocol::create_handshake_packet(&HandshakeData {
        protocol_version: PROBE_PROTOCOL_VERSION,
        host: host.to_string(),
        port,
        next_state: NEXT_STATE_STATUS,
    });
    stream.write_all(&handshake).await?;
    stream.write_all(&protocol::create_status_request_packet()).await?;

    let _packet_len = protocol::read_varint(&mut stream).await?;
    let _packet_id = protocol::read_varint(&mut stream).await?;
    let json = protocol::read_string(&mut stream).await?;

    Ok(serde_json::from_str(&json)?)
}
