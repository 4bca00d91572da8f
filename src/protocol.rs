//! session-gate/src/protocol.rs
//! Minecraft protocol parsing and serialization utilities

use crate::{error::ProtocolError, types::HandshakeData};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Protocol version sent in status probes. Servers answer status requests for
/// any version, so this only has to be plausible.
pub const PROBE_PROTOCOL_VERSION: i32 = 760;

/// 256 KiB, a generous limit for a single packet string.
pub const MAX_STRING_LEN: usize = 262_144;
/// Largest length a 3-byte VarInt frame prefix can carry.
pub const MAX_PACKET_LEN: usize = 2_097_151;
/// Cookie payloads are capped at 5 KiB by the client.
pub const MAX_COOKIE_LEN: usize = 5_120;

pub const NEXT_STATE_STATUS: i32 = 1;
pub const NEXT_STATE_LOGIN: i32 = 2;
pub const NEXT_STATE_TRANSFER: i32 = 3;

const HANDSHAKE_ID: i32 = 0x00;
const STATUS_REQUEST_ID: i32 = 0x00;
const LOGIN_START_ID: i32 = 0x00;
const LOGIN_DISCONNECT_ID: i32 = 0x00;
const COOKIE_REQUEST_ID: i32 = 0x05;
const COOKIE_RESPONSE_ID: i32 = 0x04;

/// Reads a VarInt (max 5 bytes) from the provided stream.
pub async fn read_varint<R>(stream: &mut R) -> Result<i32, ProtocolError>
where
    R: AsyncReadExt + Unpin,
{
    let mut num_read = 0;
    let mut result: u32 = 0;
    loop {
        if num_read == 5 {
            return Err(ProtocolError::VarIntTooBig);
        }
        let byte = stream.read_u8().await?;
        result |= ((byte & 0x7F) as u32) << (7 * num_read);
        num_read += 1;
        if (byte & 0x80) == 0 {
            break;
        }
    }
    Ok(result as i32)
}

/// Writes a VarInt to the buffer.
pub fn write_varint(buf: &mut Vec<u8>, mut value: i32) {
    loop {
        if (value & !0x7F) == 0 {
            buf.push(value as u8);
            return;
        }
        buf.push(((value & 0x7F) | 0x80) as u8);
        value = ((value as u32) >> 7) as i32;
    }
}

/// Reads a VarInt length prefix and rejects negative values.
async fn read_length<R>(stream: &mut R) -> Result<usize, ProtocolError>
where
    R: AsyncReadExt + Unpin,
{
    let len = read_varint(stream).await?;
    usize::try_from(len).map_err(|_| ProtocolError::NegativeLength(len))
}

/// Reads a length-prefixed UTF-8 string (VarInt length + bytes) from the stream.
pub async fn read_string<R>(stream: &mut R) -> Result<String, ProtocolError>
where
    R: AsyncReadExt + Unpin,
{
    let len = read_length(stream).await?;
    if len > MAX_STRING_LEN {
        return Err(ProtocolError::StringTooLong(len));
    }
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    Ok(String::from_utf8(buf)?)
}

/// Writes a length-prefixed UTF-8 string into the buffer.
pub fn write_string(buf: &mut Vec<u8>, s: &str) {
    let bytes = s.as_bytes();
    write_varint(buf, bytes.len() as i32);
    buf.extend_from_slice(bytes);
}

/// Prepends the VarInt length to a packet payload (id + fields).
pub fn frame(payload: &[u8]) -> Vec<u8> {
    let mut packet = Vec::with_capacity(payload.len() + 3);
    write_varint(&mut packet, payload.len() as i32);
    packet.extend_from_slice(payload);
    packet
}

/// One length-delimited packet as read off the wire.
#[derive(Debug, Clone)]
pub struct RawPacket {
    pub id: i32,
    /// Everything after the packet id.
    pub body: Vec<u8>,
    /// The complete frame including the length prefix, for forwarding as-is.
    pub raw: Vec<u8>,
}

impl RawPacket {
    fn expect_id(&self, expected: i32) -> Result<(), ProtocolError> {
        if self.id != expected {
            return Err(ProtocolError::UnexpectedPacket {
                expected,
                found: self.id,
            });
        }
        Ok(())
    }
}

/// Reads one uncompressed frame from the stream.
pub async fn read_packet<R>(stream: &mut R) -> Result<RawPacket, ProtocolError>
where
    R: AsyncReadExt + Unpin,
{
    let len = read_length(stream).await?;
    if len > MAX_PACKET_LEN {
        return Err(ProtocolError::PacketTooLong(len));
    }
    let mut data = vec![0u8; len];
    stream.read_exact(&mut data).await?;

    let mut cursor = data.as_slice();
    let id = read_varint(&mut cursor).await?;
    let body = cursor.to_vec();
    Ok(RawPacket {
        id,
        body,
        raw: frame(&data),
    })
}

pub fn create_handshake_packet(hs: &HandshakeData) -> Vec<u8> {
    let mut data = Vec::new();
    write_varint(&mut data, HANDSHAKE_ID);
    write_varint(&mut data, hs.protocol_version);
    write_string(&mut data, &hs.host);
    data.extend(&hs.port.to_be_bytes());
    write_varint(&mut data, hs.next_state);
    frame(&data)
}

pub fn create_status_request_packet() -> Vec<u8> {
    let mut data = Vec::new();
    write_varint(&mut data, STATUS_REQUEST_ID);
    frame(&data)
}

pub fn create_cookie_request_packet(key: &str) -> Vec<u8> {
    let mut data = Vec::new();
    write_varint(&mut data, COOKIE_REQUEST_ID);
    write_string(&mut data, key);
    frame(&data)
}

pub async fn parse_handshake(packet: &RawPacket) -> Result<HandshakeData, ProtocolError> {
    packet.expect_id(HANDSHAKE_ID)?;
    let mut cursor = packet.body.as_slice();
    let protocol_version = read_varint(&mut cursor).await?;
    let host = read_string(&mut cursor).await?;
    let port = cursor.read_u16().await?;
    let next_state = read_varint(&mut cursor).await?;
    Ok(HandshakeData {
        protocol_version,
        host,
        port,
        next_state,
    })
}

/// Returns the player name from a Login Start packet. Trailing fields
/// (player UUID on newer versions) are left in the raw frame untouched.
pub async fn parse_login_start(packet: &RawPacket) -> Result<String, ProtocolError> {
    packet.expect_id(LOGIN_START_ID)?;
    let mut cursor = packet.body.as_slice();
    read_string(&mut cursor).await
}

/// Parses a login-state Cookie Response. `None` means the client answered
/// but holds no cookie under that key.
pub async fn parse_cookie_response(
    packet: &RawPacket,
    expected_key: &str,
) -> Result<Option<Vec<u8>>, ProtocolError> {
    packet.expect_id(COOKIE_RESPONSE_ID)?;
    let mut cursor = packet.body.as_slice();
    let key = read_string(&mut cursor).await?;
    if key != expected_key {
        return Err(ProtocolError::UnexpectedCookieKey(key));
    }
    let has_payload = cursor.read_u8().await? != 0;
    if !has_payload {
        return Ok(None);
    }
    let len = read_length(&mut cursor).await?;
    if len > MAX_COOKIE_LEN {
        return Err(ProtocolError::StringTooLong(len));
    }
    let mut payload = vec![0u8; len];
    cursor.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

/// Sends a Login Disconnect packet with a red text component, then closes the stream.
pub async fn write_disconnect<S>(stream: &mut S, msg: &str) -> Result<(), ProtocolError>
where
    S: AsyncWriteExt + Unpin,
{
    let reason = serde_json::json!({ "text": msg, "color": "red" }).to_string();

    let mut payload = Vec::new();
    write_varint(&mut payload, LOGIN_DISCONNECT_ID);
    write_string(&mut payload, &reason);

    stream.write_all(&frame(&payload)).await?;
    let _ = stream.shutdown().await;
    Ok(())
}
