//! session-gate/src/error.rs
//! Error taxonomy for the wire codec, the prober, and the admission gate.

use std::time::Duration;

/// Malformed or truncated data on the status/login wire protocol.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("VarInt too big")]
    VarIntTooBig,

    #[error("negative length {0}")]
    NegativeLength(i32),

    #[error("string length {0} exceeds limit")]
    StringTooLong(usize),

    #[error("packet length {0} exceeds limit")]
    PacketTooLong(usize),

    #[error("string is not valid UTF-8")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    #[error("unexpected packet id {found:#04x}, expected {expected:#04x}")]
    UnexpectedPacket { expected: i32, found: i32 },

    #[error("cookie response for unexpected key {0}")]
    UnexpectedCookieKey(String),

    /// Short reads surface here as `UnexpectedEof`.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A single failed probe. The driver only cares that it failed; the variant
/// is kept for the log line.
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("invalid status JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("probe timed out after {0:?}")]
    Timeout(Duration),
}

/// Anything wrong with the session credential of one connection.
#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("credential fetch failed: {0}")]
    Fetch(String),

    #[error("no credential provided")]
    Missing,

    #[error("credential signature or encoding invalid")]
    Invalid,

    #[error("credential expired at {exp}")]
    Expired { exp: i64 },
}

/// Why a connection was rejected by the admission gate.
#[derive(Debug, thiserror::Error)]
pub enum AdmissionError {
    #[error(transparent)]
    Credential(#[from] CredentialError),

    #[error("backend not ready within {0:?}")]
    ReadinessTimeout(Duration),

    #[error("connection cancelled while waiting for the backend")]
    Cancelled,
}

impl AdmissionError {
    /// The message shown to the player when the connection is severed.
    pub fn user_message(&self) -> &'static str {
        match self {
            AdmissionError::Credential(CredentialError::Fetch(_)) => "Session validation failed.",
            AdmissionError::Credential(CredentialError::Missing) => {
                "No session token was provided."
            }
            AdmissionError::Credential(CredentialError::Invalid) => "Invalid session token",
            AdmissionError::Credential(CredentialError::Expired { .. }) => "Session expired.",
            AdmissionError::ReadinessTimeout(_) | AdmissionError::Cancelled => {
                "Your game server is currently starting. Please try again in a moment."
            }
        }
    }
}

/// Process-level failures: bad configuration, failing to bind, and so on.
#[derive(Debug, thiserror::Error)]
pub enum GateError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("failed to parse options: {0}")]
    Options(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
