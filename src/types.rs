//! session-gate/src/types.rs
//! Core data structures and gate options.

use crate::error::GateError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Environment variable that overrides `sessionSecret`.
pub const SECRET_ENV: &str = "SESSION_GATE_SECRET";

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase", default)]
pub struct GateOptions {
    pub listen_addr: String,
    pub backend_host: String,
    pub backend_port: u16,
    pub probe_timeout_ms: u64,
    pub probe_interval_ms: u64,
    /// How long the backend must stay online before players are let through.
    pub warmup_ms: u64,
    pub credential_timeout_ms: u64,
    pub wait_timeout_ms: u64,
    pub wait_poll_ms: u64,
    /// Cookie identifier the session token is stored under on the client.
    pub cookie_key: String,
    pub session_secret: Option<String>,
    /// Send a PROXY protocol v2 header to the backend for admitted players.
    pub proxy_protocol: bool,
    pub log_level: String,
}

impl Default for GateOptions {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:25565".to_string(),
            backend_host: "localhost".to_string(),
            backend_port: 25566,
            probe_timeout_ms: 2_000,
            probe_interval_ms: 1_000,
            warmup_ms: 3_000,
            credential_timeout_ms: 3_000,
            wait_timeout_ms: 30_000,
            wait_poll_ms: 500,
            cookie_key: "master:session".to_string(),
            session_secret: None,
            proxy_protocol: false,
            log_level: "info".to_string(),
        }
    }
}

impl GateOptions {
    pub fn from_json(json: &str) -> Result<Self, GateError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Applies environment overrides and checks the options are usable.
    pub fn finalize(mut self, env_secret: Option<String>) -> Result<Self, GateError> {
        if let Some(secret) = env_secret.filter(|s| !s.is_empty()) {
            self.session_secret = Some(secret);
        }
        if self.secret().is_none() {
            return Err(GateError::Config(format!(
                "no session secret configured (set sessionSecret or {SECRET_ENV})"
            )));
        }
        let durations = [
            ("probeTimeoutMs", self.probe_timeout_ms),
            ("probeIntervalMs", self.probe_interval_ms),
            ("warmupMs", self.warmup_ms),
            ("credentialTimeoutMs", self.credential_timeout_ms),
            ("waitTimeoutMs", self.wait_timeout_ms),
            ("waitPollMs", self.wait_poll_ms),
        ];
        if let Some((name, _)) = durations.iter().find(|(_, ms)| *ms == 0) {
            return Err(GateError::Config(format!("{name} must be greater than zero")));
        }
        Ok(self)
    }

    pub fn backend_addr(&self) -> String {
        format!("{}:{}", self.backend_host, self.backend_port)
    }

    /// The HMAC key, or `None` when unset or empty.
    pub fn secret(&self) -> Option<&[u8]> {
        self.session_secret
            .as_deref()
            .filter(|s| !s.is_empty())
            .map(str::as_bytes)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn warmup(&self) -> Duration {
        Duration::from_millis(self.warmup_ms)
    }

    pub fn credential_timeout(&self) -> Duration {
        Duration::from_millis(self.credential_timeout_ms)
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }

    pub fn wait_poll(&self) -> Duration {
        Duration::from_millis(self.wait_poll_ms)
    }
}

/// Status response as returned by the backend's server list ping.
#[derive(Serialize, Deserialize, Debug, Default, Clone)]
pub struct StatusPayload {
    /// Can be a plain string or a text component object
    #[serde(default)]
    pub description: serde_json::Value,
    #[serde(default)]
    pub players: StatusPlayers,
}

#[derive(Serialize, Deserialize, Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StatusPlayers {
    #[serde(default)]
    pub online: i64,
    #[serde(default)]
    pub max: i64,
}

impl StatusPayload {
    /// Flattens the description into a single line of MOTD text.
    pub fn motd(&self) -> String {
        match &self.description {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Object(map) => match map.get("text") {
                Some(serde_json::Value::String(text)) => text.clone(),
                _ => self.description.to_string(),
            },
            other => other.to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HandshakeData {
    pub protocol_version: i32,
    pub host: String,
    pub port: u16,
    pub next_state: i32,
}
