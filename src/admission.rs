//! session-gate/src/admission.rs
//! Per-connection admission: session token check, then wait for a warm backend.

use crate::{
    error::{AdmissionError, CredentialError, GateError},
    state::ReadinessState,
    token::{self, Claims},
    types::GateOptions,
};
use std::{
    future::Future,
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// What the host gives the gate for one incoming player.
pub trait PlayerConnection: Send {
    fn username(&self) -> &str;

    /// Cancelled when the player's connection goes away.
    fn context(&self) -> &CancellationToken;

    /// Asks the client for the opaque credential stored under `key`.
    /// `Ok(None)` means the client has none.
    fn fetch_credential(
        &mut self,
        key: &str,
    ) -> impl Future<Output = Result<Option<Vec<u8>>, CredentialError>> + Send;

    /// Disconnects the player with a styled message.
    fn reject(&mut self, message: &str) -> impl Future<Output = ()> + Send;
}

#[derive(Debug, Clone)]
pub struct AdmissionConfig {
    pub cookie_key: String,
    pub secret: Vec<u8>,
    pub credential_timeout: Duration,
    pub wait_timeout: Duration,
    pub wait_poll: Duration,
}

impl TryFrom<&GateOptions> for AdmissionConfig {
    type Error = GateError;

    /// Fails unless a non-empty session secret is configured.
    fn try_from(options: &GateOptions) -> Result<Self, Self::Error> {
        let secret = options
            .secret()
            .ok_or_else(|| GateError::Config("no session secret configured".to_string()))?;
        Ok(Self {
            cookie_key: options.cookie_key.clone(),
            secret: secret.to_vec(),
            credential_timeout: options.credential_timeout(),
            wait_timeout: options.wait_timeout(),
            wait_poll: options.wait_poll(),
        })
    }
}

/// Decides, per connection, whether a player may continue to the backend.
#[derive(Debug, Clone)]
pub struct AdmissionGate {
    readiness: Arc<ReadinessState>,
    config: Arc<AdmissionConfig>,
}

impl AdmissionGate {
    pub fn new(readiness: Arc<ReadinessState>, config: AdmissionConfig) -> Self {
        Self {
            readiness,
            config: Arc::new(config),
        }
    }

    /// Runs the full admission flow. On `Err` the player has already been
    /// rejected through [`PlayerConnection::reject`]; on `Ok` nothing was sent
    /// and the caller lets the connection through.
    pub async fn admit<C: PlayerConnection>(&self, conn: &mut C) -> Result<Claims, AdmissionError> {
        match self.evaluate(conn).await {
            Ok(claims) => Ok(claims),
            Err(e) => {
                warn!(username = %conn.username(), reason = %e, "Rejecting player");
                conn.reject(e.user_message()).await;
                Err(e)
            }
        }
    }

    async fn evaluate<C: PlayerConnection>(&self, conn: &mut C) -> Result<Claims, AdmissionError> {
        let credential = self.fetch_credential(conn).await?;
        let (payload, claims) = self.check_credential(&credential, unix_now())?;
        info!(
            username = %conn.username(),
            exp = claims.expires_at(),
            "Session authenticated: {}",
            payload
        );
        let context = conn.context().clone();
        self.wait_until_ready(conn.username(), &context).await?;
        Ok(claims)
    }

    async fn fetch_credential<C: PlayerConnection>(
        &self,
        conn: &mut C,
    ) -> Result<Vec<u8>, CredentialError> {
        let context = conn.context().clone();
        let timeout = self.config.credential_timeout;
        let fetched = tokio::select! {
            _ = context.cancelled() => {
                return Err(CredentialError::Fetch("connection closed".to_string()));
            }
            result = tokio::time::timeout(timeout, conn.fetch_credential(&self.config.cookie_key)) => {
                result.map_err(|_| CredentialError::Fetch(format!("no answer within {:?}", timeout)))??
            }
        };
        match fetched {
            Some(raw) if !raw.is_empty() => Ok(raw),
            _ => Err(CredentialError::Missing),
        }
    }

    fn check_credential(
        &self,
        credential: &[u8],
        now_unix: i64,
    ) -> Result<(String, Claims), CredentialError> {
        let token = std::str::from_utf8(credential).map_err(|_| CredentialError::Invalid)?;
        let payload = token::verify(token, &self.config.secret).ok_or(CredentialError::Invalid)?;
        let claims = Claims::parse(&payload);
        if claims.is_expired_at(now_unix) {
            return Err(CredentialError::Expired {
                exp: claims.expires_at(),
            });
        }
        Ok((payload, claims))
    }

    async fn wait_until_ready(
        &self,
        username: &str,
        context: &CancellationToken,
    ) -> Result<(), AdmissionError> {
        if self.readiness.is_ready() {
            return Ok(());
        }

        let started = Instant::now();
        let deadline = tokio::time::sleep(self.config.wait_timeout);
        tokio::pin!(deadline);
        let poll = self.config.wait_poll;
        let mut ticker = tokio::time::interval_at(started + poll, poll);

        info!(username = %username, "Backend not ready, holding player");
        loop {
            if self.readiness.is_ready() {
                info!(
                    username = %username,
                    waited_ms = started.elapsed().as_millis() as u64,
                    "Backend ready, continuing login"
                );
                return Ok(());
            }
            tokio::select! {
                biased;
                _ = context.cancelled() => return Err(AdmissionError::Cancelled),
                _ = &mut deadline => {
                    return Err(AdmissionError::ReadinessTimeout(self.config.wait_timeout));
                }
                _ = ticker.tick() => {}
            }
        }
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &[u8] = b"gate-test-secret";
    const STARTING: &str = "Your game server is currently starting. Please try again in a moment.";

    struct MockConnection {
        username: String,
        context: CancellationToken,
        credential: Option<Result<Option<Vec<u8>>, CredentialError>>,
        fetch_delay: Option<Duration>,
        rejections: Vec<String>,
    }

    impl MockConnection {
        fn with_credential(credential: Result<Option<Vec<u8>>, CredentialError>) -> Self {
            Self {
                username: "Steve".to_string(),
                context: CancellationToken::new(),
                credential: Some(credential),
                fetch_delay: None,
                rejections: Vec::new(),
            }
        }

        fn with_token(token: String) -> Self {
            Self::with_credential(Ok(Some(token.into_bytes())))
        }
    }

    impl PlayerConnection for MockConnection {
        fn username(&self) -> &str {
            &self.username
        }

        fn context(&self) -> &CancellationToken {
            &self.context
        }

        async fn fetch_credential(
            &mut self,
            key: &str,
        ) -> Result<Option<Vec<u8>>, CredentialError> {
            assert_eq!(key, "master:session");
            if let Some(delay) = self.fetch_delay {
                tokio::time::sleep(delay).await;
            }
            self.credential.take().unwrap_or(Ok(None))
        }

        async fn reject(&mut self, message: &str) {
            self.rejections.push(message.to_string());
        }
    }

    fn gate(readiness: Arc<ReadinessState>) -> AdmissionGate {
        let options = GateOptions {
            session_secret: Some(String::from_utf8(SECRET.to_vec()).unwrap()),
            ..Default::default()
        };
        AdmissionGate::new(readiness, AdmissionConfig::try_from(&options).unwrap())
    }

    fn valid_token() -> String {
        token::sign(&format!("user=Steve;exp={}", unix_now() + 3600), SECRET)
    }

    async fn warm_state() -> Arc<ReadinessState> {
        let state = Arc::new(ReadinessState::new(Duration::from_secs(3)));
        state.record_success(Instant::now());
        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(state.is_ready());
        state
    }

    fn cold_state() -> Arc<ReadinessState> {
        Arc::new(ReadinessState::new(Duration::from_secs(3)))
    }

    #[tokio::test(start_paused = true)]
    async fn test_valid_session_ready_backend_admits() {
        let gate = gate(warm_state().await);
        let mut conn = MockConnection::with_token(valid_token());

        let claims = gate.admit(&mut conn).await.unwrap();
        assert_eq!(claims.get("user"), Some("Steve"));
        assert!(conn.rejections.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_session_rejected() {
        let gate = gate(warm_state().await);
        let token = token::sign(&format!("user=Steve;exp={}", unix_now() - 1), SECRET);
        let mut conn = MockConnection::with_token(token);

        let err = gate.admit(&mut conn).await.unwrap_err();
        assert!(matches!(err, AdmissionError::Credential(CredentialError::Expired { .. })));
        assert_eq!(conn.rejections, vec!["Session expired."]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_exp_rejected_as_expired() {
        let gate = gate(warm_state().await);
        let mut conn = MockConnection::with_token(token::sign("user=Steve", SECRET));

        gate.admit(&mut conn).await.unwrap_err();
        assert_eq!(conn.rejections, vec!["Session expired."]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_credential_rejected() {
        let gate = gate(warm_state().await);

        let mut none = MockConnection::with_credential(Ok(None));
        gate.admit(&mut none).await.unwrap_err();
        assert_eq!(none.rejections, vec!["No session token was provided."]);

        let mut empty = MockConnection::with_credential(Ok(Some(Vec::new())));
        gate.admit(&mut empty).await.unwrap_err();
        assert_eq!(empty.rejections, vec!["No session token was provided."]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_failure_rejected() {
        let gate = gate(warm_state().await);
        let mut conn =
            MockConnection::with_credential(Err(CredentialError::Fetch("client left".into())));

        gate.admit(&mut conn).await.unwrap_err();
        assert_eq!(conn.rejections, vec!["Session validation failed."]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_fetch_times_out() {
        let gate = gate(warm_state().await);
        let mut conn = MockConnection::with_token(valid_token());
        conn.fetch_delay = Some(Duration::from_secs(10));

        let started = Instant::now();
        let err = gate.admit(&mut conn).await.unwrap_err();
        assert!(matches!(err, AdmissionError::Credential(CredentialError::Fetch(_))));
        assert!(started.elapsed() >= Duration::from_secs(3));
        assert!(started.elapsed() < Duration::from_secs(4));
        assert_eq!(conn.rejections, vec!["Session validation failed."]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bad_signature_rejected() {
        let gate = gate(warm_state().await);
        let forged = token::sign(&format!("exp={}", unix_now() + 3600), b"someone-else");
        let mut conn = MockConnection::with_token(forged);

        gate.admit(&mut conn).await.unwrap_err();
        assert_eq!(conn.rejections, vec!["Invalid session token"]);

        let mut garbage = MockConnection::with_credential(Ok(Some(vec![0xFF, 0xFE, b'.', 0x00])));
        gate.admit(&mut garbage).await.unwrap_err();
        assert_eq!(garbage.rejections, vec!["Invalid session token"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backend_never_ready_times_out_after_wait() {
        let gate = gate(cold_state());
        let mut conn = MockConnection::with_token(valid_token());

        let started = Instant::now();
        let err = gate.admit(&mut conn).await.unwrap_err();
        assert!(matches!(err, AdmissionError::ReadinessTimeout(_)));
        assert!(started.elapsed() >= Duration::from_secs(30));
        assert!(started.elapsed() < Duration::from_millis(30_500));
        assert_eq!(conn.rejections, vec![STARTING]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backend_warms_up_during_wait() {
        let state = cold_state();
        let gate = gate(state.clone());
        let mut conn = MockConnection::with_token(valid_token());

        let writer = state.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            writer.record_success(Instant::now());
        });

        let started = Instant::now();
        gate.admit(&mut conn).await.unwrap();
        let waited = started.elapsed();
        assert!(waited >= Duration::from_secs(5), "admitted too early: {waited:?}");
        assert!(waited <= Duration::from_secs(6), "admitted too late: {waited:?}");
        assert!(conn.rejections.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_connection_stops_waiting() {
        let gate = gate(cold_state());
        let mut cancelled = MockConnection::with_token(valid_token());
        let mut waiting = MockConnection::with_token(valid_token());
        let context = cancelled.context.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            context.cancel();
        });

        let started = Instant::now();
        let (a, b) = tokio::join!(gate.admit(&mut cancelled), gate.admit(&mut waiting));

        assert!(matches!(a, Err(AdmissionError::Cancelled)));
        assert!(matches!(b, Err(AdmissionError::ReadinessTimeout(_))));
        assert!(started.elapsed() >= Duration::from_secs(30));
        assert_eq!(cancelled.rejections.len(), 1);
        assert_eq!(waiting.rejections, vec![STARTING]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_before_fetch() {
        let gate = gate(warm_state().await);
        let mut conn = MockConnection::with_token(valid_token());
        conn.fetch_delay = Some(Duration::from_secs(1));
        conn.context.cancel();

        let err = gate.admit(&mut conn).await.unwrap_err();
        assert!(matches!(err, AdmissionError::Credential(CredentialError::Fetch(_))));
    }

    #[test]
    fn test_config_requires_secret() {
        let err = AdmissionConfig::try_from(&GateOptions::default()).unwrap_err();
        assert!(matches!(err, GateError::Config(_)));

        let empty = GateOptions {
            session_secret: Some(String::new()),
            ..Default::default()
        };
        assert!(AdmissionConfig::try_from(&empty).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_signed_with_empty_key_rejected() {
        let gate = gate(warm_state().await);
        let forged = token::sign(&format!("user=Mallory;exp={}", unix_now() + 3600), b"");
        let mut conn = MockConnection::with_token(forged);

        let err = gate.admit(&mut conn).await.unwrap_err();
        assert!(matches!(err, AdmissionError::Credential(CredentialError::Invalid)));
        assert_eq!(conn.rejections, vec!["Invalid session token"]);
    }
}
