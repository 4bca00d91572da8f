//! session-gate/src/lib.rs
//! Admission gate for a game backend: players get through only with a valid
//! signed session token, and only once the backend has been answering status
//! pings for a full warmup period.

pub mod admission;
pub mod connection;
pub mod error;
pub mod logging;
pub mod prober;
pub mod protocol;
pub mod state;
pub mod token;
pub mod types;

pub use admission::{AdmissionConfig, AdmissionGate, PlayerConnection};
pub use error::{AdmissionError, CredentialError, GateError, ProbeError, ProtocolError};
pub use state::ReadinessState;
pub use token::Claims;
pub use types::{GateOptions, StatusPayload};

use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Binds the listener, starts the backend watcher and serves players until
/// `shutdown` is cancelled.
pub async fn run(options: GateOptions, shutdown: CancellationToken) -> Result<(), GateError> {
    let options = options.finalize(None)?;
    let readiness = Arc::new(ReadinessState::new(options.warmup()));
    let gate = AdmissionGate::new(readiness.clone(), AdmissionConfig::try_from(&options)?);

    let listener = TcpListener::bind(&options.listen_addr).await?;
    info!(
        listen = %listener.local_addr()?,
        backend = %options.backend_addr(),
        warmup_ms = options.warmup_ms,
        "Session validator + backend watcher with pre-wait & warmup active"
    );

    let watcher = tokio::spawn(state::run_watcher(
        readiness,
        options.clone(),
        shutdown.child_token(),
    ));
    connection::serve(listener, gate, Arc::new(options), shutdown).await;
    if let Err(e) = watcher.await {
        error!("Backend watcher task failed: {}", e);
    }
    Ok(())
}
