//! session-gate/src/state.rs
//! Backend readiness state and the watcher that keeps it current.

use crate::{prober, types::GateOptions};
use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Debounced view of backend liveness.
///
/// The watcher is the only writer. Readers load the two fields independently;
/// an unset `online_since` always reads as not ready, so the window between
/// the watcher's two stores can never report a false positive.
#[derive(Debug)]
pub struct ReadinessState {
    warmup: Duration,
    epoch: Instant,
    online: AtomicBool,
    /// Nanoseconds since `epoch`, plus one. Zero means unset.
    online_since: AtomicU64,
}

impl ReadinessState {
    pub fn new(warmup: Duration) -> Self {
        Self {
            warmup,
            epoch: Instant::now(),
            online: AtomicBool::new(false),
            online_since: AtomicU64::new(0),
        }
    }

    pub fn warmup(&self) -> Duration {
        self.warmup
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    pub fn online_since(&self) -> Option<Instant> {
        match self.online_since.load(Ordering::SeqCst) {
            0 => None,
            n => Some(self.epoch + Duration::from_nanos(n - 1)),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.is_ready_at(Instant::now())
    }

    /// Online, with a recorded transition at least `warmup` before `now`.
    pub fn is_ready_at(&self, now: Instant) -> bool {
        if !self.is_online() {
            return false;
        }
        match self.online_since() {
            Some(since) => now.saturating_duration_since(since) >= self.warmup,
            None => false,
        }
    }

    /// Records a successful probe finishing at `at`. Only the first success
    /// after an offline period moves the timestamp. Returns true on that
    /// transition.
    pub fn record_success(&self, at: Instant) -> bool {
        let came_online = !self.online.load(Ordering::SeqCst);
        if came_online {
            let nanos = at.saturating_duration_since(self.epoch).as_nanos() as u64;
            self.online_since.store(nanos + 1, Ordering::SeqCst);
        }
        self.online.store(true, Ordering::SeqCst);
        came_online
    }

    /// Records a failed probe. Returns true if the backend was online before.
    pub fn record_failure(&self) -> bool {
        let was_online = self.online.swap(false, Ordering::SeqCst);
        self.online_since.store(0, Ordering::SeqCst);
        was_online
    }
}

/// Runs one probe and folds the outcome into `state`.
pub async fn probe_once(state: &ReadinessState, host: &str, port: u16, timeout: Duration) {
    let addr = format!("{}:{}", host, port);
    match prober::probe(host, port, timeout).await {
        Ok(report) => {
            let came_online = state.record_success(Instant::now());
            if came_online {
                info!(
                    %addr,
                    warmup_ms = state.warmup().as_millis() as u64,
                    "Backend came online, warming up"
                );
            }
            info!(
                %addr,
                latency_ms = report.latency.as_millis() as u64,
                motd = %report.status.motd(),
                players_online = report.status.players.online,
                players_max = report.status.players.max,
                "Backend ONLINE"
            );
        }
        Err(e) => {
            if state.record_failure() {
                warn!(%addr, err = %e, "Backend went OFFLINE");
            } else {
                debug!(%addr, err = %e, "Backend OFFLINE");
            }
        }
    }
}

/// Probes the backend every `probeIntervalMs` until `cancel` fires.
pub async fn run_watcher(
    state: Arc<ReadinessState>,
    options: GateOptions,
    cancel: CancellationToken,
) {
    let interval = options.probe_interval();
    let timeout = options.probe_timeout();
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    info!(
        addr = %options.backend_addr(),
        interval_ms = interval.as_millis() as u64,
        "Backend watcher started"
    );
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = probe_once(&state, &options.backend_host, options.backend_port, timeout) => {}
        }
    }
    info!("Backend watcher stopped");
}
