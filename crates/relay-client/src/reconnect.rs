use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use rand::Rng;
use relay_core::topic::Topic;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Client connection lifecycle:
/// `Disconnected → Connecting → Connected → Disconnected (error/close)
/// → Connecting (after backoff) → …`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Capped exponential backoff parameters.
#[derive(Clone, Debug)]
pub struct BackoffConfig {
    /// Base delay for the first retry (ms).
    pub base_delay_ms: u64,
    /// Ceiling for any single delay (ms).
    pub max_delay_ms: u64,
    /// Symmetric jitter range 0.0–1.0 (0.2 means ±20%).
    pub jitter_factor: f64,
    /// Give up after this many consecutive failures. `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            jitter_factor: 0.2,
            max_attempts: None,
        }
    }
}

/// `min(max_delay, base * 2^attempt)` with symmetric jitter. `unit` is a
/// uniform sample in [0, 1); callers pass real randomness, tests pass a
/// fixed point.
pub fn backoff_delay(attempt: u32, config: &BackoffConfig, unit: f64) -> Duration {
    let exp = config
        .base_delay_ms
        .saturating_mul(2u64.saturating_pow(attempt.min(32)));
    let capped = exp.min(config.max_delay_ms) as f64;
    let jitter = (unit * 2.0 - 1.0) * config.jitter_factor;
    Duration::from_millis((capped * (1.0 + jitter)).max(0.0) as u64)
}

/// Client-side reconnection state machine.
///
/// Tracks the desired topic set — the union of everything the application
/// has asked to be subscribed to — independent of connection state, so a
/// fresh connection can re-declare the full set. The server keeps nothing
/// between connections; re-subscription is a full re-declaration, never a
/// delta, and is idempotent server-side.
pub struct ReconnectionManager {
    backoff: BackoffConfig,
    desired: RwLock<HashSet<Topic>>,
    attempts: AtomicU32,
    state_tx: watch::Sender<ConnectionState>,
    cancel: CancellationToken,
}

impl ReconnectionManager {
    pub fn new(backoff: BackoffConfig) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            backoff,
            desired: RwLock::new(HashSet::new()),
            attempts: AtomicU32::new(0),
            state_tx,
            cancel: CancellationToken::new(),
        }
    }

    /// Observe connection state changes (reconnecting indicator and tests).
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn current_state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub fn set_state(&self, state: ConnectionState) {
        let _ = self.state_tx.send(state);
    }

    pub fn add_desired(&self, topics: &[Topic]) {
        let mut set = self.desired.write();
        for topic in topics {
            set.insert(topic.clone());
        }
    }

    pub fn remove_desired(&self, topics: &[Topic]) {
        let mut set = self.desired.write();
        for topic in topics {
            set.remove(topic);
        }
    }

    /// The full set to re-declare on every fresh connection.
    pub fn desired(&self) -> Vec<Topic> {
        self.desired.read().iter().cloned().collect()
    }

    /// Note a successful connection: attempts reset, state flips.
    pub fn record_connected(&self) {
        self.attempts.store(0, Ordering::Relaxed);
        self.set_state(ConnectionState::Connected);
    }

    /// Note a failed connect or a dropped connection. Returns the delay to
    /// wait before the next attempt, or `None` when attempts are exhausted.
    pub fn record_failure(&self) -> Option<Duration> {
        let attempt = self.attempts.fetch_add(1, Ordering::Relaxed);
        if let Some(max) = self.backoff.max_attempts {
            if attempt + 1 > max {
                return None;
            }
        }
        let unit = rand::thread_rng().gen::<f64>();
        Some(backoff_delay(attempt, &self.backoff, unit))
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::Relaxed)
    }

    /// Sleep out a backoff delay. Returns `false` if `stop()` interrupted
    /// the wait, in which case no further attempt should be made.
    pub async fn wait_backoff(&self, delay: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = self.cancel.cancelled() => false,
        }
    }

    /// Halt any pending backoff timer and prevent further reconnect
    /// attempts. Used when the owning context is torn down.
    pub fn stop(&self) {
        self.cancel.cancel();
        self.set_state(ConnectionState::Disconnected);
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancelled(&self) -> CancellationToken {
        self.cancel.clone()
    }
}
