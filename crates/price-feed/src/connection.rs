//! Connection state machine and reconnect policy for push feeds

use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

use kimp_core::{ConnectionState, ConnectionStatus, ErrorKind, ExchangeKind, FeedSettings};

/// Exponential backoff with a cap and a bounded number of attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Consecutive failures before giving up and degrading
    pub max_attempts: u32,
}

impl ReconnectPolicy {
    pub fn from_settings(settings: &FeedSettings) -> Self {
        Self {
            base_delay: settings.reconnect_base(),
            max_delay: settings.reconnect_max(),
            max_attempts: settings.max_reconnect_attempts,
        }
    }

    /// `base * 2^attempts`, capped. `attempts` is the failure count before this one.
    pub fn delay_for(&self, attempts: u32) -> Duration {
        let factor = 1u32.checked_shl(attempts).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from_settings(&FeedSettings::default())
    }
}

/// What the feed loop should do after a failed session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureAction {
    Retry(Duration),
    Degrade,
}

/// Owns the `ConnectionState` of one feed and publishes every transition
pub struct ConnectionTracker {
    exchange: ExchangeKind,
    policy: ReconnectPolicy,
    tx: watch::Sender<ConnectionState>,
}

impl ConnectionTracker {
    pub fn new(exchange: ExchangeKind, policy: ReconnectPolicy) -> Self {
        let (tx, _) = watch::channel(ConnectionState::default());
        Self { exchange, policy, tx }
    }

    pub fn current(&self) -> ConnectionState {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.tx.subscribe()
    }

    /// `Reconnecting` covers the backoff wait only; every dial attempt is `Connecting`
    pub fn on_connecting(&self) {
        self.tx.send_modify(|state| state.status = ConnectionStatus::Connecting);
    }

    pub fn on_connected(&self) {
        self.tx.send_modify(|state| {
            state.status = ConnectionStatus::Connected;
            state.reconnect_attempts = 0;
            state.last_error = None;
            state.degraded = false;
        });
        info!(exchange = %self.exchange, "Feed connected");
    }

    /// Record a failed or dropped session and decide what comes next
    pub fn on_failure(&self, kind: ErrorKind) -> FailureAction {
        let mut action = FailureAction::Degrade;

        self.tx.send_modify(|state| {
            let previous = state.reconnect_attempts;
            state.last_error = Some(kind);

            if state.degraded {
                // Counting stops once degraded
                action = FailureAction::Degrade;
                return;
            }

            state.reconnect_attempts = previous.saturating_add(1);
            if state.reconnect_attempts >= self.policy.max_attempts {
                state.status = ConnectionStatus::Failed;
                state.degraded = true;
                action = FailureAction::Degrade;
            } else {
                state.status = ConnectionStatus::Reconnecting;
                action = FailureAction::Retry(self.policy.delay_for(previous));
            }
        });

        let attempts = self.tx.borrow().reconnect_attempts;
        match action {
            FailureAction::Retry(delay) => warn!(
                exchange = %self.exchange,
                attempt = attempts,
                max_attempts = self.policy.max_attempts,
                error = ?kind,
                "Feed session failed, reconnecting in {:?}", delay
            ),
            FailureAction::Degrade => error!(
                exchange = %self.exchange,
                attempt = attempts,
                error = ?kind,
                "Feed failed, entering degraded mode"
            ),
        }

        action
    }

    pub fn on_stopped(&self) {
        self.tx.send_modify(|state| {
            *state = ConnectionState::default();
        });
    }
}
