//! Disbursement transport boundary.
//!
//! The transport delivers value to a player through the chat platform's
//! gift primitive. It has no idempotency key of its own: exactly-once
//! delivery rests entirely on the ledger's claim exclusivity.

use crate::{
    rng::{OutcomeRng, StreamSlot},
    types::{Amount, PlayerId},
};
use std::collections::HashSet;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportReceipt {
    pub reference: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// Worth retrying after a backoff.
    Transient,
    /// Retrying cannot succeed; an operator has to look at it.
    Permanent,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("rate limited by platform (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    #[error("send timed out after {0:?}")]
    Timeout(Duration),

    #[error("transport unavailable: {0}")]
    Unavailable(String),

    #[error("recipient {player_id} does not accept gifts")]
    RecipientBlocked { player_id: PlayerId },

    #[error("invalid recipient {player_id}")]
    InvalidRecipient { player_id: PlayerId },

    #[error("insufficient dispatcher balance: need {needed}, have {available}")]
    InsufficientBalance { needed: Amount, available: Amount },
}

impl TransportError {
    pub fn kind(&self) -> TransportErrorKind {
        match self {
            Self::RateLimited { .. } | Self::Timeout(_) | Self::Unavailable(_) => {
                TransportErrorKind::Transient
            }
            Self::RecipientBlocked { .. }
            | Self::InvalidRecipient { .. }
            | Self::InsufficientBalance { .. } => TransportErrorKind::Permanent,
        }
    }

    pub fn is_permanent(&self) -> bool {
        self.kind() == TransportErrorKind::Permanent
    }

    /// Platform-provided wait hint, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

/// The value-transfer primitive. Implementations own their connection
/// lifecycle and are injected into the dispatcher.
pub trait DisbursementTransport: Send + Sync + 'static {
    fn send(
        &self,
        player_id: &str,
        amount: Amount,
    ) -> impl Future<Output = Result<TransportReceipt, TransportError>> + Send;
}

// ── Simulated transport ────────────────────────────────────────────

/// Knobs for `SimulatedTransport`.
#[derive(Debug, Clone)]
pub struct SimulatedTransportConfig {
    /// Master seed; the transport draws from its own stream of it.
    pub seed: u64,
    pub latency: Duration,
    /// Chance that a send fails transiently.
    pub transient_failure_rate: f64,
    /// Starting balance of the dispatching account.
    pub balance: Amount,
    /// Players whose privacy settings refuse gifts.
    pub blocked_players: HashSet<PlayerId>,
}

impl Default for SimulatedTransportConfig {
    fn default() -> Self {
        Self {
            seed: 7,
            latency: Duration::from_millis(5),
            transient_failure_rate: 0.1,
            balance: 1_000_000,
            blocked_players: HashSet::new(),
        }
    }
}

struct SimulatedState {
    rng: OutcomeRng,
    balance: Amount,
    sent: u64,
}

/// A seeded stand-in for the platform account, used by the runner.
pub struct SimulatedTransport {
    config: SimulatedTransportConfig,
    state: Mutex<SimulatedState>,
}

impl SimulatedTransport {
    pub fn new(config: SimulatedTransportConfig) -> Self {
        let state = SimulatedState {
            rng: OutcomeRng::for_slot(config.seed, StreamSlot::Transport),
            balance: config.balance,
            sent: 0,
        };
        Self {
            config,
            state: Mutex::new(state),
        }
    }

    pub fn balance(&self) -> Amount {
        self.state.lock().map_or(0, |s| s.balance)
    }

    pub fn sent_count(&self) -> u64 {
        self.state.lock().map_or(0, |s| s.sent)
    }

    fn settle(&self, player_id: &str, amount: Amount) -> Result<TransportReceipt, TransportError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| TransportError::Unavailable("simulated account poisoned".into()))?;
        if self.config.blocked_players.contains(player_id) {
            return Err(TransportError::RecipientBlocked { player_id: player_id.to_string() });
        }
        if state.rng.chance(self.config.transient_failure_rate) {
            return Err(if state.rng.chance(0.5) {
                TransportError::RateLimited { retry_after: Some(Duration::from_millis(50)) }
            } else {
                TransportError::Unavailable("platform returned 502".into())
            });
        }
        if state.balance < amount {
            return Err(TransportError::InsufficientBalance {
                needed: amount,
                available: state.balance,
            });
        }
        state.balance -= amount;
        state.sent += 1;
        Ok(TransportReceipt { reference: format!("sim-gift-{}", state.sent) })
    }
}

impl DisbursementTransport for SimulatedTransport {
    async fn send(&self, player_id: &str, amount: Amount) -> Result<TransportReceipt, TransportError> {
        tokio::time::sleep(self.config.latency).await;
        self.settle(player_id, amount)
    }
}
