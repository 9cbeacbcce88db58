//! Payout ledger: the single source of truth for "has this win been paid".
//!
//! STATE MACHINE:
//!   pending       --claim-->               processing
//!   processing    --success-->             paid            (terminal)
//!   processing    --failure, attempts<max--> failed
//!   failed        --claim (backoff due)--> processing
//!   processing    --failure, attempts>=max or permanent--> manual_review
//!   processing    --released unsent-->     pending | failed  (attempts unchanged)
//!   manual_review --operator-->            paid | failed
//!   failed, attempts>=max --operator-->    paid | failed
//!
//! RULES:
//!   - Only this module decides transitions; only the store runs SQL.
//!   - Every mutation commits one valid transition plus its audit event,
//!     or fails and leaves the row untouched.
//!   - The claim step is exclusive: a row is handed to one caller at a time.
//!   - attempts grows by exactly one per resolved dispatch attempt.

use crate::{
    clock::{Clock, SystemClock},
    config::LedgerConfig,
    error::{PayoutError, PayoutResult},
    event::{EventLogEntry, PayoutEvent},
    store::PayoutStore,
    types::{Amount, ObligationId, PlayerId, RoundId},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObligationStatus {
    Pending,
    Processing,
    Paid,
    Failed,
    ManualReview,
}

impl ObligationStatus {
    pub const ALL: [ObligationStatus; 5] = [
        Self::Pending,
        Self::Processing,
        Self::Paid,
        Self::Failed,
        Self::ManualReview,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending      => "pending",
            Self::Processing   => "processing",
            Self::Paid         => "paid",
            Self::Failed       => "failed",
            Self::ManualReview => "manual_review",
        }
    }
}

impl fmt::Display for ObligationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ObligationStatus {
    type Err = PayoutError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| PayoutError::Other(anyhow::anyhow!("unknown obligation status '{s}'")))
    }
}

/// One ledger row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayoutObligation {
    pub obligation_id: ObligationId,
    pub round_id: Option<RoundId>,
    pub player_id: PlayerId,
    pub player_display_name: Option<String>,
    pub amount: Amount,
    pub source_combination: String,
    pub status: ObligationStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub transport_reference: Option<String>,
    pub created_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub paid_at: Option<DateTime<Utc>>,
    pub admin_note: Option<String>,
}

/// Request to record a win.
#[derive(Debug, Clone, PartialEq)]
pub struct NewObligation {
    /// Idempotency key. Re-enqueueing the same round returns the first row.
    pub round_id: Option<RoundId>,
    pub player_id: PlayerId,
    pub player_display_name: Option<String>,
    pub amount: Amount,
    pub combination: String,
}

impl NewObligation {
    pub fn new(player_id: impl Into<PlayerId>, amount: Amount, combination: impl Into<String>) -> Self {
        Self {
            round_id: None,
            player_id: player_id.into(),
            player_display_name: None,
            amount,
            combination: combination.into(),
        }
    }

    pub fn for_round(mut self, round_id: impl Into<RoundId>) -> Self {
        self.round_id = Some(round_id.into());
        self
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.player_display_name = Some(name.into());
        self
    }
}

/// What a failed dispatch attempt should lead to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Transient: retry once `not_before` has passed, unless the attempt
    /// budget is spent.
    Retry { not_before: DateTime<Utc> },
    /// Permanent: park in manual review regardless of attempts.
    Escalate,
}

/// Operator decision on a row in manual review.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ManualResolution {
    /// Delivered out of band.
    Paid { reference: Option<String> },
    /// Returned to `failed`. Retried automatically only while attempts
    /// remain below the maximum; otherwise it stays closed as failed and
    /// can still be resolved by an operator later.
    Failed,
}

pub struct PayoutLedger {
    store: Mutex<PayoutStore>,
    config: LedgerConfig,
    clock: Arc<dyn Clock>,
    enqueued: Arc<Notify>,
}

impl PayoutLedger {
    pub fn new(store: PayoutStore, config: LedgerConfig) -> Self {
        Self {
            store: Mutex::new(store),
            config,
            clock: Arc::new(SystemClock),
            enqueued: Arc::new(Notify::new()),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// A migrated in-memory ledger (used in tests).
    pub fn in_memory(config: LedgerConfig) -> PayoutResult<Self> {
        let store = PayoutStore::in_memory()?;
        store.migrate()?;
        Ok(Self::new(store, config))
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Signalled once per newly created obligation.
    pub fn enqueued(&self) -> &Arc<Notify> {
        &self.enqueued
    }

    fn store(&self) -> PayoutResult<MutexGuard<'_, PayoutStore>> {
        self.store.lock().map_err(|_| PayoutError::StorePoisoned)
    }

    // ── Automated contract ─────────────────────────────────────────

    /// Record a win as a `pending` obligation.
    pub fn enqueue(&self, request: NewObligation) -> PayoutResult<PayoutObligation> {
        if request.amount == 0 || request.amount > i64::MAX as Amount {
            return Err(PayoutError::InvalidAmount { amount: request.amount });
        }
        let obligation = PayoutObligation {
            obligation_id: uuid::Uuid::new_v4().to_string(),
            round_id: request.round_id,
            player_id: request.player_id,
            player_display_name: request.player_display_name,
            amount: request.amount,
            source_combination: request.combination,
            status: ObligationStatus::Pending,
            attempts: 0,
            last_error: None,
            transport_reference: None,
            created_at: self.clock.now(),
            claimed_at: None,
            next_attempt_at: None,
            paid_at: None,
            admin_note: None,
        };
        let (stored, created) = self.store()?.insert_obligation(&obligation)?;
        if created {
            log::info!(
                "Enqueued obligation {} for player {}: {} ({})",
                stored.obligation_id, stored.player_id, stored.amount, stored.source_combination
            );
            self.enqueued.notify_one();
        } else {
            log::debug!(
                "Round {:?} already settled as obligation {}",
                stored.round_id, stored.obligation_id
            );
        }
        Ok(stored)
    }

    /// Atomically move up to `limit` payable rows to `processing` and
    /// return them. Payable: `pending`, or `failed` with attempts below
    /// `max_attempts` and its backoff elapsed.
    pub fn claim_batch(&self, limit: usize, max_attempts: u32) -> PayoutResult<Vec<PayoutObligation>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let claimed = self.store()?.claim_payable(limit, max_attempts, self.clock.now())?;
        if !claimed.is_empty() {
            log::debug!("Claimed {} obligation(s)", claimed.len());
        }
        Ok(claimed)
    }

    /// `processing -> paid`. Rejected with a conflict for any other status.
    pub fn mark_paid(&self, id: &str, transport_reference: &str) -> PayoutResult<PayoutObligation> {
        let now = self.clock.now();
        let paid = self.store()?.transition(id, ObligationStatus::Processing, now, |row| {
            let mut next = row.clone();
            next.status = ObligationStatus::Paid;
            next.attempts = row.attempts + 1;
            next.transport_reference = Some(transport_reference.to_string());
            next.paid_at = Some(now);
            next.next_attempt_at = None;
            let event = PayoutEvent::ObligationPaid {
                obligation_id: row.obligation_id.clone(),
                transport_reference: transport_reference.to_string(),
                attempts: next.attempts,
            };
            (next, event)
        })?;
        log::info!(
            "Obligation {} paid to {} (ref {transport_reference}, attempt {})",
            paid.obligation_id, paid.player_id, paid.attempts
        );
        Ok(paid)
    }

    /// `processing -> failed`, or `-> manual_review` when the disposition
    /// is `Escalate` or the attempt budget is spent.
    pub fn mark_failed(
        &self,
        id: &str,
        error: &str,
        disposition: FailureDisposition,
    ) -> PayoutResult<PayoutObligation> {
        let now = self.clock.now();
        let max_attempts = self.config.max_attempts;
        let row = self.store()?.transition(id, ObligationStatus::Processing, now, |row| {
            fail_row(row, error, disposition, max_attempts)
        })?;
        log_failure(&row);
        Ok(row)
    }

    /// Hand a claim back without sending. The row returns to `pending`
    /// (or `failed`, due now, if it was already tried) and keeps its
    /// attempt count. Used when a claim aged too long to send safely.
    pub fn release_claim(&self, id: &str, reason: &str) -> PayoutResult<PayoutObligation> {
        let now = self.clock.now();
        let row = self.store()?.transition(id, ObligationStatus::Processing, now, |row| {
            let mut next = row.clone();
            next.claimed_at = None;
            if row.attempts == 0 {
                next.status = ObligationStatus::Pending;
                next.next_attempt_at = None;
            } else {
                next.status = ObligationStatus::Failed;
                next.next_attempt_at = Some(now);
            }
            let event = PayoutEvent::ClaimReleased {
                obligation_id: row.obligation_id.clone(),
                status: next.status,
                reason: reason.to_string(),
            };
            (next, event)
        })?;
        log::warn!("Released claim on obligation {} unsent: {reason}", row.obligation_id);
        Ok(row)
    }

    /// Return abandoned claims to the retry pool. A `processing` row whose
    /// claim is older than `claim_stale_after` counts as one failed attempt.
    pub fn reclaim_stale(&self) -> PayoutResult<Vec<PayoutObligation>> {
        let now = self.clock.now();
        let stale_after = chrono::Duration::from_std(self.config.claim_stale_after())
            .map_err(|e| PayoutError::InvalidConfig(format!("claim_stale_after: {e}")))?;
        let cutoff = now - stale_after;
        let max_attempts = self.config.max_attempts;
        let reclaimed = self.store()?.reclaim_stale(cutoff, now, |row| {
            let (next, _) = fail_row(
                row,
                "claim expired before completion",
                FailureDisposition::Retry { not_before: now },
                max_attempts,
            );
            let event = PayoutEvent::ObligationReclaimed {
                obligation_id: row.obligation_id.clone(),
                claimed_at: row.claimed_at,
                status: next.status,
            };
            (next, event)
        })?;
        for row in &reclaimed {
            log::warn!(
                "Reclaimed stale obligation {} -> {} (attempt {})",
                row.obligation_id, row.status, row.attempts
            );
        }
        Ok(reclaimed)
    }

    // ── Read accessors ─────────────────────────────────────────────

    pub fn get(&self, id: &str) -> PayoutResult<PayoutObligation> {
        self.store()?
            .get_obligation(id)?
            .ok_or_else(|| PayoutError::ObligationNotFound { id: id.to_string() })
    }

    pub fn list_by_status(&self, status: ObligationStatus) -> PayoutResult<Vec<PayoutObligation>> {
        self.store()?.obligations_by_status(status)
    }

    pub fn list_by_player(&self, player_id: &str) -> PayoutResult<Vec<PayoutObligation>> {
        self.store()?.obligations_by_player(player_id)
    }

    pub fn events_for(&self, id: &str) -> PayoutResult<Vec<EventLogEntry>> {
        self.store()?.events_for_obligation(id)
    }

    /// Row count per status; statuses with no rows report zero.
    pub fn summary(&self) -> PayoutResult<BTreeMap<ObligationStatus, u64>> {
        let mut counts: BTreeMap<ObligationStatus, u64> =
            ObligationStatus::ALL.into_iter().map(|s| (s, 0)).collect();
        counts.extend(self.store()?.status_counts()?);
        Ok(counts)
    }

    /// True while anything could still be dispatched automatically.
    pub fn has_outstanding(&self) -> PayoutResult<bool> {
        let counts = self.summary()?;
        let outstanding = counts[&ObligationStatus::Pending] + counts[&ObligationStatus::Processing];
        if outstanding > 0 {
            return Ok(true);
        }
        let retryable = self
            .list_by_status(ObligationStatus::Failed)?
            .iter()
            .any(|row| row.attempts < self.config.max_attempts);
        Ok(retryable)
    }

    // ── Operator surface ───────────────────────────────────────────

    /// Resolve a row parked in manual review, or a `failed` row whose
    /// attempt budget is spent (nothing automated will touch it again).
    /// `note` is kept as the row's admin note and in the audit trail.
    pub fn resolve_manual(
        &self,
        id: &str,
        resolution: ManualResolution,
        note: &str,
    ) -> PayoutResult<PayoutObligation> {
        let current = self.get(id)?;
        let expected = match current.status {
            ObligationStatus::ManualReview => ObligationStatus::ManualReview,
            ObligationStatus::Failed if current.attempts >= self.config.max_attempts => {
                ObligationStatus::Failed
            }
            actual => {
                return Err(PayoutError::StatusConflict {
                    id: id.to_string(),
                    expected: ObligationStatus::ManualReview,
                    actual,
                })
            }
        };
        let now = self.clock.now();
        let row = self.store()?.transition(id, expected, now, |row| {
            let mut next = row.clone();
            next.admin_note = Some(note.to_string());
            next.claimed_at = None;
            match &resolution {
                ManualResolution::Paid { reference } => {
                    next.status = ObligationStatus::Paid;
                    next.paid_at = Some(now);
                    if reference.is_some() {
                        next.transport_reference = reference.clone();
                    }
                    next.next_attempt_at = None;
                }
                ManualResolution::Failed => {
                    next.status = ObligationStatus::Failed;
                    next.next_attempt_at = Some(now);
                }
            }
            let event = PayoutEvent::OperatorResolved {
                obligation_id: row.obligation_id.clone(),
                status: next.status,
                note: note.to_string(),
            };
            (next, event)
        })?;
        log::info!(
            "Operator resolved obligation {} as {}: {note}",
            row.obligation_id, row.status
        );
        Ok(row)
    }
}

/// Apply one failed attempt to a `processing` row.
fn fail_row(
    row: &PayoutObligation,
    error: &str,
    disposition: FailureDisposition,
    max_attempts: u32,
) -> (PayoutObligation, PayoutEvent) {
    let mut next = row.clone();
    next.attempts = row.attempts + 1;
    next.last_error = Some(error.to_string());
    next.claimed_at = None;

    let event = match disposition {
        FailureDisposition::Retry { not_before } if next.attempts < max_attempts => {
            next.status = ObligationStatus::Failed;
            next.next_attempt_at = Some(not_before);
            PayoutEvent::ObligationFailed {
                obligation_id: row.obligation_id.clone(),
                error: error.to_string(),
                attempts: next.attempts,
                next_attempt_at: next.next_attempt_at,
            }
        }
        _ => {
            next.status = ObligationStatus::ManualReview;
            next.next_attempt_at = None;
            PayoutEvent::ObligationEscalated {
                obligation_id: row.obligation_id.clone(),
                error: error.to_string(),
                attempts: next.attempts,
            }
        }
    };
    (next, event)
}

fn log_failure(row: &PayoutObligation) {
    let error = row.last_error.as_deref().unwrap_or("");
    match row.status {
        ObligationStatus::ManualReview => log::error!(
            "Obligation {} for player {} needs manual review after {} attempt(s): {error}",
            row.obligation_id, row.player_id, row.attempts
        ),
        _ => log::warn!(
            "Obligation {} attempt {} failed, retry after {:?}: {error}",
            row.obligation_id, row.attempts, row.next_attempt_at
        ),
    }
}
