//! Disbursement dispatcher: drives ledger rows through the transport.
//!
//! RULES:
//!   - A row is only ever sent after this worker claimed it from the ledger.
//!   - A pass claims no more rows than it can send at once, so a claimed
//!     row never queues behind another send.
//!   - A send starts only while the claim is young enough that the send
//!     timeout expires before the row could be reclaimed as stale.
//!     Older claims are released unsent.
//!   - Every send passes the shared rate limiter and runs under a timeout.
//!   - Transient failures go back to the ledger with a backoff; permanent
//!     ones go straight to manual review.
//!   - Shutdown stops new claims. Sends already claimed finish or time out.

use crate::{
    config::DispatchConfig,
    error::{PayoutError, PayoutResult},
    ledger::{FailureDisposition, ObligationStatus, PayoutLedger, PayoutObligation},
    transport::{DisbursementTransport, TransportError},
};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use std::num::NonZeroU32;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;

pub type SharedRateLimiter = Arc<DefaultDirectRateLimiter>;

/// Build the process-wide transport budget.
pub fn rate_limiter(config: &DispatchConfig) -> PayoutResult<SharedRateLimiter> {
    let rate = NonZeroU32::new(config.rate_per_second)
        .ok_or_else(|| PayoutError::InvalidConfig("dispatch.rate_per_second is zero".into()))?;
    let burst = NonZeroU32::new(config.burst)
        .ok_or_else(|| PayoutError::InvalidConfig("dispatch.burst is zero".into()))?;
    Ok(Arc::new(RateLimiter::direct(Quota::per_second(rate).allow_burst(burst))))
}

/// What a dispatch pass did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchSummary {
    pub reclaimed: usize,
    pub claimed: usize,
    pub released: usize,
    pub paid: usize,
    pub retrying: usize,
    pub escalated: usize,
    pub conflicts: usize,
    pub errors: usize,
}

impl DispatchSummary {
    pub fn absorb(&mut self, other: &DispatchSummary) {
        self.reclaimed += other.reclaimed;
        self.claimed += other.claimed;
        self.released += other.released;
        self.paid += other.paid;
        self.retrying += other.retrying;
        self.escalated += other.escalated;
        self.conflicts += other.conflicts;
        self.errors += other.errors;
    }

    fn count(&mut self, outcome: SendOutcome) {
        match outcome {
            SendOutcome::Paid      => self.paid += 1,
            SendOutcome::Retrying  => self.retrying += 1,
            SendOutcome::Escalated => self.escalated += 1,
            SendOutcome::Released  => self.released += 1,
            SendOutcome::Conflict  => self.conflicts += 1,
            SendOutcome::Error     => self.errors += 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SendOutcome {
    Paid,
    Retrying,
    Escalated,
    Released,
    Conflict,
    Error,
}

pub struct Dispatcher<T> {
    name: String,
    ledger: Arc<PayoutLedger>,
    transport: Arc<T>,
    limiter: SharedRateLimiter,
    config: DispatchConfig,
}

impl<T> Clone for Dispatcher<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            ledger: Arc::clone(&self.ledger),
            transport: Arc::clone(&self.transport),
            limiter: Arc::clone(&self.limiter),
            config: self.config.clone(),
        }
    }
}

impl<T: DisbursementTransport> Dispatcher<T> {
    pub fn new(
        ledger: Arc<PayoutLedger>,
        transport: Arc<T>,
        config: DispatchConfig,
    ) -> PayoutResult<Self> {
        config.validate()?;
        if ledger.config().claim_stale_after_ms <= config.send_timeout_ms {
            return Err(PayoutError::InvalidConfig(
                "ledger.claim_stale_after_ms must exceed dispatch.send_timeout_ms".into(),
            ));
        }
        let limiter = rate_limiter(&config)?;
        Ok(Self {
            name: "dispatcher-0".to_string(),
            ledger,
            transport,
            limiter,
            config,
        })
    }

    /// Share an existing limiter, e.g. across dispatchers for several ledgers.
    pub fn with_limiter(mut self, limiter: SharedRateLimiter) -> Self {
        self.limiter = limiter;
        self
    }

    /// Another worker over the same ledger, transport and limiter.
    pub fn worker(&self, index: usize) -> Self {
        let mut worker = self.clone();
        worker.name = format!("dispatcher-{index}");
        worker
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn limiter(&self) -> &SharedRateLimiter {
        &self.limiter
    }

    /// Rows claimed per pass: every claimed row gets a send slot at once.
    pub fn claim_limit(&self) -> usize {
        self.config.batch_limit.min(self.config.parallelism)
    }

    /// One pass: recover stale claims, claim what can be sent right away,
    /// send it concurrently and wait for every send to resolve.
    pub async fn run_once(&self) -> PayoutResult<DispatchSummary> {
        let mut summary = DispatchSummary {
            reclaimed: self.ledger.reclaim_stale()?.len(),
            ..DispatchSummary::default()
        };

        let batch = self
            .ledger
            .claim_batch(self.claim_limit(), self.ledger.max_attempts())?;
        summary.claimed = batch.len();
        if batch.is_empty() {
            return Ok(summary);
        }
        log::debug!("{} dispatching {} obligation(s)", self.name, batch.len());

        let mut tasks = JoinSet::new();
        for obligation in batch {
            let worker = self.clone();
            tasks.spawn(async move { worker.dispatch(obligation).await });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => summary.count(outcome),
                Err(e) => {
                    // The row stays processing and is reclaimed once stale.
                    log::error!("{} send task aborted: {e}", self.name);
                    summary.errors += 1;
                }
            }
        }
        Ok(summary)
    }

    /// Latest instant a send for this claim may start.
    fn send_deadline(&self, obligation: &PayoutObligation) -> Option<chrono::DateTime<chrono::Utc>> {
        let stale_after = self.ledger.config().claim_stale_after_ms;
        let budget = stale_after.saturating_sub(self.config.send_timeout_ms);
        let budget = chrono::Duration::try_milliseconds(i64::try_from(budget).ok()?)?;
        obligation.claimed_at.map(|at| at + budget)
    }

    async fn dispatch(&self, obligation: PayoutObligation) -> SendOutcome {
        let id = obligation.obligation_id.as_str();
        self.limiter.until_ready().await;

        let fresh = self
            .send_deadline(&obligation)
            .is_some_and(|deadline| self.ledger.clock().now() < deadline);
        if !fresh {
            return match self.ledger.release_claim(id, "claim too old to send safely") {
                Ok(_) => SendOutcome::Released,
                Err(e) if e.is_conflict() => {
                    log::warn!("{} lost the race on {id}: {e}", self.name);
                    SendOutcome::Conflict
                }
                Err(e) => {
                    log::error!("{} could not release {id}: {e}", self.name);
                    SendOutcome::Error
                }
            };
        }

        let timeout = self.config.send_timeout();
        let sent = match tokio::time::timeout(
            timeout,
            self.transport.send(&obligation.player_id, obligation.amount),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(timeout)),
        };

        let marked = match sent {
            Ok(receipt) => self
                .ledger
                .mark_paid(id, &receipt.reference)
                .map(|_| SendOutcome::Paid),
            Err(err) if err.is_permanent() => {
                log::error!("{} permanent transport error for {id}: {err}", self.name);
                self.ledger
                    .mark_failed(id, &err.to_string(), FailureDisposition::Escalate)
                    .map(|_| SendOutcome::Escalated)
            }
            Err(err) => {
                log::warn!("{} transient transport error for {id}: {err}", self.name);
                let mut delay = self.config.backoff_for(obligation.attempts + 1);
                if let Some(hint) = err.retry_after() {
                    delay = delay.max(hint);
                }
                let delay = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
                let not_before = self.ledger.clock().now() + delay;
                self.ledger
                    .mark_failed(id, &err.to_string(), FailureDisposition::Retry { not_before })
                    .map(|row| match row.status {
                        ObligationStatus::ManualReview => SendOutcome::Escalated,
                        _ => SendOutcome::Retrying,
                    })
            }
        };

        match marked {
            Ok(outcome) => outcome,
            Err(e) if e.is_conflict() => {
                log::warn!("{} lost the race on {id}: {e}", self.name);
                SendOutcome::Conflict
            }
            Err(e) => {
                log::error!("{} could not record result for {id}: {e}", self.name);
                SendOutcome::Error
            }
        }
    }

    /// Poll until `shutdown` flips to true (or its sender is dropped).
    /// Wakes on the polling interval and on every enqueue.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> DispatchSummary {
        let mut totals = DispatchSummary::default();
        let mut ticker = tokio::time::interval(self.config.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        let enqueued = Arc::clone(self.ledger.enqueued());
        log::info!("{} started", self.name);

        loop {
            if *shutdown.borrow() {
                break;
            }
            let full = match self.run_once().await {
                Ok(pass) => {
                    totals.absorb(&pass);
                    pass.claimed == self.claim_limit()
                }
                Err(e) => {
                    log::error!("{} dispatch pass failed: {e}", self.name);
                    false
                }
            };
            if full {
                // More may be waiting; go again without sleeping.
                continue;
            }
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {}
                _ = enqueued.notified() => {}
            }
        }

        log::info!(
            "{} stopped: {} paid, {} retrying, {} escalated",
            self.name, totals.paid, totals.retrying, totals.escalated
        );
        totals
    }

    /// Spawn `count` workers sharing this dispatcher's limiter.
    pub fn spawn_workers(
        &self,
        count: usize,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<JoinHandle<DispatchSummary>> {
        (0..count.max(1))
            .map(|i| tokio::spawn(self.worker(i).run(shutdown.clone())))
            .collect()
    }
}
