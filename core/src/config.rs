//! Engine configuration.
//!
//! RULE: Configuration is loaded and validated once at startup.
//! Nothing downstream re-reads files or re-checks these invariants.

use crate::{
    error::{PayoutError, PayoutResult},
    types::{Amount, OutcomeCode},
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

// ── Outcome table ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutcomeEntryConfig {
    pub code: OutcomeCode,
    pub combination: String,
    pub payout: Amount,
    /// Design odds for this code. Uniform over the code range when absent.
    #[serde(default)]
    pub probability: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutcomeTableConfig {
    pub code_min: OutcomeCode,
    pub code_max: OutcomeCode,
    /// Price of one round, used as the RTP denominator.
    pub stake_cost: Amount,
    pub entries: Vec<OutcomeEntryConfig>,
}

impl Default for OutcomeTableConfig {
    /// The chat platform's slot machine: 64 faces, four jackpot rows.
    fn default() -> Self {
        let entry = |code, combination: &str, payout| OutcomeEntryConfig {
            code,
            combination: combination.to_string(),
            payout,
            probability: None,
        };
        Self {
            code_min: 1,
            code_max: 64,
            stake_cost: 3,
            entries: vec![
                entry(1, "bar-bar-bar", 30),
                entry(22, "grape-grape-grape", 20),
                entry(43, "lemon-lemon-lemon", 10),
                entry(64, "777", 100),
            ],
        }
    }
}

// ── Statistics ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatisticsConfig {
    /// Empirical RTP is unavailable below this many observed rounds.
    pub min_sample: u64,
}

impl Default for StatisticsConfig {
    fn default() -> Self {
        Self { min_sample: 100 }
    }
}

// ── Ledger ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LedgerConfig {
    /// Dispatch attempts before an obligation is parked in manual review.
    pub max_attempts: u32,
    /// A `processing` row older than this is considered abandoned.
    pub claim_stale_after_ms: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            claim_stale_after_ms: 120_000,
        }
    }
}

impl LedgerConfig {
    pub fn claim_stale_after(&self) -> Duration {
        Duration::from_millis(self.claim_stale_after_ms)
    }
}

// ── Dispatch ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DispatchConfig {
    pub poll_interval_ms: u64,
    pub batch_limit: usize,
    /// Concurrent sends per worker.
    pub parallelism: usize,
    /// Dispatcher loops to run side by side.
    pub workers: usize,
    /// Shared transport budget across all workers.
    pub rate_per_second: u32,
    pub burst: u32,
    pub send_timeout_ms: u64,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 3_000,
            batch_limit: 10,
            parallelism: 4,
            workers: 1,
            rate_per_second: 1,
            burst: 1,
            send_timeout_ms: 30_000,
            base_backoff_ms: 5_000,
            max_backoff_ms: 300_000,
        }
    }
}

impl DispatchConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn validate(&self) -> PayoutResult<()> {
        let invalid = |msg: &str| Err(PayoutError::InvalidConfig(msg.to_string()));
        if self.poll_interval_ms == 0 {
            return invalid("dispatch.poll_interval_ms must be non-zero");
        }
        if self.batch_limit == 0 || self.parallelism == 0 || self.workers == 0 {
            return invalid("dispatch batch_limit, parallelism and workers must be non-zero");
        }
        if self.rate_per_second == 0 || self.burst == 0 {
            return invalid("dispatch rate_per_second and burst must be non-zero");
        }
        if self.send_timeout_ms == 0 {
            return invalid("dispatch.send_timeout_ms must be non-zero");
        }
        if self.max_backoff_ms < self.base_backoff_ms {
            return invalid("dispatch.max_backoff_ms must be >= base_backoff_ms");
        }
        Ok(())
    }

    /// Exponential backoff for the given attempt count, capped.
    /// Attempt 1 waits `base`, attempt 2 waits `2 * base`, and so on.
    pub fn backoff_for(&self, attempts: u32) -> Duration {
        let exp = attempts.saturating_sub(1).min(20);
        let delay = self.base_backoff_ms.saturating_mul(1u64 << exp);
        Duration::from_millis(delay.min(self.max_backoff_ms))
    }
}

// ── Aggregate ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    pub outcomes: OutcomeTableConfig,
    pub statistics: StatisticsConfig,
    pub ledger: LedgerConfig,
    pub dispatch: DispatchConfig,
}

#[derive(Debug, Clone, Deserialize)]
struct PayoutConfigFile {
    #[serde(default)]
    statistics: StatisticsConfig,
    #[serde(default)]
    ledger: LedgerConfig,
    #[serde(default)]
    dispatch: DispatchConfig,
}

impl EngineConfig {
    pub fn load(data_dir: &str) -> anyhow::Result<Self> {
        let outcome_path = format!("{data_dir}/outcomes/outcome_table.json");
        let outcome_content = std::fs::read_to_string(&outcome_path)
            .map_err(|e| anyhow::anyhow!("Cannot read {outcome_path}: {e}"))?;
        let outcomes: OutcomeTableConfig = serde_json::from_str(&outcome_content)?;

        let payout_path = format!("{data_dir}/payouts/payout_config.json");
        let payout_content = std::fs::read_to_string(&payout_path)
            .map_err(|e| anyhow::anyhow!("Cannot read {payout_path}: {e}"))?;
        let payout_file: PayoutConfigFile = serde_json::from_str(&payout_content)?;

        let config = Self {
            outcomes,
            statistics: payout_file.statistics,
            ledger: payout_file.ledger,
            dispatch: payout_file.dispatch,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would make the engine misbehave at runtime.
    /// The outcome table itself is validated by `OutcomeTable::from_config`.
    pub fn validate(&self) -> PayoutResult<()> {
        let invalid = |msg: &str| Err(PayoutError::InvalidConfig(msg.to_string()));
        if self.ledger.max_attempts == 0 {
            return invalid("ledger.max_attempts must be at least 1");
        }
        self.dispatch.validate()?;
        if self.ledger.claim_stale_after_ms <= self.dispatch.send_timeout_ms {
            return invalid("ledger.claim_stale_after_ms must exceed dispatch.send_timeout_ms");
        }
        crate::outcome::OutcomeTable::from_config(&self.outcomes)?;
        Ok(())
    }
}
