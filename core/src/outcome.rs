//! Outcome resolution: maps an opaque outcome code to a combination.
//!
//! RULES:
//!   - The table is validated once, at construction. A resolver never
//!     sees a duplicate code or an entry outside the code range.
//!   - Codes inside the range but absent from the table are losses.
//!   - Codes outside the range are a configuration error, never a loss.
//!   - Every resolve() call is reported to the sink exactly once.

use crate::{
    clock::{Clock, SystemClock},
    config::OutcomeTableConfig,
    error::{PayoutError, PayoutResult},
    types::{Amount, OutcomeCode},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

/// Widest code range a table may declare. Statistics keep one counter per code.
pub const MAX_RANGE_LEN: OutcomeCode = 1 << 20;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Combination {
    pub label: String,
    pub payout: Amount,
}

/// A validated outcome table. Immutable after construction.
#[derive(Debug, Clone)]
pub struct OutcomeTable {
    code_min: OutcomeCode,
    code_max: OutcomeCode,
    stake_cost: Amount,
    combinations: BTreeMap<OutcomeCode, Combination>,
    /// Design odds per winning code.
    probabilities: BTreeMap<OutcomeCode, f64>,
}

impl OutcomeTable {
    pub fn from_config(config: &OutcomeTableConfig) -> PayoutResult<Self> {
        let invalid = |msg: String| Err(PayoutError::InvalidConfig(msg));
        if config.code_min > config.code_max {
            return invalid(format!(
                "outcome range {}..={} is empty",
                config.code_min, config.code_max
            ));
        }
        if config.code_max - config.code_min >= MAX_RANGE_LEN {
            return invalid(format!(
                "outcome range {}..={} wider than {MAX_RANGE_LEN} codes",
                config.code_min, config.code_max
            ));
        }
        if config.entries.is_empty() {
            return invalid("outcome table has no winning entries".into());
        }

        let range_len = (config.code_max - config.code_min) as f64 + 1.0;
        let mut combinations = BTreeMap::new();
        let mut probabilities = BTreeMap::new();
        let mut labels = HashSet::new();

        for entry in &config.entries {
            if entry.code < config.code_min || entry.code > config.code_max {
                return invalid(format!(
                    "outcome code {} outside range {}..={}",
                    entry.code, config.code_min, config.code_max
                ));
            }
            if entry.combination.trim().is_empty() {
                return invalid(format!("outcome code {} has an empty combination", entry.code));
            }
            if entry.payout == 0 {
                return invalid(format!("outcome code {} pays nothing", entry.code));
            }
            if !labels.insert(entry.combination.clone()) {
                return invalid(format!(
                    "combination '{}' mapped from more than one code",
                    entry.combination
                ));
            }
            let probability = entry.probability.unwrap_or(1.0 / range_len);
            if !(0.0..=1.0).contains(&probability) {
                return invalid(format!(
                    "outcome code {} has probability {probability} outside [0, 1]",
                    entry.code
                ));
            }
            let combination = Combination {
                label: entry.combination.clone(),
                payout: entry.payout,
            };
            if combinations.insert(entry.code, combination).is_some() {
                return invalid(format!("outcome code {} listed twice", entry.code));
            }
            probabilities.insert(entry.code, probability);
        }

        let total: f64 = probabilities.values().sum();
        if total > 1.0 + 1e-9 {
            return invalid(format!("winning probabilities sum to {total}, above 1"));
        }

        Ok(Self {
            code_min: config.code_min,
            code_max: config.code_max,
            stake_cost: config.stake_cost,
            combinations,
            probabilities,
        })
    }

    pub fn code_range(&self) -> (OutcomeCode, OutcomeCode) {
        (self.code_min, self.code_max)
    }

    pub fn stake_cost(&self) -> Amount {
        self.stake_cost
    }

    /// Look up a code. `Ok(None)` is a loss; out-of-range is an error.
    pub fn lookup(&self, code: OutcomeCode) -> PayoutResult<Option<&Combination>> {
        if code < self.code_min || code > self.code_max {
            return Err(PayoutError::OutcomeOutOfRange {
                code,
                min: self.code_min,
                max: self.code_max,
            });
        }
        Ok(self.combinations.get(&code))
    }

    pub fn payout_for(&self, code: OutcomeCode) -> Amount {
        self.combinations.get(&code).map_or(0, |c| c.payout)
    }

    pub fn combinations(&self) -> &BTreeMap<OutcomeCode, Combination> {
        &self.combinations
    }

    pub fn max_payout(&self) -> Amount {
        self.combinations.values().map(|c| c.payout).max().unwrap_or(0)
    }

    pub fn min_payout(&self) -> Amount {
        self.combinations.values().map(|c| c.payout).min().unwrap_or(0)
    }

    pub fn winning_combination_count(&self) -> usize {
        self.combinations.len()
    }

    /// Design-odds RTP as a percentage, rounded to two decimals.
    /// `None` when the stake cost is zero.
    pub fn theoretical_rtp(&self) -> Option<f64> {
        if self.stake_cost == 0 {
            return None;
        }
        let expected: f64 = self
            .probabilities
            .iter()
            .map(|(code, p)| p * self.payout_for(*code) as f64)
            .sum();
        Some(round2(expected / self.stake_cost as f64 * 100.0))
    }
}

pub(crate) fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// One round's resolution. Produced once, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedOutcome {
    pub outcome_code: OutcomeCode,
    pub combination: Option<String>,
    pub is_win: bool,
    pub payout: Amount,
    pub stake_amount: Amount,
    pub timestamp: DateTime<Utc>,
}

/// Receives every resolved outcome. Must not block or fail.
pub trait OutcomeSink: Send + Sync {
    fn record(&self, outcome: &ResolvedOutcome);
}

/// A sink that drops everything.
pub struct NullSink;

impl OutcomeSink for NullSink {
    fn record(&self, _outcome: &ResolvedOutcome) {}
}

pub struct OutcomeResolver {
    table: Arc<OutcomeTable>,
    sink: Arc<dyn OutcomeSink>,
    clock: Arc<dyn Clock>,
}

impl OutcomeResolver {
    pub fn new(table: Arc<OutcomeTable>, sink: Arc<dyn OutcomeSink>) -> Self {
        Self {
            table,
            sink,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn table(&self) -> &Arc<OutcomeTable> {
        &self.table
    }

    /// Resolve one round. The stake is carried through for accounting
    /// only; it never influences the combination or the payout.
    pub fn resolve(&self, code: OutcomeCode, stake_amount: Amount) -> PayoutResult<ResolvedOutcome> {
        let combination = match self.table.lookup(code) {
            Ok(c) => c,
            Err(e) => {
                log::error!("Outcome code {code} rejected: {e}");
                return Err(e);
            }
        };
        let outcome = ResolvedOutcome {
            outcome_code: code,
            combination: combination.map(|c| c.label.clone()),
            is_win: combination.is_some(),
            payout: combination.map_or(0, |c| c.payout),
            stake_amount,
            timestamp: self.clock.now(),
        };
        self.sink.record(&outcome);
        Ok(outcome)
    }

    pub fn theoretical_rtp(&self) -> Option<f64> {
        self.table.theoretical_rtp()
    }
}
