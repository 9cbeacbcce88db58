//! Statistics aggregation: observed outcome frequencies and empirical RTP.
//!
//! RULES:
//!   - record() never fails and never takes a lock. Losing an increment
//!     on crash is acceptable; payout correctness never depends on it.
//!   - Counters only go up. The RTP calculator reads them, never writes.
//!   - Payout-table accessors read the static table, not live counts.

use crate::{
    config::StatisticsConfig,
    outcome::{round2, Combination, OutcomeSink, OutcomeTable, ResolvedOutcome},
    types::{Amount, OutcomeCode},
};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub struct StatisticsAggregator {
    table: Arc<OutcomeTable>,
    config: StatisticsConfig,
    code_min: OutcomeCode,
    /// One counter per code in the table's range, indexed from code_min.
    counts: Vec<AtomicU64>,
    total: AtomicU64,
}

impl StatisticsAggregator {
    pub fn new(table: Arc<OutcomeTable>, config: StatisticsConfig) -> Self {
        let (code_min, code_max) = table.code_range();
        let len = (code_max - code_min) as usize + 1;
        Self {
            table,
            config,
            code_min,
            counts: (0..len).map(|_| AtomicU64::new(0)).collect(),
            total: AtomicU64::new(0),
        }
    }

    /// Seed counters from a persisted snapshot. Codes outside the
    /// table's range are dropped with a warning.
    pub fn with_counts(
        table: Arc<OutcomeTable>,
        config: StatisticsConfig,
        counts: &BTreeMap<OutcomeCode, u64>,
    ) -> Self {
        let aggregator = Self::new(table, config);
        for (&code, &n) in counts {
            match aggregator.slot(code) {
                Some(slot) => {
                    slot.fetch_add(n, Ordering::Relaxed);
                    aggregator.total.fetch_add(n, Ordering::Relaxed);
                }
                None => log::warn!("Dropping persisted count for out-of-range code {code}"),
            }
        }
        aggregator
    }

    fn slot(&self, code: OutcomeCode) -> Option<&AtomicU64> {
        code.checked_sub(self.code_min)
            .and_then(|i| self.counts.get(i as usize))
    }

    pub fn record(&self, outcome: &ResolvedOutcome) {
        match self.slot(outcome.outcome_code) {
            Some(slot) => {
                slot.fetch_add(1, Ordering::Relaxed);
                self.total.fetch_add(1, Ordering::Relaxed);
            }
            None => log::debug!("Ignoring statistics for unknown code {}", outcome.outcome_code),
        }
    }

    pub fn total_observed(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn occurrences(&self, code: OutcomeCode) -> u64 {
        self.slot(code).map_or(0, |s| s.load(Ordering::Relaxed))
    }

    /// Non-zero counters, keyed by outcome code.
    pub fn snapshot(&self) -> BTreeMap<OutcomeCode, u64> {
        self.counts
            .iter()
            .enumerate()
            .filter_map(|(i, c)| {
                let n = c.load(Ordering::Relaxed);
                (n > 0).then(|| (self.code_min + i as OutcomeCode, n))
            })
            .collect()
    }

    /// Observed RTP as a percentage, rounded to two decimals.
    /// `None` until `min_sample` rounds have been seen.
    pub fn empirical_rtp(&self) -> Option<f64> {
        // Denominator comes from the same reads as the numerators.
        let observed: Vec<(OutcomeCode, u64)> = self
            .counts
            .iter()
            .enumerate()
            .map(|(i, c)| (self.code_min + i as OutcomeCode, c.load(Ordering::Relaxed)))
            .collect();
        let total: u64 = observed.iter().map(|(_, n)| n).sum();
        let stake = self.table.stake_cost();
        if total < self.config.min_sample || total == 0 || stake == 0 {
            return None;
        }
        let expected: f64 = observed
            .iter()
            .map(|&(code, n)| (n as f64 / total as f64) * self.table.payout_for(code) as f64)
            .sum();
        Some(round2(expected / stake as f64 * 100.0))
    }

    pub fn theoretical_rtp(&self) -> Option<f64> {
        self.table.theoretical_rtp()
    }

    pub fn payout_table(&self) -> &BTreeMap<OutcomeCode, Combination> {
        self.table.combinations()
    }

    pub fn max_payout(&self) -> Amount {
        self.table.max_payout()
    }

    pub fn min_payout(&self) -> Amount {
        self.table.min_payout()
    }

    pub fn winning_combination_count(&self) -> usize {
        self.table.winning_combination_count()
    }
}

impl OutcomeSink for StatisticsAggregator {
    fn record(&self, outcome: &ResolvedOutcome) {
        StatisticsAggregator::record(self, outcome);
    }
}
