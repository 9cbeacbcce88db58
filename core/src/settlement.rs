//! Round settlement: the inline path from an outcome to a ledger row.
//!
//! A win is confirmed to the player as soon as settle() returns; delivery
//! happens later through the dispatcher and never feeds back into the
//! game result.

use crate::{
    error::PayoutResult,
    ledger::{NewObligation, PayoutLedger, PayoutObligation},
    outcome::{OutcomeResolver, ResolvedOutcome},
    types::{Amount, OutcomeCode, PlayerId, RoundId},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// One round as delivered by the outcome source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundInput {
    /// Idempotency key; redelivery of the same round never pays twice.
    pub round_id: Option<RoundId>,
    pub player_id: PlayerId,
    #[serde(default)]
    pub player_display_name: Option<String>,
    pub outcome_code: OutcomeCode,
    pub stake_amount: Amount,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SettledRound {
    pub outcome: ResolvedOutcome,
    /// Present exactly when the outcome is a win.
    pub obligation: Option<PayoutObligation>,
}

pub struct RoundSettlement {
    resolver: OutcomeResolver,
    ledger: Arc<PayoutLedger>,
}

impl RoundSettlement {
    pub fn new(resolver: OutcomeResolver, ledger: Arc<PayoutLedger>) -> Self {
        Self { resolver, ledger }
    }

    pub fn resolver(&self) -> &OutcomeResolver {
        &self.resolver
    }

    pub fn ledger(&self) -> &Arc<PayoutLedger> {
        &self.ledger
    }

    pub fn settle(&self, round: &RoundInput) -> PayoutResult<SettledRound> {
        let outcome = self.resolver.resolve(round.outcome_code, round.stake_amount)?;
        let Some(combination) = outcome.combination.clone() else {
            return Ok(SettledRound { outcome, obligation: None });
        };

        let mut request = NewObligation::new(round.player_id.clone(), outcome.payout, combination);
        request.round_id = round.round_id.clone();
        request.player_display_name = round.player_display_name.clone();
        let obligation = self.ledger.enqueue(request)?;

        Ok(SettledRound {
            outcome,
            obligation: Some(obligation),
        })
    }
}
