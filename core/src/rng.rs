//! Seeded randomness for simulation only.
//!
//! RULE: Production outcome codes come from the platform's RNG and are
//! opaque to the engine. Nothing here feeds a real round. These streams
//! drive the runner's simulated outcome source and simulated transport so
//! a run is reproducible from one seed.
//!
//! Each consumer gets its own stream, seeded from (master_seed XOR slot),
//! so adding a consumer never shifts an existing one.

use crate::{
    settlement::RoundInput,
    types::{Amount, OutcomeCode, PlayerId},
};
use rand::{RngCore, SeedableRng};
use rand_pcg::Pcg64Mcg;

pub struct OutcomeRng {
    inner: Pcg64Mcg,
}

impl OutcomeRng {
    pub fn new(seed: u64) -> Self {
        Self { inner: Pcg64Mcg::seed_from_u64(seed) }
    }

    /// Derive an independent stream for `slot` from the master seed.
    pub fn for_slot(master_seed: u64, slot: StreamSlot) -> Self {
        let derived = master_seed ^ (slot as u64).wrapping_mul(0x9e37_79b9_7f4a_7c15);
        Self::new(derived)
    }

    /// Roll a float in [0.0, 1.0).
    pub fn next_f64(&mut self) -> f64 {
        let bits = self.inner.next_u64();
        (bits >> 11) as f64 * (1.0 / (1u64 << 53) as f64)
    }

    /// Roll a u64 in [0, n).
    pub fn next_u64_below(&mut self, n: u64) -> u64 {
        assert!(n > 0, "n must be > 0");
        self.inner.next_u64() % n
    }

    /// Bernoulli trial: returns true with probability p.
    pub fn chance(&mut self, p: f64) -> bool {
        self.next_f64() < p
    }
}

/// Stable stream assignments. Append only.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u64)]
pub enum StreamSlot {
    Outcomes = 0,
    Transport = 1,
}

/// Stand-in for the platform's dice: uniform codes over a range,
/// spread across a fixed pool of players.
pub struct SimulatedOutcomeSource {
    rng: OutcomeRng,
    run_id: String,
    code_min: OutcomeCode,
    code_max: OutcomeCode,
    stake: Amount,
    players: Vec<PlayerId>,
    rounds: u64,
}

impl SimulatedOutcomeSource {
    pub fn new(
        master_seed: u64,
        run_id: impl Into<String>,
        (code_min, code_max): (OutcomeCode, OutcomeCode),
        stake: Amount,
        player_count: usize,
    ) -> Self {
        Self {
            rng: OutcomeRng::for_slot(master_seed, StreamSlot::Outcomes),
            run_id: run_id.into(),
            code_min,
            code_max,
            stake,
            players: (1..=player_count.max(1)).map(|i| format!("player-{i}")).collect(),
            rounds: 0,
        }
    }

    pub fn next_round(&mut self) -> RoundInput {
        self.rounds += 1;
        let span = (self.code_max - self.code_min) as u64 + 1;
        let code = self.code_min + self.rng.next_u64_below(span) as OutcomeCode;
        let player = self.rng.next_u64_below(self.players.len() as u64) as usize;
        RoundInput {
            round_id: Some(format!("{}-{}", self.run_id, self.rounds)),
            player_id: self.players[player].clone(),
            player_display_name: None,
            outcome_code: code,
            stake_amount: self.stake,
        }
    }
}
