//! Shared primitive types used across the engine.

/// Opaque integer produced by the external random source for one round.
pub type OutcomeCode = u32;

/// Reward-currency units. Stakes and payouts are whole numbers.
pub type Amount = u64;

/// Surrogate key of a ledger row (UUID v4, stored as text).
pub type ObligationId = String;

/// Opaque external player identifier.
pub type PlayerId = String;

/// Idempotency key supplied by the outcome source.
pub type RoundId = String;
