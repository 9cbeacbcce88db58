use crate::ledger::ObligationStatus;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PayoutError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Outcome code {code} outside configured range {min}..={max}")]
    OutcomeOutOfRange { code: u32, min: u32, max: u32 },

    #[error("Invalid payout amount {amount}: must be positive and fit the ledger")]
    InvalidAmount { amount: u64 },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Obligation '{id}' not found")]
    ObligationNotFound { id: String },

    #[error("Obligation '{id}' is {actual}, expected {expected}")]
    StatusConflict {
        id: String,
        expected: ObligationStatus,
        actual: ObligationStatus,
    },

    #[error("Round '{round_id}' already settled with a different obligation")]
    RoundConflict { round_id: String },

    #[error("Ledger store lock poisoned")]
    StorePoisoned,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PayoutError {
    /// Conflicts are expected under concurrent dispatch; the losing
    /// operation is rejected and the ledger row stays untouched.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::StatusConflict { .. } | Self::RoundConflict { .. })
    }
}

pub type PayoutResult<T> = Result<T, PayoutError>;
