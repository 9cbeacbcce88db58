//! Ledger audit events.
//!
//! RULE: Every ledger transition appends exactly one event, in the same
//! transaction as the row update. Variants are never removed or reordered.

use crate::{
    ledger::ObligationStatus,
    types::{Amount, ObligationId, PlayerId, RoundId},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PayoutEvent {
    ObligationEnqueued {
        obligation_id: ObligationId,
        round_id: Option<RoundId>,
        player_id: PlayerId,
        amount: Amount,
        combination: String,
    },
    ObligationClaimed {
        obligation_id: ObligationId,
        attempts: u32,
    },
    ObligationPaid {
        obligation_id: ObligationId,
        transport_reference: String,
        attempts: u32,
    },
    ObligationFailed {
        obligation_id: ObligationId,
        error: String,
        attempts: u32,
        next_attempt_at: Option<DateTime<Utc>>,
    },
    ObligationEscalated {
        obligation_id: ObligationId,
        error: String,
        attempts: u32,
    },
    ObligationReclaimed {
        obligation_id: ObligationId,
        claimed_at: Option<DateTime<Utc>>,
        status: ObligationStatus,
    },
    OperatorResolved {
        obligation_id: ObligationId,
        status: ObligationStatus,
        note: String,
    },
    /// A claim handed back unsent; no attempt was made.
    ClaimReleased {
        obligation_id: ObligationId,
        status: ObligationStatus,
        reason: String,
    },
}

impl PayoutEvent {
    /// Stable name for the event_type column.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::ObligationEnqueued { .. }  => "obligation_enqueued",
            Self::ObligationClaimed { .. }   => "obligation_claimed",
            Self::ObligationPaid { .. }      => "obligation_paid",
            Self::ObligationFailed { .. }    => "obligation_failed",
            Self::ObligationEscalated { .. } => "obligation_escalated",
            Self::ObligationReclaimed { .. } => "obligation_reclaimed",
            Self::OperatorResolved { .. }    => "operator_resolved",
            Self::ClaimReleased { .. }       => "claim_released",
        }
    }

    pub fn obligation_id(&self) -> &str {
        match self {
            Self::ObligationEnqueued { obligation_id, .. }
            | Self::ObligationClaimed { obligation_id, .. }
            | Self::ObligationPaid { obligation_id, .. }
            | Self::ObligationFailed { obligation_id, .. }
            | Self::ObligationEscalated { obligation_id, .. }
            | Self::ObligationReclaimed { obligation_id, .. }
            | Self::OperatorResolved { obligation_id, .. }
            | Self::ClaimReleased { obligation_id, .. } => obligation_id,
        }
    }
}

/// The event log entry as persisted to SQLite.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventLogEntry {
    pub id: Option<i64>,
    pub obligation_id: ObligationId,
    pub event_type: String,
    pub payload: String, // JSON-serialized PayoutEvent
    pub created_at: DateTime<Utc>,
}

impl EventLogEntry {
    pub fn decode(&self) -> serde_json::Result<PayoutEvent> {
        serde_json::from_str(&self.payload)
    }
}
