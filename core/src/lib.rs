//! Outcome resolution and payout settlement for chat-platform slot rounds.
//!
//! Data flow:
//!   round outcome -> OutcomeResolver -> (win) PayoutLedger::enqueue
//!   -> Dispatcher claim/send -> DisbursementTransport -> mark_paid | mark_failed
//!
//! The StatisticsAggregator observes every resolved outcome independently
//! of payment state.

pub mod clock;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod ledger;
pub mod outcome;
pub mod rng;
pub mod settlement;
pub mod statistics;
pub mod store;
pub mod transport;
pub mod types;

pub use crate::dispatcher::{DispatchSummary, Dispatcher};
pub use crate::error::{PayoutError, PayoutResult};
pub use crate::ledger::{
    FailureDisposition, ManualResolution, NewObligation, ObligationStatus, PayoutLedger,
    PayoutObligation,
};
pub use crate::outcome::{OutcomeResolver, OutcomeTable, ResolvedOutcome};
pub use crate::settlement::{RoundInput, RoundSettlement, SettledRound};
pub use crate::statistics::StatisticsAggregator;
pub use crate::transport::{DisbursementTransport, TransportError, TransportReceipt};
