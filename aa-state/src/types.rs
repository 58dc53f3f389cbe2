//! Core types for the state engine.

use aa_ledger::{AaRequest, EstimatorError, LedgerError, Unit};
use serde::{Deserialize, Serialize};

use crate::verifier::VerificationReport;

/// A request sent to an AA whose confirmation has not been seen yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingTrigger {
    /// Unit hash of the trigger; unique within the queue
    pub unit_id: String,
    /// Target AA
    pub aa_address: String,
    /// The triggering unit
    pub unit: Unit,
}

impl From<AaRequest> for PendingTrigger {
    fn from(request: AaRequest) -> Self {
        Self {
            unit_id: request.unit.unit.clone(),
            aa_address: request.aa_address,
            unit: request.unit,
        }
    }
}

/// What `enqueue` did with a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Estimated and appended to the queue
    Queued,
    /// A trigger with the same unit is already queued
    Duplicate,
    /// The unit carries no messages (final-bad)
    NoMessages,
}

/// What `on_confirmed` did with a response.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfirmationOutcome {
    /// Triggers dropped from the head of the queue
    pub trimmed: Vec<String>,
    /// The response repeats the previous causal chain
    pub repeated: bool,
    /// Comparison with the prediction, when one was recorded
    pub verification: Option<VerificationReport>,
}

/// Error types for the state engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Ledger access failed
    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    /// The estimator failed; the upcoming view may be stale
    #[error("Estimator error: {0}")]
    Estimator(#[from] EstimatorError),

    /// A notification could not be applied as received
    #[error("Malformed notification: {0}")]
    MalformedNotification(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl EngineError {
    /// Whether the error only concerns the notification that caused it.
    pub fn is_malformed(&self) -> bool {
        matches!(self, Self::MalformedNotification(_))
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
