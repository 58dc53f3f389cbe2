//! Collaborator traits for the state engine.
//!
//! The engine never talks to the network or runs AA code itself. It goes
//! through these seams:
//! - [`LedgerAccessor`] reads authoritative state and registers watches
//! - [`Estimator`] predicts the effect of a trigger on a state snapshot
//! - [`DataFeedReader`] supplies oracle values to the estimator
//! - [`VendorTransport`] carries light-client requests to a vendor

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::context::{AddressBalances, Balances, StateSnapshot};
use crate::types::{AaDefinition, AaResponse, Unit};

/// Errors from the transport layer.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TransportError {
    /// Could not reach the vendor
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// The vendor did not answer in time
    #[error("Request timed out")]
    Timeout,

    /// The vendor answered with an error
    #[error("Vendor error: {0}")]
    Vendor(String),
}

impl TransportError {
    /// Whether retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::ConnectionFailed(_) | Self::Timeout => true,
            Self::Vendor(message) => {
                message.starts_with("[internal]")
                    || message.starts_with("[connect to light vendor failed]")
            }
        }
    }
}

/// Errors from ledger reads.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    /// Transport failed and was not retried
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Transient failures persisted past the retry ceiling
    #[error("{command} failed after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        command: String,
        attempts: u32,
        last_error: TransportError,
    },

    /// The requested object does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Params were requested from an AA without a base AA
    #[error("Not a parameterized AA: {0}")]
    NotParameterized(String),

    /// The vendor answered with something we cannot decode
    #[error("Invalid response to {command}: {reason}")]
    InvalidResponse { command: String, reason: String },
}

/// Errors from the estimator.
#[derive(Debug, thiserror::Error)]
pub enum EstimatorError {
    /// The AA definition is not available
    #[error("Unknown AA: {0}")]
    UnknownAa(String),

    /// A data feed the AA reads is not available
    #[error("Data feed not found: {oracles:?}:{feed_name}")]
    DataFeedNotFound {
        oracles: Vec<String>,
        feed_name: String,
    },

    /// Evaluation failed
    #[error("Evaluation failed: {0}")]
    Evaluation(String),

    /// Reading the ledger failed during estimation
    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),
}

/// Read access to the authoritative ledger.
#[async_trait]
pub trait LedgerAccessor: Send + Sync {
    /// Read all state variables of an AA whose names start with `prefix`.
    async fn read_state_vars(&self, aa_address: &str, prefix: &str)
        -> Result<Map<String, Value>, LedgerError>;

    /// Read a single state variable.
    async fn read_state_var(&self, aa_address: &str, name: &str)
        -> Result<Option<Value>, LedgerError> {
        let mut vars = self.read_state_vars(aa_address, name).await?;
        Ok(vars.remove(name))
    }

    /// Read the balances of an AA.
    async fn read_balances(&self, aa_address: &str) -> Result<Balances, LedgerError>;

    /// Read the balances of a plain address, which may hold unconfirmed outputs.
    async fn read_address_balances(&self, address: &str) -> Result<AddressBalances, LedgerError>;

    /// Read the latest value of a data feed, `None` if the feed does not exist.
    async fn read_data_feed(&self, oracle: &str, feed_name: &str)
        -> Result<Option<Value>, LedgerError>;

    /// Load an AA definition, making sure its base AA is known as well.
    async fn load_definition(&self, aa_address: &str) -> Result<AaDefinition, LedgerError>;

    /// Params of a parameterized AA.
    async fn read_aa_params(&self, aa_address: &str) -> Result<Value, LedgerError> {
        let definition = self.load_definition(aa_address).await?;
        if definition.base_aa.is_none() {
            return Err(LedgerError::NotParameterized(aa_address.to_string()));
        }
        Ok(definition
            .params()
            .cloned()
            .unwrap_or_else(|| Value::Object(Map::new())))
    }

    /// Run a getter of an AA.
    async fn execute_getter(&self, aa_address: &str, getter: &str, args: &[Value])
        -> Result<Value, LedgerError>;

    /// Find AAs parameterized from any of the given base AAs.
    async fn get_aas_by_base_aas(&self, base_aas: &[String])
        -> Result<Vec<AaDefinition>, LedgerError>;

    /// Ask for request, response and definition notifications about an AA.
    async fn watch_aa(&self, aa_address: &str) -> Result<(), LedgerError>;

    /// Ask for new units authored by an address.
    async fn watch_address(&self, address: &str) -> Result<(), LedgerError>;
}

/// Source of data feed values for the estimator.
pub trait DataFeedReader: Send + Sync {
    /// Value posted by the first matching oracle, as of `as_of` when given.
    fn read_data_feed(&self, oracles: &[String], feed_name: &str, as_of: Option<u64>)
        -> Option<Value>;
}

/// Deterministic evaluator of AA executions.
#[async_trait]
pub trait Estimator: Send + Sync {
    /// Estimate the effect of `trigger` sent to `aa_address`, applying it to
    /// `context` in place. The primary response comes first.
    async fn estimate_primary_trigger(
        &self,
        trigger: &Unit,
        aa_address: &str,
        context: &mut StateSnapshot,
        feeds: &dyn DataFeedReader,
    ) -> Result<Vec<AaResponse>, EstimatorError>;

    /// Convert a value reported by the ledger into the evaluator's type system.
    fn coerce_value(&self, value: &Value) -> Value {
        value.clone()
    }
}

/// Request/response channel to a light vendor.
#[async_trait]
pub trait VendorTransport: Send + Sync {
    /// Send a command and wait for the reply.
    async fn request(&self, command: &str, params: Value) -> Result<Value, TransportError>;
}
