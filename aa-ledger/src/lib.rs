//! AA Ledger - ledger-facing model and collaborators
//!
//! Everything the speculative state engine needs from the outside world:
//! - Wire model for units, messages and AA request/response notifications
//! - The mutable estimation context (state variables and balances)
//! - Trait seams for the ledger accessor, the estimator and data feeds
//! - A light-vendor client with bounded retries and paginated reads
//! - A TTL-cached token registry
//! - In-memory mocks for tests
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐      ┌──────────────────┐
//! │  LightClient<T>  │─────▶│ VendorTransport  │
//! │ (LedgerAccessor) │      │ (request/reply)  │
//! └────────┬─────────┘      └──────────────────┘
//!          │ RetryPolicy
//!          ▼
//! ┌──────────────────┐
//! │  TokenRegistry   │
//! └──────────────────┘
//! ```

pub mod client;
pub mod context;
pub mod mock;
pub mod registry;
pub mod retry;
pub mod traits;
pub mod types;

// Re-export main types for convenience
pub use client::{LightClient, LightClientConfig};
pub use context::{
    AddressBalance, AddressBalances, AgentStateVars, Balances, BalancesByAgent, StateSnapshot, StateVar, StateVarEntry,
    StateVarsByAgent, BASE_ASSET,
};
pub use registry::{RegistryError, TokenRegistry, TokenRegistryConfig};
pub use retry::{RetryConfig, RetryPolicy};
pub use traits::{
    DataFeedReader, Estimator, EstimatorError, LedgerAccessor, LedgerError, TransportError,
    VendorTransport,
};
pub use types::*;
