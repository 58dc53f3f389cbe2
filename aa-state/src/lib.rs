//! AA State - confirmed and speculative state of autonomous agents
//!
//! Light clients see AA requests long before the ledger confirms them. This
//! crate keeps two views of every followed AA:
//!
//! - **Confirmed**: state variables and balances as last reported by the ledger
//! - **Upcoming**: confirmed state plus the estimated effect of every request
//!   still waiting for confirmation, replayed in broadcast order
//!
//! Along the way it:
//! - Records each estimate and compares it with the confirmed response
//! - Caches data feeds with a short history for replaying older triggers
//! - Emits local events once a change has committed
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────┐   Notification   ┌──────────────────────────────────────┐
//! │   Transport   │─────────────────▶│            AaStateEngine             │
//! └───────────────┘  spawn_ingestion │                                      │
//!                                    │  Mutex<EngineState>                  │
//!                                    │  ┌────────────┐  ┌────────────────┐  │
//!                                    │  │ StateStore │  │  PendingQueue  │  │
//!                                    │  └─────┬──────┘  └───────┬────────┘  │
//!                                    │        └──── replay ─────┘           │
//!                                    │  ┌────────────┐  ┌────────────────┐  │
//!                                    │  │  Verifier  │  │  OracleCache   │  │
//!                                    │  └────────────┘  └────────────────┘  │
//!                                    └──────┬──────────────────┬────────────┘
//!                                           │                  │ EngineEvent
//!                              LedgerAccessor / Estimator      ▼
//!                                                          EventBus
//! ```

pub mod config;
pub mod engine;
pub mod events;
pub mod ingestion;
pub mod oracle;
pub mod queue;
pub mod store;
pub mod types;
pub mod verifier;

// Re-export main types
pub use config::{EngineConfig, EventsConfig, OracleConfig, VerificationConfig};
pub use engine::{AaStateEngine, EngineState};
pub use events::{AgentSubscription, EngineEvent, EventBus};
pub use ingestion::{dispatch, spawn_ingestion, Notification};
pub use oracle::{Oracle, OracleCache, OracleKey};
pub use types::*;
pub use verifier::{max_difference, ExpectedResponse, ResponseEssentials, VerificationReport};
