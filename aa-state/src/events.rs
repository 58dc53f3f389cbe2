//! Local events emitted by the engine.
//!
//! Events are emitted after the state change they describe has committed
//! and the engine lock has been released. Subscribers either receive every
//! event or only those concerning one AA.

use aa_ledger::{AaDefinition, AaRequest, AaResponse};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::trace;

use crate::oracle::OracleKey;

/// Engine events.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// A request was estimated and queued
    RequestApplied {
        aa_address: String,
        request: Arc<AaRequest>,
    },
    /// A confirmed response was applied and the upcoming view rebuilt
    ResponseApplied {
        aa_address: String,
        response: Arc<AaResponse>,
    },
    /// An AA definition was published
    DefinitionApplied {
        definition: AaDefinition,
        /// Unit carrying the definition
        unit: String,
    },
    /// Feed values changed
    OraclesUpdated { oracles: Vec<OracleKey> },
}

impl EngineEvent {
    /// The AA an event is about, for per-agent delivery.
    ///
    /// Definitions are delivered to subscribers of their base AA.
    pub fn agent(&self) -> Option<&str> {
        match self {
            Self::RequestApplied { aa_address, .. } | Self::ResponseApplied { aa_address, .. } => {
                Some(aa_address.as_str())
            }
            Self::DefinitionApplied { definition, .. } => definition.base_aa.as_deref(),
            Self::OraclesUpdated { .. } => None,
        }
    }
}

/// Event bus for broadcasting engine events.
pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    /// Create a new event bus with default capacity
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    /// Create a new event bus with specified capacity
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Emit an event to all subscribers
    pub fn emit(&self, event: EngineEvent) {
        trace!(event = ?event, "Emitting engine event");
        // No subscribers is fine
        let _ = self.sender.send(event);
    }

    /// Subscribe to every event
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }

    /// Subscribe to events about one AA
    pub fn subscribe_agent(&self, aa_address: impl Into<String>) -> AgentSubscription {
        AgentSubscription {
            aa_address: aa_address.into(),
            receiver: self.sender.subscribe(),
        }
    }

    /// Get the number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiver filtered to one AA.
pub struct AgentSubscription {
    aa_address: String,
    receiver: broadcast::Receiver<EngineEvent>,
}

impl AgentSubscription {
    /// Address this subscription follows.
    pub fn aa_address(&self) -> &str {
        &self.aa_address
    }

    /// Next event about the AA.
    pub async fn recv(&mut self) -> Result<EngineEvent, broadcast::error::RecvError> {
        loop {
            let event = self.receiver.recv().await?;
            if event.agent() == Some(self.aa_address.as_str()) {
                return Ok(event);
            }
        }
    }

    /// Next event about the AA if one is already buffered.
    pub fn try_recv(&mut self) -> Result<EngineEvent, broadcast::error::TryRecvError> {
        loop {
            let event = self.receiver.try_recv()?;
            if event.agent() == Some(self.aa_address.as_str()) {
                return Ok(event);
            }
        }
    }
}
