//! Inbound notifications and the dispatch loop.
//!
//! The transport delivers `(subject, body)` pairs using light-client
//! subjects. They are decoded into [`Notification`]s and applied to the
//! engine one at a time, in arrival order.

use aa_ledger::{AaRequest, AaResponse, Unit};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::engine::AaStateEngine;
use crate::types::{EngineError, Result};

/// Subject of request notifications.
pub const SUBJECT_AA_REQUEST: &str = "light/aa_request";
/// Subject of response notifications.
pub const SUBJECT_AA_RESPONSE: &str = "light/aa_response";
/// Subject of definition notifications.
pub const SUBJECT_AA_DEFINITION: &str = "light/aa_definition";
/// Subject of new unit notifications.
pub const SUBJECT_JOINT: &str = "joint";

/// A notification the engine reacts to.
#[derive(Debug, Clone)]
pub enum Notification {
    /// A request to an AA was broadcast
    AaRequest(AaRequest),
    /// A response was confirmed
    AaResponse(Box<AaResponse>),
    /// A unit carrying AA definitions
    AaDefinition(Unit),
    /// A new unit, possibly carrying feed values
    NewUnit(Unit),
}

impl Notification {
    /// Decode a transport message. Subjects the engine does not handle
    /// yield `None`.
    pub fn from_message(subject: &str, body: Value) -> Result<Option<Self>> {
        let notification = match subject {
            SUBJECT_AA_REQUEST => Self::AaRequest(decode(subject, body)?),
            SUBJECT_AA_RESPONSE => Self::AaResponse(Box::new(decode(subject, body)?)),
            SUBJECT_AA_DEFINITION => Self::AaDefinition(decode(subject, body)?),
            SUBJECT_JOINT => {
                let unit = body.get("unit").cloned().ok_or_else(|| {
                    EngineError::MalformedNotification(format!("{}: no unit in joint", subject))
                })?;
                Self::NewUnit(decode(subject, unit)?)
            }
            _ => return Ok(None),
        };
        Ok(Some(notification))
    }
}

fn decode<T: serde::de::DeserializeOwned>(subject: &str, body: Value) -> Result<T> {
    serde_json::from_value(body)
        .map_err(|e| EngineError::MalformedNotification(format!("{}: {}", subject, e)))
}

/// Apply one notification.
pub async fn dispatch(engine: &AaStateEngine, notification: Notification) -> Result<()> {
    match notification {
        Notification::AaRequest(request) => {
            let outcome = engine.enqueue(request).await?;
            debug!(outcome = ?outcome, "Request handled");
        }
        Notification::AaResponse(response) => {
            let outcome = engine.on_confirmed(*response).await?;
            debug!(trimmed = outcome.trimmed.len(), repeated = outcome.repeated, "Response handled");
        }
        Notification::AaDefinition(unit) => {
            engine.on_definition(&unit).await?;
        }
        Notification::NewUnit(unit) => {
            engine.on_new_unit(&unit).await;
        }
    }
    Ok(())
}

/// Run the dispatch loop on a background task.
///
/// Malformed notifications are logged and dropped. Any other error stops
/// the loop and is returned from the task so it cannot go unnoticed.
pub fn spawn_ingestion(
    engine: Arc<AaStateEngine>,
    mut receiver: mpsc::Receiver<Notification>,
) -> JoinHandle<Result<()>> {
    tokio::spawn(async move {
        info!("Notification ingestion started");
        while let Some(notification) = receiver.recv().await {
            match dispatch(&engine, notification).await {
                Ok(()) => {}
                Err(e) if e.is_malformed() => {
                    warn!(error = %e, "Dropping malformed notification");
                }
                Err(e) => {
                    error!(error = %e, "Notification ingestion stopped");
                    return Err(e);
                }
            }
        }
        info!("Notification channel closed");
        Ok(())
    })
}
