//! Wire model for ledger units and AA notifications.
//!
//! Field names follow the light-client protocol so notification bodies can be
//! deserialized directly.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

use crate::context::Balances;

/// App name of payment messages.
pub const APP_PAYMENT: &str = "payment";
/// App name of data feed messages posted by oracles.
pub const APP_DATA_FEED: &str = "data_feed";
/// App name of definition messages.
pub const APP_DEFINITION: &str = "definition";

/// An address that authored a unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Author {
    /// Author address
    pub address: String,
}

/// A message inside a unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Application type (`payment`, `data`, `data_feed`, `definition`, ...)
    pub app: String,
    /// Where the payload lives (`inline` for everything we handle)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload_location: Option<String>,
    /// Hash of the payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload_hash: Option<String>,
    /// Message payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl Message {
    /// Create an inline message.
    pub fn inline(app: impl Into<String>, payload: Value) -> Self {
        Self {
            app: app.into(),
            payload_location: Some("inline".to_string()),
            payload_hash: None,
            payload: Some(payload),
        }
    }

    /// Create a payment message.
    pub fn payment(asset: Option<&str>, outputs: Vec<PaymentOutput>) -> Self {
        let payload = PaymentPayload {
            asset: asset.map(String::from),
            outputs,
        };
        Self::inline(
            APP_PAYMENT,
            serde_json::to_value(payload).unwrap_or_default(),
        )
    }

    /// Decode the payload of a payment message.
    pub fn payment_payload(&self) -> Option<PaymentPayload> {
        if self.app != APP_PAYMENT {
            return None;
        }
        self.payload
            .as_ref()
            .and_then(|p| serde_json::from_value(p.clone()).ok())
    }
}

/// Payload of a payment message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentPayload {
    /// Asset being paid, `None` for the base asset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset: Option<String>,
    /// Outputs of the payment
    #[serde(default)]
    pub outputs: Vec<PaymentOutput>,
}

/// A single payment output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentOutput {
    /// Receiving address
    pub address: String,
    /// Amount in the smallest unit of the asset
    pub amount: u64,
}

impl PaymentOutput {
    /// Create an output.
    pub fn new(address: impl Into<String>, amount: u64) -> Self {
        Self {
            address: address.into(),
            amount,
        }
    }
}

/// A ledger unit (transaction).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Unit {
    /// Unit hash
    pub unit: String,
    /// Authors of the unit
    #[serde(default)]
    pub authors: Vec<Author>,
    /// Messages carried by the unit; empty for final-bad units
    #[serde(default)]
    pub messages: Vec<Message>,
    /// Unit timestamp (seconds)
    #[serde(default)]
    pub timestamp: u64,
}

impl Unit {
    /// Create a unit with the given hash and messages.
    pub fn new(unit: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            unit: unit.into(),
            authors: vec![],
            messages,
            timestamp: 0,
        }
    }

    /// Add an author.
    pub fn with_author(mut self, address: impl Into<String>) -> Self {
        self.authors.push(Author {
            address: address.into(),
        });
        self
    }

    /// Set the timestamp.
    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Whether the given address authored this unit.
    pub fn is_authored_by(&self, address: &str) -> bool {
        self.authors.iter().any(|a| a.address == address)
    }

    /// Whether the unit carries at least one data feed message.
    pub fn has_data_feed(&self) -> bool {
        self.messages.iter().any(|m| m.app == APP_DATA_FEED)
    }

    /// Look up a feed value posted in this unit.
    pub fn data_feed_value(&self, feed_name: &str) -> Option<&Value> {
        self.messages
            .iter()
            .filter(|m| m.app == APP_DATA_FEED)
            .filter_map(|m| m.payload.as_ref())
            .find_map(|p| p.get(feed_name))
    }

    /// AA definitions published in this unit.
    pub fn definitions(&self) -> Vec<AaDefinition> {
        self.messages
            .iter()
            .filter(|m| m.app == APP_DEFINITION)
            .filter_map(|m| m.payload.as_ref())
            .filter_map(AaDefinition::from_payload)
            .collect()
    }
}

/// A request to an AA seen on the network but not yet confirmed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AaRequest {
    /// Target AA
    pub aa_address: String,
    /// The triggering unit
    pub unit: Unit,
}

impl AaRequest {
    /// Create a request notification.
    pub fn new(aa_address: impl Into<String>, unit: Unit) -> Self {
        Self {
            aa_address: aa_address.into(),
            unit,
        }
    }

    /// Unit hash of the trigger.
    pub fn unit_id(&self) -> &str {
        &self.unit.unit
    }
}

/// An update of a single state variable as reported by the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VarUpdate {
    /// New value; `false` means the variable was deleted
    pub value: Value,
    /// Previous value, when reported
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_value: Option<Value>,
}

impl VarUpdate {
    /// Create an update setting a value.
    pub fn set(value: impl Into<Value>) -> Self {
        Self {
            value: value.into(),
            old_value: None,
        }
    }

    /// Create an update deleting the variable.
    pub fn delete() -> Self {
        Self {
            value: Value::Bool(false),
            old_value: None,
        }
    }

    /// Whether this update deletes the variable.
    pub fn is_deletion(&self) -> bool {
        self.value == Value::Bool(false)
    }
}

/// Response variables and error of an AA response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseBody {
    /// Variables set via `response[...]`
    #[serde(
        rename = "responseVars",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub response_vars: Option<Map<String, Value>>,
    /// Bounce message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// The outcome of an AA execution, authoritative when it comes from the ledger
/// and predicted when it comes from the estimator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AaResponse {
    /// Main chain index of the trigger
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mci: Option<u64>,
    /// Address that sent the trigger
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_address: Option<String>,
    /// Unit that triggered this execution
    pub trigger_unit: String,
    /// First unit of the causal chain this execution belongs to
    pub trigger_initial_unit: String,
    /// Executed AA
    pub aa_address: String,
    /// Whether the AA bounced
    #[serde(default)]
    pub bounced: bool,
    /// Hash of the response unit, if one was produced
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_unit: Option<String>,
    /// Response variables and error
    #[serde(default)]
    pub response: ResponseBody,
    /// Full response unit, if one was produced
    #[serde(
        rename = "objResponseUnit",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub response_unit_object: Option<Unit>,
    /// State variables changed by the execution, by AA
    #[serde(
        rename = "updatedStateVars",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub updated_state_vars: Option<HashMap<String, HashMap<String, VarUpdate>>>,
    /// AA balances after the execution
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub balances: Option<Balances>,
    /// Timestamp of the execution (seconds)
    #[serde(default)]
    pub timestamp: u64,
}

impl AaResponse {
    /// Create a minimal response to a trigger that started its own chain.
    pub fn new(aa_address: impl Into<String>, trigger_unit: impl Into<String>) -> Self {
        let trigger_unit = trigger_unit.into();
        Self {
            mci: None,
            trigger_address: None,
            trigger_initial_unit: trigger_unit.clone(),
            trigger_unit,
            aa_address: aa_address.into(),
            bounced: false,
            response_unit: None,
            response: ResponseBody::default(),
            response_unit_object: None,
            updated_state_vars: None,
            balances: None,
            timestamp: 0,
        }
    }

    /// Set the initial unit of the chain.
    pub fn with_initial_unit(mut self, unit: impl Into<String>) -> Self {
        self.trigger_initial_unit = unit.into();
        self
    }

    /// Set the balances snapshot.
    pub fn with_balances(mut self, balances: Balances) -> Self {
        self.balances = Some(balances);
        self
    }

    /// Add a state variable update.
    pub fn with_update(mut self, address: &str, name: &str, update: VarUpdate) -> Self {
        self.updated_state_vars
            .get_or_insert_with(HashMap::new)
            .entry(address.to_string())
            .or_default()
            .insert(name.to_string(), update);
        self
    }

    /// Messages of the response unit.
    pub fn response_messages(&self) -> &[Message] {
        self.response_unit_object
            .as_ref()
            .map(|u| u.messages.as_slice())
            .unwrap_or(&[])
    }
}

/// An AA definition published on the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AaDefinition {
    /// AA address
    pub address: String,
    /// Full definition (`["autonomous agent", {...}]`)
    pub definition: Value,
    /// Base AA for parameterized agents
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_aa: Option<String>,
}

impl AaDefinition {
    /// Extract a definition from a `definition` message payload.
    pub fn from_payload(payload: &Value) -> Option<Self> {
        let address = payload.get("address")?.as_str()?.to_string();
        let definition = payload.get("definition")?.clone();
        Some(Self::new(address, definition))
    }

    /// Create a definition, extracting the base AA from its template.
    pub fn new(address: impl Into<String>, definition: Value) -> Self {
        let base_aa = definition
            .get(1)
            .and_then(|body| body.get("base_aa"))
            .and_then(|v| v.as_str())
            .map(String::from);
        Self {
            address: address.into(),
            definition,
            base_aa,
        }
    }

    /// Parameters of a parameterized AA.
    pub fn params(&self) -> Option<&Value> {
        self.definition.get(1).and_then(|body| body.get("params"))
    }
}
