//! Response verification.
//!
//! When a trigger is queued, the estimator's primary response is reduced to
//! its essentials and stored. When the ledger later confirms the trigger,
//! the confirmed response is reduced the same way and compared. Drift is
//! logged with a per-field relative difference; it never rejects anything.
//!
//! Essentials leave out what the estimator cannot reproduce:
//! - the `base` balance (fees)
//! - transport fields of messages (payload location and hash)
//! - payment outputs back to the AA itself (change)

use aa_ledger::{AaResponse, Balances, Message, APP_PAYMENT, BASE_ASSET};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use tracing::{debug, warn};

use crate::config::VerificationConfig;

/// The comparable part of an AA response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEssentials {
    /// Execution timestamp
    pub timestamp: u64,
    /// Whether the AA bounced
    pub bounced: bool,
    /// Response variables
    pub response_vars: Map<String, Value>,
    /// Normalized messages of the response unit
    pub messages: Vec<Value>,
    /// Balances without the base asset
    pub balances: Balances,
}

impl ResponseEssentials {
    /// Reduce a response to its essentials.
    pub fn from_response(response: &AaResponse) -> Self {
        let mut balances = response.balances.clone().unwrap_or_default();
        balances.remove(BASE_ASSET);

        Self {
            timestamp: response.timestamp,
            bounced: response.bounced,
            response_vars: response.response.response_vars.clone().unwrap_or_default(),
            messages: normalize_messages(&response.aa_address, response.response_messages()),
            balances,
        }
    }

    /// Fields by name, in comparison order.
    fn fields(&self) -> [(&'static str, Value); 5] {
        [
            ("timestamp", json!(self.timestamp)),
            ("bounced", json!(self.bounced)),
            ("responseVars", Value::Object(self.response_vars.clone())),
            ("messages", Value::Array(self.messages.clone())),
            ("balances", json!(self.balances)),
        ]
    }
}

/// Normalize response messages for order-independent comparison.
pub fn normalize_messages(aa_address: &str, messages: &[Message]) -> Vec<Value> {
    let mut normalized: Vec<(String, String, Value)> = messages
        .iter()
        .filter_map(|message| {
            let mut payload = message.payload.clone().unwrap_or(Value::Null);
            let mut asset = String::new();

            if message.app == APP_PAYMENT {
                if let Some(obj) = payload.as_object_mut() {
                    let asset_value = obj
                        .entry("asset")
                        .or_insert_with(|| Value::String(BASE_ASSET.to_string()));
                    asset = asset_value.as_str().unwrap_or(BASE_ASSET).to_string();

                    if let Some(Value::Array(outputs)) = obj.get_mut("outputs") {
                        outputs.retain(|o| o.get("address").and_then(Value::as_str) != Some(aa_address));
                        if outputs.is_empty() {
                            return None;
                        }
                    }
                }
            }

            let value = json!({ "app": message.app, "payload": payload });
            Some((message.app.clone(), asset, value))
        })
        .collect();

    normalized.sort_by(|a, b| (&a.0, &a.1).cmp(&(&b.0, &b.1)));
    normalized.into_iter().map(|(_, _, value)| value).collect()
}

/// Relative difference between two values.
///
/// `0.0` for equal values, `f64::INFINITY` when they cannot be reconciled
/// (different types, lengths or key sets). Numbers differ by
/// `|a - b| / (a + b) * 2`; composites by the largest difference of their
/// members. Percent strings compare as numbers, and strings holding JSON
/// compare by their parsed content.
pub fn max_difference(a: &Value, b: &Value) -> f64 {
    if a == b {
        return 0.0;
    }
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            let (Some(x), Some(y)) = (x.as_f64(), y.as_f64()) else {
                return f64::INFINITY;
            };
            relative_difference(x, y)
        }
        (Value::String(x), Value::String(y)) => string_difference(x, y),
        (Value::Array(x), Value::Array(y)) => {
            if x.len() != y.len() {
                return f64::INFINITY;
            }
            x.iter()
                .zip(y)
                .map(|(a, b)| max_difference(a, b))
                .fold(0.0, f64::max)
        }
        (Value::Object(x), Value::Object(y)) => {
            if x.len() != y.len() || x.keys().any(|k| !y.contains_key(k)) {
                return f64::INFINITY;
            }
            x.iter()
                .map(|(k, a)| max_difference(a, &y[k]))
                .fold(0.0, f64::max)
        }
        _ => f64::INFINITY,
    }
}

fn relative_difference(x: f64, y: f64) -> f64 {
    let sum = x + y;
    if sum == 0.0 {
        return f64::INFINITY;
    }
    ((x - y) / sum * 2.0).abs()
}

fn string_difference(x: &str, y: &str) -> f64 {
    if let (Some(px), Some(py)) = (x.strip_suffix('%'), y.strip_suffix('%')) {
        return match (px.trim().parse::<f64>(), py.trim().parse::<f64>()) {
            (Ok(px), Ok(py)) => relative_difference(px, py),
            _ => f64::INFINITY,
        };
    }
    match (serde_json::from_str::<Value>(x), serde_json::from_str::<Value>(y)) {
        (Ok(px), Ok(py)) => max_difference(&px, &py),
        _ => f64::INFINITY,
    }
}

/// A prediction awaiting confirmation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpectedResponse {
    /// Trigger unit
    pub unit_id: String,
    /// Predicted essentials
    pub essentials: ResponseEssentials,
    /// When the prediction was recorded
    pub recorded_at: DateTime<Utc>,
}

/// Difference found in one field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDrift {
    /// Field name
    pub field: String,
    /// Relative difference, possibly infinite
    pub difference: f64,
}

/// Outcome of comparing a prediction with its confirmation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationReport {
    /// Trigger unit
    pub unit_id: String,
    /// Executed AA
    pub aa_address: String,
    /// Whether the essentials are identical
    pub matches: bool,
    /// Fields that differ
    pub drifts: Vec<FieldDrift>,
    /// When the comparison was made
    pub verified_at: DateTime<Utc>,
}

impl VerificationReport {
    /// Largest difference over all fields, `0.0` on a match.
    pub fn max_difference(&self) -> f64 {
        self.drifts.iter().map(|d| d.difference).fold(0.0, f64::max)
    }
}

/// Table of predictions by trigger unit.
#[derive(Debug, Clone, Default)]
pub struct ResponseVerifier {
    config: VerificationConfig,
    expected: HashMap<String, ExpectedResponse>,
}

impl ResponseVerifier {
    /// Create a verifier.
    pub fn new(config: VerificationConfig) -> Self {
        Self {
            config,
            expected: HashMap::new(),
        }
    }

    /// Record the predicted response to a trigger.
    pub fn record(&mut self, unit_id: &str, predicted: &AaResponse) {
        if !self.config.enabled {
            return;
        }
        self.expected.insert(
            unit_id.to_string(),
            ExpectedResponse {
                unit_id: unit_id.to_string(),
                essentials: ResponseEssentials::from_response(predicted),
                recorded_at: Utc::now(),
            },
        );
    }

    /// Prediction recorded for a trigger.
    pub fn expected(&self, unit_id: &str) -> Option<&ExpectedResponse> {
        self.expected.get(unit_id)
    }

    /// Number of predictions awaiting confirmation.
    pub fn pending(&self) -> usize {
        self.expected.len()
    }

    /// Forget the prediction for a trigger.
    pub fn discard(&mut self, unit_id: &str) {
        self.expected.remove(unit_id);
    }

    /// Compare a confirmed response with its prediction, consuming it.
    ///
    /// Returns `None` when nothing was predicted for the trigger.
    pub fn verify(&mut self, actual: &AaResponse) -> Option<VerificationReport> {
        let expected = self.expected.remove(&actual.trigger_unit)?;
        let actual_essentials = ResponseEssentials::from_response(actual);

        let mut drifts = Vec::new();
        if expected.essentials != actual_essentials {
            for ((field, predicted), (_, confirmed)) in expected
                .essentials
                .fields()
                .into_iter()
                .zip(actual_essentials.fields())
            {
                let difference = max_difference(&predicted, &confirmed);
                if difference == 0.0 {
                    continue;
                }
                if difference > self.config.drift_warn_threshold {
                    warn!(
                        unit = %actual.trigger_unit,
                        aa_address = %actual.aa_address,
                        field = field,
                        difference,
                        expected = %predicted,
                        actual = %confirmed,
                        "Estimated response differs from confirmed"
                    );
                } else {
                    debug!(unit = %actual.trigger_unit, field = field, difference, "Minor response drift");
                }
                drifts.push(FieldDrift {
                    field: field.to_string(),
                    difference,
                });
            }
        } else {
            debug!(unit = %actual.trigger_unit, "Estimated response matches confirmed");
        }

        Some(VerificationReport {
            unit_id: actual.trigger_unit.clone(),
            aa_address: actual.aa_address.clone(),
            matches: drifts.is_empty(),
            drifts,
            verified_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aa_ledger::{PaymentOutput, Unit};

    #[test]
    fn test_max_difference_scalars() {
        assert_eq!(max_difference(&json!(5), &json!(5)), 0.0);
        assert!((max_difference(&json!(5), &json!(10)) - 2.0 / 3.0).abs() < 1e-12);
        assert_eq!(max_difference(&json!("abc"), &json!(5)), f64::INFINITY);
    }

    #[test]
    fn test_max_difference_zero_sum_is_infinite() {
        assert_eq!(max_difference(&json!(-1), &json!(1)), f64::INFINITY);
    }

    #[test]
    fn test_max_difference_objects_use_differing_key() {
        let a = json!({"a": 1, "b": 2});
        let b = json!({"a": 1, "b": 3});
        assert_eq!(max_difference(&a, &b), max_difference(&json!(2), &json!(3)));
        assert_eq!(max_difference(&a, &json!({"a": 1, "c": 2})), f64::INFINITY);
    }

    #[test]
    fn test_max_difference_arrays() {
        assert_eq!(max_difference(&json!([1, 2]), &json!([1])), f64::INFINITY);
        let d = max_difference(&json!([1, 10]), &json!([1, 30]));
        assert!((d - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_max_difference_strings() {
        let pct = max_difference(&json!("5%"), &json!("10%"));
        assert!((pct - 2.0 / 3.0).abs() < 1e-12);

        let nested = max_difference(&json!("{\"p\":5}"), &json!("{\"p\":10}"));
        assert!((nested - 2.0 / 3.0).abs() < 1e-12);

        assert_eq!(max_difference(&json!("abc"), &json!("abd")), f64::INFINITY);
    }

    #[test]
    fn test_normalize_messages() {
        let messages = vec![
            Message::inline("data", json!({"k": 1})),
            Message::payment(
                Some("asset1"),
                vec![PaymentOutput::new("USER", 5), PaymentOutput::new("AA", 1)],
            ),
            Message::payment(None, vec![PaymentOutput::new("AA", 100)]),
            Message::payment(None, vec![PaymentOutput::new("USER", 10)]),
        ];

        let normalized = normalize_messages("AA", &messages);

        assert_eq!(normalized.len(), 3);
        assert_eq!(normalized[0]["app"], json!("data"));
        assert!(normalized[0].get("payload_location").is_none());
        assert_eq!(normalized[1]["payload"]["asset"], json!("asset1"));
        assert_eq!(normalized[1]["payload"]["outputs"], json!([{"address": "USER", "amount": 5}]));
        assert_eq!(normalized[2]["payload"]["asset"], json!("base"));
    }

    #[test]
    fn test_essentials_drop_base_balance() {
        let response = AaResponse::new("AA", "t1").with_balances(Balances::from([
            ("base".to_string(), 10_000),
            ("asset1".to_string(), 5),
        ]));

        let essentials = ResponseEssentials::from_response(&response);
        assert_eq!(essentials.balances, Balances::from([("asset1".to_string(), 5)]));
    }

    #[test]
    fn test_verify_consumes_prediction() {
        let mut verifier = ResponseVerifier::new(VerificationConfig::default());
        let mut predicted = AaResponse::new("AA", "t1");
        predicted.response.response_vars = Some(Map::from_iter([("price".to_string(), json!(10))]));
        verifier.record("t1", &predicted);

        let mut actual = predicted.clone();
        actual.response.response_vars = Some(Map::from_iter([("price".to_string(), json!(12))]));
        actual.response_unit_object = Some(Unit::new("r1", vec![]));

        let report = verifier.verify(&actual).unwrap();
        assert!(!report.matches);
        assert_eq!(report.drifts.len(), 1);
        assert_eq!(report.drifts[0].field, "responseVars");
        assert!(verifier.verify(&actual).is_none());
        assert_eq!(verifier.pending(), 0);
    }

    #[test]
    fn test_fee_only_difference_matches() {
        let mut verifier = ResponseVerifier::new(VerificationConfig::default());
        let predicted =
            AaResponse::new("AA", "t1").with_balances(Balances::from([("base".to_string(), 1000)]));
        verifier.record("t1", &predicted);

        let actual =
            AaResponse::new("AA", "t1").with_balances(Balances::from([("base".to_string(), 987)]));
        assert!(verifier.verify(&actual).unwrap().matches);
    }

    #[test]
    fn test_disabled_verifier_records_nothing() {
        let mut verifier = ResponseVerifier::new(VerificationConfig {
            enabled: false,
            ..VerificationConfig::default()
        });
        verifier.record("t1", &AaResponse::new("AA", "t1"));
        assert!(verifier.expected("t1").is_none());
    }
}
