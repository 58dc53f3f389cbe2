//! In-memory collaborators for tests.
//!
//! - [`MockTransport`] replays queued vendor replies and records requests
//! - [`MockLedger`] serves state, balances, feeds and definitions from memory
//! - [`MockEstimator`] applies a small, deterministic set of trigger rules

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;

use crate::context::{AddressBalance, AddressBalances, Balances, StateSnapshot, BASE_ASSET};
use crate::traits::*;
use crate::types::{AaDefinition, AaResponse, Unit, VarUpdate, APP_PAYMENT};

/// Transport replaying queued replies per command.
#[derive(Default)]
pub struct MockTransport {
    replies: Mutex<HashMap<String, VecDeque<Result<Value, TransportError>>>>,
    requests: Mutex<Vec<(String, Value)>>,
}

impl MockTransport {
    /// Create a transport with no queued replies.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a reply for a command.
    pub fn push_reply(&self, command: &str, reply: Result<Value, TransportError>) {
        if let Ok(mut replies) = self.replies.lock() {
            replies.entry(command.to_string()).or_default().push_back(reply);
        }
    }

    /// Parameters of every request sent for a command.
    pub fn requests(&self, command: &str) -> Vec<Value> {
        self.requests
            .lock()
            .map(|r| {
                r.iter()
                    .filter(|(c, _)| c == command)
                    .map(|(_, p)| p.clone())
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl VendorTransport for MockTransport {
    async fn request(&self, command: &str, params: Value) -> Result<Value, TransportError> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push((command.to_string(), params));
        }
        self.replies
            .lock()
            .ok()
            .and_then(|mut replies| replies.get_mut(command).and_then(VecDeque::pop_front))
            .unwrap_or_else(|| Err(TransportError::Vendor(format!("no reply queued for {}", command))))
    }
}

#[derive(Default)]
struct LedgerData {
    state_vars: HashMap<String, Map<String, Value>>,
    balances: HashMap<String, Balances>,
    data_feeds: HashMap<(String, String), Value>,
    definitions: HashMap<String, AaDefinition>,
    watched_aas: Vec<String>,
    watched_addresses: Vec<String>,
}

/// In-memory ledger.
///
/// AAs without a registered definition get a plain one on load.
#[derive(Default)]
pub struct MockLedger {
    data: Mutex<LedgerData>,
    available: AtomicBool,
    state_var_reads: AtomicU32,
    balance_reads: AtomicU32,
    data_feed_reads: AtomicU32,
}

impl MockLedger {
    /// Create an empty, available ledger.
    pub fn new() -> Self {
        Self {
            available: AtomicBool::new(true),
            ..Self::default()
        }
    }

    fn with_data<R>(&self, f: impl FnOnce(&mut LedgerData) -> R) -> Option<R> {
        self.data.lock().ok().map(|mut data| f(&mut data))
    }

    fn check_available(&self, command: &str) -> Result<(), LedgerError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(LedgerError::RetriesExhausted {
                command: command.to_string(),
                attempts: 1,
                last_error: TransportError::ConnectionFailed("mock ledger offline".into()),
            })
        }
    }

    /// Set a state variable.
    pub fn set_state_var(&self, aa_address: &str, name: &str, value: Value) {
        self.with_data(|d| {
            d.state_vars
                .entry(aa_address.to_string())
                .or_default()
                .insert(name.to_string(), value);
        });
    }

    /// Set the balances of an AA, or the stable balances of a plain address.
    pub fn set_balances(&self, aa_address: &str, balances: Balances) {
        self.with_data(|d| {
            d.balances.insert(aa_address.to_string(), balances);
        });
    }

    /// Set the latest value of a data feed.
    pub fn set_data_feed(&self, oracle: &str, feed_name: &str, value: Value) {
        self.with_data(|d| {
            d.data_feeds
                .insert((oracle.to_string(), feed_name.to_string()), value);
        });
    }

    /// Register an AA definition.
    pub fn add_definition(&self, definition: AaDefinition) {
        self.with_data(|d| {
            d.definitions.insert(definition.address.clone(), definition);
        });
    }

    /// Make every call fail as if the vendor were unreachable.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// AAs registered through `watch_aa`.
    pub fn watched_aas(&self) -> Vec<String> {
        self.with_data(|d| d.watched_aas.clone()).unwrap_or_default()
    }

    /// Addresses registered through `watch_address`.
    pub fn watched_addresses(&self) -> Vec<String> {
        self.with_data(|d| d.watched_addresses.clone())
            .unwrap_or_default()
    }

    /// Number of state variable reads.
    pub fn state_var_reads(&self) -> u32 {
        self.state_var_reads.load(Ordering::SeqCst)
    }

    /// Number of balance reads.
    pub fn balance_reads(&self) -> u32 {
        self.balance_reads.load(Ordering::SeqCst)
    }

    /// Number of data feed reads.
    pub fn data_feed_reads(&self) -> u32 {
        self.data_feed_reads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LedgerAccessor for MockLedger {
    async fn read_state_vars(
        &self,
        aa_address: &str,
        prefix: &str,
    ) -> Result<Map<String, Value>, LedgerError> {
        self.check_available("light/get_aa_state_vars")?;
        self.state_var_reads.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .with_data(|d| {
                d.state_vars
                    .get(aa_address)
                    .map(|vars| {
                        vars.iter()
                            .filter(|(name, _)| name.starts_with(prefix))
                            .map(|(name, value)| (name.clone(), value.clone()))
                            .collect()
                    })
                    .unwrap_or_default()
            })
            .unwrap_or_default())
    }

    async fn read_balances(&self, aa_address: &str) -> Result<Balances, LedgerError> {
        self.check_available("light/get_aa_balances")?;
        self.balance_reads.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .with_data(|d| d.balances.get(aa_address).cloned().unwrap_or_default())
            .unwrap_or_default())
    }

    async fn read_address_balances(&self, address: &str) -> Result<AddressBalances, LedgerError> {
        self.check_available("light/get_balances")?;
        self.balance_reads.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .with_data(|d| {
                d.balances
                    .get(address)
                    .map(|balances| {
                        balances
                            .iter()
                            .map(|(asset, &stable)| {
                                (asset.clone(), AddressBalance { stable, pending: 0 })
                            })
                            .collect()
                    })
                    .unwrap_or_default()
            })
            .unwrap_or_default())
    }

    async fn read_data_feed(
        &self,
        oracle: &str,
        feed_name: &str,
    ) -> Result<Option<Value>, LedgerError> {
        self.check_available("light/get_data_feed")?;
        self.data_feed_reads.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .with_data(|d| {
                d.data_feeds
                    .get(&(oracle.to_string(), feed_name.to_string()))
                    .cloned()
            })
            .flatten())
    }

    async fn load_definition(&self, aa_address: &str) -> Result<AaDefinition, LedgerError> {
        self.check_available("light/get_definition")?;
        Ok(self
            .with_data(|d| d.definitions.get(aa_address).cloned())
            .flatten()
            .unwrap_or_else(|| {
                AaDefinition::new(aa_address, json!(["autonomous agent", {"messages": []}]))
            }))
    }

    async fn execute_getter(
        &self,
        aa_address: &str,
        getter: &str,
        _args: &[Value],
    ) -> Result<Value, LedgerError> {
        self.check_available("light/execute_getter")?;
        Err(LedgerError::NotFound(format!("getter {} of {}", getter, aa_address)))
    }

    async fn get_aas_by_base_aas(
        &self,
        base_aas: &[String],
    ) -> Result<Vec<AaDefinition>, LedgerError> {
        self.check_available("light/get_aas_by_base_aas")?;
        Ok(self
            .with_data(|d| {
                d.definitions
                    .values()
                    .filter(|def| def.base_aa.as_ref().is_some_and(|b| base_aas.contains(b)))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn watch_aa(&self, aa_address: &str) -> Result<(), LedgerError> {
        self.check_available("light/new_aa_to_watch")?;
        self.with_data(|d| d.watched_aas.push(aa_address.to_string()));
        Ok(())
    }

    async fn watch_address(&self, address: &str) -> Result<(), LedgerError> {
        self.check_available("light/new_address_to_watch")?;
        self.with_data(|d| d.watched_addresses.push(address.to_string()));
        Ok(())
    }
}

/// Deterministic estimator driven by `data` payload keys.
///
/// For every key of every data payload sent to the AA:
/// - `"increment": n` adds `n` to the `counter` variable
/// - `"feed": {"oracle", "name"}` stores the feed value as of the trigger
///   timestamp in `feed_value`
/// - `"bounce": true` bounces the trigger without changes
/// - `"fail": true` fails the estimation
/// - any other key sets the variable of that name; `false` deletes it
///
/// Payment outputs to the AA are credited to its balances.
#[derive(Default)]
pub struct MockEstimator {
    calls: AtomicU32,
    failing: AtomicBool,
}

impl MockEstimator {
    /// Create an estimator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every estimation fail.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of estimations run.
    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Reset the call count.
    pub fn reset_call_count(&self) {
        self.calls.store(0, Ordering::SeqCst);
    }
}

#[async_trait]
impl Estimator for MockEstimator {
    async fn estimate_primary_trigger(
        &self,
        trigger: &Unit,
        aa_address: &str,
        context: &mut StateSnapshot,
        feeds: &dyn DataFeedReader,
    ) -> Result<Vec<AaResponse>, EstimatorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(EstimatorError::Evaluation("mock estimator failure".into()));
        }

        let payloads: Vec<&Map<String, Value>> = trigger
            .messages
            .iter()
            .filter(|m| m.app == "data")
            .filter_map(|m| m.payload.as_ref().and_then(Value::as_object))
            .collect();

        let mut response = AaResponse::new(aa_address, &trigger.unit);
        response.timestamp = trigger.timestamp;

        if payloads.iter().any(|p| p.get("fail") == Some(&json!(true))) {
            return Err(EstimatorError::Evaluation("trigger requested failure".into()));
        }
        if payloads.iter().any(|p| p.get("bounce") == Some(&json!(true))) {
            response.bounced = true;
            response.response.error = Some("bounced".into());
            response.balances = context.balances.get(aa_address).cloned();
            return Ok(vec![response]);
        }

        for message in trigger.messages.iter().filter(|m| m.app == APP_PAYMENT) {
            if let Some(payment) = message.payment_payload() {
                let asset = payment.asset.as_deref().unwrap_or(BASE_ASSET);
                for output in payment.outputs.iter().filter(|o| o.address == aa_address) {
                    context.credit(aa_address, asset, output.amount);
                }
            }
        }

        for payload in payloads {
            for (key, value) in payload {
                match key.as_str() {
                    "increment" => {
                        let by = value.as_i64().unwrap_or(0);
                        let current = context
                            .var_value(aa_address, "counter")
                            .and_then(Value::as_i64)
                            .unwrap_or(0);
                        context.set_var(aa_address, "counter", json!(current + by));
                        response = response.with_update(aa_address, "counter", VarUpdate::set(current + by));
                    }
                    "feed" => {
                        let oracle = value.get("oracle").and_then(Value::as_str).unwrap_or_default();
                        let name = value.get("name").and_then(Value::as_str).unwrap_or_default();
                        let oracles = vec![oracle.to_string()];
                        let feed_value = feeds
                            .read_data_feed(&oracles, name, Some(trigger.timestamp))
                            .ok_or_else(|| EstimatorError::DataFeedNotFound {
                                oracles: oracles.clone(),
                                feed_name: name.to_string(),
                            })?;
                        context.set_var(aa_address, "feed_value", feed_value.clone());
                        response = response.with_update(aa_address, "feed_value", VarUpdate::set(feed_value));
                    }
                    _ if *value == Value::Bool(false) => {
                        context.delete_var(aa_address, key);
                        response = response.with_update(aa_address, key, VarUpdate::delete());
                    }
                    _ => {
                        context.set_var(aa_address, key, value.clone());
                        response = response.with_update(aa_address, key, VarUpdate::set(value.clone()));
                    }
                }
            }
        }

        let mut vars = Map::new();
        vars.insert("message".to_string(), json!("ok"));
        response.response.response_vars = Some(vars);
        response.balances = context.balances.get(aa_address).cloned();
        Ok(vec![response])
    }
}
