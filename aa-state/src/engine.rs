//! AaStateEngine - confirmed and speculative AA state.
//!
//! All mutable state lives in one [`EngineState`] behind a single async
//! mutex. Every mutation holds the lock for its whole critical section,
//! ledger and estimator awaits included, so a replay never interleaves with
//! another change. Events are emitted only after the lock is released.

use aa_ledger::{
    AaDefinition, AaRequest, AaResponse, Balances, BalancesByAgent, Estimator, LedgerAccessor,
    StateSnapshot, StateVarsByAgent, Unit,
};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::events::{AgentSubscription, EngineEvent, EventBus};
use crate::oracle::{Oracle, OracleCache, OracleKey};
use crate::queue::PendingQueue;
use crate::store::{required_balances, settled_vars, StateStore};
use crate::types::{
    ConfirmationOutcome, EngineError, EnqueueOutcome, PendingTrigger, Result,
};
use crate::verifier::{ExpectedResponse, ResponseVerifier};

/// Everything guarded by the engine lock.
pub struct EngineState {
    store: StateStore,
    queue: PendingQueue,
    verifier: ResponseVerifier,
    oracles: OracleCache,
    last_trigger_initial_unit: Option<String>,
    followed: HashSet<String>,
}

impl EngineState {
    fn new(config: &EngineConfig) -> Self {
        Self {
            store: StateStore::new(),
            queue: PendingQueue::new(),
            verifier: ResponseVerifier::new(config.verification.clone()),
            oracles: OracleCache::new(config.oracle.clone()),
            last_trigger_initial_unit: None,
            followed: HashSet::new(),
        }
    }

    /// Confirmed state variables of every AA.
    pub fn state_vars(&self) -> &StateVarsByAgent {
        self.store.state_vars()
    }

    /// Confirmed variable values of one AA.
    pub fn agent_state_vars(&self, aa_address: &str) -> HashMap<String, Value> {
        self.store.agent_state_vars(aa_address)
    }

    /// Upcoming state variables of every AA, tombstones included.
    pub fn upcoming_state_vars(&self) -> &StateVarsByAgent {
        self.store.upcoming_state_vars()
    }

    /// Upcoming variable values of one AA, tombstones filtered out.
    pub fn upcoming_agent_state_vars(&self, aa_address: &str) -> HashMap<String, Value> {
        self.store.upcoming_agent_state_vars(aa_address)
    }

    /// Confirmed balances of every AA.
    pub fn balances(&self) -> &BalancesByAgent {
        self.store.balances()
    }

    /// Upcoming balances of every AA.
    pub fn upcoming_balances(&self) -> &BalancesByAgent {
        self.store.upcoming_balances()
    }

    /// Confirmed snapshot.
    pub fn confirmed(&self) -> &StateSnapshot {
        self.store.confirmed()
    }

    /// Upcoming snapshot.
    pub fn upcoming(&self) -> &StateSnapshot {
        self.store.upcoming()
    }

    /// Units of the pending triggers in queue order.
    pub fn pending_units(&self) -> Vec<String> {
        self.queue.unit_ids()
    }

    /// Prediction recorded for a pending trigger.
    pub fn expected_response(&self, unit_id: &str) -> Option<&ExpectedResponse> {
        self.verifier.expected(unit_id)
    }

    /// Cached feed, if referenced before.
    pub fn oracle(&self, address: &str, feed_name: &str) -> Option<&Oracle> {
        self.oracles.peek(address, feed_name)
    }

    /// Whether an AA is followed.
    pub fn is_followed(&self, aa_address: &str) -> bool {
        self.followed.contains(aa_address)
    }
}

/// Tracks confirmed state of followed AAs and predicts their upcoming state
/// from unconfirmed requests.
pub struct AaStateEngine {
    /// Configuration
    config: EngineConfig,
    /// Authoritative ledger reads
    ledger: Arc<dyn LedgerAccessor>,
    /// Deterministic execution estimator
    estimator: Arc<dyn Estimator>,
    /// Engine-wide lock
    state: Mutex<EngineState>,
    /// Local events
    events: EventBus,
}

impl AaStateEngine {
    /// Create an engine with default configuration.
    pub fn new(ledger: Arc<dyn LedgerAccessor>, estimator: Arc<dyn Estimator>) -> Self {
        let config = EngineConfig::default();
        Self {
            state: Mutex::new(EngineState::new(&config)),
            events: EventBus::with_capacity(config.events.capacity),
            config,
            ledger,
            estimator,
        }
    }

    /// Create with custom configuration.
    pub fn with_config(
        ledger: Arc<dyn LedgerAccessor>,
        estimator: Arc<dyn Estimator>,
        config: EngineConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            state: Mutex::new(EngineState::new(&config)),
            events: EventBus::with_capacity(config.events.capacity),
            config,
            ledger,
            estimator,
        })
    }

    /// Engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Acquire the engine lock for a consistent view.
    ///
    /// No mutation or replay can run while the guard is held.
    pub async fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().await
    }

    /// Subscribe to every engine event.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// Subscribe to events about one AA.
    pub fn subscribe_agent(&self, aa_address: impl Into<String>) -> AgentSubscription {
        self.events.subscribe_agent(aa_address)
    }

    /// Upcoming balances, copied under the lock.
    pub async fn final_upcoming_balances(&self) -> BalancesByAgent {
        self.lock().await.upcoming_balances().clone()
    }

    /// Upcoming state variables, copied under the lock.
    pub async fn final_upcoming_state_vars(&self) -> StateVarsByAgent {
        self.lock().await.upcoming_state_vars().clone()
    }

    /// Upcoming variable values of one AA, copied under the lock.
    pub async fn final_upcoming_agent_state_vars(&self, aa_address: &str) -> HashMap<String, Value> {
        self.lock().await.upcoming_agent_state_vars(aa_address)
    }

    /// Seed both views of an AA from authoritative reads.
    ///
    /// Pending triggers are replayed on top, so a replay failure is
    /// returned and the upcoming view keeps the plain seed.
    pub async fn load_initial(
        &self,
        aa_address: &str,
        vars: Map<String, Value>,
        balances: Balances,
    ) -> Result<()> {
        let mut state = self.lock().await;
        self.seed(&mut state, aa_address, vars, balances).await
    }

    /// Start following an AA. Returns `false` if it was already followed.
    ///
    /// Loads its definition, state variables and balances, seeds both views
    /// and registers for its request, response and definition notifications.
    pub async fn follow_agent(&self, aa_address: &str) -> Result<bool> {
        let mut state = self.lock().await;
        if state.followed.contains(aa_address) {
            return Ok(false);
        }

        info!(aa_address = %aa_address, "Following AA");
        self.ledger.load_definition(aa_address).await?;
        let (vars, balances) = futures::try_join!(
            self.ledger.read_state_vars(aa_address, ""),
            self.ledger.read_balances(aa_address),
        )?;
        debug!(aa_address = %aa_address, vars = vars.len(), "Loaded AA state");

        self.seed(&mut state, aa_address, vars, balances).await?;

        self.ledger.watch_aa(aa_address).await?;
        state.followed.insert(aa_address.to_string());
        Ok(true)
    }

    /// Queue an unconfirmed request and layer its estimated effect onto the
    /// upcoming view.
    pub async fn enqueue(&self, request: AaRequest) -> Result<EnqueueOutcome> {
        let unit_id = request.unit_id().to_string();
        let aa_address = request.aa_address.clone();
        if request.unit.messages.is_empty() {
            warn!(unit = %unit_id, aa_address = %aa_address, "Request has no messages, ignoring");
            return Ok(EnqueueOutcome::NoMessages);
        }

        let mut guard = self.lock().await;
        let state = &mut *guard;
        if state.queue.contains(&unit_id) {
            warn!(unit = %unit_id, "Trigger already queued");
            return Ok(EnqueueOutcome::Duplicate);
        }

        if !state.store.has_balances(&aa_address) {
            debug!(aa_address = %aa_address, "Balances unknown, reading from ledger");
            let balances = self.ledger.read_balances(&aa_address).await?;
            state.store.add_balances(&aa_address, balances);
        }

        let mut upcoming = state.store.upcoming().clone();
        let responses = self
            .estimator
            .estimate_primary_trigger(&request.unit, &aa_address, &mut upcoming, &state.oracles)
            .await?;
        debug!(unit = %unit_id, responses = responses.len(), "Estimated trigger");

        state.store.replace_upcoming(upcoming);
        if let Some(primary) = responses.first() {
            state.verifier.record(&unit_id, primary);
        }
        let request = Arc::new(request);
        state.queue.push(PendingTrigger::from(request.as_ref().clone()));
        info!(unit = %unit_id, aa_address = %aa_address, pending = state.queue.len(), "Trigger queued");
        drop(guard);

        self.events.emit(EngineEvent::RequestApplied { aa_address, request });
        Ok(EnqueueOutcome::Queued)
    }

    /// Apply a ledger-confirmed response and rebuild the upcoming view.
    ///
    /// Triggers up to and including the response's initial unit leave the
    /// queue the first time that chain is seen. If the rebuild fails the
    /// confirmed view is already updated and the upcoming view is stale.
    pub async fn on_confirmed(&self, response: AaResponse) -> Result<ConfirmationOutcome> {
        required_balances(&response)?;

        let mut state = self.lock().await;
        debug!(
            unit = %response.trigger_unit,
            initial_unit = %response.trigger_initial_unit,
            aa_address = %response.aa_address,
            "Applying confirmed response"
        );

        let verification = state.verifier.verify(&response);

        let repeated =
            state.last_trigger_initial_unit.as_deref() == Some(response.trigger_initial_unit.as_str());
        let mut trimmed = Vec::new();
        if repeated {
            debug!(initial_unit = %response.trigger_initial_unit, "Repeated response in chain");
        } else {
            for trigger in state.queue.trim_through(&response.trigger_initial_unit) {
                state.verifier.discard(&trigger.unit_id);
                trimmed.push(trigger.unit_id);
            }
            state.last_trigger_initial_unit = Some(response.trigger_initial_unit.clone());
        }

        state
            .store
            .apply_confirmed_response(&response, |v| self.estimator.coerce_value(v))?;
        self.replay(&mut state).await?;
        drop(state);

        self.events.emit(EngineEvent::ResponseApplied {
            aa_address: response.aa_address.clone(),
            response: Arc::new(response),
        });
        Ok(ConfirmationOutcome {
            trimmed,
            repeated,
            verification,
        })
    }

    /// Rebuild the upcoming view from confirmed state and the queue.
    pub async fn rebuild(&self) -> Result<()> {
        let mut state = self.lock().await;
        self.replay(&mut state).await
    }

    async fn seed(
        &self,
        state: &mut EngineState,
        aa_address: &str,
        vars: Map<String, Value>,
        balances: Balances,
    ) -> Result<()> {
        let vars = settled_vars(vars, |v| self.estimator.coerce_value(v));
        state.store.load_initial(aa_address, vars, balances);
        if !state.queue.is_empty() {
            self.replay(state).await?;
        }
        Ok(())
    }

    /// Clone confirmed state and re-estimate every queued trigger in order.
    ///
    /// The upcoming view is only replaced when every estimate succeeds.
    async fn replay(&self, state: &mut EngineState) -> Result<()> {
        debug!(pending = state.queue.len(), "Replaying pending triggers");
        let mut upcoming = state.store.confirmed().clone();
        for trigger in state.queue.iter() {
            self.estimator
                .estimate_primary_trigger(&trigger.unit, &trigger.aa_address, &mut upcoming, &state.oracles)
                .await
                .inspect_err(|e| {
                    warn!(unit = %trigger.unit_id, error = %e, "Replay failed, upcoming state is stale")
                })?;
        }
        state.store.replace_upcoming(upcoming);
        debug!("Finished replaying pending triggers");
        Ok(())
    }

    /// Publish the definitions carried by a unit.
    pub async fn on_definition(&self, unit: &Unit) -> Result<Vec<AaDefinition>> {
        let definitions = unit.definitions();
        if definitions.is_empty() {
            return Err(EngineError::MalformedNotification(format!(
                "no definition in unit {}",
                unit.unit
            )));
        }
        for definition in &definitions {
            info!(
                aa_address = %definition.address,
                base_aa = ?definition.base_aa,
                unit = %unit.unit,
                "AA definition published"
            );
            self.events.emit(EngineEvent::DefinitionApplied {
                definition: definition.clone(),
                unit: unit.unit.clone(),
            });
        }
        Ok(definitions)
    }

    /// Take feed values from a new unit. Returns the feeds that changed.
    pub async fn on_new_unit(&self, unit: &Unit) -> Vec<OracleKey> {
        let changed = self.lock().await.oracles.ingest_unit(unit);
        if !changed.is_empty() {
            self.events.emit(EngineEvent::OraclesUpdated {
                oracles: changed.clone(),
            });
        }
        changed
    }

    /// Fetch a feed unless it is within its cooldown. Returns whether the
    /// value changed.
    pub async fn refresh_oracle(&self, address: &str, feed_name: &str, force: bool) -> Result<bool> {
        let mut state = self.lock().await;
        Ok(state
            .oracles
            .refresh(self.ledger.as_ref(), address, feed_name, force)
            .await?)
    }

    /// Latest cached value of a feed.
    pub async fn oracle_value(&self, address: &str, feed_name: &str) -> Option<Value> {
        self.lock()
            .await
            .oracle(address, feed_name)
            .and_then(|o| o.value.clone())
    }

    /// Run a getter of an AA against confirmed state.
    pub async fn execute_getter(&self, aa_address: &str, getter: &str, args: &[Value]) -> Result<Value> {
        Ok(self.ledger.execute_getter(aa_address, getter, args).await?)
    }

    /// Find AAs parameterized from the given base AAs.
    pub async fn find_by_base_aas(&self, base_aas: &[String]) -> Result<Vec<AaDefinition>> {
        Ok(self.ledger.get_aas_by_base_aas(base_aas).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aa_ledger::mock::{MockEstimator, MockLedger};
    use aa_ledger::{Message, VarUpdate, BASE_ASSET};
    use serde_json::json;

    fn engine() -> (Arc<MockLedger>, Arc<MockEstimator>, AaStateEngine) {
        let ledger = Arc::new(MockLedger::new());
        let estimator = Arc::new(MockEstimator::new());
        let engine = AaStateEngine::new(ledger.clone(), estimator.clone());
        (ledger, estimator, engine)
    }

    fn request(unit: &str, payload: Value) -> AaRequest {
        AaRequest::new("AA", Unit::new(unit, vec![Message::inline("data", payload)]))
    }

    fn confirmation(unit: &str, initial: &str) -> AaResponse {
        AaResponse::new("AA", unit)
            .with_initial_unit(initial)
            .with_balances(Balances::from([(BASE_ASSET.to_string(), 1000)]))
    }

    #[tokio::test]
    async fn test_enqueue_fetches_unknown_balances_once() {
        let (ledger, _, engine) = engine();
        ledger.set_balances("AA", Balances::from([(BASE_ASSET.to_string(), 42)]));

        engine.enqueue(request("t1", json!({"increment": 1}))).await.unwrap();
        engine.enqueue(request("t2", json!({"increment": 1}))).await.unwrap();

        assert_eq!(ledger.balance_reads(), 1);
        let state = engine.lock().await;
        assert_eq!(state.balances()["AA"][BASE_ASSET], 42);
        assert_eq!(state.upcoming_agent_state_vars("AA")["counter"], json!(2));
        assert!(state.agent_state_vars("AA").is_empty());
    }

    #[tokio::test]
    async fn test_enqueue_duplicate_and_empty() {
        let (_, estimator, engine) = engine();

        let first = engine.enqueue(request("t1", json!({"x": 1}))).await.unwrap();
        let again = engine.enqueue(request("t1", json!({"x": 1}))).await.unwrap();
        let empty = engine
            .enqueue(AaRequest::new("AA", Unit::new("t2", vec![])))
            .await
            .unwrap();

        assert_eq!(first, EnqueueOutcome::Queued);
        assert_eq!(again, EnqueueOutcome::Duplicate);
        assert_eq!(empty, EnqueueOutcome::NoMessages);
        assert_eq!(estimator.call_count(), 1);
        assert_eq!(engine.lock().await.pending_units(), vec!["t1"]);
    }

    #[tokio::test]
    async fn test_enqueue_records_prediction() {
        let (_, _, engine) = engine();
        engine.enqueue(request("t1", json!({"x": 1}))).await.unwrap();

        let state = engine.lock().await;
        let expected = state.expected_response("t1").unwrap();
        assert_eq!(expected.essentials.response_vars["message"], json!("ok"));
    }

    #[tokio::test]
    async fn test_confirmation_trims_and_replays_rest() {
        let (_, estimator, engine) = engine();
        for unit in ["t1", "t2", "t3"] {
            engine.enqueue(request(unit, json!({"increment": 1}))).await.unwrap();
        }
        estimator.reset_call_count();

        let response = confirmation("t2", "t2").with_update("AA", "counter", VarUpdate::set(2));
        let outcome = engine.on_confirmed(response).await.unwrap();

        assert_eq!(outcome.trimmed, vec!["t1", "t2"]);
        assert!(!outcome.repeated);
        assert_eq!(estimator.call_count(), 1);

        let state = engine.lock().await;
        assert_eq!(state.pending_units(), vec!["t3"]);
        assert_eq!(state.agent_state_vars("AA")["counter"], json!(2));
        assert_eq!(state.upcoming_agent_state_vars("AA")["counter"], json!(3));
        assert!(state.expected_response("t1").is_none());
    }

    #[tokio::test]
    async fn test_repeated_initial_unit_skips_trimming() {
        let (_, _, engine) = engine();
        engine.enqueue(request("t1", json!({"x": 1}))).await.unwrap();

        engine.on_confirmed(confirmation("t0", "t0")).await.unwrap();
        engine.enqueue(request("t0b", json!({"x": 2}))).await.unwrap();
        let outcome = engine
            .on_confirmed(confirmation("r1", "t0").with_update("AA", "y", VarUpdate::set(5)))
            .await
            .unwrap();

        assert!(outcome.repeated);
        assert!(outcome.trimmed.is_empty());
        let state = engine.lock().await;
        assert_eq!(state.pending_units(), vec!["t1", "t0b"]);
        assert_eq!(state.agent_state_vars("AA")["y"], json!(5));
    }

    #[tokio::test]
    async fn test_confirmation_without_balances_is_rejected_untouched() {
        let (_, _, engine) = engine();
        engine.enqueue(request("t1", json!({"x": 1}))).await.unwrap();

        let mut response = confirmation("t1", "t1");
        response.balances = None;
        let result = engine.on_confirmed(response).await;

        assert!(matches!(result, Err(EngineError::MalformedNotification(_))));
        assert_eq!(engine.lock().await.pending_units(), vec!["t1"]);
    }

    #[tokio::test]
    async fn test_estimator_failure_leaves_upcoming_stale() {
        let (_, estimator, engine) = engine();
        engine.enqueue(request("t1", json!({"increment": 1}))).await.unwrap();
        let before = engine.lock().await.upcoming().clone();

        estimator.set_failing(true);
        let result = engine.enqueue(request("t2", json!({"increment": 1}))).await;
        assert!(matches!(result, Err(EngineError::Estimator(_))));

        // Lock was released and nothing changed
        let state = engine.lock().await;
        assert_eq!(state.upcoming(), &before);
        assert_eq!(state.pending_units(), vec!["t1"]);
    }

    #[tokio::test]
    async fn test_follow_agent_is_idempotent() {
        let (ledger, _, engine) = engine();
        ledger.set_state_var("AA", "x", json!(7));
        ledger.set_balances("AA", Balances::from([(BASE_ASSET.to_string(), 9)]));

        assert!(engine.follow_agent("AA").await.unwrap());
        assert!(!engine.follow_agent("AA").await.unwrap());

        assert_eq!(ledger.watched_aas(), vec!["AA".to_string()]);
        let state = engine.lock().await;
        assert!(state.is_followed("AA"));
        assert_eq!(state.agent_state_vars("AA")["x"], json!(7));
        assert_eq!(state.upcoming_agent_state_vars("AA")["x"], json!(7));
        assert_eq!(state.upcoming_balances()["AA"][BASE_ASSET], 9);
    }

    #[tokio::test]
    async fn test_follow_agent_failure_is_retriable() {
        let (ledger, _, engine) = engine();
        ledger.set_available(false);
        assert!(matches!(engine.follow_agent("AA").await, Err(EngineError::Ledger(_))));

        ledger.set_available(true);
        assert!(engine.follow_agent("AA").await.unwrap());
    }

    #[tokio::test]
    async fn test_load_initial_replays_pending_triggers() {
        let (_, _, engine) = engine();
        engine.enqueue(request("t1", json!({"increment": 1}))).await.unwrap();

        let mut vars = Map::new();
        vars.insert("counter".to_string(), json!(10));
        tokio_test::assert_ok!(
            engine
                .load_initial("AA", vars, Balances::from([(BASE_ASSET.to_string(), 5)]))
                .await
        );

        let state = engine.lock().await;
        assert_eq!(state.pending_units(), vec!["t1"]);
        assert_eq!(state.agent_state_vars("AA")["counter"], json!(10));
        assert_eq!(state.upcoming_agent_state_vars("AA")["counter"], json!(11));
    }

    #[tokio::test]
    async fn test_load_initial_reports_replay_failure() {
        let (_, estimator, engine) = engine();
        engine.enqueue(request("t1", json!({"increment": 1}))).await.unwrap();
        estimator.set_failing(true);

        let result = engine.load_initial("AA", Map::new(), Balances::new()).await;
        assert!(matches!(result, Err(EngineError::Estimator(_))));
        assert_eq!(engine.lock().await.pending_units(), vec!["t1"]);
    }

    #[tokio::test]
    async fn test_definition_without_payload_is_malformed() {
        let (_, _, engine) = engine();
        let result = engine.on_definition(&Unit::new("u1", vec![])).await;
        assert!(matches!(result, Err(EngineError::MalformedNotification(_))));
    }

    #[tokio::test]
    async fn test_with_config_validates() {
        let mut config = EngineConfig::default();
        config.events.capacity = 0;
        let result = AaStateEngine::with_config(
            Arc::new(MockLedger::new()),
            Arc::new(MockEstimator::new()),
            config,
        );
        assert!(matches!(result, Err(EngineError::Config(_))));
    }
}
