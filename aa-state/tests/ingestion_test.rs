//! Notification ingestion integration tests
//!
//! Feeds raw light-client messages through the dispatch loop and checks
//! how each notification class reaches the engine.

use aa_ledger::mock::{MockEstimator, MockLedger};
use aa_ledger::Balances;
use aa_state::{spawn_ingestion, AaStateEngine, EngineError, EngineEvent, Notification};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_test::assert_ok;

const AA: &str = "AAADDRESS";

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn notification(subject: &str, body: Value) -> Notification {
    match Notification::from_message(subject, body) {
        Ok(Some(notification)) => notification,
        other => panic!("could not decode {}: {:?}", subject, other),
    }
}

fn request_body(unit: &str, increment: i64) -> Value {
    json!({
        "aa_address": AA,
        "unit": {
            "unit": unit,
            "authors": [{"address": "USER"}],
            "messages": [{"app": "data", "payload_location": "inline", "payload": {"increment": increment}}],
            "timestamp": 1_700_000_000
        }
    })
}

fn response_body(unit: &str, balances: Option<Value>) -> Value {
    let mut body = json!({
        "mci": 10,
        "trigger_address": "USER",
        "trigger_unit": unit,
        "trigger_initial_unit": unit,
        "aa_address": AA,
        "bounced": false,
        "response": {"responseVars": {"message": "ok"}},
        "updatedStateVars": {AA: {"counter": {"value": 1}}},
        "timestamp": 1_700_000_000
    });
    if let Some(balances) = balances {
        body["balances"] = balances;
    }
    body
}

fn engine() -> (Arc<MockLedger>, Arc<MockEstimator>, Arc<AaStateEngine>) {
    init_tracing();
    let ledger = Arc::new(MockLedger::new());
    ledger.set_balances(AA, Balances::from([("base".to_string(), 1_000)]));
    let estimator = Arc::new(MockEstimator::new());
    let engine = Arc::new(AaStateEngine::new(ledger.clone(), estimator.clone()));
    (ledger, estimator, engine)
}

#[tokio::test]
async fn test_notifications_applied_in_order() {
    let (_, _, engine) = engine();
    let (tx, rx) = mpsc::channel(16);
    let handle = spawn_ingestion(engine.clone(), rx);

    tx.send(notification("light/aa_request", request_body("t1", 1))).await.unwrap();
    tx.send(notification("light/aa_request", request_body("t2", 1))).await.unwrap();
    tx.send(notification(
        "light/aa_response",
        response_body("t1", Some(json!({"base": 990}))),
    ))
    .await
    .unwrap();
    drop(tx);

    assert_ok!(handle.await.unwrap());

    let state = engine.lock().await;
    assert_eq!(state.pending_units(), vec!["t2"]);
    assert_eq!(state.agent_state_vars(AA)["counter"], json!(1));
    assert_eq!(state.upcoming_agent_state_vars(AA)["counter"], json!(2));
    assert_eq!(state.balances()[AA]["base"], 990);
}

#[tokio::test]
async fn test_malformed_notification_is_dropped() {
    let (_, _, engine) = engine();
    let (tx, rx) = mpsc::channel(16);
    let handle = spawn_ingestion(engine.clone(), rx);

    tx.send(notification("light/aa_request", request_body("t1", 1))).await.unwrap();
    // No balances: dropped, the loop keeps going
    tx.send(notification("light/aa_response", response_body("t1", None))).await.unwrap();
    tx.send(notification("light/aa_request", request_body("t2", 1))).await.unwrap();
    drop(tx);

    assert_ok!(handle.await.unwrap());
    assert_eq!(engine.lock().await.pending_units(), vec!["t1", "t2"]);
}

#[tokio::test]
async fn test_fatal_error_stops_ingestion() {
    let (_, estimator, engine) = engine();
    let (tx, rx) = mpsc::channel(16);
    let handle = spawn_ingestion(engine.clone(), rx);

    estimator.set_failing(true);
    tx.send(notification("light/aa_request", request_body("t1", 1))).await.unwrap();

    let result = handle.await.unwrap();
    assert!(matches!(result, Err(EngineError::Estimator(_))));
    assert!(tx.send(notification("light/aa_request", request_body("t2", 1))).await.is_err());
}

#[tokio::test]
async fn test_definition_and_feed_notifications() {
    let (ledger, _, engine) = engine();
    ledger.set_data_feed("ORACLE", "PRICE", json!(1));
    assert_ok!(engine.refresh_oracle("ORACLE", "PRICE", false).await);

    let mut base_events = engine.subscribe_agent("BASEAA");
    let mut all_events = engine.subscribe();
    let (tx, rx) = mpsc::channel(16);
    let handle = spawn_ingestion(engine.clone(), rx);

    tx.send(notification(
        "light/aa_definition",
        json!({
            "unit": "d1",
            "messages": [{
                "app": "definition",
                "payload": {
                    "address": "CHILDAA",
                    "definition": ["autonomous agent", {"base_aa": "BASEAA", "params": {"fee": 1}}]
                }
            }]
        }),
    ))
    .await
    .unwrap();
    tx.send(notification(
        "joint",
        json!({"unit": {
            "unit": "f1",
            "authors": [{"address": "ORACLE"}],
            "messages": [{"app": "data_feed", "payload": {"PRICE": 2}}],
            "timestamp": 500
        }}),
    ))
    .await
    .unwrap();
    drop(tx);
    assert_ok!(handle.await.unwrap());

    match assert_ok!(base_events.recv().await) {
        EngineEvent::DefinitionApplied { definition, unit } => {
            assert_eq!(definition.address, "CHILDAA");
            assert_eq!(unit, "d1");
        }
        other => panic!("unexpected event {:?}", other),
    }

    assert!(matches!(
        assert_ok!(all_events.recv().await),
        EngineEvent::DefinitionApplied { .. }
    ));
    match assert_ok!(all_events.recv().await) {
        EngineEvent::OraclesUpdated { oracles } => {
            assert_eq!(oracles.len(), 1);
            assert_eq!(oracles[0].to_string(), "ORACLE:PRICE");
        }
        other => panic!("unexpected event {:?}", other),
    }
    assert_eq!(engine.oracle_value("ORACLE", "PRICE").await, Some(json!(2)));
}
