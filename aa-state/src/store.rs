//! Confirmed and upcoming state of followed AAs.
//!
//! The confirmed snapshot only changes through ledger-confirmed responses and
//! initial loads. The upcoming snapshot is owned separately and is replaced
//! wholesale by the replay engine; the two never share substructure.

use aa_ledger::{
    AaResponse, AgentStateVars, Balances, BalancesByAgent, StateSnapshot, StateVar,
    StateVarEntry, StateVarsByAgent,
};
use serde_json::{Map, Value};
use std::collections::HashMap;
use tracing::{debug, trace};

use crate::types::{EngineError, Result};

/// Convert state variables read from the ledger into settled entries.
pub fn settled_vars(vars: Map<String, Value>, coerce: impl Fn(&Value) -> Value) -> AgentStateVars {
    vars.into_iter()
        .map(|(name, value)| (name, StateVarEntry::Present(StateVar::settled(coerce(&value)))))
        .collect()
}

/// Balances carried by a confirmed response.
///
/// Light clients only learn balances from the confirming vendor, so a
/// response without them cannot be applied.
pub fn required_balances(response: &AaResponse) -> Result<&Balances> {
    response.balances.as_ref().ok_or_else(|| {
        EngineError::MalformedNotification(format!(
            "no balances in response to {} from {}",
            response.trigger_unit, response.aa_address
        ))
    })
}

/// Confirmed and upcoming snapshots.
#[derive(Debug, Clone, Default)]
pub struct StateStore {
    confirmed: StateSnapshot,
    upcoming: StateSnapshot,
}

impl StateStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed both views of a newly followed AA.
    pub fn load_initial(&mut self, address: &str, vars: AgentStateVars, balances: Balances) {
        debug!(aa_address = %address, vars = vars.len(), assets = balances.len(), "Loading initial state");
        self.confirmed
            .state_vars
            .insert(address.to_string(), vars.clone());
        self.upcoming.state_vars.insert(address.to_string(), vars);
        self.add_balances(address, balances);
    }

    /// Seed both views of an AA's balances.
    pub fn add_balances(&mut self, address: &str, balances: Balances) {
        self.confirmed
            .balances
            .insert(address.to_string(), balances.clone());
        self.upcoming.balances.insert(address.to_string(), balances);
    }

    /// Whether confirmed balances of an AA are known.
    pub fn has_balances(&self, address: &str) -> bool {
        self.confirmed.balances.contains_key(address)
    }

    /// Apply a ledger-confirmed response to the confirmed view.
    ///
    /// Deleted variables are removed, updated ones settle at their coerced
    /// value, and the AA's balances are replaced by the reported snapshot.
    /// The upcoming view is left for the replay engine to rebuild.
    pub fn apply_confirmed_response(
        &mut self,
        response: &AaResponse,
        coerce: impl Fn(&Value) -> Value,
    ) -> Result<()> {
        let balances = required_balances(response)?.clone();

        if let Some(updated) = &response.updated_state_vars {
            for (address, vars) in updated {
                let agent_vars = self.confirmed.state_vars.entry(address.clone()).or_default();
                for (name, update) in vars {
                    if update.is_deletion() {
                        trace!(aa_address = %address, var = %name, "Deleting state var");
                        agent_vars.remove(name);
                    } else {
                        trace!(aa_address = %address, var = %name, value = %update.value, "Updating state var");
                        agent_vars.insert(
                            name.clone(),
                            StateVarEntry::Present(StateVar::settled(coerce(&update.value))),
                        );
                    }
                }
            }
        }

        self.confirmed
            .balances
            .insert(response.aa_address.clone(), balances);
        Ok(())
    }

    /// Confirmed snapshot.
    pub fn confirmed(&self) -> &StateSnapshot {
        &self.confirmed
    }

    /// Upcoming snapshot.
    pub fn upcoming(&self) -> &StateSnapshot {
        &self.upcoming
    }

    /// Replace the upcoming snapshot with a rebuilt one.
    pub fn replace_upcoming(&mut self, upcoming: StateSnapshot) {
        self.upcoming = upcoming;
    }

    /// Confirmed state variables of every AA.
    pub fn state_vars(&self) -> &StateVarsByAgent {
        &self.confirmed.state_vars
    }

    /// Confirmed variable values of one AA.
    pub fn agent_state_vars(&self, address: &str) -> HashMap<String, Value> {
        self.confirmed.agent_values(address)
    }

    /// Upcoming state variables of every AA, tombstones included.
    pub fn upcoming_state_vars(&self) -> &StateVarsByAgent {
        &self.upcoming.state_vars
    }

    /// Upcoming variable values of one AA, tombstones filtered out.
    pub fn upcoming_agent_state_vars(&self, address: &str) -> HashMap<String, Value> {
        self.upcoming.agent_values(address)
    }

    /// Confirmed balances of every AA.
    pub fn balances(&self) -> &BalancesByAgent {
        &self.confirmed.balances
    }

    /// Upcoming balances of every AA.
    pub fn upcoming_balances(&self) -> &BalancesByAgent {
        &self.upcoming.balances
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aa_ledger::VarUpdate;
    use serde_json::json;

    fn seeded() -> StateStore {
        let mut store = StateStore::new();
        let mut vars = Map::new();
        vars.insert("x".into(), json!(1));
        vars.insert("y".into(), json!("keep"));
        let balances = Balances::from([("base".to_string(), 100), ("asset1".to_string(), 7)]);
        store.load_initial("AA", settled_vars(vars, Value::clone), balances);
        store
    }

    #[test]
    fn test_load_initial_seeds_independent_views() {
        let mut store = seeded();
        assert_eq!(store.confirmed(), store.upcoming());

        let mut upcoming = store.upcoming().clone();
        upcoming.set_var("AA", "x", json!(2));
        store.replace_upcoming(upcoming);

        assert_eq!(store.agent_state_vars("AA")["x"], json!(1));
        assert_eq!(store.upcoming_agent_state_vars("AA")["x"], json!(2));
    }

    #[test]
    fn test_deletion_removes_confirmed_var() {
        let mut store = seeded();
        let response = AaResponse::new("AA", "t1")
            .with_balances(Balances::from([("base".to_string(), 100)]))
            .with_update("AA", "x", VarUpdate::delete())
            .with_update("AA", "z", VarUpdate::set(json!(3)));

        store.apply_confirmed_response(&response, Value::clone).unwrap();

        let vars = store.agent_state_vars("AA");
        assert!(!vars.contains_key("x"));
        assert_eq!(vars["y"], json!("keep"));
        assert_eq!(
            store.state_vars()["AA"]["z"],
            StateVarEntry::Present(StateVar::settled(json!(3)))
        );
    }

    #[test]
    fn test_balances_are_replaced_not_merged() {
        let mut store = seeded();
        let response =
            AaResponse::new("AA", "t1").with_balances(Balances::from([("base".to_string(), 500)]));

        store.apply_confirmed_response(&response, Value::clone).unwrap();

        assert_eq!(store.balances()["AA"], Balances::from([("base".to_string(), 500)]));
    }

    #[test]
    fn test_missing_balances_rejects_without_mutation() {
        let mut store = seeded();
        let before = store.confirmed().clone();
        let response = AaResponse::new("AA", "t1").with_update("AA", "x", VarUpdate::delete());

        let result = store.apply_confirmed_response(&response, Value::clone);

        assert!(matches!(result, Err(EngineError::MalformedNotification(_))));
        assert_eq!(store.confirmed(), &before);
    }

    #[test]
    fn test_updated_values_are_coerced() {
        let mut store = seeded();
        let response = AaResponse::new("AA", "t1")
            .with_balances(Balances::new())
            .with_update("AA", "n", VarUpdate::set(json!("5")));

        store
            .apply_confirmed_response(&response, |v| {
                v.as_str()
                    .and_then(|s| s.parse::<i64>().ok())
                    .map(Value::from)
                    .unwrap_or_else(|| v.clone())
            })
            .unwrap();

        assert_eq!(store.agent_state_vars("AA")["n"], json!(5));
    }
}
