//! State variables and balances as seen by the estimator.
//!
//! A [`StateSnapshot`] owns all of its data, so cloning one yields a fully
//! independent copy that an estimator may mutate freely.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Reserved asset identifier of the native currency.
pub const BASE_ASSET: &str = "base";

/// Balances of one AA by asset.
pub type Balances = HashMap<String, u64>;

/// Balances by AA address.
pub type BalancesByAgent = HashMap<String, Balances>;

/// Balance of one asset on a plain address.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AddressBalance {
    /// Confirmed amount
    pub stable: u64,
    /// Amount in unconfirmed outputs
    pub pending: u64,
}

impl AddressBalance {
    pub fn total(&self) -> u64 {
        self.stable.saturating_add(self.pending)
    }
}

/// Balances of a plain address by asset.
pub type AddressBalances = HashMap<String, AddressBalance>;

/// State variables of one AA by name.
pub type AgentStateVars = HashMap<String, StateVarEntry>;

/// State variables by AA address.
pub type StateVarsByAgent = HashMap<String, AgentStateVars>;

/// A state variable with its execution shadow copies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateVar {
    /// Current value
    pub value: Value,
    /// Value before the current execution step
    pub old_value: Value,
    /// Value before any speculative replay
    pub original_old_value: Value,
}

impl StateVar {
    /// A variable whose shadow copies all equal `value`.
    pub fn settled(value: Value) -> Self {
        Self {
            old_value: value.clone(),
            original_old_value: value.clone(),
            value,
        }
    }
}

/// A state variable slot: either holding a value or tombstoned.
///
/// Tombstones keep a deletion visible when a speculative copy is compared
/// against the state it was cloned from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum StateVarEntry {
    /// Variable holds a value
    Present(StateVar),
    /// Variable was deleted
    Deleted,
}

impl StateVarEntry {
    /// Current value, `None` when tombstoned.
    pub fn value(&self) -> Option<&Value> {
        match self {
            Self::Present(var) => Some(&var.value),
            Self::Deleted => None,
        }
    }

    /// Whether this entry is a tombstone.
    pub fn is_deleted(&self) -> bool {
        matches!(self, Self::Deleted)
    }
}

/// Live values of one AA's variables, tombstones filtered out.
pub fn live_values(vars: &AgentStateVars) -> HashMap<String, Value> {
    vars.iter()
        .filter_map(|(name, entry)| entry.value().map(|v| (name.clone(), v.clone())))
        .collect()
}

/// State variables and balances of every tracked AA.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    /// State variables by AA
    pub state_vars: StateVarsByAgent,
    /// Balances by AA
    pub balances: BalancesByAgent,
}

impl StateSnapshot {
    /// Create an empty snapshot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Live values of an AA's variables; tombstones are treated as absent.
    pub fn agent_values(&self, address: &str) -> HashMap<String, Value> {
        self.state_vars
            .get(address)
            .map(live_values)
            .unwrap_or_default()
    }

    /// Current value of a variable, `None` if absent or tombstoned.
    pub fn var_value(&self, address: &str, name: &str) -> Option<&Value> {
        self.state_vars
            .get(address)
            .and_then(|vars| vars.get(name))
            .and_then(StateVarEntry::value)
    }

    /// Set a variable during an execution step, keeping its pre-step values.
    pub fn set_var(&mut self, address: &str, name: &str, value: Value) {
        let vars = self.state_vars.entry(address.to_string()).or_default();
        match vars.get_mut(name) {
            Some(StateVarEntry::Present(var)) => {
                var.old_value = std::mem::replace(&mut var.value, value);
            }
            _ => {
                vars.insert(
                    name.to_string(),
                    StateVarEntry::Present(StateVar {
                        value,
                        old_value: Value::Bool(false),
                        original_old_value: Value::Bool(false),
                    }),
                );
            }
        }
    }

    /// Tombstone a variable.
    pub fn delete_var(&mut self, address: &str, name: &str) {
        self.state_vars
            .entry(address.to_string())
            .or_default()
            .insert(name.to_string(), StateVarEntry::Deleted);
    }

    /// Balance of an asset held by an AA.
    pub fn balance(&self, address: &str, asset: &str) -> u64 {
        self.balances
            .get(address)
            .and_then(|b| b.get(asset))
            .copied()
            .unwrap_or(0)
    }

    /// Credit an amount to an AA's balance.
    pub fn credit(&mut self, address: &str, asset: &str, amount: u64) {
        let balance = self
            .balances
            .entry(address.to_string())
            .or_default()
            .entry(asset.to_string())
            .or_insert(0);
        *balance = balance.saturating_add(amount);
    }
}
