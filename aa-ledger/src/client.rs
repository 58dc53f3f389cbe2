//! Light-vendor backed ledger accessor.
//!
//! Light clients do not store the ledger, so every read is a request to a
//! vendor. Requests that fail for transient reasons are retried per the
//! configured [`RetryPolicy`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::context::{AddressBalances, Balances};
use crate::retry::{RetryConfig, RetryPolicy};
use crate::traits::{LedgerAccessor, LedgerError, TransportError, VendorTransport};
use crate::types::AaDefinition;

/// Configuration for the light client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LightClientConfig {
    /// Maximum state variables returned by one vendor page
    pub state_vars_page_limit: usize,
    /// Retry behaviour for transient failures
    pub retry: RetryConfig,
}

impl Default for LightClientConfig {
    fn default() -> Self {
        Self {
            state_vars_page_limit: 2000,
            retry: RetryConfig::default(),
        }
    }
}

/// Ledger accessor talking to a light vendor.
pub struct LightClient<T: VendorTransport> {
    transport: Arc<T>,
    config: LightClientConfig,
    policy: RetryPolicy,
    /// Definitions already fetched
    definitions: RwLock<HashMap<String, AaDefinition>>,
}

impl<T: VendorTransport> LightClient<T> {
    /// Create a client with default configuration.
    pub fn new(transport: Arc<T>) -> Self {
        Self::with_config(transport, LightClientConfig::default())
    }

    /// Create with custom configuration.
    pub fn with_config(transport: Arc<T>, config: LightClientConfig) -> Self {
        let policy = RetryPolicy::new(config.retry.clone());
        Self {
            transport,
            config,
            policy,
            definitions: RwLock::new(HashMap::new()),
        }
    }

    /// Send a command, retrying transient failures.
    async fn request(&self, command: &str, params: Value) -> Result<Value, LedgerError> {
        let transport = &self.transport;
        self.policy
            .run(command, move || {
                let params = params.clone();
                async move { vendor_result(transport.request(command, params).await?) }
            })
            .await
    }

    /// Definition of an AA, fetched once.
    async fn definition(&self, aa_address: &str) -> Result<AaDefinition, LedgerError> {
        if let Some(known) = self.definitions.read().await.get(aa_address) {
            return Ok(known.clone());
        }

        let response = self
            .request("light/get_definition", json!(aa_address))
            .await?;
        if response.is_null() {
            return Err(LedgerError::NotFound(format!("definition of {}", aa_address)));
        }

        let definition = AaDefinition::new(aa_address, response);
        self.definitions
            .write()
            .await
            .insert(aa_address.to_string(), definition.clone());
        Ok(definition)
    }
}

/// Split a vendor reply into a value or a vendor error.
///
/// Vendors report failures as an object whose only key is `error`.
fn vendor_result(response: Value) -> Result<Value, TransportError> {
    if let Some(obj) = response.as_object() {
        if obj.len() == 1 {
            if let Some(error) = obj.get("error") {
                let message = error.as_str().map(String::from).unwrap_or_else(|| error.to_string());
                return Err(TransportError::Vendor(message));
            }
        }
    }
    Ok(response)
}

fn invalid(command: &str, reason: impl Into<String>) -> LedgerError {
    LedgerError::InvalidResponse {
        command: command.to_string(),
        reason: reason.into(),
    }
}

#[async_trait]
impl<T: VendorTransport> LedgerAccessor for LightClient<T> {
    async fn read_state_vars(
        &self,
        aa_address: &str,
        prefix: &str,
    ) -> Result<Map<String, Value>, LedgerError> {
        const COMMAND: &str = "light/get_aa_state_vars";
        let limit = self.config.state_vars_page_limit;
        let mut vars = Map::new();
        let mut from: Option<String> = None;

        loop {
            let mut params = json!({
                "address": aa_address,
                "var_prefix": prefix,
                "limit": limit,
            });
            if let Some(from) = &from {
                params["var_prefix_from"] = json!(from);
            }

            let page = match self.request(COMMAND, params).await? {
                Value::Object(page) => page,
                other => return Err(invalid(COMMAND, format!("expected an object, got {}", other))),
            };
            let page_len = page.len();

            let mut last = from.clone();
            for (name, value) in page {
                if from.as_ref().is_some_and(|f| name.as_str() <= f.as_str()) {
                    continue;
                }
                if last.as_ref().map_or(true, |l| name > *l) {
                    last = Some(name.clone());
                }
                vars.insert(name, value);
            }

            if page_len < limit || last == from {
                break;
            }
            debug!(aa_address = %aa_address, fetched = vars.len(), "State vars page full, continuing");
            from = last;
        }

        Ok(vars)
    }

    async fn read_balances(&self, aa_address: &str) -> Result<Balances, LedgerError> {
        const COMMAND: &str = "light/get_aa_balances";
        let response = self
            .request(COMMAND, json!({ "address": aa_address }))
            .await?;
        let balances = response.get("balances").cloned().unwrap_or(Value::Null);
        if balances.is_null() {
            return Ok(Balances::new());
        }
        serde_json::from_value(balances).map_err(|e| invalid(COMMAND, e.to_string()))
    }

    async fn read_address_balances(&self, address: &str) -> Result<AddressBalances, LedgerError> {
        const COMMAND: &str = "light/get_balances";
        let mut response = self.request(COMMAND, json!([address])).await?;
        match response.get_mut(address).map(Value::take) {
            None | Some(Value::Null) => Ok(AddressBalances::new()),
            Some(balances) => {
                serde_json::from_value(balances).map_err(|e| invalid(COMMAND, e.to_string()))
            }
        }
    }

    async fn read_data_feed(
        &self,
        oracle: &str,
        feed_name: &str,
    ) -> Result<Option<Value>, LedgerError> {
        let params = json!({ "oracles": [oracle], "feed_name": feed_name });
        match self.request("light/get_data_feed", params).await {
            Ok(Value::Null) => Ok(None),
            Ok(value) => Ok(Some(value)),
            Err(LedgerError::Transport(TransportError::Vendor(message)))
                if message.contains("not found") =>
            {
                debug!(oracle = %oracle, feed_name = %feed_name, "Data feed does not exist");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn load_definition(&self, aa_address: &str) -> Result<AaDefinition, LedgerError> {
        let definition = self.definition(aa_address).await?;
        if let Some(base_aa) = &definition.base_aa {
            self.definition(base_aa).await?;
        }
        Ok(definition)
    }

    async fn execute_getter(
        &self,
        aa_address: &str,
        getter: &str,
        args: &[Value],
    ) -> Result<Value, LedgerError> {
        let mut params = json!({ "address": aa_address, "getter": getter });
        if !args.is_empty() {
            params["args"] = Value::Array(args.to_vec());
        }
        let response = self.request("light/execute_getter", params).await?;
        Ok(response.get("result").cloned().unwrap_or(Value::Null))
    }

    async fn get_aas_by_base_aas(
        &self,
        base_aas: &[String],
    ) -> Result<Vec<AaDefinition>, LedgerError> {
        const COMMAND: &str = "light/get_aas_by_base_aas";
        let response = self
            .request(COMMAND, json!({ "base_aas": base_aas }))
            .await?;
        let rows = response
            .as_array()
            .ok_or_else(|| invalid(COMMAND, "expected an array"))?;

        Ok(rows
            .iter()
            .filter_map(|row| {
                let address = row.get("address")?.as_str()?;
                let definition = row.get("definition")?.clone();
                Some(AaDefinition::new(address, definition))
            })
            .collect())
    }

    async fn watch_aa(&self, aa_address: &str) -> Result<(), LedgerError> {
        self.request("light/new_aa_to_watch", json!({ "aa": aa_address }))
            .await?;
        info!(aa_address = %aa_address, "Watching AA");
        Ok(())
    }

    async fn watch_address(&self, address: &str) -> Result<(), LedgerError> {
        self.request("light/new_address_to_watch", json!(address))
            .await?;
        info!(address = %address, "Watching address");
        Ok(())
    }
}
