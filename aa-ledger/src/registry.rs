//! Token registry lookups with a TTL cache.
//!
//! The registry is itself an AA whose state variables map assets to symbols
//! (`a2s_<asset>`), symbols to assets (`s2a_<symbol>`), and assets to their
//! current description (`current_desc_<asset>` → `decimals_<desc>`).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::trace;

use crate::context::BASE_ASSET;
use crate::traits::{LedgerAccessor, LedgerError};

/// Symbol of the base asset.
pub const BASE_SYMBOL: &str = "GBYTE";

/// Decimals of the base asset.
pub const BASE_DECIMALS: u32 = 9;

/// Length of an asset identifier.
const ASSET_LEN: usize = 44;

/// Errors from registry lookups.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Asset identifier is empty
    #[error("Invalid asset")]
    InvalidAsset,

    /// Symbol is empty
    #[error("Invalid symbol")]
    InvalidSymbol,

    /// Registry address is malformed
    #[error("Invalid token registry address: {0}")]
    InvalidRegistryAddress(String),

    /// Ledger read failed
    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),
}

/// Token registry configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenRegistryConfig {
    /// Default registry AA
    pub registry_address: String,
    /// How long a successful lookup is cached (seconds)
    pub cache_lifetime_secs: u64,
}

impl Default for TokenRegistryConfig {
    fn default() -> Self {
        Self {
            registry_address: "O6H6ZIFI57X3PLTYHOCVYPP5A553CYFQ".to_string(),
            cache_lifetime_secs: 24 * 3600,
        }
    }
}

struct CacheEntry<T> {
    value: T,
    stored_at: Instant,
}

type Cache<T> = RwLock<HashMap<(String, String), CacheEntry<T>>>;

/// Cached symbol, asset and decimals lookups.
pub struct TokenRegistry {
    ledger: Arc<dyn LedgerAccessor>,
    config: TokenRegistryConfig,
    symbol_by_asset: Cache<String>,
    asset_by_symbol: Cache<String>,
    decimals_by_asset: Cache<u32>,
}

impl TokenRegistry {
    /// Create a registry client with default configuration.
    pub fn new(ledger: Arc<dyn LedgerAccessor>) -> Self {
        Self::with_config(ledger, TokenRegistryConfig::default())
    }

    /// Create with custom configuration.
    pub fn with_config(ledger: Arc<dyn LedgerAccessor>, config: TokenRegistryConfig) -> Self {
        Self {
            ledger,
            config,
            symbol_by_asset: RwLock::new(HashMap::new()),
            asset_by_symbol: RwLock::new(HashMap::new()),
            decimals_by_asset: RwLock::new(HashMap::new()),
        }
    }

    fn lifetime(&self) -> Duration {
        Duration::from_secs(self.config.cache_lifetime_secs)
    }

    fn registry<'a>(&'a self, custom: Option<&'a str>) -> Result<&'a str, RegistryError> {
        let address = custom.unwrap_or(&self.config.registry_address);
        if !is_valid_address(address) {
            return Err(RegistryError::InvalidRegistryAddress(address.to_string()));
        }
        Ok(address)
    }

    async fn cached<T: Clone>(&self, cache: &Cache<T>, registry: &str, key: &str) -> Option<T> {
        let cache = cache.read().await;
        cache
            .get(&(registry.to_string(), key.to_string()))
            .filter(|entry| entry.stored_at.elapsed() <= self.lifetime())
            .map(|entry| entry.value.clone())
    }

    async fn store<T>(&self, cache: &Cache<T>, registry: &str, key: &str, value: T) {
        cache.write().await.insert(
            (registry.to_string(), key.to_string()),
            CacheEntry {
                value,
                stored_at: Instant::now(),
            },
        );
    }

    async fn read_string(&self, registry: &str, var: &str) -> Result<Option<String>, RegistryError> {
        let value = self.ledger.read_state_var(registry, var).await?;
        Ok(value.and_then(|v| v.as_str().map(String::from)))
    }

    /// Symbol registered for an asset.
    pub async fn symbol_by_asset(
        &self,
        asset: &str,
        registry: Option<&str>,
    ) -> Result<Option<String>, RegistryError> {
        if asset == BASE_ASSET {
            return Ok(Some(BASE_SYMBOL.to_string()));
        }
        if asset.is_empty() {
            return Err(RegistryError::InvalidAsset);
        }
        let registry = self.registry(registry)?;

        if let Some(symbol) = self.cached(&self.symbol_by_asset, registry, asset).await {
            trace!(asset = %asset, symbol = %symbol, "Symbol cache hit");
            return Ok(Some(symbol));
        }

        let symbol = self.read_string(registry, &format!("a2s_{}", asset)).await?;
        if let Some(symbol) = &symbol {
            self.store(&self.symbol_by_asset, registry, asset, symbol.clone())
                .await;
        }
        Ok(symbol)
    }

    /// Asset registered under a symbol.
    pub async fn asset_by_symbol(
        &self,
        symbol: &str,
        registry: Option<&str>,
    ) -> Result<Option<String>, RegistryError> {
        if symbol.is_empty() {
            return Err(RegistryError::InvalidSymbol);
        }
        if matches!(symbol, "GBYTE" | "MBYTE" | "KBYTE" | "BYTE") {
            return Ok(Some(BASE_ASSET.to_string()));
        }
        let registry = self.registry(registry)?;

        if let Some(asset) = self.cached(&self.asset_by_symbol, registry, symbol).await {
            return Ok(Some(asset));
        }

        let asset = self.read_string(registry, &format!("s2a_{}", symbol)).await?;
        if let Some(asset) = &asset {
            self.store(&self.asset_by_symbol, registry, symbol, asset.clone())
                .await;
        }
        Ok(asset)
    }

    /// Decimals of an asset given either its identifier or its symbol.
    ///
    /// `None` when the symbol is unknown or the input is neither an asset nor
    /// an upper-case symbol; `Some(0)` when the asset has no description.
    pub async fn decimals(
        &self,
        symbol_or_asset: &str,
        registry: Option<&str>,
    ) -> Result<Option<u32>, RegistryError> {
        let registry = self.registry(registry)?;
        if symbol_or_asset.is_empty() {
            return Err(RegistryError::InvalidSymbol);
        }
        if symbol_or_asset == BASE_ASSET || symbol_or_asset == BASE_SYMBOL {
            return Ok(Some(BASE_DECIMALS));
        }

        let asset = if symbol_or_asset.len() == ASSET_LEN {
            symbol_or_asset.to_string()
        } else if symbol_or_asset == symbol_or_asset.to_uppercase() {
            match self.asset_by_symbol(symbol_or_asset, Some(registry)).await? {
                Some(asset) => asset,
                None => return Ok(None),
            }
        } else {
            return Ok(None);
        };

        if let Some(decimals) = self.cached(&self.decimals_by_asset, registry, &asset).await {
            return Ok(Some(decimals));
        }

        let Some(desc_hash) = self
            .read_string(registry, &format!("current_desc_{}", asset))
            .await?
        else {
            return Ok(Some(0));
        };

        let decimals = self
            .ledger
            .read_state_var(registry, &format!("decimals_{}", desc_hash))
            .await?
            .and_then(|v| v.as_u64())
            .and_then(|d| u32::try_from(d).ok());

        match decimals {
            Some(decimals) => {
                self.store(&self.decimals_by_asset, registry, &asset, decimals)
                    .await;
                Ok(Some(decimals))
            }
            None => Ok(Some(0)),
        }
    }
}

/// Whether `address` looks like a ledger address (32 base32 characters).
pub fn is_valid_address(address: &str) -> bool {
    address.len() == 32
        && address
            .chars()
            .all(|c| c.is_ascii_uppercase() || ('2'..='7').contains(&c))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockLedger;
    use serde_json::json;

    const REGISTRY: &str = "O6H6ZIFI57X3PLTYHOCVYPP5A553CYFQ";
    const ASSET: &str = "n9y3VomFeWFeZZ2PcSEcmyBb/bI7kzZduBJigNetnkY=";

    fn ledger() -> Arc<MockLedger> {
        let ledger = MockLedger::new();
        ledger.set_state_var(REGISTRY, &format!("a2s_{}", ASSET), json!("USDC"));
        ledger.set_state_var(REGISTRY, "s2a_USDC", json!(ASSET));
        ledger.set_state_var(REGISTRY, &format!("current_desc_{}", ASSET), json!("desc1"));
        ledger.set_state_var(REGISTRY, "decimals_desc1", json!(4));
        Arc::new(ledger)
    }

    #[tokio::test]
    async fn test_base_asset_shortcuts() {
        let registry = TokenRegistry::new(ledger());
        assert_eq!(
            registry.symbol_by_asset("base", None).await.unwrap().as_deref(),
            Some("GBYTE")
        );
        assert_eq!(
            registry.asset_by_symbol("MBYTE", None).await.unwrap().as_deref(),
            Some("base")
        );
        assert_eq!(registry.decimals("GBYTE", None).await.unwrap(), Some(9));
    }

    #[tokio::test]
    async fn test_lookups_are_cached() {
        let ledger = ledger();
        let registry = TokenRegistry::new(ledger.clone());

        let symbol = registry.symbol_by_asset(ASSET, None).await.unwrap();
        assert_eq!(symbol.as_deref(), Some("USDC"));
        let reads = ledger.state_var_reads();

        registry.symbol_by_asset(ASSET, None).await.unwrap();
        assert_eq!(ledger.state_var_reads(), reads);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_expires() {
        let ledger = ledger();
        let registry = TokenRegistry::with_config(
            ledger.clone(),
            TokenRegistryConfig {
                cache_lifetime_secs: 10,
                ..TokenRegistryConfig::default()
            },
        );

        registry.asset_by_symbol("USDC", None).await.unwrap();
        let reads = ledger.state_var_reads();

        tokio::time::advance(Duration::from_secs(11)).await;
        registry.asset_by_symbol("USDC", None).await.unwrap();
        assert_eq!(ledger.state_var_reads(), reads + 1);
    }

    #[tokio::test]
    async fn test_decimals_by_symbol() {
        let registry = TokenRegistry::new(ledger());
        assert_eq!(registry.decimals("USDC", None).await.unwrap(), Some(4));
        assert_eq!(registry.decimals(ASSET, None).await.unwrap(), Some(4));
        assert_eq!(registry.decimals("NOPE", None).await.unwrap(), None);
        assert_eq!(registry.decimals("lower", None).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_invalid_registry_address() {
        let registry = TokenRegistry::new(ledger());
        let result = registry.symbol_by_asset(ASSET, Some("short")).await;
        assert!(matches!(result, Err(RegistryError::InvalidRegistryAddress(_))));
    }
}
