//! Time-indexed data feed cache.
//!
//! Keeps the latest value of every (oracle, feed) pair the engine has been
//! asked about, plus a short history keyed by ledger timestamp so that a
//! replayed trigger sees the value that was current when it was sent.
//!
//! - Refreshes from the ledger are rate-limited by a cooldown unless forced
//! - Live values arrive with new units authored by the oracle
//! - History older than the configured window is pruned on each update

use aa_ledger::{DataFeedReader, LedgerAccessor, LedgerError, Unit};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::OracleConfig;

/// Identifies a data feed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OracleKey {
    /// Oracle address
    pub address: String,
    /// Feed name
    pub feed_name: String,
}

impl OracleKey {
    /// Create a key.
    pub fn new(address: impl Into<String>, feed_name: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            feed_name: feed_name.into(),
        }
    }
}

impl std::fmt::Display for OracleKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.address, self.feed_name)
    }
}

/// Cached state of one data feed.
#[derive(Debug, Clone, PartialEq)]
pub struct Oracle {
    /// Feed identity
    pub key: OracleKey,
    /// Latest known value; `None` until fetched or if the feed does not exist
    pub value: Option<Value>,
    /// When the value was last fetched from the ledger
    pub last_fetch: Option<Instant>,
    /// Values by ledger timestamp (seconds)
    pub history: BTreeMap<u64, Value>,
}

impl Oracle {
    fn new(key: OracleKey) -> Self {
        Self {
            key,
            value: None,
            last_fetch: None,
            history: BTreeMap::new(),
        }
    }

    /// Value as it stood at `timestamp`, falling back to the latest value
    /// when history does not reach back that far.
    pub fn value_as_of(&self, timestamp: u64) -> Option<&Value> {
        self.history
            .range(..=timestamp)
            .next_back()
            .map(|(_, value)| value)
            .or(self.value.as_ref())
    }

    /// Record a value posted at `timestamp`. Returns whether the latest value changed.
    ///
    /// A value older than the newest one in history only lands in history.
    pub fn record(&mut self, timestamp: u64, value: Value) -> bool {
        let is_latest = self
            .history
            .last_key_value()
            .is_none_or(|(newest, _)| timestamp >= *newest);
        self.history.insert(timestamp, value.clone());
        if !is_latest {
            return false;
        }
        let changed = self.value.as_ref() != Some(&value);
        self.value = Some(value);
        changed
    }

    /// Drop history entries older than `cutoff`.
    pub fn prune(&mut self, cutoff: u64) {
        self.history = self.history.split_off(&cutoff);
    }
}

/// Cache of data feeds by oracle and feed name.
#[derive(Debug, Default)]
pub struct OracleCache {
    config: OracleConfig,
    oracles: HashMap<OracleKey, Oracle>,
    watched_sources: HashSet<String>,
}

impl OracleCache {
    /// Create an empty cache.
    pub fn new(config: OracleConfig) -> Self {
        Self {
            config,
            oracles: HashMap::new(),
            watched_sources: HashSet::new(),
        }
    }

    /// Cached record of a feed, created empty on first reference.
    pub fn get(&mut self, address: &str, feed_name: &str) -> &mut Oracle {
        let key = OracleKey::new(address, feed_name);
        self.oracles
            .entry(key.clone())
            .or_insert_with(|| Oracle::new(key))
    }

    /// Cached record of a feed, if referenced before.
    pub fn peek(&self, address: &str, feed_name: &str) -> Option<&Oracle> {
        self.oracles.get(&OracleKey::new(address, feed_name))
    }

    /// Number of cached feeds.
    pub fn len(&self) -> usize {
        self.oracles.len()
    }

    /// Whether no feed is cached.
    pub fn is_empty(&self) -> bool {
        self.oracles.is_empty()
    }

    /// Fetch a feed from the ledger unless it was fetched within the
    /// cooldown. Returns whether the latest value changed.
    ///
    /// The first reference to an oracle address registers a watch so that
    /// its new units are pushed to us.
    pub async fn refresh(
        &mut self,
        ledger: &dyn LedgerAccessor,
        address: &str,
        feed_name: &str,
        force: bool,
    ) -> Result<bool, LedgerError> {
        if !self.watched_sources.contains(address) {
            ledger.watch_address(address).await?;
            self.watched_sources.insert(address.to_string());
        }

        let cooldown = self.config.cooldown();
        let oracle = self.get(address, feed_name);
        if !force && oracle.last_fetch.is_some_and(|t| t.elapsed() < cooldown) {
            debug!(oracle = %oracle.key, "Oracle data is up to date");
            return Ok(false);
        }

        let value = ledger.read_data_feed(address, feed_name).await?;
        let changed = oracle.value != value;
        if changed {
            info!(
                oracle = %oracle.key,
                from = ?oracle.value,
                to = ?value,
                "Oracle value updated"
            );
        }
        oracle.value = value;
        oracle.last_fetch = Some(Instant::now());
        Ok(changed)
    }

    /// Take feed values posted in a new unit. Returns the feeds whose
    /// latest value changed, sorted.
    pub fn ingest_unit(&mut self, unit: &Unit) -> Vec<OracleKey> {
        if !unit.has_data_feed() {
            return Vec::new();
        }
        let cutoff = unit.timestamp.saturating_sub(self.config.history_window_secs);

        let mut changed: Vec<OracleKey> = self
            .oracles
            .values_mut()
            .filter(|oracle| unit.is_authored_by(&oracle.key.address))
            .filter_map(|oracle| {
                let value = unit.data_feed_value(&oracle.key.feed_name)?.clone();
                let updated = oracle.record(unit.timestamp, value);
                oracle.prune(cutoff);
                updated.then(|| oracle.key.clone())
            })
            .collect();

        changed.sort();
        if !changed.is_empty() {
            debug!(unit = %unit.unit, count = changed.len(), "Oracles updated from new unit");
        }
        changed
    }
}

impl DataFeedReader for OracleCache {
    fn read_data_feed(&self, oracles: &[String], feed_name: &str, as_of: Option<u64>) -> Option<Value> {
        oracles.iter().find_map(|address| {
            let oracle = self.peek(address, feed_name)?;
            match as_of {
                Some(timestamp) => oracle.value_as_of(timestamp).cloned(),
                None => oracle.value.clone(),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aa_ledger::mock::MockLedger;
    use aa_ledger::{Message, APP_DATA_FEED};
    use serde_json::json;
    use std::time::Duration;

    fn feed_unit(unit: &str, author: &str, timestamp: u64, payload: Value) -> Unit {
        Unit::new(unit, vec![Message::inline(APP_DATA_FEED, payload)])
            .with_author(author)
            .with_timestamp(timestamp)
    }

    #[test]
    fn test_value_as_of() {
        let mut cache = OracleCache::new(OracleConfig::default());
        let oracle = cache.get("ORACLE", "P");
        oracle.history.insert(100, json!("v1"));
        oracle.history.insert(200, json!("v2"));
        oracle.value = Some(json!("v3"));

        assert_eq!(oracle.value_as_of(150), Some(&json!("v1")));
        assert_eq!(oracle.value_as_of(250), Some(&json!("v2")));
        assert_eq!(oracle.value_as_of(200), Some(&json!("v2")));
        assert_eq!(oracle.value_as_of(50), Some(&json!("v3")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_cooldown_and_force() {
        let ledger = MockLedger::new();
        ledger.set_data_feed("ORACLE", "P", json!(10));
        let mut cache = OracleCache::new(OracleConfig::default());

        assert!(cache.refresh(&ledger, "ORACLE", "P", false).await.unwrap());
        assert!(!cache.refresh(&ledger, "ORACLE", "P", false).await.unwrap());
        assert_eq!(ledger.data_feed_reads(), 1);

        cache.refresh(&ledger, "ORACLE", "P", true).await.unwrap();
        assert_eq!(ledger.data_feed_reads(), 2);

        tokio::time::advance(Duration::from_secs(61)).await;
        cache.refresh(&ledger, "ORACLE", "P", false).await.unwrap();
        assert_eq!(ledger.data_feed_reads(), 3);
    }

    #[tokio::test]
    async fn test_first_reference_watches_source_once() {
        let ledger = MockLedger::new();
        let mut cache = OracleCache::new(OracleConfig::default());

        cache.refresh(&ledger, "ORACLE", "P", false).await.unwrap();
        cache.refresh(&ledger, "ORACLE", "Q", false).await.unwrap();

        assert_eq!(ledger.watched_addresses(), vec!["ORACLE".to_string()]);
        assert_eq!(cache.peek("ORACLE", "Q").and_then(|o| o.value.clone()), None);
    }

    #[test]
    fn test_ingest_unit_records_and_prunes() {
        let mut cache = OracleCache::new(OracleConfig::default());
        cache.get("ORACLE", "P");
        cache.get("ORACLE", "Q");
        cache.get("OTHER", "P");

        let first = feed_unit("u1", "ORACLE", 1_000, json!({"P": 1}));
        assert_eq!(cache.ingest_unit(&first), vec![OracleKey::new("ORACLE", "P")]);

        let later = 1_000 + 13 * 3600;
        let second = feed_unit("u2", "ORACLE", later, json!({"P": 2, "Q": "x"}));
        let changed = cache.ingest_unit(&second);
        assert_eq!(
            changed,
            vec![OracleKey::new("ORACLE", "P"), OracleKey::new("ORACLE", "Q")]
        );

        let oracle = cache.peek("ORACLE", "P").unwrap();
        assert_eq!(oracle.history.len(), 1);
        assert_eq!(oracle.value, Some(json!(2)));
        assert_eq!(cache.peek("OTHER", "P").unwrap().value, None);
    }

    #[test]
    fn test_same_value_is_not_a_change() {
        let mut cache = OracleCache::new(OracleConfig::default());
        cache.get("ORACLE", "P");

        cache.ingest_unit(&feed_unit("u1", "ORACLE", 100, json!({"P": 1})));
        let changed = cache.ingest_unit(&feed_unit("u2", "ORACLE", 200, json!({"P": 1})));

        assert!(changed.is_empty());
        assert_eq!(cache.peek("ORACLE", "P").unwrap().history.len(), 2);
    }

    #[test]
    fn test_out_of_order_unit_keeps_latest_value() {
        let mut cache = OracleCache::new(OracleConfig::default());
        cache.get("ORACLE", "P");

        let changed = cache.ingest_unit(&feed_unit("u2", "ORACLE", 200, json!({"P": "new"})));
        assert_eq!(changed, vec![OracleKey::new("ORACLE", "P")]);
        let changed = cache.ingest_unit(&feed_unit("u1", "ORACLE", 100, json!({"P": "old"})));
        assert!(changed.is_empty());

        let oracle = cache.peek("ORACLE", "P").unwrap();
        assert_eq!(oracle.value, Some(json!("new")));
        assert_eq!(oracle.value_as_of(150), Some(&json!("old")));
        assert_eq!(oracle.value_as_of(250), Some(&json!("new")));
    }

    #[test]
    fn test_reader_uses_history() {
        let mut cache = OracleCache::new(OracleConfig::default());
        cache.get("ORACLE", "P");
        cache.ingest_unit(&feed_unit("u1", "ORACLE", 100, json!({"P": 1})));
        cache.ingest_unit(&feed_unit("u2", "ORACLE", 200, json!({"P": 2})));

        let oracles = vec!["NONE".to_string(), "ORACLE".to_string()];
        assert_eq!(cache.read_data_feed(&oracles, "P", Some(150)), Some(json!(1)));
        assert_eq!(cache.read_data_feed(&oracles, "P", None), Some(json!(2)));
        assert_eq!(cache.read_data_feed(&oracles, "Q", None), None);
    }
}
