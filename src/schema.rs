use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::TableId;
use crate::error::{StoreError, StoreResult};
use crate::mutation::{Token, TokenRange};

/// Address of a peer node.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Endpoint(pub String);

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Table schema snapshot. Tables hold one of these behind an `Arc` and swap
/// it wholesale on alter; memtables keep the snapshot they were created with
/// until `set_schema` pushes the new one down.
#[derive(Debug)]
pub struct Schema {
    pub id: TableId,
    pub ks_name: String,
    pub cf_name: String,
    pub version: Uuid,
    /// Number of clustering key components.
    pub clustering_key_size: usize,
    /// Whether the compaction strategy wants the per-component clustering
    /// range filter applied on single-key reads.
    pub use_clustering_filter: bool,
    synced: AtomicBool,
}

impl Schema {
    pub fn new(
        id: TableId,
        ks_name: impl Into<String>,
        cf_name: impl Into<String>,
        clustering_key_size: usize,
    ) -> Self {
        Self {
            id,
            ks_name: ks_name.into(),
            cf_name: cf_name.into(),
            version: Uuid::new_v4(),
            clustering_key_size,
            use_clustering_filter: true,
            synced: AtomicBool::new(false),
        }
    }

    /// Synced means the schema registry has seen this version; mutations
    /// against unsynced schemas are rejected.
    pub fn is_synced(&self) -> bool {
        self.synced.load(Ordering::Acquire)
    }

    pub fn mark_synced(&self) {
        self.synced.store(true, Ordering::Release);
    }

    pub fn for_tests(ks_name: &str, cf_name: &str) -> Self {
        let schema = Self::new(TableId::new_random(), ks_name, cf_name, 1);
        schema.mark_synced();
        schema
    }
}

/// Ring of tokens to endpoints. The ring version bumps on every topology
/// change and invalidates cached endpoint calculations.
#[derive(Debug, Default)]
pub struct TokenMetadata {
    ring: RwLock<BTreeMap<Token, Endpoint>>,
    ring_version: AtomicU64,
}

impl TokenMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update_normal_tokens(&self, tokens: Vec<Token>, endpoint: Endpoint) {
        let mut ring = self.ring.write();
        for token in tokens {
            ring.insert(token, endpoint.clone());
        }
        self.ring_version.fetch_add(1, Ordering::AcqRel);
    }

    pub fn sorted_tokens(&self) -> Vec<Token> {
        self.ring.read().keys().copied().collect()
    }

    pub fn endpoint_for(&self, token: Token) -> Option<Endpoint> {
        self.ring.read().get(&token).cloned()
    }

    /// Owner token of `search`: the first ring token at or after it,
    /// wrapping to the smallest token.
    pub fn first_token(&self, search: Token) -> Option<Token> {
        let ring = self.ring.read();
        ring.range(search..)
            .next()
            .or_else(|| ring.iter().next())
            .map(|(t, _)| *t)
    }

    pub fn ring_version(&self) -> u64 {
        self.ring_version.load(Ordering::Acquire)
    }
}

/// Placement policy seam. Implementations compute replica sets from the
/// ring; the engine consumes them for ownership and streaming decisions.
pub trait ReplicationStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn calculate_natural_endpoints(
        &self,
        search: Token,
        token_metadata: &TokenMetadata,
    ) -> Vec<Endpoint>;

    /// Option keys this strategy understands, or `None` for "anything".
    fn recognized_options(&self) -> Option<Vec<&'static str>>;

    fn validate_options(&self) -> StoreResult<()>;
}

/// Replicates each token range to the next `replication_factor` distinct
/// endpoints walking the ring clockwise.
pub struct SimpleStrategy {
    options: BTreeMap<String, String>,
}

impl SimpleStrategy {
    pub fn new(options: BTreeMap<String, String>) -> Self {
        Self { options }
    }

    fn replication_factor(&self) -> StoreResult<usize> {
        let raw = self
            .options
            .get("replication_factor")
            .ok_or_else(|| StoreError::invalid_config("SimpleStrategy requires replication_factor"))?;
        let rf: i64 = raw.parse().map_err(|_| {
            StoreError::invalid_config(format!(
                "Replication factor must be numeric; found {raw}"
            ))
        })?;
        if rf < 0 {
            return Err(StoreError::invalid_config(format!(
                "Replication factor must be non-negative; found {raw}"
            )));
        }
        Ok(rf as usize)
    }
}

impl ReplicationStrategy for SimpleStrategy {
    fn name(&self) -> &'static str {
        "SimpleStrategy"
    }

    fn calculate_natural_endpoints(
        &self,
        search: Token,
        token_metadata: &TokenMetadata,
    ) -> Vec<Endpoint> {
        let rf = match self.replication_factor() {
            Ok(rf) => rf,
            Err(_) => return Vec::new(),
        };
        let tokens = token_metadata.sorted_tokens();
        if tokens.is_empty() || rf == 0 {
            return Vec::new();
        }
        let start = tokens.partition_point(|t| *t < search);
        let mut endpoints = Vec::new();
        for i in 0..tokens.len() {
            let token = tokens[(start + i) % tokens.len()];
            if let Some(ep) = token_metadata.endpoint_for(token) {
                if !endpoints.contains(&ep) {
                    endpoints.push(ep);
                    if endpoints.len() == rf {
                        break;
                    }
                }
            }
        }
        endpoints
    }

    fn recognized_options(&self) -> Option<Vec<&'static str>> {
        Some(vec!["replication_factor"])
    }

    fn validate_options(&self) -> StoreResult<()> {
        self.replication_factor().map(|_| ())
    }
}

/// Instantiate a strategy by name.
pub fn create_replication_strategy(
    strategy_name: &str,
    options: BTreeMap<String, String>,
) -> StoreResult<Box<dyn ReplicationStrategy>> {
    match strategy_name {
        "SimpleStrategy" | "org.apache.cassandra.locator.SimpleStrategy" => {
            Ok(Box::new(SimpleStrategy::new(options)))
        }
        other => Err(StoreError::invalid_config(format!(
            "unknown replication strategy class {other}"
        ))),
    }
}

/// Validate a strategy configuration: instantiable, options well formed,
/// no unrecognized keys.
pub fn validate_replication_strategy(
    ks_name: &str,
    strategy_name: &str,
    options: &BTreeMap<String, String>,
) -> StoreResult<()> {
    let strategy = create_replication_strategy(strategy_name, options.clone())?;
    strategy.validate_options()?;
    if let Some(expected) = strategy.recognized_options() {
        for key in options.keys() {
            if !expected.contains(&key.as_str()) {
                return Err(StoreError::invalid_config(format!(
                    "Unrecognized strategy option {{{key}}} passed to {strategy_name} for keyspace {ks_name}"
                )));
            }
        }
    }
    Ok(())
}

/// Strategy plus an endpoint cache invalidated by ring version.
pub struct StrategyHolder {
    strategy: Box<dyn ReplicationStrategy>,
    cached: Mutex<CachedEndpoints>,
    cache_hits: AtomicU64,
}

#[derive(Default)]
struct CachedEndpoints {
    ring_version: u64,
    by_token: HashMap<Token, Vec<Endpoint>>,
}

impl StrategyHolder {
    pub fn new(strategy: Box<dyn ReplicationStrategy>) -> Self {
        Self {
            strategy,
            cached: Mutex::new(CachedEndpoints::default()),
            cache_hits: AtomicU64::new(0),
        }
    }

    pub fn strategy(&self) -> &dyn ReplicationStrategy {
        self.strategy.as_ref()
    }

    pub fn cache_hits(&self) -> u64 {
        self.cache_hits.load(Ordering::Relaxed)
    }

    pub fn natural_endpoints(&self, search: Token, tm: &TokenMetadata) -> Vec<Endpoint> {
        let key = match tm.first_token(search) {
            Some(t) => t,
            None => return Vec::new(),
        };
        let mut cached = self.cached.lock();
        if cached.ring_version != tm.ring_version() {
            cached.by_token.clear();
            cached.ring_version = tm.ring_version();
        }
        if let Some(eps) = cached.by_token.get(&key) {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
            return eps.clone();
        }
        let endpoints = self.strategy.calculate_natural_endpoints(search, tm);
        cached.by_token.insert(key, endpoints.clone());
        endpoints
    }

    /// Token ranges replicated to `endpoint`, unwrapped so no range crosses
    /// the ring origin.
    pub fn get_ranges(&self, endpoint: &Endpoint, tm: &TokenMetadata) -> Vec<TokenRange> {
        let tokens = tm.sorted_tokens();
        let mut ranges = Vec::new();
        let Some(mut prev) = tokens.last().copied() else {
            return ranges;
        };
        for token in tokens {
            let replicas = self.strategy.calculate_natural_endpoints(token, tm);
            if replicas.iter().any(|ep| ep == endpoint) {
                if prev < token {
                    ranges.push(TokenRange::open_closed(prev, token));
                } else {
                    // Wrapping range: split at the ring origin, smaller half first.
                    ranges.insert(
                        0,
                        TokenRange {
                            start: std::ops::Bound::Unbounded,
                            end: std::ops::Bound::Included(token),
                        },
                    );
                    ranges.push(TokenRange {
                        start: std::ops::Bound::Excluded(prev),
                        end: std::ops::Bound::Unbounded,
                    });
                }
            }
            prev = token;
        }
        ranges
    }
}

/// Durable description of a keyspace: replication settings plus the schemas
/// of its tables.
pub struct KeyspaceMetadata {
    pub name: String,
    pub strategy_name: String,
    pub strategy_options: BTreeMap<String, String>,
    pub durable_writes: bool,
    tables: RwLock<HashMap<String, Arc<Schema>>>,
}

impl KeyspaceMetadata {
    pub fn new(
        name: impl Into<String>,
        strategy_name: impl Into<String>,
        strategy_options: BTreeMap<String, String>,
        durable_writes: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            strategy_name: strategy_name.into(),
            strategy_options,
            durable_writes,
            tables: RwLock::new(HashMap::new()),
        })
    }

    pub fn validate(&self) -> StoreResult<()> {
        validate_replication_strategy(&self.name, &self.strategy_name, &self.strategy_options)
    }

    pub fn add_or_update_table(&self, schema: Arc<Schema>) {
        self.tables.write().insert(schema.cf_name.clone(), schema);
    }

    pub fn remove_table(&self, cf_name: &str) {
        self.tables.write().remove(cf_name);
    }

    pub fn table(&self, cf_name: &str) -> Option<Arc<Schema>> {
        self.tables.read().get(cf_name).cloned()
    }

    pub fn tables(&self) -> Vec<Arc<Schema>> {
        self.tables.read().values().cloned().collect()
    }
}

/// A keyspace as the engine sees it: metadata, resolved strategy, data dir.
pub struct Keyspace {
    metadata: RwLock<Arc<KeyspaceMetadata>>,
    strategy: RwLock<Option<Arc<StrategyHolder>>>,
    pub datadir: PathBuf,
}

impl Keyspace {
    pub fn new(metadata: Arc<KeyspaceMetadata>, datadir: PathBuf) -> Self {
        Self {
            metadata: RwLock::new(metadata),
            strategy: RwLock::new(None),
            datadir,
        }
    }

    pub fn metadata(&self) -> Arc<KeyspaceMetadata> {
        self.metadata.read().clone()
    }

    pub fn create_replication_strategy(&self) -> StoreResult<()> {
        let md = self.metadata();
        let strategy = create_replication_strategy(&md.strategy_name, md.strategy_options.clone())?;
        *self.strategy.write() = Some(Arc::new(StrategyHolder::new(strategy)));
        Ok(())
    }

    pub fn replication_strategy(&self) -> Option<Arc<StrategyHolder>> {
        self.strategy.read().clone()
    }

    pub fn update_from(&self, metadata: Arc<KeyspaceMetadata>) -> StoreResult<()> {
        *self.metadata.write() = metadata;
        self.create_replication_strategy()
    }

    /// `<datadir>/<cfname>-<uuid_hex>` per the persisted layout.
    pub fn column_family_directory(&self, cf_name: &str, id: TableId) -> PathBuf {
        self.datadir
            .join(format!("{}-{}", cf_name, id.dirname_fragment()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn simple_options(rf: &str) -> BTreeMap<String, String> {
        let mut options = BTreeMap::new();
        options.insert("replication_factor".to_string(), rf.to_string());
        options
    }

    #[test]
    fn validate_rejects_non_numeric_rf() {
        let err = validate_replication_strategy("ks", "SimpleStrategy", &simple_options("three"))
            .unwrap_err();
        assert!(matches!(err, StoreError::ConfigurationInvalid(_)));
    }

    #[test]
    fn validate_rejects_negative_rf() {
        let err = validate_replication_strategy("ks", "SimpleStrategy", &simple_options("-1"))
            .unwrap_err();
        assert!(matches!(err, StoreError::ConfigurationInvalid(_)));
    }

    #[test]
    fn validate_rejects_unrecognized_option() {
        let mut options = simple_options("1");
        options.insert("bogus".to_string(), "1".to_string());
        let err = validate_replication_strategy("ks", "SimpleStrategy", &options).unwrap_err();
        assert!(err.to_string().contains("bogus"));
    }

    #[test]
    fn validate_rejects_unknown_strategy() {
        let err = validate_replication_strategy("ks", "MadeUpStrategy", &BTreeMap::new())
            .unwrap_err();
        assert!(matches!(err, StoreError::ConfigurationInvalid(_)));
    }

    #[test]
    fn simple_strategy_walks_the_ring() {
        let tm = TokenMetadata::new();
        tm.update_normal_tokens(vec![Token::new(100)], Endpoint("a".into()));
        tm.update_normal_tokens(vec![Token::new(200)], Endpoint("b".into()));
        tm.update_normal_tokens(vec![Token::new(300)], Endpoint("c".into()));

        let strategy = SimpleStrategy::new(simple_options("2"));
        let eps = strategy.calculate_natural_endpoints(Token::new(150), &tm);
        assert_eq!(eps, vec![Endpoint("b".into()), Endpoint("c".into())]);

        // Wraps past the largest token.
        let eps = strategy.calculate_natural_endpoints(Token::new(400), &tm);
        assert_eq!(eps, vec![Endpoint("a".into()), Endpoint("b".into())]);
    }

    #[test]
    fn endpoint_cache_invalidated_by_ring_version() {
        let tm = TokenMetadata::new();
        tm.update_normal_tokens(vec![Token::new(100)], Endpoint("a".into()));
        let holder = StrategyHolder::new(Box::new(SimpleStrategy::new(simple_options("1"))));

        assert_eq!(holder.natural_endpoints(Token::new(50), &tm).len(), 1);
        assert_eq!(holder.natural_endpoints(Token::new(50), &tm).len(), 1);
        assert_eq!(holder.cache_hits(), 1);

        tm.update_normal_tokens(vec![Token::new(200)], Endpoint("b".into()));
        holder.natural_endpoints(Token::new(50), &tm);
        assert_eq!(holder.cache_hits(), 1);
    }

    #[test]
    fn keyspace_directory_uses_hex_table_id() {
        let ks = Keyspace::new(
            KeyspaceMetadata::new("ks", "SimpleStrategy", simple_options("1"), true),
            PathBuf::from("/data/ks"),
        );
        let id = TableId::new_random();
        let dir = ks.column_family_directory("events", id);
        let name = dir.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("events-"));
        assert!(!name.contains("--"));
    }
}
