//! Prepared statement caching with LRU eviction.
//!
//! This module provides automatic caching of prepared statements to improve performance
//! for repeated query execution. The cache uses an LRU (Least Recently Used) eviction
//! policy to manage memory and server-side resources.
//!
//! ## Lifecycle
//!
//! 1. First execution of a parameterized query calls `sp_prepare`, returning a handle
//! 2. The handle is cached by SQL hash; subsequent executions use `sp_execute`
//! 3. When the cache is full, LRU eviction calls `sp_unprepare` for evicted handles
//! 4. Pool reset (`sp_reset_connection`) invalidates all handles, clearing the cache
//! 5. Connection close implicitly releases all server-side handles

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::num::NonZeroUsize;
use std::time::Instant;

use lru::LruCache;

/// Default maximum number of prepared statements to cache per connection.
pub const DEFAULT_MAX_STATEMENTS: usize = 256;

/// A cached prepared statement.
///
/// Contains the server-assigned handle and metadata needed for execution.
#[derive(Debug, Clone)]
pub struct PreparedStatement {
    /// Server-assigned handle for this prepared statement.
    handle: i32,
    /// Hash of the SQL text for cache lookup.
    sql_hash: u64,
    /// The original SQL text (for debugging and logging).
    sql: String,
    /// Timestamp when this statement was prepared.
    created_at: Instant,
}

impl PreparedStatement {
    /// Create a new prepared statement.
    pub fn new(handle: i32, sql: String) -> Self {
        Self {
            handle,
            sql_hash: hash_sql(&sql),
            sql,
            created_at: Instant::now(),
        }
    }

    /// Get the server-assigned handle.
    #[must_use]
    pub fn handle(&self) -> i32 {
        self.handle
    }

    /// Get the SQL hash.
    #[must_use]
    pub fn sql_hash(&self) -> u64 {
        self.sql_hash
    }

    /// Get the SQL text.
    #[must_use]
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Get the creation timestamp.
    #[must_use]
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Get the age of this statement.
    #[must_use]
    pub fn age(&self) -> std::time::Duration {
        self.created_at.elapsed()
    }
}

/// LRU cache for prepared statements.
///
/// This cache automatically evicts the least recently used statements when
/// the maximum capacity is reached. Evicted statements should have their
/// server-side handles released via `sp_unprepare`.
pub struct StatementCache {
    /// LRU cache of prepared statements keyed by SQL hash.
    cache: LruCache<u64, PreparedStatement>,
    /// Maximum number of cached statements.
    max_size: usize,
    /// Total number of cache hits (for metrics).
    hits: u64,
    /// Total number of cache misses (for metrics).
    misses: u64,
}

impl StatementCache {
    /// Create a new statement cache with the specified maximum size.
    ///
    /// # Panics
    ///
    /// Panics if `max_size` is 0.
    #[must_use]
    pub fn new(max_size: usize) -> Self {
        assert!(max_size > 0, "max_size must be greater than 0");
        Self {
            cache: LruCache::new(NonZeroUsize::new(max_size).expect("max_size > 0")),
            max_size,
            hits: 0,
            misses: 0,
        }
    }

    /// Create a new statement cache with the default maximum size.
    #[must_use]
    pub fn with_default_size() -> Self {
        Self::new(DEFAULT_MAX_STATEMENTS)
    }

    /// Look up a prepared statement by SQL text.
    ///
    /// Returns `Some(handle)` if the statement is cached, `None` otherwise.
    /// This updates the LRU order.
    pub fn get(&mut self, sql: &str) -> Option<i32> {
        let hash = hash_sql(sql);
        if let Some(stmt) = self.cache.get(&hash) {
            self.hits += 1;
            tracing::trace!(sql = sql, handle = stmt.handle, "statement cache hit");
            Some(stmt.handle)
        } else {
            self.misses += 1;
            tracing::trace!(sql = sql, "statement cache miss");
            None
        }
    }

    /// Peek at a prepared statement without updating LRU order.
    pub fn peek(&self, sql: &str) -> Option<&PreparedStatement> {
        let hash = hash_sql(sql);
        self.cache.peek(&hash)
    }

    /// Insert a prepared statement into the cache.
    ///
    /// Returns the evicted statement if one was removed due to capacity.
    pub fn insert(&mut self, stmt: PreparedStatement) -> Option<PreparedStatement> {
        let hash = stmt.sql_hash;
        tracing::debug!(
            sql = stmt.sql(),
            handle = stmt.handle,
            "caching prepared statement"
        );

        // Check if we need to evict
        let evicted = if self.cache.len() >= self.max_size {
            // Pop least recently used
            self.cache.pop_lru().map(|(_, stmt)| stmt)
        } else {
            None
        };

        self.cache.put(hash, stmt);
        evicted
    }

    /// Remove a prepared statement from the cache.
    ///
    /// Returns the removed statement if it was present.
    pub fn remove(&mut self, sql: &str) -> Option<PreparedStatement> {
        let hash = hash_sql(sql);
        self.cache.pop(&hash)
    }

    /// Clear all cached statements.
    ///
    /// Returns an iterator over all removed statements.
    /// The caller should call `sp_unprepare` for each returned statement.
    pub fn clear(&mut self) -> impl Iterator<Item = PreparedStatement> + '_ {
        let mut statements = Vec::with_capacity(self.cache.len());
        while let Some((_, stmt)) = self.cache.pop_lru() {
            statements.push(stmt);
        }
        tracing::debug!(count = statements.len(), "cleared statement cache");
        statements.into_iter()
    }

    /// Get the number of cached statements.
    #[must_use]
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    /// Check if the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    /// Get the maximum cache size.
    #[must_use]
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Get the number of cache hits.
    #[must_use]
    pub fn hits(&self) -> u64 {
        self.hits
    }

    /// Get the number of cache misses.
    #[must_use]
    pub fn misses(&self) -> u64 {
        self.misses
    }

    /// Get the cache hit ratio (0.0 to 1.0).
    #[must_use]
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    /// Reset cache statistics.
    pub fn reset_stats(&mut self) {
        self.hits = 0;
        self.misses = 0;
    }
}

impl Default for StatementCache {
    fn default() -> Self {
        Self::with_default_size()
    }
}

impl std::fmt::Debug for StatementCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatementCache")
            .field("len", &self.cache.len())
            .field("max_size", &self.max_size)
            .field("hits", &self.hits)
            .field("misses", &self.misses)
            .finish()
    }
}

/// Hash SQL text for cache lookup.
///
/// Uses a stable hash algorithm to ensure consistent lookups.
#[must_use]
pub fn hash_sql(sql: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    sql.hash(&mut hasher);
    hasher.finish()
}

/// Configuration for statement caching.
#[derive(Debug, Clone)]
pub struct StatementCacheConfig {
    /// Whether statement caching is enabled.
    pub enabled: bool,
    /// Maximum number of statements to cache.
    pub max_size: usize,
}

impl Default for StatementCacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_size: DEFAULT_MAX_STATEMENTS,
        }
    }
}

impl StatementCacheConfig {
    /// Create a new configuration with caching disabled.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            max_size: 0,
        }
    }

    /// Create a new configuration with a custom max size.
    #[must_use]
    pub fn with_max_size(max_size: usize) -> Self {
        Self {
            enabled: true,
            max_size,
        }
    }
}

/// A formal parameter's type declaration, e.g. `"@p1 int"` or
/// `"@name nvarchar(50)"`, in the same text form passed to
/// `sp_executesql`/`sp_cursorprepexec`'s `formalParamDefs` argument.
///
/// Two bindings with the same query text but different parameter types (or
/// a different parameter count) must never share a prepared handle; the
/// declaration string is exactly the thing the server itself keys its plan
/// cache on, so it doubles as our fingerprint component.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ParamTypeDescriptor(pub String);

impl From<&str> for ParamTypeDescriptor {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ParamTypeDescriptor {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Cache key: query text plus the ordered list of formal parameter type
/// descriptors. Two bindings of the same query text with different
/// parameter types are different fingerprints and never collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StatementFingerprint {
    sql: String,
    params: Vec<ParamTypeDescriptor>,
}

impl StatementFingerprint {
    /// Build a fingerprint from query text and an ordered parameter type list.
    pub fn new(sql: impl Into<String>, params: Vec<ParamTypeDescriptor>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }
}

/// Eviction policy for [`PreparedStatementCache`].
#[derive(Debug, Clone, Default)]
pub enum StatementCacheMode {
    /// Grow without eviction.
    Unbounded,
    /// Bounded LRU with the given capacity.
    #[default]
    Lru(NonZeroUsize),
    /// Never cache; every lookup misses and nothing is stored.
    Disabled,
}

impl StatementCacheMode {
    /// `Lru(DEFAULT_MAX_STATEMENTS)`.
    #[must_use]
    pub fn default_lru() -> Self {
        Self::Lru(NonZeroUsize::new(DEFAULT_MAX_STATEMENTS).expect("nonzero default"))
    }
}

enum FingerprintStorage {
    Unbounded(std::collections::HashMap<StatementFingerprint, i32>),
    Lru(LruCache<StatementFingerprint, i32>),
    Disabled,
}

/// Fingerprint-keyed prepared-statement cache for cursored/parameterized
/// exchanges: `(query text, ordered formal parameter types) -> handle`.
///
/// This is the cache the cursor flow engine's prepare-retry path invalidates
/// entries from. `StatementCache` above remains the simpler text-only cache
/// used by non-cursor callers; the two are intentionally independent.
pub struct PreparedStatementCache {
    storage: FingerprintStorage,
    hits: u64,
    misses: u64,
}

impl PreparedStatementCache {
    /// Create a cache with the given eviction policy.
    #[must_use]
    pub fn new(mode: StatementCacheMode) -> Self {
        let storage = match mode {
            StatementCacheMode::Unbounded => {
                FingerprintStorage::Unbounded(std::collections::HashMap::new())
            }
            StatementCacheMode::Lru(capacity) => FingerprintStorage::Lru(LruCache::new(capacity)),
            StatementCacheMode::Disabled => FingerprintStorage::Disabled,
        };
        Self {
            storage,
            hits: 0,
            misses: 0,
        }
    }

    /// Look up a cached handle for `fingerprint`, or `None` for a miss
    /// (the caller falls back to `tds_protocol::rpc::UNPREPARED`).
    pub fn get_handle(&mut self, fingerprint: &StatementFingerprint) -> Option<i32> {
        let found = match &mut self.storage {
            FingerprintStorage::Unbounded(map) => map.get(fingerprint).copied(),
            FingerprintStorage::Lru(cache) => cache.get(fingerprint).copied(),
            FingerprintStorage::Disabled => None,
        };
        if found.is_some() {
            self.hits += 1;
        } else {
            self.misses += 1;
        }
        found
    }

    /// Record a freshly prepared handle for `fingerprint`.
    ///
    /// Returns the evicted `(fingerprint, handle)` pair, if the bounded
    /// policy dropped one to make room; the caller should `sp_unprepare` it.
    pub fn put_handle(
        &mut self,
        fingerprint: StatementFingerprint,
        handle: i32,
    ) -> Option<(StatementFingerprint, i32)> {
        tracing::debug!(sql = fingerprint.sql.as_str(), handle, "caching prepared handle");
        match &mut self.storage {
            FingerprintStorage::Unbounded(map) => {
                map.insert(fingerprint, handle);
                None
            }
            FingerprintStorage::Lru(cache) => {
                let evicted = if cache.len() >= cache.cap().get() && !cache.contains(&fingerprint)
                {
                    cache.pop_lru()
                } else {
                    None
                };
                cache.put(fingerprint, handle);
                evicted
            }
            FingerprintStorage::Disabled => None,
        }
    }

    /// Remove and return the handle cached for `fingerprint`, e.g. after a
    /// server-side invalidation (errors 586/8144/8178/8179).
    pub fn invalidate(&mut self, fingerprint: &StatementFingerprint) -> Option<i32> {
        tracing::debug!(sql = fingerprint.sql.as_str(), "invalidating prepared handle");
        match &mut self.storage {
            FingerprintStorage::Unbounded(map) => map.remove(fingerprint),
            FingerprintStorage::Lru(cache) => cache.pop(fingerprint),
            FingerprintStorage::Disabled => None,
        }
    }

    /// Number of cached entries.
    #[must_use]
    pub fn len(&self) -> usize {
        match &self.storage {
            FingerprintStorage::Unbounded(map) => map.len(),
            FingerprintStorage::Lru(cache) => cache.len(),
            FingerprintStorage::Disabled => 0,
        }
    }

    /// Whether the cache holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cache hit ratio over the cache's lifetime (0.0 to 1.0).
    #[must_use]
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_statement_cache_new() {
        let cache = StatementCache::new(10);
        assert_eq!(cache.max_size(), 10);
        assert!(cache.is_empty());
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn test_statement_cache_insert_and_get() {
        let mut cache = StatementCache::new(10);

        let stmt = PreparedStatement::new(1, "SELECT * FROM users".to_string());
        cache.insert(stmt);

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("SELECT * FROM users"), Some(1));
        assert_eq!(cache.hits(), 1);
        assert_eq!(cache.misses(), 0);
    }

    #[test]
    fn test_statement_cache_miss() {
        let mut cache = StatementCache::new(10);

        assert_eq!(cache.get("SELECT 1"), None);
        assert_eq!(cache.misses(), 1);
        assert_eq!(cache.hits(), 0);
    }

    #[test]
    fn test_statement_cache_lru_eviction() {
        let mut cache = StatementCache::new(2);

        // Insert 2 statements
        cache.insert(PreparedStatement::new(1, "SELECT 1".to_string()));
        cache.insert(PreparedStatement::new(2, "SELECT 2".to_string()));
        assert_eq!(cache.len(), 2);

        // Access the first statement to make it recently used
        cache.get("SELECT 1");

        // Insert a third statement - should evict "SELECT 2"
        let evicted = cache.insert(PreparedStatement::new(3, "SELECT 3".to_string()));

        assert!(evicted.is_some());
        assert_eq!(evicted.unwrap().handle(), 2);
        assert_eq!(cache.len(), 2);

        // Verify "SELECT 1" is still cached (was accessed recently)
        assert_eq!(cache.get("SELECT 1"), Some(1));
        // Verify "SELECT 2" was evicted
        assert_eq!(cache.get("SELECT 2"), None);
        // Verify "SELECT 3" is cached
        assert_eq!(cache.get("SELECT 3"), Some(3));
    }

    #[test]
    fn test_statement_cache_clear() {
        let mut cache = StatementCache::new(10);

        cache.insert(PreparedStatement::new(1, "SELECT 1".to_string()));
        cache.insert(PreparedStatement::new(2, "SELECT 2".to_string()));

        let cleared: Vec<_> = cache.clear().collect();
        assert_eq!(cleared.len(), 2);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_statement_cache_remove() {
        let mut cache = StatementCache::new(10);

        cache.insert(PreparedStatement::new(1, "SELECT 1".to_string()));
        assert_eq!(cache.len(), 1);

        let removed = cache.remove("SELECT 1");
        assert!(removed.is_some());
        assert_eq!(removed.unwrap().handle(), 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_statement_cache_hit_ratio() {
        let mut cache = StatementCache::new(10);

        cache.insert(PreparedStatement::new(1, "SELECT 1".to_string()));

        // 2 hits, 1 miss
        cache.get("SELECT 1");
        cache.get("SELECT 1");
        cache.get("SELECT 2");

        assert_eq!(cache.hits(), 2);
        assert_eq!(cache.misses(), 1);
        assert!((cache.hit_ratio() - 0.666666).abs() < 0.001);
    }

    #[test]
    fn test_hash_sql_consistency() {
        let sql = "SELECT * FROM users WHERE id = @p1";
        let hash1 = hash_sql(sql);
        let hash2 = hash_sql(sql);
        assert_eq!(hash1, hash2);
    }

    #[test]
    fn test_hash_sql_different() {
        let hash1 = hash_sql("SELECT 1");
        let hash2 = hash_sql("SELECT 2");
        assert_ne!(hash1, hash2);
    }

    #[test]
    fn test_prepared_statement_age() {
        let stmt = PreparedStatement::new(1, "SELECT 1".to_string());
        std::thread::sleep(std::time::Duration::from_millis(10));
        assert!(stmt.age().as_millis() >= 10);
    }

    #[test]
    fn test_statement_cache_config_default() {
        let config = StatementCacheConfig::default();
        assert!(config.enabled);
        assert_eq!(config.max_size, DEFAULT_MAX_STATEMENTS);
    }

    #[test]
    fn test_statement_cache_config_disabled() {
        let config = StatementCacheConfig::disabled();
        assert!(!config.enabled);
    }

    fn fp(sql: &str, params: &[&str]) -> StatementFingerprint {
        StatementFingerprint::new(sql, params.iter().map(|p| ParamTypeDescriptor::from(*p)).collect())
    }

    #[test]
    fn prepared_statement_cache_lru_eviction() {
        let mut cache = PreparedStatementCache::new(StatementCacheMode::Lru(
            NonZeroUsize::new(1).unwrap(),
        ));
        assert_eq!(cache.get_handle(&fp("SELECT @p1", &["int"])), None);
        cache.put_handle(fp("SELECT @p1", &["int"]), 10);
        assert_eq!(cache.get_handle(&fp("SELECT @p1", &["int"])), Some(10));

        let evicted = cache.put_handle(fp("SELECT @p1", &["bigint"]), 11);
        assert_eq!(evicted, Some((fp("SELECT @p1", &["int"]), 10)));
        assert_eq!(cache.get_handle(&fp("SELECT @p1", &["int"])), None);
        assert_eq!(cache.get_handle(&fp("SELECT @p1", &["bigint"])), Some(11));
    }

    #[test]
    fn prepared_statement_cache_same_sql_different_types_dont_collide() {
        let mut cache = PreparedStatementCache::new(StatementCacheMode::Unbounded);
        cache.put_handle(fp("SELECT @p1", &["int"]), 1);
        cache.put_handle(fp("SELECT @p1", &["nvarchar(50)"]), 2);
        assert_eq!(cache.get_handle(&fp("SELECT @p1", &["int"])), Some(1));
        assert_eq!(cache.get_handle(&fp("SELECT @p1", &["nvarchar(50)"])), Some(2));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn prepared_statement_cache_disabled_never_stores() {
        let mut cache = PreparedStatementCache::new(StatementCacheMode::Disabled);
        cache.put_handle(fp("SELECT 1", &[]), 1);
        assert_eq!(cache.get_handle(&fp("SELECT 1", &[])), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn prepared_statement_cache_invalidate_removes_entry() {
        let mut cache = PreparedStatementCache::new(StatementCacheMode::Unbounded);
        cache.put_handle(fp("SELECT 1", &[]), 1);
        assert_eq!(cache.invalidate(&fp("SELECT 1", &[])), Some(1));
        assert_eq!(cache.get_handle(&fp("SELECT 1", &[])), None);
    }
}
