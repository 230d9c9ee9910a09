//! Store traits for listings, crawl state and run locks, plus an in-memory backend.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use homescout_core::{CrawlState, DiscoveryCursor, Property, RunLock, Source};
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("unexpected value in column {column}: {detail}")]
    Decode { column: &'static str, detail: String },
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Key-addressed record store.
///
/// Conflict keys: `(source_id, external_id)` for properties, `seed_url` for
/// cursors, `(adapter_name, region)` for crawl state.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Returns the named source, creating it with `default_base_url` when missing.
    async fn ensure_source(&self, name: &str, default_base_url: &str) -> Result<Source, StoreError>;

    /// Insert or refresh a listing. `first_seen_at` of an existing row is kept and
    /// `last_seen_at`/`scraped_at` never move backwards.
    async fn upsert_property(&self, property: &Property) -> Result<(), StoreError>;

    async fn get_property(
        &self,
        source_id: i64,
        external_id: &str,
    ) -> Result<Option<Property>, StoreError>;

    /// Subset of `external_ids` whose `last_seen_at` is at or after `since`.
    async fn recently_seen(
        &self,
        source_id: i64,
        external_ids: &[String],
        since: DateTime<Utc>,
    ) -> Result<HashSet<String>, StoreError>;

    async fn get_cursor(&self, seed_url: &str) -> Result<Option<DiscoveryCursor>, StoreError>;
    async fn save_cursor(&self, cursor: &DiscoveryCursor) -> Result<(), StoreError>;

    async fn get_crawl_state(
        &self,
        adapter_name: &str,
        region: &str,
    ) -> Result<Option<CrawlState>, StoreError>;
    async fn save_crawl_state(&self, state: &CrawlState) -> Result<(), StoreError>;
}

/// Atomic TTL lock primitive. Two concurrent `acquire` calls for the same
/// unexpired key never both succeed.
#[async_trait]
pub trait LockService: Send + Sync {
    async fn acquire(&self, lock_key: &str, owner: &str, ttl: Duration) -> Result<bool, StoreError>;
    /// No-op unless `owner` currently holds `lock_key`.
    async fn release(&self, lock_key: &str, owner: &str) -> Result<(), StoreError>;
}

#[derive(Debug, Default)]
struct MemoryTables {
    sources: HashMap<String, Source>,
    properties: HashMap<(i64, String), Property>,
    cursors: HashMap<String, DiscoveryCursor>,
    crawl_states: HashMap<(String, String), CrawlState>,
    locks: HashMap<String, RunLock>,
}

/// Process-local store for tests and `--memory` runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<MemoryTables>,
    lock_attempts: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock_attempts(&self) -> usize {
        self.lock_attempts.load(Ordering::SeqCst)
    }

    pub async fn property_count(&self) -> usize {
        self.tables.lock().await.properties.len()
    }

    pub async fn current_lock(&self, lock_key: &str) -> Option<RunLock> {
        self.tables.lock().await.locks.get(lock_key).cloned()
    }

    /// Seeds a lock row directly, e.g. to simulate another runner.
    pub async fn insert_lock(&self, lock: RunLock) {
        self.tables
            .lock()
            .await
            .locks
            .insert(lock.lock_key.clone(), lock);
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn ensure_source(&self, name: &str, default_base_url: &str) -> Result<Source, StoreError> {
        let mut tables = self.tables.lock().await;
        let next_id = tables.sources.len() as i64 + 1;
        let source = tables
            .sources
            .entry(name.to_string())
            .or_insert_with(|| Source {
                id: next_id,
                name: name.to_string(),
                base_url: default_base_url.to_string(),
            });
        Ok(source.clone())
    }

    async fn upsert_property(&self, property: &Property) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        let key = (property.source_id, property.external_id.clone());
        let mut next = property.clone();
        if let Some(existing) = tables.properties.get(&key) {
            next.first_seen_at = existing.first_seen_at;
            next.last_seen_at = existing.last_seen_at.max(property.last_seen_at);
            next.scraped_at = existing.scraped_at.max(property.scraped_at);
        }
        tables.properties.insert(key, next);
        Ok(())
    }

    async fn get_property(
        &self,
        source_id: i64,
        external_id: &str,
    ) -> Result<Option<Property>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .properties
            .get(&(source_id, external_id.to_string()))
            .cloned())
    }

    async fn recently_seen(
        &self,
        source_id: i64,
        external_ids: &[String],
        since: DateTime<Utc>,
    ) -> Result<HashSet<String>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(external_ids
            .iter()
            .filter(|id| {
                tables
                    .properties
                    .get(&(source_id, (*id).clone()))
                    .is_some_and(|p| p.last_seen_at >= since)
            })
            .cloned()
            .collect())
    }

    async fn get_cursor(&self, seed_url: &str) -> Result<Option<DiscoveryCursor>, StoreError> {
        Ok(self.tables.lock().await.cursors.get(seed_url).cloned())
    }

    async fn save_cursor(&self, cursor: &DiscoveryCursor) -> Result<(), StoreError> {
        self.tables
            .lock()
            .await
            .cursors
            .insert(cursor.seed_url.clone(), cursor.clone());
        Ok(())
    }

    async fn get_crawl_state(
        &self,
        adapter_name: &str,
        region: &str,
    ) -> Result<Option<CrawlState>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .crawl_states
            .get(&(adapter_name.to_string(), region.to_string()))
            .cloned())
    }

    async fn save_crawl_state(&self, state: &CrawlState) -> Result<(), StoreError> {
        self.tables.lock().await.crawl_states.insert(
            (state.adapter_name.clone(), state.region.clone()),
            state.clone(),
        );
        Ok(())
    }
}

#[async_trait]
impl LockService for MemoryStore {
    async fn acquire(&self, lock_key: &str, owner: &str, ttl: Duration) -> Result<bool, StoreError> {
        self.lock_attempts.fetch_add(1, Ordering::SeqCst);
        let now = Utc::now();
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| StoreError::Unavailable(format!("invalid lock ttl: {e}")))?;
        let mut tables = self.tables.lock().await;
        if let Some(existing) = tables.locks.get(lock_key) {
            if !existing.is_expired(now) {
                return Ok(false);
            }
        }
        tables.locks.insert(
            lock_key.to_string(),
            RunLock {
                lock_key: lock_key.to_string(),
                owner: owner.to_string(),
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    async fn release(&self, lock_key: &str, owner: &str) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        if tables.locks.get(lock_key).is_some_and(|l| l.owner == owner) {
            tables.locks.remove(lock_key);
        }
        Ok(())
    }
}
