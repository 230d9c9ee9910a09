#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use homescout_adapters::{
    AdapterError, AdapterMeta, AdapterRegistry, DiscoveryContext, ListingAdapter, ListingDefaults,
    ParseContext,
};
use homescout_core::{external_id_from_url, CrawlState, DiscoveryCursor, Property, RawListing, Source};
use homescout_engine::ScrapeEngine;
use homescout_storage::{
    BackoffPolicy, FetchError, LockService, MemoryStore, PageFetcher, RecordStore, StoreError,
};

/// Scripted responses per URL; the last entry repeats once the script runs out.
#[derive(Default)]
pub struct ScriptedFetcher {
    scripts: Mutex<HashMap<String, Vec<Result<String, u16>>>>,
    calls: Mutex<HashMap<String, usize>>,
}

impl ScriptedFetcher {
    pub fn respond(&self, url: &str, responses: Vec<Result<String, u16>>) {
        self.scripts.lock().unwrap().insert(url.to_string(), responses);
    }

    pub fn page(&self, url: &str, html: &str) {
        self.respond(url, vec![Ok(html.to_string())]);
    }

    pub fn calls(&self, url: &str) -> usize {
        self.calls.lock().unwrap().get(url).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().values().sum()
    }
}

#[async_trait]
impl PageFetcher for ScriptedFetcher {
    async fn get_text(&self, _source: &str, url: &str, _timeout: Duration) -> Result<String, FetchError> {
        let attempt = {
            let mut calls = self.calls.lock().unwrap();
            let count = calls.entry(url.to_string()).or_insert(0);
            *count += 1;
            *count
        };
        let scripts = self.scripts.lock().unwrap();
        let response = scripts
            .get(url)
            .and_then(|script| script.get(attempt - 1).or_else(|| script.last()))
            .cloned()
            .unwrap_or(Err(404));
        response.map_err(|status| FetchError::HttpStatus {
            status,
            url: url.to_string(),
        })
    }
}

/// Adapter whose discovery yields a fixed URL list and whose parser reads `<h1>`.
pub struct FakeAdapter {
    pub name: String,
    pub urls: Vec<String>,
    pub item_delay: Option<Duration>,
    pub use_hints: bool,
    pub freshness_window: Duration,
    pub seeds_seen: Mutex<Vec<Vec<String>>>,
}

impl FakeAdapter {
    pub fn new(name: &str, urls: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            urls: urls.iter().map(|u| u.to_string()).collect(),
            item_delay: None,
            use_hints: true,
            freshness_window: Duration::from_secs(600),
            seeds_seen: Mutex::new(Vec::new()),
        }
    }
}

impl ListingAdapter for FakeAdapter {
    fn meta(&self) -> AdapterMeta {
        AdapterMeta {
            name: self.name.clone(),
        }
    }

    fn default_base_url(&self) -> &str {
        "https://s.test"
    }

    fn freshness_window(&self) -> Duration {
        self.freshness_window
    }

    fn listing_defaults(&self) -> ListingDefaults {
        ListingDefaults {
            country: Some("NG".into()),
            currency: Some("NGN".into()),
        }
    }

    fn region_seed_urls(&self, region: &str, _listing_type: Option<&str>) -> Vec<String> {
        vec![format!("https://s.test/search/{region}")]
    }

    fn external_id_hint(&self, url: &str) -> Option<String> {
        if self.use_hints {
            external_id_from_url(url)
        } else {
            None
        }
    }

    fn discover_listing_urls(&self, ctx: DiscoveryContext) -> BoxStream<'static, Result<String, AdapterError>> {
        self.seeds_seen.lock().unwrap().push(ctx.extra_start_urls.clone());
        let delay = self.item_delay;
        stream::iter(self.urls.clone())
            .then(move |url| async move {
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                Ok::<_, AdapterError>(url)
            })
            .boxed()
    }

    fn parse_listing(&self, _ctx: &ParseContext, html: &str, url: &str) -> Result<RawListing, AdapterError> {
        if html.contains("PANIC") {
            panic!("parser blew up on {url}");
        }
        let title = html
            .split("<h1>")
            .nth(1)
            .and_then(|rest| rest.split("</h1>").next())
            .ok_or_else(|| AdapterError::Parse(format!("no title on {url}")))?;
        let external_id =
            external_id_from_url(url).ok_or_else(|| AdapterError::Parse(format!("no id in {url}")))?;
        Ok(RawListing {
            external_id,
            url: url.to_string(),
            title: Some(title.to_string()),
            price: Some("₦ 1,500,000".into()),
            ..RawListing::default()
        })
    }
}

pub fn listing_html(title: &str) -> String {
    format!("<html><body><h1>{title}</h1></body></html>")
}

pub fn fast_backoff() -> BackoffPolicy {
    BackoffPolicy {
        max_retries: 2,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
    }
}

pub struct Harness {
    pub engine: Arc<ScrapeEngine>,
    pub fetcher: Arc<ScriptedFetcher>,
    pub store: Arc<MemoryStore>,
    pub adapter: Arc<FakeAdapter>,
}

pub fn engine_over(
    adapter: Arc<dyn ListingAdapter>,
    fetcher: Arc<ScriptedFetcher>,
    store: Arc<dyn RecordStore>,
) -> ScrapeEngine {
    let mut registry = AdapterRegistry::new();
    registry.register(adapter);
    ScrapeEngine::new(registry, fetcher, store).with_backoff(fast_backoff())
}

pub fn harness(adapter: FakeAdapter) -> Harness {
    let adapter = Arc::new(adapter);
    let fetcher = Arc::new(ScriptedFetcher::default());
    let store = Arc::new(MemoryStore::new());
    let engine = engine_over(adapter.clone(), fetcher.clone(), store.clone());
    Harness {
        engine: Arc::new(engine),
        fetcher,
        store,
        adapter,
    }
}

/// Memory store whose recently-seen lookup always fails.
pub struct FailingLookupStore {
    pub inner: Arc<MemoryStore>,
    pub lookups: AtomicUsize,
}

impl FailingLookupStore {
    pub fn new(inner: Arc<MemoryStore>) -> Self {
        Self {
            inner,
            lookups: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl RecordStore for FailingLookupStore {
    async fn ensure_source(&self, name: &str, default_base_url: &str) -> Result<Source, StoreError> {
        self.inner.ensure_source(name, default_base_url).await
    }

    async fn upsert_property(&self, property: &Property) -> Result<(), StoreError> {
        self.inner.upsert_property(property).await
    }

    async fn get_property(&self, source_id: i64, external_id: &str) -> Result<Option<Property>, StoreError> {
        self.inner.get_property(source_id, external_id).await
    }

    async fn recently_seen(
        &self,
        _source_id: i64,
        _external_ids: &[String],
        _since: DateTime<Utc>,
    ) -> Result<HashSet<String>, StoreError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        Err(StoreError::Unavailable("lookup offline".into()))
    }

    async fn get_cursor(&self, seed_url: &str) -> Result<Option<DiscoveryCursor>, StoreError> {
        self.inner.get_cursor(seed_url).await
    }

    async fn save_cursor(&self, cursor: &DiscoveryCursor) -> Result<(), StoreError> {
        self.inner.save_cursor(cursor).await
    }

    async fn get_crawl_state(&self, adapter_name: &str, region: &str) -> Result<Option<CrawlState>, StoreError> {
        self.inner.get_crawl_state(adapter_name, region).await
    }

    async fn save_crawl_state(&self, state: &CrawlState) -> Result<(), StoreError> {
        self.inner.save_crawl_state(state).await
    }
}

/// Lock service that cannot be reached.
#[derive(Default)]
pub struct UnreachableLocks {
    pub acquires: AtomicUsize,
    pub releases: AtomicUsize,
}

#[async_trait]
impl LockService for UnreachableLocks {
    async fn acquire(&self, _lock_key: &str, _owner: &str, _ttl: Duration) -> Result<bool, StoreError> {
        self.acquires.fetch_add(1, Ordering::SeqCst);
        Err(StoreError::Unavailable("lock table offline".into()))
    }

    async fn release(&self, _lock_key: &str, _owner: &str) -> Result<(), StoreError> {
        self.releases.fetch_add(1, Ordering::SeqCst);
        Err(StoreError::Unavailable("lock table offline".into()))
    }
}
