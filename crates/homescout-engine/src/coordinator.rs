//! Region fan-out: freshness gate, per-region lock, engine run, pacing update.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use futures::FutureExt;
use homescout_adapters::ListingAdapter;
use homescout_core::{lock_key, new_run_owner, CrawlState};
use homescout_storage::LockService;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{info, info_span, warn, Instrument};

use crate::pacing::next_pacing;
use crate::{EngineError, ScrapeEngine, ScrapeOptions};

pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegionRunOptions {
    /// Base engine options; `adapter_name`, `max_pages` and start URLs are set per region.
    pub scrape: ScrapeOptions,
    /// Pages per region when no pacing state exists yet.
    pub default_max_pages: u32,
    pub region_concurrency: usize,
    /// Overrides the adapter's freshness window.
    pub freshness_window_secs: Option<u64>,
    pub lock_ttl_secs: u64,
    /// Upper bound of a random delay before each region after the first.
    pub region_jitter_ms: Option<u64>,
}

impl Default for RegionRunOptions {
    fn default() -> Self {
        Self {
            scrape: ScrapeOptions::default(),
            default_max_pages: 2,
            region_concurrency: 3,
            freshness_window_secs: None,
            lock_ttl_secs: DEFAULT_LOCK_TTL.as_secs(),
            region_jitter_ms: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SkipReason {
    Fresh,
    Locked,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegionResult {
    pub name: String,
    pub inserted: usize,
    pub discovered: usize,
    pub skipped: bool,
    pub reason: Option<SkipReason>,
    pub errors: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_max_pages: Option<u32>,
}

impl RegionResult {
    fn skipped(name: &str, reason: SkipReason) -> Self {
        Self {
            name: name.to_string(),
            inserted: 0,
            discovered: 0,
            skipped: true,
            reason: Some(reason),
            errors: Vec::new(),
            target_max_pages: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RegionBatchResult {
    pub inserted: usize,
    pub discovered: usize,
    pub regions: Vec<RegionResult>,
    pub errors: Vec<String>,
}

fn is_fresh(updated_at: DateTime<Utc>, now: DateTime<Utc>, window: Duration) -> bool {
    match chrono::Duration::from_std(window) {
        Ok(window) => now.signed_duration_since(updated_at) < window,
        Err(_) => true,
    }
}

fn jitter_delay(max_ms: u64) -> Duration {
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..max_ms))
}

pub struct RegionCoordinator {
    engine: Arc<ScrapeEngine>,
    locks: Arc<dyn LockService>,
}

impl RegionCoordinator {
    pub fn new(engine: Arc<ScrapeEngine>, locks: Arc<dyn LockService>) -> Self {
        Self { engine, locks }
    }

    /// Crawls each region at most once, `region_concurrency` at a time.
    ///
    /// Regions are skipped, never failed, when fresh or locked elsewhere. Results are
    /// reported in the order the regions were given.
    pub async fn run_regions(
        &self,
        adapter_name: &str,
        regions: &[String],
        options: RegionRunOptions,
    ) -> Result<RegionBatchResult, EngineError> {
        let adapter = self.engine.adapter(adapter_name)?;
        let owner = new_run_owner();
        let concurrency = options.region_concurrency.clamp(1, 10);

        let mut names: Vec<String> = Vec::new();
        for region in regions.iter().map(|r| r.trim()).filter(|r| !r.is_empty()) {
            if !names.iter().any(|n| n == region) {
                names.push(region.to_string());
            }
        }

        let mut results: Vec<(usize, RegionResult)> = stream::iter(names.iter().enumerate())
            .map(|(index, region)| {
                let span = info_span!("region", adapter = adapter_name, region = %region);
                let adapter = adapter.clone();
                let options = &options;
                let owner = owner.as_str();
                async move {
                    if index > 0 {
                        if let Some(max_ms) = options.region_jitter_ms {
                            tokio::time::sleep(jitter_delay(max_ms)).await;
                        }
                    }
                    let result = self.run_region(adapter, region, owner, options).await;
                    (index, result)
                }
                .instrument(span)
            })
            .buffer_unordered(concurrency)
            .collect()
            .await;
        results.sort_by_key(|(index, _)| *index);

        let mut batch = RegionBatchResult::default();
        for (_, region) in results {
            batch.inserted += region.inserted;
            batch.discovered += region.discovered;
            batch
                .errors
                .extend(region.errors.iter().map(|e| format!("{}: {e}", region.name)));
            batch.regions.push(region);
        }
        Ok(batch)
    }

    async fn run_region(
        &self,
        adapter: Arc<dyn ListingAdapter>,
        region: &str,
        owner: &str,
        options: &RegionRunOptions,
    ) -> RegionResult {
        let name = adapter.meta().name;
        let store = self.engine.store();

        let state = match store.get_crawl_state(&name, region).await {
            Ok(state) => state,
            Err(err) => {
                warn!(error = %err, "reading crawl state failed; treating region as new");
                None
            }
        };

        let window = options
            .freshness_window_secs
            .map(Duration::from_secs)
            .unwrap_or_else(|| adapter.freshness_window());
        if let Some(state) = &state {
            if is_fresh(state.updated_at, Utc::now(), window) {
                info!(updated_at = %state.updated_at, "region is fresh; skipping");
                return RegionResult::skipped(region, SkipReason::Fresh);
            }
        }

        let seeds = adapter.region_seed_urls(region, options.scrape.extra_listing_type.as_deref());
        if seeds.is_empty() {
            warn!("adapter has no region paths; nothing to crawl");
            return RegionResult {
                name: region.to_string(),
                inserted: 0,
                discovered: 0,
                skipped: false,
                reason: None,
                errors: vec![format!("no seed urls for region {region}")],
                target_max_pages: None,
            };
        }

        let key = lock_key(&name, region);
        let ttl = Duration::from_secs(options.lock_ttl_secs.max(1));
        match self.locks.acquire(&key, owner, ttl).await {
            Ok(true) => {}
            Ok(false) => {
                info!(lock = %key, "region locked by another run");
                return RegionResult::skipped(region, SkipReason::Locked);
            }
            Err(err) => {
                warn!(lock = %key, error = %err, "lock acquire failed; skipping region");
                return RegionResult::skipped(region, SkipReason::Locked);
            }
        }

        let target = state
            .as_ref()
            .map(|s| s.target_max_pages)
            .unwrap_or(options.default_max_pages)
            .max(1);
        let run_options = ScrapeOptions {
            adapter_name: Some(name.clone()),
            max_pages: target,
            extra_start_urls: seeds,
            ..options.scrape.clone()
        };

        let outcome = AssertUnwindSafe(self.engine.run(run_options)).catch_unwind().await;

        if let Err(err) = self.locks.release(&key, owner).await {
            warn!(lock = %key, error = %err, "lock release failed; relying on ttl");
        }

        let (inserted, discovered, errors) = match outcome {
            Ok(Ok(result)) => (result.inserted, result.discovered, result.errors),
            Ok(Err(err)) => (0, 0, vec![err.to_string()]),
            Err(_) => (0, 0, vec!["region crawl panicked".to_string()]),
        };

        let next: CrawlState = next_pacing(state.as_ref(), &name, region, target, inserted, discovered, Utc::now());
        if let Err(err) = store.save_crawl_state(&next).await {
            warn!(error = %err, "saving crawl state failed");
        }
        info!(inserted, discovered, next_target = next.target_max_pages, "region done");

        RegionResult {
            name: region.to_string(),
            inserted,
            discovered,
            skipped: false,
            reason: None,
            errors,
            target_max_pages: Some(next.target_max_pages),
        }
    }
}
