//! Cursor-driven paginated discovery of listing URLs.
//!
//! Each seed is scanned from its stored cursor for at most `max_pages` pages,
//! never past [`PAGE_CAP`]. A page's cursor advance is saved only once all of
//! its links have been pulled, so a consumer that stops early rescans that page
//! next run. Past the cap the cursor wraps to page 1, and it resets when a page
//! yields nothing new (end of results).

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures::stream::{self, BoxStream, StreamExt};
use homescout_core::{canonicalize, DiscoveryCursor};
use scraper::{Html, Selector};
use tracing::{debug, warn};
use url::Url;

use crate::{AdapterError, DiscoveryContext, SiteProfile};

pub const PAGE_CAP: u32 = 50;

#[derive(Debug, Clone)]
struct SeedScan {
    seed_url: String,
    page: u32,
    last_page: u32,
}

pub struct PagedDiscovery {
    profile: Arc<SiteProfile>,
    ctx: DiscoveryContext,
    seeds: VecDeque<String>,
    current: Option<SeedScan>,
    pending: VecDeque<String>,
    /// Cursor to save once `pending` drains: seed URL and its next page.
    page_done: Option<(String, u32)>,
    seen: HashSet<String>,
}

fn wrap_page(page: u32) -> u32 {
    if page == 0 || page > PAGE_CAP {
        1
    } else {
        page
    }
}

/// URL of `page` for a seed; page 1 is the seed itself.
pub fn page_url(seed_url: &str, page_param: &str, page: u32) -> String {
    if page <= 1 {
        return seed_url.to_string();
    }
    let Ok(mut url) = Url::parse(seed_url) else {
        return seed_url.to_string();
    };
    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| k != page_param)
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    url.set_query(None);
    url.query_pairs_mut()
        .extend_pairs(kept)
        .append_pair(page_param, &page.to_string());
    url.to_string()
}

/// Absolute listing links on a search page, in document order.
pub fn extract_listing_links(
    html: &str,
    page_url: &str,
    link_selector: &str,
    path_marker: Option<&str>,
) -> Result<Vec<String>, AdapterError> {
    let selector = Selector::parse(link_selector).map_err(|e| AdapterError::Selector {
        selector: link_selector.to_string(),
        detail: e.to_string(),
    })?;
    let base = Url::parse(page_url).ok();
    let document = Html::parse_document(html);
    Ok(document
        .select(&selector)
        .filter_map(|node| node.value().attr("href"))
        .filter_map(|href| match &base {
            Some(base) => base.join(href.trim()).ok(),
            None => Url::parse(href.trim()).ok(),
        })
        .filter(|u| matches!(u.scheme(), "http" | "https"))
        .filter(|u| path_marker.map_or(true, |m| u.path().contains(m)))
        .map(|u| u.to_string())
        .collect())
}

impl PagedDiscovery {
    pub fn new(profile: Arc<SiteProfile>, ctx: DiscoveryContext) -> Self {
        let seeds = if ctx.extra_start_urls.is_empty() {
            profile.seed_urls(&ctx.source.base_url, ctx.extra_listing_type.as_deref())
        } else {
            ctx.extra_start_urls.clone()
        };
        Self {
            profile,
            ctx,
            seeds: seeds.into(),
            current: None,
            pending: VecDeque::new(),
            page_done: None,
            seen: HashSet::new(),
        }
    }

    pub fn into_stream(self) -> BoxStream<'static, Result<String, AdapterError>> {
        stream::unfold(self, |mut state| async move {
            let item = state.next_url().await?;
            Some((item, state))
        })
        .boxed()
    }

    async fn next_url(&mut self) -> Option<Result<String, AdapterError>> {
        loop {
            if let Some(url) = self.pending.pop_front() {
                if self.pending.is_empty() {
                    if let Some((seed_url, next_page)) = self.page_done.take() {
                        self.save_cursor(&seed_url, next_page, "ok").await;
                    }
                }
                return Some(Ok(url));
            }
            if self.ctx.deadline.is_some_and(|d| Instant::now() >= d) {
                debug!("discovery deadline reached");
                return None;
            }
            let scan = match self.current.take() {
                Some(scan) => scan,
                None => {
                    let seed = self.seeds.pop_front()?;
                    self.start_seed(seed).await
                }
            };
            if let Err(err) = self.scan_page(scan).await {
                return Some(Err(err));
            }
        }
    }

    async fn start_seed(&self, seed_url: String) -> SeedScan {
        let start = match self.ctx.store.get_cursor(&seed_url).await {
            Ok(Some(cursor)) => wrap_page(cursor.next_page),
            Ok(None) => 1,
            Err(err) => {
                warn!(seed = %seed_url, error = %err, "cursor lookup failed; starting at page 1");
                1
            }
        };
        let window = self.ctx.max_pages.max(1);
        SeedScan {
            seed_url,
            page: start,
            last_page: start.saturating_add(window - 1).min(PAGE_CAP),
        }
    }

    /// Best-effort: a lost cursor write only costs a rescan next run.
    async fn save_cursor(&self, seed_url: &str, next_page: u32, status: &str) {
        let cursor = DiscoveryCursor {
            seed_url: seed_url.to_string(),
            next_page: wrap_page(next_page),
            last_run_at: Utc::now(),
            last_status: status.to_string(),
        };
        if let Err(err) = self.ctx.store.save_cursor(&cursor).await {
            warn!(seed = %seed_url, error = %err, "saving discovery cursor failed");
        }
    }

    async fn scan_page(&mut self, mut scan: SeedScan) -> Result<(), AdapterError> {
        if scan.page > scan.last_page {
            return Ok(());
        }

        let url = page_url(&scan.seed_url, &self.profile.page_param, scan.page);
        let html = match self
            .ctx
            .fetcher
            .get_text(&self.ctx.source.name, &url, self.ctx.request_timeout)
            .await
        {
            Ok(html) => html,
            Err(err) => {
                let status = match err.status() {
                    Some(code) => format!("http_{code}"),
                    None => "fetch_error".to_string(),
                };
                self.save_cursor(&scan.seed_url, scan.page, &status).await;
                return Err(err.into());
            }
        };

        let links = extract_listing_links(
            &html,
            &url,
            &self.profile.listing_link_selector,
            self.profile.listing_path_marker.as_deref(),
        )?;
        let fresh: Vec<String> = links
            .into_iter()
            .filter(|link| self.seen.insert(canonicalize(link)))
            .collect();
        debug!(page = scan.page, url = %url, new = fresh.len(), "scanned search page");

        if fresh.is_empty() {
            self.save_cursor(&scan.seed_url, 1, "exhausted").await;
            return Ok(());
        }

        self.pending.extend(fresh);
        scan.page += 1;
        self.page_done = Some((scan.seed_url.clone(), scan.page));
        self.current = Some(scan);
        Ok(())
    }
}
