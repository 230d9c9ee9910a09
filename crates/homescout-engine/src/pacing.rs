//! Per-region crawl depth tuning.

use chrono::{DateTime, Utc};
use homescout_core::CrawlState;

pub const MAX_TARGET_PAGES: u32 = 5;
pub const MAX_LOW_YIELD_STREAK: u32 = 10;
/// Inserts in one run that earn an extra page next time.
pub const GROWTH_INSERTS: usize = 10;
/// Discovered URLs per target page that also earn an extra page.
pub const GROWTH_DISCOVERED_PER_PAGE: usize = 20;
/// Consecutive empty runs before a page is taken away.
pub const SHRINK_STREAK: u32 = 2;

/// State to persist after a region run that crawled `target_max_pages` pages.
pub fn next_pacing(
    previous: Option<&CrawlState>,
    adapter_name: &str,
    region: &str,
    target_max_pages: u32,
    inserted: usize,
    discovered: usize,
    now: DateTime<Utc>,
) -> CrawlState {
    let previous_streak = previous.map(|s| s.low_yield_streak).unwrap_or(0);
    let low_yield_streak = if inserted > 0 {
        0
    } else {
        (previous_streak + 1).min(MAX_LOW_YIELD_STREAK)
    };

    let mut target = target_max_pages.max(1);
    if inserted >= GROWTH_INSERTS || discovered >= target as usize * GROWTH_DISCOVERED_PER_PAGE {
        target = (target + 1).min(MAX_TARGET_PAGES);
    }
    if inserted == 0 && low_yield_streak >= SHRINK_STREAK {
        target = target.saturating_sub(1).max(1);
    }

    CrawlState {
        adapter_name: adapter_name.to_string(),
        region: region.to_string(),
        target_max_pages: target,
        last_discovered: u32::try_from(discovered).unwrap_or(u32::MAX),
        last_inserted: u32::try_from(inserted).unwrap_or(u32::MAX),
        low_yield_streak,
        updated_at: now,
    }
}
