mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use common::{engine_over, harness, listing_html, FailingLookupStore, FakeAdapter, ScriptedFetcher};
use homescout_adapters::{adapter_for_profile, load_site_registry};
use homescout_engine::{EngineError, ScrapeOptions};
use homescout_storage::{MemoryStore, RecordStore};

fn options() -> ScrapeOptions {
    ScrapeOptions {
        adapter_name: Some("fake".into()),
        ..ScrapeOptions::default()
    }
}

#[tokio::test]
async fn end_to_end_dedups_fetches_and_persists() {
    let h = harness(FakeAdapter::new(
        "fake",
        &["https://s.test/a", "https://s.test/a?utm_source=x"],
    ));
    h.fetcher.page("https://s.test/a", &listing_html("Two bedroom flat"));

    let result = h.engine.run(options()).await.unwrap();
    assert_eq!(result.inserted, 1);
    assert_eq!(result.discovered, 1);
    assert!(result.errors.is_empty(), "{:?}", result.errors);
    assert_eq!(result.adapters, 1);
    assert_eq!(h.fetcher.total_calls(), 1);

    let property = h.store.get_property(1, "a").await.unwrap().unwrap();
    assert_eq!(property.first_seen_at, property.last_seen_at);
    assert_eq!(property.url_canonical, "https://s.test/a");
    assert_eq!(property.title.as_deref(), Some("Two bedroom flat"));
    assert_eq!(property.price, Some(1_500_000.0));
    assert_eq!(property.country.as_deref(), Some("NG"));
}

#[tokio::test]
async fn equivalent_urls_are_fetched_once() {
    let h = harness(FakeAdapter::new(
        "fake",
        &[
            "https://s.test/listing/7?utm_source=feed",
            "https://S.TEST/listing/7/",
            "https://s.test//listing/7#gallery",
            "https://s.test/listing/7?fbclid=abc",
        ],
    ));
    h.fetcher
        .page("https://s.test/listing/7?utm_source=feed", &listing_html("Duplex"));

    let result = h.engine.run(options()).await.unwrap();
    assert_eq!(result.discovered, 1);
    assert_eq!(result.inserted, 1);
    assert_eq!(h.fetcher.total_calls(), 1);
}

#[tokio::test]
async fn repeated_upsert_keeps_first_seen() {
    let mut adapter = FakeAdapter::new("fake", &["https://s.test/a"]);
    adapter.use_hints = false;
    let h = harness(adapter);
    h.fetcher.page("https://s.test/a", &listing_html("House"));

    h.engine.run(options()).await.unwrap();
    let first = h.store.get_property(1, "a").await.unwrap().unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    let again = h.engine.run(options()).await.unwrap();
    assert_eq!(again.inserted, 1);

    let second = h.store.get_property(1, "a").await.unwrap().unwrap();
    assert_eq!(h.store.property_count().await, 1);
    assert_eq!(second.first_seen_at, first.first_seen_at);
    assert!(second.last_seen_at > first.last_seen_at);
    assert!(second.scraped_at > first.scraped_at);
}

#[tokio::test]
async fn recently_seen_listings_are_not_fetched() {
    let h = harness(FakeAdapter::new("fake", &["https://s.test/a", "https://s.test/b"]));
    h.fetcher.page("https://s.test/a", &listing_html("A"));
    h.fetcher.page("https://s.test/b", &listing_html("B"));

    let first = h.engine.run(options()).await.unwrap();
    assert_eq!(first.inserted, 2);

    let second = h.engine.run(options()).await.unwrap();
    assert_eq!(second.discovered, 2);
    assert_eq!(second.skipped_fresh, 2);
    assert_eq!(second.inserted, 0);
    assert_eq!(h.fetcher.calls("https://s.test/a"), 1);
    assert_eq!(h.fetcher.calls("https://s.test/b"), 1);
}

#[tokio::test]
async fn failed_recently_seen_lookup_fetches_every_url() {
    let adapter = Arc::new(FakeAdapter::new("fake", &["https://s.test/a", "https://s.test/b"]));
    let fetcher = Arc::new(ScriptedFetcher::default());
    fetcher.page("https://s.test/a", &listing_html("A"));
    fetcher.page("https://s.test/b", &listing_html("B"));
    let memory = Arc::new(MemoryStore::new());
    let store = Arc::new(FailingLookupStore::new(memory.clone()));
    let engine = engine_over(adapter, fetcher.clone(), store.clone());

    let first = engine.run(options()).await.unwrap();
    assert_eq!(first.inserted, 2);

    // both listings are now recent, but the lookup cannot say so
    let second = engine.run(options()).await.unwrap();
    assert_eq!(second.discovered, 2);
    assert_eq!(second.skipped_fresh, 0);
    assert_eq!(second.inserted, 2);
    assert!(second.errors.is_empty(), "{:?}", second.errors);
    assert_eq!(store.lookups.load(Ordering::SeqCst), 2);
    assert_eq!(fetcher.calls("https://s.test/a"), 2);
    assert_eq!(fetcher.calls("https://s.test/b"), 2);
    assert_eq!(memory.property_count().await, 2);
}

const LEKKI_SEARCH: &str = "https://www.propertypro.ng/property-for-rent/in/lagos/lekki";
const LEKKI_LISTING: &str = "https://www.propertypro.ng/property/3-bedroom-flat-for-rent-lekki-7HSKL";

fn lekki_search_page() -> String {
    r#"<html><body>
<div class="single-room-sale"><a href="/property/3-bedroom-flat-for-rent-lekki-7HSKL">3 Bedroom Flat</a></div>
<div class="footer"><a href="/about-us">About</a></div>
</body></html>"#
        .to_string()
}

#[tokio::test]
async fn shipped_profile_skips_listing_seen_on_previous_run() {
    let profile = load_site_registry(concat!(env!("CARGO_MANIFEST_DIR"), "/../../sites.yaml"))
        .expect("load sites.yaml")
        .sites
        .into_iter()
        .find(|s| s.name == "propertypro")
        .expect("propertypro");
    let fetcher = Arc::new(ScriptedFetcher::default());
    fetcher.page(LEKKI_SEARCH, &lekki_search_page());
    fetcher.page(&format!("{LEKKI_SEARCH}?page=2"), &lekki_search_page());
    fetcher.page(
        LEKKI_LISTING,
        r#"<html><body data-listing-id="7HSKL"><h1>3 Bedroom Flat For Rent</h1>
<div class="duplex-view-text"><strong>₦ 6,500,000</strong></div></body></html>"#,
    );
    let store = Arc::new(MemoryStore::new());
    let engine = engine_over(adapter_for_profile(profile), fetcher.clone(), store.clone());
    let run = || ScrapeOptions {
        adapter_name: Some("propertypro".into()),
        extra_start_urls: vec![LEKKI_SEARCH.to_string()],
        max_pages: 1,
        ..ScrapeOptions::default()
    };

    let first = engine.run(run()).await.unwrap();
    assert_eq!(first.inserted, 1, "{:?}", first.errors);
    let source = store.ensure_source("propertypro", "").await.unwrap();
    assert!(store.get_property(source.id, "7HSKL").await.unwrap().is_some());

    let second = engine.run(run()).await.unwrap();
    assert_eq!(fetcher.calls(&format!("{LEKKI_SEARCH}?page=2")), 1);
    assert_eq!(second.discovered, 1);
    assert_eq!(second.skipped_fresh, 1);
    assert_eq!(second.inserted, 0);
    assert_eq!(fetcher.calls(LEKKI_LISTING), 1);
}

#[tokio::test]
async fn retryable_failures_stop_after_three_attempts() {
    let h = harness(FakeAdapter::new("fake", &["https://s.test/busy"]));
    h.fetcher.respond("https://s.test/busy", vec![Err(429)]);

    let result = h.engine.run(options()).await.unwrap();
    assert_eq!(result.inserted, 0);
    assert_eq!(result.errors.len(), 1);
    assert!(result.errors[0].contains("429"), "{}", result.errors[0]);
    assert_eq!(h.fetcher.calls("https://s.test/busy"), 3);
}

#[tokio::test]
async fn throttled_then_ok_is_inserted() {
    let h = harness(FakeAdapter::new("fake", &["https://s.test/slow"]));
    h.fetcher.respond(
        "https://s.test/slow",
        vec![Err(429), Ok(listing_html("Studio"))],
    );

    let result = h.engine.run(options()).await.unwrap();
    assert_eq!(result.inserted, 1);
    assert!(result.errors.is_empty());
    assert_eq!(h.fetcher.calls("https://s.test/slow"), 2);
}

#[tokio::test]
async fn final_failures_are_recorded_once() {
    let h = harness(FakeAdapter::new(
        "fake",
        &["https://s.test/gone", "https://s.test/broken", "https://s.test/ok"],
    ));
    h.fetcher.respond("https://s.test/gone", vec![Err(404)]);
    h.fetcher.page("https://s.test/broken", "<html>no heading</html>");
    h.fetcher.page("https://s.test/ok", &listing_html("Condo"));

    let result = h.engine.run(options()).await.unwrap();
    assert_eq!(result.inserted, 1);
    assert_eq!(result.errors.len(), 2);
    assert_eq!(h.fetcher.calls("https://s.test/gone"), 1);
    assert_eq!(h.fetcher.calls("https://s.test/broken"), 1);
}

#[tokio::test]
async fn discovery_stops_at_max_urls() {
    let urls: Vec<String> = (0..30).map(|i| format!("https://s.test/l{i}")).collect();
    let refs: Vec<&str> = urls.iter().map(String::as_str).collect();
    let h = harness(FakeAdapter::new("fake", &refs));
    for url in &urls {
        h.fetcher.page(url, &listing_html("Land"));
    }

    let result = h
        .engine
        .run(ScrapeOptions {
            max_urls: 5,
            ..options()
        })
        .await
        .unwrap();
    assert_eq!(result.discovered, 5);
    assert_eq!(result.inserted, 5);
    assert!(result.warnings.is_empty());
}

#[tokio::test]
async fn slow_discovery_times_out_with_warning() {
    let urls: Vec<String> = (0..10).map(|i| format!("https://s.test/t{i}")).collect();
    let refs: Vec<&str> = urls.iter().map(String::as_str).collect();
    let mut adapter = FakeAdapter::new("fake", &refs);
    adapter.item_delay = Some(Duration::from_millis(300));
    let h = harness(adapter);
    for url in &urls {
        h.fetcher.page(url, &listing_html("Flat"));
    }

    let result = h
        .engine
        .run(ScrapeOptions {
            discovery_timeout_ms: 1_000,
            ..options()
        })
        .await
        .unwrap();
    assert_eq!(result.warnings.len(), 1);
    assert!(result.discovered >= 3 && result.discovered < 10, "{}", result.discovered);
    assert_eq!(result.inserted, result.discovered);
}

#[tokio::test]
async fn unknown_adapter_is_a_config_error() {
    let h = harness(FakeAdapter::new("fake", &[]));
    let err = h
        .engine
        .run(ScrapeOptions {
            adapter_name: Some("nope".into()),
            ..ScrapeOptions::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::UnknownAdapter(name) if name == "nope"));
}

#[tokio::test]
async fn list_adapters_reports_registered_names() {
    let h = harness(FakeAdapter::new("fake", &[]));
    let names: Vec<String> = h.engine.list_adapters().into_iter().map(|m| m.name).collect();
    assert_eq!(names, vec!["fake".to_string()]);
    let result = h.engine.run(ScrapeOptions::default()).await.unwrap();
    assert_eq!(result.adapters, 1);
    assert_eq!(result.discovered, 0);
    let recent = h
        .store
        .recently_seen(1, &["a".to_string()], Utc::now())
        .await
        .unwrap();
    assert!(recent.is_empty());
}
