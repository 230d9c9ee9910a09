//! Site adapter contracts, site profiles and the adapter registry.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use homescout_core::{external_id_from_url, RawListing, Source};
use homescout_storage::store::StoreError;
use homescout_storage::{FetchError, PageFetcher, RecordStore};
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;
use url::Url;
use uuid::Uuid;

pub mod discovery;
pub mod parse;

pub use discovery::PagedDiscovery;
pub use parse::{HtmlListingAdapter, JsonLdListingAdapter};

pub const CRATE_NAME: &str = "homescout-adapters";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterMeta {
    pub name: String,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("invalid selector {selector:?}: {detail}")]
    Selector { selector: String, detail: String },
    #[error("invalid external id pattern {pattern:?}: {detail}")]
    Pattern { pattern: String, detail: String },
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Everything a discovery pass needs. Owned so the returned stream can outlive the call.
#[derive(Clone)]
pub struct DiscoveryContext {
    pub run_id: Uuid,
    pub source: Source,
    pub max_pages: u32,
    pub extra_start_urls: Vec<String>,
    pub extra_listing_type: Option<String>,
    pub request_timeout: Duration,
    /// No new search page is fetched after this instant. A fetch in flight completes.
    pub deadline: Option<Instant>,
    pub fetcher: Arc<dyn PageFetcher>,
    pub store: Arc<dyn RecordStore>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseContext {
    pub run_id: Uuid,
    pub source: Source,
    pub fetched_at: DateTime<Utc>,
}

/// Values the normalizer falls back to when a listing leaves them unset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListingDefaults {
    pub country: Option<String>,
    pub currency: Option<String>,
}

pub trait ListingAdapter: Send + Sync {
    fn meta(&self) -> AdapterMeta;

    fn default_base_url(&self) -> &str;

    /// Regions crawled more recently than this are skipped by the coordinator.
    fn freshness_window(&self) -> Duration;

    fn listing_defaults(&self) -> ListingDefaults;

    fn region_seed_urls(&self, region: &str, listing_type: Option<&str>) -> Vec<String>;

    /// Cheap guess at the listing id from its URL, used before fetching.
    fn external_id_hint(&self, url: &str) -> Option<String>;

    /// Lazily yields candidate listing URLs. Unbounded from the adapter's point
    /// of view; the caller decides how many items to pull and for how long.
    fn discover_listing_urls(
        &self,
        ctx: DiscoveryContext,
    ) -> BoxStream<'static, Result<String, AdapterError>>;

    fn parse_listing(
        &self,
        ctx: &ParseContext,
        html: &str,
        url: &str,
    ) -> Result<RawListing, AdapterError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AdapterKind {
    #[default]
    Html,
    JsonLd,
}

fn default_page_param() -> String {
    "page".to_string()
}

fn default_freshness_window_mins() -> u64 {
    10
}

fn default_link_selector() -> String {
    "a[href]".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSelectors {
    #[serde(default = "FieldSelectors::default_title")]
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub price: Option<String>,
    #[serde(default)]
    pub bedrooms: Option<String>,
    #[serde(default)]
    pub bathrooms: Option<String>,
    #[serde(default)]
    pub size: Option<String>,
    #[serde(default)]
    pub property_type: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub neighborhood: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default = "FieldSelectors::default_images")]
    pub images: String,
    /// Element whose `data-listing-id` attribute carries the site's id.
    #[serde(default)]
    pub listing_id: Option<String>,
}

impl FieldSelectors {
    fn default_title() -> String {
        "h1".to_string()
    }

    fn default_images() -> String {
        "img".to_string()
    }
}

impl Default for FieldSelectors {
    fn default() -> Self {
        Self {
            title: Self::default_title(),
            description: Some(".description".to_string()),
            price: Some(".price".to_string()),
            bedrooms: Some(".bedrooms".to_string()),
            bathrooms: Some(".bathrooms".to_string()),
            size: Some(".size".to_string()),
            property_type: Some(".property-type".to_string()),
            address: Some(".address".to_string()),
            neighborhood: None,
            city: None,
            state: None,
            images: Self::default_images(),
            listing_id: Some("[data-listing-id]".to_string()),
        }
    }
}

/// Declarative description of one listing site, loaded from `sites.yaml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteProfile {
    pub name: String,
    #[serde(default)]
    pub kind: AdapterKind,
    pub base_url: String,
    /// Search pages crawled when no start URLs are supplied.
    #[serde(default)]
    pub seed_paths: Vec<String>,
    /// Templates with `{region}` and `{listing_type}` placeholders.
    #[serde(default)]
    pub region_paths: Vec<String>,
    #[serde(default)]
    pub default_listing_type: Option<String>,
    #[serde(default = "default_link_selector")]
    pub listing_link_selector: String,
    /// Substring a listing URL path must contain, e.g. `/listing/`.
    #[serde(default)]
    pub listing_path_marker: Option<String>,
    #[serde(default = "default_page_param")]
    pub page_param: String,
    /// Query parameter holding the listing id.
    #[serde(default)]
    pub external_id_param: Option<String>,
    /// Regex over the URL path whose first capture group is the listing id.
    /// Without this or `external_id_param` the last path segment is used.
    #[serde(default)]
    pub external_id_pattern: Option<String>,
    #[serde(default = "default_freshness_window_mins")]
    pub freshness_window_mins: u64,
    #[serde(default)]
    pub default_country: Option<String>,
    #[serde(default)]
    pub default_currency: Option<String>,
    #[serde(default)]
    pub selectors: FieldSelectors,
}

/// How a site's listing id is read off a listing URL.
///
/// Adapters use the URL id ahead of anything found on the page, so the id
/// checked before fetching is the id that gets stored.
#[derive(Debug, Clone)]
pub enum ExternalIdRule {
    QueryParam(String),
    PathPattern(Regex),
    LastSegment,
    /// Profile carried a pattern that does not compile; no URL ids at all.
    Disabled,
}

impl ExternalIdRule {
    pub fn from_profile(profile: &SiteProfile) -> Result<Self, AdapterError> {
        if let Some(param) = &profile.external_id_param {
            return Ok(Self::QueryParam(param.clone()));
        }
        let Some(raw) = &profile.external_id_pattern else {
            return Ok(Self::LastSegment);
        };
        let pattern = Regex::new(raw).map_err(|e| AdapterError::Pattern {
            pattern: raw.clone(),
            detail: e.to_string(),
        })?;
        if pattern.captures_len() < 2 {
            return Err(AdapterError::Pattern {
                pattern: raw.clone(),
                detail: "needs a capture group".to_string(),
            });
        }
        Ok(Self::PathPattern(pattern))
    }

    /// Like [`Self::from_profile`], but a broken rule is logged and disables URL ids.
    pub fn for_adapter(profile: &SiteProfile) -> Self {
        Self::from_profile(profile).unwrap_or_else(|err| {
            warn!(site = %profile.name, error = %err, "external id rule disabled");
            Self::Disabled
        })
    }

    pub fn hint(&self, url: &str) -> Option<String> {
        let id = match self {
            Self::QueryParam(param) => Url::parse(url).ok().and_then(|u| {
                u.query_pairs()
                    .find(|(k, _)| k == param.as_str())
                    .map(|(_, v)| v.into_owned())
            }),
            Self::PathPattern(pattern) => Url::parse(url).ok().and_then(|u| {
                pattern
                    .captures(u.path().trim_end_matches('/'))
                    .and_then(|c| c.get(1))
                    .map(|m| m.as_str().to_string())
            }),
            Self::LastSegment => external_id_from_url(url),
            Self::Disabled => None,
        };
        id.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
    }
}

impl SiteProfile {
    pub fn listing_type<'a>(&'a self, requested: Option<&'a str>) -> &'a str {
        requested
            .or(self.default_listing_type.as_deref())
            .unwrap_or("for-rent")
    }

    fn resolve_path(&self, base_url: &str, path: &str) -> Option<String> {
        if path.starts_with("http://") || path.starts_with("https://") {
            return Some(path.to_string());
        }
        Url::parse(base_url)
            .ok()?
            .join(path)
            .ok()
            .map(|u| u.to_string())
    }

    pub fn seed_urls(&self, base_url: &str, listing_type: Option<&str>) -> Vec<String> {
        let listing_type = self.listing_type(listing_type);
        self.seed_paths
            .iter()
            .map(|p| p.replace("{listing_type}", listing_type))
            .filter_map(|p| self.resolve_path(base_url, &p))
            .collect()
    }

    pub fn region_seed_urls(&self, region: &str, listing_type: Option<&str>) -> Vec<String> {
        let slug = region_slug(region);
        let listing_type = self.listing_type(listing_type);
        self.region_paths
            .iter()
            .map(|p| {
                p.replace("{region}", &slug)
                    .replace("{listing_type}", listing_type)
            })
            .filter_map(|p| self.resolve_path(&self.base_url, &p))
            .collect()
    }

    pub fn freshness_window(&self) -> Duration {
        Duration::from_secs(self.freshness_window_mins.saturating_mul(60))
    }

    pub fn listing_defaults(&self) -> ListingDefaults {
        ListingDefaults {
            country: self.default_country.clone(),
            currency: self.default_currency.clone(),
        }
    }
}

pub fn region_slug(region: &str) -> String {
    region
        .trim()
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}

#[derive(Debug, Clone, Deserialize)]
pub struct SiteRegistry {
    pub sites: Vec<SiteProfile>,
}

impl SiteRegistry {
    /// Compiles every profile's id rule so a bad pattern fails at load time.
    pub fn validate(&self) -> Result<()> {
        for site in &self.sites {
            ExternalIdRule::from_profile(site).with_context(|| format!("site {}", site.name))?;
        }
        Ok(())
    }
}

pub fn load_site_registry(path: impl AsRef<Path>) -> Result<SiteRegistry> {
    let path = path.as_ref();
    let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let registry: SiteRegistry =
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    registry.validate()?;
    Ok(registry)
}

pub fn adapter_for_profile(profile: SiteProfile) -> Arc<dyn ListingAdapter> {
    match profile.kind {
        AdapterKind::Html => Arc::new(HtmlListingAdapter::new(profile)),
        AdapterKind::JsonLd => Arc::new(JsonLdListingAdapter::new(profile)),
    }
}

/// Name-keyed lookup table of adapters, built once at startup.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: BTreeMap<String, Arc<dyn ListingAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_profiles(profiles: impl IntoIterator<Item = SiteProfile>) -> Self {
        let mut registry = Self::new();
        for profile in profiles {
            registry.register(adapter_for_profile(profile));
        }
        registry
    }

    pub fn register(&mut self, adapter: Arc<dyn ListingAdapter>) {
        self.adapters.insert(adapter.meta().name, adapter);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ListingAdapter>> {
        self.adapters.get(name).cloned()
    }

    pub fn all(&self) -> Vec<Arc<dyn ListingAdapter>> {
        self.adapters.values().cloned().collect()
    }

    pub fn metas(&self) -> Vec<AdapterMeta> {
        self.adapters.values().map(|a| a.meta()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}
