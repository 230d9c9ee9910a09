//! Core domain model for HomeScout listings, crawl state and locks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

pub mod canonical;

pub use canonical::{canonicalize, external_id_from_url, lock_key};

pub const CRATE_NAME: &str = "homescout-core";

/// One row per crawled site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    pub id: i64,
    pub name: String,
    pub base_url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PropertyType {
    Duplex,
    Apartment,
    House,
    Townhouse,
    Land,
    Studio,
    Condo,
    #[default]
    Other,
}

impl PropertyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Duplex => "duplex",
            Self::Apartment => "apartment",
            Self::House => "house",
            Self::Townhouse => "townhouse",
            Self::Land => "land",
            Self::Studio => "studio",
            Self::Condo => "condo",
            Self::Other => "other",
        }
    }

    pub fn from_db(value: &str) -> Self {
        match value {
            "duplex" => Self::Duplex,
            "apartment" => Self::Apartment,
            "house" => Self::House,
            "townhouse" => Self::Townhouse,
            "land" => Self::Land,
            "studio" => Self::Studio,
            "condo" => Self::Condo,
            _ => Self::Other,
        }
    }
}

/// Parsed, pre-normalized handoff contract from adapters into the engine.
///
/// Everything except `external_id` and `url` is whatever text the site
/// exposed; the normalizer owns coercion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RawListing {
    pub external_id: String,
    pub url: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub price: Option<String>,
    pub currency: Option<String>,
    pub size: Option<String>,
    pub bedrooms: Option<String>,
    pub bathrooms: Option<String>,
    pub property_type: Option<String>,
    pub images: Vec<String>,
    pub address_line1: Option<String>,
    pub address_line2: Option<String>,
    pub neighborhood: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub postal_code: Option<String>,
    pub country: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub listed_at: Option<String>,
    pub listing_updated_at: Option<String>,
    pub raw: JsonValue,
}

/// Canonical persisted listing, unique by `(source_id, external_id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Property {
    pub source_id: i64,
    pub external_id: String,
    pub url: String,
    pub url_canonical: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub price: Option<f64>,
    pub currency: Option<String>,
    pub size_sqm: Option<f64>,
    pub bedrooms: Option<i32>,
    pub bathrooms: Option<i32>,
    pub property_type: PropertyType,
    pub images: Vec<String>,
    pub address_line1: Option<String>,
    pub address_line2: Option<String>,
    pub neighborhood: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub postal_code: Option<String>,
    pub country: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub listed_at: Option<DateTime<Utc>>,
    pub listing_updated_at: Option<DateTime<Utc>>,
    /// Stores keep the first value they ever saw for a key.
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub scraped_at: DateTime<Utc>,
    pub is_active: bool,
    pub raw: JsonValue,
}

/// Pagination progress for one discovery seed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryCursor {
    pub seed_url: String,
    pub next_page: u32,
    pub last_run_at: DateTime<Utc>,
    pub last_status: String,
}

/// Per (adapter, region) pacing memory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrawlState {
    pub adapter_name: String,
    pub region: String,
    pub target_max_pages: u32,
    pub last_discovered: u32,
    pub last_inserted: u32,
    pub low_yield_streak: u32,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunLock {
    pub lock_key: String,
    pub owner: String,
    pub expires_at: DateTime<Utc>,
}

impl RunLock {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Lock owner identity for one coordinator run.
pub fn new_run_owner() -> String {
    format!("run-{}", Uuid::new_v4())
}
