//! Postgres-backed store (sqlx). Schema lives in the workspace `migrations/` directory.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use homescout_core::{CrawlState, DiscoveryCursor, Property, PropertyType, Source};
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::Row;

use crate::store::{LockService, RecordStore, StoreError};

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

fn to_u32(value: i32, column: &'static str) -> Result<u32, StoreError> {
    u32::try_from(value).map_err(|e| StoreError::Decode {
        column,
        detail: e.to_string(),
    })
}

fn to_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    fn property_from_row(row: &PgRow) -> Result<Property, StoreError> {
        let property_type: String = row.try_get("property_type")?;
        let images: Json<Vec<String>> = row.try_get("images")?;
        let raw: JsonValue = row.try_get("raw")?;
        Ok(Property {
            source_id: row.try_get("source_id")?,
            external_id: row.try_get("external_id")?,
            url: row.try_get("url")?,
            url_canonical: row.try_get("url_canonical")?,
            title: row.try_get("title")?,
            description: row.try_get("description")?,
            price: row.try_get("price")?,
            currency: row.try_get("currency")?,
            size_sqm: row.try_get("size_sqm")?,
            bedrooms: row.try_get("bedrooms")?,
            bathrooms: row.try_get("bathrooms")?,
            property_type: PropertyType::from_db(&property_type),
            images: images.0,
            address_line1: row.try_get("address_line1")?,
            address_line2: row.try_get("address_line2")?,
            neighborhood: row.try_get("neighborhood")?,
            city: row.try_get("city")?,
            state: row.try_get("state")?,
            postal_code: row.try_get("postal_code")?,
            country: row.try_get("country")?,
            latitude: row.try_get("latitude")?,
            longitude: row.try_get("longitude")?,
            listed_at: row.try_get("listed_at")?,
            listing_updated_at: row.try_get("listing_updated_at")?,
            first_seen_at: row.try_get("first_seen_at")?,
            last_seen_at: row.try_get("last_seen_at")?,
            scraped_at: row.try_get("scraped_at")?,
            is_active: row.try_get("is_active")?,
            raw,
        })
    }
}

const UPSERT_PROPERTY_SQL: &str = r#"
INSERT INTO properties (
    source_id, external_id, url, url_canonical, title, description, price, currency,
    size_sqm, bedrooms, bathrooms, property_type, images, address_line1, address_line2,
    neighborhood, city, state, postal_code, country, latitude, longitude, listed_at,
    listing_updated_at, first_seen_at, last_seen_at, scraped_at, is_active, raw
) VALUES (
    $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15,
    $16, $17, $18, $19, $20, $21, $22, $23, $24, $25, $26, $27, $28, $29
)
ON CONFLICT (source_id, external_id) DO UPDATE SET
    url = EXCLUDED.url,
    url_canonical = EXCLUDED.url_canonical,
    title = EXCLUDED.title,
    description = EXCLUDED.description,
    price = EXCLUDED.price,
    currency = EXCLUDED.currency,
    size_sqm = EXCLUDED.size_sqm,
    bedrooms = EXCLUDED.bedrooms,
    bathrooms = EXCLUDED.bathrooms,
    property_type = EXCLUDED.property_type,
    images = EXCLUDED.images,
    address_line1 = EXCLUDED.address_line1,
    address_line2 = EXCLUDED.address_line2,
    neighborhood = EXCLUDED.neighborhood,
    city = EXCLUDED.city,
    state = EXCLUDED.state,
    postal_code = EXCLUDED.postal_code,
    country = EXCLUDED.country,
    latitude = EXCLUDED.latitude,
    longitude = EXCLUDED.longitude,
    listed_at = EXCLUDED.listed_at,
    listing_updated_at = EXCLUDED.listing_updated_at,
    last_seen_at = GREATEST(properties.last_seen_at, EXCLUDED.last_seen_at),
    scraped_at = GREATEST(properties.scraped_at, EXCLUDED.scraped_at),
    is_active = EXCLUDED.is_active,
    raw = EXCLUDED.raw
"#;

#[async_trait]
impl RecordStore for PgStore {
    async fn ensure_source(&self, name: &str, default_base_url: &str) -> Result<Source, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO sources (name, base_url) VALUES ($1, $2)
            ON CONFLICT (name) DO UPDATE SET base_url = CASE
                WHEN sources.base_url = '' THEN EXCLUDED.base_url
                ELSE sources.base_url
            END
            RETURNING id, name, base_url
            "#,
        )
        .bind(name)
        .bind(default_base_url)
        .fetch_one(&self.pool)
        .await?;
        Ok(Source {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            base_url: row.try_get("base_url")?,
        })
    }

    async fn upsert_property(&self, p: &Property) -> Result<(), StoreError> {
        sqlx::query(UPSERT_PROPERTY_SQL)
            .bind(p.source_id)
            .bind(&p.external_id)
            .bind(&p.url)
            .bind(&p.url_canonical)
            .bind(&p.title)
            .bind(&p.description)
            .bind(p.price)
            .bind(&p.currency)
            .bind(p.size_sqm)
            .bind(p.bedrooms)
            .bind(p.bathrooms)
            .bind(p.property_type.as_str())
            .bind(Json(&p.images))
            .bind(&p.address_line1)
            .bind(&p.address_line2)
            .bind(&p.neighborhood)
            .bind(&p.city)
            .bind(&p.state)
            .bind(&p.postal_code)
            .bind(&p.country)
            .bind(p.latitude)
            .bind(p.longitude)
            .bind(p.listed_at)
            .bind(p.listing_updated_at)
            .bind(p.first_seen_at)
            .bind(p.last_seen_at)
            .bind(p.scraped_at)
            .bind(p.is_active)
            .bind(&p.raw)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_property(
        &self,
        source_id: i64,
        external_id: &str,
    ) -> Result<Option<Property>, StoreError> {
        let row = sqlx::query("SELECT * FROM properties WHERE source_id = $1 AND external_id = $2")
            .bind(source_id)
            .bind(external_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::property_from_row).transpose()
    }

    async fn recently_seen(
        &self,
        source_id: i64,
        external_ids: &[String],
        since: DateTime<Utc>,
    ) -> Result<HashSet<String>, StoreError> {
        if external_ids.is_empty() {
            return Ok(HashSet::new());
        }
        let rows = sqlx::query(
            "SELECT external_id FROM properties \
             WHERE source_id = $1 AND external_id = ANY($2) AND last_seen_at >= $3",
        )
        .bind(source_id)
        .bind(external_ids)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| row.try_get::<String, _>("external_id").map_err(StoreError::from))
            .collect()
    }

    async fn get_cursor(&self, seed_url: &str) -> Result<Option<DiscoveryCursor>, StoreError> {
        let row = sqlx::query(
            "SELECT seed_url, next_page, last_run_at, last_status FROM discovery_cursors WHERE seed_url = $1",
        )
        .bind(seed_url)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(DiscoveryCursor {
            seed_url: row.try_get("seed_url")?,
            next_page: to_u32(row.try_get("next_page")?, "next_page")?,
            last_run_at: row.try_get("last_run_at")?,
            last_status: row.try_get("last_status")?,
        }))
    }

    async fn save_cursor(&self, cursor: &DiscoveryCursor) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO discovery_cursors (seed_url, next_page, last_run_at, last_status)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (seed_url) DO UPDATE SET
                next_page = EXCLUDED.next_page,
                last_run_at = EXCLUDED.last_run_at,
                last_status = EXCLUDED.last_status
            "#,
        )
        .bind(&cursor.seed_url)
        .bind(to_i32(cursor.next_page))
        .bind(cursor.last_run_at)
        .bind(&cursor.last_status)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_crawl_state(
        &self,
        adapter_name: &str,
        region: &str,
    ) -> Result<Option<CrawlState>, StoreError> {
        let row = sqlx::query(
            "SELECT * FROM crawl_states WHERE adapter_name = $1 AND region = $2",
        )
        .bind(adapter_name)
        .bind(region)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(CrawlState {
            adapter_name: row.try_get("adapter_name")?,
            region: row.try_get("region")?,
            target_max_pages: to_u32(row.try_get("target_max_pages")?, "target_max_pages")?,
            last_discovered: to_u32(row.try_get("last_discovered")?, "last_discovered")?,
            last_inserted: to_u32(row.try_get("last_inserted")?, "last_inserted")?,
            low_yield_streak: to_u32(row.try_get("low_yield_streak")?, "low_yield_streak")?,
            updated_at: row.try_get("updated_at")?,
        }))
    }

    async fn save_crawl_state(&self, state: &CrawlState) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO crawl_states (
                adapter_name, region, target_max_pages, last_discovered,
                last_inserted, low_yield_streak, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (adapter_name, region) DO UPDATE SET
                target_max_pages = EXCLUDED.target_max_pages,
                last_discovered = EXCLUDED.last_discovered,
                last_inserted = EXCLUDED.last_inserted,
                low_yield_streak = EXCLUDED.low_yield_streak,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&state.adapter_name)
        .bind(&state.region)
        .bind(to_i32(state.target_max_pages))
        .bind(to_i32(state.last_discovered))
        .bind(to_i32(state.last_inserted))
        .bind(to_i32(state.low_yield_streak))
        .bind(state.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl LockService for PgStore {
    async fn acquire(&self, lock_key: &str, owner: &str, ttl: Duration) -> Result<bool, StoreError> {
        // Single statement: the conflict branch only fires for expired rows.
        let row = sqlx::query(
            r#"
            INSERT INTO run_locks (lock_key, owner, expires_at)
            VALUES ($1, $2, now() + make_interval(secs => $3))
            ON CONFLICT (lock_key) DO UPDATE SET
                owner = EXCLUDED.owner,
                expires_at = EXCLUDED.expires_at
            WHERE run_locks.expires_at <= now()
            RETURNING owner
            "#,
        )
        .bind(lock_key)
        .bind(owner)
        .bind(ttl.as_secs_f64())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    async fn release(&self, lock_key: &str, owner: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM run_locks WHERE lock_key = $1 AND owner = $2")
            .bind(lock_key)
            .bind(owner)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
