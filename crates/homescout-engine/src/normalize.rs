//! Maps adapter output onto the canonical [`Property`] shape.
//!
//! Nothing here fails: unparseable fields degrade to `None` or a default.

use std::collections::HashSet;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use homescout_adapters::ListingDefaults;
use homescout_core::{canonicalize, Property, PropertyType, RawListing};
use url::Url;

pub const MAX_IMAGES: usize = 20;

const IMAGE_NOISE: &[&str] = &["sprite", "icon", "logo", "placeholder", "avatar", "blank.gif"];

fn text_or_none(value: Option<String>) -> Option<String> {
    let value = value?;
    let collapsed = value.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed)
    }
}

fn extract_numbers(text: &str) -> Vec<f64> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut seen_dot = false;
    for ch in text.chars() {
        if ch.is_ascii_digit() {
            current.push(ch);
            continue;
        }
        if ch == '.' && !seen_dot && !current.is_empty() {
            current.push(ch);
            seen_dot = true;
            continue;
        }
        if !current.is_empty() {
            if let Ok(v) = current.parse::<f64>() {
                out.push(v);
            }
            current.clear();
            seen_dot = false;
        }
    }
    if !current.is_empty() {
        if let Ok(v) = current.parse::<f64>() {
            out.push(v);
        }
    }
    out
}

/// Strips everything but digits and the first decimal point, e.g. `"₦ 4,500,000"` → `4500000`.
pub fn coerce_number(text: &str) -> Option<f64> {
    let mut digits = String::new();
    let mut seen_dot = false;
    for ch in text.chars() {
        if ch.is_ascii_digit() {
            digits.push(ch);
        } else if ch == '.' && !seen_dot && !digits.is_empty() {
            digits.push(ch);
            seen_dot = true;
        }
    }
    let trimmed = digits.trim_end_matches('.');
    if trimmed.is_empty() {
        return None;
    }
    trimmed.parse().ok()
}

/// Leading whole number of a room count such as `"3 beds"`.
pub fn coerce_count(text: &str) -> Option<i32> {
    extract_numbers(text)
        .first()
        .filter(|n| n.is_finite() && **n >= 0.0 && **n < 1000.0)
        .map(|n| n.trunc() as i32)
}

/// Square metres from `"180 sqm"`, `"1,200 m2"` or a bare number.
pub fn parse_size(text: &str) -> Option<f64> {
    let cleaned = text.replace(',', "");
    let lower = cleaned.to_lowercase();
    let has_metric_unit = ["sqm", "sq m", "sq. m", "m2", "m²", "square met"]
        .iter()
        .any(|unit| lower.contains(unit));
    if has_metric_unit {
        return extract_numbers(&lower).first().copied().filter(|n| *n > 0.0);
    }
    lower.trim().parse::<f64>().ok().filter(|n| *n > 0.0)
}

/// Ordered whole-word keyword match; the first hit wins. Plurals count.
pub fn classify_property_type(text: &str) -> PropertyType {
    let lower = text.to_lowercase();
    let words: Vec<&str> = lower
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();
    let has_word = |needle: &str| {
        words
            .iter()
            .any(|w| *w == needle || w.strip_suffix('s') == Some(needle))
    };
    let rules: &[(&[&str], PropertyType)] = &[
        (&["duplex"], PropertyType::Duplex),
        (&["apartment", "flat"], PropertyType::Apartment),
        (&["house", "bungalow", "villa"], PropertyType::House),
        (&["townhouse", "terrace"], PropertyType::Townhouse),
        (&["land", "plot"], PropertyType::Land),
        (&["studio"], PropertyType::Studio),
        (&["condo"], PropertyType::Condo),
    ];
    rules
        .iter()
        .find(|(needles, _)| needles.iter().any(|n| has_word(*n)))
        .map(|(_, kind)| *kind)
        .unwrap_or(PropertyType::Other)
}

pub fn compose_address(parts: &[Option<&str>]) -> Option<String> {
    let joined = parts
        .iter()
        .flatten()
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join(", ");
    if joined.is_empty() {
        None
    } else {
        Some(joined)
    }
}

/// Absolute, de-duplicated gallery URLs without inline data or UI chrome.
pub fn normalize_images(images: &[String], listing_url: &str) -> Vec<String> {
    let base = Url::parse(listing_url).ok();
    let mut seen = HashSet::new();
    images
        .iter()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty() && !s.starts_with("data:"))
        .filter_map(|s| match &base {
            Some(base) => base.join(s).ok(),
            None => Url::parse(s).ok(),
        })
        .filter(|u| matches!(u.scheme(), "http" | "https"))
        .map(|u| u.to_string())
        .filter(|u| {
            let lower = u.to_lowercase();
            !IMAGE_NOISE.iter().any(|noise| lower.contains(noise))
        })
        .filter(|u| seen.insert(u.clone()))
        .take(MAX_IMAGES)
        .collect()
}

pub fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Some(ts.with_timezone(&Utc));
    }
    if let Ok(ts) = NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S") {
        return Some(ts.and_utc());
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|ts| ts.and_utc())
}

fn currency_from_symbol(text: &str) -> Option<&'static str> {
    if text.contains('₦') || text.to_uppercase().contains("NGN") {
        Some("NGN")
    } else if text.contains('£') {
        Some("GBP")
    } else if text.contains('€') {
        Some("EUR")
    } else if text.contains('$') || text.to_uppercase().contains("USD") {
        Some("USD")
    } else {
        None
    }
}

fn normalize_currency(explicit: Option<String>, price_text: Option<&str>, defaults: &ListingDefaults) -> Option<String> {
    text_or_none(explicit)
        .map(|c| c.to_uppercase())
        .or_else(|| price_text.and_then(currency_from_symbol).map(str::to_string))
        .or_else(|| defaults.currency.clone())
}

fn valid_coordinate(value: Option<f64>, limit: f64) -> Option<f64> {
    value.filter(|v| v.is_finite() && v.abs() <= limit)
}

/// Canonical record for a parsed listing seen at `seen_at`.
///
/// `first_seen_at` is set to `seen_at` as well; stores keep the original on conflict.
pub fn normalize_listing(
    source_id: i64,
    raw: RawListing,
    defaults: &ListingDefaults,
    seen_at: DateTime<Utc>,
) -> Property {
    let price_text = raw.price.clone();
    let currency = normalize_currency(raw.currency, price_text.as_deref(), defaults);
    let price = price_text.as_deref().and_then(coerce_number);

    let title = text_or_none(raw.title);
    let type_hint = raw
        .property_type
        .as_deref()
        .map(classify_property_type)
        .filter(|kind| *kind != PropertyType::Other)
        .or_else(|| title.as_deref().map(classify_property_type))
        .unwrap_or_default();

    let neighborhood = text_or_none(raw.neighborhood);
    let city = text_or_none(raw.city);
    let state = text_or_none(raw.state);
    let postal_code = text_or_none(raw.postal_code);
    let country = text_or_none(raw.country).or_else(|| defaults.country.clone());
    let address_line1 = text_or_none(raw.address_line1).or_else(|| {
        compose_address(&[
            neighborhood.as_deref(),
            city.as_deref(),
            state.as_deref(),
            postal_code.as_deref(),
            country.as_deref(),
        ])
    });

    Property {
        source_id,
        external_id: raw.external_id.trim().to_string(),
        url_canonical: canonicalize(&raw.url),
        images: normalize_images(&raw.images, &raw.url),
        url: raw.url,
        title,
        description: text_or_none(raw.description),
        price,
        currency,
        size_sqm: raw.size.as_deref().and_then(parse_size),
        bedrooms: raw.bedrooms.as_deref().and_then(coerce_count),
        bathrooms: raw.bathrooms.as_deref().and_then(coerce_count),
        property_type: type_hint,
        address_line1,
        address_line2: text_or_none(raw.address_line2),
        neighborhood,
        city,
        state,
        postal_code,
        country,
        latitude: valid_coordinate(raw.latitude, 90.0),
        longitude: valid_coordinate(raw.longitude, 180.0),
        listed_at: raw.listed_at.as_deref().and_then(parse_timestamp),
        listing_updated_at: raw.listing_updated_at.as_deref().and_then(parse_timestamp),
        first_seen_at: seen_at,
        last_seen_at: seen_at,
        scraped_at: seen_at,
        is_active: true,
        raw: raw.raw,
    }
}
