//! The two profile-driven adapter variants: CSS selectors, and JSON-LD with selector fallback.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::BoxStream;
use homescout_core::RawListing;
use scraper::{Html, Selector};
use serde_json::{json, Value as JsonValue};

use crate::discovery::PagedDiscovery;
use crate::{
    AdapterError, AdapterMeta, DiscoveryContext, ExternalIdRule, FieldSelectors, ListingAdapter,
    ListingDefaults, ParseContext, SiteProfile,
};

const JSON_LD_LISTING_TYPES: &[&str] = &[
    "Accommodation",
    "Apartment",
    "House",
    "Offer",
    "Place",
    "Product",
    "RealEstateListing",
    "Residence",
    "SingleFamilyResidence",
];

fn text_or_none(value: String) -> Option<String> {
    let collapsed = value.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed)
    }
}

fn selector(raw: &str) -> Result<Selector, AdapterError> {
    Selector::parse(raw).map_err(|e| AdapterError::Selector {
        selector: raw.to_string(),
        detail: e.to_string(),
    })
}

fn select_first_text(document: &Html, raw: Option<&str>) -> Result<Option<String>, AdapterError> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    let sel = selector(raw)?;
    Ok(document
        .select(&sel)
        .next()
        .and_then(|n| text_or_none(n.text().collect::<String>())))
}

fn select_first_attr(document: &Html, raw: &str, attr: &str) -> Result<Option<String>, AdapterError> {
    let sel = selector(raw)?;
    Ok(document
        .select(&sel)
        .find_map(|n| n.value().attr(attr))
        .and_then(|s| text_or_none(s.to_string())))
}

fn select_all_attrs(document: &Html, raw: &str, attrs: &[&str]) -> Result<Vec<String>, AdapterError> {
    let sel = selector(raw)?;
    Ok(document
        .select(&sel)
        .filter_map(|n| attrs.iter().find_map(|a| n.value().attr(a)))
        .filter_map(|s| text_or_none(s.to_string()))
        .collect())
}

fn meta_content(document: &Html, property: &str) -> Result<Option<String>, AdapterError> {
    select_first_attr(
        document,
        &format!(r#"meta[property="{property}"], meta[name="{property}"]"#),
        "content",
    )
}

/// Fields reachable through the profile's CSS selectors and OpenGraph tags.
fn html_fields(document: &Html, selectors: &FieldSelectors) -> Result<RawListing, AdapterError> {
    let mut images = select_all_attrs(document, &selectors.images, &["src", "data-src"])?;
    if let Some(og_image) = meta_content(document, "og:image")? {
        images.insert(0, og_image);
    }

    let title = select_first_text(document, Some(&selectors.title))?
        .or(meta_content(document, "og:title")?);
    let description = select_first_text(document, selectors.description.as_deref())?
        .or(meta_content(document, "og:description")?)
        .or(meta_content(document, "description")?);

    Ok(RawListing {
        title,
        description,
        price: select_first_text(document, selectors.price.as_deref())?,
        size: select_first_text(document, selectors.size.as_deref())?,
        bedrooms: select_first_text(document, selectors.bedrooms.as_deref())?,
        bathrooms: select_first_text(document, selectors.bathrooms.as_deref())?,
        property_type: select_first_text(document, selectors.property_type.as_deref())?,
        address_line1: select_first_text(document, selectors.address.as_deref())?,
        neighborhood: select_first_text(document, selectors.neighborhood.as_deref())?,
        city: select_first_text(document, selectors.city.as_deref())?,
        state: select_first_text(document, selectors.state.as_deref())?,
        images,
        ..RawListing::default()
    })
}

fn listing_id_attr(document: &Html, selectors: &FieldSelectors) -> Result<Option<String>, AdapterError> {
    match selectors.listing_id.as_deref() {
        Some(raw) => select_first_attr(document, raw, "data-listing-id"),
        None => Ok(None),
    }
}

fn fill<T>(slot: &mut Option<T>, fallback: Option<T>) {
    if slot.is_none() {
        *slot = fallback;
    }
}

/// Fills every empty field of `primary` from `fallback`.
fn merge_missing(primary: &mut RawListing, fallback: RawListing) {
    fill(&mut primary.title, fallback.title);
    fill(&mut primary.description, fallback.description);
    fill(&mut primary.price, fallback.price);
    fill(&mut primary.currency, fallback.currency);
    fill(&mut primary.size, fallback.size);
    fill(&mut primary.bedrooms, fallback.bedrooms);
    fill(&mut primary.bathrooms, fallback.bathrooms);
    fill(&mut primary.property_type, fallback.property_type);
    fill(&mut primary.address_line1, fallback.address_line1);
    fill(&mut primary.address_line2, fallback.address_line2);
    fill(&mut primary.neighborhood, fallback.neighborhood);
    fill(&mut primary.city, fallback.city);
    fill(&mut primary.state, fallback.state);
    fill(&mut primary.postal_code, fallback.postal_code);
    fill(&mut primary.country, fallback.country);
    fill(&mut primary.latitude, fallback.latitude);
    fill(&mut primary.longitude, fallback.longitude);
    fill(&mut primary.listed_at, fallback.listed_at);
    fill(&mut primary.listing_updated_at, fallback.listing_updated_at);
    if primary.images.is_empty() {
        primary.images = fallback.images;
    }
}

/// The URL id wins so that ids checked before fetching match stored ones.
fn finish_listing(
    mut listing: RawListing,
    page_id: Option<String>,
    id_rule: &ExternalIdRule,
    url: &str,
) -> Result<RawListing, AdapterError> {
    let external_id = id_rule
        .hint(url)
        .or(page_id)
        .ok_or_else(|| AdapterError::Parse(format!("no external id derivable for {url}")))?;
    listing.external_id = external_id;
    listing.url = url.to_string();
    Ok(listing)
}

#[derive(Debug, Clone)]
pub struct HtmlListingAdapter {
    profile: Arc<SiteProfile>,
    id_rule: ExternalIdRule,
}

impl HtmlListingAdapter {
    pub fn new(profile: SiteProfile) -> Self {
        Self {
            id_rule: ExternalIdRule::for_adapter(&profile),
            profile: Arc::new(profile),
        }
    }
}

#[derive(Debug, Clone)]
pub struct JsonLdListingAdapter {
    profile: Arc<SiteProfile>,
    id_rule: ExternalIdRule,
}

impl JsonLdListingAdapter {
    pub fn new(profile: SiteProfile) -> Self {
        Self {
            id_rule: ExternalIdRule::for_adapter(&profile),
            profile: Arc::new(profile),
        }
    }
}

fn json_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => text_or_none(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Array(items) => items.iter().find_map(json_text),
        JsonValue::Object(map) => map
            .get("name")
            .or_else(|| map.get("@value"))
            .or_else(|| map.get("value"))
            .and_then(json_text),
        _ => None,
    }
}

fn json_path<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a JsonValue> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    Some(cur)
}

fn json_str_at(value: &JsonValue, paths: &[&[&str]]) -> Option<String> {
    paths
        .iter()
        .find_map(|path| json_path(value, path).and_then(json_text))
}

fn json_f64_at(value: &JsonValue, path: &[&str]) -> Option<f64> {
    let v = json_path(value, path)?;
    v.as_f64().or_else(|| v.as_str().and_then(|s| s.trim().parse().ok()))
}

fn type_matches(node: &JsonValue) -> bool {
    match node.get("@type") {
        Some(JsonValue::String(t)) => JSON_LD_LISTING_TYPES.contains(&t.as_str()),
        Some(JsonValue::Array(types)) => types
            .iter()
            .filter_map(JsonValue::as_str)
            .any(|t| JSON_LD_LISTING_TYPES.contains(&t)),
        _ => false,
    }
}

fn collect_nodes<'a>(value: &'a JsonValue, out: &mut Vec<&'a JsonValue>) {
    match value {
        JsonValue::Array(items) => items.iter().for_each(|v| collect_nodes(v, out)),
        JsonValue::Object(map) => {
            if type_matches(value) {
                out.push(value);
            }
            if let Some(graph) = map.get("@graph") {
                collect_nodes(graph, out);
            }
        }
        _ => {}
    }
}

/// First JSON-LD node describing a listing, if any block parses.
fn find_json_ld_listing(document: &Html) -> Result<Option<JsonValue>, AdapterError> {
    let sel = selector(r#"script[type="application/ld+json"]"#)?;
    for script in document.select(&sel) {
        let text = script.text().collect::<String>();
        let Ok(value) = serde_json::from_str::<JsonValue>(text.trim()) else {
            continue;
        };
        let mut nodes = Vec::new();
        collect_nodes(&value, &mut nodes);
        if let Some(node) = nodes.first() {
            return Ok(Some((*node).clone()));
        }
    }
    Ok(None)
}

fn json_ld_images(node: &JsonValue) -> Vec<String> {
    match node.get("image") {
        Some(JsonValue::String(s)) => vec![s.clone()],
        Some(JsonValue::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string).or_else(|| json_str_at(v, &[&["url"]])))
            .collect(),
        Some(obj @ JsonValue::Object(_)) => json_str_at(obj, &[&["url"]]).into_iter().collect(),
        _ => Vec::new(),
    }
}

fn json_ld_fields(node: &JsonValue) -> (RawListing, Option<String>) {
    let listing = RawListing {
        title: json_str_at(node, &[&["name"], &["headline"]]),
        description: json_str_at(node, &[&["description"]]),
        price: json_str_at(node, &[&["offers", "price"], &["price"]]),
        currency: json_str_at(node, &[&["offers", "priceCurrency"], &["priceCurrency"]]),
        size: json_str_at(
            node,
            &[&["floorSize", "value"], &["floorSize"], &["itemOffered", "floorSize", "value"]],
        )
        .map(|size| {
            match json_str_at(node, &[&["floorSize", "unitCode"], &["floorSize", "unitText"]]) {
                Some(unit) if unit.eq_ignore_ascii_case("MTK") => format!("{size} sqm"),
                Some(unit) => format!("{size} {unit}"),
                None => size,
            }
        }),
        bedrooms: json_str_at(
            node,
            &[&["numberOfBedrooms"], &["numberOfRooms"], &["itemOffered", "numberOfRooms"]],
        ),
        bathrooms: json_str_at(
            node,
            &[&["numberOfBathroomsTotal"], &["numberOfFullBathrooms"]],
        ),
        property_type: json_str_at(node, &[&["additionalType"], &["category"], &["@type"]]),
        address_line1: json_str_at(node, &[&["address", "streetAddress"]]),
        neighborhood: json_str_at(node, &[&["address", "addressNeighborhood"]]),
        city: json_str_at(node, &[&["address", "addressLocality"]]),
        state: json_str_at(node, &[&["address", "addressRegion"]]),
        postal_code: json_str_at(node, &[&["address", "postalCode"]]),
        country: json_str_at(node, &[&["address", "addressCountry"]]),
        latitude: json_f64_at(node, &["geo", "latitude"]),
        longitude: json_f64_at(node, &["geo", "longitude"]),
        listed_at: json_str_at(node, &[&["datePosted"], &["datePublished"]]),
        listing_updated_at: json_str_at(node, &[&["dateModified"]]),
        images: json_ld_images(node),
        raw: node.clone(),
        ..RawListing::default()
    };
    let external_id = json_str_at(node, &[&["sku"], &["productID"], &["identifier"]]);
    (listing, external_id)
}

impl ListingAdapter for HtmlListingAdapter {
    fn meta(&self) -> AdapterMeta {
        AdapterMeta {
            name: self.profile.name.clone(),
        }
    }

    fn default_base_url(&self) -> &str {
        &self.profile.base_url
    }

    fn freshness_window(&self) -> Duration {
        self.profile.freshness_window()
    }

    fn listing_defaults(&self) -> ListingDefaults {
        self.profile.listing_defaults()
    }

    fn region_seed_urls(&self, region: &str, listing_type: Option<&str>) -> Vec<String> {
        self.profile.region_seed_urls(region, listing_type)
    }

    fn external_id_hint(&self, url: &str) -> Option<String> {
        self.id_rule.hint(url)
    }

    fn discover_listing_urls(
        &self,
        ctx: DiscoveryContext,
    ) -> BoxStream<'static, Result<String, AdapterError>> {
        PagedDiscovery::new(Arc::clone(&self.profile), ctx).into_stream()
    }

    fn parse_listing(
        &self,
        ctx: &ParseContext,
        html: &str,
        url: &str,
    ) -> Result<RawListing, AdapterError> {
        let document = Html::parse_document(html);
        let mut listing = html_fields(&document, &self.profile.selectors)?;
        listing.raw = json!({
            "adapter": self.profile.name,
            "parser": "html",
            "fetched_at": ctx.fetched_at,
        });
        let external_id = listing_id_attr(&document, &self.profile.selectors)?;
        finish_listing(listing, external_id, &self.id_rule, url)
    }
}

impl ListingAdapter for JsonLdListingAdapter {
    fn meta(&self) -> AdapterMeta {
        AdapterMeta {
            name: self.profile.name.clone(),
        }
    }

    fn default_base_url(&self) -> &str {
        &self.profile.base_url
    }

    fn freshness_window(&self) -> Duration {
        self.profile.freshness_window()
    }

    fn listing_defaults(&self) -> ListingDefaults {
        self.profile.listing_defaults()
    }

    fn region_seed_urls(&self, region: &str, listing_type: Option<&str>) -> Vec<String> {
        self.profile.region_seed_urls(region, listing_type)
    }

    fn external_id_hint(&self, url: &str) -> Option<String> {
        self.id_rule.hint(url)
    }

    fn discover_listing_urls(
        &self,
        ctx: DiscoveryContext,
    ) -> BoxStream<'static, Result<String, AdapterError>> {
        PagedDiscovery::new(Arc::clone(&self.profile), ctx).into_stream()
    }

    fn parse_listing(
        &self,
        ctx: &ParseContext,
        html: &str,
        url: &str,
    ) -> Result<RawListing, AdapterError> {
        let document = Html::parse_document(html);
        let (mut listing, ld_id) = match find_json_ld_listing(&document)? {
            Some(node) => json_ld_fields(&node),
            None => (RawListing::default(), None),
        };
        let fallback = html_fields(&document, &self.profile.selectors)?;
        merge_missing(&mut listing, fallback);
        listing.raw = json!({
            "adapter": self.profile.name,
            "parser": "json_ld",
            "fetched_at": ctx.fetched_at,
            "json_ld": listing.raw,
        });
        let external_id = match ld_id {
            Some(id) => Some(id),
            None => listing_id_attr(&document, &self.profile.selectors)?,
        };
        finish_listing(listing, external_id, &self.id_rule, url)
    }
}
