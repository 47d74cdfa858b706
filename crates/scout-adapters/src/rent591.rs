//! 591 rental listings. Results come from the page's client-side hydration state, which
//! is sliced out of the markup and parsed as JSON on a blocking thread under a timeout.

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use reqwest::Url;
use scout_core::{Criteria, Listing, PropertyCriteria, SourceId};
use scout_storage::HttpFetcher;
use scraper::Html;
use serde_json::{json, Value as JsonValue};
use tracing::{debug, warn};

use crate::extract::{
    assigned_json, find_key_number, find_key_string, find_record_array, json_first_number,
    json_first_string, json_image, script_json,
};
use crate::{fetch_page, finalize, property_criteria, AdapterError, SourceAdapter};

const SEARCH_BASE: &str = "https://rent.591.com.tw/list";
const DETAIL_BASE: &str = "https://rent.591.com.tw";
pub const BLOB_PARSE_TIMEOUT: Duration = Duration::from_secs(2);
const DESCRIPTION_MAX_CHARS: usize = 500;

const ASSIGNED_BLOB_MARKERS: &[&str] = &["window.__NUXT__", "window.__INITIAL_STATE__"];
const SCRIPT_BLOB_SELECTORS: &[&str] = &["script#__NEXT_DATA__", "script#__NUXT_DATA__"];

struct Region {
    id: u32,
    name: &'static str,
    aliases: &'static [&'static str],
}

const REGIONS: &[Region] = &[
    Region { id: 1, name: "台北市", aliases: &["taipei", "taipei city"] },
    Region { id: 3, name: "新北市", aliases: &["new taipei", "new taipei city"] },
    Region { id: 6, name: "桃園市", aliases: &["taoyuan", "taoyuan city"] },
    Region { id: 8, name: "台中市", aliases: &["taichung", "taichung city"] },
    Region { id: 15, name: "台南市", aliases: &["tainan", "tainan city"] },
    Region { id: 17, name: "高雄市", aliases: &["kaohsiung", "kaohsiung city"] },
];

const DEFAULT_REGION_ID: u32 = 1;

/// Taipei City section ids.
const TAIPEI_SECTIONS: &[(&str, u32)] = &[
    ("中正", 1),
    ("大同", 2),
    ("中山", 3),
    ("松山", 4),
    ("大安", 5),
    ("萬華", 6),
    ("信義", 7),
    ("士林", 8),
    ("北投", 9),
    ("內湖", 10),
    ("南港", 11),
    ("文山", 12),
];

/// Bounds on per-listing detail page fetches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DetailPolicy {
    /// Only the first `limit` listings of a fetch are enriched.
    pub limit: usize,
    pub concurrency: usize,
}

impl Default for DetailPolicy {
    fn default() -> Self {
        Self {
            limit: 10,
            concurrency: 3,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Rent591Adapter {
    detail: DetailPolicy,
}

impl Rent591Adapter {
    pub fn new(detail: DetailPolicy) -> Self {
        Self { detail }
    }

    pub fn detail_policy(&self) -> DetailPolicy {
        self.detail
    }

    async fn enrich_details(&self, http: &HttpFetcher, listings: &mut [Listing]) {
        let limit = self.detail.limit.min(listings.len());
        if limit == 0 {
            return;
        }
        let targets: Vec<(usize, String)> = listings[..limit]
            .iter()
            .enumerate()
            .map(|(index, listing)| (index, listing.source_url.clone()))
            .collect();

        let details: Vec<(usize, Option<DetailFields>)> = stream::iter(targets)
            .map(|(index, url)| async move { (index, fetch_detail(http, &url).await) })
            .buffer_unordered(self.detail.concurrency.max(1))
            .collect()
            .await;

        let mut enriched = 0usize;
        for (index, detail) in details {
            if let (Some(detail), Some(listing)) = (detail, listings.get_mut(index)) {
                detail.apply(listing);
                enriched += 1;
            }
        }
        debug!(requested = limit, enriched, "591 detail enrichment finished");
    }
}

#[async_trait]
impl SourceAdapter for Rent591Adapter {
    fn source_id(&self) -> SourceId {
        SourceId::Rent591
    }

    fn build_search_url(&self, criteria: &Criteria) -> Result<String, AdapterError> {
        let criteria = property_criteria(SourceId::Rent591, criteria)?;
        search_url(criteria)
    }

    fn parse_listings(
        &self,
        page_url: &str,
        body: &str,
        criteria: &Criteria,
    ) -> Result<Vec<Listing>, AdapterError> {
        let criteria = property_criteria(SourceId::Rent591, criteria)?;
        Ok(parse_search_page(page_url, body, criteria))
    }

    async fn fetch_listings(
        &self,
        http: &HttpFetcher,
        criteria: &Criteria,
    ) -> Result<Vec<Listing>, AdapterError> {
        let property = property_criteria(SourceId::Rent591, criteria)?.clone();
        let url = search_url(&property)?;
        let page = fetch_page(http, SourceId::Rent591, &url).await?;
        let final_url = page.final_url.clone();
        let parsed = parse_bounded(page.body, move |body| {
            parse_search_page(&final_url, body, &property)
        })
        .await
        .unwrap_or_default();

        let (min, max) = criteria.price_range();
        let mut listings = finalize(parsed, min, max);
        self.enrich_details(http, &mut listings).await;
        Ok(listings)
    }
}

fn region_for_city(city: &str) -> Option<&'static Region> {
    let normalized = city.trim().replace('臺', "台").to_lowercase();
    if normalized.is_empty() {
        return None;
    }
    REGIONS.iter().find(|region| {
        region.name == normalized
            || region.name.trim_end_matches('市') == normalized
            || region.aliases.contains(&normalized.as_str())
    })
}

fn section_for_district(region_id: u32, district: &str) -> Option<u32> {
    if region_id != 1 {
        return None;
    }
    let name = district.trim().trim_end_matches('區');
    TAIPEI_SECTIONS
        .iter()
        .find(|(section, _)| *section == name)
        .map(|(_, id)| *id)
}

fn whole(value: f64) -> String {
    format!("{}", value.max(0.0).round() as i64)
}

fn range_param(min: Option<f64>, max: Option<f64>) -> Option<String> {
    match (min, max) {
        (Some(min), Some(max)) => Some(format!("{}_{}", whole(min), whole(max))),
        (Some(min), None) => Some(format!("{}_", whole(min))),
        (None, Some(max)) => Some(format!("0_{}", whole(max))),
        (None, None) => None,
    }
}

fn search_url(criteria: &PropertyCriteria) -> Result<String, AdapterError> {
    let region_id = region_for_city(&criteria.city).map_or(DEFAULT_REGION_ID, |r| r.id);
    let mut params: Vec<(&str, String)> = vec![("region", region_id.to_string())];

    let mut sections = Vec::new();
    let mut keywords: Vec<String> = Vec::new();
    for district in &criteria.districts {
        match section_for_district(region_id, district) {
            Some(id) => sections.push(id.to_string()),
            None if !district.trim().is_empty() => keywords.push(district.trim().to_string()),
            None => {}
        }
    }
    if !sections.is_empty() {
        params.push(("section", sections.join(",")));
    }
    if let Some(price) = range_param(criteria.min_price, criteria.max_price) {
        params.push(("price", price));
    }
    if let Some(area) = range_param(criteria.min_area, criteria.max_area) {
        params.push(("area", area));
    }
    if let Some(rooms) = criteria.rooms.filter(|r| *r > 0) {
        params.push(("layout", rooms.min(4).to_string()));
    }
    keywords.extend(
        criteria
            .keywords
            .iter()
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty()),
    );
    if !keywords.is_empty() {
        params.push(("keywords", keywords.join(" ")));
    }

    Url::parse_with_params(SEARCH_BASE, &params)
        .map(|url| url.to_string())
        .map_err(|err| AdapterError::parse(SourceId::Rent591, format!("search url: {err}")))
}

/// Locates and parses the hydration state. `None` when absent or not well-formed JSON.
pub fn extract_hydration_blob(html: &str) -> Option<JsonValue> {
    if let Some(blob) = ASSIGNED_BLOB_MARKERS
        .iter()
        .find_map(|marker| assigned_json(html, marker))
    {
        return Some(blob);
    }
    let document = Html::parse_document(html);
    SCRIPT_BLOB_SELECTORS
        .iter()
        .find_map(|css| script_json(&document, css))
}

/// Runs a parse on the blocking pool, giving up after [`BLOB_PARSE_TIMEOUT`].
async fn parse_bounded<T, F>(body: String, parse: F) -> Option<T>
where
    T: Send + 'static,
    F: FnOnce(&str) -> T + Send + 'static,
{
    let task = tokio::task::spawn_blocking(move || parse(&body));
    match tokio::time::timeout(BLOB_PARSE_TIMEOUT, task).await {
        Ok(Ok(parsed)) => Some(parsed),
        Ok(Err(err)) => {
            warn!(error = %err, "591 page parse task failed");
            None
        }
        Err(_) => {
            warn!(timeout_ms = BLOB_PARSE_TIMEOUT.as_millis() as u64, "591 page parse timed out");
            None
        }
    }
}

fn is_listing_record(value: &JsonValue) -> bool {
    value.get("title").is_some_and(JsonValue::is_string) && value.get("price").is_some()
}

pub fn parse_search_page(page_url: &str, body: &str, criteria: &PropertyCriteria) -> Vec<Listing> {
    let Some(blob) = extract_hydration_blob(body) else {
        debug!(url = page_url, "591 page has no hydration state");
        return Vec::new();
    };
    let Some(records) = find_record_array(&blob, &is_listing_record) else {
        debug!(url = page_url, "591 hydration state has no listing array");
        return Vec::new();
    };
    let city = region_for_city(&criteria.city).map(|r| r.name);
    records
        .iter()
        .filter_map(|record| listing_from_record(record, city))
        .collect()
}

fn listing_from_record(record: &JsonValue, city: Option<&str>) -> Option<Listing> {
    let id = json_first_string(record, &["post_id", "id", "houseid", "house_id"])?;
    let title = json_first_string(record, &["title"])?;
    let price = json_first_number(record, &["price"]).unwrap_or(0.0);

    let mut listing = Listing::new(
        SourceId::Rent591,
        id.clone(),
        title,
        price,
        format!("{DETAIL_BASE}/{id}"),
    );
    let price_label = json_first_string(record, &["price_str", "price"]).unwrap_or_default();
    let unit = json_first_string(record, &["price_unit", "unit"]).unwrap_or_default();
    listing.price_text = format!("{price_label}{unit}");

    let location = json_first_string(record, &["address", "location"]).or_else(|| {
        let parts: Vec<String> = ["section_name", "street_name"]
            .iter()
            .filter_map(|key| json_first_string(record, &[*key]))
            .collect();
        (!parts.is_empty()).then(|| parts.join("-"))
    });
    listing.location = location.map(|loc| match city {
        Some(city) if !loc.starts_with(city) => format!("{city}{loc}"),
        _ => loc,
    });
    listing.area = json_first_number(record, &["area"]);
    listing.rooms = json_first_number(record, &["room", "rooms", "layoutStr", "layout"]);
    listing.image_url = ["cover", "photo", "image", "photo_list", "photoList"]
        .iter()
        .find_map(|key| record.get(*key).and_then(json_image));

    for key in ["kind_name", "section_name", "floor_name", "tags", "role_name"] {
        if let Some(value) = record.get(key).filter(|v| !v.is_null()) {
            listing.metadata.insert(key.to_string(), value.clone());
        }
    }
    Some(listing)
}

#[derive(Debug, Clone, Default, PartialEq)]
struct DetailFields {
    address: Option<String>,
    coordinates: Option<(f64, f64)>,
    description: Option<String>,
}

impl DetailFields {
    fn from_blob(blob: &JsonValue) -> Self {
        let latitude = find_key_number(blob, &["lat", "latitude"]);
        let longitude = find_key_number(blob, &["lng", "lon", "longitude"]);
        let coordinates = match (latitude, longitude) {
            (Some(lat), Some(lng))
                if (-90.0..=90.0).contains(&lat)
                    && (-180.0..=180.0).contains(&lng)
                    && (lat != 0.0 || lng != 0.0) =>
            {
                Some((lat, lng))
            }
            _ => None,
        };
        let description = find_key_string(blob, &["remark", "description", "desc"])
            .map(|text| text.chars().take(DESCRIPTION_MAX_CHARS).collect());
        Self {
            address: find_key_string(blob, &["address", "addr"]),
            coordinates,
            description,
        }
    }

    fn apply(self, listing: &mut Listing) {
        if let Some(address) = self.address {
            let fuller = listing
                .location
                .as_ref()
                .map_or(true, |current| address.chars().count() > current.chars().count());
            if fuller {
                listing.location = Some(address);
            }
        }
        if let Some((lat, lng)) = self.coordinates {
            listing.metadata.insert("latitude".into(), json!(lat));
            listing.metadata.insert("longitude".into(), json!(lng));
        }
        if let Some(description) = self.description {
            listing.metadata.insert("description".into(), json!(description));
        }
    }
}

async fn fetch_detail(http: &HttpFetcher, url: &str) -> Option<DetailFields> {
    match fetch_page(http, SourceId::Rent591, url).await {
        Ok(page) => parse_bounded(page.body, |body| {
            extract_hydration_blob(body).map(|blob| DetailFields::from_blob(&blob))
        })
        .await
        .flatten(),
        Err(err) => {
            warn!(url, error = %err, "591 detail enrichment failed");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn criteria(city: &str) -> PropertyCriteria {
        PropertyCriteria {
            city: city.to_string(),
            ..PropertyCriteria::default()
        }
    }

    fn query(url: &str, key: &str) -> Option<String> {
        crate::extract::query_param(url, key)
    }

    #[test]
    fn search_url_maps_city_districts_and_ranges() {
        let mut c = criteria("臺北市");
        c.districts = vec!["信義區".into(), "大安".into(), "板橋區".into()];
        c.min_price = Some(10000.0);
        c.max_price = Some(25000.0);
        c.min_area = Some(8.0);
        c.rooms = Some(2);
        c.keywords = vec!["近捷運".into()];

        let url = search_url(&c).unwrap();
        assert!(url.starts_with("https://rent.591.com.tw/list?"));
        assert_eq!(query(&url, "region").as_deref(), Some("1"));
        assert_eq!(query(&url, "section").as_deref(), Some("7,5"));
        assert_eq!(query(&url, "price").as_deref(), Some("10000_25000"));
        assert_eq!(query(&url, "area").as_deref(), Some("8_"));
        assert_eq!(query(&url, "layout").as_deref(), Some("2"));
        assert_eq!(query(&url, "keywords").as_deref(), Some("板橋區 近捷運"));
    }

    #[test]
    fn unknown_city_falls_back_to_taipei_region() {
        let url = search_url(&criteria("Atlantis")).unwrap();
        assert_eq!(query(&url, "region").as_deref(), Some("1"));
        let url = search_url(&criteria("Kaohsiung")).unwrap();
        assert_eq!(query(&url, "region").as_deref(), Some("17"));
        let mut c = criteria("高雄市");
        c.districts = vec!["信義區".into()];
        let url = search_url(&c).unwrap();
        assert!(query(&url, "section").is_none());
        assert_eq!(query(&url, "keywords").as_deref(), Some("信義區"));
    }

    #[test]
    fn max_only_price_range_starts_at_zero() {
        let mut c = criteria("台中市");
        c.max_price = Some(15000.0);
        let url = search_url(&c).unwrap();
        assert_eq!(query(&url, "region").as_deref(), Some("8"));
        assert_eq!(query(&url, "price").as_deref(), Some("0_15000"));
    }

    #[test]
    fn listings_are_read_from_the_hydration_state() {
        let html = r#"<html><body><script>window.__NUXT__ = {"data":{"list":{"items":[
            {"post_id":16754321,"title":"信義區溫馨套房","price":"12,000","price_unit":"元/月",
             "section_name":"信義區","street_name":"吳興街","area":8.5,"layoutStr":"1房1廳",
             "photo_list":["https://img1.591.com.tw/house/a.jpg"],"kind_name":"獨立套房"},
            {"post_id":16754322,"title":"大安區兩房","price":28000,"address":"大安區復興南路","area":20,"room":2}
        ]}}};</script></body></html>"#;
        let listings = parse_search_page(SEARCH_BASE, html, &criteria("台北市"));
        assert_eq!(listings.len(), 2);

        let first = &listings[0];
        assert_eq!(first.id, "16754321");
        assert_eq!(first.price, 12000.0);
        assert_eq!(first.price_text, "12,000元/月");
        assert_eq!(first.location.as_deref(), Some("台北市信義區-吳興街"));
        assert_eq!(first.rooms, Some(1.0));
        assert_eq!(first.source_url, "https://rent.591.com.tw/16754321");
        assert_eq!(first.image_url.as_deref(), Some("https://img1.591.com.tw/house/a.jpg"));
        assert_eq!(first.metadata_str("kind_name"), Some("獨立套房"));

        assert_eq!(listings[1].location.as_deref(), Some("台北市大安區復興南路"));
        assert_eq!(listings[1].rooms, Some(2.0));
    }

    #[test]
    fn next_data_script_is_a_fallback_blob() {
        let html = r#"<html><head><script id="__NEXT_DATA__" type="application/json">
            {"props":{"pageProps":{"houses":[{"id":"99","title":"套房","price":9000}]}}}
        </script></head></html>"#;
        let listings = parse_search_page(SEARCH_BASE, html, &criteria(""));
        assert_eq!(listings.len(), 1);
        assert_eq!(listings[0].source_url, "https://rent.591.com.tw/99");
    }

    #[test]
    fn absent_or_malformed_blob_yields_no_listings() {
        assert!(parse_search_page(SEARCH_BASE, "<html><body>維護中</body></html>", &criteria("")).is_empty());
        let truncated = r#"<script>window.__NUXT__ = {"data":{"items":[{"title":"x","price":1}</script>"#;
        assert!(parse_search_page(SEARCH_BASE, truncated, &criteria("")).is_empty());
        let function_literal = "<script>window.__NUXT__=(function(a,b){return {data:[a,b]}}(1,2));</script>";
        assert!(parse_search_page(SEARCH_BASE, function_literal, &criteria("")).is_empty());
    }

    #[test]
    fn detail_blob_supplies_address_coordinates_and_description() {
        let blob = json!({"data": {"positionRound": {"lat": 25.033, "lng": 121.5654},
            "info": {"address": "台北市信義區吳興街100巷", "remark": "採光佳，近捷運"}}});
        let detail = DetailFields::from_blob(&blob);
        assert_eq!(detail.coordinates, Some((25.033, 121.5654)));

        let mut listing = Listing::new(SourceId::Rent591, "1", "套房", 12000.0, "https://rent.591.com.tw/1");
        listing.location = Some("台北市信義區".into());
        detail.apply(&mut listing);
        assert_eq!(listing.location.as_deref(), Some("台北市信義區吳興街100巷"));
        assert_eq!(listing.metadata["latitude"], json!(25.033));
        assert_eq!(listing.metadata_str("description"), Some("採光佳，近捷運"));
    }

    #[test]
    fn zero_coordinates_are_ignored() {
        let detail = DetailFields::from_blob(&json!({"lat": 0, "lng": 0}));
        assert_eq!(detail.coordinates, None);
    }

    #[tokio::test]
    async fn bounded_parse_runs_off_the_async_thread() {
        let parsed = parse_bounded("[1,2,3]".to_string(), |body| {
            serde_json::from_str::<Vec<u8>>(body).ok()
        })
        .await;
        assert_eq!(parsed, Some(Some(vec![1, 2, 3])));
    }

    #[test]
    fn default_detail_policy_is_ten_listings_three_at_a_time() {
        let adapter = Rent591Adapter::default();
        assert_eq!(adapter.detail_policy(), DetailPolicy { limit: 10, concurrency: 3 });
    }
}
