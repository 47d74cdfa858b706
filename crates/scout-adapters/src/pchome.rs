//! PChome 24h. The public search endpoint returns JSON, so that is the primary strategy;
//! HTML responses (e.g. a redirected storefront page) fall back to JSON-LD and cards.

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use reqwest::Url;
use scout_core::{Criteria, Listing, SourceId};
use scraper::Html;
use serde_json::{json, Value as JsonValue};

use crate::extract::{
    absolute_url, cards, json_first_number, json_first_string, parse_price, SelectorSet,
};
use crate::{
    first_non_empty, json_ld_listings, price_label, product_criteria, require_terms,
    retain_product_matches, AdapterError, SourceAdapter,
};

const SEARCH_API: &str = "https://ecshweb.pchome.com.tw/search/v3.3/all/results";
const PRODUCT_BASE: &str = "https://24h.pchome.com.tw/prod";
const IMAGE_HOST: &str = "https://cs-a.ecimg.tw";

static PROD_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/prod/([A-Za-z0-9]+-[A-Za-z0-9]+)").expect("static regex is valid"));

const CARD_SETS: &[SelectorSet] = &[
    SelectorSet {
        item: "li.c-listInfoGrid__item, div.c-prodInfoV2",
        title: ".c-prodInfoV2__title",
        price: ".c-prodInfoV2__priceValue, .o-prodPrice__price",
        link: "a[href*='/prod/']",
        image: "img",
    },
    SelectorSet {
        item: "dl.col3f, div.prod_info",
        title: "h5.prod_name a, .prod_name",
        price: ".price .value, .price",
        link: "a[href*='/prod/']",
        image: "img",
    },
];

#[derive(Debug, Clone, Copy, Default)]
pub struct PchomeAdapter;

#[async_trait]
impl SourceAdapter for PchomeAdapter {
    fn source_id(&self) -> SourceId {
        SourceId::Pchome
    }

    fn build_search_url(&self, criteria: &Criteria) -> Result<String, AdapterError> {
        let criteria = product_criteria(SourceId::Pchome, criteria)?;
        let terms = require_terms(SourceId::Pchome, criteria)?;
        let mut params = vec![
            ("q", terms),
            ("page", "1".to_string()),
            ("sort", "sale/dc".to_string()),
        ];
        if criteria.min_price.is_some() || criteria.max_price.is_some() {
            let min = criteria.min_price.map_or(0, |p| p.max(0.0).floor() as i64);
            let max = criteria
                .max_price
                .map_or_else(String::new, |p| (p.ceil() as i64).to_string());
            params.push(("price", format!("{min}-{max}")));
        }
        Url::parse_with_params(SEARCH_API, &params)
            .map(|url| url.to_string())
            .map_err(|err| AdapterError::parse(SourceId::Pchome, format!("search url: {err}")))
    }

    fn parse_listings(
        &self,
        page_url: &str,
        body: &str,
        criteria: &Criteria,
    ) -> Result<Vec<Listing>, AdapterError> {
        let criteria = product_criteria(SourceId::Pchome, criteria)?;
        let mut listings = if looks_like_json(body) {
            api_listings(body)?
        } else {
            html_listings(page_url, body)
        };
        retain_product_matches(&mut listings, criteria);
        Ok(listings)
    }
}

fn looks_like_json(body: &str) -> bool {
    matches!(body.trim_start().chars().next(), Some('{') | Some('['))
}

fn product_url(id: &str) -> String {
    format!("{PRODUCT_BASE}/{id}")
}

fn canonical(url: &str) -> Option<(String, String)> {
    let id = PROD_ID_RE.captures(url)?.get(1)?.as_str().to_string();
    let url = product_url(&id);
    Some((id, url))
}

/// Parses the search API response. The endpoint has shipped both `prods` and `Prods`
/// with matching key casing; a response without either is a parse error.
pub fn api_listings(body: &str) -> Result<Vec<Listing>, AdapterError> {
    let value: JsonValue = serde_json::from_str(body)
        .map_err(|err| AdapterError::parse(SourceId::Pchome, format!("search response: {err}")))?;
    let products = ["prods", "Prods"]
        .iter()
        .find_map(|key| value.get(*key));
    let products = match products {
        Some(JsonValue::Array(items)) => items,
        Some(JsonValue::Null) => return Ok(Vec::new()),
        Some(_) | None if value.get("totalRows").is_some() || value.get("TotalRows").is_some() => {
            return Ok(Vec::new())
        }
        _ => {
            return Err(AdapterError::parse(
                SourceId::Pchome,
                "search response has no product list",
            ))
        }
    };
    Ok(products.iter().filter_map(api_listing).collect())
}

fn api_listing(record: &JsonValue) -> Option<Listing> {
    let id = json_first_string(record, &["Id", "id"])?;
    let title = json_first_string(record, &["Name", "name"])?;
    let price = json_first_number(record, &["Price", "price"]).unwrap_or(0.0);

    let mut listing = Listing::new(SourceId::Pchome, id.clone(), title, price, product_url(&id));
    listing.price_text = price_label(Some("TWD"), price);
    listing.image_url = json_first_string(record, &["PicS", "picS", "PicB", "picB"]).map(|pic| {
        if pic.starts_with("http") {
            pic
        } else {
            format!("{IMAGE_HOST}/{}", pic.trim_start_matches('/'))
        }
    });
    if let Some(origin) = json_first_number(record, &["OriginPrice", "originPrice"]) {
        listing.metadata.insert("origin_price".into(), json!(origin));
    }
    if let Some(describe) = json_first_string(record, &["Describe", "describe"]) {
        listing.metadata.insert("description".into(), json!(describe));
    }
    if let Some(sold_out) = ["isSoldOut", "IsSoldOut"]
        .iter()
        .find_map(|key| record.get(*key).and_then(JsonValue::as_bool))
    {
        listing.metadata.insert("in_stock".into(), json!(!sold_out));
    }
    listing.metadata.insert("strategy".into(), json!("search_api"));
    Some(listing)
}

fn html_listings(page_url: &str, body: &str) -> Vec<Listing> {
    let document = Html::parse_document(body);
    first_non_empty(
        SourceId::Pchome,
        &[
            ("json_ld", &|| json_ld_listings(SourceId::Pchome, &document, page_url, &canonical)),
            ("dom", &|| dom_listings(&document, page_url)),
        ],
    )
}

fn dom_listings(document: &Html, page_url: &str) -> Vec<Listing> {
    CARD_SETS
        .iter()
        .map(|set| {
            cards(document, set)
                .into_iter()
                .filter_map(|card| {
                    let href = absolute_url(page_url, card.href.as_deref()?)?;
                    let (id, url) = canonical(&href)?;
                    let price = card.price_text.as_deref().and_then(parse_price).unwrap_or(0.0);
                    let mut listing = Listing::new(SourceId::Pchome, id, card.title?, price, url);
                    listing.price_text = card.price_text.unwrap_or_default();
                    listing.image_url = card.image.and_then(|src| absolute_url(page_url, &src));
                    listing.metadata.insert("strategy".into(), json!("dom"));
                    Some(listing)
                })
                .collect::<Vec<_>>()
        })
        .find(|found| !found.is_empty())
        .unwrap_or_default()
}
