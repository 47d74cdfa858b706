//! Any product page, driven by the criteria's raw URL and an optional CSS selector hint.

use async_trait::async_trait;
use reqwest::Url;
use scout_core::{Criteria, Listing, ProductCriteria, SourceId};
use scraper::{ElementRef, Html};
use serde_json::json;

use crate::extract::{
    absolute_url, element_text, parse_price, select_first_attr, select_first_text, select_image,
    selector,
};
use crate::{
    first_non_empty, json_ld_listings, product_criteria, retain_product_matches, AdapterError,
    SourceAdapter,
};

/// Placeholder in a raw URL that is replaced by the URL-encoded search terms.
pub const QUERY_PLACEHOLDER: &str = "{query}";

const MICRODATA_ITEM: &str = "[itemtype*='schema.org/Product']";
const TITLE_CANDIDATES: &str = "[itemprop='name'], h1, h2, h3, h4, .title, .name, a[title]";
const PRICE_CANDIDATES: &str = "[itemprop='price'], .price, [class*='price'], [class*='Price']";

#[derive(Debug, Clone, Copy, Default)]
pub struct GenericAdapter;

#[async_trait]
impl SourceAdapter for GenericAdapter {
    fn source_id(&self) -> SourceId {
        SourceId::Generic
    }

    fn build_search_url(&self, criteria: &Criteria) -> Result<String, AdapterError> {
        let criteria = product_criteria(SourceId::Generic, criteria)?;
        target_url(criteria)
    }

    fn parse_listings(
        &self,
        page_url: &str,
        body: &str,
        criteria: &Criteria,
    ) -> Result<Vec<Listing>, AdapterError> {
        let criteria = product_criteria(SourceId::Generic, criteria)?;
        let mut listings = parse_page(page_url, body, criteria);
        retain_product_matches(&mut listings, criteria);
        Ok(listings)
    }
}

fn target_url(criteria: &ProductCriteria) -> Result<String, AdapterError> {
    let raw = criteria
        .raw_url
        .as_deref()
        .map(str::trim)
        .filter(|u| !u.is_empty())
        .ok_or_else(|| AdapterError::InvalidCriteria {
            platform: SourceId::Generic,
            reason: "raw_url is required".to_string(),
        })?;
    let filled = if raw.contains(QUERY_PLACEHOLDER) {
        let terms = criteria.search_terms();
        let encoded: String = Url::parse_with_params("http://q.invalid/", &[("q", terms.as_str())])
            .ok()
            .and_then(|u| u.query().map(|q| q.trim_start_matches("q=").to_string()))
            .unwrap_or_default();
        raw.replace(QUERY_PLACEHOLDER, &encoded)
    } else {
        raw.to_string()
    };
    let url = Url::parse(&filled).map_err(|err| AdapterError::InvalidCriteria {
        platform: SourceId::Generic,
        reason: format!("raw_url is not a valid URL: {err}"),
    })?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(AdapterError::InvalidCriteria {
            platform: SourceId::Generic,
            reason: format!("unsupported URL scheme {}", url.scheme()),
        });
    }
    Ok(url.to_string())
}

pub fn parse_page(page_url: &str, body: &str, criteria: &ProductCriteria) -> Vec<Listing> {
    let document = Html::parse_document(body);
    let hint = criteria.css_selector.as_deref().map(str::trim).filter(|s| !s.is_empty());
    first_non_empty(
        SourceId::Generic,
        &[
            ("json_ld", &|| json_ld_listings(SourceId::Generic, &document, page_url, &keep_url)),
            ("css_hint", &|| hint.map_or_else(Vec::new, |css| hinted_listings(&document, page_url, css))),
            ("microdata", &|| hinted_listings(&document, page_url, MICRODATA_ITEM)),
        ],
    )
}

fn keep_url(_url: &str) -> Option<(String, String)> {
    None
}

/// Each element matching `css` is one product card.
fn hinted_listings(document: &Html, page_url: &str, css: &str) -> Vec<Listing> {
    let Some(item) = selector(css) else {
        tracing::warn!(selector = css, "generic source selector hint does not parse");
        return Vec::new();
    };
    document
        .select(&item)
        .filter_map(|element| card_listing(element, page_url))
        .collect()
}

fn card_listing(element: ElementRef<'_>, page_url: &str) -> Option<Listing> {
    let title = select_first_text(element, TITLE_CANDIDATES)
        .or_else(|| select_first_attr(element, "a[title]", "title"))
        .or_else(|| element_text(element))?;

    let price_text = select_first_attr(element, "[itemprop='price']", "content")
        .or_else(|| select_first_text(element, PRICE_CANDIDATES))?;
    let price = parse_price(&price_text).unwrap_or(0.0);

    let href = element
        .value()
        .attr("href")
        .map(ToString::to_string)
        .or_else(|| select_first_attr(element, "a[href]", "href"));
    let url = href
        .as_deref()
        .and_then(|h| absolute_url(page_url, h))
        .unwrap_or_else(|| page_url.to_string());

    let mut listing = Listing::new(SourceId::Generic, url.clone(), title, price, url);
    listing.price_text = price_text;
    listing.image_url = select_image(element, "img").and_then(|src| absolute_url(page_url, &src));
    if let Some(currency) = select_first_attr(element, "[itemprop='priceCurrency']", "content") {
        listing.metadata.insert("currency".into(), json!(currency));
    }
    if let Some(availability) = select_first_attr(element, "[itemprop='availability']", "href")
        .or_else(|| select_first_attr(element, "[itemprop='availability']", "content"))
    {
        listing
            .metadata
            .insert("in_stock".into(), json!(availability.contains("InStock")));
    }
    listing.metadata.insert("strategy".into(), json!("selector"));
    Some(listing)
}
