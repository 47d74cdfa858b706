//! Source adapter contract, shared post-processing and the marketplace adapters.

use std::collections::HashSet;

use async_trait::async_trait;
use reqwest::StatusCode;
use scout_core::{AlertKind, Criteria, Listing, ProductCriteria, SourceId};

use crate::extract::{absolute_url, json_ld_products, ld_product, selector};
use scout_storage::{FetchError, FetchedResponse, HttpFetcher};
use scraper::Html;
use serde_json::json;
use thiserror::Error;

pub mod amazon;
pub mod ebay;
pub mod extract;
pub mod generic;
pub mod momo;
pub mod pchome;
pub mod registry;
pub mod rent591;

pub use amazon::AmazonAdapter;
pub use ebay::EbayAdapter;
pub use generic::GenericAdapter;
pub use momo::MomoAdapter;
pub use pchome::PchomeAdapter;
pub use registry::AdapterRegistry;
pub use rent591::{DetailPolicy, Rent591Adapter};

pub const CRATE_NAME: &str = "scout-adapters";

/// Body markers of bot-check and CAPTCHA interstitials, matched case-insensitively on
/// refused (403/503) responses.
const BLOCK_MARKERS: &[&str] = &[
    "captcha",
    "robot check",
    "validatecaptcha",
    "unusual traffic",
    "are you a human",
    "access denied",
    "驗證碼",
    "請完成驗證",
];

/// Challenge phrasing that never appears on a real results page.
const CHALLENGE_SIGNATURES: &[&str] = &[
    "validatecaptcha",
    "not a robot",
    "unusual traffic",
    "are you a human",
];

/// Markers that count on a successful response only inside `<title>` or `<form>`.
const CHALLENGE_HEADINGS: &[&str] = &["robot check", "captcha", "驗證碼", "請完成驗證"];

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("could not reach {platform}: {source}")]
    Fetch {
        platform: SourceId,
        #[source]
        source: FetchError,
    },
    #[error("{platform} blocked the request with a bot check ({url})")]
    Blocked { platform: SourceId, url: String },
    #[error("{platform} page could not be parsed: {message}")]
    Parse { platform: SourceId, message: String },
    #[error("{platform} does not accept {} criteria", .kind.as_str())]
    UnsupportedCriteria { platform: SourceId, kind: AlertKind },
    #[error("{platform} criteria are incomplete: {reason}")]
    InvalidCriteria { platform: SourceId, reason: String },
    #[error("no adapter registered for source {0}")]
    UnknownSource(SourceId),
}

impl AdapterError {
    pub fn parse(platform: SourceId, message: impl Into<String>) -> Self {
        AdapterError::Parse {
            platform,
            message: message.into(),
        }
    }

    /// Classifies a fetch failure, recognising bot-check responses served with an error status.
    pub fn from_fetch(platform: SourceId, url: &str, err: FetchError) -> Self {
        if let FetchError::HttpStatus { status, body, .. } = &err {
            let status = StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY);
            if looks_blocked(status, body) {
                return AdapterError::Blocked {
                    platform,
                    url: url.to_string(),
                };
            }
        }
        AdapterError::Fetch {
            platform,
            source: err,
        }
    }

    pub fn platform(&self) -> SourceId {
        match self {
            AdapterError::Fetch { platform, .. }
            | AdapterError::Blocked { platform, .. }
            | AdapterError::Parse { platform, .. }
            | AdapterError::UnsupportedCriteria { platform, .. }
            | AdapterError::InvalidCriteria { platform, .. } => *platform,
            AdapterError::UnknownSource(source) => *source,
        }
    }
}

/// True when a response is a bot-check or CAPTCHA page rather than real content.
pub fn looks_blocked(status: StatusCode, body: &str) -> bool {
    if status == StatusCode::TOO_MANY_REQUESTS {
        return true;
    }
    if matches!(status, StatusCode::FORBIDDEN | StatusCode::SERVICE_UNAVAILABLE) {
        let lowered = body.to_lowercase();
        return body.trim().is_empty() || BLOCK_MARKERS.iter().any(|marker| lowered.contains(marker));
    }
    is_challenge_page(body)
}

/// Successful pages often embed CAPTCHA widget scripts, so a bare "captcha" substring is
/// not enough there.
fn is_challenge_page(body: &str) -> bool {
    let lowered = body.to_lowercase();
    if CHALLENGE_SIGNATURES.iter().any(|marker| lowered.contains(marker)) {
        return true;
    }
    if !CHALLENGE_HEADINGS.iter().any(|marker| lowered.contains(marker)) {
        return false;
    }
    let document = Html::parse_document(body);
    ["title", "form"]
        .iter()
        .filter_map(|css| selector(css))
        .any(|sel| {
            document.select(&sel).any(|element| {
                let text = element.text().collect::<String>().to_lowercase();
                CHALLENGE_HEADINGS.iter().any(|marker| text.contains(marker))
            })
        })
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> SourceId;

    /// URL that [`SourceAdapter::fetch_listings`] requests for these criteria. No I/O.
    fn build_search_url(&self, criteria: &Criteria) -> Result<String, AdapterError>;

    /// Parses a fetched search page. Candidates are not yet finalized.
    fn parse_listings(
        &self,
        page_url: &str,
        body: &str,
        criteria: &Criteria,
    ) -> Result<Vec<Listing>, AdapterError>;

    /// Fetches and parses the search page, returning finalized listings.
    async fn fetch_listings(
        &self,
        http: &HttpFetcher,
        criteria: &Criteria,
    ) -> Result<Vec<Listing>, AdapterError> {
        let url = self.build_search_url(criteria)?;
        let page = fetch_page(http, self.source_id(), &url).await?;
        let listings = self.parse_listings(&page.final_url, &page.body, criteria)?;
        let (min, max) = criteria.price_range();
        Ok(finalize(listings, min, max))
    }
}

/// GET with block detection on both error and success responses.
pub async fn fetch_page(
    http: &HttpFetcher,
    platform: SourceId,
    url: &str,
) -> Result<FetchedResponse, AdapterError> {
    let page = http
        .fetch_text(platform.as_str(), url)
        .await
        .map_err(|err| AdapterError::from_fetch(platform, url, err))?;
    if looks_blocked(page.status, &page.body) {
        return Err(AdapterError::Blocked {
            platform,
            url: url.to_string(),
        });
    }
    Ok(page)
}

/// Drops invalid candidates, de-duplicates by adapter-local id (first wins) and applies
/// the price range.
pub fn finalize(listings: Vec<Listing>, min_price: Option<f64>, max_price: Option<f64>) -> Vec<Listing> {
    let mut seen = HashSet::new();
    listings
        .into_iter()
        .filter(Listing::is_valid)
        .filter(|listing| seen.insert(listing.id.clone()))
        .filter(|listing| in_price_range(listing.price, min_price, max_price))
        .collect()
}

pub fn in_price_range(price: f64, min_price: Option<f64>, max_price: Option<f64>) -> bool {
    min_price.map_or(true, |min| price >= min) && max_price.map_or(true, |max| price <= max)
}

/// Product criteria the marketplaces cannot filter server-side: stock and brand.
pub fn retain_product_matches(listings: &mut Vec<Listing>, criteria: &ProductCriteria) {
    if let Some(product_id) = criteria.product_id_only() {
        listings.retain(|listing| listing.id.eq_ignore_ascii_case(product_id));
    }
    if criteria.in_stock_only {
        listings.retain(|listing| {
            listing
                .metadata
                .get("in_stock")
                .and_then(serde_json::Value::as_bool)
                .unwrap_or(true)
        });
    }
    if !criteria.brands.is_empty() {
        let brands: Vec<String> = criteria
            .brands
            .iter()
            .map(|b| b.trim().to_lowercase())
            .filter(|b| !b.is_empty())
            .collect();
        listings.retain(|listing| {
            let brand = listing.metadata_str("brand").unwrap_or_default().to_lowercase();
            let title = listing.title.to_lowercase();
            brands.iter().any(|b| title.contains(b) || brand.contains(b))
        });
    }
}

pub(crate) fn property_criteria(
    platform: SourceId,
    criteria: &Criteria,
) -> Result<&scout_core::PropertyCriteria, AdapterError> {
    criteria.as_property().ok_or(AdapterError::UnsupportedCriteria {
        platform,
        kind: criteria.kind(),
    })
}

pub(crate) fn product_criteria(
    platform: SourceId,
    criteria: &Criteria,
) -> Result<&ProductCriteria, AdapterError> {
    criteria.as_product().ok_or(AdapterError::UnsupportedCriteria {
        platform,
        kind: criteria.kind(),
    })
}

/// Search text, or an error when the criteria carry neither a query nor a product id.
pub(crate) fn require_terms(platform: SourceId, criteria: &ProductCriteria) -> Result<String, AdapterError> {
    let terms = criteria.search_terms();
    if terms.is_empty() {
        return Err(AdapterError::InvalidCriteria {
            platform,
            reason: "a search query or product id is required".to_string(),
        });
    }
    Ok(terms)
}

/// Runs extraction strategies in order and keeps the first that yields a candidate.
pub(crate) fn first_non_empty<T>(platform: SourceId, strategies: &[(&str, &dyn Fn() -> Vec<T>)]) -> Vec<T> {
    for (name, strategy) in strategies {
        let found = strategy();
        if !found.is_empty() {
            tracing::debug!(source = %platform, strategy = *name, count = found.len(), "extraction strategy matched");
            return found;
        }
    }
    tracing::debug!(source = %platform, "no extraction strategy matched");
    Vec::new()
}

/// Human-readable price, e.g. `TWD 1,490` or `USD 12.99`.
pub(crate) fn price_label(currency: Option<&str>, price: f64) -> String {
    let formatted = format!("{:.2}", price.abs());
    let (whole, cents) = formatted.split_once('.').unwrap_or((formatted.as_str(), "00"));
    let mut amount = group_thousands(whole);
    if cents != "00" {
        amount.push('.');
        amount.push_str(cents);
    }
    if price < 0.0 {
        amount.insert(0, '-');
    }
    match currency {
        Some(code) if !code.is_empty() => format!("{code} {amount}"),
        _ => amount,
    }
}

fn group_thousands(digits: &str) -> String {
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}

/// JSON-LD `Product` strategy. `canonical` maps a product URL to `(id, canonical url)`;
/// when it declines, the SKU (or URL) is the id and the absolute URL is kept.
pub(crate) fn json_ld_listings(
    platform: SourceId,
    document: &Html,
    page_url: &str,
    canonical: &dyn Fn(&str) -> Option<(String, String)>,
) -> Vec<Listing> {
    json_ld_products(document)
        .iter()
        .filter_map(ld_product)
        .filter_map(|product| {
            let url = absolute_url(page_url, product.url.as_deref()?)?;
            let (id, url) = canonical(&url)
                .unwrap_or_else(|| (product.sku.clone().unwrap_or_else(|| url.clone()), url));
            let price = product.price.unwrap_or(0.0);
            let mut listing = Listing::new(platform, id, product.name, price, url);
            listing.price_text = price_label(product.currency.as_deref(), price);
            listing.image_url = product.image;
            if let Some(currency) = product.currency {
                listing.metadata.insert("currency".into(), json!(currency));
            }
            if let Some(in_stock) = product.in_stock {
                listing.metadata.insert("in_stock".into(), json!(in_stock));
            }
            if let Some(brand) = product.brand {
                listing.metadata.insert("brand".into(), json!(brand));
            }
            listing.metadata.insert("strategy".into(), json!("json_ld"));
            Some(listing)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use scout_core::PropertyCriteria;

    fn listing(id: &str, title: &str, price: f64) -> Listing {
        Listing::new(SourceId::Momo, id, title, price, format!("https://example.test/{id}"))
    }

    #[test]
    fn finalize_drops_invalid_and_duplicate_candidates() {
        let out = finalize(
            vec![
                listing("1", "Kettle", 990.0),
                listing("2", "", 500.0),
                listing("3", "Free sample", 0.0),
                listing("1", "Kettle again", 990.0),
                listing("4", "Toaster", -1.0),
            ],
            None,
            None,
        );
        let ids: Vec<_> = out.iter().map(|l| l.id.as_str()).collect();
        assert_eq!(ids, vec!["1"]);
        assert_eq!(out[0].title, "Kettle");
    }

    #[test]
    fn finalize_applies_price_range_inclusively() {
        let out = finalize(
            vec![listing("a", "a", 100.0), listing("b", "b", 200.0), listing("c", "c", 300.0)],
            Some(200.0),
            Some(300.0),
        );
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|l| l.price >= 200.0));
    }

    #[test]
    fn block_detection_checks_status_and_markers() {
        assert!(looks_blocked(StatusCode::TOO_MANY_REQUESTS, ""));
        assert!(looks_blocked(StatusCode::OK, "<title>Robot Check</title>"));
        assert!(looks_blocked(StatusCode::OK, "<form><label>請完成驗證後繼續</label></form>"));
        assert!(looks_blocked(StatusCode::OK, "<p>We detected unusual traffic from your network</p>"));
        assert!(looks_blocked(StatusCode::FORBIDDEN, ""));
        assert!(looks_blocked(StatusCode::FORBIDDEN, "<p>Access Denied</p>"));
        assert!(!looks_blocked(StatusCode::FORBIDDEN, "<html>members only</html>"));
        assert!(!looks_blocked(StatusCode::OK, "<html><body>results</body></html>"));
    }

    #[test]
    fn captcha_widget_on_a_results_page_is_not_a_block() {
        let page = r#"<html><head><title>Kettles | Shop</title>
            <script src="https://www.google.com/recaptcha/api.js" async defer></script></head>
            <body><div class="g-recaptcha" data-sitekey="k"></div>
            <ul><li class="result">Kettle A NT$990</li></ul>
            <p>Access denied items are hidden from guests.</p>
            <p>本頁含驗證碼說明</p></body></html>"#;
        assert!(!looks_blocked(StatusCode::OK, page));
        assert!(looks_blocked(StatusCode::SERVICE_UNAVAILABLE, page));
    }

    #[test]
    fn blocked_status_error_maps_to_blocked() {
        let err = AdapterError::from_fetch(
            SourceId::Amazon,
            "https://www.amazon.com/s?k=x",
            FetchError::HttpStatus {
                status: 503,
                url: "https://www.amazon.com/s?k=x".to_string(),
                body: "<form action=\"/errors/validateCaptcha\">".to_string(),
            },
        );
        assert!(matches!(err, AdapterError::Blocked { platform: SourceId::Amazon, .. }));

        let err = AdapterError::from_fetch(
            SourceId::Amazon,
            "https://www.amazon.com/s?k=x",
            FetchError::HttpStatus {
                status: 500,
                url: "https://www.amazon.com/s?k=x".to_string(),
                body: "oops".to_string(),
            },
        );
        assert!(matches!(err, AdapterError::Fetch { .. }));
    }

    #[test]
    fn product_filters_respect_stock_and_brand() {
        let mut criteria = ProductCriteria::new(SourceId::Momo, "kettle");
        criteria.in_stock_only = true;
        criteria.brands = vec!["Tatung".to_string()];

        let mut sold_out = listing("1", "Tatung kettle", 900.0);
        sold_out.metadata.insert("in_stock".into(), serde_json::Value::Bool(false));
        let unknown_stock = listing("2", "TATUNG electric kettle", 950.0);
        let other_brand = listing("3", "Philips kettle", 800.0);
        let mut branded = listing("4", "Stainless kettle", 700.0);
        branded.metadata.insert("brand".into(), "Tatung".into());

        let mut listings = vec![sold_out, unknown_stock, other_brand, branded];
        retain_product_matches(&mut listings, &criteria);
        let ids: Vec<_> = listings.iter().map(|l| l.id.as_str()).collect();
        assert_eq!(ids, vec!["2", "4"]);
    }

    #[test]
    fn product_id_alert_keeps_only_that_product() {
        let mut criteria = ProductCriteria::new(SourceId::Ebay, "");
        criteria.query = None;
        criteria.product_id = Some(" 266123456789 ".into());

        let mut listings = vec![
            listing("256000111222", "Accessory", 20.0),
            listing("266123456789", "ThinkPad X1", 560.0),
        ];
        retain_product_matches(&mut listings, &criteria);
        assert_eq!(listings.len(), 1);
        assert_eq!(listings[0].id, "266123456789");

        criteria.query = Some("thinkpad".into());
        let mut listings = vec![listing("256000111222", "Accessory", 20.0)];
        retain_product_matches(&mut listings, &criteria);
        assert_eq!(listings.len(), 1);
    }

    #[test]
    fn price_labels_group_thousands() {
        assert_eq!(price_label(Some("TWD"), 1490.0), "TWD 1,490");
        assert_eq!(price_label(Some("USD"), 1024.5), "USD 1,024.50");
        assert_eq!(price_label(None, 12.99), "12.99");
        assert_eq!(price_label(None, 999.0), "999");
    }

    #[test]
    fn adapters_reject_the_other_criteria_kind() {
        let property = Criteria::Property(PropertyCriteria::default());
        let err = EbayAdapter.build_search_url(&property).unwrap_err();
        assert!(matches!(err, AdapterError::UnsupportedCriteria { kind: AlertKind::Property, .. }));
        assert_eq!(err.platform(), SourceId::Ebay);

        let product = Criteria::Product(ProductCriteria::new(SourceId::Ebay, "lamp"));
        let err = Rent591Adapter::default().build_search_url(&product).unwrap_err();
        assert!(matches!(err, AdapterError::UnsupportedCriteria { kind: AlertKind::Product, .. }));
    }
}
