//! Amazon US search results.

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use reqwest::Url;
use scout_core::{Criteria, Listing, SourceId};
use scraper::Html;
use serde_json::json;

use crate::extract::{
    absolute_url, cards, parse_price, select_first_text, selector, SelectorSet,
};
use crate::{
    first_non_empty, json_ld_listings, product_criteria, require_terms, retain_product_matches,
    AdapterError, SourceAdapter,
};

const BASE: &str = "https://www.amazon.com";
/// Refinement id Amazon uses for the "Prime eligible" filter.
const PRIME_REFINEMENT: &str = "p_85:2470955011";

static ASIN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/(?:dp|gp/product)/([A-Z0-9]{10})").expect("static regex is valid"));

const CARD_SETS: &[SelectorSet] = &[
    SelectorSet {
        item: "div[data-component-type='s-search-result'][data-asin]",
        title: "h2 a span, h2 span, h2",
        price: ".a-price:not(.a-text-price) .a-offscreen, .a-price .a-offscreen",
        link: "h2 a, a.a-link-normal.s-no-outline, a[href*='/dp/']",
        image: "img.s-image",
    },
    SelectorSet {
        item: "div.s-result-item[data-asin]",
        title: "h2, .a-size-base-plus, .a-size-medium",
        price: ".a-price .a-offscreen, .a-color-price",
        link: "a[href*='/dp/']",
        image: "img",
    },
];

#[derive(Debug, Clone, Copy, Default)]
pub struct AmazonAdapter;

#[async_trait]
impl SourceAdapter for AmazonAdapter {
    fn source_id(&self) -> SourceId {
        SourceId::Amazon
    }

    fn build_search_url(&self, criteria: &Criteria) -> Result<String, AdapterError> {
        let criteria = product_criteria(SourceId::Amazon, criteria)?;
        let terms = require_terms(SourceId::Amazon, criteria)?;
        let mut params = vec![("k", terms)];
        if let Some(min) = criteria.min_price {
            params.push(("low-price", format!("{}", min.max(0.0).floor() as i64)));
        }
        if let Some(max) = criteria.max_price {
            params.push(("high-price", format!("{}", max.ceil() as i64)));
        }
        if criteria.prime_only {
            params.push(("rh", PRIME_REFINEMENT.to_string()));
        }
        if let Some(category) = criteria.category.as_deref().filter(|c| !c.trim().is_empty()) {
            params.push(("i", category.trim().to_string()));
        }
        Url::parse_with_params(&format!("{BASE}/s"), &params)
            .map(|url| url.to_string())
            .map_err(|err| AdapterError::parse(SourceId::Amazon, format!("search url: {err}")))
    }

    fn parse_listings(
        &self,
        page_url: &str,
        body: &str,
        criteria: &Criteria,
    ) -> Result<Vec<Listing>, AdapterError> {
        let criteria = product_criteria(SourceId::Amazon, criteria)?;
        let mut listings = parse_search_page(page_url, body);
        if criteria.prime_only {
            listings.retain(|listing| listing.metadata.get("prime") == Some(&json!(true)));
        }
        retain_product_matches(&mut listings, criteria);
        Ok(listings)
    }
}

fn product_url(asin: &str) -> String {
    format!("{BASE}/dp/{asin}")
}

fn canonical(url: &str) -> Option<(String, String)> {
    let asin = ASIN_RE.captures(url)?.get(1)?.as_str().to_string();
    let url = product_url(&asin);
    Some((asin, url))
}

pub fn parse_search_page(page_url: &str, body: &str) -> Vec<Listing> {
    let document = Html::parse_document(body);
    first_non_empty(
        SourceId::Amazon,
        &[
            ("json_ld", &|| json_ld_listings(SourceId::Amazon, &document, page_url, &canonical)),
            ("dom", &|| dom_listings(&document, page_url)),
        ],
    )
}

fn dom_listings(document: &Html, page_url: &str) -> Vec<Listing> {
    let prime_badge = selector("i.a-icon-prime, span[aria-label*='Prime'], .s-prime");
    CARD_SETS
        .iter()
        .map(|set| {
            cards(document, set)
                .into_iter()
                .filter_map(|card| {
                    let asin = card
                        .element
                        .value()
                        .attr("data-asin")
                        .map(str::trim)
                        .filter(|a| !a.is_empty())?
                        .to_string();
                    let price_text = card.price_text.clone().or_else(|| whole_and_fraction(&card))?;
                    let price = parse_price(&price_text).unwrap_or(0.0);
                    let mut listing =
                        Listing::new(SourceId::Amazon, asin.clone(), card.title?, price, product_url(&asin));
                    listing.price_text = price_text;
                    listing.image_url = card.image.and_then(|src| absolute_url(page_url, &src));
                    let prime = prime_badge
                        .as_ref()
                        .is_some_and(|badge| card.element.select(badge).next().is_some());
                    listing.metadata.insert("prime".into(), json!(prime));
                    if let Some(rating) = select_first_text(card.element, ".a-icon-alt") {
                        listing.metadata.insert("rating".into(), json!(rating));
                    }
                    if card.element.value().attr("data-component-type") == Some("sp-sponsored-result")
                        || select_first_text(card.element, ".puis-sponsored-label-text").is_some()
                    {
                        listing.metadata.insert("sponsored".into(), json!(true));
                    }
                    listing.metadata.insert("strategy".into(), json!("dom"));
                    Some(listing)
                })
                .collect::<Vec<_>>()
        })
        .find(|found| !found.is_empty())
        .unwrap_or_default()
}

/// Price split into `.a-price-whole` and `.a-price-fraction` when no screen-reader text exists.
fn whole_and_fraction(card: &crate::extract::Card<'_>) -> Option<String> {
    let whole = select_first_text(card.element, ".a-price-whole")?;
    let whole = whole.trim_end_matches('.');
    let fraction = select_first_text(card.element, ".a-price-fraction").unwrap_or_else(|| "00".into());
    Some(format!("${whole}.{fraction}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::query_param;
    use scout_core::ProductCriteria;

    const RESULTS: &str = r#"<html><body><div class="s-main-slot">
      <div data-component-type="s-search-result" data-asin="B0C1234567">
        <h2><a class="a-link-normal" href="/Kindle-Paperwhite/dp/B0C1234567/ref=sr_1_1"><span>Kindle Paperwhite</span></a></h2>
        <span class="a-price"><span class="a-offscreen">$149.99</span><span aria-hidden="true">$149<span class="a-price-fraction">99</span></span></span>
        <i class="a-icon a-icon-prime" aria-label="Amazon Prime"></i>
        <span class="a-icon-alt">4.7 out of 5 stars</span>
        <img class="s-image" src="https://m.media-amazon.com/images/I/a.jpg">
      </div>
      <div data-component-type="s-search-result" data-asin="B0D7654321">
        <h2><span>Kindle Case</span></h2>
        <span class="a-price"><span class="a-price-whole">19.</span><span class="a-price-fraction">49</span></span>
      </div>
      <div data-component-type="s-search-result" data-asin="">
        <h2><span>Editorial widget</span></h2>
      </div>
    </div></body></html>"#;

    fn criteria() -> ProductCriteria {
        ProductCriteria::new(SourceId::Amazon, "kindle")
    }

    #[test]
    fn search_url_carries_price_prime_and_category() {
        let mut c = criteria();
        c.min_price = Some(10.5);
        c.max_price = Some(200.0);
        c.prime_only = true;
        c.category = Some("digital-text".into());
        let url = AmazonAdapter.build_search_url(&Criteria::Product(c)).unwrap();
        assert!(url.starts_with("https://www.amazon.com/s?"));
        assert_eq!(query_param(&url, "k").as_deref(), Some("kindle"));
        assert_eq!(query_param(&url, "low-price").as_deref(), Some("10"));
        assert_eq!(query_param(&url, "high-price").as_deref(), Some("200"));
        assert_eq!(query_param(&url, "rh").as_deref(), Some(PRIME_REFINEMENT));
        assert_eq!(query_param(&url, "i").as_deref(), Some("digital-text"));
    }

    #[test]
    fn asin_lookup_searches_and_keeps_only_that_asin() {
        let mut c = criteria();
        c.query = None;
        c.product_id = Some("B0C1234567".into());
        let c = Criteria::Product(c);
        let url = AmazonAdapter.build_search_url(&c).unwrap();
        assert!(url.starts_with("https://www.amazon.com/s?"));
        assert_eq!(query_param(&url, "k").as_deref(), Some("B0C1234567"));

        let listings = AmazonAdapter.parse_listings(&url, RESULTS, &c).unwrap();
        assert_eq!(listings.len(), 1);
        assert_eq!(listings[0].id, "B0C1234567");
    }

    #[test]
    fn result_cards_are_parsed_by_asin() {
        let listings = AmazonAdapter
            .parse_listings("https://www.amazon.com/s?k=kindle", RESULTS, &Criteria::Product(criteria()))
            .unwrap();
        assert_eq!(listings.len(), 2);
        assert_eq!(listings[0].id, "B0C1234567");
        assert_eq!(listings[0].title, "Kindle Paperwhite");
        assert_eq!(listings[0].price, 149.99);
        assert_eq!(listings[0].source_url, "https://www.amazon.com/dp/B0C1234567");
        assert_eq!(listings[0].metadata["prime"], json!(true));
        assert_eq!(listings[0].metadata_str("rating"), Some("4.7 out of 5 stars"));

        assert_eq!(listings[1].price, 19.49);
        assert_eq!(listings[1].price_text, "$19.49");
        assert_eq!(listings[1].metadata["prime"], json!(false));
    }

    #[test]
    fn prime_only_keeps_prime_badged_results() {
        let mut c = criteria();
        c.prime_only = true;
        let listings = AmazonAdapter
            .parse_listings("https://www.amazon.com/s?k=kindle", RESULTS, &Criteria::Product(c))
            .unwrap();
        assert_eq!(listings.len(), 1);
        assert_eq!(listings[0].id, "B0C1234567");
    }

    #[test]
    fn product_links_canonicalize_to_dp() {
        assert_eq!(
            canonical("https://www.amazon.com/gp/product/B000000001?th=1"),
            Some(("B000000001".to_string(), "https://www.amazon.com/dp/B000000001".to_string()))
        );
        assert!(canonical("https://www.amazon.com/s?k=x").is_none());
    }
}
