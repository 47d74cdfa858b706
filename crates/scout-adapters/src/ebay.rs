//! eBay US search results. Both the long-lived `s-item` markup and the newer `s-card`
//! markup are understood.

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use reqwest::Url;
use scout_core::{Condition, Criteria, Listing, SourceId};
use scraper::Html;
use serde_json::json;

use crate::extract::{absolute_url, cards, parse_price, select_first_text, SelectorSet};
use crate::{
    first_non_empty, json_ld_listings, product_criteria, require_terms, retain_product_matches,
    AdapterError, SourceAdapter,
};

const SEARCH_BASE: &str = "https://www.ebay.com/sch/i.html";
const ITEM_BASE: &str = "https://www.ebay.com/itm";

static ITEM_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/itm/(?:[^/?#]+/)?(\d{9,15})").expect("static regex is valid"));

/// Titles of placeholder cards eBay injects ahead of real results.
const PLACEHOLDER_TITLES: &[&str] = &["shop on ebay", "results matching fewer words"];

const CARD_SETS: &[SelectorSet] = &[
    SelectorSet {
        item: "li.s-item",
        title: ".s-item__title",
        price: ".s-item__price",
        link: "a.s-item__link",
        image: ".s-item__image img, img",
    },
    SelectorSet {
        item: "li.s-card, div.s-card",
        title: ".s-card__title",
        price: ".s-card__price",
        link: "a.su-link, a[href*='/itm/']",
        image: "img.s-card__image, img",
    },
];

#[derive(Debug, Clone, Copy, Default)]
pub struct EbayAdapter;

#[async_trait]
impl SourceAdapter for EbayAdapter {
    fn source_id(&self) -> SourceId {
        SourceId::Ebay
    }

    fn build_search_url(&self, criteria: &Criteria) -> Result<String, AdapterError> {
        let criteria = product_criteria(SourceId::Ebay, criteria)?;
        let terms = require_terms(SourceId::Ebay, criteria)?;
        let mut params = vec![("_nkw", terms), ("_sop", "10".to_string())];
        if let Some(min) = criteria.min_price {
            params.push(("_udlo", format!("{}", min.max(0.0).floor() as i64)));
        }
        if let Some(max) = criteria.max_price {
            params.push(("_udhi", format!("{}", max.ceil() as i64)));
        }
        if let Some(code) = condition_code(criteria.condition) {
            params.push(("LH_ItemCondition", code.to_string()));
        }
        if let Some(category) = criteria.category.as_deref().filter(|c| !c.trim().is_empty()) {
            params.push(("_sacat", category.trim().to_string()));
        }
        Url::parse_with_params(SEARCH_BASE, &params)
            .map(|url| url.to_string())
            .map_err(|err| AdapterError::parse(SourceId::Ebay, format!("search url: {err}")))
    }

    fn parse_listings(
        &self,
        page_url: &str,
        body: &str,
        criteria: &Criteria,
    ) -> Result<Vec<Listing>, AdapterError> {
        let criteria = product_criteria(SourceId::Ebay, criteria)?;
        let mut listings = parse_search_page(page_url, body);
        retain_product_matches(&mut listings, criteria);
        Ok(listings)
    }
}

fn condition_code(condition: Condition) -> Option<&'static str> {
    match condition {
        Condition::Any => None,
        Condition::New => Some("1000"),
        Condition::Used => Some("3000"),
    }
}

fn item_url(id: &str) -> String {
    format!("{ITEM_BASE}/{id}")
}

fn canonical(url: &str) -> Option<(String, String)> {
    let id = ITEM_ID_RE.captures(url)?.get(1)?.as_str().to_string();
    let url = item_url(&id);
    Some((id, url))
}

pub fn parse_search_page(page_url: &str, body: &str) -> Vec<Listing> {
    let document = Html::parse_document(body);
    first_non_empty(
        SourceId::Ebay,
        &[
            ("json_ld", &|| json_ld_listings(SourceId::Ebay, &document, page_url, &canonical)),
            ("dom", &|| dom_listings(&document, page_url)),
        ],
    )
}

fn clean_title(raw: &str) -> Option<String> {
    let title = raw
        .trim()
        .trim_start_matches("New Listing")
        .trim_end_matches("Opens in a new window or tab")
        .trim();
    let lowered = title.to_lowercase();
    if title.is_empty() || PLACEHOLDER_TITLES.iter().any(|p| lowered == *p) {
        return None;
    }
    Some(title.to_string())
}

fn dom_listings(document: &Html, page_url: &str) -> Vec<Listing> {
    CARD_SETS
        .iter()
        .map(|set| {
            cards(document, set)
                .into_iter()
                .filter_map(|card| {
                    let title = clean_title(card.title.as_deref()?)?;
                    let href = absolute_url(page_url, card.href.as_deref()?)?;
                    let (id, url) = canonical(&href)?;
                    let price_text = card.price_text.clone().unwrap_or_default();
                    let price = parse_price(&price_text).unwrap_or(0.0);
                    let mut listing = Listing::new(SourceId::Ebay, id, title, price, url);
                    listing.price_text = price_text;
                    listing.image_url = card.image.and_then(|src| absolute_url(page_url, &src));
                    if let Some(condition) =
                        select_first_text(card.element, ".SECONDARY_INFO, .s-card__subtitle")
                    {
                        listing.metadata.insert("condition".into(), json!(condition));
                    }
                    if let Some(shipping) =
                        select_first_text(card.element, ".s-item__shipping, .s-item__logisticsCost")
                    {
                        listing.metadata.insert("shipping".into(), json!(shipping));
                    }
                    listing.metadata.insert("strategy".into(), json!("dom"));
                    Some(listing)
                })
                .collect::<Vec<_>>()
        })
        .find(|found| !found.is_empty())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::query_param;
    use scout_core::ProductCriteria;

    fn criteria() -> ProductCriteria {
        ProductCriteria::new(SourceId::Ebay, "thinkpad x1")
    }

    #[test]
    fn condition_maps_to_item_condition_codes() {
        let mut c = criteria();
        c.condition = Condition::Used;
        c.max_price = Some(450.0);
        let url = EbayAdapter.build_search_url(&Criteria::Product(c.clone())).unwrap();
        assert_eq!(query_param(&url, "_nkw").as_deref(), Some("thinkpad x1"));
        assert_eq!(query_param(&url, "LH_ItemCondition").as_deref(), Some("3000"));
        assert_eq!(query_param(&url, "_udhi").as_deref(), Some("450"));

        c.condition = Condition::New;
        let url = EbayAdapter.build_search_url(&Criteria::Product(c.clone())).unwrap();
        assert_eq!(query_param(&url, "LH_ItemCondition").as_deref(), Some("1000"));

        c.condition = Condition::Any;
        let url = EbayAdapter.build_search_url(&Criteria::Product(c)).unwrap();
        assert!(query_param(&url, "LH_ItemCondition").is_none());
    }

    #[test]
    fn s_item_markup_skips_placeholders() {
        let html = r#"<ul class="srp-results">
          <li class="s-item"><a class="s-item__link" href="https://ebay.com/itm/123456"><div class="s-item__title">Shop on eBay</div></a>
            <span class="s-item__price">$20.00</span></li>
          <li class="s-item"><a class="s-item__link" href="https://www.ebay.com/itm/Lenovo-ThinkPad-X1/256789012345?hash=item3b">
            <div class="s-item__title"><span>New Listing</span>Lenovo ThinkPad X1 Carbon Gen 9</div></a>
            <span class="s-item__price">$389.99 to $420.00</span>
            <span class="SECONDARY_INFO">Pre-Owned</span>
            <div class="s-item__image"><img src="https://i.ebayimg.com/thumbs/1.jpg"></div></li>
        </ul>"#;
        let listings = EbayAdapter
            .parse_listings(SEARCH_BASE, html, &Criteria::Product(criteria()))
            .unwrap();
        assert_eq!(listings.len(), 1);
        let item = &listings[0];
        assert_eq!(item.id, "256789012345");
        assert_eq!(item.title, "Lenovo ThinkPad X1 Carbon Gen 9");
        assert_eq!(item.price, 389.99);
        assert_eq!(item.source_url, "https://www.ebay.com/itm/256789012345");
        assert_eq!(item.metadata_str("condition"), Some("Pre-Owned"));
    }

    #[test]
    fn s_card_markup_is_the_fallback() {
        let html = r#"<ul><li class="s-card">
            <a class="su-link" href="https://www.ebay.com/itm/334455667788"><span class="s-card__title">ThinkPad X1 Yoga</span></a>
            <span class="s-card__price">$512.00</span><img class="s-card__image" src="https://i.ebayimg.com/2.jpg">
        </li></ul>"#;
        let listings = EbayAdapter
            .parse_listings(SEARCH_BASE, html, &Criteria::Product(criteria()))
            .unwrap();
        assert_eq!(listings.len(), 1);
        assert_eq!(listings[0].source_url, "https://www.ebay.com/itm/334455667788");
        assert_eq!(listings[0].image_url.as_deref(), Some("https://i.ebayimg.com/2.jpg"));
    }
}
