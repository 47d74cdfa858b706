//! momo shopping. Search pages are tried as embedded Next.js state, then JSON-LD, then
//! two generations of result-card markup.

use async_trait::async_trait;
use reqwest::Url;
use scout_core::{Criteria, Listing, SourceId};
use scraper::Html;
use serde_json::{json, Value as JsonValue};

use crate::extract::{
    absolute_url, assigned_json, cards, find_record_array, json_first_number, json_first_string,
    json_image, parse_price, query_param, script_json, SelectorSet,
};
use crate::{
    first_non_empty, json_ld_listings, price_label, product_criteria, require_terms,
    retain_product_matches, AdapterError, SourceAdapter,
};

const SEARCH_BASE: &str = "https://www.momoshop.com.tw/search/searchShop.jsp";
const GOODS_BASE: &str = "https://www.momoshop.com.tw/goods/GoodsDetail.jsp";

const CODE_KEYS: &[&str] = &["goodsCode", "GOODS_CODE", "i_code", "goodsId"];
const NAME_KEYS: &[&str] = &["goodsName", "GOODS_NAME", "goodsNameShort"];

const CARD_SETS: &[SelectorSet] = &[
    SelectorSet {
        item: "li.listAreaLi",
        title: ".prdName",
        price: ".price b, .price",
        link: "a.goodsUrl, a[href*='i_code']",
        image: "img.prdImg, img",
    },
    SelectorSet {
        item: "li.goodsItemLi, li.eachGood",
        title: ".prdName, h3",
        price: ".money b, .price b, .money",
        link: "a[href*='i_code']",
        image: "img",
    },
];

#[derive(Debug, Clone, Copy, Default)]
pub struct MomoAdapter;

#[async_trait]
impl SourceAdapter for MomoAdapter {
    fn source_id(&self) -> SourceId {
        SourceId::Momo
    }

    fn build_search_url(&self, criteria: &Criteria) -> Result<String, AdapterError> {
        let criteria = product_criteria(SourceId::Momo, criteria)?;
        let terms = require_terms(SourceId::Momo, criteria)?;
        let mut params = vec![
            ("keyword", terms),
            ("searchType", "1".to_string()),
            ("curPage", "1".to_string()),
            ("_isFuzzy", "0".to_string()),
        ];
        if let Some(category) = criteria.category.as_deref().filter(|c| !c.trim().is_empty()) {
            params.push(("cateCode", category.trim().to_string()));
        }
        Url::parse_with_params(SEARCH_BASE, &params)
            .map(|url| url.to_string())
            .map_err(|err| AdapterError::parse(SourceId::Momo, format!("search url: {err}")))
    }

    fn parse_listings(
        &self,
        page_url: &str,
        body: &str,
        criteria: &Criteria,
    ) -> Result<Vec<Listing>, AdapterError> {
        let criteria = product_criteria(SourceId::Momo, criteria)?;
        let mut listings = parse_search_page(page_url, body);
        retain_product_matches(&mut listings, criteria);
        Ok(listings)
    }
}

fn goods_url(code: &str) -> String {
    format!("{GOODS_BASE}?i_code={code}")
}

fn canonical(url: &str) -> Option<(String, String)> {
    let code = query_param(url, "i_code")?;
    Some((code.clone(), goods_url(&code)))
}

pub fn parse_search_page(page_url: &str, body: &str) -> Vec<Listing> {
    let document = Html::parse_document(body);
    first_non_empty(
        SourceId::Momo,
        &[
            ("embedded_state", &|| embedded_listings(&document, body)),
            ("json_ld", &|| json_ld_listings(SourceId::Momo, &document, page_url, &canonical)),
            ("dom", &|| dom_listings(&document, page_url)),
        ],
    )
}

fn is_goods_record(value: &JsonValue) -> bool {
    CODE_KEYS.iter().any(|k| value.get(*k).is_some()) && NAME_KEYS.iter().any(|k| value.get(*k).is_some())
}

fn embedded_listings(document: &Html, body: &str) -> Vec<Listing> {
    let Some(state) = script_json(document, "script#__NEXT_DATA__")
        .or_else(|| assigned_json(body, "window.__INITIAL_STATE__"))
    else {
        return Vec::new();
    };
    let Some(records) = find_record_array(&state, &is_goods_record) else {
        return Vec::new();
    };
    records.iter().filter_map(record_listing).collect()
}

fn record_listing(record: &JsonValue) -> Option<Listing> {
    let code = json_first_string(record, CODE_KEYS)?;
    let title = json_first_string(record, NAME_KEYS)?;
    let price = json_first_number(record, &["goodsPrice", "SALE_PRICE", "salePrice", "price"]).unwrap_or(0.0);

    let mut listing = Listing::new(SourceId::Momo, code.clone(), title, price, goods_url(&code));
    listing.price_text = price_label(Some("TWD"), price);
    listing.image_url = ["imgUrl", "img_url", "imgPath", "goodsImg"]
        .iter()
        .find_map(|key| record.get(*key).and_then(json_image));
    if let Some(brand) = json_first_string(record, &["brandName", "brand"]) {
        listing.metadata.insert("brand".into(), json!(brand));
    }
    if let Some(sold_out) = ["isSoldOut", "soldOut"]
        .iter()
        .find_map(|key| record.get(*key).and_then(JsonValue::as_bool))
    {
        listing.metadata.insert("in_stock".into(), json!(!sold_out));
    }
    listing.metadata.insert("strategy".into(), json!("embedded_state"));
    Some(listing)
}

fn dom_listings(document: &Html, page_url: &str) -> Vec<Listing> {
    CARD_SETS
        .iter()
        .map(|set| {
            cards(document, set)
                .into_iter()
                .filter_map(|card| {
                    let href = card.href.as_deref().and_then(|h| absolute_url(page_url, h));
                    let code = href
                        .as_deref()
                        .and_then(|h| query_param(h, "i_code"))
                        .or_else(|| card.element.value().attr("gcode").map(ToString::to_string))?;
                    let price = card.price_text.as_deref().and_then(parse_price).unwrap_or(0.0);
                    let mut listing =
                        Listing::new(SourceId::Momo, code.clone(), card.title?, price, goods_url(&code));
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

#[cfg(test)]
mod tests {
    use super::*;
    use scout_core::ProductCriteria;

    fn criteria(query: &str) -> Criteria {
        Criteria::Product(ProductCriteria::new(SourceId::Momo, query))
    }

    #[test]
    fn search_url_carries_keyword_and_category() {
        let mut c = ProductCriteria::new(SourceId::Momo, "氣炸鍋");
        c.brands = vec!["Philips".into()];
        c.category = Some("1900000000".into());
        let url = MomoAdapter.build_search_url(&Criteria::Product(c)).unwrap();
        assert!(url.starts_with(SEARCH_BASE));
        assert_eq!(query_param(&url, "keyword").as_deref(), Some("氣炸鍋 Philips"));
        assert_eq!(query_param(&url, "cateCode").as_deref(), Some("1900000000"));
    }

    #[test]
    fn product_code_without_query_is_searched_for() {
        let mut c = ProductCriteria::new(SourceId::Momo, "");
        c.query = None;
        c.product_id = Some("12345678".into());
        let url = MomoAdapter.build_search_url(&Criteria::Product(c)).unwrap();
        assert!(url.starts_with(SEARCH_BASE));
        assert_eq!(query_param(&url, "keyword").as_deref(), Some("12345678"));
    }

    #[test]
    fn empty_criteria_are_rejected() {
        let mut c = ProductCriteria::new(SourceId::Momo, " ");
        c.query = Some(" ".into());
        let err = MomoAdapter.build_search_url(&Criteria::Product(c)).unwrap_err();
        assert!(matches!(err, AdapterError::InvalidCriteria { .. }));
    }

    #[test]
    fn embedded_state_wins_over_markup() {
        let html = r#"<html><head><script id="__NEXT_DATA__" type="application/json">
            {"props":{"pageProps":{"goodsInfoList":[
              {"goodsCode":"1001","goodsName":"氣炸鍋 5L","goodsPrice":"$2,990","imgUrl":"https://img.momoshop.com.tw/1001.jpg","isSoldOut":false},
              {"goodsCode":"1002","goodsName":"氣炸鍋 3L","goodsPrice":1990,"isSoldOut":true}
            ]}}}</script></head>
            <body><ul><li class="listAreaLi"><a class="goodsUrl" href="/goods/GoodsDetail.jsp?i_code=9999">
              <h3 class="prdName">markup only</h3></a><span class="price"><b>100</b></span></li></ul></body></html>"#;
        let listings = MomoAdapter
            .parse_listings(SEARCH_BASE, html, &criteria("氣炸鍋"))
            .unwrap();
        assert_eq!(listings.len(), 2);
        assert_eq!(listings[0].id, "1001");
        assert_eq!(listings[0].price, 2990.0);
        assert_eq!(listings[0].source_url, goods_url("1001"));
        assert_eq!(listings[1].metadata["in_stock"], json!(false));
    }

    #[test]
    fn in_stock_only_drops_sold_out_goods() {
        let html = r#"<script id="__NEXT_DATA__" type="application/json">{"list":[
              {"goodsCode":"1","goodsName":"A","goodsPrice":10,"isSoldOut":true},
              {"goodsCode":"2","goodsName":"B","goodsPrice":20,"isSoldOut":false}]}</script>"#;
        let mut c = ProductCriteria::new(SourceId::Momo, "x");
        c.in_stock_only = true;
        let listings = MomoAdapter
            .parse_listings(SEARCH_BASE, html, &Criteria::Product(c))
            .unwrap();
        let ids: Vec<_> = listings.iter().map(|l| l.id.as_str()).collect();
        assert_eq!(ids, vec!["2"]);
    }

    #[test]
    fn legacy_cards_are_the_last_resort() {
        let html = r#"<ul>
            <li class="goodsItemLi"><a href="/goods/GoodsDetail.jsp?i_code=555&str_category_code=1">
              <h3 class="prdName">電熱水壺</h3><span class="money"><b>1,290</b></span>
              <img src="//img1.momoshop.com.tw/555.jpg"></a></li>
            <li class="goodsItemLi"><h3 class="prdName">no link</h3></li>
        </ul>"#;
        let listings = MomoAdapter
            .parse_listings(SEARCH_BASE, html, &criteria("水壺"))
            .unwrap();
        assert_eq!(listings.len(), 1);
        assert_eq!(listings[0].id, "555");
        assert_eq!(listings[0].price, 1290.0);
        assert_eq!(listings[0].source_url, goods_url("555"));
        assert_eq!(listings[0].image_url.as_deref(), Some("https://img1.momoshop.com.tw/555.jpg"));
    }
}
