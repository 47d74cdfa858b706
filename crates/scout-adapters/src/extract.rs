//! Extraction helpers shared by the marketplace adapters: DOM text, prices,
//! embedded JSON state and JSON-LD.

use reqwest::Url;
use scraper::{ElementRef, Html, Selector};
use serde_json::Value as JsonValue;

/// Embedded state blobs larger than this are ignored.
pub const MAX_BLOB_BYTES: usize = 8 * 1024 * 1024;

pub fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.split_whitespace().collect::<Vec<_>>().join(" ");
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

/// Parses a selector list. Invalid selectors (including user-supplied hints) yield `None`.
pub fn selector(css: &str) -> Option<Selector> {
    Selector::parse(css).ok()
}

pub fn element_text(element: ElementRef<'_>) -> Option<String> {
    text_or_none(element.text().collect::<String>())
}

pub fn select_first_text(scope: ElementRef<'_>, css: &str) -> Option<String> {
    let sel = selector(css)?;
    scope.select(&sel).find_map(element_text)
}

pub fn select_first_attr(scope: ElementRef<'_>, css: &str, attr: &str) -> Option<String> {
    let sel = selector(css)?;
    scope
        .select(&sel)
        .find_map(|n| n.value().attr(attr))
        .and_then(|s| text_or_none(s.to_string()))
}

/// Image source, preferring lazy-load attributes over placeholder `src` values.
pub fn select_image(scope: ElementRef<'_>, css: &str) -> Option<String> {
    let sel = selector(css)?;
    scope.select(&sel).find_map(|img| {
        ["data-src", "data-original", "data-lazy", "src"]
            .into_iter()
            .filter_map(|attr| img.value().attr(attr))
            .map(str::trim)
            .find(|src| !src.is_empty() && !src.starts_with("data:"))
            .map(ToString::to_string)
    })
}

/// All numbers in `text`, treating `,` between digits as a thousands separator.
pub fn extract_numbers(text: &str) -> Vec<f64> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut seen_dot = false;
    let chars: Vec<char> = text.chars().collect();
    for (i, &ch) in chars.iter().enumerate() {
        if ch.is_ascii_digit() {
            current.push(ch);
            continue;
        }
        let next_is_digit = chars.get(i + 1).is_some_and(char::is_ascii_digit);
        if ch == ',' && !current.is_empty() && !seen_dot && next_is_digit {
            continue;
        }
        if ch == '.' && !seen_dot && !current.is_empty() && next_is_digit {
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

/// First number in a price string such as `NT$1,290`, `$12.99 to $20.00` or `12,000元/月`.
pub fn parse_price(text: &str) -> Option<f64> {
    extract_numbers(text).into_iter().next()
}

pub fn absolute_url(base: &str, href: &str) -> Option<String> {
    let href = href.trim();
    if href.is_empty() || href.starts_with("javascript:") || href.starts_with('#') {
        return None;
    }
    let base = Url::parse(base).ok()?;
    base.join(href).ok().map(|u| u.to_string())
}

pub fn query_param(url: &str, key: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    parsed
        .query_pairs()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.into_owned())
        .filter(|v| !v.is_empty())
}

pub fn json_str<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a str> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    cur.as_str()
}

/// A number that may arrive as JSON number or as formatted text.
pub fn json_number(value: &JsonValue) -> Option<f64> {
    match value {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => parse_price(s),
        _ => None,
    }
}

/// First key present among `keys`, as a trimmed string (numbers are stringified).
pub fn json_first_string(value: &JsonValue, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| match value.get(*key)? {
        JsonValue::String(s) => text_or_none(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

pub fn json_first_number(value: &JsonValue, keys: &[&str]) -> Option<f64> {
    keys.iter().find_map(|key| value.get(*key).and_then(json_number))
}

/// Image field that may be a string, an array of strings, or an object with `url`.
pub fn json_image(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => text_or_none(s.clone()),
        JsonValue::Array(items) => items.iter().find_map(json_image),
        JsonValue::Object(_) => value
            .get("url")
            .or_else(|| value.get("src"))
            .and_then(json_image),
        _ => None,
    }
}

/// Depth-first search for the largest array whose elements are objects accepted by `accept`.
pub fn find_record_array<'a, F>(value: &'a JsonValue, accept: &F) -> Option<&'a Vec<JsonValue>>
where
    F: Fn(&JsonValue) -> bool,
{
    let mut best: Option<&'a Vec<JsonValue>> = None;
    let mut stack = vec![value];
    while let Some(node) = stack.pop() {
        match node {
            JsonValue::Array(items) => {
                let hits = items.iter().filter(|item| item.is_object() && accept(item)).count();
                if hits > 0 && hits * 2 >= items.len() && best.map_or(true, |b| hits > b.len()) {
                    best = Some(items);
                }
                stack.extend(items.iter());
            }
            JsonValue::Object(map) => stack.extend(map.values()),
            _ => {}
        }
    }
    best
}

/// First string value stored under any of `keys`, anywhere in the tree.
pub fn find_key_string(value: &JsonValue, keys: &[&str]) -> Option<String> {
    let mut stack = vec![value];
    while let Some(node) = stack.pop() {
        match node {
            JsonValue::Object(map) => {
                for key in keys {
                    if let Some(JsonValue::String(s)) = map.get(*key) {
                        if let Some(text) = text_or_none(s.clone()) {
                            return Some(text);
                        }
                    }
                }
                stack.extend(map.values());
            }
            JsonValue::Array(items) => stack.extend(items.iter()),
            _ => {}
        }
    }
    None
}

pub fn find_key_number(value: &JsonValue, keys: &[&str]) -> Option<f64> {
    let mut stack = vec![value];
    while let Some(node) = stack.pop() {
        match node {
            JsonValue::Object(map) => {
                if let Some(n) = keys.iter().find_map(|key| map.get(*key).and_then(json_number)) {
                    return Some(n);
                }
                stack.extend(map.values());
            }
            JsonValue::Array(items) => stack.extend(items.iter()),
            _ => {}
        }
    }
    None
}

/// Slices the balanced JSON object or array starting at the first `{`/`[` at or after
/// `start`. String literals and escapes are honoured; returns `None` if unbalanced.
pub fn balanced_json_slice(text: &str, start: usize) -> Option<&str> {
    let rest = text.get(start..)?;
    let open_offset = rest.find(|c: char| !c.is_whitespace())?;
    let bytes = rest.as_bytes();
    let opener = bytes[open_offset];
    if opener != b'{' && opener != b'[' {
        return None;
    }

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, &b) in bytes.iter().enumerate().skip(open_offset) {
        if i - open_offset > MAX_BLOB_BYTES {
            return None;
        }
        if in_string {
            match b {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' | b'[' => depth += 1,
            b'}' | b']' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return rest.get(open_offset..=i);
                }
            }
            _ => {}
        }
    }
    None
}

/// JSON assigned to a global in an inline script, e.g. `window.__INITIAL_STATE__ = {...};`.
pub fn assigned_json(html: &str, marker: &str) -> Option<JsonValue> {
    let at = html.find(marker)?;
    let after_marker = at + marker.len();
    let eq = html.get(after_marker..)?.find('=')? + after_marker + 1;
    let slice = balanced_json_slice(html, eq)?;
    serde_json::from_str(slice).ok()
}

/// JSON carried in a `<script>` element's text, e.g. `script#__NEXT_DATA__`.
pub fn script_json(document: &Html, css: &str) -> Option<JsonValue> {
    let sel = selector(css)?;
    document.select(&sel).find_map(|script| {
        let text = script.text().collect::<String>();
        if text.len() > MAX_BLOB_BYTES {
            return None;
        }
        serde_json::from_str(text.trim()).ok()
    })
}

/// Product-like objects from all JSON-LD blocks, flattening `@graph` and `ItemList`.
pub fn json_ld_products(document: &Html) -> Vec<JsonValue> {
    let Some(sel) = selector(r#"script[type="application/ld+json"]"#) else {
        return Vec::new();
    };
    let mut out = Vec::new();
    for script in document.select(&sel) {
        let text = script.text().collect::<String>();
        let Ok(value) = serde_json::from_str::<JsonValue>(text.trim()) else {
            continue;
        };
        collect_ld_products(value, &mut out);
    }
    out
}

fn collect_ld_products(value: JsonValue, out: &mut Vec<JsonValue>) {
    match value {
        JsonValue::Array(items) => {
            for item in items {
                collect_ld_products(item, out);
            }
        }
        JsonValue::Object(mut map) => {
            if let Some(graph) = map.remove("@graph") {
                collect_ld_products(graph, out);
            }
            if let Some(elements) = map.remove("itemListElement") {
                collect_ld_products(elements, out);
            }
            if let Some(item) = map.remove("item") {
                collect_ld_products(item, out);
            }
            let object = JsonValue::Object(map);
            if ld_type_is(&object, "Product") {
                out.push(object);
            }
        }
        _ => {}
    }
}

fn ld_type_is(value: &JsonValue, wanted: &str) -> bool {
    match value.get("@type") {
        Some(JsonValue::String(t)) => t == wanted,
        Some(JsonValue::Array(types)) => types.iter().any(|t| t.as_str() == Some(wanted)),
        _ => false,
    }
}

/// Fields a JSON-LD `Product` offers, flattened.
#[derive(Debug, Clone, PartialEq)]
pub struct LdProduct {
    pub name: String,
    pub price: Option<f64>,
    pub currency: Option<String>,
    pub url: Option<String>,
    pub image: Option<String>,
    pub sku: Option<String>,
    pub in_stock: Option<bool>,
    pub brand: Option<String>,
}

pub fn ld_product(value: &JsonValue) -> Option<LdProduct> {
    let name = json_first_string(value, &["name"])?;
    let offers = match value.get("offers") {
        Some(JsonValue::Array(list)) => list.first(),
        other => other,
    };
    let price = offers.and_then(|o| {
        json_first_number(o, &["price", "lowPrice"])
            .or_else(|| o.get("priceSpecification").and_then(|p| json_first_number(p, &["price"])))
    });
    let currency = offers.and_then(|o| json_first_string(o, &["priceCurrency"]));
    let in_stock = offers
        .and_then(|o| json_first_string(o, &["availability"]))
        .map(|a| a.contains("InStock") || a.contains("LimitedAvailability"));
    let url = json_first_string(value, &["url", "@id"])
        .or_else(|| offers.and_then(|o| json_first_string(o, &["url"])));
    let brand = match value.get("brand") {
        Some(JsonValue::String(s)) => text_or_none(s.clone()),
        Some(b @ JsonValue::Object(_)) => json_first_string(b, &["name"]),
        _ => None,
    };
    Some(LdProduct {
        name,
        price,
        currency,
        url,
        image: value.get("image").and_then(json_image),
        sku: json_first_string(value, &["sku", "productID", "mpn"]),
        in_stock,
        brand,
    })
}

/// One family of result-card selectors. Sites ship several markup variants, so adapters
/// keep an ordered list of these.
#[derive(Debug, Clone, Copy)]
pub struct SelectorSet {
    pub item: &'static str,
    pub title: &'static str,
    pub price: &'static str,
    pub link: &'static str,
    pub image: &'static str,
}

#[derive(Debug, Clone)]
pub struct Card<'a> {
    pub element: ElementRef<'a>,
    pub title: Option<String>,
    pub price_text: Option<String>,
    pub href: Option<String>,
    pub image: Option<String>,
}

pub fn cards<'a>(document: &'a Html, set: &SelectorSet) -> Vec<Card<'a>> {
    let Some(item) = selector(set.item) else {
        return Vec::new();
    };
    document
        .select(&item)
        .map(|element| Card {
            element,
            title: select_first_text(element, set.title),
            price_text: select_first_text(element, set.price),
            href: select_first_attr(element, set.link, "href")
                .or_else(|| element.value().attr("href").map(ToString::to_string)),
            image: select_image(element, set.image),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn prices_parse_with_currency_noise() {
        assert_eq!(parse_price("NT$1,290"), Some(1290.0));
        assert_eq!(parse_price("$12.99 to $20.00"), Some(12.99));
        assert_eq!(parse_price("12,000元/月"), Some(12000.0));
        assert_eq!(parse_price("US $1,024.50"), Some(1024.5));
        assert_eq!(parse_price("價格洽詢"), None);
        assert_eq!(extract_numbers("2房1廳1衛"), vec![2.0, 1.0, 1.0]);
    }

    #[test]
    fn balanced_slice_ignores_braces_inside_strings() {
        let html = r#"<script>window.__INITIAL_STATE__ = {"a":"}{","b":[1,{"c":"\"}"}]};</script>"#;
        let value = assigned_json(html, "window.__INITIAL_STATE__").unwrap();
        assert_eq!(value["a"], "}{");
        assert_eq!(value["b"][1]["c"], "\"}");
    }

    #[test]
    fn unbalanced_or_non_json_blob_is_none() {
        assert!(assigned_json("window.__NUXT__ = {\"a\": 1", "window.__NUXT__").is_none());
        assert!(assigned_json("window.__NUXT__=(function(a){return {}}(1));", "window.__NUXT__").is_none());
        assert!(assigned_json("<html></html>", "window.__NUXT__").is_none());
    }

    #[test]
    fn record_array_prefers_largest_matching_list() {
        let value = json!({
            "banner": [{"title": "ad"}],
            "data": {"items": [
                {"title": "a", "price": 1},
                {"title": "b", "price": 2},
                {"title": "c", "price": 3}
            ]}
        });
        let items = find_record_array(&value, &|v| v.get("title").is_some()).unwrap();
        assert_eq!(items.len(), 3);
    }

    #[test]
    fn json_ld_products_are_flattened_from_item_lists() {
        let html = r#"<html><head>
            <script type="application/ld+json">{"@context":"https://schema.org","@type":"ItemList",
              "itemListElement":[{"@type":"ListItem","position":1,"item":{"@type":"Product","name":"Kettle",
              "url":"https://shop.example/p/1","image":["https://img/1.jpg"],
              "offers":{"@type":"Offer","price":"1,490","priceCurrency":"TWD","availability":"https://schema.org/InStock"}}}]}</script>
            <script type="application/ld+json">not json</script>
            </head></html>"#;
        let document = Html::parse_document(html);
        let products = json_ld_products(&document);
        assert_eq!(products.len(), 1);
        let product = ld_product(&products[0]).unwrap();
        assert_eq!(product.name, "Kettle");
        assert_eq!(product.price, Some(1490.0));
        assert_eq!(product.currency.as_deref(), Some("TWD"));
        assert_eq!(product.image.as_deref(), Some("https://img/1.jpg"));
        assert_eq!(product.in_stock, Some(true));
    }

    #[test]
    fn urls_are_resolved_against_base() {
        assert_eq!(
            absolute_url("https://www.ebay.com/sch/i.html?_nkw=x", "/itm/123").as_deref(),
            Some("https://www.ebay.com/itm/123")
        );
        assert!(absolute_url("https://a.example/", "javascript:void(0)").is_none());
        assert_eq!(
            query_param("https://www.momoshop.com.tw/goods/GoodsDetail.jsp?i_code=987&str=1", "i_code").as_deref(),
            Some("987")
        );
    }

    #[test]
    fn cards_collect_fields_per_item() {
        let document = Html::parse_document(
            r#"<ul>
                <li class="item"><a href="/p/1"><h3> Desk   Lamp </h3></a><span class="price">$19.99</span><img src="/i/1.jpg"></li>
                <li class="item"><h3>No link</h3></li>
            </ul>"#,
        );
        let set = SelectorSet {
            item: "li.item",
            title: "h3",
            price: ".price",
            link: "a[href]",
            image: "img",
        };
        let found = cards(&document, &set);
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].title.as_deref(), Some("Desk Lamp"));
        assert_eq!(found[0].price_text.as_deref(), Some("$19.99"));
        assert_eq!(found[0].href.as_deref(), Some("/p/1"));
        assert_eq!(found[0].image.as_deref(), Some("/i/1.jpg"));
        assert!(found[1].href.is_none());
    }

    #[test]
    fn lazy_images_win_over_placeholders() {
        let html = Html::parse_fragment(
            r#"<div><img src="data:image/gif;base64,AAAA" data-src="https://img.example/real.jpg"></div>"#,
        );
        assert_eq!(
            select_image(html.root_element(), "img").as_deref(),
            Some("https://img.example/real.jpg")
        );
    }
}
