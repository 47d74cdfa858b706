//! Core domain model for listing scout: alerts, criteria, listings and matches.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};
use thiserror::Error;
use uuid::Uuid;

pub mod due;

pub use due::{is_due, is_due_at};

pub const CRATE_NAME: &str = "scout-core";

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown {what}: {value}")]
pub struct ParseKeyError {
    pub what: &'static str,
    pub value: String,
}

/// Marketplace an alert can watch. The serde key is the identifier stored on alerts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SourceId {
    #[serde(rename = "591")]
    Rent591,
    #[serde(rename = "momo")]
    Momo,
    #[serde(rename = "pchome")]
    Pchome,
    #[serde(rename = "amazon")]
    Amazon,
    #[serde(rename = "ebay")]
    Ebay,
    #[serde(rename = "generic")]
    Generic,
}

impl SourceId {
    pub const ALL: [SourceId; 6] = [
        SourceId::Rent591,
        SourceId::Momo,
        SourceId::Pchome,
        SourceId::Amazon,
        SourceId::Ebay,
        SourceId::Generic,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            SourceId::Rent591 => "591",
            SourceId::Momo => "momo",
            SourceId::Pchome => "pchome",
            SourceId::Amazon => "amazon",
            SourceId::Ebay => "ebay",
            SourceId::Generic => "generic",
        }
    }

    pub fn kind(self) -> AlertKind {
        match self {
            SourceId::Rent591 => AlertKind::Property,
            _ => AlertKind::Product,
        }
    }

    /// Currency a match falls back to when neither the listing nor the criteria name one.
    pub fn default_currency(self) -> &'static str {
        match self {
            SourceId::Amazon | SourceId::Ebay => "USD",
            _ => "TWD",
        }
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceId {
    type Err = ParseKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key = s.trim().to_ascii_lowercase();
        SourceId::ALL
            .into_iter()
            .find(|source| source.as_str() == key)
            .ok_or(ParseKeyError {
                what: "source",
                value: s.to_string(),
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    Property,
    Product,
}

impl AlertKind {
    pub fn as_str(self) -> &'static str {
        match self {
            AlertKind::Property => "property",
            AlertKind::Product => "product",
        }
    }
}

impl FromStr for AlertKind {
    type Err = ParseKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "property" => Ok(AlertKind::Property),
            "product" => Ok(AlertKind::Product),
            other => Err(ParseKeyError {
                what: "alert kind",
                value: other.to_string(),
            }),
        }
    }
}

/// How often an alert is re-checked.
///
/// Parsing is lenient: anything outside the known set becomes [`CheckFrequency::Hourly`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum CheckFrequency {
    FiveMinutes,
    FifteenMinutes,
    ThirtyMinutes,
    #[default]
    Hourly,
    Daily,
}

impl CheckFrequency {
    pub const ALL: [CheckFrequency; 5] = [
        CheckFrequency::FiveMinutes,
        CheckFrequency::FifteenMinutes,
        CheckFrequency::ThirtyMinutes,
        CheckFrequency::Hourly,
        CheckFrequency::Daily,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            CheckFrequency::FiveMinutes => "5min",
            CheckFrequency::FifteenMinutes => "15min",
            CheckFrequency::ThirtyMinutes => "30min",
            CheckFrequency::Hourly => "1hour",
            CheckFrequency::Daily => "daily",
        }
    }

    pub fn parse_lenient(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "5min" | "5m" => CheckFrequency::FiveMinutes,
            "15min" | "15m" => CheckFrequency::FifteenMinutes,
            "30min" | "30m" => CheckFrequency::ThirtyMinutes,
            "1hour" | "hourly" | "1h" | "60min" => CheckFrequency::Hourly,
            "daily" | "1day" | "24h" => CheckFrequency::Daily,
            _ => CheckFrequency::Hourly,
        }
    }

    pub fn interval(self) -> chrono::Duration {
        match self {
            CheckFrequency::FiveMinutes => chrono::Duration::minutes(5),
            CheckFrequency::FifteenMinutes => chrono::Duration::minutes(15),
            CheckFrequency::ThirtyMinutes => chrono::Duration::minutes(30),
            CheckFrequency::Hourly => chrono::Duration::hours(1),
            CheckFrequency::Daily => chrono::Duration::hours(24),
        }
    }
}

impl From<String> for CheckFrequency {
    fn from(value: String) -> Self {
        Self::parse_lenient(&value)
    }
}

impl From<CheckFrequency> for String {
    fn from(value: CheckFrequency) -> Self {
        value.as_str().to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    #[default]
    Any,
    New,
    Used,
}

/// Search parameters for the rental site.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PropertyCriteria {
    pub city: String,
    pub districts: Vec<String>,
    pub min_price: Option<f64>,
    pub max_price: Option<f64>,
    /// Floor area in ping.
    pub min_area: Option<f64>,
    pub max_area: Option<f64>,
    /// Minimum number of rooms.
    pub rooms: Option<u32>,
    pub keywords: Vec<String>,
}

/// Search parameters for a product marketplace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductCriteria {
    pub platform: SourceId,
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default)]
    pub product_id: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub brands: Vec<String>,
    #[serde(default)]
    pub min_price: Option<f64>,
    #[serde(default)]
    pub max_price: Option<f64>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub in_stock_only: bool,
    #[serde(default)]
    pub prime_only: bool,
    #[serde(default)]
    pub condition: Condition,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub raw_url: Option<String>,
    #[serde(default)]
    pub css_selector: Option<String>,
}

impl ProductCriteria {
    pub fn new(platform: SourceId, query: impl Into<String>) -> Self {
        Self {
            platform,
            query: Some(query.into()),
            product_id: None,
            category: None,
            brands: Vec::new(),
            min_price: None,
            max_price: None,
            currency: None,
            in_stock_only: false,
            prime_only: false,
            condition: Condition::Any,
            keywords: Vec::new(),
            raw_url: None,
            css_selector: None,
        }
    }

    /// The product id when it is the only thing to search for.
    pub fn product_id_only(&self) -> Option<&str> {
        if self.query.as_deref().is_some_and(|q| !q.trim().is_empty()) {
            return None;
        }
        self.product_id.as_deref().map(str::trim).filter(|id| !id.is_empty())
    }

    /// Text sent to the marketplace search box: query, else product id, plus brands.
    pub fn search_terms(&self) -> String {
        let base = self
            .query
            .as_deref()
            .or(self.product_id.as_deref())
            .unwrap_or_default()
            .trim()
            .to_string();
        let mut terms = vec![base];
        terms.extend(self.brands.iter().map(|b| b.trim().to_string()));
        terms
            .into_iter()
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Kind-tagged search criteria, validated before an alert is stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Criteria {
    Property(PropertyCriteria),
    Product(ProductCriteria),
}

impl Criteria {
    pub fn kind(&self) -> AlertKind {
        match self {
            Criteria::Property(_) => AlertKind::Property,
            Criteria::Product(_) => AlertKind::Product,
        }
    }

    pub fn price_range(&self) -> (Option<f64>, Option<f64>) {
        match self {
            Criteria::Property(c) => (c.min_price, c.max_price),
            Criteria::Product(c) => (c.min_price, c.max_price),
        }
    }

    pub fn as_property(&self) -> Option<&PropertyCriteria> {
        match self {
            Criteria::Property(c) => Some(c),
            Criteria::Product(_) => None,
        }
    }

    pub fn as_product(&self) -> Option<&ProductCriteria> {
        match self {
            Criteria::Product(c) => Some(c),
            Criteria::Property(_) => None,
        }
    }
}

/// A saved, recurring search owned by a user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub criteria: Criteria,
    pub sources: Vec<SourceId>,
    pub is_active: bool,
    pub check_frequency: CheckFrequency,
    pub last_checked: Option<DateTime<Utc>>,
    pub last_match_count: i64,
    pub created_at: DateTime<Utc>,
}

impl Alert {
    pub fn new(user_id: Uuid, name: impl Into<String>, criteria: Criteria, sources: Vec<SourceId>) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            name: name.into(),
            criteria,
            sources,
            is_active: true,
            check_frequency: CheckFrequency::default(),
            last_checked: None,
            last_match_count: 0,
            created_at: Utc::now(),
        }
    }

    pub fn kind(&self) -> AlertKind {
        self.criteria.kind()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

/// Normalized adapter output, not yet persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    /// Adapter-local identifier, unique within one fetch.
    pub id: String,
    pub title: String,
    pub price: f64,
    pub price_text: String,
    pub location: Option<String>,
    pub area: Option<f64>,
    pub rooms: Option<f64>,
    pub image_url: Option<String>,
    /// Canonical, stable URL. Together with the alert id this is the dedup key.
    pub source_url: String,
    pub source: SourceId,
    #[serde(default)]
    pub metadata: JsonMap<String, JsonValue>,
}

impl Listing {
    pub fn new(
        source: SourceId,
        id: impl Into<String>,
        title: impl Into<String>,
        price: f64,
        source_url: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            price,
            price_text: String::new(),
            location: None,
            area: None,
            rooms: None,
            image_url: None,
            source_url: source_url.into(),
            source,
            metadata: JsonMap::new(),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.price.is_finite() && self.price > 0.0 && !self.title.trim().is_empty()
    }

    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(JsonValue::as_str)
    }

    /// Searchable text used by keyword filters.
    pub fn haystack(&self) -> String {
        let mut text = self.title.to_lowercase();
        if let Some(location) = &self.location {
            text.push(' ');
            text.push_str(&location.to_lowercase());
        }
        if let Some(description) = self.metadata_str("description") {
            text.push(' ');
            text.push_str(&description.to_lowercase());
        }
        text
    }
}

/// Insert payload for a new match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewMatch {
    pub alert_id: Uuid,
    pub title: String,
    pub price: f64,
    pub currency: String,
    pub location: Option<String>,
    pub area: Option<f64>,
    pub image_url: Option<String>,
    pub source_url: String,
    pub source: SourceId,
    pub metadata: JsonValue,
    pub coordinates: Option<Coordinates>,
}

impl NewMatch {
    /// Builds the insert payload. Currency comes from the listing metadata, then the
    /// criteria, then the marketplace default.
    pub fn from_listing(
        alert_id: Uuid,
        listing: &Listing,
        criteria_currency: Option<&str>,
        coordinates: Option<Coordinates>,
    ) -> Self {
        let currency = listing
            .metadata_str("currency")
            .or(criteria_currency)
            .filter(|c| !c.trim().is_empty())
            .unwrap_or(listing.source.default_currency())
            .to_ascii_uppercase();
        Self {
            alert_id,
            title: listing.title.trim().to_string(),
            price: listing.price,
            currency,
            location: listing.location.clone(),
            area: listing.area,
            image_url: listing.image_url.clone(),
            source_url: listing.source_url.clone(),
            source: listing.source,
            metadata: JsonValue::Object(listing.metadata.clone()),
            coordinates,
        }
    }
}

/// A persisted listing owned by one alert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Match {
    pub id: Uuid,
    pub alert_id: Uuid,
    pub title: String,
    pub price: f64,
    pub currency: String,
    pub location: Option<String>,
    pub area: Option<f64>,
    pub image_url: Option<String>,
    pub source_url: String,
    pub source: SourceId,
    pub metadata: JsonValue,
    pub is_favorite: bool,
    pub created_at: DateTime<Utc>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}
