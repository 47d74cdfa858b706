//! Runs one alert: fetch from each source, filter, dedup, enrich and persist.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::Utc;
use futures::FutureExt;
use scout_adapters::{in_price_range as within, AdapterRegistry};
use scout_core::{Alert, AlertKind, Coordinates, Criteria, Listing, NewMatch, PropertyCriteria};
use scout_storage::{AlertStore, HttpFetcher, StoreError};
use serde::Serialize;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::geocode::Geocoder;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunOutcome {
    pub new_matches: i64,
}

pub struct AlertRunner {
    store: Arc<dyn AlertStore>,
    registry: Arc<AdapterRegistry>,
    http: Arc<HttpFetcher>,
    geocoder: Arc<dyn Geocoder>,
}

impl std::fmt::Debug for AlertRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlertRunner")
            .field("registry", &self.registry)
            .finish()
    }
}

impl AlertRunner {
    pub fn new(
        store: Arc<dyn AlertStore>,
        registry: Arc<AdapterRegistry>,
        http: Arc<HttpFetcher>,
        geocoder: Arc<dyn Geocoder>,
    ) -> Self {
        Self {
            store,
            registry,
            http,
            geocoder,
        }
    }

    pub fn registry(&self) -> &AdapterRegistry {
        &self.registry
    }

    pub fn http(&self) -> &HttpFetcher {
        &self.http
    }

    /// Checks one alert. Missing or inactive alerts are a no-op. Source failures and
    /// adapter panics are logged and contribute nothing; only store failures are returned.
    pub async fn run_alert(&self, alert_id: Uuid) -> Result<RunOutcome, StoreError> {
        let Some(alert) = self.store.get_alert_by_id(alert_id).await? else {
            debug!(%alert_id, "alert not found; nothing to run");
            return Ok(RunOutcome::default());
        };
        if !alert.is_active {
            debug!(%alert_id, "alert is inactive; nothing to run");
            return Ok(RunOutcome::default());
        }
        let span = info_span!("alert_run", alert_id = %alert.id, alert_name = %alert.name);
        self.run_loaded(&alert).instrument(span).await
    }

    async fn run_loaded(&self, alert: &Alert) -> Result<RunOutcome, StoreError> {
        let mut new_matches = 0i64;
        for &source in &alert.sources {
            let fetch = self.registry.fetch(source, &self.http, &alert.criteria);
            let listings = match AssertUnwindSafe(fetch).catch_unwind().await {
                Ok(Ok(listings)) => listings,
                Ok(Err(err)) => {
                    warn!(alert_id = %alert.id, source = %source, error = %err, "source failed; continuing");
                    continue;
                }
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    warn!(alert_id = %alert.id, source = %source, error = %message, "source panicked; continuing");
                    continue;
                }
            };
            let fetched = listings.len();
            let candidates = match (&alert.criteria, source.kind()) {
                (Criteria::Property(criteria), AlertKind::Property) => {
                    filter_property(listings, criteria)
                }
                _ => listings,
            };
            let saved = self.persist_new(alert, candidates).await?;
            info!(alert_id = %alert.id, source = %source, fetched, new_matches = saved, "source checked");
            new_matches += saved;
        }

        self.store
            .update_alert_last_checked(alert.id, new_matches, Utc::now())
            .await?;
        info!(alert_id = %alert.id, new_matches, "alert checked");
        Ok(RunOutcome { new_matches })
    }

    async fn persist_new(&self, alert: &Alert, listings: Vec<Listing>) -> Result<i64, StoreError> {
        let criteria_currency = alert
            .criteria
            .as_product()
            .and_then(|product| product.currency.as_deref());
        let mut saved = 0i64;
        for listing in listings {
            if !listing.is_valid() {
                debug!(alert_id = %alert.id, url = %listing.source_url, "dropping invalid listing");
                continue;
            }
            if self.store.match_exists(alert.id, &listing.source_url).await? {
                continue;
            }
            let coordinates = if listing.source.kind() == AlertKind::Property {
                self.locate(&listing).await
            } else {
                None
            };
            let record = NewMatch::from_listing(alert.id, &listing, criteria_currency, coordinates);
            if self.store.insert_match(&record).await? {
                saved += 1;
            } else {
                debug!(alert_id = %alert.id, url = %listing.source_url, "duplicate absorbed by store");
            }
        }
        Ok(saved)
    }

    /// Coordinates from the detail page when present, otherwise a geocode of the location.
    async fn locate(&self, listing: &Listing) -> Option<Coordinates> {
        if let Some(coords) = detail_coordinates(listing) {
            return Some(coords);
        }
        let location = listing.location.as_deref().map(str::trim).filter(|l| !l.is_empty())?;
        self.geocoder.geocode(location).await
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "adapter panicked".to_string()
    }
}

fn detail_coordinates(listing: &Listing) -> Option<Coordinates> {
    let latitude = listing.metadata.get("latitude")?.as_f64()?;
    let longitude = listing.metadata.get("longitude")?.as_f64()?;
    Some(Coordinates {
        latitude,
        longitude,
    })
}

/// Criteria the rental search URL cannot express exactly. Unknown area or room counts pass.
pub fn matches_property(listing: &Listing, criteria: &PropertyCriteria) -> bool {
    if !within(listing.price, criteria.min_price, criteria.max_price) {
        return false;
    }
    if criteria.min_area.is_some() || criteria.max_area.is_some() {
        if let Some(area) = listing.area {
            if !within(area, criteria.min_area, criteria.max_area) {
                return false;
            }
        }
    }
    if let (Some(min_rooms), Some(rooms)) = (criteria.rooms, listing.rooms) {
        if rooms < f64::from(min_rooms) {
            return false;
        }
    }
    let keywords: Vec<String> = criteria
        .keywords
        .iter()
        .map(|k| k.trim().to_lowercase())
        .filter(|k| !k.is_empty())
        .collect();
    if keywords.is_empty() {
        return true;
    }
    let haystack = listing.haystack();
    keywords.iter().any(|keyword| haystack.contains(keyword))
}

pub fn filter_property(listings: Vec<Listing>, criteria: &PropertyCriteria) -> Vec<Listing> {
    listings
        .into_iter()
        .filter(|listing| matches_property(listing, criteria))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use scout_core::SourceId;
    use serde_json::json;

    fn flat(price: f64, area: Option<f64>, rooms: Option<f64>, title: &str) -> Listing {
        let mut listing = Listing::new(SourceId::Rent591, "1", title, price, "https://rent.591.com.tw/1");
        listing.area = area;
        listing.rooms = rooms;
        listing.location = Some("台北市信義區".into());
        listing
    }

    #[test]
    fn property_filter_checks_price_area_rooms_and_keywords() {
        let criteria = PropertyCriteria {
            city: "台北市".into(),
            min_price: Some(10000.0),
            max_price: Some(20000.0),
            min_area: Some(8.0),
            rooms: Some(2),
            keywords: vec!["捷運".into(), "Pet".into()],
            ..PropertyCriteria::default()
        };
        assert!(matches_property(&flat(15000.0, Some(10.0), Some(2.0), "近捷運兩房"), &criteria));
        assert!(matches_property(&flat(15000.0, Some(10.0), Some(3.0), "pet friendly"), &criteria));
        assert!(!matches_property(&flat(25000.0, Some(10.0), Some(2.0), "近捷運"), &criteria));
        assert!(!matches_property(&flat(15000.0, Some(5.0), Some(2.0), "近捷運"), &criteria));
        assert!(!matches_property(&flat(15000.0, Some(10.0), Some(1.0), "近捷運"), &criteria));
        assert!(!matches_property(&flat(15000.0, Some(10.0), Some(2.0), "兩房公寓"), &criteria));
    }

    #[test]
    fn unknown_area_and_rooms_pass() {
        let criteria = PropertyCriteria {
            min_area: Some(8.0),
            rooms: Some(2),
            ..PropertyCriteria::default()
        };
        assert!(matches_property(&flat(9000.0, None, None, "套房"), &criteria));
    }

    #[test]
    fn keywords_match_location_and_description() {
        let criteria = PropertyCriteria {
            keywords: vec!["信義".into(), "陽台".into()],
            ..PropertyCriteria::default()
        };
        assert!(matches_property(&flat(9000.0, None, None, "套房"), &criteria));

        let mut listing = flat(9000.0, None, None, "套房");
        listing.location = None;
        listing.metadata.insert("description".into(), json!("附陽台"));
        assert!(matches_property(&listing, &criteria));
    }

    #[test]
    fn panic_payloads_become_messages() {
        let boxed: Box<dyn Any + Send> = Box::new("selector overflow");
        assert_eq!(panic_message(boxed.as_ref()), "selector overflow");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("bad index 7"));
        assert_eq!(panic_message(boxed.as_ref()), "bad index 7");
        let boxed: Box<dyn Any + Send> = Box::new(42u8);
        assert_eq!(panic_message(boxed.as_ref()), "adapter panicked");
    }

    #[test]
    fn detail_coordinates_come_from_metadata() {
        let mut listing = flat(9000.0, None, None, "套房");
        assert!(detail_coordinates(&listing).is_none());
        listing.metadata.insert("latitude".into(), json!(25.04));
        listing.metadata.insert("longitude".into(), json!(121.56));
        assert_eq!(
            detail_coordinates(&listing),
            Some(Coordinates { latitude: 25.04, longitude: 121.56 })
        );
    }
}
