//! Best-effort address geocoding behind a process-wide rate gate.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT_LANGUAGE};
use scout_core::Coordinates;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum GeocodeError {
    #[error("geocoder request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("geocoder returned HTTP {0}")]
    Status(u16),
    #[error("geocoder response could not be decoded: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("geocoder returned a non-numeric coordinate")]
    Coordinate,
}

/// Resolves address text to coordinates. Failures are absorbed into `None`.
#[async_trait]
pub trait Geocoder: Send + Sync {
    async fn geocode(&self, address: &str) -> Option<Coordinates>;
}

/// Geocoder for deployments without geocoding; always `None`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledGeocoder;

#[async_trait]
impl Geocoder for DisabledGeocoder {
    async fn geocode(&self, _address: &str) -> Option<Coordinates> {
        None
    }
}

/// Enforces a minimum spacing between calls across every holder of the gate.
#[derive(Debug)]
pub struct RateGate {
    min_interval: Duration,
    last_call: Mutex<Option<Instant>>,
}

impl RateGate {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_call: Mutex::new(None),
        }
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Waits until a call is allowed and records it. Callers queue on the lock, so the
    /// spacing holds under contention.
    pub async fn wait(&self) {
        let mut last_call = self.last_call.lock().await;
        if let Some(previous) = *last_call {
            let ready_at = previous + self.min_interval;
            if Instant::now() < ready_at {
                tokio::time::sleep_until(ready_at).await;
            }
        }
        *last_call = Some(Instant::now());
    }
}

#[derive(Debug, Clone)]
pub struct GeocoderConfig {
    pub endpoint: String,
    pub user_agent: String,
    /// ISO country codes passed as `countrycodes`, e.g. `tw`.
    pub country_codes: Option<String>,
    pub min_interval: Duration,
    pub timeout: Duration,
}

/// Nominatim-compatible search endpoint client.
#[derive(Debug, Clone)]
pub struct NominatimGeocoder {
    client: reqwest::Client,
    endpoint: String,
    country_codes: Option<String>,
    gate: Arc<RateGate>,
}

#[derive(Debug, Deserialize)]
struct NominatimPlace {
    lat: String,
    lon: String,
}

impl NominatimGeocoder {
    pub fn new(config: GeocoderConfig) -> Result<Self, GeocodeError> {
        let gate = Arc::new(RateGate::new(config.min_interval));
        Self::with_gate(config, gate)
    }

    /// Shares an existing gate, e.g. between geocoders pointed at the same service.
    pub fn with_gate(config: GeocoderConfig, gate: Arc<RateGate>) -> Result<Self, GeocodeError> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("zh-TW,zh;q=0.9,en;q=0.8"));
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .default_headers(headers)
            .user_agent(config.user_agent.clone())
            .build()?;
        Ok(Self {
            client,
            endpoint: config.endpoint,
            country_codes: config.country_codes,
            gate,
        })
    }

    pub fn gate(&self) -> Arc<RateGate> {
        Arc::clone(&self.gate)
    }

    async fn lookup(&self, address: &str) -> Result<Option<Coordinates>, GeocodeError> {
        self.gate.wait().await;
        let mut params = vec![("q", address), ("format", "json"), ("limit", "1")];
        if let Some(codes) = self.country_codes.as_deref() {
            params.push(("countrycodes", codes));
        }
        let response = self.client.get(&self.endpoint).query(&params).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(GeocodeError::Status(status.as_u16()));
        }
        let body = response.text().await?;
        parse_response(&body)
    }
}

#[async_trait]
impl Geocoder for NominatimGeocoder {
    async fn geocode(&self, address: &str) -> Option<Coordinates> {
        let address = address.trim();
        if address.is_empty() {
            return None;
        }
        match self.lookup(address).await {
            Ok(Some(coords)) => {
                debug!(address, lat = coords.latitude, lon = coords.longitude, "geocoded");
                Some(coords)
            }
            Ok(None) => {
                debug!(address, "geocoder found no match");
                None
            }
            Err(err) => {
                warn!(address, error = %err, "geocoding failed");
                None
            }
        }
    }
}

/// First place in a Nominatim `format=json` response.
pub fn parse_response(body: &str) -> Result<Option<Coordinates>, GeocodeError> {
    let places: Vec<NominatimPlace> = serde_json::from_str(body)?;
    let Some(place) = places.into_iter().next() else {
        return Ok(None);
    };
    let latitude = place.lat.trim().parse::<f64>().map_err(|_| GeocodeError::Coordinate)?;
    let longitude = place.lon.trim().parse::<f64>().map_err(|_| GeocodeError::Coordinate)?;
    Ok(Some(Coordinates {
        latitude,
        longitude,
    }))
}
