//! Alert engine orchestration: configuration, geocoding, alert runs and the sweep scheduler.

pub mod config;
pub mod geocode;
pub mod preview;
pub mod runner;
pub mod scheduler;

use std::sync::Arc;

use anyhow::{Context, Result};
use scout_adapters::AdapterRegistry;
use scout_storage::{AlertStore, HttpFetcher, SqliteStore};
use tracing::info;

pub use config::{read_sources_file, ScoutConfig, SourceToggle, SourcesFile};
pub use geocode::{DisabledGeocoder, GeocodeError, Geocoder, GeocoderConfig, NominatimGeocoder, RateGate};
pub use preview::{preview, preview_url, Preview};
pub use runner::{filter_property, matches_property, AlertRunner, RunOutcome};
pub use scheduler::{AlertRunResult, AlertScheduler, SchedulerStatus, SweepReport, DEFAULT_SWEEP_CRON};

pub const CRATE_NAME: &str = "scout-sync";

/// Everything a host process needs, wired once at startup.
#[derive(Debug, Clone)]
pub struct Engine {
    pub config: ScoutConfig,
    pub store: Arc<SqliteStore>,
    pub http: Arc<HttpFetcher>,
    pub registry: Arc<AdapterRegistry>,
    pub runner: Arc<AlertRunner>,
    pub scheduler: Arc<AlertScheduler>,
}

impl Engine {
    pub async fn from_env() -> Result<Self> {
        Self::build(ScoutConfig::from_env()).await
    }

    pub async fn build(config: ScoutConfig) -> Result<Self> {
        let store = Arc::new(
            SqliteStore::connect(&config.database_url)
                .await
                .with_context(|| format!("opening store {}", config.database_url))?,
        );
        let http = Arc::new(HttpFetcher::new(config.http_client_config()).context("building http client")?);
        let registry = Arc::new(config.build_registry().await?);
        let geocoder: Arc<dyn Geocoder> = Arc::new(
            NominatimGeocoder::new(config.geocoder_config()).context("building geocoder client")?,
        );
        let dyn_store: Arc<dyn AlertStore> = store.clone();
        let runner = Arc::new(AlertRunner::new(
            Arc::clone(&dyn_store),
            Arc::clone(&registry),
            Arc::clone(&http),
            geocoder,
        ));
        let scheduler = AlertScheduler::new(Arc::clone(&runner), dyn_store, config.sweep_cron.clone());
        info!(database = %config.database_url, sources = registry.len(), "engine ready");
        Ok(Self {
            config,
            store,
            http,
            registry,
            runner,
            scheduler,
        })
    }
}
