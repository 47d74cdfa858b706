//! Environment-driven configuration and the optional YAML source registry.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use scout_adapters::{AdapterRegistry, DetailPolicy};
use scout_core::SourceId;
use scout_storage::{BackoffPolicy, HttpClientConfig, DEFAULT_ACCEPT_LANGUAGE, DEFAULT_USER_AGENT};
use serde::Deserialize;
use tokio::fs;
use tracing::info;

use crate::geocode::GeocoderConfig;
use crate::scheduler::DEFAULT_SWEEP_CRON;

pub const DEFAULT_DATABASE_URL: &str = "sqlite://scout.db";
pub const DEFAULT_GEOCODER_URL: &str = "https://nominatim.openstreetmap.org/search";
pub const DEFAULT_GEOCODER_USER_AGENT: &str = "listing-scout/0.1";

#[derive(Debug, Clone, Deserialize)]
pub struct SourcesFile {
    pub sources: Vec<SourceToggle>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceToggle {
    pub source: SourceId,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    #[serde(default)]
    pub notes: Option<String>,
}

fn enabled_by_default() -> bool {
    true
}

impl SourcesFile {
    /// Sources not listed stay enabled.
    pub fn is_enabled(&self, source: SourceId) -> bool {
        self.sources
            .iter()
            .find(|toggle| toggle.source == source)
            .map_or(true, |toggle| toggle.enabled)
    }
}

#[derive(Debug, Clone)]
pub struct ScoutConfig {
    pub database_url: String,
    pub scheduler_enabled: bool,
    pub sweep_cron: String,
    pub user_agent: String,
    pub accept_language: String,
    pub http_timeout_secs: u64,
    pub http_max_retries: usize,
    pub detail_concurrency: usize,
    pub detail_limit: usize,
    pub geocoder_url: String,
    pub geocoder_user_agent: String,
    pub geocoder_country: Option<String>,
    pub geocode_min_interval_ms: u64,
    pub geocode_timeout_secs: u64,
    pub sources_file: Option<PathBuf>,
}

impl Default for ScoutConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl ScoutConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from any key lookup; unset or unparsable values take defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let text = |key: &str, default: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| default.to_string())
        };
        let number = |key: &str, default: u64| {
            lookup(key)
                .and_then(|v| v.trim().parse::<u64>().ok())
                .unwrap_or(default)
        };
        Self {
            database_url: text("DATABASE_URL", DEFAULT_DATABASE_URL),
            scheduler_enabled: lookup("SCOUT_SCHEDULER_ENABLED")
                .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True" | "yes"))
                .unwrap_or(true),
            sweep_cron: text("SCOUT_SWEEP_CRON", DEFAULT_SWEEP_CRON),
            user_agent: text("SCOUT_USER_AGENT", DEFAULT_USER_AGENT),
            accept_language: text("SCOUT_ACCEPT_LANGUAGE", DEFAULT_ACCEPT_LANGUAGE),
            http_timeout_secs: number("SCOUT_HTTP_TIMEOUT_SECS", 25),
            http_max_retries: number("SCOUT_HTTP_MAX_RETRIES", 1) as usize,
            detail_concurrency: number("SCOUT_DETAIL_CONCURRENCY", 3).max(1) as usize,
            detail_limit: number("SCOUT_DETAIL_LIMIT", 10) as usize,
            geocoder_url: text("SCOUT_GEOCODER_URL", DEFAULT_GEOCODER_URL),
            geocoder_user_agent: text("SCOUT_GEOCODER_USER_AGENT", DEFAULT_GEOCODER_USER_AGENT),
            geocoder_country: Some(text("SCOUT_GEOCODER_COUNTRY", "tw"))
                .filter(|c| !matches!(c.as_str(), "any" | "none")),
            geocode_min_interval_ms: number("SCOUT_GEOCODE_MIN_INTERVAL_MS", 1000),
            geocode_timeout_secs: number("SCOUT_GEOCODE_TIMEOUT_SECS", 10),
            sources_file: lookup("SCOUT_SOURCES_FILE")
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .map(PathBuf::from),
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        let defaults = HttpClientConfig::default();
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: self.user_agent.clone(),
            accept_language: self.accept_language.clone(),
            per_source_concurrency: defaults.per_source_concurrency.max(self.detail_concurrency),
            backoff: BackoffPolicy {
                max_retries: self.http_max_retries,
                ..BackoffPolicy::default()
            },
            ..defaults
        }
    }

    pub fn detail_policy(&self) -> DetailPolicy {
        DetailPolicy {
            limit: self.detail_limit,
            concurrency: self.detail_concurrency,
        }
    }

    pub fn geocoder_config(&self) -> GeocoderConfig {
        GeocoderConfig {
            endpoint: self.geocoder_url.clone(),
            user_agent: self.geocoder_user_agent.clone(),
            country_codes: self.geocoder_country.clone(),
            min_interval: Duration::from_millis(self.geocode_min_interval_ms),
            timeout: Duration::from_secs(self.geocode_timeout_secs),
        }
    }

    /// Reads `SCOUT_SOURCES_FILE` when set.
    pub async fn load_sources_file(&self) -> Result<Option<SourcesFile>> {
        match &self.sources_file {
            Some(path) => read_sources_file(path).await.map(Some),
            None => Ok(None),
        }
    }

    /// Built-in adapters minus any the source registry disables.
    pub async fn build_registry(&self) -> Result<AdapterRegistry> {
        let mut registry = AdapterRegistry::with_defaults(self.detail_policy());
        if let Some(file) = self.load_sources_file().await? {
            registry.retain_enabled(|source| file.is_enabled(source));
        }
        info!(sources = ?registry.sources(), "adapter registry ready");
        Ok(registry)
    }
}

pub async fn read_sources_file(path: &Path) -> Result<SourcesFile> {
    let text = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(pairs: &[(&str, &str)]) -> ScoutConfig {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ScoutConfig::from_lookup(|key| env.get(key).cloned())
    }

    #[test]
    fn defaults_apply_when_unset() {
        let cfg = ScoutConfig::default();
        assert_eq!(cfg.database_url, DEFAULT_DATABASE_URL);
        assert!(cfg.scheduler_enabled);
        assert_eq!(cfg.sweep_cron, "0 * * * * *");
        assert_eq!(cfg.http_timeout_secs, 25);
        assert_eq!(cfg.http_max_retries, 1);
        assert_eq!(cfg.detail_policy(), DetailPolicy { limit: 10, concurrency: 3 });
        assert_eq!(cfg.geocode_min_interval_ms, 1000);
        assert_eq!(cfg.geocoder_country.as_deref(), Some("tw"));
        assert!(cfg.sources_file.is_none());
    }

    #[test]
    fn overrides_and_bad_numbers() {
        let cfg = config(&[
            ("DATABASE_URL", "sqlite::memory:"),
            ("SCOUT_SCHEDULER_ENABLED", "0"),
            ("SCOUT_HTTP_TIMEOUT_SECS", "soon"),
            ("SCOUT_DETAIL_CONCURRENCY", "6"),
            ("SCOUT_GEOCODER_COUNTRY", "none"),
            ("SCOUT_SOURCES_FILE", "./sources.yaml"),
        ]);
        assert_eq!(cfg.database_url, "sqlite::memory:");
        assert!(!cfg.scheduler_enabled);
        assert_eq!(cfg.http_timeout_secs, 25);
        assert_eq!(cfg.http_client_config().per_source_concurrency, 6);
        assert!(cfg.geocoder_country.is_none());
        assert_eq!(cfg.sources_file, Some(PathBuf::from("./sources.yaml")));
    }

    #[test]
    fn http_config_carries_retries_and_timeout() {
        let cfg = config(&[("SCOUT_HTTP_MAX_RETRIES", "3"), ("SCOUT_HTTP_TIMEOUT_SECS", "30")]);
        let http = cfg.http_client_config();
        assert_eq!(http.backoff.max_retries, 3);
        assert_eq!(http.timeout, Duration::from_secs(30));
        assert_eq!(http.per_source_concurrency, 3);
    }

    #[tokio::test]
    async fn sources_file_disables_listed_sources() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sources.yaml");
        std::fs::write(
            &path,
            "sources:\n  - source: amazon\n    enabled: false\n    notes: blocked from this region\n  - source: \"591\"\n",
        )
        .unwrap();

        let cfg = config(&[("SCOUT_SOURCES_FILE", path.to_str().unwrap())]);
        let registry = cfg.build_registry().await.unwrap();
        assert!(registry.get(SourceId::Amazon).is_none());
        assert!(registry.get(SourceId::Rent591).is_some());
        assert!(registry.get(SourceId::Ebay).is_some());
    }

    #[tokio::test]
    async fn unknown_source_key_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sources.yaml");
        std::fs::write(&path, "sources:\n  - source: craigslist\n").unwrap();
        assert!(read_sources_file(&path).await.is_err());
    }
}
