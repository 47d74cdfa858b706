//! Persistence gateway: alerts and deduplicated matches in SQLite.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scout_core::{Alert, CheckFrequency, Criteria, Match, NewMatch, SourceId};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, Pool, Sqlite};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("connection error: {0}")]
    Connection(String),
    #[error("migration error: {0}")]
    Migration(String),
    #[error("query error: {0}")]
    Query(#[from] sqlx::Error),
    #[error("corrupt {what} row {id}: {detail}")]
    Corrupt {
        what: &'static str,
        id: String,
        detail: String,
    },
    #[error("invalid alert: {0}")]
    InvalidAlert(String),
}

/// What the alert engine needs from storage.
///
/// The `(alert_id, source_url)` uniqueness is enforced by the store itself;
/// `insert_match` reports `false` when a concurrent writer got there first.
#[async_trait]
pub trait AlertStore: Send + Sync {
    /// Active alerts that decode cleanly. Undecodable rows are logged and left out.
    async fn get_active_alerts(&self) -> Result<Vec<Alert>, StoreError>;

    async fn get_alert_by_id(&self, id: Uuid) -> Result<Option<Alert>, StoreError>;

    async fn update_alert_last_checked(
        &self,
        id: Uuid,
        match_count: i64,
        checked_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn match_exists(&self, alert_id: Uuid, source_url: &str) -> Result<bool, StoreError>;

    async fn insert_match(&self, record: &NewMatch) -> Result<bool, StoreError>;
}

#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: Pool<Sqlite>,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `url` and run migrations.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| StoreError::Connection(e.to_string()))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        info!(url, "alert store opened");

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::Connection(e.to_string()))?;
        }
        Self::connect(&format!("sqlite:{}", path.display())).await
    }

    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| StoreError::Connection(e.to_string()))?
            .foreign_keys(true);

        // A single connection that never recycles, otherwise the database vanishes.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Migration(e.to_string()))?;
        Ok(())
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    /// Stores a new alert. Enforces the non-empty `sources` invariant.
    pub async fn insert_alert(&self, alert: &Alert) -> Result<(), StoreError> {
        if alert.sources.is_empty() {
            return Err(StoreError::InvalidAlert(format!(
                "alert {} has no sources",
                alert.id
            )));
        }
        let criteria = serde_json::to_string(&alert.criteria)
            .map_err(|e| StoreError::InvalidAlert(e.to_string()))?;
        let sources = serde_json::to_string(&alert.sources)
            .map_err(|e| StoreError::InvalidAlert(e.to_string()))?;

        sqlx::query(
            "INSERT INTO alerts (id, user_id, kind, name, criteria, sources, is_active, \
             check_frequency, last_checked, last_match_count, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(alert.id.to_string())
        .bind(alert.user_id.to_string())
        .bind(alert.kind().as_str())
        .bind(&alert.name)
        .bind(criteria)
        .bind(sources)
        .bind(alert.is_active)
        .bind(alert.check_frequency.as_str())
        .bind(alert.last_checked)
        .bind(alert.last_match_count)
        .bind(alert.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_alert_active(&self, id: Uuid, active: bool) -> Result<(), StoreError> {
        sqlx::query("UPDATE alerts SET is_active = ? WHERE id = ?")
            .bind(active)
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Deletes an alert and, through the foreign key, all of its matches.
    pub async fn delete_alert(&self, id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM alerts WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn list_matches(&self, alert_id: Uuid) -> Result<Vec<Match>, StoreError> {
        let rows = sqlx::query_as::<_, MatchRow>(
            "SELECT * FROM matches WHERE alert_id = ? ORDER BY created_at DESC, id",
        )
        .bind(alert_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Match::try_from).collect()
    }

    pub async fn count_matches(&self) -> Result<i64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM matches")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

#[async_trait]
impl AlertStore for SqliteStore {
    async fn get_active_alerts(&self) -> Result<Vec<Alert>, StoreError> {
        let rows = sqlx::query_as::<_, AlertRow>(
            "SELECT * FROM alerts WHERE is_active = 1 ORDER BY created_at, id",
        )
        .fetch_all(&self.pool)
        .await?;
        let alerts = rows
            .into_iter()
            .filter_map(|row| {
                let alert_id = row.id.clone();
                match Alert::try_from(row) {
                    Ok(alert) => Some(alert),
                    Err(err) => {
                        warn!(%alert_id, error = %err, "skipping undecodable alert row");
                        None
                    }
                }
            })
            .collect();
        Ok(alerts)
    }

    async fn get_alert_by_id(&self, id: Uuid) -> Result<Option<Alert>, StoreError> {
        let row = sqlx::query_as::<_, AlertRow>("SELECT * FROM alerts WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(Alert::try_from).transpose()
    }

    async fn update_alert_last_checked(
        &self,
        id: Uuid,
        match_count: i64,
        checked_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE alerts SET last_checked = ?, last_match_count = ? WHERE id = ?")
            .bind(checked_at)
            .bind(match_count)
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn match_exists(&self, alert_id: Uuid, source_url: &str) -> Result<bool, StoreError> {
        let found: Option<i64> =
            sqlx::query_scalar("SELECT 1 FROM matches WHERE alert_id = ? AND source_url = ? LIMIT 1")
                .bind(alert_id.to_string())
                .bind(source_url)
                .fetch_optional(&self.pool)
                .await?;
        Ok(found.is_some())
    }

    async fn insert_match(&self, record: &NewMatch) -> Result<bool, StoreError> {
        let metadata = serde_json::to_string(&record.metadata).map_err(|e| StoreError::Corrupt {
            what: "match",
            id: record.source_url.clone(),
            detail: e.to_string(),
        })?;
        let result = sqlx::query(
            "INSERT INTO matches (id, alert_id, title, price, currency, location, area, image_url, \
             source_url, source, metadata, is_favorite, latitude, longitude, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?, ?) \
             ON CONFLICT (alert_id, source_url) DO NOTHING",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(record.alert_id.to_string())
        .bind(&record.title)
        .bind(record.price)
        .bind(&record.currency)
        .bind(&record.location)
        .bind(record.area)
        .bind(&record.image_url)
        .bind(&record.source_url)
        .bind(record.source.as_str())
        .bind(metadata)
        .bind(record.coordinates.map(|c| c.latitude))
        .bind(record.coordinates.map(|c| c.longitude))
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}

#[derive(Debug, FromRow)]
struct AlertRow {
    id: String,
    user_id: String,
    name: String,
    criteria: String,
    sources: String,
    is_active: bool,
    check_frequency: String,
    last_checked: Option<DateTime<Utc>>,
    last_match_count: i64,
    created_at: DateTime<Utc>,
}

impl TryFrom<AlertRow> for Alert {
    type Error = StoreError;

    fn try_from(row: AlertRow) -> Result<Self, Self::Error> {
        let corrupt = |detail: String| StoreError::Corrupt {
            what: "alert",
            id: row.id.clone(),
            detail,
        };
        let id = Uuid::parse_str(&row.id).map_err(|e| corrupt(e.to_string()))?;
        let user_id = Uuid::parse_str(&row.user_id).map_err(|e| corrupt(e.to_string()))?;
        let criteria: Criteria =
            serde_json::from_str(&row.criteria).map_err(|e| corrupt(format!("criteria: {e}")))?;
        let sources: Vec<SourceId> =
            serde_json::from_str(&row.sources).map_err(|e| corrupt(format!("sources: {e}")))?;

        Ok(Alert {
            id,
            user_id,
            name: row.name,
            criteria,
            sources,
            is_active: row.is_active,
            check_frequency: CheckFrequency::parse_lenient(&row.check_frequency),
            last_checked: row.last_checked,
            last_match_count: row.last_match_count,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct MatchRow {
    id: String,
    alert_id: String,
    title: String,
    price: f64,
    currency: String,
    location: Option<String>,
    area: Option<f64>,
    image_url: Option<String>,
    source_url: String,
    source: String,
    metadata: String,
    is_favorite: bool,
    latitude: Option<f64>,
    longitude: Option<f64>,
    created_at: DateTime<Utc>,
}

impl TryFrom<MatchRow> for Match {
    type Error = StoreError;

    fn try_from(row: MatchRow) -> Result<Self, Self::Error> {
        let corrupt = |detail: String| StoreError::Corrupt {
            what: "match",
            id: row.id.clone(),
            detail,
        };
        Ok(Match {
            id: Uuid::parse_str(&row.id).map_err(|e| corrupt(e.to_string()))?,
            alert_id: Uuid::parse_str(&row.alert_id).map_err(|e| corrupt(e.to_string()))?,
            source: row.source.parse().map_err(|e: scout_core::ParseKeyError| corrupt(e.to_string()))?,
            metadata: serde_json::from_str(&row.metadata).map_err(|e| corrupt(e.to_string()))?,
            title: row.title,
            price: row.price,
            currency: row.currency,
            location: row.location,
            area: row.area,
            image_url: row.image_url,
            source_url: row.source_url,
            is_favorite: row.is_favorite,
            created_at: row.created_at,
            latitude: row.latitude,
            longitude: row.longitude,
        })
    }
}
