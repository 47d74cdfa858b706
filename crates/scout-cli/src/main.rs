use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use scout_core::{Alert, CheckFrequency, Criteria, SourceId};
use scout_storage::SqliteStore;
use scout_sync::{preview, preview_url, Engine, ScoutConfig};
use serde::Deserialize;
use tokio::fs;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "scout-cli")]
#[command(about = "Listing scout alert engine")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Create or upgrade the database schema.
    Migrate,
    /// Store a new alert read from a JSON file.
    AddAlert { file: PathBuf },
    /// Check one alert now, regardless of when it last ran.
    RunAlert { id: Uuid },
    /// One sweep over every due alert.
    Sweep,
    /// Fetch listings for criteria without storing anything.
    Preview {
        file: PathBuf,
        #[arg(long)]
        source: Option<SourceId>,
    },
    /// Print the search URL for criteria.
    Url {
        file: PathBuf,
        #[arg(long)]
        source: Option<SourceId>,
    },
    /// Run the recurring sweep until interrupted.
    Serve,
}

/// Alert definition accepted by `add-alert`.
#[derive(Debug, Deserialize)]
struct AlertFile {
    name: String,
    #[serde(default)]
    user_id: Option<Uuid>,
    criteria: Criteria,
    #[serde(default)]
    sources: Vec<SourceId>,
    #[serde(default)]
    check_frequency: Option<CheckFrequency>,
    #[serde(default = "active_by_default")]
    is_active: bool,
}

fn active_by_default() -> bool {
    true
}

impl AlertFile {
    fn into_alert(self) -> Alert {
        let sources = if self.sources.is_empty() {
            vec![default_source(&self.criteria)]
        } else {
            self.sources
        };
        let mut alert = Alert::new(self.user_id.unwrap_or_else(Uuid::nil), self.name, self.criteria, sources);
        alert.check_frequency = self.check_frequency.unwrap_or_default();
        alert.is_active = self.is_active;
        alert
    }
}

fn default_source(criteria: &Criteria) -> SourceId {
    match criteria {
        Criteria::Property(_) => SourceId::Rent591,
        Criteria::Product(product) => product.platform,
    }
}

fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::new(std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()));
    let log_json = matches!(std::env::var("SCOUT_LOG_JSON").as_deref(), Ok("1" | "true"));
    if log_json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

async fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
    let text = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value).context("encoding output")?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = ScoutConfig::from_env();

    match cli.command.unwrap_or(Commands::Sweep) {
        Commands::Migrate => {
            SqliteStore::connect(&config.database_url)
                .await
                .with_context(|| format!("migrating {}", config.database_url))?;
            println!("migrations applied: {}", config.database_url);
        }
        Commands::AddAlert { file } => {
            let alert = read_json::<AlertFile>(&file).await?.into_alert();
            let store = SqliteStore::connect(&config.database_url).await?;
            store.insert_alert(&alert).await.context("storing alert")?;
            println!("alert added: id={} name={}", alert.id, alert.name);
        }
        Commands::RunAlert { id } => {
            let engine = Engine::build(config).await?;
            let outcome = engine.scheduler.run_single_alert_now(id).await?;
            println!("alert checked: id={} new_matches={}", id, outcome.new_matches);
        }
        Commands::Sweep => {
            let engine = Engine::build(config).await?;
            let report = engine.scheduler.trigger_sweep_now().await?;
            print_json(&report)?;
        }
        Commands::Preview { file, source } => {
            let criteria: Criteria = read_json(&file).await?;
            let source = source.unwrap_or_else(|| default_source(&criteria));
            let engine = Engine::build(config).await?;
            let result = preview(&engine.registry, &engine.http, source, &criteria).await?;
            print_json(&result)?;
        }
        Commands::Url { file, source } => {
            let criteria: Criteria = read_json(&file).await?;
            let source = source.unwrap_or_else(|| default_source(&criteria));
            let registry = config.build_registry().await?;
            println!("{}", preview_url(&registry, source, &criteria)?);
        }
        Commands::Serve => {
            if !config.scheduler_enabled {
                bail!("scheduler disabled (SCOUT_SCHEDULER_ENABLED); nothing to serve");
            }
            let engine = Engine::build(config).await?;
            engine.scheduler.start().await?;
            info!(cron = engine.scheduler.cron(), "serving; press Ctrl-C to stop");
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = %err, "waiting for Ctrl-C failed; shutting down");
            }
            engine.scheduler.stop().await;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn cli_parses_subcommands() {
        let cli = Cli::try_parse_from(["scout-cli", "preview", "criteria.json", "--source", "momo"]).unwrap();
        match cli.command {
            Some(Commands::Preview { file, source }) => {
                assert_eq!(file, PathBuf::from("criteria.json"));
                assert_eq!(source, Some(SourceId::Momo));
            }
            other => panic!("unexpected command {other:?}"),
        }
        assert!(Cli::try_parse_from(["scout-cli", "run-alert", "not-a-uuid"]).is_err());
    }

    #[tokio::test]
    async fn alert_file_defaults_sources_from_criteria() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"name": "studio", "criteria": {{"kind": "property", "city": "台北市", "max_price": 20000}},
                "check_frequency": "15min"}}"#
        )
        .unwrap();

        let alert = read_json::<AlertFile>(file.path()).await.unwrap().into_alert();
        assert_eq!(alert.sources, vec![SourceId::Rent591]);
        assert_eq!(alert.check_frequency, CheckFrequency::FifteenMinutes);
        assert!(alert.is_active);
        assert!(alert.last_checked.is_none());
    }
}
