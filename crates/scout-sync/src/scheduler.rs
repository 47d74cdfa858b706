//! Recurring sweep over due alerts with a no-overlap guarantee.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::Utc;
use scout_core::{is_due, Alert};
use scout_storage::{AlertStore, StoreError};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job as CronJob, JobScheduler};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::runner::{AlertRunner, RunOutcome};

/// Every minute, on the minute (seconds-resolution cron).
pub const DEFAULT_SWEEP_CRON: &str = "0 * * * * *";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AlertRunResult {
    pub alert_id: Uuid,
    pub alert_name: String,
    pub new_matches: i64,
    /// Set when the run panicked; source failures are absorbed by the runner.
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// True when another sweep was already running and this one did nothing.
    pub skipped: bool,
    pub results: Vec<AlertRunResult>,
}

impl SweepReport {
    pub fn skipped() -> Self {
        Self {
            skipped: true,
            results: Vec::new(),
        }
    }

    pub fn total_new_matches(&self) -> i64 {
        self.results.iter().map(|r| r.new_matches).sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SchedulerStatus {
    pub is_sweeping: bool,
    pub is_scheduled: bool,
}

struct ActiveTimer {
    scheduler: JobScheduler,
    job_id: Uuid,
}

/// Clears the sweeping flag however the sweep ends.
struct SweepGuard<'a>(&'a AtomicBool);

impl Drop for SweepGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct AlertScheduler {
    runner: Arc<AlertRunner>,
    store: Arc<dyn AlertStore>,
    cron: String,
    sweeping: AtomicBool,
    timer: Mutex<Option<ActiveTimer>>,
}

impl std::fmt::Debug for AlertScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlertScheduler")
            .field("cron", &self.cron)
            .field("sweeping", &self.sweeping.load(Ordering::Relaxed))
            .finish()
    }
}

impl AlertScheduler {
    pub fn new(runner: Arc<AlertRunner>, store: Arc<dyn AlertStore>, cron: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            runner,
            store,
            cron: cron.into(),
            sweeping: AtomicBool::new(false),
            timer: Mutex::new(None),
        })
    }

    pub fn cron(&self) -> &str {
        &self.cron
    }

    /// Registers the recurring sweep, replacing any earlier registration.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let mut timer = self.timer.lock().await;
        if let Some(previous) = timer.take() {
            shutdown_timer(previous).await;
        }

        let scheduler = JobScheduler::new().await.context("creating job scheduler")?;
        let weak: Weak<Self> = Arc::downgrade(self);
        let job = CronJob::new_async(self.cron.as_str(), move |_uuid, _lock| {
            let weak = weak.clone();
            Box::pin(async move {
                let Some(this) = weak.upgrade() else {
                    return;
                };
                match this.trigger_sweep_now().await {
                    Ok(report) if report.skipped => debug!("tick skipped; sweep in progress"),
                    Ok(_) => {}
                    Err(err) => error!(error = %err, "scheduled sweep aborted"),
                }
            })
        })
        .with_context(|| format!("creating sweep job for cron {}", self.cron))?;
        let job_id = scheduler.add(job).await.context("adding sweep job")?;
        scheduler.start().await.context("starting job scheduler")?;

        *timer = Some(ActiveTimer { scheduler, job_id });
        info!(cron = %self.cron, %job_id, "alert scheduler started");
        Ok(())
    }

    /// Deregisters the timer. A sweep already running is left to finish.
    pub async fn stop(&self) {
        let previous = self.timer.lock().await.take();
        match previous {
            Some(timer) => {
                shutdown_timer(timer).await;
                info!("alert scheduler stopped");
            }
            None => debug!("alert scheduler already stopped"),
        }
    }

    pub async fn status(&self) -> SchedulerStatus {
        SchedulerStatus {
            is_sweeping: self.is_sweeping(),
            is_scheduled: self.timer.lock().await.is_some(),
        }
    }

    pub fn is_sweeping(&self) -> bool {
        self.sweeping.load(Ordering::Acquire)
    }

    /// Runs one alert now, without due-checking and outside the overlap guard.
    pub async fn run_single_alert_now(&self, alert_id: Uuid) -> Result<RunOutcome, StoreError> {
        self.runner.run_alert(alert_id).await
    }

    /// One sweep over every due alert, one alert at a time. Returns immediately with a
    /// skipped report if a sweep is already running. A store failure ends the sweep.
    pub async fn trigger_sweep_now(&self) -> Result<SweepReport, StoreError> {
        if self
            .sweeping
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(SweepReport::skipped());
        }
        let _guard = SweepGuard(&self.sweeping);
        let started = Instant::now();

        let now = Utc::now();
        let due: Vec<Alert> = self
            .store
            .get_active_alerts()
            .await?
            .into_iter()
            .filter(|alert| is_due(alert, now))
            .collect();
        if due.is_empty() {
            debug!("sweep found no due alerts");
            return Ok(SweepReport::default());
        }
        info!(due = due.len(), "sweep started");

        let mut results = Vec::with_capacity(due.len());
        for alert in due {
            let runner = Arc::clone(&self.runner);
            let alert_id = alert.id;
            let run = tokio::spawn(async move { runner.run_alert(alert_id).await }).await;
            let result = match run {
                Ok(Ok(outcome)) => AlertRunResult {
                    alert_id,
                    alert_name: alert.name,
                    new_matches: outcome.new_matches,
                    error: None,
                },
                Ok(Err(err)) => {
                    error!(%alert_id, error = %err, "store failure; sweep aborted");
                    return Err(err);
                }
                Err(join_err) => {
                    warn!(%alert_id, error = %join_err, "alert run failed");
                    AlertRunResult {
                        alert_id,
                        alert_name: alert.name,
                        new_matches: 0,
                        error: Some(join_err.to_string()),
                    }
                }
            };
            results.push(result);
        }

        let report = SweepReport {
            skipped: false,
            results,
        };
        info!(
            alerts = report.results.len(),
            new_matches = report.total_new_matches(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "sweep finished"
        );
        Ok(report)
    }
}

async fn shutdown_timer(mut timer: ActiveTimer) {
    if let Err(err) = timer.scheduler.remove(&timer.job_id).await {
        warn!(error = %err, "removing sweep job failed");
    }
    if let Err(err) = timer.scheduler.shutdown().await {
        warn!(error = %err, "shutting down job scheduler failed");
    }
}
