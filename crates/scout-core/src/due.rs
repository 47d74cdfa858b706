//! Decides whether an alert should be checked on this tick.

use chrono::{DateTime, Utc};

use crate::{Alert, CheckFrequency};

/// Inactive alerts are never due. An alert that has never been checked always is.
pub fn is_due(alert: &Alert, now: DateTime<Utc>) -> bool {
    alert.is_active && is_due_at(alert.last_checked, alert.check_frequency, now)
}

pub fn is_due_at(
    last_checked: Option<DateTime<Utc>>,
    frequency: CheckFrequency,
    now: DateTime<Utc>,
) -> bool {
    match last_checked {
        None => true,
        Some(last) => now.signed_duration_since(last) >= frequency.interval(),
    }
}
