//! Trigger engine: turns a [`TriggerSpec`] into concrete fire times.

use autoloom_core::error::{AutoloomError, Result};
use autoloom_core::types::TriggerSpec;
use chrono::{DateTime, Duration, Utc};

use crate::cron::CronSchedule;

/// Shortest interval the engine accepts.
pub const MIN_INTERVAL_SECS: u64 = 1;

/// Reject triggers that can never fire correctly.
pub fn validate(trigger: &TriggerSpec) -> Result<()> {
    match trigger {
        TriggerSpec::Cron { expression } => CronSchedule::parse(expression).map(|_| ()),
        TriggerSpec::Interval { every_secs } if *every_secs < MIN_INTERVAL_SECS => {
            Err(AutoloomError::config(format!(
                "interval of {every_secs}s is below the {MIN_INTERVAL_SECS}s minimum"
            )))
        }
        _ => Ok(()),
    }
}

/// Next fire time strictly after `reference`.
///
/// `None` means the trigger will not fire again on its own: a `Once` whose
/// time has passed, or a dependency-driven job.
pub fn next_fire_after(
    trigger: &TriggerSpec,
    reference: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>> {
    validate(trigger)?;
    Ok(match trigger {
        TriggerSpec::Cron { expression } => CronSchedule::parse(expression)?.next_after(reference),
        TriggerSpec::Interval { every_secs } => {
            Some(reference + Duration::seconds(*every_secs as i64))
        }
        TriggerSpec::Once { at } => (*at > reference).then_some(*at),
        TriggerSpec::OnDependencySatisfied => None,
    })
}

/// First fire time of a job created at `created_at`.
///
/// A `Once` in the past still fires once, on the next tick.
pub fn initial_fire_time(
    trigger: &TriggerSpec,
    created_at: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>> {
    match trigger {
        TriggerSpec::Once { at } => Ok(Some(*at)),
        other => next_fire_after(other, created_at),
    }
}
