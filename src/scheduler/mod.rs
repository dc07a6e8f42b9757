use crate::config::ConfigError;
use crate::metrics::{self, RunState, UPDATE_RUN_SECONDS};
use crate::reconciler::Reconciler;
use chrono::{DateTime, Local, TimeZone};
use croner::Cron;
use std::fmt;
use std::time::Duration;
use tracing::{debug, error, info};

/// Fallback delay if a validated cron expression ever stops yielding occurrences
const CRON_FALLBACK_DELAY: Duration = Duration::from_secs(60);

/// When the next reconciliation cycle starts. Resolved once at startup.
pub enum Schedule {
    Interval(Duration),
    Cron { expression: String, cron: Cron },
}

impl fmt::Debug for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Interval(d) => f.debug_tuple("Interval").field(d).finish(),
            Self::Cron { expression, .. } => f.debug_tuple("Cron").field(expression).finish(),
        }
    }
}

impl Schedule {
    /// Fixed interval from a string such as `30s`, `5m`, `6h`, `3d`, `1w`, or `15` (minutes).
    pub fn interval(raw: &str) -> Result<Self, ConfigError> {
        parse_interval(raw).map(Self::Interval)
    }

    /// Cron schedule. The expression must parse and have at least one future occurrence.
    pub fn cron(expression: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidCron {
            value: expression.to_string(),
            reason,
        };

        let cron = Cron::new(expression.trim())
            .parse()
            .map_err(|e| invalid(e.to_string()))?;

        cron.find_next_occurrence(&Local::now(), false)
            .map_err(|e| invalid(e.to_string()))?;

        Ok(Self::Cron {
            expression: expression.trim().to_string(),
            cron,
        })
    }

    pub fn fixed_interval(&self) -> Option<Duration> {
        match self {
            Self::Interval(d) => Some(*d),
            Self::Cron { .. } => None,
        }
    }

    /// Delay until the next cycle, measured from the local clock.
    pub fn next_delay(&self) -> Duration {
        self.next_delay_from(&Local::now())
    }

    /// Delay until the next cycle after `now`.
    ///
    /// In cron mode the next occurrence is strictly after `now` and one extra
    /// second is added so the cycle never fires early.
    pub fn next_delay_from<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> Duration {
        match self {
            Self::Interval(d) => *d,
            Self::Cron { expression, cron } => match cron.find_next_occurrence(now, false) {
                Ok(next) => {
                    let secs = next.signed_duration_since(now.clone()).num_seconds().max(0) as u64;
                    debug!(
                        "Based on the cron schedule '{}', next run is in {}s",
                        expression,
                        secs + 1
                    );
                    Duration::from_secs(secs + 1)
                },
                Err(e) => {
                    error!(
                        "Cron schedule '{}' has no next occurrence ({}), retrying in {}s",
                        expression,
                        e,
                        CRON_FALLBACK_DELAY.as_secs()
                    );
                    CRON_FALLBACK_DELAY
                },
            },
        }
    }
}

/// Parse `<integer><unit>` with unit in s, m, h, d, w. A bare integer is minutes.
pub fn parse_interval(raw: &str) -> Result<Duration, ConfigError> {
    let raw = raw.trim();
    let invalid = |reason: &str| ConfigError::InvalidInterval {
        value: raw.to_string(),
        reason: reason.to_string(),
    };

    if let Ok(minutes) = raw.parse::<u64>() {
        return minutes
            .checked_mul(60)
            .map(Duration::from_secs)
            .ok_or_else(|| invalid("value too large"));
    }

    let Some(unit) = raw.chars().last() else {
        return Err(invalid("empty value"));
    };
    let value: u64 = raw[..raw.len() - unit.len_utf8()]
        .parse()
        .map_err(|_| invalid("expected a whole number followed by one of s, m, h, d, w"))?;

    let seconds_per_unit = match unit {
        's' => 1,
        'm' => 60,
        'h' => 3600,
        'd' => 86_400,
        'w' => 604_800,
        _ => return Err(invalid("unknown unit, expected one of s, m, h, d, w")),
    };

    value
        .checked_mul(seconds_per_unit)
        .map(Duration::from_secs)
        .ok_or_else(|| invalid("value too large"))
}

/// Run reconciliation cycles forever: sleep, run, repeat. Cycles never overlap.
pub async fn run(schedule: &Schedule, reconciler: &Reconciler) {
    loop {
        let delay = schedule.next_delay();
        info!("Sleeping for {}s", delay.as_secs());
        metrics::set_state(RunState::Sleeping);
        tokio::time::sleep(delay).await;

        metrics::set_state(RunState::Running);
        info!("Starting update run");
        let timer = UPDATE_RUN_SECONDS.start_timer();
        let outcomes = reconciler.run_cycle().await;
        timer.observe_duration();

        let updated = outcomes.iter().filter(|o| o.changed).count();
        info!(
            "Update run finished: {} workloads checked, {} updated",
            outcomes.len(),
            updated
        );
    }
}
