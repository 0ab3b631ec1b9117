//! Budget periods and spend query ranges.

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Period a budget ceiling applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetPeriod {
    #[default]
    Daily,
    Monthly,
    Total,
}

impl BudgetPeriod {
    pub fn as_str(&self) -> &'static str {
        match self {
            BudgetPeriod::Daily => "daily",
            BudgetPeriod::Monthly => "monthly",
            BudgetPeriod::Total => "total",
        }
    }

    pub fn spend_period(&self) -> SpendPeriod {
        match self {
            BudgetPeriod::Daily => SpendPeriod::Today,
            BudgetPeriod::Monthly => SpendPeriod::ThisMonth,
            BudgetPeriod::Total => SpendPeriod::AllTime,
        }
    }
}

impl std::fmt::Display for BudgetPeriod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Window over which spend is summed. `Today` and `ThisMonth` are UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SpendPeriod {
    Today,
    ThisMonth,
    AllTime,
    /// Inclusive on both ends.
    Range {
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    },
}

impl SpendPeriod {
    /// Lower bound of the period relative to `now`, `None` for all time.
    pub fn since(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            SpendPeriod::Today => Some(start_of_day(now.date_naive())),
            SpendPeriod::ThisMonth => Some(start_of_month(now)),
            SpendPeriod::AllTime => None,
            SpendPeriod::Range { since, .. } => Some(*since),
        }
    }

    pub fn contains(&self, timestamp: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        match self {
            SpendPeriod::AllTime => true,
            SpendPeriod::Range { since, until } => timestamp >= *since && timestamp <= *until,
            SpendPeriod::Today | SpendPeriod::ThisMonth => {
                self.since(now).map_or(true, |since| timestamp >= since)
            }
        }
    }
}

pub(crate) fn start_of_day(date: NaiveDate) -> DateTime<Utc> {
    Utc.from_utc_datetime(&date.and_time(chrono::NaiveTime::MIN))
}

pub(crate) fn start_of_month(now: DateTime<Utc>) -> DateTime<Utc> {
    let first = now.date_naive().with_day(1).unwrap_or_else(|| now.date_naive());
    start_of_day(first)
}

/// Named relative ranges accepted by [`resolve_period`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangePreset {
    Last1h,
    Last24h,
    Last7d,
    Last30d,
}

impl RangePreset {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "last_1h" => Some(Self::Last1h),
            "last_24h" => Some(Self::Last24h),
            "last_7d" => Some(Self::Last7d),
            "last_30d" => Some(Self::Last30d),
            _ => None,
        }
    }

    pub fn duration(&self) -> Duration {
        match self {
            Self::Last1h => Duration::hours(1),
            Self::Last24h => Duration::hours(24),
            Self::Last7d => Duration::days(7),
            Self::Last30d => Duration::days(30),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PeriodError {
    #[error("Invalid range '{0}'. Supported: today, this_month, all_time, last_1h, last_24h, last_7d, last_30d")]
    UnknownRange(String),

    #[error("Invalid '{field}' timestamp: {source}")]
    Timestamp {
        field: &'static str,
        #[source]
        source: chrono::ParseError,
    },
}

fn parse_timestamp(field: &'static str, s: &str) -> Result<DateTime<Utc>, PeriodError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|source| PeriodError::Timestamp { field, source })
}

/// Resolve a spend period from operator input.
///
/// Priority:
/// 1. Explicit `since`/`until` (RFC 3339) override everything
/// 2. `range`: a calendar name or a relative preset
/// 3. Default: all time
pub fn resolve_period(
    range: Option<&str>,
    since: Option<&str>,
    until: Option<&str>,
) -> Result<SpendPeriod, PeriodError> {
    let now = Utc::now();

    if since.is_some() || until.is_some() {
        let since = match since {
            Some(s) => parse_timestamp("since", s)?,
            None => DateTime::<Utc>::MIN_UTC,
        };
        let until = match until {
            Some(u) => parse_timestamp("until", u)?,
            None => now,
        };
        return Ok(SpendPeriod::Range { since, until });
    }

    match range {
        None | Some("all_time") => Ok(SpendPeriod::AllTime),
        Some("today") => Ok(SpendPeriod::Today),
        Some("this_month") => Ok(SpendPeriod::ThisMonth),
        Some(other) => {
            let preset =
                RangePreset::parse(other).ok_or_else(|| PeriodError::UnknownRange(other.to_string()))?;
            Ok(SpendPeriod::Range {
                since: now - preset.duration(),
                until: now,
            })
        }
    }
}
