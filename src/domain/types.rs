//! Shared domain enumerations and calendar helpers.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::macros::format_description;
use time::{Date, Duration};

use super::error::DomainError;

const ISO_DATE: &[time::format_description::BorrowedFormatItem<'static>] =
    format_description!("[year]-[month]-[day]");

/// Parse a `YYYY-MM-DD` calendar date.
pub fn parse_date(value: &str) -> Result<Date, DomainError> {
    Date::parse(value.trim(), ISO_DATE)
        .map_err(|err| DomainError::validation(format!("invalid date `{value}`: {err}")))
}

/// Format a calendar date as `YYYY-MM-DD`.
pub fn format_date(date: Date) -> String {
    date.format(ISO_DATE).unwrap_or_else(|_| date.to_string())
}

/// Serde adapter storing dates as `YYYY-MM-DD` strings.
pub mod iso_date {
    use serde::{Deserialize, Deserializer, Serializer};
    use time::Date;

    pub fn serialize<S: Serializer>(date: &Date, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_date(*date))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Date, D::Error> {
        let raw = String::deserialize(deserializer)?;
        super::parse_date(&raw).map_err(serde::de::Error::custom)
    }

    pub mod option {
        use serde::{Deserialize, Deserializer, Serializer};
        use time::Date;

        pub fn serialize<S: Serializer>(
            date: &Option<Date>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match date {
                Some(date) => serializer.serialize_some(&super::super::format_date(*date)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Date>, D::Error> {
            Option::<String>::deserialize(deserializer)?
                .map(|raw| super::super::parse_date(&raw).map_err(serde::de::Error::custom))
                .transpose()
        }
    }
}

/// Resolution of a stored time series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    Daily,
}

impl Granularity {
    pub fn as_str(self) -> &'static str {
        match self {
            Granularity::Daily => "daily",
        }
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Granularity {
    type Err = DomainError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "daily" => Ok(Granularity::Daily),
            other => Err(DomainError::validation(format!(
                "unknown granularity `{other}`"
            ))),
        }
    }
}

/// Bucket size used when presenting a daily series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Bin {
    #[default]
    Daily,
    Weekly,
    Monthly,
}

impl Bin {
    pub fn as_str(self) -> &'static str {
        match self {
            Bin::Daily => "daily",
            Bin::Weekly => "weekly",
            Bin::Monthly => "monthly",
        }
    }

    /// First day of the bucket that contains `day`.
    ///
    /// Weekly buckets start on the ISO week's Monday; monthly buckets on the
    /// first of the month.
    pub fn bucket_start(self, day: Date) -> Date {
        match self {
            Bin::Daily => day,
            Bin::Weekly => {
                let offset = i64::from(day.weekday().number_days_from_monday());
                day.saturating_sub(Duration::days(offset))
            }
            Bin::Monthly => day.replace_day(1).unwrap_or(day),
        }
    }
}

impl FromStr for Bin {
    type Err = DomainError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "daily" | "day" => Ok(Bin::Daily),
            "weekly" | "week" => Ok(Bin::Weekly),
            "monthly" | "month" => Ok(Bin::Monthly),
            other => Err(DomainError::validation(format!("unknown bin `{other}`"))),
        }
    }
}

/// Date window requested by a comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeRange {
    LastDays(u32),
    All,
    Between { from: Date, to: Date },
}

impl Default for TimeRange {
    fn default() -> Self {
        TimeRange::LastDays(365)
    }
}

impl TimeRange {
    /// Resolve to concrete inclusive bounds.
    ///
    /// `earliest` is the first day any compared package has history for and
    /// only matters for [`TimeRange::All`].
    pub fn resolve(self, today: Date, earliest: Date) -> (Date, Date) {
        match self {
            TimeRange::LastDays(days) => {
                let span = i64::from(days.max(1)) - 1;
                (today.saturating_sub(Duration::days(span)), today)
            }
            TimeRange::All => (earliest.min(today), today),
            TimeRange::Between { from, to } => (from, to.min(today)),
        }
    }

    /// Build a range from either a preset label or explicit bounds.
    pub fn from_parts(
        label: Option<&str>,
        from: Option<&str>,
        to: Option<&str>,
    ) -> Result<Self, DomainError> {
        match (from, to) {
            (Some(from), Some(to)) => {
                let from = parse_date(from)?;
                let to = parse_date(to)?;
                if from > to {
                    return Err(DomainError::validation(format!(
                        "range start {from} is after range end {to}"
                    )));
                }
                Ok(TimeRange::Between { from, to })
            }
            (Some(_), None) | (None, Some(_)) => Err(DomainError::validation(
                "explicit ranges require both `from` and `to`",
            )),
            (None, None) => match label {
                Some(label) => label.parse(),
                None => Ok(TimeRange::default()),
            },
        }
    }
}

impl FromStr for TimeRange {
    type Err = DomainError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let value = value.trim().to_ascii_lowercase();
        match value.as_str() {
            "all" => return Ok(TimeRange::All),
            "1y" | "12m" => return Ok(TimeRange::LastDays(365)),
            _ => {}
        }

        if let Some(days) = value.strip_suffix('d')
            && let Ok(days) = days.parse::<u32>()
            && days > 0
        {
            return Ok(TimeRange::LastDays(days));
        }

        if let Some((from, to)) = value.split_once("..") {
            return TimeRange::from_parts(None, Some(from), Some(to));
        }

        Err(DomainError::validation(format!("unknown range `{value}`")))
    }
}
