//! Daily download series and the reductions computed over them.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use time::{Date, Duration};

use super::types::{Bin, iso_date};

/// Number of trailing days averaged into `rate_per_day`.
pub const RATE_WINDOW_DAYS: i64 = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyDownloads {
    #[serde(with = "iso_date")]
    pub day: Date,
    pub downloads: u64,
}

/// One point of a binned series, keyed by the bucket's first day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinnedPoint {
    #[serde(with = "iso_date")]
    pub start: Date,
    pub downloads: u64,
}

/// Ascending, day-unique series of daily download counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DailySeries {
    points: Vec<DailyDownloads>,
}

impl DailySeries {
    pub fn new(points: impl IntoIterator<Item = DailyDownloads>) -> Self {
        let mut series = Self::default();
        series.splice(points);
        series
    }

    pub fn points(&self) -> &[DailyDownloads] {
        &self.points
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn first_day(&self) -> Option<Date> {
        self.points.first().map(|point| point.day)
    }

    pub fn last_day(&self) -> Option<Date> {
        self.points.last().map(|point| point.day)
    }

    /// Merge `incoming` into the series. Later values win for a repeated day.
    pub fn splice(&mut self, incoming: impl IntoIterator<Item = DailyDownloads>) {
        let mut merged: BTreeMap<Date, u64> = self
            .points
            .drain(..)
            .map(|point| (point.day, point.downloads))
            .collect();
        for point in incoming {
            merged.insert(point.day, point.downloads);
        }
        self.points = merged
            .into_iter()
            .map(|(day, downloads)| DailyDownloads { day, downloads })
            .collect();
    }

    pub fn total(&self) -> u64 {
        self.points
            .iter()
            .fold(0u64, |acc, point| acc.saturating_add(point.downloads))
    }

    /// Mean of the daily points in the window ending the day before `as_of`.
    ///
    /// Returns `None` when none of the trailing days have data.
    pub fn rate_per_day(&self, as_of: Date) -> Option<f64> {
        let window_start = as_of.saturating_sub(Duration::days(RATE_WINDOW_DAYS));
        let window: Vec<u64> = self
            .points
            .iter()
            .filter(|point| point.day >= window_start && point.day < as_of)
            .map(|point| point.downloads)
            .collect();

        if window.is_empty() {
            return None;
        }

        let sum: u64 = window.iter().fold(0u64, |acc, value| acc.saturating_add(*value));
        Some(sum as f64 / window.len() as f64)
    }

    /// Points whose day falls in `[from, to]`.
    pub fn filter_range(&self, from: Date, to: Date) -> DailySeries {
        DailySeries {
            points: self
                .points
                .iter()
                .copied()
                .filter(|point| point.day >= from && point.day <= to)
                .collect(),
        }
    }

    /// Sum points into calendar buckets.
    pub fn bin(&self, bin: Bin) -> Vec<BinnedPoint> {
        let mut buckets: BTreeMap<Date, u64> = BTreeMap::new();
        for point in &self.points {
            let entry = buckets.entry(bin.bucket_start(point.day)).or_default();
            *entry = entry.saturating_add(point.downloads);
        }
        buckets
            .into_iter()
            .map(|(start, downloads)| BinnedPoint { start, downloads })
            .collect()
    }
}
