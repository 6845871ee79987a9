//! Deterministic date-range chunking for download history.
//!
//! Chunks are anchored at a package's history start, so the boundaries of
//! every closed chunk are identical no matter which day the plan is computed
//! on. Only the trailing chunk moves as the as-of date advances.

use serde::{Deserialize, Serialize};
use time::{Date, Duration};

use super::types::{Granularity, format_date, iso_date};

/// Distance in days between a full chunk's first and last day.
pub const DEFAULT_CHUNK_SIZE_DAYS: u32 = 500;

/// Inclusive calendar-day range used as the caching unit for series data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateChunk {
    #[serde(with = "iso_date")]
    pub from: Date,
    #[serde(with = "iso_date")]
    pub to: Date,
}

impl DateChunk {
    /// A chunk is closed once its last day is strictly before `today`.
    pub fn is_immutable(&self, today: Date) -> bool {
        self.to < today
    }

    /// Number of calendar days covered, both ends included.
    pub fn len_days(&self) -> i64 {
        (self.to - self.from).whole_days() + 1
    }

    pub fn contains(&self, day: Date) -> bool {
        self.from <= day && day <= self.to
    }

    pub fn overlaps(&self, from: Date, to: Date) -> bool {
        self.from <= to && from <= self.to
    }

    /// Storage key for this chunk of `subject`'s series.
    pub fn cache_key(&self, subject: &str, granularity: Granularity) -> String {
        series_key(subject, self.from, self.to, granularity)
    }
}

/// Render a series key as `subject|from|to|granularity`.
pub fn series_key(subject: &str, from: Date, to: Date, granularity: Granularity) -> String {
    format!(
        "{subject}|{}|{}|{granularity}",
        format_date(from),
        format_date(to)
    )
}

/// Split `[start, as_of]` into consecutive chunks.
///
/// Each chunk ends `chunk_size_days` after it starts and the next chunk
/// begins on the following day. The final chunk is clamped to `as_of`, so it
/// may be shorter. A start after `as_of` yields no chunks; a zero size is
/// treated as one day.
pub fn generate_chunks(start: Date, as_of: Date, chunk_size_days: u32) -> Vec<DateChunk> {
    let span = Duration::days(i64::from(chunk_size_days.max(1)));
    let mut chunks = Vec::new();
    let mut from = start;

    while from <= as_of {
        let to = from.saturating_add(span).min(as_of);
        chunks.push(DateChunk { from, to });
        match to.next_day() {
            Some(next) => from = next,
            None => break,
        }
    }

    chunks
}
