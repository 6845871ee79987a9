//! Cache key definitions.
//!
//! Series keys render as `subject|from|to|granularity`; point keys render as
//! a prefixed subject id such as `npm:@tanstack/react-query` or
//! `repo:TanStack/query`.

use std::fmt;

use time::Date;

use crate::domain::chunks::{DateChunk, series_key};
use crate::domain::types::Granularity;

pub const NPM_PREFIX: &str = "npm:";
pub const REPO_PREFIX: &str = "repo:";
pub const OWNER_PREFIX: &str = "owner:";
pub const LIBRARY_PREFIX: &str = "library:";
pub const ORG_PREFIX: &str = "org:";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    /// A bounded slice of a time series.
    Series {
        subject: String,
        from: Date,
        to: Date,
        granularity: Granularity,
    },
    /// A point-in-time rollup or metric snapshot.
    Point { subject: String },
}

impl CacheKey {
    /// Daily download chunk of an npm package.
    pub fn chunk(package: &str, chunk: &DateChunk) -> Self {
        CacheKey::Series {
            subject: package.to_string(),
            from: chunk.from,
            to: chunk.to,
            granularity: Granularity::Daily,
        }
    }

    pub fn package_totals(package: &str) -> Self {
        Self::point(NPM_PREFIX, package)
    }

    pub fn repo(repository: &str) -> Self {
        Self::point(REPO_PREFIX, repository)
    }

    pub fn owner(org: &str) -> Self {
        Self::point(OWNER_PREFIX, org)
    }

    pub fn library(id: &str) -> Self {
        Self::point(LIBRARY_PREFIX, id)
    }

    pub fn org(org: &str) -> Self {
        Self::point(ORG_PREFIX, org)
    }

    fn point(prefix: &str, id: &str) -> Self {
        CacheKey::Point {
            subject: format!("{prefix}{id}"),
        }
    }

    pub fn subject(&self) -> &str {
        match self {
            CacheKey::Series { subject, .. } | CacheKey::Point { subject } => subject,
        }
    }

    pub fn range(&self) -> Option<(Date, Date)> {
        match self {
            CacheKey::Series { from, to, .. } => Some((*from, *to)),
            CacheKey::Point { .. } => None,
        }
    }

    pub fn granularity(&self) -> Option<Granularity> {
        match self {
            CacheKey::Series { granularity, .. } => Some(*granularity),
            CacheKey::Point { .. } => None,
        }
    }

    /// The persisted primary key.
    pub fn render(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheKey::Series {
                subject,
                from,
                to,
                granularity,
            } => f.write_str(&series_key(subject, *from, *to, *granularity)),
            CacheKey::Point { subject } => f.write_str(subject),
        }
    }
}
