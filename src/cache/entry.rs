use serde::de::DeserializeOwned;
use serde_json::Value;
use time::OffsetDateTime;

use super::backend::CacheError;
use super::keys::CacheKey;

/// A stored payload together with its freshness metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub payload: Value,
    pub fetched_at: OffsetDateTime,
    /// `None` for immutable entries.
    pub expires_at: Option<OffsetDateTime>,
    pub immutable: bool,
}

impl CacheEntry {
    pub fn is_fresh(&self, now: OffsetDateTime) -> bool {
        if self.immutable {
            return true;
        }
        self.expires_at.is_none_or(|expires_at| expires_at > now)
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, CacheError> {
        serde_json::from_value(self.payload.clone()).map_err(|source| CacheError::Decode {
            key: self.key.render(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use time::macros::datetime;

    use super::*;

    fn entry(immutable: bool, expires_at: Option<OffsetDateTime>) -> CacheEntry {
        CacheEntry {
            key: CacheKey::org("tanstack"),
            payload: json!({ "total": 1 }),
            fetched_at: datetime!(2025-01-01 00:00 UTC),
            expires_at,
            immutable,
        }
    }

    #[test]
    fn mutable_entry_expires() {
        let entry = entry(false, Some(datetime!(2025-01-01 06:00 UTC)));
        assert!(entry.is_fresh(datetime!(2025-01-01 05:59 UTC)));
        assert!(!entry.is_fresh(datetime!(2025-01-01 06:00 UTC)));
    }

    #[test]
    fn immutable_entry_never_expires() {
        let entry = entry(true, None);
        assert!(entry.is_fresh(datetime!(2100-01-01 00:00 UTC)));
    }

    #[test]
    fn decode_reports_key_on_mismatch() {
        let entry = entry(true, None);
        let err = entry.decode::<Vec<u64>>().expect_err("shape mismatch");
        assert!(err.to_string().contains("org:tanstack"));
    }
}
