use async_trait::async_trait;
use serde_json::Value;
use sqlx::{query, query_as};
use time::{Date, OffsetDateTime};

use crate::cache::{CacheBackend, CacheEntry, CacheError, CacheKey, WriteOutcome};
use crate::domain::types::Granularity;

use super::{BACKEND, PostgresStore, map_sqlx_error};

#[derive(Debug, sqlx::FromRow)]
struct StatsCacheRow {
    subject_id: String,
    range_from: Option<Date>,
    range_to: Option<Date>,
    granularity: Option<String>,
    payload: Value,
    fetched_at: OffsetDateTime,
    expires_at: Option<OffsetDateTime>,
    immutable: bool,
}

impl TryFrom<StatsCacheRow> for CacheEntry {
    type Error = CacheError;

    fn try_from(row: StatsCacheRow) -> Result<Self, Self::Error> {
        let key = match (row.range_from, row.range_to) {
            (Some(from), Some(to)) => {
                let granularity = row
                    .granularity
                    .as_deref()
                    .unwrap_or("daily")
                    .parse::<Granularity>()
                    .map_err(|err| CacheError::backend(BACKEND, err))?;
                CacheKey::Series {
                    subject: row.subject_id,
                    from,
                    to,
                    granularity,
                }
            }
            _ => CacheKey::Point {
                subject: row.subject_id,
            },
        };

        Ok(CacheEntry {
            key,
            payload: row.payload,
            fetched_at: row.fetched_at,
            expires_at: row.expires_at,
            immutable: row.immutable,
        })
    }
}

const SELECT_COLUMNS: &str = "subject_id, range_from, range_to, granularity, payload, \
     fetched_at, expires_at, immutable";

#[async_trait]
impl CacheBackend for PostgresStore {
    fn name(&self) -> &'static str {
        BACKEND
    }

    async fn load(&self, key: &CacheKey) -> Result<Option<CacheEntry>, CacheError> {
        let sql = format!("SELECT {SELECT_COLUMNS} FROM stats_cache WHERE cache_key = $1");
        let row = query_as::<_, StatsCacheRow>(&sql)
            .bind(key.render())
            .fetch_optional(self.pool())
            .await
            .map_err(map_sqlx_error)?;

        row.map(CacheEntry::try_from).transpose()
    }

    async fn load_many(&self, keys: &[CacheKey]) -> Result<Vec<CacheEntry>, CacheError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let rendered: Vec<String> = keys.iter().map(CacheKey::render).collect();
        let sql = format!("SELECT {SELECT_COLUMNS} FROM stats_cache WHERE cache_key = ANY($1)");
        let rows = query_as::<_, StatsCacheRow>(&sql)
            .bind(&rendered)
            .fetch_all(self.pool())
            .await
            .map_err(map_sqlx_error)?;

        rows.into_iter().map(CacheEntry::try_from).collect()
    }

    async fn store(&self, entry: CacheEntry) -> Result<WriteOutcome, CacheError> {
        let (range_from, range_to) = entry.key.range().unzip();
        let granularity = entry.key.granularity().map(|g| g.as_str());

        let result = query(
            r#"
            INSERT INTO stats_cache
                (cache_key, subject_id, range_from, range_to, granularity,
                 payload, fetched_at, expires_at, immutable)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (cache_key) DO UPDATE SET
                payload = EXCLUDED.payload,
                fetched_at = EXCLUDED.fetched_at,
                expires_at = EXCLUDED.expires_at,
                immutable = EXCLUDED.immutable
            WHERE stats_cache.immutable = FALSE
            "#,
        )
        .bind(entry.key.render())
        .bind(entry.key.subject())
        .bind(range_from)
        .bind(range_to)
        .bind(granularity)
        .bind(&entry.payload)
        .bind(entry.fetched_at)
        .bind(entry.expires_at)
        .bind(entry.immutable)
        .execute(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        Ok(if result.rows_affected() == 0 {
            WriteOutcome::Rejected
        } else {
            WriteOutcome::Written
        })
    }

    async fn prune_superseded_before(&self, cutoff: OffsetDateTime) -> Result<u64, CacheError> {
        let result = query(
            r#"
            DELETE FROM stats_cache AS old
            WHERE old.immutable = FALSE
              AND old.range_from IS NOT NULL
              AND old.expires_at IS NOT NULL
              AND old.expires_at < $1
              AND EXISTS (
                  SELECT 1 FROM stats_cache AS newer
                  WHERE newer.subject_id = old.subject_id
                    AND newer.range_from = old.range_from
                    AND newer.range_to > old.range_to
              )
            "#,
        )
        .bind(cutoff)
        .execute(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        Ok(result.rows_affected())
    }
}
