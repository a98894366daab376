use super::model::{CanonicalRow, RawRow};
use crate::model::{
    format_timestamp, parse_timestamp, CanonicalRecord, RawRecord, ResourceType, UpsertOutcome,
};
use crate::store::{EnrichedStore, RawStore};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, instrument};

pub type Pool = SqlitePool;

/// Rows fetched per round-trip by `stream_all`.
const STREAM_BATCH: i64 = 500;

const RAW_SELECT: &str = "SELECT r.natural_id, r.updated_at, r.payload, \
        (SELECT GROUP_CONCAT(s.scope_id) FROM raw_record_scopes s \
          WHERE s.resource = r.resource AND s.natural_id = r.natural_id) AS scopes \
     FROM raw_records r";

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let in_memory = normalized.starts_with("sqlite::memory");
    let options = SqliteConnectOptions::from_str(&normalized)?
        .create_if_missing(true)
        .journal_mode(if in_memory {
            SqliteJournalMode::Memory
        } else {
            SqliteJournalMode::Wal
        })
        .synchronous(SqliteSynchronous::Full)
        .busy_timeout(Duration::from_secs(5));
    // Every connection to an in-memory URL would otherwise see its own database.
    let max_connections = if in_memory { 1 } else { 8 };
    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/` and ensure the parent
/// directory exists. Leaves in-memory URLs untouched. Returns possibly-updated URL.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);
    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };
    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
        _ => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let mut rebuilt = format!("sqlite://{expanded_path}");
    if let Some(q) = query_part {
        rebuilt.push('?');
        rebuilt.push_str(q);
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

fn scope_param(scope: u64) -> Result<i64> {
    i64::try_from(scope).map_err(|_| anyhow!("scope id {scope} out of range"))
}

/// SQLite-backed implementation of both record stores.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: Pool,
}

impl SqliteStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    async fn raw_page(
        &self,
        resource: ResourceType,
        scope: Option<i64>,
        after: &str,
    ) -> Result<Vec<RawRecord>> {
        let sql = format!(
            "{RAW_SELECT} WHERE r.resource = ? AND r.natural_id > ? \
               AND (? IS NULL OR EXISTS (SELECT 1 FROM raw_record_scopes f \
                    WHERE f.resource = r.resource AND f.natural_id = r.natural_id AND f.scope_id = ?)) \
             ORDER BY r.natural_id LIMIT ?"
        );
        let rows: Vec<RawRow> = sqlx::query_as(&sql)
            .bind(resource.as_str())
            .bind(after)
            .bind(scope)
            .bind(scope)
            .bind(STREAM_BATCH)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(|row| row.into_record(resource)).collect()
    }
}

#[async_trait]
impl RawStore for SqliteStore {
    #[instrument(skip_all, fields(resource = %resource, scope = ?scope))]
    async fn find_max_updated(
        &self,
        resource: ResourceType,
        scope: Option<u64>,
    ) -> Result<Option<DateTime<Utc>>> {
        let max: Option<String> = match scope {
            None => {
                sqlx::query_scalar("SELECT MAX(updated_at) FROM raw_records WHERE resource = ?")
                    .bind(resource.as_str())
                    .fetch_one(&self.pool)
                    .await?
            }
            Some(scope) => {
                sqlx::query_scalar(
                    "SELECT MAX(r.updated_at) FROM raw_records r \
                     JOIN raw_record_scopes s ON s.resource = r.resource AND s.natural_id = r.natural_id \
                     WHERE r.resource = ? AND s.scope_id = ?",
                )
                .bind(resource.as_str())
                .bind(scope_param(scope)?)
                .fetch_one(&self.pool)
                .await?
            }
        };
        max.map(|s| parse_timestamp(&s).ok_or_else(|| anyhow!("bad stored timestamp {s:?}")))
            .transpose()
    }

    #[instrument(skip_all, fields(resource = %record.resource, id = %record.natural_id))]
    async fn upsert(&self, record: &RawRecord) -> Result<UpsertOutcome> {
        let payload = serde_json::to_string(&record.payload)?;
        let updated_at = record.updated_at.as_ref().map(format_timestamp);
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            "INSERT OR IGNORE INTO raw_records (resource, natural_id, updated_at, payload) VALUES (?, ?, ?, ?)",
        )
        .bind(record.resource.as_str())
        .bind(&record.natural_id)
        .bind(&updated_at)
        .bind(&payload)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let mut outcome = if inserted > 0 {
            UpsertOutcome::Inserted
        } else {
            let changed = sqlx::query(
                "UPDATE raw_records SET updated_at = ?, payload = ? \
                 WHERE resource = ? AND natural_id = ? AND (payload IS NOT ? OR updated_at IS NOT ?)",
            )
            .bind(&updated_at)
            .bind(&payload)
            .bind(record.resource.as_str())
            .bind(&record.natural_id)
            .bind(&payload)
            .bind(&updated_at)
            .execute(&mut *tx)
            .await?
            .rows_affected();
            if changed > 0 {
                UpsertOutcome::Updated
            } else {
                UpsertOutcome::Unchanged
            }
        };

        for scope in &record.scopes {
            let added = sqlx::query(
                "INSERT OR IGNORE INTO raw_record_scopes (resource, natural_id, scope_id) VALUES (?, ?, ?)",
            )
            .bind(record.resource.as_str())
            .bind(&record.natural_id)
            .bind(scope_param(*scope)?)
            .execute(&mut *tx)
            .await?
            .rows_affected();
            if added > 0 && outcome == UpsertOutcome::Unchanged {
                outcome = UpsertOutcome::Updated;
            }
        }

        tx.commit().await?;
        debug!(?outcome, "raw upsert");
        Ok(outcome)
    }

    fn stream_all(
        &self,
        resource: ResourceType,
        scope: Option<u64>,
    ) -> BoxStream<'_, Result<RawRecord>> {
        let scope = match scope.map(scope_param).transpose() {
            Ok(scope) => scope,
            Err(err) => return stream::once(async move { Err(err) }).boxed(),
        };
        stream::try_unfold((String::new(), false), move |(after, done)| async move {
            if done {
                return Ok::<_, anyhow::Error>(None);
            }
            let page = self.raw_page(resource, scope, &after).await?;
            let done = (page.len() as i64) < STREAM_BATCH;
            let after = page.last().map(|r| r.natural_id.clone()).unwrap_or(after);
            Ok::<_, anyhow::Error>(Some((page, (after, done))))
        })
        .map_ok(|page| stream::iter(page.into_iter().map(Ok::<_, anyhow::Error>)))
        .try_flatten()
        .boxed()
    }

    async fn get(&self, resource: ResourceType, natural_id: &str) -> Result<Option<RawRecord>> {
        let sql = format!("{RAW_SELECT} WHERE r.resource = ? AND r.natural_id = ?");
        let row: Option<RawRow> = sqlx::query_as(&sql)
            .bind(resource.as_str())
            .bind(natural_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| row.into_record(resource)).transpose()
    }

    async fn count(&self, resource: ResourceType) -> Result<i64> {
        let cnt: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM raw_records WHERE resource = ?")
            .bind(resource.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(cnt)
    }

    async fn fan_out_mark(
        &self,
        child: ResourceType,
        parent_id: &str,
    ) -> Result<Option<Option<DateTime<Utc>>>> {
        let mark: Option<Option<String>> = sqlx::query_scalar(
            "SELECT parent_updated_at FROM fan_out_marks WHERE resource = ? AND parent_id = ?",
        )
        .bind(child.as_str())
        .bind(parent_id)
        .fetch_optional(&self.pool)
        .await?;
        let Some(mark) = mark else {
            return Ok(None);
        };
        let ts = mark
            .map(|s| parse_timestamp(&s).with_context(|| format!("bad fan-out mark {s:?}")))
            .transpose()?;
        Ok(Some(ts))
    }

    #[instrument(skip_all, fields(resource = %child, parent = %parent_id))]
    async fn set_fan_out_mark(
        &self,
        child: ResourceType,
        parent_id: &str,
        parent_updated_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO fan_out_marks (resource, parent_id, parent_updated_at) VALUES (?, ?, ?) \
             ON CONFLICT(resource, parent_id) DO UPDATE SET parent_updated_at = excluded.parent_updated_at",
        )
        .bind(child.as_str())
        .bind(parent_id)
        .bind(parent_updated_at.as_ref().map(format_timestamp))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl EnrichedStore for SqliteStore {
    #[instrument(skip_all, fields(resource = %record.resource, id = %record.natural_id))]
    async fn upsert(&self, record: &CanonicalRecord) -> Result<UpsertOutcome> {
        let fields = serde_json::to_string(&record.fields)?;
        let mut tx = self.pool.begin().await?;
        let inserted = sqlx::query(
            "INSERT OR IGNORE INTO canonical_records (resource, natural_id, domain_id, fields) VALUES (?, ?, ?, ?)",
        )
        .bind(record.resource.as_str())
        .bind(&record.natural_id)
        .bind(&record.domain_id)
        .bind(&fields)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let outcome = if inserted > 0 {
            UpsertOutcome::Inserted
        } else {
            let changed = sqlx::query(
                "UPDATE canonical_records SET domain_id = ?, fields = ? \
                 WHERE resource = ? AND natural_id = ? AND (fields IS NOT ? OR domain_id IS NOT ?)",
            )
            .bind(&record.domain_id)
            .bind(&fields)
            .bind(record.resource.as_str())
            .bind(&record.natural_id)
            .bind(&fields)
            .bind(&record.domain_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
            if changed > 0 {
                UpsertOutcome::Updated
            } else {
                UpsertOutcome::Unchanged
            }
        };
        tx.commit().await?;
        Ok(outcome)
    }

    async fn get(
        &self,
        resource: ResourceType,
        natural_id: &str,
    ) -> Result<Option<CanonicalRecord>> {
        let row: Option<CanonicalRow> = sqlx::query_as(
            "SELECT natural_id, domain_id, fields FROM canonical_records WHERE resource = ? AND natural_id = ?",
        )
        .bind(resource.as_str())
        .bind(natural_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| row.into_record(resource)).transpose()
    }

    async fn count(&self, resource: ResourceType) -> Result<i64> {
        let cnt: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM canonical_records WHERE resource = ?")
                .bind(resource.as_str())
                .fetch_one(&self.pool)
                .await?;
        Ok(cnt)
    }
}
