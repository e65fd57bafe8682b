//! SQLite-backed persistence for single-node deployments.
//!
//! One database file holds checkpoint state, job history, schedule marks, the
//! catalog cache and the connector/schedule definitions. WAL journaling keeps
//! readers off the writers' path; every write is a single statement or a
//! single transaction, so a crash leaves either the old or the new row.

use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Row, SqlitePool};

use crate::catalog::CatalogCache;
use crate::jobs::{JobQuery, JobStatus, JobStore, SyncJob};
use crate::models::{Connector, ConnectorStatus, JobId, Schedule, TriggerType};
use crate::protocol::{Catalog, StateType};
use crate::registry::ConnectorRegistry;
use crate::state::{CheckpointState, StateKey, StateSnapshot, StateStore, StateUpdate};
use crate::{Error, Result};

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    #[tracing::instrument(level = "info", skip_all, fields(path = %path.as_ref().display()))]
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| Error::backend("sqlite_store mkdir", e))?;
            }
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", path.display()))
            .map_err(|e| Error::backend("sqlite_store connect options", e))?
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(opts)
            .await
            .map_err(|e| Error::backend("sqlite_store connect", e))?;

        sqlx::query(SCHEMA)
            .execute(&pool)
            .await
            .map_err(|e| Error::backend("sqlite_store schema", e))?;

        Ok(Self { pool })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Insert or replace a connector definition. The last run status is kept.
    pub async fn upsert_connector(&self, connector: &Connector) -> Result<()> {
        connector.execution.validate()?;
        let json = encode("connector", connector)?;
        sqlx::query(
            r#"
INSERT INTO connectors (id, connector_json, status, status_at)
VALUES (?1, ?2, ?3, ?4)
ON CONFLICT(id) DO UPDATE SET connector_json = excluded.connector_json
"#,
        )
        .bind(&connector.id)
        .bind(json)
        .bind(connector.status.as_str())
        .bind(connector.status_at.map(ts))
        .execute(&self.pool)
        .await
        .map_err(|e| Error::backend("upsert connector", e))?;
        Ok(())
    }

    pub async fn upsert_schedule(&self, schedule: &Schedule) -> Result<()> {
        crate::scheduler::cron::parse_schedule(&schedule.cron_expression)?;
        let json = encode("schedule", schedule)?;
        sqlx::query(
            r#"
INSERT INTO schedules (connector_id, schedule_json)
VALUES (?1, ?2)
ON CONFLICT(connector_id) DO UPDATE SET schedule_json = excluded.schedule_json
"#,
        )
        .bind(&schedule.connector_id)
        .bind(json)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::backend("upsert schedule", e))?;
        Ok(())
    }
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS checkpoint_state (
  connector_id TEXT NOT NULL,
  stream TEXT NOT NULL,
  namespace TEXT NOT NULL DEFAULT '',
  state_type TEXT NOT NULL,
  payload_json TEXT NOT NULL,
  cursor_field_json TEXT NOT NULL,
  cursor_value_json TEXT NULL,
  records_synced INTEGER NOT NULL DEFAULT 0,
  updated_at TEXT NOT NULL,
  PRIMARY KEY (connector_id, stream, namespace)
);

CREATE TABLE IF NOT EXISTS sync_jobs (
  id TEXT PRIMARY KEY,
  connector_id TEXT NOT NULL,
  trigger_type TEXT NOT NULL,
  status TEXT NOT NULL,
  created_at TEXT NOT NULL,
  started_at TEXT NULL,
  finished_at TEXT NULL,
  stats_json TEXT NOT NULL,
  error_message TEXT NULL,
  retryable INTEGER NOT NULL,
  retry_count INTEGER NOT NULL,
  parent_run_id TEXT NULL
);
CREATE INDEX IF NOT EXISTS sj_connector_created_idx ON sync_jobs(connector_id, created_at DESC);
CREATE INDEX IF NOT EXISTS sj_status_idx ON sync_jobs(status);

CREATE TABLE IF NOT EXISTS schedule_marks (
  connector_id TEXT PRIMARY KEY,
  last_fire_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS catalog_cache (
  connector_id TEXT PRIMARY KEY,
  config_hash TEXT NOT NULL,
  catalog_json TEXT NOT NULL,
  discovered_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS connectors (
  id TEXT PRIMARY KEY,
  connector_json TEXT NOT NULL,
  status TEXT NOT NULL,
  status_at TEXT NULL
);

CREATE TABLE IF NOT EXISTS schedules (
  connector_id TEXT PRIMARY KEY,
  schedule_json TEXT NOT NULL
);
"#;

#[async_trait]
impl StateStore for SqliteStore {
    async fn get(&self, key: &StateKey) -> Result<Option<CheckpointState>> {
        let row = sqlx::query(
            r#"
SELECT connector_id, stream, namespace, state_type, payload_json, cursor_field_json,
       cursor_value_json, records_synced, updated_at
FROM checkpoint_state
WHERE connector_id = ?1 AND stream = ?2 AND namespace = ?3
"#,
        )
        .bind(&key.connector_id)
        .bind(&key.stream)
        .bind(key.namespace.as_deref().unwrap_or(""))
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Error::backend("get checkpoint", e))?;
        row.as_ref().map(row_to_checkpoint).transpose()
    }

    #[tracing::instrument(level = "debug", skip(self, update), fields(records_delta = update.records_delta))]
    async fn update(&self, key: &StateKey, update: StateUpdate) -> Result<CheckpointState> {
        let cursor_value = update.cursor_value();
        let updated_at = Utc::now();
        let row = sqlx::query(
            r#"
INSERT INTO checkpoint_state
  (connector_id, stream, namespace, state_type, payload_json, cursor_field_json,
   cursor_value_json, records_synced, updated_at)
VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
ON CONFLICT(connector_id, stream, namespace) DO UPDATE SET
  state_type = excluded.state_type,
  payload_json = excluded.payload_json,
  cursor_field_json = excluded.cursor_field_json,
  cursor_value_json = excluded.cursor_value_json,
  records_synced = checkpoint_state.records_synced + excluded.records_synced,
  updated_at = excluded.updated_at
RETURNING records_synced
"#,
        )
        .bind(&key.connector_id)
        .bind(&key.stream)
        .bind(key.namespace.as_deref().unwrap_or(""))
        .bind(update.state_type.as_str())
        .bind(encode("checkpoint payload", &update.payload)?)
        .bind(encode("cursor field", &update.cursor_field)?)
        .bind(cursor_value.as_ref().map(|v| encode("cursor value", v)).transpose()?)
        .bind(i64::try_from(update.records_delta).unwrap_or(i64::MAX))
        .bind(ts(updated_at))
        .fetch_one(&self.pool)
        .await
        .map_err(|e| Error::backend("update checkpoint", e))?;

        Ok(CheckpointState {
            connector_id: key.connector_id.clone(),
            stream: key.stream.clone(),
            namespace: key.namespace.clone(),
            state_type: update.state_type,
            payload: update.payload,
            cursor_field: update.cursor_field,
            cursor_value,
            records_synced: row.get::<i64, _>("records_synced").max(0) as u64,
            updated_at,
        })
    }

    async fn clear(
        &self,
        connector_id: &str,
        stream: Option<&str>,
        namespace: Option<&str>,
    ) -> Result<u64> {
        let res = sqlx::query(
            r#"
DELETE FROM checkpoint_state
WHERE connector_id = ?1
  AND (?2 IS NULL OR stream = ?2)
  AND (?3 IS NULL OR namespace = ?3)
"#,
        )
        .bind(connector_id)
        .bind(stream)
        .bind(namespace)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::backend("clear checkpoints", e))?;
        Ok(res.rows_affected())
    }

    async fn list(&self, connector_id: &str) -> Result<Vec<CheckpointState>> {
        let rows = sqlx::query(
            r#"
SELECT connector_id, stream, namespace, state_type, payload_json, cursor_field_json,
       cursor_value_json, records_synced, updated_at
FROM checkpoint_state
WHERE connector_id = ?1
ORDER BY stream ASC, namespace ASC
"#,
        )
        .bind(connector_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::backend("list checkpoints", e))?;
        rows.iter().map(row_to_checkpoint).collect()
    }

    #[tracing::instrument(level = "info", skip(self, snapshot))]
    async fn import_snapshot(&self, connector_id: &str, snapshot: StateSnapshot) -> Result<usize> {
        snapshot.validate_for(connector_id)?;
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Error::backend("import begin", e))?;
        sqlx::query("DELETE FROM checkpoint_state WHERE connector_id = ?1")
            .bind(connector_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| Error::backend("import delete", e))?;

        let count = snapshot.streams.len();
        for entry in snapshot.streams {
            let cp = entry.into_checkpoint(connector_id);
            sqlx::query(
                r#"
INSERT INTO checkpoint_state
  (connector_id, stream, namespace, state_type, payload_json, cursor_field_json,
   cursor_value_json, records_synced, updated_at)
VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
"#,
            )
            .bind(&cp.connector_id)
            .bind(&cp.stream)
            .bind(cp.namespace.as_deref().unwrap_or(""))
            .bind(cp.state_type.as_str())
            .bind(encode("checkpoint payload", &cp.payload)?)
            .bind(encode("cursor field", &cp.cursor_field)?)
            .bind(cp.cursor_value.as_ref().map(|v| encode("cursor value", v)).transpose()?)
            .bind(i64::try_from(cp.records_synced).unwrap_or(i64::MAX))
            .bind(ts(cp.updated_at))
            .execute(&mut *tx)
            .await
            .map_err(|e| Error::backend("import insert", e))?;
        }

        tx.commit()
            .await
            .map_err(|e| Error::backend("import commit", e))?;
        Ok(count)
    }
}

#[async_trait]
impl JobStore for SqliteStore {
    async fn insert_job(&self, job: &SyncJob) -> Result<()> {
        let res = sqlx::query(
            r#"
INSERT INTO sync_jobs
  (id, connector_id, trigger_type, status, created_at, started_at, finished_at,
   stats_json, error_message, retryable, retry_count, parent_run_id)
VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
ON CONFLICT(id) DO NOTHING
"#,
        )
        .bind(job.id.to_string())
        .bind(&job.connector_id)
        .bind(job.trigger.as_str())
        .bind(job.status.as_str())
        .bind(ts(job.created_at))
        .bind(job.started_at.map(ts))
        .bind(job.finished_at.map(ts))
        .bind(encode("job stats", &job.stats)?)
        .bind(&job.error_message)
        .bind(job.retryable)
        .bind(i64::from(job.retry_count))
        .bind(job.parent_run_id.map(|id| id.to_string()))
        .execute(&self.pool)
        .await
        .map_err(|e| Error::backend("insert job", e))?;
        if res.rows_affected() == 0 {
            return Err(Error::Conflict(format!("job {} already exists", job.id)));
        }
        Ok(())
    }

    async fn update_job(&self, job: &SyncJob) -> Result<()> {
        let res = sqlx::query(
            r#"
UPDATE sync_jobs SET
  status = ?2, started_at = ?3, finished_at = ?4, stats_json = ?5,
  error_message = ?6, retryable = ?7
WHERE id = ?1 AND status NOT IN ('completed', 'failed', 'cancelled')
"#,
        )
        .bind(job.id.to_string())
        .bind(job.status.as_str())
        .bind(job.started_at.map(ts))
        .bind(job.finished_at.map(ts))
        .bind(encode("job stats", &job.stats)?)
        .bind(&job.error_message)
        .bind(job.retryable)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::backend("update job", e))?;
        if res.rows_affected() > 0 {
            return Ok(());
        }
        match self.get_job(job.id).await? {
            Some(stored) => Err(Error::Conflict(format!(
                "job {} is already {}",
                job.id, stored.status
            ))),
            None => Err(Error::NotFound(format!("job {}", job.id))),
        }
    }

    async fn get_job(&self, id: JobId) -> Result<Option<SyncJob>> {
        let row = sqlx::query(
            r#"
SELECT id, connector_id, trigger_type, status, created_at, started_at, finished_at,
       stats_json, error_message, retryable, retry_count, parent_run_id
FROM sync_jobs
WHERE id = ?1
"#,
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Error::backend("get job", e))?;
        row.as_ref().map(row_to_job).transpose()
    }

    async fn list_jobs(&self, query: &JobQuery) -> Result<Vec<SyncJob>> {
        query.validate()?;
        let rows = sqlx::query(
            r#"
SELECT id, connector_id, trigger_type, status, created_at, started_at, finished_at,
       stats_json, error_message, retryable, retry_count, parent_run_id
FROM sync_jobs
WHERE (?1 IS NULL OR connector_id = ?1)
  AND (?2 IS NULL OR status = ?2)
  AND (?3 IS NULL OR created_at >= ?3)
ORDER BY created_at DESC
LIMIT ?4 OFFSET ?5
"#,
        )
        .bind(query.connector_id.as_deref())
        .bind(query.status.map(|s| s.as_str()))
        .bind(query.since.map(ts))
        .bind(query.limit as i64)
        .bind(query.offset as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::backend("list jobs", e))?;
        rows.iter().map(row_to_job).collect()
    }

    async fn get_schedule_mark(&self, connector_id: &str) -> Result<Option<DateTime<Utc>>> {
        let row = sqlx::query("SELECT last_fire_at FROM schedule_marks WHERE connector_id = ?1")
            .bind(connector_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Error::backend("get schedule mark", e))?;
        row.map(|r| parse_dt(r.get::<String, _>("last_fire_at").as_str()))
            .transpose()
    }

    async fn set_schedule_mark(&self, connector_id: &str, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
INSERT INTO schedule_marks (connector_id, last_fire_at)
VALUES (?1, ?2)
ON CONFLICT(connector_id) DO UPDATE SET last_fire_at = excluded.last_fire_at
"#,
        )
        .bind(connector_id)
        .bind(ts(at))
        .execute(&self.pool)
        .await
        .map_err(|e| Error::backend("set schedule mark", e))?;
        Ok(())
    }
}

#[async_trait]
impl CatalogCache for SqliteStore {
    async fn get_catalog(&self, connector_id: &str, config_hash: &str) -> Result<Option<Catalog>> {
        let row = sqlx::query(
            "SELECT catalog_json FROM catalog_cache WHERE connector_id = ?1 AND config_hash = ?2",
        )
        .bind(connector_id)
        .bind(config_hash)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Error::backend("get catalog", e))?;
        row.map(|r| decode::<Catalog>("catalog", &r.get::<String, _>("catalog_json")))
            .transpose()
    }

    async fn put_catalog(
        &self,
        connector_id: &str,
        config_hash: &str,
        catalog: &Catalog,
    ) -> Result<()> {
        sqlx::query(
            r#"
INSERT INTO catalog_cache (connector_id, config_hash, catalog_json, discovered_at)
VALUES (?1, ?2, ?3, ?4)
ON CONFLICT(connector_id) DO UPDATE SET
  config_hash = excluded.config_hash,
  catalog_json = excluded.catalog_json,
  discovered_at = excluded.discovered_at
"#,
        )
        .bind(connector_id)
        .bind(config_hash)
        .bind(encode("catalog", catalog)?)
        .bind(ts(Utc::now()))
        .execute(&self.pool)
        .await
        .map_err(|e| Error::backend("put catalog", e))?;
        Ok(())
    }
}

#[async_trait]
impl ConnectorRegistry for SqliteStore {
    async fn get_connector(&self, id: &str) -> Result<Option<Connector>> {
        let row = sqlx::query(
            "SELECT connector_json, status, status_at FROM connectors WHERE id = ?1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Error::backend("get connector", e))?;
        row.as_ref().map(row_to_connector).transpose()
    }

    async fn list_connectors(&self) -> Result<Vec<Connector>> {
        let rows = sqlx::query(
            "SELECT connector_json, status, status_at FROM connectors ORDER BY id ASC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::backend("list connectors", e))?;
        rows.iter().map(row_to_connector).collect()
    }

    async fn get_schedule(&self, connector_id: &str) -> Result<Option<Schedule>> {
        let row = sqlx::query("SELECT schedule_json FROM schedules WHERE connector_id = ?1")
            .bind(connector_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Error::backend("get schedule", e))?;
        row.map(|r| decode::<Schedule>("schedule", &r.get::<String, _>("schedule_json")))
            .transpose()
    }

    async fn list_schedules(&self) -> Result<Vec<Schedule>> {
        let rows = sqlx::query("SELECT schedule_json FROM schedules ORDER BY connector_id ASC")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| Error::backend("list schedules", e))?;
        rows.iter()
            .map(|r| decode::<Schedule>("schedule", &r.get::<String, _>("schedule_json")))
            .collect()
    }

    async fn update_connector_status(
        &self,
        id: &str,
        status: ConnectorStatus,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let res = sqlx::query("UPDATE connectors SET status = ?2, status_at = ?3 WHERE id = ?1")
            .bind(id)
            .bind(status.as_str())
            .bind(ts(at))
            .execute(&self.pool)
            .await
            .map_err(|e| Error::backend("update connector status", e))?;
        if res.rows_affected() == 0 {
            return Err(Error::NotFound(format!("connector {id}")));
        }
        Ok(())
    }
}

fn row_to_checkpoint(row: &SqliteRow) -> Result<CheckpointState> {
    let namespace: String = row.get("namespace");
    let state_type = StateType::parse_str(row.get::<String, _>("state_type").as_str())
        .ok_or_else(|| Error::BackendMessage("unknown state_type".to_string()))?;
    let cursor_value: Option<String> = row.get("cursor_value_json");
    Ok(CheckpointState {
        connector_id: row.get("connector_id"),
        stream: row.get("stream"),
        namespace: (!namespace.is_empty()).then_some(namespace),
        state_type,
        payload: decode("checkpoint payload", &row.get::<String, _>("payload_json"))?,
        cursor_field: decode("cursor field", &row.get::<String, _>("cursor_field_json"))?,
        cursor_value: cursor_value
            .as_deref()
            .map(|v| decode("cursor value", v))
            .transpose()?,
        records_synced: row.get::<i64, _>("records_synced").max(0) as u64,
        updated_at: parse_dt(row.get::<String, _>("updated_at").as_str())?,
    })
}

fn row_to_job(row: &SqliteRow) -> Result<SyncJob> {
    let id = parse_job_id(row.get::<String, _>("id").as_str())?;
    let trigger_raw: String = row.get("trigger_type");
    let trigger = TriggerType::parse_str(&trigger_raw)
        .ok_or_else(|| Error::BackendMessage(format!("unknown trigger_type: {trigger_raw}")))?;
    let status_raw: String = row.get("status");
    let status = JobStatus::parse_str(&status_raw)
        .ok_or_else(|| Error::BackendMessage(format!("unknown job status: {status_raw}")))?;
    let started_at: Option<String> = row.get("started_at");
    let finished_at: Option<String> = row.get("finished_at");
    let parent: Option<String> = row.get("parent_run_id");

    Ok(SyncJob {
        id,
        connector_id: row.get("connector_id"),
        trigger,
        status,
        created_at: parse_dt(row.get::<String, _>("created_at").as_str())?,
        started_at: started_at.as_deref().map(parse_dt).transpose()?,
        finished_at: finished_at.as_deref().map(parse_dt).transpose()?,
        stats: decode("job stats", &row.get::<String, _>("stats_json"))?,
        error_message: row.get("error_message"),
        retryable: row.get("retryable"),
        retry_count: row.get::<i64, _>("retry_count").max(0) as u32,
        parent_run_id: parent.as_deref().map(parse_job_id).transpose()?,
    })
}

fn row_to_connector(row: &SqliteRow) -> Result<Connector> {
    let mut connector: Connector = decode("connector", &row.get::<String, _>("connector_json"))?;
    let status_raw: String = row.get("status");
    connector.status = ConnectorStatus::parse_str(&status_raw)
        .ok_or_else(|| Error::BackendMessage(format!("unknown connector status: {status_raw}")))?;
    let status_at: Option<String> = row.get("status_at");
    connector.status_at = status_at.as_deref().map(parse_dt).transpose()?;
    Ok(connector)
}

/// Fixed-width RFC 3339 so that text order matches time order.
fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_dt(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::backend("parse datetime", e))
}

fn parse_job_id(s: &str) -> Result<JobId> {
    JobId::from_str(s).map_err(|e| Error::backend("parse job id", e))
}

fn encode<T: serde::Serialize + ?Sized>(what: &str, value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| Error::backend(format!("encode {what}"), e))
}

fn decode<T: serde::de::DeserializeOwned>(what: &str, raw: &str) -> Result<T> {
    serde_json::from_str(raw).map_err(|e| Error::backend(format!("decode {what}"), e))
}
