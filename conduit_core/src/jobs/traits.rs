use crate::Result;
use crate::jobs::models::{JobQuery, SyncJob};
use crate::models::JobId;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Durable job history plus the scheduler's cron bookkeeping.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Fails with `Conflict` if the id already exists.
    async fn insert_job(&self, job: &SyncJob) -> Result<()>;

    /// Fails with `NotFound` for unknown ids and `Conflict` when the stored
    /// job is already terminal.
    async fn update_job(&self, job: &SyncJob) -> Result<()>;

    async fn get_job(&self, id: JobId) -> Result<Option<SyncJob>>;

    async fn list_jobs(&self, query: &JobQuery) -> Result<Vec<SyncJob>>;

    /// Lineage of a job through `parent_run_id`, oldest first, ending with `id`.
    async fn retry_chain(&self, id: JobId) -> Result<Vec<SyncJob>> {
        let mut chain = Vec::new();
        let mut next = Some(id);
        while let Some(id) = next {
            let Some(job) = self.get_job(id).await? else {
                break;
            };
            // Guards against a corrupted cycle.
            if chain.iter().any(|j: &SyncJob| j.id == job.id) {
                break;
            }
            next = job.parent_run_id;
            chain.push(job);
        }
        if chain.is_empty() {
            return Err(crate::Error::NotFound(format!("job {id}")));
        }
        chain.reverse();
        Ok(chain)
    }

    /// Last cron fire time handled for a connector.
    async fn get_schedule_mark(&self, connector_id: &str) -> Result<Option<DateTime<Utc>>>;

    async fn set_schedule_mark(&self, connector_id: &str, at: DateTime<Utc>) -> Result<()>;
}

/// Where extracted records go. The landing-zone writer lives outside this crate.
#[async_trait]
pub trait RecordSink: Send + Sync {
    async fn accept(
        &self,
        stream: &str,
        namespace: Option<&str>,
        record: &serde_json::Value,
        emitted_at: DateTime<Utc>,
    ) -> Result<()>;

    /// Make everything accepted so far durable. Called before a checkpoint is
    /// committed when the sink acknowledgment gate is enabled.
    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}
