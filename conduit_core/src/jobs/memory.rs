use crate::jobs::models::{JobQuery, SyncJob};
use crate::jobs::traits::{JobStore, RecordSink};
use crate::models::JobId;
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Mutex;

/// In-memory JobStore for local development and unit tests.
#[derive(Clone, Default)]
pub struct MemoryJobStore {
    jobs: Arc<Mutex<HashMap<JobId, SyncJob>>>,
    marks: Arc<Mutex<HashMap<String, DateTime<Utc>>>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert_job(&self, job: &SyncJob) -> Result<()> {
        let mut jobs = self.jobs.lock().await;
        if jobs.contains_key(&job.id) {
            return Err(Error::Conflict(format!("job {} already exists", job.id)));
        }
        jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn update_job(&self, job: &SyncJob) -> Result<()> {
        let mut jobs = self.jobs.lock().await;
        let stored = jobs
            .get_mut(&job.id)
            .ok_or_else(|| Error::NotFound(format!("job {}", job.id)))?;
        if stored.status.is_terminal() {
            return Err(Error::Conflict(format!(
                "job {} is already {}",
                job.id, stored.status
            )));
        }
        *stored = job.clone();
        Ok(())
    }

    async fn get_job(&self, id: JobId) -> Result<Option<SyncJob>> {
        Ok(self.jobs.lock().await.get(&id).cloned())
    }

    async fn list_jobs(&self, query: &JobQuery) -> Result<Vec<SyncJob>> {
        query.validate()?;
        let jobs = self.jobs.lock().await;
        let mut out: Vec<SyncJob> = jobs.values().filter(|j| query.matches(j)).cloned().collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(out
            .into_iter()
            .skip(query.offset)
            .take(query.limit)
            .collect())
    }

    async fn get_schedule_mark(&self, connector_id: &str) -> Result<Option<DateTime<Utc>>> {
        Ok(self.marks.lock().await.get(connector_id).copied())
    }

    async fn set_schedule_mark(&self, connector_id: &str, at: DateTime<Utc>) -> Result<()> {
        self.marks.lock().await.insert(connector_id.to_string(), at);
        Ok(())
    }
}

/// A record received by `MemoryRecordSink`.
#[derive(Debug, Clone, PartialEq)]
pub struct SinkRecord {
    pub stream: String,
    pub namespace: Option<String>,
    pub data: serde_json::Value,
    pub emitted_at: DateTime<Utc>,
}

/// Collects records in memory (tests, dry runs).
#[derive(Clone, Default)]
pub struct MemoryRecordSink {
    records: Arc<Mutex<Vec<SinkRecord>>>,
    flushes: Arc<AtomicUsize>,
}

impl MemoryRecordSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn records(&self) -> Vec<SinkRecord> {
        self.records.lock().await.clone()
    }

    pub fn flush_count(&self) -> usize {
        self.flushes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RecordSink for MemoryRecordSink {
    async fn accept(
        &self,
        stream: &str,
        namespace: Option<&str>,
        record: &serde_json::Value,
        emitted_at: DateTime<Utc>,
    ) -> Result<()> {
        self.records.lock().await.push(SinkRecord {
            stream: stream.to_string(),
            namespace: namespace.map(str::to_string),
            data: record.clone(),
            emitted_at,
        });
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        self.flushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::models::JobStatus;
    use crate::models::TriggerType;

    #[tokio::test]
    async fn terminal_jobs_cannot_be_overwritten() {
        let store = MemoryJobStore::new();
        let mut job = SyncJob::new("pg", TriggerType::Manual).unwrap();
        store.insert_job(&job).await.unwrap();
        assert!(store.insert_job(&job).await.is_err());
        job.mark_running().unwrap();
        job.mark_completed().unwrap();
        store.update_job(&job).await.unwrap();
        assert!(matches!(store.update_job(&job).await, Err(Error::Conflict(_))));
    }

    #[tokio::test]
    async fn retry_chain_is_oldest_first() {
        let store = MemoryJobStore::new();
        let mut first = SyncJob::new("pg", TriggerType::Scheduled).unwrap();
        first.mark_running().unwrap();
        first.mark_failed("timeout", true).unwrap();
        store.insert_job(&first).await.unwrap();
        let mut second = first.retry().unwrap();
        second.mark_running().unwrap();
        second.mark_failed("timeout", true).unwrap();
        store.insert_job(&second).await.unwrap();
        let third = second.retry().unwrap();
        store.insert_job(&third).await.unwrap();

        let chain = store.retry_chain(third.id).await.unwrap();
        let ids: Vec<JobId> = chain.iter().map(|j| j.id).collect();
        assert_eq!(ids, vec![first.id, second.id, third.id]);
        assert!(store.retry_chain(JobId::new()).await.is_err());
    }

    #[tokio::test]
    async fn list_filters_by_connector_and_status() {
        let store = MemoryJobStore::new();
        for connector in ["pg", "pg", "mysql"] {
            store
                .insert_job(&SyncJob::new(connector, TriggerType::Api).unwrap())
                .await
                .unwrap();
        }
        let q = JobQuery {
            connector_id: Some("pg".into()),
            status: Some(JobStatus::Pending),
            ..JobQuery::default()
        };
        assert_eq!(store.list_jobs(&q).await.unwrap().len(), 2);
        let q = JobQuery {
            limit: 1,
            ..JobQuery::default()
        };
        assert_eq!(store.list_jobs(&q).await.unwrap().len(), 1);
    }
}
