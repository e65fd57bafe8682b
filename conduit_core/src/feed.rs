//! Job status feed: every job transition is published for dashboards and
//! alerting. Delivery is at-least-once; consumers deduplicate on
//! `JobStatusEvent::dedupe_key`.

use crate::Result;
use crate::jobs::models::{JobStats, JobStatus, SyncJob};
use crate::models::JobId;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{Mutex, broadcast};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatusEvent {
    pub event_id: Uuid,
    pub job_id: JobId,
    pub connector_id: String,
    pub status: JobStatus,
    pub timestamp: DateTime<Utc>,
    pub stats: JobStats,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JobStatusEvent {
    pub fn from_job(job: &SyncJob) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            job_id: job.id,
            connector_id: job.connector_id.clone(),
            status: job.status,
            timestamp: Utc::now(),
            stats: job.stats.clone(),
            error: job.error_message.clone(),
        }
    }

    pub fn dedupe_key(&self) -> String {
        format!("{}:{}", self.job_id, self.status)
    }
}

#[async_trait]
pub trait JobStatusFeed: Send + Sync {
    async fn publish(&self, event: JobStatusEvent) -> Result<()>;
}

/// Fan-out over a tokio broadcast channel. Subscribers that lag lose events.
#[derive(Clone)]
pub struct BroadcastJobFeed {
    tx: broadcast::Sender<JobStatusEvent>,
}

impl BroadcastJobFeed {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobStatusEvent> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastJobFeed {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl JobStatusFeed for BroadcastJobFeed {
    async fn publish(&self, event: JobStatusEvent) -> Result<()> {
        // No subscribers is not an error.
        let _ = self.tx.send(event);
        Ok(())
    }
}

/// Records every published event (tests).
#[derive(Clone, Default)]
pub struct MemoryJobFeed {
    events: Arc<Mutex<Vec<JobStatusEvent>>>,
}

impl MemoryJobFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn all_events(&self) -> Vec<JobStatusEvent> {
        self.events.lock().await.clone()
    }

    /// Statuses published for one job, in order.
    pub async fn statuses(&self, job_id: JobId) -> Vec<JobStatus> {
        self.events
            .lock()
            .await
            .iter()
            .filter(|e| e.job_id == job_id)
            .map(|e| e.status)
            .collect()
    }
}

#[async_trait]
impl JobStatusFeed for MemoryJobFeed {
    async fn publish(&self, event: JobStatusEvent) -> Result<()> {
        self.events.lock().await.push(event);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TriggerType;

    #[test]
    fn dedupe_key_is_job_and_status() {
        let job = SyncJob::new("pg", TriggerType::Manual).unwrap();
        let a = JobStatusEvent::from_job(&job);
        let b = JobStatusEvent::from_job(&job);
        assert_ne!(a.event_id, b.event_id);
        assert_eq!(a.dedupe_key(), b.dedupe_key());
        assert_eq!(a.dedupe_key(), format!("{}:pending", job.id));
    }

    #[tokio::test]
    async fn broadcast_reaches_subscribers() {
        let feed = BroadcastJobFeed::new(8);
        feed.publish(JobStatusEvent::from_job(
            &SyncJob::new("pg", TriggerType::Manual).unwrap(),
        ))
        .await
        .unwrap();
        let mut rx = feed.subscribe();
        let job = SyncJob::new("pg", TriggerType::Api).unwrap();
        feed.publish(JobStatusEvent::from_job(&job)).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().job_id, job.id);
    }
}
