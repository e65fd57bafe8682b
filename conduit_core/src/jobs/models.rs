use crate::models::{JobId, TriggerType};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "running" => Some(JobStatus::Running),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            "cancelled" => Some(JobStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    fn can_become(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Failed)
                | (Pending, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamStats {
    pub records: u64,
    pub bytes: u64,
    pub states_committed: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row_estimate: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub byte_estimate: Option<u64>,
}

/// Aggregates for one job. Streams are keyed `namespace.stream` (or just
/// `stream` without a namespace).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobStats {
    #[serde(default)]
    pub streams: BTreeMap<String, StreamStats>,
    #[serde(default)]
    pub records_total: u64,
    #[serde(default)]
    pub bytes_total: u64,
    #[serde(default)]
    pub states_committed: u64,
    #[serde(default)]
    pub decode_errors: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

pub fn stream_label(stream: &str, namespace: Option<&str>) -> String {
    match namespace {
        Some(ns) if !ns.is_empty() => format!("{ns}.{stream}"),
        _ => stream.to_string(),
    }
}

impl JobStats {
    pub fn record(&mut self, label: &str, bytes: u64) {
        let s = self.streams.entry(label.to_string()).or_default();
        s.records += 1;
        s.bytes += bytes;
        self.records_total += 1;
        self.bytes_total += bytes;
    }

    /// Count a committed checkpoint; `label` is `None` for connector-wide states.
    pub fn state_committed(&mut self, label: Option<&str>) {
        self.states_committed += 1;
        if let Some(label) = label {
            self.streams.entry(label.to_string()).or_default().states_committed += 1;
        }
    }

    pub fn estimate(&mut self, label: &str, rows: Option<u64>, bytes: Option<u64>) {
        let s = self.streams.entry(label.to_string()).or_default();
        if rows.is_some() {
            s.row_estimate = rows;
        }
        if bytes.is_some() {
            s.byte_estimate = bytes;
        }
    }
}

/// One execution of a connector sync.
///
/// Retries are new jobs pointing at the failed one through `parent_run_id`;
/// a terminal job is never modified again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncJob {
    pub id: JobId,
    pub connector_id: String,
    pub trigger: TriggerType,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub stats: JobStats,
    pub error_message: Option<String>,
    /// Whether a FAILED job may be retried automatically.
    #[serde(default)]
    pub retryable: bool,
    #[serde(default)]
    pub retry_count: u32,
    pub parent_run_id: Option<JobId>,
}

impl SyncJob {
    #[tracing::instrument(level = "debug")]
    pub fn new(
        connector_id: impl Into<String> + std::fmt::Debug,
        trigger: TriggerType,
    ) -> Result<Self> {
        let connector_id = connector_id.into();
        if connector_id.trim().is_empty() {
            return Err(Error::InvalidInput("connector_id is empty".to_string()));
        }
        Ok(Self {
            id: JobId::new(),
            connector_id,
            trigger,
            status: JobStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            stats: JobStats::default(),
            error_message: None,
            retryable: false,
            retry_count: 0,
            parent_run_id: None,
        })
    }

    /// A fresh PENDING job retrying this failed one.
    pub fn retry(&self) -> Result<Self> {
        if self.status != JobStatus::Failed {
            return Err(Error::Conflict(format!(
                "job {} is {}, only failed jobs are retried",
                self.id, self.status
            )));
        }
        let mut next = Self::new(self.connector_id.clone(), self.trigger)?;
        next.retry_count = self.retry_count + 1;
        next.parent_run_id = Some(self.id);
        Ok(next)
    }

    fn transition(&mut self, next: JobStatus) -> Result<()> {
        if !self.status.can_become(next) {
            return Err(Error::Conflict(format!(
                "job {} cannot move from {} to {}",
                self.id, self.status, next
            )));
        }
        self.status = next;
        Ok(())
    }

    pub fn mark_running(&mut self) -> Result<()> {
        self.transition(JobStatus::Running)?;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    pub fn mark_completed(&mut self) -> Result<()> {
        self.transition(JobStatus::Completed)?;
        self.stamp_finished();
        Ok(())
    }

    pub fn mark_failed(&mut self, message: impl Into<String>, retryable: bool) -> Result<()> {
        self.transition(JobStatus::Failed)?;
        self.error_message = Some(message.into());
        self.retryable = retryable;
        self.stamp_finished();
        Ok(())
    }

    pub fn mark_cancelled(&mut self) -> Result<()> {
        self.transition(JobStatus::Cancelled)?;
        self.stamp_finished();
        Ok(())
    }

    fn stamp_finished(&mut self) {
        let now = Utc::now();
        self.finished_at = Some(now);
        if let Some(started) = self.started_at {
            self.stats.duration_ms = Some((now - started).num_milliseconds().max(0) as u64);
        }
    }
}

/// Filter for job history, newest first.
#[derive(Debug, Clone, PartialEq)]
pub struct JobQuery {
    pub connector_id: Option<String>,
    pub status: Option<JobStatus>,
    pub since: Option<DateTime<Utc>>,
    pub limit: usize,
    pub offset: usize,
}

impl Default for JobQuery {
    fn default() -> Self {
        Self {
            connector_id: None,
            status: None,
            since: None,
            limit: 50,
            offset: 0,
        }
    }
}

impl JobQuery {
    #[tracing::instrument(level = "debug")]
    pub fn validate(&self) -> Result<()> {
        if self.limit == 0 {
            return Err(Error::InvalidInput("limit must be > 0".to_string()));
        }
        if self.limit > 1000 {
            return Err(Error::InvalidInput("limit must be <= 1000".to_string()));
        }
        Ok(())
    }

    pub fn matches(&self, job: &SyncJob) -> bool {
        self.connector_id
            .as_deref()
            .map_or(true, |c| job.connector_id == c)
            && self.status.map_or(true, |s| job.status == s)
            && self.since.map_or(true, |t| job.created_at >= t)
    }
}
