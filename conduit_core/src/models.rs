use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum IdParseError {
    #[error("invalid uuid: {0}")]
    InvalidUuid(String),
}

/// Sync job identifier.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<Uuid> for JobId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl FromStr for JobId {
    type Err = IdParseError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let id = Uuid::parse_str(s).map_err(|_| IdParseError::InvalidUuid(s.to_string()))?;
        Ok(Self(id))
    }
}

/// How a connector is brought up. The executor only relies on the protocol
/// boundary, so any of these satisfies it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutionRef {
    /// A local binary or script; the mode is appended as the last argument.
    Command {
        program: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: BTreeMap<String, String>,
    },
    /// A container image run through the docker CLI.
    Docker {
        image: String,
        #[serde(default)]
        args: Vec<String>,
    },
    /// An adapter registered with the in-process launcher.
    InProcess { adapter: String },
}

impl ExecutionRef {
    #[tracing::instrument(level = "debug")]
    pub fn validate(&self) -> Result<()> {
        match self {
            ExecutionRef::Command { program, .. } if program.trim().is_empty() => {
                Err(Error::InvalidInput("command program is empty".to_string()))
            }
            ExecutionRef::Docker { image, .. } if image.trim().is_empty() => {
                Err(Error::InvalidInput("docker image is empty".to_string()))
            }
            ExecutionRef::InProcess { adapter } if adapter.trim().is_empty() => {
                Err(Error::InvalidInput("in-process adapter is empty".to_string()))
            }
            _ => Ok(()),
        }
    }
}

/// Outcome of the most recent run, written back after each terminal job.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectorStatus {
    Never,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl ConnectorStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectorStatus::Never => "never",
            ConnectorStatus::Running => "running",
            ConnectorStatus::Succeeded => "succeeded",
            ConnectorStatus::Failed => "failed",
            ConnectorStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse_str(s: &str) -> Option<Self> {
        match s {
            "never" => Some(ConnectorStatus::Never),
            "running" => Some(ConnectorStatus::Running),
            "succeeded" => Some(ConnectorStatus::Succeeded),
            "failed" => Some(ConnectorStatus::Failed),
            "cancelled" => Some(ConnectorStatus::Cancelled),
            _ => None,
        }
    }
}

/// A configured data-source connector.
///
/// Owned by the configuration layer; this crate only reads it and updates the
/// status fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Connector {
    pub id: String,
    pub name: String,
    pub execution: ExecutionRef,
    /// Connector-defined configuration (may contain secrets).
    #[serde(default)]
    pub config: serde_json::Value,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub cron_expression: Option<String>,
    /// Streams to sync; empty selects every discovered stream.
    #[serde(default)]
    pub selected_streams: Vec<String>,
    #[serde(default = "default_status")]
    pub status: ConnectorStatus,
    #[serde(default)]
    pub status_at: Option<DateTime<Utc>>,
}

fn default_enabled() -> bool {
    true
}

fn default_status() -> ConnectorStatus {
    ConnectorStatus::Never
}

impl Connector {
    #[tracing::instrument(level = "debug", skip(config))]
    pub fn new(
        id: impl Into<String> + std::fmt::Debug,
        name: impl Into<String> + std::fmt::Debug,
        execution: ExecutionRef,
        config: serde_json::Value,
    ) -> Result<Self> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(Error::InvalidInput("connector id is empty".to_string()));
        }
        let name = name.into();
        if name.trim().is_empty() {
            return Err(Error::InvalidInput("connector name is empty".to_string()));
        }
        execution.validate()?;
        Ok(Self {
            id,
            name,
            execution,
            config,
            enabled: true,
            cron_expression: None,
            selected_streams: Vec::new(),
            status: ConnectorStatus::Never,
            status_at: None,
        })
    }
}

/// Per-connector cron schedule and admission settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    pub connector_id: String,
    pub cron_expression: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_max_concurrent_runs")]
    pub max_concurrent_runs: usize,
    /// Backfill fire times missed while the scheduler was down.
    #[serde(default)]
    pub catch_up: bool,
}

fn default_max_concurrent_runs() -> usize {
    1
}

impl Schedule {
    #[tracing::instrument(level = "debug")]
    pub fn new(
        connector_id: impl Into<String> + std::fmt::Debug,
        cron_expression: impl Into<String> + std::fmt::Debug,
    ) -> Result<Self> {
        let connector_id = connector_id.into();
        if connector_id.trim().is_empty() {
            return Err(Error::InvalidInput("connector_id is empty".to_string()));
        }
        let cron_expression = cron_expression.into();
        crate::scheduler::cron::parse_schedule(&cron_expression)?;
        Ok(Self {
            connector_id,
            cron_expression,
            enabled: true,
            max_concurrent_runs: default_max_concurrent_runs(),
            catch_up: false,
        })
    }
}

/// What asked for a sync job.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Scheduled,
    Manual,
    Api,
}

impl TriggerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerType::Scheduled => "scheduled",
            TriggerType::Manual => "manual",
            TriggerType::Api => "api",
        }
    }

    pub fn parse_str(s: &str) -> Option<Self> {
        match s {
            "scheduled" => Some(TriggerType::Scheduled),
            "manual" => Some(TriggerType::Manual),
            "api" => Some(TriggerType::Api),
            _ => None,
        }
    }
}
