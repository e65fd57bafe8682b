use crate::protocol::{StateMessage, StateType, StreamRef};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Stream name under which GLOBAL and LEGACY states are stored.
pub const CONNECTOR_STREAM: &str = "__connector__";

pub const SNAPSHOT_VERSION: u32 = 1;

/// Identifies one checkpoint row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StateKey {
    pub connector_id: String,
    pub stream: String,
    pub namespace: Option<String>,
}

impl StateKey {
    #[tracing::instrument(level = "debug")]
    pub fn new(
        connector_id: impl Into<String> + std::fmt::Debug,
        stream: impl Into<String> + std::fmt::Debug,
        namespace: Option<String>,
    ) -> Result<Self> {
        let connector_id = connector_id.into();
        if connector_id.trim().is_empty() {
            return Err(Error::InvalidInput("connector_id is empty".to_string()));
        }
        let stream = stream.into();
        if stream.trim().is_empty() {
            return Err(Error::InvalidInput("stream is empty".to_string()));
        }
        // Empty and absent namespaces are the same key.
        let namespace = namespace.filter(|ns| !ns.is_empty());
        Ok(Self {
            connector_id,
            stream,
            namespace,
        })
    }

    /// Connector-wide key for GLOBAL and LEGACY states.
    pub fn connector_wide(connector_id: &str) -> Result<Self> {
        Self::new(connector_id, CONNECTOR_STREAM, None)
    }

    /// Where a STATE message emitted by `connector_id` is stored.
    pub fn for_message(connector_id: &str, state: &StateMessage) -> Result<Self> {
        match (&state.state_type, &state.stream) {
            (StateType::Stream, Some(stream)) => {
                Self::new(connector_id, stream.name.clone(), stream.namespace.clone())
            }
            (StateType::Stream, None) => Err(Error::InvalidInput(
                "STREAM state without stream descriptor".to_string(),
            )),
            _ => Self::connector_wide(connector_id),
        }
    }

    pub fn is_connector_wide(&self) -> bool {
        self.stream == CONNECTOR_STREAM
    }
}

/// The values written by one `StateStore::update` call.
#[derive(Debug, Clone, PartialEq)]
pub struct StateUpdate {
    pub state_type: StateType,
    pub payload: serde_json::Value,
    /// Observability only; the payload stays opaque.
    pub cursor_field: Vec<String>,
    /// Records synced since the previous checkpoint of this key.
    pub records_delta: u64,
}

impl StateUpdate {
    pub fn cursor_value(&self) -> Option<serde_json::Value> {
        extract_cursor_value(&self.payload, &self.cursor_field)
    }
}

/// The current checkpoint for one key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointState {
    pub connector_id: String,
    pub stream: String,
    pub namespace: Option<String>,
    pub state_type: StateType,
    pub payload: serde_json::Value,
    pub cursor_field: Vec<String>,
    pub cursor_value: Option<serde_json::Value>,
    pub records_synced: u64,
    pub updated_at: DateTime<Utc>,
}

impl CheckpointState {
    pub fn key(&self) -> StateKey {
        StateKey {
            connector_id: self.connector_id.clone(),
            stream: self.stream.clone(),
            namespace: self.namespace.clone(),
        }
    }

    /// The STATE input line handed back to the connector on the next READ.
    pub fn to_state_message(&self) -> StateMessage {
        let stream = match self.state_type {
            StateType::Stream => Some(StreamRef::new(self.stream.clone(), self.namespace.clone())),
            StateType::Global | StateType::Legacy => None,
        };
        StateMessage {
            state_type: self.state_type,
            stream,
            data: self.payload.clone(),
            source_stats: None,
        }
    }
}

/// Walk `cursor_field` into the payload; fall back to a top-level `cursor`.
pub fn extract_cursor_value(
    payload: &serde_json::Value,
    cursor_field: &[String],
) -> Option<serde_json::Value> {
    if !cursor_field.is_empty() {
        let found = cursor_field
            .iter()
            .try_fold(payload, |v, part| v.get(part.as_str()));
        if let Some(v) = found {
            return Some(v.clone());
        }
    }
    payload.get("cursor").cloned()
}

/// One exported row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub stream: String,
    #[serde(default)]
    pub namespace: Option<String>,
    pub state_type: StateType,
    pub payload: serde_json::Value,
    #[serde(default)]
    pub cursor_field: Vec<String>,
    #[serde(default)]
    pub cursor_value: Option<serde_json::Value>,
    #[serde(default)]
    pub records_synced: u64,
    pub updated_at: DateTime<Utc>,
}

impl SnapshotEntry {
    pub fn from_checkpoint(cp: &CheckpointState) -> Self {
        Self {
            stream: cp.stream.clone(),
            namespace: cp.namespace.clone(),
            state_type: cp.state_type,
            payload: cp.payload.clone(),
            cursor_field: cp.cursor_field.clone(),
            cursor_value: cp.cursor_value.clone(),
            records_synced: cp.records_synced,
            updated_at: cp.updated_at,
        }
    }

    pub fn into_checkpoint(self, connector_id: &str) -> CheckpointState {
        CheckpointState {
            connector_id: connector_id.to_string(),
            stream: self.stream,
            namespace: self.namespace.filter(|ns| !ns.is_empty()),
            state_type: self.state_type,
            payload: self.payload,
            cursor_field: self.cursor_field,
            cursor_value: self.cursor_value,
            records_synced: self.records_synced,
            updated_at: self.updated_at,
        }
    }
}

/// Full state of one connector, for backup and migration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub version: u32,
    pub connector_id: String,
    pub exported_at: DateTime<Utc>,
    pub streams: Vec<SnapshotEntry>,
}

impl StateSnapshot {
    pub fn new(connector_id: &str, checkpoints: &[CheckpointState]) -> Self {
        let mut streams: Vec<SnapshotEntry> =
            checkpoints.iter().map(SnapshotEntry::from_checkpoint).collect();
        streams.sort_by(|a, b| (&a.stream, &a.namespace).cmp(&(&b.stream, &b.namespace)));
        Self {
            version: SNAPSHOT_VERSION,
            connector_id: connector_id.to_string(),
            exported_at: Utc::now(),
            streams,
        }
    }

    /// Check the snapshot can be imported for `connector_id`.
    #[tracing::instrument(level = "debug", skip(self), fields(streams = self.streams.len()))]
    pub fn validate_for(&self, connector_id: &str) -> Result<()> {
        if self.version != SNAPSHOT_VERSION {
            return Err(Error::InvalidInput(format!(
                "unsupported state snapshot version {} (expected {SNAPSHOT_VERSION})",
                self.version
            )));
        }
        if self.connector_id != connector_id {
            return Err(Error::InvalidInput(format!(
                "state snapshot belongs to connector '{}', not '{connector_id}'",
                self.connector_id
            )));
        }
        let mut seen = std::collections::HashSet::new();
        for entry in &self.streams {
            if entry.stream.trim().is_empty() {
                return Err(Error::InvalidInput(
                    "state snapshot entry has an empty stream".to_string(),
                ));
            }
            let ns = entry.namespace.as_deref().filter(|ns| !ns.is_empty());
            if !seen.insert((entry.stream.as_str(), ns)) {
                return Err(Error::InvalidInput(format!(
                    "state snapshot contains stream '{}' twice",
                    entry.stream
                )));
            }
        }
        Ok(())
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::backend("serialize state snapshot", e))
    }

    pub fn from_json(blob: &str) -> Result<Self> {
        serde_json::from_str(blob)
            .map_err(|e| Error::InvalidInput(format!("invalid state snapshot: {e}")))
    }
}
