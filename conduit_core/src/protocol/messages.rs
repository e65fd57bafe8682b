use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// A message emitted by a connector on its output channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectorMessage {
    Record { record: RecordMessage },
    State { state: StateMessage },
    Log { log: LogMessage },
    Trace { trace: TraceMessage },
    Catalog { catalog: Catalog },
    Spec { spec: ConnectorSpecification },
    ConnectionStatus { connection_status: ConnectionStatus },
}

impl ConnectorMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ConnectorMessage::Record { .. } => "RECORD",
            ConnectorMessage::State { .. } => "STATE",
            ConnectorMessage::Log { .. } => "LOG",
            ConnectorMessage::Trace { .. } => "TRACE",
            ConnectorMessage::Catalog { .. } => "CATALOG",
            ConnectorMessage::Spec { .. } => "SPEC",
            ConnectorMessage::ConnectionStatus { .. } => "CONNECTION_STATUS",
        }
    }
}

/// A message written to a connector's input channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectorInput {
    Config { config: serde_json::Value },
    Catalog { catalog: ConfiguredCatalog },
    State { state: StateMessage },
}

/// Mode a connector is launched in.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationMode {
    Spec,
    Check,
    Discover,
    Read,
}

impl InvocationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvocationMode::Spec => "spec",
            InvocationMode::Check => "check",
            InvocationMode::Discover => "discover",
            InvocationMode::Read => "read",
        }
    }
}

/// Name plus optional namespace; identifies a stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamRef {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl StreamRef {
    pub fn new(name: impl Into<String>, namespace: Option<String>) -> Self {
        Self {
            name: name.into(),
            namespace,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordMessage {
    pub stream: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Milliseconds since the Unix epoch.
    pub emitted_at: i64,
    pub data: serde_json::Value,
}

impl RecordMessage {
    pub fn emitted_at_utc(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.emitted_at)
            .single()
            .unwrap_or_else(Utc::now)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StateType {
    Stream,
    Global,
    Legacy,
}

impl StateType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StateType::Stream => "STREAM",
            StateType::Global => "GLOBAL",
            StateType::Legacy => "LEGACY",
        }
    }

    pub fn parse_str(s: &str) -> Option<Self> {
        match s {
            "STREAM" => Some(StateType::Stream),
            "GLOBAL" => Some(StateType::Global),
            "LEGACY" => Some(StateType::Legacy),
            _ => None,
        }
    }
}

fn default_state_type() -> StateType {
    StateType::Legacy
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateStats {
    pub record_count: u64,
}

/// A checkpoint emitted by the connector. `data` is opaque to the platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateMessage {
    #[serde(rename = "type", default = "default_state_type")]
    pub state_type: StateType,
    /// Present for `STREAM` states only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<StreamRef>,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_stats: Option<StateStats>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Fatal,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Fatal => "FATAL",
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
            LogLevel::Trace => "TRACE",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogMessage {
    pub level: LogLevel,
    pub message: String,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TraceType {
    Error,
    Estimate,
    StreamStatus,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureType {
    ConfigError,
    SystemError,
    TransientError,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorTrace {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub internal_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_type: Option<FailureType>,
}

impl ErrorTrace {
    /// Full detail as recorded on a failed job.
    pub fn detail(&self) -> String {
        match &self.internal_message {
            Some(internal) if !internal.is_empty() => format!("{} ({internal})", self.message),
            _ => self.message.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EstimateTrace {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row_estimate: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub byte_estimate: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamStatusTrace {
    pub stream_descriptor: StreamRef,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceMessage {
    #[serde(rename = "type")]
    pub trace_type: TraceType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub emitted_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorTrace>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimate: Option<EstimateTrace>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_status: Option<StreamStatusTrace>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    FullRefresh,
    Incremental,
}

/// A stream as declared by DISCOVER.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamDescriptor {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default)]
    pub json_schema: serde_json::Value,
    #[serde(default)]
    pub supported_sync_modes: Vec<SyncMode>,
    #[serde(default)]
    pub source_defined_cursor: bool,
    #[serde(default)]
    pub default_cursor_field: Vec<String>,
}

impl StreamDescriptor {
    pub fn stream_ref(&self) -> StreamRef {
        StreamRef::new(self.name.clone(), self.namespace.clone())
    }

    pub fn supports(&self, mode: SyncMode) -> bool {
        self.supported_sync_modes.contains(&mode)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Catalog {
    pub streams: Vec<StreamDescriptor>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfiguredStream {
    pub stream: StreamDescriptor,
    pub sync_mode: SyncMode,
    #[serde(default)]
    pub cursor_field: Vec<String>,
}

/// The subset of a catalog selected for a READ, with a sync mode per stream.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ConfiguredCatalog {
    pub streams: Vec<ConfiguredStream>,
}

impl ConfiguredCatalog {
    /// Select streams from a discovered catalog.
    ///
    /// An empty selection takes every stream. Streams supporting incremental
    /// sync are configured incrementally with their declared cursor.
    pub fn from_catalog(catalog: &Catalog, selected: &[String]) -> Self {
        let streams = catalog
            .streams
            .iter()
            .filter(|s| selected.is_empty() || selected.iter().any(|name| name == &s.name))
            .map(|s| {
                let sync_mode = if s.supports(SyncMode::Incremental) {
                    SyncMode::Incremental
                } else {
                    SyncMode::FullRefresh
                };
                ConfiguredStream {
                    stream: s.clone(),
                    sync_mode,
                    cursor_field: s.default_cursor_field.clone(),
                }
            })
            .collect();
        Self { streams }
    }

    pub fn find(&self, name: &str, namespace: Option<&str>) -> Option<&ConfiguredStream> {
        self.streams
            .iter()
            .find(|s| s.stream.name == name && s.stream.namespace.as_deref() == namespace)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectorSpecification {
    pub connection_specification: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub documentation_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supports_incremental: Option<bool>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConnectionStatusKind {
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionStatus {
    pub status: ConnectionStatusKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ConnectionStatus {
    pub fn succeeded(&self) -> bool {
        self.status == ConnectionStatusKind::Succeeded
    }
}
