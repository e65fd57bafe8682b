use crate::protocol::messages::{
    ConfiguredCatalog, ConnectorInput, ConnectorMessage, InvocationMode, StateMessage, StateType,
    TraceType,
};
use crate::{Error, Result};

/// Default upper bound for a single protocol line.
pub const DEFAULT_MAX_LINE_BYTES: usize = 64 * 1024 * 1024;

/// One decoded item from a connector's output.
///
/// Malformed lines do not abort anything: they are surfaced as `DecodeError`
/// carrying the raw line and processing continues with the next one.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolEvent {
    Message(ConnectorMessage),
    DecodeError { raw: String, error: String },
}

#[derive(Debug, Clone)]
pub struct ProtocolCodec {
    max_line_bytes: usize,
}

impl Default for ProtocolCodec {
    fn default() -> Self {
        Self {
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
        }
    }
}

impl ProtocolCodec {
    pub fn new(max_line_bytes: usize) -> Self {
        Self {
            max_line_bytes: max_line_bytes.max(1),
        }
    }

    /// Decode error for a line of `bytes` bytes of which only `head` was kept.
    pub fn oversized_line(&self, head: &str, bytes: usize) -> ProtocolEvent {
        decode_error(
            truncate_raw(head),
            format!(
                "line of {bytes} bytes exceeds limit of {}",
                self.max_line_bytes
            ),
        )
    }

    /// Decode one output line. Blank lines yield `None`.
    pub fn decode_line(&self, line: &str) -> Option<ProtocolEvent> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return None;
        }
        if trimmed.len() > self.max_line_bytes {
            return Some(self.oversized_line(trimmed, trimmed.len()));
        }

        let msg: ConnectorMessage = match serde_json::from_str(trimmed) {
            Ok(msg) => msg,
            Err(e) => return Some(decode_error(trimmed.to_string(), e.to_string())),
        };
        if let Err(reason) = validate(&msg) {
            return Some(decode_error(trimmed.to_string(), reason));
        }
        Some(ProtocolEvent::Message(msg))
    }

    /// Serialize one output message (used by in-process adapters and fixtures).
    pub fn encode_message(&self, msg: &ConnectorMessage) -> Result<String> {
        serde_json::to_string(msg).map_err(|e| Error::backend("encode connector message", e))
    }

    /// Build the input lines for an invocation.
    ///
    /// Every mode but SPEC receives the configuration; READ additionally gets
    /// the configured catalog followed by one line per prior checkpoint.
    pub fn encode_inputs(
        &self,
        mode: InvocationMode,
        config: &serde_json::Value,
        catalog: Option<&ConfiguredCatalog>,
        states: &[StateMessage],
    ) -> Result<Vec<String>> {
        let mut inputs = Vec::new();
        if mode != InvocationMode::Spec {
            inputs.push(ConnectorInput::Config {
                config: config.clone(),
            });
        }
        if mode == InvocationMode::Read {
            let catalog = catalog.ok_or_else(|| {
                Error::InvalidInput("read invocation requires a configured catalog".to_string())
            })?;
            inputs.push(ConnectorInput::Catalog {
                catalog: catalog.clone(),
            });
            inputs.extend(states.iter().cloned().map(|state| ConnectorInput::State { state }));
        }

        inputs
            .iter()
            .map(|input| {
                serde_json::to_string(input).map_err(|e| Error::backend("encode connector input", e))
            })
            .collect()
    }

    /// Parse input lines back (used by in-process adapters).
    pub fn decode_inputs(&self, lines: &[String]) -> Result<Vec<ConnectorInput>> {
        lines
            .iter()
            .filter(|l| !l.trim().is_empty())
            .map(|l| {
                serde_json::from_str(l)
                    .map_err(|e| Error::InvalidInput(format!("invalid connector input: {e}")))
            })
            .collect()
    }
}

fn decode_error(raw: String, error: String) -> ProtocolEvent {
    ProtocolEvent::DecodeError { raw, error }
}

fn truncate_raw(line: &str) -> String {
    let mut end = 1024.min(line.len());
    while !line.is_char_boundary(end) {
        end -= 1;
    }
    line[..end].to_string()
}

/// Structural checks serde cannot express.
fn validate(msg: &ConnectorMessage) -> std::result::Result<(), String> {
    match msg {
        ConnectorMessage::Record { record } if record.stream.trim().is_empty() => {
            Err("record has an empty stream name".to_string())
        }
        ConnectorMessage::State { state } => match (&state.state_type, &state.stream) {
            (StateType::Stream, None) => Err("STREAM state without stream descriptor".to_string()),
            (StateType::Stream, Some(s)) if s.name.trim().is_empty() => {
                Err("STREAM state with empty stream name".to_string())
            }
            _ => Ok(()),
        },
        ConnectorMessage::Trace { trace } => match trace.trace_type {
            TraceType::Error if trace.error.is_none() => {
                Err("ERROR trace without error detail".to_string())
            }
            TraceType::Estimate if trace.estimate.is_none() => {
                Err("ESTIMATE trace without estimate".to_string())
            }
            _ => Ok(()),
        },
        _ => Ok(()),
    }
}
