use std::error::Error as StdError;

/// Common error type for `conduit_core`.
///
/// Storage backends should preserve the underlying error chain where possible
/// via `Error::backend`. Malformed protocol lines are not errors: they surface
/// as `ProtocolEvent::DecodeError` and the sync continues.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    /// The connector rejected its configuration during CHECK.
    #[error("configuration invalid: {0}")]
    ConfigurationInvalid(String),

    /// DISCOVER produced a malformed catalog or failed outright.
    #[error("discovery failed: {0}")]
    DiscoveryFailed(String),

    #[error("connector exited without returning a catalog")]
    NoCatalogReturned,

    #[error("connector did not finish within {timeout_secs}s")]
    ExecutionTimeout { timeout_secs: u64 },

    #[error("connector produced no output for {idle_secs}s")]
    IdleTimeout { idle_secs: u64 },

    #[error("connector failed with exit code {exit_code}{}", trace_suffix(.last_trace))]
    ConnectorFailed {
        exit_code: i32,
        last_trace: Option<String>,
        stderr_tail: Vec<String>,
    },

    /// The process ended without producing the message the operation waits for.
    #[error("connector process error: {message}")]
    ProcessError {
        message: String,
        exit_code: Option<i32>,
        stderr_tail: Vec<String>,
    },

    #[error("state store unavailable: {0}")]
    StateStoreUnavailable(String),

    #[error("concurrency limit exceeded: {0}")]
    ConcurrencyLimitExceeded(String),

    #[error("cancelled")]
    Cancelled,

    #[error("backend error: {context}")]
    Backend {
        context: String,
        #[source]
        source: Box<dyn StdError + Send + Sync + 'static>,
    },

    #[error("backend error: {0}")]
    BackendMessage(String),
}

impl Error {
    #[tracing::instrument(level = "debug", name = "conduit.error.backend", skip(source))]
    pub fn backend(
        context: impl Into<String> + std::fmt::Debug,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self::Backend {
            context: context.into(),
            source: Box::new(source),
        }
    }

    /// Whether a job failing with this error may be retried automatically.
    ///
    /// Configuration and discovery problems need an operator; admission
    /// rejections and cancellations are not failures at all.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::ExecutionTimeout { .. }
            | Error::IdleTimeout { .. }
            | Error::ConnectorFailed { .. }
            | Error::ProcessError { .. }
            | Error::StateStoreUnavailable(_)
            | Error::Backend { .. }
            | Error::BackendMessage(_) => true,
            Error::InvalidInput(_)
            | Error::NotFound(_)
            | Error::Conflict(_)
            | Error::ConfigurationInvalid(_)
            | Error::DiscoveryFailed(_)
            | Error::NoCatalogReturned
            | Error::ConcurrencyLimitExceeded(_)
            | Error::Cancelled => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

fn trace_suffix(trace: &Option<String>) -> String {
    trace.as_deref().map(|t| format!(": {t}")).unwrap_or_default()
}
