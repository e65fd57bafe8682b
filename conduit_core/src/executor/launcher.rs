use crate::Result;
use crate::models::Connector;
use crate::protocol::InvocationMode;
use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

/// Capacity of the output channel between a running connector and its reader.
pub const OUTPUT_CHANNEL_CAPACITY: usize = 1024;

/// Exit code reported for processes that died from a signal or were aborted.
pub const KILLED_EXIT_CODE: i32 = -1;

/// What to run: the mode plus the input lines written to the connector.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub mode: InvocationMode,
    pub input_lines: Vec<String>,
}

/// A raw line from one of the connector's output channels.
#[derive(Debug, Clone, PartialEq)]
pub enum OutputLine {
    Stdout(String),
    Stderr(String),
    /// A stdout line longer than the reader's limit: its total size and the
    /// prefix that was kept.
    Oversized { bytes: usize, head: String },
}

/// Lifecycle control over a launched connector.
#[async_trait]
pub trait ProcessControl: Send + Sync {
    /// Identifier for logs (pid, container name, adapter name).
    fn describe(&self) -> String;

    /// Ask the connector to stop (SIGTERM or equivalent).
    async fn terminate(&self) -> Result<()>;

    /// Stop the connector unconditionally.
    async fn kill(&self) -> Result<()>;

    /// Wait for the connector to exit and return its exit code.
    async fn wait(&self) -> Result<i32>;
}

/// A running connector: its merged output lines and a control handle.
///
/// The output channel closes once both stdout and stderr reach EOF.
pub struct LaunchedProcess {
    pub output: mpsc::Receiver<OutputLine>,
    pub control: Box<dyn ProcessControl>,
}

#[async_trait]
pub trait ConnectorLauncher: Send + Sync {
    async fn launch(&self, connector: &Connector, invocation: Invocation)
    -> Result<LaunchedProcess>;
}

/// Wait until a supervisor publishes the exit code.
pub(crate) async fn wait_for_exit(mut exit: watch::Receiver<Option<i32>>) -> Result<i32> {
    let code = exit
        .wait_for(|code| code.is_some())
        .await
        .map_err(|e| crate::Error::backend("wait for connector exit", e))?;
    Ok((*code).unwrap_or(KILLED_EXIT_CODE))
}
