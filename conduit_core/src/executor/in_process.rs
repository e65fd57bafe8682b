use crate::executor::launcher::{
    ConnectorLauncher, Invocation, KILLED_EXIT_CODE, LaunchedProcess, OUTPUT_CHANNEL_CAPACITY,
    OutputLine, ProcessControl, wait_for_exit,
};
use crate::models::{Connector, ExecutionRef};
use crate::protocol::{ConnectorInput, ConnectorMessage, InvocationMode, ProtocolCodec};
use crate::{Error, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Notify, mpsc, watch};
use tokio_util::sync::CancellationToken;

/// A connector implemented inside this process.
///
/// It speaks the same protocol as an external one: it receives the decoded
/// input messages and writes output lines through the `AdapterContext`. The
/// returned value is treated as the exit code.
#[async_trait]
pub trait InProcessConnector: Send + Sync {
    async fn run(
        &self,
        mode: InvocationMode,
        inputs: Vec<ConnectorInput>,
        ctx: AdapterContext,
    ) -> i32;
}

/// Output side of an in-process connector run.
#[derive(Clone)]
pub struct AdapterContext {
    tx: mpsc::Sender<OutputLine>,
    codec: ProtocolCodec,
    cancel: CancellationToken,
}

impl AdapterContext {
    /// Emit one protocol message. Fails with `Cancelled` once the reader is gone.
    pub async fn emit(&self, msg: &ConnectorMessage) -> Result<()> {
        let line = self.codec.encode_message(msg)?;
        self.raw(line).await
    }

    /// Emit an arbitrary stdout line, well-formed or not.
    pub async fn raw(&self, line: impl Into<String>) -> Result<()> {
        self.tx
            .send(OutputLine::Stdout(line.into()))
            .await
            .map_err(|_| Error::Cancelled)
    }

    pub async fn stderr(&self, line: impl Into<String>) -> Result<()> {
        self.tx
            .send(OutputLine::Stderr(line.into()))
            .await
            .map_err(|_| Error::Cancelled)
    }

    /// Cancelled when the executor asks the connector to stop gracefully.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Launches `ExecutionRef::InProcess` connectors from a registry of adapters.
#[derive(Default, Clone)]
pub struct InProcessLauncher {
    adapters: Arc<DashMap<String, Arc<dyn InProcessConnector>>>,
    codec: ProtocolCodec,
}

impl InProcessLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    #[tracing::instrument(level = "debug", skip(self, adapter))]
    pub fn register(&self, name: &str, adapter: Arc<dyn InProcessConnector>) -> Result<()> {
        if name.trim().is_empty() {
            return Err(Error::InvalidInput("adapter name is empty".to_string()));
        }
        self.adapters.insert(name.to_string(), adapter);
        Ok(())
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.adapters.contains_key(name)
    }
}

struct TaskControl {
    label: String,
    cancel: CancellationToken,
    kill: Arc<Notify>,
    exit: watch::Receiver<Option<i32>>,
}

#[async_trait]
impl ProcessControl for TaskControl {
    fn describe(&self) -> String {
        self.label.clone()
    }

    async fn terminate(&self) -> Result<()> {
        self.cancel.cancel();
        Ok(())
    }

    async fn kill(&self) -> Result<()> {
        self.kill.notify_one();
        Ok(())
    }

    async fn wait(&self) -> Result<i32> {
        wait_for_exit(self.exit.clone()).await
    }
}

#[async_trait]
impl ConnectorLauncher for InProcessLauncher {
    #[tracing::instrument(level = "info", skip_all, fields(connector_id = %connector.id, mode = invocation.mode.as_str()))]
    async fn launch(
        &self,
        connector: &Connector,
        invocation: Invocation,
    ) -> Result<LaunchedProcess> {
        let ExecutionRef::InProcess { adapter: name } = &connector.execution else {
            return Err(Error::InvalidInput(format!(
                "connector '{}' is not an in-process connector",
                connector.id
            )));
        };
        let adapter = self
            .adapters
            .get(name)
            .map(|a| a.value().clone())
            .ok_or_else(|| Error::NotFound(format!("in-process adapter '{name}'")))?;
        let inputs = self.codec.decode_inputs(&invocation.input_lines)?;

        let (tx, rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();
        let ctx = AdapterContext {
            tx,
            codec: self.codec.clone(),
            cancel: cancel.clone(),
        };
        let mode = invocation.mode;
        let mut task = tokio::spawn(async move { adapter.run(mode, inputs, ctx).await });

        let kill = Arc::new(Notify::new());
        let kill_signal = kill.clone();
        let (exit_tx, exit_rx) = watch::channel(None);
        tokio::spawn(async move {
            let code = tokio::select! {
                res = &mut task => res.unwrap_or(KILLED_EXIT_CODE),
                _ = kill_signal.notified() => {
                    task.abort();
                    let _ = task.await;
                    KILLED_EXIT_CODE
                }
            };
            let _ = exit_tx.send(Some(code));
        });

        Ok(LaunchedProcess {
            output: rx,
            control: Box::new(TaskControl {
                label: format!("adapter:{name}"),
                cancel,
                kill,
                exit: exit_rx,
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{LogLevel, LogMessage};

    struct Echo;

    #[async_trait]
    impl InProcessConnector for Echo {
        async fn run(
            &self,
            mode: InvocationMode,
            inputs: Vec<ConnectorInput>,
            ctx: AdapterContext,
        ) -> i32 {
            let msg = ConnectorMessage::Log {
                log: LogMessage {
                    level: LogLevel::Info,
                    message: format!("{} with {} inputs", mode.as_str(), inputs.len()),
                },
            };
            if ctx.emit(&msg).await.is_err() {
                return 1;
            }
            0
        }
    }

    struct Stubborn;

    #[async_trait]
    impl InProcessConnector for Stubborn {
        async fn run(&self, _: InvocationMode, _: Vec<ConnectorInput>, _: AdapterContext) -> i32 {
            // Ignores cancellation entirely.
            std::future::pending::<()>().await;
            0
        }
    }

    fn connector(adapter: &str) -> Connector {
        Connector::new(
            "inproc",
            "In-process",
            ExecutionRef::InProcess {
                adapter: adapter.to_string(),
            },
            serde_json::json!({}),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn adapter_output_reaches_the_channel() {
        let launcher = InProcessLauncher::new();
        launcher.register("echo", Arc::new(Echo)).unwrap();
        let lines = ProtocolCodec::default()
            .encode_inputs(InvocationMode::Check, &serde_json::json!({}), None, &[])
            .unwrap();
        let mut launched = launcher
            .launch(
                &connector("echo"),
                Invocation {
                    mode: InvocationMode::Check,
                    input_lines: lines,
                },
            )
            .await
            .unwrap();
        let Some(OutputLine::Stdout(line)) = launched.output.recv().await else {
            panic!("expected a stdout line");
        };
        assert!(line.contains("check with 1 inputs"));
        assert_eq!(launched.control.wait().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn kill_aborts_a_stubborn_adapter() {
        let launcher = InProcessLauncher::new();
        launcher.register("stubborn", Arc::new(Stubborn)).unwrap();
        let launched = launcher
            .launch(
                &connector("stubborn"),
                Invocation {
                    mode: InvocationMode::Read,
                    input_lines: vec![],
                },
            )
            .await
            .unwrap();
        launched.control.terminate().await.unwrap();
        launched.control.kill().await.unwrap();
        assert_eq!(launched.control.wait().await.unwrap(), KILLED_EXIT_CODE);
    }

    #[tokio::test]
    async fn unknown_adapter_is_not_found() {
        let err = InProcessLauncher::new()
            .launch(
                &connector("missing"),
                Invocation {
                    mode: InvocationMode::Spec,
                    input_lines: vec![],
                },
            )
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::NotFound(_)));
    }
}
