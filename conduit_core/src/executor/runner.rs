use crate::config::ExecutorConfig;
use crate::executor::launcher::{ConnectorLauncher, Invocation, OutputLine, ProcessControl};
use crate::executor::ring::RingBuffer;
use crate::models::Connector;
use crate::protocol::{
    Catalog, ConfiguredCatalog, ConnectionStatus, ConnectorMessage, ConnectorSpecification,
    InvocationMode, ProtocolCodec, ProtocolEvent, StateMessage, TraceType,
};
use crate::{Error, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Drives connector invocations over any `ConnectorLauncher`.
#[derive(Clone)]
pub struct ConnectorExecutor {
    launcher: Arc<dyn ConnectorLauncher>,
    codec: ProtocolCodec,
    config: ExecutorConfig,
}

impl ConnectorExecutor {
    pub fn new(launcher: Arc<dyn ConnectorLauncher>, config: ExecutorConfig) -> Self {
        Self {
            launcher,
            codec: ProtocolCodec::new(config.max_line_bytes),
            config,
        }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    async fn start(
        &self,
        connector: &Connector,
        mode: InvocationMode,
        input_lines: Vec<String>,
        timeout: Duration,
        idle: Duration,
        cancel: CancellationToken,
    ) -> Result<ReadStream> {
        let launched = self
            .launcher
            .launch(connector, Invocation { mode, input_lines })
            .await?;
        let now = Instant::now();
        Ok(ReadStream {
            connector_id: connector.id.clone(),
            output: launched.output,
            control: Some(launched.control),
            codec: self.codec.clone(),
            ring: RingBuffer::new(self.config.stderr_ring_capacity),
            last_trace: None,
            timeout,
            deadline: now + timeout,
            idle,
            last_activity: now,
            grace: self.config.termination_grace,
            cancel,
            exit_code: None,
            finished: false,
        })
    }

    /// Launch in spec mode and return the connector's specification.
    #[tracing::instrument(level = "info", skip_all, fields(connector_id = %connector.id))]
    pub async fn spec(&self, connector: &Connector) -> Result<ConnectorSpecification> {
        let inputs = self
            .codec
            .encode_inputs(InvocationMode::Spec, &connector.config, None, &[])?;
        let timeout = self.config.check_timeout;
        let mut stream = self
            .start(connector, InvocationMode::Spec, inputs, timeout, timeout, CancellationToken::new())
            .await?;
        loop {
            match stream.next_event().await {
                Ok(Some(ProtocolEvent::Message(ConnectorMessage::Spec { spec }))) => {
                    stream.release().await;
                    return Ok(spec);
                }
                Ok(Some(_)) => continue,
                Ok(None) => return Err(stream.missing("SPEC", Some(0))),
                Err(Error::ConnectorFailed { exit_code, .. }) => {
                    return Err(stream.missing("SPEC", Some(exit_code)));
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Launch in check mode and return the connector's verdict on `config`.
    ///
    /// A FAILED status is a successful call; callers decide what it means.
    #[tracing::instrument(level = "info", skip_all, fields(connector_id = %connector.id))]
    pub async fn check(
        &self,
        connector: &Connector,
        config: &serde_json::Value,
    ) -> Result<ConnectionStatus> {
        let inputs = self
            .codec
            .encode_inputs(InvocationMode::Check, config, None, &[])?;
        let timeout = self.config.check_timeout;
        let mut stream = self
            .start(connector, InvocationMode::Check, inputs, timeout, timeout, CancellationToken::new())
            .await?;
        loop {
            match stream.next_event().await {
                Ok(Some(ProtocolEvent::Message(ConnectorMessage::ConnectionStatus {
                    connection_status,
                }))) => {
                    stream.release().await;
                    tracing::info!(succeeded = connection_status.succeeded(), "connection check finished");
                    return Ok(connection_status);
                }
                Ok(Some(_)) => continue,
                Ok(None) => return Err(stream.missing("CONNECTION_STATUS", Some(0))),
                Err(Error::ConnectorFailed { exit_code, .. }) => {
                    return Err(stream.missing("CONNECTION_STATUS", Some(exit_code)));
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Launch in discover mode and return the first CATALOG emitted.
    #[tracing::instrument(level = "info", skip_all, fields(connector_id = %connector.id))]
    pub async fn discover(
        &self,
        connector: &Connector,
        config: &serde_json::Value,
    ) -> Result<Catalog> {
        let inputs = self
            .codec
            .encode_inputs(InvocationMode::Discover, config, None, &[])?;
        let timeout = self.config.discover_timeout;
        let mut stream = self
            .start(connector, InvocationMode::Discover, inputs, timeout, timeout, CancellationToken::new())
            .await?;
        loop {
            match stream.next_event().await {
                Ok(Some(ProtocolEvent::Message(ConnectorMessage::Catalog { catalog }))) => {
                    stream.release().await;
                    tracing::info!(streams = catalog.streams.len(), "catalog discovered");
                    return Ok(catalog);
                }
                Ok(Some(ProtocolEvent::DecodeError { raw, error })) if looks_like_catalog(&raw) => {
                    stream.terminate().await;
                    return Err(Error::DiscoveryFailed(format!("malformed catalog: {error}")));
                }
                Ok(Some(_)) => continue,
                Ok(None) | Err(Error::ConnectorFailed { .. }) => {
                    return Err(match stream.last_trace() {
                        Some(trace) => Error::DiscoveryFailed(trace.to_string()),
                        None => Error::NoCatalogReturned,
                    });
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Launch in read mode and return the lazily decoded event sequence.
    ///
    /// `states` are the previously committed checkpoints handed to the
    /// connector. Cancelling `cancel` stops the connector; the stream then
    /// yields `Error::Cancelled` once the process is gone.
    #[tracing::instrument(level = "info", skip_all, fields(connector_id = %connector.id, streams = catalog.streams.len(), states = states.len()))]
    pub async fn read(
        &self,
        connector: &Connector,
        config: &serde_json::Value,
        catalog: &ConfiguredCatalog,
        states: &[StateMessage],
        cancel: CancellationToken,
    ) -> Result<ReadStream> {
        let inputs = self
            .codec
            .encode_inputs(InvocationMode::Read, config, Some(catalog), states)?;
        self.start(
            connector,
            InvocationMode::Read,
            inputs,
            self.config.read_timeout,
            self.config.idle_timeout,
            cancel,
        )
        .await
    }
}

fn looks_like_catalog(raw: &str) -> bool {
    serde_json::from_str::<serde_json::Value>(raw)
        .ok()
        .and_then(|v| v.get("type").and_then(|t| t.as_str()).map(|t| t == "CATALOG"))
        .unwrap_or(false)
}

enum Wake {
    Cancelled,
    Deadline,
    Idle,
    Line(Option<OutputLine>),
}

/// The event sequence of one connector invocation.
///
/// Not restartable: once it has ended (normally, with an error, on timeout or
/// on cancellation) it yields nothing more. Dropping an unfinished stream
/// kills the connector.
pub struct ReadStream {
    connector_id: String,
    output: mpsc::Receiver<OutputLine>,
    control: Option<Box<dyn ProcessControl>>,
    codec: ProtocolCodec,
    ring: RingBuffer,
    last_trace: Option<String>,
    timeout: Duration,
    deadline: Instant,
    idle: Duration,
    last_activity: Instant,
    grace: Duration,
    cancel: CancellationToken,
    exit_code: Option<i32>,
    finished: bool,
}

impl ReadStream {
    /// Next decoded event, `Ok(None)` after a clean exit.
    ///
    /// Fails with `ConnectorFailed` on a non-zero exit, `ExecutionTimeout` or
    /// `IdleTimeout` when a bound is exceeded and `Cancelled` when the token
    /// fires. In the last three cases the connector has already been stopped.
    pub async fn next_event(&mut self) -> Result<Option<ProtocolEvent>> {
        loop {
            if self.finished {
                return Ok(None);
            }
            let idle_deadline = self.last_activity + self.idle;
            let wake = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Wake::Cancelled,
                _ = tokio::time::sleep_until(self.deadline) => Wake::Deadline,
                _ = tokio::time::sleep_until(idle_deadline) => Wake::Idle,
                line = self.output.recv() => Wake::Line(line),
            };

            match wake {
                Wake::Cancelled => {
                    tracing::info!(connector_id = %self.connector_id, "cancelling connector");
                    self.terminate().await;
                    return Err(Error::Cancelled);
                }
                Wake::Deadline => {
                    tracing::warn!(connector_id = %self.connector_id, timeout_secs = self.timeout.as_secs(), "connector timed out");
                    self.terminate().await;
                    return Err(Error::ExecutionTimeout {
                        timeout_secs: self.timeout.as_secs(),
                    });
                }
                Wake::Idle => {
                    tracing::warn!(connector_id = %self.connector_id, idle_secs = self.idle.as_secs(), "connector idle");
                    self.terminate().await;
                    return Err(Error::IdleTimeout {
                        idle_secs: self.idle.as_secs(),
                    });
                }
                Wake::Line(None) => return self.finish().await,
                Wake::Line(Some(OutputLine::Stderr(line))) => {
                    tracing::debug!(target: "conduit::connector", connector_id = %self.connector_id, "{line}");
                    self.ring.push(line);
                }
                Wake::Line(Some(OutputLine::Oversized { bytes, head })) => {
                    self.last_activity = Instant::now();
                    let event = self.codec.oversized_line(&head, bytes);
                    self.observe(&event);
                    return Ok(Some(event));
                }
                Wake::Line(Some(OutputLine::Stdout(line))) => {
                    self.last_activity = Instant::now();
                    let Some(event) = self.codec.decode_line(&line) else {
                        continue;
                    };
                    self.observe(&event);
                    return Ok(Some(event));
                }
            }
        }
    }

    fn observe(&mut self, event: &ProtocolEvent) {
        match event {
            ProtocolEvent::Message(ConnectorMessage::Log { log }) => {
                self.ring
                    .push(format!("{}: {}", log.level.as_str(), log.message));
            }
            ProtocolEvent::Message(ConnectorMessage::Trace { trace })
                if trace.trace_type == TraceType::Error =>
            {
                if let Some(err) = &trace.error {
                    self.last_trace = Some(err.detail());
                }
            }
            ProtocolEvent::DecodeError { raw, error } => {
                tracing::warn!(
                    connector_id = %self.connector_id,
                    %error,
                    raw = %truncate(raw, 256),
                    "skipping undecodable connector line"
                );
            }
            _ => {}
        }
    }

    /// Output closed: collect the exit code within the grace period.
    async fn finish(&mut self) -> Result<Option<ProtocolEvent>> {
        self.finished = true;
        let Some(control) = self.control.take() else {
            return Ok(None);
        };
        let code = match tokio::time::timeout(self.grace, control.wait()).await {
            Ok(code) => code?,
            Err(_) => {
                tracing::warn!(connector_id = %self.connector_id, "connector closed its output but did not exit");
                stop(control.as_ref(), self.grace).await
            }
        };
        self.exit_code = Some(code);
        if code == 0 {
            tracing::debug!(connector_id = %self.connector_id, "connector exited cleanly");
            return Ok(None);
        }
        tracing::warn!(connector_id = %self.connector_id, exit_code = code, "connector exited with failure");
        Err(Error::ConnectorFailed {
            exit_code: code,
            last_trace: self.last_trace.clone(),
            stderr_tail: self.ring.tail(),
        })
    }

    /// Stop the connector: graceful request, then a forced kill after the
    /// grace period. No events are yielded afterwards.
    pub async fn terminate(&mut self) {
        self.finished = true;
        self.output.close();
        if let Some(control) = self.control.take() {
            let code = stop(control.as_ref(), self.grace).await;
            self.exit_code = Some(code);
        }
    }

    /// Give a connector that already delivered its answer a moment to exit on
    /// its own before stopping it.
    async fn release(&mut self) {
        self.finished = true;
        self.output.close();
        if let Some(control) = self.control.take() {
            let code = match tokio::time::timeout(self.grace, control.wait()).await {
                Ok(Ok(code)) => code,
                _ => stop(control.as_ref(), self.grace).await,
            };
            self.exit_code = Some(code);
        }
    }

    fn missing(&self, what: &str, exit_code: Option<i32>) -> Error {
        Error::ProcessError {
            message: match &self.last_trace {
                Some(trace) => format!("connector exited without {what}: {trace}"),
                None => format!("connector exited without {what}"),
            },
            exit_code,
            stderr_tail: self.ring.tail(),
        }
    }

    pub fn last_trace(&self) -> Option<&str> {
        self.last_trace.as_deref()
    }

    pub fn stderr_tail(&self) -> Vec<String> {
        self.ring.tail()
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

impl Drop for ReadStream {
    fn drop(&mut self) {
        let Some(control) = self.control.take() else {
            return;
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let connector_id = self.connector_id.clone();
        handle.spawn(async move {
            tracing::debug!(%connector_id, process = %control.describe(), "killing abandoned connector");
            let _ = control.kill().await;
        });
    }
}

/// Graceful stop, forced kill after `grace`. Returns the exit code.
async fn stop(control: &dyn ProcessControl, grace: Duration) -> i32 {
    if let Err(e) = control.terminate().await {
        tracing::warn!(process = %control.describe(), %e, "graceful stop failed");
    }
    if let Ok(Ok(code)) = tokio::time::timeout(grace, control.wait()).await {
        return code;
    }
    tracing::warn!(process = %control.describe(), grace_ms = grace.as_millis() as u64, "connector ignored stop request; killing");
    if let Err(e) = control.kill().await {
        tracing::error!(process = %control.describe(), %e, "forced kill failed");
    }
    match tokio::time::timeout(grace, control.wait()).await {
        Ok(Ok(code)) => code,
        _ => crate::executor::launcher::KILLED_EXIT_CODE,
    }
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::in_process::{AdapterContext, InProcessConnector, InProcessLauncher};
    use crate::models::ExecutionRef;
    use crate::protocol::ConnectorInput;
    use async_trait::async_trait;

    #[derive(Clone)]
    enum Step {
        Out(&'static str),
        Err(&'static str),
        Sleep(u64),
        Hang { ignore_cancel: bool },
    }

    struct Scripted {
        steps: Vec<Step>,
        exit: i32,
    }

    #[async_trait]
    impl InProcessConnector for Scripted {
        async fn run(&self, _: InvocationMode, _: Vec<ConnectorInput>, ctx: AdapterContext) -> i32 {
            for step in &self.steps {
                match step {
                    Step::Out(line) => {
                        let _ = ctx.raw(*line).await;
                    }
                    Step::Err(line) => {
                        let _ = ctx.stderr(*line).await;
                    }
                    Step::Sleep(ms) => tokio::time::sleep(Duration::from_millis(*ms)).await,
                    Step::Hang { ignore_cancel: true } => std::future::pending::<()>().await,
                    Step::Hang { ignore_cancel: false } => {
                        ctx.cancellation().cancelled().await;
                        return 143;
                    }
                }
            }
            self.exit
        }
    }

    fn executor(steps: Vec<Step>, exit: i32) -> (ConnectorExecutor, Connector) {
        let launcher = InProcessLauncher::new();
        launcher
            .register("scripted", Arc::new(Scripted { steps, exit }))
            .unwrap();
        let config = ExecutorConfig {
            check_timeout: Duration::from_millis(500),
            discover_timeout: Duration::from_millis(500),
            read_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_millis(300),
            termination_grace: Duration::from_millis(200),
            ..ExecutorConfig::default()
        };
        let connector = Connector::new(
            "scripted-source",
            "Scripted",
            ExecutionRef::InProcess {
                adapter: "scripted".into(),
            },
            serde_json::json!({}),
        )
        .unwrap();
        (ConnectorExecutor::new(Arc::new(launcher), config), connector)
    }

    const RECORD_1: &str =
        r#"{"type":"RECORD","record":{"stream":"orders","emitted_at":1,"data":{"id":1}}}"#;
    const STATE_1: &str =
        r#"{"type":"STATE","state":{"type":"STREAM","stream":{"name":"orders"},"data":{"cursor":1}}}"#;
    const RECORD_2: &str =
        r#"{"type":"RECORD","record":{"stream":"orders","emitted_at":2,"data":{"id":2}}}"#;

    async fn drain(stream: &mut ReadStream) -> (Vec<ProtocolEvent>, Result<()>) {
        let mut events = Vec::new();
        loop {
            match stream.next_event().await {
                Ok(Some(e)) => events.push(e),
                Ok(None) => return (events, Ok(())),
                Err(e) => return (events, Err(e)),
            }
        }
    }

    #[tokio::test]
    async fn check_returns_connection_status() {
        let (exec, connector) = executor(
            vec![Step::Out(
                r#"{"type":"CONNECTION_STATUS","connection_status":{"status":"FAILED","message":"bad password"}}"#,
            )],
            0,
        );
        let status = exec.check(&connector, &serde_json::json!({})).await.unwrap();
        assert!(!status.succeeded());
        assert_eq!(status.message.as_deref(), Some("bad password"));
    }

    #[tokio::test]
    async fn check_without_status_is_a_process_error() {
        let (exec, connector) = executor(vec![Step::Err("cannot connect")], 1);
        let err = exec
            .check(&connector, &serde_json::json!({}))
            .await
            .unwrap_err();
        match err {
            Error::ProcessError {
                exit_code,
                stderr_tail,
                ..
            } => {
                assert_eq!(exit_code, Some(1));
                assert_eq!(stderr_tail, vec!["cannot connect".to_string()]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn check_that_never_answers_times_out() {
        let (exec, connector) = executor(vec![Step::Hang { ignore_cancel: false }], 0);
        let err = exec
            .check(&connector, &serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ExecutionTimeout { .. }));
    }

    #[tokio::test]
    async fn discover_returns_the_catalog() {
        let (exec, connector) = executor(
            vec![Step::Out(
                r#"{"type":"CATALOG","catalog":{"streams":[{"name":"orders","json_schema":{},"supported_sync_modes":["full_refresh","incremental"],"default_cursor_field":["id"]}]}}"#,
            )],
            0,
        );
        let catalog = exec
            .discover(&connector, &serde_json::json!({}))
            .await
            .unwrap();
        assert_eq!(catalog.streams.len(), 1);
        assert_eq!(catalog.streams[0].name, "orders");
    }

    #[tokio::test]
    async fn discover_without_catalog_fails() {
        let (exec, connector) = executor(vec![Step::Out(RECORD_1)], 0);
        let err = exec
            .discover(&connector, &serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoCatalogReturned));
    }

    #[tokio::test]
    async fn malformed_catalog_is_a_discovery_failure() {
        let (exec, connector) = executor(
            vec![Step::Out(r#"{"type":"CATALOG","catalog":{"streams":"nope"}}"#)],
            0,
        );
        let err = exec
            .discover(&connector, &serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DiscoveryFailed(_)));
    }

    #[tokio::test]
    async fn read_streams_events_and_skips_bad_lines() {
        let (exec, connector) = executor(
            vec![
                Step::Out(RECORD_1),
                Step::Out("{not json"),
                Step::Out(""),
                Step::Out(STATE_1),
                Step::Out(RECORD_2),
            ],
            0,
        );
        let mut stream = exec
            .read(
                &connector,
                &serde_json::json!({}),
                &ConfiguredCatalog::default(),
                &[],
                CancellationToken::new(),
            )
            .await
            .unwrap();
        let (events, end) = drain(&mut stream).await;
        end.unwrap();
        assert_eq!(events.len(), 4);
        assert!(matches!(events[1], ProtocolEvent::DecodeError { .. }));
        assert!(matches!(
            events[2],
            ProtocolEvent::Message(ConnectorMessage::State { .. })
        ));
        assert_eq!(stream.exit_code(), Some(0));
        assert!(stream.next_event().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn non_zero_exit_carries_trace_and_stderr() {
        let (exec, connector) = executor(
            vec![
                Step::Out(RECORD_1),
                Step::Err("connection reset"),
                Step::Out(
                    r#"{"type":"TRACE","trace":{"type":"ERROR","error":{"message":"upstream gone"}}}"#,
                ),
            ],
            2,
        );
        let mut stream = exec
            .read(
                &connector,
                &serde_json::json!({}),
                &ConfiguredCatalog::default(),
                &[],
                CancellationToken::new(),
            )
            .await
            .unwrap();
        let (events, end) = drain(&mut stream).await;
        assert_eq!(events.len(), 2);
        match end.unwrap_err() {
            Error::ConnectorFailed {
                exit_code,
                last_trace,
                stderr_tail,
            } => {
                assert_eq!(exit_code, 2);
                assert_eq!(last_trace.as_deref(), Some("upstream gone"));
                assert!(stderr_tail.contains(&"connection reset".to_string()));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn silent_connector_hits_idle_timeout() {
        let (exec, connector) = executor(vec![Step::Out(RECORD_1), Step::Sleep(2_000)], 0);
        let mut stream = exec
            .read(
                &connector,
                &serde_json::json!({}),
                &ConfiguredCatalog::default(),
                &[],
                CancellationToken::new(),
            )
            .await
            .unwrap();
        let (events, end) = drain(&mut stream).await;
        assert_eq!(events.len(), 1);
        assert!(matches!(end, Err(Error::IdleTimeout { .. })));
        assert!(stream.is_finished());
        assert!(stream.next_event().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn cancel_stops_a_connector_that_ignores_termination() {
        let (exec, connector) = executor(
            vec![Step::Out(RECORD_1), Step::Hang { ignore_cancel: true }],
            0,
        );
        let cancel = CancellationToken::new();
        let mut stream = exec
            .read(
                &connector,
                &serde_json::json!({}),
                &ConfiguredCatalog::default(),
                &[],
                cancel.clone(),
            )
            .await
            .unwrap();
        assert!(stream.next_event().await.unwrap().is_some());
        cancel.cancel();
        let started = Instant::now();
        let err = stream.next_event().await.unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        // grace (200ms) plus a forced kill
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(
            stream.exit_code(),
            Some(crate::executor::launcher::KILLED_EXIT_CODE)
        );
    }
}
