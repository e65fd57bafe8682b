use crate::executor::launcher::{
    ConnectorLauncher, Invocation, KILLED_EXIT_CODE, LaunchedProcess, OUTPUT_CHANNEL_CAPACITY,
    OutputLine, ProcessControl, wait_for_exit,
};
use crate::models::{Connector, ExecutionRef};
use crate::protocol::codec::DEFAULT_MAX_LINE_BYTES;
use crate::{Error, Result};
use async_trait::async_trait;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{Notify, mpsc, watch};
use uuid::Uuid;

/// Launches `Command` and `Docker` connectors as child processes.
///
/// The mode is appended as the last argument; input lines are written to
/// stdin, which is then closed.
#[derive(Debug, Clone)]
pub struct SubprocessLauncher {
    docker_bin: String,
    max_line_bytes: usize,
}

/// Bytes of an oversized stderr line kept for diagnostics.
const STDERR_HEAD_BYTES: usize = 1024;

impl Default for SubprocessLauncher {
    fn default() -> Self {
        Self {
            docker_bin: "docker".to_string(),
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
        }
    }
}

impl SubprocessLauncher {
    #[tracing::instrument(level = "debug")]
    pub fn new(docker_bin: impl Into<String> + std::fmt::Debug) -> Result<Self> {
        let docker_bin = docker_bin.into();
        if docker_bin.trim().is_empty() {
            return Err(Error::InvalidInput("docker_bin is empty".to_string()));
        }
        Ok(Self {
            docker_bin,
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
        })
    }

    /// Longest output line buffered in memory; longer lines are cut off and
    /// reported as oversized.
    pub fn with_max_line_bytes(mut self, max_line_bytes: usize) -> Self {
        self.max_line_bytes = max_line_bytes.max(1);
        self
    }

    fn build_command(&self, connector: &Connector, invocation: &Invocation) -> Result<(Command, Stop)> {
        let mode = invocation.mode.as_str();
        match &connector.execution {
            ExecutionRef::Command { program, args, env } => {
                let mut cmd = Command::new(program);
                cmd.args(args).arg(mode);
                for (k, v) in env {
                    cmd.env(k, v);
                }
                Ok((cmd, Stop::Signal))
            }
            ExecutionRef::Docker { image, args } => {
                // `docker run --rm -i --name <name> <image> <args...> <mode>`
                let name = format!("conduit-{}-{}", sanitize(&connector.id), Uuid::new_v4().simple());
                let mut cmd = Command::new(&self.docker_bin);
                cmd.args(["run", "--rm", "-i", "--name", &name, image])
                    .args(args)
                    .arg(mode);
                Ok((
                    cmd,
                    Stop::Container {
                        docker_bin: self.docker_bin.clone(),
                        name,
                    },
                ))
            }
            ExecutionRef::InProcess { adapter } => Err(Error::InvalidInput(format!(
                "connector '{}' uses in-process adapter '{adapter}'; use InProcessLauncher",
                connector.id
            ))),
        }
    }
}

fn sanitize(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect()
}

/// How a graceful stop is requested.
#[derive(Debug, Clone)]
enum Stop {
    Signal,
    Container { docker_bin: String, name: String },
}

struct ChildControl {
    label: String,
    pid: Option<u32>,
    stop: Stop,
    kill: Arc<Notify>,
    exit: watch::Receiver<Option<i32>>,
}

#[async_trait]
impl ProcessControl for ChildControl {
    fn describe(&self) -> String {
        self.label.clone()
    }

    #[tracing::instrument(level = "debug", skip_all, fields(process = %self.label))]
    async fn terminate(&self) -> Result<()> {
        if self.exit.borrow().is_some() {
            return Ok(());
        }
        let out = match &self.stop {
            Stop::Signal => {
                let Some(pid) = self.pid else {
                    return Ok(());
                };
                Command::new("kill")
                    .args(["-TERM", &pid.to_string()])
                    .output()
                    .await
            }
            Stop::Container { docker_bin, name } => {
                Command::new(docker_bin)
                    .args(["kill", "--signal", "TERM", name])
                    .output()
                    .await
            }
        }
        .map_err(|e| Error::backend("send terminate signal", e))?;
        if !out.status.success() {
            // Usually the process is already gone.
            tracing::debug!(
                stderr = %String::from_utf8_lossy(&out.stderr).trim(),
                "terminate signal not delivered"
            );
        }
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip_all, fields(process = %self.label))]
    async fn kill(&self) -> Result<()> {
        if let Stop::Container { docker_bin, name } = &self.stop {
            let _ = Command::new(docker_bin).args(["kill", name]).output().await;
        }
        self.kill.notify_one();
        Ok(())
    }

    async fn wait(&self) -> Result<i32> {
        wait_for_exit(self.exit.clone()).await
    }
}

#[async_trait]
impl ConnectorLauncher for SubprocessLauncher {
    #[tracing::instrument(level = "info", skip_all, fields(connector_id = %connector.id, mode = invocation.mode.as_str()))]
    async fn launch(
        &self,
        connector: &Connector,
        invocation: Invocation,
    ) -> Result<LaunchedProcess> {
        let (mut cmd, stop) = self.build_command(connector, &invocation)?;
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::backend(format!("spawn connector '{}'", connector.id), e))?;
        let pid = child.id();

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::BackendMessage("connector missing stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::BackendMessage("connector missing stdout".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::BackendMessage("connector missing stderr".to_string()))?;

        let input = invocation.input_lines;
        tokio::spawn(async move {
            let mut stdin = stdin;
            for line in input {
                // A connector may exit without reading its input.
                if stdin.write_all(line.as_bytes()).await.is_err()
                    || stdin.write_all(b"\n").await.is_err()
                {
                    tracing::debug!("connector closed stdin early");
                    return;
                }
            }
            let _ = stdin.flush().await;
        });

        let (tx, rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        tokio::spawn(pump_lines(stdout, tx.clone(), Channel::Stdout, self.max_line_bytes));
        tokio::spawn(pump_lines(stderr, tx, Channel::Stderr, self.max_line_bytes));

        let kill = Arc::new(Notify::new());
        let (exit_tx, exit_rx) = watch::channel(None);
        let kill_signal = kill.clone();
        let connector_id = connector.id.clone();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = kill_signal.notified() => {
                    let _ = child.start_kill();
                    child.wait().await
                }
            };
            let code = match status {
                Ok(s) => s.code().unwrap_or(KILLED_EXIT_CODE),
                Err(e) => {
                    tracing::warn!(%connector_id, %e, "failed to reap connector process");
                    KILLED_EXIT_CODE
                }
            };
            tracing::debug!(%connector_id, exit_code = code, "connector process exited");
            let _ = exit_tx.send(Some(code));
        });

        let label = match (&stop, pid) {
            (Stop::Container { name, .. }, _) => format!("container:{name}"),
            (Stop::Signal, Some(pid)) => format!("pid:{pid}"),
            (Stop::Signal, None) => "pid:unknown".to_string(),
        };
        Ok(LaunchedProcess {
            output: rx,
            control: Box::new(ChildControl {
                label,
                pid,
                stop,
                kill,
                exit: exit_rx,
            }),
        })
    }
}

#[derive(Debug, Clone, Copy)]
enum Channel {
    Stdout,
    Stderr,
}

impl Channel {
    fn line(self, buf: &[u8], bytes: usize, max: usize) -> OutputLine {
        let text = |b: &[u8]| String::from_utf8_lossy(b).into_owned();
        match self {
            Channel::Stdout if bytes > max => OutputLine::Oversized {
                bytes,
                head: text(buf),
            },
            Channel::Stdout => OutputLine::Stdout(text(buf)),
            Channel::Stderr if bytes > max => OutputLine::Stderr(format!(
                "{} ... ({bytes} bytes)",
                text(&buf[..buf.len().min(STDERR_HEAD_BYTES)])
            )),
            Channel::Stderr => OutputLine::Stderr(text(buf)),
        }
    }
}

/// Read one `\n`-terminated line keeping at most `max` bytes of it in `buf`.
///
/// Returns the full length of the line (without the newline), or `None` at EOF.
async fn read_bounded_line<R>(reader: &mut R, buf: &mut Vec<u8>, max: usize) -> std::io::Result<Option<usize>>
where
    R: AsyncBufRead + Unpin,
{
    let mut total = 0usize;
    loop {
        let (used, found) = {
            let available = reader.fill_buf().await?;
            if available.is_empty() {
                return Ok((total > 0).then_some(total));
            }
            let (end, found) = match available.iter().position(|b| *b == b'\n') {
                Some(i) => (i, true),
                None => (available.len(), false),
            };
            let room = max.saturating_sub(buf.len());
            buf.extend_from_slice(&available[..end.min(room)]);
            total += end;
            (if found { end + 1 } else { end }, found)
        };
        reader.consume(used);
        if found {
            return Ok(Some(total));
        }
    }
}

/// Forward newline-delimited output into the channel until EOF or until the
/// receiver goes away. Invalid UTF-8 is replaced rather than dropped; lines
/// longer than `max` bytes are cut off and flagged.
async fn pump_lines<R>(reader: R, tx: mpsc::Sender<OutputLine>, channel: Channel, max: usize)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match read_bounded_line(&mut reader, &mut buf, max).await {
            Ok(None) => return,
            Ok(Some(mut bytes)) => {
                while matches!(buf.last(), Some(b'\r')) {
                    buf.pop();
                    bytes -= 1;
                }
                if tx.send(channel.line(&buf, bytes, max)).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                tracing::debug!(%e, "connector output read failed");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::InvocationMode;
    use std::collections::BTreeMap;

    fn sh(script: &str) -> Connector {
        Connector::new(
            "sh-test",
            "shell",
            ExecutionRef::Command {
                program: "sh".into(),
                args: vec!["-c".into(), script.into(), "connector".into()],
                env: BTreeMap::new(),
            },
            serde_json::json!({}),
        )
        .unwrap()
    }

    async fn collect(mut p: LaunchedProcess) -> (Vec<OutputLine>, i32) {
        let mut lines = Vec::new();
        while let Some(l) = p.output.recv().await {
            lines.push(l);
        }
        let code = p.control.wait().await.unwrap();
        (lines, code)
    }

    #[tokio::test]
    async fn mode_is_passed_and_stdin_is_forwarded() {
        // `$1` is the mode appended after `connector` ($0).
        let connector = sh(r#"echo "mode=$1"; read line; echo "got=$line"; echo oops >&2"#);
        let launched = SubprocessLauncher::default()
            .launch(
                &connector,
                Invocation {
                    mode: InvocationMode::Check,
                    input_lines: vec!["hello".into()],
                },
            )
            .await
            .unwrap();
        let (lines, code) = collect(launched).await;
        assert_eq!(code, 0);
        assert!(lines.contains(&OutputLine::Stdout("mode=check".into())));
        assert!(lines.contains(&OutputLine::Stdout("got=hello".into())));
        assert!(lines.contains(&OutputLine::Stderr("oops".into())));
    }

    #[tokio::test]
    async fn exit_code_is_reported() {
        let launched = SubprocessLauncher::default()
            .launch(
                &sh("exit 3"),
                Invocation {
                    mode: InvocationMode::Read,
                    input_lines: vec![],
                },
            )
            .await
            .unwrap();
        let (_, code) = collect(launched).await;
        assert_eq!(code, 3);
    }

    #[tokio::test]
    async fn kill_stops_a_process_that_ignores_terminate() {
        let launched = SubprocessLauncher::default()
            .launch(
                &sh("trap '' TERM; while true; do sleep 1; done"),
                Invocation {
                    mode: InvocationMode::Read,
                    input_lines: vec![],
                },
            )
            .await
            .unwrap();
        launched.control.terminate().await.unwrap();
        let still_running =
            tokio::time::timeout(std::time::Duration::from_millis(300), launched.control.wait())
                .await
                .is_err();
        assert!(still_running);
        launched.control.kill().await.unwrap();
        let code = tokio::time::timeout(std::time::Duration::from_secs(5), launched.control.wait())
            .await
            .expect("process reaped after kill")
            .unwrap();
        assert_eq!(code, KILLED_EXIT_CODE);
    }

    #[tokio::test]
    async fn long_lines_are_cut_off_and_reading_continues() {
        // 5000 bytes without a newline, then a normal line.
        let connector = sh(r#"head -c 5000 /dev/zero | tr '\0' x; echo; echo after; head -c 3000 /dev/zero | tr '\0' y >&2; echo >&2"#);
        let launched = SubprocessLauncher::default()
            .with_max_line_bytes(100)
            .launch(
                &connector,
                Invocation {
                    mode: InvocationMode::Read,
                    input_lines: vec![],
                },
            )
            .await
            .unwrap();
        let (lines, code) = collect(launched).await;
        assert_eq!(code, 0);

        let oversized: Vec<_> = lines
            .iter()
            .filter_map(|l| match l {
                OutputLine::Oversized { bytes, head } => Some((*bytes, head.len())),
                _ => None,
            })
            .collect();
        assert_eq!(oversized, vec![(5000, 100)]);
        assert!(lines.contains(&OutputLine::Stdout("after".into())));
        assert!(lines.iter().any(|l| matches!(
            l,
            OutputLine::Stderr(s) if s.ends_with("(3000 bytes)") && s.len() < 200
        )));
    }

    #[tokio::test]
    async fn bounded_reader_splits_lines_across_buffer_refills() {
        let data: &[u8] = b"abcdefgh\nij\r\n\nlast";
        // A tiny buffer forces several `fill_buf` calls per line.
        let mut reader = BufReader::with_capacity(3, data);
        let mut buf = Vec::new();
        assert_eq!(read_bounded_line(&mut reader, &mut buf, 4).await.unwrap(), Some(8));
        assert_eq!(buf, b"abcd");
        buf.clear();
        assert_eq!(read_bounded_line(&mut reader, &mut buf, 4).await.unwrap(), Some(3));
        assert_eq!(buf, b"ij\r");
        buf.clear();
        assert_eq!(read_bounded_line(&mut reader, &mut buf, 4).await.unwrap(), Some(0));
        buf.clear();
        assert_eq!(read_bounded_line(&mut reader, &mut buf, 4).await.unwrap(), Some(4));
        assert_eq!(buf, b"last");
        buf.clear();
        assert_eq!(read_bounded_line(&mut reader, &mut buf, 4).await.unwrap(), None);
    }

    #[test]
    fn in_process_connectors_are_rejected() {
        let connector = Connector::new(
            "inproc",
            "adapter",
            ExecutionRef::InProcess {
                adapter: "faker".into(),
            },
            serde_json::json!({}),
        )
        .unwrap();
        let err = SubprocessLauncher::default()
            .build_command(
                &connector,
                &Invocation {
                    mode: InvocationMode::Spec,
                    input_lines: vec![],
                },
            )
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }
}
