//! STDIO upstream adapter.
//!
//! The server's `service_endpoint` is interpreted as a command line. The
//! child's stdout is read line by line into the client channel; stderr lines
//! are forwarded into the same channel so the merged output order a client
//! observes matches a combined pipe. Sending writes one JSON line to the
//! child's stdin. Close asks the process to exit and kills it after the
//! configured grace period.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::{Child, ChildStdin},
    sync::Mutex,
};
use tokio_util::sync::CancellationToken;

use super::{
    ClientEvent, ClientSink, ConnectionHandle, EstablishContext, PumpEnd, TerminalHook,
    TransportAdapter, UpstreamConnection, finish_pump,
};
use crate::{
    GatewayError, GatewayResult,
    config::TransportConfig,
    model::{Session, SessionId, UpstreamServerConfig},
    process::spawn_piped,
};

pub struct StdioAdapter {
    config: TransportConfig,
}

impl StdioAdapter {
    pub fn new(config: TransportConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl TransportAdapter for StdioAdapter {
    async fn establish(
        &self,
        session: &Session,
        config: &UpstreamServerConfig,
        ctx: EstablishContext,
    ) -> GatewayResult<ConnectionHandle> {
        let command = config.service_endpoint.as_str();
        tracing::debug!(session_id = %session.id, command, "spawning stdio server process");
        let mut child = spawn_piped(command, None)?;

        let stdin = child.stdin.take().ok_or_else(|| GatewayError::ProcessStartFailed {
            command: command.to_string(),
            reason: "failed to capture stdin".to_string(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| GatewayError::ProcessStartFailed {
            command: command.to_string(),
            reason: "failed to capture stdout".to_string(),
        })?;
        let stderr = child.stderr.take().ok_or_else(|| GatewayError::ProcessStartFailed {
            command: command.to_string(),
            reason: "failed to capture stderr".to_string(),
        })?;

        let ct = CancellationToken::new();
        tokio::spawn(run_stdout_reader(
            BufReader::new(stdout),
            ctx.sink.clone(),
            ct.clone(),
            ctx.on_terminal,
            session.id.clone(),
        ));
        tokio::spawn(run_stderr_reader(
            BufReader::new(stderr),
            ctx.sink,
            ct.clone(),
            session.id.clone(),
        ));

        Ok(std::sync::Arc::new(StdioConnection {
            state: Mutex::new(StdioState {
                child: Some(child),
                stdin: Some(stdin),
            }),
            ct,
            shutdown_grace: self.config.stdio_shutdown_grace,
        }))
    }
}

struct StdioState {
    child: Option<Child>,
    stdin: Option<ChildStdin>,
}

struct StdioConnection {
    state: Mutex<StdioState>,
    ct: CancellationToken,
    shutdown_grace: Duration,
}

#[async_trait]
impl UpstreamConnection for StdioConnection {
    async fn send(&self, message: Value) -> GatewayResult<()> {
        let mut state = self.state.lock().await;
        let stdin = state.stdin.as_mut().ok_or_else(|| {
            GatewayError::UpstreamConnectionFailed("process stdin already closed".into())
        })?;
        let mut line = message.to_string();
        line.push('\n');
        let written = async {
            stdin.write_all(line.as_bytes()).await?;
            stdin.flush().await
        }
        .await;
        written.map_err(|error| {
            tracing::warn!(error = %error, "failed to write to stdio server process");
            GatewayError::UpstreamConnectionFailed("server process rejected input".into())
        })
    }

    async fn close(&self) {
        self.ct.cancel();
        let mut state = self.state.lock().await;
        // Closing stdin asks a well-behaved server to exit.
        state.stdin.take();
        let Some(mut child) = state.child.take() else {
            return;
        };
        match tokio::time::timeout(self.shutdown_grace, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!(%status, "stdio server process exited");
            }
            Ok(Err(error)) => {
                tracing::warn!(error = %error, "failed waiting for stdio server process");
            }
            Err(_) => {
                tracing::warn!("stdio server process did not exit in time, killing");
                let _ = child.kill().await;
                let _ = child.wait().await;
            }
        }
    }
}

fn parse_output_line(line: &str) -> Value {
    serde_json::from_str(line).unwrap_or_else(|_| Value::String(line.to_string()))
}

async fn run_stdout_reader(
    reader: BufReader<tokio::process::ChildStdout>,
    sink: ClientSink,
    ct: CancellationToken,
    on_terminal: TerminalHook,
    session_id: SessionId,
) {
    let mut lines = reader.lines();
    let end = loop {
        let line = tokio::select! {
            _ = ct.cancelled() => break PumpEnd::Cancelled,
            line = lines.next_line() => line,
        };
        match line {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                if sink
                    .send(ClientEvent::Message(parse_output_line(line.trim())))
                    .await
                    .is_err()
                {
                    break PumpEnd::ClientGone;
                }
            }
            Ok(None) => {
                tracing::debug!(session_id = %session_id, "stdio server process closed stdout");
                break PumpEnd::Upstream(ClientEvent::Complete);
            }
            Err(error) => {
                tracing::warn!(session_id = %session_id, error = %error, "stdout read failed");
                break PumpEnd::Upstream(ClientEvent::Error {
                    message: "server process output error".to_string(),
                });
            }
        }
    };
    finish_pump(&sink, &on_terminal, end).await;
}

/// Stderr lines join the same client queue as stdout; only stdout EOF is
/// terminal.
async fn run_stderr_reader(
    reader: BufReader<tokio::process::ChildStderr>,
    sink: ClientSink,
    ct: CancellationToken,
    session_id: SessionId,
) {
    let mut lines = reader.lines();
    loop {
        let line = tokio::select! {
            _ = ct.cancelled() => break,
            line = lines.next_line() => line,
        };
        match line {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                if sink
                    .send(ClientEvent::Message(parse_output_line(line.trim())))
                    .await
                    .is_err()
                {
                    break;
                }
            }
            Ok(None) => break,
            Err(error) => {
                tracing::debug!(session_id = %session_id, error = %error, "stderr read failed");
                break;
            }
        }
    }
}
