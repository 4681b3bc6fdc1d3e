//! Supervisor for local MCP server processes.
//!
//! Each supervised process speaks JSON-RPC over its stdio pipes with strict
//! one-line-out, one-line-in correlation. Requests to the same process are
//! single-flight: concurrent callers serialize on the per-process lock, and
//! no multiplexing of in-flight requests is supported.

use std::{collections::HashMap, path::Path, process::Stdio, sync::Arc};

use serde_json::Value;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines},
    process::{Child, ChildStdin, ChildStdout, Command},
    sync::{Mutex, RwLock},
};

use crate::{GatewayError, GatewayResult, config::SupervisorConfig};

pub(crate) fn split_command(command: &str) -> GatewayResult<(String, Vec<String>)> {
    let mut parts = command.split_whitespace().map(str::to_string);
    let program = parts
        .next()
        .ok_or_else(|| GatewayError::ProcessStartFailed {
            command: command.to_string(),
            reason: "empty command".to_string(),
        })?;
    Ok((program, parts.collect()))
}

/// Spawn a command with all three stdio pipes captured. Shared between the
/// supervisor and the STDIO transport adapter.
pub(crate) fn spawn_piped(command: &str, working_dir: Option<&Path>) -> GatewayResult<Child> {
    let (program, args) = split_command(command)?;
    let mut cmd = Command::new(&program);
    cmd.args(&args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = working_dir {
        cmd.current_dir(dir);
    }
    cmd.spawn().map_err(|error| GatewayError::ProcessStartFailed {
        command: command.to_string(),
        reason: error.to_string(),
    })
}

pub struct SupervisedProcess {
    server_id: String,
    command: String,
    io: Mutex<ProcessIo>,
}

impl SupervisedProcess {
    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    pub fn command(&self) -> &str {
        &self.command
    }
}

struct ProcessIo {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: Lines<BufReader<ChildStdout>>,
}

pub struct ProcessSupervisor {
    processes: RwLock<HashMap<String, Arc<SupervisedProcess>>>,
    config: SupervisorConfig,
}

impl ProcessSupervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        Self {
            processes: RwLock::new(HashMap::new()),
            config,
        }
    }

    /// Spawn and register a process for `server_id`, replacing any previous
    /// one. Waits out the startup grace period so a command that dies on
    /// launch is reported as `ProcessStartFailed` instead of a dead handle.
    pub async fn start(
        &self,
        server_id: &str,
        command: &str,
        working_dir: Option<&Path>,
    ) -> GatewayResult<Arc<SupervisedProcess>> {
        if self.processes.read().await.contains_key(server_id) {
            let _ = self.stop(server_id).await;
        }
        tracing::info!(server_id, command, "starting local server process");
        let mut child = spawn_piped(command, working_dir)?;

        let stdin = child.stdin.take().ok_or_else(|| GatewayError::ProcessStartFailed {
            command: command.to_string(),
            reason: "failed to capture stdin".to_string(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| GatewayError::ProcessStartFailed {
            command: command.to_string(),
            reason: "failed to capture stdout".to_string(),
        })?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(drain_stderr(BufReader::new(stderr), server_id.to_string()));
        }

        tokio::time::sleep(self.config.startup_grace).await;
        if let Ok(Some(status)) = child.try_wait() {
            return Err(GatewayError::ProcessStartFailed {
                command: command.to_string(),
                reason: format!("exited during startup: {status}"),
            });
        }

        let process = Arc::new(SupervisedProcess {
            server_id: server_id.to_string(),
            command: command.to_string(),
            io: Mutex::new(ProcessIo {
                child,
                stdin: Some(stdin),
                stdout: BufReader::new(stdout).lines(),
            }),
        });
        self.processes
            .write()
            .await
            .insert(server_id.to_string(), process.clone());
        Ok(process)
    }

    /// One synchronous JSON-RPC round trip: write a line, read a line.
    /// Strictly single-flight per process.
    pub async fn request(&self, server_id: &str, payload: &Value) -> GatewayResult<Value> {
        let process = self
            .processes
            .read()
            .await
            .get(server_id)
            .cloned()
            .ok_or_else(|| GatewayError::ProcessNotFound(server_id.to_string()))?;
        let mut io = process.io.lock().await;

        let stdin = io.stdin.as_mut().ok_or_else(|| {
            GatewayError::UpstreamConnectionFailed("server process is shutting down".into())
        })?;
        let mut line = payload.to_string();
        line.push('\n');
        let written = async {
            stdin.write_all(line.as_bytes()).await?;
            stdin.flush().await
        }
        .await;
        if let Err(error) = written {
            tracing::error!(server_id, error = %error, "failed to write to server process");
            self.discard(server_id, &mut io).await;
            return Err(GatewayError::UpstreamConnectionFailed(
                "server process rejected input".into(),
            ));
        }

        match tokio::time::timeout(self.config.request_timeout, io.stdout.next_line()).await {
            Ok(Ok(Some(response))) => Ok(serde_json::from_str(&response)?),
            Ok(Ok(None)) => {
                tracing::error!(server_id, "server process exited before responding");
                self.discard(server_id, &mut io).await;
                Err(GatewayError::UpstreamConnectionFailed(
                    "server process exited before responding".into(),
                ))
            }
            Ok(Err(error)) => {
                tracing::error!(server_id, error = %error, "failed to read from server process");
                self.discard(server_id, &mut io).await;
                Err(GatewayError::UpstreamConnectionFailed(
                    "server process output error".into(),
                ))
            }
            Err(_) => {
                tracing::error!(server_id, "timed out waiting for server process response");
                self.discard(server_id, &mut io).await;
                Err(GatewayError::UpstreamTimeout(self.config.request_timeout))
            }
        }
    }

    /// Ask the process to exit, escalating to kill after the grace period.
    pub async fn stop(&self, server_id: &str) -> GatewayResult<()> {
        let process = self
            .processes
            .write()
            .await
            .remove(server_id)
            .ok_or_else(|| GatewayError::ProcessNotFound(server_id.to_string()))?;
        tracing::info!(server_id, "stopping local server process");
        let mut io = process.io.lock().await;
        io.stdin.take();
        match tokio::time::timeout(self.config.shutdown_grace, io.child.wait()).await {
            Ok(Ok(status)) => {
                tracing::info!(server_id, %status, "server process exited");
            }
            Ok(Err(error)) => {
                tracing::warn!(server_id, error = %error, "failed waiting for server process");
            }
            Err(_) => {
                tracing::warn!(server_id, "server process did not exit in time, killing");
                let _ = io.child.kill().await;
                let _ = io.child.wait().await;
            }
        }
        Ok(())
    }

    pub async fn stop_all(&self) {
        let server_ids: Vec<String> = self.processes.read().await.keys().cloned().collect();
        for server_id in server_ids {
            let _ = self.stop(&server_id).await;
        }
    }

    pub async fn running(&self) -> Vec<String> {
        self.processes.read().await.keys().cloned().collect()
    }

    /// Kill, reap and deregister a process whose pipes failed mid-request.
    async fn discard(&self, server_id: &str, io: &mut ProcessIo) {
        io.stdin.take();
        let _ = io.child.kill().await;
        let _ = io.child.wait().await;
        self.processes.write().await.remove(server_id);
    }
}

async fn drain_stderr(reader: BufReader<tokio::process::ChildStderr>, server_id: String) {
    let mut lines = reader.lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        tracing::debug!(server_id = %server_id, stderr = %line);
    }
    tracing::debug!(server_id = %server_id, "stderr stream closed");
}
