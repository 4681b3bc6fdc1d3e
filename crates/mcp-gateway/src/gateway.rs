//! The gateway facade: session creation, channel establishment, message
//! forwarding, guarded direct tool calls and shutdown.

use std::sync::Arc;

use serde_json::{Value, json};
use tokio::sync::mpsc;

use crate::{
    GatewayError, GatewayResult,
    config::GatewayConfig,
    endpoint::{self, ResolvedEndpoint},
    model::{Session, SessionId, TransportType, message::GatewayMessage},
    process::ProcessSupervisor,
    resilience::{GuardedOutcome, ResilientCaller, UpstreamCall},
    servers::ServerRegistry,
    session::{ConnectionRegistry, SessionManager},
    transport::{ClientEvent, EstablishContext, TerminalHook, TransportAdapters},
    usage::UsageRecorder,
};

/// Owns the shared HTTP client, the connection registry, the session
/// manager, the four transport adapters, the per-server circuit breakers
/// and the local-process supervisor. Created once at startup; `shutdown`
/// drains every live connection and supervised process.
pub struct Gateway {
    http: reqwest::Client,
    servers: Arc<dyn ServerRegistry>,
    registry: Arc<ConnectionRegistry>,
    sessions: Arc<SessionManager>,
    adapters: TransportAdapters,
    resilience: ResilientCaller,
    supervisor: ProcessSupervisor,
    config: GatewayConfig,
}

impl Gateway {
    pub fn new(
        servers: Arc<dyn ServerRegistry>,
        usage: Arc<dyn UsageRecorder>,
        config: GatewayConfig,
    ) -> Self {
        let http = reqwest::Client::new();
        let registry = Arc::new(ConnectionRegistry::new());
        let sessions = Arc::new(SessionManager::new(
            registry.clone(),
            usage,
            config.session.clone(),
        ));
        let adapters = TransportAdapters::new(http.clone(), config.transport.clone());
        let resilience = ResilientCaller::new(config.circuit_breaker.clone());
        let supervisor = ProcessSupervisor::new(config.supervisor.clone());
        Self {
            http,
            servers,
            registry,
            sessions,
            adapters,
            resilience,
            supervisor,
            config,
        }
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn supervisor(&self) -> &ProcessSupervisor {
        &self.supervisor
    }

    /// Create a session of the requested transport type against a registered
    /// server.
    pub async fn create_session(
        &self,
        server_id: &str,
        transport_type: TransportType,
        owner: &str,
    ) -> GatewayResult<Session> {
        let server_config = self.servers.get(server_id);
        self.sessions
            .create_session(server_id, server_config.as_deref(), transport_type, owner)
            .await
    }

    /// Open the session's upstream channel and return the client-facing
    /// event stream. Establishment failures do not raise: they surface as a
    /// single sanitized error event on the returned channel and the session
    /// is torn down.
    pub async fn establish(
        &self,
        session_id: &SessionId,
    ) -> GatewayResult<mpsc::Receiver<ClientEvent>> {
        let session = self.sessions.touch(session_id).await?;
        let server_config = self.servers.get(&session.server_id).ok_or_else(|| {
            GatewayError::ServerUnavailable(
                format!("no configuration for server {}", session.server_id).into(),
            )
        })?;
        let (sink, events) = mpsc::channel(self.config.transport.channel_buffer_capacity);

        let on_terminal: TerminalHook = {
            let sessions = self.sessions.clone();
            let session_id = session.id.clone();
            Arc::new(move || {
                let sessions = sessions.clone();
                let session_id = session_id.clone();
                tokio::spawn(async move {
                    let _ = sessions.close(&session_id).await;
                });
            })
        };

        let adapter = self.adapters.for_transport(session.transport_type);
        let ctx = EstablishContext {
            sink: sink.clone(),
            on_terminal,
        };
        match adapter.establish(&session, &server_config, ctx).await {
            Ok(handle) => {
                self.registry.register(session.id.clone(), handle).await;
                // The upstream channel may already have terminated; never
                // leave a handle behind a closed session.
                if let Ok(current) = self.sessions.get(session_id).await
                    && current.status.is_terminal()
                {
                    self.registry.close(session_id).await;
                } else {
                    self.sessions.mark_connected(session_id).await?;
                }
                let _ = sink
                    .send(ClientEvent::Connected {
                        session_id: session.id.clone(),
                    })
                    .await;
                self.sessions
                    .record(session_id, &server_config.service_endpoint, "GET", 200);
                Ok(events)
            }
            Err(error) => {
                tracing::error!(
                    session_id = %session_id,
                    error = %error,
                    "failed to establish upstream connection"
                );
                let _ = sink
                    .send(ClientEvent::Error {
                        message: error.sanitized().to_string(),
                    })
                    .await;
                let _ = self.sessions.close(session_id).await;
                self.sessions
                    .record(session_id, &server_config.service_endpoint, "GET", 502);
                Ok(events)
            }
        }
    }

    /// Forward one client message (JSON-RPC or standard shape, detected
    /// automatically) on the session's upstream channel. The response, if
    /// any, arrives asynchronously on the established channel.
    pub async fn send_message(&self, session_id: &SessionId, raw: Value) -> GatewayResult<()> {
        let session = self.sessions.touch(session_id).await?;
        let endpoint = self
            .servers
            .get(&session.server_id)
            .map(|config| {
                config
                    .message_endpoint
                    .clone()
                    .unwrap_or_else(|| config.service_endpoint.clone())
            })
            .unwrap_or_else(|| session.server_id.clone());
        let message = GatewayMessage::parse(raw)?;
        match self.registry.send(session_id, message.to_upstream()).await {
            Ok(()) => {
                self.sessions.mark_active(session_id).await?;
                self.sessions.record(session_id, &endpoint, "POST", 200);
                Ok(())
            }
            Err(error) => {
                self.sessions.record(session_id, &endpoint, "POST", 502);
                Err(error)
            }
        }
    }

    /// Close the session and tear down its upstream connection. Idempotent.
    pub async fn close_session(&self, session_id: &SessionId) -> GatewayResult<()> {
        self.sessions.close(session_id).await
    }

    /// Execute a tool on an upstream server directly, guarded by the
    /// server's circuit breaker and the execution timeout.
    pub async fn call_tool(
        &self,
        server_id: &str,
        tool: &str,
        arguments: Value,
    ) -> GatewayResult<GuardedOutcome> {
        let endpoint = self.direct_endpoint(server_id)?;
        let payload = json!({
            "jsonrpc": "2.0",
            "method": "tools/call",
            "params": {"name": tool, "arguments": arguments},
            "id": 1,
        });
        let http = self.http.clone();
        Ok(self
            .resilience
            .call(server_id, Some(tool), UpstreamCall::ExecuteTool, || {
                post_json(http.clone(), endpoint.clone(), payload.clone())
            })
            .await)
    }

    /// List an upstream server's tools; idempotent, so retried with backoff.
    pub async fn list_tools(&self, server_id: &str) -> GatewayResult<GuardedOutcome> {
        let endpoint = self.direct_endpoint(server_id)?;
        let payload = json!({"jsonrpc": "2.0", "method": "tools/list", "id": 1});
        let http = self.http.clone();
        Ok(self
            .resilience
            .call(server_id, None, UpstreamCall::ListTools, || {
                post_json(http.clone(), endpoint.clone(), payload.clone())
            })
            .await)
    }

    /// Probe an upstream server; idempotent, short timeout.
    pub async fn health_check(&self, server_id: &str) -> GatewayResult<GuardedOutcome> {
        let endpoint = self.direct_endpoint(server_id)?;
        let payload = json!({"jsonrpc": "2.0", "method": "ping", "id": 1});
        let http = self.http.clone();
        Ok(self
            .resilience
            .call(server_id, None, UpstreamCall::HealthCheck, || {
                post_json(http.clone(), endpoint.clone(), payload.clone())
            })
            .await)
    }

    /// Start the local MCP server process registered for `server_id`. The
    /// server's `service_endpoint` is its command line.
    pub async fn start_local_server(&self, server_id: &str) -> GatewayResult<()> {
        let config = self.servers.get(server_id).ok_or_else(|| {
            GatewayError::ServerUnavailable(
                format!("no configuration for server {server_id}").into(),
            )
        })?;
        self.supervisor
            .start(server_id, &config.service_endpoint, None)
            .await?;
        Ok(())
    }

    /// Synchronous tool discovery against a supervised local process.
    pub async fn list_local_tools(&self, server_id: &str) -> GatewayResult<Value> {
        self.supervisor
            .request(
                server_id,
                &json!({"jsonrpc": "2.0", "method": "tools/list", "id": 1}),
            )
            .await
    }

    /// Synchronous tool invocation against a supervised local process.
    pub async fn call_local_tool(
        &self,
        server_id: &str,
        tool: &str,
        arguments: Value,
    ) -> GatewayResult<Value> {
        self.supervisor
            .request(
                server_id,
                &json!({
                    "jsonrpc": "2.0",
                    "method": "tools/call",
                    "params": {"name": tool, "arguments": arguments},
                    "id": 1,
                }),
            )
            .await
    }

    pub async fn stop_local_server(&self, server_id: &str) -> GatewayResult<()> {
        self.supervisor.stop(server_id).await
    }

    /// Drain every live connection and stop every supervised process.
    pub async fn shutdown(&self) {
        tracing::info!("gateway shutting down");
        self.registry.drain().await;
        self.supervisor.stop_all().await;
    }

    fn direct_endpoint(&self, server_id: &str) -> GatewayResult<ResolvedEndpoint> {
        let config = self.servers.get(server_id).ok_or_else(|| {
            GatewayError::ServerUnavailable(
                format!("no configuration for server {server_id}").into(),
            )
        })?;
        endpoint::resolve_direct(&config)
    }
}

async fn post_json(
    http: reqwest::Client,
    endpoint: ResolvedEndpoint,
    payload: Value,
) -> GatewayResult<Value> {
    let mut request = http.post(&endpoint.url);
    for (name, value) in &endpoint.headers {
        request = request.header(name.as_str(), value.as_str());
    }
    let response = request.json(&payload).send().await?.error_for_status()?;
    Ok(response.json::<Value>().await?)
}
