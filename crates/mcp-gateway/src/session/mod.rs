//! Session lifecycle management.

use std::{collections::HashMap, sync::Arc};

use chrono::Utc;
use tokio::sync::RwLock;

use crate::{
    GatewayError, GatewayResult,
    config::SessionConfig,
    model::{Session, SessionId, SessionStatus, TransportType, UpstreamServerConfig},
    usage::{UsageRecord, UsageRecorder, record_usage},
};

pub mod registry;

pub use registry::ConnectionRegistry;

/// Owns every session's lifecycle and the registry of live upstream
/// connections. Expiry is enforced lazily on access; sessions are never
/// deleted here, retention is an external concern.
pub struct SessionManager {
    sessions: RwLock<HashMap<SessionId, Session>>,
    registry: Arc<ConnectionRegistry>,
    usage: Arc<dyn UsageRecorder>,
    config: SessionConfig,
}

impl SessionManager {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        usage: Arc<dyn UsageRecorder>,
        config: SessionConfig,
    ) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            registry,
            usage,
            config,
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Create a session bound to `server_id`. Fails when the server has no
    /// configuration.
    pub async fn create_session(
        &self,
        server_id: &str,
        server_config: Option<&UpstreamServerConfig>,
        transport_type: TransportType,
        owner: &str,
    ) -> GatewayResult<Session> {
        if server_config.is_none() {
            return Err(GatewayError::ServerUnavailable(
                format!("no configuration for server {server_id}").into(),
            ));
        }
        let session = Session::new(server_id, owner, transport_type, self.config.ttl);
        tracing::info!(
            session_id = %session.id,
            server_id,
            transport = %transport_type,
            "session created"
        );
        self.sessions
            .write()
            .await
            .insert(session.id.clone(), session.clone());
        Ok(session)
    }

    pub async fn get(&self, session_id: &SessionId) -> GatewayResult<Session> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| GatewayError::SessionNotFound(session_id.clone()))
    }

    /// Validate and refresh a session on access. An expired session is moved
    /// to EXPIRED, its connection (if any) is torn down, and the access
    /// fails with `SessionExpired`.
    pub async fn touch(&self, session_id: &SessionId) -> GatewayResult<Session> {
        let now = Utc::now();
        let expired = {
            let mut sessions = self.sessions.write().await;
            let session = sessions
                .get_mut(session_id)
                .ok_or_else(|| GatewayError::SessionNotFound(session_id.clone()))?;
            if session.status == SessionStatus::Closed {
                return Err(GatewayError::SessionNotFound(session_id.clone()));
            }
            if session.status == SessionStatus::Expired || session.is_expired_at(now) {
                session.advance(SessionStatus::Expired);
                true
            } else {
                session.last_active_at = now;
                return Ok(session.clone());
            }
        };
        if expired {
            // An expired session must hold no live connection.
            self.registry.close(session_id).await;
        }
        Err(GatewayError::SessionExpired(session_id.clone()))
    }

    /// Advance to CONNECTED after the adapter established its channel.
    pub async fn mark_connected(&self, session_id: &SessionId) -> GatewayResult<()> {
        self.advance(session_id, SessionStatus::Connected).await
    }

    /// Advance to ACTIVE after the first successfully forwarded message.
    pub async fn mark_active(&self, session_id: &SessionId) -> GatewayResult<()> {
        self.advance(session_id, SessionStatus::Active).await
    }

    async fn advance(&self, session_id: &SessionId, status: SessionStatus) -> GatewayResult<()> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| GatewayError::SessionNotFound(session_id.clone()))?;
        session.advance(status);
        Ok(())
    }

    /// Close a session: tear down its registered connection (first caller
    /// wins) and move the status to CLOSED. Safe to call repeatedly and
    /// concurrently from disconnect, error and completion paths.
    pub async fn close(&self, session_id: &SessionId) -> GatewayResult<()> {
        let torn_down = self.registry.close(session_id).await;
        let mut sessions = self.sessions.write().await;
        match sessions.get_mut(session_id) {
            Some(session) => {
                if session.advance(SessionStatus::Closed) {
                    tracing::info!(session_id = %session_id, "session closed");
                }
                Ok(())
            }
            None if torn_down => Ok(()),
            None => Err(GatewayError::SessionNotFound(session_id.clone())),
        }
    }

    /// Fire-and-forget usage recording; recorder failures never propagate.
    pub fn record(&self, session_id: &SessionId, endpoint: &str, method: &str, status: u16) {
        record_usage(
            self.usage.as_ref(),
            UsageRecord {
                session_id: session_id.clone(),
                endpoint: endpoint.to_string(),
                http_method: method.to_string(),
                status_code: status,
            },
        );
    }
}
