//! The session-id → live-connection registry.
//!
//! The only cross-session mutable state in the gateway. Created at startup,
//! drained at shutdown, injectable so tests get a fresh registry each.

use std::collections::HashMap;

use tokio::sync::RwLock;

use crate::{
    GatewayError, GatewayResult,
    model::SessionId,
    transport::ConnectionHandle,
};

#[derive(Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<SessionId, ConnectionHandle>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handle for a session. At most one handle may be live per
    /// session id: a replaced handle is closed before the new one becomes
    /// visible.
    pub async fn register(&self, session_id: SessionId, handle: ConnectionHandle) {
        let previous = {
            let mut connections = self.connections.write().await;
            connections.insert(session_id.clone(), handle)
        };
        if let Some(previous) = previous {
            tracing::warn!(session_id = %session_id, "replacing live upstream connection");
            previous.close().await;
        }
    }

    /// Remove and close the handle for a session. First caller wins: exactly
    /// one caller performs the teardown, later callers observe `false`.
    pub async fn close(&self, session_id: &SessionId) -> bool {
        let handle = {
            let mut connections = self.connections.write().await;
            connections.remove(session_id)
        };
        match handle {
            Some(handle) => {
                handle.close().await;
                true
            }
            None => false,
        }
    }

    /// Forward one message on the session's connection.
    pub async fn send(&self, session_id: &SessionId, message: serde_json::Value) -> GatewayResult<()> {
        let handle = {
            let connections = self.connections.read().await;
            connections.get(session_id).cloned()
        };
        match handle {
            Some(handle) => handle.send(message).await,
            None => Err(GatewayError::UpstreamConnectionFailed(
                "no active upstream connection for session".into(),
            )),
        }
    }

    pub async fn contains(&self, session_id: &SessionId) -> bool {
        self.connections.read().await.contains_key(session_id)
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.read().await.is_empty()
    }

    /// Close every registered connection (gateway shutdown).
    pub async fn drain(&self) {
        let drained: Vec<_> = {
            let mut connections = self.connections.write().await;
            connections.drain().collect()
        };
        for (session_id, handle) in drained {
            tracing::debug!(session_id = %session_id, "closing connection on shutdown");
            handle.close().await;
        }
    }
}
