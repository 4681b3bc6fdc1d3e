use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod message;

pub type SessionId = Arc<str>;

pub fn session_id() -> SessionId {
    uuid::Uuid::new_v4().to_string().into()
}

fn session_token() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Client-selected transport for a session's upstream connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportType {
    #[serde(rename = "SSE")]
    Sse,
    #[serde(rename = "WEBSOCKET")]
    WebSocket,
    #[serde(rename = "STREAMABLE_HTTP")]
    StreamableHttp,
    #[serde(rename = "STDIO")]
    Stdio,
}

impl std::fmt::Display for TransportType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TransportType::Sse => "SSE",
            TransportType::WebSocket => "WEBSOCKET",
            TransportType::StreamableHttp => "STREAMABLE_HTTP",
            TransportType::Stdio => "STDIO",
        };
        f.write_str(name)
    }
}

/// Session status, advancing forward only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Created,
    Connected,
    Active,
    Expired,
    Closed,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionStatus::Expired | SessionStatus::Closed)
    }

    fn rank(self) -> u8 {
        match self {
            SessionStatus::Created => 0,
            SessionStatus::Connected => 1,
            SessionStatus::Active => 2,
            SessionStatus::Expired | SessionStatus::Closed => 3,
        }
    }
}

/// Where the upstream server expects the session id on each request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionIdLocation {
    #[default]
    QueryParam,
    Header,
    PathParam,
}

/// Upstream authentication settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuthConfig {
    #[default]
    None,
    ApiKey {
        key: String,
    },
    BasicAuth {
        username: String,
        password: String,
    },
    /// Accepted but not supported: no token is acquired or attached.
    #[serde(rename = "OAUTH2")]
    OAuth2 {
        client_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_secret: Option<String>,
    },
}

/// How to reach one upstream MCP server. Immutable for the duration of a
/// session; owned by the external server registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamServerConfig {
    /// Connection-establishment endpoint. For STDIO transports this is the
    /// command line to spawn.
    pub service_endpoint: String,
    /// Message-send endpoint. When absent it is derived from
    /// `service_endpoint` by replacing an `/sse` segment with `/message`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id_location: Option<SessionIdLocation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id_param: Option<String>,
    #[serde(default)]
    pub auth: AuthConfig,
}

/// A logical, time-bounded binding between a client, a transport choice and
/// an upstream server.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: SessionId,
    pub token: String,
    pub server_id: String,
    pub owner: String,
    pub transport_type: TransportType,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Session {
    pub fn new(
        server_id: impl Into<String>,
        owner: impl Into<String>,
        transport_type: TransportType,
        ttl: Duration,
    ) -> Self {
        let now = Utc::now();
        let ttl = chrono::TimeDelta::from_std(ttl).unwrap_or(chrono::TimeDelta::MAX);
        let expires_at = now
            .checked_add_signed(ttl)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Self {
            id: session_id(),
            token: session_token(),
            server_id: server_id.into(),
            owner: owner.into(),
            transport_type,
            status: SessionStatus::Created,
            created_at: now,
            last_active_at: now,
            expires_at,
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    /// Advance to `next` if that is a strictly forward transition.
    /// Returns whether the status changed; terminal states never regress.
    pub(crate) fn advance(&mut self, next: SessionStatus) -> bool {
        if next.rank() > self.status.rank() {
            self.status = next;
            true
        } else {
            false
        }
    }
}
