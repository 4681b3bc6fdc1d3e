#![doc = include_str!("../README.md")]

mod error;
pub use error::{GatewayError, GatewayResult};

/// Per-component configuration and defaults.
pub mod config;
/// Pure resolution of upstream URLs and auth headers.
pub mod endpoint;
/// Session entity, upstream server configuration and wire message shapes.
pub mod model;
/// Supervised local MCP server processes.
pub mod process;
/// Circuit breaker, retry and timeout wrapper for direct upstream calls.
pub mod resilience;
/// Upstream server configuration lookup.
pub mod servers;
/// Session lifecycle and the live-connection registry.
pub mod session;
/// The four upstream transport adapters.
pub mod transport;
/// Fire-and-forget usage recording.
pub mod usage;

mod gateway;
pub use gateway::Gateway;

pub use config::GatewayConfig;
pub use model::{
    AuthConfig, Session, SessionId, SessionIdLocation, SessionStatus, TransportType,
    UpstreamServerConfig,
    message::{GatewayMessage, JsonRpcMessage, MessageShape, StandardMessage},
};
pub use servers::{ServerRegistry, StaticServerRegistry};
pub use session::SessionManager;
pub use transport::ClientEvent;
pub use usage::{LogUsageRecorder, UsageRecord, UsageRecorder};
