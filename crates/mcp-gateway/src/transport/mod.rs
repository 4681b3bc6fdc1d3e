//! Upstream transport adapters.
//!
//! Each adapter owns the protocol-specific plumbing to the upstream server
//! and exposes the same establish/send/close contract. Establishment is
//! async and spawns detached pump tasks; after a successful establish the
//! only observable effects of those tasks are writes to the client sink and
//! the terminal hook firing once the upstream channel ends.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::{
    GatewayResult,
    config::TransportConfig,
    model::{Session, SessionId, TransportType, UpstreamServerConfig},
};

pub mod sse;
pub mod stdio;
pub mod streamable_http;
pub mod websocket;

/// One event on the client-facing channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// First event after a successful establish.
    Connected { session_id: SessionId },
    /// A verbatim upstream SSE event.
    Event {
        event: Option<String>,
        data: Option<String>,
        id: Option<String>,
        retry: Option<u64>,
    },
    /// One forwarded upstream message (WebSocket frame, NDJSON line or
    /// process output line).
    Message(Value),
    /// The upstream channel completed normally.
    Complete,
    /// Terminal error, already sanitized.
    Error { message: String },
}

pub type ClientSink = tokio::sync::mpsc::Sender<ClientEvent>;

/// Invoked exactly once when a connection's upstream channel terminates,
/// after the terminal [`ClientEvent`] has been emitted. Used by the gateway
/// to close the owning session; closing is idempotent so concurrent
/// triggers are safe.
pub type TerminalHook = Arc<dyn Fn() + Send + Sync>;

pub struct EstablishContext {
    pub sink: ClientSink,
    pub on_terminal: TerminalHook,
}

impl EstablishContext {
    /// Context with a no-op terminal hook, for driving an adapter directly.
    pub fn detached(sink: ClientSink) -> Self {
        Self {
            sink,
            on_terminal: Arc::new(|| {}),
        }
    }
}

/// How a pump task ended.
pub(crate) enum PumpEnd {
    /// Explicit close: the closer owns the teardown, emit nothing.
    Cancelled,
    /// The client channel was dropped; close the session silently.
    ClientGone,
    /// The upstream channel terminated; emit the terminal event, then close.
    Upstream(ClientEvent),
}

pub(crate) async fn finish_pump(sink: &ClientSink, on_terminal: &TerminalHook, end: PumpEnd) {
    match end {
        PumpEnd::Cancelled => {}
        PumpEnd::ClientGone => (on_terminal)(),
        PumpEnd::Upstream(event) => {
            let _ = sink.send(event).await;
            (on_terminal)();
        }
    }
}

/// A live upstream connection, stored in the registry as a single
/// polymorphic handle selected once at establishment time.
#[async_trait]
pub trait UpstreamConnection: Send + Sync {
    /// Queue one message for upstream delivery. Messages on a single
    /// connection are forwarded in call order.
    async fn send(&self, message: Value) -> GatewayResult<()>;

    /// Tear the connection down. Idempotent.
    async fn close(&self);
}

pub type ConnectionHandle = Arc<dyn UpstreamConnection>;

#[async_trait]
pub trait TransportAdapter: Send + Sync {
    async fn establish(
        &self,
        session: &Session,
        config: &UpstreamServerConfig,
        ctx: EstablishContext,
    ) -> GatewayResult<ConnectionHandle>;
}

/// The four adapters, selected by transport type once per establishment.
pub struct TransportAdapters {
    sse: sse::SseAdapter,
    websocket: websocket::WebSocketAdapter,
    streamable_http: streamable_http::StreamableHttpAdapter,
    stdio: stdio::StdioAdapter,
}

impl TransportAdapters {
    pub fn new(http: reqwest::Client, config: TransportConfig) -> Self {
        Self {
            sse: sse::SseAdapter::new(http.clone(), config.clone()),
            websocket: websocket::WebSocketAdapter::new(config.clone()),
            streamable_http: streamable_http::StreamableHttpAdapter::new(http, config.clone()),
            stdio: stdio::StdioAdapter::new(config),
        }
    }

    pub fn for_transport(&self, transport_type: TransportType) -> &dyn TransportAdapter {
        match transport_type {
            TransportType::Sse => &self.sse,
            TransportType::WebSocket => &self.websocket,
            TransportType::StreamableHttp => &self.streamable_http,
            TransportType::Stdio => &self.stdio,
        }
    }
}
