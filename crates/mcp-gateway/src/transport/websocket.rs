//! WebSocket upstream adapter.
//!
//! The resolved URL's scheme is rewritten http→ws / https→wss, then a duplex
//! connection is opened. Upstream text frames are forwarded to the client
//! channel; client messages go through a buffered outbound queue feeding the
//! upstream socket. Termination of either side tears down both.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{self, client::IntoClientRequest},
};
use tokio_util::sync::CancellationToken;

use super::{
    ClientEvent, ClientSink, ConnectionHandle, EstablishContext, PumpEnd, TerminalHook,
    TransportAdapter, UpstreamConnection, finish_pump,
};
use crate::{
    GatewayError, GatewayResult,
    config::TransportConfig,
    endpoint,
    model::{Session, SessionId, UpstreamServerConfig},
};

pub struct WebSocketAdapter {
    config: TransportConfig,
}

impl WebSocketAdapter {
    pub fn new(config: TransportConfig) -> Self {
        Self { config }
    }
}

fn rewrite_scheme(url: &str) -> String {
    if let Some(rest) = url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        url.to_string()
    }
}

fn connection_failed(error: impl std::fmt::Display) -> GatewayError {
    GatewayError::UpstreamConnectionFailed(error.to_string().into())
}

#[async_trait]
impl TransportAdapter for WebSocketAdapter {
    async fn establish(
        &self,
        session: &Session,
        config: &UpstreamServerConfig,
        ctx: EstablishContext,
    ) -> GatewayResult<ConnectionHandle> {
        let connect = endpoint::resolve_connect(config, &session.id)?;
        let url = rewrite_scheme(&connect.url);
        tracing::debug!(session_id = %session.id, url = %url, "opening websocket connection");

        let mut request = url.as_str().into_client_request().map_err(connection_failed)?;
        for (name, value) in &connect.headers {
            let name = tungstenite::http::HeaderName::from_bytes(name.as_bytes())
                .map_err(connection_failed)?;
            let value =
                tungstenite::http::HeaderValue::from_str(value).map_err(connection_failed)?;
            request.headers_mut().insert(name, value);
        }
        let (stream, _) = connect_async(request).await.map_err(connection_failed)?;
        let (upstream_sink, upstream_read) = stream.split();

        let ct = CancellationToken::new();
        let (outbound_tx, outbound_rx) = mpsc::channel(self.config.channel_buffer_capacity);

        tokio::spawn(run_outbound_pump(
            upstream_sink,
            outbound_rx,
            ctx.sink.clone(),
            ct.clone(),
            ctx.on_terminal.clone(),
            session.id.clone(),
        ));
        tokio::spawn(run_inbound_pump(
            upstream_read,
            ctx.sink,
            ct.clone(),
            ctx.on_terminal,
            session.id.clone(),
        ));

        Ok(std::sync::Arc::new(WebSocketConnection {
            outbound: outbound_tx,
            ct,
        }))
    }
}

struct WebSocketConnection {
    outbound: mpsc::Sender<Value>,
    ct: CancellationToken,
}

#[async_trait]
impl UpstreamConnection for WebSocketConnection {
    async fn send(&self, message: Value) -> GatewayResult<()> {
        self.outbound.send(message).await.map_err(|_| {
            GatewayError::UpstreamConnectionFailed("upstream connection closed".into())
        })
    }

    async fn close(&self) {
        self.ct.cancel();
    }
}

type UpstreamSink = futures::stream::SplitSink<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
    tungstenite::Message,
>;
type UpstreamRead = futures::stream::SplitStream<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
>;

async fn run_outbound_pump(
    mut upstream: UpstreamSink,
    mut outbound: mpsc::Receiver<Value>,
    sink: ClientSink,
    ct: CancellationToken,
    on_terminal: TerminalHook,
    session_id: SessionId,
) {
    loop {
        let message = tokio::select! {
            _ = ct.cancelled() => {
                let _ = upstream.send(tungstenite::Message::Close(None)).await;
                break;
            }
            message = outbound.recv() => match message {
                Some(message) => message,
                None => {
                    let _ = upstream.send(tungstenite::Message::Close(None)).await;
                    break;
                }
            },
        };
        let frame = tungstenite::Message::Text(message.to_string().into());
        if let Err(error) = upstream.send(frame).await {
            tracing::warn!(session_id = %session_id, error = %error, "websocket send failed");
            let end = PumpEnd::Upstream(ClientEvent::Error {
                message: "failed to forward message upstream".to_string(),
            });
            finish_pump(&sink, &on_terminal, end).await;
            ct.cancel();
            break;
        }
    }
}

async fn run_inbound_pump(
    mut upstream: UpstreamRead,
    sink: ClientSink,
    ct: CancellationToken,
    on_terminal: TerminalHook,
    session_id: SessionId,
) {
    let end = loop {
        let frame = tokio::select! {
            _ = ct.cancelled() => break PumpEnd::Cancelled,
            frame = upstream.next() => frame,
        };
        match frame {
            Some(Ok(tungstenite::Message::Text(text))) => {
                let message = serde_json::from_str::<Value>(text.as_str())
                    .unwrap_or_else(|_| Value::String(text.as_str().to_string()));
                if sink.send(ClientEvent::Message(message)).await.is_err() {
                    break PumpEnd::ClientGone;
                }
            }
            Some(Ok(tungstenite::Message::Close(_))) | None => {
                tracing::debug!(session_id = %session_id, "upstream websocket closed");
                break PumpEnd::Upstream(ClientEvent::Complete);
            }
            Some(Ok(_)) => continue,
            Some(Err(error)) => {
                tracing::warn!(session_id = %session_id, error = %error, "websocket stream error");
                break PumpEnd::Upstream(ClientEvent::Error {
                    message: "upstream stream error".to_string(),
                });
            }
        }
    };
    // Either side terminating tears down both.
    ct.cancel();
    finish_pump(&sink, &on_terminal, end).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rewrites_http_schemes() {
        assert_eq!(rewrite_scheme("http://h/ws"), "ws://h/ws");
        assert_eq!(rewrite_scheme("https://h/ws"), "wss://h/ws");
        assert_eq!(rewrite_scheme("ws://h/ws"), "ws://h/ws");
    }
}
