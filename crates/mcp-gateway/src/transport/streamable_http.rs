//! Streamable HTTP upstream adapter.
//!
//! Establishment opens a GET accepting newline-delimited JSON (some servers
//! answer with SSE framing instead, which is handled transparently).
//! Upstream lines land on a bounded queue; a drain loop forwards each line
//! to the client channel. A synthetic terminal entry is queued on upstream
//! completion or error so the drain loop always exits and releases its
//! resources. Sending reuses the SSE adapter's fire-and-forget POST loop.

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use sse_stream::SseStream;
use tokio::{io::AsyncBufReadExt, sync::mpsc};
use tokio_util::sync::CancellationToken;

use super::{
    ClientEvent, ClientSink, ConnectionHandle, EstablishContext, PumpEnd, TerminalHook,
    TransportAdapter, UpstreamConnection, finish_pump,
    sse::{EVENT_STREAM_MIME, PostChannel, run_post_loop},
};
use crate::{
    GatewayError, GatewayResult,
    config::TransportConfig,
    endpoint,
    model::{Session, SessionId, UpstreamServerConfig},
};

const NDJSON_MIME: &str = "application/x-ndjson";

/// One entry on the bounded line queue. `Complete` and `Error` are the
/// synthetic terminal lines.
enum StreamLine {
    Data(String),
    Complete,
    Error,
}

pub struct StreamableHttpAdapter {
    http: reqwest::Client,
    config: TransportConfig,
}

impl StreamableHttpAdapter {
    pub fn new(http: reqwest::Client, config: TransportConfig) -> Self {
        Self { http, config }
    }
}

#[async_trait]
impl TransportAdapter for StreamableHttpAdapter {
    async fn establish(
        &self,
        session: &Session,
        config: &UpstreamServerConfig,
        ctx: EstablishContext,
    ) -> GatewayResult<ConnectionHandle> {
        let connect = endpoint::resolve_connect(config, &session.id)?;
        let message = endpoint::resolve_message(config, &session.id)?;
        tracing::debug!(
            session_id = %session.id,
            endpoint = %connect.masked(),
            "opening streamable http connection"
        );

        let mut request = self.http.get(&connect.url).header(
            reqwest::header::ACCEPT,
            format!("{NDJSON_MIME}, {EVENT_STREAM_MIME}"),
        );
        for (name, value) in &connect.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        let response = request
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|error| {
                GatewayError::UpstreamConnectionFailed(error.to_string().into())
            })?;
        let sse_framed = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.contains(EVENT_STREAM_MIME));

        let ct = CancellationToken::new();
        let (line_tx, line_rx) = mpsc::channel(self.config.line_queue_capacity);
        let (outbound_tx, outbound_rx) = mpsc::channel(self.config.channel_buffer_capacity);

        if sse_framed {
            tokio::spawn(run_sse_reader(response, line_tx, session.id.clone()));
        } else {
            tokio::spawn(run_line_reader(response, line_tx, session.id.clone()));
        }
        tokio::spawn(run_drain(
            line_rx,
            ctx.sink.clone(),
            ct.clone(),
            ctx.on_terminal,
            session.id.clone(),
        ));
        tokio::spawn(run_post_loop(
            PostChannel {
                http: self.http.clone(),
                endpoint: message,
                sink: ctx.sink,
                session_id: session.id.clone(),
            },
            outbound_rx,
            ct.clone(),
        ));

        Ok(std::sync::Arc::new(StreamableHttpConnection {
            outbound: outbound_tx,
            ct,
        }))
    }
}

struct StreamableHttpConnection {
    outbound: mpsc::Sender<Value>,
    ct: CancellationToken,
}

#[async_trait]
impl UpstreamConnection for StreamableHttpConnection {
    async fn send(&self, message: Value) -> GatewayResult<()> {
        self.outbound.send(message).await.map_err(|_| {
            GatewayError::UpstreamConnectionFailed("upstream connection closed".into())
        })
    }

    async fn close(&self) {
        self.ct.cancel();
    }
}

/// Feed response body lines onto the queue until EOF or error, then enqueue
/// the synthetic terminal line.
async fn run_line_reader(
    response: reqwest::Response,
    queue: mpsc::Sender<StreamLine>,
    session_id: SessionId,
) {
    let stream = response
        .bytes_stream()
        .map(|result| result.map_err(std::io::Error::other))
        .boxed();
    let mut lines = tokio_util::io::StreamReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if queue.send(StreamLine::Data(line)).await.is_err() {
                    break;
                }
            }
            Ok(None) => {
                tracing::debug!(session_id = %session_id, "upstream stream completed");
                let _ = queue.send(StreamLine::Complete).await;
                break;
            }
            Err(error) => {
                tracing::warn!(session_id = %session_id, error = %error, "upstream stream error");
                let _ = queue.send(StreamLine::Error).await;
                break;
            }
        }
    }
}

/// Same contract as [`run_line_reader`] for servers that answer the GET with
/// SSE framing: each event's data field is one line.
async fn run_sse_reader(
    response: reqwest::Response,
    queue: mpsc::Sender<StreamLine>,
    session_id: SessionId,
) {
    let mut stream = SseStream::from_byte_stream(response.bytes_stream()).boxed();
    loop {
        match stream.next().await {
            Some(Ok(sse)) => {
                if let Some(data) = sse.data
                    && queue.send(StreamLine::Data(data)).await.is_err()
                {
                    break;
                }
            }
            Some(Err(error)) => {
                tracing::warn!(session_id = %session_id, error = %error, "upstream stream error");
                let _ = queue.send(StreamLine::Error).await;
                break;
            }
            None => {
                tracing::debug!(session_id = %session_id, "upstream stream completed");
                let _ = queue.send(StreamLine::Complete).await;
                break;
            }
        }
    }
}

/// Continuously drain the bounded queue and forward each line to the client
/// channel until a terminal entry (or cancellation) arrives.
async fn run_drain(
    mut queue: mpsc::Receiver<StreamLine>,
    sink: ClientSink,
    ct: CancellationToken,
    on_terminal: TerminalHook,
    session_id: SessionId,
) {
    let end = loop {
        let item = tokio::select! {
            _ = ct.cancelled() => break PumpEnd::Cancelled,
            item = queue.recv() => match item {
                Some(item) => item,
                // Reader task gone without a terminal line: treat as complete.
                None => break PumpEnd::Upstream(ClientEvent::Complete),
            },
        };
        match item {
            StreamLine::Data(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<Value>(line) {
                    Ok(message) => {
                        if sink.send(ClientEvent::Message(message)).await.is_err() {
                            break PumpEnd::ClientGone;
                        }
                    }
                    Err(error) => {
                        tracing::warn!(
                            session_id = %session_id,
                            error = %error,
                            "failed to deserialize upstream line"
                        );
                    }
                }
            }
            StreamLine::Complete => break PumpEnd::Upstream(ClientEvent::Complete),
            StreamLine::Error => {
                break PumpEnd::Upstream(ClientEvent::Error {
                    message: "upstream stream error".to_string(),
                });
            }
        }
    };
    finish_pump(&sink, &on_terminal, end).await;
}
