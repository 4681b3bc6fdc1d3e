//! SSE upstream adapter.
//!
//! Establishment opens a GET to the resolved service endpoint and subscribes
//! to the event stream; every upstream event is forwarded verbatim to the
//! client channel. Sending is a fire-and-forget POST to the message
//! endpoint — the response to a sent message arrives asynchronously as a
//! later stream event, never as the POST body.

use std::time::Duration;

use async_trait::async_trait;
use futures::{StreamExt, stream::BoxStream};
use serde_json::Value;
use sse_stream::{Error as SseError, Sse, SseStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{
    ClientEvent, ClientSink, ConnectionHandle, EstablishContext, PumpEnd, TerminalHook,
    TransportAdapter, UpstreamConnection, finish_pump,
};
use crate::{
    GatewayError, GatewayResult,
    config::{StreamRetryConfig, TransportConfig},
    endpoint::{self, ResolvedEndpoint},
    model::{Session, SessionId, UpstreamServerConfig},
};

pub(crate) const EVENT_STREAM_MIME: &str = "text/event-stream";

type BoxedSseStream = BoxStream<'static, Result<Sse, SseError>>;

pub struct SseAdapter {
    http: reqwest::Client,
    config: TransportConfig,
}

impl SseAdapter {
    pub fn new(http: reqwest::Client, config: TransportConfig) -> Self {
        Self { http, config }
    }

    pub(crate) async fn open_stream(
        http: &reqwest::Client,
        endpoint: &ResolvedEndpoint,
        last_event_id: Option<&str>,
    ) -> GatewayResult<BoxedSseStream> {
        let mut request = http
            .get(&endpoint.url)
            .header(reqwest::header::ACCEPT, EVENT_STREAM_MIME);
        for (name, value) in &endpoint.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(id) = last_event_id {
            request = request.header("Last-Event-ID", id);
        }
        let response = request
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|error| {
                GatewayError::UpstreamConnectionFailed(error.to_string().into())
            })?;
        Ok(SseStream::from_byte_stream(response.bytes_stream()).boxed())
    }
}

#[async_trait]
impl TransportAdapter for SseAdapter {
    async fn establish(
        &self,
        session: &Session,
        config: &UpstreamServerConfig,
        ctx: EstablishContext,
    ) -> GatewayResult<ConnectionHandle> {
        let connect = endpoint::resolve_connect(config, &session.id)?;
        let message = endpoint::resolve_message(config, &session.id)?;
        tracing::debug!(session_id = %session.id, endpoint = %connect.masked(), "opening sse stream");

        let stream = Self::open_stream(&self.http, &connect, None).await?;
        let ct = CancellationToken::new();
        let (outbound_tx, outbound_rx) = mpsc::channel(self.config.channel_buffer_capacity);

        let pump = EventPump {
            http: self.http.clone(),
            endpoint: connect,
            retry: self.config.retry,
            sink: ctx.sink.clone(),
            session_id: session.id.clone(),
        };
        tokio::spawn(pump.run(stream, ct.clone(), ctx.on_terminal));
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

        Ok(std::sync::Arc::new(SseConnection {
            outbound: outbound_tx,
            ct,
        }))
    }
}

struct SseConnection {
    outbound: mpsc::Sender<Value>,
    ct: CancellationToken,
}

#[async_trait]
impl UpstreamConnection for SseConnection {
    async fn send(&self, message: Value) -> GatewayResult<()> {
        self.outbound.send(message).await.map_err(|_| {
            GatewayError::UpstreamConnectionFailed("upstream connection closed".into())
        })
    }

    async fn close(&self) {
        self.ct.cancel();
    }
}

struct EventPump {
    http: reqwest::Client,
    endpoint: ResolvedEndpoint,
    retry: StreamRetryConfig,
    sink: ClientSink,
    session_id: SessionId,
}

impl EventPump {
    async fn run(self, mut stream: BoxedSseStream, ct: CancellationToken, on_terminal: TerminalHook) {
        let mut retry_interval = self.retry.min_duration;
        let mut last_event_id: Option<String> = None;
        let end = loop {
            let event = tokio::select! {
                _ = ct.cancelled() => break PumpEnd::Cancelled,
                event = stream.next() => event,
            };
            match event {
                Some(Ok(sse)) => {
                    if let Some(server_retry) = sse.retry {
                        retry_interval = retry_interval.min(Duration::from_millis(server_retry));
                    }
                    if let Some(id) = sse.id.clone() {
                        last_event_id = Some(id);
                    }
                    let forwarded = ClientEvent::Event {
                        event: sse.event,
                        data: sse.data,
                        id: sse.id,
                        retry: sse.retry,
                    };
                    if self.sink.send(forwarded).await.is_err() {
                        tracing::trace!(session_id = %self.session_id, "client channel dropped");
                        break PumpEnd::ClientGone;
                    }
                }
                Some(Err(error)) => {
                    tracing::warn!(
                        session_id = %self.session_id,
                        error = %error,
                        "upstream sse stream error"
                    );
                    match self
                        .reconnect(retry_interval, last_event_id.as_deref(), &ct)
                        .await
                    {
                        Some(new_stream) => {
                            stream = new_stream;
                            continue;
                        }
                        None if ct.is_cancelled() => break PumpEnd::Cancelled,
                        None => {
                            break PumpEnd::Upstream(ClientEvent::Error {
                                message: "upstream stream error".to_string(),
                            });
                        }
                    }
                }
                None => {
                    tracing::debug!(session_id = %self.session_id, "upstream sse stream completed");
                    break PumpEnd::Upstream(ClientEvent::Complete);
                }
            }
        };
        finish_pump(&self.sink, &on_terminal, end).await;
    }

    async fn reconnect(
        &self,
        retry_interval: Duration,
        last_event_id: Option<&str>,
        ct: &CancellationToken,
    ) -> Option<BoxedSseStream> {
        let max_times = self.retry.max_times.unwrap_or(usize::MAX);
        let mut retry_times = 0;
        while retry_times < max_times {
            tokio::select! {
                _ = ct.cancelled() => return None,
                _ = tokio::time::sleep(retry_interval) => {}
            }
            retry_times += 1;
            match SseAdapter::open_stream(&self.http, &self.endpoint, last_event_id).await {
                Ok(stream) => return Some(stream),
                Err(error) => {
                    tracing::debug!(
                        session_id = %self.session_id,
                        error = %error,
                        retry_times,
                        "sse reconnect failed"
                    );
                }
            }
        }
        tracing::error!(session_id = %self.session_id, "sse reconnect attempts exhausted");
        None
    }
}

/// Everything the outbound POST loop needs. Shared with the streamable HTTP
/// adapter, whose send path is the same fire-and-forget POST.
pub(crate) struct PostChannel {
    pub http: reqwest::Client,
    pub endpoint: ResolvedEndpoint,
    pub sink: ClientSink,
    pub session_id: SessionId,
}

/// Drain the per-connection outbound queue one POST at a time, preserving
/// send order. A failed POST is logged and surfaced as an asynchronous
/// error event; it does not tear the connection down.
pub(crate) async fn run_post_loop(
    channel: PostChannel,
    mut outbound: mpsc::Receiver<Value>,
    ct: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            _ = ct.cancelled() => break,
            message = outbound.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };
        let mut request = channel.http.post(&channel.endpoint.url);
        for (name, value) in &channel.endpoint.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        let result = request
            .json(&message)
            .send()
            .await
            .and_then(|response| response.error_for_status());
        if let Err(error) = result {
            tracing::warn!(
                session_id = %channel.session_id,
                error = %error,
                "failed to forward message upstream"
            );
            let _ = channel
                .sink
                .send(ClientEvent::Error {
                    message: "failed to forward message upstream".to_string(),
                })
                .await;
        }
    }
}
