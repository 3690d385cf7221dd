//! Stream transport: SSE decoding, connection seam, and retry state.
//!
//! Converts a raw byte stream into [`InboundEvent`] values. Handles
//! `data:` framing, partial lines, `[DONE]`, and buffering. A malformed
//! payload is logged and dropped without surfacing an error; only the
//! transport itself can fail the stream.

use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::Stream;
use tracing::{debug, warn};

use crate::config::StartOptions;
use crate::error::{DiscoveryError, Result};
use crate::events::{decode_payload, InboundEvent};

/// Raw bytes from an open stream connection.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// Connection seam for the discovery stream.
///
/// Production uses [`HttpConnector`]; tests inject scripted streams.
#[async_trait]
pub trait EventStreamConnector: Send + Sync {
    /// Open one streaming connection for a session.
    async fn connect(&self, query: &str, options: &StartOptions) -> Result<ByteStream>;
}

/// Lifecycle of one connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    Idle,
    Connecting,
    Open,
    /// Server ended the stream after a terminal event.
    ClosedClean,
    /// Connection failed or dropped without a terminal event.
    ClosedError,
}

/// Reconnection bookkeeping for one session.
///
/// Retries happen only after a definitive close; delay grows linearly
/// with the attempt count.
#[derive(Debug)]
pub struct RetryState {
    attempt: u32,
    max_attempts: u32,
    base_delay: Duration,
}

impl RetryState {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            attempt: 0,
            max_attempts,
            base_delay,
        }
    }

    /// Book the next attempt. Returns the delay to wait before it, or
    /// `None` once the budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.max_attempts {
            return None;
        }
        self.attempt += 1;
        Some(self.base_delay * self.attempt)
    }

    /// Attempts booked so far.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

/// HTTP connector against the platform's SSE endpoint.
///
/// EventSource-style endpoints cannot take custom headers, so the query,
/// profile, and auth token all ride as query params.
pub struct HttpConnector {
    client: reqwest::Client,
    endpoint: String,
    auth_token: Option<String>,
}

impl HttpConnector {
    pub fn new(endpoint: impl Into<String>, auth_token: Option<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .connect_timeout(Duration::from_secs(10))
                .build()
                .expect("Failed to create HTTP client"),
            endpoint: endpoint.into(),
            auth_token,
        }
    }

    /// Use a custom HTTP client.
    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    fn build_url(&self, query: &str, options: &StartOptions) -> Result<url::Url> {
        let mut url = url::Url::parse(&self.endpoint)
            .map_err(|e| DiscoveryError::InvalidEndpoint(e.to_string()))?;
        {
            let mut params = url.query_pairs_mut();
            params.append_pair("q", query);
            if let Some(profile_id) = options.profile_id {
                params.append_pair("profile_id", &profile_id.to_string());
            }
            if options.personalized {
                params.append_pair("personalized", "true");
            }
            for (key, value) in &options.extra_params {
                params.append_pair(key, value);
            }
            if let Some(token) = &self.auth_token {
                params.append_pair("token", token);
            }
        }
        Ok(url)
    }
}

#[async_trait]
impl EventStreamConnector for HttpConnector {
    async fn connect(&self, query: &str, options: &StartOptions) -> Result<ByteStream> {
        use futures::StreamExt;

        let url = self.build_url(query, options)?;
        debug!(endpoint = %self.endpoint, "opening discovery stream");

        let response = self
            .client
            .get(url)
            .header("Accept", "text/event-stream")
            .send()
            .await
            .map_err(|e| DiscoveryError::Connect(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            warn!(status = %status, "discovery stream endpoint refused connection");
            return Err(DiscoveryError::Http {
                status: status.as_u16(),
            });
        }

        Ok(Box::pin(response.bytes_stream().map(|chunk| {
            chunk.map_err(|e| DiscoveryError::Network(e.to_string()))
        })))
    }
}

/// Stream adapter that converts raw SSE bytes into [`InboundEvent`]s.
///
/// Buffers raw bytes and decodes per line: line framing is ASCII, so a
/// multi-byte UTF-8 sequence split across chunk boundaries reassembles
/// before decoding ever sees it.
pub struct DiscoveryEventStream {
    inner: ByteStream,
    buffer: Vec<u8>,
    done: bool,
}

impl DiscoveryEventStream {
    pub fn new(byte_stream: ByteStream) -> Self {
        Self {
            inner: byte_stream,
            buffer: Vec::new(),
            done: false,
        }
    }
}

impl Stream for DiscoveryEventStream {
    type Item = Result<InboundEvent>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        loop {
            if this.done {
                return Poll::Ready(None);
            }

            // Try to parse complete lines already in the buffer.
            match drain_line(&mut this.buffer) {
                LineOutcome::Event(event) => return Poll::Ready(Some(Ok(event))),
                LineOutcome::Done => {
                    this.done = true;
                    return Poll::Ready(None);
                }
                LineOutcome::NeedMore => {}
            }

            // Need more data from the byte stream.
            match Pin::new(&mut this.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(bytes))) => this.buffer.extend_from_slice(&bytes),
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Some(Err(e))),
                Poll::Ready(None) => {
                    // Stream ended; flush whatever is still buffered.
                    if !this.buffer.is_empty() && this.buffer.last() != Some(&b'\n') {
                        this.buffer.push(b'\n');
                        continue;
                    }
                    return Poll::Ready(None);
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

enum LineOutcome {
    Event(InboundEvent),
    Done,
    NeedMore,
}

/// Extract the next decodable event line from the buffer.
///
/// Skips SSE comments, `event:`/`id:`/`retry:` lines, blank separators,
/// unknown event types, and malformed payloads (logged at warn).
fn drain_line(buffer: &mut Vec<u8>) -> LineOutcome {
    loop {
        let Some(newline_pos) = buffer.iter().position(|b| *b == b'\n') else {
            return LineOutcome::NeedMore;
        };
        let raw: Vec<u8> = buffer.drain(..=newline_pos).collect();
        let line = match std::str::from_utf8(&raw[..raw.len() - 1]) {
            Ok(text) => text.trim(),
            Err(e) => {
                warn!(error = %e, "dropping non-UTF-8 stream line");
                continue;
            }
        };

        if line.is_empty() {
            continue;
        }

        let Some(data) = line.strip_prefix("data:") else {
            // "event:", "id:", "retry:", comments — framing we don't need.
            continue;
        };
        let data = data.trim();

        if data == "[DONE]" {
            return LineOutcome::Done;
        }

        match decode_payload(data) {
            Ok(Some(event)) => return LineOutcome::Event(event),
            Ok(None) => {
                debug!(payload = %&data[..data.len().min(120)], "ignoring unknown event type");
            }
            Err(e) => {
                warn!(
                    error = %e,
                    payload = %&data[..data.len().min(120)],
                    "dropping malformed stream payload"
                );
            }
        }
    }
}
