//! Request and response types exchanged with the engine.
//!
//! | Type | Role |
//! |------|------|
//! | [`Destination`] | `(host, port, secure)` key selecting an endpoint |
//! | [`HttpRequestData`] | Method, URL, headers and an [`OutgoingBody`] |
//! | [`OutgoingBody`] | One of: nothing, bytes, a reader, a producer, or a protocol upgrade |
//! | [`HttpResponse`] | Status, headers, version, a streaming [`ResponseBody`] and an [`ExchangeHandle`] |
//! | [`ProtocolVersion`] | `HTTP/major.minor` |

use crate::error::{EngineError, Result};
use crate::io::BoxedWriter;
use crate::protocol::constants::headers::UPGRADE;
use crate::protocol::constants::{DEFAULT_HTTPS_PORT, DEFAULT_HTTP_PORT};
use crate::protocol::{ConnectionOptions, Headers};
use bytes::{Bytes, BytesMut};
use futures::future::BoxFuture;
use futures::{FutureExt, Stream, StreamExt};
use http::Method;
use std::fmt;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::SystemTime;
use tokio::io::{AsyncRead, DuplexStream};
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;
use url::Url;

/// HTTP protocol version from a status or request line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProtocolVersion {
    /// Major version.
    pub major: u8,
    /// Minor version.
    pub minor: u8,
}

impl ProtocolVersion {
    /// `HTTP/1.0`
    pub const HTTP_1_0: ProtocolVersion = ProtocolVersion { major: 1, minor: 0 };
    /// `HTTP/1.1`
    pub const HTTP_1_1: ProtocolVersion = ProtocolVersion { major: 1, minor: 1 };

    /// Parse `HTTP/<major>.<minor>`.
    ///
    /// ```
    /// use cio_http::ProtocolVersion;
    ///
    /// assert_eq!(ProtocolVersion::parse("HTTP/1.1").unwrap(), ProtocolVersion::HTTP_1_1);
    /// assert!(ProtocolVersion::parse("HTTP/x").is_err());
    /// ```
    pub fn parse(text: &str) -> Result<Self> {
        let invalid = || EngineError::protocol(format!("invalid protocol version {text:?}"));
        let numbers = text.strip_prefix("HTTP/").ok_or_else(invalid)?;
        let (major, minor) = numbers.split_once('.').ok_or_else(invalid)?;
        let digit = |part: &str| {
            if !part.is_empty() && part.bytes().all(|b| b.is_ascii_digit()) {
                part.parse::<u8>().map_err(|_| invalid())
            } else {
                Err(invalid())
            }
        };
        Ok(ProtocolVersion {
            major: digit(major)?,
            minor: digit(minor)?,
        })
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HTTP/{}.{}", self.major, self.minor)
    }
}

/// Remote endpoint identity. Requests to equal destinations share connections.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination {
    /// Host name or IP literal (IPv6 literals keep their brackets).
    pub host: String,
    /// TCP port.
    pub port: u16,
    /// Whether the connection is upgraded through the secure transport.
    pub secure: bool,
}

impl Destination {
    /// Create a destination.
    pub fn new(host: impl Into<String>, port: u16, secure: bool) -> Self {
        Destination {
            host: host.into(),
            port,
            secure,
        }
    }

    /// Derive the destination of a URL. Only `http` and `https` are accepted.
    pub fn from_url(url: &Url) -> Result<Self> {
        let (secure, default_port) = match url.scheme() {
            "http" => (false, DEFAULT_HTTP_PORT),
            "https" => (true, DEFAULT_HTTPS_PORT),
            other => {
                return Err(EngineError::InvalidUrl(format!(
                    "unsupported scheme {other:?} in {url}"
                )))
            }
        };
        let host = url
            .host_str()
            .filter(|host| !host.is_empty())
            .ok_or_else(|| EngineError::InvalidUrl(format!("missing host in {url}")))?;
        Ok(Destination::new(
            host,
            url.port().unwrap_or(default_port),
            secure,
        ))
    }

    /// `host:port`
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Host name with IPv6 brackets removed, for dialing and certificate checks.
    pub fn bare_host(&self) -> &str {
        self.host
            .strip_prefix('[')
            .and_then(|host| host.strip_suffix(']'))
            .unwrap_or(&self.host)
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.secure { "https" } else { "http" };
        write!(f, "{scheme}://{}:{}", self.host, self.port)
    }
}

/// Writes a streamed request body into the pipe it is given.
pub type BodyProducer = Box<dyn FnOnce(DuplexStream) -> BoxFuture<'static, io::Result<()>> + Send>;

/// Takes over the write side of a connection after `101 Switching Protocols`.
pub type UpgradeHandler = Box<dyn FnOnce(BoxedWriter) -> BoxFuture<'static, io::Result<()>> + Send>;

/// Payload carried by an [`OutgoingBody`].
pub enum BodyKind {
    /// No payload bytes at all.
    Empty,
    /// In-memory bytes.
    Bytes(Bytes),
    /// Bytes copied from a reader until EOF.
    Reader {
        /// Source of the body.
        reader: Box<dyn AsyncRead + Send + Unpin>,
        /// Declared length, if known.
        length: Option<u64>,
    },
    /// Bytes written by a producer into a pipe.
    Producer {
        /// Producer run concurrently with the request writer.
        producer: BodyProducer,
        /// Declared length, if known.
        length: Option<u64>,
    },
    /// Protocol switch. Only valid on a dedicated connection.
    Upgrade(UpgradeHandler),
}

/// Request body plus the headers it implies.
pub struct OutgoingBody {
    /// The payload.
    pub kind: BodyKind,
    /// Content type of the payload.
    pub content_type: Option<String>,
    /// Additional headers the body contributes. Explicit request headers win.
    pub headers: Headers,
}

impl OutgoingBody {
    fn with_kind(kind: BodyKind) -> Self {
        OutgoingBody {
            kind,
            content_type: None,
            headers: Headers::new(),
        }
    }

    /// A body with no payload.
    pub fn empty() -> Self {
        Self::with_kind(BodyKind::Empty)
    }

    /// An in-memory payload.
    pub fn bytes(bytes: impl Into<Bytes>) -> Self {
        Self::with_kind(BodyKind::Bytes(bytes.into()))
    }

    /// A payload read from `reader`. Sent chunked when `length` is `None`.
    pub fn reader<R>(reader: R, length: Option<u64>) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        Self::with_kind(BodyKind::Reader {
            reader: Box::new(reader),
            length,
        })
    }

    /// A payload written by `producer`. Sent chunked when `length` is `None`.
    ///
    /// ```
    /// use cio_http::OutgoingBody;
    /// use tokio::io::AsyncWriteExt;
    ///
    /// let body = OutgoingBody::producer(None, |mut pipe| async move {
    ///     pipe.write_all(b"part one, ").await?;
    ///     pipe.write_all(b"part two").await
    /// });
    /// assert_eq!(body.content_length(), None);
    /// ```
    pub fn producer<F, Fut>(length: Option<u64>, producer: F) -> Self
    where
        F: FnOnce(DuplexStream) -> Fut + Send + 'static,
        Fut: Future<Output = io::Result<()>> + Send + 'static,
    {
        Self::with_kind(BodyKind::Producer {
            producer: Box::new(move |pipe| producer(pipe).boxed()),
            length,
        })
    }

    /// A protocol-upgrade body. `handler` receives the write half of the
    /// connection once the server answers `101 Switching Protocols`.
    pub fn upgrade<F, Fut>(handler: F) -> Self
    where
        F: FnOnce(BoxedWriter) -> Fut + Send + 'static,
        Fut: Future<Output = io::Result<()>> + Send + 'static,
    {
        Self::with_kind(BodyKind::Upgrade(Box::new(move |writer| {
            handler(writer).boxed()
        })))
    }

    /// Set the content type.
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    /// Add a body-implied header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.append(name, value);
        self
    }

    /// Length of the payload, when known up front.
    pub fn content_length(&self) -> Option<u64> {
        match &self.kind {
            BodyKind::Empty => Some(0),
            BodyKind::Bytes(bytes) => Some(bytes.len() as u64),
            BodyKind::Reader { length, .. } | BodyKind::Producer { length, .. } => *length,
            BodyKind::Upgrade(_) => None,
        }
    }

    /// Whether no payload bytes are ever written.
    pub fn is_no_content(&self) -> bool {
        matches!(self.kind, BodyKind::Empty | BodyKind::Upgrade(_))
    }

    /// Whether this is a protocol-upgrade body.
    pub fn is_upgrade(&self) -> bool {
        matches!(self.kind, BodyKind::Upgrade(_))
    }

    /// Remove the upgrade handler, leaving an empty payload behind.
    pub(crate) fn take_upgrade(&mut self) -> Option<UpgradeHandler> {
        match std::mem::replace(&mut self.kind, BodyKind::Empty) {
            BodyKind::Upgrade(handler) => Some(handler),
            other => {
                self.kind = other;
                None
            }
        }
    }
}

impl Default for OutgoingBody {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Debug for OutgoingBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.kind {
            BodyKind::Empty => "Empty",
            BodyKind::Bytes(_) => "Bytes",
            BodyKind::Reader { .. } => "Reader",
            BodyKind::Producer { .. } => "Producer",
            BodyKind::Upgrade(_) => "Upgrade",
        };
        f.debug_struct("OutgoingBody")
            .field("kind", &kind)
            .field("content_length", &self.content_length())
            .field("content_type", &self.content_type)
            .field("headers", &self.headers)
            .finish()
    }
}

/// A request as handed to the engine.
#[derive(Debug)]
pub struct HttpRequestData {
    /// Request method.
    pub method: Method,
    /// Absolute `http` or `https` URL.
    pub url: Url,
    /// Explicit request headers.
    pub headers: Headers,
    /// Request body.
    pub body: OutgoingBody,
}

impl HttpRequestData {
    /// A request with no headers and an empty body.
    pub fn new(method: Method, url: Url) -> Self {
        HttpRequestData {
            method,
            url,
            headers: Headers::new(),
            body: OutgoingBody::empty(),
        }
    }

    /// A `GET` request for `url`.
    pub fn get(url: &str) -> Result<Self> {
        let url = Url::parse(url).map_err(|err| EngineError::InvalidUrl(format!("{url}: {err}")))?;
        Ok(Self::new(Method::GET, url))
    }

    /// Add a header line.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.append(name, value);
        self
    }

    /// Replace the body.
    pub fn with_body(mut self, body: OutgoingBody) -> Self {
        self.body = body;
        self
    }

    /// Request target: path plus query.
    pub fn target(&self) -> String {
        match self.url.query() {
            Some(query) => format!("{}?{}", self.url.path(), query),
            None => self.url.path().to_string(),
        }
    }

    /// Value of the `Host` header: the host, plus the port when it is not the
    /// scheme's default.
    pub fn host_with_port(&self) -> String {
        let host = self.url.host_str().unwrap_or_default();
        match self.url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        }
    }

    /// Whether this request must not share a pipelined connection.
    ///
    /// Upgrades, requests that ask for the connection to close, and
    /// non-idempotent methods each get a connection of their own.
    pub fn requires_dedicated_connection(&self) -> bool {
        self.body.is_upgrade()
            || self.headers.contains(UPGRADE)
            || ConnectionOptions::from_headers(&self.headers).close
            || !self.method.is_idempotent()
    }
}

/// Streaming response body.
///
/// Implements [`Stream`] of byte chunks; [`bytes`](ResponseBody::bytes) and
/// [`text`](ResponseBody::text) collect it.
pub struct ResponseBody {
    inner: BodyInner,
}

enum BodyInner {
    Full(Option<Bytes>),
    Channel(ReceiverStream<Result<Bytes>>),
}

impl ResponseBody {
    /// A body with no bytes.
    pub fn empty() -> Self {
        ResponseBody {
            inner: BodyInner::Full(None),
        }
    }

    /// A body that is already fully in memory.
    pub fn full(bytes: impl Into<Bytes>) -> Self {
        let bytes = bytes.into();
        ResponseBody {
            inner: BodyInner::Full((!bytes.is_empty()).then_some(bytes)),
        }
    }

    pub(crate) fn channel(receiver: mpsc::Receiver<Result<Bytes>>) -> Self {
        ResponseBody {
            inner: BodyInner::Channel(ReceiverStream::new(receiver)),
        }
    }

    /// Collect the whole body.
    pub async fn bytes(mut self) -> Result<Bytes> {
        let mut collected = BytesMut::new();
        while let Some(chunk) = self.next().await {
            collected.extend_from_slice(&chunk?);
        }
        Ok(collected.freeze())
    }

    /// Collect the whole body as UTF-8 text.
    pub async fn text(self) -> Result<String> {
        let bytes = self.bytes().await?;
        Ok(String::from_utf8(bytes.to_vec())?)
    }
}

impl Stream for ResponseBody {
    type Item = Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match &mut self.inner {
            BodyInner::Full(bytes) => Poll::Ready(bytes.take().map(Ok)),
            BodyInner::Channel(receiver) => Pin::new(receiver).poll_next(cx),
        }
    }
}

impl fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            BodyInner::Full(bytes) => f
                .debug_tuple("Full")
                .field(&bytes.as_ref().map_or(0, Bytes::len))
                .finish(),
            BodyInner::Channel(_) => f.write_str("Streaming"),
        }
    }
}

/// Resolves once the response body has been read off the wire or abandoned,
/// so that the connection is free for the next exchange.
#[derive(Debug, Clone)]
pub struct ExchangeHandle {
    receiver: watch::Receiver<bool>,
}

impl ExchangeHandle {
    pub(crate) fn pair() -> (ExchangeGuard, ExchangeHandle) {
        let (sender, receiver) = watch::channel(false);
        (ExchangeGuard { sender }, ExchangeHandle { receiver })
    }

    /// A handle for an exchange that is already complete.
    pub fn completed() -> Self {
        let (_, receiver) = watch::channel(true);
        ExchangeHandle { receiver }
    }

    /// Wait until the exchange is finished.
    pub async fn finished(&self) {
        let mut receiver = self.receiver.clone();
        let _ = receiver.wait_for(|done| *done).await;
    }

    /// Whether the exchange is finished.
    pub fn is_finished(&self) -> bool {
        *self.receiver.borrow()
    }
}

/// Marks an exchange finished when dropped.
pub(crate) struct ExchangeGuard {
    sender: watch::Sender<bool>,
}

impl Drop for ExchangeGuard {
    fn drop(&mut self) {
        self.sender.send_replace(true);
    }
}

/// A response produced by the engine.
#[derive(Debug)]
pub struct HttpResponse {
    /// Status code.
    pub status: u16,
    /// Reason phrase, possibly empty.
    pub reason: String,
    /// Protocol version of the status line.
    pub version: ProtocolVersion,
    /// Response headers.
    pub headers: Headers,
    /// Response body.
    pub body: ResponseBody,
    /// When the request was handed to the connection.
    pub request_time: SystemTime,
    /// When the response head was parsed.
    pub response_time: SystemTime,
    /// Whether the exchange ran on a shared pipelined connection.
    pub pipelined: bool,
    /// Completion of the exchange.
    pub exchange: ExchangeHandle,
}

impl HttpResponse {
    /// A complete in-memory `HTTP/1.1` response.
    ///
    /// ```
    /// use cio_http::{HttpResponse, Headers};
    ///
    /// let response = HttpResponse::new(204, Headers::new(), "");
    /// assert_eq!(response.status, 204);
    /// assert!(response.exchange.is_finished());
    /// ```
    pub fn new(status: u16, headers: Headers, body: impl Into<Bytes>) -> Self {
        let now = SystemTime::now();
        HttpResponse {
            status,
            reason: String::new(),
            version: ProtocolVersion::HTTP_1_1,
            headers,
            body: ResponseBody::full(body),
            request_time: now,
            response_time: now,
            pipelined: false,
            exchange: ExchangeHandle::completed(),
        }
    }

    /// First value of a response header.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    /// Whether the status is in the 2xx range.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Collect the body.
    pub async fn bytes(self) -> Result<Bytes> {
        self.body.bytes().await
    }

    /// Collect the body as UTF-8 text.
    pub async fn text(self) -> Result<String> {
        self.body.text().await
    }
}
