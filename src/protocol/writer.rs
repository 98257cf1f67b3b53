//! HTTP/1.1 request serializer.
//!
//! # Header rules
//!
//! - `Host` is added right after the request line unless the request carries one.
//! - A default `User-Agent` is added when the request has none.
//! - Explicit request headers come first, then headers implied by the body that
//!   the request does not already set.
//! - `Content-Length`, `Content-Type` and `Transfer-Encoding` are written once,
//!   by the framing decision below, never copied from either header list.
//!
//! # Framing
//!
//! | Body | Length known, no `chunked` requested | Otherwise |
//! |------|--------------------------------------|-----------|
//! | empty, upgrade | no payload; an explicit `Content-Length: 0` is kept | same |
//! | bytes, reader, producer | `Content-Length` + identity payload | `Transfer-Encoding: chunked` |
//!
//! A chunked body always ends with the zero-size chunk, also when the body
//! source fails, so the peer never waits on an unterminated stream.

use crate::error::{EngineError, Result};
use crate::io::BufferPool;
use crate::protocol::chunked::ChunkedWriter;
use crate::protocol::constants::headers::{
    CONTENT_LENGTH, CONTENT_TYPE, HOST, TRANSFER_ENCODING, USER_AGENT,
};
use crate::protocol::constants::CHUNKED;
use crate::protocol::headers::Headers;
use crate::types::{BodyKind, HttpRequestData, OutgoingBody};
use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Settings applied while serializing a request.
#[derive(Debug, Clone, Copy)]
pub struct WriteOptions<'a> {
    /// `User-Agent` added when the request has none.
    pub user_agent: Option<&'a str>,
    /// Buffers used to copy streamed bodies.
    pub pool: &'a BufferPool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Framing {
    None,
    Length(u64),
    Chunked,
}

/// Serialize `request` onto `out` and flush it.
///
/// Fails with [`EngineError::UnsupportedBodyType`] for a protocol-upgrade body
/// before writing anything.
pub async fn write_request<W>(request: HttpRequestData, out: &mut W, options: &WriteOptions<'_>) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    if request.body.is_upgrade() {
        return Err(EngineError::UnsupportedBodyType(
            "protocol upgrade body outside an upgrade exchange".into(),
        ));
    }

    let target = request.target();
    let host = request.host_with_port();
    let explicit_length = request
        .headers
        .get(CONTENT_LENGTH)
        .map(|value| {
            value
                .trim()
                .parse::<u64>()
                .map_err(|_| EngineError::protocol(format!("invalid content-length {value:?}")))
        })
        .transpose()?;
    let framing = choose_framing(&request.headers, &request.body, explicit_length);

    let HttpRequestData {
        method,
        headers,
        body,
        ..
    } = request;
    let OutgoingBody {
        kind,
        content_type,
        headers: body_headers,
    } = body;

    let mut head = BytesMut::with_capacity(256);
    head.put_slice(method.as_str().as_bytes());
    head.put_u8(b' ');
    head.put_slice(target.as_bytes());
    head.put_slice(b" HTTP/1.1\r\n");

    if !headers.contains(HOST) {
        put_header(&mut head, HOST, &host);
    }
    if let Some(user_agent) = options.user_agent {
        if !headers.contains(USER_AGENT) {
            put_header(&mut head, USER_AGENT, user_agent);
        }
    }

    let is_framing_header = |name: &str| {
        [CONTENT_LENGTH, CONTENT_TYPE, TRANSFER_ENCODING]
            .iter()
            .any(|framing| name.eq_ignore_ascii_case(framing))
    };
    for (name, value) in headers.iter().filter(|(name, _)| !is_framing_header(*name)) {
        put_header(&mut head, name, value);
    }
    for (name, value) in body_headers
        .iter()
        .filter(|(name, _)| !is_framing_header(*name) && !headers.contains(*name))
    {
        put_header(&mut head, name, value);
    }

    let content_type = headers
        .get(CONTENT_TYPE)
        .or(content_type.as_deref())
        .or_else(|| body_headers.get(CONTENT_TYPE));
    if let Some(content_type) = content_type {
        put_header(&mut head, CONTENT_TYPE, content_type);
    }
    match framing {
        Framing::None => match explicit_length {
            Some(0) => put_header(&mut head, CONTENT_LENGTH, "0"),
            Some(length) => debug!(length, "dropping content-length of a request without payload"),
            None => {}
        },
        Framing::Length(length) => put_header(&mut head, CONTENT_LENGTH, &length.to_string()),
        Framing::Chunked => {
            let coding = headers
                .get(TRANSFER_ENCODING)
                .filter(|value| value.to_ascii_lowercase().contains(CHUNKED))
                .unwrap_or(CHUNKED);
            put_header(&mut head, TRANSFER_ENCODING, coding);
        }
    }
    head.put_slice(b"\r\n");

    out.write_all(&head).await?;

    match kind {
        BodyKind::Empty | BodyKind::Upgrade(_) => {}
        BodyKind::Bytes(bytes) => write_bytes(bytes, out, framing).await?,
        BodyKind::Reader { reader, .. } => {
            out.flush().await?;
            send_stream(reader, out, framing, options.pool).await?;
        }
        BodyKind::Producer { producer, .. } => {
            out.flush().await?;
            let (pipe, source) = tokio::io::duplex(options.pool.buffer_size());
            let (produced, sent) = tokio::join!(
                producer(pipe),
                send_stream(source, out, framing, options.pool)
            );
            sent?;
            produced?;
        }
    }

    out.flush().await?;
    Ok(())
}

fn choose_framing(headers: &Headers, body: &OutgoingBody, explicit_length: Option<u64>) -> Framing {
    if body.is_no_content() {
        return Framing::None;
    }
    let wants_chunked = [headers, &body.headers].iter().any(|headers| {
        headers.get_all(TRANSFER_ENCODING).any(|value| {
            value
                .split(',')
                .any(|coding| coding.trim().eq_ignore_ascii_case(CHUNKED))
        })
    });
    match explicit_length.or_else(|| body.content_length()) {
        Some(length) if !wants_chunked => Framing::Length(length),
        _ => Framing::Chunked,
    }
}

fn put_header(head: &mut BytesMut, name: &str, value: &str) {
    head.put_slice(name.as_bytes());
    head.put_slice(b": ");
    head.put_slice(value.as_bytes());
    head.put_slice(b"\r\n");
}

async fn write_bytes<W>(bytes: Bytes, out: &mut W, framing: Framing) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    match framing {
        Framing::None => Ok(()),
        Framing::Length(length) => {
            if bytes.len() as u64 != length {
                return Err(EngineError::protocol(format!(
                    "body has {} bytes but content-length is {length}",
                    bytes.len()
                )));
            }
            out.write_all(&bytes).await?;
            Ok(())
        }
        Framing::Chunked => {
            let mut chunked = ChunkedWriter::new(out);
            let written = chunked.write_chunk(&bytes).await;
            let finished = chunked.finish().await;
            written?;
            finished?;
            Ok(())
        }
    }
}

/// Copy `source` to `out` with the chosen framing. Takes the source by value so
/// that a producer on the other end of a pipe sees it closed once sending stops.
async fn send_stream<R, W>(mut source: R, out: &mut W, framing: Framing, pool: &BufferPool) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buffer = pool.checkout();
    match framing {
        Framing::None => Ok(()),
        Framing::Length(expected) => {
            let mut written = 0u64;
            loop {
                let read = source.read(&mut buffer).await?;
                if read == 0 {
                    break;
                }
                written += read as u64;
                if written > expected {
                    return Err(EngineError::protocol(format!(
                        "body is longer than content-length {expected}"
                    )));
                }
                out.write_all(&buffer[..read]).await?;
            }
            if written != expected {
                return Err(EngineError::protocol(format!(
                    "body ended after {written} of {expected} bytes"
                )));
            }
            Ok(())
        }
        Framing::Chunked => {
            let mut chunked = ChunkedWriter::new(out);
            let copied: Result<()> = async {
                loop {
                    let read = source.read(&mut buffer).await?;
                    if read == 0 {
                        return Ok(());
                    }
                    chunked.write_chunk(&buffer[..read]).await?;
                }
            }
            .await;
            let finished = chunked.finish().await;
            copied?;
            finished?;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::body::{BodyFraming, BodyReader};
    use crate::protocol::parser::{parse_request, HeadLimits, RawRequest};
    use http::Method;
    use std::io;
    use url::Url;

    async fn serialize(request: HttpRequestData) -> Result<Vec<u8>> {
        let pool = BufferPool::new(8, 4);
        let mut out = Vec::new();
        write_request(
            request,
            &mut out,
            &WriteOptions {
                user_agent: Some("test-agent"),
                pool: &pool,
            },
        )
        .await?;
        Ok(out)
    }

    async fn decode(bytes: &[u8]) -> (RawRequest, Vec<u8>) {
        let mut input = bytes;
        let head = parse_request(&mut input, &HeadLimits::default())
            .await
            .unwrap()
            .unwrap();
        let mut reader = BodyReader::new(BodyFraming::for_request(&head.headers).unwrap());
        let mut body = Vec::new();
        while let Some(chunk) = reader.next_chunk(&mut input).await.unwrap() {
            body.extend_from_slice(&chunk);
        }
        assert!(input.is_empty(), "trailing bytes: {:?}", String::from_utf8_lossy(input));
        (head, body)
    }

    #[tokio::test]
    async fn test_simple_get() {
        let request = HttpRequestData::get("http://example.com:8080/a?b=c").unwrap();
        let bytes = serialize(request).await.unwrap();
        assert_eq!(
            String::from_utf8(bytes).unwrap(),
            "GET /a?b=c HTTP/1.1\r\nHost: example.com:8080\r\nUser-Agent: test-agent\r\n\r\n"
        );
    }

    #[tokio::test]
    async fn test_explicit_host_and_agent_kept() {
        let request = HttpRequestData::get("http://example.com/")
            .unwrap()
            .with_header("User-Agent", "custom")
            .with_header("Host", "virtual.example");
        let (head, _) = decode(&serialize(request).await.unwrap()).await;
        assert_eq!(head.headers.get_all("host").collect::<Vec<_>>(), vec!["virtual.example"]);
        assert_eq!(head.headers.get_all("user-agent").collect::<Vec<_>>(), vec!["custom"]);
    }

    #[tokio::test]
    async fn test_header_merge_prefers_request() {
        let body = OutgoingBody::bytes("{}")
            .with_content_type("application/json")
            .with_header("X-Source", "body")
            .with_header("X-Body-Only", "yes")
            .with_header("Content-Length", "999");
        let request = HttpRequestData::new(Method::PUT, Url::parse("http://example.com/").unwrap())
            .with_header("X-Source", "request")
            .with_header("Content-Type", "text/plain")
            .with_body(body);
        let (head, body) = decode(&serialize(request).await.unwrap()).await;

        assert_eq!(head.headers.get_all("x-source").collect::<Vec<_>>(), vec!["request"]);
        assert_eq!(head.headers.get("x-body-only"), Some("yes"));
        assert_eq!(head.headers.get_all("content-type").collect::<Vec<_>>(), vec!["text/plain"]);
        assert_eq!(head.headers.get_all("content-length").collect::<Vec<_>>(), vec!["2"]);
        assert_eq!(body, b"{}");
    }

    #[tokio::test]
    async fn test_round_trip_preserves_order_and_duplicates() {
        let request = HttpRequestData::new(Method::POST, Url::parse("http://example.com/submit?x=1").unwrap())
            .with_header("Host", "example.com")
            .with_header("User-Agent", "test-agent")
            .with_header("Accept", "text/html")
            .with_header("X-Dup", "one")
            .with_header("x-dup", "two")
            .with_body(OutgoingBody::bytes("payload bytes"));
        let (head, body) = decode(&serialize(request).await.unwrap()).await;

        assert_eq!(head.method, Method::POST);
        assert_eq!(head.target, "/submit?x=1");
        let pairs: Vec<_> = head.headers.iter().collect();
        assert_eq!(
            pairs,
            vec![
                ("Host", "example.com"),
                ("User-Agent", "test-agent"),
                ("Accept", "text/html"),
                ("X-Dup", "one"),
                ("x-dup", "two"),
                ("Content-Length", "13"),
            ]
        );
        assert_eq!(body, b"payload bytes");
    }

    #[tokio::test]
    async fn test_producer_without_length_is_chunked() {
        let body = OutgoingBody::producer(None, |mut pipe| async move {
            for part in ["stream", "ed ", "body that is longer than one buffer"] {
                pipe.write_all(part.as_bytes()).await?;
            }
            Ok(())
        });
        let request = HttpRequestData::new(Method::POST, Url::parse("http://example.com/").unwrap())
            .with_body(body);
        let bytes = serialize(request).await.unwrap();
        let (head, body) = decode(&bytes).await;

        assert_eq!(head.headers.get("transfer-encoding"), Some("chunked"));
        assert!(!head.headers.contains("content-length"));
        assert_eq!(body, b"streamed body that is longer than one buffer");
    }

    #[tokio::test]
    async fn test_reader_with_length() {
        let body = OutgoingBody::reader(&b"0123456789abcdef"[..], Some(16));
        let request = HttpRequestData::new(Method::PUT, Url::parse("http://example.com/").unwrap())
            .with_body(body);
        let (head, body) = decode(&serialize(request).await.unwrap()).await;
        assert_eq!(head.headers.get("content-length"), Some("16"));
        assert_eq!(body, b"0123456789abcdef");
    }

    #[tokio::test]
    async fn test_explicit_chunked_overrides_length() {
        let request = HttpRequestData::new(Method::PUT, Url::parse("http://example.com/").unwrap())
            .with_header("Transfer-Encoding", "chunked")
            .with_body(OutgoingBody::bytes("abc"));
        let bytes = serialize(request).await.unwrap();
        assert!(bytes.ends_with(b"3\r\nabc\r\n0\r\n\r\n"));
    }

    #[tokio::test]
    async fn test_failing_producer_still_terminates_chunks() {
        let body = OutgoingBody::producer(None, |mut pipe| async move {
            pipe.write_all(b"partial").await?;
            Err(io::Error::new(io::ErrorKind::Other, "source failed"))
        });
        let request = HttpRequestData::new(Method::POST, Url::parse("http://example.com/").unwrap())
            .with_body(body);

        let pool = BufferPool::new(64, 4);
        let mut out = Vec::new();
        let result = write_request(request, &mut out, &WriteOptions { user_agent: None, pool: &pool }).await;
        assert!(matches!(result, Err(EngineError::Io(_))));
        assert!(out.ends_with(b"7\r\npartial\r\n0\r\n\r\n"));
    }

    #[tokio::test]
    async fn test_length_mismatch_is_error() {
        let body = OutgoingBody::reader(&b"short"[..], Some(10));
        let request = HttpRequestData::new(Method::PUT, Url::parse("http://example.com/").unwrap())
            .with_body(body);
        assert!(matches!(serialize(request).await, Err(EngineError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_empty_body_never_announces_payload() {
        let request = HttpRequestData::get("http://example.com/")
            .unwrap()
            .with_header("Content-Length", "12");
        let bytes = serialize(request).await.unwrap();
        let (head, body) = decode(&bytes).await;
        assert!(!head.headers.contains("content-length"));
        assert!(body.is_empty());

        let request = HttpRequestData::get("http://example.com/")
            .unwrap()
            .with_header("Content-Length", "0");
        let (head, _) = decode(&serialize(request).await.unwrap()).await;
        assert_eq!(head.headers.get("content-length"), Some("0"));
    }

    #[tokio::test]
    async fn test_upgrade_body_rejected() {
        let request = HttpRequestData::get("http://example.com/")
            .unwrap()
            .with_body(OutgoingBody::upgrade(|_writer| async { Ok(()) }));
        let pool = BufferPool::default();
        let mut out = Vec::new();
        let result = write_request(request, &mut out, &WriteOptions { user_agent: None, pool: &pool }).await;
        assert!(matches!(result, Err(EngineError::UnsupportedBodyType(_))));
        assert!(out.is_empty());
    }
}
