//! HTTP/1.1 message head parser.
//!
//! Reads a status line (or request line) and its header block from a buffered
//! async reader, leaving the reader positioned at the first body byte.
//!
//! # Tolerance
//!
//! | Input | Handling |
//! |-------|----------|
//! | Bare `LF` line endings | Accepted alongside `CRLF` |
//! | Runs of spaces between status-line fields | Treated as one separator |
//! | Empty lines before the status line | Skipped |
//! | Missing reason phrase | Accepted, reason is empty |
//! | Folded header continuation lines | Joined to the previous value with one space |
//! | Whitespace inside a header name | Protocol error |
//! | Line or block longer than [`HeadLimits`] | Protocol error |
//!
//! # End of stream
//!
//! [`parse_response`] returns `Ok(None)` only when the stream ends before a
//! single byte arrived, which is how an idle keep-alive connection closed by
//! the peer looks. End of stream anywhere later is
//! [`EngineError::PrematureClose`].
//!
//! # Examples
//!
//! ```
//! use cio_http::protocol::{parse_response, HeadLimits};
//!
//! # tokio_test::block_on(async {
//! let mut input: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello";
//! let response = parse_response(&mut input, &HeadLimits::default()).await.unwrap().unwrap();
//! assert_eq!(response.status, 200);
//! assert_eq!(response.headers.get("content-length"), Some("5"));
//! assert_eq!(input, b"hello");
//! # });
//! ```

use crate::error::{EngineError, Result};
use crate::protocol::headers::Headers;
use crate::types::ProtocolVersion;
use http::Method;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

/// Size limits applied while reading a message head.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeadLimits {
    /// Longest accepted single line, excluding the line terminator.
    pub max_line: usize,
    /// Longest accepted header block, status line included.
    pub max_head: usize,
}

impl HeadLimits {
    /// Use `max_header_size` for both the line and the block limit.
    pub fn new(max_header_size: usize) -> Self {
        HeadLimits {
            max_line: max_header_size,
            max_head: max_header_size,
        }
    }
}

impl Default for HeadLimits {
    fn default() -> Self {
        HeadLimits::new(16 * 1024)
    }
}

/// Parsed status line and headers of a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponse {
    /// Protocol version.
    pub version: ProtocolVersion,
    /// Three-digit status code.
    pub status: u16,
    /// Reason phrase, possibly empty.
    pub reason: String,
    /// Header block.
    pub headers: Headers,
}

/// Parsed request line and headers of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRequest {
    /// Request method.
    pub method: Method,
    /// Request target as sent.
    pub target: String,
    /// Protocol version.
    pub version: ProtocolVersion,
    /// Header block.
    pub headers: Headers,
}

/// Read one line into `line` without its terminator.
///
/// Returns `Ok(None)` on end of stream before any byte, otherwise the number of
/// bytes consumed including the terminator.
pub(crate) async fn read_line<R>(input: &mut R, line: &mut Vec<u8>, limit: usize) -> Result<Option<usize>>
where
    R: AsyncBufRead + Unpin + ?Sized,
{
    line.clear();
    let read = (&mut *input)
        .take(limit as u64 + 2)
        .read_until(b'\n', line)
        .await?;
    if read == 0 {
        return Ok(None);
    }
    if line.last() != Some(&b'\n') {
        return if read > limit {
            Err(EngineError::protocol(format!("line exceeds {limit} bytes")))
        } else {
            Err(EngineError::PrematureClose)
        };
    }
    line.pop();
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    if line.len() > limit {
        return Err(EngineError::protocol(format!("line exceeds {limit} bytes")));
    }
    Ok(Some(read))
}

/// Read the first non-empty line of a message.
async fn read_start_line<R>(input: &mut R, limits: &HeadLimits) -> Result<Option<(String, usize)>>
where
    R: AsyncBufRead + Unpin + ?Sized,
{
    let mut line = Vec::new();
    let mut consumed = 0;
    loop {
        match read_line(input, &mut line, limits.max_line).await? {
            None if consumed == 0 => return Ok(None),
            None => return Err(EngineError::PrematureClose),
            Some(read) => {
                consumed += read;
                if consumed > limits.max_head {
                    return Err(EngineError::protocol("message head exceeds limit"));
                }
                if !line.is_empty() {
                    return Ok(Some((String::from_utf8_lossy(&line).into_owned(), consumed)));
                }
            }
        }
    }
}

/// Read header lines up to and including the terminating blank line.
async fn read_headers<R>(input: &mut R, limits: &HeadLimits, mut consumed: usize) -> Result<Headers>
where
    R: AsyncBufRead + Unpin + ?Sized,
{
    let mut headers = Headers::new();
    let mut line = Vec::new();
    loop {
        let read = read_line(input, &mut line, limits.max_line)
            .await?
            .ok_or(EngineError::PrematureClose)?;
        consumed += read;
        if consumed > limits.max_head {
            return Err(EngineError::protocol("message head exceeds limit"));
        }
        if line.is_empty() {
            return Ok(headers);
        }

        let text = String::from_utf8_lossy(&line);
        if text.starts_with([' ', '\t']) {
            let previous = headers
                .last_value_mut()
                .ok_or_else(|| EngineError::protocol("continuation line before first header"))?;
            previous.push(' ');
            previous.push_str(text.trim());
            continue;
        }

        let (name, value) = text
            .split_once(':')
            .ok_or_else(|| EngineError::protocol(format!("header line without colon: {text:?}")))?;
        if name.is_empty() || name.bytes().any(|b| b.is_ascii_whitespace() || b.is_ascii_control()) {
            return Err(EngineError::protocol(format!("invalid header name {name:?}")));
        }
        headers.append(name, value.trim());
    }
}

/// Split off the first space-separated token, skipping any run of spaces after it.
fn next_token(text: &str) -> (&str, &str) {
    match text.find([' ', '\t']) {
        Some(index) => (&text[..index], text[index..].trim_start_matches([' ', '\t'])),
        None => (text, ""),
    }
}

/// Parse a response head.
///
/// Returns `Ok(None)` when the stream ended before any byte arrived.
pub async fn parse_response<R>(input: &mut R, limits: &HeadLimits) -> Result<Option<RawResponse>>
where
    R: AsyncBufRead + Unpin + ?Sized,
{
    let Some((line, consumed)) = read_start_line(input, limits).await? else {
        return Ok(None);
    };

    let (version, rest) = next_token(line.trim());
    let (code, reason) = next_token(rest);
    let version = ProtocolVersion::parse(version)?;
    if code.len() != 3 || !code.bytes().all(|b| b.is_ascii_digit()) {
        return Err(EngineError::protocol(format!("invalid status code in {line:?}")));
    }
    let status = code
        .parse::<u16>()
        .map_err(|_| EngineError::protocol(format!("invalid status code in {line:?}")))?;

    let headers = read_headers(input, limits, consumed).await?;
    Ok(Some(RawResponse {
        version,
        status,
        reason: reason.to_string(),
        headers,
    }))
}

/// Parse a request head.
///
/// Returns `Ok(None)` when the stream ended before any byte arrived.
pub async fn parse_request<R>(input: &mut R, limits: &HeadLimits) -> Result<Option<RawRequest>>
where
    R: AsyncBufRead + Unpin + ?Sized,
{
    let Some((line, consumed)) = read_start_line(input, limits).await? else {
        return Ok(None);
    };

    let (method, rest) = next_token(line.trim());
    let (target, version) = next_token(rest);
    if target.is_empty() || version.is_empty() {
        return Err(EngineError::protocol(format!("invalid request line {line:?}")));
    }
    let method = Method::from_bytes(method.as_bytes())
        .map_err(|_| EngineError::protocol(format!("invalid method in {line:?}")))?;
    let version = ProtocolVersion::parse(version)?;

    let headers = read_headers(input, limits, consumed).await?;
    Ok(Some(RawRequest {
        method,
        target: target.to_string(),
        version,
        headers,
    }))
}
