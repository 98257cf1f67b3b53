//! Message body framing and decoding.
//!
//! [`BodyFraming`] decides how a body is delimited from a message head, and
//! [`BodyReader`] pulls the body off a buffered reader one chunk at a time.
//!
//! # Response framing precedence
//!
//! 1. `HEAD` requests and `1xx`, `204` and `304` responses have no body, whatever
//!    their headers say.
//! 2. A `Transfer-Encoding` whose final coding is `chunked` selects chunked
//!    decoding. Any other transfer coding reads until close.
//! 3. A valid `Content-Length` reads exactly that many bytes. A negative,
//!    unparseable, or conflicting length is a protocol error.
//! 4. Otherwise the body runs until the peer closes the connection.

use crate::error::{EngineError, Result};
use crate::protocol::constants::headers::{CONTENT_LENGTH, TRANSFER_ENCODING};
use crate::protocol::constants::{CHUNKED, MAX_CHUNK_LINE};
use crate::protocol::headers::Headers;
use crate::protocol::parser::read_line;
use bytes::Bytes;
use http::Method;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

/// How a message body is delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    /// No body bytes follow the head.
    Empty,
    /// Exactly this many bytes follow.
    Length(u64),
    /// Chunked transfer coding.
    Chunked,
    /// Bytes until the connection closes.
    CloseDelimited,
}

impl BodyFraming {
    /// Framing of a response to a `method` request.
    pub fn for_response(method: &Method, status: u16, headers: &Headers) -> Result<Self> {
        if *method == Method::HEAD || (100..200).contains(&status) || status == 204 || status == 304 {
            return Ok(BodyFraming::Empty);
        }
        if let Some(chunked) = final_coding_is_chunked(headers) {
            return Ok(if chunked {
                BodyFraming::Chunked
            } else {
                BodyFraming::CloseDelimited
            });
        }
        match content_length(headers)? {
            Some(0) => Ok(BodyFraming::Empty),
            Some(length) => Ok(BodyFraming::Length(length)),
            None => Ok(BodyFraming::CloseDelimited),
        }
    }

    /// Framing of a request body. Requests without framing headers have no body.
    pub fn for_request(headers: &Headers) -> Result<Self> {
        if let Some(chunked) = final_coding_is_chunked(headers) {
            if !chunked {
                return Err(EngineError::protocol(
                    "request transfer coding does not end in chunked",
                ));
            }
            return Ok(BodyFraming::Chunked);
        }
        match content_length(headers)? {
            Some(0) | None => Ok(BodyFraming::Empty),
            Some(length) => Ok(BodyFraming::Length(length)),
        }
    }

    /// Whether the connection cannot carry another message after this body.
    pub fn consumes_connection(&self) -> bool {
        matches!(self, BodyFraming::CloseDelimited)
    }
}

/// `Some(true)` when the last transfer coding is `chunked`, `Some(false)` when
/// transfer codings are present but do not end in `chunked`.
fn final_coding_is_chunked(headers: &Headers) -> Option<bool> {
    let codings: Vec<&str> = headers
        .get_all(TRANSFER_ENCODING)
        .flat_map(|value| value.split(','))
        .map(str::trim)
        .filter(|coding| !coding.is_empty())
        .collect();
    let last = codings.last()?;
    Some(last.eq_ignore_ascii_case(CHUNKED))
}

fn content_length(headers: &Headers) -> Result<Option<u64>> {
    let mut length = None;
    for value in headers
        .get_all(CONTENT_LENGTH)
        .flat_map(|value| value.split(','))
        .map(str::trim)
    {
        if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
            return Err(EngineError::protocol(format!("invalid content-length {value:?}")));
        }
        let parsed = value
            .parse::<u64>()
            .map_err(|_| EngineError::protocol(format!("invalid content-length {value:?}")))?;
        match length {
            Some(previous) if previous != parsed => {
                return Err(EngineError::protocol("conflicting content-length values"));
            }
            _ => length = Some(parsed),
        }
    }
    Ok(length)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Length { remaining: u64 },
    ChunkSize,
    ChunkData { remaining: u64 },
    ChunkEnd,
    Close,
    Done,
}

/// Incremental body decoder.
///
/// A reader built for [`BodyFraming::Empty`] never touches its input.
#[derive(Debug)]
pub struct BodyReader {
    state: State,
}

impl BodyReader {
    /// Decoder for `framing`.
    pub fn new(framing: BodyFraming) -> Self {
        let state = match framing {
            BodyFraming::Empty => State::Done,
            BodyFraming::Length(remaining) => State::Length { remaining },
            BodyFraming::Chunked => State::ChunkSize,
            BodyFraming::CloseDelimited => State::Close,
        };
        BodyReader { state }
    }

    /// Whether the whole body has been read.
    pub fn is_done(&self) -> bool {
        self.state == State::Done
    }

    /// Next run of body bytes, or `None` once the body is complete.
    pub async fn next_chunk<R>(&mut self, input: &mut R) -> Result<Option<Bytes>>
    where
        R: AsyncBufRead + Unpin + ?Sized,
    {
        let mut line = Vec::new();
        loop {
            match self.state {
                State::Done => return Ok(None),
                State::Length { remaining: 0 } => self.state = State::Done,
                State::Length { remaining } => {
                    let chunk = read_available(input, remaining).await?;
                    if chunk.is_empty() {
                        return Err(EngineError::PrematureClose);
                    }
                    self.state = State::Length {
                        remaining: remaining - chunk.len() as u64,
                    };
                    return Ok(Some(chunk));
                }
                State::Close => {
                    let chunk = read_available(input, u64::MAX).await?;
                    if chunk.is_empty() {
                        self.state = State::Done;
                        return Ok(None);
                    }
                    return Ok(Some(chunk));
                }
                State::ChunkSize => {
                    read_line(input, &mut line, MAX_CHUNK_LINE)
                        .await?
                        .ok_or(EngineError::PrematureClose)?;
                    let size = parse_chunk_size(&line)?;
                    if size == 0 {
                        read_trailers(input, &mut line).await?;
                        self.state = State::Done;
                    } else {
                        self.state = State::ChunkData { remaining: size };
                    }
                }
                State::ChunkData { remaining } => {
                    let chunk = read_available(input, remaining).await?;
                    if chunk.is_empty() {
                        return Err(EngineError::PrematureClose);
                    }
                    let remaining = remaining - chunk.len() as u64;
                    self.state = if remaining == 0 {
                        State::ChunkEnd
                    } else {
                        State::ChunkData { remaining }
                    };
                    return Ok(Some(chunk));
                }
                State::ChunkEnd => {
                    read_line(input, &mut line, MAX_CHUNK_LINE)
                        .await?
                        .ok_or(EngineError::PrematureClose)?;
                    if !line.is_empty() {
                        return Err(EngineError::protocol("missing line break after chunk data"));
                    }
                    self.state = State::ChunkSize;
                }
            }
        }
    }

    /// Read and discard the rest of the body.
    pub async fn drain<R>(&mut self, input: &mut R) -> Result<()>
    where
        R: AsyncBufRead + Unpin + ?Sized,
    {
        while self.next_chunk(input).await?.is_some() {}
        Ok(())
    }
}

/// Copy up to `limit` buffered bytes, filling the buffer once if it is empty.
/// An empty result means end of stream.
async fn read_available<R>(input: &mut R, limit: u64) -> Result<Bytes>
where
    R: AsyncBufRead + Unpin + ?Sized,
{
    let buffered = input.fill_buf().await?;
    let take = buffered.len().min(usize::try_from(limit).unwrap_or(usize::MAX));
    let chunk = Bytes::copy_from_slice(&buffered[..take]);
    input.consume(take);
    Ok(chunk)
}

fn parse_chunk_size(line: &[u8]) -> Result<u64> {
    let text = String::from_utf8_lossy(line);
    let size = text.split(';').next().unwrap_or_default().trim();
    if size.is_empty() || size.len() > 16 || !size.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(EngineError::protocol(format!("invalid chunk size {text:?}")));
    }
    u64::from_str_radix(size, 16)
        .map_err(|_| EngineError::protocol(format!("invalid chunk size {text:?}")))
}

async fn read_trailers<R>(input: &mut R, line: &mut Vec<u8>) -> Result<()>
where
    R: AsyncBufRead + Unpin + ?Sized,
{
    loop {
        read_line(input, line, MAX_CHUNK_LINE)
            .await?
            .ok_or(EngineError::PrematureClose)?;
        if line.is_empty() {
            return Ok(());
        }
    }
}
