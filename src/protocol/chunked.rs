//! Chunked transfer-coding encoder.

use std::io;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Writes `size CRLF data CRLF` frames and the terminating `0 CRLF CRLF`.
///
/// ```
/// use cio_http::protocol::ChunkedWriter;
///
/// # tokio_test::block_on(async {
/// let mut out = Vec::new();
/// let mut writer = ChunkedWriter::new(&mut out);
/// writer.write_chunk(b"hello").await.unwrap();
/// writer.write_chunk(b"").await.unwrap();
/// writer.finish().await.unwrap();
/// assert_eq!(out, b"5\r\nhello\r\n0\r\n\r\n");
/// # });
/// ```
pub struct ChunkedWriter<'a, W: ?Sized> {
    out: &'a mut W,
    finished: bool,
}

impl<'a, W> ChunkedWriter<'a, W>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    /// Encode into `out`.
    pub fn new(out: &'a mut W) -> Self {
        ChunkedWriter {
            out,
            finished: false,
        }
    }

    /// Write one chunk. Empty input writes nothing, since a zero-size chunk
    /// would end the body.
    pub async fn write_chunk(&mut self, data: &[u8]) -> io::Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let size = format!("{:x}\r\n", data.len());
        self.out.write_all(size.as_bytes()).await?;
        self.out.write_all(data).await?;
        self.out.write_all(b"\r\n").await
    }

    /// Write the terminating zero-size chunk. Only the first call writes.
    pub async fn finish(&mut self) -> io::Result<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        self.out.write_all(b"0\r\n\r\n").await
    }
}
