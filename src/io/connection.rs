//! Transport connections handed from connectors to pipelines.

use crate::io::pool::BufferPool;
use crate::io::socket::SocketIo;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncBufRead, AsyncRead, AsyncWrite, BufReader, BufWriter, ReadBuf};
use tokio::net::TcpStream;

/// Any bidirectional byte stream a connection can run over.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

/// Buffered read half of a connection.
pub type BoxedReader = Box<dyn AsyncBufRead + Send + Unpin>;

/// Write half of a connection.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// An established connection to a destination.
///
/// | Variant | Used for |
/// |---------|----------|
/// | `Socket` | Plain TCP driven through the non-blocking [`SocketIo`] adapter |
/// | `Stream` | Anything else: a TLS session layered over a socket, or an in-memory stream |
pub enum Connection {
    /// Plain TCP socket with its readiness adapter.
    Socket(SocketIo<TcpStream>),
    /// Boxed byte stream.
    Stream(Box<dyn AsyncStream>),
}

impl Connection {
    /// Wrap a connected TCP stream in the socket adapter.
    pub fn socket(stream: TcpStream, pool: &BufferPool) -> Self {
        Connection::Socket(SocketIo::new(stream, pool))
    }

    /// Wrap an arbitrary byte stream.
    pub fn stream<S: AsyncStream + 'static>(stream: S) -> Self {
        Connection::Stream(Box::new(stream))
    }

    /// Split into a buffered reader and a writer that can be driven by two tasks.
    ///
    /// The socket variant splits along the adapter's own halves, so dropping the
    /// reader shuts down the read direction and shutting down the writer closes
    /// the write direction.
    pub fn into_split(self, pool: &BufferPool) -> (BoxedReader, BoxedWriter) {
        match self {
            Connection::Socket(io) => {
                let (reader, writer) = io.split();
                (Box::new(reader), Box::new(writer))
            }
            Connection::Stream(stream) => {
                let (reader, writer) = tokio::io::split(stream);
                (
                    Box::new(BufReader::with_capacity(pool.buffer_size(), reader)),
                    Box::new(BufWriter::with_capacity(pool.buffer_size(), writer)),
                )
            }
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Connection::Socket(io) => f
                .debug_tuple("Socket")
                .field(&io.socket().peer_addr().ok())
                .finish(),
            Connection::Stream(_) => f.write_str("Stream"),
        }
    }
}

impl AsyncRead for Connection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Connection::Socket(io) => Pin::new(io).poll_read(cx, buf),
            Connection::Stream(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Connection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Connection::Socket(io) => Pin::new(io).poll_write(cx, buf),
            Connection::Stream(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Connection::Socket(io) => Pin::new(io).poll_flush(cx),
            Connection::Stream(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Connection::Socket(io) => Pin::new(io).poll_shutdown(cx),
            Connection::Stream(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_stream_split_round_trip() {
        let (client, mut server) = tokio::io::duplex(256);
        let pool = BufferPool::new(64, 2);
        let (mut reader, mut writer) = Connection::stream(client).into_split(&pool);

        writer.write_all(b"hello\n").await.unwrap();
        writer.flush().await.unwrap();

        let mut received = [0u8; 6];
        tokio::io::AsyncReadExt::read_exact(&mut server, &mut received)
            .await
            .unwrap();
        assert_eq!(&received, b"hello\n");

        server.write_all(b"world\n").await.unwrap();
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        assert_eq!(line, "world\n");
    }

    #[tokio::test]
    async fn test_socket_split_half_close() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut received = Vec::new();
            tokio::io::AsyncReadExt::read_to_end(&mut stream, &mut received)
                .await
                .unwrap();
            stream.write_all(b"done\n").await.unwrap();
            received
        });

        let pool = BufferPool::new(64, 2);
        let stream = TcpStream::connect(addr).await.unwrap();
        let (mut reader, mut writer) = Connection::socket(stream, &pool).into_split(&pool);
        writer.write_all(b"request").await.unwrap();
        writer.shutdown().await.unwrap();

        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        assert_eq!(line, "done\n");
        assert_eq!(server.await.unwrap(), b"request");
    }
}
