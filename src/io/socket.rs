//! Non-blocking socket I/O adapter.
//!
//! Turns a readiness-based socket (a handle plus its registration with the
//! runtime's readiness multiplexer) into suspendable byte-stream reads and writes.
//!
//! # Algorithm
//!
//! Reads first attempt a direct non-blocking read. If that reports
//! `WouldBlock`, the adapter records read interest, registers the task with the
//! multiplexer and suspends. When readiness is signalled it retries the read, and
//! loops until data arrives, end of stream is observed, or an error occurs.
//! Writes are symmetric with write interest. Interest flags are cleared as soon
//! as a transfer succeeds.
//!
//! Any I/O error poisons the adapter: the failing call receives the error and
//! every later call on either half fails with the same kind. There is no retry
//! at this layer.
//!
//! # Ownership
//!
//! [`SocketIo`] exclusively owns the handle. [`SocketIo::split`] hands the read
//! side and the write side to two different tasks (the pipeline's reader and
//! writer); each half owns its own pooled buffer.

use crate::io::pool::{BufferPool, PooledBuffer};
use parking_lot::Mutex;
use std::io;
use std::net::Shutdown;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncBufRead, AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;

/// Transfer direction a task can wait on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Wait until the socket is readable.
    Read,
    /// Wait until the socket is writable.
    Write,
}

/// A socket handle registered with a readiness multiplexer.
///
/// `try_read`/`try_write` never block; they return `WouldBlock` when the socket
/// is not ready. `poll_ready` registers the calling task's waker for the given
/// direction and resolves once the multiplexer reports readiness.
pub trait Selectable: Send + Sync + 'static {
    /// Register interest in `direction` and resolve when the socket is ready.
    fn poll_ready(&self, cx: &mut Context<'_>, direction: Direction) -> Poll<io::Result<()>>;

    /// Non-blocking read into `buf`. `Ok(0)` is end of stream.
    fn try_read(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Non-blocking write from `buf`.
    fn try_write(&self, buf: &[u8]) -> io::Result<usize>;

    /// Shut down one or both halves of the connection.
    fn shutdown(&self, how: Shutdown) -> io::Result<()>;
}

impl Selectable for TcpStream {
    fn poll_ready(&self, cx: &mut Context<'_>, direction: Direction) -> Poll<io::Result<()>> {
        match direction {
            Direction::Read => self.poll_read_ready(cx),
            Direction::Write => self.poll_write_ready(cx),
        }
    }

    fn try_read(&self, buf: &mut [u8]) -> io::Result<usize> {
        TcpStream::try_read(self, buf)
    }

    fn try_write(&self, buf: &[u8]) -> io::Result<usize> {
        TcpStream::try_write(self, buf)
    }

    fn shutdown(&self, how: Shutdown) -> io::Result<()> {
        socket2::SockRef::from(self).shutdown(how)
    }
}

struct SocketShared<S> {
    socket: S,
    read_interest: AtomicBool,
    write_interest: AtomicBool,
    poisoned: Mutex<Option<io::ErrorKind>>,
}

impl<S: Selectable> SocketShared<S> {
    fn check(&self) -> io::Result<()> {
        match *self.poisoned.lock() {
            Some(kind) => Err(io::Error::new(
                kind,
                "socket is unusable after an earlier i/o error",
            )),
            None => Ok(()),
        }
    }

    fn poison(&self, err: io::Error) -> io::Error {
        let mut poisoned = self.poisoned.lock();
        if poisoned.is_none() {
            *poisoned = Some(err.kind());
        }
        err
    }

    fn interest(&self, direction: Direction) -> &AtomicBool {
        match direction {
            Direction::Read => &self.read_interest,
            Direction::Write => &self.write_interest,
        }
    }

    /// Wait for readiness after a `WouldBlock`, keeping the interest flag raised
    /// while suspended.
    fn poll_wait(&self, cx: &mut Context<'_>, direction: Direction) -> Poll<io::Result<()>> {
        self.interest(direction).store(true, Ordering::Release);
        self.socket
            .poll_ready(cx, direction)
            .map_err(|err| self.poison(err))
    }

    fn transferred(&self, direction: Direction) {
        self.interest(direction).store(false, Ordering::Release);
    }

    fn close_half(&self, how: Shutdown) {
        // Already-closed or reset sockets report errors here; none of them matter
        // once we are closing.
        if let Err(err) = self.socket.shutdown(how) {
            tracing::trace!(?how, error = %err, "ignoring shutdown error");
        }
    }
}

/// Exclusive owner of one socket handle, readable and writable.
pub struct SocketIo<S: Selectable> {
    reader: SocketReader<S>,
    writer: SocketWriter<S>,
}

impl<S: Selectable> SocketIo<S> {
    /// Wrap a registered socket, borrowing one read and one write buffer from `pool`.
    pub fn new(socket: S, pool: &BufferPool) -> Self {
        let shared = Arc::new(SocketShared {
            socket,
            read_interest: AtomicBool::new(false),
            write_interest: AtomicBool::new(false),
            poisoned: Mutex::new(None),
        });
        SocketIo {
            reader: SocketReader {
                shared: Arc::clone(&shared),
                buffer: pool.checkout(),
                pos: 0,
                filled: 0,
            },
            writer: SocketWriter {
                shared,
                buffer: pool.checkout(),
                start: 0,
                end: 0,
                shut: false,
            },
        }
    }

    /// Split into independently owned read and write halves.
    pub fn split(self) -> (SocketReader<S>, SocketWriter<S>) {
        (self.reader, self.writer)
    }

    /// Whether a reader is currently suspended waiting for read readiness.
    pub fn read_interest(&self) -> bool {
        self.reader.read_interest()
    }

    /// Whether a writer is currently suspended waiting for write readiness.
    pub fn write_interest(&self) -> bool {
        self.writer.write_interest()
    }

    /// The underlying socket handle.
    pub fn socket(&self) -> &S {
        &self.reader.shared.socket
    }
}

impl<S: Selectable> AsyncRead for SocketIo<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().reader).poll_read(cx, buf)
    }
}

impl<S: Selectable> AsyncBufRead for SocketIo<S> {
    fn poll_fill_buf(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<&[u8]>> {
        Pin::new(&mut self.get_mut().reader).poll_fill_buf(cx)
    }

    fn consume(self: Pin<&mut Self>, amt: usize) {
        Pin::new(&mut self.get_mut().reader).consume(amt)
    }
}

impl<S: Selectable> AsyncWrite for SocketIo<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().writer).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().writer).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().writer).poll_shutdown(cx)
    }
}

/// Read half of a [`SocketIo`]. Shuts down the read direction when dropped.
pub struct SocketReader<S: Selectable> {
    shared: Arc<SocketShared<S>>,
    buffer: PooledBuffer,
    pos: usize,
    filled: usize,
}

impl<S: Selectable> SocketReader<S> {
    /// Whether this half is suspended waiting for read readiness.
    pub fn read_interest(&self) -> bool {
        self.shared.read_interest.load(Ordering::Acquire)
    }

    /// Refill the internal buffer. Only called once it has been fully consumed.
    fn poll_fill(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.shared.check()?;
        loop {
            match self.shared.socket.try_read(&mut self.buffer) {
                Ok(n) => {
                    self.shared.transferred(Direction::Read);
                    self.pos = 0;
                    self.filled = n;
                    return Poll::Ready(Ok(()));
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    ready!(self.shared.poll_wait(cx, Direction::Read))?;
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Poll::Ready(Err(self.shared.poison(err))),
            }
        }
    }
}

impl<S: Selectable> AsyncRead for SocketReader<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.pos >= this.filled {
            ready!(this.poll_fill(cx))?;
        }
        let available = &this.buffer[this.pos..this.filled];
        let n = available.len().min(buf.remaining());
        buf.put_slice(&available[..n]);
        this.pos += n;
        Poll::Ready(Ok(()))
    }
}

impl<S: Selectable> AsyncBufRead for SocketReader<S> {
    fn poll_fill_buf(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<&[u8]>> {
        let this = self.get_mut();
        if this.pos >= this.filled {
            ready!(this.poll_fill(cx))?;
        }
        Poll::Ready(Ok(&this.buffer[this.pos..this.filled]))
    }

    fn consume(self: Pin<&mut Self>, amt: usize) {
        let this = self.get_mut();
        this.pos = (this.pos + amt).min(this.filled);
    }
}

impl<S: Selectable> Drop for SocketReader<S> {
    fn drop(&mut self) {
        self.shared.close_half(Shutdown::Read);
    }
}

/// Write half of a [`SocketIo`]. Bytes are buffered until the buffer fills or
/// the caller flushes.
pub struct SocketWriter<S: Selectable> {
    shared: Arc<SocketShared<S>>,
    buffer: PooledBuffer,
    start: usize,
    end: usize,
    shut: bool,
}

impl<S: Selectable> SocketWriter<S> {
    /// Whether this half is suspended waiting for write readiness.
    pub fn write_interest(&self) -> bool {
        self.shared.write_interest.load(Ordering::Acquire)
    }

    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while self.start < self.end {
            match self
                .shared
                .socket
                .try_write(&self.buffer[self.start..self.end])
            {
                Ok(0) => {
                    let err = io::Error::new(io::ErrorKind::WriteZero, "socket accepted no bytes");
                    return Poll::Ready(Err(self.shared.poison(err)));
                }
                Ok(n) => {
                    self.shared.transferred(Direction::Write);
                    self.start += n;
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    ready!(self.shared.poll_wait(cx, Direction::Write))?;
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Poll::Ready(Err(self.shared.poison(err))),
            }
        }
        self.start = 0;
        self.end = 0;
        Poll::Ready(Ok(()))
    }
}

impl<S: Selectable> AsyncWrite for SocketWriter<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        this.shared.check()?;
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        if this.end == this.buffer.len() {
            ready!(this.poll_drain(cx))?;
        }
        let n = buf.len().min(this.buffer.len() - this.end);
        this.buffer[this.end..this.end + n].copy_from_slice(&buf[..n]);
        this.end += n;
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        this.shared.check()?;
        this.poll_drain(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.shut {
            ready!(this.poll_drain(cx))?;
            this.shut = true;
            this.shared.close_half(Shutdown::Write);
        }
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[derive(Default)]
    struct ScriptedSocket {
        reads: Mutex<VecDeque<io::Result<Vec<u8>>>>,
        writes: Mutex<VecDeque<io::Result<usize>>>,
        written: Mutex<Vec<u8>>,
        shutdowns: Mutex<Vec<Shutdown>>,
        ready: AtomicBool,
        ready_polls: AtomicUsize,
    }

    impl ScriptedSocket {
        fn ready() -> Self {
            let socket = ScriptedSocket::default();
            socket.ready.store(true, Ordering::SeqCst);
            socket
        }

        fn push_read(&self, result: io::Result<&[u8]>) {
            self.reads.lock().push_back(result.map(|data| data.to_vec()));
        }

        fn push_write(&self, result: io::Result<usize>) {
            self.writes.lock().push_back(result);
        }
    }

    impl Selectable for Arc<ScriptedSocket> {
        fn poll_ready(&self, _cx: &mut Context<'_>, _direction: Direction) -> Poll<io::Result<()>> {
            self.ready_polls.fetch_add(1, Ordering::SeqCst);
            if self.ready.load(Ordering::SeqCst) {
                Poll::Ready(Ok(()))
            } else {
                Poll::Pending
            }
        }

        fn try_read(&self, buf: &mut [u8]) -> io::Result<usize> {
            match self.reads.lock().pop_front() {
                None => Ok(0),
                Some(Ok(data)) => {
                    buf[..data.len()].copy_from_slice(&data);
                    Ok(data.len())
                }
                Some(Err(err)) => Err(err),
            }
        }

        fn try_write(&self, buf: &[u8]) -> io::Result<usize> {
            let n = match self.writes.lock().pop_front() {
                None => buf.len(),
                Some(Ok(n)) => n.min(buf.len()),
                Some(Err(err)) => return Err(err),
            };
            self.written.lock().extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn shutdown(&self, how: Shutdown) -> io::Result<()> {
            self.shutdowns.lock().push(how);
            Ok(())
        }
    }

    fn would_block() -> io::Error {
        io::Error::from(io::ErrorKind::WouldBlock)
    }

    #[tokio::test]
    async fn test_read_retries_after_would_block() {
        let socket = Arc::new(ScriptedSocket::ready());
        socket.push_read(Err(would_block()));
        socket.push_read(Ok(b"hello"));

        let pool = BufferPool::new(64, 4);
        let mut io = SocketIo::new(Arc::clone(&socket), &pool);
        let mut out = Vec::new();
        io.read_to_end(&mut out).await.unwrap();

        assert_eq!(out, b"hello");
        assert_eq!(socket.ready_polls.load(Ordering::SeqCst), 1);
        assert!(!io.read_interest());
    }

    #[test]
    fn test_interest_raised_while_suspended_and_cleared_after_transfer() {
        let socket = Arc::new(ScriptedSocket::default());
        socket.push_read(Err(would_block()));

        let pool = BufferPool::new(64, 4);
        let mut io = SocketIo::new(Arc::clone(&socket), &pool);
        let mut cx = Context::from_waker(futures::task::noop_waker_ref());

        assert!(Pin::new(&mut io).poll_fill_buf(&mut cx).is_pending());
        assert!(io.read_interest());

        socket.push_read(Ok(b"data"));
        socket.ready.store(true, Ordering::SeqCst);
        match Pin::new(&mut io).poll_fill_buf(&mut cx) {
            Poll::Ready(Ok(bytes)) => assert_eq!(bytes, b"data"),
            other => panic!("unexpected poll result: {:?}", other.map(|r| r.map(|b| b.to_vec()))),
        }
        assert!(!io.read_interest());
    }

    #[tokio::test]
    async fn test_write_waits_for_readiness() {
        let socket = Arc::new(ScriptedSocket::ready());
        socket.push_write(Err(would_block()));
        socket.push_write(Ok(3));

        let pool = BufferPool::new(64, 4);
        let mut io = SocketIo::new(Arc::clone(&socket), &pool);
        io.write_all(b"GET / HTTP/1.1\r\n").await.unwrap();
        io.flush().await.unwrap();

        assert_eq!(socket.written.lock().as_slice(), b"GET / HTTP/1.1\r\n");
        assert_eq!(socket.ready_polls.load(Ordering::SeqCst), 1);
        assert!(!io.write_interest());
    }

    #[tokio::test]
    async fn test_error_poisons_both_halves() {
        let socket = Arc::new(ScriptedSocket::ready());
        socket.push_read(Err(io::Error::from(io::ErrorKind::ConnectionReset)));

        let pool = BufferPool::new(64, 4);
        let mut io = SocketIo::new(Arc::clone(&socket), &pool);
        let mut buf = [0u8; 8];
        let err = io.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);

        let err = io.write_all(b"x").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
        assert!(socket.written.lock().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_write_then_read() {
        let socket = Arc::new(ScriptedSocket::ready());
        let pool = BufferPool::new(64, 4);
        let (reader, mut writer) = SocketIo::new(Arc::clone(&socket), &pool).split();

        writer.write_all(b"bye").await.unwrap();
        writer.shutdown().await.unwrap();
        drop(reader);

        assert_eq!(socket.written.lock().as_slice(), b"bye");
        assert_eq!(
            socket.shutdowns.lock().as_slice(),
            &[Shutdown::Write, Shutdown::Read]
        );
    }

    #[tokio::test]
    async fn test_buffers_return_to_pool() {
        let socket = Arc::new(ScriptedSocket::ready());
        let pool = BufferPool::new(64, 4);
        let io = SocketIo::new(socket, &pool);
        assert_eq!(pool.available(), 0);
        drop(io);
        assert_eq!(pool.available(), 2);
    }

    #[tokio::test]
    async fn test_tcp_round_trip() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await.unwrap();
            stream.write_all(&buf).await.unwrap();
        });

        let stream = TcpStream::connect(addr).await.unwrap();
        let pool = BufferPool::new(1024, 4);
        let mut io = SocketIo::new(stream, &pool);
        io.write_all(b"ping").await.unwrap();
        io.flush().await.unwrap();

        let mut echoed = [0u8; 4];
        io.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"ping");
        server.await.unwrap();
    }
}
