//! Engine scenarios against loopback servers.
//!
//! [`TestServer`] speaks just enough HTTP/1.1 to drive the engine: it parses
//! each request with the crate's own parser, records it, and answers with the
//! [`Reply`] its handler picks. Requests on one connection are answered in
//! order, one at a time, so pipelined requests queue up behind a slow reply.


use crate::client::{CioEngine, EngineConfig};
use crate::protocol::{parse_request, BodyFraming, BodyReader, HeadLimits, Headers};
use crate::types::Destination;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// A request as the server saw it.
#[derive(Debug, Clone)]
pub(crate) struct Received {
    pub method: String,
    pub target: String,
    pub headers: Headers,
    pub body: Bytes,
    pub connection: usize,
}

/// What the server writes back, and how.
#[derive(Debug, Clone)]
pub(crate) struct Reply {
    raw: Vec<u8>,
    delay: Duration,
    close: bool,
}

impl Reply {
    pub fn raw(raw: impl Into<Vec<u8>>) -> Self {
        Reply {
            raw: raw.into(),
            delay: Duration::ZERO,
            close: false,
        }
    }

    pub fn ok(body: impl AsRef<[u8]>) -> Self {
        Self::with_headers(&[], body)
    }

    pub fn with_headers(headers: &[(&str, &str)], body: impl AsRef<[u8]>) -> Self {
        let body = body.as_ref();
        let mut raw = format!("HTTP/1.1 200 OK\r\nContent-Length: {}\r\n", body.len());
        for (name, value) in headers {
            raw.push_str(&format!("{name}: {value}\r\n"));
        }
        raw.push_str("\r\n");
        let mut raw = raw.into_bytes();
        raw.extend_from_slice(body);
        Self::raw(raw)
    }

    /// Answer with `Connection: close`, then close.
    pub fn closing(body: impl AsRef<[u8]>) -> Self {
        Reply {
            close: true,
            ..Self::with_headers(&[("Connection", "close")], body)
        }
    }

    pub fn after(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn then_close(mut self) -> Self {
        self.close = true;
        self
    }
}

#[derive(Default)]
struct ServerState {
    accepted: AtomicUsize,
    open: AtomicUsize,
    peak: AtomicUsize,
    received: Mutex<Vec<Received>>,
}

pub(crate) struct TestServer {
    pub addr: SocketAddr,
    state: Arc<ServerState>,
}

impl TestServer {
    pub async fn start<F>(handler: F) -> Self
    where
        F: Fn(&Received) -> Reply + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(ServerState::default());
        let handler = Arc::new(handler);

        let accept_state = Arc::clone(&state);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let id = accept_state.accepted.fetch_add(1, Ordering::SeqCst);
                let open = accept_state.open.fetch_add(1, Ordering::SeqCst) + 1;
                accept_state.peak.fetch_max(open, Ordering::SeqCst);
                let state = Arc::clone(&accept_state);
                let handler = Arc::clone(&handler);
                tokio::spawn(async move {
                    serve(stream, id, handler.as_ref(), &state).await;
                    state.open.fetch_sub(1, Ordering::SeqCst);
                });
            }
        });

        TestServer { addr, state }
    }

    /// Server answering every request with its own target as the body.
    pub async fn echo() -> Self {
        Self::start(|request| Reply::ok(&request.target)).await
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn destination(&self) -> Destination {
        Destination::new(self.addr.ip().to_string(), self.addr.port(), false)
    }

    pub fn accepted(&self) -> usize {
        self.state.accepted.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.state.peak.load(Ordering::SeqCst)
    }

    pub fn received(&self) -> Vec<Received> {
        self.state.received.lock().clone()
    }

    pub fn targets(&self) -> Vec<String> {
        self.received().into_iter().map(|request| request.target).collect()
    }
}

async fn serve<F>(stream: TcpStream, id: usize, handler: &F, state: &ServerState)
where
    F: Fn(&Received) -> Reply,
{
    let (read, mut write) = stream.into_split();
    let mut input = BufReader::new(read);
    let limits = HeadLimits::default();
    loop {
        let Ok(Some(request)) = parse_request(&mut input, &limits).await else {
            break;
        };
        let Ok(framing) = BodyFraming::for_request(&request.headers) else {
            break;
        };
        let mut reader = BodyReader::new(framing);
        let mut body = BytesMut::new();
        loop {
            match reader.next_chunk(&mut input).await {
                Ok(Some(chunk)) => body.extend_from_slice(&chunk),
                Ok(None) => break,
                Err(_) => return,
            }
        }

        let received = Received {
            method: request.method.to_string(),
            target: request.target,
            headers: request.headers,
            body: body.freeze(),
            connection: id,
        };
        let reply = handler(&received);
        state.received.lock().push(received);

        if !reply.delay.is_zero() {
            tokio::time::sleep(reply.delay).await;
        }
        if write.write_all(&reply.raw).await.is_err() || reply.close {
            break;
        }
    }
    let _ = write.shutdown().await;
}

/// Engine with pipelining on and short timeouts.
pub(crate) fn pipelining_engine(configure: impl FnOnce(&mut EngineConfig)) -> CioEngine {
    let mut config = EngineConfig {
        pipelining: true,
        ..Default::default()
    };
    configure(&mut config);
    CioEngine::with_config(config)
}
