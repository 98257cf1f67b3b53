//! Reading one response off a connection and handing it to its caller.
//!
//! The response head is parsed here, the caller receives an [`HttpResponse`]
//! whose body is a channel, and the body is then pumped from the connection
//! into that channel. If the caller drops the body early the remaining bytes
//! are still read and discarded so the next response on the connection starts
//! at the right place.

use crate::client::task::ResponseSlot;
use crate::error::{EngineError, Result};
use crate::protocol::{
    parse_response, BodyFraming, BodyReader, ConnectionOptions, HeadLimits, RawResponse,
};
use crate::types::{ExchangeHandle, HttpResponse, ProtocolVersion, ResponseBody};
use bytes::Bytes;
use http::Method;
use std::future::Future;
use std::time::SystemTime;
use tokio::io::AsyncBufRead;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Chunks buffered between the connection and a slow body consumer.
pub(crate) const BODY_CHANNEL_CAPACITY: usize = 16;

/// What the connection knows about a request whose response it is waiting for.
#[derive(Debug, Clone)]
pub(crate) struct Exchange {
    pub method: Method,
    pub request_time: SystemTime,
    pub pipelined: bool,
}

/// Read the next final response head. Informational responses other than
/// `101 Switching Protocols` are skipped.
///
/// Returns `Ok(None)` when the connection closed before any byte of a response.
pub(crate) async fn receive_head<R>(input: &mut R, limits: &HeadLimits) -> Result<Option<RawResponse>>
where
    R: AsyncBufRead + Unpin + ?Sized,
{
    let mut skipped = false;
    loop {
        match parse_response(input, limits).await? {
            None if skipped => return Err(EngineError::PrematureClose),
            None => return Ok(None),
            Some(head) if (100..200).contains(&head.status) && head.status != 101 => {
                trace!(status = head.status, "skipping informational response");
                skipped = true;
            }
            Some(head) => return Ok(Some(head)),
        }
    }
}

/// Whether the connection can carry another exchange after this response.
pub(crate) fn keeps_alive(head: &RawResponse, framing: BodyFraming) -> bool {
    let options = ConnectionOptions::from_headers(&head.headers);
    if options.close || head.status == 101 || framing.consumes_connection() {
        return false;
    }
    head.version != ProtocolVersion::HTTP_1_0 || options.keep_alive
}

pub(crate) fn assemble(
    head: RawResponse,
    body: ResponseBody,
    exchange: &Exchange,
    handle: ExchangeHandle,
) -> HttpResponse {
    HttpResponse {
        status: head.status,
        reason: head.reason,
        version: head.version,
        headers: head.headers,
        body,
        request_time: exchange.request_time,
        response_time: SystemTime::now(),
        pipelined: exchange.pipelined,
        exchange: handle,
    }
}

/// Outcome of pumping a body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BodyEnd {
    /// Every body byte was read off the connection.
    Complete,
    /// Reading failed; the error went to the body consumer.
    Failed,
}

/// Move the body from `input` into `sender` until it ends. Chunks keep being
/// read after the consumer goes away.
///
/// When `abort` resolves first the consumer receives
/// [`EngineError::ConnectionClosed`], so a body cut short never looks complete.
pub(crate) async fn pump_body<R, A>(
    input: &mut R,
    mut reader: BodyReader,
    sender: mpsc::Sender<Result<Bytes>>,
    abort: A,
) -> BodyEnd
where
    R: AsyncBufRead + Unpin + ?Sized,
    A: Future<Output = ()>,
{
    tokio::pin!(abort);
    let mut sender = Some(sender);
    loop {
        let chunk = tokio::select! {
            biased;
            _ = &mut abort => return abandon(sender),
            chunk = reader.next_chunk(input) => chunk,
        };
        match chunk {
            Ok(Some(chunk)) => {
                let Some(consumer) = &sender else {
                    continue;
                };
                let sent = tokio::select! {
                    biased;
                    _ = &mut abort => None,
                    sent = consumer.send(Ok(chunk)) => Some(sent.is_ok()),
                };
                match sent {
                    Some(true) => {}
                    Some(false) => {
                        trace!("response body dropped, draining");
                        sender = None;
                    }
                    None => return abandon(sender),
                }
            }
            Ok(None) => return BodyEnd::Complete,
            Err(err) => {
                debug!(error = %err, "response body failed");
                if let Some(consumer) = sender {
                    let _ = consumer.send(Err(err)).await;
                }
                return BodyEnd::Failed;
            }
        }
    }
}

/// The connection went away under a body still being read.
fn abandon(sender: Option<mpsc::Sender<Result<Bytes>>>) -> BodyEnd {
    debug!("connection aborted mid-body");
    if let Some(consumer) = sender {
        // The consumer may not be reading right now; it must still see the error.
        tokio::spawn(async move {
            let _ = consumer.send(Err(EngineError::ConnectionClosed)).await;
        });
    }
    BodyEnd::Failed
}

/// Deliver a parsed head and its body to `response`.
///
/// Returns whether the connection is still usable afterwards.
pub(crate) async fn respond<R, A>(
    input: &mut R,
    head: RawResponse,
    exchange: &Exchange,
    response: ResponseSlot,
    abort: A,
) -> bool
where
    R: AsyncBufRead + Unpin + ?Sized,
    A: Future<Output = ()>,
{
    let framing = match BodyFraming::for_response(&exchange.method, head.status, &head.headers) {
        Ok(framing) => framing,
        Err(err) => {
            debug!(error = %err, "unframeable response");
            let _ = response.send(Err(err));
            return false;
        }
    };
    let reusable = keeps_alive(&head, framing);
    let reader = BodyReader::new(framing);
    let (guard, handle) = ExchangeHandle::pair();

    if reader.is_done() {
        drop(guard);
        let _ = response.send(Ok(assemble(head, ResponseBody::empty(), exchange, handle)));
        return reusable;
    }

    let (sender, receiver) = mpsc::channel(BODY_CHANNEL_CAPACITY);
    let _ = response.send(Ok(assemble(
        head,
        ResponseBody::channel(receiver),
        exchange,
        handle,
    )));
    let end = pump_body(input, reader, sender, abort).await;
    drop(guard);
    reusable && end == BodyEnd::Complete
}

/// Receive the response to `exchange` and deliver it.
///
/// Failures are reported through `response`, and `abort` resolving ends the
/// exchange with [`EngineError::ConnectionClosed`]. Returns whether the
/// connection is still usable afterwards.
pub(crate) async fn deliver<R, A>(
    input: &mut R,
    exchange: Exchange,
    response: ResponseSlot,
    limits: &HeadLimits,
    abort: A,
) -> bool
where
    R: AsyncBufRead + Unpin + ?Sized,
    A: Future<Output = ()>,
{
    tokio::pin!(abort);
    let head = tokio::select! {
        biased;
        _ = &mut abort => {
            debug!("connection aborted before the response arrived");
            let _ = response.send(Err(EngineError::ConnectionClosed));
            return false;
        }
        head = receive_head(input, limits) => head,
    };
    match head {
        Ok(Some(head)) => respond(input, head, &exchange, response, abort).await,
        Ok(None) => {
            debug!("connection closed before the response arrived");
            let _ = response.send(Err(EngineError::ConnectionClosed));
            false
        }
        Err(err) => {
            debug!(error = %err, "failed to read response head");
            let _ = response.send(Err(err));
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::pending;
    use tokio::io::{AsyncWriteExt, BufReader};
    use tokio::sync::oneshot;

    fn exchange(method: Method) -> Exchange {
        Exchange {
            method,
            request_time: SystemTime::now(),
            pipelined: true,
        }
    }

    #[tokio::test]
    async fn test_skips_continue() {
        let mut input: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok";
        let (tx, rx) = oneshot::channel();
        let reusable = deliver(&mut input, exchange(Method::GET), tx, &HeadLimits::default(), pending()).await;
        assert!(reusable);
        let response = rx.await.unwrap().unwrap();
        assert_eq!(response.status, 200);
        assert!(response.pipelined);
        assert!(response.exchange.is_finished());
        assert_eq!(response.text().await.unwrap(), "ok");
    }

    #[tokio::test]
    async fn test_eof_is_connection_closed() {
        let mut input: &[u8] = b"";
        let (tx, rx) = oneshot::channel();
        assert!(!deliver(&mut input, exchange(Method::GET), tx, &HeadLimits::default(), pending()).await);
        assert!(matches!(rx.await.unwrap(), Err(EngineError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_connection_close_and_http10() {
        let mut input: &[u8] = b"HTTP/1.1 200 OK\r\nConnection: close\r\nContent-Length: 0\r\n\r\n";
        let (tx, _rx) = oneshot::channel();
        assert!(!deliver(&mut input, exchange(Method::GET), tx, &HeadLimits::default(), pending()).await);

        let mut input: &[u8] = b"HTTP/1.0 200 OK\r\nContent-Length: 0\r\n\r\n";
        let (tx, _rx) = oneshot::channel();
        assert!(!deliver(&mut input, exchange(Method::GET), tx, &HeadLimits::default(), pending()).await);

        let mut input: &[u8] = b"HTTP/1.0 200 OK\r\nConnection: keep-alive\r\nContent-Length: 0\r\n\r\n";
        let (tx, _rx) = oneshot::channel();
        assert!(deliver(&mut input, exchange(Method::GET), tx, &HeadLimits::default(), pending()).await);
    }

    #[tokio::test]
    async fn test_dropped_body_is_drained() {
        let mut input: &[u8] =
            b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\n0123456789HTTP/1.1 204 No Content\r\n\r\n";
        let (tx, rx) = oneshot::channel();
        drop(rx);
        assert!(deliver(&mut input, exchange(Method::GET), tx, &HeadLimits::default(), pending()).await);
        assert_eq!(input, b"HTTP/1.1 204 No Content\r\n\r\n");
    }

    #[tokio::test]
    async fn test_truncated_body_reports_premature_close() {
        let mut input: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nshort";
        let (tx, rx) = oneshot::channel();
        let delivered = tokio::spawn(async move {
            deliver(&mut input, exchange(Method::GET), tx, &HeadLimits::default(), pending()).await
        });
        let response = rx.await.unwrap().unwrap();
        assert!(matches!(response.bytes().await, Err(EngineError::PrematureClose)));
        assert!(!delivered.await.unwrap());
    }

    #[tokio::test]
    async fn test_head_response_has_no_body() {
        let mut input: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\n\r\nHTTP/1.1 200 OK\r\n";
        let (tx, rx) = oneshot::channel();
        assert!(deliver(&mut input, exchange(Method::HEAD), tx, &HeadLimits::default(), pending()).await);
        assert!(rx.await.unwrap().unwrap().bytes().await.unwrap().is_empty());
        assert_eq!(input, b"HTTP/1.1 200 OK\r\n");
    }

    #[tokio::test]
    async fn test_abort_mid_body_fails_the_consumer() {
        let (client, mut server) = tokio::io::duplex(256);
        server
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\n\r\n0123456789")
            .await
            .unwrap();
        let (abort, aborted) = oneshot::channel::<()>();
        let (tx, rx) = oneshot::channel();
        let delivered = tokio::spawn(async move {
            let mut input = BufReader::new(client);
            let aborted = async move {
                let _ = aborted.await;
            };
            deliver(&mut input, exchange(Method::GET), tx, &HeadLimits::default(), aborted).await
        });

        let response = rx.await.unwrap().unwrap();
        abort.send(()).unwrap();
        assert!(!delivered.await.unwrap());
        assert!(matches!(response.bytes().await, Err(EngineError::ConnectionClosed)));
        drop(server);
    }

    #[tokio::test]
    async fn test_abort_before_head_is_connection_closed() {
        let (client, _server) = tokio::io::duplex(256);
        let mut input = BufReader::new(client);
        let (tx, rx) = oneshot::channel();
        assert!(!deliver(&mut input, exchange(Method::GET), tx, &HeadLimits::default(), async {}).await);
        assert!(matches!(rx.await.unwrap(), Err(EngineError::ConnectionClosed)));
    }
}
