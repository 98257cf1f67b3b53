//! Single-exchange connections.
//!
//! Requests that cannot share a pipeline get a connection of their own. It
//! carries exactly one request and response, then closes. When the request
//! carries an upgrade body and the server answers `101 Switching Protocols`,
//! the connection is handed over: the upgrade handler gets the write half and
//! the response body streams the read half until the server closes it.

use crate::client::endpoint::{connect, ConnectionKind, EndpointShared};
use crate::client::exchange::{assemble, receive_head, respond, Exchange, BODY_CHANNEL_CAPACITY};
use crate::client::task::{RequestTask, ResponseSlot};
use crate::error::{EngineError, Result};
use crate::io::{BoxedReader, BoxedWriter};
use crate::protocol::{write_request, BodyFraming, BodyReader, RawResponse};
use crate::types::{ExchangeHandle, HttpRequestData, ResponseBody, UpgradeHandler};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Run `task` on a fresh connection to the endpoint's destination.
pub(crate) async fn run_dedicated(shared: Arc<EndpointShared>, task: RequestTask) {
    let (connection, _lease) = match connect(&shared, ConnectionKind::Dedicated).await {
        Ok(connected) => connected,
        Err(err) => {
            debug!(error = %err, "dedicated connect failed");
            task.fail(err);
            return;
        }
    };

    let (mut request, mut response) = task.into_parts();
    let upgrade = request.body.take_upgrade();
    let exchange = Exchange {
        method: request.method.clone(),
        request_time: SystemTime::now(),
        pipelined: false,
    };
    let (mut input, mut output) = connection.into_split(&shared.pool);

    let head = tokio::select! {
        head = send(&shared, request, &mut input, &mut output) => head,
        _ = response.closed() => {
            debug!("dedicated request cancelled");
            return;
        }
    };
    let head = match head {
        Ok(Some(head)) => head,
        Ok(None) => {
            let _ = response.send(Err(EngineError::ConnectionClosed));
            return;
        }
        Err(err) => {
            debug!(error = %err, "dedicated exchange failed");
            let _ = response.send(Err(err));
            return;
        }
    };

    if head.status == 101 {
        match upgrade {
            Some(handler) => switch_protocols(input, output, head, &exchange, response, handler).await,
            None => {
                let _ = response.send(Err(EngineError::UnsupportedBodyType(
                    "101 Switching Protocols for a request without an upgrade body".into(),
                )));
            }
        }
        return;
    }

    respond(&mut input, head, &exchange, response, std::future::pending()).await;
    if let Err(err) = output.shutdown().await {
        trace!(error = %err, "shutdown after dedicated exchange failed");
    }
}

async fn send(
    shared: &EndpointShared,
    request: HttpRequestData,
    input: &mut BoxedReader,
    output: &mut BoxedWriter,
) -> Result<Option<RawResponse>> {
    write_request(request, output, &shared.write_options()).await?;
    receive_head(input, &shared.limits).await
}

async fn switch_protocols(
    mut input: BoxedReader,
    output: BoxedWriter,
    head: RawResponse,
    exchange: &Exchange,
    response: ResponseSlot,
    handler: UpgradeHandler,
) {
    debug!("switching protocols");
    let (guard, handle) = ExchangeHandle::pair();
    let (sender, receiver) = mpsc::channel(BODY_CHANNEL_CAPACITY);
    let writing = tokio::spawn(handler(output));
    let _ = response.send(Ok(assemble(
        head,
        ResponseBody::channel(receiver),
        exchange,
        handle,
    )));

    let mut reader = BodyReader::new(BodyFraming::CloseDelimited);
    loop {
        let chunk = tokio::select! {
            chunk = reader.next_chunk(&mut input) => chunk,
            _ = sender.closed() => break,
        };
        match chunk {
            Ok(Some(chunk)) => {
                if sender.send(Ok(chunk)).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(err) => {
                let _ = sender.send(Err(err)).await;
                break;
            }
        }
    }
    drop(input);

    match writing.await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => debug!(error = %err, "upgrade handler failed"),
        Err(err) => debug!(error = %err, "upgrade handler panicked"),
    }
    drop(guard);
}
