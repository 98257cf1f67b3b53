//! Pipelined connection.
//!
//! A [`ConnectionPipeline`] owns one connection and drives it with two loops
//! joined in a single task:
//!
//! - the **writer** asks the endpoint for the next task, serializes its request
//!   and records it as in flight;
//! - the **reader** takes in-flight requests in the order they were written and
//!   delivers each response to its caller.
//!
//! Each written request holds one of `pipeline_max_size` permits until its
//! response has been read completely, so the writer stops asking for work
//! while that many responses are outstanding.
//!
//! # Shutdown
//!
//! | Cause | Effect |
//! |-------|--------|
//! | Keep-alive expired with nothing in flight | Writer stops, reader finishes |
//! | `max_requests_per_connection` reached | Writer stops, reader finishes |
//! | Response not reusable (`Connection: close`, read error) | Both stop; queued requests fail with `ConnectionClosed` |
//! | Request cancelled mid-write, write error | Aborted: in-flight responses fail with `ConnectionClosed` |
//!
//! A task handed to the pipeline while it is shutting down, but before any
//! byte of it was written, goes back to the endpoint queue.

use crate::client::endpoint::{ConnectionLease, EndpointShared};
use crate::client::exchange::{deliver, Exchange};
use crate::client::task::{RequestTask, ResponseSlot};
use crate::error::EngineError;
use crate::io::{BoxedReader, BoxedWriter, Connection};
use crate::protocol::write_request;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot, Notify, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, trace, Instrument};

/// Where a pipeline waits for its next task.
pub(crate) type Slot = oneshot::Sender<RequestTask>;

/// A one-way flag tasks can wait on.
#[derive(Default)]
struct Signal {
    set: AtomicBool,
    notify: Notify,
}

impl Signal {
    fn trigger(&self) {
        self.set.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    fn is_set(&self) -> bool {
        self.set.load(Ordering::Acquire)
    }

    async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_set() {
                return;
            }
            notified.await;
        }
    }
}

struct InFlight {
    exchange: Exchange,
    response: ResponseSlot,
    _depth: OwnedSemaphorePermit,
}

/// One pipelined connection and its two loops.
pub(crate) struct ConnectionPipeline {
    shared: Arc<EndpointShared>,
    slots: mpsc::UnboundedSender<Slot>,
    requeue: mpsc::WeakUnboundedSender<RequestTask>,
    closing: Signal,
    aborted: Signal,
    depth: Arc<Semaphore>,
    in_flight: AtomicUsize,
}

impl ConnectionPipeline {
    /// Start driving `connection` in the background.
    pub(crate) fn spawn(
        shared: Arc<EndpointShared>,
        lease: ConnectionLease,
        connection: Connection,
        slots: mpsc::UnboundedSender<Slot>,
        requeue: mpsc::WeakUnboundedSender<RequestTask>,
    ) {
        let span = tracing::debug_span!("pipeline", connection = shared.next_connection_id());
        let depth = shared.config.endpoint.pipeline_max_size.max(1);
        let pipeline = ConnectionPipeline {
            shared,
            slots,
            requeue,
            closing: Signal::default(),
            aborted: Signal::default(),
            depth: Arc::new(Semaphore::new(depth)),
            in_flight: AtomicUsize::new(0),
        };
        tokio::spawn(pipeline.run(lease, connection).instrument(span));
    }

    async fn run(self, lease: ConnectionLease, connection: Connection) {
        debug!("pipeline started");
        let (mut input, mut output) = connection.into_split(&self.shared.pool);
        let (queue, pending) = mpsc::unbounded_channel();

        tokio::join!(
            self.write_loop(&mut output, queue),
            self.read_loop(&mut input, pending)
        );

        if !self.aborted.is_set() {
            if let Err(err) = output.shutdown().await {
                trace!(error = %err, "shutdown after pipeline end failed");
            }
        }
        drop(input);
        drop(output);
        drop(lease);
        debug!("pipeline closed");
    }

    fn abort(&self) {
        self.aborted.trigger();
        self.closing.trigger();
    }

    async fn write_loop(&self, output: &mut BoxedWriter, queue: mpsc::UnboundedSender<InFlight>) {
        let limit = self.shared.config.endpoint.max_requests_per_connection;
        let mut written = 0usize;
        loop {
            if limit.is_some_and(|limit| written >= limit) {
                debug!(written, "request limit reached");
                break;
            }
            let depth = tokio::select! {
                permit = Arc::clone(&self.depth).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = self.closing.wait() => break,
            };
            let Some(task) = self.next_task().await else {
                break;
            };
            if task.is_cancelled() {
                trace!("skipping cancelled request");
                continue;
            }

            let (request, mut response) = task.into_parts();
            let exchange = Exchange {
                method: request.method.clone(),
                request_time: SystemTime::now(),
                pipelined: true,
            };
            let options = self.shared.write_options();
            let result = tokio::select! {
                result = write_request(request, output, &options) => result,
                _ = response.closed() => {
                    debug!("request cancelled while being written");
                    self.abort();
                    break;
                }
                _ = self.aborted.wait() => Err(EngineError::ConnectionClosed),
            };
            if let Err(err) = result {
                debug!(error = %err, "failed to write request");
                let _ = response.send(Err(err));
                self.abort();
                break;
            }

            written += 1;
            self.in_flight.fetch_add(1, Ordering::AcqRel);
            let job = InFlight {
                exchange,
                response,
                _depth: depth,
            };
            if let Err(rejected) = queue.send(job) {
                self.in_flight.fetch_sub(1, Ordering::AcqRel);
                let _ = rejected.0.response.send(Err(EngineError::ConnectionClosed));
                break;
            }
        }
    }

    /// Wait for the endpoint to hand over a task. Returns `None` when the
    /// pipeline should stop taking work.
    async fn next_task(&self) -> Option<RequestTask> {
        let (slot, mut receiver) = oneshot::channel();
        if self.slots.send(slot).is_err() {
            return None;
        }
        let keep_alive = self.shared.config.endpoint.keep_alive_time();
        loop {
            tokio::select! {
                task = &mut receiver => return task.ok(),
                _ = tokio::time::sleep(keep_alive) => {
                    if self.in_flight.load(Ordering::Acquire) == 0 {
                        debug!("keep-alive expired");
                        break;
                    }
                }
                _ = self.closing.wait() => break,
            }
        }
        receiver.close();
        if let Ok(task) = receiver.try_recv() {
            self.requeue(task);
        }
        None
    }

    fn requeue(&self, task: RequestTask) {
        trace!("returning unwritten request to the endpoint");
        match self.requeue.upgrade() {
            Some(tasks) => {
                if let Err(rejected) = tasks.send(task) {
                    rejected.0.fail(EngineError::ConnectionClosed);
                }
            }
            None => task.fail(EngineError::ConnectionClosed),
        }
    }

    async fn read_loop(&self, input: &mut BoxedReader, mut pending: mpsc::UnboundedReceiver<InFlight>) {
        loop {
            let InFlight {
                exchange,
                response,
                _depth: depth,
            } = tokio::select! {
                biased;
                _ = self.aborted.wait() => break,
                job = pending.recv() => match job {
                    Some(job) => job,
                    None => break,
                },
            };
            let reusable = deliver(input, exchange, response, &self.shared.limits, self.aborted.wait()).await;
            self.in_flight.fetch_sub(1, Ordering::AcqRel);
            drop(depth);
            if !reusable {
                debug!("connection not reusable");
                self.closing.trigger();
                break;
            }
        }

        pending.close();
        while let Some(job) = pending.recv().await {
            let _ = job.response.send(Err(EngineError::ConnectionClosed));
        }
    }
}
