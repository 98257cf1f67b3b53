//! Per-destination connection manager.
//!
//! An [`Endpoint`] owns every connection to one [`Destination`]. Callers push
//! [`RequestTask`]s onto its queue; a single background coordinator pulls them
//! off one at a time and routes each one:
//!
//! - **Dedicated**: upgrades, non-idempotent requests, requests asking for
//!   `Connection: close`, and everything when pipelining is disabled. A new
//!   connection is dialed for the task alone, outside the per-route cap.
//! - **Pipelined**: the task is first offered to any pipeline already waiting
//!   for work. If none takes it and the destination is under its connection
//!   cap, a new pipeline is dialed. The task is then handed to whichever
//!   pipeline asks for work next, waiting if necessary.
//!
//! # Idle teardown
//!
//! When no task arrives within the idle timeout and no connection is open, the
//! coordinator tells its owner (which removes it from the registry), closes its
//! queue, and keeps draining: a task that slipped in concurrently is still
//! served before the coordinator exits.
//!
//! # Connection accounting
//!
//! A live-connection counter is incremented before the first connect attempt
//! by creating a [`ConnectionLease`]. The lease travels with the connection and
//! decrements the counter when dropped, so a failed dial and a closed
//! connection both restore it. Pipelined and dedicated connections are counted
//! apart: only pipelines count against `max_connections_per_route`, and only a
//! closing pipeline wakes a coordinator waiting in hand-off.

use crate::client::config::EngineConfig;
use crate::client::connect::ConnectionFactory;
use crate::client::dedicated::run_dedicated;
use crate::client::pipeline::{ConnectionPipeline, Slot};
use crate::client::task::RequestTask;
use crate::error::{EngineError, Result};
use crate::io::{BufferPool, Connection, SecureTransport};
use crate::protocol::{HeadLimits, WriteOptions};
use crate::types::Destination;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify, OwnedSemaphorePermit};
use tokio::time::timeout;
use tracing::{debug, trace, Instrument};

/// State shared by an endpoint's coordinator and all of its connections.
pub(crate) struct EndpointShared {
    pub id: u64,
    pub destination: Destination,
    pub config: Arc<EngineConfig>,
    pub factory: Arc<ConnectionFactory>,
    pub tls: Option<Arc<dyn SecureTransport>>,
    pub pool: BufferPool,
    pub limits: HeadLimits,
    pipelined: AtomicUsize,
    dedicated: AtomicUsize,
    connection_closed: Notify,
    next_connection_id: AtomicU64,
}

impl EndpointShared {
    pub(crate) fn new(
        id: u64,
        destination: Destination,
        config: Arc<EngineConfig>,
        factory: Arc<ConnectionFactory>,
        tls: Option<Arc<dyn SecureTransport>>,
        pool: BufferPool,
    ) -> Self {
        let limits = HeadLimits::new(config.max_header_size);
        EndpointShared {
            id,
            destination,
            config,
            factory,
            tls,
            pool,
            limits,
            pipelined: AtomicUsize::new(0),
            dedicated: AtomicUsize::new(0),
            connection_closed: Notify::new(),
            next_connection_id: AtomicU64::new(1),
        }
    }

    /// Live connections of both kinds, dialing ones included.
    pub(crate) fn connections(&self) -> usize {
        self.pipelined.load(Ordering::Acquire) + self.dedicated.load(Ordering::Acquire)
    }

    /// Live pipelined connections, the ones the per-route cap applies to.
    pub(crate) fn pipelined_connections(&self) -> usize {
        self.pipelined.load(Ordering::Acquire)
    }

    fn counter(&self, kind: ConnectionKind) -> &AtomicUsize {
        match kind {
            ConnectionKind::Pipelined => &self.pipelined,
            ConnectionKind::Dedicated => &self.dedicated,
        }
    }

    pub(crate) fn write_options(&self) -> WriteOptions<'_> {
        WriteOptions {
            user_agent: Some(&self.config.user_agent),
            pool: &self.pool,
        }
    }

    pub(crate) fn next_connection_id(&self) -> u64 {
        self.next_connection_id.fetch_add(1, Ordering::Relaxed)
    }
}

/// What a connection is dialed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectionKind {
    /// Shared by pipelined requests; bounded by the per-route cap.
    Pipelined,
    /// Carries a single exchange or an upgraded protocol.
    Dedicated,
}

/// One unit of a live-connection counter, plus the engine-wide permit once
/// the dial succeeded. Dropping it gives both back.
pub(crate) struct ConnectionLease {
    endpoint: Arc<EndpointShared>,
    kind: ConnectionKind,
    permit: Option<OwnedSemaphorePermit>,
}

impl ConnectionLease {
    fn new(endpoint: Arc<EndpointShared>, kind: ConnectionKind) -> Self {
        endpoint.counter(kind).fetch_add(1, Ordering::AcqRel);
        ConnectionLease {
            endpoint,
            kind,
            permit: None,
        }
    }
}

impl Drop for ConnectionLease {
    fn drop(&mut self) {
        self.permit.take();
        self.endpoint.counter(self.kind).fetch_sub(1, Ordering::AcqRel);
        if self.kind == ConnectionKind::Pipelined {
            // Only a coordinator already waiting hears this; nothing is stored.
            self.endpoint.connection_closed.notify_waiters();
        }
    }
}

/// Dial the endpoint's destination with retries, upgrading to TLS when the
/// destination is secure.
///
/// Each attempt is bounded by the connect timeout. A timed-out attempt is
/// abandoned and the next one started; a refused or failed dial ends the loop
/// at once.
pub(crate) async fn connect(
    endpoint: &Arc<EndpointShared>,
    kind: ConnectionKind,
) -> Result<(Connection, ConnectionLease)> {
    let mut lease = ConnectionLease::new(Arc::clone(endpoint), kind);
    let settings = &endpoint.config.endpoint;
    let attempts = settings.connect_retry_attempts.max(1);
    let destination = &endpoint.destination;

    for attempt in 1..=attempts {
        match timeout(settings.connect_timeout(), endpoint.factory.connect(destination)).await {
            Ok(Ok((connection, permit))) => {
                lease.permit = Some(permit);
                if !destination.secure {
                    return Ok((connection, lease));
                }
                let tls = endpoint.tls.as_ref().ok_or_else(|| {
                    EngineError::Handshake("no secure transport available".into())
                })?;
                let connection = tls.upgrade(connection, destination.bare_host()).await?;
                return Ok((connection, lease));
            }
            Ok(Err(err)) => {
                debug!(%destination, error = %err, "connect failed");
                return Err(EngineError::Connect(err));
            }
            Err(_) => {
                debug!(%destination, attempt, attempts, "connect attempt timed out");
            }
        }
    }
    Err(EngineError::ConnectTimeout { attempts })
}

/// Handle to a running endpoint.
pub(crate) struct Endpoint {
    shared: Arc<EndpointShared>,
    tasks: mpsc::UnboundedSender<RequestTask>,
}

impl Endpoint {
    /// Start the coordinator. `on_done` runs once when the endpoint goes idle.
    pub(crate) fn spawn<F>(shared: EndpointShared, on_done: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let shared = Arc::new(shared);
        let (tasks, receiver) = mpsc::unbounded_channel();
        let (slots, slot_receiver) = mpsc::unbounded_channel();
        let coordinator = Coordinator {
            shared: Arc::clone(&shared),
            tasks: receiver,
            requeue: tasks.downgrade(),
            slots,
            slot_receiver,
        };
        let span = tracing::debug_span!(
            "endpoint",
            host = %shared.destination.host,
            port = shared.destination.port,
            id = shared.id
        );
        tokio::spawn(coordinator.run(on_done).instrument(span));
        Endpoint { shared, tasks }
    }

    /// Queue a task. Hands it back when the endpoint has already shut down.
    pub(crate) fn submit(&self, task: RequestTask) -> std::result::Result<(), RequestTask> {
        self.tasks.send(task).map_err(|rejected| rejected.0)
    }

    /// Live connections to this destination.
    pub(crate) fn connections(&self) -> usize {
        self.shared.connections()
    }

    pub(crate) fn id(&self) -> u64 {
        self.shared.id
    }
}

struct Coordinator {
    shared: Arc<EndpointShared>,
    tasks: mpsc::UnboundedReceiver<RequestTask>,
    requeue: mpsc::WeakUnboundedSender<RequestTask>,
    slots: mpsc::UnboundedSender<Slot>,
    slot_receiver: mpsc::UnboundedReceiver<Slot>,
}

impl Coordinator {
    async fn run<F: FnOnce()>(mut self, on_done: F) {
        let idle = self.shared.config.endpoint.idle_timeout();
        let mut on_done = Some(on_done);
        loop {
            let task = match timeout(idle, self.tasks.recv()).await {
                Ok(Some(task)) => task,
                Ok(None) => break,
                Err(_) => {
                    if self.shared.connections() > 0 {
                        continue;
                    }
                    if let Some(on_done) = on_done.take() {
                        debug!("endpoint idle, shutting down");
                        on_done();
                        self.tasks.close();
                    }
                    continue;
                }
            };
            self.dispatch(task).await;
        }
        trace!("endpoint coordinator stopped");
    }

    async fn dispatch(&mut self, task: RequestTask) {
        if task.is_cancelled() {
            trace!("skipping cancelled request");
            return;
        }

        if !self.shared.config.pipelining || task.requires_dedicated_connection() {
            let span = tracing::debug_span!(
                "dedicated",
                host = %self.shared.destination.host,
                port = self.shared.destination.port
            );
            tokio::spawn(run_dedicated(Arc::clone(&self.shared), task).instrument(span));
            return;
        }

        let Some(task) = self.offer(task) else {
            return;
        };
        if self.under_cap() {
            if let Err(err) = self.create_pipeline().await {
                task.fail(err);
                return;
            }
        }
        self.hand_off(task).await;
    }

    fn under_cap(&self) -> bool {
        self.shared.pipelined_connections() < self.shared.config.endpoint.max_connections_per_route.max(1)
    }

    /// Give the task to a pipeline that is already waiting, without suspending.
    fn offer(&mut self, mut task: RequestTask) -> Option<RequestTask> {
        while let Ok(slot) = self.slot_receiver.try_recv() {
            match slot.send(task) {
                Ok(()) => return None,
                Err(returned) => task = returned,
            }
        }
        Some(task)
    }

    /// Wait until some pipeline takes the task. A pipeline closing while we
    /// wait may leave room under the cap for a fresh one.
    async fn hand_off(&mut self, mut task: RequestTask) {
        let shared = Arc::clone(&self.shared);
        loop {
            let closed = shared.connection_closed.notified();
            tokio::pin!(closed);
            closed.as_mut().enable();
            tokio::select! {
                slot = self.slot_receiver.recv() => {
                    let Some(slot) = slot else {
                        task.fail(EngineError::ConnectionClosed);
                        return;
                    };
                    match slot.send(task) {
                        Ok(()) => return,
                        Err(returned) => task = returned,
                    }
                }
                _ = &mut closed => {
                    task = match self.offer(task) {
                        Some(task) => task,
                        None => return,
                    };
                    if self.under_cap() {
                        if let Err(err) = self.create_pipeline().await {
                            task.fail(err);
                            return;
                        }
                    }
                }
                _ = task.cancelled() => {
                    trace!("request cancelled while waiting for a connection");
                    return;
                }
            }
        }
    }

    async fn create_pipeline(&mut self) -> Result<()> {
        let (connection, lease) = connect(&self.shared, ConnectionKind::Pipelined).await?;
        ConnectionPipeline::spawn(
            Arc::clone(&self.shared),
            lease,
            connection,
            self.slots.clone(),
            self.requeue.clone(),
        );
        Ok(())
    }
}
