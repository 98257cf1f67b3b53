//! The engine facade.
//!
//! [`CioEngine`] is what callers hold. It keeps one [`Endpoint`] per
//! destination, created on first use and removed again once the endpoint has
//! been idle for `idle_timeout_ms` with no open connections.
//!
//! # Examples
//!
//! ```ignore
//! use cio_http::{CioEngine, EngineConfig, HttpClientEngine, HttpRequestData};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let engine = CioEngine::with_config(EngineConfig {
//!         pipelining: true,
//!         ..Default::default()
//!     });
//!
//!     let response = engine.execute(HttpRequestData::get("http://example.com/")?).await?;
//!     println!("{} {}", response.status, response.text().await?);
//!
//!     engine.close();
//!     Ok(())
//! }
//! ```

use crate::client::config::EngineConfig;
use crate::client::connect::{ConnectionFactory, Connector, TcpConnector};
use crate::client::endpoint::{Endpoint, EndpointShared};
use crate::client::task::RequestTask;
use crate::error::{EngineError, Result};
use crate::io::{BufferPool, RustlsTransport, SecureTransport};
use crate::types::{Destination, HttpRequestData, HttpResponse};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

/// Executes HTTP requests.
#[async_trait]
pub trait HttpClientEngine: Send + Sync {
    /// Send `request` and resolve with its response head. The body streams
    /// afterwards.
    async fn execute(&self, request: HttpRequestData) -> Result<HttpResponse>;

    /// Stop accepting requests. Requests already running complete.
    fn close(&self);
}

/// Non-blocking HTTP/1.1 engine.
#[derive(Clone)]
pub struct CioEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    config: Arc<EngineConfig>,
    endpoints: Mutex<HashMap<Destination, Endpoint>>,
    factory: Arc<ConnectionFactory>,
    tls: Option<Arc<dyn SecureTransport>>,
    pool: BufferPool,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl CioEngine {
    /// Engine with the default configuration.
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    /// Engine dialing plain TCP.
    pub fn with_config(config: EngineConfig) -> Self {
        let pool = BufferPool::new(config.buffer_size, config.buffer_pool_capacity);
        let connector = Arc::new(TcpConnector::new(pool.clone()));
        Self::build(config, connector, pool)
    }

    /// Engine dialing through `connector`.
    pub fn with_connector(config: EngineConfig, connector: Arc<dyn Connector>) -> Self {
        let pool = BufferPool::new(config.buffer_size, config.buffer_pool_capacity);
        Self::build(config, connector, pool)
    }

    fn build(config: EngineConfig, connector: Arc<dyn Connector>, pool: BufferPool) -> Self {
        let tls: Option<Arc<dyn SecureTransport>> = match RustlsTransport::new(&config.tls) {
            Ok(transport) => Some(Arc::new(transport)),
            Err(err) => {
                warn!(error = %err, "secure transport unavailable, https requests will fail");
                None
            }
        };
        let factory = Arc::new(ConnectionFactory::new(connector, config.max_connections_count));
        CioEngine {
            inner: Arc::new(EngineInner {
                config: Arc::new(config),
                endpoints: Mutex::new(HashMap::new()),
                factory,
                tls,
                pool,
                next_id: AtomicU64::new(1),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// The engine's configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// `GET` `url`.
    pub async fn get(&self, url: &str) -> Result<HttpResponse> {
        self.execute(HttpRequestData::get(url)?).await
    }

    /// Destinations with a live endpoint.
    pub fn endpoint_count(&self) -> usize {
        self.inner.endpoints.lock().len()
    }

    /// Open connections to `destination`, dialing ones included.
    pub fn connection_count(&self, destination: &Destination) -> usize {
        self.inner
            .endpoints
            .lock()
            .get(destination)
            .map_or(0, Endpoint::connections)
    }

    fn submit(&self, destination: Destination, mut task: RequestTask) -> Result<()> {
        let inner = &self.inner;
        let mut endpoints = inner.endpoints.lock();
        loop {
            if inner.closed.load(Ordering::Acquire) {
                return Err(EngineError::EngineClosed);
            }
            let endpoint = endpoints
                .entry(destination.clone())
                .or_insert_with(|| inner.spawn_endpoint(destination.clone()));
            match endpoint.submit(task) {
                Ok(()) => return Ok(()),
                Err(rejected) => {
                    debug!(%destination, "endpoint shut down, replacing it");
                    endpoints.remove(&destination);
                    task = rejected;
                }
            }
        }
    }
}

impl EngineInner {
    fn spawn_endpoint(self: &Arc<Self>, destination: Destination) -> Endpoint {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        debug!(%destination, id, "starting endpoint");
        let shared = EndpointShared::new(
            id,
            destination.clone(),
            Arc::clone(&self.config),
            Arc::clone(&self.factory),
            self.tls.clone(),
            self.pool.clone(),
        );
        let engine: Weak<EngineInner> = Arc::downgrade(self);
        Endpoint::spawn(shared, move || {
            if let Some(engine) = engine.upgrade() {
                let mut endpoints = engine.endpoints.lock();
                if endpoints.get(&destination).is_some_and(|endpoint| endpoint.id() == id) {
                    endpoints.remove(&destination);
                }
            }
        })
    }
}

impl Default for CioEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CioEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CioEngine")
            .field("endpoints", &self.endpoint_count())
            .field("closed", &self.inner.closed.load(Ordering::Acquire))
            .finish()
    }
}

#[async_trait]
impl HttpClientEngine for CioEngine {
    async fn execute(&self, request: HttpRequestData) -> Result<HttpResponse> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(EngineError::EngineClosed);
        }
        let destination = Destination::from_url(&request.url)?;
        let (task, response) = RequestTask::new(request);
        self.submit(destination, task)?;
        response.await.unwrap_or(Err(EngineError::ConnectionClosed))
    }

    fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("engine closed");
        self.inner.endpoints.lock().clear();
    }
}
