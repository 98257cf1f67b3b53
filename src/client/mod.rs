//! Client engine: endpoints, pipelines and the facade callers hold.
//!
//! Requests travel through these layers:
//!
//! ```text
//! CioEngine::execute
//!   └── Endpoint (one per destination)
//!         ├── dedicated connection   (one exchange, then close)
//!         └── ConnectionPipeline     (shared, pipelined, FIFO)
//!               └── io::Connection + protocol codec
//! ```
//!
//! # Module Organization
//!
//! ```text
//! client/
//! ├── config    - EngineConfig, EndpointConfig, TlsConfig
//! ├── connect   - Connector trait, TCP connector, global connection limit
//! ├── task      - RequestTask: request plus result slot
//! ├── exchange  - reading one response and pumping its body
//! ├── pipeline  - pipelined connection writer and reader loops
//! ├── dedicated - single-exchange and upgrade connections
//! ├── endpoint  - per-destination dispatch, connect retries, idle teardown
//! ├── engine    - HttpClientEngine trait and CioEngine
//! └── mock      - MockEngine for tests
//! ```
//!
//! # Key Types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`CioEngine`] | The engine |
//! | [`HttpClientEngine`] | Request/response contract shared with [`MockEngine`] |
//! | [`EngineConfig`] | Engine options |
//! | [`Connector`] | Pluggable dialer |
//! | [`RequestTask`] | Unit of work queued on an endpoint |
//!
//! # Examples
//!
//! ```
//! use cio_http::client::{CioEngine, EngineConfig, EndpointConfig};
//!
//! let config = EngineConfig {
//!     pipelining: true,
//!     endpoint: EndpointConfig {
//!         max_connections_per_route: 4,
//!         pipeline_max_size: 8,
//!         ..Default::default()
//!     },
//!     ..Default::default()
//! };
//! let engine = CioEngine::with_config(config);
//! assert_eq!(engine.endpoint_count(), 0);
//! ```

mod config;
mod connect;
mod dedicated;
mod endpoint;
mod engine;
mod exchange;
mod mock;
mod pipeline;
mod task;

pub use config::{EndpointConfig, EngineConfig, TlsConfig};
pub use connect::{ConnectionFactory, Connector, TcpConnector};
pub use engine::{CioEngine, HttpClientEngine};
pub use mock::MockEngine;
pub use task::RequestTask;
