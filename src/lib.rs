#![doc = include_str!("../README.md")]
#![warn(missing_docs)]

//! # cio_http: a non-blocking HTTP/1.1 client engine
//!
//! The engine keeps one endpoint per `(host, port, secure)` destination. Each
//! endpoint either gives a request a connection of its own or pipelines it on
//! a shared connection, where responses are matched to requests strictly in
//! the order the requests were written.
//!
//! ## Layers
//!
//! | Layer | Module | Role |
//! |-------|--------|------|
//! | Socket I/O adapter | [`io`] | Readiness-driven reads and writes over pooled buffers |
//! | Codec | [`protocol`] | Request serialization, response parsing, body framing |
//! | Connection pipeline | [`client`] | FIFO writer and reader loops on one connection |
//! | Endpoint | [`client`] | Per-destination dispatch, connect retries, idle teardown |
//!
//! ## Usage
//!
//! ```ignore
//! use cio_http::{CioEngine, EngineConfig, HttpClientEngine, HttpRequestData, OutgoingBody};
//! use http::Method;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let engine = CioEngine::with_config(EngineConfig {
//!         pipelining: true,
//!         ..Default::default()
//!     });
//!
//!     let request = HttpRequestData::new(Method::PUT, "http://localhost:8080/items/1".parse()?)
//!         .with_header("Accept", "application/json")
//!         .with_body(OutgoingBody::bytes("{\"name\":\"one\"}").with_content_type("application/json"));
//!
//!     let response = engine.execute(request).await?;
//!     println!("{} {}", response.status, response.text().await?);
//!     Ok(())
//! }
//! ```
//!
//! ## Module Structure
//!
//! - **[types]** - Requests, responses, bodies and destinations
//! - **[error]** - Error types and result handling
//! - **[client]** - Engine, endpoints and pipelines
//! - **[io]** - Socket adapter, buffer pool, TLS
//! - **[protocol]** - HTTP/1.1 codec

pub mod client;
pub mod error;
pub mod io;
pub mod protocol;
pub mod types;

pub use client::{CioEngine, EndpointConfig, EngineConfig, HttpClientEngine, MockEngine, TlsConfig};
pub use error::{EngineError, Result};
pub use protocol::Headers;
pub use types::{
    Destination, ExchangeHandle, HttpRequestData, HttpResponse, OutgoingBody, ProtocolVersion,
    ResponseBody,
};

#[cfg(test)]
mod tests;
