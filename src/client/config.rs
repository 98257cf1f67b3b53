//! Engine configuration.
//!
//! All options have defaults, and every struct deserializes with missing fields
//! filled in from [`Default`]. Durations are carried as millisecond integers with
//! [`Duration`] accessors.
//!
//! | Option | Default | Meaning |
//! |--------|---------|---------|
//! | `max_connections_count` | 1000 | Open connections across all destinations |
//! | `pipelining` | `false` | Share connections between requests |
//! | `endpoint.max_connections_per_route` | 100 | Pipelines per destination |
//! | `endpoint.pipeline_max_size` | 20 | Requests written but not yet answered, per connection |
//! | `endpoint.max_requests_per_connection` | unlimited | Requests written on one connection before it is retired |
//! | `endpoint.keep_alive_time_ms` | 5000 | Idle time before a pipelined connection closes |
//! | `endpoint.connect_timeout_ms` | 5000 | Bound on each connect attempt |
//! | `endpoint.connect_retry_attempts` | 5 | Connect attempts before `ConnectTimeout` |
//! | `endpoint.idle_timeout_ms` | 10000 | Idle time before an endpoint is torn down |

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Top-level engine settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum number of open connections across all destinations.
    pub max_connections_count: usize,
    /// Whether requests may share pipelined connections.
    pub pipelining: bool,
    /// Per-destination settings.
    pub endpoint: EndpointConfig,
    /// Secure transport trust settings.
    pub tls: TlsConfig,
    /// `User-Agent` sent when a request has none.
    pub user_agent: String,
    /// Size of each pooled I/O buffer.
    pub buffer_size: usize,
    /// Idle buffers the pool keeps for reuse.
    pub buffer_pool_capacity: usize,
    /// Longest accepted response header line or block.
    pub max_header_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            max_connections_count: 1000,
            pipelining: false,
            endpoint: EndpointConfig::default(),
            tls: TlsConfig::default(),
            user_agent: concat!("cio-http/", env!("CARGO_PKG_VERSION")).to_string(),
            buffer_size: 4096,
            buffer_pool_capacity: 128,
            max_header_size: 16 * 1024,
        }
    }
}

/// Settings applied to every destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    /// Maximum live connections per destination.
    pub max_connections_per_route: usize,
    /// Requests that may await their responses on one connection.
    pub pipeline_max_size: usize,
    /// Requests written on one connection before it stops accepting more.
    pub max_requests_per_connection: Option<usize>,
    /// Idle keep-alive time of a pipelined connection in milliseconds.
    pub keep_alive_time_ms: u64,
    /// Timeout of each connect attempt in milliseconds.
    pub connect_timeout_ms: u64,
    /// Number of connect attempts.
    pub connect_retry_attempts: u32,
    /// Time without requests before the endpoint shuts down, in milliseconds.
    pub idle_timeout_ms: u64,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        EndpointConfig {
            max_connections_per_route: 100,
            pipeline_max_size: 20,
            max_requests_per_connection: None,
            keep_alive_time_ms: 5000,
            connect_timeout_ms: 5000,
            connect_retry_attempts: 5,
            idle_timeout_ms: 10_000,
        }
    }
}

impl EndpointConfig {
    /// Keep-alive time as a [`Duration`].
    pub fn keep_alive_time(&self) -> Duration {
        Duration::from_millis(self.keep_alive_time_ms)
    }

    /// Connect timeout as a [`Duration`].
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Endpoint idle timeout as a [`Duration`].
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}

/// Trust settings for secure destinations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// Name to verify the server certificate against instead of the URL host.
    pub server_name: Option<String>,
    /// Trust the bundled Mozilla root certificates.
    pub use_webpki_roots: bool,
    /// Additional DER-encoded trust anchors.
    pub extra_root_certificates: Vec<Vec<u8>>,
}

impl Default for TlsConfig {
    fn default() -> Self {
        TlsConfig {
            server_name: None,
            use_webpki_roots: true,
            extra_root_certificates: Vec::new(),
        }
    }
}
