//! Dialing connections.
//!
//! A [`Connector`] opens raw connections. The [`ConnectionFactory`] wraps one and
//! enforces the engine-wide connection limit: every dial first acquires a permit
//! that stays attached to the connection until it closes.

use crate::io::{BufferPool, Connection};
use crate::types::Destination;
use async_trait::async_trait;
use std::io;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Opens a connection to `host:port`.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Dial the peer.
    async fn connect(&self, host: &str, port: u16) -> io::Result<Connection>;
}

/// Plain TCP dialer.
#[derive(Debug, Clone, Default)]
pub struct TcpConnector {
    pool: BufferPool,
}

impl TcpConnector {
    /// Dialer whose sockets borrow I/O buffers from `pool`.
    pub fn new(pool: BufferPool) -> Self {
        TcpConnector { pool }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, host: &str, port: u16) -> io::Result<Connection> {
        let stream = TcpStream::connect((host, port)).await?;
        stream.set_nodelay(true)?;
        Ok(Connection::socket(stream, &self.pool))
    }
}

/// Connector plus the engine-wide connection limit.
pub struct ConnectionFactory {
    connector: Arc<dyn Connector>,
    permits: Arc<Semaphore>,
}

impl ConnectionFactory {
    /// Allow at most `max_connections` open connections through `connector`.
    pub fn new(connector: Arc<dyn Connector>, max_connections: usize) -> Self {
        ConnectionFactory {
            connector,
            permits: Arc::new(Semaphore::new(
                max_connections.clamp(1, Semaphore::MAX_PERMITS),
            )),
        }
    }

    /// Wait for a free permit, then dial `destination`.
    ///
    /// The permit is released when it is dropped, normally together with the
    /// connection it was acquired for.
    pub async fn connect(&self, destination: &Destination) -> io::Result<(Connection, OwnedSemaphorePermit)> {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "connection limit closed"))?;
        let connection = self
            .connector
            .connect(destination.bare_host(), destination.port)
            .await?;
        Ok((connection, permit))
    }

    /// Connections that can still be opened without waiting.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}

impl std::fmt::Debug for ConnectionFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionFactory")
            .field("available", &self.available())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct DuplexConnector;

    #[async_trait]
    impl Connector for DuplexConnector {
        async fn connect(&self, _host: &str, _port: u16) -> io::Result<Connection> {
            let (client, _server) = tokio::io::duplex(64);
            Ok(Connection::stream(client))
        }
    }

    #[tokio::test]
    async fn test_limit_holds_until_permit_dropped() {
        let factory = ConnectionFactory::new(Arc::new(DuplexConnector), 1);
        let destination = Destination::new("example.com", 80, false);

        let (_connection, permit) = factory.connect(&destination).await.unwrap();
        assert_eq!(factory.available(), 0);

        let blocked = tokio::time::timeout(Duration::from_millis(50), factory.connect(&destination)).await;
        assert!(blocked.is_err());

        drop(permit);
        assert_eq!(factory.available(), 1);
        assert!(factory.connect(&destination).await.is_ok());
    }

    #[tokio::test]
    async fn test_failed_dial_returns_permit() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let factory = ConnectionFactory::new(Arc::new(TcpConnector::default()), 4);
        let err = factory
            .connect(&Destination::new("127.0.0.1", port, false))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);
        assert_eq!(factory.available(), 4);
    }
}
