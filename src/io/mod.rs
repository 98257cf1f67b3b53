//! Transport layer: pooled buffers, the non-blocking socket adapter, and
//! connection types.
//!
//! | Module | Contents |
//! |--------|----------|
//! | `pool` | [`BufferPool`] and [`PooledBuffer`] |
//! | `socket` | [`Selectable`], [`SocketIo`] and its read/write halves |
//! | `connection` | [`Connection`], plain or boxed stream, and its split halves |
//! | `tls` | [`SecureTransport`] and the rustls-backed [`RustlsTransport`] |

mod connection;
mod pool;
mod socket;
mod tls;

pub use connection::{AsyncStream, BoxedReader, BoxedWriter, Connection};
pub use pool::{BufferPool, PooledBuffer};
pub use socket::{Direction, Selectable, SocketIo, SocketReader, SocketWriter};
pub use tls::{RustlsTransport, SecureTransport};
