//! HTTP/1.1 codec.
//!
//! This module provides the wire-level pieces the connection layer is built
//! from:
//!
//! - **Parsing**: [`parse_response`] and [`parse_request`] read a message head
//!   from any buffered async reader.
//! - **Framing**: [`BodyFraming`] picks how a body is delimited and
//!   [`BodyReader`] decodes it.
//! - **Writing**: [`write_request`] serializes a request, choosing between
//!   identity and chunked framing, with [`ChunkedWriter`] doing the chunk encoding.
//! - **Headers**: [`Headers`] is the ordered case-insensitive multimap shared by
//!   requests and responses.

mod body;
mod chunked;
pub mod constants;
mod headers;
mod parser;
mod writer;

pub use body::{BodyFraming, BodyReader};
pub use chunked::ChunkedWriter;
pub use headers::{ConnectionOptions, Headers};
pub use parser::{parse_request, parse_response, HeadLimits, RawRequest, RawResponse};
pub use writer::{write_request, WriteOptions};
