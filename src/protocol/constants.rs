//! Wire-level constants.

/// Header names the engine reads or writes itself.
pub mod headers {
    /// `Host`
    pub const HOST: &str = "Host";
    /// `User-Agent`
    pub const USER_AGENT: &str = "User-Agent";
    /// `Content-Length`
    pub const CONTENT_LENGTH: &str = "Content-Length";
    /// `Content-Type`
    pub const CONTENT_TYPE: &str = "Content-Type";
    /// `Transfer-Encoding`
    pub const TRANSFER_ENCODING: &str = "Transfer-Encoding";
    /// `Connection`
    pub const CONNECTION: &str = "Connection";
    /// `Upgrade`
    pub const UPGRADE: &str = "Upgrade";
}

/// Default port for `http` URLs.
pub const DEFAULT_HTTP_PORT: u16 = 80;

/// Default port for `https` URLs.
pub const DEFAULT_HTTPS_PORT: u16 = 443;

/// Longest accepted chunk-size or trailer line.
pub const MAX_CHUNK_LINE: usize = 4096;

/// `Transfer-Encoding` token selecting chunked framing.
pub const CHUNKED: &str = "chunked";
