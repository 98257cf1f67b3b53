//! Ordered, case-insensitive header multimap.
//!
//! HTTP/1.1 header names are case-insensitive and a name may repeat. [`Headers`]
//! keeps every line in arrival order (duplicates included) so a header block can
//! be re-serialized exactly, and answers lookups without regard to case.
//!
//! # Examples
//!
//! ```
//! use cio_http::protocol::Headers;
//!
//! let mut headers = Headers::new();
//! headers.append("Accept", "text/html");
//! headers.append("accept", "application/json");
//!
//! assert_eq!(headers.get("ACCEPT"), Some("text/html"));
//! assert_eq!(headers.get_all("Accept").count(), 2);
//! ```

use crate::protocol::constants::headers::CONNECTION;

/// Header lines in arrival order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    /// Create an empty header map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a line, keeping any existing lines with the same name.
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// Replace every line named `name` with a single line.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.remove(&name);
        self.entries.push((name, value.into()));
    }

    /// First value for `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Every value for `name`, in arrival order.
    pub fn get_all<'a, 'b>(&'a self, name: &'b str) -> impl Iterator<Item = &'a str> + 'b
    where
        'a: 'b,
    {
        self.entries
            .iter()
            .filter(move |(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Whether at least one line is named `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.entries
            .iter()
            .any(|(key, _)| key.eq_ignore_ascii_case(name))
    }

    /// Remove every line named `name`, returning how many were removed.
    pub fn remove(&mut self, name: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|(key, _)| !key.eq_ignore_ascii_case(name));
        before - self.entries.len()
    }

    /// All lines as `(name, value)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_str()))
    }

    /// Number of lines.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether there are no lines.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Value of the most recent line, for joining folded continuation lines.
    pub(crate) fn last_value_mut(&mut self) -> Option<&mut String> {
        self.entries.last_mut().map(|(_, value)| value)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Headers {
            entries: iter
                .into_iter()
                .map(|(name, value)| (name.into(), value.into()))
                .collect(),
        }
    }
}

/// Tokens carried by `Connection` headers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionOptions {
    /// `close`: the sender will close the connection after this message.
    pub close: bool,
    /// `keep-alive`: the sender wants a persistent connection.
    pub keep_alive: bool,
    /// `upgrade`: the message negotiates a protocol switch.
    pub upgrade: bool,
}

impl ConnectionOptions {
    /// Parse one comma-separated `Connection` value. Unknown tokens are ignored.
    pub fn parse(value: &str) -> Self {
        let mut options = ConnectionOptions::default();
        options.merge(value);
        options
    }

    /// Combine the tokens of every `Connection` line in `headers`.
    pub fn from_headers(headers: &Headers) -> Self {
        let mut options = ConnectionOptions::default();
        for value in headers.get_all(CONNECTION) {
            options.merge(value);
        }
        options
    }

    fn merge(&mut self, value: &str) {
        for token in value.split(',').map(str::trim) {
            if token.eq_ignore_ascii_case("close") {
                self.close = true;
            } else if token.eq_ignore_ascii_case("keep-alive") {
                self.keep_alive = true;
            } else if token.eq_ignore_ascii_case("upgrade") {
                self.upgrade = true;
            }
        }
    }
}
