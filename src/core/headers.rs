//! Raw header view used by classification.
//!
//! Unlike `http::HeaderMap`, a [`HeaderSet`] also carries the HTTP/2
//! pseudo-headers and keeps every repetition of a name in arrival order, so
//! the classifier can reject multi-valued headers instead of merging them.
use std::fmt;

use http::request::Parts;

pub const PSEUDO_METHOD: &str = ":method";
pub const PSEUDO_PATH: &str = ":path";
pub const PSEUDO_SCHEME: &str = ":scheme";
pub const PSEUDO_AUTHORITY: &str = ":authority";

pub const HEADER_FORWARDED: &str = "forwarded";
pub const HEADER_ORIGIN: &str = "origin";
pub const HEADER_REQUEST_ID: &str = "X-Request-Id";

/// The header was sent more than once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepeatedHeader(pub String);

impl fmt::Display for RepeatedHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "header '{}' is repeated", self.0)
    }
}

impl std::error::Error for RepeatedHeader {}

/// Ordered multimap of lowercase header names to values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderSet {
    entries: Vec<(String, String)>,
}

impl HeaderSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a decoded request head, restoring the pseudo-headers.
    /// Values that are not valid UTF-8 are decoded lossily.
    pub fn from_parts(parts: &Parts) -> Self {
        let mut set = Self::new();
        set.append(PSEUDO_METHOD, parts.method.as_str());
        if let Some(scheme) = parts.uri.scheme_str() {
            set.append(PSEUDO_SCHEME, scheme);
        }
        if let Some(authority) = parts.uri.authority() {
            set.append(PSEUDO_AUTHORITY, authority.as_str());
        }
        if let Some(path) = parts.uri.path_and_query() {
            set.append(PSEUDO_PATH, path.as_str());
        }
        for (name, value) in &parts.headers {
            set.append(name.as_str(), &String::from_utf8_lossy(value.as_bytes()));
        }
        set
    }

    pub fn append(&mut self, name: &str, value: &str) {
        self.entries
            .push((name.to_ascii_lowercase(), value.to_string()));
    }

    /// Builder-style [`append`](Self::append).
    pub fn with(mut self, name: &str, value: &str) -> Self {
        self.append(name, value);
        self
    }

    pub fn values<'a>(&'a self, name: &str) -> impl Iterator<Item = &'a str> + use<'a> {
        let name = name.to_ascii_lowercase();
        self.entries
            .iter()
            .filter(move |(n, _)| *n == name)
            .map(|(_, v)| v.as_str())
    }

    /// The value of a header that may appear at most once.
    pub fn single(&self, name: &str) -> Result<Option<&str>, RepeatedHeader> {
        let mut values = self.values(name);
        let first = values.next();
        if values.next().is_some() {
            return Err(RepeatedHeader(name.to_ascii_lowercase()));
        }
        Ok(first)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
