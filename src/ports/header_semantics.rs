use std::fmt;

use chrono::{DateTime, Utc};

/// Entity tag as sent in `ETag`, `If-Match` and friends.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntityTag {
    pub weak: bool,
    /// Opaque value without the surrounding quotes; `*` for the wildcard
    pub opaque: String,
}

impl EntityTag {
    pub fn strong(opaque: impl Into<String>) -> Self {
        Self {
            weak: false,
            opaque: opaque.into(),
        }
    }

    pub fn weak(opaque: impl Into<String>) -> Self {
        Self {
            weak: true,
            opaque: opaque.into(),
        }
    }

    /// The `*` member of an `If-Match` / `If-None-Match` list.
    pub fn any() -> Self {
        Self::strong("*")
    }

    pub fn is_any(&self) -> bool {
        !self.weak && self.opaque == "*"
    }
}

impl fmt::Display for EntityTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_any() {
            return f.write_str("*");
        }
        if self.weak {
            f.write_str("W/")?;
        }
        write!(f, "\"{}\"", self.opaque)
    }
}

/// Parsed `Content-Type`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentType {
    /// Lowercase `type/subtype`
    pub mime_type: String,
    pub charset: Option<String>,
    /// Remaining parameters in arrival order, names lowercased
    pub parameters: Vec<(String, String)>,
}

/// One hop of a `Forwarded` header (RFC 7239).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ForwardedElement {
    pairs: Vec<(String, String)>,
}

impl ForwardedElement {
    pub fn new(pairs: Vec<(String, String)>) -> Self {
        Self { pairs }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

/// Header parsing and content negotiation used by the classifier.
///
/// Every function is pure. Absent headers are passed as `None`; an
/// unparsable value yields `None` / an empty list rather than an error.
pub trait HeaderSemantics: Send + Sync + 'static {
    /// Pick the supported media type the `Accept` header prefers.
    fn select_media_type(&self, accept: Option<&str>, supported: &[String]) -> Option<String>;

    /// Pick the supported content coding the `Accept-Encoding` header prefers.
    fn select_encoding(
        &self,
        accept_encoding: Option<&str>,
        supported: &[String],
    ) -> Option<String>;

    /// Pick the supported language tag the `Accept-Language` header prefers.
    fn select_language(
        &self,
        accept_language: Option<&str>,
        supported: &[String],
    ) -> Option<String>;

    fn parse_etag_list(&self, value: Option<&str>) -> Vec<EntityTag>;

    fn parse_etag(&self, value: Option<&str>) -> Option<EntityTag>;

    /// Parse an IMF-fixdate such as `Sun, 06 Nov 1994 08:49:37 GMT`.
    fn parse_fix_date(&self, value: Option<&str>) -> Option<DateTime<Utc>>;

    /// Parse every hop of a `Forwarded` header, keeping only `accepted_keys`.
    fn parse_forwarded(&self, value: Option<&str>, accepted_keys: &[&str]) -> Vec<ForwardedElement>;

    fn parse_content_type(&self, value: Option<&str>) -> Option<ContentType>;
}
