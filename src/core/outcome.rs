//! The closed set of terminal states a stream can reach.
//!
//! Every stream is described by exactly one [`Outcome`]: a shared
//! [`Envelope`] plus one [`Route`] variant. The classifier produces either a
//! [`Route::Request`] or an early terminal route, the route dispatcher turns a
//! request into a terminal route, and the epilogue renders whatever it gets.
//!
//! Every consumer matches [`Route`] exhaustively, so adding a variant is a
//! compile error everywhere it must be handled. [`Route::Unrecognized`]
//! remains as the runtime net for tags that arrive from outside this build.
use std::{
    fmt,
    sync::Arc,
    time::{Duration, Instant},
};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use http::Method;
use url::Url;

use crate::{
    config::ServerConfig,
    core::{
        event_stream::SsePort,
        headers::HeaderSet,
        stream::{RemoteClient, StreamHandle, StreamId},
    },
    ports::{body_reader::PendingBody, header_semantics::EntityTag},
    utils::graceful_shutdown::ShutdownToken,
};

pub const MIME_TYPE_JSON: &str = "application/json";
pub const MIME_TYPE_XML: &str = "application/xml";
pub const MIME_TYPE_TEXT: &str = "text/plain";
pub const MIME_TYPE_EVENT_STREAM: &str = "text/event-stream";
pub const MIME_TYPE_MESSAGE_HTTP: &str = "message/http";

// Tags whose variants cannot be rebuilt without their fields.
const PAYLOAD_KINDS: [&str; 27] = [
    "request",
    "preflight",
    "trace",
    "created",
    "not-modified",
    "no-content",
    "moved-permanently",
    "see-other",
    "temporary-redirect",
    "permanent-redirect",
    "not-found",
    "conflict",
    "not-allowed",
    "not-acceptable",
    "unsupported-media",
    "unprocessable",
    "precondition-failed",
    "not-satisfiable",
    "unauthorized",
    "too-many-requests",
    "unavailable",
    "not-implemented",
    "error",
    "json",
    "bytes",
    "partial-bytes",
    "sse",
];

/// Negotiated response media type, content coding and language.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Accept {
    pub media_type: Option<String>,
    pub encoding: Option<String>,
    pub language: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TimingSample {
    pub name: String,
    pub duration: Duration,
}

/// Cross-cutting response concerns carried by every outcome.
#[derive(Debug, Clone, Default)]
pub struct Metadata {
    /// Request origin, present only when it passed the allow-list
    pub origin: Option<String>,
    pub timings: Vec<TimingSample>,
    /// Extra response headers, written in order after all others
    pub custom_headers: Vec<(String, String)>,
    /// Configured server name, else the negotiated SNI
    pub server_name: Option<String>,
}

impl Metadata {
    pub fn record_timing(&mut self, name: &str, started: Instant) {
        self.timings.push(TimingSample {
            name: name.to_string(),
            duration: started.elapsed(),
        });
    }

    pub fn push_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.custom_headers.push((name.into(), value.into()));
    }
}

/// Fields shared by every outcome of one stream.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub stream_id: StreamId,
    pub stream: StreamHandle,
    pub meta: Metadata,
    pub shutdown: ShutdownToken,
    pub config: Arc<ServerConfig>,
}

/// Validator of an `If-Range` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RangeValidator {
    Date(DateTime<Utc>),
    ETag(EntityTag),
}

/// Conditional request directives, parsed once during classification.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Conditions {
    pub if_match: Vec<EntityTag>,
    pub if_none_match: Vec<EntityTag>,
    pub if_modified_since: Option<DateTime<Utc>>,
    pub if_unmodified_since: Option<DateTime<Utc>>,
    pub if_range: Option<RangeValidator>,
}

/// A validated request, ready for application routing.
#[derive(Debug)]
pub struct RouteRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderSet,
    pub accept: Accept,
    pub conditions: Conditions,
    pub client: RemoteClient,
    pub body: PendingBody,
    /// Server name the client asked for during the TLS handshake
    pub sni: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Preflight {
    pub method: Method,
    pub url: Url,
    pub methods: Vec<Method>,
    pub query_types: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trace {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderSet,
    pub max_forwards: u32,
    pub accept: Accept,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Informational {
    Created {
        location: String,
        etag: Option<EntityTag>,
    },
    NotModified {
        etag: Option<EntityTag>,
        age: Option<u64>,
    },
    NoContent {
        etag: Option<EntityTag>,
    },
    Gone,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedirectKind {
    MovedPermanently,
    SeeOther,
    TemporaryRedirect,
    PermanentRedirect,
}

impl RedirectKind {
    pub fn kind(&self) -> &'static str {
        match self {
            RedirectKind::MovedPermanently => "moved-permanently",
            RedirectKind::SeeOther => "see-other",
            RedirectKind::TemporaryRedirect => "temporary-redirect",
            RedirectKind::PermanentRedirect => "permanent-redirect",
        }
    }
}

/// Current state of one rate limit, as reported in `RateLimit`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimit {
    pub policy: String,
    pub remaining: u64,
    pub reset_seconds: u64,
}

/// A quota policy, as reported in `RateLimit-Policy`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RatePolicy {
    pub name: String,
    pub quota: u64,
    pub window_seconds: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    NotFound {
        message: String,
    },
    Conflict {
        message: Option<String>,
    },
    NotAllowed {
        method: Method,
        url: Option<Url>,
        methods: Vec<Method>,
    },
    NotAcceptable {
        media_types: Vec<String>,
        encodings: Vec<String>,
        languages: Vec<String>,
    },
    UnsupportedMedia {
        media_types: Vec<String>,
        query_types: Vec<String>,
    },
    Unprocessable {
        message: Option<String>,
    },
    PreconditionFailed {
        etag: Option<EntityTag>,
    },
    NotSatisfiable {
        content_length: u64,
    },
    ContentTooLarge,
    Unauthorized {
        challenge: String,
    },
    Forbidden,
    TooManyRequests {
        limit: RateLimit,
        policies: Vec<RatePolicy>,
    },
}

impl ClientError {
    pub fn kind(&self) -> &'static str {
        match self {
            ClientError::NotFound { .. } => "not-found",
            ClientError::Conflict { .. } => "conflict",
            ClientError::NotAllowed { .. } => "not-allowed",
            ClientError::NotAcceptable { .. } => "not-acceptable",
            ClientError::UnsupportedMedia { .. } => "unsupported-media",
            ClientError::Unprocessable { .. } => "unprocessable",
            ClientError::PreconditionFailed { .. } => "precondition-failed",
            ClientError::NotSatisfiable { .. } => "not-satisfiable",
            ClientError::ContentTooLarge => "content-too-large",
            ClientError::Unauthorized { .. } => "unauthorized",
            ClientError::Forbidden => "forbidden",
            ClientError::TooManyRequests { .. } => "too-many-requests",
        }
    }
}

#[derive(Debug)]
pub enum ServerError {
    Unavailable {
        message: Option<String>,
        retry_after: Option<u64>,
    },
    NotImplemented {
        message: Option<String>,
    },
    InsufficientStorage,
    Timeout,
    /// Internal error with a human cause and the underlying fault, if any
    Internal {
        cause: String,
        fault: Option<eyre::Report>,
    },
}

impl ServerError {
    pub fn kind(&self) -> &'static str {
        match self {
            ServerError::Unavailable { .. } => "unavailable",
            ServerError::NotImplemented { .. } => "not-implemented",
            ServerError::InsufficientStorage => "insufficient-storage",
            ServerError::Timeout => "timeout",
            ServerError::Internal { .. } => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct JsonPayload {
    pub accept: Accept,
    pub value: serde_json::Value,
    pub etag: Option<EntityTag>,
    pub age: Option<u64>,
    pub query_types: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptRanges {
    Bytes,
    None,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BytesPayload {
    pub content_type: String,
    pub content_length: Option<u64>,
    pub body: Bytes,
    pub etag: Option<EntityTag>,
    pub age: Option<u64>,
    pub max_age: Option<u64>,
    pub accept_ranges: Option<AcceptRanges>,
}

/// Inclusive byte range of one part of a partial response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRange {
    pub start: u64,
    pub end: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ByteRangePart {
    pub body: Bytes,
    pub range: ContentRange,
}

/// Non-empty list of range parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ByteRanges {
    first: ByteRangePart,
    rest: Vec<ByteRangePart>,
}

impl ByteRanges {
    pub fn new(first: ByteRangePart, rest: Vec<ByteRangePart>) -> Self {
        Self { first, rest }
    }

    /// `None` when `parts` is empty.
    pub fn from_vec(mut parts: Vec<ByteRangePart>) -> Option<Self> {
        if parts.is_empty() {
            return None;
        }
        let first = parts.remove(0);
        Some(Self { first, rest: parts })
    }

    pub fn len(&self) -> usize {
        1 + self.rest.len()
    }

    pub fn is_single(&self) -> bool {
        self.rest.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ByteRangePart> {
        std::iter::once(&self.first).chain(self.rest.iter())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartialBytesPayload {
    pub content_type: String,
    pub parts: ByteRanges,
    /// Full length of the representation; unknown renders as `*`
    pub content_length: Option<u64>,
    pub etag: Option<EntityTag>,
    pub age: Option<u64>,
    pub max_age: Option<u64>,
}

/// A live event stream fed from an in-process channel.
#[derive(Debug)]
pub struct EventStream {
    /// Inactive streams send headers and end immediately
    pub active: bool,
    /// Start the stream with a byte order mark
    pub bom: bool,
    pub port: SsePort,
    pub accept: Accept,
}

#[derive(Debug)]
pub enum Route {
    Request(Box<RouteRequest>),
    Preflight(Preflight),
    Trace(Box<Trace>),
    Informational(Informational),
    Redirect { kind: RedirectKind, location: String },
    ClientError(ClientError),
    ServerError(ServerError),
    Json(Box<JsonPayload>),
    Bytes(Box<BytesPayload>),
    PartialBytes(Box<PartialBytesPayload>),
    Sse(EventStream),
    /// A tag this build does not know
    Unrecognized { kind: String },
}

impl Route {
    /// Wire tag of the variant, e.g. `not-allowed` or `see-other`.
    pub fn kind(&self) -> &str {
        match self {
            Route::Request(_) => "request",
            Route::Preflight(_) => "preflight",
            Route::Trace(_) => "trace",
            Route::Informational(info) => match info {
                Informational::Created { .. } => "created",
                Informational::NotModified { .. } => "not-modified",
                Informational::NoContent { .. } => "no-content",
                Informational::Gone => "gone",
            },
            Route::Redirect { kind, .. } => kind.kind(),
            Route::ClientError(error) => error.kind(),
            Route::ServerError(error) => error.kind(),
            Route::Json(_) => "json",
            Route::Bytes(_) => "bytes",
            Route::PartialBytes(_) => "partial-bytes",
            Route::Sse(_) => "sse",
            Route::Unrecognized { kind } => kind.as_str(),
        }
    }

    /// Rebuild a route that carries no payload from its wire tag.
    /// Known tags that need fields become an `error` naming the missing
    /// payload; unknown tags become `Unrecognized`.
    pub fn from_kind(kind: &str) -> Route {
        match kind {
            "gone" => Route::Informational(Informational::Gone),
            "content-too-large" => Route::ClientError(ClientError::ContentTooLarge),
            "forbidden" => Route::ClientError(ClientError::Forbidden),
            "insufficient-storage" => Route::ServerError(ServerError::InsufficientStorage),
            "timeout" => Route::ServerError(ServerError::Timeout),
            known if PAYLOAD_KINDS.contains(&known) => {
                Route::error(format!("payload missing for {known}"))
            }
            other => Route::Unrecognized {
                kind: other.to_string(),
            },
        }
    }

    pub fn error(cause: impl Into<String>) -> Route {
        Route::ServerError(ServerError::Internal {
            cause: cause.into(),
            fault: None,
        })
    }

    pub fn fault(cause: impl Into<String>, fault: eyre::Report) -> Route {
        Route::ServerError(ServerError::Internal {
            cause: cause.into(),
            fault: Some(fault),
        })
    }

    pub fn not_found(message: impl Into<String>) -> Route {
        Route::ClientError(ClientError::NotFound {
            message: message.into(),
        })
    }

    pub fn unavailable(retry_after: Option<u64>) -> Route {
        Route::ServerError(ServerError::Unavailable {
            message: None,
            retry_after,
        })
    }

    pub fn not_implemented(message: impl Into<String>) -> Route {
        Route::ServerError(ServerError::NotImplemented {
            message: Some(message.into()),
        })
    }

    pub fn not_acceptable_media(media_types: &[&str]) -> Route {
        Route::ClientError(ClientError::NotAcceptable {
            media_types: media_types.iter().map(|s| s.to_string()).collect(),
            encodings: Vec::new(),
            languages: Vec::new(),
        })
    }

    pub fn json(accept: Accept, value: serde_json::Value) -> Route {
        Route::Json(Box::new(JsonPayload {
            accept,
            value,
            etag: None,
            age: None,
            query_types: Vec::new(),
        }))
    }

    pub fn redirect(kind: RedirectKind, location: impl Into<String>) -> Route {
        Route::Redirect {
            kind,
            location: location.into(),
        }
    }

    pub fn sse(port: SsePort, accept: Accept) -> Route {
        Route::Sse(EventStream {
            active: true,
            bom: false,
            port,
            accept,
        })
    }
}

/// One stream's state: the shared envelope plus its route.
#[derive(Debug)]
pub struct Outcome {
    pub envelope: Envelope,
    pub route: Route,
}

impl Outcome {
    pub fn new(envelope: Envelope, route: Route) -> Self {
        Self { envelope, route }
    }

    pub fn kind(&self) -> &str {
        self.route.kind()
    }

    pub fn stream_id(&self) -> &StreamId {
        &self.envelope.stream_id
    }

    pub fn meta(&self) -> &Metadata {
        &self.envelope.meta
    }

    /// The validated request, if this outcome still is one.
    pub fn request(&self) -> Option<&RouteRequest> {
        match &self.route {
            Route::Request(request) => Some(request),
            _ => None,
        }
    }

    /// Consume the outcome and answer it with `route`, keeping the envelope.
    pub fn reply(self, route: Route) -> Outcome {
        Outcome {
            envelope: self.envelope,
            route,
        }
    }

    /// Split a request outcome into envelope and request; other outcomes are
    /// handed back unchanged.
    pub fn into_request(self) -> Result<(Envelope, RouteRequest), Outcome> {
        match self.route {
            Route::Request(request) => Ok((self.envelope, *request)),
            route => Err(Outcome {
                envelope: self.envelope,
                route,
            }),
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.kind(), self.envelope.stream_id)
    }
}
