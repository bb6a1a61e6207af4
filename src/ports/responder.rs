use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::core::{
    outcome::{
        BytesPayload, ClientError, Informational, JsonPayload, Metadata, PartialBytesPayload,
        Preflight, RedirectKind, ServerError, Trace,
    },
    stream::StreamHandle,
};

/// Custom error type for response rendering
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ResponderError {
    /// A response was already delivered on this stream
    #[error("stream already has a response")]
    AlreadyResponded,

    /// The peer went away before the response could be delivered
    #[error("stream closed before the response was delivered")]
    StreamClosed,

    /// A header value could not be encoded
    #[error("invalid response header '{name}': {reason}")]
    InvalidHeader { name: String, reason: String },

    /// The response could not be assembled
    #[error("failed to build response: {0}")]
    Build(String),
}

impl From<http::Error> for ResponderError {
    fn from(error: http::Error) -> Self {
        ResponderError::Build(error.to_string())
    }
}

/// Result type alias for responder operations
pub type ResponderResult<T> = Result<T, ResponderError>;

/// Write half of an open event-stream response.
///
/// Dropping the sink (or calling [`end`](Self::end)) finishes the response
/// body.
#[derive(Debug)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<Bytes>,
}

impl EventSink {
    pub fn new(tx: mpsc::UnboundedSender<Bytes>) -> Self {
        Self { tx }
    }

    /// Queue bytes on the stream. Returns `false` once the stream is gone.
    pub fn write(&self, bytes: Bytes) -> bool {
        self.tx.send(bytes).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Resolves once the peer side of the stream has been dropped.
    pub async fn closed(&self) {
        self.tx.closed().await
    }

    pub fn end(self) {
        drop(self.tx);
    }
}

/// Responder defines the port that turns outcomes into wire responses
///
/// Each method delivers exactly one response on `stream` and writes the
/// shared metadata headers. Implementations never block.
pub trait Responder: Send + Sync + 'static {
    /// `204` answer to an `OPTIONS` request
    fn send_preflight(
        &self,
        stream: &StreamHandle,
        meta: &Metadata,
        preflight: &Preflight,
    ) -> ResponderResult<()>;

    /// Echo of the request head as `message/http`
    fn send_trace(&self, stream: &StreamHandle, meta: &Metadata, trace: &Trace)
    -> ResponderResult<()>;

    /// Created, not-modified, no-content and gone
    fn send_informational(
        &self,
        stream: &StreamHandle,
        meta: &Metadata,
        informational: &Informational,
    ) -> ResponderResult<()>;

    fn send_redirect(
        &self,
        stream: &StreamHandle,
        meta: &Metadata,
        kind: RedirectKind,
        location: &str,
    ) -> ResponderResult<()>;

    fn send_client_error(
        &self,
        stream: &StreamHandle,
        meta: &Metadata,
        error: &ClientError,
    ) -> ResponderResult<()>;

    fn send_server_error(
        &self,
        stream: &StreamHandle,
        meta: &Metadata,
        error: &ServerError,
    ) -> ResponderResult<()>;

    fn send_json(
        &self,
        stream: &StreamHandle,
        meta: &Metadata,
        payload: &JsonPayload,
    ) -> ResponderResult<()>;

    fn send_bytes(
        &self,
        stream: &StreamHandle,
        meta: &Metadata,
        payload: &BytesPayload,
    ) -> ResponderResult<()>;

    fn send_partial_bytes(
        &self,
        stream: &StreamHandle,
        meta: &Metadata,
        payload: &PartialBytesPayload,
    ) -> ResponderResult<()>;

    /// Send `text/event-stream` headers and hand back the body writer
    fn open_event_stream(
        &self,
        stream: &StreamHandle,
        meta: &Metadata,
        bom: bool,
    ) -> ResponderResult<EventSink>;
}
