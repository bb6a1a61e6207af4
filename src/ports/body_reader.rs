use std::{
    fmt,
    future::{Future, IntoFuture},
    pin::Pin,
};

use bytes::Bytes;
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::{
    core::stream::StreamHandle,
    ports::header_semantics::ContentType,
    utils::graceful_shutdown::{CancelReason, CancelSignal},
};

/// Errors surfaced by a pending request body
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum BodyError {
    /// The body exceeded the configured byte limit
    #[error("request body exceeds {limit} bytes")]
    TooLarge { limit: usize },

    /// Reading was cancelled before the body completed
    #[error("request body read cancelled ({0})")]
    Cancelled(CancelReason),

    /// The received length differs from the declared `content-length`
    #[error("request body length {received} does not match declared length {expected}")]
    LengthMismatch { expected: u64, received: u64 },

    /// The peer reset the stream or the connection failed mid-body
    #[error("request body transport error: {0}")]
    Transport(String),

    /// Another reader already took the body of this stream
    #[error("request body already consumed")]
    AlreadyConsumed,

    /// The body is not valid for the requested decoding
    #[error("request body could not be decoded: {0}")]
    Decode(String),
}

/// Result type alias for body reads
pub type BodyResult<T> = Result<T, BodyError>;

/// Bounds and cancellation for one body read.
#[derive(Debug, Clone)]
pub struct BodyReadOptions {
    pub byte_limit: usize,
    pub content_length: Option<u64>,
    pub content_type: Option<ContentType>,
    pub signal: CancelSignal,
}

/// A fully received request body.
#[derive(Debug, Clone)]
pub struct ReceivedBody {
    pub bytes: Bytes,
    pub content_type: Option<ContentType>,
}

impl ReceivedBody {
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn text(&self) -> BodyResult<&str> {
        std::str::from_utf8(&self.bytes).map_err(|e| BodyError::Decode(e.to_string()))
    }

    pub fn json<T: DeserializeOwned>(&self) -> BodyResult<T> {
        serde_json::from_slice(&self.bytes).map_err(|e| BodyError::Decode(e.to_string()))
    }
}

/// Handle to a body that is read when awaited.
///
/// Only the route dispatcher awaits it; classification merely creates it.
pub struct PendingBody {
    future: Pin<Box<dyn Future<Output = BodyResult<ReceivedBody>> + Send>>,
}

impl PendingBody {
    pub fn new<F>(future: F) -> Self
    where
        F: Future<Output = BodyResult<ReceivedBody>> + Send + 'static,
    {
        Self {
            future: Box::pin(future),
        }
    }

    /// A body that resolves immediately to `result`.
    pub fn ready(result: BodyResult<ReceivedBody>) -> Self {
        Self::new(std::future::ready(result))
    }
}

impl IntoFuture for PendingBody {
    type Output = BodyResult<ReceivedBody>;
    type IntoFuture = Pin<Box<dyn Future<Output = BodyResult<ReceivedBody>> + Send>>;

    fn into_future(self) -> Self::IntoFuture {
        self.future
    }
}

impl fmt::Debug for PendingBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PendingBody")
    }
}

/// BodyReader defines the port for collecting a request body
pub trait BodyReader: Send + Sync + 'static {
    /// Create a pending read of the body of `stream`.
    ///
    /// Must not block or suspend; the returned handle does the work.
    fn read(&self, stream: &StreamHandle, options: BodyReadOptions) -> PendingBody;
}
