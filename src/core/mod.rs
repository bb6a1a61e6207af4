pub mod epilogue;
pub mod event_stream;
pub mod headers;
pub mod outcome;
pub mod pipeline;
pub mod preamble;
pub mod sse_bridge;
pub mod stream;

pub use epilogue::Epilogue;
pub use event_stream::{SseMessage, SsePort, SseSender, sse_channel};
pub use headers::HeaderSet;
pub use outcome::{Accept, Envelope, Metadata, Outcome, Route, RouteRequest};
pub use pipeline::StreamPipeline;
pub use preamble::PreambleClassifier;
pub use stream::{ConnectionInfo, StreamHandle, StreamId};
