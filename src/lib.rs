//! h2core - per-stream request classification for a TLS 1.3, HTTP/2-only server.
//!
//! Every inbound HTTP/2 stream is turned into exactly one [`Outcome`]: the
//! preamble classifier validates transport, pseudo-headers, single-valued
//! headers, the `Forwarded` trust chain, CORS origin and content negotiation,
//! an application [`RouteDispatcher`] resolves validated requests, and the
//! epilogue renders whatever comes out through a [`ports::Responder`].
//!
//! # Features
//! - TLS 1.3 only, ALPN `h2` only, certificates resolved per SNI
//! - Closed outcome union matched exhaustively by every consumer
//! - Lazily read, size- and deadline-bounded request bodies
//! - Server-sent events bridged from an in-process channel
//! - Process-wide graceful shutdown with GOAWAY and a drain timeout
//!
//! # Quick Example
//! ```no_run
//! use std::sync::Arc;
//!
//! use h2core::{H2Server, Outcome, Route, config::ServerConfig};
//!
//! # #[tokio::main] async fn main() -> eyre::Result<()> {
//! let config = Arc::new(
//!     ServerConfig::builder()
//!         .listen_addr("127.0.0.1:8443")
//!         .credential("localhost")
//!         .build()
//!         .map_err(|e| eyre::eyre!(e))?,
//! );
//! let dispatcher = Arc::new(|outcome: Outcome| async move {
//!     Ok::<_, eyre::Report>(outcome.reply(Route::not_found("nothing here")))
//! });
//! let server = H2Server::new(config, dispatcher)?;
//! server.listen().await?;
//! # Ok(()) }
//! ```
//!
//! # Architecture
//! Ports (traits) live in [`ports`], their bundled implementations in
//! [`adapters`], and the classification, routing and rendering logic in
//! [`core`].
//!
//! # Error Handling
//! Library errors are `thiserror` enums; application-level fallible APIs
//! return `eyre::Result<T>` with `WrapErr` context.
pub mod config;
pub mod ports;
pub mod tracing_setup;
pub mod utils;

pub mod adapters;
pub mod core;

pub use crate::{
    adapters::H2Server,
    core::{
        Outcome, Route, StreamPipeline,
        event_stream::{SseMessage, sse_channel},
    },
    ports::RouteDispatcher,
    utils::GracefulShutdown,
};
