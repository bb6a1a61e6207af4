//! TLS 1.3, HTTP/2-only connection server.
//!
//! Accepts TLS connections, rejects anything that did not negotiate `h2`,
//! and runs every stream through the [`StreamPipeline`]. Shutdown stops the
//! accept loop, sends GOAWAY on every open connection and waits for the
//! in-flight streams up to the configured timeout.
use std::{convert::Infallible, net::SocketAddr, sync::Arc};

use axum::body::Body;
use eyre::{Context, Result};
use futures_util::StreamExt;
use http::{HeaderValue, Request, Response, StatusCode};
use hyper::{body::Incoming, server::conn::http2, service::service_fn};
use hyper_util::rt::{TokioExecutor, TokioIo};
use socket2::{Domain, Protocol, Socket, Type};
use tls_listener::TlsListener;
use tokio::{net::TcpListener, task::JoinSet};
use tokio_rustls::{TlsAcceptor, server::TlsStream};
use tracing::Instrument;

use crate::{
    adapters::{
        body_reader::LimitedBodyReader,
        header_semantics::StandardHeaderSemantics,
        hyper_responder::HyperResponder,
        tls::{ALPN_H2, TlsSetupError, server_tls_config},
    },
    config::ServerConfig,
    core::{
        epilogue::Epilogue,
        headers::HeaderSet,
        pipeline::StreamPipeline,
        preamble::PreambleClassifier,
        stream::{ConnectionInfo, StreamHandle, StreamId, TlsSession},
    },
    ports::route_dispatcher::RouteDispatcher,
    tracing_setup::{connection_span, stream_span},
    utils::graceful_shutdown::{GracefulShutdown, ShutdownReason, ShutdownToken},
};

/// Logs streams whose handler is dropped before a response was produced.
struct AbortGuard {
    stream_id: StreamId,
    finished: bool,
}

impl Drop for AbortGuard {
    fn drop(&mut self) {
        if !self.finished {
            tracing::warn!(stream_id = %self.stream_id, "stream aborted before a response");
        }
    }
}

const LISTEN_BACKLOG: i32 = 1024;

/// Bind a listening socket. `ipv6_only` applies to IPv6 addresses only.
pub fn bind_listener(addr: SocketAddr, ipv6_only: bool) -> std::io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    if addr.is_ipv6() {
        socket.set_only_v6(ipv6_only)?;
    }
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    TcpListener::from_std(socket.into())
}

fn fallback_response(stream_id: &StreamId) -> Response<Body> {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
    if let Ok(value) = HeaderValue::from_str(stream_id.as_str()) {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}

pub struct H2Server<D: ?Sized> {
    config: Arc<ServerConfig>,
    pipeline: StreamPipeline<D>,
    tls: Arc<rustls::ServerConfig>,
    shutdown: Arc<GracefulShutdown>,
}

impl<D: RouteDispatcher + ?Sized> H2Server<D> {
    /// Build a server with the bundled adapters. Loads every configured
    /// credential once, up front.
    pub fn new(config: Arc<ServerConfig>, dispatcher: Arc<D>) -> Result<Self, TlsSetupError> {
        let tls = server_tls_config(&config.tls)?;
        let classifier = PreambleClassifier::new(
            config.clone(),
            Arc::new(StandardHeaderSemantics),
            Arc::new(LimitedBodyReader),
        );
        let pipeline =
            StreamPipeline::new(classifier, dispatcher, Epilogue::new(Arc::new(HyperResponder)));
        let shutdown = Arc::new(GracefulShutdown::with_timeout(config.shutdown_timeout()));

        Ok(Self::from_parts(config, pipeline, tls, shutdown))
    }

    /// Assemble a server from prepared parts.
    pub fn from_parts(
        config: Arc<ServerConfig>,
        pipeline: StreamPipeline<D>,
        tls: Arc<rustls::ServerConfig>,
        shutdown: Arc<GracefulShutdown>,
    ) -> Self {
        Self {
            config,
            pipeline,
            tls,
            shutdown,
        }
    }

    /// The shutdown manager; hand it to a signal handler.
    pub fn shutdown_handle(&self) -> Arc<GracefulShutdown> {
        self.shutdown.clone()
    }

    /// Trigger shutdown. Returns `false` if it was already triggered.
    pub fn close(&self) -> bool {
        self.shutdown.trigger_shutdown(ShutdownReason::Close)
    }

    pub fn closed(&self) -> bool {
        self.shutdown.is_shutdown_initiated()
    }

    /// Bind the configured address and serve until shutdown.
    pub async fn listen(&self) -> Result<()> {
        let addr: SocketAddr = self
            .config
            .listen_addr
            .parse()
            .with_context(|| format!("Invalid listen address {}", self.config.listen_addr))?;
        let listener = bind_listener(addr, self.config.ipv6_only)
            .with_context(|| format!("Failed to bind to {addr}"))?;
        self.serve(listener).await
    }

    /// Serve an already bound listener until shutdown, then drain.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let local_addr = listener.local_addr().context("Failed to get local addr")?;
        tracing::info!(%local_addr, "h2core server listening");

        let token = self.shutdown.shutdown_token();
        let mut listener = TlsListener::new(TlsAcceptor::from(self.tls.clone()), listener);
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                accepted = listener.next() => match accepted {
                    Some(Ok((tls, peer))) => {
                        let pipeline = self.pipeline.clone();
                        let token = token.clone();
                        connections.spawn(
                            serve_connection(pipeline, tls, peer, token)
                                .instrument(connection_span(peer)),
                        );
                    }
                    Some(Err(error)) => tracing::warn!(%error, "TLS accept failed"),
                    None => break,
                },
            }

            while connections.try_join_next().is_some() {}
        }

        drop(listener);
        tracing::info!(open = connections.len(), "accept loop stopped, draining connections");

        let timeout = self.shutdown.shutdown_timeout();
        let drain = async {
            while let Some(joined) = connections.join_next().await {
                if let Err(error) = joined {
                    tracing::warn!(%error, "connection task failed");
                }
            }
        };
        if tokio::time::timeout(timeout, drain).await.is_err() {
            tracing::warn!(
                timeout = ?timeout,
                open = connections.len(),
                "drain timed out, aborting connections"
            );
            connections.abort_all();
        }

        tracing::info!("h2core server stopped");
        Ok(())
    }
}

async fn serve_connection<D: RouteDispatcher + ?Sized>(
    pipeline: StreamPipeline<D>,
    tls: TlsStream<tokio::net::TcpStream>,
    peer: SocketAddr,
    token: ShutdownToken,
) {
    let (_, session) = tls.get_ref();
    let alpn_protocol = session.alpn_protocol().map(<[u8]>::to_vec);
    let server_name = session.server_name().map(str::to_string);

    if alpn_protocol.as_deref() != Some(ALPN_H2) {
        tracing::warn!(%peer, alpn = ?alpn_protocol, "unknown protocol, dropping connection");
        return;
    }
    if let Some(name) = &server_name {
        tracing::Span::current().record("sni", name.as_str());
    }
    tracing::debug!("connection opened");

    let connection = Arc::new(ConnectionInfo::tls(
        peer,
        TlsSession {
            server_name,
            alpn_protocol,
        },
    ));

    let stream_token = token.clone();
    let service = service_fn(move |request: Request<Incoming>| {
        let pipeline = pipeline.clone();
        let connection = connection.clone();
        let token = stream_token.clone();
        async move {
            let response = handle_stream(pipeline, connection, token, request).await;
            Ok::<_, Infallible>(response)
        }
    });

    let conn =
        http2::Builder::new(TokioExecutor::new()).serve_connection(TokioIo::new(tls), service);
    tokio::pin!(conn);

    let mut draining = false;
    loop {
        tokio::select! {
            result = conn.as_mut() => {
                if let Err(error) = result {
                    tracing::debug!(%peer, %error, "connection error");
                }
                break;
            }
            _ = token.cancelled(), if !draining => {
                draining = true;
                tracing::debug!(%peer, "sending GOAWAY");
                conn.as_mut().graceful_shutdown();
            }
        }
    }

    tracing::debug!("connection closed");
}

async fn handle_stream<D: RouteDispatcher + ?Sized>(
    pipeline: StreamPipeline<D>,
    connection: Arc<ConnectionInfo>,
    token: ShutdownToken,
    request: Request<Incoming>,
) -> Response<Body> {
    let stream_id = StreamId::generate();
    let span = stream_span(&stream_id, connection.remote_addr);

    async move {
        tracing::debug!("stream opened");
        let mut guard = AbortGuard {
            stream_id: stream_id.clone(),
            finished: false,
        };

        let (parts, body) = request.into_parts();
        let headers = HeaderSet::from_parts(&parts);
        let (stream, mut rendered) = StreamHandle::new(stream_id.clone(), Body::new(body));

        pipeline
            .run(stream_id.clone(), stream, headers, &connection, token)
            .await;
        guard.finished = true;

        let response = match rendered.try_recv() {
            Ok(response) => response,
            Err(_) => {
                tracing::error!("no response was rendered, sending 500");
                fallback_response(&stream_id)
            }
        };
        tracing::debug!(status = response.status().as_u16(), "stream closed");
        response
    }
    .instrument(span)
    .await
}
