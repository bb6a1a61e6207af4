use std::net::SocketAddr;

use eyre::{Result, WrapErr};
use tracing_subscriber::{EnvFilter, Registry, layer::SubscriberExt, util::SubscriberInitExt};

use crate::core::stream::StreamId;

/// Initialize structured logging with JSON output
pub fn init_tracing() -> Result<()> {
    Registry::default()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(false)
                .with_span_list(true)
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true),
        )
        .try_init()
        .wrap_err("tracing subscriber already installed")?;

    tracing::info!("h2core structured logging initialized");
    Ok(())
}

/// Initialize console-friendly logging for development
pub fn init_console_tracing() -> Result<()> {
    Registry::default()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .pretty()
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true),
        )
        .try_init()
        .wrap_err("tracing subscriber already installed")?;

    tracing::info!("h2core console logging initialized");
    Ok(())
}

/// Initialize tracing with custom configuration
pub fn init_tracing_with_config(level: &str, json_format: bool, include_spans: bool) -> Result<()> {
    let env_filter =
        EnvFilter::try_new(level).wrap_err_with(|| format!("Invalid log level: {level}"))?;

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    let installed = if json_format {
        Registry::default()
            .with(env_filter)
            .with(
                fmt_layer
                    .json()
                    .with_current_span(include_spans)
                    .with_span_list(include_spans),
            )
            .try_init()
    } else {
        Registry::default()
            .with(env_filter)
            .with(fmt_layer.pretty().with_ansi(true))
            .try_init()
    };
    installed.wrap_err("tracing subscriber already installed")?;

    tracing::info!(level, json_format, include_spans, "h2core logging initialized");
    Ok(())
}

/// Span covering one HTTP/2 stream, from headers to rendered response.
pub fn stream_span(stream_id: &StreamId, peer: Option<SocketAddr>) -> tracing::Span {
    tracing::info_span!(
        "stream",
        stream_id = %stream_id,
        peer = ?peer,
        kind = tracing::field::Empty,
    )
}

/// Span covering one accepted TLS connection.
pub fn connection_span(peer: SocketAddr) -> tracing::Span {
    tracing::info_span!(
        "connection",
        %peer,
        sni = tracing::field::Empty,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_level_is_rejected() {
        assert!(init_tracing_with_config("h2core=loudest", true, true).is_err());
    }

    #[test]
    fn test_stream_span() {
        tracing::subscriber::with_default(tracing_subscriber::registry(), || {
            let span = stream_span(&StreamId::from("0a1b2c3d4e"), "127.0.0.1:1".parse().ok());
            assert!(!span.is_disabled());
            assert_eq!(span.metadata().map(|m| m.name()), Some("stream"));
        });
    }

    #[test]
    fn test_connection_span() {
        tracing::subscriber::with_default(tracing_subscriber::registry(), || {
            let span = connection_span("127.0.0.1:1".parse().unwrap());
            assert!(!span.is_disabled());
            assert_eq!(span.metadata().map(|m| m.name()), Some("connection"));
        });
    }
}
