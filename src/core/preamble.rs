//! Preamble classification: raw stream headers to a validated outcome.
//!
//! [`PreambleClassifier::classify`] never fails and never suspends. Every
//! rejected stream becomes a terminal [`Route`]; only a stream that passes
//! every check becomes a [`Route::Request`] carrying a pending body.
//!
//! Checks run in a fixed order and the first failure wins:
//!
//! 1. shutdown already signalled
//! 2. TLS transport with a negotiated SNI
//! 3. single `:path`
//! 4. single, known `:method`
//! 5. single-valued request headers
//! 6. request URL and `content-length`
//! 7. conditional directives
//! 8. `Forwarded` trust chain
//! 9. `OPTIONS` preflight
//! 10. content negotiation
//! 11. `TRACE`
//! 12. pending body
use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use http::Method;
use url::Url;

use crate::{
    config::ServerConfig,
    core::{
        headers::{
            HEADER_FORWARDED, HEADER_ORIGIN, HeaderSet, PSEUDO_AUTHORITY, PSEUDO_METHOD,
            PSEUDO_PATH, PSEUDO_SCHEME,
        },
        outcome::{
            Accept, ClientError, Conditions, Envelope, MIME_TYPE_MESSAGE_HTTP, Metadata, Outcome,
            Preflight, RangeValidator, Route, RouteRequest, Trace,
        },
        stream::{ConnectionInfo, RemoteClient, StreamHandle, StreamId},
    },
    ports::{
        body_reader::{BodyReadOptions, BodyReader},
        header_semantics::HeaderSemantics,
    },
    utils::graceful_shutdown::{CancelSignal, ShutdownToken},
};

/// Methods a request may use; anything else is not implemented.
pub const KNOWN_METHODS: [&str; 9] = [
    "GET", "HEAD", "POST", "PUT", "PATCH", "OPTIONS", "DELETE", "TRACE", "QUERY",
];

/// Headers that are rejected when sent more than once.
pub const SINGLE_VALUED_HEADERS: [&str; 12] = [
    "content-type",
    "content-length",
    "accept",
    "accept-encoding",
    "accept-language",
    "authorization",
    "max-forwards",
    "if-match",
    "if-none-match",
    "if-modified-since",
    "if-unmodified-since",
    "if-range",
];

pub const FORWARDED_KEY_FOR: &str = "for";
pub const FORWARDED_KEY_SECRET: &str = "secret";
pub const FORWARDED_ACCEPTABLE_KEYS: [&str; 5] = ["by", "for", "host", "proto", "secret"];

pub const BODY_BYTE_LIMIT: usize = 1024 * 1024;
pub const BODY_TIMEOUT: Duration = Duration::from_secs(2);

/// `Retry-After` sent while the server is shutting down.
pub const SHUTDOWN_RETRY_AFTER_SECS: u64 = 60;

pub const TIMING_PREFLIGHT: &str = "preamble-preflight";
pub const TIMING_TRACE: &str = "preamble-trace";
pub const TIMING_REQUEST: &str = "preamble";

/// Classifies inbound streams against the server's policies.
#[derive(Clone)]
pub struct PreambleClassifier {
    config: Arc<ServerConfig>,
    semantics: Arc<dyn HeaderSemantics>,
    body_reader: Arc<dyn BodyReader>,
}

impl PreambleClassifier {
    pub fn new(
        config: Arc<ServerConfig>,
        semantics: Arc<dyn HeaderSemantics>,
        body_reader: Arc<dyn BodyReader>,
    ) -> Self {
        Self {
            config,
            semantics,
            body_reader,
        }
    }

    pub fn config(&self) -> &Arc<ServerConfig> {
        &self.config
    }

    /// Classify one stream. Every outcome carries the full envelope.
    pub fn classify(
        &self,
        stream_id: StreamId,
        stream: StreamHandle,
        headers: HeaderSet,
        connection: &ConnectionInfo,
        shutdown: ShutdownToken,
    ) -> Outcome {
        let started = Instant::now();

        let origin = headers.single(HEADER_ORIGIN).ok().flatten();
        let mut meta = Metadata {
            origin: self.allowed_origin(origin),
            server_name: self
                .config
                .server_name
                .clone()
                .or_else(|| connection.server_name().map(str::to_string)),
            ..Metadata::default()
        };

        let route = self.route(headers, connection, &stream, &shutdown, &mut meta, started);

        Outcome::new(
            Envelope {
                stream_id,
                stream,
                meta,
                shutdown,
                config: self.config.clone(),
            },
            route,
        )
    }

    /// The request origin if the allow-list admits it.
    pub fn allowed_origin(&self, origin: Option<&str>) -> Option<String> {
        let origin = origin?;
        let cors = &self.config.cors;
        if cors.allows_any()
            || (Url::parse(origin).is_ok() && cors.allowed_origins.iter().any(|o| o == origin))
        {
            Some(origin.to_string())
        } else {
            None
        }
    }

    fn route(
        &self,
        headers: HeaderSet,
        connection: &ConnectionInfo,
        stream: &StreamHandle,
        shutdown: &ShutdownToken,
        meta: &mut Metadata,
        started: Instant,
    ) -> Route {
        if shutdown.is_shutdown_initiated() {
            return Route::unavailable(Some(SHUTDOWN_RETRY_AFTER_SECS));
        }

        if connection.tls.is_none() {
            return Route::error("not a TLS socket");
        }
        let Some(sni) = connection.server_name() else {
            return Route::error("invalid or unknown SNI");
        };

        let path = match headers.single(PSEUDO_PATH) {
            Ok(Some(path)) => path,
            _ => return Route::error("improper path"),
        };

        let method = match headers.single(PSEUDO_METHOD) {
            Ok(Some(method)) if KNOWN_METHODS.contains(&method) => {
                match Method::from_bytes(method.as_bytes()) {
                    Ok(method) => method,
                    Err(_) => return Route::not_implemented("unknown or invalid method"),
                }
            }
            _ => return Route::not_implemented("unknown or invalid method"),
        };

        if let Some(name) = SINGLE_VALUED_HEADERS
            .iter()
            .find(|name| headers.single(name).is_err())
        {
            return Route::error(format!("improper header ({})", name.replace('-', " ")));
        }
        // from here on every listed header is known to be single-valued
        let single = |name: &str| headers.single(name).ok().flatten();

        let Some(url) = self.request_url(&headers, path, sni) else {
            return Route::error("improper path");
        };

        let content_length = match single("content-length").map(|v| v.trim().parse::<u64>()) {
            None => None,
            Some(Ok(length)) => Some(length),
            Some(Err(_)) => return Route::error("improper header (content length)"),
        };

        let conditions = self.conditions(&single);

        if let Some(cause) = self.check_forwarded(&headers) {
            return Route::error(cause);
        }

        if method == Method::OPTIONS {
            meta.record_timing(TIMING_PREFLIGHT, started);
            return Route::Preflight(Preflight {
                method,
                url,
                methods: Vec::new(),
                query_types: Vec::new(),
            });
        }

        let negotiation = &self.config.negotiation;
        let content_type = self.semantics.parse_content_type(single("content-type"));
        let accept = Accept {
            media_type: self
                .semantics
                .select_media_type(single("accept"), &negotiation.media_types),
            encoding: self
                .semantics
                .select_encoding(single("accept-encoding"), &negotiation.encodings),
            language: self
                .semantics
                .select_language(single("accept-language"), &negotiation.languages),
        };

        if method == Method::TRACE {
            if !self.config.allow_trace {
                return Route::ClientError(ClientError::NotAllowed {
                    method,
                    url: Some(url),
                    methods: Vec::new(),
                });
            }
            let max_forwards = single("max-forwards")
                .and_then(|v| v.trim().parse::<u32>().ok())
                .unwrap_or(0);
            meta.record_timing(TIMING_TRACE, started);
            if accept.media_type.as_deref() != Some(MIME_TYPE_MESSAGE_HTTP) {
                return Route::not_acceptable_media(&[MIME_TYPE_MESSAGE_HTTP]);
            }
            return Route::Trace(Box::new(Trace {
                method,
                url,
                headers,
                max_forwards,
                accept,
            }));
        }

        let body = self.body_reader.read(
            stream,
            BodyReadOptions {
                byte_limit: BODY_BYTE_LIMIT,
                content_length,
                content_type,
                signal: CancelSignal::any(shutdown.clone(), BODY_TIMEOUT),
            },
        );

        meta.record_timing(TIMING_REQUEST, started);

        Route::Request(Box::new(RouteRequest {
            method,
            url,
            headers,
            accept,
            conditions,
            client: RemoteClient::from(connection.remote_addr),
            body,
            sni: sni.to_string(),
        }))
    }

    /// `:path` resolved against `<:scheme>://<:authority>`.
    fn request_url(&self, headers: &HeaderSet, path: &str, sni: &str) -> Option<Url> {
        let scheme = headers.single(PSEUDO_SCHEME).ok()?.unwrap_or("https");
        let authority = headers.single(PSEUDO_AUTHORITY).ok()?.unwrap_or(sni);
        Url::parse(&format!("{scheme}://{authority}"))
            .and_then(|base| base.join(path))
            .ok()
    }

    fn conditions<'a>(&self, single: &impl Fn(&str) -> Option<&'a str>) -> Conditions {
        let if_range = single("if-range");
        Conditions {
            if_match: self.semantics.parse_etag_list(single("if-match")),
            if_none_match: self.semantics.parse_etag_list(single("if-none-match")),
            if_modified_since: self.semantics.parse_fix_date(single("if-modified-since")),
            if_unmodified_since: self
                .semantics
                .parse_fix_date(single("if-unmodified-since")),
            if_range: self
                .semantics
                .parse_fix_date(if_range)
                .map(RangeValidator::Date)
                .or_else(|| self.semantics.parse_etag(if_range).map(RangeValidator::ETag)),
        }
    }

    /// Validate the right-most trusted `Forwarded` hop. Returns the failure cause.
    fn check_forwarded(&self, headers: &HeaderSet) -> Option<&'static str> {
        let policy = &self.config.forwarded;

        let raw: Vec<&str> = headers.values(HEADER_FORWARDED).collect();
        let raw = (!raw.is_empty()).then(|| raw.join(", "));
        let hops = self
            .semantics
            .parse_forwarded(raw.as_deref(), &FORWARDED_ACCEPTABLE_KEYS);

        let hop = hops.iter().rev().find(|hop| {
            !hop.get(FORWARDED_KEY_FOR)
                .is_some_and(|id| policy.skip_list.iter().any(|skip| skip == id))
        });

        if policy.required {
            let Some(hop) = hop else {
                return Some("forwarded required");
            };
            if hop.get(FORWARDED_KEY_FOR).is_none() {
                return Some("forwarded for required");
            }
        }

        if let (Some(secret), Some(hop)) = (policy.secret.as_deref(), hop) {
            if hop.get(FORWARDED_KEY_SECRET) != Some(secret) {
                return Some("forwarded invalid");
            }
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::body::Body;

    use super::*;
    use crate::{
        adapters::{body_reader::LimitedBodyReader, header_semantics::StandardHeaderSemantics},
        config::{TrustPolicy, models::ServerConfigBuilder},
        core::{outcome::ServerError, stream::TlsSession},
        ports::body_reader::PendingBody,
        utils::graceful_shutdown::{GracefulShutdown, ShutdownReason},
    };

    /// Counts body reads so tests can assert none happened.
    #[derive(Default)]
    struct CountingReader {
        reads: AtomicUsize,
    }

    impl BodyReader for CountingReader {
        fn read(&self, stream: &StreamHandle, options: BodyReadOptions) -> PendingBody {
            self.reads.fetch_add(1, Ordering::SeqCst);
            LimitedBodyReader.read(stream, options)
        }
    }

    fn config(builder: ServerConfigBuilder) -> Arc<ServerConfig> {
        Arc::new(builder.credential("api.example").build().unwrap())
    }

    fn classifier_with(config: Arc<ServerConfig>) -> (PreambleClassifier, Arc<CountingReader>) {
        let reader = Arc::new(CountingReader::default());
        let classifier =
            PreambleClassifier::new(config, Arc::new(StandardHeaderSemantics), reader.clone());
        (classifier, reader)
    }

    fn tls() -> ConnectionInfo {
        ConnectionInfo::tls(
            "192.0.2.10:50123".parse().unwrap(),
            TlsSession {
                server_name: Some("api.example".to_string()),
                alpn_protocol: Some(b"h2".to_vec()),
            },
        )
    }

    fn request(method: &str, path: &str) -> HeaderSet {
        HeaderSet::new()
            .with(PSEUDO_METHOD, method)
            .with(PSEUDO_SCHEME, "https")
            .with(PSEUDO_AUTHORITY, "api.example")
            .with(PSEUDO_PATH, path)
    }

    fn classify_with(
        classifier: &PreambleClassifier,
        headers: HeaderSet,
        connection: &ConnectionInfo,
        shutdown: ShutdownToken,
    ) -> Outcome {
        let id = StreamId::generate();
        let (stream, _rx) = StreamHandle::new(id.clone(), Body::empty());
        classifier.classify(id, stream, headers, connection, shutdown)
    }

    fn classify(config: Arc<ServerConfig>, headers: HeaderSet) -> Outcome {
        let (classifier, _) = classifier_with(config);
        classify_with(
            &classifier,
            headers,
            &tls(),
            GracefulShutdown::new().shutdown_token(),
        )
    }

    fn cause(outcome: &Outcome) -> &str {
        match &outcome.route {
            Route::ServerError(ServerError::Internal { cause, .. }) => cause,
            other => panic!("expected error, got {}", other.kind()),
        }
    }

    #[tokio::test]
    async fn test_valid_get_is_request() {
        let outcome = classify(
            config(ServerConfig::builder()),
            request("GET", "/items?limit=2").with("accept", "application/json"),
        );

        let request = outcome.request().expect("request outcome");
        assert_eq!(request.method, Method::GET);
        assert_eq!(request.url.as_str(), "https://api.example/items?limit=2");
        assert_eq!(request.accept.media_type.as_deref(), Some("application/json"));
        assert_eq!(request.accept.encoding.as_deref(), Some("identity"));
        assert_eq!(request.sni, "api.example");
        assert_eq!(request.client.port, Some(50123));
        assert_eq!(outcome.meta().server_name.as_deref(), Some("api.example"));
        assert_eq!(outcome.meta().timings.len(), 1);
        assert_eq!(outcome.meta().timings[0].name, TIMING_REQUEST);
    }

    #[tokio::test]
    async fn test_shutdown_wins_over_everything() {
        let shutdown = GracefulShutdown::new();
        shutdown.trigger_shutdown(ShutdownReason::Close);
        let (classifier, _) = classifier_with(config(ServerConfig::builder()));

        // not even a TLS connection: shutdown is still checked first
        let outcome = classify_with(
            &classifier,
            request("GET", "/"),
            &ConnectionInfo::default(),
            shutdown.shutdown_token(),
        );
        assert!(matches!(
            outcome.route,
            Route::ServerError(ServerError::Unavailable {
                retry_after: Some(60),
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_transport_checks() {
        let (classifier, _) = classifier_with(config(ServerConfig::builder()));
        let token = GracefulShutdown::new().shutdown_token();

        let plain = classify_with(
            &classifier,
            request("GET", "/"),
            &ConnectionInfo::default(),
            token.clone(),
        );
        assert_eq!(cause(&plain), "not a TLS socket");

        let mut no_sni = tls();
        no_sni.tls.as_mut().unwrap().server_name = None;
        let outcome = classify_with(&classifier, request("GET", "/"), &no_sni, token);
        assert_eq!(cause(&outcome), "invalid or unknown SNI");
    }

    #[tokio::test]
    async fn test_path_and_method_checks() {
        let cfg = config(ServerConfig::builder());

        let missing_path = HeaderSet::new().with(PSEUDO_METHOD, "GET");
        assert_eq!(cause(&classify(cfg.clone(), missing_path)), "improper path");

        let repeated_path = request("GET", "/a").with(PSEUDO_PATH, "/b");
        assert_eq!(cause(&classify(cfg.clone(), repeated_path)), "improper path");

        for method in ["CONNECT", "get", "BREW"] {
            let outcome = classify(cfg.clone(), request(method, "/"));
            assert_eq!(outcome.kind(), "not-implemented", "{method}");
        }

        let query = classify(cfg, request("QUERY", "/search"));
        assert_eq!(query.request().unwrap().method.as_str(), "QUERY");
    }

    #[tokio::test]
    async fn test_repeated_headers_never_become_requests() {
        let cfg = config(ServerConfig::builder());
        for name in SINGLE_VALUED_HEADERS {
            let headers = request("POST", "/").with(name, "1").with(name, "2");
            let outcome = classify(cfg.clone(), headers);
            assert_eq!(
                cause(&outcome),
                format!("improper header ({})", name.replace('-', " "))
            );
        }
    }

    #[tokio::test]
    async fn test_non_numeric_content_length() {
        let outcome = classify(
            config(ServerConfig::builder()),
            request("POST", "/").with("content-length", "ten"),
        );
        assert_eq!(cause(&outcome), "improper header (content length)");
    }

    #[tokio::test]
    async fn test_url_defaults_to_https_and_sni() {
        let headers = HeaderSet::new()
            .with(PSEUDO_METHOD, "GET")
            .with(PSEUDO_PATH, "/x");
        let outcome = classify(config(ServerConfig::builder()), headers);
        assert_eq!(
            outcome.request().unwrap().url.as_str(),
            "https://api.example/x"
        );
    }

    #[tokio::test]
    async fn test_options_is_preflight_without_body() {
        let (classifier, reader) = classifier_with(config(ServerConfig::builder()));
        let outcome = classify_with(
            &classifier,
            request("OPTIONS", "/items").with("content-length", "5"),
            &tls(),
            GracefulShutdown::new().shutdown_token(),
        );

        assert_eq!(outcome.kind(), "preflight");
        assert_eq!(reader.reads.load(Ordering::SeqCst), 0);
        assert_eq!(outcome.meta().timings[0].name, TIMING_PREFLIGHT);
    }

    #[tokio::test]
    async fn test_trace_matrix() {
        let disabled = config(ServerConfig::builder());
        let enabled = config(ServerConfig::builder().allow_trace(true));

        let outcome = classify(disabled, request("TRACE", "/").with("accept", "message/http"));
        assert_eq!(outcome.kind(), "not-allowed");

        let outcome = classify(
            enabled.clone(),
            request("TRACE", "/").with("accept", "application/json"),
        );
        match &outcome.route {
            Route::ClientError(ClientError::NotAcceptable { media_types, .. }) => {
                assert_eq!(media_types, &vec![MIME_TYPE_MESSAGE_HTTP.to_string()])
            }
            other => panic!("unexpected {}", other.kind()),
        }

        let outcome = classify(
            enabled,
            request("TRACE", "/")
                .with("accept", "message/http")
                .with("max-forwards", "3"),
        );
        match &outcome.route {
            Route::Trace(trace) => assert_eq!(trace.max_forwards, 3),
            other => panic!("unexpected {}", other.kind()),
        }
        assert_eq!(outcome.meta().timings[0].name, TIMING_TRACE);
    }

    #[tokio::test]
    async fn test_forwarded_required() {
        let cfg = config(ServerConfig::builder().forwarded(TrustPolicy {
            required: true,
            ..TrustPolicy::default()
        }));

        assert_eq!(cause(&classify(cfg.clone(), request("GET", "/"))), "forwarded required");

        let no_for = request("GET", "/").with("forwarded", "proto=https;by=proxy");
        assert_eq!(cause(&classify(cfg.clone(), no_for)), "forwarded for required");

        let ok = request("GET", "/").with("forwarded", "for=198.51.100.7");
        assert_eq!(classify(cfg, ok).kind(), "request");
    }

    #[tokio::test]
    async fn test_forwarded_secret_and_skip_list() {
        let cfg = config(ServerConfig::builder().forwarded(TrustPolicy {
            required: true,
            secret: Some("s3cret".to_string()),
            skip_list: vec!["10.0.0.1".to_string()],
        }));

        // the right-most hop is a skipped internal proxy; the one before it carries the secret
        let trusted = request("GET", "/")
            .with("forwarded", "for=198.51.100.7;secret=s3cret, for=10.0.0.1");
        assert_eq!(classify(cfg.clone(), trusted).kind(), "request");

        let wrong = request("GET", "/").with("forwarded", "for=198.51.100.7;secret=nope");
        assert_eq!(cause(&classify(cfg.clone(), wrong)), "forwarded invalid");

        let missing = request("GET", "/").with("forwarded", "for=198.51.100.7");
        assert_eq!(cause(&classify(cfg, missing)), "forwarded invalid");
    }

    #[tokio::test]
    async fn test_forwarded_secret_with_separators() {
        let cfg = config(ServerConfig::builder().forwarded(TrustPolicy {
            required: true,
            secret: Some("a,b".to_string()),
            skip_list: Vec::new(),
        }));

        let quoted = request("GET", "/").with("forwarded", r#"for=198.51.100.7;secret="a,b""#);
        assert_eq!(classify(cfg, quoted).kind(), "request");
    }

    #[tokio::test]
    async fn test_origin_allow_list() {
        let cfg = config(ServerConfig::builder().allowed_origin("https://a.example"));

        let denied = classify(cfg.clone(), request("GET", "/").with("origin", "https://b.example"));
        assert_eq!(denied.meta().origin, None);

        let allowed = classify(cfg, request("GET", "/").with("origin", "https://a.example"));
        assert_eq!(allowed.meta().origin.as_deref(), Some("https://a.example"));

        let any = config(ServerConfig::builder().allowed_origin("*"));
        let outcome = classify(any, request("GET", "/").with("origin", "https://c.example"));
        assert_eq!(outcome.meta().origin.as_deref(), Some("https://c.example"));
    }

    #[tokio::test]
    async fn test_error_outcomes_keep_envelope() {
        let cfg = config(ServerConfig::builder().allowed_origin("*"));
        let outcome = classify(cfg, request("BREW", "/").with("origin", "https://c.example"));
        assert_eq!(outcome.kind(), "not-implemented");
        assert_eq!(outcome.meta().origin.as_deref(), Some("https://c.example"));
        assert_eq!(outcome.stream_id().as_str().len(), 10);
    }

    #[tokio::test]
    async fn test_conditions_are_parsed() {
        let outcome = classify(
            config(ServerConfig::builder()),
            request("GET", "/")
                .with("if-none-match", "\"a\", W/\"b\"")
                .with("if-range", "\"c\"")
                .with("if-modified-since", "Sun, 06 Nov 1994 08:49:37 GMT"),
        );
        let conditions = &outcome.request().unwrap().conditions;
        assert_eq!(conditions.if_none_match.len(), 2);
        assert!(conditions.if_none_match[1].weak);
        assert!(conditions.if_modified_since.is_some());
        assert!(matches!(conditions.if_range, Some(RangeValidator::ETag(_))));
    }

    #[tokio::test]
    async fn test_classification_is_idempotent() {
        let cfg = config(ServerConfig::builder());
        let headers = request("PUT", "/items/1")
            .with("accept", "text/plain")
            .with("accept-language", "en")
            .with("if-match", "\"v1\"");

        let a = classify(cfg.clone(), headers.clone());
        let b = classify(cfg, headers);
        let (a, b) = (a.request().unwrap(), b.request().unwrap());
        assert_eq!(a.method, b.method);
        assert_eq!(a.url, b.url);
        assert_eq!(a.accept, b.accept);
        assert_eq!(a.conditions, b.conditions);
        assert_eq!(a.headers, b.headers);
        assert_eq!(a.client, b.client);
    }
}
