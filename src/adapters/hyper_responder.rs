//! Renders outcomes as `http::Response`s for the hyper HTTP/2 server.
//!
//! Every response carries the metadata headers in the same order:
//! variant headers first, then `access-control-allow-origin` / `vary`,
//! `server-timing`, and finally the custom headers, so `x-request-id` is
//! always the last header written.
use std::convert::Infallible;

use axum::body::Body;
use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use http::{
    HeaderValue, Method, StatusCode,
    header::{self, HeaderName},
    response::Builder,
};
use hyper::Response;
use rand::RngCore;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::{
    core::{
        event_stream::EVENT_STREAM_BOM,
        headers::PSEUDO_AUTHORITY,
        outcome::{
            AcceptRanges, BytesPayload, ClientError, ContentRange, Informational, JsonPayload,
            MIME_TYPE_EVENT_STREAM, MIME_TYPE_JSON, MIME_TYPE_MESSAGE_HTTP, MIME_TYPE_TEXT,
            Metadata, PartialBytesPayload, Preflight, RedirectKind, ServerError, Trace,
        },
        stream::StreamHandle,
    },
    ports::{
        header_semantics::EntityTag,
        responder::{EventSink, Responder, ResponderError, ResponderResult},
    },
};

const PRIVATE_CACHE_CONTROL: &str = "private, max-age=60";

/// Headers never echoed back by `TRACE`.
const TRACE_REDACTED_HEADERS: [&str; 3] = ["authorization", "proxy-authorization", "cookie"];

static ACCEPT_QUERY: HeaderName = HeaderName::from_static("accept-query");
static ACCEPT_POST: HeaderName = HeaderName::from_static("accept-post");
static RATE_LIMIT: HeaderName = HeaderName::from_static("ratelimit");
static RATE_LIMIT_POLICY: HeaderName = HeaderName::from_static("ratelimit-policy");
static SERVER_TIMING: HeaderName = HeaderName::from_static("server-timing");

#[derive(Debug, Clone, Copy, Default)]
pub struct HyperResponder;

impl HyperResponder {
    pub fn new() -> Self {
        Self
    }
}

fn join<T: AsRef<str>>(items: &[T]) -> String {
    items
        .iter()
        .map(|item| item.as_ref())
        .collect::<Vec<_>>()
        .join(", ")
}

fn join_methods(methods: &[Method]) -> String {
    methods
        .iter()
        .map(Method::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

fn with_etag(builder: Builder, etag: Option<&EntityTag>) -> Builder {
    match etag {
        Some(etag) => builder.header(header::ETAG, etag.to_string()),
        None => builder,
    }
}

fn with_age(builder: Builder, age: Option<u64>) -> Builder {
    match age {
        Some(age) => builder.header(header::AGE, age),
        None => builder,
    }
}

fn with_list(builder: Builder, name: &HeaderName, values: &str) -> Builder {
    if values.is_empty() {
        builder
    } else {
        builder.header(name, values)
    }
}

fn content_range(range: &ContentRange, full_length: Option<u64>) -> String {
    match full_length {
        Some(length) => format!("bytes {}-{}/{}", range.start, range.end, length),
        None => format!("bytes {}-{}/*", range.start, range.end),
    }
}

fn header_error(name: &str, reason: impl ToString) -> ResponderError {
    ResponderError::InvalidHeader {
        name: name.to_string(),
        reason: reason.to_string(),
    }
}

/// Append the shared metadata headers and build.
fn finish(mut builder: Builder, meta: &Metadata, body: Body) -> ResponderResult<Response<Body>> {
    if let Some(origin) = &meta.origin {
        builder = builder
            .header(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin)
            .header(header::VARY, "origin");
    }

    if !meta.timings.is_empty() {
        let timing = meta
            .timings
            .iter()
            .map(|t| format!("{};dur={:.3}", t.name, t.duration.as_secs_f64() * 1000.0))
            .collect::<Vec<_>>()
            .join(", ");
        builder = builder.header(&SERVER_TIMING, timing);
    }

    let mut response = builder.body(body)?;
    let headers = response.headers_mut();
    for (name, value) in &meta.custom_headers {
        let header_name =
            HeaderName::from_bytes(name.as_bytes()).map_err(|e| header_error(name, e))?;
        let header_value = HeaderValue::from_str(value).map_err(|e| header_error(name, e))?;
        headers.append(header_name, header_value);
    }

    Ok(response)
}

fn text(message: &str) -> Body {
    Body::from(message.to_string())
}

fn deliver(
    stream: &StreamHandle,
    meta: &Metadata,
    builder: Builder,
    body: Body,
) -> ResponderResult<()> {
    stream.respond(finish(builder, meta, body)?)
}

fn status(code: StatusCode) -> Builder {
    Response::builder().status(code)
}

fn trace_message(trace: &Trace) -> String {
    let target = match trace.url.query() {
        Some(query) => format!("{}?{}", trace.url.path(), query),
        None => trace.url.path().to_string(),
    };
    let mut message = format!("{} {} HTTP/2\r\n", trace.method, target);

    if let Ok(Some(authority)) = trace.headers.single(PSEUDO_AUTHORITY) {
        message.push_str(&format!("host: {authority}\r\n"));
    }
    for (name, value) in trace.headers.iter() {
        if name.starts_with(':') || TRACE_REDACTED_HEADERS.contains(&name) {
            continue;
        }
        message.push_str(&format!("{name}: {value}\r\n"));
    }
    message.push_str("\r\n");
    message
}

fn multipart_boundary() -> String {
    let mut buffer = [0u8; 12];
    rand::rng().fill_bytes(&mut buffer);
    buffer.iter().map(|b| format!("{b:02x}")).collect()
}

impl Responder for HyperResponder {
    fn send_preflight(
        &self,
        stream: &StreamHandle,
        meta: &Metadata,
        preflight: &Preflight,
    ) -> ResponderResult<()> {
        let methods = join_methods(&preflight.methods);
        let mut builder = status(StatusCode::NO_CONTENT);
        builder = with_list(builder, &header::ALLOW, &methods);
        builder = with_list(builder, &header::ACCESS_CONTROL_ALLOW_METHODS, &methods);
        builder = with_list(builder, &ACCEPT_QUERY, &join(&preflight.query_types));
        deliver(stream, meta, builder, Body::empty())
    }

    fn send_trace(
        &self,
        stream: &StreamHandle,
        meta: &Metadata,
        trace: &Trace,
    ) -> ResponderResult<()> {
        let builder = status(StatusCode::OK).header(header::CONTENT_TYPE, MIME_TYPE_MESSAGE_HTTP);
        deliver(stream, meta, builder, Body::from(trace_message(trace)))
    }

    fn send_informational(
        &self,
        stream: &StreamHandle,
        meta: &Metadata,
        informational: &Informational,
    ) -> ResponderResult<()> {
        let builder = match informational {
            Informational::Created { location, etag } => with_etag(
                status(StatusCode::CREATED).header(header::LOCATION, location),
                etag.as_ref(),
            ),
            Informational::NotModified { etag, age } => with_age(
                with_etag(status(StatusCode::NOT_MODIFIED), etag.as_ref()),
                *age,
            )
            .header(header::CACHE_CONTROL, PRIVATE_CACHE_CONTROL),
            Informational::NoContent { etag } => {
                with_etag(status(StatusCode::NO_CONTENT), etag.as_ref())
            }
            Informational::Gone => status(StatusCode::GONE),
        };
        deliver(stream, meta, builder, Body::empty())
    }

    fn send_redirect(
        &self,
        stream: &StreamHandle,
        meta: &Metadata,
        kind: RedirectKind,
        location: &str,
    ) -> ResponderResult<()> {
        let code = match kind {
            RedirectKind::MovedPermanently => StatusCode::MOVED_PERMANENTLY,
            RedirectKind::SeeOther => StatusCode::SEE_OTHER,
            RedirectKind::TemporaryRedirect => StatusCode::TEMPORARY_REDIRECT,
            RedirectKind::PermanentRedirect => StatusCode::PERMANENT_REDIRECT,
        };
        deliver(
            stream,
            meta,
            status(code).header(header::LOCATION, location),
            Body::empty(),
        )
    }

    fn send_client_error(
        &self,
        stream: &StreamHandle,
        meta: &Metadata,
        error: &ClientError,
    ) -> ResponderResult<()> {
        let plain = |code| status(code).header(header::CONTENT_TYPE, MIME_TYPE_TEXT);

        let (builder, body) = match error {
            ClientError::NotFound { message } => (plain(StatusCode::NOT_FOUND), text(message)),
            ClientError::Conflict { message } => (
                plain(StatusCode::CONFLICT),
                message.as_deref().map(text).unwrap_or_default(),
            ),
            ClientError::NotAllowed { methods, .. } => (
                with_list(
                    status(StatusCode::METHOD_NOT_ALLOWED),
                    &header::ALLOW,
                    &join_methods(methods),
                ),
                Body::empty(),
            ),
            ClientError::NotAcceptable {
                media_types,
                encodings,
                languages,
            } => {
                let body = serde_json::json!({
                    "acceptable": {
                        "media_types": media_types,
                        "encodings": encodings,
                        "languages": languages,
                    }
                });
                (
                    status(StatusCode::NOT_ACCEPTABLE).header(header::CONTENT_TYPE, MIME_TYPE_JSON),
                    Body::from(body.to_string()),
                )
            }
            ClientError::UnsupportedMedia {
                media_types,
                query_types,
            } => {
                let mut builder = status(StatusCode::UNSUPPORTED_MEDIA_TYPE);
                builder = with_list(builder, &ACCEPT_POST, &join(media_types));
                builder = with_list(builder, &ACCEPT_QUERY, &join(query_types));
                (builder, Body::empty())
            }
            ClientError::Unprocessable { message } => (
                plain(StatusCode::UNPROCESSABLE_ENTITY),
                message.as_deref().map(text).unwrap_or_default(),
            ),
            ClientError::PreconditionFailed { etag } => (
                with_etag(status(StatusCode::PRECONDITION_FAILED), etag.as_ref()),
                Body::empty(),
            ),
            ClientError::NotSatisfiable { content_length } => (
                status(StatusCode::RANGE_NOT_SATISFIABLE)
                    .header(header::CONTENT_RANGE, format!("bytes */{content_length}")),
                Body::empty(),
            ),
            ClientError::ContentTooLarge => (status(StatusCode::PAYLOAD_TOO_LARGE), Body::empty()),
            ClientError::Unauthorized { challenge } => (
                status(StatusCode::UNAUTHORIZED).header(header::WWW_AUTHENTICATE, challenge),
                Body::empty(),
            ),
            ClientError::Forbidden => (status(StatusCode::FORBIDDEN), Body::empty()),
            ClientError::TooManyRequests { limit, policies } => {
                let policy = policies
                    .iter()
                    .map(|p| format!("\"{}\";q={};w={}", p.name, p.quota, p.window_seconds))
                    .collect::<Vec<_>>()
                    .join(", ");
                let builder = with_list(
                    status(StatusCode::TOO_MANY_REQUESTS)
                        .header(header::RETRY_AFTER, limit.reset_seconds)
                        .header(
                            &RATE_LIMIT,
                            format!(
                                "\"{}\";r={};t={}",
                                limit.policy, limit.remaining, limit.reset_seconds
                            ),
                        ),
                    &RATE_LIMIT_POLICY,
                    &policy,
                );
                (builder, Body::empty())
            }
        };

        deliver(stream, meta, builder, body)
    }

    fn send_server_error(
        &self,
        stream: &StreamHandle,
        meta: &Metadata,
        error: &ServerError,
    ) -> ResponderResult<()> {
        let plain = |code| status(code).header(header::CONTENT_TYPE, MIME_TYPE_TEXT);

        let (builder, body) = match error {
            ServerError::Unavailable {
                message,
                retry_after,
            } => {
                let mut builder = plain(StatusCode::SERVICE_UNAVAILABLE);
                if let Some(seconds) = retry_after {
                    builder = builder.header(header::RETRY_AFTER, *seconds);
                }
                (builder, message.as_deref().map(text).unwrap_or_default())
            }
            ServerError::NotImplemented { message } => (
                plain(StatusCode::NOT_IMPLEMENTED),
                message.as_deref().map(text).unwrap_or_default(),
            ),
            ServerError::InsufficientStorage => {
                (status(StatusCode::INSUFFICIENT_STORAGE), Body::empty())
            }
            ServerError::Timeout => (status(StatusCode::REQUEST_TIMEOUT), Body::empty()),
            ServerError::Internal { cause, .. } => {
                (plain(StatusCode::INTERNAL_SERVER_ERROR), text(cause))
            }
        };

        deliver(stream, meta, builder, body)
    }

    fn send_json(
        &self,
        stream: &StreamHandle,
        meta: &Metadata,
        payload: &JsonPayload,
    ) -> ResponderResult<()> {
        let body = serde_json::to_vec(&payload.value)
            .map_err(|e| ResponderError::Build(format!("json encoding failed: {e}")))?;

        let mut builder = status(StatusCode::OK)
            .header(header::CONTENT_TYPE, MIME_TYPE_JSON)
            .header(header::CACHE_CONTROL, PRIVATE_CACHE_CONTROL);
        if let Some(language) = &payload.accept.language {
            builder = builder.header(header::CONTENT_LANGUAGE, language);
        }
        builder = with_age(with_etag(builder, payload.etag.as_ref()), payload.age);
        builder = with_list(builder, &ACCEPT_QUERY, &join(&payload.query_types));

        deliver(stream, meta, builder, Body::from(body))
    }

    fn send_bytes(
        &self,
        stream: &StreamHandle,
        meta: &Metadata,
        payload: &BytesPayload,
    ) -> ResponderResult<()> {
        let mut builder =
            status(StatusCode::OK).header(header::CONTENT_TYPE, &payload.content_type);
        if let Some(length) = payload.content_length {
            builder = builder.header(header::CONTENT_LENGTH, length);
        }
        if let Some(max_age) = payload.max_age {
            builder = builder.header(header::CACHE_CONTROL, format!("max-age={max_age}"));
        }
        if let Some(ranges) = payload.accept_ranges {
            let value = match ranges {
                AcceptRanges::Bytes => "bytes",
                AcceptRanges::None => "none",
            };
            builder = builder.header(header::ACCEPT_RANGES, value);
        }
        builder = with_age(with_etag(builder, payload.etag.as_ref()), payload.age);

        deliver(stream, meta, builder, Body::from(payload.body.clone()))
    }

    fn send_partial_bytes(
        &self,
        stream: &StreamHandle,
        meta: &Metadata,
        payload: &PartialBytesPayload,
    ) -> ResponderResult<()> {
        let mut builder = status(StatusCode::PARTIAL_CONTENT);
        if let Some(max_age) = payload.max_age {
            builder = builder.header(header::CACHE_CONTROL, format!("max-age={max_age}"));
        }
        builder = with_age(with_etag(builder, payload.etag.as_ref()), payload.age);

        let body = if payload.parts.is_single() {
            let part = payload.parts.iter().next().ok_or_else(|| {
                ResponderError::Build("partial content without parts".to_string())
            })?;
            builder = builder
                .header(header::CONTENT_TYPE, &payload.content_type)
                .header(
                    header::CONTENT_RANGE,
                    content_range(&part.range, payload.content_length),
                );
            part.body.clone()
        } else {
            let boundary = multipart_boundary();
            builder = builder.header(
                header::CONTENT_TYPE,
                format!("multipart/byteranges; boundary={boundary}"),
            );

            let mut body = BytesMut::new();
            for part in payload.parts.iter() {
                body.extend_from_slice(
                    format!(
                        "--{boundary}\r\ncontent-type: {}\r\ncontent-range: {}\r\n\r\n",
                        payload.content_type,
                        content_range(&part.range, payload.content_length)
                    )
                    .as_bytes(),
                );
                body.extend_from_slice(&part.body);
                body.extend_from_slice(b"\r\n");
            }
            body.extend_from_slice(format!("--{boundary}--\r\n").as_bytes());
            body.freeze()
        };

        deliver(stream, meta, builder, Body::from(body))
    }

    fn open_event_stream(
        &self,
        stream: &StreamHandle,
        meta: &Metadata,
        bom: bool,
    ) -> ResponderResult<EventSink> {
        let (tx, rx) = mpsc::unbounded_channel::<Bytes>();
        if bom {
            // the receiver is alive, so this cannot fail
            let _ = tx.send(Bytes::from_static(EVENT_STREAM_BOM.as_bytes()));
        }

        let body = Body::from_stream(UnboundedReceiverStream::new(rx).map(Ok::<_, Infallible>));
        let builder = status(StatusCode::OK)
            .header(header::CONTENT_TYPE, MIME_TYPE_EVENT_STREAM)
            .header(header::CACHE_CONTROL, "no-cache");

        deliver(stream, meta, builder, body)?;
        Ok(EventSink::new(tx))
    }
}
