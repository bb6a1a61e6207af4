//! Epilogue: renders any outcome through the [`Responder`] port.
use std::sync::Arc;

use url::Url;

use crate::{
    core::{
        headers::HEADER_REQUEST_ID,
        outcome::{
            ClientError, Envelope, Informational, MIME_TYPE_JSON, Metadata, Outcome, Route,
            ServerError,
        },
        sse_bridge,
    },
    ports::responder::{Responder, ResponderResult},
};

#[derive(Clone)]
pub struct Epilogue {
    responder: Arc<dyn Responder>,
}

/// Resolve a `created` location against the request origin, falling back to
/// the server name. Locations that cannot be resolved are sent as given.
fn resolve_location(location: &str, meta: &Metadata) -> String {
    let base = meta
        .origin
        .clone()
        .or_else(|| meta.server_name.as_ref().map(|name| format!("https://{name}")));

    base.and_then(|base| Url::parse(&base).ok())
        .and_then(|base| base.join(location).ok())
        .map(String::from)
        .unwrap_or_else(|| location.to_string())
}

impl Epilogue {
    pub fn new(responder: Arc<dyn Responder>) -> Self {
        Self { responder }
    }

    /// Render `outcome` as exactly one response on its stream.
    pub fn render(&self, outcome: Outcome) -> ResponderResult<()> {
        let Outcome {
            mut envelope,
            route,
        } = outcome;
        envelope
            .meta
            .push_header(HEADER_REQUEST_ID, envelope.stream_id.as_str());

        let Envelope {
            stream_id,
            stream,
            meta,
            shutdown,
            ..
        } = &envelope;
        let responder = self.responder.as_ref();

        match route {
            Route::Preflight(preflight) => responder.send_preflight(stream, meta, &preflight),
            Route::Trace(trace) => responder.send_trace(stream, meta, &trace),
            Route::Informational(Informational::Created { location, etag }) => {
                let created = Informational::Created {
                    location: resolve_location(&location, meta),
                    etag,
                };
                responder.send_informational(stream, meta, &created)
            }
            Route::Informational(informational) => {
                responder.send_informational(stream, meta, &informational)
            }
            Route::Redirect { kind, location } => {
                responder.send_redirect(stream, meta, kind, &location)
            }
            Route::ClientError(error) => responder.send_client_error(stream, meta, &error),
            Route::ServerError(error) => {
                if let ServerError::Internal { cause, fault } = &error {
                    match fault {
                        Some(fault) => tracing::error!(
                            stream_id = %stream_id,
                            %cause,
                            fault = ?fault,
                            "sending error"
                        ),
                        None => tracing::warn!(stream_id = %stream_id, %cause, "sending error"),
                    }
                }
                responder.send_server_error(stream, meta, &error)
            }
            Route::Json(payload) => {
                if payload.accept.media_type.as_deref() == Some(MIME_TYPE_JSON) {
                    responder.send_json(stream, meta, &payload)
                } else {
                    // already processed, but the client cannot take json
                    responder.send_client_error(
                        stream,
                        meta,
                        &ClientError::NotAcceptable {
                            media_types: vec![MIME_TYPE_JSON.to_string()],
                            encodings: Vec::new(),
                            languages: Vec::new(),
                        },
                    )
                }
            }
            Route::Bytes(payload) => responder.send_bytes(stream, meta, &payload),
            Route::PartialBytes(payload) => responder.send_partial_bytes(stream, meta, &payload),
            Route::Sse(event_stream) => {
                let sink = responder.open_event_stream(stream, meta, event_stream.bom)?;
                if event_stream.active {
                    sse_bridge::install(
                        stream_id.clone(),
                        sink,
                        event_stream.port,
                        shutdown.clone(),
                    );
                } else {
                    sink.end();
                }
                Ok(())
            }
            Route::Unrecognized { kind } => {
                let cause = format!("unknown type {kind}");
                tracing::warn!(stream_id = %stream_id, %cause, "sending error");
                responder.send_server_error(
                    stream,
                    meta,
                    &ServerError::Internal { cause, fault: None },
                )
            }
            Route::Request(_) => {
                tracing::error!(stream_id = %stream_id, "request outcome reached the epilogue");
                responder.send_server_error(
                    stream,
                    meta,
                    &ServerError::Internal {
                        cause: "unhandled request".to_string(),
                        fault: None,
                    },
                )
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Mutex;

    use axum::body::Body;
    use bytes::Bytes;
    use tokio::sync::mpsc;

    use super::*;
    use crate::{
        config::ServerConfig,
        core::{
            event_stream::{SseMessage, sse_channel},
            outcome::{
                Accept, BytesPayload, EventStream, JsonPayload, PartialBytesPayload, Preflight,
                RedirectKind, RouteRequest, Trace,
            },
            stream::{StreamHandle, StreamId},
        },
        ports::{
            body_reader::{BodyError, PendingBody},
            responder::{EventSink, ResponderError},
        },
        utils::graceful_shutdown::GracefulShutdown,
    };

    /// One recorded responder call: method name, detail and custom headers.
    #[derive(Debug, Clone, PartialEq)]
    pub(crate) struct Call {
        pub method: &'static str,
        pub detail: String,
        pub headers: Vec<(String, String)>,
    }

    /// Responder that records calls instead of writing responses.
    #[derive(Default)]
    pub(crate) struct RecordingResponder {
        pub calls: Mutex<Vec<Call>>,
        pub fail_first: Mutex<bool>,
        pub wire: Mutex<Option<mpsc::UnboundedReceiver<Bytes>>>,
    }

    impl RecordingResponder {
        fn record(
            &self,
            method: &'static str,
            detail: String,
            meta: &Metadata,
        ) -> ResponderResult<()> {
            let mut fail = self.fail_first.lock().unwrap();
            if *fail {
                *fail = false;
                return Err(ResponderError::Build("first render fails".to_string()));
            }
            self.calls.lock().unwrap().push(Call {
                method,
                detail,
                headers: meta.custom_headers.clone(),
            });
            Ok(())
        }

        pub fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl Responder for RecordingResponder {
        fn send_preflight(
            &self,
            _: &StreamHandle,
            meta: &Metadata,
            _: &Preflight,
        ) -> ResponderResult<()> {
            self.record("preflight", String::new(), meta)
        }

        fn send_trace(&self, _: &StreamHandle, meta: &Metadata, _: &Trace) -> ResponderResult<()> {
            self.record("trace", String::new(), meta)
        }

        fn send_informational(
            &self,
            _: &StreamHandle,
            meta: &Metadata,
            informational: &Informational,
        ) -> ResponderResult<()> {
            let detail = match informational {
                Informational::Created { location, .. } => location.clone(),
                other => format!("{other:?}"),
            };
            self.record("informational", detail, meta)
        }

        fn send_redirect(
            &self,
            _: &StreamHandle,
            meta: &Metadata,
            kind: RedirectKind,
            location: &str,
        ) -> ResponderResult<()> {
            self.record("redirect", format!("{} {location}", kind.kind()), meta)
        }

        fn send_client_error(
            &self,
            _: &StreamHandle,
            meta: &Metadata,
            error: &ClientError,
        ) -> ResponderResult<()> {
            self.record("client_error", error.kind().to_string(), meta)
        }

        fn send_server_error(
            &self,
            _: &StreamHandle,
            meta: &Metadata,
            error: &ServerError,
        ) -> ResponderResult<()> {
            let detail = match error {
                ServerError::Internal { cause, .. } => cause.clone(),
                other => other.kind().to_string(),
            };
            self.record("server_error", detail, meta)
        }

        fn send_json(
            &self,
            _: &StreamHandle,
            meta: &Metadata,
            payload: &JsonPayload,
        ) -> ResponderResult<()> {
            self.record("json", payload.value.to_string(), meta)
        }

        fn send_bytes(
            &self,
            _: &StreamHandle,
            meta: &Metadata,
            _: &BytesPayload,
        ) -> ResponderResult<()> {
            self.record("bytes", String::new(), meta)
        }

        fn send_partial_bytes(
            &self,
            _: &StreamHandle,
            meta: &Metadata,
            _: &PartialBytesPayload,
        ) -> ResponderResult<()> {
            self.record("partial_bytes", String::new(), meta)
        }

        fn open_event_stream(
            &self,
            _: &StreamHandle,
            meta: &Metadata,
            bom: bool,
        ) -> ResponderResult<EventSink> {
            self.record("event_stream", format!("bom={bom}"), meta)?;
            let (tx, rx) = mpsc::unbounded_channel();
            *self.wire.lock().unwrap() = Some(rx);
            Ok(EventSink::new(tx))
        }
    }

    pub(crate) fn envelope(shutdown: &GracefulShutdown) -> Envelope {
        let stream_id = StreamId::from("0a1b2c3d4e");
        let (stream, _rx) = StreamHandle::new(stream_id.clone(), Body::empty());
        Envelope {
            stream_id,
            stream,
            meta: Metadata::default(),
            shutdown: shutdown.shutdown_token(),
            config: Arc::new(ServerConfig::default()),
        }
    }

    fn render(route: Route) -> (Arc<RecordingResponder>, ResponderResult<()>) {
        let responder = Arc::new(RecordingResponder::default());
        let epilogue = Epilogue::new(responder.clone());
        let shutdown = GracefulShutdown::new();
        let result = epilogue.render(Outcome::new(envelope(&shutdown), route));
        (responder, result)
    }

    fn json_accept() -> Accept {
        Accept {
            media_type: Some(MIME_TYPE_JSON.to_string()),
            ..Accept::default()
        }
    }

    #[test]
    fn test_request_id_is_last_custom_header() {
        let responder = Arc::new(RecordingResponder::default());
        let shutdown = GracefulShutdown::new();
        let mut envelope = envelope(&shutdown);
        envelope.meta.push_header("x-app", "1");

        Epilogue::new(responder.clone())
            .render(Outcome::new(envelope, Route::not_found("missing")))
            .unwrap();

        let call = &responder.calls()[0];
        assert_eq!(call.method, "client_error");
        assert_eq!(
            call.headers.last().unwrap(),
            &("X-Request-Id".to_string(), "0a1b2c3d4e".to_string())
        );
    }

    #[test]
    fn test_unrecognized_renders_internal_error() {
        let (responder, result) = render(Route::from_kind("teapot"));
        result.unwrap();
        assert_eq!(responder.calls()[0].detail, "unknown type teapot");
    }

    #[test]
    fn test_request_reaching_epilogue_is_unhandled() {
        let request = RouteRequest {
            method: http::Method::GET,
            url: "https://api.example/".parse().unwrap(),
            headers: Default::default(),
            accept: Accept::default(),
            conditions: Default::default(),
            client: Default::default(),
            body: PendingBody::ready(Err(BodyError::AlreadyConsumed)),
            sni: "api.example".to_string(),
        };

        let (responder, result) = render(Route::Request(Box::new(request)));
        result.unwrap();
        assert_eq!(responder.calls()[0].detail, "unhandled request");
    }

    #[test]
    fn test_json_downgrade() {
        let (responder, _) = render(Route::json(json_accept(), serde_json::json!({"ok": true})));
        assert_eq!(responder.calls()[0].method, "json");

        let xml = Accept {
            media_type: Some("application/xml".to_string()),
            ..Accept::default()
        };
        let (responder, _) = render(Route::json(xml, serde_json::json!({})));
        assert_eq!(responder.calls()[0].detail, "not-acceptable");
    }

    #[test]
    fn test_created_location_resolution() {
        let responder = Arc::new(RecordingResponder::default());
        let shutdown = GracefulShutdown::new();
        let mut envelope = envelope(&shutdown);
        envelope.meta.server_name = Some("api.example".to_string());

        Epilogue::new(responder.clone())
            .render(Outcome::new(
                envelope,
                Route::Informational(Informational::Created {
                    location: "/items/7".to_string(),
                    etag: None,
                }),
            ))
            .unwrap();
        assert_eq!(responder.calls()[0].detail, "https://api.example/items/7");
    }

    #[test]
    fn test_redirect_passes_kind() {
        let (responder, _) = render(Route::redirect(RedirectKind::PermanentRedirect, "/b"));
        assert_eq!(responder.calls()[0].detail, "permanent-redirect /b");
    }

    #[tokio::test]
    async fn test_inactive_sse_ends_immediately() {
        let (_sender, port) = sse_channel();
        let (responder, result) = render(Route::Sse(EventStream {
            active: false,
            bom: true,
            port,
            accept: Accept::default(),
        }));
        result.unwrap();

        assert_eq!(responder.calls()[0].detail, "bom=true");
        let mut wire = responder.wire.lock().unwrap().take().unwrap();
        assert!(wire.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_active_sse_bridges_messages() {
        let (sender, port) = sse_channel();
        let (responder, result) = render(Route::sse(port, Accept::default()));
        result.unwrap();

        let mut wire = responder.wire.lock().unwrap().take().unwrap();
        sender.send(SseMessage::new("hello")).unwrap();
        assert_eq!(wire.recv().await.unwrap(), "data: hello\n\n");

        drop(sender);
        assert!(wire.recv().await.is_none());
    }
}
