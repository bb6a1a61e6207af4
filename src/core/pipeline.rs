//! Per-stream pipeline: classify, dispatch, render.
//!
//! Classification and rendering never suspend. The only awaits are the
//! dispatcher and whatever it awaits, the pending body included.
use std::{any::Any, panic::AssertUnwindSafe, sync::Arc};

use futures_util::FutureExt;

use crate::{
    core::{
        epilogue::Epilogue,
        headers::HeaderSet,
        outcome::{Envelope, Outcome, Route},
        preamble::PreambleClassifier,
        stream::{ConnectionInfo, StreamHandle, StreamId},
    },
    ports::route_dispatcher::RouteDispatcher,
    utils::graceful_shutdown::ShutdownToken,
};

pub struct StreamPipeline<D: ?Sized> {
    classifier: PreambleClassifier,
    dispatcher: Arc<D>,
    epilogue: Epilogue,
}

impl<D: ?Sized> Clone for StreamPipeline<D> {
    fn clone(&self) -> Self {
        Self {
            classifier: self.classifier.clone(),
            dispatcher: self.dispatcher.clone(),
            epilogue: self.epilogue.clone(),
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("dispatcher panicked: {message}")
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("dispatcher panicked: {message}")
    } else {
        "dispatcher panicked".to_string()
    }
}

impl<D: RouteDispatcher + ?Sized> StreamPipeline<D> {
    pub fn new(classifier: PreambleClassifier, dispatcher: Arc<D>, epilogue: Epilogue) -> Self {
        Self {
            classifier,
            dispatcher,
            epilogue,
        }
    }

    pub fn classifier(&self) -> &PreambleClassifier {
        &self.classifier
    }

    /// Drive one stream to exactly one rendered response.
    pub async fn run(
        &self,
        stream_id: StreamId,
        stream: StreamHandle,
        headers: HeaderSet,
        connection: &ConnectionInfo,
        shutdown: ShutdownToken,
    ) {
        let outcome = self
            .classifier
            .classify(stream_id, stream, headers, connection, shutdown);
        let classified = outcome.envelope.clone();

        let outcome = match outcome.route {
            Route::Request(_) => self.dispatch(outcome).await,
            _ => outcome,
        };

        self.render_or_recover(outcome, classified);
    }

    /// Hand a request to the dispatcher. Failures and panics become `error`.
    pub async fn dispatch(&self, outcome: Outcome) -> Outcome {
        let envelope = outcome.envelope.clone();

        match AssertUnwindSafe(self.dispatcher.dispatch(outcome))
            .catch_unwind()
            .await
        {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(report)) => Outcome::new(envelope, Route::fault(report.to_string(), report)),
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                let report = eyre::eyre!(message.clone());
                Outcome::new(envelope, Route::fault(message, report))
            }
        }
    }

    /// Render, retrying once as an internal error. A second failure is only
    /// logged; the server answers for streams left without a response.
    pub fn render(&self, outcome: Outcome) {
        let recovery = outcome.envelope.clone();
        self.render_or_recover(outcome, recovery);
    }

    // The retry goes out on `recovery` without custom headers, since those
    // may be what broke the first render.
    fn render_or_recover(&self, outcome: Outcome, mut recovery: Envelope) {
        let kind = outcome.kind().to_string();
        tracing::Span::current().record("kind", kind.as_str());

        let Err(error) = self.epilogue.render(outcome) else {
            return;
        };
        tracing::warn!(
            stream_id = %recovery.stream_id,
            kind = %kind,
            %error,
            "render failed, sending error instead"
        );

        recovery.meta.custom_headers.clear();
        let stream_id = recovery.stream_id.clone();
        let fallback = Outcome::new(recovery, Route::error(error.to_string()));
        if let Err(error) = self.epilogue.render(fallback) {
            tracing::error!(stream_id = %stream_id, %error, "error render failed");
        }
    }
}
