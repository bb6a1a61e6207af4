use http_body_util::{BodyExt, LengthLimitError, Limited};

use crate::{
    core::stream::StreamHandle,
    ports::body_reader::{BodyError, BodyReadOptions, BodyReader, PendingBody, ReceivedBody},
};

/// Collects the whole body in memory, bounded by size and by the read's
/// cancellation signal.
#[derive(Debug, Clone, Copy, Default)]
pub struct LimitedBodyReader;

impl BodyReader for LimitedBodyReader {
    fn read(&self, stream: &StreamHandle, options: BodyReadOptions) -> PendingBody {
        let body = stream.take_body();
        let stream_id = stream.id().clone();

        PendingBody::new(async move {
            let body = body.ok_or(BodyError::AlreadyConsumed)?;
            let limit = options.byte_limit;

            if options.content_length.is_some_and(|length| length > limit as u64) {
                return Err(BodyError::TooLarge { limit });
            }

            let collected = tokio::select! {
                biased;
                reason = options.signal.fired() => {
                    tracing::debug!(stream_id = %stream_id, %reason, "body read cancelled");
                    return Err(BodyError::Cancelled(reason));
                }
                collected = Limited::new(body, limit).collect() => collected,
            };

            let bytes = collected
                .map_err(|error| {
                    if error.downcast_ref::<LengthLimitError>().is_some() {
                        BodyError::TooLarge { limit }
                    } else {
                        BodyError::Transport(error.to_string())
                    }
                })?
                .to_bytes();

            if let Some(expected) = options.content_length {
                let received = bytes.len() as u64;
                if received != expected {
                    return Err(BodyError::LengthMismatch { expected, received });
                }
            }

            Ok(ReceivedBody {
                bytes,
                content_type: options.content_type,
            })
        })
    }
}
