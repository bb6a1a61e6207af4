//! Bridges an in-process SSE port onto a live event-stream response.
use tokio::task::JoinHandle;

use crate::{
    core::{event_stream::SsePort, stream::StreamId},
    ports::responder::EventSink,
    utils::graceful_shutdown::ShutdownToken,
};

/// Why a bridge stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeEnd {
    /// The peer went away; the port was closed.
    StreamClosed,
    /// Shutdown was signalled; the port was closed and the stream ended.
    Shutdown,
    /// Every sender was dropped; the stream was ended.
    PortClosed,
}

/// Forward every message on `port` to `sink` until one side goes away.
///
/// Senders observe a closed channel once the bridge stops, so messages sent
/// after that are dropped without reaching the wire.
pub fn install(
    stream_id: StreamId,
    sink: EventSink,
    mut port: SsePort,
    shutdown: ShutdownToken,
) -> JoinHandle<BridgeEnd> {
    tokio::spawn(async move {
        let end = loop {
            tokio::select! {
                biased;
                _ = sink.closed() => {
                    port.close();
                    break BridgeEnd::StreamClosed;
                }
                _ = shutdown.cancelled() => {
                    port.close();
                    sink.end();
                    break BridgeEnd::Shutdown;
                }
                message = port.recv() => match message {
                    Some(message) => {
                        if !sink.write(message.to_bytes()) {
                            port.close();
                            break BridgeEnd::StreamClosed;
                        }
                    }
                    None => {
                        sink.end();
                        break BridgeEnd::PortClosed;
                    }
                },
            }
        };

        tracing::debug!(stream_id = %stream_id, end = ?end, "event stream bridge stopped");
        end
    })
}
