//! Per-stream identity and the handle every outcome carries.
//!
//! A [`StreamHandle`] is the only way to reach the underlying HTTP/2 stream:
//! the body reader takes the request body from it once, and the responder
//! delivers exactly one response through it.
use std::{
    fmt,
    net::{IpAddr, SocketAddr},
    sync::{Arc, Mutex, PoisonError},
};

use axum::body::Body;
use hyper::Response;
use rand::RngCore;
use tokio::sync::oneshot;

use crate::ports::responder::ResponderError;

/// Number of random bytes in a [`StreamId`].
pub const STREAM_ID_SIZE: usize = 5;

/// Short random correlation token, rendered as lowercase hex.
///
/// Uniqueness is probabilistic only; never use it as a security token.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamId(String);

impl StreamId {
    pub fn generate() -> Self {
        let mut buffer = [0u8; STREAM_ID_SIZE];
        rand::rng().fill_bytes(&mut buffer);
        Self(buffer.iter().map(|b| format!("{b:02x}")).collect())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StreamId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Facts negotiated during the TLS handshake.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsSession {
    /// Server name indication sent by the client
    pub server_name: Option<String>,
    /// ALPN protocol selected for the connection
    pub alpn_protocol: Option<Vec<u8>>,
}

/// Transport context of the connection a stream arrived on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub remote_addr: Option<SocketAddr>,
    /// `None` when the transport is not a TLS socket
    pub tls: Option<TlsSession>,
}

impl ConnectionInfo {
    pub fn tls(remote_addr: SocketAddr, session: TlsSession) -> Self {
        Self {
            remote_addr: Some(remote_addr),
            tls: Some(session),
        }
    }

    /// Negotiated SNI, treating an empty name as absent.
    pub fn server_name(&self) -> Option<&str> {
        self.tls
            .as_ref()
            .and_then(|t| t.server_name.as_deref())
            .filter(|name| !name.is_empty())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    IPv4,
    IPv6,
}

/// Remote peer of a request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteClient {
    pub family: Option<AddressFamily>,
    pub ip: Option<IpAddr>,
    pub port: Option<u16>,
}

impl From<Option<SocketAddr>> for RemoteClient {
    fn from(addr: Option<SocketAddr>) -> Self {
        match addr {
            Some(addr) => Self {
                family: Some(if addr.is_ipv4() {
                    AddressFamily::IPv4
                } else {
                    AddressFamily::IPv6
                }),
                ip: Some(addr.ip()),
                port: Some(addr.port()),
            },
            None => Self::default(),
        }
    }
}

struct StreamSlot {
    id: StreamId,
    request_body: Mutex<Option<Body>>,
    response: Mutex<Option<oneshot::Sender<Response<Body>>>>,
}

/// Shared handle on one HTTP/2 stream. Cloning is cheap.
#[derive(Clone)]
pub struct StreamHandle {
    slot: Arc<StreamSlot>,
}

impl StreamHandle {
    /// Wrap a request body; the receiver yields the single rendered response.
    pub fn new(id: StreamId, request_body: Body) -> (Self, oneshot::Receiver<Response<Body>>) {
        let (tx, rx) = oneshot::channel();
        let handle = Self {
            slot: Arc::new(StreamSlot {
                id,
                request_body: Mutex::new(Some(request_body)),
                response: Mutex::new(Some(tx)),
            }),
        };
        (handle, rx)
    }

    pub fn id(&self) -> &StreamId {
        &self.slot.id
    }

    /// Take the request body. Only the first caller gets it.
    pub fn take_body(&self) -> Option<Body> {
        self.slot
            .request_body
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Whether a response was already delivered or the peer stopped waiting.
    pub fn is_closed(&self) -> bool {
        self.slot
            .response
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_none_or(|tx| tx.is_closed())
    }

    /// Deliver the response for this stream.
    pub fn respond(&self, response: Response<Body>) -> Result<(), ResponderError> {
        let sender = self
            .slot
            .response
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(ResponderError::AlreadyResponded)?;

        sender
            .send(response)
            .map_err(|_| ResponderError::StreamClosed)
    }
}

impl fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamHandle")
            .field("id", &self.slot.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_id_is_ten_hex_chars() {
        let id = StreamId::generate();
        assert_eq!(id.as_str().len(), STREAM_ID_SIZE * 2);
        assert!(id.as_str().chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_body_can_be_taken_once() {
        let (stream, _rx) = StreamHandle::new(StreamId::from("abc"), Body::from("hi"));
        assert!(stream.take_body().is_some());
        assert!(stream.take_body().is_none());
    }

    #[tokio::test]
    async fn test_single_response() {
        let (stream, rx) = StreamHandle::new(StreamId::from("abc"), Body::empty());
        assert!(!stream.is_closed());

        stream.respond(Response::new(Body::from("one"))).unwrap();
        assert!(matches!(
            stream.respond(Response::new(Body::from("two"))),
            Err(ResponderError::AlreadyResponded)
        ));
        assert!(stream.is_closed());
        assert!(rx.await.is_ok());
    }

    #[test]
    fn test_respond_after_peer_left() {
        let (stream, rx) = StreamHandle::new(StreamId::from("abc"), Body::empty());
        drop(rx);
        assert!(stream.is_closed());
        assert!(matches!(
            stream.respond(Response::new(Body::empty())),
            Err(ResponderError::StreamClosed)
        ));
    }

    #[test]
    fn test_remote_client_from_addr() {
        let client = RemoteClient::from(Some("[::1]:4433".parse::<SocketAddr>().unwrap()));
        assert_eq!(client.family, Some(AddressFamily::IPv6));
        assert_eq!(client.port, Some(4433));
        assert_eq!(RemoteClient::from(None), RemoteClient::default());
    }

    #[test]
    fn test_empty_sni_is_absent() {
        let info = ConnectionInfo::tls(
            "127.0.0.1:1".parse().unwrap(),
            TlsSession {
                server_name: Some(String::new()),
                alpn_protocol: None,
            },
        );
        assert_eq!(info.server_name(), None);
    }
}
