pub mod body_reader;
pub mod header_semantics;
pub mod responder;
pub mod route_dispatcher;

pub use body_reader::{BodyError, BodyReadOptions, BodyReader, PendingBody, ReceivedBody};
pub use header_semantics::{ContentType, EntityTag, ForwardedElement, HeaderSemantics};
pub use responder::{EventSink, Responder, ResponderError, ResponderResult};
pub use route_dispatcher::RouteDispatcher;
