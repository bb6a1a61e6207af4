pub mod body_reader;
pub mod header_semantics;
pub mod hyper_responder;
pub mod server;
pub mod tls;

/// Re-export commonly used types from adapters
pub use body_reader::LimitedBodyReader;
pub use header_semantics::StandardHeaderSemantics;
pub use hyper_responder::HyperResponder;
pub use server::H2Server;
pub use tls::{TlsSetupError, server_tls_config};
