//! Reverse Tunnel Agent
//!
//! Dials out to a relay, authenticates with a line-based handshake, and runs a
//! yamux session over the connection. The relay opens one stream per proxied
//! request; each is routed by its first path segment to a local HTTP or
//! WebSocket service.

pub mod config;
pub mod forward;
pub mod handshake;
pub mod heartbeat;
pub mod http;
pub mod identity;
pub mod proxy;
pub mod register;
pub mod session;
pub mod stream;
pub mod supervisor;
pub mod tls;
pub mod transport;
pub mod websocket;

#[cfg(test)]
pub(crate) mod test_support;

// Re-export commonly used types and functions
pub use config::{Config, RelayConfig, ServiceMapping, load_config};
pub use handshake::{Greeting, HandshakeError};
pub use identity::ClientIdentity;
pub use proxy::handle_stream;
pub use session::{Control, ProxyStream, Session, SessionConfig, SessionError};
pub use stream::StreamType;
pub use supervisor::{Supervisor, run};
pub use transport::ConnectError;
