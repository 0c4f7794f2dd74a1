//! shield — a multi-protocol network gateway front-end.
//!
//! A single process terminates length-prefixed binary TCP, HTTP/1.1,
//! WebSocket and virtual-session UDP, and routes decoded messages to
//! pluggable application handlers. Connections are accepted by a master
//! reactor and fanned out round-robin over a pool of slave event loops;
//! each protocol handler runs as a state machine over per-connection
//! accumulation buffers, so partial reads never corrupt framing.

pub mod codec;
pub mod config;
pub mod gateway;
pub mod httpd;
pub mod protocol;
pub mod reactor;
pub mod session;
pub mod udp;


pub use config::GatewayConfig;
pub use gateway::{Gateway, MessageHandler, TextHandler};
pub use protocol::ProtocolKind;
pub use protocol::http::{HttpRequest, HttpResponse};
pub use session::Session;

/// Error returned by most functions.
///
/// Start-up and configuration surfaces use a boxed `std::error::Error`;
/// hot paths that hit expected runtime conditions (a partial frame on a
/// socket) use the per-module error enums instead, so the common
/// "need more data" case never allocates.
pub type Error = Box<dyn std::error::Error + Send + Sync>;

/// A specialized `Result` type for gateway operations.
pub type Result<T> = std::result::Result<T, Error>;
