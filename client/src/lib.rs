//! Client-side reconnect/protocol driver (C6): owns the connection
//! lifecycle to a session core's message channel, issues the handshake or
//! reconnect on open, answers heartbeats, and re-establishes the channel
//! after a drop while keeping the session identity stable. No renderer and
//! no live transport live here by default — both are traits, so the state
//! machine is testable against stubs.

pub mod backoff;
pub mod driver;
pub mod renderer;
pub mod store;
pub mod transport;

pub use driver::{ConnectionState, Driver, DriverEvent, DriverHandle, RendererEvent};
pub use renderer::Renderer;
pub use store::{InMemorySessionStore, SessionIdStore};
pub use transport::{Transport, TransportEvent, WsTransport};
