//! Browser terminal session core: PTY lifecycle, scrollback ring buffer,
//! wire protocol codec, and the process-wide session registry. No HTTP, no
//! UI — those live in the server and client crates built on top of this one.

pub mod config;
pub mod error;
pub mod protocol;
pub mod pty;
pub mod registry;
pub mod scrollback;
pub mod session;
