//! Browser terminal daemon: Axum HTTP + WebSocket connection handler.

mod web_server;

pub use web_server::{build_router, AppState};
