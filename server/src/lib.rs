//! TermDock server: Axum HTTP + WebSocket surface over the session core.

mod web_server;

pub use web_server::run_web_server;
