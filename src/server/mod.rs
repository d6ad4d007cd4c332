//! WebSocket server module
//!
//! Accepts terminal clients and bridges each one to its own agent session.

mod handler;
mod protocol;
mod utf8;
mod websocket;

pub use websocket::{ServerConfig, WebSocketServer};
