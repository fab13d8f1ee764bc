//! VLESS / Trojan tunneling relay over WebSocket
//!
//! Architecture:
//! - `core/`: Header codecs, credentials, session lifecycle, TCP and DNS relays
//! - `transport/`: WebSocket chunk adapter and optional TLS
//! - `handler`: Per-connection session orchestration
//! - `server_runner`: Listener, TLS, upgrade and endpoint routing

pub mod config;
pub mod core;
pub mod error;
pub mod handler;
pub mod logger;
pub mod server_runner;
pub mod transport;
