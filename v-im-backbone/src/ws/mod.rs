// WebSocket 接入层 / WebSocket access layer
pub mod connection;
pub mod handler;
pub mod server;
