//! Relay Connection
//!
//! WebSocket transport with reconnect backoff and latency probing.

mod manager;

pub use manager::{
    ConnectionConfig, ConnectionError, ConnectionEvent, ConnectionHandle, ConnectionManager,
    ConnectionState, ReconnectPolicy, SharedConnectionState,
};
