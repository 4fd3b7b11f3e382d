//! Route selection for outgoing user messages.

use crate::connection::ConnectionStatus;

/// Where a user message is sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Over the session's WebSocket; the reply streams back as frames.
    Duplex,
    /// Over a single HTTP request that returns both confirmed messages.
    Fallback,
}

/// The duplex path is used only when the connection is fully established.
pub fn select_route(status: ConnectionStatus) -> Route {
    match status {
        ConnectionStatus::Connected => Route::Duplex,
        ConnectionStatus::Connecting | ConnectionStatus::Disconnected | ConnectionStatus::Error => {
            Route::Fallback
        }
    }
}
