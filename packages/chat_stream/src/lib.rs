//! Streaming chat client core.
//!
//! A per-session WebSocket carries user messages out and the assistant's
//! reply back as incremental chunks; an HTTP call covers the same exchange
//! when the socket is unavailable. User messages appear immediately and are
//! reconciled with the server's confirmed records.

pub mod api;
pub mod client;
pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod models;
pub mod store;
pub mod stream;
pub mod transport;

pub use api::{ChatApi, HttpChatApi};
pub use client::{ChatClient, ChatHandle};
pub use config::{ClientConfig, ClientFileConfig, load_config};
pub use connection::{ConnectionEvent, ConnectionManager, ConnectionSettings, ConnectionStatus};
pub use error::{ChatError, ChatResult, SendError};
pub use models::{
    Message, MessageId, MessagePair, ProvisionalId, Role, Session, SessionId, SessionPage,
    SessionWithMessages, ThreadMessage,
};
pub use store::{ChatSnapshot, DeletionFallback, FrameOutcome, SessionStore};
pub use transport::{Route, select_route};
