pub mod websocket;

use crate::auth::Token;
use async_trait::async_trait;
use thiserror::Error;

pub use websocket::{WebSocketConfig, WebSocketConnector};

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("invalid channel endpoint: {0}")]
    InvalidEndpoint(String),
    #[error("transport could not be established: {0}")]
    Transport(String),
    #[error("token rejected by remote")]
    TokenRejected,
    #[error("remote closed the channel during handshake: {0}")]
    ClosedDuringHandshake(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("link closed")]
pub struct LinkClosed;

/// Initial terminal geometry presented with the token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenRequest {
    pub columns: u16,
    pub rows: u16,
}

/// Establishes links to the remote pty.
#[async_trait]
pub trait ChannelConnector: Send + Sync {
    async fn connect(
        &self,
        token: &Token,
        request: OpenRequest,
    ) -> Result<Box<dyn ChannelLink>, ConnectError>;
}

/// One established connection. Frames are opaque bytes; encoding belongs to
/// [`crate::protocol::wire`].
#[async_trait]
pub trait ChannelLink: Send {
    fn send(&self, frame: Vec<u8>) -> Result<(), LinkClosed>;

    /// Next inbound frame, `None` once the remote side is gone.
    async fn recv(&mut self) -> Option<Vec<u8>>;

    fn is_connected(&self) -> bool;

    async fn close(&mut self);
}
