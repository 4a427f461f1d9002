use super::message::MessageId;
use crate::bencode::BencodeError;
use std::sync::Arc;
use thiserror::Error;

/// Errors that can occur on a peer connection.
///
/// Every variant is scoped to a single connection; none is fatal to the
/// process. Fatal conditions funnel through the connection's close
/// path, which reports the cause through
/// [`ProtocolListener::on_close`] and fails queued sends with a clone
/// of the same cause.
///
/// [`ProtocolListener::on_close`]: super::ProtocolListener::on_close
#[derive(Debug, Clone, Error)]
pub enum PeerError {
    /// Transport I/O failure (reset, broken pipe, ...).
    #[error("io error: {0}")]
    Io(Arc<std::io::Error>),

    /// The peer sent a malformed handshake.
    #[error("invalid handshake: {0}")]
    InvalidHandshake(String),

    /// The peer's info hash does not match the requested one.
    #[error("info hash mismatch")]
    InfoHashMismatch,

    /// Received a message id this implementation does not know.
    #[error("unknown message id {0:#04x}")]
    UnknownMessageId(u8),

    /// Received a malformed protocol message.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// The peer violated the protocol (bad lengths, missing
    /// capability, possession before ready, ...).
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Extension handshake error.
    #[error("extension error: {0}")]
    Extension(String),

    /// Malformed bencode in an extension message.
    #[error("bencode error: {0}")]
    Bencode(#[from] BencodeError),

    /// A received message could not be processed by the session.
    #[error("failed to process {id:?} message while reading: {source}")]
    Dispatch {
        id: MessageId,
        #[source]
        source: Box<PeerError>,
    },

    #[error("read timed out")]
    ReadTimeout,

    #[error("write timed out")]
    WriteTimeout,

    #[error("handshake timed out")]
    HandshakeTimeout,

    /// A deferred payload producer did not complete in time.
    #[error("payload production timed out")]
    OperationTimeout,

    /// Inactivity disconnection policy fired (when configured).
    #[error("peer disconnected due to inactivity")]
    Inactive,

    /// The transport reached end of stream.
    #[error("connection closed by peer")]
    ConnectionClosed,

    /// Operation requires an established connection.
    #[error("peer is not connected")]
    NotConnected,

    /// A second establish attempt on the same connection.
    #[error("peer is already connected")]
    AlreadyConnected,

    /// The connection was closed locally without an error.
    #[error("peer closed")]
    Shutdown,
}

impl From<std::io::Error> for PeerError {
    fn from(error: std::io::Error) -> Self {
        PeerError::Io(Arc::new(error))
    }
}

impl PeerError {
    /// True for causes that are part of normal peer churn rather than
    /// local bugs, used to pick log levels on close.
    pub fn is_expected(&self) -> bool {
        matches!(
            self,
            PeerError::Io(_)
                | PeerError::ReadTimeout
                | PeerError::WriteTimeout
                | PeerError::HandshakeTimeout
                | PeerError::Inactive
                | PeerError::ConnectionClosed
                | PeerError::Shutdown
        )
    }
}
