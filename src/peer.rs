//! Peer wire protocol (BEP-3, BEP-6, BEP-10)
//!
//! This module implements the peer-to-peer half of BitTorrent: the
//! 68-byte handshake, length-prefixed message framing, the fast
//! extension, the extension protocol, and the per-peer session state
//! (choke/interest booleans and possession bitfields) that drives piece
//! exchange.
//!
//! [`Protocol`] is the transport-level engine: one read task and one
//! write task per connection, with per-attempt read/write timeouts, a
//! handshake timeout, and a keep-alive interval. [`Peer`] layers the
//! session state machine on top and is the type most callers want.

mod bitfield;
mod error;
mod extensions;
mod identity;
mod message;
mod protocol;
mod session;

pub use bitfield::Bitfield;
pub use error::PeerError;
pub use extensions::{
    Extensions, ExtensionsBuilder, Reserved, DHT_BIT, EXTENSION_HANDSHAKE_ID,
    EXTENSION_PROTOCOL_BIT, FAST_PEERS_BIT,
};
pub use identity::{Identity, PeerId};
pub use message::{Handshake, Message, MessageId, FRAME_HEADER_LEN, HANDSHAKE_LEN, PROTOCOL_STRING};
pub use protocol::{
    ConnectionState, Delivery, Protocol, ProtocolConfig, ProtocolListener, Transport,
};
pub use session::{ChokeState, EarlyPossession, Peer, PeerConfig, PeerEvents};

#[cfg(test)]
mod tests;
