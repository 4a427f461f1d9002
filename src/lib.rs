//! peerwire - A BitTorrent peer wire protocol engine
//!
//! This library implements the connection-level core of BitTorrent:
//! handshakes, message framing, timeout and keep-alive supervision,
//! capability negotiation, and per-peer session state, over any
//! asynchronous byte-stream transport.
//!
//! # Modules
//!
//! - [`bencode`] - BEP-3 Bencode encoding/decoding
//! - [`metainfo`] - Torrent metadata as seen by the engine (info hash,
//!   piece geometry)
//! - [`peer`] - BEP-3/6/10 Peer wire protocol, fast extension,
//!   extension protocol, peer sessions

pub mod bencode;
pub mod metainfo;
pub mod peer;

pub use bencode::{decode, encode, BencodeError, Value};
pub use metainfo::{InfoHash, TorrentInfo};
pub use peer::{
    Bitfield, ChokeState, ConnectionState, Delivery, EarlyPossession, Extensions,
    ExtensionsBuilder, Handshake, Identity, Message, MessageId, Peer, PeerConfig, PeerError,
    PeerEvents, PeerId, Protocol, ProtocolConfig, ProtocolListener, Reserved, Transport,
};
