//! Static torrent metadata.
//!
//! The peer engine treats metadata as an immutable external value: it
//! reads the piece count (for bitfield sizing and validation) and the
//! info hash (for handshake verification) and nothing else.

use sha1::{Digest, Sha1};
use std::fmt;

/// A 20-byte v1 info hash identifying a torrent's metadata.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct InfoHash(pub [u8; 20]);

impl InfoHash {
    /// Computes the info hash of canonically bencoded info bytes.
    pub fn of(info_bytes: &[u8]) -> Self {
        let digest = Sha1::digest(info_bytes);
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&digest);
        Self(hash)
    }

    /// Creates an info hash from a 20-byte slice.
    ///
    /// Returns `None` if the slice is not exactly 20 bytes.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let mut hash = [0u8; 20];
        if bytes.len() != 20 {
            return None;
        }
        hash.copy_from_slice(bytes);
        Some(Self(hash))
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{b:02x}")).collect()
    }
}

impl fmt::Debug for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InfoHash({})", self.to_hex())
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Read-only description of a torrent's content layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentInfo {
    info_hash: InfoHash,
    piece_length: u64,
    total_length: u64,
}

impl TorrentInfo {
    pub fn new(info_hash: InfoHash, piece_length: u64, total_length: u64) -> Self {
        assert!(piece_length > 0, "piece length must be positive");
        Self {
            info_hash,
            piece_length,
            total_length,
        }
    }

    pub fn info_hash(&self) -> InfoHash {
        self.info_hash
    }

    pub fn piece_length(&self) -> u64 {
        self.piece_length
    }

    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    /// Number of pieces in the torrent.
    pub fn piece_count(&self) -> usize {
        self.total_length.div_ceil(self.piece_length) as usize
    }

    /// Length of a specific piece; the last piece may be short.
    pub fn piece_size(&self, index: usize) -> u64 {
        let start = index as u64 * self.piece_length;
        self.piece_length.min(self.total_length.saturating_sub(start))
    }
}
