use super::error::PeerError;
use bytes::Bytes;

/// Per-piece possession vector, one bit per piece.
///
/// Piece `i` maps to byte `i / 8`, bit `i % 8` counted from the
/// least-significant bit, so pieces `{0, 2, 4}` of a 5-piece torrent
/// encode as the single byte `0b0001_0101`. The wire form is always
/// exactly `ceil(piece_count / 8)` bytes and the unused high bits of
/// the last byte are kept at zero.
///
/// Instances that are shared between the I/O loop and observer threads
/// are wrapped in a lock by their owner; the type itself is plain data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitfield {
    bits: Vec<u8>,
    piece_count: usize,
}

impl Bitfield {
    /// Creates an empty bitfield for the given number of pieces.
    pub fn new(piece_count: usize) -> Self {
        Self {
            bits: vec![0; piece_count.div_ceil(8)],
            piece_count,
        }
    }

    /// Creates a bitfield with every piece marked present.
    pub fn full(piece_count: usize) -> Self {
        let mut bitfield = Self {
            bits: vec![0xFF; piece_count.div_ceil(8)],
            piece_count,
        };
        bitfield.mask_spare_bits();
        bitfield
    }

    /// Creates a bitfield from wire bytes.
    ///
    /// The byte length must be exactly `ceil(piece_count / 8)`; anything
    /// else is a protocol violation. Spare bits in the last byte are
    /// ignored (read back as zero).
    pub fn from_bytes(bytes: &[u8], piece_count: usize) -> Result<Self, PeerError> {
        let expected = piece_count.div_ceil(8);
        if bytes.len() != expected {
            return Err(PeerError::Protocol(format!(
                "invalid bitfield length, expected {expected}, actual {}",
                bytes.len()
            )));
        }
        let mut bitfield = Self {
            bits: bytes.to_vec(),
            piece_count,
        };
        bitfield.mask_spare_bits();
        Ok(bitfield)
    }

    /// Number of pieces this bitfield covers.
    pub fn piece_count(&self) -> usize {
        self.piece_count
    }

    /// Wire length in bytes.
    pub fn byte_len(&self) -> usize {
        self.bits.len()
    }

    fn check_index(&self, index: usize) -> Result<(), PeerError> {
        if index >= self.piece_count {
            return Err(PeerError::Protocol(format!(
                "invalid piece index, expected [0, {}), actual {index}",
                self.piece_count
            )));
        }
        Ok(())
    }

    /// Returns whether the piece at `index` is present.
    pub fn get(&self, index: usize) -> bool {
        index < self.piece_count && self.bits[index / 8] & (1 << (index % 8)) != 0
    }

    /// Marks the piece at `index` as present.
    pub fn set(&mut self, index: usize) -> Result<(), PeerError> {
        self.check_index(index)?;
        self.bits[index / 8] |= 1 << (index % 8);
        Ok(())
    }

    /// Marks the piece at `index` as absent.
    pub fn clear(&mut self, index: usize) -> Result<(), PeerError> {
        self.check_index(index)?;
        self.bits[index / 8] &= !(1 << (index % 8));
        Ok(())
    }

    /// Marks every piece as present.
    pub fn set_all(&mut self) {
        self.bits.fill(0xFF);
        self.mask_spare_bits();
    }

    /// Marks every piece as absent.
    pub fn clear_all(&mut self) {
        self.bits.fill(0);
    }

    /// ORs another bitfield of the same shape into this one.
    ///
    /// Used for repeated `bitfield` messages, which accumulate rather
    /// than replace.
    pub fn union(&mut self, other: &Bitfield) -> Result<(), PeerError> {
        if other.piece_count != self.piece_count {
            return Err(PeerError::Protocol(format!(
                "bitfield shape mismatch, expected {} pieces, actual {}",
                self.piece_count, other.piece_count
            )));
        }
        for (byte, other_byte) in self.bits.iter_mut().zip(&other.bits) {
            *byte |= other_byte;
        }
        Ok(())
    }

    /// Number of pieces present.
    pub fn count(&self) -> usize {
        self.bits.iter().map(|b| b.count_ones() as usize).sum()
    }

    pub fn is_complete(&self) -> bool {
        self.count() == self.piece_count
    }

    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|&b| b == 0)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    pub fn to_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(&self.bits)
    }

    fn mask_spare_bits(&mut self) {
        let used = self.piece_count % 8;
        if used != 0 {
            if let Some(last) = self.bits.last_mut() {
                *last &= (1u8 << used) - 1;
            }
        }
    }
}
