use super::error::PeerError;
use super::extensions::Reserved;
use super::identity::PeerId;
use crate::metainfo::InfoHash;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// The fixed protocol string exchanged in every handshake.
pub const PROTOCOL_STRING: &[u8] = b"BitTorrent protocol";
/// Total handshake size: 1 + 19 + 8 + 20 + 20.
pub const HANDSHAKE_LEN: usize = 68;
/// Size of the length prefix plus the type id byte.
pub const FRAME_HEADER_LEN: usize = 5;

/// Wire message type ids (BEP-3 base protocol, BEP-6 fast extension,
/// BEP-10 extension protocol).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
    Port = 9,
    SuggestPiece = 13,
    HaveAll = 14,
    HaveNone = 15,
    RejectRequest = 16,
    AllowedFast = 17,
    Extended = 20,
}

impl TryFrom<u8> for MessageId {
    type Error = PeerError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(MessageId::Choke),
            1 => Ok(MessageId::Unchoke),
            2 => Ok(MessageId::Interested),
            3 => Ok(MessageId::NotInterested),
            4 => Ok(MessageId::Have),
            5 => Ok(MessageId::Bitfield),
            6 => Ok(MessageId::Request),
            7 => Ok(MessageId::Piece),
            8 => Ok(MessageId::Cancel),
            9 => Ok(MessageId::Port),
            13 => Ok(MessageId::SuggestPiece),
            14 => Ok(MessageId::HaveAll),
            15 => Ok(MessageId::HaveNone),
            16 => Ok(MessageId::RejectRequest),
            17 => Ok(MessageId::AllowedFast),
            20 => Ok(MessageId::Extended),
            other => Err(PeerError::UnknownMessageId(other)),
        }
    }
}

/// The fixed 68-byte exchange that precedes all framed messages.
#[derive(Debug, Clone, Copy)]
pub struct Handshake {
    pub reserved: Reserved,
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
}

impl Handshake {
    pub fn new(reserved: Reserved, info_hash: InfoHash, peer_id: PeerId) -> Self {
        Self {
            reserved,
            info_hash,
            peer_id,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HANDSHAKE_LEN);
        buf.put_u8(PROTOCOL_STRING.len() as u8);
        buf.put_slice(PROTOCOL_STRING);
        buf.put_slice(self.reserved.as_bytes());
        buf.put_slice(self.info_hash.as_bytes());
        buf.put_slice(self.peer_id.as_bytes());
        buf.freeze()
    }

    pub fn decode(data: &[u8]) -> Result<Self, PeerError> {
        if data.len() != HANDSHAKE_LEN {
            return Err(PeerError::InvalidHandshake(format!(
                "expected {HANDSHAKE_LEN} bytes, actual {}",
                data.len()
            )));
        }
        if usize::from(data[0]) != PROTOCOL_STRING.len() {
            return Err(PeerError::InvalidHandshake(format!(
                "protocol string length mismatch, expected {}, actual {}",
                PROTOCOL_STRING.len(),
                data[0]
            )));
        }
        if &data[1..20] != PROTOCOL_STRING {
            return Err(PeerError::InvalidHandshake(format!(
                "protocol string mismatch: {:?}",
                String::from_utf8_lossy(&data[1..20])
            )));
        }

        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&data[20..28]);

        // Lengths are fixed above, so these cannot fail.
        let info_hash = InfoHash::from_bytes(&data[28..48])
            .ok_or_else(|| PeerError::InvalidHandshake("bad info hash".into()))?;
        let peer_id = PeerId::from_bytes(&data[48..68])
            .ok_or_else(|| PeerError::InvalidHandshake("bad peer id".into()))?;

        Ok(Self {
            reserved: Reserved::from_bytes(reserved),
            info_hash,
            peer_id,
        })
    }
}

/// A typed peer wire message.
///
/// Keep-alive is deliberately absent: it is the zero-length frame, a
/// framing-layer liveness signal that is consumed before messages are
/// ever constructed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { piece: u32 },
    Bitfield(Bytes),
    Request { index: u32, begin: u32, length: u32 },
    Piece { index: u32, begin: u32, data: Bytes },
    Cancel { index: u32, begin: u32, length: u32 },
    Port(u16),
    SuggestPiece { piece: u32 },
    HaveAll,
    HaveNone,
    RejectRequest { index: u32, begin: u32, length: u32 },
    AllowedFast { piece: u32 },
    Extended { id: u8, payload: Bytes },
}

impl Message {
    /// The wire type id of this message.
    pub fn id(&self) -> MessageId {
        match self {
            Message::Choke => MessageId::Choke,
            Message::Unchoke => MessageId::Unchoke,
            Message::Interested => MessageId::Interested,
            Message::NotInterested => MessageId::NotInterested,
            Message::Have { .. } => MessageId::Have,
            Message::Bitfield(_) => MessageId::Bitfield,
            Message::Request { .. } => MessageId::Request,
            Message::Piece { .. } => MessageId::Piece,
            Message::Cancel { .. } => MessageId::Cancel,
            Message::Port(_) => MessageId::Port,
            Message::SuggestPiece { .. } => MessageId::SuggestPiece,
            Message::HaveAll => MessageId::HaveAll,
            Message::HaveNone => MessageId::HaveNone,
            Message::RejectRequest { .. } => MessageId::RejectRequest,
            Message::AllowedFast { .. } => MessageId::AllowedFast,
            Message::Extended { .. } => MessageId::Extended,
        }
    }

    /// Payload length in bytes, excluding the length prefix and the id.
    pub fn payload_len(&self) -> usize {
        match self {
            Message::Choke
            | Message::Unchoke
            | Message::Interested
            | Message::NotInterested
            | Message::HaveAll
            | Message::HaveNone => 0,
            Message::Have { .. }
            | Message::SuggestPiece { .. }
            | Message::AllowedFast { .. } => 4,
            Message::Bitfield(bits) => bits.len(),
            Message::Request { .. }
            | Message::Cancel { .. }
            | Message::RejectRequest { .. } => 12,
            Message::Piece { data, .. } => 8 + data.len(),
            Message::Port(_) => 2,
            Message::Extended { payload, .. } => 1 + payload.len(),
        }
    }

    /// Appends the payload bytes (everything after the id byte).
    pub fn write_payload(&self, buf: &mut BytesMut) {
        match self {
            Message::Choke
            | Message::Unchoke
            | Message::Interested
            | Message::NotInterested
            | Message::HaveAll
            | Message::HaveNone => {}
            Message::Have { piece }
            | Message::SuggestPiece { piece }
            | Message::AllowedFast { piece } => buf.put_u32(*piece),
            Message::Bitfield(bits) => buf.put_slice(bits),
            Message::Request {
                index,
                begin,
                length,
            }
            | Message::Cancel {
                index,
                begin,
                length,
            }
            | Message::RejectRequest {
                index,
                begin,
                length,
            } => {
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_u32(*length);
            }
            Message::Piece { index, begin, data } => {
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_slice(data);
            }
            Message::Port(port) => buf.put_u16(*port),
            Message::Extended { id, payload } => {
                buf.put_u8(*id);
                buf.put_slice(payload);
            }
        }
    }

    /// Encodes the full frame: 4-byte big-endian length prefix, id,
    /// payload.
    pub fn encode(&self) -> Bytes {
        let payload_len = self.payload_len();
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + payload_len);
        buf.put_u32(payload_len as u32 + 1);
        buf.put_u8(self.id() as u8);
        self.write_payload(&mut buf);
        buf.freeze()
    }

    /// Decodes a message from its id and payload bytes (everything
    /// after the id byte of a complete frame).
    pub fn decode(id: MessageId, mut payload: Bytes) -> Result<Self, PeerError> {
        let need = |n: usize, payload: &Bytes| {
            if payload.len() < n {
                Err(PeerError::InvalidMessage(format!(
                    "{id:?} payload too short, expected at least {n} bytes, actual {}",
                    payload.len()
                )))
            } else {
                Ok(())
            }
        };

        let message = match id {
            MessageId::Choke => Message::Choke,
            MessageId::Unchoke => Message::Unchoke,
            MessageId::Interested => Message::Interested,
            MessageId::NotInterested => Message::NotInterested,
            MessageId::Have => {
                need(4, &payload)?;
                Message::Have {
                    piece: payload.get_u32(),
                }
            }
            MessageId::Bitfield => Message::Bitfield(payload),
            MessageId::Request => {
                need(12, &payload)?;
                Message::Request {
                    index: payload.get_u32(),
                    begin: payload.get_u32(),
                    length: payload.get_u32(),
                }
            }
            MessageId::Piece => {
                need(8, &payload)?;
                let index = payload.get_u32();
                let begin = payload.get_u32();
                Message::Piece {
                    index,
                    begin,
                    data: payload,
                }
            }
            MessageId::Cancel => {
                need(12, &payload)?;
                Message::Cancel {
                    index: payload.get_u32(),
                    begin: payload.get_u32(),
                    length: payload.get_u32(),
                }
            }
            MessageId::Port => {
                need(2, &payload)?;
                Message::Port(payload.get_u16())
            }
            MessageId::SuggestPiece => {
                need(4, &payload)?;
                Message::SuggestPiece {
                    piece: payload.get_u32(),
                }
            }
            MessageId::HaveAll => Message::HaveAll,
            MessageId::HaveNone => Message::HaveNone,
            MessageId::RejectRequest => {
                need(12, &payload)?;
                Message::RejectRequest {
                    index: payload.get_u32(),
                    begin: payload.get_u32(),
                    length: payload.get_u32(),
                }
            }
            MessageId::AllowedFast => {
                need(4, &payload)?;
                Message::AllowedFast {
                    piece: payload.get_u32(),
                }
            }
            MessageId::Extended => {
                need(1, &payload)?;
                let id = payload.get_u8();
                Message::Extended { id, payload }
            }
        };

        Ok(message)
    }
}
