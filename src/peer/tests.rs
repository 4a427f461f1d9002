use super::*;
use crate::bencode::{self, Value};
use crate::metainfo::{InfoHash, TorrentInfo};
use bytes::Bytes;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;

#[test]
fn test_peer_id_generate() {
    let id1 = PeerId::generate();
    let id2 = PeerId::generate();
    assert_ne!(id1.0, id2.0);
    assert_eq!(id1.client_id(), Some("PW0001"));
}

#[test]
fn test_bitfield_set_get_clear() {
    let mut bf = Bitfield::new(100);
    assert!(!bf.get(0));

    bf.set(0).unwrap();
    assert!(bf.get(0));

    bf.set(99).unwrap();
    assert!(bf.get(99));
    assert_eq!(bf.count(), 2);

    bf.clear(0).unwrap();
    assert!(!bf.get(0));
    assert_eq!(bf.count(), 1);

    assert!(bf.set(100).is_err());
    assert!(bf.clear(100).is_err());
    assert!(!bf.get(100));
}

#[test]
fn test_bitfield_wire_scenario() {
    // 5 pieces fit in a single byte; pieces {0, 2, 4} occupy the low
    // bits of that byte.
    let mut bf = Bitfield::new(5);
    bf.set(0).unwrap();
    bf.set(2).unwrap();
    bf.set(4).unwrap();
    assert_eq!(bf.byte_len(), 1);
    assert_eq!(bf.as_bytes(), &[0b0001_0101]);

    let decoded = Bitfield::from_bytes(&[0b0001_0101], 5).unwrap();
    assert!(decoded.get(0));
    assert!(!decoded.get(1));
    assert!(decoded.get(2));
    assert!(!decoded.get(3));
    assert!(decoded.get(4));
}

#[test]
fn test_bitfield_length_validation() {
    assert!(Bitfield::from_bytes(&[0x00], 5).is_ok());
    assert!(Bitfield::from_bytes(&[0x00, 0x00], 5).is_err());
    assert!(Bitfield::from_bytes(&[], 5).is_err());
}

#[test]
fn test_bitfield_spare_bits_masked() {
    let bf = Bitfield::from_bytes(&[0xFF], 5).unwrap();
    assert_eq!(bf.count(), 5);
    assert!(bf.is_complete());
    assert_eq!(bf.as_bytes(), &[0b0001_1111]);

    let full = Bitfield::full(5);
    assert_eq!(full.as_bytes(), &[0b0001_1111]);
}

#[test]
fn test_bitfield_union_accumulates() {
    let mut bf = Bitfield::from_bytes(&[0b0000_0001], 8).unwrap();
    let more = Bitfield::from_bytes(&[0b1000_0000], 8).unwrap();
    bf.union(&more).unwrap();
    assert!(bf.get(0));
    assert!(bf.get(7));
    assert_eq!(bf.count(), 2);

    let wrong_shape = Bitfield::new(16);
    assert!(bf.union(&wrong_shape).is_err());
}

#[test]
fn test_reserved_bit_positions() {
    let mut builder = Extensions::builder();
    builder.set_extension_protocol(true);
    builder.set_dht(true);
    builder.set_fast_peers(true);
    let ext = builder.freeze();

    let reserved = ext.reserved();
    let bytes = reserved.as_bytes();
    assert_eq!(bytes[5], 0x10);
    assert_eq!(bytes[7], 0x05);
    assert!(ext.has_extension_protocol());
    assert!(ext.has_dht());
    assert!(ext.has_fast_peers());

    let none = Extensions::default();
    assert!(!none.has_extension_protocol());
    assert!(!none.has_fast_peers());
}

#[test]
fn test_handshake_encode_decode() {
    let info_hash = InfoHash([1u8; 20]);
    let peer_id = PeerId([2u8; 20]);
    let ext = Extensions::supported();

    let handshake = Handshake::new(ext.reserved(), info_hash, peer_id);
    let encoded = handshake.encode();
    assert_eq!(encoded.len(), HANDSHAKE_LEN);

    let decoded = Handshake::decode(&encoded).unwrap();
    assert_eq!(decoded.info_hash, info_hash);
    assert_eq!(decoded.peer_id, peer_id);
    assert!(decoded.reserved.has_extension_protocol());
    assert!(decoded.reserved.has_fast_peers());
    assert!(!decoded.reserved.has_dht());
}

#[test]
fn test_handshake_rejects_malformed() {
    let ext = Extensions::supported();
    let good = Handshake::new(ext.reserved(), InfoHash([1u8; 20]), PeerId([2u8; 20])).encode();

    assert!(Handshake::decode(&good[..67]).is_err());

    let mut bad_len = good.to_vec();
    bad_len[0] = 18;
    assert!(Handshake::decode(&bad_len).is_err());

    let mut bad_string = good.to_vec();
    bad_string[1] = b'b';
    assert!(Handshake::decode(&bad_string).is_err());
}

#[test]
fn test_message_encode_decode() {
    let messages = vec![
        Message::Choke,
        Message::Unchoke,
        Message::Interested,
        Message::NotInterested,
        Message::Have { piece: 42 },
        Message::Bitfield(Bytes::from_static(&[0b0001_0101])),
        Message::Request {
            index: 1,
            begin: 0,
            length: 16384,
        },
        Message::Piece {
            index: 1,
            begin: 16384,
            data: Bytes::from_static(b"block data"),
        },
        Message::Cancel {
            index: 1,
            begin: 0,
            length: 16384,
        },
        Message::Port(6881),
        Message::SuggestPiece { piece: 7 },
        Message::HaveAll,
        Message::HaveNone,
        Message::RejectRequest {
            index: 2,
            begin: 0,
            length: 16384,
        },
        Message::AllowedFast { piece: 3 },
        Message::Extended {
            id: 1,
            payload: Bytes::from_static(b"d1:md2:ab"),
        },
    ];

    for msg in messages {
        let encoded = msg.encode();
        let declared = u32::from_be_bytes([encoded[0], encoded[1], encoded[2], encoded[3]]);
        assert_eq!(declared as usize, msg.payload_len() + 1);

        let id = MessageId::try_from(encoded[4]).unwrap();
        assert_eq!(id, msg.id());

        let decoded = Message::decode(id, encoded.slice(FRAME_HEADER_LEN..)).unwrap();
        assert_eq!(decoded, msg);
    }
}

#[test]
fn test_message_rejects_short_payload() {
    assert!(Message::decode(MessageId::Have, Bytes::from_static(&[0, 0])).is_err());
    assert!(Message::decode(MessageId::Request, Bytes::from_static(&[0; 8])).is_err());
    assert!(Message::decode(MessageId::Piece, Bytes::from_static(&[0; 4])).is_err());
    assert!(Message::decode(MessageId::Extended, Bytes::new()).is_err());
}

#[test]
fn test_unknown_message_id() {
    assert!(matches!(
        MessageId::try_from(12),
        Err(PeerError::UnknownMessageId(12))
    ));
    assert!(matches!(
        MessageId::try_from(99),
        Err(PeerError::UnknownMessageId(99))
    ));
}

#[test]
fn test_extension_handshake_round_trip() {
    let mut builder = Extensions::builder();
    builder.set_extension_protocol(true);
    builder.set_messages(BTreeMap::from([("ut_metadata".to_string(), 3)]));
    builder.set_listen_port(6881);
    builder.set_client_version("test/1.0");
    builder.set_max_outstanding_requests(250);
    let ext = builder.freeze();

    let encoded = bencode::encode(&ext.to_handshake());
    let decoded = bencode::decode(&encoded).unwrap();

    let merged = Extensions::default().merge_handshake(&decoded).unwrap();
    assert_eq!(merged.message_id("ut_metadata"), Some(3));
    assert_eq!(merged.listen_port(), Some(6881));
    assert_eq!(merged.client_version(), Some("test/1.0"));
    assert_eq!(merged.max_outstanding_requests(), Some(250));
}

#[test]
fn test_extension_handshake_merge_rules() {
    // 'm' is mandatory.
    let empty = Value::Dict(BTreeMap::new());
    assert!(Extensions::default().merge_handshake(&empty).is_err());

    // Sub-extensions mapped to id 0 are disabled, not registered.
    let decoded = bencode::decode(b"d1:md11:ut_metadatai0e6:ut_pexi2eee").unwrap();
    let merged = Extensions::default().merge_handshake(&decoded).unwrap();
    assert_eq!(merged.message_id("ut_metadata"), None);
    assert_eq!(merged.message_id("ut_pex"), Some(2));

    // Optional fields may be absent, but a present field of the wrong
    // type is fatal.
    let bad_port = bencode::decode(b"d1:mde1:p4:manye").unwrap();
    assert!(Extensions::default().merge_handshake(&bad_port).is_err());
}

#[derive(Debug)]
enum Event {
    Connected(Identity),
    Message(Message),
    Closed(PeerError),
}

#[derive(Clone)]
struct Recorder {
    tx: mpsc::UnboundedSender<Event>,
    closes: Arc<AtomicUsize>,
}

fn recorder() -> (Recorder, mpsc::UnboundedReceiver<Event>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        Recorder {
            tx,
            closes: Arc::new(AtomicUsize::new(0)),
        },
        rx,
    )
}

impl ProtocolListener for Recorder {
    fn on_receive(&self, message: Message) -> Result<(), PeerError> {
        let _ = self.tx.send(Event::Message(message));
        Ok(())
    }

    fn on_connect(&self, identity: &Identity) {
        let _ = self.tx.send(Event::Connected(*identity));
    }

    fn on_close(&self, cause: &PeerError) {
        self.closes.fetch_add(1, Ordering::SeqCst);
        let _ = self.tx.send(Event::Closed(cause.clone()));
    }
}

impl PeerEvents for Recorder {
    fn on_connected(&self, identity: &Identity) {
        let _ = self.tx.send(Event::Connected(*identity));
    }

    fn on_message(&self, message: &Message) {
        let _ = self.tx.send(Event::Message(message.clone()));
    }

    fn on_closed(&self, cause: &PeerError) {
        self.closes.fetch_add(1, Ordering::SeqCst);
        let _ = self.tx.send(Event::Closed(cause.clone()));
    }
}

fn local_addr() -> SocketAddr {
    "127.0.0.1:6881".parse().unwrap()
}

fn remote_addr() -> SocketAddr {
    "127.0.0.2:51413".parse().unwrap()
}

fn five_piece_torrent() -> TorrentInfo {
    TorrentInfo::new(InfoHash([7u8; 20]), 16384, 16384 * 5)
}

fn fast_only_extensions() -> Extensions {
    let mut builder = Extensions::builder();
    builder.set_fast_peers(true);
    builder.freeze()
}

async fn next_message(rx: &mut mpsc::UnboundedReceiver<Event>) -> Message {
    loop {
        match rx.recv().await.unwrap() {
            Event::Message(message) => return message,
            Event::Connected(_) => {}
            Event::Closed(cause) => panic!("connection closed: {cause}"),
        }
    }
}

async fn next_close(rx: &mut mpsc::UnboundedReceiver<Event>) -> PeerError {
    loop {
        match rx.recv().await.unwrap() {
            Event::Closed(cause) => return cause,
            _ => {}
        }
    }
}

/// Raw accepting side: read the engine's handshake, echo one back with
/// the given reserved bits.
async fn raw_accept(stream: &mut DuplexStream, reserved: Reserved) -> Handshake {
    let mut bytes = [0u8; HANDSHAKE_LEN];
    stream.read_exact(&mut bytes).await.unwrap();
    let theirs = Handshake::decode(&bytes).unwrap();
    let reply = Handshake::new(reserved, theirs.info_hash, PeerId([9u8; 20]));
    stream.write_all(&reply.encode()).await.unwrap();
    theirs
}

/// Raw dialing side: send a handshake first, then read the echo.
async fn raw_dial(stream: &mut DuplexStream, reserved: Reserved, info_hash: InfoHash) -> Handshake {
    let ours = Handshake::new(reserved, info_hash, PeerId([9u8; 20]));
    stream.write_all(&ours.encode()).await.unwrap();
    let mut bytes = [0u8; HANDSHAKE_LEN];
    stream.read_exact(&mut bytes).await.unwrap();
    Handshake::decode(&bytes).unwrap()
}

/// Reads one frame from the raw side; `None` is a keep-alive.
async fn raw_read_frame(stream: &mut DuplexStream) -> Option<(MessageId, Vec<u8>)> {
    let mut prefix = [0u8; 4];
    stream.read_exact(&mut prefix).await.unwrap();
    let declared = u32::from_be_bytes(prefix) as usize;
    if declared == 0 {
        return None;
    }
    let mut body = vec![0u8; declared];
    stream.read_exact(&mut body).await.unwrap();
    let id = MessageId::try_from(body[0]).unwrap();
    Some((id, body[1..].to_vec()))
}

async fn raw_write_message(stream: &mut DuplexStream, message: &Message) {
    stream.write_all(&message.encode()).await.unwrap();
}

/// Brings up a `Protocol` against a raw scripted remote.
async fn connected_protocol(
    config: ProtocolConfig,
    remote_reserved: Reserved,
) -> (Protocol, Recorder, mpsc::UnboundedReceiver<Event>, DuplexStream) {
    let (local, mut remote) = tokio::io::duplex(64 * 1024);
    let (recorder, rx) = recorder();
    let protocol = Protocol::new(local, remote_addr(), recorder.clone(), config);

    let accept = tokio::spawn(async move {
        raw_accept(&mut remote, remote_reserved).await;
        remote
    });

    protocol
        .establish_outgoing(
            Identity::generate(local_addr()),
            Extensions::supported(),
            InfoHash([7u8; 20]),
        )
        .await
        .unwrap();

    let remote = accept.await.unwrap();
    (protocol, recorder, rx, remote)
}

#[tokio::test]
async fn test_peer_pair_connects() {
    let (a, b) = tokio::io::duplex(64 * 1024);
    let (recorder_a, mut rx_a) = recorder();
    let (recorder_b, mut rx_b) = recorder();

    let peer_a = Peer::new(a, remote_addr(), recorder_a.clone(), PeerConfig::default());
    let peer_b = Peer::new(
        b,
        local_addr(),
        recorder_b.clone(),
        PeerConfig {
            early_possession: EarlyPossession::Buffer,
            ..PeerConfig::default()
        },
    );

    let identity_a = Identity::generate(local_addr());
    let identity_b = Identity::generate(remote_addr());
    let torrent = five_piece_torrent();

    let accept = tokio::spawn({
        let peer_b = peer_b.clone();
        async move {
            peer_b
                .connect_incoming(identity_b, Extensions::supported())
                .await
        }
    });

    let seen_by_a = peer_a
        .connect_outgoing(
            identity_a,
            Extensions::supported(),
            torrent.clone(),
            Bitfield::new(5),
        )
        .await
        .unwrap();
    let seen_by_b = accept.await.unwrap().unwrap();

    assert_eq!(seen_by_a.id(), identity_b.id());
    assert_eq!(seen_by_b.id(), identity_a.id());
    assert!(peer_a.is_connected());
    assert!(peer_b.is_connected());
    assert_eq!(peer_b.info_hash(), Some(torrent.info_hash()));
    assert!(peer_a.extensions().unwrap().has_fast_peers());
    assert!(peer_b.extensions().unwrap().has_extension_protocol());

    peer_b.attach_torrent(torrent, Bitfield::new(5)).unwrap();

    // Both sides have nothing, fast-peer is mutual on both ends, so
    // each announces have-none.
    loop {
        if next_message(&mut rx_b).await == Message::HaveNone {
            break;
        }
    }
    loop {
        if next_message(&mut rx_a).await == Message::HaveNone {
            break;
        }
    }
    assert!(peer_a.remote_pieces().unwrap().is_empty());
    assert!(peer_b.remote_pieces().unwrap().is_empty());
}

#[tokio::test]
async fn test_info_hash_mismatch_closes_before_connect() {
    let (local, mut remote) = tokio::io::duplex(4096);
    let (recorder, mut rx) = recorder();
    let protocol = Protocol::new(
        local,
        remote_addr(),
        recorder.clone(),
        ProtocolConfig::default(),
    );

    tokio::spawn(async move {
        let mut bytes = [0u8; HANDSHAKE_LEN];
        remote.read_exact(&mut bytes).await.unwrap();
        let reply = Handshake::new(Reserved::default(), InfoHash([0xAA; 20]), PeerId([9u8; 20]));
        remote.write_all(&reply.encode()).await.unwrap();
        remote
    });

    let err = protocol
        .establish_outgoing(
            Identity::generate(local_addr()),
            Extensions::supported(),
            InfoHash([7u8; 20]),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, PeerError::InfoHashMismatch));
    assert_eq!(protocol.state(), ConnectionState::Disconnected);
    assert!(matches!(
        rx.recv().await.unwrap(),
        Event::Closed(PeerError::InfoHashMismatch)
    ));
    assert_eq!(recorder.closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_double_establish_rejected() {
    let (protocol, _recorder, _rx, _remote) =
        connected_protocol(ProtocolConfig::default(), Reserved::default()).await;

    let err = protocol
        .establish_outgoing(
            Identity::generate(local_addr()),
            Extensions::supported(),
            InfoHash([7u8; 20]),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, PeerError::AlreadyConnected));
    assert!(protocol.is_connected());
}

#[tokio::test]
async fn test_write_order_and_delivery() {
    let (protocol, _recorder, _rx, mut remote) =
        connected_protocol(ProtocolConfig::default(), Reserved::default()).await;

    let a = protocol.send(Message::Interested).unwrap();
    let b = protocol
        .send_deferred(async { Ok(Message::Have { piece: 3 }) })
        .unwrap();
    let c = protocol.send(Message::Unchoke).unwrap();

    a.await.unwrap();
    b.await.unwrap();
    c.await.unwrap();

    let (id1, _) = raw_read_frame(&mut remote).await.unwrap();
    let (id2, payload2) = raw_read_frame(&mut remote).await.unwrap();
    let (id3, _) = raw_read_frame(&mut remote).await.unwrap();
    assert_eq!(id1, MessageId::Interested);
    assert_eq!(id2, MessageId::Have);
    assert_eq!(payload2, vec![0, 0, 0, 3]);
    assert_eq!(id3, MessageId::Unchoke);
}

#[tokio::test]
async fn test_deferred_producer_failure_closes() {
    let (protocol, recorder, mut rx, _remote) =
        connected_protocol(ProtocolConfig::default(), Reserved::default()).await;

    let delivery = protocol
        .send_deferred(async { Err(PeerError::Protocol("piece read failed".into())) })
        .unwrap();

    assert!(matches!(
        delivery.await.unwrap_err(),
        PeerError::Protocol(_)
    ));
    assert!(matches!(next_close(&mut rx).await, PeerError::Protocol(_)));
    assert_eq!(recorder.closes.load(Ordering::SeqCst), 1);
    assert!(!protocol.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_deferred_producer_timeout_closes() {
    let config = ProtocolConfig {
        operation_timeout: Duration::from_secs(15),
        ..ProtocolConfig::default()
    };
    let (protocol, recorder, mut rx, _remote) =
        connected_protocol(config, Reserved::default()).await;

    // A producer that never resolves is cut off by the operation
    // timeout, which is fatal to the connection.
    let delivery = protocol.send_deferred(std::future::pending()).unwrap();

    assert!(matches!(
        delivery.await.unwrap_err(),
        PeerError::OperationTimeout
    ));
    assert!(matches!(
        next_close(&mut rx).await,
        PeerError::OperationTimeout
    ));
    assert_eq!(recorder.closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_oversized_send_rejected() {
    let config = ProtocolConfig {
        write_buffer_size: 64,
        ..ProtocolConfig::default()
    };
    let (protocol, recorder, _rx, _remote) =
        connected_protocol(config, Reserved::default()).await;

    let delivery = protocol
        .send(Message::Piece {
            index: 0,
            begin: 0,
            data: Bytes::from(vec![0u8; 128]),
        })
        .unwrap();
    assert!(matches!(
        delivery.await.unwrap_err(),
        PeerError::InvalidMessage(_)
    ));
    // An unwritable message is fatal, not silently skipped.
    assert_eq!(recorder.closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_keepalive_frame_not_delivered() {
    let (protocol, _recorder, mut rx, mut remote) =
        connected_protocol(ProtocolConfig::default(), Reserved::default()).await;

    assert!(protocol.last_incoming_message_time().is_some());

    // Keep-alive, then a real message. Only the real message reaches
    // the listener.
    remote.write_all(&[0, 0, 0, 0]).await.unwrap();
    raw_write_message(&mut remote, &Message::Choke).await;

    assert_eq!(next_message(&mut rx).await, Message::Choke);
    assert!(protocol.last_incoming_message_time().is_some());
}

#[tokio::test]
async fn test_close_is_idempotent() {
    let (protocol, recorder, mut rx, _remote) =
        connected_protocol(ProtocolConfig::default(), Reserved::default()).await;

    protocol.close();
    protocol.close();

    assert!(matches!(
        next_close(&mut rx).await,
        PeerError::Shutdown
    ));
    assert_eq!(recorder.closes.load(Ordering::SeqCst), 1);
    assert!(matches!(
        protocol.send(Message::Choke),
        Err(PeerError::NotConnected)
    ));
    assert_eq!(protocol.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_remote_eof_closes() {
    let (_protocol, _recorder, mut rx, remote) =
        connected_protocol(ProtocolConfig::default(), Reserved::default()).await;

    drop(remote);
    assert!(matches!(
        next_close(&mut rx).await,
        PeerError::ConnectionClosed
    ));
}

#[tokio::test(start_paused = true)]
async fn test_read_timeout_closes() {
    let config = ProtocolConfig {
        read_timeout: Duration::from_secs(5),
        keepalive_interval: Duration::from_secs(60),
        ..ProtocolConfig::default()
    };
    let (_protocol, recorder, mut rx, _remote) =
        connected_protocol(config, Reserved::default()).await;

    assert!(matches!(next_close(&mut rx).await, PeerError::ReadTimeout));
    assert_eq!(recorder.closes.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_keepalive_sent_while_idle() {
    let (_protocol, _recorder, _rx, mut remote) =
        connected_protocol(ProtocolConfig::default(), Reserved::default()).await;

    // Nothing is enqueued, so the first frame on the wire after one
    // interval is a bare zero length prefix.
    let mut prefix = [0u8; 4];
    remote.read_exact(&mut prefix).await.unwrap();
    assert_eq!(prefix, [0, 0, 0, 0]);
}

#[tokio::test(start_paused = true)]
async fn test_inactivity_disconnect_when_configured() {
    let config = ProtocolConfig {
        read_timeout: Duration::from_secs(1000),
        keepalive_interval: Duration::from_secs(60),
        inactivity_timeout: Some(Duration::from_secs(150)),
        ..ProtocolConfig::default()
    };
    let (_protocol, _recorder, mut rx, _remote) =
        connected_protocol(config, Reserved::default()).await;

    assert!(matches!(next_close(&mut rx).await, PeerError::Inactive));
}

/// Brings up a `Peer` session against a raw scripted remote.
async fn connected_peer(
    config: PeerConfig,
    remote_reserved: Reserved,
    local_extensions: Extensions,
    local_pieces: Bitfield,
) -> (Peer, Recorder, mpsc::UnboundedReceiver<Event>, DuplexStream) {
    let (local, mut remote) = tokio::io::duplex(64 * 1024);
    let (recorder, rx) = recorder();
    let peer = Peer::new(local, remote_addr(), recorder.clone(), config);

    let accept = tokio::spawn(async move {
        raw_accept(&mut remote, remote_reserved).await;
        remote
    });

    peer.connect_outgoing(
        Identity::generate(local_addr()),
        local_extensions,
        five_piece_torrent(),
        local_pieces,
    )
    .await
    .unwrap();

    let remote = accept.await.unwrap();
    (peer, recorder, rx, remote)
}

#[tokio::test]
async fn test_have_all_announced_when_complete_and_fast() {
    let (_peer, _recorder, _rx, mut remote) = connected_peer(
        PeerConfig::default(),
        fast_only_extensions().reserved(),
        fast_only_extensions(),
        Bitfield::full(5),
    )
    .await;

    let (id, payload) = raw_read_frame(&mut remote).await.unwrap();
    assert_eq!(id, MessageId::HaveAll);
    assert!(payload.is_empty());
}

#[tokio::test]
async fn test_bitfield_announced_without_fast() {
    let mut local_pieces = Bitfield::new(5);
    local_pieces.set(0).unwrap();
    local_pieces.set(2).unwrap();
    local_pieces.set(4).unwrap();

    let (_peer, _recorder, _rx, mut remote) = connected_peer(
        PeerConfig::default(),
        Reserved::default(),
        fast_only_extensions(),
        local_pieces,
    )
    .await;

    let (id, payload) = raw_read_frame(&mut remote).await.unwrap();
    assert_eq!(id, MessageId::Bitfield);
    assert_eq!(payload, vec![0b0001_0101]);
}

#[tokio::test]
async fn test_remote_possession_tracking() {
    let (peer, _recorder, mut rx, mut remote) = connected_peer(
        PeerConfig::default(),
        Reserved::default(),
        Extensions::default(),
        Bitfield::new(5),
    )
    .await;

    raw_write_message(
        &mut remote,
        &Message::Bitfield(Bytes::from_static(&[0b0000_0101])),
    )
    .await;
    raw_write_message(&mut remote, &Message::Have { piece: 4 }).await;

    assert!(matches!(next_message(&mut rx).await, Message::Bitfield(_)));
    assert_eq!(next_message(&mut rx).await, Message::Have { piece: 4 });

    let remote_pieces = peer.remote_pieces().unwrap();
    assert!(remote_pieces.get(0));
    assert!(remote_pieces.get(2));
    assert!(remote_pieces.get(4));
    assert_eq!(remote_pieces.count(), 3);

    // A second bitfield ORs into the mirror.
    raw_write_message(
        &mut remote,
        &Message::Bitfield(Bytes::from_static(&[0b0000_0010])),
    )
    .await;
    assert!(matches!(next_message(&mut rx).await, Message::Bitfield(_)));
    assert_eq!(peer.remote_pieces().unwrap().count(), 4);
}

#[tokio::test]
async fn test_out_of_range_have_is_fatal() {
    let (_peer, _recorder, mut rx, mut remote) = connected_peer(
        PeerConfig::default(),
        Reserved::default(),
        Extensions::default(),
        Bitfield::new(5),
    )
    .await;

    raw_write_message(&mut remote, &Message::Have { piece: 5 }).await;
    assert!(matches!(
        next_close(&mut rx).await,
        PeerError::Dispatch {
            id: MessageId::Have,
            ..
        }
    ));
}

#[tokio::test]
async fn test_have_all_without_fast_is_fatal() {
    let (_peer, _recorder, mut rx, mut remote) = connected_peer(
        PeerConfig::default(),
        Reserved::default(),
        Extensions::default(),
        Bitfield::new(5),
    )
    .await;

    raw_write_message(&mut remote, &Message::HaveAll).await;
    assert!(matches!(
        next_close(&mut rx).await,
        PeerError::Dispatch {
            id: MessageId::HaveAll,
            ..
        }
    ));
}

#[tokio::test]
async fn test_choke_interest_transitions() {
    let (peer, _recorder, mut rx, mut remote) = connected_peer(
        PeerConfig::default(),
        Reserved::default(),
        Extensions::default(),
        Bitfield::new(5),
    )
    .await;

    assert_eq!(peer.choke_state(), ChokeState::default());

    raw_write_message(&mut remote, &Message::Unchoke).await;
    raw_write_message(&mut remote, &Message::Interested).await;
    assert_eq!(next_message(&mut rx).await, Message::Unchoke);
    assert_eq!(next_message(&mut rx).await, Message::Interested);
    assert!(!peer.peer_choking());
    assert!(peer.peer_interested());

    // Skip our possession announcement.
    let (id, _) = raw_read_frame(&mut remote).await.unwrap();
    assert_eq!(id, MessageId::Bitfield);

    // Local intents update state once queued; repeats are no-ops.
    peer.interested().unwrap();
    peer.interested().unwrap();
    peer.unchoke().unwrap();
    assert!(peer.am_interested());
    assert!(!peer.am_choking());

    let (id, _) = raw_read_frame(&mut remote).await.unwrap();
    assert_eq!(id, MessageId::Interested);
    let (id, _) = raw_read_frame(&mut remote).await.unwrap();
    assert_eq!(id, MessageId::Unchoke);
}

#[tokio::test]
async fn test_announce_have_sets_and_sends() {
    let (peer, _recorder, _rx, mut remote) = connected_peer(
        PeerConfig::default(),
        Reserved::default(),
        Extensions::default(),
        Bitfield::new(5),
    )
    .await;

    let (id, _) = raw_read_frame(&mut remote).await.unwrap();
    assert_eq!(id, MessageId::Bitfield);

    peer.announce_have(2).unwrap();
    assert!(peer.local_pieces().unwrap().get(2));
    assert!(matches!(
        peer.announce_have(5),
        Err(PeerError::Protocol(_))
    ));
    assert_eq!(peer.local_pieces().unwrap().count(), 1);

    let (id, payload) = raw_read_frame(&mut remote).await.unwrap();
    assert_eq!(id, MessageId::Have);
    assert_eq!(payload, vec![0, 0, 0, 2]);

    // A rejected send leaves the local bitfield untouched.
    peer.close();
    assert!(matches!(
        peer.announce_have(3),
        Err(PeerError::NotConnected)
    ));
    assert!(!peer.local_pieces().unwrap().get(3));
}

#[tokio::test]
async fn test_extension_handshake_exchange() {
    let mut reserved = Extensions::builder();
    reserved.set_extension_protocol(true);

    let (peer, _recorder, mut rx, mut remote) = connected_peer(
        PeerConfig::default(),
        reserved.freeze().reserved(),
        Extensions::supported(),
        Bitfield::new(5),
    )
    .await;

    // The session greets with its own extension handshake before the
    // possession announcement.
    let (id, payload) = raw_read_frame(&mut remote).await.unwrap();
    assert_eq!(id, MessageId::Extended);
    assert_eq!(payload[0], EXTENSION_HANDSHAKE_ID);
    let dict = bencode::decode(&payload[1..]).unwrap();
    assert!(dict.get(b"m").is_some());
    let (id, _) = raw_read_frame(&mut remote).await.unwrap();
    assert_eq!(id, MessageId::Bitfield);

    let theirs =
        bencode::decode(b"d1:md11:ut_metadatai3ee1:pi6881e4:reqqi250e1:v8:test/1.0e").unwrap();
    raw_write_message(
        &mut remote,
        &Message::Extended {
            id: EXTENSION_HANDSHAKE_ID,
            payload: Bytes::from(bencode::encode(&theirs)),
        },
    )
    .await;

    assert!(matches!(
        next_message(&mut rx).await,
        Message::Extended { .. }
    ));
    let merged = peer.extensions().unwrap();
    assert_eq!(merged.message_id("ut_metadata"), Some(3));
    assert_eq!(merged.listen_port(), Some(6881));
    assert_eq!(merged.client_version(), Some("test/1.0"));
    assert_eq!(merged.max_outstanding_requests(), Some(250));
}

#[tokio::test]
async fn test_early_possession_buffered_until_attach() {
    let (local, mut remote) = tokio::io::duplex(64 * 1024);
    let (recorder, mut rx) = recorder();
    let peer = Peer::new(
        local,
        remote_addr(),
        recorder.clone(),
        PeerConfig {
            early_possession: EarlyPossession::Buffer,
            ..PeerConfig::default()
        },
    );

    let torrent = five_piece_torrent();
    let info_hash = torrent.info_hash();
    let dial = tokio::spawn(async move {
        raw_dial(&mut remote, Reserved::default(), info_hash).await;
        raw_write_message(
            &mut remote,
            &Message::Bitfield(Bytes::from_static(&[0b0001_0101])),
        )
        .await;
        remote
    });

    peer.connect_incoming(Identity::generate(local_addr()), Extensions::supported())
        .await
        .unwrap();
    let _remote = dial.await.unwrap();

    assert!(matches!(next_message(&mut rx).await, Message::Bitfield(_)));
    assert!(peer.remote_pieces().is_none());

    peer.attach_torrent(torrent, Bitfield::new(5)).unwrap();
    let remote_pieces = peer.remote_pieces().unwrap();
    assert_eq!(remote_pieces.count(), 3);
    assert!(remote_pieces.get(0));
    assert!(remote_pieces.get(2));
    assert!(remote_pieces.get(4));
}

#[tokio::test]
async fn test_buffered_possession_replay_failure_closes() {
    let (local, mut remote) = tokio::io::duplex(64 * 1024);
    let (recorder, mut rx) = recorder();
    let peer = Peer::new(
        local,
        remote_addr(),
        recorder.clone(),
        PeerConfig {
            early_possession: EarlyPossession::Buffer,
            ..PeerConfig::default()
        },
    );

    let dial = tokio::spawn(async move {
        raw_dial(&mut remote, Reserved::default(), InfoHash([7u8; 20])).await;
        raw_write_message(&mut remote, &Message::Have { piece: 9 }).await;
        remote
    });

    peer.connect_incoming(Identity::generate(local_addr()), Extensions::supported())
        .await
        .unwrap();
    let _remote = dial.await.unwrap();

    // The out-of-range have is buffered without validation; the
    // violation only surfaces on replay, and closes the connection.
    assert_eq!(next_message(&mut rx).await, Message::Have { piece: 9 });
    let err = peer
        .attach_torrent(five_piece_torrent(), Bitfield::new(5))
        .unwrap_err();
    assert!(matches!(err, PeerError::Protocol(_)));
    assert!(matches!(next_close(&mut rx).await, PeerError::Protocol(_)));
    assert_eq!(recorder.closes.load(Ordering::SeqCst), 1);
    assert!(!peer.is_connected());
}

#[tokio::test]
async fn test_early_possession_rejected_by_default() {
    let (local, mut remote) = tokio::io::duplex(64 * 1024);
    let (recorder, mut rx) = recorder();
    let peer = Peer::new(local, remote_addr(), recorder.clone(), PeerConfig::default());

    let dial = tokio::spawn(async move {
        raw_dial(&mut remote, Reserved::default(), InfoHash([7u8; 20])).await;
        raw_write_message(
            &mut remote,
            &Message::Bitfield(Bytes::from_static(&[0b0001_0101])),
        )
        .await;
        remote
    });

    peer.connect_incoming(Identity::generate(local_addr()), Extensions::supported())
        .await
        .unwrap();
    let _remote = dial.await.unwrap();

    assert!(matches!(
        next_close(&mut rx).await,
        PeerError::Dispatch {
            id: MessageId::Bitfield,
            ..
        }
    ));
}
