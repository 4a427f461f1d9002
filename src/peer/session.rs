use super::bitfield::Bitfield;
use super::error::PeerError;
use super::extensions::{Extensions, EXTENSION_HANDSHAKE_ID};
use super::identity::Identity;
use super::message::Message;
use super::protocol::{
    ConnectionState, Delivery, Protocol, ProtocolConfig, ProtocolListener, Transport,
};
use crate::bencode;
use crate::metainfo::{InfoHash, TorrentInfo};
use bytes::Bytes;
use parking_lot::Mutex;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use tracing::debug;

/// Owner-facing lifecycle hooks for a peer session.
///
/// All hooks run on the connection's I/O tasks; implementations should
/// hand heavy work off rather than block. Every method has a no-op
/// default so test doubles and simple owners implement only what they
/// observe.
pub trait PeerEvents: Send + Sync + 'static {
    /// The handshake completed and the connection is usable.
    fn on_connected(&self, _identity: &Identity) {}

    /// A message arrived, after the session applied it to its own
    /// state. Fires for every typed message, including ones the session
    /// consumed (choke, bitfield, extension handshake, ...).
    fn on_message(&self, _message: &Message) {}

    /// The connection closed; fires exactly once.
    fn on_closed(&self, _cause: &PeerError) {}
}

/// What to do with possession messages (`bitfield`, `have`, `have-all`,
/// `have-none`) that arrive before a torrent has been attached to an
/// incoming connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EarlyPossession {
    /// Treat early possession as a protocol violation and close.
    #[default]
    Reject,
    /// Buffer the messages and apply them when the torrent is attached.
    Buffer,
}

/// Session-level settings, wrapping the connection timer settings.
#[derive(Debug, Clone, Default)]
pub struct PeerConfig {
    pub protocol: ProtocolConfig,
    pub early_possession: EarlyPossession,
}

/// Snapshot of the four choke/interest booleans.
///
/// Fresh connections start choked and uninterested in both directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChokeState {
    pub am_choking: bool,
    pub am_interested: bool,
    pub peer_choking: bool,
    pub peer_interested: bool,
}

impl Default for ChokeState {
    fn default() -> Self {
        Self {
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
        }
    }
}

struct SessionState {
    torrent: Option<TorrentInfo>,
    local_pieces: Option<Bitfield>,
    remote_pieces: Option<Bitfield>,
    choke: ChokeState,
    local_extensions: Extensions,
    early_possession: Vec<Message>,
}

impl SessionState {
    fn new() -> Self {
        Self {
            torrent: None,
            local_pieces: None,
            remote_pieces: None,
            choke: ChokeState::default(),
            local_extensions: Extensions::default(),
            early_possession: Vec::new(),
        }
    }
}

/// A peer session: a connection plus the per-peer exchange state layered
/// on top of it.
///
/// The session applies received messages to its choke/interest booleans
/// and possession mirrors before forwarding them to the owner through
/// [`PeerEvents`], and performs the connect-time announcements
/// (extension handshake, possession) on the owner's behalf. Clones
/// share the same session.
#[derive(Clone)]
pub struct Peer {
    inner: Arc<PeerInner>,
}

struct PeerInner {
    protocol: Protocol,
    events: Box<dyn PeerEvents>,
    early_possession: EarlyPossession,
    state: Mutex<SessionState>,
}

/// Dispatch adapter between the connection and the session.
///
/// Holds only a weak back-reference, so dropping the last [`Peer`]
/// handle tears the connection down instead of the I/O tasks keeping
/// the session alive forever.
struct SessionListener {
    session: Weak<PeerInner>,
}

impl ProtocolListener for SessionListener {
    fn on_receive(&self, message: Message) -> Result<(), PeerError> {
        match self.session.upgrade() {
            Some(session) => session.handle_receive(message),
            None => Err(PeerError::Shutdown),
        }
    }

    fn on_connect(&self, identity: &Identity) {
        if let Some(session) = self.session.upgrade() {
            session.handle_connect(identity);
        }
    }

    fn on_close(&self, cause: &PeerError) {
        if let Some(session) = self.session.upgrade() {
            session.events.on_closed(cause);
        }
    }
}

impl Peer {
    /// Creates a session over an unconnected transport. Nothing touches
    /// the wire until one of the connect methods is called.
    pub fn new(
        transport: impl Transport,
        peer_addr: SocketAddr,
        events: impl PeerEvents,
        config: PeerConfig,
    ) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<PeerInner>| {
            let listener = SessionListener {
                session: weak.clone(),
            };
            PeerInner {
                protocol: Protocol::new(transport, peer_addr, listener, config.protocol),
                events: Box::new(events),
                early_possession: config.early_possession,
                state: Mutex::new(SessionState::new()),
            }
        });
        Self { inner }
    }

    /// Connects to a peer we dialed for a known torrent.
    ///
    /// `local_pieces` must be sized to the torrent's piece count. On
    /// success the session has already sent its extension handshake
    /// (when mutually supported) and possession announcement.
    pub async fn connect_outgoing(
        &self,
        local_identity: Identity,
        local_extensions: Extensions,
        torrent: TorrentInfo,
        local_pieces: Bitfield,
    ) -> Result<Identity, PeerError> {
        check_shape(&torrent, &local_pieces)?;
        let info_hash = torrent.info_hash();
        {
            let mut state = self.inner.state.lock();
            state.local_extensions = local_extensions.clone();
            state.remote_pieces = Some(Bitfield::new(torrent.piece_count()));
            state.local_pieces = Some(local_pieces);
            state.torrent = Some(torrent);
        }
        self.inner
            .protocol
            .establish_outgoing(local_identity, local_extensions, info_hash)
            .await
    }

    /// Accepts a connection a peer dialed to us.
    ///
    /// The torrent is not known until the peer's handshake arrives;
    /// after this returns, read the negotiated [`Peer::info_hash`],
    /// look the torrent up, and call [`Peer::attach_torrent`]. Until
    /// then possession messages follow the
    /// [`EarlyPossession`] policy.
    pub async fn connect_incoming(
        &self,
        local_identity: Identity,
        local_extensions: Extensions,
    ) -> Result<Identity, PeerError> {
        self.inner.state.lock().local_extensions = local_extensions.clone();
        self.inner
            .protocol
            .establish_incoming(local_identity, local_extensions)
            .await
    }

    /// Associates an incoming connection with its torrent, sized
    /// possession mirrors included, and sends the deferred possession
    /// announcement. Replays any buffered early possession messages.
    pub fn attach_torrent(
        &self,
        torrent: TorrentInfo,
        local_pieces: Bitfield,
    ) -> Result<(), PeerError> {
        check_shape(&torrent, &local_pieces)?;
        if let Some(negotiated) = self.inner.protocol.info_hash() {
            if negotiated != torrent.info_hash() {
                return Err(PeerError::InfoHashMismatch);
            }
        }

        let buffered = {
            let mut state = self.inner.state.lock();
            if state.torrent.is_some() {
                return Err(PeerError::Protocol("torrent already attached".into()));
            }
            state.remote_pieces = Some(Bitfield::new(torrent.piece_count()));
            state.local_pieces = Some(local_pieces);
            state.torrent = Some(torrent);
            std::mem::take(&mut state.early_possession)
        };

        self.inner.announce_possession()?;
        for message in buffered {
            // A buffered message that fails validation on replay is a
            // protocol violation like any other; it closes the
            // connection rather than leaving it half-applied.
            if let Err(cause) = self.inner.apply_possession(&message) {
                self.inner.protocol.close_with(cause.clone());
                return Err(cause);
            }
        }
        Ok(())
    }

    /// Chokes the peer. No-op if already choking; otherwise enqueues
    /// `choke` and updates local state once the send is queued.
    pub fn choke(&self) -> Result<(), PeerError> {
        let mut state = self.inner.state.lock();
        if state.choke.am_choking {
            return Ok(());
        }
        self.inner.protocol.send(Message::Choke)?;
        state.choke.am_choking = true;
        Ok(())
    }

    /// Unchokes the peer. No-op if already not choking.
    pub fn unchoke(&self) -> Result<(), PeerError> {
        let mut state = self.inner.state.lock();
        if !state.choke.am_choking {
            return Ok(());
        }
        self.inner.protocol.send(Message::Unchoke)?;
        state.choke.am_choking = false;
        Ok(())
    }

    /// Declares interest in the peer's pieces. No-op if already
    /// interested.
    pub fn interested(&self) -> Result<(), PeerError> {
        let mut state = self.inner.state.lock();
        if state.choke.am_interested {
            return Ok(());
        }
        self.inner.protocol.send(Message::Interested)?;
        state.choke.am_interested = true;
        Ok(())
    }

    /// Withdraws interest. No-op if already not interested.
    pub fn not_interested(&self) -> Result<(), PeerError> {
        let mut state = self.inner.state.lock();
        if !state.choke.am_interested {
            return Ok(());
        }
        self.inner.protocol.send(Message::NotInterested)?;
        state.choke.am_interested = false;
        Ok(())
    }

    /// Marks a locally completed piece and announces it with `have`.
    ///
    /// The bit is only set once the send is queued; a rejected send
    /// leaves the local bitfield untouched.
    pub fn announce_have(&self, piece: u32) -> Result<(), PeerError> {
        let mut state = self.inner.state.lock();
        let local = state
            .local_pieces
            .as_mut()
            .ok_or(PeerError::NotConnected)?;
        if piece as usize >= local.piece_count() {
            return Err(PeerError::Protocol(format!(
                "invalid piece index, expected [0, {}), actual {piece}",
                local.piece_count()
            )));
        }
        self.inner.protocol.send(Message::Have { piece })?;
        local.set(piece as usize)?;
        Ok(())
    }

    /// Enqueues an arbitrary message, returning its completion handle.
    pub fn send(&self, message: Message) -> Result<Delivery, PeerError> {
        self.inner.protocol.send(message)
    }

    /// Enqueues an asynchronously produced message (typically `piece`
    /// data read from disk when its turn in the write queue comes up).
    pub fn send_deferred<F>(&self, payload: F) -> Result<Delivery, PeerError>
    where
        F: Future<Output = Result<Message, PeerError>> + Send + 'static,
    {
        self.inner.protocol.send_deferred(payload)
    }

    pub fn close(&self) {
        self.inner.protocol.close();
    }

    pub fn close_with(&self, cause: PeerError) {
        self.inner.protocol.close_with(cause);
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.protocol.state()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.protocol.is_connected()
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.protocol.peer_addr()
    }

    pub fn info_hash(&self) -> Option<InfoHash> {
        self.inner.protocol.info_hash()
    }

    pub fn identity(&self) -> Option<Identity> {
        self.inner.protocol.identity()
    }

    /// The peer's current capability snapshot, including anything a
    /// received extension handshake merged in.
    pub fn extensions(&self) -> Option<Extensions> {
        self.inner.protocol.extensions()
    }

    pub fn close_cause(&self) -> Option<PeerError> {
        self.inner.protocol.close_cause()
    }

    pub fn torrent(&self) -> Option<TorrentInfo> {
        self.inner.state.lock().torrent.clone()
    }

    pub fn choke_state(&self) -> ChokeState {
        self.inner.state.lock().choke
    }

    pub fn am_choking(&self) -> bool {
        self.inner.state.lock().choke.am_choking
    }

    pub fn am_interested(&self) -> bool {
        self.inner.state.lock().choke.am_interested
    }

    pub fn peer_choking(&self) -> bool {
        self.inner.state.lock().choke.peer_choking
    }

    pub fn peer_interested(&self) -> bool {
        self.inner.state.lock().choke.peer_interested
    }

    /// Snapshot of the pieces the peer has claimed so far.
    pub fn remote_pieces(&self) -> Option<Bitfield> {
        self.inner.state.lock().remote_pieces.clone()
    }

    /// Snapshot of the local possession vector.
    pub fn local_pieces(&self) -> Option<Bitfield> {
        self.inner.state.lock().local_pieces.clone()
    }
}

impl PeerInner {
    /// Both sides advertised fast-peer support.
    fn mutual_fast_peers(&self) -> bool {
        self.state.lock().local_extensions.has_fast_peers()
            && self
                .protocol
                .extensions()
                .is_some_and(|peer| peer.has_fast_peers())
    }

    /// Both sides advertised the extension protocol.
    fn mutual_extension_protocol(&self) -> bool {
        self.state.lock().local_extensions.has_extension_protocol()
            && self
                .protocol
                .extensions()
                .is_some_and(|peer| peer.has_extension_protocol())
    }

    fn handle_connect(&self, identity: &Identity) {
        if let Err(cause) = self.send_greetings() {
            self.protocol.close_with(cause);
            return;
        }
        self.events.on_connected(identity);
    }

    /// Connect-time announcements: extension handshake first (when
    /// mutually supported), possession second (when the torrent is
    /// already known).
    fn send_greetings(&self) -> Result<(), PeerError> {
        if self.mutual_extension_protocol() {
            let handshake = self.state.lock().local_extensions.to_handshake();
            debug!(peer = %self.protocol.peer_addr(), "sending extension handshake");
            self.protocol.send(Message::Extended {
                id: EXTENSION_HANDSHAKE_ID,
                payload: Bytes::from(bencode::encode(&handshake)),
            })?;
        }
        if self.state.lock().torrent.is_some() {
            self.announce_possession()?;
        }
        Ok(())
    }

    /// Sends the possession announcement: `have-all`/`have-none` when
    /// fast-peer is mutual and the local bitfield is complete/empty,
    /// the full `bitfield` otherwise.
    fn announce_possession(&self) -> Result<(), PeerError> {
        let local = match self.state.lock().local_pieces.clone() {
            Some(local) => local,
            None => return Ok(()),
        };
        let message = if self.mutual_fast_peers() && local.is_complete() {
            Message::HaveAll
        } else if self.mutual_fast_peers() && local.is_empty() {
            Message::HaveNone
        } else {
            Message::Bitfield(local.to_bytes())
        };
        self.protocol.send(message)?;
        Ok(())
    }

    fn handle_receive(&self, message: Message) -> Result<(), PeerError> {
        match &message {
            Message::Choke => self.state.lock().choke.peer_choking = true,
            Message::Unchoke => self.state.lock().choke.peer_choking = false,
            Message::Interested => self.state.lock().choke.peer_interested = true,
            Message::NotInterested => self.state.lock().choke.peer_interested = false,
            Message::Have { .. }
            | Message::Bitfield(_)
            | Message::HaveAll
            | Message::HaveNone => self.handle_possession(&message)?,
            Message::Extended { id, payload } if *id == EXTENSION_HANDSHAKE_ID => {
                self.handle_extension_handshake(payload)?;
            }
            Message::Extended { id, .. } => {
                // Unknown sub-extensions are the owner's business.
                debug!(peer = %self.protocol.peer_addr(), id = *id, "forwarding extended message");
            }
            _ => {}
        }
        self.events.on_message(&message);
        Ok(())
    }

    fn handle_possession(&self, message: &Message) -> Result<(), PeerError> {
        if matches!(message, Message::HaveAll | Message::HaveNone)
            && !self.mutual_fast_peers()
        {
            return Err(PeerError::Protocol(format!(
                "{:?} received without mutual fast-peer support",
                message.id()
            )));
        }

        {
            let mut state = self.state.lock();
            if state.torrent.is_none() {
                if self.early_possession == EarlyPossession::Buffer {
                    debug!(
                        peer = %self.protocol.peer_addr(),
                        id = ?message.id(),
                        "buffering possession message until torrent attach"
                    );
                    state.early_possession.push(message.clone());
                    return Ok(());
                }
                return Err(PeerError::Protocol(format!(
                    "{:?} received before a torrent was attached",
                    message.id()
                )));
            }
        }

        self.apply_possession(message)
    }

    fn apply_possession(&self, message: &Message) -> Result<(), PeerError> {
        let mut state = self.state.lock();
        let piece_count = match &state.torrent {
            Some(torrent) => torrent.piece_count(),
            None => return Err(PeerError::NotConnected),
        };
        let remote = state
            .remote_pieces
            .as_mut()
            .ok_or(PeerError::NotConnected)?;
        match message {
            Message::Have { piece } => remote.set(*piece as usize)?,
            Message::Bitfield(bytes) => {
                // Repeated bitfields accumulate; a mismatched length is
                // fatal before any bit is applied.
                let incoming = Bitfield::from_bytes(bytes, piece_count)?;
                remote.union(&incoming)?;
            }
            Message::HaveAll => remote.set_all(),
            Message::HaveNone => remote.clear_all(),
            _ => {}
        }
        Ok(())
    }

    fn handle_extension_handshake(&self, payload: &Bytes) -> Result<(), PeerError> {
        let value = bencode::decode(payload)?;
        let current = self
            .protocol
            .extensions()
            .ok_or(PeerError::NotConnected)?;
        let merged = current.merge_handshake(&value)?;
        debug!(
            peer = %self.protocol.peer_addr(),
            version = merged.client_version().unwrap_or("unknown"),
            "merged extension handshake"
        );
        self.protocol.set_extensions(merged);
        Ok(())
    }
}

impl Drop for PeerInner {
    fn drop(&mut self) {
        self.protocol.close();
    }
}

fn check_shape(torrent: &TorrentInfo, local_pieces: &Bitfield) -> Result<(), PeerError> {
    if local_pieces.piece_count() != torrent.piece_count() {
        return Err(PeerError::Protocol(format!(
            "local bitfield shape mismatch, expected {} pieces, actual {}",
            torrent.piece_count(),
            local_pieces.piece_count()
        )));
    }
    Ok(())
}
