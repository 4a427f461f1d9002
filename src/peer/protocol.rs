use super::error::PeerError;
use super::extensions::Extensions;
use super::identity::Identity;
use super::message::{Handshake, Message, MessageId, FRAME_HEADER_LEN, HANDSHAKE_LEN};
use crate::metainfo::InfoHash;
use bytes::{Buf, BufMut, BytesMut};
use parking_lot::Mutex;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Any bidirectional byte stream with asynchronous partial reads and
/// writes: a TCP socket, a pipe, or an in-memory test double.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + 'static> Transport for T {}

/// The lifecycle hooks a connection owner implements.
///
/// `on_receive` runs on the connection's read task, strictly in wire
/// order; returning an error is fatal to the connection. `on_close` is
/// invoked exactly once per connection, whichever side or timer caused
/// the close.
pub trait ProtocolListener: Send + Sync + 'static {
    fn on_receive(&self, message: Message) -> Result<(), PeerError>;
    fn on_connect(&self, identity: &Identity);
    fn on_close(&self, cause: &PeerError);
}

/// Timer and buffer settings for a connection.
///
/// The read/write/handshake timeouts are scoped per I/O attempt, not
/// per connection lifetime, so a slow but steady peer is never
/// penalized while a stalled one is dropped deterministically.
#[derive(Debug, Clone)]
pub struct ProtocolConfig {
    /// Bound on each transport read attempt.
    pub read_timeout: Duration,
    /// Bound on each transport write attempt.
    pub write_timeout: Duration,
    /// Bound on the entire handshake read+write sequence.
    pub handshake_timeout: Duration,
    /// Bound on a deferred payload producer.
    pub operation_timeout: Duration,
    /// Keep-alive send interval while the write pipeline is idle.
    pub keepalive_interval: Duration,
    /// When set, a peer silent for longer than this is disconnected on
    /// the next keep-alive tick. Off by default; clients that want the
    /// policy typically use 150 seconds.
    pub inactivity_timeout: Option<Duration>,
    /// Read reassembly buffer capacity; frames larger than this are a
    /// protocol violation, not an allocation.
    pub read_buffer_size: usize,
    /// Write buffer capacity; payloads larger than this minus the
    /// 5-byte header are rejected.
    pub write_buffer_size: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_secs(120),
            write_timeout: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(10),
            operation_timeout: Duration::from_secs(15),
            keepalive_interval: Duration::from_secs(60),
            inactivity_timeout: None,
            read_buffer_size: 36 * 1024,
            write_buffer_size: 36 * 1024,
        }
    }
}

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

const STATE_DISCONNECTED: u8 = 0;
const STATE_CONNECTING: u8 = 1;
const STATE_CONNECTED: u8 = 2;

/// Completion handle for an enqueued outbound message.
///
/// Resolves `Ok` only after the full frame (length prefix, type id,
/// payload) has been accepted by the transport; resolves `Err` with the
/// close cause if the connection dies first.
pub struct Delivery {
    rx: oneshot::Receiver<Result<(), PeerError>>,
}

impl Future for Delivery {
    type Output = Result<(), PeerError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(PeerError::NotConnected)),
            Poll::Pending => Poll::Pending,
        }
    }
}

type PayloadFuture = Pin<Box<dyn Future<Output = Result<Message, PeerError>> + Send>>;

enum Outgoing {
    Ready(Message),
    Deferred(PayloadFuture),
}

struct Pending {
    outgoing: Outgoing,
    delivery: oneshot::Sender<Result<(), PeerError>>,
}

struct Shared {
    transport: Option<Box<dyn Transport>>,
    info_hash: Option<InfoHash>,
    identity: Option<Identity>,
    extensions: Option<Extensions>,
    write_tx: Option<mpsc::UnboundedSender<Pending>>,
    close_cause: Option<PeerError>,
    last_incoming: Option<Instant>,
    last_outgoing: Option<Instant>,
}

/// One peer wire connection: handshake state machine, message framing
/// engine, and timeout/keep-alive supervisor over a byte-stream
/// transport.
///
/// A `Protocol` is a cheap handle; clones refer to the same
/// connection. It connects at most once (`establish_outgoing` or
/// `establish_incoming`), after which one read task and one write task
/// drive the stream until [`Protocol::close`] or a fatal error tears
/// everything down through the single close path.
#[derive(Clone)]
pub struct Protocol {
    inner: Arc<Inner>,
}

struct Inner {
    listener: Box<dyn ProtocolListener>,
    config: ProtocolConfig,
    peer_addr: SocketAddr,
    state: AtomicU8,
    closed: AtomicBool,
    cancel: CancellationToken,
    shared: Mutex<Shared>,
}

impl Protocol {
    pub fn new(
        transport: impl Transport,
        peer_addr: SocketAddr,
        listener: impl ProtocolListener,
        config: ProtocolConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                listener: Box::new(listener),
                config,
                peer_addr,
                state: AtomicU8::new(STATE_DISCONNECTED),
                closed: AtomicBool::new(false),
                cancel: CancellationToken::new(),
                shared: Mutex::new(Shared {
                    transport: Some(Box::new(transport)),
                    info_hash: None,
                    identity: None,
                    extensions: None,
                    write_tx: None,
                    close_cause: None,
                    last_incoming: None,
                    last_outgoing: None,
                }),
            }),
        }
    }

    /// Connects to a peer that we dialed: send our handshake first,
    /// then read and verify the peer's. The peer must present exactly
    /// `info_hash`.
    pub async fn establish_outgoing(
        &self,
        local_identity: Identity,
        local_extensions: Extensions,
        info_hash: InfoHash,
    ) -> Result<Identity, PeerError> {
        self.establish(local_identity, local_extensions, Some(info_hash))
            .await
    }

    /// Accepts a connection a peer dialed to us: read the peer's
    /// handshake first (learning the info hash), then echo it back.
    pub async fn establish_incoming(
        &self,
        local_identity: Identity,
        local_extensions: Extensions,
    ) -> Result<Identity, PeerError> {
        self.establish(local_identity, local_extensions, None).await
    }

    async fn establish(
        &self,
        local_identity: Identity,
        local_extensions: Extensions,
        info_hash: Option<InfoHash>,
    ) -> Result<Identity, PeerError> {
        let inner = &self.inner;

        if inner.closed.load(Ordering::SeqCst) {
            return Err(PeerError::NotConnected);
        }
        // Single-winner Disconnected -> Connecting transition; a second
        // attempt fails without touching the transport.
        if inner
            .state
            .compare_exchange(
                STATE_DISCONNECTED,
                STATE_CONNECTING,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            return Err(PeerError::AlreadyConnected);
        }

        let mut transport = match inner.shared.lock().transport.take() {
            Some(transport) => transport,
            None => return Err(PeerError::NotConnected),
        };

        let result = timeout(inner.config.handshake_timeout, async {
            match info_hash {
                Some(hash) => {
                    inner
                        .write_handshake(&mut transport, &local_identity, &local_extensions, hash)
                        .await?;
                    let peer = inner.read_handshake(&mut transport).await?;
                    if peer.info_hash != hash {
                        return Err(PeerError::InfoHashMismatch);
                    }
                    Ok(peer)
                }
                None => {
                    let peer = inner.read_handshake(&mut transport).await?;
                    inner
                        .write_handshake(
                            &mut transport,
                            &local_identity,
                            &local_extensions,
                            peer.info_hash,
                        )
                        .await?;
                    Ok(peer)
                }
            }
        })
        .await
        .unwrap_or(Err(PeerError::HandshakeTimeout));

        let peer_handshake = match result {
            Ok(handshake) => handshake,
            Err(cause) => {
                debug!(peer = %inner.peer_addr, %cause, "handshake failed");
                inner.close_with(cause.clone());
                return Err(cause);
            }
        };

        if inner.closed.load(Ordering::SeqCst) {
            return Err(PeerError::NotConnected);
        }

        let peer_identity = Identity::new(peer_handshake.peer_id, inner.peer_addr);
        let peer_extensions = Extensions::from_reserved(peer_handshake.reserved);

        let (write_tx, write_rx) = mpsc::unbounded_channel();
        let (read_half, write_half) = tokio::io::split(transport);
        {
            let mut shared = inner.shared.lock();
            shared.info_hash = Some(peer_handshake.info_hash);
            shared.identity = Some(peer_identity);
            shared.extensions = Some(peer_extensions);
            shared.write_tx = Some(write_tx);
        }

        tokio::spawn(read_loop(inner.clone(), read_half));
        tokio::spawn(write_loop(inner.clone(), write_half, write_rx));

        inner.state.store(STATE_CONNECTED, Ordering::SeqCst);
        info!(peer = %peer_identity, "peer connected");
        inner.listener.on_connect(&peer_identity);

        Ok(peer_identity)
    }

    /// Enqueues a message for writing, returning its completion handle.
    ///
    /// Messages go out strictly in enqueue order, one frame in flight
    /// at a time. Fails synchronously if the connection is closed or
    /// not yet established.
    pub fn send(&self, message: Message) -> Result<Delivery, PeerError> {
        self.submit(Outgoing::Ready(message))
    }

    /// Like [`Protocol::send`], but the message is produced
    /// asynchronously (for example piece data read from disk) when its
    /// turn in the queue comes up. Production is bounded by the
    /// operation timeout.
    pub fn send_deferred<F>(&self, payload: F) -> Result<Delivery, PeerError>
    where
        F: Future<Output = Result<Message, PeerError>> + Send + 'static,
    {
        self.submit(Outgoing::Deferred(Box::pin(payload)))
    }

    fn submit(&self, outgoing: Outgoing) -> Result<Delivery, PeerError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(PeerError::NotConnected);
        }
        let shared = self.inner.shared.lock();
        let write_tx = shared.write_tx.as_ref().ok_or(PeerError::NotConnected)?;
        let (delivery_tx, delivery_rx) = oneshot::channel();
        write_tx
            .send(Pending {
                outgoing,
                delivery: delivery_tx,
            })
            .map_err(|_| PeerError::NotConnected)?;
        Ok(Delivery { rx: delivery_rx })
    }

    /// Closes the connection without an error cause.
    ///
    /// Safe to call multiple times or concurrently; exactly one caller
    /// performs the teardown and `on_close` fires exactly once.
    pub fn close(&self) {
        self.inner.close_with(PeerError::Shutdown);
    }

    /// Closes the connection with an explicit cause.
    pub fn close_with(&self, cause: PeerError) {
        self.inner.close_with(cause);
    }

    pub fn state(&self) -> ConnectionState {
        match self.inner.state.load(Ordering::SeqCst) {
            STATE_CONNECTING => ConnectionState::Connecting,
            STATE_CONNECTED => ConnectionState::Connected,
            _ => ConnectionState::Disconnected,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.peer_addr
    }

    /// The info hash negotiated during the handshake.
    pub fn info_hash(&self) -> Option<InfoHash> {
        self.inner.shared.lock().info_hash
    }

    /// The peer's negotiated identity.
    pub fn identity(&self) -> Option<Identity> {
        self.inner.shared.lock().identity
    }

    /// The peer's current capability snapshot.
    pub fn extensions(&self) -> Option<Extensions> {
        self.inner.shared.lock().extensions.clone()
    }

    /// Replaces the peer's capability snapshot (after merging an
    /// extension handshake).
    pub(super) fn set_extensions(&self, extensions: Extensions) {
        self.inner.shared.lock().extensions = Some(extensions);
    }

    /// The cause the connection closed with, if it has closed.
    pub fn close_cause(&self) -> Option<PeerError> {
        self.inner.shared.lock().close_cause.clone()
    }

    pub fn last_incoming_message_time(&self) -> Option<Instant> {
        self.inner.shared.lock().last_incoming
    }

    pub fn last_outgoing_message_time(&self) -> Option<Instant> {
        self.inner.shared.lock().last_outgoing
    }
}

impl Inner {
    fn touch_incoming(&self) {
        self.shared.lock().last_incoming = Some(Instant::now());
    }

    fn touch_outgoing(&self) {
        self.shared.lock().last_outgoing = Some(Instant::now());
    }

    fn stored_close_cause(&self) -> PeerError {
        self.shared
            .lock()
            .close_cause
            .clone()
            .unwrap_or(PeerError::NotConnected)
    }

    /// The single close path: records the cause, stops both I/O tasks,
    /// drops the transport, and notifies the listener exactly once.
    fn close_with(&self, cause: PeerError) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.state.store(STATE_DISCONNECTED, Ordering::SeqCst);

        let identity = {
            let mut shared = self.shared.lock();
            shared.close_cause = Some(cause.clone());
            shared.write_tx = None;
            shared.transport = None;
            shared.identity
        };

        // Wakes the read and write tasks, which drop their transport
        // halves and fail any queued deliveries with this cause.
        self.cancel.cancel();

        match identity {
            Some(identity) if cause.is_expected() => {
                info!(peer = %identity, %cause, "peer closed");
            }
            Some(identity) => {
                warn!(peer = %identity, %cause, "peer closed with unexpected error");
            }
            None => debug!(peer = %self.peer_addr, %cause, "peer closed"),
        }

        self.listener.on_close(&cause);
    }

    async fn write_handshake(
        &self,
        transport: &mut Box<dyn Transport>,
        local_identity: &Identity,
        local_extensions: &Extensions,
        info_hash: InfoHash,
    ) -> Result<(), PeerError> {
        debug!(peer = %self.peer_addr, "sending handshake");
        let handshake = Handshake::new(
            local_extensions.reserved(),
            info_hash,
            local_identity.id(),
        );
        transport.write_all(&handshake.encode()).await?;
        transport.flush().await?;
        self.touch_outgoing();
        Ok(())
    }

    async fn read_handshake(
        &self,
        transport: &mut Box<dyn Transport>,
    ) -> Result<Handshake, PeerError> {
        debug!(peer = %self.peer_addr, "receiving handshake");
        let mut bytes = [0u8; HANDSHAKE_LEN];
        transport.read_exact(&mut bytes).await.map_err(|error| {
            if error.kind() == std::io::ErrorKind::UnexpectedEof {
                PeerError::ConnectionClosed
            } else {
                error.into()
            }
        })?;
        self.touch_incoming();
        Ok(Handshake::decode(&bytes)?)
    }

    /// Extracts the next complete frame from the reassembly buffer,
    /// consuming keep-alive frames inline. Returns `None` when more
    /// bytes are needed.
    fn next_frame(
        &self,
        buf: &mut BytesMut,
    ) -> Result<Option<(MessageId, bytes::Bytes)>, PeerError> {
        loop {
            if buf.len() < 4 {
                return Ok(None);
            }
            let declared = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;

            // Keep-alive: a bare zero length prefix. Liveness signal
            // only, never surfaced as a message.
            if declared == 0 {
                buf.advance(4);
                self.touch_incoming();
                debug!(peer = %self.peer_addr, "received keep-alive");
                continue;
            }

            if buf.len() < FRAME_HEADER_LEN {
                return Ok(None);
            }
            let id = MessageId::try_from(buf[4])?;

            let total = declared + 4;
            if total > self.config.read_buffer_size {
                return Err(PeerError::InvalidMessage(format!(
                    "{id:?} frame length {total} exceeds buffer capacity {}",
                    self.config.read_buffer_size
                )));
            }
            if buf.len() < total {
                return Ok(None);
            }

            let frame = buf.split_to(total).freeze();
            return Ok(Some((id, frame.slice(FRAME_HEADER_LEN..))));
        }
    }

    async fn run_read(
        self: &Arc<Self>,
        stream: &mut ReadHalf<Box<dyn Transport>>,
    ) -> Result<(), PeerError> {
        let mut buf = BytesMut::with_capacity(self.config.read_buffer_size);
        loop {
            while let Some((id, payload)) = self.next_frame(&mut buf)? {
                let message = Message::decode(id, payload)?;
                debug!(
                    peer = %self.peer_addr,
                    ?id,
                    len = message.payload_len(),
                    "received message"
                );
                self.touch_incoming();
                // Dispatch is synchronous: the next read is only issued
                // after the session has processed this message.
                self.listener.on_receive(message).map_err(|source| {
                    PeerError::Dispatch {
                        id,
                        source: Box::new(source),
                    }
                })?;
            }

            let read = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(()),
                read = timeout(self.config.read_timeout, stream.read_buf(&mut buf)) => read,
            };
            let n = match read {
                Ok(Ok(n)) => n,
                Ok(Err(error)) => return Err(error.into()),
                Err(_) => return Err(PeerError::ReadTimeout),
            };
            if n == 0 {
                return Err(PeerError::ConnectionClosed);
            }
        }
    }

    async fn write_frame(
        self: &Arc<Self>,
        stream: &mut WriteHalf<Box<dyn Transport>>,
        buf: &BytesMut,
    ) -> Result<(), PeerError> {
        let write = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(self.stored_close_cause()),
            write = timeout(self.config.write_timeout, async {
                stream.write_all(buf).await?;
                stream.flush().await
            }) => write,
        };
        match write {
            Ok(Ok(())) => {
                self.touch_outgoing();
                Ok(())
            }
            Ok(Err(error)) => Err(error.into()),
            Err(_) => Err(PeerError::WriteTimeout),
        }
    }

    async fn write_message(
        self: &Arc<Self>,
        stream: &mut WriteHalf<Box<dyn Transport>>,
        buf: &mut BytesMut,
        outgoing: Outgoing,
    ) -> Result<(), PeerError> {
        let message = match outgoing {
            Outgoing::Ready(message) => message,
            Outgoing::Deferred(payload) => {
                match timeout(self.config.operation_timeout, payload).await {
                    Ok(result) => result?,
                    Err(_) => return Err(PeerError::OperationTimeout),
                }
            }
        };

        let payload_len = message.payload_len();
        if payload_len + FRAME_HEADER_LEN > self.config.write_buffer_size {
            return Err(PeerError::InvalidMessage(format!(
                "{:?} payload length {payload_len} exceeds buffer capacity {}",
                message.id(),
                self.config.write_buffer_size
            )));
        }

        debug!(
            peer = %self.peer_addr,
            id = ?message.id(),
            len = payload_len,
            "sending message"
        );

        buf.clear();
        buf.put_u32(payload_len as u32 + 1);
        buf.put_u8(message.id() as u8);
        message.write_payload(buf);
        self.write_frame(stream, buf).await
    }

    async fn write_keepalive(
        self: &Arc<Self>,
        stream: &mut WriteHalf<Box<dyn Transport>>,
        buf: &mut BytesMut,
    ) -> Result<(), PeerError> {
        if let Some(limit) = self.config.inactivity_timeout {
            let silent = self
                .shared
                .lock()
                .last_incoming
                .map(|at| at.elapsed())
                .unwrap_or(Duration::ZERO);
            if silent > limit {
                return Err(PeerError::Inactive);
            }
        }
        debug!(peer = %self.peer_addr, "sending keep-alive");
        buf.clear();
        buf.put_u32(0);
        self.write_frame(stream, buf).await
    }
}

async fn read_loop(inner: Arc<Inner>, mut stream: ReadHalf<Box<dyn Transport>>) {
    if let Err(cause) = inner.run_read(&mut stream).await {
        inner.close_with(cause);
    }
}

async fn write_loop(
    inner: Arc<Inner>,
    mut stream: WriteHalf<Box<dyn Transport>>,
    mut rx: mpsc::UnboundedReceiver<Pending>,
) {
    let mut buf = BytesMut::with_capacity(inner.config.write_buffer_size);
    let mut keepalive = tokio::time::interval_at(
        Instant::now() + inner.config.keepalive_interval,
        inner.config.keepalive_interval,
    );
    // A tick that lands while a message write is in flight is skipped
    // for that interval, never queued behind it.
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let result = loop {
        tokio::select! {
            biased;
            _ = inner.cancel.cancelled() => break Ok(()),
            pending = rx.recv() => {
                let Some(pending) = pending else { break Ok(()) };
                match inner.write_message(&mut stream, &mut buf, pending.outgoing).await {
                    Ok(()) => {
                        let _ = pending.delivery.send(Ok(()));
                    }
                    Err(cause) => {
                        let _ = pending.delivery.send(Err(cause.clone()));
                        break Err(cause);
                    }
                }
            }
            _ = keepalive.tick() => {
                if let Err(cause) = inner.write_keepalive(&mut stream, &mut buf).await {
                    break Err(cause);
                }
            }
        }
    };

    let cause = match result {
        Ok(()) => inner.stored_close_cause(),
        Err(cause) => {
            inner.close_with(cause.clone());
            cause
        }
    };

    // Abort everything still queued with the same cause, never
    // silently.
    rx.close();
    while let Ok(pending) = rx.try_recv() {
        let _ = pending.delivery.send(Err(cause.clone()));
    }
}
