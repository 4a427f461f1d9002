use super::error::PeerError;
use crate::bencode::Value;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::fmt;

/// Reserved-bit index for the extension protocol (BEP-10).
pub const EXTENSION_PROTOCOL_BIT: u8 = 44;
/// Reserved-bit index for DHT support (BEP-5).
pub const DHT_BIT: u8 = 56;
/// Reserved-bit index for the fast extension (BEP-6).
pub const FAST_PEERS_BIT: u8 = 58;

/// Sub-message id reserved for the extension handshake itself.
pub const EXTENSION_HANDSHAKE_ID: u8 = 0;

/// The fixed 8-byte reserved field exchanged verbatim in the handshake.
///
/// Bit `i` lives in byte `i / 8` at low-order position `i % 8`, which
/// puts the extension protocol at byte 5 mask `0x10`, DHT at byte 7
/// mask `0x01`, and fast peers at byte 7 mask `0x04`.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct Reserved([u8; 8]);

impl Reserved {
    pub fn from_bytes(bytes: [u8; 8]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }

    /// Returns the bit at `index`, which must be below 64.
    pub fn bit(&self, index: u8) -> bool {
        debug_assert!(index < 64);
        self.0[usize::from(index) / 8] & (1 << (index % 8)) != 0
    }

    fn set_bit(&mut self, index: u8, value: bool) {
        debug_assert!(index < 64);
        let mask = 1u8 << (index % 8);
        if value {
            self.0[usize::from(index) / 8] |= mask;
        } else {
            self.0[usize::from(index) / 8] &= !mask;
        }
    }

    pub fn has_extension_protocol(&self) -> bool {
        self.bit(EXTENSION_PROTOCOL_BIT)
    }

    pub fn has_dht(&self) -> bool {
        self.bit(DHT_BIT)
    }

    pub fn has_fast_peers(&self) -> bool {
        self.bit(FAST_PEERS_BIT)
    }
}

impl fmt::Debug for Reserved {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Reserved(")?;
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        write!(f, ")")
    }
}

/// A frozen capability snapshot: the reserved bits plus whatever the
/// extension handshake dictionary negotiated.
///
/// Snapshots are immutable by construction; building one goes through
/// [`ExtensionsBuilder`], so mutating a published snapshot is a
/// compile-time error rather than a runtime surprise. Merging a peer's
/// extension handshake produces a fresh snapshot via
/// [`Extensions::merge_handshake`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Extensions {
    reserved: Reserved,
    messages: Option<BTreeMap<String, u8>>,
    listen_port: Option<u16>,
    client_version: Option<String>,
    yourip: Option<Vec<u8>>,
    ipv4: Option<Vec<u8>>,
    ipv6: Option<Vec<u8>>,
    max_outstanding_requests: Option<u32>,
}

impl Extensions {
    pub fn builder() -> ExtensionsBuilder {
        ExtensionsBuilder::default()
    }

    /// The capability set this library advertises by default: fast
    /// peers and the extension protocol, with an empty sub-message map.
    pub fn supported() -> Extensions {
        let mut builder = Extensions::builder();
        builder.set_fast_peers(true);
        builder.set_extension_protocol(true);
        builder.set_messages(BTreeMap::new());
        builder.set_client_version(concat!("peerwire/", env!("CARGO_PKG_VERSION")));
        builder.set_max_outstanding_requests(100);
        builder.freeze()
    }

    /// A snapshot carrying only the given reserved bits, as learned
    /// from a raw handshake.
    pub fn from_reserved(reserved: Reserved) -> Extensions {
        Extensions {
            reserved,
            ..Extensions::default()
        }
    }

    /// Reopens this snapshot as a builder for deriving a new one.
    pub fn to_builder(&self) -> ExtensionsBuilder {
        ExtensionsBuilder {
            extensions: self.clone(),
        }
    }

    pub fn reserved(&self) -> Reserved {
        self.reserved
    }

    pub fn has_extension_protocol(&self) -> bool {
        self.reserved.has_extension_protocol()
    }

    pub fn has_dht(&self) -> bool {
        self.reserved.has_dht()
    }

    pub fn has_fast_peers(&self) -> bool {
        self.reserved.has_fast_peers()
    }

    /// Negotiated sub-message id for a named extension, if the peer
    /// advertised it.
    pub fn message_id(&self, name: &str) -> Option<u8> {
        self.messages.as_ref()?.get(name).copied()
    }

    pub fn messages(&self) -> Option<&BTreeMap<String, u8>> {
        self.messages.as_ref()
    }

    pub fn listen_port(&self) -> Option<u16> {
        self.listen_port
    }

    pub fn client_version(&self) -> Option<&str> {
        self.client_version.as_deref()
    }

    /// The address the peer observed us at, raw 4 or 16 bytes.
    pub fn yourip(&self) -> Option<&[u8]> {
        self.yourip.as_deref()
    }

    pub fn ipv4(&self) -> Option<&[u8]> {
        self.ipv4.as_deref()
    }

    pub fn ipv6(&self) -> Option<&[u8]> {
        self.ipv6.as_deref()
    }

    pub fn max_outstanding_requests(&self) -> Option<u32> {
        self.max_outstanding_requests
    }

    /// Builds the extension-handshake dictionary (the payload of
    /// extended message id 0, before bencoding).
    pub fn to_handshake(&self) -> Value {
        let mut dict = BTreeMap::new();

        let mut m = BTreeMap::new();
        if let Some(messages) = &self.messages {
            for (name, id) in messages {
                m.insert(
                    Bytes::copy_from_slice(name.as_bytes()),
                    Value::Integer(i64::from(*id)),
                );
            }
        }
        dict.insert(Bytes::from_static(b"m"), Value::Dict(m));

        if let Some(port) = self.listen_port {
            dict.insert(Bytes::from_static(b"p"), Value::Integer(i64::from(port)));
        }
        if let Some(version) = &self.client_version {
            dict.insert(Bytes::from_static(b"v"), Value::string(version));
        }
        if let Some(ip) = &self.yourip {
            dict.insert(
                Bytes::from_static(b"yourip"),
                Value::Bytes(Bytes::copy_from_slice(ip)),
            );
        }
        if let Some(ip) = &self.ipv4 {
            dict.insert(
                Bytes::from_static(b"ipv4"),
                Value::Bytes(Bytes::copy_from_slice(ip)),
            );
        }
        if let Some(ip) = &self.ipv6 {
            dict.insert(
                Bytes::from_static(b"ipv6"),
                Value::Bytes(Bytes::copy_from_slice(ip)),
            );
        }
        if let Some(reqq) = self.max_outstanding_requests {
            dict.insert(
                Bytes::from_static(b"reqq"),
                Value::Integer(i64::from(reqq)),
            );
        }

        Value::Dict(dict)
    }

    /// Applies a peer's extension-handshake dictionary on top of this
    /// snapshot, returning the merged snapshot.
    ///
    /// The `m` map is mandatory. Optional fields may be absent, but a
    /// present field with the wrong type is fatal.
    pub fn merge_handshake(&self, handshake: &Value) -> Result<Extensions, PeerError> {
        let dict = handshake
            .as_dict()
            .ok_or_else(|| PeerError::Extension("handshake is not a dictionary".into()))?;

        let mut builder = self.to_builder();

        let m = dict
            .get(b"m".as_slice())
            .ok_or_else(|| PeerError::Extension("handshake 'm' is missing".into()))?
            .as_dict()
            .ok_or_else(|| PeerError::Extension("handshake 'm' is not a dictionary".into()))?;
        let mut messages = BTreeMap::new();
        for (name, id) in m {
            let name = std::str::from_utf8(name)
                .map_err(|_| PeerError::Extension("handshake 'm' key is not utf-8".into()))?;
            let id = id
                .as_integer()
                .ok_or_else(|| PeerError::Extension("handshake 'm' value is not an integer".into()))?;
            let id = u8::try_from(id)
                .map_err(|_| PeerError::Extension(format!("message id out of range: {id}")))?;
            // Id 0 means the peer disabled that sub-extension.
            if id != 0 {
                messages.insert(name.to_string(), id);
            }
        }
        builder.set_messages(messages);

        if let Some(port) = dict.get(b"p".as_slice()) {
            let port = port
                .as_integer()
                .and_then(|p| u16::try_from(p).ok())
                .ok_or_else(|| PeerError::Extension("handshake 'p' is not a port".into()))?;
            builder.set_listen_port(port);
        }
        if let Some(version) = dict.get(b"v".as_slice()) {
            let version = version
                .as_str()
                .ok_or_else(|| PeerError::Extension("handshake 'v' is not a string".into()))?;
            builder.set_client_version(version);
        }
        if let Some(ip) = dict.get(b"yourip".as_slice()) {
            let ip = ip
                .as_bytes()
                .ok_or_else(|| PeerError::Extension("handshake 'yourip' is not a string".into()))?;
            builder.set_yourip(ip.to_vec());
        }
        if let Some(ip) = dict.get(b"ipv4".as_slice()) {
            let ip = ip
                .as_bytes()
                .ok_or_else(|| PeerError::Extension("handshake 'ipv4' is not a string".into()))?;
            builder.set_ipv4(ip.to_vec());
        }
        if let Some(ip) = dict.get(b"ipv6".as_slice()) {
            let ip = ip
                .as_bytes()
                .ok_or_else(|| PeerError::Extension("handshake 'ipv6' is not a string".into()))?;
            builder.set_ipv6(ip.to_vec());
        }
        if let Some(reqq) = dict.get(b"reqq".as_slice()) {
            let reqq = reqq
                .as_integer()
                .and_then(|r| u32::try_from(r).ok())
                .ok_or_else(|| PeerError::Extension("handshake 'reqq' is not an integer".into()))?;
            builder.set_max_outstanding_requests(reqq);
        }

        Ok(builder.freeze())
    }
}

/// Mutable capability set under construction.
///
/// Freeze it before publishing it to connections; connections only ever
/// see [`Extensions`] snapshots.
#[derive(Debug, Clone, Default)]
pub struct ExtensionsBuilder {
    extensions: Extensions,
}

impl ExtensionsBuilder {
    pub fn set_bit(&mut self, index: u8, value: bool) {
        self.extensions.reserved.set_bit(index, value);
    }

    pub fn set_extension_protocol(&mut self, value: bool) {
        self.set_bit(EXTENSION_PROTOCOL_BIT, value);
    }

    pub fn set_dht(&mut self, value: bool) {
        self.set_bit(DHT_BIT, value);
    }

    pub fn set_fast_peers(&mut self, value: bool) {
        self.set_bit(FAST_PEERS_BIT, value);
    }

    pub fn set_messages(&mut self, messages: BTreeMap<String, u8>) {
        self.extensions.messages = Some(messages);
    }

    pub fn set_listen_port(&mut self, port: u16) {
        self.extensions.listen_port = Some(port);
    }

    pub fn set_client_version(&mut self, version: &str) {
        self.extensions.client_version = Some(version.to_string());
    }

    pub fn set_yourip(&mut self, ip: Vec<u8>) {
        self.extensions.yourip = Some(ip);
    }

    pub fn set_ipv4(&mut self, ip: Vec<u8>) {
        self.extensions.ipv4 = Some(ip);
    }

    pub fn set_ipv6(&mut self, ip: Vec<u8>) {
        self.extensions.ipv6 = Some(ip);
    }

    pub fn set_max_outstanding_requests(&mut self, reqq: u32) {
        self.extensions.max_outstanding_requests = Some(reqq);
    }

    /// Publishes the capability set as an immutable snapshot.
    pub fn freeze(self) -> Extensions {
        self.extensions
    }
}
