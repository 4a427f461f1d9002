//! Bencode encoding and decoding ([BEP-3]).
//!
//! Bencode is the serialization format used by BitTorrent for structured
//! data. The peer engine uses it only for the extension handshake
//! dictionary (BEP-10), so this module stays deliberately small: a tagged
//! [`Value`] union over the four bencode types plus [`encode`] and
//! [`decode`].
//!
//! # Examples
//!
//! ```
//! use peerwire::bencode::{decode, encode, Value};
//!
//! let value = decode(b"d1:mdee").unwrap();
//! let m = value.get(b"m").unwrap();
//! assert!(m.as_dict().is_some());
//!
//! assert_eq!(encode(&Value::Integer(42)), b"i42e");
//! ```
//!
//! [BEP-3]: http://bittorrent.org/beps/bep_0003.html

use bytes::Bytes;
use std::collections::BTreeMap;
use thiserror::Error;

const MAX_DEPTH: usize = 64;

/// Errors produced while decoding bencode data.
#[derive(Debug, Clone, Error)]
pub enum BencodeError {
    #[error("unexpected end of input")]
    UnexpectedEof,

    #[error("invalid integer: {0}")]
    InvalidInteger(String),

    #[error("invalid string length")]
    InvalidStringLength,

    #[error("unexpected character: {0}")]
    UnexpectedChar(char),

    #[error("dictionary key is not a string")]
    InvalidKey,

    #[error("nesting too deep")]
    NestingTooDeep,

    #[error("trailing data after value")]
    TrailingData,
}

/// A bencode value: integer, byte string, list, or key-sorted dictionary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// A signed 64-bit integer.
    Integer(i64),
    /// A byte string (not necessarily valid UTF-8).
    Bytes(Bytes),
    /// An ordered list of values.
    List(Vec<Value>),
    /// A dictionary with byte-string keys, sorted lexicographically.
    Dict(BTreeMap<Bytes, Value>),
}

impl Value {
    /// Creates a byte string value from a UTF-8 string.
    pub fn string(s: &str) -> Self {
        Value::Bytes(Bytes::copy_from_slice(s.as_bytes()))
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Returns the value as a string if it is valid UTF-8.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Bytes(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<Bytes, Value>> {
        match self {
            Value::Dict(d) => Some(d),
            _ => None,
        }
    }

    /// Looks up a dictionary entry by key.
    pub fn get(&self, key: &[u8]) -> Option<&Value> {
        self.as_dict().and_then(|d| d.get(key))
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(i)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::string(s)
    }
}

impl From<Bytes> for Value {
    fn from(b: Bytes) -> Self {
        Value::Bytes(b)
    }
}

/// Encodes a value into canonical bencode bytes.
///
/// Dictionary keys are emitted in sorted order, so encoding is
/// deterministic and round-trips with [`decode`].
pub fn encode(value: &Value) -> Vec<u8> {
    let mut out = Vec::new();
    encode_into(value, &mut out);
    out
}

fn encode_into(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Integer(i) => {
            out.push(b'i');
            out.extend_from_slice(i.to_string().as_bytes());
            out.push(b'e');
        }
        Value::Bytes(b) => {
            out.extend_from_slice(b.len().to_string().as_bytes());
            out.push(b':');
            out.extend_from_slice(b);
        }
        Value::List(items) => {
            out.push(b'l');
            for item in items {
                encode_into(item, out);
            }
            out.push(b'e');
        }
        Value::Dict(entries) => {
            out.push(b'd');
            for (key, val) in entries {
                out.extend_from_slice(key.len().to_string().as_bytes());
                out.push(b':');
                out.extend_from_slice(key);
                encode_into(val, out);
            }
            out.push(b'e');
        }
    }
}

/// Decodes a single bencode value, rejecting trailing data.
pub fn decode(data: &[u8]) -> Result<Value, BencodeError> {
    let mut parser = Parser { data, pos: 0 };
    let value = parser.value(0)?;
    if parser.pos != data.len() {
        return Err(BencodeError::TrailingData);
    }
    Ok(value)
}

struct Parser<'a> {
    data: &'a [u8],
    pos: usize,
}

impl Parser<'_> {
    fn peek(&self) -> Result<u8, BencodeError> {
        self.data
            .get(self.pos)
            .copied()
            .ok_or(BencodeError::UnexpectedEof)
    }

    fn value(&mut self, depth: usize) -> Result<Value, BencodeError> {
        if depth > MAX_DEPTH {
            return Err(BencodeError::NestingTooDeep);
        }
        match self.peek()? {
            b'i' => self.integer(),
            b'l' => self.list(depth),
            b'd' => self.dict(depth),
            b'0'..=b'9' => self.bytes().map(Value::Bytes),
            c => Err(BencodeError::UnexpectedChar(c as char)),
        }
    }

    fn integer(&mut self) -> Result<Value, BencodeError> {
        self.pos += 1;
        let start = self.pos;
        while self.peek()? != b'e' {
            self.pos += 1;
        }
        let text = std::str::from_utf8(&self.data[start..self.pos])
            .map_err(|_| BencodeError::InvalidInteger("not utf-8".into()))?;
        let digits = text.strip_prefix('-').unwrap_or(text);
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(BencodeError::InvalidInteger(text.into()));
        }
        // Canonical form forbids leading zeros ("i03e") and negative zero.
        if text.starts_with("-0") || (digits.len() > 1 && digits.starts_with('0')) {
            return Err(BencodeError::InvalidInteger(text.into()));
        }
        let value: i64 = text
            .parse()
            .map_err(|_| BencodeError::InvalidInteger(text.into()))?;
        self.pos += 1;
        Ok(Value::Integer(value))
    }

    fn bytes(&mut self) -> Result<Bytes, BencodeError> {
        let start = self.pos;
        while self.peek()? != b':' {
            self.pos += 1;
        }
        let len: usize = std::str::from_utf8(&self.data[start..self.pos])
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or(BencodeError::InvalidStringLength)?;
        self.pos += 1;
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.data.len())
            .ok_or(BencodeError::UnexpectedEof)?;
        let bytes = Bytes::copy_from_slice(&self.data[self.pos..end]);
        self.pos = end;
        Ok(bytes)
    }

    fn list(&mut self, depth: usize) -> Result<Value, BencodeError> {
        self.pos += 1;
        let mut items = Vec::new();
        while self.peek()? != b'e' {
            items.push(self.value(depth + 1)?);
        }
        self.pos += 1;
        Ok(Value::List(items))
    }

    fn dict(&mut self, depth: usize) -> Result<Value, BencodeError> {
        self.pos += 1;
        let mut entries = BTreeMap::new();
        while self.peek()? != b'e' {
            if !self.peek()?.is_ascii_digit() {
                return Err(BencodeError::InvalidKey);
            }
            let key = self.bytes()?;
            let value = self.value(depth + 1)?;
            entries.insert(key, value);
        }
        self.pos += 1;
        Ok(Value::Dict(entries))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_scalars() {
        assert_eq!(decode(b"i42e").unwrap(), Value::Integer(42));
        assert_eq!(decode(b"i-7e").unwrap(), Value::Integer(-7));
        assert_eq!(decode(b"i0e").unwrap(), Value::Integer(0));
        assert_eq!(decode(b"4:spam").unwrap(), Value::string("spam"));
        assert_eq!(decode(b"0:").unwrap(), Value::Bytes(Bytes::new()));
    }

    #[test]
    fn decode_rejects_malformed_integers() {
        assert!(decode(b"i03e").is_err());
        assert!(decode(b"i-0e").is_err());
        assert!(decode(b"ie").is_err());
        assert!(decode(b"i12").is_err());
        assert!(decode(b"i+5e").is_err());
        assert!(decode(b"i 1e").is_err());
        assert!(decode(b"i1-2e").is_err());
    }

    #[test]
    fn decode_rejects_truncated_strings() {
        assert!(decode(b"5:spam").is_err());
        assert!(decode(b"4spam").is_err());
    }

    #[test]
    fn decode_rejects_trailing_data() {
        assert!(matches!(decode(b"i1ei2e"), Err(BencodeError::TrailingData)));
    }

    #[test]
    fn decode_rejects_non_string_keys() {
        assert!(matches!(
            decode(b"di1e4:spame"),
            Err(BencodeError::InvalidKey)
        ));
    }

    #[test]
    fn decode_nested() {
        let value = decode(b"d1:ml11:ut_metadatai3eee").unwrap();
        let m = value.get(b"m").unwrap().as_list().unwrap();
        assert_eq!(m[0].as_str(), Some("ut_metadata"));
        assert_eq!(m[1].as_integer(), Some(3));
    }

    #[test]
    fn encode_is_canonical() {
        let mut dict = BTreeMap::new();
        dict.insert(Bytes::from_static(b"b"), Value::Integer(2));
        dict.insert(Bytes::from_static(b"a"), Value::Integer(1));
        assert_eq!(encode(&Value::Dict(dict)), b"d1:ai1e1:bi2ee");
    }

    #[test]
    fn round_trip() {
        let mut m = BTreeMap::new();
        m.insert(Bytes::from_static(b"ut_metadata"), Value::Integer(2));
        let mut dict = BTreeMap::new();
        dict.insert(Bytes::from_static(b"m"), Value::Dict(m));
        dict.insert(Bytes::from_static(b"v"), Value::string("client/1.0"));
        dict.insert(Bytes::from_static(b"reqq"), Value::Integer(100));
        let original = Value::Dict(dict);

        let decoded = decode(&encode(&original)).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn depth_limit() {
        let mut data = vec![b'l'; 100];
        data.extend(vec![b'e'; 100]);
        assert!(matches!(decode(&data), Err(BencodeError::NestingTooDeep)));
    }
}
