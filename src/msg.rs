//! # KRPC Wire Format
//!
//! Every DHT packet is a single bencoded dictionary (BEP 5).
//!
//! | Kind | `y` | Payload |
//! |------|-----|---------|
//! | Query | `q` | `q` = method name, `a` = argument dict (always with `id`) |
//! | Response | `r` | `r` = result dict (always with `id`) |
//! | Error | `e` | `e` = `[code, message]` |
//!
//! All kinds carry an opaque transaction id `t`. Replies additionally carry
//! `ip`, the requester's endpoint as we saw it (BEP 42).
//!
//! ## Compact encodings
//!
//! | Item | IPv4 | IPv6 |
//! |------|------|------|
//! | endpoint | 6 bytes (ip, port) | 18 bytes |
//! | node | 26 bytes (id, ip, port) | 38 bytes |
//!
//! ## Security Limits
//!
//! - Packets above `MAX_PACKET_SIZE` are dropped before decoding.
//! - Nesting deeper than `MAX_NESTING_DEPTH` is rejected before the
//!   recursive decoder sees it.

use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

pub use serde_bencode::value::Value;

use crate::node_id::{NodeId, ID_LEN};

pub type Dict = HashMap<Vec<u8>, Value>;

/// Largest datagram we accept or produce.
pub const MAX_PACKET_SIZE: usize = 1800;

/// SECURITY: bounds recursion in the bencode decoder.
const MAX_NESTING_DEPTH: usize = 32;

pub const COMPACT_ENDPOINT_V4: usize = 6;
pub const COMPACT_ENDPOINT_V6: usize = 18;
pub const COMPACT_NODE_V4: usize = ID_LEN + COMPACT_ENDPOINT_V4;
pub const COMPACT_NODE_V6: usize = ID_LEN + COMPACT_ENDPOINT_V6;

// ============================================================================
// Errors
// ============================================================================

/// KRPC error codes (BEP 5, BEP 44).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Generic,
    Server,
    Protocol,
    MethodUnknown,
    MessageTooBig,
    InvalidSignature,
    SaltTooBig,
    CasMismatch,
    SeqLessThanCurrent,
    Other(i64),
}

impl ErrorCode {
    pub fn code(self) -> i64 {
        match self {
            ErrorCode::Generic => 201,
            ErrorCode::Server => 202,
            ErrorCode::Protocol => 203,
            ErrorCode::MethodUnknown => 204,
            ErrorCode::MessageTooBig => 205,
            ErrorCode::InvalidSignature => 206,
            ErrorCode::SaltTooBig => 207,
            ErrorCode::CasMismatch => 301,
            ErrorCode::SeqLessThanCurrent => 302,
            ErrorCode::Other(c) => c,
        }
    }

    pub fn from_code(code: i64) -> Self {
        match code {
            201 => ErrorCode::Generic,
            202 => ErrorCode::Server,
            203 => ErrorCode::Protocol,
            204 => ErrorCode::MethodUnknown,
            205 => ErrorCode::MessageTooBig,
            206 => ErrorCode::InvalidSignature,
            207 => ErrorCode::SaltTooBig,
            301 => ErrorCode::CasMismatch,
            302 => ErrorCode::SeqLessThanCurrent,
            c => ErrorCode::Other(c),
        }
    }
}

/// A protocol-level failure: either one we send back to a requester, or one
/// a remote node sent us.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KrpcError {
    pub code: ErrorCode,
    pub message: String,
}

impl KrpcError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }

    /// 203, the catch-all for malformed messages.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Protocol, message)
    }

    /// Encode as the `e` value of an error reply.
    pub fn to_value(&self) -> Value {
        Value::List(vec![
            Value::Int(self.code.code()),
            Value::Bytes(self.message.as_bytes().to_vec()),
        ])
    }

    /// Parse the `e` value of an error reply.
    pub fn from_value(v: &Value) -> Option<Self> {
        let Value::List(items) = v else { return None };
        let code = match items.first() {
            Some(Value::Int(c)) => *c,
            _ => return None,
        };
        let message = match items.get(1) {
            Some(Value::Bytes(m)) => String::from_utf8_lossy(m).into_owned(),
            _ => String::new(),
        };
        Some(Self::new(ErrorCode::from_code(code), message))
    }
}

impl fmt::Display for KrpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KRPC error {}: {}", self.code.code(), self.message)
    }
}

impl std::error::Error for KrpcError {}

// ============================================================================
// Bencode
// ============================================================================

/// Decode a packet whose top level must be a dictionary.
pub fn decode(buf: &[u8]) -> Result<Dict, KrpcError> {
    if buf.len() > MAX_PACKET_SIZE {
        return Err(KrpcError::new(ErrorCode::MessageTooBig, "packet too large"));
    }
    decode_dict(buf)
}

/// Decode a dictionary of any size. Nesting is still bounded.
pub fn decode_dict(buf: &[u8]) -> Result<Dict, KrpcError> {
    check_nesting(buf)?;
    match serde_bencode::from_bytes::<Value>(buf) {
        Ok(Value::Dict(d)) => Ok(d),
        Ok(_) => Err(KrpcError::protocol("not a dictionary")),
        Err(e) => Err(KrpcError::protocol(format!("invalid bencoding: {e}"))),
    }
}

pub fn encode(value: &Value) -> Result<Vec<u8>, KrpcError> {
    serde_bencode::to_bytes(value).map_err(|e| KrpcError::new(ErrorCode::Server, e.to_string()))
}

pub fn encode_dict(dict: Dict) -> Result<Vec<u8>, KrpcError> {
    encode(&Value::Dict(dict))
}

/// Walk the token stream and reject inputs nested deeper than the limit.
fn check_nesting(buf: &[u8]) -> Result<(), KrpcError> {
    let mut depth = 0usize;
    let mut i = 0usize;
    while i < buf.len() {
        match buf[i] {
            b'd' | b'l' => {
                depth += 1;
                if depth > MAX_NESTING_DEPTH {
                    return Err(KrpcError::protocol("nesting too deep"));
                }
                i += 1;
            }
            b'e' => {
                depth = depth.saturating_sub(1);
                i += 1;
            }
            b'i' => match buf[i..].iter().position(|&c| c == b'e') {
                Some(end) => i += end + 1,
                None => return Err(KrpcError::protocol("unterminated integer")),
            },
            b'0'..=b'9' => {
                let colon = buf[i..]
                    .iter()
                    .position(|&c| c == b':')
                    .ok_or_else(|| KrpcError::protocol("unterminated string length"))?;
                let len: usize = std::str::from_utf8(&buf[i..i + colon])
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| KrpcError::protocol("invalid string length"))?;
                i = i
                    .checked_add(colon + 1)
                    .and_then(|s| s.checked_add(len))
                    .ok_or_else(|| KrpcError::protocol("invalid string length"))?;
            }
            _ => return Err(KrpcError::protocol("unexpected byte")),
        }
    }
    Ok(())
}

pub fn bytes(b: impl Into<Vec<u8>>) -> Value {
    Value::Bytes(b.into())
}

/// Typed accessors over a bencoded dictionary.
pub trait DictExt {
    fn get_value(&self, key: &str) -> Option<&Value>;

    fn get_bytes(&self, key: &str) -> Option<&[u8]> {
        match self.get_value(key) {
            Some(Value::Bytes(b)) => Some(b),
            _ => None,
        }
    }

    fn get_int(&self, key: &str) -> Option<i64> {
        match self.get_value(key) {
            Some(Value::Int(i)) => Some(*i),
            _ => None,
        }
    }

    fn get_dict(&self, key: &str) -> Option<&Dict> {
        match self.get_value(key) {
            Some(Value::Dict(d)) => Some(d),
            _ => None,
        }
    }

    fn get_list(&self, key: &str) -> Option<&[Value]> {
        match self.get_value(key) {
            Some(Value::List(l)) => Some(l),
            _ => None,
        }
    }

    fn get_id(&self, key: &str) -> Option<NodeId> {
        self.get_bytes(key).and_then(NodeId::from_slice)
    }

    fn set(&mut self, key: &str, value: Value);
}

impl DictExt for Dict {
    fn get_value(&self, key: &str) -> Option<&Value> {
        self.get(key.as_bytes())
    }

    fn set(&mut self, key: &str, value: Value) {
        self.insert(key.as_bytes().to_vec(), value);
    }
}

// ============================================================================
// Message envelope
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Query,
    Response,
    Error,
}

/// A decoded packet together with its source.
#[derive(Debug, Clone)]
pub struct Message {
    pub addr: SocketAddr,
    pub dict: Dict,
}

impl Message {
    pub fn decode(addr: SocketAddr, buf: &[u8]) -> Result<Self, KrpcError> {
        Ok(Self { addr, dict: decode(buf)? })
    }

    pub fn transaction_id(&self) -> Option<&[u8]> {
        self.dict.get_bytes("t")
    }

    pub fn kind(&self) -> Option<MessageKind> {
        match self.dict.get_bytes("y")? {
            b"q" => Some(MessageKind::Query),
            b"r" => Some(MessageKind::Response),
            b"e" => Some(MessageKind::Error),
            _ => None,
        }
    }

    pub fn method(&self) -> Option<&[u8]> {
        self.dict.get_bytes("q")
    }

    pub fn args(&self) -> Option<&Dict> {
        self.dict.get_dict("a")
    }

    pub fn response(&self) -> Option<&Dict> {
        self.dict.get_dict("r")
    }

    pub fn error(&self) -> Option<KrpcError> {
        self.dict.get_value("e").and_then(KrpcError::from_value)
    }

    /// Sender asked not to be added to routing tables (BEP 43).
    pub fn read_only(&self) -> bool {
        self.dict.get_int("ro") == Some(1)
    }
}

/// Build an error reply for transaction `t`.
pub fn error_reply(t: &[u8], err: &KrpcError) -> Dict {
    let mut d = Dict::new();
    d.set("y", bytes("e"));
    d.set("t", bytes(t));
    d.set("e", err.to_value());
    d
}

// ============================================================================
// Key verification
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyType {
    Int,
    Bytes,
    Dict,
    List,
}

/// Key may be absent.
pub const OPTIONAL: u8 = 1;
/// `size` is a divisor of the value length rather than the exact length.
pub const SIZE_DIVISIBLE: u8 = 2;

/// Expected shape of one dictionary key. For byte strings a non-zero `size`
/// constrains the length.
#[derive(Debug, Clone, Copy)]
pub struct KeyDesc {
    pub name: &'static str,
    pub kind: KeyType,
    pub size: usize,
    pub flags: u8,
}

impl KeyDesc {
    pub const fn new(name: &'static str, kind: KeyType, size: usize, flags: u8) -> Self {
        Self { name, kind, size, flags }
    }

    fn matches(&self, v: &Value) -> bool {
        match (self.kind, v) {
            (KeyType::Int, Value::Int(_)) => true,
            (KeyType::Dict, Value::Dict(_)) => true,
            (KeyType::List, Value::List(_)) => true,
            (KeyType::Bytes, Value::Bytes(b)) => {
                if self.size == 0 {
                    true
                } else if self.flags & SIZE_DIVISIBLE != 0 {
                    b.len() % self.size == 0
                } else {
                    b.len() == self.size
                }
            }
            _ => false,
        }
    }
}

/// Check `dict` against `desc`, returning the values in `desc` order.
///
/// Fails with `"missing '<key>' key"` or `"invalid value for '<key>'"`.
pub fn verify_message<'a, const N: usize>(
    dict: &'a Dict,
    desc: &[KeyDesc; N],
) -> Result<[Option<&'a Value>; N], String> {
    let mut out = [None; N];
    for (slot, key) in out.iter_mut().zip(desc.iter()) {
        match dict.get_value(key.name) {
            Some(v) if key.matches(v) => *slot = Some(v),
            Some(_) => return Err(format!("invalid value for '{}'", key.name)),
            None if key.flags & OPTIONAL != 0 => {}
            None => return Err(format!("missing '{}' key", key.name)),
        }
    }
    Ok(out)
}

// ============================================================================
// Compact encodings
// ============================================================================

pub fn write_endpoint(ep: &SocketAddr, out: &mut Vec<u8>) {
    match ep.ip() {
        IpAddr::V4(ip) => out.extend_from_slice(&ip.octets()),
        IpAddr::V6(ip) => out.extend_from_slice(&ip.octets()),
    }
    out.extend_from_slice(&ep.port().to_be_bytes());
}

pub fn compact_endpoint(ep: &SocketAddr) -> Vec<u8> {
    let mut out = Vec::with_capacity(COMPACT_ENDPOINT_V6);
    write_endpoint(ep, &mut out);
    out
}

/// Parse a 6- or 18-byte compact endpoint.
pub fn read_endpoint(b: &[u8]) -> Option<SocketAddr> {
    match b.len() {
        COMPACT_ENDPOINT_V4 => {
            let ip = Ipv4Addr::new(b[0], b[1], b[2], b[3]);
            Some(SocketAddr::new(IpAddr::V4(ip), u16::from_be_bytes([b[4], b[5]])))
        }
        COMPACT_ENDPOINT_V6 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&b[..16]);
            Some(SocketAddr::new(
                IpAddr::V6(Ipv6Addr::from(octets)),
                u16::from_be_bytes([b[16], b[17]]),
            ))
        }
        _ => None,
    }
}

pub fn write_node(id: &NodeId, ep: &SocketAddr, out: &mut Vec<u8>) {
    out.extend_from_slice(id.as_bytes());
    write_endpoint(ep, out);
}

/// Parse a `nodes` (26-byte records) or `nodes6` (38-byte records) string.
/// A trailing partial record is ignored.
pub fn read_nodes(b: &[u8], v6: bool) -> Vec<(NodeId, SocketAddr)> {
    let record = if v6 { COMPACT_NODE_V6 } else { COMPACT_NODE_V4 };
    b.chunks_exact(record)
        .filter_map(|chunk| {
            let id = NodeId::from_slice(&chunk[..ID_LEN])?;
            let ep = read_endpoint(&chunk[ID_LEN..])?;
            Some((id, ep))
        })
        .collect()
}
