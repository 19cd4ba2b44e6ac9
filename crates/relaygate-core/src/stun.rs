//! STUN/TURN message encoding (RFC 5389, RFC 5766, RFC 6062).
//!
//! Wire format: `[2-byte type][2-byte length][4-byte magic cookie][12-byte
//! transaction id][attributes...]`, attributes padded to 4-byte boundaries.
//! Only the subset needed by a TURN-over-TCP client is modelled.

use crate::error::{GatewayError, GatewayResult};
use md5::{Digest, Md5};
use ring::hmac;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

pub const MAGIC_COOKIE: u32 = 0x2112_A442;
pub const HEADER_LEN: usize = 20;
pub const TRANSACTION_ID_LEN: usize = 12;

/// IANA protocol number carried in REQUESTED-TRANSPORT for TCP allocations.
pub const TRANSPORT_TCP: u8 = 6;

const INTEGRITY_LEN: usize = 20;

/// Attribute type codes.
pub mod attr {
    pub const MAPPED_ADDRESS: u16 = 0x0001;
    pub const USERNAME: u16 = 0x0006;
    pub const MESSAGE_INTEGRITY: u16 = 0x0008;
    pub const ERROR_CODE: u16 = 0x0009;
    pub const LIFETIME: u16 = 0x000D;
    pub const XOR_PEER_ADDRESS: u16 = 0x0012;
    pub const REALM: u16 = 0x0014;
    pub const NONCE: u16 = 0x0015;
    pub const XOR_RELAYED_ADDRESS: u16 = 0x0016;
    pub const REQUESTED_TRANSPORT: u16 = 0x0019;
    pub const XOR_MAPPED_ADDRESS: u16 = 0x0020;
    pub const CONNECTION_ID: u16 = 0x002A;
    pub const SOFTWARE: u16 = 0x8022;
    pub const FINGERPRINT: u16 = 0x8028;
}

/// Error codes the client reacts to.
pub mod code {
    pub const UNAUTHORIZED: u16 = 401;
    pub const STALE_NONCE: u16 = 438;
}

/// STUN message class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Class {
    Request,
    Indication,
    Success,
    Error,
}

impl Class {
    fn bits(self) -> u16 {
        match self {
            Class::Request => 0b00,
            Class::Indication => 0b01,
            Class::Success => 0b10,
            Class::Error => 0b11,
        }
    }

    fn from_bits(bits: u16) -> Self {
        match bits & 0b11 {
            0b00 => Class::Request,
            0b01 => Class::Indication,
            0b10 => Class::Success,
            _ => Class::Error,
        }
    }
}

/// STUN/TURN method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Binding,
    Allocate,
    Refresh,
    CreatePermission,
    Connect,
    ConnectionBind,
    ConnectionAttempt,
    Other(u16),
}

impl Method {
    pub fn code(self) -> u16 {
        match self {
            Method::Binding => 0x001,
            Method::Allocate => 0x003,
            Method::Refresh => 0x004,
            Method::CreatePermission => 0x008,
            Method::Connect => 0x00A,
            Method::ConnectionBind => 0x00B,
            Method::ConnectionAttempt => 0x00C,
            Method::Other(code) => code,
        }
    }

    pub fn from_code(code: u16) -> Self {
        match code {
            0x001 => Method::Binding,
            0x003 => Method::Allocate,
            0x004 => Method::Refresh,
            0x008 => Method::CreatePermission,
            0x00A => Method::Connect,
            0x00B => Method::ConnectionBind,
            0x00C => Method::ConnectionAttempt,
            other => Method::Other(other),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Method::Binding => "Binding",
            Method::Allocate => "Allocate",
            Method::Refresh => "Refresh",
            Method::CreatePermission => "CreatePermission",
            Method::Connect => "Connect",
            Method::ConnectionBind => "ConnectionBind",
            Method::ConnectionAttempt => "ConnectionAttempt",
            Method::Other(_) => "Unknown",
        }
    }
}

fn encode_type(method: Method, class: Class) -> u16 {
    let m = method.code() & 0x0FFF;
    let c = class.bits();
    (m & 0x000F) | ((m & 0x0070) << 1) | ((m & 0x0F80) << 2) | ((c & 0b01) << 4) | ((c & 0b10) << 7)
}

fn decode_type(value: u16) -> (Method, Class) {
    let m = (value & 0x000F) | ((value & 0x00E0) >> 1) | ((value & 0x3E00) >> 2);
    let c = ((value >> 4) & 0b01) | ((value >> 7) & 0b10);
    (Method::from_code(m), Class::from_bits(c))
}

fn padded(len: usize) -> usize {
    (len + 3) & !3
}

/// A single raw attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub kind: u16,
    pub value: Vec<u8>,
}

/// Result of checking MESSAGE-INTEGRITY on a received message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Integrity {
    Absent,
    Valid,
    Invalid,
}

/// A decoded or under-construction STUN message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub method: Method,
    pub class: Class,
    pub transaction_id: [u8; TRANSACTION_ID_LEN],
    attributes: Vec<Attribute>,
}

impl Message {
    /// New message with a random transaction id.
    pub fn new(method: Method, class: Class) -> Self {
        Self::with_transaction_id(method, class, rand::random())
    }

    pub fn with_transaction_id(
        method: Method,
        class: Class,
        transaction_id: [u8; TRANSACTION_ID_LEN],
    ) -> Self {
        Self {
            method,
            class,
            transaction_id,
            attributes: Vec::new(),
        }
    }

    /// Build a response skeleton that answers `request`.
    pub fn response_to(request: &Message, class: Class) -> Self {
        Self::with_transaction_id(request.method, class, request.transaction_id)
    }

    pub fn add(&mut self, kind: u16, value: impl Into<Vec<u8>>) -> &mut Self {
        self.attributes.push(Attribute {
            kind,
            value: value.into(),
        });
        self
    }

    pub fn attributes(&self) -> &[Attribute] {
        &self.attributes
    }

    /// First attribute of the given type.
    pub fn get(&self, kind: u16) -> Option<&[u8]> {
        self.attributes
            .iter()
            .find(|a| a.kind == kind)
            .map(|a| a.value.as_slice())
    }

    // ── Typed setters ───────────────────────────────────────────────

    pub fn set_credentials(&mut self, username: &str, realm: &str, nonce: &str) -> &mut Self {
        self.add(attr::USERNAME, username.as_bytes())
            .add(attr::REALM, realm.as_bytes())
            .add(attr::NONCE, nonce.as_bytes())
    }

    pub fn set_requested_transport(&mut self, protocol: u8) -> &mut Self {
        self.add(attr::REQUESTED_TRANSPORT, vec![protocol, 0, 0, 0])
    }

    pub fn set_lifetime(&mut self, secs: u32) -> &mut Self {
        self.add(attr::LIFETIME, secs.to_be_bytes().to_vec())
    }

    pub fn set_connection_id(&mut self, id: u32) -> &mut Self {
        self.add(attr::CONNECTION_ID, id.to_be_bytes().to_vec())
    }

    pub fn set_xor_address(&mut self, kind: u16, addr: SocketAddr) -> &mut Self {
        let value = encode_xor_address(addr, &self.transaction_id);
        self.add(kind, value)
    }

    pub fn set_error_code(&mut self, code: u16, reason: &str) -> &mut Self {
        let mut value = vec![0, 0, (code / 100) as u8, (code % 100) as u8];
        value.extend_from_slice(reason.as_bytes());
        self.add(attr::ERROR_CODE, value)
    }

    // ── Typed getters ───────────────────────────────────────────────

    pub fn realm(&self) -> Option<String> {
        self.get(attr::REALM)
            .map(|v| String::from_utf8_lossy(v).into_owned())
    }

    pub fn nonce(&self) -> Option<String> {
        self.get(attr::NONCE)
            .map(|v| String::from_utf8_lossy(v).into_owned())
    }

    pub fn username(&self) -> Option<String> {
        self.get(attr::USERNAME)
            .map(|v| String::from_utf8_lossy(v).into_owned())
    }

    /// `(code, reason)` from ERROR-CODE.
    pub fn error_code(&self) -> Option<(u16, String)> {
        let value = self.get(attr::ERROR_CODE)?;
        if value.len() < 4 {
            return None;
        }
        let code = u16::from(value[2] & 0x07) * 100 + u16::from(value[3]);
        let reason = String::from_utf8_lossy(&value[4..]).into_owned();
        Some((code, reason))
    }

    pub fn lifetime(&self) -> Option<u32> {
        let value = self.get(attr::LIFETIME)?;
        let bytes: [u8; 4] = value.get(..4)?.try_into().ok()?;
        Some(u32::from_be_bytes(bytes))
    }

    pub fn connection_id(&self) -> Option<u32> {
        let value = self.get(attr::CONNECTION_ID)?;
        let bytes: [u8; 4] = value.get(..4)?.try_into().ok()?;
        Some(u32::from_be_bytes(bytes))
    }

    pub fn requested_transport(&self) -> Option<u8> {
        self.get(attr::REQUESTED_TRANSPORT)
            .and_then(|v| v.first().copied())
    }

    pub fn xor_address(&self, kind: u16) -> Option<SocketAddr> {
        decode_xor_address(self.get(kind)?, &self.transaction_id)
    }

    // ── Encoding ────────────────────────────────────────────────────

    fn encode_body(&self) -> Vec<u8> {
        let mut body = Vec::new();
        for attribute in &self.attributes {
            body.extend_from_slice(&attribute.kind.to_be_bytes());
            body.extend_from_slice(&(attribute.value.len() as u16).to_be_bytes());
            body.extend_from_slice(&attribute.value);
            body.resize(padded(body.len()), 0);
        }
        body
    }

    fn encode_header(&self, body_len: usize) -> Vec<u8> {
        let mut header = Vec::with_capacity(HEADER_LEN);
        header.extend_from_slice(&encode_type(self.method, self.class).to_be_bytes());
        header.extend_from_slice(&(body_len as u16).to_be_bytes());
        header.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
        header.extend_from_slice(&self.transaction_id);
        header
    }

    /// Encode without MESSAGE-INTEGRITY.
    pub fn encode(&self) -> Vec<u8> {
        let body = self.encode_body();
        let mut out = self.encode_header(body.len());
        out.extend(body);
        out
    }

    /// Encode and append MESSAGE-INTEGRITY computed with `key`.
    pub fn encode_with_integrity(&self, key: &[u8]) -> Vec<u8> {
        let body = self.encode_body();
        let mut out = self.encode_header(body.len() + 4 + INTEGRITY_LEN);
        out.extend(body);

        let hmac_key = hmac::Key::new(hmac::HMAC_SHA1_FOR_LEGACY_USE_ONLY, key);
        let tag = hmac::sign(&hmac_key, &out);

        out.extend_from_slice(&attr::MESSAGE_INTEGRITY.to_be_bytes());
        out.extend_from_slice(&(INTEGRITY_LEN as u16).to_be_bytes());
        out.extend_from_slice(tag.as_ref());
        out
    }

    /// Decode a complete message. `buf` must hold exactly one message.
    pub fn decode(buf: &[u8]) -> GatewayResult<Self> {
        if buf.len() < HEADER_LEN {
            return Err(GatewayError::MalformedFrame(format!(
                "data contains incomplete STUN or TURN frame ({} bytes)",
                buf.len()
            )));
        }
        let raw_type = u16::from_be_bytes([buf[0], buf[1]]);
        if raw_type & 0xC000 != 0 {
            return Err(GatewayError::MalformedFrame(
                "leading bits are not a STUN message".into(),
            ));
        }
        let cookie = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        if cookie != MAGIC_COOKIE {
            return Err(GatewayError::MalformedFrame(format!(
                "bad magic cookie {cookie:#010x}"
            )));
        }
        let body_len = usize::from(u16::from_be_bytes([buf[2], buf[3]]));
        if body_len % 4 != 0 || buf.len() != HEADER_LEN + body_len {
            return Err(GatewayError::MalformedFrame(format!(
                "length field {body_len} does not match {} byte frame",
                buf.len()
            )));
        }

        let (method, class) = decode_type(raw_type);
        let mut transaction_id = [0u8; TRANSACTION_ID_LEN];
        transaction_id.copy_from_slice(&buf[8..HEADER_LEN]);

        let mut attributes = Vec::new();
        let mut offset = HEADER_LEN;
        while offset + 4 <= buf.len() {
            let kind = u16::from_be_bytes([buf[offset], buf[offset + 1]]);
            let len = usize::from(u16::from_be_bytes([buf[offset + 2], buf[offset + 3]]));
            let start = offset + 4;
            if start + len > buf.len() {
                return Err(GatewayError::MalformedFrame(format!(
                    "attribute {kind:#06x} overruns frame"
                )));
            }
            attributes.push(Attribute {
                kind,
                value: buf[start..start + len].to_vec(),
            });
            offset = start + padded(len);
        }

        Ok(Self {
            method,
            class,
            transaction_id,
            attributes,
        })
    }
}

/// Check MESSAGE-INTEGRITY of the raw encoded message `raw` against `key`.
pub fn check_integrity(raw: &[u8], key: &[u8]) -> Integrity {
    let mut offset = HEADER_LEN;
    while offset + 4 <= raw.len() {
        let kind = u16::from_be_bytes([raw[offset], raw[offset + 1]]);
        let len = usize::from(u16::from_be_bytes([raw[offset + 2], raw[offset + 3]]));
        if kind == attr::MESSAGE_INTEGRITY {
            let start = offset + 4;
            if len != INTEGRITY_LEN || start + len > raw.len() {
                return Integrity::Invalid;
            }
            // The length field covers everything up to and including the integrity attribute.
            let mut covered = raw[..offset].to_vec();
            let adjusted = (offset - HEADER_LEN + 4 + INTEGRITY_LEN) as u16;
            covered[2..4].copy_from_slice(&adjusted.to_be_bytes());

            let hmac_key = hmac::Key::new(hmac::HMAC_SHA1_FOR_LEGACY_USE_ONLY, key);
            return match hmac::verify(&hmac_key, &covered, &raw[start..start + len]) {
                Ok(()) => Integrity::Valid,
                Err(_) => Integrity::Invalid,
            };
        }
        offset += 4 + padded(len);
    }
    Integrity::Absent
}

/// Long-term credential key: `MD5(username ":" realm ":" password)`.
pub fn long_term_key(username: &str, realm: &str, password: &str) -> Vec<u8> {
    Md5::digest(format!("{username}:{realm}:{password}").as_bytes()).to_vec()
}

fn xor_mask(transaction_id: &[u8; TRANSACTION_ID_LEN]) -> [u8; 16] {
    let mut mask = [0u8; 16];
    mask[..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
    mask[4..].copy_from_slice(transaction_id);
    mask
}

fn encode_xor_address(addr: SocketAddr, transaction_id: &[u8; TRANSACTION_ID_LEN]) -> Vec<u8> {
    let mask = xor_mask(transaction_id);
    let port = addr.port() ^ (MAGIC_COOKIE >> 16) as u16;
    let mut value = Vec::with_capacity(20);
    match addr.ip() {
        IpAddr::V4(ip) => {
            value.extend_from_slice(&[0, 0x01]);
            value.extend_from_slice(&port.to_be_bytes());
            value.extend(ip.octets().iter().zip(mask.iter()).map(|(b, m)| b ^ m));
        }
        IpAddr::V6(ip) => {
            value.extend_from_slice(&[0, 0x02]);
            value.extend_from_slice(&port.to_be_bytes());
            value.extend(ip.octets().iter().zip(mask.iter()).map(|(b, m)| b ^ m));
        }
    }
    value
}

fn decode_xor_address(value: &[u8], transaction_id: &[u8; TRANSACTION_ID_LEN]) -> Option<SocketAddr> {
    if value.len() < 4 {
        return None;
    }
    let mask = xor_mask(transaction_id);
    let port = u16::from_be_bytes([value[2], value[3]]) ^ (MAGIC_COOKIE >> 16) as u16;
    match value[1] {
        0x01 if value.len() >= 8 => {
            let mut octets = [0u8; 4];
            for (i, octet) in octets.iter_mut().enumerate() {
                *octet = value[4 + i] ^ mask[i];
            }
            Some(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(octets)), port))
        }
        0x02 if value.len() >= 20 => {
            let mut octets = [0u8; 16];
            for (i, octet) in octets.iter_mut().enumerate() {
                *octet = value[4 + i] ^ mask[i];
            }
            Some(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_type_bits() {
        assert_eq!(encode_type(Method::Allocate, Class::Request), 0x0003);
        assert_eq!(encode_type(Method::Allocate, Class::Success), 0x0103);
        assert_eq!(encode_type(Method::Allocate, Class::Error), 0x0113);
        assert_eq!(encode_type(Method::ConnectionAttempt, Class::Indication), 0x001C);
        assert_eq!(
            decode_type(0x010B),
            (Method::ConnectionBind, Class::Success)
        );
    }

    #[test]
    fn decode_reads_attributes_and_padding() {
        let mut msg = Message::new(Method::Allocate, Class::Error);
        msg.set_error_code(401, "Unauthorized");
        msg.add(attr::REALM, b"example.org".to_vec());
        msg.add(attr::NONCE, b"abc".to_vec());

        let decoded = Message::decode(&msg.encode()).unwrap();
        assert_eq!(decoded.error_code(), Some((401, "Unauthorized".to_string())));
        assert_eq!(decoded.realm().as_deref(), Some("example.org"));
        assert_eq!(decoded.nonce().as_deref(), Some("abc"));
        assert_eq!(decoded.transaction_id, msg.transaction_id);
    }

    #[test]
    fn xor_addresses_survive_transaction_masking() {
        let v4: SocketAddr = "203.0.113.9:41000".parse().unwrap();
        let v6: SocketAddr = "[2001:db8::7]:5349".parse().unwrap();
        let mut msg = Message::new(Method::Allocate, Class::Success);
        msg.set_xor_address(attr::XOR_RELAYED_ADDRESS, v4);
        msg.set_xor_address(attr::XOR_PEER_ADDRESS, v6);

        let encoded = msg.encode();
        // The raw attribute must not leak the plain address.
        assert!(!encoded.windows(4).any(|w| w == [203, 0, 113, 9]));

        let decoded = Message::decode(&encoded).unwrap();
        assert_eq!(decoded.xor_address(attr::XOR_RELAYED_ADDRESS), Some(v4));
        assert_eq!(decoded.xor_address(attr::XOR_PEER_ADDRESS), Some(v6));
    }

    #[test]
    fn integrity_verifies_and_detects_tampering() {
        let key = long_term_key("user", "realm", "pass");
        let mut msg = Message::new(Method::Refresh, Class::Request);
        msg.set_credentials("user", "realm", "nonce").set_lifetime(600);
        let raw = msg.encode_with_integrity(&key);

        assert_eq!(check_integrity(&raw, &key), Integrity::Valid);
        assert_eq!(
            check_integrity(&raw, &long_term_key("user", "realm", "wrong")),
            Integrity::Invalid
        );

        let mut tampered = raw.clone();
        tampered[HEADER_LEN + 4] ^= 0xFF;
        assert_eq!(check_integrity(&tampered, &key), Integrity::Invalid);

        assert_eq!(check_integrity(&msg.encode(), &key), Integrity::Absent);
        // Decoding a message carrying integrity still yields the other attributes.
        assert_eq!(Message::decode(&raw).unwrap().lifetime(), Some(600));
    }

    #[test]
    fn long_term_key_is_md5_of_triplet() {
        // MD5("user:realm:pass")
        assert_eq!(
            hex::encode(long_term_key("user", "realm", "pass")),
            "8493fbc53ba582fb4c044c456bdc40eb"
        );
    }

    #[test]
    fn rejects_non_stun_bytes() {
        let err = Message::decode(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").unwrap_err();
        assert!(err.is_frame_noise());

        let err = Message::decode(&[0u8; 8]).unwrap_err();
        assert!(err.is_frame_noise());
    }
}
