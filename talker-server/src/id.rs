//! Server and message identities.
//!
//! A [`ServerId`] is a random 128-bit token chosen at startup, rendered as
//! 32 lowercase hex characters on the wire. A [`MessageId`] is the pair
//! (origin, counter); two datagrams are the same message iff their ids are
//! equal, which is what the flooding dedup keys on.

use std::fmt;

use rand::RngCore;

const HEX: &[u8; 16] = b"0123456789abcdef";

/// Stable identifier for one server instance, unique across the mesh.
/// Compared by byte equality; ordered only for deterministic tie-breaks.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServerId([u8; 16]);

impl ServerId {
    /// Generate a fresh random id.
    pub fn random() -> Self {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        ServerId(bytes)
    }

    /// Parse 32 hex characters. Returns `None` on any other input.
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.as_bytes();
        if s.len() != 32 {
            return None;
        }
        let mut bytes = [0u8; 16];
        for (i, chunk) in s.chunks(2).enumerate() {
            let hi = hex_val(chunk[0])?;
            let lo = hex_val(chunk[1])?;
            bytes[i] = (hi << 4) | lo;
        }
        Some(ServerId(bytes))
    }

    /// First 8 hex characters, for logs.
    pub fn short(&self) -> String {
        self.to_string()[..8].to_string()
    }
}

fn hex_val(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = [0u8; 32];
        for (i, b) in self.0.iter().enumerate() {
            out[2 * i] = HEX[(b >> 4) as usize];
            out[2 * i + 1] = HEX[(b & 0x0f) as usize];
        }
        // All bytes come from the hex alphabet.
        f.write_str(std::str::from_utf8(&out).unwrap())
    }
}

impl fmt::Debug for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ServerId({self})")
    }
}

/// Unique identity of a datagram: assigned exactly once at the origin,
/// never rewritten on forwarding.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct MessageId {
    pub origin: ServerId,
    pub counter: u64,
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.origin, self.counter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let id = ServerId::random();
        let parsed = ServerId::parse(&id.to_string()).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn parse_rejects_bad_input() {
        assert!(ServerId::parse("").is_none());
        assert!(ServerId::parse("abcd").is_none());
        assert!(ServerId::parse(&"g".repeat(32)).is_none());
    }

    #[test]
    fn uppercase_accepted_rendered_lowercase() {
        let id = ServerId::parse(&"AB".repeat(16)).unwrap();
        assert_eq!(id.to_string(), "ab".repeat(16));
    }

    #[test]
    fn random_ids_differ() {
        assert_ne!(ServerId::random(), ServerId::random());
    }

    #[test]
    fn ordering_is_bytewise() {
        let lo = ServerId::parse(&"00".repeat(16)).unwrap();
        let hi = ServerId::parse(&"ff".repeat(16)).unwrap();
        assert!(lo < hi);
    }
}
