//! Wire encoding of mesh records.
//!
//! Every peer record is one CRLF-terminated text line. The first line in
//! each direction is the handshake:
//!
//! ```text
//! HELLO <server_id_hex> <proto_version>
//! ```
//!
//! and every subsequent line is a datagram:
//!
//! ```text
//! MSG <origin> <counter> <TYPE> [ttl=<n>] [to=<serverid>] [re=<origin>:<counter>] <payload>
//! ```
//!
//! `origin` is the hex server id, `counter` is decimal, `TYPE` is an
//! uppercase token, optional attributes are `key=value` tokens before the
//! payload, and the payload is unpadded base64 with `-` standing for the
//! empty payload. Text rather than binary: mesh links carry low volume and
//! packet captures should read back as the protocol.

use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine as _;

use crate::id::{MessageId, ServerId};

/// Peer protocol version sent in HELLO. Bumped on incompatible changes.
pub const PROTOCOL_VERSION: u32 = 1;

/// A peer-to-peer message, in memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeshDatagram {
    pub id: MessageId,
    /// Tag from the open set of types (SPEECH, I-AM, PEER-SET, ...).
    pub kind: String,
    /// Remaining hops; `None` means unlimited. Zero suppresses forwarding
    /// but observers are still notified.
    pub ttl: Option<u32>,
    /// When set, recipient-filtered observers on other servers skip this
    /// datagram; forwarding is unaffected.
    pub recipient: Option<ServerId>,
    /// Correlation id for request/response layering on top of the mesh.
    pub reply_to: Option<MessageId>,
    /// Opaque bytes interpreted by the observer keyed on `kind`.
    pub payload: Vec<u8>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum WireError {
    #[error("record is not text")]
    NotText,
    #[error("unknown record prefix")]
    BadPrefix,
    #[error("truncated record")]
    Truncated,
    #[error("invalid server id")]
    BadServerId,
    #[error("invalid counter")]
    BadCounter,
    #[error("invalid type tag")]
    BadTag,
    #[error("invalid attribute `{0}`")]
    BadAttr(String),
    #[error("invalid payload encoding")]
    BadPayload,
}

impl MeshDatagram {
    /// Render the datagram as a wire line, without the CRLF terminator.
    pub fn encode(&self) -> String {
        let mut line = format!("MSG {} {} {}", self.id.origin, self.id.counter, self.kind);
        if let Some(ttl) = self.ttl {
            line.push_str(&format!(" ttl={ttl}"));
        }
        if let Some(to) = self.recipient {
            line.push_str(&format!(" to={to}"));
        }
        if let Some(re) = self.reply_to {
            line.push_str(&format!(" re={re}"));
        }
        if self.payload.is_empty() {
            line.push_str(" -");
        } else {
            line.push(' ');
            line.push_str(&STANDARD_NO_PAD.encode(&self.payload));
        }
        line
    }

    /// Parse a wire line (without terminator) back into a datagram.
    pub fn decode(line: &[u8]) -> Result<Self, WireError> {
        let text = std::str::from_utf8(line).map_err(|_| WireError::NotText)?;
        let mut tokens = text.split_ascii_whitespace();

        if tokens.next() != Some("MSG") {
            return Err(WireError::BadPrefix);
        }
        let origin = tokens
            .next()
            .and_then(ServerId::parse)
            .ok_or(WireError::BadServerId)?;
        let counter = tokens
            .next()
            .ok_or(WireError::Truncated)?
            .parse::<u64>()
            .map_err(|_| WireError::BadCounter)?;
        let kind = tokens.next().ok_or(WireError::Truncated)?;
        if kind.is_empty() || !kind.bytes().all(is_tag_byte) {
            return Err(WireError::BadTag);
        }

        let rest: Vec<&str> = tokens.collect();
        let (payload_token, attrs) = rest.split_last().ok_or(WireError::Truncated)?;

        let mut ttl = None;
        let mut recipient = None;
        let mut reply_to = None;
        for attr in attrs {
            let (key, value) = attr
                .split_once('=')
                .ok_or_else(|| WireError::BadAttr(attr.to_string()))?;
            match key {
                "ttl" => {
                    ttl = Some(
                        value
                            .parse::<u32>()
                            .map_err(|_| WireError::BadAttr(attr.to_string()))?,
                    );
                }
                "to" => {
                    recipient =
                        Some(ServerId::parse(value).ok_or(WireError::BadServerId)?);
                }
                "re" => {
                    reply_to = Some(parse_message_id(value)
                        .ok_or_else(|| WireError::BadAttr(attr.to_string()))?);
                }
                // Unknown attributes from newer peers are skipped.
                _ => {}
            }
        }

        let payload = if *payload_token == "-" {
            Vec::new()
        } else {
            STANDARD_NO_PAD
                .decode(payload_token)
                .map_err(|_| WireError::BadPayload)?
        };

        Ok(MeshDatagram {
            id: MessageId { origin, counter },
            kind: kind.to_string(),
            ttl,
            recipient,
            reply_to,
            payload,
        })
    }
}

fn is_tag_byte(b: u8) -> bool {
    b.is_ascii_uppercase() || b.is_ascii_digit() || b == b'_' || b == b'-'
}

fn parse_message_id(s: &str) -> Option<MessageId> {
    let (origin, counter) = s.split_once(':')?;
    Some(MessageId {
        origin: ServerId::parse(origin)?,
        counter: counter.parse().ok()?,
    })
}

/// The first record each side sends on a fresh peer link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hello {
    pub server_id: ServerId,
    pub version: u32,
}

impl Hello {
    pub fn encode(&self) -> String {
        format!("HELLO {} {}", self.server_id, self.version)
    }

    pub fn decode(line: &[u8]) -> Result<Self, WireError> {
        let text = std::str::from_utf8(line).map_err(|_| WireError::NotText)?;
        let mut tokens = text.split_ascii_whitespace();
        if tokens.next() != Some("HELLO") {
            return Err(WireError::BadPrefix);
        }
        let server_id = tokens
            .next()
            .and_then(ServerId::parse)
            .ok_or(WireError::BadServerId)?;
        let version = tokens
            .next()
            .ok_or(WireError::Truncated)?
            .parse::<u32>()
            .map_err(|_| WireError::BadCounter)?;
        Ok(Hello { server_id, version })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn datagram(payload: &[u8]) -> MeshDatagram {
        MeshDatagram {
            id: MessageId {
                origin: ServerId::parse(&"ab".repeat(16)).unwrap(),
                counter: 42,
            },
            kind: "SPEECH".to_string(),
            ttl: None,
            recipient: None,
            reply_to: None,
            payload: payload.to_vec(),
        }
    }

    #[test]
    fn roundtrip_plain() {
        let d = datagram(b"alice|hello world");
        assert_eq!(MeshDatagram::decode(d.encode().as_bytes()).unwrap(), d);
    }

    #[test]
    fn roundtrip_empty_payload() {
        let d = datagram(b"");
        let line = d.encode();
        assert!(line.ends_with(" -"));
        assert_eq!(MeshDatagram::decode(line.as_bytes()).unwrap(), d);
    }

    #[test]
    fn roundtrip_all_attributes() {
        let mut d = datagram(b"x");
        d.ttl = Some(3);
        d.recipient = Some(ServerId::parse(&"cd".repeat(16)).unwrap());
        d.reply_to = Some(MessageId {
            origin: ServerId::parse(&"ef".repeat(16)).unwrap(),
            counter: 7,
        });
        assert_eq!(MeshDatagram::decode(d.encode().as_bytes()).unwrap(), d);
    }

    #[test]
    fn attribute_order_is_irrelevant() {
        let origin = "ab".repeat(16);
        let to = "cd".repeat(16);
        let line = format!("MSG {origin} 5 PING to={to} ttl=1 -");
        let d = MeshDatagram::decode(line.as_bytes()).unwrap();
        assert_eq!(d.ttl, Some(1));
        assert_eq!(d.recipient, Some(ServerId::parse(&to).unwrap()));
    }

    #[test]
    fn unknown_attribute_skipped() {
        let origin = "ab".repeat(16);
        let line = format!("MSG {origin} 5 PING color=red -");
        assert!(MeshDatagram::decode(line.as_bytes()).is_ok());
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(MeshDatagram::decode(b"GARBAGE"), Err(WireError::BadPrefix));
        assert_eq!(
            MeshDatagram::decode(b"MSG notanid 1 SPEECH -"),
            Err(WireError::BadServerId)
        );
    }

    #[test]
    fn rejects_lowercase_tag() {
        let origin = "ab".repeat(16);
        let line = format!("MSG {origin} 1 speech -");
        assert_eq!(MeshDatagram::decode(line.as_bytes()), Err(WireError::BadTag));
    }

    #[test]
    fn rejects_bad_counter_and_payload() {
        let origin = "ab".repeat(16);
        assert_eq!(
            MeshDatagram::decode(format!("MSG {origin} x SPEECH -").as_bytes()),
            Err(WireError::BadCounter)
        );
        assert_eq!(
            MeshDatagram::decode(format!("MSG {origin} 1 SPEECH !!!").as_bytes()),
            Err(WireError::BadPayload)
        );
    }

    #[test]
    fn rejects_truncated() {
        let origin = "ab".repeat(16);
        assert_eq!(
            MeshDatagram::decode(format!("MSG {origin} 1").as_bytes()),
            Err(WireError::Truncated)
        );
    }

    #[test]
    fn hello_roundtrip() {
        let hello = Hello {
            server_id: ServerId::random(),
            version: PROTOCOL_VERSION,
        };
        assert_eq!(Hello::decode(hello.encode().as_bytes()).unwrap(), hello);
    }

    #[test]
    fn hello_rejects_msg_line() {
        assert_eq!(
            Hello::decode(b"MSG x 1 SPEECH -"),
            Err(WireError::BadPrefix)
        );
    }
}
