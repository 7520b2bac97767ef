//! Error kinds shared across the crate.

use std::fmt;

/// Why a connection or peer link was closed. Confined to the offending
/// connection; the server never aborts on a single peer's misbehaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Socket-level failure or remote EOF.
    Io,
    /// Unparseable peer record.
    Malformed,
    /// HELLO version mismatch or self-connect.
    Protocol,
    /// HELLO did not complete within the handshake deadline.
    HandshakeTimeout,
    /// Framing limit exceeded.
    Oversize,
    /// A second UP link to the same remote server lost the tie-break.
    DuplicatePeer,
    /// Orderly close triggered by the operator.
    Shutdown,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CloseReason::Io => "IO",
            CloseReason::Malformed => "MALFORMED",
            CloseReason::Protocol => "PROTOCOL",
            CloseReason::HandshakeTimeout => "HANDSHAKE_TIMEOUT",
            CloseReason::Oversize => "OVERSIZE",
            CloseReason::DuplicatePeer => "DUPLICATE_PEER",
            CloseReason::Shutdown => "SHUTDOWN",
        };
        f.write_str(s)
    }
}

/// A listener could not be bound. Distinguished from other startup errors
/// so the launcher can exit with the documented code.
#[derive(Debug, thiserror::Error)]
#[error("failed to bind {addr}: {source}")]
pub struct BindError {
    pub addr: String,
    #[source]
    pub source: std::io::Error,
}
