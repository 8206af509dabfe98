//! # Close
//!
//! Status codes and payload layout of close frames
//! ([RFC 6455 Section 7.4](https://datatracker.ietf.org/doc/html/rfc6455#section-7.4)).
//!
//! A close payload is either empty or a 2-byte big-endian status code followed by an
//! optional UTF-8 reason:
//!
//! ```text
//! +--------+--------+---------------------------+
//! |  code (u16, BE) |  reason (UTF-8, optional)  |
//! +--------+--------+---------------------------+
//! ```
use bytes::Bytes;

use crate::WebSocketError;

/// Status code carried by a close frame.
///
/// Unknown values are preserved in the `Iana`, `Library` and `Bad` variants so they survive
/// a parse/encode cycle.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CloseCode {
    /// 1000: normal closure.
    Normal,
    /// 1001: endpoint going away (server shutdown, page navigation).
    Away,
    /// 1002: protocol error.
    Protocol,
    /// 1003: received a data type the endpoint cannot accept.
    Unsupported,
    /// 1005: no status code was present. Never sent on the wire.
    Status,
    /// 1006: connection dropped without a close frame. Never sent on the wire.
    Abnormal,
    /// 1007: payload inconsistent with the message type (e.g. non UTF-8 text).
    Invalid,
    /// 1008: policy violation.
    Policy,
    /// 1009: message too big to process.
    Size,
    /// 1010: client expected an extension the server did not negotiate.
    Extension,
    /// 1011: unexpected condition on the server.
    Error,
    /// 1012: service restart.
    Restart,
    /// 1013: try again later.
    Again,
    /// 1014: a gateway or proxy got an invalid response upstream.
    BadGateway,
    /// 1015: TLS handshake failure. Never sent on the wire.
    Tls,
    /// Reserved codes in 1004 and 1016-2999.
    Reserved(u16),
    /// Codes 3000-3999, registered with IANA.
    Iana(u16),
    /// Codes 4000-4999, private use.
    Library(u16),
    /// Anything outside the ranges above.
    Bad(u16),
}

impl CloseCode {
    /// Whether a peer is allowed to put this code in a close frame.
    pub fn is_allowed(self) -> bool {
        !matches!(
            self,
            Self::Status | Self::Abnormal | Self::Tls | Self::Reserved(_) | Self::Bad(_)
        )
    }
}

impl From<u16> for CloseCode {
    fn from(code: u16) -> Self {
        match code {
            1000 => Self::Normal,
            1001 => Self::Away,
            1002 => Self::Protocol,
            1003 => Self::Unsupported,
            1005 => Self::Status,
            1006 => Self::Abnormal,
            1007 => Self::Invalid,
            1008 => Self::Policy,
            1009 => Self::Size,
            1010 => Self::Extension,
            1011 => Self::Error,
            1012 => Self::Restart,
            1013 => Self::Again,
            1014 => Self::BadGateway,
            1015 => Self::Tls,
            1004 | 1016..=2999 => Self::Reserved(code),
            3000..=3999 => Self::Iana(code),
            4000..=4999 => Self::Library(code),
            _ => Self::Bad(code),
        }
    }
}

impl From<CloseCode> for u16 {
    fn from(code: CloseCode) -> Self {
        match code {
            CloseCode::Normal => 1000,
            CloseCode::Away => 1001,
            CloseCode::Protocol => 1002,
            CloseCode::Unsupported => 1003,
            CloseCode::Status => 1005,
            CloseCode::Abnormal => 1006,
            CloseCode::Invalid => 1007,
            CloseCode::Policy => 1008,
            CloseCode::Size => 1009,
            CloseCode::Extension => 1010,
            CloseCode::Error => 1011,
            CloseCode::Restart => 1012,
            CloseCode::Again => 1013,
            CloseCode::BadGateway => 1014,
            CloseCode::Tls => 1015,
            CloseCode::Reserved(code)
            | CloseCode::Iana(code)
            | CloseCode::Library(code)
            | CloseCode::Bad(code) => code,
        }
    }
}

impl std::fmt::Display for CloseCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", u16::from(*self))
    }
}

/// Parsed close frame payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    /// Status code. [`CloseCode::Status`] when the payload was empty.
    pub code: CloseCode,
    /// Reason text, possibly empty.
    pub reason: String,
}

impl CloseReason {
    /// Creates a close reason.
    pub fn new(code: CloseCode, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    /// The reason of an empty close payload.
    pub fn empty() -> Self {
        Self::new(CloseCode::Status, "")
    }

    /// Parses a close frame payload.
    ///
    /// # Errors
    /// - [`WebSocketError::InvalidCloseFrame`] when the payload is exactly 1 byte
    /// - [`WebSocketError::InvalidUTF8`] when the reason is not valid UTF-8
    pub fn parse(payload: &[u8]) -> Result<Self, WebSocketError> {
        match payload.len() {
            0 => Ok(Self::empty()),
            1 => Err(WebSocketError::InvalidCloseFrame),
            _ => {
                let code = CloseCode::from(u16::from_be_bytes([payload[0], payload[1]]));
                let reason = std::str::from_utf8(&payload[2..])
                    .map_err(|_| WebSocketError::InvalidUTF8)?;
                Ok(Self::new(code, reason))
            }
        }
    }

    /// Encodes this reason as a close frame payload.
    ///
    /// [`CloseCode::Status`] encodes as an empty payload.
    pub fn encode(&self) -> Bytes {
        if self.code == CloseCode::Status {
            return Bytes::new();
        }

        let mut payload = Vec::with_capacity(2 + self.reason.len());
        payload.extend_from_slice(&u16::from(self.code).to_be_bytes());
        payload.extend_from_slice(self.reason.as_bytes());
        payload.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_conversion() {
        for raw in [
            1000u16, 1001, 1002, 1003, 1007, 1008, 1009, 1010, 1011, 1012, 1013, 1014, 3000, 4999,
        ] {
            assert_eq!(u16::from(CloseCode::from(raw)), raw);
        }
        assert_eq!(CloseCode::from(1004), CloseCode::Reserved(1004));
        assert_eq!(CloseCode::from(999), CloseCode::Bad(999));
        assert_eq!(CloseCode::from(4001), CloseCode::Library(4001));
    }

    #[test]
    fn test_is_allowed() {
        assert!(CloseCode::Normal.is_allowed());
        assert!(CloseCode::Iana(3001).is_allowed());
        assert!(CloseCode::from(1014).is_allowed());
        assert!(CloseCode::Library(4000).is_allowed());
        assert!(!CloseCode::Status.is_allowed());
        assert!(!CloseCode::Abnormal.is_allowed());
        assert!(!CloseCode::Tls.is_allowed());
        assert!(!CloseCode::Reserved(1016).is_allowed());
        assert!(!CloseCode::Bad(5000).is_allowed());
    }

    #[test]
    fn test_parse_empty() {
        let reason = CloseReason::parse(&[]).unwrap();
        assert_eq!(reason.code, CloseCode::Status);
        assert!(reason.reason.is_empty());
        assert!(reason.encode().is_empty());
    }

    #[test]
    fn test_parse_one_byte() {
        assert!(matches!(
            CloseReason::parse(&[0x03]),
            Err(WebSocketError::InvalidCloseFrame)
        ));
    }

    #[test]
    fn test_parse_code_and_reason() {
        let reason = CloseReason::parse(b"\x03\xE8Goodbye").unwrap();
        assert_eq!(reason.code, CloseCode::Normal);
        assert_eq!(reason.reason, "Goodbye");
        assert_eq!(&reason.encode()[..], b"\x03\xE8Goodbye");
    }

    #[test]
    fn test_parse_invalid_utf8() {
        assert!(matches!(
            CloseReason::parse(&[0x03, 0xE8, 0xFF, 0xFE]),
            Err(WebSocketError::InvalidUTF8)
        ));
    }
}
