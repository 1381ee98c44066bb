//! # Close
//!
//! Close codes, the close frame payload and the closing handshake (RFC 6455 Section 7).
//!
//! A close payload is either empty or a big-endian status code followed by an optional UTF-8
//! reason. Either endpoint may start closing; the other answers with a Close frame of its own,
//! after which the transport is shut down. [`CloseNegotiator`] keeps track of which side has
//! already sent and received its Close frame so that exactly one is ever sent.
//!
//! ```rust
//! use wsengine::close::{CloseCode, CloseNegotiator, CloseReason};
//!
//! let mut negotiator = CloseNegotiator::default();
//!
//! let peer = CloseReason::decode(b"\x03\xe8bye").unwrap();
//! assert_eq!(peer.as_ref().map(CloseReason::code), Some(CloseCode::Normal));
//!
//! // nothing was sent yet, so the peer's close must be echoed
//! let echo = negotiator.on_peer_close(peer.as_ref());
//! assert!(echo.is_some());
//! assert!(negotiator.is_closed());
//! ```
use bytes::{BufMut, Bytes, BytesMut};

use crate::{frame::MAX_CONTROL_PAYLOAD, Frame, ProtocolError};

/// Longest reason that still fits a control frame next to the 2-byte code.
pub const MAX_REASON_LEN: usize = MAX_CONTROL_PAYLOAD - 2;

/// Status codes for the closing handshake.
///
/// Named variants cover the codes RFC 6455 (and the IANA registry) define; the remaining
/// ranges keep their raw value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseCode {
    /// 1000: the purpose of the connection has been fulfilled.
    Normal,
    /// 1001: the endpoint is going away (server shutdown, page navigation).
    Away,
    /// 1002: protocol error.
    Protocol,
    /// 1003: the endpoint received a type of data it cannot accept.
    Unsupported,
    /// 1005: no status code was present. Never sent on the wire.
    Status,
    /// 1006: the connection dropped without a Close frame. Never sent on the wire.
    Abnormal,
    /// 1007: message data was not consistent with its type (e.g. invalid UTF-8).
    Invalid,
    /// 1008: the message violates the endpoint's policy.
    Policy,
    /// 1009: the message is too big to process.
    Size,
    /// 1010: the client expected an extension the server did not negotiate.
    Extension,
    /// 1011: the server hit an unexpected condition.
    Error,
    /// 1012: the service is restarting.
    Restart,
    /// 1013: the service is overloaded, try again later.
    Again,
    /// 1015: TLS handshake failure. Never sent on the wire.
    Tls,
    /// 1004, 1014 and 1016-2999: reserved by the protocol.
    Reserved(u16),
    /// 3000-3999: registered with IANA for libraries and frameworks.
    Iana(u16),
    /// 4000-4999: private use by applications.
    Library(u16),
    /// Anything below 1000 or above 4999.
    Bad(u16),
}

impl CloseCode {
    /// Whether an endpoint may put this code in a Close frame.
    ///
    /// Valid iff `code >= 1000`, `code` is none of 1004, 1005 and 1006, `code` is not in
    /// 1012-2999 and `code <= 4999`.
    pub fn is_allowed(self) -> bool {
        let code = u16::from(self);
        (1000..=4999).contains(&code)
            && !matches!(code, 1004..=1006)
            && !(code > 1011 && code < 3000)
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
            1015 => Self::Tls,
            1004 | 1014 | 1016..=2999 => Self::Reserved(code),
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

/// The status code and optional reason of a Close frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    code: CloseCode,
    reason: Option<String>,
}

impl CloseReason {
    /// Builds a reason that can be sent to the peer.
    ///
    /// # Errors
    /// - [`ProtocolError::InvalidCloseCode`] if `code` may not appear on the wire (e.g. 1005).
    /// - [`ProtocolError::InvalidClosePayload`] if `reason` is longer than 123 bytes.
    pub fn new(code: CloseCode, reason: Option<&str>) -> Result<Self, ProtocolError> {
        if !code.is_allowed() {
            return Err(ProtocolError::InvalidCloseCode(code.into()));
        }
        if reason.is_some_and(|reason| reason.len() > MAX_REASON_LEN) {
            return Err(ProtocolError::InvalidClosePayload);
        }

        Ok(Self {
            code,
            reason: reason.map(str::to_owned),
        })
    }

    /// The 1006 reason reported locally when the transport went away without a Close frame,
    /// or when an idle timeout fired. It is never encoded.
    pub fn abnormal() -> Self {
        Self {
            code: CloseCode::Abnormal,
            reason: None,
        }
    }

    /// The reason sent to the peer before failing the connection on `err`.
    pub(crate) fn for_error(err: &ProtocolError) -> Self {
        let mut reason = err.to_string();
        reason.truncate(MAX_REASON_LEN);
        Self {
            code: err.close_code(),
            reason: Some(reason),
        }
    }

    #[inline]
    pub fn code(&self) -> CloseCode {
        self.code
    }

    #[inline]
    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }

    /// The code to report for a close that may have carried no status at all.
    ///
    /// An empty close payload counts as a normal closure.
    pub fn reported_code(reason: Option<&CloseReason>) -> CloseCode {
        reason.map_or(CloseCode::Normal, CloseReason::code)
    }

    /// Parses a received close payload.
    ///
    /// Returns `Ok(None)` for an empty payload ("no status code, no reason").
    ///
    /// # Errors
    /// - [`ProtocolError::InvalidClosePayload`] for a 1-byte payload.
    /// - [`ProtocolError::InvalidCloseCode`] for a code that may not be sent.
    /// - [`ProtocolError::InvalidUtf8`] if the reason is not UTF-8.
    pub fn decode(payload: &[u8]) -> Result<Option<Self>, ProtocolError> {
        match payload {
            [] => Ok(None),
            [_] => Err(ProtocolError::InvalidClosePayload),
            [hi, lo, rest @ ..] => {
                let code = CloseCode::from(u16::from_be_bytes([*hi, *lo]));
                if !code.is_allowed() {
                    return Err(ProtocolError::InvalidCloseCode(code.into()));
                }

                let reason = if rest.is_empty() {
                    None
                } else {
                    let reason =
                        std::str::from_utf8(rest).map_err(|_| ProtocolError::InvalidUtf8)?;
                    Some(reason.to_owned())
                };

                Ok(Some(Self { code, reason }))
            }
        }
    }

    /// Builds a close payload. `None` produces an empty payload.
    ///
    /// Codes that may not be sent (only [`CloseReason::abnormal`] can hold one) are also
    /// encoded as an empty payload.
    pub fn encode(reason: Option<&CloseReason>) -> Bytes {
        let Some(reason) = reason.filter(|reason| reason.code.is_allowed()) else {
            return Bytes::new();
        };

        let text = reason.reason.as_deref().unwrap_or_default();
        let mut payload = BytesMut::with_capacity(2 + text.len());
        payload.put_u16(reason.code.into());
        payload.put_slice(text.as_bytes());
        payload.freeze()
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.reason {
            Some(reason) => write!(f, "{} ({reason})", self.code),
            None => write!(f, "{}", self.code),
        }
    }
}

/// Tracks the closing handshake of one connection.
///
/// The negotiator only decides *which* Close frame to send. Sending it, flushing and then
/// closing the transport is the job of the connection driving it.
#[derive(Debug, Default)]
pub struct CloseNegotiator {
    sent: bool,
    received: bool,
}

impl CloseNegotiator {
    /// Starts the closing handshake from our side.
    ///
    /// Returns the Close frame to send, or `None` if one was already sent.
    pub fn initiate(&mut self, reason: Option<&CloseReason>) -> Option<Frame> {
        if self.sent {
            return None;
        }

        #[cfg(feature = "logging")]
        log::debug!(
            "initiating close with code {}",
            CloseReason::reported_code(reason)
        );

        self.sent = true;
        Some(Frame::close(reason))
    }

    /// Records the peer's Close frame and returns the echo to send, if we have not sent a Close
    /// frame yet. Once it is sent and flushed the transport should be closed.
    pub fn on_peer_close(&mut self, reason: Option<&CloseReason>) -> Option<Frame> {
        self.received = true;

        if self.sent {
            return None;
        }

        #[cfg(feature = "logging")]
        log::debug!(
            "peer closed with code {}, echoing",
            CloseReason::reported_code(reason)
        );

        self.sent = true;
        Some(Frame::close(reason))
    }

    /// Returns the Close frame that fails the connection because of `err`, unless a Close
    /// frame already went out.
    pub fn fail(&mut self, err: &ProtocolError) -> Option<Frame> {
        self.initiate(Some(&CloseReason::for_error(err)))
    }

    /// Marks the connection as closed without a handshake (transport loss, idle timeout) and
    /// returns the reason to report, as if the peer had sent it.
    pub fn abnormal(&mut self) -> CloseReason {
        self.sent = true;
        self.received = true;
        CloseReason::abnormal()
    }

    /// Whether our Close frame was produced.
    #[inline]
    pub fn is_sent(&self) -> bool {
        self.sent
    }

    /// Whether the peer's Close frame was seen.
    #[inline]
    pub fn is_received(&self) -> bool {
        self.received
    }

    /// Both directions are closed; the transport can be shut down.
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.sent && self.received
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::OpCode;

    mod code_tests {
        use super::*;

        #[test]
        fn test_legality() {
            for code in [1000u16, 1001, 1002, 1003, 1007, 1008, 1009, 1010, 1011, 3000, 3999, 4000, 4999] {
                assert!(CloseCode::from(code).is_allowed(), "{code}");
            }
            for code in [0u16, 999, 1004, 1005, 1006, 1012, 1013, 1014, 1015, 1016, 2999, 5000, u16::MAX] {
                assert!(!CloseCode::from(code).is_allowed(), "{code}");
            }
        }

        #[test]
        fn test_u16_conversion() {
            for code in [1000u16, 1004, 1005, 1011, 1015, 2500, 3001, 4001, 42] {
                assert_eq!(u16::from(CloseCode::from(code)), code);
            }
            assert_eq!(CloseCode::from(1009), CloseCode::Size);
            assert_eq!(CloseCode::from(4321), CloseCode::Library(4321));
        }
    }

    mod reason_tests {
        use super::*;

        #[test]
        fn test_empty_payload_has_no_code() {
            assert_eq!(CloseReason::decode(&[]).unwrap(), None);
            assert_eq!(CloseReason::reported_code(None), CloseCode::Normal);
        }

        #[test]
        fn test_one_byte_payload_is_rejected() {
            assert_eq!(
                CloseReason::decode(&[0x03]).unwrap_err(),
                ProtocolError::InvalidClosePayload
            );
        }

        #[test]
        fn test_round_trip() {
            let reason = CloseReason::new(CloseCode::Normal, Some("bye")).unwrap();
            let payload = CloseReason::encode(Some(&reason));
            assert_eq!(&payload[..], b"\x03\xe8bye");

            let decoded = CloseReason::decode(&payload).unwrap().unwrap();
            assert_eq!(decoded, reason);
            assert_eq!(decoded.reason(), Some("bye"));
        }

        #[test]
        fn test_code_without_reason() {
            let decoded = CloseReason::decode(&4000u16.to_be_bytes()).unwrap().unwrap();
            assert_eq!(decoded.code(), CloseCode::Library(4000));
            assert_eq!(decoded.reason(), None);
        }

        #[test]
        fn test_reserved_codes_are_rejected() {
            assert_eq!(
                CloseReason::new(CloseCode::Status, None).unwrap_err(),
                ProtocolError::InvalidCloseCode(1005)
            );
            assert_eq!(
                CloseReason::decode(&1005u16.to_be_bytes()).unwrap_err(),
                ProtocolError::InvalidCloseCode(1005)
            );
            assert_eq!(
                CloseReason::decode(&2000u16.to_be_bytes()).unwrap_err(),
                ProtocolError::InvalidCloseCode(2000)
            );
        }

        #[test]
        fn test_invalid_reason_utf8() {
            assert_eq!(
                CloseReason::decode(b"\x03\xe8\xff\xfe").unwrap_err(),
                ProtocolError::InvalidUtf8
            );
        }

        #[test]
        fn test_reason_length_limit() {
            let longest = "a".repeat(MAX_REASON_LEN);
            assert!(CloseReason::new(CloseCode::Away, Some(&longest)).is_ok());

            let too_long = "a".repeat(MAX_REASON_LEN + 1);
            assert_eq!(
                CloseReason::new(CloseCode::Away, Some(&too_long)).unwrap_err(),
                ProtocolError::InvalidClosePayload
            );
        }

        #[test]
        fn test_abnormal_is_never_encoded() {
            let abnormal = CloseReason::abnormal();
            assert_eq!(abnormal.code(), CloseCode::Abnormal);
            assert!(CloseReason::encode(Some(&abnormal)).is_empty());
            assert!(CloseReason::encode(None).is_empty());
        }
    }

    mod negotiator_tests {
        use super::*;

        #[test]
        fn test_peer_initiated_close_is_echoed_once() {
            let mut negotiator = CloseNegotiator::default();
            let reason = CloseReason::new(CloseCode::Away, Some("shutdown")).unwrap();

            let echo = negotiator.on_peer_close(Some(&reason)).unwrap();
            assert_eq!(echo.opcode(), OpCode::Close);
            assert_eq!(CloseReason::decode(echo.payload()).unwrap(), Some(reason));
            assert!(negotiator.is_closed());

            assert!(negotiator.initiate(None).is_none());
        }

        #[test]
        fn test_local_close_is_not_echoed() {
            let mut negotiator = CloseNegotiator::default();

            assert!(negotiator.initiate(None).is_some());
            assert!(negotiator.is_sent());
            assert!(!negotiator.is_closed());

            assert!(negotiator.on_peer_close(None).is_none());
            assert!(negotiator.is_received());
            assert!(negotiator.is_closed());
        }

        #[test]
        fn test_fail_uses_error_code() {
            let mut negotiator = CloseNegotiator::default();
            let frame = negotiator.fail(&ProtocolError::InvalidUtf8).unwrap();
            let reason = CloseReason::decode(frame.payload()).unwrap().unwrap();
            assert_eq!(reason.code(), CloseCode::Invalid);

            assert!(negotiator.fail(&ProtocolError::FrameTooLarge).is_none());
        }

        #[test]
        fn test_abnormal_closes_both_ways() {
            let mut negotiator = CloseNegotiator::default();
            let reason = negotiator.abnormal();
            assert_eq!(reason.code(), CloseCode::Abnormal);
            assert!(negotiator.is_closed());
            assert!(negotiator.initiate(None).is_none());
        }
    }
}
