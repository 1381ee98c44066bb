//! # Frame
//!
//! The `frame` module implements WebSocket frames as defined in [RFC 6455 Section 5.2](https://datatracker.ietf.org/doc/html/rfc6455#section-5.2).
//! Each frame is one atomic unit on the wire, carrying protocol metadata and a payload.
//!
//! ### Frame Binary Format
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |         (16 or 64 bits)       |
//! |N|V|V|V|       |S|             |                               |
//! | |1|2|3|       |K|             |                               |
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |        Extended payload length continued, if payload len == 127|
//! +---------------------------------------------------------------+
//! |                               |   Masking-key, if MASK set to 1|
//! +-------------------------------+-------------------------------+
//! |     Masking-key (continued)       |          Payload Data      |
//! +-----------------------------------+ - - - - - - - - - - - - - -+
//! :                     Payload Data continued ...                :
//! +---------------------------------------------------------------+
//! ```
//!
//! Frames come in two categories:
//!
//! - **Data Frames**: `OpCode::Text`, `OpCode::Binary` and `OpCode::Continuation`.
//! - **Control Frames**: `OpCode::Close`, `OpCode::Ping` and `OpCode::Pong`. They are never
//!   fragmented and carry at most 125 bytes of payload.
//!
//! A [`Frame`] checks these rules when it is built, so an illegal control frame never reaches
//! the encoder:
//!
//! ```rust
//! use wsengine::{Frame, OpCode, ProtocolError};
//!
//! let text = Frame::text("Hello, WebSocket!");
//! assert!(text.fin());
//!
//! let first = Frame::new(false, OpCode::Binary, vec![1u8, 2, 3]).unwrap();
//! assert!(!first.fin());
//!
//! assert_eq!(
//!     Frame::ping(vec![0u8; 126]).unwrap_err(),
//!     ProtocolError::ControlFrameTooLarge
//! );
//! ```
use bytes::Bytes;

use crate::{close::CloseReason, ProtocolError};

/// Largest payload a control frame may carry.
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// Largest frame header: 2 bytes, 8 bytes of extended length and a 4-byte masking key.
pub(crate) const MAX_HEAD_SIZE: usize = 14;

/// WebSocket operation code (OpCode) that determines the semantic meaning and handling of a frame.
///
/// The numeric values for each OpCode are defined in [RFC 6455, Section 11.8](https://datatracker.ietf.org/doc/html/rfc6455#section-11.8):
/// - Continuation = 0x0
/// - Text = 0x1
/// - Binary = 0x2
/// - Close = 0x8
/// - Ping = 0x9
/// - Pong = 0xA
///
/// The ranges 0x3-0x7 and 0xB-0xF are reserved and rejected when decoding.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum OpCode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl OpCode {
    /// Returns `true` if the `OpCode` represents a control frame (`Close`, `Ping`, or `Pong`).
    ///
    /// Control frames cannot be fragmented, carry at most 125 bytes and may be interleaved
    /// between the fragments of a data message.
    pub fn is_control(&self) -> bool {
        matches!(*self, OpCode::Close | OpCode::Ping | OpCode::Pong)
    }

    /// Returns `true` for `Text` and `Binary`, the opcodes that start a message.
    pub fn is_data(&self) -> bool {
        matches!(*self, OpCode::Text | OpCode::Binary)
    }
}

impl TryFrom<u8> for OpCode {
    type Error = ProtocolError;

    /// Interprets the low nibble of the first header byte.
    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x0 => Ok(Self::Continuation),
            0x1 => Ok(Self::Text),
            0x2 => Ok(Self::Binary),
            0x8 => Ok(Self::Close),
            0x9 => Ok(Self::Ping),
            0xA => Ok(Self::Pong),
            _ => Err(ProtocolError::UnknownOpcode(value)),
        }
    }
}

impl From<OpCode> for u8 {
    fn from(val: OpCode) -> Self {
        match val {
            OpCode::Continuation => 0x0,
            OpCode::Text => 0x1,
            OpCode::Binary => 0x2,
            OpCode::Close => 0x8,
            OpCode::Ping => 0x9,
            OpCode::Pong => 0xA,
        }
    }
}

impl std::fmt::Display for OpCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Continuation => "continuation",
            Self::Text => "text",
            Self::Binary => "binary",
            Self::Close => "close",
            Self::Ping => "ping",
            Self::Pong => "pong",
        };
        f.write_str(name)
    }
}

/// A single WebSocket frame.
///
/// A `Frame` is immutable once built. The payload is always held unmasked; the masking key, when
/// present, is kept as metadata. Frames decoded from a client carry the key they arrived with,
/// and the [`Encoder`](crate::codec::Encoder) masks client-originated frames on the way out.
///
/// # Fields
/// - `fin`: Final fragment flag. When `true`, this frame completes a message.
/// - `rsv1`, `rsv2`, `rsv3`: Extension bits, zero unless an extension defines them.
/// - `opcode`: The frame type.
/// - `mask`: Optional 32-bit masking key.
/// - `payload`: The application data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    fin: bool,
    rsv1: bool,
    rsv2: bool,
    rsv3: bool,
    opcode: OpCode,
    mask: Option<[u8; 4]>,
    payload: Bytes,
}

impl Frame {
    /// Creates a new frame, rejecting combinations RFC 6455 forbids.
    ///
    /// # Errors
    /// - [`ProtocolError::FragmentedControlFrame`] for a control opcode with `fin == false`.
    /// - [`ProtocolError::ControlFrameTooLarge`] for a control payload above 125 bytes.
    pub fn new(fin: bool, opcode: OpCode, payload: impl Into<Bytes>) -> Result<Self, ProtocolError> {
        let payload = payload.into();
        if opcode.is_control() {
            if !fin {
                return Err(ProtocolError::FragmentedControlFrame);
            }
            if payload.len() > MAX_CONTROL_PAYLOAD {
                return Err(ProtocolError::ControlFrameTooLarge);
            }
        }

        Ok(Self::from_parts(fin, opcode, None, payload))
    }

    /// Builds a frame whose header has already been validated by the decoder.
    pub(crate) fn from_parts(
        fin: bool,
        opcode: OpCode,
        mask: Option<[u8; 4]>,
        payload: Bytes,
    ) -> Self {
        Self {
            fin,
            rsv1: false,
            rsv2: false,
            rsv3: false,
            opcode,
            mask,
            payload,
        }
    }

    /// A final text frame. The payload is expected to be UTF-8.
    pub fn text(payload: impl Into<Bytes>) -> Self {
        Self::from_parts(true, OpCode::Text, None, payload.into())
    }

    /// A final binary frame.
    pub fn binary(payload: impl Into<Bytes>) -> Self {
        Self::from_parts(true, OpCode::Binary, None, payload.into())
    }

    /// A continuation frame closing (`fin == true`) or extending a fragmented message.
    pub fn continuation(fin: bool, payload: impl Into<Bytes>) -> Self {
        Self::from_parts(fin, OpCode::Continuation, None, payload.into())
    }

    /// A ping frame.
    pub fn ping(payload: impl Into<Bytes>) -> Result<Self, ProtocolError> {
        Self::new(true, OpCode::Ping, payload)
    }

    /// A pong frame, usually echoing the payload of a ping.
    pub fn pong(payload: impl Into<Bytes>) -> Result<Self, ProtocolError> {
        Self::new(true, OpCode::Pong, payload)
    }

    /// A close frame. `None` produces an empty payload ("no status code").
    ///
    /// [`CloseReason`] already enforces the 125-byte control limit, so this cannot fail.
    pub fn close(reason: Option<&CloseReason>) -> Self {
        Self::from_parts(true, OpCode::Close, None, CloseReason::encode(reason))
    }

    /// Returns the same frame carrying the given masking key.
    ///
    /// Only meaningful for client-originated frames; a server-role encoder ignores it.
    pub fn with_mask(self, mask: [u8; 4]) -> Self {
        Self {
            mask: Some(mask),
            ..self
        }
    }

    /// Returns the same frame with the given RSV bits.
    ///
    /// Setting a bit that the peer did not negotiate makes the peer fail the connection.
    pub fn with_rsv(self, rsv1: bool, rsv2: bool, rsv3: bool) -> Self {
        Self {
            rsv1,
            rsv2,
            rsv3,
            ..self
        }
    }

    /// Whether this frame completes a message.
    #[inline]
    pub fn fin(&self) -> bool {
        self.fin
    }

    #[inline]
    pub fn opcode(&self) -> OpCode {
        self.opcode
    }

    #[inline]
    pub fn rsv1(&self) -> bool {
        self.rsv1
    }

    #[inline]
    pub fn rsv2(&self) -> bool {
        self.rsv2
    }

    #[inline]
    pub fn rsv3(&self) -> bool {
        self.rsv3
    }

    /// The masking key this frame was received with (or should be sent with).
    #[inline]
    pub fn mask(&self) -> Option<[u8; 4]> {
        self.mask
    }

    /// The unmasked payload.
    #[inline]
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Consumes the frame, returning its payload.
    #[inline]
    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    #[inline]
    pub fn is_control(&self) -> bool {
        self.opcode.is_control()
    }

    /// Checks if the whole payload is valid UTF-8 on its own.
    #[inline]
    pub fn is_utf8(&self) -> bool {
        std::str::from_utf8(&self.payload).is_ok()
    }

    /// The RSV bits packed the way they sit in the first header byte (`0b0111_0000`).
    #[inline]
    pub(crate) fn rsv_bits(&self) -> u8 {
        (self.rsv1 as u8) << 6 | (self.rsv2 as u8) << 5 | (self.rsv3 as u8) << 4
    }

    pub(crate) fn set_rsv_bits(&mut self, bits: u8) {
        self.rsv1 = bits & 0b0100_0000 != 0;
        self.rsv2 = bits & 0b0010_0000 != 0;
        self.rsv3 = bits & 0b0001_0000 != 0;
    }

    /// Writes the frame header into `head` and returns how many bytes were used.
    ///
    /// The length uses the shortest legal form. `mask` is the key the encoder decided to use,
    /// which is not necessarily `self.mask`.
    ///
    /// # Panics
    /// Panics if `head` is shorter than [`MAX_HEAD_SIZE`].
    pub(crate) fn fmt_head(&self, mask: Option<[u8; 4]>, head: &mut [u8]) -> usize {
        head[0] = (self.fin as u8) << 7 | self.rsv_bits() | u8::from(self.opcode);

        let len = self.payload.len();
        let size = if len <= MAX_CONTROL_PAYLOAD {
            head[1] = len as u8;
            2
        } else if len <= u16::MAX as usize {
            head[1] = 126;
            head[2..4].copy_from_slice(&(len as u16).to_be_bytes());
            4
        } else {
            head[1] = 127;
            head[2..10].copy_from_slice(&(len as u64).to_be_bytes());
            10
        };

        if let Some(mask) = mask {
            head[1] |= 0x80;
            head[size..size + 4].copy_from_slice(&mask);
            size + 4
        } else {
            size
        }
    }
}
