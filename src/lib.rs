//! # wsengine
//! A sans-io implementation of the WebSocket wire protocol (RFC 6455).
//!
//! The crate turns a raw, possibly fragmented byte stream into logical WebSocket messages and
//! turns outgoing frames back into bytes. It does no I/O of its own: bytes are handed to it in
//! whatever chunks the transport produces, and the encoded output is written into caller-owned
//! buffers.
//!
//! The pipeline, leaves first:
//!
//! - [`frame`]: the [`Frame`] data model and [`OpCode`]s, validated at construction.
//! - [`codec`]: an incremental [`codec::Decoder`] and a role-aware [`codec::Encoder`], usable
//!   directly or through `tokio_util::codec::Framed`.
//! - [`message`]: a [`message::Reassembler`] that groups frames into messages and validates text
//!   across fragment boundaries, delivering either whole messages or per-fragment pieces.
//! - [`close`]: close codes, close payload parsing and the close handshake bookkeeping.
//! - [`handshake`]: the HTTP opening handshake for both the server and the client side.
//!
//! On top of those, [`Connection`] wires a whole endpoint together (answering pings, echoing
//! closes, failing the connection on protocol errors) and [`WebSocketStream`] drives a
//! [`Connection`] over any `AsyncRead + AsyncWrite` transport.
//!
//! # Features
//!
//! - `logging` (default): debug logging of frame processing and handshake decisions through the
//!   `log` crate.
//! - `simd`: validates UTF-8 with `simdutf8`.
//!
//! # Example
//! ```rust
//! use bytes::BytesMut;
//! use wsengine::{Connection, Frame, Message, Options, Role};
//!
//! # fn main() -> wsengine::Result<()> {
//! let mut client = Connection::new(Role::Client, Options::default());
//! let mut server = Connection::new(Role::Server, Options::default());
//!
//! let mut wire = BytesMut::new();
//! client.send(Frame::text("hello"), &mut wire)?;
//!
//! match server.receive(&mut wire)? {
//!     Some(Message::Text(text)) => assert_eq!(text, "hello"),
//!     other => panic!("unexpected {other:?}"),
//! }
//! # Ok(())
//! # }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod close;
pub mod codec;
pub mod frame;
pub mod handshake;
pub mod message;

mod connection;
mod mask;
mod options;
mod stream;
mod utf8;

use thiserror::Error;

pub use close::{CloseCode, CloseReason};
pub use connection::Connection;
pub use frame::{Frame, OpCode};
pub use handshake::HandshakeError;
pub use message::{Delivery, Message};
pub use options::{Options, Role, MAX_PAYLOAD_READ, MAX_READ_BUFFER};
pub use stream::WebSocketStream;

/// A result type for WebSocket operations, using `WebSocketError` as the error type.
pub type Result<T> = std::result::Result<T, WebSocketError>;

/// Violations of RFC 6455 detected while decoding or reassembling the peer's frames.
///
/// Every protocol error is fatal to the connection it was raised on: the endpoint sends a
/// Close frame carrying [`ProtocolError::close_code`] and then drops the transport. They are
/// never retried.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolError {
    /// The frame header carries one of the reserved opcodes (0x3-0x7, 0xB-0xF).
    #[error("Unknown opcode (byte={0:#x})")]
    UnknownOpcode(u8),

    /// An RSV bit is set although no extension giving it a meaning was negotiated.
    #[error("Reserved bits are not zero")]
    ReservedBitsSet,

    /// A Close, Ping or Pong frame announced a payload longer than 125 bytes.
    #[error("Control frame payload exceeds 125 bytes")]
    ControlFrameTooLarge,

    /// The frame (or the message being reassembled) is larger than this endpoint accepts,
    /// or the 64-bit length has its most significant bit set.
    #[error("Frame too large")]
    FrameTooLarge,

    /// A continuation frame arrived while no fragmented message was in progress.
    #[error("Unexpected continuation frame")]
    UnexpectedContinuation,

    /// A new Text or Binary frame arrived before the previous fragmented message finished.
    #[error("Unexpected data frame while a fragmented message is in progress")]
    UnexpectedDataFrame,

    /// A text message or a close reason is not valid UTF-8.
    #[error("Invalid UTF-8")]
    InvalidUtf8,

    /// A close payload of exactly one byte, or a close reason longer than 123 bytes.
    #[error("Invalid close frame payload")]
    InvalidClosePayload,

    /// The close code is outside the ranges an endpoint may put on the wire.
    #[error("Invalid close code {0}")]
    InvalidCloseCode(u16),

    /// A control frame arrived with the FIN bit cleared.
    #[error("Control frame must not be fragmented")]
    FragmentedControlFrame,
}

impl ProtocolError {
    /// The close code to send to the peer before failing the connection.
    pub fn close_code(&self) -> CloseCode {
        match self {
            Self::InvalidUtf8 => CloseCode::Invalid,
            Self::FrameTooLarge => CloseCode::Size,
            _ => CloseCode::Protocol,
        }
    }
}

/// Represents errors that can occur during WebSocket operations.
#[derive(Error, Debug)]
pub enum WebSocketError {
    /// The peer violated the framing protocol. See [`ProtocolError`].
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The opening handshake was malformed. The transport should answer with a non-101 status.
    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    /// Returned when attempting to perform operations on a closed WebSocket connection.
    #[error("Connection is closed")]
    ConnectionClosed,

    /// Wraps standard I/O errors coming from the transport driven by [`WebSocketStream`].
    #[error(transparent)]
    IoError(#[from] std::io::Error),
}

impl WebSocketError {
    /// Returns the protocol violation behind this error, if any.
    pub fn as_protocol(&self) -> Option<ProtocolError> {
        match self {
            Self::Protocol(err) => Some(*err),
            _ => None,
        }
    }
}
