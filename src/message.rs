//! # Message
//!
//! Groups decoded frames into application messages.
//!
//! A data message is either a single Text/Binary frame with FIN set, or a Text/Binary frame with
//! FIN cleared followed by Continuation frames, the last of which has FIN set. Control frames may
//! arrive between the fragments of a data message and are handed out immediately.
//!
//! Text is checked for UTF-8 fragment by fragment, so an invalid sequence fails the connection as
//! soon as it arrives instead of after the whole message was buffered. A code point split between
//! two fragments is carried over to the next one.
//!
//! ```rust
//! use wsengine::message::{Delivery, Message, Reassembler};
//! use wsengine::{Frame, OpCode};
//!
//! let mut reassembler = Reassembler::new(Delivery::Whole, 1024);
//!
//! let first = Frame::new(false, OpCode::Text, "Hel").unwrap();
//! assert_eq!(reassembler.push(first).unwrap(), None);
//!
//! // a ping in the middle of a fragmented message is delivered right away
//! let ping = reassembler.push(Frame::ping("?").unwrap()).unwrap();
//! assert!(matches!(ping, Some(Message::Ping(_))));
//!
//! let last = reassembler.push(Frame::continuation(true, "lo")).unwrap();
//! assert_eq!(last, Some(Message::Text("Hello".to_owned())));
//! ```
use bytes::{Bytes, BytesMut};

use crate::{
    close::CloseReason,
    utf8::{self, Remainder},
    Frame, OpCode, ProtocolError,
};

/// How data messages are handed to the application.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Delivery {
    /// Buffer fragments and deliver one [`Message::Text`] or [`Message::Binary`] per message.
    #[default]
    Whole,
    /// Deliver every fragment as soon as it arrives, as [`Message::TextFragment`] or
    /// [`Message::BinaryFragment`].
    Streaming,
}

/// A message received from the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// A complete text message.
    Text(String),
    /// A complete binary message.
    Binary(Bytes),
    /// One fragment of a text message. A code point split across frames is delivered with the
    /// fragment that completes it.
    TextFragment { text: String, last: bool },
    /// One fragment of a binary message.
    BinaryFragment { data: Bytes, last: bool },
    Ping(Bytes),
    Pong(Bytes),
    /// The peer started or answered the closing handshake. `None` means the Close frame carried
    /// no status code.
    Close(Option<CloseReason>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MessageKind {
    Text,
    Binary,
}

/// State of the fragmented message being received, if any.
#[derive(Debug, Default)]
struct FragmentationContext {
    in_progress: Option<MessageKind>,
    utf8_remainder: Remainder,
    /// Text decoded so far, in [`Delivery::Whole`].
    text: String,
    /// Bytes received so far, in [`Delivery::Whole`].
    binary: BytesMut,
    /// Payload bytes received so far for the current message.
    size: usize,
}

/// Reassembles frames into [`Message`]s.
///
/// Follows the sans-io pattern: frames are pushed in one by one as the decoder produces them.
/// Any error leaves the reassembler ready for a new message, although protocol errors are fatal
/// to the connection anyway.
#[derive(Debug)]
pub struct Reassembler {
    delivery: Delivery,
    /// Maximum total payload of a message buffered in [`Delivery::Whole`].
    max_message_size: usize,
    context: FragmentationContext,
}

impl Reassembler {
    pub fn new(delivery: Delivery, max_message_size: usize) -> Self {
        Self {
            delivery,
            max_message_size,
            context: FragmentationContext::default(),
        }
    }

    /// Whether a fragmented data message has been started but not finished.
    #[inline]
    pub fn is_fragmented(&self) -> bool {
        self.context.in_progress.is_some()
    }

    /// Processes one decoded frame.
    ///
    /// # Returns
    /// - `Ok(Some(message))` for a control frame, a complete message or (when streaming) a
    ///   fragment.
    /// - `Ok(None)` when the frame was buffered as part of an unfinished message.
    ///
    /// # Errors
    /// - [`ProtocolError::UnexpectedDataFrame`] for a Text/Binary frame while a fragmented
    ///   message is in progress.
    /// - [`ProtocolError::UnexpectedContinuation`] for a Continuation frame with nothing to
    ///   continue.
    /// - [`ProtocolError::InvalidUtf8`] for invalid text.
    /// - [`ProtocolError::FrameTooLarge`] when a buffered message exceeds the size limit.
    /// - Close payload errors from [`CloseReason::decode`].
    pub fn push(&mut self, frame: Frame) -> Result<Option<Message>, ProtocolError> {
        let result = self.on_frame(frame);
        if result.is_err() {
            self.context = FragmentationContext::default();
        }
        result
    }

    fn on_frame(&mut self, frame: Frame) -> Result<Option<Message>, ProtocolError> {
        match frame.opcode() {
            OpCode::Ping => Ok(Some(Message::Ping(frame.into_payload()))),
            OpCode::Pong => Ok(Some(Message::Pong(frame.into_payload()))),
            OpCode::Close => {
                let reason = CloseReason::decode(frame.payload())?;
                Ok(Some(Message::Close(reason)))
            }
            OpCode::Text | OpCode::Binary => {
                if self.context.in_progress.is_some() {
                    return Err(ProtocolError::UnexpectedDataFrame);
                }

                let kind = if frame.opcode() == OpCode::Text {
                    MessageKind::Text
                } else {
                    MessageKind::Binary
                };
                if !frame.fin() {
                    #[cfg(feature = "logging")]
                    log::trace!("fragmented {} message started", frame.opcode());

                    self.context.in_progress = Some(kind);
                }

                self.on_data(kind, frame.fin(), frame.into_payload())
            }
            OpCode::Continuation => {
                let kind = self
                    .context
                    .in_progress
                    .ok_or(ProtocolError::UnexpectedContinuation)?;

                self.on_data(kind, frame.fin(), frame.into_payload())
            }
        }
    }

    fn on_data(
        &mut self,
        kind: MessageKind,
        fin: bool,
        payload: Bytes,
    ) -> Result<Option<Message>, ProtocolError> {
        let message = match self.delivery {
            Delivery::Streaming => Some(match kind {
                MessageKind::Text => Message::TextFragment {
                    text: self.decode_text(&payload, fin)?,
                    last: fin,
                },
                MessageKind::Binary => Message::BinaryFragment {
                    data: payload,
                    last: fin,
                },
            }),
            Delivery::Whole => {
                self.context.size += payload.len();
                if self.context.size > self.max_message_size {
                    #[cfg(feature = "logging")]
                    log::debug!(
                        "message of at least {} bytes exceeds the limit of {}",
                        self.context.size,
                        self.max_message_size
                    );
                    return Err(ProtocolError::FrameTooLarge);
                }

                match kind {
                    MessageKind::Text => {
                        let text = self.decode_text(&payload, fin)?;
                        self.context.text.push_str(&text);
                    }
                    // an unfragmented message needs no copy
                    MessageKind::Binary if fin && self.context.binary.is_empty() => {
                        self.context = FragmentationContext::default();
                        return Ok(Some(Message::Binary(payload)));
                    }
                    MessageKind::Binary => self.context.binary.extend_from_slice(&payload),
                }

                if fin {
                    let context = std::mem::take(&mut self.context);
                    Some(match kind {
                        MessageKind::Text => Message::Text(context.text),
                        MessageKind::Binary => Message::Binary(context.binary.freeze()),
                    })
                } else {
                    None
                }
            }
        };

        if fin {
            self.context = FragmentationContext::default();
        }

        Ok(message)
    }

    fn decode_text(&mut self, payload: &[u8], fin: bool) -> Result<String, ProtocolError> {
        let (text, remainder) = utf8::decode(&self.context.utf8_remainder, payload, fin)?;
        self.context.utf8_remainder = remainder;
        Ok(text)
    }
}

/// Splits a message into frames carrying at most `size` payload bytes each.
///
/// The first frame carries `opcode`, the following ones are continuations and only the last has
/// FIN set. An empty payload still produces one frame. Control frames are never split; they are
/// returned as a single frame, subject to the usual control frame limits.
///
/// Text is split on byte boundaries, which may cut a code point in two. The receiving side
/// reassembles it.
///
/// # Errors
/// [`ProtocolError::ControlFrameTooLarge`] for a control payload above 125 bytes.
pub fn fragment(
    opcode: OpCode,
    payload: impl Into<Bytes>,
    size: usize,
) -> Result<Vec<Frame>, ProtocolError> {
    let mut payload = payload.into();

    if opcode.is_control() {
        return Ok(vec![Frame::new(true, opcode, payload)?]);
    }

    let size = size.max(1);
    let mut frames = Vec::with_capacity(payload.len().div_ceil(size).max(1));
    let mut next = opcode;

    loop {
        let chunk = payload.split_to(size.min(payload.len()));
        let fin = payload.is_empty();
        frames.push(Frame::new(fin, next, chunk)?);

        if fin {
            break;
        }
        next = OpCode::Continuation;
    }

    Ok(frames)
}
