//! # Codec
//!
//! Incremental decoding and role-aware encoding of WebSocket frames.
//!
//! The [`Decoder`] is a resumable state machine: it consumes whatever bytes are available,
//! keeps partial headers and payloads in its own scratch space and returns `Ok(None)` until a
//! whole frame has arrived. Bytes it consumed are never handed back, so the caller may feed it
//! chunks of any size, down to a single byte.
//!
//! Both halves implement the `tokio_util::codec` traits and can be combined in a [`Codec`] for
//! use with `tokio_util::codec::Framed`.
//!
//! ```rust
//! use bytes::BytesMut;
//! use tokio_util::codec::{Decoder as _, Encoder as _};
//! use wsengine::codec::{Decoder, Encoder};
//! use wsengine::{Frame, OpCode, Role};
//!
//! let mut wire = BytesMut::new();
//! Encoder::new(Role::Client)
//!     .encode(Frame::text("hi"), &mut wire)
//!     .unwrap();
//!
//! let mut decoder = Decoder::new(1024, 0);
//! let frame = decoder.decode(&mut wire).unwrap().unwrap();
//! assert_eq!(frame.opcode(), OpCode::Text);
//! assert_eq!(&frame.payload()[..], b"hi");
//! assert!(frame.mask().is_some());
//! ```
use bytes::{Buf, BytesMut};
use tokio_util::codec;

use crate::{
    frame::{Frame, MAX_CONTROL_PAYLOAD, MAX_HEAD_SIZE},
    mask::{apply_mask, random_key},
    options::Settings,
    OpCode, Options, ProtocolError, Role, WebSocketError,
};

/// Where the decoder is within the current frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParserState {
    /// Waiting for the two fixed header bytes.
    FrameStart,
    /// Waiting for the 16 or 64-bit extended length, if the length code announced one.
    Length,
    /// Waiting for the masking key, if the frame is masked.
    MaskingKey,
    /// Collecting payload bytes.
    Payload,
}

/// Everything known about the frame being decoded.
#[derive(Debug)]
struct Scratch {
    fin: bool,
    rsv: u8,
    opcode: OpCode,
    masked: bool,
    length_code: u8,
    length: usize,
    mask: Option<[u8; 4]>,
    payload: BytesMut,
}

impl Default for Scratch {
    fn default() -> Self {
        Self {
            fin: false,
            rsv: 0,
            opcode: OpCode::Continuation,
            masked: false,
            length_code: 0,
            length: 0,
            mask: None,
            payload: BytesMut::new(),
        }
    }
}

/// A combined codec that provides both encoding and decoding functionality for WebSocket frames.
///
/// This codec can be used with Tokio's framed streams to handle WebSocket protocol
/// frame encoding and decoding.
pub struct Codec {
    decoder: Decoder,
    encoder: Encoder,
}

impl Codec {
    /// Creates the codec of an endpoint taking `role`, with the limits of `options`.
    pub fn new(role: Role, options: &Options) -> Self {
        Self::from_settings(role, &options.settings())
    }

    pub(crate) fn from_settings(role: Role, settings: &Settings) -> Self {
        Self {
            decoder: Decoder::new(settings.max_payload_read, settings.reserved_bits),
            encoder: Encoder::new(role),
        }
    }
}

impl From<(Decoder, Encoder)> for Codec {
    fn from((decoder, encoder): (Decoder, Encoder)) -> Self {
        Self { decoder, encoder }
    }
}

impl codec::Decoder for Codec {
    type Item = <Decoder as codec::Decoder>::Item;
    type Error = <Decoder as codec::Decoder>::Error;

    #[inline]
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        self.decoder.decode(src)
    }
}

impl codec::Encoder<Frame> for Codec {
    type Error = <Encoder as codec::Encoder<Frame>>::Error;

    #[inline]
    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        self.encoder.encode(item, dst)
    }
}

/// A decoder for WebSocket frames.
///
/// `Decoder` tracks the maximum allowed payload size, the RSV bits the peer may use and how far
/// into the current frame it is. After an error it starts over at the next frame boundary, but
/// callers are expected to fail the connection instead of feeding it more bytes.
pub struct Decoder {
    state: ParserState,
    scratch: Scratch,
    /// Maximum allowed size for a frame payload.
    max_payload_read: usize,
    /// RSV bits allowed by a negotiated extension, as laid out in the first header byte.
    reserved_bits: u8,
}

impl Decoder {
    /// Creates a new `Decoder`.
    ///
    /// # Parameters
    /// - `max_payload_read`: The maximum allowed payload size of a single frame, in bytes.
    /// - `reserved_bits`: The RSV bits the peer may set (`0b0RRR_0000`), zero when no extension
    ///   was negotiated.
    pub fn new(max_payload_read: usize, reserved_bits: u8) -> Self {
        Self {
            state: ParserState::FrameStart,
            scratch: Scratch::default(),
            max_payload_read,
            reserved_bits: reserved_bits & 0b0111_0000,
        }
    }

    fn reset(&mut self) {
        self.state = ParserState::FrameStart;
        self.scratch = Scratch::default();
    }

    fn step(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
        loop {
            match self.state {
                ParserState::FrameStart => {
                    if src.remaining() < 2 {
                        return Ok(None);
                    }

                    let fin = src[0] & 0b1000_0000 != 0;
                    let rsv = src[0] & 0b0111_0000;
                    let opcode = OpCode::try_from(src[0] & 0b0000_1111)?;

                    if rsv & !self.reserved_bits != 0 {
                        return Err(ProtocolError::ReservedBitsSet);
                    }
                    if opcode.is_control() && !fin {
                        return Err(ProtocolError::FragmentedControlFrame);
                    }

                    let masked = src[1] & 0b1000_0000 != 0;
                    let length_code = src[1] & 0x7F;

                    // 126 and 127 announce an extended length, both above the control limit
                    if opcode.is_control() && usize::from(length_code) > MAX_CONTROL_PAYLOAD {
                        return Err(ProtocolError::ControlFrameTooLarge);
                    }

                    src.advance(2);
                    self.scratch = Scratch {
                        fin,
                        rsv,
                        opcode,
                        masked,
                        length_code,
                        ..Default::default()
                    };
                    self.state = ParserState::Length;
                }
                ParserState::Length => {
                    let length = match self.scratch.length_code {
                        126 => {
                            if src.remaining() < 2 {
                                return Ok(None);
                            }
                            u64::from(src.get_u16())
                        }
                        127 => {
                            if src.remaining() < 8 {
                                return Ok(None);
                            }
                            let length = src.get_u64();
                            if length & (1 << 63) != 0 {
                                return Err(ProtocolError::FrameTooLarge);
                            }
                            length
                        }
                        code => u64::from(code),
                    };

                    let length =
                        usize::try_from(length).map_err(|_| ProtocolError::FrameTooLarge)?;
                    if length > self.max_payload_read {
                        #[cfg(feature = "logging")]
                        log::debug!(
                            "frame of {length} bytes exceeds the limit of {}",
                            self.max_payload_read
                        );
                        return Err(ProtocolError::FrameTooLarge);
                    }

                    self.scratch.length = length;
                    self.state = ParserState::MaskingKey;
                }
                ParserState::MaskingKey => {
                    if self.scratch.masked {
                        if src.remaining() < 4 {
                            return Ok(None);
                        }
                        self.scratch.mask = Some(src.get_u32().to_be_bytes());
                    }

                    self.state = ParserState::Payload;
                }
                ParserState::Payload => {
                    let missing = self.scratch.length - self.scratch.payload.len();

                    if self.scratch.payload.is_empty() && src.remaining() >= missing {
                        // the whole payload is already buffered, no copy needed
                        self.scratch.payload = src.split_to(missing);
                    } else {
                        let take = missing.min(src.remaining());
                        if self.scratch.payload.capacity() == 0 {
                            self.scratch.payload.reserve(self.scratch.length);
                        }
                        self.scratch.payload.extend_from_slice(&src[..take]);
                        src.advance(take);

                        if take < missing {
                            return Ok(None);
                        }
                    }

                    let scratch = std::mem::take(&mut self.scratch);
                    self.state = ParserState::FrameStart;

                    let mut payload = scratch.payload;
                    if let Some(key) = scratch.mask {
                        apply_mask(&mut payload, key);
                    }

                    let mut frame =
                        Frame::from_parts(scratch.fin, scratch.opcode, scratch.mask, payload.freeze());
                    frame.set_rsv_bits(scratch.rsv);

                    #[cfg(feature = "logging")]
                    log::trace!(
                        "decoded {} frame (fin={}, {} bytes)",
                        frame.opcode(),
                        frame.fin(),
                        frame.payload().len()
                    );

                    return Ok(Some(frame));
                }
            }
        }
    }
}

impl codec::Decoder for Decoder {
    type Item = Frame;
    type Error = WebSocketError;

    /// Decodes WebSocket frames from a `BytesMut` buffer.
    ///
    /// # Returns
    /// - `Ok(Some(Frame))`: A fully decoded, unmasked `Frame`.
    /// - `Ok(None)`: More data is needed to complete the frame. Everything in `src` has been
    ///   consumed or is still needed for the next step.
    /// - `Err(WebSocketError::Protocol)`: The frame violates RFC 6455.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.step(src) {
            Ok(frame) => Ok(frame),
            Err(err) => {
                #[cfg(feature = "logging")]
                log::debug!("frame decoding failed: {err}");

                self.reset();
                Err(err.into())
            }
        }
    }
}

/// WebSocket frame encoder for serializing `Frame` instances into a buffer.
///
/// A client masks every frame it sends, using the key carried by the frame or a fresh random
/// one. A server never masks.
pub struct Encoder {
    role: Role,
}

impl Encoder {
    pub fn new(role: Role) -> Self {
        Self { role }
    }
}

impl codec::Encoder<Frame> for Encoder {
    type Error = WebSocketError;

    /// Encodes a `Frame` into the provided buffer.
    ///
    /// This method formats the frame's header and appends the (masked, for a client) payload to
    /// the destination buffer.
    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let mask = match self.role {
            Role::Client => Some(frame.mask().unwrap_or_else(random_key)),
            Role::Server => None,
        };

        let mut header = [0; MAX_HEAD_SIZE];
        let size = frame.fmt_head(mask, &mut header[..]);

        dst.reserve(size + frame.payload().len());
        dst.extend_from_slice(&header[..size]);

        let start = dst.len();
        dst.extend_from_slice(frame.payload());
        if let Some(key) = mask {
            apply_mask(&mut dst[start..], key);
        }

        Ok(())
    }
}
