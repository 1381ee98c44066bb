use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder as _, Encoder as _};

use crate::{
    close::{CloseNegotiator, CloseReason},
    codec::Codec,
    message::{self, Message, Reassembler},
    options::Settings,
    Frame, OpCode, Options, ProtocolError, Result, Role, WebSocketError,
};

/// One WebSocket endpoint, without any I/O.
///
/// `Connection` ties the frame codec, the message reassembler and the closing handshake
/// together and takes care of what the protocol obliges an endpoint to do on its own:
///
/// - Pings are answered with a Pong carrying the same payload.
/// - A Close frame from the peer is echoed, unless we already sent one.
/// - A protocol violation queues a Close frame with the matching status code (1002, 1007 or
///   1009) and stops the connection from accepting more input.
///
/// Those frames are queued and written out, ahead of anything else, by the next call to
/// [`Connection::send`], [`Connection::close`] or [`Connection::write_pending`].
///
/// Received bytes go through [`Connection::receive`], which consumes what it decodes from the
/// buffer and leaves the rest for later calls.
pub struct Connection {
    codec: Codec,
    endpoint: Endpoint,
}

impl Connection {
    pub fn new(role: Role, options: Options) -> Self {
        let settings = options.settings();
        Self {
            codec: Codec::from_settings(role, &settings),
            endpoint: Endpoint::new(role, &settings),
        }
    }

    #[inline]
    pub fn role(&self) -> Role {
        self.endpoint.role()
    }

    /// Decodes bytes from `src` until a message is complete.
    ///
    /// Returns `Ok(None)` once `src` holds no complete message; the partial frame stays in the
    /// decoder and decoding resumes with the next call.
    ///
    /// # Errors
    /// - [`WebSocketError::Protocol`] when the peer violated the protocol. A Close frame was
    ///   queued and the connection is failed.
    /// - [`WebSocketError::ConnectionClosed`] after the peer's Close frame or a failure.
    pub fn receive(&mut self, src: &mut BytesMut) -> Result<Option<Message>> {
        loop {
            self.endpoint.check_readable()?;

            let frame = match self.codec.decode(src) {
                Ok(Some(frame)) => frame,
                Ok(None) => return Ok(None),
                Err(err) => return Err(self.endpoint.on_error(err)),
            };

            if let Some(message) = self.endpoint.on_frame(frame)? {
                return Ok(Some(message));
            }
        }
    }

    /// Encodes `frame` into `dst`, after any frame the protocol required us to send.
    ///
    /// Sending a Close frame starts the closing handshake, the same as [`Connection::close`].
    ///
    /// # Errors
    /// [`WebSocketError::ConnectionClosed`] once our Close frame has been sent.
    pub fn send(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<()> {
        self.write_pending(dst)?;
        if let Some(frame) = self.endpoint.prepare(frame)? {
            self.codec.encode(frame, dst)?;
        }
        Ok(())
    }

    /// Splits a message into frames of at most `size` payload bytes and encodes them into `dst`.
    pub fn send_fragmented(
        &mut self,
        opcode: OpCode,
        payload: impl Into<Bytes>,
        size: usize,
        dst: &mut BytesMut,
    ) -> Result<()> {
        for frame in message::fragment(opcode, payload, size)? {
            self.send(frame, dst)?;
        }
        Ok(())
    }

    /// Starts the closing handshake. Does nothing if our Close frame was already sent.
    ///
    /// Once the peer's answer arrives through [`Connection::receive`], [`Connection::is_closed`]
    /// returns `true` and the transport can be shut down.
    pub fn close(&mut self, reason: Option<&CloseReason>, dst: &mut BytesMut) -> Result<()> {
        self.endpoint.queue_close(reason);
        self.write_pending(dst)
    }

    /// Encodes every queued control frame into `dst`.
    pub fn write_pending(&mut self, dst: &mut BytesMut) -> Result<()> {
        while let Some(frame) = self.endpoint.next_pending() {
            self.codec.encode(frame, dst)?;
        }
        Ok(())
    }

    /// Whether control frames are waiting to be written.
    #[inline]
    pub fn has_pending(&self) -> bool {
        self.endpoint.has_pending()
    }

    /// Whether the connection is over: both Close frames were exchanged, or a protocol error
    /// failed it. The transport should be closed once pending frames are written.
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.endpoint.is_closed()
    }

    /// Records that the transport went away, or timed out, without a closing handshake, and
    /// returns the 1006 reason to report to the application.
    pub fn abnormal_close(&mut self) -> CloseReason {
        self.endpoint.abnormal_close()
    }
}

/// The frame-level half of a [`Connection`]: reassembly, the closing handshake and the queue of
/// obligated frames. Drivers that own their own codec, like `WebSocketStream`, use it directly.
pub(crate) struct Endpoint {
    role: Role,
    reassembler: Reassembler,
    close: CloseNegotiator,
    /// Frames the protocol requires us to send (pongs, close echoes, failure closes).
    obligated_sends: VecDeque<Frame>,
    /// Set once a protocol error failed the connection.
    failed: bool,
}

impl Endpoint {
    pub(crate) fn new(role: Role, settings: &Settings) -> Self {
        Self {
            role,
            reassembler: Reassembler::new(settings.delivery, settings.max_read_buffer),
            close: CloseNegotiator::default(),
            obligated_sends: VecDeque::new(),
            failed: false,
        }
    }

    #[inline]
    pub(crate) fn role(&self) -> Role {
        self.role
    }

    #[inline]
    pub(crate) fn has_pending(&self) -> bool {
        !self.obligated_sends.is_empty()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.close.is_closed() || self.failed
    }

    pub(crate) fn abnormal_close(&mut self) -> CloseReason {
        #[cfg(feature = "logging")]
        log::debug!("{} connection closed abnormally", self.role);

        self.obligated_sends.clear();
        self.close.abnormal()
    }

    fn check_readable(&self) -> Result<()> {
        if self.failed || self.close.is_received() {
            Err(WebSocketError::ConnectionClosed)
        } else {
            Ok(())
        }
    }

    /// Processes one decoded frame, queueing whatever the protocol requires in response.
    pub(crate) fn on_frame(&mut self, frame: Frame) -> Result<Option<Message>> {
        self.check_readable()?;

        let message = match self.reassembler.push(frame) {
            Ok(message) => message,
            Err(err) => return Err(self.on_error(err.into())),
        };

        match &message {
            Some(Message::Ping(payload)) if !self.close.is_sent() => {
                // a valid ping payload always fits a pong
                if let Ok(pong) = Frame::pong(payload.clone()) {
                    self.obligated_sends.push_back(pong);
                }
            }
            Some(Message::Close(reason)) => {
                #[cfg(feature = "logging")]
                log::debug!(
                    "{} received close with code {}",
                    self.role,
                    CloseReason::reported_code(reason.as_ref())
                );

                if let Some(echo) = self.close.on_peer_close(reason.as_ref()) {
                    self.obligated_sends.push_back(echo);
                }
            }
            _ => {}
        }

        Ok(message)
    }

    /// Fails the connection on a protocol error, queueing the Close frame that reports it.
    pub(crate) fn on_error(&mut self, err: WebSocketError) -> WebSocketError {
        if let Some(protocol) = err.as_protocol() {
            self.fail(protocol);
        }
        err
    }

    fn fail(&mut self, err: ProtocolError) {
        #[cfg(feature = "logging")]
        log::debug!(
            "{} failing connection with code {}: {err}",
            self.role,
            err.close_code()
        );

        self.failed = true;
        if let Some(frame) = self.close.fail(&err) {
            self.obligated_sends.push_back(frame);
        }
    }

    /// Queues our Close frame behind the other obligated frames, unless one was already sent.
    pub(crate) fn queue_close(&mut self, reason: Option<&CloseReason>) {
        if let Some(frame) = self.close.initiate(reason) {
            self.obligated_sends.push_back(frame);
        }
    }

    /// Checks that `frame` may be sent, doing the close bookkeeping for Close frames.
    ///
    /// Returns `None` when a Close frame is no longer needed.
    pub(crate) fn prepare(&mut self, frame: Frame) -> Result<Option<Frame>> {
        if self.close.is_sent() {
            return Err(WebSocketError::ConnectionClosed);
        }

        if frame.opcode() == OpCode::Close {
            let reason = CloseReason::decode(frame.payload())?;
            let Some(mut close) = self.close.initiate(reason.as_ref()) else {
                return Ok(None);
            };
            if let Some(mask) = frame.mask() {
                close = close.with_mask(mask);
            }
            return Ok(Some(close));
        }

        Ok(Some(frame))
    }

    /// Takes the next frame the protocol requires us to send.
    pub(crate) fn next_pending(&mut self) -> Option<Frame> {
        self.obligated_sends.pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{close::CloseCode, message::Delivery};

    fn pair() -> (Connection, Connection) {
        (
            Connection::new(Role::Client, Options::default()),
            Connection::new(Role::Server, Options::default()),
        )
    }

    /// Decodes everything `dst` holds as seen by a fresh decoder of the other role.
    fn frames_in(dst: &mut BytesMut) -> Vec<Frame> {
        let mut codec = Codec::new(Role::Server, &Options::default());
        let mut frames = Vec::new();
        while let Some(frame) = codec.decode(dst).unwrap() {
            frames.push(frame);
        }
        frames
    }

    #[test]
    fn test_text_round_trip() {
        let (mut client, mut server) = pair();
        let mut wire = BytesMut::new();

        client.send(Frame::text("hello"), &mut wire).unwrap();
        client.send(Frame::binary(vec![1u8, 2, 3]), &mut wire).unwrap();

        assert_eq!(
            server.receive(&mut wire).unwrap(),
            Some(Message::Text("hello".to_owned()))
        );
        assert_eq!(
            server.receive(&mut wire).unwrap(),
            Some(Message::Binary(Bytes::from_static(&[1, 2, 3])))
        );
        assert_eq!(server.receive(&mut wire).unwrap(), None);
    }

    #[test]
    fn test_ping_is_answered() {
        let (mut client, mut server) = pair();
        let mut wire = BytesMut::new();

        client.send(Frame::ping("beat").unwrap(), &mut wire).unwrap();
        assert_eq!(
            server.receive(&mut wire).unwrap(),
            Some(Message::Ping(Bytes::from_static(b"beat")))
        );
        assert!(server.has_pending());

        let mut reply = BytesMut::new();
        server.write_pending(&mut reply).unwrap();
        assert_eq!(
            client.receive(&mut reply).unwrap(),
            Some(Message::Pong(Bytes::from_static(b"beat")))
        );
    }

    #[test]
    fn test_peer_close_is_echoed() {
        let (mut client, mut server) = pair();
        let mut wire = BytesMut::new();

        let reason = CloseReason::new(CloseCode::Away, Some("bye")).unwrap();
        client.close(Some(&reason), &mut wire).unwrap();
        assert!(!client.is_closed());

        assert_eq!(
            server.receive(&mut wire).unwrap(),
            Some(Message::Close(Some(reason.clone())))
        );
        assert!(server.is_closed());

        let mut reply = BytesMut::new();
        server.write_pending(&mut reply).unwrap();
        assert!(matches!(
            server.send(Frame::text("late"), &mut BytesMut::new()),
            Err(WebSocketError::ConnectionClosed)
        ));
        assert_eq!(
            client.receive(&mut reply).unwrap(),
            Some(Message::Close(Some(reason)))
        );
        assert!(client.is_closed());
        // our own close is not echoed back
        assert!(!client.has_pending());
    }

    #[test]
    fn test_close_frame_through_send() {
        let (mut client, _) = pair();
        let mut wire = BytesMut::new();

        client.send(Frame::close(None), &mut wire).unwrap();
        assert!(matches!(
            client.send(Frame::close(None), &mut wire),
            Err(WebSocketError::ConnectionClosed)
        ));
        // closing again is a no-op
        client.close(None, &mut wire).unwrap();

        let frames = frames_in(&mut wire);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].opcode(), OpCode::Close);
        assert!(frames[0].payload().is_empty());
    }

    #[test]
    fn test_protocol_error_fails_with_close_code() {
        let cases: [(&[u8], CloseCode); 3] = [
            // continuation without an opener
            (b"\x80\x00", CloseCode::Protocol),
            // invalid UTF-8
            (b"\x81\x02\xc3\x28", CloseCode::Invalid),
            // frame above the limit
            (b"\x82\x7f\x00\x00\x00\x00\x10\x00\x00\x00", CloseCode::Size),
        ];

        for (bytes, code) in cases {
            let mut server = Connection::new(Role::Server, Options::default());
            let mut wire = BytesMut::from(bytes);

            let err = server.receive(&mut wire).unwrap_err();
            assert_eq!(err.as_protocol().unwrap().close_code(), code);
            assert!(server.is_closed());

            let mut reply = BytesMut::new();
            server.write_pending(&mut reply).unwrap();
            let frames = frames_in(&mut reply);
            assert_eq!(frames.len(), 1);
            let reason = CloseReason::decode(frames[0].payload()).unwrap().unwrap();
            assert_eq!(reason.code(), code);

            assert!(matches!(
                server.receive(&mut BytesMut::from(&b"\x81\x00"[..])),
                Err(WebSocketError::ConnectionClosed)
            ));
        }
    }

    #[test]
    fn test_fragmented_send_and_streaming_receive() {
        let mut client = Connection::new(Role::Client, Options::default());
        let mut server = Connection::new(
            Role::Server,
            Options::default().with_delivery(Delivery::Streaming),
        );
        let mut wire = BytesMut::new();

        client
            .send_fragmented(OpCode::Text, "abcdef", 4, &mut wire)
            .unwrap();

        assert_eq!(
            server.receive(&mut wire).unwrap(),
            Some(Message::TextFragment {
                text: "abcd".to_owned(),
                last: false
            })
        );
        assert_eq!(
            server.receive(&mut wire).unwrap(),
            Some(Message::TextFragment {
                text: "ef".to_owned(),
                last: true
            })
        );
    }

    #[test]
    fn test_byte_at_a_time() {
        let (mut client, mut server) = pair();
        let mut wire = BytesMut::new();
        client.send(Frame::text("split me"), &mut wire).unwrap();

        let mut src = BytesMut::new();
        let mut received = None;
        for byte in wire.iter() {
            src.extend_from_slice(&[*byte]);
            if let Some(message) = server.receive(&mut src).unwrap() {
                received = Some(message);
            }
        }
        assert_eq!(received, Some(Message::Text("split me".to_owned())));
    }

    #[test]
    fn test_abnormal_close() {
        let (_, mut server) = pair();
        let reason = server.abnormal_close();
        assert_eq!(reason.code(), CloseCode::Abnormal);
        assert!(server.is_closed());
    }
}
