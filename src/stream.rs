use std::{
    pin::Pin,
    task::{ready, Context, Poll},
};

use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;

use crate::{
    close::CloseReason, codec::Codec, connection::Endpoint, message::Message, Frame, Options,
    Result, Role, WebSocketError,
};

/// Drives a WebSocket endpoint over an `AsyncRead + AsyncWrite` transport.
///
/// The transport is expected to be already upgraded: the opening handshake happens before, with
/// the types of [`crate::handshake`]. Frames are read and written through
/// `tokio_util::codec::Framed`.
///
/// Received messages come out of the [`Stream`] implementation; frames go in through the
/// [`Sink`] implementation. Pongs, close echoes and the Close frames reporting protocol errors
/// are flushed automatically before the next message is handed out. The stream ends once the
/// closing handshake completes. If the transport ends without one, a final
/// `Message::Close(Some(reason))` with code 1006 is yielded first.
///
/// ```rust
/// use futures::{SinkExt, StreamExt};
/// use wsengine::{Frame, Message, Options, Role, WebSocketStream};
///
/// # #[tokio::main]
/// # async fn main() -> wsengine::Result<()> {
/// let (client_io, server_io) = tokio::io::duplex(1024);
/// let mut client = WebSocketStream::new(client_io, Role::Client, Options::default());
/// let mut server = WebSocketStream::new(server_io, Role::Server, Options::default());
///
/// client.send(Frame::text("hello")).await?;
/// assert_eq!(server.next().await.transpose()?, Some(Message::Text("hello".to_owned())));
/// # Ok(())
/// # }
/// ```
pub struct WebSocketStream<S> {
    framed: Framed<S, Codec>,
    endpoint: Endpoint,
    /// A message or error held back until the obligated frames are flushed.
    ready: Option<Result<Message>>,
    /// Obligated frames were handed to the sink and need a flush.
    flush_sends: bool,
    /// The transport has been shut down.
    terminated: bool,
}

impl<S> WebSocketStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(io: S, role: Role, options: Options) -> Self {
        let settings = options.settings();
        Self {
            framed: Framed::new(io, Codec::from_settings(role, &settings)),
            endpoint: Endpoint::new(role, &settings),
            ready: None,
            flush_sends: false,
            terminated: false,
        }
    }

    #[inline]
    pub fn role(&self) -> Role {
        self.endpoint.role()
    }

    /// Whether the closing handshake completed or the connection failed.
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.endpoint.is_closed()
    }

    /// Sends a Close frame and flushes it. The stream keeps yielding messages until the peer
    /// answers.
    pub async fn close(&mut self, reason: Option<&CloseReason>) -> Result<()> {
        self.send(Frame::close(reason)).await
    }

    /// Reports a timeout, or any other reason to give up on the peer, as an abnormal closure
    /// and shuts the transport down without a closing handshake.
    pub async fn abort(&mut self) -> CloseReason {
        let reason = self.endpoint.abnormal_close();
        // the peer is gone, so failing to shut down cleanly changes nothing
        let _ = SinkExt::<Frame>::close(&mut self.framed).await;
        self.terminated = true;
        reason
    }

    /// Consumes the stream, returning the transport. Buffered bytes are lost.
    pub fn into_inner(self) -> S {
        self.framed.into_inner()
    }

    fn poll_flush_obligated(&mut self, cx: &mut Context<'_>) -> Poll<Result<()>> {
        while self.endpoint.has_pending() {
            ready!(SinkExt::<Frame>::poll_ready_unpin(&mut self.framed, cx))?;

            if let Some(frame) = self.endpoint.next_pending() {
                self.framed.start_send_unpin(frame)?;
                self.flush_sends = true;
            }
        }

        if self.flush_sends {
            ready!(SinkExt::<Frame>::poll_flush_unpin(&mut self.framed, cx))?;
            self.flush_sends = false;
        }

        Poll::Ready(Ok(()))
    }

    fn poll_next_message(&mut self, cx: &mut Context<'_>) -> Poll<Option<Result<Message>>> {
        loop {
            if self.terminated {
                return Poll::Ready(None);
            }

            if let Err(err) = ready!(self.poll_flush_obligated(cx)) {
                #[cfg(feature = "logging")]
                log::debug!("failed to flush control frames: {err}");

                self.terminated = true;
                self.ready = None;
                return Poll::Ready(Some(Err(err)));
            }

            if let Some(item) = self.ready.take() {
                return Poll::Ready(Some(item));
            }

            if self.endpoint.is_closed() {
                // peer and we are done; a failed shutdown is not worth reporting
                let _ = ready!(SinkExt::<Frame>::poll_close_unpin(&mut self.framed, cx));
                self.terminated = true;
                continue;
            }

            match ready!(self.framed.poll_next_unpin(cx)) {
                Some(Ok(frame)) => match self.endpoint.on_frame(frame) {
                    Ok(Some(message)) => self.ready = Some(Ok(message)),
                    Ok(None) => {}
                    Err(err) => self.ready = Some(Err(err)),
                },
                Some(Err(err)) => {
                    let err = self.endpoint.on_error(err);
                    self.ready = Some(Err(err));
                }
                None => {
                    self.terminated = true;
                    if !self.endpoint.is_closed() {
                        let reason = self.endpoint.abnormal_close();
                        return Poll::Ready(Some(Ok(Message::Close(Some(reason)))));
                    }
                }
            }
        }
    }
}

impl<S> Stream for WebSocketStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    type Item = Result<Message>;

    /// Polls for the next message.
    ///
    /// Returns `Poll::Ready(None)` once the connection is closed and the transport shut down.
    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().poll_next_message(cx)
    }
}

impl<S> Sink<Frame> for WebSocketStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    type Error = WebSocketError;

    /// Flushes obligated frames first, then waits for room in the write buffer.
    fn poll_ready(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_flush_obligated(cx))?;
        SinkExt::<Frame>::poll_ready_unpin(&mut this.framed, cx)
    }

    /// Queues `item`. A Close frame starts the closing handshake.
    fn start_send(self: Pin<&mut Self>, item: Frame) -> Result<()> {
        let this = self.get_mut();
        match this.endpoint.prepare(item)? {
            Some(frame) => this.framed.start_send_unpin(frame),
            None => Ok(()),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_flush_obligated(cx))?;
        SinkExt::<Frame>::poll_flush_unpin(&mut this.framed, cx)
    }

    /// Sends a Close frame if none was sent yet, then shuts the transport down without waiting
    /// for the peer's answer.
    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<()>> {
        let this = self.get_mut();
        if !this.terminated {
            // written by poll_flush_obligated once the sink has room; no-op after our Close
            this.endpoint.queue_close(None);
        }
        ready!(this.poll_flush_obligated(cx))?;
        ready!(SinkExt::<Frame>::poll_close_unpin(&mut this.framed, cx))?;
        this.terminated = true;
        Poll::Ready(Ok(()))
    }
}
