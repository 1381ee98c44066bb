use crate::message::Delivery;

/// The maximum allowed payload size for reading, set to 1 MiB.
///
/// Frames with a payload size larger than this limit will be rejected to ensure memory safety
/// and prevent excessively large frames from impacting performance.
pub const MAX_PAYLOAD_READ: usize = 1024 * 1024;

/// The maximum allowed size of a reassembled message, set to 2 MiB.
///
/// When a fragmented message grows past this size the connection is closed with code 1009
/// to prevent unbounded memory growth.
pub const MAX_READ_BUFFER: usize = 2 * 1024 * 1024;

/// The role an endpoint is taking.
///
/// When a server role is taken the frames will not be masked, unlike
/// the client role, in which frames are masked.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Server => write!(f, "server"),
            Self::Client => write!(f, "client"),
        }
    }
}

/// Configuration of a WebSocket endpoint.
///
/// Limits left as `None` fall back to the crate defaults when the connection is created.
///
/// ```rust
/// use wsengine::{Delivery, Options};
///
/// let options = Options::default()
///     .with_max_payload_read(64 * 1024)
///     .with_delivery(Delivery::Streaming);
/// assert_eq!(options.max_payload_read, Some(64 * 1024));
/// ```
#[derive(Debug, Clone, Default)]
pub struct Options {
    /// Maximum allowed payload size of a single incoming frame, in bytes.
    ///
    /// If a frame exceeds this size, the connection will be closed immediately
    /// to prevent overloading the receiving end.
    ///
    /// Default: 1 MiB (1,048,576 bytes) as defined in [`MAX_PAYLOAD_READ`]
    pub max_payload_read: Option<usize>,

    /// Maximum size of a message reassembled from fragments.
    ///
    /// Only applies to [`Delivery::Whole`], where fragments are buffered until the message is
    /// complete. Once the accumulated size exceeds this limit, the connection is closed.
    ///
    /// Default: 2 MiB (2,097,152 bytes) as defined in [`MAX_READ_BUFFER`], or twice the
    /// configured `max_payload_read` value if that is set.
    pub max_read_buffer: Option<usize>,

    /// How data messages are handed to the application.
    ///
    /// Default: [`Delivery::Whole`]
    pub delivery: Delivery,

    /// RSV bits (as `0b0RRR_0000`, RSV1 being the highest) the peer may set because an
    /// extension giving them a meaning was negotiated. Any other RSV bit fails the connection.
    ///
    /// Default: none
    pub reserved_bits: u8,
}

impl Options {
    /// Sets the maximum allowed payload size for incoming frames.
    pub fn with_max_payload_read(self, size: usize) -> Self {
        Self {
            max_payload_read: Some(size),
            ..self
        }
    }

    /// Sets the maximum size of a reassembled message.
    pub fn with_max_read_buffer(self, size: usize) -> Self {
        Self {
            max_read_buffer: Some(size),
            ..self
        }
    }

    /// Selects whole-message or per-fragment delivery.
    pub fn with_delivery(self, delivery: Delivery) -> Self {
        Self { delivery, ..self }
    }

    /// Allows the peer to set the given RSV bits.
    ///
    /// Meant to be called once an extension that defines them has been negotiated during the
    /// handshake. The payload itself is passed through untouched.
    pub fn with_reserved_bits(self, rsv1: bool, rsv2: bool, rsv3: bool) -> Self {
        Self {
            reserved_bits: (rsv1 as u8) << 6 | (rsv2 as u8) << 5 | (rsv3 as u8) << 4,
            ..self
        }
    }

    /// Resolves the optional limits into the values a connection runs with.
    pub(crate) fn settings(&self) -> Settings {
        // max read buffer should be at least 2 times the payload read if not specified
        let max_read_buffer = self.max_read_buffer.unwrap_or(
            self.max_payload_read
                .map(|payload_read| payload_read.saturating_mul(2))
                .unwrap_or(MAX_READ_BUFFER),
        );

        Settings {
            max_payload_read: self.max_payload_read.unwrap_or(MAX_PAYLOAD_READ),
            max_read_buffer,
            delivery: self.delivery,
            reserved_bits: self.reserved_bits & 0b0111_0000,
        }
    }
}

/// Limits resolved from [`Options`] once per connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Settings {
    pub max_payload_read: usize,
    pub max_read_buffer: usize,
    pub delivery: Delivery,
    pub reserved_bits: u8,
}
