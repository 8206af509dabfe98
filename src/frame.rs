//! # Frame
//!
//! The `frame` module implements WebSocket frames as defined in [RFC 6455 Section 5.2](https://datatracker.ietf.org/doc/html/rfc6455#section-5.2)
//! and the messages they are reassembled into.
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
//! - **Data Frames**: `OpCode::Text`, `OpCode::Binary` and `OpCode::Continuation`
//! - **Control Frames**: `OpCode::Close`, `OpCode::Ping` and `OpCode::Pong`, never fragmented
//!   and never longer than 125 bytes
//!
//! A [`Message`] is the unit handed to applications: the payload of one data frame, or of a
//! data frame and all of its continuation frames, already inflated if it was compressed.
use bytes::{Bytes, BytesMut};

use crate::{
    close::{CloseCode, CloseReason},
    WebSocketError,
};

/// Largest payload a control frame may carry.
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// WebSocket operation code (OpCode) that determines the semantic meaning and handling of a frame.
///
/// The numeric values for each OpCode are defined in [RFC 6455, Section 11.8](https://datatracker.ietf.org/doc/html/rfc6455#section-11.8):
/// - Continuation = 0x0
/// - Text = 0x1
/// - Binary = 0x2
/// - Close = 0x8
/// - Ping = 0x9
/// - Pong = 0xA
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
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
    pub fn is_control(&self) -> bool {
        matches!(*self, OpCode::Close | OpCode::Ping | OpCode::Pong)
    }
}

impl TryFrom<u8> for OpCode {
    type Error = WebSocketError;

    /// Invalid opcodes (0x3-0x7 and 0xB-0xF) result in `WebSocketError::InvalidOpCode`.
    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x0 => Ok(Self::Continuation),
            0x1 => Ok(Self::Text),
            0x2 => Ok(Self::Binary),
            0x8 => Ok(Self::Close),
            0x9 => Ok(Self::Ping),
            0xA => Ok(Self::Pong),
            _ => Err(WebSocketError::InvalidOpCode(value)),
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

/// Represents a WebSocket frame, the unit read from and written to the wire.
///
/// **Note: This low-level struct should rarely be used directly.** Applications exchange
/// [`Message`]s; frames are produced and consumed by the connection.
///
/// # Fields
/// - `fin`: Final fragment flag. When `true`, indicates this frame completes a message.
/// - `opcode`: Defines the frame type.
/// - `is_compressed`: RSV1, set on the first frame of a compressed message.
/// - `mask`: Optional 32-bit XOR masking key, present on client-to-server frames.
/// - `payload`: Frame payload data. Always held unmasked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Indicates if this is the final frame in a message.
    pub fin: bool,
    /// The opcode of the frame, defining its type.
    pub opcode: OpCode,
    /// Flag indicating whether the payload is compressed (RSV1).
    pub(crate) is_compressed: bool,
    /// The masking key for the frame, if any.
    mask: Option<[u8; 4]>,
    /// The payload of the frame.
    pub payload: BytesMut,
}

/// Largest header: 2 bytes + 8 bytes extended length + 4 bytes mask.
pub(crate) const MAX_HEAD_SIZE: usize = 16;

impl Frame {
    /// Creates a new uncompressed `Frame`.
    pub fn new(
        fin: bool,
        opcode: OpCode,
        mask: Option<[u8; 4]>,
        payload: impl Into<BytesMut>,
    ) -> Self {
        Self {
            fin,
            opcode,
            mask,
            payload: payload.into(),
            is_compressed: false,
        }
    }

    /// Creates a new frame with the RSV1 (compressed) bit set.
    pub fn compress(
        fin: bool,
        opcode: OpCode,
        mask: Option<[u8; 4]>,
        payload: impl Into<BytesMut>,
    ) -> Self {
        Self {
            is_compressed: true,
            ..Self::new(fin, opcode, mask, payload)
        }
    }

    /// Creates a final text frame.
    pub fn text(payload: impl AsRef<[u8]>) -> Self {
        Self::new(true, OpCode::Text, None, payload.as_ref())
    }

    /// Creates a final binary frame.
    pub fn binary(payload: impl AsRef<[u8]>) -> Self {
        Self::new(true, OpCode::Binary, None, payload.as_ref())
    }

    /// Creates a final continuation frame.
    pub fn continuation(payload: impl AsRef<[u8]>) -> Self {
        Self::new(true, OpCode::Continuation, None, payload.as_ref())
    }

    /// Creates a ping frame.
    pub fn ping(payload: impl AsRef<[u8]>) -> Self {
        Self::new(true, OpCode::Ping, None, payload.as_ref())
    }

    /// Creates a pong frame.
    pub fn pong(payload: impl AsRef<[u8]>) -> Self {
        Self::new(true, OpCode::Pong, None, payload.as_ref())
    }

    /// Creates a close frame with a status code and reason.
    pub fn close(code: CloseCode, reason: impl AsRef<str>) -> Self {
        Self::close_raw(CloseReason::new(code, reason.as_ref()).encode())
    }

    /// Creates a close frame with a raw payload.
    ///
    /// This method does not validate if `payload` is a valid close frame payload.
    pub fn close_raw<T: AsRef<[u8]>>(payload: T) -> Self {
        Self::new(true, OpCode::Close, None, payload.as_ref())
    }

    /// Sets the FIN flag.
    pub fn with_fin(mut self, fin: bool) -> Self {
        self.fin = fin;
        self
    }

    /// Sets the masking key.
    pub fn with_mask(mut self, mask: [u8; 4]) -> Self {
        self.mask = Some(mask);
        self
    }

    #[inline(always)]
    pub(crate) fn set_mask(&mut self, mask: Option<[u8; 4]>) {
        self.mask = mask;
    }

    /// Whether RSV1 is set.
    #[inline(always)]
    pub fn is_compressed(&self) -> bool {
        self.is_compressed
    }

    /// Returns whether the frame carries a masking key.
    #[inline(always)]
    pub fn is_masked(&self) -> bool {
        self.mask.is_some()
    }

    /// The masking key, if any.
    #[inline(always)]
    pub fn mask_key(&self) -> Option<[u8; 4]> {
        self.mask
    }

    /// Checks if the frame payload is valid UTF-8.
    #[inline(always)]
    pub fn is_utf8(&self) -> bool {
        #[cfg(not(feature = "simd"))]
        return std::str::from_utf8(&self.payload).is_ok();
        #[cfg(feature = "simd")]
        return simdutf8::basic::from_utf8(&self.payload).is_ok();
    }

    /// Formats the frame header into the provided `head` buffer and returns its size.
    ///
    /// The header byte is `fin << 7 | rsv1 << 6 | opcode`; the length uses the 7-bit,
    /// 16-bit or 64-bit form depending on the payload size, and the mask key follows when
    /// the frame is masked.
    ///
    /// # Panics
    /// Panics if `head` is shorter than [`MAX_HEAD_SIZE`].
    pub(crate) fn fmt_head(&self, head: &mut [u8]) -> usize {
        let compression = u8::from(self.is_compressed);
        head[0] = (self.fin as u8) << 7 | compression << 6 | u8::from(self.opcode);

        let len = self.payload.len();
        let size = if len < 126 {
            head[1] = len as u8;
            2
        } else if len < 65536 {
            head[1] = 126;
            head[2..4].copy_from_slice(&(len as u16).to_be_bytes());
            4
        } else {
            head[1] = 127;
            head[2..10].copy_from_slice(&(len as u64).to_be_bytes());
            10
        };

        if let Some(mask) = self.mask {
            head[1] |= 0x80;
            head[size..size + 4].copy_from_slice(&mask);
            size + 4
        } else {
            size
        }
    }
}

/// The type of a [`Message`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MessageKind {
    Text,
    Binary,
}

impl From<MessageKind> for OpCode {
    fn from(kind: MessageKind) -> Self {
        match kind {
            MessageKind::Text => OpCode::Text,
            MessageKind::Binary => OpCode::Binary,
        }
    }
}

impl TryFrom<OpCode> for MessageKind {
    type Error = WebSocketError;

    fn try_from(opcode: OpCode) -> Result<Self, Self::Error> {
        match opcode {
            OpCode::Text => Ok(Self::Text),
            OpCode::Binary => Ok(Self::Binary),
            OpCode::Continuation => Err(WebSocketError::InvalidContinuationFrame),
            _ => Err(WebSocketError::InvalidFragment),
        }
    }
}

/// A complete application message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Text or binary.
    pub kind: MessageKind,
    /// The message payload, decompressed.
    pub payload: Bytes,
    /// Whether the message travelled compressed on the wire.
    pub is_compressed: bool,
}

impl Message {
    /// Creates a text message.
    pub fn text(payload: impl Into<Bytes>) -> Self {
        Self::new(MessageKind::Text, payload)
    }

    /// Creates a binary message.
    pub fn binary(payload: impl Into<Bytes>) -> Self {
        Self::new(MessageKind::Binary, payload)
    }

    /// Creates a message of the given kind.
    pub fn new(kind: MessageKind, payload: impl Into<Bytes>) -> Self {
        Self {
            kind,
            payload: payload.into(),
            is_compressed: false,
        }
    }

    /// The payload as text, if it is valid UTF-8.
    pub fn as_text(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }

    /// The opcode of the first frame carrying this message.
    pub fn opcode(&self) -> OpCode {
        self.kind.into()
    }
}
