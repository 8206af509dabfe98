//! # wsengine
//! Protocol core of a WebSocket endpoint: RFC 6455 framing, RFC 7692 permessage-deflate
//! compression, the connection lifecycle and close handshake, ping/pong keep-alive and
//! reconnection with bounded exponential backoff.
//!
//! The crate starts where the HTTP upgrade ends. Whatever layer performed the handshake hands
//! over a duplex byte stream (anything implementing [`tokio::io::AsyncRead`] and
//! [`tokio::io::AsyncWrite`]) together with the negotiated parameters collected in [`Options`]:
//! subprotocol, compression and context takeover flags, keep-alive interval and close timeout.
//! No HTTP is parsed here.
//!
//! # Features
//! - `logging`: Enables debug logging of compression setup, state transitions, keep-alive and
//!   reconnect decisions using the `log` crate.
//! - `simd`: Validates UTF-8 text payloads with `simdutf8`.
//! - `json`: Enables [`WebSocket::send_json`].
//!
//! # Compression Support
//! The permessage-deflate extension is configured through [`DeflateOptions`]:
//!
//! - Context takeover control for both client and server
//! - Compression level adjustment (0-9)
//! - Memory usage optimization through no-context-takeover options
//!
//! # Example
//! ```no_run
//! use wsengine::{close::CloseCode, Handlers, Options, Role, WebSocket};
//!
//! async fn serve(stream: tokio::net::TcpStream) -> wsengine::Result<()> {
//!     let (handlers, mut messages) = Handlers::channel();
//!     let ws = WebSocket::spawn(Role::Server, stream, Options::default(), handlers);
//!
//!     while let Some(message) = messages.recv().await {
//!         ws.send(message).await?;
//!     }
//!
//!     ws.close(CloseCode::Normal, "bye").await
//! }
//! ```
//!
//! # Memory Safety
//! - Maximum payload size limits (configurable, default 1MB per frame, 2MB per message)
//! - Control frames limited to 125 bytes and never fragmented
//! - Optional UTF-8 validation for text frames
//! - Buffers drawn from a [`BufferPool`] are cleared before they are reused

#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod close;
pub mod codec;
mod compression;
mod connection;
pub mod frame;
pub mod interceptor;
mod mask;
mod options;
pub mod pool;
pub mod reconnect;

use thiserror::Error;

pub use close::{CloseCode, CloseReason};
pub use compression::{Deflater, Inflater};
pub use connection::{
    CloseEvent, ConnectInfo, ConnectionState, Handlers, ReadHalf, Role, WebSocket, WriteHalf,
};
pub use frame::{Frame, Message, MessageKind, OpCode};
pub use mask::apply_mask;
pub use options::{CompressionLevel, DeflateOptions, Options};
pub use pool::{BufferPool, RandomSource, Resources};

/// The maximum allowed payload size for reading, set to 1 MiB.
///
/// Frames with a payload size larger than this limit will be rejected to ensure memory safety
/// and prevent excessively large messages from impacting performance.
pub const MAX_PAYLOAD_READ: usize = 1024 * 1024;

/// The maximum allowed read buffer size, set to 2 MiB.
///
/// When the buffer of a fragmented message exceeds this size the connection is closed
/// to prevent unbounded memory growth.
pub const MAX_READ_BUFFER: usize = 2 * 1024 * 1024;

/// A result type for WebSocket operations, using `WebSocketError` as the error type.
pub type Result<T> = std::result::Result<T, WebSocketError>;

/// Broad category of a [`WebSocketError`].
///
/// Callers branch on the kind rather than on individual variants to decide how to recover:
/// protocol and compression failures are never retried, transport failures are an
/// ungraceful close, and cancellation is not a failure at all.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// The peer violated RFC 6455 / RFC 7692.
    Protocol,
    /// Reading from or writing to the underlying stream failed.
    Transport,
    /// The operation was aborted by the connection's cancellation signal.
    Cancellation,
    /// The DEFLATE stream could not be produced or consumed.
    Compression,
    /// A bounded wait (close handshake, pong) elapsed.
    Timeout,
    /// A configuration value was out of range.
    InvalidArgument,
    /// The connection is already closed.
    Closed,
}

/// Represents errors that can occur during WebSocket operations.
///
/// The errors are broadly categorized into (see [`ErrorKind`]):
///
/// - Protocol errors (e.g., invalid frames, incorrect sequence of operations)
/// - Data validation errors (e.g., invalid UTF-8, oversized payloads)
/// - Transport errors and cancellation
/// - Timeouts and invalid configuration
#[derive(Error, Debug)]
pub enum WebSocketError {
    /// Occurs when receiving a WebSocket fragment that violates the protocol specification,
    /// such as receiving a new data frame before completing the previous message.
    #[error("Invalid fragment")]
    InvalidFragment,

    /// Indicates that a text frame or close frame reason contains invalid UTF-8 data.
    #[error("Invalid UTF-8")]
    InvalidUTF8,

    /// Occurs when receiving a continuation frame without a preceding initial frame.
    #[error("Invalid continuation frame")]
    InvalidContinuationFrame,

    /// Returned when attempting to perform operations on a closed WebSocket connection.
    #[error("Connection is closed")]
    ConnectionClosed,

    /// Indicates that a received close frame carries a 1 byte payload
    /// (close frames must be either empty or ≥2 bytes).
    #[error("Invalid close frame")]
    InvalidCloseFrame,

    /// Occurs when a close frame contains a status code that may not be sent on the wire.
    #[error("Invalid close code")]
    InvalidCloseCode,

    /// Indicates that reserved bits in the frame header are set when they should be 0.
    #[error("Reserved bits are not zero")]
    ReservedBitsNotZero,

    /// Occurs when a control frame (ping, pong, or close) is received with the FIN bit
    /// not set. RFC 6455 requires that control frames must not be fragmented.
    #[error("Control frame must not be fragmented")]
    ControlFrameFragmented,

    /// A control frame declared a payload longer than 125 bytes.
    #[error("Control frame too large")]
    ControlFrameTooLarge,

    /// Occurs when a received frame's payload length exceeds the maximum configured size.
    #[error("Frame too large")]
    FrameTooLarge,

    /// Indicates receipt of a frame with an opcode outside the ones defined by RFC 6455.
    #[error("Invalid opcode (byte={0})")]
    InvalidOpCode(u8),

    /// A server received an unmasked frame or a client received a masked one.
    #[error("Invalid masking")]
    InvalidMasking,

    /// The stream ended in the middle of a frame.
    #[error("Stream ended before the frame was complete")]
    UnexpectedEof,

    /// Occurs when receiving a compressed frame on a connection where compression was not
    /// negotiated.
    #[error("Received compressed frame on stream that doesn't support compression")]
    CompressionNotSupported,

    /// The DEFLATE stream was corrupt or the compressor failed.
    #[error("Compression error: {0}")]
    Compression(String),

    /// The peer did not answer our close frame within the close timeout.
    #[error("Close handshake timed out")]
    CloseTimeout,

    /// No pong arrived within the keep-alive interval.
    #[error("Pong not received within the keep-alive interval")]
    PongTimeout,

    /// The operation was aborted through the connection's cancellation token.
    #[error("Operation cancelled")]
    Cancelled,

    /// A configuration value was rejected.
    #[error("Invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// Wraps standard I/O errors that may occur during WebSocket communication,
    /// such as connection resets.
    #[error(transparent)]
    IoError(#[from] std::io::Error),

    /// Occurs when serialization of JSON data fails.
    /// Only available when the `json` feature is enabled.
    #[cfg(feature = "json")]
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl WebSocketError {
    /// Returns the category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidFragment
            | Self::InvalidUTF8
            | Self::InvalidContinuationFrame
            | Self::InvalidCloseFrame
            | Self::InvalidCloseCode
            | Self::ReservedBitsNotZero
            | Self::ControlFrameFragmented
            | Self::ControlFrameTooLarge
            | Self::FrameTooLarge
            | Self::InvalidOpCode(_)
            | Self::InvalidMasking
            | Self::UnexpectedEof
            | Self::CompressionNotSupported => ErrorKind::Protocol,
            Self::Compression(_) => ErrorKind::Compression,
            Self::CloseTimeout | Self::PongTimeout => ErrorKind::Timeout,
            Self::Cancelled => ErrorKind::Cancellation,
            Self::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Self::ConnectionClosed => ErrorKind::Closed,
            Self::IoError(_) => ErrorKind::Transport,
            #[cfg(feature = "json")]
            Self::Json(_) => ErrorKind::InvalidArgument,
        }
    }

    /// The close code sent to the peer when this error terminates the connection.
    ///
    /// Returns `None` for errors after which no close frame can or should be sent
    /// (transport failures, cancellation, already closed).
    pub fn close_code(&self) -> Option<CloseCode> {
        let code = match self {
            Self::FrameTooLarge => CloseCode::Size,
            Self::InvalidOpCode(_) => CloseCode::Unsupported,
            Self::InvalidUTF8 => CloseCode::Invalid,
            Self::Compression(_) => CloseCode::Error,
            Self::PongTimeout => CloseCode::Protocol,
            Self::ReservedBitsNotZero
            | Self::ControlFrameFragmented
            | Self::ControlFrameTooLarge
            | Self::InvalidFragment
            | Self::InvalidContinuationFrame
            | Self::InvalidCloseFrame
            | Self::InvalidCloseCode
            | Self::InvalidMasking
            | Self::UnexpectedEof
            | Self::CompressionNotSupported => CloseCode::Protocol,
            _ => return None,
        };
        Some(code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(WebSocketError::InvalidFragment.kind(), ErrorKind::Protocol);
        assert_eq!(WebSocketError::UnexpectedEof.kind(), ErrorKind::Protocol);
        assert_eq!(
            WebSocketError::Compression("corrupt".into()).kind(),
            ErrorKind::Compression
        );
        assert_eq!(WebSocketError::Cancelled.kind(), ErrorKind::Cancellation);
        assert_eq!(WebSocketError::CloseTimeout.kind(), ErrorKind::Timeout);
        assert_eq!(
            WebSocketError::InvalidArgument("jitter").kind(),
            ErrorKind::InvalidArgument
        );

        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone");
        assert_eq!(WebSocketError::from(io).kind(), ErrorKind::Transport);
    }

    #[test]
    fn test_close_codes_for_errors() {
        assert_eq!(
            WebSocketError::FrameTooLarge.close_code(),
            Some(CloseCode::Size)
        );
        assert_eq!(
            WebSocketError::InvalidOpCode(3).close_code(),
            Some(CloseCode::Unsupported)
        );
        assert_eq!(
            WebSocketError::ControlFrameFragmented.close_code(),
            Some(CloseCode::Protocol)
        );
        assert_eq!(
            WebSocketError::InvalidUTF8.close_code(),
            Some(CloseCode::Invalid)
        );
        assert_eq!(WebSocketError::Cancelled.close_code(), None);
        assert_eq!(WebSocketError::ConnectionClosed.close_code(), None);
    }
}
