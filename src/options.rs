use std::time::Duration;

use crate::{pool::Resources, MAX_PAYLOAD_READ, MAX_READ_BUFFER};

/// Compression level of the Deflate algorithm, from 0 (store) to 9 (best).
pub type CompressionLevel = flate2::Compression;

/// Default bound on the close handshake wait.
const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Parameters of a connection, as negotiated by whatever performed the HTTP upgrade.
///
/// Nothing here is parsed from headers. The handshake layer decides on a subprotocol, whether
/// permessage-deflate was accepted and with which context takeover flags, and hands the
/// outcome over together with the local limits and timers.
///
/// ```rust
/// use std::time::Duration;
/// use wsengine::{DeflateOptions, Options};
///
/// let options = Options::default()
///     .with_compression(DeflateOptions::default())
///     .with_keep_alive(Duration::from_secs(30))
///     .with_max_payload_read(64 * 1024);
/// ```
#[derive(Clone, Debug)]
pub struct Options {
    /// Maximum allowed payload size of a single incoming frame, in bytes.
    ///
    /// Default: 1 MiB as defined in [`MAX_PAYLOAD_READ`]
    pub max_payload_read: usize,

    /// Maximum size of a reassembled message, after decompression.
    ///
    /// Fragments are accumulated until the final one arrives. Once the accumulated payload
    /// exceeds this limit the connection is closed with status 1009.
    ///
    /// Default: 2 MiB as defined in [`MAX_READ_BUFFER`]
    pub max_read_buffer: usize,

    /// Negotiated permessage-deflate parameters, `None` when compression is off.
    pub compression: Option<DeflateOptions>,

    /// Validate that incoming text messages are UTF-8.
    ///
    /// Default: `true`
    pub check_utf8: bool,

    /// Interval between keep-alive pings. `None` or a zero duration disables them.
    pub keep_alive_interval: Option<Duration>,

    /// How long a locally initiated close waits for the peer's close frame.
    ///
    /// Default: 5 seconds
    pub close_timeout: Duration,

    /// Subprotocol agreed on during the handshake, reported to the connect handlers.
    pub subprotocol: Option<String>,

    /// Split outgoing messages into frames of at most this many payload bytes.
    pub fragment_size: Option<usize>,

    /// Buffer pool and random source used by this connection.
    pub resources: Resources,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            max_payload_read: MAX_PAYLOAD_READ,
            max_read_buffer: MAX_READ_BUFFER,
            compression: None,
            check_utf8: true,
            keep_alive_interval: None,
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
            subprotocol: None,
            fragment_size: None,
            resources: Resources::default(),
        }
    }
}

impl Options {
    /// Sets the maximum payload size of an incoming frame.
    pub fn with_max_payload_read(self, size: usize) -> Self {
        Self {
            max_payload_read: size,
            ..self
        }
    }

    /// Sets the maximum size of a reassembled incoming message.
    pub fn with_max_read_buffer(self, size: usize) -> Self {
        Self {
            max_read_buffer: size,
            ..self
        }
    }

    /// Enables permessage-deflate with the given parameters.
    pub fn with_compression(self, compression: DeflateOptions) -> Self {
        Self {
            compression: Some(compression),
            ..self
        }
    }

    /// Disables compression.
    pub fn without_compression(self) -> Self {
        Self {
            compression: None,
            ..self
        }
    }

    /// Sets the compression level, enabling compression with default flags if it was off.
    pub fn with_compression_level(self, level: CompressionLevel) -> Self {
        let compression = self.compression.clone().unwrap_or_default();
        Self {
            compression: Some(DeflateOptions { level, ..compression }),
            ..self
        }
    }

    /// Resets the server's compression context after every message.
    pub fn server_no_context_takeover(self) -> Self {
        let compression = self.compression.clone().unwrap_or_default();
        Self {
            compression: Some(DeflateOptions {
                server_no_context_takeover: true,
                ..compression
            }),
            ..self
        }
    }

    /// Resets the client's compression context after every message.
    pub fn client_no_context_takeover(self) -> Self {
        let compression = self.compression.clone().unwrap_or_default();
        Self {
            compression: Some(DeflateOptions {
                client_no_context_takeover: true,
                ..compression
            }),
            ..self
        }
    }

    /// Turns UTF-8 validation of text messages on or off.
    pub fn with_utf8(self, check_utf8: bool) -> Self {
        Self { check_utf8, ..self }
    }

    /// Sends a ping every `interval` and closes the connection when no pong comes back in time.
    pub fn with_keep_alive(self, interval: Duration) -> Self {
        Self {
            keep_alive_interval: Some(interval),
            ..self
        }
    }

    /// Sets the close handshake timeout.
    pub fn with_close_timeout(self, close_timeout: Duration) -> Self {
        Self {
            close_timeout,
            ..self
        }
    }

    /// Records the negotiated subprotocol.
    pub fn with_subprotocol(self, subprotocol: impl Into<String>) -> Self {
        Self {
            subprotocol: Some(subprotocol.into()),
            ..self
        }
    }

    /// Fragments outgoing messages larger than `size` bytes.
    pub fn with_fragment_size(self, size: usize) -> Self {
        Self {
            fragment_size: Some(size),
            ..self
        }
    }

    /// Uses the given buffer pool and random source.
    pub fn with_resources(self, resources: Resources) -> Self {
        Self { resources, ..self }
    }

    /// The keep-alive interval, if keep-alive is enabled.
    pub(crate) fn keep_alive(&self) -> Option<Duration> {
        self.keep_alive_interval.filter(|interval| !interval.is_zero())
    }
}

/// Configuration options for WebSocket message compression using the Deflate algorithm.
///
/// # Context Management
/// Offers two modes for managing the compression context, chosen per direction:
///
/// - **Context Takeover** (default): Maintains compression state between messages,
///   providing better compression ratios at the cost of increased memory usage.
///
/// - **No Context Takeover**: Resets compression state after each message,
///   reducing memory usage at the expense of compression efficiency.
///
/// ```rust
/// use wsengine::DeflateOptions;
///
/// let options = DeflateOptions {
///     server_no_context_takeover: true,
///     ..Default::default()
/// };
/// ```
#[derive(Clone, Debug, Default)]
pub struct DeflateOptions {
    /// Sets the compression level (0-9), balancing compression ratio against CPU usage.
    ///
    /// - 0: No compression (fastest)
    /// - 1-3: Low compression (fast)
    /// - 4-6: Medium compression (default)
    /// - 7-9: High compression (slow)
    pub level: CompressionLevel,

    /// When `true`, the server's compression state is reset after each message.
    pub server_no_context_takeover: bool,

    /// When `true`, the client's compression state is reset after each message.
    pub client_no_context_takeover: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = Options::default();
        assert_eq!(options.max_payload_read, MAX_PAYLOAD_READ);
        assert_eq!(options.max_read_buffer, MAX_READ_BUFFER);
        assert_eq!(options.close_timeout, Duration::from_secs(5));
        assert!(options.compression.is_none());
        assert!(options.keep_alive().is_none());
    }

    #[test]
    fn test_zero_keep_alive_is_disabled() {
        let options = Options::default().with_keep_alive(Duration::ZERO);
        assert!(options.keep_alive().is_none());

        let options = Options::default().with_keep_alive(Duration::from_secs(1));
        assert_eq!(options.keep_alive(), Some(Duration::from_secs(1)));
    }

    #[test]
    fn test_context_takeover_flags() {
        let options = Options::default()
            .server_no_context_takeover()
            .with_compression_level(CompressionLevel::best());
        let compression = options.compression.unwrap();
        assert!(compression.server_no_context_takeover);
        assert!(!compression.client_no_context_takeover);
        assert_eq!(compression.level, CompressionLevel::best());

        assert!(Options::default()
            .client_no_context_takeover()
            .without_compression()
            .compression
            .is_none());
    }
}
