//! permessage-deflate engine ([RFC 7692](https://datatracker.ietf.org/doc/html/rfc7692)).
//!
//! One [`Deflater`] compresses outbound messages and one [`Inflater`] decompresses inbound ones.
//! Each wraps a raw DEFLATE stream from `flate2` that lives as long as the connection, unless
//! "no context takeover" was negotiated for its direction, in which case the stream is reset
//! at every message boundary.
use bytes::Bytes;
use flate2::{CompressError, DecompressError, FlushCompress, FlushDecompress, Status};

use crate::{pool::BufferPool, CompressionLevel, WebSocketError};

/// Empty stored block emitted by a sync flush. Stripped before sending and re-appended
/// before inflating ([RFC 7692 Section 7.2.1](https://datatracker.ietf.org/doc/html/rfc7692#section-7.2.1)).
const TRAILER: [u8; 4] = [0x00, 0x00, 0xff, 0xff];

/// Minimum spare capacity kept in output buffers between calls into `flate2`.
const CHUNK: usize = 1024;

/// Compressor for outbound messages.
///
/// Raw bytes are fed with [`Deflater::write`] and the compressed message is collected with
/// [`Deflater::read`], which also marks the message boundary.
pub struct Deflater {
    compress: flate2::Compress,
    output: Vec<u8>,
    no_context_takeover: bool,
}

impl Deflater {
    /// Creates a deflater with the given level.
    ///
    /// When `no_context_takeover` is set the dictionary does not survive [`Deflater::read`].
    pub fn new(level: CompressionLevel, no_context_takeover: bool) -> Self {
        Self {
            compress: flate2::Compress::new(level, false),
            output: Vec::with_capacity(CHUNK),
            no_context_takeover,
        }
    }

    /// Feeds raw bytes into the compressor.
    pub fn write(&mut self, mut input: &[u8]) -> Result<(), WebSocketError> {
        while !input.is_empty() {
            reserve(&mut self.output);

            let before_in = self.compress.total_in();
            self.compress
                .compress_vec(input, &mut self.output, FlushCompress::None)
                .map_err(deflate_error)?;

            let consumed = (self.compress.total_in() - before_in) as usize;
            input = &input[consumed..];
        }

        Ok(())
    }

    /// Flushes the compressor and returns everything compressed since the last read,
    /// without the trailing `00 00 FF FF`.
    pub fn read(&mut self) -> Result<Bytes, WebSocketError> {
        reserve(&mut self.output);
        self.compress
            .compress_vec(&[], &mut self.output, FlushCompress::Sync)
            .map_err(deflate_error)?;

        // drain whatever did not fit during the flush
        loop {
            reserve(&mut self.output);

            let before_out = self.compress.total_out();
            self.compress
                .compress_vec(&[], &mut self.output, FlushCompress::None)
                .map_err(deflate_error)?;

            if before_out == self.compress.total_out() {
                break;
            }
        }

        if self.output.ends_with(&TRAILER) {
            self.output.truncate(self.output.len() - TRAILER.len());
        }

        let output = std::mem::replace(&mut self.output, Vec::with_capacity(CHUNK));

        if self.no_context_takeover {
            self.compress.reset();
        }

        Ok(output.into())
    }

    /// Compresses one whole message.
    pub fn compress(&mut self, input: &[u8]) -> Result<Bytes, WebSocketError> {
        self.write(input)?;
        self.read()
    }
}

/// Decompressor for inbound messages.
///
/// Compressed frame payloads are buffered with [`Inflater::write`] and the message is inflated
/// at once by [`Inflater::read`]. The buffer holding the compressed bytes is rented from a
/// [`BufferPool`] and zeroed when returned.
pub struct Inflater {
    decompress: flate2::Decompress,
    pool: BufferPool,
    pending: Option<crate::pool::PooledBuf>,
    max_output: usize,
    no_context_takeover: bool,
}

impl Inflater {
    /// Creates an inflater.
    ///
    /// A message inflating to more than `max_output` bytes fails with
    /// [`WebSocketError::FrameTooLarge`].
    pub fn new(no_context_takeover: bool, pool: BufferPool, max_output: usize) -> Self {
        Self {
            decompress: flate2::Decompress::new(false),
            pool,
            pending: None,
            max_output,
            no_context_takeover,
        }
    }

    /// Appends compressed bytes of the current message.
    pub fn write(&mut self, input: &[u8]) {
        let pool = &self.pool;
        self.pending
            .get_or_insert_with(|| pool.rent_sensitive(input.len() + TRAILER.len()))
            .extend_from_slice(input);
    }

    /// Number of compressed bytes buffered for the current message.
    pub fn buffered(&self) -> usize {
        self.pending.as_ref().map_or(0, |buf| buf.len())
    }

    /// Inflates the buffered message, ending it.
    ///
    /// The buffer is released even when decompression fails.
    pub fn read(&mut self) -> Result<Bytes, WebSocketError> {
        let mut input = match self.pending.take() {
            Some(buf) => buf,
            None => self.pool.rent_sensitive(TRAILER.len()),
        };
        input.extend_from_slice(&TRAILER);

        let result = self.inflate(&input);
        if self.no_context_takeover || result.is_err() {
            self.decompress.reset(false);
        }

        result.map(Bytes::from)
    }

    fn inflate(&mut self, mut input: &[u8]) -> Result<Vec<u8>, WebSocketError> {
        let capacity = (input.len() * 2).clamp(CHUNK, self.max_output.max(CHUNK));
        let mut output = Vec::with_capacity(capacity);

        loop {
            reserve(&mut output);

            let before_in = self.decompress.total_in();
            let before_out = self.decompress.total_out();
            let status = self
                .decompress
                .decompress_vec(input, &mut output, FlushDecompress::Sync)
                .map_err(inflate_error)?;

            let consumed = (self.decompress.total_in() - before_in) as usize;
            let produced = (self.decompress.total_out() - before_out) as usize;
            input = &input[consumed..];

            if output.len() > self.max_output {
                return Err(WebSocketError::FrameTooLarge);
            }

            let has_room = output.len() < output.capacity();
            match status {
                // the peer finished the stream; a new one starts with the next message
                Status::StreamEnd => {
                    self.decompress.reset(false);
                    break;
                }
                _ if input.is_empty() && has_room => break,
                Status::BufError if consumed == 0 && produced == 0 && has_room => {
                    return Err(WebSocketError::Compression(
                        "truncated deflate stream".to_string(),
                    ));
                }
                _ => {}
            }
        }

        Ok(output)
    }
}

fn reserve(buf: &mut Vec<u8>) {
    if buf.capacity() - buf.len() < CHUNK {
        buf.reserve(CHUNK);
    }
}

fn deflate_error(err: CompressError) -> WebSocketError {
    WebSocketError::Compression(err.to_string())
}

fn inflate_error(err: DecompressError) -> WebSocketError {
    WebSocketError::Compression(err.to_string())
}

#[cfg(test)]
mod tests {
    use flate2::Compression;

    use super::*;

    const LIMIT: usize = 16 * 1024 * 1024;

    fn inflater(no_context_takeover: bool) -> Inflater {
        Inflater::new(no_context_takeover, BufferPool::new(), LIMIT)
    }

    fn text(len: usize) -> Vec<u8> {
        b"the quick brown fox jumps over the lazy dog. "
            .iter()
            .copied()
            .cycle()
            .take(len)
            .collect()
    }

    #[test]
    fn test_trailer_is_stripped() {
        let mut deflater = Deflater::new(Compression::default(), false);
        let compressed = deflater.compress(b"Hello").unwrap();
        assert!(!compressed.ends_with(&TRAILER));
        assert!(!compressed.is_empty());
    }

    #[test]
    fn test_round_trip_with_context() {
        let mut deflater = Deflater::new(Compression::default(), false);
        let mut inflater = inflater(false);

        for len in [0usize, 1, 125, 126, 4096, 100_000] {
            let data = text(len);
            let compressed = deflater.compress(&data).unwrap();
            inflater.write(&compressed);
            assert_eq!(&inflater.read().unwrap()[..], &data[..], "len {len}");
        }
    }

    #[test]
    fn test_round_trip_no_context_takeover() {
        let mut deflater = Deflater::new(Compression::best(), true);

        for _ in 0..3 {
            let data = text(10_000);
            let compressed = deflater.compress(&data).unwrap();

            // every message inflates on its own
            let mut fresh = inflater(true);
            fresh.write(&compressed);
            assert_eq!(&fresh.read().unwrap()[..], &data[..]);
        }
    }

    #[test]
    fn test_context_takeover_shrinks_repeated_messages() {
        let data = text(2000);

        let mut with_context = Deflater::new(Compression::default(), false);
        let first = with_context.compress(&data).unwrap();
        let second = with_context.compress(&data).unwrap();
        assert!(second.len() < first.len());

        let mut without_context = Deflater::new(Compression::default(), true);
        let first = without_context.compress(&data).unwrap();
        let second = without_context.compress(&data).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_fragmented_input() {
        let data = text(50_000);
        let mut deflater = Deflater::new(Compression::default(), false);
        for chunk in data.chunks(777) {
            deflater.write(chunk).unwrap();
        }
        let compressed = deflater.read().unwrap();

        let mut inflater = inflater(false);
        for chunk in compressed.chunks(100) {
            inflater.write(chunk);
        }
        assert_eq!(inflater.buffered(), compressed.len());
        assert_eq!(&inflater.read().unwrap()[..], &data[..]);
        assert_eq!(inflater.buffered(), 0);
    }

    #[test]
    fn test_corrupt_stream() {
        let mut inflater = inflater(false);
        inflater.write(&[0xff, 0xff, 0xff, 0xff, 0xff, 0xff]);
        assert!(matches!(
            inflater.read(),
            Err(WebSocketError::Compression(_))
        ));

        // the inflater is usable again after a failure
        let mut deflater = Deflater::new(Compression::default(), false);
        inflater.write(&deflater.compress(b"after").unwrap());
        assert_eq!(&inflater.read().unwrap()[..], b"after");
    }

    #[test]
    fn test_output_limit() {
        let data = vec![0u8; 64 * 1024];
        let compressed = Deflater::new(Compression::default(), false)
            .compress(&data)
            .unwrap();

        let mut inflater = Inflater::new(false, BufferPool::new(), 1024);
        inflater.write(&compressed);
        assert!(matches!(inflater.read(), Err(WebSocketError::FrameTooLarge)));
    }

    #[test]
    fn test_buffer_returned_to_pool() {
        let pool = BufferPool::new();
        let mut inflater = Inflater::new(false, pool.clone(), LIMIT);
        let compressed = Deflater::new(Compression::default(), false)
            .compress(b"pooled")
            .unwrap();

        inflater.write(&compressed);
        assert_eq!(pool.available(), 0);
        inflater.read().unwrap();
        assert_eq!(pool.available(), 1);
    }
}
