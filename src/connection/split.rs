//! Message-level halves of a connection.
//!
//! Both halves follow a sans-io design: they never touch the stream. [`ReadHalf`] is fed
//! decoded data frames and yields complete messages, [`WriteHalf`] turns a message into the
//! frames to encode. The driver in the parent module owns the I/O.

use bytes::{Bytes, BytesMut};

use crate::{
    compression::{Deflater, Inflater},
    frame::{Frame, Message, MessageKind, OpCode},
    Options, Result, WebSocketError,
};

use super::Role;

// ================ ReadHalf ====================

/// The read half of a WebSocket connection, reassembling data frames into messages.
///
/// [`ReadHalf`] handles decompression and message fragmentation but not control frames:
/// frames with [`OpCode::Ping`], [`OpCode::Pong`] and [`OpCode::Close`] are dispatched by the
/// caller before reaching it, which is why a control frame never disturbs a pending message.
///
/// # Warning
///
/// In most cases, you should **not** use [`ReadHalf`] directly. A
/// [`WebSocket`](super::WebSocket) owns one and drives it from its read loop.
pub struct ReadHalf {
    /// Decompressor, present when permessage-deflate was negotiated.
    inflate: Option<Inflater>,
    /// Header of the message being reassembled.
    fragment: Option<Fragment>,
    /// Accumulated payload of an uncompressed fragmented message.
    accumulated: BytesMut,
    /// Maximum size of a reassembled message.
    max_read_buffer: usize,
    check_utf8: bool,
}

/// Fragmented message header.
struct Fragment {
    kind: MessageKind,
    is_compressed: bool,
}

impl ReadHalf {
    /// Creates the read half for an endpoint of the given role.
    ///
    /// A server inflates with the client's context takeover flag, a client with the server's.
    pub fn new(role: Role, options: &Options) -> Self {
        let inflate = options.compression.as_ref().map(|config| {
            let no_context_takeover = match role {
                Role::Server => config.client_no_context_takeover,
                Role::Client => config.server_no_context_takeover,
            };

            #[cfg(feature = "logging")]
            log::debug!(
                "Established decompressor for {role} with no_context_takeover={no_context_takeover}"
            );

            Inflater::new(
                no_context_takeover,
                options.resources.pool.clone(),
                options.max_read_buffer,
            )
        });

        Self {
            inflate,
            fragment: None,
            accumulated: BytesMut::with_capacity(1024),
            max_read_buffer: options.max_read_buffer,
            check_utf8: options.check_utf8,
        }
    }

    /// Whether a fragmented message is waiting for its continuation frames.
    pub fn is_pending(&self) -> bool {
        self.fragment.is_some()
    }

    /// Processes an incoming data frame.
    ///
    /// - `Text` / `Binary` frames with `fin` set are complete messages on their own. Without
    ///   `fin` they open a pending message, which fails with
    ///   [`WebSocketError::InvalidFragment`] if one is already open.
    /// - `Continuation` frames append to the pending message, completing it when `fin` is set.
    ///   Without a pending message this fails with [`WebSocketError::InvalidContinuationFrame`].
    ///
    /// # Returns
    /// - `Ok(Some(Message))` once a message is complete, inflated and validated.
    /// - `Ok(None)` if the frame is part of a fragmented message that is not complete yet.
    /// - `Err(WebSocketError)` on a protocol, size or compression violation.
    pub fn on_frame(&mut self, frame: Frame) -> Result<Option<Message>> {
        if frame.is_compressed() && self.inflate.is_none() {
            return Err(WebSocketError::CompressionNotSupported);
        }

        match frame.opcode {
            OpCode::Continuation => {
                let is_compressed = self
                    .fragment
                    .as_ref()
                    .ok_or(WebSocketError::InvalidContinuationFrame)?
                    .is_compressed;

                self.append(is_compressed, &frame.payload)?;
                if !frame.fin {
                    return Ok(None);
                }

                match self.fragment.take() {
                    Some(fragment) => self.finish(fragment, None).map(Some),
                    None => Err(WebSocketError::InvalidContinuationFrame),
                }
            }
            opcode => {
                let kind = MessageKind::try_from(opcode)?;
                if self.fragment.is_some() {
                    return Err(WebSocketError::InvalidFragment);
                }

                let fragment = Fragment {
                    kind,
                    is_compressed: frame.is_compressed(),
                };

                if frame.fin {
                    return self.finish(fragment, Some(frame.payload)).map(Some);
                }

                self.append(fragment.is_compressed, &frame.payload)?;
                self.fragment = Some(fragment);

                Ok(None)
            }
        }
    }

    fn append(&mut self, is_compressed: bool, payload: &[u8]) -> Result<()> {
        let buffered = match (is_compressed, self.inflate.as_mut()) {
            (true, Some(inflate)) => {
                inflate.write(payload);
                inflate.buffered()
            }
            _ => {
                self.accumulated.extend_from_slice(payload);
                self.accumulated.len()
            }
        };

        if buffered > self.max_read_buffer {
            return Err(WebSocketError::FrameTooLarge);
        }

        Ok(())
    }

    /// Completes a message. `single` is the payload of an unfragmented message.
    fn finish(&mut self, fragment: Fragment, single: Option<BytesMut>) -> Result<Message> {
        let payload: Bytes = match (fragment.is_compressed, self.inflate.as_mut()) {
            (true, Some(inflate)) => {
                if let Some(payload) = single {
                    inflate.write(&payload);
                }
                inflate.read()?
            }
            (true, None) => return Err(WebSocketError::CompressionNotSupported),
            (false, _) => match single {
                Some(payload) => payload.freeze(),
                // hand the accumulated buffer out and start a fresh one, so a single huge
                // message does not keep its allocation alive
                None => std::mem::replace(&mut self.accumulated, BytesMut::with_capacity(1024))
                    .freeze(),
            },
        };

        if payload.len() > self.max_read_buffer {
            return Err(WebSocketError::FrameTooLarge);
        }

        if fragment.kind == MessageKind::Text && self.check_utf8 && !is_utf8(&payload) {
            return Err(WebSocketError::InvalidUTF8);
        }

        Ok(Message {
            kind: fragment.kind,
            payload,
            is_compressed: fragment.is_compressed,
        })
    }
}

#[inline]
fn is_utf8(payload: &[u8]) -> bool {
    #[cfg(not(feature = "simd"))]
    return std::str::from_utf8(payload).is_ok();
    #[cfg(feature = "simd")]
    return simdutf8::basic::from_utf8(payload).is_ok();
}

// ================ WriteHalf ====================

/// Write half of the WebSocket connection, turning messages into frames.
///
/// It handles:
///
/// - Compression of outgoing messages when enabled, with RSV1 on the first frame only
/// - Fragmentation into frames of bounded size
///
/// Masking is left to the [`Encoder`](crate::codec::Encoder), which knows the role.
pub struct WriteHalf {
    deflate: Option<Deflater>,
}

impl WriteHalf {
    /// Creates the write half for an endpoint of the given role.
    ///
    /// A server deflates with its own context takeover flag, a client with the client's.
    pub fn new(role: Role, options: &Options) -> Self {
        let deflate = options.compression.as_ref().map(|config| {
            let no_context_takeover = match role {
                Role::Server => config.server_no_context_takeover,
                Role::Client => config.client_no_context_takeover,
            };

            #[cfg(feature = "logging")]
            log::debug!(
                "Established compressor for {role} with no_context_takeover={no_context_takeover}"
            );

            Deflater::new(config.level, no_context_takeover)
        });

        Self { deflate }
    }

    /// Whether outgoing messages are compressed.
    pub fn is_compressed(&self) -> bool {
        self.deflate.is_some()
    }

    /// Produces the frames carrying `message`.
    ///
    /// With compression the message is deflated once and the compressed payload is split. A
    /// `fragment_size` of `None`, or one not smaller than the payload, yields a single frame.
    pub fn frames(
        &mut self,
        message: &Message,
        fragment_size: Option<usize>,
    ) -> Result<Vec<Frame>> {
        if fragment_size == Some(0) {
            return Err(WebSocketError::InvalidArgument("fragment size must be positive"));
        }

        let (payload, is_compressed) = match self.deflate.as_mut() {
            Some(deflate) => (deflate.compress(&message.payload)?, true),
            None => (message.payload.clone(), false),
        };

        let opcode = message.opcode();
        let size = fragment_size.unwrap_or(usize::MAX).min(payload.len().max(1));

        if payload.len() <= size {
            return Ok(vec![frame(opcode, &payload, true, is_compressed)]);
        }

        let chunks = payload.chunks(size);
        let last = chunks.len() - 1;

        Ok(chunks
            .enumerate()
            .map(|(i, chunk)| match i {
                0 => frame(opcode, chunk, false, is_compressed),
                _ => frame(OpCode::Continuation, chunk, i == last, false),
            })
            .collect())
    }
}

fn frame(opcode: OpCode, payload: &[u8], fin: bool, is_compressed: bool) -> Frame {
    if is_compressed {
        Frame::compress(fin, opcode, None, payload)
    } else {
        Frame::new(fin, opcode, None, payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DeflateOptions;

    fn compressed() -> Options {
        Options::default().with_compression(DeflateOptions::default())
    }

    fn reassemble(read: &mut ReadHalf, frames: Vec<Frame>) -> Message {
        let mut message = None;
        for frame in frames {
            assert!(message.is_none(), "message completed before the last frame");
            message = read.on_frame(frame).unwrap();
        }
        message.expect("complete message")
    }

    #[test]
    fn test_single_frame() {
        let mut read = ReadHalf::new(Role::Server, &Options::default());
        let message = read.on_frame(Frame::text("hello")).unwrap().unwrap();
        assert_eq!(message, Message::text("hello"));
        assert!(!read.is_pending());
    }

    #[test]
    fn test_fragmented_message() {
        let mut read = ReadHalf::new(Role::Server, &Options::default());
        assert!(read
            .on_frame(Frame::binary("abc").with_fin(false))
            .unwrap()
            .is_none());
        assert!(read.is_pending());

        assert!(read
            .on_frame(Frame::continuation("def").with_fin(false))
            .unwrap()
            .is_none());
        let message = read.on_frame(Frame::continuation("gh")).unwrap().unwrap();

        assert_eq!(message.kind, MessageKind::Binary);
        assert_eq!(&message.payload[..], b"abcdefgh");
        assert!(!read.is_pending());
    }

    #[test]
    fn test_continuation_without_start() {
        let mut read = ReadHalf::new(Role::Server, &Options::default());
        assert!(matches!(
            read.on_frame(Frame::continuation("x")),
            Err(WebSocketError::InvalidContinuationFrame)
        ));
    }

    #[test]
    fn test_new_message_while_pending() {
        let mut read = ReadHalf::new(Role::Server, &Options::default());
        read.on_frame(Frame::text("a").with_fin(false)).unwrap();
        assert!(matches!(
            read.on_frame(Frame::text("b")),
            Err(WebSocketError::InvalidFragment)
        ));
    }

    #[test]
    fn test_invalid_utf8() {
        let mut read = ReadHalf::new(Role::Server, &Options::default());
        assert!(matches!(
            read.on_frame(Frame::text([0xff, 0xfe])),
            Err(WebSocketError::InvalidUTF8)
        ));

        let mut read = ReadHalf::new(Role::Server, &Options::default().with_utf8(false));
        assert!(read.on_frame(Frame::text([0xff, 0xfe])).unwrap().is_some());
    }

    #[test]
    fn test_utf8_split_across_fragments() {
        let bytes = "héllo".as_bytes();
        let mut read = ReadHalf::new(Role::Server, &Options::default());
        read.on_frame(Frame::text(&bytes[..2]).with_fin(false))
            .unwrap();
        let message = read.on_frame(Frame::continuation(&bytes[2..])).unwrap().unwrap();
        assert_eq!(message.as_text(), Some("héllo"));
    }

    #[test]
    fn test_read_buffer_limit() {
        let options = Options::default().with_max_read_buffer(8);
        let mut read = ReadHalf::new(Role::Server, &options);
        read.on_frame(Frame::binary([0u8; 6]).with_fin(false))
            .unwrap();
        assert!(matches!(
            read.on_frame(Frame::continuation([0u8; 6])),
            Err(WebSocketError::FrameTooLarge)
        ));
    }

    #[test]
    fn test_compressed_without_negotiation() {
        let mut read = ReadHalf::new(Role::Server, &Options::default());
        let frame = Frame::compress(true, OpCode::Text, None, &b"x"[..]);
        assert!(matches!(
            read.on_frame(frame),
            Err(WebSocketError::CompressionNotSupported)
        ));
    }

    #[test]
    fn test_write_single_frame() {
        let mut write = WriteHalf::new(Role::Server, &Options::default());
        let frames = write.frames(&Message::text("hello"), None).unwrap();
        assert_eq!(frames, vec![Frame::text("hello")]);

        let frames = write.frames(&Message::binary(""), Some(4)).unwrap();
        assert_eq!(frames, vec![Frame::binary("")]);
    }

    #[test]
    fn test_write_fragments() {
        let mut write = WriteHalf::new(Role::Client, &Options::default());
        let frames = write.frames(&Message::text("abcdefghij"), Some(4)).unwrap();

        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].opcode, OpCode::Text);
        assert!(!frames[0].fin);
        assert_eq!(frames[1].opcode, OpCode::Continuation);
        assert!(!frames[1].fin);
        assert_eq!(frames[2].opcode, OpCode::Continuation);
        assert!(frames[2].fin);
        assert_eq!(&frames[2].payload[..], b"ij");

        assert!(matches!(
            write.frames(&Message::text("x"), Some(0)),
            Err(WebSocketError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_compressed_fragments_round_trip() {
        let payload: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
        let mut write = WriteHalf::new(Role::Client, &compressed());
        let frames = write
            .frames(&Message::binary(payload.clone()), Some(512))
            .unwrap();

        assert!(frames.len() > 1);
        assert!(frames[0].is_compressed());
        assert!(frames[1..].iter().all(|frame| !frame.is_compressed()));

        let mut read = ReadHalf::new(Role::Server, &compressed());
        let message = reassemble(&mut read, frames);
        assert!(message.is_compressed);
        assert_eq!(&message.payload[..], &payload[..]);
    }

    #[test]
    fn test_context_takeover_per_direction() {
        let options = compressed().client_no_context_takeover();
        let message = Message::text("repeat repeat repeat repeat repeat");

        // the client resets its context, so the same message compresses the same way
        let mut client = WriteHalf::new(Role::Client, &options);
        let first = client.frames(&message, None).unwrap();
        let second = client.frames(&message, None).unwrap();
        assert_eq!(first, second);

        // the server keeps it, so the second copy is cheaper
        let mut server = WriteHalf::new(Role::Server, &options);
        let first = server.frames(&message, None).unwrap();
        let second = server.frames(&message, None).unwrap();
        assert!(second[0].payload.len() < first[0].payload.len());

        let mut read = ReadHalf::new(Role::Client, &options);
        assert_eq!(reassemble(&mut read, first).payload, message.payload);
        assert_eq!(reassemble(&mut read, second).payload, message.payload);
    }
}
