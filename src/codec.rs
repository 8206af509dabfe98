//! # Codec
//!
//! [`tokio_util::codec`] implementation of the frame layer. The [`Decoder`] turns bytes into
//! [`Frame`]s with their payload unmasked, the [`Encoder`] writes frames, masking them with a
//! fresh key when acting as a client.
use bytes::{Buf, BytesMut};
use tokio_util::codec;

use crate::{
    frame::{self, Frame, MAX_CONTROL_PAYLOAD, MAX_HEAD_SIZE},
    pool::Resources,
    OpCode, Role, WebSocketError,
};

/// Represents the reading state of a WebSocket frame.
enum ReadState {
    /// Currently reading the header of the frame.
    Header(Header),
    /// Currently reading the payload of the frame.
    Payload(HeaderAndMask),
}

/// Represents the initial header fields of a WebSocket frame.
struct Header {
    /// Indicates if this is the final fragment in a message.
    fin: bool,
    /// Compression flag indicating if payload is compressed.
    rsv1: bool,
    /// Indicates if the frame is masked.
    masked: bool,
    /// The operation code of the frame.
    opcode: OpCode,
    /// Additional length of the frame, if applicable.
    extra: usize,
    /// Encoded length of the payload.
    length_code: u8,
    /// Total size of the remaining header in bytes.
    header_size: usize,
}

/// Contains header and mask data after decoding the bytes before the payload.
struct HeaderAndMask {
    header: Header,
    mask: Option<[u8; 4]>,
    payload_len: usize,
}

/// A combined codec that provides both encoding and decoding functionality for WebSocket frames.
///
/// This codec can be used with Tokio's framed streams to handle WebSocket protocol
/// frame encoding and decoding on a single stream.
pub struct Codec {
    decoder: Decoder,
    encoder: Encoder,
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

    #[inline]
    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        self.decoder.decode_eof(src)
    }
}

impl codec::Encoder<Frame> for Codec {
    type Error = <Encoder as codec::Encoder<Frame>>::Error;

    #[inline]
    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        self.encoder.encode(item, dst)
    }
}

/// A decoder for WebSocket frames, handling state transitions.
///
/// `Decoder` tracks the maximum allowed payload size and the current read state, which
/// changes as each part of the frame (header, extended length and mask, payload) is processed.
pub struct Decoder {
    /// Role of the local endpoint; decides which masking is acceptable.
    role: Role,
    /// Current reading state (header or payload).
    state: Option<ReadState>,
    /// Maximum allowed size for the frame payload.
    max_payload_size: usize,
}

impl Decoder {
    /// Creates a new `Decoder` for an endpoint of the given role.
    ///
    /// Frames whose payload exceeds `max_payload_size` are rejected.
    pub fn new(role: Role, max_payload_size: usize) -> Self {
        Self {
            role,
            state: None,
            max_payload_size,
        }
    }
}

impl codec::Decoder for Decoder {
    type Item = Frame;
    type Error = WebSocketError;

    /// Decodes WebSocket frames from a `BytesMut` buffer, managing header and payload parsing.
    ///
    /// The header and payload are parsed in stages, keeping state across calls. Control frame
    /// rules, masking rules, payload limits and reserved bits are validated here. The returned
    /// frame has its payload unmasked while keeping its mask key.
    ///
    /// # Returns
    /// - `Ok(Some(Frame))`: Returns a fully decoded `Frame` when successful.
    /// - `Ok(None)`: Indicates more data is needed to complete the frame.
    /// - `Err(WebSocketError)`: If a protocol violation or invalid frame structure is detected.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match self.state.take() {
                None => {
                    if src.remaining() < 2 {
                        return Ok(None);
                    }

                    let fin = src[0] & 0b10000000 != 0;
                    let rsv1 = src[0] & 0b01000000 != 0;

                    if src[0] & 0b00110000 != 0 {
                        return Err(WebSocketError::ReservedBitsNotZero);
                    }

                    let opcode = frame::OpCode::try_from(src[0] & 0b00001111)?;
                    let masked = src[1] & 0b10000000 != 0;
                    let length_code = src[1] & 0x7F;

                    // RSV1 is only meaningful on the first frame of a data message
                    if rsv1 && (opcode.is_control() || opcode == OpCode::Continuation) {
                        return Err(WebSocketError::ReservedBitsNotZero);
                    }

                    match (self.role, masked) {
                        (Role::Server, false) | (Role::Client, true) => {
                            return Err(WebSocketError::InvalidMasking)
                        }
                        _ => {}
                    }

                    let extra = match length_code {
                        126 => 2,
                        127 => 8,
                        _ => 0,
                    };
                    let header_size = extra + masked as usize * 4;
                    src.advance(2);

                    self.state = Some(ReadState::Header(Header {
                        fin,
                        rsv1,
                        masked,
                        opcode,
                        length_code,
                        extra,
                        header_size,
                    }));
                }
                Some(ReadState::Header(header)) => {
                    if src.remaining() < header.header_size {
                        self.state = Some(ReadState::Header(header));
                        return Ok(None);
                    }

                    let payload_len: usize = match header.extra {
                        0 => usize::from(header.length_code),
                        2 => src.get_u16() as usize,
                        _ => usize::try_from(src.get_u64())
                            .map_err(|_| WebSocketError::FrameTooLarge)?,
                    };

                    let mask = if header.masked {
                        Some(src.get_u32().to_be_bytes())
                    } else {
                        None
                    };

                    if header.opcode.is_control() {
                        if !header.fin {
                            return Err(WebSocketError::ControlFrameFragmented);
                        }
                        if payload_len > MAX_CONTROL_PAYLOAD {
                            return Err(WebSocketError::ControlFrameTooLarge);
                        }
                    }
                    if payload_len > self.max_payload_size {
                        return Err(WebSocketError::FrameTooLarge);
                    }

                    self.state = Some(ReadState::Payload(HeaderAndMask {
                        header,
                        mask,
                        payload_len,
                    }));
                }
                Some(ReadState::Payload(header_and_mask)) => {
                    if src.remaining() < header_and_mask.payload_len {
                        // reserve up front so large payloads don't reallocate per read
                        src.reserve(header_and_mask.payload_len - src.remaining());
                        self.state = Some(ReadState::Payload(header_and_mask));
                        return Ok(None);
                    }

                    let HeaderAndMask {
                        header,
                        mask,
                        payload_len,
                    } = header_and_mask;

                    let mut payload = src.split_to(payload_len);
                    if let Some(mask) = mask {
                        crate::mask::apply_mask(&mut payload, mask);
                    }

                    let mut frame = Frame::new(header.fin, header.opcode, mask, payload);
                    frame.is_compressed = header.rsv1;

                    break Ok(Some(frame));
                }
            }
        }
    }

    /// Called once the stream reached end-of-data.
    ///
    /// A partially received frame at that point means the declared length did not match the
    /// data available, which is reported as [`WebSocketError::UnexpectedEof`].
    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() && self.state.is_none() => Ok(None),
            None => Err(WebSocketError::UnexpectedEof),
        }
    }
}

/// WebSocket frame encoder for serializing `Frame` instances into a buffer.
///
/// A client-side encoder masks every frame, using the frame's own key if it has one and a
/// fresh key from the [`Resources`] random source otherwise. A server-side encoder never masks.
pub struct Encoder {
    role: Role,
    resources: Resources,
}

impl Encoder {
    /// Creates an encoder for an endpoint of the given role.
    pub fn new(role: Role, resources: Resources) -> Self {
        Self { role, resources }
    }

    /// Writes one frame of a message.
    ///
    /// RSV1 is set only when `is_compressed && is_first_frame`, as RFC 7692 marks only the
    /// first fragment of a compressed message.
    pub fn write(
        &mut self,
        dst: &mut BytesMut,
        opcode: OpCode,
        payload: &[u8],
        is_last_frame: bool,
        is_compressed: bool,
        is_first_frame: bool,
    ) -> Result<(), WebSocketError> {
        let frame = if is_compressed && is_first_frame {
            Frame::compress(is_last_frame, opcode, None, payload)
        } else {
            Frame::new(is_last_frame, opcode, None, payload)
        };
        codec::Encoder::encode(self, frame, dst)
    }
}

impl codec::Encoder<Frame> for Encoder {
    type Error = WebSocketError;

    /// Encodes a `Frame` into the provided buffer.
    ///
    /// The frame header is formatted first, then the payload is appended and, for clients,
    /// masked in place inside `dst`.
    fn encode(&mut self, mut frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let mask = match self.role {
            Role::Client => Some(frame.mask_key().unwrap_or_else(|| self.resources.mask_key())),
            Role::Server => None,
        };
        frame.set_mask(mask);

        let mut header = [0; MAX_HEAD_SIZE];
        let size = frame.fmt_head(&mut header[..]);

        dst.reserve(size + frame.payload.len());
        dst.extend_from_slice(&header[..size]);

        let start = dst.len();
        dst.extend_from_slice(&frame.payload);
        if let Some(mask) = mask {
            crate::mask::apply_mask(&mut dst[start..], mask);
        }

        Ok(())
    }
}
