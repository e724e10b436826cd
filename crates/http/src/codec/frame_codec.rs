//! WebSocket frame codec for the server side of a connection.
//!
//! Incoming frames must be masked (clients always mask), outgoing frames are
//! never masked. RSV1 is accepted only when permessage-deflate was negotiated
//! and only on data frames.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

use crate::ensure;
use crate::protocol::{Frame, FrameError, OpCode};

const FIN: u8 = 0x80;
const RSV1: u8 = 0x40;
const RSV2_3: u8 = 0x30;
const MASK: u8 = 0x80;
const MAX_CONTROL_PAYLOAD: u64 = 125;

#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_payload: usize,
    compression: bool,
}

impl FrameCodec {
    pub fn new(max_payload: usize) -> Self {
        Self { max_payload, compression: false }
    }

    /// Allows RSV1 on incoming data frames.
    pub fn with_compression(mut self, compression: bool) -> Self {
        self.compression = compression;
        self
    }

    pub fn max_payload(&self) -> usize {
        self.max_payload
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 2 {
            return Ok(None);
        }

        let first = src[0];
        let second = src[1];
        let fin = first & FIN != 0;
        let rsv1 = first & RSV1 != 0;
        let opcode = OpCode::try_from(first & 0x0F)?;

        ensure!(first & RSV2_3 == 0, FrameError::ReservedBits);
        ensure!(!rsv1 || (self.compression && !opcode.is_control()), FrameError::ReservedBits);
        ensure!(second & MASK != 0, FrameError::UnmaskedFrame);

        let (payload_len, len_bytes) = match second & 0x7F {
            126 => {
                if src.len() < 4 {
                    return Ok(None);
                }
                (u64::from(u16::from_be_bytes([src[2], src[3]])), 2)
            }
            127 => {
                if src.len() < 10 {
                    return Ok(None);
                }
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&src[2..10]);
                (u64::from_be_bytes(raw), 8)
            }
            n => (u64::from(n), 0),
        };

        if opcode.is_control() {
            ensure!(fin && payload_len <= MAX_CONTROL_PAYLOAD, FrameError::InvalidControlFrame);
        }
        ensure!(
            payload_len <= self.max_payload as u64,
            FrameError::TooLargePayload { size: payload_len, max_size: self.max_payload }
        );

        let head_len = 2 + len_bytes + 4;
        // bounded by max_payload above
        let payload_len = payload_len as usize;
        if src.len() < head_len + payload_len {
            src.reserve(head_len + payload_len - src.len());
            return Ok(None);
        }

        let mut mask = [0u8; 4];
        mask.copy_from_slice(&src[head_len - 4..head_len]);
        src.advance(head_len);

        let mut payload = src.split_to(payload_len);
        for (i, byte) in payload.iter_mut().enumerate() {
            *byte ^= mask[i & 3];
        }

        trace!(?opcode, fin, compressed = rsv1, len = payload_len, "decoded websocket frame");
        Ok(Some(Frame { fin, compressed: rsv1, opcode, payload: payload.freeze() }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let len = frame.payload.len();
        if frame.opcode.is_control() {
            ensure!(frame.fin && len as u64 <= MAX_CONTROL_PAYLOAD, FrameError::InvalidControlFrame);
        }

        let mut first = frame.opcode.as_u8();
        if frame.fin {
            first |= FIN;
        }
        if frame.compressed {
            first |= RSV1;
        }

        dst.reserve(10 + len);
        dst.put_u8(first);
        match len {
            0..=125 => dst.put_u8(len as u8),
            126..=0xFFFF => {
                dst.put_u8(126);
                dst.put_u16(len as u16);
            }
            _ => {
                dst.put_u8(127);
                dst.put_u64(len as u64);
            }
        }
        dst.put_slice(&frame.payload);
        Ok(())
    }
}
