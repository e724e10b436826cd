//! Framing for connections that negotiated permessage-deflate.
//!
//! Compressed data frames carry RSV1, which the general WebSocket transport
//! refuses, so these sessions are framed with [`FrameCodec`] and every
//! message is inflated or deflated here with no context takeover.

use bytes::{Bytes, BytesMut};
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};
use futures::{SinkExt, StreamExt};
use suna_http::codec::FrameCodec;
use suna_http::protocol::{Frame, OpCode};
use tokio_util::codec::{Framed, FramedParts};
use tracing::{debug, trace};

use crate::Connection;
use crate::pool::Pooled;
use crate::websocket::conn::{Message, WebSocketError};
use crate::websocket::WebSocketOptions;

/// Appended to a compressed message before inflating, stripped after deflating.
pub(crate) const DEFLATE_TAIL: [u8; 4] = [0x00, 0x00, 0xff, 0xff];

/// A message being reassembled from fragments.
struct Partial {
    opcode: OpCode,
    compressed: bool,
    payload: BytesMut,
}

pub(crate) struct DeflateStream {
    framed: Framed<Connection, FrameCodec>,
    max_message_size: usize,
    write_buffer: Pooled<Vec<u8>>,
    partial: Option<Partial>,
}

impl DeflateStream {
    pub(crate) fn new(
        conn: Connection,
        leftover: BytesMut,
        options: &WebSocketOptions,
        write_buffer: Pooled<Vec<u8>>,
    ) -> Self {
        let codec = FrameCodec::new(options.max_message_size).with_compression(true);
        let mut parts = FramedParts::new::<Frame>(conn, codec);
        parts.read_buf = leftover;
        parts.read_buf.reserve(options.read_buffer_size);
        parts.write_buf = BytesMut::with_capacity(options.write_buffer_size);

        Self { framed: Framed::from_parts(parts), max_message_size: options.max_message_size, write_buffer, partial: None }
    }

    /// Reads frames until a data or close message is complete. Pings are
    /// answered and a close from the peer is echoed.
    pub(crate) async fn recv(&mut self) -> Result<Option<Message>, WebSocketError> {
        loop {
            let Some(frame) = self.framed.next().await.transpose()? else {
                debug!("websocket peer went away");
                return Ok(None);
            };
            trace!(opcode = ?frame.opcode, fin = frame.fin, len = frame.payload.len(), "websocket frame");

            match frame.opcode {
                OpCode::Ping => self.framed.send(Frame::new(OpCode::Pong, frame.payload)).await?,
                OpCode::Pong => {}
                OpCode::Close => {
                    let reason = frame.close_reason();
                    self.framed.send(Frame::new(OpCode::Close, frame.payload)).await?;
                    return Ok(Some(Message::Close(reason)));
                }
                OpCode::Text | OpCode::Binary => {
                    if self.partial.is_some() {
                        return Err(WebSocketError::Protocol("new message started inside a fragmented one"));
                    }
                    let partial = Partial {
                        opcode: frame.opcode,
                        compressed: frame.compressed,
                        payload: BytesMut::from(&frame.payload[..]),
                    };
                    if let Some(message) = self.push(partial, frame.fin)? {
                        return Ok(Some(message));
                    }
                }
                OpCode::Continuation => {
                    let Some(mut partial) = self.partial.take() else {
                        return Err(WebSocketError::Protocol("continuation frame without a message"));
                    };
                    partial.payload.extend_from_slice(&frame.payload);
                    if let Some(message) = self.push(partial, frame.fin)? {
                        return Ok(Some(message));
                    }
                }
            }
        }
    }

    fn push(&mut self, partial: Partial, fin: bool) -> Result<Option<Message>, WebSocketError> {
        if partial.payload.len() > self.max_message_size {
            return Err(WebSocketError::TooLarge { max_size: self.max_message_size });
        }
        if !fin {
            self.partial = Some(partial);
            return Ok(None);
        }

        let payload = if partial.compressed { self.inflate(&partial.payload)? } else { partial.payload.freeze() };
        let message = match partial.opcode {
            OpCode::Text => Message::Text(String::from_utf8(payload.to_vec())?),
            _ => Message::Binary(payload),
        };
        Ok(Some(message))
    }

    /// Inflates one message; every message starts from a fresh window.
    fn inflate(&self, data: &[u8]) -> Result<Bytes, WebSocketError> {
        let mut input = Vec::with_capacity(data.len() + DEFLATE_TAIL.len());
        input.extend_from_slice(data);
        input.extend_from_slice(&DEFLATE_TAIL);

        let mut inflater = Decompress::new(false);
        let mut output = Vec::with_capacity(data.len() * 2 + 64);
        loop {
            let consumed = inflater.total_in() as usize;
            let produced = inflater.total_out();
            if output.len() == output.capacity() {
                output.reserve(output.capacity());
            }
            let status = inflater.decompress_vec(&input[consumed..], &mut output, FlushDecompress::Sync)?;
            if output.len() > self.max_message_size {
                return Err(WebSocketError::TooLarge { max_size: self.max_message_size });
            }

            let done = inflater.total_in() as usize == input.len() && output.len() < output.capacity();
            let stuck = inflater.total_in() as usize == consumed && inflater.total_out() == produced;
            if done || status == Status::StreamEnd || (stuck && output.len() < output.capacity()) {
                break;
            }
        }
        Ok(Bytes::from(output))
    }

    /// Deflates one message into the pooled write buffer, without the sync-flush tail.
    fn deflate(&mut self, data: &[u8]) -> Result<Bytes, WebSocketError> {
        let buffer = &mut *self.write_buffer;
        buffer.clear();

        let mut deflater = Compress::new(Compression::default(), false);
        loop {
            let consumed = deflater.total_in() as usize;
            if buffer.capacity() - buffer.len() < 64 {
                buffer.reserve(data.len() / 2 + 64);
            }
            deflater.compress_vec(&data[consumed..], buffer, FlushCompress::Sync)?;
            if deflater.total_in() as usize == data.len() && buffer.len() < buffer.capacity() {
                break;
            }
        }

        if buffer.ends_with(&DEFLATE_TAIL) {
            buffer.truncate(buffer.len() - DEFLATE_TAIL.len());
        }
        Ok(Bytes::copy_from_slice(buffer))
    }

    /// Sends a data or control message; data payloads go out compressed.
    pub(crate) async fn send(&mut self, message: Message) -> Result<(), WebSocketError> {
        let frame = match message {
            Message::Text(text) => self.data_frame(OpCode::Text, Bytes::from(text))?,
            Message::Binary(data) => self.data_frame(OpCode::Binary, data)?,
            Message::Ping(data) => Frame::new(OpCode::Ping, data),
            Message::Pong(data) => Frame::new(OpCode::Pong, data),
            Message::Close(reason) => {
                let (code, reason) = reason.unwrap_or((1000, String::new()));
                Frame::close(code, &reason)
            }
        };
        self.framed.send(frame).await?;
        Ok(())
    }

    fn data_frame(&mut self, opcode: OpCode, payload: Bytes) -> Result<Frame, WebSocketError> {
        if payload.is_empty() {
            return Ok(Frame::new(opcode, payload));
        }
        let mut frame = Frame::new(opcode, self.deflate(&payload)?);
        frame.compressed = true;
        Ok(frame)
    }

    /// Sends a close frame and waits for the peer's.
    pub(crate) async fn close(&mut self, code: u16, reason: &str) -> Result<(), WebSocketError> {
        self.framed.send(Frame::close(code, reason)).await?;

        while let Some(frame) = self.framed.next().await {
            match frame {
                Ok(frame) if frame.opcode == OpCode::Close => break,
                Ok(_) => {}
                Err(e) => {
                    debug!(cause = %e, "error while waiting for close frame");
                    break;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::Pool;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, duplex};

    const MASK: [u8; 4] = [0x37, 0xfa, 0x21, 0x3d];

    fn client_frame(first: u8, payload: &[u8]) -> Vec<u8> {
        let mut frame = vec![first, 0x80 | u8::try_from(payload.len()).unwrap()];
        frame.extend_from_slice(&MASK);
        frame.extend(payload.iter().enumerate().map(|(i, b)| b ^ MASK[i % 4]));
        frame
    }

    fn open(max_message_size: usize) -> (DuplexStream, DeflateStream) {
        let (client, server_side) = duplex(64 * 1024);
        let options = WebSocketOptions { max_message_size, ..Default::default() };
        let pool = Pool::new(4, Vec::new);
        let stream = DeflateStream::new(Connection::new(server_side, None, None), BytesMut::new(), &options, pool.checkout());
        (client, stream)
    }

    async fn read_n(client: &mut DuplexStream, n: usize) -> Vec<u8> {
        let mut buf = vec![0u8; n];
        client.read_exact(&mut buf).await.unwrap();
        buf
    }

    #[tokio::test]
    async fn compressed_round_trip() {
        let (mut client, mut stream) = open(1024);
        // "Hello" deflated with no context takeover, sync-flush tail removed
        client.write_all(&client_frame(0xC1, &[0xf2, 0x48, 0xcd, 0xc9, 0xc9, 0x07, 0x00])).await.unwrap();
        assert_eq!(stream.recv().await.unwrap(), Some(Message::Text("Hello".to_owned())));

        stream.send(Message::Text("Hello".to_owned())).await.unwrap();
        let head = read_n(&mut client, 2).await;
        assert_eq!(head[0], 0xC1);
        let mut payload = read_n(&mut client, usize::from(head[1])).await;
        payload.extend_from_slice(&DEFLATE_TAIL);

        let mut inflater = Decompress::new(false);
        let mut plain = Vec::with_capacity(64);
        inflater.decompress_vec(&payload, &mut plain, FlushDecompress::Sync).unwrap();
        assert_eq!(plain, b"Hello");
    }

    #[tokio::test]
    async fn uncompressed_frames_pass_through() {
        let (mut client, mut stream) = open(1024);
        let mut bytes = client_frame(0x01, b"Hel");
        bytes.extend(client_frame(0x89, b"p"));
        bytes.extend(client_frame(0x80, b"lo"));
        client.write_all(&bytes).await.unwrap();

        assert_eq!(stream.recv().await.unwrap(), Some(Message::Text("Hello".to_owned())));
        assert_eq!(read_n(&mut client, 3).await, b"\x8a\x01p");
    }

    #[tokio::test]
    async fn close_is_echoed() {
        let (mut client, mut stream) = open(1024);
        client.write_all(&client_frame(0x88, b"\x03\xe8bye")).await.unwrap();

        assert_eq!(stream.recv().await.unwrap(), Some(Message::Close(Some((1000, "bye".to_owned())))));
        assert_eq!(read_n(&mut client, 7).await, b"\x88\x05\x03\xe8bye");
    }

    #[tokio::test]
    async fn inflated_size_is_bounded() {
        let (mut client, mut stream) = open(16);
        // 64 times "a", six bytes on the wire
        client.write_all(&client_frame(0xC2, &[0x4a, 0x4c, 0xa4, 0x0c, 0x00, 0x00])).await.unwrap();
        assert!(matches!(stream.recv().await, Err(WebSocketError::TooLarge { max_size: 16 })));
    }

    #[tokio::test]
    async fn stray_continuation_fails() {
        let (mut client, mut stream) = open(1024);
        client.write_all(&client_frame(0x80, b"x")).await.unwrap();
        assert!(matches!(stream.recv().await, Err(WebSocketError::Protocol(_))));
    }
}
