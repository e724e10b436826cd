//! Streaming body encoders that can be recycled through a pool.
//!
//! Each encoder writes its compressed output into an owned [`Writer`] buffer.
//! [`StreamEncoder::reset`] restarts the stream while keeping the buffer's
//! allocation, so a pooled encoder behaves exactly like a fresh one.

use std::io::{self, Write};
use std::mem;

use brotli::CompressorWriter;
use bytes::{BufMut, Bytes, BytesMut};
use flate2::write::{DeflateEncoder, ZlibEncoder};
use flate2::{Compression, Crc};
use tracing::trace;

use super::Encoding;

const BROTLI_BUFFER_SIZE: usize = 4 * 1024;
const BROTLI_LGWIN: u32 = 22;

/// In-memory sink the encoders write into.
#[derive(Debug, Default)]
pub(crate) struct Writer {
    buf: BytesMut,
}

impl Writer {
    fn new() -> Self {
        Self { buf: BytesMut::with_capacity(4096) }
    }

    fn take(&mut self) -> Bytes {
        self.buf.split().freeze()
    }

    fn clear(&mut self) {
        self.buf.clear();
    }
}

impl io::Write for Writer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// A compression stream for one response body.
pub enum StreamEncoder {
    /// RFC 1952 framing around a raw deflate stream.
    Gzip(GzipStream),
    /// `Content-Encoding: deflate` is the zlib format (RFC 1950).
    Deflate(DeflateStream),
    Brotli(BrotliStream),
}

pub struct GzipStream {
    inner: DeflateEncoder<Writer>,
    crc: Crc,
    level: u32,
}

pub struct DeflateStream {
    inner: ZlibEncoder<Writer>,
    level: u32,
}

pub struct BrotliStream {
    inner: Option<Box<CompressorWriter<Writer>>>,
    level: u32,
}

impl StreamEncoder {
    /// Creates an encoder; `level` must already be validated for `encoding`.
    pub fn new(encoding: Encoding, level: u32) -> Self {
        match encoding {
            Encoding::Gzip => {
                let mut writer = Writer::new();
                writer.buf.put_slice(&gzip_header(level));
                Self::Gzip(GzipStream {
                    inner: DeflateEncoder::new(writer, Compression::new(level)),
                    crc: Crc::new(),
                    level,
                })
            }
            Encoding::Deflate => {
                Self::Deflate(DeflateStream { inner: ZlibEncoder::new(Writer::new(), Compression::new(level)), level })
            }
            Encoding::Brotli => Self::Brotli(BrotliStream { inner: Some(brotli_writer(Writer::new(), level)), level }),
        }
    }

    pub fn encoding(&self) -> Encoding {
        match self {
            Self::Gzip(_) => Encoding::Gzip,
            Self::Deflate(_) => Encoding::Deflate,
            Self::Brotli(_) => Encoding::Brotli,
        }
    }

    pub fn write(&mut self, data: &[u8]) -> io::Result<()> {
        let result = match self {
            Self::Gzip(gzip) => {
                gzip.crc.update(data);
                gzip.inner.write_all(data)
            }
            Self::Deflate(deflate) => deflate.inner.write_all(data),
            Self::Brotli(brotli) => brotli.writer()?.write_all(data),
        };
        if let Err(e) = &result {
            trace!(encoding = self.encoding().as_str(), cause = %e, "error encoding body");
        }
        result
    }

    /// Ends the stream and returns every compressed byte produced since the last reset.
    ///
    /// The encoder must be [`reset`](Self::reset) before it is written again.
    pub fn finish(&mut self) -> io::Result<Bytes> {
        match self {
            Self::Gzip(gzip) => {
                gzip.inner.try_finish()?;
                let (sum, amount) = (gzip.crc.sum(), gzip.crc.amount());
                let writer = gzip.inner.get_mut();
                writer.buf.put_u32_le(sum);
                writer.buf.put_u32_le(amount);
                Ok(writer.take())
            }
            Self::Deflate(deflate) => {
                deflate.inner.try_finish()?;
                Ok(deflate.inner.get_mut().take())
            }
            Self::Brotli(brotli) => {
                let mut writer = brotli.inner.take().map_or_else(Writer::new, |w| w.into_inner());
                let out = writer.take();
                brotli.inner = Some(brotli_writer(writer, brotli.level));
                Ok(out)
            }
        }
    }

    /// Discards the current stream and starts a new one, reusing the buffer.
    pub fn reset(&mut self) {
        match self {
            Self::Gzip(gzip) => {
                let level = gzip.level;
                let recycled = mem::take(gzip.inner.get_mut());
                if gzip.inner.reset(recycled).is_err() {
                    *self = Self::new(Encoding::Gzip, level);
                    return;
                }
                let writer = gzip.inner.get_mut();
                writer.clear();
                writer.buf.put_slice(&gzip_header(gzip.level));
                gzip.crc.reset();
            }
            Self::Deflate(deflate) => {
                let level = deflate.level;
                let recycled = mem::take(deflate.inner.get_mut());
                if deflate.inner.reset(recycled).is_err() {
                    *self = Self::new(Encoding::Deflate, level);
                    return;
                }
                deflate.inner.get_mut().clear();
            }
            Self::Brotli(brotli) => {
                let mut writer = brotli.inner.take().map_or_else(Writer::new, |w| w.into_inner());
                writer.clear();
                brotli.inner = Some(brotli_writer(writer, brotli.level));
            }
        }
    }
}

impl BrotliStream {
    fn writer(&mut self) -> io::Result<&mut CompressorWriter<Writer>> {
        self.inner.as_deref_mut().ok_or_else(|| io::Error::other("brotli stream already finished"))
    }
}

fn brotli_writer(writer: Writer, level: u32) -> Box<CompressorWriter<Writer>> {
    Box::new(CompressorWriter::new(writer, BROTLI_BUFFER_SIZE, level, BROTLI_LGWIN))
}

/// Fixed gzip member header: no name, no mtime, unknown OS.
fn gzip_header(level: u32) -> [u8; 10] {
    let xfl = match level {
        9.. => 2,
        0..=1 => 4,
        _ => 0,
    };
    [0x1f, 0x8b, 0x08, 0x00, 0x00, 0x00, 0x00, 0x00, xfl, 0xff]
}

impl std::fmt::Debug for StreamEncoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("StreamEncoder").field(&self.encoding()).finish()
    }
}

impl std::fmt::Debug for GzipStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GzipStream").field("level", &self.level).finish_non_exhaustive()
    }
}

impl std::fmt::Debug for DeflateStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeflateStream").field("level", &self.level).finish_non_exhaustive()
    }
}

impl std::fmt::Debug for BrotliStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrotliStream").field("level", &self.level).finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn body() -> Vec<u8> {
        b"the quick brown fox jumps over the lazy dog. ".repeat(64)
    }

    fn encode(encoder: &mut StreamEncoder, chunks: &[&[u8]]) -> Bytes {
        for chunk in chunks {
            encoder.write(chunk).unwrap();
        }
        encoder.finish().unwrap()
    }

    fn decode(encoding: Encoding, data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        match encoding {
            Encoding::Gzip => flate2::read::GzDecoder::new(data).read_to_end(&mut out),
            Encoding::Deflate => flate2::read::ZlibDecoder::new(data).read_to_end(&mut out),
            Encoding::Brotli => brotli::Decompressor::new(data, 4096).read_to_end(&mut out),
        }
        .unwrap();
        out
    }

    #[test]
    fn recycled_encoder_matches_fresh() {
        let body = body();
        for encoding in [Encoding::Gzip, Encoding::Deflate, Encoding::Brotli] {
            let fresh = encode(&mut StreamEncoder::new(encoding, 6), &[&body]);

            // finished stream, then reset
            let mut recycled = StreamEncoder::new(encoding, 6);
            encode(&mut recycled, &[b"previous response"]);
            recycled.reset();
            assert_eq!(encode(&mut recycled, &[&body]), fresh, "{encoding:?} after finish");

            // abandoned half-written stream, then reset
            recycled.reset();
            recycled.write(b"discarded").unwrap();
            recycled.reset();
            assert_eq!(encode(&mut recycled, &[&body]), fresh, "{encoding:?} after abandon");
        }
    }

    #[test]
    fn output_decodes_to_input() {
        let body = body();
        let (head, tail) = body.split_at(100);
        for encoding in [Encoding::Gzip, Encoding::Deflate, Encoding::Brotli] {
            let compressed = encode(&mut StreamEncoder::new(encoding, 6), &[head, tail]);
            assert!(compressed.len() < body.len());
            assert_eq!(decode(encoding, &compressed), body, "{encoding:?}");
        }
    }

    #[test]
    fn empty_body_is_a_valid_stream() {
        for encoding in [Encoding::Gzip, Encoding::Deflate, Encoding::Brotli] {
            let compressed = encode(&mut StreamEncoder::new(encoding, 6), &[]);
            assert!(decode(encoding, &compressed).is_empty(), "{encoding:?}");
        }
    }
}
