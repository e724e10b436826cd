//! HTTP/1.x response head encoder.
//!
//! Writes the status line and header fields. `Content-Length` is set from the
//! body length when one is given, kept as the caller set it when the body is
//! omitted, and stripped for statuses that must not carry one (1xx, 204).

use std::io;
use std::io::Write;

use bytes::{BufMut, BytesMut};
use http::{HeaderValue, StatusCode, Version, header};
use tokio_util::codec::Encoder;
use tracing::error;

use crate::protocol::{ResponseHead, SendError};

/// Initial buffer size allocated for header serialization
const INIT_HEADER_SIZE: usize = 4 * 1024;

/// Encodes a [`ResponseHead`] together with the length of the body that
/// follows it, or `None` when no body follows.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeaderEncoder;

impl Encoder<(ResponseHead, Option<u64>)> for HeaderEncoder {
    type Error = SendError;

    fn encode(&mut self, item: (ResponseHead, Option<u64>), dst: &mut BytesMut) -> Result<(), Self::Error> {
        let (mut head, body_len) = item;

        let version = match head.version() {
            Version::HTTP_11 => "HTTP/1.1",
            Version::HTTP_10 => "HTTP/1.0",
            v => {
                error!(http_version = ?v, "unsupported http version");
                return Err(SendError::UnsupportedVersion(v));
            }
        };

        dst.reserve(INIT_HEADER_SIZE);
        let status = head.status();
        write!(BufWriter(dst), "{version} {} {}\r\n", status.as_str(), status.canonical_reason().unwrap_or(""))?;

        let headers = head.headers_mut();
        headers.remove(header::TRANSFER_ENCODING);
        if forbids_length(status) {
            headers.remove(header::CONTENT_LENGTH);
        } else if let Some(body_len) = body_len {
            headers.insert(header::CONTENT_LENGTH, HeaderValue::from(body_len));
        }

        for (name, value) in head.headers() {
            dst.put_slice(name.as_ref());
            dst.put_slice(b": ");
            dst.put_slice(value.as_ref());
            dst.put_slice(b"\r\n");
        }
        dst.put_slice(b"\r\n");
        Ok(())
    }
}

fn forbids_length(status: StatusCode) -> bool {
    status.is_informational() || status == StatusCode::NO_CONTENT
}

/// `io::Write` adapter so `write!` can format straight into the buffer.
struct BufWriter<'a>(&'a mut BytesMut);

impl Write for BufWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.put_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
