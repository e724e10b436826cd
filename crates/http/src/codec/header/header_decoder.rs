//! HTTP request head decoder.
//!
//! Parses the request line and header fields with `httparse`, records the byte
//! ranges of every name and value, then slices them out of one frozen buffer so
//! header values share the original allocation.
//!
//! Limits: 64 header fields, 8 KiB for the whole head. HTTP/1.0 and HTTP/1.1 only.

use std::mem::MaybeUninit;

use bytes::BytesMut;
use http::{HeaderName, HeaderValue, Request, Version};
use httparse::{Error, Status};
use tokio_util::codec::Decoder;
use tracing::trace;

use crate::ensure;
use crate::protocol::{ParseError, PayloadSize, RequestHeader};

/// Maximum number of headers allowed in a request
pub const MAX_HEADER_NUM: usize = 64;

/// Maximum size in bytes allowed for the entire header section
pub const MAX_HEADER_BYTES: usize = 8 * 1024;

/// Decodes a request head and tells the caller how the body is framed.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeaderDecoder;

impl Decoder for HeaderDecoder {
    type Item = (RequestHeader, PayloadSize);
    type Error = ParseError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // too short to hold a request line and the blank line after it
        if src.len() < 14 {
            return Ok(None);
        }

        let mut req = httparse::Request::new(&mut []);
        let mut headers = [const { MaybeUninit::<httparse::Header>::uninit() }; MAX_HEADER_NUM];

        let status = req.parse_with_uninit_headers(src, &mut headers).map_err(|e| match e {
            Error::TooManyHeaders => ParseError::too_many_headers(MAX_HEADER_NUM),
            e => ParseError::invalid_header(e.to_string()),
        })?;

        let head_len = match status {
            Status::Complete(head_len) => head_len,
            Status::Partial => {
                ensure!(src.len() <= MAX_HEADER_BYTES, ParseError::too_large_header(src.len(), MAX_HEADER_BYTES));
                return Ok(None);
            }
        };

        trace!(head_len, "parsed request head");
        ensure!(head_len <= MAX_HEADER_BYTES, ParseError::too_large_header(head_len, MAX_HEADER_BYTES));

        let version = match req.version {
            Some(0) => Version::HTTP_10,
            Some(1) => Version::HTTP_11,
            other => return Err(ParseError::InvalidVersion(other)),
        };

        let mut builder = Request::builder()
            .method(req.method.ok_or(ParseError::InvalidMethod)?)
            .uri(req.path.ok_or(ParseError::InvalidUri)?)
            .version(version);

        let header_count = req.headers.len();
        let mut ranges = [HeaderRange::EMPTY; MAX_HEADER_NUM];
        HeaderRange::record(src, req.headers, &mut ranges);

        let head = src.split_to(head_len).freeze();
        if let Some(map) = builder.headers_mut() {
            map.reserve(header_count);
            for range in &ranges[..header_count] {
                let name = HeaderName::from_bytes(&head[range.name.0..range.name.1]).map_err(ParseError::invalid_header)?;
                let value =
                    HeaderValue::from_maybe_shared(head.slice(range.value.0..range.value.1)).map_err(ParseError::invalid_header)?;
                map.append(name, value);
            }
        }

        let header = RequestHeader::from(builder.body(()).map_err(ParseError::invalid_header)?);
        let payload_size = payload_size(&header)?;
        Ok(Some((header, payload_size)))
    }
}

/// Byte positions of a header's name and value within the source buffer.
#[derive(Clone, Copy)]
struct HeaderRange {
    name: (usize, usize),
    value: (usize, usize),
}

impl HeaderRange {
    const EMPTY: HeaderRange = HeaderRange { name: (0, 0), value: (0, 0) };

    fn record(bytes: &[u8], headers: &[httparse::Header<'_>], ranges: &mut [HeaderRange]) {
        let base = bytes.as_ptr() as usize;
        for (header, range) in headers.iter().zip(ranges.iter_mut()) {
            let name_start = header.name.as_ptr() as usize - base;
            range.name = (name_start, name_start + header.name.len());
            let value_start = header.value.as_ptr() as usize - base;
            range.value = (value_start, value_start + header.value.len());
        }
    }
}

/// Chooses the body framing per RFC 9112 section 6.
fn payload_size(header: &RequestHeader) -> Result<PayloadSize, ParseError> {
    let te = header.headers().get(http::header::TRANSFER_ENCODING);
    let cl = header.headers().get(http::header::CONTENT_LENGTH);

    match (te, cl) {
        (Some(_), Some(_)) => {
            Err(ParseError::invalid_content_length("transfer-encoding and content-length both present"))
        }
        (Some(te), None) if is_chunked(te) => Ok(PayloadSize::Chunked),
        (Some(_), None) => Err(ParseError::invalid_header("transfer-encoding without final chunked coding")),
        (None, Some(cl)) => {
            let text = cl.to_str().map_err(|_| ParseError::invalid_content_length("value is not visible ascii"))?;
            let length = text
                .trim()
                .parse::<u64>()
                .map_err(|_| ParseError::invalid_content_length(format!("value {text} is not u64")))?;
            Ok(if length == 0 { PayloadSize::Empty } else { PayloadSize::Length(length) })
        }
        (None, None) => Ok(PayloadSize::Empty),
    }
}

/// `chunked` must be the last transfer coding.
fn is_chunked(value: &HeaderValue) -> bool {
    value.as_bytes().rsplit(|b| *b == b',').next().is_some_and(|last| last.trim_ascii().eq_ignore_ascii_case(b"chunked"))
}
