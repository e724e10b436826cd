//! The per-request unit of work.

use std::io;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use http::{HeaderMap, HeaderValue, Request, StatusCode, header};
use suna_http::protocol::{FullResponse, RequestHeader, ResponseBody};

use crate::compress::{self, Encoding, StreamEncoder};
use crate::pool::Pooled;
use crate::protocol::Http1Io;
use crate::{Connection, Server};

/// Path parameters filled in by a routing layer.
pub type PathParams = Vec<(String, String)>;

/// The response being built for the current request.
///
/// Body bytes are buffered; once an encoder is installed every write is
/// compressed into it and the buffer only receives the finished stream.
#[derive(Debug)]
pub struct Response {
    status: StatusCode,
    headers: HeaderMap,
    body: BytesMut,
    encoder: Option<Pooled<StreamEncoder>>,
}

impl Default for Response {
    fn default() -> Self {
        Self { status: StatusCode::OK, headers: HeaderMap::new(), body: BytesMut::new(), encoder: None }
    }
}

impl Response {
    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn set_status(&mut self, status: StatusCode) {
        self.status = status;
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// Uncompressed bytes written so far; empty while an encoder is installed.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// The content coding writes currently go through.
    pub fn encoding(&self) -> Option<Encoding> {
        self.encoder.as_ref().map(|encoder| encoder.encoding())
    }

    pub fn write(&mut self, data: &[u8]) -> io::Result<()> {
        match &mut self.encoder {
            Some(encoder) => encoder.write(data),
            None => {
                self.body.extend_from_slice(data);
                Ok(())
            }
        }
    }

    /// Drops everything written so far and restarts the compressed stream, if any.
    pub fn reset_body(&mut self) {
        self.body.clear();
        if let Some(encoder) = &mut self.encoder {
            encoder.reset();
        }
    }

    fn install(&mut self, mut encoder: Pooled<StreamEncoder>) -> io::Result<()> {
        let pending = self.body.split();
        encoder.write(&pending)?;
        self.headers.insert(header::CONTENT_ENCODING, encoder.encoding().header_value());
        self.encoder = Some(encoder);
        Ok(())
    }

    /// Ends the compressed stream and gives the encoder back to its pool.
    fn finish_body(&mut self) -> io::Result<Bytes> {
        if let Some(mut encoder) = self.encoder.take() {
            let compressed = encoder.finish()?;
            self.body.extend_from_slice(&compressed);
        }
        Ok(self.body.split().freeze())
    }

    fn discard_body(&mut self) {
        self.body.clear();
        if self.encoder.take().is_some() {
            self.headers.remove(header::CONTENT_ENCODING);
        }
    }
}

/// One request/response exchange.
///
/// Created by the protocol for every request; the raw connection is lent to
/// it while the handler runs so the handler can upgrade and take it over.
pub struct RequestCtx {
    request: Request<Bytes>,
    params: PathParams,
    response: Response,
    keep_alive: bool,
    upgrade: Option<String>,
    io: Option<Http1Io>,
    hijacked: bool,
    server: Arc<Server>,
}

impl RequestCtx {
    pub(crate) fn new(server: Arc<Server>, request: Request<Bytes>) -> Self {
        let (parts, body) = request.into_parts();
        let header = RequestHeader::from(parts);
        let keep_alive = header.keep_alive();
        let upgrade = header.upgrade_protocol();
        Self {
            request: header.body(body),
            params: PathParams::new(),
            response: Response::default(),
            keep_alive,
            upgrade,
            io: None,
            hijacked: false,
            server,
        }
    }

    pub(crate) fn with_io(mut self, io: Http1Io) -> Self {
        self.io = Some(io);
        self
    }

    pub fn request(&self) -> &Request<Bytes> {
        &self.request
    }

    pub fn request_mut(&mut self) -> &mut Request<Bytes> {
        &mut self.request
    }

    pub fn params(&self) -> &PathParams {
        &self.params
    }

    pub fn params_mut(&mut self) -> &mut PathParams {
        &mut self.params
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.iter().find(|(key, _)| key == name).map(|(_, value)| value.as_str())
    }

    pub fn response(&self) -> &Response {
        &self.response
    }

    pub fn response_mut(&mut self) -> &mut Response {
        &mut self.response
    }

    pub fn server(&self) -> &Arc<Server> {
        &self.server
    }

    pub fn status(&self) -> StatusCode {
        self.response.status
    }

    pub fn set_status(&mut self, status: StatusCode) {
        self.response.status = status;
    }

    pub fn set_content_type(&mut self, mime: &mime::Mime) {
        if let Ok(value) = HeaderValue::from_str(mime.as_ref()) {
            self.response.headers.insert(header::CONTENT_TYPE, value);
        }
    }

    pub fn write(&mut self, data: &[u8]) -> io::Result<()> {
        self.response.write(data)
    }

    pub fn write_str(&mut self, data: &str) -> io::Result<()> {
        self.response.write(data.as_bytes())
    }

    pub fn reset_body(&mut self) {
        self.response.reset_body();
    }

    /// Picks a coding from `Accept-Encoding` and installs it.
    ///
    /// Does nothing when compression is disabled or no supported coding is accepted.
    pub fn select_encoding(&mut self) -> io::Result<Option<Encoding>> {
        if self.server.compressors().config().disabled {
            return Ok(None);
        }
        let Some(encoding) = compress::negotiate(self.request.headers()) else {
            return Ok(None);
        };
        self.compress(encoding)?;
        Ok(Some(encoding))
    }

    /// Routes the rest of the body through a pooled `encoding` stream.
    ///
    /// Bytes already written are moved into the new stream. Once a coding is
    /// installed it stays for the rest of the response; later calls are no-ops.
    pub fn compress(&mut self, encoding: Encoding) -> io::Result<()> {
        if self.response.encoder.is_some() {
            return Ok(());
        }
        let encoder = self.server.compressors().checkout(encoding);
        self.response.install(encoder)
    }

    pub fn compress_gzip(&mut self) -> io::Result<()> {
        self.compress(Encoding::Gzip)
    }

    pub fn compress_deflate(&mut self) -> io::Result<()> {
        self.compress(Encoding::Deflate)
    }

    pub fn compress_brotli(&mut self) -> io::Result<()> {
        self.compress(Encoding::Brotli)
    }

    /// The lower-cased protocol the request asks to upgrade to.
    pub fn upgrade_protocol(&self) -> Option<&str> {
        self.upgrade.as_deref()
    }

    pub fn is_hijacked(&self) -> bool {
        self.hijacked
    }

    pub(crate) fn io_mut(&mut self) -> Option<&mut Http1Io> {
        self.io.as_mut()
    }

    /// Gives the connection back to the protocol unless it was hijacked.
    pub(crate) fn take_io(&mut self) -> Option<Http1Io> {
        self.io.take()
    }

    /// Takes the raw connection away from HTTP framing for good.
    pub(crate) fn hijack(&mut self) -> Option<(Connection, BytesMut)> {
        let io = self.io.take()?;
        self.hijacked = true;
        Some(io.into_parts())
    }

    /// Builds the head for the current status and headers, ready to flush.
    pub(crate) fn head(&self) -> http::Response<()> {
        let mut head = http::Response::new(());
        *head.status_mut() = self.response.status;
        *head.version_mut() = self.request.version();
        *head.headers_mut() = self.response.headers.clone();
        head
    }

    /// Completes the response: ends the compressed stream, returns the encoder
    /// to its pool and adds the `Date` header.
    ///
    /// An answer to `HEAD` sends no body but reports the length the body would
    /// have had; `304` keeps whatever length the handler set.
    pub(crate) fn finish_response(&mut self) -> io::Result<FullResponse> {
        let status = self.response.status;
        let body = if status.is_informational() || status == StatusCode::NO_CONTENT {
            self.response.discard_body();
            ResponseBody::empty()
        } else if status == StatusCode::NOT_MODIFIED {
            self.response.discard_body();
            ResponseBody::Omitted
        } else if self.request.method() == http::Method::HEAD {
            let body = self.response.finish_body()?;
            if !body.is_empty() || !self.response.headers.contains_key(header::CONTENT_LENGTH) {
                self.response.headers.insert(header::CONTENT_LENGTH, HeaderValue::from(body.len()));
            }
            ResponseBody::Omitted
        } else {
            ResponseBody::Full(self.response.finish_body()?)
        };

        if !self.keep_alive {
            self.response.headers.insert(header::CONNECTION, HeaderValue::from_static("close"));
        }
        self.response.headers.insert(header::DATE, self.server.date_header());
        Ok((self.head(), body))
    }
}

impl std::fmt::Debug for RequestCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestCtx")
            .field("method", self.request.method())
            .field("uri", self.request.uri())
            .field("status", &self.response.status)
            .field("hijacked", &self.hijacked)
            .finish_non_exhaustive()
    }
}
