//! Response compression negotiation and pooled encoders.
//!
//! [`negotiate`] reads every `Accept-Encoding` value and picks one of the
//! supported codings with a fixed priority, `br` > `deflate` > `gzip`,
//! independent of the order the client listed them in. The matching
//! [`StreamEncoder`] is checked out of a per-coding [`Pool`] owned by
//! [`Compressors`] and installed on the response by
//! [`RequestCtx::compress`](crate::RequestCtx::compress).

mod encoder;

pub use encoder::{BrotliStream, DeflateStream, GzipStream, StreamEncoder};

use http::{HeaderMap, HeaderValue, header};
use serde::Deserialize;

use crate::ServerError;
use crate::pool::{Pool, Pooled};

/// Content codings the server can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Encoding {
    Gzip,
    Deflate,
    Brotli,
}

impl Encoding {
    /// The token used in `Accept-Encoding` and `Content-Encoding`.
    pub fn as_str(self) -> &'static str {
        match self {
            Encoding::Gzip => "gzip",
            Encoding::Deflate => "deflate",
            Encoding::Brotli => "br",
        }
    }

    pub(crate) fn header_value(self) -> HeaderValue {
        HeaderValue::from_static(self.as_str())
    }

    fn max_level(self) -> u32 {
        match self {
            Encoding::Gzip | Encoding::Deflate => 9,
            Encoding::Brotli => 11,
        }
    }
}

/// Process-wide compression settings, fixed when the server is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    /// Turns [`RequestCtx::select_encoding`](crate::RequestCtx::select_encoding) into a no-op.
    pub disabled: bool,
    pub gzip_level: u32,
    pub deflate_level: u32,
    pub brotli_level: u32,
    /// Idle encoders kept per coding.
    pub max_idle: usize,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self { disabled: false, gzip_level: 6, deflate_level: 6, brotli_level: 6, max_idle: 64 }
    }
}

impl CompressionConfig {
    pub fn level(&self, encoding: Encoding) -> u32 {
        match encoding {
            Encoding::Gzip => self.gzip_level,
            Encoding::Deflate => self.deflate_level,
            Encoding::Brotli => self.brotli_level,
        }
    }

    /// Rejects levels the encoders cannot run with.
    pub fn validate(&self) -> Result<(), ServerError> {
        for encoding in [Encoding::Gzip, Encoding::Deflate, Encoding::Brotli] {
            let level = self.level(encoding);
            if level > encoding.max_level() {
                return Err(ServerError::config(format!(
                    "{} compression level {level} is out of range 0..={}",
                    encoding.as_str(),
                    encoding.max_level()
                )));
            }
        }
        Ok(())
    }
}

/// The encoder pools, one per coding.
#[derive(Debug)]
pub(crate) struct Compressors {
    config: CompressionConfig,
    gzip: Pool<StreamEncoder>,
    deflate: Pool<StreamEncoder>,
    brotli: Pool<StreamEncoder>,
}

impl Compressors {
    pub(crate) fn new(config: CompressionConfig) -> Result<Self, ServerError> {
        config.validate()?;
        let pool = |encoding: Encoding| {
            let level = config.level(encoding);
            Pool::new(config.max_idle, move || StreamEncoder::new(encoding, level))
        };
        Ok(Self { config, gzip: pool(Encoding::Gzip), deflate: pool(Encoding::Deflate), brotli: pool(Encoding::Brotli) })
    }

    pub(crate) fn config(&self) -> &CompressionConfig {
        &self.config
    }

    /// Checks out an encoder ready to start a new stream.
    pub(crate) fn checkout(&self, encoding: Encoding) -> Pooled<StreamEncoder> {
        let pool = match encoding {
            Encoding::Gzip => &self.gzip,
            Encoding::Deflate => &self.deflate,
            Encoding::Brotli => &self.brotli,
        };
        let mut encoder = pool.checkout();
        encoder.reset();
        encoder
    }

    #[cfg(test)]
    pub(crate) fn idle(&self, encoding: Encoding) -> usize {
        match encoding {
            Encoding::Gzip => self.gzip.idle(),
            Encoding::Deflate => self.deflate.idle(),
            Encoding::Brotli => self.brotli.idle(),
        }
    }
}

/// Picks the coding for a response from the request's `Accept-Encoding` values.
///
/// Tokens are trimmed and their parameters (`;q=...`) ignored. `br` wins as
/// soon as it is seen; otherwise `deflate` beats `gzip`.
pub fn negotiate(headers: &HeaderMap) -> Option<Encoding> {
    let mut gzip = false;
    let mut deflate = false;

    let tokens = headers
        .get_all(header::ACCEPT_ENCODING)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(|token| token.split(';').next().unwrap_or_default().trim());

    for token in tokens {
        match token {
            "br" => return Some(Encoding::Brotli),
            "deflate" => deflate = true,
            "gzip" => gzip = true,
            _ => {}
        }
    }

    if deflate {
        Some(Encoding::Deflate)
    } else if gzip {
        Some(Encoding::Gzip)
    } else {
        None
    }
}
