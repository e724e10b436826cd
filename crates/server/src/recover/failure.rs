//! What a request handler can fail with.

use std::any::{Any, TypeId};
use std::backtrace::Backtrace;
use std::error::Error;
use std::fmt;

use bytes::Bytes;
use http::{HeaderMap, StatusCode};

/// An identity-compared error value, used as a lookup key.
///
/// Sentinels are declared as `static` items; two sentinels are the same only
/// when they are the same item, whatever their message.
#[derive(Debug)]
pub struct Sentinel {
    message: &'static str,
    status: StatusCode,
}

impl Sentinel {
    pub const fn new(message: &'static str, status: StatusCode) -> Self {
        Self { message, status }
    }

    pub fn message(&self) -> &'static str {
        self.message
    }

    /// The status the default registration maps this sentinel to.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub(crate) fn identity(&'static self) -> usize {
        std::ptr::from_ref(self).addr()
    }
}

impl fmt::Display for Sentinel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message)
    }
}

pub static NOT_FOUND: Sentinel = Sentinel::new("not found", StatusCode::NOT_FOUND);
pub static BAD_REQUEST: Sentinel = Sentinel::new("bad request", StatusCode::BAD_REQUEST);
pub static UNAUTHORIZED: Sentinel = Sentinel::new("unauthorized", StatusCode::UNAUTHORIZED);
pub static FORBIDDEN: Sentinel = Sentinel::new("forbidden", StatusCode::FORBIDDEN);
pub static METHOD_NOT_ALLOWED: Sentinel = Sentinel::new("method not allowed", StatusCode::METHOD_NOT_ALLOWED);
pub static REQUEST_TIMEOUT: Sentinel = Sentinel::new("request timeout", StatusCode::REQUEST_TIMEOUT);
pub static CONFLICT: Sentinel = Sentinel::new("conflict", StatusCode::CONFLICT);
pub static PAYLOAD_TOO_LARGE: Sentinel = Sentinel::new("payload too large", StatusCode::PAYLOAD_TOO_LARGE);
pub static TOO_MANY_REQUESTS: Sentinel = Sentinel::new("too many requests", StatusCode::TOO_MANY_REQUESTS);
pub static NOT_IMPLEMENTED: Sentinel = Sentinel::new("not implemented", StatusCode::NOT_IMPLEMENTED);
pub static SERVICE_UNAVAILABLE: Sentinel = Sentinel::new("service unavailable", StatusCode::SERVICE_UNAVAILABLE);

/// Sentinels registered by every [`ServerBuilder`](crate::ServerBuilder).
pub static WELL_KNOWN: [&Sentinel; 11] = [
    &NOT_FOUND,
    &BAD_REQUEST,
    &UNAUTHORIZED,
    &FORBIDDEN,
    &METHOD_NOT_ALLOWED,
    &REQUEST_TIMEOUT,
    &CONFLICT,
    &PAYLOAD_TOO_LARGE,
    &TOO_MANY_REQUESTS,
    &NOT_IMPLEMENTED,
    &SERVICE_UNAVAILABLE,
];

/// A failure that knows how it should be answered over HTTP.
pub trait HttpFault {
    fn status_code(&self) -> StatusCode;

    fn body(&self) -> Bytes;

    fn write_headers(&self, _headers: &mut HeaderMap) {}
}

/// A complete error response: status, extra headers and body.
#[derive(Debug, Clone)]
pub struct HttpResponseError {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
}

impl HttpResponseError {
    pub fn new(status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self { status, headers: HeaderMap::new(), body: body.into() }
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }
}

impl HttpFault for HttpResponseError {
    fn status_code(&self) -> StatusCode {
        self.status
    }

    fn body(&self) -> Bytes {
        self.body.clone()
    }

    fn write_headers(&self, headers: &mut HeaderMap) {
        for (name, value) in &self.headers {
            headers.append(name, value.clone());
        }
    }
}

/// A status with a short message that becomes a `text/plain` body.
#[derive(Debug, Clone)]
pub struct HttpStatusError {
    status: StatusCode,
    message: String,
}

impl HttpStatusError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self { status, message: message.into() }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl HttpFault for HttpStatusError {
    fn status_code(&self) -> StatusCode {
        self.status
    }

    fn body(&self) -> Bytes {
        Bytes::copy_from_slice(self.message.as_bytes())
    }
}

/// Everything a request handler can end with besides success.
///
/// Any `std::error::Error` converts into [`Failure::Other`] through `?`;
/// sentinels and the two HTTP fault types convert into their own variants.
/// Panics caught around the handler become [`Failure::Panic`].
///
/// `Other` and `Panic` keep the stack they were raised with.
pub enum Failure {
    Sentinel(&'static Sentinel),
    Response(HttpResponseError),
    Status(HttpStatusError),
    Other { error: Box<dyn Error + Send + Sync>, kind: TypeId, backtrace: Backtrace },
    Panic { payload: Box<dyn Any + Send>, backtrace: Option<Backtrace> },
}

impl Failure {
    /// The concrete type the failure was raised with, used for kind-keyed lookup.
    pub fn kind(&self) -> Option<TypeId> {
        match self {
            Failure::Sentinel(_) => Some(TypeId::of::<Sentinel>()),
            Failure::Response(_) => Some(TypeId::of::<HttpResponseError>()),
            Failure::Status(_) => Some(TypeId::of::<HttpStatusError>()),
            Failure::Other { kind, .. } => Some(*kind),
            Failure::Panic { .. } => None,
        }
    }

    /// Borrows the wrapped error as `E` when it was raised with that type.
    pub fn downcast_ref<E: Error + 'static>(&self) -> Option<&E> {
        match self {
            Failure::Other { error, .. } => error.downcast_ref::<E>(),
            _ => None,
        }
    }

    pub fn status(status: StatusCode, message: impl Into<String>) -> Self {
        Failure::Status(HttpStatusError::new(status, message))
    }

    /// Wraps a caught panic payload with the stack the panic hook kept for it.
    pub fn panic(payload: Box<dyn Any + Send>) -> Self {
        Failure::Panic { payload, backtrace: super::trace::take_panic_trace() }
    }

    /// The stack at the point the failure was raised, when one was kept.
    pub fn backtrace(&self) -> Option<&Backtrace> {
        match self {
            Failure::Other { backtrace, .. } => Some(backtrace),
            Failure::Panic { backtrace, .. } => backtrace.as_ref(),
            _ => None,
        }
    }

    /// The wrapped error's `source()` chain, outermost first.
    pub fn causes(&self) -> impl Iterator<Item = &(dyn Error + 'static)> {
        let first = match self {
            Failure::Other { error, .. } => error.source(),
            _ => None,
        };
        std::iter::successors(first, |&cause| cause.source())
    }
}

impl<E: Error + Send + Sync + 'static> From<E> for Failure {
    fn from(error: E) -> Self {
        Failure::Other { error: Box::new(error), kind: TypeId::of::<E>(), backtrace: Backtrace::force_capture() }
    }
}

impl From<&'static Sentinel> for Failure {
    fn from(sentinel: &'static Sentinel) -> Self {
        Failure::Sentinel(sentinel)
    }
}

impl From<HttpResponseError> for Failure {
    fn from(error: HttpResponseError) -> Self {
        Failure::Response(error)
    }
}

impl From<HttpStatusError> for Failure {
    fn from(error: HttpStatusError) -> Self {
        Failure::Status(error)
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Failure::Sentinel(sentinel) => write!(f, "{sentinel}"),
            Failure::Response(error) => write!(f, "http response error, status {}", error.status),
            Failure::Status(error) => write!(f, "{}: {}", error.status, error.message),
            Failure::Other { error, .. } => write!(f, "{error}"),
            Failure::Panic { payload, .. } => {
                let message = payload
                    .downcast_ref::<&str>()
                    .copied()
                    .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
                    .unwrap_or("Box<dyn Any>");
                write!(f, "panicked: {message}")
            }
        }
    }
}

impl fmt::Debug for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Failure::Sentinel(sentinel) => f.debug_tuple("Sentinel").field(sentinel).finish(),
            Failure::Response(error) => f.debug_tuple("Response").field(error).finish(),
            Failure::Status(error) => f.debug_tuple("Status").field(error).finish(),
            Failure::Other { error, .. } => f.debug_struct("Other").field("error", error).finish_non_exhaustive(),
            Failure::Panic { .. } => write!(f, "Panic({self})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    fn io_failure() -> Result<(), Failure> {
        Err(io::Error::other("disk gone"))?;
        Ok(())
    }

    #[test]
    fn errors_convert_with_their_kind() {
        let failure = io_failure().unwrap_err();
        assert_eq!(failure.kind(), Some(TypeId::of::<io::Error>()));
        assert_eq!(failure.downcast_ref::<io::Error>().unwrap().to_string(), "disk gone");
        assert_eq!(failure.to_string(), "disk gone");
    }

    #[derive(Debug, thiserror::Error)]
    #[error("loading user 7")]
    struct LoadUser {
        #[source]
        source: io::Error,
    }

    #[test]
    fn causes_follow_the_source_chain() {
        let failure = Failure::from(LoadUser { source: io::Error::other("db down") });
        let causes: Vec<String> = failure.causes().map(ToString::to_string).collect();
        assert_eq!(causes, ["db down"]);
        assert!(failure.backtrace().is_some());
        assert_eq!(Failure::from(&NOT_FOUND).causes().count(), 0);
    }

    #[test]
    fn sentinels_compare_by_identity() {
        static ALSO_NOT_FOUND: Sentinel = Sentinel::new("not found", StatusCode::NOT_FOUND);
        assert_eq!(NOT_FOUND.identity(), NOT_FOUND.identity());
        assert_ne!(NOT_FOUND.identity(), ALSO_NOT_FOUND.identity());
        assert!(matches!(Failure::from(&NOT_FOUND), Failure::Sentinel(s) if s.status() == StatusCode::NOT_FOUND));
    }

    #[test]
    fn panic_payload_display() {
        assert_eq!(Failure::panic(Box::new("boom")).to_string(), "panicked: boom");
        assert_eq!(Failure::panic(Box::new(String::from("bang"))).to_string(), "panicked: bang");
        assert_eq!(Failure::panic(Box::new(3u8)).to_string(), "panicked: Box<dyn Any>");
    }

    #[test]
    fn response_error_copies_headers() {
        let mut extra = HeaderMap::new();
        extra.insert("retry-after", "5".parse().unwrap());
        let error = HttpResponseError::new(StatusCode::SERVICE_UNAVAILABLE, "later").with_headers(extra);

        let mut headers = HeaderMap::new();
        error.write_headers(&mut headers);
        assert_eq!(headers.get("retry-after").unwrap(), "5");
        assert_eq!(error.body(), Bytes::from_static(b"later"));
    }
}
