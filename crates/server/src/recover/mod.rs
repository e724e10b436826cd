//! Turning handler failures into HTTP responses.
//!
//! [`Recovery::recover`] runs when a request handler returns a [`Failure`] or
//! panics. The partially written body is dropped first, then the first rule
//! that applies answers the request:
//!
//! 1. a handler registered for the failing sentinel's identity
//! 2. a handler registered for the failure's concrete type
//! 3. an [`HttpResponseError`]: its status, headers and body
//! 4. an [`HttpStatusError`]: its status and message as `text/plain`
//! 5. anything else: `500 Internal Server Error`
//!
//! Faults below 500 are client conditions and are not traced. Everything else
//! is logged through `tracing::error!` with its cause chain and a bounded
//! stack trace taken where the failure was raised. A registered handler that
//! panics is treated like rule 5.

mod failure;
mod trace;

pub use failure::{
    BAD_REQUEST, CONFLICT, FORBIDDEN, Failure, HttpFault, HttpResponseError, HttpStatusError, METHOD_NOT_ALLOWED,
    NOT_FOUND, NOT_IMPLEMENTED, PAYLOAD_TOO_LARGE, REQUEST_TIMEOUT, SERVICE_UNAVAILABLE, Sentinel, TOO_MANY_REQUESTS,
    UNAUTHORIZED, WELL_KNOWN,
};

use std::any::TypeId;
use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use http::StatusCode;
use tracing::{error, warn};

use crate::RequestCtx;

/// A registered recovery action.
pub type ErrorHandler = Arc<dyn Fn(&mut RequestCtx, &Failure) + Send + Sync>;

/// The value-keyed and kind-keyed handler registries.
///
/// Filled through [`ServerBuilder`](crate::ServerBuilder) and read-only once
/// the server is built.
#[derive(Clone, Default)]
pub struct Recovery {
    by_value: HashMap<usize, ErrorHandler>,
    by_kind: HashMap<TypeId, ErrorHandler>,
}

impl Recovery {
    pub fn new() -> Self {
        trace::install_panic_hook();
        Self::default()
    }

    /// Handles failures raised with exactly this sentinel.
    pub fn on_value<F>(&mut self, sentinel: &'static Sentinel, handler: F)
    where
        F: Fn(&mut RequestCtx, &Failure) + Send + Sync + 'static,
    {
        self.by_value.insert(sentinel.identity(), Arc::new(handler));
    }

    /// Handles failures whose concrete type is `T`.
    pub fn on_kind<T: 'static, F>(&mut self, handler: F)
    where
        F: Fn(&mut RequestCtx, &Failure) + Send + Sync + 'static,
    {
        self.by_kind.insert(TypeId::of::<T>(), Arc::new(handler));
    }

    /// Maps every sentinel in [`WELL_KNOWN`] to its status.
    pub fn register_well_known(&mut self) {
        for sentinel in WELL_KNOWN {
            let status = sentinel.status();
            self.on_value(sentinel, move |ctx, _| ctx.set_status(status));
        }
    }

    /// Answers `failure` on `ctx` and returns the trace that was logged, if any.
    pub fn recover(&self, ctx: &mut RequestCtx, failure: &Failure) -> Option<String> {
        ctx.reset_body();

        if let Failure::Sentinel(sentinel) = failure
            && let Some(handler) = self.by_value.get(&sentinel.identity())
        {
            return invoke(handler, ctx, failure);
        }

        if let Some(handler) = failure.kind().and_then(|kind| self.by_kind.get(&kind)) {
            return invoke(handler, ctx, failure);
        }

        let status = match failure {
            Failure::Response(fault) => {
                apply_fault(ctx, fault);
                fault.status_code()
            }
            Failure::Status(fault) => {
                ctx.set_content_type(&mime::TEXT_PLAIN_UTF_8);
                apply_fault(ctx, fault);
                fault.status_code()
            }
            _ => {
                ctx.set_status(StatusCode::INTERNAL_SERVER_ERROR);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        (status.as_u16() >= 500).then(|| log_trace(failure))
    }
}

fn invoke(handler: &ErrorHandler, ctx: &mut RequestCtx, failure: &Failure) -> Option<String> {
    match panic::catch_unwind(AssertUnwindSafe(|| (**handler)(ctx, failure))) {
        Ok(()) => None,
        Err(payload) => {
            ctx.reset_body();
            ctx.set_status(StatusCode::INTERNAL_SERVER_ERROR);
            Some(log_trace(&Failure::panic(payload)))
        }
    }
}

fn apply_fault(ctx: &mut RequestCtx, fault: &dyn HttpFault) {
    ctx.set_status(fault.status_code());
    fault.write_headers(ctx.response_mut().headers_mut());
    if let Err(e) = ctx.write(&fault.body()) {
        warn!(cause = %e, "failed to write error body");
    }
}

fn log_trace(failure: &Failure) -> String {
    let trace = trace::report(failure);
    error!("{trace}");
    trace
}

impl fmt::Debug for Recovery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Recovery")
            .field("by_value", &self.by_value.len())
            .field("by_kind", &self.by_kind.len())
            .finish()
    }
}
