use std::future::Future;
use std::pin::Pin;

use async_trait::async_trait;

use crate::recover::NOT_FOUND;
use crate::{Failure, RequestCtx};

/// The future returned by closures wrapped with [`handler_fn`].
pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = Result<(), Failure>> + Send + 'a>>;

/// Application code invoked once per request.
///
/// The handler writes its response through `ctx`; returning an error (or
/// panicking) hands the request to the server's recovery registries.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn invoke(&self, ctx: &mut RequestCtx) -> Result<(), Failure>;
}

/// a closure holder which represents any async handler fn
#[derive(Debug, Clone, Copy)]
pub struct FnHandler<F> {
    f: F,
}

/// Wraps `f` as a [`RequestHandler`].
///
/// ```no_run
/// use suna::handler_fn;
///
/// let hello = handler_fn(|ctx| Box::pin(async move {
///     ctx.write_str("hello")?;
///     Ok(())
/// }));
/// # let _ = hello;
/// ```
pub fn handler_fn<F>(f: F) -> FnHandler<F>
where
    F: for<'a> Fn(&'a mut RequestCtx) -> HandlerFuture<'a> + Send + Sync,
{
    FnHandler { f }
}

#[async_trait]
impl<F> RequestHandler for FnHandler<F>
where
    F: for<'a> Fn(&'a mut RequestCtx) -> HandlerFuture<'a> + Send + Sync,
{
    async fn invoke(&self, ctx: &mut RequestCtx) -> Result<(), Failure> {
        (self.f)(ctx).await
    }
}

/// Answers every request with the `NOT_FOUND` sentinel.
#[derive(Debug, Default, Clone, Copy)]
pub struct NotFound;

#[async_trait]
impl RequestHandler for NotFound {
    async fn invoke(&self, _ctx: &mut RequestCtx) -> Result<(), Failure> {
        Err(Failure::from(&NOT_FOUND))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn assert_is_handler<T: RequestHandler>(_handler: &T) {
        // no op
    }

    #[test]
    fn closures_are_handlers() {
        let handler = handler_fn(|ctx| {
            Box::pin(async move {
                ctx.write_str("ok")?;
                Ok(())
            })
        });
        assert_is_handler(&handler);
        assert_is_handler(&NotFound);
    }
}
