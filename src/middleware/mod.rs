//! Middleware layer.
//!
//! Middleware intercepts requests and responses and is the place for
//! cross-cutting concerns: admission control, transactions, access logs,
//! authentication-header inspection.
//!
//! # The onion
//!
//! Each layer receives the request and a [`Next`] continuation. It can
//! answer without calling `next` (short-circuit), call it and pass the
//! result through, or call it and transform the response or the error.
//!
//! For global middleware added with [`App::middleware`](crate::App::middleware)
//! in the order `A`, `B`, `C`, and route middleware `D`:
//!
//! ```text
//! transport → C → B → A → D → handler
//!                                ↓
//! transport ← C ← B ← A ← D ← response
//! ```
//!
//! Every newly added global layer wraps the ones added before it. Route
//! middleware is always innermost, in declared order.
//!
//! # Reentrancy
//!
//! One middleware instance serves every in-flight request at once. Keep
//! per-request state on the request (its context bag), never on `self`.

mod concurrency;
mod trace;
mod transaction;

use std::future::Future;
use std::sync::Arc;

pub use concurrency::ConcurrencyLimit;
pub use trace::Trace;
pub use transaction::{SessionProvider, Transaction, UnitOfWork};

use crate::error::Error;
use crate::handler::{BoxFuture, BoxedEndpoint};
use crate::request::Request;
use crate::response::Response;

/// One layer of the onion.
///
/// Stateful layers implement this on a struct; stateless ones can be plain
/// async closures wrapped with [`from_fn`].
pub trait Middleware: Send + Sync + 'static {
    fn handle<'a>(&'a self, req: Request, next: Next) -> BoxFuture<'a, Result<Response, Error>>;
}

/// A middleware shared by every route and request that uses it.
pub type BoxedMiddleware = Arc<dyn Middleware>;

/// Boxes a middleware for a route's middleware list.
pub fn boxed(middleware: impl Middleware) -> BoxedMiddleware {
    Arc::new(middleware)
}

/// The rest of the chain, ending in the handler.
#[derive(Clone)]
pub struct Next {
    chain: Arc<[BoxedMiddleware]>,
    endpoint: BoxedEndpoint,
    index: usize,
}

impl Next {
    pub(crate) fn new(chain: Arc<[BoxedMiddleware]>, endpoint: BoxedEndpoint) -> Self {
        Self { chain, endpoint, index: 0 }
    }

    /// Runs the next layer, or the handler once every layer has run.
    pub fn run(self, req: Request) -> BoxFuture<'static, Result<Response, Error>> {
        match self.chain.get(self.index).cloned() {
            Some(layer) => {
                let next = Self { index: self.index + 1, ..self };
                Box::pin(async move { layer.handle(req, next).await })
            }
            None => self.endpoint.call(req),
        }
    }
}

/// A middleware built from an async function or closure.
pub struct FromFn<F>(F);

/// Wraps `f` as a [`Middleware`].
///
/// ```rust,ignore
/// let require_auth = from_fn(|req: Request, next: Next| async move {
///     match req.header("authorization") {
///         Some(v) if v.starts_with("Bearer ") => next.run(req).await,
///         _ => Ok(Response::status(StatusCode::UNAUTHORIZED)),
///     }
/// });
/// ```
pub fn from_fn<F, Fut>(f: F) -> FromFn<F>
where
    F: Fn(Request, Next) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Response, Error>> + Send + 'static,
{
    FromFn(f)
}

impl<F, Fut> Middleware for FromFn<F>
where
    F: Fn(Request, Next) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Response, Error>> + Send + 'static,
{
    fn handle<'a>(&'a self, req: Request, next: Next) -> BoxFuture<'a, Result<Response, Error>> {
        Box::pin((self.0)(req, next))
    }
}
