//! Admission control as a middleware layer.

use std::time::Duration;

use crate::error::Error;
use crate::handler::BoxFuture;
use crate::limit::ConcurrencyLimiter;
use crate::middleware::{Middleware, Next};
use crate::request::Request;
use crate::response::Response;

/// Bounds how many requests run the inner layers at once.
///
/// Usually placed in a route's middleware list, where it guards that route
/// only, nested inside the global scope that `concurrency_limit` in
/// [`Settings`](crate::Settings) installs. Each instance counts its own
/// slots, so nesting never double-counts.
pub struct ConcurrencyLimit {
    limiter: ConcurrencyLimiter,
}

impl ConcurrencyLimit {
    pub fn new(capacity: usize, max_wait: Duration) -> Self {
        Self { limiter: ConcurrencyLimiter::new(capacity, max_wait) }
    }

    pub fn limiter(&self) -> &ConcurrencyLimiter {
        &self.limiter
    }
}

impl From<ConcurrencyLimiter> for ConcurrencyLimit {
    fn from(limiter: ConcurrencyLimiter) -> Self {
        Self { limiter }
    }
}

impl Middleware for ConcurrencyLimit {
    fn handle<'a>(&'a self, req: Request, next: Next) -> BoxFuture<'a, Result<Response, Error>> {
        Box::pin(async move {
            let _admission = self.limiter.acquire().await?;
            next.run(req).await
        })
    }
}
