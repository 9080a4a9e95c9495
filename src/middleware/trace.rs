//! Access log: one event per request with status and latency.

use tokio::time::Instant;
use tracing::info;

use crate::error::Error;
use crate::handler::BoxFuture;
use crate::middleware::{Middleware, Next};
use crate::request::Request;
use crate::response::Response;

/// Logs every request that passes through it at `info`.
///
/// Runs inside the request span, so `trace_id` and `span_id` are attached
/// by the subscriber.
pub struct Trace;

impl Middleware for Trace {
    fn handle<'a>(&'a self, req: Request, next: Next) -> BoxFuture<'a, Result<Response, Error>> {
        let method = req.method().clone();
        let path = req.path().to_owned();

        Box::pin(async move {
            let started = Instant::now();
            let result = next.run(req).await;
            let elapsed_ms = started.elapsed().as_millis() as u64;

            match &result {
                Ok(res) => {
                    info!(%method, %path, status = res.status_code().as_u16(), elapsed_ms, "request completed");
                }
                Err(err) => {
                    info!(%method, %path, status = err.status().as_u16(), elapsed_ms, error = %err, "request failed");
                }
            }
            result
        })
    }
}
