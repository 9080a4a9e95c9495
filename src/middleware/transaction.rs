//! Unit-of-work boundary around the inner layers.
//!
//! The persistence layer itself is an outside collaborator; this module
//! only fixes how the pipeline drives it. Per request that passes through a
//! [`Transaction`] layer:
//!
//! 1. `begin()` opens a session, which is attached to the request context
//!    so handlers can take it with `Inject<Session>`.
//! 2. The inner layers run.
//! 3. On `Ok`, the session is committed. On `Err`, it is rolled back and the
//!    original error is returned unchanged.
//!
//! Exactly one of commit or rollback happens. If the request is dropped
//! before the inner layers finish (client gone, task aborted), the open
//! session is rolled back on a spawned task. A failing rollback is logged
//! and does not replace the error that caused it. A `Transaction` layer
//! that finds a session of its type already attached (a route-level
//! boundary inside a global one) passes through and leaves the outer
//! boundary in charge.

use std::future::Future;
use std::sync::Arc;

use tracing::warn;

use crate::error::{BoxError, Error};
use crate::handler::BoxFuture;
use crate::middleware::{Middleware, Next};
use crate::request::Request;
use crate::response::Response;

/// A handle on one open unit of work.
///
/// Clones refer to the same unit of work; the request that opened it is
/// its only user, and it does not outlive that request.
pub trait UnitOfWork: Clone + Send + Sync + 'static {
    fn commit(self) -> impl Future<Output = Result<(), BoxError>> + Send;
    fn rollback(self) -> impl Future<Output = Result<(), BoxError>> + Send;
}

/// Opens units of work. Typically wraps a connection pool.
pub trait SessionProvider: Send + Sync + 'static {
    type Session: UnitOfWork;

    fn begin(&self) -> impl Future<Output = Result<Self::Session, BoxError>> + Send;
}

/// Commit-or-rollback middleware for the sessions `P` opens.
pub struct Transaction<P> {
    provider: Arc<P>,
}

impl<P: SessionProvider> Transaction<P> {
    pub fn new(provider: P) -> Self {
        Self { provider: Arc::new(provider) }
    }

    /// Shares a provider that the application also uses elsewhere, e.g. in
    /// lifecycle hooks.
    pub fn shared(provider: Arc<P>) -> Self {
        Self { provider }
    }
}

impl<P: SessionProvider> Middleware for Transaction<P> {
    fn handle<'a>(&'a self, mut req: Request, next: Next) -> BoxFuture<'a, Result<Response, Error>> {
        Box::pin(async move {
            // Nested boundary for the same session type: the outer layer owns
            // this request's unit of work.
            if req.context().contains::<P::Session>() {
                return next.run(req).await;
            }

            let session = self.provider.begin().await.map_err(Error::TransactionFailure)?;
            let _ = req.context_mut().insert(session.clone());

            let mut open = OpenSession(Some(session.clone()));
            let outcome = next.run(req).await;
            open.settle();

            match outcome {
                Ok(res) => {
                    session.commit().await.map_err(Error::TransactionFailure)?;
                    Ok(res)
                }
                Err(err) => {
                    if let Err(e) = session.rollback().await {
                        warn!(error = %e, cause = %err, "rollback failed");
                    }
                    Err(err)
                }
            }
        })
    }
}

/// Rolls the session back if dropped before it was settled.
struct OpenSession<S: UnitOfWork>(Option<S>);

impl<S: UnitOfWork> OpenSession<S> {
    fn settle(&mut self) {
        self.0 = None;
    }
}

impl<S: UnitOfWork> Drop for OpenSession<S> {
    fn drop(&mut self) {
        let Some(session) = self.0.take() else { return };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!("request dropped inside a transaction, rolling back");
                handle.spawn(async move {
                    if let Err(e) = session.rollback().await {
                        warn!(error = %e, "rollback of dropped request failed");
                    }
                });
            }
            Err(_) => warn!("request dropped outside a runtime, session left to the provider"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::ready;

    use http::StatusCode;

    use crate::App;
    use crate::request::Body;

    /// A unit of work whose commit and rollback always fail.
    #[derive(Clone)]
    struct Broken;

    impl UnitOfWork for Broken {
        fn commit(self) -> impl Future<Output = Result<(), BoxError>> + Send {
            ready(Err::<(), _>(BoxError::from("disk full")))
        }

        fn rollback(self) -> impl Future<Output = Result<(), BoxError>> + Send {
            ready(Err::<(), _>(BoxError::from("connection reset")))
        }
    }

    struct BrokenDb;

    impl SessionProvider for BrokenDb {
        type Session = Broken;

        fn begin(&self) -> impl Future<Output = Result<Broken, BoxError>> + Send {
            ready(Ok::<_, BoxError>(Broken))
        }
    }

    fn post(path: &str) -> http::Request<Body> {
        http::Request::post(path).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn failed_commit_is_a_transaction_failure() {
        let pipeline = App::new()
            .middleware(Transaction::new(BrokenDb))
            .post("/save", || async { "saved" })
            .build();

        let res = pipeline.dispatch(post("/save")).await;
        assert_eq!(res.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn failed_rollback_keeps_the_original_error() {
        let pipeline = App::new()
            .middleware(Transaction::new(BrokenDb))
            .post("/save", || async {
                Err::<&'static str, _>(Error::with_status(StatusCode::CONFLICT, "already exists"))
            })
            .build();

        let res = pipeline.dispatch(post("/save")).await;
        assert_eq!(res.status_code(), StatusCode::CONFLICT);
        assert!(String::from_utf8_lossy(res.body()).contains("already exists"));
    }
}
