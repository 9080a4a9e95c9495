//! Handler trait and type erasure.
//!
//! # How handlers are stored
//!
//! The router holds handlers of *different* types side by side, so each one
//! is wrapped and stored as a trait object (`dyn Endpoint`). The chain from
//! user code to vtable call is:
//!
//! ```text
//! async fn show(Path(id): Path<u64>, db: Inject<Db>) -> Json<Item>   ← user writes this
//!        ↓ app.on(Method::GET, "/items/{id}", show)
//! Handler::<(Path<u64>, Inject<Db>)>::check(["id"])                  ← setup-time arity check
//!        ↓
//! Arc::new(HandlerEndpoint(show))                                    ← stored as BoxedEndpoint
//!        ↓ endpoint.call(req) at request time
//! Path::from_request_parts → Inject::from_request → show(..)         ← one resolution per parameter
//! ```
//!
//! Each parameter type is its own resolver (see [`crate::extract`]); the
//! blanket impls below feed them the request in declaration order. The
//! last parameter may consume the request (a body, or the request itself);
//! the ones before it only borrow it.

use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;

use crate::error::Error;
use crate::extract::{FromRequest, FromRequestParts};
use crate::request::Request;
use crate::response::{IntoOutcome, Response};

/// A heap-allocated, type-erased future.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Internal dispatch interface for a registered handler.
#[doc(hidden)]
pub trait Endpoint: Send + Sync + 'static {
    fn call(&self, req: Request) -> BoxFuture<'static, Result<Response, Error>>;
}

/// A type-erased handler shared across concurrent requests.
#[doc(hidden)]
pub type BoxedEndpoint = Arc<dyn Endpoint>;

/// Implemented for every valid route handler.
///
/// You never implement this yourself. It is satisfied by any `async fn` (or
/// closure returning a future) whose parameters are extractors and whose
/// output implements [`IntoOutcome`]:
///
/// ```text
/// async fn name(p1: impl FromRequestParts, ..., last: impl FromRequest) -> impl IntoOutcome
/// ```
pub trait Handler<Args>: Clone + Send + Sync + Sized + 'static {
    /// Rejects, at registration, parameters that can never resolve against a
    /// route declaring `params`.
    #[doc(hidden)]
    fn check(params: &[String]) -> Result<(), Error>;

    #[doc(hidden)]
    fn call(self, req: Request) -> BoxFuture<'static, Result<Response, Error>>;
}

impl<F, Fut, R> Handler<()> for F
where
    F: Fn() -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
    R: IntoOutcome,
{
    fn check(_params: &[String]) -> Result<(), Error> {
        Ok(())
    }

    fn call(self, _req: Request) -> BoxFuture<'static, Result<Response, Error>> {
        Box::pin(async move { self().await.into_outcome() })
    }
}

macro_rules! impl_handler {
    ( [$($ty:ident),*], $last:ident ) => {
        #[allow(non_snake_case, unused_mut)]
        impl<F, Fut, R, $($ty,)* $last> Handler<($($ty,)* $last,)> for F
        where
            F: Fn($($ty,)* $last) -> Fut + Clone + Send + Sync + 'static,
            Fut: Future<Output = R> + Send + 'static,
            R: IntoOutcome,
            $( $ty: FromRequestParts + Send + 'static, )*
            $last: FromRequest + Send + 'static,
        {
            fn check(params: &[String]) -> Result<(), Error> {
                $( <$ty as FromRequestParts>::check(params)?; )*
                <$last as FromRequest>::check(params)
            }

            fn call(self, mut req: Request) -> BoxFuture<'static, Result<Response, Error>> {
                Box::pin(async move {
                    $( let $ty = <$ty as FromRequestParts>::from_request_parts(&mut req).await?; )*
                    let $last = <$last as FromRequest>::from_request(req).await?;
                    self($($ty,)* $last).await.into_outcome()
                })
            }
        }
    };
}

impl_handler!([], T1);
impl_handler!([T1], T2);
impl_handler!([T1, T2], T3);
impl_handler!([T1, T2, T3], T4);
impl_handler!([T1, T2, T3, T4], T5);
impl_handler!([T1, T2, T3, T4, T5], T6);

/// Newtype that holds a concrete handler and implements [`Endpoint`],
/// bridging the typed world to the trait-object world.
struct HandlerEndpoint<H, Args> {
    handler: H,
    _args: PhantomData<fn() -> Args>,
}

impl<H, Args> Endpoint for HandlerEndpoint<H, Args>
where
    H: Handler<Args>,
    Args: 'static,
{
    fn call(&self, req: Request) -> BoxFuture<'static, Result<Response, Error>> {
        self.handler.clone().call(req)
    }
}

pub(crate) fn endpoint<H, Args>(handler: H) -> BoxedEndpoint
where
    H: Handler<Args>,
    Args: 'static,
{
    Arc::new(HandlerEndpoint { handler, _args: PhantomData })
}
