//! # spindle
//!
//! The request pipeline of a networked service: routing, onion middleware,
//! parameter injection, trace and deadline propagation, admission control,
//! and an outbound client that carries all of it across the next hop.
//!
//! ## How a request travels
//!
//! ```text
//! transport ─▶ Pipeline::dispatch
//!                ├─ RequestContext (trace id, span id, deadline)
//!                ├─ Router::resolve        404 / 405 stop here
//!                ├─ admission slot         503 + Retry-After when full
//!                └─ global layers ─▶ route layers ─▶ extractors ─▶ handler
//!                                                                    │
//! transport ◀─ x-trace-id ◀─ errors become responses ◀─ layers ◀─────┘
//! ```
//!
//! The last global middleware added is the outermost. Route middleware is
//! always innermost. Handler parameters are resolved one by one, just before
//! the handler runs, from the request, the context bag, application
//! capabilities, path parameters, or a validated JSON body.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use serde::Deserialize;
//! use spindle::{App, Error, Json, Path, Server, ServiceClient, Settings, Valid, Validate};
//! use spindle::middleware::Trace;
//!
//! #[derive(Deserialize, serde::Serialize)]
//! struct NewOrder { sku: String, quantity: u32 }
//!
//! impl Validate for NewOrder {}
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Error> {
//!     let settings = Settings::load()?;
//!     // SPINDLE_CONCURRENCY_LIMIT turns on the global admission scope.
//!     let app = App::with_settings(settings)
//!         .middleware(Trace)
//!         .add_service("users", "http://users.internal:8080")
//!         .get("/orders/{id}", show)
//!         .post("/orders", create);
//!
//!     Server::bind(([0, 0, 0, 0], 3000).into()).serve(app).await
//! }
//!
//! async fn show(Path(id): Path<u64>, users: ServiceClient) -> Result<String, Error> {
//!     let owner = users.get("users", &format!("/owners/{id}")).await?;
//!     Ok(String::from_utf8_lossy(owner.body()).into_owned())
//! }
//!
//! async fn create(Valid(order): Valid<NewOrder>) -> Json<NewOrder> {
//!     Json(order)
//! }
//! ```

mod app;
mod client;
mod config;
mod context;
mod error;
mod extract;
mod handler;
mod lifecycle;
mod limit;
mod request;
mod response;
mod router;
mod server;

pub mod middleware;

pub use app::{App, Pipeline};
pub use client::{HttpTransport, ServiceClient, ServiceRegistry, Transport};
pub use config::Settings;
pub use context::{
    ChildSpan, DEADLINE_HEADER, PARENT_SPAN_ID_HEADER, RequestContext, SPAN_ID_HEADER, TRACE_ID_HEADER,
};
pub use error::{BoxError, Error, FieldError, ValidationErrors};
pub use extract::{FromPathParams, FromRequest, FromRequestParts, Inject, Path, Valid, Validate};
pub use handler::{BoxFuture, Handler};
pub use lifecycle::{Lifecycle, Phase};
pub use limit::{Admission, ConcurrencyLimiter};
pub use request::{Body, Request};
pub use response::{ContentType, IntoOutcome, IntoResponse, Json, Response, ResponseBuilder};
pub use router::{PathParams, Resolved, Route, Router};
pub use server::{Server, shutdown_signal};

pub use http::{Method, StatusCode};
