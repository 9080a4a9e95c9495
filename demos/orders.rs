//! An orders service that calls a users service on the next hop.
//!
//! Run with:
//!   RUST_LOG=debug SPINDLE_SERVICE_NAME=orders SPINDLE_CONCURRENCY_LIMIT=64 \
//!     cargo run --example orders
//!
//! Try:
//!   curl -i http://localhost:3000/orders/42 -H 'x-deadline-ms: 500'
//!   curl -i -X POST http://localhost:3000/orders \
//!        -H 'content-type: application/json' \
//!        -d '{"sku":"tea","quantity":2}'
//!   curl -i -X POST http://localhost:3000/orders -d '{"sku":"tea"}'   # 422, names `quantity`
//!   curl -i http://localhost:3000/private                             # 401 from the auth layer

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use spindle::middleware::{Next, Trace, boxed, from_fn};
use spindle::{
    App, BoxError, Error, Inject, Json, Path, Phase, Request, Response, Server, ServiceClient, Settings,
    StatusCode, Valid, Validate, ValidationErrors,
};

#[derive(Deserialize, Serialize)]
struct NewOrder {
    sku: String,
    quantity: u32,
}

impl Validate for NewOrder {
    fn validate(&self) -> Result<(), ValidationErrors> {
        if self.quantity == 0 {
            return Err(ValidationErrors::new().with("quantity", "must be at least 1"));
        }
        Ok(())
    }
}

/// Stand-in for a real id sequence.
#[derive(Clone, Default)]
struct Ids(Arc<AtomicU64>);

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt::init();

    let settings = Settings::load()?;

    let require_auth = from_fn(|req: Request, next: Next| async move {
        if req.header("authorization").is_some() {
            next.run(req).await
        } else {
            Ok(Response::status(StatusCode::UNAUTHORIZED))
        }
    });

    let app = App::with_settings(settings)
        .middleware(Trace)
        .add_service("users", "http://localhost:3001")
        .provide(Ids::default())
        .on_event(Phase::Startup, || async {
            tracing::info!("orders warming up");
            Ok::<_, BoxError>(())
        })
        .on_event(Phase::Shutdown, || async {
            tracing::info!("orders flushed");
            Ok::<_, BoxError>(())
        })
        .get("/orders/{id}", show)
        .post("/orders", create)
        .on_with(spindle::Method::GET, "/private", vec![boxed(require_auth)], || async { "secret" });

    Server::bind(([0, 0, 0, 0], 3000).into()).serve(app).await
}

// GET /orders/{id}: looks the owner up on the users service.
async fn show(Path(id): Path<u64>, users: ServiceClient) -> Result<String, Error> {
    let owner = users.get("users", &format!("/users/{id}")).await?;
    Ok(format!(r#"{{"id":{id},"owner":{}}}"#, String::from_utf8_lossy(owner.body())))
}

// POST /orders
async fn create(Inject(ids): Inject<Ids>, Valid(order): Valid<NewOrder>) -> (StatusCode, Json<serde_json::Value>) {
    let id = ids.0.fetch_add(1, Ordering::Relaxed) + 1;
    let body = serde_json::json!({ "id": id, "sku": order.sku, "quantity": order.quantity });
    (StatusCode::CREATED, Json(body))
}
