//! Application setup and the frozen request pipeline.
//!
//! Everything is registered on an [`App`] (routes, middleware, services,
//! capabilities, lifecycle hooks), then [`App::build`] freezes it into a
//! [`Pipeline`]. The pipeline is read-only from then on; every request it
//! dispatches shares it by reference and nothing in it is locked.

use std::future::Future;
use std::sync::Arc;

use http::{Extensions, HeaderValue, Method};
use tracing::{Instrument, debug, error, info_span};

use crate::client::{HttpTransport, ServiceRegistry, Transport};
use crate::config::Settings;
use crate::context::{RequestContext, TRACE_ID_HEADER};
use crate::error::{BoxError, Error};
use crate::handler::{Handler, endpoint};
use crate::lifecycle::{Lifecycle, Phase};
use crate::limit::ConcurrencyLimiter;
use crate::middleware::{BoxedMiddleware, Middleware, Next};
use crate::request::{Body, Request};
use crate::response::Response;
use crate::router::{Route, Router, param_names};

/// State every request can reach: settings, the service registry, the
/// outbound transport, and application-wide capabilities.
pub(crate) struct Shared {
    pub(crate) settings: Settings,
    pub(crate) registry: Arc<ServiceRegistry>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) capabilities: Extensions,
}

/// The application builder.
///
/// Each call returns `self`, so setup chains:
///
/// ```rust,no_run
/// # use spindle::{App, Path, middleware::Trace};
/// # async fn show(Path(id): Path<u64>) -> String { id.to_string() }
/// let app = App::new()
///     .middleware(Trace)
///     .add_service("users", "http://users.internal:8080")
///     .get("/orders/{id}", show);
/// ```
///
/// Registration mistakes (two routes with the same shape, a `Path<T>` whose
/// arity does not match the pattern, a malformed service address) panic in
/// the chaining methods; the `try_` variants return them as errors instead.
pub struct App {
    settings: Settings,
    router: Router,
    middleware: Vec<BoxedMiddleware>,
    registry: ServiceRegistry,
    capabilities: Extensions,
    lifecycle: Lifecycle,
    transport: Option<Arc<dyn Transport>>,
}

impl App {
    pub fn new() -> Self {
        Self::with_settings(Settings::default())
    }

    /// Starts from explicit settings, typically [`Settings::load`].
    pub fn with_settings(settings: Settings) -> Self {
        Self {
            settings,
            router: Router::new(),
            middleware: Vec::new(),
            registry: ServiceRegistry::new(),
            capabilities: Extensions::new(),
            lifecycle: Lifecycle::new(),
            transport: None,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    // ── Routes ────────────────────────────────────────────────────────────────

    /// Registers `handler` for `method` + `path`.
    ///
    /// Path parameters use `{name}` syntax; a trailing `{*name}` captures the
    /// rest of the path.
    ///
    /// # Panics
    ///
    /// On a registration error; see [`App::try_on_with`].
    pub fn on<H, Args>(self, method: Method, path: &str, handler: H) -> Self
    where
        H: Handler<Args>,
        Args: 'static,
    {
        self.on_with(method, path, Vec::new(), handler)
    }

    /// Like [`App::on`], with route middleware that runs inside every global
    /// layer, in the order given.
    pub fn on_with<H, Args>(self, method: Method, path: &str, middleware: Vec<BoxedMiddleware>, handler: H) -> Self
    where
        H: Handler<Args>,
        Args: 'static,
    {
        self.try_on_with(method, path, middleware, handler)
            .unwrap_or_else(|e| panic!("invalid route `{path}`: {e}"))
    }

    /// Registers a route, returning registration errors instead of
    /// panicking: [`Error::RouteConflict`] when a pattern of the same shape
    /// already exists for `method`, [`Error::UnresolvableDependency`] when a
    /// handler parameter can never resolve against `path`.
    pub fn try_on_with<H, Args>(
        mut self,
        method: Method,
        path: &str,
        middleware: Vec<BoxedMiddleware>,
        handler: H,
    ) -> Result<Self, Error>
    where
        H: Handler<Args>,
        Args: 'static,
    {
        H::check(&param_names(path))?;
        self.router.insert(Route::new(method, path, endpoint(handler), middleware))?;
        Ok(self)
    }

    pub fn get<H: Handler<Args>, Args: 'static>(self, path: &str, handler: H) -> Self {
        self.on(Method::GET, path, handler)
    }

    pub fn post<H: Handler<Args>, Args: 'static>(self, path: &str, handler: H) -> Self {
        self.on(Method::POST, path, handler)
    }

    pub fn put<H: Handler<Args>, Args: 'static>(self, path: &str, handler: H) -> Self {
        self.on(Method::PUT, path, handler)
    }

    pub fn patch<H: Handler<Args>, Args: 'static>(self, path: &str, handler: H) -> Self {
        self.on(Method::PATCH, path, handler)
    }

    pub fn delete<H: Handler<Args>, Args: 'static>(self, path: &str, handler: H) -> Self {
        self.on(Method::DELETE, path, handler)
    }

    // ── Middleware, services, capabilities ────────────────────────────────────

    /// Adds a global layer around everything added before it.
    pub fn middleware(mut self, middleware: impl Middleware) -> Self {
        self.middleware.push(Arc::new(middleware));
        self
    }

    /// Maps a logical service name to its base address.
    ///
    /// # Panics
    ///
    /// If `base` is not an absolute address; see [`App::try_add_service`].
    pub fn add_service(self, name: &str, base: &str) -> Self {
        self.try_add_service(name, base)
            .unwrap_or_else(|e| panic!("invalid service `{name}`: {e}"))
    }

    pub fn try_add_service(mut self, name: &str, base: &str) -> Result<Self, Error> {
        self.registry.register(name, base)?;
        Ok(self)
    }

    /// Makes `value` injectable (`Inject<T>`) in every request.
    ///
    /// A request-scoped value of the same type, attached by middleware,
    /// takes precedence.
    pub fn provide<T: Clone + Send + Sync + 'static>(mut self, value: T) -> Self {
        self.capabilities.insert(value);
        self
    }

    /// Replaces the outbound transport used by [`ServiceClient`](crate::ServiceClient).
    pub fn transport(mut self, transport: impl Transport) -> Self {
        self.transport = Some(Arc::new(transport));
        self
    }

    /// Registers a lifecycle hook.
    pub fn on_event<F, Fut, E>(mut self, phase: Phase, hook: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Into<BoxError>,
    {
        self.lifecycle.on(phase, hook);
        self
    }

    /// Freezes the application.
    ///
    /// Global middleware is ordered so the last one added is outermost, and
    /// every route's full chain is built here, once.
    pub fn build(self) -> Pipeline {
        let Self { settings, mut router, mut middleware, registry, capabilities, lifecycle, transport } = self;

        middleware.reverse();
        router.seal(&middleware);

        let limiter = settings
            .concurrency_limit
            .map(|capacity| ConcurrencyLimiter::new(capacity, settings.concurrency_max_wait()));

        let transport = transport.unwrap_or_else(|| Arc::new(HttpTransport::new()));

        Pipeline {
            router,
            limiter,
            lifecycle,
            shared: Arc::new(Shared {
                settings,
                registry: Arc::new(registry),
                transport,
                capabilities,
            }),
        }
    }
}

impl Default for App {
    fn default() -> Self {
        Self::new()
    }
}

// ── The frozen pipeline ───────────────────────────────────────────────────────

/// A built application: the entry point transports hand requests to.
pub struct Pipeline {
    router: Router,
    limiter: Option<ConcurrencyLimiter>,
    lifecycle: Lifecycle,
    shared: Arc<Shared>,
}

impl Pipeline {
    /// Runs one request through routing, admission, the middleware chain and
    /// the handler. Never fails: every error becomes a response here.
    ///
    /// The response carries the request's trace id in `x-trace-id`.
    pub async fn dispatch(&self, req: http::Request<Body>) -> Response {
        let (parts, body) = req.into_parts();
        let settings = &self.shared.settings;
        let context = RequestContext::from_headers(&parts.headers, settings.default_timeout(), &settings.service_name);

        let trace_id = context.trace_id().to_owned();
        let span = info_span!(
            "request",
            method = %parts.method,
            path = parts.uri.path(),
            trace_id = context.trace_id(),
            span_id = context.span_id(),
        );

        let mut res = async {
            match self.run(parts, body, context).await {
                Ok(res) => res,
                Err(err) => {
                    if err.is_routine() {
                        debug!(status = err.status().as_u16(), error = %err, "request rejected");
                    } else {
                        error!(status = err.status().as_u16(), error = %err, "request failed");
                    }
                    err.into_response_with(settings.debug)
                }
            }
        }
        .instrument(span)
        .await;

        if let Ok(value) = HeaderValue::from_str(&trace_id) {
            res.headers.insert(TRACE_ID_HEADER, value);
        }
        res
    }

    async fn run(&self, parts: http::request::Parts, body: Body, context: RequestContext) -> Result<Response, Error> {
        let resolved = self.router.resolve(&parts.method, parts.uri.path())?;
        let chain = resolved.route.chain();
        let endpoint = resolved.route.endpoint();

        // Held until the chain has finished, whichever way it finishes.
        let _admission = match &self.limiter {
            Some(limiter) => Some(limiter.acquire().await?),
            None => None,
        };

        let req = Request::new(parts, body, resolved.params, context, Arc::clone(&self.shared));
        Next::new(chain, endpoint).run(req).await
    }

    /// Runs the startup hooks. Transports call this before accepting work.
    pub async fn startup(&self) -> Result<(), Error> {
        self.lifecycle.startup().await
    }

    /// Runs the shutdown hooks. Transports call this after draining.
    pub async fn shutdown(&self) {
        self.lifecycle.shutdown().await
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    /// The global admission controller, when `concurrency_limit` is set.
    pub fn limiter(&self) -> Option<&ConcurrencyLimiter> {
        self.limiter.as_ref()
    }

    pub fn settings(&self) -> &Settings {
        &self.shared.settings
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.shared.registry
    }

    /// Builds the request a handler would see, without running anything.
    #[cfg(test)]
    pub(crate) fn request_for_test(&self, req: http::Request<Body>) -> Request {
        let (parts, body) = req.into_parts();
        let settings = &self.shared.settings;
        let context = RequestContext::from_headers(&parts.headers, settings.default_timeout(), &settings.service_name);
        let params = self
            .router
            .resolve(&parts.method, parts.uri.path())
            .map(|resolved| resolved.params)
            .unwrap_or_default();
        Request::new(parts, body, params, context, Arc::clone(&self.shared))
    }
}

impl From<App> for Pipeline {
    fn from(app: App) -> Self {
        app.build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::Path;

    async fn show(Path(id): Path<u64>) -> String {
        id.to_string()
    }

    #[test]
    fn conflicting_route_is_a_setup_error() {
        let result = App::new()
            .get("/items/{id}", show)
            .try_on_with(Method::GET, "/items/{key}", Vec::new(), show);
        assert!(matches!(result, Err(Error::RouteConflict { .. })));
    }

    #[test]
    fn path_arity_is_checked_at_registration() {
        let result = App::new().try_on_with(Method::GET, "/items", Vec::new(), show);
        assert!(matches!(result, Err(Error::UnresolvableDependency(_))));
    }

    #[test]
    fn malformed_service_address_is_a_setup_error() {
        assert!(matches!(
            App::new().try_add_service("users", "not an address"),
            Err(Error::InvalidServiceAddress { .. }),
        ));
    }

    #[tokio::test]
    async fn response_carries_the_trace_id() {
        let pipeline = App::new().get("/items/{id}", show).build();
        let req = http::Request::get("/items/3")
            .header(TRACE_ID_HEADER, "abc123")
            .body(Body::empty())
            .unwrap();

        let res = pipeline.dispatch(req).await;
        assert_eq!(res.status_code(), http::StatusCode::OK);
        assert_eq!(res.header(TRACE_ID_HEADER), Some("abc123"));
        assert_eq!(&res.body()[..], b"3");
    }

    #[tokio::test]
    async fn unparsable_path_parameter_is_a_bad_request() {
        let pipeline = App::new().get("/items/{id}", show).build();
        let req = http::Request::get("/items/seven").body(Body::empty()).unwrap();
        assert_eq!(pipeline.dispatch(req).await.status_code(), http::StatusCode::BAD_REQUEST);
    }
}
