//! Service registry and the outbound client.
//!
//! Services are addressed by logical name. The registry maps each name to a
//! base address once, at setup. A [`ServiceClient`] is bound to the request
//! that created it: every call it makes carries that request's trace, a new
//! span, and whatever is left of its deadline.
//!
//! The client never retries. A failed call surfaces as one of
//! [`Error::UpstreamUnavailable`], [`Error::UpstreamTimeout`] or
//! [`Error::DeadlineExceeded`], and the calling code decides what to do.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::{HeaderValue, Method, Uri};
use http_body_util::{BodyExt, Full};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use tokio::time::Instant;
use tracing::debug;

use crate::context::{ChildSpan, RequestContext};
use crate::error::{BoxError, Error};
use crate::handler::BoxFuture;
use crate::response::Response;

// ── Registry ──────────────────────────────────────────────────────────────────

/// Logical service name → base address.
#[derive(Clone, Debug, Default)]
pub struct ServiceRegistry {
    services: HashMap<String, String>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `base` under `name`, replacing any earlier address.
    ///
    /// `base` must be an absolute URI (`http://users:8080`); a trailing `/`
    /// is dropped so call paths join cleanly.
    pub fn register(&mut self, name: &str, base: &str) -> Result<(), Error> {
        let invalid = |reason: &str| Error::InvalidServiceAddress {
            service: name.to_owned(),
            reason: reason.to_owned(),
        };

        let uri: Uri = base.parse().map_err(|e: http::uri::InvalidUri| invalid(&e.to_string()))?;
        if uri.scheme().is_none() || uri.authority().is_none() {
            return Err(invalid("expected an absolute address such as http://host:port"));
        }

        self.services.insert(name.to_owned(), base.trim_end_matches('/').to_owned());
        Ok(())
    }

    pub fn resolve(&self, name: &str) -> Result<&str, Error> {
        self.services
            .get(name)
            .map(String::as_str)
            .ok_or_else(|| Error::UnknownService(name.to_owned()))
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

// ── Transport ─────────────────────────────────────────────────────────────────

/// Sends one fully built request and returns the buffered answer.
///
/// [`HttpTransport`] is the default. Tests and embedders swap in their own
/// with [`App::transport`](crate::App::transport).
pub trait Transport: Send + Sync + 'static {
    fn send(&self, req: http::Request<Full<Bytes>>) -> BoxFuture<'_, Result<http::Response<Bytes>, BoxError>>;
}

/// Plain-HTTP transport over a pooled hyper client.
#[derive(Clone)]
pub struct HttpTransport {
    client: Client<HttpConnector, Full<Bytes>>,
}

impl HttpTransport {
    pub fn new() -> Self {
        Self { client: Client::builder(TokioExecutor::new()).build_http() }
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for HttpTransport {
    fn send(&self, req: http::Request<Full<Bytes>>) -> BoxFuture<'_, Result<http::Response<Bytes>, BoxError>> {
        Box::pin(async move {
            let (parts, body) = self.client.request(req).await?.into_parts();
            let body = body.collect().await?.to_bytes();
            Ok::<_, BoxError>(http::Response::from_parts(parts, body))
        })
    }
}

// ── Client ────────────────────────────────────────────────────────────────────

/// Outbound calls on behalf of one request.
///
/// Cheap to clone; clones share the registry and transport and carry the
/// same trace and deadline.
#[derive(Clone)]
pub struct ServiceClient {
    registry: Arc<ServiceRegistry>,
    transport: Arc<dyn Transport>,
    trace_id: Arc<str>,
    span_id: Arc<str>,
    deadline: Instant,
}

impl ServiceClient {
    pub fn new(registry: Arc<ServiceRegistry>, transport: Arc<dyn Transport>, context: &RequestContext) -> Self {
        Self {
            registry,
            transport,
            trace_id: Arc::from(context.trace_id()),
            span_id: Arc::from(context.span_id()),
            deadline: context.deadline(),
        }
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    /// Budget left for calls made through this client.
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Calls `path` on `service`.
    ///
    /// `payload`, when given, is sent as a JSON body. The call is bounded by
    /// the remaining budget; once the budget is spent nothing is sent at all.
    /// Upstream 5xx answers become [`Error::UpstreamUnavailable`]; every
    /// other status is returned as a response for the caller to inspect.
    pub async fn call(
        &self,
        service: &str,
        method: Method,
        path: &str,
        payload: Option<Bytes>,
    ) -> Result<Response, Error> {
        let base = self.registry.resolve(service)?;

        let budget = self.remaining();
        if budget.is_zero() {
            debug!(service, %method, path, "deadline already spent, call not sent");
            return Err(Error::DeadlineExceeded);
        }

        let span = ChildSpan::of(&self.trace_id, &self.span_id);
        let mut req = self.build(service, base, &method, path, payload)?;
        span.write_headers(req.headers_mut(), budget);

        let started = Instant::now();
        let outcome = tokio::time::timeout(budget, self.transport.send(req)).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let res = match outcome {
            Err(_) => {
                debug!(service, %method, path, span_id = %span.span_id, elapsed_ms, "upstream call timed out");
                return Err(Error::UpstreamTimeout { service: service.to_owned() });
            }
            Ok(Err(e)) => {
                debug!(service, %method, path, span_id = %span.span_id, elapsed_ms, error = %e, "upstream call failed");
                return Err(Error::UpstreamUnavailable { service: service.to_owned(), reason: e.to_string() });
            }
            Ok(Ok(res)) => res,
        };

        let status = res.status();
        debug!(
            service,
            %method,
            path,
            span_id = %span.span_id,
            status = status.as_u16(),
            elapsed_ms,
            "upstream call completed"
        );

        if status.is_server_error() {
            return Err(Error::UpstreamUnavailable {
                service: service.to_owned(),
                reason: format!("answered {status}"),
            });
        }

        let (parts, body) = res.into_parts();
        Ok(Response::from_parts(parts.status, parts.headers, body))
    }

    pub async fn get(&self, service: &str, path: &str) -> Result<Response, Error> {
        self.call(service, Method::GET, path, None).await
    }

    pub async fn post(&self, service: &str, path: &str, payload: impl Into<Bytes>) -> Result<Response, Error> {
        self.call(service, Method::POST, path, Some(payload.into())).await
    }

    pub async fn put(&self, service: &str, path: &str, payload: impl Into<Bytes>) -> Result<Response, Error> {
        self.call(service, Method::PUT, path, Some(payload.into())).await
    }

    pub async fn delete(&self, service: &str, path: &str) -> Result<Response, Error> {
        self.call(service, Method::DELETE, path, None).await
    }

    fn build(
        &self,
        service: &str,
        base: &str,
        method: &Method,
        path: &str,
        payload: Option<Bytes>,
    ) -> Result<http::Request<Full<Bytes>>, Error> {
        let separator = if path.starts_with('/') { "" } else { "/" };
        let uri: Uri = format!("{base}{separator}{path}")
            .parse()
            .map_err(|e: http::uri::InvalidUri| Error::InvalidServiceAddress {
                service: service.to_owned(),
                reason: e.to_string(),
            })?;

        let mut req = http::Request::new(Full::new(payload.clone().unwrap_or_default()));
        *req.method_mut() = method.clone();
        *req.uri_mut() = uri;
        if payload.is_some() {
            req.headers_mut().insert(http::header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        }
        Ok(req)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{DEADLINE_HEADER, PARENT_SPAN_ID_HEADER, SPAN_ID_HEADER, TRACE_ID_HEADER};
    use http::{HeaderMap, StatusCode};
    use std::sync::Mutex;

    /// Answers every call with `status` after `delay`, recording what it was
    /// sent.
    struct Recording {
        status: StatusCode,
        delay: Duration,
        seen: Mutex<Vec<(Method, Uri, HeaderMap)>>,
    }

    impl Recording {
        fn new(status: StatusCode, delay: Duration) -> Arc<Self> {
            Arc::new(Self { status, delay, seen: Mutex::new(Vec::new()) })
        }
    }

    impl Transport for Recording {
        fn send(&self, req: http::Request<Full<Bytes>>) -> BoxFuture<'_, Result<http::Response<Bytes>, BoxError>> {
            self.seen.lock().unwrap().push((req.method().clone(), req.uri().clone(), req.headers().clone()));
            Box::pin(async move {
                tokio::time::sleep(self.delay).await;
                let mut res = http::Response::new(Bytes::from_static(b"{\"ok\":true}"));
                *res.status_mut() = self.status;
                Ok::<_, BoxError>(res)
            })
        }
    }

    fn registry() -> Arc<ServiceRegistry> {
        let mut registry = ServiceRegistry::new();
        registry.register("users", "http://users.internal:8080/").unwrap();
        Arc::new(registry)
    }

    fn bound(transport: Arc<Recording>, timeout: Duration) -> (ServiceClient, RequestContext) {
        let ctx = RequestContext::root("orders", timeout);
        (ServiceClient::new(registry(), transport, &ctx), ctx)
    }

    #[test]
    fn registry_rejects_relative_addresses() {
        let mut registry = ServiceRegistry::new();
        assert!(matches!(
            registry.register("users", "users:8080/api"),
            Err(Error::InvalidServiceAddress { .. }),
        ));
        assert!(matches!(registry.resolve("users"), Err(Error::UnknownService(_))));
    }

    #[tokio::test]
    async fn propagates_trace_and_remaining_budget() {
        let transport = Recording::new(StatusCode::OK, Duration::ZERO);
        let (client, ctx) = bound(Arc::clone(&transport), Duration::from_secs(2));

        let res = client.get("users", "/users/7").await.unwrap();
        assert_eq!(res.status_code(), StatusCode::OK);

        let seen = transport.seen.lock().unwrap();
        let (method, uri, headers) = &seen[0];
        assert_eq!(method, Method::GET);
        assert_eq!(uri.to_string(), "http://users.internal:8080/users/7");
        assert_eq!(headers[TRACE_ID_HEADER], ctx.trace_id());
        assert_eq!(headers[PARENT_SPAN_ID_HEADER], ctx.span_id());
        assert_ne!(headers[SPAN_ID_HEADER], ctx.span_id());

        let budget: u64 = headers[DEADLINE_HEADER].to_str().unwrap().parse().unwrap();
        assert!(budget > 0 && budget <= 2_000);
    }

    #[tokio::test]
    async fn each_call_gets_its_own_span() {
        let transport = Recording::new(StatusCode::OK, Duration::ZERO);
        let (client, _) = bound(Arc::clone(&transport), Duration::from_secs(2));

        client.get("users", "/a").await.unwrap();
        client.post("users", "/b", "{}").await.unwrap();

        let seen = transport.seen.lock().unwrap();
        assert_ne!(seen[0].2[SPAN_ID_HEADER], seen[1].2[SPAN_ID_HEADER]);
        assert_eq!(seen[1].2[http::header::CONTENT_TYPE], "application/json");
    }

    #[tokio::test(start_paused = true)]
    async fn spent_budget_sends_nothing() {
        let transport = Recording::new(StatusCode::OK, Duration::ZERO);
        let (client, _) = bound(Arc::clone(&transport), Duration::from_millis(10));

        tokio::time::advance(Duration::from_millis(20)).await;
        assert!(matches!(client.get("users", "/users/7").await, Err(Error::DeadlineExceeded)));
        assert!(transport.seen.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_upstream_times_out_at_the_deadline() {
        let transport = Recording::new(StatusCode::OK, Duration::from_secs(5));
        let (client, _) = bound(transport, Duration::from_millis(100));

        let err = client.get("users", "/slow").await.unwrap_err();
        assert!(matches!(err, Error::UpstreamTimeout { ref service } if service == "users"));
        assert!(err.is_deadline());
    }

    #[tokio::test]
    async fn upstream_5xx_is_unavailable_but_4xx_is_returned() {
        let failing = Recording::new(StatusCode::BAD_GATEWAY, Duration::ZERO);
        let (client, _) = bound(failing, Duration::from_secs(1));
        assert!(matches!(client.get("users", "/x").await, Err(Error::UpstreamUnavailable { .. })));

        let missing = Recording::new(StatusCode::NOT_FOUND, Duration::ZERO);
        let (client, _) = bound(missing, Duration::from_secs(1));
        assert_eq!(client.get("users", "/x").await.unwrap().status_code(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn unknown_service_fails_before_sending() {
        let transport = Recording::new(StatusCode::OK, Duration::ZERO);
        let (client, _) = bound(Arc::clone(&transport), Duration::from_secs(1));

        assert!(matches!(client.get("billing", "/x").await, Err(Error::UnknownService(_))));
        assert!(transport.seen.lock().unwrap().is_empty());
    }
}
