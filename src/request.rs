//! Incoming request type and its lazily read body.

use std::sync::Arc;

use bytes::Bytes;
use http::{HeaderMap, Method, Uri};
use http_body_util::BodyExt;

use crate::app::Shared;
use crate::client::ServiceClient;
use crate::context::RequestContext;
use crate::error::Error;
use crate::router::PathParams;

/// A request body as the transport hands it over.
///
/// Streaming bodies are not read until something asks for them; after the
/// first read the bytes are kept, so later readers see the same content.
#[derive(Debug, Default)]
pub struct Body(Inner);

#[derive(Debug, Default)]
enum Inner {
    #[default]
    Empty,
    Full(Bytes),
    Incoming(hyper::body::Incoming),
}

impl Body {
    pub fn empty() -> Self {
        Self(Inner::Empty)
    }

    async fn collect(self) -> Result<Bytes, hyper::Error> {
        match self.0 {
            Inner::Empty => Ok(Bytes::new()),
            Inner::Full(bytes) => Ok(bytes),
            Inner::Incoming(incoming) => Ok(incoming.collect().await?.to_bytes()),
        }
    }
}

impl From<hyper::body::Incoming> for Body {
    fn from(incoming: hyper::body::Incoming) -> Self { Self(Inner::Incoming(incoming)) }
}

impl From<Bytes> for Body {
    fn from(bytes: Bytes) -> Self { Self(Inner::Full(bytes)) }
}

impl From<Vec<u8>> for Body {
    fn from(bytes: Vec<u8>) -> Self { Self(Inner::Full(bytes.into())) }
}

impl From<String> for Body {
    fn from(s: String) -> Self { Self(Inner::Full(s.into())) }
}

impl From<&'static str> for Body {
    fn from(s: &'static str) -> Self { Self(Inner::Full(Bytes::from_static(s.as_bytes()))) }
}

/// An incoming request, owned by the one pipeline invocation that built it.
pub struct Request {
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Body,
    params: PathParams,
    context: RequestContext,
    shared: Arc<Shared>,
}

impl Request {
    pub(crate) fn new(
        parts: http::request::Parts,
        body: Body,
        params: PathParams,
        context: RequestContext,
        shared: Arc<Shared>,
    ) -> Self {
        Self {
            method: parts.method,
            uri: parts.uri,
            headers: parts.headers,
            body,
            params,
            context,
            shared,
        }
    }

    pub fn method(&self) -> &Method { &self.method }
    pub fn uri(&self) -> &Uri { &self.uri }
    pub fn path(&self) -> &str { self.uri.path() }
    pub fn query(&self) -> Option<&str> { self.uri.query() }
    pub fn headers(&self) -> &HeaderMap { &self.headers }
    pub fn params(&self) -> &PathParams { &self.params }
    pub fn context(&self) -> &RequestContext { &self.context }

    /// Mutable access for middleware that attaches request-scoped values.
    pub fn context_mut(&mut self) -> &mut RequestContext { &mut self.context }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Returns a named path parameter as matched, before any coercion.
    ///
    /// For a route `/users/{id}`, `req.param("id")` on `/users/42` returns `Some("42")`.
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key)
    }

    /// Reads the body, buffering it on first use.
    pub async fn body(&mut self) -> Result<Bytes, Error> {
        let bytes = std::mem::take(&mut self.body)
            .collect()
            .await
            .map_err(|e| Error::BadRequest(format!("unreadable body: {e}")))?;
        self.body = Body::from(bytes.clone());
        Ok(bytes)
    }

    /// A client for outbound calls that carries this request's trace and
    /// deadline.
    pub fn client(&self) -> ServiceClient {
        ServiceClient::new(
            Arc::clone(&self.shared.registry),
            Arc::clone(&self.shared.transport),
            &self.context,
        )
    }

    /// An application-wide value registered with [`App::provide`](crate::App::provide).
    pub fn capability<T: Send + Sync + 'static>(&self) -> Option<&T> {
        self.shared.capabilities.get::<T>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::App;

    #[tokio::test]
    async fn body_can_be_read_twice() {
        let mut req = App::new().build().request_for_test(
            http::Request::post("/items").body(Body::from("payload")).unwrap(),
        );
        assert_eq!(&req.body().await.unwrap()[..], b"payload");
        assert_eq!(&req.body().await.unwrap()[..], b"payload");
    }

    #[tokio::test]
    async fn header_lookup_ignores_case() {
        let req = App::new().build().request_for_test(
            http::Request::get("/items?page=2")
                .header("X-Api-Key", "k1")
                .body(Body::empty())
                .unwrap(),
        );
        assert_eq!(req.header("x-api-key"), Some("k1"));
        assert_eq!(req.query(), Some("page=2"));
        assert_eq!(req.path(), "/items");
    }
}
