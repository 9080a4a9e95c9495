//! Unified error type.
//!
//! Every failure the pipeline can produce is an [`Error`] variant. Middleware
//! sees them as the `Err` side of [`Next::run`](crate::middleware::Next::run)
//! and may catch or transform any of them; whatever reaches the pipeline
//! boundary unhandled is turned into a response by [`Error::into_response`].

use std::fmt;

use http::{HeaderValue, Method, StatusCode};
use serde::Serialize;

use crate::response::{IntoResponse, Response};

/// Boxed failure from a collaborator: transport, persistence, lifecycle hook.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// One rejected field of a structured body.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

/// Field-level detail carried by [`Error::ValidationFailed`].
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
#[serde(transparent)]
pub struct ValidationErrors(Vec<FieldError>);

impl ValidationErrors {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a rejected field. Returns `self` for chaining.
    pub fn with(mut self, field: impl Into<String>, message: impl Into<String>) -> Self {
        self.push(field, message);
        self
    }

    pub fn push(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.0.push(FieldError { field: field.into(), message: message.into() });
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FieldError> {
        self.0.iter()
    }

    /// `true` if any entry names `field`.
    pub fn contains_field(&self, field: &str) -> bool {
        self.0.iter().any(|e| e.field == field)
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, e) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{}: {}", e.field, e.message)?;
        }
        Ok(())
    }
}

/// The error type of the request pipeline.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no route for {method} {path}")]
    RouteNotFound { method: Method, path: String },

    #[error("method {method} not allowed for {path}")]
    MethodNotAllowed { method: Method, path: String, allowed: Vec<Method> },

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("bad path parameter `{name}`: cannot read {value:?} as {expected}")]
    BadPathParam { name: String, value: String, expected: &'static str },

    #[error("validation failed: {0}")]
    ValidationFailed(ValidationErrors),

    #[error("unresolvable dependency: {0}")]
    UnresolvableDependency(String),

    #[error("service overloaded")]
    ServiceOverloaded,

    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("upstream `{service}` unavailable: {reason}")]
    UpstreamUnavailable { service: String, reason: String },

    #[error("upstream `{service}` timed out")]
    UpstreamTimeout { service: String },

    #[error("unknown service `{0}`")]
    UnknownService(String),

    #[error("invalid address for service `{service}`: {reason}")]
    InvalidServiceAddress { service: String, reason: String },

    #[error("transaction failure: {0}")]
    TransactionFailure(#[source] BoxError),

    /// A handler-chosen status with a client-facing detail message.
    #[error("{status}: {detail}")]
    Status { status: StatusCode, detail: String },

    #[error("handler failure: {0}")]
    Handler(#[source] BoxError),

    #[error("route conflict for {method} `{pattern}`: {reason}")]
    RouteConflict { method: Method, pattern: String, reason: String },

    #[error("startup hook failed: {0}")]
    Startup(#[source] BoxError),

    #[error("configuration: {0}")]
    Config(#[from] figment::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Wraps any failure raised by handler code.
    pub fn handler(err: impl Into<BoxError>) -> Self {
        Self::Handler(err.into())
    }

    /// A failure that answers with `status` and shows `detail` to the client.
    pub fn with_status(status: StatusCode, detail: impl Into<String>) -> Self {
        Self::Status { status, detail: detail.into() }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::RouteNotFound { .. } => StatusCode::NOT_FOUND,
            Self::MethodNotAllowed { .. } => StatusCode::METHOD_NOT_ALLOWED,
            Self::BadRequest(_) | Self::BadPathParam { .. } => StatusCode::BAD_REQUEST,
            Self::ValidationFailed(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::ServiceOverloaded => StatusCode::SERVICE_UNAVAILABLE,
            Self::DeadlineExceeded | Self::UpstreamTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::UpstreamUnavailable { .. } => StatusCode::BAD_GATEWAY,
            Self::Status { status, .. } => *status,
            Self::UnresolvableDependency(_)
            | Self::UnknownService(_)
            | Self::InvalidServiceAddress { .. }
            | Self::TransactionFailure(_)
            | Self::Handler(_)
            | Self::RouteConflict { .. }
            | Self::Startup(_)
            | Self::Config(_)
            | Self::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Expected outcomes of normal operation. These are logged at `debug`,
    /// never at `error`.
    pub fn is_routine(&self) -> bool {
        match self {
            Self::RouteNotFound { .. }
            | Self::MethodNotAllowed { .. }
            | Self::BadRequest(_)
            | Self::BadPathParam { .. }
            | Self::ValidationFailed(_)
            | Self::ServiceOverloaded
            | Self::DeadlineExceeded
            | Self::UpstreamTimeout { .. } => true,
            Self::Status { status, .. } => !status.is_server_error(),
            _ => false,
        }
    }

    /// `true` for the two ways a call runs out of time.
    pub fn is_deadline(&self) -> bool {
        matches!(self, Self::DeadlineExceeded | Self::UpstreamTimeout { .. })
    }

    /// Converts into a client-facing response.
    ///
    /// With `debug` off, internal failures answer with a generic message so
    /// nothing about the process leaks to the caller.
    pub fn into_response_with(self, debug: bool) -> Response {
        let status = self.status();
        let message = if debug { self.to_string() } else { self.public_message() };

        let body = match &self {
            Self::ValidationFailed(fields) => {
                serde_json::json!({ "error": "validation failed", "fields": fields })
            }
            _ => serde_json::json!({ "error": message }),
        };

        let mut res = Response::builder()
            .status(status)
            .json(serde_json::to_vec(&body).unwrap_or_default());

        match &self {
            Self::ServiceOverloaded => {
                res.headers.insert(http::header::RETRY_AFTER, HeaderValue::from_static("1"));
            }
            Self::MethodNotAllowed { allowed, .. } => {
                let allow = allowed.iter().map(Method::as_str).collect::<Vec<_>>().join(", ");
                if let Ok(value) = HeaderValue::from_str(&allow) {
                    res.headers.insert(http::header::ALLOW, value);
                }
            }
            _ => {}
        }
        res
    }

    fn public_message(&self) -> String {
        match self {
            Self::Status { detail, .. } => detail.clone(),
            Self::UpstreamUnavailable { .. } => "upstream unavailable".to_owned(),
            Self::UpstreamTimeout { .. } => "upstream timed out".to_owned(),
            e if e.status() == StatusCode::INTERNAL_SERVER_ERROR => "internal server error".to_owned(),
            e => e.to_string(),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        self.into_response_with(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taxonomy_maps_to_statuses() {
        assert_eq!(Error::ServiceOverloaded.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(Error::DeadlineExceeded.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            Error::ValidationFailed(ValidationErrors::new()).status(),
            StatusCode::UNPROCESSABLE_ENTITY,
        );
        assert_eq!(
            Error::UpstreamUnavailable { service: "users".into(), reason: "refused".into() }.status(),
            StatusCode::BAD_GATEWAY,
        );
        assert_eq!(Error::UnknownService("x".into()).status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn overload_and_deadline_are_routine() {
        assert!(Error::ServiceOverloaded.is_routine());
        assert!(Error::DeadlineExceeded.is_routine());
        assert!(!Error::handler("boom").is_routine());
    }

    #[test]
    fn internal_detail_is_hidden_unless_debug() {
        let res = Error::handler("db password is hunter2").into_response_with(false);
        assert_eq!(res.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!String::from_utf8_lossy(res.body()).contains("hunter2"));

        let res = Error::handler("db password is hunter2").into_response_with(true);
        assert!(String::from_utf8_lossy(res.body()).contains("hunter2"));
    }

    #[test]
    fn overload_response_carries_retry_after() {
        let res = Error::ServiceOverloaded.into_response();
        assert_eq!(res.header("retry-after"), Some("1"));
    }

    #[test]
    fn validation_response_names_fields() {
        let errs = ValidationErrors::new().with("price", "missing field");
        let res = Error::ValidationFailed(errs).into_response();
        let body: serde_json::Value = serde_json::from_slice(res.body()).unwrap();
        assert_eq!(body["fields"][0]["field"], "price");
    }
}
