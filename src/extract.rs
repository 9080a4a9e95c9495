//! Dependency resolution for handler parameters.
//!
//! Every handler parameter is an extractor: a type that knows how to produce
//! itself from the live request. Resolution runs once per parameter per
//! request, in declaration order, just before the handler body executes,
//! and nothing is cached across requests.
//!
//! | Parameter | Resolved from | Fails with |
//! |---|---|---|
//! | [`Request`] | the live request itself (last parameter only) | never |
//! | [`RequestContext`], [`ServiceClient`] | the request context | never |
//! | [`Inject<T>`] | values attached by upstream middleware, then values given to [`App::provide`](crate::App::provide) | `UnresolvableDependency` |
//! | [`Path<T>`] | path parameters, coerced to `T` | `BadPathParam` |
//! | [`PathParams`] | path parameters, raw | never |
//! | [`Valid<T>`] | the body, decoded and checked by [`Validate`] (last parameter only) | `ValidationFailed`, `BadRequest` |
//!
//! `Path<T>` is checked against the route pattern at registration: a
//! mismatch in parameter count is a setup error, not a request-time one.

use std::any::type_name;
use std::future::{Future, ready};
use std::str::FromStr;

use bytes::Bytes;
use http::HeaderMap;
use serde::de::DeserializeOwned;
use serde_json::error::Category;

use crate::client::ServiceClient;
use crate::context::RequestContext;
use crate::error::{Error, ValidationErrors};
use crate::request::Request;
use crate::router::PathParams;

/// Resolves a parameter by borrowing the request.
pub trait FromRequestParts: Sized {
    /// Setup-time check against the route's declared parameter names.
    fn check(_params: &[String]) -> Result<(), Error> {
        Ok(())
    }

    fn from_request_parts(req: &mut Request) -> impl Future<Output = Result<Self, Error>> + Send;
}

/// Resolves a parameter by consuming the request. Only the last handler
/// parameter can be one of these.
pub trait FromRequest: Sized {
    fn check(_params: &[String]) -> Result<(), Error> {
        Ok(())
    }

    fn from_request(req: Request) -> impl Future<Output = Result<Self, Error>> + Send;
}

impl<T> FromRequest for T
where
    T: FromRequestParts + Send,
{
    fn check(params: &[String]) -> Result<(), Error> {
        <T as FromRequestParts>::check(params)
    }

    fn from_request(mut req: Request) -> impl Future<Output = Result<Self, Error>> + Send {
        async move { T::from_request_parts(&mut req).await }
    }
}

// ── The request itself ────────────────────────────────────────────────────────

impl FromRequest for Request {
    fn from_request(req: Request) -> impl Future<Output = Result<Self, Error>> + Send {
        ready(Ok(req))
    }
}

impl FromRequestParts for RequestContext {
    fn from_request_parts(req: &mut Request) -> impl Future<Output = Result<Self, Error>> + Send {
        ready(Ok(req.context().clone()))
    }
}

impl FromRequestParts for ServiceClient {
    fn from_request_parts(req: &mut Request) -> impl Future<Output = Result<Self, Error>> + Send {
        ready(Ok(req.client()))
    }
}

impl FromRequestParts for HeaderMap {
    fn from_request_parts(req: &mut Request) -> impl Future<Output = Result<Self, Error>> + Send {
        ready(Ok(req.headers().clone()))
    }
}

// ── Injected capabilities ─────────────────────────────────────────────────────

/// A value of type `T` injected upstream.
///
/// Request-scoped values (a database session attached by
/// [`Transaction`](crate::middleware::Transaction), anything a middleware
/// put in the context bag) win over application-wide ones.
#[derive(Clone, Debug)]
pub struct Inject<T>(pub T);

impl<T> FromRequestParts for Inject<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn from_request_parts(req: &mut Request) -> impl Future<Output = Result<Self, Error>> + Send {
        let found = req
            .context()
            .get::<T>()
            .or_else(|| req.capability::<T>())
            .cloned()
            .map(Inject)
            .ok_or_else(|| {
                Error::UnresolvableDependency(format!("nothing injected for `{}`", type_name::<T>()))
            });
        ready(found)
    }
}

// ── Path parameters ───────────────────────────────────────────────────────────

/// Path parameters coerced by position: `Path<u64>` for one, `Path<(String,
/// u32)>` for two.
#[derive(Clone, Debug)]
pub struct Path<T>(pub T);

/// Types a [`Path`] can hold.
pub trait FromPathParams: Sized {
    /// How many path parameters this consumes.
    const ARITY: usize;

    fn from_path_params(params: &PathParams) -> Result<Self, Error>;
}

impl<T> FromRequestParts for Path<T>
where
    T: FromPathParams + Send,
{
    fn check(params: &[String]) -> Result<(), Error> {
        if params.len() == T::ARITY {
            return Ok(());
        }
        Err(Error::UnresolvableDependency(format!(
            "`Path<{}>` takes {} path parameter(s) but the route declares {:?}",
            type_name::<T>(),
            T::ARITY,
            params,
        )))
    }

    fn from_request_parts(req: &mut Request) -> impl Future<Output = Result<Self, Error>> + Send {
        ready(T::from_path_params(req.params()).map(Path))
    }
}

impl FromRequestParts for PathParams {
    fn from_request_parts(req: &mut Request) -> impl Future<Output = Result<Self, Error>> + Send {
        ready(Ok(req.params().clone()))
    }
}

impl PathParams {
    /// Looks up `name` and coerces it to `T`.
    pub fn parse<T: FromStr>(&self, name: &str) -> Result<T, Error> {
        let value = self.get(name).ok_or_else(|| {
            Error::UnresolvableDependency(format!("no path parameter named `{name}`"))
        })?;
        coerce(name, value)
    }
}

fn coerce<T: FromStr>(name: &str, value: &str) -> Result<T, Error> {
    value.parse::<T>().map_err(|_| Error::BadPathParam {
        name: name.to_owned(),
        value: value.to_owned(),
        expected: type_name::<T>(),
    })
}

fn coerce_at<T: FromStr>(params: &PathParams, index: usize) -> Result<T, Error> {
    let (name, value) = params.iter().nth(index).ok_or_else(|| {
        Error::UnresolvableDependency(format!("no path parameter at position {index}"))
    })?;
    coerce(name, value)
}

macro_rules! path_scalar {
    ($($ty:ty),* $(,)?) => {
        $(
            impl FromPathParams for $ty {
                const ARITY: usize = 1;

                fn from_path_params(params: &PathParams) -> Result<Self, Error> {
                    coerce_at(params, 0)
                }
            }
        )*
    };
}

path_scalar!(
    String, bool, char,
    u8, u16, u32, u64, u128, usize,
    i8, i16, i32, i64, i128, isize,
    f32, f64, uuid::Uuid,
);

macro_rules! path_tuple {
    ($n:expr; $($ty:ident => $idx:tt),+) => {
        impl<$($ty: FromStr),+> FromPathParams for ($($ty,)+) {
            const ARITY: usize = $n;

            fn from_path_params(params: &PathParams) -> Result<Self, Error> {
                Ok(($(coerce_at::<$ty>(params, $idx)?,)+))
            }
        }
    };
}

path_tuple!(2; A => 0, B => 1);
path_tuple!(3; A => 0, B => 1, C => 2);
path_tuple!(4; A => 0, B => 1, C => 2, D => 3);

// ── Bodies ────────────────────────────────────────────────────────────────────

impl FromRequest for Bytes {
    fn from_request(mut req: Request) -> impl Future<Output = Result<Self, Error>> + Send {
        async move { req.body().await }
    }
}

/// The validator capability of a structured body model.
///
/// Decoding already rejects missing or mistyped fields; implement
/// `validate` for rules beyond the shape (ranges, formats, cross-field).
pub trait Validate {
    fn validate(&self) -> Result<(), ValidationErrors> {
        Ok(())
    }
}

/// A JSON body decoded into `T` and accepted by its [`Validate`] impl.
///
/// An empty body decodes as `{}`, so required fields are reported as
/// missing rather than as a syntax error.
#[derive(Clone, Debug)]
pub struct Valid<T>(pub T);

impl<T> FromRequest for Valid<T>
where
    T: DeserializeOwned + Validate + Send,
{
    fn from_request(mut req: Request) -> impl Future<Output = Result<Self, Error>> + Send {
        async move {
            let body = req.body().await?;
            let model: T = decode(&body)?;
            model.validate().map_err(Error::ValidationFailed)?;
            Ok(Valid(model))
        }
    }
}

fn decode<T: DeserializeOwned>(body: &[u8]) -> Result<T, Error> {
    let body = if body.iter().all(u8::is_ascii_whitespace) { b"{}".as_slice() } else { body };

    let mut de = serde_json::Deserializer::from_slice(body);
    let model = serde_path_to_error::deserialize(&mut de).map_err(|e| {
        let path = e.path().to_string();
        reject(&path, e.into_inner())
    })?;
    de.end().map_err(|e| reject(".", e))?;
    Ok(model)
}

fn reject(path: &str, e: serde_json::Error) -> Error {
    match e.classify() {
        Category::Data => Error::ValidationFailed(field_errors(path, &e)),
        Category::Syntax | Category::Eof | Category::Io => Error::BadRequest(format!("invalid JSON body: {e}")),
    }
}

/// Names the failing field as a dotted path (`lines[0].quantity`).
///
/// Type mismatches are located by the decoder's path. Missing, unknown and
/// duplicate fields fail on the enclosing object, so the field serde_json
/// names in its message is appended. A failure at the root with no field
/// name is reported on `body`.
fn field_errors(path: &str, e: &serde_json::Error) -> ValidationErrors {
    let full = e.to_string();
    let message = full.split(" at line ").next().unwrap_or(&full);
    let named = ["missing field", "unknown field", "duplicate field"]
        .iter()
        .any(|p| message.starts_with(p))
        .then(|| message.split('`').nth(1))
        .flatten();

    let field = match (path, named) {
        (".", Some(name)) => name.to_owned(),
        (".", None) => "body".to_owned(),
        (path, Some(name)) if path != name && !path.ends_with(&format!(".{name}")) => format!("{path}.{name}"),
        (path, _) => path.to_owned(),
    };
    ValidationErrors::new().with(field, message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    struct Item {
        #[allow(dead_code)]
        name: String,
        price: i64,
    }

    impl Validate for Item {
        fn validate(&self) -> Result<(), ValidationErrors> {
            if self.price < 0 {
                return Err(ValidationErrors::new().with("price", "must not be negative"));
            }
            Ok(())
        }
    }

    fn params(pairs: &[(&str, &str)]) -> PathParams {
        pairs.iter().map(|(k, v)| ((*k).to_owned(), (*v).to_owned())).collect()
    }

    #[test]
    fn missing_field_is_named() {
        match decode::<Item>(br#"{"name":"milk"}"#) {
            Err(Error::ValidationFailed(errs)) => assert!(errs.contains_field("price")),
            other => panic!("expected ValidationFailed, got {other:?}"),
        }
    }

    #[test]
    fn empty_body_reports_missing_fields() {
        match decode::<Item>(b"") {
            Err(Error::ValidationFailed(errs)) => assert!(errs.contains_field("name")),
            other => panic!("expected ValidationFailed, got {other:?}"),
        }
    }

    #[test]
    fn broken_json_is_a_bad_request() {
        assert!(matches!(decode::<Item>(b"{invalid"), Err(Error::BadRequest(_))));
    }

    #[test]
    fn wrong_type_names_the_field() {
        match decode::<Item>(br#"{"name":"milk","price":"ten"}"#) {
            Err(Error::ValidationFailed(errs)) => {
                assert!(errs.contains_field("price"));
                assert!(!errs.contains_field("body"));
            }
            other => panic!("expected ValidationFailed, got {other:?}"),
        }
    }

    #[derive(Debug, Deserialize)]
    struct Basket {
        #[allow(dead_code)]
        lines: Vec<Item>,
    }

    #[test]
    fn nested_failures_carry_the_path() {
        match decode::<Basket>(br#"{"lines":[{"name":"milk","price":1},{"name":"tea","price":"two"}]}"#) {
            Err(Error::ValidationFailed(errs)) => assert!(errs.contains_field("lines[1].price")),
            other => panic!("expected ValidationFailed, got {other:?}"),
        }
        match decode::<Basket>(br#"{"lines":[{"price":1}]}"#) {
            Err(Error::ValidationFailed(errs)) => assert!(errs.contains_field("lines[0].name")),
            other => panic!("expected ValidationFailed, got {other:?}"),
        }
    }

    #[test]
    fn trailing_garbage_is_a_bad_request() {
        assert!(matches!(decode::<Item>(br#"{"name":"milk","price":1} x"#), Err(Error::BadRequest(_))));
    }

    #[test]
    fn scalar_body_is_reported_on_body() {
        match decode::<Item>(br#""milk""#) {
            Err(Error::ValidationFailed(errs)) => assert!(errs.contains_field("body")),
            other => panic!("expected ValidationFailed, got {other:?}"),
        }
    }

    #[test]
    fn model_rules_run_after_decoding() {
        let item: Item = decode(br#"{"name":"milk","price":-1}"#).unwrap();
        assert!(item.validate().unwrap_err().contains_field("price"));
    }

    #[test]
    fn scalar_path_coercion() {
        assert_eq!(u64::from_path_params(&params(&[("id", "42")])).unwrap(), 42);
        match u64::from_path_params(&params(&[("id", "abc")])) {
            Err(Error::BadPathParam { name, value, .. }) => {
                assert_eq!(name, "id");
                assert_eq!(value, "abc");
            }
            other => panic!("expected BadPathParam, got {other:?}"),
        }
    }

    #[test]
    fn tuple_path_coercion_is_positional() {
        let (user, post) =
            <(String, u32)>::from_path_params(&params(&[("user", "ada"), ("post", "7")])).unwrap();
        assert_eq!(user, "ada");
        assert_eq!(post, 7);
    }

    #[test]
    fn path_arity_is_checked_at_setup() {
        let one = vec!["id".to_owned()];
        assert!(<Path<u64> as FromRequestParts>::check(&one).is_ok());
        assert!(matches!(
            <Path<(u64, u64)> as FromRequestParts>::check(&one),
            Err(Error::UnresolvableDependency(_)),
        ));
    }

    #[test]
    fn named_lookup_coerces() {
        let p = params(&[("id", "9")]);
        assert_eq!(p.parse::<u8>("id").unwrap(), 9);
        assert!(matches!(p.parse::<u8>("nope"), Err(Error::UnresolvableDependency(_))));
    }
}
