//! Radix-tree request router.
//!
//! One tree per HTTP method, O(path-length) lookup. Registration happens once
//! at setup; afterwards the router is only read, so resolution needs no lock.
//!
//! # Precedence
//!
//! A static segment outranks a named one: with `/items/new` and
//! `/items/{id}` both registered, `/items/new` goes to the first. Two
//! patterns of the same shape for one method (`/items/{id}` and
//! `/items/{name}`, or the same pattern twice) are rejected at registration
//! with [`Error::RouteConflict`].

use std::collections::HashMap;
use std::sync::Arc;

use http::Method;
use matchit::Router as MatchitRouter;

use crate::error::Error;
use crate::handler::BoxedEndpoint;
use crate::middleware::BoxedMiddleware;

/// Path parameters bound by the router, in pattern order.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PathParams(Vec<(String, String)>);

impl PathParams {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.iter().find(|(k, _)| k == name).map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, String)> for PathParams {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// One registered route. Immutable once the router is sealed.
pub struct Route {
    method: Method,
    pattern: String,
    endpoint: BoxedEndpoint,
    middleware: Vec<BoxedMiddleware>,
    chain: Arc<[BoxedMiddleware]>,
}

impl Route {
    pub(crate) fn new(
        method: Method,
        pattern: &str,
        endpoint: BoxedEndpoint,
        middleware: Vec<BoxedMiddleware>,
    ) -> Self {
        Self {
            method,
            pattern: pattern.to_owned(),
            endpoint,
            middleware,
            chain: Arc::from(Vec::new()),
        }
    }

    pub fn method(&self) -> &Method { &self.method }
    pub fn pattern(&self) -> &str { &self.pattern }

    pub(crate) fn endpoint(&self) -> BoxedEndpoint { Arc::clone(&self.endpoint) }

    /// The full middleware sequence, outermost first.
    pub(crate) fn chain(&self) -> Arc<[BoxedMiddleware]> { Arc::clone(&self.chain) }
}

/// A successful lookup.
pub struct Resolved<'r> {
    pub route: &'r Route,
    pub params: PathParams,
}

/// The application router.
#[derive(Default)]
pub struct Router {
    routes: Vec<Route>,
    trees: HashMap<Method, MatchitRouter<usize>>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a route, rejecting patterns that collide with an existing
    /// one for the same method.
    pub(crate) fn insert(&mut self, route: Route) -> Result<(), Error> {
        let index = self.routes.len();
        self.trees
            .entry(route.method.clone())
            .or_default()
            .insert(route.pattern.clone(), index)
            .map_err(|e| Error::RouteConflict {
                method: route.method.clone(),
                pattern: route.pattern.clone(),
                reason: e.to_string(),
            })?;
        self.routes.push(route);
        Ok(())
    }

    /// Freezes every route's middleware sequence: `global` (already ordered
    /// outermost first) followed by the route's own middleware in declared
    /// order.
    pub(crate) fn seal(&mut self, global: &[BoxedMiddleware]) {
        for route in &mut self.routes {
            let chain: Vec<BoxedMiddleware> =
                global.iter().chain(route.middleware.iter()).cloned().collect();
            route.chain = Arc::from(chain);
        }
    }

    /// Finds the route for `method` + `path`.
    ///
    /// Fails with [`Error::MethodNotAllowed`] when the path exists under some
    /// other method, [`Error::RouteNotFound`] otherwise.
    pub fn resolve(&self, method: &Method, path: &str) -> Result<Resolved<'_>, Error> {
        if let Some(matched) = self.trees.get(method).and_then(|tree| tree.at(path).ok()) {
            let params = matched.params.iter()
                .map(|(k, v)| (k.to_owned(), v.to_owned()))
                .collect();
            return Ok(Resolved { route: &self.routes[*matched.value], params });
        }

        let mut allowed: Vec<Method> = self.trees.iter()
            .filter(|(m, tree)| *m != method && tree.at(path).is_ok())
            .map(|(m, _)| m.clone())
            .collect();

        if allowed.is_empty() {
            return Err(Error::RouteNotFound { method: method.clone(), path: path.to_owned() });
        }
        allowed.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        Err(Error::MethodNotAllowed { method: method.clone(), path: path.to_owned(), allowed })
    }

    pub fn routes(&self) -> impl Iterator<Item = &Route> {
        self.routes.iter()
    }
}

/// Names of the `{name}` / `{*name}` segments in `pattern`, in order.
pub(crate) fn param_names(pattern: &str) -> Vec<String> {
    pattern
        .split('/')
        .filter_map(|seg| seg.strip_prefix('{')?.strip_suffix('}'))
        .map(|name| name.trim_start_matches('*').to_owned())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::endpoint;

    async fn noop() -> &'static str { "" }

    fn route(method: Method, pattern: &str) -> Route {
        Route::new(method, pattern, endpoint(noop), Vec::new())
    }

    #[test]
    fn static_outranks_named() {
        let mut router = Router::new();
        router.insert(route(Method::GET, "/items/{id}")).unwrap();
        router.insert(route(Method::GET, "/items/new")).unwrap();

        let hit = router.resolve(&Method::GET, "/items/new").unwrap();
        assert_eq!(hit.route.pattern(), "/items/new");
        assert!(hit.params.is_empty());

        let hit = router.resolve(&Method::GET, "/items/42").unwrap();
        assert_eq!(hit.route.pattern(), "/items/{id}");
        assert_eq!(hit.params.get("id"), Some("42"));
    }

    #[test]
    fn same_shape_is_a_conflict() {
        let mut router = Router::new();
        router.insert(route(Method::GET, "/items/{id}")).unwrap();
        let err = router.insert(route(Method::GET, "/items/{name}")).unwrap_err();
        assert!(matches!(err, Error::RouteConflict { .. }));

        // Other methods have their own tree.
        router.insert(route(Method::DELETE, "/items/{name}")).unwrap();
    }

    #[test]
    fn segment_count_must_match() {
        let mut router = Router::new();
        router.insert(route(Method::GET, "/items/{id}")).unwrap();
        assert!(matches!(
            router.resolve(&Method::GET, "/items/1/extra"),
            Err(Error::RouteNotFound { .. }),
        ));
        assert!(matches!(router.resolve(&Method::GET, "/items"), Err(Error::RouteNotFound { .. })));
    }

    #[test]
    fn wrong_method_lists_allowed() {
        let mut router = Router::new();
        router.insert(route(Method::POST, "/items")).unwrap();
        router.insert(route(Method::PUT, "/items")).unwrap();

        match router.resolve(&Method::GET, "/items") {
            Err(Error::MethodNotAllowed { allowed, .. }) => {
                assert_eq!(allowed, vec![Method::POST, Method::PUT]);
            }
            other => panic!("expected MethodNotAllowed, got {:?}", other.err()),
        }
    }

    #[test]
    fn resolution_is_repeatable() {
        let mut router = Router::new();
        router.insert(route(Method::GET, "/a/{x}/b/{y}")).unwrap();
        let first = router.resolve(&Method::GET, "/a/1/b/2").unwrap().params;
        let second = router.resolve(&Method::GET, "/a/1/b/2").unwrap().params;
        assert_eq!(first, second);
        assert_eq!(first.iter().collect::<Vec<_>>(), vec![("x", "1"), ("y", "2")]);
    }

    #[test]
    fn extracts_param_names() {
        assert_eq!(param_names("/users/{id}/posts/{post}"), vec!["id", "post"]);
        assert_eq!(param_names("/files/{*path}"), vec!["path"]);
        assert!(param_names("/health").is_empty());
    }
}
