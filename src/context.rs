//! Per-request context: trace identity, deadline, and an additive value bag.
//!
//! # Propagation headers
//!
//! | Header | Meaning |
//! |---|---|
//! | `x-trace-id` | shared by every hop of one logical call |
//! | `x-span-id` | id minted for this one outbound call |
//! | `x-parent-span-id` | the caller's own span; the receiver's parent |
//! | `x-deadline-ms` | remaining budget in whole milliseconds |
//!
//! A receiving hop takes `x-parent-span-id` as its parent span id and mints
//! its own span id, so every hop links back to the span that called it.
//!
//! The deadline travels as a *remaining duration*, not a timestamp, so
//! clocks on the two hosts never need to agree.

use std::any::type_name;
use std::sync::Arc;
use std::time::Duration;

use http::{Extensions, HeaderMap, HeaderValue};
use tokio::time::Instant;
use uuid::Uuid;

pub const TRACE_ID_HEADER: &str = "x-trace-id";
pub const SPAN_ID_HEADER: &str = "x-span-id";
pub const PARENT_SPAN_ID_HEADER: &str = "x-parent-span-id";
pub const DEADLINE_HEADER: &str = "x-deadline-ms";

/// State that lives exactly as long as one inbound call.
///
/// Identity and deadline are fixed when the context is created. The bag can
/// only grow: a value already present for a type is never replaced, so the
/// order in which middleware layers run cannot change what a later layer
/// reads.
#[derive(Clone, Debug)]
pub struct RequestContext {
    trace_id: String,
    span_id: String,
    parent_span_id: Option<String>,
    deadline: Instant,
    service_name: Arc<str>,
    bag: Extensions,
}

impl RequestContext {
    /// A fresh trace rooted at this service.
    pub fn root(service_name: &str, timeout: Duration) -> Self {
        Self {
            trace_id: new_trace_id(),
            span_id: new_span_id(),
            parent_span_id: None,
            deadline: Instant::now() + timeout,
            service_name: Arc::from(service_name),
            bag: Extensions::new(),
        }
    }

    /// Continues the trace described by inbound headers, if any.
    ///
    /// The trace id is adopted when present, otherwise minted. The span id
    /// is always new and the parent is the caller's span. The deadline is the earlier of `now + default_timeout`
    /// and the budget the caller advertised.
    pub fn from_headers(headers: &HeaderMap, default_timeout: Duration, service_name: &str) -> Self {
        let now = Instant::now();
        let mut deadline = now + default_timeout;
        if let Some(budget) = header_str(headers, DEADLINE_HEADER).and_then(|v| v.parse::<u64>().ok()) {
            deadline = deadline.min(now + Duration::from_millis(budget));
        }

        Self {
            trace_id: header_str(headers, TRACE_ID_HEADER).map_or_else(new_trace_id, str::to_owned),
            span_id: new_span_id(),
            parent_span_id: header_str(headers, PARENT_SPAN_ID_HEADER).map(str::to_owned),
            deadline,
            service_name: Arc::from(service_name),
            bag: Extensions::new(),
        }
    }

    pub fn trace_id(&self) -> &str { &self.trace_id }
    pub fn span_id(&self) -> &str { &self.span_id }
    pub fn parent_span_id(&self) -> Option<&str> { self.parent_span_id.as_deref() }
    pub fn deadline(&self) -> Instant { self.deadline }
    pub fn service_name(&self) -> &str { &self.service_name }

    /// Time left before the deadline; zero once it has passed.
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.deadline
    }

    /// Moves the deadline earlier. A later `deadline` is ignored: the budget
    /// never grows.
    pub fn tighten_deadline(&mut self, deadline: Instant) {
        self.deadline = self.deadline.min(deadline);
    }

    /// Identity for one outbound call made on behalf of this context.
    pub fn child_span(&self) -> ChildSpan {
        ChildSpan::of(&self.trace_id, &self.span_id)
    }

    /// Adds a value to the bag.
    ///
    /// Returns the value back if one of the same type is already present.
    pub fn insert<T: Clone + Send + Sync + 'static>(&mut self, value: T) -> Result<(), T> {
        if self.bag.get::<T>().is_some() {
            tracing::debug!(ty = type_name::<T>(), "context value already present, keeping the first");
            return Err(value);
        }
        self.bag.insert(value);
        Ok(())
    }

    pub fn get<T: Send + Sync + 'static>(&self) -> Option<&T> {
        self.bag.get::<T>()
    }

    pub fn contains<T: Send + Sync + 'static>(&self) -> bool {
        self.bag.get::<T>().is_some()
    }
}

/// The identity an outbound call carries: same trace, a new span id for the
/// call, and the caller's span as parent.
#[derive(Clone, Debug)]
pub struct ChildSpan {
    pub trace_id: String,
    pub span_id: String,
    pub parent_span_id: String,
}

impl ChildSpan {
    pub(crate) fn of(trace_id: &str, parent_span_id: &str) -> Self {
        Self {
            trace_id: trace_id.to_owned(),
            span_id: new_span_id(),
            parent_span_id: parent_span_id.to_owned(),
        }
    }

    /// Writes the propagation headers, encoding `remaining` as the budget.
    pub fn write_headers(&self, headers: &mut HeaderMap, remaining: Duration) {
        let pairs = [
            (TRACE_ID_HEADER, self.trace_id.clone()),
            (SPAN_ID_HEADER, self.span_id.clone()),
            (PARENT_SPAN_ID_HEADER, self.parent_span_id.clone()),
            (DEADLINE_HEADER, remaining.as_millis().to_string()),
        ];
        for (name, value) in pairs {
            if let Ok(value) = HeaderValue::try_from(value) {
                headers.insert(name, value);
            }
        }
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

fn new_trace_id() -> String {
    Uuid::new_v4().simple().to_string()
}

fn new_span_id() -> String {
    format!("{:016x}", Uuid::new_v4().as_u64_pair().0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            let name = http::HeaderName::from_bytes(k.as_bytes()).unwrap();
            map.insert(name, HeaderValue::from_str(v).unwrap());
        }
        map
    }

    #[test]
    fn adopts_inbound_trace_and_mints_a_span() {
        let inbound = headers(&[
            ("X-Trace-Id", "trace-1"),
            ("x-span-id", "call-span"),
            ("X-Parent-Span-Id", "caller-span"),
        ]);
        let ctx = RequestContext::from_headers(&inbound, Duration::from_secs(30), "orders");

        assert_eq!(ctx.trace_id(), "trace-1");
        assert_eq!(ctx.parent_span_id(), Some("caller-span"));
        assert_ne!(ctx.span_id(), "caller-span");
        assert_ne!(ctx.span_id(), "call-span");
        assert_eq!(ctx.service_name(), "orders");
    }

    #[test]
    fn mints_a_trace_when_none_arrives() {
        let a = RequestContext::from_headers(&HeaderMap::new(), Duration::from_secs(1), "svc");
        let b = RequestContext::from_headers(&HeaderMap::new(), Duration::from_secs(1), "svc");
        assert_ne!(a.trace_id(), b.trace_id());
        assert!(a.parent_span_id().is_none());
    }

    #[test]
    fn inbound_budget_only_shortens_the_deadline() {
        let short = headers(&[(DEADLINE_HEADER, "500")]);
        let ctx = RequestContext::from_headers(&short, Duration::from_secs(30), "svc");
        assert!(ctx.remaining() <= Duration::from_millis(500));

        let long = headers(&[(DEADLINE_HEADER, "600000")]);
        let ctx = RequestContext::from_headers(&long, Duration::from_secs(2), "svc");
        assert!(ctx.remaining() <= Duration::from_secs(2));
    }

    #[test]
    fn garbage_budget_is_ignored() {
        let bad = headers(&[(DEADLINE_HEADER, "soon")]);
        let ctx = RequestContext::from_headers(&bad, Duration::from_secs(5), "svc");
        assert!(ctx.remaining() > Duration::from_secs(4));
    }

    #[test]
    fn deadline_never_grows() {
        let mut ctx = RequestContext::root("svc", Duration::from_secs(1));
        let before = ctx.deadline();
        ctx.tighten_deadline(before + Duration::from_secs(10));
        assert_eq!(ctx.deadline(), before);
        ctx.tighten_deadline(before - Duration::from_millis(500));
        assert!(ctx.deadline() < before);
    }

    #[test]
    fn child_span_keeps_trace_and_links_parent() {
        let ctx = RequestContext::root("svc", Duration::from_secs(1));
        let child = ctx.child_span();
        assert_eq!(child.trace_id, ctx.trace_id());
        assert_eq!(child.parent_span_id, ctx.span_id());
        assert_ne!(child.span_id, ctx.span_id());
    }

    #[test]
    fn receiver_links_back_to_the_calling_span() {
        let caller = RequestContext::root("orders", Duration::from_secs(1));
        let mut outbound = HeaderMap::new();
        caller.child_span().write_headers(&mut outbound, caller.remaining());

        let callee = RequestContext::from_headers(&outbound, Duration::from_secs(30), "users");
        assert_eq!(callee.trace_id(), caller.trace_id());
        assert_eq!(callee.parent_span_id(), Some(caller.span_id()));
    }

    #[test]
    fn bag_is_additive() {
        #[derive(Clone, Debug, PartialEq)]
        struct Tenant(&'static str);

        let mut ctx = RequestContext::root("svc", Duration::from_secs(1));
        assert!(ctx.insert(Tenant("acme")).is_ok());
        assert_eq!(ctx.insert(Tenant("other")), Err(Tenant("other")));
        assert_eq!(ctx.get::<Tenant>(), Some(&Tenant("acme")));
    }
}
