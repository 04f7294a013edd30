//! Route identity for rate limiting.
//!
//! Discord scopes its rate-limit buckets by route *shape*, not by concrete
//! URI: `GET /channels/10/messages/11` and `GET /channels/10/messages/12`
//! share one bucket, while `GET /channels/10/...` and `GET /channels/20/...`
//! do not, because `channel_id` is a major parameter. [`RouteKey::of`]
//! collapses a concrete [`Route`] into that shape by keeping major
//! parameters and replacing every other snowflake with `{id}`.

use std::fmt;

use http::Method;

/// Path segments whose following id is a major parameter and stays concrete
/// in the route key. The webhook token sits right after the webhook id and
/// is likewise part of the bucket scope.
pub const MAJOR_SEGMENTS: [&str; 3] = ["channels", "guilds", "webhooks"];

/// A concrete REST route: method plus the request path below the API base,
/// e.g. `GET /channels/100/messages`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Route {
    method: Method,
    path: String,
}

impl Route {
    /// Create a route from a method and an absolute path (leading `/`).
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self { method, path: path.into() }
    }

    /// `GET` shorthand.
    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    /// `POST` shorthand.
    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    /// `PUT` shorthand.
    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::PUT, path)
    }

    /// `PATCH` shorthand.
    pub fn patch(path: impl Into<String>) -> Self {
        Self::new(Method::PATCH, path)
    }

    /// `DELETE` shorthand.
    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.path)
    }
}

/// The client-side identity a request is rate limited under before the
/// server names a bucket: method plus the path template with major
/// parameters concrete and all other snowflakes collapsed to `{id}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RouteKey {
    method: Method,
    template: String,
}

impl RouteKey {
    /// Derive the key for a route. Pure and deterministic.
    pub fn of(route: &Route) -> Self {
        Self { method: route.method.clone(), template: collapse(&route.path) }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    /// The collapsed path template, e.g. `/channels/100/messages/{id}`.
    pub fn template(&self) -> &str {
        &self.template
    }
}

impl fmt::Display for RouteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.template)
    }
}

/// Replace every all-digit segment with `{id}` unless it belongs to a
/// major parameter. A major segment name forces the id after it concrete;
/// `webhooks` forces two segments, since the token right after the webhook
/// id scopes the bucket as well and may itself be digit-shaped.
fn collapse(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    let mut keep_concrete = 0usize;
    let mut first = true;
    for segment in path.split('/') {
        if !first {
            out.push('/');
        }
        first = false;
        if keep_concrete > 0 {
            keep_concrete -= 1;
            out.push_str(segment);
        } else if is_snowflake(segment) {
            out.push_str("{id}");
        } else {
            out.push_str(segment);
        }
        if MAJOR_SEGMENTS.contains(&segment) {
            keep_concrete = if segment == "webhooks" { 2 } else { 1 };
        }
    }
    out
}

fn is_snowflake(segment: &str) -> bool {
    !segment.is_empty() && segment.bytes().all(|b| b.is_ascii_digit())
}
