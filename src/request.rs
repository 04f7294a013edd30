//! Caller-authored REST requests.
//!
//! A [`Request`] bundles everything the pipeline needs for one logical API
//! call: the route, an optional body, extra headers, a parser for the
//! response body, and an opaque caller context that is handed back verbatim
//! in the answer. The catalog of actual Discord endpoints lives with the
//! caller; this crate only cares about the shape.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use http::HeaderMap;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::ParseError;
use crate::route::Route;

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of one logical API invocation.
///
/// Retries of the same call keep their id; two independent submissions of
/// an identical route get distinct ids. Every answer echoes the id of the
/// request that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(u64);

impl RequestId {
    /// Allocate a fresh process-unique id.
    pub fn next() -> Self {
        Self(NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Decodes a response body into the caller's data type.
///
/// Invoked with `None` for the empty-body sentinel of a `204 No Content`;
/// a parser that cannot produce a value from nothing should error, which
/// the pipeline reports as `UnexpectedEmpty`.
pub type ResponseParser<D> = Arc<dyn Fn(Option<&Bytes>) -> Result<D, ParseError> + Send + Sync>;

/// Parser for JSON endpoints: decodes the body into `T`, rejects empty.
pub fn json_parser<T>() -> ResponseParser<T>
where
    T: DeserializeOwned,
{
    Arc::new(|body| match body {
        Some(bytes) => serde_json::from_slice(bytes).map_err(ParseError::from),
        None => Err(ParseError::new("expected a body, got none")),
    })
}

/// Parser for endpoints whose success carries no payload (`204`).
pub fn unit_parser() -> ResponseParser<()> {
    Arc::new(|_| Ok(()))
}

/// One REST request travelling through the pipeline.
pub struct Request<D, C> {
    route: Route,
    id: RequestId,
    body: Option<Bytes>,
    extra_headers: HeaderMap,
    parser: ResponseParser<D>,
    context: C,
}

impl<D, C> Request<D, C> {
    /// Build a request; an id is allocated automatically.
    pub fn new(route: Route, parser: ResponseParser<D>, context: C) -> Self {
        Self {
            route,
            id: RequestId::next(),
            body: None,
            extra_headers: HeaderMap::new(),
            parser,
            context,
        }
    }

    /// Attach a raw body. Content type defaults to `application/json`
    /// unless overridden through [`Request::header`].
    pub fn body(mut self, body: Bytes) -> Self {
        self.body = Some(body);
        self
    }

    /// Serialize `value` as the JSON body.
    pub fn json<T: Serialize>(mut self, value: &T) -> Result<Self, serde_json::Error> {
        self.body = Some(Bytes::from(serde_json::to_vec(value)?));
        Ok(self)
    }

    /// Add a header sent verbatim with this request, overriding any
    /// default the pipeline would set under the same name.
    pub fn header(mut self, name: http::header::HeaderName, value: http::HeaderValue) -> Self {
        self.extra_headers.insert(name, value);
        self
    }

    pub fn route(&self) -> &Route {
        &self.route
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn body_bytes(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }

    pub fn extra_headers(&self) -> &HeaderMap {
        &self.extra_headers
    }

    pub fn context(&self) -> &C {
        &self.context
    }

    pub(crate) fn parser(&self) -> &ResponseParser<D> {
        &self.parser
    }

    pub(crate) fn into_context(self) -> C {
        self.context
    }
}

impl<D, C: fmt::Debug> fmt::Debug for Request<D, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("route", &self.route)
            .field("id", &self.id)
            .field("body_len", &self.body.as_ref().map(Bytes::len))
            .field("context", &self.context)
            .finish_non_exhaustive()
    }
}
