//! Answers emitted by the pipeline, exactly one per submitted request.

use crate::error::ErrorCause;
use crate::headers::RatelimitInfo;
use crate::request::RequestId;
use crate::route::RouteKey;

/// The outcome of one submitted [`Request`](crate::Request).
///
/// `context` is the caller's tag, returned verbatim; `id` matches the
/// submission's [`RequestId`].
#[derive(Debug)]
pub enum Answer<D, C> {
    /// 2xx with the body decoded by the request's parser.
    Response {
        data: D,
        ratelimit: Option<RatelimitInfo>,
        route: RouteKey,
        id: RequestId,
        context: C,
    },
    /// The server answered 429 even though the limiter admitted the
    /// request (clock drift, or the token is shared with another client).
    Ratelimited {
        global: bool,
        ratelimit: RatelimitInfo,
        route: RouteKey,
        id: RequestId,
        context: C,
    },
    /// The request failed; see [`ErrorCause`] for the taxonomy.
    Error { cause: ErrorCause, route: RouteKey, id: RequestId, context: C },
    /// The limiter refused admission because the predicted wait exceeded
    /// `max_allowed_wait`.
    Dropped { route: RouteKey, id: RequestId, context: C },
}

impl<D, C> Answer<D, C> {
    pub fn id(&self) -> RequestId {
        match self {
            Self::Response { id, .. }
            | Self::Ratelimited { id, .. }
            | Self::Error { id, .. }
            | Self::Dropped { id, .. } => *id,
        }
    }

    pub fn route(&self) -> &RouteKey {
        match self {
            Self::Response { route, .. }
            | Self::Ratelimited { route, .. }
            | Self::Error { route, .. }
            | Self::Dropped { route, .. } => route,
        }
    }

    pub fn context(&self) -> &C {
        match self {
            Self::Response { context, .. }
            | Self::Ratelimited { context, .. }
            | Self::Error { context, .. }
            | Self::Dropped { context, .. } => context,
        }
    }

    pub fn is_response(&self) -> bool {
        matches!(self, Self::Response { .. })
    }

    pub fn is_ratelimited(&self) -> bool {
        matches!(self, Self::Ratelimited { .. })
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }

    pub fn is_dropped(&self) -> bool {
        matches!(self, Self::Dropped { .. })
    }

    /// The decoded data, if this is a [`Response`](Self::Response).
    pub fn into_data(self) -> Option<D> {
        match self {
            Self::Response { data, .. } => Some(data),
            _ => None,
        }
    }

    /// The error cause, if this is an [`Error`](Self::Error).
    pub fn error_cause(&self) -> Option<&ErrorCause> {
        match self {
            Self::Error { cause, .. } => Some(cause),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::route::Route;

    fn key() -> RouteKey {
        RouteKey::of(&Route::get("/channels/1"))
    }

    #[test]
    fn accessors_reach_every_variant() {
        let id = RequestId::next();
        let dropped: Answer<(), &str> =
            Answer::Dropped { route: key(), id, context: "tag" };
        assert!(dropped.is_dropped());
        assert_eq!(dropped.id(), id);
        assert_eq!(*dropped.context(), "tag");
        assert!(dropped.error_cause().is_none());
        assert!(dropped.into_data().is_none());
    }

    #[test]
    fn into_data_unwraps_responses() {
        let answer: Answer<u32, ()> = Answer::Response {
            data: 7,
            ratelimit: None,
            route: key(),
            id: RequestId::next(),
            context: (),
        };
        assert!(answer.is_response());
        assert_eq!(answer.into_data(), Some(7));
    }

    #[test]
    fn error_cause_is_reachable() {
        let answer: Answer<(), ()> = Answer::Error {
            cause: ErrorCause::BufferOverflow,
            route: key(),
            id: RequestId::next(),
            context: (),
        };
        assert!(answer.is_error());
        assert!(answer.error_cause().is_some_and(ErrorCause::is_buffer_overflow));
    }
}
