//! Response classification.
//!
//! Turns a raw [`HttpResponse`] into the pieces the pipeline needs: the
//! rate-limit metadata for the limiter and a verdict for the caller. The
//! 429 body is deliberately discarded; everything interesting about a
//! rate-limit rejection lives in its headers.

use http::StatusCode;
use tracing::warn;

use crate::client::HttpResponse;
use crate::error::ErrorCause;
use crate::headers::RatelimitInfo;
use crate::request::ResponseParser;
use crate::route::RouteKey;

/// What a response means for its request.
pub(crate) enum Interpretation<D> {
    Success { data: D },
    Ratelimited { info: RatelimitInfo },
    Failed { cause: ErrorCause },
}

/// Classify a response and extract its rate-limit headers.
///
/// The returned [`RatelimitInfo`] is always populated from the headers,
/// whatever the verdict, so the limiter sees every observation.
pub(crate) fn interpret<D>(
    response: &HttpResponse,
    parser: &ResponseParser<D>,
    route: &RouteKey,
) -> (RatelimitInfo, Interpretation<D>) {
    let info = RatelimitInfo::from_headers(&response.headers);
    if info.bucket.is_none() {
        warn!(%route, status = %response.status, "response missing X-RateLimit-Bucket header");
    }

    let interpretation = match response.status {
        StatusCode::TOO_MANY_REQUESTS => Interpretation::Ratelimited { info: info.clone() },
        StatusCode::NO_CONTENT => match parser(None) {
            Ok(data) => Interpretation::Success { data },
            Err(_) => Interpretation::Failed { cause: ErrorCause::UnexpectedEmpty },
        },
        status if status.is_success() => match parser(Some(&response.body)) {
            Ok(data) => Interpretation::Success { data },
            Err(e) => Interpretation::Failed { cause: ErrorCause::Parse(e) },
        },
        status => Interpretation::Failed {
            cause: ErrorCause::HttpStatus {
                status,
                body: String::from_utf8_lossy(&response.body).into_owned(),
            },
        },
    };
    (info, interpretation)
}
