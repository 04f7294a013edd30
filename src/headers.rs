//! Extraction of Discord's rate-limit response headers.
//!
//! Header names are matched case-insensitively (a property of
//! [`http::HeaderMap`]) and numeric values may be integers or decimals:
//! `X-RateLimit-Reset` is a floating-point epoch-seconds value when the
//! request asked for millisecond precision, and `X-RateLimit-Reset-After`
//! is a relative duration in (possibly fractional) seconds.

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use http::HeaderMap;

use crate::bucket::BucketId;

pub(crate) const LIMIT: &str = "x-ratelimit-limit";
pub(crate) const REMAINING: &str = "x-ratelimit-remaining";
pub(crate) const RESET: &str = "x-ratelimit-reset";
pub(crate) const RESET_AFTER: &str = "x-ratelimit-reset-after";
pub(crate) const BUCKET: &str = "x-ratelimit-bucket";
pub(crate) const GLOBAL: &str = "x-ratelimit-global";
pub(crate) const RETRY_AFTER: &str = "retry-after";

/// Rate-limit metadata carried by a single response.
///
/// Everything is optional: Discord omits the whole set on some error paths,
/// and `Retry-After` only accompanies a 429. [`RatelimitInfo::has_any`]
/// distinguishes "no headers at all" from a populated set.
#[derive(Debug, Clone, Default)]
pub struct RatelimitInfo {
    /// Total requests allowed in the current window.
    pub limit: Option<i64>,
    /// Requests left in the current window.
    pub remaining: Option<i64>,
    /// Absolute reset time, epoch seconds (fractional under millisecond
    /// precision).
    pub reset_epoch: Option<f64>,
    /// Relative time until the window resets.
    pub reset_after: Option<Duration>,
    /// `Retry-After` on a 429.
    pub retry_after: Option<Duration>,
    /// Server-assigned bucket identity.
    pub bucket: Option<BucketId>,
    /// Whether a 429 applies to the whole token rather than one bucket.
    pub global: bool,
}

impl RatelimitInfo {
    /// Read the rate-limit header set out of a response.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        Self {
            limit: header_i64(headers, LIMIT),
            remaining: header_i64(headers, REMAINING),
            reset_epoch: header_f64(headers, RESET),
            reset_after: header_secs(headers, RESET_AFTER),
            retry_after: header_secs(headers, RETRY_AFTER),
            bucket: header_str(headers, BUCKET).map(BucketId::from),
            global: headers
                .get(GLOBAL)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
        }
    }

    /// An empty set; used when a response carried no usable headers.
    pub fn none() -> Self {
        Self::default()
    }

    /// Whether any counter or reset information was present.
    pub fn has_any(&self) -> bool {
        self.limit.is_some()
            || self.remaining.is_some()
            || self.reset_epoch.is_some()
            || self.reset_after.is_some()
            || self.retry_after.is_some()
            || self.bucket.is_some()
            || self.global
    }

    /// Resolve the window's reset to an [`Instant`].
    ///
    /// `prefer_relative` picks `Reset-After` over the absolute `Reset`
    /// epoch; relative is the safer choice when local clock skew can exceed
    /// a second. Whichever is preferred, the other serves as fallback.
    pub fn reset_at(&self, prefer_relative: bool, now: Instant) -> Option<Instant> {
        let relative = self.reset_after.map(|after| now + after);
        let absolute = self.reset_epoch.and_then(|epoch| epoch_to_instant(epoch, now));
        if prefer_relative {
            relative.or(absolute)
        } else {
            absolute.or(relative)
        }
    }
}

// Upper bounds keep `Duration::from_secs_f64` from panicking on absurd
// wire values: ~10^11s of epoch covers year 5138, ~10^9s of relative
// delay covers three decades.
const MAX_EPOCH_SECS: f64 = 1e11;
const MAX_RELATIVE_SECS: f64 = 1e9;

fn epoch_to_instant(epoch_secs: f64, now: Instant) -> Option<Instant> {
    if !epoch_secs.is_finite() || epoch_secs < 0.0 || epoch_secs > MAX_EPOCH_SECS {
        return None;
    }
    let target = UNIX_EPOCH + Duration::from_secs_f64(epoch_secs);
    match target.duration_since(SystemTime::now()) {
        Ok(ahead) => Some(now + ahead),
        Err(behind) => now.checked_sub(behind.duration()),
    }
}

fn header_str<'h>(headers: &'h HeaderMap, name: &str) -> Option<&'h str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn header_f64(headers: &HeaderMap, name: &str) -> Option<f64> {
    header_str(headers, name).and_then(|v| v.trim().parse::<f64>().ok())
}

/// Integer header that tolerates a decimal rendering.
fn header_i64(headers: &HeaderMap, name: &str) -> Option<i64> {
    let raw = header_str(headers, name)?.trim();
    if let Ok(n) = raw.parse::<i64>() {
        return Some(n);
    }
    raw.parse::<f64>().ok().map(|f| f.trunc() as i64)
}

fn header_secs(headers: &HeaderMap, name: &str) -> Option<Duration> {
    header_f64(headers, name)
        .filter(|secs| secs.is_finite() && (0.0..=MAX_RELATIVE_SECS).contains(secs))
        .map(Duration::from_secs_f64)
}
