//! Pipeline and limiter configuration.

use std::time::Duration;

use crate::backoff::{Backoff, Jitter};
use crate::error::ConfigError;

/// Default ingress buffer capacity.
pub const DEFAULT_BUFFER_SIZE: usize = 100;
/// Default number of concurrent send lanes.
pub const DEFAULT_PARALLELISM: usize = 4;
/// Default retry budget; `0` disables the retry loop.
pub const DEFAULT_MAX_RETRIES: u32 = 3;
/// Default ceiling for one HTTP exchange.
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);
/// Default ceiling on how long admission may be deferred before a request
/// is dropped instead.
pub const DEFAULT_MAX_ALLOWED_WAIT: Duration = Duration::from_secs(120);
/// Default bound on tracked buckets before LRU eviction.
pub const DEFAULT_BUCKET_CAPACITY: usize = 1024;
/// Default REST endpoint prefix.
pub const DEFAULT_BASE_URL: &str = "https://discord.com/api/v10";
/// Request header opting into millisecond-precision reset values.
pub const PRECISION_HEADER: &str = "x-ratelimit-precision";

const DEFAULT_RETRY_BASE: Duration = Duration::from_millis(250);
const DEFAULT_RETRY_CAP: Duration = Duration::from_secs(5);

/// What to do with a new request when the ingress buffer is full.
///
/// Only [`Backpressure`](OverflowPolicy::Backpressure) preserves every
/// request; the other policies surface the loss to the victim's caller as
/// a `BufferOverflow` error answer, never silently.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Block the producer until space frees up.
    #[default]
    Backpressure,
    /// Reject the incoming request.
    DropNewest,
    /// Evict the oldest buffered request to make room.
    DropOldest,
    /// Clear the whole buffer, then enqueue the incoming request.
    DropBuffer,
    /// Reject the incoming request and close ingress for good.
    Fail,
}

/// Knobs of the rate-limit coordinator.
#[derive(Debug, Clone)]
pub struct LimiterConfig {
    /// Admissions predicted to wait longer than this are dropped. The
    /// boundary is inclusive: a wait of exactly this long is still served.
    pub max_allowed_wait: Duration,
    /// Buckets tracked before the least recently seen entry is evicted.
    pub bucket_capacity: usize,
    /// Send `X-RateLimit-Precision: millisecond` with every request.
    pub millisecond_precision: bool,
    /// Prefer `X-RateLimit-Reset-After` over the absolute `Reset` epoch.
    /// Recommended whenever local clock skew may exceed about a second.
    pub relative_time: bool,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            max_allowed_wait: DEFAULT_MAX_ALLOWED_WAIT,
            bucket_capacity: DEFAULT_BUCKET_CAPACITY,
            millisecond_precision: true,
            relative_time: true,
        }
    }
}

impl LimiterConfig {
    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if self.bucket_capacity == 0 {
            return Err(ConfigError::ZeroBucketCapacity);
        }
        Ok(())
    }
}

/// Knobs of the request pipeline around the limiter.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Ingress buffer capacity; also bounds the retry feedback channel.
    pub buffer_size: usize,
    /// Policy applied when the ingress buffer is full.
    pub overflow: OverflowPolicy,
    /// Concurrent send lanes (in-flight HTTP requests).
    pub parallelism: usize,
    /// Times a failed request may be re-injected; `0` disables retrying.
    pub max_retries: u32,
    /// Ceiling for a single HTTP exchange.
    pub http_timeout: Duration,
    /// Delay between retry attempts.
    pub retry_backoff: Backoff,
    /// Randomization applied to retry delays.
    pub retry_jitter: Jitter,
    /// REST endpoint prefix the route paths are appended to.
    pub base_url: String,
    /// Log every outgoing request at debug level.
    pub log_sent_rest: bool,
    /// Log every received response at debug level.
    pub log_received_rest: bool,
    /// Log bucket updates, deferrals, and drops.
    pub log_ratelimit_events: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            overflow: OverflowPolicy::default(),
            parallelism: DEFAULT_PARALLELISM,
            max_retries: DEFAULT_MAX_RETRIES,
            http_timeout: DEFAULT_HTTP_TIMEOUT,
            retry_backoff: Backoff::exponential(DEFAULT_RETRY_BASE).with_max(DEFAULT_RETRY_CAP),
            retry_jitter: Jitter::None,
            base_url: DEFAULT_BASE_URL.to_owned(),
            log_sent_rest: false,
            log_received_rest: false,
            log_ratelimit_events: true,
        }
    }
}

impl PipelineConfig {
    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if self.buffer_size == 0 {
            return Err(ConfigError::ZeroBufferSize);
        }
        if self.parallelism == 0 {
            return Err(ConfigError::ZeroParallelism);
        }
        if self.http_timeout.is_zero() {
            return Err(ConfigError::ZeroHttpTimeout);
        }
        Ok(())
    }
}
