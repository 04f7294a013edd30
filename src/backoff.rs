//! Delay strategies for the retry feedback loop.
//!
//! Attempt numbering: attempt `0` is the initial send (no delay); the
//! first retry sleeps `delay(1)`. The default pipeline configuration uses
//! exponential backoff from 250ms capped at 5s.

use std::time::Duration;

use rand::Rng;

/// Ceiling applied when a computed delay would overflow.
pub const MAX_BACKOFF: Duration = Duration::from_secs(60 * 60);

/// How the delay grows between retry attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backoff {
    /// The same delay before every retry.
    Constant { delay: Duration },
    /// `base * attempt`, optionally capped.
    Linear { base: Duration, max: Option<Duration> },
    /// `base * 2^(attempt-1)`, optionally capped.
    Exponential { base: Duration, max: Option<Duration> },
}

impl Backoff {
    pub fn constant(delay: Duration) -> Self {
        Self::Constant { delay }
    }

    pub fn linear(base: Duration) -> Self {
        Self::Linear { base, max: None }
    }

    pub fn exponential(base: Duration) -> Self {
        Self::Exponential { base, max: None }
    }

    /// Cap the growing strategies. A cap on `Constant` is a no-op.
    pub fn with_max(mut self, cap: Duration) -> Self {
        match &mut self {
            Self::Linear { max, .. } | Self::Exponential { max, .. } => *max = Some(cap),
            Self::Constant { .. } => {}
        }
        self
    }

    /// Delay before the given attempt (0 = initial send, no delay).
    pub fn delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        match self {
            Self::Constant { delay } => *delay,
            Self::Linear { base, max } => {
                let grown = base.checked_mul(attempt).unwrap_or(MAX_BACKOFF);
                cap(grown, *max)
            }
            Self::Exponential { base, max } => {
                let doubled = 2u128.saturating_pow(attempt - 1);
                let nanos = base.as_nanos().saturating_mul(doubled);
                let grown = Duration::from_nanos(nanos.min(MAX_BACKOFF.as_nanos()) as u64);
                cap(grown, *max)
            }
        }
    }
}

fn cap(delay: Duration, max: Option<Duration>) -> Duration {
    let capped = max.map_or(delay, |m| delay.min(m));
    capped.min(MAX_BACKOFF)
}

/// Randomization of retry delays so concurrent failures do not retry in
/// lockstep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Jitter {
    /// Use the backoff delay exactly.
    #[default]
    None,
    /// Uniform in `[0, delay]`.
    Full,
    /// Uniform in `[delay/2, delay]`; keeps a floor while spreading load.
    Equal,
}

impl Jitter {
    pub fn apply(&self, delay: Duration) -> Duration {
        if delay.is_zero() {
            return delay;
        }
        let mut rng = rand::rng();
        match self {
            Self::None => delay,
            Self::Full => delay.mul_f64(rng.random::<f64>()),
            Self::Equal => delay.mul_f64(0.5 + rng.random::<f64>() * 0.5),
        }
    }
}
