//! In-memory table of rate-limit buckets.
//!
//! A route starts out rate limited under its own [`RouteKey`] (a provisional
//! bucket). The first response names the real bucket via
//! `X-RateLimit-Bucket`; from then on the route is bound to that id and all
//! aliased routes share one entry. The table is owned and mutated by the
//! limiter only.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::time::Instant;

use tokio::sync::oneshot;

use crate::limiter::Admission;
use crate::request::RequestId;
use crate::route::RouteKey;

/// Opaque server-assigned bucket identity from `X-RateLimit-Bucket`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BucketId(String);

impl BucketId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for BucketId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl From<String> for BucketId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for BucketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity a bucket entry is stored under: the route key until the server
/// names a bucket, the server's id afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum BucketKey {
    Provisional(RouteKey),
    Confirmed(BucketId),
}

impl fmt::Display for BucketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Provisional(route) => write!(f, "route:{}", route),
            Self::Confirmed(id) => write!(f, "bucket:{}", id),
        }
    }
}

/// Counter state for one bucket. `-1` means the value has not been observed
/// yet and admission is optimistic.
#[derive(Debug, Clone, Copy)]
pub(crate) struct BucketState {
    pub limit: i64,
    pub remaining: i64,
    pub reset_at: Instant,
    pub last_seen: Instant,
}

impl BucketState {
    pub fn unknown(now: Instant) -> Self {
        Self { limit: -1, remaining: -1, reset_at: now, last_seen: now }
    }

    pub fn is_unknown(&self) -> bool {
        self.remaining < 0
    }
}

/// An admission the limiter has deferred until the bucket's window resets.
pub(crate) struct PendingAdmission {
    pub route: RouteKey,
    pub id: RequestId,
    pub reply: oneshot::Sender<Admission>,
}

pub(crate) struct BucketEntry {
    pub state: BucketState,
    /// FIFO queue of deferred admissions for this bucket.
    pub waiters: VecDeque<PendingAdmission>,
    /// A wakeup is already scheduled for `state.reset_at`.
    pub timer_armed: bool,
    /// Requests admitted against this bucket whose response has not been
    /// observed yet. Used to hand slots back on cancellation.
    pub in_flight: HashSet<RequestId>,
}

impl BucketEntry {
    fn new(now: Instant) -> Self {
        Self {
            state: BucketState::unknown(now),
            waiters: VecDeque::new(),
            timer_armed: false,
            in_flight: HashSet::new(),
        }
    }

    fn busy(&self) -> bool {
        !self.waiters.is_empty() || !self.in_flight.is_empty()
    }
}

/// Route-to-bucket bindings plus per-bucket entries, bounded by LRU
/// eviction on `last_seen`.
pub(crate) struct BucketTable {
    routes: HashMap<RouteKey, BucketId>,
    buckets: HashMap<BucketKey, BucketEntry>,
    capacity: usize,
}

impl BucketTable {
    pub fn new(capacity: usize) -> Self {
        Self { routes: HashMap::new(), buckets: HashMap::new(), capacity }
    }

    /// The key this route is currently limited under.
    pub fn lookup(&self, route: &RouteKey) -> BucketKey {
        match self.routes.get(route) {
            Some(id) => BucketKey::Confirmed(id.clone()),
            None => BucketKey::Provisional(route.clone()),
        }
    }

    /// Fetch the entry for a key, creating an unknown one (and evicting the
    /// stalest idle entry when over capacity).
    pub fn entry(&mut self, key: &BucketKey, now: Instant) -> &mut BucketEntry {
        if !self.buckets.contains_key(key) && self.buckets.len() >= self.capacity {
            self.evict_oldest();
        }
        self.buckets.entry(key.clone()).or_insert_with(|| BucketEntry::new(now))
    }

    pub fn get_mut(&mut self, key: &BucketKey) -> Option<&mut BucketEntry> {
        self.buckets.get_mut(key)
    }

    pub fn get(&self, key: &BucketKey) -> Option<&BucketEntry> {
        self.buckets.get(key)
    }

    /// Record `route → bucket`, merging any provisional entry (state,
    /// waiters, reservations) into the confirmed one. Idempotent; once
    /// bound, a route's bucket never changes.
    pub fn bind(&mut self, route: &RouteKey, id: &BucketId, now: Instant) -> BucketKey {
        if let Some(existing) = self.routes.get(route) {
            return BucketKey::Confirmed(existing.clone());
        }
        let confirmed = BucketKey::Confirmed(id.clone());
        self.routes.insert(route.clone(), id.clone());

        let provisional = self.buckets.remove(&BucketKey::Provisional(route.clone()));
        let target = self.entry(&confirmed, now);
        if let Some(old) = provisional {
            target.waiters.extend(old.waiters);
            target.in_flight.extend(old.in_flight);
            if target.state.is_unknown() && old.state.last_seen > target.state.last_seen {
                target.state = old.state;
            }
        }
        confirmed
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    /// Drop the least recently seen entry that has no waiters and no
    /// requests in flight, along with any route bindings pointing at it.
    pub fn evict_oldest(&mut self) {
        let victim = self
            .buckets
            .iter()
            .filter(|(_, entry)| !entry.busy())
            .min_by_key(|(_, entry)| entry.state.last_seen)
            .map(|(key, _)| key.clone());
        let Some(key) = victim else { return };
        self.buckets.remove(&key);
        if let BucketKey::Confirmed(id) = &key {
            self.routes.retain(|_, bound| bound != id);
        }
    }
}
