//! The rate-limit coordinator.
//!
//! A single-writer actor owns the bucket table and the global gate; every
//! mutation flows through its mailbox, which makes per-bucket FIFO ordering
//! and monotone binding hold by construction. Admission passes immediately
//! while a bucket has capacity, is deferred until the window resets when
//! the predicted wait fits inside `max_allowed_wait`, and is refused
//! otherwise. Response metadata feeds back through
//! [`LimiterHandle::update`].

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::bucket::{BucketEntry, BucketId, BucketKey, BucketState, BucketTable, PendingAdmission};
use crate::config::LimiterConfig;
use crate::headers::RatelimitInfo;
use crate::request::RequestId;
use crate::route::{Route, RouteKey};
use crate::sleeper::Sleeper;

/// Updates whose reset sits more than this much before the recorded reset
/// are treated as stale reorderings and ignored.
const STALE_TOLERANCE: Duration = Duration::from_millis(500);

const MAILBOX_CAPACITY: usize = 256;

/// The limiter's answer to an admission request. A `Pass` may arrive after
/// a deferred wait; a `Drop` always arrives promptly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Admission {
    Pass,
    Drop,
}

/// The limiter went away; the pipeline is shutting down.
#[derive(Debug)]
pub(crate) struct LimiterGone;

/// Read-only view of one bucket, for diagnostics.
#[derive(Debug, Clone)]
pub struct BucketSnapshot {
    /// Server-assigned id, once a response has named it.
    pub bucket: Option<BucketId>,
    pub limit: i64,
    pub remaining: i64,
    /// Time until the window resets; `None` once it has passed.
    pub reset_in: Option<Duration>,
    /// Deferred admissions queued on this bucket.
    pub waiting: usize,
}

enum Command {
    Admit { route: RouteKey, id: RequestId, reply: oneshot::Sender<Admission> },
    Update { route: RouteKey, id: RequestId, info: RatelimitInfo },
    Release { route: RouteKey, id: RequestId },
    BucketReset { key: BucketKey },
    GlobalReset,
    Inspect { route: RouteKey, reply: oneshot::Sender<Option<BucketSnapshot>> },
}

/// Cheap handle to the limiter actor.
#[derive(Clone)]
pub struct LimiterHandle {
    tx: mpsc::Sender<Command>,
}

impl LimiterHandle {
    /// Enqueue an admission request and return the pending verdict.
    ///
    /// The request takes its place in the mailbox as soon as this call
    /// returns, so callers that need ingress-order admission within a
    /// bucket must await this before handing the verdict to another task.
    pub(crate) async fn request_admission(
        &self,
        route: RouteKey,
        id: RequestId,
    ) -> Result<oneshot::Receiver<Admission>, LimiterGone> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Admit { route, id, reply })
            .await
            .map_err(|_| LimiterGone)?;
        Ok(rx)
    }

    /// Feed a response's rate-limit metadata back. An empty `info` only
    /// clears the request's in-flight reservation.
    pub(crate) async fn update(&self, route: RouteKey, id: RequestId, info: RatelimitInfo) {
        let _ = self.tx.send(Command::Update { route, id, info }).await;
    }

    /// Hand an admitted slot back after cancellation. Restores `remaining`
    /// only if no response for `id` was observed in the meantime.
    pub(crate) async fn release(&self, route: RouteKey, id: RequestId) {
        let _ = self.tx.send(Command::Release { route, id }).await;
    }

    /// Inspect the bucket a route is currently limited under.
    pub async fn bucket_snapshot(&self, route: &Route) -> Option<BucketSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Inspect { route: RouteKey::of(route), reply })
            .await
            .ok()?;
        rx.await.ok().flatten()
    }
}

/// Start the limiter actor on the current runtime.
pub(crate) fn spawn(
    config: LimiterConfig,
    sleeper: Arc<dyn Sleeper>,
    log_events: bool,
) -> LimiterHandle {
    let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
    let actor = Limiter {
        table: BucketTable::new(config.bucket_capacity),
        global: GlobalGate::default(),
        config,
        sleeper,
        mailbox: tx.downgrade(),
        log_events,
    };
    tokio::spawn(actor.run(rx));
    LimiterHandle { tx }
}

/// Token-wide block: while `blocked_until` lies ahead, nothing passes.
#[derive(Default)]
struct GlobalGate {
    blocked_until: Option<Instant>,
    waiters: VecDeque<PendingAdmission>,
    timer_armed: bool,
}

struct Limiter {
    table: BucketTable,
    global: GlobalGate,
    config: LimiterConfig,
    sleeper: Arc<dyn Sleeper>,
    mailbox: mpsc::WeakSender<Command>,
    log_events: bool,
}

/// Pure admission decision against one bucket's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    /// Admit now; `decrement` is false while the state is unknown.
    Grant { decrement: bool },
    /// The window has passed without fresh headers; refill locally.
    Refill,
    /// Depleted, but the wait fits the budget.
    Defer { until: Instant },
    /// Depleted and the wait exceeds the budget.
    Drop,
}

fn assess(state: &BucketState, now: Instant, budget: Duration) -> Verdict {
    if state.remaining < 0 {
        return Verdict::Grant { decrement: false };
    }
    if state.remaining > 0 {
        return Verdict::Grant { decrement: true };
    }
    if state.reset_at <= now {
        return Verdict::Refill;
    }
    // Inclusive boundary: a wait of exactly the budget is still served.
    if state.reset_at - now <= budget {
        Verdict::Defer { until: state.reset_at }
    } else {
        Verdict::Drop
    }
}

/// Admit one waiter against an entry, reverting the slot if the requesting
/// side vanished before hearing the verdict.
fn grant(entry: &mut BucketEntry, waiter: PendingAdmission, decrement: bool) {
    if decrement {
        entry.state.remaining -= 1;
    }
    entry.in_flight.insert(waiter.id);
    if waiter.reply.send(Admission::Pass).is_err() {
        entry.in_flight.remove(&waiter.id);
        if decrement {
            entry.state.remaining += 1;
        }
    }
}

fn refill(state: &mut BucketState) {
    state.remaining = if state.limit > 0 { state.limit } else { -1 };
}

impl Limiter {
    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        while let Some(command) = rx.recv().await {
            match command {
                Command::Admit { route, id, reply } => self.handle_admit(route, id, reply),
                Command::Update { route, id, info } => self.handle_update(route, id, info),
                Command::Release { route, id } => self.handle_release(route, id),
                Command::BucketReset { key } => self.handle_bucket_reset(key),
                Command::GlobalReset => self.handle_global_reset(),
                Command::Inspect { route, reply } => {
                    let _ = reply.send(self.snapshot(&route));
                }
            }
        }
        // Mailbox closed: remaining waiters' reply channels drop here and
        // their lanes observe the shutdown.
    }

    fn handle_admit(&mut self, route: RouteKey, id: RequestId, reply: oneshot::Sender<Admission>) {
        let now = Instant::now();
        if let Some(until) = self.global.blocked_until {
            if until > now {
                if until - now > self.config.max_allowed_wait {
                    if self.log_events {
                        debug!(%route, %id, "dropping request: global block outlasts wait budget");
                    }
                    let _ = reply.send(Admission::Drop);
                } else {
                    self.global.waiters.push_back(PendingAdmission { route, id, reply });
                    self.arm_global_timer(until);
                }
                return;
            }
            self.global.blocked_until = None;
        }

        let key = self.table.lookup(&route);
        let budget = self.config.max_allowed_wait;
        let log_events = self.log_events;
        let entry = self.table.entry(&key, now);

        // FIFO fairness: new arrivals queue behind existing waiters.
        if !entry.waiters.is_empty() {
            let reset_at = entry.state.reset_at;
            if reset_at.saturating_duration_since(now) > budget {
                let _ = reply.send(Admission::Drop);
            } else {
                entry.waiters.push_back(PendingAdmission { route, id, reply });
                if reset_at > now {
                    self.arm_bucket_timer(key, reset_at);
                }
            }
            return;
        }

        match assess(&entry.state, now, budget) {
            Verdict::Grant { decrement } => {
                grant(entry, PendingAdmission { route, id, reply }, decrement);
            }
            Verdict::Refill => {
                refill(&mut entry.state);
                let decrement = entry.state.remaining > 0;
                grant(entry, PendingAdmission { route, id, reply }, decrement);
            }
            Verdict::Defer { until } => {
                if log_events {
                    debug!(%route, %id, wait = ?(until - now), "deferring admission until bucket reset");
                }
                entry.waiters.push_back(PendingAdmission { route, id, reply });
                self.arm_bucket_timer(key, until);
            }
            Verdict::Drop => {
                if log_events {
                    debug!(%route, %id, "dropping request: predicted wait exceeds budget");
                }
                let _ = reply.send(Admission::Drop);
            }
        }
    }

    fn handle_update(&mut self, route: RouteKey, id: RequestId, info: RatelimitInfo) {
        let now = Instant::now();
        let key = match &info.bucket {
            Some(bucket) => {
                let was_unbound = matches!(self.table.lookup(&route), BucketKey::Provisional(_));
                let key = self.table.bind(&route, bucket, now);
                if was_unbound && self.log_events {
                    debug!(%route, %bucket, "route bound to bucket");
                }
                key
            }
            None => {
                if info.has_any() {
                    warn!(%route, "response carried rate-limit headers without X-RateLimit-Bucket");
                }
                self.table.lookup(&route)
            }
        };

        if self.table.get(&key).is_none() && !info.has_any() {
            return;
        }

        let reset_at = info
            .reset_at(self.config.relative_time, now)
            .or_else(|| info.retry_after.map(|after| now + after));

        {
            let entry = self.table.entry(&key, now);
            entry.in_flight.remove(&id);

            if info.has_any() {
                let stale = reset_at.is_some_and(|at| {
                    !entry.state.is_unknown() && at + STALE_TOLERANCE < entry.state.reset_at
                });
                if stale {
                    debug!(bucket = %key, "ignoring out-of-order rate-limit update");
                } else {
                    if let Some(limit) = info.limit {
                        entry.state.limit = limit;
                    }
                    if let Some(remaining) = info.remaining {
                        // The server's view wins over our local decrements.
                        entry.state.remaining = remaining;
                    }
                    if let Some(at) = reset_at {
                        entry.state.reset_at = at;
                    }
                    if entry.state.last_seen < now {
                        entry.state.last_seen = now;
                    }
                    if self.log_events {
                        debug!(
                            bucket = %key,
                            limit = entry.state.limit,
                            remaining = entry.state.remaining,
                            "rate-limit state updated"
                        );
                    }
                }
            }
        }

        if info.global {
            let until = reset_at.unwrap_or(now);
            let extended = match self.global.blocked_until {
                Some(existing) => until > existing,
                None => true,
            };
            if extended && until > now {
                warn!(blocked_for = ?(until - now), "globally rate limited; holding all requests");
                self.global.blocked_until = Some(until);
                self.arm_global_timer(until);
            }
        }

        self.drain(&key);
    }

    fn handle_release(&mut self, route: RouteKey, id: RequestId) {
        let key = self.table.lookup(&route);
        let Some(entry) = self.table.get_mut(&key) else { return };
        if !entry.in_flight.remove(&id) {
            return;
        }
        if entry.state.remaining >= 0 {
            entry.state.remaining += 1;
            if entry.state.limit >= 0 && entry.state.remaining > entry.state.limit {
                entry.state.remaining = entry.state.limit;
            }
        }
        self.drain(&key);
    }

    fn handle_bucket_reset(&mut self, key: BucketKey) {
        let Some(entry) = self.table.get_mut(&key) else { return };
        entry.timer_armed = false;
        self.drain(&key);
    }

    fn handle_global_reset(&mut self) {
        self.global.timer_armed = false;
        let now = Instant::now();
        match self.global.blocked_until {
            // The block was extended while the timer slept; sleep again.
            Some(until) if until > now => self.arm_global_timer(until),
            _ => {
                self.global.blocked_until = None;
                let waiters = std::mem::take(&mut self.global.waiters);
                for waiter in waiters {
                    self.handle_admit(waiter.route, waiter.id, waiter.reply);
                }
            }
        }
    }

    /// Move deferred admissions through a bucket while capacity lasts.
    /// At most one local refill per call; past that, remaining waiters hold
    /// until fresh headers arrive.
    fn drain(&mut self, key: &BucketKey) {
        let now = Instant::now();
        let budget = self.config.max_allowed_wait;
        let mut refilled = false;
        loop {
            let Some(entry) = self.table.get_mut(key) else { return };
            if entry.waiters.is_empty() {
                return;
            }
            match assess(&entry.state, now, budget) {
                Verdict::Grant { decrement } => {
                    if let Some(waiter) = entry.waiters.pop_front() {
                        grant(entry, waiter, decrement);
                    }
                }
                Verdict::Refill => {
                    if refilled {
                        return;
                    }
                    refilled = true;
                    refill(&mut entry.state);
                }
                Verdict::Defer { until } => {
                    self.arm_bucket_timer(key.clone(), until);
                    return;
                }
                Verdict::Drop => {
                    // The window moved out past the budget after queueing.
                    if let Some(waiter) = entry.waiters.pop_front() {
                        let _ = waiter.reply.send(Admission::Drop);
                    }
                }
            }
        }
    }

    fn arm_bucket_timer(&mut self, key: BucketKey, until: Instant) {
        let Some(entry) = self.table.get_mut(&key) else { return };
        if entry.timer_armed {
            return;
        }
        entry.timer_armed = true;
        let wait = until.saturating_duration_since(Instant::now());
        let sleeper = Arc::clone(&self.sleeper);
        let mailbox = self.mailbox.clone();
        tokio::spawn(async move {
            sleeper.sleep(wait).await;
            if let Some(tx) = mailbox.upgrade() {
                let _ = tx.send(Command::BucketReset { key }).await;
            }
        });
    }

    fn arm_global_timer(&mut self, until: Instant) {
        if self.global.timer_armed {
            return;
        }
        self.global.timer_armed = true;
        let wait = until.saturating_duration_since(Instant::now());
        let sleeper = Arc::clone(&self.sleeper);
        let mailbox = self.mailbox.clone();
        tokio::spawn(async move {
            sleeper.sleep(wait).await;
            if let Some(tx) = mailbox.upgrade() {
                let _ = tx.send(Command::GlobalReset).await;
            }
        });
    }

    fn snapshot(&self, route: &RouteKey) -> Option<BucketSnapshot> {
        let key = self.table.lookup(route);
        let entry = self.table.get(&key)?;
        let bucket = match &key {
            BucketKey::Confirmed(id) => Some(id.clone()),
            BucketKey::Provisional(_) => None,
        };
        Some(BucketSnapshot {
            bucket,
            limit: entry.state.limit,
            remaining: entry.state.remaining,
            reset_in: entry.state.reset_at.checked_duration_since(Instant::now()),
            waiting: entry.waiters.len(),
        })
    }
}
