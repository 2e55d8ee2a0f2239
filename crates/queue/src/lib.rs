//! Reko work queue: deduplicating queue of reconciliation keys with delayed
//! and rate-limited re-adds.
//!
//! Rules, per key:
//! - a key waiting in the queue is never duplicated;
//! - a key added while a worker holds it is parked and re-queued on `done`,
//!   so the same key is never handed to two workers at once;
//! - delayed adds keep the earliest ready time.
//!
//! Shutdown abandons keys that are queued but not yet handed out; `get`
//! returns `None` from then on.

#![forbid(unsafe_code)]

mod backoff;

pub use backoff::ExponentialBackoff;

use std::collections::{BTreeMap, VecDeque};
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use metrics::{counter, gauge};
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

struct State<K> {
    queue: VecDeque<K>,
    /// Keys needing a pass: everything in `queue` plus keys parked behind `processing`.
    dirty: FxHashSet<K>,
    processing: FxHashSet<K>,
    delayed: FxHashMap<K, (Instant, u64)>,
    timers: BTreeMap<(Instant, u64), K>,
    seq: u64,
    failures: FxHashMap<K, u32>,
    shutting_down: bool,
}

impl<K: Clone + Eq + Hash> State<K> {
    fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            dirty: FxHashSet::default(),
            processing: FxHashSet::default(),
            delayed: FxHashMap::default(),
            timers: BTreeMap::new(),
            seq: 0,
            failures: FxHashMap::default(),
            shutting_down: false,
        }
    }

    /// Returns true when the key became runnable.
    fn insert(&mut self, key: K) -> bool {
        if let Some(slot) = self.delayed.remove(&key) {
            self.timers.remove(&slot);
        }
        if !self.dirty.insert(key.clone()) {
            return false;
        }
        if self.processing.contains(&key) {
            return false;
        }
        self.queue.push_back(key);
        true
    }

    fn schedule(&mut self, key: K, at: Instant) {
        // already runnable now; an immediate pass beats a later one
        if self.dirty.contains(&key) && !self.processing.contains(&key) {
            return;
        }
        if let Some(&(prev, seq)) = self.delayed.get(&key) {
            if prev <= at {
                return;
            }
            self.timers.remove(&(prev, seq));
        }
        self.seq = self.seq.wrapping_add(1);
        let slot = (at, self.seq);
        self.delayed.insert(key.clone(), slot);
        self.timers.insert(slot, key);
    }

    fn promote_due(&mut self, now: Instant) -> usize {
        let mut promoted = 0;
        while let Some((&slot, _)) = self.timers.first_key_value() {
            if slot.0 > now {
                break;
            }
            if let Some(key) = self.timers.remove(&slot) {
                self.delayed.remove(&key);
                if self.insert(key) {
                    promoted += 1;
                }
            }
        }
        promoted
    }

    fn next_deadline(&self) -> Option<Instant> { self.timers.first_key_value().map(|(slot, _)| slot.0) }
}

/// Shared work queue. Wrap in an `Arc` and hand a clone to every producer and worker.
pub struct WorkQueue<K> {
    name: &'static str,
    state: Mutex<State<K>>,
    notify: Notify,
    backoff: ExponentialBackoff,
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Send + std::fmt::Debug + 'static,
{
    pub fn new(name: &'static str, backoff: ExponentialBackoff) -> Self {
        Self { name, state: Mutex::new(State::new()), notify: Notify::new(), backoff }
    }

    fn lock(&self) -> MutexGuard<'_, State<K>> {
        // queue state stays consistent across a panicking holder; keep serving
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn report_depth(&self, st: &State<K>) {
        gauge!("workqueue_depth", st.queue.len() as f64, "queue" => self.name);
    }

    pub fn add(&self, key: K) {
        let mut st = self.lock();
        if st.shutting_down {
            return;
        }
        counter!("workqueue_adds_total", 1, "queue" => self.name);
        if st.insert(key) {
            self.report_depth(&st);
            drop(st);
            self.notify.notify_waiters();
        }
    }

    pub fn add_after(&self, key: K, delay: Duration) {
        if delay.is_zero() {
            return self.add(key);
        }
        let mut st = self.lock();
        if st.shutting_down {
            return;
        }
        st.schedule(key, Instant::now() + delay);
        drop(st);
        // waiters may be sleeping towards a later deadline
        self.notify.notify_waiters();
    }

    /// Re-add after the key's next backoff step and count the failure.
    pub fn add_rate_limited(&self, key: K) -> Duration {
        let delay = {
            let mut st = self.lock();
            let failures = st.failures.entry(key.clone()).or_insert(0);
            let delay = self.backoff.delay(*failures);
            *failures = failures.saturating_add(1);
            delay
        };
        counter!("workqueue_retries_total", 1, "queue" => self.name);
        debug!(queue = self.name, key = ?key, delay_ms = delay.as_millis() as u64, "rate-limited requeue");
        self.add_after(key, delay);
        delay
    }

    /// Reset the failure count for a key.
    pub fn forget(&self, key: &K) { self.lock().failures.remove(key); }

    pub fn num_requeues(&self, key: &K) -> u32 { self.lock().failures.get(key).copied().unwrap_or(0) }

    /// Wait for the next runnable key. The caller must call [`done`](Self::done)
    /// when finished with it. Returns `None` once the queue is shut down.
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let deadline = {
                let mut st = self.lock();
                if st.shutting_down {
                    return None;
                }
                st.promote_due(Instant::now());
                if let Some(key) = st.queue.pop_front() {
                    st.dirty.remove(&key);
                    st.processing.insert(key.clone());
                    self.report_depth(&st);
                    return Some(key);
                }
                st.next_deadline()
            };

            match deadline {
                Some(at) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(at) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Release a key handed out by `get`; a parked re-add is queued now.
    pub fn done(&self, key: &K) {
        let mut st = self.lock();
        st.processing.remove(key);
        let requeue = !st.shutting_down && st.dirty.contains(key);
        if requeue {
            st.queue.push_back(key.clone());
            self.report_depth(&st);
        }
        drop(st);
        self.notify.notify_waiters();
    }

    /// Number of keys runnable now (excludes delayed and in-flight keys).
    pub fn len(&self) -> usize { self.lock().queue.len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    pub fn delayed_len(&self) -> usize { self.lock().delayed.len() }

    pub fn in_flight(&self) -> usize { self.lock().processing.len() }

    pub fn is_shutting_down(&self) -> bool { self.lock().shutting_down }

    /// Stop handing out keys; queued and delayed keys are dropped.
    pub fn shut_down(&self) {
        let mut st = self.lock();
        st.shutting_down = true;
        st.queue.clear();
        st.dirty.clear();
        st.delayed.clear();
        st.timers.clear();
        self.report_depth(&st);
        drop(st);
        self.notify.notify_waiters();
    }

    /// `shut_down`, then wait until every in-flight key is `done`.
    pub async fn shut_down_with_drain(&self) {
        self.shut_down();
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.lock().processing.is_empty() {
                return;
            }
            notified.await;
        }
    }
}
