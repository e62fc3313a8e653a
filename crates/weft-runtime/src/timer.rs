//! Time-ordered timer set
//!
//! Timers are keyed by `(deadline, id)` in an ordered map under a
//! reader-writer lock; the id tie-break keeps same-deadline firing order
//! deterministic. Handles address timers by id through a weak reference,
//! so an outstanding `Timer` never keeps its manager alive and every
//! handle operation on a dead manager degrades to `false`.
//!
//! Deadlines are wall-clock milliseconds. A backwards clock jump of more
//! than one hour between observations is treated as a system clock reset
//! and flushes every outstanding timer in one sweep.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, RwLock, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use weft_core::constants::CLOCK_ROLLOVER_MS;

/// A timer callback; recurring timers fire it repeatedly
pub type TimerCallback = Arc<dyn Fn() + Send + Sync + 'static>;

/// Wall-clock milliseconds since the Unix epoch
#[inline]
fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct TimerKey {
    next: u64,
    id: u64,
}

struct TimerSlot {
    ms: u64,
    recurring: bool,
    cb: TimerCallback,
}

struct TimerState {
    queue: BTreeMap<TimerKey, TimerSlot>,
    /// id -> current deadline, to locate queue entries from handles
    deadlines: HashMap<u64, u64>,
    /// Last observed `now`, for rollover detection
    previous: u64,
}

struct TimerShared {
    state: RwLock<TimerState>,
    /// Coalesces front-insertion wakeups until the next `next_timer_ms`
    tickled: AtomicBool,
    next_id: AtomicU64,
    /// Invoked when a new head timer needs the idle wait broken
    front_hook: OnceLock<Box<dyn Fn() + Send + Sync>>,
}

impl TimerShared {
    /// Insert under the write lock; true when the entry became the head
    fn insert_locked(st: &mut TimerState, id: u64, next: u64, slot: TimerSlot) -> bool {
        let key = TimerKey { next, id };
        st.queue.insert(key, slot);
        st.deadlines.insert(id, next);
        st.queue.first_key_value().map(|(k, _)| *k) == Some(key)
    }

    /// Fire the front hook once per wakeup cycle
    fn maybe_tickle(&self, at_front: bool) {
        if at_front && !self.tickled.swap(true, Ordering::AcqRel) {
            if let Some(hook) = self.front_hook.get() {
                hook();
            }
        }
    }
}

/// The ordered timer set
pub struct TimerManager {
    shared: Arc<TimerShared>,
}

impl Default for TimerManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerManager {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(TimerShared {
                state: RwLock::new(TimerState {
                    queue: BTreeMap::new(),
                    deadlines: HashMap::new(),
                    previous: now_ms(),
                }),
                tickled: AtomicBool::new(false),
                next_id: AtomicU64::new(0),
                front_hook: OnceLock::new(),
            }),
        }
    }

    /// Install the front-insertion wakeup hook (at most once)
    ///
    /// The I/O manager points this at its tickle pipe so a new head timer
    /// shortens an in-flight idle wait.
    pub fn set_front_hook(&self, hook: Box<dyn Fn() + Send + Sync>) {
        let _ = self.shared.front_hook.set(hook);
    }

    /// Schedule `cb` to fire in `ms` milliseconds
    ///
    /// Recurring timers re-arm themselves relative to each firing.
    pub fn add_timer<F>(&self, ms: u64, cb: F, recurring: bool) -> Timer
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.add_timer_cb(ms, Arc::new(cb), recurring)
    }

    fn add_timer_cb(&self, ms: u64, cb: TimerCallback, recurring: bool) -> Timer {
        let shared = &self.shared;
        let id = shared.next_id.fetch_add(1, Ordering::Relaxed);
        let next = now_ms().saturating_add(ms);

        let at_front = {
            let mut st = shared.state.write().unwrap();
            TimerShared::insert_locked(&mut st, id, next, TimerSlot { ms, recurring, cb })
        };
        shared.maybe_tickle(at_front);

        Timer {
            id,
            shared: Arc::downgrade(shared),
        }
    }

    /// Schedule `cb`, but skip the firing if `cond` is gone by then
    ///
    /// Ties timer validity to the lifetime of an unrelated object without
    /// retaining it.
    pub fn add_condition_timer<F, T>(&self, ms: u64, cb: F, cond: Weak<T>, recurring: bool) -> Timer
    where
        F: Fn() + Send + Sync + 'static,
        T: ?Sized + Send + Sync + 'static,
    {
        self.add_timer_cb(
            ms,
            Arc::new(move || {
                if cond.upgrade().is_some() {
                    cb();
                }
            }),
            recurring,
        )
    }

    /// Milliseconds until the head timer is due
    ///
    /// `u64::MAX` when the set is empty, 0 when the head is already due.
    /// Clears the tickle-coalescing flag: the caller is about to sleep on
    /// the returned value, so the next front insertion must wake it.
    pub fn next_timer_ms(&self) -> u64 {
        self.shared.tickled.store(false, Ordering::Release);

        let st = self.shared.state.read().unwrap();
        match st.queue.first_key_value() {
            None => u64::MAX,
            Some((key, _)) => {
                let now = now_ms();
                if key.next <= now {
                    0
                } else {
                    key.next - now
                }
            }
        }
    }

    /// Extract every due callback into `out`
    ///
    /// Detects clock rollover (backwards jump > 1 h) and flushes the whole
    /// set when it happens. Recurring timers are re-armed relative to now;
    /// one-shot timers are removed for good.
    pub fn collect_expired(&self, out: &mut Vec<TimerCallback>) {
        let now = now_ms();
        let mut st = self.shared.state.write().unwrap();

        let rollover = now < st.previous.saturating_sub(CLOCK_ROLLOVER_MS);
        let mut rearm: Vec<(u64, TimerSlot)> = Vec::new();

        while let Some((&key, _)) = st.queue.first_key_value() {
            if !rollover && key.next > now {
                break;
            }
            let slot = st.queue.remove(&key).unwrap();
            out.push(slot.cb.clone());
            if slot.recurring {
                rearm.push((key.id, slot));
            } else {
                st.deadlines.remove(&key.id);
            }
        }

        for (id, slot) in rearm {
            let next = now.saturating_add(slot.ms);
            TimerShared::insert_locked(&mut st, id, next, slot);
        }

        st.previous = now;
    }

    /// Any timers outstanding?
    pub fn has_timer(&self) -> bool {
        !self.shared.state.read().unwrap().queue.is_empty()
    }

    #[cfg(test)]
    fn timer_count(&self) -> usize {
        self.shared.state.read().unwrap().queue.len()
    }

    /// Pretend the clock was last observed at `ms` (rollover testing)
    #[cfg(test)]
    pub(crate) fn set_previous_time(&self, ms: u64) {
        self.shared.state.write().unwrap().previous = ms;
    }
}

/// Owning handle to a scheduled timer
pub struct Timer {
    id: u64,
    shared: Weak<TimerShared>,
}

impl Timer {
    /// Remove the timer; false if it already fired or was cancelled
    pub fn cancel(&self) -> bool {
        let Some(shared) = self.shared.upgrade() else {
            return false;
        };
        let mut st = shared.state.write().unwrap();
        match st.deadlines.remove(&self.id) {
            Some(next) => {
                st.queue.remove(&TimerKey { next, id: self.id });
                true
            }
            None => false,
        }
    }

    /// Push the deadline out to now + period; false if no longer resident
    pub fn refresh(&self) -> bool {
        let Some(shared) = self.shared.upgrade() else {
            return false;
        };
        let mut st = shared.state.write().unwrap();
        let Some(&next) = st.deadlines.get(&self.id) else {
            return false;
        };
        let Some(slot) = st.queue.remove(&TimerKey { next, id: self.id }) else {
            return false;
        };
        let new_next = now_ms().saturating_add(slot.ms);
        TimerShared::insert_locked(&mut st, self.id, new_next, slot);
        true
    }

    /// Change the period
    ///
    /// With `from_now` the new period counts from now, otherwise from the
    /// previous start point. An unchanged period without `from_now` is a
    /// successful no-op.
    pub fn reset(&self, ms: u64, from_now: bool) -> bool {
        let Some(shared) = self.shared.upgrade() else {
            return false;
        };
        let mut st = shared.state.write().unwrap();
        let Some(&next) = st.deadlines.get(&self.id) else {
            return false;
        };
        let key = TimerKey { next, id: self.id };
        let Some(mut slot) = st.queue.remove(&key) else {
            return false;
        };
        if slot.ms == ms && !from_now {
            st.queue.insert(key, slot);
            return true;
        }
        let start = if from_now {
            now_ms()
        } else {
            next.saturating_sub(slot.ms)
        };
        slot.ms = ms;
        let at_front = TimerShared::insert_locked(&mut st, self.id, start.saturating_add(ms), slot);
        drop(st);
        // Re-insertion can produce a new head, same as a fresh add
        shared.maybe_tickle(at_front);
        true
    }
}
