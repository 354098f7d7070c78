//! Cancellable timers
//!
//! Timers are kept ordered by (absolute deadline in wall-clock milliseconds,
//! insertion sequence) so equal deadlines resolve deterministically. The
//! reactor bounds its poll wait with `next_timer` and drains `collect_expired`
//! after each wake; inserting a timer that becomes the new earliest deadline
//! fires a hook the reactor wires to its wake pipe.

use crate::util;
use once_cell::sync::OnceCell;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Callback run when a timer fires. Shared so recurring timers can fire
/// repeatedly.
pub type TimerCallback = Arc<dyn Fn() + Send + Sync>;

const ONE_HOUR_MS: u64 = 60 * 60 * 1000;

struct TimerShared {
    /// Insertion sequence; orders timers with equal deadlines
    seq: u64,

    /// Re-insert at now + period after firing
    recurring: bool,

    /// Period in ms
    period_ms: AtomicU64,

    /// Absolute deadline in wall-clock ms
    deadline_ms: AtomicU64,

    /// Callback; `None` once cancelled or fired (non-recurring)
    cb: Mutex<Option<TimerCallback>>,
}

impl TimerShared {
    fn key(&self) -> (u64, u64) {
        (self.deadline_ms.load(Ordering::Acquire), self.seq)
    }
}

/// Handle to a pending timer.
pub struct Timer {
    shared: Arc<TimerShared>,
    manager: Weak<TimerManager>,
}

impl Timer {
    /// Remove the timer before it fires. No-op (returns false) if it has
    /// already fired or been cancelled.
    pub fn cancel(&self) -> bool {
        let Some(manager) = self.manager.upgrade() else {
            return false;
        };
        let mut timers = manager.timers.write();
        let mut cb = self.shared.cb.lock();
        if cb.is_none() {
            return false;
        }
        *cb = None;
        timers.remove(&self.shared.key());
        true
    }

    /// Re-base the deadline to now + period.
    pub fn refresh(&self) -> bool {
        let Some(manager) = self.manager.upgrade() else {
            return false;
        };
        let mut timers = manager.timers.write();
        if self.shared.cb.lock().is_none() {
            return false;
        }
        timers.remove(&self.shared.key());
        let period = self.shared.period_ms.load(Ordering::Acquire);
        self.shared
            .deadline_ms
            .store(util::now_ms() + period, Ordering::Release);
        timers.insert(self.shared.key(), self.shared.clone());
        true
    }

    /// Change the period, keeping (`from_now == false`) or re-basing
    /// (`from_now == true`) the original start point.
    pub fn reset(&self, ms: u64, from_now: bool) -> bool {
        let period = self.shared.period_ms.load(Ordering::Acquire);
        if ms == period && !from_now {
            return true;
        }
        let Some(manager) = self.manager.upgrade() else {
            return false;
        };

        let at_front = {
            let mut timers = manager.timers.write();
            if self.shared.cb.lock().is_none() {
                return false;
            }
            timers.remove(&self.shared.key());
            let start = if from_now {
                util::now_ms()
            } else {
                self.shared
                    .deadline_ms
                    .load(Ordering::Acquire)
                    .saturating_sub(period)
            };
            self.shared.period_ms.store(ms, Ordering::Release);
            self.shared.deadline_ms.store(start + ms, Ordering::Release);
            timers.insert(self.shared.key(), self.shared.clone());
            manager.inserted_at_front(&timers, self.shared.key())
        };
        if at_front {
            manager.fire_front_hook();
        }
        true
    }
}

/// Deadline-ordered collection of cancellable, optionally recurring timers.
pub struct TimerManager {
    timers: RwLock<BTreeMap<(u64, u64), Arc<TimerShared>>>,

    /// Debounces the front-insertion hook until the next `next_timer` query
    tickled: AtomicBool,

    /// Last observed wall-clock ms, for backwards-step detection
    previous_ms: AtomicU64,

    next_seq: AtomicU64,

    /// Invoked when an insert becomes the new earliest deadline
    front_hook: OnceCell<Box<dyn Fn() + Send + Sync>>,
}

impl TimerManager {
    pub fn new() -> Arc<TimerManager> {
        Arc::new(TimerManager {
            timers: RwLock::new(BTreeMap::new()),
            tickled: AtomicBool::new(false),
            previous_ms: AtomicU64::new(util::now_ms()),
            next_seq: AtomicU64::new(1),
            front_hook: OnceCell::new(),
        })
    }

    /// Install the front-insertion hook. May be set once.
    pub(crate) fn set_front_hook(&self, hook: impl Fn() + Send + Sync + 'static) {
        if self.front_hook.set(Box::new(hook)).is_err() {
            log::error!("timer front hook installed twice");
        }
    }

    fn fire_front_hook(&self) {
        if let Some(hook) = self.front_hook.get() {
            hook();
        }
    }

    fn inserted_at_front(
        &self,
        timers: &BTreeMap<(u64, u64), Arc<TimerShared>>,
        key: (u64, u64),
    ) -> bool {
        let is_front = timers.keys().next() == Some(&key);
        is_front && !self.tickled.swap(true, Ordering::AcqRel)
    }

    /// Schedule `cb` to run after `ms` milliseconds, repeatedly if
    /// `recurring`.
    pub fn add_timer(
        self: &Arc<Self>,
        ms: u64,
        cb: impl Fn() + Send + Sync + 'static,
        recurring: bool,
    ) -> Timer {
        let shared = Arc::new(TimerShared {
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
            recurring,
            period_ms: AtomicU64::new(ms),
            deadline_ms: AtomicU64::new(util::now_ms() + ms),
            cb: Mutex::new(Some(Arc::new(cb))),
        });

        let at_front = {
            let mut timers = self.timers.write();
            let key = shared.key();
            timers.insert(key, shared.clone());
            self.inserted_at_front(&timers, key)
        };
        if at_front {
            self.fire_front_hook();
        }

        Timer {
            shared,
            manager: Arc::downgrade(self),
        }
    }

    /// Like `add_timer`, but the callback is skipped at fire time if `cond`
    /// is no longer alive.
    pub fn add_conditional_timer<T: Send + Sync + 'static>(
        self: &Arc<Self>,
        ms: u64,
        cb: impl Fn() + Send + Sync + 'static,
        cond: Weak<T>,
        recurring: bool,
    ) -> Timer {
        self.add_timer(
            ms,
            move || {
                if cond.upgrade().is_some() {
                    cb();
                }
            },
            recurring,
        )
    }

    /// Milliseconds until the earliest deadline (0 if overdue), or `None`
    /// when no timer is pending. Re-arms the front-insertion hook.
    pub fn next_timer(&self) -> Option<u64> {
        self.tickled.store(false, Ordering::Release);
        let timers = self.timers.read();
        let (&(deadline, _), _) = timers.iter().next()?;
        Some(deadline.saturating_sub(util::now_ms()))
    }

    /// Whether any timer is pending.
    pub fn has_timer(&self) -> bool {
        !self.timers.read().is_empty()
    }

    /// Remove and return the callbacks of every timer whose deadline has
    /// passed; recurring timers are re-inserted at now + period.
    ///
    /// If the wall clock stepped backwards by more than an hour, every timer
    /// is treated as expired rather than waiting arbitrarily long on
    /// deadlines that are now far in the future.
    pub fn collect_expired(&self) -> Vec<TimerCallback> {
        let now = util::now_ms();
        let rollover = self.detect_clock_rollover(now);

        let mut expired = Vec::new();
        let mut timers = self.timers.write();
        if timers.is_empty() {
            return expired;
        }
        if !rollover {
            if let Some((&(deadline, _), _)) = timers.iter().next() {
                if deadline > now {
                    return expired;
                }
            }
        }

        let due: Vec<(u64, u64)> = if rollover {
            timers.keys().copied().collect()
        } else {
            timers.range(..=(now, u64::MAX)).map(|(k, _)| *k).collect()
        };

        for key in due {
            let Some(shared) = timers.remove(&key) else {
                continue;
            };
            let mut cb_slot = shared.cb.lock();
            let Some(cb) = cb_slot.clone() else {
                continue;
            };
            if shared.recurring {
                let period = shared.period_ms.load(Ordering::Acquire);
                shared.deadline_ms.store(now + period, Ordering::Release);
                drop(cb_slot);
                timers.insert(shared.key(), shared.clone());
            } else {
                *cb_slot = None;
            }
            expired.push(cb);
        }
        expired
    }

    fn detect_clock_rollover(&self, now: u64) -> bool {
        let previous = self.previous_ms.swap(now, Ordering::AcqRel);
        now < previous.saturating_sub(ONE_HOUR_MS)
    }
}
