//! N:M fiber scheduler
//!
//! A fixed pool of worker threads serves a single queue of (fiber | callback,
//! thread-affinity) entries. Workers resume fibers on their own OS thread;
//! plain callbacks run inside a per-thread reusable callback fiber so both
//! kinds of work share the suspend/resume machinery. The idle, tickle and
//! stopping behaviors are injected through the [`Driver`] trait; the reactor
//! supplies an epoll-backed driver, the base driver just yields until told to
//! stop.

use crate::fiber::{Fiber, FiberState};
use crate::util;
use parking_lot::Mutex;
use std::any::Any;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

thread_local! {
    /// Scheduler this thread works for.
    static CURRENT_SCHEDULER: RefCell<Option<Arc<Scheduler>>> = const { RefCell::new(None) };
    /// The fiber running the scheduler loop on this thread. Worker fibers
    /// swap with this context.
    static SCHEDULER_MAIN: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };
}

/// Pluggable worker-idle behavior.
///
/// `idle` runs inside a dedicated idle fiber whenever a worker finds no
/// runnable entry; `tickle` wakes an idle worker after an enqueue; `stopping`
/// decides when idle workers may exit.
pub trait Driver: Send + Sync + 'static {
    /// Body of the idle fiber. Returns (terminating the idle fiber) only
    /// when the scheduler is allowed to stop.
    fn idle(&self, scheduler: &Arc<Scheduler>);

    /// Wake an idle worker so it re-checks the queue.
    fn tickle(&self, scheduler: &Arc<Scheduler>);

    /// Whether workers may exit.
    fn stopping(&self, scheduler: &Arc<Scheduler>) -> bool;

    /// Downcast support for layers that know their concrete driver.
    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// Base driver: spin through yields until the scheduler drains.
struct YieldDriver;

impl Driver for YieldDriver {
    fn idle(&self, scheduler: &Arc<Scheduler>) {
        log::debug!("scheduler {} idle", scheduler.name());
        while !scheduler.stopping() {
            Fiber::yield_to_hold();
        }
    }

    fn tickle(&self, scheduler: &Arc<Scheduler>) {
        log::debug!("scheduler {} tickle", scheduler.name());
    }

    fn stopping(&self, scheduler: &Arc<Scheduler>) -> bool {
        scheduler.base_stopping()
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// A unit of scheduled work.
pub enum Job {
    /// An existing fiber to resume
    Fiber(Arc<Fiber>),
    /// A plain callback, run inside the worker's callback fiber
    Func(Box<dyn FnOnce() + Send>),
}

impl Job {
    /// Wrap a closure as a schedulable job.
    pub fn from_fn(f: impl FnOnce() + Send + 'static) -> Job {
        Job::Func(Box::new(f))
    }
}

impl From<Arc<Fiber>> for Job {
    fn from(fiber: Arc<Fiber>) -> Job {
        Job::Fiber(fiber)
    }
}

struct JobEntry {
    job: Job,
    /// OS thread id this entry is pinned to; `None` runs anywhere.
    thread: Option<u64>,
}

/// The N:M scheduler.
pub struct Scheduler {
    name: String,

    /// Pending work, scanned under one mutex
    queue: Mutex<VecDeque<JobEntry>>,

    /// Worker thread handles
    threads: Mutex<Vec<thread::JoinHandle<()>>>,

    /// OS thread ids of the workers, for affinity targeting
    thread_ids: Mutex<Vec<u64>>,

    /// Number of worker threads to spawn (excludes the caller thread)
    thread_count: usize,

    /// Workers currently running a task
    active_threads: AtomicUsize,

    /// Workers currently inside the idle fiber
    idle_threads: AtomicUsize,

    /// True until `start`, and again once `stop` begins
    stop_flag: AtomicBool,

    /// Set by `stop`: drain and exit instead of waiting for more work
    auto_stop: AtomicBool,

    /// Caller thread id when it participates as a worker
    root_thread: Option<u64>,

    /// Fiber driving the run loop on the caller thread (`use_caller` only)
    root_fiber: Mutex<Option<Arc<Fiber>>>,

    driver: Arc<dyn Driver>,
}

impl Scheduler {
    /// Create a scheduler with the base yield-until-stopped driver.
    ///
    /// `threads == 0` means one worker per CPU core. With `use_caller` the
    /// constructing thread itself counts as one of the workers and drives
    /// its share of the loop inside `stop`.
    pub fn new(threads: usize, use_caller: bool, name: &str) -> Arc<Scheduler> {
        Scheduler::with_driver(threads, use_caller, name, Arc::new(YieldDriver))
    }

    pub(crate) fn with_driver(
        threads: usize,
        use_caller: bool,
        name: &str,
        driver: Arc<dyn Driver>,
    ) -> Arc<Scheduler> {
        let mut thread_count = if threads == 0 { num_cpus::get() } else { threads };
        crate::fatal_assert!(thread_count > 0, "scheduler needs at least one thread");

        let root_thread = if use_caller {
            thread_count -= 1;
            Some(util::thread_id())
        } else {
            None
        };

        let scheduler = Arc::new(Scheduler {
            name: name.to_string(),
            queue: Mutex::new(VecDeque::new()),
            threads: Mutex::new(Vec::new()),
            thread_ids: Mutex::new(Vec::new()),
            thread_count,
            active_threads: AtomicUsize::new(0),
            idle_threads: AtomicUsize::new(0),
            stop_flag: AtomicBool::new(true),
            auto_stop: AtomicBool::new(false),
            root_thread,
            root_fiber: Mutex::new(None),
            driver,
        });

        if use_caller {
            // The caller thread becomes a worker: its run loop lives in a
            // dedicated root fiber, driven inline by stop().
            Fiber::current();
            crate::fatal_assert!(
                Scheduler::current().is_none(),
                "caller thread already belongs to a scheduler"
            );
            Scheduler::set_current(&scheduler);

            let sched = scheduler.clone();
            let root = Fiber::new(move || sched.run(), 0);
            *scheduler.root_fiber.lock() = Some(root.clone());
            Scheduler::set_main_fiber(&root);

            if let Some(tid) = scheduler.root_thread {
                scheduler.thread_ids.lock().push(tid);
            }
        }

        scheduler
    }

    /// Scheduler name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of pool threads (excluding a participating caller).
    pub fn worker_count(&self) -> usize {
        self.thread_count
    }

    /// OS thread ids of the workers seen so far; usable as affinity targets.
    pub fn thread_ids(&self) -> Vec<u64> {
        self.thread_ids.lock().clone()
    }

    /// Scheduler the calling thread works for, if any.
    pub fn current() -> Option<Arc<Scheduler>> {
        CURRENT_SCHEDULER.with(|c| c.borrow().clone())
    }

    fn set_current(scheduler: &Arc<Scheduler>) {
        CURRENT_SCHEDULER.with(|c| *c.borrow_mut() = Some(scheduler.clone()));
    }

    fn clear_current() {
        CURRENT_SCHEDULER.with(|c| *c.borrow_mut() = None);
    }

    /// The fiber worker fibers swap with on this thread.
    pub(crate) fn main_fiber() -> Option<Arc<Fiber>> {
        SCHEDULER_MAIN.with(|c| c.borrow().clone())
    }

    fn set_main_fiber(fiber: &Arc<Fiber>) {
        SCHEDULER_MAIN.with(|c| *c.borrow_mut() = Some(fiber.clone()));
    }

    pub(crate) fn driver(self: &Arc<Self>) -> Arc<dyn Driver> {
        self.driver.clone()
    }

    /// Spawn the worker pool. Idempotent.
    pub fn start(self: &Arc<Self>) {
        let mut threads = self.threads.lock();
        if !self.stop_flag.load(Ordering::Acquire) {
            return;
        }
        self.stop_flag.store(false, Ordering::Release);
        crate::fatal_assert!(
            threads.is_empty(),
            "scheduler {} restarted with live workers",
            self.name
        );

        log::info!(
            "scheduler {} starting {} worker threads",
            self.name,
            self.thread_count
        );
        for i in 0..self.thread_count {
            let sched = self.clone();
            let handle = thread::Builder::new()
                .name(format!("{}_{}", self.name, i))
                .spawn(move || sched.run())
                .unwrap_or_else(|e| crate::fatal!("failed to spawn worker thread: {}", e));
            threads.push(handle);
        }
    }

    /// Enqueue work runnable on any worker.
    pub fn schedule(self: &Arc<Self>, job: impl Into<Job>) {
        self.schedule_on(job, None);
    }

    /// Enqueue work, optionally pinned to the worker with OS thread id
    /// `thread`.
    pub fn schedule_on(self: &Arc<Self>, job: impl Into<Job>, thread: Option<u64>) {
        let need_tickle = {
            let mut queue = self.queue.lock();
            let was_empty = queue.is_empty();
            queue.push_back(JobEntry {
                job: job.into(),
                thread,
            });
            was_empty
        };
        if need_tickle {
            self.driver.tickle(self);
        }
    }

    /// Enqueue a closure runnable on any worker.
    pub fn spawn(self: &Arc<Self>, f: impl FnOnce() + Send + 'static) {
        self.schedule(Job::from_fn(f));
    }

    /// Drain and shut down: request auto-stop, wake every worker, drive the
    /// caller's share of the loop if it participates, then join the pool.
    pub fn stop(self: &Arc<Self>) {
        self.auto_stop.store(true, Ordering::Release);

        let root = self.root_fiber.lock().clone();
        if let Some(rf) = &root {
            if self.thread_count == 0
                && matches!(rf.state(), FiberState::Term | FiberState::Init)
            {
                log::info!("scheduler {} stopped", self.name);
                self.stop_flag.store(true, Ordering::Release);
                if self.stopping() {
                    *self.root_fiber.lock() = None;
                    return;
                }
            }
        }

        if self.root_thread.is_some() {
            crate::fatal_assert!(
                self.root_thread == Some(util::thread_id()),
                "stop() of a caller-participating scheduler must run on the caller thread"
            );
        }

        self.stop_flag.store(true, Ordering::Release);
        for _ in 0..self.thread_count {
            self.driver.tickle(self);
        }

        if let Some(rf) = root {
            if !self.stopping() {
                rf.resume();
            }
        }

        let threads = std::mem::take(&mut *self.threads.lock());
        for handle in threads {
            if handle.join().is_err() {
                log::error!("scheduler {} worker thread panicked", self.name);
            }
        }

        // The root fiber's closure holds a reference back to this
        // scheduler; release it now that the loop has finished.
        *self.root_fiber.lock() = None;

        if let Some(current) = Scheduler::current() {
            if Arc::ptr_eq(&current, self) {
                Scheduler::clear_current();
            }
        }
    }

    /// The drain condition shared by every driver: stop requested, queue
    /// empty, and nothing mid-resume.
    pub(crate) fn base_stopping(&self) -> bool {
        self.auto_stop.load(Ordering::Acquire)
            && self.stop_flag.load(Ordering::Acquire)
            && self.queue.lock().is_empty()
            && self.active_threads.load(Ordering::SeqCst) == 0
    }

    /// Whether workers may exit, as decided by the installed driver.
    pub fn stopping(self: &Arc<Self>) -> bool {
        self.driver.stopping(self)
    }

    pub(crate) fn has_idle_threads(&self) -> bool {
        self.idle_threads.load(Ordering::SeqCst) > 0
    }

    /// Queued entries (diagnostics and tests).
    pub fn queued_len(&self) -> usize {
        self.queue.lock().len()
    }

    /// Workers currently mid-resume (diagnostics and tests).
    pub fn active_count(&self) -> usize {
        self.active_threads.load(Ordering::SeqCst)
    }

    /// Worker loop; runs on every pool thread and inside the root fiber.
    fn run(self: Arc<Self>) {
        log::debug!("scheduler {} run", self.name);
        crate::hook::set_hook_enabled(true);
        Scheduler::set_current(&self);

        let tid = util::thread_id();
        if self.root_thread != Some(tid) {
            // Pool thread: the scheduler loop runs on the thread itself.
            let main = Fiber::current();
            Scheduler::set_main_fiber(&main);
            self.thread_ids.lock().push(tid);
        }

        let driver = self.driver.clone();
        let sched = self.clone();
        let idle_fiber = Fiber::new(move || driver.idle(&sched), 0);
        let mut cb_fiber: Option<Arc<Fiber>> = None;

        loop {
            let mut entry: Option<JobEntry> = None;
            let mut tickle_me = false;
            let mut is_active = false;
            {
                let mut queue = self.queue.lock();
                let mut i = 0;
                while i < queue.len() {
                    if let Some(thread) = queue[i].thread {
                        if thread != tid {
                            // Pinned elsewhere; someone else must wake up.
                            tickle_me = true;
                            i += 1;
                            continue;
                        }
                    }
                    if let Job::Fiber(fiber) = &queue[i].job {
                        if fiber.state() == FiberState::Exec {
                            i += 1;
                            continue;
                        }
                    }
                    entry = queue.remove(i);
                    self.active_threads.fetch_add(1, Ordering::SeqCst);
                    is_active = true;
                    tickle_me |= i < queue.len();
                    break;
                }
            }
            if tickle_me {
                self.driver.tickle(&self);
            }

            match entry {
                Some(JobEntry {
                    job: Job::Fiber(fiber),
                    ..
                }) => {
                    if !matches!(fiber.state(), FiberState::Term | FiberState::Except) {
                        fiber.resume();
                        self.active_threads.fetch_sub(1, Ordering::SeqCst);
                        match fiber.state() {
                            FiberState::Ready => self.schedule(Job::Fiber(fiber)),
                            FiberState::Term | FiberState::Except => {}
                            // Parked as Hold by its own yield; the reactor
                            // or a timer re-enqueues it. It may already be
                            // running on another worker, so no state write
                            // is safe here.
                            _ => {}
                        }
                    } else {
                        self.active_threads.fetch_sub(1, Ordering::SeqCst);
                    }
                }
                Some(JobEntry {
                    job: Job::Func(f), ..
                }) => {
                    let fiber = match cb_fiber.take() {
                        Some(fb) => {
                            fb.reset(f);
                            fb
                        }
                        None => Fiber::new(f, 0),
                    };
                    fiber.resume();
                    self.active_threads.fetch_sub(1, Ordering::SeqCst);
                    match fiber.state() {
                        FiberState::Ready => self.schedule(Job::Fiber(fiber)),
                        FiberState::Term | FiberState::Except => {
                            // Finished: keep the fiber for the next callback.
                            cb_fiber = Some(fiber);
                        }
                        // Parked; a waiter owns it now, so a fresh callback
                        // fiber will be created for the next callback.
                        _ => {}
                    }
                }
                None => {
                    if is_active {
                        self.active_threads.fetch_sub(1, Ordering::SeqCst);
                        continue;
                    }
                    if idle_fiber.state() == FiberState::Term {
                        log::info!("scheduler {} idle fiber terminated", self.name);
                        break;
                    }
                    self.idle_threads.fetch_add(1, Ordering::SeqCst);
                    idle_fiber.resume();
                    self.idle_threads.fetch_sub(1, Ordering::SeqCst);
                    if !matches!(
                        idle_fiber.state(),
                        FiberState::Term | FiberState::Except
                    ) {
                        idle_fiber.set_state(FiberState::Hold);
                    }
                }
            }
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if !self.stop_flag.load(Ordering::Acquire) {
            log::warn!("scheduler {} dropped without stop()", self.name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_scheduler_runs_callbacks() {
        let scheduler = Scheduler::new(2, false, "test_cbs");
        let counter = Arc::new(AtomicUsize::new(0));

        scheduler.start();
        for _ in 0..10 {
            let counter = counter.clone();
            scheduler.spawn(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        scheduler.stop();

        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_scheduler_runs_fibers() {
        let scheduler = Scheduler::new(1, false, "test_fibers");
        let counter = Arc::new(AtomicUsize::new(0));

        let c2 = counter.clone();
        let fiber = Fiber::new(
            move || {
                c2.fetch_add(1, Ordering::SeqCst);
                Fiber::yield_to_ready();
                c2.fetch_add(1, Ordering::SeqCst);
            },
            0,
        );

        scheduler.start();
        scheduler.schedule(fiber.clone());
        scheduler.stop();

        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert_eq!(fiber.state(), FiberState::Term);
    }

    #[test]
    fn test_scheduler_drains_to_quiescence() {
        let scheduler = Scheduler::new(3, false, "test_drain");

        scheduler.start();
        for _ in 0..50 {
            scheduler.spawn(|| {
                std::thread::sleep(std::time::Duration::from_micros(100));
            });
        }
        scheduler.stop();

        assert_eq!(scheduler.queued_len(), 0);
        assert_eq!(scheduler.active_count(), 0);
    }

    #[test]
    fn test_use_caller_drives_inline() {
        std::thread::spawn(|| {
            let scheduler = Scheduler::new(1, true, "test_caller");
            let counter = Arc::new(AtomicUsize::new(0));

            scheduler.start();
            for _ in 0..5 {
                let counter = counter.clone();
                scheduler.spawn(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                });
            }
            // thread_count is 0: the stop call runs the whole queue inline.
            scheduler.stop();

            assert_eq!(counter.load(Ordering::SeqCst), 5);
        })
        .join()
        .expect("thread join failed");
    }

    fn requeue_pinned(scheduler: Arc<Scheduler>, remaining: Arc<AtomicUsize>) {
        let tid = util::thread_id();
        if remaining.fetch_sub(1, Ordering::SeqCst) > 1 {
            let sched = scheduler.clone();
            let rem = remaining.clone();
            scheduler.schedule_on(
                Job::from_fn(move || requeue_pinned(sched, rem)),
                Some(tid),
            );
        }
    }

    #[test]
    fn test_affinity_requeue_to_own_thread() {
        let scheduler = Scheduler::new(3, false, "test_affinity");
        let remaining = Arc::new(AtomicUsize::new(5));

        scheduler.start();
        let sched = scheduler.clone();
        let rem = remaining.clone();
        scheduler.spawn(move || requeue_pinned(sched, rem));
        scheduler.stop();

        assert_eq!(remaining.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_hold_fiber_resumed_by_external_schedule() {
        let scheduler = Scheduler::new(2, false, "test_hold");
        let counter = Arc::new(AtomicUsize::new(0));

        let c2 = counter.clone();
        let fiber = Fiber::new(
            move || {
                c2.fetch_add(1, Ordering::SeqCst);
                Fiber::yield_to_hold();
                c2.fetch_add(1, Ordering::SeqCst);
            },
            0,
        );

        scheduler.start();
        scheduler.schedule(fiber.clone());

        // Wait until the first half ran and the fiber parked.
        while counter.load(Ordering::SeqCst) < 1 {
            std::thread::yield_now();
        }
        while fiber.state() != FiberState::Hold {
            std::thread::yield_now();
        }

        // A held fiber is re-enqueued externally.
        scheduler.schedule(fiber.clone());
        scheduler.stop();

        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert_eq!(fiber.state(), FiberState::Term);
    }
}
