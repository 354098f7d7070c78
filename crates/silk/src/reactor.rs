//! Epoll reactor
//!
//! The reactor composes a [`Scheduler`] with an edge-triggered epoll poller:
//! the poller is installed as the scheduler's [`Driver`], replacing the idle
//! yield-loop with a blocking `epoll_wait` bounded by the next timer
//! deadline. Descriptor readiness is translated back into fiber or callback
//! resumption on the scheduler that registered the interest; a self-pipe
//! wakes the poll when work or an earlier timer arrives.

use crate::error::Error;
use crate::fiber::{Fiber, FiberState};
use crate::scheduler::{Driver, Job, Scheduler};
use crate::timer::{Timer, TimerManager};
use parking_lot::{Mutex, RwLock};
use std::any::Any;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

/// Waitable interest on a descriptor.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Event {
    /// Readable (`EPOLLIN`)
    Read,
    /// Writable (`EPOLLOUT`)
    Write,
}

impl Event {
    fn bits(self) -> u32 {
        match self {
            Event::Read => libc::EPOLLIN as u32,
            Event::Write => libc::EPOLLOUT as u32,
        }
    }
}

/// Set of registered interests, bit-compatible with epoll.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct EventSet(u32);

impl EventSet {
    pub const NONE: EventSet = EventSet(0);

    pub fn contains(self, event: Event) -> bool {
        self.0 & event.bits() != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    fn insert(&mut self, event: Event) {
        self.0 |= event.bits();
    }

    fn remove(&mut self, event: Event) {
        self.0 &= !event.bits();
    }

    fn intersection(self, other: EventSet) -> EventSet {
        EventSet(self.0 & other.0)
    }

    fn difference(self, other: EventSet) -> EventSet {
        EventSet(self.0 & !other.0)
    }

    fn bits(self) -> u32 {
        self.0
    }
}

/// Who to wake when an interest becomes ready: the scheduler that registered
/// it, plus either a parked fiber or a callback.
struct EventWaiter {
    scheduler: Option<Arc<Scheduler>>,
    fiber: Option<Arc<Fiber>>,
    cb: Option<Box<dyn FnOnce() + Send>>,
}

impl EventWaiter {
    const fn empty() -> EventWaiter {
        EventWaiter {
            scheduler: None,
            fiber: None,
            cb: None,
        }
    }

    fn is_empty(&self) -> bool {
        self.fiber.is_none() && self.cb.is_none()
    }

    fn clear(&mut self) {
        self.scheduler = None;
        self.fiber = None;
        self.cb = None;
    }
}

/// Bookkeeping for one descriptor. The interest set always mirrors what is
/// registered with epoll, and a waiter slot is non-empty iff its bit is set.
struct FdContext {
    fd: i32,
    inner: Mutex<FdContextInner>,
}

struct FdContextInner {
    events: EventSet,
    read: EventWaiter,
    write: EventWaiter,
}

impl FdContextInner {
    fn waiter_mut(&mut self, event: Event) -> &mut EventWaiter {
        match event {
            Event::Read => &mut self.read,
            Event::Write => &mut self.write,
        }
    }

    /// Hand the waiter for `event` back to its scheduler and drop the
    /// interest bit. The registration must exist.
    fn trigger(&mut self, fd: i32, event: Event) {
        crate::fatal_assert!(
            self.events.contains(event),
            "trigger of unregistered {:?} on fd {}",
            event,
            fd
        );
        self.events.remove(event);

        let waiter = self.waiter_mut(event);
        let scheduler = waiter.scheduler.take();
        let cb = waiter.cb.take();
        let fiber = waiter.fiber.take();

        let Some(scheduler) = scheduler else {
            log::error!("waiter for {:?} on fd {} has no owning scheduler", event, fd);
            return;
        };
        if let Some(cb) = cb {
            scheduler.schedule(Job::Func(cb));
        } else if let Some(fiber) = fiber {
            scheduler.schedule(Job::Fiber(fiber));
        }
    }
}

const MAX_EVENTS: usize = 64;
const MAX_TIMEOUT_MS: u64 = 5000;

/// The epoll side of the reactor: multiplexer instance, wake pipe, fd
/// interest table, timer manager, pending-event counter. Installed as the
/// scheduler's driver.
pub(crate) struct Poller {
    epfd: i32,
    tickle_fds: [i32; 2],
    pending_events: AtomicUsize,
    contexts: RwLock<Vec<Option<Arc<FdContext>>>>,
    pub(crate) timers: Arc<TimerManager>,
}

impl Poller {
    fn new() -> Poller {
        let epfd = unsafe { libc::epoll_create1(0) };
        crate::fatal_assert!(
            epfd >= 0,
            "epoll_create1 failed: {}",
            std::io::Error::last_os_error()
        );

        let mut fds = [0i32; 2];
        crate::fatal_assert!(
            unsafe { libc::pipe(fds.as_mut_ptr()) } == 0,
            "pipe failed: {}",
            std::io::Error::last_os_error()
        );
        unsafe {
            let flags = libc::fcntl(fds[0], libc::F_GETFL, 0);
            crate::fatal_assert!(
                flags >= 0 && libc::fcntl(fds[0], libc::F_SETFL, flags | libc::O_NONBLOCK) == 0,
                "failed to make wake pipe non-blocking: {}",
                std::io::Error::last_os_error()
            );

            let mut event = libc::epoll_event {
                events: (libc::EPOLLIN | libc::EPOLLET) as u32,
                u64: fds[0] as u64,
            };
            crate::fatal_assert!(
                libc::epoll_ctl(epfd, libc::EPOLL_CTL_ADD, fds[0], &mut event) == 0,
                "failed to register wake pipe: {}",
                std::io::Error::last_os_error()
            );
        }

        Poller {
            epfd,
            tickle_fds: fds,
            pending_events: AtomicUsize::new(0),
            contexts: RwLock::new(std::iter::repeat_with(|| None).take(32).collect()),
            timers: TimerManager::new(),
        }
    }

    /// The poller driving the calling worker thread, if any.
    pub(crate) fn current() -> Option<Arc<Poller>> {
        let scheduler = Scheduler::current()?;
        scheduler.driver().as_any().downcast::<Poller>().ok()
    }

    /// Context slot for `fd`, growing the table by half on first use of a
    /// larger descriptor.
    fn context(&self, fd: i32) -> Arc<FdContext> {
        let idx = fd as usize;
        {
            let contexts = self.contexts.read();
            if let Some(Some(ctx)) = contexts.get(idx) {
                return ctx.clone();
            }
        }

        let mut contexts = self.contexts.write();
        if idx >= contexts.len() {
            let grown = (idx as f64 * 1.5) as usize + 1;
            contexts.resize_with(grown, || None);
        }
        if let Some(ctx) = &contexts[idx] {
            return ctx.clone();
        }
        let ctx = Arc::new(FdContext {
            fd,
            inner: Mutex::new(FdContextInner {
                events: EventSet::NONE,
                read: EventWaiter::empty(),
                write: EventWaiter::empty(),
            }),
        });
        contexts[idx] = Some(ctx.clone());
        ctx
    }

    fn lookup(&self, fd: i32) -> Option<Arc<FdContext>> {
        self.contexts.read().get(fd as usize).cloned().flatten()
    }

    /// Register interest in `event` on `fd`.
    ///
    /// The waiter is `cb` if given, otherwise the current fiber. Registering
    /// an interest that is already present is a contract violation reported
    /// as an error.
    pub(crate) fn add_event(
        &self,
        fd: i32,
        event: Event,
        cb: Option<Box<dyn FnOnce() + Send>>,
    ) -> Result<(), Error> {
        let Some(scheduler) = Scheduler::current() else {
            return Err(Error::NoScheduler);
        };

        let ctx = self.context(fd);
        let mut inner = ctx.inner.lock();

        if inner.events.contains(event) {
            log::error!(
                "add_event: {:?} already registered for fd {} (registered {:?})",
                event,
                fd,
                inner.events
            );
            return Err(Error::EventExists { fd, event });
        }

        let op = if inner.events.is_empty() {
            libc::EPOLL_CTL_ADD
        } else {
            libc::EPOLL_CTL_MOD
        };
        let mut epevent = libc::epoll_event {
            events: libc::EPOLLET as u32 | inner.events.bits() | event.bits(),
            u64: fd as u64,
        };
        if unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut epevent) } != 0 {
            let err = std::io::Error::last_os_error();
            let events = epevent.events;
            log::error!(
                "epoll_ctl({}, {}, {}, {:#x}) failed: {}",
                self.epfd,
                op,
                fd,
                events,
                err
            );
            return Err(Error::Os(err));
        }

        self.pending_events.fetch_add(1, Ordering::SeqCst);
        inner.events.insert(event);

        let waiter = inner.waiter_mut(event);
        crate::fatal_assert!(
            waiter.is_empty(),
            "waiter slot for {:?} on fd {} still occupied",
            event,
            fd
        );
        waiter.scheduler = Some(scheduler);
        match cb {
            Some(cb) => waiter.cb = Some(cb),
            None => {
                let fiber = Fiber::current();
                crate::fatal_assert!(
                    fiber.state() == FiberState::Exec,
                    "fiber {} registering {:?} on fd {} while not executing",
                    fiber.id(),
                    event,
                    fd
                );
                waiter.fiber = Some(fiber);
            }
        }
        Ok(())
    }

    /// Remove interest without waking the waiter. False if not registered.
    pub(crate) fn del_event(&self, fd: i32, event: Event) -> bool {
        let Some(ctx) = self.lookup(fd) else {
            return false;
        };
        let mut inner = ctx.inner.lock();
        if !inner.events.contains(event) {
            return false;
        }

        let left = inner.events.difference(EventSet(event.bits()));
        if !self.rearm(fd, left) {
            return false;
        }
        inner.events = left;
        inner.waiter_mut(event).clear();
        self.pending_events.fetch_sub(1, Ordering::SeqCst);
        true
    }

    /// Remove interest and wake the waiter as if the event had fired. Used
    /// to unblock a waiter early, e.g. on timeout. False if not registered.
    pub(crate) fn cancel_event(&self, fd: i32, event: Event) -> bool {
        let Some(ctx) = self.lookup(fd) else {
            return false;
        };
        let mut inner = ctx.inner.lock();
        if !inner.events.contains(event) {
            return false;
        }

        let left = inner.events.difference(EventSet(event.bits()));
        if !self.rearm(fd, left) {
            return false;
        }
        inner.trigger(ctx.fd, event);
        self.pending_events.fetch_sub(1, Ordering::SeqCst);
        true
    }

    /// Cancel both interests; used when a descriptor is being closed.
    pub(crate) fn cancel_all(&self, fd: i32) -> bool {
        let Some(ctx) = self.lookup(fd) else {
            return false;
        };
        let mut inner = ctx.inner.lock();
        if inner.events.is_empty() {
            return false;
        }

        if !self.rearm(fd, EventSet::NONE) {
            return false;
        }
        if inner.events.contains(Event::Read) {
            inner.trigger(ctx.fd, Event::Read);
            self.pending_events.fetch_sub(1, Ordering::SeqCst);
        }
        if inner.events.contains(Event::Write) {
            inner.trigger(ctx.fd, Event::Write);
            self.pending_events.fetch_sub(1, Ordering::SeqCst);
        }
        crate::fatal_assert!(
            inner.events.is_empty(),
            "interest left on fd {} after cancel_all",
            fd
        );
        true
    }

    /// Update the epoll registration for `fd` to exactly `interest`.
    fn rearm(&self, fd: i32, interest: EventSet) -> bool {
        let op = if interest.is_empty() {
            libc::EPOLL_CTL_DEL
        } else {
            libc::EPOLL_CTL_MOD
        };
        let mut epevent = libc::epoll_event {
            events: libc::EPOLLET as u32 | interest.bits(),
            u64: fd as u64,
        };
        if unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut epevent) } != 0 {
            let events = epevent.events;
            log::error!(
                "epoll_ctl({}, {}, {}, {:#x}) failed: {}",
                self.epfd,
                op,
                fd,
                events,
                std::io::Error::last_os_error()
            );
            return false;
        }
        true
    }

    pub(crate) fn pending_event_count(&self) -> usize {
        self.pending_events.load(Ordering::SeqCst)
    }

    fn drain_tickle_pipe(&self) {
        let mut buf = [0u8; 256];
        loop {
            let n = unsafe {
                libc::read(
                    self.tickle_fds[0],
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            if n <= 0 {
                break;
            }
        }
    }

    /// Interest set ≡ non-empty waiter slots, for every descriptor.
    #[cfg(test)]
    fn interest_matches_waiters(&self) -> bool {
        let contexts = self.contexts.read();
        contexts.iter().flatten().all(|ctx| {
            let inner = ctx.inner.lock();
            inner.events.contains(Event::Read) == !inner.read.is_empty()
                && inner.events.contains(Event::Write) == !inner.write.is_empty()
        })
    }
}

impl Driver for Poller {
    /// Replaces the scheduler's yield-loop: block in epoll for at most the
    /// next timer deadline (capped), demultiplex readiness to waiters, then
    /// drain expired timers and hand control back to the worker loop.
    fn idle(&self, scheduler: &Arc<Scheduler>) {
        let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS];

        loop {
            if scheduler.stopping() {
                log::info!("reactor {} idle exiting", scheduler.name());
                break;
            }

            let timeout = self
                .timers
                .next_timer()
                .map(|ms| ms.min(MAX_TIMEOUT_MS))
                .unwrap_or(MAX_TIMEOUT_MS) as i32;

            let ready = loop {
                let rc = unsafe {
                    libc::epoll_wait(self.epfd, events.as_mut_ptr(), MAX_EVENTS as i32, timeout)
                };
                if rc < 0 {
                    let err = std::io::Error::last_os_error();
                    if err.raw_os_error() == Some(libc::EINTR) {
                        continue;
                    }
                    log::error!("epoll_wait failed: {}", err);
                    break 0;
                }
                break rc as usize;
            };

            for raw in &events[..ready] {
                if raw.u64 == self.tickle_fds[0] as u64 {
                    self.drain_tickle_pipe();
                    continue;
                }

                let fd = raw.u64 as i32;
                let Some(ctx) = self.lookup(fd) else {
                    continue;
                };
                let mut inner = ctx.inner.lock();

                let mut revents = raw.events;
                if revents & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0 {
                    // Failure must wake both directions, limited to what is
                    // registered, so waiters observe it instead of hanging.
                    revents |= (libc::EPOLLIN | libc::EPOLLOUT) as u32 & inner.events.bits();
                }
                let mut real = EventSet::NONE;
                if revents & libc::EPOLLIN as u32 != 0 {
                    real.insert(Event::Read);
                }
                if revents & libc::EPOLLOUT as u32 != 0 {
                    real.insert(Event::Write);
                }

                if inner.events.intersection(real).is_empty() {
                    continue;
                }

                let left = inner.events.difference(real);
                if !self.rearm(fd, left) {
                    continue;
                }
                if real.contains(Event::Read) {
                    inner.trigger(ctx.fd, Event::Read);
                    self.pending_events.fetch_sub(1, Ordering::SeqCst);
                }
                if real.contains(Event::Write) {
                    inner.trigger(ctx.fd, Event::Write);
                    self.pending_events.fetch_sub(1, Ordering::SeqCst);
                }
            }

            let expired = self.timers.collect_expired();
            if !expired.is_empty() {
                log::debug!(
                    "reactor {} scheduling {} expired timers",
                    scheduler.name(),
                    expired.len()
                );
                for cb in expired {
                    scheduler.schedule(Job::from_fn(move || cb()));
                }
            }

            Fiber::yield_to_hold();
        }
    }

    fn tickle(&self, scheduler: &Arc<Scheduler>) {
        if !scheduler.has_idle_threads() {
            return;
        }
        let n = unsafe {
            libc::write(
                self.tickle_fds[1],
                b"T".as_ptr() as *const libc::c_void,
                1,
            )
        };
        if n != 1 {
            log::warn!(
                "tickle write failed: {}",
                std::io::Error::last_os_error()
            );
        }
    }

    fn stopping(&self, scheduler: &Arc<Scheduler>) -> bool {
        scheduler.base_stopping() && self.pending_events.load(Ordering::SeqCst) == 0
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epfd);
            libc::close(self.tickle_fds[0]);
            libc::close(self.tickle_fds[1]);
        }
    }
}

/// The I/O manager: a scheduler whose idle phase blocks in epoll.
///
/// Construction opens the multiplexer and wake pipe and starts the worker
/// pool immediately; `stop` (or drop) drains it.
pub struct Reactor {
    scheduler: Arc<Scheduler>,
    poller: Arc<Poller>,
}

impl Reactor {
    pub fn new(threads: usize, use_caller: bool, name: &str) -> Arc<Reactor> {
        let poller = Arc::new(Poller::new());
        let scheduler = Scheduler::with_driver(threads, use_caller, name, poller.clone());

        // An insert that becomes the new earliest deadline must cut a poll
        // that is already blocking on the older, later deadline short.
        let weak_poller = Arc::downgrade(&poller);
        let weak_scheduler: Weak<Scheduler> = Arc::downgrade(&scheduler);
        poller.timers.set_front_hook(move || {
            if let (Some(poller), Some(scheduler)) =
                (weak_poller.upgrade(), weak_scheduler.upgrade())
            {
                poller.tickle(&scheduler);
            }
        });

        scheduler.start();
        Arc::new(Reactor { scheduler, poller })
    }

    /// The scheduler capability backing this reactor.
    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// Enqueue work runnable on any worker.
    pub fn schedule(&self, job: impl Into<Job>) {
        self.scheduler.schedule(job);
    }

    /// Enqueue work pinned to a worker thread.
    pub fn schedule_on(&self, job: impl Into<Job>, thread: Option<u64>) {
        self.scheduler.schedule_on(job, thread);
    }

    /// Enqueue a closure runnable on any worker.
    pub fn spawn(&self, f: impl FnOnce() + Send + 'static) {
        self.scheduler.spawn(f);
    }

    /// Register interest in `event` on `fd` with the current fiber as the
    /// waiter; the fiber is resumed when the event fires or is cancelled.
    pub fn add_event(&self, fd: i32, event: Event) -> Result<(), Error> {
        self.poller.add_event(fd, event, None)
    }

    /// Register interest in `event` on `fd` with a callback waiter.
    pub fn add_event_cb(
        &self,
        fd: i32,
        event: Event,
        cb: impl FnOnce() + Send + 'static,
    ) -> Result<(), Error> {
        self.poller.add_event(fd, event, Some(Box::new(cb)))
    }

    /// Remove interest without waking the waiter.
    pub fn del_event(&self, fd: i32, event: Event) -> bool {
        self.poller.del_event(fd, event)
    }

    /// Remove interest and wake the waiter as if the event had fired.
    pub fn cancel_event(&self, fd: i32, event: Event) -> bool {
        self.poller.cancel_event(fd, event)
    }

    /// Cancel both interests on `fd`.
    pub fn cancel_all(&self, fd: i32) -> bool {
        self.poller.cancel_all(fd)
    }

    /// Schedule `cb` after `ms` milliseconds on this reactor.
    pub fn add_timer(
        &self,
        ms: u64,
        cb: impl Fn() + Send + Sync + 'static,
        recurring: bool,
    ) -> Timer {
        self.poller.timers.add_timer(ms, cb, recurring)
    }

    /// Like `add_timer`, skipped at fire time if `cond` is gone.
    pub fn add_conditional_timer<T: Send + Sync + 'static>(
        &self,
        ms: u64,
        cb: impl Fn() + Send + Sync + 'static,
        cond: Weak<T>,
        recurring: bool,
    ) -> Timer {
        self.poller.timers.add_conditional_timer(ms, cb, cond, recurring)
    }

    /// Registered-but-unfired event count.
    pub fn pending_event_count(&self) -> usize {
        self.poller.pending_event_count()
    }

    /// Drain and join the worker pool.
    pub fn stop(&self) {
        self.scheduler.stop();
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        self.scheduler.stop();
    }
}
