//! Stackful fibers
//!
//! A fiber is a cooperatively-scheduled unit of execution with its own heap
//! allocated stack and a saved `ucontext_t`. Switching is a plain synchronous
//! call: `resume` saves the caller's continuation and activates the target,
//! `yield_to_hold`/`yield_to_ready` hand control back. Each OS thread has a
//! stackless "main" fiber that is the thread itself, created lazily the first
//! time the current fiber is queried on that thread.

use crate::config::{Config, ConfigVar};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::alloc::{self, Layout};
use std::any::Any;
use std::cell::{RefCell, UnsafeCell};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

/// Monotonic fiber id counter; the main fiber of each thread keeps id 0.
static NEXT_FIBER_ID: AtomicU64 = AtomicU64::new(0);

/// Live fiber count across all threads.
static FIBER_COUNT: AtomicU64 = AtomicU64::new(0);

static STACK_SIZE: Lazy<Arc<ConfigVar<u32>>> = Lazy::new(|| {
    Config::lookup::<u32>("fiber.stack_size", 1024 * 1024, "fiber stack size")
        .unwrap_or_else(|| crate::fatal!("fiber.stack_size registered with a different type"))
});

thread_local! {
    /// The fiber currently executing on this thread.
    static CURRENT: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };
    /// The stackless fiber representing the thread itself.
    static THREAD_MAIN: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };
}

/// Execution state of a fiber.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum FiberState {
    /// Constructed or reset, not yet run
    Init,
    /// Yielded, waiting to be re-enqueued externally
    Hold,
    /// Currently executing
    Exec,
    /// Closure returned normally
    Term,
    /// Yielded, wants to run again immediately
    Ready,
    /// Closure panicked; captured at the trampoline boundary
    Except,
}

impl FiberState {
    fn from_u8(v: u8) -> FiberState {
        match v {
            0 => FiberState::Init,
            1 => FiberState::Hold,
            2 => FiberState::Exec,
            3 => FiberState::Term,
            4 => FiberState::Ready,
            5 => FiberState::Except,
            _ => crate::fatal!("invalid fiber state {}", v),
        }
    }
}

/// Heap allocation backing a fiber stack.
struct StackBuffer {
    ptr: *mut u8,
    size: usize,
}

impl StackBuffer {
    fn alloc(size: usize) -> StackBuffer {
        let layout = match Layout::from_size_align(size, 16) {
            Ok(l) => l,
            Err(e) => crate::fatal!("invalid stack layout for size {}: {}", size, e),
        };
        let ptr = unsafe { alloc::alloc(layout) };
        if ptr.is_null() {
            crate::fatal!("fiber stack allocation of {} bytes failed", size);
        }
        StackBuffer { ptr, size }
    }
}

impl Drop for StackBuffer {
    fn drop(&mut self) {
        // Layout was validated in alloc().
        unsafe {
            alloc::dealloc(self.ptr, Layout::from_size_align_unchecked(self.size, 16));
        }
    }
}

/// A stackful coroutine.
///
/// Ownership discipline: a fiber is exclusively owned by whichever scheduler
/// slot or thread-local current pointer holds it at any instant, and is never
/// resumed by two threads concurrently. Stacks are never shared.
pub struct Fiber {
    /// Unique id; 0 for thread main fibers
    id: u64,

    /// Stack size in bytes; 0 for thread main fibers
    stack_size: usize,

    /// Current state (`FiberState` as u8)
    state: AtomicU8,

    /// Saved execution context
    ctx: UnsafeCell<libc::ucontext_t>,

    /// True from the moment a switch away from this fiber begins until the
    /// thread it switched to regains control. A waiter can re-enqueue the
    /// fiber the instant its state leaves `Exec`, which may be before the
    /// context save has completed on the old thread; `resume` spins on this
    /// flag so it never activates a half-saved context.
    switching: AtomicBool,

    /// Owned stack; `None` for thread main fibers (they run on the OS stack)
    stack: Option<StackBuffer>,

    /// Work closure, taken by the trampoline on first activation
    cb: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

// Safety: the context and stack are only touched by the thread that holds the
// fiber in its current pointer or is performing the resume, and the exclusive
// ownership discipline above guarantees that is one thread at a time. The
// `resume`-while-`Exec` check enforces the discipline at runtime.
unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

impl Fiber {
    /// Create a fiber running `cb` on a fresh stack.
    ///
    /// `stack_size == 0` selects the `fiber.stack_size` config default.
    pub fn new(cb: impl FnOnce() + Send + 'static, stack_size: usize) -> Arc<Fiber> {
        let id = NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed) + 1;
        let size = if stack_size != 0 {
            stack_size
        } else {
            STACK_SIZE.get() as usize
        };

        let fiber = Arc::new(Fiber {
            id,
            stack_size: size,
            state: AtomicU8::new(FiberState::Init as u8),
            ctx: UnsafeCell::new(unsafe { std::mem::zeroed() }),
            switching: AtomicBool::new(false),
            stack: Some(StackBuffer::alloc(size)),
            cb: Mutex::new(Some(Box::new(cb))),
        });
        FIBER_COUNT.fetch_add(1, Ordering::Relaxed);

        unsafe { fiber.make_context() };
        log::debug!("fiber {} created, stack {} bytes", id, size);
        fiber
    }

    /// The stackless main fiber for the calling thread.
    fn new_main() -> Arc<Fiber> {
        let fiber = Arc::new(Fiber {
            id: 0,
            stack_size: 0,
            state: AtomicU8::new(FiberState::Exec as u8),
            ctx: UnsafeCell::new(unsafe { std::mem::zeroed() }),
            switching: AtomicBool::new(false),
            stack: None,
            cb: Mutex::new(None),
        });
        FIBER_COUNT.fetch_add(1, Ordering::Relaxed);

        let rc = unsafe { libc::getcontext(fiber.ctx.get()) };
        crate::fatal_assert!(rc == 0, "getcontext failed for thread main fiber");
        fiber
    }

    /// Point the saved context at the trampoline over this fiber's stack.
    ///
    /// Safety: must not be called while the fiber is executing.
    unsafe fn make_context(&self) {
        let ctx = self.ctx.get();
        crate::fatal_assert!(
            libc::getcontext(ctx) == 0,
            "getcontext failed for fiber {}",
            self.id
        );

        let stack = match self.stack.as_ref() {
            Some(s) => s,
            None => crate::fatal!("make_context on the thread main fiber"),
        };
        // The trampoline never returns (it swaps out and aborts if control
        // comes back), so no successor context is linked.
        (*ctx).uc_link = std::ptr::null_mut();
        (*ctx).uc_stack.ss_sp = stack.ptr as *mut libc::c_void;
        (*ctx).uc_stack.ss_size = stack.size;
        libc::makecontext(ctx, fiber_entry, 0);
    }

    /// Fiber id (0 for a thread main fiber).
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Stack size in bytes.
    pub fn stack_size(&self) -> usize {
        self.stack_size
    }

    /// Current state.
    pub fn state(&self) -> FiberState {
        FiberState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: FiberState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Bottom of the owned stack allocation, for allocation-reuse checks.
    pub(crate) fn stack_bottom(&self) -> *const u8 {
        self.stack.as_ref().map(|s| s.ptr as *const u8).unwrap_or(std::ptr::null())
    }

    /// Re-arm a finished fiber with a new closure, reusing its stack.
    ///
    /// Only legal from `Term`, `Init` or `Except`; fatal otherwise.
    pub fn reset(&self, cb: impl FnOnce() + Send + 'static) {
        crate::fatal_assert!(self.stack.is_some(), "reset on the thread main fiber");
        let state = self.state();
        crate::fatal_assert!(
            matches!(state, FiberState::Term | FiberState::Init | FiberState::Except),
            "reset on fiber {} in state {:?}",
            self.id,
            state
        );
        while self.switching.load(Ordering::Acquire) {
            std::hint::spin_loop();
        }
        *self.cb.lock() = Some(Box::new(cb));
        unsafe { self.make_context() };
        self.set_state(FiberState::Init);
    }

    /// Activate this fiber, saving the caller's continuation.
    ///
    /// Control returns here when the fiber yields or finishes. Fatal if the
    /// fiber is already executing.
    pub fn resume(self: &Arc<Self>) {
        let state = self.state();
        crate::fatal_assert!(
            state != FiberState::Exec,
            "fiber {} resumed while already executing",
            self.id
        );
        while self.switching.load(Ordering::Acquire) {
            std::hint::spin_loop();
        }
        let partner = self.swap_partner();
        Fiber::set_current(self);
        self.set_state(FiberState::Exec);
        unsafe { swap_context(partner.ctx.get(), self.ctx.get()) };
        // The target has switched away again (or finished); its context
        // save is complete, so it may be activated elsewhere.
        self.switching.store(false, Ordering::Release);
    }

    /// Transfer control back to the swap partner without touching state.
    fn swap_out(&self) {
        let partner = self.swap_partner();
        Fiber::set_current(&partner);
        self.switching.store(true, Ordering::Release);
        unsafe { swap_context(self.ctx.get(), partner.ctx.get()) };
    }

    /// Publish `state` and switch away. The switching flag goes up before
    /// the state store: the moment the state leaves `Exec` a waiter may
    /// re-enqueue the fiber, and any resume must wait for the save.
    fn suspend_with(&self, state: FiberState) {
        self.switching.store(true, Ordering::Release);
        self.set_state(state);
        self.swap_out();
    }

    /// The context this fiber exchanges control with on this thread: the
    /// scheduler's per-thread main fiber when one is installed (and is not
    /// this fiber itself), otherwise the thread main fiber.
    fn swap_partner(&self) -> Arc<Fiber> {
        match crate::scheduler::Scheduler::main_fiber() {
            Some(main) if !std::ptr::eq(Arc::as_ptr(&main), self as *const Fiber) => main,
            _ => Fiber::thread_main(),
        }
    }

    /// Yield the current fiber and mark it ready to run again.
    pub fn yield_to_ready() {
        Fiber::current().suspend_with(FiberState::Ready);
    }

    /// Yield the current fiber; something else re-enqueues it later.
    pub fn yield_to_hold() {
        Fiber::current().suspend_with(FiberState::Hold);
    }

    /// The fiber currently executing on this thread, materializing the
    /// thread main fiber on first use.
    pub fn current() -> Arc<Fiber> {
        if let Some(f) = CURRENT.with(|c| c.borrow().clone()) {
            return f;
        }
        let main = Fiber::new_main();
        CURRENT.with(|c| *c.borrow_mut() = Some(main.clone()));
        THREAD_MAIN.with(|c| *c.borrow_mut() = Some(main.clone()));
        main
    }

    pub(crate) fn set_current(fiber: &Arc<Fiber>) {
        CURRENT.with(|c| *c.borrow_mut() = Some(fiber.clone()));
    }

    /// Id of the current fiber, 0 if none has run on this thread.
    pub fn current_id() -> u64 {
        CURRENT.with(|c| c.borrow().as_ref().map(|f| f.id).unwrap_or(0))
    }

    /// Live fibers across all threads.
    pub fn count() -> u64 {
        FIBER_COUNT.load(Ordering::Relaxed)
    }

    fn thread_main() -> Arc<Fiber> {
        if let Some(f) = THREAD_MAIN.with(|c| c.borrow().clone()) {
            return f;
        }
        Fiber::current();
        THREAD_MAIN
            .with(|c| c.borrow().clone())
            .unwrap_or_else(|| crate::fatal!("thread main fiber missing after init"))
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        FIBER_COUNT.fetch_sub(1, Ordering::Relaxed);
        if self.stack.is_some() {
            let state = self.state();
            if !matches!(
                state,
                FiberState::Term | FiberState::Init | FiberState::Except
            ) {
                log::error!("fiber {} dropped in state {:?}", self.id, state);
            }
        }
    }
}

unsafe fn swap_context(save: *mut libc::ucontext_t, activate: *mut libc::ucontext_t) {
    if libc::swapcontext(save, activate) != 0 {
        crate::fatal!("swapcontext failed: {}", std::io::Error::last_os_error());
    }
}

/// First frame of every fiber: run the closure, record the outcome, yield
/// for the last time. Control re-entering afterwards is a contract breach.
extern "C" fn fiber_entry() {
    let cur = Fiber::current();
    let cb = cur.cb.lock().take();
    let final_state = match cb {
        Some(cb) => match catch_unwind(AssertUnwindSafe(cb)) {
            Ok(()) => FiberState::Term,
            Err(payload) => {
                log::error!(
                    "fiber {} panicked: {}",
                    cur.id(),
                    panic_message(payload.as_ref())
                );
                FiberState::Except
            }
        },
        None => FiberState::Term,
    };

    // Drop our strong reference before the final switch; the resumer still
    // holds one, which keeps the stack alive through the swap.
    let raw = Arc::as_ptr(&cur);
    drop(cur);
    unsafe { (*raw).suspend_with(final_state) };

    crate::fatal!("control returned to a finished fiber");
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        *s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}
