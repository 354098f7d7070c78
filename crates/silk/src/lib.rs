//! Silk: a stackful coroutine runtime
//!
//! Cooperative fibers scheduled N:M across a fixed worker-thread pool, an
//! epoll reactor layered on the scheduler's idle phase, cancellable timers,
//! and an opt-in hook layer that turns blocking POSIX I/O calls into
//! suspend/resume points so classic blocking code runs cooperatively.
//!
//! The usual entry point is [`Reactor::new`]: it opens the multiplexer,
//! starts the workers, and accepts fibers or plain callbacks via
//! [`Reactor::spawn`]. Code running on a worker can call the [`hook`]
//! wrappers (`sleep`, `read`, `connect`, ...) and be parked instead of
//! blocking its OS thread.

pub mod config;
pub mod error;
pub mod fd;
pub mod fiber;
pub mod hook;
pub mod reactor;
pub mod scheduler;
pub mod timer;
pub mod util;

pub use config::{Config, ConfigVar};
pub use error::Error;
pub use fd::{FdCtx, FdManager, TimeoutKind};
pub use fiber::{Fiber, FiberState};
pub use reactor::{Event, Reactor};
pub use scheduler::{Driver, Job, Scheduler};
pub use timer::{Timer, TimerManager};
