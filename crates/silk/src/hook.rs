//! Blocking-call translation
//!
//! POSIX-shaped entry points that convert blocking I/O into suspend/resume
//! points on the reactor. Interception is opt-in per thread (scheduler
//! workers enable it); calls pass through untouched when the flag is off,
//! when the descriptor is not a tracked socket, or when the user explicitly
//! asked for non-blocking mode. There is no load-time symbol interposition:
//! callers invoke these wrappers directly, with signatures mirroring libc.
//!
//! The core protocol (`do_io`): try the real call; retry on `EINTR`; on
//! `EAGAIN` arm an optional conditional timeout timer, register interest
//! with the reactor, park the fiber, and on wake either surface `ETIMEDOUT`
//! or retry. The timer and the readiness event race by design; the loser is
//! a no-op guarded by the shared cancellation cell and its weak token.

use crate::config::{Config, ConfigVar};
use crate::fd::{FdManager, TimeoutKind, NO_TIMEOUT};
use crate::fiber::Fiber;
use crate::reactor::{Event, Poller};
use crate::scheduler::{Job, Scheduler};
use libc::{c_int, c_uint, c_ulong, c_void, size_t, socklen_t, ssize_t};
use once_cell::sync::Lazy;
use std::cell::Cell;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;

thread_local! {
    static HOOK_ENABLED: Cell<bool> = const { Cell::new(false) };
}

/// Whether blocking-call translation is active on this thread.
pub fn hook_enabled() -> bool {
    HOOK_ENABLED.with(|f| f.get())
}

/// Enable or disable translation for the calling thread. Scheduler workers
/// enable it on entry.
pub fn set_hook_enabled(enabled: bool) {
    HOOK_ENABLED.with(|f| f.set(enabled));
}

static CONNECT_TIMEOUT_MS: AtomicU64 = AtomicU64::new(5000);

static CONNECT_TIMEOUT_VAR: Lazy<Arc<ConfigVar<u64>>> = Lazy::new(|| {
    let var = Config::lookup::<u64>("tcp.connect.timeout", 5000, "tcp connect timeout in ms")
        .unwrap_or_else(|| crate::fatal!("tcp.connect.timeout registered with a different type"));
    CONNECT_TIMEOUT_MS.store(var.get(), Ordering::Release);
    var.add_listener(|old, new| {
        log::info!("tcp.connect.timeout changed from {} to {}", old, new);
        CONNECT_TIMEOUT_MS.store(*new, Ordering::Release);
    });
    var
});

/// The live-updatable `tcp.connect.timeout` variable used by [`connect`].
pub fn connect_timeout_var() -> Arc<ConfigVar<u64>> {
    CONNECT_TIMEOUT_VAR.clone()
}

fn connect_timeout_ms() -> u64 {
    Lazy::force(&CONNECT_TIMEOUT_VAR);
    CONNECT_TIMEOUT_MS.load(Ordering::Acquire)
}

fn errno() -> c_int {
    unsafe { *libc::__errno_location() }
}

fn set_errno(v: c_int) {
    unsafe { *libc::__errno_location() = v };
}

/// Shared between a parked I/O call and its timeout timer. Non-zero means
/// the timer fired first and holds the errno to surface.
#[derive(Default)]
struct TimerInfo {
    cancelled: AtomicI32,
}

/// Generic blocking-I/O translation.
///
/// `real` performs the underlying call; `event` is the readiness direction
/// to wait for and `timeout_kind` selects which configured fd timeout
/// bounds the wait.
fn do_io(
    fd: c_int,
    name: &str,
    event: Event,
    timeout_kind: TimeoutKind,
    real: impl Fn() -> ssize_t,
) -> ssize_t {
    if !hook_enabled() {
        return real();
    }
    let Some(ctx) = FdManager::instance().get(fd, false) else {
        return real();
    };
    if ctx.is_closed() {
        set_errno(libc::EBADF);
        return -1;
    }
    if !ctx.is_socket() || ctx.user_nonblock() {
        return real();
    }

    let timeout = ctx.timeout(timeout_kind);

    loop {
        let mut n = real();
        while n == -1 && errno() == libc::EINTR {
            n = real();
        }
        if !(n == -1 && errno() == libc::EAGAIN) {
            return n;
        }

        // Would block: park until readiness or timeout. The EAGAIN is
        // consumed here, never surfaced to the caller.
        set_errno(0);
        let Some(poller) = Poller::current() else {
            // No reactor on this thread to park on.
            set_errno(libc::EAGAIN);
            return -1;
        };

        let tinfo = Arc::new(TimerInfo::default());
        let timer = if timeout != NO_TIMEOUT {
            let winfo = Arc::downgrade(&tinfo);
            let poller2 = poller.clone();
            Some(poller.timers.add_conditional_timer(
                timeout,
                move || {
                    let Some(t) = winfo.upgrade() else {
                        return;
                    };
                    if t.cancelled.load(Ordering::Acquire) != 0 {
                        return;
                    }
                    t.cancelled.store(libc::ETIMEDOUT, Ordering::Release);
                    poller2.cancel_event(fd, event);
                },
                Arc::downgrade(&tinfo),
                false,
            ))
        } else {
            None
        };

        match poller.add_event(fd, event, None) {
            Err(e) => {
                log::error!("{}: add_event({}, {:?}) failed: {}", name, fd, event, e);
                if let Some(timer) = &timer {
                    timer.cancel();
                }
                return -1;
            }
            Ok(()) => {
                Fiber::yield_to_hold();
                if let Some(timer) = &timer {
                    timer.cancel();
                }
                let cancelled = tinfo.cancelled.load(Ordering::Acquire);
                if cancelled != 0 {
                    set_errno(cancelled);
                    return -1;
                }
                // Readiness won the race: retry the real call.
            }
        }
    }
}

/// Park the current fiber for `ms` milliseconds without blocking the
/// OS thread. Returns false if no reactor serves this thread.
fn park_current_fiber(ms: u64) -> bool {
    let Some(poller) = Poller::current() else {
        return false;
    };
    let Some(scheduler) = Scheduler::current() else {
        return false;
    };
    let fiber = Fiber::current();
    poller.timers.add_timer(
        ms,
        move || {
            scheduler.schedule(Job::Fiber(fiber.clone()));
        },
        false,
    );
    Fiber::yield_to_hold();
    true
}

/// Hooked `sleep`: a timer re-enqueues this fiber, the OS thread keeps
/// running other work.
pub fn sleep(seconds: c_uint) -> c_uint {
    if !hook_enabled() {
        return unsafe { libc::sleep(seconds) };
    }
    if !park_current_fiber(seconds as u64 * 1000) {
        return unsafe { libc::sleep(seconds) };
    }
    0
}

/// Hooked `usleep`.
pub fn usleep(usec: libc::useconds_t) -> c_int {
    if !hook_enabled() {
        return unsafe { libc::usleep(usec) };
    }
    if !park_current_fiber(usec as u64 / 1000) {
        return unsafe { libc::usleep(usec) };
    }
    0
}

/// Hooked `nanosleep`.
///
/// # Safety
/// `req` must point to a valid `timespec`; `rem` may be null or valid.
pub unsafe fn nanosleep(req: *const libc::timespec, rem: *mut libc::timespec) -> c_int {
    if !hook_enabled() {
        return libc::nanosleep(req, rem);
    }
    if req.is_null() {
        set_errno(libc::EINVAL);
        return -1;
    }
    let ms = ((*req).tv_sec.max(0) as u64) * 1000 + ((*req).tv_nsec.max(0) as u64) / 1_000_000;
    if !park_current_fiber(ms) {
        return libc::nanosleep(req, rem);
    }
    0
}

/// Hooked `socket`: registers metadata for the new descriptor.
pub fn socket(domain: c_int, ty: c_int, protocol: c_int) -> c_int {
    if !hook_enabled() {
        return unsafe { libc::socket(domain, ty, protocol) };
    }
    let fd = unsafe { libc::socket(domain, ty, protocol) };
    if fd == -1 {
        return fd;
    }
    FdManager::instance().get(fd, true);
    fd
}

/// Hooked `connect` with an explicit timeout in milliseconds
/// ([`NO_TIMEOUT`] disables the timer).
///
/// Issues a non-blocking connect; `EINPROGRESS` parks the fiber on WRITE
/// readiness, then the outcome is confirmed through `SO_ERROR`.
///
/// # Safety
/// `addr` must point to a valid socket address of length `addrlen`.
pub unsafe fn connect_with_timeout(
    sockfd: c_int,
    addr: *const libc::sockaddr,
    addrlen: socklen_t,
    timeout_ms: u64,
) -> c_int {
    if !hook_enabled() {
        return libc::connect(sockfd, addr, addrlen);
    }
    let Some(ctx) = FdManager::instance().get(sockfd, false) else {
        set_errno(libc::EBADF);
        return -1;
    };
    if ctx.is_closed() {
        set_errno(libc::EBADF);
        return -1;
    }
    if !ctx.is_socket() || ctx.user_nonblock() {
        return libc::connect(sockfd, addr, addrlen);
    }

    let n = libc::connect(sockfd, addr, addrlen);
    if n == 0 {
        return 0;
    }
    if n != -1 || errno() != libc::EINPROGRESS {
        return n;
    }

    let Some(poller) = Poller::current() else {
        // No reactor; the caller sees the in-progress connect as-is.
        return n;
    };

    let tinfo = Arc::new(TimerInfo::default());
    let timer = if timeout_ms != NO_TIMEOUT {
        let winfo = Arc::downgrade(&tinfo);
        let poller2 = poller.clone();
        Some(poller.timers.add_conditional_timer(
            timeout_ms,
            move || {
                let Some(t) = winfo.upgrade() else {
                    return;
                };
                if t.cancelled.load(Ordering::Acquire) != 0 {
                    return;
                }
                t.cancelled.store(libc::ETIMEDOUT, Ordering::Release);
                poller2.cancel_event(sockfd, Event::Write);
            },
            Arc::downgrade(&tinfo),
            false,
        ))
    } else {
        None
    };

    match poller.add_event(sockfd, Event::Write, None) {
        Ok(()) => {
            Fiber::yield_to_hold();
            if let Some(timer) = &timer {
                timer.cancel();
            }
            let cancelled = tinfo.cancelled.load(Ordering::Acquire);
            if cancelled != 0 {
                set_errno(cancelled);
                return -1;
            }
        }
        Err(e) => {
            if let Some(timer) = &timer {
                timer.cancel();
            }
            log::error!("connect: add_event({}, Write) failed: {}", sockfd, e);
        }
    }

    let mut error: c_int = 0;
    let mut len = std::mem::size_of::<c_int>() as socklen_t;
    if libc::getsockopt(
        sockfd,
        libc::SOL_SOCKET,
        libc::SO_ERROR,
        &mut error as *mut c_int as *mut c_void,
        &mut len,
    ) == -1
    {
        return -1;
    }
    if error == 0 {
        0
    } else {
        set_errno(error);
        -1
    }
}

/// Hooked `connect`, bounded by the dynamic `tcp.connect.timeout` default.
///
/// # Safety
/// `addr` must point to a valid socket address of length `addrlen`.
pub unsafe fn connect(sockfd: c_int, addr: *const libc::sockaddr, addrlen: socklen_t) -> c_int {
    connect_with_timeout(sockfd, addr, addrlen, connect_timeout_ms())
}

/// Hooked `accept`: registers metadata for the accepted descriptor.
///
/// # Safety
/// `addr`/`addrlen` must be null or valid out-parameters.
pub unsafe fn accept(s: c_int, addr: *mut libc::sockaddr, addrlen: *mut socklen_t) -> c_int {
    let fd = do_io(s, "accept", Event::Read, TimeoutKind::Recv, move || unsafe {
        libc::accept(s, addr, addrlen) as ssize_t
    }) as c_int;
    if fd >= 0 {
        FdManager::instance().get(fd, true);
    }
    fd
}

/// Hooked `read`.
///
/// # Safety
/// `buf` must be valid for writes of `count` bytes.
pub unsafe fn read(fd: c_int, buf: *mut c_void, count: size_t) -> ssize_t {
    do_io(fd, "read", Event::Read, TimeoutKind::Recv, move || unsafe {
        libc::read(fd, buf, count)
    })
}

/// Hooked `readv`.
///
/// # Safety
/// `iov` must point to `iovcnt` valid iovecs.
pub unsafe fn readv(fd: c_int, iov: *const libc::iovec, iovcnt: c_int) -> ssize_t {
    do_io(fd, "readv", Event::Read, TimeoutKind::Recv, move || unsafe {
        libc::readv(fd, iov, iovcnt)
    })
}

/// Hooked `recv`.
///
/// # Safety
/// `buf` must be valid for writes of `len` bytes.
pub unsafe fn recv(sockfd: c_int, buf: *mut c_void, len: size_t, flags: c_int) -> ssize_t {
    do_io(sockfd, "recv", Event::Read, TimeoutKind::Recv, move || unsafe {
        libc::recv(sockfd, buf, len, flags)
    })
}

/// Hooked `recvfrom`.
///
/// # Safety
/// `buf` must be valid for writes of `len` bytes; `src_addr`/`addrlen` must
/// be null or valid out-parameters.
pub unsafe fn recvfrom(
    sockfd: c_int,
    buf: *mut c_void,
    len: size_t,
    flags: c_int,
    src_addr: *mut libc::sockaddr,
    addrlen: *mut socklen_t,
) -> ssize_t {
    do_io(sockfd, "recvfrom", Event::Read, TimeoutKind::Recv, move || unsafe {
        libc::recvfrom(sockfd, buf, len, flags, src_addr, addrlen)
    })
}

/// Hooked `recvmsg`.
///
/// # Safety
/// `msg` must point to a valid `msghdr`.
pub unsafe fn recvmsg(sockfd: c_int, msg: *mut libc::msghdr, flags: c_int) -> ssize_t {
    do_io(sockfd, "recvmsg", Event::Read, TimeoutKind::Recv, move || unsafe {
        libc::recvmsg(sockfd, msg, flags)
    })
}

/// Hooked `write`.
///
/// # Safety
/// `buf` must be valid for reads of `count` bytes.
pub unsafe fn write(fd: c_int, buf: *const c_void, count: size_t) -> ssize_t {
    do_io(fd, "write", Event::Write, TimeoutKind::Send, move || unsafe {
        libc::write(fd, buf, count)
    })
}

/// Hooked `writev`.
///
/// # Safety
/// `iov` must point to `iovcnt` valid iovecs.
pub unsafe fn writev(fd: c_int, iov: *const libc::iovec, iovcnt: c_int) -> ssize_t {
    do_io(fd, "writev", Event::Write, TimeoutKind::Send, move || unsafe {
        libc::writev(fd, iov, iovcnt)
    })
}

/// Hooked `send`.
///
/// # Safety
/// `buf` must be valid for reads of `len` bytes.
pub unsafe fn send(sockfd: c_int, buf: *const c_void, len: size_t, flags: c_int) -> ssize_t {
    do_io(sockfd, "send", Event::Write, TimeoutKind::Send, move || unsafe {
        libc::send(sockfd, buf, len, flags)
    })
}

/// Hooked `sendto`.
///
/// # Safety
/// `buf` must be valid for reads of `len` bytes; `dest_addr` must point to
/// a valid address of length `addrlen`.
pub unsafe fn sendto(
    sockfd: c_int,
    buf: *const c_void,
    len: size_t,
    flags: c_int,
    dest_addr: *const libc::sockaddr,
    addrlen: socklen_t,
) -> ssize_t {
    do_io(sockfd, "sendto", Event::Write, TimeoutKind::Send, move || unsafe {
        libc::sendto(sockfd, buf, len, flags, dest_addr, addrlen)
    })
}

/// Hooked `sendmsg`.
///
/// # Safety
/// `msg` must point to a valid `msghdr`.
pub unsafe fn sendmsg(sockfd: c_int, msg: *const libc::msghdr, flags: c_int) -> ssize_t {
    do_io(sockfd, "sendmsg", Event::Write, TimeoutKind::Send, move || unsafe {
        libc::sendmsg(sockfd, msg, flags)
    })
}

/// Hooked `close`: cancels pending events and drops metadata before the
/// real close.
pub fn close(fd: c_int) -> c_int {
    if !hook_enabled() {
        return unsafe { libc::close(fd) };
    }
    if FdManager::instance().get(fd, false).is_some() {
        if let Some(poller) = Poller::current() {
            poller.cancel_all(fd);
        }
        FdManager::instance().del(fd);
    }
    unsafe { libc::close(fd) }
}

/// Hooked `fcntl` over a single explicit argument (Rust has no C varargs);
/// `arg` is reinterpreted per command. `F_SETFL`/`F_GETFL` preserve the
/// forced non-blocking invariant on tracked sockets while honoring the
/// user's intent.
///
/// # Safety
/// For lock commands `arg` must be a valid `*mut libc::flock` cast to
/// `usize`.
pub unsafe fn fcntl(fd: c_int, cmd: c_int, arg: usize) -> c_int {
    match cmd {
        libc::F_SETFL => {
            let mut flags = arg as c_int;
            match FdManager::instance().get(fd, false) {
                Some(ctx) if !ctx.is_closed() && ctx.is_socket() => {
                    ctx.set_user_nonblock(flags & libc::O_NONBLOCK != 0);
                    if ctx.sys_nonblock() {
                        flags |= libc::O_NONBLOCK;
                    } else {
                        flags &= !libc::O_NONBLOCK;
                    }
                    libc::fcntl(fd, cmd, flags)
                }
                _ => libc::fcntl(fd, cmd, flags),
            }
        }
        libc::F_GETFL => {
            let flags = libc::fcntl(fd, cmd);
            if flags == -1 {
                return flags;
            }
            match FdManager::instance().get(fd, false) {
                Some(ctx) if !ctx.is_closed() && ctx.is_socket() => {
                    // Report what the user asked for, not the forced mode.
                    if ctx.user_nonblock() {
                        flags | libc::O_NONBLOCK
                    } else {
                        flags & !libc::O_NONBLOCK
                    }
                }
                _ => flags,
            }
        }
        libc::F_GETFD | libc::F_GETOWN => libc::fcntl(fd, cmd),
        libc::F_SETLK | libc::F_SETLKW | libc::F_GETLK => {
            libc::fcntl(fd, cmd, arg as *mut libc::flock)
        }
        _ => libc::fcntl(fd, cmd, arg as c_int),
    }
}

/// Hooked `ioctl`: intercepts `FIONBIO` to track user non-blocking intent.
///
/// # Safety
/// `arg` must be valid for the request.
pub unsafe fn ioctl(fd: c_int, request: c_ulong, arg: *mut c_void) -> c_int {
    if request == libc::FIONBIO as c_ulong {
        let user_nonblock = *(arg as *const c_int) != 0;
        if let Some(ctx) = FdManager::instance().get(fd, false) {
            if !ctx.is_closed() && ctx.is_socket() {
                ctx.set_user_nonblock(user_nonblock);
            }
        }
    }
    libc::ioctl(fd, request, arg)
}

/// Hooked `getsockopt` (pass-through).
///
/// # Safety
/// `optval`/`optlen` must be valid out-parameters.
pub unsafe fn getsockopt(
    sockfd: c_int,
    level: c_int,
    optname: c_int,
    optval: *mut c_void,
    optlen: *mut socklen_t,
) -> c_int {
    libc::getsockopt(sockfd, level, optname, optval, optlen)
}

/// Hooked `setsockopt`: mirrors `SO_RCVTIMEO`/`SO_SNDTIMEO` into the fd
/// metadata consulted by [`do_io`].
///
/// # Safety
/// `optval` must be valid for reads of `optlen` bytes.
pub unsafe fn setsockopt(
    sockfd: c_int,
    level: c_int,
    optname: c_int,
    optval: *const c_void,
    optlen: socklen_t,
) -> c_int {
    if hook_enabled()
        && level == libc::SOL_SOCKET
        && (optname == libc::SO_RCVTIMEO || optname == libc::SO_SNDTIMEO)
        && !optval.is_null()
    {
        if let Some(ctx) = FdManager::instance().get(sockfd, false) {
            let tv = &*(optval as *const libc::timeval);
            let ms = tv.tv_sec.max(0) as u64 * 1000 + tv.tv_usec.max(0) as u64 / 1000;
            let kind = if optname == libc::SO_RCVTIMEO {
                TimeoutKind::Recv
            } else {
                TimeoutKind::Send
            };
            ctx.set_timeout(kind, ms);
        }
    }
    libc::setsockopt(sockfd, level, optname, optval, optlen)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_hook_is_pure_passthrough() {
        std::thread::spawn(|| {
            assert!(!hook_enabled());
            let fd = socket(libc::AF_INET, libc::SOCK_DGRAM, 0);
            assert!(fd >= 0);
            // No metadata is registered while the hook is off.
            assert!(FdManager::instance().get(fd, false).is_none());
            assert_eq!(close(fd), 0);
        })
        .join()
        .expect("thread join failed");
    }

    #[test]
    fn test_enabled_socket_registers_metadata() {
        std::thread::spawn(|| {
            set_hook_enabled(true);
            let fd = socket(libc::AF_INET, libc::SOCK_DGRAM, 0);
            assert!(fd >= 0);

            let ctx = FdManager::instance().get(fd, false).expect("metadata");
            assert!(ctx.is_socket());
            assert!(ctx.sys_nonblock());

            assert_eq!(close(fd), 0);
            assert!(FdManager::instance().get(fd, false).is_none());
        })
        .join()
        .expect("thread join failed");
    }

    #[test]
    fn test_setsockopt_mirrors_timeouts() {
        std::thread::spawn(|| {
            set_hook_enabled(true);
            let fd = socket(libc::AF_INET, libc::SOCK_DGRAM, 0);
            assert!(fd >= 0);

            let tv = libc::timeval {
                tv_sec: 1,
                tv_usec: 500_000,
            };
            let rc = unsafe {
                setsockopt(
                    fd,
                    libc::SOL_SOCKET,
                    libc::SO_RCVTIMEO,
                    &tv as *const libc::timeval as *const c_void,
                    std::mem::size_of::<libc::timeval>() as socklen_t,
                )
            };
            assert_eq!(rc, 0);

            let ctx = FdManager::instance().get(fd, false).expect("metadata");
            assert_eq!(ctx.timeout(TimeoutKind::Recv), 1500);
            assert_eq!(ctx.timeout(TimeoutKind::Send), crate::fd::NO_TIMEOUT);

            assert_eq!(close(fd), 0);
        })
        .join()
        .expect("thread join failed");
    }

    #[test]
    fn test_fcntl_preserves_forced_nonblocking() {
        std::thread::spawn(|| {
            set_hook_enabled(true);
            let fd = socket(libc::AF_INET, libc::SOCK_STREAM, 0);
            assert!(fd >= 0);

            // The user asks for blocking mode; the socket must stay
            // non-blocking at the OS level, but report blocking back.
            let rc = unsafe { fcntl(fd, libc::F_SETFL, 0) };
            assert_eq!(rc, 0);

            let real_flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
            assert!(real_flags & libc::O_NONBLOCK != 0);

            let reported = unsafe { fcntl(fd, libc::F_GETFL, 0) };
            assert_eq!(reported & libc::O_NONBLOCK, 0);

            // Now the user asks for non-blocking: reported flags follow.
            let rc = unsafe { fcntl(fd, libc::F_SETFL, libc::O_NONBLOCK as usize) };
            assert_eq!(rc, 0);
            let reported = unsafe { fcntl(fd, libc::F_GETFL, 0) };
            assert!(reported & libc::O_NONBLOCK != 0);

            assert_eq!(close(fd), 0);
        })
        .join()
        .expect("thread join failed");
    }

    #[test]
    fn test_ioctl_fionbio_tracks_user_intent() {
        std::thread::spawn(|| {
            set_hook_enabled(true);
            let fd = socket(libc::AF_INET, libc::SOCK_DGRAM, 0);
            assert!(fd >= 0);

            let mut on: c_int = 1;
            let rc = unsafe { ioctl(fd, libc::FIONBIO as c_ulong, &mut on as *mut c_int as *mut c_void) };
            assert_eq!(rc, 0);

            let ctx = FdManager::instance().get(fd, false).expect("metadata");
            assert!(ctx.user_nonblock());

            assert_eq!(close(fd), 0);
        })
        .join()
        .expect("thread join failed");
    }
}
