//! Per-descriptor metadata
//!
//! The hook layer consults this store to decide whether a descriptor is a
//! socket it manages, whether the user asked for non-blocking mode, and what
//! receive/send timeouts apply. Sockets are forced into non-blocking mode at
//! the system level the first time they are seen; the user-visible blocking
//! semantics are reconstructed by the hook layer's suspend/retry protocol.

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Sentinel for "no timeout configured".
pub const NO_TIMEOUT: u64 = u64::MAX;

/// Which configured timeout applies to an operation.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TimeoutKind {
    /// Receive-side operations (`SO_RCVTIMEO`)
    Recv,
    /// Send-side operations (`SO_SNDTIMEO`)
    Send,
}

/// Tracked state of one file descriptor.
pub struct FdCtx {
    fd: i32,
    is_socket: bool,
    is_closed: AtomicBool,
    /// Non-blocking at the OS level (forced on sockets we manage)
    sys_nonblock: AtomicBool,
    /// Non-blocking as requested by the user
    user_nonblock: AtomicBool,
    recv_timeout_ms: AtomicU64,
    send_timeout_ms: AtomicU64,
}

impl FdCtx {
    fn new(fd: i32) -> FdCtx {
        let mut is_socket = false;
        let mut sys_nonblock = false;

        let mut stat: libc::stat = unsafe { std::mem::zeroed() };
        if unsafe { libc::fstat(fd, &mut stat) } == 0 {
            is_socket = (stat.st_mode & libc::S_IFMT) == libc::S_IFSOCK;
        }

        if is_socket {
            // Managed sockets always run non-blocking at the OS level.
            let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
            if flags >= 0 && (flags & libc::O_NONBLOCK) == 0 {
                unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
            }
            sys_nonblock = true;
        }

        FdCtx {
            fd,
            is_socket,
            is_closed: AtomicBool::new(false),
            sys_nonblock: AtomicBool::new(sys_nonblock),
            user_nonblock: AtomicBool::new(false),
            recv_timeout_ms: AtomicU64::new(NO_TIMEOUT),
            send_timeout_ms: AtomicU64::new(NO_TIMEOUT),
        }
    }

    pub fn fd(&self) -> i32 {
        self.fd
    }

    pub fn is_socket(&self) -> bool {
        self.is_socket
    }

    pub fn is_closed(&self) -> bool {
        self.is_closed.load(Ordering::Acquire)
    }

    pub fn set_closed(&self) {
        self.is_closed.store(true, Ordering::Release);
    }

    pub fn sys_nonblock(&self) -> bool {
        self.sys_nonblock.load(Ordering::Acquire)
    }

    pub fn set_sys_nonblock(&self, v: bool) {
        self.sys_nonblock.store(v, Ordering::Release);
    }

    pub fn user_nonblock(&self) -> bool {
        self.user_nonblock.load(Ordering::Acquire)
    }

    pub fn set_user_nonblock(&self, v: bool) {
        self.user_nonblock.store(v, Ordering::Release);
    }

    /// Configured timeout in ms, [`NO_TIMEOUT`] if unset.
    pub fn timeout(&self, kind: TimeoutKind) -> u64 {
        match kind {
            TimeoutKind::Recv => self.recv_timeout_ms.load(Ordering::Acquire),
            TimeoutKind::Send => self.send_timeout_ms.load(Ordering::Acquire),
        }
    }

    pub fn set_timeout(&self, kind: TimeoutKind, ms: u64) {
        match kind {
            TimeoutKind::Recv => self.recv_timeout_ms.store(ms, Ordering::Release),
            TimeoutKind::Send => self.send_timeout_ms.store(ms, Ordering::Release),
        }
    }
}

/// Process-wide descriptor table. Slots grow by half, never shrink; lookups
/// take the read lock only.
pub struct FdManager {
    slots: RwLock<Vec<Option<Arc<FdCtx>>>>,
}

static FD_MANAGER: Lazy<FdManager> = Lazy::new(|| FdManager {
    slots: RwLock::new(vec![None; 64]),
});

impl FdManager {
    /// The process-wide instance.
    pub fn instance() -> &'static FdManager {
        &FD_MANAGER
    }

    /// Look up the context for `fd`, creating it when `auto_create` is set.
    pub fn get(&self, fd: i32, auto_create: bool) -> Option<Arc<FdCtx>> {
        if fd < 0 {
            return None;
        }
        let idx = fd as usize;
        {
            let slots = self.slots.read();
            if let Some(Some(ctx)) = slots.get(idx) {
                return Some(ctx.clone());
            }
            if !auto_create {
                return None;
            }
        }

        let mut slots = self.slots.write();
        if idx >= slots.len() {
            let grown = (idx as f64 * 1.5) as usize + 1;
            slots.resize(grown, None);
        }
        // Another thread may have created it between locks.
        if let Some(ctx) = &slots[idx] {
            return Some(ctx.clone());
        }
        let ctx = Arc::new(FdCtx::new(fd));
        slots[idx] = Some(ctx.clone());
        Some(ctx)
    }

    /// Forget `fd`. Existing `Arc` handles stay valid.
    pub fn del(&self, fd: i32) {
        if fd < 0 {
            return;
        }
        let mut slots = self.slots.write();
        if let Some(slot) = slots.get_mut(fd as usize) {
            *slot = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_without_autocreate() {
        assert!(FdManager::instance().get(1022, false).is_none());
    }

    #[test]
    fn test_socket_fd_is_detected_and_forced_nonblocking() {
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
        assert!(fd >= 0);

        let ctx = FdManager::instance()
            .get(fd, true)
            .expect("autocreate failed");
        assert!(ctx.is_socket());
        assert!(ctx.sys_nonblock());
        assert!(!ctx.user_nonblock());
        assert!(!ctx.is_closed());

        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
        assert!(flags & libc::O_NONBLOCK != 0);

        FdManager::instance().del(fd);
        unsafe { libc::close(fd) };
    }

    #[test]
    fn test_non_socket_fd() {
        let mut fds = [0i32; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);

        let ctx = FdManager::instance()
            .get(fds[0], true)
            .expect("autocreate failed");
        assert!(!ctx.is_socket());
        assert!(!ctx.sys_nonblock());

        FdManager::instance().del(fds[0]);
        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }

    #[test]
    fn test_timeouts_default_and_update() {
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
        assert!(fd >= 0);

        let ctx = FdManager::instance()
            .get(fd, true)
            .expect("autocreate failed");
        assert_eq!(ctx.timeout(TimeoutKind::Recv), NO_TIMEOUT);
        assert_eq!(ctx.timeout(TimeoutKind::Send), NO_TIMEOUT);

        ctx.set_timeout(TimeoutKind::Recv, 250);
        assert_eq!(ctx.timeout(TimeoutKind::Recv), 250);
        assert_eq!(ctx.timeout(TimeoutKind::Send), NO_TIMEOUT);

        FdManager::instance().del(fd);
        unsafe { libc::close(fd) };
    }

    #[test]
    fn test_table_grows_for_large_fd() {
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
        assert!(fd >= 0);
        let big = unsafe { libc::fcntl(fd, libc::F_DUPFD, 900) };
        assert!(big >= 900);

        let ctx = FdManager::instance().get(big, true).expect("grow failed");
        assert_eq!(ctx.fd(), big);
        assert!(FdManager::instance().get(big, false).is_some());

        FdManager::instance().del(big);
        FdManager::instance().del(fd);
        unsafe {
            libc::close(big);
            libc::close(fd);
        }
    }
}
