//! Small OS helpers shared across the runtime

use std::time::{SystemTime, UNIX_EPOCH};

/// OS thread id of the calling thread.
///
/// Used as the scheduling-affinity key: a task can be pinned to the worker
/// thread that produced this id.
pub fn thread_id() -> u64 {
    unsafe { libc::syscall(libc::SYS_gettid) as u64 }
}

/// Wall-clock time in milliseconds since the Unix epoch.
///
/// Timers are kept in wall-clock milliseconds so a backwards clock step is
/// observable (see `TimerManager`).
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Log an error with a captured backtrace, then panic.
///
/// For programming-contract violations, not recoverable runtime conditions.
/// Release builds compile with `panic = "abort"`, so these terminate the
/// process.
#[macro_export]
macro_rules! fatal {
    ($($arg:tt)*) => {{
        let bt = std::backtrace::Backtrace::force_capture();
        log::error!("{}\nbacktrace:\n{}", format_args!($($arg)*), bt);
        panic!($($arg)*)
    }};
}

/// Assert an invariant; on failure, log with a backtrace and panic.
#[macro_export]
macro_rules! fatal_assert {
    ($cond:expr) => {
        if !$cond {
            $crate::fatal!("assertion failed: {}", stringify!($cond));
        }
    };
    ($cond:expr, $($arg:tt)*) => {
        if !$cond {
            $crate::fatal!($($arg)*);
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thread_id_stable_within_thread() {
        assert_eq!(thread_id(), thread_id());
    }

    #[test]
    fn test_thread_id_differs_across_threads() {
        let main_id = thread_id();
        let other = std::thread::spawn(thread_id)
            .join()
            .expect("thread join failed");
        assert_ne!(main_id, other);
    }

    #[test]
    fn test_now_ms_advances() {
        let a = now_ms();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let b = now_ms();
        assert!(b >= a + 4);
    }
}
