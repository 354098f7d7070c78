//! End-to-end scenarios: hooked calls suspending fibers instead of blocking
//! worker threads, timeout-bounded connects, and event demultiplexing
//! across descriptors.

use silk::{Event, FdManager, Fiber, Reactor};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn make_pipe() -> (i32, i32) {
    let mut fds = [0i32; 2];
    assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
    (fds[0], fds[1])
}

fn make_socketpair() -> (i32, i32) {
    let mut fds = [0i32; 2];
    let rc = unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) };
    assert_eq!(rc, 0);
    (fds[0], fds[1])
}

#[test]
fn hooked_sleep_does_not_block_the_thread() {
    init_logger();
    let reactor = Reactor::new(2, false, "e2e_sleep");

    let counter = Arc::new(AtomicU64::new(0));
    let done = Arc::new(AtomicBool::new(false));
    let slept_ms = Arc::new(AtomicU64::new(0));

    let done2 = done.clone();
    let slept = slept_ms.clone();
    reactor.spawn(move || {
        let start = Instant::now();
        silk::hook::sleep(1);
        slept.store(start.elapsed().as_millis() as u64, Ordering::SeqCst);
        done2.store(true, Ordering::SeqCst);
    });

    let counter2 = counter.clone();
    let done3 = done.clone();
    reactor.spawn(move || {
        while !done3.load(Ordering::SeqCst) {
            counter2.fetch_add(1, Ordering::Relaxed);
        }
    });

    // The counter must keep advancing while the first fiber sleeps.
    std::thread::sleep(Duration::from_millis(300));
    let sample_a = counter.load(Ordering::Relaxed);
    std::thread::sleep(Duration::from_millis(300));
    let sample_b = counter.load(Ordering::Relaxed);
    assert!(
        sample_b > sample_a,
        "counter stalled during hooked sleep ({} -> {})",
        sample_a,
        sample_b
    );

    let deadline = Instant::now() + Duration::from_secs(10);
    while !done.load(Ordering::SeqCst) {
        assert!(Instant::now() < deadline, "sleeper never resumed");
        std::thread::sleep(Duration::from_millis(10));
    }

    let slept = slept_ms.load(Ordering::SeqCst);
    assert!(slept >= 990, "sleep returned after only {}ms", slept);
    assert!(slept <= 1300, "sleep overshot to {}ms", slept);

    reactor.stop();
}

#[test]
fn hooked_connect_fails_with_timeout() {
    init_logger();
    let reactor = Reactor::new(1, false, "e2e_connect");
    let (tx, rx) = mpsc::channel();

    reactor.spawn(move || {
        let fd = silk::hook::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
        assert!(fd >= 0);

        // 192.0.2.1 (TEST-NET-1) never answers; the SYN just disappears.
        let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
        addr.sin_family = libc::AF_INET as libc::sa_family_t;
        addr.sin_port = 81u16.to_be();
        addr.sin_addr.s_addr = u32::to_be(0xC000_0201);

        let start = Instant::now();
        let rc = unsafe {
            silk::hook::connect_with_timeout(
                fd,
                &addr as *const libc::sockaddr_in as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
                200,
            )
        };
        let err = std::io::Error::last_os_error().raw_os_error();
        silk::hook::close(fd);
        let _ = tx.send((rc, err, start.elapsed()));
    });

    let (rc, err, elapsed) = rx
        .recv_timeout(Duration::from_secs(10))
        .expect("connect fiber finished");
    assert_eq!(rc, -1);

    if err == Some(libc::ETIMEDOUT) {
        assert!(
            elapsed >= Duration::from_millis(180),
            "timed out too early: {:?}",
            elapsed
        );
        assert!(
            elapsed <= Duration::from_millis(400),
            "timed out too late: {:?}",
            elapsed
        );
    } else {
        // Sandboxed environments may reject the SYN outright (e.g.
        // ENETUNREACH); the timeout path is then untestable here, but the
        // call must still have failed fast.
        assert!(elapsed < Duration::from_secs(5));
    }

    reactor.stop();
}

#[test]
fn hooked_recv_times_out_via_socket_timeout() {
    init_logger();
    let reactor = Reactor::new(1, false, "e2e_recv_timeout");
    let (a, b) = make_socketpair();
    let (tx, rx) = mpsc::channel();

    reactor.spawn(move || {
        FdManager::instance().get(a, true);

        let tv = libc::timeval {
            tv_sec: 0,
            tv_usec: 150_000,
        };
        let rc = unsafe {
            silk::hook::setsockopt(
                a,
                libc::SOL_SOCKET,
                libc::SO_RCVTIMEO,
                &tv as *const libc::timeval as *const libc::c_void,
                std::mem::size_of::<libc::timeval>() as libc::socklen_t,
            )
        };
        assert_eq!(rc, 0);

        let mut buf = [0u8; 16];
        let start = Instant::now();
        let n = unsafe {
            silk::hook::recv(a, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0)
        };
        let err = std::io::Error::last_os_error().raw_os_error();
        let _ = tx.send((n, err, start.elapsed()));
    });

    let (n, err, elapsed) = rx
        .recv_timeout(Duration::from_secs(10))
        .expect("recv fiber finished");
    assert_eq!(n, -1);
    assert_eq!(err, Some(libc::ETIMEDOUT));
    assert!(
        elapsed >= Duration::from_millis(140),
        "recv timed out too early: {:?}",
        elapsed
    );
    assert!(
        elapsed <= Duration::from_millis(400),
        "recv timed out too late: {:?}",
        elapsed
    );

    reactor.stop();
    unsafe {
        libc::close(a);
        libc::close(b);
    }
}

#[test]
fn hooked_read_suspends_until_data_arrives() {
    init_logger();
    let reactor = Reactor::new(2, false, "e2e_read");
    let (a, b) = make_socketpair();
    let (tx, rx) = mpsc::channel();

    reactor.spawn(move || {
        FdManager::instance().get(a, true);
        let mut buf = [0u8; 16];
        let n = unsafe {
            silk::hook::read(a, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
        };
        let _ = tx.send((n, buf));
    });

    // Give the reader time to park, then feed it.
    std::thread::sleep(Duration::from_millis(100));
    let msg = b"ping";
    let written = unsafe { libc::write(b, msg.as_ptr() as *const libc::c_void, msg.len()) };
    assert_eq!(written, msg.len() as isize);

    let (n, buf) = rx
        .recv_timeout(Duration::from_secs(10))
        .expect("reader finished");
    assert_eq!(n, 4);
    assert_eq!(&buf[..4], b"ping");

    reactor.stop();
    unsafe {
        libc::close(a);
        libc::close(b);
    }
}

#[test]
fn readiness_on_one_fd_wakes_exactly_one_fiber() {
    init_logger();
    let reactor = Reactor::new(2, false, "e2e_two_fds");
    let pipe_a = make_pipe();
    let pipe_b = make_pipe();

    let woke_a = Arc::new(AtomicUsize::new(0));
    let woke_b = Arc::new(AtomicUsize::new(0));

    let r2 = reactor.clone();
    let woke = woke_a.clone();
    reactor.spawn(move || {
        r2.add_event(pipe_a.0, Event::Read).expect("register a");
        Fiber::yield_to_hold();
        woke.fetch_add(1, Ordering::SeqCst);
    });

    let r3 = reactor.clone();
    let woke = woke_b.clone();
    reactor.spawn(move || {
        r3.add_event(pipe_b.0, Event::Read).expect("register b");
        Fiber::yield_to_hold();
        woke.fetch_add(1, Ordering::SeqCst);
    });

    // Let both fibers park.
    let deadline = Instant::now() + Duration::from_secs(5);
    while reactor.pending_event_count() < 2 {
        assert!(Instant::now() < deadline, "fibers never registered");
        std::thread::sleep(Duration::from_millis(5));
    }

    // Data on pipe A only.
    assert_eq!(
        unsafe { libc::write(pipe_a.1, b"x".as_ptr() as *const libc::c_void, 1) },
        1
    );

    let deadline = Instant::now() + Duration::from_secs(5);
    while woke_a.load(Ordering::SeqCst) == 0 {
        assert!(Instant::now() < deadline, "fiber A never resumed");
        std::thread::sleep(Duration::from_millis(5));
    }

    // The other fiber must still be parked.
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(woke_b.load(Ordering::SeqCst), 0, "fiber B resumed without data");
    assert_eq!(reactor.pending_event_count(), 1);

    // Release fiber B so the reactor can drain.
    assert!(reactor.cancel_event(pipe_b.0, Event::Read));
    let deadline = Instant::now() + Duration::from_secs(5);
    while woke_b.load(Ordering::SeqCst) == 0 {
        assert!(Instant::now() < deadline, "fiber B never cancelled");
        std::thread::sleep(Duration::from_millis(5));
    }

    reactor.stop();
    unsafe {
        libc::close(pipe_a.0);
        libc::close(pipe_a.1);
        libc::close(pipe_b.0);
        libc::close(pipe_b.1);
    }
}

#[test]
fn connect_timeout_config_updates_live() {
    init_logger();
    let var = silk::hook::connect_timeout_var();
    let initial = var.get();
    assert!(initial > 0);

    let observed = Arc::new(AtomicU64::new(0));
    let observed2 = observed.clone();
    let key = var.add_listener(move |_, new| {
        observed2.store(*new, Ordering::SeqCst);
    });

    var.set(1234);
    assert_eq!(observed.load(Ordering::SeqCst), 1234);
    assert_eq!(var.get(), 1234);

    var.remove_listener(key);
    var.set(initial);
}
