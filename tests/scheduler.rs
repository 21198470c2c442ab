//! End-to-end scenarios exercising the scheduler's public surface the way a
//! consumer would, one per named scenario in `SPEC_FULL.md` §8.

use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;
use std::time::{Duration, Instant};

use fiber_scheduler::{fiber, scheduler, EventMask, Scheduler};

#[test]
fn t1_sleep_blocks_for_at_least_the_requested_duration() {
    let sched = Scheduler::init().unwrap();
    let start = Instant::now();
    sched.spawn("sleeper", || {
        scheduler::sleep(Duration::from_millis(50)).unwrap();
    });
    sched.run().unwrap();
    assert!(start.elapsed() >= Duration::from_millis(50));
    assert_eq!(sched.pending_count(), 0);
}

#[test]
fn t2_io_wait_resumes_readable_once_the_peer_writes() {
    let sched = Scheduler::init().unwrap();
    let (a, b) = UnixStream::pair().unwrap();

    sched.spawn("reader", move || {
        let mask = scheduler::io_wait(a.as_raw_fd(), EventMask::READABLE, None)
            .unwrap()
            .expect("should resume with readiness, not a timeout");
        assert!(mask.contains(EventMask::READABLE));
    });
    sched.spawn("writer", move || {
        use std::io::Write;
        let mut b = b;
        b.write_all(b"x").unwrap();
    });

    sched.run().unwrap();
}

#[test]
fn t3_io_wait_times_out_on_an_idle_descriptor() {
    let sched = Scheduler::init().unwrap();
    let (a, _b) = UnixStream::pair().unwrap();
    let start = Instant::now();

    sched.spawn("waiter", move || {
        let outcome =
            scheduler::io_wait(a.as_raw_fd(), EventMask::READABLE, Some(Duration::from_millis(10)))
                .unwrap();
        assert!(outcome.is_none(), "nothing was ever written, so this must time out");
    });

    sched.run().unwrap();
    assert!(start.elapsed() >= Duration::from_millis(10));
}

#[test]
fn t4_cross_thread_unblock_wakes_a_paused_fiber() {
    let sched = Scheduler::init().unwrap();

    let id_slot = std::rc::Rc::new(std::cell::RefCell::new(None));
    let id_slot2 = id_slot.clone();
    sched.spawn("blocked", move || {
        *id_slot2.borrow_mut() = fiber::current();
        let woke = scheduler::block(None).unwrap();
        assert!(woke);
    });

    sched.poll().unwrap();
    let target = id_slot.borrow().expect("fiber should have recorded its id before parking");

    let handle = sched.handle();
    std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(20));
        handle.unblock(target);
    })
    .join()
    .unwrap();

    sched.run().unwrap();
}

#[test]
fn t5_process_wait_returns_the_pid_and_exit_status() {
    use nix::sys::wait::WaitPidFlag;
    use nix::unistd::{fork, ForkResult};

    let sched = Scheduler::init().unwrap();

    // SAFETY: the child only calls `std::process::exit`, never returning
    // into shared Rust state, which is the one fork-safety condition that
    // matters for a test process with no other threads holding locks.
    let pid = match unsafe { fork() }.unwrap() {
        ForkResult::Child => {
            std::process::exit(7);
        }
        ForkResult::Parent { child } => child.as_raw(),
    };

    let outcome = std::rc::Rc::new(std::cell::RefCell::new(None));
    let outcome2 = outcome.clone();
    sched.spawn("waiter", move || {
        let result = scheduler::process_wait(pid, WaitPidFlag::empty().bits()).unwrap();
        *outcome2.borrow_mut() = Some(result);
    });

    sched.run().unwrap();

    let (got_pid, status) = outcome.borrow_mut().take().expect("process_wait should have resumed");
    assert_eq!(got_pid, pid);
    assert_eq!(status, 7);
}

#[test]
fn t6_cancellation_unwinds_a_suspended_wait_with_an_error() {
    let sched = Scheduler::init().unwrap();
    let id_slot = std::rc::Rc::new(std::cell::RefCell::new(None));
    let id_slot2 = id_slot.clone();
    let result = std::rc::Rc::new(std::cell::RefCell::new(None));
    let result2 = result.clone();

    sched.spawn("sleeper", move || {
        *id_slot2.borrow_mut() = fiber::current();
        *result2.borrow_mut() = Some(scheduler::sleep(Duration::from_secs(10)));
    });

    sched.poll().unwrap();
    let target = id_slot.borrow().expect("fiber should have recorded its id before parking");

    sched.handle().cancel(target, "scenario T6");
    sched.run().unwrap();

    let outcome = result.borrow_mut().take().expect("fiber should have resumed");
    assert!(outcome.is_err(), "a cancelled sleep must unwind with an error, not a normal wakeup");
    assert_eq!(sched.pending_count(), 0);
    assert!(sched.poll().is_ok(), "run queue and pending_count must stay consistent after a cancellation");
}
