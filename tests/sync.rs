//! Condition variables and mutexes over the scheduler.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use strand::sync::{Cond, Mutex};
use strand::Error;

fn setup() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    strand::init().unwrap();
}

#[test]
fn ping_pong_via_condvar() {
    setup();
    const ROUNDS: usize = 100;
    let cv = Cond::new().unwrap();

    // The wait-first fiber must park before its peer's first signal; a
    // signal with no waiter is lost. Spawning it first guarantees that.
    let ponger = strand::spawn(move || {
        for _ in 0..ROUNDS {
            cv.wait().unwrap();
            cv.signal().unwrap();
        }
    })
    .unwrap();
    let pinger = strand::spawn(move || {
        for _ in 0..ROUNDS {
            cv.signal().unwrap();
            cv.wait().unwrap();
        }
    })
    .unwrap();

    ponger.join().unwrap();
    pinger.join().unwrap();

    // Nobody is left waiting and the runtime is back to just us.
    cv.destroy().unwrap();
    assert_eq!(strand::stats().unwrap().active_fibers, 1);
}

#[test]
fn signal_beats_timeout() {
    setup();
    let cv = Cond::new().unwrap();
    let waiter = strand::spawn(move || cv.timed_wait(Duration::from_secs(1))).unwrap();
    let signaller = strand::spawn(move || {
        strand::usleep(10_000).unwrap();
        cv.signal().unwrap();
    })
    .unwrap();

    assert!(waiter.join().unwrap().is_ok());
    signaller.join().unwrap();
    // The woken waiter unlinked itself; destroy sees an empty queue.
    cv.destroy().unwrap();
}

#[test]
fn timed_wait_times_out() {
    setup();
    let cv = Cond::new().unwrap();
    let waiter = strand::spawn(move || cv.timed_wait(Duration::from_millis(20))).unwrap();
    assert!(matches!(waiter.join().unwrap(), Err(Error::TimedOut)));
    cv.destroy().unwrap();
}

#[test]
fn broadcast_wakes_in_wait_order() {
    setup();
    let cv = Cond::new().unwrap();
    let order = Rc::new(RefCell::new(Vec::new()));

    let handles: Vec<_> = (0..3u32)
        .map(|i| {
            let order = order.clone();
            strand::spawn(move || {
                cv.wait().unwrap();
                order.borrow_mut().push(i);
            })
            .unwrap()
        })
        .collect();

    // Let all three park, then wake the lot.
    strand::usleep(10_000).unwrap();
    cv.broadcast().unwrap();
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(*order.borrow(), vec![0, 1, 2]);
    cv.destroy().unwrap();
}

#[test]
fn destroy_fails_while_occupied() {
    setup();
    let cv = Cond::new().unwrap();
    let waiter = strand::spawn(move || cv.wait()).unwrap();
    strand::usleep(10_000).unwrap();

    assert!(matches!(cv.destroy(), Err(Error::Busy)));

    strand::interrupt(waiter.id()).unwrap();
    assert!(matches!(waiter.join().unwrap(), Err(Error::Interrupted)));
    cv.destroy().unwrap();
    // The handle is stale now.
    assert!(matches!(cv.signal(), Err(Error::InvalidArg)));
}

#[test]
fn mutex_hands_off_in_fifo_order_without_barging() {
    setup();
    let m = Mutex::new().unwrap();
    let order = Rc::new(RefCell::new(Vec::new()));

    let owner = {
        let order = order.clone();
        strand::spawn(move || {
            m.lock().unwrap();
            // Let the three waiters queue up behind us.
            strand::usleep(20_000).unwrap();
            m.unlock().unwrap();
            // Ownership went straight to the first waiter; a late
            // contender cannot barge in on the unlocked-looking mutex.
            assert!(matches!(m.try_lock(), Err(Error::Busy)));
            order.borrow_mut().push("owner");
        })
        .unwrap()
    };

    let waiters: Vec<_> = ["w1", "w2", "w3"]
        .into_iter()
        .map(|tag| {
            let order = order.clone();
            strand::spawn(move || {
                m.lock().unwrap();
                order.borrow_mut().push(tag);
                m.unlock().unwrap();
            })
            .unwrap()
        })
        .collect();

    owner.join().unwrap();
    for waiter in waiters {
        waiter.join().unwrap();
    }
    assert_eq!(*order.borrow(), vec!["owner", "w1", "w2", "w3"]);
    m.destroy().unwrap();
}

#[test]
fn relocking_from_the_owner_deadlocks() {
    setup();
    let m = Mutex::new().unwrap();
    let fiber = strand::spawn(move || {
        m.lock().unwrap();
        let second = m.lock();
        m.unlock().unwrap();
        second
    })
    .unwrap();
    assert!(matches!(fiber.join().unwrap(), Err(Error::Deadlock)));
    m.destroy().unwrap();
}

#[test]
fn unlock_requires_ownership() {
    setup();
    let m = Mutex::new().unwrap();
    assert!(matches!(m.unlock(), Err(Error::Perm)));

    let holder = strand::spawn(move || {
        m.lock().unwrap();
        strand::usleep(20_000).unwrap();
        m.unlock().unwrap();
    })
    .unwrap();
    strand::usleep(10_000).unwrap();
    // Held by someone else: still not ours to unlock, and not free either.
    assert!(matches!(m.unlock(), Err(Error::Perm)));
    assert!(matches!(m.try_lock(), Err(Error::Busy)));
    holder.join().unwrap();

    m.try_lock().unwrap();
    m.unlock().unwrap();
    m.destroy().unwrap();
}

#[test]
fn interrupted_lock_waiter_fails_without_stealing() {
    setup();
    let m = Mutex::new().unwrap();
    let holder = strand::spawn(move || {
        m.lock().unwrap();
        strand::usleep(50_000).unwrap();
        m.unlock().unwrap();
    })
    .unwrap();
    let waiter = strand::spawn(move || m.lock()).unwrap();
    strand::usleep(10_000).unwrap();

    strand::interrupt(waiter.id()).unwrap();
    assert!(matches!(waiter.join().unwrap(), Err(Error::Interrupted)));
    holder.join().unwrap();
    // The interrupted waiter never took ownership.
    m.try_lock().unwrap();
    m.unlock().unwrap();
    m.destroy().unwrap();
}
