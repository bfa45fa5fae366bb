//! Sleeping and the clock.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

fn setup() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    strand::init().unwrap();
}

#[test]
fn sleep_lasts_roughly_its_duration() {
    setup();
    // One empty round first, so the deadline base is a fresh clock value.
    strand::usleep(0).unwrap();

    let begin = Instant::now();
    strand::sleep(Duration::from_millis(50)).unwrap();
    let elapsed = begin.elapsed();
    assert!(elapsed >= Duration::from_millis(40), "woke after {elapsed:?}");
    assert!(elapsed < Duration::from_millis(500), "woke after {elapsed:?}");
}

#[test]
fn sleepers_wake_in_deadline_order_with_fifo_ties() {
    setup();
    let order = Rc::new(RefCell::new(Vec::new()));

    // 30, 10, 20, 10, 50 ms, queued within a single scheduler round; the
    // two 10 ms sleepers must wake in spawn order.
    let handles: Vec<_> = [(30u64, "30"), (10, "10-first"), (20, "20"), (10, "10-second"), (50, "50")]
        .into_iter()
        .map(|(ms, tag)| {
            let order = order.clone();
            strand::spawn(move || {
                strand::usleep(ms * 1_000).unwrap();
                order.borrow_mut().push(tag);
            })
            .unwrap()
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(
        *order.borrow(),
        vec!["10-first", "10-second", "20", "30", "50"]
    );
}

#[test]
fn usleep_zero_yields_one_round() {
    setup();
    let order = Rc::new(RefCell::new(Vec::new()));
    let tail = order.clone();
    let fiber = strand::spawn(move || tail.borrow_mut().push("fiber")).unwrap();
    order.borrow_mut().push("before");
    strand::usleep(0).unwrap();
    order.borrow_mut().push("after");
    fiber.join().unwrap();
    assert_eq!(*order.borrow(), vec!["before", "fiber", "after"]);
}

#[test]
fn clock_advances() {
    setup();
    let a = strand::now_us();
    strand::usleep(5_000).unwrap();
    let b = strand::now_us();
    assert!(b > a);
    // last_clock is the idle round's reading, never ahead of now.
    assert!(strand::last_clock_us().unwrap() <= strand::now_us());
}

#[test]
fn coarse_seconds_cache() {
    setup();
    let live = strand::now_seconds().unwrap();
    strand::time_cache(true).unwrap();
    let cached = strand::now_seconds().unwrap();
    assert!((cached - live).abs() <= 1);
    strand::time_cache(false).unwrap();
}

#[test]
fn custom_time_source() {
    setup();
    // Same clock, shifted far into the future. The offset shows up in
    // now_us but cancels out of every deadline computation, so sleeping
    // still works.
    const OFFSET: u64 = 1 << 50;
    fn shifted() -> u64 {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        // Safety: ts is a valid out-pointer
        unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
        ts.tv_sec as u64 * 1_000_000 + ts.tv_nsec as u64 / 1_000 + OFFSET
    }

    strand::set_time_source(shifted).unwrap();
    assert!(strand::now_us() >= OFFSET);
    let begin = Instant::now();
    strand::usleep(10_000).unwrap();
    assert!(begin.elapsed() < Duration::from_secs(2));
}
