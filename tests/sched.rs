//! Fiber lifecycle: spawn, join, exit, interrupt, stack recycling.

use std::rc::Rc;
use std::time::{Duration, Instant};

use strand::Error;

fn setup() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    strand::init().unwrap();
}

#[test]
fn join_returns_value() {
    setup();
    let handle = strand::spawn(|| 42u32).unwrap();
    // Give the fiber a scheduler round to run and turn zombie.
    strand::usleep(10_000).unwrap();
    assert_eq!(handle.join().unwrap(), 42);
}

#[test]
fn join_before_exit_parks_the_joiner() {
    setup();
    let handle = strand::spawn(|| {
        strand::usleep(20_000).unwrap();
        "done"
    })
    .unwrap();
    // The fiber has not run yet; join must park until it terminates.
    assert_eq!(handle.join().unwrap(), "done");
}

#[test]
fn exit_short_circuits_the_entry() {
    setup();
    let handle = strand::spawn(|| {
        if strand::current().is_ok() {
            strand::exit(7u32);
        }
        0u32
    })
    .unwrap();
    assert_eq!(handle.join().unwrap(), 7);
}

#[test]
fn exited_stack_returns_to_the_free_list() {
    setup();
    let before = strand::stats().unwrap().pooled_stacks;
    let handle = strand::spawn(|| 42u8).unwrap();
    strand::usleep(10_000).unwrap();
    assert_eq!(handle.join().unwrap(), 42);
    // The reaped fiber needs one more round for its final cleanup pass.
    strand::usleep(10_000).unwrap();
    let after = strand::stats().unwrap().pooled_stacks;
    assert_eq!(after, before + 1);
}

#[test]
fn active_count_returns_to_primordial_only() {
    setup();
    let base = strand::stats().unwrap().active_fibers;
    let handles: Vec<_> = (0..4)
        .map(|i| strand::spawn(move || i).unwrap())
        .collect();
    assert_eq!(strand::stats().unwrap().active_fibers, base + 4);
    for (i, handle) in handles.into_iter().enumerate() {
        assert_eq!(handle.join().unwrap(), i);
    }
    strand::usleep(10_000).unwrap();
    assert_eq!(strand::stats().unwrap().active_fibers, base);
}

#[test]
fn detached_fibers_run_without_a_join() {
    setup();
    let ran = Rc::new(std::cell::Cell::new(false));
    let flag = ran.clone();
    strand::Builder::new()
        .spawn_detached(move || flag.set(true))
        .unwrap();
    strand::usleep(10_000).unwrap();
    assert!(ran.get());
}

#[test]
fn interrupt_wakes_a_sleeper_promptly() {
    setup();
    let sleeper = strand::spawn(|| strand::usleep(1_000_000)).unwrap();
    // Let it park.
    strand::usleep(20_000).unwrap();

    let begin = Instant::now();
    strand::interrupt(sleeper.id()).unwrap();
    let result = sleeper.join().unwrap();
    assert!(matches!(result, Err(Error::Interrupted)));
    assert!(begin.elapsed() < Duration::from_millis(50));
}

#[test]
fn interrupting_a_runnable_fiber_fails_its_next_park_once() {
    setup();
    let fiber = strand::spawn(|| {
        let first = strand::usleep(0);
        let second = strand::usleep(0);
        (first.is_err(), second.is_ok())
    })
    .unwrap();
    // The fiber is runnable but has not run; the interrupt must hit its
    // first parking call, and only that one.
    strand::interrupt(fiber.id()).unwrap();
    assert_eq!(fiber.join().unwrap(), (true, true));
}

#[test]
fn interrupt_unparks_a_suspended_fiber() {
    setup();
    let suspended = strand::spawn(|| strand::suspend()).unwrap();
    strand::usleep(10_000).unwrap();
    strand::interrupt(suspended.id()).unwrap();
    assert!(matches!(
        suspended.join().unwrap(),
        Err(Error::Interrupted)
    ));
}

#[test]
fn interrupting_a_zombie_is_a_no_op() {
    setup();
    let handle = strand::spawn(|| ()).unwrap();
    strand::usleep(10_000).unwrap();
    // The fiber has exited and parks as a zombie until joined.
    strand::interrupt(handle.id()).unwrap();
    handle.join().unwrap();
}

#[test]
fn stale_handles_are_rejected() {
    setup();
    let handle = strand::spawn(|| ()).unwrap();
    let id = handle.id();
    strand::usleep(10_000).unwrap();
    handle.join().unwrap();
    // Let the reaped fiber finish its cleanup; its record is then gone.
    strand::usleep(10_000).unwrap();
    assert!(matches!(strand::interrupt(id), Err(Error::InvalidArg)));
}

#[test]
fn fibers_spawn_fibers() {
    setup();
    let outer = strand::spawn(|| {
        let inner = strand::spawn(|| 3u64).unwrap();
        strand::usleep(0).unwrap();
        inner.join().unwrap() + 4
    })
    .unwrap();
    assert_eq!(outer.join().unwrap(), 7);
}

#[test]
fn randomize_stacks_toggle() {
    setup();
    strand::randomize_stacks(true).unwrap();
    let handle = strand::spawn(|| 1u8).unwrap();
    assert_eq!(handle.join().unwrap(), 1);
    strand::randomize_stacks(false).unwrap();
}
