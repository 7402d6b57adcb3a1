//! Event Source Integration Tests
//!
//! Drives [`UsbSource`] through the four-phase protocol, both by hand and
//! attached to a real [`MainLoop`] polling real pipes.
//!
//! # Test Scenarios
//! - Readiness from an observed descriptor
//! - Descriptor notifications arriving while dispatch runs
//! - Timeout reporting to the loop
//! - Teardown when the source leaves the loop
//!
//! Run with: `cargo test -p bridge --test source_tests`

use bridge::test_utils::{MockSubsystem, RecordingRegistry, pipe};
use bridge::{EventSource, Interest, MainLoop, NextTimeout, PostAction, UsbSource};
use std::io::Write;
use std::os::unix::io::AsRawFd;
use std::rc::Rc;
use std::time::{Duration, Instant};

fn source_over(
    subsystem: &Rc<MockSubsystem>,
) -> (UsbSource<MockSubsystem>, Rc<RecordingRegistry>) {
    let registry = Rc::new(RecordingRegistry::default());
    let source = UsbSource::new(subsystem.clone(), registry.clone());
    (source, registry)
}

// ============================================================================
// Readiness Tests
// ============================================================================

#[test]
fn test_readable_descriptor_triggers_one_service_call() {
    let subsystem = Rc::new(MockSubsystem::with_pollfds(&[(5, Interest::READABLE)]));
    let (mut source, registry) = source_over(&subsystem);

    assert_eq!(source.prepare(), (false, None));
    assert!(!source.check());

    registry.set_observed(5, Interest::READABLE);
    assert!(source.check());

    assert_eq!(source.dispatch(), PostAction::Continue);
    assert_eq!(subsystem.handle_events_calls(), vec![Duration::ZERO]);
}

#[test]
fn test_check_true_on_due_timeout_without_ready_descriptor() {
    let subsystem = Rc::new(MockSubsystem::with_pollfds(&[(5, Interest::READABLE)]));
    let (mut source, _registry) = source_over(&subsystem);

    subsystem.set_next_timeout(NextTimeout::After(Duration::from_millis(30)));
    assert!(!source.check());

    subsystem.set_next_timeout(NextTimeout::Immediate);
    assert!(source.check());
}

#[test]
fn test_positive_timeout_never_rounds_to_zero() {
    let subsystem = Rc::new(MockSubsystem::new());
    let (mut source, _registry) = source_over(&subsystem);

    for micros in [1u64, 10, 499, 999, 1_001] {
        subsystem.set_next_timeout(NextTimeout::After(Duration::from_micros(micros)));
        let (ready, timeout) = source.prepare();
        assert!(!ready);
        let timeout = timeout.expect("timeout should be reported");
        assert!(timeout >= Duration::from_micros(micros));
        assert!(!timeout.is_zero());
    }
}

// ============================================================================
// Notification Tests
// ============================================================================

#[test]
fn test_descriptor_added_during_dispatch_registered_once() {
    let subsystem = Rc::new(MockSubsystem::with_pollfds(&[(5, Interest::READABLE)]));
    let (mut source, registry) = source_over(&subsystem);

    subsystem.on_next_handle_events(|s| s.notify_added(9, Interest::READABLE));
    source.dispatch();

    assert_eq!(source.descriptor_fds(), vec![5, 9]);
    assert_eq!(registry.add_count(9), 1);
    assert_eq!(registry.registered_fds(), vec![5, 9]);
}

#[test]
fn test_descriptor_removed_during_dispatch() {
    let subsystem = Rc::new(MockSubsystem::with_pollfds(&[
        (5, Interest::READABLE),
        (6, Interest::WRITABLE),
    ]));
    let (mut source, registry) = source_over(&subsystem);

    subsystem.on_next_handle_events(|s| s.notify_removed(5));
    source.dispatch();

    assert_eq!(source.descriptor_fds(), vec![6]);
    assert_eq!(registry.registered_fds(), vec![6]);
}

#[test]
fn test_unknown_removal_is_survivable() {
    let subsystem = Rc::new(MockSubsystem::with_pollfds(&[(5, Interest::READABLE)]));
    let (mut source, registry) = source_over(&subsystem);

    // Logged and ignored; the set is unchanged
    subsystem.notify_removed(42);
    subsystem.notify_added(5, Interest::WRITABLE);

    assert_eq!(source.descriptor_fds(), vec![5]);
    assert_eq!(registry.add_count(5), 1);
    assert_eq!(registry.remove_count(42), 0);
    assert_eq!(source.dispatch(), PostAction::Continue);
}

#[test]
fn test_no_notifications_after_finalize() {
    let subsystem = Rc::new(MockSubsystem::with_pollfds(&[(5, Interest::READABLE)]));
    let (mut source, registry) = source_over(&subsystem);

    source.finalize();
    subsystem.notify_added(7, Interest::READABLE);

    assert!(source.descriptor_fds().is_empty());
    assert_eq!(registry.add_count(7), 0);
}

// ============================================================================
// Main Loop Tests
// ============================================================================

#[test]
fn test_main_loop_dispatches_on_readable_pipe() {
    let (reader, mut writer) = pipe();
    let subsystem = Rc::new(MockSubsystem::with_pollfds(&[(
        reader.as_raw_fd(),
        Interest::READABLE,
    )]));
    let mut main_loop = MainLoop::new().unwrap();
    UsbSource::attach(subsystem.clone(), &mut main_loop);
    assert_eq!(main_loop.poll_table().len(), 1);

    assert!(!main_loop.iteration(false).unwrap());
    assert!(subsystem.handle_events_calls().is_empty());

    writer.write_all(b"x").unwrap();
    assert!(main_loop.iteration(false).unwrap());
    assert_eq!(subsystem.handle_events_calls().len(), 1);
}

#[test]
fn test_main_loop_waits_for_reported_timeout() {
    let subsystem = Rc::new(MockSubsystem::new());
    subsystem.set_next_timeout(NextTimeout::After(Duration::from_millis(20)));
    let mut main_loop = MainLoop::new().unwrap();
    UsbSource::attach(subsystem.clone(), &mut main_loop);

    let start = Instant::now();
    assert!(!main_loop.iteration(true).unwrap());
    assert!(start.elapsed() >= Duration::from_millis(15));

    subsystem.set_next_timeout(NextTimeout::Immediate);
    assert!(main_loop.iteration(true).unwrap());
    assert_eq!(subsystem.handle_events_calls().len(), 1);
}

#[test]
fn test_descriptor_added_in_loop_is_polled_next_iteration() {
    let (reader, mut writer) = pipe();
    let fd = reader.as_raw_fd();
    let subsystem = Rc::new(MockSubsystem::new());
    subsystem.set_next_timeout(NextTimeout::Immediate);
    let mut main_loop = MainLoop::new().unwrap();
    UsbSource::attach(subsystem.clone(), &mut main_loop);

    subsystem.on_next_handle_events(move |s| s.notify_added(fd, Interest::READABLE));
    assert!(main_loop.iteration(false).unwrap());
    assert_eq!(main_loop.poll_table().len(), 1);

    subsystem.set_next_timeout(NextTimeout::None);
    writer.write_all(b"x").unwrap();
    assert!(main_loop.iteration(false).unwrap());
    assert_eq!(subsystem.handle_events_calls().len(), 2);
}

#[test]
fn test_remove_source_tears_down() {
    let (reader, _writer) = pipe();
    let subsystem = Rc::new(MockSubsystem::with_pollfds(&[(
        reader.as_raw_fd(),
        Interest::READABLE,
    )]));
    let mut main_loop = MainLoop::new().unwrap();
    let id = UsbSource::attach(subsystem.clone(), &mut main_loop);

    assert!(main_loop.remove_source(id));
    assert!(!main_loop.remove_source(id));
    assert_eq!(main_loop.source_count(), 0);
    assert!(main_loop.poll_table().is_empty());
    assert!(!subsystem.has_notifiers());
}

#[test]
fn test_dropping_loop_finalizes_sources() {
    let subsystem = Rc::new(MockSubsystem::with_pollfds(&[(5, Interest::READABLE)]));
    let main_loop = {
        let mut main_loop = MainLoop::new().unwrap();
        UsbSource::attach(subsystem.clone(), &mut main_loop);
        main_loop
    };
    assert!(subsystem.has_notifiers());

    drop(main_loop);
    assert!(!subsystem.has_notifiers());
}
