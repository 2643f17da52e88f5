use std::sync::{Arc, Mutex};
use std::time::Duration;

use integration_tests::prelude::*;

fn bus_options(name: &str) -> BusOptions {
    let mut options = BusOptions::named(name);
    // Sanity checks are ticked manually so the tests stay deterministic
    options.sanity_check_interval_ms = 0;
    options
}

#[test]
fn test_registered_callback_receives_frame() {
    init_test_logging();
    let (driver, controller) = sim_driver();
    let mut bus = CanBus::new(bus_options("can0"), Box::new(driver));
    let device = RecordingDevice::new(DeviceOptions::new(NodeId::new(1).unwrap(), "probe"), 0x181);
    bus.add_device(device.clone()).unwrap();
    bus.init().unwrap();

    // Age the device so the counter reset is observable
    bus.sanity_check();
    bus.sanity_check();
    assert_eq!(2, device.state().timeout_counter());

    controller.inject(CanMessage::with_data(0x181, &[0x01, 0x02, 0x03, 0x04]));
    assert!(wait_until(Duration::from_secs(1), || !device
        .received()
        .is_empty()));

    let frames = device.received();
    assert_eq!(1, frames.len());
    assert_eq!(0x181, frames[0].id());
    assert_eq!(&[0x01, 0x02, 0x03, 0x04], frames[0].data());
    assert_eq!(0, device.state().timeout_counter());
}

#[test]
fn test_unmapped_fallback() {
    init_test_logging();
    let (driver, controller) = sim_driver();
    let mut bus = CanBus::new(bus_options("can0"), Box::new(driver));
    let device = RecordingDevice::new(DeviceOptions::new(NodeId::new(1).unwrap(), "probe"), 0x181);
    bus.add_device(device.clone()).unwrap();

    let unmapped = Arc::new(Mutex::new(Vec::new()));
    let recorded = unmapped.clone();
    bus.set_unmapped_message_callback(move |msg| {
        recorded.lock().unwrap().push(*msg);
        true
    })
    .unwrap();
    bus.init().unwrap();

    bus.sanity_check();
    controller.inject(CanMessage::with_data(0x222, &[0xAA]));
    assert!(wait_until(Duration::from_secs(1), || !unmapped
        .lock()
        .unwrap()
        .is_empty()));

    let frames = unmapped.lock().unwrap().clone();
    assert_eq!(1, frames.len());
    assert_eq!(0x222, frames[0].id());
    assert!(device.received().is_empty());
    // The unmapped frame is not attributed to the device
    assert_eq!(1, device.state().timeout_counter());
}

#[test]
fn test_exact_match_shadows_masked() {
    init_test_logging();
    let (driver, controller) = sim_driver();
    let mut bus = CanBus::new(bus_options("can0"), Box::new(driver));
    let hits: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

    let h = hits.clone();
    bus.add_can_message_masked(FrameMatcher::masked(0x180, 0xFFFF_FF80), move |_| {
        h.lock().unwrap().push("masked");
        true
    })
    .unwrap();
    let h = hits.clone();
    bus.add_can_message(0x181, move |_| {
        h.lock().unwrap().push("exact");
        true
    })
    .unwrap();
    bus.init().unwrap();

    controller.inject(CanMessage::new(0x181));
    controller.inject(CanMessage::new(0x182));
    assert!(wait_until(Duration::from_secs(1), || hits.lock().unwrap().len() == 2));
    assert_eq!(vec!["exact", "masked"], *hits.lock().unwrap());
}

#[test]
fn test_first_registered_masked_matcher_wins() {
    init_test_logging();
    let (driver, controller) = sim_driver();
    let mut bus = CanBus::new(bus_options("can0"), Box::new(driver));
    let hits: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

    let h = hits.clone();
    bus.add_can_message_masked(FrameMatcher::masked(0x180, 0xFFFF_FF80), move |_| {
        h.lock().unwrap().push("first");
        true
    })
    .unwrap();
    let h = hits.clone();
    bus.add_can_message_masked(FrameMatcher::masked(0x100, 0xFFFF_FF00), move |_| {
        h.lock().unwrap().push("second");
        true
    })
    .unwrap();
    bus.init().unwrap();

    // Both matchers accept 0x182; only the first registered may fire
    controller.inject(CanMessage::new(0x182));
    assert!(wait_until(Duration::from_secs(1), || !hits
        .lock()
        .unwrap()
        .is_empty()));
    assert_eq!(vec!["first"], *hits.lock().unwrap());
}

#[test]
fn test_duplicate_matcher_rejected() {
    let (driver, _controller) = sim_driver();
    let mut bus = CanBus::new(bus_options("can0"), Box::new(driver));
    bus.add_can_message(0x181, |_| true).unwrap();
    assert!(bus.add_can_message(0x181, |_| true).is_err());
    // The same pair via the masked form collides as well
    assert!(bus
        .add_can_message_masked(FrameMatcher::exact(0x181), |_| true)
        .is_err());
    // A different mask on the same identifier is a distinct registration
    bus.add_can_message_masked(FrameMatcher::masked(0x181, 0xFFF), |_| true)
        .unwrap();
}

#[test]
fn test_registration_rejected_after_init() {
    let (driver, _controller) = sim_driver();
    let mut bus = CanBus::new(bus_options("can0"), Box::new(driver));
    bus.init().unwrap();
    assert!(bus.add_can_message(0x100, |_| true).is_err());
    let device = RecordingDevice::new(DeviceOptions::new(NodeId::new(1).unwrap(), "late"), 0x181);
    assert!(bus.add_device(device).is_err());
}

#[test]
fn test_synchronous_read_dispatches_in_caller_thread() {
    init_test_logging();
    let (driver, controller) = sim_driver();
    let mut options = bus_options("can0");
    options.asynchronous = false;
    let mut bus = CanBus::new(options, Box::new(driver));
    let device = RecordingDevice::new(DeviceOptions::new(NodeId::new(1).unwrap(), "probe"), 0x181);
    bus.add_device(device.clone()).unwrap();
    bus.init().unwrap();

    controller.inject(CanMessage::with_data(0x181, &[0x55]));
    assert!(bus.read_message());
    assert_eq!(1, device.received().len());
}
