use std::time::Duration;

use integration_tests::prelude::*;

fn ids(frames: &[CanMessage]) -> Vec<u32> {
    frames.iter().map(|m| m.id()).collect()
}

#[test]
fn test_send_order_preserved() {
    init_test_logging();
    let (driver, controller) = sim_driver();
    let mut bus = CanBus::new(BusOptions::named("can0"), Box::new(driver));
    bus.init().unwrap();

    for i in 0..5 {
        bus.send(CanMessage::new(0x100 + i));
    }
    assert!(controller.wait_for_sent(5, Duration::from_secs(1)));
    assert_eq!(
        vec![0x100, 0x101, 0x102, 0x103, 0x104],
        ids(&controller.sent())
    );
}

#[test]
fn test_passive_bus_discards_queued_frames() {
    init_test_logging();
    let (driver, controller) = sim_driver();
    let mut options = BusOptions::named("can0");
    options.start_passive = true;
    let mut bus = CanBus::new(options, Box::new(driver));
    bus.init().unwrap();

    for i in 0..3 {
        bus.send(CanMessage::new(0x100 + i));
    }
    // Frames are popped as if written; wait until the queue has drained
    drop(bus.wait_for_empty_queue());
    assert!(bus.is_passive());
    assert!(controller.sent().is_empty());
}

#[test]
fn test_auto_activation_on_reception() {
    init_test_logging();
    let (driver, controller) = sim_driver();
    let mut options = BusOptions::named("can0");
    options.start_passive = true;
    options.activate_bus_on_reception = true;
    let mut bus = CanBus::new(options, Box::new(driver));
    bus.init().unwrap();
    assert!(bus.is_passive());

    controller.inject(CanMessage::new(0x100));
    assert!(wait_until(Duration::from_secs(1), || !bus.is_passive()));

    bus.send(CanMessage::new(0x200));
    assert!(controller.wait_for_sent(1, Duration::from_secs(1)));
    assert_eq!(vec![0x200], ids(&controller.sent()));
}

#[test]
fn test_queue_overflow_warns_but_enqueues() {
    init_test_logging();
    let (driver, controller) = sim_driver();
    let mut options = BusOptions::named("can0");
    options.asynchronous = false;
    options.max_queue_size = 2;
    let mut bus = CanBus::new(options, Box::new(driver));
    bus.init().unwrap();

    let handle = bus.handle();
    for i in 0..3 {
        handle.send(CanMessage::new(0x100 + i));
    }
    // The push beyond the cap warned but still succeeded
    assert_eq!(3, handle.queue_len());
    assert!(bus.write_message().unwrap());
    assert!(bus.write_message().unwrap());
    assert!(bus.write_message().unwrap());
    assert!(!bus.write_message().unwrap());
    assert_eq!(3, controller.sent().len());
}

#[test]
fn test_write_error_retains_queue_head() {
    init_test_logging();
    let (driver, controller) = sim_driver();
    let mut options = BusOptions::named("can0");
    options.asynchronous = false;
    let mut bus = CanBus::new(options, Box::new(driver));
    bus.init().unwrap();

    bus.send(CanMessage::new(0x42));
    controller.set_fail_writes(true);
    assert!(bus.write_message().is_err());
    assert!(controller.sent().is_empty());

    controller.set_fail_writes(false);
    assert!(bus.write_message().unwrap());
    assert_eq!(vec![0x42], ids(&controller.sent()));
}

#[test]
fn test_transmit_thread_retries_failed_write() {
    init_test_logging();
    let (driver, controller) = sim_driver();
    let mut bus = CanBus::new(BusOptions::named("can0"), Box::new(driver));
    bus.init().unwrap();

    controller.set_fail_writes(true);
    bus.send(CanMessage::new(0x7));
    std::thread::sleep(Duration::from_millis(50));
    assert!(controller.sent().is_empty());

    controller.set_fail_writes(false);
    assert!(controller.wait_for_sent(1, Duration::from_secs(1)));
    assert_eq!(vec![0x7], ids(&controller.sent()));
}

#[test]
fn test_stop_threads_halts_io() {
    init_test_logging();
    let (driver, controller) = sim_driver();
    let mut bus = CanBus::new(BusOptions::named("can0"), Box::new(driver));
    bus.init().unwrap();

    bus.send(CanMessage::new(0x1));
    assert!(controller.wait_for_sent(1, Duration::from_secs(1)));

    bus.stop_threads(true);
    bus.send(CanMessage::new(0x2));
    controller.inject(CanMessage::new(0x3));
    std::thread::sleep(Duration::from_millis(30));
    assert_eq!(1, controller.sent().len());

    // Stopping again is harmless
    bus.stop_threads(true);
}

#[test]
fn test_init_failure_spawns_nothing() {
    init_test_logging();
    let (driver, controller) = sim_driver();
    controller.set_fail_init(true);
    let mut bus = CanBus::new(BusOptions::named("dead"), Box::new(driver));
    assert!(bus.init().is_err());

    // No worker threads: a queued frame stays queued
    bus.send(CanMessage::new(0x1));
    std::thread::sleep(Duration::from_millis(20));
    assert!(controller.sent().is_empty());
    assert_eq!(1, bus.handle().queue_len());
}

#[test]
fn test_bus_error_flag_set_and_cleared() {
    init_test_logging();
    let (driver, controller) = sim_driver();
    let mut options = BusOptions::named("can0");
    options.sanity_check_interval_ms = 0;
    let mut bus = CanBus::new(options, Box::new(driver));
    let device = RecordingDevice::new(DeviceOptions::new(NodeId::new(1).unwrap(), "probe"), 0x181);
    bus.add_device(device.clone()).unwrap();
    bus.init().unwrap();

    controller.inject_bus_error(CanMessage::new(0x2000_0001));
    assert!(wait_until(Duration::from_secs(1), || {
        bus.sanity_check();
        bus.is_missing_device_or_has_error()
    }));

    // The next good frame proves the bus works again
    controller.inject(CanMessage::with_data(0x181, &[0x01]));
    assert!(wait_until(Duration::from_secs(1), || !device
        .received()
        .is_empty()));
    bus.sanity_check();
    assert!(!bus.is_missing_device_or_has_error());
    assert!(bus.all_devices_active());
}
