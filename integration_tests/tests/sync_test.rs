use std::time::Duration;

use integration_tests::prelude::*;

#[test]
fn test_global_sync_drains_queues_first() {
    init_test_logging();
    let (driver1, controller1) = sim_driver();
    let (driver2, controller2) = sim_driver();
    let mut manager = CanBusManager::new();
    manager
        .add_bus(CanBus::new(BusOptions::named("can0"), Box::new(driver1)))
        .unwrap();
    manager
        .add_bus(CanBus::new(BusOptions::named("can1"), Box::new(driver2)))
        .unwrap();

    manager
        .get_bus(0)
        .unwrap()
        .send(CanMessage::with_data(0x201, &[1]));
    manager
        .get_bus(1)
        .unwrap()
        .send(CanMessage::with_data(0x202, &[2]));

    manager.send_sync_on_all_buses();

    assert!(controller1.wait_for_sent(2, Duration::from_secs(1)));
    assert!(controller2.wait_for_sent(2, Duration::from_secs(1)));
    for (controller, user_id) in [(&controller1, 0x201), (&controller2, 0x202)] {
        let sent = controller.sent();
        // The queued user frame went out before the one and only sync
        assert_eq!(2, sent.len());
        assert_eq!(user_id, sent[0].id());
        assert_eq!(cob::SYNC, sent[1].id());
        assert_eq!(0, sent[1].length());
    }
}

#[test]
fn test_send_sync_enqueues_broadcast_frame() {
    init_test_logging();
    let (driver, controller) = sim_driver();
    let mut bus = CanBus::new(BusOptions::named("can0"), Box::new(driver));
    bus.init().unwrap();

    bus.send_sync();
    assert!(controller.wait_for_sent(1, Duration::from_secs(1)));
    let sent = controller.sent();
    assert_eq!(cob::SYNC, sent[0].id());
    assert_eq!(0, sent[0].length());
}

#[test]
fn test_close_buses_empties_manager() {
    init_test_logging();
    let (driver, controller) = sim_driver();
    let mut manager = CanBusManager::new();
    manager
        .add_bus(CanBus::new(BusOptions::named("can0"), Box::new(driver)))
        .unwrap();

    manager.get_bus(0).unwrap().send(CanMessage::new(0x123));
    assert!(controller.wait_for_sent(1, Duration::from_secs(1)));

    manager.close_buses();
    assert!(manager.buses().is_empty());
}

#[test]
fn test_manager_aggregates_device_health() {
    init_test_logging();
    let (driver1, _c1) = sim_driver();
    let (driver2, _c2) = sim_driver();
    let mut manager = CanBusManager::new();
    let mut options = BusOptions::named("can0");
    options.sanity_check_interval_ms = 10;
    manager
        .add_bus(CanBus::new(options.clone(), Box::new(driver1)))
        .unwrap();
    options.name = "can1".into();
    manager
        .add_bus(CanBus::new(options, Box::new(driver2)))
        .unwrap();

    // Device-less buses become healthy after their first sanity tick
    assert!(wait_until(Duration::from_secs(1), || manager
        .all_devices_active()));
    assert!(!manager.is_missing_device_or_has_error());
}

#[test]
fn test_manager_synchronous_io_helpers() {
    init_test_logging();
    let (driver, controller) = sim_driver();
    let mut options = BusOptions::named("can0");
    options.asynchronous = false;
    let mut manager = CanBusManager::new();
    manager
        .add_bus(CanBus::new(options, Box::new(driver)))
        .unwrap();

    manager.get_bus(0).unwrap().send(CanMessage::new(0x111));
    assert!(manager.write_messages_synchronous().unwrap());
    assert!(!manager.write_messages_synchronous().unwrap());
    assert_eq!(0x111, controller.sent()[0].id());

    controller.inject(CanMessage::new(0x222));
    assert!(manager.read_messages_synchronous());
    manager.sanity_check_synchronous();
}
