//! The process-wide bus registry and cross-bus coordination

use crate::bus::{InitError, WriteError};
use crate::can_bus::CanBus;

/// Owns a collection of buses and coordinates actions across them.
///
/// Buses are closed in LIFO order so that dispatch callbacks can never run
/// against state that was created after the bus they belong to; the manager
/// also closes all buses on drop. Applications embedding the manager should
/// still call [`close_buses`](Self::close_buses) before tearing down any
/// state their parse callbacks reference.
#[derive(Default)]
pub struct CanBusManager {
    buses: Vec<CanBus>,
}

impl CanBusManager {
    /// Create an empty manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Initialize a bus and take ownership of it. On failure the bus is
    /// dropped and the error returned.
    pub fn add_bus(&mut self, mut bus: CanBus) -> Result<(), InitError> {
        bus.init()?;
        self.buses.push(bus);
        Ok(())
    }

    /// All buses, in the order they were added.
    pub fn buses(&self) -> &[CanBus] {
        &self.buses
    }

    /// The bus at `index`, if present.
    pub fn get_bus(&self, index: usize) -> Option<&CanBus> {
        self.buses.get(index)
    }

    /// Stop all bus threads, in reverse order of addition, and drop the
    /// buses.
    pub fn close_buses(&mut self) {
        while let Some(mut bus) = self.buses.pop() {
            bus.stop_threads(true);
        }
    }

    /// Emit a near-simultaneous SYNC across all buses.
    ///
    /// Every bus's queue is first drained (the locks are collected while
    /// holding each queue empty), then one SYNC frame is pushed per bus in
    /// addition order. No user frame can slip between a bus's drain and its
    /// sync.
    pub fn send_sync_on_all_buses(&self) {
        let mut guards: Vec<_> = self
            .buses
            .iter()
            .map(|bus| bus.wait_for_empty_queue())
            .collect();
        for (bus, guard) in self.buses.iter().zip(guards.iter_mut()) {
            bus.send_sync_without_lock(&mut **guard);
        }
    }

    /// Read and dispatch one message on every synchronous bus. Returns true
    /// if any bus delivered a frame.
    pub fn read_messages_synchronous(&self) -> bool {
        let mut any = false;
        for bus in self.buses.iter().filter(|b| !b.is_asynchronous()) {
            if bus.read_message() {
                any = true;
            }
        }
        any
    }

    /// Write one queued frame on every synchronous bus. Returns true if any
    /// frame was written; the first write error is returned after all buses
    /// had their attempt, with the failed frames left at their queue heads.
    pub fn write_messages_synchronous(&self) -> Result<bool, WriteError> {
        let mut any = false;
        let mut first_error = None;
        for bus in self.buses.iter().filter(|b| !b.is_asynchronous()) {
            match bus.write_message() {
                Ok(wrote) => any |= wrote,
                Err(e) => first_error = first_error.or(Some(e)),
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(any),
        }
    }

    /// Tick the sanity check on every synchronous bus. Asynchronous buses
    /// run their own sanity thread.
    pub fn sanity_check_synchronous(&self) {
        for bus in self.buses.iter().filter(|b| !b.is_asynchronous()) {
            bus.sanity_check();
        }
    }

    /// True if every device on every bus passed its last sanity check.
    pub fn all_devices_active(&self) -> bool {
        self.buses.iter().all(|bus| bus.all_devices_active())
    }

    /// True if any bus reports a missing device or transport error.
    pub fn is_missing_device_or_has_error(&self) -> bool {
        self.buses
            .iter()
            .any(|bus| bus.is_missing_device_or_has_error())
    }
}

impl Drop for CanBusManager {
    fn drop(&mut self) {
        self.close_buses();
    }
}
