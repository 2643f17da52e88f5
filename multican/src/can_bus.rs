//! The CAN flavor of the bus engine: dispatch by COB-ID, device container,
//! and the broadcast SYNC hook.

use std::collections::VecDeque;
use std::sync::{Arc, MutexGuard};

use log::warn;
use multican_common::constants::cob;
use multican_common::traits::BusDriver;
use multican_common::CanMessage;
use snafu::ensure;

use crate::bus::{Bus, BusHandle, FrameHandler, InitError, WriteError};
use crate::device::{Device, DeviceRegistry};
use crate::dispatch::{
    BusRunningSnafu, DeviceAlreadyAttachedSnafu, Dispatcher, FrameMatcher, RegisterError,
};
use crate::options::BusOptions;

/// Routes received frames to the registered parse callbacks and aggregates
/// device health for the sanity thread.
struct CanFrameHandler {
    bus_name: String,
    dispatcher: Dispatcher,
    devices: Vec<Arc<dyn Device>>,
}

impl FrameHandler<CanMessage> for CanFrameHandler {
    fn handle_frame(&self, msg: &CanMessage) {
        self.dispatcher.dispatch(msg);
    }

    fn handle_bus_error(&self, msg: &CanMessage) {
        warn!(
            "bus {}: received error frame with id 0x{:X}",
            self.bus_name,
            msg.id()
        );
    }

    fn check_devices(&self) -> bool {
        let mut all_ok = true;
        for device in &self.devices {
            if !device.sanity_check() {
                all_ok = false;
            }
        }
        all_ok
    }
}

/// A CAN bus: the generic engine plus a dispatch table keyed by masked frame
/// identifiers and the container of attached devices.
///
/// Registration (devices and plain callbacks) happens between construction
/// and [`init`](Self::init); afterwards the dispatch table is frozen and
/// lookups run without locking on the receive thread.
pub struct CanBus {
    bus: Bus<CanMessage>,
    /// Present until `init` moves it into the frame handler
    dispatcher: Option<Dispatcher>,
    devices: Vec<Arc<dyn Device>>,
}

impl CanBus {
    /// Create a bus from options and a transport driver.
    pub fn new(options: BusOptions, driver: Box<dyn BusDriver<CanMessage>>) -> Self {
        Self {
            bus: Bus::new(options, driver),
            dispatcher: Some(Dispatcher::new()),
            devices: Vec::new(),
        }
    }

    fn dispatcher(&mut self) -> Result<&mut Dispatcher, RegisterError> {
        let bus = &self.bus;
        self.dispatcher
            .as_mut()
            .ok_or_else(|| BusRunningSnafu { bus: bus.name() }.build())
    }

    /// Attach a device: wires the bus backreference, stores the device and
    /// calls its [`init_device`](Device::init_device) exactly once.
    pub fn add_device<T: Device>(&mut self, device: Arc<T>) -> Result<(), RegisterError> {
        let handle = self.bus.handle();
        let Some(dispatcher) = self.dispatcher.as_mut() else {
            return BusRunningSnafu {
                bus: handle.bus_name(),
            }
            .fail();
        };
        ensure!(
            device.state().attach(handle.clone()),
            DeviceAlreadyAttachedSnafu {
                device: device.state().name()
            }
        );
        let erased: Arc<dyn Device> = device.clone();
        self.devices.push(erased.clone());
        let mut registry = DeviceRegistry {
            dispatcher,
            bus: &handle,
            device: erased,
        };
        device.init_device(&mut registry)
    }

    /// Register a callback for one frame identifier, without a device
    /// association.
    pub fn add_can_message(
        &mut self,
        id: u32,
        callback: impl Fn(&CanMessage) -> bool + Send + Sync + 'static,
    ) -> Result<(), RegisterError> {
        self.add_can_message_masked(FrameMatcher::exact(id), callback)
    }

    /// Register a callback for a masked identifier range, without a device
    /// association.
    pub fn add_can_message_masked(
        &mut self,
        matcher: FrameMatcher,
        callback: impl Fn(&CanMessage) -> bool + Send + Sync + 'static,
    ) -> Result<(), RegisterError> {
        self.dispatcher()?
            .register(matcher, None, Box::new(callback))
    }

    /// Set the catch-all callback invoked for frames no matcher accepts.
    pub fn set_unmapped_message_callback(
        &mut self,
        callback: impl Fn(&CanMessage) -> bool + Send + Sync + 'static,
    ) -> Result<(), RegisterError> {
        self.dispatcher()?.set_unmapped_callback(Box::new(callback));
        Ok(())
    }

    /// Open the transport and, on an asynchronous bus, spawn the worker
    /// threads. Freezes the dispatch table.
    pub fn init(&mut self) -> Result<(), InitError> {
        let Some(dispatcher) = self.dispatcher.take() else {
            return Ok(()); // already initialized
        };
        let handler = Arc::new(CanFrameHandler {
            bus_name: self.bus.name().to_owned(),
            dispatcher,
            devices: self.devices.clone(),
        });
        self.bus.init(handler)
    }

    /// Name of the bus.
    pub fn name(&self) -> &str {
        self.bus.name()
    }

    /// Get a cloneable sending handle onto this bus.
    pub fn handle(&self) -> BusHandle<CanMessage> {
        self.bus.handle()
    }

    /// Copy a message to the outgoing queue.
    pub fn send(&self, msg: CanMessage) {
        self.bus.send(msg);
    }

    /// Enqueue a broadcast SYNC frame.
    pub fn send_sync(&self) {
        self.bus.send(CanMessage::new(cob::SYNC));
    }

    /// Push a SYNC frame while the caller holds the queue lock, typically
    /// one returned by [`wait_for_empty_queue`](Self::wait_for_empty_queue).
    /// Used by [`CanBusManager::send_sync_on_all_buses`](crate::CanBusManager::send_sync_on_all_buses).
    pub fn send_sync_without_lock(&self, queue: &mut VecDeque<CanMessage>) {
        self.bus.send_locked(queue, CanMessage::new(cob::SYNC));
    }

    /// Block until the outgoing queue is empty and return the held lock.
    pub fn wait_for_empty_queue(&self) -> MutexGuard<'_, VecDeque<CanMessage>> {
        self.bus.wait_for_empty_queue()
    }

    /// All devices attached to this bus.
    pub fn devices(&self) -> &[Arc<dyn Device>] {
        &self.devices
    }

    /// Force every device's state machine back to its initial state and
    /// send the appropriate restart commands.
    pub fn reset_all_devices(&self) {
        for device in &self.devices {
            device.reset_device();
        }
    }

    /// Activate the bus: outgoing frames are written to the transport again.
    pub fn activate(&self) {
        self.bus.activate();
    }

    /// Passivate the bus: outgoing frames are consumed without being
    /// written.
    pub fn passivate(&self) {
        self.bus.passivate();
    }

    /// True if the bus is in passive state.
    pub fn is_passive(&self) -> bool {
        self.bus.is_passive()
    }

    /// True if a device timed out or the transport reported an error.
    pub fn is_missing_device_or_has_error(&self) -> bool {
        self.bus.is_missing_device_or_has_error()
    }

    /// True if every device passed its last sanity check.
    pub fn all_devices_active(&self) -> bool {
        self.bus.all_devices_active()
    }

    /// True if the bus runs its own worker threads.
    pub fn is_asynchronous(&self) -> bool {
        self.bus.is_asynchronous()
    }

    /// The transport's pollable file descriptor, if it has one.
    pub fn pollable_fd(&self) -> Option<std::os::fd::RawFd> {
        self.bus.pollable_fd()
    }

    /// Read and dispatch one message (synchronous mode).
    pub fn read_message(&self) -> bool {
        self.bus.read_message()
    }

    /// Write the frame at the head of the queue (synchronous mode); see
    /// [`Bus::write_message`].
    pub fn write_message(&self) -> Result<bool, WriteError> {
        self.bus.write_message()
    }

    /// Run one sanity pass over all devices, updating the bus health flags.
    pub fn sanity_check(&self) {
        self.bus.sanity_check();
    }

    /// Stop the worker threads, optionally waiting for them to terminate.
    pub fn stop_threads(&mut self, wait: bool) {
        self.bus.stop_threads(wait);
    }
}
