//! The base device contract

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};

use multican_common::{CanMessage, NodeId};

use crate::bus::BusHandle;
use crate::dispatch::{Dispatcher, FrameMatcher, ParseCallback, RegisterError};
use crate::options::DeviceOptions;

/// State shared by every device: its options, the timeout counter driving
/// the liveness check, and the backreference to the bus it is attached to.
///
/// All fields are atomics or set-once, so devices expose `&self` methods and
/// can be shared between the receive thread (parse callbacks), the sanity
/// thread and application threads without locking.
#[derive(Debug)]
pub struct DeviceState {
    options: DeviceOptions,
    /// Reset by inbound frames attributed to this device, incremented by the
    /// sanity check, so the counter's clock is the sanity interval
    timeout_counter: AtomicU32,
    bus: OnceLock<BusHandle<CanMessage>>,
}

impl DeviceState {
    /// Create the state for a not-yet-attached device.
    pub fn new(options: DeviceOptions) -> Self {
        Self {
            options,
            timeout_counter: AtomicU32::new(0),
            bus: OnceLock::new(),
        }
    }

    /// The device's node id.
    pub fn node_id(&self) -> NodeId {
        self.options.node_id
    }

    /// The device's name.
    pub fn name(&self) -> &str {
        &self.options.name
    }

    /// The options the device was created with.
    pub fn options(&self) -> &DeviceOptions {
        &self.options
    }

    /// Handle of the bus the device is attached to, `None` before
    /// [`CanBus::add_device`](crate::CanBus::add_device) ran.
    pub fn bus(&self) -> Option<&BusHandle<CanMessage>> {
        self.bus.get()
    }

    /// Send a frame on the attached bus. Logs and drops the frame if the
    /// device was never attached.
    pub fn send(&self, msg: CanMessage) {
        match self.bus.get() {
            Some(bus) => bus.send(msg),
            None => log::error!("device {} is not attached to a bus", self.name()),
        }
    }

    /// Mark the device alive; called by dispatch whenever a frame was parsed
    /// by one of the device's callbacks.
    pub fn reset_timeout_counter(&self) {
        self.timeout_counter.store(0, Ordering::Relaxed);
    }

    /// Current value of the timeout counter, for diagnostics.
    pub fn timeout_counter(&self) -> u32 {
        self.timeout_counter.load(Ordering::Relaxed)
    }

    /// Tick and test the timeout counter. Returns false once the device has
    /// been silent for more than `max_device_timeout_counter` ticks; a limit
    /// of 0 disables the check.
    pub fn check_timeout(&self) -> bool {
        let max = self.options.max_device_timeout_counter;
        if max == 0 {
            return true;
        }
        self.timeout_counter.fetch_add(1, Ordering::Relaxed) <= max
    }

    pub(crate) fn attach(&self, bus: BusHandle<CanMessage>) -> bool {
        self.bus.set(bus).is_ok()
    }
}

/// A logical endpoint living on a bus.
///
/// Implementations are attached with
/// [`CanBus::add_device`](crate::CanBus::add_device), which calls
/// [`init_device`](Self::init_device) exactly once after wiring the bus
/// backreference. Devices are shared as `Arc`s between the bus and the
/// application, so all methods take `&self`; mutable device state belongs in
/// atomics or mutexes (see [`DeviceState`]).
pub trait Device: Send + Sync + 'static {
    /// The shared base state of the device.
    fn state(&self) -> &DeviceState;

    /// Register parse callbacks and send initial commands. Called once by
    /// `add_device`.
    fn init_device(self: Arc<Self>, reg: &mut DeviceRegistry<'_>) -> Result<(), RegisterError>;

    /// Periodic health check, called once per bus sanity tick. The default
    /// checks the device timeout counter.
    fn sanity_check(&self) -> bool {
        self.state().check_timeout()
    }

    /// Force the device's state machine back to its initial state and send
    /// the appropriate restart command. Called by
    /// [`CanBus::reset_all_devices`](crate::CanBus::reset_all_devices).
    fn reset_device(&self) {}
}

/// Registration facade handed to [`Device::init_device`].
///
/// Callbacks registered through the `*_device_message` methods are
/// attributed to the device being initialized: a successful parse resets its
/// timeout counter.
pub struct DeviceRegistry<'a> {
    pub(crate) dispatcher: &'a mut Dispatcher,
    pub(crate) bus: &'a BusHandle<CanMessage>,
    pub(crate) device: Arc<dyn Device>,
}

impl DeviceRegistry<'_> {
    /// Register a device-attributed callback for one frame identifier.
    pub fn add_device_message(
        &mut self,
        id: u32,
        callback: impl Fn(&CanMessage) -> bool + Send + Sync + 'static,
    ) -> Result<(), RegisterError> {
        self.add_device_message_masked(FrameMatcher::exact(id), callback)
    }

    /// Register a device-attributed callback for a masked identifier range.
    pub fn add_device_message_masked(
        &mut self,
        matcher: FrameMatcher,
        callback: impl Fn(&CanMessage) -> bool + Send + Sync + 'static,
    ) -> Result<(), RegisterError> {
        self.dispatcher.register(
            matcher,
            Some(self.device.clone()),
            Box::new(callback) as ParseCallback,
        )
    }

    /// Register a callback that is not attributed to the device: parses do
    /// not touch the timeout counter.
    pub fn add_message(
        &mut self,
        id: u32,
        callback: impl Fn(&CanMessage) -> bool + Send + Sync + 'static,
    ) -> Result<(), RegisterError> {
        self.dispatcher.register(
            FrameMatcher::exact(id),
            None,
            Box::new(callback) as ParseCallback,
        )
    }

    /// Handle of the bus the device is being attached to.
    pub fn bus(&self) -> &BusHandle<CanMessage> {
        self.bus
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(max: u32) -> DeviceState {
        let mut options = DeviceOptions::new(NodeId::new(1).unwrap(), "dev");
        options.max_device_timeout_counter = max;
        DeviceState::new(options)
    }

    #[test]
    fn test_timeout_counter_disabled() {
        let state = state(0);
        for _ in 0..100 {
            assert!(state.check_timeout());
        }
    }

    #[test]
    fn test_timeout_counter_expires() {
        let state = state(3);
        // Ticks 1..=4 see counter values 0..=3, all within the limit
        for _ in 0..4 {
            assert!(state.check_timeout());
        }
        assert!(!state.check_timeout());
    }

    #[test]
    fn test_timeout_counter_reset_restores_health() {
        let state = state(2);
        for _ in 0..5 {
            state.check_timeout();
        }
        assert!(!state.check_timeout());
        state.reset_timeout_counter();
        assert!(state.check_timeout());
    }
}
