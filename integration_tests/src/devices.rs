//! Device fixtures shared by the end-to-end tests

use std::sync::{Arc, Mutex};

use multican_common::CanMessage;
use multican::{
    CanOpenDevice, CanOpenOptions, CanOpenState, Device, DeviceOptions, DeviceRegistry,
    DeviceState, RegisterError,
};

/// A plain device recording every frame its callback parses.
pub struct RecordingDevice {
    state: DeviceState,
    rx_id: u32,
    /// Frames delivered to the device's parse callback
    pub frames: Mutex<Vec<CanMessage>>,
}

impl RecordingDevice {
    /// Create a device whose single callback listens on `rx_id`.
    pub fn new(options: DeviceOptions, rx_id: u32) -> Arc<Self> {
        Arc::new(Self {
            state: DeviceState::new(options),
            rx_id,
            frames: Mutex::new(Vec::new()),
        })
    }

    pub fn received(&self) -> Vec<CanMessage> {
        self.frames.lock().unwrap().clone()
    }
}

impl Device for RecordingDevice {
    fn state(&self) -> &DeviceState {
        &self.state
    }

    fn init_device(self: Arc<Self>, reg: &mut DeviceRegistry<'_>) -> Result<(), RegisterError> {
        let id = self.rx_id;
        let dev = self.clone();
        reg.add_device_message(id, move |msg| {
            dev.frames.lock().unwrap().push(*msg);
            true
        })
    }
}

/// A CANopen device recording the SDO read answers it is handed.
pub struct CanOpenProbe {
    canopen: CanOpenState,
    /// (index, sub, data) of every answered SDO read request
    pub read_answers: Mutex<Vec<(u16, u8, [u8; 4])>>,
}

impl CanOpenProbe {
    pub fn new(options: CanOpenOptions) -> Arc<Self> {
        Arc::new(Self {
            canopen: CanOpenState::new(options),
            read_answers: Mutex::new(Vec::new()),
        })
    }
}

impl CanOpenDevice for CanOpenProbe {
    fn canopen(&self) -> &CanOpenState {
        &self.canopen
    }

    fn handle_read_sdo_answer(&self, index: u16, sub: u8, data: &[u8; 4]) {
        self.read_answers.lock().unwrap().push((index, sub, *data));
    }
}
