//! Shared fixtures for the multican end-to-end tests

pub mod devices;
pub mod sim_driver;

use std::time::{Duration, Instant};

/// Initialize env_logger once per test binary.
pub fn init_test_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Poll `cond` until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    cond()
}

pub mod prelude {
    pub use crate::devices::{CanOpenProbe, RecordingDevice};
    pub use crate::sim_driver::{sim_driver, SimController, SimDriver};
    pub use crate::{init_test_logging, wait_until};
    pub use multican::common::constants::cob;
    pub use multican::common::nmt::NmtState;
    pub use multican::common::sdo::SdoRequest;
    pub use multican::common::{CanMessage, NodeId};
    pub use multican::{
        BusOptions, CanBus, CanBusManager, CanOpenDevice, CanOpenOptions, CanOpenState, Device,
        DeviceOptions, FrameMatcher,
    };
}
