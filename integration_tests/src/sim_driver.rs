//! A simulated transport driver for end-to-end tests
//!
//! The driver half is handed to a bus; the controller half stays with the
//! test to inject inbound frames and observe everything the bus transmits.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use multican_common::traits::{BusDriver, DriverError, RxEvent};
use multican_common::CanMessage;

const RECV_POLL: Duration = Duration::from_millis(2);

#[derive(Default)]
struct SentLog {
    frames: Mutex<Vec<CanMessage>>,
    cond: Condvar,
}

impl SentLog {
    fn push(&self, msg: CanMessage) {
        self.frames.lock().unwrap().push(msg);
        self.cond.notify_all();
    }

    fn wait_for_count(&self, count: usize, timeout: Duration) -> bool {
        let guard = self.frames.lock().unwrap();
        let (guard, result) = self
            .cond
            .wait_timeout_while(guard, timeout, |frames| frames.len() < count)
            .unwrap();
        drop(guard);
        !result.timed_out()
    }
}

#[derive(Default)]
struct Switches {
    fail_writes: AtomicBool,
    fail_init: AtomicBool,
}

/// The driver half of a simulated transport.
pub struct SimDriver {
    inject_rx: Mutex<Receiver<RxEvent<CanMessage>>>,
    sent: Arc<SentLog>,
    switches: Arc<Switches>,
}

/// The test-side controller of a simulated transport.
pub struct SimController {
    inject_tx: Sender<RxEvent<CanMessage>>,
    sent: Arc<SentLog>,
    switches: Arc<Switches>,
}

/// Create a connected driver/controller pair.
pub fn sim_driver() -> (SimDriver, SimController) {
    let (inject_tx, inject_rx) = channel();
    let sent = Arc::new(SentLog::default());
    let switches = Arc::new(Switches::default());
    let driver = SimDriver {
        inject_rx: Mutex::new(inject_rx),
        sent: sent.clone(),
        switches: switches.clone(),
    };
    let controller = SimController {
        inject_tx,
        sent,
        switches,
    };
    (driver, controller)
}

impl BusDriver<CanMessage> for SimDriver {
    fn initialize(&self) -> Result<(), DriverError> {
        if self.switches.fail_init.load(Ordering::Relaxed) {
            return Err(DriverError::Open {
                message: "simulated open failure".into(),
            });
        }
        Ok(())
    }

    fn receive(&self) -> Result<RxEvent<CanMessage>, DriverError> {
        match self.inject_rx.lock().unwrap().recv_timeout(RECV_POLL) {
            Ok(event) => Ok(event),
            Err(RecvTimeoutError::Timeout) => Ok(RxEvent::Idle),
            Err(RecvTimeoutError::Disconnected) => {
                // Controller dropped; stay idle without spinning
                std::thread::sleep(RECV_POLL);
                Ok(RxEvent::Idle)
            }
        }
    }

    fn transmit(&self, msg: &CanMessage) -> Result<(), DriverError> {
        if self.switches.fail_writes.load(Ordering::Relaxed) {
            return Err(DriverError::Write {
                message: "simulated write failure".into(),
            });
        }
        self.sent.push(*msg);
        Ok(())
    }
}

impl SimController {
    /// Deliver a frame to the bus as if received from the medium.
    pub fn inject(&self, msg: CanMessage) {
        self.inject_tx.send(RxEvent::Frame(msg)).unwrap();
    }

    /// Deliver an error frame to the bus.
    pub fn inject_bus_error(&self, msg: CanMessage) {
        self.inject_tx.send(RxEvent::BusError(msg)).unwrap();
    }

    /// Everything the bus transmitted so far.
    pub fn sent(&self) -> Vec<CanMessage> {
        self.sent.frames.lock().unwrap().clone()
    }

    /// Remove and return everything the bus transmitted so far.
    pub fn take_sent(&self) -> Vec<CanMessage> {
        std::mem::take(&mut *self.sent.frames.lock().unwrap())
    }

    /// Block until the bus has transmitted at least `count` frames in total.
    /// Returns false on timeout.
    pub fn wait_for_sent(&self, count: usize, timeout: Duration) -> bool {
        self.sent.wait_for_count(count, timeout)
    }

    /// Make every transmit fail until turned off again.
    pub fn set_fail_writes(&self, fail: bool) {
        self.switches.fail_writes.store(fail, Ordering::Relaxed);
    }

    /// Make `initialize` fail.
    pub fn set_fail_init(&self, fail: bool) {
        self.switches.fail_init.store(fail, Ordering::Relaxed);
    }
}
