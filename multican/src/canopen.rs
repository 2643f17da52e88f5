//! The CANopen master-side device layer: NMT state tracking, the SDO
//! request/response protocol with in-order queueing and bounded retries, and
//! heartbeat-driven liveness.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, error, warn};
use multican_common::constants::cob;
use multican_common::nmt::{NmtCommand, NmtState};
use multican_common::sdo::{abort_code_description, SdoRequest, SdoResponse};
use multican_common::CanMessage;

use crate::device::{Device, DeviceRegistry, DeviceState};
use crate::dispatch::RegisterError;
use crate::options::CanOpenOptions;

/// Shared state of a CANopen device.
///
/// Embedded by concrete device types; all methods take `&self`, mirroring
/// [`DeviceState`]. The NMT state and the SDO retry counters are atomics.
/// The SDO queue has its own mutex because requests are queued from
/// application threads while responses arrive on the receive thread.
#[derive(Debug)]
pub struct CanOpenState {
    device: DeviceState,
    max_sdo_timeout_counter: u32,
    max_sdo_sent_counter: u32,
    producer_heartbeat_time_ms: u16,
    nmt_state: AtomicU8,
    sdo_timeout_counter: AtomicU32,
    sdo_sent_counter: AtomicU32,
    sdo_queue: Mutex<VecDeque<SdoRequest>>,
}

impl CanOpenState {
    /// Create the state for a not-yet-attached CANopen device.
    pub fn new(options: CanOpenOptions) -> Self {
        Self {
            device: DeviceState::new(options.device),
            max_sdo_timeout_counter: options.max_sdo_timeout_counter,
            max_sdo_sent_counter: options.max_sdo_sent_counter,
            producer_heartbeat_time_ms: options.producer_heartbeat_time_ms,
            nmt_state: AtomicU8::new(NmtState::Initializing as u8),
            sdo_timeout_counter: AtomicU32::new(0),
            sdo_sent_counter: AtomicU32::new(0),
            sdo_queue: Mutex::new(VecDeque::new()),
        }
    }

    /// The base device state.
    pub fn device(&self) -> &DeviceState {
        &self.device
    }

    /// The NMT state last observed (or, without a heartbeat producer,
    /// last commanded).
    pub fn nmt_state(&self) -> NmtState {
        NmtState::try_from(self.nmt_state.load(Ordering::Relaxed))
            .unwrap_or(NmtState::Initializing)
    }

    fn set_nmt_state(&self, state: NmtState) {
        self.nmt_state.store(state as u8, Ordering::Relaxed);
    }

    /// True while the device is in the Initializing state.
    pub fn is_initializing(&self) -> bool {
        self.nmt_state() == NmtState::Initializing
    }

    /// True while the device is in the Stopped state.
    pub fn is_stopped(&self) -> bool {
        self.nmt_state() == NmtState::Stopped
    }

    /// True while the device is in the PreOperational state.
    pub fn is_pre_operational(&self) -> bool {
        self.nmt_state() == NmtState::PreOperational
    }

    /// True while the device is in the Operational state.
    pub fn is_operational(&self) -> bool {
        self.nmt_state() == NmtState::Operational
    }

    /// True while the device is considered missing.
    pub fn is_missing(&self) -> bool {
        self.nmt_state() == NmtState::Missing
    }

    /// Number of SDO requests waiting for an answer.
    pub fn pending_sdo_count(&self) -> usize {
        self.sdo_queue.lock().unwrap().len()
    }

    /// Request the PreOperational state. Flushes the SDO queue.
    pub fn set_nmt_enter_pre_operational(&self) {
        self.flush_sdo_queue();
        self.send_nmt_command(NmtCommand::EnterPreOperational, NmtState::PreOperational);
    }

    /// Request the Operational state.
    pub fn set_nmt_start_remote_device(&self) {
        self.send_nmt_command(NmtCommand::Start, NmtState::Operational);
    }

    /// Request the Stopped state.
    pub fn set_nmt_stop_remote_device(&self) {
        self.send_nmt_command(NmtCommand::Stop, NmtState::Stopped);
    }

    /// Request a reset of the device's communication layer. Flushes the SDO
    /// queue.
    pub fn set_nmt_reset_remote_communication(&self) {
        self.flush_sdo_queue();
        self.send_nmt_command(NmtCommand::ResetCommunication, NmtState::Initializing);
    }

    /// Request a full reset of the remote device. Flushes the SDO queue.
    pub fn set_nmt_restart_remote_device(&self) {
        self.flush_sdo_queue();
        self.send_nmt_command(NmtCommand::ResetNode, NmtState::Initializing);
    }

    fn send_nmt_command(&self, command: NmtCommand, target: NmtState) {
        self.device.send(command.to_frame(self.device.node_id()));
        // With a heartbeat producer the next heartbeat is authoritative and
        // the command is only a request
        if self.producer_heartbeat_time_ms == 0 {
            self.set_nmt_state(target);
        }
    }

    /// Force the state machine back to Initializing and command a remote
    /// reset, regardless of heartbeat configuration.
    pub fn reset(&self) {
        self.flush_sdo_queue();
        self.set_nmt_state(NmtState::Initializing);
        self.device
            .send(NmtCommand::ResetNode.to_frame(self.device.node_id()));
    }

    /// Drop all pending SDO requests.
    pub fn flush_sdo_queue(&self) {
        self.sdo_queue.lock().unwrap().clear();
        self.sdo_timeout_counter.store(0, Ordering::Relaxed);
        self.sdo_sent_counter.store(0, Ordering::Relaxed);
    }

    /// Parse a heartbeat frame: adopt the advertised NMT state and mark the
    /// device alive.
    pub fn parse_heartbeat(&self, msg: &CanMessage) -> bool {
        if msg.length() < 1 {
            warn!("device {}: empty heartbeat frame", self.device.name());
            return false;
        }
        let byte = msg.read_u8(0);
        match NmtState::from_heartbeat_byte(byte) {
            Some(state) => {
                let previous = self.nmt_state();
                if previous != state {
                    debug!(
                        "device {}: NMT state {previous} -> {state}",
                        self.device.name()
                    );
                }
                self.set_nmt_state(state);
                self.device.reset_timeout_counter();
                true
            }
            None => {
                warn!(
                    "device {}: unknown heartbeat state byte 0x{byte:02X}",
                    self.device.name()
                );
                false
            }
        }
    }

    /// Append a request to the SDO queue. If no request was pending it is
    /// transmitted right away; otherwise it goes out once its predecessors
    /// are answered or dropped.
    pub fn send_sdo(&self, request: SdoRequest) {
        let mut queue = self.sdo_queue.lock().unwrap();
        queue.push_back(request);
        if queue.len() == 1 {
            self.sdo_sent_counter.store(1, Ordering::Relaxed);
            self.sdo_timeout_counter.store(0, Ordering::Relaxed);
            self.device.send(request.to_frame());
        }
    }

    /// Supervise the request at the head of the SDO queue. Called once per
    /// sanity tick. After `max_sdo_timeout_counter` silent ticks the head is
    /// retransmitted, up to `max_sdo_sent_counter` total attempts; then it
    /// is dropped and the check reports failure.
    pub fn check_sdo_timeout(&self) -> bool {
        if self.max_sdo_timeout_counter == 0 {
            return true;
        }
        let mut queue = self.sdo_queue.lock().unwrap();
        let Some(head) = queue.front().copied() else {
            return true;
        };
        let elapsed = self.sdo_timeout_counter.fetch_add(1, Ordering::Relaxed) + 1;
        if elapsed < self.max_sdo_timeout_counter {
            return true;
        }
        if self.sdo_sent_counter.load(Ordering::Relaxed) < self.max_sdo_sent_counter {
            self.sdo_sent_counter.fetch_add(1, Ordering::Relaxed);
            self.sdo_timeout_counter.store(0, Ordering::Relaxed);
            self.device.send(head.to_frame());
            true
        } else {
            error!(
                "device {}: SDO request 0x{:04X}.{} went unanswered after {} attempts, dropping it",
                self.device.name(),
                head.index(),
                head.sub(),
                self.max_sdo_sent_counter
            );
            queue.pop_front();
            self.sdo_timeout_counter.store(0, Ordering::Relaxed);
            if let Some(next) = queue.front() {
                self.sdo_sent_counter.store(1, Ordering::Relaxed);
                self.device.send(next.to_frame());
            }
            false
        }
    }

    /// Combined device health: the base timeout check plus SDO supervision.
    /// A silent heartbeat producer transitions to Missing and stays
    /// unhealthy until a heartbeat restores it.
    pub fn sanity_check(&self) -> bool {
        let timeout_ok = self.device.check_timeout();
        if !timeout_ok && self.producer_heartbeat_time_ms > 0 && !self.is_missing() {
            warn!(
                "device {} is missing: no heartbeat within the timeout",
                self.device.name()
            );
            self.set_nmt_state(NmtState::Missing);
        }
        let sdo_ok = self.check_sdo_timeout();
        timeout_ok && sdo_ok
    }
}

/// A CANopen device attached to a [`CanBus`](crate::CanBus).
///
/// Implementors embed a [`CanOpenState`] and get the NMT and SDO protocol
/// machinery for free; every `CanOpenDevice` is a [`Device`] through a
/// blanket implementation. The default [`init_device`](Self::init_device)
/// registers the standard SDO response and heartbeat callbacks and commands
/// a remote restart; override it to add PDO parse callbacks, keeping the
/// call to [`register_standard_messages`].
pub trait CanOpenDevice: Send + Sync + 'static {
    /// The shared CANopen state of the device.
    fn canopen(&self) -> &CanOpenState;

    /// Register parse callbacks and send initial commands.
    fn init_device(self: Arc<Self>, reg: &mut DeviceRegistry<'_>) -> Result<(), RegisterError>
    where
        Self: Sized,
    {
        register_standard_messages(&self, reg)?;
        self.canopen().set_nmt_restart_remote_device();
        Ok(())
    }

    /// Called with the 4 data bytes of every answered SDO read request.
    fn handle_read_sdo_answer(&self, index: u16, sub: u8, data: &[u8; 4]) {
        let _ = (index, sub, data);
    }

    /// Periodic health check; see [`CanOpenState::sanity_check`].
    fn sanity_check(&self) -> bool {
        self.canopen().sanity_check()
    }

    /// Reset handler for [`CanBus::reset_all_devices`](crate::CanBus::reset_all_devices).
    fn reset_device(&self) {
        self.canopen().reset();
    }

    /// Parse an SDO server response.
    ///
    /// A response matching the head of the SDO queue completes that request:
    /// read answers are forwarded to
    /// [`handle_read_sdo_answer`](Self::handle_read_sdo_answer), aborts are
    /// logged, and the next queued request (if any) is transmitted.
    fn parse_sdo_answer(&self, msg: &CanMessage) -> bool {
        let state = self.canopen();
        let response = match SdoResponse::parse(msg) {
            Ok(response) => response,
            Err(e) => {
                debug!("device {}: {e}", state.device().name());
                return false;
            }
        };
        let (index, sub) = response.object();
        let mut read_data = None;
        {
            let mut queue = state.sdo_queue.lock().unwrap();
            let Some(head) = queue.front() else {
                debug!(
                    "device {}: SDO response with no pending request",
                    state.device().name()
                );
                return false;
            };
            let expected_id = cob::SDO_RESPONSE + head.node().raw() as u32;
            if head.index() != index || head.sub() != sub || msg.id() != expected_id {
                debug!(
                    "device {}: SDO response for 0x{index:04X}.{sub} does not match the pending request",
                    state.device().name()
                );
                return false;
            }
            match response {
                SdoResponse::ConfirmDownload { .. } => {}
                SdoResponse::UploadExpedited { data, .. } => read_data = Some(data),
                SdoResponse::Abort { code, .. } => warn!(
                    "device {}: SDO 0x{index:04X}.{sub} aborted: {} (0x{code:08X})",
                    state.device().name(),
                    abort_code_description(code)
                ),
            }
            queue.pop_front();
            if let Some(next) = queue.front() {
                state.sdo_sent_counter.store(1, Ordering::Relaxed);
                state.sdo_timeout_counter.store(0, Ordering::Relaxed);
                state.device.send(next.to_frame());
            }
        }
        // Invoked outside the queue lock so the handler may queue follow-up
        // requests
        if let Some(data) = read_data {
            self.handle_read_sdo_answer(index, sub, &data);
        }
        true
    }
}

/// Register the SDO response and heartbeat callbacks at the device's
/// COB-IDs. Custom [`CanOpenDevice::init_device`] implementations should
/// call this before adding their own registrations.
pub fn register_standard_messages<T: CanOpenDevice>(
    device: &Arc<T>,
    reg: &mut DeviceRegistry<'_>,
) -> Result<(), RegisterError> {
    let node = device.canopen().device().node_id().raw() as u32;
    let dev = device.clone();
    reg.add_device_message(cob::SDO_RESPONSE + node, move |msg| dev.parse_sdo_answer(msg))?;
    let dev = device.clone();
    reg.add_device_message(cob::HEARTBEAT + node, move |msg| {
        dev.canopen().parse_heartbeat(msg)
    })?;
    Ok(())
}

impl<T: CanOpenDevice> Device for T {
    fn state(&self) -> &DeviceState {
        self.canopen().device()
    }

    fn init_device(self: Arc<Self>, reg: &mut DeviceRegistry<'_>) -> Result<(), RegisterError> {
        CanOpenDevice::init_device(self, reg)
    }

    fn sanity_check(&self) -> bool {
        CanOpenDevice::sanity_check(self)
    }

    fn reset_device(&self) {
        CanOpenDevice::reset_device(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::CanOpenOptions;
    use multican_common::NodeId;

    fn state(heartbeat_ms: u16) -> CanOpenState {
        let mut options = CanOpenOptions::new(NodeId::new(5).unwrap(), "dev");
        options.producer_heartbeat_time_ms = heartbeat_ms;
        CanOpenState::new(options)
    }

    #[test]
    fn test_commanded_transition_without_heartbeat_is_immediate() {
        let state = state(0);
        state.set_nmt_start_remote_device();
        assert_eq!(NmtState::Operational, state.nmt_state());
        state.set_nmt_stop_remote_device();
        assert_eq!(NmtState::Stopped, state.nmt_state());
    }

    #[test]
    fn test_commanded_transition_with_heartbeat_waits() {
        let state = state(100);
        state.set_nmt_start_remote_device();
        assert_eq!(NmtState::Initializing, state.nmt_state());
        let heartbeat = CanMessage::with_data(0x705, &[0x05]);
        assert!(state.parse_heartbeat(&heartbeat));
        assert_eq!(NmtState::Operational, state.nmt_state());
    }

    #[test]
    fn test_bootup_heartbeat_enters_initializing() {
        let state = state(100);
        state.parse_heartbeat(&CanMessage::with_data(0x705, &[0x7F]));
        assert_eq!(NmtState::PreOperational, state.nmt_state());
        state.parse_heartbeat(&CanMessage::with_data(0x705, &[0x00]));
        assert_eq!(NmtState::Initializing, state.nmt_state());
    }

    #[test]
    fn test_flush_commands_clear_sdo_queue() {
        let state = state(0);
        let node = state.device().node_id();
        state.send_sdo(SdoRequest::download_u32(node, 0x1017, 0, 100));
        state.send_sdo(SdoRequest::upload(node, 0x1000, 0));
        assert_eq!(2, state.pending_sdo_count());
        state.set_nmt_enter_pre_operational();
        assert_eq!(0, state.pending_sdo_count());
    }
}
