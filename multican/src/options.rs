//! Option structs for buses and devices
//!
//! All option structs deserialize from TOML with sensible defaults, so an
//! application can keep its bus layout in a config file. A counter or
//! interval value of `0` universally means "feature disabled".

use std::time::Duration;

use multican_common::NodeId;
use serde::Deserialize;

fn default_true() -> bool {
    true
}

fn default_max_queue_size() -> usize {
    1000
}

fn default_sanity_check_interval_ms() -> u64 {
    100
}

/// Options controlling a single bus
#[derive(Debug, Clone, Deserialize)]
pub struct BusOptions {
    /// Human-readable name of the bus, used in log messages
    pub name: String,

    /// Whether the bus runs its own receive/transmit/sanity threads. When
    /// false, the application drives I/O through
    /// [`read_message`](crate::CanBus::read_message) and
    /// [`write_message`](crate::CanBus::write_message).
    #[serde(default = "default_true")]
    pub asynchronous: bool,

    /// Start the bus in passive state: outgoing frames are consumed from the
    /// queue without being written to the transport
    #[serde(default)]
    pub start_passive: bool,

    /// Leave passive state automatically when the first frame is received
    #[serde(default)]
    pub activate_bus_on_reception: bool,

    /// Ask the transport to deliver frames sent on this same interface
    #[serde(default)]
    pub loopback: bool,

    /// Soft cap on the outgoing queue. Pushes beyond this size still succeed
    /// but emit a rate-limited warning.
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,

    /// Interval of the sanity check thread in milliseconds. 0 disables the
    /// thread; device timeouts are then never ticked unless the application
    /// calls [`sanity_check`](crate::CanBus::sanity_check) itself.
    #[serde(default = "default_sanity_check_interval_ms")]
    pub sanity_check_interval_ms: u64,

    /// SCHED_FIFO priority for the receive thread; 0 keeps the inherited
    /// scheduling policy
    #[serde(default)]
    pub priority_receive_thread: i32,

    /// SCHED_FIFO priority for the transmit thread; 0 keeps the inherited
    /// scheduling policy
    #[serde(default)]
    pub priority_transmit_thread: i32,

    /// SCHED_FIFO priority for the sanity check thread; 0 keeps the
    /// inherited scheduling policy
    #[serde(default)]
    pub priority_sanity_thread: i32,
}

impl BusOptions {
    /// Create options with defaults for the named bus.
    pub fn named<S: Into<String>>(name: S) -> Self {
        Self {
            name: name.into(),
            asynchronous: true,
            start_passive: false,
            activate_bus_on_reception: false,
            loopback: false,
            max_queue_size: default_max_queue_size(),
            sanity_check_interval_ms: default_sanity_check_interval_ms(),
            priority_receive_thread: 0,
            priority_transmit_thread: 0,
            priority_sanity_thread: 0,
        }
    }

    /// The sanity check interval as a [`Duration`]; `None` when disabled.
    pub fn sanity_check_interval(&self) -> Option<Duration> {
        (self.sanity_check_interval_ms > 0)
            .then(|| Duration::from_millis(self.sanity_check_interval_ms))
    }
}

fn default_device_timeout_counter() -> u32 {
    20
}

/// Options shared by every device
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceOptions {
    /// CAN node id of the device
    pub node_id: NodeId,

    /// Human-readable name of the device, used in log messages
    pub name: String,

    /// Counter limit at which the device is considered timed out. The
    /// counter increments once per sanity tick and resets on every inbound
    /// frame attributed to the device, so the limit is
    /// `timeout [s] * sanity rate [Hz]`. 0 disables the check.
    #[serde(default = "default_device_timeout_counter")]
    pub max_device_timeout_counter: u32,
}

impl DeviceOptions {
    /// Create options with defaults for the given node.
    pub fn new<S: Into<String>>(node_id: NodeId, name: S) -> Self {
        Self {
            node_id,
            name: name.into(),
            max_device_timeout_counter: default_device_timeout_counter(),
        }
    }
}

fn default_sdo_timeout_counter() -> u32 {
    1
}

fn default_sdo_sent_counter() -> u32 {
    10
}

/// Options for a CANopen device
#[derive(Debug, Clone, Deserialize)]
pub struct CanOpenOptions {
    /// Base device options
    #[serde(flatten)]
    pub device: DeviceOptions,

    /// Counter limit at which a pending SDO request is considered timed out,
    /// in sanity ticks. 0 disables SDO supervision.
    #[serde(default = "default_sdo_timeout_counter")]
    pub max_sdo_timeout_counter: u32,

    /// Total number of transmission attempts for an SDO request before it is
    /// dropped
    #[serde(default = "default_sdo_sent_counter")]
    pub max_sdo_sent_counter: u32,

    /// Heartbeat interval produced by the device in milliseconds. When 0 the
    /// device advertises no heartbeat: commanded NMT transitions take effect
    /// locally right away and no Missing detection is performed.
    #[serde(default)]
    pub producer_heartbeat_time_ms: u16,
}

impl CanOpenOptions {
    /// Create options with defaults for the given node.
    pub fn new<S: Into<String>>(node_id: NodeId, name: S) -> Self {
        Self {
            device: DeviceOptions::new(node_id, name),
            max_sdo_timeout_counter: default_sdo_timeout_counter(),
            max_sdo_sent_counter: default_sdo_sent_counter(),
            producer_heartbeat_time_ms: 0,
        }
    }

    /// Derive `max_sdo_timeout_counter` from a wall-clock timeout and the
    /// bus's sanity check interval.
    pub fn set_sdo_timeout(&mut self, timeout: Duration, sanity_check_interval: Duration) {
        self.max_sdo_timeout_counter =
            (timeout.as_secs_f64() / sanity_check_interval.as_secs_f64()).ceil() as u32;
    }
}
