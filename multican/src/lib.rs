//! A multi-bus device-communication runtime for field-bus style transports.
//!
//! The runtime lets an application attach multiple physical or virtual
//! transport interfaces, register logical devices living on each interface,
//! dispatch inbound frames to per-device parse callbacks selected by masked
//! frame-identifier matching, queue outbound frames with bounded
//! backpressure, and supervise liveness with per-device and per-bus sanity
//! checks.
//!
//! The building blocks:
//!
//! - [`Bus`]: the transport-agnostic engine with its receive, transmit and
//!   sanity worker threads (or a caller-driven synchronous mode)
//! - [`CanBus`]: the CAN flavor, adding the COB-ID dispatch table and the
//!   device container
//! - [`Device`] / [`CanOpenDevice`]: the device contracts; CANopen devices
//!   get NMT state tracking, heartbeat liveness and a supervised SDO
//!   request queue
//! - [`CanBusManager`]: process-wide registry with coordinated SYNC
//!   broadcast and helpers for synchronous buses
//!
//! Transports implement [`common::traits::BusDriver`]; a blocking SocketCAN
//! driver ships behind the `socketcan` feature.
#![warn(missing_docs)]

pub mod bus;
pub mod canopen;
pub mod device;
pub mod dispatch;
pub mod manager;
pub mod options;

mod can_bus;

pub use bus::{Bus, BusHandle, FrameHandler, InitError, WriteError};
pub use can_bus::CanBus;
pub use canopen::{register_standard_messages, CanOpenDevice, CanOpenState};
pub use device::{Device, DeviceRegistry, DeviceState};
pub use dispatch::{FrameMatcher, RegisterError};
pub use manager::CanBusManager;
pub use options::{BusOptions, CanOpenOptions, DeviceOptions};

pub use multican_common as common;

#[cfg(feature = "socketcan")]
pub use multican_common::SocketCanDriver;
