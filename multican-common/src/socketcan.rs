//! A blocking SocketCAN driver
//!
//! Reads use a short kernel timeout so the receive loop can observe shutdown
//! between calls; see [`BusDriver::receive`].

use std::os::fd::{AsRawFd, RawFd};
use std::sync::OnceLock;
use std::time::Duration;

use socketcan::{CanFrame, CanSocket, EmbeddedFrame, Frame, ShouldRetry, Socket, SocketOptions};

use crate::messages::{CanMessage, EXTENDED_ID_FLAG};
use crate::traits::{BusDriver, DriverError, OpenSnafu, ReadSnafu, RxEvent, WriteSnafu};

const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(50);

fn socketcan_id_to_raw(id: socketcan::CanId) -> u32 {
    match id {
        socketcan::CanId::Standard(id) => id.as_raw() as u32,
        socketcan::CanId::Extended(id) => id.as_raw() | EXTENDED_ID_FLAG,
    }
}

fn raw_id_to_socketcan(id: u32) -> socketcan::CanId {
    if id & EXTENDED_ID_FLAG != 0 {
        socketcan::ExtendedId::new(id & 0x1FFF_FFFF).unwrap().into()
    } else {
        socketcan::StandardId::new((id & 0x7FF) as u16)
            .unwrap()
            .into()
    }
}

/// A [`BusDriver`] backed by a Linux SocketCAN interface.
#[derive(Debug)]
pub struct SocketCanDriver {
    interface: String,
    loopback: bool,
    read_timeout: Duration,
    socket: OnceLock<CanSocket>,
}

impl SocketCanDriver {
    /// Create a driver for the named interface, e.g. "can0" or "vcan0".
    pub fn new<S: Into<String>>(interface: S) -> Self {
        Self {
            interface: interface.into(),
            loopback: false,
            read_timeout: DEFAULT_READ_TIMEOUT,
            socket: OnceLock::new(),
        }
    }

    /// Enable or disable reception of frames sent on this same socket.
    pub fn with_loopback(mut self, loopback: bool) -> Self {
        self.loopback = loopback;
        self
    }

    /// Override the kernel read timeout used to keep the receive loop
    /// responsive to shutdown.
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    fn socket(&self) -> Result<&CanSocket, DriverError> {
        self.socket.get().ok_or(DriverError::NotInitialized)
    }
}

impl BusDriver<CanMessage> for SocketCanDriver {
    fn initialize(&self) -> Result<(), DriverError> {
        let open = |message: std::io::Error| OpenSnafu {
            message: message.to_string(),
        };
        let socket = CanSocket::open(&self.interface).map_err(|e| open(e).build())?;
        socket
            .set_read_timeout(self.read_timeout)
            .map_err(|e| open(e).build())?;
        socket
            .set_loopback(self.loopback)
            .map_err(|e| open(e).build())?;
        if self.loopback {
            socket
                .set_recv_own_msgs(true)
                .map_err(|e| open(e).build())?;
        }
        self.socket.set(socket).ok();
        Ok(())
    }

    fn receive(&self) -> Result<RxEvent<CanMessage>, DriverError> {
        match self.socket()?.read_frame() {
            Ok(CanFrame::Data(frame)) => Ok(RxEvent::Frame(CanMessage::with_data(
                socketcan_id_to_raw(frame.can_id()),
                frame.data(),
            ))),
            // Remote frames carry no payload and are not routed by this runtime
            Ok(CanFrame::Remote(_)) => Ok(RxEvent::Idle),
            Ok(CanFrame::Error(frame)) => {
                Ok(RxEvent::BusError(CanMessage::new(frame.raw_id())))
            }
            Err(e) if e.should_retry() => Ok(RxEvent::Idle),
            Err(e) => ReadSnafu {
                message: e.to_string(),
            }
            .fail(),
        }
    }

    fn transmit(&self, msg: &CanMessage) -> Result<(), DriverError> {
        let id = raw_id_to_socketcan(msg.id());
        let frame = CanFrame::new(id, msg.data()).unwrap();
        self.socket()?
            .write_frame(&frame)
            .map_err(|e| {
                WriteSnafu {
                    message: e.to_string(),
                }
                .build()
            })
    }

    fn pollable_fd(&self) -> Option<RawFd> {
        self.socket.get().map(|s| s.as_raw_fd())
    }
}
