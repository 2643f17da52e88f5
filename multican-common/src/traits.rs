//! The transport driver contract consumed by the bus engine

use std::os::fd::RawFd;

use snafu::Snafu;

/// The outcome of one blocking read on a transport
#[derive(Debug, Clone)]
pub enum RxEvent<M> {
    /// A frame was received
    Frame(M),
    /// The transport reported an error frame; the payload is the raw frame
    /// for diagnostic logging
    BusError(M),
    /// The read timed out without delivering a frame
    Idle,
}

/// Errors surfaced by transport drivers
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum DriverError {
    /// Opening or configuring the interface failed
    #[snafu(display("failed to open interface: {message}"))]
    Open {
        /// Description of the underlying failure
        message: String,
    },
    /// The driver was used before [`BusDriver::initialize`] succeeded
    #[snafu(display("interface is not initialized"))]
    NotInitialized,
    /// A read failed
    #[snafu(display("read failed: {message}"))]
    Read {
        /// Description of the underlying failure
        message: String,
    },
    /// A write failed
    #[snafu(display("write failed: {message}"))]
    Write {
        /// Description of the underlying failure
        message: String,
    },
}

/// A transport driver for one bus, carrying messages of type `M`.
///
/// The engine calls [`receive`](Self::receive) in a tight loop on the receive
/// thread and [`transmit`](Self::transmit) from the transmit thread, so both
/// must be callable concurrently. `receive` may block, but must return
/// ([`RxEvent::Idle`] is fine) often enough for a shutdown request to be
/// observed between calls; drivers built on kernel sockets typically arrange
/// this with a read timeout of some tens of milliseconds.
pub trait BusDriver<M>: Send + Sync {
    /// Open and configure the underlying interface.
    ///
    /// Called exactly once, before any `receive` or `transmit`.
    fn initialize(&self) -> Result<(), DriverError>;

    /// Wait for one inbound frame.
    fn receive(&self) -> Result<RxEvent<M>, DriverError>;

    /// Transmit one frame.
    fn transmit(&self, msg: &M) -> Result<(), DriverError>;

    /// A file descriptor that can be polled for readability, for managers
    /// running a unified event loop. `None` if the transport has none.
    fn pollable_fd(&self) -> Option<RawFd> {
        None
    }
}
