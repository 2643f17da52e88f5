//! Common functionality shared among the multican crates.
//!
//! Most users will have no reason to depend on this crate directly, as it is
//! re-exported by the `multican` runtime crate.
#![warn(missing_docs)]

pub mod constants;
pub mod messages;
pub mod nmt;
pub mod node_id;
pub mod sdo;
pub mod traits;

#[cfg(feature = "socketcan")]
mod socketcan;

#[cfg(feature = "socketcan")]
pub use socketcan::SocketCanDriver;

pub use messages::{BusMessage, CanMessage};
pub use node_id::NodeId;
