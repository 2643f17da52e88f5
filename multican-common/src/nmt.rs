//! Definitions for the NMT protocol

use crate::constants::cob;
use crate::messages::CanMessage;
use crate::node_id::NodeId;

/// NMT states tracked for a remote node
///
/// `Missing` is a local bookkeeping state entered when a node that advertises
/// a heartbeat stops producing one. It has no wire representation.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum NmtState {
    /// Node is booting or was commanded to reset
    Initializing = 0,
    /// Node has been stopped
    Stopped = 1,
    /// Node is awaiting the command to enter operation
    PreOperational = 2,
    /// Normal operational state
    Operational = 3,
    /// No life sign from the node within the configured timeout
    Missing = 4,
}

impl NmtState {
    /// Map the state byte of a heartbeat frame to an NMT state.
    ///
    /// `0x00` is the boot-up message a node emits once after reset.
    pub fn from_heartbeat_byte(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(NmtState::Initializing),
            0x04 => Some(NmtState::Stopped),
            0x05 => Some(NmtState::Operational),
            0x7F => Some(NmtState::PreOperational),
            _ => None,
        }
    }
}

impl core::fmt::Display for NmtState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            NmtState::Initializing => write!(f, "Initializing"),
            NmtState::Stopped => write!(f, "Stopped"),
            NmtState::PreOperational => write!(f, "PreOperational"),
            NmtState::Operational => write!(f, "Operational"),
            NmtState::Missing => write!(f, "Missing"),
        }
    }
}

/// An error for [`NmtState::try_from()`]
#[derive(Clone, Copy, Debug)]
pub struct InvalidNmtStateError(pub u8);

impl TryFrom<u8> for NmtState {
    type Error = InvalidNmtStateError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use NmtState::*;
        match value {
            x if x == Initializing as u8 => Ok(Initializing),
            x if x == Stopped as u8 => Ok(Stopped),
            x if x == PreOperational as u8 => Ok(PreOperational),
            x if x == Operational as u8 => Ok(Operational),
            x if x == Missing as u8 => Ok(Missing),
            _ => Err(InvalidNmtStateError(value)),
        }
    }
}

/// NMT command specifiers sent by the host to control a node's state machine
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum NmtCommand {
    /// Start the remote node (enter Operational)
    Start = 0x01,
    /// Stop the remote node
    Stop = 0x02,
    /// Put the remote node into PreOperational
    EnterPreOperational = 0x80,
    /// Reset the remote node's application
    ResetNode = 0x81,
    /// Reset the remote node's communication layer
    ResetCommunication = 0x82,
}

impl NmtCommand {
    /// Build the NMT command frame addressed to `node`.
    pub fn to_frame(self, node: NodeId) -> CanMessage {
        CanMessage::with_data(cob::NMT, &[self as u8, node.raw()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heartbeat_byte_map() {
        assert_eq!(
            Some(NmtState::Initializing),
            NmtState::from_heartbeat_byte(0x00)
        );
        assert_eq!(Some(NmtState::Stopped), NmtState::from_heartbeat_byte(0x04));
        assert_eq!(
            Some(NmtState::Operational),
            NmtState::from_heartbeat_byte(0x05)
        );
        assert_eq!(
            Some(NmtState::PreOperational),
            NmtState::from_heartbeat_byte(0x7F)
        );
        assert_eq!(None, NmtState::from_heartbeat_byte(0x42));
    }

    #[test]
    fn test_command_frame() {
        let node = NodeId::new(12).unwrap();
        let frame = NmtCommand::Start.to_frame(node);
        assert_eq!(0x000, frame.id());
        assert_eq!(&[0x01, 12], frame.data());
    }
}
