//! The expedited SDO frame layer used by the host-side SDO client
//!
//! Only expedited transfers (up to 4 data bytes) are modelled; that is the
//! variant used for device configuration and diagnostics on the buses this
//! runtime targets.

use snafu::Snafu;

use crate::constants::cob;
use crate::messages::CanMessage;
use crate::node_id::NodeId;

/// Command byte for an expedited download of 4 bytes
const CCS_DOWNLOAD_4: u8 = 0x23;
/// Command byte for an expedited download of 2 bytes
const CCS_DOWNLOAD_2: u8 = 0x2B;
/// Command byte for an expedited download of 1 byte
const CCS_DOWNLOAD_1: u8 = 0x2F;
/// Command byte for an upload (read) request
const CCS_UPLOAD: u8 = 0x40;

/// An expedited SDO request addressed to a node's SDO server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SdoRequest {
    node: NodeId,
    command: u8,
    index: u16,
    sub: u8,
    data: [u8; 4],
}

impl SdoRequest {
    fn new(node: NodeId, command: u8, index: u16, sub: u8, data: [u8; 4]) -> Self {
        Self {
            node,
            command,
            index,
            sub,
            data,
        }
    }

    /// Build a request writing a single byte to `index`/`sub`.
    pub fn download_u8(node: NodeId, index: u16, sub: u8, value: u8) -> Self {
        Self::new(node, CCS_DOWNLOAD_1, index, sub, [value, 0, 0, 0])
    }

    /// Build a request writing a little-endian u16 to `index`/`sub`.
    pub fn download_u16(node: NodeId, index: u16, sub: u8, value: u16) -> Self {
        let b = value.to_le_bytes();
        Self::new(node, CCS_DOWNLOAD_2, index, sub, [b[0], b[1], 0, 0])
    }

    /// Build a request writing a little-endian u32 to `index`/`sub`.
    pub fn download_u32(node: NodeId, index: u16, sub: u8, value: u32) -> Self {
        Self::new(node, CCS_DOWNLOAD_4, index, sub, value.to_le_bytes())
    }

    /// Build a request reading the value of `index`/`sub`.
    pub fn upload(node: NodeId, index: u16, sub: u8) -> Self {
        Self::new(node, CCS_UPLOAD, index, sub, [0; 4])
    }

    /// The node the request is addressed to.
    pub fn node(&self) -> NodeId {
        self.node
    }

    /// The object index.
    pub fn index(&self) -> u16 {
        self.index
    }

    /// The object sub-index.
    pub fn sub(&self) -> u8 {
        self.sub
    }

    /// Encode the request as a CAN frame on the node's SDO request COB-ID.
    pub fn to_frame(&self) -> CanMessage {
        let mut msg = CanMessage::new(cob::SDO_REQUEST + self.node.raw() as u32);
        msg.write_u8(self.command, 0);
        msg.write_u16(self.index, 1);
        msg.write_u8(self.sub, 3);
        msg.write_u32(u32::from_le_bytes(self.data), 4);
        msg
    }
}

/// A response from a node's SDO server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdoResponse {
    /// A download (write) request was accepted
    ConfirmDownload {
        /// Echoed object index
        index: u16,
        /// Echoed object sub-index
        sub: u8,
    },
    /// An upload (read) request answered with expedited data
    UploadExpedited {
        /// Echoed object index
        index: u16,
        /// Echoed object sub-index
        sub: u8,
        /// The object value, left-aligned and zero padded
        data: [u8; 4],
    },
    /// The server aborted the transfer
    Abort {
        /// Echoed object index
        index: u16,
        /// Echoed object sub-index
        sub: u8,
        /// The abort reason (see [`abort_code_description`])
        code: u32,
    },
}

/// Error returned when a frame cannot be interpreted as an SDO response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Snafu)]
pub enum SdoParseError {
    /// The frame is shorter than the 8 bytes an SDO response occupies
    #[snafu(display("SDO response frame too short: {length} bytes"))]
    TooShort {
        /// Received payload length
        length: u8,
    },
    /// The command specifier is not one of the known response specifiers
    #[snafu(display("Unknown SDO response specifier 0x{specifier:02X}"))]
    UnknownSpecifier {
        /// The received command byte
        specifier: u8,
    },
}

impl SdoResponse {
    /// Decode an SDO server response frame.
    pub fn parse(frame: &CanMessage) -> Result<Self, SdoParseError> {
        if frame.length() < 8 {
            return TooShortSnafu {
                length: frame.length(),
            }
            .fail();
        }
        let specifier = frame.read_u8(0);
        let index = frame.read_u16(1);
        let sub = frame.read_u8(3);
        // The server command specifier lives in the top three bits
        match specifier >> 5 {
            3 => Ok(SdoResponse::ConfirmDownload { index, sub }),
            2 => Ok(SdoResponse::UploadExpedited {
                index,
                sub,
                data: frame.read_u32(4).to_le_bytes(),
            }),
            4 => Ok(SdoResponse::Abort {
                index,
                sub,
                code: frame.read_u32(4),
            }),
            _ => UnknownSpecifierSnafu { specifier }.fail(),
        }
    }

    /// The echoed object address of the response.
    pub fn object(&self) -> (u16, u8) {
        match *self {
            SdoResponse::ConfirmDownload { index, sub } => (index, sub),
            SdoResponse::UploadExpedited { index, sub, .. } => (index, sub),
            SdoResponse::Abort { index, sub, .. } => (index, sub),
        }
    }
}

/// A human-readable description for the common SDO abort codes.
///
/// Unknown codes get a generic description; the raw value should be logged
/// alongside it.
pub fn abort_code_description(code: u32) -> &'static str {
    match code {
        0x0503_0000 => "toggle bit not alternated",
        0x0504_0000 => "SDO protocol timed out",
        0x0504_0001 => "command specifier not valid",
        0x0601_0000 => "unsupported access to object",
        0x0601_0001 => "attempt to read a write-only object",
        0x0601_0002 => "attempt to write a read-only object",
        0x0602_0000 => "object does not exist",
        0x0607_0010 => "data type does not match",
        0x0609_0011 => "sub-index does not exist",
        0x0609_0030 => "value range exceeded",
        0x0800_0000 => "general error",
        0x0800_0022 => "data cannot be stored in the present device state",
        _ => "unrecognized abort code",
    }
}
