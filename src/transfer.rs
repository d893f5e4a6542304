//! USB transfer vocabulary
//!
//! Transfer types, directions and the SETUP packet. Descriptor chains are
//! produced by [`builder`].

pub(crate) mod builder;

/// USB transfer types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransferType {
    /// Control (async schedule, three stages)
    Control,
    /// Bulk (async schedule)
    Bulk,
    /// Interrupt (periodic schedule)
    Interrupt,
    /// Isochronous (not supported by this driver)
    Isochronous,
}

impl TransferType {
    /// Decode the transfer type bits of an endpoint's `bmAttributes`
    pub const fn from_attributes(bm_attributes: u8) -> Self {
        match bm_attributes & 0x03 {
            0 => Self::Control,
            1 => Self::Isochronous,
            2 => Self::Bulk,
            _ => Self::Interrupt,
        }
    }
}

/// Transfer direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Direction {
    /// Device to host
    In,
    /// Host to device
    Out,
}

impl Direction {
    /// Direction encoded in bit 7 of an endpoint address or `bmRequestType`
    pub const fn from_bit7(value: u8) -> Self {
        if value & 0x80 != 0 {
            Self::In
        } else {
            Self::Out
        }
    }

    /// The other direction
    pub const fn reverse(self) -> Self {
        match self {
            Self::In => Self::Out,
            Self::Out => Self::In,
        }
    }
}

/// Standard request codes
#[allow(missing_docs)]
pub mod request {
    pub const GET_STATUS: u8 = 0x00;
    pub const CLEAR_FEATURE: u8 = 0x01;
    pub const SET_FEATURE: u8 = 0x03;
    pub const SET_ADDRESS: u8 = 0x05;
    pub const GET_DESCRIPTOR: u8 = 0x06;
    pub const SET_CONFIGURATION: u8 = 0x09;

    /// ENDPOINT_HALT feature selector
    pub const FEATURE_ENDPOINT_HALT: u16 = 0x00;

    pub const DESCRIPTOR_DEVICE: u8 = 0x01;
    pub const DESCRIPTOR_CONFIGURATION: u8 = 0x02;
    pub const DESCRIPTOR_STRING: u8 = 0x03;
}

/// USB Setup packet for control transfers
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SetupPacket {
    /// bmRequestType
    pub request_type: u8,
    /// bRequest
    pub request: u8,
    /// wValue
    pub value: u16,
    /// wIndex
    pub index: u16,
    /// wLength
    pub length: u16,
}

impl SetupPacket {
    /// Create GET_DESCRIPTOR request
    pub const fn get_descriptor(desc_type: u8, desc_index: u8, language_id: u16, length: u16) -> Self {
        Self {
            request_type: 0x80, // Device-to-host, standard, device
            request: request::GET_DESCRIPTOR,
            value: ((desc_type as u16) << 8) | (desc_index as u16),
            index: language_id,
            length,
        }
    }

    /// Create SET_ADDRESS request
    pub const fn set_address(address: u8) -> Self {
        Self {
            request_type: 0x00, // Host-to-device, standard, device
            request: request::SET_ADDRESS,
            value: address as u16,
            index: 0,
            length: 0,
        }
    }

    /// Create SET_CONFIGURATION request
    pub const fn set_configuration(configuration: u8) -> Self {
        Self {
            request_type: 0x00, // Host-to-device, standard, device
            request: request::SET_CONFIGURATION,
            value: configuration as u16,
            index: 0,
            length: 0,
        }
    }

    /// Create CLEAR_FEATURE(ENDPOINT_HALT), required after a STALL
    pub const fn clear_endpoint_halt(endpoint_address: u8) -> Self {
        Self {
            request_type: 0x02, // Host-to-device, standard, endpoint
            request: request::CLEAR_FEATURE,
            value: request::FEATURE_ENDPOINT_HALT,
            index: endpoint_address as u16,
            length: 0,
        }
    }

    /// Check if this is an IN transfer
    pub const fn is_in(&self) -> bool {
        (self.request_type & 0x80) != 0
    }

    /// Data stage direction
    pub const fn direction(&self) -> Direction {
        Direction::from_bit7(self.request_type)
    }

    /// Wire encoding (little-endian fields)
    pub const fn to_bytes(&self) -> [u8; 8] {
        let value = self.value.to_le_bytes();
        let index = self.index.to_le_bytes();
        let length = self.length.to_le_bytes();
        [
            self.request_type,
            self.request,
            value[0],
            value[1],
            index[0],
            index[1],
            length[0],
            length[1],
        ]
    }

    /// Decode the wire encoding
    pub const fn from_bytes(bytes: [u8; 8]) -> Self {
        Self {
            request_type: bytes[0],
            request: bytes[1],
            value: u16::from_le_bytes([bytes[2], bytes[3]]),
            index: u16::from_le_bytes([bytes[4], bytes[5]]),
            length: u16::from_le_bytes([bytes[6], bytes[7]]),
        }
    }
}
