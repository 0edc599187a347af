//! SETUP packets
//!
//! Request codes and feature selectors come from `usb_device::control::Request`.

use usb_device::{
    control::{Recipient, RequestType},
    UsbDirection,
};

pub use usb_device::control::Request;

/// An 8-byte SETUP packet
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SetupPacket {
    pub direction: UsbDirection,
    pub request_type: RequestType,
    pub recipient: Recipient,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl SetupPacket {
    /// Size of a SETUP packet on the wire
    pub const LEN: usize = 8;

    /// Decode a SETUP packet
    ///
    /// Every bit pattern decodes. Reserved types and recipients are
    /// preserved as `Reserved`, and are rejected during dispatch.
    pub fn from_bytes(bytes: [u8; Self::LEN]) -> Self {
        let bm_request_type = bytes[0];
        SetupPacket {
            direction: UsbDirection::from(bm_request_type),
            request_type: match (bm_request_type >> 5) & 0b11 {
                0 => RequestType::Standard,
                1 => RequestType::Class,
                2 => RequestType::Vendor,
                _ => RequestType::Reserved,
            },
            recipient: match bm_request_type & 0b1_1111 {
                0 => Recipient::Device,
                1 => Recipient::Interface,
                2 => Recipient::Endpoint,
                3 => Recipient::Other,
                _ => Recipient::Reserved,
            },
            request: bytes[1],
            value: u16::from_le_bytes([bytes[2], bytes[3]]),
            index: u16::from_le_bytes([bytes[4], bytes[5]]),
            length: u16::from_le_bytes([bytes[6], bytes[7]]),
        }
    }

    /// Encode the packet as it appears on the wire
    ///
    /// A `Reserved` recipient encodes as the first reserved value, 4.
    pub fn to_bytes(&self) -> [u8; Self::LEN] {
        let recipient = match self.recipient {
            Recipient::Device => 0,
            Recipient::Interface => 1,
            Recipient::Endpoint => 2,
            Recipient::Other => 3,
            Recipient::Reserved => 4,
        };
        let request_type = match self.request_type {
            RequestType::Standard => 0,
            RequestType::Class => 1,
            RequestType::Vendor => 2,
            RequestType::Reserved => 3,
        };
        let value = self.value.to_le_bytes();
        let index = self.index.to_le_bytes();
        let length = self.length.to_le_bytes();
        [
            self.direction as u8 | request_type << 5 | recipient,
            self.request,
            value[0],
            value[1],
            index[0],
            index[1],
            length[0],
            length[1],
        ]
    }

    /// Returns `(descriptor type, descriptor index)` from `wValue`
    pub fn descriptor_type_index(&self) -> (u8, u8) {
        ((self.value >> 8) as u8, self.value as u8)
    }

    /// Returns `true` if the request expects a data stage
    pub fn has_data(&self) -> bool {
        self.length > 0
    }
}
