//! Descriptor repository
//!
//! [`Descriptors`] is the read-only catalog served by GET_DESCRIPTOR. It's
//! built once, before the device is initialized, from
//!
//! - a [`DeviceDescriptor`],
//! - one byte-exact configuration descriptor per configuration, each with its
//!   interface, endpoint and class-specific descriptors concatenated, and
//! - zero or more [`StringSet`]s, one per language.
//!
//! Use a [`ConfigurationWriter`] to produce configuration descriptors, or
//! supply your own bytes.
//!
//! ```
//! use usbd_engine::descriptor::{
//!     ConfigAttributes, ConfigurationWriter, DeviceDescriptor, Descriptors, StringSet,
//! };
//! use usb_device::endpoint::{EndpointAddress, EndpointType};
//! use usb_device::UsbDirection;
//!
//! let mut buffer = [0; 64];
//! let mut writer = ConfigurationWriter::new(&mut buffer, 1, ConfigAttributes::empty(), 100).unwrap();
//! writer.interface(0, 0, 0xFF, 0, 0).unwrap();
//! writer.endpoint(EndpointAddress::from_parts(1, UsbDirection::In), EndpointType::Bulk, 64, 0).unwrap();
//! let configuration = writer.finish();
//!
//! let configurations = [configuration];
//! let strings = [StringSet::new(0x0409, &["Manufacturer", "Product"])];
//! let descriptors = Descriptors::new(
//!     DeviceDescriptor::new(0x1209, 0x0001).manufacturer(1).product(2),
//!     &configurations,
//!     &strings,
//! ).unwrap();
//! assert_eq!(descriptors.device().len(), 18);
//! ```

use usb_device::{
    endpoint::{
        EndpointAddress, EndpointType, IsochronousSynchronizationType, IsochronousUsageType,
    },
    UsbError,
};

/// Standard descriptor types
pub mod descriptor_type {
    pub const DEVICE: u8 = 1;
    pub const CONFIGURATION: u8 = 2;
    pub const STRING: u8 = 3;
    pub const INTERFACE: u8 = 4;
    pub const ENDPOINT: u8 = 5;
    pub const DEVICE_QUALIFIER: u8 = 6;
    pub const OTHER_SPEED_CONFIGURATION: u8 = 7;
    pub const INTERFACE_POWER: u8 = 8;
}

const DEVICE_LEN: usize = 18;
const CONFIGURATION_LEN: usize = 9;
const INTERFACE_LEN: usize = 9;
const ENDPOINT_LEN: usize = 7;

/// Largest string descriptor; bLength is a byte, and payloads are UTF-16.
const STRING_MAX_LEN: usize = 254;

/// The 18-byte device descriptor
///
/// `bNumConfigurations` is filled in by [`Descriptors::new`], and
/// `bMaxPacketSize0` is replaced by the size the transceiver grants when the
/// device initializes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeviceDescriptor {
    usb_release: u16,
    class: u8,
    subclass: u8,
    protocol: u8,
    max_packet_size_0: u8,
    vendor_id: u16,
    product_id: u16,
    release: u16,
    manufacturer: u8,
    product: u8,
    serial_number: u8,
    configurations: u8,
}

impl DeviceDescriptor {
    /// A USB 2.0 device with a vendor-defined class and a 64 byte EP0
    pub const fn new(vendor_id: u16, product_id: u16) -> Self {
        DeviceDescriptor {
            usb_release: 0x0200,
            class: 0,
            subclass: 0,
            protocol: 0,
            max_packet_size_0: 64,
            vendor_id,
            product_id,
            release: 0x0100,
            manufacturer: 0,
            product: 0,
            serial_number: 0,
            configurations: 1,
        }
    }

    /// bcdUSB
    pub const fn usb_release(mut self, bcd: u16) -> Self {
        self.usb_release = bcd;
        self
    }

    pub const fn device_class(mut self, class: u8, subclass: u8, protocol: u8) -> Self {
        self.class = class;
        self.subclass = subclass;
        self.protocol = protocol;
        self
    }

    /// Request an endpoint zero packet size: 8, 16, 32, or 64
    pub const fn max_packet_size_0(mut self, max_packet_size: u8) -> Self {
        self.max_packet_size_0 = max_packet_size;
        self
    }

    /// bcdDevice
    pub const fn release(mut self, bcd: u16) -> Self {
        self.release = bcd;
        self
    }

    pub const fn manufacturer(mut self, string_index: u8) -> Self {
        self.manufacturer = string_index;
        self
    }

    pub const fn product(mut self, string_index: u8) -> Self {
        self.product = string_index;
        self
    }

    pub const fn serial_number(mut self, string_index: u8) -> Self {
        self.serial_number = string_index;
        self
    }

    pub const fn vendor_id(&self) -> u16 {
        self.vendor_id
    }

    pub const fn product_id(&self) -> u16 {
        self.product_id
    }

    pub const fn requested_max_packet_size_0(&self) -> u8 {
        self.max_packet_size_0
    }

    /// Encode the descriptor
    pub const fn to_bytes(&self) -> [u8; DEVICE_LEN] {
        let usb = self.usb_release.to_le_bytes();
        let vid = self.vendor_id.to_le_bytes();
        let pid = self.product_id.to_le_bytes();
        let release = self.release.to_le_bytes();
        [
            DEVICE_LEN as u8,
            descriptor_type::DEVICE,
            usb[0],
            usb[1],
            self.class,
            self.subclass,
            self.protocol,
            self.max_packet_size_0,
            vid[0],
            vid[1],
            pid[0],
            pid[1],
            release[0],
            release[1],
            self.manufacturer,
            self.product,
            self.serial_number,
            self.configurations,
        ]
    }
}

bitflags::bitflags! {
    /// Configuration bmAttributes
    ///
    /// The reserved bit 7 is always set in the encoded descriptor.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct ConfigAttributes: u8 {
        const SELF_POWERED = 1 << 6;
        const REMOTE_WAKEUP = 1 << 5;
    }
}

/// Writes a configuration descriptor and everything it contains
///
/// `wTotalLength` and `bNumInterfaces` are computed when you
/// [`finish()`](ConfigurationWriter::finish). `bNumEndpoints` of each
/// interface descriptor counts the endpoints written after it.
pub struct ConfigurationWriter<'a> {
    buffer: &'a mut [u8],
    position: usize,
    interfaces: u8,
    /// Offset of the most recent interface descriptor
    interface: Option<usize>,
}

impl<'a> ConfigurationWriter<'a> {
    /// Start a configuration with the given `bConfigurationValue`
    ///
    /// `max_power_ma` is rounded down to the 2mA units of `bMaxPower`.
    pub fn new(
        buffer: &'a mut [u8],
        value: u8,
        attributes: ConfigAttributes,
        max_power_ma: u16,
    ) -> Result<Self, UsbError> {
        if value == 0 {
            return Err(UsbError::InvalidState);
        }
        let mut writer = ConfigurationWriter {
            buffer,
            position: 0,
            interfaces: 0,
            interface: None,
        };
        writer.write(
            descriptor_type::CONFIGURATION,
            &[
                0,
                0,
                0,
                value,
                0,
                0x80 | attributes.bits(),
                (max_power_ma / 2).min(u8::MAX as u16) as u8,
            ],
        )?;
        Ok(writer)
    }

    /// Write an arbitrary descriptor, such as a class-specific descriptor
    pub fn write(&mut self, descriptor_type: u8, payload: &[u8]) -> Result<(), UsbError> {
        let length = payload.len() + 2;
        if length > u8::MAX as usize {
            return Err(UsbError::BufferOverflow);
        }
        let record = self
            .buffer
            .get_mut(self.position..self.position + length)
            .ok_or(UsbError::BufferOverflow)?;
        record[0] = length as u8;
        record[1] = descriptor_type;
        record[2..].copy_from_slice(payload);
        self.position += length;
        Ok(())
    }

    /// Write an interface descriptor
    ///
    /// Alternate settings of one interface must follow each other.
    pub fn interface(
        &mut self,
        number: u8,
        alternate: u8,
        class: u8,
        subclass: u8,
        protocol: u8,
    ) -> Result<(), UsbError> {
        let offset = self.position;
        self.write(
            descriptor_type::INTERFACE,
            &[number, alternate, 0, class, subclass, protocol, 0],
        )?;
        if alternate == 0 {
            self.interfaces += 1;
        }
        self.interface = Some(offset);
        Ok(())
    }

    /// Write an endpoint descriptor for the most recent interface
    pub fn endpoint(
        &mut self,
        address: EndpointAddress,
        kind: EndpointType,
        max_packet: u16,
        interval: u8,
    ) -> Result<(), UsbError> {
        let interface = self.interface.ok_or(UsbError::InvalidState)?;
        if address.index() == 0 {
            return Err(UsbError::InvalidEndpoint);
        }
        let max_packet = max_packet.to_le_bytes();
        self.write(
            descriptor_type::ENDPOINT,
            &[
                address.into(),
                endpoint_attributes(kind),
                max_packet[0],
                max_packet[1],
                interval,
            ],
        )?;
        self.buffer[interface + 4] += 1;
        Ok(())
    }

    /// Patch the totals, and return the complete descriptor
    pub fn finish(self) -> &'a [u8] {
        let ConfigurationWriter {
            buffer,
            position,
            interfaces,
            ..
        } = self;
        let total = (position as u16).to_le_bytes();
        buffer[2] = total[0];
        buffer[3] = total[1];
        buffer[4] = interfaces;
        let buffer: &'a [u8] = buffer;
        &buffer[..position]
    }
}

/// Encode bmAttributes of an endpoint descriptor
fn endpoint_attributes(kind: EndpointType) -> u8 {
    match kind {
        EndpointType::Control => 0b00,
        EndpointType::Isochronous {
            synchronization,
            usage,
        } => {
            let synchronization = match synchronization {
                IsochronousSynchronizationType::NoSynchronization => 0b00,
                IsochronousSynchronizationType::Asynchronous => 0b01,
                IsochronousSynchronizationType::Adaptive => 0b10,
                IsochronousSynchronizationType::Synchronous => 0b11,
            };
            let usage = match usage {
                IsochronousUsageType::Data => 0b00,
                IsochronousUsageType::Feedback => 0b01,
                IsochronousUsageType::ImplicitFeedbackData => 0b10,
            };
            0b01 | synchronization << 2 | usage << 4
        }
        EndpointType::Bulk => 0b10,
        EndpointType::Interrupt => 0b11,
    }
}

/// Decode bmAttributes of an endpoint descriptor
fn endpoint_type(attributes: u8) -> Option<EndpointType> {
    Some(match attributes & 0b11 {
        0b00 => EndpointType::Control,
        0b01 => EndpointType::Isochronous {
            synchronization: match (attributes >> 2) & 0b11 {
                0b00 => IsochronousSynchronizationType::NoSynchronization,
                0b01 => IsochronousSynchronizationType::Asynchronous,
                0b10 => IsochronousSynchronizationType::Adaptive,
                _ => IsochronousSynchronizationType::Synchronous,
            },
            usage: match (attributes >> 4) & 0b11 {
                0b00 => IsochronousUsageType::Data,
                0b01 => IsochronousUsageType::Feedback,
                0b10 => IsochronousUsageType::ImplicitFeedbackData,
                _ => return None,
            },
        },
        0b10 => EndpointType::Bulk,
        _ => EndpointType::Interrupt,
    })
}

/// Iterates the `(bDescriptorType, record)` pairs of a descriptor blob
///
/// Stops at the first malformed record.
#[derive(Clone)]
struct Records<'d> {
    bytes: &'d [u8],
}

impl<'d> Iterator for Records<'d> {
    type Item = (u8, &'d [u8]);
    fn next(&mut self) -> Option<Self::Item> {
        let length = *self.bytes.first()? as usize;
        if length < 2 || length > self.bytes.len() {
            self.bytes = &[];
            return None;
        }
        let (record, rest) = self.bytes.split_at(length);
        self.bytes = rest;
        Some((record[1], record))
    }
}

/// An endpoint declared by a configuration
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EndpointDescriptor {
    pub address: EndpointAddress,
    pub kind: EndpointType,
    /// wMaxPacketSize, without the high-bandwidth multiplier bits
    pub max_packet: u16,
    pub interval: u8,
}

impl EndpointDescriptor {
    fn parse(record: &[u8]) -> Option<Self> {
        if record.len() < ENDPOINT_LEN {
            return None;
        }
        Some(EndpointDescriptor {
            address: EndpointAddress::from(record[2]),
            kind: endpoint_type(record[3])?,
            max_packet: u16::from_le_bytes([record[4], record[5]]) & 0x7FF,
            interval: record[6],
        })
    }
}

/// Which endpoints an [`InterfaceEndpoints`] yields
#[derive(Clone, Copy)]
enum Selection {
    /// Every interface's first alternate setting
    Defaults,
    /// One interface, one alternate setting
    Alternate { interface: u8, alternate: u8 },
}

/// Iterates the endpoints of one or more interface alternate settings
#[derive(Clone)]
pub struct InterfaceEndpoints<'d> {
    records: Records<'d>,
    selection: Selection,
    /// `(bInterfaceNumber, bAlternateSetting)` of the enclosing interface
    current: Option<(u8, u8)>,
}

impl Iterator for InterfaceEndpoints<'_> {
    type Item = EndpointDescriptor;
    fn next(&mut self) -> Option<Self::Item> {
        for (kind, record) in self.records.by_ref() {
            match kind {
                descriptor_type::INTERFACE if record.len() >= INTERFACE_LEN => {
                    self.current = Some((record[2], record[3]));
                }
                descriptor_type::ENDPOINT => {
                    let selected = match (self.selection, self.current) {
                        (Selection::Defaults, Some((_, 0))) => true,
                        (
                            Selection::Alternate {
                                interface,
                                alternate,
                            },
                            Some(current),
                        ) => current == (interface, alternate),
                        _ => false,
                    };
                    if selected {
                        if let Some(endpoint) = EndpointDescriptor::parse(record) {
                            return Some(endpoint);
                        }
                    }
                }
                _ => {}
            }
        }
        None
    }
}

/// A view of one configuration descriptor
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Configuration<'d> {
    bytes: &'d [u8],
}

impl<'d> Configuration<'d> {
    /// The complete descriptor, as served to the host
    pub fn bytes(&self) -> &'d [u8] {
        self.bytes
    }

    /// bConfigurationValue
    pub fn value(&self) -> u8 {
        self.bytes[5]
    }

    pub fn attributes(&self) -> ConfigAttributes {
        ConfigAttributes::from_bits_truncate(self.bytes[7])
    }

    pub fn self_powered(&self) -> bool {
        self.attributes().contains(ConfigAttributes::SELF_POWERED)
    }

    /// Returns `true` if the configuration supports remote wakeup
    pub fn remote_wakeup(&self) -> bool {
        self.attributes().contains(ConfigAttributes::REMOTE_WAKEUP)
    }

    fn records(&self) -> Records<'d> {
        Records { bytes: self.bytes }
    }

    /// Returns `true` if the configuration declares this interface
    pub fn has_interface(&self, interface: u8) -> bool {
        self.has_alternate(interface, 0)
    }

    /// Returns `true` if the configuration declares this alternate setting
    pub fn has_alternate(&self, interface: u8, alternate: u8) -> bool {
        self.records().any(|(kind, record)| {
            kind == descriptor_type::INTERFACE
                && record.len() >= INTERFACE_LEN
                && record[2] == interface
                && record[3] == alternate
        })
    }

    /// Every endpoint of every interface's first alternate setting
    pub fn default_endpoints(&self) -> InterfaceEndpoints<'d> {
        InterfaceEndpoints {
            records: self.records(),
            selection: Selection::Defaults,
            current: None,
        }
    }

    /// The endpoints of one alternate setting
    pub fn endpoints(&self, interface: u8, alternate: u8) -> InterfaceEndpoints<'d> {
        InterfaceEndpoints {
            records: self.records(),
            selection: Selection::Alternate {
                interface,
                alternate,
            },
            current: None,
        }
    }

    /// Check that the descriptor is well formed
    fn validate(bytes: &[u8]) -> Result<(), UsbError> {
        if bytes.len() < CONFIGURATION_LEN
            || bytes[0] as usize != CONFIGURATION_LEN
            || bytes[1] != descriptor_type::CONFIGURATION
            || u16::from_le_bytes([bytes[2], bytes[3]]) as usize != bytes.len()
            || bytes[5] == 0
        {
            return Err(UsbError::ParseError);
        }

        let mut consumed = 0;
        for (kind, record) in (Records { bytes }) {
            consumed += record.len();
            match kind {
                descriptor_type::INTERFACE
                    if record.len() < INTERFACE_LEN
                        || usize::from(record[2]) >= crate::MAX_INTERFACES =>
                {
                    return Err(UsbError::ParseError);
                }
                descriptor_type::ENDPOINT => {
                    let endpoint = EndpointDescriptor::parse(record).ok_or(UsbError::ParseError)?;
                    if endpoint.address.index() == 0 {
                        return Err(UsbError::ParseError);
                    }
                }
                _ => {}
            }
        }
        if consumed != bytes.len() {
            return Err(UsbError::ParseError);
        }
        Ok(())
    }
}

/// String descriptors for one language
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StringSet<'d> {
    lang_id: u16,
    strings: &'d [&'d str],
}

impl<'d> StringSet<'d> {
    /// `strings[0]` is served as string index 1, and so on
    pub const fn new(lang_id: u16, strings: &'d [&'d str]) -> Self {
        StringSet { lang_id, strings }
    }

    pub const fn lang_id(&self) -> u16 {
        self.lang_id
    }
}

/// The device's descriptors
#[derive(Clone, Debug)]
pub struct Descriptors<'d> {
    device: [u8; DEVICE_LEN],
    configurations: &'d [&'d [u8]],
    strings: &'d [StringSet<'d>],
}

impl<'d> Descriptors<'d> {
    /// Validate and collect the device's descriptors
    ///
    /// Returns `UsbError::ParseError` if any configuration is malformed,
    /// declares an interface number of [`MAX_INTERFACES`](crate::MAX_INTERFACES)
    /// or more, or shares its `bConfigurationValue` with another.
    pub fn new(
        device: DeviceDescriptor,
        configurations: &'d [&'d [u8]],
        strings: &'d [StringSet<'d>],
    ) -> Result<Self, UsbError> {
        for (idx, bytes) in configurations.iter().enumerate() {
            Configuration::validate(bytes)?;
            if configurations[..idx].iter().any(|other| other[5] == bytes[5]) {
                return Err(UsbError::ParseError);
            }
        }
        let configuration_count =
            u8::try_from(configurations.len()).map_err(|_| UsbError::ParseError)?;

        let mut device = device.to_bytes();
        device[17] = configuration_count;
        Ok(Descriptors {
            device,
            configurations,
            strings,
        })
    }

    /// The device descriptor
    pub fn device(&self) -> &[u8] {
        &self.device
    }

    /// bMaxPacketSize0, as currently served
    pub fn max_packet_size_0(&self) -> u8 {
        self.device[7]
    }

    pub(crate) fn set_max_packet_size_0(&mut self, max_packet_size: u8) {
        self.device[7] = max_packet_size;
    }

    /// The configuration at position `index`, as addressed by GET_DESCRIPTOR
    pub fn configuration(&self, index: u8) -> Option<Configuration<'d>> {
        self.configurations
            .get(index as usize)
            .map(|bytes| Configuration { bytes })
    }

    /// The configuration with this `bConfigurationValue`
    pub fn configuration_by_value(&self, value: u8) -> Option<Configuration<'d>> {
        self.configurations
            .iter()
            .find(|bytes| bytes[5] == value)
            .map(|bytes| Configuration { bytes })
    }

    /// Synthesize string descriptor `index` for `lang_id` into `buffer`
    ///
    /// Index zero produces the list of supported languages, regardless of
    /// `lang_id`. Strings too long for one descriptor are truncated.
    /// Returns the descriptor length, or `None` if there is no such string.
    pub fn string(&self, index: u8, lang_id: u16, buffer: &mut [u8]) -> Option<usize> {
        let capacity = buffer.len().min(STRING_MAX_LEN);
        if capacity < 2 {
            return None;
        }
        let mut length = 2;
        if index == 0 {
            if self.strings.is_empty() {
                return None;
            }
            for set in self.strings {
                if length + 2 > capacity {
                    break;
                }
                buffer[length..length + 2].copy_from_slice(&set.lang_id.to_le_bytes());
                length += 2;
            }
        } else {
            let set = self.strings.iter().find(|set| set.lang_id == lang_id)?;
            let text = set.strings.get(index as usize - 1)?;
            for unit in text.encode_utf16() {
                if length + 2 > capacity {
                    break;
                }
                buffer[length..length + 2].copy_from_slice(&unit.to_le_bytes());
                length += 2;
            }
        }
        buffer[0] = length as u8;
        buffer[1] = descriptor_type::STRING;
        Some(length)
    }
}
