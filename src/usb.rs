use crate::device_ids::{DeviceIdentity, UsbId};
use log::{debug, trace};
use rusb::{Context, Device, DeviceHandle, Direction, TransferType, UsbContext};
use std::time::Duration;

/// Descriptor string indices of a device. `None` means the device does not provide the string.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct StringIndices {
    pub manufacturer: Option<u8>,
    pub product: Option<u8>,
    pub serial: Option<u8>,
}

/// An endpoint of an interface's first alternate setting.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct EndpointLayout {
    pub address: u8,
    pub transfer_type: TransferType,
}

impl EndpointLayout {
    pub fn direction(&self) -> Direction {
        if self.address & 0x80 != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    }
}

/// The first alternate setting of one interface.
#[derive(Clone, Debug, PartialEq)]
pub struct InterfaceLayout {
    pub number: u8,
    pub class: u8,
    pub subclass: u8,
    pub endpoints: Vec<EndpointLayout>,
}

/// One configuration descriptor, reduced to what mode switching needs.
#[derive(Clone, Debug, PartialEq)]
pub struct ConfigLayout {
    /// `bConfigurationValue`, as used with SET_CONFIGURATION.
    pub value: u8,
    pub interfaces: Vec<InterfaceLayout>,
}

/// Owned snapshot of an enumerated device. Goes stale as soon as the device is reset,
/// reconfigured or unplugged.
#[derive(Clone, Debug, PartialEq)]
pub struct DeviceRecord {
    pub identity: DeviceIdentity,
    /// Configuration descriptors in descriptor-index order.
    pub configurations: Vec<ConfigLayout>,
    pub strings: StringIndices,
}

impl DeviceRecord {
    /// The configuration descriptor at index 0, which libusb hands out first.
    pub fn first_config(&self) -> Option<&ConfigLayout> {
        self.configurations.first()
    }

    /// Interface 0 / alternate setting 0 of the first configuration.
    pub fn first_interface(&self) -> Option<&InterfaceLayout> {
        self.first_config().and_then(|c| c.interfaces.first())
    }
}

/// Host USB access: enumeration and opening. Everything else goes through [UsbHandle].
pub trait UsbBus {
    type Handle: UsbHandle;

    /// Enumerate every device currently attached. Never cached between calls.
    fn devices(&self) -> rusb::Result<Vec<DeviceRecord>>;

    /// Open the device at the identity's bus/address.
    fn open(&self, identity: &DeviceIdentity) -> rusb::Result<Self::Handle>;
}

/// Operations on one open device. Dropping the handle closes it.
pub trait UsbHandle {
    fn read_control(
        &mut self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        timeout: Duration,
    ) -> rusb::Result<usize>;

    fn write_control(
        &mut self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &[u8],
        timeout: Duration,
    ) -> rusb::Result<usize>;

    fn read_bulk(&mut self, endpoint: u8, buf: &mut [u8], timeout: Duration)
    -> rusb::Result<usize>;

    fn write_bulk(&mut self, endpoint: u8, buf: &[u8], timeout: Duration) -> rusb::Result<usize>;

    fn read_interrupt(
        &mut self,
        endpoint: u8,
        buf: &mut [u8],
        timeout: Duration,
    ) -> rusb::Result<usize>;

    fn write_interrupt(
        &mut self,
        endpoint: u8,
        buf: &[u8],
        timeout: Duration,
    ) -> rusb::Result<usize>;

    fn claim_interface(&mut self, interface: u8) -> rusb::Result<()>;

    fn release_interface(&mut self, interface: u8) -> rusb::Result<()>;

    fn clear_halt(&mut self, endpoint: u8) -> rusb::Result<()>;

    fn set_active_configuration(&mut self, configuration: u8) -> rusb::Result<()>;

    fn set_alternate_setting(&mut self, interface: u8, setting: u8) -> rusb::Result<()>;

    /// Fails with [rusb::Error::NotSupported] where the platform can't tell.
    fn kernel_driver_active(&mut self, interface: u8) -> rusb::Result<bool>;

    /// Whether this platform can detach kernel drivers at all.
    fn supports_detach(&self) -> bool;

    fn detach_kernel_driver(&mut self, interface: u8) -> rusb::Result<()>;

    fn reset(&mut self) -> rusb::Result<()>;

    fn read_string_ascii(&mut self, index: u8) -> rusb::Result<String>;
}

/// [UsbBus] backed by libusb.
pub struct LibUsb {
    context: Context,
}

impl LibUsb {
    pub fn new() -> rusb::Result<Self> {
        let vers = rusb::version();
        debug!(
            "libusb {}.{}.{}.{}",
            vers.major(),
            vers.minor(),
            vers.micro(),
            vers.nano()
        );
        debug!(
            "libusb can detach kernel driver: {:?}",
            rusb::supports_detach_kernel_driver()
        );

        Ok(Self {
            context: Context::new()?,
        })
    }

    fn find(&self, identity: &DeviceIdentity) -> rusb::Result<Device<Context>> {
        self.context
            .devices()?
            .iter()
            .find(|d| d.bus_number() == identity.bus && d.address() == identity.address)
            .ok_or(rusb::Error::NoDevice)
    }
}

impl UsbBus for LibUsb {
    type Handle = LibUsbHandle;

    fn devices(&self) -> rusb::Result<Vec<DeviceRecord>> {
        let mut records = vec![];
        for device in self.context.devices()?.iter() {
            match describe(&device) {
                Ok(record) => records.push(record),
                // Devices can vanish mid-enumeration; they simply don't match.
                Err(e) => trace!(
                    "Skipping device {:03}/{:03}: {e}",
                    device.bus_number(),
                    device.address()
                ),
            }
        }
        Ok(records)
    }

    fn open(&self, identity: &DeviceIdentity) -> rusb::Result<LibUsbHandle> {
        let handle = self.find(identity)?.open()?;
        Ok(LibUsbHandle { handle })
    }
}

fn describe(device: &Device<Context>) -> rusb::Result<DeviceRecord> {
    let desc = device.device_descriptor()?;

    let mut configurations = vec![];
    for i in 0..desc.num_configurations() {
        let config = match device.config_descriptor(i) {
            Ok(c) => c,
            Err(e) => {
                trace!("Unreadable configuration descriptor {i}: {e}");
                continue;
            }
        };

        let interfaces = config
            .interfaces()
            .filter_map(|interface| interface.descriptors().next())
            .map(|alt| InterfaceLayout {
                number: alt.interface_number(),
                class: alt.class_code(),
                subclass: alt.sub_class_code(),
                endpoints: alt
                    .endpoint_descriptors()
                    .map(|ep| EndpointLayout {
                        address: ep.address(),
                        transfer_type: ep.transfer_type(),
                    })
                    .collect(),
            })
            .collect();

        configurations.push(ConfigLayout {
            value: config.number(),
            interfaces,
        });
    }

    Ok(DeviceRecord {
        identity: DeviceIdentity {
            bus: device.bus_number(),
            address: device.address(),
            id: UsbId {
                vid: desc.vendor_id(),
                pid: desc.product_id(),
            },
            class: desc.class_code(),
        },
        configurations,
        strings: StringIndices {
            manufacturer: desc.manufacturer_string_index(),
            product: desc.product_string_index(),
            serial: desc.serial_number_string_index(),
        },
    })
}

/// [UsbHandle] backed by a libusb device handle.
pub struct LibUsbHandle {
    handle: DeviceHandle<Context>,
}

impl UsbHandle for LibUsbHandle {
    fn read_control(
        &mut self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        timeout: Duration,
    ) -> rusb::Result<usize> {
        self.handle
            .read_control(request_type, request, value, index, buf, timeout)
    }

    fn write_control(
        &mut self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &[u8],
        timeout: Duration,
    ) -> rusb::Result<usize> {
        self.handle
            .write_control(request_type, request, value, index, buf, timeout)
    }

    fn read_bulk(
        &mut self,
        endpoint: u8,
        buf: &mut [u8],
        timeout: Duration,
    ) -> rusb::Result<usize> {
        self.handle.read_bulk(endpoint, buf, timeout)
    }

    fn write_bulk(&mut self, endpoint: u8, buf: &[u8], timeout: Duration) -> rusb::Result<usize> {
        self.handle.write_bulk(endpoint, buf, timeout)
    }

    fn read_interrupt(
        &mut self,
        endpoint: u8,
        buf: &mut [u8],
        timeout: Duration,
    ) -> rusb::Result<usize> {
        self.handle.read_interrupt(endpoint, buf, timeout)
    }

    fn write_interrupt(
        &mut self,
        endpoint: u8,
        buf: &[u8],
        timeout: Duration,
    ) -> rusb::Result<usize> {
        self.handle.write_interrupt(endpoint, buf, timeout)
    }

    fn claim_interface(&mut self, interface: u8) -> rusb::Result<()> {
        self.handle.claim_interface(interface)
    }

    fn release_interface(&mut self, interface: u8) -> rusb::Result<()> {
        self.handle.release_interface(interface)
    }

    fn clear_halt(&mut self, endpoint: u8) -> rusb::Result<()> {
        self.handle.clear_halt(endpoint)
    }

    fn set_active_configuration(&mut self, configuration: u8) -> rusb::Result<()> {
        self.handle.set_active_configuration(configuration)
    }

    fn set_alternate_setting(&mut self, interface: u8, setting: u8) -> rusb::Result<()> {
        self.handle.set_alternate_setting(interface, setting)
    }

    fn kernel_driver_active(&mut self, interface: u8) -> rusb::Result<bool> {
        self.handle.kernel_driver_active(interface)
    }

    fn supports_detach(&self) -> bool {
        rusb::supports_detach_kernel_driver()
    }

    fn detach_kernel_driver(&mut self, interface: u8) -> rusb::Result<()> {
        self.handle.detach_kernel_driver(interface)
    }

    fn reset(&mut self) -> rusb::Result<()> {
        self.handle.reset()
    }

    fn read_string_ascii(&mut self, index: u8) -> rusb::Result<String> {
        self.handle.read_string_descriptor_ascii(index)
    }
}
