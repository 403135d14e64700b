use crate::device_ids::{BusPin, MASS_STORAGE_CLASS, UsbId};
use crate::session::Session;
use crate::transport::{TransferOutcome, read_bulk_with_timeout, write_bulk_with_timeout};
use crate::usb::{ConfigLayout, DeviceRecord, UsbBus, UsbHandle};
use log::{debug, info, warn};
use num_enum::TryFromPrimitive;
use rusb::{Direction, TransferType};
use std::fmt::Display;
use std::time::Duration;

const GET_CONFIGURATION_TIMEOUT: Duration = Duration::from_millis(1000);
const REQUEST_GET_CONFIGURATION: u8 = 0x08;

/// Class codes worth naming in log output.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, TryFromPrimitive)]
pub enum UsbClass {
    PerInterface = 0x00,
    Audio = 0x01,
    Communications = 0x02,
    Hid = 0x03,
    Printer = 0x07,
    MassStorage = 0x08,
    Hub = 0x09,
    CdcData = 0x0a,
    SmartCard = 0x0b,
    Wireless = 0xe0,
    Miscellaneous = 0xef,
    VendorSpecific = 0xff,
}

/// Format a class code with its name, if known.
pub fn describe_class(code: u8) -> String {
    match UsbClass::try_from(code) {
        Ok(class) => format!("{code:#04x} ({class:?})"),
        Err(_) => format!("{code:#04x}"),
    }
}

/// Result of asking a device for its active configuration.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum CurrentConfiguration {
    Reported(u8),
    /// The device didn't answer; configuration 1 is assumed and its word can't be trusted.
    Assumed,
}

impl CurrentConfiguration {
    pub fn value(&self) -> u8 {
        match self {
            CurrentConfiguration::Reported(v) => *v,
            CurrentConfiguration::Assumed => 1,
        }
    }
}

/// Issue a standard GET_CONFIGURATION request.
pub fn current_configuration<H: UsbHandle>(handle: &mut H) -> CurrentConfiguration {
    debug!("Getting the current device configuration ...");

    let request_type = rusb::request_type(
        Direction::In,
        rusb::RequestType::Standard,
        rusb::Recipient::Device,
    );
    let mut buf = [0u8; 1];
    match handle.read_control(
        request_type,
        REQUEST_GET_CONFIGURATION,
        0,
        0,
        &mut buf,
        GET_CONFIGURATION_TIMEOUT,
    ) {
        Ok(n) if n >= 1 => {
            debug!(" OK, got current device configuration ({})", buf[0]);
            CurrentConfiguration::Reported(buf[0])
        }
        Ok(_) => {
            warn!("Empty answer to GET_CONFIGURATION. Assuming configuration 1.");
            CurrentConfiguration::Assumed
        }
        Err(e) => {
            // Quirky devices fail to answer this properly.
            warn!("Error getting the current configuration ({e}). Assuming configuration 1.");
            CurrentConfiguration::Assumed
        }
    }
}

/// Class of the first alternate setting of `interface`, or [None] if the configuration has no
/// such interface.
pub fn interface_class(config: &ConfigLayout, interface: u8) -> Option<u8> {
    config
        .interfaces
        .iter()
        .find(|i| i.number == interface)
        .map(|i| i.class)
}

/// First bulk endpoint in `direction` on interface 0 / alt-setting 0, in declared order.
pub fn first_bulk_endpoint(record: &DeviceRecord, direction: Direction) -> Option<u8> {
    record
        .first_interface()?
        .endpoints
        .iter()
        .find(|ep| ep.transfer_type == TransferType::Bulk && ep.direction() == direction)
        .map(|ep| ep.address)
}

/// Settle on the class of the default device. Class 0 defers to the interface. A device that
/// declares something else but has a mass storage interface is treated as mass storage.
pub fn resolve_class(device_class: u8, interface_class: u8) -> u8 {
    if device_class == 0 {
        interface_class
    } else if interface_class == MASS_STORAGE_CLASS && device_class != MASS_STORAGE_CLASS {
        info!("Ambiguous Class/InterfaceClass: {device_class:#04x}/0x08");
        MASS_STORAGE_CLASS
    } else {
        device_class
    }
}

/// Descriptive strings of a device, for identification in logs.
#[derive(Clone, Debug, PartialEq)]
pub struct DeviceDescription {
    pub manufacturer: String,
    pub product: String,
    pub serial: String,
}

impl Display for DeviceDescription {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        writeln!(f, "Manufacturer: {}", self.manufacturer)?;
        writeln!(f, "     Product: {}", self.product)?;
        write!(f, "  Serial No.: {}", self.serial)
    }
}

pub fn read_description<H: UsbHandle>(handle: &mut H, record: &DeviceRecord) -> DeviceDescription {
    let mut read = |index: Option<u8>, what: &str| match index {
        None => "not provided".to_owned(),
        Some(i) => match handle.read_string_ascii(i) {
            Ok(s) => s.trim_end().to_owned(),
            Err(e) => {
                warn!("Could not get description string \"{what}\": {e}");
                String::new()
            }
        },
    };

    DeviceDescription {
        manufacturer: read(record.strings.manufacturer, "manufacturer"),
        product: read(record.strings.product, "product"),
        serial: read(record.strings.serial, "serial number"),
    }
}

/// Strings from a SCSI INQUIRY response.
#[derive(Clone, Debug, PartialEq)]
pub struct InquiryData {
    pub vendor: String,
    pub model: String,
    pub revision: String,
}

impl InquiryData {
    fn parse(data: &[u8; INQUIRY_LEN]) -> Self {
        let field = |r: std::ops::Range<usize>| String::from_utf8_lossy(&data[r]).into_owned();
        Self {
            vendor: field(8..16),
            model: field(16..32),
            revision: field(32..36),
        }
    }
}

const INQUIRY_LEN: usize = 36;
const CSW_LEN: usize = 13;
const INQUIRY_TIMEOUT: Duration = Duration::from_millis(3000);

// Command block wrapper carrying INQUIRY with a 36-byte allocation length.
const INQUIRY_CBW: [u8; 31] = [
    0x55, 0x53, 0x42, 0x43, 0x12, 0x34, 0x56, 0x78, 0x24, 0x00, 0x00, 0x00, 0x80, 0x00, 0x06, 0x12,
    0x00, 0x00, 0x00, 0x24, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
];

/// Ask a mass storage device who it is. Any failure just skips the inquiry; the interface is
/// released again either way.
pub fn inquire<H: UsbHandle>(
    session: &mut Session<H>,
    message_endpoint: u8,
    response_endpoint: u8,
) -> Option<InquiryData> {
    if let Err(e) = session.claim() {
        info!(" Could not claim interface ({e}). Skipping device inquiry");
        return None;
    }

    let result = session.handle_mut().and_then(|handle| {
        handle.clear_halt(message_endpoint).ok();

        let sent = write_bulk_with_timeout(handle, message_endpoint, &INQUIRY_CBW, INQUIRY_TIMEOUT);
        if !matches!(sent, TransferOutcome::Completed(_)) {
            info!(" Could not send INQUIRY message");
            return None;
        }

        let reply = read_bulk_with_timeout(handle, response_endpoint, INQUIRY_LEN, INQUIRY_TIMEOUT);
        let data = match reply {
            TransferOutcome::Completed(d) => d,
            _ => {
                info!(" Could not get INQUIRY response");
                return None;
            }
        };

        // Status wrapper; its content doesn't matter.
        let _ = read_bulk_with_timeout(handle, response_endpoint, CSW_LEN, INQUIRY_TIMEOUT);

        let mut response = [0u8; INQUIRY_LEN];
        let n = data.len().min(INQUIRY_LEN);
        response[..n].copy_from_slice(&data[..n]);
        Some(InquiryData::parse(&response))
    });

    session.release().ok();
    result
}

/// Outcome of looking for a configuration with an MBIM interface.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum MbimSearch {
    /// No device matched the default IDs.
    NoDevice,
    /// The device has fewer than two configurations or none with MBIM.
    NotFound,
    Found(u8),
}

impl Display for MbimSearch {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            MbimSearch::NoDevice => write!(f, "0"),
            MbimSearch::NotFound => write!(f, "-1"),
            MbimSearch::Found(v) => write!(f, "{v}"),
        }
    }
}

const MBIM_SUBCLASS: u8 = 0x0e;

/// Find the configuration value that exposes a CDC MBIM interface on the first device with
/// the given IDs (at the pinned position, if any).
pub fn find_mbim_configuration<B: UsbBus>(bus: &B, id: UsbId, pin: Option<BusPin>) -> MbimSearch {
    let devices = match bus.devices() {
        Ok(d) => d,
        Err(e) => {
            warn!("Failed to access USB: {e}");
            return MbimSearch::NoDevice;
        }
    };

    let Some(record) = devices
        .iter()
        .filter(|d| pin.is_none_or(|p| d.identity.pin() == p))
        .find(|d| d.identity.id == id)
    else {
        return MbimSearch::NoDevice;
    };

    info!("Found device, searching for MBIM configuration...");
    if record.configurations.len() < 2 {
        return MbimSearch::NotFound;
    }

    record
        .configurations
        .iter()
        .find(|c| {
            c.interfaces.iter().any(|i| {
                i.class == UsbClass::Communications as u8 && i.subclass == MBIM_SUBCLASS
            })
        })
        .map_or(MbimSearch::NotFound, |c| MbimSearch::Found(c.value))
}
