use crate::device_ids::{BusPin, TargetSpec, parse_product_entry};
use crate::inspect::{CurrentConfiguration, current_configuration};
use crate::usb::{DeviceRecord, UsbBus};
use log::{debug, warn};

/// How candidates are picked out of the device list.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum SearchMode {
    /// Match the default (pre-switch) identity.
    Default,
    /// Match the target (post-switch) identity.
    Target,
    /// Only the device at the given bus/address is considered.
    BusDev(BusPin),
}

/// The identity a scan looks for.
#[derive(Clone, Debug, PartialEq)]
pub struct Criteria<'a> {
    pub vendor: u16,
    pub product: Option<u16>,
    pub product_list: &'a [String],
}

impl<'a> Criteria<'a> {
    pub fn default_mode(spec: &TargetSpec) -> Criteria<'static> {
        Criteria {
            vendor: spec.default_vendor,
            product: Some(spec.default_product),
            product_list: &[],
        }
    }

    pub fn target_mode(spec: &'a TargetSpec) -> Criteria<'a> {
        Criteria {
            vendor: spec.target_vendor.0.unwrap_or(0),
            product: spec.target_product.0,
            product_list: &spec.target_product_list,
        }
    }
}

/// How many devices matched, and which one to act on.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ScanResult {
    pub count: usize,
    pub last_match: Option<DeviceRecord>,
}

impl ScanResult {
    fn add(&mut self, record: &DeviceRecord) {
        self.count += 1;
        self.last_match = Some(record.clone());
    }
}

/// Count the attached devices matching `criteria` and return the last one of them.
///
/// `pin` is the bus/address the run is anchored to (given by the user or learned from the
/// default device). When set, a product list match is only taken from that bus at or above
/// that address, and the first such match ends the scan. `class` is the target class (0 when
/// unset) and `configuration` the wanted configuration value (0 when unset).
///
/// Finding nothing is not an error: it means there's nothing to do.
pub fn scan<B: UsbBus>(
    bus: &B,
    spec: &TargetSpec,
    criteria: &Criteria,
    class: u8,
    configuration: u8,
    mode: SearchMode,
    pin: Option<BusPin>,
) -> ScanResult {
    let mut result = ScanResult::default();

    let mut vendor = criteria.vendor;
    let mut product = criteria.product;
    // Only a target class given: the device is expected to keep its IDs.
    if class != 0 && vendor == 0 && product.is_none() && criteria.product_list.is_empty() {
        vendor = spec.default_vendor;
        product = Some(spec.default_product);
    }

    if vendor == 0 || (product.is_none() && criteria.product_list.is_empty()) {
        return result;
    }

    let devices = match bus.devices() {
        Ok(d) => d,
        Err(e) => {
            warn!("Failed to access USB: {e}");
            return result;
        }
    };

    for record in &devices {
        let identity = &record.identity;

        if let SearchMode::BusDev(wanted) = mode {
            if identity.pin() != wanted {
                continue;
            }
            debug!(" bus/device number matched");
        }

        debug!("  searching devices, found USB ID {}", identity.id);
        if identity.id.vid != vendor {
            continue;
        }
        debug!("   found matching vendor ID");

        if !criteria.product_list.is_empty() {
            for entry in criteria.product_list {
                let listed = match parse_product_entry(entry) {
                    Ok(p) => p,
                    Err(e) => {
                        warn!("{e}. Ignoring");
                        continue;
                    }
                };
                if listed != identity.id.pid {
                    continue;
                }

                debug!("   found matching product ID from list");
                result.count += 1;
                match pin {
                    None => result.last_match = Some(record.clone()),
                    Some(p) if identity.bus == p.bus && identity.address >= p.address => {
                        result.last_match = Some(record.clone());
                        return result;
                    }
                    Some(_) => {}
                }
            }
        } else if product == Some(identity.id.pid) {
            debug!("   found matching product ID");
            if class == 0 && configuration < 1 {
                debug!("   adding device");
                result.add(record);
            } else if class != 0 {
                match_class(&mut result, record, class, mode);
            } else {
                match_configuration(&mut result, bus, record, configuration);
            }
        }
    }

    result
}

fn match_class(result: &mut ScanResult, record: &DeviceRecord, class: u8, mode: SearchMode) {
    let mut dev_class = record.identity.class;
    if dev_class == 0 {
        dev_class = record.first_interface().map(|i| i.class).unwrap_or(0);
    }

    if dev_class == class {
        debug!("   target class {class:02x} matching");
        if mode == SearchMode::Target {
            debug!("   adding device");
            result.add(record);
        } else {
            debug!("   not adding device");
        }
    } else {
        debug!("   target class {class:02x} not matching");
        if mode != SearchMode::Target {
            debug!("   adding device");
            result.add(record);
        }
    }
}

fn match_configuration<B: UsbBus>(
    result: &mut ScanResult,
    bus: &B,
    record: &DeviceRecord,
    configuration: u8,
) {
    let current = match bus.open(&record.identity) {
        Ok(mut handle) => current_configuration(&mut handle),
        Err(e) => {
            warn!("Could not open {} to check its configuration: {e}", record.identity.id);
            CurrentConfiguration::Assumed
        }
    };

    if current.value() != configuration {
        debug!(
            "   device configuration {} not matching parameter",
            current.value()
        );
        debug!("   adding device");
        result.add(record);
    } else {
        debug!("   not adding device, target configuration already set");
    }
}
