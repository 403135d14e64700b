use crate::protocol::ConfigError;
use byteorder::{BE, ByteOrder};
use log::warn;
use std::fmt::{Display, LowerHex, Write};
use thiserror::Error;

/// USB class code of mass storage interfaces.
pub const MASS_STORAGE_CLASS: u8 = 0x08;

/// A USB vendor ID and product ID pair.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct UsbId {
    pub vid: u16,
    pub pid: u16,
}

impl Display for UsbId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:04x}:{:04x}", self.vid, self.pid)
    }
}

/// Where a device sits on the host, as assigned at enumeration time.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BusPin {
    pub bus: u8,
    pub address: u8,
}

impl Display for BusPin {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:03}/{:03}", self.bus, self.address)
    }
}

/// What a device looked like when it was enumerated. Stale the instant the device is reset,
/// reconfigured or removed.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub bus: u8,
    pub address: u8,
    pub id: UsbId,
    /// `bDeviceClass`; 0 means "defined per interface".
    pub class: u8,
}

impl DeviceIdentity {
    pub fn pin(&self) -> BusPin {
        BusPin {
            bus: self.bus,
            address: self.address,
        }
    }
}

/// A 16-bit ID that may be unset. Prints as `????` when unset.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct OptionalId(pub Option<u16>);

impl OptionalId {
    pub fn is_set(&self) -> bool {
        self.0.is_some()
    }

    fn fmt_helper<F>(&self, f: &mut std::fmt::Formatter, delegate: F) -> std::fmt::Result
    where
        F: FnOnce(&u16, &mut std::fmt::Formatter) -> std::fmt::Result,
    {
        match self.0 {
            Some(id) => delegate(&id, f),
            None => {
                for _ in 0..f.width().unwrap_or(4) {
                    f.write_char('?')?
                }
                Ok(())
            }
        }
    }
}

impl Display for OptionalId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        self.fmt_helper(f, Display::fmt)
    }
}

impl LowerHex for OptionalId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        self.fmt_helper(f, LowerHex::fmt)
    }
}

/// Zero is how the configuration loader says "not given".
impl From<u16> for OptionalId {
    fn from(val: u16) -> Self {
        OptionalId(match val {
            0 => None,
            i => Some(i),
        })
    }
}

/// Identities a device has before and after switching.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TargetSpec {
    pub default_vendor: u16,
    pub default_product: u16,
    pub target_vendor: OptionalId,
    pub target_product: OptionalId,
    /// Overrides `target_product` when non-empty. Entries are kept as given and decoded on
    /// every scan so that one bad entry can't spoil the others.
    pub target_product_list: Vec<String>,
    /// 0 means unset.
    pub target_class: u8,
    pub desired_configuration: Option<u8>,
}

impl TargetSpec {
    pub fn new(default_vendor: u16, default_product: u16) -> Self {
        Self {
            default_vendor,
            default_product,
            ..Default::default()
        }
    }

    pub fn default_id(&self) -> UsbId {
        UsbId {
            vid: self.default_vendor,
            pid: self.default_product,
        }
    }

    /// Check the mandatory fields and resolve the list/product precedence.
    pub fn validate(mut self) -> Result<Self, ConfigError> {
        if self.default_vendor == 0 || self.default_product == 0 {
            return Err(ConfigError::MissingDefaultIds);
        }

        if self.target_product.is_set() && !self.target_product_list.is_empty() {
            warn!("TargetProductList overrides TargetProduct!");
            self.target_product = OptionalId(None);
        }

        Ok(self)
    }

    /// Whether the run knows anything at all about the switched device.
    pub fn has_target(&self) -> bool {
        self.target_vendor.is_set()
            || self.target_product.is_set()
            || !self.target_product_list.is_empty()
            || self.target_class != 0
    }

    /// Whether a target device can be recognised by product, not just vendor.
    pub fn has_target_product(&self) -> bool {
        self.target_product.is_set() || !self.target_product_list.is_empty()
    }
}

/// Reasons an entry of a target product list is ignored.
#[derive(Error, Debug, PartialEq)]
#[non_exhaustive]
pub enum ProductEntryError {
    #[error("entry in product ID list has wrong length: {0}")]
    WrongLength(String),

    #[error("entry in product ID list is not a hex string: {0}")]
    NotHex(String),
}

/// Decode one 4-hex-digit entry of a target product list.
pub fn parse_product_entry(entry: &str) -> Result<u16, ProductEntryError> {
    if entry.len() != 4 {
        return Err(ProductEntryError::WrongLength(entry.to_owned()));
    }

    let bytes = hex::decode(entry).map_err(|_| ProductEntryError::NotHex(entry.to_owned()))?;
    Ok(BE::read_u16(&bytes))
}
