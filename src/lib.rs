/// Host USB access: device enumeration, handles and transfers, backed by libusb.
pub mod usb;

/// USB IDs, bus positions, and the default/target identities of a device.
pub mod device_ids;

/// Find devices in default or target mode on the bus.
pub mod scanner;

/// Read configuration, interface classes, endpoints and description data of a device.
pub mod inspect;

/// Get kernel drivers out of the way before talking to an interface.
pub mod detach;

/// Bulk and interrupt transfers that treat a vanishing device as an outcome, not an error.
pub mod transport;

/// Ownership of the open device handle, and cancellation.
pub mod session;

/// Vendor-specific switching procedures, plus configuration, alt-setting and reset actions.
pub mod protocol;

/// Poll for the switched device after the procedure has run.
pub mod verify;

/// One complete switching run, from discovery to the success check.
pub mod run;

/// In-memory bus for driving the above without hardware.
#[cfg(any(test, feature = "mock"))]
pub mod mock;
