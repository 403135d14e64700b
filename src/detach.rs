use crate::usb::UsbHandle;
use log::{debug, info};

/// What became of the kernel driver bound to an interface.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum DetachOutcome {
    NotAttached,
    Detached,
    /// The platform can't tell or can't detach; the operator may have to unload the driver.
    Unsupported,
    /// A driver is bound and refused to let go. Switching is attempted anyway.
    DetachFailed(rusb::Error),
}

/// Detach whatever kernel driver holds `interface`, so the interface can be claimed.
pub fn detach_driver<H: UsbHandle>(handle: &mut H, interface: u8) -> DetachOutcome {
    info!("Looking for active drivers ...");

    match handle.kernel_driver_active(interface) {
        Ok(true) => {}
        Ok(false) => {
            info!(" No active driver found. Detached before or never attached");
            return DetachOutcome::NotAttached;
        }
        Err(rusb::Error::NotSupported) => {
            info!(" Can't do driver detection on this platform.");
            return DetachOutcome::Unsupported;
        }
        Err(e) => {
            debug!(" Driver query on interface {interface} failed: {e}");
            info!(" No active driver found. Detached before or never attached");
            return DetachOutcome::NotAttached;
        }
    }

    if !handle.supports_detach() {
        info!(" Can't detach drivers on this platform.");
        return DetachOutcome::Unsupported;
    }

    match handle.detach_kernel_driver(interface) {
        Ok(()) => {
            info!(" OK, driver detached");
            DetachOutcome::Detached
        }
        Err(e) => {
            info!(" Driver detach failed ({e}). Trying to continue");
            DetachOutcome::DetachFailed(e)
        }
    }
}
