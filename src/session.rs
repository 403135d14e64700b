use crate::protocol::Error;
use crate::usb::UsbHandle;
use log::{debug, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::sleep;
use std::time::{Duration, Instant};

/// The one device handle a run owns, the interface it works on, and whether that interface is
/// currently claimed. Dropping the session releases the claim and closes the handle, whichever
/// way the run ends.
pub struct Session<H: UsbHandle> {
    handle: Option<H>,
    interface: u8,
    claimed: bool,
    configuration: u8,
}

impl<H: UsbHandle> Session<H> {
    pub fn new(handle: H, interface: u8) -> Self {
        Self {
            handle: Some(handle),
            interface,
            claimed: false,
            configuration: 0,
        }
    }

    pub fn is_open(&self) -> bool {
        self.handle.is_some()
    }

    pub fn interface(&self) -> u8 {
        self.interface
    }

    /// The configuration value the run currently believes is active.
    pub fn configuration(&self) -> u8 {
        self.configuration
    }

    pub fn set_configuration(&mut self, configuration: u8) {
        self.configuration = configuration;
    }

    pub fn handle_mut(&mut self) -> Option<&mut H> {
        self.handle.as_mut()
    }

    /// Claim the session's interface. A closed session behaves like a vanished device.
    pub fn claim(&mut self) -> rusb::Result<()> {
        let interface = self.interface;
        let handle = self.handle.as_mut().ok_or(rusb::Error::NoDevice)?;
        handle.claim_interface(interface)?;
        self.claimed = true;
        Ok(())
    }

    pub fn release(&mut self) -> rusb::Result<()> {
        let interface = self.interface;
        let handle = self.handle.as_mut().ok_or(rusb::Error::NoDevice)?;
        self.claimed = false;
        handle.release_interface(interface)
    }

    /// Release any claim and close the handle. Closing a closed session does nothing.
    pub fn close(&mut self) {
        if self.claimed {
            if let Err(e) = self.release() {
                debug!("Releasing interface {} on close: {e}", self.interface);
            }
        }

        if self.handle.take().is_some() {
            debug!("Closed device handle");
        }
    }

    /// Swap in a handle for a device that came back under a new address.
    pub fn reopen(&mut self, handle: H) {
        self.close();
        self.handle = Some(handle);
    }
}

impl<H: UsbHandle> Drop for Session<H> {
    fn drop(&mut self) {
        self.close();
    }
}

/// Set from a signal handler when the operator wants out. Checked at every wait and between
/// the steps of multi-message sequences.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    pub fn check(&self) -> Result<(), Error> {
        if self.is_cancelled() {
            warn!("Program cancelled by system. Bye.");
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Sleep for `duration`, waking early with [Error::Cancelled] if cancelled meanwhile.
    pub fn sleep(&self, duration: Duration) -> Result<(), Error> {
        const SLICE: Duration = Duration::from_millis(50);

        let deadline = Instant::now() + duration;
        loop {
            self.check()?;
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            sleep(SLICE.min(deadline - now));
        }
    }
}
