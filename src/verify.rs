use crate::device_ids::{BusPin, DeviceIdentity, OptionalId, TargetSpec};
use crate::inspect::{DeviceDescription, read_description};
use crate::protocol::Error;
use crate::scanner::{Criteria, SearchMode, scan};
use crate::session::{CancelToken, Session};
use crate::usb::UsbBus;
use log::{info, warn};
use std::time::Duration;

/// How the success check ended.
#[derive(Clone, Debug, PartialEq)]
pub enum Verdict {
    /// A new device with the target identity showed up.
    Confirmed {
        identity: DeviceIdentity,
        description: Option<DeviceDescription>,
    },
    /// No target identity to look for, but the original device went away.
    Vanished,
    Failed,
}

/// Polls for the outcome of a switch, one iteration per `interval`. Both phases share a
/// single budget of `budget` iterations.
pub struct Verifier<'a, B: UsbBus> {
    bus: &'a B,
    spec: TargetSpec,
    budget: u32,
    interval: Duration,
    /// Number of target devices present before switching.
    baseline: usize,
    pin: Option<BusPin>,
    cancel: &'a CancelToken,
}

impl<'a, B: UsbBus> Verifier<'a, B> {
    pub fn new(
        bus: &'a B,
        spec: &TargetSpec,
        budget: u32,
        interval: Duration,
        cancel: &'a CancelToken,
    ) -> Self {
        let mut spec = spec.clone();
        // A class-only target keeps its IDs.
        if !spec.target_vendor.is_set() && spec.target_class != 0 {
            spec.target_vendor = OptionalId(Some(spec.default_vendor));
            spec.target_product = OptionalId(Some(spec.default_product));
        }

        Self {
            bus,
            spec,
            budget,
            interval,
            baseline: 0,
            pin: None,
            cancel,
        }
    }

    pub fn baseline(mut self, baseline: usize) -> Self {
        self.baseline = baseline;
        self
    }

    /// Restrict the target search to the bus of the switched device.
    pub fn pin(mut self, pin: BusPin) -> Self {
        self.pin = Some(pin);
        self
    }

    pub fn check(&self, session: &mut Session<B::Handle>) -> Result<Verdict, Error> {
        info!(
            "Checking for mode switch (max. {} times, once per second) ...",
            self.budget
        );
        self.cancel.sleep(self.interval)?;

        // A new device is expected; the original one may well stay around.
        if self.spec.target_vendor.is_set() || self.spec.target_class != 0 {
            session.close();
        }

        let mut i = 0;
        if session.is_open() {
            while i < self.budget {
                info!(" Waiting for original device to vanish ...");
                let claimed = session.claim();
                session.release().ok();
                if claimed.is_err() {
                    info!(" Original device can't be accessed anymore. Good.");
                    session.close();
                    break;
                }

                if i + 1 == self.budget {
                    info!(" Original device still present after the timeout");
                    info!("Mode switch most likely failed. Bye.");
                } else {
                    self.cancel.sleep(self.interval)?;
                }
                i += 1;
            }
        }

        if self.spec.target_vendor.is_set() && self.spec.has_target_product() {
            return self.search_target(i);
        }

        if session.is_open() {
            return Ok(Verdict::Failed);
        }
        info!(" (For a better success check provide target IDs or class)");
        info!(" Original device vanished after switching");
        info!("Mode switch most likely succeeded. Bye.");
        Ok(Verdict::Vanished)
    }

    fn search_target(&self, mut i: u32) -> Result<Verdict, Error> {
        let criteria = Criteria::target_mode(&self.spec);

        while i < self.budget {
            self.cancel.check()?;
            info!(" Searching for target devices ...");
            let found = scan(
                self.bus,
                &self.spec,
                &criteria,
                self.spec.target_class,
                0,
                SearchMode::Target,
                self.pin,
            );

            if let Some(record) = found.last_match.filter(|_| found.count > self.baseline) {
                info!("Found target device, now opening");
                let description = match self.bus.open(&record.identity) {
                    Ok(mut handle) => Some(read_description(&mut handle, &record)),
                    Err(e) => {
                        warn!("Could not open target device: {e}");
                        None
                    }
                };

                info!(
                    "Found target device {:03} on bus {:03}",
                    record.identity.address, record.identity.bus
                );
                if let Some(description) = &description {
                    info!("Target device description data\n{description}");
                }
                info!(" Found correct target device");
                info!("Mode switch succeeded. Bye.");
                return Ok(Verdict::Confirmed {
                    identity: record.identity,
                    description,
                });
            }

            if i + 1 == self.budget {
                info!(" No new devices in target mode or class found");
                info!("Mode switch has failed. Bye.");
            } else {
                self.cancel.sleep(self.interval)?;
            }
            i += 1;
        }

        Ok(Verdict::Failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockBus, MockCall, device};

    fn open_session(bus: &MockBus) -> Session<crate::mock::MockHandle> {
        let identity = bus.devices().unwrap()[0].identity;
        Session::new(bus.open(&identity).unwrap(), 0)
    }

    #[test]
    fn vanished_without_target() {
        let bus = MockBus::new(vec![device(1, 2, 0x12d1, 0x1446)]);
        let mut session = open_session(&bus);
        bus.replace_devices(Vec::<crate::usb::DeviceRecord>::new());

        let cancel = CancelToken::new();
        let spec = TargetSpec::new(0x12d1, 0x1446);
        let verdict = Verifier::new(&bus, &spec, 5, Duration::ZERO, &cancel)
            .check(&mut session)
            .unwrap();

        assert_eq!(verdict, Verdict::Vanished);
        assert!(!session.is_open());
    }

    #[test]
    fn still_present_fails_after_budget() {
        let bus = MockBus::new(vec![device(1, 2, 0x12d1, 0x1446)]);
        let mut session = open_session(&bus);

        let cancel = CancelToken::new();
        let spec = TargetSpec::new(0x12d1, 0x1446);
        let verdict = Verifier::new(&bus, &spec, 3, Duration::ZERO, &cancel)
            .check(&mut session)
            .unwrap();

        assert_eq!(verdict, Verdict::Failed);
        let claims = bus
            .calls()
            .into_iter()
            .filter(|c| *c == MockCall::Claim(0))
            .count();
        assert_eq!(claims, 3);
    }

    #[test]
    fn target_must_outnumber_baseline() {
        let bus = MockBus::new(vec![device(1, 3, 0x12d1, 0x14ac)]);
        let cancel = CancelToken::new();
        let spec = TargetSpec {
            target_vendor: 0x12d1.into(),
            target_product: 0x14ac.into(),
            ..TargetSpec::new(0x12d1, 0x1446)
        };

        let mut session = open_session(&bus);
        let verdict = Verifier::new(&bus, &spec, 3, Duration::ZERO, &cancel)
            .baseline(1)
            .check(&mut session)
            .unwrap();
        assert_eq!(verdict, Verdict::Failed);

        let mut session = open_session(&bus);
        let verdict = Verifier::new(&bus, &spec, 3, Duration::ZERO, &cancel)
            .check(&mut session)
            .unwrap();
        let Verdict::Confirmed {
            identity,
            description,
        } = verdict
        else {
            panic!("target not confirmed");
        };
        assert_eq!(identity.address, 3);
        assert_eq!(description.unwrap().product, "Mock Modem");
    }

    #[test]
    fn class_only_target_uses_default_ids() {
        let bus = MockBus::new(vec![device(1, 2, 0x12d1, 0x1446)]);
        let cancel = CancelToken::new();
        let spec = TargetSpec {
            target_class: 0xff,
            ..TargetSpec::new(0x12d1, 0x1446)
        };

        let verifier = Verifier::new(&bus, &spec, 1, Duration::ZERO, &cancel);
        assert_eq!(verifier.spec.target_vendor, OptionalId(Some(0x12d1)));
        assert_eq!(verifier.spec.target_product, OptionalId(Some(0x1446)));
    }
}
