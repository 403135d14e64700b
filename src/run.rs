use crate::detach::detach_driver;
use crate::device_ids::{BusPin, MASS_STORAGE_CLASS, TargetSpec, UsbId};
use crate::inspect::{
    CurrentConfiguration, current_configuration, describe_class, first_bulk_endpoint, inquire,
    interface_class, read_description, resolve_class,
};
use crate::protocol::{
    CBW_SIGNATURE, ConfigError, Error, SwitchContext, SwitchOutcome, SwitchProcedure,
    reset_device, run_procedure, send_messages, switch_alt_setting, switch_configuration,
};
use crate::scanner::{Criteria, SearchMode, scan};
use crate::session::{CancelToken, Session};
use crate::transport::decode_message;
use crate::usb::UsbBus;
use crate::verify::{Verdict, Verifier};
use log::{info, warn};
use rusb::Direction;
use std::fmt::Display;
use std::time::Duration;

/// Everything one run needs to know, as produced by the command line.
#[derive(Clone, Debug, PartialEq)]
pub struct Options {
    pub target: TargetSpec,
    pub procedure: Option<SwitchProcedure>,
    /// Up to three hex messages for the generic bulk path. Empty ones are skipped.
    pub messages: Vec<String>,
    pub need_response: bool,
    pub message_endpoint: Option<u8>,
    pub response_endpoint: Option<u8>,
    pub interface: Option<u8>,
    pub alt_setting: Option<u8>,
    pub release_delay: Duration,
    pub reset_usb: bool,
    /// Iterations of the success check; 0 disables it.
    pub check_success: u32,
    /// Print a machine-readable result line for the calling wrapper.
    pub sysmode: bool,
    pub inquire: bool,
    pub no_driver_loading: bool,
    pub pin: Option<BusPin>,
    /// Length of one polling iteration.
    pub poll_interval: Duration,
}

impl Options {
    pub fn new(target: TargetSpec) -> Self {
        Self {
            target,
            procedure: None,
            messages: vec![],
            need_response: false,
            message_endpoint: None,
            response_endpoint: None,
            interface: None,
            alt_setting: None,
            release_delay: Duration::ZERO,
            reset_usb: false,
            check_success: 0,
            sysmode: false,
            inquire: true,
            no_driver_loading: false,
            pin: None,
            poll_interval: Duration::from_secs(1),
        }
    }

    fn first_message(&self) -> &str {
        self.messages.first().map_or("", String::as_str)
    }
}

/// The line a wrapper script parses from stdout.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum TerminalLine {
    Ok,
    OkId(UsbId),
    OkNoData,
    /// The wrapper has to judge success itself.
    OkBusdev,
    Fail,
}

impl Display for TerminalLine {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            TerminalLine::Ok => write!(f, "ok:"),
            TerminalLine::OkId(id) => write!(f, "ok:{id}"),
            TerminalLine::OkNoData => write!(f, "ok:no_data"),
            TerminalLine::OkBusdev => write!(f, "ok:busdev"),
            TerminalLine::Fail => write!(f, "fail:"),
        }
    }
}

/// What a run did, short of a fatal error.
#[derive(Clone, Debug, PartialEq)]
pub enum Report {
    /// No device in default mode was found; nothing was touched.
    NothingToDo,
    Finished {
        switch: Option<SwitchOutcome>,
        verdict: Option<Verdict>,
        terminal: Option<TerminalLine>,
    },
}

impl Report {
    pub fn terminal(&self) -> Option<TerminalLine> {
        match self {
            Report::NothingToDo => None,
            Report::Finished { terminal, .. } => *terminal,
        }
    }
}

/// Find the device in default mode, switch it, and check the result.
pub fn run<B: UsbBus>(bus: &B, options: &Options, cancel: &CancelToken) -> Result<Report, Error> {
    let spec = options.target.clone().validate()?;
    let first_message = options.first_message();
    if !first_message.is_empty() {
        decode_message(first_message).map_err(ConfigError::BadMessage)?;
    }

    let mode = match options.pin {
        Some(pin) => {
            info!("Use given bus/device number: {pin} ...");
            SearchMode::BusDev(pin)
        }
        None => SearchMode::Default,
    };

    if options.check_success > 0 && !spec.has_target() {
        info!("Note: target parameter missing; success check limited");
    }

    // Remember how many target devices exist already, for the success check.
    let mut baseline = 0;
    if (spec.target_vendor.is_set() || spec.target_class != 0) && options.pin.is_none() {
        info!("Looking for target devices ...");
        baseline = scan(
            bus,
            &spec,
            &Criteria::target_mode(&spec),
            spec.target_class,
            0,
            SearchMode::Target,
            None,
        )
        .count;
        if baseline > 0 {
            info!(" Found devices in target mode or class ({baseline})");
        } else {
            info!(" No devices in target mode or class found");
        }
    }

    info!("Looking for default devices ...");
    let wanted_configuration = spec.desired_configuration.unwrap_or(0);
    let found = scan(
        bus,
        &spec,
        &Criteria::default_mode(&spec),
        spec.target_class,
        wanted_configuration,
        mode,
        options.pin,
    );
    if found.count == 0 {
        info!(" No devices in default mode found. Nothing to do. Bye.");
        return Ok(Report::NothingToDo);
    }
    info!(
        " Found device in default mode, class or configuration ({})",
        found.count
    );
    let Some(record) = found.last_match else {
        info!(" No bus/device match. Is device connected? Bye.");
        return Ok(Report::NothingToDo);
    };

    let pin = record.identity.pin();
    info!("Accessing device {:03} on bus {:03} ...", pin.address, pin.bus);
    let mut handle = bus
        .open(&record.identity)
        .map_err(|source| Error::Usb {
            source,
            action: "opening the device",
        })?;
    let configuration = current_configuration(&mut handle);

    let interface = options
        .interface
        .or_else(|| record.first_interface().map(|i| i.number))
        .unwrap_or(0);
    info!("Using interface number {interface}");
    let mut session = Session::new(handle, interface);
    session.set_configuration(configuration.value());

    let desired_configuration = spec.desired_configuration.filter(|c| *c > 0);
    let desired_configuration = match configuration {
        CurrentConfiguration::Assumed if desired_configuration.is_some() => {
            info!("No configuration setting possible for this device.");
            None
        }
        _ => desired_configuration,
    };

    let iface_class = record
        .first_config()
        .and_then(|c| interface_class(c, interface))
        .ok_or(Error::UnknownInterface(interface))?;
    let class = resolve_class(record.identity.class, iface_class);
    info!("Default device class is {}", describe_class(class));

    if first_message.starts_with(CBW_SIGNATURE) && class != MASS_STORAGE_CLASS {
        return Err(Error::StorageCommandMismatch { interface, class });
    }

    // Endpoints.
    let message_endpoint = options
        .message_endpoint
        .or_else(|| first_bulk_endpoint(&record, Direction::Out));
    let response_endpoint = options
        .response_endpoint
        .or_else(|| first_bulk_endpoint(&record, Direction::In));
    let needs_endpoints =
        !first_message.is_empty() || options.procedure.is_some_and(|p| p.needs_endpoints());
    if needs_endpoints {
        if message_endpoint.is_none() {
            return Err(Error::EndpointNotFound("message"));
        }
        if response_endpoint.is_none() {
            return Err(Error::EndpointNotFound("response"));
        }
    }
    if let (Some(m), Some(r)) = (message_endpoint, response_endpoint) {
        info!("Using endpoints {m:#04x} (out) and {r:#04x} (in)");
    }

    let mut driver_detached = false;
    if options.inquire && class == MASS_STORAGE_CLASS {
        match (message_endpoint, response_endpoint) {
            (Some(m), Some(r)) => {
                info!("Inquiring device details; driver will be detached ...");
                if let Some(h) = session.handle_mut() {
                    detach_driver(h, interface);
                }
                if let Some(data) = inquire(&mut session, m, r) {
                    info!("SCSI inquiry data (for identification)");
                    info!("  Vendor String: {}", data.vendor);
                    info!("   Model String: {}", data.model);
                    info!("Revision String: {}", data.revision);
                    driver_detached = true;
                }
            }
            _ => info!("Endpoints not found, skipping SCSI inquiry"),
        }
    } else if options.inquire {
        info!("Not a storage device, skipping SCSI inquiry");
    }

    if let Some(h) = session.handle_mut() {
        let description = read_description(h, &record);
        info!("USB description data (for identification)\n{description}");
    }

    if options.procedure.is_none()
        && first_message.is_empty()
        && options.alt_setting.is_none()
        && spec.desired_configuration.is_none()
    {
        warn!("No switching method given.");
    }

    if options.sysmode {
        info!("switching device {} on {pin}", spec.default_id());
    }

    let mut ctx = SwitchContext {
        bus,
        spec: &spec,
        session: &mut session,
        message_endpoint,
        response_endpoint,
        release_delay: options.release_delay,
        poll_interval: options.poll_interval,
        driver_detached,
        cancel,
    };

    let mut switch = None;
    if let Some(procedure) = options.procedure {
        switch = Some(run_procedure(&mut ctx, procedure)?);
    }

    if options.messages.iter().any(|m| !m.is_empty()) {
        if options.procedure.is_some() {
            warn!("Ignoring MessageContent. Can't combine with special mode");
        } else {
            if !ctx.driver_detached {
                if let Some(h) = ctx.session.handle_mut() {
                    detach_driver(h, interface);
                }
            }
            switch = Some(send_messages(&mut ctx, &options.messages, options.need_response)?);
        }
    }

    if let Some(wanted) = desired_configuration {
        if session.configuration() != wanted {
            if switch_configuration(&mut session, wanted) {
                if let Some(h) = session.handle_mut() {
                    let now = current_configuration(h).value();
                    session.set_configuration(now);
                }
                if session.configuration() == wanted {
                    info!("The configuration was set successfully");
                } else {
                    warn!("Changing the configuration has failed");
                }
            }
        } else {
            info!("Target configuration {wanted} already active. Doing nothing");
        }
    }

    if let Some(setting) = options.alt_setting {
        switch_alt_setting(&mut session, setting);
    }

    // A changed configuration or alt setting can't be detected by removal.
    if (desired_configuration.is_some() || options.alt_setting.is_some()) && !options.reset_usb {
        session.close();
    }

    if options.reset_usb {
        reset_device(&mut session, options.poll_interval, cancel)?;
        session.close();
    }

    // Sony devices are checked as part of the procedure itself.
    if options.procedure == Some(SwitchProcedure::Sony) {
        if options.check_success > 0 {
            info!("Note: ignoring CheckSuccess. Separate checks for Sony mode");
        }
        let sent = switch == Some(SwitchOutcome::Sent);
        if sent {
            info!("-> device should be stable now. Bye.");
        } else {
            info!("-> switching was probably not completed. Bye.");
        }
        return Ok(Report::Finished {
            switch,
            verdict: None,
            terminal: options.sysmode.then_some(if sent {
                TerminalLine::Ok
            } else {
                TerminalLine::Fail
            }),
        });
    }

    if options.check_success == 0 {
        info!("-> Run lsusb to note any changes. Bye.");
        return Ok(Report::Finished {
            switch,
            verdict: None,
            terminal: None,
        });
    }

    if options.pin.is_some() && options.sysmode {
        info!("Bus/dev search active, referring success check to wrapper. Bye.");
        return Ok(Report::Finished {
            switch,
            verdict: None,
            terminal: Some(TerminalLine::OkBusdev),
        });
    }

    let verdict = Verifier::new(
        bus,
        &spec,
        options.check_success,
        options.poll_interval,
        cancel,
    )
    .baseline(baseline)
    .pin(pin)
    .check(&mut session)?;

    let terminal = options.sysmode.then(|| match &verdict {
        Verdict::Failed => TerminalLine::Fail,
        _ if options.no_driver_loading => TerminalLine::Ok,
        Verdict::Confirmed { identity, .. } => TerminalLine::OkId(identity.id),
        Verdict::Vanished => TerminalLine::OkNoData,
    });

    Ok(Report::Finished {
        switch,
        verdict: Some(verdict),
        terminal,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_lines() {
        let id = UsbId {
            vid: 0x12d1,
            pid: 0x14ac,
        };
        assert_eq!(TerminalLine::OkId(id).to_string(), "ok:12d1:14ac");
        assert_eq!(TerminalLine::Ok.to_string(), "ok:");
        assert_eq!(TerminalLine::OkNoData.to_string(), "ok:no_data");
        assert_eq!(TerminalLine::OkBusdev.to_string(), "ok:busdev");
        assert_eq!(TerminalLine::Fail.to_string(), "fail:");
    }
}
