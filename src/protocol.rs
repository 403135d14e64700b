use crate::detach::{DetachOutcome, detach_driver};
use crate::device_ids::TargetSpec;
use crate::scanner::{Criteria, SearchMode, scan};
use crate::session::{CancelToken, Session};
use crate::transport::{
    MessageError, TransferOutcome, read_bulk, read_interrupt, send_message, write_interrupt,
};
use crate::usb::{UsbBus, UsbHandle};
use log::{info, warn};
use std::fmt::Display;
use std::time::Duration;
use thiserror::Error;

const CONTROL_TIMEOUT: Duration = Duration::from_millis(1000);
const SWITCH_CONFIG_MAXTRIES: u32 = 5;
const RESET_MAXTRIES: u32 = 100;
/// Signature of a mass storage command block wrapper ("USBC").
pub const CBW_SIGNATURE: &str = "55534243";
const CSW_LEN: usize = 13;

/// How the data stage of a control transfer looks.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum ControlData {
    Out(&'static [u8]),
    /// Read this many bytes.
    In(u16),
}

/// What a control transfer has to return for the run to go on.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Check {
    /// Exactly this many bytes, or the run is aborted.
    Exactly(usize),
    /// Like [Check::Exactly], but a stall means the device is already switching.
    ExactlyOrPipe(usize),
    /// Any non-error result, or the run is aborted.
    Succeeds,
    /// Errors are logged and ignored.
    Lenient,
    /// Not looked at.
    Ignored,
}

/// One literal control transfer of a vendor procedure.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct ControlStep {
    pub label: &'static str,
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    /// Use the session's interface number as `wIndex` instead of `index`.
    pub index_is_interface: bool,
    pub data: ControlData,
    pub timeout: Duration,
    pub check: Check,
}

const fn control(
    label: &'static str,
    request_type: u8,
    request: u8,
    value: u16,
    data: ControlData,
    check: Check,
) -> ControlStep {
    ControlStep {
        label,
        request_type,
        request,
        value,
        index: 0,
        index_is_interface: false,
        data,
        timeout: CONTROL_TIMEOUT,
        check,
    }
}

/// Steps of an interrupt-endpoint procedure.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum InterruptStep {
    Control(ControlStep),
    Write(&'static [u8]),
    /// Read one packet this many times, ignoring the results.
    Read(usize),
}

/// The shape of a vendor procedure, with all its literal data.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Plan {
    DetachOnly,
    Control {
        claim: bool,
        steps: &'static [ControlStep],
    },
    Interrupt {
        out_endpoint: u8,
        in_endpoint: u8,
        packet: usize,
        steps: &'static [InterruptStep],
    },
    BulkSequence {
        messages: &'static [&'static str],
    },
    /// Send `step`, wait for the device to come back, send `step` again.
    ReconnectResend {
        step: ControlStep,
        attempts: u32,
        /// Seconds to wait before looking for the device at all.
        grace: u32,
    },
}

const STANDARD_DEVICE_OUT: u8 = 0x00;
const VENDOR_DEVICE_OUT: u8 = 0x40;
const VENDOR_DEVICE_IN: u8 = 0xc0;
const CLASS_INTERFACE_OUT: u8 = 0x21;
const CLASS_INTERFACE_IN: u8 = 0xa1;
const REQUEST_SET_FEATURE: u8 = 0x03;

const HUAWEI: [ControlStep; 1] = [control(
    "Huawei control message",
    STANDARD_DEVICE_OUT,
    REQUEST_SET_FEATURE,
    1,
    ControlData::Out(&[]),
    Check::Exactly(0),
)];

const SIERRA: [ControlStep; 1] = [control(
    "Sierra control message",
    VENDOR_DEVICE_OUT,
    0x0b,
    1,
    ControlData::Out(&[]),
    Check::ExactlyOrPipe(0),
)];

// Set device mode request, custom mode.
const SEQUANS: [ControlStep; 1] = [control(
    "Sequans vendor request",
    VENDOR_DEVICE_OUT,
    0x0b,
    0x02,
    ControlData::Out(&[]),
    Check::Exactly(0),
)];

const QISDA_PAYLOAD: [u8; 16] = [
    0x05, 0x8c, 0x04, 0x08, 0xa0, 0xee, 0x20, 0x00, 0x5c, 0x01, 0x04, 0x08, 0x98, 0xcd, 0xea, 0xbf,
];

const QISDA: [ControlStep; 1] = [control(
    "Qisda control message",
    VENDOR_DEVICE_OUT,
    0x04,
    0,
    ControlData::Out(&QISDA_PAYLOAD),
    Check::Exactly(QISDA_PAYLOAD.len()),
)];

const KOBIL: [ControlStep; 1] = [control(
    "Kobil control message",
    VENDOR_DEVICE_IN,
    0x88,
    0,
    ControlData::In(8),
    Check::Exactly(0),
)];

const QUANTA: [ControlStep; 1] = [control(
    "Quanta control message",
    VENDOR_DEVICE_IN,
    0xff,
    0,
    ControlData::In(0),
    Check::Lenient,
)];

const PANTECH: [ControlStep; 1] = [control(
    "Pantech control message",
    VENDOR_DEVICE_OUT,
    0x70,
    2,
    ControlData::Out(&[]),
    Check::Lenient,
)];

const BLACKBERRY: [ControlStep; 2] = [
    control(
        "Blackberry control message 1",
        VENDOR_DEVICE_IN,
        0xb1,
        0,
        ControlData::In(8),
        Check::Exactly(8),
    ),
    control(
        "Blackberry control message 2",
        VENDOR_DEVICE_IN,
        0xa9,
        0x0e,
        ControlData::In(2),
        Check::Exactly(2),
    ),
];

const GCT: [ControlStep; 2] = [
    ControlStep {
        index_is_interface: true,
        ..control(
            "GCT control message 1",
            CLASS_INTERFACE_IN,
            0xa0,
            0,
            ControlData::In(1),
            Check::Ignored,
        )
    },
    ControlStep {
        index_is_interface: true,
        ..control(
            "GCT control message 2",
            CLASS_INTERFACE_IN,
            0xfe,
            0,
            ControlData::In(1),
            Check::Ignored,
        )
    },
];

const SONY: ControlStep = ControlStep {
    timeout: Duration::from_millis(100),
    ..control(
        "Sony control message",
        VENDOR_DEVICE_IN,
        0x11,
        2,
        ControlData::In(3),
        Check::Succeeds,
    )
};

const MOBILE_ACTION_SETUP: ControlStep = ControlStep {
    value: 0x0300,
    ..control(
        "MobileAction setup report",
        CLASS_INTERFACE_OUT,
        0x09,
        0,
        ControlData::Out(&[0xb0, 0x04, 0x00, 0x00, 0x02, 0x90, 0x26, 0x86]),
        Check::Ignored,
    )
};

const MA_1: &[u8] = &[0x37, 0x01, 0xfe, 0xdb, 0xc1, 0x33, 0x1f, 0x83];
const MA_2: &[u8] = &[0x37, 0x0e, 0xb5, 0x9d, 0x3b, 0x8a, 0x91, 0x51];
const MA_3: &[u8] = &[0x34, 0x87, 0xba, 0x0d, 0xfc, 0x8a, 0x91, 0x51];
const MA_4: &[u8] = &[0x33, 0x04, 0xfe, 0x00, 0xf4, 0x6c, 0x1f, 0xf0];
const MA_5: &[u8] = &[0x32, 0x07, 0xfe, 0xf0, 0x29, 0xb9, 0x3a, 0xf0];

const MOBILE_ACTION: [InterruptStep; 19] = {
    use InterruptStep::*;
    [
        Control(MOBILE_ACTION_SETUP),
        Control(MOBILE_ACTION_SETUP),
        Read(2),
        Write(MA_1),
        Read(1),
        Write(MA_2),
        Read(1),
        Write(MA_3),
        Read(63),
        Write(MA_1),
        Read(1),
        Write(MA_2),
        Read(1),
        Write(MA_3),
        Read(73),
        Write(MA_4),
        Read(1),
        Write(MA_5),
        Read(1),
    ]
};

const CISCO: [&str; 11] = [
    "55534243f83bcd810002000080000afd000000030000000100000000000000",
    "55534243984300820002000080000afd000000070000000100000000000000",
    "55534243984300820000000000000afd000100071000000000000000000000",
    "55534243984300820002000080000afd000200230000000100000000000000",
    "55534243984300820000000000000afd000300238200000000000000000000",
    "55534243984300820002000080000afd000200260000000100000000000000",
    "55534243984300820000000000000afd00030026c800000000000000000000",
    "55534243d84c04820002000080000afd000010730000000100000000000000",
    "55534243d84c04820002000080000afd000200240000000100000000000000",
    "55534243d84c04820000000000000afd000300241300000000000000000000",
    "55534243d84c04820000000000000afd000110732400000000000000000000",
];

/// Vendor-specific ways of kicking a device out of its default mode. At most one runs.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[non_exhaustive]
pub enum SwitchProcedure {
    DetachOnly,
    Huawei,
    Sierra,
    Sony,
    Gct,
    Kobil,
    Qisda,
    Quanta,
    Sequans,
    MobileAction,
    Cisco,
    Blackberry,
    Pantech,
}

impl Display for SwitchProcedure {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        use SwitchProcedure::*;
        let name = match self {
            DetachOnly => "DetachStorageOnly",
            Huawei => "Huawei",
            Sierra => "Sierra",
            Sony => "Sony",
            Gct => "GCT",
            Kobil => "Kobil",
            Qisda => "Qisda",
            Quanta => "Quanta",
            Sequans => "Sequans",
            MobileAction => "MobileAction",
            Cisco => "Cisco",
            Blackberry => "Blackberry",
            Pantech => "Pantech",
        };
        write!(f, "{name}")
    }
}

impl SwitchProcedure {
    /// Turn per-family switches into a single choice. Two or more switches set at once is a
    /// configuration error.
    pub fn from_flags(flags: &[(bool, SwitchProcedure)]) -> Result<Option<Self>, ConfigError> {
        let selected: Vec<_> = flags.iter().filter(|(on, _)| *on).map(|(_, p)| *p).collect();
        match selected.as_slice() {
            [] => Ok(None),
            [one] => Ok(Some(*one)),
            _ => Err(ConfigError::ConflictingModes(selected)),
        }
    }

    pub fn plan(&self) -> Plan {
        use SwitchProcedure::*;
        match self {
            DetachOnly => Plan::DetachOnly,
            Huawei => Plan::Control {
                claim: false,
                steps: &HUAWEI,
            },
            Sierra => Plan::Control {
                claim: false,
                steps: &SIERRA,
            },
            Sequans => Plan::Control {
                claim: false,
                steps: &SEQUANS,
            },
            Qisda => Plan::Control {
                claim: false,
                steps: &QISDA,
            },
            Kobil => Plan::Control {
                claim: false,
                steps: &KOBIL,
            },
            Quanta => Plan::Control {
                claim: false,
                steps: &QUANTA,
            },
            Pantech => Plan::Control {
                claim: false,
                steps: &PANTECH,
            },
            Blackberry => Plan::Control {
                claim: false,
                steps: &BLACKBERRY,
            },
            Gct => Plan::Control {
                claim: true,
                steps: &GCT,
            },
            MobileAction => Plan::Interrupt {
                out_endpoint: 0x02,
                in_endpoint: 0x81,
                packet: 8,
                steps: &MOBILE_ACTION,
            },
            Cisco => Plan::BulkSequence { messages: &CISCO },
            Sony => Plan::ReconnectResend {
                step: SONY,
                attempts: 30,
                grace: 5,
            },
        }
    }

    /// Whether the kernel driver has to go before the procedure starts.
    pub fn detaches_first(&self) -> bool {
        use SwitchProcedure::*;
        matches!(self, Gct | Kobil | Cisco | Blackberry | Pantech | Sony)
    }

    /// Whether the procedure talks over the bulk endpoints.
    pub fn needs_endpoints(&self) -> bool {
        matches!(self.plan(), Plan::BulkSequence { .. })
    }
}

/// How a switching procedure ended, short of a fatal error.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum SwitchOutcome {
    Sent,
    /// The device went away partway; the handle has been closed.
    DeviceGone,
    /// Something non-fatal went wrong and the procedure gave up.
    Incomplete,
}

/// Everything a procedure may touch.
pub struct SwitchContext<'a, B: UsbBus> {
    pub bus: &'a B,
    pub spec: &'a TargetSpec,
    pub session: &'a mut Session<B::Handle>,
    pub message_endpoint: Option<u8>,
    pub response_endpoint: Option<u8>,
    pub release_delay: Duration,
    pub poll_interval: Duration,
    /// Set when the driver was already detached, e.g. for the inquiry.
    pub driver_detached: bool,
    pub cancel: &'a CancelToken,
}

impl<B: UsbBus> SwitchContext<'_, B> {
    fn detach(&mut self) -> DetachOutcome {
        let interface = self.session.interface();
        match self.session.handle_mut() {
            Some(handle) => detach_driver(handle, interface),
            None => DetachOutcome::NotAttached,
        }
    }

    fn gone(&mut self) -> SwitchOutcome {
        info!(" Device is gone, skipping any further commands");
        self.session.close();
        SwitchOutcome::DeviceGone
    }

    fn release_after_delay(&mut self) -> Result<SwitchOutcome, Error> {
        if !self.release_delay.is_zero() {
            info!(
                "Blocking the interface for {} ms before releasing ...",
                self.release_delay.as_millis()
            );
            self.cancel.sleep(self.release_delay)?;
        }

        match self.session.release() {
            Ok(()) => Ok(SwitchOutcome::Sent),
            Err(_) => Ok(self.gone()),
        }
    }
}

/// Run one vendor procedure against the open session.
pub fn run_procedure<B: UsbBus>(
    ctx: &mut SwitchContext<B>,
    procedure: SwitchProcedure,
) -> Result<SwitchOutcome, Error> {
    if !ctx.session.is_open() {
        return Ok(SwitchOutcome::DeviceGone);
    }

    if procedure.detaches_first() && !ctx.driver_detached {
        ctx.detach();
    }

    match procedure.plan() {
        Plan::DetachOnly => {
            info!("Only detaching storage driver for switching ...");
            if ctx.driver_detached {
                info!(" Any driver was already detached for inquiry");
            } else if ctx.detach() == DetachOutcome::Unsupported {
                info!(" You may want to remove the storage driver manually");
            }
            Ok(SwitchOutcome::Sent)
        }
        Plan::Control { claim, steps } => run_control_steps(ctx, claim, steps),
        Plan::Interrupt {
            out_endpoint,
            in_endpoint,
            packet,
            steps,
        } => run_interrupt_steps(ctx, out_endpoint, in_endpoint, packet, steps),
        Plan::BulkSequence { messages } => run_bulk_sequence(ctx, messages),
        Plan::ReconnectResend {
            step,
            attempts,
            grace,
        } => run_reconnect_resend(ctx, step, attempts, grace),
    }
}

fn send_control<H: UsbHandle>(
    handle: &mut H,
    step: &ControlStep,
    interface: u8,
) -> rusb::Result<usize> {
    let index = if step.index_is_interface {
        interface as u16
    } else {
        step.index
    };

    match step.data {
        ControlData::Out(data) => handle.write_control(
            step.request_type,
            step.request,
            step.value,
            index,
            data,
            step.timeout,
        ),
        ControlData::In(len) => {
            let mut buf = vec![0u8; len as usize];
            handle.read_control(
                step.request_type,
                step.request,
                step.value,
                index,
                &mut buf,
                step.timeout,
            )
        }
    }
}

fn check_control(step: &ControlStep, result: rusb::Result<usize>) -> Result<(), Error> {
    let label = step.label;
    match (step.check, result) {
        (Check::Ignored, _) => Ok(()),
        (Check::Exactly(n) | Check::ExactlyOrPipe(n), Ok(m)) if m == n => {
            info!(" OK, {label} sent");
            Ok(())
        }
        (Check::ExactlyOrPipe(_), Err(rusb::Error::Pipe)) => {
            info!(" communication with device stopped. May have switched, continue ...");
            Ok(())
        }
        (Check::Succeeds | Check::Lenient, Ok(_)) => {
            info!(" OK, {label} sent");
            Ok(())
        }
        (Check::Lenient, Err(e)) => {
            info!(" Sending {label} returned error {e}, continue anyway ...");
            Ok(())
        }
        (_, result) => Err(Error::UnexpectedControlResult {
            step: label,
            result,
        }),
    }
}

fn run_control_steps<B: UsbBus>(
    ctx: &mut SwitchContext<B>,
    claim: bool,
    steps: &[ControlStep],
) -> Result<SwitchOutcome, Error> {
    if claim {
        if let Err(e) = ctx.session.claim() {
            info!(" Could not claim interface ({e}). Skipping control sequence");
            return Ok(SwitchOutcome::Incomplete);
        }
    }

    let interface = ctx.session.interface();
    for step in steps {
        ctx.cancel.check()?;
        let Some(handle) = ctx.session.handle_mut() else {
            return Ok(SwitchOutcome::DeviceGone);
        };

        info!("Sending {} ...", step.label);
        let result = send_control(handle, step, interface);
        check_control(step, result)?;
    }

    if claim {
        ctx.session.release().ok();
    }
    Ok(SwitchOutcome::Sent)
}

fn run_interrupt_steps<B: UsbBus>(
    ctx: &mut SwitchContext<B>,
    out_endpoint: u8,
    in_endpoint: u8,
    packet: usize,
    steps: &[InterruptStep],
) -> Result<SwitchOutcome, Error> {
    const TIMEOUT: Duration = Duration::from_millis(1000);

    info!("Sending MobileAction control sequence ...");
    let interface = ctx.session.interface();
    let mut last_write = None;
    for step in steps {
        ctx.cancel.check()?;
        let Some(handle) = ctx.session.handle_mut() else {
            return Ok(SwitchOutcome::DeviceGone);
        };

        // Only the last write's result counts.
        match step {
            InterruptStep::Control(c) => {
                let _ = send_control(handle, c, interface);
            }
            InterruptStep::Write(data) => {
                last_write = Some(write_interrupt(handle, out_endpoint, data, TIMEOUT));
            }
            InterruptStep::Read(times) => {
                for _ in 0..*times {
                    let _ = read_interrupt(handle, in_endpoint, packet, TIMEOUT);
                }
            }
        }
    }

    match last_write {
        Some(TransferOutcome::Completed(_)) => {
            info!(" MobileAction control sequence complete");
            Ok(SwitchOutcome::Sent)
        }
        other => {
            info!(" MobileAction control sequence did not complete\n Last result was {other:?}");
            Ok(SwitchOutcome::Incomplete)
        }
    }
}

fn run_bulk_sequence<B: UsbBus>(
    ctx: &mut SwitchContext<B>,
    messages: &[&str],
) -> Result<SwitchOutcome, Error> {
    let (Some(message_endpoint), Some(response_endpoint)) =
        (ctx.message_endpoint, ctx.response_endpoint)
    else {
        return Err(Error::EndpointNotFound("message"));
    };

    info!("Preparing for sending message sequence");
    info!(
        "Setting up communication with interface {}",
        ctx.session.interface()
    );
    if let Err(e) = ctx.session.claim() {
        info!(" Could not claim interface ({e}). Skipping message sending");
        return Ok(SwitchOutcome::Incomplete);
    }

    for (i, message) in messages.iter().enumerate() {
        ctx.cancel.check()?;
        let Some(handle) = ctx.session.handle_mut() else {
            return Ok(SwitchOutcome::DeviceGone);
        };

        // Every step has to succeed; the first failure ends the sequence.
        if !matches!(
            send_message(handle, message_endpoint, message, i + 1),
            Ok(TransferOutcome::Completed(_))
        ) {
            return Ok(ctx.gone());
        }

        info!("Reading the response (CSW) to bulk message {} ...", i + 1);
        if !read_bulk(handle, response_endpoint, CSW_LEN).is_completed() {
            return Ok(ctx.gone());
        }
    }

    ctx.release_after_delay()
}

fn run_reconnect_resend<B: UsbBus>(
    ctx: &mut SwitchContext<B>,
    step: ControlStep,
    attempts: u32,
    grace: u32,
) -> Result<SwitchOutcome, Error> {
    let interface = ctx.session.interface();

    info!("Trying to send {}", step.label);
    let result = match ctx.session.handle_mut() {
        Some(handle) => send_control(handle, &step, interface),
        None => Err(rusb::Error::NoDevice),
    };
    check_control(&step, result)?;
    info!(" OK, control message sent, waiting for device to return ...");
    ctx.session.close();

    let spec = ctx.spec;
    let mut found = None;
    let mut waited = 0;
    while waited < attempts {
        if waited > grace {
            found = scan(
                ctx.bus,
                spec,
                &Criteria::default_mode(spec),
                spec.target_class,
                0,
                SearchMode::Target,
                None,
            )
            .last_match;
            if found.is_some() {
                break;
            }
        }
        ctx.cancel.sleep(ctx.poll_interval)?;
        waited += 1;
    }

    info!(" After {waited} seconds:");
    let Some(record) = found else {
        info!(" device still gone, cancelling");
        return Ok(SwitchOutcome::Incomplete);
    };

    info!(" device came back, proceeding");
    match ctx.bus.open(&record.identity) {
        Ok(handle) => ctx.session.reopen(handle),
        Err(e) => {
            warn!("Could not get handle on device: {e}");
            return Ok(SwitchOutcome::Incomplete);
        }
    }
    ctx.cancel.sleep(ctx.poll_interval)?;

    info!("Sending {} again ...", step.label);
    let result = match ctx.session.handle_mut() {
        Some(handle) => send_control(handle, &step, interface),
        None => Err(rusb::Error::NoDevice),
    };
    match result {
        Ok(_) => {
            info!(" OK, control message sent");
            Ok(SwitchOutcome::Sent)
        }
        Err(e) => {
            warn!("Sending {} (2) failed: {e}", step.label);
            Ok(SwitchOutcome::Incomplete)
        }
    }
}

/// Send the user's own bulk messages (empty ones are skipped). With `need_response`, a
/// response is read after each: a 13-byte status for storage commands, otherwise as many bytes
/// as the message had.
pub fn send_messages<B: UsbBus>(
    ctx: &mut SwitchContext<B>,
    messages: &[String],
    need_response: bool,
) -> Result<SwitchOutcome, Error> {
    let Some(message_endpoint) = ctx.message_endpoint else {
        return Err(Error::EndpointNotFound("message"));
    };
    let response_endpoint = ctx.response_endpoint;

    info!(
        "Setting up communication with interface {}",
        ctx.session.interface()
    );
    if let Err(e) = ctx.session.claim() {
        info!(" Could not claim interface ({e}). Skipping message sending");
        return Ok(SwitchOutcome::Incomplete);
    }

    if let Some(handle) = ctx.session.handle_mut() {
        handle.clear_halt(message_endpoint).ok();
    }
    info!("Using endpoint {message_endpoint:#04x} for message sending ...");

    for (i, message) in messages.iter().enumerate() {
        if message.is_empty() {
            continue;
        }
        ctx.cancel.check()?;
        let Some(handle) = ctx.session.handle_mut() else {
            return Ok(SwitchOutcome::DeviceGone);
        };

        match send_message(handle, message_endpoint, message, i + 1) {
            // Just this one message is skipped.
            Err(_) => continue,
            Ok(TransferOutcome::DeviceGone) => return Ok(ctx.gone()),
            Ok(_) => {}
        }

        if let (true, Some(response_endpoint)) = (need_response, response_endpoint) {
            let length = if message.contains(CBW_SIGNATURE) {
                info!("Reading the response to message {} (CSW) ...", i + 1);
                CSW_LEN
            } else {
                info!("Reading the response to message {} ...", i + 1);
                message.len() / 2
            };
            if !read_bulk(handle, response_endpoint, length).is_completed() {
                return Ok(ctx.gone());
            }
        }
    }

    if let Some(handle) = ctx.session.handle_mut() {
        if let Some(response_endpoint) = response_endpoint {
            info!("Resetting response endpoint {response_endpoint:#04x}");
            if let Err(e) = handle.clear_halt(response_endpoint) {
                info!(" Could not reset endpoint (probably harmless): {e}");
            }
        }
        info!("Resetting message endpoint {message_endpoint:#04x}");
        if let Err(e) = handle.clear_halt(message_endpoint) {
            info!(" Could not reset endpoint (probably harmless): {e}");
        }
    }
    ctx.cancel.sleep(Duration::from_millis(50))?;

    ctx.release_after_delay()
}

/// Select configuration `configuration`, detaching the driver between attempts. Returns
/// whether the device accepted it.
pub fn switch_configuration<H: UsbHandle>(session: &mut Session<H>, configuration: u8) -> bool {
    info!("Changing configuration to {configuration} ...");
    let interface = session.interface();
    let Some(handle) = session.handle_mut() else {
        return false;
    };

    let mut tries = SWITCH_CONFIG_MAXTRIES;
    loop {
        match handle.set_active_configuration(configuration) {
            Ok(()) => {
                info!(" OK, configuration set");
                return true;
            }
            Err(e) => {
                tries -= 1;
                if tries == 0 {
                    info!(" Setting the configuration returned error {e}. Trying to continue");
                    return false;
                }
                info!(" Device is busy, trying to detach kernel driver");
                detach_driver(handle, interface);
            }
        }
    }
}

/// Select an alternate setting on the session's interface. Failure is logged and ignored.
pub fn switch_alt_setting<H: UsbHandle>(session: &mut Session<H>, setting: u8) -> bool {
    info!("Changing to alt setting {setting} ...");
    let interface = session.interface();
    session.claim().ok();
    let result = match session.handle_mut() {
        Some(handle) => handle.set_alternate_setting(interface, setting),
        None => Err(rusb::Error::NoDevice),
    };
    session.release().ok();

    match result {
        Ok(()) => {
            info!(" OK, changed to alt setting");
            true
        }
        Err(e) => {
            info!(" Changing to alt setting returned error {e}. Trying to continue");
            false
        }
    }
}

/// Reset the device, retrying while it refuses. Failure is logged and ignored.
pub fn reset_device<H: UsbHandle>(
    session: &mut Session<H>,
    settle: Duration,
    cancel: &CancelToken,
) -> Result<bool, Error> {
    info!("Resetting usb device");
    cancel.sleep(settle)?;

    let Some(handle) = session.handle_mut() else {
        return Ok(false);
    };
    for _ in 0..RESET_MAXTRIES {
        if handle.reset().is_ok() {
            info!(" OK, device was reset");
            return Ok(true);
        }
    }

    info!(" Reset failed. Can be ignored if device switched OK.");
    Ok(false)
}

/// All errors that end a run.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("invalid configuration")]
    Config(#[from] ConfigError),

    #[error("USB transaction error while {action}")]
    Usb {
        source: rusb::Error,
        action: &'static str,
    },

    #[error("sending {step} failed (result {result:?})")]
    UnexpectedControlResult {
        step: &'static str,
        result: rusb::Result<usize>,
    },

    #[error("getting the class of interface {0} failed. Does it exist?")]
    UnknownInterface(u8),

    #[error("{0} endpoint not given or found")]
    EndpointNotFound(&'static str),

    #[error(
        "can't use storage command in MessageContent with interface {interface}; \
         interface class is {class}, should be 8"
    )]
    StorageCommandMismatch { interface: u8, class: u8 },

    #[error("cancelled by signal")]
    Cancelled,
}

/// Problems with the configuration itself, caught before any device is touched.
#[derive(Error, Debug, PartialEq)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("no default vendor/product ID given")]
    MissingDefaultIds,

    #[error("invalid mode combination {0:?}; at most one special mode can be used")]
    ConflictingModes(Vec<SwitchProcedure>),

    #[error("MessageContent: {0}")]
    BadMessage(#[from] MessageError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_flag_selects_procedure() {
        let flags = [
            (false, SwitchProcedure::Huawei),
            (true, SwitchProcedure::Cisco),
            (false, SwitchProcedure::Sony),
        ];
        assert_eq!(
            SwitchProcedure::from_flags(&flags),
            Ok(Some(SwitchProcedure::Cisco))
        );
        assert_eq!(SwitchProcedure::from_flags(&[]), Ok(None));
    }

    #[test]
    fn two_flags_conflict() {
        let flags = [
            (true, SwitchProcedure::Huawei),
            (true, SwitchProcedure::Sierra),
        ];
        assert_eq!(
            SwitchProcedure::from_flags(&flags),
            Err(ConfigError::ConflictingModes(vec![
                SwitchProcedure::Huawei,
                SwitchProcedure::Sierra
            ]))
        );
    }

    #[test]
    fn pipe_is_tolerated_only_where_declared() {
        assert!(check_control(&SIERRA[0], Err(rusb::Error::Pipe)).is_ok());
        assert!(check_control(&SIERRA[0], Ok(0)).is_ok());
        assert!(check_control(&SIERRA[0], Err(rusb::Error::Io)).is_err());
        assert!(check_control(&HUAWEI[0], Err(rusb::Error::Pipe)).is_err());
        assert!(check_control(&HUAWEI[0], Ok(1)).is_err());
    }

    #[test]
    fn exact_byte_counts() {
        assert!(check_control(&BLACKBERRY[0], Ok(8)).is_ok());
        assert!(check_control(&BLACKBERRY[0], Ok(7)).is_err());
        assert!(check_control(&BLACKBERRY[1], Ok(2)).is_ok());
        assert!(check_control(&QUANTA[0], Err(rusb::Error::Timeout)).is_ok());
        assert!(check_control(&GCT[0], Err(rusb::Error::Timeout)).is_ok());
    }

    #[test]
    fn cisco_messages_are_well_formed() {
        for message in CISCO {
            let bytes = crate::transport::decode_message(message).unwrap();
            assert_eq!(bytes.len(), 31);
            assert!(message.starts_with(CBW_SIGNATURE));
        }
    }
}
