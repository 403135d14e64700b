use anyhow::Result;
use clap::{ArgAction, Parser};
use std::time::Duration;
use usb_modeswitch::device_ids::{BusPin, OptionalId, TargetSpec};
use usb_modeswitch::inspect::find_mbim_configuration;
use usb_modeswitch::protocol::{Error, SwitchProcedure};
use usb_modeswitch::run::{Options, run};
use usb_modeswitch::session::CancelToken;
use usb_modeswitch::usb::LibUsb;

fn parse_hex_u16(s: &str) -> Result<u16, std::num::ParseIntError> {
    u16::from_str_radix(s.trim_start_matches("0x"), 16)
}

fn parse_hex_u8(s: &str) -> Result<u8, std::num::ParseIntError> {
    u8::from_str_radix(s.trim_start_matches("0x"), 16)
}

/// Switch multi-mode USB devices into their working mode
#[derive(Parser, Debug)]
#[command(name = "usb_modeswitch", version, disable_version_flag = true)]
struct Opt {
    /// Print version information
    #[arg(short = 'e', long = "version", action = ArgAction::Version)]
    version: Option<bool>,

    /// Vendor ID of original mode (mandatory)
    #[arg(short = 'v', long, value_parser = parse_hex_u16)]
    default_vendor: Option<u16>,

    /// Product ID of original mode (mandatory)
    #[arg(short = 'p', long, value_parser = parse_hex_u16)]
    default_product: Option<u16>,

    /// Target vendor ID (optional)
    #[arg(short = 'V', long, value_parser = parse_hex_u16)]
    target_vendor: Option<u16>,

    /// Target product ID (optional)
    #[arg(short = 'P', long, value_parser = parse_hex_u16)]
    target_product: Option<u16>,

    /// Target product IDs as 4-digit hex values (optional, overrides -P)
    #[arg(long, value_delimiter = ',')]
    target_product_list: Vec<String>,

    /// Target device class
    #[arg(short = 'C', long, value_parser = parse_hex_u8)]
    target_class: Option<u8>,

    /// Use given bus number (with -g)
    #[arg(short = 'b', long = "bus-num", requires = "device_num")]
    bus_num: Option<u8>,

    /// Use given device address (with -b)
    #[arg(short = 'g', long = "device-num", requires = "bus_num")]
    device_num: Option<u8>,

    /// Interface to use (default: first one)
    #[arg(short = 'i', long, value_parser = parse_hex_u8)]
    interface: Option<u8>,

    /// Switch to this configuration
    #[arg(short = 'u', long, value_parser = parse_hex_u8)]
    configuration: Option<u8>,

    /// Switch to this alternative setting
    #[arg(short = 'a', long = "altsetting", value_parser = parse_hex_u8)]
    alt_setting: Option<u8>,

    /// Message endpoint (default: first bulk OUT endpoint)
    #[arg(short = 'm', long, value_parser = parse_hex_u8)]
    message_endpoint: Option<u8>,

    /// Response endpoint (default: first bulk IN endpoint)
    #[arg(short = 'r', long, value_parser = parse_hex_u8)]
    response_endpoint: Option<u8>,

    /// Hex string of the first bulk message
    #[arg(short = 'M', long)]
    message_content: Option<String>,

    /// Hex string of the second bulk message
    #[arg(short = '2', long)]
    message_content2: Option<String>,

    /// Hex string of the third bulk message
    #[arg(short = '3', long)]
    message_content3: Option<String>,

    /// Read a response after each message
    #[arg(short = 'n', long)]
    need_response: bool,

    /// Keep the interface claimed this many milliseconds after sending
    #[arg(short = 'w', long, default_value_t = 0)]
    release_delay: u64,

    /// Reset the device after all other actions
    #[arg(short = 'R', long)]
    reset_usb: bool,

    /// Check for switching success, trying this many seconds
    #[arg(short = 's', long, default_value_t = 0)]
    check_success: u32,

    /// Don't do a SCSI inquiry on mass storage devices
    #[arg(short = 'I', long)]
    no_inquire: bool,

    /// Report the result on stdout for a calling wrapper (implies -I)
    #[arg(short = 'D', long)]
    sysmode: bool,

    /// Don't let the wrapper load a driver after switching
    #[arg(long)]
    no_driver_loading: bool,

    /// Print the configuration holding an MBIM interface and exit
    #[arg(short = 'j', long)]
    find_mbim: bool,

    /// Print debug output
    #[arg(short = 'W', long)]
    verbose: bool,

    /// Only print errors
    #[arg(short = 'Q', long)]
    quiet: bool,

    /// Only detach the storage driver
    #[arg(short = 'd', long = "detach-only")]
    detach_only: bool,

    /// Apply a special procedure: Huawei
    #[arg(short = 'H', long = "huawei-mode")]
    huawei: bool,

    /// Apply a special procedure: Sierra Wireless
    #[arg(short = 'S', long = "sierra-mode")]
    sierra: bool,

    /// Apply a special procedure: Sony Ericsson
    #[arg(short = 'O', long = "sony-mode")]
    sony: bool,

    /// Apply a special procedure: GCT
    #[arg(short = 'G', long = "gct-mode")]
    gct: bool,

    /// Apply a special procedure: Kobil
    #[arg(short = 'T', long = "kobil-mode")]
    kobil: bool,

    /// Apply a special procedure: Qisda
    #[arg(short = 'B', long = "qisda-mode")]
    qisda: bool,

    /// Apply a special procedure: Quanta
    #[arg(short = 'E', long = "quanta-mode")]
    quanta: bool,

    /// Apply a special procedure: Sequans
    #[arg(short = 'N', long = "sequans-mode")]
    sequans: bool,

    /// Apply a special procedure: MobileAction
    #[arg(short = 'A', long = "mobileaction-mode")]
    mobile_action: bool,

    /// Apply a special procedure: Cisco
    #[arg(short = 'L', long = "cisco-mode")]
    cisco: bool,

    /// Apply a special procedure: Blackberry
    #[arg(short = 'Z', long = "blackberry-mode")]
    blackberry: bool,

    /// Apply a special procedure: Pantech
    #[arg(short = 'F', long = "pantech-mode")]
    pantech: bool,
}

impl Opt {
    fn target(&self) -> TargetSpec {
        TargetSpec {
            target_vendor: self.target_vendor.unwrap_or(0).into(),
            target_product: OptionalId(self.target_product),
            target_product_list: self.target_product_list.clone(),
            target_class: self.target_class.unwrap_or(0),
            desired_configuration: self.configuration.filter(|c| *c > 0),
            ..TargetSpec::new(
                self.default_vendor.unwrap_or(0),
                self.default_product.unwrap_or(0),
            )
        }
    }

    fn pin(&self) -> Option<BusPin> {
        Some(BusPin {
            bus: self.bus_num?,
            address: self.device_num?,
        })
    }

    fn options(&self) -> Result<Options, Error> {
        use SwitchProcedure::*;
        let procedure = SwitchProcedure::from_flags(&[
            (self.detach_only, DetachOnly),
            (self.huawei, Huawei),
            (self.sierra, Sierra),
            (self.sony, Sony),
            (self.gct, Gct),
            (self.kobil, Kobil),
            (self.qisda, Qisda),
            (self.quanta, Quanta),
            (self.sequans, Sequans),
            (self.mobile_action, MobileAction),
            (self.cisco, Cisco),
            (self.blackberry, Blackberry),
            (self.pantech, Pantech),
        ])?;

        let messages = [
            &self.message_content,
            &self.message_content2,
            &self.message_content3,
        ]
        .into_iter()
        .map(|m| m.clone().unwrap_or_default())
        .collect();

        Ok(Options {
            procedure,
            messages,
            need_response: self.need_response,
            message_endpoint: self.message_endpoint.filter(|e| *e != 0),
            response_endpoint: self.response_endpoint.filter(|e| *e != 0),
            interface: self.interface,
            alt_setting: self.alt_setting,
            release_delay: Duration::from_millis(self.release_delay),
            reset_usb: self.reset_usb,
            check_success: self.check_success,
            sysmode: self.sysmode,
            inquire: !(self.no_inquire || self.sysmode),
            no_driver_loading: self.no_driver_loading,
            pin: self.pin(),
            ..Options::new(self.target())
        })
    }
}

fn main() -> Result<()> {
    let opt = Opt::parse();

    let default_filter = match (opt.verbose, opt.quiet) {
        (true, _) => "debug",
        (false, true) => "error",
        (false, false) => "info",
    };
    env_logger::Builder::from_env(
        env_logger::Env::new()
            .filter_or("USB_MODESWITCH_LOG", default_filter)
            .write_style("USB_MODESWITCH_LOG_STYLE"),
    )
    .init();

    // Mode flags are checked before anything touches the bus.
    let options = opt.options()?;

    let cancel = CancelToken::new();
    {
        let cancel = cancel.clone();
        ctrlc::set_handler(move || cancel.cancel())?;
    }

    let bus = LibUsb::new()?;

    if opt.find_mbim {
        let spec = options.target.clone().validate().map_err(Error::from)?;
        println!(
            "{}",
            find_mbim_configuration(&bus, spec.default_id(), options.pin)
        );
        return Ok(());
    }

    match run(&bus, &options, &cancel) {
        Ok(report) => {
            if let Some(line) = report.terminal() {
                println!("{line}");
            }
            Ok(())
        }
        // Interrupted runs still count as clean exits; the session guard has cleaned up.
        Err(Error::Cancelled) => Ok(()),
        Err(e) => Err(e.into()),
    }
}
