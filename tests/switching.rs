use std::time::Duration;
use usb_modeswitch::device_ids::{BusPin, TargetSpec, UsbId};
use usb_modeswitch::mock::{MockBus, MockCall, device};
use usb_modeswitch::protocol::{ConfigError, Error, SwitchOutcome, SwitchProcedure};
use usb_modeswitch::run::{Options, Report, TerminalLine, run};
use usb_modeswitch::session::CancelToken;
use usb_modeswitch::usb::DeviceRecord;
use usb_modeswitch::verify::Verdict;

fn options(procedure: Option<SwitchProcedure>) -> Options {
    Options {
        procedure,
        inquire: false,
        poll_interval: Duration::ZERO,
        ..Options::new(TargetSpec::new(0x12d1, 0x1446))
    }
}

fn with_target(mut options: Options) -> Options {
    options.target.target_vendor = 0x12d1.into();
    options.target.target_product = 0x14ac.into();
    options
}

fn bulk_writes(bus: &MockBus) -> Vec<Vec<u8>> {
    bus.calls()
        .into_iter()
        .filter_map(|c| match c {
            MockCall::BulkWrite { data, .. } => Some(data),
            _ => None,
        })
        .collect()
}

fn switch_outcome(report: &Report) -> Option<SwitchOutcome> {
    match report {
        Report::Finished { switch, .. } => *switch,
        Report::NothingToDo => None,
    }
}

#[test]
fn huawei_switch_is_confirmed_by_target_ids() {
    let bus = MockBus::new(vec![device(1, 2, 0x12d1, 0x1446)]);
    bus.after_switch(vec![device(1, 3, 0x12d1, 0x14ac)]);

    let options = Options {
        check_success: 5,
        sysmode: true,
        ..with_target(options(Some(SwitchProcedure::Huawei)))
    };
    let report = run(&bus, &options, &CancelToken::new()).unwrap();

    assert_eq!(
        report.terminal(),
        Some(TerminalLine::OkId(UsbId {
            vid: 0x12d1,
            pid: 0x14ac
        }))
    );
    assert_eq!(report.terminal().unwrap().to_string(), "ok:12d1:14ac");
    let Report::Finished {
        verdict: Some(Verdict::Confirmed { identity, .. }),
        ..
    } = &report
    else {
        panic!("switch not confirmed: {report:?}");
    };
    assert_eq!(identity.pin(), BusPin { bus: 1, address: 3 });
    assert!(bus.calls().contains(&MockCall::Control {
        request_type: 0x00,
        request: 0x03,
        value: 1,
        index: 0
    }));
}

#[test]
fn no_default_device_means_nothing_to_do() {
    let bus = MockBus::new(vec![device(1, 2, 0x19d2, 0x2000)]);

    let report = run(
        &bus,
        &options(Some(SwitchProcedure::Huawei)),
        &CancelToken::new(),
    )
    .unwrap();

    assert_eq!(report, Report::NothingToDo);
    assert!(bus.calls().is_empty());
}

#[test]
fn missing_default_ids_are_fatal() {
    let bus = MockBus::new(vec![device(1, 2, 0x12d1, 0x1446)]);
    let options = Options {
        target: TargetSpec::new(0x12d1, 0),
        ..options(None)
    };

    let result = run(&bus, &options, &CancelToken::new());
    assert!(matches!(
        result,
        Err(Error::Config(ConfigError::MissingDefaultIds))
    ));
    assert!(bus.calls().is_empty());
}

#[test]
fn malformed_first_message_is_fatal() {
    let bus = MockBus::new(vec![device(1, 2, 0x12d1, 0x1446)]);
    let options = Options {
        messages: vec!["55534".into()],
        ..options(None)
    };

    let result = run(&bus, &options, &CancelToken::new());
    assert!(matches!(
        result,
        Err(Error::Config(ConfigError::BadMessage(_)))
    ));
}

#[test]
fn vanished_device_stops_message_sequence() {
    let bus = MockBus::new(vec![device(1, 2, 0x12d1, 0x1446)]);
    bus.queue_bulk_write(Ok(()));
    bus.fail_bulk_write(rusb::Error::NoDevice);

    let options = Options {
        messages: vec!["0102".into(), "0304".into(), "0506".into()],
        ..options(None)
    };
    let report = run(&bus, &options, &CancelToken::new()).unwrap();

    assert_eq!(switch_outcome(&report), Some(SwitchOutcome::DeviceGone));
    assert_eq!(bulk_writes(&bus), vec![vec![0x01, 0x02], vec![0x03, 0x04]]);
}

#[test]
fn bad_later_message_is_skipped() {
    let bus = MockBus::new(vec![device(1, 2, 0x12d1, 0x1446)]);

    let options = Options {
        messages: vec!["0102".into(), "03zz".into(), "0506".into()],
        need_response: true,
        ..options(None)
    };
    let report = run(&bus, &options, &CancelToken::new()).unwrap();

    assert_eq!(switch_outcome(&report), Some(SwitchOutcome::Sent));
    assert_eq!(bulk_writes(&bus), vec![vec![0x01, 0x02], vec![0x05, 0x06]]);
    // Each response is as long as its message, plus the drain read.
    let reads = bus
        .calls()
        .into_iter()
        .filter(|c| matches!(c, MockCall::BulkRead { length: 2, .. }))
        .count();
    assert_eq!(reads, 2);
}

#[test]
fn storage_command_needs_storage_class() {
    let bus = MockBus::new(vec![
        device(1, 2, 0x12d1, 0x1446).class(0xff).interface_class(0xff),
    ]);
    let options = Options {
        messages: vec!["55534243123456780000000000000011062000000100000000000000000000".into()],
        ..options(None)
    };

    let result = run(&bus, &options, &CancelToken::new());
    assert!(matches!(
        result,
        Err(Error::StorageCommandMismatch {
            interface: 0,
            class: 0xff
        })
    ));
}

#[test]
fn missing_interface_is_fatal() {
    let bus = MockBus::new(vec![device(1, 2, 0x12d1, 0x1446)]);
    let options = Options {
        interface: Some(3),
        ..options(Some(SwitchProcedure::Huawei))
    };

    let result = run(&bus, &options, &CancelToken::new());
    assert!(matches!(result, Err(Error::UnknownInterface(3))));
}

#[test]
fn unexpected_control_result_is_fatal() {
    let bus = MockBus::new(vec![device(1, 2, 0x12d1, 0x1446)]);
    bus.queue_control(Err(rusb::Error::Io));

    let result = run(
        &bus,
        &options(Some(SwitchProcedure::Huawei)),
        &CancelToken::new(),
    );
    assert!(matches!(
        result,
        Err(Error::UnexpectedControlResult {
            result: Err(rusb::Error::Io),
            ..
        })
    ));
    // The session was torn down on the way out.
    assert_eq!(bus.calls().last(), Some(&MockCall::Close));
}

#[test]
fn sierra_tolerates_stall() {
    let bus = MockBus::new(vec![device(1, 2, 0x12d1, 0x1446)]);
    bus.queue_control(Err(rusb::Error::Pipe));

    let report = run(
        &bus,
        &options(Some(SwitchProcedure::Sierra)),
        &CancelToken::new(),
    )
    .unwrap();
    assert_eq!(switch_outcome(&report), Some(SwitchOutcome::Sent));
}

#[test]
fn blackberry_checks_byte_counts() {
    let bus = MockBus::new(vec![device(1, 2, 0x0fca, 0x8001)]);
    let options = Options {
        target: TargetSpec::new(0x0fca, 0x8001),
        ..options(Some(SwitchProcedure::Blackberry))
    };

    let report = run(&bus, &options, &CancelToken::new()).unwrap();
    assert_eq!(switch_outcome(&report), Some(SwitchOutcome::Sent));
    assert!(bus.calls().contains(&MockCall::DetachDriver(0)));

    let bus = MockBus::new(vec![device(1, 2, 0x0fca, 0x8001)]);
    bus.queue_control(Ok(8));
    bus.queue_control(Ok(1));
    assert!(matches!(
        run(&bus, &options, &CancelToken::new()),
        Err(Error::UnexpectedControlResult { result: Ok(1), .. })
    ));
}

#[test]
fn cisco_stops_at_first_failed_response() {
    let bus = MockBus::new(vec![device(1, 2, 0x05c6, 0x1000)]);
    bus.fail_bulk_read(rusb::Error::Timeout);
    let options = Options {
        target: TargetSpec::new(0x05c6, 0x1000),
        ..options(Some(SwitchProcedure::Cisco))
    };

    let report = run(&bus, &options, &CancelToken::new()).unwrap();
    assert_eq!(switch_outcome(&report), Some(SwitchOutcome::DeviceGone));
    assert_eq!(bulk_writes(&bus).len(), 1);
}

#[test]
fn cisco_sends_all_messages() {
    let bus = MockBus::new(vec![device(1, 2, 0x05c6, 0x1000)]);
    let options = Options {
        target: TargetSpec::new(0x05c6, 0x1000),
        ..options(Some(SwitchProcedure::Cisco))
    };

    let report = run(&bus, &options, &CancelToken::new()).unwrap();
    assert_eq!(switch_outcome(&report), Some(SwitchOutcome::Sent));
    let writes = bulk_writes(&bus);
    assert_eq!(writes.len(), 11);
    assert!(writes.iter().all(|w| w.len() == 31));
}

#[test]
fn mobile_action_runs_whole_sequence() {
    let bus = MockBus::new(vec![device(1, 2, 0x0df7, 0x0800)]);
    let options = Options {
        target: TargetSpec::new(0x0df7, 0x0800),
        ..options(Some(SwitchProcedure::MobileAction))
    };

    let report = run(&bus, &options, &CancelToken::new()).unwrap();
    assert_eq!(switch_outcome(&report), Some(SwitchOutcome::Sent));

    let calls = bus.calls();
    let writes = calls
        .iter()
        .filter(|c| matches!(c, MockCall::InterruptWrite { endpoint: 0x02, .. }))
        .count();
    let reads = calls
        .iter()
        .filter(|c| matches!(c, MockCall::InterruptRead { endpoint: 0x81, .. }))
        .count();
    assert_eq!(writes, 8);
    assert_eq!(reads, 2 + 1 + 1 + 63 + 1 + 1 + 73 + 1 + 1);
}

#[test]
fn sony_gives_up_when_device_stays_away() {
    let bus = MockBus::new(vec![device(1, 2, 0x0fce, 0xd0e1)]);
    bus.after_switch(Vec::<DeviceRecord>::new());
    let options = Options {
        target: TargetSpec::new(0x0fce, 0xd0e1),
        sysmode: true,
        check_success: 10,
        ..options(Some(SwitchProcedure::Sony))
    };

    let report = run(&bus, &options, &CancelToken::new()).unwrap();
    assert_eq!(switch_outcome(&report), Some(SwitchOutcome::Incomplete));
    assert_eq!(report.terminal(), Some(TerminalLine::Fail));
}

#[test]
fn sony_resends_after_reconnect() {
    let bus = MockBus::new(vec![device(1, 2, 0x0fce, 0xd0e1)]);
    bus.after_switch(vec![device(1, 5, 0x0fce, 0xd0e1)]);
    let options = Options {
        target: TargetSpec::new(0x0fce, 0xd0e1),
        sysmode: true,
        ..options(Some(SwitchProcedure::Sony))
    };

    let report = run(&bus, &options, &CancelToken::new()).unwrap();
    assert_eq!(switch_outcome(&report), Some(SwitchOutcome::Sent));
    assert_eq!(report.terminal(), Some(TerminalLine::Ok));
    assert!(bus.calls().contains(&MockCall::Open { bus: 1, address: 5 }));
}

#[test]
fn configuration_change_is_applied() {
    let bus = MockBus::new(vec![device(1, 2, 0x1199, 0x0fff)]);
    let mut options = options(None);
    options.target = TargetSpec::new(0x1199, 0x0fff);
    options.target.desired_configuration = Some(2);

    let report = run(&bus, &options, &CancelToken::new()).unwrap();
    assert!(matches!(report, Report::Finished { .. }));
    assert!(bus.calls().contains(&MockCall::SetConfiguration(2)));

    // Already there: the device is not even a candidate.
    let report = run(&bus, &options, &CancelToken::new()).unwrap();
    assert_eq!(report, Report::NothingToDo);
}

#[test]
fn unreadable_configuration_is_left_alone() {
    let bus = MockBus::new(vec![device(1, 2, 0x1199, 0x0fff)]);
    bus.fail_get_configuration();
    let mut options = options(None);
    options.target = TargetSpec::new(0x1199, 0x0fff);
    options.target.desired_configuration = Some(2);

    let report = run(&bus, &options, &CancelToken::new()).unwrap();
    assert!(matches!(report, Report::Finished { .. }));
    let calls = bus.calls();
    let set_configuration = calls
        .iter()
        .any(|c| matches!(c, MockCall::SetConfiguration(_)));
    assert!(!set_configuration);
}

#[test]
fn detach_only_and_reset() {
    let bus = MockBus::new(vec![device(1, 2, 0x12d1, 0x1446)]);
    let options = Options {
        reset_usb: true,
        ..options(Some(SwitchProcedure::DetachOnly))
    };

    let report = run(&bus, &options, &CancelToken::new()).unwrap();
    assert_eq!(switch_outcome(&report), Some(SwitchOutcome::Sent));
    let calls = bus.calls();
    assert!(calls.contains(&MockCall::DetachDriver(0)));
    assert!(calls.contains(&MockCall::Reset));
}

#[test]
fn pinned_run_defers_to_wrapper() {
    let bus = MockBus::new(vec![
        device(1, 2, 0x12d1, 0x1446),
        device(1, 4, 0x12d1, 0x1446),
    ]);
    let options = Options {
        pin: Some(BusPin { bus: 1, address: 2 }),
        sysmode: true,
        check_success: 5,
        ..options(Some(SwitchProcedure::Huawei))
    };

    let report = run(&bus, &options, &CancelToken::new()).unwrap();
    assert_eq!(report.terminal(), Some(TerminalLine::OkBusdev));
    assert_eq!(bus.calls()[0], MockCall::Open { bus: 1, address: 2 });
}

#[test]
fn vanished_device_without_target_reports_no_data() {
    let bus = MockBus::new(vec![device(1, 2, 0x12d1, 0x1446)]);
    bus.after_switch(Vec::<DeviceRecord>::new());
    let options = Options {
        sysmode: true,
        check_success: 3,
        messages: vec!["0102".into()],
        ..options(None)
    };

    let report = run(&bus, &options, &CancelToken::new()).unwrap();
    assert_eq!(report.terminal(), Some(TerminalLine::OkNoData));

    let bus = MockBus::new(vec![device(1, 2, 0x12d1, 0x1446)]);
    bus.after_switch(Vec::<DeviceRecord>::new());
    let options = Options {
        no_driver_loading: true,
        ..options
    };
    let report = run(&bus, &options, &CancelToken::new()).unwrap();
    assert_eq!(report.terminal(), Some(TerminalLine::Ok));
}

#[test]
fn cancellation_releases_device() {
    let bus = MockBus::new(vec![device(1, 2, 0x12d1, 0x1446)]);
    let cancel = CancelToken::new();
    cancel.cancel();

    let result = run(&bus, &options(Some(SwitchProcedure::Huawei)), &cancel);
    assert!(matches!(result, Err(Error::Cancelled)));
    assert_eq!(bus.calls().last(), Some(&MockCall::Close));
    assert!(!bus.calls().iter().any(|c| matches!(
        c,
        MockCall::Control {
            request_type: 0x00,
            ..
        }
    )));
}
