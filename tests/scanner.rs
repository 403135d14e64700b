use proptest::prelude::*;
use usb_modeswitch::device_ids::{BusPin, TargetSpec};
use usb_modeswitch::mock::{MockBus, MockDevice, device};
use usb_modeswitch::scanner::{Criteria, SearchMode, scan};
use usb_modeswitch::usb::{DeviceRecord, UsbBus};

const VENDORS: [u16; 2] = [0x12d1, 0x19d2];
const PRODUCTS: [u16; 3] = [0x1446, 0x14ac, 0x1001];

/// Devices with unique addresses, in enumeration order.
fn device_list() -> impl Strategy<Value = Vec<(u8, u16, u16)>> {
    proptest::collection::vec(
        (
            1u8..=2,
            prop::sample::select(VENDORS.to_vec()),
            prop::sample::select(PRODUCTS.to_vec()),
        ),
        0..12,
    )
}

fn build(list: &[(u8, u16, u16)]) -> Vec<MockDevice> {
    list.iter()
        .enumerate()
        .map(|(i, &(bus, vid, pid))| device(bus, i as u8 + 1, vid, pid))
        .collect()
}

fn target_spec(list: &[&str]) -> TargetSpec {
    TargetSpec {
        target_vendor: 0x12d1.into(),
        target_product_list: list.iter().map(|s| s.to_string()).collect(),
        ..TargetSpec::new(0x12d1, 0x1446)
    }
}

proptest! {
    #[test]
    fn default_mode_returns_last_match(list in device_list()) {
        let bus = MockBus::new(build(&list));
        let records = bus.devices().unwrap();
        let spec = TargetSpec::new(0x12d1, 0x1446);
        let criteria = Criteria::default_mode(&spec);

        let found = scan(&bus, &spec, &criteria, 0, 0, SearchMode::Default, None);

        let matching: Vec<&DeviceRecord> = records
            .iter()
            .filter(|r| r.identity.id == spec.default_id())
            .collect();
        prop_assert_eq!(found.count, matching.len());
        prop_assert_eq!(found.last_match.as_ref(), matching.last().copied());
    }

    #[test]
    fn product_list_returns_last_match_without_pin(list in device_list()) {
        let bus = MockBus::new(build(&list));
        let records = bus.devices().unwrap();
        let spec = target_spec(&["14ac", "zz", "1001"]);
        let criteria = Criteria::target_mode(&spec);

        let found = scan(&bus, &spec, &criteria, 0, 0, SearchMode::Target, None);

        let matching: Vec<&DeviceRecord> = records
            .iter()
            .filter(|r| r.identity.id.vid == 0x12d1 && matches!(r.identity.id.pid, 0x14ac | 0x1001))
            .collect();
        prop_assert_eq!(found.count, matching.len());
        prop_assert_eq!(found.last_match.as_ref(), matching.last().copied());
    }

    #[test]
    fn pinned_product_list_takes_first_sufficient_address(
        list in device_list(),
        address in 1u8..=12,
    ) {
        let bus = MockBus::new(build(&list));
        let records = bus.devices().unwrap();
        let spec = target_spec(&["14ac"]);
        let pin = BusPin { bus: 1, address };
        let criteria = Criteria::target_mode(&spec);

        let found = scan(&bus, &spec, &criteria, 0, 0, SearchMode::Target, Some(pin));

        let expected = records.iter().find(|r| {
            r.identity.id.vid == 0x12d1
                && r.identity.id.pid == 0x14ac
                && r.identity.bus == 1
                && r.identity.address >= address
        });
        prop_assert_eq!(found.last_match.as_ref(), expected);

        let again = scan(&bus, &spec, &criteria, 0, 0, SearchMode::Target, Some(pin));
        prop_assert_eq!(again, found);
    }
}

#[test]
fn class_mismatch_policy_depends_on_mode() {
    let bus = MockBus::new(vec![device(1, 2, 0x12d1, 0x1446).class(0x08)]);
    let spec = TargetSpec {
        target_class: 0xff,
        ..TargetSpec::new(0x12d1, 0x1446)
    };
    let criteria = Criteria::default_mode(&spec);

    // Still in storage mode: a candidate for switching.
    let found = scan(&bus, &spec, &criteria, 0xff, 0, SearchMode::Default, None);
    assert_eq!(found.count, 1);

    // Not in the target class yet.
    let found = scan(&bus, &spec, &criteria, 0xff, 0, SearchMode::Target, None);
    assert_eq!(found.count, 0);
}

#[test]
fn class_match_in_default_mode_means_already_switched() {
    let bus = MockBus::new(vec![device(1, 2, 0x12d1, 0x1446).interface_class(0xff)]);
    let spec = TargetSpec {
        target_class: 0xff,
        ..TargetSpec::new(0x12d1, 0x1446)
    };
    let criteria = Criteria::default_mode(&spec);

    let found = scan(&bus, &spec, &criteria, 0xff, 0, SearchMode::Default, None);
    assert_eq!(found.count, 0);

    let found = scan(&bus, &spec, &criteria, 0xff, 0, SearchMode::Target, None);
    assert_eq!(found.count, 1);
}

#[test]
fn devices_in_wanted_configuration_are_skipped() {
    let bus = MockBus::new(vec![
        device(1, 2, 0x12d1, 0x1446),
        device(1, 3, 0x12d1, 0x1446),
    ]);
    bus.set_configuration(1, 3, 2);
    let spec = TargetSpec::new(0x12d1, 0x1446);
    let criteria = Criteria::default_mode(&spec);

    let found = scan(&bus, &spec, &criteria, 0, 2, SearchMode::Default, None);
    assert_eq!(found.count, 1);
    assert_eq!(found.last_match.unwrap().identity.address, 2);
}

#[test]
fn unreadable_configuration_counts_as_one() {
    let bus = MockBus::new(vec![device(1, 2, 0x12d1, 0x1446)]);
    bus.fail_get_configuration();
    let spec = TargetSpec::new(0x12d1, 0x1446);
    let criteria = Criteria::default_mode(&spec);

    let found = scan(&bus, &spec, &criteria, 0, 1, SearchMode::Default, None);
    assert_eq!(found.count, 0);

    let found = scan(&bus, &spec, &criteria, 0, 2, SearchMode::Default, None);
    assert_eq!(found.count, 1);
}
