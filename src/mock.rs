//! In-memory [UsbBus] for exercising switching logic without hardware. Every operation on a
//! handle is recorded, and devices can be made to disappear and reappear under new IDs.

use crate::device_ids::{DeviceIdentity, UsbId};
use crate::usb::{
    ConfigLayout, DeviceRecord, EndpointLayout, InterfaceLayout, StringIndices, UsbBus, UsbHandle,
};
use rusb::TransferType;
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use std::time::Duration;

/// One recorded operation.
#[derive(Clone, Debug, PartialEq)]
pub enum MockCall {
    Open {
        bus: u8,
        address: u8,
    },
    Control {
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
    },
    BulkWrite {
        endpoint: u8,
        data: Vec<u8>,
    },
    BulkRead {
        endpoint: u8,
        length: usize,
    },
    InterruptWrite {
        endpoint: u8,
        data: Vec<u8>,
    },
    InterruptRead {
        endpoint: u8,
        length: usize,
    },
    Claim(u8),
    Release(u8),
    ClearHalt(u8),
    SetConfiguration(u8),
    SetAltSetting(u8, u8),
    DetachDriver(u8),
    Reset,
    Close,
}

/// Builder for a device record with sensible defaults: a mass storage interface 0 with bulk
/// endpoints 0x01/0x81 in a single configuration 1, and all three description strings.
#[derive(Clone, Debug)]
pub struct MockDevice {
    record: DeviceRecord,
}

pub fn device(bus: u8, address: u8, vid: u16, pid: u16) -> MockDevice {
    let endpoint = |address| EndpointLayout {
        address,
        transfer_type: TransferType::Bulk,
    };

    MockDevice {
        record: DeviceRecord {
            identity: DeviceIdentity {
                bus,
                address,
                id: UsbId { vid, pid },
                class: 0,
            },
            configurations: vec![ConfigLayout {
                value: 1,
                interfaces: vec![InterfaceLayout {
                    number: 0,
                    class: 0x08,
                    subclass: 0x06,
                    endpoints: vec![endpoint(0x01), endpoint(0x81)],
                }],
            }],
            strings: StringIndices {
                manufacturer: Some(1),
                product: Some(2),
                serial: Some(3),
            },
        },
    }
}

impl MockDevice {
    /// Set `bDeviceClass`.
    pub fn class(mut self, class: u8) -> Self {
        self.record.identity.class = class;
        self
    }

    /// Set the class of interface 0 in the first configuration.
    pub fn interface_class(mut self, class: u8) -> Self {
        if let Some(interface) = self.first_interface() {
            interface.class = class;
        }
        self
    }

    /// Replace the endpoints of interface 0 in the first configuration.
    pub fn endpoints(mut self, endpoints: Vec<EndpointLayout>) -> Self {
        if let Some(interface) = self.first_interface() {
            interface.endpoints = endpoints;
        }
        self
    }

    pub fn configurations(mut self, configurations: Vec<ConfigLayout>) -> Self {
        self.record.configurations = configurations;
        self
    }

    pub fn without_strings(mut self) -> Self {
        self.record.strings = StringIndices::default();
        self
    }

    fn first_interface(&mut self) -> Option<&mut InterfaceLayout> {
        self.record
            .configurations
            .first_mut()
            .and_then(|c| c.interfaces.first_mut())
    }
}

impl From<MockDevice> for DeviceRecord {
    fn from(device: MockDevice) -> Self {
        device.record
    }
}

#[derive(Default)]
struct State {
    devices: Vec<DeviceRecord>,
    after_switch: Option<Vec<DeviceRecord>>,
    calls: Vec<MockCall>,
    configurations: HashMap<(u8, u8), u8>,
    get_configuration_fails: bool,
    control_results: VecDeque<rusb::Result<usize>>,
    bulk_write_results: VecDeque<rusb::Result<()>>,
    bulk_read_results: VecDeque<rusb::Result<()>>,
    reset_results: VecDeque<rusb::Result<()>>,
    driver_detached: bool,
    driver_query_unsupported: bool,
    detach_unsupported: bool,
}

impl State {
    fn present(&self, pin: (u8, u8)) -> bool {
        self.devices
            .iter()
            .any(|d| (d.identity.bus, d.identity.address) == pin)
    }

    /// The device reacted to something sent to it.
    fn switch(&mut self) {
        if let Some(devices) = self.after_switch.take() {
            self.devices = devices;
        }
    }
}

/// A bus whose devices and failures are scripted by the test.
#[derive(Clone, Default)]
pub struct MockBus {
    state: Rc<RefCell<State>>,
}

impl MockBus {
    pub fn new<I, D>(devices: I) -> Self
    where
        I: IntoIterator<Item = D>,
        D: Into<DeviceRecord>,
    {
        let bus = Self::default();
        bus.state.borrow_mut().devices = devices.into_iter().map(Into::into).collect();
        bus
    }

    /// Everything done through handles of this bus so far, in order.
    pub fn calls(&self) -> Vec<MockCall> {
        self.state.borrow().calls.clone()
    }

    /// After the first transfer that sends something to a device, the bus shows `devices`
    /// instead.
    pub fn after_switch<I, D>(&self, devices: I)
    where
        I: IntoIterator<Item = D>,
        D: Into<DeviceRecord>,
    {
        self.state.borrow_mut().after_switch = Some(devices.into_iter().map(Into::into).collect());
    }

    /// Replace the device list right away.
    pub fn replace_devices<I, D>(&self, devices: I)
    where
        I: IntoIterator<Item = D>,
        D: Into<DeviceRecord>,
    {
        self.state.borrow_mut().devices = devices.into_iter().map(Into::into).collect();
    }

    pub fn set_configuration(&self, bus: u8, address: u8, configuration: u8) {
        self.state
            .borrow_mut()
            .configurations
            .insert((bus, address), configuration);
    }

    pub fn fail_get_configuration(&self) {
        self.state.borrow_mut().get_configuration_fails = true;
    }

    /// Result of the next control transfer not otherwise handled. Unqueued transfers move the
    /// whole buffer.
    pub fn queue_control(&self, result: rusb::Result<usize>) {
        self.state.borrow_mut().control_results.push_back(result);
    }

    /// Result of the next bulk write. Unqueued writes succeed.
    pub fn queue_bulk_write(&self, result: rusb::Result<()>) {
        self.state.borrow_mut().bulk_write_results.push_back(result);
    }

    pub fn fail_bulk_write(&self, error: rusb::Error) {
        self.queue_bulk_write(Err(error));
    }

    /// Result of the next bulk read. Unqueued reads fill the buffer with zeros.
    pub fn queue_bulk_read(&self, result: rusb::Result<()>) {
        self.state.borrow_mut().bulk_read_results.push_back(result);
    }

    pub fn fail_bulk_read(&self, error: rusb::Error) {
        self.queue_bulk_read(Err(error));
    }

    pub fn queue_reset(&self, result: rusb::Result<()>) {
        self.state.borrow_mut().reset_results.push_back(result);
    }

    /// No kernel driver is bound to begin with.
    pub fn without_driver(&self) {
        self.state.borrow_mut().driver_detached = true;
    }

    pub fn driver_query_unsupported(&self) {
        self.state.borrow_mut().driver_query_unsupported = true;
    }

    pub fn detach_unsupported(&self) {
        self.state.borrow_mut().detach_unsupported = true;
    }
}

impl UsbBus for MockBus {
    type Handle = MockHandle;

    fn devices(&self) -> rusb::Result<Vec<DeviceRecord>> {
        Ok(self.state.borrow().devices.clone())
    }

    fn open(&self, identity: &DeviceIdentity) -> rusb::Result<MockHandle> {
        let mut state = self.state.borrow_mut();
        let pin = (identity.bus, identity.address);
        if !state.present(pin) {
            return Err(rusb::Error::NoDevice);
        }

        state.calls.push(MockCall::Open {
            bus: identity.bus,
            address: identity.address,
        });
        Ok(MockHandle {
            state: self.state.clone(),
            pin,
        })
    }
}

/// A handle on one [MockBus] device. Fails with [rusb::Error::NoDevice] once that device is
/// gone from the bus.
pub struct MockHandle {
    state: Rc<RefCell<State>>,
    pin: (u8, u8),
}

impl MockHandle {
    fn record(&self, call: MockCall) -> rusb::Result<()> {
        let mut state = self.state.borrow_mut();
        state.calls.push(call);
        if state.present(self.pin) {
            Ok(())
        } else {
            Err(rusb::Error::NoDevice)
        }
    }

    fn control(
        &mut self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        len: usize,
    ) -> rusb::Result<usize> {
        self.record(MockCall::Control {
            request_type,
            request,
            value,
            index,
        })?;

        let mut state = self.state.borrow_mut();
        let result = state.control_results.pop_front().unwrap_or(Ok(len));
        if result.is_ok() {
            state.switch();
        }
        result
    }
}

impl UsbHandle for MockHandle {
    fn read_control(
        &mut self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        _timeout: Duration,
    ) -> rusb::Result<usize> {
        // GET_CONFIGURATION
        if request_type == 0x80 && request == 0x08 {
            self.record(MockCall::Control {
                request_type,
                request,
                value,
                index,
            })?;

            let state = self.state.borrow();
            if state.get_configuration_fails {
                return Err(rusb::Error::Io);
            }
            let Some(answer) = buf.first_mut() else {
                return Ok(0);
            };
            *answer = state.configurations.get(&self.pin).copied().unwrap_or(1);
            return Ok(1);
        }

        buf.fill(0);
        self.control(request_type, request, value, index, buf.len())
    }

    fn write_control(
        &mut self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &[u8],
        _timeout: Duration,
    ) -> rusb::Result<usize> {
        self.control(request_type, request, value, index, buf.len())
    }

    fn read_bulk(
        &mut self,
        endpoint: u8,
        buf: &mut [u8],
        _timeout: Duration,
    ) -> rusb::Result<usize> {
        self.record(MockCall::BulkRead {
            endpoint,
            length: buf.len(),
        })?;

        let result = self.state.borrow_mut().bulk_read_results.pop_front();
        result.unwrap_or(Ok(()))?;
        buf.fill(0);
        Ok(buf.len())
    }

    fn write_bulk(&mut self, endpoint: u8, buf: &[u8], _timeout: Duration) -> rusb::Result<usize> {
        self.record(MockCall::BulkWrite {
            endpoint,
            data: buf.to_vec(),
        })?;

        let mut state = self.state.borrow_mut();
        state.bulk_write_results.pop_front().unwrap_or(Ok(()))?;
        state.switch();
        Ok(buf.len())
    }

    fn read_interrupt(
        &mut self,
        endpoint: u8,
        buf: &mut [u8],
        _timeout: Duration,
    ) -> rusb::Result<usize> {
        self.record(MockCall::InterruptRead {
            endpoint,
            length: buf.len(),
        })?;
        buf.fill(0);
        Ok(buf.len())
    }

    fn write_interrupt(
        &mut self,
        endpoint: u8,
        buf: &[u8],
        _timeout: Duration,
    ) -> rusb::Result<usize> {
        self.record(MockCall::InterruptWrite {
            endpoint,
            data: buf.to_vec(),
        })?;
        Ok(buf.len())
    }

    fn claim_interface(&mut self, interface: u8) -> rusb::Result<()> {
        self.record(MockCall::Claim(interface))
    }

    fn release_interface(&mut self, interface: u8) -> rusb::Result<()> {
        self.record(MockCall::Release(interface))
    }

    fn clear_halt(&mut self, endpoint: u8) -> rusb::Result<()> {
        self.record(MockCall::ClearHalt(endpoint))
    }

    fn set_active_configuration(&mut self, configuration: u8) -> rusb::Result<()> {
        self.record(MockCall::SetConfiguration(configuration))?;

        let mut state = self.state.borrow_mut();
        state.configurations.insert(self.pin, configuration);
        state.switch();
        Ok(())
    }

    fn set_alternate_setting(&mut self, interface: u8, setting: u8) -> rusb::Result<()> {
        self.record(MockCall::SetAltSetting(interface, setting))
    }

    fn kernel_driver_active(&mut self, _interface: u8) -> rusb::Result<bool> {
        let state = self.state.borrow();
        if state.driver_query_unsupported {
            Err(rusb::Error::NotSupported)
        } else if !state.present(self.pin) {
            Err(rusb::Error::NoDevice)
        } else {
            Ok(!state.driver_detached)
        }
    }

    fn supports_detach(&self) -> bool {
        !self.state.borrow().detach_unsupported
    }

    fn detach_kernel_driver(&mut self, interface: u8) -> rusb::Result<()> {
        self.record(MockCall::DetachDriver(interface))?;
        self.state.borrow_mut().driver_detached = true;
        Ok(())
    }

    fn reset(&mut self) -> rusb::Result<()> {
        self.record(MockCall::Reset)?;
        let result = self.state.borrow_mut().reset_results.pop_front();
        result.unwrap_or(Ok(()))
    }

    fn read_string_ascii(&mut self, index: u8) -> rusb::Result<String> {
        let state = self.state.borrow();
        if !state.present(self.pin) {
            return Err(rusb::Error::NoDevice);
        }
        Ok(match index {
            1 => "Mock Vendor".to_owned(),
            2 => "Mock Modem".to_owned(),
            _ => format!("{index:08}"),
        })
    }
}

impl Drop for MockHandle {
    fn drop(&mut self) {
        self.state.borrow_mut().calls.push(MockCall::Close);
    }
}
