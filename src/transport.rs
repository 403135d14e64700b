use crate::usb::UsbHandle;
use log::{info, trace, warn};
use std::time::Duration;
use thiserror::Error;

/// Timeout for every message and response transfer.
pub const BULK_TIMEOUT: Duration = Duration::from_millis(3000);
/// A response read is followed by one short read to flush whatever the device still has queued.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(100);
const DRAIN_LEN: usize = 13;

/// Result of one transfer. A device dropping off the bus mid-switch is often exactly what we
/// asked it to do, so it gets its own variant instead of being an error.
#[must_use]
#[derive(Clone, Debug, PartialEq)]
pub enum TransferOutcome<T> {
    Completed(T),
    DeviceGone,
    Failed(rusb::Error),
}

impl<T> TransferOutcome<T> {
    fn from_result(r: rusb::Result<T>) -> Self {
        match r {
            Ok(v) => TransferOutcome::Completed(v),
            Err(rusb::Error::NoDevice) => TransferOutcome::DeviceGone,
            Err(e) => TransferOutcome::Failed(e),
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, TransferOutcome::Completed(_))
    }

    fn map<U>(self, f: impl FnOnce(T) -> U) -> TransferOutcome<U> {
        match self {
            TransferOutcome::Completed(v) => TransferOutcome::Completed(f(v)),
            TransferOutcome::DeviceGone => TransferOutcome::DeviceGone,
            TransferOutcome::Failed(e) => TransferOutcome::Failed(e),
        }
    }
}

fn out_endpoint(endpoint: u8) -> u8 {
    if endpoint & 0x80 != 0 {
        warn!("Endpoint {endpoint:#04x} has excessive IN direction bit, fixing");
        endpoint & !0x80
    } else {
        endpoint
    }
}

fn in_endpoint(endpoint: u8) -> u8 {
    if endpoint & 0x80 == 0 {
        warn!("Endpoint {endpoint:#04x} is missing IN direction bit, fixing");
        endpoint | 0x80
    } else {
        endpoint
    }
}

pub(crate) fn write_bulk_with_timeout<H: UsbHandle>(
    handle: &mut H,
    endpoint: u8,
    payload: &[u8],
    timeout: Duration,
) -> TransferOutcome<usize> {
    TransferOutcome::from_result(handle.write_bulk(out_endpoint(endpoint), payload, timeout))
}

pub(crate) fn read_bulk_with_timeout<H: UsbHandle>(
    handle: &mut H,
    endpoint: u8,
    length: usize,
    timeout: Duration,
) -> TransferOutcome<Vec<u8>> {
    let mut buf = vec![0u8; length];
    TransferOutcome::from_result(handle.read_bulk(in_endpoint(endpoint), &mut buf, timeout)).map(
        |n| {
            buf.truncate(n);
            buf
        },
    )
}

/// Send `payload` to a bulk OUT endpoint.
pub fn write_bulk<H: UsbHandle>(
    handle: &mut H,
    endpoint: u8,
    payload: &[u8],
) -> TransferOutcome<usize> {
    let outcome = write_bulk_with_timeout(handle, endpoint, payload, BULK_TIMEOUT);
    match &outcome {
        TransferOutcome::Completed(_) => info!(" OK, message successfully sent"),
        TransferOutcome::DeviceGone => {
            info!(" Device seems to have vanished right after sending. Good.")
        }
        TransferOutcome::Failed(e) => {
            info!(" Sending the message returned error {e}. Trying to continue")
        }
    }
    outcome
}

/// Read up to `length` bytes from a bulk IN endpoint, then drain leftovers.
pub fn read_bulk<H: UsbHandle>(
    handle: &mut H,
    endpoint: u8,
    length: usize,
) -> TransferOutcome<Vec<u8>> {
    let outcome = read_bulk_with_timeout(handle, endpoint, length, BULK_TIMEOUT);

    let mut drain = [0u8; DRAIN_LEN];
    if let Err(e) = handle.read_bulk(in_endpoint(endpoint), &mut drain, DRAIN_TIMEOUT) {
        trace!("Drain read: {e}");
    }

    match &outcome {
        TransferOutcome::Completed(data) => {
            info!(" OK, response successfully read ({} bytes).", data.len())
        }
        TransferOutcome::DeviceGone => info!(" Device seems to have vanished after reading. Good."),
        TransferOutcome::Failed(e) => info!(" Response reading got error {e}"),
    }
    outcome
}

pub fn write_interrupt<H: UsbHandle>(
    handle: &mut H,
    endpoint: u8,
    payload: &[u8],
    timeout: Duration,
) -> TransferOutcome<usize> {
    TransferOutcome::from_result(handle.write_interrupt(out_endpoint(endpoint), payload, timeout))
}

pub fn read_interrupt<H: UsbHandle>(
    handle: &mut H,
    endpoint: u8,
    length: usize,
    timeout: Duration,
) -> TransferOutcome<Vec<u8>> {
    let mut buf = vec![0u8; length];
    TransferOutcome::from_result(handle.read_interrupt(in_endpoint(endpoint), &mut buf, timeout))
        .map(|n| {
            buf.truncate(n);
            buf
        })
}

/// A message string that can't be turned into bytes.
#[derive(Error, Debug, PartialEq)]
#[non_exhaustive]
pub enum MessageError {
    #[error("hex string has uneven length")]
    OddLength,

    #[error("{0} is not a hex string")]
    NotHex(String),
}

/// Decode a hex message. Never returns a partial result.
pub fn decode_message(message: &str) -> Result<Vec<u8>, MessageError> {
    hex::decode(message).map_err(|e| match e {
        hex::FromHexError::OddLength => MessageError::OddLength,
        _ => MessageError::NotHex(message.to_owned()),
    })
}

/// Decode message number `number` and write it to `endpoint`. A decode failure means the
/// message is skipped; what that means for the rest of a sequence is up to the caller.
pub fn send_message<H: UsbHandle>(
    handle: &mut H,
    endpoint: u8,
    message: &str,
    number: usize,
) -> Result<TransferOutcome<usize>, MessageError> {
    let bytes = decode_message(message).inspect_err(|e| {
        warn!("MessageContent {number}: {e}. Skipping ...");
    })?;

    info!("Trying to send message {number} to endpoint {endpoint:#04x} ...");
    Ok(write_bulk(handle, endpoint, &bytes))
}
