// Copyright 2024, F. Stan
//
// Licensed under the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// This file may not be copied, modified, or distributed
// except according to those terms.

use i2cdev::linux::LinuxI2CError;
use std::io;
use thiserror::Error;

use crate::scd41::DeviceState;

/// Linux errno values reported by the i2c-dev driver.
const EAGAIN: i32 = 11;
const ENXIO: i32 = 6;
const EBUSY: i32 = 16;
const ETIMEDOUT: i32 = 110;
const EREMOTEIO: i32 = 121;

///
/// Failure of a single raw bus transfer. Arbitration loss, a busy bus
/// and a transfer timeout are transient and retried by the
/// [`BusClient`](crate::bus::BusClient); everything else is not.
///
#[derive(Debug, Error)]
pub enum TransportError {
    /// Another master won arbitration
    #[error("bus arbitration lost")]
    ArbitrationLoss,
    /// Bus held by another transfer
    #[error("bus busy")]
    Busy,
    /// Transfer did not complete in time
    #[error("bus transfer timed out")]
    Timeout,
    /// Device did not acknowledge its address or data
    #[error("no acknowledge from device")]
    Nack,
    /// Input/output error
    #[error(transparent)]
    Io(io::Error),
}

impl TransportError {
    /// True when retrying the same transfer may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TransportError::ArbitrationLoss | TransportError::Busy | TransportError::Timeout
        )
    }
}

impl From<io::Error> for TransportError {
    fn from(e: io::Error) -> Self {
        match e.raw_os_error() {
            Some(EAGAIN) => TransportError::ArbitrationLoss,
            Some(EBUSY) => TransportError::Busy,
            Some(ETIMEDOUT) => TransportError::Timeout,
            Some(ENXIO) | Some(EREMOTEIO) => TransportError::Nack,
            _ => match e.kind() {
                io::ErrorKind::TimedOut => TransportError::Timeout,
                io::ErrorKind::WouldBlock => TransportError::ArbitrationLoss,
                _ => TransportError::Io(e),
            },
        }
    }
}

impl From<LinuxI2CError> for TransportError {
    fn from(e: LinuxI2CError) -> Self {
        TransportError::from(io::Error::from(e))
    }
}

///
/// Driver level error. Every driver and the [`Sensor`](crate::sensor::Sensor)
/// facade return this type unmodified.
///
#[derive(Debug, Error)]
pub enum SensorError {
    /// Transport failure after exhausting the retry bound
    #[error("bus error on device {address:#04x} after {attempts} attempt(s): {source}")]
    Bus {
        address: u16,
        attempts: u32,
        #[source]
        source: TransportError,
    },
    /// Factory calibration block could not be read or is implausible
    #[error("calibration read failed: {0}")]
    CalibrationRead(String),
    /// The chip never signalled that its measurement completed
    #[error("timed out waiting for measurement")]
    MeasurementTimeout,
    /// A received word does not match its CRC8
    #[error("checksum mismatch: expected {expected:#04x}, received {actual:#04x}")]
    Checksum { expected: u8, actual: u8 },
    /// No new sample is available yet, or the wait was cancelled
    #[error("measurement not ready")]
    NotReady,
    /// Command not allowed in the current device state
    #[error("{operation} not allowed while {state:?}")]
    InvalidState {
        state: DeviceState,
        operation: &'static str,
    },
    /// ADC counts at the top of the configured range
    #[error("light sensor saturated (ch0 {ch0}, ch1 {ch1}, limit {limit})")]
    Saturation { ch0: u16, ch1: u16, limit: u16 },
    /// Identification register holds an unexpected value
    #[error("unexpected chip id {found:#04x} (expected {expected:#04x})")]
    UnexpectedChipId { expected: u8, found: u8 },
    /// Configuration value out of range
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// Sensor name not known to the selector
    #[error("unknown sensor {0:?}")]
    UnknownSensor(String),
    /// Configuration file could not be read or parsed
    #[error("configuration error: {0}")]
    Config(String),
}

impl SensorError {
    /// Errors the caller may retry without changing anything.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SensorError::Bus { .. } | SensorError::MeasurementTimeout | SensorError::Checksum { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_classification() {
        let t = |code| TransportError::from(io::Error::from_raw_os_error(code));
        assert!(matches!(t(EAGAIN), TransportError::ArbitrationLoss));
        assert!(matches!(t(EBUSY), TransportError::Busy));
        assert!(matches!(t(ETIMEDOUT), TransportError::Timeout));
        assert!(matches!(t(EREMOTEIO), TransportError::Nack));
        assert!(matches!(t(ENXIO), TransportError::Nack));
        assert!(t(EAGAIN).is_transient());
        assert!(!t(EREMOTEIO).is_transient());
        assert!(!TransportError::Io(io::Error::new(io::ErrorKind::Other, "x")).is_transient());
    }

    #[test]
    fn retryable_errors() {
        assert!(SensorError::MeasurementTimeout.is_retryable());
        assert!(SensorError::Checksum { expected: 1, actual: 2 }.is_retryable());
        assert!(!SensorError::NotReady.is_retryable());
        assert!(!SensorError::Saturation { ch0: 1, ch1: 1, limit: 1 }.is_retryable());
    }
}
