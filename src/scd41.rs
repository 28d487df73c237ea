// Copyright 2024, F. Stan
//
// Licensed under the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// This file may not be copied, modified, or distributed
// except according to those terms.

//! SCD41 CO2 sensor.
//!
//! Commands and timings taken from the
//! [SCD4x datasheet](https://sensirion.com/media/documents/48C4B7FB/64C134E7/Sensirion_SCD4x_Datasheet.pdf).
//! Every command is a 16-bit opcode. Data travels in 3-byte units of
//! (MSB, LSB, CRC8).

use log::{debug, warn};
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::bus::BusClient;
use crate::clock::CancelHandle;
use crate::error::{SensorError, TransportError};
use crate::measurement::{Measurement, Quantity, Reading};
use crate::sensor::SensorKind;

pub const DEFAULT_ADDRESS: u16 = 0x62;

/// Sample period in periodic mode.
pub const PERIODIC_INTERVAL: Duration = Duration::from_secs(5);
/// Sample period in low power periodic mode.
pub const LOW_POWER_INTERVAL: Duration = Duration::from_secs(30);

const CRC_POLYNOMIAL: u8 = 0x31;
const CRC_INIT: u8 = 0xFF;
const DATA_READY_POLL: Duration = Duration::from_millis(100);
// Minimum idle time between two transfers to the chip.
const COMMAND_GAP: Duration = Duration::from_millis(1);
const DATA_READY_MASK: u16 = 0x07FF;
const FRC_FAILED: u16 = 0xFFFF;

/// SCD41 command set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    StartPeriodicMeasurement,
    StartLowPowerPeriodicMeasurement,
    ReadMeasurement,
    StopPeriodicMeasurement,
    GetDataReadyStatus,
    SetTemperatureOffset,
    GetTemperatureOffset,
    SetSensorAltitude,
    GetSensorAltitude,
    SetAmbientPressure,
    PerformForcedRecalibration,
    SetAutomaticSelfCalibrationEnabled,
    GetAutomaticSelfCalibrationEnabled,
    PersistSettings,
    GetSerialNumber,
    PerformFactoryReset,
    Reinit,
    MeasureSingleShot,
    PowerDown,
    WakeUp,
}

impl Command {
    pub fn opcode(self) -> u16 {
        match self {
            Command::StartPeriodicMeasurement => 0x21B1,
            Command::StartLowPowerPeriodicMeasurement => 0x21AC,
            Command::ReadMeasurement => 0xEC05,
            Command::StopPeriodicMeasurement => 0x3F86,
            Command::GetDataReadyStatus => 0xE4B8,
            Command::SetTemperatureOffset => 0x241D,
            Command::GetTemperatureOffset => 0x2318,
            Command::SetSensorAltitude => 0x2427,
            Command::GetSensorAltitude => 0x2322,
            Command::SetAmbientPressure => 0xE000,
            Command::PerformForcedRecalibration => 0x362F,
            Command::SetAutomaticSelfCalibrationEnabled => 0x2416,
            Command::GetAutomaticSelfCalibrationEnabled => 0x2313,
            Command::PersistSettings => 0x3615,
            Command::GetSerialNumber => 0x3682,
            Command::PerformFactoryReset => 0x3632,
            Command::Reinit => 0x3646,
            Command::MeasureSingleShot => 0x219D,
            Command::PowerDown => 0x36E0,
            Command::WakeUp => 0x36F6,
        }
    }

    /// Time the chip needs before it accepts the next command or its
    /// reply can be read.
    pub fn execution_time(self) -> Duration {
        match self {
            Command::StartPeriodicMeasurement | Command::StartLowPowerPeriodicMeasurement => {
                Duration::ZERO
            }
            Command::StopPeriodicMeasurement => Duration::from_millis(500),
            Command::PerformForcedRecalibration => Duration::from_millis(400),
            Command::PersistSettings => Duration::from_millis(800),
            Command::PerformFactoryReset => Duration::from_millis(1200),
            Command::Reinit => Duration::from_millis(20),
            Command::MeasureSingleShot => Duration::from_millis(5000),
            Command::WakeUp => Duration::from_millis(30),
            _ => Duration::from_millis(1),
        }
    }

    /// Commands the chip accepts while a periodic measurement runs.
    pub fn allowed_while_measuring(self) -> bool {
        matches!(
            self,
            Command::ReadMeasurement
                | Command::StopPeriodicMeasurement
                | Command::GetDataReadyStatus
                | Command::SetAmbientPressure
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Idle,
    MeasuringPeriodic,
    DataReady,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeasurementMode {
    /// One sample every 5 s
    Periodic,
    /// One sample every 30 s
    LowPower,
}

impl MeasurementMode {
    pub fn interval(self) -> Duration {
        match self {
            MeasurementMode::Periodic => PERIODIC_INTERVAL,
            MeasurementMode::LowPower => LOW_POWER_INTERVAL,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Scd41Config {
    pub mode: MeasurementMode,
    /// Temperature offset in °C, written when set
    pub temperature_offset: Option<f32>,
    /// Altitude in meters above sea level, written when set
    pub altitude: Option<u16>,
    /// Automatic self calibration, written when set
    pub automatic_self_calibration: Option<bool>,
    /// Longest blocking wait for a sample; two sample periods when unset
    pub read_timeout_secs: Option<u64>,
}

impl Default for Scd41Config {
    fn default() -> Self {
        Scd41Config {
            mode: MeasurementMode::Periodic,
            temperature_offset: None,
            altitude: None,
            automatic_self_calibration: None,
            read_timeout_secs: None,
        }
    }
}

impl Scd41Config {
    pub fn read_timeout(&self) -> Duration {
        match self.read_timeout_secs {
            Some(secs) => Duration::from_secs(secs),
            None => self.mode.interval() * 2,
        }
    }
}

/// CO2, temperature and humidity words of one read_measurement reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawSample {
    pub co2: u16,
    pub temperature: u16,
    pub humidity: u16,
}

impl RawSample {
    pub fn decode(&self) -> Measurement {
        let temperature = -45.0 + 175.0 * self.temperature as f64 / 65536.0;
        let humidity = (100.0 * self.humidity as f64 / 65536.0).clamp(0.0, 100.0);
        Measurement::new(SensorKind::Scd41)
            .with(Quantity::Co2, Reading::valid(self.co2 as f64))
            .with(Quantity::Temperature, Reading::valid(temperature))
            .with(Quantity::Humidity, Reading::valid(humidity))
    }
}

///
/// SCD41 struct, drives the chip through its periodic measurement state
/// machine on a shared bus. Not reentrant: every command takes
/// `&mut self`, so concurrent use needs an outer lock.
///
pub struct Scd41 {
    bus: Arc<BusClient>,
    address: u16,
    config: Scd41Config,
    state: DeviceState,
    interval: Duration,
    next_sample_at: Option<Instant>,
    cancel: CancelHandle,
}

impl Scd41 {
    /// Create the driver. No bus traffic happens until a command is issued.
    pub fn new(bus: Arc<BusClient>, config: Scd41Config) -> Scd41 {
        bus.set_min_interval(DEFAULT_ADDRESS, COMMAND_GAP);
        Scd41 {
            bus,
            address: DEFAULT_ADDRESS,
            interval: config.mode.interval(),
            config,
            state: DeviceState::Idle,
            next_sample_at: None,
            cancel: CancelHandle::new(),
        }
    }

    /// Checksum calculation, CRC-8 with polynomial 0x31 and init 0xFF.
    ///
    /// More info regarding the [algorithm](https://en.wikipedia.org/wiki/Computation_of_cyclic_redundancy_checks)
    ///
    pub fn crc8(message: &[u8]) -> u8 {
        let mut rem = CRC_INIT;
        for byte in message {
            rem ^= byte;
            for _ in 0..8 {
                if (rem & 0x80) != 0 {
                    rem = (rem << 1) ^ CRC_POLYNOMIAL;
                } else {
                    rem <<= 1;
                }
            }
        }
        rem
    }

    ///
    /// Checks one (MSB, LSB, CRC) unit and returns its word.
    ///
    fn check_crc_in_bytes(unit: &[u8]) -> Result<u16, SensorError> {
        let expected = Scd41::crc8(&unit[..2]);
        if expected != unit[2] {
            warn!(
                "scd41: checksum mismatch on {:02x?} (expected {:#04x})",
                unit, expected
            );
            return Err(SensorError::Checksum {
                expected,
                actual: unit[2],
            });
        }
        Ok(u16::from_be_bytes([unit[0], unit[1]]))
    }

    /// Split a reply into words, rejecting it as a whole if any unit fails.
    pub fn decode_words(data: &[u8]) -> Result<Vec<u16>, SensorError> {
        data.chunks_exact(3).map(Scd41::check_crc_in_bytes).collect()
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    pub fn config(&self) -> &Scd41Config {
        &self.config
    }

    /// Handle that interrupts [`Scd41::wait_for_measurement`] from another thread.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    fn check_allowed(&self, command: Command) -> Result<(), SensorError> {
        if self.state != DeviceState::Idle && !command.allowed_while_measuring() {
            return Err(SensorError::InvalidState {
                state: self.state,
                operation: command_name(command),
            });
        }
        Ok(())
    }

    fn send(&mut self, command: Command) -> Result<(), SensorError> {
        self.check_allowed(command)?;
        debug!("scd41: {:?}", command);
        self.bus
            .write_only(self.address, &command.opcode().to_be_bytes())?;
        self.bus.clock().sleep(command.execution_time());
        Ok(())
    }

    fn send_with_word(&mut self, command: Command, word: u16) -> Result<(), SensorError> {
        self.check_allowed(command)?;
        debug!("scd41: {:?} {:#06x}", command, word);
        let [op_msb, op_lsb] = command.opcode().to_be_bytes();
        let [msb, lsb] = word.to_be_bytes();
        let checksum = Scd41::crc8(&[msb, lsb]);
        self.bus
            .write_only(self.address, &[op_msb, op_lsb, msb, lsb, checksum])?;
        self.bus.clock().sleep(command.execution_time());
        Ok(())
    }

    fn fetch(&mut self, command: Command, words: usize) -> Result<Vec<u16>, SensorError> {
        self.check_allowed(command)?;
        let data = self.bus.transact_delayed(
            self.address,
            &command.opcode().to_be_bytes(),
            command.execution_time(),
            words * 3,
        )?;
        Scd41::decode_words(&data)
    }

    fn require_idle(&self, operation: &'static str) -> Result<(), SensorError> {
        if self.state != DeviceState::Idle {
            return Err(SensorError::InvalidState {
                state: self.state,
                operation,
            });
        }
        Ok(())
    }

    /// Wake the chip from power-down. The chip does not acknowledge this
    /// command, so a missing ACK is expected.
    pub fn wake_up(&mut self) -> Result<(), SensorError> {
        match self.send(Command::WakeUp) {
            Err(SensorError::Bus {
                source: TransportError::Nack,
                ..
            }) => {
                self.bus.clock().sleep(Command::WakeUp.execution_time());
                Ok(())
            }
            other => other,
        }
    }

    pub fn power_down(&mut self) -> Result<(), SensorError> {
        self.send(Command::PowerDown)
    }

    fn start(&mut self, command: Command, interval: Duration) -> Result<(), SensorError> {
        self.require_idle(command_name(command))?;
        self.send(command)?;
        self.state = DeviceState::MeasuringPeriodic;
        self.interval = interval;
        self.next_sample_at = Some(self.bus.clock().now() + interval);
        Ok(())
    }

    /// Start sampling every 5 seconds.
    pub fn start_periodic_measurement(&mut self) -> Result<(), SensorError> {
        self.start(Command::StartPeriodicMeasurement, PERIODIC_INTERVAL)
    }

    /// Start sampling every 30 seconds.
    pub fn start_low_power_periodic_measurement(&mut self) -> Result<(), SensorError> {
        self.start(Command::StartLowPowerPeriodicMeasurement, LOW_POWER_INTERVAL)
    }

    /// Stop periodic measurement and wait until the chip is idle.
    /// Accepted in every state.
    pub fn stop_periodic_measurement(&mut self) -> Result<(), SensorError> {
        self.send(Command::StopPeriodicMeasurement)?;
        self.state = DeviceState::Idle;
        self.next_sample_at = None;
        Ok(())
    }

    /// Whether a new sample is waiting in the chip.
    pub fn get_data_ready_status(&mut self) -> Result<bool, SensorError> {
        let word = self.fetch(Command::GetDataReadyStatus, 1)?[0];
        let ready = word & DATA_READY_MASK != 0;
        if ready && self.state == DeviceState::MeasuringPeriodic {
            self.state = DeviceState::DataReady;
        }
        Ok(ready)
    }

    fn read_raw(&mut self) -> Result<RawSample, SensorError> {
        let words = self.fetch(Command::ReadMeasurement, 3)?;
        Ok(RawSample {
            co2: words[0],
            temperature: words[1],
            humidity: words[2],
        })
    }

    ///
    /// Read the latest periodic sample without blocking.
    ///
    /// Fails with [`SensorError::NotReady`] when no measurement is running,
    /// when the sample interval has not elapsed since the start or the
    /// previous read, or when the chip reports no new data.
    ///
    pub fn read_measurement(&mut self) -> Result<Measurement, SensorError> {
        if self.state == DeviceState::Idle {
            return Err(SensorError::NotReady);
        }
        let now = self.bus.clock().now();
        if self.next_sample_at.is_some_and(|at| now < at) {
            return Err(SensorError::NotReady);
        }
        if self.state == DeviceState::MeasuringPeriodic && !self.get_data_ready_status()? {
            return Err(SensorError::NotReady);
        }

        let raw = self.read_raw()?;
        self.state = DeviceState::MeasuringPeriodic;
        self.next_sample_at = Some(self.bus.clock().now() + self.interval);
        debug!("scd41: {:?}", raw);
        Ok(raw.decode())
    }

    ///
    /// Block until the next sample is available, polling data-ready every
    /// 100 ms. Gives up with [`SensorError::MeasurementTimeout`] after
    /// `timeout`, or with [`SensorError::NotReady`] when cancelled through
    /// the [`CancelHandle`].
    ///
    pub fn wait_for_measurement(&mut self, timeout: Duration) -> Result<Measurement, SensorError> {
        if self.state == DeviceState::Idle {
            return Err(SensorError::NotReady);
        }
        let deadline = self.bus.clock().now() + timeout;
        loop {
            if self.cancel.take() {
                debug!("scd41: wait cancelled");
                return Err(SensorError::NotReady);
            }
            match self.read_measurement() {
                Err(SensorError::NotReady) => {}
                other => return other,
            }

            let clock = self.bus.clock();
            let now = clock.now();
            if now >= deadline {
                return Err(SensorError::MeasurementTimeout);
            }
            clock.sleep(DATA_READY_POLL.min(deadline - now));
        }
    }

    /// One on-demand sample taken from idle, blocking for 5 seconds.
    pub fn measure_single_shot(&mut self) -> Result<Measurement, SensorError> {
        self.require_idle("measure_single_shot")?;
        self.send(Command::MeasureSingleShot)?;
        Ok(self.read_raw()?.decode())
    }

    /// Temperature offset in °C subtracted from the temperature output.
    pub fn set_temperature_offset(&mut self, offset: f32) -> Result<(), SensorError> {
        let word = (offset as f64 * 65536.0 / 175.0).round();
        if !(0.0..=u16::MAX as f64).contains(&word) {
            return Err(SensorError::InvalidConfig(format!(
                "scd41 temperature offset {} out of range",
                offset
            )));
        }
        self.send_with_word(Command::SetTemperatureOffset, word as u16)
    }

    pub fn get_temperature_offset(&mut self) -> Result<f32, SensorError> {
        let word = self.fetch(Command::GetTemperatureOffset, 1)?[0];
        Ok((175.0 * word as f64 / 65536.0) as f32)
    }

    /// Altitude in meters used for pressure compensation.
    pub fn set_sensor_altitude(&mut self, altitude: u16) -> Result<(), SensorError> {
        self.send_with_word(Command::SetSensorAltitude, altitude)
    }

    pub fn get_sensor_altitude(&mut self) -> Result<u16, SensorError> {
        Ok(self.fetch(Command::GetSensorAltitude, 1)?[0])
    }

    /// Ambient pressure in hPa. Also accepted while measuring.
    pub fn set_ambient_pressure(&mut self, pressure: u16) -> Result<(), SensorError> {
        self.send_with_word(Command::SetAmbientPressure, pressure)
    }

    ///
    /// Forced recalibration against a known CO2 concentration. Needs
    /// a few minutes of prior measurement and an idle chip.
    /// Returns the applied correction in ppm, or `None` if the chip
    /// reports the recalibration as failed.
    ///
    pub fn perform_forced_recalibration(&mut self, target_ppm: u16) -> Result<Option<i16>, SensorError> {
        self.send_with_word(Command::PerformForcedRecalibration, target_ppm)?;
        let word = Scd41::decode_words(&self.bus.read_only(self.address, 3)?)?[0];
        if word == FRC_FAILED {
            return Ok(None);
        }
        Ok(Some((word as i32 - 0x8000) as i16))
    }

    pub fn set_automatic_self_calibration(&mut self, enabled: bool) -> Result<(), SensorError> {
        self.send_with_word(Command::SetAutomaticSelfCalibrationEnabled, enabled as u16)
    }

    pub fn get_automatic_self_calibration(&mut self) -> Result<bool, SensorError> {
        Ok(self.fetch(Command::GetAutomaticSelfCalibrationEnabled, 1)?[0] == 1)
    }

    /// Store the current settings in EEPROM.
    pub fn persist_settings(&mut self) -> Result<(), SensorError> {
        self.send(Command::PersistSettings)
    }

    /// 48-bit serial number.
    pub fn get_serial_number(&mut self) -> Result<u64, SensorError> {
        let words = self.fetch(Command::GetSerialNumber, 3)?;
        Ok(words.iter().fold(0u64, |acc, &w| (acc << 16) | w as u64))
    }

    /// Reset settings and calibration history stored in EEPROM.
    pub fn perform_factory_reset(&mut self) -> Result<(), SensorError> {
        self.send(Command::PerformFactoryReset)
    }

    /// Reload the settings stored in EEPROM.
    pub fn reinit(&mut self) -> Result<(), SensorError> {
        self.send(Command::Reinit)
    }

    ///
    /// Apply a new configuration. Only allowed after
    /// [`Scd41::stop_periodic_measurement`].
    ///
    /// Settings are written one by one and [`Scd41::config`] follows each
    /// accepted write, so after a failure it still describes the chip.
    ///
    pub fn configure(&mut self, config: Scd41Config) -> Result<(), SensorError> {
        self.require_idle("configure")?;
        if let Some(offset) = config.temperature_offset {
            self.set_temperature_offset(offset)?;
            self.config.temperature_offset = Some(offset);
        }
        if let Some(altitude) = config.altitude {
            self.set_sensor_altitude(altitude)?;
            self.config.altitude = Some(altitude);
        }
        if let Some(enabled) = config.automatic_self_calibration {
            self.set_automatic_self_calibration(enabled)?;
            self.config.automatic_self_calibration = Some(enabled);
        }
        self.interval = config.mode.interval();
        self.config.mode = config.mode;
        self.config.read_timeout_secs = config.read_timeout_secs;
        Ok(())
    }

    /// Start periodic measurement in the configured mode.
    pub fn start_configured(&mut self) -> Result<(), SensorError> {
        match self.config.mode {
            MeasurementMode::Periodic => self.start_periodic_measurement(),
            MeasurementMode::LowPower => self.start_low_power_periodic_measurement(),
        }
    }
}

fn command_name(command: Command) -> &'static str {
    match command {
        Command::StartPeriodicMeasurement => "start_periodic_measurement",
        Command::StartLowPowerPeriodicMeasurement => "start_low_power_periodic_measurement",
        Command::ReadMeasurement => "read_measurement",
        Command::StopPeriodicMeasurement => "stop_periodic_measurement",
        Command::GetDataReadyStatus => "get_data_ready_status",
        Command::SetTemperatureOffset => "set_temperature_offset",
        Command::GetTemperatureOffset => "get_temperature_offset",
        Command::SetSensorAltitude => "set_sensor_altitude",
        Command::GetSensorAltitude => "get_sensor_altitude",
        Command::SetAmbientPressure => "set_ambient_pressure",
        Command::PerformForcedRecalibration => "perform_forced_recalibration",
        Command::SetAutomaticSelfCalibrationEnabled => "set_automatic_self_calibration_enabled",
        Command::GetAutomaticSelfCalibrationEnabled => "get_automatic_self_calibration_enabled",
        Command::PersistSettings => "persist_settings",
        Command::GetSerialNumber => "get_serial_number",
        Command::PerformFactoryReset => "perform_factory_reset",
        Command::Reinit => "reinit",
        Command::MeasureSingleShot => "measure_single_shot",
        Command::PowerDown => "power_down",
        Command::WakeUp => "wake_up",
    }
}
