// Copyright 2024, F. Stan
//
// Licensed under the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// This file may not be copied, modified, or distributed
// except according to those terms.

//! BME280 temperature, humidity and pressure sensor.
//!
//! Register map and compensation formulas from the
//! [datasheet](https://www.bosch-sensortec.com/media/boschsensortec/downloads/datasheets/bst-bme280-ds002.pdf),
//! sections 4.2.3 and 5.4. The integer (32/64-bit) variants are used.

use log::{debug, trace};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

use crate::bus::BusClient;
use crate::error::SensorError;
use crate::measurement::{Measurement, Quantity, Reading};
use crate::sensor::SensorKind;

/// SDO pulled low.
pub const DEFAULT_ADDRESS: u16 = 0x76;
/// SDO pulled high.
pub const SECONDARY_ADDRESS: u16 = 0x77;

const CHIP_ID: u8 = 0x60;

const REG_CALIB_00: u8 = 0x88;
const CALIB_00_LEN: usize = 26;
const REG_CALIB_26: u8 = 0xE1;
const CALIB_26_LEN: usize = 7;
const REG_ID: u8 = 0xD0;
const REG_RESET: u8 = 0xE0;
const REG_CTRL_HUM: u8 = 0xF2;
const REG_STATUS: u8 = 0xF3;
const REG_CTRL_MEAS: u8 = 0xF4;
const REG_CONFIG: u8 = 0xF5;
const REG_DATA: u8 = 0xF7;
const DATA_LEN: usize = 8;

const RESET_WORD: u8 = 0xB6;
const STATUS_MEASURING: u8 = 0x08;
const STARTUP_TIME: Duration = Duration::from_millis(2);
const POLL_INTERVAL: Duration = Duration::from_millis(1);
const MAX_POLLS: u32 = 50;

// ADC output of a channel whose oversampling is set to skip.
const SKIPPED_20BIT: u32 = 0x80000;
const SKIPPED_16BIT: u32 = 0x8000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Sleep,
    /// One conversion per `read()`, back to sleep afterwards
    Forced,
    /// Continuous conversions separated by the standby time
    Normal,
}

impl Mode {
    fn bits(self) -> u8 {
        match self {
            Mode::Sleep => 0b00,
            Mode::Forced => 0b01,
            Mode::Normal => 0b11,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Oversampling {
    Skip,
    X1,
    X2,
    X4,
    X8,
    X16,
}

impl Oversampling {
    fn bits(self) -> u8 {
        match self {
            Oversampling::Skip => 0,
            Oversampling::X1 => 1,
            Oversampling::X2 => 2,
            Oversampling::X4 => 3,
            Oversampling::X8 => 4,
            Oversampling::X16 => 5,
        }
    }

    fn factor(self) -> u64 {
        match self {
            Oversampling::Skip => 0,
            Oversampling::X1 => 1,
            Oversampling::X2 => 2,
            Oversampling::X4 => 4,
            Oversampling::X8 => 8,
            Oversampling::X16 => 16,
        }
    }
}

/// Inactive time between conversions in normal mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Standby {
    Ms0_5,
    Ms62_5,
    Ms125,
    Ms250,
    Ms500,
    Ms1000,
    Ms10,
    Ms20,
}

impl Standby {
    fn bits(self) -> u8 {
        match self {
            Standby::Ms0_5 => 0,
            Standby::Ms62_5 => 1,
            Standby::Ms125 => 2,
            Standby::Ms250 => 3,
            Standby::Ms500 => 4,
            Standby::Ms1000 => 5,
            Standby::Ms10 => 6,
            Standby::Ms20 => 7,
        }
    }
}

/// IIR filter coefficient.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Filter {
    Off,
    X2,
    X4,
    X8,
    X16,
}

impl Filter {
    fn bits(self) -> u8 {
        match self {
            Filter::Off => 0,
            Filter::X2 => 1,
            Filter::X4 => 2,
            Filter::X8 => 3,
            Filter::X16 => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Bme280Config {
    pub mode: Mode,
    pub oversampling_temperature: Oversampling,
    pub oversampling_pressure: Oversampling,
    pub oversampling_humidity: Oversampling,
    pub standby: Standby,
    pub filter: Filter,
}

impl Default for Bme280Config {
    fn default() -> Self {
        Bme280Config {
            mode: Mode::Forced,
            oversampling_temperature: Oversampling::X16,
            oversampling_pressure: Oversampling::X16,
            oversampling_humidity: Oversampling::X16,
            standby: Standby::Ms0_5,
            filter: Filter::Off,
        }
    }
}

impl Bme280Config {
    fn ctrl_hum(&self) -> u8 {
        self.oversampling_humidity.bits()
    }

    fn ctrl_meas(&self, mode: Mode) -> u8 {
        (self.oversampling_temperature.bits() << 5)
            | (self.oversampling_pressure.bits() << 2)
            | mode.bits()
    }

    fn config(&self) -> u8 {
        (self.standby.bits() << 5) | (self.filter.bits() << 2)
    }

    /// Maximum conversion time for the oversampling settings (datasheet 9.1).
    pub fn max_measurement_time(&self) -> Duration {
        let t = self.oversampling_temperature.factor();
        let p = self.oversampling_pressure.factor();
        let h = self.oversampling_humidity.factor();
        let mut micros = 1250 + 2300 * t;
        if p > 0 {
            micros += 2300 * p + 575;
        }
        if h > 0 {
            micros += 2300 * h + 575;
        }
        Duration::from_micros(micros)
    }
}

///
/// Factory trimming coefficients from NVM registers 0x88..0xA1 and
/// 0xE1..0xE7. Read once per driver and never modified.
///
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Calibration {
    pub dig_t1: u16,
    pub dig_t2: i16,
    pub dig_t3: i16,
    pub dig_p1: u16,
    pub dig_p2: i16,
    pub dig_p3: i16,
    pub dig_p4: i16,
    pub dig_p5: i16,
    pub dig_p6: i16,
    pub dig_p7: i16,
    pub dig_p8: i16,
    pub dig_p9: i16,
    pub dig_h1: u8,
    pub dig_h2: i16,
    pub dig_h3: u8,
    pub dig_h4: i16,
    pub dig_h5: i16,
    pub dig_h6: i8,
}

impl Calibration {
    /// Parse the two calibration register blocks. An all-zero or all-ones
    /// block means the read did not reach the NVM and is rejected.
    pub fn from_registers(calib_00: &[u8], calib_26: &[u8]) -> Result<Calibration, SensorError> {
        if calib_00.len() != CALIB_00_LEN || calib_26.len() != CALIB_26_LEN {
            return Err(SensorError::CalibrationRead(format!(
                "expected {}+{} bytes, got {}+{}",
                CALIB_00_LEN,
                CALIB_26_LEN,
                calib_00.len(),
                calib_26.len()
            )));
        }
        for block in [calib_00, calib_26] {
            if block.iter().all(|&b| b == 0x00) || block.iter().all(|&b| b == 0xFF) {
                return Err(SensorError::CalibrationRead(format!(
                    "implausible calibration block {:02x?}",
                    block
                )));
            }
        }

        let u16_at = |i: usize| u16::from_le_bytes([calib_00[i], calib_00[i + 1]]);
        let i16_at = |i: usize| i16::from_le_bytes([calib_00[i], calib_00[i + 1]]);
        let h = calib_26;

        Ok(Calibration {
            dig_t1: u16_at(0),
            dig_t2: i16_at(2),
            dig_t3: i16_at(4),
            dig_p1: u16_at(6),
            dig_p2: i16_at(8),
            dig_p3: i16_at(10),
            dig_p4: i16_at(12),
            dig_p5: i16_at(14),
            dig_p6: i16_at(16),
            dig_p7: i16_at(18),
            dig_p8: i16_at(20),
            dig_p9: i16_at(22),
            dig_h1: calib_00[25],
            dig_h2: i16::from_le_bytes([h[0], h[1]]),
            dig_h3: h[2],
            // 12-bit values sharing register 0xE5
            dig_h4: ((h[3] as i8 as i16) << 4) | (h[4] & 0x0F) as i16,
            dig_h5: ((h[5] as i8 as i16) << 4) | (h[4] >> 4) as i16,
            dig_h6: h[6] as i8,
        })
    }

    /// Fine temperature shared by all three compensations.
    pub fn t_fine(&self, adc_t: u32) -> i32 {
        let adc_t = adc_t as i64;
        let t1 = self.dig_t1 as i64;
        let var1 = (((adc_t >> 3) - (t1 << 1)) * self.dig_t2 as i64) >> 11;
        let var2 = (((((adc_t >> 4) - t1) * ((adc_t >> 4) - t1)) >> 12) * self.dig_t3 as i64) >> 14;
        (var1 + var2) as i32
    }

    /// Pressure in Q24.8 pascal, or `None` when the divisor is zero.
    pub fn pressure_q24_8(&self, adc_p: u32, t_fine: i32) -> Option<i64> {
        // i128 keeps (1 << 47) * dig_p1 and p << 31 clear of overflow
        // for any coefficient set.
        let mut var1 = t_fine as i128 - 128000;
        let mut var2 = var1 * var1 * self.dig_p6 as i128;
        var2 += (var1 * self.dig_p5 as i128) << 17;
        var2 += (self.dig_p4 as i128) << 35;
        var1 = ((var1 * var1 * self.dig_p3 as i128) >> 8) + ((var1 * self.dig_p2 as i128) << 12);
        var1 = (((1i128 << 47) + var1) * self.dig_p1 as i128) >> 33;
        if var1 == 0 {
            return None;
        }
        let mut p = 1_048_576 - adc_p as i128;
        p = (((p << 31) - var2) * 3125) / var1;
        var1 = (self.dig_p9 as i128 * (p >> 13) * (p >> 13)) >> 25;
        var2 = (self.dig_p8 as i128 * p) >> 19;
        p = ((p + var1 + var2) >> 8) + ((self.dig_p7 as i128) << 4);
        Some(p as i64)
    }

    /// Humidity in Q22.10 %RH, clamped to 0..=100 %.
    pub fn humidity_q22_10(&self, adc_h: u32, t_fine: i32) -> u32 {
        let adc_h = adc_h as i64;
        let mut v = t_fine as i64 - 76800;
        v = ((((adc_h << 14) - ((self.dig_h4 as i64) << 20) - (self.dig_h5 as i64 * v)) + 16384) >> 15)
            * (((((((v * self.dig_h6 as i64) >> 10) * (((v * self.dig_h3 as i64) >> 11) + 32768)) >> 10)
                + 2097152)
                * self.dig_h2 as i64
                + 8192)
                >> 14);
        v -= ((((v >> 15) * (v >> 15)) >> 7) * self.dig_h1 as i64) >> 4;
        let v = v.clamp(0, 419_430_400);
        (v >> 12) as u32
    }
}

/// Unconverted ADC values from registers 0xF7..0xFE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawSample {
    pub pressure: u32,
    pub temperature: u32,
    pub humidity: u32,
}

impl RawSample {
    pub fn from_bytes(data: &[u8; DATA_LEN]) -> RawSample {
        let d: [u32; DATA_LEN] = data.map(u32::from);
        RawSample {
            pressure: (d[0] << 12) | (d[1] << 4) | (d[2] >> 4),
            temperature: (d[3] << 12) | (d[4] << 4) | (d[5] >> 4),
            humidity: (d[6] << 8) | d[7],
        }
    }
}

///
/// Convert one raw sample into physical units. Pure function of its
/// inputs.
///
/// A skipped channel gives an invalid reading of 0. Since pressure and
/// humidity depend on `t_fine`, a skipped temperature invalidates all
/// three. A zero divisor in the pressure polynomial gives an invalid
/// pressure of 0.
///
pub fn decode(kind: SensorKind, calibration: &Calibration, raw: &RawSample) -> Measurement {
    let measurement = Measurement::new(kind);
    if raw.temperature == SKIPPED_20BIT {
        return measurement
            .with(Quantity::Temperature, Reading::invalid(0.0))
            .with(Quantity::Humidity, Reading::invalid(0.0))
            .with(Quantity::Pressure, Reading::invalid(0.0));
    }

    let t_fine = calibration.t_fine(raw.temperature);
    let temperature = Reading::valid(t_fine as f64 / 5120.0);

    let humidity = if raw.humidity == SKIPPED_16BIT {
        Reading::invalid(0.0)
    } else {
        let h = calibration.humidity_q22_10(raw.humidity, t_fine) as f64 / 1024.0;
        Reading::valid(h.clamp(0.0, 100.0))
    };

    let pressure = if raw.pressure == SKIPPED_20BIT {
        Reading::invalid(0.0)
    } else {
        match calibration.pressure_q24_8(raw.pressure, t_fine) {
            Some(p) => Reading::valid(p as f64 / 256.0 / 100.0),
            None => Reading::invalid(0.0),
        }
    };

    measurement
        .with(Quantity::Temperature, temperature)
        .with(Quantity::Humidity, humidity)
        .with(Quantity::Pressure, pressure)
}

/// BME280 driver bound to one address on a shared bus.
pub struct Bme280 {
    bus: Arc<BusClient>,
    address: u16,
    config: Bme280Config,
    calibration: Calibration,
}

impl Bme280 {
    /// Create the driver and read the calibration block.
    ///
    /// Fails with [`SensorError::CalibrationRead`] if any calibration
    /// register cannot be read or the block is implausible; no driver
    /// exists in that case.
    pub fn new(bus: Arc<BusClient>, address: u16, config: Bme280Config) -> Result<Bme280, SensorError> {
        let calib_00 = bus
            .read_register(address, REG_CALIB_00, CALIB_00_LEN)
            .map_err(|e| SensorError::CalibrationRead(e.to_string()))?;
        let calib_26 = bus
            .read_register(address, REG_CALIB_26, CALIB_26_LEN)
            .map_err(|e| SensorError::CalibrationRead(e.to_string()))?;
        let calibration = Calibration::from_registers(&calib_00, &calib_26)?;
        debug!("bme280 {:#04x}: calibration {:?}", address, calibration);

        Ok(Bme280 {
            bus,
            address,
            config,
            calibration,
        })
    }

    pub fn address(&self) -> u16 {
        self.address
    }

    pub fn calibration(&self) -> &Calibration {
        &self.calibration
    }

    pub fn config(&self) -> &Bme280Config {
        &self.config
    }

    pub fn sensor_kind(&self) -> SensorKind {
        if self.address == SECONDARY_ADDRESS {
            SensorKind::Bme280Secondary
        } else {
            SensorKind::Bme280
        }
    }

    /// Verify the chip identification register.
    pub fn check_id(&self) -> Result<(), SensorError> {
        let id = self.bus.read_register(self.address, REG_ID, 1)?[0];
        if id != CHIP_ID {
            return Err(SensorError::UnexpectedChipId {
                expected: CHIP_ID,
                found: id,
            });
        }
        Ok(())
    }

    /// Soft reset. Configuration registers return to their defaults,
    /// calibration is untouched.
    pub fn soft_reset(&mut self) -> Result<(), SensorError> {
        self.bus.write_register(self.address, REG_RESET, &[RESET_WORD])?;
        self.bus.clock().sleep(STARTUP_TIME);
        Ok(())
    }

    ///
    /// Write the configuration registers. ctrl_hum only takes effect
    /// after a ctrl_meas write, so it goes first. In forced mode the chip
    /// is left asleep until the next `read()`.
    ///
    pub fn configure(&mut self, config: Bme280Config) -> Result<(), SensorError> {
        let resting_mode = match config.mode {
            Mode::Normal => Mode::Normal,
            Mode::Sleep | Mode::Forced => Mode::Sleep,
        };
        // config is only writable in sleep mode
        self.bus
            .write_register(self.address, REG_CTRL_MEAS, &[config.ctrl_meas(Mode::Sleep)])?;
        self.bus.write_register(self.address, REG_CONFIG, &[config.config()])?;
        self.bus.write_register(self.address, REG_CTRL_HUM, &[config.ctrl_hum()])?;
        self.bus
            .write_register(self.address, REG_CTRL_MEAS, &[config.ctrl_meas(resting_mode)])?;
        self.config = config;
        Ok(())
    }

    /// Put the chip to sleep, keeping oversampling settings.
    pub fn sleep(&mut self) -> Result<(), SensorError> {
        self.bus
            .write_register(self.address, REG_CTRL_MEAS, &[self.config.ctrl_meas(Mode::Sleep)])
    }

    fn measuring(&self) -> Result<bool, SensorError> {
        let status = self.bus.read_register(self.address, REG_STATUS, 1)?[0];
        Ok(status & STATUS_MEASURING != 0)
    }

    ///
    /// Fetch the ADC block. In forced and sleep mode a conversion is
    /// triggered and waited for first. In normal mode the chip converts
    /// continuously and the data registers are shadowed, so a burst read
    /// always returns the last complete conversion and the measuring bit
    /// is not consulted.
    ///
    pub fn read_raw(&mut self) -> Result<RawSample, SensorError> {
        if self.config.mode != Mode::Normal {
            self.bus
                .write_register(self.address, REG_CTRL_HUM, &[self.config.ctrl_hum()])?;
            self.bus.write_register(
                self.address,
                REG_CTRL_MEAS,
                &[self.config.ctrl_meas(Mode::Forced)],
            )?;
            self.bus.clock().sleep(self.config.max_measurement_time());

            let mut polls = 0;
            while self.measuring()? {
                polls += 1;
                if polls >= MAX_POLLS {
                    return Err(SensorError::MeasurementTimeout);
                }
                self.bus.clock().sleep(POLL_INTERVAL);
            }
        }

        let mut data = [0u8; DATA_LEN];
        data.copy_from_slice(&self.bus.read_register(self.address, REG_DATA, DATA_LEN)?);
        let raw = RawSample::from_bytes(&data);
        trace!("bme280 {:#04x}: raw {:?}", self.address, raw);
        Ok(raw)
    }

    pub fn read(&mut self) -> Result<Measurement, SensorError> {
        let raw = self.read_raw()?;
        Ok(decode(self.sensor_kind(), &self.calibration, &raw))
    }
}
