// Copyright 2024, F. Stan
//
// Licensed under the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// This file may not be copied, modified, or distributed
// except according to those terms.

//! TSL2572 ambient light sensor.
//!
//! Channel 0 sees visible and infrared light, channel 1 infrared only.
//! Illuminance follows the lux equation of the TSL2572 datasheet
//! (open air, glass attenuation 1).

use log::{debug, trace, warn};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

use crate::bus::BusClient;
use crate::error::SensorError;
use crate::measurement::{Measurement, Quantity, Reading};
use crate::sensor::SensorKind;

pub const DEFAULT_ADDRESS: u16 = 0x39;

// Command bit with auto-increment addressing.
const COMMAND: u8 = 0xA0;

const REG_ENABLE: u8 = 0x00;
const REG_ATIME: u8 = 0x01;
const REG_CONFIG: u8 = 0x0D;
const REG_CONTROL: u8 = 0x0F;
const REG_ID: u8 = 0x12;
const REG_STATUS: u8 = 0x13;
const REG_C0DATA: u8 = 0x14;

const ENABLE_PON: u8 = 0x01;
const ENABLE_AEN: u8 = 0x02;
const CONFIG_AGL: u8 = 0x04;
const STATUS_AVALID: u8 = 0x01;

/// TSL25721 (3.3 V) and TSL25723 (1.8 V).
const CHIP_IDS: [u8; 2] = [0x34, 0x3D];

const CYCLE_TIME_US: u64 = 2730;
const MAX_CYCLES: u16 = 256;
const POWER_ON_DELAY: Duration = Duration::from_micros(2400);
const POLL_INTERVAL: Duration = Duration::from_millis(10);
const MAX_POLLS: u32 = 20;

// Lux equation coefficients.
const DEVICE_FACTOR: f64 = 60.0;
const COEF_B: f64 = 1.87;
const COEF_C: f64 = 0.63;

// Auto-ranging probe and the fraction of full scale treated as "near".
const PROBE_CYCLES: u16 = 4;
const RANGE_MARGIN: f64 = 0.8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Gain {
    X0_16,
    X1,
    X8,
    X16,
    X120,
}

impl Gain {
    pub fn factor(self) -> f64 {
        match self {
            Gain::X0_16 => 0.16,
            Gain::X1 => 1.0,
            Gain::X8 => 8.0,
            Gain::X16 => 16.0,
            Gain::X120 => 120.0,
        }
    }

    /// AGAIN field of the control register.
    fn again(self) -> u8 {
        match self {
            Gain::X0_16 | Gain::X1 => 0,
            Gain::X8 => 1,
            Gain::X16 => 2,
            Gain::X120 => 3,
        }
    }

    /// 0.16x is 1x with the AGL bit set.
    fn config(self) -> u8 {
        match self {
            Gain::X0_16 => CONFIG_AGL,
            _ => 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Tsl2572Config {
    pub gain: Gain,
    /// Integration cycles of 2.73 ms, 1..=256
    pub integration_cycles: u16,
    /// Pick gain and integration per measurement from a short probe
    pub auto_range: bool,
}

impl Default for Tsl2572Config {
    fn default() -> Self {
        Tsl2572Config {
            gain: Gain::X1,
            integration_cycles: 64,
            auto_range: true,
        }
    }
}

impl Tsl2572Config {
    pub fn validate(&self) -> Result<(), SensorError> {
        check_cycles(self.integration_cycles)
    }
}

fn check_cycles(cycles: u16) -> Result<(), SensorError> {
    if cycles == 0 || cycles > MAX_CYCLES {
        return Err(SensorError::InvalidConfig(format!(
            "tsl2572 integration_cycles {} outside 1..={}",
            cycles, MAX_CYCLES
        )));
    }
    Ok(())
}

pub fn integration_time(cycles: u16) -> Duration {
    Duration::from_micros(CYCLE_TIME_US * cycles as u64)
}

/// Highest count either channel can reach for the integration length.
pub fn saturation_limit(cycles: u16) -> u16 {
    (1024 * cycles as u32).min(u16::MAX as u32) as u16
}

/// Channel counts read from C0DATA..C1DATAH.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawSample {
    pub ch0: u16,
    pub ch1: u16,
}

impl RawSample {
    pub fn from_bytes(data: &[u8; 4]) -> RawSample {
        RawSample {
            ch0: u16::from_le_bytes([data[0], data[1]]),
            ch1: u16::from_le_bytes([data[2], data[3]]),
        }
    }
}

///
/// Illuminance in lux for counts taken at `gain` over `cycles`.
///
/// The two linear segments of the lux equation are evaluated and the
/// larger one (never below zero) wins. A channel at the top of its range
/// is a [`SensorError::Saturation`], not a number.
///
pub fn lux(raw: &RawSample, gain: Gain, cycles: u16) -> Result<f64, SensorError> {
    let limit = saturation_limit(cycles);
    if raw.ch0 >= limit || raw.ch1 >= limit {
        return Err(SensorError::Saturation {
            ch0: raw.ch0,
            ch1: raw.ch1,
            limit,
        });
    }
    if raw.ch0 == 0 && raw.ch1 == 0 {
        return Ok(0.0);
    }

    let atime_ms = CYCLE_TIME_US as f64 * cycles as f64 / 1000.0;
    let cpl = atime_ms * gain.factor() / DEVICE_FACTOR;
    let c0 = raw.ch0 as f64;
    let c1 = raw.ch1 as f64;
    let lux1 = (c0 - COEF_B * c1) / cpl;
    let lux2 = (COEF_C * c0 - c1) / cpl;
    Ok(lux1.max(lux2).max(0.0))
}

/// Integration settings for the real measurement given the larger
/// channel count of a 4-cycle, 1x probe.
pub fn auto_range_settings(probe_max: u16) -> (u16, Gain) {
    let probe_max = probe_max as f64;
    if probe_max < 8.53 * RANGE_MARGIN {
        (256, Gain::X120)
    } else if probe_max < 128.0 * RANGE_MARGIN {
        (128, Gain::X16)
    } else if probe_max < 512.0 * RANGE_MARGIN {
        (64, Gain::X8)
    } else if probe_max < 4096.0 * RANGE_MARGIN {
        (64, Gain::X1)
    } else {
        (64, Gain::X0_16)
    }
}

/// TSL2572 driver on a shared bus.
pub struct Tsl2572 {
    bus: Arc<BusClient>,
    address: u16,
    config: Tsl2572Config,
}

impl Tsl2572 {
    pub fn new(bus: Arc<BusClient>, config: Tsl2572Config) -> Result<Tsl2572, SensorError> {
        config.validate()?;
        Ok(Tsl2572 {
            bus,
            address: DEFAULT_ADDRESS,
            config,
        })
    }

    pub fn config(&self) -> &Tsl2572Config {
        &self.config
    }

    /// Replace gain/integration settings; applied from the next measurement.
    pub fn configure(&mut self, config: Tsl2572Config) -> Result<(), SensorError> {
        config.validate()?;
        self.config = config;
        Ok(())
    }

    fn write(&self, register: u8, value: u8) -> Result<(), SensorError> {
        self.bus.write_register(self.address, COMMAND | register, &[value])
    }

    fn read_bytes(&self, register: u8, len: usize) -> Result<Vec<u8>, SensorError> {
        self.bus.read_register(self.address, COMMAND | register, len)
    }

    pub fn check_id(&self) -> Result<(), SensorError> {
        let id = self.read_bytes(REG_ID, 1)?[0];
        if !CHIP_IDS.contains(&id) {
            return Err(SensorError::UnexpectedChipId {
                expected: CHIP_IDS[0],
                found: id,
            });
        }
        Ok(())
    }

    pub fn power_down(&self) -> Result<(), SensorError> {
        self.write(REG_ENABLE, 0)
    }

    // Power on, program gain and integration, enable the ADC and wait
    // for AVALID.
    fn run_integration(&self, gain: Gain, cycles: u16) -> Result<(), SensorError> {
        self.write(REG_ENABLE, ENABLE_PON)?;
        self.write(REG_ATIME, (MAX_CYCLES - cycles) as u8)?;
        self.write(REG_CONFIG, gain.config())?;
        self.write(REG_CONTROL, gain.again())?;
        self.write(REG_ENABLE, ENABLE_PON | ENABLE_AEN)?;

        let clock = self.bus.clock();
        clock.sleep(POWER_ON_DELAY + integration_time(cycles));

        let mut polls = 0;
        loop {
            let status = self.read_bytes(REG_STATUS, 1)?[0];
            if status & STATUS_AVALID != 0 {
                return Ok(());
            }
            polls += 1;
            if polls >= MAX_POLLS {
                return Err(SensorError::MeasurementTimeout);
            }
            clock.sleep(POLL_INTERVAL);
        }
    }

    ///
    /// Run one ALS integration and return the raw channel counts.
    /// The device is powered down again afterwards, whether the
    /// integration succeeded, timed out or failed on the bus.
    ///
    pub fn integrate(&mut self, gain: Gain, cycles: u16) -> Result<RawSample, SensorError> {
        check_cycles(cycles)?;
        debug!("tsl2572: integrating {} cycles at {:?}", cycles, gain);

        let integrated = self.run_integration(gain, cycles);
        if let Err(e) = self.power_down() {
            if integrated.is_ok() {
                return Err(e);
            }
            warn!("tsl2572: power down after failed integration: {}", e);
        }
        integrated?;

        let mut data = [0u8; 4];
        data.copy_from_slice(&self.read_bytes(REG_C0DATA, 4)?);
        let raw = RawSample::from_bytes(&data);
        trace!("tsl2572: raw {:?}", raw);
        Ok(raw)
    }

    /// Illuminance with the configured gain and integration.
    pub fn read_fixed(&mut self) -> Result<f64, SensorError> {
        let Tsl2572Config {
            gain,
            integration_cycles,
            ..
        } = self.config;
        let raw = self.integrate(gain, integration_cycles)?;
        lux(&raw, gain, integration_cycles).inspect_err(|e| warn!("tsl2572: {}", e))
    }

    /// Illuminance with gain and integration picked from a short probe.
    pub fn read_auto(&mut self) -> Result<f64, SensorError> {
        let probe = self.integrate(Gain::X1, PROBE_CYCLES)?;
        let (cycles, gain) = auto_range_settings(probe.ch0.max(probe.ch1));
        let raw = self.integrate(gain, cycles)?;
        lux(&raw, gain, cycles).inspect_err(|e| warn!("tsl2572: {}", e))
    }

    pub fn read(&mut self) -> Result<Measurement, SensorError> {
        let lux = if self.config.auto_range {
            self.read_auto()?
        } else {
            self.read_fixed()?
        };
        Ok(Measurement::new(SensorKind::Tsl2572).with(Quantity::Illuminance, Reading::valid(lux)))
    }
}
