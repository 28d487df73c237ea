// Copyright 2024, F. Stan
//
// Licensed under the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// This file may not be copied, modified, or distributed
// except according to those terms.

//! Uniform access to every supported chip.

use log::{debug, info};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::bme280::{self, Bme280};
use crate::bus::BusClient;
use crate::config::Config;
use crate::error::SensorError;
use crate::measurement::Measurement;
use crate::scd41::{self, Scd41};
use crate::tsl2572::{self, Tsl2572};

///
/// Lifecycle shared by all drivers. `init` brings the chip into a
/// measuring configuration, `read` blocks until one measurement is
/// decoded and `close` leaves the chip idle.
///
pub trait Sensor: Send {
    fn kind(&self) -> SensorKind;
    fn init(&mut self) -> Result<(), SensorError>;
    fn read(&mut self) -> Result<Measurement, SensorError>;
    fn close(&mut self) -> Result<(), SensorError>;
}

/// Sensors selectable by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SensorKind {
    /// BME280 at 0x76
    Bme280,
    /// BME280 at 0x77
    Bme280Secondary,
    Tsl2572,
    Scd41,
}

impl SensorKind {
    pub const ALL: [SensorKind; 4] = [
        SensorKind::Bme280,
        SensorKind::Bme280Secondary,
        SensorKind::Tsl2572,
        SensorKind::Scd41,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            SensorKind::Bme280 => "bme280",
            SensorKind::Bme280Secondary => "bme280-2",
            SensorKind::Tsl2572 => "tsl2572",
            SensorKind::Scd41 => "scd41",
        }
    }

    pub fn address(&self) -> u16 {
        match self {
            SensorKind::Bme280 => bme280::DEFAULT_ADDRESS,
            SensorKind::Bme280Secondary => bme280::SECONDARY_ADDRESS,
            SensorKind::Tsl2572 => tsl2572::DEFAULT_ADDRESS,
            SensorKind::Scd41 => scd41::DEFAULT_ADDRESS,
        }
    }
}

impl fmt::Display for SensorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for SensorKind {
    type Err = SensorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim().to_ascii_lowercase();
        SensorKind::ALL
            .into_iter()
            .find(|kind| kind.name() == name)
            .ok_or_else(|| SensorError::UnknownSensor(s.to_string()))
    }
}

impl Sensor for Bme280 {
    fn kind(&self) -> SensorKind {
        self.sensor_kind()
    }

    fn init(&mut self) -> Result<(), SensorError> {
        self.check_id()?;
        let config = *self.config();
        self.configure(config)
    }

    fn read(&mut self) -> Result<Measurement, SensorError> {
        Bme280::read(self)
    }

    fn close(&mut self) -> Result<(), SensorError> {
        self.sleep()
    }
}

impl Sensor for Tsl2572 {
    fn kind(&self) -> SensorKind {
        SensorKind::Tsl2572
    }

    fn init(&mut self) -> Result<(), SensorError> {
        self.check_id()?;
        self.power_down()
    }

    fn read(&mut self) -> Result<Measurement, SensorError> {
        Tsl2572::read(self)
    }

    fn close(&mut self) -> Result<(), SensorError> {
        self.power_down()
    }
}

impl Sensor for Scd41 {
    fn kind(&self) -> SensorKind {
        SensorKind::Scd41
    }

    fn init(&mut self) -> Result<(), SensorError> {
        self.wake_up()?;
        self.stop_periodic_measurement()?;
        let config = *self.config();
        self.configure(config)?;
        self.start_configured()
    }

    fn read(&mut self) -> Result<Measurement, SensorError> {
        let timeout = self.config().read_timeout();
        self.wait_for_measurement(timeout)
    }

    fn close(&mut self) -> Result<(), SensorError> {
        self.stop_periodic_measurement()
    }
}

/// Construct the driver for `kind`. Only the BME280 touches the bus here,
/// to read its calibration block.
pub fn open_kind(kind: SensorKind, bus: Arc<BusClient>, config: &Config) -> Result<Box<dyn Sensor>, SensorError> {
    let sensor: Box<dyn Sensor> = match kind {
        SensorKind::Bme280 | SensorKind::Bme280Secondary => {
            Box::new(Bme280::new(bus, kind.address(), config.bme280)?)
        }
        SensorKind::Tsl2572 => Box::new(Tsl2572::new(bus, config.tsl2572)?),
        SensorKind::Scd41 => Box::new(Scd41::new(bus, config.scd41)),
    };
    Ok(sensor)
}

/// Construct a driver from its name (`bme280`, `bme280-2`, `tsl2572`, `scd41`).
pub fn open_sensor(name: &str, bus: Arc<BusClient>, config: &Config) -> Result<Box<dyn Sensor>, SensorError> {
    let kind: SensorKind = name.parse()?;
    open_kind(kind, bus, config)
}

/// Probe every known sensor and return the ones that construct and
/// initialize, in [`SensorKind::ALL`] order.
pub fn discover(bus: &Arc<BusClient>, config: &Config) -> Vec<Box<dyn Sensor>> {
    let mut found = Vec::new();
    for kind in SensorKind::ALL {
        let sensor = open_kind(kind, Arc::clone(bus), config).and_then(|mut sensor| {
            sensor.init()?;
            Ok(sensor)
        });
        match sensor {
            Ok(sensor) => {
                info!("found {} at {:#04x}", kind, kind.address());
                found.push(sensor);
            }
            Err(e) => debug!("{} not available: {}", kind, e),
        }
    }
    found
}
