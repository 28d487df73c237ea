// Copyright 2024, F. Stan
//
// Licensed under the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// This file may not be copied, modified, or distributed
// except according to those terms.

use std::fmt;

use crate::sensor::SensorKind;

/// Physical quantity carried by a [`Reading`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Quantity {
    /// Degrees Celsius
    Temperature,
    /// Percent relative humidity
    Humidity,
    /// Hectopascal
    Pressure,
    /// Lux
    Illuminance,
    /// Parts per million
    Co2,
}

impl Quantity {
    pub fn unit(&self) -> &'static str {
        match self {
            Quantity::Temperature => "°C",
            Quantity::Humidity => "%RH",
            Quantity::Pressure => "hPa",
            Quantity::Illuminance => "lx",
            Quantity::Co2 => "ppm",
        }
    }
}

/// One decoded value. `valid` is false for documented edge outputs
/// such as a disabled BME280 channel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    pub value: f64,
    pub valid: bool,
}

impl Reading {
    pub fn valid(value: f64) -> Reading {
        Reading { value, valid: true }
    }

    pub fn invalid(value: f64) -> Reading {
        Reading { value, valid: false }
    }
}

///
/// Result of one `read()` on any sensor. Only the quantities the chip
/// measures are present.
///
#[derive(Debug, Clone, PartialEq)]
pub struct Measurement {
    sensor: SensorKind,
    readings: Vec<(Quantity, Reading)>,
}

impl Measurement {
    pub fn new(sensor: SensorKind) -> Measurement {
        Measurement {
            sensor,
            readings: Vec::with_capacity(3),
        }
    }

    pub(crate) fn with(mut self, quantity: Quantity, reading: Reading) -> Measurement {
        self.readings.push((quantity, reading));
        self
    }

    pub fn sensor(&self) -> SensorKind {
        self.sensor
    }

    pub fn get(&self, quantity: Quantity) -> Option<Reading> {
        self.readings
            .iter()
            .find(|(q, _)| *q == quantity)
            .map(|(_, r)| *r)
    }

    pub fn temperature(&self) -> Option<Reading> {
        self.get(Quantity::Temperature)
    }

    pub fn humidity(&self) -> Option<Reading> {
        self.get(Quantity::Humidity)
    }

    pub fn pressure(&self) -> Option<Reading> {
        self.get(Quantity::Pressure)
    }

    pub fn illuminance(&self) -> Option<Reading> {
        self.get(Quantity::Illuminance)
    }

    pub fn co2(&self) -> Option<Reading> {
        self.get(Quantity::Co2)
    }

    /// True when every reading passed.
    pub fn is_valid(&self) -> bool {
        self.readings.iter().all(|(_, r)| r.valid)
    }

    pub fn iter(&self) -> impl Iterator<Item = &(Quantity, Reading)> {
        self.readings.iter()
    }
}

impl fmt::Display for Measurement {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.sensor.name())?;
        for (quantity, reading) in &self.readings {
            write!(f, " {:?}: {:.1} {}", quantity, reading.value, quantity.unit())?;
            if !reading.valid {
                write!(f, " (invalid)")?;
            }
        }
        Ok(())
    }
}
