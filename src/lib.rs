// Copyright 2024, F. Stan
//
// Licensed under the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// This file may not be copied, modified, or distributed
// except according to those terms.

//! Drivers for the BME280 (temperature, humidity, pressure), TSL2572
//! (ambient light) and SCD41 (CO2) sensors on a Linux I2C bus.
//!
//! All drivers share one [`BusClient`], which serializes transactions,
//! retries transient bus errors and spaces out commands to slow chips.
//! Time is taken from a [`Clock`] so everything can run against
//! [`ManualClock`] in tests.
//!
//! ## Basic Example
//!
//! Reading every sensor that answers on `/dev/i2c-1`
//!
//!```no_run
//!use envsensor_i2c::{discover, BusClient, Config};
//!use std::thread;
//!use std::time::Duration;
//!
//!fn main() {
//!    let config = Config::default();
//!    let bus = BusClient::open(&config.bus);
//!    let mut sensors = discover(&bus, &config);
//!
//!    loop {
//!        for sensor in sensors.iter_mut() {
//!            match sensor.read() {
//!                Ok(measurement) => println!("{}", measurement),
//!                Err(e) => println!("{}: {}", sensor.kind(), e),
//!            }
//!        }
//!        thread::sleep(Duration::from_secs(5));
//!    }
//!}
//!```
//!

pub mod bme280;
pub mod bus;
pub mod clock;
pub mod config;
pub mod error;
pub mod measurement;
pub mod scd41;
pub mod sensor;
pub mod tsl2572;

pub use bme280::{Bme280, Bme280Config};
pub use bus::{BusClient, BusConfig, LinuxI2CBus, Transport};
pub use clock::{CancelHandle, Clock, ManualClock, SystemClock};
pub use config::Config;
pub use error::{SensorError, TransportError};
pub use measurement::{Measurement, Quantity, Reading};
pub use scd41::{Scd41, Scd41Config};
pub use sensor::{discover, open_sensor, Sensor, SensorKind};
pub use tsl2572::{Tsl2572, Tsl2572Config};
