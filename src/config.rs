// Copyright 2024, F. Stan
//
// Licensed under the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// This file may not be copied, modified, or distributed
// except according to those terms.

//! TOML configuration for the bus and each sensor. Every table and key
//! is optional.
//!
//! ```toml
//! [bus]
//! device = "/dev/i2c-1"
//! max_attempts = 3
//!
//! [bme280]
//! mode = "normal"
//! standby = "ms1000"
//!
//! [tsl2572]
//! gain = "x16"
//! integration_cycles = 128
//! auto_range = false
//!
//! [scd41]
//! mode = "low_power"
//! temperature_offset = 4.0
//! ```

use serde::Deserialize;
use std::fs;
use std::path::Path;

use crate::bme280::Bme280Config;
use crate::bus::BusConfig;
use crate::error::SensorError;
use crate::scd41::Scd41Config;
use crate::tsl2572::Tsl2572Config;

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub bus: BusConfig,
    pub bme280: Bme280Config,
    pub tsl2572: Tsl2572Config,
    pub scd41: Scd41Config,
}

impl Config {
    pub fn from_toml_str(text: &str) -> Result<Config, SensorError> {
        let config: Config = toml::from_str(text).map_err(|e| SensorError::Config(e.to_string()))?;
        config.tsl2572.validate()?;
        Ok(config)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Config, SensorError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .map_err(|e| SensorError::Config(format!("{}: {}", path.display(), e)))?;
        Config::from_toml_str(&text)
    }
}
