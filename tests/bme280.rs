// Copyright 2024, F. Stan
//
// Licensed under the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// This file may not be copied, modified, or distributed
// except according to those terms.

mod common;

use common::{client, client_with, FakeBus};
use envsensor_i2c::bme280::{self, Bme280, Bme280Config, Mode};
use std::time::Duration;
use envsensor_i2c::{BusConfig, Sensor, SensorError, SensorKind, TransportError};

#[test]
fn forced_read_end_to_end() -> anyhow::Result<()> {
    let fake = FakeBus::new();
    fake.add_bme280(bme280::DEFAULT_ADDRESS);
    let (bus, _) = client(&fake);

    let mut sensor = Bme280::new(bus, bme280::DEFAULT_ADDRESS, Bme280Config::default())?;
    sensor.init()?;
    let m = sensor.read()?;

    assert_eq!(m.sensor(), SensorKind::Bme280);
    assert!(m.is_valid());
    assert!((m.temperature().unwrap().value - 25.08).abs() < 1e-2);
    assert!((m.pressure().unwrap().value - 1006.53).abs() < 1e-2);
    assert!((m.humidity().unwrap().value - 54.997).abs() < 1e-2);

    // ctrl_hum is written before the forced-mode ctrl_meas
    let writes = fake.writes_to(bme280::DEFAULT_ADDRESS);
    let forced = writes.iter().rposition(|w| w == &[0xF4, 0b1011_0101]).unwrap();
    assert_eq!(writes[forced - 1], vec![0xF2, 0b101]);
    Ok(())
}

#[test]
fn secondary_address_reports_its_kind() -> anyhow::Result<()> {
    let fake = FakeBus::new();
    fake.add_bme280(bme280::SECONDARY_ADDRESS);
    let (bus, _) = client(&fake);

    let mut sensor = Bme280::new(bus, bme280::SECONDARY_ADDRESS, Bme280Config::default())?;
    assert_eq!(Sensor::kind(&sensor), SensorKind::Bme280Secondary);
    assert_eq!(sensor.read()?.sensor(), SensorKind::Bme280Secondary);
    Ok(())
}

#[test]
fn blank_calibration_prevents_construction() {
    let fake = FakeBus::new();
    fake.add_bme280(bme280::DEFAULT_ADDRESS);
    fake.state()
        .chips
        .get_mut(&bme280::DEFAULT_ADDRESS)
        .unwrap()
        .load(0x88, &[0u8; 26]);
    let (bus, _) = client(&fake);

    assert!(matches!(
        Bme280::new(bus, bme280::DEFAULT_ADDRESS, Bme280Config::default()),
        Err(SensorError::CalibrationRead(_))
    ));
}

#[test]
fn absent_chip_is_a_calibration_error() {
    let fake = FakeBus::new();
    let (bus, _) = client(&fake);
    assert!(matches!(
        Bme280::new(bus, bme280::DEFAULT_ADDRESS, Bme280Config::default()),
        Err(SensorError::CalibrationRead(_))
    ));
}

#[test]
fn wrong_chip_id() -> anyhow::Result<()> {
    let fake = FakeBus::new();
    fake.add_bme280(bme280::DEFAULT_ADDRESS);
    fake.state()
        .chips
        .get_mut(&bme280::DEFAULT_ADDRESS)
        .unwrap()
        .load(0xD0, &[0x58]);
    let (bus, _) = client(&fake);

    let mut sensor = Bme280::new(bus, bme280::DEFAULT_ADDRESS, Bme280Config::default())?;
    match sensor.init() {
        Err(SensorError::UnexpectedChipId { expected, found }) => {
            assert_eq!(expected, 0x60);
            assert_eq!(found, 0x58);
        }
        other => panic!("unexpected {:?}", other),
    }
    Ok(())
}

#[test]
fn conversion_that_never_finishes_times_out() -> anyhow::Result<()> {
    let fake = FakeBus::new();
    fake.add_bme280(bme280::DEFAULT_ADDRESS);
    fake.state()
        .chips
        .get_mut(&bme280::DEFAULT_ADDRESS)
        .unwrap()
        .load(0xF3, &[0x08]);
    let (bus, _) = client(&fake);

    let mut sensor = Bme280::new(bus, bme280::DEFAULT_ADDRESS, Bme280Config::default())?;
    assert!(matches!(sensor.read(), Err(SensorError::MeasurementTimeout)));
    Ok(())
}

#[test]
fn normal_mode_reads_while_converting() -> anyhow::Result<()> {
    let fake = FakeBus::new();
    fake.add_bme280(bme280::DEFAULT_ADDRESS);
    // a continuously converting chip has the measuring bit set almost always
    fake.state()
        .chips
        .get_mut(&bme280::DEFAULT_ADDRESS)
        .unwrap()
        .load(0xF3, &[0x08]);
    let (bus, clock) = client(&fake);
    let config = Bme280Config {
        mode: Mode::Normal,
        ..Bme280Config::default()
    };

    let mut sensor = Bme280::new(bus, bme280::DEFAULT_ADDRESS, config)?;
    sensor.init()?;
    for _ in 0..20 {
        clock.advance(Duration::from_millis(37));
        let m = sensor.read()?;
        assert!((m.temperature().unwrap().value - 25.08).abs() < 1e-2);
    }

    let writes = fake.writes_to(bme280::DEFAULT_ADDRESS);
    assert!(!writes.iter().any(|w| w == &[0xF4, 0b1011_0101]));
    assert!(!writes.iter().any(|w| w == &[0xF3]));
    assert_eq!(clock.slept(), Duration::ZERO);
    Ok(())
}

#[test]
fn transient_errors_within_the_bound_are_absorbed() -> anyhow::Result<()> {
    let fake = FakeBus::new();
    fake.add_bme280(bme280::DEFAULT_ADDRESS);
    let config = BusConfig {
        max_attempts: 3,
        ..BusConfig::default()
    };
    let (bus, _) = client_with(&fake, config);
    let sensor = Bme280::new(bus, bme280::DEFAULT_ADDRESS, Bme280Config::default())?;

    fake.fail_next([TransportError::Busy, TransportError::ArbitrationLoss]);
    sensor.check_id()?;

    fake.fail_next((0..3).map(|_| TransportError::Timeout));
    match sensor.check_id() {
        Err(SensorError::Bus { address, attempts, source }) => {
            assert_eq!(address, bme280::DEFAULT_ADDRESS);
            assert_eq!(attempts, 3);
            assert!(matches!(source, TransportError::Timeout));
        }
        other => panic!("unexpected {:?}", other),
    }
    assert!(fake.state().failures.is_empty());
    Ok(())
}
