// Copyright 2024, F. Stan
//
// Licensed under the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// This file may not be copied, modified, or distributed
// except according to those terms.

//! In-memory bus with register-file chips and a scripted SCD41.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use envsensor_i2c::scd41::{self, Scd41};
use envsensor_i2c::{BusClient, BusConfig, ManualClock, Transport, TransportError};

pub const BME280_CALIB_00: [u8; 26] = [
    112, 107, 67, 103, 24, 252, 125, 142, 67, 214, 208, 11, 39, 11, 140, 0, 249, 255, 140, 60, 248,
    198, 112, 23, 0, 75,
];
pub const BME280_CALIB_26: [u8; 7] = [106, 1, 0, 19, 41, 3, 30];
pub const BME280_ADC: [u8; 8] = [101, 90, 192, 126, 237, 0, 117, 48];

/// Chip with a flat 256 byte register space and an auto-incrementing
/// pointer set by the first written byte.
pub struct RegisterFile {
    pub memory: [u8; 256],
    pointer: u8,
    // bits of the first byte that select the register
    mask: u8,
}

impl RegisterFile {
    pub fn new() -> RegisterFile {
        RegisterFile {
            memory: [0; 256],
            pointer: 0,
            mask: 0xFF,
        }
    }

    pub fn with_mask(mask: u8) -> RegisterFile {
        RegisterFile {
            mask,
            ..RegisterFile::new()
        }
    }

    pub fn load(&mut self, register: u8, bytes: &[u8]) {
        let start = register as usize;
        self.memory[start..start + bytes.len()].copy_from_slice(bytes);
    }

    fn write(&mut self, bytes: &[u8]) {
        if let Some((first, rest)) = bytes.split_first() {
            self.pointer = first & self.mask;
            for b in rest {
                self.memory[self.pointer as usize] = *b;
                self.pointer = self.pointer.wrapping_add(1);
            }
        }
    }

    fn read(&mut self, buffer: &mut [u8]) {
        for b in buffer.iter_mut() {
            *b = self.memory[self.pointer as usize];
            self.pointer = self.pointer.wrapping_add(1);
        }
    }
}

/// SCD41 command responder. Replies are framed with the real CRC.
pub struct FakeScd41 {
    pub data_ready: bool,
    pub sample: [u16; 3],
    pub corrupt_crc: bool,
    /// Command the chip refuses to acknowledge
    pub nack_opcode: Option<u16>,
    pub commands: Vec<u16>,
    reply: Vec<u8>,
}

impl FakeScd41 {
    pub fn new() -> FakeScd41 {
        FakeScd41 {
            data_ready: false,
            // 500 ppm, 25.0 °C, 37.0 %RH
            sample: [500, 0x6667, 0x5EB9],
            corrupt_crc: false,
            nack_opcode: None,
            commands: Vec::new(),
            reply: Vec::new(),
        }
    }

    fn frame(&self, words: &[u16]) -> Vec<u8> {
        let mut out = Vec::new();
        for word in words {
            let [msb, lsb] = word.to_be_bytes();
            let mut crc = Scd41::crc8(&[msb, lsb]);
            if self.corrupt_crc {
                crc ^= 0x01;
            }
            out.extend_from_slice(&[msb, lsb, crc]);
        }
        out
    }

    fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let opcode = u16::from_be_bytes([bytes[0], bytes[1]]);
        self.commands.push(opcode);
        if self.nack_opcode == Some(opcode) {
            return Err(TransportError::Nack);
        }
        self.reply = match opcode {
            // wake_up is never acknowledged
            0x36F6 => return Err(TransportError::Nack),
            0xE4B8 => self.frame(&[if self.data_ready { 0x0006 } else { 0x8000 }]),
            0xEC05 => {
                self.data_ready = false;
                self.frame(&self.sample)
            }
            0x3682 => self.frame(&[0xF896, 0x9F07, 0x3BB3]),
            0x2322 => self.frame(&[350]),
            0x2313 => self.frame(&[1]),
            _ => Vec::new(),
        };
        Ok(())
    }

    fn read(&mut self, buffer: &mut [u8]) {
        buffer.fill(0);
        let n = buffer.len().min(self.reply.len());
        buffer[..n].copy_from_slice(&self.reply[..n]);
    }
}

#[derive(Default)]
pub struct FakeState {
    pub chips: HashMap<u16, RegisterFile>,
    pub scd41: Option<FakeScd41>,
    /// Errors returned by the next transfers, one per transfer
    pub failures: VecDeque<TransportError>,
    /// (address, first written byte) pairs that are not acknowledged
    pub nack_writes: Vec<(u16, u8)>,
    pub writes: Vec<(u16, Vec<u8>)>,
}

#[derive(Clone, Default)]
pub struct FakeBus(Arc<Mutex<FakeState>>);

impl FakeBus {
    pub fn new() -> FakeBus {
        FakeBus::default()
    }

    pub fn state(&self) -> MutexGuard<'_, FakeState> {
        self.0.lock().unwrap()
    }

    pub fn add_bme280(&self, address: u16) {
        let mut chip = RegisterFile::new();
        chip.load(0x88, &BME280_CALIB_00);
        chip.load(0xE1, &BME280_CALIB_26);
        chip.load(0xD0, &[0x60]);
        chip.load(0xF7, &BME280_ADC);
        self.state().chips.insert(address, chip);
    }

    pub fn add_tsl2572(&self, ch0: u16, ch1: u16) {
        let mut chip = RegisterFile::with_mask(0x1F);
        chip.load(0x12, &[0x34]);
        chip.load(0x13, &[0x01]);
        let [c0l, c0h] = ch0.to_le_bytes();
        let [c1l, c1h] = ch1.to_le_bytes();
        chip.load(0x14, &[c0l, c0h, c1l, c1h]);
        self.state().chips.insert(0x39, chip);
    }

    pub fn add_scd41(&self) {
        self.state().scd41 = Some(FakeScd41::new());
    }

    pub fn fail_next(&self, errors: impl IntoIterator<Item = TransportError>) {
        self.state().failures.extend(errors);
    }

    pub fn writes_to(&self, address: u16) -> Vec<Vec<u8>> {
        self.state()
            .writes
            .iter()
            .filter(|(a, _)| *a == address)
            .map(|(_, bytes)| bytes.clone())
            .collect()
    }
}

impl Transport for FakeBus {
    fn write(&mut self, address: u16, bytes: &[u8]) -> Result<(), TransportError> {
        let mut state = self.state();
        if let Some(e) = state.failures.pop_front() {
            return Err(e);
        }
        state.writes.push((address, bytes.to_vec()));
        if let Some(first) = bytes.first() {
            if state.nack_writes.contains(&(address, *first)) {
                return Err(TransportError::Nack);
            }
        }
        if address == scd41::DEFAULT_ADDRESS {
            if let Some(chip) = state.scd41.as_mut() {
                return chip.write(bytes);
            }
        }
        match state.chips.get_mut(&address) {
            Some(chip) => {
                chip.write(bytes);
                Ok(())
            }
            None => Err(TransportError::Nack),
        }
    }

    fn read(&mut self, address: u16, buffer: &mut [u8]) -> Result<(), TransportError> {
        let mut state = self.state();
        if let Some(e) = state.failures.pop_front() {
            return Err(e);
        }
        if address == scd41::DEFAULT_ADDRESS {
            if let Some(chip) = state.scd41.as_mut() {
                chip.read(buffer);
                return Ok(());
            }
        }
        match state.chips.get_mut(&address) {
            Some(chip) => {
                chip.read(buffer);
                Ok(())
            }
            None => Err(TransportError::Nack),
        }
    }
}

pub fn client(fake: &FakeBus) -> (Arc<BusClient>, Arc<ManualClock>) {
    client_with(fake, BusConfig::default())
}

pub fn client_with(fake: &FakeBus, config: BusConfig) -> (Arc<BusClient>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new());
    let bus = BusClient::new(fake.clone(), clock.clone(), &config);
    (Arc::new(bus), clock)
}
