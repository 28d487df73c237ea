// Copyright 2024, F. Stan
//
// Licensed under the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// This file may not be copied, modified, or distributed
// except according to those terms.

//! Shared bus access.
//!
//! [`Transport`] is the raw two-wire capability; [`LinuxI2CBus`] provides it
//! through `/dev/i2c-N`. [`BusClient`] sits on top and is what the drivers
//! talk to: it retries transient failures, keeps a minimum gap between
//! transactions to the same address and lets one transaction at a time
//! onto the bus.

use i2cdev::core::I2CDevice;
use i2cdev::linux::LinuxI2CDevice;
use log::{debug, trace, warn};
use serde::Deserialize;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::clock::{Clock, SystemClock};
use crate::error::{SensorError, TransportError};

/// Raw bus transfers addressed by 7-bit slave address.
pub trait Transport: Send {
    fn write(&mut self, address: u16, bytes: &[u8]) -> Result<(), TransportError>;
    fn read(&mut self, address: u16, buffer: &mut [u8]) -> Result<(), TransportError>;
}

///
/// Transport over a Linux i2c-dev character device. One
/// [`LinuxI2CDevice`] handle is opened per slave address on first use
/// and kept for the lifetime of the bus.
///
pub struct LinuxI2CBus {
    path: PathBuf,
    devices: HashMap<u16, LinuxI2CDevice>,
}

impl LinuxI2CBus {
    pub fn new<P: AsRef<Path>>(path: P) -> LinuxI2CBus {
        LinuxI2CBus {
            path: path.as_ref().to_path_buf(),
            devices: HashMap::new(),
        }
    }

    fn device(&mut self, address: u16) -> Result<&mut LinuxI2CDevice, TransportError> {
        match self.devices.entry(address) {
            Entry::Occupied(e) => Ok(e.into_mut()),
            Entry::Vacant(e) => {
                debug!("opening {} for device {:#04x}", self.path.display(), address);
                let device = LinuxI2CDevice::new(&self.path, address)?;
                Ok(e.insert(device))
            }
        }
    }
}

impl Transport for LinuxI2CBus {
    fn write(&mut self, address: u16, bytes: &[u8]) -> Result<(), TransportError> {
        self.device(address)?.write(bytes)?;
        Ok(())
    }

    fn read(&mut self, address: u16, buffer: &mut [u8]) -> Result<(), TransportError> {
        self.device(address)?.read(buffer)?;
        Ok(())
    }
}

/// Bus section of the configuration file.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BusConfig {
    /// i2c-dev device node
    pub device: PathBuf,
    /// Attempts per transaction, including the first one
    pub max_attempts: u32,
    /// Pause before retrying a transient failure
    pub retry_backoff_ms: u64,
    /// Minimum gap between transactions to one address unless a driver sets its own
    pub min_interval_ms: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        BusConfig {
            device: PathBuf::from("/dev/i2c-1"),
            max_attempts: 3,
            retry_backoff_ms: 2,
            min_interval_ms: 0,
        }
    }
}

struct BusState {
    transport: Box<dyn Transport>,
    last_access: HashMap<u16, Instant>,
    min_interval: HashMap<u16, Duration>,
}

///
/// Transaction layer shared by all drivers on one bus, usually held as
/// `Arc<BusClient>`. The only mutable state is the transport handle and
/// the per-address bookkeeping, both behind one mutex.
///
pub struct BusClient {
    state: Mutex<BusState>,
    clock: Arc<dyn Clock>,
    max_attempts: u32,
    retry_backoff: Duration,
    default_min_interval: Duration,
}

impl BusClient {
    pub fn new<T>(transport: T, clock: Arc<dyn Clock>, config: &BusConfig) -> BusClient
    where
        T: Transport + 'static,
    {
        BusClient {
            state: Mutex::new(BusState {
                transport: Box::new(transport),
                last_access: HashMap::new(),
                min_interval: HashMap::new(),
            }),
            clock,
            max_attempts: config.max_attempts.max(1),
            retry_backoff: Duration::from_millis(config.retry_backoff_ms),
            default_min_interval: Duration::from_millis(config.min_interval_ms),
        }
    }

    /// Bus on the configured i2c-dev node using the system clock.
    pub fn open(config: &BusConfig) -> Arc<BusClient> {
        Arc::new(BusClient::new(
            LinuxI2CBus::new(&config.device),
            Arc::new(SystemClock),
            config,
        ))
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Minimum gap enforced between consecutive transactions to `address`.
    pub fn set_min_interval(&self, address: u16, interval: Duration) {
        self.lock().min_interval.insert(address, interval);
    }

    /// Write-only transaction.
    pub fn write_only(&self, address: u16, bytes: &[u8]) -> Result<(), SensorError> {
        self.run(address, |transport| {
            trace!("{:#04x} <- {:02x?}", address, bytes);
            transport.write(address, bytes)
        })
    }

    /// Read-only transaction of `len` bytes.
    pub fn read_only(&self, address: u16, len: usize) -> Result<Vec<u8>, SensorError> {
        self.run(address, |transport| {
            let mut buffer = vec![0u8; len];
            transport.read(address, &mut buffer)?;
            trace!("{:#04x} -> {:02x?}", address, buffer);
            Ok(buffer)
        })
    }

    /// Write followed directly by a read of `len` bytes.
    pub fn transact(&self, address: u16, bytes: &[u8], len: usize) -> Result<Vec<u8>, SensorError> {
        self.transact_delayed(address, bytes, Duration::ZERO, len)
    }

    /// Write, wait `delay` for the chip to execute, then read `len` bytes.
    /// A retry repeats both phases.
    pub fn transact_delayed(
        &self,
        address: u16,
        bytes: &[u8],
        delay: Duration,
        len: usize,
    ) -> Result<Vec<u8>, SensorError> {
        self.run(address, |transport| {
            trace!("{:#04x} <- {:02x?}", address, bytes);
            transport.write(address, bytes)?;
            if !delay.is_zero() {
                self.clock.sleep(delay);
            }
            let mut buffer = vec![0u8; len];
            transport.read(address, &mut buffer)?;
            trace!("{:#04x} -> {:02x?}", address, buffer);
            Ok(buffer)
        })
    }

    /// Read `len` bytes starting at an 8-bit register address.
    pub fn read_register(&self, address: u16, register: u8, len: usize) -> Result<Vec<u8>, SensorError> {
        self.transact(address, &[register], len)
    }

    /// Write `bytes` starting at an 8-bit register address.
    pub fn write_register(&self, address: u16, register: u8, bytes: &[u8]) -> Result<(), SensorError> {
        let mut buffer = Vec::with_capacity(bytes.len() + 1);
        buffer.push(register);
        buffer.extend_from_slice(bytes);
        self.write_only(address, &buffer)
    }

    fn lock(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn run<R, F>(&self, address: u16, mut op: F) -> Result<R, SensorError>
    where
        F: FnMut(&mut dyn Transport) -> Result<R, TransportError>,
    {
        let mut state = self.lock();
        let interval = state
            .min_interval
            .get(&address)
            .copied()
            .unwrap_or(self.default_min_interval);

        let mut attempt = 1;
        loop {
            if let Some(last) = state.last_access.get(&address) {
                let ready_at = *last + interval;
                let now = self.clock.now();
                if ready_at > now {
                    self.clock.sleep(ready_at - now);
                }
            }

            let result = op(state.transport.as_mut());
            state.last_access.insert(address, self.clock.now());

            match result {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.max_attempts => {
                    warn!(
                        "device {:#04x}: {} (attempt {}/{}), retrying",
                        address, e, attempt, self.max_attempts
                    );
                    attempt += 1;
                    self.clock.sleep(self.retry_backoff);
                }
                Err(e) => {
                    debug!("device {:#04x}: giving up after {} attempt(s): {}", address, attempt, e);
                    return Err(SensorError::Bus {
                        address,
                        attempts: attempt,
                        source: e,
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::thread;

    /// Fails with the queued errors, then answers reads with 0xAA.
    struct Flaky {
        failures: VecDeque<TransportError>,
        log: Arc<Mutex<Vec<(u16, Vec<u8>)>>>,
    }

    impl Transport for Flaky {
        fn write(&mut self, address: u16, bytes: &[u8]) -> Result<(), TransportError> {
            if let Some(e) = self.failures.pop_front() {
                return Err(e);
            }
            self.log.lock().unwrap().push((address, bytes.to_vec()));
            Ok(())
        }

        fn read(&mut self, _address: u16, buffer: &mut [u8]) -> Result<(), TransportError> {
            buffer.fill(0xAA);
            Ok(())
        }
    }

    fn client(failures: Vec<TransportError>, max_attempts: u32) -> (BusClient, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let transport = Flaky {
            failures: failures.into(),
            log: Arc::new(Mutex::new(Vec::new())),
        };
        let config = BusConfig {
            max_attempts,
            ..BusConfig::default()
        };
        (BusClient::new(transport, clock.clone(), &config), clock)
    }

    #[test]
    fn retries_transient_failures() {
        let (bus, _) = client(vec![TransportError::ArbitrationLoss, TransportError::Busy], 3);
        assert_eq!(bus.read_register(0x76, 0xD0, 2).unwrap(), vec![0xAA, 0xAA]);
    }

    #[test]
    fn gives_up_after_bound() {
        let (bus, _) = client((0..3).map(|_| TransportError::Timeout).collect(), 2);
        match bus.write_only(0x62, &[0x3f, 0x86]) {
            Err(SensorError::Bus { address, attempts, .. }) => {
                assert_eq!(address, 0x62);
                assert_eq!(attempts, 2);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn nack_is_not_retried() {
        let (bus, _) = client(vec![TransportError::Nack], 5);
        match bus.write_only(0x39, &[0xA0]) {
            Err(SensorError::Bus { attempts, source, .. }) => {
                assert_eq!(attempts, 1);
                assert!(matches!(source, TransportError::Nack));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn enforces_min_interval_per_address() {
        let (bus, clock) = client(Vec::new(), 1);
        bus.set_min_interval(0x62, Duration::from_millis(5));
        bus.write_only(0x62, &[0x21, 0xb1]).unwrap();
        bus.write_only(0x76, &[0xF4, 0x00]).unwrap();
        assert_eq!(clock.slept(), Duration::ZERO);
        bus.write_only(0x62, &[0xe4, 0xb8]).unwrap();
        assert_eq!(clock.slept(), Duration::from_millis(5));
    }

    /// Counts transfers and any transfer that starts while another is
    /// still in progress.
    #[derive(Clone, Default)]
    struct Overlap {
        in_flight: Arc<AtomicBool>,
        overlaps: Arc<AtomicUsize>,
        transfers: Arc<AtomicUsize>,
    }

    impl Overlap {
        fn transfer(&self) {
            if self.in_flight.swap(true, Ordering::SeqCst) {
                self.overlaps.fetch_add(1, Ordering::SeqCst);
            }
            thread::sleep(Duration::from_micros(50));
            self.transfers.fetch_add(1, Ordering::SeqCst);
            self.in_flight.store(false, Ordering::SeqCst);
        }
    }

    impl Transport for Overlap {
        fn write(&mut self, _address: u16, _bytes: &[u8]) -> Result<(), TransportError> {
            self.transfer();
            Ok(())
        }

        fn read(&mut self, _address: u16, buffer: &mut [u8]) -> Result<(), TransportError> {
            self.transfer();
            buffer.fill(0x5A);
            Ok(())
        }
    }

    #[test]
    fn one_transaction_on_the_bus_at_a_time() {
        let transport = Overlap::default();
        let bus = Arc::new(BusClient::new(
            transport.clone(),
            Arc::new(ManualClock::new()),
            &BusConfig::default(),
        ));

        let workers: Vec<_> = (0..4u16)
            .map(|n| {
                let bus = Arc::clone(&bus);
                thread::spawn(move || {
                    for _ in 0..25 {
                        assert_eq!(bus.read_register(0x60 + n, 0xD0, 2).unwrap(), vec![0x5A, 0x5A]);
                        bus.write_register(0x60 + n, 0xF4, &[0x25]).unwrap();
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        assert_eq!(transport.overlaps.load(Ordering::SeqCst), 0);
        // register read is write plus read, register write is one write
        assert_eq!(transport.transfers.load(Ordering::SeqCst), 4 * 25 * 3);
    }

    #[test]
    fn write_register_prefixes_address() {
        let clock = Arc::new(ManualClock::new());
        let log = Arc::new(Mutex::new(Vec::new()));
        let transport = Flaky {
            failures: VecDeque::new(),
            log: log.clone(),
        };
        let bus = BusClient::new(transport, clock, &BusConfig::default());
        bus.write_register(0x76, 0xF4, &[0x25]).unwrap();
        assert_eq!(log.lock().unwrap()[0], (0x76, vec![0xF4, 0x25]));
    }
}
