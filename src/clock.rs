// Copyright 2024, F. Stan
//
// Licensed under the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// This file may not be copied, modified, or distributed
// except according to those terms.

//! Monotonic time and blocking delays.
//!
//! Every settle delay and polling wait in the drivers goes through a
//! [`Clock`], so tests can swap in a [`ManualClock`] and run without
//! sleeping.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use std::thread;

/// Monotonic time source with a blocking sleep.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
    fn sleep(&self, duration: Duration);
}

/// Wall clock backed by [`Instant`] and [`thread::sleep`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        thread::sleep(duration)
    }
}

///
/// Clock that only moves when slept on or advanced explicitly.
/// The total slept time is recorded so tests can assert on delays.
///
#[derive(Debug)]
pub struct ManualClock {
    origin: Instant,
    elapsed: Mutex<Duration>,
    slept: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> ManualClock {
        ManualClock {
            origin: Instant::now(),
            elapsed: Mutex::new(Duration::ZERO),
            slept: Mutex::new(Duration::ZERO),
        }
    }

    /// Move time forward without counting it as sleep.
    pub fn advance(&self, duration: Duration) {
        *lock(&self.elapsed) += duration;
    }

    /// Total time spent in [`Clock::sleep`].
    pub fn slept(&self) -> Duration {
        *lock(&self.slept)
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        ManualClock::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + *lock(&self.elapsed)
    }

    fn sleep(&self, duration: Duration) {
        *lock(&self.elapsed) += duration;
        *lock(&self.slept) += duration;
    }
}

// A poisoned lock only means another test thread panicked mid-update;
// the Duration inside is still meaningful.
fn lock(m: &Mutex<Duration>) -> std::sync::MutexGuard<'_, Duration> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

///
/// Cloneable flag used to interrupt a blocking wait from another thread.
/// A wait that observes the flag clears it and returns early.
///
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn new() -> CancelHandle {
        CancelHandle::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Returns whether a cancel was pending and resets the flag.
    pub fn take(&self) -> bool {
        self.0.swap(false, Ordering::SeqCst)
    }
}
