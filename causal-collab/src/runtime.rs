//! Injected time and randomness.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use uuid::Uuid;

/// Wall-clock time in milliseconds since the Unix epoch.
pub trait Clock: Send + Sync {
    fn now(&self) -> u64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start: u64) -> Self {
        Self {
            now: AtomicU64::new(start),
        }
    }

    pub fn set(&self, now: u64) {
        self.now.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, millis: u64) {
        self.now.fetch_add(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Uniform choice of an index in `0..len`. Never called with `len == 0`.
pub trait RandomSource: Send + Sync {
    fn pick(&self, len: usize) -> usize;
}

/// Draws from v4 uuids, which come from the OS random source.
#[derive(Debug, Default, Clone, Copy)]
pub struct UuidRandom;

impl RandomSource for UuidRandom {
    fn pick(&self, len: usize) -> usize {
        (Uuid::new_v4().as_u128() % len.max(1) as u128) as usize
    }
}

/// Always picks the same index (wrapped to `len`).
#[derive(Debug, Default)]
pub struct FixedRandom {
    index: AtomicUsize,
}

impl FixedRandom {
    pub fn new(index: usize) -> Self {
        Self {
            index: AtomicUsize::new(index),
        }
    }

    pub fn set(&self, index: usize) {
        self.index.store(index, Ordering::SeqCst);
    }
}

impl RandomSource for FixedRandom {
    fn pick(&self, len: usize) -> usize {
        self.index.load(Ordering::SeqCst) % len.max(1)
    }
}
