//! Lock-free parameter cells for control-thread / audio-thread exchange
//!
//! Each cell is a single word-sized atomic with one writer (the control
//! thread) and one reader (the audio thread), so torn reads are impossible.
//! The audio thread snapshots every cell exactly once per host block.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

/// Atomic f64 parameter for lock-free access
pub struct AtomicParam {
    bits: AtomicU64,
}

impl AtomicParam {
    pub fn new(value: f64) -> Self {
        Self {
            bits: AtomicU64::new(value.to_bits()),
        }
    }

    #[inline]
    pub fn get(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Relaxed))
    }

    #[inline]
    pub fn set(&self, value: f64) {
        self.bits.store(value.to_bits(), Ordering::Relaxed);
    }
}

impl Default for AtomicParam {
    fn default() -> Self {
        Self::new(0.0)
    }
}

/// Atomic boolean parameter
pub struct AtomicToggle {
    value: AtomicBool,
}

impl AtomicToggle {
    pub fn new(value: bool) -> Self {
        Self {
            value: AtomicBool::new(value),
        }
    }

    #[inline]
    pub fn get(&self) -> bool {
        self.value.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn set(&self, value: bool) {
        self.value.store(value, Ordering::Relaxed);
    }
}

impl Default for AtomicToggle {
    fn default() -> Self {
        Self::new(false)
    }
}

/// Atomic integer parameter
pub struct AtomicInt {
    value: AtomicU32,
}

impl AtomicInt {
    pub fn new(value: u32) -> Self {
        Self {
            value: AtomicU32::new(value),
        }
    }

    #[inline]
    pub fn get(&self) -> u32 {
        self.value.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn set(&self, value: u32) {
        self.value.store(value, Ordering::Relaxed);
    }
}

impl Default for AtomicInt {
    fn default() -> Self {
        Self::new(0)
    }
}
