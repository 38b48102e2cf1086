//! pv-core: Shared types, traits, and utilities for Polyvox
//!
//! This crate provides the foundational types used across all Polyvox crates:
//! - Generic audio sample types and preallocated buffers
//! - MIDI events, block buffers, and the cross-chunk MIDI FIFO
//! - Tuning math (concert pitch, pitch bend, velocity mapping)
//! - Lock-free parameter cells for control-thread / audio-thread exchange
//! - Error types

mod sample;
mod midi;
mod tuning;
mod params;
mod error;

pub use sample::*;
pub use midi::*;
pub use tuning::*;
pub use params::*;
pub use error::*;

/// Decibel value wrapper
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Decibels(pub f64);

impl Decibels {
    pub const ZERO: Self = Self(0.0);
    pub const NEG_INF: Self = Self(f64::NEG_INFINITY);

    #[inline]
    pub fn from_gain(gain: f64) -> Self {
        if gain <= 0.0 {
            Self::NEG_INF
        } else {
            Self(20.0 * gain.log10())
        }
    }

    #[inline]
    pub fn to_gain(self) -> f64 {
        if self.0 <= -144.0 {
            0.0
        } else {
            10.0_f64.powf(self.0 / 20.0)
        }
    }
}

impl Default for Decibels {
    fn default() -> Self {
        Self::ZERO
    }
}
