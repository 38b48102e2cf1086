//! Output dynamics: peak limiter
//!
//! Instant-attack, smooth-release peak limiter with a gain computer linked
//! across both channels. No lookahead, so it adds no latency to the engine's
//! reported figure.

use pv_core::Sample;

use crate::{Processor, StereoProcessor};

/// Stereo peak limiter.
#[derive(Debug, Clone)]
pub struct Limiter<S: Sample> {
    threshold_db: f64,
    release_ms: f64,
    release_coeff: f64,
    gain: f64,
    sample_rate: f64,
    _marker: std::marker::PhantomData<S>,
}

impl<S: Sample> Limiter<S> {
    pub fn new(sample_rate: f64) -> Self {
        let mut limiter = Self {
            threshold_db: -0.3,
            release_ms: 35.0,
            release_coeff: 0.0,
            gain: 1.0,
            sample_rate: sample_rate.max(1.0),
            _marker: std::marker::PhantomData,
        };
        limiter.update_release();
        limiter
    }

    pub fn set_sample_rate(&mut self, sample_rate: f64) {
        self.sample_rate = sample_rate.max(1.0);
        self.update_release();
    }

    pub fn set_threshold(&mut self, db: f64) {
        self.threshold_db = db.clamp(-24.0, 0.0);
    }

    pub fn set_release(&mut self, ms: f64) {
        self.release_ms = ms.clamp(1.0, 1000.0);
        self.update_release();
    }

    fn update_release(&mut self) {
        self.release_coeff = (-1.0 / (self.release_ms * 0.001 * self.sample_rate)).exp();
    }

    #[inline]
    fn threshold_linear(&self) -> f64 {
        10.0_f64.powf(self.threshold_db / 20.0)
    }

    /// Current gain reduction in dB.
    pub fn gain_reduction_db(&self) -> f64 {
        -20.0 * self.gain.log10()
    }
}

impl<S: Sample> Processor for Limiter<S> {
    fn reset(&mut self) {
        self.gain = 1.0;
    }
}

impl<S: Sample> StereoProcessor<S> for Limiter<S> {
    #[inline]
    fn process_sample(&mut self, left: S, right: S) -> (S, S) {
        let peak = left.abs().to_f64().max(right.abs().to_f64());
        let threshold = self.threshold_linear();

        let target_gain = if peak > threshold {
            threshold / peak
        } else {
            1.0
        };

        // instant attack, smooth release
        if target_gain < self.gain {
            self.gain = target_gain;
        } else {
            self.gain = target_gain + self.release_coeff * (self.gain - target_gain);
        }

        let gain = S::from_f64(self.gain);
        (left * gain, right * gain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limits_peaks_to_threshold() {
        let mut limiter = Limiter::<f64>::new(48_000.0);
        limiter.set_threshold(-6.0);
        let ceiling = 10.0_f64.powf(-6.0 / 20.0);

        let mut peak: f64 = 0.0;
        for _ in 0..4800 {
            let (l, r) = limiter.process_sample(1.0, -1.0);
            peak = peak.max(l.abs()).max(r.abs());
        }
        assert!(peak <= ceiling * 1.001, "peak {peak} over ceiling {ceiling}");
    }

    #[test]
    fn test_quiet_signal_passes_through() {
        let mut limiter = Limiter::<f32>::new(48_000.0);
        limiter.set_threshold(-0.3);

        let (l, r) = limiter.process_sample(0.1, -0.1);
        assert!((l - 0.1).abs() < 1e-6);
        assert!((r + 0.1).abs() < 1e-6);
        assert!(limiter.gain_reduction_db() < 0.01);
    }

    #[test]
    fn test_gain_recovers_after_peak() {
        let mut limiter = Limiter::<f64>::new(48_000.0);
        limiter.set_threshold(-6.0);
        limiter.set_release(5.0);

        limiter.process_sample(1.0, 1.0);
        assert!(limiter.gain_reduction_db() > 1.0);

        for _ in 0..4800 {
            limiter.process_sample(0.0, 0.0);
        }
        assert!(limiter.gain_reduction_db() < 0.1);
    }
}
