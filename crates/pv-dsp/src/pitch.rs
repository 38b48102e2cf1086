//! Pitch detection
//!
//! Time-domain detector built on the average squared difference function
//! (ASDF) with two stabilizing refinements:
//! - the lag search is floored at the signal's first zero crossing, which
//!   avoids spurious sub-period minima
//! - between consecutive voiced frames the lag search is restricted to
//!   `[last/2, last*2]`, since pitch cannot halve or double that fast

use log::warn;
use pv_core::{PvError, PvResult, Sample};

/// Vocal range presets selecting the detector's Hz search range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VocalRange {
    #[default]
    Soprano,
    Alto,
    Tenor,
    Bass,
}

impl VocalRange {
    /// (min Hz, max Hz) for pitch detection
    pub fn hz_range(self) -> (f64, f64) {
        match self {
            VocalRange::Soprano => (207.0, 1087.0),
            VocalRange::Alto => (130.81, 694.0),
            VocalRange::Tenor => (103.83, 523.25),
            VocalRange::Bass => (82.41, 440.0),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            VocalRange::Soprano => "Soprano",
            VocalRange::Alto => "Alto",
            VocalRange::Tenor => "Tenor",
            VocalRange::Bass => "Bass",
        }
    }

    pub fn from_index(index: u32) -> Self {
        match index {
            1 => VocalRange::Alto,
            2 => VocalRange::Tenor,
            3 => VocalRange::Bass,
            _ => VocalRange::Soprano,
        }
    }

    pub fn index(self) -> u32 {
        match self {
            VocalRange::Soprano => 0,
            VocalRange::Alto => 1,
            VocalRange::Tenor => 2,
            VocalRange::Bass => 3,
        }
    }
}

/// ASDF value written to lags excluded from the current frame's search.
const EXCLUDED_LAG_VALUE: f64 = 2.0;

/// Frames whose best ASDF value exceeds this are declared unpitched.
const CONFIDENCE_THRESH: f64 = 0.25;

/// Below this ASDF value the minimum is trusted without candidate weighing.
const HIGH_CONFIDENCE_THRESH: f64 = 0.05;

/// Number of period candidates examined when weighing against the previous
/// frame's estimate.
const PERIOD_CANDIDATES_TO_TEST: usize = 10;

/// ASDF pitch detector.
///
/// Returns the fundamental frequency of a mono frame in Hz, or `None` when
/// the frame is unpitched. The detectable range is `[min_hz, max_hz]`,
/// translated internally to a lag range of
/// `[round(sr / max_hz), round(sr / min_hz)]` samples.
pub struct PitchDetector<S: Sample> {
    min_hz: f64,
    max_hz: f64,
    sample_rate: f64,
    min_period: usize,
    max_period: usize,
    asdf: Vec<S>,
    last_period: f64,
    last_frame_pitched: bool,
    candidates: Vec<usize>,
}

impl<S: Sample> PitchDetector<S> {
    pub fn new(min_hz: f64, max_hz: f64, sample_rate: f64) -> PvResult<Self> {
        if max_hz <= min_hz || min_hz <= 0.0 {
            return Err(PvError::InvalidPitchRange { min_hz, max_hz });
        }

        let mut detector = Self {
            min_hz,
            max_hz,
            sample_rate,
            min_period: 0,
            max_period: 0,
            asdf: Vec::new(),
            last_period: 0.0,
            last_frame_pitched: false,
            candidates: Vec::with_capacity(PERIOD_CANDIDATES_TO_TEST),
        };
        detector.recalc_periods();
        detector.last_period = detector.min_period as f64;
        Ok(detector)
    }

    /// Change the detectable Hz range. An inverted range is snapped to
    /// `max_hz = min_hz + 1` rather than rejected.
    ///
    /// Control thread only: resizes the lag buffer.
    pub fn set_hz_range(&mut self, min_hz: f64, max_hz: f64) {
        let min_hz = min_hz.max(1.0);
        let max_hz = if max_hz <= min_hz {
            warn!("inverted pitch range {min_hz}..{max_hz} Hz, snapping max to {}", min_hz + 1.0);
            min_hz + 1.0
        } else {
            max_hz
        };

        if self.min_hz == min_hz && self.max_hz == max_hz {
            return;
        }

        self.min_hz = min_hz;
        self.max_hz = max_hz;
        self.recalc_periods();
    }

    pub fn set_sample_rate(&mut self, sample_rate: f64) {
        if self.sample_rate == sample_rate || sample_rate <= 0.0 {
            return;
        }

        // carry the Hz estimate across the rate change
        if self.last_frame_pitched && self.last_period > 0.0 {
            let last_hz = self.sample_rate / self.last_period;
            self.last_period = sample_rate / last_hz;
        }

        self.sample_rate = sample_rate;
        self.recalc_periods();
    }

    fn recalc_periods(&mut self) {
        self.min_period = (self.sample_rate / self.max_hz).round().max(1.0) as usize;
        self.max_period = (self.sample_rate / self.min_hz).round() as usize;

        if self.max_period <= self.min_period {
            self.max_period = self.min_period + 1;
        }

        let num_lags = self.max_period - self.min_period + 1;
        if self.asdf.len() != num_lags {
            self.asdf.resize(num_lags, S::zero());
        }
    }

    #[inline]
    pub fn min_period(&self) -> usize {
        self.min_period
    }

    #[inline]
    pub fn max_period(&self) -> usize {
        self.max_period
    }

    /// Latency of one analysis window: two full maximum periods.
    #[inline]
    pub fn latency(&self) -> usize {
        self.max_period * 2
    }

    /// Most recent period estimate in samples.
    #[inline]
    pub fn last_period(&self) -> f64 {
        self.last_period
    }

    pub fn reset(&mut self) {
        self.last_frame_pitched = false;
        self.last_period = self.min_period as f64;
    }

    /// Detect the fundamental frequency of `input`, in Hz.
    ///
    /// Returns `None` for unpitched frames and for frames shorter than the
    /// minimum detectable period.
    pub fn detect(&mut self, input: &[S]) -> Option<f64> {
        let num_samples = input.len();

        if num_samples < self.min_period {
            return None;
        }

        let mut min_lag = samples_to_first_zero_crossing(input);
        let mut max_lag = self.max_period;

        if self.last_frame_pitched {
            min_lag = min_lag.max((self.last_period / 2.0).round() as usize);
            max_lag = max_lag.min((self.last_period * 2.0).round() as usize);
        }

        min_lag = min_lag.max(self.min_period);

        if max_lag < min_lag {
            max_lag = min_lag + 1;
        } else if min_lag == max_lag {
            max_lag += 1;
        }

        let middle = num_samples / 2;
        let half = (num_samples - 1) / 2;
        let norm = S::from_f64(1.0 / num_samples as f64);
        let excluded = S::from_f64(EXCLUDED_LAG_VALUE);

        for k in self.min_period..=self.max_period {
            let index = k - self.min_period;

            if k < min_lag || k > max_lag {
                self.asdf[index] = excluded;
                continue;
            }

            let offset = middle as isize - (k / 2) as isize;
            let start = (offset - half as isize).max(0) as usize;
            let end = ((offset + half as isize) as usize).min(num_samples.saturating_sub(k));

            let mut sum = S::zero();
            for s in start..end {
                let difference = input[s] - input[s + k];
                sum += difference * difference;
            }

            self.asdf[index] = sum * norm;
        }

        let asdf_size = self.max_period - self.min_period + 1;
        let min_index = index_of_min(&self.asdf[..asdf_size]);
        let greatest_confidence = self.asdf[min_index].to_f64();

        if greatest_confidence > CONFIDENCE_THRESH {
            self.last_frame_pitched = false;
            return None;
        }

        if !self.last_frame_pitched || greatest_confidence < HIGH_CONFIDENCE_THRESH {
            return Some(self.found_the_period(min_index, asdf_size));
        }

        Some(self.choose_ideal_period_candidate(min_index, asdf_size))
    }

    fn found_the_period(&mut self, min_index: usize, asdf_size: usize) -> f64 {
        let interpolated = quadratic_peak_position(&self.asdf[..asdf_size], min_index);
        let real_period = (interpolated + self.min_period as f64).min(self.max_period as f64);

        self.last_period = real_period;
        self.last_frame_pitched = true;
        self.sample_rate / real_period
    }

    /// Weigh the top ASDF minima by their distance from the previous period
    /// and pick the best candidate.
    fn choose_ideal_period_candidate(&mut self, min_index: usize, asdf_size: usize) -> f64 {
        let num_candidates = PERIOD_CANDIDATES_TO_TEST.min(asdf_size);

        self.candidates.clear();
        self.candidates.push(min_index);

        for _ in 1..num_candidates {
            if let Some(next) = next_best_candidate(&self.candidates, &self.asdf[..asdf_size]) {
                self.candidates.push(next);
            }
        }

        if self.candidates.len() == 1 {
            return self.found_the_period(min_index, asdf_size);
        }

        // greatest & least confidences (lowest & highest ASDF values)
        let greatest_confidence = self.asdf[min_index].to_f64();
        let least_confidence = self
            .candidates
            .iter()
            .map(|&c| self.asdf[c].to_f64())
            .fold(greatest_confidence, f64::max);

        // little variation between candidates: return the smallest lag
        if (least_confidence - greatest_confidence) < 2.0 {
            let smallest = self.candidates.iter().copied().min().unwrap_or(min_index);
            return self.found_the_period(smallest, asdf_size);
        }

        let mut deltas = [0.0f64; PERIOD_CANDIDATES_TO_TEST];
        for (i, &candidate) in self.candidates.iter().enumerate() {
            deltas[i] = ((candidate + self.min_period) as f64 - self.last_period).abs();
        }
        let deltas = &deltas[..self.candidates.len()];

        let min_delta = deltas.iter().copied().fold(f64::INFINITY, f64::min);
        let max_delta = deltas.iter().copied().fold(0.0, f64::max);
        let delta_range = max_delta - min_delta;

        // all candidates are about as far from the previous period
        if delta_range < 4.0 {
            return self.found_the_period(min_index, asdf_size);
        }

        // higher ASDF = lower confidence, so inflate the values of candidates
        // that sit further from the previous period
        let mut best = min_index;
        let mut best_confidence = f64::INFINITY;

        for (i, &candidate) in self.candidates.iter().enumerate() {
            let delta = deltas[i];
            let weighted = if delta == 0.0 {
                self.asdf[candidate].to_f64()
            } else {
                self.asdf[candidate].to_f64() * (1.0 + (delta / delta_range) * 0.5)
            };

            if weighted < best_confidence {
                best_confidence = weighted;
                best = candidate;
            }
        }

        self.found_the_period(best, asdf_size)
    }
}

/// Index of the first zero crossing of the signal, or 0 when none is found
/// in the first half.
fn samples_to_first_zero_crossing<S: Sample>(input: &[S]) -> usize {
    if input.is_empty() || input[0] == S::zero() {
        return 0;
    }

    let started_positive = input[0] > S::zero();

    for (s, &sample) in input.iter().enumerate().take(input.len() / 2).skip(1) {
        if sample == S::zero() {
            return s;
        }
        if (sample > S::zero()) != started_positive {
            return s;
        }
    }

    0
}

fn index_of_min<S: Sample>(data: &[S]) -> usize {
    let mut min = data[0];
    let mut min_index = 0;

    for (n, &value) in data.iter().enumerate().skip(1) {
        if value == S::zero() {
            return n;
        }
        if value < min {
            min = value;
            min_index = n;
        }
    }

    min_index
}

/// Next ASDF minimum not already in `candidates`.
fn next_best_candidate<S: Sample>(candidates: &[usize], data: &[S]) -> Option<usize> {
    let init_index = (0..data.len()).find(|i| !candidates.contains(i))?;

    let mut min = data[init_index];
    let mut min_index = init_index;

    for (i, &value) in data.iter().enumerate() {
        if i == init_index || candidates.contains(&i) {
            continue;
        }

        if value == S::zero() {
            return Some(i);
        }

        if value < min {
            min = value;
            min_index = i;
        }
    }

    Some(min_index)
}

/// Sub-sample minimum position via quadratic interpolation.
fn quadratic_peak_position<S: Sample>(data: &[S], pos: usize) -> f64 {
    if pos == 0 || pos + 1 >= data.len() {
        return pos as f64;
    }

    let s1 = data[pos].to_f64();
    if s1 == 0.0 {
        return pos as f64;
    }

    let s0 = data[pos - 1].to_f64();
    let s2 = data[pos + 1].to_f64();
    let denom = 2.0 * s1 - s2 - s0;

    if denom == 0.0 {
        return pos as f64;
    }

    let adjustment = 0.5 * (s2 - s0) / denom;
    if adjustment.is_finite() && adjustment.abs() < 1.0 {
        pos as f64 + adjustment
    } else {
        pos as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(freq: f64, sample_rate: f64, len: usize) -> Vec<f32> {
        (0..len)
            .map(|i| (2.0 * std::f64::consts::PI * freq * i as f64 / sample_rate).sin() as f32)
            .collect()
    }

    #[test]
    fn test_detects_a440() {
        let sr = 48_000.0;
        let mut detector = PitchDetector::<f32>::new(80.0, 1100.0, sr).unwrap();
        let window = sine(440.0, sr, detector.latency());

        let hz = detector.detect(&window).expect("should be pitched");
        assert!((hz - 440.0).abs() < 4.0, "detected {hz}");
    }

    #[test]
    fn test_detects_low_voice() {
        let sr = 44_100.0;
        let mut detector = PitchDetector::<f64>::new(80.0, 1100.0, sr).unwrap();
        let window: Vec<f64> = sine(110.0, sr, detector.latency())
            .iter()
            .map(|&x| x as f64)
            .collect();

        let hz = detector.detect(&window).expect("should be pitched");
        assert!((hz - 110.0).abs() < 2.0, "detected {hz}");
    }

    #[test]
    fn test_consecutive_frames_stay_in_octave() {
        let sr = 48_000.0;
        let mut detector = PitchDetector::<f32>::new(80.0, 1100.0, sr).unwrap();
        let window = sine(220.0, sr, detector.latency());

        let first = detector.detect(&window).unwrap();
        let second = detector.detect(&window).unwrap();
        assert!((first - second).abs() < 2.0);
        assert!((second - 220.0).abs() < 4.0);
    }

    #[test]
    fn test_noise_is_unpitched() {
        let sr = 48_000.0;
        let mut detector = PitchDetector::<f32>::new(80.0, 1100.0, sr).unwrap();
        let noise: Vec<f32> = (0..detector.latency())
            .map(|i| {
                let x = (i as f32 * 12.9898).sin() * 43758.547;
                (x - x.floor()) * 2.0 - 1.0
            })
            .collect();

        assert!(detector.detect(&noise).is_none());
    }

    #[test]
    fn test_short_frame_is_unpitched() {
        let sr = 48_000.0;
        let mut detector = PitchDetector::<f32>::new(80.0, 1100.0, sr).unwrap();
        let short = sine(440.0, sr, detector.min_period() - 1);
        assert!(detector.detect(&short).is_none());
    }

    #[test]
    fn test_inverted_range_rejected_then_snapped() {
        assert!(PitchDetector::<f32>::new(500.0, 100.0, 48_000.0).is_err());

        let mut detector = PitchDetector::<f32>::new(80.0, 1100.0, 48_000.0).unwrap();
        detector.set_hz_range(500.0, 100.0);
        assert!(detector.max_period() > detector.min_period());
    }

    #[test]
    fn test_vocal_ranges_are_ordered() {
        for range in [
            VocalRange::Soprano,
            VocalRange::Alto,
            VocalRange::Tenor,
            VocalRange::Bass,
        ] {
            let (min, max) = range.hz_range();
            assert!(min < max);
            assert_eq!(VocalRange::from_index(range.index()), range);
        }
    }
}
