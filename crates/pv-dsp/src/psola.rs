//! Pitch-synchronous overlap-add (PSOLA) analysis and resynthesis
//!
//! The analyzer segments the mono input into Hann-windowed grains, one per
//! detected input period, centered on signal peaks. Each voice owns a
//! shifter that re-places those grains at its own target period and
//! overlap-adds them into a mono stream, which changes the perceived pitch
//! while keeping the input's formant character.

use pv_core::Sample;

/// Grain analyzer shared by all voices.
///
/// Call [`analyze`](Self::analyze) once per internal block; the extracted
/// grains stay valid until the next call. Unpitched frames reuse the last
/// known period so consonants and breath still produce grains.
pub struct PsolaAnalyzer<S: Sample> {
    current_period: f64,
    grain_centers: Vec<usize>,
    grain_store: Vec<Vec<S>>,
    num_grains: usize,
    max_grain_len: usize,
}

impl<S: Sample> PsolaAnalyzer<S> {
    pub fn new() -> Self {
        Self {
            current_period: 0.0,
            grain_centers: Vec::new(),
            grain_store: Vec::new(),
            num_grains: 0,
            max_grain_len: 0,
        }
    }

    /// Preallocate grain storage. Control thread only.
    pub fn prepare(&mut self, blocksize: usize, min_period: usize, max_period: usize) {
        let max_grains = blocksize / min_period.max(1) + 2;
        self.max_grain_len = max_period * 2;

        self.grain_centers.clear();
        self.grain_centers.reserve(max_grains);

        self.grain_store.resize_with(max_grains, Vec::new);
        for grain in &mut self.grain_store {
            grain.resize(self.max_grain_len, S::zero());
        }

        self.num_grains = 0;
        self.current_period = 0.0;
    }

    pub fn reset(&mut self) {
        self.num_grains = 0;
        self.grain_centers.clear();
        self.current_period = 0.0;
    }

    /// Input period used for the most recent analysis, in samples.
    #[inline]
    pub fn current_period(&self) -> f64 {
        self.current_period
    }

    #[inline]
    pub fn num_grains(&self) -> usize {
        self.num_grains
    }

    #[inline]
    pub fn grain_center(&self, index: usize) -> usize {
        self.grain_centers[index]
    }

    #[inline]
    pub fn grain_samples(&self, index: usize) -> &[S] {
        &self.grain_store[index]
    }

    /// Segment `input` into one grain per period.
    ///
    /// `detected_period` is the pitch detector's estimate for this frame in
    /// samples, or `None` when the frame was unpitched.
    pub fn analyze(&mut self, input: &[S], detected_period: Option<f64>) {
        if let Some(period) = detected_period {
            if period > 1.0 {
                self.current_period = period.min((input.len() / 2).max(2) as f64);
            }
        }

        self.num_grains = 0;
        self.grain_centers.clear();

        let period = self.current_period.round() as usize;
        if period < 2 || input.len() < period * 2 {
            return;
        }

        // one peak per period drives the grain centers
        let mut center = index_of_abs_peak(&input[..period.min(input.len())]);

        loop {
            if self.num_grains >= self.grain_store.len() {
                break;
            }

            self.grain_centers.push(center);
            self.extract_grain(input, center, period);
            self.num_grains += 1;

            // re-anchor the next peak around one period ahead
            let target = center + period;
            if target + period / 4 >= input.len() {
                break;
            }

            let window_start = target.saturating_sub(period / 4);
            let window_end = (target + period / 4 + 1).min(input.len());
            center = window_start + index_of_abs_peak(&input[window_start..window_end]);
        }
    }

    fn extract_grain(&mut self, input: &[S], center: usize, period: usize) {
        let grain_len = (period * 2).min(self.max_grain_len);
        let grain = &mut self.grain_store[self.num_grains];
        grain.fill(S::zero());

        let half = period as isize;
        for (j, slot) in grain.iter_mut().enumerate().take(grain_len) {
            let source = center as isize - half + j as isize;
            if source < 0 || source >= input.len() as isize {
                continue;
            }
            let window = hann(j, grain_len);
            *slot = input[source as usize] * S::from_f64(window);
        }
    }
}

impl<S: Sample> Default for PsolaAnalyzer<S> {
    fn default() -> Self {
        Self::new()
    }
}

#[inline]
fn hann(index: usize, len: usize) -> f64 {
    if len < 2 {
        return 1.0;
    }
    let phase = std::f64::consts::TAU * index as f64 / (len - 1) as f64;
    0.5 * (1.0 - phase.cos())
}

fn index_of_abs_peak<S: Sample>(window: &[S]) -> usize {
    let mut peak = S::zero();
    let mut peak_index = 0;
    for (i, &sample) in window.iter().enumerate() {
        if sample.abs() > peak {
            peak = sample.abs();
            peak_index = i;
        }
    }
    peak_index
}

/// Per-voice resynthesis state.
///
/// Grains from the shared analyzer are re-placed at the voice's target
/// period and overlap-added; the tail of any grain that crosses the block
/// boundary is carried into the next block so streams stay continuous.
pub struct PsolaShifter<S: Sample> {
    next_grain_time: f64,
    carry: Vec<S>,
}

impl<S: Sample> PsolaShifter<S> {
    pub fn new() -> Self {
        Self {
            next_grain_time: 0.0,
            carry: Vec::new(),
        }
    }

    /// Preallocate the boundary carry buffer. Control thread only.
    pub fn prepare(&mut self, max_period: usize) {
        self.carry.resize(max_period * 2, S::zero());
        self.reset();
    }

    pub fn reset(&mut self) {
        self.next_grain_time = 0.0;
        self.carry.fill(S::zero());
    }

    /// Synthesize one block at `target_period` samples into `out`
    /// (overwriting it).
    pub fn render(&mut self, analyzer: &PsolaAnalyzer<S>, target_period: f64, out: &mut [S]) {
        let n = out.len();
        out.fill(S::zero());

        // drain the carried tail from the previous block
        let take = n.min(self.carry.len());
        out[..take].copy_from_slice(&self.carry[..take]);
        self.carry.copy_within(take.., 0);
        let carry_len = self.carry.len();
        self.carry[carry_len - take..].fill(S::zero());

        let input_period = analyzer.current_period();

        if analyzer.num_grains() == 0 || target_period < 2.0 || input_period < 2.0 {
            self.next_grain_time = (self.next_grain_time - n as f64).max(0.0);
            return;
        }

        // denser grain placement raises the overlap count, so scale down to
        // keep the output level stable
        let amplitude = S::from_f64((target_period / input_period).min(1.0));

        while self.next_grain_time < n as f64 {
            let center = self.next_grain_time.round() as isize;
            let grain_index = self.closest_grain(analyzer, self.next_grain_time);
            let grain = analyzer.grain_samples(grain_index);
            let half = input_period.round() as isize;

            for (j, &sample) in grain.iter().enumerate() {
                let position = center - half + j as isize;
                if position < 0 {
                    continue;
                }
                let position = position as usize;
                if position < n {
                    out[position] += sample * amplitude;
                } else if position - n < self.carry.len() {
                    self.carry[position - n] += sample * amplitude;
                }
            }

            self.next_grain_time += target_period;
        }

        self.next_grain_time -= n as f64;
    }

    fn closest_grain(&self, analyzer: &PsolaAnalyzer<S>, time: f64) -> usize {
        let mut best = 0;
        let mut best_distance = f64::INFINITY;
        for i in 0..analyzer.num_grains() {
            let distance = (analyzer.grain_center(i) as f64 - time).abs();
            if distance < best_distance {
                best_distance = distance;
                best = i;
            }
        }
        best
    }
}

impl<S: Sample> Default for PsolaShifter<S> {
    fn default() -> Self {
        Self::new()
    }
}
