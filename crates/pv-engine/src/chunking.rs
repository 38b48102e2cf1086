//! Fixed-block engine
//!
//! The PSOLA synthesis needs a fixed block of `2 * max detectable period`
//! samples so every analysis window holds at least one full period. Hosts
//! deliver arbitrary block sizes, so this engine slices oversized host
//! blocks into chunks and runs an audio + MIDI FIFO underneath, driving
//! [`Harmonizer::render_voices`] only when a full internal block has
//! accumulated. The cost is one internal block of latency, reported through
//! [`Engine::latency_samples`].

use pv_core::{
    apply_gain_ramp, copy_with_gain_ramp, MidiBuffer, MidiFifo, MonoBuffer, Sample, StereoBuffer,
};
use pv_dsp::panning::pan_gains;
use pv_dsp::pitch::VocalRange;
use pv_dsp::{DryWetMixer, Limiter, Processor, StereoProcessor};

use crate::harmonizer::Harmonizer;

/// Which input channel feeds the pitch tracker and synthesis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ModulatorSource {
    #[default]
    LeftChannel,
    RightChannel,
    MixToMono,
}

impl ModulatorSource {
    pub fn from_index(index: u32) -> Self {
        match index {
            1 => ModulatorSource::RightChannel,
            2 => ModulatorSource::MixToMono,
            _ => ModulatorSource::LeftChannel,
        }
    }

    pub fn index(self) -> u32 {
        match self {
            ModulatorSource::LeftChannel => 0,
            ModulatorSource::RightChannel => 1,
            ModulatorSource::MixToMono => 2,
        }
    }
}

/// Engine lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineStatus {
    Uninitialized,
    Ready,
    Released,
}

/// Single-domain sample FIFO.
///
/// Both ends live on the audio thread, so no atomics are involved; the
/// engine guarantees the capacity is never exceeded in steady state, and
/// overflow drops samples rather than reallocating.
#[derive(Debug, Clone)]
pub struct SampleFifo<S: Sample> {
    buffer: Vec<S>,
    head: usize,
    stored: usize,
}

impl<S: Sample> SampleFifo<S> {
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: vec![S::zero(); capacity],
            head: 0,
            stored: 0,
        }
    }

    /// Resize and clear. Control thread only.
    pub fn resize(&mut self, capacity: usize) {
        self.buffer.resize(capacity, S::zero());
        self.clear();
    }

    #[inline]
    pub fn stored(&self) -> usize {
        self.stored
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    pub fn clear(&mut self) {
        self.buffer.fill(S::zero());
        self.head = 0;
        self.stored = 0;
    }

    /// Append samples, dropping any overflow beyond capacity.
    pub fn push(&mut self, samples: &[S]) -> usize {
        let capacity = self.buffer.len();
        if capacity == 0 {
            return 0;
        }

        let writable = (capacity - self.stored).min(samples.len());
        for (i, &sample) in samples.iter().enumerate().take(writable) {
            let index = (self.head + self.stored + i) % capacity;
            self.buffer[index] = sample;
        }
        self.stored += writable;
        writable
    }

    /// Fill `out` from the FIFO, zero-padding any shortfall. Returns the
    /// number of real samples delivered.
    pub fn pop(&mut self, out: &mut [S]) -> usize {
        let capacity = self.buffer.len();
        let readable = self.stored.min(out.len());

        for slot in out.iter_mut().take(readable) {
            *slot = self.buffer[self.head];
            self.head = (self.head + 1) % capacity.max(1);
        }
        out[readable..].fill(S::zero());

        self.stored -= readable;
        readable
    }
}

/// Host-facing engine wrapping the harmonizer in block-size regulation,
/// the dry signal path, gain staging, the dry/wet mix, and the output
/// limiter.
pub struct Engine<S: Sample> {
    harmonizer: Harmonizer<S>,
    status: EngineStatus,
    sample_rate: f64,
    internal_blocksize: usize,

    input_fifo: SampleFifo<S>,
    output_fifo_l: SampleFifo<S>,
    output_fifo_r: SampleFifo<S>,
    midi_in_fifo: MidiFifo,
    midi_out_fifo: MidiFifo,
    chop_midi: MidiBuffer,
    chunk_midi: MidiBuffer,

    mono_scratch: MonoBuffer<S>,
    render_in: MonoBuffer<S>,
    dry_buffer: StereoBuffer<S>,
    wet_buffer: StereoBuffer<S>,

    mixer: DryWetMixer<S>,
    limiter: Limiter<S>,
    limiter_on: bool,
    lead_bypassed: bool,
    harmony_bypassed: bool,
    modulator_source: ModulatorSource,

    // audio-thread mirrors of the ramp anchors
    input_gain: f64,
    prev_input_gain: f64,
    output_gain: f64,
    prev_output_gain: f64,
    dry_gain: f64,
    prev_dry_gain: f64,
    wet_gain: f64,
    prev_wet_gain: f64,

    dry_pan: u8,
    dry_gain_l: f64,
    dry_gain_r: f64,
    prev_dry_gain_l: f64,
    prev_dry_gain_r: f64,
}

impl<S: Sample> Engine<S> {
    pub fn new() -> Self {
        let (gain_l, gain_r) = pan_gains::<f64>(64);
        Self {
            harmonizer: Harmonizer::new(4, 44_100.0),
            status: EngineStatus::Uninitialized,
            sample_rate: 44_100.0,
            internal_blocksize: 0,
            input_fifo: SampleFifo::new(0),
            output_fifo_l: SampleFifo::new(0),
            output_fifo_r: SampleFifo::new(0),
            midi_in_fifo: MidiFifo::new(),
            midi_out_fifo: MidiFifo::new(),
            chop_midi: MidiBuffer::new(),
            chunk_midi: MidiBuffer::new(),
            mono_scratch: MonoBuffer::new(0),
            render_in: MonoBuffer::new(0),
            dry_buffer: StereoBuffer::new(0),
            wet_buffer: StereoBuffer::new(0),
            mixer: DryWetMixer::new(),
            limiter: Limiter::new(44_100.0),
            limiter_on: true,
            lead_bypassed: false,
            harmony_bypassed: false,
            modulator_source: ModulatorSource::LeftChannel,
            input_gain: 1.0,
            prev_input_gain: 1.0,
            output_gain: 1.0,
            prev_output_gain: 1.0,
            dry_gain: 1.0,
            prev_dry_gain: 1.0,
            wet_gain: 1.0,
            prev_wet_gain: 1.0,
            dry_pan: 64,
            dry_gain_l: gain_l,
            dry_gain_r: gain_r,
            prev_dry_gain_l: gain_l,
            prev_dry_gain_r: gain_r,
        }
    }

    // ── lifecycle ──────────────────────────────────────────────────────────

    pub fn initialize(&mut self, sample_rate: f64, block_size: usize, num_voices: usize) {
        self.harmonizer.set_num_voices(num_voices);
        self.prepare(sample_rate, block_size);
    }

    /// Allocate every buffer for the current pitch range and sample rate.
    /// Control thread only (host processing suspended).
    pub fn prepare(&mut self, sample_rate: f64, host_block_size: usize) {
        self.sample_rate = sample_rate.max(1.0);

        self.harmonizer.set_sample_rate(self.sample_rate);
        let internal = self.harmonizer.latency_samples().max(1);
        self.internal_blocksize = internal;

        self.chop_midi = MidiBuffer::with_capacity((host_block_size * 2).clamp(64, 4096));

        self.input_fifo.resize(internal * 2);
        self.output_fifo_l.resize(internal * 3);
        self.output_fifo_r.resize(internal * 3);
        self.midi_in_fifo.clear();
        self.midi_out_fifo.clear();

        self.mono_scratch.resize(internal);
        self.render_in.resize(internal);
        self.dry_buffer.resize(internal);
        self.wet_buffer.resize(internal);

        self.mixer.prepare(internal);
        self.limiter.set_sample_rate(self.sample_rate);
        self.limiter.reset();

        self.harmonizer.prepare(self.sample_rate, internal);

        self.prev_input_gain = self.input_gain;
        self.prev_output_gain = self.output_gain;
        self.prev_dry_gain = self.dry_gain;
        self.prev_wet_gain = self.wet_gain;
        self.prev_dry_gain_l = self.dry_gain_l;
        self.prev_dry_gain_r = self.dry_gain_r;

        self.status = EngineStatus::Ready;
    }

    pub fn reset(&mut self) {
        self.harmonizer.reset();
        self.input_fifo.clear();
        self.output_fifo_l.clear();
        self.output_fifo_r.clear();
        self.midi_in_fifo.clear();
        self.midi_out_fifo.clear();
        self.mixer.reset();
        self.limiter.reset();

        self.prev_input_gain = self.input_gain;
        self.prev_output_gain = self.output_gain;
        self.prev_dry_gain = self.dry_gain;
        self.prev_wet_gain = self.wet_gain;
    }

    pub fn release_resources(&mut self) {
        self.harmonizer.reset();
        self.input_fifo.resize(0);
        self.output_fifo_l.resize(0);
        self.output_fifo_r.resize(0);
        self.midi_in_fifo.clear();
        self.midi_out_fifo.clear();
        self.mono_scratch.resize(0);
        self.render_in.resize(0);
        self.dry_buffer.resize(0);
        self.wet_buffer.resize(0);
        self.status = EngineStatus::Released;
    }

    #[inline]
    pub fn status(&self) -> EngineStatus {
        self.status
    }

    #[inline]
    pub fn is_ready(&self) -> bool {
        self.status == EngineStatus::Ready
    }

    /// Latency introduced by the FIFO regulation, in samples.
    #[inline]
    pub fn latency_samples(&self) -> usize {
        self.internal_blocksize
    }

    #[inline]
    pub fn internal_blocksize(&self) -> usize {
        self.internal_blocksize
    }

    // ── parameters (control thread, between blocks) ────────────────────────

    pub fn harmonizer(&self) -> &Harmonizer<S> {
        &self.harmonizer
    }

    pub fn harmonizer_mut(&mut self) -> &mut Harmonizer<S> {
        &mut self.harmonizer
    }

    pub fn set_num_voices(&mut self, num_voices: usize) {
        self.harmonizer.set_num_voices(num_voices);
    }

    /// Change the vocal range preset. Re-derives the internal block size
    /// and reallocates when the detector's window changes.
    pub fn set_vocal_range(&mut self, range: VocalRange) {
        self.harmonizer.set_vocal_range(range);
        if self.is_ready() && self.harmonizer.latency_samples() != self.internal_blocksize {
            self.prepare(self.sample_rate, self.internal_blocksize);
        }
    }

    pub fn set_bypass_states(&mut self, lead_bypassed: bool, harmony_bypassed: bool) {
        self.lead_bypassed = lead_bypassed;
        self.harmony_bypassed = harmony_bypassed;
    }

    pub fn set_input_gain(&mut self, gain: f64) {
        self.prev_input_gain = self.input_gain;
        self.input_gain = gain;
    }

    pub fn set_output_gain(&mut self, gain: f64) {
        self.prev_output_gain = self.output_gain;
        self.output_gain = gain;
    }

    pub fn set_dry_gain(&mut self, gain: f64) {
        self.prev_dry_gain = self.dry_gain;
        self.dry_gain = gain;
    }

    pub fn set_wet_gain(&mut self, gain: f64) {
        self.prev_wet_gain = self.wet_gain;
        self.wet_gain = gain;
    }

    pub fn set_dry_pan(&mut self, pan: u8) {
        let pan = pan.min(127);
        if self.dry_pan == pan {
            return;
        }
        self.dry_pan = pan;
        self.prev_dry_gain_l = self.dry_gain_l;
        self.prev_dry_gain_r = self.dry_gain_r;
        let (gain_l, gain_r) = pan_gains::<f64>(pan);
        self.dry_gain_l = gain_l;
        self.dry_gain_r = gain_r;
    }

    pub fn set_dry_wet(&mut self, percent_wet: u32) {
        self.mixer.set_wet_proportion(percent_wet.min(100) as f64 / 100.0);
    }

    pub fn set_limiter(&mut self, threshold_db: f64, release_ms: f64, on: bool) {
        self.limiter_on = on;
        self.limiter.set_threshold(threshold_db);
        self.limiter.set_release(release_ms);
    }

    pub fn set_modulator_source(&mut self, source: ModulatorSource) {
        self.modulator_source = source;
    }

    #[inline]
    pub fn modulator_source(&self) -> ModulatorSource {
        self.modulator_source
    }

    // ── processing ─────────────────────────────────────────────────────────

    /// Process one host block. `right` is `None` for a mono input bus.
    /// Oversized blocks are sliced into internal-size chunks with the MIDI
    /// buffer clipped and rebased per chunk.
    #[allow(clippy::too_many_arguments)]
    pub fn process(
        &mut self,
        left: &[S],
        right: Option<&[S]>,
        out_left: &mut [S],
        out_right: &mut [S],
        midi: &mut MidiBuffer,
        fade_in: bool,
        fade_out: bool,
        bypassed: bool,
    ) {
        if !self.is_ready() {
            out_left.fill(S::zero());
            out_right.fill(S::zero());
            return;
        }

        let total = out_left.len().min(out_right.len()).min(left.len());
        if total == 0 {
            // no usable input this block (e.g. an unconnected sidechain)
            out_left.fill(S::zero());
            out_right.fill(S::zero());
            return;
        }

        if total <= self.internal_blocksize {
            self.process_wrapped(
                &left[..total],
                right.map(|r| &r[..total.min(r.len())]),
                out_left,
                out_right,
                midi,
                fade_in,
                fade_out,
                bypassed,
            );
            return;
        }

        let mut start = 0usize;
        while start < total {
            let chunk = self.internal_blocksize.min(total - start);
            let is_first = start == 0;
            let is_last = start + chunk >= total;

            let mut chop = std::mem::take(&mut self.chop_midi);
            chop.clear();
            chop.push_range_rebased(midi, start as u32, chunk as u32, 0);

            let end = start + chunk;
            self.process_wrapped(
                &left[start..end],
                right.map(|r| &r[start..end]),
                &mut out_left[start..end],
                &mut out_right[start..end],
                &mut chop,
                fade_in && is_first,
                fade_out && is_last,
                bypassed,
            );

            // the chunk buffer now holds the engine's MIDI output; splice it
            // back at the original offset
            midi.clear_range(start as u32, end as u32);
            midi.push_range_rebased(&chop, 0, chunk as u32, start as u32);

            chop.clear();
            self.chop_midi = chop;

            start = end;
        }

        midi.sort_by_time();
    }

    /// Inner path: block sizes here never exceed the internal block size,
    /// but may be as short as one sample.
    #[allow(clippy::too_many_arguments)]
    fn process_wrapped(
        &mut self,
        left: &[S],
        right: Option<&[S]>,
        out_left: &mut [S],
        out_right: &mut [S],
        midi: &mut MidiBuffer,
        fade_in: bool,
        fade_out: bool,
        bypassed: bool,
    ) {
        let n = out_left.len().min(out_right.len()).min(left.len());
        if n == 0 {
            return;
        }

        // isolate the mono modulator signal
        {
            let scratch = &mut self.mono_scratch.samples_mut()[..n];
            match (self.modulator_source, right) {
                (ModulatorSource::RightChannel, Some(r)) if r.len() >= n => {
                    scratch.copy_from_slice(&r[..n]);
                }
                (ModulatorSource::MixToMono, Some(r)) if r.len() >= n => {
                    let half = S::from_f64(0.5);
                    for (i, slot) in scratch.iter_mut().enumerate() {
                        *slot = (left[i] + r[i]) * half;
                    }
                }
                _ => scratch.copy_from_slice(&left[..n]),
            }
        }

        self.input_fifo.push(&self.mono_scratch.samples()[..n]);
        self.midi_in_fifo.push_events(midi, n as u32);

        if self.input_fifo.stored() >= self.internal_blocksize {
            let internal = self.internal_blocksize;
            self.input_fifo
                .pop(&mut self.render_in.samples_mut()[..internal]);

            let mut chunk_midi = std::mem::take(&mut self.chunk_midi);
            self.midi_in_fifo.pop_events(&mut chunk_midi, internal as u32);

            if bypassed {
                self.output_fifo_l.push(&self.render_in.samples()[..internal]);
                self.output_fifo_r.push(&self.render_in.samples()[..internal]);
                self.midi_out_fifo.push_events(&chunk_midi, internal as u32);
            } else {
                self.render_block(&mut chunk_midi);
            }

            chunk_midi.clear();
            self.chunk_midi = chunk_midi;
        }

        // zero-padded during warm-up
        self.output_fifo_l.pop(&mut out_left[..n]);
        self.output_fifo_r.pop(&mut out_right[..n]);
        self.midi_out_fifo.pop_events(midi, n as u32);

        if fade_in {
            apply_gain_ramp(&mut out_left[..n], 0.0, 1.0);
            apply_gain_ramp(&mut out_right[..n], 0.0, 1.0);
        }
        if fade_out {
            apply_gain_ramp(&mut out_left[..n], 1.0, 0.0);
            apply_gain_ramp(&mut out_right[..n], 1.0, 0.0);
        }
    }

    /// Render exactly one internal block through the full signal chain.
    fn render_block(&mut self, midi: &mut MidiBuffer) {
        let internal = self.internal_blocksize;

        // master input gain
        apply_gain_ramp(
            &mut self.render_in.samples_mut()[..internal],
            self.prev_input_gain,
            self.input_gain,
        );
        self.prev_input_gain = self.input_gain;

        // dry path: pan, then dry gain, then into the mixer's dry side
        copy_with_gain_ramp(
            &mut self.dry_buffer.left_mut()[..internal],
            &self.render_in.samples()[..internal],
            self.prev_dry_gain_l,
            self.dry_gain_l,
        );
        copy_with_gain_ramp(
            &mut self.dry_buffer.right_mut()[..internal],
            &self.render_in.samples()[..internal],
            self.prev_dry_gain_r,
            self.dry_gain_r,
        );
        self.prev_dry_gain_l = self.dry_gain_l;
        self.prev_dry_gain_r = self.dry_gain_r;

        let dry_gain_now = if self.lead_bypassed { 0.0 } else { self.dry_gain };
        self.dry_buffer.apply_gain_ramp(self.prev_dry_gain, dry_gain_now);
        self.prev_dry_gain = dry_gain_now;

        self.mixer.push_dry(&self.dry_buffer);

        // the harmonizer renders the stereo wet signal and the MIDI output
        self.harmonizer
            .render_voices(&self.render_in.samples()[..internal], &mut self.wet_buffer, midi);
        self.midi_out_fifo.push_events(midi, internal as u32);

        let wet_gain_now = if self.harmony_bypassed { 0.0 } else { self.wet_gain };
        self.wet_buffer.apply_gain_ramp(self.prev_wet_gain, wet_gain_now);
        self.prev_wet_gain = wet_gain_now;

        self.mixer.mix_wet(&mut self.wet_buffer);

        // master output gain
        self.wet_buffer
            .apply_gain_ramp(self.prev_output_gain, self.output_gain);
        self.prev_output_gain = self.output_gain;

        if self.limiter_on {
            let (left, right) = self.wet_buffer.channels_mut();
            self.limiter.process_block(left, right);
        }

        self.output_fifo_l.push(&self.wet_buffer.left()[..internal]);
        self.output_fifo_r.push(&self.wet_buffer.right()[..internal]);
    }
}

impl<S: Sample> Default for Engine<S> {
    fn default() -> Self {
        Self::new()
    }
}
