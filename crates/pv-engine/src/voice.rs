//! A single pitch-shifting synthesis voice
//!
//! Each voice resynthesizes the shared analyzer's grains at its own target
//! frequency, shapes the result with an ADSR envelope, and mixes its stereo
//! contribution additively into the harmonizer's wet output.

use pv_core::{MonoBuffer, Sample, StereoBuffer};
use pv_dsp::envelope::Adsr;
use pv_dsp::panning::pan_gains;
use pv_dsp::psola::{PsolaAnalyzer, PsolaShifter};

/// Automation role of a voice. At most one active voice carries each of the
/// non-Normal roles at any moment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VoiceRole {
    #[default]
    Normal,
    PedalPitch,
    Descant,
}

/// Per-render settings shared by all voices, latched by the harmonizer.
#[derive(Debug, Clone, Copy)]
pub struct VoiceRenderParams {
    pub soft_pedal_down: bool,
    pub soft_pedal_gain: f64,
    pub playing_but_released_gain: f64,
    pub aftertouch_gain_on: bool,
    pub adsr_on: bool,
}

pub struct HarmonizerVoice<S: Sample> {
    active: bool,
    playing_note: u8,
    key_down: bool,
    note_on_time: u64,
    role: VoiceRole,
    pan: u8,
    current_gain_l: S,
    current_gain_r: S,
    last_velocity: f32,
    velocity_gain: f32,
    aftertouch: u8,
    releasing: bool,
    just_finished: bool,
    adsr_on: bool,
    envelope: Adsr,
    shifter: PsolaShifter<S>,
    current_output_freq: f64,
    scratch: MonoBuffer<S>,
    sample_rate: f64,
}

impl<S: Sample> HarmonizerVoice<S> {
    pub fn new(sample_rate: f64) -> Self {
        let (center_l, center_r) = pan_gains::<S>(64);
        Self {
            active: false,
            playing_note: 0,
            key_down: false,
            note_on_time: 0,
            role: VoiceRole::Normal,
            pan: 64,
            current_gain_l: center_l,
            current_gain_r: center_r,
            last_velocity: 0.0,
            velocity_gain: 1.0,
            aftertouch: 0,
            releasing: false,
            just_finished: false,
            adsr_on: true,
            envelope: Adsr::new(sample_rate),
            shifter: PsolaShifter::new(),
            current_output_freq: 0.0,
            scratch: MonoBuffer::new(0),
            sample_rate,
        }
    }

    /// Allocate render scratch for a block size and pitch range.
    /// Control thread only.
    pub fn prepare(&mut self, sample_rate: f64, blocksize: usize, max_period: usize) {
        self.sample_rate = sample_rate;
        self.envelope.set_sample_rate(sample_rate);
        self.scratch.resize(blocksize);
        self.shifter.prepare(max_period);
    }

    pub fn reset(&mut self) {
        self.active = false;
        self.releasing = false;
        self.just_finished = false;
        self.key_down = false;
        self.role = VoiceRole::Normal;
        self.aftertouch = 0;
        self.envelope.reset();
        self.shifter.reset();
    }

    // ── note lifecycle ─────────────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    pub fn start_note(
        &mut self,
        pitch: u8,
        velocity: f32,
        velocity_gain: f32,
        note_on_time: u64,
        key_down: bool,
        role: VoiceRole,
        quick_attack: bool,
    ) {
        self.playing_note = pitch;
        self.last_velocity = velocity;
        self.velocity_gain = velocity_gain;
        self.note_on_time = note_on_time;
        self.key_down = key_down;
        self.role = role;
        self.aftertouch = 0;
        self.releasing = false;
        self.just_finished = false;
        self.active = true;

        if !self.adsr_on {
            self.envelope.snap_to(1.0);
        }
        self.envelope.note_on(quick_attack);
    }

    /// Enter the release phase, or silence at once when no tail-off is
    /// allowed. A killed voice frees its pool slot immediately so a
    /// replacement note can claim it within the same event batch.
    pub fn stop_note(&mut self, _velocity: f32, allow_tail_off: bool) {
        if !self.active {
            return;
        }

        if !allow_tail_off {
            self.envelope.reset();
            self.active = false;
            self.releasing = false;
            self.just_finished = true;
            return;
        }

        if !self.adsr_on && !self.envelope.is_releasing() {
            self.envelope.snap_to(1.0);
        }

        // with the envelope bypassed the tail is the quick-release ramp
        self.envelope.note_off(self.adsr_on);
        self.releasing = true;
    }

    // ── state accessors ────────────────────────────────────────────────────

    #[inline]
    pub fn is_active(&self) -> bool {
        self.active
    }

    #[inline]
    pub fn playing_note(&self) -> u8 {
        self.playing_note
    }

    #[inline]
    pub fn is_key_down(&self) -> bool {
        self.key_down
    }

    pub fn set_key_down(&mut self, down: bool) {
        self.key_down = down;
    }

    #[inline]
    pub fn note_on_time(&self) -> u64 {
        self.note_on_time
    }

    #[inline]
    pub fn role(&self) -> VoiceRole {
        self.role
    }

    pub fn set_role(&mut self, role: VoiceRole) {
        self.role = role;
    }

    #[inline]
    pub fn pan(&self) -> u8 {
        self.pan
    }

    /// New pan target; gains glide there over the next rendered block.
    pub fn set_pan(&mut self, pan: u8) {
        self.pan = pan.min(127);
    }

    #[inline]
    pub fn last_velocity(&self) -> f32 {
        self.last_velocity
    }

    #[inline]
    pub fn aftertouch(&self) -> u8 {
        self.aftertouch
    }

    pub fn set_aftertouch(&mut self, value: u8) {
        self.aftertouch = value.min(127);
    }

    #[inline]
    pub fn is_releasing(&self) -> bool {
        self.releasing
    }

    #[inline]
    pub fn envelope_level(&self) -> f64 {
        if self.active {
            self.envelope.level()
        } else {
            0.0
        }
    }

    #[inline]
    pub fn current_output_freq(&self) -> f64 {
        self.current_output_freq
    }

    pub fn set_current_output_freq(&mut self, freq_hz: f64) {
        self.current_output_freq = freq_hz;
    }

    pub fn set_adsr_parameters(&mut self, attack: f64, decay: f64, sustain: f64, release: f64) {
        self.envelope.set_parameters(attack, decay, sustain, release);
    }

    pub fn set_adsr_on(&mut self, on: bool) {
        self.adsr_on = on;
    }

    pub fn set_quick_attack_ms(&mut self, ms: f64) {
        self.envelope.set_quick_attack_ms(ms);
    }

    pub fn set_quick_release_ms(&mut self, ms: f64) {
        self.envelope.set_quick_release_ms(ms);
    }

    /// True exactly once, on the render where the release tail finished.
    pub fn take_just_finished(&mut self) -> bool {
        std::mem::take(&mut self.just_finished)
    }

    // ── rendering ──────────────────────────────────────────────────────────

    /// Mix this voice's contribution additively into `out`.
    pub fn render_next_block(
        &mut self,
        analyzer: &PsolaAnalyzer<S>,
        params: &VoiceRenderParams,
        out: &mut StereoBuffer<S>,
    ) {
        if !self.active {
            return;
        }

        let num_samples = out.len().min(self.scratch.len());
        if num_samples == 0 || self.current_output_freq <= 0.0 {
            return;
        }

        let target_period = self.sample_rate / self.current_output_freq;
        self.shifter
            .render(analyzer, target_period, &mut self.scratch.samples_mut()[..num_samples]);

        let (target_l, target_r) = pan_gains::<S>(self.pan);
        let step = S::from_f64(1.0 / num_samples as f64);
        let delta_l = (target_l - self.current_gain_l) * step;
        let delta_r = (target_r - self.current_gain_r) * step;
        let mut gain_l = self.current_gain_l;
        let mut gain_r = self.current_gain_r;

        let mut static_gain = self.velocity_gain as f64;
        if params.soft_pedal_down {
            static_gain *= params.soft_pedal_gain;
        }
        if self.releasing {
            static_gain *= params.playing_but_released_gain;
        }
        if params.aftertouch_gain_on && self.aftertouch > 0 {
            static_gain *= 1.0 + (self.aftertouch as f64 / 127.0) * 0.5;
        }
        let static_gain = S::from_f64(static_gain);

        let (left, right) = out.channels_mut();
        for i in 0..num_samples {
            let env = self.envelope.next_gain();
            let env_gain = if params.adsr_on || self.releasing {
                S::from_f64(env)
            } else {
                S::one()
            };

            let sample = self.scratch.samples()[i] * env_gain * static_gain;
            left[i] += sample * gain_l;
            right[i] += sample * gain_r;

            gain_l = gain_l + delta_l;
            gain_r = gain_r + delta_r;
        }

        self.current_gain_l = target_l;
        self.current_gain_r = target_r;

        if self.releasing && !self.envelope.is_active() {
            self.active = false;
            self.releasing = false;
            self.just_finished = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SR: f64 = 48_000.0;
    const BLOCK: usize = 1024;

    fn prepared_voice() -> HarmonizerVoice<f64> {
        let mut voice = HarmonizerVoice::new(SR);
        voice.prepare(SR, BLOCK, 600);
        voice
    }

    fn prepared_analyzer() -> PsolaAnalyzer<f64> {
        let mut analyzer = PsolaAnalyzer::new();
        analyzer.prepare(BLOCK, 40, 600);
        let input: Vec<f64> = (0..BLOCK)
            .map(|i| (std::f64::consts::TAU * 220.0 * i as f64 / SR).sin())
            .collect();
        analyzer.analyze(&input, Some(SR / 220.0));
        analyzer
    }

    fn render_params() -> VoiceRenderParams {
        VoiceRenderParams {
            soft_pedal_down: false,
            soft_pedal_gain: 0.65,
            playing_but_released_gain: 0.4,
            aftertouch_gain_on: false,
            adsr_on: true,
        }
    }

    #[test]
    fn test_inactive_voice_renders_nothing() {
        let mut voice = prepared_voice();
        let analyzer = prepared_analyzer();
        let mut out = StereoBuffer::new(BLOCK);

        voice.render_next_block(&analyzer, &render_params(), &mut out);
        assert!(out.left().iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_active_voice_produces_sound() {
        let mut voice = prepared_voice();
        let analyzer = prepared_analyzer();
        let mut out = StereoBuffer::new(BLOCK);

        voice.start_note(57, 0.8, 0.8, 1, true, VoiceRole::Normal, false);
        voice.set_current_output_freq(220.0);
        voice.render_next_block(&analyzer, &render_params(), &mut out);

        let energy: f64 = out.left().iter().map(|s| s * s).sum();
        assert!(energy > 0.0);
        assert!(voice.is_active());
    }

    #[test]
    fn test_voice_deactivates_after_release_tail() {
        let mut voice = prepared_voice();
        voice.set_adsr_parameters(0.001, 0.01, 1.0, 0.005);
        let analyzer = prepared_analyzer();
        let mut out = StereoBuffer::new(BLOCK);

        voice.start_note(57, 1.0, 1.0, 1, true, VoiceRole::Normal, false);
        voice.set_current_output_freq(220.0);
        voice.render_next_block(&analyzer, &render_params(), &mut out);

        voice.stop_note(0.0, true);
        assert!(voice.is_releasing());

        // release is 5 ms; two blocks is more than enough
        voice.render_next_block(&analyzer, &render_params(), &mut out);
        voice.render_next_block(&analyzer, &render_params(), &mut out);

        assert!(!voice.is_active());
        assert!(voice.take_just_finished());
        assert!(!voice.take_just_finished());
        assert_eq!(voice.envelope_level(), 0.0);
    }

    #[test]
    fn test_hard_pan_goes_to_one_channel() {
        let mut voice = prepared_voice();
        let analyzer = prepared_analyzer();
        let mut out = StereoBuffer::new(BLOCK);

        voice.start_note(57, 1.0, 1.0, 1, true, VoiceRole::Normal, false);
        voice.set_current_output_freq(220.0);
        voice.set_pan(127);

        // first block glides toward the target, second block is settled
        voice.render_next_block(&analyzer, &render_params(), &mut out);
        out.clear();
        voice.render_next_block(&analyzer, &render_params(), &mut out);

        let left_energy: f64 = out.left().iter().map(|s| s * s).sum();
        let right_energy: f64 = out.right().iter().map(|s| s * s).sum();
        assert!(right_energy > left_energy * 100.0);
    }

    #[test]
    fn test_releasing_voice_is_attenuated() {
        let mut voice = prepared_voice();
        voice.set_adsr_parameters(0.001, 0.01, 1.0, 1.0);
        let analyzer = prepared_analyzer();

        voice.start_note(57, 1.0, 1.0, 1, true, VoiceRole::Normal, false);
        voice.set_current_output_freq(220.0);

        let mut out = StereoBuffer::new(BLOCK);
        voice.render_next_block(&analyzer, &render_params(), &mut out);
        let held: f64 = out.left().iter().map(|s| s * s).sum();

        voice.stop_note(0.0, true);
        out.clear();
        voice.render_next_block(&analyzer, &render_params(), &mut out);
        let released: f64 = out.left().iter().map(|s| s * s).sum();

        // the 0.4 playing-but-released multiplier should clearly show up
        assert!(released < held * 0.5, "released {released} vs held {held}");
    }
}
