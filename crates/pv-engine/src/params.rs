//! The host-facing parameter bank
//!
//! Every parameter lives in a word-sized atomic with a single writer (the
//! control thread) and a single reader (the audio thread). The audio thread
//! takes one [`ParamSnapshot`] per host block, so all changes within a block
//! are observed together and no sample-accurate automation exists.

use pv_core::{AtomicInt, AtomicParam, AtomicToggle};

/// Atomic parameter storage shared between the control and audio threads.
pub struct ParameterBank {
    pub main_bypass: AtomicToggle,
    pub lead_bypass: AtomicToggle,
    pub harmony_bypass: AtomicToggle,

    /// Dry vox pan, 0..=127
    pub dry_pan: AtomicInt,
    /// Dry/wet in percent wet, 0..=100
    pub dry_wet: AtomicInt,
    /// Input gain in dB, -60..=0
    pub input_gain_db: AtomicParam,
    /// Output gain in dB, -60..=0
    pub output_gain_db: AtomicParam,

    /// ADSR segment times in seconds (sustain is a level)
    pub adsr_attack: AtomicParam,
    pub adsr_decay: AtomicParam,
    pub adsr_sustain: AtomicParam,
    pub adsr_release: AtomicParam,
    pub adsr_on: AtomicToggle,

    /// Stereo width, 0..=100
    pub stereo_width: AtomicInt,
    /// Notes below this always pan center, 0..=127
    pub lowest_panned_note: AtomicInt,

    /// MIDI velocity sensitivity, 0..=100
    pub velocity_sensitivity: AtomicInt,
    /// Pitch bend ranges in semitones, 0..=12
    pub pitch_bend_up: AtomicInt,
    pub pitch_bend_down: AtomicInt,
    /// Concert pitch (A4) in Hz, 392..=494
    pub concert_pitch_hz: AtomicInt,
    pub voice_stealing: AtomicToggle,
    pub aftertouch_gain: AtomicToggle,
    pub midi_latch: AtomicToggle,
    pub interval_latch: AtomicToggle,

    pub pedal_pitch_on: AtomicToggle,
    pub pedal_pitch_thresh: AtomicInt,
    pub pedal_pitch_interval: AtomicInt,

    pub descant_on: AtomicToggle,
    pub descant_thresh: AtomicInt,
    pub descant_interval: AtomicInt,

    pub limiter_on: AtomicToggle,
    pub limiter_thresh_db: AtomicParam,
    pub limiter_release_ms: AtomicParam,

    /// Vocal range preset index (see `VocalRange::from_index`)
    pub vocal_range: AtomicInt,

    /// Voice pool size; applied when processing is (re)prepared
    pub num_voices: AtomicInt,
    /// Modulator source index (0 = left, 1 = right, 2 = mix)
    pub modulator_source: AtomicInt,
}

impl Default for ParameterBank {
    fn default() -> Self {
        Self {
            main_bypass: AtomicToggle::new(false),
            lead_bypass: AtomicToggle::new(false),
            harmony_bypass: AtomicToggle::new(false),
            dry_pan: AtomicInt::new(64),
            dry_wet: AtomicInt::new(100),
            input_gain_db: AtomicParam::new(0.0),
            output_gain_db: AtomicParam::new(-4.0),
            adsr_attack: AtomicParam::new(0.035),
            adsr_decay: AtomicParam::new(0.06),
            adsr_sustain: AtomicParam::new(0.8),
            adsr_release: AtomicParam::new(0.1),
            adsr_on: AtomicToggle::new(true),
            stereo_width: AtomicInt::new(100),
            lowest_panned_note: AtomicInt::new(0),
            velocity_sensitivity: AtomicInt::new(100),
            pitch_bend_up: AtomicInt::new(2),
            pitch_bend_down: AtomicInt::new(2),
            concert_pitch_hz: AtomicInt::new(440),
            voice_stealing: AtomicToggle::new(false),
            aftertouch_gain: AtomicToggle::new(true),
            midi_latch: AtomicToggle::new(false),
            interval_latch: AtomicToggle::new(false),
            pedal_pitch_on: AtomicToggle::new(false),
            pedal_pitch_thresh: AtomicInt::new(0),
            pedal_pitch_interval: AtomicInt::new(12),
            descant_on: AtomicToggle::new(false),
            descant_thresh: AtomicInt::new(127),
            descant_interval: AtomicInt::new(12),
            limiter_on: AtomicToggle::new(true),
            limiter_thresh_db: AtomicParam::new(-0.3),
            limiter_release_ms: AtomicParam::new(35.0),
            vocal_range: AtomicInt::new(0),
            num_voices: AtomicInt::new(4),
            modulator_source: AtomicInt::new(0),
        }
    }
}

impl ParameterBank {
    pub fn new() -> Self {
        Self::default()
    }

    /// One coherent per-block view of every parameter.
    pub fn snapshot(&self) -> ParamSnapshot {
        ParamSnapshot {
            main_bypass: self.main_bypass.get(),
            lead_bypass: self.lead_bypass.get(),
            harmony_bypass: self.harmony_bypass.get(),
            dry_pan: self.dry_pan.get().min(127) as u8,
            dry_wet: self.dry_wet.get().min(100),
            input_gain_db: self.input_gain_db.get().clamp(-60.0, 0.0),
            output_gain_db: self.output_gain_db.get().clamp(-60.0, 0.0),
            adsr_attack: self.adsr_attack.get(),
            adsr_decay: self.adsr_decay.get(),
            adsr_sustain: self.adsr_sustain.get(),
            adsr_release: self.adsr_release.get(),
            adsr_on: self.adsr_on.get(),
            stereo_width: self.stereo_width.get().min(100) as u8,
            lowest_panned_note: self.lowest_panned_note.get().min(127) as u8,
            velocity_sensitivity: self.velocity_sensitivity.get().min(100) as u8,
            pitch_bend_up: self.pitch_bend_up.get().min(12) as u8,
            pitch_bend_down: self.pitch_bend_down.get().min(12) as u8,
            concert_pitch_hz: self.concert_pitch_hz.get().clamp(392, 494) as u16,
            voice_stealing: self.voice_stealing.get(),
            aftertouch_gain: self.aftertouch_gain.get(),
            midi_latch: self.midi_latch.get(),
            interval_latch: self.interval_latch.get(),
            pedal_pitch_on: self.pedal_pitch_on.get(),
            pedal_pitch_thresh: self.pedal_pitch_thresh.get().min(127) as u8,
            pedal_pitch_interval: self.pedal_pitch_interval.get().clamp(1, 12) as u8,
            descant_on: self.descant_on.get(),
            descant_thresh: self.descant_thresh.get().min(127) as u8,
            descant_interval: self.descant_interval.get().clamp(1, 12) as u8,
            limiter_on: self.limiter_on.get(),
            limiter_thresh_db: self.limiter_thresh_db.get(),
            limiter_release_ms: self.limiter_release_ms.get(),
            vocal_range: self.vocal_range.get(),
            num_voices: self.num_voices.get().max(1) as usize,
            modulator_source: self.modulator_source.get(),
        }
    }
}

/// Plain per-block parameter values, read once at block start.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParamSnapshot {
    pub main_bypass: bool,
    pub lead_bypass: bool,
    pub harmony_bypass: bool,
    pub dry_pan: u8,
    pub dry_wet: u32,
    pub input_gain_db: f64,
    pub output_gain_db: f64,
    pub adsr_attack: f64,
    pub adsr_decay: f64,
    pub adsr_sustain: f64,
    pub adsr_release: f64,
    pub adsr_on: bool,
    pub stereo_width: u8,
    pub lowest_panned_note: u8,
    pub velocity_sensitivity: u8,
    pub pitch_bend_up: u8,
    pub pitch_bend_down: u8,
    pub concert_pitch_hz: u16,
    pub voice_stealing: bool,
    pub aftertouch_gain: bool,
    pub midi_latch: bool,
    pub interval_latch: bool,
    pub pedal_pitch_on: bool,
    pub pedal_pitch_thresh: u8,
    pub pedal_pitch_interval: u8,
    pub descant_on: bool,
    pub descant_thresh: u8,
    pub descant_interval: u8,
    pub limiter_on: bool,
    pub limiter_thresh_db: f64,
    pub limiter_release_ms: f64,
    pub vocal_range: u32,
    pub num_voices: usize,
    pub modulator_source: u32,
}
