//! The polyphonic harmonizer core
//!
//! Owns the voice pool and implements the complete MIDI note lifecycle:
//! keyboard note on/off with optional voice stealing, the latch and
//! interval-latch modes, the automated pedal pitch and descant notes,
//! sustain/sostenuto/soft pedals, pitch wheel, and aftertouch. Every MIDI
//! event the harmonizer produces is collected into an aggregate buffer with
//! strictly increasing timestamps and handed back to the caller per block.

use pv_core::{
    cc, MidiBuffer, MidiEvent, MidiEventData, PitchBendTracker, PitchConverter, Sample,
    StereoBuffer, VelocityTracker,
};
use pv_dsp::panning::PanningManager;
use pv_dsp::pitch::{PitchDetector, VocalRange};
use pv_dsp::psola::PsolaAnalyzer;

use crate::voice::{HarmonizerVoice, VoiceRenderParams, VoiceRole};

/// Gain applied to voices still sounding after their note logically ended.
pub const PLAYING_BUT_RELEASED_GAIN: f64 = 0.4;

/// Gain applied while the soft pedal is held.
pub const SOFT_PEDAL_GAIN: f64 = 0.65;

/// Sentinel stored while the input is unpitched.
const UNPITCHED: f64 = -1.0;

/// State of one automated note source (pedal pitch or descant).
#[derive(Debug, Clone, Copy)]
pub struct AutomatedNote {
    pub enabled: bool,
    pub threshold: u8,
    pub interval: u8,
    pub last_pitch: Option<u8>,
}

impl AutomatedNote {
    fn new(threshold: u8) -> Self {
        Self {
            enabled: false,
            threshold,
            interval: 12,
            last_pitch: None,
        }
    }
}

pub struct Harmonizer<S: Sample> {
    voices: Vec<HarmonizerVoice<S>>,
    detector: PitchDetector<S>,
    analyzer: PsolaAnalyzer<S>,
    panner: PanningManager,
    converter: PitchConverter,
    bend: PitchBendTracker,
    velocity_tracker: VelocityTracker,

    pedal: AutomatedNote,
    descant: AutomatedNote,

    latch_on: bool,
    interval_latch_on: bool,
    intervals_latched: Vec<i32>,

    sustain_pedal_down: bool,
    sostenuto_pedal_down: bool,
    soft_pedal_down: bool,

    current_input_freq: f64,
    last_midi_channel: u8,
    note_on_counter: u64,
    last_midi_timestamp: i64,
    lowest_panned_note: u8,

    steal_on: bool,
    adsr_on: bool,
    aftertouch_gain_on: bool,
    soft_pedal_gain: f64,
    playing_but_released_gain: f64,

    aggregate_midi: MidiBuffer,
    sample_rate: f64,
    blocksize: usize,

    scratch_notes: Vec<u8>,
    scratch_notes_b: Vec<u8>,
    scratch_changing: Vec<u8>,
    scratch_indices: Vec<usize>,
}

impl<S: Sample> Harmonizer<S> {
    pub fn new(num_voices: usize, sample_rate: f64) -> Self {
        let (min_hz, max_hz) = VocalRange::default().hz_range();
        let detector = PitchDetector::new(min_hz, max_hz, sample_rate)
            .expect("vocal range presets are valid");

        let mut panner = PanningManager::new();
        panner.set_num_voices(num_voices.max(1));

        Self {
            voices: (0..num_voices.max(1))
                .map(|_| HarmonizerVoice::new(sample_rate))
                .collect(),
            detector,
            analyzer: PsolaAnalyzer::new(),
            panner,
            converter: PitchConverter::new(),
            bend: PitchBendTracker::new(),
            velocity_tracker: VelocityTracker::new(),
            pedal: AutomatedNote::new(0),
            descant: AutomatedNote::new(127),
            latch_on: false,
            interval_latch_on: false,
            intervals_latched: Vec::with_capacity(16),
            sustain_pedal_down: false,
            sostenuto_pedal_down: false,
            soft_pedal_down: false,
            current_input_freq: UNPITCHED,
            last_midi_channel: 0,
            note_on_counter: 0,
            last_midi_timestamp: -1,
            lowest_panned_note: 0,
            steal_on: false,
            adsr_on: true,
            aftertouch_gain_on: true,
            soft_pedal_gain: SOFT_PEDAL_GAIN,
            playing_but_released_gain: PLAYING_BUT_RELEASED_GAIN,
            aggregate_midi: MidiBuffer::new(),
            sample_rate,
            blocksize: 0,
            scratch_notes: Vec::with_capacity(32),
            scratch_notes_b: Vec::with_capacity(32),
            scratch_changing: Vec::with_capacity(32),
            scratch_indices: Vec::with_capacity(32),
        }
    }

    /// Propagate a sample-rate change to the pitch detector so
    /// [`latency_samples`](Self::latency_samples) reflects the new rate.
    pub fn set_sample_rate(&mut self, sample_rate: f64) {
        self.sample_rate = sample_rate;
        self.detector.set_sample_rate(sample_rate);
    }

    /// Allocate every per-block resource. Control thread only; the block
    /// size here is the engine's fixed internal block size.
    pub fn prepare(&mut self, sample_rate: f64, blocksize: usize) {
        self.sample_rate = sample_rate;
        self.blocksize = blocksize;
        self.detector.set_sample_rate(sample_rate);
        self.analyzer
            .prepare(blocksize, self.detector.min_period(), self.detector.max_period());

        let max_period = self.detector.max_period();
        for voice in &mut self.voices {
            voice.prepare(sample_rate, blocksize, max_period);
        }
    }

    pub fn reset(&mut self) {
        self.all_notes_off(false);
        for voice in &mut self.voices {
            voice.reset();
        }
        self.detector.reset();
        self.analyzer.reset();
        self.current_input_freq = UNPITCHED;
        self.aggregate_midi.clear();
        self.last_midi_timestamp = -1;
    }

    /// One internal block of latency: the pitch detector's analysis window.
    pub fn latency_samples(&self) -> usize {
        self.detector.latency()
    }

    // ── pool management (control thread, host suspended) ───────────────────

    pub fn num_voices(&self) -> usize {
        self.voices.len()
    }

    pub fn set_num_voices(&mut self, num_voices: usize) {
        let num_voices = num_voices.max(1);
        if num_voices == self.voices.len() {
            return;
        }

        if num_voices < self.voices.len() {
            for voice in &mut self.voices[num_voices..] {
                voice.reset();
            }
            self.voices.truncate(num_voices);
        } else {
            let max_period = self.detector.max_period();
            while self.voices.len() < num_voices {
                let mut voice = HarmonizerVoice::new(self.sample_rate);
                if self.blocksize > 0 {
                    voice.prepare(self.sample_rate, self.blocksize, max_period);
                }
                self.voices.push(voice);
            }
        }

        self.panner.set_num_voices(num_voices);
    }

    // ── introspection ──────────────────────────────────────────────────────

    pub fn voices(&self) -> &[HarmonizerVoice<S>] {
        &self.voices
    }

    pub fn pedal(&self) -> &AutomatedNote {
        &self.pedal
    }

    pub fn descant(&self) -> &AutomatedNote {
        &self.descant
    }

    pub fn is_latched(&self) -> bool {
        self.latch_on
    }

    pub fn is_interval_latched(&self) -> bool {
        self.interval_latch_on
    }

    pub fn intervals_latched(&self) -> &[i32] {
        &self.intervals_latched
    }

    pub fn is_sustain_pedal_down(&self) -> bool {
        self.sustain_pedal_down
    }

    pub fn current_input_freq(&self) -> f64 {
        self.current_input_freq
    }

    fn current_input_midi(&self) -> Option<i32> {
        if self.current_input_freq > 0.0 {
            Some(self.converter.hz_to_midi(self.current_input_freq).round() as i32)
        } else {
            None
        }
    }

    // ── parameter updates (control thread, between blocks) ─────────────────

    pub fn set_adsr_parameters(&mut self, attack: f64, decay: f64, sustain: f64, release: f64) {
        for voice in &mut self.voices {
            voice.set_adsr_parameters(attack, decay, sustain, release);
        }
    }

    pub fn set_adsr_on(&mut self, on: bool) {
        self.adsr_on = on;
        for voice in &mut self.voices {
            voice.set_adsr_on(on);
        }
    }

    pub fn set_quick_attack_ms(&mut self, ms: f64) {
        for voice in &mut self.voices {
            voice.set_quick_attack_ms(ms);
        }
    }

    pub fn set_quick_release_ms(&mut self, ms: f64) {
        for voice in &mut self.voices {
            voice.set_quick_release_ms(ms);
        }
    }

    pub fn set_stereo_width(&mut self, width: u8) {
        self.panner.set_stereo_width(width);
    }

    pub fn set_lowest_panned_note(&mut self, note: u8) {
        self.lowest_panned_note = note.min(127);
    }

    pub fn set_velocity_sensitivity(&mut self, sensitivity: u8) {
        self.velocity_tracker.set_sensitivity(sensitivity);
    }

    pub fn set_pitch_bend_range(&mut self, up: u8, down: u8) {
        self.bend.set_range(up, down);
        self.refresh_output_frequencies();
    }

    pub fn set_concert_pitch(&mut self, hz: u16) {
        self.converter.set_concert_pitch(hz);
        self.refresh_output_frequencies();
    }

    pub fn set_note_stealing(&mut self, enabled: bool) {
        self.steal_on = enabled;
    }

    pub fn set_aftertouch_gain_on(&mut self, on: bool) {
        self.aftertouch_gain_on = on;
    }

    pub fn set_soft_pedal_gain(&mut self, gain: f64) {
        self.soft_pedal_gain = gain.clamp(0.0, 1.0);
    }

    pub fn set_playing_but_released_gain(&mut self, gain: f64) {
        self.playing_but_released_gain = gain.clamp(0.0, 1.0);
    }

    pub fn set_pedal_pitch(&mut self, enabled: bool, threshold: u8, interval: u8) {
        if self.pedal.enabled && !enabled {
            if let Some(last) = self.pedal.last_pitch {
                self.note_off(last, 1.0, false, false);
            }
        }
        self.pedal.enabled = enabled;
        self.pedal.threshold = threshold.min(127);
        self.pedal.interval = interval.clamp(1, 12);
    }

    pub fn set_descant(&mut self, enabled: bool, threshold: u8, interval: u8) {
        if self.descant.enabled && !enabled {
            if let Some(last) = self.descant.last_pitch {
                self.note_off(last, 1.0, false, false);
            }
        }
        self.descant.enabled = enabled;
        self.descant.threshold = threshold.min(127);
        self.descant.interval = interval.clamp(1, 12);
    }

    /// Change the pitch detection range. The engine must re-derive its
    /// internal block size from [`latency_samples`](Self::latency_samples)
    /// and call [`prepare`](Self::prepare) afterwards.
    pub fn set_pitch_detection_range(&mut self, min_hz: f64, max_hz: f64) {
        self.detector.set_hz_range(min_hz, max_hz);
    }

    pub fn set_vocal_range(&mut self, range: VocalRange) {
        let (min_hz, max_hz) = range.hz_range();
        self.set_pitch_detection_range(min_hz, max_hz);
    }

    fn refresh_output_frequencies(&mut self) {
        for i in 0..self.voices.len() {
            if self.voices[i].is_active() {
                let freq = self.output_frequency(self.voices[i].playing_note());
                self.voices[i].set_current_output_freq(freq);
            }
        }
    }

    /// Target frequency for a note: concert pitch plus the current bend.
    fn output_frequency(&self, note: u8) -> f64 {
        self.converter.midi_to_hz(self.bend.note_with_bend(note))
    }

    // ── MIDI output aggregation ────────────────────────────────────────────

    fn next_timestamp(&mut self) -> u32 {
        self.last_midi_timestamp += 1;
        self.last_midi_timestamp.max(0) as u32
    }

    fn emit(&mut self, data: MidiEventData) {
        let sample_offset = self.next_timestamp();
        self.aggregate_midi.push(MidiEvent {
            sample_offset,
            channel: self.last_midi_channel,
            data,
        });
    }

    // ── voice queries ──────────────────────────────────────────────────────

    fn voice_playing_note(&self, note: u8) -> Option<usize> {
        self.voices
            .iter()
            .position(|v| v.is_active() && v.playing_note() == note)
    }

    fn current_role_voice(&self, role: VoiceRole) -> Option<usize> {
        self.voices
            .iter()
            .position(|v| v.is_active() && v.role() == role)
    }

    fn is_pitch_active(&self, pitch: u8, count_released: bool, count_key_up: bool) -> bool {
        self.voices.iter().any(|v| {
            v.is_active()
                && v.playing_note() == pitch
                && (count_released || !v.is_releasing())
                && (count_key_up || v.is_key_down())
        })
    }

    fn report_active_notes(&self, out: &mut Vec<u8>, include_released: bool, include_key_up: bool) {
        out.clear();
        for voice in &self.voices {
            if voice.is_active()
                && (include_released || !voice.is_releasing())
                && (include_key_up || voice.is_key_down())
            {
                out.push(voice.playing_note());
            }
        }
        out.sort_unstable();
    }

    /// Free-voice selection. Preference order: an inactive voice, then a
    /// releasing voice whose key is up, then the oldest key-up voice, then
    /// (keyboard stealing only) the oldest voice overall.
    fn find_free_voice(&self, stealing: bool) -> Option<usize> {
        if let Some(index) = self.voices.iter().position(|v| !v.is_active()) {
            return Some(index);
        }

        if !stealing {
            return None;
        }

        let oldest = |indices: &mut dyn Iterator<Item = usize>| -> Option<usize> {
            indices.min_by_key(|&i| self.voices[i].note_on_time())
        };

        let releasing_key_up = oldest(
            &mut (0..self.voices.len())
                .filter(|&i| self.voices[i].is_releasing() && !self.voices[i].is_key_down()),
        );
        if releasing_key_up.is_some() {
            return releasing_key_up;
        }

        let key_up = oldest(&mut (0..self.voices.len()).filter(|&i| !self.voices[i].is_key_down()));
        if key_up.is_some() {
            return key_up;
        }

        oldest(&mut (0..self.voices.len()))
    }

    // ── note events ────────────────────────────────────────────────────────

    /// Start (or retrigger) a note. `is_keyboard` is true when the event
    /// came from the plugin's MIDI input and false for automated notes
    /// (pedal pitch, descant, interval latch), which never steal.
    pub fn note_on(&mut self, pitch: u8, velocity: f32, is_keyboard: bool) {
        let target = match self.voice_playing_note(pitch) {
            Some(index) => Some(index),
            None => self.find_free_voice(is_keyboard && self.steal_on),
        };

        self.start_voice(target, pitch, velocity, is_keyboard);
    }

    fn start_voice(&mut self, voice: Option<usize>, pitch: u8, velocity: f32, is_keyboard: bool) {
        let Some(index) = voice else {
            // a note on was requested but no voice could be found or stolen
            if self.pedal.enabled && self.pedal.last_pitch == Some(pitch) {
                self.pedal.last_pitch = None;
            }
            if self.descant.enabled && self.descant.last_pitch == Some(pitch) {
                self.descant.last_pitch = None;
            }
            return;
        };

        let prev_note = self.voices[index].playing_note();
        let was_stolen = self.voices[index].is_active();
        let same_note_retrigger = was_stolen && prev_note == pitch;

        if !same_note_retrigger {
            if was_stolen {
                self.emit(MidiEventData::NoteOff {
                    note: prev_note,
                    velocity: 127,
                });
            }
            self.emit(MidiEventData::NoteOn {
                note: pitch,
                velocity: float_to_velocity(velocity),
            });
        }

        if pitch < self.lowest_panned_note {
            if was_stolen {
                let pan = self.voices[index].pan();
                self.panner.pan_turned_off(pan);
            }
            self.voices[index].set_pan(64);
        } else if !was_stolen {
            let pan = self.panner.next_pan();
            self.voices[index].set_pan(pan);
        }

        let role = if self.pedal.enabled && self.pedal.last_pitch == Some(pitch) {
            VoiceRole::PedalPitch
        } else if self.descant.enabled && self.descant.last_pitch == Some(pitch) {
            VoiceRole::Descant
        } else {
            VoiceRole::Normal
        };

        // a same-note retrigger keeps its original timestamp
        let timestamp = if same_note_retrigger {
            self.voices[index].note_on_time()
        } else {
            self.note_on_counter += 1;
            self.note_on_counter
        };

        let key_down = if is_keyboard {
            true
        } else {
            self.voices[index].is_key_down()
        };

        let velocity_gain = self.velocity_tracker.gain_for(velocity);
        self.voices[index].start_note(
            pitch,
            velocity,
            velocity_gain,
            timestamp,
            key_down,
            role,
            was_stolen,
        );

        let freq = self.output_frequency(pitch);
        self.voices[index].set_current_output_freq(freq);
    }

    pub fn note_off(&mut self, note: u8, velocity: f32, allow_tail_off: bool, is_keyboard: bool) {
        let Some(index) = self.voice_playing_note(note) else {
            if self.pedal.enabled && self.pedal.last_pitch == Some(note) {
                self.pedal.last_pitch = None;
            }
            if self.descant.enabled && self.descant.last_pitch == Some(note) {
                self.descant.last_pitch = None;
            }
            return;
        };

        if is_keyboard {
            self.voices[index].set_key_down(false);

            // both latch modes defer keyboard note offs until disengaged
            if self.latch_on || self.interval_latch_on {
                return;
            }

            if !(self.sustain_pedal_down || self.sostenuto_pedal_down) {
                self.stop_voice(index, velocity, allow_tail_off);
            }
        } else {
            // automated note off: only stop the voice if its key isn't held
            if !self.voices[index].is_key_down() {
                self.stop_voice(index, velocity, allow_tail_off);
            } else {
                if self.pedal.enabled && self.pedal.last_pitch == Some(note) {
                    self.pedal.last_pitch = None;
                    self.voices[index].set_role(VoiceRole::Normal);
                    self.voices[index].set_key_down(true);
                }
                if self.descant.enabled && self.descant.last_pitch == Some(note) {
                    self.descant.last_pitch = None;
                    self.voices[index].set_role(VoiceRole::Normal);
                    self.voices[index].set_key_down(true);
                }
            }
        }
    }

    fn stop_voice(&mut self, index: usize, velocity: f32, allow_tail_off: bool) {
        let note = self.voices[index].playing_note();
        self.emit(MidiEventData::NoteOff {
            note,
            velocity: float_to_velocity(velocity),
        });

        match self.voices[index].role() {
            VoiceRole::PedalPitch => self.pedal.last_pitch = None,
            VoiceRole::Descant => self.descant.last_pitch = None,
            VoiceRole::Normal => {}
        }
        self.voices[index].set_role(VoiceRole::Normal);
        self.voices[index].stop_note(velocity, allow_tail_off);

        // a killed voice frees its pool slot at once, so its pan slot must
        // be released now rather than at the end of the render
        if !allow_tail_off && self.voices[index].take_just_finished() {
            let pan = self.voices[index].pan();
            self.panner.pan_turned_off(pan);
        }
    }

    pub fn all_notes_off(&mut self, allow_tail_off: bool) {
        let mut indices = std::mem::take(&mut self.scratch_indices);
        indices.clear();
        indices.extend((0..self.voices.len()).filter(|&i| self.voices[i].is_active()));

        for &index in &indices {
            self.stop_voice(index, 1.0, allow_tail_off);
        }

        indices.clear();
        self.scratch_indices = indices;

        self.panner.reset();
        self.pedal.last_pitch = None;
        self.descant.last_pitch = None;
    }

    fn turn_off_all_keyup_notes(&mut self, allow_tail_off: bool, include_automated: bool) {
        let velocity = if allow_tail_off { 0.0 } else { 1.0 };

        let mut indices = std::mem::take(&mut self.scratch_indices);
        indices.clear();
        indices.extend((0..self.voices.len()).filter(|&i| {
            let v = &self.voices[i];
            v.is_active()
                && !v.is_key_down()
                && (include_automated || v.role() == VoiceRole::Normal)
        }));

        for &index in &indices {
            self.stop_voice(index, velocity, allow_tail_off);
        }

        indices.clear();
        self.scratch_indices = indices;
    }

    // ── latch modes ────────────────────────────────────────────────────────

    /// MIDI latch: while on, keyboard note offs are deferred; the notes are
    /// held silently with `key_down = false` until the latch disengages.
    pub fn set_midi_latch(&mut self, on: bool, allow_tail_off: bool) {
        if self.latch_on == on {
            return;
        }

        self.latch_on = on;

        if on {
            return;
        }

        if !self.interval_latch_on || self.intervals_latched.is_empty() {
            self.turn_off_all_keyup_notes(allow_tail_off, false);
        } else {
            self.turn_off_keyup_notes_outside_interval_latch(allow_tail_off);
        }

        self.pitch_collection_changed();
    }

    /// Turn off key-up voices not being held by the interval latch.
    fn turn_off_keyup_notes_outside_interval_latch(&mut self, allow_tail_off: bool) {
        let Some(current_midi) = self.current_input_midi() else {
            self.turn_off_all_keyup_notes(allow_tail_off, false);
            return;
        };

        let mut latch_notes = std::mem::take(&mut self.scratch_notes);
        latch_notes.clear();
        for &interval in &self.intervals_latched {
            let pitch = current_midi + interval;
            if (0..=127).contains(&pitch) {
                latch_notes.push(pitch as u8);
            }
        }

        let velocity = if allow_tail_off { 0.0 } else { 1.0 };
        let mut indices = std::mem::take(&mut self.scratch_indices);
        indices.clear();
        indices.extend((0..self.voices.len()).filter(|&i| {
            let v = &self.voices[i];
            v.is_active()
                && !v.is_key_down()
                && v.role() == VoiceRole::Normal
                && !latch_notes.contains(&v.playing_note())
        }));

        for &index in &indices {
            self.stop_voice(index, velocity, allow_tail_off);
        }

        indices.clear();
        self.scratch_indices = indices;
        latch_notes.clear();
        self.scratch_notes = latch_notes;
    }

    /// Interval latch: on engage, snapshot the semitone offsets of the
    /// current chord from the input pitch; as the input pitch moves, the
    /// chord follows in parallel.
    pub fn set_interval_latch(&mut self, on: bool, allow_tail_off: bool) {
        if self.interval_latch_on == on {
            return;
        }

        self.interval_latch_on = on;

        if on {
            self.update_intervals_latched();
        } else if !self.latch_on {
            self.turn_off_all_keyup_notes(allow_tail_off, false);
            self.pitch_collection_changed();
        }
    }

    fn update_intervals_latched(&mut self) {
        let Some(current_midi) = self.current_input_midi() else {
            // unpitched input: keep the previous snapshot
            return;
        };

        self.intervals_latched.clear();
        for voice in &self.voices {
            if voice.is_active() && !voice.is_releasing() {
                self.intervals_latched
                    .push(voice.playing_note() as i32 - current_midi);
            }
        }
    }

    /// Retarget the latched intervals at the current input pitch.
    fn play_interval_set(&mut self, velocity: f32, allow_tail_off: bool, is_interval_latch: bool) {
        if self.intervals_latched.is_empty() {
            self.all_notes_off(allow_tail_off);
            return;
        }

        let Some(current_midi) = self.current_input_midi() else {
            return;
        };

        let mut desired = std::mem::take(&mut self.scratch_notes_b);
        desired.clear();
        for &interval in &self.intervals_latched {
            let pitch = current_midi + interval;
            if (0..=127).contains(&pitch) {
                desired.push(pitch as u8);
            }
        }

        self.play_chord_internal(&desired, velocity, allow_tail_off);

        desired.clear();
        self.scratch_notes_b = desired;

        if !is_interval_latch {
            self.pitch_collection_changed();
        }
    }

    /// Ensure that exactly `desired` pitches are playing: note offs for
    /// pitches leaving the set first, then note ons for pitches entering it.
    pub fn play_chord(&mut self, desired: &[u8], velocity: f32, allow_tail_off: bool) {
        self.play_chord_internal(desired, velocity, allow_tail_off);
        self.pitch_collection_changed();
    }

    fn play_chord_internal(&mut self, desired: &[u8], velocity: f32, allow_tail_off: bool) {
        if desired.is_empty() {
            self.all_notes_off(allow_tail_off);
            return;
        }

        let mut current = std::mem::take(&mut self.scratch_notes);
        self.report_active_notes(&mut current, false, true);

        if current.is_empty() {
            self.turn_on_list(desired, velocity);
        } else {
            let mut changing = std::mem::take(&mut self.scratch_changing);

            changing.clear();
            changing.extend(current.iter().copied().filter(|note| !desired.contains(note)));
            let off_velocity = if allow_tail_off { 0.0 } else { 1.0 };
            self.turn_off_list(&changing, off_velocity, allow_tail_off);

            changing.clear();
            changing.extend(desired.iter().copied().filter(|note| !current.contains(note)));
            self.turn_on_list(&changing, velocity);

            changing.clear();
            self.scratch_changing = changing;
        }

        current.clear();
        self.scratch_notes = current;
    }

    fn turn_on_list(&mut self, notes: &[u8], velocity: f32) {
        for &note in notes {
            self.note_on(note, velocity, false);
        }
    }

    fn turn_off_list(&mut self, notes: &[u8], velocity: f32, allow_tail_off: bool) {
        for &note in notes {
            self.note_off(note, velocity, allow_tail_off, false);
        }
    }

    // ── automated notes ────────────────────────────────────────────────────

    /// Called exactly once after each batch of MIDI input events or
    /// chord/latch operation.
    fn pitch_collection_changed(&mut self) {
        if self.pedal.enabled {
            self.apply_pedal_pitch();
        }
        if self.descant.enabled {
            self.apply_descant();
        }
        if self.interval_latch_on {
            self.update_intervals_latched();
        }
    }

    /// Double the lowest held keyboard note at a fixed interval below it,
    /// when that note is at or below the pedal threshold.
    fn apply_pedal_pitch(&mut self) {
        if self.pedal.interval == 0 {
            return;
        }

        let mut current_lowest: i32 = 128;
        let mut lowest_voice: Option<usize> = None;

        for (i, voice) in self.voices.iter().enumerate() {
            if voice.is_active() && voice.is_key_down() {
                let note = voice.playing_note() as i32;
                if note < current_lowest {
                    current_lowest = note;
                    lowest_voice = Some(i);
                }
            }
        }

        let last_pitch = self.pedal.last_pitch;

        if current_lowest > self.pedal.threshold as i32 {
            if let Some(last) = last_pitch {
                self.note_off(last, 1.0, false, false);
            }
            return;
        }

        let new_pitch = current_lowest - self.pedal.interval as i32;

        if last_pitch.map(|p| p as i32) == Some(new_pitch) {
            return;
        }

        if new_pitch < 0 || self.is_pitch_active(new_pitch as u8, false, true) {
            if let Some(last) = last_pitch {
                self.note_off(last, 1.0, false, false);
            }
            return;
        }

        let mut prev_pedal_voice = self.current_role_voice(VoiceRole::PedalPitch);
        if let Some(index) = prev_pedal_voice {
            // can't reuse the voice if its keyboard key is down
            if self.voices[index].is_key_down() {
                prev_pedal_voice = None;
            }
        }

        self.pedal.last_pitch = Some(new_pitch as u8);

        if let Some(index) = prev_pedal_voice {
            // keep the pedal line on the same voice: steal it directly
            // without a new note_on, so its pan assignment survives
            let velocity = match lowest_voice {
                Some(lowest) => self.voices[lowest].last_velocity(),
                None => self.voices[index].last_velocity(),
            };
            self.start_voice(Some(index), new_pitch as u8, velocity, false);
        } else {
            if let Some(last) = last_pitch {
                self.note_off(last, 1.0, false, false);
            }
            let velocity = match lowest_voice {
                Some(lowest) => self.voices[lowest].last_velocity(),
                None => 1.0,
            };
            self.note_on(new_pitch as u8, velocity, false);
        }
    }

    /// Double the highest held keyboard note at a fixed interval above it,
    /// when that note is at or above the descant threshold.
    fn apply_descant(&mut self) {
        if self.descant.interval == 0 {
            return;
        }

        let mut current_highest: i32 = -1;
        let mut highest_voice: Option<usize> = None;

        for (i, voice) in self.voices.iter().enumerate() {
            if voice.is_active() && voice.is_key_down() {
                let note = voice.playing_note() as i32;
                if note > current_highest {
                    current_highest = note;
                    highest_voice = Some(i);
                }
            }
        }

        let last_pitch = self.descant.last_pitch;

        if current_highest < self.descant.threshold as i32 {
            if let Some(last) = last_pitch {
                self.note_off(last, 1.0, false, false);
            }
            return;
        }

        let new_pitch = current_highest + self.descant.interval as i32;

        if last_pitch.map(|p| p as i32) == Some(new_pitch) {
            return;
        }

        if new_pitch > 127 || self.is_pitch_active(new_pitch as u8, false, true) {
            if let Some(last) = last_pitch {
                self.note_off(last, 1.0, false, false);
            }
            return;
        }

        let mut prev_descant_voice = self.current_role_voice(VoiceRole::Descant);
        if let Some(index) = prev_descant_voice {
            if self.voices[index].is_key_down() {
                prev_descant_voice = None;
            }
        }

        self.descant.last_pitch = Some(new_pitch as u8);

        if let Some(index) = prev_descant_voice {
            let velocity = match highest_voice {
                Some(highest) => self.voices[highest].last_velocity(),
                None => self.voices[index].last_velocity(),
            };
            self.start_voice(Some(index), new_pitch as u8, velocity, false);
        } else {
            if let Some(last) = last_pitch {
                self.note_off(last, 1.0, false, false);
            }
            let velocity = match highest_voice {
                Some(highest) => self.voices[highest].last_velocity(),
                None => 1.0,
            };
            self.note_on(new_pitch as u8, velocity, false);
        }
    }

    // ── controllers ────────────────────────────────────────────────────────

    fn handle_pitch_wheel(&mut self, wheel: u16) {
        if self.bend.last_wheel() == wheel {
            return;
        }

        self.emit(MidiEventData::PitchBend { value: wheel });
        self.bend.wheel_received(wheel);
        self.refresh_output_frequencies();
    }

    fn handle_aftertouch(&mut self, note: u8, value: u8) {
        self.emit(MidiEventData::PolyPressure {
            note,
            pressure: value,
        });

        for voice in &mut self.voices {
            if voice.playing_note() == note {
                voice.set_aftertouch(value);
            }
        }
    }

    fn handle_channel_pressure(&mut self, value: u8) {
        self.emit(MidiEventData::ChannelPressure { pressure: value });

        for voice in &mut self.voices {
            voice.set_aftertouch(value);
        }
    }

    fn handle_controller(&mut self, controller: u8, value: u8) {
        match controller {
            cc::SUSTAIN => self.handle_sustain_pedal(value),
            cc::SOSTENUTO => self.handle_sostenuto_pedal(value),
            cc::SOFT_PEDAL => self.handle_soft_pedal(value),
            cc::MOD_WHEEL
            | cc::BREATH
            | cc::FOOT_CONTROLLER
            | cc::PORTAMENTO_TIME
            | cc::BALANCE
            | cc::LEGATO => {
                self.emit(MidiEventData::ControlChange { controller, value });
            }
            _ => {}
        }
    }

    fn handle_sustain_pedal(&mut self, value: u8) {
        let is_down = value >= 64;
        if self.sustain_pedal_down == is_down {
            return;
        }

        self.sustain_pedal_down = is_down;
        self.emit(MidiEventData::ControlChange {
            controller: cc::SUSTAIN,
            value,
        });

        if is_down || self.latch_on || self.interval_latch_on {
            return;
        }

        self.turn_off_all_keyup_notes(false, false);
    }

    fn handle_sostenuto_pedal(&mut self, value: u8) {
        let is_down = value >= 64;
        if self.sostenuto_pedal_down == is_down {
            return;
        }

        self.sostenuto_pedal_down = is_down;
        self.emit(MidiEventData::ControlChange {
            controller: cc::SOSTENUTO,
            value,
        });

        if is_down || self.latch_on || self.interval_latch_on {
            return;
        }

        self.turn_off_all_keyup_notes(false, false);
    }

    fn handle_soft_pedal(&mut self, value: u8) {
        let is_down = value >= 64;
        if self.soft_pedal_down == is_down {
            return;
        }

        self.soft_pedal_down = is_down;
        self.emit(MidiEventData::ControlChange {
            controller: cc::SOFT_PEDAL,
            value,
        });
    }

    fn handle_midi_event(&mut self, event: &MidiEvent) {
        self.last_midi_channel = event.channel;
        self.last_midi_timestamp = self
            .last_midi_timestamp
            .max(event.sample_offset as i64 - 1);

        match event.data {
            MidiEventData::NoteOn { note, velocity } if velocity > 0 => {
                self.note_on(note, velocity as f32 / 127.0, true);
            }
            MidiEventData::NoteOn { note, .. } => {
                self.note_off(note, 64.0 / 127.0, true, true);
            }
            MidiEventData::NoteOff { note, velocity } => {
                self.note_off(note, velocity as f32 / 127.0, true, true);
            }
            MidiEventData::ControlChange { controller, .. }
                if controller == cc::ALL_NOTES_OFF || controller == cc::ALL_SOUND_OFF =>
            {
                self.all_notes_off(false);
            }
            MidiEventData::ControlChange { controller, value } => {
                self.handle_controller(controller, value);
            }
            MidiEventData::PitchBend { value } => self.handle_pitch_wheel(value),
            MidiEventData::PolyPressure { note, pressure } => {
                self.handle_aftertouch(note, pressure);
            }
            MidiEventData::ChannelPressure { pressure } => {
                self.handle_channel_pressure(pressure);
            }
            // program changes are the processor facade's concern
            MidiEventData::ProgramChange { .. } => {}
        }
    }

    /// Process one block's MIDI events without rendering audio. The buffer
    /// is replaced with the harmonizer's aggregate MIDI output.
    pub fn process_midi(&mut self, midi: &mut MidiBuffer) {
        self.aggregate_midi.clear();
        self.last_midi_timestamp = -1;

        midi.sort_by_time();
        for i in 0..midi.len() {
            let event = midi.events()[i];
            self.handle_midi_event(&event);
        }

        self.pitch_collection_changed();

        midi.swap(&mut self.aggregate_midi);
        self.last_midi_timestamp = -1;
    }

    // ── rendering ──────────────────────────────────────────────────────────

    /// Render one internal block: analyze the modulator's pitch, process
    /// the block's MIDI events, and mix every active voice into `output`.
    /// On return `midi` holds the harmonizer's MIDI output for the block.
    pub fn render_voices(
        &mut self,
        input: &[S],
        output: &mut StereoBuffer<S>,
        midi: &mut MidiBuffer,
    ) {
        self.aggregate_midi.clear();
        self.last_midi_timestamp = -1;

        // input pitch drives both the analyzer and the interval latch
        let detected = self.detector.detect(input);
        match detected {
            Some(hz) => {
                let changed = (hz - self.current_input_freq).abs() > 0.01;
                self.current_input_freq = hz;

                if changed && self.interval_latch_on && !self.intervals_latched.is_empty() {
                    self.play_interval_set(1.0, false, true);
                }
            }
            None => self.current_input_freq = UNPITCHED,
        }

        let period = detected.map(|hz| self.sample_rate / hz);
        self.analyzer.analyze(input, period);

        midi.sort_by_time();
        for i in 0..midi.len() {
            let event = midi.events()[i];
            self.handle_midi_event(&event);
        }

        self.pitch_collection_changed();

        output.clear();
        let params = VoiceRenderParams {
            soft_pedal_down: self.soft_pedal_down,
            soft_pedal_gain: self.soft_pedal_gain,
            playing_but_released_gain: self.playing_but_released_gain,
            aftertouch_gain_on: self.aftertouch_gain_on,
            adsr_on: self.adsr_on,
        };

        for voice in &mut self.voices {
            voice.render_next_block(&self.analyzer, &params, output);
        }

        // release pan slots of voices whose release tail just ended
        for i in 0..self.voices.len() {
            if self.voices[i].take_just_finished() {
                let pan = self.voices[i].pan();
                self.panner.pan_turned_off(pan);
            }
        }

        midi.swap(&mut self.aggregate_midi);
        self.last_midi_timestamp = -1;
    }
}

#[inline]
fn float_to_velocity(velocity: f32) -> u8 {
    (velocity.clamp(0.0, 1.0) * 127.0).round() as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    const SR: f64 = 44_100.0;

    fn harmonizer() -> Harmonizer<f32> {
        let mut h = Harmonizer::new(4, SR);
        h.prepare(SR, 512);
        h
    }

    fn midi_with(events: &[MidiEvent]) -> MidiBuffer {
        let mut buffer = MidiBuffer::new();
        for &event in events {
            buffer.push(event);
        }
        buffer
    }

    fn active_notes(h: &Harmonizer<f32>) -> Vec<u8> {
        let mut notes: Vec<u8> = h
            .voices()
            .iter()
            .filter(|v| v.is_active())
            .map(|v| v.playing_note())
            .collect();
        notes.sort_unstable();
        notes
    }

    #[test]
    fn test_note_on_starts_voice() {
        let mut h = harmonizer();
        let mut midi = midi_with(&[MidiEvent::note_on(0, 0, 60, 100)]);
        h.process_midi(&mut midi);

        assert_eq!(active_notes(&h), vec![60]);
        let voice = h.voices().iter().find(|v| v.is_active()).unwrap();
        assert!(voice.is_key_down());
        assert_eq!(voice.note_on_time(), 1);
        assert!((voice.last_velocity() - 100.0 / 127.0).abs() < 1e-6);
    }

    #[test]
    fn test_note_off_stops_voice() {
        let mut h = harmonizer();
        let mut midi = midi_with(&[MidiEvent::note_on(0, 0, 60, 100)]);
        h.process_midi(&mut midi);

        let mut midi = midi_with(&[MidiEvent::note_off(0, 0, 60, 64)]);
        h.process_midi(&mut midi);

        let voice = &h.voices()[0];
        assert!(voice.is_releasing());
        assert!(!voice.is_key_down());
        // the note off was emitted
        assert!(midi.events().iter().any(|e| e.is_note_off()));
    }

    #[test]
    fn test_same_note_retrigger_keeps_timestamp() {
        let mut h = harmonizer();
        let mut midi = midi_with(&[MidiEvent::note_on(0, 0, 60, 100)]);
        h.process_midi(&mut midi);

        let mut midi = midi_with(&[MidiEvent::note_on(0, 0, 60, 40)]);
        h.process_midi(&mut midi);

        let voice = h.voices().iter().find(|v| v.is_active()).unwrap();
        assert_eq!(voice.note_on_time(), 1);
        // no duplicate note on is emitted for a same-note retrigger
        assert!(midi.events().iter().all(|e| !e.is_note_on()));
        // but the velocity is updated
        assert!((voice.last_velocity() - 40.0 / 127.0).abs() < 1e-6);
    }

    #[test]
    fn test_note_on_counter_never_repeats() {
        let mut h = harmonizer();
        let mut midi = midi_with(&[
            MidiEvent::note_on(0, 0, 60, 100),
            MidiEvent::note_on(1, 0, 64, 100),
            MidiEvent::note_on(2, 0, 67, 100),
        ]);
        h.process_midi(&mut midi);

        let mut stamps: Vec<u64> = h
            .voices()
            .iter()
            .filter(|v| v.is_active())
            .map(|v| v.note_on_time())
            .collect();
        stamps.sort_unstable();
        assert_eq!(stamps, vec![1, 2, 3]);
    }

    #[test]
    fn test_latch_holds_key_up_notes() {
        let mut h = harmonizer();
        h.set_midi_latch(true, true);

        let mut midi = midi_with(&[MidiEvent::note_on(0, 0, 60, 100)]);
        h.process_midi(&mut midi);

        let mut midi = midi_with(&[MidiEvent::note_off(0, 0, 60, 64)]);
        h.process_midi(&mut midi);

        let voice = h.voices().iter().find(|v| v.is_active()).unwrap();
        assert!(!voice.is_key_down());
        assert!(!voice.is_releasing(), "latch must hold the voice");

        h.set_midi_latch(false, true);
        assert!(h.voices()[0].is_releasing());
    }

    #[test]
    fn test_sustain_pedal_defers_note_offs() {
        let mut h = harmonizer();
        let mut midi = midi_with(&[
            MidiEvent::note_on(0, 0, 60, 100),
            MidiEvent::note_on(1, 0, 64, 100),
            MidiEvent::control_change(2, 0, cc::SUSTAIN, 127),
            MidiEvent::note_off(3, 0, 60, 64),
            MidiEvent::note_off(4, 0, 64, 64),
        ]);
        h.process_midi(&mut midi);

        assert_eq!(active_notes(&h), vec![60, 64]);
        assert!(h
            .voices()
            .iter()
            .filter(|v| v.is_active())
            .all(|v| !v.is_key_down() && !v.is_releasing()));

        let mut midi = midi_with(&[MidiEvent::control_change(0, 0, cc::SUSTAIN, 0)]);
        h.process_midi(&mut midi);

        assert!(h.voices().iter().all(|v| !v.is_active() || v.is_releasing()));
    }

    #[test]
    fn test_all_notes_off_clears_everything() {
        let mut h = harmonizer();
        h.set_pedal_pitch(true, 127, 12);

        let mut midi = midi_with(&[
            MidiEvent::note_on(0, 0, 60, 100),
            MidiEvent::note_on(1, 0, 64, 100),
        ]);
        h.process_midi(&mut midi);
        assert!(h.pedal().last_pitch.is_some());

        let mut midi = midi_with(&[MidiEvent::control_change(0, 0, cc::ALL_NOTES_OFF, 0)]);
        h.process_midi(&mut midi);

        assert!(h.voices().iter().all(|v| !v.is_active() || v.is_releasing()));
        assert_eq!(h.pedal().last_pitch, None);
        assert_eq!(h.descant().last_pitch, None);
    }

    #[test]
    fn test_emitted_timestamps_are_non_decreasing() {
        let mut h = harmonizer();
        h.set_pedal_pitch(true, 127, 12);
        h.set_descant(true, 0, 12);

        let mut midi = midi_with(&[
            MidiEvent::note_on(0, 0, 48, 100),
            MidiEvent::note_on(5, 0, 72, 90),
            MidiEvent::pitch_bend(9, 0, 9000),
        ]);
        h.process_midi(&mut midi);

        let stamps: Vec<u32> = midi.events().iter().map(|e| e.sample_offset).collect();
        assert!(!stamps.is_empty());
        assert!(stamps.windows(2).all(|w| w[0] <= w[1]), "stamps {stamps:?}");
    }

    #[test]
    fn test_pitch_wheel_bends_output_freqs() {
        let mut h = harmonizer();
        let mut midi = midi_with(&[MidiEvent::note_on(0, 0, 69, 100)]);
        h.process_midi(&mut midi);

        let unbent = h.voices()[0].current_output_freq();
        assert!((unbent - 440.0).abs() < 1e-6);

        let mut midi = midi_with(&[MidiEvent::pitch_bend(0, 0, 16383)]);
        h.process_midi(&mut midi);

        let bent = h.voices()[0].current_output_freq();
        // default bend range is +2 semitones
        assert!((bent - 440.0 * 2.0_f64.powf(2.0 / 12.0)).abs() < 0.5, "bent {bent}");

        // passthrough was emitted
        assert!(midi
            .events()
            .iter()
            .any(|e| matches!(e.data, MidiEventData::PitchBend { .. })));
    }

    #[test]
    fn test_aftertouch_routed_to_voice() {
        let mut h = harmonizer();
        let mut midi = midi_with(&[
            MidiEvent::note_on(0, 0, 60, 100),
            MidiEvent::poly_pressure(1, 0, 60, 99),
        ]);
        h.process_midi(&mut midi);

        assert_eq!(h.voices()[0].aftertouch(), 99);
    }

    #[test]
    fn test_voice_pool_resize() {
        let mut h = harmonizer();
        assert_eq!(h.num_voices(), 4);

        h.set_num_voices(8);
        assert_eq!(h.num_voices(), 8);

        h.set_num_voices(2);
        assert_eq!(h.num_voices(), 2);
    }

    #[test]
    fn test_play_chord_turns_off_then_on() {
        let mut h = harmonizer();
        h.play_chord(&[60, 64, 67], 0.8, true);
        assert_eq!(active_notes(&h), vec![60, 64, 67]);

        h.play_chord(&[60, 65, 69], 0.8, false);
        let sounding: Vec<u8> = h
            .voices()
            .iter()
            .filter(|v| v.is_active() && !v.is_releasing())
            .map(|v| v.playing_note())
            .collect();
        let mut sounding = sounding;
        sounding.sort_unstable();
        assert_eq!(sounding, vec![60, 65, 69]);
    }
}
