//! Host-facing processor facade
//!
//! Thin glue between the host plugin contract and the engine: bus layout
//! negotiation, per-block parameter sampling, precision switching between
//! the 32- and 64-bit engine instances, program changes, and preset state.

use log::{debug, info};
use pv_core::{Decibels, MidiBuffer, MidiEventData, PvError, PvResult, Sample};
use pv_dsp::pitch::VocalRange;

use crate::chunking::{Engine, ModulatorSource};
use crate::params::{ParamSnapshot, ParameterBank};
use crate::state::{EngineState, PresetError, PresetManager};

/// Sample precision selected by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Precision {
    #[default]
    Single,
    Double,
}

/// Channel counts negotiated with the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusLayout {
    pub main_input_channels: u32,
    pub sidechain_channels: u32,
    pub main_output_channels: u32,
}

impl BusLayout {
    /// Stereo in, stereo out, sidechain disabled.
    pub fn stereo() -> Self {
        Self {
            main_input_channels: 2,
            sidechain_channels: 0,
            main_output_channels: 2,
        }
    }

    /// The output must be stereo and at least one input bus enabled.
    pub fn is_supported(&self) -> bool {
        (self.main_input_channels > 0 || self.sidechain_channels > 0)
            && self.main_output_channels == 2
    }
}

/// The plugin's processing core behind the host boilerplate.
pub struct Processor {
    params: ParameterBank,
    float_engine: Engine<f32>,
    double_engine: Engine<f64>,
    precision: Precision,
    preset_manager: PresetManager,
    pending_program: Option<u8>,
    was_bypassed: bool,
    prepared: bool,
}

impl Processor {
    pub fn new() -> Self {
        Self {
            params: ParameterBank::new(),
            float_engine: Engine::new(),
            double_engine: Engine::new(),
            precision: Precision::Single,
            preset_manager: PresetManager::new(),
            pending_program: None,
            was_bypassed: false,
            prepared: false,
        }
    }

    pub fn with_preset_manager(preset_manager: PresetManager) -> Self {
        Self {
            preset_manager,
            ..Self::new()
        }
    }

    /// The control surface writes parameters here at any time.
    pub fn params(&self) -> &ParameterBank {
        &self.params
    }

    /// Reject any layout without a stereo output or without any input.
    pub fn is_buses_layout_supported(&self, layout: &BusLayout) -> bool {
        layout.is_supported()
    }

    pub fn check_layout(&self, layout: &BusLayout) -> PvResult<()> {
        if layout.is_supported() {
            Ok(())
        } else {
            Err(PvError::InvalidLayout(format!(
                "in {} / sidechain {} / out {}",
                layout.main_input_channels, layout.sidechain_channels, layout.main_output_channels
            )))
        }
    }

    /// Prepare the engine matching the host's precision; the idle engine's
    /// resources are released. Also the only point where the voice pool is
    /// resized (the host has suspended processing).
    pub fn prepare_to_play(&mut self, sample_rate: f64, block_size: usize, precision: Precision) {
        self.precision = precision;
        let num_voices = self.params.num_voices.get().max(1) as usize;

        match precision {
            Precision::Single => {
                self.double_engine.release_resources();
                self.float_engine.initialize(sample_rate, block_size, num_voices);
            }
            Precision::Double => {
                self.float_engine.release_resources();
                self.double_engine.initialize(sample_rate, block_size, num_voices);
            }
        }

        self.prepared = true;
        info!(
            "prepared at {sample_rate} Hz, host block {block_size}, {num_voices} voices, {:?} precision",
            precision
        );
    }

    pub fn release_resources(&mut self) {
        self.float_engine.release_resources();
        self.double_engine.release_resources();
        self.prepared = false;
    }

    pub fn reset(&mut self) {
        match self.precision {
            Precision::Single => self.float_engine.reset(),
            Precision::Double => self.double_engine.reset(),
        }
    }

    /// FIFO latency reported to the host.
    pub fn latency_samples(&self) -> usize {
        match self.precision {
            Precision::Single => self.float_engine.latency_samples(),
            Precision::Double => self.double_engine.latency_samples(),
        }
    }

    // ── audio callbacks ────────────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    pub fn process_block_f32(
        &mut self,
        left: &[f32],
        right: Option<&[f32]>,
        out_left: &mut [f32],
        out_right: &mut [f32],
        midi: &mut MidiBuffer,
    ) {
        let snapshot = self.params.snapshot();
        scan_program_changes(midi, &mut self.pending_program);

        let bypassed = snapshot.main_bypass;
        let fade_out = bypassed && !self.was_bypassed;
        let fade_in = !bypassed && self.was_bypassed;
        self.was_bypassed = bypassed;

        apply_parameters(&snapshot, &mut self.float_engine);
        self.float_engine
            .process(left, right, out_left, out_right, midi, fade_in, fade_out, bypassed);
    }

    #[allow(clippy::too_many_arguments)]
    pub fn process_block_f64(
        &mut self,
        left: &[f64],
        right: Option<&[f64]>,
        out_left: &mut [f64],
        out_right: &mut [f64],
        midi: &mut MidiBuffer,
    ) {
        let snapshot = self.params.snapshot();
        scan_program_changes(midi, &mut self.pending_program);

        let bypassed = snapshot.main_bypass;
        let fade_out = bypassed && !self.was_bypassed;
        let fade_in = !bypassed && self.was_bypassed;
        self.was_bypassed = bypassed;

        apply_parameters(&snapshot, &mut self.double_engine);
        self.double_engine
            .process(left, right, out_left, out_right, midi, fade_in, fade_out, bypassed);
    }

    /// The host's dedicated bypass callback: force the bypass parameter on
    /// and run the latency-matched passthrough.
    pub fn process_block_bypassed_f32(
        &mut self,
        left: &[f32],
        right: Option<&[f32]>,
        out_left: &mut [f32],
        out_right: &mut [f32],
        midi: &mut MidiBuffer,
    ) {
        self.params.main_bypass.set(true);
        self.process_block_f32(left, right, out_left, out_right, midi);
    }

    pub fn process_block_bypassed_f64(
        &mut self,
        left: &[f64],
        right: Option<&[f64]>,
        out_left: &mut [f64],
        out_right: &mut [f64],
        midi: &mut MidiBuffer,
    ) {
        self.params.main_bypass.set(true);
        self.process_block_f64(left, right, out_left, out_right, midi);
    }

    // ── control thread ─────────────────────────────────────────────────────

    /// Program change received during processing, to be serviced by the
    /// control thread (preset recall does file IO).
    pub fn take_pending_program(&mut self) -> Option<u8> {
        self.pending_program.take()
    }

    pub fn preset_manager(&self) -> &PresetManager {
        &self.preset_manager
    }

    pub fn state(&self) -> EngineState {
        EngineState::capture(&self.params)
    }

    pub fn set_state(&self, state: &EngineState) {
        state.apply(&self.params);
    }

    pub fn save_preset(&self, name: &str) -> Result<(), PresetError> {
        self.preset_manager.save(name, &self.state())?;
        Ok(())
    }

    /// Load a preset by name; the current state is untouched on failure.
    pub fn load_preset(&self, name: &str) -> Result<(), PresetError> {
        let state = self.preset_manager.load(name)?;
        self.set_state(&state);
        debug!("loaded preset '{name}'");
        Ok(())
    }

    /// Recall the nth preset (sorted by name), as MIDI program changes do.
    pub fn load_program(&self, index: u8) -> Result<(), PresetError> {
        let names = self.preset_manager.list();
        match names.get(index as usize) {
            Some(name) => self.load_preset(name),
            None => Err(PresetError::Unknown(format!("program {index}"))),
        }
    }
}

impl Default for Processor {
    fn default() -> Self {
        Self::new()
    }
}

fn scan_program_changes(midi: &MidiBuffer, pending: &mut Option<u8>) {
    for event in midi.events() {
        if let MidiEventData::ProgramChange { program } = event.data {
            *pending = Some(program);
        }
    }
}

/// Forward one block's parameter snapshot into an engine.
fn apply_parameters<S: Sample>(snapshot: &ParamSnapshot, engine: &mut Engine<S>) {
    engine.set_bypass_states(snapshot.lead_bypass, snapshot.harmony_bypass);
    engine.set_input_gain(Decibels(snapshot.input_gain_db).to_gain());
    engine.set_output_gain(Decibels(snapshot.output_gain_db).to_gain());
    engine.set_dry_pan(snapshot.dry_pan);
    engine.set_dry_wet(snapshot.dry_wet);
    engine.set_limiter(snapshot.limiter_thresh_db, snapshot.limiter_release_ms, snapshot.limiter_on);
    engine.set_modulator_source(ModulatorSource::from_index(snapshot.modulator_source));
    engine.set_vocal_range(VocalRange::from_index(snapshot.vocal_range));

    let harmonizer = engine.harmonizer_mut();
    harmonizer.set_adsr_parameters(
        snapshot.adsr_attack,
        snapshot.adsr_decay,
        snapshot.adsr_sustain,
        snapshot.adsr_release,
    );
    harmonizer.set_adsr_on(snapshot.adsr_on);
    harmonizer.set_stereo_width(snapshot.stereo_width);
    harmonizer.set_lowest_panned_note(snapshot.lowest_panned_note);
    harmonizer.set_velocity_sensitivity(snapshot.velocity_sensitivity);
    harmonizer.set_pitch_bend_range(snapshot.pitch_bend_up, snapshot.pitch_bend_down);
    harmonizer.set_concert_pitch(snapshot.concert_pitch_hz);
    harmonizer.set_note_stealing(snapshot.voice_stealing);
    harmonizer.set_aftertouch_gain_on(snapshot.aftertouch_gain);
    harmonizer.set_midi_latch(snapshot.midi_latch, true);
    harmonizer.set_interval_latch(snapshot.interval_latch, true);
    harmonizer.set_pedal_pitch(
        snapshot.pedal_pitch_on,
        snapshot.pedal_pitch_thresh,
        snapshot.pedal_pitch_interval,
    );
    harmonizer.set_descant(
        snapshot.descant_on,
        snapshot.descant_thresh,
        snapshot.descant_interval,
    );
}
