//! Persisted state and preset files
//!
//! The complete parameter surface plus the voice count and modulator source
//! serialize to a single JSON document with stable string keys. One preset
//! is one JSON file under the OS application-data directory; loading a
//! malformed preset leaves the current state untouched. A state captured
//! from a [`ParameterBank`] and applied back is observationally lossless.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use log::{debug, warn};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::params::ParameterBank;

static DEFAULT_PRESET_DIR: Lazy<PathBuf> = Lazy::new(|| {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("Polyvox")
        .join("Presets")
});

/// Snapshot of every persisted setting, keyed for the wire format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineState {
    #[serde(rename = "mainBypass")]
    pub main_bypass: bool,
    #[serde(rename = "leadBypass")]
    pub lead_bypass: bool,
    #[serde(rename = "harmonyBypass")]
    pub harmony_bypass: bool,
    #[serde(rename = "dryPan")]
    pub dry_pan: u32,
    #[serde(rename = "masterDryWet")]
    pub dry_wet: u32,
    #[serde(rename = "inputGain")]
    pub input_gain_db: f64,
    #[serde(rename = "outputGain")]
    pub output_gain_db: f64,
    #[serde(rename = "adsrAttack")]
    pub adsr_attack: f64,
    #[serde(rename = "adsrDecay")]
    pub adsr_decay: f64,
    #[serde(rename = "adsrSustain")]
    pub adsr_sustain: f64,
    #[serde(rename = "adsrRelease")]
    pub adsr_release: f64,
    #[serde(rename = "adsrOnOff")]
    pub adsr_on: bool,
    #[serde(rename = "stereoWidth")]
    pub stereo_width: u32,
    #[serde(rename = "lowestPan")]
    pub lowest_panned_note: u32,
    #[serde(rename = "midiVelocitySensitivity")]
    pub velocity_sensitivity: u32,
    #[serde(rename = "pitchBendUpRange")]
    pub pitch_bend_up: u32,
    #[serde(rename = "pitchBendDownRange")]
    pub pitch_bend_down: u32,
    #[serde(rename = "concertPitch")]
    pub concert_pitch_hz: u32,
    #[serde(rename = "voiceStealing")]
    pub voice_stealing: bool,
    #[serde(rename = "aftertouchGainToggle")]
    pub aftertouch_gain: bool,
    #[serde(rename = "pedalPitchToggle")]
    pub pedal_pitch_on: bool,
    #[serde(rename = "pedalPitchThresh")]
    pub pedal_pitch_thresh: u32,
    #[serde(rename = "pedalPitchInterval")]
    pub pedal_pitch_interval: u32,
    #[serde(rename = "descantToggle")]
    pub descant_on: bool,
    #[serde(rename = "descantThresh")]
    pub descant_thresh: u32,
    #[serde(rename = "descantInterval")]
    pub descant_interval: u32,
    #[serde(rename = "limiterIsOn")]
    pub limiter_on: bool,
    #[serde(rename = "vocalRangeType")]
    pub vocal_range: u32,
    #[serde(rename = "numberOfVoices")]
    pub number_of_voices: u32,
    #[serde(rename = "modulatorInputSource")]
    pub modulator_input_source: u32,
}

impl Default for EngineState {
    fn default() -> Self {
        Self::capture(&ParameterBank::default())
    }
}

impl EngineState {
    /// Read the current values out of the parameter bank.
    pub fn capture(bank: &ParameterBank) -> Self {
        Self {
            main_bypass: bank.main_bypass.get(),
            lead_bypass: bank.lead_bypass.get(),
            harmony_bypass: bank.harmony_bypass.get(),
            dry_pan: bank.dry_pan.get(),
            dry_wet: bank.dry_wet.get(),
            input_gain_db: bank.input_gain_db.get(),
            output_gain_db: bank.output_gain_db.get(),
            adsr_attack: bank.adsr_attack.get(),
            adsr_decay: bank.adsr_decay.get(),
            adsr_sustain: bank.adsr_sustain.get(),
            adsr_release: bank.adsr_release.get(),
            adsr_on: bank.adsr_on.get(),
            stereo_width: bank.stereo_width.get(),
            lowest_panned_note: bank.lowest_panned_note.get(),
            velocity_sensitivity: bank.velocity_sensitivity.get(),
            pitch_bend_up: bank.pitch_bend_up.get(),
            pitch_bend_down: bank.pitch_bend_down.get(),
            concert_pitch_hz: bank.concert_pitch_hz.get(),
            voice_stealing: bank.voice_stealing.get(),
            aftertouch_gain: bank.aftertouch_gain.get(),
            pedal_pitch_on: bank.pedal_pitch_on.get(),
            pedal_pitch_thresh: bank.pedal_pitch_thresh.get(),
            pedal_pitch_interval: bank.pedal_pitch_interval.get(),
            descant_on: bank.descant_on.get(),
            descant_thresh: bank.descant_thresh.get(),
            descant_interval: bank.descant_interval.get(),
            limiter_on: bank.limiter_on.get(),
            vocal_range: bank.vocal_range.get(),
            number_of_voices: bank.num_voices.get(),
            modulator_input_source: bank.modulator_source.get(),
        }
    }

    /// Write every value back into the parameter bank.
    pub fn apply(&self, bank: &ParameterBank) {
        bank.main_bypass.set(self.main_bypass);
        bank.lead_bypass.set(self.lead_bypass);
        bank.harmony_bypass.set(self.harmony_bypass);
        bank.dry_pan.set(self.dry_pan);
        bank.dry_wet.set(self.dry_wet);
        bank.input_gain_db.set(self.input_gain_db);
        bank.output_gain_db.set(self.output_gain_db);
        bank.adsr_attack.set(self.adsr_attack);
        bank.adsr_decay.set(self.adsr_decay);
        bank.adsr_sustain.set(self.adsr_sustain);
        bank.adsr_release.set(self.adsr_release);
        bank.adsr_on.set(self.adsr_on);
        bank.stereo_width.set(self.stereo_width);
        bank.lowest_panned_note.set(self.lowest_panned_note);
        bank.velocity_sensitivity.set(self.velocity_sensitivity);
        bank.pitch_bend_up.set(self.pitch_bend_up);
        bank.pitch_bend_down.set(self.pitch_bend_down);
        bank.concert_pitch_hz.set(self.concert_pitch_hz);
        bank.voice_stealing.set(self.voice_stealing);
        bank.aftertouch_gain.set(self.aftertouch_gain);
        bank.pedal_pitch_on.set(self.pedal_pitch_on);
        bank.pedal_pitch_thresh.set(self.pedal_pitch_thresh);
        bank.pedal_pitch_interval.set(self.pedal_pitch_interval);
        bank.descant_on.set(self.descant_on);
        bank.descant_thresh.set(self.descant_thresh);
        bank.descant_interval.set(self.descant_interval);
        bank.limiter_on.set(self.limiter_on);
        bank.vocal_range.set(self.vocal_range);
        bank.num_voices.set(self.number_of_voices);
        bank.modulator_source.set(self.modulator_input_source);
    }
}

/// A named preset document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresetFile {
    pub name: String,
    pub state: EngineState,
}

impl PresetFile {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// Preset errors
#[derive(Debug, thiserror::Error)]
pub enum PresetError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("unknown preset: {0}")]
    Unknown(String),
}

/// Loads and saves preset files from the preset directory.
///
/// Control thread only; the file cache is behind a mutex so the manager can
/// be shared with GUI callbacks.
pub struct PresetManager {
    directory: PathBuf,
    cache: Mutex<BTreeMap<String, String>>,
}

impl PresetManager {
    pub fn new() -> Self {
        Self::with_directory(DEFAULT_PRESET_DIR.clone())
    }

    pub fn with_directory(directory: PathBuf) -> Self {
        Self {
            directory,
            cache: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.directory.join(format!("{name}.json"))
    }

    /// Preset names found on disk, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut names = Vec::new();

        if let Ok(entries) = std::fs::read_dir(&self.directory) {
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().map(|e| e == "json").unwrap_or(false) {
                    if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                        names.push(stem.to_string());
                    }
                }
            }
        }

        names.sort();
        names
    }

    pub fn save(&self, name: &str, state: &EngineState) -> Result<PathBuf, PresetError> {
        let preset = PresetFile {
            name: name.to_string(),
            state: state.clone(),
        };
        let json = preset.to_json()?;

        std::fs::create_dir_all(&self.directory)?;
        let path = self.path_for(name);
        std::fs::write(&path, &json)?;

        self.cache.lock().insert(name.to_string(), json);
        debug!("saved preset '{name}' to {}", path.display());
        Ok(path)
    }

    /// Load a preset. On any failure the caller's state is untouched.
    pub fn load(&self, name: &str) -> Result<EngineState, PresetError> {
        let cached = self.cache.lock().get(name).cloned();

        let json = match cached {
            Some(json) => json,
            None => {
                let path = self.path_for(name);
                if !path.exists() {
                    return Err(PresetError::Unknown(name.to_string()));
                }
                let json = std::fs::read_to_string(&path)?;
                self.cache.lock().insert(name.to_string(), json.clone());
                json
            }
        };

        match PresetFile::from_json(&json) {
            Ok(preset) => Ok(preset.state),
            Err(err) => {
                warn!("preset '{name}' failed to parse: {err}");
                self.cache.lock().remove(name);
                Err(err.into())
            }
        }
    }

    pub fn delete(&self, name: &str) -> Result<(), PresetError> {
        let path = self.path_for(name);
        if !path.exists() {
            return Err(PresetError::Unknown(name.to_string()));
        }
        std::fs::remove_file(path)?;
        self.cache.lock().remove(name);
        Ok(())
    }
}

impl Default for PresetManager {
    fn default() -> Self {
        Self::new()
    }
}
