//! pv-engine: the Polyvox harmonizer engine
//!
//! A real-time pitch-shifting vocal harmonizer: a monophonic modulator
//! signal is analyzed for pitch, and polyphonic MIDI input drives
//! pitch-shifted copies of it, mixed down to stereo.
//!
//! ## Modules
//! - `voice` - one pitch-shifting synthesis voice with ADSR and pan
//! - `harmonizer` - the voice pool and the complete MIDI note lifecycle
//!   (latch modes, pedal pitch, descant, pedals, stealing)
//! - `chunking` - fixed-block regulation over host-sized blocks via
//!   audio + MIDI FIFOs, plus the gain/mix/limit signal chain
//! - `processor` - host facade: layout checks, per-block parameter
//!   sampling, dual-precision engines
//! - `params` - the lock-free parameter bank
//! - `state` - persisted state and preset files

pub mod voice;
pub mod harmonizer;
pub mod chunking;
pub mod processor;
pub mod params;
pub mod state;

pub use voice::{HarmonizerVoice, VoiceRole};
pub use harmonizer::{AutomatedNote, Harmonizer};
pub use chunking::{Engine, EngineStatus, ModulatorSource, SampleFifo};
pub use processor::{BusLayout, Precision, Processor};
pub use params::{ParamSnapshot, ParameterBank};
pub use state::{EngineState, PresetError, PresetFile, PresetManager};
