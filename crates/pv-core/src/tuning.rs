//! Tuning math: concert pitch, pitch bend, and velocity mapping

use crate::midi::PITCH_WHEEL_CENTER;

/// Allowed concert pitch range in Hz (A4)
pub const MIN_CONCERT_PITCH_HZ: u16 = 392;
pub const MAX_CONCERT_PITCH_HZ: u16 = 494;
pub const DEFAULT_CONCERT_PITCH_HZ: u16 = 440;

/// Converts between MIDI note numbers and frequencies, aware of the
/// configurable concert pitch (A4 reference).
#[derive(Debug, Clone, Copy)]
pub struct PitchConverter {
    concert_pitch_hz: f64,
}

impl PitchConverter {
    pub fn new() -> Self {
        Self {
            concert_pitch_hz: DEFAULT_CONCERT_PITCH_HZ as f64,
        }
    }

    pub fn set_concert_pitch(&mut self, hz: u16) {
        self.concert_pitch_hz = hz.clamp(MIN_CONCERT_PITCH_HZ, MAX_CONCERT_PITCH_HZ) as f64;
    }

    #[inline]
    pub fn concert_pitch_hz(&self) -> f64 {
        self.concert_pitch_hz
    }

    /// Fractional MIDI note → frequency in Hz.
    #[inline]
    pub fn midi_to_hz(&self, midi: f64) -> f64 {
        self.concert_pitch_hz * 2.0_f64.powf((midi - 69.0) / 12.0)
    }

    /// Frequency in Hz → fractional MIDI note.
    #[inline]
    pub fn hz_to_midi(&self, hz: f64) -> f64 {
        12.0 * (hz / self.concert_pitch_hz).log2() + 69.0
    }
}

impl Default for PitchConverter {
    fn default() -> Self {
        Self::new()
    }
}

/// Tracks the last received pitch wheel position and the configured bend
/// ranges, and converts them to a semitone offset.
#[derive(Debug, Clone, Copy)]
pub struct PitchBendTracker {
    range_up: u8,
    range_down: u8,
    last_wheel: u16,
}

impl PitchBendTracker {
    pub fn new() -> Self {
        Self {
            range_up: 2,
            range_down: 2,
            last_wheel: PITCH_WHEEL_CENTER,
        }
    }

    pub fn set_range(&mut self, up: u8, down: u8) {
        self.range_up = up.min(12);
        self.range_down = down.min(12);
    }

    pub fn wheel_received(&mut self, wheel: u16) {
        self.last_wheel = wheel.min(16383);
    }

    #[inline]
    pub fn last_wheel(&self) -> u16 {
        self.last_wheel
    }

    /// Current bend offset in (fractional) semitones.
    #[inline]
    pub fn bend_semitones(&self) -> f64 {
        let wheel = self.last_wheel as f64;
        let center = PITCH_WHEEL_CENTER as f64;
        let range = if self.last_wheel >= PITCH_WHEEL_CENTER {
            self.range_up
        } else {
            self.range_down
        };
        ((wheel - center) / center) * range as f64
    }

    /// A note number adjusted by the current bend, as fractional MIDI.
    #[inline]
    pub fn note_with_bend(&self, note: u8) -> f64 {
        note as f64 + self.bend_semitones()
    }
}

impl Default for PitchBendTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Maps raw note velocities to gain according to a sensitivity setting.
///
/// At sensitivity 100 the gain tracks the velocity linearly; at 0 every note
/// sounds at full gain.
#[derive(Debug, Clone, Copy)]
pub struct VelocityTracker {
    sensitivity: u8,
}

impl VelocityTracker {
    pub fn new() -> Self {
        Self { sensitivity: 100 }
    }

    pub fn set_sensitivity(&mut self, sensitivity: u8) {
        self.sensitivity = sensitivity.min(100);
    }

    #[inline]
    pub fn gain_for(&self, velocity: f32) -> f32 {
        let velocity = velocity.clamp(0.0, 1.0);
        1.0 - (self.sensitivity as f32 / 100.0) * (1.0 - velocity)
    }
}

impl Default for VelocityTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_midi_to_hz_a440() {
        let converter = PitchConverter::new();
        assert!((converter.midi_to_hz(69.0) - 440.0).abs() < 1e-9);
        assert!((converter.midi_to_hz(57.0) - 220.0).abs() < 1e-9);
        assert!((converter.hz_to_midi(440.0) - 69.0).abs() < 1e-9);
    }

    #[test]
    fn test_concert_pitch_clamped() {
        let mut converter = PitchConverter::new();
        converter.set_concert_pitch(1000);
        assert_eq!(converter.concert_pitch_hz(), MAX_CONCERT_PITCH_HZ as f64);
        converter.set_concert_pitch(100);
        assert_eq!(converter.concert_pitch_hz(), MIN_CONCERT_PITCH_HZ as f64);
    }

    #[test]
    fn test_bend_offsets() {
        let mut bend = PitchBendTracker::new();
        assert_eq!(bend.bend_semitones(), 0.0);

        bend.wheel_received(16383);
        assert!((bend.bend_semitones() - 2.0).abs() < 0.01);

        bend.wheel_received(0);
        assert!((bend.bend_semitones() + 2.0).abs() < 0.01);

        bend.set_range(12, 2);
        bend.wheel_received(16383);
        assert!((bend.bend_semitones() - 12.0).abs() < 0.01);
    }

    #[test]
    fn test_velocity_sensitivity() {
        let mut tracker = VelocityTracker::new();
        assert!((tracker.gain_for(0.5) - 0.5).abs() < 1e-6);

        tracker.set_sensitivity(0);
        assert!((tracker.gain_for(0.1) - 1.0).abs() < 1e-6);

        tracker.set_sensitivity(50);
        assert!((tracker.gain_for(0.0) - 0.5).abs() < 1e-6);
    }
}
