//! ADSR amplitude envelope
//!
//! Linear-segment envelope with per-voice independent phase. Supports the
//! harmonizer's two click-avoidance ramps: a quick attack when a stolen
//! voice is retriggered, and a quick release when a voice must be silenced
//! without its normal tail.

/// Duration of the quick attack/release ramps in milliseconds.
pub const QUICK_RAMP_MS: f64 = 5.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Idle,
    Attack,
    Decay,
    Sustain,
    Release,
}

/// Attack/decay/sustain/release envelope. Output amplitude is in `[0, 1]`.
#[derive(Debug, Clone)]
pub struct Adsr {
    sample_rate: f64,
    attack_s: f64,
    decay_s: f64,
    sustain_level: f64,
    release_s: f64,
    quick_attack_s: f64,
    quick_release_s: f64,

    stage: Stage,
    level: f64,
    step: f64,
    // duration for the release in flight, ordinary or quick
    active_release_s: f64,
}

impl Adsr {
    pub fn new(sample_rate: f64) -> Self {
        Self {
            sample_rate: sample_rate.max(1.0),
            attack_s: 0.035,
            decay_s: 0.06,
            sustain_level: 0.8,
            release_s: 0.1,
            quick_attack_s: QUICK_RAMP_MS / 1000.0,
            quick_release_s: QUICK_RAMP_MS / 1000.0,
            stage: Stage::Idle,
            level: 0.0,
            step: 0.0,
            active_release_s: 0.1,
        }
    }

    pub fn set_sample_rate(&mut self, sample_rate: f64) {
        self.sample_rate = sample_rate.max(1.0);
    }

    pub fn set_parameters(&mut self, attack_s: f64, decay_s: f64, sustain: f64, release_s: f64) {
        self.attack_s = attack_s.clamp(0.001, 1.0);
        self.decay_s = decay_s.clamp(0.001, 1.0);
        self.sustain_level = sustain.clamp(0.01, 1.0);
        self.release_s = release_s.clamp(0.001, 1.0);
    }

    pub fn set_quick_attack_ms(&mut self, ms: f64) {
        self.quick_attack_s = (ms.max(0.5)) / 1000.0;
    }

    pub fn set_quick_release_ms(&mut self, ms: f64) {
        self.quick_release_s = (ms.max(0.5)) / 1000.0;
    }

    /// Begin a note. A quick attack ramps from the current level in a few
    /// milliseconds instead of the configured attack time.
    pub fn note_on(&mut self, quick_attack: bool) {
        let attack = if quick_attack {
            self.quick_attack_s
        } else {
            self.attack_s
        };

        self.stage = Stage::Attack;
        self.step = (1.0 - self.level) / (attack * self.sample_rate).max(1.0);
    }

    /// Enter the release phase. Without tail-off the quick release is used.
    pub fn note_off(&mut self, allow_tail_off: bool) {
        if self.stage == Stage::Idle {
            return;
        }

        self.active_release_s = if allow_tail_off {
            self.release_s
        } else {
            self.quick_release_s
        };

        self.stage = Stage::Release;
        self.step = self.level / (self.active_release_s * self.sample_rate).max(1.0);
    }

    /// Force the current level, e.g. before a bypassed-envelope release.
    pub fn snap_to(&mut self, level: f64) {
        self.level = level.clamp(0.0, 1.0);
        if self.stage == Stage::Idle && self.level > 0.0 {
            self.stage = Stage::Sustain;
        }
    }

    /// Silence immediately without any ramp.
    pub fn reset(&mut self) {
        self.stage = Stage::Idle;
        self.level = 0.0;
        self.step = 0.0;
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.stage != Stage::Idle
    }

    #[inline]
    pub fn is_releasing(&self) -> bool {
        self.stage == Stage::Release
    }

    #[inline]
    pub fn level(&self) -> f64 {
        self.level
    }

    /// Advance one sample and return the amplitude.
    #[inline]
    pub fn next_gain(&mut self) -> f64 {
        match self.stage {
            Stage::Idle => 0.0,
            Stage::Attack => {
                self.level += self.step;
                if self.level >= 1.0 {
                    self.level = 1.0;
                    self.stage = Stage::Decay;
                    self.step =
                        (1.0 - self.sustain_level) / (self.decay_s * self.sample_rate).max(1.0);
                }
                self.level
            }
            Stage::Decay => {
                self.level -= self.step;
                if self.level <= self.sustain_level {
                    self.level = self.sustain_level;
                    self.stage = Stage::Sustain;
                    self.step = 0.0;
                }
                self.level
            }
            Stage::Sustain => self.level,
            Stage::Release => {
                self.level -= self.step;
                if self.level <= 0.0 {
                    self.level = 0.0;
                    self.stage = Stage::Idle;
                    self.step = 0.0;
                }
                self.level
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SR: f64 = 48_000.0;

    #[test]
    fn test_full_cycle() {
        let mut env = Adsr::new(SR);
        env.set_parameters(0.01, 0.01, 0.5, 0.01);

        env.note_on(false);
        assert!(env.is_active());

        // run through attack + decay
        let mut peak: f64 = 0.0;
        for _ in 0..(SR * 0.05) as usize {
            peak = peak.max(env.next_gain());
        }
        assert!((peak - 1.0).abs() < 1e-6);
        assert!((env.level() - 0.5).abs() < 1e-6, "sustain at {}", env.level());

        env.note_off(true);
        assert!(env.is_releasing());
        for _ in 0..(SR * 0.05) as usize {
            env.next_gain();
        }
        assert!(!env.is_active());
        assert_eq!(env.level(), 0.0);
    }

    #[test]
    fn test_quick_release_is_faster() {
        let mut env = Adsr::new(SR);
        env.set_parameters(0.001, 0.01, 1.0, 1.0);
        env.note_on(false);
        for _ in 0..1000 {
            env.next_gain();
        }

        env.note_off(false); // quick release
        let quick_samples = (QUICK_RAMP_MS / 1000.0 * SR) as usize + 2;
        for _ in 0..quick_samples {
            env.next_gain();
        }
        assert!(!env.is_active());
    }

    #[test]
    fn test_quick_attack_starts_from_current_level() {
        let mut env = Adsr::new(SR);
        env.set_parameters(0.5, 0.01, 0.8, 0.1);
        env.note_on(false);
        for _ in 0..100 {
            env.next_gain();
        }
        let level_before = env.level();
        assert!(level_before < 1.0);

        env.note_on(true); // stolen voice retrigger
        let first = env.next_gain();
        assert!(first >= level_before);
    }
}
