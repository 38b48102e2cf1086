//! Stereo pan slot management
//!
//! New voices receive pan positions spread across the stereo field
//! according to the stereo width setting. MIDI pan convention: 0 = hard
//! left, 64 = center, 127 = hard right.

use pv_core::Sample;

/// Constant-power gains for a MIDI pan value.
///
/// Left gain = `cos(pan * pi / 254)`, right gain = `sin(pan * pi / 254)`.
#[inline]
pub fn pan_gains<S: Sample>(pan: u8) -> (S, S) {
    let angle = pan.min(127) as f64 * std::f64::consts::PI / 254.0;
    (S::from_f64(angle.cos()), S::from_f64(angle.sin()))
}

/// Hands out pan positions to new voices.
///
/// The slot sequence is built center-outward: center first, then
/// alternating right/left positions at increasing offsets, scaled by
/// `stereo_width` (0 collapses every slot to center, 100 spans the full
/// field). Slots are assigned least-recently-used first and released when
/// their voice falls silent.
#[derive(Debug, Clone)]
pub struct PanningManager {
    stereo_width: u8,
    slots: Vec<u8>,
    assigned: Vec<bool>,
    last_used: Vec<u64>,
    use_counter: u64,
}

impl PanningManager {
    pub fn new() -> Self {
        let mut manager = Self {
            stereo_width: 100,
            slots: Vec::new(),
            assigned: Vec::new(),
            last_used: Vec::new(),
            use_counter: 0,
        };
        manager.rebuild(4);
        manager
    }

    /// Rebuild the slot layout for a new voice count. Control thread only.
    pub fn set_num_voices(&mut self, num_voices: usize) {
        self.rebuild(num_voices.max(1));
    }

    pub fn set_stereo_width(&mut self, width: u8) {
        if self.stereo_width == width.min(100) {
            return;
        }
        self.stereo_width = width.min(100);
        let voices = self.slots.len();
        self.rebuild(voices);
    }

    #[inline]
    pub fn stereo_width(&self) -> u8 {
        self.stereo_width
    }

    fn rebuild(&mut self, num_voices: usize) {
        self.slots.clear();

        let width = self.stereo_width as f64 / 100.0;
        let max_offset = 63.5 * width;
        let pairs = num_voices.div_ceil(2).max(1);

        self.slots.push(64);
        let mut step = 1;
        while self.slots.len() < num_voices {
            let offset = (max_offset * step as f64 / pairs as f64).round() as i16;
            self.slots.push((64 + offset).clamp(0, 127) as u8);
            if self.slots.len() < num_voices {
                self.slots.push((64 - offset).clamp(0, 127) as u8);
            }
            step += 1;
        }

        self.assigned = vec![false; self.slots.len()];
        self.last_used = vec![0; self.slots.len()];
        self.use_counter = 0;
    }

    /// Pan value for the next new voice.
    pub fn next_pan(&mut self) -> u8 {
        self.use_counter += 1;

        // first unassigned slot in layout order
        if let Some(index) = self.assigned.iter().position(|&used| !used) {
            self.assigned[index] = true;
            self.last_used[index] = self.use_counter;
            return self.slots[index];
        }

        // everything is taken: reuse the least recently assigned slot
        let mut oldest = 0;
        for i in 1..self.slots.len() {
            if self.last_used[i] < self.last_used[oldest] {
                oldest = i;
            }
        }
        self.last_used[oldest] = self.use_counter;
        self.slots[oldest]
    }

    /// Release the slot closest to a voice's pan value.
    pub fn pan_turned_off(&mut self, pan: u8) {
        let mut best: Option<usize> = None;
        let mut best_distance = i16::MAX;

        for (i, &slot) in self.slots.iter().enumerate() {
            if !self.assigned[i] {
                continue;
            }
            let distance = (slot as i16 - pan as i16).abs();
            if distance < best_distance {
                best_distance = distance;
                best = Some(i);
            }
        }

        if let Some(index) = best {
            self.assigned[index] = false;
        }
    }

    /// Release every slot.
    pub fn reset(&mut self) {
        self.assigned.fill(false);
        self.last_used.fill(0);
        self.use_counter = 0;
    }
}

impl Default for PanningManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pan_gains_law() {
        let (l, r) = pan_gains::<f64>(64);
        assert!((l - r).abs() < 0.02, "center should be balanced");

        let (l, r) = pan_gains::<f64>(0);
        assert!((l - 1.0).abs() < 1e-9);
        assert!(r.abs() < 1e-9);

        let (l, r) = pan_gains::<f64>(127);
        assert!(l > 0.0 && l < 0.03);
        assert!(r > 0.999);
    }

    #[test]
    fn test_full_width_spreads_voices() {
        let mut manager = PanningManager::new();
        manager.set_num_voices(4);

        let first = manager.next_pan();
        assert_eq!(first, 64);

        let second = manager.next_pan();
        let third = manager.next_pan();
        assert!(second > 64);
        assert!(third < 64);
        assert_eq!(second as i16 - 64, 64 - third as i16);
    }

    #[test]
    fn test_zero_width_collapses_to_center() {
        let mut manager = PanningManager::new();
        manager.set_num_voices(4);
        manager.set_stereo_width(0);

        for _ in 0..4 {
            assert_eq!(manager.next_pan(), 64);
        }
    }

    #[test]
    fn test_released_slot_is_reused() {
        let mut manager = PanningManager::new();
        manager.set_num_voices(2);

        let a = manager.next_pan();
        let b = manager.next_pan();
        manager.pan_turned_off(a);

        // the freed slot comes back before any LRU stealing
        let c = manager.next_pan();
        assert_eq!(c, a);
        assert_ne!(c, b);
    }

    #[test]
    fn test_reset_clears_assignments() {
        let mut manager = PanningManager::new();
        manager.set_num_voices(3);
        manager.next_pan();
        manager.next_pan();
        manager.reset();
        assert_eq!(manager.next_pan(), 64);
    }
}
