//! End-to-end engine tests
//!
//! Runs real audio through the harmonizer and the chunked engine: the
//! interval latch following a moving input pitch, block-count invariants
//! across host block sizes, state round-trips, and latch/release timing.

use pv_core::{MidiBuffer, MidiEvent, StereoBuffer};
use pv_dsp::pitch::VocalRange;
use pv_engine::{Harmonizer, Precision, Processor, VoiceRole};

const SR: f64 = 44_100.0;

fn sine(freq: f64, len: usize) -> Vec<f64> {
    (0..len)
        .map(|i| (std::f64::consts::TAU * freq * i as f64 / SR).sin())
        .collect()
}

fn sounding_notes(h: &Harmonizer<f64>) -> Vec<u8> {
    let mut notes: Vec<u8> = h
        .voices()
        .iter()
        .filter(|v| v.is_active() && !v.is_releasing())
        .map(|v| v.playing_note())
        .collect();
    notes.sort_unstable();
    notes
}

/// Interval latch: engage over a held chord, release the keys, then slide
/// the input pitch; the chord must follow in parallel.
#[test]
fn interval_latch_follows_input_pitch() {
    let mut h = Harmonizer::<f64>::new(4, SR);
    h.set_vocal_range(VocalRange::Tenor);
    let block = h.latency_samples();
    h.prepare(SR, block);

    let a3 = sine(220.0, block); // A3
    let g3 = sine(196.0, block); // G3
    let mut out = StereoBuffer::new(block);

    // hold A3 + C#4 + E4 while singing A3
    let mut midi = MidiBuffer::new();
    midi.push(MidiEvent::note_on(0, 0, 57, 100));
    midi.push(MidiEvent::note_on(1, 0, 61, 100));
    midi.push(MidiEvent::note_on(2, 0, 64, 100));
    h.render_voices(&a3, &mut out, &mut midi);

    assert!((h.current_input_freq() - 220.0).abs() < 4.0);

    h.set_interval_latch(true, true);
    let mut intervals = h.intervals_latched().to_vec();
    intervals.sort_unstable();
    assert_eq!(intervals, vec![0, 4, 7]);

    // release the keys: the latch holds the chord
    let mut midi = MidiBuffer::new();
    midi.push(MidiEvent::note_off(0, 0, 57, 64));
    midi.push(MidiEvent::note_off(1, 0, 61, 64));
    midi.push(MidiEvent::note_off(2, 0, 64, 64));
    h.render_voices(&a3, &mut out, &mut midi);

    assert_eq!(sounding_notes(&h), vec![57, 61, 64]);
    assert!(h
        .voices()
        .iter()
        .filter(|v| v.is_active())
        .all(|v| !v.is_key_down()));

    // slide the input down a whole tone
    let mut midi = MidiBuffer::new();
    h.render_voices(&g3, &mut out, &mut midi);

    assert_eq!(sounding_notes(&h), vec![55, 59, 62]);
    assert_eq!(
        h.voices().iter().filter(|v| v.is_active()).count(),
        3,
        "exactly three voices active"
    );
    assert!(h
        .voices()
        .iter()
        .filter(|v| v.is_active())
        .all(|v| v.role() == VoiceRole::Normal));
}

/// Every rendered host block returns exactly as many samples as it
/// received, and MIDI output timestamps stay inside the block.
#[test]
fn block_counts_match_for_every_host_size() {
    let mut processor = Processor::new();
    processor.prepare_to_play(SR, 512, Precision::Single);
    let latency = processor.latency_samples();
    assert!(latency > 0);

    for &host_block in &[16usize, 250, 512, 1024, latency * 2 + 31] {
        let input: Vec<f32> = (0..host_block)
            .map(|i| (std::f64::consts::TAU * 220.0 * i as f64 / SR).sin() as f32)
            .collect();
        let right = input.clone();
        let mut out_l = vec![0.0f32; host_block];
        let mut out_r = vec![0.0f32; host_block];

        let mut midi = MidiBuffer::new();
        midi.push(MidiEvent::note_on(0, 0, 64, 100));
        midi.push(MidiEvent::note_off((host_block as u32).saturating_sub(1), 0, 64, 64));

        processor.process_block_f32(&input, Some(&right), &mut out_l, &mut out_r, &mut midi);

        assert!(out_l.iter().chain(out_r.iter()).all(|s| s.is_finite()));
        assert!(
            midi.events()
                .iter()
                .all(|e| (e.sample_offset as usize) < host_block.max(1)),
            "timestamps within block of {host_block}"
        );
        let stamps: Vec<u32> = midi.events().iter().map(|e| e.sample_offset).collect();
        assert!(stamps.windows(2).all(|w| w[0] <= w[1]));
    }
}

/// Preset save-then-load restores an observationally identical state.
#[test]
fn preset_round_trip_is_lossless() {
    let dir = std::env::temp_dir().join(format!("polyvox-e2e-{}", std::process::id()));
    let manager = pv_engine::PresetManager::with_directory(dir.clone());
    let processor = Processor::with_preset_manager(manager);

    processor.params().dry_wet.set(42);
    processor.params().pedal_pitch_on.set(true);
    processor.params().pedal_pitch_thresh.set(55);
    processor.params().num_voices.set(6);
    processor.params().modulator_source.set(2);
    processor.params().concert_pitch_hz.set(442);

    processor.save_preset("Verification").unwrap();

    // scramble, then recall
    processor.params().dry_wet.set(0);
    processor.params().pedal_pitch_on.set(false);
    processor.params().num_voices.set(2);

    processor.load_preset("Verification").unwrap();

    let state = processor.state();
    assert_eq!(state.dry_wet, 42);
    assert!(state.pedal_pitch_on);
    assert_eq!(state.pedal_pitch_thresh, 55);
    assert_eq!(state.number_of_voices, 6);
    assert_eq!(state.modulator_input_source, 2);
    assert_eq!(state.concert_pitch_hz, 442);

    let _ = std::fs::remove_dir_all(dir);
}

/// A malformed preset on disk leaves the current state untouched.
#[test]
fn broken_preset_preserves_current_state() {
    let dir = std::env::temp_dir().join(format!("polyvox-broken-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("Corrupt.json"), "not a preset").unwrap();

    let manager = pv_engine::PresetManager::with_directory(dir.clone());
    let processor = Processor::with_preset_manager(manager);
    processor.params().dry_wet.set(33);

    assert!(processor.load_preset("Corrupt").is_err());
    assert_eq!(processor.state().dry_wet, 33);

    let _ = std::fs::remove_dir_all(dir);
}

/// With latch off and no pedals, a note off releases the voice within the
/// configured release time.
#[test]
fn note_off_releases_within_release_time() {
    let mut h = Harmonizer::<f64>::new(4, SR);
    let block = h.latency_samples();
    h.prepare(SR, block);
    h.set_adsr_parameters(0.001, 0.01, 1.0, 0.05);

    let input = sine(220.0, block);
    let mut out = StereoBuffer::new(block);

    let mut midi = MidiBuffer::new();
    midi.push(MidiEvent::note_on(0, 0, 57, 100));
    h.render_voices(&input, &mut out, &mut midi);
    assert_eq!(sounding_notes(&h), vec![57]);

    let mut midi = MidiBuffer::new();
    midi.push(MidiEvent::note_off(0, 0, 57, 64));
    h.render_voices(&input, &mut out, &mut midi);
    assert!(h.voices().iter().all(|v| !v.is_active() || v.is_releasing()));

    // 50 ms release at 44.1 kHz is well under three blocks
    let release_blocks = (0.05 * SR / block as f64).ceil() as usize + 2;
    for _ in 0..release_blocks {
        let mut midi = MidiBuffer::new();
        h.render_voices(&input, &mut out, &mut midi);
    }
    assert!(h.voices().iter().all(|v| !v.is_active()));
}

/// The wet path actually synthesizes sound for an active note.
#[test]
fn harmonizer_produces_wet_signal() {
    let mut h = Harmonizer::<f64>::new(4, SR);
    let block = h.latency_samples();
    h.prepare(SR, block);

    let input = sine(220.0, block);
    let mut out = StereoBuffer::new(block);

    let mut midi = MidiBuffer::new();
    midi.push(MidiEvent::note_on(0, 0, 64, 110));
    h.render_voices(&input, &mut out, &mut midi);

    let mut energy = 0.0;
    for _ in 0..3 {
        let mut midi = MidiBuffer::new();
        h.render_voices(&input, &mut out, &mut midi);
        energy = out.left().iter().map(|s| s * s).sum::<f64>()
            + out.right().iter().map(|s| s * s).sum::<f64>();
    }

    assert!(energy > 0.01, "wet energy {energy}");
}
