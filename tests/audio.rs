//! Audio pipeline integration tests
//!
//! Tests segmentation and utterance export without requiring audio hardware

use std::io::Cursor;
use std::time::Duration;

use voxturn::audio::{AudioFrame, SAMPLE_RATE, energy};
use voxturn::config::VadConfig;
use voxturn::segmenter::{Segmenter, SegmenterEvent, SegmenterState};

mod common;

use common::{FRAME_MS, FRAME_SAMPLES, frame, generate_sine_samples, speech_trace};

/// A constant-level frame, whose RMS equals `level`
fn flat(at_ms: u64, level: f32) -> AudioFrame {
    AudioFrame::new(
        vec![level; FRAME_SAMPLES],
        SAMPLE_RATE,
        Duration::from_millis(at_ms),
    )
}

fn feed(segmenter: &mut Segmenter, frames: Vec<AudioFrame>) -> Vec<SegmenterEvent> {
    frames
        .into_iter()
        .map(|f| segmenter.push(f))
        .filter(|e| *e != SegmenterEvent::Continue)
        .collect()
}

#[test]
fn test_sine_energy_levels() {
    let tone = generate_sine_samples(440.0, SAMPLE_RATE as usize, 0.3);
    let level = energy::rms(&tone);

    // RMS of a sine is amplitude / sqrt(2)
    assert!((level - 0.3 / std::f32::consts::SQRT_2).abs() < 0.01);
    assert!((energy::peak(&tone) - 0.3).abs() < 0.01);
    assert_eq!(energy::rms(&[]), 0.0);
}

#[test]
fn test_speech_activity_detection() {
    let mut segmenter = Segmenter::new(VadConfig::default());
    assert_eq!(segmenter.state(), SegmenterState::Warmup);

    // Quiet frames - should not trigger
    let events = feed(&mut segmenter, speech_trace(200, 0, 0));
    assert!(events.is_empty());
    assert_eq!(segmenter.state(), SegmenterState::Warmup);

    // A tone starts the utterance even before warmup is over
    assert_eq!(segmenter.push(frame(200, true)), SegmenterEvent::SpeechStarted);
    assert_eq!(segmenter.state(), SegmenterState::Speaking);
}

#[test]
fn test_utterance_complete_detection() {
    let mut segmenter = Segmenter::new(VadConfig::default());
    let events = feed(&mut segmenter, speech_trace(3000, 200, 1800));

    assert_eq!(events.len(), 2);
    assert_eq!(events[0], SegmenterEvent::SpeechStarted);
    let SegmenterEvent::Finalized(utterance) = &events[1] else {
        panic!("expected a finalized utterance, got {:?}", events[1]);
    };

    assert_eq!(utterance.start(), Duration::from_millis(200));
    assert_eq!(utterance.end(), Duration::from_millis(1800));
    assert_eq!(utterance.duration(), Duration::from_millis(1600));
    assert_eq!(utterance.sample_count(), 80 * FRAME_SAMPLES);
    assert_eq!(segmenter.state(), SegmenterState::Finalized);

    // Frames after finalization are ignored
    assert_eq!(segmenter.push(frame(3000, true)), SegmenterEvent::Continue);
}

#[test]
fn test_short_pause_does_not_split_utterance() {
    let mut segmenter = Segmenter::new(VadConfig::default());
    let frames: Vec<AudioFrame> = (0..150)
        .map(|i| {
            let at = i * FRAME_MS;
            // speech, a 400ms pause, more speech
            frame(at, (600..1200).contains(&at) || (1600..2000).contains(&at))
        })
        .collect();

    let events = feed(&mut segmenter, frames);
    let SegmenterEvent::Finalized(utterance) = events.last().unwrap() else {
        panic!("expected a finalized utterance");
    };
    assert_eq!(utterance.start(), Duration::from_millis(600));
    assert_eq!(utterance.end(), Duration::from_millis(2000));
}

#[test]
fn test_noise_floor_raises_threshold() {
    let config = VadConfig {
        energy_threshold: 0.1,
        ..VadConfig::default()
    };
    let mut segmenter = Segmenter::new(config);

    // Steady hum below the static threshold during warmup
    let hum: Vec<AudioFrame> = (0..25).map(|i| flat(i * FRAME_MS, 0.05)).collect();
    assert!(feed(&mut segmenter, hum).is_empty());
    assert!((segmenter.noise_floor() - 0.05).abs() < 1e-4);

    // Louder than the static threshold, but not three times the hum
    assert_eq!(segmenter.push(flat(500, 0.12)), SegmenterEvent::Continue);
    assert_eq!(segmenter.state(), SegmenterState::Waiting);
    assert!((segmenter.effective_threshold() - 0.15).abs() < 1e-4);

    assert_eq!(segmenter.push(frame(520, true)), SegmenterEvent::SpeechStarted);
}

#[test]
fn test_max_duration_caps_utterance() {
    let config = VadConfig {
        max_duration_ms: 2000,
        ..VadConfig::default()
    };
    let mut segmenter = Segmenter::new(config);

    let events = feed(&mut segmenter, speech_trace(4000, 0, 4000));
    let SegmenterEvent::Finalized(utterance) = events.last().unwrap() else {
        panic!("expected a finalized utterance");
    };
    assert_eq!(utterance.end(), Duration::from_millis(2000));
}

#[test]
fn test_no_input_timeout() {
    let mut segmenter = Segmenter::new(VadConfig::default());
    let events = feed(&mut segmenter, speech_trace(6000, 0, 0));

    assert_eq!(events, vec![SegmenterEvent::NoInput]);
    assert_eq!(segmenter.state(), SegmenterState::TimedOut);
    assert!(segmenter.flush().is_none());
}

#[test]
fn test_flush_emits_speech_in_progress() {
    let mut segmenter = Segmenter::new(VadConfig::default());
    feed(&mut segmenter, speech_trace(1000, 200, 1000));

    let utterance = segmenter.flush().expect("utterance in progress");
    assert_eq!(utterance.start(), Duration::from_millis(200));
    assert_eq!(utterance.end(), Duration::from_millis(1000));
}

#[test]
fn test_utterance_wav_roundtrip() {
    let mut segmenter = Segmenter::new(VadConfig::default());
    let events = feed(&mut segmenter, speech_trace(3000, 200, 1800));
    let Some(SegmenterEvent::Finalized(utterance)) = events.into_iter().last() else {
        panic!("expected a finalized utterance");
    };

    let wav_data = utterance.to_wav().unwrap();

    // Check WAV header magic
    assert_eq!(&wav_data[0..4], b"RIFF");
    assert_eq!(&wav_data[8..12], b"WAVE");

    // Read WAV back
    let mut reader = hound::WavReader::new(Cursor::new(wav_data)).unwrap();
    let spec = reader.spec();
    assert_eq!(spec.sample_rate, SAMPLE_RATE);
    assert_eq!(spec.channels, 1);

    let read_samples: Vec<i16> = reader.samples::<i16>().map(|s| s.unwrap()).collect();
    assert_eq!(read_samples.len(), utterance.sample_count());
}
