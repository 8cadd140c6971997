//! End-to-end playback tests against real audio hardware.
//!
//! Environments without a usable output device (headless CI) make these
//! degrade to no-ops with a note on stdout rather than failures. Tests are
//! serialized because they contend for the same physical device.

use std::time::Duration;

use playout::{available_devices, Speaker, SpeakerConfig};
use serial_test::serial;

fn open_speaker(config: SpeakerConfig) -> Option<Speaker> {
    match Speaker::new(config) {
        Ok(speaker) => Some(speaker),
        Err(e) => {
            println!("Skipping hardware test, no usable output device: {}", e);
            None
        }
    }
}

/// 440 Hz tone as 16-bit little-endian mono PCM.
fn tone_16bit(sample_rate: u32, millis: u32) -> Vec<u8> {
    let samples = (sample_rate * millis / 1000) as usize;
    (0..samples)
        .map(|i| {
            let phase = i as f32 * 440.0 * 2.0 * std::f32::consts::PI / sample_rate as f32;
            (phase.sin() * 6000.0) as i16
        })
        .flat_map(|s| s.to_le_bytes())
        .collect()
}

#[test]
#[serial]
fn lists_output_devices() {
    match available_devices() {
        Ok(devices) => {
            for (index, name) in devices.iter().enumerate() {
                println!("index: {}, device name: {}", index, name);
            }
        }
        Err(e) => println!("Skipping, enumeration unavailable: {}", e),
    }
}

#[test]
#[serial]
fn rejects_absurd_device_index() {
    // Fails in every environment: with devices present the index is out of
    // range, without any the default lookup fails
    let config = SpeakerConfig {
        device_index: Some(usize::MAX),
        ..SpeakerConfig::default()
    };
    assert!(Speaker::new(config).is_err());
}

#[test]
#[serial]
fn plays_and_mirrors_a_tone() {
    let config = SpeakerConfig {
        sample_rate: 22050,
        bits_per_sample: 16,
        buffer_size_secs: 2,
        device_index: None,
    };
    let speaker = match open_speaker(config) {
        Some(speaker) => speaker,
        None => return,
    };

    println!("Playing through: {}", speaker.selected_device());
    assert!(!speaker.selected_device().is_empty());

    let dir = tempfile::tempdir().unwrap();
    let mirror = dir.path().join("played.wav");
    speaker.write_to_file(&mirror).unwrap();
    assert!(mirror.exists());

    speaker.start().unwrap();
    assert!(speaker.is_started());

    let pcm = tone_16bit(22050, 150);
    let mut offset = 0;
    while offset < pcm.len() {
        let written = speaker.write(&pcm[offset..]).unwrap();
        if written == 0 {
            std::thread::sleep(Duration::from_millis(2));
        }
        offset += written * 2;
    }
    speaker.flush(&[]).unwrap();
    speaker.stop().unwrap();
    assert!(!speaker.is_started());

    // The mirror holds exactly the samples that were accepted for playback
    let mut reader = hound::WavReader::open(&mirror).unwrap();
    let spec = reader.spec();
    assert_eq!(spec.channels, 1);
    assert_eq!(spec.sample_rate, 22050);
    assert_eq!(spec.bits_per_sample, 16);

    let mirrored: Vec<i16> = reader.samples::<i16>().map(|s| s.unwrap()).collect();
    let expected: Vec<i16> = pcm
        .chunks_exact(2)
        .map(|c| i16::from_le_bytes([c[0], c[1]]))
        .collect();
    assert_eq!(mirrored, expected);
}

#[test]
#[serial]
fn survives_restart_cycles() {
    let config = SpeakerConfig {
        sample_rate: 16000,
        bits_per_sample: 16,
        buffer_size_secs: 1,
        device_index: None,
    };
    let speaker = match open_speaker(config) {
        Some(speaker) => speaker,
        None => return,
    };

    for _ in 0..3 {
        speaker.start().unwrap();
        let written = speaker.write(&tone_16bit(16000, 40)).unwrap();
        assert!(written > 0);
        speaker.flush(&[]).unwrap();
        speaker.stop().unwrap();
    }
}
