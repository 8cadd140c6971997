//! playout-demo - plays a mono WAV file through the system audio device
//!
//! Feeds the file's PCM through the non-blocking write path, drains with a
//! final flush so the last samples are not cut off, and can mirror everything
//! played into a second WAV file.

use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use playout::{available_devices, Speaker, SpeakerConfig};

/// Command-line arguments for playout-demo
#[derive(Parser, Debug)]
#[command(name = "playout-demo")]
#[command(about = "Plays a mono WAV file through an audio output device")]
#[command(version)]
struct Args {
    /// List available audio output devices and exit
    #[arg(long)]
    show_audio_devices: bool,

    /// Path to the mono WAV file to play
    #[arg(short, long)]
    input_wav_path: Option<PathBuf>,

    /// Index of the output device to use (-1 for the system default)
    #[arg(short = 'd', long, default_value_t = -1, env = "PLAYOUT_DEVICE_INDEX")]
    audio_device_index: i32,

    /// Playback buffer capacity in seconds
    #[arg(short, long, default_value_t = 20)]
    buffer_size_secs: u32,

    /// Mirror everything played into this WAV file
    #[arg(short, long)]
    output_wav_path: Option<PathBuf>,
}

fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "playout_demo=info,playout=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    if args.show_audio_devices {
        let devices = available_devices().context("Failed to enumerate audio devices")?;
        for (index, name) in devices.iter().enumerate() {
            println!("index: {}, device name: {}", index, name);
        }
        return Ok(());
    }

    let input = args
        .input_wav_path
        .context("--input-wav-path is required unless --show-audio-devices is used")?;

    let (pcm, sample_rate, bits_per_sample) = load_wav(&input)?;
    let element_size = bits_per_sample as usize / 8;
    info!(
        "Loaded {}: {} samples, {} Hz, {} bit",
        input.display(),
        pcm.len() / element_size,
        sample_rate,
        bits_per_sample
    );

    let device_index = if args.audio_device_index >= 0 {
        Some(args.audio_device_index as usize)
    } else {
        None
    };
    let config = SpeakerConfig {
        sample_rate,
        bits_per_sample,
        buffer_size_secs: args.buffer_size_secs,
        device_index,
    };
    let speaker = Speaker::new(config).context("Failed to open the audio device")?;
    info!("Playing through device: {}", speaker.selected_device());

    if let Some(path) = &args.output_wav_path {
        speaker
            .write_to_file(path)
            .with_context(|| format!("Failed to create mirror file {}", path.display()))?;
    }

    speaker.start().context("Failed to start playback")?;

    let mut offset = 0;
    while offset < pcm.len() {
        let written = speaker
            .write(&pcm[offset..])
            .context("Failed to queue samples")?;
        if written == 0 {
            // Buffer full: give the device time to consume some audio
            thread::sleep(Duration::from_millis(2));
        }
        offset += written * element_size;
    }

    speaker.flush(&[]).context("Failed to drain playback")?;
    speaker.stop().context("Failed to stop playback")?;
    info!("Playback complete");

    Ok(())
}

/// Read a mono integer-PCM WAV file into the byte layout the speaker
/// consumes: whole little-endian samples at the file's native width.
fn load_wav(path: &Path) -> Result<(Vec<u8>, u32, u16)> {
    let mut reader = hound::WavReader::open(path)
        .with_context(|| format!("Failed to open WAV file {}", path.display()))?;
    let spec = reader.spec();

    if spec.channels != 1 {
        bail!("WAV file must be mono (found {} channels)", spec.channels);
    }
    if spec.sample_format != hound::SampleFormat::Int {
        bail!("WAV file must contain integer PCM samples");
    }

    let mut pcm = Vec::new();
    match spec.bits_per_sample {
        8 => {
            // Stored unsigned in the file; the reader hands them over
            // re-centered around zero
            for sample in reader.samples::<i32>() {
                let sample = sample.context("Failed to decode sample")?;
                pcm.push((sample + 128).clamp(0, 255) as u8);
            }
        }
        16 => {
            for sample in reader.samples::<i32>() {
                let sample = sample.context("Failed to decode sample")?;
                pcm.extend_from_slice(&(sample as i16).to_le_bytes());
            }
        }
        24 => {
            for sample in reader.samples::<i32>() {
                let sample = sample.context("Failed to decode sample")?;
                pcm.extend_from_slice(&sample.to_le_bytes()[..3]);
            }
        }
        32 => {
            for sample in reader.samples::<i32>() {
                let sample = sample.context("Failed to decode sample")?;
                pcm.extend_from_slice(&sample.to_le_bytes());
            }
        }
        bits => bail!("Unsupported WAV bit depth: {}", bits),
    }

    Ok((pcm, spec.sample_rate, spec.bits_per_sample))
}
