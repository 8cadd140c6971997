//! Buffered mono PCM playback through the system audio device
//!
//! A [`Speaker`] queues raw little-endian PCM samples (8, 16, 24, or 32 bit)
//! into a fixed-capacity ring buffer and plays them through an output device,
//! converting to whatever sample format the device negotiated. Writes never
//! block; [`Speaker::flush`] blocks until every queued sample has actually
//! reached the hardware. Playback can optionally be mirrored to a WAV file.
//!
//! ```no_run
//! use playout::{Speaker, SpeakerConfig};
//!
//! fn main() -> playout::Result<()> {
//!     let speaker = Speaker::new(SpeakerConfig::default())?;
//!     speaker.start()?;
//!
//!     // One second of a quiet 440 Hz tone as 16-bit samples
//!     let samples: Vec<i16> = (0..22050)
//!         .map(|i| ((i as f32 * 0.125).sin() * 8000.0) as i16)
//!         .collect();
//!     let pcm: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
//!
//!     let mut offset = 0;
//!     while offset < pcm.len() {
//!         offset += speaker.write(&pcm[offset..])? * 2;
//!     }
//!     speaker.flush(&[])?;
//!     speaker.stop()?;
//!     Ok(())
//! }
//! ```

mod config;
mod error;
mod output;
mod ring_buffer;
mod speaker;
mod wav_sink;

pub use config::SpeakerConfig;
pub use error::{Error, Result};
pub use output::available_devices;
pub use ring_buffer::RingBuffer;
pub use speaker::Speaker;

/// Library version string.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    #[test]
    fn test_version_is_populated() {
        let version = super::version();
        assert!(!version.is_empty());
        assert!(version.chars().next().unwrap().is_ascii_digit());
    }
}
