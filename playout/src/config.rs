//! Speaker session configuration

/// Playback session parameters.
///
/// `sample_rate` and `bits_per_sample` describe the PCM stream the caller
/// will write; they are validated by [`Speaker::new`](crate::Speaker::new).
#[derive(Debug, Clone)]
pub struct SpeakerConfig {
    /// Samples per second of the mono PCM stream
    pub sample_rate: u32,
    /// Sample width in bits: 8, 16, 24, or 32
    pub bits_per_sample: u16,
    /// Circular buffer capacity in seconds of audio
    pub buffer_size_secs: u32,
    /// Output device index from [`available_devices`](crate::available_devices),
    /// or `None` for the system default
    pub device_index: Option<usize>,
}

impl Default for SpeakerConfig {
    fn default() -> Self {
        Self {
            sample_rate: 22050,
            bits_per_sample: 16,
            buffer_size_secs: 20,
            device_index: None,
        }
    }
}
