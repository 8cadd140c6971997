//! Audio output via cpal
//!
//! Wraps device enumeration, selection, and the output stream behind the
//! [`OutputBackend`] trait so the playback session never touches cpal types
//! directly (and tests can substitute a fake consumer).
//!
//! cpal streams are not `Send`, so [`CpalBackend`] never holds one: activation
//! spawns a keeper thread that opens the stream, owns it for the whole
//! playback run, and drops it when the session deactivates. The session side
//! only stores the keeper's join handle and a shutdown channel, both of which
//! are `Send`.

use std::sync::mpsc;
use std::sync::Arc;
use std::thread;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, SampleRate, Stream, StreamConfig, SupportedStreamConfigRange};
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::speaker::{element_to_f32, Shared};

/// Playback stream lifecycle as the session sees it.
///
/// `activate` opens the stream and begins invoking the pull callback;
/// `deactivate` tears it down and must not return while callbacks can still
/// run. Backends are driven with the session's backend lock held but never
/// the buffer lock; `deactivate` may block on the callback thread.
pub(crate) trait OutputBackend: Send {
    fn device_name(&self) -> &str;
    fn activate(&mut self, shared: Arc<Shared>) -> Result<()>;
    fn deactivate(&mut self) -> Result<()>;
}

/// List the names of all audio output devices, in selection-index order.
///
/// The returned order matches the indices accepted by
/// [`SpeakerConfig::device_index`](crate::SpeakerConfig).
pub fn available_devices() -> Result<Vec<String>> {
    let host = cpal::default_host();
    let devices: Vec<String> = host
        .output_devices()
        .map_err(|e| Error::Runtime(format!("Failed to enumerate output devices: {}", e)))?
        .map(|device| device.name().unwrap_or_else(|_| "<unknown>".to_string()))
        .collect();

    debug!("Found {} output devices", devices.len());
    Ok(devices)
}

/// Resolve a device index to a device, or the host default for `None`.
fn select_device(device_index: Option<usize>) -> Result<Device> {
    let host = cpal::default_host();
    match device_index {
        Some(index) => {
            let devices: Vec<Device> = host
                .output_devices()
                .map_err(|e| {
                    Error::Runtime(format!("Failed to enumerate output devices: {}", e))
                })?
                .collect();
            if devices.is_empty() {
                return Err(Error::Runtime(
                    "No audio output devices available".to_string(),
                ));
            }
            let count = devices.len();
            devices.into_iter().nth(index).ok_or_else(|| {
                Error::InvalidArgument(format!(
                    "Audio device index {} is out of range ({} devices available)",
                    index, count
                ))
            })
        }
        None => host.default_output_device().ok_or_else(|| {
            Error::Runtime("No default audio output device available".to_string())
        }),
    }
}

/// Renderable format preference: f32 first, then i16, then u16.
/// `None` marks formats this backend does not build streams for.
fn format_rank(format: SampleFormat) -> Option<u8> {
    match format {
        SampleFormat::F32 => Some(0),
        SampleFormat::I16 => Some(1),
        SampleFormat::U16 => Some(2),
        _ => None,
    }
}

/// Pick a stream configuration carrying the session's exact sample rate.
///
/// Samples are played at the rate they were produced; there is no resampling
/// stage, so a device that cannot do the session rate is an error rather than
/// a silent pitch shift. Among usable configurations the fewest channels win
/// (the source is mono), then the preferred sample format.
fn negotiate_config(device: &Device, sample_rate: u32) -> Result<(StreamConfig, SampleFormat)> {
    let supported = device
        .supported_output_configs()
        .map_err(|e| Error::Backend(format!("Failed to get device configs: {}", e)))?;

    let mut best: Option<SupportedStreamConfigRange> = None;
    for candidate in supported {
        if candidate.min_sample_rate().0 > sample_rate
            || candidate.max_sample_rate().0 < sample_rate
        {
            continue;
        }
        if format_rank(candidate.sample_format()).is_none() {
            continue;
        }
        let replace = match &best {
            None => true,
            Some(current) => {
                (candidate.channels(), format_rank(candidate.sample_format()))
                    < (current.channels(), format_rank(current.sample_format()))
            }
        };
        if replace {
            best = Some(candidate);
        }
    }

    let chosen = match best {
        Some(range) => range.with_sample_rate(SampleRate(sample_rate)),
        None => {
            // Some hosts advertise no matching range but still open a usable
            // default; accept it only at the exact session rate
            let default = device.default_output_config().map_err(|e| {
                Error::Backend(format!("Failed to get default device config: {}", e))
            })?;
            if default.sample_rate().0 != sample_rate
                || format_rank(default.sample_format()).is_none()
            {
                return Err(Error::Backend(format!(
                    "Audio device does not support {} Hz playback",
                    sample_rate
                )));
            }
            default
        }
    };

    let sample_format = chosen.sample_format();
    Ok((chosen.config(), sample_format))
}

/// Handle to the thread keeping the cpal stream alive.
struct StreamWorker {
    /// Dropping this disconnects the keeper's receiver and wakes it up.
    shutdown_tx: mpsc::Sender<()>,
    handle: thread::JoinHandle<()>,
}

/// cpal-backed output: selects a device at construction, opens the stream on
/// a keeper thread at activation.
pub(crate) struct CpalBackend {
    device_index: Option<usize>,
    device_name: String,
    config: StreamConfig,
    sample_format: SampleFormat,
    element_size: usize,
    worker: Option<StreamWorker>,
}

impl CpalBackend {
    /// Select the output device and negotiate a configuration for
    /// `sample_rate`. The stream itself is opened lazily by `activate`.
    pub(crate) fn new(
        sample_rate: u32,
        element_size: usize,
        device_index: Option<usize>,
    ) -> Result<Self> {
        let device = select_device(device_index)?;
        let device_name = device.name().unwrap_or_else(|_| "<unknown>".to_string());
        let (config, sample_format) = negotiate_config(&device, sample_rate)?;

        info!(
            "Using audio device \"{}\": {} Hz, {} channels, {:?}",
            device_name, config.sample_rate.0, config.channels, sample_format
        );

        Ok(Self {
            device_index,
            device_name,
            config,
            sample_format,
            element_size,
            worker: None,
        })
    }
}

impl OutputBackend for CpalBackend {
    fn device_name(&self) -> &str {
        &self.device_name
    }

    fn activate(&mut self, shared: Arc<Shared>) -> Result<()> {
        if self.worker.is_some() {
            return Err(Error::DeviceAlreadyInitialized(
                "Output stream is already active".to_string(),
            ));
        }

        let (ready_tx, ready_rx) = mpsc::channel();
        let (shutdown_tx, shutdown_rx) = mpsc::channel();
        let device_index = self.device_index;
        let config = self.config.clone();
        let sample_format = self.sample_format;
        let element_size = self.element_size;

        let handle = thread::spawn(move || {
            run_stream(
                device_index,
                config,
                sample_format,
                element_size,
                shared,
                ready_tx,
                shutdown_rx,
            );
        });

        match ready_rx.recv() {
            Ok(Ok(())) => {
                self.worker = Some(StreamWorker {
                    shutdown_tx,
                    handle,
                });
                debug!("Output stream active");
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(_) => {
                let _ = handle.join();
                Err(Error::Runtime(
                    "Audio output thread exited before the stream started".to_string(),
                ))
            }
        }
    }

    fn deactivate(&mut self) -> Result<()> {
        if let Some(worker) = self.worker.take() {
            drop(worker.shutdown_tx);
            if worker.handle.join().is_err() {
                return Err(Error::Runtime(
                    "Audio output thread panicked".to_string(),
                ));
            }
            debug!("Output stream deactivated");
        }
        Ok(())
    }
}

impl Drop for CpalBackend {
    fn drop(&mut self) {
        let _ = self.deactivate();
    }
}

/// Keeper thread body: owns the stream from open to drop.
///
/// Reports the startup outcome once through `ready_tx`, then parks on
/// `shutdown_rx` until the session side drops its sender.
fn run_stream(
    device_index: Option<usize>,
    config: StreamConfig,
    sample_format: SampleFormat,
    element_size: usize,
    shared: Arc<Shared>,
    ready_tx: mpsc::Sender<Result<()>>,
    shutdown_rx: mpsc::Receiver<()>,
) {
    let stream = match open_stream(device_index, &config, sample_format, element_size, shared) {
        Ok(stream) => stream,
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };

    if let Err(e) = stream.play() {
        let _ = ready_tx.send(Err(map_play_error(e)));
        return;
    }
    let _ = ready_tx.send(Ok(()));

    let _ = shutdown_rx.recv();

    if let Err(e) = stream.pause() {
        warn!("Failed to pause output stream: {}", e);
    }
    drop(stream);
}

fn open_stream(
    device_index: Option<usize>,
    config: &StreamConfig,
    sample_format: SampleFormat,
    element_size: usize,
    shared: Arc<Shared>,
) -> Result<Stream> {
    // Re-resolved on every activation; the device may have gone away since
    // the session was created
    let device = select_device(device_index)?;
    match sample_format {
        SampleFormat::F32 => build_stream_f32(&device, config, element_size, shared),
        SampleFormat::I16 => build_stream_i16(&device, config, element_size, shared),
        SampleFormat::U16 => build_stream_u16(&device, config, element_size, shared),
        sample_format => Err(Error::Backend(format!(
            "Unsupported sample format: {:?}",
            sample_format
        ))),
    }
}

/// Build audio stream for f32 samples.
fn build_stream_f32(
    device: &Device,
    config: &StreamConfig,
    element_size: usize,
    shared: Arc<Shared>,
) -> Result<Stream> {
    let channels = config.channels.max(1) as usize;
    // Sized for the largest plausible callback request; the real-time
    // callback must never allocate
    let mut scratch = vec![0u8; config.sample_rate.0 as usize * element_size];

    let stream = device
        .build_output_stream(
            config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                let frames = data.len() / channels;
                let read = shared.pull_elements(&mut scratch, frames);

                for (frame, element) in data
                    .chunks_mut(channels)
                    .zip(scratch[..read * element_size].chunks_exact(element_size))
                {
                    frame.fill(element_to_f32(element));
                }
                // Starved frames play as silence
                data[read * channels..].fill(0.0);
            },
            |err| error!("Audio output stream error: {}", err),
            None,
        )
        .map_err(map_build_error)?;

    Ok(stream)
}

/// Build audio stream for i16 samples.
fn build_stream_i16(
    device: &Device,
    config: &StreamConfig,
    element_size: usize,
    shared: Arc<Shared>,
) -> Result<Stream> {
    let channels = config.channels.max(1) as usize;
    let mut scratch = vec![0u8; config.sample_rate.0 as usize * element_size];

    let stream = device
        .build_output_stream(
            config,
            move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                let frames = data.len() / channels;
                let read = shared.pull_elements(&mut scratch, frames);

                for (frame, element) in data
                    .chunks_mut(channels)
                    .zip(scratch[..read * element_size].chunks_exact(element_size))
                {
                    let value = element_to_f32(element).clamp(-1.0, 1.0);
                    frame.fill((value * i16::MAX as f32) as i16);
                }
                data[read * channels..].fill(0);
            },
            |err| error!("Audio output stream error: {}", err),
            None,
        )
        .map_err(map_build_error)?;

    Ok(stream)
}

/// Build audio stream for u16 samples.
fn build_stream_u16(
    device: &Device,
    config: &StreamConfig,
    element_size: usize,
    shared: Arc<Shared>,
) -> Result<Stream> {
    let channels = config.channels.max(1) as usize;
    let mut scratch = vec![0u8; config.sample_rate.0 as usize * element_size];

    let stream = device
        .build_output_stream(
            config,
            move |data: &mut [u16], _: &cpal::OutputCallbackInfo| {
                let frames = data.len() / channels;
                let read = shared.pull_elements(&mut scratch, frames);

                for (frame, element) in data
                    .chunks_mut(channels)
                    .zip(scratch[..read * element_size].chunks_exact(element_size))
                {
                    let value = element_to_f32(element).clamp(-1.0, 1.0);
                    // Convert from [-1.0, 1.0] to [0, 65535]
                    frame.fill(((value + 1.0) * 32767.5) as u16);
                }
                data[read * channels..].fill(32767);
            },
            |err| error!("Audio output stream error: {}", err),
            None,
        )
        .map_err(map_build_error)?;

    Ok(stream)
}

fn map_build_error(e: cpal::BuildStreamError) -> Error {
    match e {
        cpal::BuildStreamError::DeviceNotAvailable => Error::DeviceNotInitialized(
            "Audio output device is no longer available".to_string(),
        ),
        other => Error::Backend(format!("Failed to build output stream: {}", other)),
    }
}

fn map_play_error(e: cpal::PlayStreamError) -> Error {
    match e {
        cpal::PlayStreamError::DeviceNotAvailable => Error::DeviceNotInitialized(
            "Audio output device is no longer available".to_string(),
        ),
        other => Error::Backend(format!("Failed to start output stream: {}", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Device-dependent paths are exercised in the integration tests; these
    // must pass with or without audio hardware present.

    #[test]
    fn test_device_enumeration_does_not_panic() {
        match available_devices() {
            Ok(devices) => println!("Found {} output devices", devices.len()),
            Err(e) => println!("Enumeration unavailable in this environment: {}", e),
        }
    }

    #[test]
    fn test_out_of_range_index_is_rejected() {
        // Either no devices at all (Runtime) or the index is out of range
        // (InvalidArgument); never a success
        assert!(select_device(Some(usize::MAX)).is_err());
    }

    #[test]
    fn test_format_preference_order() {
        assert!(format_rank(SampleFormat::F32) < format_rank(SampleFormat::I16));
        assert!(format_rank(SampleFormat::I16) < format_rank(SampleFormat::U16));
        assert_eq!(format_rank(SampleFormat::I8), None);
        assert_eq!(format_rank(SampleFormat::F64), None);
    }
}
