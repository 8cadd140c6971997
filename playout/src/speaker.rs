//! Playback session management
//!
//! A [`Speaker`] owns the sample ring buffer, the output backend, and an
//! optional WAV mirror sink. The producer thread feeds PCM through
//! [`Speaker::write`] / [`Speaker::flush`]; the backend drains it from its own
//! callback thread via [`Shared::pull_elements`].
//!
//! ## Thread Safety
//!
//! All buffer state lives in `Shared` behind a single mutex, locked just long
//! enough for one buffer operation so the real-time callback thread is never
//! held up by file I/O or sample conversion. `started` and `flush_cancelled`
//! are atomics readable without the lock.
//!
//! ## Flush handshake
//!
//! `flush` must not return while the final samples still sit in the hardware's
//! own output buffer. After its write phase it marks the session
//! `drained_and_idle` once the ring is empty, then waits for the callback to
//! run one more time and observe that state. The observation is recorded as
//! the flush generation that was current at the time (`observed_empty_epoch`),
//! so a later flush can never mistake an earlier flush's leftover signal for
//! its own.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use tracing::{debug, info, trace, warn};

use crate::config::SpeakerConfig;
use crate::error::{Error, Result};
use crate::output::{CpalBackend, OutputBackend};
use crate::ring_buffer::RingBuffer;
use crate::wav_sink::WavSink;

/// Poll interval for the flush write/drain loops.
///
/// Polling trades extra wake-ups for a much simpler correctness argument than
/// a condvar signalled from the real-time callback.
const FLUSH_POLL_INTERVAL: Duration = Duration::from_millis(2);

/// Buffer state guarded by the session mutex.
struct PlaybackState {
    ring: RingBuffer,
    /// Set by flush once the ring is empty, cleared when flush returns.
    /// While true the callback emits silence instead of reading.
    drained_and_idle: bool,
    /// Generation of the most recent flush drain phase, monotonically
    /// increasing. Claimed under the lock at drain entry.
    flush_epoch: u64,
    /// Generation at which the callback last observed `drained_and_idle`.
    /// `observed_empty_epoch >= flush_epoch` means the current flush's
    /// final samples reached the hardware.
    observed_empty_epoch: u64,
}

/// State shared between the session and the backend callback thread.
pub(crate) struct Shared {
    state: Mutex<PlaybackState>,
}

impl Shared {
    /// Pull up to `frames` buffered elements into `scratch`, returning how
    /// many were read.
    ///
    /// Invoked on the backend callback thread for every hardware buffer.
    /// Holds the session lock only for the buffer operation itself; decoding
    /// and sample conversion are the caller's job, outside the lock. A short
    /// or zero read is starvation and the caller pads with silence.
    pub(crate) fn pull_elements(&self, scratch: &mut [u8], frames: usize) -> usize {
        let mut state = self.state.lock().unwrap();

        // A pending drain request means every remaining element has already
        // been handed to the hardware. Record that this callback ran on an
        // empty buffer so the flush caller can return, and emit silence.
        if state.drained_and_idle {
            state.observed_empty_epoch = state.flush_epoch;
            return 0;
        }

        let element_size = state.ring.element_size();
        let want = frames.min(scratch.len() / element_size);
        state.ring.read(&mut scratch[..want * element_size])
    }
}

/// Decode one stored element to a normalized f32 in [-1.0, 1.0).
///
/// 8-bit samples are unsigned and centered on 128; 16/24/32-bit samples are
/// signed little-endian, with 24-bit values sign-extended.
pub(crate) fn element_to_f32(bytes: &[u8]) -> f32 {
    match *bytes {
        [a] => (a as f32 - 128.0) / 128.0,
        [a, b] => i16::from_le_bytes([a, b]) as f32 / 32_768.0,
        [a, b, c] => (i32::from_le_bytes([0, a, b, c]) >> 8) as f32 / 8_388_608.0,
        [a, b, c, d] => i32::from_le_bytes([a, b, c, d]) as f32 / 2_147_483_648.0,
        _ => 0.0,
    }
}

/// Buffered mono PCM playback session.
///
/// Created by [`Speaker::new`] with the device and format fixed for the
/// session's lifetime. All methods take `&self`; the session may be shared
/// across threads (e.g. one thread blocked in [`Speaker::flush`] while
/// another calls [`Speaker::stop`]).
pub struct Speaker {
    shared: Arc<Shared>,
    backend: Mutex<Box<dyn OutputBackend>>,
    /// True between a successful `start` and the next `stop`.
    /// Acquire/Release so a reader sees the stream state the flag describes.
    started: AtomicBool,
    /// Latched request to abort an in-progress flush. Set by `stop` and
    /// `cancel_flush`, cleared by the next `write`.
    flush_cancelled: AtomicBool,
    sink: Mutex<Option<WavSink>>,
    sample_rate: u32,
    bits_per_sample: u16,
    buffer_size_secs: u32,
    device_name: String,
}

fn validate(config: &SpeakerConfig) -> Result<usize> {
    if config.sample_rate == 0 {
        return Err(Error::InvalidArgument(
            "Sample rate must be greater than zero".to_string(),
        ));
    }
    match config.bits_per_sample {
        8 | 16 | 24 | 32 => {}
        bits => {
            return Err(Error::InvalidArgument(format!(
                "Bits per sample must be 8, 16, 24 or 32 (got {})",
                bits
            )));
        }
    }
    if config.buffer_size_secs == 0 {
        return Err(Error::InvalidArgument(
            "Buffer size must be greater than zero".to_string(),
        ));
    }
    Ok(config.bits_per_sample as usize / 8)
}

impl Speaker {
    /// Open a playback session on the configured output device.
    ///
    /// Selects the device, negotiates a stream configuration for the
    /// session's sample rate, and allocates a ring buffer holding
    /// `buffer_size_secs` seconds of audio. The stream itself is not
    /// activated until [`Speaker::start`].
    ///
    /// # Errors
    /// - `InvalidArgument`: bad format parameters or device index out of range
    /// - `OutOfMemory`: ring buffer allocation failed
    /// - `Backend`: the device cannot play the requested sample rate
    /// - `Runtime`: no output devices are available
    pub fn new(config: SpeakerConfig) -> Result<Self> {
        let element_size = validate(&config)?;
        let backend = CpalBackend::new(config.sample_rate, element_size, config.device_index)?;
        Self::build(config, element_size, Box::new(backend))
    }

    #[cfg(test)]
    pub(crate) fn with_backend(
        config: SpeakerConfig,
        backend: Box<dyn OutputBackend>,
    ) -> Result<Self> {
        let element_size = validate(&config)?;
        Self::build(config, element_size, backend)
    }

    fn build(
        config: SpeakerConfig,
        element_size: usize,
        backend: Box<dyn OutputBackend>,
    ) -> Result<Self> {
        let capacity = config.sample_rate as usize * config.buffer_size_secs as usize;
        let ring = RingBuffer::new(capacity, element_size)?;
        let device_name = backend.device_name().to_string();

        debug!(
            "Opened playback session: {} Hz, {} bit, {} s buffer, device \"{}\"",
            config.sample_rate, config.bits_per_sample, config.buffer_size_secs, device_name
        );

        Ok(Self {
            shared: Arc::new(Shared {
                state: Mutex::new(PlaybackState {
                    ring,
                    drained_and_idle: false,
                    flush_epoch: 0,
                    observed_empty_epoch: 0,
                }),
            }),
            backend: Mutex::new(backend),
            started: AtomicBool::new(false),
            flush_cancelled: AtomicBool::new(false),
            sink: Mutex::new(None),
            sample_rate: config.sample_rate,
            bits_per_sample: config.bits_per_sample,
            buffer_size_secs: config.buffer_size_secs,
            device_name,
        })
    }

    /// Activate the output stream and begin consuming buffered samples.
    ///
    /// # Errors
    /// - `InvalidState`: the session is already started
    /// - `Backend` / `DeviceNotInitialized`: the stream could not be opened
    pub fn start(&self) -> Result<()> {
        if self.started.load(Ordering::Acquire) {
            return Err(Error::InvalidState(
                "Playback is already started".to_string(),
            ));
        }

        {
            let mut state = self.shared.state.lock().unwrap();
            state.drained_and_idle = false;
        }
        self.flush_cancelled.store(false, Ordering::Release);

        self.backend
            .lock()
            .unwrap()
            .activate(Arc::clone(&self.shared))?;
        self.started.store(true, Ordering::Release);

        info!("Playback started");
        Ok(())
    }

    /// Queue PCM samples for playback without blocking.
    ///
    /// `pcm` holds whole little-endian samples in the session's configured
    /// width. Accepts as many samples as currently fit and returns that
    /// count; 0 means the buffer was full and the caller should retry after
    /// the hardware has consumed some audio. Accepted samples are also
    /// appended to the WAV mirror when one is configured.
    ///
    /// # Errors
    /// - `InvalidArgument`: `pcm` is empty or not a whole number of samples
    /// - `InvalidState`: the session is not started
    /// - `Io`: the WAV mirror could not be appended
    pub fn write(&self, pcm: &[u8]) -> Result<usize> {
        let element_size = self.element_size();
        if pcm.is_empty() {
            return Err(Error::InvalidArgument(
                "PCM data must not be empty".to_string(),
            ));
        }
        if pcm.len() % element_size != 0 {
            return Err(Error::InvalidArgument(format!(
                "PCM byte length {} is not a multiple of the {} byte sample size",
                pcm.len(),
                element_size
            )));
        }
        if !self.started.load(Ordering::Acquire) {
            return Err(Error::InvalidState(
                "Playback must be started before writing".to_string(),
            ));
        }

        // A cancellation latched by stop/cancel_flush only applies to the
        // flush it interrupted; new data un-latches it.
        self.flush_cancelled.store(false, Ordering::Release);

        let accepted = {
            let mut state = self.shared.state.lock().unwrap();
            state.ring.write(pcm)
        };

        if accepted > 0 {
            self.append_to_sink(&pcm[..accepted * element_size])?;
        }
        Ok(accepted)
    }

    /// Queue PCM samples, blocking until every sample is written and played.
    ///
    /// Behaves like a blocking [`Speaker::write`]: retries the remainder
    /// every few milliseconds while the buffer is full, then keeps blocking
    /// until the output callback has pulled the buffer empty at least once,
    /// which proves the final samples reached the hardware rather than merely
    /// being queued. An empty `pcm` skips the write phase and just drains
    /// whatever is pending.
    ///
    /// Returns the number of samples written, which is less than the input
    /// length only if the flush was cancelled by [`Speaker::stop`] or
    /// [`Speaker::cancel_flush`].
    ///
    /// # Errors
    /// - `InvalidArgument`: `pcm` is not a whole number of samples
    /// - `InvalidState`: the session is not started
    /// - `Io`: the WAV mirror could not be appended
    pub fn flush(&self, pcm: &[u8]) -> Result<usize> {
        let element_size = self.element_size();
        if pcm.len() % element_size != 0 {
            return Err(Error::InvalidArgument(format!(
                "PCM byte length {} is not a multiple of the {} byte sample size",
                pcm.len(),
                element_size
            )));
        }
        if !self.started.load(Ordering::Acquire) {
            return Err(Error::InvalidState(
                "Playback must be started before flushing".to_string(),
            ));
        }

        let total = pcm.len() / element_size;
        debug!("Flushing {} samples", total);

        let mut written = 0usize;
        while !self.flush_cancelled.load(Ordering::Acquire) && written < total {
            let accepted = {
                let mut state = self.shared.state.lock().unwrap();
                state.ring.write(&pcm[written * element_size..])
            };
            if accepted > 0 {
                self.append_to_sink(
                    &pcm[written * element_size..(written + accepted) * element_size],
                )?;
                written += accepted;
                trace!("Flush progress: {}/{} samples written", written, total);
            }
            thread::sleep(FLUSH_POLL_INTERVAL);
        }

        // Claim a fresh drain generation so an observation left over from an
        // earlier flush cannot satisfy this one.
        let my_epoch = {
            let mut state = self.shared.state.lock().unwrap();
            state.flush_epoch += 1;
            state.flush_epoch
        };

        while !self.flush_cancelled.load(Ordering::Acquire) {
            let observed = {
                let mut state = self.shared.state.lock().unwrap();
                if state.ring.is_empty() {
                    state.drained_and_idle = true;
                }
                state.observed_empty_epoch >= my_epoch
            };
            if observed {
                break;
            }
            thread::sleep(FLUSH_POLL_INTERVAL);
        }

        // Clear on every exit path, cancelled or not, so the callback resumes
        // normal reads for whatever is written next.
        {
            let mut state = self.shared.state.lock().unwrap();
            state.drained_and_idle = false;
        }

        Ok(written)
    }

    /// Abort an in-progress [`Speaker::flush`] from another thread.
    ///
    /// The flush returns within one poll interval with the count of samples
    /// it had written so far. Playback itself keeps running; already-buffered
    /// audio is not discarded. The request stays latched until the next
    /// `write`, so a flush entered with no intervening write returns
    /// immediately as well.
    pub fn cancel_flush(&self) {
        self.flush_cancelled.store(true, Ordering::Release);
    }

    /// Deactivate the output stream and discard any buffered audio.
    ///
    /// Cancels an in-progress flush first, then tears down the stream and
    /// resets the ring buffer, so the next [`Speaker::start`] begins from
    /// silence. Finalizes the WAV mirror when one is configured.
    ///
    /// # Errors
    /// - `InvalidState`: the session is not started
    /// - `Backend` / `DeviceNotInitialized`: stream teardown failed
    pub fn stop(&self) -> Result<()> {
        if !self.started.load(Ordering::Acquire) {
            return Err(Error::InvalidState(
                "Playback is not started".to_string(),
            ));
        }

        // Unblock a concurrent flush before deactivating so it cannot spin
        // against a stream that will never drain the buffer again.
        self.flush_cancelled.store(true, Ordering::Release);

        // Deactivation may join the callback thread, which in turn may be
        // waiting on the session lock. Must not hold the lock here.
        self.backend.lock().unwrap().deactivate()?;

        {
            let mut state = self.shared.state.lock().unwrap();
            state.ring.reset();
            state.drained_and_idle = false;
        }
        self.started.store(false, Ordering::Release);

        self.finalize_sink()?;

        info!("Playback stopped");
        Ok(())
    }

    /// Lock-free snapshot of whether the session is currently started.
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Name of the output device this session plays through.
    pub fn selected_device(&self) -> &str {
        &self.device_name
    }

    /// Configured sample rate in Hz.
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Configured sample width in bits.
    pub fn bits_per_sample(&self) -> u16 {
        self.bits_per_sample
    }

    /// Configured ring buffer capacity in seconds of audio.
    pub fn buffer_size_secs(&self) -> u32 {
        self.buffer_size_secs
    }

    /// Mirror all subsequently accepted samples into a WAV file at `path`.
    ///
    /// The file is created immediately with a provisional header describing
    /// the session format; the header's length fields are patched when the
    /// mirror is finalized by [`Speaker::stop`] or by dropping the session.
    /// Calling this again finalizes the previous mirror and starts a new one.
    ///
    /// # Errors
    /// - `Io`: the file could not be created, or the old mirror failed to
    ///   finalize
    pub fn write_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let sink = WavSink::create(path.as_ref(), self.sample_rate, self.bits_per_sample)?;
        let previous = self.sink.lock().unwrap().replace(sink);
        if let Some(previous) = previous {
            previous.finalize()?;
        }
        Ok(())
    }

    fn element_size(&self) -> usize {
        self.bits_per_sample as usize / 8
    }

    fn append_to_sink(&self, bytes: &[u8]) -> Result<()> {
        let mut sink = self.sink.lock().unwrap();
        if let Some(sink) = sink.as_mut() {
            sink.append(bytes)?;
        }
        Ok(())
    }

    fn finalize_sink(&self) -> Result<()> {
        let sink = self.sink.lock().unwrap().take();
        if let Some(sink) = sink {
            sink.finalize()?;
        }
        Ok(())
    }
}

impl Drop for Speaker {
    fn drop(&mut self) {
        if self.started.load(Ordering::Acquire) {
            self.flush_cancelled.store(true, Ordering::Release);
            if let Ok(backend) = self.backend.get_mut() {
                if let Err(e) = backend.deactivate() {
                    warn!("Failed to deactivate audio output during teardown: {}", e);
                }
            }
        }
        if let Err(e) = self.finalize_sink() {
            warn!("Failed to finalize WAV mirror during teardown: {}", e);
        }
    }
}

impl std::fmt::Debug for Speaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Speaker")
            .field("sample_rate", &self.sample_rate)
            .field("bits_per_sample", &self.bits_per_sample)
            .field("buffer_size_secs", &self.buffer_size_secs)
            .field("device_name", &self.device_name)
            .field("started", &self.started.load(Ordering::Acquire))
            .finish()
    }
}
