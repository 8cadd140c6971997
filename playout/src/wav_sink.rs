//! WAV mirror sink
//!
//! Appends raw PCM bytes behind a canonical 44-byte RIFF/WAVE header. The
//! header is written up front with zeroed length fields so the file is
//! well-formed from the moment it is created; `finalize` seeks back and
//! patches the two length fields once the total is known.

use std::fs::File;
use std::io::{self, BufWriter, Seek, SeekFrom, Write};
use std::path::Path;

use tracing::{debug, info};

use crate::error::Result;

/// Fixed header: RIFF chunk + fmt chunk + data chunk preamble.
const WAV_HEADER_SIZE: u32 = 44;
/// Offset of the RIFF chunk size field (file size minus 8).
const RIFF_SIZE_OFFSET: u64 = 4;
/// Offset of the data chunk size field.
const DATA_SIZE_OFFSET: u64 = 40;

/// Mono PCM WAV writer fed one chunk of accepted samples at a time.
pub(crate) struct WavSink {
    writer: BufWriter<File>,
    data_bytes: u32,
}

impl WavSink {
    /// Create `path` and write a provisional header for mono integer PCM in
    /// the given format. The header reaches the disk before this returns.
    pub(crate) fn create(path: &Path, sample_rate: u32, bits_per_sample: u16) -> Result<Self> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);
        write_wav_header(&mut writer, sample_rate, bits_per_sample, 0)?;
        writer.flush()?;

        info!("Mirroring playback to {}", path.display());
        Ok(Self {
            writer,
            data_bytes: 0,
        })
    }

    /// Append raw little-endian sample bytes to the data chunk.
    pub(crate) fn append(&mut self, bytes: &[u8]) -> Result<()> {
        self.writer.write_all(bytes)?;
        self.data_bytes = self.data_bytes.saturating_add(bytes.len() as u32);
        Ok(())
    }

    /// Patch the header length fields with the final byte count and close
    /// the file.
    pub(crate) fn finalize(mut self) -> Result<()> {
        self.writer.seek(SeekFrom::Start(RIFF_SIZE_OFFSET))?;
        self.writer
            .write_all(&self.data_bytes.saturating_add(WAV_HEADER_SIZE - 8).to_le_bytes())?;
        self.writer.seek(SeekFrom::Start(DATA_SIZE_OFFSET))?;
        self.writer.write_all(&self.data_bytes.to_le_bytes())?;
        self.writer.flush()?;

        debug!("Finalized WAV mirror: {} data bytes", self.data_bytes);
        Ok(())
    }
}

/// Write the canonical 44-byte header for mono integer PCM.
fn write_wav_header<W: Write>(
    writer: &mut W,
    sample_rate: u32,
    bits_per_sample: u16,
    data_len: u32,
) -> io::Result<()> {
    let channels: u16 = 1;
    let block_align = channels * (bits_per_sample / 8);
    let byte_rate = sample_rate * block_align as u32;

    writer.write_all(b"RIFF")?;
    writer.write_all(&(data_len + WAV_HEADER_SIZE - 8).to_le_bytes())?;
    writer.write_all(b"WAVE")?;

    writer.write_all(b"fmt ")?;
    writer.write_all(&16u32.to_le_bytes())?; // fmt chunk size for PCM
    writer.write_all(&1u16.to_le_bytes())?; // integer PCM
    writer.write_all(&channels.to_le_bytes())?;
    writer.write_all(&sample_rate.to_le_bytes())?;
    writer.write_all(&byte_rate.to_le_bytes())?;
    writer.write_all(&block_align.to_le_bytes())?;
    writer.write_all(&bits_per_sample.to_le_bytes())?;

    writer.write_all(b"data")?;
    writer.write_all(&data_len.to_le_bytes())?;
    Ok(())
}
