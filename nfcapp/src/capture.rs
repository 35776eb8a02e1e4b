//! Debug signal capture: a multi-channel WAV sink fed with the decoder's
//! internal signals, one file per decoder run.

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use hound::{SampleFormat, WavSpec, WavWriter};
use log::debug;

use crate::error::NfcError;

pub const CAPTURE_CHANNELS: usize = 10;
pub const CHANNEL_SIGNAL_VALUE: usize = 0;
pub const CHANNEL_SIGNAL_FILTERED: usize = 1;
pub const CHANNEL_SIGNAL_DEVIATION: usize = 2;
pub const CHANNEL_SIGNAL_AVERAGE: usize = 3;
pub const CHANNEL_DECODER_STATE: usize = 4;

/// Optional capture sink, injected at receiver construction. Never a global.
pub struct SignalCapture {
    writer: WavWriter<BufWriter<File>>,
    path: PathBuf,
    clock: u32,
    values: [f32; CAPTURE_CHANNELS],
    pending: bool,
}

impl SignalCapture {
    /// Create `decoder-YYYYMMDDhhmmss.wav` inside `dir`.
    pub fn new(dir: &Path, sample_rate: u32) -> Result<Self, NfcError> {
        let path = dir.join(format!("decoder-{}.wav", timestamp()));
        let spec = WavSpec {
            channels: CAPTURE_CHANNELS as u16,
            sample_rate,
            bits_per_sample: 32,
            sample_format: SampleFormat::Float,
        };
        let writer = WavWriter::create(&path, spec)
            .map_err(|_| NfcError::CaptureCreateFailed(dir.to_path_buf()))?;
        debug!("signal capture at {}", path.display());
        Ok(Self {
            writer,
            path,
            clock: 0,
            values: [0.0; CAPTURE_CHANNELS],
            pending: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Advance to a new sample clock, flushing the previous channel set.
    pub fn block(&mut self, clock: u32) {
        if self.pending && clock != self.clock {
            for value in self.values {
                let _ = self.writer.write_sample(value);
            }
            self.values = [0.0; CAPTURE_CHANNELS];
        }
        self.clock = clock;
        self.pending = true;
    }

    pub fn set(&mut self, channel: usize, value: f32) {
        if channel < CAPTURE_CHANNELS {
            self.values[channel] = value;
        }
    }

    pub fn finalize(mut self) {
        if self.pending {
            for value in self.values {
                let _ = self.writer.write_sample(value);
            }
        }
        let _ = self.writer.finalize();
    }
}

/// Civil date and time, UTC, without pulling in a date-time crate.
fn timestamp() -> String {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let days = (secs / 86400) as i64;
    let rem = secs % 86400;
    let (hour, minute, second) = (rem / 3600, rem % 3600 / 60, rem % 60);
    // days since 1970-01-01 to civil date
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = doy - (153 * mp + 2) / 5 + 1;
    let month = if mp < 10 { mp + 3 } else { mp - 9 };
    let year = yoe + era * 400 + (month <= 2) as i64;
    format!(
        "{:04}{:02}{:02}{:02}{:02}{:02}",
        year, month, day, hour, minute, second
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use hound::WavReader;

    #[test]
    fn capture_writes_channel_blocks() {
        let dir = std::env::temp_dir().join(format!("nfcrt-capture-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let mut capture = SignalCapture::new(&dir, 10_000_000).unwrap();
        let path = capture.path().to_path_buf();
        assert!(path
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("decoder-"));

        for clock in 1..=3u32 {
            capture.block(clock);
            capture.set(CHANNEL_SIGNAL_VALUE, clock as f32);
            capture.set(CHANNEL_SIGNAL_FILTERED, 0.5);
        }
        capture.finalize();

        let mut reader = WavReader::open(&path).unwrap();
        let spec = reader.spec();
        assert_eq!(spec.channels as usize, CAPTURE_CHANNELS);
        assert_eq!(spec.sample_rate, 10_000_000);
        let samples: Vec<f32> = reader.samples::<f32>().map(|s| s.unwrap()).collect();
        assert_eq!(samples.len(), 3 * CAPTURE_CHANNELS);
        assert_eq!(samples[0], 1.0);
        assert_eq!(samples[CAPTURE_CHANNELS], 2.0);
        let _ = std::fs::remove_file(&path);
        let _ = std::fs::remove_dir(&dir);
    }

    #[test]
    fn timestamp_is_fourteen_digits() {
        let stamp = timestamp();
        assert_eq!(stamp.len(), 14);
        assert!(stamp.chars().all(|c| c.is_ascii_digit()));
        // sanity: the year is in a plausible range
        let year: u32 = stamp[0..4].parse().unwrap();
        assert!((2020..2200).contains(&year));
    }
}
