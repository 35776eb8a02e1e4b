//! WAV file sample source: plays a recorded capture into the decoder as
//! fast as the worker will take it.

use std::path::PathBuf;
use std::sync::mpsc::{channel, Sender, SyncSender, TryRecvError};
use std::sync::{Arc, Mutex};

use hound::{SampleFormat, WavReader};
use log::debug;

use crate::block::SampleBlock;
use crate::error::NfcError;
use crate::receiver::{ReceiverEvent, SampleSource};

const BLOCK_SAMPLES: usize = 8192;

#[derive(Debug)]
pub struct WavFileSource {
    samples: Arc<[f32]>,
    sample_rate: u32,
    end_tx: Mutex<Option<Sender<()>>>,
}

impl WavFileSource {
    pub fn new(path: PathBuf) -> Result<Self, NfcError> {
        let mut reader =
            WavReader::open(&path).map_err(|_| NfcError::InvalidWavPath(path.clone()))?;
        let spec = reader.spec();
        let mut samples: Vec<f32> = match spec.sample_format {
            SampleFormat::Float => reader
                .samples::<f32>()
                .collect::<Result<Vec<f32>, _>>()
                .map_err(|_| NfcError::WavReadFailed(path.clone()))?,
            SampleFormat::Int => {
                let full_scale = (1u32 << (spec.bits_per_sample - 1)) as f32;
                reader
                    .samples::<i32>()
                    .map(|s| s.map(|v| v as f32 / full_scale))
                    .collect::<Result<Vec<f32>, _>>()
                    .map_err(|_| NfcError::WavReadFailed(path.clone()))?
            }
        };
        if spec.channels > 1 {
            // decoder wants the envelope channel only
            samples = samples
                .into_iter()
                .step_by(spec.channels as usize)
                .collect();
        }
        debug!(
            "loaded {} samples at {} S/s from {}",
            samples.len(),
            spec.sample_rate,
            path.display()
        );
        Ok(Self {
            samples: samples.into(),
            sample_rate: spec.sample_rate,
            end_tx: Mutex::new(None),
        })
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

impl SampleSource for WavFileSource {
    fn start(&self, events: SyncSender<ReceiverEvent>) {
        let (end_tx, end_rx) = channel();
        let samples = self.samples.clone();
        let sample_rate = self.sample_rate;
        std::thread::spawn(move || {
            for chunk in samples.chunks(BLOCK_SAMPLES) {
                if end_rx.try_recv() != Err(TryRecvError::Empty) {
                    return;
                }
                let block = SampleBlock::real(chunk.into(), sample_rate);
                if events.send(ReceiverEvent::Samples(block)).is_err() {
                    return;
                }
            }
            // end of capture closes the decoder
            let _ = events.send(ReceiverEvent::Close);
        });
        *self.end_tx.lock().unwrap() = Some(end_tx);
    }

    fn close(&self) {
        let _ = self.end_tx.lock().unwrap().take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hound::{WavSpec, WavWriter};

    fn temp_wav(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("nfcrt-{}-{}.wav", name, std::process::id()))
    }

    #[test]
    fn reads_what_hound_wrote() {
        let path = temp_wav("int16");
        let spec = WavSpec {
            channels: 1,
            sample_rate: 10_000_000,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let mut writer = WavWriter::create(&path, spec).unwrap();
        for value in [0i16, 16384, -16384, 32767] {
            writer.write_sample(value).unwrap();
        }
        writer.finalize().unwrap();

        let source = WavFileSource::new(path.clone()).unwrap();
        assert_eq!(source.sample_rate(), 10_000_000);
        assert_eq!(source.len(), 4);
        assert!((source.samples[1] - 0.5).abs() < 1e-4);
        assert!((source.samples[2] + 0.5).abs() < 1e-4);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn missing_file_is_reported() {
        let path = PathBuf::from("/no/such/capture.wav");
        assert_eq!(
            WavFileSource::new(path.clone()).unwrap_err(),
            NfcError::InvalidWavPath(path)
        );
    }
}
