//! Decoder worker: drains sample blocks from an SPSC queue, feeds them
//! through the core decoder one sample at a time and hands decoded frames to
//! a second queue. Cancellation is checked at block boundaries only.

use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};

use log::{debug, warn};
use nfccore::decoder::{DecoderConfig, NfcDecoder};
use nfccore::protocol::NfcFrame;

use crate::block::SampleBlock;
use crate::capture::{
    SignalCapture, CHANNEL_DECODER_STATE, CHANNEL_SIGNAL_AVERAGE, CHANNEL_SIGNAL_DEVIATION,
    CHANNEL_SIGNAL_FILTERED, CHANNEL_SIGNAL_VALUE,
};
use crate::error::NfcError;

pub enum ReceiverEvent {
    Samples(SampleBlock),
    Start,
    Close,
}

/// Something producing sample blocks on its own thread.
pub trait SampleSource: Send + Sync + 'static {
    fn start(&self, events: SyncSender<ReceiverEvent>);
    fn close(&self);
}

pub struct NullSource;

impl NullSource {
    pub fn new() -> Self {
        Self
    }
}

impl Default for NullSource {
    fn default() -> Self {
        Self::new()
    }
}

impl SampleSource for NullSource {
    fn start(&self, _events: SyncSender<ReceiverEvent>) {}
    fn close(&self) {}
}

/// Owns the decoder worker thread.
pub struct SignalReceiver {
    event_tx: SyncSender<ReceiverEvent>,
    frame_rx: Mutex<Option<Receiver<NfcFrame>>>,
    sample_rate: u32,
    source: Arc<dyn SampleSource>,
}

impl SignalReceiver {
    pub fn new<S: SampleSource>(
        source: S,
        config: DecoderConfig,
        capture: Option<SignalCapture>,
    ) -> Self {
        let (event_tx, event_rx) = sync_channel(128);
        let (frame_tx, frame_rx) = sync_channel(128);
        let source: Arc<dyn SampleSource> = Arc::new(source);
        spawn_receiver_worker(event_tx.clone(), event_rx, frame_tx, source.clone(), config, capture);
        Self {
            event_tx,
            frame_rx: Mutex::new(Some(frame_rx)),
            sample_rate: config.sample_rate,
            source,
        }
    }

    /// Queue one block synchronously. Format violations are returned to the
    /// caller and never reach the decoder.
    pub fn feed(&self, block: SampleBlock) -> Result<(), NfcError> {
        block.validate(self.sample_rate)?;
        let _ = self.event_tx.send(ReceiverEvent::Samples(block));
        Ok(())
    }

    pub fn start(&self) {
        let _ = self.event_tx.send(ReceiverEvent::Start);
    }

    pub fn close(&self) {
        self.source.close();
        let _ = self.event_tx.send(ReceiverEvent::Close);
    }

    /// Take the decoded frame queue; available once.
    pub fn frames(&self) -> Option<Receiver<NfcFrame>> {
        self.frame_rx.lock().unwrap().take()
    }
}

fn spawn_receiver_worker(
    event_tx: SyncSender<ReceiverEvent>,
    event_rx: Receiver<ReceiverEvent>,
    frame_tx: SyncSender<NfcFrame>,
    source: Arc<dyn SampleSource>,
    config: DecoderConfig,
    mut capture: Option<SignalCapture>,
) {
    std::thread::spawn(move || {
        let mut decoder = NfcDecoder::new(&config);
        while let Ok(event) = event_rx.recv() {
            match event {
                ReceiverEvent::Start => source.start(event_tx.clone()),
                ReceiverEvent::Close => break,
                ReceiverEvent::Samples(block) => {
                    if let Err(e) = block.validate(config.sample_rate) {
                        warn!("dropping sample block: {}", e);
                        continue;
                    }
                    for &value in block.samples.iter() {
                        let frame = decoder.decode(value);
                        if let Some(sink) = capture.as_mut() {
                            let signal = decoder.signal();
                            sink.block(signal.signal_clock);
                            sink.set(CHANNEL_SIGNAL_VALUE, signal.signal_value);
                            sink.set(CHANNEL_SIGNAL_FILTERED, signal.signal_filtered);
                            sink.set(CHANNEL_SIGNAL_DEVIATION, signal.signal_deviation);
                            sink.set(CHANNEL_SIGNAL_AVERAGE, signal.signal_average);
                            sink.set(CHANNEL_DECODER_STATE, decoder.state_value());
                        }
                        if let Some(frame) = frame {
                            if let Err(TrySendError::Full(_)) = frame_tx.try_send(frame) {
                                debug!("frame queue overflow");
                            }
                        }
                    }
                }
            }
        }
        if let Some(sink) = capture.take() {
            sink.finalize();
        }
        debug!("receiver worker finished");
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::SampleType;
    use std::time::Duration;

    #[test]
    fn feed_rejects_bad_blocks_synchronously() {
        let receiver =
            SignalReceiver::new(NullSource::new(), DecoderConfig::default(), None);
        let mut block = SampleBlock::real(vec![0.0f32; 64].into(), 10_000_000);
        block.sample_type = SampleType::Complex;
        assert_eq!(receiver.feed(block), Err(NfcError::UnsupportedFormat));

        let block = SampleBlock::real(vec![0.0f32; 64].into(), 8_000_000);
        assert_eq!(receiver.feed(block), Err(NfcError::UnsupportedFormat));
    }

    #[test]
    fn frame_queue_is_taken_once() {
        let receiver =
            SignalReceiver::new(NullSource::new(), DecoderConfig::default(), None);
        assert!(receiver.frames().is_some());
        assert!(receiver.frames().is_none());
    }

    /// A REQA rendered at envelope level must travel the whole path: source
    /// queue, decoder worker, frame queue.
    #[test]
    fn worker_decodes_fed_blocks() {
        let etu = 10_000_000f64 * 128.0 / 13.56e6;
        let mut wave = vec![1.0f32; 2000];
        let pause = |wave: &mut Vec<f32>, from: f64, width: f64| {
            let from = from.round() as usize;
            let to = (from as f64 + width).round() as usize;
            while wave.len() < from {
                wave.push(1.0);
            }
            while wave.len() < to {
                wave.push(0.0);
            }
        };
        // modified Miller REQA: SOC, 0x26 LSB first, EOC zero
        let start = 2000.0;
        let q = etu / 4.0;
        let h = etu / 2.0;
        let mut pos = start;
        pause(&mut wave, pos, q); // SOC: Z
        pos += etu;
        let mut prev_one = false;
        for bit in [0u8, 1, 1, 0, 0, 1, 0] {
            if bit == 1 {
                pause(&mut wave, pos + h, q);
                prev_one = true;
            } else if !prev_one {
                pause(&mut wave, pos, q);
            } else {
                prev_one = false;
            }
            pos += etu;
        }
        pause(&mut wave, pos, q); // EOC zero after a zero
        while wave.len() < (pos + 6.0 * etu) as usize {
            wave.push(1.0);
        }

        let receiver =
            SignalReceiver::new(NullSource::new(), DecoderConfig::default(), None);
        let frames = receiver.frames().unwrap();
        for chunk in wave.chunks(4096) {
            receiver
                .feed(SampleBlock::real(chunk.into(), 10_000_000))
                .unwrap();
        }
        let frame = frames
            .recv_timeout(Duration::from_secs(10))
            .expect("decoded frame");
        assert_eq!(frame.payload(), &[0x26]);
        receiver.close();
    }
}
