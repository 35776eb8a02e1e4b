//! High level monitor: owns a `SignalReceiver` and fans decoded frames out
//! to registered adapters.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;

use log::debug;
use nfccore::protocol::NfcFrame;

use crate::error::NfcError;
use crate::receiver::SignalReceiver;

pub trait FrameAdapter: Send + Sync + 'static {
    fn monitor_started(&self) {}
    fn monitor_closed(&self) {}
    fn frame_received(&self, frame: NfcFrame);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Setup,
    Started,
    Closed,
}

struct Adapters {
    next: usize,
    map: HashMap<usize, Arc<dyn FrameAdapter>>,
}

impl Adapters {
    fn new() -> Self {
        Self {
            next: 0,
            map: HashMap::new(),
        }
    }
}

pub struct NfcMonitor {
    adapters: Arc<RwLock<Adapters>>,
    receiver: SignalReceiver,
    lifecycle: RwLock<Lifecycle>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl NfcMonitor {
    pub fn new(receiver: SignalReceiver) -> Self {
        let adapters = Arc::new(RwLock::new(Adapters::new()));
        let reader = receiver.frames().map(|frames| {
            let adapters = adapters.clone();
            std::thread::spawn(move || {
                while let Ok(frame) = frames.recv() {
                    let adapters = adapters.read().unwrap();
                    for adapter in adapters.map.values() {
                        adapter.frame_received(frame.clone());
                    }
                }
                debug!("frame reader finished");
            })
        });
        Self {
            adapters,
            receiver,
            lifecycle: RwLock::new(Lifecycle::Setup),
            reader: Mutex::new(reader),
        }
    }

    pub fn add_frame_adapter<A: FrameAdapter>(&self, adapter: A) -> usize {
        let adapter = Arc::new(adapter);
        let mut adapters = self.adapters.write().unwrap();
        let id = adapters.next;
        adapters.next += 1;
        adapters.map.insert(id, adapter.clone());
        drop(adapters);
        if self.lifecycle() == Lifecycle::Started {
            adapter.monitor_started();
        }
        id
    }

    pub fn remove_frame_adapter(&self, id: usize) {
        if let Some(adapter) = self.adapters.write().unwrap().map.remove(&id) {
            if self.lifecycle() == Lifecycle::Started {
                adapter.monitor_closed();
            }
        }
    }

    pub fn start(&self) -> Result<(), NfcError> {
        if self.lifecycle() != Lifecycle::Setup {
            return Err(NfcError::InvalidStart);
        }
        self.set_lifecycle(Lifecycle::Started);
        for adapter in self.adapters.read().unwrap().map.values() {
            adapter.monitor_started();
        }
        self.receiver.start();
        Ok(())
    }

    pub fn close(&self) -> Result<(), NfcError> {
        if self.lifecycle() != Lifecycle::Started {
            return Err(NfcError::InvalidClose);
        }
        self.set_lifecycle(Lifecycle::Closed);
        self.receiver.close();
        for adapter in self.adapters.read().unwrap().map.values() {
            adapter.monitor_closed();
        }
        Ok(())
    }

    /// Block until the decoder worker has drained its input and the frame
    /// reader has finished. Used by batch tools decoding a finite capture.
    pub fn wait(&self) {
        if let Some(handle) = self.reader.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    fn lifecycle(&self) -> Lifecycle {
        *self.lifecycle.read().unwrap()
    }

    fn set_lifecycle(&self, lifecycle: Lifecycle) {
        *self.lifecycle.write().unwrap() = lifecycle;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::receiver::NullSource;
    use nfccore::decoder::DecoderConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingAdapter(Arc<AtomicUsize>);

    impl FrameAdapter for CountingAdapter {
        fn monitor_started(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
        fn frame_received(&self, _frame: NfcFrame) {}
    }

    #[test]
    fn lifecycle_is_enforced() {
        let receiver = SignalReceiver::new(NullSource::new(), DecoderConfig::default(), None);
        let monitor = NfcMonitor::new(receiver);
        let started = Arc::new(AtomicUsize::new(0));
        monitor.add_frame_adapter(CountingAdapter(started.clone()));
        assert_eq!(monitor.close(), Err(NfcError::InvalidClose));
        assert!(monitor.start().is_ok());
        assert_eq!(started.load(Ordering::SeqCst), 1);
        assert_eq!(monitor.start(), Err(NfcError::InvalidStart));
        assert!(monitor.close().is_ok());
    }

    #[test]
    fn adapters_register_and_remove() {
        let receiver = SignalReceiver::new(NullSource::new(), DecoderConfig::default(), None);
        let monitor = NfcMonitor::new(receiver);
        let counter = Arc::new(AtomicUsize::new(0));
        let id = monitor.add_frame_adapter(CountingAdapter(counter.clone()));
        monitor.remove_frame_adapter(id);
        assert!(monitor.start().is_ok());
        // removed before start, so never notified
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        let _ = monitor.close();
    }
}
