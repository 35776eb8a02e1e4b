//! Integration layer around the `nfccore` decoder: sample sources, the
//! decoder worker thread, frame adapters and the optional debug capture.

pub mod block;
pub mod capture;
pub mod error;
pub mod monitor;
pub mod receiver;
pub mod wav;

// Frame and configuration types needed to consume decoded output
pub use nfccore::decoder::{DecoderConfig, TechSet};
pub use nfccore::protocol::{Direction, NfcFrame, RateType, TechType};
