use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum NfcError {
    #[error("sample block has unsupported type, stride or sample rate")]
    UnsupportedFormat,

    #[error("provided WAV path could not be opened: {0}")]
    InvalidWavPath(PathBuf),

    #[error("failed to read WAV samples from: {0}")]
    WavReadFailed(PathBuf),

    #[error("failed to create debug capture file in: {0}")]
    CaptureCreateFailed(PathBuf),

    #[error("monitor has already been started")]
    InvalidStart,

    #[error("monitor is not running")]
    InvalidClose,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_messages_name_the_path() {
        let err = NfcError::InvalidWavPath(PathBuf::from("/no/such/capture.wav"));
        assert!(err.to_string().contains("/no/such/capture.wav"));
    }
}
