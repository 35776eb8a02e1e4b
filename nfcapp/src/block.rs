//! Sample block hand-off between the acquisition thread and the decoder
//! worker.

use std::sync::Arc;

use crate::error::NfcError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleType {
    /// Real-valued envelope samples, the only type this decoder accepts.
    Real,
    /// Interleaved I/Q samples, rejected here; conversion happens upstream.
    Complex,
}

/// One block of samples with its layout metadata.
#[derive(Debug, Clone)]
pub struct SampleBlock {
    pub samples: Arc<[f32]>,
    pub sample_rate: u32,
    pub stride: u32,
    pub offset: u32,
    pub decimation: u32,
    pub sample_type: SampleType,
}

impl SampleBlock {
    pub fn real(samples: Arc<[f32]>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
            stride: 1,
            offset: 0,
            decimation: 1,
            sample_type: SampleType::Real,
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// The decoder accepts mono real blocks at its configured rate only.
    pub fn validate(&self, sample_rate: u32) -> Result<(), NfcError> {
        if self.sample_type != SampleType::Real
            || self.stride != 1
            || self.sample_rate != sample_rate
        {
            return Err(NfcError::UnsupportedFormat);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn real_mono_block_is_accepted() {
        let block = SampleBlock::real(vec![0.0f32; 16].into(), 10_000_000);
        assert!(block.validate(10_000_000).is_ok());
        assert_eq!(block.len(), 16);
    }

    #[test]
    fn wrong_layouts_are_rejected() {
        let mut block = SampleBlock::real(vec![0.0f32; 16].into(), 10_000_000);
        block.sample_type = SampleType::Complex;
        assert_eq!(block.validate(10_000_000), Err(NfcError::UnsupportedFormat));

        let mut block = SampleBlock::real(vec![0.0f32; 16].into(), 10_000_000);
        block.stride = 2;
        assert_eq!(block.validate(10_000_000), Err(NfcError::UnsupportedFormat));

        let block = SampleBlock::real(vec![0.0f32; 16].into(), 8_000_000);
        assert_eq!(block.validate(10_000_000), Err(NfcError::UnsupportedFormat));
    }
}
