//! Mutable decoder state blocks: symbol search, bit stream assembly and
//! frame timing, mirrored per active symbol rate.

use crate::signal::BUFFER_SIZE;

/// Search state machine shared by every demodulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchState {
    /// Disarmed, ignoring the signal.
    Idle,
    /// Carrier present, hunting the first modulation.
    CarrierOn,
    /// A start-of-frame candidate is being validated.
    Preamble,
    /// Symbol boundary fixed, waiting for the first data symbol.
    Sync,
    /// Decoding data symbols.
    Locked,
}

/// Search and correlation state for one symbol rate.
pub struct ModulationStatus {
    pub search_mode_state: SearchState,
    /// Symbol search window.
    pub search_start_time: u32,
    pub search_end_time: u32,
    /// Predicted next synchronization point.
    pub search_sync_time: u32,
    /// Width of the last completed modulation pulse.
    pub search_pulse_width: u32,
    /// Adaptive thresholds.
    pub search_value_threshold: f32,
    pub search_phase_threshold: f32,
    pub search_last_phase: f32,
    pub search_last_value: f32,
    pub search_sync_value: f32,
    /// Last correlator outputs.
    pub search_corr_d_value: f32,
    pub search_corr0_value: f32,
    pub search_corr1_value: f32,
    /// Current symbol window.
    pub symbol_start_time: u32,
    pub symbol_end_time: u32,
    /// Last rise edge (end of a modulation pulse).
    pub symbol_rise_time: u32,
    /// Running integrators.
    pub filter_integrate: f32,
    pub detect_integrate: f32,
    pub phase_integrate: f32,
    /// Peak bookkeeping for the symbol under search.
    pub correlated_peak_value: f32,
    pub detector_peak_value: f32,
    pub correlated_peak_time: u32,
    pub detector_peak_time: u32,
    /// Integrator output ring.
    pub integration_data: [f32; BUFFER_SIZE],
    /// Correlator output ring.
    pub correlation_data: [f32; BUFFER_SIZE],
}

impl ModulationStatus {
    pub fn new() -> Self {
        Self {
            search_mode_state: SearchState::Idle,
            search_start_time: 0,
            search_end_time: 0,
            search_sync_time: 0,
            search_pulse_width: 0,
            search_value_threshold: 0.0,
            search_phase_threshold: 0.0,
            search_last_phase: 0.0,
            search_last_value: 0.0,
            search_sync_value: 0.0,
            search_corr_d_value: 0.0,
            search_corr0_value: 0.0,
            search_corr1_value: 0.0,
            symbol_start_time: 0,
            symbol_end_time: 0,
            symbol_rise_time: 0,
            filter_integrate: 0.0,
            detect_integrate: 0.0,
            phase_integrate: 0.0,
            correlated_peak_value: 0.0,
            detector_peak_value: 0.0,
            correlated_peak_time: 0,
            detector_peak_time: 0,
            integration_data: [0.0; BUFFER_SIZE],
            correlation_data: [0.0; BUFFER_SIZE],
        }
    }

    /// Clear the symbol peak between search windows, keeping thresholds.
    pub fn clear_peak(&mut self) {
        self.correlated_peak_value = 0.0;
        self.correlated_peak_time = 0;
        self.detector_peak_value = 0.0;
        self.detector_peak_time = 0;
    }
}

impl Default for ModulationStatus {
    fn default() -> Self {
        Self::new()
    }
}

/// One demodulated symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SymbolStatus {
    /// Technology-specific symbol pattern code.
    pub pattern: u32,
    /// Symbol value, 0 or 1 (slot index for pulse position coding).
    pub value: u32,
    pub start: u32,
    pub end: u32,
    /// Last rise edge inside the symbol.
    pub edge: u32,
    pub length: u32,
    /// Symbol rate in symbols per second.
    pub rate: u32,
}

/// Bit accumulator and byte staging for one frame.
pub struct StreamStatus {
    pub previous: u32,
    pub pattern: u32,
    pub bits: u32,
    pub data: u32,
    pub parity: u32,
    pub flags: u32,
    pub bytes: u32,
    pub buffer: [u8; 512],
}

impl StreamStatus {
    pub fn new() -> Self {
        Self {
            previous: 0,
            pattern: 0,
            bits: 0,
            data: 0,
            parity: 0,
            flags: 0,
            bytes: 0,
            buffer: [0u8; 512],
        }
    }

    pub fn reset(&mut self) {
        self.previous = 0;
        self.pattern = 0;
        self.bits = 0;
        self.data = 0;
        self.parity = 0;
        self.flags = 0;
        self.bytes = 0;
    }
}

impl Default for StreamStatus {
    fn default() -> Self {
        Self::new()
    }
}

/// Frame timing: guard and waiting windows around the last decoded frame.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameStatus {
    pub last_command: u32,
    pub frame_type: u32,
    pub symbol_rate: u32,
    pub frame_start: u32,
    pub frame_end: u32,
    pub guard_end: u32,
    pub waiting_end: u32,
    pub frame_guard_time: u32,
    pub frame_waiting_time: u32,
    pub start_up_guard_time: u32,
    pub request_guard_time: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_reset_keeps_buffer_storage() {
        let mut stream = StreamStatus::new();
        stream.buffer[0] = 0xAA;
        stream.bytes = 1;
        stream.bits = 5;
        stream.reset();
        assert_eq!(stream.bytes, 0);
        assert_eq!(stream.bits, 0);
    }

    #[test]
    fn peak_clear_preserves_thresholds() {
        let mut status = ModulationStatus::new();
        status.search_value_threshold = 1.5;
        status.correlated_peak_value = 3.0;
        status.correlated_peak_time = 42;
        status.clear_peak();
        assert_eq!(status.correlated_peak_value, 0.0);
        assert_eq!(status.correlated_peak_time, 0);
        assert_eq!(status.search_value_threshold, 1.5);
    }
}
