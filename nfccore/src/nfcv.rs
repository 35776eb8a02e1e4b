//! NFC-V demodulation at 26.48 kbps: pulse position coding, 1-of-4 or
//! 1-of-256 selected per frame by the start-of-frame pulse spacing.

use crate::bitrate::{BitrateParams, PulseParams};
use crate::crc;
use crate::protocol::{
    Direction, NfcFrame, RateType, TechType, FLAG_CRC_OK, FLAG_PARITY_OK, FLAG_TRUNCATED,
};
use crate::signal::{DecoderStatus, BUFFER_SIZE};
use crate::status::{FrameStatus, ModulationStatus, SearchState, StreamStatus};
use log::debug;

/// Initial modulation depth threshold; pulses may use 100% or 10% depth.
const MIN_PULSE_DEPTH: f32 = 0.25;

fn idx(clock: u32) -> usize {
    clock as usize & (BUFFER_SIZE - 1)
}

pub(crate) struct NfcV {
    rate: BitrateParams,
    pulse_4: PulseParams,
    pulse_256: PulseParams,
    /// Selected coding for the current frame, index into bits (2 or 8).
    pulse_bits: u32,
    modulation: ModulationStatus,
    stream: StreamStatus,
    frame_status: FrameStatus,
    low: bool,
    pulse_start: u32,
    /// First SOF pulse position while validating the pulse pair.
    sof_time: u32,
    /// Start of the current symbol window.
    window_start: u32,
    /// Pulse seen inside the current symbol window.
    window_value: Option<u32>,
    window_pulse_time: u32,
    /// Symbol withheld until the next window rules out the EOF.
    pending_value: Option<u32>,
    pending_pulse_time: u32,
}

impl NfcV {
    pub fn new(sig: &DecoderStatus) -> Self {
        Self {
            rate: BitrateParams::new(TechType::NfcV, RateType::R26, &sig.signal_params, 0),
            pulse_4: PulseParams::new(2, &sig.signal_params),
            pulse_256: PulseParams::new(8, &sig.signal_params),
            pulse_bits: 8,
            modulation: ModulationStatus::new(),
            stream: StreamStatus::new(),
            frame_status: FrameStatus::default(),
            low: false,
            pulse_start: 0,
            sof_time: 0,
            window_start: 0,
            window_value: None,
            window_pulse_time: 0,
            pending_value: None,
            pending_pulse_time: 0,
        }
    }

    fn pulse(&self) -> &PulseParams {
        if self.pulse_bits == 2 {
            &self.pulse_4
        } else {
            &self.pulse_256
        }
    }

    pub fn power_on(&mut self, sig: &DecoderStatus) {
        self.modulation.search_mode_state = SearchState::CarrierOn;
        self.modulation.search_start_time = sig.signal_clock;
        self.modulation.search_value_threshold = MIN_PULSE_DEPTH;
        self.modulation.clear_peak();
        self.stream.reset();
        self.low = false;
        self.window_value = None;
        self.pending_value = None;
    }

    pub fn power_off(&mut self) {
        self.modulation.search_mode_state = SearchState::Idle;
    }

    pub fn is_locked(&self) -> bool {
        matches!(
            self.modulation.search_mode_state,
            SearchState::Preamble | SearchState::Locked
        )
    }

    pub fn detect(&mut self, sig: &DecoderStatus) -> Option<NfcFrame> {
        if self.modulation.search_mode_state == SearchState::Idle {
            return None;
        }
        let clock = sig.signal_clock;
        let etu = sig.etu();
        let depth = sig.sample[idx(clock)].modulate_depth;

        // pulse edges on the modulation depth
        let low = depth > self.modulation.search_value_threshold;
        let mut pulse_event = None;
        if low != self.low {
            if low {
                self.pulse_start = clock;
            } else {
                let width = clock.wrapping_sub(self.pulse_start);
                // one ETU nominal pulse width
                if width >= etu / 2 && width <= 2 * etu {
                    pulse_event = Some((self.pulse_start, width));
                }
            }
            self.low = low;
        }
        if low && depth > self.modulation.detector_peak_value {
            self.modulation.detector_peak_value = depth;
            self.modulation.detector_peak_time = clock;
        }

        match self.modulation.search_mode_state {
            SearchState::CarrierOn => {
                if let Some((start, _)) = pulse_event {
                    self.sof_time = start;
                    self.modulation.symbol_start_time = start;
                    self.modulation.search_value_threshold =
                        (self.modulation.detector_peak_value / 2.0).max(0.05);
                    self.modulation.search_mode_state = SearchState::Preamble;
                }
            }
            SearchState::Preamble => {
                if let Some((start, _)) = pulse_event {
                    let gap = start.wrapping_sub(self.sof_time);
                    let spacing = |periods: u32| {
                        let nominal = periods * etu;
                        gap + etu / 2 >= nominal && gap <= nominal + etu / 2
                    };
                    if spacing(2) {
                        // second pulse 2 ETU out: 1-of-4 coding
                        self.lock(4 * etu, 2, start);
                    } else if spacing(4) {
                        // 4 ETU out: 1-of-256 coding
                        self.lock(8 * etu, 8, start);
                    } else {
                        // not a SOF pair, retry from this pulse
                        self.sof_time = start;
                        self.modulation.symbol_start_time = start;
                    }
                } else if clock.wrapping_sub(self.sof_time) > 10 * etu {
                    self.modulation.search_mode_state = SearchState::CarrierOn;
                }
            }
            SearchState::Locked => {
                if let Some((start, _)) = pulse_event {
                    let offset = start.wrapping_sub(self.window_start);
                    let value = self.pulse().find(offset).map(|slot| slot.value);
                    if let Some(value) = value {
                        self.window_value = Some(value);
                        self.window_pulse_time = start;
                    }
                }
                if clock == self.window_start.wrapping_add(self.pulse().length) {
                    return self.finish_window();
                }
            }
            _ => {}
        }
        None
    }

    fn lock(&mut self, sof_length: u32, bits: u32, second_pulse: u32) {
        self.pulse_bits = bits;
        self.window_start = self.sof_time.wrapping_add(sof_length);
        self.window_value = None;
        self.pending_value = None;
        self.stream.reset();
        self.frame_status.frame_start = self.sof_time;
        self.frame_status.frame_end = second_pulse;
        self.modulation.search_mode_state = SearchState::Locked;
        debug!(
            "NFC-V SOF at sample {}, 1-of-{} coding",
            self.sof_time,
            1u32 << bits
        );
    }

    /// Close the symbol window that just ended. Symbols commit one window
    /// late: a slot-0 symbol on a byte boundary followed by a pulse-free
    /// window was actually the end-of-frame pulse.
    fn finish_window(&mut self) -> Option<NfcFrame> {
        let length = self.pulse().length;
        let current = self.window_value.take();
        let current_time = self.window_pulse_time;
        self.window_start = self.window_start.wrapping_add(length);

        match (self.pending_value.take(), current) {
            (Some(pending), Some(value)) => {
                self.push_symbol(pending);
                self.pending_value = Some(value);
                self.pending_pulse_time = current_time;
                self.frame_status.frame_end = current_time;
                None
            }
            (None, Some(value)) => {
                self.pending_value = Some(value);
                self.pending_pulse_time = current_time;
                None
            }
            (Some(pending), None) => {
                let etu = length / self.pulse().periods;
                if pending == 0 && self.stream.bits == 0 {
                    // the withheld pulse was the EOF
                    self.frame_status.frame_end =
                        self.pending_pulse_time.wrapping_add(2 * etu);
                    self.assemble_frame()
                } else {
                    // transmission stopped mid-frame
                    self.push_symbol(pending);
                    self.frame_status.frame_end =
                        self.pending_pulse_time.wrapping_add(2 * etu);
                    self.assemble_frame()
                }
            }
            (None, None) => {
                debug!("NFC-V silence without end of frame");
                let result = if self.stream.bytes > 0 {
                    self.assemble_frame()
                } else {
                    None
                };
                self.rearm();
                result
            }
        }
    }

    fn push_symbol(&mut self, value: u32) {
        let stream = &mut self.stream;
        stream.data |= value << stream.bits;
        stream.bits += self.pulse_bits;
        if stream.bits >= 8 {
            let byte = (stream.data & 0xFF) as u8;
            stream.data = 0;
            stream.bits = 0;
            if stream.bytes < 512 {
                stream.buffer[stream.bytes as usize] = byte;
                stream.bytes += 1;
            } else {
                stream.flags |= FLAG_TRUNCATED;
            }
        }
    }

    fn assemble_frame(&mut self) -> Option<NfcFrame> {
        let stream = &mut self.stream;
        let mut frame = NfcFrame::new(TechType::NfcV, RateType::R26, Direction::Req);
        frame.frame_start = self.frame_status.frame_start;
        frame.frame_end = self.frame_status.frame_end;
        let result = if stream.bytes > 0 {
            for i in 0..stream.bytes as usize {
                frame.push(stream.buffer[i]);
            }
            frame.set_flag(FLAG_PARITY_OK);
            if stream.bits != 0 || stream.flags & FLAG_TRUNCATED != 0 {
                frame.set_flag(FLAG_TRUNCATED);
            }
            if frame.len() >= 3 && crc::check_nfcv(frame.payload()) {
                frame.set_flag(FLAG_CRC_OK);
            }
            debug!(
                "NFC-V frame, {} bytes at sample {}",
                frame.len(),
                frame.frame_start
            );
            Some(frame)
        } else {
            None
        };
        self.rearm();
        result
    }

    fn rearm(&mut self) {
        self.stream.reset();
        self.modulation.search_mode_state = SearchState::CarrierOn;
        self.modulation.search_value_threshold = MIN_PULSE_DEPTH;
        self.modulation.clear_peak();
        self.low = false;
        self.window_value = None;
        self.pending_value = None;
    }
}
