//! NFC-A demodulation at 106 kbps: ASK-100 modified Miller on the request
//! side, Manchester over the 848 kHz load-modulation subcarrier on the
//! response side.

use crate::bitrate::BitrateParams;
use crate::crc;
use crate::protocol::{
    Direction, NfcFrame, RateType, TechType, FLAG_PARITY_OK, FLAG_SHORT_FRAME, FLAG_TRUNCATED,
    FLAG_CRC_OK,
};
use crate::signal::{DecoderStatus, BUFFER_SIZE};
use crate::status::{FrameStatus, ModulationStatus, SearchState, StreamStatus, SymbolStatus};
use log::debug;

// Miller patterns, reader to card.
const PATTERN_X: u32 = 1; // pause in the second half -> 1
const PATTERN_Y: u32 = 2; // no pause -> 0
const PATTERN_Z: u32 = 3; // pause in the first half -> 0
// Manchester patterns, card to reader.
const PATTERN_D: u32 = 4; // subcarrier in the first half -> 1
const PATTERN_E: u32 = 5; // subcarrier in the second half -> 0
const PATTERN_F: u32 = 6; // no subcarrier, end of frame

/// ASK-100 pauses drop the carrier almost completely.
const MIN_PAUSE_DEPTH: f32 = 0.5;
const MAX_SYNC_ERRORS: u32 = 3;

fn idx(clock: u32) -> usize {
    clock as usize & (BUFFER_SIZE - 1)
}

pub(crate) struct NfcA {
    rate: BitrateParams,
    poll: ModulationStatus,
    listen: ModulationStatus,
    poll_stream: StreamStatus,
    listen_stream: StreamStatus,
    frame_status: FrameStatus,
    pulse_run: u32,
    poll_errors: u32,
    listen_errors: u32,
}

impl NfcA {
    pub fn new(sig: &DecoderStatus) -> Self {
        Self {
            rate: BitrateParams::new(TechType::NfcA, RateType::R106, &sig.signal_params, 0),
            poll: ModulationStatus::new(),
            listen: ModulationStatus::new(),
            poll_stream: StreamStatus::new(),
            listen_stream: StreamStatus::new(),
            frame_status: FrameStatus::default(),
            pulse_run: 0,
            poll_errors: 0,
            listen_errors: 0,
        }
    }

    /// Arm both searchers after a carrier-on or a finished frame.
    pub fn power_on(&mut self, sig: &DecoderStatus) {
        self.poll.search_mode_state = SearchState::CarrierOn;
        self.poll.search_start_time = sig.signal_clock;
        self.poll.search_value_threshold =
            self.rate.period2_symbol_samples as f32 * sig.signal_high_threshold;
        self.poll.search_pulse_width = 0;
        self.poll.symbol_rise_time = 0;
        self.poll.clear_peak();
        self.listen.search_mode_state = SearchState::CarrierOn;
        self.listen.search_start_time = sig.signal_clock;
        // high enough that edge transients of the other technologies never
        // reach it; a real subcarrier burst integrates well past it
        self.listen.search_value_threshold = 0.04 * self.rate.period2_symbol_samples as f32;
        self.listen.clear_peak();
        self.poll_stream.reset();
        self.listen_stream.reset();
        self.pulse_run = 0;
        self.poll_errors = 0;
        self.listen_errors = 0;
    }

    pub fn power_off(&mut self) {
        self.poll.search_mode_state = SearchState::Idle;
        self.listen.search_mode_state = SearchState::Idle;
    }

    pub fn is_locked(&self) -> bool {
        matches!(
            self.poll.search_mode_state,
            SearchState::Preamble | SearchState::Sync | SearchState::Locked
        ) || self.listen.search_mode_state == SearchState::Locked
    }

    pub fn detect(&mut self, sig: &DecoderStatus) -> Option<NfcFrame> {
        // Each side stops hunting once the other has found a start of frame.
        let poll_active = self.listen.search_mode_state != SearchState::Locked;
        let listen_active = matches!(
            self.poll.search_mode_state,
            SearchState::Idle | SearchState::CarrierOn
        );
        if poll_active {
            if let Some(symbol) = self.next_poll_symbol(sig) {
                if let Some(frame) = self.process_poll_symbol(symbol) {
                    return Some(frame);
                }
            }
        }
        if listen_active {
            if let Some(symbol) = self.next_listen_symbol(sig) {
                if let Some(frame) = self.process_listen_symbol(symbol) {
                    return Some(frame);
                }
            }
        }
        None
    }

    /// Miller searcher: half-symbol correlation over the DC-removed signal,
    /// gated on completed deep-modulation pauses of plausible width.
    fn next_poll_symbol(&mut self, sig: &DecoderStatus) -> Option<SymbolStatus> {
        if self.poll.search_mode_state == SearchState::Idle {
            return None;
        }
        let rate = self.rate;
        let m = &mut self.poll;
        let clock = sig.signal_clock;

        let signal = sig.sample[idx(clock)].filtered_value;
        let delayed =
            sig.sample[idx(clock.wrapping_add(rate.offset_delay2_index))].filtered_value;
        m.filter_integrate += signal - delayed;
        m.integration_data[idx(clock)] = m.filter_integrate;
        let corr0 = m.filter_integrate
            - m.integration_data[idx(clock.wrapping_add(rate.offset_delay2_index))];
        let corr1 = m.correlation_data[idx(clock.wrapping_add(rate.offset_delay2_index))];
        m.correlation_data[idx(clock)] = corr0;
        m.search_corr0_value = corr0;
        m.search_corr1_value = corr1;
        let corr_d = corr0.abs();
        m.search_corr_d_value = corr_d;

        // pulse width of the current carrier pause
        let depth = sig.sample[idx(clock)].modulate_depth;
        if depth > MIN_PAUSE_DEPTH {
            self.pulse_run += 1;
        } else if self.pulse_run > 0 {
            m.search_pulse_width = self.pulse_run;
            m.symbol_rise_time = clock;
            self.pulse_run = 0;
        }

        let width_valid = m.search_pulse_width >= rate.period8_symbol_samples
            && m.search_pulse_width
                <= rate.period2_symbol_samples + rate.period8_symbol_samples;
        let pulse_recent = m.symbol_rise_time != 0
            && clock.wrapping_sub(m.symbol_rise_time) < rate.period2_symbol_samples;

        if corr_d > m.search_value_threshold && width_valid && pulse_recent {
            let update = if m.correlated_peak_value == 0.0 {
                true
            } else if clock.wrapping_sub(m.correlated_peak_time)
                < rate.period8_symbol_samples
            {
                // a later peak close by must clearly beat the earlier one
                corr_d > m.correlated_peak_value + m.search_value_threshold
            } else {
                corr_d > m.correlated_peak_value
            };
            if update {
                m.correlated_peak_value = corr_d;
                m.correlated_peak_time = clock;
            }
        }

        match m.search_mode_state {
            SearchState::CarrierOn => {
                // a pause completing with a correlation peak is the SOF
                if m.symbol_rise_time == clock && width_valid && m.correlated_peak_value > 0.0 {
                    let start = clock.wrapping_sub(m.search_pulse_width);
                    let end = start.wrapping_add(rate.period1_symbol_samples);
                    m.symbol_start_time = start;
                    m.symbol_end_time = end;
                    m.search_sync_time = end.wrapping_add(rate.period1_symbol_samples);
                    m.search_end_time =
                        m.search_sync_time.wrapping_add(rate.period8_symbol_samples);
                    m.search_value_threshold = m.correlated_peak_value / 2.0;
                    m.search_mode_state = SearchState::Preamble;
                    m.clear_peak();
                    m.search_pulse_width = 0;
                    m.symbol_rise_time = 0;
                    debug!("NFC-A SOF Z at sample {}", start);
                    return Some(SymbolStatus {
                        pattern: PATTERN_Z,
                        value: 0,
                        start,
                        end,
                        edge: clock,
                        length: rate.period1_symbol_samples,
                        rate: rate.symbols_per_second,
                    });
                }
            }
            SearchState::Preamble | SearchState::Locked => {
                if clock == m.search_end_time {
                    let mut start =
                        m.search_sync_time.wrapping_sub(rate.period1_symbol_samples);
                    let pattern = if m.correlated_peak_value > 0.0 {
                        let offset = m.correlated_peak_time.wrapping_sub(start);
                        if offset < rate.period2_symbol_samples {
                            PATTERN_Z
                        } else {
                            PATTERN_X
                        }
                    } else {
                        PATTERN_Y
                    };
                    // pull the symbol grid back onto the measured pause
                    if pattern != PATTERN_Y && m.symbol_rise_time != 0 {
                        let pause_start =
                            m.symbol_rise_time.wrapping_sub(m.search_pulse_width);
                        let expected = if pattern == PATTERN_Z {
                            start
                        } else {
                            start.wrapping_add(rate.period2_symbol_samples)
                        };
                        let drift = pause_start.wrapping_sub(expected) as i32;
                        if drift.unsigned_abs() <= rate.period4_symbol_samples {
                            start = start.wrapping_add(drift as u32);
                        }
                    }
                    let end = start.wrapping_add(rate.period1_symbol_samples);
                    m.symbol_start_time = start;
                    m.symbol_end_time = end;
                    m.search_sync_time = end.wrapping_add(rate.period1_symbol_samples);
                    m.search_end_time =
                        m.search_sync_time.wrapping_add(rate.period8_symbol_samples);
                    if m.correlated_peak_value > 0.0 {
                        m.search_value_threshold = m.correlated_peak_value / 2.0;
                    }
                    let symbol = SymbolStatus {
                        pattern,
                        value: (pattern == PATTERN_X) as u32,
                        start,
                        end,
                        edge: m.symbol_rise_time,
                        length: rate.period1_symbol_samples,
                        rate: rate.symbols_per_second,
                    };
                    m.clear_peak();
                    m.search_pulse_width = 0;
                    m.symbol_rise_time = 0;
                    return Some(symbol);
                }
            }
            _ => {}
        }
        None
    }

    fn process_poll_symbol(&mut self, symbol: SymbolStatus) -> Option<NfcFrame> {
        if self.poll_stream.previous == 0 {
            // start of frame, not a data bit
            self.poll_stream.previous = symbol.pattern;
            self.frame_status.frame_start = symbol.start;
            self.frame_status.frame_end = symbol.end;
            return None;
        }
        let previous = self.poll_stream.previous;

        // silence after a zero-coded symbol is the end of communication
        if symbol.pattern == PATTERN_Y
            && (previous == PATTERN_Y || previous == PATTERN_Z)
        {
            return self.assemble_poll_frame();
        }
        // a zero after a one is always coded Y
        if symbol.pattern == PATTERN_Z && previous == PATTERN_X {
            return self.poll_sync_lost();
        }
        self.poll_stream.previous = symbol.pattern;
        self.frame_status.frame_end = symbol.end;

        let bit = (symbol.pattern == PATTERN_X) as u32;
        let stream = &mut self.poll_stream;
        stream.data |= bit << stream.bits;
        stream.bits += 1;
        if stream.bits == 9 {
            let byte = (stream.data & 0xFF) as u8;
            let parity = stream.data >> 8;
            stream.data = 0;
            stream.bits = 0;
            if stream.bytes < 512 {
                stream.buffer[stream.bytes as usize] = byte;
                stream.bytes += 1;
            } else {
                stream.flags |= FLAG_TRUNCATED;
            }
            if (byte.count_ones() + parity) % 2 != 1 {
                debug!("NFC-A parity error in byte {}", stream.bytes);
                return self.parity_abort(Direction::Req);
            }
        }
        if self.poll.search_mode_state == SearchState::Preamble
            && self.poll_stream.bytes * 9 + self.poll_stream.bits >= 2
        {
            self.poll.search_mode_state = SearchState::Locked;
        }
        None
    }

    fn assemble_poll_frame(&mut self) -> Option<NfcFrame> {
        let stream = &mut self.poll_stream;
        // the last decoded bit is the end-of-communication zero
        if stream.bits > 0 {
            stream.bits -= 1;
            stream.data &= (1 << stream.bits) - 1;
        }
        let mut frame = NfcFrame::new(TechType::NfcA, RateType::R106, Direction::Req);
        frame.frame_start = self.frame_status.frame_start;
        frame.frame_end = self.frame_status.frame_end;
        let result = if stream.bytes == 0 && stream.bits == 7 {
            frame.push((stream.data & 0x7F) as u8);
            frame.set_flag(FLAG_SHORT_FRAME | FLAG_PARITY_OK);
            debug!("NFC-A short frame at sample {}", frame.frame_start);
            Some(frame)
        } else if stream.bytes > 0 {
            for i in 0..stream.bytes as usize {
                frame.push(stream.buffer[i]);
            }
            frame.set_flag(FLAG_PARITY_OK);
            if stream.bits != 0 || stream.flags & FLAG_TRUNCATED != 0 {
                frame.set_flag(FLAG_TRUNCATED);
            }
            if frame.len() >= 3 && crc::check_nfca(frame.payload()) {
                frame.set_flag(FLAG_CRC_OK);
            }
            Some(frame)
        } else {
            None
        };
        self.rearm_poll();
        result
    }

    fn parity_abort(&mut self, direction: Direction) -> Option<NfcFrame> {
        let (stream, frame_status) = if direction == Direction::Req {
            (&mut self.poll_stream, &self.frame_status)
        } else {
            (&mut self.listen_stream, &self.frame_status)
        };
        let mut frame = NfcFrame::new(TechType::NfcA, RateType::R106, direction);
        frame.frame_start = frame_status.frame_start;
        frame.frame_end = frame_status.frame_end;
        // truncate at the failing byte, PARITY_OK deliberately clear
        for i in 0..stream.bytes.saturating_sub(1) as usize {
            frame.push(stream.buffer[i]);
        }
        frame.set_flag(FLAG_TRUNCATED);
        if direction == Direction::Req {
            self.rearm_poll();
        } else {
            self.rearm_listen();
        }
        Some(frame)
    }

    fn poll_sync_lost(&mut self) -> Option<NfcFrame> {
        self.poll_errors += 1;
        debug!("NFC-A poll sync lost ({})", self.poll_errors);
        self.poll_stream.reset();
        self.poll.search_mode_state = if self.poll_errors >= MAX_SYNC_ERRORS {
            SearchState::Idle
        } else {
            SearchState::CarrierOn
        };
        self.poll.clear_peak();
        None
    }

    fn rearm_poll(&mut self) {
        self.poll_stream.reset();
        self.poll.search_mode_state = SearchState::CarrierOn;
        self.poll.clear_peak();
        self.poll.search_pulse_width = 0;
        self.poll.symbol_rise_time = 0;
        self.pulse_run = 0;
        self.poll_errors = 0;
    }

    /// Manchester searcher over the running deviation: the subcarrier raises
    /// the deviation during its on half-bits.
    fn next_listen_symbol(&mut self, sig: &DecoderStatus) -> Option<SymbolStatus> {
        if self.listen.search_mode_state == SearchState::Idle {
            return None;
        }
        let rate = self.rate;
        let m = &mut self.listen;
        let clock = sig.signal_clock;

        let dev = sig.sample[idx(clock)].mean_deviation;
        let delayed =
            sig.sample[idx(clock.wrapping_add(rate.offset_delay2_index))].mean_deviation;
        m.detect_integrate += dev - delayed;
        m.integration_data[idx(clock)] = m.detect_integrate;
        let corr = m.detect_integrate
            - m.integration_data[idx(clock.wrapping_add(rate.offset_delay2_index))];
        m.correlation_data[idx(clock)] = corr;
        m.search_corr0_value = corr;

        match m.search_mode_state {
            SearchState::CarrierOn => {
                // positive peak at the end of the first subcarrier burst
                if corr > m.search_value_threshold && corr > m.correlated_peak_value {
                    m.correlated_peak_value = corr;
                    m.correlated_peak_time = clock;
                }
                if m.correlated_peak_value > 0.0
                    && clock.wrapping_sub(m.correlated_peak_time)
                        > rate.period4_symbol_samples
                {
                    let start = m.correlated_peak_time.wrapping_sub(rate.period2_symbol_samples);
                    m.symbol_start_time = start;
                    m.symbol_end_time = start.wrapping_add(rate.period1_symbol_samples);
                    m.search_sync_time = m.symbol_end_time;
                    m.search_end_time =
                        m.search_sync_time.wrapping_add(rate.period8_symbol_samples);
                    m.search_mode_state = SearchState::Preamble;
                    m.clear_peak();
                }
            }
            SearchState::Preamble => {
                // validate the SOF at its end boundary: on -> off transition
                if clock == m.search_end_time {
                    let c = m.correlation_data[idx(m.search_sync_time)];
                    if c < -m.search_value_threshold {
                        m.search_value_threshold = c.abs() / 2.0;
                        m.search_mode_state = SearchState::Locked;
                        self.frame_status.frame_start = m.symbol_start_time;
                        self.frame_status.frame_end = m.symbol_end_time;
                        self.listen_stream.reset();
                        self.listen_errors = 0;
                        m.search_sync_time = m
                            .search_sync_time
                            .wrapping_add(rate.period1_symbol_samples);
                        m.search_end_time =
                            m.search_sync_time.wrapping_add(rate.period8_symbol_samples);
                        m.clear_peak();
                        debug!(
                            "NFC-A response SOF at sample {}",
                            self.frame_status.frame_start
                        );
                    } else {
                        m.search_mode_state = SearchState::CarrierOn;
                        m.clear_peak();
                    }
                }
            }
            SearchState::Locked => {
                // boundary extremum for per-symbol resync
                if corr.abs() > m.detector_peak_value {
                    m.detector_peak_value = corr.abs();
                    m.detector_peak_time = clock;
                }
                if clock == m.search_end_time {
                    let mut boundary = m.search_sync_time;
                    if m.detector_peak_value > m.search_value_threshold {
                        let drift = m.detector_peak_time.wrapping_sub(boundary) as i32;
                        if drift.unsigned_abs() <= rate.period4_symbol_samples {
                            boundary = m.detector_peak_time;
                        }
                    }
                    let c = m.correlation_data[idx(boundary)];
                    let energy = m.integration_data[idx(boundary)]
                        + m.integration_data
                            [idx(boundary.wrapping_sub(rate.period2_symbol_samples))];
                    let th = m.search_value_threshold;
                    let pattern = if c < -th {
                        PATTERN_D
                    } else if c > th {
                        PATTERN_E
                    } else if energy < th {
                        PATTERN_F
                    } else {
                        m.clear_peak();
                        m.search_sync_time =
                            boundary.wrapping_add(rate.period1_symbol_samples);
                        m.search_end_time =
                            m.search_sync_time.wrapping_add(rate.period8_symbol_samples);
                        self.listen_errors += 1;
                        if self.listen_errors >= MAX_SYNC_ERRORS {
                            debug!("NFC-A listen sync lost");
                            self.listen_stream.reset();
                            m.search_mode_state = SearchState::Idle;
                        }
                        return None;
                    };
                    let start = boundary.wrapping_sub(rate.period1_symbol_samples);
                    m.symbol_start_time = start;
                    m.symbol_end_time = boundary;
                    m.search_sync_time = boundary.wrapping_add(rate.period1_symbol_samples);
                    m.search_end_time =
                        m.search_sync_time.wrapping_add(rate.period8_symbol_samples);
                    let symbol = SymbolStatus {
                        pattern,
                        value: (pattern == PATTERN_D) as u32,
                        start,
                        end: boundary,
                        edge: m.detector_peak_time,
                        length: rate.period1_symbol_samples,
                        rate: rate.symbols_per_second,
                    };
                    m.clear_peak();
                    self.listen_errors = 0;
                    return Some(symbol);
                }
            }
            _ => {}
        }
        None
    }

    fn process_listen_symbol(&mut self, symbol: SymbolStatus) -> Option<NfcFrame> {
        if symbol.pattern == PATTERN_F {
            return self.assemble_listen_frame();
        }
        self.frame_status.frame_end = symbol.end;
        let bit = symbol.value;
        let stream = &mut self.listen_stream;
        stream.data |= bit << stream.bits;
        stream.bits += 1;
        if stream.bits == 9 {
            let byte = (stream.data & 0xFF) as u8;
            let parity = stream.data >> 8;
            stream.data = 0;
            stream.bits = 0;
            if stream.bytes < 512 {
                stream.buffer[stream.bytes as usize] = byte;
                stream.bytes += 1;
            } else {
                stream.flags |= FLAG_TRUNCATED;
            }
            if (byte.count_ones() + parity) % 2 != 1 {
                debug!("NFC-A response parity error in byte {}", stream.bytes);
                return self.parity_abort(Direction::Res);
            }
        }
        None
    }

    fn assemble_listen_frame(&mut self) -> Option<NfcFrame> {
        let stream = &mut self.listen_stream;
        let mut frame = NfcFrame::new(TechType::NfcA, RateType::R106, Direction::Res);
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
            if frame.len() >= 3 && crc::check_nfca(frame.payload()) {
                frame.set_flag(FLAG_CRC_OK);
            }
            debug!(
                "NFC-A response frame, {} bytes at sample {}",
                frame.len(),
                frame.frame_start
            );
            Some(frame)
        } else {
            None
        };
        self.rearm_listen();
        result
    }

    fn rearm_listen(&mut self) {
        self.listen_stream.reset();
        self.listen.search_mode_state = SearchState::CarrierOn;
        self.listen.clear_peak();
        self.listen_errors = 0;
    }
}
