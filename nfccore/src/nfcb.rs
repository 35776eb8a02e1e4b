//! NFC-B demodulation at 106 kbps: ASK-10 NRZ-L on the request side, BPSK
//! over the 848 kHz subcarrier on the response side.

use crate::bitrate::BitrateParams;
use crate::crc;
use crate::protocol::{
    Direction, NfcFrame, RateType, TechType, FLAG_CRC_OK, FLAG_PARITY_OK, FLAG_TRUNCATED,
};
use crate::signal::{DecoderStatus, BUFFER_SIZE};
use crate::status::{FrameStatus, ModulationStatus, SearchState, StreamStatus};
use log::debug;

/// Initial modulation depth threshold for the 10% ASK request stream.
const MIN_ASK_DEPTH: f32 = 0.04;
/// Deviation floor for subcarrier presence on the response stream.
const MIN_SUBCARRIER_DEVIATION: f32 = 0.02;
const MAX_PENDING_ZEROS: u32 = 24;

fn idx(clock: u32) -> usize {
    clock as usize & (BUFFER_SIZE - 1)
}

pub(crate) struct NfcB {
    rate: BitrateParams,
    poll: ModulationStatus,
    listen: ModulationStatus,
    poll_stream: StreamStatus,
    listen_stream: StreamStatus,
    frame_status: FrameStatus,
    /// Request-side level tracking.
    low: bool,
    fall_time: u32,
    rise_time: u32,
    low_count: u32,
    /// Zero bits withheld until the next one bit rules out the EOF.
    pending_zeros: u32,
    pending_start: u32,
    /// Response-side BPSK level and half subcarrier period delay.
    level: u32,
    sub_half: u32,
    level_run: u32,
}

impl NfcB {
    pub fn new(sig: &DecoderStatus) -> Self {
        let sub_half = (sig.signal_params.sample_time_unit * 8.0).round() as u32;
        Self {
            rate: BitrateParams::new(TechType::NfcB, RateType::R106, &sig.signal_params, 0),
            poll: ModulationStatus::new(),
            listen: ModulationStatus::new(),
            poll_stream: StreamStatus::new(),
            listen_stream: StreamStatus::new(),
            frame_status: FrameStatus::default(),
            low: false,
            fall_time: 0,
            rise_time: 0,
            low_count: 0,
            pending_zeros: 0,
            pending_start: 0,
            level: 1,
            sub_half,
            level_run: 0,
        }
    }

    pub fn power_on(&mut self, sig: &DecoderStatus) {
        let period1 = self.rate.period1_symbol_samples as f32;
        self.poll.search_mode_state = SearchState::CarrierOn;
        self.poll.search_start_time = sig.signal_clock;
        self.poll.search_value_threshold = MIN_ASK_DEPTH;
        self.poll.clear_peak();
        self.listen.search_mode_state = SearchState::CarrierOn;
        self.listen.search_start_time = sig.signal_clock;
        // a phase reversal claws back roughly one subcarrier period out of
        // the full-symbol phase integral
        self.listen.search_phase_threshold =
            -(period1 - 2.0 * self.sub_half as f32);
        self.listen.phase_integrate = 0.0;
        self.listen.search_pulse_width = 0;
        self.poll_stream.reset();
        self.listen_stream.reset();
        self.low = false;
        self.low_count = 0;
        self.pending_zeros = 0;
        self.level = 1;
        self.level_run = 0;
    }

    pub fn power_off(&mut self) {
        self.poll.search_mode_state = SearchState::Idle;
        self.listen.search_mode_state = SearchState::Idle;
    }

    pub fn is_locked(&self) -> bool {
        matches!(
            self.poll.search_mode_state,
            SearchState::Sync | SearchState::Locked
        ) || self.listen.search_mode_state == SearchState::Locked
    }

    pub fn detect(&mut self, sig: &DecoderStatus) -> Option<NfcFrame> {
        let poll_active = self.listen.search_mode_state != SearchState::Locked;
        let listen_active = matches!(
            self.poll.search_mode_state,
            SearchState::Idle | SearchState::CarrierOn
        );
        if poll_active {
            if let Some(frame) = self.detect_poll(sig) {
                return Some(frame);
            }
        }
        if listen_active {
            if let Some(frame) = self.detect_listen(sig) {
                return Some(frame);
            }
        }
        None
    }

    fn detect_poll(&mut self, sig: &DecoderStatus) -> Option<NfcFrame> {
        if self.poll.search_mode_state == SearchState::Idle {
            return None;
        }
        let rate = self.rate;
        let period1 = rate.period1_symbol_samples;
        let clock = sig.signal_clock;
        let depth = sig.sample[idx(clock)].modulate_depth;

        let low = depth > self.poll.search_value_threshold;
        if low != self.low {
            if low {
                self.fall_time = clock;
            } else {
                self.rise_time = clock;
            }
            self.low = low;
        }
        if low && depth > self.poll.detector_peak_value {
            self.poll.detector_peak_value = depth;
            self.poll.detector_peak_time = clock;
        }

        match self.poll.search_mode_state {
            SearchState::CarrierOn => {
                if low && self.fall_time == clock {
                    self.poll.symbol_start_time = clock;
                    self.poll.search_mode_state = SearchState::Preamble;
                }
            }
            SearchState::Preamble => {
                // SOF starts with 10-11 ETU of modulation; the bit grid is
                // anchored two ETU past the rise, at the nominal end of the
                // SOF high period
                if !low && self.rise_time == clock {
                    let run = clock.wrapping_sub(self.poll.symbol_start_time);
                    if run >= 9 * period1 && run <= 12 * period1 {
                        self.poll.search_value_threshold =
                            (self.poll.detector_peak_value / 2.0).max(MIN_ASK_DEPTH);
                        self.poll.search_mode_state = SearchState::Sync;
                        self.poll.search_sync_time = clock;
                        self.poll.search_end_time = clock.wrapping_add(3 * period1);
                        self.frame_status.frame_start = self.poll.symbol_start_time;
                        self.frame_status.frame_end = clock;
                        self.poll_stream.reset();
                        self.low_count = 0;
                        self.pending_zeros = 0;
                        debug!("NFC-B SOF at sample {}", self.frame_status.frame_start);
                    } else {
                        self.poll.search_mode_state = SearchState::CarrierOn;
                        self.poll.clear_peak();
                    }
                }
            }
            SearchState::Sync | SearchState::Locked => {
                if self.poll.search_mode_state == SearchState::Sync {
                    // the first fall confirms a data stream behind the SOF
                    if low && self.fall_time == clock {
                        self.poll.search_mode_state = SearchState::Locked;
                    } else if clock.wrapping_sub(self.poll.search_sync_time) > 16 * period1 {
                        // nothing but idle carrier after the low run
                        self.poll_stream.reset();
                        self.poll.search_mode_state = SearchState::CarrierOn;
                        self.poll.clear_peak();
                        return None;
                    }
                }
                self.low_count += low as u32;
                // bit boundaries snap onto nearby level edges
                if (low && self.fall_time == clock) || (!low && self.rise_time == clock) {
                    let rel = clock.wrapping_sub(self.poll.search_end_time) as i32;
                    let drift = if rel + (period1 as i32) <= (rate.period4_symbol_samples as i32)
                    {
                        rel + period1 as i32
                    } else if -rel <= rate.period4_symbol_samples as i32 {
                        rel
                    } else {
                        0
                    };
                    if drift != 0 {
                        let adjusted =
                            self.poll.search_end_time.wrapping_add(drift as u32);
                        if adjusted.wrapping_sub(clock) as i32 > 0 {
                            self.poll.search_end_time = adjusted;
                        }
                    }
                }
                if clock == self.poll.search_end_time {
                    let bit_low = self.low_count * 2 > period1;
                    self.low_count = 0;
                    self.poll.search_end_time = clock.wrapping_add(period1);
                    if let Some(frame) = self.poll_bit(bit_low, clock) {
                        return Some(frame);
                    }
                }
            }
            _ => {}
        }
        None
    }

    /// Handle one NRZ bit window. Zero bits are withheld until a one bit
    /// rules out the end-of-frame low run.
    fn poll_bit(&mut self, bit_low: bool, window_end: u32) -> Option<NfcFrame> {
        let period1 = self.rate.period1_symbol_samples;
        if bit_low {
            if self.pending_zeros == 0 {
                self.pending_start = window_end.wrapping_sub(period1);
            }
            self.pending_zeros += 1;
            let data_zeros = if self.poll_stream.bits == 0 {
                0
            } else {
                9 - self.poll_stream.bits
            };
            if self.pending_zeros >= data_zeros + 10 {
                // the low run is the EOF; anything needed to complete the
                // current byte belongs to the data
                for _ in 0..data_zeros {
                    if let Some(frame) = self.push_poll_bit(0) {
                        return Some(frame);
                    }
                }
                self.frame_status.frame_end =
                    self.pending_start.wrapping_add(data_zeros * period1);
                return self.assemble_poll_frame();
            }
            if self.pending_zeros > MAX_PENDING_ZEROS {
                debug!("NFC-B poll sync lost");
                self.rearm_poll();
            }
        } else {
            for _ in 0..self.pending_zeros {
                if let Some(frame) = self.push_poll_bit(0) {
                    return Some(frame);
                }
            }
            self.pending_zeros = 0;
            if let Some(frame) = self.push_poll_bit(1) {
                return Some(frame);
            }
            self.frame_status.frame_end = window_end;
        }
        None
    }

    /// Returns a frame only on a parity abort.
    fn push_poll_bit(&mut self, bit: u32) -> Option<NfcFrame> {
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
                debug!("NFC-B parity error in byte {}", stream.bytes);
                let mut frame =
                    NfcFrame::new(TechType::NfcB, RateType::R106, Direction::Req);
                frame.frame_start = self.frame_status.frame_start;
                frame.frame_end = self.frame_status.frame_end;
                for i in 0..stream.bytes.saturating_sub(1) as usize {
                    frame.push(stream.buffer[i]);
                }
                frame.set_flag(FLAG_TRUNCATED);
                self.rearm_poll();
                return Some(frame);
            }
        }
        None
    }

    fn assemble_poll_frame(&mut self) -> Option<NfcFrame> {
        let stream = &mut self.poll_stream;
        let mut frame = NfcFrame::new(TechType::NfcB, RateType::R106, Direction::Req);
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
            if frame.len() >= 3 && crc::check_nfcb(frame.payload()) {
                frame.set_flag(FLAG_CRC_OK);
            }
            debug!(
                "NFC-B frame, {} bytes at sample {}",
                frame.len(),
                frame.frame_start
            );
            Some(frame)
        } else {
            None
        };
        self.rearm_poll();
        result
    }

    fn rearm_poll(&mut self) {
        self.poll_stream.reset();
        self.poll.search_mode_state = SearchState::CarrierOn;
        self.poll.search_value_threshold = MIN_ASK_DEPTH;
        self.poll.clear_peak();
        self.low = false;
        self.low_count = 0;
        self.pending_zeros = 0;
    }

    /// BPSK response demodulation: the per-sample phase product between the
    /// filtered signal and its half-subcarrier-period delay integrates to a
    /// strongly negative value over a symbol; a phase reversal pulls the
    /// integral above the phase threshold.
    fn detect_listen(&mut self, sig: &DecoderStatus) -> Option<NfcFrame> {
        if self.listen.search_mode_state == SearchState::Idle {
            return None;
        }
        let rate = self.rate;
        let period1 = rate.period1_symbol_samples;
        let clock = sig.signal_clock;
        let m = &mut self.listen;

        let eps = sig.signal_low_threshold;
        let ph = phase_product(
            sig.sample[idx(clock)].filtered_value,
            sig.sample[idx(clock.wrapping_sub(self.sub_half))].filtered_value,
            eps,
        );
        let delayed = m.integration_data[idx(clock.wrapping_add(rate.offset_delay1_index))];
        m.integration_data[idx(clock)] = ph;
        m.phase_integrate += ph - delayed;
        m.correlation_data[idx(clock)] = m.phase_integrate;

        let sub_present = sig.sample[idx(clock)].mean_deviation > MIN_SUBCARRIER_DEVIATION;

        match self.listen.search_mode_state {
            SearchState::CarrierOn => {
                // an unbroken subcarrier phase reference must precede the SOF
                if sub_present
                    && self.listen.phase_integrate < self.listen.search_phase_threshold
                {
                    self.listen.search_pulse_width += 1;
                } else {
                    self.listen.search_pulse_width = 0;
                }
                if self.listen.search_pulse_width >= 8 * period1 {
                    self.listen.search_mode_state = SearchState::Preamble;
                    self.level = 1;
                    self.level_run = 0;
                }
            }
            SearchState::Preamble => {
                if !sub_present {
                    self.listen.search_mode_state = SearchState::CarrierOn;
                    self.listen.search_pulse_width = 0;
                } else if self.listen.phase_integrate > self.listen.search_phase_threshold {
                    // first reversal opens the SOF low run
                    self.level = 0;
                    self.level_run = 0;
                    self.listen.symbol_start_time = clock;
                    self.listen.search_end_time = clock.wrapping_add(period1);
                    self.listen.search_mode_state = SearchState::Sync;
                }
            }
            SearchState::Sync | SearchState::Locked => {
                if clock == self.listen.search_end_time {
                    self.listen.search_end_time = clock.wrapping_add(period1);
                    let reversal =
                        self.listen.phase_integrate > self.listen.search_phase_threshold;
                    if reversal {
                        self.level ^= 1;
                        self.level_run = 0;
                    }
                    self.level_run += 1;
                    if self.listen.search_mode_state == SearchState::Sync {
                        // SOF: 10-11 zeros then 2-3 ones
                        if self.level == 1 && reversal {
                            if self.level_run == 1
                                && clock.wrapping_sub(self.listen.symbol_start_time)
                                    >= 9 * period1
                            {
                                // low run complete, ones begin
                            } else {
                                self.listen.search_mode_state = SearchState::CarrierOn;
                                self.listen.search_pulse_width = 0;
                            }
                        } else if (self.level == 0 && reversal)
                            || (self.level == 1 && !reversal && self.level_run > 3)
                        {
                            // ones complete, this window is the first data bit
                            let bit = self.level;
                            self.listen_stream.reset();
                            self.frame_status.frame_start = self.listen.symbol_start_time;
                            self.frame_status.frame_end = clock;
                            self.listen.search_mode_state = SearchState::Locked;
                            debug!(
                                "NFC-B response SOF at sample {}",
                                self.frame_status.frame_start
                            );
                            if let Some(frame) = self.push_listen_bit(bit, clock) {
                                return Some(frame);
                            }
                        }
                    } else if !sub_present {
                        // subcarrier gone: end of response
                        return self.assemble_listen_frame();
                    } else {
                        let bit = self.level;
                        if let Some(frame) = self.push_listen_bit(bit, clock) {
                            return Some(frame);
                        }
                    }
                }
                if self.listen.search_mode_state == SearchState::Sync && !sub_present {
                    self.listen.search_mode_state = SearchState::CarrierOn;
                    self.listen.search_pulse_width = 0;
                }
            }
            _ => {}
        }
        None
    }

    fn push_listen_bit(&mut self, bit: u32, window_end: u32) -> Option<NfcFrame> {
        self.frame_status.frame_end = window_end;
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
                debug!("NFC-B response parity error in byte {}", stream.bytes);
                let mut frame =
                    NfcFrame::new(TechType::NfcB, RateType::R106, Direction::Res);
                frame.frame_start = self.frame_status.frame_start;
                frame.frame_end = self.frame_status.frame_end;
                for i in 0..stream.bytes.saturating_sub(1) as usize {
                    frame.push(stream.buffer[i]);
                }
                frame.set_flag(FLAG_TRUNCATED);
                self.rearm_listen();
                return Some(frame);
            }
        }
        None
    }

    fn assemble_listen_frame(&mut self) -> Option<NfcFrame> {
        let stream = &mut self.listen_stream;
        let mut frame = NfcFrame::new(TechType::NfcB, RateType::R106, Direction::Res);
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
            if frame.len() >= 3 && crc::check_nfcb(frame.payload()) {
                frame.set_flag(FLAG_CRC_OK);
            }
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
        self.listen.search_pulse_width = 0;
        self.listen.clear_peak();
        self.level = 1;
        self.level_run = 0;
    }
}

/// Sign product with a dead zone around zero.
fn phase_product(current: f32, delayed: f32, eps: f32) -> f32 {
    let sign = |x: f32| {
        if x > eps {
            1.0
        } else if x < -eps {
            -1.0
        } else {
            0.0
        }
    };
    sign(current) * sign(delayed)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A phase reversal must raise the windowed phase integral relative to an
    /// unbroken subcarrier.
    #[test]
    fn phase_reversal_raises_integral() {
        let sub_half = 6usize;
        let make = |flip_at: Option<usize>| -> f32 {
            let mut wave = Vec::new();
            for i in 0..200usize {
                let mut phase = (i / sub_half) % 2 == 0;
                if let Some(f) = flip_at {
                    if i >= f {
                        phase = !phase;
                    }
                }
                wave.push(if phase { 0.1f32 } else { -0.1 });
            }
            let mut sum = 0.0;
            for i in (200 - 94)..200 {
                sum += phase_product(wave[i], wave[i - sub_half], 0.009);
            }
            sum
        };
        let unbroken = make(None);
        let reversed = make(Some(150));
        assert!(unbroken < -80.0, "unbroken integral {}", unbroken);
        assert!(reversed > unbroken + 8.0, "reversed {} unbroken {}", reversed, unbroken);
    }

    #[test]
    fn phase_product_dead_zone() {
        assert_eq!(phase_product(0.1, 0.1, 0.009), 1.0);
        assert_eq!(phase_product(0.1, -0.1, 0.009), -1.0);
        assert_eq!(phase_product(0.001, 0.1, 0.009), 0.0);
    }
}
