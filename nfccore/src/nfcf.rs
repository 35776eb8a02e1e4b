//! NFC-F demodulation at 212 and 424 kbps: Manchester coding over the
//! modulation depth, synchronised on the 0xB24D sync word after a run of
//! zero preamble bits.

use crate::bitrate::BitrateParams;
use crate::crc;
use crate::protocol::{
    Direction, NfcFrame, RateType, TechType, FLAG_CRC_OK, FLAG_PARITY_OK,
};
use crate::signal::{DecoderStatus, BUFFER_SIZE};
use crate::status::{FrameStatus, ModulationStatus, SearchState, StreamStatus};
use log::debug;

const SYNC_WORD: u32 = 0xB24D;
/// Preamble bits required before the sync word may match.
const MIN_PREAMBLE_BITS: u32 = 32;
/// Give up on a bit grid that never produces the sync word.
const MAX_PREAMBLE_BITS: u32 = 512;
const MAX_SYNC_ERRORS: u32 = 3;

fn idx(clock: u32) -> usize {
    clock as usize & (BUFFER_SIZE - 1)
}

struct RateSearch {
    rate: BitrateParams,
    status: ModulationStatus,
    /// Decoded bit shift register, most recent bit in the lowest position.
    shift: u32,
    bit_count: u32,
    errors: u32,
}

impl RateSearch {
    fn rearm(&mut self, clock: u32, threshold: f32) {
        self.status.search_mode_state = SearchState::CarrierOn;
        self.status.search_start_time = clock;
        self.status.search_value_threshold = threshold;
        self.status.clear_peak();
        self.shift = 0;
        self.bit_count = 0;
        self.errors = 0;
    }
}

pub(crate) struct NfcF {
    searches: [RateSearch; 2],
    active: Option<usize>,
    stream: StreamStatus,
    frame_status: FrameStatus,
    /// Expected total frame length once the LEN byte has arrived.
    frame_length: u32,
}

impl NfcF {
    pub fn new(sig: &DecoderStatus) -> Self {
        let r212 = BitrateParams::new(TechType::NfcF, RateType::R212, &sig.signal_params, 0);
        let delay = r212.period1_symbol_samples;
        let r424 = BitrateParams::new(TechType::NfcF, RateType::R424, &sig.signal_params, delay);
        let search = |rate: BitrateParams| RateSearch {
            rate,
            status: ModulationStatus::new(),
            shift: 0,
            bit_count: 0,
            errors: 0,
        };
        Self {
            searches: [search(r212), search(r424)],
            active: None,
            stream: StreamStatus::new(),
            frame_status: FrameStatus::default(),
            frame_length: 0,
        }
    }

    pub fn power_on(&mut self, sig: &DecoderStatus) {
        for search in self.searches.iter_mut() {
            let threshold = 0.02 * search.rate.period2_symbol_samples as f32;
            search.rearm(sig.signal_clock, threshold);
        }
        self.active = None;
        self.stream.reset();
        self.frame_length = 0;
    }

    pub fn power_off(&mut self) {
        for search in self.searches.iter_mut() {
            search.status.search_mode_state = SearchState::Idle;
        }
        self.active = None;
    }

    pub fn is_locked(&self) -> bool {
        self.searches
            .iter()
            .any(|s| s.status.search_mode_state == SearchState::Locked)
    }

    pub fn detect(&mut self, sig: &DecoderStatus) -> Option<NfcFrame> {
        for index in 0..self.searches.len() {
            if let Some(active) = self.active {
                if active != index {
                    continue;
                }
            }
            if let Some(frame) = self.detect_rate(index, sig) {
                return Some(frame);
            }
        }
        None
    }

    fn detect_rate(&mut self, index: usize, sig: &DecoderStatus) -> Option<NfcFrame> {
        if self.searches[index].status.search_mode_state == SearchState::Idle {
            return None;
        }
        let rate = self.searches[index].rate;
        let st = rate.signal_time(sig.signal_clock);
        let m = &mut self.searches[index].status;

        let depth = sig.sample[idx(st)].modulate_depth;
        let delayed =
            sig.sample[idx(st.wrapping_sub(rate.period2_symbol_samples))].modulate_depth;
        m.detect_integrate += depth - delayed;
        m.integration_data[idx(st)] = m.detect_integrate;
        let corr = m.detect_integrate
            - m.integration_data[idx(st.wrapping_sub(rate.period2_symbol_samples))];
        m.correlation_data[idx(st)] = corr;
        m.search_corr0_value = corr;

        match m.search_mode_state {
            SearchState::CarrierOn => {
                // positive correlation peaks sit on the bit boundaries of the
                // zero preamble
                if corr > m.search_value_threshold && corr > m.correlated_peak_value {
                    m.correlated_peak_value = corr;
                    m.correlated_peak_time = st;
                }
                if m.correlated_peak_value > 0.0
                    && st.wrapping_sub(m.correlated_peak_time) > rate.period2_symbol_samples
                {
                    m.symbol_start_time = m.correlated_peak_time;
                    m.search_sync_time =
                        m.correlated_peak_time.wrapping_add(rate.period1_symbol_samples);
                    m.search_end_time =
                        m.search_sync_time.wrapping_add(rate.period8_symbol_samples);
                    m.search_value_threshold = m.correlated_peak_value / 2.0;
                    m.search_mode_state = SearchState::Preamble;
                    m.clear_peak();
                }
            }
            SearchState::Preamble | SearchState::Locked => {
                if st == m.search_end_time {
                    return self.decide_bit(index, sig);
                }
            }
            _ => {}
        }
        None
    }

    /// Decide the bit that ended at the predicted boundary, pulling the grid
    /// onto the strongest correlation extremum nearby.
    fn decide_bit(&mut self, index: usize, _sig: &DecoderStatus) -> Option<NfcFrame> {
        let rate = self.searches[index].rate;
        let m = &mut self.searches[index].status;
        let predicted = m.search_sync_time;

        let mut boundary = predicted;
        let mut best = 0.0f32;
        let span = rate.period4_symbol_samples + rate.period8_symbol_samples;
        for k in 0..=span {
            let t = predicted
                .wrapping_sub(rate.period4_symbol_samples)
                .wrapping_add(k);
            let value = m.correlation_data[idx(t)].abs();
            if value > best {
                best = value;
                boundary = t;
            }
        }
        let c = m.correlation_data[idx(boundary)];
        let th = m.search_value_threshold;

        m.search_sync_time = boundary.wrapping_add(rate.period1_symbol_samples);
        m.search_end_time = m.search_sync_time.wrapping_add(rate.period8_symbol_samples);

        if c.abs() < th {
            let search = &mut self.searches[index];
            search.errors += 1;
            if search.errors >= MAX_SYNC_ERRORS {
                if search.status.search_mode_state == SearchState::Locked {
                    debug!("NFC-F sync lost at rate {}", search.rate.symbols_per_second);
                    self.stream.reset();
                    self.active = None;
                }
                let threshold = 0.02 * search.rate.period2_symbol_samples as f32;
                search.rearm(boundary, threshold);
            }
            return None;
        }
        self.searches[index].errors = 0;
        let bit = (c < 0.0) as u32;

        match self.searches[index].status.search_mode_state {
            SearchState::Preamble => {
                let search = &mut self.searches[index];
                search.shift = (search.shift << 1) | bit;
                search.bit_count += 1;
                if search.bit_count >= MIN_PREAMBLE_BITS
                    && search.shift & 0xFFFF == SYNC_WORD
                {
                    search.status.search_mode_state = SearchState::Locked;
                    self.active = Some(index);
                    self.stream.reset();
                    self.frame_length = 0;
                    self.frame_status.frame_start = search.status.symbol_start_time;
                    self.frame_status.frame_end = boundary;
                    debug!(
                        "NFC-F sync at sample {}, {} baud",
                        boundary, search.rate.symbols_per_second
                    );
                } else if search.bit_count > MAX_PREAMBLE_BITS {
                    let threshold = 0.02 * search.rate.period2_symbol_samples as f32;
                    search.rearm(boundary, threshold);
                }
                None
            }
            SearchState::Locked => self.push_bit(index, bit, boundary),
            _ => None,
        }
    }

    fn push_bit(&mut self, index: usize, bit: u32, boundary: u32) -> Option<NfcFrame> {
        self.frame_status.frame_end = boundary;
        let stream = &mut self.stream;
        stream.data = (stream.data << 1) | bit;
        stream.bits += 1;
        if stream.bits < 8 {
            return None;
        }
        let byte = (stream.data & 0xFF) as u8;
        stream.data = 0;
        stream.bits = 0;
        if stream.bytes < 512 {
            stream.buffer[stream.bytes as usize] = byte;
            stream.bytes += 1;
        }
        if stream.bytes == 1 {
            // length byte counts itself plus the payload; two CRC bytes follow
            if byte == 0 {
                debug!("NFC-F invalid length byte");
                self.resync(boundary);
                return None;
            }
            self.frame_length = byte as u32 + 2;
        }
        if self.frame_length > 0 && stream.bytes >= self.frame_length {
            return self.assemble_frame(index);
        }
        None
    }

    fn assemble_frame(&mut self, index: usize) -> Option<NfcFrame> {
        let rate = self.searches[index].rate;
        let stream = &mut self.stream;
        let mut frame = NfcFrame::new(TechType::NfcF, rate.rate_type, Direction::Req);
        frame.frame_start = self.frame_status.frame_start;
        frame.frame_end = self.frame_status.frame_end;
        for i in 0..stream.bytes as usize {
            frame.push(stream.buffer[i]);
        }
        frame.set_flag(FLAG_PARITY_OK);
        if crc::check_nfcf(frame.payload()) {
            frame.set_flag(FLAG_CRC_OK);
        }
        debug!(
            "NFC-F frame, {} bytes at sample {}",
            frame.len(),
            frame.frame_start
        );
        self.resync(frame.frame_end);
        Some(frame)
    }

    fn resync(&mut self, clock: u32) {
        self.stream.reset();
        self.frame_length = 0;
        self.active = None;
        for search in self.searches.iter_mut() {
            let threshold = 0.02 * search.rate.period2_symbol_samples as f32;
            search.rearm(clock, threshold);
        }
    }
}
