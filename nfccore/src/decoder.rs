//! Top-level decoder: feeds the signal frontend, arbitrates between the
//! technology demodulators and stamps decoded frames with direction and
//! guard window metadata.

use crate::nfca::NfcA;
use crate::nfcb::NfcB;
use crate::nfcf::NfcF;
use crate::nfcv::NfcV;
use crate::protocol::{
    Direction, NfcFrame, TechType, FLAG_SHORT_FRAME, NFCA_FDT_DEF, NFCA_FWT_DEF, NFCA_RGT_DEF,
    NFCB_FDT_DEF, NFCB_FWT_DEF, NFCF_FDT_DEF, NFCF_FWT_DEF, NFCV_FDT_DEF, NFCV_FWT_DEF,
};
use crate::signal::DecoderStatus;
use crate::status::FrameStatus;
use log::debug;

/// Technologies the decoder hypothesizes over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TechSet {
    pub nfca: bool,
    pub nfcb: bool,
    pub nfcf: bool,
    pub nfcv: bool,
}

impl Default for TechSet {
    fn default() -> Self {
        Self {
            nfca: true,
            nfcb: true,
            nfcf: true,
            nfcv: true,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DecoderConfig {
    pub sample_rate: u32,
    pub power_level_threshold: f32,
    pub signal_low_threshold: f32,
    pub signal_high_threshold: f32,
    pub enabled: TechSet,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            sample_rate: 10_000_000,
            power_level_threshold: 0.01,
            signal_low_threshold: 0.009,
            signal_high_threshold: 0.011,
            enabled: TechSet::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecoderState {
    /// No carrier.
    Idle,
    /// Carrier present, every enabled detector armed.
    Listen,
    /// One detector owns the signal.
    Locked(TechType),
}

/// Converts a sample stream into NFC frames.
pub struct NfcDecoder {
    status: DecoderStatus,
    nfca: Option<NfcA>,
    nfcb: Option<NfcB>,
    nfcf: Option<NfcF>,
    nfcv: Option<NfcV>,
    state: DecoderState,
    frame_status: FrameStatus,
}

impl NfcDecoder {
    pub fn new(config: &DecoderConfig) -> Self {
        let status = DecoderStatus::new(
            config.sample_rate,
            config.power_level_threshold,
            config.signal_low_threshold,
            config.signal_high_threshold,
        );
        let nfca = config.enabled.nfca.then(|| NfcA::new(&status));
        let nfcb = config.enabled.nfcb.then(|| NfcB::new(&status));
        let nfcf = config.enabled.nfcf.then(|| NfcF::new(&status));
        let nfcv = config.enabled.nfcv.then(|| NfcV::new(&status));
        Self {
            status,
            nfca,
            nfcb,
            nfcf,
            nfcv,
            state: DecoderState::Idle,
            frame_status: FrameStatus::default(),
        }
    }

    /// Process one envelope sample and return a frame when one completes.
    pub fn decode(&mut self, value: f32) -> Option<NfcFrame> {
        if self.status.next_sample(value) {
            if self.status.carrier_present() {
                debug!("carrier on at sample {}", self.status.carrier_on_time);
                self.arm_all();
                self.state = DecoderState::Listen;
            } else {
                debug!("carrier off at sample {}", self.status.carrier_off_time);
                self.disarm_all();
                self.state = DecoderState::Idle;
            }
        }

        match self.state {
            DecoderState::Idle => None,
            DecoderState::Listen => {
                if let Some(frame) = self.poll_detectors(None) {
                    self.arm_all();
                    return Some(self.finish(frame));
                }
                if let Some(tech) = self.locked_tech() {
                    self.disarm_others(tech);
                    self.state = DecoderState::Locked(tech);
                }
                None
            }
            DecoderState::Locked(tech) => {
                if let Some(frame) = self.poll_detectors(Some(tech)) {
                    self.state = DecoderState::Listen;
                    self.arm_all();
                    return Some(self.finish(frame));
                }
                if !self.tech_locked(tech) {
                    // lock released without a frame
                    self.state = DecoderState::Listen;
                    self.arm_all();
                }
                None
            }
        }
    }

    pub fn carrier_detect(&self) -> bool {
        self.status.carrier_present()
    }

    /// Signal frontend state, exposed for debug capture sinks.
    pub fn signal(&self) -> &DecoderStatus {
        &self.status
    }

    /// Orchestrator state encoded for the debug capture channel.
    pub fn state_value(&self) -> f32 {
        match self.state {
            DecoderState::Idle => 0.0,
            DecoderState::Listen => 0.25,
            DecoderState::Locked(TechType::NfcA) => 0.5,
            DecoderState::Locked(TechType::NfcB) => 0.625,
            DecoderState::Locked(TechType::NfcF) => 0.75,
            DecoderState::Locked(TechType::NfcV) => 0.875,
        }
    }

    fn poll_detectors(&mut self, only: Option<TechType>) -> Option<NfcFrame> {
        let run = |tech: TechType| only.is_none() || only == Some(tech);
        if run(TechType::NfcA) {
            if let Some(detector) = self.nfca.as_mut() {
                if let Some(frame) = detector.detect(&self.status) {
                    return Some(frame);
                }
            }
        }
        if run(TechType::NfcB) {
            if let Some(detector) = self.nfcb.as_mut() {
                if let Some(frame) = detector.detect(&self.status) {
                    return Some(frame);
                }
            }
        }
        if run(TechType::NfcF) {
            if let Some(detector) = self.nfcf.as_mut() {
                if let Some(frame) = detector.detect(&self.status) {
                    return Some(frame);
                }
            }
        }
        if run(TechType::NfcV) {
            if let Some(detector) = self.nfcv.as_mut() {
                if let Some(frame) = detector.detect(&self.status) {
                    return Some(frame);
                }
            }
        }
        None
    }

    fn locked_tech(&self) -> Option<TechType> {
        if self.nfca.as_ref().is_some_and(|d| d.is_locked()) {
            Some(TechType::NfcA)
        } else if self.nfcb.as_ref().is_some_and(|d| d.is_locked()) {
            Some(TechType::NfcB)
        } else if self.nfcf.as_ref().is_some_and(|d| d.is_locked()) {
            Some(TechType::NfcF)
        } else if self.nfcv.as_ref().is_some_and(|d| d.is_locked()) {
            Some(TechType::NfcV)
        } else {
            None
        }
    }

    fn tech_locked(&self, tech: TechType) -> bool {
        match tech {
            TechType::NfcA => self.nfca.as_ref().is_some_and(|d| d.is_locked()),
            TechType::NfcB => self.nfcb.as_ref().is_some_and(|d| d.is_locked()),
            TechType::NfcF => self.nfcf.as_ref().is_some_and(|d| d.is_locked()),
            TechType::NfcV => self.nfcv.as_ref().is_some_and(|d| d.is_locked()),
        }
    }

    fn arm_all(&mut self) {
        if let Some(detector) = self.nfca.as_mut() {
            detector.power_on(&self.status);
        }
        if let Some(detector) = self.nfcb.as_mut() {
            detector.power_on(&self.status);
        }
        if let Some(detector) = self.nfcf.as_mut() {
            detector.power_on(&self.status);
        }
        if let Some(detector) = self.nfcv.as_mut() {
            detector.power_on(&self.status);
        }
    }

    fn disarm_all(&mut self) {
        if let Some(detector) = self.nfca.as_mut() {
            detector.power_off();
        }
        if let Some(detector) = self.nfcb.as_mut() {
            detector.power_off();
        }
        if let Some(detector) = self.nfcf.as_mut() {
            detector.power_off();
        }
        if let Some(detector) = self.nfcv.as_mut() {
            detector.power_off();
        }
    }

    fn disarm_others(&mut self, winner: TechType) {
        if winner != TechType::NfcA {
            if let Some(detector) = self.nfca.as_mut() {
                detector.power_off();
            }
        }
        if winner != TechType::NfcB {
            if let Some(detector) = self.nfcb.as_mut() {
                detector.power_off();
            }
        }
        if winner != TechType::NfcF {
            if let Some(detector) = self.nfcf.as_mut() {
                detector.power_off();
            }
        }
        if winner != TechType::NfcV {
            if let Some(detector) = self.nfcv.as_mut() {
                detector.power_off();
            }
        }
    }

    /// Stamp direction from the guard windows of the previous frame and open
    /// the windows for the next one.
    fn finish(&mut self, mut frame: NfcFrame) -> NfcFrame {
        if self.frame_status.frame_end != 0 {
            if (frame.frame_start.wrapping_sub(self.frame_status.guard_end) as i32) < 0 {
                frame.direction = Direction::Invalid;
            } else if (frame.frame_start.wrapping_sub(self.frame_status.waiting_end) as i32) < 0
            {
                frame.direction = Direction::Res;
            }
            // past the waiting window a request-coded frame stays a request,
            // a response-coded frame is never promoted
        }

        let stu = self.status.signal_params.sample_time_unit;
        let in_samples = |fc_units: u32| (fc_units as f64 * stu).round() as u32;
        let (fdt, fwt) = match frame.tech_type {
            TechType::NfcA => (NFCA_FDT_DEF, NFCA_FWT_DEF),
            TechType::NfcB => (NFCB_FDT_DEF, NFCB_FWT_DEF),
            TechType::NfcF => (NFCF_FDT_DEF, NFCF_FWT_DEF),
            TechType::NfcV => (NFCV_FDT_DEF, NFCV_FWT_DEF),
        };
        self.frame_status.frame_guard_time = in_samples(fdt);
        self.frame_status.frame_waiting_time = in_samples(fwt);
        self.frame_status.start_up_guard_time = in_samples(fwt);
        self.frame_status.request_guard_time = in_samples(NFCA_RGT_DEF);
        self.frame_status.frame_start = frame.frame_start;
        self.frame_status.frame_end = frame.frame_end;
        self.frame_status.guard_end =
            frame.frame_end.wrapping_add(self.frame_status.frame_guard_time);
        self.frame_status.waiting_end =
            frame.frame_end.wrapping_add(self.frame_status.frame_waiting_time);
        self.frame_status.symbol_rate = frame.rate_type.symbols_per_second();
        self.frame_status.last_command = frame.payload().first().copied().unwrap_or(0) as u32;
        self.frame_status.frame_type = frame.has_flag(FLAG_SHORT_FRAME) as u32;
        frame
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{
        Direction, RateType, TechType, FLAG_CRC_OK, FLAG_PARITY_OK, FLAG_SHORT_FRAME,
    };
    use crate::testsig::{self, WaveBuilder, ETU};

    const SETTLE: usize = 2000;

    fn decode_all(wave: &[f32]) -> Vec<NfcFrame> {
        let mut decoder = NfcDecoder::new(&DecoderConfig::default());
        wave.iter().filter_map(|s| decoder.decode(*s)).collect()
    }

    #[test]
    fn reqa_short_frame() {
        let mut builder = WaveBuilder::new(SETTLE);
        // 0x26, seven bits LSB first
        testsig::miller_request(&mut builder, SETTLE as f64, &[0, 1, 1, 0, 0, 1, 0]);
        let frames = decode_all(&builder.finish(2000));
        assert_eq!(frames.len(), 1);
        let frame = &frames[0];
        assert_eq!(frame.tech_type, TechType::NfcA);
        assert_eq!(frame.direction, Direction::Req);
        assert_eq!(frame.payload(), &[0x26]);
        assert!(frame.has_flag(FLAG_SHORT_FRAME));
        assert!(frame.frame_start >= SETTLE as u32);
    }

    /// Additive noise around 20 dB SNR must not disturb the Miller decode.
    #[test]
    fn reqa_survives_channel_noise() {
        let mut builder = WaveBuilder::new(SETTLE);
        testsig::miller_request(&mut builder, SETTLE as f64, &[0, 1, 1, 0, 0, 1, 0]);
        let mut wave = builder.finish(2000);
        let mut state = 0x2545_F491u32;
        for sample in wave.iter_mut() {
            // xorshift, uniform in -0.15..0.15
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            *sample += (state as f32 / u32::MAX as f32 - 0.5) * 0.3;
        }
        let frames = decode_all(&wave);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload(), &[0x26]);
        assert!(frames[0].has_flag(FLAG_SHORT_FRAME));
    }

    #[test]
    fn atqa_response_with_parity() {
        let mut builder = WaveBuilder::new(SETTLE);
        testsig::manchester_response(&mut builder, SETTLE as f64, &[0x44, 0x00]);
        let frames = decode_all(&builder.finish(2000));
        assert_eq!(frames.len(), 1);
        let frame = &frames[0];
        assert_eq!(frame.tech_type, TechType::NfcA);
        assert_eq!(frame.direction, Direction::Res);
        assert_eq!(frame.payload(), &[0x44, 0x00]);
        assert!(frame.has_flag(FLAG_PARITY_OK));
    }

    #[test]
    fn atqa_parity_violation_truncates() {
        let mut builder = WaveBuilder::new(SETTLE);
        let mut bits = vec![1u8];
        bits.extend(testsig::odd_parity_bits(&[0x44, 0x00]));
        bits[9] ^= 1; // break the parity of the first byte
        testsig::manchester_response_raw(&mut builder, SETTLE as f64, &bits);
        let frames = decode_all(&builder.finish(2000));
        assert!(!frames.is_empty());
        let frame = &frames[0];
        assert_eq!(frame.tech_type, TechType::NfcA);
        assert!(!frame.has_flag(FLAG_PARITY_OK));
    }

    #[test]
    fn reqb_with_crc() {
        let payload = testsig::with_crc_b(&[0x05, 0x00, 0x00]);
        let mut builder = WaveBuilder::new(SETTLE);
        testsig::nfcb_request(&mut builder, SETTLE as f64, &payload);
        let frames = decode_all(&builder.finish(2000));
        assert_eq!(frames.len(), 1);
        let frame = &frames[0];
        assert_eq!(frame.tech_type, TechType::NfcB);
        assert_eq!(frame.direction, Direction::Req);
        assert_eq!(frame.payload(), payload.as_slice());
        assert!(frame.has_flag(FLAG_CRC_OK));
        assert!(frame.has_flag(FLAG_PARITY_OK));
    }

    #[test]
    fn reqb_corrupted_crc() {
        let mut payload = testsig::with_crc_b(&[0x05, 0x00, 0x00]);
        payload[4] ^= 0x01;
        let mut builder = WaveBuilder::new(SETTLE);
        testsig::nfcb_request(&mut builder, SETTLE as f64, &payload);
        let frames = decode_all(&builder.finish(2000));
        assert_eq!(frames.len(), 1);
        let frame = &frames[0];
        assert_eq!(frame.tech_type, TechType::NfcB);
        assert_eq!(frame.payload(), payload.as_slice());
        assert!(!frame.has_flag(FLAG_CRC_OK));
    }

    #[test]
    fn nfcf_polling_frame() {
        let payload = testsig::with_crc_f(&[0x06, 0x00, 0xFF, 0xFF, 0x01, 0x00]);
        let mut builder = WaveBuilder::new(SETTLE);
        testsig::nfcf_frame(&mut builder, SETTLE as f64, ETU / 2.0, &payload);
        let frames = decode_all(&builder.finish(2000));
        assert_eq!(frames.len(), 1);
        let frame = &frames[0];
        assert_eq!(frame.tech_type, TechType::NfcF);
        assert_eq!(frame.rate_type, RateType::R212);
        assert_eq!(frame.direction, Direction::Req);
        assert_eq!(frame.payload(), payload.as_slice());
        assert!(frame.has_flag(FLAG_CRC_OK));
    }

    #[test]
    fn nfcf_polling_frame_424() {
        let payload = testsig::with_crc_f(&[0x06, 0x00, 0xFF, 0xFF, 0x01, 0x00]);
        let mut builder = WaveBuilder::new(SETTLE);
        testsig::nfcf_frame(&mut builder, SETTLE as f64, ETU / 4.0, &payload);
        let frames = decode_all(&builder.finish(2000));
        assert_eq!(frames.len(), 1);
        let frame = &frames[0];
        assert_eq!(frame.tech_type, TechType::NfcF);
        assert_eq!(frame.rate_type, RateType::R424);
        assert_eq!(frame.payload(), payload.as_slice());
        assert!(frame.has_flag(FLAG_CRC_OK));
    }

    #[test]
    fn nfcv_inventory_1_of_256() {
        let payload = testsig::with_crc_v(&[0x26, 0x01, 0x00]);
        let mut builder = WaveBuilder::new(SETTLE);
        testsig::nfcv_request(&mut builder, SETTLE as f64, 8, &payload);
        let frames = decode_all(&builder.finish(120_000));
        assert_eq!(frames.len(), 1);
        let frame = &frames[0];
        assert_eq!(frame.tech_type, TechType::NfcV);
        assert_eq!(frame.rate_type, RateType::R26);
        assert_eq!(frame.direction, Direction::Req);
        assert_eq!(frame.payload(), payload.as_slice());
        assert!(frame.has_flag(FLAG_CRC_OK));
    }

    #[test]
    fn nfcv_frame_1_of_4() {
        let payload = testsig::with_crc_v(&[0x26, 0x01, 0x00]);
        let mut builder = WaveBuilder::new(SETTLE);
        testsig::nfcv_request(&mut builder, SETTLE as f64, 2, &payload);
        let frames = decode_all(&builder.finish(5000));
        assert_eq!(frames.len(), 1);
        let frame = &frames[0];
        assert_eq!(frame.tech_type, TechType::NfcV);
        assert_eq!(frame.payload(), payload.as_slice());
        assert!(frame.has_flag(FLAG_CRC_OK));
    }

    #[test]
    fn short_carrier_produces_nothing() {
        let mut builder = WaveBuilder::new(50);
        builder.silence(3000);
        let wave = builder.finish(0);
        let mut decoder = NfcDecoder::new(&DecoderConfig::default());
        let frames: Vec<NfcFrame> = wave.iter().filter_map(|s| decoder.decode(*s)).collect();
        assert!(frames.is_empty());
        assert!(!decoder.carrier_detect());
    }

    #[test]
    fn frames_at_exactly_fdt_tag_response() {
        let bits = [0u8, 1, 1, 0, 0, 1, 0];
        let mut builder = WaveBuilder::new(SETTLE);
        testsig::miller_request(&mut builder, SETTLE as f64, &bits);
        let first = decode_all(&builder.finish(2000));
        assert_eq!(first.len(), 1);

        let stu = testsig::SAMPLE_RATE as f64 / crate::protocol::NFC_FC;
        let fdt = (crate::protocol::NFCA_FDT_DEF as f64 * stu).round();
        let second_start = first[0].frame_end as f64 + fdt;
        let mut builder = WaveBuilder::new(SETTLE);
        testsig::miller_request(&mut builder, SETTLE as f64, &bits);
        testsig::miller_request(&mut builder, second_start, &bits);
        let frames = decode_all(&builder.finish(2000));
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].direction, Direction::Req);
        assert_eq!(frames[1].direction, Direction::Res);
        assert_eq!(frames[1].payload(), &[0x26]);
    }

    #[test]
    fn frame_inside_guard_window_is_invalid() {
        let bits = [0u8, 1, 1, 0, 0, 1, 0];
        let mut builder = WaveBuilder::new(SETTLE);
        testsig::miller_request(&mut builder, SETTLE as f64, &bits);
        let first = decode_all(&builder.finish(2000));
        assert_eq!(first.len(), 1);

        let second_start = first[0].frame_end as f64 + 400.0;
        let mut builder = WaveBuilder::new(SETTLE);
        testsig::miller_request(&mut builder, SETTLE as f64, &bits);
        testsig::miller_request(&mut builder, second_start, &bits);
        let frames = decode_all(&builder.finish(2000));
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1].direction, Direction::Invalid);
    }

    #[test]
    fn decoding_twice_is_identical() {
        let payload = testsig::with_crc_b(&[0x05, 0x00, 0x00]);
        let mut builder = WaveBuilder::new(SETTLE);
        testsig::nfcb_request(&mut builder, SETTLE as f64, &payload);
        let wave = builder.finish(2000);
        assert_eq!(decode_all(&wave), decode_all(&wave));
    }

    #[test]
    fn disabled_technologies_stay_silent() {
        let payload = testsig::with_crc_b(&[0x05, 0x00, 0x00]);
        let mut builder = WaveBuilder::new(SETTLE);
        testsig::nfcb_request(&mut builder, SETTLE as f64, &payload);
        let wave = builder.finish(2000);
        let config = DecoderConfig {
            enabled: TechSet {
                nfcb: false,
                ..TechSet::default()
            },
            ..DecoderConfig::default()
        };
        let mut decoder = NfcDecoder::new(&config);
        let frames: Vec<NfcFrame> = wave.iter().filter_map(|s| decoder.decode(*s)).collect();
        assert!(frames.is_empty());
    }
}
