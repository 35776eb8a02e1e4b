//! Synthetic waveform builders for the decoder tests: envelope-level
//! renditions of the four modulation schemes at 10 MS/s.

use crate::crc;
use crate::protocol::NFC_FC;

pub const SAMPLE_RATE: u32 = 10_000_000;
/// Samples per elementary time unit.
pub const ETU: f64 = SAMPLE_RATE as f64 * 128.0 / NFC_FC;

pub struct WaveBuilder {
    samples: Vec<f32>,
}

impl WaveBuilder {
    /// Start with enough unmodulated carrier for the frontend to settle.
    pub fn new(settle: usize) -> Self {
        let mut builder = Self { samples: Vec::new() };
        builder.carrier(settle);
        builder
    }

    pub fn carrier(&mut self, count: usize) {
        for _ in 0..count {
            self.samples.push(1.0);
        }
    }

    pub fn silence(&mut self, count: usize) {
        for _ in 0..count {
            self.samples.push(0.0);
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    fn fill_to(&mut self, end: usize, value: f32) {
        while self.samples.len() < end {
            self.samples.push(value);
        }
    }

    /// Drop the carrier to `value` over `[from, to)`, filling any gap before
    /// `from` with full carrier.
    pub fn modulate(&mut self, from: f64, to: f64, value: f32) {
        let from = from.round() as usize;
        let to = to.round() as usize;
        self.fill_to(from, 1.0);
        self.fill_to(to, value);
    }

    /// Load-modulation subcarrier burst at fc/16: +-10% square ripple.
    pub fn subcarrier(&mut self, from: f64, to: f64) {
        let period = SAMPLE_RATE as f64 * 16.0 / NFC_FC;
        let from = from.round() as usize;
        let to = to.round() as usize;
        self.fill_to(from, 1.0);
        while self.samples.len() < to {
            let phase = (self.samples.len() as f64 / period).fract();
            self.samples.push(if phase < 0.5 { 1.1 } else { 0.9 });
        }
    }

    pub fn finish(mut self, tail: usize) -> Vec<f32> {
        self.carrier(tail);
        self.samples
    }
}

/// LSB-first data bits with one odd-parity bit per byte.
pub fn odd_parity_bits(bytes: &[u8]) -> Vec<u8> {
    let mut bits = Vec::new();
    for &byte in bytes {
        for k in 0..8 {
            bits.push((byte >> k) & 1);
        }
        bits.push(if byte.count_ones() % 2 == 0 { 1 } else { 0 });
    }
    bits
}

/// Modified Miller request: SOF pause, data bits, end-of-communication zero
/// and silence. Returns the position after the trailing silence.
pub fn miller_request(builder: &mut WaveBuilder, start: f64, bits: &[u8]) -> f64 {
    let t = ETU;
    let q = t / 4.0;
    let h = t / 2.0;
    let mut pos = start;
    // start of communication: Z
    builder.modulate(pos, pos + q, 0.0);
    pos += t;
    let mut prev_one = false;
    for &bit in bits {
        if bit == 1 {
            // X: pause in the second half
            builder.modulate(pos + h, pos + h + q, 0.0);
            prev_one = true;
        } else if prev_one {
            // Y after a one
            prev_one = false;
        } else {
            // Z after a zero or the SOC
            builder.modulate(pos, pos + q, 0.0);
        }
        pos += t;
    }
    // end of communication: one more logic zero, then silence
    if !prev_one {
        builder.modulate(pos, pos + q, 0.0);
    }
    pos + 3.0 * t
}

/// Manchester subcarrier response from raw bits (SOF bit included).
pub fn manchester_response_raw(builder: &mut WaveBuilder, start: f64, bits: &[u8]) -> f64 {
    let t = ETU;
    let h = t / 2.0;
    let mut pos = start;
    for &bit in bits {
        if bit == 1 {
            builder.subcarrier(pos, pos + h);
        } else {
            builder.subcarrier(pos + h, pos + t);
        }
        pos += t;
    }
    pos + 2.0 * t
}

/// Manchester subcarrier response: SOF '1' plus parity-framed bytes.
pub fn manchester_response(builder: &mut WaveBuilder, start: f64, bytes: &[u8]) -> f64 {
    let mut bits = vec![1u8];
    bits.extend(odd_parity_bits(bytes));
    manchester_response_raw(builder, start, &bits)
}

/// NFC-B NRZ request: SOF low run, high run, parity-framed bytes, EOF low.
pub fn nfcb_request(builder: &mut WaveBuilder, start: f64, bytes: &[u8]) -> f64 {
    let t = ETU;
    let low = 0.9;
    let mut pos = start;
    builder.modulate(pos, pos + 10.5 * t, low);
    pos += 12.5 * t;
    for bit in odd_parity_bits(bytes) {
        if bit == 0 {
            builder.modulate(pos, pos + t, low);
        }
        pos += t;
    }
    builder.modulate(pos, pos + 10.5 * t, low);
    pos + 10.5 * t
}

/// NFC-F Manchester frame: 48 zero preamble bits, the 0xB24D sync word and
/// the payload, MSB first. `bit_time` selects 212 (ETU/2) or 424 (ETU/4).
pub fn nfcf_frame(builder: &mut WaveBuilder, start: f64, bit_time: f64, payload: &[u8]) -> f64 {
    let h = bit_time / 2.0;
    let low = 0.9;
    let mut bits = vec![0u8; 48];
    for &byte in [0xB2u8, 0x4D].iter().chain(payload.iter()) {
        for k in (0..8).rev() {
            bits.push((byte >> k) & 1);
        }
    }
    let mut pos = start;
    for bit in bits {
        if bit == 1 {
            builder.modulate(pos, pos + h, low);
        } else {
            builder.modulate(pos + h, pos + bit_time, low);
        }
        pos += bit_time;
    }
    pos
}

/// NFC-V pulse position request: SOF pulse pair, one pulse per symbol, EOF.
/// `bits` selects the coding (2 for 1-of-4, 8 for 1-of-256).
pub fn nfcv_request(builder: &mut WaveBuilder, start: f64, bits: u32, bytes: &[u8]) -> f64 {
    let e = ETU;
    let mut pos = start;
    builder.modulate(pos, pos + e, 0.0);
    if bits == 2 {
        builder.modulate(pos + 2.0 * e, pos + 3.0 * e, 0.0);
        pos += 4.0 * e;
    } else {
        builder.modulate(pos + 4.0 * e, pos + 5.0 * e, 0.0);
        pos += 8.0 * e;
    }
    for &byte in bytes {
        if bits == 2 {
            for k in 0..4 {
                let v = ((byte >> (2 * k)) & 0x3) as f64;
                builder.modulate(pos + (2.0 * v + 1.0) * e, pos + (2.0 * v + 2.0) * e, 0.0);
                pos += 8.0 * e;
            }
        } else {
            let v = byte as f64;
            builder.modulate(pos + (2.0 * v + 1.0) * e, pos + (2.0 * v + 2.0) * e, 0.0);
            pos += 512.0 * e;
        }
    }
    builder.modulate(pos + e, pos + 2.0 * e, 0.0);
    pos + 3.0 * e
}

pub fn with_crc_b(payload: &[u8]) -> Vec<u8> {
    let crc = crc::nfcb_crc(payload);
    let mut framed = payload.to_vec();
    framed.push((crc & 0xFF) as u8);
    framed.push((crc >> 8) as u8);
    framed
}

pub fn with_crc_f(payload: &[u8]) -> Vec<u8> {
    let crc = crc::nfcf_crc(payload);
    let mut framed = payload.to_vec();
    framed.push((crc >> 8) as u8);
    framed.push((crc & 0xFF) as u8);
    framed
}

pub fn with_crc_v(payload: &[u8]) -> Vec<u8> {
    let crc = crc::nfcv_crc(payload);
    let mut framed = payload.to_vec();
    framed.push((crc & 0xFF) as u8);
    framed.push((crc >> 8) as u8);
    framed
}
