//! Precomputed timing tables: samples per symbol at several fractions plus
//! ring offsets, one table per candidate symbol rate, and the pulse slot
//! tables for NFC-V pulse position modulation.

use crate::protocol::{RateType, TechType, NFC_FC};
use crate::signal::{SignalParams, BUFFER_SIZE};

#[derive(Debug, Clone, Copy)]
pub struct BitrateParams {
    pub tech_type: TechType,
    pub rate_type: RateType,
    pub symbols_per_second: u32,
    /// Samples per double symbol.
    pub period0_symbol_samples: u32,
    /// Samples per full symbol.
    pub period1_symbol_samples: u32,
    /// Samples per half symbol.
    pub period2_symbol_samples: u32,
    /// Samples per quarter symbol.
    pub period4_symbol_samples: u32,
    /// Samples per eighth of a symbol.
    pub period8_symbol_samples: u32,
    /// Detection latency of this rate behind the physical signal.
    pub symbol_delay_detect: u32,
    /// Ring offsets: adding these to the clock (mod the ring size) reads the
    /// delayed slots without subtraction in the hot loop.
    pub offset_future_index: u32,
    pub offset_signal_index: u32,
    pub offset_delay0_index: u32,
    pub offset_delay1_index: u32,
    pub offset_delay2_index: u32,
    pub offset_delay4_index: u32,
    pub offset_delay8_index: u32,
    /// Protocol preamble lengths in samples.
    pub preamble1_samples: u32,
    pub preamble2_samples: u32,
}

impl BitrateParams {
    pub fn new(
        tech_type: TechType,
        rate_type: RateType,
        params: &SignalParams,
        symbol_delay_detect: u32,
    ) -> Self {
        let stu = params.sample_time_unit;
        let divider = rate_type.fc_divider();
        let etu = params.elementary_time_unit;

        let period = |cycles: u32| (stu * cycles as f64).round() as u32;
        let period0 = period(divider * 2);
        let period1 = period(divider);
        let period2 = period(divider / 2);
        let period4 = period(divider / 4);
        let period8 = period(divider / 8);

        let offset_signal_index = BUFFER_SIZE as u32 - symbol_delay_detect;

        let (preamble1_samples, preamble2_samples) = match tech_type {
            // SOF pattern Z, one full symbol
            TechType::NfcA => (period1, period0),
            // SOF: 10-11 ETU low then 2-3 ETU high
            TechType::NfcB => (10 * period1, 2 * period1),
            // 48-bit minimum preamble then the 16-bit sync word
            TechType::NfcF => (48 * period1, 16 * period1),
            // SOF pulse pair spans up to 8 ETU
            TechType::NfcV => (4 * etu, 8 * etu),
        };

        Self {
            tech_type,
            rate_type,
            symbols_per_second: (NFC_FC / divider as f64) as u32,
            period0_symbol_samples: period0,
            period1_symbol_samples: period1,
            period2_symbol_samples: period2,
            period4_symbol_samples: period4,
            period8_symbol_samples: period8,
            symbol_delay_detect,
            offset_future_index: offset_signal_index + period1,
            offset_signal_index,
            offset_delay0_index: offset_signal_index - period0,
            offset_delay1_index: offset_signal_index - period1,
            offset_delay2_index: offset_signal_index - period2,
            offset_delay4_index: offset_signal_index - period4,
            offset_delay8_index: offset_signal_index - period8,
            preamble1_samples,
            preamble2_samples,
        }
    }

    /// Clock of the delayed signal point this rate is inspecting.
    pub fn signal_time(&self, clock: u32) -> u32 {
        clock.wrapping_sub(self.symbol_delay_detect)
    }
}

/// One pulse position slot, in samples relative to the symbol start.
#[derive(Debug, Clone, Copy, Default)]
pub struct PulseSlot {
    pub start: u32,
    pub end: u32,
    pub value: u32,
}

/// Slot table for one NFC-V coding (2 bits for 1-of-4, 8 for 1-of-256).
pub struct PulseParams {
    /// Data bits per symbol.
    pub bits: u32,
    /// Samples per symbol.
    pub length: u32,
    /// Elementary time units per symbol.
    pub periods: u32,
    pub slots: [PulseSlot; 256],
}

impl PulseParams {
    pub fn new(bits: u32, params: &SignalParams) -> Self {
        let etu = params.sample_time_unit * 128.0;
        let count = 1u32 << bits;
        let periods = 2 * count;
        let mut slots = [PulseSlot::default(); 256];
        // slot v holds a pulse rising at (2v+1) ETU, window half an ETU wide
        // on each side
        for (v, slot) in slots.iter_mut().enumerate().take(count as usize) {
            slot.start = (etu * (2.0 * v as f64 + 0.5)).round() as u32;
            slot.end = (etu * (2.0 * v as f64 + 1.5)).round() as u32;
            slot.value = v as u32;
        }
        Self {
            bits,
            length: (etu * periods as f64).round() as u32,
            periods,
            slots,
        }
    }

    /// Slot whose window contains the given pulse offset.
    pub fn find(&self, offset: u32) -> Option<&PulseSlot> {
        let count = 1usize << self.bits;
        self.slots[..count]
            .iter()
            .find(|slot| offset >= slot.start && offset < slot.end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> SignalParams {
        SignalParams::new(10_000_000)
    }

    #[test]
    fn periods_at_10_msps() {
        let p = params();
        let a = BitrateParams::new(TechType::NfcA, RateType::R106, &p, 0);
        assert_eq!(a.period0_symbol_samples, 189);
        assert_eq!(a.period1_symbol_samples, 94);
        assert_eq!(a.period2_symbol_samples, 47);
        assert_eq!(a.period4_symbol_samples, 24);
        assert_eq!(a.period8_symbol_samples, 12);

        let f2 = BitrateParams::new(TechType::NfcF, RateType::R212, &p, 0);
        assert_eq!(f2.period1_symbol_samples, 47);
        assert_eq!(f2.period2_symbol_samples, 24);

        let f4 = BitrateParams::new(TechType::NfcF, RateType::R424, &p, 0);
        assert_eq!(f4.period1_symbol_samples, 24);
        assert_eq!(f4.period8_symbol_samples, 3);

        let v = BitrateParams::new(TechType::NfcV, RateType::R26, &p, 0);
        assert_eq!(v.period1_symbol_samples, 378);
    }

    #[test]
    fn offsets_wrap_the_ring() {
        let p = params();
        let a = BitrateParams::new(TechType::NfcA, RateType::R106, &p, 0);
        assert_eq!(a.offset_signal_index, 1024);
        assert_eq!(a.offset_delay2_index, 1024 - 47);
        // reading via offsets must stay inside one ring revolution
        assert!(a.period0_symbol_samples < BUFFER_SIZE as u32);
        let clock = 5000u32;
        let direct = (clock - a.period2_symbol_samples) as usize & (BUFFER_SIZE - 1);
        let offset = clock.wrapping_add(a.offset_delay2_index) as usize & (BUFFER_SIZE - 1);
        assert_eq!(direct, offset);
    }

    #[test]
    fn delayed_rate_inspects_the_past() {
        let p = params();
        let f4 = BitrateParams::new(TechType::NfcF, RateType::R424, &p, 47);
        assert_eq!(f4.signal_time(1000), 953);
        assert_eq!(f4.offset_signal_index, 1024 - 47);
        assert_eq!(f4.offset_future_index, 1024 - 47 + 24);
    }

    #[test]
    fn pulse_slot_tables() {
        let p = params();
        let one_of_four = PulseParams::new(2, &p);
        assert_eq!(one_of_four.periods, 8);
        assert_eq!(one_of_four.length, 755);
        assert_eq!(one_of_four.slots[0].start, 47);
        assert_eq!(one_of_four.slots[0].end, 142);

        let one_of_256 = PulseParams::new(8, &p);
        assert_eq!(one_of_256.periods, 512);
        assert_eq!(one_of_256.length, 48330);
        // nominal pulse position of every value falls inside its own slot
        for v in 0..256u32 {
            let nominal = (94.3953 * (2.0 * v as f64 + 1.0)).round() as u32;
            let slot = one_of_256.find(nominal).expect("slot");
            assert_eq!(slot.value, v);
        }
    }
}
