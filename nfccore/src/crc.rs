//! Frame check sequences for the four NFC technologies.
//!
//! NFC-A and NFC-B use the reflected 0x1021 polynomial with different seeds,
//! NFC-F uses plain XMODEM with a big-endian trailer, NFC-V complements the
//! register (CRC-16/X-25) with a little-endian trailer.

pub const NFCA_ALG: crc::Algorithm<u16> = crc::Algorithm {
    width: 16,
    poly: 0x1021,
    init: 0x6363,
    refin: true,
    refout: true,
    xorout: 0x0000,
    check: 0xBF05,
    residue: 0x0000,
};

pub const NFCB_ALG: crc::Algorithm<u16> = crc::Algorithm {
    width: 16,
    poly: 0x1021,
    init: 0xFFFF,
    refin: true,
    refout: true,
    xorout: 0x0000,
    check: 0x6F91,
    residue: 0x0000,
};

pub const NFCF_ALG: crc::Algorithm<u16> = crc::Algorithm {
    width: 16,
    poly: 0x1021,
    init: 0x0000,
    refin: false,
    refout: false,
    xorout: 0x0000,
    check: 0x31C3,
    residue: 0x0000,
};

pub const NFCV_ALG: crc::Algorithm<u16> = crc::Algorithm {
    width: 16,
    poly: 0x1021,
    init: 0xFFFF,
    refin: true,
    refout: true,
    xorout: 0xFFFF,
    check: 0x906E,
    residue: 0xF0B8,
};

fn compute(alg: &'static crc::Algorithm<u16>, input: &[u8]) -> u16 {
    let crc = crc::Crc::<u16>::new(alg);
    let mut digest = crc.digest();
    digest.update(input);
    digest.finalize()
}

pub fn nfca_crc(input: &[u8]) -> u16 {
    compute(&NFCA_ALG, input)
}

pub fn nfcb_crc(input: &[u8]) -> u16 {
    compute(&NFCB_ALG, input)
}

pub fn nfcf_crc(input: &[u8]) -> u16 {
    compute(&NFCF_ALG, input)
}

pub fn nfcv_crc(input: &[u8]) -> u16 {
    compute(&NFCV_ALG, input)
}

/// Check a little-endian CRC trailer (NFC-A, NFC-B, NFC-V).
fn check_le(frame: &[u8], crc: u16) -> bool {
    let n = frame.len();
    n >= 2 && frame[n - 2] == (crc & 0xFF) as u8 && frame[n - 1] == (crc >> 8) as u8
}

/// Verify the two trailing CRC bytes of an NFC-A frame.
pub fn check_nfca(frame: &[u8]) -> bool {
    frame.len() >= 3 && check_le(frame, nfca_crc(&frame[..frame.len() - 2]))
}

/// Verify the two trailing CRC bytes of an NFC-B frame.
pub fn check_nfcb(frame: &[u8]) -> bool {
    frame.len() >= 3 && check_le(frame, nfcb_crc(&frame[..frame.len() - 2]))
}

/// Verify the big-endian CRC trailer of an NFC-F frame.
pub fn check_nfcf(frame: &[u8]) -> bool {
    let n = frame.len();
    if n < 3 {
        return false;
    }
    let crc = nfcf_crc(&frame[..n - 2]);
    frame[n - 2] == (crc >> 8) as u8 && frame[n - 1] == (crc & 0xFF) as u8
}

/// Verify the complemented little-endian CRC trailer of an NFC-V frame.
pub fn check_nfcv(frame: &[u8]) -> bool {
    frame.len() >= 3 && check_le(frame, nfcv_crc(&frame[..frame.len() - 2]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc_check_vectors() {
        assert_eq!(nfca_crc("123456789".as_bytes()), 0xBF05);
        assert_eq!(nfcb_crc("123456789".as_bytes()), 0x6F91);
        assert_eq!(nfcf_crc("123456789".as_bytes()), 0x31C3);
        assert_eq!(nfcv_crc("123456789".as_bytes()), 0x906E);
    }

    #[test]
    fn trailer_roundtrip() {
        let payload = [0x05u8, 0x00, 0x00];
        let crc = nfcb_crc(&payload);
        let framed = [0x05u8, 0x00, 0x00, (crc & 0xFF) as u8, (crc >> 8) as u8];
        assert!(check_nfcb(&framed));

        let mut bad = framed;
        bad[4] ^= 0x01;
        assert!(!check_nfcb(&bad));
    }

    #[test]
    fn trailer_big_endian() {
        let payload = [0x06u8, 0x00, 0xFF, 0xFF, 0x01, 0x00];
        let crc = nfcf_crc(&payload);
        let mut framed = payload.to_vec();
        framed.push((crc >> 8) as u8);
        framed.push((crc & 0xFF) as u8);
        assert!(check_nfcf(&framed));
    }

    #[test]
    fn short_frames_never_pass() {
        assert!(!check_nfca(&[0x26]));
        assert!(!check_nfcv(&[]));
    }
}
