//! CRC-64 (Jones polynomial, reflected) used to seal dump payloads.

use lazy_static::lazy_static;

const POLY: u64 = 0x95ac_9329_ac4b_c9b5;

lazy_static! {
    static ref TABLE: [u64; 256] = {
        let mut table = [0u64; 256];
        for (i, slot) in table.iter_mut().enumerate() {
            let mut crc = i as u64;
            for _ in 0..8 {
                crc = if crc & 1 == 1 { (crc >> 1) ^ POLY } else { crc >> 1 };
            }
            *slot = crc;
        }
        table
    };
}

#[inline]
pub fn crc64(crc: u64, data: &[u8]) -> u64 {
    data.iter().fold(crc, |crc, &byte| {
        TABLE[((crc ^ u64::from(byte)) & 0xff) as usize] ^ (crc >> 8)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_value() {
        assert_eq!(crc64(0, b"123456789"), 0xe9c6_d914_c4b8_d9ca);
    }

    #[test]
    fn test_incremental() {
        let whole = crc64(0, b"hello world");
        let split = crc64(crc64(0, b"hello "), b"world");
        assert_eq!(whole, split);
    }

    #[test]
    fn test_empty() {
        assert_eq!(crc64(0, b""), 0);
    }
}
