//! Common Utilities
//!
//! Provides utility functions used across the host engine and tools

/// Convert a byte slice to hex string for debugging
pub fn bytes_to_hex(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Hex dump of at most `limit` leading bytes, marking truncation
pub fn bytes_to_hex_prefix(data: &[u8], limit: usize) -> String {
    if data.len() <= limit {
        bytes_to_hex(data)
    } else {
        format!("{} ... (+{} bytes)", bytes_to_hex(&data[..limit]), data.len() - limit)
    }
}

/// Convert a gain in dB to the device's Q9.7 fixed-point encoding
pub fn gain_to_q7(gain_db: f64) -> i16 {
    (gain_db * 128.0)
        .round()
        .clamp(i16::MIN as f64, i16::MAX as f64) as i16
}

/// Convert a Q9.7 fixed-point gain back to dB
pub fn q7_to_gain(raw: i16) -> f64 {
    raw as f64 / 128.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bytes_to_hex() {
        let data = vec![0x12, 0x34, 0xAB, 0xCD];
        assert_eq!(bytes_to_hex(&data), "12 34 ab cd");
    }

    #[test]
    fn test_bytes_to_hex_prefix() {
        let data = [0u8, 1, 2, 3, 4, 5];
        assert_eq!(bytes_to_hex_prefix(&data, 8), "00 01 02 03 04 05");
        assert_eq!(bytes_to_hex_prefix(&data, 2), "00 01 ... (+4 bytes)");
    }

    #[test]
    fn test_gain_fixed_point() {
        assert_eq!(gain_to_q7(0.0), 0);
        assert_eq!(gain_to_q7(10.5), 1344);
        assert_eq!(gain_to_q7(-3.25), -416);
        assert_eq!(q7_to_gain(1344), 10.5);
        assert_eq!(gain_to_q7(1e6), i16::MAX);
    }
}
