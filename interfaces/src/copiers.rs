//! Sample Format Copiers
//!
//! Converts between the device's 32-bit sample words (I in the high 16 bits,
//! Q in the low 16 bits) and host complex sample types.

use num_complex::{Complex, Complex32};

/// Full-scale magnitude of a 16-bit sample component
const FULL_SCALE: f32 = 32767.0;

/// Split one sample word into I and Q
#[inline]
pub fn item_to_complex_i16(item: u32) -> Complex<i16> {
    Complex::new((item >> 16) as u16 as i16, item as u16 as i16)
}

/// Pack I and Q into one sample word
#[inline]
pub fn complex_i16_to_item(sample: Complex<i16>) -> u32 {
    ((sample.re as u16 as u32) << 16) | sample.im as u16 as u32
}

/// Device words to complex 16-bit samples
pub fn copy_u2_16sc_to_host_16sc(items: &[u32], out: &mut Vec<Complex<i16>>) {
    out.extend(items.iter().map(|&item| item_to_complex_i16(item)));
}

/// Device words to complex float samples scaled to [-1.0, 1.0]
pub fn copy_u2_16sc_to_host_32fc(items: &[u32], out: &mut Vec<Complex32>) {
    out.extend(items.iter().map(|&item| {
        let s = item_to_complex_i16(item);
        Complex32::new(s.re as f32 / FULL_SCALE, s.im as f32 / FULL_SCALE)
    }));
}

/// Complex 16-bit samples to device words
pub fn copy_host_16sc_to_u2_16sc(samples: &[Complex<i16>]) -> Vec<u32> {
    samples.iter().map(|&s| complex_i16_to_item(s)).collect()
}

/// Complex float samples to device words, clipping outside [-1.0, 1.0]
pub fn copy_host_32fc_to_u2_16sc(samples: &[Complex32]) -> Vec<u32> {
    let quantize = |x: f32| (x * FULL_SCALE).round().clamp(-FULL_SCALE, FULL_SCALE) as i16;
    samples
        .iter()
        .map(|s| complex_i16_to_item(Complex::new(quantize(s.re), quantize(s.im))))
        .collect()
}
