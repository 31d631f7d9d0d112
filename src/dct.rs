//! The 8x8 transform stage: zigzag index mapping, quantization, and the
//! separable forward/inverse DCT-II.

use std::sync::OnceLock;

/// Maps a zigzag index to its natural (row-major) position in an 8x8 block.
///
/// Index 0 is the DC coefficient at (0, 0), index 63 is (7, 7); the
/// traversal walks the anti-diagonals, alternating direction. This exact
/// table is a wire-format contract.
pub const ZIGZAG_TO_NATURAL: [usize; 64] = [
    0, 1, 8, 16, 9, 2, 3, 10, //
    17, 24, 32, 25, 18, 11, 4, 5, //
    12, 19, 26, 33, 40, 48, 41, 34, //
    27, 20, 13, 6, 7, 14, 21, 28, //
    35, 42, 49, 56, 57, 50, 43, 36, //
    29, 22, 15, 23, 30, 37, 44, 51, //
    58, 59, 52, 45, 38, 31, 39, 46, //
    53, 60, 61, 54, 47, 55, 62, 63, //
];

/// Inverse of [`ZIGZAG_TO_NATURAL`].
pub const NATURAL_TO_ZIGZAG: [usize; 64] = {
    let mut t = [0usize; 64];
    let mut z = 0;
    while z < 64 {
        t[ZIGZAG_TO_NATURAL[z]] = z;
        z += 1;
    }
    t
};

/// A quantization table: 64 entries addressed by zigzag index, as carried
/// by a DQT segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuantTable {
    pub values: [u16; 64],
}

impl QuantTable {
    /// Builds a table from values already in zigzag (wire) order.
    pub fn new(values: [u16; 64]) -> Self {
        Self { values }
    }

    /// Builds a table from values in natural (row-major) order.
    pub fn from_natural(natural: &[u16; 64]) -> Self {
        let mut values = [0u16; 64];
        for (z, v) in values.iter_mut().enumerate() {
            *v = natural[ZIGZAG_TO_NATURAL[z]];
        }
        Self { values }
    }

    /// A table with every entry equal to `q`. `flat(1)` makes the
    /// transform stage near-lossless.
    pub fn flat(q: u16) -> Self {
        Self { values: [q; 64] }
    }
}

/// Orthonormal DCT basis: `BASIS[n][k] = a(k) * cos((2n+1) * k * PI / 16)`.
/// Applying it along rows and then columns matches the frame process
/// normalization exactly.
fn basis() -> &'static [[f32; 8]; 8] {
    static BASIS: OnceLock<[[f32; 8]; 8]> = OnceLock::new();
    BASIS.get_or_init(|| {
        let mut b = [[0f32; 8]; 8];
        for (n, row) in b.iter_mut().enumerate() {
            for (k, v) in row.iter_mut().enumerate() {
                let a = if k == 0 { 0.125f64 } else { 0.25f64 }.sqrt();
                *v = (a * ((2 * n + 1) as f64 * k as f64 * std::f64::consts::PI / 16.0).cos())
                    as f32;
            }
        }
        b
    })
}

/// Forward transform of one block: level shift, separable DCT-II, then
/// quantization into zigzag order.
///
/// Quantization divides each coefficient by its table entry and rounds to
/// nearest with ties away from zero.
pub fn forward(samples: &[u8; 64], table: &QuantTable) -> [i16; 64] {
    let b = basis();

    // Row pass over the level-shifted samples.
    let mut tmp = [0f32; 64];
    for r in 0..8 {
        let mut row = [0f32; 8];
        for (c, v) in row.iter_mut().enumerate() {
            *v = f32::from(samples[r * 8 + c]) - 128.0;
        }
        for k in 0..8 {
            let mut s = 0.0;
            for (n, v) in row.iter().enumerate() {
                s += v * b[n][k];
            }
            tmp[r * 8 + k] = s;
        }
    }

    // Column pass.
    let mut coef = [0f32; 64];
    for c in 0..8 {
        for k in 0..8 {
            let mut s = 0.0;
            for n in 0..8 {
                s += tmp[n * 8 + c] * b[n][k];
            }
            coef[k * 8 + c] = s;
        }
    }

    let mut out = [0i16; 64];
    for (z, v) in out.iter_mut().enumerate() {
        // f32::round is round-half-away-from-zero, which is the required
        // tie-breaking rule.
        *v = (coef[ZIGZAG_TO_NATURAL[z]] / f32::from(table.values[z])).round() as i16;
    }
    out
}

/// Inverse transform of one zigzag-ordered block into natural-order
/// samples.
///
/// Dequantization is an exact integer multiply; only the final sample is
/// rounded and clamped to the 8-bit range.
pub fn inverse(block: &[i16; 64], table: &QuantTable) -> [u8; 64] {
    let b = basis();

    let mut coef = [0f32; 64];
    for z in 0..64 {
        coef[ZIGZAG_TO_NATURAL[z]] =
            (i32::from(block[z]) * i32::from(table.values[z])) as f32;
    }

    // Row pass: f[n] = sum_k F[k] * BASIS[n][k].
    let mut tmp = [0f32; 64];
    for r in 0..8 {
        for n in 0..8 {
            let mut s = 0.0;
            for k in 0..8 {
                s += coef[r * 8 + k] * b[n][k];
            }
            tmp[r * 8 + n] = s;
        }
    }

    // Column pass, level un-shift, clamp.
    let mut out = [0u8; 64];
    for c in 0..8 {
        for n in 0..8 {
            let mut s = 0.0;
            for k in 0..8 {
                s += tmp[k * 8 + c] * b[n][k];
            }
            out[n * 8 + c] = (s + 128.0).round().clamp(0.0, 255.0) as u8;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zigzag_is_a_bijection() {
        let mut seen = [false; 64];
        for &n in &ZIGZAG_TO_NATURAL {
            assert!(!seen[n]);
            seen[n] = true;
        }
        for (n, &z) in NATURAL_TO_ZIGZAG.iter().enumerate() {
            assert_eq!(ZIGZAG_TO_NATURAL[z], n);
        }
    }

    #[test]
    fn zigzag_anchors() {
        // (row, col) -> zigzag index, per the canonical traversal.
        let z = |row: usize, col: usize| NATURAL_TO_ZIGZAG[row * 8 + col];
        assert_eq!(z(0, 0), 0);
        assert_eq!(z(0, 1), 1);
        assert_eq!(z(1, 0), 2);
        assert_eq!(z(2, 0), 3);
        assert_eq!(z(1, 1), 4);
        assert_eq!(z(0, 2), 5);
        assert_eq!(z(7, 6), 62);
        assert_eq!(z(7, 7), 63);
    }

    #[test]
    fn uniform_block_is_dc_only() {
        let samples = [255u8; 64];
        let block = forward(&samples, &QuantTable::flat(1));
        assert_eq!(block[0], (255 - 128) * 8);
        assert_eq!(&block[1..], &[0i16; 63][..]);
        assert_eq!(inverse(&block, &QuantTable::flat(1)), samples);
    }

    #[test]
    fn roundtrip_with_flat_quantization() {
        let mut samples = [0u8; 64];
        for (i, s) in samples.iter_mut().enumerate() {
            *s = (i * 37 % 256) as u8;
        }
        let block = forward(&samples, &QuantTable::flat(1));
        let back = inverse(&block, &QuantTable::flat(1));
        for (a, b) in samples.iter().zip(&back) {
            assert!(a.abs_diff(*b) <= 1, "{a} vs {b}");
        }
    }

    #[test]
    fn from_natural_reorders() {
        let mut natural = [0u16; 64];
        for (i, v) in natural.iter_mut().enumerate() {
            *v = i as u16;
        }
        let table = QuantTable::from_natural(&natural);
        // Zigzag position 2 is natural position (1, 0) = index 8.
        assert_eq!(table.values[2], 8);
        assert_eq!(table.values[0], 0);
        assert_eq!(table.values[63], 63);
    }
}
