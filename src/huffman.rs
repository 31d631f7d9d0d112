//! Entropy coding primitives: amplitude extend/compact coding and canonical
//! Huffman tables with flat window-indexed lookup.

use core::fmt;

use crate::error::{Error, Result};

/// Symbol produced by [`HuffmanTable::decode`] for a bit window that matches
/// no codeword, together with a fixed 16-bit advance.
///
/// Deliberately lenient: deliberately malformed or padded streams decode to
/// this placeholder instead of failing, which keeps bit-exact compatibility
/// with streams that rely on it. Do not turn this into an error.
pub const UNDEFINED_SYMBOL: u8 = 0x00;

/// Whether a table codes DC amplitude classes or AC run/size symbols.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableClass {
    Dc,
    Ac,
}

/// Decodes a JPEG amplitude from its binade (bit count) and tail bits.
///
/// For `binade >= 1` and `tail` in `0..2^binade`, values with a leading 1 bit
/// are positive magnitudes and the rest map to the negative half of the
/// binade. `binade == 0` conventionally means "zero amplitude" and must be
/// special-cased by the caller; binades above 15 do not fit an `i16`.
pub fn extend(binade: u8, tail: u16) -> i16 {
    debug_assert!((1..=15).contains(&binade), "binade {binade} out of range");
    let half = 1i32 << (binade - 1);
    let tail = i32::from(tail);
    if tail >= half {
        tail as i16
    } else {
        (tail - (1i32 << binade) + 1) as i16
    }
}

/// Inverse of [`extend`] for nonzero amplitudes.
///
/// `i16::MIN` has no 15-bit representation and is left undefined (the
/// encoder never produces it because coefficients are differences of
/// 12-bit-range values).
pub fn compact(x: i16) -> (u8, u16) {
    debug_assert!(x != 0, "zero amplitude has no binade");
    debug_assert!(x != i16::MIN, "i16::MIN is not representable");
    let magnitude = x.unsigned_abs();
    let binade = (16 - magnitude.leading_zeros()) as u8;
    let mask = (1u16 << binade) - 1;
    // Negative amplitudes are stored in one's complement of the magnitude.
    let tail = if x > 0 { x as u16 } else { (x - 1) as u16 } & mask;
    (binade, tail)
}

/// A canonical Huffman table with derived encode and decode views.
///
/// Built once from the 16 bit-length bucket counts and the ordered symbol
/// list of a DHT segment (or an Annex K style table spec); immutable
/// afterwards. Decoding uses one or two flat lookup levels keyed by an 8-bit
/// and (only when any code is longer than 8 bits) a 16-bit window, so a
/// symbol decode is one or two array reads.
pub struct HuffmanTable {
    /// All codewords in canonical order. Kept for `Debug` dumps.
    codes: Vec<(u16, LookupResult)>,
    /// First decode level, indexed by the top 8 bits of the window.
    short: Box<[LookupResult; 256]>,
    /// Second decode level, indexed by the full 16-bit window. Empty when
    /// every code fits in 8 bits.
    long: Vec<LookupResult>,
    /// Encode view: symbol → (code, length). Length 0 marks an unregistered
    /// symbol.
    enc: Box<[(u16, u8); 256]>,
}

#[derive(Clone, Copy)]
struct LookupResult {
    /// Length of the huffman code in bits (number of bits that need to be
    /// consumed from the input). 0 marks an empty slot.
    bits: u8,
    /// Decoded value. Meaning depends on table class (AC/DC).
    value: u8,
}

impl LookupResult {
    const EMPTY: Self = Self { bits: 0, value: 0 };

    fn new(bits: u8, value: u8) -> Self {
        Self { bits, value }
    }
}

impl HuffmanTable {
    /// Builds a table from per-length code counts and the symbol values in
    /// code order.
    ///
    /// Codes are assigned canonically: shortest first, numerically
    /// increasing within a length (the `Generate_size_table` /
    /// `Generate_code_table` flowcharts in Annex C). Rejects tables that
    /// demand more codes at some length than the remaining code space
    /// allows, and tables with no symbols at all.
    pub fn build(num_codes_per_length: &[u8; 16], values: &[u8]) -> Result<Self> {
        let total: usize = num_codes_per_length.iter().map(|&n| usize::from(n)).sum();
        if total == 0 {
            return Err(Error::table("empty huffman table"));
        }
        if values.len() < total {
            return Err(Error::table(format!(
                "huffman table declares {} codes but provides {} symbols",
                total,
                values.len(),
            )));
        }

        let mut codes = Vec::with_capacity(total);
        let mut short = Box::new([LookupResult::EMPTY; 256]);
        let mut long = Vec::new();
        let mut enc = Box::new([(0u16, 0u8); 256]);

        let mut next_code: u32 = 0;
        let mut value_iter = values.iter();
        for (code_length, &code_count) in num_codes_per_length.iter().enumerate() {
            let code_length = (code_length + 1) as u8; // 1-based

            next_code <<= 1;
            if next_code + u32::from(code_count) > 1 << code_length {
                return Err(Error::table(format!(
                    "over-subscribed huffman table: {code_count} codes of length \
                     {code_length} exceed the remaining code space",
                )));
            }

            for _ in 0..code_count {
                let value = *value_iter.next().unwrap();
                let lookup = LookupResult::new(code_length, value);
                codes.push((next_code as u16, lookup));

                if code_length <= 8 {
                    // This code, left-aligned to 8 bits, owns every window
                    // sharing its prefix.
                    let base = (next_code << (8 - code_length)) as usize;
                    for slot in &mut short[base..base + (1 << (8 - code_length))] {
                        *slot = lookup;
                    }
                } else {
                    if long.is_empty() {
                        long.resize(1 << 16, LookupResult::EMPTY);
                    }
                    let base = (next_code << (16 - code_length)) as usize;
                    for slot in &mut long[base..base + (1 << (16 - code_length))] {
                        *slot = lookup;
                    }
                }

                enc[usize::from(value)] = (next_code as u16, code_length);
                next_code += 1;
            }
        }

        Ok(Self {
            codes,
            short,
            long,
            enc,
        })
    }

    /// Decodes one symbol from the next 16 bits of the stream.
    ///
    /// Returns the symbol and the number of bits consumed. A window that
    /// matches no codeword yields [`UNDEFINED_SYMBOL`] with a 16-bit
    /// advance (see its docs).
    pub fn decode(&self, window: u16) -> (u8, u8) {
        let hit = self.short[usize::from(window >> 8)];
        if hit.bits != 0 {
            return (hit.value, hit.bits);
        }
        if !self.long.is_empty() {
            let hit = self.long[usize::from(window)];
            if hit.bits != 0 {
                return (hit.value, hit.bits);
            }
        }
        (UNDEFINED_SYMBOL, 16)
    }

    /// Looks up the codeword for `symbol`.
    ///
    /// Fails only if `symbol` was never registered in this table.
    pub fn encode(&self, symbol: u8) -> Result<(u16, u8)> {
        match self.enc[usize::from(symbol)] {
            (_, 0) => Err(Error::table(format!(
                "symbol {symbol:#04x} has no code in this huffman table",
            ))),
            (code, length) => Ok((code, length)),
        }
    }
}

impl fmt::Debug for HuffmanTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for &(code, lookup) in &self.codes {
            let bits = lookup.bits;
            let value = lookup.value;
            writeln!(
                f,
                "{bits} {:01$b} -> {2:02x}",
                code,
                usize::from(bits),
                value,
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tables;

    #[test]
    fn tablegen() {
        // Default Luminance DC table.
        let num_dc_codes = [0, 1, 5, 1, 1, 1, 1, 1, 1, 0, 0, 0, 0, 0, 0, 0];
        let dc_values = [
            0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0a, 0x0b,
        ];

        let tbl = HuffmanTable::build(&num_dc_codes, &dc_values).unwrap();
        expect_test::expect![[r#"
            2 00 -> 00
            3 010 -> 01
            3 011 -> 02
            3 100 -> 03
            3 101 -> 04
            3 110 -> 05
            4 1110 -> 06
            5 11110 -> 07
            6 111110 -> 08
            7 1111110 -> 09
            8 11111110 -> 0a
            9 111111110 -> 0b

        "#]]
        .assert_debug_eq(&tbl);
    }

    #[test]
    fn extend_compact_roundtrip() {
        for x in i16::MIN + 1..=i16::MAX {
            if x == 0 {
                continue;
            }
            let (binade, tail) = compact(x);
            assert!(u32::from(tail) < 1 << binade);
            assert_eq!(extend(binade, tail), x, "round-trip failed for {x}");
        }
    }

    #[test]
    fn extend_edges() {
        assert_eq!(extend(1, 0), -1);
        assert_eq!(extend(1, 1), 1);
        assert_eq!(extend(3, 0), -7);
        assert_eq!(extend(3, 3), -4);
        assert_eq!(extend(3, 4), 4);
        assert_eq!(extend(3, 7), 7);
        assert_eq!(extend(15, 0), -32767);
        assert_eq!(extend(15, 0x7fff), 32767);
    }

    #[test]
    fn rejects_oversubscribed() {
        // 3 codes of length 1 cannot exist.
        let counts = {
            let mut c = [0u8; 16];
            c[0] = 3;
            c
        };
        HuffmanTable::build(&counts, &[1, 2, 3]).unwrap_err();

        // 2 codes of length 1 plus 1 of length 2: length 2 has no space left.
        let counts = {
            let mut c = [0u8; 16];
            c[0] = 2;
            c[1] = 1;
            c
        };
        HuffmanTable::build(&counts, &[1, 2, 3]).unwrap_err();
    }

    #[test]
    fn rejects_empty() {
        HuffmanTable::build(&[0; 16], &[]).unwrap_err();
    }

    #[test]
    fn undefined_codeword_is_lenient() {
        // Only code is "00"; the all-ones window matches nothing.
        let counts = {
            let mut c = [0u8; 16];
            c[1] = 1;
            c
        };
        let tbl = HuffmanTable::build(&counts, &[0x42]).unwrap();
        assert_eq!(tbl.decode(0xffff), (UNDEFINED_SYMBOL, 16));
        assert_eq!(tbl.decode(0x0000), (0x42, 2));
    }

    #[test]
    fn encode_unknown_symbol_fails() {
        let counts = {
            let mut c = [0u8; 16];
            c[1] = 1;
            c
        };
        let tbl = HuffmanTable::build(&counts, &[0x42]).unwrap();
        tbl.encode(0x42).unwrap();
        tbl.encode(0x43).unwrap_err();
    }

    #[test]
    fn annex_k_ac_luminance_codewords() {
        // The published codeword/symbol pairs at the head of the standard AC
        // luminance table, checked against windows formed by left-aligning
        // each codeword and padding with 1-bits.
        let spec = tables::LUMA_AC;
        let tbl = HuffmanTable::build(&spec.counts, spec.values).unwrap();

        let published: &[(u16, u8, u8)] = &[
            (0b00, 2, 0x01),
            (0b01, 2, 0x02),
            (0b100, 3, 0x03),
            (0b1010, 4, 0x00), // end-of-block
            (0b1011, 4, 0x04),
            (0b1100, 4, 0x11),
            (0b11010, 5, 0x05),
            (0b11011, 5, 0x12),
            (0b11100, 5, 0x21),
            (0b111010, 6, 0x31),
            (0b111011, 6, 0x41),
            (0b11111111001, 11, 0xf0), // zero-run-length
        ];
        for &(code, len, symbol) in published {
            let window = (code << (16 - len)) | ((1 << (16 - len)) - 1);
            assert_eq!(
                tbl.decode(window),
                (symbol, len),
                "codeword {code:0len$b}",
                len = usize::from(len),
            );
        }
    }

    #[test]
    fn two_level_lookup_roundtrip() {
        // The AC chrominance table has codes up to 16 bits, exercising the
        // second lookup level for every long symbol.
        let spec = tables::CHROMA_AC;
        let tbl = HuffmanTable::build(&spec.counts, spec.values).unwrap();
        for &symbol in spec.values {
            let (code, len) = tbl.encode(symbol).unwrap();
            let window = (code << (16 - len)) | ((1u32 << (16 - len)) - 1) as u16;
            assert_eq!(tbl.decode(window), (symbol, len));
        }
    }
}
