//! Immutable codec plans: the frame process, per-component sampling and
//! quantization assignments, and the ordered scan list.

use crate::error::{Error, Result};

/// Entropy-coding mode of the frame process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Sequential DCT, 8-bit samples, table keys 0-1.
    Baseline,
    /// Extended sequential DCT.
    Extended,
    /// Progressive DCT (spectral selection + successive approximation).
    Progressive,
}

/// Frame process: coding mode plus the (unsupported but wire-visible)
/// differential flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Process {
    pub mode: Mode,
    pub differential: bool,
}

impl Process {
    pub const BASELINE: Self = Self {
        mode: Mode::Baseline,
        differential: false,
    };
    pub const PROGRESSIVE: Self = Self {
        mode: Mode::Progressive,
        differential: false,
    };

    #[inline]
    pub fn is_progressive(&self) -> bool {
        self.mode == Mode::Progressive
    }
}

/// One frame component: stable key, sampling factor, quantization table
/// assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Component {
    /// Component identifier, unique within the frame. Scans refer to
    /// components by this key; the plane order is the declaration order.
    pub key: u8,
    /// Horizontal and vertical sampling factor (1-4 each).
    pub factor: (u8, u8),
    /// Quantization table key (0-3).
    pub quantization: u8,
}

/// A component's role in one scan, with its entropy table selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanComponent {
    pub key: u8,
    pub dc_table: u8,
    pub ac_table: u8,
}

/// Half-open range of zigzag indices coded by a scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Band {
    pub lo: u8,
    pub hi: u8,
}

impl Band {
    /// The full coefficient range of a sequential scan.
    pub const FULL: Self = Self { lo: 0, hi: 64 };
    /// The DC-only band of a progressive DC scan.
    pub const DC: Self = Self { lo: 0, hi: 1 };

    /// Whether the DC coefficient is part of this band.
    #[inline]
    pub fn includes_dc(&self) -> bool {
        self.lo == 0
    }

    #[inline]
    pub fn indices(&self) -> std::ops::Range<usize> {
        usize::from(self.lo)..usize::from(self.hi)
    }
}

/// Successive-approximation bit range of a scan.
///
/// `high == low` marks a first pass transmitting everything down to bit
/// `low`; a refinement pass has `high == low + 1` and transmits exactly
/// one more bit plane. (On the wire a first pass carries `Ah = 0`; the
/// translation happens at the scan-header boundary.)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bits {
    pub high: u8,
    pub low: u8,
}

impl Bits {
    /// Full precision in a single pass.
    pub const FULL: Self = Self { high: 0, low: 0 };

    #[inline]
    pub fn is_refinement(&self) -> bool {
        self.high > self.low
    }
}

/// One scan of the frame: participating components, spectral band, and
/// bit range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanDescriptor {
    pub components: Vec<ScanComponent>,
    pub band: Band,
    pub bits: Bits,
}

/// The immutable plan shared by encode and decode: process, components in
/// plane order, and the ordered scan list.
///
/// Hand-built (or via the [`Layout::baseline_ycbcr`]-style constructors)
/// for encoding; reconstructed from the frame and scan headers when
/// decoding.
#[derive(Debug, Clone)]
pub struct Layout {
    process: Process,
    precision: u8,
    components: Vec<Component>,
    scans: Vec<ScanDescriptor>,
}

impl Layout {
    pub fn new(
        process: Process,
        components: Vec<Component>,
        scans: Vec<ScanDescriptor>,
    ) -> Result<Self> {
        if process.differential {
            return Err(Error::header("differential frames are not supported"));
        }
        validate_components(&components)?;

        for scan in &scans {
            Self::validate_scan(process, &components, scan)?;
        }
        for c in &components {
            if !scans
                .iter()
                .any(|s| s.components.iter().any(|sc| sc.key == c.key))
            {
                return Err(Error::header(format!(
                    "component {} appears in no scan",
                    c.key,
                )));
            }
        }

        Ok(Self {
            process,
            precision: 8,
            components,
            scans,
        })
    }

    /// Builds a layout from stream-observed parts without requiring every
    /// component to be covered by a scan. A truncated progressive decode
    /// legitimately produces such layouts; the per-scan validation already
    /// happened as the scans arrived.
    pub(crate) fn from_stream(
        process: Process,
        components: Vec<Component>,
        scans: Vec<ScanDescriptor>,
    ) -> Self {
        Self {
            process,
            precision: 8,
            components,
            scans,
        }
    }

    /// Checks one scan against the process rules and the component set.
    /// Also used by the scan assembler for scans arriving from a stream.
    pub(crate) fn validate_scan(
        process: Process,
        components: &[Component],
        scan: &ScanDescriptor,
    ) -> Result<()> {
        if scan.components.is_empty() || scan.components.len() > 4 {
            return Err(Error::header(format!(
                "scan with {} components (1-4 are valid)",
                scan.components.len(),
            )));
        }
        for (i, sc) in scan.components.iter().enumerate() {
            if !components.iter().any(|c| c.key == sc.key) {
                return Err(Error::protocol(format!(
                    "scan references unknown component {}",
                    sc.key,
                )));
            }
            if scan.components[..i].iter().any(|o| o.key == sc.key) {
                return Err(Error::header(format!(
                    "component {} listed twice in one scan",
                    sc.key,
                )));
            }
            if sc.dc_table > 3 || sc.ac_table > 3 {
                return Err(Error::header(format!(
                    "invalid entropy table keys {}/{} (0-3 are valid)",
                    sc.dc_table, sc.ac_table,
                )));
            }
        }

        let (band, bits) = (scan.band, scan.bits);
        if band.lo >= band.hi || band.hi > 64 {
            return Err(Error::header(format!(
                "malformed spectral band [{}, {})",
                band.lo, band.hi,
            )));
        }
        if bits.low > bits.high {
            return Err(Error::header(format!(
                "malformed bit range (high {}, low {})",
                bits.high, bits.low,
            )));
        }
        if bits.is_refinement() && bits.high != bits.low + 1 {
            return Err(Error::header(format!(
                "refinement pass must transmit one bit plane (high {}, low {})",
                bits.high, bits.low,
            )));
        }

        if process.is_progressive() {
            if band.includes_dc() && band != Band::DC {
                return Err(Error::header(
                    "progressive DC scans must not carry AC coefficients",
                ));
            }
            if !band.includes_dc() && scan.components.len() != 1 {
                return Err(Error::header(
                    "progressive AC scans are limited to a single component",
                ));
            }
        } else if band != Band::FULL || bits != Bits::FULL {
            return Err(Error::header(
                "sequential scans must cover the full band at full precision",
            ));
        }
        Ok(())
    }

    #[inline]
    pub fn process(&self) -> Process {
        self.process
    }

    /// Sample precision in bits.
    #[inline]
    pub fn precision(&self) -> u8 {
        self.precision
    }

    /// Components in plane order (first-seen order of the frame header).
    #[inline]
    pub fn components(&self) -> &[Component] {
        &self.components
    }

    #[inline]
    pub fn scans(&self) -> &[ScanDescriptor] {
        &self.scans
    }

    pub fn component(&self, key: u8) -> Option<&Component> {
        self.components.iter().find(|c| c.key == key)
    }

    /// The stable index of a component's plane in every downstream
    /// container.
    pub fn plane_index(&self, key: u8) -> Option<usize> {
        self.components.iter().position(|c| c.key == key)
    }

    /// Aggregate subsampling factor: the maximum factor over all
    /// components, which determines the MCU grid.
    pub fn max_factor(&self) -> (u8, u8) {
        let h = self.components.iter().map(|c| c.factor.0).max().unwrap_or(1);
        let v = self.components.iter().map(|c| c.factor.1).max().unwrap_or(1);
        (h, v)
    }

    /// Single-component grayscale plan with one sequential scan.
    pub fn baseline_gray() -> Self {
        let components = vec![Component {
            key: 1,
            factor: (1, 1),
            quantization: 0,
        }];
        let scans = vec![ScanDescriptor {
            components: vec![ScanComponent {
                key: 1,
                dc_table: 0,
                ac_table: 0,
            }],
            band: Band::FULL,
            bits: Bits::FULL,
        }];
        Self::new(Process::BASELINE, components, scans).unwrap()
    }

    /// Three-component plan with luma sampling factor `(h, v)`, chroma at
    /// 1x1, and a single interleaved sequential scan.
    pub fn baseline_ycbcr(h: u8, v: u8) -> Result<Self> {
        let components = ycbcr_components(h, v);
        let scans = vec![ScanDescriptor {
            components: ycbcr_scan_components(),
            band: Band::FULL,
            bits: Bits::FULL,
        }];
        Self::new(Process::BASELINE, components, scans)
    }

    /// Three-component progressive plan with a spectral-selection +
    /// successive-approximation scan script in the style most encoders
    /// emit: a coarse DC pass, coarse luma/chroma AC bands, then
    /// refinement passes down to full precision.
    pub fn progressive_ycbcr(h: u8, v: u8) -> Result<Self> {
        let components = ycbcr_components(h, v);
        let luma = |band: Band, bits: Bits| ScanDescriptor {
            components: vec![ScanComponent {
                key: 1,
                dc_table: 0,
                ac_table: 0,
            }],
            band,
            bits,
        };
        let chroma = |key: u8, band: Band, bits: Bits| ScanDescriptor {
            components: vec![ScanComponent {
                key,
                dc_table: 1,
                ac_table: 1,
            }],
            band,
            bits,
        };
        let band = |lo, hi| Band { lo, hi };
        let bits = |high, low| Bits { high, low };

        let scans = vec![
            ScanDescriptor {
                components: ycbcr_scan_components(),
                band: Band::DC,
                bits: bits(1, 1),
            },
            luma(band(1, 6), bits(2, 2)),
            chroma(2, band(1, 64), bits(1, 1)),
            chroma(3, band(1, 64), bits(1, 1)),
            luma(band(6, 64), bits(2, 2)),
            luma(band(1, 64), bits(2, 1)),
            ScanDescriptor {
                components: ycbcr_scan_components(),
                band: Band::DC,
                bits: bits(1, 0),
            },
            chroma(2, band(1, 64), bits(1, 0)),
            chroma(3, band(1, 64), bits(1, 0)),
            luma(band(1, 64), bits(1, 0)),
        ];
        Self::new(Process::PROGRESSIVE, components, scans)
    }
}

/// Validates a component list: unique keys, sampling factors 1-4, and
/// quantization keys 0-3. Shared between hand-built layouts and frame
/// headers arriving from a stream.
pub(crate) fn validate_components(components: &[Component]) -> Result<()> {
    if components.is_empty() {
        return Err(Error::header("frame declares no components"));
    }
    for (i, c) in components.iter().enumerate() {
        if components[..i].iter().any(|other| other.key == c.key) {
            return Err(Error::header(format!("duplicate component key {}", c.key)));
        }
        let (h, v) = c.factor;
        if !(1..=4).contains(&h) || !(1..=4).contains(&v) {
            return Err(Error::header(format!(
                "invalid sampling factor {h}x{v} for component {}",
                c.key,
            )));
        }
        if c.quantization > 3 {
            return Err(Error::header(format!(
                "invalid quantization table key {} (0-3 are valid)",
                c.quantization,
            )));
        }
    }
    Ok(())
}

fn ycbcr_components(h: u8, v: u8) -> Vec<Component> {
    vec![
        Component {
            key: 1,
            factor: (h, v),
            quantization: 0,
        },
        Component {
            key: 2,
            factor: (1, 1),
            quantization: 1,
        },
        Component {
            key: 3,
            factor: (1, 1),
            quantization: 1,
        },
    ]
}

fn ycbcr_scan_components() -> Vec<ScanComponent> {
    vec![
        ScanComponent {
            key: 1,
            dc_table: 0,
            ac_table: 0,
        },
        ScanComponent {
            key: 2,
            dc_table: 1,
            ac_table: 1,
        },
        ScanComponent {
            key: 3,
            dc_table: 1,
            ac_table: 1,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_plans_validate() {
        Layout::baseline_gray();
        let layout = Layout::baseline_ycbcr(2, 2).unwrap();
        assert_eq!(layout.max_factor(), (2, 2));
        assert_eq!(layout.plane_index(1), Some(0));
        assert_eq!(layout.plane_index(3), Some(2));
        assert_eq!(layout.plane_index(9), None);

        let progressive = Layout::progressive_ycbcr(2, 1).unwrap();
        assert!(progressive.process().is_progressive());
        assert_eq!(progressive.scans().len(), 10);
    }

    #[test]
    fn rejects_unknown_scan_component() {
        let components = vec![Component {
            key: 1,
            factor: (1, 1),
            quantization: 0,
        }];
        let scans = vec![ScanDescriptor {
            components: vec![ScanComponent {
                key: 7,
                dc_table: 0,
                ac_table: 0,
            }],
            band: Band::FULL,
            bits: Bits::FULL,
        }];
        Layout::new(Process::BASELINE, components, scans).unwrap_err();
    }

    #[test]
    fn rejects_malformed_band() {
        let mut layout = Layout::baseline_gray();
        layout.scans[0].band = Band { lo: 10, hi: 5 };
        Layout::validate_scan(
            Process::PROGRESSIVE,
            &layout.components,
            &layout.scans[0],
        )
        .unwrap_err();
    }

    #[test]
    fn rejects_multi_component_progressive_ac() {
        let layout = Layout::baseline_ycbcr(1, 1).unwrap();
        let mut scan = layout.scans()[0].clone();
        scan.band = Band { lo: 1, hi: 64 };
        Layout::validate_scan(Process::PROGRESSIVE, layout.components(), &scan).unwrap_err();
    }

    #[test]
    fn rejects_wide_refinement() {
        let layout = Layout::baseline_gray();
        let mut scan = layout.scans()[0].clone();
        scan.band = Band { lo: 1, hi: 64 };
        scan.bits = Bits { high: 3, low: 1 };
        Layout::validate_scan(Process::PROGRESSIVE, layout.components(), &scan).unwrap_err();
    }
}
