//! The three pixel-data representations and the stages between them:
//! zigzag-ordered spectral blocks, per-component spatial planes, and the
//! single interleaved full-resolution raster.

use crate::color::{self, Color};
use crate::dct::{self, QuantTable};
use crate::error::{Error, Result};
use crate::layout::Layout;

fn ceil_div(a: u32, b: u32) -> u32 {
    (a + b - 1) / b
}

/// Geometry of one component at a given image size: pixel-accurate sample
/// dimensions and the MCU-padded block grid.
pub(crate) fn component_geometry(
    width: u32,
    height: u32,
    factor: (u8, u8),
    max_factor: (u8, u8),
) -> ComponentGeometry {
    let (h, v) = (u32::from(factor.0), u32::from(factor.1));
    let (hmax, vmax) = (u32::from(max_factor.0), u32::from(max_factor.1));
    let mcus_wide = ceil_div(width, 8 * hmax);
    let mcus_tall = ceil_div(height, 8 * vmax);
    ComponentGeometry {
        width: ceil_div(width * h, hmax),
        height: ceil_div(height * v, vmax),
        blocks_wide: (mcus_wide * h) as usize,
        blocks_tall: (mcus_tall * v) as usize,
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct ComponentGeometry {
    pub width: u32,
    pub height: u32,
    pub blocks_wide: usize,
    pub blocks_tall: usize,
}

/// A 2-D grid of 8x8 coefficient blocks, addressed `(unit_x, unit_y, z)`
/// with `z` in zigzag order.
///
/// Blocks are zero-initialized, so a grid only partially written by an
/// interrupted decode is still well-defined.
#[derive(Debug)]
pub struct CoeffGrid {
    width: usize,
    height: usize,
    data: Vec<i16>,
}

impl CoeffGrid {
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            data: vec![0; width * height * 64],
        }
    }

    /// Grid width in blocks.
    #[inline]
    pub fn width_blocks(&self) -> usize {
        self.width
    }

    /// Grid height in blocks.
    #[inline]
    pub fn height_blocks(&self) -> usize {
        self.height
    }

    pub fn block(&self, unit_x: usize, unit_y: usize) -> &[i16; 64] {
        let i = (unit_y * self.width + unit_x) * 64;
        self.data[i..i + 64].try_into().unwrap()
    }

    pub fn block_mut(&mut self, unit_x: usize, unit_y: usize) -> &mut [i16; 64] {
        let i = (unit_y * self.width + unit_x) * 64;
        (&mut self.data[i..i + 64]).try_into().unwrap()
    }

    /// Extends the grid to at least `rows` block rows, zero-filling the new
    /// blocks. Used while decoding a frame whose height is not yet known.
    pub(crate) fn ensure_rows(&mut self, rows: usize) {
        if rows > self.height {
            self.height = rows;
            self.data.resize(self.width * self.height * 64, 0);
        }
    }

    /// Drops block rows beyond `rows`.
    pub(crate) fn truncate_rows(&mut self, rows: usize) {
        if rows < self.height {
            self.height = rows;
            self.data.truncate(self.width * self.height * 64);
        }
    }
}

/// One component of a [`Spectral`] buffer.
#[derive(Debug)]
pub struct SpectralComponent {
    pub key: u8,
    pub factor: (u8, u8),
    pub quantization: u8,
    /// Pixel-accurate sample size of this component (before block
    /// padding).
    pub width: u32,
    pub height: u32,
    pub grid: CoeffGrid,
}

/// Per-component coefficient buffer for a whole frame.
#[derive(Debug)]
pub struct Spectral {
    width: u32,
    height: u32,
    components: Vec<SpectralComponent>,
}

impl Spectral {
    pub(crate) fn new(width: u32, height: u32, components: Vec<SpectralComponent>) -> Self {
        Self {
            width,
            height,
            components,
        }
    }

    /// Allocates a zeroed buffer for `layout` at the given image size.
    pub fn alloc(layout: &Layout, width: u32, height: u32) -> Self {
        let max = layout.max_factor();
        let components = layout
            .components()
            .iter()
            .map(|c| {
                let geo = component_geometry(width, height, c.factor, max);
                SpectralComponent {
                    key: c.key,
                    factor: c.factor,
                    quantization: c.quantization,
                    width: geo.width,
                    height: geo.height,
                    grid: CoeffGrid::new(geo.blocks_wide, geo.blocks_tall),
                }
            })
            .collect();
        Self {
            width,
            height,
            components,
        }
    }

    #[inline]
    pub fn width(&self) -> u32 {
        self.width
    }

    #[inline]
    pub fn height(&self) -> u32 {
        self.height
    }

    #[inline]
    pub fn components(&self) -> &[SpectralComponent] {
        &self.components
    }

    #[inline]
    pub fn components_mut(&mut self) -> &mut [SpectralComponent] {
        &mut self.components
    }

    /// Inverse-transforms every block into per-component sample planes,
    /// discarding block padding beyond each component's pixel-accurate
    /// edge.
    pub fn to_planar(&self, qtables: &[Option<QuantTable>; 4]) -> Result<Planar> {
        let mut planes = Vec::with_capacity(self.components.len());
        for comp in &self.components {
            let table = qtables[usize::from(comp.quantization)]
                .as_ref()
                .ok_or_else(|| {
                    Error::header(format!(
                        "component {} references undefined quantization table {}",
                        comp.key, comp.quantization,
                    ))
                })?;

            let mut plane = Plane::new(comp.width, comp.height);
            for unit_y in 0..comp.grid.height_blocks() {
                for unit_x in 0..comp.grid.width_blocks() {
                    let samples = dct::inverse(comp.grid.block(unit_x, unit_y), table);
                    plane.put_block(unit_x, unit_y, &samples);
                }
            }
            planes.push(PlanarComponent {
                key: comp.key,
                factor: comp.factor,
                plane,
            });
        }
        Ok(Planar {
            width: self.width,
            height: self.height,
            components: planes,
        })
    }

    /// Forward-transforms sample planes into a coefficient buffer for
    /// `layout`, replicating edge samples into block padding.
    pub fn from_planar(
        planar: &Planar,
        layout: &Layout,
        qtables: &[Option<QuantTable>; 4],
    ) -> Result<Self> {
        let mut spectral = Self::alloc(layout, planar.width, planar.height);
        for (comp, src) in spectral.components.iter_mut().zip(&planar.components) {
            if comp.key != src.key {
                return Err(Error::header(format!(
                    "plane order mismatch: expected component {}, found {}",
                    comp.key, src.key,
                )));
            }
            let table = qtables[usize::from(comp.quantization)]
                .as_ref()
                .ok_or_else(|| {
                    Error::header(format!(
                        "component {} references undefined quantization table {}",
                        comp.key, comp.quantization,
                    ))
                })?;

            for unit_y in 0..comp.grid.height_blocks() {
                for unit_x in 0..comp.grid.width_blocks() {
                    let samples = src.plane.get_block(unit_x, unit_y);
                    *comp.grid.block_mut(unit_x, unit_y) = dct::forward(&samples, table);
                }
            }
        }
        Ok(spectral)
    }
}

/// A single component's sample grid at its native (post-transform,
/// pre-upsample) resolution.
pub struct Plane {
    width: u32,
    height: u32,
    samples: Vec<u8>,
}

impl Plane {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            samples: vec![0; width as usize * height as usize],
        }
    }

    #[inline]
    pub fn width(&self) -> u32 {
        self.width
    }

    #[inline]
    pub fn height(&self) -> u32 {
        self.height
    }

    #[inline]
    pub fn samples(&self) -> &[u8] {
        &self.samples
    }

    #[inline]
    pub fn sample(&self, x: u32, y: u32) -> u8 {
        self.samples[y as usize * self.width as usize + x as usize]
    }

    /// Writes an 8x8 block, clipping the parts that fall beyond the plane.
    fn put_block(&mut self, unit_x: usize, unit_y: usize, samples: &[u8; 64]) {
        let x0 = unit_x * 8;
        let y0 = unit_y * 8;
        for row in 0..8 {
            let y = y0 + row;
            if y >= self.height as usize {
                break;
            }
            for col in 0..8 {
                let x = x0 + col;
                if x >= self.width as usize {
                    break;
                }
                self.samples[y * self.width as usize + x] = samples[row * 8 + col];
            }
        }
    }

    /// Reads an 8x8 block, replicating edge samples where the block hangs
    /// over the plane boundary.
    fn get_block(&self, unit_x: usize, unit_y: usize) -> [u8; 64] {
        let mut out = [0u8; 64];
        for row in 0..8 {
            let y = ((unit_y * 8 + row) as u32).min(self.height - 1);
            for col in 0..8 {
                let x = ((unit_x * 8 + col) as u32).min(self.width - 1);
                out[row * 8 + col] = self.sample(x, y);
            }
        }
        out
    }
}

pub struct PlanarComponent {
    pub key: u8,
    pub factor: (u8, u8),
    pub plane: Plane,
}

/// Per-component sample planes at their native resolutions, plus the
/// full-image dimensions they belong to.
pub struct Planar {
    width: u32,
    height: u32,
    components: Vec<PlanarComponent>,
}

impl Planar {
    #[inline]
    pub fn width(&self) -> u32 {
        self.width
    }

    #[inline]
    pub fn height(&self) -> u32 {
        self.height
    }

    #[inline]
    pub fn components(&self) -> &[PlanarComponent] {
        &self.components
    }

    /// Upsamples every plane to the full image grid (nearest-neighbor
    /// replication) and interleaves them into a single raster.
    ///
    /// `cosite` selects the chroma siting convention for factors above 1:
    /// co-sited replication uses source index `x*f/f_max`, centered
    /// replication shifts by half a step, `(2x*f + f) / (2*f_max)`.
    /// Components at full resolution are unaffected by the flag.
    pub fn to_rectangular(&self, cosite: bool) -> Rectangular {
        let hmax = self.components.iter().map(|c| c.factor.0).max().unwrap_or(1);
        let vmax = self.components.iter().map(|c| c.factor.1).max().unwrap_or(1);

        let channels = self.components.len();
        let mut samples = vec![0u8; self.width as usize * self.height as usize * channels];
        for (ci, comp) in self.components.iter().enumerate() {
            let (h, v) = (u32::from(comp.factor.0), u32::from(comp.factor.1));
            let (hmax, vmax) = (u32::from(hmax), u32::from(vmax));
            let src_index = |x: u32, f: u32, fmax: u32, limit: u32| {
                let i = if cosite {
                    x * f / fmax
                } else {
                    (2 * x * f + f) / (2 * fmax)
                };
                i.min(limit - 1)
            };
            for y in 0..self.height {
                let sy = src_index(y, v, vmax, comp.plane.height());
                for x in 0..self.width {
                    let sx = src_index(x, h, hmax, comp.plane.width());
                    samples[(y as usize * self.width as usize + x as usize) * channels + ci] =
                        comp.plane.sample(sx, sy);
                }
            }
        }

        Rectangular {
            width: self.width,
            height: self.height,
            keys: self.components.iter().map(|c| c.key).collect(),
            samples,
        }
    }

    /// Downsamples an interleaved raster into per-component planes sized
    /// for `layout` (box-filter average over each component's sampling
    /// window).
    pub fn from_rectangular(raster: &Rectangular, layout: &Layout) -> Result<Self> {
        let keys: Vec<u8> = layout.components().iter().map(|c| c.key).collect();
        if raster.keys != keys {
            return Err(Error::header(format!(
                "raster components {:?} do not match layout components {:?}",
                raster.keys, keys,
            )));
        }
        let channels = raster.channels();
        let max = layout.max_factor();
        let (hmax, vmax) = (u32::from(max.0), u32::from(max.1));

        let mut components = Vec::with_capacity(channels);
        for (ci, c) in layout.components().iter().enumerate() {
            let geo = component_geometry(raster.width, raster.height, c.factor, max);
            let (h, v) = (u32::from(c.factor.0), u32::from(c.factor.1));
            let mut plane = Plane::new(geo.width, geo.height);
            for py in 0..geo.height {
                let y0 = py * vmax / v;
                let y1 = (((py + 1) * vmax).div_ceil(v)).min(raster.height).max(y0 + 1);
                for px in 0..geo.width {
                    let x0 = px * hmax / h;
                    let x1 = (((px + 1) * hmax).div_ceil(h)).min(raster.width).max(x0 + 1);

                    let mut sum = 0u32;
                    let mut n = 0u32;
                    for y in y0..y1 {
                        if y >= raster.height {
                            break;
                        }
                        for x in x0..x1 {
                            if x >= raster.width {
                                break;
                            }
                            sum += u32::from(
                                raster.samples
                                    [(y as usize * raster.width as usize + x as usize) * channels
                                        + ci],
                            );
                            n += 1;
                        }
                    }
                    let n = n.max(1);
                    plane.samples[py as usize * geo.width as usize + px as usize] =
                        ((sum + n / 2) / n) as u8;
                }
            }
            components.push(PlanarComponent {
                key: c.key,
                factor: c.factor,
                plane,
            });
        }

        Ok(Self {
            width: raster.width,
            height: raster.height,
            components,
        })
    }
}

/// A single interleaved raster at full image resolution: row-major, one
/// sample per component per pixel, component order matching the plane
/// order.
pub struct Rectangular {
    width: u32,
    height: u32,
    keys: Vec<u8>,
    samples: Vec<u8>,
}

impl Rectangular {
    pub fn new(width: u32, height: u32, keys: Vec<u8>, samples: Vec<u8>) -> Result<Self> {
        if samples.len() != width as usize * height as usize * keys.len() {
            return Err(Error::from(format!(
                "raster sample buffer holds {} bytes, expected {}",
                samples.len(),
                width as usize * height as usize * keys.len(),
            )));
        }
        Ok(Self {
            width,
            height,
            keys,
            samples,
        })
    }

    /// Packs caller pixels into a raster using `C`'s component keys.
    pub fn pack<C: Color>(width: u32, height: u32, pixels: &[C::Pixel]) -> Result<Self> {
        if pixels.len() != width as usize * height as usize {
            return Err(Error::from(format!(
                "pixel buffer holds {} pixels, expected {}",
                pixels.len(),
                width as usize * height as usize,
            )));
        }
        let mut samples = Vec::with_capacity(pixels.len() * C::FORMAT.keys().len());
        C::pack(pixels, &mut samples);
        Self::new(width, height, C::FORMAT.keys().to_vec(), samples)
    }

    /// Unpacks the raster into caller pixels.
    ///
    /// Returns `None` when the observed component keys and precision are
    /// not recognized as `C`'s format; this is a mismatch report, not an
    /// error.
    pub fn unpack<C: Color>(&self) -> Option<Vec<C::Pixel>> {
        if color::recognize(&self.keys, 8) != Some(C::FORMAT) {
            return None;
        }
        Some(C::unpack(&self.samples))
    }

    #[inline]
    pub fn width(&self) -> u32 {
        self.width
    }

    #[inline]
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Component keys, in interleaving order.
    #[inline]
    pub fn keys(&self) -> &[u8] {
        &self.keys
    }

    #[inline]
    pub fn channels(&self) -> usize {
        self.keys.len()
    }

    /// Interleaved samples, row-major.
    #[inline]
    pub fn samples(&self) -> &[u8] {
        &self.samples
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::color::Ycbcr8;

    #[test]
    fn geometry_rounds_up() {
        // 13x9 image, luma 2x2, chroma 1x1 (max 2x2): luma spans the full
        // size, chroma is halved and rounded up; block grids are padded to
        // whole MCUs.
        let geo = component_geometry(13, 9, (2, 2), (2, 2));
        assert_eq!((geo.width, geo.height), (13, 9));
        assert_eq!((geo.blocks_wide, geo.blocks_tall), (2, 2));

        let geo = component_geometry(13, 9, (1, 1), (2, 2));
        assert_eq!((geo.width, geo.height), (7, 5));
        assert_eq!((geo.blocks_wide, geo.blocks_tall), (1, 1));
    }

    #[test]
    fn plane_block_clipping_and_padding() {
        let mut plane = Plane::new(10, 10);
        let mut block = [0u8; 64];
        for (i, b) in block.iter_mut().enumerate() {
            *b = i as u8;
        }
        // The second block column only has 2 visible pixels per row.
        plane.put_block(1, 0, &block);
        assert_eq!(plane.sample(8, 0), 0);
        assert_eq!(plane.sample(9, 0), 1);

        // Reading it back replicates the edge samples.
        let back = plane.get_block(1, 0);
        assert_eq!(back[0], 0);
        assert_eq!(back[1], 1);
        assert_eq!(back[2], 1); // replicated from x=9
        assert_eq!(back[7], 1);
    }

    #[test]
    fn upsample_identity_at_full_resolution() {
        let mut plane = Plane::new(4, 2);
        for (i, s) in plane.samples.iter_mut().enumerate() {
            *s = i as u8 * 10;
        }
        let planar = Planar {
            width: 4,
            height: 2,
            components: vec![PlanarComponent {
                key: 1,
                factor: (1, 1),
                plane,
            }],
        };
        for cosite in [false, true] {
            let raster = planar.to_rectangular(cosite);
            assert_eq!(raster.samples(), &[0, 10, 20, 30, 40, 50, 60, 70]);
        }
    }

    #[test]
    fn upsample_replicates_subsampled_plane() {
        let mut plane = Plane::new(2, 1);
        plane.samples.copy_from_slice(&[100, 200]);
        let planar = Planar {
            width: 4,
            height: 1,
            components: vec![
                PlanarComponent {
                    key: 1,
                    factor: (2, 1),
                    plane: Plane::new(4, 1),
                },
                PlanarComponent {
                    key: 2,
                    factor: (1, 1),
                    plane,
                },
            ],
        };
        let raster = planar.to_rectangular(true);
        let chroma: Vec<u8> = raster.samples().iter().skip(1).step_by(2).copied().collect();
        assert_eq!(chroma, [100, 100, 200, 200]);
    }

    #[test]
    fn pack_roundtrip() {
        let pixels: Vec<[u8; 3]> = vec![[1, 2, 3], [4, 5, 6]];
        let raster = Rectangular::pack::<Ycbcr8>(2, 1, &pixels).unwrap();
        assert_eq!(raster.samples(), &[1, 2, 3, 4, 5, 6]);
        assert_eq!(raster.unpack::<Ycbcr8>().unwrap(), pixels);
    }
}
