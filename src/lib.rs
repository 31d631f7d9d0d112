//! A streaming baseline and progressive JPEG encoder/decoder.
//!
//! The pipeline has three tiers of pixel data: zigzag-ordered
//! [`Spectral`] coefficient blocks, per-component [`Planar`] sample
//! planes, and a single interleaved [`Rectangular`] raster that packs and
//! unpacks caller pixels through the [`color`] contract. Decoding runs
//! bytes through the [`file::Lexer`], assembles coefficients in a
//! [`Context`], and inverse-transforms them stage by stage; encoding walks
//! the same pipeline in the other direction, driven by an immutable
//! [`Layout`] that fixes sampling factors, quantization assignments, and
//! the scan script.
//!
//! ```
//! use repeg::{color::Gray8, image::Rectangular, Encoder, Layout};
//!
//! let pixels = vec![128u8; 16 * 16];
//! let raster = Rectangular::pack::<Gray8>(16, 16, &pixels)?;
//! let jpeg = Encoder::new(Layout::baseline_gray()).encode_to_vec(&raster)?;
//!
//! let image = repeg::decode(&jpeg)?;
//! assert_eq!((image.width(), image.height()), (16, 16));
//! let decoded = image.to_raster(true)?.unpack::<Gray8>().unwrap();
//! # assert_eq!(decoded.len(), 256);
//! # Ok::<(), repeg::Error>(())
//! ```
//!
//! Truncated input is not fatal during streaming: the lexer reports a
//! tagged incomplete condition, the caller grows its buffer and re-invokes
//! from the saved position (see [`Decoder::advance`]).

pub mod assemble;
mod bits;
pub mod color;
pub mod dct;
mod error;
pub mod file;
pub mod huffman;
pub mod image;
pub mod layout;
pub mod metadata;
pub mod tables;

#[cfg(test)]
mod tests;

use error::Result;

pub use assemble::Context;
pub use error::{Error, ErrorKind};
pub use image::{Planar, Rectangular, Spectral};
pub use layout::Layout;

use assemble::State;
use color::Format;
use dct::QuantTable;
use file::{marker, Lex, SegmentKind, SofMarker, Truncation};
use huffman::HuffmanTable;
use metadata::{Density, ExifRecord, JfifRecord, MetadataRecord};
use tables::HuffmanSpec;

/// Pull-based byte source for decoding.
///
/// `read` hands out exactly `count` bytes or reports that they are not
/// available; whether `None` means "not buffered yet" or "end of stream"
/// is the caller's context. `reset` rewinds so a parse step can be retried
/// from a saved position.
pub trait Source {
    fn read(&mut self, count: usize) -> Option<Vec<u8>>;
    fn reset(&mut self, position: usize);
}

/// A [`Source`] over an in-memory byte slice.
pub struct SliceSource<'a> {
    data: &'a [u8],
    position: usize,
}

impl<'a> SliceSource<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, position: 0 }
    }
}

impl<'a> Source for SliceSource<'a> {
    fn read(&mut self, count: usize) -> Option<Vec<u8>> {
        let bytes = self.data.get(self.position..self.position + count)?;
        self.position += count;
        Some(bytes.to_vec())
    }

    fn reset(&mut self, position: usize) {
        self.position = position;
    }
}

/// Push-based byte destination for encoding. `None` reports a write
/// failure.
pub trait Destination {
    fn write(&mut self, bytes: &[u8]) -> Option<()>;
}

impl Destination for Vec<u8> {
    fn write(&mut self, bytes: &[u8]) -> Option<()> {
        self.extend_from_slice(bytes);
        Some(())
    }
}

/// Outcome of one [`Decoder::advance`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advance {
    /// The buffer ended mid-item; feed more bytes and call again.
    NeedBytes(Truncation),
    /// The end-of-image marker was consumed.
    Complete,
}

/// Incremental decoder: lexes the marker stream and feeds the scan
/// assembler, collecting metadata records on the way.
pub struct Decoder {
    lexer: file::Lexer,
    ctx: Context,
    metadata: Vec<MetadataRecord>,
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            lexer: file::Lexer::new(),
            ctx: Context::new(),
            metadata: Vec::new(),
        }
    }

    /// Processes as much of `buf` as possible.
    ///
    /// `buf` must always contain the whole stream seen so far; the decoder
    /// addresses it absolutely. On [`Advance::NeedBytes`] the internal
    /// position stays at the unfinished item, so growing the buffer and
    /// calling again resumes exactly there.
    pub fn advance(&mut self, buf: &[u8]) -> Result<Advance> {
        loop {
            match self.lexer.next(buf)? {
                Lex::Incomplete(kind) => return Ok(Advance::NeedBytes(kind)),
                Lex::End => {
                    self.ctx.push_end()?;
                    return Ok(Advance::Complete);
                }
                Lex::Entropy(chunk) => {
                    self.ctx.push_entropy(&chunk.data)?;
                    if let Some(phase) = chunk.restart {
                        self.ctx.push_restart(phase)?;
                    }
                }
                Lex::Segment(segment) => self.dispatch(&segment)?,
            }
        }
    }

    fn dispatch(&mut self, segment: &file::Segment<'_>) -> Result<()> {
        match segment.as_segment_kind() {
            Some(SegmentKind::Sof(sof)) => self.ctx.push_frame(sof),
            Some(SegmentKind::Dht(dht)) => {
                for table in dht.tables() {
                    self.ctx.push_huffman_table(table)?;
                }
                Ok(())
            }
            Some(SegmentKind::Dqt(dqt)) => {
                for table in dqt.tables() {
                    self.ctx.push_quantization_table(table)?;
                }
                Ok(())
            }
            Some(SegmentKind::Dri(dri)) => self.ctx.push_restart_interval(dri),
            Some(SegmentKind::Dnl(dnl)) => self.ctx.push_height(dnl),
            Some(SegmentKind::Sos(sos)) => self.ctx.begin_scan(sos),
            Some(SegmentKind::App(app)) => {
                let record = match app.as_app_kind() {
                    Some(file::AppKind::Jfif(jfif)) => MetadataRecord::Jfif(JfifRecord {
                        version: (jfif.major_version(), jfif.minor_version()),
                        density: Density {
                            x: jfif.density_x(),
                            y: jfif.density_y(),
                            unit: jfif.unit(),
                        },
                    }),
                    Some(file::AppKind::Exif(bytes)) => {
                        MetadataRecord::Exif(ExifRecord::new(bytes.to_vec()))
                    }
                    _ => MetadataRecord::App {
                        n: app.n(),
                        bytes: segment.raw_bytes().to_vec(),
                    },
                };
                self.metadata.push(record);
                Ok(())
            }
            Some(SegmentKind::Com(com)) => {
                self.metadata.push(MetadataRecord::Comment(com.text().to_vec()));
                Ok(())
            }
            _ => {
                log::trace!("skipping unknown segment ff {:02x}", segment.marker());
                Ok(())
            }
        }
    }

    /// One-shot decode: drives the truncation-retry loop against `source`
    /// until the image completes. A truncation that the source cannot
    /// satisfy becomes an unexpected-end error.
    pub fn decode(mut self, source: &mut dyn Source) -> Result<Image> {
        const CHUNK: usize = 4096;

        let mut buf = Vec::new();
        loop {
            match self.advance(&buf)? {
                Advance::Complete => break,
                Advance::NeedBytes(_) => {
                    // Sources serve exact counts, so drain the tail by
                    // halving the request until something fits.
                    let mut count = CHUNK;
                    let got = loop {
                        if let Some(bytes) = source.read(count) {
                            buf.extend_from_slice(&bytes);
                            break true;
                        }
                        if count == 1 {
                            break false;
                        }
                        count /= 2;
                    };
                    if !got {
                        return Err(Error::unexpected_end());
                    }
                }
            }
        }

        if self.lexer.position() < buf.len() {
            log::warn!(
                "ignoring {} trailing bytes after EOI",
                buf.len() - self.lexer.position(),
            );
        }
        self.finish()
    }

    /// Converts whatever has been assembled so far into an [`Image`].
    /// Useful after feeding a truncated stream via [`Decoder::advance`].
    pub fn finish(self) -> Result<Image> {
        let frame = self.ctx.finish()?;
        Ok(Image {
            layout: frame.layout,
            spectral: frame.spectral,
            qtables: frame.qtables,
            restart_interval: frame.restart_interval,
            metadata: self.metadata,
        })
    }

    /// Assembly state, mostly interesting for streaming callers.
    pub fn state(&self) -> State {
        self.ctx.state()
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Decodes an in-memory JPEG stream.
pub fn decode(jpeg: &[u8]) -> Result<Image> {
    Decoder::new().decode(&mut SliceSource::new(jpeg))
}

/// A decoded image: the layout observed on the stream, the coefficient
/// buffer, the tables needed to leave the spectral domain, and the opaque
/// metadata records that rode along.
#[derive(Debug)]
pub struct Image {
    layout: Layout,
    spectral: Spectral,
    qtables: [Option<QuantTable>; 4],
    restart_interval: u32,
    metadata: Vec<MetadataRecord>,
}

impl Image {
    #[inline]
    pub fn width(&self) -> u32 {
        self.spectral.width()
    }

    #[inline]
    pub fn height(&self) -> u32 {
        self.spectral.height()
    }

    #[inline]
    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    #[inline]
    pub fn spectral(&self) -> &Spectral {
        &self.spectral
    }

    #[inline]
    pub fn metadata(&self) -> &[MetadataRecord] {
        &self.metadata
    }

    #[inline]
    pub fn quantization_tables(&self) -> &[Option<QuantTable>; 4] {
        &self.qtables
    }

    #[inline]
    pub fn restart_interval(&self) -> u32 {
        self.restart_interval
    }

    /// The recognized pixel format, if any caller-visible format matches
    /// the component set this stream carries.
    pub fn format(&self) -> Option<Format> {
        let keys: Vec<u8> = self.layout.components().iter().map(|c| c.key).collect();
        color::recognize(&keys, self.layout.precision())
    }

    /// Runs the spectral buffer through the inverse transform and
    /// upsampling stages into an interleaved raster. See
    /// [`Planar::to_rectangular`] for the `cosite` flag.
    pub fn to_raster(&self, cosite: bool) -> Result<Rectangular> {
        Ok(self.spectral.to_planar(&self.qtables)?.to_rectangular(cosite))
    }
}

/// JPEG encoder for a fixed [`Layout`].
///
/// Quantization and Huffman tables default to the Annex K examples,
/// assigned luma/chroma by plane order; callers can override any slot
/// before encoding.
pub struct Encoder {
    layout: Layout,
    qtables: [Option<QuantTable>; 4],
    dc_specs: [Option<HuffmanSpec>; 4],
    ac_specs: [Option<HuffmanSpec>; 4],
    restart_interval: u16,
    metadata: Vec<MetadataRecord>,
}

impl Encoder {
    pub fn new(layout: Layout) -> Self {
        let mut qtables: [Option<QuantTable>; 4] = [None, None, None, None];
        let mut dc_specs: [Option<HuffmanSpec>; 4] = [None, None, None, None];
        let mut ac_specs: [Option<HuffmanSpec>; 4] = [None, None, None, None];

        for (index, c) in layout.components().iter().enumerate() {
            let slot = &mut qtables[usize::from(c.quantization)];
            if slot.is_none() {
                *slot = Some(QuantTable::from_natural(if index == 0 {
                    &tables::QUANT_LUMA
                } else {
                    &tables::QUANT_CHROMA
                }));
            }
        }
        for scan in layout.scans() {
            for sc in &scan.components {
                let luma = layout.plane_index(sc.key) == Some(0);
                let dc = &mut dc_specs[usize::from(sc.dc_table)];
                if dc.is_none() {
                    *dc = Some(if luma { tables::LUMA_DC } else { tables::CHROMA_DC });
                }
                let ac = &mut ac_specs[usize::from(sc.ac_table)];
                if ac.is_none() {
                    *ac = Some(if luma { tables::LUMA_AC } else { tables::CHROMA_AC });
                }
            }
        }

        Self {
            layout,
            qtables,
            dc_specs,
            ac_specs,
            restart_interval: 0,
            metadata: Vec::new(),
        }
    }

    #[inline]
    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Replaces the quantization table in `key` (0-3).
    pub fn set_quantization_table(&mut self, key: u8, table: QuantTable) {
        self.qtables[usize::from(key)] = Some(table);
    }

    /// Replaces a Huffman table spec in `key` (0-3).
    pub fn set_huffman_spec(&mut self, class: huffman::TableClass, key: u8, spec: HuffmanSpec) {
        match class {
            huffman::TableClass::Dc => self.dc_specs[usize::from(key)] = Some(spec),
            huffman::TableClass::Ac => self.ac_specs[usize::from(key)] = Some(spec),
        }
    }

    /// Enables restart markers every `mcus` MCUs (0 disables them).
    pub fn set_restart_interval(&mut self, mcus: u16) {
        self.restart_interval = mcus;
    }

    /// Attaches a metadata record, written ahead of the frame header.
    pub fn push_metadata(&mut self, record: MetadataRecord) {
        self.metadata.push(record);
    }

    /// Encodes a raster: downsamples to planes, forward-transforms into
    /// coefficients, and serializes the marker stream into `dest`.
    pub fn encode(&self, raster: &Rectangular, dest: &mut dyn Destination) -> Result<()> {
        let planar = Planar::from_rectangular(raster, &self.layout)?;
        let spectral = Spectral::from_planar(&planar, &self.layout, &self.qtables)?;
        self.encode_spectral(&spectral, dest)
    }

    /// Convenience wrapper serializing into a fresh byte vector.
    pub fn encode_to_vec(&self, raster: &Rectangular) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.encode(raster, &mut out)?;
        Ok(out)
    }

    /// Serializes an already-transformed coefficient buffer, for callers
    /// that control quantized coefficients directly.
    pub fn encode_spectral(&self, spectral: &Spectral, dest: &mut dyn Destination) -> Result<()> {
        if spectral.width() > u32::from(u16::MAX) || spectral.height() > u32::from(u16::MAX) {
            return Err(Error::header(format!(
                "image size {}x{} does not fit a frame header",
                spectral.width(),
                spectral.height(),
            )));
        }
        let spectral_keys: Vec<u8> = spectral.components().iter().map(|c| c.key).collect();
        let layout_keys: Vec<u8> = self.layout.components().iter().map(|c| c.key).collect();
        if spectral_keys != layout_keys {
            return Err(Error::header(format!(
                "spectral components {spectral_keys:?} do not match layout components \
                 {layout_keys:?}",
            )));
        }

        let (dc_tables, ac_tables) = self.build_tables()?;

        file::write_marker(dest, marker::SOI)?;
        for record in &self.metadata {
            self.write_metadata(record, dest)?;
        }

        let mut written = [false; 4];
        for c in self.layout.components() {
            let key = usize::from(c.quantization);
            if !written[key] {
                let table = self.qtables[key].as_ref().ok_or_else(|| {
                    Error::header(format!("no quantization table in slot {key}"))
                })?;
                file::write_segment(dest, marker::DQT, &file::dqt_body(key as u8, table))?;
                written[key] = true;
            }
        }

        file::write_segment(
            dest,
            SofMarker::for_process(self.layout.process()).value(),
            &file::sof_body(
                self.layout.precision(),
                spectral.width() as u16,
                spectral.height() as u16,
                self.layout.components(),
            ),
        )?;

        self.write_huffman_tables(dest)?;

        if self.restart_interval > 0 {
            file::write_segment(dest, marker::DRI, &file::dri_body(self.restart_interval))?;
        }

        for desc in self.layout.scans() {
            file::write_segment(dest, marker::SOS, &file::sos_body(desc))?;
            let segments = assemble::encode_scan(
                spectral,
                &self.layout,
                desc,
                &dc_tables,
                &ac_tables,
                usize::from(self.restart_interval),
            )?;
            for (i, segment) in segments.iter().enumerate() {
                if i > 0 {
                    file::write_marker(dest, marker::RST0 + ((i - 1) % 8) as u8)?;
                }
                file::write_entropy(dest, segment)?;
            }
        }

        file::write_marker(dest, marker::EOI)
    }

    fn build_tables(
        &self,
    ) -> Result<([Option<HuffmanTable>; 4], [Option<HuffmanTable>; 4])> {
        let build = |specs: &[Option<HuffmanSpec>; 4]| -> Result<[Option<HuffmanTable>; 4]> {
            let mut out = [None, None, None, None];
            for (slot, spec) in out.iter_mut().zip(specs) {
                if let Some(spec) = spec {
                    *slot = Some(HuffmanTable::build(&spec.counts, spec.values)?);
                }
            }
            Ok(out)
        };
        Ok((build(&self.dc_specs)?, build(&self.ac_specs)?))
    }

    fn write_huffman_tables(&self, dest: &mut dyn Destination) -> Result<()> {
        // Emit only the tables some scan actually selects; a DC refinement
        // pass reads no DC table at all.
        let mut dc_used = [false; 4];
        let mut ac_used = [false; 4];
        for desc in self.layout.scans() {
            for sc in &desc.components {
                if desc.band.includes_dc() && !desc.bits.is_refinement() {
                    dc_used[usize::from(sc.dc_table)] = true;
                }
                if desc.band.hi > 1 {
                    ac_used[usize::from(sc.ac_table)] = true;
                }
            }
        }
        for (key, used) in dc_used.iter().enumerate() {
            if *used {
                let spec = self.dc_specs[key]
                    .as_ref()
                    .ok_or_else(|| Error::header(format!("no DC huffman spec in slot {key}")))?;
                file::write_segment(
                    dest,
                    marker::DHT,
                    &file::dht_body(0, key as u8, &spec.counts, spec.values),
                )?;
            }
        }
        for (key, used) in ac_used.iter().enumerate() {
            if *used {
                let spec = self.ac_specs[key]
                    .as_ref()
                    .ok_or_else(|| Error::header(format!("no AC huffman spec in slot {key}")))?;
                file::write_segment(
                    dest,
                    marker::DHT,
                    &file::dht_body(1, key as u8, &spec.counts, spec.values),
                )?;
            }
        }
        Ok(())
    }

    fn write_metadata(&self, record: &MetadataRecord, dest: &mut dyn Destination) -> Result<()> {
        match record {
            MetadataRecord::Jfif(rec) => {
                file::write_segment(dest, marker::APP0, &file::jfif_body(rec))
            }
            MetadataRecord::Exif(rec) => {
                let mut body = b"Exif\0\0".to_vec();
                body.extend_from_slice(rec.raw());
                file::write_segment(dest, marker::APP0 + 1, &body)
            }
            MetadataRecord::Comment(text) => file::write_segment(dest, marker::COM, text),
            MetadataRecord::App { n, bytes } => {
                file::write_segment(dest, marker::APP0 + (n & 0xF), bytes)
            }
        }
    }
}
