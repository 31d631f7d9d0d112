//! JPEG/JFIF marker lexer, header parser, and stream serializer.

#![allow(non_snake_case)]

#[cfg(test)]
mod tests;

use std::{fmt, mem};

use bytemuck::AnyBitPattern;

use crate::error::{Error, Result};
use crate::layout::{Band, Bits, Mode, Process, ScanComponent as LayoutScanComponent, ScanDescriptor};

pub(crate) mod marker {
    pub const TEM: u8 = 0x01;
    pub const DHT: u8 = 0xC4;
    pub const RST0: u8 = 0xD0;
    pub const SOI: u8 = 0xD8;
    pub const EOI: u8 = 0xD9;
    pub const SOS: u8 = 0xDA;
    pub const DQT: u8 = 0xDB;
    pub const DNL: u8 = 0xDC;
    pub const DRI: u8 = 0xDD;
    pub const APP0: u8 = 0xE0;
    pub const COM: u8 = 0xFE;
}

/// Why the lexer stopped short of a complete item.
///
/// None of these is an error: the caller grows the buffer (keeping the
/// already-seen prefix intact) and re-invokes [`Lexer::next`], which
/// resumes from the saved position. Only a permanently exhausted source
/// turns a truncation into an "unexpected end" error, at the driver level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Truncation {
    /// A `0xFF` prefix was seen but the marker-type byte is missing.
    MarkerType,
    /// The marker is present but its fixed 2-byte length field is not.
    FixedHeader,
    /// The declared segment length exceeds the available bytes.
    SegmentBody,
    /// An entropy-coded segment runs to the end of the buffer without a
    /// terminating marker.
    EntropyData,
}

/// One item lexed from the stream.
#[derive(Debug)]
pub enum Lex<'a> {
    /// A marker segment with its (possibly parsed) payload.
    Segment(Segment<'a>),
    /// Entropy-coded bytes, unstuffed, ending at a marker.
    Entropy(EntropyChunk),
    /// More bytes are needed; the read position has not advanced.
    Incomplete(Truncation),
    /// The end-of-image marker was consumed.
    End,
}

/// Unstuffed entropy-coded bytes up to the next marker.
///
/// `restart` carries the phase (low 3 bits) of the restart marker that
/// terminated the chunk and was consumed along with it; `None` means a
/// non-restart marker follows, which the next [`Lexer::next`] call will
/// return as a [`Lex::Segment`] (or [`Lex::End`]).
#[derive(Debug)]
pub struct EntropyChunk {
    pub data: Vec<u8>,
    pub restart: Option<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LexerState {
    /// Expecting the SOI marker.
    Start,
    /// Between marker segments.
    Headers,
    /// Inside the entropy-coded data following an SOS header.
    Entropy,
    /// EOI was consumed.
    Done,
}

/// Incremental, resumable lexer for the JPEG marker stream.
///
/// The lexer holds only a byte position into the caller's buffer. Each
/// [`Lexer::next`] call either returns a complete item and advances, or
/// returns [`Lex::Incomplete`] and leaves the position untouched so the
/// identical call can be retried once more bytes are available.
pub struct Lexer {
    position: usize,
    state: LexerState,
}

impl Lexer {
    pub fn new() -> Self {
        Self {
            position: 0,
            state: LexerState::Start,
        }
    }

    /// Byte offset of the next unconsumed byte in the stream.
    #[inline]
    pub fn position(&self) -> usize {
        self.position
    }

    /// Lexes the next item from `buf`, which must contain the whole stream
    /// seen so far (the lexer addresses it absolutely).
    pub fn next<'a>(&mut self, buf: &'a [u8]) -> Result<Lex<'a>> {
        match self.state {
            LexerState::Start => {
                if buf.len() < 2 {
                    return Ok(Lex::Incomplete(Truncation::MarkerType));
                }
                if buf[0] != 0xFF || buf[1] != marker::SOI {
                    return Err(Error::header("JPEG image does not start with SOI marker"));
                }
                self.position = 2;
                self.state = LexerState::Headers;
                self.lex_segment(buf)
            }
            LexerState::Headers => self.lex_segment(buf),
            LexerState::Entropy => self.lex_entropy(buf),
            LexerState::Done => Ok(Lex::End),
        }
    }

    fn lex_segment<'a>(&mut self, buf: &'a [u8]) -> Result<Lex<'a>> {
        let mut pos = self.position;
        // Tolerate stray non-marker bytes between segments, like other
        // decoders do.
        while pos < buf.len() && buf[pos] != 0xFF {
            pos += 1;
        }
        // Skip 0xFF fill bytes; the marker type is the first non-0xFF.
        let mut m = pos + 1;
        while m < buf.len() && buf[m] == 0xFF {
            m += 1;
        }
        if m >= buf.len() {
            return Ok(Lex::Incomplete(Truncation::MarkerType));
        }

        let segment_offset = m - 1;
        let marker = buf[m];
        match marker {
            0x00 => return Err(Error::header("invalid ff 00 marker outside scan data")),
            marker::SOI => return Err(Error::header("unexpected second SOI marker")),
            marker::TEM => return Err(Error::header("unexpected TEM marker")),
            marker::RST0..=0xD7 => {
                return Err(Error::protocol(format!(
                    "restart marker RST{} outside scan data",
                    marker & 7,
                )))
            }
            marker::EOI => {
                self.position = m + 1;
                self.state = LexerState::Done;
                return Ok(Lex::End);
            }
            _ => {}
        }

        // Every remaining marker (even an unknown one) is followed by the
        // segment length.
        if buf.len() < m + 3 {
            return Ok(Lex::Incomplete(Truncation::FixedHeader));
        }
        let length = usize::from(u16::from_be_bytes([buf[m + 1], buf[m + 2]]));
        if length < 2 {
            return Err(Error::header(format!("invalid segment length {length}")));
        }
        let body_start = m + 3;
        let body_len = length - 2;
        if buf.len() < body_start + body_len {
            return Ok(Lex::Incomplete(Truncation::SegmentBody));
        }
        let body = &buf[body_start..body_start + body_len];

        let mut reader = Reader {
            buf: body,
            position: 0,
        };
        let kind = match marker {
            marker::DQT => Some(SegmentKind::Dqt(read_dqt(&mut reader)?)),
            marker::DHT => Some(SegmentKind::Dht(read_dht(&mut reader)?)),
            0xC0..=0xC3 | 0xC5..=0xC7 | 0xC9..=0xCB | 0xCD..=0xCF => {
                Some(SegmentKind::Sof(read_sof(marker, &mut reader)?))
            }
            marker::SOS => Some(SegmentKind::Sos(read_sos(&mut reader)?)),
            marker::DNL => Some(SegmentKind::Dnl(read_dnl(&mut reader)?)),
            marker::DRI => Some(SegmentKind::Dri(read_dri(&mut reader)?)),
            marker::APP0..=0xEF => Some(SegmentKind::App(read_app(marker, &mut reader)?)),
            marker::COM => Some(SegmentKind::Com(read_com(&mut reader)?)),
            _ => None,
        };

        // APP and COM segments carry arbitrary payloads and unknown markers
        // are skipped wholesale; every other parser must consume exactly the
        // declared length.
        match kind {
            Some(SegmentKind::App(_)) | Some(SegmentKind::Com(_)) | None => {}
            Some(_) if reader.position != body.len() => {
                return Err(Error::header(format!(
                    "ff {marker:02x} segment declared {} payload bytes but {} were consumed",
                    body.len(),
                    reader.position,
                )));
            }
            Some(_) => {}
        }

        self.position = body_start + body_len;
        if marker == marker::SOS {
            self.state = LexerState::Entropy;
        }

        Ok(Lex::Segment(Segment {
            marker,
            raw_bytes: body,
            offset: segment_offset,
            kind,
        }))
    }

    fn lex_entropy<'a>(&mut self, buf: &'a [u8]) -> Result<Lex<'a>> {
        let mut pos = self.position;
        let mut data = Vec::new();
        loop {
            if pos >= buf.len() {
                return Ok(Lex::Incomplete(Truncation::EntropyData));
            }
            let byte = buf[pos];
            if byte != 0xFF {
                data.push(byte);
                pos += 1;
                continue;
            }
            // A 0xFF needs its successor to be classified.
            if pos + 1 >= buf.len() {
                return Ok(Lex::Incomplete(Truncation::EntropyData));
            }
            match buf[pos + 1] {
                // Stuffed literal 0xFF byte.
                0x00 => {
                    data.push(0xFF);
                    pos += 2;
                }
                // Fill byte before a marker.
                0xFF => pos += 1,
                m @ marker::RST0..=0xD7 => {
                    self.position = pos + 2;
                    return Ok(Lex::Entropy(EntropyChunk {
                        data,
                        restart: Some(m & 7),
                    }));
                }
                _ => {
                    // A true marker ends the entropy-coded segment; leave it
                    // for the next call.
                    self.position = pos;
                    self.state = LexerState::Headers;
                    return Ok(Lex::Entropy(EntropyChunk {
                        data,
                        restart: None,
                    }));
                }
            }
        }
    }
}

impl Default for Lexer {
    fn default() -> Self {
        Self::new()
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    position: usize,
}

impl<'a> Reader<'a> {
    fn remaining(&self) -> &'a [u8] {
        &self.buf[self.position..]
    }

    fn read_u8(&mut self) -> Result<u8> {
        match self.remaining().first() {
            Some(&b) => {
                self.position += 1;
                Ok(b)
            }
            None => Err(Error::header("segment body ended unexpectedly")),
        }
    }

    fn read_u16(&mut self) -> Result<u16> {
        let b = [self.read_u8()?, self.read_u8()?];
        Ok(u16::from_be_bytes(b))
    }

    fn read_slice(&mut self, count: usize) -> Result<&'a [u8]> {
        if self.remaining().len() < count {
            Err(Error::header("segment body ended unexpectedly"))
        } else {
            let slice = &self.remaining()[..count];
            self.position += count;
            Ok(slice)
        }
    }

    fn read_obj<T: AnyBitPattern>(&mut self) -> Result<&'a T> {
        assert_eq!(mem::align_of::<T>(), 1);
        let bytes = self.read_slice(mem::size_of::<T>())?;
        Ok(bytemuck::from_bytes(bytes))
    }

    fn read_objs<T: AnyBitPattern>(&mut self, count: usize) -> Result<&'a [T]> {
        assert_eq!(mem::align_of::<T>(), 1);
        let bytes = self.read_slice(count * mem::size_of::<T>())?;
        Ok(bytemuck::cast_slice(bytes))
    }
}

fn read_dqt(reader: &mut Reader<'_>) -> Result<Dqt> {
    let mut tables = Vec::new();
    while !reader.remaining().is_empty() {
        let PqTq = reader.read_u8()?;
        let Pq = PqTq >> 4;
        let Tq = PqTq & 0xF;
        if Tq > 3 {
            return Err(Error::header(format!(
                "invalid quantization table destination Tq={Tq} (0-3 are allowed)",
            )));
        }
        let mut Qk = [0u16; 64];
        match Pq {
            0 => {
                let bytes = reader.read_slice(64)?;
                for (dst, src) in Qk.iter_mut().zip(bytes) {
                    *dst = u16::from(*src);
                }
            }
            1 => {
                let bytes = reader.read_slice(128)?;
                for (dst, pair) in Qk.iter_mut().zip(bytes.chunks_exact(2)) {
                    *dst = u16::from_be_bytes([pair[0], pair[1]]);
                }
            }
            e => {
                return Err(Error::header(format!(
                    "invalid quantization table precision Pq={e} (0 and 1 are allowed)",
                )))
            }
        }
        tables.push(QuantTableDef { Pq, Tq, Qk });
    }
    Ok(Dqt { tables })
}

fn read_dht<'a>(reader: &mut Reader<'a>) -> Result<Dht<'a>> {
    let mut tables = Vec::new();
    while !reader.remaining().is_empty() {
        let header: &DhtHeader = reader.read_obj()?;
        let values = reader.read_slice(header.num_values())?;
        tables.push(HuffmanTableDef {
            header,
            Vij: values,
        });
    }
    Ok(Dht { tables })
}

fn read_sof<'a>(sof: u8, reader: &mut Reader<'a>) -> Result<Sof<'a>> {
    let P = reader.read_u8()?;
    let Y = reader.read_u16()?;
    let X = reader.read_u16()?;
    let num_components = reader.read_u8()?;
    let components = reader.read_objs::<FrameComponent>(num_components.into())?;
    Ok(Sof {
        sof: SofMarker(sof),
        P,
        Y,
        X,
        components,
    })
}

fn read_sos<'a>(reader: &mut Reader<'a>) -> Result<Sos<'a>> {
    let num_components = reader.read_u8()?;
    let components = reader.read_objs(num_components.into())?;
    let Ss = reader.read_u8()?;
    let Se = reader.read_u8()?;
    let AhAl = reader.read_u8()?;
    Ok(Sos {
        components,
        Ss,
        Se,
        AhAl,
    })
}

fn read_dri(reader: &mut Reader<'_>) -> Result<Dri> {
    Ok(Dri {
        Ri: reader.read_u16()?,
    })
}

fn read_dnl(reader: &mut Reader<'_>) -> Result<Dnl> {
    Ok(Dnl {
        NL: reader.read_u16()?,
    })
}

fn read_com<'a>(reader: &mut Reader<'a>) -> Result<Com<'a>> {
    Ok(Com {
        com: reader.read_slice(reader.remaining().len())?,
    })
}

fn read_app<'a>(marker: u8, reader: &mut Reader<'a>) -> Result<App<'a>> {
    let n = marker - marker::APP0;
    let payload = reader.remaining();

    let kind = match n {
        0 => read_jfif(reader)?.map(AppKind::Jfif),
        1 => payload
            .strip_prefix(b"Exif\0\0")
            .map(AppKind::Exif),
        _ => None,
    };

    // APP payloads are arbitrary; consume whatever the header declared.
    reader.position = reader.buf.len();

    Ok(App { n, kind })
}

fn read_jfif<'a>(reader: &mut Reader<'a>) -> Result<Option<Jfif<'a>>> {
    const JFIF: &[u8] = b"JFIF\0";

    if reader.remaining().len() < JFIF.len() || &reader.remaining()[..JFIF.len()] != JFIF {
        return Ok(None); // Not a JFIF header.
    }
    reader.position += JFIF.len();

    let major_version = reader.read_u8()?;
    let minor_version = reader.read_u8()?;
    let unit = match reader.read_u8()? {
        0 => DensityUnit::None,
        1 => DensityUnit::DotsPerInch,
        2 => DensityUnit::DotsPerCm,
        e => {
            return Err(Error::header(format!(
                "JFIF header specifies invalid density unit {e}"
            )))
        }
    };
    let xdensity = reader.read_u16()?;
    let ydensity = reader.read_u16()?;
    let xthumbnail = reader.read_u8()?;
    let ythumbnail = reader.read_u8()?;
    Ok(Some(Jfif {
        major_version,
        minor_version,
        unit,
        xdensity,
        ydensity,
        xthumbnail,
        ythumbnail,
        thumbnail: reader.read_slice(usize::from(xthumbnail) * usize::from(ythumbnail) * 3)?,
    }))
}

/// A segment of a JPEG file, introduced by a `0xFF 0xXX` marker.
#[derive(Debug)]
pub struct Segment<'a> {
    marker: u8,
    raw_bytes: &'a [u8],
    offset: usize,
    kind: Option<SegmentKind<'a>>,
}

impl<'a> Segment<'a> {
    /// Returns the offset of the segment's `0xFF 0xXX` marker in the input
    /// buffer.
    #[inline]
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Returns the value of the marker byte indicating the type of the
    /// segment.
    #[inline]
    pub fn marker(&self) -> u8 {
        self.marker
    }

    /// The raw bytes making up this segment, excluding the `0xFF 0xXX`
    /// marker and the segment length indication.
    #[inline]
    pub fn raw_bytes(&self) -> &'a [u8] {
        self.raw_bytes
    }

    #[inline]
    pub fn as_segment_kind(&self) -> Option<&SegmentKind<'a>> {
        self.kind.as_ref()
    }
}

/// Enumeration of segment kinds understood by this parser.
#[non_exhaustive]
pub enum SegmentKind<'a> {
    Dqt(Dqt),
    Dht(Dht<'a>),
    Dri(Dri),
    Dnl(Dnl),
    Sof(Sof<'a>),
    Sos(Sos<'a>),
    App(App<'a>),
    Com(Com<'a>),
}

impl<'a> fmt::Debug for SegmentKind<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dqt(x) => x.fmt(f),
            Self::Dht(x) => x.fmt(f),
            Self::Dri(x) => x.fmt(f),
            Self::Dnl(x) => x.fmt(f),
            Self::Sof(x) => x.fmt(f),
            Self::Sos(x) => x.fmt(f),
            Self::App(x) => x.fmt(f),
            Self::Com(x) => x.fmt(f),
        }
    }
}

/// One quantization table definition from a DQT segment.
#[derive(Clone)]
pub struct QuantTableDef {
    Pq: u8,
    Tq: u8,
    Qk: [u16; 64],
}

impl QuantTableDef {
    /// Returns the quantization table element precision (0 = 8-bit values,
    /// 1 = 16-bit values).
    #[inline]
    pub fn Pq(&self) -> u8 {
        self.Pq
    }

    /// Returns the destination identifier (0-3).
    #[inline]
    pub fn Tq(&self) -> u8 {
        self.Tq
    }

    /// Returns the table elements in zigzag order.
    #[inline]
    pub fn Qk(&self) -> &[u16; 64] {
        &self.Qk
    }
}

impl fmt::Debug for QuantTableDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QuantTableDef")
            .field("Pq", &self.Pq)
            .field("Tq", &self.Tq)
            .field("Qk", &self.Qk)
            .finish()
    }
}

/// **D**efine **Q**uantization **T**ables – sets one or more
/// [`QuantTableDef`]s.
#[derive(Debug)]
pub struct Dqt {
    tables: Vec<QuantTableDef>,
}

impl Dqt {
    #[inline]
    pub fn tables(&self) -> impl Iterator<Item = &QuantTableDef> {
        self.tables.iter()
    }
}

#[derive(Clone, Copy, AnyBitPattern)]
#[repr(C)]
struct DhtHeader {
    TcTh: u8,
    Li: [u8; 16],
}

impl DhtHeader {
    fn num_values(&self) -> usize {
        self.Li.iter().map(|l| *l as usize).sum()
    }
}

/// One Huffman table definition from a DHT segment.
pub struct HuffmanTableDef<'a> {
    header: &'a DhtHeader,
    Vij: &'a [u8],
}

impl<'a> HuffmanTableDef<'a> {
    /// Returns the table class (0 = DC, 1 = AC).
    #[inline]
    pub fn Tc(&self) -> u8 {
        self.header.TcTh >> 4
    }

    /// Returns the table destination identifier (0-3).
    #[inline]
    pub fn Th(&self) -> u8 {
        self.header.TcTh & 0xf
    }

    /// Returns an array containing the number of codes of each length.
    #[inline]
    pub fn Li(&self) -> &[u8; 16] {
        &self.header.Li
    }

    /// Returns the values associated with each huffman code.
    #[inline]
    pub fn Vij(&self) -> &[u8] {
        self.Vij
    }
}

impl<'a> fmt::Debug for HuffmanTableDef<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HuffmanTableDef")
            .field("Tc", &self.Tc())
            .field("Th", &self.Th())
            .field("Li", &self.Li())
            .field("Vij", &self.Vij)
            .finish()
    }
}

/// **DHT** Define Huffman Tables – defines one or more
/// [`HuffmanTableDef`]s.
#[derive(Debug)]
pub struct Dht<'a> {
    tables: Vec<HuffmanTableDef<'a>>,
}

impl<'a> Dht<'a> {
    pub fn tables(&self) -> impl Iterator<Item = &HuffmanTableDef<'a>> {
        self.tables.iter()
    }
}

/// **D**efine **R**estart **I**nterval.
///
/// Enables restart intervals and sets the number of MCUs contained in each
/// of them. Restart markers re-align bit decoding to a byte boundary and
/// reset DC prediction, which limits how far data corruption can spread.
#[derive(Clone, Copy)]
pub struct Dri {
    Ri: u16,
}

impl Dri {
    /// Returns the number of MCUs contained in each restart interval.
    #[inline]
    pub fn Ri(&self) -> u16 {
        self.Ri
    }
}

impl fmt::Debug for Dri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dri").field("Ri", &self.Ri).finish()
    }
}

/// **D**efine **N**umber of **L**ines.
///
/// Supplies the true frame height when the frame header declared it as 0
/// (unknown), which streamed producers use when the height is not known up
/// front.
#[derive(Clone, Copy)]
pub struct Dnl {
    NL: u16,
}

impl Dnl {
    /// Returns the number of lines in the frame.
    #[inline]
    pub fn NL(&self) -> u16 {
        self.NL
    }
}

impl fmt::Debug for Dnl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dnl").field("NL", &self.NL).finish()
    }
}

/// **SOF** Start Of Frame.
#[derive(Debug)]
pub struct Sof<'a> {
    /// The SOF marker.
    sof: SofMarker,
    /// Sample precision in bits.
    P: u8,
    Y: u16,
    X: u16,
    components: &'a [FrameComponent],
}

impl<'a> Sof<'a> {
    #[inline]
    pub fn sof(&self) -> SofMarker {
        self.sof
    }

    /// Returns the sample precision in bits.
    #[inline]
    pub fn P(&self) -> u8 {
        self.P
    }

    /// Returns the number of lines in the image (the height of the frame).
    /// 0 means the height arrives later in a DNL segment.
    #[inline]
    pub fn Y(&self) -> u16 {
        self.Y
    }

    /// Returns the number of samples per line (the width of the frame).
    #[inline]
    pub fn X(&self) -> u16 {
        self.X
    }

    #[inline]
    pub fn components(&self) -> &'a [FrameComponent] {
        self.components
    }

    /// Maps the SOF marker to the frame process, rejecting processes this
    /// codec does not implement.
    pub fn process(&self) -> Result<Process> {
        let (mode, differential) = match self.sof {
            SofMarker::SOF0 => (Mode::Baseline, false),
            SofMarker::SOF1 => (Mode::Extended, false),
            SofMarker::SOF2 => (Mode::Progressive, false),
            SofMarker::SOF5 => (Mode::Extended, true),
            SofMarker::SOF6 => (Mode::Progressive, true),
            SofMarker::SOF3 | SofMarker::SOF7 | SofMarker::SOF11 | SofMarker::SOF15 => {
                return Err(Error::header("lossless frames are not supported"))
            }
            SofMarker::SOF9 | SofMarker::SOF10 | SofMarker::SOF13 | SofMarker::SOF14 => {
                return Err(Error::header(
                    "arithmetic-coded frames are not supported",
                ))
            }
            other => return Err(Error::header(format!("unknown process tag {other:?}"))),
        };
        Ok(Process { mode, differential })
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub struct SofMarker(u8);

impl fmt::Debug for SofMarker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::SOF0 => f.write_str("SOF0"),
            Self::SOF1 => f.write_str("SOF1"),
            Self::SOF2 => f.write_str("SOF2"),
            Self::SOF3 => f.write_str("SOF3"),
            Self::SOF5 => f.write_str("SOF5"),
            Self::SOF6 => f.write_str("SOF6"),
            Self::SOF7 => f.write_str("SOF7"),
            Self::SOF9 => f.write_str("SOF9"),
            Self::SOF10 => f.write_str("SOF10"),
            Self::SOF11 => f.write_str("SOF11"),
            Self::SOF13 => f.write_str("SOF13"),
            Self::SOF14 => f.write_str("SOF14"),
            Self::SOF15 => f.write_str("SOF15"),
            _ => f
                .debug_tuple("SofMarker")
                .field(&format_args!("{:02x}", self.0))
                .finish(),
        }
    }
}

impl SofMarker {
    /// Baseline DCT.
    pub const SOF0: Self = Self(0xC0);
    /// Extended Sequential DCT.
    pub const SOF1: Self = Self(0xC1);
    /// Progressive DCT.
    pub const SOF2: Self = Self(0xC2);
    /// Lossless sequential.
    pub const SOF3: Self = Self(0xC3);
    /// Differential sequential DCT.
    pub const SOF5: Self = Self(0xC5);
    /// Differential progressive DCT.
    pub const SOF6: Self = Self(0xC6);
    /// Differential lossless (sequential).
    pub const SOF7: Self = Self(0xC7);
    /// Extended sequential DCT, arithmetic coding.
    pub const SOF9: Self = Self(0xC9);
    /// Progressive DCT, arithmetic coding.
    pub const SOF10: Self = Self(0xCA);
    /// Lossless (sequential), arithmetic coding.
    pub const SOF11: Self = Self(0xCB);
    /// Differential sequential DCT, arithmetic coding.
    pub const SOF13: Self = Self(0xCD);
    /// Differential progressive DCT, arithmetic coding.
    pub const SOF14: Self = Self(0xCE);
    /// Differential lossless (sequential), arithmetic coding.
    pub const SOF15: Self = Self(0xCF);

    pub(crate) fn value(self) -> u8 {
        self.0
    }

    pub(crate) fn for_process(process: Process) -> Self {
        match (process.mode, process.differential) {
            (Mode::Baseline, _) => Self::SOF0,
            (Mode::Extended, false) => Self::SOF1,
            (Mode::Progressive, false) => Self::SOF2,
            (Mode::Extended, true) => Self::SOF5,
            (Mode::Progressive, true) => Self::SOF6,
        }
    }
}

#[derive(Clone, Copy, AnyBitPattern)]
#[repr(C)]
pub struct FrameComponent {
    Ci: u8,
    HiVi: u8,
    Tqi: u8,
}

impl FrameComponent {
    /// Returns this component's component identifier.
    ///
    /// The component identifier is an arbitrary 8-bit value that uniquely
    /// identifies each component. The scan header ([`Sos`]) refers to
    /// components using their identifier.
    #[inline]
    pub fn Ci(&self) -> u8 {
        self.Ci
    }

    /// Returns the horizontal sampling factor for this component.
    #[inline]
    pub fn Hi(&self) -> u8 {
        self.HiVi >> 4
    }

    /// Returns the vertical sampling factor for this component.
    #[inline]
    pub fn Vi(&self) -> u8 {
        self.HiVi & 0xf
    }

    /// Returns the index of the quantization table to use for this
    /// component (0-3).
    #[inline]
    pub fn Tqi(&self) -> u8 {
        self.Tqi
    }
}

impl fmt::Debug for FrameComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameComponent")
            .field("Ci", &self.Ci)
            .field("Hi", &self.Hi())
            .field("Vi", &self.Vi())
            .field("Tqi", &self.Tqi)
            .finish()
    }
}

/// **SOS** Start Of Scan – a scan header. The entropy-coded data follows
/// as separate [`Lex::Entropy`] items.
pub struct Sos<'a> {
    components: &'a [ScanComponent],
    Ss: u8,
    Se: u8,
    AhAl: u8,
}

impl<'a> Sos<'a> {
    #[inline]
    pub fn components(&self) -> &[ScanComponent] {
        self.components
    }

    /// Start of the spectral selection (lowest coded zigzag index).
    #[inline]
    pub fn Ss(&self) -> u8 {
        self.Ss
    }

    /// End of the spectral selection (highest coded zigzag index,
    /// inclusive).
    #[inline]
    pub fn Se(&self) -> u8 {
        self.Se
    }

    /// Successive approximation bit position high.
    #[inline]
    pub fn Ah(&self) -> u8 {
        self.AhAl >> 4
    }

    /// Successive approximation bit position low.
    #[inline]
    pub fn Al(&self) -> u8 {
        self.AhAl & 0xf
    }

    /// Derives the scan descriptor: the wire carries only the spectral
    /// selection and successive approximation bytes, so the coded band and
    /// bit range follow from those plus the frame process.
    pub fn descriptor(&self, process: Process) -> Result<ScanDescriptor> {
        let components = self
            .components
            .iter()
            .map(|c| LayoutScanComponent {
                key: c.Csj(),
                dc_table: c.Tdj(),
                ac_table: c.Taj(),
            })
            .collect();

        let (band, bits) = if process.is_progressive() {
            if self.Ss > 63 || self.Se > 63 || self.Ss > self.Se {
                return Err(Error::header(format!(
                    "invalid spectral selection {}..={}",
                    self.Ss, self.Se,
                )));
            }
            // Ah = 0 on the wire marks a first pass; internally a first
            // pass is `high == low` so that the bit range is always
            // well-ordered.
            let bits = if self.Ah() == 0 {
                Bits {
                    high: self.Al(),
                    low: self.Al(),
                }
            } else {
                Bits {
                    high: self.Ah(),
                    low: self.Al(),
                }
            };
            (
                Band {
                    lo: self.Ss,
                    hi: self.Se + 1,
                },
                bits,
            )
        } else {
            if self.Ss != 0 || self.Se != 63 || self.AhAl != 0 {
                return Err(Error::header("non-baseline scan header in sequential frame"));
            }
            (Band::FULL, Bits::FULL)
        };

        Ok(ScanDescriptor {
            components,
            band,
            bits,
        })
    }
}

impl<'a> fmt::Debug for Sos<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sos")
            .field("components", &self.components)
            .field("Ss", &self.Ss)
            .field("Se", &self.Se)
            .field("Ah", &self.Ah())
            .field("Al", &self.Al())
            .finish()
    }
}

#[derive(Clone, Copy, AnyBitPattern)]
#[repr(C)]
pub struct ScanComponent {
    Csj: u8,
    TdjTaj: u8,
}

impl ScanComponent {
    /// Returns the scan component selector.
    #[inline]
    pub fn Csj(&self) -> u8 {
        self.Csj
    }

    /// Returns the DC entropy coding table destination selector.
    #[inline]
    pub fn Tdj(&self) -> u8 {
        self.TdjTaj >> 4
    }

    /// Returns the AC entropy coding table destination selector.
    #[inline]
    pub fn Taj(&self) -> u8 {
        self.TdjTaj & 0xf
    }
}

impl fmt::Debug for ScanComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScanComponent")
            .field("Csj", &self.Csj)
            .field("Tdj", &self.Tdj())
            .field("Taj", &self.Taj())
            .finish()
    }
}

/// An application-specific segment (`APPn`).
#[derive(Debug)]
pub struct App<'a> {
    n: u8,
    kind: Option<AppKind<'a>>,
}

impl<'a> App<'a> {
    /// Returns the type of APP marker (the `n` in `APPn`), in range
    /// `0..=15`.
    ///
    /// This only partially identifies the payload; recognized payloads
    /// (JFIF in APP0, EXIF in APP1) additionally carry a magic string and
    /// are surfaced via [`App::as_app_kind`].
    #[inline]
    pub fn n(&self) -> u8 {
        self.n
    }

    #[inline]
    pub fn as_app_kind(&self) -> Option<&AppKind<'a>> {
        self.kind.as_ref()
    }
}

/// Enumeration of the known `APPn` payloads understood by this parser.
#[derive(Debug)]
#[non_exhaustive]
pub enum AppKind<'a> {
    Jfif(Jfif<'a>),
    /// An EXIF box (APP1). Carried as raw bytes; tag/IFD decoding is the
    /// business of an external metadata parser.
    Exif(&'a [u8]),
}

#[derive(Debug)]
pub struct Jfif<'a> {
    major_version: u8,
    minor_version: u8,
    unit: DensityUnit,
    xdensity: u16,
    ydensity: u16,
    xthumbnail: u8,
    ythumbnail: u8,
    thumbnail: &'a [u8],
}

impl<'a> Jfif<'a> {
    #[inline]
    pub fn major_version(&self) -> u8 {
        self.major_version
    }

    #[inline]
    pub fn minor_version(&self) -> u8 {
        self.minor_version
    }

    #[inline]
    pub fn unit(&self) -> DensityUnit {
        self.unit
    }

    #[inline]
    pub fn density_x(&self) -> u16 {
        self.xdensity
    }

    #[inline]
    pub fn density_y(&self) -> u16 {
        self.ydensity
    }

    #[inline]
    pub fn thumbnail_width(&self) -> u8 {
        self.xthumbnail
    }

    #[inline]
    pub fn thumbnail_height(&self) -> u8 {
        self.ythumbnail
    }

    #[inline]
    pub fn thumbnail_data(&self) -> &[u8] {
        self.thumbnail
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum DensityUnit {
    None,
    DotsPerInch,
    DotsPerCm,
}

// ---------------------------------------------------------------------------
// Stream serialization (encode side)
// ---------------------------------------------------------------------------

pub(crate) fn put(dest: &mut dyn crate::Destination, bytes: &[u8]) -> Result<()> {
    dest.write(bytes)
        .ok_or_else(|| Error::from("failed to write to destination"))
}

pub(crate) fn write_marker(dest: &mut dyn crate::Destination, m: u8) -> Result<()> {
    put(dest, &[0xFF, m])
}

pub(crate) fn write_segment(dest: &mut dyn crate::Destination, m: u8, body: &[u8]) -> Result<()> {
    let length = body.len() + 2;
    if length > usize::from(u16::MAX) {
        return Err(Error::header(format!(
            "segment body of {} bytes does not fit a marker segment",
            body.len(),
        )));
    }
    put(dest, &[0xFF, m])?;
    put(dest, &(length as u16).to_be_bytes())?;
    put(dest, body)
}

/// Writes entropy-coded bytes, stuffing every literal `0xFF` as `FF 00`.
pub(crate) fn write_entropy(dest: &mut dyn crate::Destination, data: &[u8]) -> Result<()> {
    let mut start = 0;
    for (i, &byte) in data.iter().enumerate() {
        if byte == 0xFF {
            put(dest, &data[start..=i])?;
            put(dest, &[0x00])?;
            start = i + 1;
        }
    }
    put(dest, &data[start..])
}

pub(crate) fn sof_body(
    precision: u8,
    width: u16,
    height: u16,
    components: &[crate::layout::Component],
) -> Vec<u8> {
    let mut body = vec![precision];
    body.extend_from_slice(&height.to_be_bytes());
    body.extend_from_slice(&width.to_be_bytes());
    body.push(components.len() as u8);
    for c in components {
        body.push(c.key);
        body.push((c.factor.0 << 4) | c.factor.1);
        body.push(c.quantization);
    }
    body
}

pub(crate) fn sos_body(desc: &ScanDescriptor) -> Vec<u8> {
    let mut body = vec![desc.components.len() as u8];
    for sc in &desc.components {
        body.push(sc.key);
        body.push((sc.dc_table << 4) | sc.ac_table);
    }
    body.push(desc.band.lo);
    body.push(desc.band.hi - 1);
    let ah = if desc.bits.is_refinement() {
        desc.bits.high
    } else {
        0
    };
    body.push((ah << 4) | desc.bits.low);
    body
}

pub(crate) fn dht_body(class: u8, key: u8, counts: &[u8; 16], values: &[u8]) -> Vec<u8> {
    let mut body = vec![(class << 4) | key];
    body.extend_from_slice(counts);
    body.extend_from_slice(values);
    body
}

pub(crate) fn dqt_body(key: u8, table: &crate::dct::QuantTable) -> Vec<u8> {
    let wide = table.values.iter().any(|&v| v > 0xFF);
    let mut body = vec![(u8::from(wide) << 4) | key];
    for &v in &table.values {
        if wide {
            body.extend_from_slice(&v.to_be_bytes());
        } else {
            body.push(v as u8);
        }
    }
    body
}

pub(crate) fn dri_body(interval: u16) -> Vec<u8> {
    interval.to_be_bytes().to_vec()
}

pub(crate) fn jfif_body(rec: &crate::metadata::JfifRecord) -> Vec<u8> {
    let mut body = b"JFIF\0".to_vec();
    body.push(rec.version.0);
    body.push(rec.version.1);
    body.push(match rec.density.unit {
        DensityUnit::None => 0,
        DensityUnit::DotsPerInch => 1,
        DensityUnit::DotsPerCm => 2,
    });
    body.extend_from_slice(&rec.density.x.to_be_bytes());
    body.extend_from_slice(&rec.density.y.to_be_bytes());
    body.push(0); // no thumbnail
    body.push(0);
    body
}

pub struct Com<'a> {
    com: &'a [u8],
}

impl<'a> Com<'a> {
    #[inline]
    pub fn text(&self) -> &'a [u8] {
        self.com
    }
}

impl<'a> fmt::Debug for Com<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Com(\"{}\")", self.com.escape_ascii())
    }
}
