//! Scan assembly: the stateful engine that ingests tables and scan
//! segments in arrival order and fills the spectral coefficient buffer,
//! plus the mirror-image scan encoders used when producing a stream.

use std::mem;

use crate::bits::{BitReader, BitWriter};
use crate::dct::QuantTable;
use crate::error::{Error, Result};
use crate::file::{Dnl, Dri, HuffmanTableDef, QuantTableDef, Sof, Sos};
use crate::huffman::{self, HuffmanTable};
use crate::image::{component_geometry, CoeffGrid, Spectral, SpectralComponent};
use crate::layout::{Band, Component, Layout, Process, ScanDescriptor};

/// Sentinel in the per-coefficient progress metadata: never coded by any
/// scan.
const NOT_CODED: u8 = 0xFF;

/// Assembly progress of a [`Context`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// No frame header yet. Table segments are accepted (streams commonly
    /// define tables before the frame header).
    AwaitingFrame,
    /// Frame header seen; accepting tables and scan headers.
    ReadingTables,
    /// Inside a scan; accepting entropy data and restart markers.
    ReadingScan,
    /// End of image seen; only [`Context::finish`] is useful now.
    Complete,
}

/// What kind of coefficient pass the active scan performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pass {
    /// Sequential: DC and the full AC band in one pass.
    Full,
    DcFirst,
    DcRefine,
    AcFirst,
    AcRefine,
}

fn classify(process: Process, desc: &ScanDescriptor) -> Pass {
    if !process.is_progressive() {
        Pass::Full
    } else if desc.band.includes_dc() {
        if desc.bits.is_refinement() {
            Pass::DcRefine
        } else {
            Pass::DcFirst
        }
    } else if desc.bits.is_refinement() {
        Pass::AcRefine
    } else {
        Pass::AcFirst
    }
}

struct ScanState {
    desc: ScanDescriptor,
    pass: Pass,
    /// Plane index per scan component.
    comp_index: Vec<usize>,
    dc_pred: Vec<i32>,
    eob_run: u32,
    mcus_done: usize,
    /// `usize::MAX` while the frame height is unknown.
    mcus_total: usize,
    /// MCUs decoded since the last restart marker.
    interval_done: usize,
    restart_count: u32,
    interleaved: bool,
    /// Block-grid width of the single component of a non-interleaved scan.
    blocks_wide: usize,
}

/// The scan assembler.
///
/// Created empty, fed segments in stream order (`push_*`/`begin_scan`/
/// `push_entropy`), and finally converted into the finished coefficient
/// buffer with [`Context::finish`]. Each instance is exclusively owned by
/// one decode; abandoning it mid-stream is always safe because unwritten
/// blocks are zero.
pub struct Context {
    state: State,
    process: Process,
    width: u32,
    /// 0 while unknown (frame declared height 0, DNL pending).
    height: u32,
    components: Vec<Component>,
    grids: Vec<CoeffGrid>,
    /// Successive-approximation progress: per component and zigzag index,
    /// the low bit of the last pass that coded it ([`NOT_CODED`] if none).
    /// Kept as parallel metadata so out-of-order refinement is detected at
    /// scan-header time.
    approx: Vec<[u8; 64]>,
    dc_tables: [Option<HuffmanTable>; 4],
    ac_tables: [Option<HuffmanTable>; 4],
    qtables: [Option<QuantTable>; 4],
    restart_interval: u32,
    scans: Vec<ScanDescriptor>,
    scan: Option<ScanState>,
    mcus_wide: usize,
    mcus_tall: usize,
}

/// Everything a completed assembly hands back to the pipeline.
pub struct DecodedFrame {
    pub layout: Layout,
    pub spectral: Spectral,
    pub qtables: [Option<QuantTable>; 4],
    pub restart_interval: u32,
}

impl Context {
    pub fn new() -> Self {
        Self {
            state: State::AwaitingFrame,
            process: Process::BASELINE,
            width: 0,
            height: 0,
            components: Vec::new(),
            grids: Vec::new(),
            approx: Vec::new(),
            dc_tables: [None, None, None, None],
            ac_tables: [None, None, None, None],
            qtables: [None, None, None, None],
            restart_interval: 0,
            scans: Vec::new(),
            scan: None,
            mcus_wide: 0,
            mcus_tall: 0,
        }
    }

    #[inline]
    pub fn state(&self) -> State {
        self.state
    }

    /// Installs the frame header: fixes the process and component set and
    /// allocates the coefficient grids.
    pub fn push_frame(&mut self, sof: &Sof<'_>) -> Result<()> {
        if self.state != State::AwaitingFrame {
            return Err(Error::header("encountered multiple SOF markers"));
        }
        let process = sof.process()?;
        if process.differential {
            return Err(Error::header("differential frames are not supported"));
        }
        if sof.P() != 8 {
            return Err(Error::header(format!(
                "sample precision of {} bits is not supported",
                sof.P(),
            )));
        }
        if sof.X() == 0 {
            return Err(Error::header("frame width must not be 0"));
        }

        let components: Vec<Component> = sof
            .components()
            .iter()
            .map(|c| Component {
                key: c.Ci(),
                factor: (c.Hi(), c.Vi()),
                quantization: c.Tqi(),
            })
            .collect();
        crate::layout::validate_components(&components)?;

        let width = u32::from(sof.X());
        let height = u32::from(sof.Y());
        let (hmax, vmax) = max_factor(&components);
        self.mcus_wide = ((width + 8 * u32::from(hmax) - 1) / (8 * u32::from(hmax))) as usize;
        self.mcus_tall = if height == 0 {
            0
        } else {
            ((height + 8 * u32::from(vmax) - 1) / (8 * u32::from(vmax))) as usize
        };

        log::trace!(
            "frame: {width}x{height} ({:?}), {} components, {} MCUs per row",
            process,
            components.len(),
            self.mcus_wide,
        );

        self.grids = components
            .iter()
            .map(|c| {
                CoeffGrid::new(
                    self.mcus_wide * usize::from(c.factor.0),
                    self.mcus_tall * usize::from(c.factor.1),
                )
            })
            .collect();
        self.approx = vec![[NOT_CODED; 64]; components.len()];
        self.process = process;
        self.width = width;
        self.height = height;
        self.components = components;
        self.state = State::ReadingTables;
        Ok(())
    }

    /// Installs one Huffman table from a DHT definition, replacing any
    /// table already held by that slot. Fails here, at push time, if the
    /// definition does not form a valid code.
    pub fn push_huffman_table(&mut self, def: &HuffmanTableDef<'_>) -> Result<()> {
        self.between_scans()?;
        let table = HuffmanTable::build(def.Li(), def.Vij())?;
        let slot = usize::from(def.Th());
        if slot > 3 {
            return Err(Error::header(format!(
                "invalid huffman table destination Th={slot} (0-3 are allowed)",
            )));
        }
        match def.Tc() {
            0 => self.dc_tables[slot] = Some(table),
            1 => self.ac_tables[slot] = Some(table),
            e => {
                return Err(Error::header(format!(
                    "invalid table class Tc={e} (only 0 and 1 are valid)",
                )))
            }
        }
        Ok(())
    }

    /// Installs one quantization table, replacing any table already held
    /// by that slot.
    pub fn push_quantization_table(&mut self, def: &QuantTableDef) -> Result<()> {
        self.between_scans()?;
        self.qtables[usize::from(def.Tq())] = Some(QuantTable::new(*def.Qk()));
        Ok(())
    }

    /// Sets the restart interval for subsequent scans.
    pub fn push_restart_interval(&mut self, dri: &Dri) -> Result<()> {
        self.between_scans()?;
        log::trace!("restart interval: {} MCUs", dri.Ri());
        self.restart_interval = u32::from(dri.Ri());
        Ok(())
    }

    /// Supplies the frame height that the frame header declared as
    /// unknown, truncating the already decoded grids to the now-known
    /// number of block rows.
    pub fn push_height(&mut self, dnl: &Dnl) -> Result<()> {
        self.between_scans()?;
        if self.state == State::AwaitingFrame {
            return Err(Error::header("DNL segment before frame header"));
        }
        if self.height != 0 {
            return Err(Error::header(
                "DNL segment for a frame whose height is already known",
            ));
        }
        if dnl.NL() == 0 {
            return Err(Error::header("DNL segment declares height 0"));
        }
        self.height = u32::from(dnl.NL());
        let (_, vmax) = max_factor(&self.components);
        self.mcus_tall =
            ((self.height + 8 * u32::from(vmax) - 1) / (8 * u32::from(vmax))) as usize;
        for (grid, c) in self.grids.iter_mut().zip(&self.components) {
            let rows = self.mcus_tall * usize::from(c.factor.1);
            grid.ensure_rows(rows);
            grid.truncate_rows(rows);
        }
        Ok(())
    }

    /// Starts a scan. Validates the header against the frame, checks that
    /// the tables it references exist, and enforces the high-to-low
    /// bit-plane ordering of successive-approximation passes.
    pub fn begin_scan(&mut self, sos: &Sos<'_>) -> Result<()> {
        self.between_scans()?;
        if self.state == State::AwaitingFrame {
            return Err(Error::header("SOS not preceded by SOF header"));
        }

        let desc = sos.descriptor(self.process)?;
        Layout::validate_scan(self.process, &self.components, &desc)?;

        let mut comp_index = Vec::with_capacity(desc.components.len());
        let needs_dc = desc.band.includes_dc() && !desc.bits.is_refinement();
        let needs_ac = desc.band.hi > 1;
        for sc in &desc.components {
            // Unknown keys were rejected by the layout validation.
            let ci = self.components.iter().position(|c| c.key == sc.key).unwrap();
            comp_index.push(ci);

            if needs_dc && self.dc_tables[usize::from(sc.dc_table)].is_none() {
                return Err(Error::protocol(format!(
                    "scan references undefined DC table {}",
                    sc.dc_table,
                )));
            }
            if needs_ac && self.ac_tables[usize::from(sc.ac_table)].is_none() {
                return Err(Error::protocol(format!(
                    "scan references undefined AC table {}",
                    sc.ac_table,
                )));
            }
        }

        // Successive-approximation bookkeeping: a first pass must hit
        // untouched coefficients, a refinement must continue exactly where
        // the previous pass stopped.
        for &ci in &comp_index {
            let progress = &mut self.approx[ci];
            for z in desc.band.indices() {
                if desc.bits.is_refinement() {
                    if progress[z] != desc.bits.high {
                        return Err(Error::protocol(format!(
                            "out-of-order refinement of component {} coefficient {z} \
                             (expected bit {}, stream carries bit {})",
                            self.components[ci].key, progress[z], desc.bits.high,
                        )));
                    }
                } else if progress[z] != NOT_CODED {
                    return Err(Error::protocol(format!(
                        "component {} coefficient {z} coded twice without refinement",
                        self.components[ci].key,
                    )));
                }
                progress[z] = desc.bits.low;
            }
        }

        let interleaved = desc.components.len() > 1;
        let (mcus_total, blocks_wide) = if interleaved {
            let total = if self.height == 0 {
                usize::MAX
            } else {
                self.mcus_wide * self.mcus_tall
            };
            (total, 0)
        } else {
            // A single-component scan walks that component's own block
            // grid, one block per MCU.
            let ci = comp_index[0];
            let c = &self.components[ci];
            let geo = component_geometry(
                self.width,
                self.height.max(1),
                c.factor,
                max_factor(&self.components),
            );
            let bw = geo.width.div_ceil(8).max(1) as usize;
            let bh = geo.height.div_ceil(8) as usize;
            let total = if self.height == 0 { usize::MAX } else { bw * bh };
            (total, bw)
        };

        log::trace!(
            "scan: {:?} band [{}, {}) bits {}..{}, {} MCUs",
            classify(self.process, &desc),
            desc.band.lo,
            desc.band.hi,
            desc.bits.high,
            desc.bits.low,
            mcus_total,
        );

        let n = desc.components.len();
        self.scan = Some(ScanState {
            pass: classify(self.process, &desc),
            desc,
            comp_index,
            dc_pred: vec![0; n],
            eob_run: 0,
            mcus_done: 0,
            mcus_total,
            interval_done: 0,
            restart_count: 0,
            interleaved,
            blocks_wide,
        });
        self.state = State::ReadingScan;
        Ok(())
    }

    /// Decodes one entropy-coded segment (the data between two restart
    /// markers, or the whole scan when restarts are disabled).
    pub fn push_entropy(&mut self, data: &[u8]) -> Result<()> {
        if self.state != State::ReadingScan {
            return Err(Error::protocol("entropy-coded data outside a scan"));
        }
        let scan = self.scan.as_mut().unwrap();
        let grids = &mut self.grids;
        let components = &self.components;
        let dc_tables = &self.dc_tables;
        let ac_tables = &self.ac_tables;
        let unknown_height = self.height == 0;
        let mcus_wide = self.mcus_wide;
        let quota = if self.restart_interval > 0 {
            self.restart_interval as usize
        } else {
            usize::MAX
        };

        let row_stride = if scan.interleaved {
            mcus_wide
        } else {
            scan.blocks_wide
        };

        let mut r = BitReader::new(data);
        while scan.mcus_done < scan.mcus_total && scan.interval_done < quota {
            if unknown_height && scan.mcus_done % row_stride == 0 && r.bits_remaining() < 8 {
                // The frame height is still open; stop at the last whole
                // MCU row and let the DNL segment settle the row count.
                break;
            }

            let mcu = scan.mcus_done;
            for (si, sc) in scan.desc.components.iter().enumerate() {
                let ci = scan.comp_index[si];
                let dc = sc.dc_table;
                let ac = sc.ac_table;
                let (h, v) = if scan.interleaved {
                    let f = components[ci].factor;
                    (usize::from(f.0), usize::from(f.1))
                } else {
                    (1, 1)
                };
                let (base_x, base_y) = if scan.interleaved {
                    ((mcu % mcus_wide) * h, (mcu / mcus_wide) * v)
                } else {
                    (mcu % scan.blocks_wide, mcu / scan.blocks_wide)
                };

                for by in 0..v {
                    for bx in 0..h {
                        let (ux, uy) = (base_x + bx, base_y + by);
                        if unknown_height {
                            grids[ci].ensure_rows(uy + 1);
                        }
                        let block = grids[ci].block_mut(ux, uy);
                        match scan.pass {
                            Pass::Full => decode_block_full(
                                &mut r,
                                dc_tables[usize::from(dc)].as_ref().unwrap(),
                                ac_tables[usize::from(ac)].as_ref().unwrap(),
                                &mut scan.dc_pred[si],
                                block,
                            )?,
                            Pass::DcFirst => decode_dc_first(
                                &mut r,
                                dc_tables[usize::from(dc)].as_ref().unwrap(),
                                &mut scan.dc_pred[si],
                                scan.desc.bits.low,
                                block,
                            )?,
                            Pass::DcRefine => decode_dc_refine(&mut r, scan.desc.bits.low, block),
                            Pass::AcFirst => decode_ac_first(
                                &mut r,
                                ac_tables[usize::from(ac)].as_ref().unwrap(),
                                scan.desc.band,
                                scan.desc.bits.low,
                                &mut scan.eob_run,
                                block,
                            )?,
                            Pass::AcRefine => decode_ac_refine(
                                &mut r,
                                ac_tables[usize::from(ac)].as_ref().unwrap(),
                                scan.desc.band,
                                scan.desc.bits.low,
                                &mut scan.eob_run,
                                block,
                            )?,
                        }
                    }
                }
            }

            scan.mcus_done += 1;
            scan.interval_done += 1;
        }

        if r.bits_remaining() > 7 {
            log::warn!(
                "{} entropy-coded bits left over after decoding {} MCUs",
                r.bits_remaining(),
                scan.interval_done,
            );
        }
        Ok(())
    }

    /// Handles a restart marker between entropy-coded segments.
    ///
    /// The marker's phase (its low 3 bits) must equal the running restart
    /// count modulo 8; a mismatch means lost or reordered data and is
    /// fatal. On success DC prediction and the end-of-band run reset.
    pub fn push_restart(&mut self, phase: u8) -> Result<()> {
        if self.state != State::ReadingScan {
            return Err(Error::protocol("restart marker outside a scan"));
        }
        let scan = self.scan.as_mut().unwrap();
        let expected = (scan.restart_count % 8) as u8;
        if phase != expected {
            return Err(Error::protocol(format!(
                "restart marker phase {phase} does not match expected phase {expected}",
            )));
        }
        scan.restart_count += 1;

        if self.restart_interval == 0 {
            log::warn!("restart marker in a scan without a restart interval");
        } else if scan.interval_done != self.restart_interval as usize
            && scan.mcus_done < scan.mcus_total
        {
            log::warn!(
                "restart interval held {} MCUs, expected {}",
                scan.interval_done,
                self.restart_interval,
            );
        }
        scan.interval_done = 0;
        scan.eob_run = 0;
        for pred in &mut scan.dc_pred {
            *pred = 0;
        }
        Ok(())
    }

    /// Marks the end of the image. No further pushes are valid.
    pub fn push_end(&mut self) -> Result<()> {
        self.close_scan();
        if self.state == State::AwaitingFrame {
            return Err(Error::header("end of image without a frame header"));
        }
        if self.scans.is_empty() {
            return Err(Error::protocol("end of image without any scan"));
        }
        if self.height == 0 {
            return Err(Error::header(
                "frame height was never defined (missing DNL segment)",
            ));
        }
        self.state = State::Complete;
        Ok(())
    }

    /// Hands the finished coefficient buffer to the caller.
    ///
    /// Also usable before an end-of-image marker was seen (a caller may
    /// stop feeding a truncated progressive stream and render what
    /// arrived), as long as a frame header, a height, and at least one
    /// scan are present.
    pub fn finish(mut self) -> Result<DecodedFrame> {
        self.close_scan();
        if self.state == State::AwaitingFrame {
            return Err(Error::header("cannot finish before a frame header"));
        }
        if self.scans.is_empty() {
            return Err(Error::protocol("cannot finish without any decoded scan"));
        }
        if self.height == 0 {
            return Err(Error::header(
                "frame height was never defined (missing DNL segment)",
            ));
        }

        let layout = Layout::from_stream(self.process, self.components.clone(), self.scans);
        let max = max_factor(&self.components);
        let components = self
            .components
            .iter()
            .zip(self.grids)
            .map(|(c, grid)| {
                let geo = component_geometry(self.width, self.height, c.factor, max);
                SpectralComponent {
                    key: c.key,
                    factor: c.factor,
                    quantization: c.quantization,
                    width: geo.width,
                    height: geo.height,
                    grid,
                }
            })
            .collect();
        Ok(DecodedFrame {
            layout,
            spectral: Spectral::new(self.width, self.height, components),
            qtables: self.qtables,
            restart_interval: self.restart_interval,
        })
    }

    /// Table/interval pushes are legal before the frame and between scans;
    /// arriving during a scan they implicitly end it.
    fn between_scans(&mut self) -> Result<()> {
        match self.state {
            State::ReadingScan => {
                self.close_scan();
                Ok(())
            }
            State::Complete => Err(Error::protocol("push after end of image")),
            _ => Ok(()),
        }
    }

    fn close_scan(&mut self) {
        if let Some(scan) = self.scan.take() {
            if scan.mcus_total != usize::MAX && scan.mcus_done < scan.mcus_total {
                log::warn!(
                    "scan ended after {} of {} MCUs",
                    scan.mcus_done,
                    scan.mcus_total,
                );
            }
            self.scans.push(scan.desc);
            self.state = State::ReadingTables;
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

fn max_factor(components: &[Component]) -> (u8, u8) {
    let h = components.iter().map(|c| c.factor.0).max().unwrap_or(1);
    let v = components.iter().map(|c| c.factor.1).max().unwrap_or(1);
    (h, v)
}

fn decode_amplitude(r: &mut BitReader<'_>, size: u8) -> Result<i16> {
    if size > 15 {
        return Err(Error::protocol(format!("invalid amplitude class {size}")));
    }
    let tail = r.read(size);
    Ok(huffman::extend(size, tail))
}

/// Sequential pass: DC difference plus the full AC run-length coding.
fn decode_block_full(
    r: &mut BitReader<'_>,
    dc: &HuffmanTable,
    ac: &HuffmanTable,
    pred: &mut i32,
    block: &mut [i16; 64],
) -> Result<()> {
    let (size, len) = dc.decode(r.peek16());
    r.consume(len);
    if size > 0 {
        *pred += i32::from(decode_amplitude(r, size)?);
    }
    block[0] = (*pred).clamp(i32::from(i16::MIN), i32::from(i16::MAX)) as i16;

    let mut k = 1;
    while k < 64 {
        let (rs, len) = ac.decode(r.peek16());
        r.consume(len);
        let run = usize::from(rs >> 4);
        let size = rs & 0x0F;
        if size == 0 {
            if run == 15 {
                k += 16;
                continue;
            }
            // End of block. The placeholder symbol for an undefined
            // codeword lands here as well, which is the intended lenient
            // behavior.
            break;
        }
        k += run;
        if k >= 64 {
            return Err(Error::protocol("AC coefficient run past end of block"));
        }
        block[k] = decode_amplitude(r, size)?;
        k += 1;
    }
    Ok(())
}

/// First DC pass of a progressive frame: differential, shifted up by the
/// point transform.
fn decode_dc_first(
    r: &mut BitReader<'_>,
    dc: &HuffmanTable,
    pred: &mut i32,
    low: u8,
    block: &mut [i16; 64],
) -> Result<()> {
    let (size, len) = dc.decode(r.peek16());
    r.consume(len);
    if size > 0 {
        *pred += i32::from(decode_amplitude(r, size)?);
    }
    let value = (*pred << low).clamp(i32::from(i16::MIN), i32::from(i16::MAX));
    block[0] = value as i16;
    Ok(())
}

/// DC refinement: one correction bit per block.
fn decode_dc_refine(r: &mut BitReader<'_>, low: u8, block: &mut [i16; 64]) {
    if r.read_bit() != 0 {
        block[0] |= 1 << low;
    }
}

/// First AC pass over a spectral band, with end-of-band runs spanning
/// blocks.
fn decode_ac_first(
    r: &mut BitReader<'_>,
    ac: &HuffmanTable,
    band: Band,
    low: u8,
    eob_run: &mut u32,
    block: &mut [i16; 64],
) -> Result<()> {
    if *eob_run > 0 {
        // This block is inside an end-of-band run: its band is all zero.
        *eob_run -= 1;
        return Ok(());
    }

    let hi = usize::from(band.hi);
    let mut k = usize::from(band.lo);
    while k < hi {
        let (rs, len) = ac.decode(r.peek16());
        r.consume(len);
        let run = usize::from(rs >> 4);
        let size = rs & 0x0F;
        if size == 0 {
            if run == 15 {
                k += 16;
                continue;
            }
            // EOBn: run encodes the binade of the block count.
            *eob_run = (1 << run) - 1;
            if run > 0 {
                *eob_run += u32::from(r.read(run as u8));
            }
            break;
        }
        k += run;
        if k >= hi {
            return Err(Error::protocol("AC coefficient run past end of band"));
        }
        let value = i32::from(decode_amplitude(r, size)?) << low;
        block[k] = value.clamp(i32::from(i16::MIN), i32::from(i16::MAX)) as i16;
        k += 1;
    }
    Ok(())
}

/// AC refinement over a spectral band: correction bits for known
/// coefficients, run/sign codes for newly significant ones.
fn decode_ac_refine(
    r: &mut BitReader<'_>,
    ac: &HuffmanTable,
    band: Band,
    low: u8,
    eob_run: &mut u32,
    block: &mut [i16; 64],
) -> Result<()> {
    let plus = 1i16 << low;
    let minus = -1i16 << low;
    let hi = usize::from(band.hi);
    let mut k = usize::from(band.lo);

    fn correct(r: &mut BitReader<'_>, coef: &mut i16, plus: i16, minus: i16) {
        if r.read_bit() != 0 {
            if *coef > 0 {
                *coef += plus;
            } else {
                *coef += minus;
            }
        }
    }

    if *eob_run > 0 {
        // Inside an end-of-band run only the known-nonzero coefficients
        // receive correction bits.
        while k < hi {
            if block[k] != 0 {
                correct(r, &mut block[k], plus, minus);
            }
            k += 1;
        }
        *eob_run -= 1;
        return Ok(());
    }

    while k < hi {
        let (rs, len) = ac.decode(r.peek16());
        r.consume(len);
        let run = usize::from(rs >> 4);
        let size = rs & 0x0F;
        match size {
            0 => {
                if run == 15 {
                    // Zero-run-length: pass 16 zero-history positions,
                    // correcting nonzero ones along the way.
                    let mut zeros = 16;
                    while k < hi && zeros > 0 {
                        if block[k] != 0 {
                            correct(r, &mut block[k], plus, minus);
                        } else {
                            zeros -= 1;
                        }
                        k += 1;
                    }
                } else {
                    *eob_run = (1 << run) - 1;
                    if run > 0 {
                        *eob_run += u32::from(r.read(run as u8));
                    }
                    while k < hi {
                        if block[k] != 0 {
                            correct(r, &mut block[k], plus, minus);
                        }
                        k += 1;
                    }
                    return Ok(());
                }
            }
            1 => {
                // A newly significant coefficient: sign first, then walk
                // over `run` zero-history positions to its slot.
                let value = if r.read_bit() != 0 { plus } else { minus };
                let mut zeros = run;
                loop {
                    if k >= hi {
                        return Err(Error::protocol(
                            "refinement run past end of band",
                        ));
                    }
                    if block[k] != 0 {
                        correct(r, &mut block[k], plus, minus);
                    } else if zeros == 0 {
                        block[k] = value;
                        k += 1;
                        break;
                    } else {
                        zeros -= 1;
                    }
                    k += 1;
                }
            }
            _ => {
                return Err(Error::protocol(
                    "invalid amplitude class in AC refinement scan",
                ))
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Scan encoding
// ---------------------------------------------------------------------------

/// Pending end-of-band state of a progressive AC encoder: the run length
/// and the correction bits buffered while the run was open.
struct EobState {
    run: u32,
    pending: Vec<u8>,
    /// Longest run the scan's AC table can code in one symbol. The Annex K
    /// example tables only define the plain end-of-band symbol, capping
    /// runs at 1; optimized tables reach 32767.
    limit: u32,
}

impl EobState {
    fn new() -> Self {
        Self {
            run: 0,
            pending: Vec::new(),
            limit: 1,
        }
    }

    fn for_table(ac: &HuffmanTable) -> Self {
        let mut limit = 1;
        for r in 1..=14u8 {
            if ac.encode(r << 4).is_err() {
                break;
            }
            limit = (1 << (r + 1)) - 1;
        }
        Self {
            run: 0,
            pending: Vec::new(),
            limit,
        }
    }

    /// Counts one more all-zero band into the run, flushing first when the
    /// run would outgrow what the table can express.
    fn extend(&mut self, w: &mut BitWriter, ac: &HuffmanTable) -> Result<()> {
        if self.run == self.limit {
            self.flush(w, ac)?;
        }
        self.run += 1;
        Ok(())
    }

    fn flush(&mut self, w: &mut BitWriter, ac: &HuffmanTable) -> Result<()> {
        if self.run > 0 {
            let r = 31 - self.run.leading_zeros();
            let (code, len) = ac.encode((r as u8) << 4)?;
            w.write_bits(code, len);
            if r > 0 {
                w.write_bits((self.run - (1 << r)) as u16, r as u8);
            }
            self.run = 0;
        }
        for &bit in &self.pending {
            w.write_bits(bit.into(), 1);
        }
        self.pending.clear();
        Ok(())
    }
}

/// Encodes one scan of `spectral` into entropy-coded segments, one per
/// restart interval (a single segment when restarts are disabled). The
/// caller interleaves restart markers between the segments.
pub(crate) fn encode_scan(
    spectral: &Spectral,
    layout: &Layout,
    desc: &ScanDescriptor,
    dc_tables: &[Option<HuffmanTable>; 4],
    ac_tables: &[Option<HuffmanTable>; 4],
    restart_interval: usize,
) -> Result<Vec<Vec<u8>>> {
    let pass = classify(layout.process(), desc);
    let comp_index: Vec<usize> = desc
        .components
        .iter()
        .map(|sc| layout.plane_index(sc.key).unwrap())
        .collect();
    let interleaved = desc.components.len() > 1;
    let (hmax, vmax) = layout.max_factor();
    let mcus_wide =
        ((spectral.width() + 8 * u32::from(hmax) - 1) / (8 * u32::from(hmax))) as usize;
    let mcus_tall =
        ((spectral.height() + 8 * u32::from(vmax) - 1) / (8 * u32::from(vmax))) as usize;

    let (mcus_total, blocks_wide) = if interleaved {
        (mcus_wide * mcus_tall, 0)
    } else {
        let comp = &spectral.components()[comp_index[0]];
        let bw = comp.width.div_ceil(8) as usize;
        let bh = comp.height.div_ceil(8) as usize;
        (bw * bh, bw)
    };

    let mut segments = Vec::new();
    let mut w = BitWriter::new();
    let mut dc_pred = vec![0i32; desc.components.len()];
    let mut eob = if matches!(pass, Pass::AcFirst | Pass::AcRefine) {
        let ac = ac_tables[usize::from(desc.components[0].ac_table)]
            .as_ref()
            .unwrap();
        EobState::for_table(ac)
    } else {
        EobState::new()
    };

    for mcu in 0..mcus_total {
        if restart_interval > 0 && mcu > 0 && mcu % restart_interval == 0 {
            if matches!(pass, Pass::AcFirst | Pass::AcRefine) {
                let ac = ac_tables[usize::from(desc.components[0].ac_table)]
                    .as_ref()
                    .unwrap();
                eob.flush(&mut w, ac)?;
            }
            segments.push(mem::replace(&mut w, BitWriter::new()).flush());
            for pred in &mut dc_pred {
                *pred = 0;
            }
        }

        for (si, sc) in desc.components.iter().enumerate() {
            let comp = &spectral.components()[comp_index[si]];
            let (h, v) = if interleaved {
                (usize::from(comp.factor.0), usize::from(comp.factor.1))
            } else {
                (1, 1)
            };
            let (base_x, base_y) = if interleaved {
                ((mcu % mcus_wide) * h, (mcu / mcus_wide) * v)
            } else {
                (mcu % blocks_wide, mcu / blocks_wide)
            };

            for by in 0..v {
                for bx in 0..h {
                    let block = comp.grid.block(base_x + bx, base_y + by);
                    match pass {
                        Pass::Full => encode_block_full(
                            &mut w,
                            dc_tables[usize::from(sc.dc_table)].as_ref().unwrap(),
                            ac_tables[usize::from(sc.ac_table)].as_ref().unwrap(),
                            &mut dc_pred[si],
                            block,
                        )?,
                        Pass::DcFirst => encode_dc_first(
                            &mut w,
                            dc_tables[usize::from(sc.dc_table)].as_ref().unwrap(),
                            &mut dc_pred[si],
                            desc.bits.low,
                            block,
                        )?,
                        Pass::DcRefine => {
                            w.write_bits(((block[0] >> desc.bits.low) & 1) as u16, 1);
                        }
                        Pass::AcFirst => encode_ac_first(
                            &mut w,
                            ac_tables[usize::from(sc.ac_table)].as_ref().unwrap(),
                            desc.band,
                            desc.bits.low,
                            &mut eob,
                            block,
                        )?,
                        Pass::AcRefine => encode_ac_refine(
                            &mut w,
                            ac_tables[usize::from(sc.ac_table)].as_ref().unwrap(),
                            desc.band,
                            desc.bits.low,
                            &mut eob,
                            block,
                        )?,
                    }
                }
            }
        }
    }

    if matches!(pass, Pass::AcFirst | Pass::AcRefine) {
        let ac = ac_tables[usize::from(desc.components[0].ac_table)]
            .as_ref()
            .unwrap();
        eob.flush(&mut w, ac)?;
    }
    segments.push(w.flush());
    Ok(segments)
}

fn encode_amplitude(w: &mut BitWriter, dc: &HuffmanTable, value: i16) -> Result<()> {
    if value == 0 {
        let (code, len) = dc.encode(0)?;
        w.write_bits(code, len);
    } else {
        let (size, tail) = huffman::compact(value);
        let (code, len) = dc.encode(size)?;
        w.write_bits(code, len);
        w.write_bits(tail, size);
    }
    Ok(())
}

fn encode_block_full(
    w: &mut BitWriter,
    dc: &HuffmanTable,
    ac: &HuffmanTable,
    pred: &mut i32,
    block: &[i16; 64],
) -> Result<()> {
    let value = i32::from(block[0]);
    let diff = value - *pred;
    *pred = value;
    encode_amplitude(w, dc, diff as i16)?;

    let mut run = 0u8;
    for &coef in &block[1..] {
        if coef == 0 {
            run += 1;
            continue;
        }
        while run >= 16 {
            let (code, len) = ac.encode(0xF0)?;
            w.write_bits(code, len);
            run -= 16;
        }
        let (size, tail) = huffman::compact(coef);
        let (code, len) = ac.encode((run << 4) | size)?;
        w.write_bits(code, len);
        w.write_bits(tail, size);
        run = 0;
    }
    if run > 0 {
        let (code, len) = ac.encode(0x00)?;
        w.write_bits(code, len);
    }
    Ok(())
}

fn encode_dc_first(
    w: &mut BitWriter,
    dc: &HuffmanTable,
    pred: &mut i32,
    low: u8,
    block: &[i16; 64],
) -> Result<()> {
    let value = i32::from(block[0]) >> low;
    let diff = value - *pred;
    *pred = value;
    encode_amplitude(w, dc, diff as i16)
}

/// Point transform of an AC coefficient: division by `2^low` truncating
/// toward zero.
fn point_transform(coef: i16, low: u8) -> i16 {
    if coef >= 0 {
        coef >> low
    } else {
        -((-coef) >> low)
    }
}

fn encode_ac_first(
    w: &mut BitWriter,
    ac: &HuffmanTable,
    band: Band,
    low: u8,
    eob: &mut EobState,
    block: &[i16; 64],
) -> Result<()> {
    let range = band.indices();
    if block[range.clone()].iter().all(|&c| point_transform(c, low) == 0) {
        return eob.extend(w, ac);
    }

    eob.flush(w, ac)?;
    let mut run = 0u8;
    for k in range {
        let value = point_transform(block[k], low);
        if value == 0 {
            run += 1;
            continue;
        }
        while run >= 16 {
            let (code, len) = ac.encode(0xF0)?;
            w.write_bits(code, len);
            run -= 16;
        }
        let (size, tail) = huffman::compact(value);
        let (code, len) = ac.encode((run << 4) | size)?;
        w.write_bits(code, len);
        w.write_bits(tail, size);
        run = 0;
    }
    if run > 0 {
        // Trailing zeros of this block start a new end-of-band run.
        eob.run = 1;
    }
    Ok(())
}

fn encode_ac_refine(
    w: &mut BitWriter,
    ac: &HuffmanTable,
    band: Band,
    low: u8,
    eob: &mut EobState,
    block: &[i16; 64],
) -> Result<()> {
    let range = band.indices();

    // Magnitudes at this bit plane; a value of exactly 1 became visible in
    // this pass and needs a run/sign code, larger values only need their
    // next correction bit.
    let mut magnitude = [0u16; 64];
    let mut last_new = None;
    for k in range.clone() {
        magnitude[k] = block[k].unsigned_abs() >> low;
        if magnitude[k] == 1 {
            last_new = Some(k);
        }
    }

    let mut run = 0usize;
    let mut corrections: Vec<u8> = Vec::new();
    for k in range {
        let mag = magnitude[k];
        if mag == 0 {
            run += 1;
            continue;
        }
        // Zero-run codes are only needed ahead of another newly
        // significant coefficient; otherwise the run folds into the
        // end-of-band run.
        while run > 15 && last_new.is_some_and(|e| k <= e) {
            eob.flush(w, ac)?;
            let (code, len) = ac.encode(0xF0)?;
            w.write_bits(code, len);
            run -= 16;
            for &bit in &corrections {
                w.write_bits(bit.into(), 1);
            }
            corrections.clear();
        }
        if mag > 1 {
            corrections.push((mag & 1) as u8);
            continue;
        }
        eob.flush(w, ac)?;
        let (code, len) = ac.encode(((run as u8) << 4) | 1)?;
        w.write_bits(code, len);
        w.write_bits(u16::from(block[k] > 0), 1);
        for &bit in &corrections {
            w.write_bits(bit.into(), 1);
        }
        corrections.clear();
        run = 0;
    }

    if run > 0 || !corrections.is_empty() {
        eob.extend(w, ac)?;
        eob.pending.extend_from_slice(&corrections);
        if eob.pending.len() > 937 {
            eob.flush(w, ac)?;
        }
    }
    Ok(())
}
