use anyhow::bail;

use crate::bits::{BitReader, BitWriter};
use crate::color::{Gray8, Ycbcr8};
use crate::dct::QuantTable;
use crate::file::{self, marker, DensityUnit};
use crate::huffman::HuffmanTable;
use crate::image::Rectangular;
use crate::layout::{Band, Bits, Component, ScanComponent, ScanDescriptor};
use crate::metadata::{Density, ExifRecord, JfifRecord, MetadataRecord};
use crate::{decode, tables, Advance, Decoder, Encoder, ErrorKind, Layout};

const ABS_TOLERANCE: u8 = 3;

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn compare(expected: &[u8], actual: &[u8], channels: usize, width: usize) -> anyhow::Result<()> {
    assert_eq!(expected.len(), actual.len());
    for (i, (e, a)) in expected.iter().zip(actual).enumerate() {
        if e.abs_diff(*a) > ABS_TOLERANCE {
            let pixel = i / channels;
            bail!(
                "sample mismatch at {},{} channel {}: expected approx {:#04x} got {:#04x}",
                pixel % width,
                pixel / width,
                i % channels,
                e,
                a,
            );
        }
    }
    Ok(())
}

fn gray_gradient(width: u32, height: u32) -> Vec<u8> {
    (0..width as usize * height as usize)
        .map(|i| ((i * 7) % 251) as u8)
        .collect()
}

fn color_pattern(width: u32, height: u32) -> Vec<[u8; 3]> {
    (0..width as usize * height as usize)
        .map(|i| {
            let x = i % width as usize;
            let y = i / width as usize;
            [
                ((x * 13 + y * 5) % 256) as u8,
                ((x * 3 + 60) % 256) as u8,
                ((y * 11 + 128) % 256) as u8,
            ]
        })
        .collect()
}

/// A hand-written 8x8 grayscale stream whose single block holds only the
/// DC coefficient 8 under an all-ones quantization table: every output
/// sample must be exactly 8/8 + 128 = 129.
#[test]
fn known_stream_decodes_to_reference() {
    init_logger();

    let components = vec![Component {
        key: 1,
        factor: (1, 1),
        quantization: 0,
    }];
    let scan = ScanDescriptor {
        components: vec![ScanComponent {
            key: 1,
            dc_table: 0,
            ac_table: 0,
        }],
        band: Band::FULL,
        bits: Bits::FULL,
    };

    let mut jpeg: Vec<u8> = Vec::new();
    file::write_marker(&mut jpeg, marker::SOI).unwrap();
    file::write_segment(
        &mut jpeg,
        marker::DQT,
        &file::dqt_body(0, &QuantTable::flat(1)),
    )
    .unwrap();
    file::write_segment(&mut jpeg, 0xC0, &file::sof_body(8, 8, 8, &components)).unwrap();
    file::write_segment(
        &mut jpeg,
        marker::DHT,
        &file::dht_body(0, 0, &tables::LUMA_DC.counts, tables::LUMA_DC.values),
    )
    .unwrap();
    file::write_segment(
        &mut jpeg,
        marker::DHT,
        &file::dht_body(1, 0, &tables::LUMA_AC.counts, tables::LUMA_AC.values),
    )
    .unwrap();
    file::write_segment(&mut jpeg, marker::SOS, &file::sos_body(&scan)).unwrap();
    // DC difference +8 (class 4, code 101, tail 1000), end-of-block
    // (1010), 1-padded: 1011 0001 0101 1111.
    jpeg.extend([0xB1, 0x5F]);
    file::write_marker(&mut jpeg, marker::EOI).unwrap();

    let image = decode(&jpeg).unwrap();
    assert_eq!((image.width(), image.height()), (8, 8));
    let raster = image.to_raster(true).unwrap();
    assert!(raster.samples().iter().all(|&s| s == 129));
}

#[test]
fn baseline_gray_roundtrip() {
    init_logger();

    let pixels = gray_gradient(16, 16);
    let raster = Rectangular::pack::<Gray8>(16, 16, &pixels).unwrap();

    let mut encoder = Encoder::new(Layout::baseline_gray());
    encoder.set_quantization_table(0, QuantTable::flat(1));
    let jpeg = encoder.encode_to_vec(&raster).unwrap();

    let image = decode(&jpeg).unwrap();
    assert_eq!((image.width(), image.height()), (16, 16));
    let out = image.to_raster(true).unwrap();
    let decoded = out.unpack::<Gray8>().unwrap();
    compare(&pixels, &decoded, 1, 16).unwrap();
}

#[test]
fn baseline_color_roundtrip_and_determinism() {
    init_logger();

    let pixels = color_pattern(24, 17);
    let raster = Rectangular::pack::<Ycbcr8>(24, 17, &pixels).unwrap();

    let mut encoder = Encoder::new(Layout::baseline_ycbcr(1, 1).unwrap());
    encoder.set_quantization_table(0, QuantTable::flat(1));
    encoder.set_quantization_table(1, QuantTable::flat(1));
    let jpeg = encoder.encode_to_vec(&raster).unwrap();

    let first = decode(&jpeg).unwrap().to_raster(true).unwrap();
    let second = decode(&jpeg).unwrap().to_raster(true).unwrap();
    assert_eq!(first.samples(), second.samples(), "decode must be deterministic");

    let decoded = first.unpack::<Ycbcr8>().unwrap();
    let flat: Vec<u8> = decoded.iter().flatten().copied().collect();
    let expected: Vec<u8> = pixels.iter().flatten().copied().collect();
    compare(&expected, &flat, 3, 24).unwrap();
}

#[test]
fn subsampled_constant_color() {
    init_logger();

    let pixels = vec![[90u8, 120, 200]; 20 * 12];
    let raster = Rectangular::pack::<Ycbcr8>(20, 12, &pixels).unwrap();

    let mut encoder = Encoder::new(Layout::baseline_ycbcr(2, 2).unwrap());
    encoder.set_quantization_table(0, QuantTable::flat(1));
    encoder.set_quantization_table(1, QuantTable::flat(1));
    let jpeg = encoder.encode_to_vec(&raster).unwrap();

    let image = decode(&jpeg).unwrap();
    assert_eq!((image.width(), image.height()), (20, 12));
    let decoded = image.to_raster(true).unwrap();
    let expected: Vec<u8> = pixels.iter().flatten().copied().collect();
    compare(&expected, decoded.samples(), 3, 20).unwrap();
}

#[test]
fn restart_intervals_roundtrip() {
    init_logger();

    let pixels = gray_gradient(32, 8);
    let raster = Rectangular::pack::<Gray8>(32, 8, &pixels).unwrap();

    let mut encoder = Encoder::new(Layout::baseline_gray());
    encoder.set_quantization_table(0, QuantTable::flat(1));
    encoder.set_restart_interval(1);
    let jpeg = encoder.encode_to_vec(&raster).unwrap();

    // 4 MCUs with an interval of 1 produce restart markers 0, 1, 2.
    for phase in 0..3u8 {
        assert!(
            jpeg.windows(2).any(|w| w == [0xFF, 0xD0 + phase]),
            "missing RST{phase}",
        );
    }

    let decoded = decode(&jpeg).unwrap().to_raster(true).unwrap();
    compare(&pixels, decoded.samples(), 1, 32).unwrap();
}

#[test]
fn corrupted_restart_phase_is_fatal() {
    init_logger();

    let pixels = gray_gradient(32, 8);
    let raster = Rectangular::pack::<Gray8>(32, 8, &pixels).unwrap();

    let mut encoder = Encoder::new(Layout::baseline_gray());
    encoder.set_restart_interval(1);
    let mut jpeg = encoder.encode_to_vec(&raster).unwrap();

    let rst = jpeg
        .windows(2)
        .position(|w| w == [0xFF, 0xD0])
        .expect("stream should contain RST0");
    jpeg[rst + 1] = 0xD3;

    let err = decode(&jpeg).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Protocol);
}

#[test]
fn progressive_matches_baseline() {
    init_logger();

    let pixels = color_pattern(24, 17);
    let raster = Rectangular::pack::<Ycbcr8>(24, 17, &pixels).unwrap();

    let mut baseline = Encoder::new(Layout::baseline_ycbcr(1, 1).unwrap());
    baseline.set_quantization_table(0, QuantTable::flat(1));
    baseline.set_quantization_table(1, QuantTable::flat(1));
    let mut progressive = Encoder::new(Layout::progressive_ycbcr(1, 1).unwrap());
    progressive.set_quantization_table(0, QuantTable::flat(1));
    progressive.set_quantization_table(1, QuantTable::flat(1));

    let jpeg_baseline = baseline.encode_to_vec(&raster).unwrap();
    let jpeg_progressive = progressive.encode_to_vec(&raster).unwrap();

    // Entropy coding is lossless, so both scan scripts must reconstruct
    // the identical coefficient buffer and therefore identical samples.
    let from_baseline = decode(&jpeg_baseline).unwrap().to_raster(true).unwrap();
    let from_progressive = decode(&jpeg_progressive).unwrap().to_raster(true).unwrap();
    assert_eq!(from_baseline.samples(), from_progressive.samples());

    let expected: Vec<u8> = pixels.iter().flatten().copied().collect();
    compare(&expected, from_progressive.samples(), 3, 24).unwrap();
}

#[test]
fn progressive_subsampled_roundtrip() {
    init_logger();

    let pixels = vec![[200u8, 40, 90]; 20 * 12];
    let raster = Rectangular::pack::<Ycbcr8>(20, 12, &pixels).unwrap();

    let mut encoder = Encoder::new(Layout::progressive_ycbcr(2, 2).unwrap());
    encoder.set_quantization_table(0, QuantTable::flat(1));
    encoder.set_quantization_table(1, QuantTable::flat(1));
    let jpeg = encoder.encode_to_vec(&raster).unwrap();

    let decoded = decode(&jpeg).unwrap().to_raster(true).unwrap();
    let expected: Vec<u8> = pixels.iter().flatten().copied().collect();
    compare(&expected, decoded.samples(), 3, 20).unwrap();
}

#[test]
fn streaming_decode_one_byte_at_a_time() {
    init_logger();

    let pixels = gray_gradient(16, 8);
    let raster = Rectangular::pack::<Gray8>(16, 8, &pixels).unwrap();
    let jpeg = Encoder::new(Layout::baseline_gray())
        .encode_to_vec(&raster)
        .unwrap();

    let mut decoder = Decoder::new();
    let mut available = 0;
    loop {
        match decoder.advance(&jpeg[..available]).unwrap() {
            Advance::Complete => break,
            Advance::NeedBytes(_) => {
                assert!(available < jpeg.len(), "decoder starved on a complete stream");
                available += 1;
            }
        }
    }

    let streamed = decoder.finish().unwrap().to_raster(true).unwrap();
    let oneshot = decode(&jpeg).unwrap().to_raster(true).unwrap();
    assert_eq!(streamed.samples(), oneshot.samples());
}

#[test]
fn metadata_passthrough() {
    init_logger();

    let records = vec![
        MetadataRecord::Jfif(JfifRecord {
            version: (1, 2),
            density: Density {
                x: 72,
                y: 72,
                unit: DensityUnit::DotsPerInch,
            },
        }),
        MetadataRecord::Exif(ExifRecord::new(vec![0x4D, 0x4D, 0x00, 0x2A])),
        MetadataRecord::Comment(b"hello".to_vec()),
        MetadataRecord::App {
            n: 5,
            bytes: vec![1, 2, 3],
        },
    ];

    let pixels = gray_gradient(8, 8);
    let raster = Rectangular::pack::<Gray8>(8, 8, &pixels).unwrap();
    let mut encoder = Encoder::new(Layout::baseline_gray());
    for record in &records {
        encoder.push_metadata(record.clone());
    }
    let jpeg = encoder.encode_to_vec(&raster).unwrap();

    let image = decode(&jpeg).unwrap();
    assert_eq!(image.metadata(), &records[..]);
}

#[test]
fn height_redefinition() {
    init_logger();

    let pixels = gray_gradient(16, 16);
    let raster = Rectangular::pack::<Gray8>(16, 16, &pixels).unwrap();
    let mut encoder = Encoder::new(Layout::baseline_gray());
    encoder.set_quantization_table(0, QuantTable::flat(1));
    let jpeg = encoder.encode_to_vec(&raster).unwrap();
    let reference = decode(&jpeg).unwrap().to_raster(true).unwrap();

    // Declare the height as unknown and supply it via a DNL segment
    // instead.
    let sof = jpeg
        .windows(2)
        .position(|w| w == [0xFF, 0xC0])
        .expect("stream should contain SOF0");
    let mut hacked = jpeg.clone();
    hacked[sof + 5] = 0;
    hacked[sof + 6] = 0;
    assert_eq!(&hacked[hacked.len() - 2..], [0xFF, 0xD9]);
    let eoi = hacked.len() - 2;
    hacked.splice(eoi..eoi, [0xFF, 0xDC, 0x00, 0x04, 0x00, 16]);

    let image = decode(&hacked).unwrap();
    assert_eq!((image.width(), image.height()), (16, 16));
    assert_eq!(image.to_raster(true).unwrap().samples(), reference.samples());
}

#[test]
fn out_of_order_refinement_is_fatal() {
    init_logger();

    let components = vec![Component {
        key: 1,
        factor: (1, 1),
        quantization: 0,
    }];
    let dc_scan = |high: u8, low: u8| ScanDescriptor {
        components: vec![ScanComponent {
            key: 1,
            dc_table: 0,
            ac_table: 0,
        }],
        band: Band::DC,
        bits: Bits { high, low },
    };

    let mut jpeg: Vec<u8> = Vec::new();
    file::write_marker(&mut jpeg, marker::SOI).unwrap();
    file::write_segment(
        &mut jpeg,
        marker::DQT,
        &file::dqt_body(0, &QuantTable::flat(1)),
    )
    .unwrap();
    file::write_segment(&mut jpeg, 0xC2, &file::sof_body(8, 8, 8, &components)).unwrap();
    file::write_segment(
        &mut jpeg,
        marker::DHT,
        &file::dht_body(0, 0, &tables::LUMA_DC.counts, tables::LUMA_DC.values),
    )
    .unwrap();
    // First DC pass at bit 1: a zero difference is code 00, 1-padded.
    file::write_segment(&mut jpeg, marker::SOS, &file::sos_body(&dc_scan(1, 1))).unwrap();
    jpeg.push(0x3F);
    // Refinement claiming to transmit bit 2, but bit 1 was already sent.
    file::write_segment(&mut jpeg, marker::SOS, &file::sos_body(&dc_scan(2, 1))).unwrap();
    jpeg.push(0xFF);
    jpeg.push(0x00);
    file::write_marker(&mut jpeg, marker::EOI).unwrap();

    let err = decode(&jpeg).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Protocol);
}

#[test]
fn huffman_roundtrip_random_sequences() {
    let spec = tables::LUMA_AC;
    let table = HuffmanTable::build(&spec.counts, spec.values).unwrap();

    for &count in &[16usize, 256, 4096, 65536] {
        let mut rng = fastrand::Rng::with_seed(count as u64);
        let symbols: Vec<u8> = (0..count)
            .map(|_| spec.values[rng.usize(..spec.values.len())])
            .collect();

        let mut writer = BitWriter::new();
        for &symbol in &symbols {
            let (code, len) = table.encode(symbol).unwrap();
            writer.write_bits(code, len);
        }
        let bytes = writer.flush();

        let mut reader = BitReader::new(&bytes);
        for &symbol in &symbols {
            let (decoded, len) = table.decode(reader.peek16());
            reader.consume(len);
            assert_eq!(decoded, symbol, "sequence length {count}");
        }
    }
}
