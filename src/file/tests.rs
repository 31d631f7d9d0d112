use std::fmt::Write;

use expect_test::{expect, Expect};

use super::{Lex, Lexer, SegmentKind, Truncation};

fn dump(jpeg: &[u8]) -> String {
    let mut out = String::new();
    let mut lexer = Lexer::new();
    loop {
        match lexer.next(jpeg) {
            Ok(Lex::Segment(segment)) => {
                write!(
                    out,
                    "{:04X} [FF {:02X}] ",
                    segment.offset(),
                    segment.marker(),
                )
                .unwrap();

                match segment.as_segment_kind() {
                    Some(kind) => {
                        write!(out, "{:?}", kind).unwrap();
                        match kind {
                            SegmentKind::App(app) if app.as_app_kind().is_none() => {
                                // Dump bytes of unknown APP segments too.
                                writeln!(out, " {:x?}", segment.raw_bytes()).unwrap();
                            }
                            _ => writeln!(out).unwrap(),
                        }
                    }
                    None => writeln!(out, "{:x?}", segment.raw_bytes()).unwrap(),
                }
            }
            Ok(Lex::Entropy(chunk)) => {
                match chunk.restart {
                    Some(phase) => writeln!(out, "entropy {:x?} +RST{phase}", chunk.data).unwrap(),
                    None => writeln!(out, "entropy {:x?}", chunk.data).unwrap(),
                }
            }
            Ok(Lex::Incomplete(kind)) => {
                writeln!(out, "incomplete: {kind:?}").unwrap();
                break;
            }
            Ok(Lex::End) => break,
            Err(e) => {
                writeln!(out, "error: {e}").unwrap();
                break;
            }
        }
    }
    out
}

fn check(jpeg: &[u8], expect: Expect) {
    expect.assert_eq(&dump(jpeg));
}

#[test]
fn empty() {
    check(
        &[0xFF],
        expect![[r#"
            incomplete: MarkerType
        "#]],
    );
    check(
        &[0xFF, 0xD8 /* SOI */],
        expect![[r#"
            incomplete: MarkerType
        "#]],
    );
    check(
        &[
            0xFF, 0xD8, // SOI
            0xFF, 0xD9, // EOI
        ],
        expect![[""]],
    );
    check(
        &[
            0xFF, 0xD8, // SOI
            0xFF, 0xD9, // EOI
            0xFF, // trailing, not the lexer's business
        ],
        expect![[""]],
    );
}

#[test]
fn app() {
    check(
        &[
            0xFF, 0xD8, // SOI
            0xFF, 0xE0, // APP0
            0x00, 0x02, // empty
            0xFF, 0xD9, // EOI
        ],
        expect![[r#"
            0002 [FF E0] App { n: 0, kind: None } []
        "#]],
    );
    check(
        &[
            0xFF, 0xD8, // SOI
            0xFF, 0xE0, // APP0
            0x00, 0x04, // 2 more bytes after this
            0x00, 0x00, // APP0 contents (non-JFIF)
            0xFF, 0xDD, // DRI
            0x00, 0x04, // length
            0x00, 0x0F, // Ri
            0xFF, 0xD9, // EOI
        ],
        expect![[r#"
            0002 [FF E0] App { n: 0, kind: None } [0, 0]
            0008 [FF DD] Dri { Ri: 15 }
        "#]],
    );
}

#[test]
fn jfif() {
    check(
        &[
            0xFF, 0xD8, // SOI
            0xFF, 0xE0, // APP0
            0x00, 0x10, // length 16
            b'J', b'F', b'I', b'F', 0x00, // magic
            0x01, 0x02, // version 1.2
            0x01, // dots per inch
            0x00, 0x48, // density x = 72
            0x00, 0x48, // density y = 72
            0x00, 0x00, // no thumbnail
            0xFF, 0xD9, // EOI
        ],
        expect![[r#"
            0002 [FF E0] App { n: 0, kind: Some(Jfif(Jfif { major_version: 1, minor_version: 2, unit: DotsPerInch, xdensity: 72, ydensity: 72, xthumbnail: 0, ythumbnail: 0, thumbnail: [] })) }
        "#]],
    );
}

#[test]
fn frame_header() {
    check(
        &[
            0xFF, 0xD8, // SOI
            0xFF, 0xC0, // SOF0
            0x00, 0x0B, // length 11
            8, // precision
            0x00, 0x08, // 8 lines
            0x00, 0x10, // 16 samples per line
            1, // one component
            0x01, 0x21, 0x00, // id 1, 2x1, qtable 0
            0xFF, 0xD9, // EOI
        ],
        expect![[r#"
            0002 [FF C0] Sof { sof: SOF0, P: 8, Y: 8, X: 16, components: [FrameComponent { Ci: 1, Hi: 2, Vi: 1, Tqi: 0 }] }
        "#]],
    );
}

#[test]
fn scan_with_restarts() {
    check(
        &[
            0xFF, 0xD8, // SOI
            0xFF, 0xDA, // SOS
            0x00, 0x08, // length 8
            0x01, // one component
            0x01, 0x00, // component 1, DC 0 / AC 0
            0x00, 0x3F, 0x00, // full band, no point transform
            0xAB, 0xFF, 0x00, 0xCD, // entropy data with a stuffed FF
            0xFF, 0xD0, // RST0
            0x12, // second interval
            0xFF, 0xD9, // EOI
        ],
        expect![[r#"
            0002 [FF DA] Sos { components: [ScanComponent { Csj: 1, Tdj: 0, Taj: 0 }], Ss: 0, Se: 63, Ah: 0, Al: 0 }
            entropy [ab, ff, cd] +RST0
            entropy [12]
        "#]],
    );
}

#[test]
fn unknown_marker_is_skipped() {
    check(
        &[
            0xFF, 0xD8, // SOI
            0xFF, 0xF0, // JPG0, unknown to the parser
            0x00, 0x04, // length
            0xAA, 0xBB, // payload
            0xFF, 0xD9, // EOI
        ],
        expect![[r#"
            0002 [FF F0] [aa, bb]
        "#]],
    );
}

#[test]
fn errors() {
    check(
        &[0xFF, 0xD8, 0xFF, 0x00],
        expect![[r#"
            error: invalid ff 00 marker outside scan data
        "#]],
    );
    check(
        &[0xFF, 0xD8, 0xFF, 0xD0],
        expect![[r#"
            error: restart marker RST0 outside scan data
        "#]],
    );
    check(
        // DRI declaring 3 payload bytes; the parser consumes 2.
        &[0xFF, 0xD8, 0xFF, 0xDD, 0x00, 0x05, 0x00, 0x0F, 0x00],
        expect![[r#"
            error: ff dd segment declared 3 payload bytes but 2 were consumed
        "#]],
    );
    check(
        &[0x00, 0x01],
        expect![[r#"
            error: JPEG image does not start with SOI marker
        "#]],
    );
}

#[test]
fn truncation_kinds() {
    let mut lexer = Lexer::new();
    assert!(matches!(
        lexer.next(&[0xFF, 0xD8, 0xFF]).unwrap(),
        Lex::Incomplete(Truncation::MarkerType),
    ));

    let mut lexer = Lexer::new();
    assert!(matches!(
        lexer.next(&[0xFF, 0xD8, 0xFF, 0xE0]).unwrap(),
        Lex::Incomplete(Truncation::FixedHeader),
    ));

    let mut lexer = Lexer::new();
    assert!(matches!(
        lexer.next(&[0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x06, 0x00, 0x00]).unwrap(),
        Lex::Incomplete(Truncation::SegmentBody),
    ));

    let mut lexer = Lexer::new();
    let sos = [
        0xFF, 0xD8, 0xFF, 0xDA, 0x00, 0x08, 0x01, 0x01, 0x00, 0x00, 0x3F, 0x00, 0xAB, 0xCD,
    ];
    assert!(matches!(lexer.next(&sos).unwrap(), Lex::Segment(_)));
    assert!(matches!(
        lexer.next(&sos).unwrap(),
        Lex::Incomplete(Truncation::EntropyData),
    ));
}

#[test]
fn truncation_retry_resumes() {
    let full = [
        0xFF, 0xD8, // SOI
        0xFF, 0xDD, // DRI
        0x00, 0x04, 0x00, 0x0F, // interval 15
        0xFF, 0xD9, // EOI
    ];

    let mut lexer = Lexer::new();
    for cut in 2..8 {
        match lexer.next(&full[..cut]).unwrap() {
            // Only the SOI marker is ever consumed; the cursor stays at the
            // start of the unfinished segment.
            Lex::Incomplete(_) => assert_eq!(lexer.position(), 2),
            other => panic!("expected incomplete at {cut} bytes, got {other:?}"),
        }
    }

    // The same lexer picks up where it left off once the bytes exist.
    match lexer.next(&full).unwrap() {
        Lex::Segment(segment) => assert_eq!(segment.marker(), 0xDD),
        other => panic!("expected the DRI segment, got {other:?}"),
    }
    assert!(matches!(lexer.next(&full).unwrap(), Lex::End));
}
