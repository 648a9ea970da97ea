//! Constructive PDF emission.
//!
//! The reconstructor writes the output from scratch out of the validated
//! IR. It never touches, copies, or references bytes of the original file;
//! the only inputs are IR fields that already passed re-validation. Given
//! the same IR and the same emitter version the output is byte-identical:
//! nothing here reads the clock, generates ids, or randomizes.

use std::io::Write;
use std::path::Path;

use flate2::write::ZlibEncoder;
use flate2::Compression;
use lopdf::{dictionary, Dictionary, Object, Stream};
use sha2::{Digest, Sha256};
use tracing::info;

use crate::config::parse_pdf_version;
use crate::error::ReconstructFailure;
use crate::ir::{Document, MediaBox, Op, Page, TextItem};

/// Highest version this emitter writes. The output header is the input's
/// version clamped to this ceiling, never above the input's own.
const EMITTER_VERSION_CEILING: (u8, u8) = (1, 7);

const PROC_SET: [&str; 5] = ["PDF", "Text", "ImageB", "ImageC", "ImageI"];

#[derive(Debug, Clone)]
pub struct ReconstructOutcome {
    pub bytes_written: u64,
    pub sha256: String,
}

pub fn reconstruct(
    ir: &Document,
    out_path: &Path,
    max_output_bytes: u64,
) -> Result<ReconstructOutcome, ReconstructFailure> {
    let bytes = emit(ir)?;
    if bytes.len() as u64 > max_output_bytes {
        return Err(ReconstructFailure::OutputExceedsBudget {
            bytes: bytes.len() as u64,
            budget: max_output_bytes,
        });
    }
    let sha256 = hex::encode(Sha256::digest(&bytes));

    // Partial output must never become visible under the final name.
    let parent = match out_path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    tmp.write_all(&bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(out_path).map_err(|e| ReconstructFailure::Io(e.error))?;

    info!(
        path = %out_path.display(),
        bytes = bytes.len(),
        sha256 = %sha256,
        "sanitized output written"
    );
    Ok(ReconstructOutcome { bytes_written: bytes.len() as u64, sha256 })
}

/// Emits the whole document into memory. Exposed to the test suite so
/// determinism can be asserted without touching disk.
pub fn emit(ir: &Document) -> Result<Vec<u8>, ReconstructFailure> {
    if ir.pages.is_empty() {
        return Err(ReconstructFailure::EmptyDocument);
    }
    let version = output_version(&ir.pdf_version)
        .ok_or_else(|| ReconstructFailure::InvariantViolation {
            detail: format!("unparsable pdf_version {:?}", ir.pdf_version),
        })?;
    let mut doc = lopdf::Document::with_version(version);
    let pages_id = doc.new_object_id();

    let mut kids = Vec::with_capacity(ir.pages.len());
    for page in &ir.pages {
        let content = serialize_content(page)?;
        let content_id = doc.add_object(Object::Stream(Stream::new(dictionary! {}, content)));

        let mut xobjects = Dictionary::new();
        for (name, image) in &page.images {
            let stream = image_stream(image)?;
            let image_id = doc.add_object(Object::Stream(stream));
            xobjects.set(name.as_bytes().to_vec(), Object::Reference(image_id));
        }
        let mut fonts = Dictionary::new();
        for (name, font) in &page.fonts {
            fonts.set(
                name.as_bytes().to_vec(),
                Object::Dictionary(dictionary! {
                    "Type" => "Font",
                    "Subtype" => "Type1",
                    "BaseFont" => font.canonical_name(),
                }),
            );
        }
        let mut resources = Dictionary::new();
        resources.set("Font", Object::Dictionary(fonts));
        if !xobjects.is_empty() {
            resources.set("XObject", Object::Dictionary(xobjects));
        }
        resources.set(
            "ProcSet",
            Object::Array(PROC_SET.iter().map(|n| Object::Name(n.as_bytes().to_vec())).collect()),
        );

        let mut page_dict = dictionary! {
            "Type" => "Page",
            "Parent" => Object::Reference(pages_id),
            "MediaBox" => rect_array(&page.media_box),
            "Resources" => Object::Dictionary(resources),
            "Contents" => Object::Reference(content_id),
        };
        if let Some(crop) = &page.crop_box {
            page_dict.set("CropBox", rect_array(crop));
        }
        let page_id = doc.add_object(Object::Dictionary(page_dict));
        kids.push(Object::Reference(page_id));
    }

    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => Object::Array(kids),
            "Count" => ir.pages.len() as i64,
        }),
    );
    let catalog_id = doc.add_object(Object::Dictionary(dictionary! {
        "Type" => "Catalog",
        "Pages" => Object::Reference(pages_id),
    }));
    doc.trailer.set("Root", Object::Reference(catalog_id));

    let mut out = Vec::new();
    doc.save_to(&mut out).map_err(|e| ReconstructFailure::InvariantViolation {
        detail: format!("document serialization failed: {e}"),
    })?;
    Ok(out)
}

fn output_version(input_version: &str) -> Option<String> {
    let parsed = parse_pdf_version(input_version)?;
    let clamped = parsed.min(EMITTER_VERSION_CEILING);
    Some(format!("{}.{}", clamped.0, clamped.1))
}

fn image_stream(image: &crate::ir::ImageRef) -> Result<Stream, ReconstructFailure> {
    // Pixels are re-encoded with a single minimal filter regardless of how
    // the source delivered them; original stream bytes never pass through.
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::new(6));
    encoder.write_all(&image.pixel_data)?;
    let compressed = encoder.finish()?;
    let dict = dictionary! {
        "Type" => "XObject",
        "Subtype" => "Image",
        "Width" => image.width,
        "Height" => image.height,
        "ColorSpace" => image.color_space.pdf_name(),
        "BitsPerComponent" => image.bits_per_comp,
        "Filter" => "FlateDecode",
    };
    Ok(Stream::new(dict, compressed))
}

fn rect_array(rect: &MediaBox) -> Object {
    Object::Array(vec![
        number_object(rect.x0),
        number_object(rect.y0),
        number_object(rect.x1),
        number_object(rect.y1),
    ])
}

fn number_object(v: f64) -> Object {
    if v.fract() == 0.0 && v.abs() < 9e15 {
        Object::Integer(v as i64)
    } else {
        Object::Real(v as f32)
    }
}

// ---- content serialization ------------------------------------------------

/// Re-serializes the operator sequence with strict lexical hygiene: one
/// canonical spelling per operator, single spaces, newline-terminated ops,
/// no comments.
fn serialize_content(page: &Page) -> Result<Vec<u8>, ReconstructFailure> {
    let mut out = Vec::new();
    for op in &page.content_ops {
        match op {
            Op::TextBegin => out.extend_from_slice(b"BT"),
            Op::TextEnd => out.extend_from_slice(b"ET"),
            Op::TextMoveAbs { x, y } => write_op(&mut out, &[*x, *y], b"Td"),
            Op::TextMoveRel { x, y } => write_op(&mut out, &[*x, *y], b"TD"),
            Op::TextMoveNext => out.extend_from_slice(b"T*"),
            Op::SetTextMatrix { a, b, c, d, e, f } => {
                write_op(&mut out, &[*a, *b, *c, *d, *e, *f], b"Tm")
            }
            Op::SetFont { font, size } => {
                if !page.fonts.contains_key(font) {
                    return Err(ReconstructFailure::InvariantViolation {
                        detail: format!("font {font:?} escaped validation"),
                    });
                }
                write_name(&mut out, font.as_bytes());
                out.push(b' ');
                out.extend_from_slice(fmt_number(*size).as_bytes());
                out.extend_from_slice(b" Tf");
            }
            Op::ShowText { text } => {
                write_string(&mut out, text);
                out.extend_from_slice(b" Tj");
            }
            Op::ShowTextArray { items } => {
                out.push(b'[');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push(b' ');
                    }
                    match item {
                        TextItem::Str { text } => write_string(&mut out, text),
                        TextItem::Adjust { amount } => {
                            out.extend_from_slice(fmt_number(*amount).as_bytes())
                        }
                    }
                }
                out.extend_from_slice(b"] TJ");
            }
            Op::MoveTo { x, y } => write_op(&mut out, &[*x, *y], b"m"),
            Op::LineTo { x, y } => write_op(&mut out, &[*x, *y], b"l"),
            Op::CurveTo { x1, y1, x2, y2, x3, y3 } => {
                write_op(&mut out, &[*x1, *y1, *x2, *y2, *x3, *y3], b"c")
            }
            Op::ClosePath => out.push(b'h'),
            Op::Rect { x, y, w, h } => write_op(&mut out, &[*x, *y, *w, *h], b"re"),
            Op::Fill => out.push(b'f'),
            Op::Stroke => out.push(b'S'),
            Op::EndPath => out.push(b'n'),
            Op::SaveGraphicsState => out.push(b'q'),
            Op::RestoreGraphicsState => out.push(b'Q'),
            Op::Concat { a, b, c, d, e, f } => {
                write_op(&mut out, &[*a, *b, *c, *d, *e, *f], b"cm")
            }
            Op::InvokeXObject { name } => {
                if !page.images.contains_key(name) {
                    return Err(ReconstructFailure::InvariantViolation {
                        detail: format!("xobject {name:?} escaped validation"),
                    });
                }
                write_name(&mut out, name.as_bytes());
                out.extend_from_slice(b" Do");
            }
        }
        out.push(b'\n');
    }
    Ok(out)
}

fn write_op(out: &mut Vec<u8>, operands: &[f64], operator: &[u8]) {
    for v in operands {
        out.extend_from_slice(fmt_number(*v).as_bytes());
        out.push(b' ');
    }
    out.extend_from_slice(operator);
}

/// Shortest-round-trip decimal. Integral values drop the fraction so the
/// common case reads like hand-written PDF.
fn fmt_number(v: f64) -> String {
    if v.fract() == 0.0 && v.abs() < 9e15 {
        format!("{}", v as i64)
    } else {
        format!("{v}")
    }
}

fn write_name(out: &mut Vec<u8>, name: &[u8]) {
    out.push(b'/');
    for &b in name {
        let plain =
            (b'!'..=b'~').contains(&b) && !matches!(b, b'#' | b'(' | b')' | b'<' | b'>' | b'[' | b']' | b'{' | b'}' | b'/' | b'%');
        if plain {
            out.push(b);
        } else {
            out.extend_from_slice(format!("#{b:02X}").as_bytes());
        }
    }
}

fn write_string(out: &mut Vec<u8>, text: &[u8]) {
    out.push(b'(');
    for &b in text {
        match b {
            b'(' | b')' | b'\\' => {
                out.push(b'\\');
                out.push(b);
            }
            0x20..=0x7e => out.push(b),
            b'\n' => out.extend_from_slice(b"\\n"),
            b'\r' => out.extend_from_slice(b"\\r"),
            b'\t' => out.extend_from_slice(b"\\t"),
            other => out.extend_from_slice(format!("\\{other:03o}").as_bytes()),
        }
    }
    out.push(b')');
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{ColorSpace, FontRef, ImageFilter, ImageRef};
    use std::collections::BTreeMap;

    fn hello_page() -> Page {
        let mut fonts = BTreeMap::new();
        fonts.insert("F1".to_string(), FontRef::Helvetica);
        Page {
            media_box: MediaBox { x0: 0.0, y0: 0.0, x1: 612.0, y1: 792.0 },
            crop_box: None,
            content_ops: vec![
                Op::TextBegin,
                Op::SetFont { font: "F1".into(), size: 12.0 },
                Op::TextMoveAbs { x: 100.0, y: 700.0 },
                Op::ShowText { text: b"Hello".to_vec() },
                Op::TextEnd,
            ],
            fonts,
            images: BTreeMap::new(),
        }
    }

    fn hello_document() -> Document {
        Document {
            pages: vec![hello_page()],
            source_sha256: "0".repeat(64),
            parser_version: "0.4.1".into(),
            pdf_version: "1.4".into(),
        }
    }

    #[test]
    fn emission_is_deterministic() {
        let doc = hello_document();
        let first = emit(&doc).expect("emit");
        let second = emit(&doc).expect("emit again");
        assert_eq!(first, second);
    }

    #[test]
    fn output_carries_clamped_input_version() {
        let mut doc = hello_document();
        doc.pdf_version = "2.0".into();
        let out = emit(&doc).expect("emit");
        assert!(out.starts_with(b"%PDF-1.7"));
        doc.pdf_version = "1.3".into();
        let out = emit(&doc).expect("emit");
        assert!(out.starts_with(b"%PDF-1.3"));
    }

    #[test]
    fn zero_pages_is_empty_document() {
        let mut doc = hello_document();
        doc.pages.clear();
        assert!(matches!(emit(&doc), Err(ReconstructFailure::EmptyDocument)));
    }

    #[test]
    fn content_serialization_is_canonical() {
        let content = serialize_content(&hello_page()).expect("serialize");
        let text = String::from_utf8(content).expect("utf8 content");
        assert_eq!(text, "BT\n/F1 12 Tf\n100 700 Td\n(Hello) Tj\nET\n");
    }

    #[test]
    fn strings_escape_delimiters_and_binary() {
        let mut out = Vec::new();
        write_string(&mut out, b"a(b)\\c\x01");
        assert_eq!(out, b"(a\\(b\\)\\\\c\\001)".to_vec());
    }

    #[test]
    fn output_contains_no_metadata_slots() {
        let out = emit(&hello_document()).expect("emit");
        let text = String::from_utf8_lossy(&out);
        assert!(!text.contains("/Info"));
        assert!(!text.contains("/Metadata"));
        assert!(!text.contains("/ID"));
    }

    #[test]
    fn round_trip_through_own_parser() {
        let out = emit(&hello_document()).expect("emit");
        let graph = stz_pdf_pdf::scan_graph(&out, stz_pdf_pdf::ScanLimits::default())
            .expect("re-scan own output");
        assert!(graph.root_ref().is_some());
    }

    #[test]
    fn image_streams_reencode_as_flate() {
        let mut page = hello_page();
        page.content_ops = vec![Op::InvokeXObject { name: "Im0".into() }];
        page.fonts.clear();
        page.images.insert(
            "Im0".into(),
            ImageRef {
                width: 2,
                height: 2,
                color_space: ColorSpace::DeviceGray,
                bits_per_comp: 8,
                filter_chain: vec![ImageFilter::DCTDecode],
                pixel_data: vec![0, 64, 128, 255],
            },
        );
        let doc = Document { pages: vec![page], ..hello_document() };
        let out = emit(&doc).expect("emit");
        let text = String::from_utf8_lossy(&out);
        assert!(text.contains("/FlateDecode"));
        assert!(!text.contains("/DCTDecode"));
    }
}
