//! End-to-end admission scenarios against in-memory fixture documents.

use std::io::Write;

use flate2::write::ZlibEncoder;
use flate2::Compression;
use lopdf::{dictionary, Object, Stream};

use stz_pdf_core::admit::{parse_bytes, Rejection};
use stz_pdf_core::ir::{Op, ThreatAction, ThreatSeverity};
use stz_pdf_core::{ParseFailure, ParseLimits, Policy};

const HELLO_CONTENT: &[u8] = b"BT /F1 12 Tf 100 700 Td (Hello) Tj ET";

struct FixtureBuilder {
    doc: lopdf::Document,
    pages_id: lopdf::ObjectId,
    catalog_extra: Vec<(&'static str, Object)>,
}

impl FixtureBuilder {
    fn new() -> Self {
        let mut doc = lopdf::Document::with_version("1.4");
        let pages_id = doc.new_object_id();
        Self { doc, pages_id, catalog_extra: Vec::new() }
    }

    fn with_catalog_entry(mut self, key: &'static str, value: Object) -> Self {
        self.catalog_extra.push((key, value));
        self
    }

    /// One page showing `HELLO_CONTENT` in Helvetica, optionally with
    /// extra page-dictionary entries and XObject resources.
    fn build(mut self, content: &[u8], xobjects: Vec<(&'static str, Object)>) -> Vec<u8> {
        let font_id = self.doc.add_object(dictionary! {
            "Type" => "Font",
            "Subtype" => "Type1",
            "BaseFont" => "Helvetica",
        });
        let content_id = self
            .doc
            .add_object(Object::Stream(Stream::new(dictionary! {}, content.to_vec())));
        let mut resources = dictionary! {
            "Font" => dictionary! { "F1" => Object::Reference(font_id) },
        };
        if !xobjects.is_empty() {
            let mut xobject_dict = lopdf::Dictionary::new();
            for (name, value) in xobjects {
                xobject_dict.set(name, value);
            }
            resources.set("XObject", Object::Dictionary(xobject_dict));
        }
        let page_id = self.doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => Object::Reference(self.pages_id),
            "MediaBox" => Object::Array(vec![
                Object::Integer(0),
                Object::Integer(0),
                Object::Integer(612),
                Object::Integer(792),
            ]),
            "Resources" => Object::Dictionary(resources),
            "Contents" => Object::Reference(content_id),
        });
        self.doc.objects.insert(
            self.pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => Object::Array(vec![Object::Reference(page_id)]),
                "Count" => Object::Integer(1),
            }),
        );
        let mut catalog = dictionary! {
            "Type" => "Catalog",
            "Pages" => Object::Reference(self.pages_id),
        };
        for (key, value) in self.catalog_extra {
            catalog.set(key, value);
        }
        let catalog_id = self.doc.add_object(Object::Dictionary(catalog));
        self.doc.trailer.set("Root", Object::Reference(catalog_id));
        let mut bytes = Vec::new();
        self.doc.save_to(&mut bytes).expect("serialize fixture");
        bytes
    }
}

fn hello_pdf() -> Vec<u8> {
    FixtureBuilder::new().build(HELLO_CONTENT, Vec::new())
}

fn open_action_pdf() -> Vec<u8> {
    FixtureBuilder::new()
        .with_catalog_entry(
            "OpenAction",
            Object::Dictionary(dictionary! {
                "S" => "JavaScript",
                "JS" => Object::string_literal("app.alert('pwned');"),
            }),
        )
        .build(HELLO_CONTENT, Vec::new())
}

fn limits(policy: Policy) -> ParseLimits {
    ParseLimits { policy, ..ParseLimits::default() }
}

fn zlib(data: &[u8]) -> Vec<u8> {
    let mut enc = ZlibEncoder::new(Vec::new(), Compression::default());
    enc.write_all(data).expect("zlib write");
    enc.finish().expect("zlib finish")
}

#[test]
fn benign_hello_document_is_admitted_clean() {
    let admission =
        parse_bytes(&hello_pdf(), &limits(Policy::Aggressive)).expect("hello admits");
    assert!(admission.threats.is_empty(), "no threats expected: {:?}", admission.threats);
    let doc = admission.document;
    assert_eq!(doc.pages.len(), 1);
    assert_eq!(doc.pdf_version, "1.4");
    assert_eq!(doc.source_sha256.len(), 64);
    let page = &doc.pages[0];
    assert_eq!(page.fonts.len(), 1);
    assert!(page
        .content_ops
        .iter()
        .any(|op| matches!(op, Op::ShowText { text } if text == b"Hello")));
}

#[test]
fn open_action_rejects_whole_document_under_aggressive() {
    let Rejection { failure, threats } =
        parse_bytes(&open_action_pdf(), &limits(Policy::Aggressive)).expect_err("must reject");
    match failure {
        ParseFailure::DisallowedConstruct { kind, .. } => assert_eq!(kind, "OpenAction"),
        other => panic!("expected DisallowedConstruct, got {other:?}"),
    }
    assert_eq!(threats.len(), 1);
    assert_eq!(threats[0].severity, ThreatSeverity::Critical);
    assert_eq!(threats[0].action, ThreatAction::Rejected);
}

#[test]
fn open_action_is_stripped_and_logged_under_lenient() {
    let admission =
        parse_bytes(&open_action_pdf(), &limits(Policy::Lenient)).expect("lenient admits");
    assert_eq!(admission.document.pages.len(), 1);
    assert!(admission.threats.iter().any(|t| {
        t.kind == "OpenAction"
            && t.severity == ThreatSeverity::Critical
            && t.action == ThreatAction::Removed
    }));
    // The visible content survives the strip.
    assert!(admission.document.pages[0]
        .content_ops
        .iter()
        .any(|op| matches!(op, Op::ShowText { text } if text == b"Hello")));
}

#[test]
fn image_with_mismatched_decode_length_is_malformed() {
    // Declares 10000x10000 8-bit RGB but decodes to 100 bytes.
    let pixel_lie = zlib(&[0u8; 100]);
    let image = Object::Stream(Stream::new(
        dictionary! {
            "Type" => "XObject",
            "Subtype" => "Image",
            "Width" => Object::Integer(10_000),
            "Height" => Object::Integer(10_000),
            "ColorSpace" => "DeviceRGB",
            "BitsPerComponent" => Object::Integer(8),
            "Filter" => "FlateDecode",
        },
        pixel_lie,
    ));
    let pdf = FixtureBuilder::new()
        .build(b"q 100 0 0 100 0 0 cm /Im0 Do Q", vec![("Im0", image)]);
    let Rejection { failure, .. } =
        parse_bytes(&pdf, &limits(Policy::Aggressive)).expect_err("must reject");
    match failure {
        ParseFailure::Malformed { detail } => {
            assert!(detail.contains("length mismatch"), "unexpected detail: {detail}")
        }
        other => panic!("expected Malformed, got {other:?}"),
    }
}

#[test]
fn content_stream_bomb_exhausts_decode_budget() {
    let bomb = zlib(&vec![b' '; 96 * 1024 * 1024]);
    let mut fixture = FixtureBuilder::new();
    let content_id = fixture.doc.add_object(Object::Stream(Stream::new(
        dictionary! { "Filter" => "FlateDecode" },
        bomb,
    )));
    let page_id = fixture.doc.add_object(dictionary! {
        "Type" => "Page",
        "Parent" => Object::Reference(fixture.pages_id),
        "MediaBox" => Object::Array(vec![
            Object::Integer(0),
            Object::Integer(0),
            Object::Integer(612),
            Object::Integer(792),
        ]),
        "Contents" => Object::Reference(content_id),
    });
    fixture.doc.objects.insert(
        fixture.pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => Object::Array(vec![Object::Reference(page_id)]),
            "Count" => Object::Integer(1),
        }),
    );
    let catalog_id = fixture.doc.add_object(Object::Dictionary(dictionary! {
        "Type" => "Catalog",
        "Pages" => Object::Reference(fixture.pages_id),
    }));
    fixture.doc.trailer.set("Root", Object::Reference(catalog_id));
    let mut pdf = Vec::new();
    fixture.doc.save_to(&mut pdf).expect("serialize fixture");

    let Rejection { failure, .. } =
        parse_bytes(&pdf, &limits(Policy::Aggressive)).expect_err("must reject");
    assert!(matches!(failure, ParseFailure::DecompressionBudgetExceeded));
}

#[test]
fn encrypted_documents_are_refused() {
    let mut pdf = hello_pdf();
    // Incremental-update style trailer declaring encryption.
    pdf.extend_from_slice(b"\ntrailer << /Root 6 0 R /Encrypt 9 0 R >>\n");
    let Rejection { failure, .. } =
        parse_bytes(&pdf, &limits(Policy::Aggressive)).expect_err("must reject");
    assert!(matches!(failure, ParseFailure::Encrypted));
}

#[test]
fn header_version_above_cap_is_unsupported() {
    let mut pdf = hello_pdf();
    pdf[5..8].copy_from_slice(b"1.7");
    let mut strict = limits(Policy::Aggressive);
    strict.max_pdf_version = "1.4".into();
    let Rejection { failure, .. } =
        parse_bytes(&pdf, &strict).expect_err("must reject");
    assert!(matches!(failure, ParseFailure::UnsupportedVersion { .. }));
}

#[test]
fn non_pdf_input_is_not_a_pdf() {
    let Rejection { failure, .. } =
        parse_bytes(b"MZ\x90\x00\x03binary", &limits(Policy::Aggressive))
            .expect_err("must reject");
    assert!(matches!(failure, ParseFailure::NotAPdf));
}

#[test]
fn unknown_operator_rejects_document_under_aggressive() {
    let pdf = FixtureBuilder::new().build(b"0.5 w BT /F1 12 Tf (x) Tj ET", Vec::new());
    let Rejection { failure, threats } =
        parse_bytes(&pdf, &limits(Policy::Aggressive)).expect_err("must reject");
    match failure {
        ParseFailure::DisallowedConstruct { kind, .. } => assert_eq!(kind, "Operator/w"),
        other => panic!("expected DisallowedConstruct, got {other:?}"),
    }
    assert!(threats.iter().any(|t| t.kind == "DisallowedOperator/w"));
}

#[test]
fn unknown_operator_drops_page_under_lenient() {
    let pdf = FixtureBuilder::new().build(b"0.5 w BT /F1 12 Tf (x) Tj ET", Vec::new());
    let admission = parse_bytes(&pdf, &limits(Policy::Lenient)).expect("lenient admits");
    assert!(admission.document.pages.is_empty(), "tainted page must not survive");
    assert!(admission.threats.iter().any(|t| t.kind == "DisallowedOperator/w"));
}

#[test]
fn embedded_font_program_is_not_standard() {
    let mut fixture = FixtureBuilder::new();
    let font_id = fixture.doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Helvetica",
        "FontFile" => Object::string_literal("fake program"),
    });
    let content_id = fixture
        .doc
        .add_object(Object::Stream(Stream::new(dictionary! {}, HELLO_CONTENT.to_vec())));
    let page_id = fixture.doc.add_object(dictionary! {
        "Type" => "Page",
        "Parent" => Object::Reference(fixture.pages_id),
        "MediaBox" => Object::Array(vec![
            Object::Integer(0),
            Object::Integer(0),
            Object::Integer(612),
            Object::Integer(792),
        ]),
        "Resources" => Object::Dictionary(dictionary! {
            "Font" => dictionary! { "F1" => Object::Reference(font_id) },
        }),
        "Contents" => Object::Reference(content_id),
    });
    fixture.doc.objects.insert(
        fixture.pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => Object::Array(vec![Object::Reference(page_id)]),
            "Count" => Object::Integer(1),
        }),
    );
    let catalog_id = fixture.doc.add_object(Object::Dictionary(dictionary! {
        "Type" => "Catalog",
        "Pages" => Object::Reference(fixture.pages_id),
    }));
    fixture.doc.trailer.set("Root", Object::Reference(catalog_id));
    let mut pdf = Vec::new();
    fixture.doc.save_to(&mut pdf).expect("serialize fixture");

    let Rejection { failure, threats } =
        parse_bytes(&pdf, &limits(Policy::Aggressive)).expect_err("must reject");
    assert!(matches!(failure, ParseFailure::DisallowedConstruct { ref kind, .. } if kind == "NonStandardFont"));
    assert!(threats.iter().any(|t| t.kind == "NonStandardFont"));
}

#[test]
fn admitted_image_pixels_are_fully_decoded() {
    let pixels: Vec<u8> = (0..12u8).collect();
    let image = Object::Stream(Stream::new(
        dictionary! {
            "Type" => "XObject",
            "Subtype" => "Image",
            "Width" => Object::Integer(2),
            "Height" => Object::Integer(2),
            "ColorSpace" => "DeviceRGB",
            "BitsPerComponent" => Object::Integer(8),
            "Filter" => "FlateDecode",
        },
        zlib(&pixels),
    ));
    let pdf = FixtureBuilder::new()
        .build(b"q 2 0 0 2 10 10 cm /Im0 Do Q", vec![("Im0", image)]);
    let admission = parse_bytes(&pdf, &limits(Policy::Aggressive)).expect("image admits");
    let page = &admission.document.pages[0];
    let image = page.images.get("Im0").expect("admitted image");
    assert_eq!(image.pixel_data, pixels);
    assert!(page
        .content_ops
        .iter()
        .any(|op| matches!(op, Op::InvokeXObject { name } if name == "Im0")));
}

#[test]
fn threat_sweep_reaches_objects_outside_the_page_tree() {
    // A Filespec with an embedded file pointer, referenced by nothing.
    let pdf = FixtureBuilder::new()
        .with_catalog_entry(
            "Names",
            Object::Dictionary(dictionary! {
                "EmbeddedFiles" => dictionary! {
                    "Names" => Object::Array(vec![Object::string_literal("payload.ps1")]),
                },
            }),
        )
        .build(HELLO_CONTENT, Vec::new());
    let admission = parse_bytes(&pdf, &limits(Policy::Lenient)).expect("lenient admits");
    assert!(admission.threats.iter().any(|t| t.kind == "EmbeddedFile"));
}
