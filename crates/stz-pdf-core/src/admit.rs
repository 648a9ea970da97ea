//! Whitelist admission: turns a hostile object graph into a fresh IR.
//!
//! The admission pass is constructive. It walks the scanned graph, decides
//! what the allow-list covers, and copies admitted values into new IR
//! structures. Input bytes that are not explicitly interpreted here are
//! discarded by construction.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fs;
use std::path::Path;

use sha2::{Digest, Sha256};
use tracing::Level;

use stz_pdf_pdf::content::{tokenize_content, ContentOp, Operand};
use stz_pdf_pdf::decode::{decode_filter, decode_stream, DecodeError};
use stz_pdf_pdf::object::{PdfAtom, PdfDict, PdfObj, PdfStream};
use stz_pdf_pdf::scan::{scan_graph, LimitError, ObjectGraph};

use crate::config::{parse_pdf_version, ParseLimits, Policy};
use crate::error::ParseFailure;
use crate::ir::{
    ColorSpace, Document, FontRef, ImageFilter, ImageRef, MediaBox, Op, Page, TextItem,
    ThreatAction, ThreatRecord, ThreatSeverity,
};
use crate::security_log::{SecurityDomain, SecurityEvent};

pub const PDF_MAGIC: &[u8] = b"%PDF-";
const MAX_PAGE_TREE_DEPTH: usize = 64;

/// Successful admission: the IR plus everything that was stripped on the
/// way (empty under AGGRESSIVE, which refuses instead of stripping).
#[derive(Debug)]
pub struct Admission {
    pub document: Document,
    pub threats: Vec<ThreatRecord>,
}

/// Terminal rejection, carrying the threats recorded before the parse
/// stopped so the audit trail still names what was found.
#[derive(Debug)]
pub struct Rejection {
    pub failure: ParseFailure,
    pub threats: Vec<ThreatRecord>,
}

impl From<ParseFailure> for Rejection {
    fn from(failure: ParseFailure) -> Self {
        Self { failure, threats: Vec::new() }
    }
}

pub fn parse_file(path: &Path, limits: &ParseLimits) -> Result<Admission, Rejection> {
    let meta = fs::symlink_metadata(path)
        .map_err(|e| ParseFailure::Malformed { detail: format!("input unreadable: {e}") })?;
    if meta.file_type().is_symlink() {
        return Err(ParseFailure::Malformed { detail: "input path is a symbolic link".into() }.into());
    }
    if meta.len() > limits.max_input_bytes {
        return Err(ParseFailure::LimitExceeded { which: "input bytes".into() }.into());
    }
    let bytes = fs::read(path)
        .map_err(|e| ParseFailure::Malformed { detail: format!("input unreadable: {e}") })?;
    parse_bytes(&bytes, limits)
}

pub fn parse_bytes(bytes: &[u8], limits: &ParseLimits) -> Result<Admission, Rejection> {
    if bytes.len() as u64 > limits.max_input_bytes {
        return Err(ParseFailure::LimitExceeded { which: "input bytes".into() }.into());
    }
    let version = header_version(bytes).ok_or(ParseFailure::NotAPdf)?;
    let cap = parse_pdf_version(&limits.max_pdf_version)
        .ok_or_else(|| ParseFailure::Malformed { detail: "invalid version cap".into() })?;
    let parsed = parse_pdf_version(&version)
        .ok_or(ParseFailure::UnsupportedVersion { version: version.clone() })?;
    if parsed > cap {
        return Err(ParseFailure::UnsupportedVersion { version }.into());
    }

    let source_sha256 = hex::encode(Sha256::digest(bytes));

    let graph = scan_graph(bytes, limits.scan_limits()).map_err(map_graph_error)?;
    if graph.is_encrypted() {
        return Err(ParseFailure::Encrypted.into());
    }
    if graph.objects.is_empty() {
        return Err(ParseFailure::Truncated { detail: "no indirect objects".into() }.into());
    }

    let mut threats = Vec::new();
    sweep_blocked_constructs(&graph, limits.policy, &mut threats)?;

    let rejected = |failure: ParseFailure, threats: &mut Vec<ThreatRecord>| Rejection {
        failure,
        threats: std::mem::take(threats),
    };
    let Some(root) = graph.root_ref() else {
        return Err(rejected(
            ParseFailure::Truncated { detail: "trailer /Root missing".into() },
            &mut threats,
        ));
    };
    let Some(catalog) = graph.get(root.0, root.1).and_then(|o| o.body.as_dict()) else {
        return Err(rejected(
            ParseFailure::Truncated { detail: "document catalog missing".into() },
            &mut threats,
        ));
    };
    let Some(pages_obj) = catalog.get(b"Pages") else {
        return Err(rejected(
            ParseFailure::Truncated { detail: "catalog /Pages missing".into() },
            &mut threats,
        ));
    };

    let nodes = walk_page_tree(&graph, pages_obj, limits).map_err(|mut r| {
        threats.extend(r.threats);
        r.threats = std::mem::take(&mut threats);
        r
    })?;
    let mut pages = Vec::new();
    for node in &nodes {
        match admit_page(bytes, &graph, node, limits) {
            Ok(page) => pages.push(page),
            Err(reject) => {
                threats.extend(reject.threats.iter().cloned());
                match limits.policy {
                    Policy::Aggressive => {
                        return Err(Rejection { failure: reject.failure, threats });
                    }
                    Policy::Lenient => {
                        SecurityEvent {
                            level: Level::WARN,
                            domain: SecurityDomain::Parser,
                            severity: ThreatSeverity::High,
                            kind: "page_rejected",
                            locator: Some(&node.locator),
                            message: "Page rejected under lenient policy",
                        }
                        .emit();
                    }
                }
            }
        }
    }

    let document = Document {
        pages,
        source_sha256,
        parser_version: env!("CARGO_PKG_VERSION").to_string(),
        pdf_version: version,
    };
    // Self-check before the IR leaves the worker; the controller repeats
    // this on its own copy.
    if let Err(detail) = crate::validate::validate_document(&document, limits) {
        return Err(Rejection {
            failure: ParseFailure::Malformed { detail: format!("self-validation: {detail}") },
            threats,
        });
    }
    Ok(Admission { document, threats })
}

/// Header version, accepting exactly `%PDF-D.D` followed by an EOL.
fn header_version(bytes: &[u8]) -> Option<String> {
    if !bytes.starts_with(PDF_MAGIC) {
        return None;
    }
    let rest = &bytes[PDF_MAGIC.len()..];
    if rest.len() < 4 {
        return None;
    }
    let (major, dot, minor, eol) = (rest[0], rest[1], rest[2], rest[3]);
    if !major.is_ascii_digit() || dot != b'.' || !minor.is_ascii_digit() {
        return None;
    }
    if eol != b'\r' && eol != b'\n' {
        return None;
    }
    Some(format!("{}.{}", major - b'0', minor - b'0'))
}

fn map_graph_error(err: anyhow::Error) -> Rejection {
    if let Some(limit) = err.downcast_ref::<LimitError>() {
        return ParseFailure::LimitExceeded { which: limit.which.into() }.into();
    }
    match err.downcast_ref::<DecodeError>() {
        Some(DecodeError::BudgetExceeded { .. }) => ParseFailure::DecompressionBudgetExceeded.into(),
        _ => ParseFailure::Malformed { detail: err.to_string() }.into(),
    }
}

// ---- block-list sweep -----------------------------------------------------

/// Dictionary keys that are never admitted, with the threat class recorded
/// when they are found. The sweep covers every object in the graph, nested
/// dictionaries included, so constructs hiding outside the page tree are
/// still counted.
const BLOCKED_KEYS: &[(&[u8], &str, ThreatSeverity)] = &[
    (b"OpenAction", "OpenAction", ThreatSeverity::Critical),
    (b"AA", "AdditionalAction", ThreatSeverity::Critical),
    (b"JavaScript", "JavaScript", ThreatSeverity::Critical),
    (b"JS", "JavaScript", ThreatSeverity::Critical),
    (b"Launch", "LaunchAction", ThreatSeverity::Critical),
    (b"EmbeddedFiles", "EmbeddedFile", ThreatSeverity::High),
    (b"EF", "EmbeddedFile", ThreatSeverity::High),
    (b"RichMedia", "RichMedia", ThreatSeverity::High),
    (b"RichMediaSettings", "RichMedia", ThreatSeverity::High),
    (b"RichMediaContent", "RichMedia", ThreatSeverity::High),
    (b"AcroForm", "AcroForm", ThreatSeverity::High),
    (b"XFA", "XFA", ThreatSeverity::High),
    (b"Annots", "Annotation", ThreatSeverity::Medium),
    (b"OCProperties", "OCProperties", ThreatSeverity::Low),
    (b"Metadata", "Metadata", ThreatSeverity::Low),
];

/// Action types reached through `/S`; the key itself is legal on benign
/// dictionaries, the named actions are not.
const BLOCKED_ACTIONS: &[(&[u8], &str)] = &[
    (b"JavaScript", "JavaScript"),
    (b"Launch", "LaunchAction"),
    (b"SubmitForm", "SubmitFormAction"),
    (b"GoToR", "RemoteGoToAction"),
    (b"ImportData", "ImportDataAction"),
];

fn sweep_blocked_constructs(
    graph: &ObjectGraph,
    policy: Policy,
    threats: &mut Vec<ThreatRecord>,
) -> Result<(), Rejection> {
    for entry in &graph.objects {
        let locator = entry.locator();
        sweep_object(&entry.body, &locator, policy, threats)?;
    }
    for trailer in &graph.trailers {
        if trailer.has(b"Info") {
            record_threat(policy, threats, "DocumentInfo", ThreatSeverity::Low, "trailer")?;
        }
    }
    Ok(())
}

fn sweep_object(
    obj: &PdfObj,
    locator: &str,
    policy: Policy,
    threats: &mut Vec<ThreatRecord>,
) -> Result<(), Rejection> {
    match &obj.atom {
        PdfAtom::Dict(dict) => sweep_dict(dict, locator, policy, threats),
        PdfAtom::Stream(stream) => sweep_dict(&stream.dict, locator, policy, threats),
        PdfAtom::Array(items) => {
            for item in items {
                sweep_object(item, locator, policy, threats)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

fn sweep_dict(
    dict: &PdfDict,
    locator: &str,
    policy: Policy,
    threats: &mut Vec<ThreatRecord>,
) -> Result<(), Rejection> {
    // One record per threat class per dictionary; a /JS entry next to
    // /S /JavaScript is one construct, not two.
    let mut seen: BTreeSet<&str> = BTreeSet::new();
    for (blocked, kind, severity) in BLOCKED_KEYS {
        if dict.has(blocked) && seen.insert(kind) {
            record_threat(policy, threats, kind, *severity, locator)?;
        }
    }
    if let Some(s) = dict.name(b"S") {
        for (action, kind) in BLOCKED_ACTIONS {
            if s == *action && seen.insert(kind) {
                record_threat(policy, threats, kind, ThreatSeverity::Critical, locator)?;
            }
        }
    }
    if dict.has_name(b"Type", b"Annot") && seen.insert("Annotation") {
        record_threat(policy, threats, "Annotation", ThreatSeverity::Medium, locator)?;
    }
    if dict.has_name(b"Type", b"Filespec") && seen.insert("EmbeddedFile") {
        record_threat(policy, threats, "EmbeddedFile", ThreatSeverity::High, locator)?;
    }
    for (_, value) in &dict.entries {
        sweep_object(value, locator, policy, threats)?;
    }
    Ok(())
}

fn record_threat(
    policy: Policy,
    threats: &mut Vec<ThreatRecord>,
    kind: &str,
    severity: ThreatSeverity,
    locator: &str,
) -> Result<(), Rejection> {
    let action = match policy {
        Policy::Aggressive => ThreatAction::Rejected,
        Policy::Lenient => ThreatAction::Removed,
    };
    SecurityEvent {
        level: Level::WARN,
        domain: SecurityDomain::Parser,
        severity,
        kind: "blocked_construct",
        locator: Some(locator),
        message: kind,
    }
    .emit();
    threats.push(ThreatRecord {
        kind: kind.to_string(),
        severity,
        locator: locator.to_string(),
        action,
    });
    match policy {
        Policy::Aggressive => Err(Rejection {
            failure: ParseFailure::DisallowedConstruct {
                kind: kind.to_string(),
                locator: locator.to_string(),
            },
            threats: std::mem::take(threats),
        }),
        Policy::Lenient => Ok(()),
    }
}

// ---- page tree ------------------------------------------------------------

struct PageNode {
    dict: PdfDict,
    locator: String,
    inherited_media_box: Option<PdfObj>,
    inherited_crop_box: Option<PdfObj>,
    inherited_resources: Option<PdfObj>,
}

fn walk_page_tree(
    graph: &ObjectGraph,
    pages_obj: &PdfObj,
    limits: &ParseLimits,
) -> Result<Vec<PageNode>, Rejection> {
    let mut out = Vec::new();
    let mut visited = HashSet::new();
    descend(graph, pages_obj, None, None, None, 0, limits, &mut visited, &mut out)?;
    Ok(out)
}

#[allow(clippy::too_many_arguments)]
fn descend(
    graph: &ObjectGraph,
    obj: &PdfObj,
    media_box: Option<&PdfObj>,
    crop_box: Option<&PdfObj>,
    resources: Option<&PdfObj>,
    depth: usize,
    limits: &ParseLimits,
    visited: &mut HashSet<(u32, u16)>,
    out: &mut Vec<PageNode>,
) -> Result<(), Rejection> {
    if depth > MAX_PAGE_TREE_DEPTH {
        return Err(ParseFailure::LimitExceeded { which: "page tree depth".into() }.into());
    }
    let locator = match obj.as_reference() {
        Some((o, g)) => {
            if !visited.insert((o, g)) {
                // A cycle in the page tree is never benign.
                return Err(ParseFailure::Malformed { detail: "page tree cycle".into() }.into());
            }
            format!("{o} {g} obj")
        }
        None => "page tree".to_string(),
    };
    let dict = graph
        .resolve_dict(obj)
        .ok_or(ParseFailure::Truncated { detail: format!("unresolvable page node at {locator}") })?;

    let media_box = dict.get(b"MediaBox").or(media_box);
    let crop_box = dict.get(b"CropBox").or(crop_box);
    let resources = dict.get(b"Resources").or(resources);

    if dict.has_name(b"Type", b"Pages") {
        let kids = dict
            .get(b"Kids")
            .and_then(|k| graph.resolve(k))
            .and_then(|k| k.as_array())
            .ok_or(ParseFailure::Truncated { detail: format!("/Kids missing at {locator}") })?;
        for kid in kids {
            descend(graph, kid, media_box, crop_box, resources, depth + 1, limits, visited, out)?;
        }
        return Ok(());
    }
    if dict.has_name(b"Type", b"Page") {
        if out.len() >= limits.max_pages {
            return Err(ParseFailure::LimitExceeded { which: "pages".into() }.into());
        }
        out.push(PageNode {
            dict: dict.clone(),
            locator,
            inherited_media_box: media_box.cloned(),
            inherited_crop_box: crop_box.cloned(),
            inherited_resources: resources.cloned(),
        });
        return Ok(());
    }
    Err(ParseFailure::Malformed { detail: format!("page tree node of unknown type at {locator}") }
        .into())
}

// ---- page admission -------------------------------------------------------

struct PageReject {
    failure: ParseFailure,
    threats: Vec<ThreatRecord>,
}

struct PageAdmitter<'a> {
    bytes: &'a [u8],
    graph: &'a ObjectGraph,
    limits: &'a ParseLimits,
    locator: String,
    threats: Vec<ThreatRecord>,
    /// Resource names stripped under LENIENT; an op referencing one turns
    /// the drop into a page rejection.
    dropped_fonts: BTreeSet<String>,
    dropped_images: BTreeSet<String>,
}

fn admit_page(
    bytes: &[u8],
    graph: &ObjectGraph,
    node: &PageNode,
    limits: &ParseLimits,
) -> Result<Page, PageReject> {
    let mut admitter = PageAdmitter {
        bytes,
        graph,
        limits,
        locator: node.locator.clone(),
        threats: Vec::new(),
        dropped_fonts: BTreeSet::new(),
        dropped_images: BTreeSet::new(),
    };
    admitter.run(node)
}

impl<'a> PageAdmitter<'a> {
    fn run(mut self, node: &PageNode) -> Result<Page, PageReject> {
        let media_box = match self.rect_entry(&node.dict, b"MediaBox", &node.inherited_media_box) {
            Some(rect) => rect,
            None => {
                let failure = ParseFailure::Malformed {
                    detail: format!("missing or invalid MediaBox at {}", self.locator),
                };
                return Err(self.page_reject(failure));
            }
        };
        if media_box.x1 <= media_box.x0 || media_box.y1 <= media_box.y0 {
            let failure = ParseFailure::Malformed {
                detail: format!("degenerate MediaBox at {}", self.locator),
            };
            return Err(self.page_reject(failure));
        }
        if media_box.width() * media_box.height() > self.limits.max_page_area {
            return Err(self.page_reject(ParseFailure::LimitExceeded { which: "page area".into() }));
        }
        let crop_box = if node.dict.has(b"CropBox") || node.inherited_crop_box.is_some() {
            match self.rect_entry(&node.dict, b"CropBox", &node.inherited_crop_box) {
                Some(rect) if rect.x1 > rect.x0 && rect.y1 > rect.y0 => Some(rect),
                _ => {
                    let failure = ParseFailure::Malformed {
                        detail: format!("invalid CropBox at {}", self.locator),
                    };
                    return Err(self.page_reject(failure));
                }
            }
        } else {
            None
        };

        let resources = node
            .dict
            .get(b"Resources")
            .or(node.inherited_resources.as_ref())
            .and_then(|r| self.graph.resolve_dict(r))
            .cloned();
        let mut fonts = BTreeMap::new();
        let mut images = BTreeMap::new();
        if let Some(resources) = &resources {
            self.admit_fonts(resources, &mut fonts)?;
            self.admit_xobjects(resources, &mut images)?;
        }

        let content = self.collect_content(&node.dict)?;
        let tokens = tokenize_content(&content, self.limits.max_ops_per_page).map_err(|e| {
            if e.downcast_ref::<LimitError>().is_some() {
                self.page_reject(ParseFailure::LimitExceeded { which: "content operators".into() })
            } else {
                self.page_reject(ParseFailure::Malformed {
                    detail: format!("content stream at {}: {e}", self.locator),
                })
            }
        })?;
        let content_ops = self.map_ops(&tokens)?;
        self.check_balance(&content_ops)?;
        self.prune_resources(&content_ops, &mut fonts, &mut images)?;

        Ok(Page { media_box, crop_box, content_ops, fonts, images })
    }

    fn page_reject(&mut self, failure: ParseFailure) -> PageReject {
        PageReject { failure, threats: std::mem::take(&mut self.threats) }
    }

    /// Records a stripped construct and, under AGGRESSIVE, converts it into
    /// an immediate rejection.
    fn strip_or_reject(
        &mut self,
        kind: &str,
        severity: ThreatSeverity,
        locator: &str,
    ) -> Result<(), PageReject> {
        let action = match self.limits.policy {
            Policy::Aggressive => ThreatAction::Rejected,
            Policy::Lenient => ThreatAction::Removed,
        };
        self.threats.push(ThreatRecord {
            kind: kind.to_string(),
            severity,
            locator: locator.to_string(),
            action,
        });
        match self.limits.policy {
            Policy::Aggressive => {
                let failure = ParseFailure::DisallowedConstruct {
                    kind: kind.to_string(),
                    locator: locator.to_string(),
                };
                Err(self.page_reject(failure))
            }
            Policy::Lenient => Ok(()),
        }
    }

    fn rect_entry(
        &self,
        dict: &PdfDict,
        key: &[u8],
        inherited: &Option<PdfObj>,
    ) -> Option<MediaBox> {
        let obj = dict.get(key).or(inherited.as_ref())?;
        let arr = self.graph.resolve(obj)?.as_array()?;
        if arr.len() != 4 {
            return None;
        }
        let mut vals = [0.0f64; 4];
        for (slot, item) in vals.iter_mut().zip(arr) {
            let v = self.graph.resolve(item)?.as_number()?;
            if !v.is_finite() {
                return None;
            }
            *slot = v;
        }
        Some(MediaBox { x0: vals[0], y0: vals[1], x1: vals[2], y1: vals[3] })
    }

    fn admit_fonts(
        &mut self,
        resources: &PdfDict,
        fonts: &mut BTreeMap<String, FontRef>,
    ) -> Result<(), PageReject> {
        let graph = self.graph;
        let entries: Vec<(Vec<u8>, PdfObj)> =
            match resources.get(b"Font").and_then(|f| graph.resolve_dict(f)) {
                Some(font_dict) => font_dict.entries.clone(),
                None => return Ok(()),
            };
        for (name, value) in entries {
            let local = String::from_utf8_lossy(&name).into_owned();
            let locator = format!("{} /Font/{}", self.locator, local);
            let Some(dict) = graph.resolve_dict(&value).cloned() else {
                return Err(self.page_reject(ParseFailure::Malformed {
                    detail: format!("unresolvable font at {locator}"),
                }));
            };
            let standard = dict
                .name(b"BaseFont")
                .and_then(FontRef::from_base_font)
                .filter(|_| !dict.has(b"FontFile"))
                .filter(|_| !dict.has(b"FontFile2"))
                .filter(|_| !dict.has(b"FontFile3"));
            match standard {
                Some(font) => {
                    fonts.insert(local, font);
                }
                None => {
                    self.strip_or_reject("NonStandardFont", ThreatSeverity::High, &locator)?;
                    self.dropped_fonts.insert(local);
                }
            }
        }
        Ok(())
    }

    fn admit_xobjects(
        &mut self,
        resources: &PdfDict,
        images: &mut BTreeMap<String, ImageRef>,
    ) -> Result<(), PageReject> {
        let graph = self.graph;
        let entries: Vec<(Vec<u8>, PdfObj)> =
            match resources.get(b"XObject").and_then(|x| graph.resolve_dict(x)) {
                Some(xobjects) => xobjects.entries.clone(),
                None => return Ok(()),
            };
        for (name, value) in entries {
            let local = String::from_utf8_lossy(&name).into_owned();
            let locator = format!("{} /XObject/{}", self.locator, local);
            let stream = graph.resolve(&value).and_then(|o| match &o.atom {
                PdfAtom::Stream(st) => Some(st.clone()),
                _ => None,
            });
            let Some(stream) = stream else {
                return Err(self.page_reject(ParseFailure::Malformed {
                    detail: format!("unresolvable XObject at {locator}"),
                }));
            };
            if !stream.dict.has_name(b"Subtype", b"Image") {
                // Form XObjects carry arbitrary content streams; never
                // admitted.
                self.strip_or_reject("FormXObject", ThreatSeverity::High, &locator)?;
                self.dropped_images.insert(local);
                continue;
            }
            match self.admit_image(&stream, &locator) {
                Ok(image) => {
                    images.insert(local, image);
                }
                Err(ImageFailure::Disallowed { kind }) => {
                    self.strip_or_reject(&kind, ThreatSeverity::High, &locator)?;
                    self.dropped_images.insert(local);
                }
                Err(ImageFailure::Fatal(failure)) => {
                    // Measurement mismatches and budget hits are malformed
                    // input, not strippable constructs.
                    return Err(self.page_reject(failure));
                }
            }
        }
        Ok(())
    }

    fn admit_image(
        &mut self,
        stream: &PdfStream,
        locator: &str,
    ) -> Result<ImageRef, ImageFailure> {
        let dict = &stream.dict;
        if dict.has(b"ImageMask") {
            return Err(ImageFailure::Disallowed { kind: "ImageMask".into() });
        }
        let width = self.resolved_int(dict, b"Width").ok_or_else(|| ImageFailure::Fatal(
            ParseFailure::Malformed { detail: format!("image without width at {locator}") },
        ))?;
        let height = self.resolved_int(dict, b"Height").ok_or_else(|| ImageFailure::Fatal(
            ParseFailure::Malformed { detail: format!("image without height at {locator}") },
        ))?;
        if width <= 0 || height <= 0 {
            return Err(ImageFailure::Fatal(ParseFailure::Malformed {
                detail: format!("non-positive image dimensions at {locator}"),
            }));
        }
        if width > i64::from(self.limits.max_image_dimension)
            || height > i64::from(self.limits.max_image_dimension)
        {
            return Err(ImageFailure::Fatal(ParseFailure::LimitExceeded {
                which: "image dimension".into(),
            }));
        }
        if (width as u64).saturating_mul(height as u64) > self.limits.max_image_pixels {
            return Err(ImageFailure::Fatal(ParseFailure::LimitExceeded {
                which: "image pixels".into(),
            }));
        }
        let bits = self.resolved_int(dict, b"BitsPerComponent").unwrap_or(8);
        if !matches!(bits, 1 | 2 | 4 | 8 | 16) {
            return Err(ImageFailure::Fatal(ParseFailure::Malformed {
                detail: format!("invalid BitsPerComponent {bits} at {locator}"),
            }));
        }
        let color_space = match dict.get(b"ColorSpace").and_then(|o| self.graph.resolve(o)) {
            Some(obj) => match &obj.atom {
                PdfAtom::Name(n) if n == b"DeviceGray" => ColorSpace::DeviceGray,
                PdfAtom::Name(n) if n == b"DeviceRGB" => ColorSpace::DeviceRGB,
                PdfAtom::Name(n) if n == b"DeviceCMYK" => ColorSpace::DeviceCMYK,
                _ => return Err(ImageFailure::Disallowed { kind: "ImageColorSpace".into() }),
            },
            None => return Err(ImageFailure::Disallowed { kind: "ImageColorSpace".into() }),
        };

        let Some(chain) = normalized_filter_chain(dict) else {
            return Err(ImageFailure::Disallowed { kind: "DisallowedImageFilter".into() });
        };
        for filter in &chain {
            if !self.limits.image_filters.iter().any(|f| f == filter_name(*filter)) {
                return Err(ImageFailure::Disallowed { kind: "DisallowedImageFilter".into() });
            }
        }
        let dct_terminal = chain.last() == Some(&ImageFilter::DCTDecode);
        if chain.iter().take(chain.len().saturating_sub(1)).any(|f| *f != ImageFilter::FlateDecode)
        {
            return Err(ImageFailure::Disallowed { kind: "DisallowedImageFilter".into() });
        }

        let start = stream.data_span.start as usize;
        let end = stream.data_span.end as usize;
        if start > end || end > self.bytes.len() {
            return Err(ImageFailure::Fatal(ParseFailure::Malformed {
                detail: format!("image stream span invalid at {locator}"),
            }));
        }
        let mut data = self.bytes[start..end].to_vec();
        let transport =
            if dct_terminal { &chain[..chain.len() - 1] } else { &chain[..] };
        for _ in transport {
            data = decode_filter(&data, b"FlateDecode", self.limits.max_image_bytes)
                .map_err(|e| self.image_decode_failure(e, locator))?;
        }

        let image = ImageRef {
            width,
            height,
            color_space,
            bits_per_comp: bits,
            filter_chain: chain,
            pixel_data: Vec::new(),
        };
        let pixel_data = if dct_terminal {
            self.measure_jpeg(&data, &image, locator)?
        } else {
            let expected = image.expected_pixel_bytes().ok_or_else(|| {
                ImageFailure::Fatal(ParseFailure::LimitExceeded { which: "image bytes".into() })
            })?;
            if data.len() as u64 != expected {
                return Err(ImageFailure::Fatal(ParseFailure::Malformed {
                    detail: format!(
                        "image length mismatch at {locator}: declared {expected}, decoded {}",
                        data.len()
                    ),
                }));
            }
            data
        };
        if pixel_data.len() > self.limits.max_image_bytes {
            return Err(ImageFailure::Fatal(ParseFailure::LimitExceeded {
                which: "image bytes".into(),
            }));
        }
        Ok(ImageRef { pixel_data, ..image })
    }

    fn image_decode_failure(&self, err: DecodeError, locator: &str) -> ImageFailure {
        match err {
            DecodeError::BudgetExceeded { .. } => {
                ImageFailure::Fatal(ParseFailure::DecompressionBudgetExceeded)
            }
            other => ImageFailure::Fatal(ParseFailure::Malformed {
                detail: format!("image stream at {locator}: {other}"),
            }),
        }
    }

    /// Decodes the JPEG and verifies its own geometry against the
    /// dictionary's claims before the pixels are admitted.
    fn measure_jpeg(
        &self,
        data: &[u8],
        image: &ImageRef,
        locator: &str,
    ) -> Result<Vec<u8>, ImageFailure> {
        let mut decoder = jpeg_decoder::Decoder::new(data);
        decoder.read_info().map_err(|e| {
            ImageFailure::Fatal(ParseFailure::Malformed {
                detail: format!("jpeg header at {locator}: {e}"),
            })
        })?;
        let info = decoder.info().ok_or_else(|| {
            ImageFailure::Fatal(ParseFailure::Malformed {
                detail: format!("jpeg header unreadable at {locator}"),
            })
        })?;
        if i64::from(info.width) != image.width || i64::from(info.height) != image.height {
            return Err(ImageFailure::Fatal(ParseFailure::Malformed {
                detail: format!(
                    "image length mismatch at {locator}: dictionary {}x{}, jpeg {}x{}",
                    image.width, image.height, info.width, info.height
                ),
            }));
        }
        let components: u32 = match info.pixel_format {
            jpeg_decoder::PixelFormat::L8 => 1,
            jpeg_decoder::PixelFormat::RGB24 => 3,
            jpeg_decoder::PixelFormat::CMYK32 => 4,
            other => {
                return Err(ImageFailure::Fatal(ParseFailure::Malformed {
                    detail: format!("jpeg pixel format {other:?} at {locator}"),
                }))
            }
        };
        if components != image.color_space.components() || image.bits_per_comp != 8 {
            return Err(ImageFailure::Fatal(ParseFailure::Malformed {
                detail: format!("jpeg geometry disagrees with dictionary at {locator}"),
            }));
        }
        let pixels = decoder.decode().map_err(|e| {
            ImageFailure::Fatal(ParseFailure::Malformed {
                detail: format!("jpeg decode at {locator}: {e}"),
            })
        })?;
        let expected = (image.width as u64)
            .saturating_mul(image.height as u64)
            .saturating_mul(u64::from(components));
        if pixels.len() as u64 != expected {
            return Err(ImageFailure::Fatal(ParseFailure::Malformed {
                detail: format!("image length mismatch at {locator}"),
            }));
        }
        Ok(pixels)
    }

    fn resolved_int(&self, dict: &PdfDict, key: &[u8]) -> Option<i64> {
        match self.graph.resolve(dict.get(key)?)?.atom {
            PdfAtom::Int(i) => Some(i),
            _ => None,
        }
    }

    fn collect_content(&mut self, dict: &PdfDict) -> Result<Vec<u8>, PageReject> {
        let Some(contents) = dict.get(b"Contents") else {
            return Ok(Vec::new());
        };
        let mut streams = Vec::new();
        match self.graph.resolve(contents).map(|o| &o.atom) {
            Some(PdfAtom::Stream(st)) => streams.push(st.clone()),
            Some(PdfAtom::Array(items)) => {
                let items = items.clone();
                for item in &items {
                    match self.graph.resolve(item).map(|o| &o.atom) {
                        Some(PdfAtom::Stream(st)) => streams.push(st.clone()),
                        _ => {
                            return Err(self.page_reject(ParseFailure::Malformed {
                                detail: format!("non-stream /Contents entry at {}", self.locator),
                            }))
                        }
                    }
                }
            }
            _ => {
                return Err(self.page_reject(ParseFailure::Malformed {
                    detail: format!("unresolvable /Contents at {}", self.locator),
                }))
            }
        }
        let mut out = Vec::new();
        for stream in &streams {
            let decoded = decode_stream(self.bytes, stream, self.limits.decode_limits())
                .map_err(|e| self.content_decode_failure(e))?;
            if !out.is_empty() {
                out.push(b'\n');
            }
            out.extend_from_slice(&decoded);
            if out.len() > self.limits.max_decode_output_bytes {
                return Err(self.page_reject(ParseFailure::DecompressionBudgetExceeded));
            }
        }
        Ok(out)
    }

    fn content_decode_failure(&mut self, err: DecodeError) -> PageReject {
        let failure = match err {
            DecodeError::BudgetExceeded { .. } => ParseFailure::DecompressionBudgetExceeded,
            DecodeError::UnsupportedFilter { filter } => ParseFailure::DisallowedConstruct {
                kind: format!("ContentFilter/{filter}"),
                locator: self.locator.clone(),
            },
            other => ParseFailure::Malformed {
                detail: format!("content stream at {}: {other}", self.locator),
            },
        };
        self.page_reject(failure)
    }

    /// Maps raw operator groups to the IR enumeration. Unknown operators
    /// reject the page rather than being dropped.
    fn map_ops(&mut self, tokens: &[ContentOp]) -> Result<Vec<Op>, PageReject> {
        let mut out = Vec::with_capacity(tokens.len());
        for token in tokens {
            self.map_op(token, &mut out)?;
        }
        Ok(out)
    }

    fn map_op(&mut self, token: &ContentOp, out: &mut Vec<Op>) -> Result<(), PageReject> {
        let ops = token.operands.as_slice();
        match token.operator.as_str() {
            "BT" => out.push(Op::TextBegin),
            "ET" => out.push(Op::TextEnd),
            "Td" => {
                let [x, y] = self.numbers::<2>(token)?;
                out.push(Op::TextMoveAbs { x, y });
            }
            "TD" => {
                let [x, y] = self.numbers::<2>(token)?;
                out.push(Op::TextMoveRel { x, y });
            }
            "T*" => out.push(Op::TextMoveNext),
            "Tm" => {
                let [a, b, c, d, e, f] = self.numbers::<6>(token)?;
                out.push(Op::SetTextMatrix { a, b, c, d, e, f });
            }
            "Tf" => match ops {
                [Operand::Name(name), Operand::Number(size)] => out.push(Op::SetFont {
                    font: String::from_utf8_lossy(name).into_owned(),
                    size: *size,
                }),
                _ => return Err(self.operand_mismatch(token)),
            },
            "Tj" => match ops {
                [Operand::Str(text)] => out.push(Op::ShowText { text: text.clone() }),
                _ => return Err(self.operand_mismatch(token)),
            },
            "TJ" => match ops {
                [Operand::Array(items)] => {
                    let mut converted = Vec::with_capacity(items.len());
                    for item in items {
                        match item {
                            Operand::Str(text) => {
                                converted.push(TextItem::Str { text: text.clone() })
                            }
                            Operand::Number(amount) => {
                                converted.push(TextItem::Adjust { amount: *amount })
                            }
                            _ => return Err(self.operand_mismatch(token)),
                        }
                    }
                    out.push(Op::ShowTextArray { items: converted });
                }
                _ => return Err(self.operand_mismatch(token)),
            },
            "'" => match ops {
                [Operand::Str(text)] => {
                    out.push(Op::TextMoveNext);
                    out.push(Op::ShowText { text: text.clone() });
                }
                _ => return Err(self.operand_mismatch(token)),
            },
            "m" => {
                let [x, y] = self.numbers::<2>(token)?;
                out.push(Op::MoveTo { x, y });
            }
            "l" => {
                let [x, y] = self.numbers::<2>(token)?;
                out.push(Op::LineTo { x, y });
            }
            "c" => {
                let [x1, y1, x2, y2, x3, y3] = self.numbers::<6>(token)?;
                out.push(Op::CurveTo { x1, y1, x2, y2, x3, y3 });
            }
            "h" => out.push(Op::ClosePath),
            "re" => {
                let [x, y, w, h] = self.numbers::<4>(token)?;
                out.push(Op::Rect { x, y, w, h });
            }
            "f" => out.push(Op::Fill),
            "S" => out.push(Op::Stroke),
            "n" => out.push(Op::EndPath),
            "q" => out.push(Op::SaveGraphicsState),
            "Q" => out.push(Op::RestoreGraphicsState),
            "cm" => {
                let [a, b, c, d, e, f] = self.numbers::<6>(token)?;
                out.push(Op::Concat { a, b, c, d, e, f });
            }
            "Do" => match ops {
                [Operand::Name(name)] => out.push(Op::InvokeXObject {
                    name: String::from_utf8_lossy(name).into_owned(),
                }),
                _ => return Err(self.operand_mismatch(token)),
            },
            other => {
                let locator = format!("{} op {}", self.locator, other);
                self.threats.push(ThreatRecord {
                    kind: format!("DisallowedOperator/{other}"),
                    severity: ThreatSeverity::High,
                    locator: locator.clone(),
                    action: match self.limits.policy {
                        Policy::Aggressive => ThreatAction::Rejected,
                        Policy::Lenient => ThreatAction::Removed,
                    },
                });
                let failure = ParseFailure::DisallowedConstruct {
                    kind: format!("Operator/{other}"),
                    locator,
                };
                return Err(self.page_reject(failure));
            }
        }
        Ok(())
    }

    fn numbers<const N: usize>(&mut self, token: &ContentOp) -> Result<[f64; N], PageReject> {
        if token.operands.len() != N {
            return Err(self.operand_mismatch(token));
        }
        let mut out = [0.0f64; N];
        for (slot, operand) in out.iter_mut().zip(&token.operands) {
            match operand {
                Operand::Number(v) if v.is_finite() => *slot = *v,
                _ => return Err(self.operand_mismatch(token)),
            }
        }
        Ok(out)
    }

    fn operand_mismatch(&mut self, token: &ContentOp) -> PageReject {
        self.page_reject(ParseFailure::Malformed {
            detail: format!(
                "operator {} with unexpected operands at {}",
                token.operator, self.locator
            ),
        })
    }

    /// Graphics-state saves and text objects must balance.
    fn check_balance(&mut self, ops: &[Op]) -> Result<(), PageReject> {
        let mut gstate_depth = 0usize;
        let mut in_text = false;
        for op in ops {
            match op {
                Op::SaveGraphicsState => {
                    gstate_depth += 1;
                    if gstate_depth > self.limits.max_gstate_depth {
                        return Err(self.page_reject(ParseFailure::LimitExceeded {
                            which: "graphics state depth".into(),
                        }));
                    }
                }
                Op::RestoreGraphicsState => {
                    if gstate_depth == 0 {
                        return Err(self.page_reject(ParseFailure::Malformed {
                            detail: format!("unbalanced Q at {}", self.locator),
                        }));
                    }
                    gstate_depth -= 1;
                }
                Op::TextBegin => {
                    if in_text {
                        return Err(self.page_reject(ParseFailure::Malformed {
                            detail: format!("nested BT at {}", self.locator),
                        }));
                    }
                    in_text = true;
                }
                Op::TextEnd => {
                    if !in_text {
                        return Err(self.page_reject(ParseFailure::Malformed {
                            detail: format!("ET without BT at {}", self.locator),
                        }));
                    }
                    in_text = false;
                }
                _ => {}
            }
        }
        if gstate_depth != 0 || in_text {
            return Err(self.page_reject(ParseFailure::Malformed {
                detail: format!("unbalanced state at end of page {}", self.locator),
            }));
        }
        Ok(())
    }

    /// Every referenced resource must resolve, and only referenced
    /// resources survive into the IR.
    fn prune_resources(
        &mut self,
        ops: &[Op],
        fonts: &mut BTreeMap<String, FontRef>,
        images: &mut BTreeMap<String, ImageRef>,
    ) -> Result<(), PageReject> {
        let mut used_fonts = BTreeSet::new();
        let mut used_images = BTreeSet::new();
        for op in ops {
            match op {
                Op::SetFont { font, .. } => {
                    used_fonts.insert(font.clone());
                }
                Op::InvokeXObject { name } => {
                    used_images.insert(name.clone());
                }
                _ => {}
            }
        }
        for font in &used_fonts {
            if !fonts.contains_key(font) {
                let failure = if self.dropped_fonts.contains(font) {
                    ParseFailure::DisallowedConstruct {
                        kind: "NonStandardFont".into(),
                        locator: format!("{} /Font/{}", self.locator, font),
                    }
                } else {
                    ParseFailure::Malformed {
                        detail: format!("unresolved font {} at {}", font, self.locator),
                    }
                };
                return Err(self.page_reject(failure));
            }
        }
        for image in &used_images {
            if !images.contains_key(image) {
                let failure = if self.dropped_images.contains(image) {
                    ParseFailure::DisallowedConstruct {
                        kind: "DisallowedXObject".into(),
                        locator: format!("{} /XObject/{}", self.locator, image),
                    }
                } else {
                    ParseFailure::Malformed {
                        detail: format!("unresolved XObject {} at {}", image, self.locator),
                    }
                };
                return Err(self.page_reject(failure));
            }
        }
        fonts.retain(|name, _| used_fonts.contains(name));
        images.retain(|name, _| used_images.contains(name));
        Ok(())
    }
}

enum ImageFailure {
    /// Strippable under LENIENT.
    Disallowed { kind: String },
    /// Malformed or over-budget; rejects the page under either policy.
    Fatal(ParseFailure),
}

/// `None` when the chain names a filter outside the recognizable image
/// set; the caller treats that as a disallowed construct.
fn normalized_filter_chain(dict: &PdfDict) -> Option<Vec<ImageFilter>> {
    stz_pdf_pdf::decode::stream_filters(dict)
        .iter()
        .map(|name| match name.as_slice() {
            b"FlateDecode" | b"Fl" => Some(ImageFilter::FlateDecode),
            b"DCTDecode" | b"DCT" => Some(ImageFilter::DCTDecode),
            b"CCITTFaxDecode" | b"CCF" => Some(ImageFilter::CCITTFaxDecode),
            b"JBIG2Decode" => Some(ImageFilter::JBIG2Decode),
            _ => None,
        })
        .collect()
}

fn filter_name(filter: ImageFilter) -> &'static str {
    match filter {
        ImageFilter::FlateDecode => "FlateDecode",
        ImageFilter::DCTDecode => "DCTDecode",
        ImageFilter::CCITTFaxDecode => "CCITTFaxDecode",
        ImageFilter::JBIG2Decode => "JBIG2Decode",
    }
}
