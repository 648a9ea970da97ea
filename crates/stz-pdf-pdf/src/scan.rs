use std::collections::HashMap;

use anyhow::Result;
use thiserror::Error;
use tracing::{debug, warn};

use crate::decode::{decode_stream, DecodeLimits};
use crate::object::{PdfAtom, PdfDict, PdfObj};
use crate::parser::{scan_indirect_objects, Parser};
use crate::span::Span;

/// A structural resource cap was hit while building the object graph.
/// Distinct from malformed input so callers can report it as such.
#[derive(Debug, Clone, Error)]
#[error("{which} limit exceeded")]
pub struct LimitError {
    pub which: &'static str,
}

#[derive(Debug, Clone, Copy)]
pub struct ScanLimits {
    pub max_objects: usize,
    pub max_objstm_streams: usize,
    pub max_objstm_entries: usize,
    pub decode: DecodeLimits,
}

impl Default for ScanLimits {
    fn default() -> Self {
        Self {
            max_objects: 500_000,
            max_objstm_streams: 100,
            max_objstm_entries: 10_000,
            decode: DecodeLimits::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GraphObject {
    pub obj: u32,
    pub gen: u16,
    pub body: PdfObj,
    /// True when the object came out of an expanded `/ObjStm`. Such objects
    /// carry no usable byte spans into the original input.
    pub from_objstm: bool,
}

impl GraphObject {
    /// Human-readable position for rejection locators and audit records.
    pub fn locator(&self) -> String {
        format!("{} {} obj", self.obj, self.gen)
    }
}

/// Flat, owned view of every indirect object found by linear sweep, plus
/// all trailer dictionaries. Byte offsets claimed by the xref table are
/// never used to locate objects.
#[derive(Debug)]
pub struct ObjectGraph {
    pub objects: Vec<GraphObject>,
    index: HashMap<(u32, u16), usize>,
    pub trailers: Vec<PdfDict>,
}

impl ObjectGraph {
    pub fn get(&self, obj: u32, gen: u16) -> Option<&GraphObject> {
        self.index.get(&(obj, gen)).map(|&i| &self.objects[i])
    }

    /// Follows reference chains to a direct object, with a hop cap so a
    /// reference cycle cannot hang the walk.
    pub fn resolve<'g>(&'g self, obj: &'g PdfObj) -> Option<&'g PdfObj> {
        let mut cur = obj;
        for _ in 0..32 {
            match cur.atom {
                PdfAtom::Ref { obj, gen } => {
                    cur = &self.get(obj, gen)?.body;
                }
                _ => return Some(cur),
            }
        }
        None
    }

    pub fn resolve_dict<'g>(&'g self, obj: &'g PdfObj) -> Option<&'g PdfDict> {
        self.resolve(obj).and_then(|o| o.as_dict())
    }

    /// The document catalog reference, taken from the newest trailer that
    /// carries `/Root`.
    pub fn root_ref(&self) -> Option<(u32, u16)> {
        self.trailers
            .iter()
            .rev()
            .find_map(|t| t.get(b"Root").and_then(|o| o.as_reference()))
    }

    pub fn is_encrypted(&self) -> bool {
        self.trailers.iter().any(|t| t.has(b"Encrypt"))
    }
}

pub fn scan_graph(bytes: &[u8], limits: ScanLimits) -> Result<ObjectGraph> {
    let swept = scan_indirect_objects(bytes, limits.max_objects)?;
    let mut objects: Vec<GraphObject> = swept
        .into_iter()
        .map(|o| GraphObject { obj: o.obj, gen: o.gen, body: o.body, from_objstm: false })
        .collect();

    let mut trailers = classic_trailers(bytes);
    for entry in &objects {
        if let PdfAtom::Stream(st) = &entry.body.atom {
            if st.dict.has_name(b"Type", b"XRef") {
                trailers.push(st.dict.clone());
            }
        }
    }

    expand_object_streams(bytes, &mut objects, limits)?;

    let mut index = HashMap::with_capacity(objects.len());
    for (i, o) in objects.iter().enumerate() {
        // Later definitions shadow earlier ones, matching the incremental
        // update semantics a conforming reader applies.
        index.insert((o.obj, o.gen), i);
    }
    debug!(objects = objects.len(), trailers = trailers.len(), "object graph built");
    Ok(ObjectGraph { objects, index, trailers })
}

/// Trailer dictionaries introduced by the classic `trailer` keyword, in
/// file order.
fn classic_trailers(bytes: &[u8]) -> Vec<PdfDict> {
    let mut out = Vec::new();
    for pos in memchr::memmem::find_iter(bytes, b"trailer") {
        let after = pos + b"trailer".len();
        if after >= bytes.len() {
            continue;
        }
        let mut p = Parser::new(bytes, after);
        p.skip_ws_and_comments();
        if let Ok(obj) = p.parse_object() {
            if let PdfAtom::Dict(d) = obj.atom {
                out.push(d);
            }
        }
    }
    out
}

/// Expands `/ObjStm` streams so documents whose catalog lives in a
/// compressed object stream still resolve. Streams nested inside an
/// object stream are forbidden by the format and rejected here.
fn expand_object_streams(
    bytes: &[u8],
    objects: &mut Vec<GraphObject>,
    limits: ScanLimits,
) -> Result<()> {
    let mut expanded = Vec::new();
    let mut stream_count = 0usize;
    for entry in objects.iter() {
        let PdfAtom::Stream(st) = &entry.body.atom else {
            continue;
        };
        if !st.dict.has_name(b"Type", b"ObjStm") {
            continue;
        }
        stream_count += 1;
        if stream_count > limits.max_objstm_streams {
            warn!(
                security = true,
                domain = "pdf.object_stream",
                kind = "objstm_count_exceeded",
                max = limits.max_objstm_streams,
                "Object stream count limit exceeded"
            );
            return Err(LimitError { which: "object streams" }.into());
        }
        let n = st.dict.int(b"N").and_then(|v| usize::try_from(v).ok()).unwrap_or(0);
        let first = st.dict.int(b"First").and_then(|v| usize::try_from(v).ok()).unwrap_or(0);
        if n == 0 || n > limits.max_objstm_entries {
            if n > limits.max_objstm_entries {
                return Err(LimitError { which: "object stream entries" }.into());
            }
            continue;
        }
        let data = decode_stream(bytes, st, limits.decode)?;
        if first > data.len() {
            warn!(
                security = true,
                domain = "pdf.object_stream",
                kind = "objstm_first_out_of_range",
                first = first,
                "ObjStm /First outside decoded data"
            );
            continue;
        }
        let pairs = objstm_header_pairs(&data[..first], n);
        for (obj_num, offset) in pairs {
            let Some(pos) = first.checked_add(offset) else { continue };
            if pos >= data.len() {
                continue;
            }
            let mut p = Parser::new(&data, pos);
            let Ok(body) = p.parse_object() else { continue };
            if matches!(body.atom, PdfAtom::Stream(_)) {
                warn!(
                    security = true,
                    domain = "pdf.object_stream",
                    kind = "stream_inside_objstm",
                    obj = obj_num,
                    "Stream object inside ObjStm rejected"
                );
                continue;
            }
            expanded.push(GraphObject {
                obj: obj_num,
                gen: 0,
                body: strip_foreign_spans(body),
                from_objstm: true,
            });
            if objects.len() + expanded.len() > limits.max_objects {
                return Err(LimitError { which: "objects" }.into());
            }
        }
    }
    objects.append(&mut expanded);
    Ok(())
}

/// `N` pairs of `obj-number offset` integers from an ObjStm header.
fn objstm_header_pairs(header: &[u8], n: usize) -> Vec<(u32, usize)> {
    let mut out = Vec::with_capacity(n);
    let mut p = Parser::new(header, 0);
    for _ in 0..n {
        p.skip_ws_and_comments();
        let Ok(first) = p.parse_object() else { break };
        p.skip_ws_and_comments();
        let Ok(second) = p.parse_object() else { break };
        match (first.atom, second.atom) {
            (PdfAtom::Int(obj), PdfAtom::Int(off)) if obj >= 0 && off >= 0 => {
                let Ok(obj) = u32::try_from(obj) else { break };
                let Ok(off) = usize::try_from(off) else { break };
                out.push((obj, off));
            }
            _ => break,
        }
    }
    out
}

/// Objects parsed out of a decoded buffer keep spans into that buffer,
/// which is dropped on return. Zero them so nothing downstream mistakes
/// them for input offsets.
fn strip_foreign_spans(mut obj: PdfObj) -> PdfObj {
    fn walk(obj: &mut PdfObj) {
        obj.span = Span { start: 0, end: 0 };
        match &mut obj.atom {
            PdfAtom::Array(items) => items.iter_mut().for_each(walk),
            PdfAtom::Dict(dict) => {
                dict.span = Span { start: 0, end: 0 };
                dict.entries.iter_mut().for_each(|(_, v)| walk(v));
            }
            _ => {}
        }
    }
    walk(&mut obj);
    obj
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::ZlibEncoder;
    use flate2::Compression;
    use std::io::Write;

    fn minimal_pdf() -> Vec<u8> {
        let mut pdf = Vec::new();
        pdf.extend_from_slice(b"%PDF-1.4\n");
        pdf.extend_from_slice(b"1 0 obj << /Type /Catalog /Pages 2 0 R >> endobj\n");
        pdf.extend_from_slice(b"2 0 obj << /Type /Pages /Kids [3 0 R] /Count 1 >> endobj\n");
        pdf.extend_from_slice(
            b"3 0 obj << /Type /Page /Parent 2 0 R /MediaBox [0 0 612 792] >> endobj\n",
        );
        pdf.extend_from_slice(b"trailer << /Root 1 0 R /Size 4 >>\nstartxref\n0\n%%EOF\n");
        pdf
    }

    #[test]
    fn graph_resolves_root_and_pages() {
        let bytes = minimal_pdf();
        let graph = scan_graph(&bytes, ScanLimits::default()).expect("scan");
        let root = graph.root_ref().expect("root ref");
        let catalog = &graph.get(root.0, root.1).expect("catalog").body;
        let dict = catalog.as_dict().expect("catalog dict");
        assert!(dict.has_name(b"Type", b"Catalog"));
        assert!(!graph.is_encrypted());
    }

    #[test]
    fn encrypt_in_trailer_is_visible() {
        let mut bytes = minimal_pdf();
        let tail = b"trailer << /Root 1 0 R /Encrypt 9 0 R >>\n";
        bytes.extend_from_slice(tail);
        let graph = scan_graph(&bytes, ScanLimits::default()).expect("scan");
        assert!(graph.is_encrypted());
    }

    #[test]
    fn objstm_objects_become_visible() {
        // Object 4 lives inside a compressed object stream.
        let header = b"4 0 ";
        let mut payload = Vec::new();
        payload.extend_from_slice(header);
        payload.extend_from_slice(b"<< /Marker /InsideObjStm >>");
        let mut enc = ZlibEncoder::new(Vec::new(), Compression::default());
        enc.write_all(&payload).expect("zlib write");
        let compressed = enc.finish().expect("zlib finish");

        let mut pdf = Vec::new();
        pdf.extend_from_slice(b"%PDF-1.5\n");
        pdf.extend_from_slice(
            format!(
                "5 0 obj << /Type /ObjStm /N 1 /First {} /Length {} /Filter /FlateDecode >>\nstream\n",
                header.len(),
                compressed.len()
            )
            .as_bytes(),
        );
        pdf.extend_from_slice(&compressed);
        pdf.extend_from_slice(b"\nendstream endobj\n");
        let graph = scan_graph(&pdf, ScanLimits::default()).expect("scan");
        let inner = graph.get(4, 0).expect("expanded object");
        assert!(inner.from_objstm);
        assert!(inner.body.as_dict().expect("dict").has_name(b"Marker", b"InsideObjStm"));
    }

    #[test]
    fn shadowed_objects_resolve_to_newest() {
        let mut pdf = Vec::new();
        pdf.extend_from_slice(b"%PDF-1.4\n");
        pdf.extend_from_slice(b"1 0 obj << /Version /Old >> endobj\n");
        pdf.extend_from_slice(b"1 0 obj << /Version /New >> endobj\n");
        let graph = scan_graph(&pdf, ScanLimits::default()).expect("scan");
        let body = &graph.get(1, 0).expect("object").body;
        assert!(body.as_dict().expect("dict").has_name(b"Version", b"New"));
    }
}
