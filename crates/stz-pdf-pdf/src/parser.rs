use anyhow::{anyhow, bail, Result};
use tracing::{trace, warn};

use crate::lexer::{hex_val, is_delimiter, is_whitespace, Cursor};
use crate::object::{PdfAtom, PdfDict, PdfObj, PdfStream};
use crate::span::Span;

const MAX_ARRAY_ELEMENTS: usize = 100_000;
const MAX_DICT_ENTRIES: usize = 10_000;
const MAX_PARSE_DEPTH: usize = 64;
const MAX_NAME_BYTES: usize = 4_096;
const MAX_STRING_BYTES: usize = 8 * 1024 * 1024;

/// Strict recursive-descent parser over one object. Anything outside the
/// grammar is an error; there is no recovery mode. A parser that guesses is
/// an attacker's tool.
pub struct Parser<'a> {
    cur: Cursor<'a>,
}

impl<'a> Parser<'a> {
    pub fn new(bytes: &'a [u8], pos: usize) -> Self {
        Self { cur: Cursor::new(bytes, pos) }
    }

    pub fn position(&self) -> usize {
        self.cur.pos
    }

    pub fn skip_ws_and_comments(&mut self) {
        self.cur.skip_ws_and_comments();
    }

    pub fn parse_object(&mut self) -> Result<PdfObj> {
        self.parse_object_at_depth(0)
    }

    fn parse_object_at_depth(&mut self, depth: usize) -> Result<PdfObj> {
        if depth >= MAX_PARSE_DEPTH {
            warn!(
                security = true,
                domain = "pdf.parser",
                kind = "parse_depth_exceeded",
                depth = depth,
                "Object nesting limit exceeded"
            );
            bail!("object nesting exceeds {MAX_PARSE_DEPTH}");
        }
        self.cur.skip_ws_and_comments();
        let start = self.cur.pos;
        let b = self.cur.peek().ok_or_else(|| anyhow!("unexpected end of input"))?;
        let atom = match b {
            b'/' => PdfAtom::Name(self.parse_name()?),
            b'<' => {
                if self.cur.peek_at(1) == Some(b'<') {
                    let dict = self.parse_dict_at_depth(depth + 1)?;
                    if self.at_stream_keyword() {
                        PdfAtom::Stream(self.parse_stream_body(dict)?)
                    } else {
                        PdfAtom::Dict(dict)
                    }
                } else {
                    PdfAtom::Str(self.parse_hex_string()?)
                }
            }
            b'(' => PdfAtom::Str(self.parse_literal_string()?),
            b'[' => PdfAtom::Array(self.parse_array_at_depth(depth + 1)?),
            b't' if self.cur.eat_keyword(b"true") => PdfAtom::Bool(true),
            b'f' if self.cur.eat_keyword(b"false") => PdfAtom::Bool(false),
            b'n' if self.cur.eat_keyword(b"null") => PdfAtom::Null,
            b'+' | b'-' | b'.' | b'0'..=b'9' => self.parse_number_or_ref()?,
            other => bail!("unexpected byte 0x{other:02x} at offset {}", self.cur.pos),
        };
        Ok(PdfObj { span: Span::at(start, self.cur.pos), atom })
    }

    fn parse_array_at_depth(&mut self, depth: usize) -> Result<Vec<PdfObj>> {
        let _ = self.cur.bump();
        let mut out = Vec::new();
        loop {
            self.cur.skip_ws_and_comments();
            match self.cur.peek() {
                Some(b']') => {
                    self.cur.bump();
                    return Ok(out);
                }
                Some(_) => {}
                None => bail!("unterminated array"),
            }
            if out.len() >= MAX_ARRAY_ELEMENTS {
                warn!(
                    security = true,
                    domain = "pdf.parser",
                    kind = "array_size_limit_exceeded",
                    max_elements = MAX_ARRAY_ELEMENTS,
                    "Array element limit exceeded"
                );
                bail!("array exceeds {MAX_ARRAY_ELEMENTS} elements");
            }
            out.push(self.parse_object_at_depth(depth + 1)?);
        }
    }

    fn parse_dict_at_depth(&mut self, depth: usize) -> Result<PdfDict> {
        let start = self.cur.pos;
        self.cur.eat_keyword(b"<<");
        let mut entries: Vec<(Vec<u8>, PdfObj)> = Vec::new();
        loop {
            self.cur.skip_ws_and_comments();
            if self.cur.eat_keyword(b">>") {
                break;
            }
            if self.cur.eof() {
                bail!("unterminated dictionary");
            }
            if self.cur.peek() != Some(b'/') {
                bail!("dictionary key is not a name at offset {}", self.cur.pos);
            }
            if entries.len() >= MAX_DICT_ENTRIES {
                warn!(
                    security = true,
                    domain = "pdf.parser",
                    kind = "dict_size_limit_exceeded",
                    max_entries = MAX_DICT_ENTRIES,
                    "Dictionary entry limit exceeded"
                );
                bail!("dictionary exceeds {MAX_DICT_ENTRIES} entries");
            }
            let key = self.parse_name()?;
            let value = self.parse_object_at_depth(depth + 1)?;
            entries.push((key, value));
        }
        Ok(PdfDict { span: Span::at(start, self.cur.pos), entries })
    }

    /// Name token with `#xx` escapes decoded. The leading slash is consumed
    /// and not part of the payload.
    fn parse_name(&mut self) -> Result<Vec<u8>> {
        let _ = self.cur.bump();
        let raw = self.cur.read_regular_token();
        let raw = self.cur.slice(raw);
        if raw.len() > MAX_NAME_BYTES {
            bail!("name exceeds {MAX_NAME_BYTES} bytes");
        }
        let mut out = Vec::with_capacity(raw.len());
        let mut i = 0usize;
        while i < raw.len() {
            if raw[i] == b'#' {
                match (raw.get(i + 1).copied().and_then(hex_val), raw.get(i + 2).copied().and_then(hex_val)) {
                    (Some(h), Some(l)) => {
                        out.push((h << 4) | l);
                        i += 3;
                        continue;
                    }
                    _ => bail!("invalid #-escape in name"),
                }
            }
            out.push(raw[i]);
            i += 1;
        }
        Ok(out)
    }

    fn parse_literal_string(&mut self) -> Result<Vec<u8>> {
        let _ = self.cur.bump();
        let mut depth = 1u32;
        let mut out = Vec::new();
        while let Some(b) = self.cur.bump() {
            if out.len() > MAX_STRING_BYTES {
                bail!("string exceeds {MAX_STRING_BYTES} bytes");
            }
            match b {
                b'(' => {
                    depth += 1;
                    out.push(b);
                }
                b')' => {
                    depth -= 1;
                    if depth == 0 {
                        return Ok(out);
                    }
                    out.push(b);
                }
                b'\\' => match self.cur.bump() {
                    Some(b'n') => out.push(b'\n'),
                    Some(b'r') => out.push(b'\r'),
                    Some(b't') => out.push(b'\t'),
                    Some(b'b') => out.push(0x08),
                    Some(b'f') => out.push(0x0c),
                    Some(c @ (b'(' | b')' | b'\\')) => out.push(c),
                    Some(nl @ (b'\n' | b'\r')) => {
                        // Line continuation; \r\n counts as one newline.
                        if nl == b'\r' && self.cur.peek() == Some(b'\n') {
                            self.cur.bump();
                        }
                    }
                    Some(d @ b'0'..=b'7') => {
                        let mut val = u16::from(d - b'0');
                        for _ in 0..2 {
                            match self.cur.peek() {
                                Some(o @ b'0'..=b'7') => {
                                    val = val * 8 + u16::from(o - b'0');
                                    self.cur.bump();
                                }
                                _ => break,
                            }
                        }
                        out.push((val & 0xff) as u8);
                    }
                    Some(other) => out.push(other),
                    None => bail!("unterminated escape in literal string"),
                },
                _ => out.push(b),
            }
        }
        bail!("unterminated literal string")
    }

    fn parse_hex_string(&mut self) -> Result<Vec<u8>> {
        let _ = self.cur.bump();
        let mut digits = Vec::new();
        loop {
            match self.cur.bump() {
                Some(b'>') => break,
                Some(b) if is_whitespace(b) => {}
                Some(b) => match hex_val(b) {
                    Some(v) => {
                        if digits.len() > MAX_STRING_BYTES {
                            bail!("hex string exceeds {MAX_STRING_BYTES} digits");
                        }
                        digits.push(v);
                    }
                    None => bail!("invalid hex digit 0x{b:02x} in string"),
                },
                None => bail!("unterminated hex string"),
            }
        }
        let mut out = Vec::with_capacity(digits.len() / 2 + 1);
        for pair in digits.chunks(2) {
            let hi = pair[0];
            let lo = pair.get(1).copied().unwrap_or(0);
            out.push((hi << 4) | lo);
        }
        Ok(out)
    }

    /// Numbers are parsed as decimal text and converted once; a token that
    /// does not survive the round through `i64`/`f64` is rejected, as are
    /// non-finite results.
    fn parse_number_or_ref(&mut self) -> Result<PdfAtom> {
        let (first_span, first) = self.read_number_token()?;
        let after_first = self.cur.mark();
        self.cur.skip_ws_and_comments();
        if let Ok((_, second)) = self.read_number_token() {
            self.cur.skip_ws_and_comments();
            if self.cur.eat_keyword(b"R") {
                let obj = first
                    .parse::<u32>()
                    .map_err(|_| anyhow!("reference object number out of range"))?;
                let gen = second
                    .parse::<u16>()
                    .map_err(|_| anyhow!("reference generation out of range"))?;
                return Ok(PdfAtom::Ref { obj, gen });
            }
        }
        self.cur.restore(after_first);
        number_atom(&first, first_span)
    }

    fn read_number_token(&mut self) -> Result<(Span, String)> {
        let start = self.cur.pos;
        match self.cur.peek() {
            Some(b'+' | b'-' | b'.') | Some(b'0'..=b'9') => {
                self.cur.bump();
            }
            _ => bail!("expected number at offset {start}"),
        }
        while let Some(b) = self.cur.peek() {
            if b.is_ascii_digit() || b == b'.' {
                self.cur.bump();
            } else {
                break;
            }
        }
        let span = Span::at(start, self.cur.pos);
        let text = String::from_utf8_lossy(self.cur.slice(span)).into_owned();
        Ok((span, text))
    }

    fn at_stream_keyword(&mut self) -> bool {
        let mark = self.cur.mark();
        self.cur.skip_ws_and_comments();
        let hit = self.cur.eat_keyword(b"stream");
        self.cur.restore(mark);
        hit
    }

    fn parse_stream_body(&mut self, dict: PdfDict) -> Result<PdfStream> {
        self.cur.skip_ws_and_comments();
        self.cur.eat_keyword(b"stream");
        // Exactly one EOL after the keyword per the PDF grammar.
        if self.cur.peek() == Some(b'\r') {
            self.cur.bump();
        }
        if self.cur.peek() == Some(b'\n') {
            self.cur.bump();
        }
        let data_start = self.cur.pos;
        let declared = dict.int(b"Length").and_then(|v| usize::try_from(v).ok());
        let data_end = match declared {
            Some(len) => {
                let end = data_start
                    .checked_add(len)
                    .ok_or_else(|| anyhow!("stream length overflows"))?;
                if end > self.cur.bytes.len() {
                    bail!("stream data runs past end of input");
                }
                // The declared length must actually land on the endstream
                // keyword; a lying /Length is how payloads hide.
                if !endstream_at(self.cur.bytes, end) {
                    match find_endstream(self.cur.bytes, data_start) {
                        Some(real_end) => real_end,
                        None => bail!("endstream keyword missing"),
                    }
                } else {
                    end
                }
            }
            None => find_endstream(self.cur.bytes, data_start)
                .ok_or_else(|| anyhow!("endstream keyword missing"))?,
        };
        self.cur.pos = data_end;
        self.cur.skip_ws_and_comments();
        if !self.cur.eat_keyword(b"endstream") {
            bail!("endstream keyword missing");
        }
        Ok(PdfStream { dict, data_span: Span::at(data_start, data_end) })
    }
}

fn number_atom(text: &str, span: Span) -> Result<PdfAtom> {
    if text.contains('.') {
        let v = text
            .parse::<f64>()
            .map_err(|_| anyhow!("malformed real at offset {}", span.start))?;
        if !v.is_finite() {
            bail!("non-finite real at offset {}", span.start);
        }
        Ok(PdfAtom::Real(v))
    } else {
        let v = text
            .parse::<i64>()
            .map_err(|_| anyhow!("integer out of range at offset {}", span.start))?;
        Ok(PdfAtom::Int(v))
    }
}

fn endstream_at(bytes: &[u8], mut pos: usize) -> bool {
    while pos < bytes.len() && is_whitespace(bytes[pos]) {
        pos += 1;
    }
    bytes[pos..].starts_with(b"endstream")
}

fn find_endstream(bytes: &[u8], start: usize) -> Option<usize> {
    memchr::memmem::find(&bytes[start..], b"endstream").map(|off| {
        // Trim the EOL that precedes the keyword.
        let mut end = start + off;
        while end > start && is_whitespace(bytes[end - 1]) {
            end -= 1;
        }
        end
    })
}

/// One `N G obj ... endobj` occurrence.
#[derive(Debug, Clone)]
pub struct IndirectObject {
    pub obj: u32,
    pub gen: u16,
    pub body: PdfObj,
    pub header_span: Span,
    pub full_span: Span,
}

pub fn parse_indirect_object_at(bytes: &[u8], offset: usize) -> Result<(IndirectObject, usize)> {
    let mut p = Parser::new(bytes, offset);
    p.cur.skip_ws_and_comments();
    let header_start = p.cur.pos;
    let (_, obj_text) = p.read_number_token()?;
    p.cur.skip_ws_and_comments();
    let (_, gen_text) = p.read_number_token()?;
    p.cur.skip_ws_and_comments();
    if !p.cur.eat_keyword(b"obj") {
        bail!("missing obj keyword");
    }
    let header_end = p.cur.pos;
    let obj = obj_text.parse::<u32>().map_err(|_| anyhow!("object number out of range"))?;
    let gen = gen_text.parse::<u16>().map_err(|_| anyhow!("generation out of range"))?;
    let body = p.parse_object()?;
    p.cur.skip_ws_and_comments();
    if !p.cur.eat_keyword(b"endobj") {
        bail!("missing endobj keyword");
    }
    let full_end = p.cur.pos;
    trace!(obj, gen, end = full_end, "parsed indirect object");
    Ok((
        IndirectObject {
            obj,
            gen,
            body,
            header_span: Span::at(header_start, header_end),
            full_span: Span::at(header_start, full_end),
        },
        full_end,
    ))
}

/// Linear sweep for indirect objects. Offsets in the xref table are never
/// trusted; every object admitted downstream was found and parsed here.
/// Junk between objects is skipped, objects themselves parse strictly.
pub fn scan_indirect_objects(bytes: &[u8], max_objects: usize) -> Result<Vec<IndirectObject>> {
    let mut out = Vec::new();
    let mut i = 0usize;
    while i < bytes.len() {
        if !bytes[i].is_ascii_digit() || !at_token_boundary(bytes, i) {
            i += 1;
            continue;
        }
        if max_objects > 0 && out.len() >= max_objects {
            warn!(
                security = true,
                domain = "pdf.parser",
                kind = "max_objects_reached",
                max_objects = max_objects,
                "Indirect object limit reached during sweep"
            );
            return Err(crate::scan::LimitError { which: "objects" }.into());
        }
        match parse_indirect_object_at(bytes, i) {
            Ok((entry, end)) => {
                out.push(entry);
                i = end;
            }
            Err(_) => i += 1,
        }
    }
    Ok(out)
}

fn at_token_boundary(bytes: &[u8], pos: usize) -> bool {
    pos == 0 || is_whitespace(bytes[pos - 1]) || is_delimiter(bytes[pos - 1])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_nested_dict_with_stream() {
        let data = b"<< /Length 5 /Filter /FlateDecode >>\nstream\nabcde\nendstream";
        let mut p = Parser::new(data, 0);
        let obj = p.parse_object().expect("parse stream object");
        match obj.atom {
            PdfAtom::Stream(st) => {
                assert_eq!(st.data_span.len(), 5);
                assert!(st.dict.has_name(b"Filter", b"FlateDecode"));
            }
            other => panic!("expected stream, got {other:?}"),
        }
    }

    #[test]
    fn stream_length_past_end_of_input_is_rejected() {
        let data = b"<< /Length 500 >>\nstream\nabc\nendstream";
        let mut p = Parser::new(data, 0);
        assert!(p.parse_object().is_err());
    }

    #[test]
    fn short_stream_length_is_corrected_to_endstream() {
        let data = b"<< /Length 2 >>\nstream\nabcde\nendstream";
        let mut p = Parser::new(data, 0);
        let obj = p.parse_object().expect("parse stream");
        match obj.atom {
            PdfAtom::Stream(st) => assert_eq!(st.data_span.len(), 5),
            other => panic!("expected stream, got {other:?}"),
        }
    }

    #[test]
    fn name_escapes_decode() {
        let mut p = Parser::new(b"/Open#41ction", 0);
        let obj = p.parse_object().expect("parse name");
        assert_eq!(obj.atom, PdfAtom::Name(b"OpenAction".to_vec()));
    }

    #[test]
    fn bad_name_escape_is_rejected() {
        let mut p = Parser::new(b"/Bad#Z1", 0);
        assert!(p.parse_object().is_err());
    }

    #[test]
    fn literal_string_escapes() {
        let mut p = Parser::new(br"(a\(b\)c\101 \n)", 0);
        let obj = p.parse_object().expect("parse string");
        assert_eq!(obj.atom, PdfAtom::Str(b"a(b)cA \n".to_vec()));
    }

    #[test]
    fn odd_hex_string_pads_low_nibble() {
        let mut p = Parser::new(b"<48656C6C6F2>", 0);
        let obj = p.parse_object().expect("parse hex string");
        assert_eq!(obj.atom, PdfAtom::Str(b"Hello ".to_vec()));
    }

    #[test]
    fn reference_and_plain_integer_disambiguate() {
        let mut p = Parser::new(b"12 0 R", 0);
        assert_eq!(p.parse_object().unwrap().atom, PdfAtom::Ref { obj: 12, gen: 0 });
        let mut p = Parser::new(b"12 13", 0);
        assert_eq!(p.parse_object().unwrap().atom, PdfAtom::Int(12));
    }

    #[test]
    fn depth_bomb_is_rejected() {
        let mut data = Vec::new();
        data.extend(std::iter::repeat(b'[').take(200));
        data.extend(std::iter::repeat(b']').take(200));
        let mut p = Parser::new(&data, 0);
        assert!(p.parse_object().is_err());
    }

    #[test]
    fn sweep_finds_objects_and_skips_junk() {
        let data = b"%PDF-1.4\n1 0 obj << /A 1 >> endobj\ngarbage here 42\n2 0 obj null endobj\n";
        let objs = scan_indirect_objects(data, 100).expect("sweep");
        assert_eq!(objs.len(), 2);
        assert_eq!(objs[0].obj, 1);
        assert_eq!(objs[1].obj, 2);
    }

    #[test]
    fn sweep_does_not_split_numbers() {
        // Starting a parse inside "10" must not yield object 0.
        let data = b"10 0 obj null endobj\n";
        let objs = scan_indirect_objects(data, 100).expect("sweep");
        assert_eq!(objs.len(), 1);
        assert_eq!(objs[0].obj, 10);
    }

    #[test]
    fn sweep_rejects_object_floods() {
        let mut data = Vec::new();
        for i in 1..=20 {
            data.extend_from_slice(format!("{i} 0 obj null endobj\n").as_bytes());
        }
        assert!(scan_indirect_objects(&data, 10).is_err());
    }
}
