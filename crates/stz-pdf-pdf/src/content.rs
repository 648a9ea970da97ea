use anyhow::{anyhow, bail, Result};
use tracing::warn;

use crate::lexer::{is_delimiter, is_whitespace, Cursor};
use crate::object::PdfAtom;
use crate::parser::Parser;
use crate::scan::LimitError;
use crate::span::Span;

/// Operand kinds that can legally precede a whitelisted operator. Anything
/// richer (dictionaries, nested arrays) belongs to operators the sanitizer
/// rejects, so the tokenizer refuses to represent it.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Number(f64),
    Name(Vec<u8>),
    Str(Vec<u8>),
    Array(Vec<Operand>),
}

#[derive(Debug, Clone)]
pub struct ContentOp {
    pub operator: String,
    pub operands: Vec<Operand>,
    pub span: Span,
}

const MAX_OPERANDS_PER_OP: usize = 16;
const MAX_ARRAY_ITEMS: usize = 8_192;

/// Splits a decoded content stream into operator groups. Operand values are
/// fully parsed (strings decoded, numbers finite) so downstream admission
/// never re-lexes raw bytes.
pub fn tokenize_content(bytes: &[u8], max_ops: usize) -> Result<Vec<ContentOp>> {
    let mut ops = Vec::new();
    let mut operands: Vec<Operand> = Vec::new();
    let mut group_start = 0usize;
    let mut cur = Cursor::new(bytes, 0);
    loop {
        cur.skip_ws_and_comments();
        if cur.eof() {
            break;
        }
        if operands.is_empty() {
            group_start = cur.pos;
        }
        let b = cur.peek().unwrap_or(0);
        match b {
            b'/' | b'(' | b'<' | b'[' | b'+' | b'-' | b'.' | b'0'..=b'9' => {
                let mut p = Parser::new(bytes, cur.pos);
                let obj = p.parse_object()?;
                cur.pos = p.position();
                if operands.len() >= MAX_OPERANDS_PER_OP {
                    bail!("operand run exceeds {MAX_OPERANDS_PER_OP}");
                }
                operands.push(operand_from_atom(obj.atom)?);
            }
            _ => {
                let span = cur.read_regular_token();
                if span.is_empty() {
                    bail!("stray delimiter 0x{b:02x} in content stream");
                }
                let token = cur.slice(span);
                let operator = String::from_utf8_lossy(token).into_owned();
                if operator == "BI" {
                    // Inline image: binary payload follows, opaque to the
                    // lexer. Skip to EI and surface BI itself as the
                    // (disallowed) operator.
                    skip_inline_image(&mut cur)?;
                }
                if max_ops > 0 && ops.len() >= max_ops {
                    warn!(
                        security = true,
                        domain = "pdf.content",
                        kind = "op_limit_exceeded",
                        max_ops = max_ops,
                        "Content operator limit exceeded"
                    );
                    return Err(LimitError { which: "content operators" }.into());
                }
                ops.push(ContentOp {
                    operator,
                    operands: std::mem::take(&mut operands),
                    span: Span::at(group_start, cur.pos),
                });
            }
        }
    }
    if !operands.is_empty() {
        bail!("content stream ends with dangling operands");
    }
    Ok(ops)
}

fn operand_from_atom(atom: PdfAtom) -> Result<Operand> {
    match atom {
        PdfAtom::Int(i) => Ok(Operand::Number(i as f64)),
        PdfAtom::Real(r) => Ok(Operand::Number(r)),
        PdfAtom::Name(n) => Ok(Operand::Name(n)),
        PdfAtom::Str(s) => Ok(Operand::Str(s)),
        PdfAtom::Array(items) => {
            if items.len() > MAX_ARRAY_ITEMS {
                bail!("operand array exceeds {MAX_ARRAY_ITEMS} items");
            }
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                match operand_from_atom(item.atom)? {
                    Operand::Array(_) => bail!("nested array operand in content stream"),
                    flat => out.push(flat),
                }
            }
            Ok(Operand::Array(out))
        }
        other => Err(anyhow!("unrepresentable operand {other:?} in content stream")),
    }
}

/// Advances past an inline image body to the first `EI` at a token
/// boundary.
fn skip_inline_image(cur: &mut Cursor<'_>) -> Result<()> {
    let bytes = cur.bytes;
    let mut i = cur.pos;
    while i + 2 <= bytes.len() {
        if &bytes[i..i + 2] == b"EI"
            && (i == 0 || is_whitespace(bytes[i - 1]))
            && (i + 2 == bytes.len()
                || is_whitespace(bytes[i + 2])
                || is_delimiter(bytes[i + 2]))
        {
            cur.pos = i + 2;
            return Ok(());
        }
        i += 1;
    }
    bail!("inline image without EI terminator")
}
