use crate::span::Span;

/// Owned tagged-variant tree over PDF primitives. Objects produced from
/// expanded object streams must outlive their decode buffer, so the model
/// owns its payloads instead of borrowing the input.
#[derive(Debug, Clone, PartialEq)]
pub enum PdfAtom {
    Null,
    Bool(bool),
    Int(i64),
    Real(f64),
    /// Name payload with `#xx` escapes decoded, without the leading slash.
    Name(Vec<u8>),
    /// Literal or hex string, decoded to raw bytes.
    Str(Vec<u8>),
    Array(Vec<PdfObj>),
    Dict(PdfDict),
    Stream(PdfStream),
    Ref { obj: u32, gen: u16 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct PdfObj {
    pub span: Span,
    pub atom: PdfAtom,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct PdfDict {
    pub span: Span,
    pub entries: Vec<(Vec<u8>, PdfObj)>,
}

/// Stream dictionary plus the byte window of its (still encoded) data.
/// The data window points into the buffer the stream was parsed from.
#[derive(Debug, Clone, PartialEq)]
pub struct PdfStream {
    pub dict: PdfDict,
    pub data_span: Span,
}

impl PdfDict {
    /// First value under `key`. Name matching is exact: a sanitizer must not
    /// treat `/openaction` and `/OpenAction` as the same admitted key.
    pub fn get(&self, key: &[u8]) -> Option<&PdfObj> {
        self.entries.iter().find(|(k, _)| k == &key).map(|(_, v)| v)
    }

    pub fn has(&self, key: &[u8]) -> bool {
        self.get(key).is_some()
    }

    pub fn has_name(&self, key: &[u8], value: &[u8]) -> bool {
        matches!(self.get(key), Some(obj) if matches!(&obj.atom, PdfAtom::Name(n) if n == value))
    }

    pub fn int(&self, key: &[u8]) -> Option<i64> {
        match self.get(key)?.atom {
            PdfAtom::Int(i) => Some(i),
            _ => None,
        }
    }

    pub fn name(&self, key: &[u8]) -> Option<&[u8]> {
        match &self.get(key)?.atom {
            PdfAtom::Name(n) => Some(n),
            _ => None,
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = &[u8]> {
        self.entries.iter().map(|(k, _)| k.as_slice())
    }
}

impl PdfObj {
    pub fn as_dict(&self) -> Option<&PdfDict> {
        match &self.atom {
            PdfAtom::Dict(d) => Some(d),
            PdfAtom::Stream(st) => Some(&st.dict),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[PdfObj]> {
        match &self.atom {
            PdfAtom::Array(a) => Some(a),
            _ => None,
        }
    }

    /// Numeric value widened to f64; PDF allows integers wherever reals
    /// appear.
    pub fn as_number(&self) -> Option<f64> {
        match self.atom {
            PdfAtom::Int(i) => Some(i as f64),
            PdfAtom::Real(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_reference(&self) -> Option<(u32, u16)> {
        match self.atom {
            PdfAtom::Ref { obj, gen } => Some((obj, gen)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obj(atom: PdfAtom) -> PdfObj {
        PdfObj { span: Span { start: 0, end: 0 }, atom }
    }

    #[test]
    fn dict_lookup_is_case_sensitive() {
        let dict = PdfDict {
            span: Span { start: 0, end: 0 },
            entries: vec![(b"OpenAction".to_vec(), obj(PdfAtom::Null))],
        };
        assert!(dict.has(b"OpenAction"));
        assert!(!dict.has(b"openaction"));
    }

    #[test]
    fn numbers_widen_to_f64() {
        assert_eq!(obj(PdfAtom::Int(612)).as_number(), Some(612.0));
        assert_eq!(obj(PdfAtom::Real(0.5)).as_number(), Some(0.5));
        assert_eq!(obj(PdfAtom::Null).as_number(), None);
    }
}
