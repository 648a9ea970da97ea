use std::io::Read;

use thiserror::Error;
use tracing::warn;

use crate::object::{PdfAtom, PdfDict, PdfStream};

#[derive(Debug, Error)]
pub enum DecodeError {
    /// The decoded output would exceed the caller's budget. Always fatal:
    /// a truncated stream is indistinguishable from a tampered one.
    #[error("decode output budget of {budget} bytes exceeded")]
    BudgetExceeded { budget: usize },
    #[error("unsupported filter {filter}")]
    UnsupportedFilter { filter: String },
    #[error("filter chain depth {depth} exceeds {max}")]
    ChainTooDeep { depth: usize, max: usize },
    #[error("malformed {filter} data: {detail}")]
    Malformed { filter: &'static str, detail: String },
}

#[derive(Debug, Clone, Copy)]
pub struct DecodeLimits {
    pub max_decoded_bytes: usize,
    pub max_filter_chain_depth: usize,
}

impl Default for DecodeLimits {
    fn default() -> Self {
        Self { max_decoded_bytes: 32 * 1024 * 1024, max_filter_chain_depth: 4 }
    }
}

/// Filters this crate can run to completion itself. Image-only filters
/// (DCTDecode and friends) are measured by the admission layer instead.
pub fn is_transport_filter(name: &[u8]) -> bool {
    matches!(
        name,
        b"FlateDecode" | b"Fl" | b"LZWDecode" | b"LZW" | b"ASCIIHexDecode" | b"AHx"
            | b"ASCII85Decode" | b"A85" | b"RunLengthDecode" | b"RL"
    )
}

/// Filter names from `/Filter`, decoded, in application order.
pub fn stream_filters(dict: &PdfDict) -> Vec<Vec<u8>> {
    let mut out = Vec::new();
    let Some(obj) = dict.get(b"Filter") else {
        return out;
    };
    match &obj.atom {
        PdfAtom::Name(n) => out.push(n.clone()),
        PdfAtom::Array(arr) => {
            for item in arr {
                if let PdfAtom::Name(n) = &item.atom {
                    out.push(n.clone());
                }
            }
        }
        _ => {}
    }
    out
}

/// Runs a stream's transport filter chain under `limits`. `bytes` is the
/// buffer `stream.data_span` points into.
pub fn decode_stream(
    bytes: &[u8],
    stream: &PdfStream,
    limits: DecodeLimits,
) -> Result<Vec<u8>, DecodeError> {
    let start = stream.data_span.start as usize;
    let end = stream.data_span.end as usize;
    if start > end || end > bytes.len() {
        return Err(DecodeError::Malformed {
            filter: "stream",
            detail: "data span outside input".into(),
        });
    }
    let filters = stream_filters(&stream.dict);
    if filters.len() > limits.max_filter_chain_depth {
        warn!(
            security = true,
            domain = "pdf.decode",
            kind = "filter_chain_too_deep",
            depth = filters.len(),
            "Filter chain depth exceeded"
        );
        return Err(DecodeError::ChainTooDeep {
            depth: filters.len(),
            max: limits.max_filter_chain_depth,
        });
    }
    let mut data = bytes[start..end].to_vec();
    for filter in &filters {
        data = decode_filter(&data, filter, limits.max_decoded_bytes)?;
        apply_predictor_if_declared(&mut data, &stream.dict, filter)?;
    }
    if data.len() > limits.max_decoded_bytes {
        return Err(DecodeError::BudgetExceeded { budget: limits.max_decoded_bytes });
    }
    Ok(data)
}

pub fn decode_filter(data: &[u8], filter: &[u8], max_out: usize) -> Result<Vec<u8>, DecodeError> {
    match filter {
        b"FlateDecode" | b"Fl" => decode_flate(data, max_out),
        b"LZWDecode" | b"LZW" => decode_lzw(data, max_out),
        b"ASCIIHexDecode" | b"AHx" => decode_ascii_hex(data, max_out),
        b"ASCII85Decode" | b"A85" => decode_ascii85(data, max_out),
        b"RunLengthDecode" | b"RL" => decode_run_length(data, max_out),
        other => Err(DecodeError::UnsupportedFilter {
            filter: String::from_utf8_lossy(other).into_owned(),
        }),
    }
}

/// Zlib first, raw deflate as fallback; producers in the wild emit both.
pub fn decode_flate(data: &[u8], max_out: usize) -> Result<Vec<u8>, DecodeError> {
    match read_bounded(flate2::read::ZlibDecoder::new(data), max_out) {
        Ok(out) => Ok(out),
        Err(DecodeError::BudgetExceeded { budget }) => {
            Err(DecodeError::BudgetExceeded { budget })
        }
        Err(_) => {
            let out = read_bounded(flate2::read::DeflateDecoder::new(data), max_out)?;
            warn!(
                security = true,
                domain = "pdf.decode",
                kind = "flate_raw_deflate",
                "Flate stream decoded with raw deflate fallback"
            );
            Ok(out)
        }
    }
}

fn read_bounded<R: Read>(mut decoder: R, max_out: usize) -> Result<Vec<u8>, DecodeError> {
    let mut out = Vec::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = decoder.read(&mut buf).map_err(|e| DecodeError::Malformed {
            filter: "FlateDecode",
            detail: e.to_string(),
        })?;
        if n == 0 {
            return Ok(out);
        }
        if out.len() + n > max_out {
            warn!(
                security = true,
                domain = "pdf.decode",
                kind = "decode_budget_exceeded",
                budget = max_out,
                "Decompression budget exceeded"
            );
            return Err(DecodeError::BudgetExceeded { budget: max_out });
        }
        out.extend_from_slice(&buf[..n]);
    }
}

fn decode_lzw(data: &[u8], max_out: usize) -> Result<Vec<u8>, DecodeError> {
    let mut decoder = weezl::decode::Decoder::new(weezl::BitOrder::Msb, 8);
    let mut out = Vec::new();
    let mut buf = [0u8; 8192];
    let mut input = data;
    loop {
        let res = decoder.decode_bytes(input, &mut buf);
        out.extend_from_slice(&buf[..res.consumed_out]);
        if out.len() > max_out {
            return Err(DecodeError::BudgetExceeded { budget: max_out });
        }
        input = &input[res.consumed_in..];
        match res.status {
            Ok(weezl::LzwStatus::Done) => return Ok(out),
            // Out of input without an EOD marker: accept what decoded.
            Ok(weezl::LzwStatus::NoProgress) => return Ok(out),
            Ok(weezl::LzwStatus::Ok) => {}
            Err(e) => {
                return Err(DecodeError::Malformed { filter: "LZWDecode", detail: e.to_string() })
            }
        }
    }
}

fn decode_ascii_hex(data: &[u8], max_out: usize) -> Result<Vec<u8>, DecodeError> {
    let mut digits = Vec::new();
    for &b in data {
        if b == b'>' {
            break;
        }
        if b.is_ascii_whitespace() {
            continue;
        }
        match crate::lexer::hex_val(b) {
            Some(v) => digits.push(v),
            None => {
                return Err(DecodeError::Malformed {
                    filter: "ASCIIHexDecode",
                    detail: format!("invalid digit 0x{b:02x}"),
                })
            }
        }
        if digits.len() / 2 > max_out {
            return Err(DecodeError::BudgetExceeded { budget: max_out });
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

fn decode_ascii85(data: &[u8], max_out: usize) -> Result<Vec<u8>, DecodeError> {
    let mut out = Vec::new();
    let mut tuple: Vec<u8> = Vec::with_capacity(5);
    let mut i = 0usize;
    while i < data.len() {
        let b = data[i];
        if b == b'~' {
            break;
        }
        if b.is_ascii_whitespace() {
            i += 1;
            continue;
        }
        if b == b'z' && tuple.is_empty() {
            out.extend_from_slice(&[0, 0, 0, 0]);
            i += 1;
            continue;
        }
        if !(b'!'..=b'u').contains(&b) {
            return Err(DecodeError::Malformed {
                filter: "ASCII85Decode",
                detail: format!("invalid byte 0x{b:02x}"),
            });
        }
        tuple.push(b);
        if tuple.len() == 5 {
            let mut value: u32 = 0;
            for &c in &tuple {
                value = value
                    .checked_mul(85)
                    .and_then(|v| v.checked_add(u32::from(c - 33)))
                    .ok_or(DecodeError::Malformed {
                        filter: "ASCII85Decode",
                        detail: "group overflows 32 bits".into(),
                    })?;
            }
            out.extend_from_slice(&value.to_be_bytes());
            tuple.clear();
        }
        if out.len() > max_out {
            return Err(DecodeError::BudgetExceeded { budget: max_out });
        }
        i += 1;
    }
    if !tuple.is_empty() {
        if tuple.len() == 1 {
            return Err(DecodeError::Malformed {
                filter: "ASCII85Decode",
                detail: "dangling single digit".into(),
            });
        }
        let padding = 5 - tuple.len();
        let mut value: u32 = 0;
        for &c in &tuple {
            value = value.wrapping_mul(85).wrapping_add(u32::from(c - 33));
        }
        for _ in 0..padding {
            value = value.wrapping_mul(85).wrapping_add(84);
        }
        let bytes = value.to_be_bytes();
        out.extend_from_slice(&bytes[..4 - padding]);
    }
    if out.len() > max_out {
        return Err(DecodeError::BudgetExceeded { budget: max_out });
    }
    Ok(out)
}

fn decode_run_length(data: &[u8], max_out: usize) -> Result<Vec<u8>, DecodeError> {
    let mut out = Vec::new();
    let mut i = 0usize;
    while i < data.len() {
        let n = data[i];
        i += 1;
        if n == 128 {
            return Ok(out);
        }
        if n <= 127 {
            let count = n as usize + 1;
            if i + count > data.len() {
                return Err(DecodeError::Malformed {
                    filter: "RunLengthDecode",
                    detail: "literal run past end of data".into(),
                });
            }
            out.extend_from_slice(&data[i..i + count]);
            i += count;
        } else {
            let count = 257 - n as usize;
            let Some(&b) = data.get(i) else {
                return Err(DecodeError::Malformed {
                    filter: "RunLengthDecode",
                    detail: "repeat run past end of data".into(),
                });
            };
            out.extend(std::iter::repeat(b).take(count));
            i += 1;
        }
        if out.len() > max_out {
            return Err(DecodeError::BudgetExceeded { budget: max_out });
        }
    }
    Ok(out)
}

// ---- predictors -----------------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct PredictorParms {
    predictor: u32,
    colors: u32,
    bits_per_component: u32,
    columns: u32,
}

const MAX_PREDICTOR_PARM: u32 = 100_000;

fn apply_predictor_if_declared(
    data: &mut Vec<u8>,
    dict: &PdfDict,
    filter: &[u8],
) -> Result<(), DecodeError> {
    if !matches!(filter, b"FlateDecode" | b"Fl" | b"LZWDecode" | b"LZW") {
        return Ok(());
    }
    let Some(parms) = predictor_parms(dict) else {
        return Ok(());
    };
    if parms.predictor <= 1 {
        return Ok(());
    }
    if parms.colors > MAX_PREDICTOR_PARM
        || parms.bits_per_component > MAX_PREDICTOR_PARM
        || parms.columns > MAX_PREDICTOR_PARM
    {
        warn!(
            security = true,
            domain = "pdf.decode",
            kind = "predictor_parms_out_of_range",
            colors = parms.colors,
            bits = parms.bits_per_component,
            columns = parms.columns,
            "Predictor parameters out of range"
        );
        return Err(DecodeError::Malformed {
            filter: "DecodeParms",
            detail: "predictor parameters out of range".into(),
        });
    }
    let bpp = ((parms.colors as u64 * parms.bits_per_component as u64 + 7) / 8) as usize;
    let row_len = (parms.columns as u64 * bpp as u64) as usize;
    if row_len == 0 {
        return Ok(());
    }
    *data = match parms.predictor {
        2 => tiff_predictor(data, bpp, row_len),
        10..=15 => png_predictor(data, bpp, row_len),
        _ => {
            return Err(DecodeError::Malformed {
                filter: "DecodeParms",
                detail: format!("unknown predictor {}", parms.predictor),
            })
        }
    };
    Ok(())
}

fn predictor_parms(dict: &PdfDict) -> Option<PredictorParms> {
    let parms = dict.get(b"DecodeParms").or_else(|| dict.get(b"DP"))?;
    let d = parms.as_dict()?;
    Some(PredictorParms {
        predictor: d.int(b"Predictor").unwrap_or(1).max(0) as u32,
        colors: d.int(b"Colors").unwrap_or(1).max(0) as u32,
        bits_per_component: d.int(b"BitsPerComponent").unwrap_or(8).max(0) as u32,
        columns: d.int(b"Columns").unwrap_or(1).max(0) as u32,
    })
}

fn tiff_predictor(data: &[u8], bpp: usize, row_len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    for chunk in data.chunks(row_len) {
        let mut row = chunk.to_vec();
        for i in bpp..row.len() {
            row[i] = row[i].wrapping_add(row[i - bpp]);
        }
        out.extend_from_slice(&row);
    }
    out
}

fn png_predictor(data: &[u8], bpp: usize, row_len: usize) -> Vec<u8> {
    let mut out = Vec::new();
    let mut prev = vec![0u8; row_len];
    let mut i = 0usize;
    loop {
        let Some(&tag) = data.get(i) else { break };
        i += 1;
        if i + row_len > data.len() {
            break;
        }
        let mut row = data[i..i + row_len].to_vec();
        i += row_len;
        match tag {
            0 => {}
            1 => {
                for j in 0..row_len {
                    let left = if j >= bpp { row[j - bpp] } else { 0 };
                    row[j] = row[j].wrapping_add(left);
                }
            }
            2 => {
                for j in 0..row_len {
                    row[j] = row[j].wrapping_add(prev[j]);
                }
            }
            3 => {
                for j in 0..row_len {
                    let left = if j >= bpp { row[j - bpp] } else { 0 };
                    let avg = ((u16::from(left) + u16::from(prev[j])) / 2) as u8;
                    row[j] = row[j].wrapping_add(avg);
                }
            }
            4 => {
                for j in 0..row_len {
                    let left = if j >= bpp { row[j - bpp] } else { 0 };
                    let up_left = if j >= bpp { prev[j - bpp] } else { 0 };
                    row[j] = row[j].wrapping_add(paeth(left, prev[j], up_left));
                }
            }
            _ => {}
        }
        prev.copy_from_slice(&row);
        out.extend_from_slice(&row);
    }
    out
}

fn paeth(a: u8, b: u8, c: u8) -> u8 {
    let (a, b, c) = (i32::from(a), i32::from(b), i32::from(c));
    let p = a + b - c;
    let (pa, pb, pc) = ((p - a).abs(), (p - b).abs(), (p - c).abs());
    if pa <= pb && pa <= pc {
        a as u8
    } else if pb <= pc {
        b as u8
    } else {
        c as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{PdfAtom, PdfObj, PdfStream};
    use crate::span::Span;
    use flate2::write::ZlibEncoder;
    use flate2::Compression;
    use std::io::Write;

    fn stream_with_filters(filters: &[&str], data_len: usize) -> PdfStream {
        let filter_objs = filters
            .iter()
            .map(|f| PdfObj {
                span: Span { start: 0, end: 0 },
                atom: PdfAtom::Name(f.as_bytes().to_vec()),
            })
            .collect::<Vec<_>>();
        let dict = PdfDict {
            span: Span { start: 0, end: 0 },
            entries: vec![(
                b"Filter".to_vec(),
                PdfObj { span: Span { start: 0, end: 0 }, atom: PdfAtom::Array(filter_objs) },
            )],
        };
        PdfStream { dict, data_span: Span { start: 0, end: data_len as u64 } }
    }

    fn zlib(data: &[u8]) -> Vec<u8> {
        let mut enc = ZlibEncoder::new(Vec::new(), Compression::default());
        enc.write_all(data).expect("zlib write");
        enc.finish().expect("zlib finish")
    }

    #[test]
    fn flate_round_trip() {
        let encoded = zlib(b"BT /F1 12 Tf ET");
        let stream = stream_with_filters(&["FlateDecode"], encoded.len());
        let out = decode_stream(&encoded, &stream, DecodeLimits::default()).expect("decode");
        assert_eq!(out, b"BT /F1 12 Tf ET");
    }

    #[test]
    fn budget_overrun_is_an_error_not_a_truncation() {
        let bomb = zlib(&vec![0u8; 1 << 20]);
        let stream = stream_with_filters(&["FlateDecode"], bomb.len());
        let limits = DecodeLimits { max_decoded_bytes: 1024, max_filter_chain_depth: 4 };
        match decode_stream(&bomb, &stream, limits) {
            Err(DecodeError::BudgetExceeded { budget }) => assert_eq!(budget, 1024),
            other => panic!("expected budget error, got {other:?}"),
        }
    }

    #[test]
    fn unsupported_filter_is_named() {
        let stream = stream_with_filters(&["JBIG2Decode"], 4);
        match decode_stream(&[0, 0, 0, 0], &stream, DecodeLimits::default()) {
            Err(DecodeError::UnsupportedFilter { filter }) => assert_eq!(filter, "JBIG2Decode"),
            other => panic!("expected unsupported filter, got {other:?}"),
        }
    }

    #[test]
    fn chain_depth_cap() {
        let stream = stream_with_filters(&["FlateDecode"; 9], 1);
        assert!(matches!(
            decode_stream(&[0], &stream, DecodeLimits::default()),
            Err(DecodeError::ChainTooDeep { .. })
        ));
    }

    #[test]
    fn ascii_hex_decodes_with_terminator() {
        assert_eq!(decode_ascii_hex(b"48 65 6C6C 6F>", 64).expect("hex"), b"Hello");
    }

    #[test]
    fn run_length_literal_and_repeat() {
        // 2 literals "ab", then 'c' repeated 3 times, then EOD.
        let data = [1u8, b'a', b'b', 254, b'c', 128];
        assert_eq!(decode_run_length(&data, 64).expect("rl"), b"abccc");
    }

    #[test]
    fn ascii85_z_shortcut() {
        assert_eq!(decode_ascii85(b"z~>", 16).expect("a85"), vec![0, 0, 0, 0]);
    }
}
