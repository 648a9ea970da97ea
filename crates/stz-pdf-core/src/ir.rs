//! Intermediate representation crossing the isolation boundary.
//!
//! The IR is the single point where trust transitions from hostile input to
//! validated content. Every field has a bounded, explicitly typed encoding:
//! reals are f64, counters are i64, byte buffers travel base64-encoded, and
//! unknown fields are rejected on ingest. The structure is a tree (each
//! page owns its resource tables) so it serializes without cycles.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::ParseFailure;

/// The 14 base fonts every conforming reader renders without embedding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FontRef {
    #[serde(rename = "Helvetica")]
    Helvetica,
    #[serde(rename = "Helvetica-Bold")]
    HelveticaBold,
    #[serde(rename = "Helvetica-Oblique")]
    HelveticaOblique,
    #[serde(rename = "Helvetica-BoldOblique")]
    HelveticaBoldOblique,
    #[serde(rename = "Courier")]
    Courier,
    #[serde(rename = "Courier-Bold")]
    CourierBold,
    #[serde(rename = "Courier-Oblique")]
    CourierOblique,
    #[serde(rename = "Courier-BoldOblique")]
    CourierBoldOblique,
    #[serde(rename = "Times-Roman")]
    TimesRoman,
    #[serde(rename = "Times-Bold")]
    TimesBold,
    #[serde(rename = "Times-Italic")]
    TimesItalic,
    #[serde(rename = "Times-BoldItalic")]
    TimesBoldItalic,
    #[serde(rename = "Symbol")]
    Symbol,
    #[serde(rename = "ZapfDingbats")]
    ZapfDingbats,
}

impl FontRef {
    pub fn canonical_name(self) -> &'static str {
        match self {
            FontRef::Helvetica => "Helvetica",
            FontRef::HelveticaBold => "Helvetica-Bold",
            FontRef::HelveticaOblique => "Helvetica-Oblique",
            FontRef::HelveticaBoldOblique => "Helvetica-BoldOblique",
            FontRef::Courier => "Courier",
            FontRef::CourierBold => "Courier-Bold",
            FontRef::CourierOblique => "Courier-Oblique",
            FontRef::CourierBoldOblique => "Courier-BoldOblique",
            FontRef::TimesRoman => "Times-Roman",
            FontRef::TimesBold => "Times-Bold",
            FontRef::TimesItalic => "Times-Italic",
            FontRef::TimesBoldItalic => "Times-BoldItalic",
            FontRef::Symbol => "Symbol",
            FontRef::ZapfDingbats => "ZapfDingbats",
        }
    }

    /// Maps a `/BaseFont` value onto the standard set. Subset tags and
    /// lookalike names do not count as standard.
    pub fn from_base_font(name: &[u8]) -> Option<Self> {
        Some(match name {
            b"Helvetica" => FontRef::Helvetica,
            b"Helvetica-Bold" => FontRef::HelveticaBold,
            b"Helvetica-Oblique" => FontRef::HelveticaOblique,
            b"Helvetica-BoldOblique" => FontRef::HelveticaBoldOblique,
            b"Courier" => FontRef::Courier,
            b"Courier-Bold" => FontRef::CourierBold,
            b"Courier-Oblique" => FontRef::CourierOblique,
            b"Courier-BoldOblique" => FontRef::CourierBoldOblique,
            b"Times-Roman" => FontRef::TimesRoman,
            b"Times-Bold" => FontRef::TimesBold,
            b"Times-Italic" => FontRef::TimesItalic,
            b"Times-BoldItalic" => FontRef::TimesBoldItalic,
            b"Symbol" => FontRef::Symbol,
            b"ZapfDingbats" => FontRef::ZapfDingbats,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColorSpace {
    DeviceGray,
    DeviceRGB,
    DeviceCMYK,
}

impl ColorSpace {
    pub fn components(self) -> u32 {
        match self {
            ColorSpace::DeviceGray => 1,
            ColorSpace::DeviceRGB => 3,
            ColorSpace::DeviceCMYK => 4,
        }
    }

    pub fn pdf_name(self) -> &'static str {
        match self {
            ColorSpace::DeviceGray => "DeviceGray",
            ColorSpace::DeviceRGB => "DeviceRGB",
            ColorSpace::DeviceCMYK => "DeviceCMYK",
        }
    }
}

/// Source filter chain of an admitted image, for audit context. Pixel data
/// in the IR is always fully decoded regardless of the source chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ImageFilter {
    FlateDecode,
    DCTDecode,
    CCITTFaxDecode,
    JBIG2Decode,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ImageRef {
    pub width: i64,
    pub height: i64,
    pub color_space: ColorSpace,
    pub bits_per_comp: i64,
    pub filter_chain: Vec<ImageFilter>,
    #[serde(with = "base64_bytes")]
    pub pixel_data: Vec<u8>,
}

impl ImageRef {
    /// Byte length the pixel buffer must have for the declared geometry,
    /// with rows padded to byte boundaries as the imaging model requires.
    pub fn expected_pixel_bytes(&self) -> Option<u64> {
        let width = u64::try_from(self.width).ok()?;
        let height = u64::try_from(self.height).ok()?;
        let bits = u64::try_from(self.bits_per_comp).ok()?;
        let row_bits = width
            .checked_mul(bits)?
            .checked_mul(u64::from(self.color_space.components()))?;
        row_bits.checked_add(7).map(|b| (b / 8) * height)
    }
}

/// One entry of a `ShowTextArray`: either encoded glyph bytes or a
/// thousandths-of-em position adjustment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TextItem {
    Str {
        #[serde(with = "base64_bytes")]
        text: Vec<u8>,
    },
    Adjust { amount: f64 },
}

/// The whitelisted operator set. The parser rejects rather than drops
/// anything outside this enumeration, so the type itself is the allow-list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Op {
    TextBegin,
    TextEnd,
    TextMoveAbs { x: f64, y: f64 },
    TextMoveRel { x: f64, y: f64 },
    TextMoveNext,
    SetTextMatrix { a: f64, b: f64, c: f64, d: f64, e: f64, f: f64 },
    SetFont { font: String, size: f64 },
    ShowText {
        #[serde(with = "base64_bytes")]
        text: Vec<u8>,
    },
    ShowTextArray { items: Vec<TextItem> },
    MoveTo { x: f64, y: f64 },
    LineTo { x: f64, y: f64 },
    CurveTo { x1: f64, y1: f64, x2: f64, y2: f64, x3: f64, y3: f64 },
    ClosePath,
    Rect { x: f64, y: f64, w: f64, h: f64 },
    Fill,
    Stroke,
    EndPath,
    SaveGraphicsState,
    RestoreGraphicsState,
    Concat { a: f64, b: f64, c: f64, d: f64, e: f64, f: f64 },
    InvokeXObject { name: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MediaBox {
    pub x0: f64,
    pub y0: f64,
    pub x1: f64,
    pub y1: f64,
}

impl MediaBox {
    pub fn width(&self) -> f64 {
        self.x1 - self.x0
    }

    pub fn height(&self) -> f64 {
        self.y1 - self.y0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Page {
    pub media_box: MediaBox,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crop_box: Option<MediaBox>,
    pub content_ops: Vec<Op>,
    pub fonts: BTreeMap<String, FontRef>,
    pub images: BTreeMap<String, ImageRef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Document {
    pub pages: Vec<Page>,
    /// Hex SHA-256 of the input bytes.
    pub source_sha256: String,
    pub parser_version: String,
    /// Header version of the input, e.g. "1.4"; the reconstructor never
    /// emits a higher one.
    pub pdf_version: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ThreatSeverity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ThreatAction {
    Removed,
    Zeroed,
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ThreatRecord {
    pub kind: String,
    pub severity: ThreatSeverity,
    pub locator: String,
    pub action: ThreatAction,
}

/// The single file the worker writes. A clean rejection is a normal exit
/// with a `rejected` verdict; anything else the harness sees is a crash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WorkerVerdict {
    Ok { document: Document, threats: Vec<ThreatRecord> },
    Rejected { failure: ParseFailure, threats: Vec<ThreatRecord> },
}

pub(crate) mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(de)?;
        STANDARD.decode(text.as_bytes()).map_err(serde::de::Error::custom)
    }
}
