//! Controller-side re-validation of the IR.
//!
//! The worker is untrusted from a defense-in-depth standpoint: a
//! compromised parser could emit an IR that violates its own rules. Every
//! invariant is therefore checked again on the trusted side of the
//! boundary before the reconstructor sees the data. The worker runs the
//! same checks before serializing, so a violation here means either a
//! parser bug or an actively hostile worker.

use crate::config::{parse_pdf_version, ParseLimits};
use crate::ir::{Document, Op, Page};

/// Validates every document invariant. The error is a human-readable
/// locator for the first violation; callers surface it as `IR_INVALID`.
pub fn validate_document(doc: &Document, limits: &ParseLimits) -> Result<(), String> {
    if doc.pages.len() > limits.max_pages {
        return Err(format!("page count {} exceeds limit", doc.pages.len()));
    }
    if doc.source_sha256.len() != 64
        || !doc.source_sha256.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase())
    {
        return Err("source_sha256 is not lowercase hex".into());
    }
    if parse_pdf_version(&doc.pdf_version).is_none() {
        return Err(format!("pdf_version {:?} unparsable", doc.pdf_version));
    }
    if doc.parser_version.is_empty() {
        return Err("parser_version empty".into());
    }
    for (index, page) in doc.pages.iter().enumerate() {
        validate_page(page, limits).map_err(|detail| format!("page {index}: {detail}"))?;
    }
    Ok(())
}

fn validate_page(page: &Page, limits: &ParseLimits) -> Result<(), String> {
    // Geometry is finite, ordered, and bounded.
    let mb = &page.media_box;
    for v in [mb.x0, mb.y0, mb.x1, mb.y1] {
        if !v.is_finite() {
            return Err("media_box not finite".into());
        }
    }
    if mb.x1 <= mb.x0 || mb.y1 <= mb.y0 {
        return Err("media_box degenerate".into());
    }
    if mb.width() * mb.height() > limits.max_page_area {
        return Err("media_box area exceeds limit".into());
    }
    if let Some(cb) = &page.crop_box {
        for v in [cb.x0, cb.y0, cb.x1, cb.y1] {
            if !v.is_finite() {
                return Err("crop_box not finite".into());
            }
        }
        if cb.x1 <= cb.x0 || cb.y1 <= cb.y0 {
            return Err("crop_box degenerate".into());
        }
    }

    if page.content_ops.len() > limits.max_ops_per_page {
        return Err("content op count exceeds limit".into());
    }

    // Balanced graphics and text state.
    let mut gstate_depth = 0usize;
    let mut in_text = false;
    for op in &page.content_ops {
        match op {
            Op::SaveGraphicsState => {
                gstate_depth += 1;
                if gstate_depth > limits.max_gstate_depth {
                    return Err("graphics state depth exceeds limit".into());
                }
            }
            Op::RestoreGraphicsState => {
                gstate_depth = gstate_depth.checked_sub(1).ok_or("negative gstate depth")?;
            }
            Op::TextBegin => {
                if in_text {
                    return Err("nested text object".into());
                }
                in_text = true;
            }
            Op::TextEnd => {
                if !in_text {
                    return Err("text end without begin".into());
                }
                in_text = false;
            }
            _ => {}
        }
        validate_op_numbers(op)?;
    }
    if gstate_depth != 0 {
        return Err("unbalanced graphics state".into());
    }
    if in_text {
        return Err("unterminated text object".into());
    }

    // Every referenced resource resolves to an admitted entry.
    for op in &page.content_ops {
        match op {
            Op::SetFont { font, .. } => {
                if !page.fonts.contains_key(font) {
                    return Err(format!("font {font:?} not in page fonts"));
                }
            }
            Op::InvokeXObject { name } => {
                if !page.images.contains_key(name) {
                    return Err(format!("xobject {name:?} not in page images"));
                }
            }
            _ => {}
        }
    }

    // Image geometry re-measured against the pixel buffer.
    for (name, image) in &page.images {
        if image.width <= 0 || image.height <= 0 {
            return Err(format!("image {name:?} has non-positive dimensions"));
        }
        if image.width > i64::from(limits.max_image_dimension)
            || image.height > i64::from(limits.max_image_dimension)
        {
            return Err(format!("image {name:?} exceeds dimension limit"));
        }
        if (image.width as u64).saturating_mul(image.height as u64) > limits.max_image_pixels {
            return Err(format!("image {name:?} exceeds pixel limit"));
        }
        if !matches!(image.bits_per_comp, 1 | 2 | 4 | 8 | 16) {
            return Err(format!("image {name:?} has invalid bits_per_comp"));
        }
        if image.pixel_data.len() > limits.max_image_bytes {
            return Err(format!("image {name:?} exceeds byte limit"));
        }
        let expected = image
            .expected_pixel_bytes()
            .ok_or_else(|| format!("image {name:?} geometry overflows"))?;
        if image.pixel_data.len() as u64 != expected {
            return Err(format!(
                "image {name:?} pixel bytes {} disagree with geometry {}",
                image.pixel_data.len(),
                expected
            ));
        }
    }
    Ok(())
}

/// All numeric payloads must be finite; NaN in a text matrix is as hostile
/// as an unknown operator.
fn validate_op_numbers(op: &Op) -> Result<(), String> {
    let finite = match op {
        Op::TextMoveAbs { x, y } | Op::TextMoveRel { x, y } => all_finite(&[*x, *y]),
        Op::SetTextMatrix { a, b, c, d, e, f } | Op::Concat { a, b, c, d, e, f } => {
            all_finite(&[*a, *b, *c, *d, *e, *f])
        }
        Op::SetFont { size, .. } => all_finite(&[*size]),
        Op::MoveTo { x, y } | Op::LineTo { x, y } => all_finite(&[*x, *y]),
        Op::CurveTo { x1, y1, x2, y2, x3, y3 } => all_finite(&[*x1, *y1, *x2, *y2, *x3, *y3]),
        Op::Rect { x, y, w, h } => all_finite(&[*x, *y, *w, *h]),
        Op::ShowTextArray { items } => items.iter().all(|item| match item {
            crate::ir::TextItem::Adjust { amount } => amount.is_finite(),
            crate::ir::TextItem::Str { .. } => true,
        }),
        _ => true,
    };
    if finite {
        Ok(())
    } else {
        Err("non-finite operand".into())
    }
}

fn all_finite(values: &[f64]) -> bool {
    values.iter().all(|v| v.is_finite())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{ColorSpace, ImageFilter, ImageRef, MediaBox, TextItem};
    use std::collections::BTreeMap;

    fn blank_page() -> Page {
        Page {
            media_box: MediaBox { x0: 0.0, y0: 0.0, x1: 612.0, y1: 792.0 },
            crop_box: None,
            content_ops: Vec::new(),
            fonts: BTreeMap::new(),
            images: BTreeMap::new(),
        }
    }

    fn document_with(page: Page) -> Document {
        Document {
            pages: vec![page],
            source_sha256: "a".repeat(64),
            parser_version: "0.4.1".into(),
            pdf_version: "1.4".into(),
        }
    }

    #[test]
    fn clean_document_validates() {
        let mut page = blank_page();
        page.content_ops = vec![
            Op::SaveGraphicsState,
            Op::TextBegin,
            Op::TextEnd,
            Op::RestoreGraphicsState,
        ];
        validate_document(&document_with(page), &ParseLimits::default()).expect("valid");
    }

    #[test]
    fn unreferenced_font_map_is_fine_but_missing_font_is_not() {
        let mut page = blank_page();
        page.content_ops = vec![
            Op::TextBegin,
            Op::SetFont { font: "F1".into(), size: 12.0 },
            Op::TextEnd,
        ];
        let doc = document_with(page);
        let err = validate_document(&doc, &ParseLimits::default()).expect_err("missing font");
        assert!(err.contains("F1"));
    }

    #[test]
    fn negative_gstate_depth_is_rejected() {
        let mut page = blank_page();
        page.content_ops = vec![Op::RestoreGraphicsState];
        assert!(validate_document(&document_with(page), &ParseLimits::default()).is_err());
    }

    #[test]
    fn nan_matrix_is_rejected() {
        let mut page = blank_page();
        page.content_ops = vec![Op::Concat {
            a: f64::NAN,
            b: 0.0,
            c: 0.0,
            d: 1.0,
            e: 0.0,
            f: 0.0,
        }];
        assert!(validate_document(&document_with(page), &ParseLimits::default()).is_err());
    }

    #[test]
    fn non_finite_text_adjustment_is_rejected() {
        let mut page = blank_page();
        page.content_ops = vec![
            Op::TextBegin,
            Op::ShowTextArray { items: vec![TextItem::Adjust { amount: f64::INFINITY }] },
            Op::TextEnd,
        ];
        assert!(validate_document(&document_with(page), &ParseLimits::default()).is_err());
    }

    #[test]
    fn image_pixel_count_must_match_geometry() {
        let mut page = blank_page();
        page.content_ops = vec![Op::InvokeXObject { name: "Im0".into() }];
        page.images.insert(
            "Im0".into(),
            ImageRef {
                width: 4,
                height: 4,
                color_space: ColorSpace::DeviceRGB,
                bits_per_comp: 8,
                filter_chain: vec![ImageFilter::FlateDecode],
                pixel_data: vec![0u8; 10],
            },
        );
        let err = validate_document(&document_with(page), &ParseLimits::default())
            .expect_err("length mismatch");
        assert!(err.contains("pixel bytes"));
    }

    #[test]
    fn degenerate_media_box_is_rejected() {
        let mut page = blank_page();
        page.media_box = MediaBox { x0: 10.0, y0: 0.0, x1: 10.0, y1: 792.0 };
        assert!(validate_document(&document_with(page), &ParseLimits::default()).is_err());
    }

    #[test]
    fn uppercase_sha_is_rejected() {
        let mut doc = document_with(blank_page());
        doc.source_sha256 = "A".repeat(64);
        assert!(validate_document(&doc, &ParseLimits::default()).is_err());
    }
}
