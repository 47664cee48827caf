//! Field filling and flattening
//!
//! Filling writes `/V` (and `/AS` for buttons) into the field tree.
//! Flattening turns the filled values into static page content: text
//! appearances are synthesized as Form XObjects, button states reuse the
//! template's own appearance streams, and image overlays become Image
//! XObjects. Everything is drawn through a content stream appended after
//! the original page content, which is bracketed by `q`/`Q` so leftover
//! graphics state in the template cannot shift our coordinates.

use crate::binder::BindOptions;
use crate::error::PdfBindError;
use crate::image::{decode_image, ImagePlacement};
use crate::template::{FieldKind, FormField};
use lopdf::{Dictionary, Document, Object, ObjectId, Stream};
use std::collections::{BTreeMap, HashSet};
use tracing::warn;

/// One XObject to draw on a page, with its placement matrix.
pub(crate) struct StampOp {
    pub page_id: ObjectId,
    pub xobject_id: ObjectId,
    /// `cm` operands `[a b c d e f]`.
    pub matrix: [f64; 6],
}

/// Write the value into the field dictionary.
pub(crate) fn fill_field(
    doc: &mut Document,
    field: &FormField,
    value: &str,
) -> Result<(), PdfBindError> {
    // Button values are appearance state names, e.g. /Yes or /Off.
    let value_obj = match field.kind {
        FieldKind::Button => Object::Name(value.as_bytes().to_vec()),
        _ => Object::String(encode_pdf_text(value), lopdf::StringFormat::Literal),
    };

    doc.get_object_mut(field.field_id)
        .and_then(Object::as_dict_mut)
        .map_err(|e| PdfBindError::Operation(e.to_string()))?
        .set("V", value_obj);

    if field.kind == FieldKind::Button {
        for widget in &field.widgets {
            doc.get_object_mut(widget.annot_id)
                .and_then(Object::as_dict_mut)
                .map_err(|e| PdfBindError::Operation(e.to_string()))?
                .set("AS", Object::Name(value.as_bytes().to_vec()));
        }
    }
    Ok(())
}

/// Build the stamps that replace a filled field's widgets.
pub(crate) fn appearance_stamps(
    doc: &mut Document,
    field: &FormField,
    value: &str,
    opts: &BindOptions,
) -> Result<Vec<StampOp>, PdfBindError> {
    match field.kind {
        FieldKind::Button => Ok(button_state_stamps(doc, field, value)),
        _ => text_appearance_stamps(doc, field, value, opts),
    }
}

/// For buttons the template already ships an appearance stream per state;
/// reference the stream for the selected state instead of drawing our own.
fn button_state_stamps(doc: &Document, field: &FormField, value: &str) -> Vec<StampOp> {
    let mut stamps = Vec::new();
    if value == "Off" {
        return stamps;
    }
    for widget in &field.widgets {
        let state_ref = doc
            .get_object(widget.annot_id)
            .and_then(Object::as_dict)
            .and_then(|w| w.get(b"AP"))
            .and_then(|ap| resolve_dict(doc, ap))
            .and_then(|ap| ap.get(b"N"))
            .and_then(|n| resolve_dict(doc, n))
            .and_then(|states| states.get(value.as_bytes()))
            .ok()
            .and_then(|o| o.as_reference().ok());

        match state_ref {
            Some(id) => stamps.push(StampOp {
                page_id: widget.page_id,
                xobject_id: id,
                matrix: [1.0, 0.0, 0.0, 1.0, widget.rect[0], widget.rect[1]],
            }),
            None => warn!(field = %field.name, state = %value, "no appearance stream for button state"),
        }
    }
    stamps
}

fn resolve_dict<'a>(doc: &'a Document, obj: &'a Object) -> Result<&'a Dictionary, lopdf::Error> {
    match obj {
        Object::Reference(id) => doc.get_object(*id)?.as_dict(),
        other => other.as_dict(),
    }
}

/// Synthesize a Form XObject drawing the value inside each widget rect.
fn text_appearance_stamps(
    doc: &mut Document,
    field: &FormField,
    value: &str,
    opts: &BindOptions,
) -> Result<Vec<StampOp>, PdfBindError> {
    let mut stamps = Vec::new();
    for widget in &field.widgets {
        let xobject_id = text_appearance(doc, &widget.rect, value, opts);
        stamps.push(StampOp {
            page_id: widget.page_id,
            xobject_id,
            matrix: [1.0, 0.0, 0.0, 1.0, widget.rect[0], widget.rect[1]],
        });
    }
    Ok(stamps)
}

fn text_appearance(
    doc: &mut Document,
    rect: &[f64; 4],
    value: &str,
    opts: &BindOptions,
) -> ObjectId {
    let width = rect[2] - rect[0];
    let height = rect[3] - rect[1];

    let normalized = value.replace('\r', "");
    let lines: Vec<String> = normalized.split('\n').map(escape_pdf_string).collect();
    let line_count = lines.len().max(1) as f64;

    let font_size = opts
        .font_size
        .unwrap_or_else(|| ((height / line_count) * 0.6).clamp(6.0, 14.0));
    let leading = font_size * 1.2;
    let first_baseline = if lines.len() == 1 {
        ((height - font_size) / 2.0).max(1.0)
    } else {
        (height - font_size - 1.0).max(1.0)
    };

    let mut content = String::from("q\nBT\n");
    content.push_str(&format!("/F1 {} Tf\n0 0 0 rg\n", font_size));
    content.push_str(&format!("2 {} Td\n", first_baseline));
    for (i, line) in lines.iter().enumerate() {
        if i > 0 {
            content.push_str(&format!("0 -{} Td\n", leading));
        }
        content.push_str(&format!("({}) Tj\n", line));
    }
    content.push_str("ET\nQ");

    let mut f1 = Dictionary::new();
    f1.set("Type", Object::Name(b"Font".to_vec()));
    f1.set("Subtype", Object::Name(b"Type1".to_vec()));
    f1.set("BaseFont", Object::Name(b"Helvetica".to_vec()));
    f1.set("Encoding", Object::Name(b"WinAnsiEncoding".to_vec()));
    let mut fonts = Dictionary::new();
    fonts.set("F1", Object::Dictionary(f1));
    let mut resources = Dictionary::new();
    resources.set("Font", Object::Dictionary(fonts));

    let mut stream_dict = Dictionary::new();
    stream_dict.set("Type", Object::Name(b"XObject".to_vec()));
    stream_dict.set("Subtype", Object::Name(b"Form".to_vec()));
    stream_dict.set("FormType", Object::Integer(1));
    stream_dict.set(
        "BBox",
        Object::Array(vec![
            Object::Integer(0),
            Object::Integer(0),
            Object::Real(width as f32),
            Object::Real(height as f32),
        ]),
    );
    stream_dict.set("Resources", Object::Dictionary(resources));

    doc.add_object(Object::Stream(Stream::new(stream_dict, content.into_bytes())))
}

/// Decode overlays and turn them into stamps on their target pages.
pub(crate) fn image_stamps(
    doc: &mut Document,
    placements: &[ImagePlacement],
) -> Result<Vec<StampOp>, PdfBindError> {
    let pages = doc.get_pages();
    let mut stamps = Vec::new();
    for placement in placements {
        let page_id = *pages.get(&placement.page).ok_or_else(|| {
            PdfBindError::Operation(format!(
                "image placement page {} not found in template",
                placement.page
            ))
        })?;
        let decoded = decode_image(&placement.data)?;
        let width = decoded.width as f64;
        let height = decoded.height as f64;
        let xobject_id = decoded.add_to_document(doc, placement.kind)?;
        stamps.push(StampOp {
            page_id,
            xobject_id,
            matrix: [width, 0.0, 0.0, height, placement.x, placement.y],
        });
    }
    Ok(stamps)
}

/// Draw all stamps: register XObject names in each page's resources and
/// append one content stream per page invoking them.
pub(crate) fn apply_stamps(doc: &mut Document, stamps: Vec<StampOp>) -> Result<(), PdfBindError> {
    let mut by_page: BTreeMap<ObjectId, Vec<StampOp>> = BTreeMap::new();
    for stamp in stamps {
        by_page.entry(stamp.page_id).or_default().push(stamp);
    }

    let mut counter = 0usize;
    for (page_id, ops) in by_page {
        let mut resources = resolved_resources(doc, page_id);
        let mut xobjects = match resources.get(b"XObject") {
            Ok(Object::Reference(id)) => doc
                .get_object(*id)
                .and_then(Object::as_dict)
                .map(Clone::clone)
                .unwrap_or_else(|_| Dictionary::new()),
            Ok(Object::Dictionary(dict)) => dict.clone(),
            _ => Dictionary::new(),
        };

        let mut fragment = String::new();
        for op in &ops {
            let name = loop {
                let candidate = format!("TBx{}", counter);
                counter += 1;
                if !xobjects.has(candidate.as_bytes()) {
                    break candidate;
                }
            };
            xobjects.set(name.as_bytes(), Object::Reference(op.xobject_id));
            let [a, b, c, d, e, f] = op.matrix;
            fragment.push_str(&format!(
                "q\n{} {} {} {} {} {} cm\n/{} Do\nQ\n",
                a, b, c, d, e, f, name
            ));
        }

        resources.set("XObject", Object::Dictionary(xobjects));
        append_page_content(doc, page_id, resources, fragment.into_bytes())?;
    }
    Ok(())
}

/// Resolve the page's resources, following the `/Parent` chain when the
/// page inherits them, into an owned dictionary we can extend.
fn resolved_resources(doc: &Document, page_id: ObjectId) -> Dictionary {
    let mut node = Some(page_id);
    while let Some(id) = node {
        let Ok(dict) = doc.get_object(id).and_then(Object::as_dict) else {
            break;
        };
        match dict.get(b"Resources") {
            Ok(Object::Reference(rid)) => {
                return doc
                    .get_object(*rid)
                    .and_then(Object::as_dict)
                    .map(Clone::clone)
                    .unwrap_or_else(|_| Dictionary::new());
            }
            Ok(Object::Dictionary(resources)) => return resources.clone(),
            _ => {}
        }
        node = dict.get(b"Parent").ok().and_then(|o| o.as_reference().ok());
    }
    Dictionary::new()
}

/// Install the extended resources and append `fragment` after the page's
/// existing content, bracketing the original streams with `q`/`Q`.
fn append_page_content(
    doc: &mut Document,
    page_id: ObjectId,
    resources: Dictionary,
    fragment: Vec<u8>,
) -> Result<(), PdfBindError> {
    let original: Vec<Object> = {
        let page = doc
            .get_object(page_id)
            .and_then(Object::as_dict)
            .map_err(|e| PdfBindError::Operation(e.to_string()))?;
        match page.get(b"Contents") {
            Ok(Object::Reference(rid)) => match doc.get_object(*rid) {
                Ok(Object::Array(arr)) => arr.clone(),
                _ => vec![Object::Reference(*rid)],
            },
            Ok(Object::Array(arr)) => arr.clone(),
            _ => Vec::new(),
        }
    };

    let save_id = doc.add_object(Object::Stream(Stream::new(
        Dictionary::new(),
        b"q\n".to_vec(),
    )));
    let restore_id = doc.add_object(Object::Stream(Stream::new(
        Dictionary::new(),
        b"Q\n".to_vec(),
    )));
    let fragment_id = doc.add_object(Object::Stream(Stream::new(Dictionary::new(), fragment)));

    let mut contents = Vec::with_capacity(original.len() + 3);
    contents.push(Object::Reference(save_id));
    contents.extend(original);
    contents.push(Object::Reference(restore_id));
    contents.push(Object::Reference(fragment_id));

    let page = doc
        .get_object_mut(page_id)
        .and_then(Object::as_dict_mut)
        .map_err(|e| PdfBindError::Operation(e.to_string()))?;
    page.set("Resources", Object::Dictionary(resources));
    page.set("Contents", Object::Array(contents));
    Ok(())
}

/// Remove the widget annotations and the AcroForm itself, leaving only
/// the stamped page content.
pub(crate) fn strip_form(doc: &mut Document, fields: &[FormField]) -> Result<(), PdfBindError> {
    let widget_ids: HashSet<ObjectId> = fields
        .iter()
        .flat_map(|f| f.widgets.iter().map(|w| w.annot_id))
        .collect();

    let pages: Vec<ObjectId> = doc.get_pages().into_values().collect();
    for page_id in pages {
        let kept: Option<Vec<Object>> = {
            let Ok(page) = doc.get_object(page_id).and_then(Object::as_dict) else {
                continue;
            };
            match page.get(b"Annots") {
                Ok(Object::Array(arr)) => Some(filter_widgets(arr, &widget_ids)),
                Ok(Object::Reference(rid)) => match doc.get_object(*rid) {
                    Ok(Object::Array(arr)) => Some(filter_widgets(arr, &widget_ids)),
                    _ => None,
                },
                _ => None,
            }
        };

        if let Some(kept) = kept {
            let page = doc
                .get_object_mut(page_id)
                .and_then(Object::as_dict_mut)
                .map_err(|e| PdfBindError::Operation(e.to_string()))?;
            if kept.is_empty() {
                page.remove(b"Annots");
            } else {
                page.set("Annots", Object::Array(kept));
            }
        }
    }

    doc.catalog_mut()
        .map_err(|e| PdfBindError::Operation(e.to_string()))?
        .remove(b"AcroForm");
    Ok(())
}

fn filter_widgets(annots: &[Object], widget_ids: &HashSet<ObjectId>) -> Vec<Object> {
    annots
        .iter()
        .filter(|a| match a {
            Object::Reference(id) => !widget_ids.contains(id),
            _ => true,
        })
        .cloned()
        .collect()
}

/// Drop stale appearance streams from filled text widgets so viewers
/// regenerate them from `/V`.
pub(crate) fn refresh_widgets(doc: &mut Document, field: &FormField) -> Result<(), PdfBindError> {
    if field.kind == FieldKind::Button {
        return Ok(());
    }
    for widget in &field.widgets {
        let widget_dict = doc
            .get_object_mut(widget.annot_id)
            .and_then(Object::as_dict_mut)
            .map_err(|e| PdfBindError::Operation(e.to_string()))?;
        widget_dict.remove(b"AP");
    }
    Ok(())
}

/// Ask viewers to regenerate appearances for non-flattened output.
pub(crate) fn set_need_appearances(doc: &mut Document) -> Result<(), PdfBindError> {
    let acroform_ref = doc
        .catalog()
        .ok()
        .and_then(|c| c.get(b"AcroForm").ok())
        .and_then(|o| o.as_reference().ok());

    match acroform_ref {
        Some(id) => {
            let acroform = doc
                .get_object_mut(id)
                .and_then(Object::as_dict_mut)
                .map_err(|e| PdfBindError::Operation(e.to_string()))?;
            acroform.set("NeedAppearances", Object::Boolean(true));
        }
        None => {
            let catalog = doc
                .catalog_mut()
                .map_err(|e| PdfBindError::Operation(e.to_string()))?;
            if let Ok(Object::Dictionary(acroform)) = catalog.get_mut(b"AcroForm") {
                acroform.set("NeedAppearances", Object::Boolean(true));
            }
        }
    }
    Ok(())
}

/// Escape a line for a PDF literal string. Latin-1 characters become
/// octal escapes (the synthesized font uses WinAnsiEncoding); anything
/// beyond that is replaced.
pub(crate) fn escape_pdf_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '(' => out.push_str("\\("),
            ')' => out.push_str("\\)"),
            '\\' => out.push_str("\\\\"),
            '\n' | '\r' => out.push(' '),
            c if c.is_ascii_graphic() || c == ' ' => out.push(c),
            c if (c as u32) <= 0xFF => out.push_str(&format!("\\{:03o}", c as u32)),
            _ => out.push('?'),
        }
    }
    out
}

/// Encode a value for `/V`: Latin-1 when possible, UTF-16BE otherwise.
fn encode_pdf_text(s: &str) -> Vec<u8> {
    if s.chars().all(|c| (c as u32) <= 0xFF) {
        s.chars().map(|c| c as u8).collect()
    } else {
        let mut bytes = vec![0xFE, 0xFF];
        for unit in s.encode_utf16() {
            bytes.extend_from_slice(&unit.to_be_bytes());
        }
        bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_escape_pdf_string_basic() {
        assert_eq!(escape_pdf_string("Hello"), "Hello");
        assert_eq!(escape_pdf_string("(test)"), "\\(test\\)");
        assert_eq!(escape_pdf_string("back\\slash"), "back\\\\slash");
    }

    #[test]
    fn test_escape_pdf_string_latin1_octal() {
        assert_eq!(escape_pdf_string("Jo\u{e3}o"), "Jo\\343o");
    }

    #[test]
    fn test_escape_pdf_string_replaces_exotic() {
        assert_eq!(escape_pdf_string("a\u{4e16}b"), "a?b");
    }

    #[test]
    fn test_encode_pdf_text_latin1() {
        assert_eq!(encode_pdf_text("Teste"), b"Teste".to_vec());
        assert_eq!(encode_pdf_text("S\u{e3}o"), vec![b'S', 0xE3, b'o']);
    }

    #[test]
    fn test_encode_pdf_text_utf16_for_exotic() {
        let bytes = encode_pdf_text("\u{4e16}");
        assert_eq!(bytes, vec![0xFE, 0xFF, 0x4E, 0x16]);
    }
}
