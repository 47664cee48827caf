//! AcroForm template inspection
//!
//! A template is a read-only PDF whose named form fields are the binding
//! targets. This module walks the field tree once at load time and exposes
//! the names, kinds, and widget rectangles the binder needs; the concrete
//! lopdf document stays behind this surface.

use crate::error::PdfBindError;
use lopdf::{Document, Object, ObjectId};
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// Free text (`/FT /Tx`)
    Text,
    /// Checkbox or radio group (`/FT /Btn`)
    Button,
    /// Combo or list box (`/FT /Ch`)
    Choice,
    /// Anything else; treated as text for filling purposes
    Other,
}

/// A widget annotation carrying a field's visual on a page.
#[derive(Debug, Clone)]
pub struct Widget {
    pub annot_id: ObjectId,
    pub page_id: ObjectId,
    /// Normalized `[x1, y1, x2, y2]` with `x1 <= x2`, `y1 <= y2`.
    pub rect: [f64; 4],
}

/// A terminal form field with its fully-qualified name.
#[derive(Debug, Clone)]
pub struct FormField {
    pub name: String,
    pub kind: FieldKind,
    pub field_id: ObjectId,
    pub widgets: Vec<Widget>,
}

/// A loaded template and its declared fields.
pub struct AcroFormTemplate {
    doc: Document,
    fields: Vec<FormField>,
}

impl AcroFormTemplate {
    pub fn from_path(path: &Path) -> Result<Self, PdfBindError> {
        let doc =
            Document::load(path).map_err(|e| PdfBindError::TemplateOpen(e.to_string()))?;
        Self::from_document(doc)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PdfBindError> {
        let doc =
            Document::load_mem(bytes).map_err(|e| PdfBindError::TemplateOpen(e.to_string()))?;
        Self::from_document(doc)
    }

    fn from_document(doc: Document) -> Result<Self, PdfBindError> {
        let fields = collect_fields(&doc)?;
        Ok(Self { doc, fields })
    }

    /// Declared field names in document order.
    pub fn field_names(&self) -> Vec<String> {
        self.fields.iter().map(|f| f.name.clone()).collect()
    }

    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    pub fn field(&self, name: &str) -> Option<&FormField> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn fields(&self) -> &[FormField] {
        &self.fields
    }

    /// Hand the document and field table to the binder for mutation.
    pub(crate) fn into_parts(self) -> (Document, Vec<FormField>) {
        (self.doc, self.fields)
    }
}

/// Follow a reference one level; non-references pass through.
fn resolve<'a>(doc: &'a Document, obj: &'a Object) -> &'a Object {
    match obj {
        Object::Reference(id) => doc.get_object(*id).unwrap_or(obj),
        other => other,
    }
}

/// Walk the AcroForm field tree into a flat list of terminal fields.
pub(crate) fn collect_fields(doc: &Document) -> Result<Vec<FormField>, PdfBindError> {
    let mut out = Vec::new();

    let catalog = doc
        .catalog()
        .map_err(|e| PdfBindError::Operation(e.to_string()))?;
    let acroform = match catalog.get(b"AcroForm") {
        Ok(obj) => resolve(doc, obj),
        Err(_) => return Ok(out),
    };
    let acroform = match acroform.as_dict() {
        Ok(dict) => dict,
        Err(_) => return Ok(out),
    };
    let roots = match acroform.get(b"Fields").map(|o| resolve(doc, o)) {
        Ok(Object::Array(arr)) => arr,
        _ => return Ok(out),
    };

    let annot_pages = annot_page_map(doc);
    for root in roots {
        if let Object::Reference(id) = root {
            walk_field(doc, *id, None, None, &annot_pages, &mut out)?;
        }
    }
    Ok(out)
}

/// Map every page annotation back to its page, so widgets can be placed
/// without relying on an optional `/P` entry.
fn annot_page_map(doc: &Document) -> BTreeMap<ObjectId, ObjectId> {
    let mut map = BTreeMap::new();
    for (_, page_id) in doc.get_pages() {
        let annots = doc
            .get_object(page_id)
            .and_then(Object::as_dict)
            .and_then(|page| page.get(b"Annots"))
            .map(|o| resolve(doc, o));
        if let Ok(Object::Array(annots)) = annots {
            for annot in annots {
                if let Object::Reference(annot_id) = annot {
                    map.insert(*annot_id, page_id);
                }
            }
        }
    }
    map
}

fn walk_field(
    doc: &Document,
    id: ObjectId,
    prefix: Option<&str>,
    inherited_kind: Option<FieldKind>,
    annot_pages: &BTreeMap<ObjectId, ObjectId>,
    out: &mut Vec<FormField>,
) -> Result<(), PdfBindError> {
    let dict = doc
        .get_object(id)
        .and_then(Object::as_dict)
        .map_err(|e| PdfBindError::Operation(e.to_string()))?;

    let own_name = dict.get(b"T").ok().and_then(|o| match resolve(doc, o) {
        Object::String(bytes, _) => Some(decode_pdf_text(bytes)),
        _ => None,
    });
    let qualified = match (prefix, &own_name) {
        (Some(p), Some(n)) => Some(format!("{}.{}", p, n)),
        (Some(p), None) => Some(p.to_string()),
        (None, n) => n.clone(),
    };

    let kind = field_kind(dict).or(inherited_kind);

    let kid_ids: Vec<ObjectId> = match dict.get(b"Kids").map(|o| resolve(doc, o)) {
        Ok(Object::Array(arr)) => arr
            .iter()
            .filter_map(|o| o.as_reference().ok())
            .collect(),
        _ => Vec::new(),
    };

    // Kids that carry their own partial name are nested fields, not widgets.
    let has_named_kids = kid_ids.iter().any(|kid| {
        doc.get_object(*kid)
            .and_then(Object::as_dict)
            .map(|d| d.has(b"T"))
            .unwrap_or(false)
    });
    if has_named_kids {
        for kid in kid_ids {
            walk_field(doc, kid, qualified.as_deref(), kind, annot_pages, out)?;
        }
        return Ok(());
    }

    // Terminal field. Anonymous fields cannot be addressed and are skipped.
    let Some(name) = qualified else {
        return Ok(());
    };

    let mut widgets = Vec::new();
    if dict.has(b"Rect") {
        if let Some(widget) = widget_from(doc, id, annot_pages) {
            widgets.push(widget);
        }
    }
    for kid in kid_ids {
        if let Some(widget) = widget_from(doc, kid, annot_pages) {
            widgets.push(widget);
        }
    }

    out.push(FormField {
        name,
        kind: kind.unwrap_or(FieldKind::Other),
        field_id: id,
        widgets,
    });
    Ok(())
}

fn field_kind(dict: &lopdf::Dictionary) -> Option<FieldKind> {
    match dict.get(b"FT") {
        Ok(Object::Name(ft)) => Some(match ft.as_slice() {
            b"Tx" => FieldKind::Text,
            b"Btn" => FieldKind::Button,
            b"Ch" => FieldKind::Choice,
            _ => FieldKind::Other,
        }),
        _ => None,
    }
}

fn widget_from(
    doc: &Document,
    id: ObjectId,
    annot_pages: &BTreeMap<ObjectId, ObjectId>,
) -> Option<Widget> {
    let dict = doc.get_object(id).and_then(Object::as_dict).ok()?;
    let rect = rect_from(resolve(doc, dict.get(b"Rect").ok()?))?;
    let page_id = annot_pages.get(&id).copied().or_else(|| {
        dict.get(b"P")
            .ok()
            .and_then(|o| o.as_reference().ok())
    })?;
    Some(Widget {
        annot_id: id,
        page_id,
        rect,
    })
}

fn rect_from(obj: &Object) -> Option<[f64; 4]> {
    let arr = obj.as_array().ok()?;
    if arr.len() != 4 {
        return None;
    }
    let mut v = [0f64; 4];
    for (i, o) in arr.iter().enumerate() {
        v[i] = match o {
            Object::Integer(n) => *n as f64,
            Object::Real(r) => *r as f64,
            _ => return None,
        };
    }
    let (x1, x2) = if v[0] <= v[2] { (v[0], v[2]) } else { (v[2], v[0]) };
    let (y1, y2) = if v[1] <= v[3] { (v[1], v[3]) } else { (v[3], v[1]) };
    Some([x1, y1, x2, y2])
}

/// Decode a PDF text string: UTF-16BE when it carries a BOM, otherwise
/// byte-per-char (PDFDocEncoding overlaps Latin-1 for the names we see).
pub(crate) fn decode_pdf_text(bytes: &[u8]) -> String {
    if bytes.len() >= 2 && bytes[0] == 0xFE && bytes[1] == 0xFF {
        let units: Vec<u16> = bytes[2..]
            .chunks_exact(2)
            .map(|c| u16::from_be_bytes([c[0], c[1]]))
            .collect();
        String::from_utf16_lossy(&units)
    } else {
        bytes.iter().map(|&b| b as char).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lopdf::{dictionary, Dictionary, Stream};

    fn form_doc(field_names: &[&str]) -> Document {
        let mut doc = Document::with_version("1.5");
        let pages_id = doc.new_object_id();
        let page_id = doc.new_object_id();

        let mut field_refs = Vec::new();
        let mut annot_refs = Vec::new();
        for (i, name) in field_names.iter().enumerate() {
            let y = 700 - (i as i64) * 40;
            let field_id = doc.add_object(dictionary! {
                "FT" => "Tx",
                "T" => Object::String(name.as_bytes().to_vec(), lopdf::StringFormat::Literal),
                "Type" => "Annot",
                "Subtype" => "Widget",
                "Rect" => vec![100.into(), y.into(), 300.into(), (y + 20).into()],
            });
            field_refs.push(Object::Reference(field_id));
            annot_refs.push(Object::Reference(field_id));
        }

        let content_id = doc.add_object(Object::Stream(Stream::new(
            Dictionary::new(),
            b"BT /F1 12 Tf 72 740 Td (Form) Tj ET".to_vec(),
        )));
        doc.objects.insert(
            page_id,
            Object::Dictionary(dictionary! {
                "Type" => "Page",
                "Parent" => Object::Reference(pages_id),
                "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
                "Contents" => Object::Reference(content_id),
                "Annots" => annot_refs,
            }),
        );
        doc.objects.insert(
            pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => vec![Object::Reference(page_id)],
                "Count" => 1,
            }),
        );
        let acroform_id = doc.add_object(dictionary! {
            "Fields" => field_refs,
        });
        let catalog_id = doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => Object::Reference(pages_id),
            "AcroForm" => Object::Reference(acroform_id),
        });
        doc.trailer.set("Root", Object::Reference(catalog_id));
        doc
    }

    #[test]
    fn test_collect_fields_names_in_document_order() {
        let doc = form_doc(&["Nome", "CPF", "Endereco"]);
        let fields = collect_fields(&doc).unwrap();
        let names: Vec<&str> = fields.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["Nome", "CPF", "Endereco"]);
    }

    #[test]
    fn test_collected_fields_have_widgets_with_pages() {
        let doc = form_doc(&["Nome"]);
        let fields = collect_fields(&doc).unwrap();
        assert_eq!(fields.len(), 1);
        assert_eq!(fields[0].kind, FieldKind::Text);
        assert_eq!(fields[0].widgets.len(), 1);
        assert_eq!(fields[0].widgets[0].rect, [100.0, 700.0, 300.0, 720.0]);
    }

    #[test]
    fn test_document_without_acroform_has_no_fields() {
        let mut doc = Document::with_version("1.5");
        let pages_id = doc.add_object(dictionary! {
            "Type" => "Pages",
            "Kids" => Vec::<Object>::new(),
            "Count" => 0,
        });
        let catalog_id = doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => Object::Reference(pages_id),
        });
        doc.trailer.set("Root", Object::Reference(catalog_id));

        let fields = collect_fields(&doc).unwrap();
        assert!(fields.is_empty());
    }

    #[test]
    fn test_template_from_bytes_roundtrip() {
        let mut doc = form_doc(&["Nome", "CPF"]);
        let mut bytes = Vec::new();
        doc.save_to(&mut bytes).unwrap();

        let template = AcroFormTemplate::from_bytes(&bytes).unwrap();
        assert_eq!(template.field_count(), 2);
        assert!(template.field("CPF").is_some());
        assert!(template.field("Inexistente").is_none());
    }

    #[test]
    fn test_invalid_bytes_fail_to_open() {
        let result = AcroFormTemplate::from_bytes(b"not a pdf at all");
        assert!(matches!(result, Err(PdfBindError::TemplateOpen(_))));
    }

    #[test]
    fn test_decode_pdf_text_latin1() {
        assert_eq!(decode_pdf_text(b"Endereco"), "Endereco");
        assert_eq!(decode_pdf_text(&[0x43, 0x61, 0xE7, 0xE3, 0x6F]), "Ca\u{e7}\u{e3}o");
    }

    #[test]
    fn test_decode_pdf_text_utf16be() {
        let bytes = [0xFE, 0xFF, 0x00, 0x4E, 0x00, 0x6F, 0x00, 0x6D, 0x00, 0x65];
        assert_eq!(decode_pdf_text(&bytes), "Nome");
    }

    #[test]
    fn test_rect_normalization() {
        let obj = Object::Array(vec![
            Object::Integer(300),
            Object::Real(720.0),
            Object::Integer(100),
            Object::Real(700.0),
        ]);
        assert_eq!(rect_from(&obj), Some([100.0, 700.0, 300.0, 720.0]));
    }

    #[test]
    fn test_nested_fields_get_dotted_names() {
        let mut doc = Document::with_version("1.5");
        let pages_id = doc.new_object_id();
        let page_id = doc.new_object_id();

        let kid_id = doc.add_object(dictionary! {
            "FT" => "Tx",
            "T" => Object::String(b"Rua".to_vec(), lopdf::StringFormat::Literal),
            "Subtype" => "Widget",
            "Rect" => vec![100.into(), 100.into(), 200.into(), 120.into()],
        });
        let parent_id = doc.add_object(dictionary! {
            "T" => Object::String(b"Endereco".to_vec(), lopdf::StringFormat::Literal),
            "Kids" => vec![Object::Reference(kid_id)],
        });

        doc.objects.insert(
            page_id,
            Object::Dictionary(dictionary! {
                "Type" => "Page",
                "Parent" => Object::Reference(pages_id),
                "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
                "Annots" => vec![Object::Reference(kid_id)],
            }),
        );
        doc.objects.insert(
            pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => vec![Object::Reference(page_id)],
                "Count" => 1,
            }),
        );
        let acroform_id = doc.add_object(dictionary! {
            "Fields" => vec![Object::Reference(parent_id)],
        });
        let catalog_id = doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => Object::Reference(pages_id),
            "AcroForm" => Object::Reference(acroform_id),
        });
        doc.trailer.set("Root", Object::Reference(catalog_id));

        let fields = collect_fields(&doc).unwrap();
        assert_eq!(fields.len(), 1);
        assert_eq!(fields[0].name, "Endereco.Rua");
        assert_eq!(fields[0].widgets.len(), 1);
    }
}
