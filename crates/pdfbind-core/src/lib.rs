//! PDF template binding
//!
//! This crate merges caller data into a PDF form template and returns a
//! flattened document as bytes. The flow is: queue field values and image
//! overlays on a [`TemplateBinder`], point it at a template file, and call
//! [`TemplateBinder::generate`]. Validation is strict: the supplied field
//! names must match the template's declared fields exactly, and mismatches
//! report every offending name.
//!
//! Barcode overlays are produced by the companion `pdfbind-barcode` crate
//! and queued here like any other image.

pub mod binder;
pub mod error;
mod flatten;
pub mod image;
pub mod template;

pub use binder::{BindOptions, TemplateBinder};
pub use error::PdfBindError;
pub use image::{ImageKind, ImagePlacement};
pub use template::{AcroFormTemplate, FieldKind, FormField};

/// Inspect a template's declared field names without binding anything.
pub fn template_field_names(bytes: &[u8]) -> Result<Vec<String>, PdfBindError> {
    Ok(AcroFormTemplate::from_bytes(bytes)?.field_names())
}
