//! Template binder
//!
//! Configuration accumulates across builder calls and is consumed once by
//! [`TemplateBinder::generate`], which validates the field map against the
//! template, merges values and overlays, flattens, and serializes. A
//! binder produces one document; build a fresh one per output.

use crate::error::PdfBindError;
use crate::flatten;
use crate::image::{ImageKind, ImagePlacement};
use crate::template::AcroFormTemplate;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use tracing::{debug, instrument, warn};

/// Generation options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BindOptions {
    /// Flatten filled fields into static page content (the default).
    /// When off, fields stay editable and `/NeedAppearances` asks the
    /// viewer to render the written values.
    #[serde(default = "default_flatten")]
    pub flatten: bool,
    /// Fixed appearance font size; `None` derives one from each field
    /// rectangle.
    #[serde(default)]
    pub font_size: Option<f64>,
}

fn default_flatten() -> bool {
    true
}

impl Default for BindOptions {
    fn default() -> Self {
        Self {
            flatten: true,
            font_size: None,
        }
    }
}

/// Builder for one bound document.
#[derive(Debug, Default)]
pub struct TemplateBinder {
    template_path: Option<PathBuf>,
    fields: Vec<(String, String)>,
    images: Vec<ImagePlacement>,
    options: BindOptions,
}

impl TemplateBinder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the template location. Validated at generate time.
    pub fn with_template(mut self, path: impl Into<PathBuf>) -> Self {
        self.template_path = Some(path.into());
        self
    }

    pub fn with_options(mut self, options: BindOptions) -> Self {
        self.options = options;
        self
    }

    /// Queue a field value. Re-adding a name replaces its value; first
    /// insertion order is what error reporting follows.
    pub fn add_field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let name = name.into();
        let value = value.into();
        match self.fields.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = value,
            None => self.fields.push((name, value)),
        }
        self
    }

    /// Queue a batch of field values.
    pub fn add_fields<I, K, V>(mut self, entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (name, value) in entries {
            self = self.add_field(name, value);
        }
        self
    }

    /// Queue a raster overlay on the first page.
    pub fn add_image(self, data: Vec<u8>, x: f64, y: f64) -> Self {
        self.add_image_on_page(data, x, y, 1)
    }

    /// Queue a raster overlay on a specific 1-based page.
    pub fn add_image_on_page(mut self, data: Vec<u8>, x: f64, y: f64, page: u32) -> Self {
        self.images.push(ImagePlacement {
            data,
            x,
            y,
            page,
            kind: ImageKind::Raster,
        });
        self
    }

    /// Queue a barcode overlay on the first page.
    pub fn add_barcode(mut self, data: Vec<u8>, x: f64, y: f64) -> Self {
        self.images.push(ImagePlacement {
            data,
            x,
            y,
            page: 1,
            kind: ImageKind::Barcode,
        });
        self
    }

    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    /// Produce the bound document.
    #[instrument(skip(self), fields(field_count = self.fields.len(), image_count = self.images.len()))]
    pub fn generate(self) -> Result<Vec<u8>, PdfBindError> {
        let path = self
            .template_path
            .as_ref()
            .filter(|p| !p.as_os_str().is_empty())
            .ok_or(PdfBindError::MissingTemplatePath)?;

        let template = AcroFormTemplate::from_path(path)?;
        debug!(declared = template.field_count(), "template loaded");
        self.bind(template)
    }

    fn bind(self, template: AcroFormTemplate) -> Result<Vec<u8>, PdfBindError> {
        let declared = template.field_names();
        if self.fields.len() != declared.len() {
            return Err(PdfBindError::ParameterCount {
                supplied: self.fields.len(),
                expected: declared.len(),
            });
        }

        let known: HashSet<&str> = declared.iter().map(String::as_str).collect();
        let missing: Vec<&str> = self
            .fields
            .iter()
            .map(|(name, _)| name.as_str())
            .filter(|name| !known.contains(name))
            .collect();
        if !missing.is_empty() {
            return Err(PdfBindError::UnknownParameters {
                names: missing.join(", "),
            });
        }

        let (mut doc, form_fields) = template.into_parts();

        let mut stamps = Vec::new();
        for (name, value) in &self.fields {
            // Exact-match validation above guarantees the lookup succeeds.
            let Some(field) = form_fields.iter().find(|f| f.name == *name) else {
                continue;
            };
            if field.widgets.is_empty() {
                warn!(field = %name, "field has no widget annotations; value will not be visible");
            }
            flatten::fill_field(&mut doc, field, value)?;
            if self.options.flatten {
                stamps.extend(flatten::appearance_stamps(
                    &mut doc,
                    field,
                    value,
                    &self.options,
                )?);
            } else {
                flatten::refresh_widgets(&mut doc, field)?;
            }
        }

        stamps.extend(flatten::image_stamps(&mut doc, &self.images)?);
        flatten::apply_stamps(&mut doc, stamps)?;

        if self.options.flatten {
            flatten::strip_form(&mut doc, &form_fields)?;
        } else {
            flatten::set_need_appearances(&mut doc)?;
        }

        doc.prune_objects();
        doc.compress();

        let mut buffer = Vec::new();
        doc.save_to(&mut buffer)
            .map_err(|e| PdfBindError::Operation(e.to_string()))?;
        debug!(bytes = buffer.len(), "document generated");
        Ok(buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_generate_without_template_path() {
        let result = TemplateBinder::new().add_field("Nome", "Teste").generate();
        assert!(matches!(result, Err(PdfBindError::MissingTemplatePath)));
    }

    #[test]
    fn test_generate_with_empty_template_path() {
        let result = TemplateBinder::new().with_template("").generate();
        assert!(matches!(result, Err(PdfBindError::MissingTemplatePath)));
    }

    #[test]
    fn test_missing_path_message_names_the_parameter() {
        let err = TemplateBinder::new().generate().unwrap_err();
        assert_eq!(err.to_string(), "template path must not be null");
    }

    #[test]
    fn test_add_field_replaces_duplicate_names() {
        let binder = TemplateBinder::new()
            .add_field("Nome", "primeiro")
            .add_field("CPF", "01234567890")
            .add_field("Nome", "segundo");
        assert_eq!(binder.field_count(), 2);
        assert_eq!(binder.fields[0], ("Nome".to_string(), "segundo".to_string()));
    }

    #[test]
    fn test_add_fields_preserves_insertion_order() {
        let binder = TemplateBinder::new().add_fields([
            ("N_Termo", "012"),
            ("Nome", "Teste"),
            ("CPF", "01205524585"),
        ]);
        let names: Vec<&str> = binder.fields.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["N_Termo", "Nome", "CPF"]);
    }

    #[test]
    fn test_bind_options_defaults() {
        let opts = BindOptions::default();
        assert!(opts.flatten);
        assert_eq!(opts.font_size, None);
    }

    #[test]
    fn test_bind_options_deserialize_defaults() {
        let opts: BindOptions = serde_json::from_str("{}").unwrap();
        assert!(opts.flatten);
        assert_eq!(opts.font_size, None);
    }
}
