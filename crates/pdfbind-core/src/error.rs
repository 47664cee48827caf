use thiserror::Error;

#[derive(Error, Debug)]
pub enum PdfBindError {
    #[error("template path must not be null")]
    MissingTemplatePath,

    #[error("failed to open template: {0}")]
    TemplateOpen(String),

    #[error("input parameter count differs from template parameter count (got {supplied}, template declares {expected})")]
    ParameterCount { supplied: usize, expected: usize },

    #[error("parameters [{names}] do not exist in template")]
    UnknownParameters { names: String },

    #[error("unsupported image: {0}")]
    UnsupportedImage(String),

    #[error("PDF operation failed: {0}")]
    Operation(String),
}
