pub mod types;
pub mod store;

pub use types::*;
pub use store::*;

use std::path::PathBuf;

use thiserror::Error;

use crate::pipeline::extraction::ExtractionError;

#[derive(Error, Debug)]
pub enum TemplateError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Template JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Template profile not found for '{id}' (checked {checked:?})")]
    TemplateNotFound { id: String, checked: Vec<PathBuf> },

    #[error("No zones were provided")]
    NoZonesProvided,

    #[error("No zones match the reference layout ({layout})")]
    NoMatchingZones { layout: String },

    #[error("All zones were invalid or out of bounds on the reference document")]
    NoValidZones,

    #[error("Template version already exists: {0}")]
    VersionConflict(String),

    #[error("Stored template '{0}' is inconsistent: zones and fingerprints do not correspond")]
    Inconsistent(String),

    #[error("Reference document error: {0}")]
    Extraction(#[from] ExtractionError),
}
