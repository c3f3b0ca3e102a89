//! Batch sanitization.
//!
//! ```text
//! layout → replicate zones → extract → score → classify
//!        → redact (high-confidence ∪ manual) → place images → overlay text
//!        → report low-confidence pages, minus pages already passed
//! ```
//!
//! Documents are processed one at a time; each is opened, edited, saved and
//! dropped before the next. A failing document is reported, not fatal.

pub mod types;
pub mod pass_log;
pub mod runner;
pub mod secondary;

pub use types::*;
pub use pass_log::{document_key, PassLog, PassLogStore};
pub use runner::BatchPipeline;
pub use secondary::SecondaryRequest;

use thiserror::Error;

use crate::pipeline::extraction::ExtractionError;
use crate::pipeline::template::TemplateError;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Pass log JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Template error: {0}")]
    Template(#[from] TemplateError),

    #[error("Document error: {0}")]
    Extraction(#[from] ExtractionError),

    #[error("Pass log for client '{0}' is locked by another run")]
    PassLogLocked(String),

    #[error("Invalid batch request: {0}")]
    InvalidRequest(String),
}
