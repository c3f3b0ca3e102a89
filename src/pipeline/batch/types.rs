use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::{DEFAULT_THRESHOLD, OUTPUT_SUFFIX};
use crate::pipeline::layout::{BBox, PageLayout};
use crate::pipeline::template::ZoneId;

/// How a weak zone affects the other template zones on its page.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LowConfidencePolicy {
    /// Only the weak zone is withheld from redaction.
    #[default]
    PerZone,
    /// Every template zone on the page is withheld.
    WholePage,
}

/// Input to a primary batch run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRequest {
    pub template_id: String,
    pub inputs: Vec<PathBuf>,
    /// When set, each output keeps its path relative to this folder.
    pub input_root: Option<PathBuf>,
    pub output_dir: PathBuf,
    pub threshold: f64,
    pub policy: LowConfidencePolicy,
    pub manual_names: Vec<String>,
    /// Name to substitute text.
    pub replacements: BTreeMap<String, String>,
    /// Overrides the template's own image map.
    pub image_map: Option<BTreeMap<ZoneId, String>>,
    /// Folder that relative image refs resolve against.
    pub image_root: Option<PathBuf>,
    /// Drawing context for term suggestion. Augmentation runs only when this
    /// is set and the pipeline has a suggester.
    pub augment_context: Option<String>,
    /// Appended to each output file stem.
    pub output_suffix: String,
}

impl BatchRequest {
    pub fn new(template_id: &str, inputs: Vec<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            template_id: template_id.to_string(),
            inputs,
            input_root: None,
            output_dir: output_dir.into(),
            threshold: DEFAULT_THRESHOLD,
            policy: LowConfidencePolicy::default(),
            manual_names: Vec::new(),
            replacements: BTreeMap::new(),
            image_map: None,
            image_root: None,
            augment_context: None,
            output_suffix: OUTPUT_SUFFIX.to_string(),
        }
    }
}

/// Pages of one document that need a human look, with the offending zone
/// boxes as drawn on the template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LowConfidenceReport {
    pub document: PathBuf,
    pub pages: BTreeMap<usize, Vec<BBox>>,
    /// Set when the document could not be processed at all.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

impl LowConfidenceReport {
    pub fn new(document: &Path) -> Self {
        Self {
            document: document.to_path_buf(),
            pages: BTreeMap::new(),
            failure: None,
        }
    }

    pub fn failed(document: &Path, reason: String) -> Self {
        Self {
            failure: Some(reason),
            ..Self::new(document)
        }
    }

    pub fn flag(&mut self, page: usize, bbox: BBox) {
        let boxes = self.pages.entry(page).or_default();
        if !boxes.contains(&bbox) {
            boxes.push(bbox);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty() && self.failure.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    Sanitized,
    /// No template zone matched the layout; copied through unchanged.
    LayoutMismatch,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentOutcome {
    pub document: PathBuf,
    pub output: Option<PathBuf>,
    pub status: DocumentStatus,
    pub layout: Option<PageLayout>,
    pub pages: usize,
    pub zones_scored: usize,
    pub low_confidence_zones: usize,
    pub redactions: usize,
    pub images_placed: usize,
    pub replacements_drawn: usize,
    /// Replacement texts the document refused to draw; the names stay redacted.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub replacement_failures: Vec<String>,
    pub duration_ms: u64,
}

impl DocumentOutcome {
    pub(crate) fn new(document: &Path, status: DocumentStatus) -> Self {
        Self {
            document: document.to_path_buf(),
            output: None,
            status,
            layout: None,
            pages: 0,
            zones_scored: 0,
            low_confidence_zones: 0,
            redactions: 0,
            images_placed: 0,
            replacements_drawn: 0,
            replacement_failures: Vec::new(),
            duration_ms: 0,
        }
    }
}

/// Result of a primary or secondary run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchOutcome {
    pub batch_id: Uuid,
    pub template_id: String,
    /// Non-empty reports only, after pass-log filtering.
    pub reports: Vec<LowConfidenceReport>,
    pub documents: Vec<DocumentOutcome>,
    /// Why the run did nothing, when it refused to run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skipped: Option<String>,
    pub duration_ms: u64,
}

impl BatchOutcome {
    pub fn skipped(template_id: &str, reason: String) -> Self {
        Self {
            batch_id: Uuid::new_v4(),
            template_id: template_id.to_string(),
            reports: Vec::new(),
            documents: Vec::new(),
            skipped: Some(reason),
            duration_ms: 0,
        }
    }

    pub fn is_clean(&self) -> bool {
        self.skipped.is_none() && self.reports.is_empty()
    }
}

/// Progress events emitted while a batch runs.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchProgress {
    Started { documents: usize },
    Document { completed: usize, total: usize, current: PathBuf },
    Finished { reports: usize },
}

/// `<output_dir>[/<relative dir>]/<stem><suffix>.<ext>`. The relative dir is
/// the input's folder under `input_root`; inputs outside it land flat.
pub fn output_path(input: &Path, output_dir: &Path, input_root: Option<&Path>, suffix: &str) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "document".to_string());
    let ext = input
        .extension()
        .map(|e| e.to_string_lossy().into_owned())
        .unwrap_or_else(|| "pdf".to_string());

    let relative_dir = input_root
        .and_then(|root| input.strip_prefix(root).ok())
        .and_then(Path::parent)
        .map(Path::to_path_buf)
        .unwrap_or_default();

    output_dir
        .join(relative_dir)
        .join(format!("{stem}{suffix}.{ext}"))
}
