//! Secondary pass: retry low-confidence documents against a corrected template.
//!
//! Only template-anchored redaction is retried. Term augmentation, manual
//! names, image placement and text replacement are not part of this pass.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use super::runner::{validate_threshold, BatchPipeline, DocumentPlan};
use super::types::*;
use super::PipelineError;
use crate::config::{DEFAULT_THRESHOLD, MIN_SECONDARY_DOCUMENTS, OUTPUT_SUFFIX};
use crate::pipeline::scoring::Thresholds;
use crate::pipeline::template::{parse_template_id, safe_client_id, TemplateError, TemplateProfile};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecondaryRequest {
    /// Corrected template version, e.g. `acme_v2`.
    pub template_id: String,
    /// Reports from an earlier run; one document each.
    pub reports: Vec<LowConfidenceReport>,
    pub input_root: Option<PathBuf>,
    pub output_dir: PathBuf,
    pub threshold: f64,
    pub policy: LowConfidencePolicy,
    pub output_suffix: String,
}

impl SecondaryRequest {
    pub fn new(template_id: &str, reports: Vec<LowConfidenceReport>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            template_id: template_id.to_string(),
            reports,
            input_root: None,
            output_dir: output_dir.into(),
            threshold: DEFAULT_THRESHOLD,
            policy: LowConfidencePolicy::default(),
            output_suffix: OUTPUT_SUFFIX.to_string(),
        }
    }
}

impl BatchPipeline {
    /// Reprocess the documents named in earlier reports.
    ///
    /// Refuses (with an explanatory `skipped` message) when fewer than
    /// [`MIN_SECONDARY_DOCUMENTS`] documents are given.
    pub fn run_secondary(
        &self,
        request: &SecondaryRequest,
        progress_fn: Option<&dyn Fn(BatchProgress)>,
    ) -> Result<BatchOutcome, PipelineError> {
        let start = Instant::now();
        let mut seen = BTreeSet::new();
        let documents: Vec<PathBuf> = request
            .reports
            .iter()
            .map(|r| r.document.clone())
            .filter(|d| seen.insert(d.clone()))
            .collect();

        if documents.len() < MIN_SECONDARY_DOCUMENTS {
            let message = format!(
                "Secondary pass needs at least {MIN_SECONDARY_DOCUMENTS} documents, received {}",
                documents.len()
            );
            warn!(template = %request.template_id, documents = documents.len(), "{message}");
            return Ok(BatchOutcome::skipped(&request.template_id, message));
        }
        validate_threshold(request.threshold)?;

        let profile = self.resolve_template(&request.template_id)?;
        std::fs::create_dir_all(&request.output_dir)?;
        let batch_id = Uuid::new_v4();
        info!(
            batch_id = %batch_id,
            template = %profile.id,
            documents = documents.len(),
            "Starting secondary pass"
        );

        let plan = DocumentPlan {
            profile: &profile,
            thresholds: Thresholds::from_combined(request.threshold),
            policy: request.policy,
            primary: None,
        };
        let jobs: Vec<(PathBuf, PathBuf)> = documents
            .into_iter()
            .map(|input| {
                let output = output_path(
                    &input,
                    &request.output_dir,
                    request.input_root.as_deref(),
                    &request.output_suffix,
                );
                (input, output)
            })
            .collect();
        let (reports, outcomes) = self.run_documents(&plan, &jobs, progress_fn)?;

        let versions = self.templates().list_versions(&profile.client)?;
        info!(
            client = %profile.client,
            versions = ?versions,
            secondary_runs = versions.len().saturating_sub(1),
            "Client template versions"
        );

        Ok(BatchOutcome {
            batch_id,
            template_id: profile.id.clone(),
            reports,
            documents: outcomes,
            skipped: None,
            duration_ms: start.elapsed().as_millis() as u64,
        })
    }

    /// Load `id`, or the client's next expected version when `id` is absent.
    fn resolve_template(&self, id: &str) -> Result<TemplateProfile, PipelineError> {
        let checked = match self.templates().load_profile(id) {
            Ok(profile) => return Ok(profile),
            Err(TemplateError::TemplateNotFound { checked, .. }) => checked,
            Err(e) => return Err(e.into()),
        };

        let client = parse_template_id(id)
            .map(|(client, _)| client)
            .unwrap_or_else(|| safe_client_id(id));
        let next = self.templates().next_version_id(&client)?;
        match self.templates().load_profile(&next) {
            Ok(profile) => {
                info!(requested = id, using = %next, "Requested template not found; using next version");
                Ok(profile)
            }
            Err(TemplateError::TemplateNotFound { checked: more, .. }) => {
                Err(TemplateError::TemplateNotFound {
                    id: format!("{id} (or {next})"),
                    checked: checked.into_iter().chain(more).collect(),
                }
                .into())
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::path::Path;

    use crate::pipeline::batch::PassLogStore;
    use crate::pipeline::extraction::memory::{MemoryDocument, MemoryPage, MemoryPdfEngine};
    use crate::pipeline::extraction::ZoneExtractor;
    use crate::pipeline::layout::{BBox, Orientation, Paper};
    use crate::pipeline::template::{TemplateStore, ZoneDraft};

    const ZONE: BBox = BBox { x0: 10.0, y0: 10.0, x1: 110.0, y1: 60.0 };

    fn page(company: &str) -> MemoryPage {
        MemoryPage::blank(595.0, 842.0)
            .with_word(BBox::new(20.0, 20.0, 60.0, 40.0), company)
            .with_word(BBox::new(300.0, 500.0, 360.0, 520.0), "Bracket")
    }

    fn setup() -> (tempfile::TempDir, BatchPipeline) {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = BatchPipeline::new(
            TemplateStore::open(dir.path().join("templates")).unwrap(),
            PassLogStore::open(dir.path().join("pass_logs")).unwrap(),
            Box::new(MemoryPdfEngine),
            ZoneExtractor::text_only(),
        );
        let reference = write(dir.path(), "ref.json", vec![page("Globex")]);
        pipeline
            .templates()
            .save_profile(
                "acme",
                &reference,
                &[ZoneDraft::new(0, ZONE, Paper::A4, Orientation::Vertical)],
                &BTreeMap::new(),
                pipeline.engine(),
                pipeline.extractor(),
            )
            .unwrap();
        (dir, pipeline)
    }

    fn write(dir: &Path, name: &str, pages: Vec<MemoryPage>) -> PathBuf {
        let path = dir.join(name);
        MemoryDocument::new(pages).write_to(&path).unwrap();
        path
    }

    fn reports(dir: &Path) -> Vec<LowConfidenceReport> {
        let docs = [
            write(dir, "a.json", vec![page("Globex"), page("Globex")]),
            write(dir, "b.json", vec![page("Globex"), page("Initech")]),
            write(dir, "c.json", vec![page("Globex")]),
        ];
        docs.iter()
            .map(|d| {
                let mut r = LowConfidenceReport::new(d);
                r.flag(0, ZONE);
                r
            })
            .collect()
    }

    #[test]
    fn refuses_small_batches_with_a_message() {
        let (dir, pipeline) = setup();
        let mut few = reports(dir.path());
        few.truncate(2);
        let request = SecondaryRequest::new("acme_v1", few, dir.path().join("out"));
        let outcome = pipeline.run_secondary(&request, None).unwrap();
        assert!(outcome.skipped.unwrap().contains("at least 3"));
        assert!(outcome.documents.is_empty());
        assert!(!dir.path().join("out").exists());
    }

    #[test]
    fn duplicate_reports_count_once() {
        let (dir, pipeline) = setup();
        let all = reports(dir.path());
        let dupes = vec![all[0].clone(), all[0].clone(), all[1].clone()];
        let request = SecondaryRequest::new("acme_v1", dupes, dir.path().join("out"));
        assert!(pipeline.run_secondary(&request, None).unwrap().skipped.is_some());
    }

    #[test]
    fn reprocesses_and_reports_in_primary_shape() {
        let (dir, pipeline) = setup();
        let request = SecondaryRequest::new("acme_v1", reports(dir.path()), dir.path().join("out"));
        let outcome = pipeline.run_secondary(&request, None).unwrap();

        assert_eq!(outcome.template_id, "acme_v1");
        assert_eq!(outcome.documents.len(), 3);
        assert_eq!(outcome.reports.len(), 1);
        assert_eq!(outcome.reports[0].document, dir.path().join("b.json"));
        assert_eq!(outcome.reports[0].pages[&1], vec![ZONE]);

        let a = MemoryDocument::load(&dir.path().join("out/a_sanitized.json")).unwrap();
        assert!(a.pages.iter().all(|p| p.text() == "Bracket"));

        let log = pipeline.pass_logs().load("acme").unwrap();
        assert_eq!(log["a"], BTreeSet::from([0, 1]));
        assert_eq!(log["b"], BTreeSet::from([0]));
    }

    #[test]
    fn falls_back_to_next_expected_version() {
        let (dir, pipeline) = setup();
        // A flat profile under the next expected id, as left by older installs.
        let v1 = dir.path().join("templates/acme/acme_v1.json");
        std::fs::copy(&v1, dir.path().join("templates/acme_v2.json")).unwrap();

        let request = SecondaryRequest::new("acme_v7", reports(dir.path()), dir.path().join("out"));
        let outcome = pipeline.run_secondary(&request, None).unwrap();
        assert!(outcome.skipped.is_none());
        assert_eq!(outcome.documents.len(), 3);
    }

    #[test]
    fn fails_when_neither_version_exists() {
        let (dir, pipeline) = setup();
        let request = SecondaryRequest::new("acme_v7", reports(dir.path()), dir.path().join("out"));
        let err = pipeline.run_secondary(&request, None).unwrap_err();
        match err {
            PipelineError::Template(TemplateError::TemplateNotFound { id, checked }) => {
                assert!(id.contains("acme_v2"));
                assert!(checked.len() >= 2);
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
