//! BatchPipeline: sanitizes documents against a stored template.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Instant;

use tracing::{debug, info, warn};
use uuid::Uuid;

use super::pass_log::{document_key, PassLog, PassLogStore};
use super::types::*;
use super::PipelineError;
use crate::pipeline::augment::{augment_names, TermSuggester};
use crate::pipeline::extraction::{PdfEngine, ZoneExtractor, ZoneInstance};
use crate::pipeline::layout::{classify_document, classify_pages};
use crate::pipeline::redaction::{
    collect_manual_matches, place_images, ImagePlacement, ManualMatches, OverlayOutcome,
    PlacementOutcome, RedactionEngine, RedactionRect, ReplacementOverlay,
};
use crate::pipeline::scoring::{score, ScoreRecord, Thresholds};
use crate::pipeline::template::{TemplateProfile, TemplateStore, ZoneId};

/// Stages that only the primary pass runs.
pub(super) struct PrimaryStages<'a> {
    pub names: &'a [String],
    pub replacements: &'a BTreeMap<String, String>,
    pub image_map: &'a BTreeMap<ZoneId, String>,
    pub image_root: Option<&'a Path>,
    pub augment_context: Option<&'a str>,
}

pub(super) struct DocumentPlan<'a> {
    pub profile: &'a TemplateProfile,
    pub thresholds: Thresholds,
    pub policy: LowConfidencePolicy,
    pub primary: Option<PrimaryStages<'a>>,
}

struct DocumentResult {
    outcome: DocumentOutcome,
    report: LowConfidenceReport,
    passed: BTreeSet<usize>,
}

/// Orchestrates template-driven sanitization of a batch of documents.
pub struct BatchPipeline {
    templates: TemplateStore,
    pass_logs: PassLogStore,
    engine: Box<dyn PdfEngine + Send + Sync>,
    extractor: ZoneExtractor,
    suggester: Option<Box<dyn TermSuggester + Send + Sync>>,
    redaction: RedactionEngine,
    overlay: ReplacementOverlay,
}

impl BatchPipeline {
    pub fn new(
        templates: TemplateStore,
        pass_logs: PassLogStore,
        engine: Box<dyn PdfEngine + Send + Sync>,
        extractor: ZoneExtractor,
    ) -> Self {
        Self {
            templates,
            pass_logs,
            engine,
            extractor,
            suggester: None,
            redaction: RedactionEngine,
            overlay: ReplacementOverlay::default(),
        }
    }

    /// Enable LLM term augmentation for requests that carry a context.
    pub fn with_suggester(mut self, suggester: Box<dyn TermSuggester + Send + Sync>) -> Self {
        self.suggester = Some(suggester);
        self
    }

    pub fn templates(&self) -> &TemplateStore {
        &self.templates
    }

    pub fn pass_logs(&self) -> &PassLogStore {
        &self.pass_logs
    }

    pub fn engine(&self) -> &dyn PdfEngine {
        self.engine.as_ref()
    }

    pub fn extractor(&self) -> &ZoneExtractor {
        &self.extractor
    }

    /// Run the primary pass over every input.
    ///
    /// Only template or pass-log failures return `Err`; a document that cannot
    /// be processed becomes a report entry with `failure` set.
    pub fn run(
        &self,
        request: &BatchRequest,
        progress_fn: Option<&dyn Fn(BatchProgress)>,
    ) -> Result<BatchOutcome, PipelineError> {
        let start = Instant::now();
        validate_threshold(request.threshold)?;
        let profile = self.templates.load_profile(&request.template_id)?;
        std::fs::create_dir_all(&request.output_dir)?;

        let batch_id = Uuid::new_v4();
        info!(
            batch_id = %batch_id,
            template = %profile.id,
            documents = request.inputs.len(),
            threshold = request.threshold,
            "Starting batch"
        );

        let plan = DocumentPlan {
            profile: &profile,
            thresholds: Thresholds::from_combined(request.threshold),
            policy: request.policy,
            primary: Some(PrimaryStages {
                names: &request.manual_names,
                replacements: &request.replacements,
                image_map: request.image_map.as_ref().unwrap_or(&profile.image_map),
                image_root: request.image_root.as_deref(),
                augment_context: request.augment_context.as_deref(),
            }),
        };
        let jobs: Vec<(PathBuf, PathBuf)> = request
            .inputs
            .iter()
            .map(|input| {
                let output = output_path(
                    input,
                    &request.output_dir,
                    request.input_root.as_deref(),
                    &request.output_suffix,
                );
                (input.clone(), output)
            })
            .collect();

        let (reports, documents) = self.run_documents(&plan, &jobs, progress_fn)?;
        let outcome = BatchOutcome {
            batch_id,
            template_id: profile.id.clone(),
            reports,
            documents,
            skipped: None,
            duration_ms: start.elapsed().as_millis() as u64,
        };
        info!(
            batch_id = %batch_id,
            flagged = outcome.reports.len(),
            duration_ms = outcome.duration_ms,
            "Batch complete"
        );
        Ok(outcome)
    }

    /// Process each job in turn, then merge passed pages into the client's
    /// log and drop already-passed pages from the reports.
    pub(super) fn run_documents(
        &self,
        plan: &DocumentPlan<'_>,
        jobs: &[(PathBuf, PathBuf)],
        progress_fn: Option<&dyn Fn(BatchProgress)>,
    ) -> Result<(Vec<LowConfidenceReport>, Vec<DocumentOutcome>), PipelineError> {
        if let Some(progress) = progress_fn {
            progress(BatchProgress::Started { documents: jobs.len() });
        }

        let mut reports = Vec::with_capacity(jobs.len());
        let mut documents = Vec::with_capacity(jobs.len());
        let mut passed = PassLog::new();

        for (i, (input, output)) in jobs.iter().enumerate() {
            if let Some(progress) = progress_fn {
                progress(BatchProgress::Document {
                    completed: i,
                    total: jobs.len(),
                    current: input.clone(),
                });
            }

            let started = Instant::now();
            match self.process_document(plan, input, output) {
                Ok(mut result) => {
                    result.outcome.duration_ms = started.elapsed().as_millis() as u64;
                    if !result.passed.is_empty() {
                        passed
                            .entry(document_key(input))
                            .or_default()
                            .extend(result.passed);
                    }
                    reports.push(result.report);
                    documents.push(result.outcome);
                }
                Err(e) => {
                    warn!(document = %input.display(), error = %e, "Document failed");
                    reports.push(LowConfidenceReport::failed(input, e.to_string()));
                    let mut outcome = DocumentOutcome::new(input, DocumentStatus::Failed);
                    outcome.duration_ms = started.elapsed().as_millis() as u64;
                    documents.push(outcome);
                }
            }
        }

        let cumulative = self.pass_logs.merge(&plan.profile.client, &passed)?;
        let reports = filter_passed(reports, &cumulative);

        if let Some(progress) = progress_fn {
            progress(BatchProgress::Finished { reports: reports.len() });
        }
        Ok((reports, documents))
    }

    fn process_document(
        &self,
        plan: &DocumentPlan<'_>,
        input: &Path,
        output: &Path,
    ) -> Result<DocumentResult, PipelineError> {
        let mut doc = self.engine.open(input)?;
        let page_count = doc.page_count();
        let mut report = LowConfidenceReport::new(input);
        let mut outcome = DocumentOutcome::new(input, DocumentStatus::Sanitized);
        outcome.pages = page_count;

        // Step 1: layout
        let layout = classify_document(doc.as_ref())?;
        outcome.layout = Some(layout);
        let odd_sheets: Vec<usize> = classify_pages(doc.as_ref())?
            .iter()
            .enumerate()
            .filter(|(_, sheet)| **sheet != layout)
            .map(|(page, _)| page)
            .collect();
        if !odd_sheets.is_empty() {
            warn!(
                document = %input.display(),
                layout = %layout,
                pages = ?odd_sheets,
                "Document mixes sheet layouts; zones follow the first page"
            );
        }
        let zones = plan.profile.zones_for(&layout);
        info!(
            document = %input.display(),
            layout = %layout,
            pages = page_count,
            zones = zones.len(),
            "Processing document"
        );

        if zones.is_empty() {
            warn!(document = %input.display(), layout = %layout, "No template zone matches layout; flagging every page");
            for page in 0..page_count {
                for zone in &plan.profile.zones {
                    report.flag(page, zone.bbox);
                }
            }
            drop(doc);
            ensure_parent(output)?;
            std::fs::copy(input, output)?;
            outcome.status = DocumentStatus::LayoutMismatch;
            outcome.low_confidence_zones = page_count * plan.profile.zones.len();
            outcome.output = Some(output.to_path_buf());
            return Ok(DocumentResult {
                outcome,
                report,
                passed: BTreeSet::new(),
            });
        }

        // Step 2: one instance of every zone on every page
        let instances: Vec<ZoneInstance> = (0..page_count)
            .flat_map(|page| {
                zones.iter().map(move |z| ZoneInstance {
                    zone_id: z.zone_id,
                    page,
                    bbox: z.bbox,
                })
            })
            .collect();

        // Step 3: extract and score
        let extraction = self.extractor.extract(doc.as_ref(), &instances)?;
        for skipped in &extraction.skipped {
            report.flag(skipped.page, skipped.bbox);
        }
        let mut records = Vec::with_capacity(extraction.fingerprints.len());
        for live in &extraction.fingerprints {
            let Some(reference) = plan.profile.fingerprint(live.zone_id) else {
                warn!(zone_id = %live.zone_id, "Zone has no reference fingerprint");
                report.flag(live.page, live.bbox);
                continue;
            };
            let record = score(reference, live);
            debug!(
                page = record.page,
                zone_id = %record.zone_id,
                text = record.text_score,
                image = ?record.image_score,
                score = record.combined_score,
                "Zone scored"
            );
            records.push(record);
        }
        outcome.zones_scored = records.len();

        // Step 4: classify
        let (mut high, low): (Vec<ScoreRecord>, Vec<ScoreRecord>) = records
            .into_iter()
            .partition(|r| !r.is_low_confidence(&plan.thresholds));
        for r in &low {
            report.flag(r.page, r.bbox);
        }
        let mut withheld = 0;
        if plan.policy == LowConfidencePolicy::WholePage {
            let weak_pages: BTreeSet<usize> = report.pages.keys().copied().collect();
            high.retain(|r| {
                let keep = !weak_pages.contains(&r.page);
                if !keep {
                    report.flag(r.page, r.bbox);
                    withheld += 1;
                }
                keep
            });
        }
        outcome.low_confidence_zones = extraction.skipped.len() + low.len() + withheld;
        let template_rects: Vec<RedactionRect> = high
            .iter()
            .map(|r| RedactionRect::new(r.page, r.transformed))
            .collect();

        // Step 5: manual names
        let manual = match &plan.primary {
            Some(stages) => {
                let names = match (stages.augment_context, &self.suggester) {
                    (Some(context), Some(suggester)) => {
                        augment_names(&**suggester, doc.as_ref(), context, stages.names)
                    }
                    _ => stages.names.to_vec(),
                };
                collect_manual_matches(doc.as_ref(), &names, stages.replacements)?
            }
            None => ManualMatches::default(),
        };

        // Step 6: redact high-confidence zones and manual names
        let mut rects = template_rects.clone();
        rects.extend(manual.rects.iter().copied());
        outcome.redactions = self.redaction.redact(doc.as_mut(), &rects)?.applied;

        if let Some(stages) = &plan.primary {
            // Step 7: substitute images, high-confidence zones only
            let placements: Vec<ImagePlacement> = high
                .iter()
                .filter_map(|r| {
                    stages.image_map.get(&r.zone_id).map(|image_ref| ImagePlacement {
                        page: r.page,
                        zone_id: r.zone_id,
                        bbox: r.transformed,
                        image_ref: image_ref.clone(),
                    })
                })
                .collect();
            outcome.images_placed = place_images(doc.as_mut(), &placements, stages.image_root)
                .iter()
                .filter(|o| matches!(o, PlacementOutcome::Placed { .. }))
                .count();

            // Step 8: replacement text, failures recorded but never fatal
            for overlay in self.overlay.apply(doc.as_mut(), &manual.replacements, &template_rects) {
                match overlay {
                    OverlayOutcome::Drawn { .. } => outcome.replacements_drawn += 1,
                    OverlayOutcome::Failed { reason } => outcome.replacement_failures.push(reason),
                    _ => {}
                }
            }
        }

        // Step 9: save and report
        ensure_parent(output)?;
        doc.save(output)?;
        outcome.output = Some(output.to_path_buf());

        let passed: BTreeSet<usize> = (0..page_count)
            .filter(|p| !report.pages.contains_key(p))
            .collect();
        info!(
            document = %input.display(),
            output = %output.display(),
            redactions = outcome.redactions,
            low_confidence = outcome.low_confidence_zones,
            "Document sanitized"
        );
        Ok(DocumentResult {
            outcome,
            report,
            passed,
        })
    }
}

pub(super) fn validate_threshold(threshold: f64) -> Result<(), PipelineError> {
    if (0.0..=1.0).contains(&threshold) {
        Ok(())
    } else {
        Err(PipelineError::InvalidRequest(format!(
            "threshold {threshold} is outside [0, 1]"
        )))
    }
}

fn ensure_parent(path: &Path) -> Result<(), PipelineError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    Ok(())
}

/// Remove pages already recorded as passed; drop reports left empty.
pub fn filter_passed(reports: Vec<LowConfidenceReport>, log: &PassLog) -> Vec<LowConfidenceReport> {
    reports
        .into_iter()
        .map(|mut report| {
            if let Some(passed) = log.get(&document_key(&report.document)) {
                report.pages.retain(|page, _| !passed.contains(page));
            }
            report
        })
        .filter(|report| !report.is_empty())
        .collect()
}
