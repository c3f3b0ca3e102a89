//! Drawing Sanitizer CLI
//!
//! # Usage
//!
//! ```bash
//! drawing-sanitizer save-template --client acme --reference ref.pdf --zones zones.json
//! drawing-sanitizer sanitize --template acme_v1 --out sanitized/ --report low.json drawings/*.pdf
//! drawing-sanitizer retry --template acme_v2 --reports low.json --out sanitized/
//! drawing-sanitizer templates --client acme
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tracing::info;

use drawing_sanitizer::config::SanitizerConfig;
use drawing_sanitizer::pipeline::augment::OllamaTermSuggester;
use drawing_sanitizer::pipeline::batch::{
    BatchPipeline, BatchProgress, BatchRequest, LowConfidencePolicy, LowConfidenceReport,
    PassLogStore, SecondaryRequest,
};
use drawing_sanitizer::pipeline::extraction::pdfium::PdfiumEngine;
use drawing_sanitizer::pipeline::extraction::{OllamaVisionOcr, ZoneExtractor};
use drawing_sanitizer::pipeline::ollama::{missing_models, LlmClient, OllamaClient};
use drawing_sanitizer::pipeline::template::{TemplateStore, ZoneDraft, ZoneId};

type CliResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

#[derive(Parser)]
#[command(name = "drawing-sanitizer")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Template-driven redaction for engineering drawings", long_about = None)]
struct Cli {
    /// Use the local vision model when a zone has no text layer
    #[arg(long, global = true)]
    ocr: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum PolicyArg {
    PerZone,
    WholePage,
}

impl From<PolicyArg> for LowConfidencePolicy {
    fn from(p: PolicyArg) -> Self {
        match p {
            PolicyArg::PerZone => LowConfidencePolicy::PerZone,
            PolicyArg::WholePage => LowConfidencePolicy::WholePage,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Save a new template version from a reference drawing
    SaveTemplate {
        /// Client name; versions are numbered per client
        #[arg(long)]
        client: String,

        /// Reference drawing the zones were drawn on
        #[arg(long)]
        reference: PathBuf,

        /// JSON array of zones: {"page", "bbox": [x0, y0, x1, y1], "paper", "orientation"}
        #[arg(long)]
        zones: PathBuf,

        /// JSON object mapping zone index to a replacement image
        #[arg(long)]
        images: Option<PathBuf>,
    },
    /// Sanitize a batch of drawings against a saved template
    Sanitize {
        /// Template version id, e.g. acme_v1
        #[arg(long)]
        template: String,

        /// Output folder for sanitized drawings
        #[arg(long)]
        out: PathBuf,

        /// Keep output paths relative to this input folder
        #[arg(long)]
        input_root: Option<PathBuf>,

        /// Combined confidence threshold in [0, 1]
        #[arg(long, env = "DRAWING_SANITIZER_THRESHOLD")]
        threshold: Option<f64>,

        #[arg(long, value_enum)]
        policy: Option<PolicyArg>,

        /// Name to redact wherever it appears (repeatable)
        #[arg(long = "name")]
        names: Vec<String>,

        /// Replacement text as OLD=NEW (repeatable)
        #[arg(long = "replace", value_parser = parse_replacement)]
        replacements: Vec<(String, String)>,

        /// JSON object mapping zone index to a replacement image
        #[arg(long)]
        images: Option<PathBuf>,

        /// Folder that relative image paths resolve against
        #[arg(long)]
        image_root: Option<PathBuf>,

        /// Drawing context for suggesting extra terms to redact
        #[arg(long)]
        augment_context: Option<String>,

        /// Write low-confidence reports to this JSON file
        #[arg(long)]
        report: Option<PathBuf>,

        /// Drawings to sanitize
        #[arg(required = true)]
        inputs: Vec<PathBuf>,
    },
    /// List saved template versions, optionally for one client
    Templates {
        #[arg(long)]
        client: Option<String>,
    },
    /// Retry low-confidence drawings against a corrected template
    Retry {
        #[arg(long)]
        template: String,

        /// Report file written by `sanitize --report`
        #[arg(long)]
        reports: PathBuf,

        #[arg(long)]
        out: PathBuf,

        #[arg(long)]
        input_root: Option<PathBuf>,

        #[arg(long, env = "DRAWING_SANITIZER_THRESHOLD")]
        threshold: Option<f64>,

        #[arg(long, value_enum)]
        policy: Option<PolicyArg>,

        #[arg(long)]
        report: Option<PathBuf>,
    },
}

fn parse_replacement(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(old, new)| (old.trim().to_string(), new.to_string()))
        .filter(|(old, _)| !old.is_empty())
        .ok_or_else(|| format!("expected OLD=NEW, got '{raw}'"))
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> CliResult<T> {
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

fn read_image_map(path: &Path) -> CliResult<BTreeMap<ZoneId, String>> {
    let raw: BTreeMap<usize, String> = read_json(path)?;
    Ok(raw.into_iter().map(|(k, v)| (ZoneId(k), v)).collect())
}

fn print_json(value: &impl Serialize) -> CliResult<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn write_reports(path: Option<&Path>, reports: &[LowConfidenceReport]) -> CliResult<()> {
    if let Some(path) = path {
        std::fs::write(path, serde_json::to_string_pretty(reports)?)?;
        info!(path = %path.display(), reports = reports.len(), "Wrote low-confidence reports");
    }
    Ok(())
}

fn log_progress(event: BatchProgress) {
    match event {
        BatchProgress::Started { documents } => info!(documents, "Batch started"),
        BatchProgress::Document { completed, total, current } => {
            info!(completed, total, document = %current.display(), "Document done")
        }
        BatchProgress::Finished { reports } => info!(reports, "Batch finished"),
    }
}

fn build_pipeline(config: &SanitizerConfig, ocr: bool, augment: bool) -> CliResult<BatchPipeline> {
    let llm: Option<Arc<dyn LlmClient + Send + Sync>> = if ocr || augment {
        Some(Arc::new(OllamaClient::new(&config.ollama_url, config.ollama_timeout_secs)?))
    } else {
        None
    };

    if let Some(client) = &llm {
        let mut wanted = Vec::new();
        if ocr {
            wanted.push(config.vision_model.as_str());
        }
        if augment {
            wanted.push(config.llm_model.as_str());
        }
        missing_models(client.as_ref(), &wanted);
    }

    let extractor = match (&llm, ocr) {
        (Some(client), true) => ZoneExtractor::new(Some(Box::new(OllamaVisionOcr::new(
            Arc::clone(client),
            config.vision_model.clone(),
        )))),
        _ => ZoneExtractor::text_only(),
    };

    let pipeline = BatchPipeline::new(
        TemplateStore::open(config.templates_dir())?,
        PassLogStore::open(config.pass_logs_dir())?,
        Box::new(PdfiumEngine::new()?),
        extractor,
    );
    Ok(match llm {
        Some(client) if augment => pipeline.with_suggester(Box::new(OllamaTermSuggester::new(
            client,
            config.llm_model.clone(),
        ))),
        _ => pipeline,
    })
}

fn main() -> CliResult<()> {
    drawing_sanitizer::init_tracing();

    let cli = Cli::parse();
    let config = SanitizerConfig::from_env();
    info!(data_dir = %config.data_dir.display(), "Using data directory");

    match cli.command {
        Commands::SaveTemplate {
            client,
            reference,
            zones,
            images,
        } => {
            let drafts: Vec<ZoneDraft> = read_json(&zones)?;
            let image_map = match images {
                Some(path) => read_image_map(&path)?,
                None => BTreeMap::new(),
            };
            let pipeline = build_pipeline(&config, cli.ocr, false)?;
            let saved = pipeline.templates().save_profile(
                &client,
                &reference,
                &drafts,
                &image_map,
                pipeline.engine(),
                pipeline.extractor(),
            )?;
            info!(
                template = %saved.profile.id,
                path = %saved.path.display(),
                skipped = saved.skipped_zones.len(),
                "Template saved"
            );
            print_json(&saved.profile)
        }
        Commands::Sanitize {
            template,
            out,
            input_root,
            threshold,
            policy,
            names,
            replacements,
            images,
            image_root,
            augment_context,
            report,
            inputs,
        } => {
            let mut request = BatchRequest::new(&template, inputs, out);
            request.input_root = input_root;
            request.threshold = threshold.unwrap_or(config.threshold);
            request.policy = policy.map(Into::into).unwrap_or(config.low_confidence_policy);
            request.manual_names = names;
            request.replacements = replacements.into_iter().collect();
            request.image_map = images.as_deref().map(read_image_map).transpose()?;
            request.image_root = image_root;
            request.augment_context = augment_context;
            request.output_suffix = config.output_suffix.clone();

            let pipeline = build_pipeline(&config, cli.ocr, request.augment_context.is_some())?;
            let outcome = pipeline.run(&request, Some(&log_progress))?;
            write_reports(report.as_deref(), &outcome.reports)?;
            print_json(&outcome)
        }
        Commands::Templates { client } => {
            let store = TemplateStore::open(config.templates_dir())?;
            let clients = match client {
                Some(client) => vec![client],
                None => store.list_clients()?,
            };
            let mut listing = BTreeMap::new();
            for client in clients {
                let versions = store.list_versions(&client)?;
                listing.insert(client, versions);
            }
            print_json(&listing)
        }
        Commands::Retry {
            template,
            reports,
            out,
            input_root,
            threshold,
            policy,
            report,
        } => {
            let mut request = SecondaryRequest::new(&template, read_json(&reports)?, out);
            request.input_root = input_root;
            request.threshold = threshold.unwrap_or(config.threshold);
            request.policy = policy.map(Into::into).unwrap_or(config.low_confidence_policy);
            request.output_suffix = config.output_suffix.clone();

            let pipeline = build_pipeline(&config, cli.ocr, false)?;
            let outcome = pipeline.run_secondary(&request, Some(&log_progress))?;
            write_reports(report.as_deref(), &outcome.reports)?;
            print_json(&outcome)
        }
    }
}
