use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::pipeline::batch::LowConfidencePolicy;

/// Application-level constants
pub const APP_NAME: &str = "DrawingSanitizer";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Raster resolution for the OCR fallback.
pub const OCR_DPI: u32 = 300;

/// Raster resolution for perceptual hashing. Must never change once templates
/// exist, or stored hashes stop being comparable.
pub const HASH_DPI: u32 = 100;

/// Slack in points when checking that a zone lies on its page.
pub const BOUNDS_TOLERANCE: f32 = 0.1;

/// Fewest low-confidence documents a secondary pass will accept.
pub const MIN_SECONDARY_DOCUMENTS: usize = 3;

pub const DEFAULT_THRESHOLD: f64 = 0.9;
pub const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";
pub const DEFAULT_OLLAMA_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_LLM_MODEL: &str = "llama3";
pub const DEFAULT_VISION_MODEL: &str = "llava";
pub const OUTPUT_SUFFIX: &str = "_sanitized";

/// Data directory: `DRAWING_SANITIZER_HOME`, else `~/DrawingSanitizer`.
pub fn app_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("DRAWING_SANITIZER_HOME") {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }
    match dirs::home_dir() {
        Some(home) => home.join(APP_NAME),
        None => PathBuf::from(APP_NAME),
    }
}

pub fn templates_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("templates")
}

pub fn pass_logs_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("pass_logs")
}

/// Filter used when `RUST_LOG` is unset.
pub fn default_log_filter() -> &'static str {
    if cfg!(debug_assertions) {
        "drawing_sanitizer=debug,info"
    } else {
        "drawing_sanitizer=info,warn"
    }
}

/// Runtime settings. Every field has a default; selected fields can be
/// overridden through environment variables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SanitizerConfig {
    pub data_dir: PathBuf,
    /// Combined-score threshold; text and image thresholds derive from it.
    pub threshold: f64,
    pub low_confidence_policy: LowConfidencePolicy,
    pub ollama_url: String,
    pub ollama_timeout_secs: u64,
    pub llm_model: String,
    pub vision_model: String,
    pub output_suffix: String,
}

impl Default for SanitizerConfig {
    fn default() -> Self {
        Self {
            data_dir: app_data_dir(),
            threshold: DEFAULT_THRESHOLD,
            low_confidence_policy: LowConfidencePolicy::PerZone,
            ollama_url: DEFAULT_OLLAMA_URL.to_string(),
            ollama_timeout_secs: DEFAULT_OLLAMA_TIMEOUT_SECS,
            llm_model: DEFAULT_LLM_MODEL.to_string(),
            vision_model: DEFAULT_VISION_MODEL.to_string(),
            output_suffix: OUTPUT_SUFFIX.to_string(),
        }
    }
}

impl SanitizerConfig {
    /// Defaults with environment overrides applied. Unparseable values are
    /// logged and ignored.
    pub fn from_env() -> Self {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(raw) = lookup("DRAWING_SANITIZER_THRESHOLD") {
            match raw.trim().parse::<f64>() {
                Ok(t) if (0.0..=1.0).contains(&t) => self.threshold = t,
                _ => tracing::warn!(value = %raw, "Ignoring invalid DRAWING_SANITIZER_THRESHOLD"),
            }
        }
        if let Some(url) = lookup("DRAWING_SANITIZER_OLLAMA_URL") {
            self.ollama_url = url;
        }
        if let Some(model) = lookup("DRAWING_SANITIZER_LLM_MODEL") {
            self.llm_model = model;
        }
        if let Some(model) = lookup("DRAWING_SANITIZER_VISION_MODEL") {
            self.vision_model = model;
        }
        if let Some(suffix) = lookup("DRAWING_SANITIZER_OUTPUT_SUFFIX") {
            if suffix.contains(['/', '\\']) {
                tracing::warn!(value = %suffix, "Ignoring DRAWING_SANITIZER_OUTPUT_SUFFIX with a path separator");
            } else {
                self.output_suffix = suffix;
            }
        }
        self
    }

    pub fn templates_dir(&self) -> PathBuf {
        templates_dir(&self.data_dir)
    }

    pub fn pass_logs_dir(&self) -> PathBuf {
        pass_logs_dir(&self.data_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_dirs_under_data_dir() {
        let config = SanitizerConfig {
            data_dir: PathBuf::from("/srv/sanitizer"),
            ..SanitizerConfig::default()
        };
        assert_eq!(config.templates_dir(), PathBuf::from("/srv/sanitizer/templates"));
        assert_eq!(config.pass_logs_dir(), PathBuf::from("/srv/sanitizer/pass_logs"));
    }

    #[test]
    fn defaults() {
        let config = SanitizerConfig::default();
        assert_eq!(config.threshold, 0.9);
        assert_eq!(config.low_confidence_policy, LowConfidencePolicy::PerZone);
        assert_eq!(config.output_suffix, "_sanitized");
    }

    #[test]
    fn overrides_apply() {
        let config = SanitizerConfig::default().with_overrides(|key| match key {
            "DRAWING_SANITIZER_THRESHOLD" => Some("0.75".into()),
            "DRAWING_SANITIZER_LLM_MODEL" => Some("mistral".into()),
            _ => None,
        });
        assert_eq!(config.threshold, 0.75);
        assert_eq!(config.llm_model, "mistral");
        assert_eq!(config.vision_model, DEFAULT_VISION_MODEL);
    }

    #[test]
    fn invalid_threshold_is_ignored() {
        let config = SanitizerConfig::default().with_overrides(|key| {
            (key == "DRAWING_SANITIZER_THRESHOLD").then(|| "1.7".to_string())
        });
        assert_eq!(config.threshold, DEFAULT_THRESHOLD);
    }

    #[test]
    fn output_suffix_override() {
        let config = SanitizerConfig::default().with_overrides(|key| {
            (key == "DRAWING_SANITIZER_OUTPUT_SUFFIX").then(|| "_clean".to_string())
        });
        assert_eq!(config.output_suffix, "_clean");

        let config = SanitizerConfig::default().with_overrides(|key| {
            (key == "DRAWING_SANITIZER_OUTPUT_SUFFIX").then(|| "/../x".to_string())
        });
        assert_eq!(config.output_suffix, OUTPUT_SUFFIX);
    }

    #[test]
    fn fixed_resolutions() {
        assert_eq!(OCR_DPI, 300);
        assert_eq!(HASH_DPI, 100);
        assert_eq!(MIN_SECONDARY_DOCUMENTS, 3);
    }

    #[test]
    fn app_version_matches_cargo() {
        assert_eq!(APP_VERSION, "0.1.0");
    }
}
