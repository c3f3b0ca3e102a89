//! Blocking client for a local Ollama server.
//!
//! Used for term suggestion (`/api/generate`) and vision OCR (`/api/generate`
//! with base64 `images`). Both are advisory collaborators: callers degrade to
//! "feature unavailable" when Ollama is down.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum OllamaError {
    #[error("Ollama is not running at {0}")]
    Connection(String),

    #[error("Ollama returned error (status {status}): {body}")]
    Status { status: u16, body: String },

    #[error("HTTP client error: {0}")]
    HttpClient(String),

    #[error("Response parsing error: {0}")]
    ResponseParsing(String),
}

/// Ollama LLM client abstraction (allows mocking)
pub trait LlmClient {
    fn generate(&self, model: &str, prompt: &str, system: &str) -> Result<String, OllamaError>;

    /// Prompt a vision model with base64-encoded images.
    fn generate_with_images(
        &self,
        model: &str,
        prompt: &str,
        images: &[String],
    ) -> Result<String, OllamaError>;

    /// Names of installed models, e.g. `llava:13b`.
    fn list_models(&self) -> Result<Vec<String>, OllamaError>;
}

/// Models from `wanted` that the server does not have.
///
/// Never fails: an unreachable server is logged and every model is reported
/// missing, so the affected features fall back to their offline behaviour.
pub fn missing_models(client: &dyn LlmClient, wanted: &[&str]) -> Vec<String> {
    match client.list_models() {
        Ok(installed) => {
            let missing: Vec<String> = wanted
                .iter()
                .filter(|m| !installed.iter().any(|i| i.starts_with(**m)))
                .map(|m| m.to_string())
                .collect();
            for model in &missing {
                warn!(model = %model, "Model not installed; run `ollama pull {model}`");
            }
            if missing.is_empty() {
                info!(models = ?wanted, "Ollama models available");
            }
            missing
        }
        Err(e) => {
            warn!(error = %e, "Ollama unavailable; LLM features will degrade");
            wanted.iter().map(|m| m.to_string()).collect()
        }
    }
}

/// Ollama HTTP client for local LLM inference.
pub struct OllamaClient {
    base_url: String,
    client: reqwest::blocking::Client,
    timeout_secs: u64,
}

impl OllamaClient {
    pub fn new(base_url: &str, timeout_secs: u64) -> Result<Self, OllamaError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(std::time::Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| OllamaError::HttpClient(e.to_string()))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            timeout_secs,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn post_generate(&self, body: &GenerateRequest<'_>) -> Result<String, OllamaError> {
        let url = format!("{}/api/generate", self.base_url);
        let response = self.client.post(&url).json(body).send().map_err(|e| {
            if e.is_connect() {
                OllamaError::Connection(self.base_url.clone())
            } else if e.is_timeout() {
                OllamaError::HttpClient(format!("Request timed out after {}s", self.timeout_secs))
            } else {
                OllamaError::HttpClient(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(OllamaError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: GenerateResponse = response
            .json()
            .map_err(|e| OllamaError::ResponseParsing(e.to_string()))?;
        Ok(parsed.response)
    }
}

/// Request body for Ollama /api/generate
#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    images: Option<&'a [String]>,
    stream: bool,
}

#[derive(Deserialize)]
struct GenerateResponse {
    response: String,
}

#[derive(Deserialize)]
struct TagsResponse {
    models: Vec<TagModel>,
}

#[derive(Deserialize)]
struct TagModel {
    name: String,
}

impl LlmClient for OllamaClient {
    fn generate(&self, model: &str, prompt: &str, system: &str) -> Result<String, OllamaError> {
        self.post_generate(&GenerateRequest {
            model,
            prompt,
            system: (!system.is_empty()).then_some(system),
            images: None,
            stream: false,
        })
    }

    fn generate_with_images(
        &self,
        model: &str,
        prompt: &str,
        images: &[String],
    ) -> Result<String, OllamaError> {
        self.post_generate(&GenerateRequest {
            model,
            prompt,
            system: None,
            images: Some(images),
            stream: false,
        })
    }

    fn list_models(&self) -> Result<Vec<String>, OllamaError> {
        let url = format!("{}/api/tags", self.base_url);

        let response = self.client.get(&url).send().map_err(|e| {
            if e.is_connect() {
                OllamaError::Connection(self.base_url.clone())
            } else {
                OllamaError::HttpClient(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(OllamaError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: TagsResponse = response
            .json()
            .map_err(|e| OllamaError::ResponseParsing(e.to_string()))?;

        Ok(parsed.models.into_iter().map(|m| m.name).collect())
    }
}

// ── Mock for testing ──────────────────────────────────────

/// Mock LLM client returning a fixed response, or failing like an offline server.
pub struct MockLlmClient {
    response: Option<String>,
    available_models: Vec<String>,
}

impl MockLlmClient {
    pub fn new(response: &str) -> Self {
        Self {
            response: Some(response.to_string()),
            available_models: vec!["llama3:latest".to_string()],
        }
    }

    /// A client whose every call fails with a connection error.
    pub fn offline() -> Self {
        Self {
            response: None,
            available_models: Vec::new(),
        }
    }

    pub fn with_models(mut self, models: Vec<String>) -> Self {
        self.available_models = models;
        self
    }

    fn respond(&self) -> Result<String, OllamaError> {
        self.response
            .clone()
            .ok_or_else(|| OllamaError::Connection("mock://offline".into()))
    }
}

impl LlmClient for MockLlmClient {
    fn generate(&self, _model: &str, _prompt: &str, _system: &str) -> Result<String, OllamaError> {
        self.respond()
    }

    fn generate_with_images(
        &self,
        _model: &str,
        _prompt: &str,
        _images: &[String],
    ) -> Result<String, OllamaError> {
        self.respond()
    }

    fn list_models(&self) -> Result<Vec<String>, OllamaError> {
        self.respond()?;
        Ok(self.available_models.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_client_returns_configured_response() {
        let client = MockLlmClient::new("test response");
        assert_eq!(client.generate("model", "prompt", "system").unwrap(), "test response");
        assert_eq!(
            client.generate_with_images("model", "prompt", &["aGk=".into()]).unwrap(),
            "test response"
        );
    }

    #[test]
    fn missing_models_lists_only_absent_ones() {
        let client = MockLlmClient::new("").with_models(vec!["llava:13b".into()]);
        assert_eq!(missing_models(&client, &["llava", "llama3"]), vec!["llama3"]);
        assert!(missing_models(&client, &["llava"]).is_empty());
    }

    #[test]
    fn offline_server_reports_every_model_missing() {
        let client = MockLlmClient::offline();
        assert_eq!(missing_models(&client, &["llava", "llama3"]), vec!["llava", "llama3"]);
    }

    #[test]
    fn offline_mock_fails_with_connection_error() {
        let client = MockLlmClient::offline();
        assert!(matches!(client.generate("m", "p", ""), Err(OllamaError::Connection(_))));
        assert!(client.list_models().is_err());
    }

    #[test]
    fn ollama_client_trims_trailing_slash() {
        let client = OllamaClient::new("http://localhost:11434/", 60).unwrap();
        assert_eq!(client.base_url(), "http://localhost:11434");
        assert_eq!(client.timeout_secs, 60);
    }

    #[test]
    fn generate_request_omits_empty_fields() {
        let body = GenerateRequest {
            model: "llama3",
            prompt: "hi",
            system: None,
            images: None,
            stream: false,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert!(json.get("system").is_none());
        assert!(json.get("images").is_none());
        assert_eq!(json["stream"], false);
    }
}
