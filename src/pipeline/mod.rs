pub mod layout;
pub mod extraction;
pub mod template;
pub mod scoring;
pub mod redaction;
pub mod ollama; // Local LLM client for OCR and term suggestion
pub mod augment;
pub mod batch;
