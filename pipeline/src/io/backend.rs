//! Generation backend seam.
//!
//! The engine never builds prompts or parses model responses itself; agent
//! executors receive a handle to whatever implements [`GenerationBackend`].
//! A run with no backend at all still works: the placeholder executor
//! substitutes deterministic content (see [`crate::executor`]).

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;

/// How the caller wants the model's answer shaped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResponseFormat {
    #[default]
    Text,
    Json,
}

/// One generation call.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub prompt: String,
    pub system: Option<String>,
    pub temperature: Option<f64>,
    pub response_format: ResponseFormat,
}

impl GenerationRequest {
    pub fn text(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            system: None,
            temperature: None,
            response_format: ResponseFormat::Text,
        }
    }

    pub fn json(prompt: impl Into<String>) -> Self {
        Self {
            response_format: ResponseFormat::Json,
            ..Self::text(prompt)
        }
    }
}

/// A backend answer: free text or an already-parsed structured mapping.
#[derive(Debug, Clone)]
pub enum GenerationResponse {
    Text(String),
    Structured(Map<String, Value>),
}

/// Backend-specific failure kinds.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("generation request failed: {0}")]
    Request(String),
    #[error("backend returned malformed structured content: {0}")]
    Malformed(String),
}

/// Abstraction over the text-generation service.
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    async fn generate(&self, request: GenerationRequest)
    -> Result<GenerationResponse, BackendError>;
}
