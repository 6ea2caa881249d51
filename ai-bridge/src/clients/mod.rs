use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

use crate::config::{ModelCatalog, ProviderKind};

mod gemini;
mod openrouter;

pub use gemini::GeminiClient;
pub use openrouter::OpenRouterClient;

const NO_RESPONSE: &str = "No response";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub prompt: String,
    /// Alias or fully-qualified provider id.
    pub model: String,
    pub temperature: f64,
    pub max_tokens: u32,
}

/// A provider reply normalized to one shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationOutcome {
    pub text: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    /// Provider-declared cost, 0 when the provider reports none.
    pub cost: f64,
    pub provider_label: String,
    pub resolved_model_id: String,
}

impl GenerationOutcome {
    pub fn new(
        text: Option<String>,
        prompt_tokens: u64,
        completion_tokens: u64,
        reported_total: u64,
        cost: Option<f64>,
        provider_label: impl Into<String>,
        resolved_model_id: impl Into<String>,
    ) -> Self {
        let total_tokens = if reported_total == 0 {
            prompt_tokens.saturating_add(completion_tokens)
        } else {
            reported_total
        };
        Self {
            text: text.unwrap_or_else(|| NO_RESPONSE.to_string()),
            prompt_tokens,
            completion_tokens,
            total_tokens,
            cost: cost.unwrap_or(0.0),
            provider_label: provider_label.into(),
            resolved_model_id: resolved_model_id.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("{provider} API Error: HTTP {status}\nDetails: {details}")]
    Api {
        provider: &'static str,
        status: u16,
        details: String,
    },
    #[error("Error calling {provider}: {message}")]
    Transport {
        provider: &'static str,
        message: String,
    },
    #[error("Unexpected error: {provider} returned an unreadable response: {message}")]
    Parse {
        provider: &'static str,
        message: String,
    },
}

#[async_trait]
pub trait ProviderClient: Send + Sync {
    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationOutcome, ProviderError>;
}

/// Structured JSON error bodies are embedded compactly, anything else verbatim.
pub(crate) fn error_details(body: String) -> String {
    match serde_json::from_str::<serde_json::Value>(&body) {
        Ok(value) => value.to_string(),
        Err(_) => body,
    }
}

pub fn create_provider_client(
    kind: ProviderKind,
    api_key: String,
    base_url: Option<String>,
    models: Arc<ModelCatalog>,
) -> Box<dyn ProviderClient> {
    match kind {
        ProviderKind::OpenRouter => Box::new(OpenRouterClient::new(api_key, base_url, models)),
        ProviderKind::Gemini => Box::new(GeminiClient::new(api_key, base_url, models)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_total_recomputed_when_not_reported() {
        let outcome = GenerationOutcome::new(Some("hi".into()), 5, 2, 0, None, "X", "x/1");
        assert_eq!(outcome.total_tokens, 7);
        assert_eq!(outcome.cost, 0.0);
    }

    #[test]
    fn test_reported_total_kept() {
        let outcome = GenerationOutcome::new(Some("hi".into()), 5, 2, 9, Some(0.01), "X", "x/1");
        assert_eq!(outcome.total_tokens, 9);
        assert_eq!(outcome.cost, 0.01);
    }

    #[test]
    fn test_missing_text_defaults() {
        let outcome = GenerationOutcome::new(None, 0, 0, 0, None, "X", "x/1");
        assert_eq!(outcome.text, "No response");
    }

    #[test]
    fn test_total_saturates() {
        let outcome = GenerationOutcome::new(None, u64::MAX, 5, 0, None, "X", "x/1");
        assert_eq!(outcome.total_tokens, u64::MAX);
    }

    #[test]
    fn test_error_details_prefers_json() {
        assert_eq!(
            error_details(r#"{ "error": { "code": 401 } }"#.to_string()),
            r#"{"error":{"code":401}}"#
        );
        assert_eq!(error_details("Bad Gateway".to_string()), "Bad Gateway");
    }

    #[test]
    fn test_api_error_message() {
        let err = ProviderError::Api {
            provider: "OpenRouter",
            status: 401,
            details: "nope".into(),
        };
        assert_eq!(err.to_string(), "OpenRouter API Error: HTTP 401\nDetails: nope");
    }
}
