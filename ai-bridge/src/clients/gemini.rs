use async_trait::async_trait;
use serde::Deserialize;
use serde_with::{DefaultOnNull, serde_as};
use std::sync::Arc;

use super::{GenerationOutcome, GenerationRequest, ProviderClient, ProviderError, error_details};
use crate::config::ModelCatalog;

const PROVIDER: &str = "Gemini";
const DEFAULT_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

#[serde_as]
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde_as(deserialize_as = "DefaultOnNull")]
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    usage_metadata: Option<UsageMetadata>,
    #[serde(default)]
    model_version: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Option<Content>,
}

#[serde_as]
#[derive(Debug, Deserialize)]
struct Content {
    #[serde_as(deserialize_as = "DefaultOnNull")]
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    #[serde(default)]
    text: Option<String>,
}

#[serde_as]
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde_as(deserialize_as = "DefaultOnNull")]
    #[serde(default)]
    prompt_token_count: u64,
    #[serde_as(deserialize_as = "DefaultOnNull")]
    #[serde(default)]
    candidates_token_count: u64,
    #[serde_as(deserialize_as = "DefaultOnNull")]
    #[serde(default)]
    total_token_count: u64,
}

/// Google's Generative Language API, called directly.
pub struct GeminiClient {
    api_key: String,
    client: reqwest::Client,
    base_url: String,
    models: Arc<ModelCatalog>,
}

impl GeminiClient {
    pub fn new(api_key: String, base_url: Option<String>, models: Arc<ModelCatalog>) -> Self {
        Self {
            api_key,
            client: reqwest::Client::new(),
            base_url: base_url.unwrap_or_else(|| DEFAULT_URL.to_string()),
            models,
        }
    }

    fn endpoint(&self, model_id: &str) -> String {
        format!(
            "{}/models/{}:generateContent",
            self.base_url.trim_end_matches('/'),
            model_id
        )
    }
}

#[async_trait]
impl ProviderClient for GeminiClient {
    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationOutcome, ProviderError> {
        let model_id = self.models.resolve(&request.model).to_string();
        let body = serde_json::json!({
            "contents": [
                {
                    "role": "user",
                    "parts": [{ "text": request.prompt }]
                }
            ],
            "generationConfig": {
                "temperature": request.temperature,
                "maxOutputTokens": request.max_tokens
            }
        });

        let response = self
            .client
            .post(self.endpoint(&model_id))
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::Transport {
                provider: PROVIDER,
                message: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ProviderError::Api {
                provider: PROVIDER,
                status: status.as_u16(),
                details: error_details(text),
            });
        }

        let parsed: GenerateContentResponse =
            response.json().await.map_err(|e| ProviderError::Parse {
                provider: PROVIDER,
                message: e.to_string(),
            })?;

        // Multi-part candidates are concatenated.
        let text = parsed
            .candidates
            .into_iter()
            .next()
            .and_then(|candidate| candidate.content)
            .map(|content| {
                content
                    .parts
                    .into_iter()
                    .filter_map(|part| part.text)
                    .collect::<String>()
            })
            .filter(|text| !text.is_empty());
        let usage = parsed.usage_metadata.unwrap_or_default();

        Ok(GenerationOutcome::new(
            text,
            usage.prompt_token_count,
            usage.candidates_token_count,
            usage.total_token_count,
            None,
            "Google",
            parsed.model_version.unwrap_or(model_id),
        ))
    }
}
