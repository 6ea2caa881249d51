use async_trait::async_trait;
use serde::Deserialize;
use serde_with::{DefaultOnNull, serde_as};
use std::sync::Arc;

use super::{GenerationOutcome, GenerationRequest, ProviderClient, ProviderError, error_details};
use crate::config::ModelCatalog;

const PROVIDER: &str = "OpenRouter";
const DEFAULT_URL: &str = "https://openrouter.ai/api/v1/chat/completions";

#[serde_as]
#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde_as(deserialize_as = "DefaultOnNull")]
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
    #[serde(default)]
    provider: Option<String>,
    #[serde(default)]
    model: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    #[serde(default)]
    message: Option<ChoiceMessage>,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[serde_as]
#[derive(Debug, Default, Deserialize)]
struct Usage {
    #[serde_as(deserialize_as = "DefaultOnNull")]
    #[serde(default)]
    prompt_tokens: u64,
    #[serde_as(deserialize_as = "DefaultOnNull")]
    #[serde(default)]
    completion_tokens: u64,
    #[serde_as(deserialize_as = "DefaultOnNull")]
    #[serde(default)]
    total_tokens: u64,
    #[serde(default)]
    cost: Option<f64>,
}

/// OpenAI-compatible chat completions through OpenRouter.
pub struct OpenRouterClient {
    api_key: String,
    client: reqwest::Client,
    base_url: String,
    models: Arc<ModelCatalog>,
}

impl OpenRouterClient {
    pub fn new(api_key: String, base_url: Option<String>, models: Arc<ModelCatalog>) -> Self {
        Self {
            api_key,
            client: reqwest::Client::new(),
            base_url: base_url.unwrap_or_else(|| DEFAULT_URL.to_string()),
            models,
        }
    }

    fn build_request(&self, request: &GenerationRequest, model_id: &str) -> serde_json::Value {
        serde_json::json!({
            "model": model_id,
            "messages": [
                {
                    "role": "user",
                    "content": request.prompt
                }
            ],
            "temperature": request.temperature,
            "max_tokens": request.max_tokens,
            "usage": {
                "include": true
            }
        })
    }
}

#[async_trait]
impl ProviderClient for OpenRouterClient {
    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationOutcome, ProviderError> {
        let model_id = self.models.resolve(&request.model).to_string();
        let body = self.build_request(request, &model_id);

        let response = self
            .client
            .post(&self.base_url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
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

        let parsed: ChatResponse = response.json().await.map_err(|e| ProviderError::Parse {
            provider: PROVIDER,
            message: e.to_string(),
        })?;

        let text = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message)
            .and_then(|message| message.content);
        let usage = parsed.usage.unwrap_or_default();

        Ok(GenerationOutcome::new(
            text,
            usage.prompt_tokens,
            usage.completion_tokens,
            usage.total_tokens,
            usage.cost,
            parsed.provider.unwrap_or_else(|| "Unknown".to_string()),
            parsed.model.unwrap_or(model_id),
        ))
    }
}
