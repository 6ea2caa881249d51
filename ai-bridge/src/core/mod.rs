use chrono::Local;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use serde_with::{DefaultOnNull, serde_as};
use std::fmt::Write as _;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

use crate::clients::{GenerationOutcome, GenerationRequest, ProviderClient};
use crate::config::{ModelCatalog, ProviderKind};
use crate::pricing::reconcile_cost;
use crate::prompts::{build_brainstorm_prompt, build_code_review_prompt};
use crate::tools::{ToolCatalog, ToolKind, ToolResult};
use crate::usage::{UsageAggregate, UsageLedger, UsagePeriod, UsageRecordInput, UsageSource, Session};

pub const SERVER_NAME: &str = "ai-bridge-mcp";
pub const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

const DEFAULT_TEMPERATURE: f64 = 0.5;
const DEFAULT_MAX_TOKENS: u32 = 4096;
const REVIEW_TEMPERATURE: f64 = 0.2;
const REVIEW_MAX_TOKENS: u32 = 8192;
const BRAINSTORM_TEMPERATURE: f64 = 0.7;
const BRAINSTORM_MAX_TOKENS: u32 = 4096;
const HISTORY_LIMIT: usize = 10;

const CACHE_STATS_TEXT: &str = "📊 Cache Statistics:\n\nCache feature is not yet implemented.\nThis will track repeated prompts to save on API costs.";

#[derive(Debug, Clone, PartialEq)]
pub enum ProviderAvailability {
    Ready,
    Unavailable { reason: String },
}

/// Process-wide state, fixed at startup.
#[derive(Debug, Clone)]
pub struct ServerContext {
    pub session: Session,
    pub provider: ProviderKind,
    pub availability: ProviderAvailability,
    pub models: Arc<ModelCatalog>,
}

impl ServerContext {
    pub fn new(
        session: Session,
        provider: ProviderKind,
        availability: ProviderAvailability,
        models: Arc<ModelCatalog>,
    ) -> Self {
        Self {
            session,
            provider,
            availability,
            models,
        }
    }

    pub fn provider_available(&self) -> bool {
        self.availability == ProviderAvailability::Ready
    }
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Unknown tool: {0}")]
    UnknownTool(String),
    #[error("Invalid arguments for {tool}: {message}")]
    InvalidArguments { tool: &'static str, message: String },
}

#[derive(Debug, Deserialize)]
struct AskArgs {
    prompt: String,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    temperature: Option<f64>,
    #[serde(default)]
    max_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ReviewArgs {
    code: String,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    focus: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BrainstormArgs {
    topic: String,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    context: Option<String>,
}

#[serde_as]
#[derive(Debug, Deserialize)]
struct UsageArgs {
    #[serde_as(deserialize_as = "DefaultOnNull")]
    #[serde(default)]
    detailed: bool,
    #[serde(default)]
    period: Option<String>,
    #[serde(default)]
    start_date: Option<String>,
    #[serde(default)]
    end_date: Option<String>,
}

/// Runs one tool invocation to completion.
pub struct ToolDispatcher {
    context: Arc<ServerContext>,
    catalog: ToolCatalog,
    client: Option<Box<dyn ProviderClient>>,
    ledger: UsageLedger,
}

impl ToolDispatcher {
    pub fn new(
        context: Arc<ServerContext>,
        client: Option<Box<dyn ProviderClient>>,
        ledger: UsageLedger,
    ) -> Self {
        let catalog = ToolCatalog::new(
            context.provider_available() && client.is_some(),
            &context.models,
            context.provider.label(),
        );
        Self {
            context,
            catalog,
            client,
            ledger,
        }
    }

    pub fn catalog(&self) -> &ToolCatalog {
        &self.catalog
    }

    pub fn ledger(&self) -> &UsageLedger {
        &self.ledger
    }

    pub async fn invoke(&mut self, name: &str, arguments: &Value) -> Result<ToolResult, DispatchError> {
        let kind = self
            .catalog
            .resolve(name)
            .ok_or_else(|| DispatchError::UnknownTool(name.to_string()))?;
        debug!(tool = name, "Dispatching tool call");

        let text = match kind {
            ToolKind::ServerInfo => self.server_info(),
            ToolKind::AskAi => {
                let args: AskArgs = parse_args(kind, arguments)?;
                let temperature = args.temperature.unwrap_or(DEFAULT_TEMPERATURE);
                let max_tokens = args.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS);
                if !(0.0..=1.0).contains(&temperature) {
                    return Err(invalid(kind, "temperature must be between 0.0 and 1.0"));
                }
                if max_tokens == 0 {
                    return Err(invalid(kind, "max_tokens must be greater than 0"));
                }
                self.generate(kind, args.prompt, args.model, temperature, max_tokens)
                    .await?
            }
            ToolKind::CodeReview => {
                let args: ReviewArgs = parse_args(kind, arguments)?;
                let focus = args.focus.as_deref().unwrap_or("general");
                let prompt = build_code_review_prompt(&args.code, focus);
                self.generate(kind, prompt, args.model, REVIEW_TEMPERATURE, REVIEW_MAX_TOKENS)
                    .await?
            }
            ToolKind::Brainstorm => {
                let args: BrainstormArgs = parse_args(kind, arguments)?;
                let prompt = build_brainstorm_prompt(&args.topic, args.context.as_deref());
                self.generate(
                    kind,
                    prompt,
                    args.model,
                    BRAINSTORM_TEMPERATURE,
                    BRAINSTORM_MAX_TOKENS,
                )
                .await?
            }
            ToolKind::ListModels => self.list_models(),
            ToolKind::TokenUsage => {
                let args: UsageArgs = parse_args(kind, arguments)?;
                self.token_usage(&args)?
            }
            ToolKind::CacheStats => CACHE_STATS_TEXT.to_string(),
        };

        Ok(ToolResult::text(text))
    }

    async fn generate(
        &mut self,
        kind: ToolKind,
        prompt: String,
        model: Option<String>,
        temperature: f64,
        max_tokens: u32,
    ) -> Result<String, DispatchError> {
        // The catalog hides provider tools when there is no client.
        let Some(client) = self.client.as_ref() else {
            return Err(DispatchError::UnknownTool(kind.name().to_string()));
        };

        let model = model
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| self.context.models.default_model.clone());
        let request = GenerationRequest {
            prompt,
            model,
            temperature,
            max_tokens,
        };

        let result = client.generate(&request).await;
        let title = match kind {
            ToolKind::CodeReview => "CODE REVIEW",
            ToolKind::Brainstorm => "BRAINSTORM",
            _ => "RESPONSE",
        };

        Ok(match result {
            Ok(outcome) => {
                let cost = self.record_usage(kind, &request.model, &outcome);
                info!(
                    tool = kind.name(),
                    model = %request.model,
                    prompt_tokens = outcome.prompt_tokens,
                    completion_tokens = outcome.completion_tokens,
                    "Provider call completed"
                );
                format!(
                    "🤖 {} ({}) {}:\n\n{}{}",
                    request.model.to_uppercase(),
                    outcome.provider_label,
                    title,
                    outcome.text,
                    usage_block(&outcome, cost)
                )
            }
            // Provider failures go back to the caller as content.
            Err(e) => {
                info!(tool = kind.name(), error = %e, "Provider call failed");
                format!("🤖 {} {}:\n\n{}", request.model.to_uppercase(), title, e)
            }
        })
    }

    /// Records one successful call and returns the reconciled cost.
    fn record_usage(&mut self, kind: ToolKind, model: &str, outcome: &GenerationOutcome) -> f64 {
        let pricing = self
            .context
            .models
            .pricing(model)
            .or_else(|| self.context.models.pricing(&outcome.resolved_model_id))
            .cloned()
            .unwrap_or_default();
        let estimate = pricing.cost(outcome.prompt_tokens, outcome.completion_tokens);

        self.ledger.record(&UsageRecordInput {
            model: model.to_string(),
            prompt_tokens: outcome.prompt_tokens,
            completion_tokens: outcome.completion_tokens,
            cost: outcome.cost,
            pricing,
            request_type: kind.name().to_string(),
        });

        reconcile_cost(outcome.cost, &estimate)
    }

    fn server_info(&self) -> String {
        match &self.context.availability {
            ProviderAvailability::Ready => format!(
                "Server v{} - {} connected and ready!\nAvailable models: {}",
                SERVER_VERSION,
                self.context.provider.label(),
                self.context.models.aliases().join(", ")
            ),
            ProviderAvailability::Unavailable { reason } => {
                format!("Server v{} - {}", SERVER_VERSION, reason)
            }
        }
    }

    fn list_models(&self) -> String {
        let models = &self.context.models;
        let mut text = format!(
            "📋 Available AI Models through {}:\n\n",
            self.context.provider.label()
        );
        for (alias, entry) in &models.models {
            let _ = writeln!(text, "- {}: {}", alias, entry.id);
        }
        let _ = write!(text, "\nDefault model: {}", models.default_model);
        text
    }

    fn token_usage(&self, args: &UsageArgs) -> Result<String, DispatchError> {
        let period = UsagePeriod::parse(
            args.period.as_deref().unwrap_or("all"),
            args.start_date.as_deref(),
            args.end_date.as_deref(),
        )
        .map_err(|e| invalid(ToolKind::TokenUsage, e.to_string()))?;

        let report = self.ledger.aggregate(&period, args.detailed);
        let mut text = match &report.source {
            UsageSource::Durable => format!("📊 Token Usage Statistics ({}):\n\n", period.label()),
            UsageSource::Fallback { reason } => format!(
                "⚠️ Error getting usage data: {}\n\nFalling back to session data:\n\n",
                reason
            ),
        };
        write_totals(&mut text, &report.aggregate);

        if args.detailed && !report.aggregate.requests.is_empty() {
            text.push_str("\n\n📝 Request History:\n");
            for (i, record) in report.aggregate.requests.iter().take(HISTORY_LIMIT).enumerate() {
                let _ = write!(
                    text,
                    "\n{}. Model: {}\n   Tokens: {} (P:{}, C:{})\n   Cost: ${:.4}\n   Time: {}\n",
                    i + 1,
                    record.model,
                    record.total_tokens,
                    record.prompt_tokens,
                    record.completion_tokens,
                    record.total_cost,
                    record.created_at.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S")
                );
            }
        }

        Ok(text)
    }
}

fn parse_args<T: DeserializeOwned>(kind: ToolKind, arguments: &Value) -> Result<T, DispatchError> {
    let arguments = if arguments.is_null() {
        Value::Object(serde_json::Map::new())
    } else {
        arguments.clone()
    };
    serde_json::from_value(arguments).map_err(|e| invalid(kind, e.to_string()))
}

fn invalid(kind: ToolKind, message: impl Into<String>) -> DispatchError {
    DispatchError::InvalidArguments {
        tool: kind.name(),
        message: message.into(),
    }
}

fn usage_block(outcome: &GenerationOutcome, cost: f64) -> String {
    format!(
        "\n\n📊 Token Usage:\n- Prompt tokens: {}\n- Completion tokens: {}\n- Total tokens: {}\n- Estimated cost: ${:.6}",
        outcome.prompt_tokens, outcome.completion_tokens, outcome.total_tokens, cost
    )
}

fn write_totals(text: &mut String, aggregate: &UsageAggregate) {
    let _ = writeln!(
        text,
        "Total Prompt Tokens: {}",
        group_thousands(aggregate.total_prompt_tokens)
    );
    let _ = writeln!(
        text,
        "Total Completion Tokens: {}",
        group_thousands(aggregate.total_completion_tokens)
    );
    let _ = writeln!(text, "Total Tokens: {}", group_thousands(aggregate.total_tokens));
    let _ = writeln!(text, "Total Estimated Cost: ${:.4}", aggregate.total_cost);
    let _ = writeln!(text, "Total Requests: {}", aggregate.total_requests);
}

fn group_thousands(value: u64) -> String {
    let digits = value.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}
