use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::config::ModelCatalog;

/// Every tool this server knows how to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ToolKind {
    ServerInfo,
    AskAi,
    CodeReview,
    Brainstorm,
    ListModels,
    TokenUsage,
    CacheStats,
}

impl ToolKind {
    /// Tools offered when a provider credential is configured.
    pub const PROVIDER_TOOLS: [ToolKind; 6] = [
        ToolKind::AskAi,
        ToolKind::CodeReview,
        ToolKind::Brainstorm,
        ToolKind::ListModels,
        ToolKind::TokenUsage,
        ToolKind::CacheStats,
    ];

    /// Tools offered when it is not.
    pub const DIAGNOSTIC_TOOLS: [ToolKind; 1] = [ToolKind::ServerInfo];

    pub fn name(&self) -> &'static str {
        match self {
            ToolKind::ServerInfo => "server_info",
            ToolKind::AskAi => "ask_ai",
            ToolKind::CodeReview => "ai_code_review",
            ToolKind::Brainstorm => "ai_brainstorm",
            ToolKind::ListModels => "list_models",
            ToolKind::TokenUsage => "get_token_usage",
            ToolKind::CacheStats => "get_cache_stats",
        }
    }

    fn describe(&self, models: &ModelCatalog, provider: &str) -> ToolDescriptor {
        let model_param = json!({
            "type": "string",
            "description": format!("Model to use. Available: {}", models.aliases().join(", ")),
            "default": models.default_model
        });

        let (description, input_schema) = match self {
            ToolKind::ServerInfo => (
                "Get server status and configuration info".to_string(),
                json!({ "type": "object", "properties": {} }),
            ),
            ToolKind::AskAi => (
                format!("Ask any AI model through {provider} and get the response with token usage"),
                json!({
                    "type": "object",
                    "properties": {
                        "prompt": {
                            "type": "string",
                            "description": "The question or prompt for the AI"
                        },
                        "model": model_param,
                        "temperature": {
                            "type": "number",
                            "description": "Temperature for response (0.0-1.0)",
                            "default": 0.5
                        },
                        "max_tokens": {
                            "type": "integer",
                            "description": "Maximum tokens in response",
                            "default": 4096
                        }
                    },
                    "required": ["prompt"]
                }),
            ),
            ToolKind::CodeReview => (
                format!("Have any AI model review code through {provider}"),
                json!({
                    "type": "object",
                    "properties": {
                        "code": {
                            "type": "string",
                            "description": "The code to review"
                        },
                        "model": model_param,
                        "focus": {
                            "type": "string",
                            "description": "Specific focus area (security, performance, etc.)",
                            "default": "general"
                        }
                    },
                    "required": ["code"]
                }),
            ),
            ToolKind::Brainstorm => (
                format!("Brainstorm solutions with any AI model through {provider}"),
                json!({
                    "type": "object",
                    "properties": {
                        "topic": {
                            "type": "string",
                            "description": "The topic to brainstorm about"
                        },
                        "model": model_param,
                        "context": {
                            "type": "string",
                            "description": "Additional context",
                            "default": ""
                        }
                    },
                    "required": ["topic"]
                }),
            ),
            ToolKind::ListModels => (
                format!("List all available AI models through {provider}"),
                json!({ "type": "object", "properties": {} }),
            ),
            ToolKind::TokenUsage => (
                "Get current token usage and cost statistics".to_string(),
                json!({
                    "type": "object",
                    "properties": {
                        "detailed": {
                            "type": "boolean",
                            "description": "Show detailed request history",
                            "default": false
                        },
                        "period": {
                            "type": "string",
                            "description": "Time period: all, today, month, session, custom",
                            "default": "all"
                        },
                        "start_date": {
                            "type": "string",
                            "description": "Start of a custom period (YYYY-MM-DD or RFC 3339)"
                        },
                        "end_date": {
                            "type": "string",
                            "description": "End of a custom period, inclusive (YYYY-MM-DD or RFC 3339)"
                        }
                    }
                }),
            ),
            ToolKind::CacheStats => (
                "Get cache statistics including hit rate and savings".to_string(),
                json!({ "type": "object", "properties": {} }),
            ),
        };

        ToolDescriptor {
            name: self.name().to_string(),
            description,
            input_schema,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolContent {
    #[serde(rename = "type")]
    pub content_type: String,
    pub text: String,
}

/// What `tools/call` returns on success.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub content: Vec<ToolContent>,
}

impl ToolResult {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ToolContent {
                content_type: "text".to_string(),
                text: text.into(),
            }],
        }
    }

    /// Concatenated text of all content items.
    pub fn joined_text(&self) -> String {
        self.content.iter().map(|c| c.text.as_str()).collect()
    }
}

/// The fixed tool set for this process.
///
/// Built once at startup; [`ToolCatalog::resolve`] only accepts names that
/// [`ToolCatalog::list`] advertises.
#[derive(Debug, Clone)]
pub struct ToolCatalog {
    kinds: Vec<ToolKind>,
    descriptors: Vec<ToolDescriptor>,
}

impl ToolCatalog {
    pub fn new(provider_available: bool, models: &ModelCatalog, provider: &str) -> Self {
        let kinds: Vec<ToolKind> = if provider_available {
            ToolKind::PROVIDER_TOOLS.to_vec()
        } else {
            ToolKind::DIAGNOSTIC_TOOLS.to_vec()
        };
        let descriptors = kinds.iter().map(|kind| kind.describe(models, provider)).collect();

        Self { kinds, descriptors }
    }

    pub fn list(&self) -> &[ToolDescriptor] {
        &self.descriptors
    }

    pub fn resolve(&self, name: &str) -> Option<ToolKind> {
        self.kinds.iter().copied().find(|kind| kind.name() == name)
    }

    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }
}
