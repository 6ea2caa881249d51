use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

use crate::pricing::ModelPricing;

/// Sentinel left in install scripts when no key was supplied.
pub const PLACEHOLDER_API_KEY: &str = "YOUR_API_KEY_HERE";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Unknown provider: {0}")]
    UnknownProvider(String),
    #[error("Failed to read model table: {0}")]
    Io(String),
    #[error("Invalid model table: {0}")]
    Parse(String),
    #[error("Default model '{0}' is not in the model table")]
    UnknownDefault(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    OpenRouter,
    Gemini,
}

impl ProviderKind {
    pub fn label(&self) -> &'static str {
        match self {
            ProviderKind::OpenRouter => "OpenRouter",
            ProviderKind::Gemini => "Gemini",
        }
    }

    /// Environment variable holding this provider's credential.
    pub fn api_key_var(&self) -> &'static str {
        match self {
            ProviderKind::OpenRouter => "OPENROUTER_API_KEY",
            ProviderKind::Gemini => "GEMINI_API_KEY",
        }
    }
}

impl FromStr for ProviderKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "openrouter" => Ok(ProviderKind::OpenRouter),
            "gemini" | "google" => Ok(ProviderKind::Gemini),
            _ => Err(ConfigError::UnknownProvider(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelEntry {
    pub id: String,
    #[serde(default)]
    pub pricing: ModelPricing,
}

/// Alias table exposed to callers, with per-model pricing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelCatalog {
    pub default_model: String,
    pub models: BTreeMap<String, ModelEntry>,
}

impl ModelCatalog {
    pub fn for_provider(kind: ProviderKind) -> Self {
        let mut models = BTreeMap::new();
        match kind {
            ProviderKind::OpenRouter => {
                models.insert(
                    "gemini-pro".to_string(),
                    ModelEntry {
                        id: "google/gemini-2.5-pro-preview".to_string(),
                        pricing: ModelPricing::tiered(1.25, 2.50, 10.0, 15.0),
                    },
                );
                Self {
                    default_model: "gemini-pro".to_string(),
                    models,
                }
            }
            ProviderKind::Gemini => {
                models.insert(
                    "gemini-flash".to_string(),
                    ModelEntry {
                        id: "gemini-2.0-flash".to_string(),
                        pricing: ModelPricing::flat(0.10, 0.40),
                    },
                );
                models.insert(
                    "gemini-pro".to_string(),
                    ModelEntry {
                        id: "gemini-2.5-pro".to_string(),
                        pricing: ModelPricing::tiered(1.25, 2.50, 10.0, 15.0),
                    },
                );
                Self {
                    default_model: "gemini-flash".to_string(),
                    models,
                }
            }
        }
    }

    /// Unknown aliases pass through untouched; the provider decides if they are valid.
    pub fn resolve<'a>(&'a self, alias: &'a str) -> &'a str {
        self.models
            .get(alias)
            .map(|entry| entry.id.as_str())
            .unwrap_or(alias)
    }

    /// Looks up by alias first, then by provider id.
    pub fn pricing(&self, model: &str) -> Option<&ModelPricing> {
        self.models.get(model).map(|entry| &entry.pricing).or_else(|| {
            self.models
                .values()
                .find(|entry| entry.id == model)
                .map(|entry| &entry.pricing)
        })
    }

    pub fn aliases(&self) -> Vec<&str> {
        self.models.keys().map(String::as_str).collect()
    }

    fn validate(self) -> Result<Self, ConfigError> {
        if !self.models.contains_key(&self.default_model) {
            return Err(ConfigError::UnknownDefault(self.default_model));
        }
        Ok(self)
    }
}

pub fn load_model_catalog(path: &Path) -> Result<ModelCatalog, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
    let catalog: ModelCatalog =
        serde_json::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;
    catalog.validate()
}

/// Everything the server reads from its environment, resolved once at startup.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub provider: ProviderKind,
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub database_url: Option<String>,
    pub models: ModelCatalog,
}

impl ServerConfig {
    pub fn new(provider: ProviderKind, api_key: Option<String>) -> Self {
        Self {
            provider,
            api_key: usable_api_key(api_key),
            base_url: None,
            database_url: None,
            models: ModelCatalog::for_provider(provider),
        }
    }

    pub fn with_base_url(mut self, base_url: Option<String>) -> Self {
        self.base_url = base_url;
        self
    }

    pub fn with_database_url(mut self, database_url: Option<String>) -> Self {
        self.database_url = database_url.filter(|url| !url.trim().is_empty());
        self
    }

    pub fn with_models(mut self, models: ModelCatalog) -> Self {
        self.models = models;
        self
    }

    pub fn with_default_model(mut self, alias: Option<String>) -> Result<Self, ConfigError> {
        if let Some(alias) = alias {
            self.models.default_model = alias;
            self.models = self.models.validate()?;
        }
        Ok(self)
    }
}

fn usable_api_key(key: Option<String>) -> Option<String> {
    key.map(|k| k.trim().to_string())
        .filter(|k| !k.is_empty() && k != PLACEHOLDER_API_KEY)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::io::Write;

    #[rstest]
    #[case("openrouter", ProviderKind::OpenRouter)]
    #[case("OpenRouter", ProviderKind::OpenRouter)]
    #[case("gemini", ProviderKind::Gemini)]
    #[case("google", ProviderKind::Gemini)]
    fn test_provider_kind_from_str(#[case] input: &str, #[case] expected: ProviderKind) {
        assert_eq!(input.parse::<ProviderKind>().unwrap(), expected);
    }

    #[test]
    fn test_unknown_provider_rejected() {
        assert!(matches!(
            "anthropic".parse::<ProviderKind>(),
            Err(ConfigError::UnknownProvider(_))
        ));
    }

    #[rstest]
    #[case(None)]
    #[case(Some(""))]
    #[case(Some("   "))]
    #[case(Some(PLACEHOLDER_API_KEY))]
    fn test_unusable_keys_mean_no_credential(#[case] key: Option<&str>) {
        let config = ServerConfig::new(ProviderKind::OpenRouter, key.map(str::to_string));
        assert!(config.api_key.is_none());
    }

    #[test]
    fn test_resolve_known_and_unknown_alias() {
        let catalog = ModelCatalog::for_provider(ProviderKind::OpenRouter);
        assert_eq!(catalog.resolve("gemini-pro"), "google/gemini-2.5-pro-preview");
        assert_eq!(catalog.resolve("openai/gpt-4o"), "openai/gpt-4o");
    }

    #[test]
    fn test_pricing_lookup_by_alias_or_id() {
        let catalog = ModelCatalog::for_provider(ProviderKind::OpenRouter);
        assert!(catalog.pricing("gemini-pro").is_some());
        assert!(catalog.pricing("google/gemini-2.5-pro-preview").is_some());
        assert!(catalog.pricing("nope").is_none());
    }

    #[test]
    fn test_load_model_catalog_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "default_model": "fast",
                "models": {{
                    "fast": {{ "id": "vendor/fast-1" }},
                    "big": {{
                        "id": "vendor/big-2",
                        "pricing": {{ "input_rate": 2.0, "input_rate_high": 4.0,
                                      "output_rate": 8.0, "output_rate_high": 12.0,
                                      "threshold": 100000 }}
                    }}
                }}
            }}"#
        )
        .unwrap();

        let catalog = load_model_catalog(file.path()).unwrap();
        assert_eq!(catalog.default_model, "fast");
        assert_eq!(catalog.resolve("big"), "vendor/big-2");
        assert_eq!(catalog.pricing("big").unwrap().threshold, 100_000);
        assert_eq!(catalog.pricing("fast").unwrap(), &ModelPricing::default());
    }

    #[test]
    fn test_load_model_catalog_rejects_missing_default() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "default_model": "x", "models": {{}} }}"#).unwrap();
        assert!(matches!(
            load_model_catalog(file.path()),
            Err(ConfigError::UnknownDefault(_))
        ));
    }

    #[test]
    fn test_with_default_model_validates() {
        let config = ServerConfig::new(ProviderKind::Gemini, Some("k".into()));
        assert!(config.clone().with_default_model(Some("gemini-pro".into())).is_ok());
        assert!(config.with_default_model(Some("missing".into())).is_err());
    }
}
