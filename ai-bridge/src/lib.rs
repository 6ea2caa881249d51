pub mod clients;
pub mod config;
pub mod core;
pub mod mcp;
pub mod memory;
pub mod pricing;
pub mod prompts;
pub mod store;
pub mod tools;
pub mod usage;

pub use clients::{
    GeminiClient, GenerationOutcome, GenerationRequest, OpenRouterClient, ProviderClient,
    ProviderError, create_provider_client,
};
pub use config::{ConfigError, ModelCatalog, ProviderKind, ServerConfig, load_model_catalog};
pub use core::{DispatchError, ProviderAvailability, ServerContext, ToolDispatcher};
pub use mcp::{JsonRpcRequest, JsonRpcResponse, LoopState, MCPError, RequestLoop};
pub use memory::UsageMemory;
pub use pricing::{CostBreakdown, ModelPricing};
pub use store::SqliteUsageStore;
pub use tools::{ToolCatalog, ToolDescriptor, ToolKind, ToolResult};
pub use usage::{
    Session, StoreError, UsageAggregate, UsageLedger, UsagePeriod, UsageRecord,
    UsageRecordInput, UsageSink, UsageSource,
};
