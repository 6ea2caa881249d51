use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use ai_bridge::clients::{ProviderClient, create_provider_client};
use ai_bridge::config::{ProviderKind, ServerConfig, load_model_catalog};
use ai_bridge::core::{ProviderAvailability, ServerContext, ToolDispatcher};
use ai_bridge::mcp::RequestLoop;
use ai_bridge::store::SqliteUsageStore;
use ai_bridge::usage::{Session, UsageLedger, UsageSink};

#[derive(Parser, Debug)]
#[command(name = "ai-bridge")]
#[command(version)]
#[command(about = "MCP server that forwards prompts to hosted AI models and tracks token spend", long_about = None)]
struct Args {
    #[arg(short, long, help = "Provider API key (defaults to the provider's environment variable)")]
    api_key: Option<String>,

    #[arg(short, long, env = "AI_PROVIDER", default_value = "openrouter")]
    provider: String,

    #[arg(short, long, help = "Override the provider endpoint")]
    base_url: Option<String>,

    #[arg(long, env = "DATABASE_URL", help = "SQLite usage database (sqlite://path)")]
    database_url: Option<String>,

    #[arg(long, env = "AI_BRIDGE_MODELS", help = "JSON file with the model table")]
    models: Option<PathBuf>,

    #[arg(long, env = "AI_BRIDGE_DEFAULT_MODEL")]
    default_model: Option<String>,
}

fn load_config(args: Args) -> Result<ServerConfig> {
    let provider: ProviderKind = args.provider.parse()?;
    let api_key = args
        .api_key
        .or_else(|| std::env::var(provider.api_key_var()).ok());

    let mut config = ServerConfig::new(provider, api_key)
        .with_base_url(args.base_url)
        .with_database_url(args.database_url);
    if let Some(path) = &args.models {
        let models = load_model_catalog(path)
            .with_context(|| format!("loading model table from {}", path.display()))?;
        config = config.with_models(models);
    }

    Ok(config.with_default_model(args.default_model)?)
}

fn open_store(database_url: Option<&str>, session: &Session) -> Option<Box<dyn UsageSink>> {
    let Some(url) = database_url else {
        info!("No DATABASE_URL configured. Usage tracking will be session-only");
        return None;
    };

    let store = SqliteUsageStore::from_url(url, session.id.clone())
        .and_then(|store| store.initialize().map(|()| store));
    match store {
        Ok(store) => {
            info!(path = %store.path().display(), "Usage store ready");
            Some(Box::new(store))
        }
        Err(e) => {
            warn!(error = %e, "Usage tracking will be session-only");
            None
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // stdout carries the protocol, so logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    let config = load_config(Args::parse())?;
    let session = Session::start();
    let models = Arc::new(config.models.clone());

    let (availability, client): (ProviderAvailability, Option<Box<dyn ProviderClient>>) =
        match config.api_key.clone() {
            Some(key) => (
                ProviderAvailability::Ready,
                Some(create_provider_client(
                    config.provider,
                    key,
                    config.base_url.clone(),
                    Arc::clone(&models),
                )),
            ),
            None => {
                let reason = format!(
                    "Please set your {} API key ({})",
                    config.provider.label(),
                    config.provider.api_key_var()
                );
                warn!("{reason}");
                (ProviderAvailability::Unavailable { reason }, None)
            }
        };

    let store = open_store(config.database_url.as_deref(), &session);
    let ledger = UsageLedger::new(store, &session);

    info!(
        provider = config.provider.label(),
        session = %session.id,
        default_model = %models.default_model,
        "Starting {}",
        ai_bridge::core::SERVER_NAME
    );

    let context = Arc::new(ServerContext::new(
        session,
        config.provider,
        availability,
        models,
    ));
    let dispatcher = ToolDispatcher::new(Arc::clone(&context), client, ledger);
    let mut server = RequestLoop::new(context, dispatcher);

    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    server.run(stdin, tokio::io::stdout()).await?;

    info!("Input closed, shutting down");
    Ok(())
}
