use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, fmt};

mod correlator;
mod dispatcher;
mod engine;
mod error;
mod kb_router;
mod media;
mod orchestrator;
mod server;
mod session;
mod settings;
mod store;
mod tools;

use crate::correlator::EventCorrelator;
use crate::dispatcher::{HttpCallControl, HttpSearchClient, HttpSmsSender, ToolDispatcher};
use crate::engine::ChatCompletionsEngine;
use crate::kb_router::KnowledgeBaseRouter;
use crate::media::HttpSpeechPipeline;
use crate::orchestrator::CallOrchestrator;
use crate::settings::Settings;
use crate::store::{SessionStore, SqliteSessionStore};

#[derive(Debug, Parser)]
#[command(name = "switchboard")]
#[command(about = "Telephony-to-AI call switchboard", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    Start {
        /// Overrides the configured listen address.
        #[arg(long)]
        listen: Option<String>,
        /// Path to a JSON settings file.
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Start { listen, config } => {
            let mut settings = Settings::load(config.as_deref())?;
            if let Some(listen) = listen {
                settings.listen = listen;
            }
            let addr: SocketAddr = settings.listen.parse()?;
            let state = build_state(&settings).await?;
            server::serve(addr, state).await?;
        }
    }
    Ok(())
}

async fn build_state(settings: &Settings) -> anyhow::Result<server::AppState> {
    let store = SqliteSessionStore::initialize(
        settings.database_url.clone(),
        settings.store_retry.clone(),
    )
    .await?;
    let store: Arc<dyn SessionStore> = Arc::new(store);
    let correlator = Arc::new(EventCorrelator::new(
        store.clone(),
        settings.correlation_window(),
    ));
    let router = Arc::new(KnowledgeBaseRouter::new(settings.routes.clone()));

    let http = reqwest::Client::builder()
        .timeout(settings.collaborator_timeout())
        .build()?;
    let dispatcher = Arc::new(ToolDispatcher::new(
        store.clone(),
        router.clone(),
        Arc::new(HttpSmsSender::new(
            http.clone(),
            settings.collaborators.sms_url.clone(),
            settings.collaborators.sms_from_number.clone(),
        )),
        Arc::new(HttpSearchClient::new(
            http.clone(),
            settings.collaborators.search_url.clone(),
        )),
        Arc::new(HttpCallControl::new(
            http.clone(),
            settings.collaborators.call_control_url.clone(),
        )),
        settings.default_knowledge_base.clone(),
    ));

    let engine = Arc::new(ChatCompletionsEngine::new(
        http.clone(),
        settings.engine.base_url.clone(),
        std::env::var("SWITCHBOARD_ENGINE_API_KEY").ok(),
        settings.engine.model.clone(),
    ));
    let speech = Arc::new(HttpSpeechPipeline::new(
        http,
        settings.collaborators.speech_url.clone(),
    ));

    let orchestrator = Arc::new(CallOrchestrator::new(
        store.clone(),
        correlator.clone(),
        dispatcher,
        engine,
        speech,
        router,
        settings.engine_turn_timeout(),
    ));

    Ok(server::AppState {
        store,
        correlator,
        orchestrator,
    })
}
