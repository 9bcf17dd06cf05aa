//! Main Entrypoint for the Mentor API Service
//!
//! This binary is responsible for:
//! 1. Loading configuration from the environment.
//! 2. Initializing the session store (in-memory or Postgres + migrations).
//! 3. Initializing the language generator and answer classifier.
//! 4. Constructing the Axum router and applying middleware.
//! 5. Starting the web server and handling graceful shutdown.

use anyhow::Context;
use async_openai::config::OpenAIConfig;
use mentor_api::{
    config::{Config, Provider, StoreBackend},
    router::create_router,
    state::AppState,
    store::{MemoryStore, PgStore, SessionStore},
};
use mentor_core::classify::{AnswerClassifier, KeywordClassifier};
use mentor_core::generate::{LanguageGenerator, OfflineGenerator, OpenAiGenerator};
use sqlx::PgPool;
use std::{net::SocketAddr, sync::Arc};
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

/// Listens for the `Ctrl+C` signal to gracefully shut down the server.
async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install Ctrl+C handler");
    info!("Received shutdown signal. Shutting down gracefully...");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // --- 1. Load Configuration ---
    let config = Config::from_env().context("Failed to load configuration")?;

    // --- 2. Initialize Logging ---
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .init();
    info!("Configuration loaded. Initializing application state...");

    // --- 3. Initialize Session Store ---
    let store: Arc<dyn SessionStore> = match config.store_backend {
        StoreBackend::Postgres => {
            let database_url = config
                .database_url
                .as_ref()
                .context("DATABASE_URL missing for postgres backend")?;
            let pool = PgPool::connect(database_url)
                .await
                .context("Failed to connect to database")?;
            let store = PgStore::new(pool);
            store.run_migrations().await?;
            info!("Database connection established and migrations are up-to-date.");
            Arc::new(store)
        }
        StoreBackend::Memory => {
            info!("Using in-memory session store.");
            Arc::new(MemoryStore::default())
        }
    };

    // --- 4. Initialize Shared Services ---
    let generator: Arc<dyn LanguageGenerator> = match &config.provider {
        Provider::OpenAI => {
            info!("Using OpenAI provider.");
            let api_key = config
                .openai_api_key
                .as_ref()
                .context("OPENAI_API_KEY missing for openai provider")?;
            let openai_config = OpenAIConfig::new()
                .with_api_key(api_key)
                .with_api_base("https://api.openai.com/v1/");
            Arc::new(OpenAiGenerator::new(openai_config, config.chat_model.clone()))
        }
        Provider::Gemini => {
            info!("Using Gemini provider.");
            let api_key = config
                .gemini_api_key
                .as_ref()
                .context("GEMINI_API_KEY missing for gemini provider")?;
            let openai_config = OpenAIConfig::new()
                .with_api_key(api_key)
                .with_api_base("https://generativelanguage.googleapis.com/v1beta/openai");
            Arc::new(OpenAiGenerator::new(openai_config, config.chat_model.clone()))
        }
        Provider::Offline => {
            info!("Using offline deterministic generator.");
            Arc::new(OfflineGenerator)
        }
    };
    let classifier: Arc<dyn AnswerClassifier> = Arc::new(KeywordClassifier::default());

    let app_state = Arc::new(AppState::new(
        store,
        generator,
        classifier,
        Arc::new(config.clone()),
    ));

    // --- 5. Build Router with CORS ---
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = create_router(app_state).layer(cors);

    // --- 6. Start Server ---
    info!(
        provider = ?config.provider,
        model = %config.chat_model,
        bind_address = %config.bind_address,
        "Service configured. Starting server..."
    );
    let listener = tokio::net::TcpListener::bind(config.bind_address).await?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("Server has shut down.");
    Ok(())
}
