//! services/api/src/bin/api.rs

use api_lib::{
    adapters::{JsonFileCache, OpenAiStoryGenerator, SqliteDocumentStore},
    config::Config,
    error::ApiError,
    web::{rest, spawn_history_sweeper, ApiDoc, AppState},
};
use async_openai::{config::OpenAIConfig, Client};
use axum::{
    extract::DefaultBodyLimit,
    http::{
        header::{ACCEPT, CONTENT_TYPE},
        HeaderValue, Method,
    },
    routing::{delete, get, post, put},
    Router,
};
use bedtales_core::library::{LibraryOptions, StoryLibrary};
use bedtales_core::ports::SystemClock;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[tokio::main]
async fn main() -> Result<(), ApiError> {
    // --- 1. Load Configuration & Set Up Logging ---
    let config = Arc::new(Config::from_env()?);
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(config.log_level.to_string()))
        .with(tracing_subscriber::fmt::layer())
        .init();
    info!("Configuration loaded. Starting server...");

    // --- 2. Storage ---
    // The database opens and migrates on first use, during `init` below.
    let store = Arc::new(SqliteDocumentStore::new(config.database_url.clone()));
    let cache = Arc::new(JsonFileCache::open(config.usage_cache_path.clone()));

    // --- 3. Initialize Service Adapters ---
    let openai_client =
        Client::with_config(OpenAIConfig::new().with_api_key(config.openai_api_key.clone()));
    let generator = Arc::new(OpenAiStoryGenerator::new(openai_client, &config));

    // --- 4. Load the Library ---
    let library = Arc::new(StoryLibrary::new(
        store,
        cache,
        generator,
        Arc::new(SystemClock),
        LibraryOptions {
            limits: config.daily_limits,
            illustration_delay: config.illustration_delay,
        },
    ));
    library.init().await?;

    let shutdown = CancellationToken::new();
    let sweeper = spawn_history_sweeper(
        library.clone(),
        config.history_sweep_interval,
        shutdown.clone(),
    );

    let app_state = Arc::new(AppState {
        library,
        config: config.clone(),
    });

    // --- 5. Create the Web Router ---
    let origin = config.cors_origin.parse::<HeaderValue>().map_err(|e| {
        ApiError::Internal(format!("Invalid CORS origin '{}': {}", config.cors_origin, e))
    })?;
    let cors = CorsLayer::new()
        .allow_origin(origin)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::OPTIONS])
        .allow_headers([CONTENT_TYPE, ACCEPT]);

    let api_router = Router::new()
        .route(
            "/stories",
            get(rest::list_stories_handler)
                .post(rest::save_story_handler)
                .delete(rest::clear_stories_handler),
        )
        .route("/stories/delete", post(rest::delete_stories_handler))
        .route("/stories/import", post(rest::import_stories_handler))
        .route("/stories/import-code", post(rest::import_code_handler))
        .route("/stories/{id}", delete(rest::delete_story_handler))
        .route("/stories/{id}/favorite", post(rest::toggle_favorite_handler))
        .route("/stories/{id}/narration", post(rest::narrate_story_handler))
        .route("/stories/{id}/share", get(rest::share_story_handler))
        .route(
            "/history",
            get(rest::list_history_handler)
                .post(rest::read_story_handler)
                .delete(rest::clear_history_handler),
        )
        .route("/history/{id}", delete(rest::delete_history_item_handler))
        .route(
            "/characters",
            get(rest::list_characters_handler)
                .post(rest::create_character_handler)
                .delete(rest::clear_characters_handler),
        )
        .route("/characters/{id}", delete(rest::delete_character_handler))
        .route("/settings", get(rest::get_settings_handler))
        .route("/settings/{key}", put(rest::put_setting_handler))
        .route("/usage", get(rest::usage_handler))
        .route("/generate/ideas", post(rest::generate_ideas_handler))
        .route("/generate/story", post(rest::generate_story_handler))
        .route("/generate/voice-prompt", post(rest::voice_prompt_handler))
        .route("/backup", get(rest::export_backup_handler))
        .route("/backup/restore", post(rest::restore_backup_handler))
        // Backups carry every illustration inline.
        .layer(DefaultBodyLimit::max(64 * 1024 * 1024))
        .layer(cors)
        .with_state(app_state);

    // Merge the API router with the Swagger UI router for a complete application.
    let app = Router::new()
        .merge(api_router)
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()));

    // --- 6. Start the Server ---
    info!("Starting server on {}", config.bind_address);
    info!(
        "Swagger UI available at http://{}/swagger-ui",
        config.bind_address
    );
    let listener = tokio::net::TcpListener::bind(&config.bind_address).await?;
    let server_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Shutdown signal received.");
            server_shutdown.cancel();
        })
        .await?;

    shutdown.cancel();
    if let Err(e) = sweeper.await {
        tracing::warn!("History sweeper ended abnormally: {}", e);
    }
    Ok(())
}
