//! Fedicore - the federation core of an ActivityPub social server
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      API Layer (Axum)                        │
//! │  - Actor, inbox and outbox endpoints                        │
//! │  - Object lookup, health, metrics                           │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Federation Layer                          │
//! │  - Inbox queue and processor                                │
//! │  - Resolver, instance registry, outbox emitter              │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Data Layer                              │
//! │  - SQLite (sqlx)                                            │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - `api`: HTTP handlers
//! - `federation`: ActivityPub federation handling
//! - `service`: Content handling for authenticated activities
//! - `data`: Database layer
//! - `config`: Configuration management
//! - `error`: Error types
//! - `metrics`: Prometheus instruments

pub mod api;
pub mod config;
pub mod data;
pub mod error;
pub mod federation;
pub mod metrics;
pub mod service;

use std::sync::Arc;

/// Largest inbox body accepted by the HTTP edge
const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Application state shared across all handlers
///
/// This struct is cloned for each request and contains
/// shared resources like the database pool and federation services.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<config::AppConfig>,

    /// Database connection pool
    pub db: Arc<data::Database>,

    /// HTTP client for resolve fetches
    pub http_client: reqwest::Client,

    /// Settings shared by every resolver
    pub resolver_config: Arc<federation::ResolverConfig>,

    /// Intake of signed deliveries
    pub inbox_queue: federation::InboxQueue,

    /// Per-host block state and telemetry
    pub instances: federation::InstanceRegistry,

    pub outbox: Arc<federation::OutboxEmitter>,

    pub lookup: Arc<federation::ObjectLookup>,
}

impl AppState {
    /// Initialize application state
    ///
    /// # Steps
    /// 1. Connect to SQLite database
    /// 2. Build the resolver HTTP client
    /// 3. Wire the inbox processor and start the queue workers
    /// 4. Build the outbox emitter and object lookup
    ///
    /// # Errors
    /// Returns error if any initialization step fails
    pub async fn new(config: config::AppConfig) -> Result<Self, error::AppError> {
        tracing::info!("Initializing application state...");

        // 1. Connect to SQLite database
        let db = Arc::new(data::Database::connect(&config.database.path).await?);
        tracing::info!("Database connected");

        // 2. Initialize HTTP client
        let resolver_config = Arc::new(federation::ResolverConfig::from_config(&config.federation));
        let http_client = resolver_config.build_client()?;
        if config.federation.allow_private_hosts {
            tracing::warn!("Resolver may fetch loopback and private addresses");
        }

        // 3. Inbox pipeline
        let base_url = config.server.base_url();
        let instances = federation::InstanceRegistry::new(db.clone());
        let content: Arc<dyn federation::ContentHandler> = Arc::new(
            service::NoteActivityHandler::new(db.clone(), base_url.clone()),
        );
        let processor = federation::InboxProcessor::new(
            Arc::new(federation::RemoteActorService::new(db.clone())),
            content.clone(),
            instances.clone(),
            http_client.clone(),
            resolver_config.clone(),
        );
        let inbox_queue = federation::InboxQueue::start(Arc::new(processor), &config.queue);

        // 4. Outbound surfaces
        let outbox = federation::OutboxEmitter::new(
            db.clone(),
            federation::OutboxContext {
                base_url: base_url.clone(),
            },
        );
        let lookup = federation::ObjectLookup::new(
            db.clone(),
            content,
            instances.clone(),
            http_client.clone(),
            resolver_config.clone(),
            base_url,
        );

        tracing::info!("Application state initialized successfully");

        Ok(Self {
            config: Arc::new(config),
            db,
            http_client,
            resolver_config,
            inbox_queue,
            instances,
            outbox: Arc::new(outbox),
            lookup: Arc::new(lookup),
        })
    }
}

/// Build the Axum router with all routes.
///
/// This is shared by the binary and integration tests to keep route
/// composition consistent across environments.
pub fn build_router(state: AppState) -> axum::Router {
    use axum::Router;
    use tower_http::{
        compression::CompressionLayer, limit::RequestBodyLimitLayer, trace::TraceLayer,
    };

    Router::new()
        .route("/health", axum::routing::get(health_check))
        .merge(api::activitypub_router())
        .nest("/api", api::lookup_router())
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
        .merge(api::metrics_router())
}

async fn health_check() -> &'static str {
    "OK"
}
