//! Castfed - ActivityPub federation endpoint for a self-hosted
//! broadcasting server
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      API Layer (Axum)                        │
//! │  - ActivityPub endpoints (actor, inbox, outbox)             │
//! │  - Metrics endpoint                                         │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Federation Layer                           │
//! │  - Inbound activity dispatch                                │
//! │  - Outbound broadcasts (go-live, messages, profile)         │
//! │  - Actor resolution + signed delivery                       │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Data Layer                              │
//! │  - SQLite (sqlx): followers, outbox log, actor identity     │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - `api`: HTTP handlers for ActivityPub and metrics
//! - `federation`: activity dispatch, broadcasts, signatures
//! - `data`: database layer
//! - `chat`: notification sink for social events
//! - `config`: configuration management
//! - `error`: error types

pub mod api;
pub mod chat;
pub mod config;
pub mod data;
pub mod error;
pub mod federation;
pub mod metrics;

use std::sync::Arc;

use chat::ChatSink;
use data::models::LocalActor;
use federation::{ActorResolver, InboxDispatcher, OutboxDistributor, SignedDelivery};

/// Application state shared across all handlers
///
/// Cloned per request; everything inside is cheap to clone.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<config::AppConfig>,

    /// Database connection pool
    pub db: Arc<data::Database>,

    /// Local actor identity (account name + RSA keypair)
    pub local_actor: Arc<LocalActor>,

    /// Remote actor resolution
    pub resolver: ActorResolver,

    /// Inbound activity dispatch
    pub dispatcher: InboxDispatcher,

    /// Outbound broadcasts
    pub distributor: OutboxDistributor,

    /// HTTP client for federation
    pub http_client: reqwest::Client,
}

impl AppState {
    /// Initialize application state
    ///
    /// # Steps
    /// 1. Connect to SQLite database
    /// 2. Ensure the local actor identity exists (generates a keypair once)
    /// 3. Wire up the federation services
    ///
    /// # Errors
    /// Returns error if any initialization step fails
    pub async fn new(
        config: config::AppConfig,
        chat: Arc<dyn ChatSink>,
    ) -> Result<Self, error::AppError> {
        tracing::info!("Initializing application state...");

        let db = Arc::new(data::Database::connect(&config.database.path).await?);
        tracing::info!("Database connected");

        let local_actor = Arc::new(Self::ensure_local_actor(&db, &config).await?);

        let http_client = reqwest::Client::builder()
            .user_agent(concat!("Castfed/", env!("CARGO_PKG_VERSION")))
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| error::AppError::Internal(e.into()))?;

        let base_url = config.server.base_url();
        let actor_iri = config.federation.actor_iri(&base_url);

        let resolver = ActorResolver::new(http_client.clone());
        let delivery = SignedDelivery::new(
            http_client.clone(),
            actor_iri,
            local_actor.private_key_pem.clone(),
        );
        let dispatcher = InboxDispatcher::new(
            db.clone(),
            resolver.clone(),
            delivery.clone(),
            chat.clone(),
        );
        let distributor = OutboxDistributor::new(
            db.clone(),
            delivery,
            config.federation.clone(),
            base_url,
            local_actor.public_key_pem.clone(),
        );

        if let Ok(count) = db.count_followers().await {
            metrics::FOLLOWERS_TOTAL.set(count);
        }

        tracing::info!("Application state initialized successfully");

        Ok(Self {
            config: Arc::new(config),
            db,
            local_actor,
            resolver,
            dispatcher,
            distributor,
            http_client,
        })
    }

    /// Ensure the local actor identity exists.
    ///
    /// Generates an RSA keypair on first start; every later start reuses
    /// the stored identity so remote servers keep trusting our signatures.
    async fn ensure_local_actor(
        db: &data::Database,
        config: &config::AppConfig,
    ) -> Result<LocalActor, error::AppError> {
        use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};
        use rsa::{RsaPrivateKey, RsaPublicKey};

        if let Some(actor) = db.get_local_actor().await? {
            if actor.account != config.federation.account {
                tracing::warn!(
                    stored = %actor.account,
                    configured = %config.federation.account,
                    "Configured account name differs from stored identity; keeping stored keys"
                );
            }
            tracing::info!(account = %actor.account, "Local actor identity loaded");
            return Ok(actor);
        }

        tracing::info!("Generating local actor keypair...");

        let mut rng = rand::thread_rng();
        let private_key = RsaPrivateKey::new(&mut rng, 4096)
            .map_err(|e| error::AppError::Internal(e.into()))?;
        let public_key = RsaPublicKey::from(&private_key);

        let actor = LocalActor {
            id: data::EntityId::new().0,
            account: config.federation.account.clone(),
            private_key_pem: private_key
                .to_pkcs8_pem(LineEnding::LF)
                .map_err(|e| error::AppError::Internal(e.into()))?
                .to_string(),
            public_key_pem: public_key
                .to_public_key_pem(LineEnding::LF)
                .map_err(|e| error::AppError::Internal(e.into()))?,
            created_at: chrono::Utc::now(),
        };

        db.insert_local_actor_if_empty(&actor).await?;

        // A concurrent initializer may have won the insert; reread to make
        // sure everyone signs with the same key.
        let stored = db
            .get_local_actor()
            .await?
            .ok_or_else(|| error::AppError::Internal(anyhow::anyhow!("actor bootstrap lost")))?;

        tracing::info!(account = %stored.account, "Local actor identity created");
        Ok(stored)
    }
}

/// Build the Axum router with all routes.
///
/// Shared by the binary and integration tests to keep route composition
/// consistent across environments.
pub fn build_router(state: AppState) -> axum::Router {
    use axum::Router;
    use tower_http::trace::TraceLayer;

    let cors_layer = build_cors_layer(&state.config.server);

    Router::new()
        .route("/health", axum::routing::get(health_check))
        .merge(api::activitypub_router())
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer)
        .with_state(state)
        .merge(api::metrics_router())
}

fn build_cors_layer(server: &config::ServerConfig) -> tower_http::cors::CorsLayer {
    use axum::http::HeaderValue;
    use tower_http::cors::{Any, CorsLayer};

    if !server.protocol.eq_ignore_ascii_case("https") {
        return CorsLayer::permissive();
    }

    let allowed_origin = server.base_url();
    match HeaderValue::from_str(&allowed_origin) {
        Ok(origin) => CorsLayer::new()
            .allow_origin([origin])
            .allow_methods(Any)
            .allow_headers(Any),
        Err(error) => {
            tracing::error!(
                %error,
                origin = %allowed_origin,
                "Failed to parse CORS origin from server base URL; denying cross-origin requests"
            );
            CorsLayer::new().allow_methods(Any).allow_headers(Any)
        }
    }
}

async fn health_check() -> &'static str {
    "OK"
}
