use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use axum::{
    body::Body,
    extract::{DefaultBodyLimit, State},
    http::{Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::auth::entitlements::EntitlementStore;
use crate::auth::jwt::TokenService;
use crate::backplane::{Backplane, MemoryHub, PgBackplane};
use crate::config::{BackplaneKind, HeartbeatConfig, LiveConfig};
use crate::db::migrations::run_migrations;
use crate::db::pool::{create_pg_pool, PoolConfig};
use crate::error::{
    attach_request_id_header, request_id_from_headers_or_generate, with_request_id_scope,
    ErrorCode, LiveError,
};
use crate::persistence::{DocumentStore, MemoryStore, PostgresStore};
use crate::session::SessionRegistry;
use crate::{broadcast, sync};

pub const MAX_REQUEST_BODY_BYTES: usize = 1024 * 1024;

/// Shared by every route.
#[derive(Clone)]
pub struct AppState {
    pub registry: SessionRegistry,
    pub tokens: Arc<TokenService>,
    pub entitlements: EntitlementStore,
    pub broadcast_secret: Arc<str>,
    pub max_update_bytes: usize,
    pub heartbeat: HeartbeatConfig,
}

impl AppState {
    pub fn new(
        registry: SessionRegistry,
        tokens: TokenService,
        entitlements: EntitlementStore,
        broadcast_secret: impl Into<Arc<str>>,
        max_update_bytes: usize,
    ) -> Self {
        Self {
            registry,
            tokens: Arc::new(tokens),
            entitlements,
            broadcast_secret: broadcast_secret.into(),
            max_update_bytes,
            heartbeat: HeartbeatConfig::default(),
        }
    }

    pub fn with_heartbeat(mut self, heartbeat: HeartbeatConfig) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    /// Wire stores, entitlements and the backplane from configuration.
    pub async fn from_config(config: &LiveConfig) -> anyhow::Result<Self> {
        let tokens =
            TokenService::new(&config.jwt_secret).context("invalid QUIRE_LIVE_JWT_SECRET")?;
        if config.is_dev_jwt_secret() {
            warn!("QUIRE_LIVE_JWT_SECRET is not set, using the development secret");
        }
        if config.is_dev_broadcast_secret() {
            warn!("QUIRE_LIVE_BROADCAST_SECRET is not set, using the development secret");
        }

        let (store, entitlements, backplane) = match &config.database_url {
            Some(database_url) => {
                let pool = create_pg_pool(database_url, PoolConfig::from_env(config.db_allow_insecure))
                    .await
                    .context("failed to initialize PostgreSQL pool")?;
                run_migrations(&pool).await.context("failed to run database migrations")?;

                let backplane = match config.backplane {
                    BackplaneKind::Postgres => Backplane::Postgres(PgBackplane::start(pool.clone())),
                    BackplaneKind::Memory => Backplane::Memory(MemoryHub::new()),
                    BackplaneKind::None => Backplane::Disabled,
                };
                (
                    DocumentStore::Postgres(PostgresStore::new(pool.clone(), config.max_document_bytes)),
                    EntitlementStore::Postgres(pool),
                    backplane,
                )
            }
            None => {
                warn!("QUIRE_LIVE_DATABASE_URL is not set, documents are kept in memory and every caller may write");
                let backplane = match config.backplane {
                    BackplaneKind::Memory => Backplane::Memory(MemoryHub::new()),
                    BackplaneKind::Postgres => {
                        warn!("postgres backplane needs a database, running in single-process mode");
                        Backplane::Disabled
                    }
                    BackplaneKind::None => Backplane::Disabled,
                };
                (
                    DocumentStore::Memory(MemoryStore::with_limit(config.max_document_bytes)),
                    EntitlementStore::permissive(),
                    backplane,
                )
            }
        };

        info!(
            store = store.kind(),
            backplane = backplane.kind().as_str(),
            debounce_ms = config.session.debounce.as_millis() as u64,
            max_debounce_ms = config.session.max_debounce.as_millis() as u64,
            "live server configured"
        );

        let registry = SessionRegistry::new(store, backplane, config.session.clone());
        Ok(Self::new(
            registry,
            tokens,
            entitlements,
            config.broadcast_secret.as_str(),
            config.session.max_update_bytes,
        )
        .with_heartbeat(config.heartbeat))
    }
}

pub fn build_router(state: AppState) -> Router {
    apply_middleware(
        Router::new()
            .route("/healthz", get(healthz))
            .route("/readyz", get(readyz))
            .merge(sync::router())
            .merge(broadcast::router())
            .with_state(state),
    )
}

pub fn apply_middleware(router: Router) -> Router {
    router
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .layer(middleware::from_fn(request_context_middleware))
        .layer(middleware::from_fn(panic_handler))
}

/// Serve until `shutdown` resolves, then persist every dirty session.
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let registry = state.registry.clone();
    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("live server exited unexpectedly")?;

    let sessions = registry.session_count().await;
    let failures = registry.flush_all().await;
    if failures > 0 {
        error!(sessions, failures, "some documents could not be flushed on shutdown");
    } else {
        info!(sessions, "flushed open documents");
    }
    Ok(())
}

async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

async fn readyz(State(state): State<AppState>) -> Response {
    let store = state.registry.store();
    let backplane = state.registry.backplane();
    let backplane_connected = match backplane {
        Backplane::Postgres(listener) => listener.is_connected(),
        Backplane::Memory(_) | Backplane::Disabled => true,
    };

    if !store.is_ready().await {
        return LiveError::from_code(ErrorCode::StoreUnavailable).into_response();
    }

    // A lost backplane degrades to single-process mode; it does not make the
    // server unready.
    Json(json!({
        "status": "ready",
        "store": store.kind(),
        "backplane": backplane.kind().as_str(),
        "backplane_connected": backplane_connected,
        "sessions": state.registry.session_count().await,
    }))
    .into_response()
}

async fn panic_handler(request: Request<Body>, next: Next) -> Response {
    match tokio::spawn(async move { next.run(request).await }).await {
        Ok(response) => response,
        Err(join_error) => {
            error!(?join_error, "request handling panicked");
            LiveError::from_code(ErrorCode::InternalError).into_response()
        }
    }
}

async fn request_context_middleware(request: Request<Body>, next: Next) -> Response {
    let request_id = request_id_from_headers_or_generate(request.headers());
    let method = request.method().clone();
    let path = request.uri().path().to_owned();
    let started_at = Instant::now();

    let mut response = with_request_id_scope(request_id.clone(), next.run(request)).await;
    attach_request_id_header(&mut response, &request_id);

    info!(
        request_id = %request_id,
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        latency_ms = started_at.elapsed().as_millis() as u64,
        "request completed"
    );

    response
}
