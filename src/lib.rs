pub mod appresult;
pub mod broker;
pub mod config;
pub mod db;
pub mod profiles;
pub mod rooms;
pub mod session;
pub mod store;

use std::sync::Arc;

use axum::{
    extract::FromRef,
    http::{header, Method},
    routing::get,
    Json, Router,
};
use serde_json::{json, Value};
use sqlx::SqlitePool;
use tokio::sync::watch;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

pub use appresult::{AppError, AppResult};
pub use broker::Broker;
pub use config::Config;

#[derive(Clone, FromRef)]
pub struct AppState {
    pub db_pool: SqlitePool,
    pub broker: Arc<dyn Broker>,
    pub config: Arc<Config>,
    pub shutdown: ShutdownSignal,
}

/// Resolves once the server starts shutting down. If the trigger is dropped
/// without firing, it never resolves.
#[derive(Clone)]
pub struct ShutdownSignal(watch::Receiver<bool>);

impl ShutdownSignal {
    pub fn channel() -> (watch::Sender<bool>, Self) {
        let (tx, rx) = watch::channel(false);
        (tx, Self(rx))
    }

    pub async fn wait(&mut self) {
        loop {
            if *self.0.borrow_and_update() {
                return;
            }
            if self.0.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Routes without session or HTTP layers, for composing.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .nest("/chat", rooms::router())
}

pub fn app(state: AppState) -> anyhow::Result<Router> {
    let cors = match state.config.cors_origin_header()? {
        Some(origin) => CorsLayer::new()
            .allow_origin(origin)
            .allow_methods([Method::GET, Method::POST])
            .allow_headers([header::CONTENT_TYPE])
            .allow_credentials(true),
        None => CorsLayer::new(),
    };

    Ok(routes()
        .layer(session::layer(state.config.session_idle_minutes))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state))
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
