use std::sync::Arc;

use axum::Router;
use axum::http::HeaderValue;
use axum::routing::{get, post};
use chrono::{DateTime, Utc};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::error::{InferError, Result};
use crate::session::GenerationCoordinator;

use super::handlers;

/// State shared across all routes.
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<GenerationCoordinator>,
    pub started_at: DateTime<Utc>,
}

pub fn build(coordinator: Arc<GenerationCoordinator>, config: &Config) -> Result<Router> {
    let state = AppState {
        coordinator,
        started_at: Utc::now(),
    };

    let mut router = Router::new()
        .route("/generate", post(handlers::generate))
        .route("/stop/{conversation_id}", post(handlers::stop))
        .route("/health", get(handlers::health))
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    if let Some(cors) = cors_layer(&config.server.allowed_origins)? {
        router = router.layer(cors);
    }

    Ok(router)
}

fn cors_layer(origins: &[String]) -> Result<Option<CorsLayer>> {
    if origins.is_empty() {
        return Ok(None);
    }

    let origins = origins
        .iter()
        .map(|o| {
            o.parse::<HeaderValue>()
                .map_err(|e| InferError::Config(format!("invalid CORS origin {o:?}: {e}")))
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(Some(
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any),
    ))
}
