pub mod backend;
pub mod classifier;
pub mod config;
pub mod errors;
pub mod handlers;
pub mod health;
pub mod interaction_log;
pub mod metrics;
pub mod models;
pub mod registry;
pub mod service;
pub mod state;
pub mod stats;
pub mod streaming;
pub mod synthesizer;

use std::{sync::Arc, time::Duration};

use axum::{
    routing::{get, post},
    Router,
};
use backend::{
    bigram::CorpusLoader, local::LocalModelBackend, remote::RemoteModelBackend, stub::StubBackend,
    BackendKind, GenerationBackend,
};
use config::ServiceConfig;
use registry::BackendRegistry;
use tracing::info;

pub fn build_state(config: &ServiceConfig) -> Result<state::AppState, std::io::Error> {
    let stub = Arc::new(StubBackend::new(config.stub.clone()));
    let registry = BackendRegistry::new(stub);

    let registry = match config.backend {
        BackendKind::Stub => registry,
        BackendKind::LocalModel => {
            let loader = Arc::new(CorpusLoader::new(&config.local.model_path));
            let local = Arc::new(LocalModelBackend::new(loader, config.local.workers));
            let _ = local.start_loading();
            registry.with_selected(local)
        }
        BackendKind::RemoteModel => {
            let remote = Arc::new(
                RemoteModelBackend::new(config.remote.clone()).map_err(std::io::Error::other)?,
            );
            remote.clone().spawn_health_checks(Duration::from_secs(15));
            registry.with_selected(remote)
        }
    };

    let selected = registry.selected();
    info!(
        backend = %selected.name(),
        kind = %selected.kind(),
        log_path = %config.log_path.display(),
        "generation backend configured"
    );
    Ok(state::AppState::new(registry, config))
}

pub fn build_app(state: state::AppState) -> Router {
    Router::new()
        .route("/", get(handlers::root))
        .route("/health", get(handlers::health))
        .route("/metrics", get(handlers::metrics))
        .route("/generate", post(handlers::generate))
        .route("/logs/stats", get(handlers::log_stats))
        .route("/models/info", get(handlers::model_info))
        .route("/models/reload", post(handlers::reload_model))
        .with_state(state)
}
