use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::{
    backend::{BackendDescriptor, BackendKind},
    interaction_log::InteractionLogger,
    registry::BackendRegistry,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub timestamp: DateTime<Utc>,
    pub api_version: &'static str,
    pub backend: BackendDescriptor,
    pub backend_ready: bool,
    pub fallback_available: bool,
    pub logs_directory_writable: bool,
}

/// Combines backend readiness with log-directory writability. A non-stub
/// backend that is not ready only degrades health: the stub stays selectable.
pub async fn check_health(registry: &BackendRegistry, logger: &InteractionLogger) -> HealthReport {
    let backend = registry.selected();
    let backend_ready = backend.is_ready();
    let fallback_available = registry.stub().is_ready();
    let logs_directory_writable = logger.directory_writable().await;

    let status = if backend_ready && logs_directory_writable {
        HealthStatus::Healthy
    } else {
        HealthStatus::Degraded
    };

    HealthReport {
        status,
        timestamp: Utc::now(),
        api_version: env!("CARGO_PKG_VERSION"),
        backend: backend.descriptor(),
        backend_ready,
        fallback_available: fallback_available && backend.kind() != BackendKind::Stub,
        logs_directory_writable,
    }
}
