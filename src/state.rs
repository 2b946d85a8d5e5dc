use std::{sync::Arc, time::Duration};

use crate::{
    backend::stub::StubBackend,
    config::{PromptLimits, ServiceConfig},
    interaction_log::InteractionLogger,
    metrics::AppMetrics,
    registry::BackendRegistry,
    service::GenerationService,
    stats::StatsAggregator,
};

#[derive(Clone)]
pub struct AppState {
    pub service: GenerationService,
    pub registry: BackendRegistry,
    pub logger: Arc<InteractionLogger>,
    pub stats: StatsAggregator,
    pub metrics: Arc<AppMetrics>,
    pub prompt_limits: PromptLimits,
    pub stats_window: Duration,
}

impl AppState {
    pub fn new(registry: BackendRegistry, config: &ServiceConfig) -> Self {
        Self::assemble(
            registry,
            Arc::new(InteractionLogger::new(&config.log_path)),
            config.prompt_limits.clone(),
            config.stats_window,
        )
    }

    pub fn new_for_tests(log_path: impl Into<std::path::PathBuf>) -> Self {
        Self::new_for_tests_with_token_delay(log_path, Duration::ZERO)
    }

    /// Seeded stub whose stream pauses `token_delay` between chunks.
    pub fn new_for_tests_with_token_delay(
        log_path: impl Into<std::path::PathBuf>,
        token_delay: Duration,
    ) -> Self {
        let stub = Arc::new(StubBackend::new(crate::config::StubConfig {
            seed: Some(7),
            token_delay,
        }));
        Self::assemble(
            BackendRegistry::new(stub),
            Arc::new(InteractionLogger::new(log_path)),
            PromptLimits::default(),
            Duration::from_secs(24 * 3_600),
        )
    }

    fn assemble(
        registry: BackendRegistry,
        logger: Arc<InteractionLogger>,
        prompt_limits: PromptLimits,
        stats_window: Duration,
    ) -> Self {
        let metrics = Arc::new(AppMetrics::new());
        let service = GenerationService::new(registry.clone(), logger.clone(), metrics.clone());
        Self {
            service,
            registry,
            stats: StatsAggregator::new(logger.path()),
            logger,
            metrics,
            prompt_limits,
            stats_window,
        }
    }
}
