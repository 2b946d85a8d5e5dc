use std::{sync::Arc, time::Instant};

use tracing::{info, warn};

use crate::{
    backend::{BackendError, BackendKind, GenerationBackend},
    classifier::{classify, Category},
    interaction_log::{InteractionLogger, InteractionRecord},
    metrics::AppMetrics,
    models::{GenerationRequest, GenerationResult},
    registry::BackendRegistry,
    streaming::{error_kind, StreamCoordinator, StreamHandle},
};

/// Request-handling core: backend selection, timing, and interaction logging.
#[derive(Clone)]
pub struct GenerationService {
    registry: BackendRegistry,
    logger: Arc<InteractionLogger>,
    metrics: Arc<AppMetrics>,
    coordinator: StreamCoordinator,
}

impl GenerationService {
    pub fn new(
        registry: BackendRegistry,
        logger: Arc<InteractionLogger>,
        metrics: Arc<AppMetrics>,
    ) -> Self {
        let coordinator = StreamCoordinator::new(logger.clone(), metrics.clone());
        Self {
            registry,
            logger,
            metrics,
            coordinator,
        }
    }

    pub fn logger(&self) -> &Arc<InteractionLogger> {
        &self.logger
    }

    pub async fn generate(&self, request: GenerationRequest) -> Result<GenerationResult, BackendError> {
        let started = Instant::now();
        let backend = self.registry.resolve(request.backend)?;
        let category = category_for(backend.as_ref(), &request);

        match backend.generate(&request).await {
            Ok(output) => {
                let elapsed_ms = started.elapsed().as_millis() as u64;
                if let Some(tokens) = output.tokens_generated {
                    self.metrics.observe_tokens(backend.kind().as_str(), tokens);
                }
                info!(
                    request_id = %request.request_id,
                    backend = %backend.name(),
                    elapsed_ms,
                    "generation completed"
                );

                let record = InteractionRecord::new(
                    request.prompt.clone(),
                    output.text.clone(),
                    elapsed_ms,
                    backend.name(),
                    false,
                )
                .with_category(category)
                .with_tokens(output.tokens_generated)
                .with_resource_usage();
                self.logger.append_best_effort(record, &self.metrics).await;

                Ok(GenerationResult {
                    response: output.text,
                    model: backend.name().to_owned(),
                    response_time_ms: elapsed_ms,
                    tokens_generated: output.tokens_generated,
                    truncated: false,
                })
            }
            Err(error) => {
                self.record_failure(backend.as_ref(), &request, category, started, &error, "generate")
                    .await;
                Err(error)
            }
        }
    }

    pub async fn generate_stream(&self, request: GenerationRequest) -> Result<StreamHandle, BackendError> {
        let started = Instant::now();
        let backend = self.registry.resolve(request.backend)?;
        let category = category_for(backend.as_ref(), &request);
        let failure_context = request.clone();

        match self
            .coordinator
            .start(backend.clone(), request, category)
            .await
        {
            Ok(handle) => Ok(handle),
            Err(error) => {
                self.record_failure(
                    backend.as_ref(),
                    &failure_context,
                    category,
                    started,
                    &error,
                    "stream_start",
                )
                .await;
                Err(error)
            }
        }
    }

    async fn record_failure(
        &self,
        backend: &dyn GenerationBackend,
        request: &GenerationRequest,
        category: Option<Category>,
        started: Instant,
        error: &BackendError,
        stage: &str,
    ) {
        let elapsed_ms = started.elapsed().as_millis() as u64;
        self.metrics.observe_backend_error(stage, error_kind(error));
        warn!(
            request_id = %request.request_id,
            backend = %backend.name(),
            error = %error,
            stage,
            "generation failed"
        );

        let record = InteractionRecord::new(
            request.prompt.clone(),
            String::new(),
            elapsed_ms,
            backend.name(),
            request.stream,
        )
        .with_category(category)
        .with_error(error.to_string())
        .with_resource_usage();
        self.logger.append_best_effort(record, &self.metrics).await;
    }
}

fn category_for(backend: &dyn GenerationBackend, request: &GenerationRequest) -> Option<Category> {
    (backend.kind() == BackendKind::Stub).then(|| classify(&request.prompt))
}
