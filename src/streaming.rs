use std::{sync::Arc, time::Instant};

use futures_util::StreamExt;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    backend::{BackendError, ChunkStream, GenerationBackend},
    classifier::Category,
    interaction_log::{InteractionLogger, InteractionRecord},
    metrics::AppMetrics,
    models::{rough_token_estimate, GenerationRequest, GenerationResult},
};

/// Caller side of a streaming generation.
///
/// Chunks arrive in production order through a one-slot channel. Dropping the
/// handle (or its receiver) counts as a client disconnect and cancels the
/// generation.
///
/// Production runs at most three chunks ahead of a slow caller: one queued in
/// this handle, one held by the coordinator awaiting that slot, and one in the
/// backend's own one-slot channel. Backends check cancellation before producing
/// each chunk, so nothing new is produced once the caller cancels.
pub struct StreamHandle {
    chunks: mpsc::Receiver<Result<String, BackendError>>,
    cancel: CancellationToken,
    outcome: oneshot::Receiver<StreamOutcome>,
}

#[derive(Debug, Clone)]
pub struct StreamOutcome {
    pub result: GenerationResult,
    pub chunks: u64,
    pub error: Option<String>,
}

impl StreamHandle {
    pub async fn next_chunk(&mut self) -> Option<Result<String, BackendError>> {
        self.chunks.recv().await
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Waits for the coordinator to stop and log. Any chunks still queued are discarded.
    pub async fn finish(self) -> Option<StreamOutcome> {
        let Self {
            chunks, outcome, ..
        } = self;
        drop(chunks);
        outcome.await.ok()
    }

    pub fn into_parts(
        self,
    ) -> (
        mpsc::Receiver<Result<String, BackendError>>,
        CancellationToken,
        oneshot::Receiver<StreamOutcome>,
    ) {
        (self.chunks, self.cancel, self.outcome)
    }
}

#[derive(Clone)]
pub struct StreamCoordinator {
    logger: Arc<InteractionLogger>,
    metrics: Arc<AppMetrics>,
}

impl StreamCoordinator {
    pub fn new(logger: Arc<InteractionLogger>, metrics: Arc<AppMetrics>) -> Self {
        Self { logger, metrics }
    }

    /// Opens the backend stream and spawns the pump that forwards its chunks.
    /// Start-up failures are returned to the caller, not logged here.
    pub async fn start(
        &self,
        backend: Arc<dyn GenerationBackend>,
        request: GenerationRequest,
        category: Option<Category>,
    ) -> Result<StreamHandle, BackendError> {
        let started = Instant::now();
        let cancel = CancellationToken::new();
        let upstream = backend.generate_stream(&request, cancel.clone()).await?;
        let (tx, rx) = mpsc::channel(1);
        let (outcome_tx, outcome_rx) = oneshot::channel();

        let pump = Pump {
            backend_name: backend.name().to_owned(),
            backend_kind: backend.kind().as_str(),
            request,
            category,
            started,
            logger: self.logger.clone(),
            metrics: self.metrics.clone(),
        };
        tokio::spawn(pump.run(upstream, tx, cancel.clone(), outcome_tx));

        Ok(StreamHandle {
            chunks: rx,
            cancel,
            outcome: outcome_rx,
        })
    }
}

struct Pump {
    backend_name: String,
    backend_kind: &'static str,
    request: GenerationRequest,
    category: Option<Category>,
    started: Instant,
    logger: Arc<InteractionLogger>,
    metrics: Arc<AppMetrics>,
}

impl Pump {
    async fn run(
        self,
        mut upstream: ChunkStream,
        tx: mpsc::Sender<Result<String, BackendError>>,
        cancel: CancellationToken,
        outcome_tx: oneshot::Sender<StreamOutcome>,
    ) {
        let mut buffer = String::new();
        let mut chunks = 0u64;
        let mut truncated = false;
        let mut error: Option<String> = None;

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    truncated = true;
                    break;
                }
                _ = tx.closed() => {
                    cancel.cancel();
                    truncated = true;
                    break;
                }
                next = upstream.next() => next,
            };

            match next {
                Some(Ok(chunk)) => {
                    if chunk.is_empty() {
                        continue;
                    }
                    let delivered = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => false,
                        sent = tx.send(Ok(chunk.clone())) => sent.is_ok(),
                    };
                    if !delivered {
                        cancel.cancel();
                        truncated = true;
                        break;
                    }
                    buffer.push_str(&chunk);
                    chunks += 1;
                    self.metrics.observe_stream_chunk();
                }
                Some(Err(backend_error)) => {
                    warn!(
                        request_id = %self.request.request_id,
                        backend = %self.backend_name,
                        error = %backend_error,
                        "backend stream failed"
                    );
                    self.metrics
                        .observe_backend_error("stream_read", error_kind(&backend_error));
                    error = Some(backend_error.to_string());
                    let _ = tx.send(Err(backend_error)).await;
                    break;
                }
                None => break,
            }
        }

        // Dropping the upstream stops the producer and closes any outbound connection.
        drop(upstream);
        drop(tx);

        let elapsed_ms = self.started.elapsed().as_millis() as u64;
        let tokens = rough_token_estimate(&buffer);
        if truncated {
            self.metrics.observe_stream_cancelled();
            info!(
                request_id = %self.request.request_id,
                backend = %self.backend_name,
                chunks,
                "stream cancelled"
            );
        } else {
            debug!(
                request_id = %self.request.request_id,
                backend = %self.backend_name,
                chunks,
                elapsed_ms,
                "stream finished"
            );
        }
        self.metrics.observe_tokens(self.backend_kind, tokens);

        let mut record = InteractionRecord::new(
            self.request.prompt.clone(),
            buffer.clone(),
            elapsed_ms,
            self.backend_name.clone(),
            true,
        )
        .truncated(truncated)
        .with_category(self.category)
        .with_tokens(Some(tokens))
        .with_resource_usage();
        if let Some(message) = &error {
            record = record.with_error(message.clone());
        }
        self.logger.append_best_effort(record, &self.metrics).await;

        let _ = outcome_tx.send(StreamOutcome {
            result: GenerationResult {
                response: buffer,
                model: self.backend_name,
                response_time_ms: elapsed_ms,
                tokens_generated: Some(tokens),
                truncated,
            },
            chunks,
            error,
        });
    }
}

pub fn error_kind(error: &BackendError) -> &'static str {
    match error {
        BackendError::Unavailable(_) => "unavailable",
        BackendError::Timeout(_) => "timeout",
        BackendError::Rejected { .. } | BackendError::InvalidResponse(_) | BackendError::Failed(_) => {
            "backend_error"
        }
    }
}
