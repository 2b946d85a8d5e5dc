use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use tokio::{
    sync::{OwnedSemaphorePermit, Semaphore},
    time::{sleep, timeout},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    backend::{
        BackendDescriptor, BackendError, BackendKind, BackendOutput, BackendState, BackendStatus,
        ChunkStream, GenerationBackend,
    },
    config::RemoteModelConfig,
    models::{rough_token_estimate, GenerationRequest},
};

/// Proxies generation to an Ollama-compatible model server. One attempt per
/// call; failures are classified, never retried.
pub struct RemoteModelBackend {
    client: reqwest::Client,
    base_url: String,
    model: String,
    name: String,
    state: BackendState,
    connections: Arc<Semaphore>,
    read_timeout: Duration,
}

impl RemoteModelBackend {
    pub fn new(config: RemoteModelConfig) -> Result<Self, String> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .pool_max_idle_per_host(config.max_connections)
            .build()
            .map_err(|error| format!("failed to build remote model HTTP client: {error}"))?;
        let name = format!("minivault-remote:{}", config.model);

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_owned(),
            model: config.model,
            state: BackendState::new(name.clone(), BackendKind::RemoteModel),
            name,
            connections: Arc::new(Semaphore::new(config.max_connections.max(1))),
            read_timeout: config.read_timeout,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// Periodic endpoint check. Settles an initial load and moves Ready to
    /// Error when the endpoint stops answering. An Error status is left for
    /// `reload` to clear.
    pub async fn probe(&self) -> Result<(), BackendError> {
        match self.state.status() {
            BackendStatus::Unloaded => {
                self.state.begin_loading();
            }
            BackendStatus::Error => {
                debug!(backend = %self.name, "remote model in error, awaiting reload");
                return Err(BackendError::Unavailable(format!(
                    "remote model failed: {}",
                    self.state.descriptor().message.unwrap_or_default()
                )));
            }
            BackendStatus::Loading | BackendStatus::Ready => {}
        }
        self.settle().await
    }

    async fn settle(&self) -> Result<(), BackendError> {
        let result = self.check_endpoint().await;
        match &result {
            Ok(()) => {
                if self.state.mark_ready() {
                    info!(backend = %self.name, "remote model endpoint ready");
                }
            }
            Err(error) => {
                self.state.mark_failed(error.to_string());
                warn!(backend = %self.name, error = %error, "remote model probe failed");
            }
        }
        result
    }

    async fn check_endpoint(&self) -> Result<(), BackendError> {
        let response = self
            .client
            .get(self.url("/api/tags"))
            .timeout(self.read_timeout)
            .send()
            .await
            .map_err(classify_transport)?;
        if !response.status().is_success() {
            return Err(rejected(response.status(), response.text().await.unwrap_or_default()));
        }
        Ok(())
    }

    pub fn spawn_health_checks(self: Arc<Self>, interval: Duration) {
        tokio::spawn(async move {
            loop {
                let _ = self.probe().await;
                sleep(interval).await;
            }
        });
    }

    async fn acquire_connection(&self) -> Result<OwnedSemaphorePermit, BackendError> {
        self.connections
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| BackendError::Unavailable("remote connection pool closed".to_owned()))
    }

    fn payload(&self, request: &GenerationRequest, stream: bool) -> serde_json::Value {
        json!({
            "model": self.model,
            "prompt": request.prompt,
            "stream": stream,
            "options": {
                "num_predict": request.max_tokens_or_default(),
                "temperature": request.temperature_or_default(),
            }
        })
    }

    fn note_failure(&self, error: &BackendError) {
        if matches!(error, BackendError::Unavailable(_)) {
            self.state.mark_failed(error.to_string());
        }
    }
}

#[async_trait]
impl GenerationBackend for RemoteModelBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> BackendKind {
        BackendKind::RemoteModel
    }

    fn descriptor(&self) -> BackendDescriptor {
        self.state.descriptor()
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<BackendOutput, BackendError> {
        let _permit = self.acquire_connection().await?;
        let result = async {
            let response = self
                .client
                .post(self.url("/api/generate"))
                .timeout(self.read_timeout)
                .json(&self.payload(request, false))
                .send()
                .await
                .map_err(classify_transport)?;

            if !response.status().is_success() {
                return Err(rejected(
                    response.status(),
                    response
                        .text()
                        .await
                        .unwrap_or_else(|_| "unknown backend error".to_owned()),
                ));
            }

            let parsed: OllamaGenerateResponse =
                response.json().await.map_err(classify_body)?;
            let tokens_generated = parsed
                .eval_count
                .or_else(|| Some(rough_token_estimate(&parsed.response)));
            Ok(BackendOutput {
                text: parsed.response,
                tokens_generated,
            })
        }
        .await;

        if let Err(error) = &result {
            self.note_failure(error);
        }
        result
    }

    async fn generate_stream(
        &self,
        request: &GenerationRequest,
        cancel: CancellationToken,
    ) -> Result<ChunkStream, BackendError> {
        let permit = self.acquire_connection().await?;
        let read_timeout = self.read_timeout;

        let sent = timeout(
            read_timeout,
            self.client
                .post(self.url("/api/generate"))
                .json(&self.payload(request, true))
                .send(),
        )
        .await;
        let response = match sent {
            Ok(Ok(response)) => response,
            Ok(Err(error)) => {
                let error = classify_transport(error);
                self.note_failure(&error);
                return Err(error);
            }
            Err(_) => {
                return Err(BackendError::Timeout(format!(
                    "no response within {}ms",
                    read_timeout.as_millis()
                )))
            }
        };

        if !response.status().is_success() {
            return Err(rejected(
                response.status(),
                response
                    .text()
                    .await
                    .unwrap_or_else(|_| "unknown backend error".to_owned()),
            ));
        }

        let mut upstream = response.bytes_stream();
        let mut buffer: Vec<u8> = Vec::new();

        let stream = async_stream::stream! {
            // Held until the stream is dropped, which also closes the connection.
            let _permit = permit;

            loop {
                let next = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return,
                    next = timeout(read_timeout, upstream.next()) => next,
                };

                let bytes = match next {
                    Ok(Some(Ok(bytes))) => bytes,
                    Ok(Some(Err(error))) => {
                        yield Err(classify_transport(error));
                        break;
                    }
                    Ok(None) => break,
                    Err(_) => {
                        yield Err(BackendError::Timeout(format!(
                            "no chunk within {}ms",
                            read_timeout.as_millis()
                        )));
                        break;
                    }
                };

                buffer.extend_from_slice(&bytes);

                let mut finished = false;
                while let Some(index) = buffer.iter().position(|byte| *byte == b'\n') {
                    let line = buffer.drain(..=index).collect::<Vec<u8>>();
                    let line = line.trim_ascii();
                    if line.is_empty() {
                        continue;
                    }
                    match serde_json::from_slice::<OllamaStreamLine>(line) {
                        Ok(parsed) => {
                            if let Some(error) = parsed.error {
                                yield Err(BackendError::Failed(error));
                                finished = true;
                                break;
                            }
                            if !parsed.response.is_empty() {
                                yield Ok(parsed.response);
                            }
                            if parsed.done {
                                finished = true;
                                break;
                            }
                        }
                        Err(error) => {
                            yield Err(BackendError::InvalidResponse(error.to_string()));
                            finished = true;
                            break;
                        }
                    }
                }
                if finished {
                    return;
                }
            }

            if let Ok(parsed) = serde_json::from_slice::<OllamaStreamLine>(buffer.trim_ascii()) {
                if !parsed.response.is_empty() {
                    yield Ok(parsed.response);
                }
            }
        };

        debug!(backend = %self.name, "stream prepared");
        Ok(stream.boxed())
    }

    async fn reload(&self) -> Result<(), BackendError> {
        if !self.state.begin_reload() {
            return Err(BackendError::Unavailable(
                "remote probe already in progress".to_owned(),
            ));
        }
        self.settle().await
    }
}

fn classify_transport(error: reqwest::Error) -> BackendError {
    if error.is_timeout() {
        BackendError::Timeout(error.to_string())
    } else if error.is_connect() {
        BackendError::Unavailable(error.to_string())
    } else {
        BackendError::Failed(error.to_string())
    }
}

fn classify_body(error: reqwest::Error) -> BackendError {
    if error.is_timeout() {
        BackendError::Timeout(error.to_string())
    } else {
        BackendError::InvalidResponse(error.to_string())
    }
}

fn rejected(status: StatusCode, body: String) -> BackendError {
    BackendError::Rejected {
        status: status.as_u16(),
        body: body.chars().take(400).collect(),
    }
}

#[derive(Debug, Deserialize)]
struct OllamaGenerateResponse {
    #[serde(default)]
    response: String,
    #[serde(default)]
    eval_count: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct OllamaStreamLine {
    #[serde(default)]
    response: String,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}
