use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::{
    sync::{mpsc, OwnedSemaphorePermit, Semaphore},
    task::{self, JoinHandle},
};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    backend::{
        BackendDescriptor, BackendError, BackendKind, BackendOutput, BackendState, BackendStatus,
        ChunkStream, GenerationBackend,
    },
    models::GenerationRequest,
};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplingParams {
    pub max_tokens: u32,
    pub temperature: f32,
    pub seed: Option<u64>,
}

/// In-process generation engine. Sessions are driven one token at a time on a
/// blocking worker thread.
pub trait LanguageModel: Send + Sync {
    fn model_name(&self) -> &str;
    fn start_session(self: Arc<Self>, prompt: &str, params: SamplingParams) -> Box<dyn TokenSession>;
}

pub trait TokenSession: Send {
    /// `Ok(None)` ends the generation.
    fn next_token(&mut self) -> Result<Option<String>, String>;
}

pub trait ModelLoader: Send + Sync {
    fn describe(&self) -> String;
    fn load(&self) -> Result<Arc<dyn LanguageModel>, String>;
}

type ModelSlot = Arc<RwLock<Option<Arc<dyn LanguageModel>>>>;

pub struct LocalModelBackend {
    name: String,
    loader: Arc<dyn ModelLoader>,
    state: Arc<BackendState>,
    model: ModelSlot,
    workers: Arc<Semaphore>,
    seed: Option<u64>,
}

impl LocalModelBackend {
    pub fn new(loader: Arc<dyn ModelLoader>, workers: usize) -> Self {
        let name = format!("minivault-local:{}", loader.describe());
        Self {
            state: Arc::new(BackendState::new(name.clone(), BackendKind::LocalModel)),
            name,
            loader,
            model: Arc::new(RwLock::new(None)),
            workers: Arc::new(Semaphore::new(workers.max(1))),
            seed: None,
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Starts the background load once. Returns `None` if a load already ran.
    pub fn start_loading(&self) -> Option<JoinHandle<()>> {
        if !self.state.begin_loading() {
            return None;
        }
        Some(self.spawn_load())
    }

    fn spawn_load(&self) -> JoinHandle<()> {
        let loader = self.loader.clone();
        let state = self.state.clone();
        let slot = self.model.clone();
        let name = self.name.clone();

        tokio::spawn(async move {
            info!(backend = %name, "loading local model");
            match task::spawn_blocking(move || loader.load()).await {
                Ok(Ok(model)) => {
                    let model_name = model.model_name().to_owned();
                    *slot.write().unwrap_or_else(PoisonError::into_inner) = Some(model);
                    state.mark_ready();
                    info!(backend = %name, model = %model_name, "local model ready");
                }
                Ok(Err(message)) => {
                    warn!(backend = %name, error = %message, "local model load failed");
                    state.mark_failed(message);
                }
                Err(error) => {
                    warn!(backend = %name, error = %error, "local model loader panicked");
                    state.mark_failed(format!("loader task failed: {error}"));
                }
            }
        })
    }

    fn ready_model(&self) -> Result<Arc<dyn LanguageModel>, BackendError> {
        let descriptor = self.state.descriptor();
        match descriptor.status {
            BackendStatus::Ready => self
                .model
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
                .ok_or_else(|| BackendError::Unavailable("local model missing".to_owned())),
            BackendStatus::Unloaded => {
                // Lazy load on first use; this call still fails fast.
                let _ = self.start_loading();
                Err(BackendError::Unavailable("local model is loading".to_owned()))
            }
            BackendStatus::Loading => {
                Err(BackendError::Unavailable("local model is loading".to_owned()))
            }
            BackendStatus::Error => Err(BackendError::Unavailable(format!(
                "local model failed: {}",
                descriptor.message.unwrap_or_default()
            ))),
        }
    }

    async fn acquire_worker(&self) -> Result<OwnedSemaphorePermit, BackendError> {
        self.workers
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| BackendError::Unavailable("local worker pool closed".to_owned()))
    }

    fn params_for(&self, request: &GenerationRequest) -> SamplingParams {
        SamplingParams {
            max_tokens: request.max_tokens_or_default(),
            temperature: request.temperature_or_default(),
            seed: self.seed,
        }
    }
}

#[async_trait]
impl GenerationBackend for LocalModelBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> BackendKind {
        BackendKind::LocalModel
    }

    fn descriptor(&self) -> BackendDescriptor {
        self.state.descriptor()
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<BackendOutput, BackendError> {
        let model = self.ready_model()?;
        let permit = self.acquire_worker().await?;
        let prompt = request.prompt.clone();
        let params = self.params_for(request);

        let result = task::spawn_blocking(move || {
            let _permit = permit;
            let mut session = model.start_session(&prompt, params);
            let mut text = String::new();
            let mut tokens = 0u32;
            while let Some(token) = session.next_token()? {
                text.push_str(&token);
                tokens += 1;
            }
            Ok::<_, String>((text, tokens))
        })
        .await;

        match result {
            Ok(Ok((text, tokens))) => Ok(BackendOutput {
                text,
                tokens_generated: Some(tokens),
            }),
            Ok(Err(message)) => {
                self.state.mark_failed(message.clone());
                Err(BackendError::Failed(message))
            }
            Err(error) => {
                let message = format!("generation task failed: {error}");
                self.state.mark_failed(message.clone());
                Err(BackendError::Failed(message))
            }
        }
    }

    async fn generate_stream(
        &self,
        request: &GenerationRequest,
        cancel: CancellationToken,
    ) -> Result<ChunkStream, BackendError> {
        let model = self.ready_model()?;
        let permit = self.acquire_worker().await?;
        let prompt = request.prompt.clone();
        let params = self.params_for(request);
        let state = self.state.clone();
        let (tx, rx) = mpsc::channel(1);

        task::spawn_blocking(move || {
            let _permit = permit;
            let mut session = model.start_session(&prompt, params);
            loop {
                if cancel.is_cancelled() {
                    debug!("local generation cancelled");
                    break;
                }
                match session.next_token() {
                    Ok(Some(token)) => {
                        if tx.blocking_send(Ok(token)).is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(message) => {
                        state.mark_failed(message.clone());
                        let _ = tx.blocking_send(Err(BackendError::Failed(message)));
                        break;
                    }
                }
            }
        });

        debug!(backend = %self.name, "stream prepared");
        Ok(ReceiverStream::new(rx).boxed())
    }

    async fn reload(&self) -> Result<(), BackendError> {
        if !self.state.begin_reload() {
            return Err(BackendError::Unavailable(
                "local model load already in progress".to_owned(),
            ));
        }
        *self.model.write().unwrap_or_else(PoisonError::into_inner) = None;
        self.spawn_load()
            .await
            .map_err(|error| BackendError::Failed(error.to_string()))?;

        match self.state.descriptor() {
            descriptor if descriptor.status == BackendStatus::Ready => Ok(()),
            descriptor => Err(BackendError::Unavailable(
                descriptor
                    .message
                    .unwrap_or_else(|| "local model did not become ready".to_owned()),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicBool, Ordering},
        thread,
        time::Duration,
    };

    use super::*;

    struct CountingModel {
        tokens: u32,
        fail_at: Option<u32>,
        step_delay: Duration,
    }

    impl LanguageModel for CountingModel {
        fn model_name(&self) -> &str {
            "counting"
        }

        fn start_session(
            self: Arc<Self>,
            _prompt: &str,
            params: SamplingParams,
        ) -> Box<dyn TokenSession> {
            Box::new(CountingSession {
                model: self,
                next: 0,
                limit: params.max_tokens,
            })
        }
    }

    struct CountingSession {
        model: Arc<CountingModel>,
        next: u32,
        limit: u32,
    }

    impl TokenSession for CountingSession {
        fn next_token(&mut self) -> Result<Option<String>, String> {
            if Some(self.next) == self.model.fail_at {
                return Err("engine fault".to_owned());
            }
            if self.next >= self.model.tokens.min(self.limit) {
                return Ok(None);
            }
            thread::sleep(self.model.step_delay);
            self.next += 1;
            Ok(Some(format!("t{} ", self.next)))
        }
    }

    struct TestLoader {
        model: Option<Arc<CountingModel>>,
        fail_first: AtomicBool,
    }

    impl TestLoader {
        fn ok(model: CountingModel) -> Self {
            Self {
                model: Some(Arc::new(model)),
                fail_first: AtomicBool::new(false),
            }
        }

        fn failing_once(model: CountingModel) -> Self {
            Self {
                model: Some(Arc::new(model)),
                fail_first: AtomicBool::new(true),
            }
        }
    }

    impl ModelLoader for TestLoader {
        fn describe(&self) -> String {
            "test".to_owned()
        }

        fn load(&self) -> Result<Arc<dyn LanguageModel>, String> {
            if self.fail_first.swap(false, Ordering::SeqCst) {
                return Err("weights not found".to_owned());
            }
            let model: Arc<dyn LanguageModel> =
                self.model.clone().ok_or_else(|| "no model".to_owned())?;
            Ok(model)
        }
    }

    fn counting(tokens: u32) -> CountingModel {
        CountingModel {
            tokens,
            fail_at: None,
            step_delay: Duration::ZERO,
        }
    }

    async fn loaded(loader: TestLoader) -> LocalModelBackend {
        let backend = LocalModelBackend::new(Arc::new(loader), 2);
        backend
            .start_loading()
            .expect("first load")
            .await
            .expect("load task");
        backend
    }

    #[tokio::test]
    async fn unloaded_backend_fails_fast_and_starts_loading() {
        let backend = LocalModelBackend::new(Arc::new(TestLoader::ok(counting(3))), 1);
        assert!(!backend.is_ready());

        let error = backend
            .generate(&GenerationRequest::new("hi"))
            .await
            .expect_err("not loaded yet");
        assert!(matches!(error, BackendError::Unavailable(_)));
        assert_ne!(backend.descriptor().status, BackendStatus::Unloaded);
    }

    #[tokio::test]
    async fn loaded_backend_generates_up_to_max_tokens() {
        let backend = loaded(TestLoader::ok(counting(10))).await;
        assert!(backend.is_ready());

        let output = backend
            .generate(&GenerationRequest::new("count").with_max_tokens(4))
            .await
            .expect("generate");
        assert_eq!(output.text, "t1 t2 t3 t4 ");
        assert_eq!(output.tokens_generated, Some(4));
    }

    #[tokio::test]
    async fn load_failure_is_sticky_until_reload() {
        let backend = loaded(TestLoader::failing_once(counting(2))).await;
        let descriptor = backend.descriptor();
        assert_eq!(descriptor.status, BackendStatus::Error);
        assert_eq!(descriptor.message.as_deref(), Some("weights not found"));

        for _ in 0..2 {
            let error = backend
                .generate(&GenerationRequest::new("hi"))
                .await
                .expect_err("fails fast");
            assert!(matches!(error, BackendError::Unavailable(_)));
        }
        assert!(backend.start_loading().is_none());

        backend.reload().await.expect("reload succeeds");
        assert!(backend.is_ready());
    }

    #[tokio::test]
    async fn engine_fault_moves_ready_backend_to_error() {
        let backend = loaded(TestLoader::ok(CountingModel {
            tokens: 5,
            fail_at: Some(2),
            step_delay: Duration::ZERO,
        }))
        .await;

        let error = backend
            .generate(&GenerationRequest::new("go"))
            .await
            .expect_err("engine fault");
        assert!(matches!(error, BackendError::Failed(_)));
        assert_eq!(backend.descriptor().status, BackendStatus::Error);
    }

    #[tokio::test]
    async fn stream_matches_bulk_output() {
        let backend = loaded(TestLoader::ok(counting(5))).await;
        let request = GenerationRequest::new("count");
        let bulk = backend.generate(&request).await.expect("bulk").text;
        let streamed = backend
            .generate_stream(&request, CancellationToken::new())
            .await
            .expect("stream")
            .map(|chunk| chunk.expect("chunk"))
            .collect::<Vec<_>>()
            .await
            .concat();
        assert_eq!(streamed, bulk);
    }

    #[tokio::test]
    async fn cancellation_is_observed_between_steps() {
        let backend = loaded(TestLoader::ok(CountingModel {
            tokens: 1_000,
            fail_at: None,
            step_delay: Duration::from_millis(5),
        }))
        .await;
        let cancel = CancellationToken::new();
        let mut stream = backend
            .generate_stream(
                &GenerationRequest::new("count").with_max_tokens(1_000),
                cancel.clone(),
            )
            .await
            .expect("stream");

        let first = stream.next().await.expect("first chunk").expect("ok");
        assert_eq!(first, "t1 ");
        cancel.cancel();

        let mut remaining = 0;
        while stream.next().await.is_some() {
            remaining += 1;
        }
        assert!(remaining < 10);
    }
}
