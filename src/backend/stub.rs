use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use rand::{rngs::StdRng, SeedableRng};
use tokio::{sync::mpsc, time::sleep};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    backend::{
        split_for_stream, BackendDescriptor, BackendError, BackendKind, BackendOutput,
        BackendState, ChunkStream, GenerationBackend,
    },
    classifier::classify,
    config::StubConfig,
    models::{rough_token_estimate, GenerationRequest},
    synthesizer::ResponseSynthesizer,
};

/// Template backend. Always ready and never fails, so it is the fallback of last resort.
#[derive(Debug)]
pub struct StubBackend {
    state: BackendState,
    synthesizer: ResponseSynthesizer,
    seed: Option<u64>,
    token_delay: Duration,
}

impl Default for StubBackend {
    fn default() -> Self {
        Self::new(StubConfig::default())
    }
}

impl StubBackend {
    pub fn new(config: StubConfig) -> Self {
        Self {
            state: BackendState::always_ready("minivault-stub", BackendKind::Stub),
            synthesizer: ResponseSynthesizer,
            seed: config.seed,
            token_delay: config.token_delay,
        }
    }

    /// Fixed seed and no chunk delay; identical prompts give identical output.
    pub fn deterministic(seed: u64) -> Self {
        Self::new(StubConfig {
            seed: Some(seed),
            token_delay: Duration::ZERO,
        })
    }

    pub fn with_token_delay(mut self, token_delay: Duration) -> Self {
        self.token_delay = token_delay;
        self
    }

    fn render(&self, request: &GenerationRequest) -> Vec<String> {
        let mut rng = match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let category = classify(&request.prompt);
        let text = self.synthesizer.generate(&request.prompt, category, &mut rng);
        let mut chunks = split_for_stream(&text);
        chunks.truncate(request.max_tokens_or_default() as usize);
        chunks
    }
}

#[async_trait]
impl GenerationBackend for StubBackend {
    fn name(&self) -> &str {
        "minivault-stub"
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Stub
    }

    fn descriptor(&self) -> BackendDescriptor {
        self.state.descriptor()
    }

    fn is_ready(&self) -> bool {
        true
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<BackendOutput, BackendError> {
        let text = self.render(request).concat();
        let tokens_generated = Some(rough_token_estimate(&text));
        Ok(BackendOutput {
            text,
            tokens_generated,
        })
    }

    async fn generate_stream(
        &self,
        request: &GenerationRequest,
        cancel: CancellationToken,
    ) -> Result<ChunkStream, BackendError> {
        let chunks = self.render(request);
        let delay = self.token_delay;
        let (tx, rx) = mpsc::channel(1);

        tokio::spawn(async move {
            for chunk in chunks {
                if cancel.is_cancelled() {
                    debug!("stub stream cancelled");
                    return;
                }
                if tx.send(Ok(chunk)).await.is_err() {
                    return;
                }
                if !delay.is_zero() {
                    sleep(delay).await;
                }
            }
        });

        debug!(backend = self.name(), "stream prepared");
        Ok(ReceiverStream::new(rx).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn generate_always_succeeds() {
        let backend = StubBackend::default();
        for prompt in ["What is machine learning?", "x", "Write a poem!"] {
            let output = backend
                .generate(&GenerationRequest::new(prompt))
                .await
                .expect("stub never fails");
            assert!(!output.text.is_empty());
            assert!(output.tokens_generated.unwrap_or_default() > 0);
        }
        assert!(backend.is_ready());
    }

    #[tokio::test]
    async fn stream_concatenates_to_bulk_response() {
        let backend = StubBackend::deterministic(42);
        let request = GenerationRequest::new("Explain how a compiler works");
        let bulk = backend.generate(&request).await.expect("bulk").text;

        let chunks = backend
            .generate_stream(&request, CancellationToken::new())
            .await
            .expect("stream")
            .map(|chunk| chunk.expect("chunk"))
            .collect::<Vec<_>>()
            .await;

        assert!(chunks.len() > 1);
        assert_eq!(chunks.concat(), bulk);
    }

    #[tokio::test]
    async fn max_tokens_limits_both_modes() {
        let backend = StubBackend::deterministic(5);
        let request = GenerationRequest::new("Tell me a story").with_max_tokens(3);
        let bulk = backend.generate(&request).await.expect("bulk");
        assert_eq!(bulk.tokens_generated, Some(3));

        let streamed = backend
            .generate_stream(&request, CancellationToken::new())
            .await
            .expect("stream")
            .collect::<Vec<_>>()
            .await;
        assert_eq!(streamed.len(), 3);
    }

    #[tokio::test]
    async fn cancelled_token_stops_production() {
        let backend = StubBackend::deterministic(9);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let chunks = backend
            .generate_stream(&GenerationRequest::new("hello there"), cancel)
            .await
            .expect("stream")
            .collect::<Vec<_>>()
            .await;
        assert!(chunks.is_empty());
    }
}
