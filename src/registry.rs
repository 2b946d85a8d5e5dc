use std::{collections::HashMap, sync::Arc};

use tracing::debug;

use crate::backend::{stub::StubBackend, BackendError, BackendKind, GenerationBackend};

/// Backends constructed at startup. The stub is always present so a
/// selectable backend exists no matter how the others fare.
#[derive(Clone)]
pub struct BackendRegistry {
    selected: BackendKind,
    backends: Arc<HashMap<BackendKind, Arc<dyn GenerationBackend>>>,
}

impl BackendRegistry {
    pub fn new(stub: Arc<StubBackend>) -> Self {
        let stub: Arc<dyn GenerationBackend> = stub;
        let mut backends = HashMap::new();
        backends.insert(BackendKind::Stub, stub);
        Self {
            selected: BackendKind::Stub,
            backends: Arc::new(backends),
        }
    }

    /// Registers `backend` and makes it the default selection.
    pub fn with_selected(mut self, backend: Arc<dyn GenerationBackend>) -> Self {
        let kind = backend.kind();
        let mut backends = self.backends.as_ref().clone();
        backends.insert(kind, backend);
        self.backends = Arc::new(backends);
        self.selected = kind;
        self
    }

    pub fn selected_kind(&self) -> BackendKind {
        self.selected
    }

    pub fn selected(&self) -> Arc<dyn GenerationBackend> {
        self.backends
            .get(&self.selected)
            .or_else(|| self.backends.get(&BackendKind::Stub))
            .cloned()
            .unwrap_or_else(|| Arc::new(StubBackend::default()))
    }

    pub fn stub(&self) -> Arc<dyn GenerationBackend> {
        self.backends
            .get(&BackendKind::Stub)
            .cloned()
            .unwrap_or_else(|| Arc::new(StubBackend::default()))
    }

    /// Resolves a per-request override. Naming an unconfigured backend is an
    /// error rather than a silent substitution.
    pub fn resolve(
        &self,
        requested: Option<BackendKind>,
    ) -> Result<Arc<dyn GenerationBackend>, BackendError> {
        let Some(kind) = requested else {
            return Ok(self.selected());
        };
        let backend = self.backends.get(&kind).cloned().ok_or_else(|| {
            BackendError::Unavailable(format!("backend '{kind}' is not configured"))
        })?;
        debug!(backend = %backend.name(), "backend override applied");
        Ok(backend)
    }

    pub fn all(&self) -> Vec<Arc<dyn GenerationBackend>> {
        self.backends.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::local::LocalModelBackend;
    use crate::backend::bigram::CorpusLoader;

    #[test]
    fn stub_is_selected_by_default() {
        let registry = BackendRegistry::new(Arc::new(StubBackend::default()));
        assert_eq!(registry.selected_kind(), BackendKind::Stub);
        assert!(registry.selected().is_ready());
        assert_eq!(registry.all().len(), 1);
    }

    #[tokio::test]
    async fn override_to_unconfigured_backend_fails() {
        let registry = BackendRegistry::new(Arc::new(StubBackend::default()));
        let error = registry
            .resolve(Some(BackendKind::RemoteModel))
            .err()
            .expect("remote is not configured");
        assert!(matches!(error, BackendError::Unavailable(_)));
        assert!(registry.resolve(Some(BackendKind::Stub)).is_ok());
    }

    #[tokio::test]
    async fn selected_backend_can_be_overridden_to_stub() {
        let local = Arc::new(LocalModelBackend::new(
            Arc::new(CorpusLoader::new("missing.txt")),
            1,
        ));
        let registry = BackendRegistry::new(Arc::new(StubBackend::default())).with_selected(local);
        assert_eq!(registry.selected_kind(), BackendKind::LocalModel);
        assert_eq!(
            registry
                .resolve(Some(BackendKind::Stub))
                .expect("stub")
                .kind(),
            BackendKind::Stub
        );
        assert_eq!(registry.all().len(), 2);
    }
}
