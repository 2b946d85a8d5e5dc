pub mod bigram;
pub mod local;
pub mod remote;
pub mod stub;

use std::{
    fmt,
    str::FromStr,
    sync::{PoisonError, RwLock},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream::BoxStream;
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::models::GenerationRequest;

pub type ChunkStream = BoxStream<'static, Result<String, BackendError>>;

/// Common capability set of every generation backend.
///
/// `generate_stream` implementations check `cancel` between chunk productions
/// and stop producing once it fires; dropping the returned stream must release
/// whatever the backend holds for the generation.
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    fn name(&self) -> &str;
    fn kind(&self) -> BackendKind;
    fn descriptor(&self) -> BackendDescriptor;

    fn is_ready(&self) -> bool {
        self.descriptor().status == BackendStatus::Ready
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<BackendOutput, BackendError>;

    async fn generate_stream(
        &self,
        request: &GenerationRequest,
        cancel: CancellationToken,
    ) -> Result<ChunkStream, BackendError>;

    /// Explicit reload action; the only way out of `BackendStatus::Error`.
    async fn reload(&self) -> Result<(), BackendError> {
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    #[error("backend timeout: {0}")]
    Timeout(String),
    #[error("backend returned status {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("backend invalid response: {0}")]
    InvalidResponse(String),
    #[error("backend failed: {0}")]
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct BackendOutput {
    pub text: String,
    pub tokens_generated: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Stub,
    LocalModel,
    RemoteModel,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::Stub => "stub",
            BackendKind::LocalModel => "local",
            BackendKind::RemoteModel => "remote",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "stub" | "stubbed" => Ok(BackendKind::Stub),
            "local" | "local_model" | "transformers" => Ok(BackendKind::LocalModel),
            "remote" | "remote_model" | "ollama" => Ok(BackendKind::RemoteModel),
            other => Err(format!("unknown backend '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendStatus {
    Unloaded,
    Loading,
    Ready,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct BackendDescriptor {
    pub name: String,
    pub kind: BackendKind,
    pub status: BackendStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ready_since: Option<DateTime<Utc>>,
}

/// Synchronized lifecycle of one backend.
///
/// Transitions: Unloaded -> Loading -> {Ready, Error}; Ready -> Error on a
/// runtime failure. Leaving Error requires `begin_reload`.
#[derive(Debug)]
pub struct BackendState {
    name: String,
    kind: BackendKind,
    inner: RwLock<StateInner>,
}

#[derive(Debug)]
struct StateInner {
    status: BackendStatus,
    message: Option<String>,
    ready_since: Option<DateTime<Utc>>,
}

impl BackendState {
    pub fn new(name: impl Into<String>, kind: BackendKind) -> Self {
        Self {
            name: name.into(),
            kind,
            inner: RwLock::new(StateInner {
                status: BackendStatus::Unloaded,
                message: None,
                ready_since: None,
            }),
        }
    }

    pub fn always_ready(name: impl Into<String>, kind: BackendKind) -> Self {
        let state = Self::new(name, kind);
        state.begin_loading();
        state.mark_ready();
        state
    }

    pub fn status(&self) -> BackendStatus {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .status
    }

    pub fn descriptor(&self) -> BackendDescriptor {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        BackendDescriptor {
            name: self.name.clone(),
            kind: self.kind,
            status: inner.status,
            message: inner.message.clone(),
            ready_since: inner.ready_since,
        }
    }

    /// Unloaded -> Loading. Returns false when a load already ran or is running.
    pub fn begin_loading(&self) -> bool {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if inner.status != BackendStatus::Unloaded {
            return false;
        }
        inner.status = BackendStatus::Loading;
        inner.message = None;
        true
    }

    /// Any settled state -> Loading. Refused while a load is in flight.
    pub fn begin_reload(&self) -> bool {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if inner.status == BackendStatus::Loading {
            return false;
        }
        inner.status = BackendStatus::Loading;
        inner.message = None;
        inner.ready_since = None;
        true
    }

    pub fn mark_ready(&self) -> bool {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if inner.status != BackendStatus::Loading {
            return false;
        }
        inner.status = BackendStatus::Ready;
        inner.message = None;
        inner.ready_since = Some(Utc::now());
        true
    }

    pub fn mark_failed(&self, message: impl Into<String>) -> bool {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if !matches!(inner.status, BackendStatus::Loading | BackendStatus::Ready) {
            return false;
        }
        inner.status = BackendStatus::Error;
        inner.message = Some(message.into());
        inner.ready_since = None;
        true
    }
}

/// Splits text into word chunks whose concatenation is the original text.
pub fn split_for_stream(text: &str) -> Vec<String> {
    text.split_inclusive(' ')
        .filter(|piece| !piece.is_empty())
        .map(ToOwned::to_owned)
        .collect()
}
