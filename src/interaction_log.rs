//! Append-only JSON-lines log of every generation request.
//!
//! One record per line, each line parseable on its own. Appends are
//! serialized through a single in-process lock; several service processes
//! sharing one log path get no interleaving guarantee.

use std::{
    io::{self, SeekFrom},
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{
    fs::{self, File, OpenOptions},
    io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt},
    sync::Mutex,
};
use tracing::warn;

use crate::{classifier::Category, metrics::AppMetrics};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InteractionRecord {
    pub timestamp: DateTime<Utc>,
    pub prompt: String,
    pub response: String,
    pub response_time_ms: u64,
    pub model: String,
    pub stream: bool,
    #[serde(default)]
    pub truncated: bool,
    pub prompt_length: usize,
    pub response_length: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<Category>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_generated: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_usage_mb: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl InteractionRecord {
    pub fn new(
        prompt: impl Into<String>,
        response: impl Into<String>,
        response_time_ms: u64,
        model: impl Into<String>,
        stream: bool,
    ) -> Self {
        let prompt = prompt.into();
        let response = response.into();
        Self {
            timestamp: Utc::now(),
            prompt_length: prompt.chars().count(),
            response_length: response.chars().count(),
            prompt,
            response,
            response_time_ms,
            model: model.into(),
            stream,
            truncated: false,
            category: None,
            tokens_generated: None,
            memory_usage_mb: None,
            error: None,
        }
    }

    pub fn truncated(mut self, truncated: bool) -> Self {
        self.truncated = truncated;
        self
    }

    pub fn with_category(mut self, category: Option<Category>) -> Self {
        self.category = category;
        self
    }

    pub fn with_tokens(mut self, tokens_generated: Option<u32>) -> Self {
        self.tokens_generated = tokens_generated;
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_resource_usage(mut self) -> Self {
        self.memory_usage_mb = resident_memory_mb();
        self
    }
}

#[derive(Debug, Error)]
pub enum LogError {
    #[error("failed to write interaction log {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to encode interaction record: {0}")]
    Encode(#[from] serde_json::Error),
}

pub struct InteractionLogger {
    path: PathBuf,
    sink: Mutex<LogSink>,
}

#[derive(Default)]
struct LogSink {
    file: Option<File>,
    last_timestamp: Option<DateTime<Utc>>,
}

impl InteractionLogger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            sink: Mutex::new(LogSink::default()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn directory(&self) -> &Path {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        }
    }

    /// Writes one record as a single line. Returns the record as persisted,
    /// with its timestamp clamped so the log stays timestamp-monotonic.
    pub async fn append(&self, mut record: InteractionRecord) -> Result<InteractionRecord, LogError> {
        let mut sink = self.sink.lock().await;
        if let Some(last) = sink.last_timestamp {
            if record.timestamp < last {
                record.timestamp = last;
            }
        }

        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');

        if sink.file.is_none() {
            let file = open_sealed(&self.path).await.map_err(|source| LogError::Io {
                path: self.path.clone(),
                source,
            })?;
            sink.file = Some(file);
        }

        let written = match sink.file.as_mut() {
            Some(file) => write_line(file, &line).await,
            None => Ok(()),
        };
        if let Err(source) = written {
            // Reopen (and reseal) on the next append.
            sink.file = None;
            return Err(LogError::Io {
                path: self.path.clone(),
                source,
            });
        }

        sink.last_timestamp = Some(record.timestamp);
        Ok(record)
    }

    /// Appends without surfacing failures; they only bump the error metric.
    pub async fn append_best_effort(&self, record: InteractionRecord, metrics: &AppMetrics) {
        if let Err(error) = self.append(record).await {
            metrics.observe_log_write_error();
            warn!(error = %error, "interaction log append failed");
        }
    }

    /// Probes whether the log directory accepts new files.
    pub async fn directory_writable(&self) -> bool {
        let directory = self.directory();
        if fs::create_dir_all(directory).await.is_err() {
            return false;
        }
        let probe = directory.join(format!(".write-probe-{}", uuid::Uuid::new_v4()));
        match fs::write(&probe, b"ok").await {
            Ok(()) => {
                let _ = fs::remove_file(&probe).await;
                true
            }
            Err(_) => false,
        }
    }
}

async fn write_line(file: &mut File, line: &[u8]) -> io::Result<()> {
    file.write_all(line).await?;
    file.flush().await
}

/// Opens the log for appending. A trailing partial line left by a crash is
/// terminated first so the next record starts on its own line.
async fn open_sealed(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent).await?;
    }
    let mut file = OpenOptions::new()
        .create(true)
        .read(true)
        .append(true)
        .open(path)
        .await?;

    if file.metadata().await?.len() > 0 {
        file.seek(SeekFrom::End(-1)).await?;
        let mut last = [0u8; 1];
        file.read_exact(&mut last).await?;
        if last[0] != b'\n' {
            warn!(path = %path.display(), "sealing partial trailing record in interaction log");
            write_line(&mut file, b"\n").await?;
        }
    }
    Ok(file)
}

#[cfg(target_os = "linux")]
fn resident_memory_mb() -> Option<f64> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    let kilobytes = status
        .lines()
        .find_map(|line| line.strip_prefix("VmRSS:"))?
        .split_whitespace()
        .next()?
        .parse::<f64>()
        .ok()?;
    Some((kilobytes / 1024.0 * 100.0).round() / 100.0)
}

#[cfg(not(target_os = "linux"))]
fn resident_memory_mb() -> Option<f64> {
    None
}
