use std::{
    collections::BTreeMap,
    io,
    path::PathBuf,
    time::Duration,
};

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecentWindow {
    /// The most recent N records.
    Records(usize),
    /// Records whose timestamp falls within this span of now.
    Within(Duration),
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct StatsSnapshot {
    pub total_count: usize,
    pub avg_response_time_ms: f64,
    pub avg_prompt_length: f64,
    pub recent_count: usize,
    pub streaming_count: usize,
    pub regular_count: usize,
    pub error_count: usize,
    pub truncated_count: usize,
    pub malformed_lines: usize,
    pub min_response_time_ms: u64,
    pub max_response_time_ms: u64,
    pub avg_memory_usage_mb: f64,
    pub total_tokens_generated: u64,
    pub backend_usage: BTreeMap<String, usize>,
}

#[derive(Debug, Error)]
pub enum StatsError {
    #[error("failed to read interaction log {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Re-derives statistics from the interaction log on every call.
#[derive(Debug, Clone)]
pub struct StatsAggregator {
    path: PathBuf,
}

impl StatsAggregator {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub async fn compute_stats(&self, window: RecentWindow) -> Result<StatsSnapshot, StatsError> {
        let contents = match tokio::fs::read(&self.path).await {
            Ok(contents) => contents,
            Err(error) if error.kind() == io::ErrorKind::NotFound => {
                return Ok(StatsSnapshot::default());
            }
            Err(source) => {
                return Err(StatsError::Read {
                    path: self.path.clone(),
                    source,
                });
            }
        };

        let snapshot = summarize(&contents, window, Utc::now());
        debug!(
            total = snapshot.total_count,
            malformed = snapshot.malformed_lines,
            "interaction stats computed"
        );
        Ok(snapshot)
    }
}

/// Subset of a logged record the aggregator needs; tolerant of the older
/// record shape without `truncated`, metrics, or a `Z` suffix.
#[derive(Debug, Deserialize)]
struct LoggedInteraction {
    #[serde(default)]
    timestamp: Option<String>,
    response_time_ms: u64,
    #[serde(default)]
    prompt_length: usize,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    stream: bool,
    #[serde(default)]
    truncated: bool,
    #[serde(default)]
    tokens_generated: Option<u32>,
    #[serde(default)]
    memory_usage_mb: Option<f64>,
    #[serde(default)]
    error: Option<String>,
}

pub fn summarize(contents: &[u8], window: RecentWindow, now: DateTime<Utc>) -> StatsSnapshot {
    let mut snapshot = StatsSnapshot::default();
    let mut elapsed_sum = 0u128;
    let mut prompt_length_sum = 0u128;
    let mut memory_sum = 0.0f64;
    let mut memory_samples = 0usize;
    let mut timestamps = Vec::new();

    for line in contents.split(|byte| *byte == b'\n') {
        let line = line.trim_ascii();
        if line.is_empty() {
            continue;
        }
        let record = match serde_json::from_slice::<LoggedInteraction>(line) {
            Ok(record) => record,
            Err(_) => {
                snapshot.malformed_lines += 1;
                continue;
            }
        };

        if snapshot.total_count == 0 {
            snapshot.min_response_time_ms = record.response_time_ms;
        }
        snapshot.total_count += 1;
        elapsed_sum += u128::from(record.response_time_ms);
        prompt_length_sum += record.prompt_length as u128;
        snapshot.min_response_time_ms = snapshot.min_response_time_ms.min(record.response_time_ms);
        snapshot.max_response_time_ms = snapshot.max_response_time_ms.max(record.response_time_ms);

        if record.stream {
            snapshot.streaming_count += 1;
        }
        if record.truncated {
            snapshot.truncated_count += 1;
        }
        if record.error.is_some() {
            snapshot.error_count += 1;
        }
        if let Some(tokens) = record.tokens_generated {
            snapshot.total_tokens_generated += u64::from(tokens);
        }
        if let Some(memory) = record.memory_usage_mb {
            memory_sum += memory;
            memory_samples += 1;
        }
        *snapshot
            .backend_usage
            .entry(record.model.unwrap_or_else(|| "unknown".to_owned()))
            .or_insert(0) += 1;
        timestamps.push(record.timestamp.as_deref().and_then(parse_timestamp));
    }

    if snapshot.total_count == 0 {
        return StatsSnapshot {
            malformed_lines: snapshot.malformed_lines,
            ..StatsSnapshot::default()
        };
    }

    let total = snapshot.total_count as f64;
    snapshot.regular_count = snapshot.total_count - snapshot.streaming_count;
    snapshot.avg_response_time_ms = round2(elapsed_sum as f64 / total);
    snapshot.avg_prompt_length = round2(prompt_length_sum as f64 / total);
    if memory_samples > 0 {
        snapshot.avg_memory_usage_mb = round2(memory_sum / memory_samples as f64);
    }
    snapshot.recent_count = match window {
        RecentWindow::Records(count) => count.min(snapshot.total_count),
        RecentWindow::Within(span) => {
            let cutoff = chrono::Duration::from_std(span)
                .ok()
                .and_then(|span| now.checked_sub_signed(span));
            timestamps
                .iter()
                .flatten()
                .filter(|timestamp| cutoff.map_or(true, |cutoff| **timestamp >= cutoff))
                .count()
        }
    };

    snapshot
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use chrono::Duration as ChronoDuration;

    use super::*;
    use crate::interaction_log::{InteractionLogger, InteractionRecord};

    fn line(record: &InteractionRecord) -> String {
        serde_json::to_string(record).expect("encode")
    }

    #[tokio::test]
    async fn missing_or_empty_log_gives_zero_snapshot() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("log.jsonl");
        let aggregator = StatsAggregator::new(&path);

        let missing = aggregator
            .compute_stats(RecentWindow::Records(10))
            .await
            .expect("stats");
        assert_eq!(missing, StatsSnapshot::default());

        std::fs::write(&path, b"").expect("empty log");
        let empty = aggregator
            .compute_stats(RecentWindow::Within(Duration::from_secs(60)))
            .await
            .expect("stats");
        assert_eq!(empty, StatsSnapshot::default());
    }

    #[tokio::test]
    async fn single_appended_record_is_reflected_exactly() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("log.jsonl");
        let logger = InteractionLogger::new(&path);
        logger
            .append(InteractionRecord::new(
                "What is machine learning?",
                "An answer.",
                42,
                "minivault-stub",
                false,
            ))
            .await
            .expect("append");

        let snapshot = StatsAggregator::new(&path)
            .compute_stats(RecentWindow::Records(5))
            .await
            .expect("stats");
        assert_eq!(snapshot.total_count, 1);
        assert_eq!(snapshot.avg_response_time_ms, 42.0);
        assert_eq!(snapshot.avg_prompt_length, 25.0);
        assert_eq!(snapshot.recent_count, 1);
        assert_eq!(snapshot.regular_count, 1);
        assert_eq!(snapshot.backend_usage.get("minivault-stub"), Some(&1));
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let first = InteractionRecord::new("a", "b", 10, "stub", true);
        let second = InteractionRecord::new("abc", "d", 30, "remote", false)
            .with_error("backend timeout")
            .with_tokens(Some(7));
        let contents = format!(
            "{}\nnot json at all\n{}\n{{\"timestamp\":\"2024-01-0",
            line(&first),
            line(&second)
        );

        let snapshot = summarize(contents.as_bytes(), RecentWindow::Records(1), Utc::now());
        assert_eq!(snapshot.total_count, 2);
        assert_eq!(snapshot.malformed_lines, 2);
        assert_eq!(snapshot.avg_response_time_ms, 20.0);
        assert_eq!(snapshot.avg_prompt_length, 2.0);
        assert_eq!(snapshot.streaming_count, 1);
        assert_eq!(snapshot.error_count, 1);
        assert_eq!(snapshot.recent_count, 1);
        assert_eq!(snapshot.min_response_time_ms, 10);
        assert_eq!(snapshot.max_response_time_ms, 30);
        assert_eq!(snapshot.total_tokens_generated, 7);
    }

    #[test]
    fn all_malformed_log_is_all_zero_apart_from_skip_count() {
        let snapshot = summarize(b"{broken\n???\n", RecentWindow::Records(3), Utc::now());
        assert_eq!(snapshot.total_count, 0);
        assert_eq!(snapshot.avg_response_time_ms, 0.0);
        assert_eq!(snapshot.recent_count, 0);
        assert_eq!(snapshot.malformed_lines, 2);
    }

    #[test]
    fn record_without_prompt_text_still_counts() {
        let contents = b"{\"response_time_ms\":8,\"prompt_length\":4,\"model\":\"stub\"}\n";
        let snapshot = summarize(contents, RecentWindow::Records(5), Utc::now());
        assert_eq!(snapshot.total_count, 1);
        assert_eq!(snapshot.malformed_lines, 0);
        assert_eq!(snapshot.avg_prompt_length, 4.0);
    }

    #[test]
    fn time_window_counts_recent_records() {
        let now = Utc::now();
        let mut old = InteractionRecord::new("old", "r", 5, "stub", false);
        old.timestamp = now - ChronoDuration::hours(30);
        let fresh = InteractionRecord::new("new", "r", 5, "stub", false);
        let legacy = format!(
            "{{\"timestamp\":\"{}\",\"prompt\":\"legacy\",\"response\":\"r\",\"response_time_ms\":9,\"model\":\"minivault-ollama\",\"stream\":false,\"prompt_length\":6,\"response_length\":1}}",
            (now - ChronoDuration::hours(1)).naive_utc().format("%Y-%m-%dT%H:%M:%S%.6f")
        );
        let contents = format!("{}\n{}\n{}\n", line(&old), line(&fresh), legacy);

        let snapshot = summarize(
            contents.as_bytes(),
            RecentWindow::Within(Duration::from_secs(24 * 3_600)),
            now,
        );
        assert_eq!(snapshot.total_count, 3);
        assert_eq!(snapshot.recent_count, 2);
        assert_eq!(snapshot.backend_usage.len(), 2);
    }
}
