use std::{env, net::SocketAddr, path::PathBuf, str::FromStr, time::Duration};

use crate::backend::BackendKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptOverflow {
    Reject,
    Truncate,
}

#[derive(Debug, Clone)]
pub struct PromptLimits {
    pub max_prompt_chars: usize,
    pub overflow: PromptOverflow,
}

impl Default for PromptLimits {
    fn default() -> Self {
        Self {
            max_prompt_chars: 10_000,
            overflow: PromptOverflow::Reject,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StubConfig {
    pub seed: Option<u64>,
    pub token_delay: Duration,
}

impl Default for StubConfig {
    fn default() -> Self {
        Self {
            seed: None,
            token_delay: Duration::from_millis(35),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LocalModelConfig {
    pub model_path: PathBuf,
    pub workers: usize,
}

#[derive(Debug, Clone)]
pub struct RemoteModelConfig {
    pub base_url: String,
    pub model: String,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub max_connections: usize,
}

impl Default for RemoteModelConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_owned(),
            model: "llama3.2:1b".to_owned(),
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(60),
            max_connections: 16,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub bind_addr: SocketAddr,
    pub backend: BackendKind,
    pub log_path: PathBuf,
    pub prompt_limits: PromptLimits,
    pub stub: StubConfig,
    pub local: LocalModelConfig,
    pub remote: RemoteModelConfig,
    pub stats_window: Duration,
}

impl ServiceConfig {
    pub fn from_env() -> Self {
        let backend = env::var("MODEL_TYPE")
            .ok()
            .and_then(|value| BackendKind::from_str(&value).ok())
            .unwrap_or(BackendKind::Stub);
        let overflow = match env::var("MINIVAULT_PROMPT_OVERFLOW") {
            Ok(value) if value.eq_ignore_ascii_case("truncate") => PromptOverflow::Truncate,
            _ => PromptOverflow::Reject,
        };
        let workers = read_usize("LOCAL_MODEL_WORKERS", default_workers()).max(1);
        let remote_defaults = RemoteModelConfig::default();

        Self {
            bind_addr: read_parsed("MINIVAULT_BIND_ADDR", SocketAddr::from(([0, 0, 0, 0], 8000))),
            backend,
            log_path: env::var("MINIVAULT_LOG_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("logs/log.jsonl")),
            prompt_limits: PromptLimits {
                max_prompt_chars: read_usize("MINIVAULT_MAX_PROMPT_CHARS", 10_000),
                overflow,
            },
            stub: StubConfig {
                seed: env::var("MINIVAULT_STUB_SEED")
                    .ok()
                    .and_then(|value| value.parse::<u64>().ok()),
                token_delay: Duration::from_millis(read_u64("MINIVAULT_STUB_TOKEN_DELAY_MS", 35)),
            },
            local: LocalModelConfig {
                model_path: env::var("LOCAL_MODEL_PATH")
                    .map(PathBuf::from)
                    .unwrap_or_else(|_| PathBuf::from("models/corpus.txt")),
                workers,
            },
            remote: RemoteModelConfig {
                base_url: env::var("OLLAMA_HOST")
                    .ok()
                    .filter(|value| !value.trim().is_empty())
                    .unwrap_or(remote_defaults.base_url)
                    .trim_end_matches('/')
                    .to_owned(),
                model: env::var("OLLAMA_MODEL")
                    .ok()
                    .filter(|value| !value.trim().is_empty())
                    .unwrap_or(remote_defaults.model),
                connect_timeout: Duration::from_secs(read_u64("REMOTE_CONNECT_TIMEOUT_SECS", 5)),
                read_timeout: Duration::from_secs(read_u64("REMOTE_TIMEOUT_SECS", 60)),
                max_connections: read_usize("REMOTE_MAX_CONNECTIONS", 16).max(1),
            },
            stats_window: Duration::from_secs(
                read_u64("MINIVAULT_STATS_WINDOW_HOURS", 24).saturating_mul(3_600),
            ),
        }
    }
}

pub fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|count| count.get())
        .unwrap_or(2)
}

fn read_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .unwrap_or(default)
}

fn read_usize(name: &str, default: usize) -> usize {
    env::var(name)
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

fn read_parsed<T: FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|value| value.parse::<T>().ok())
        .unwrap_or(default)
}
