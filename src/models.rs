use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    backend::BackendKind,
    config::{PromptLimits, PromptOverflow},
};

pub const DEFAULT_MAX_TOKENS: u32 = 100;
pub const DEFAULT_TEMPERATURE: f32 = 0.7;
pub const MAX_TOKENS_LIMIT: u32 = 1_000;

#[derive(Debug, Clone, Deserialize)]
pub struct GenerateBody {
    pub prompt: String,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub backend: Option<String>,
}

#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub request_id: String,
    pub prompt: String,
    pub stream: bool,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub backend: Option<BackendKind>,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            request_id: format!("gen_{}", Uuid::new_v4()),
            prompt: prompt.into(),
            stream: false,
            max_tokens: None,
            temperature: None,
            backend: None,
        }
    }

    pub fn streaming(mut self) -> Self {
        self.stream = true;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn max_tokens_or_default(&self) -> u32 {
        self.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS)
    }

    pub fn temperature_or_default(&self) -> f32 {
        self.temperature.unwrap_or(DEFAULT_TEMPERATURE)
    }
}

impl GenerateBody {
    pub fn into_request(self, limits: &PromptLimits) -> Result<GenerationRequest, String> {
        let trimmed = self.prompt.trim();
        if trimmed.is_empty() {
            return Err("prompt cannot be empty".to_owned());
        }

        let char_count = trimmed.chars().count();
        let prompt = if char_count > limits.max_prompt_chars {
            match limits.overflow {
                PromptOverflow::Reject => {
                    return Err(format!(
                        "prompt too long (max {} characters)",
                        limits.max_prompt_chars
                    ));
                }
                PromptOverflow::Truncate => {
                    trimmed.chars().take(limits.max_prompt_chars).collect()
                }
            }
        } else {
            trimmed.to_owned()
        };

        if let Some(max_tokens) = self.max_tokens {
            if !(1..=MAX_TOKENS_LIMIT).contains(&max_tokens) {
                return Err(format!("max_tokens must be between 1 and {MAX_TOKENS_LIMIT}"));
            }
        }
        if let Some(temperature) = self.temperature {
            if !(0.0..=2.0).contains(&temperature) {
                return Err("temperature must be between 0.0 and 2.0".to_owned());
            }
        }
        let backend = self
            .backend
            .as_deref()
            .map(BackendKind::from_str)
            .transpose()?;

        Ok(GenerationRequest {
            request_id: format!("gen_{}", Uuid::new_v4()),
            prompt,
            stream: self.stream,
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            backend,
        })
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct GenerationResult {
    pub response: String,
    pub model: String,
    pub response_time_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens_generated: Option<u32>,
    pub truncated: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamChunk {
    pub token: String,
    pub chunk_id: u64,
    pub is_final: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_tokens: Option<u32>,
}

impl StreamChunk {
    pub fn token(chunk_id: u64, token: String) -> Self {
        Self {
            token,
            chunk_id,
            is_final: false,
            total_tokens: None,
        }
    }

    pub fn last(chunk_id: u64, total_tokens: u32) -> Self {
        Self {
            token: String::new(),
            chunk_id,
            is_final: true,
            total_tokens: Some(total_tokens),
        }
    }
}

pub fn rough_token_estimate(text: &str) -> u32 {
    if text.trim().is_empty() {
        return 0;
    }
    text.split_whitespace().count() as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(prompt: &str) -> GenerateBody {
        GenerateBody {
            prompt: prompt.to_owned(),
            stream: false,
            max_tokens: None,
            temperature: None,
            backend: None,
        }
    }

    #[test]
    fn blank_prompt_is_rejected() {
        let error = body("   \n")
            .into_request(&PromptLimits::default())
            .expect_err("blank prompt should fail");
        assert_eq!(error, "prompt cannot be empty");
    }

    #[test]
    fn oversized_prompt_follows_overflow_policy() {
        let reject = PromptLimits {
            max_prompt_chars: 5,
            overflow: PromptOverflow::Reject,
        };
        assert!(body("abcdefgh").into_request(&reject).is_err());

        let truncate = PromptLimits {
            max_prompt_chars: 5,
            overflow: PromptOverflow::Truncate,
        };
        let request = body("  abcdefgh ")
            .into_request(&truncate)
            .expect("truncation keeps the request");
        assert_eq!(request.prompt, "abcde");
    }

    #[test]
    fn generation_parameters_are_range_checked() {
        let mut too_many = body("hello");
        too_many.max_tokens = Some(0);
        assert!(too_many.into_request(&PromptLimits::default()).is_err());

        let mut too_hot = body("hello");
        too_hot.temperature = Some(2.5);
        assert!(too_hot.into_request(&PromptLimits::default()).is_err());

        let mut unknown_backend = body("hello");
        unknown_backend.backend = Some("gpu-farm".to_owned());
        assert!(unknown_backend.into_request(&PromptLimits::default()).is_err());
    }

    #[test]
    fn token_estimate_counts_words() {
        assert_eq!(rough_token_estimate("  "), 0);
        assert_eq!(rough_token_estimate("one two  three"), 3);
    }
}
