use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Code,
    Question,
    Explanation,
    Creative,
    Default,
}

impl Category {
    /// Order in which keyword tables are tried; `Default` has no table.
    pub const PRIORITY: [Category; 4] = [
        Category::Code,
        Category::Question,
        Category::Explanation,
        Category::Creative,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Category::Code => "code",
            Category::Question => "question",
            Category::Explanation => "explanation",
            Category::Creative => "creative",
            Category::Default => "default",
        }
    }

    fn keywords(self) -> &'static [&'static str] {
        match self {
            Category::Code => &[
                "function",
                "code",
                "implement",
                "algorithm",
                "technical",
                "api",
                "database",
                "compile",
                "debug",
                "rust",
                "python",
            ],
            Category::Question => &["?", "what", "how", "why", "when", "where", "who", "which"],
            Category::Explanation => &[
                "explain",
                "describe",
                "overview",
                "summarize",
                "tell me about",
                "difference between",
                "meaning of",
            ],
            Category::Creative => &["story", "creative", "imagine", "write", "poem", "fiction"],
            Category::Default => &[],
        }
    }
}

/// Maps a prompt to the first category whose keyword table matches it.
pub fn classify(prompt: &str) -> Category {
    let lowered = prompt.to_lowercase();
    Category::PRIORITY
        .into_iter()
        .find(|category| {
            category
                .keywords()
                .iter()
                .any(|keyword| lowered.contains(keyword))
        })
        .unwrap_or(Category::Default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn question_prompt_is_classified_as_question() {
        assert_eq!(classify("What is machine learning?"), Category::Question);
    }

    #[test]
    fn code_wins_over_question_by_priority() {
        assert_eq!(
            classify("How do I implement a binary search function?"),
            Category::Code
        );
    }

    #[test]
    fn matching_is_case_insensitive() {
        assert_eq!(classify("EXPLAIN photosynthesis"), Category::Explanation);
        assert_eq!(classify("Once upon a time, a Poem"), Category::Creative);
    }

    #[test]
    fn unmatched_prompt_falls_through_to_default() {
        assert_eq!(classify("Hello there"), Category::Default);
        assert_eq!(classify(""), Category::Default);
    }

    #[test]
    fn classification_is_stable_across_calls() {
        let prompts = [
            "Write me a story about dragons",
            "Describe the water cycle",
            "Good morning",
            "Where is the database config?",
        ];
        for prompt in prompts {
            let first = classify(prompt);
            for _ in 0..5 {
                assert_eq!(classify(prompt), first);
            }
        }
    }
}
