//! Alert policy: decides whether a message body triggers an escalation.
//!
//! The router depends only on [`AlertPolicy`], so the keyword matcher here
//! can be swapped for a contextual classifier without touching routing.

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Pure predicate over message text. Implementations must be deterministic
/// and free of side effects.
pub trait AlertPolicy: Send + Sync {
    /// Whether `text` should raise an alert.
    fn classify(&self, text: &str) -> bool;

    /// Short human-readable description, used in startup logs.
    fn describe(&self) -> String;
}

/// How keywords are matched against message text.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMode {
    /// Case-insensitive substring match. Catches every mention, including
    /// words that merely contain a trigger ("sosiego" matches "sos").
    #[default]
    Substring,
    /// Case-insensitive match of whole words only. A keyword must be
    /// bounded by non-word characters or the ends of the text, so keywords
    /// that start or end with punctuation ("sos!", "¡ayuda") work too.
    WholeWord,
}

/// Default trigger phrases.
pub fn default_keywords() -> Vec<String> {
    vec!["ayuda".to_string(), "sos".to_string()]
}

/// Keyword set matcher.
#[derive(Debug, Clone)]
pub struct KeywordPolicy {
    keywords: Vec<String>,
    mode: MatchMode,
    word_pattern: Option<Regex>,
}

impl KeywordPolicy {
    /// Build a policy from trigger phrases. Phrases are trimmed and
    /// lowercased; blank phrases are ignored.
    pub fn new<I, S>(keywords: I, mode: MatchMode) -> Result<Self, regex::Error>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut normalized: Vec<String> = keywords
            .into_iter()
            .map(|k| k.as_ref().trim().to_lowercase())
            .filter(|k| !k.is_empty())
            .collect();
        normalized.sort();
        normalized.dedup();

        let word_pattern = match mode {
            MatchMode::WholeWord if !normalized.is_empty() => {
                let alternation = normalized
                    .iter()
                    .map(|k| regex::escape(k))
                    .collect::<Vec<_>>()
                    .join("|");
                Some(Regex::new(&format!(r"(?i)(?:^|\W)(?:{alternation})(?:\W|$)"))?)
            }
            _ => None,
        };

        Ok(Self {
            keywords: normalized,
            mode,
            word_pattern,
        })
    }

    pub fn keywords(&self) -> &[String] {
        &self.keywords
    }

    pub fn mode(&self) -> MatchMode {
        self.mode
    }
}

impl Default for KeywordPolicy {
    fn default() -> Self {
        Self {
            keywords: default_keywords(),
            mode: MatchMode::Substring,
            word_pattern: None,
        }
    }
}

impl AlertPolicy for KeywordPolicy {
    fn classify(&self, text: &str) -> bool {
        if self.keywords.is_empty() {
            return false;
        }

        match (self.mode, &self.word_pattern) {
            (MatchMode::WholeWord, Some(pattern)) => pattern.is_match(text),
            _ => {
                let lowered = text.to_lowercase();
                self.keywords.iter().any(|k| lowered.contains(k.as_str()))
            }
        }
    }

    fn describe(&self) -> String {
        format!("keywords {:?} ({:?})", self.keywords, self.mode)
    }
}
