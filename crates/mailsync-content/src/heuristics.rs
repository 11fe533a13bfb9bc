//! Keyword and pattern matching over message bodies.
//!
//! Rules are plain data so operators can extend them from the config file.
//! [`HeuristicMatcher::analyze`] never fails; an invalid pattern is dropped
//! when the rules are compiled.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use mailsync_core::ContentInsights;

static HTML_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<[^>]*>").expect("html tag regex"));

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeuristicRules {
    pub meeting_keywords: Vec<String>,
    pub date_patterns: Vec<String>,
    pub action_keywords: Vec<String>,
    pub max_action_items: usize,
}

impl Default for HeuristicRules {
    fn default() -> Self {
        let owned = |items: &[&str]| items.iter().map(|s| s.to_string()).collect();
        Self {
            meeting_keywords: owned(&[
                "meeting",
                "call",
                "appointment",
                "schedule",
                "reunión",
                "cita",
                "llamada",
                "réunion",
                "rendez-vous",
                "appel",
                "besprechung",
                "termin",
                "anruf",
            ]),
            date_patterns: owned(&[
                r"\b\d{1,2}/\d{1,2}/\d{4}\b",
                r"\b\d{1,2}-\d{1,2}-\d{4}\b",
                r"\b\d{4}-\d{2}-\d{2}\b",
            ]),
            action_keywords: owned(&["todo", "action", "follow up", "call", "email", "send", "review"]),
            max_action_items: 5,
        }
    }
}

/// Compiled form of [`HeuristicRules`].
#[derive(Debug, Clone)]
pub struct HeuristicMatcher {
    meeting_keywords: Vec<String>,
    date_patterns: Vec<Regex>,
    action_keywords: Vec<String>,
    max_action_items: usize,
}

impl Default for HeuristicMatcher {
    fn default() -> Self {
        Self::new(&HeuristicRules::default())
    }
}

impl HeuristicMatcher {
    pub fn new(rules: &HeuristicRules) -> Self {
        let lower = |items: &[String]| {
            items
                .iter()
                .map(|s| s.trim().to_lowercase())
                .filter(|s| !s.is_empty())
                .collect()
        };
        let date_patterns = rules
            .date_patterns
            .iter()
            .filter_map(|pattern| match Regex::new(pattern) {
                Ok(re) => Some(re),
                Err(err) => {
                    tracing::warn!(pattern = %pattern, error = %err, "dropping invalid date pattern");
                    None
                }
            })
            .collect();
        Self {
            meeting_keywords: lower(&rules.meeting_keywords),
            date_patterns,
            action_keywords: lower(&rules.action_keywords),
            max_action_items: rules.max_action_items,
        }
    }

    pub fn analyze(&self, plain: Option<&str>, html: Option<&str>) -> ContentInsights {
        let html_text = html.map(|h| HTML_TAG.replace_all(h, " ").into_owned());
        let combined = [plain, html_text.as_deref()]
            .into_iter()
            .flatten()
            .collect::<Vec<_>>()
            .join("\n");
        let lowered = combined.to_lowercase();

        let contains_meeting_info = self
            .meeting_keywords
            .iter()
            .any(|keyword| lowered.contains(keyword.as_str()));

        let mut extracted_dates = Vec::new();
        if contains_meeting_info {
            let mut seen = HashSet::new();
            for pattern in &self.date_patterns {
                for found in pattern.find_iter(&lowered) {
                    if seen.insert(found.as_str().to_string()) {
                        extracted_dates.push(found.as_str().to_string());
                    }
                }
            }
        }

        let action_items = combined
            .split(['.', '!', '?', '\n'])
            .map(str::trim)
            .filter(|sentence| !sentence.is_empty())
            .filter(|sentence| {
                let lowered = sentence.to_lowercase();
                self.action_keywords
                    .iter()
                    .any(|keyword| lowered.contains(keyword.as_str()))
            })
            .take(self.max_action_items)
            .map(str::to_string)
            .collect();

        ContentInsights {
            contains_meeting_info,
            extracted_dates,
            action_items,
        }
    }
}
