//! Builds a bounded context bundle from conversation history and related knowledge

use crate::config::ContextConfig;
use crate::conversation_memory::UserMemory;
use crate::knowledge::KnowledgeMatch;
use crate::memory::{LearningStyle, Role};
use crate::profile_analytics::{estimate_expertise, ExpertiseLevel};
use crate::utils::{extract_keywords, weighted_similarity, KeywordSet, TextUtils};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt::Write as _;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ContextSource {
    Conversation { role: Role },
    Knowledge { entry_id: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContextItem {
    pub source: ContextSource,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub relevance: f32,
}

/// What the answer service should know about the learner.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProfileSummary {
    pub name: Option<String>,
    pub learning_style: LearningStyle,
    pub difficulty_level: String,
    pub accessibility_needs: Vec<String>,
    pub top_topic: Option<String>,
    pub expertise: ExpertiseLevel,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContextBundle {
    pub query: String,
    /// Chronological
    pub items: Vec<ContextItem>,
    pub profile: Option<ProfileSummary>,
}

impl ContextBundle {
    pub fn empty(query: &str) -> Self {
        Self {
            query: query.to_string(),
            items: Vec::new(),
            profile: None,
        }
    }

    pub fn total_chars(&self) -> usize {
        self.items.iter().map(|i| i.content.chars().count()).sum()
    }

    /// Text block handed to the answer service alongside the query.
    pub fn render_prompt(&self) -> String {
        let mut prompt = String::from("You are AIVI, a patient and accessible learning assistant.\n");

        if let Some(profile) = &self.profile {
            let _ = write!(
                prompt,
                "\nLearner: difficulty {}, expertise {}",
                profile.difficulty_level,
                profile.expertise.as_str()
            );
            if profile.learning_style != LearningStyle::Unset {
                let _ = write!(prompt, ", {} learner", profile.learning_style.as_str());
            }
            if let Some(topic) = &profile.top_topic {
                let _ = write!(prompt, ", most interested in {}", topic);
            }
            prompt.push_str(".\n");
            if !profile.accessibility_needs.is_empty() {
                let _ = writeln!(prompt, "Accessibility needs: {}.", profile.accessibility_needs.join(", "));
            }
        }

        let (knowledge, history): (Vec<&ContextItem>, Vec<&ContextItem>) = self
            .items
            .iter()
            .partition(|i| matches!(i.source, ContextSource::Knowledge { .. }));

        if !history.is_empty() {
            prompt.push_str("\nEarlier in our conversations:\n");
            for item in history {
                if let ContextSource::Conversation { role } = &item.source {
                    let _ = writeln!(prompt, "[{}] {}", role, item.content);
                }
            }
        }
        if !knowledge.is_empty() {
            prompt.push_str("\nReference notes:\n");
            for item in knowledge {
                let _ = writeln!(prompt, "- {}", item.content);
            }
        }
        prompt
    }
}

struct Candidate {
    item: ContextItem,
    /// Position in the user's history; knowledge sorts by timestamp only
    order: usize,
}

pub struct ContextBuilder {
    config: ContextConfig,
}

impl ContextBuilder {
    pub fn new(config: ContextConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    /// Selects recent and relevant history plus related knowledge, then trims to
    /// `max_chars` by dropping the least relevant items.
    pub fn build(&self, query: &str, memory: Option<&UserMemory>, knowledge: &[KnowledgeMatch]) -> ContextBundle {
        let query_keywords = extract_keywords(query);
        let mut candidates = Vec::new();

        if let Some(memory) = memory {
            self.collect_history(&query_keywords, memory, &mut candidates);
        }
        let history_len = candidates.len();
        for m in knowledge.iter().take(self.config.knowledge_snippets) {
            candidates.push(Candidate {
                item: ContextItem {
                    source: ContextSource::Knowledge {
                        entry_id: m.entry.id.clone(),
                    },
                    content: format!("{} {}", m.entry.question, m.entry.answer),
                    timestamp: m.entry.created_at,
                    relevance: m.score,
                },
                order: usize::MAX,
            });
        }

        let mut candidates = merge_duplicates(candidates);

        // Most relevant first, newer first among equals
        candidates.sort_by(|a, b| {
            b.item
                .relevance
                .total_cmp(&a.item.relevance)
                .then(b.item.timestamp.cmp(&a.item.timestamp))
                .then(b.order.cmp(&a.order))
        });

        let mut kept = Vec::new();
        let mut used = 0;
        for mut candidate in candidates {
            let len = candidate.item.content.chars().count();
            if used + len <= self.config.max_chars {
                used += len;
                kept.push(candidate);
            } else if kept.is_empty() && self.config.max_chars > 0 {
                candidate.item.content =
                    TextUtils::truncate_with_ellipsis(&candidate.item.content, self.config.max_chars).into_owned();
                used = candidate.item.content.chars().count();
                kept.push(candidate);
                break;
            } else {
                break;
            }
        }

        kept.sort_by(|a, b| a.item.timestamp.cmp(&b.item.timestamp).then(a.order.cmp(&b.order)));
        debug!(
            "Built context with {} of {} history items and {} chars",
            kept.len(),
            history_len,
            used
        );

        ContextBundle {
            query: query.to_string(),
            items: kept.into_iter().map(|c| c.item).collect(),
            profile: memory.map(|m| summarize_profile(m, query)),
        }
    }

    fn collect_history(&self, query_keywords: &KeywordSet, memory: &UserMemory, out: &mut Vec<Candidate>) {
        let empty = KeywordSet::new();
        let scored: Vec<(usize, &crate::memory::ConversationMessage, f32)> = memory
            .messages()
            .enumerate()
            .map(|(order, (_, message))| {
                let relevance = weighted_similarity(query_keywords, &extract_keywords(&message.content), &empty);
                (order, message, relevance)
            })
            .collect();

        let recent_start = scored.len().saturating_sub(self.config.recent_messages);
        let mut older: Vec<&(usize, &crate::memory::ConversationMessage, f32)> =
            scored[..recent_start].iter().filter(|(_, _, r)| *r > 0.0).collect();
        older.sort_by(|a, b| b.2.total_cmp(&a.2).then(b.0.cmp(&a.0)));
        older.truncate(self.config.relevant_messages);

        for (order, message, relevance) in older.into_iter().chain(scored[recent_start..].iter()) {
            out.push(Candidate {
                item: ContextItem {
                    source: ContextSource::Conversation { role: message.role },
                    content: message.content.clone(),
                    timestamp: message.timestamp,
                    relevance: *relevance,
                },
                order: *order,
            });
        }
    }
}

/// Same text counts once; the copy kept carries the highest relevance and the latest position.
fn merge_duplicates(candidates: Vec<Candidate>) -> Vec<Candidate> {
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut merged: Vec<Candidate> = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        let key = TextUtils::dedup_key(&candidate.item.content);
        match index.get(&key) {
            Some(&i) => {
                let existing = &mut merged[i];
                existing.item.relevance = existing.item.relevance.max(candidate.item.relevance);
                if (candidate.item.timestamp, candidate.order) > (existing.item.timestamp, existing.order) {
                    existing.item.timestamp = candidate.item.timestamp;
                    existing.order = candidate.order;
                }
            }
            None => {
                index.insert(key, merged.len());
                merged.push(candidate);
            }
        }
    }
    merged
}

fn summarize_profile(memory: &UserMemory, query: &str) -> ProfileSummary {
    let profile = &memory.profile;
    ProfileSummary {
        name: profile.name.clone(),
        learning_style: profile.learning_style,
        difficulty_level: profile.difficulty_level.clone(),
        accessibility_needs: profile.accessibility_needs.iter().cloned().collect(),
        top_topic: profile.top_topic().map(str::to_string),
        expertise: estimate_expertise(profile, query),
    }
}
