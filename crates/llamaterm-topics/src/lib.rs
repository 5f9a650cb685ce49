use llamaterm_core::prompts::{
    build_category_summary_request, build_topic_summary_request, CATEGORY_EDITOR_CONTEXT,
    CATEGORY_PROMPT_VERSION, TOPIC_PROMPT_VERSION,
};
use llamaterm_core::{
    candidate_texts, is_reserved_label, BackendError, Category, ChatBackend, ChatMessage, Topic,
};
use llamaterm_matcher::{
    sanitize_summary, score_summary, CATEGORY_MATCH_THRESHOLD, TOPIC_MATCH_THRESHOLD,
};
use llamaterm_storage::{CategorySelection, ChatStore, StorageError};
use std::fmt;
use std::sync::Mutex;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SummaryStage {
    Topic,
    Category,
}

impl SummaryStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            SummaryStage::Topic => "topic",
            SummaryStage::Category => "category",
        }
    }
}

impl fmt::Display for SummaryStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("{stage} summary was empty after sanitizing")]
    EmptySummary { stage: SummaryStage },
    #[error("{stage} summary '{summary}' is the reserved default label")]
    ReservedLabel {
        stage: SummaryStage,
        summary: String,
    },
    #[error("chat store lock poisoned")]
    StoreLock,
}

#[derive(Debug, Clone)]
pub struct ResolverConfig {
    pub topic_threshold: f64,
    pub category_threshold: f64,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            topic_threshold: TOPIC_MATCH_THRESHOLD,
            category_threshold: CATEGORY_MATCH_THRESHOLD,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicOutcome {
    Matched,
    Created,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CategoryOutcome {
    Implied,
    MatchedTopicSummary,
    MatchedCategorySummary,
    Created,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolutionReport {
    pub topic: Topic,
    pub category: Category,
    pub topic_summary: String,
    pub category_summary: Option<String>,
    pub topic_outcome: TopicOutcome,
    pub category_outcome: CategoryOutcome,
    pub topic_ratio: f64,
    pub prompts_sent: Vec<&'static str>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClassificationReport {
    pub resolution: ResolutionReport,
    pub chats_repointed: usize,
}

enum CategoryChoice {
    Existing(i64),
    Named(String),
}

// The store is only locked between backend calls; candidates are re-read
// after every call.
pub struct TopicResolver<B> {
    backend: B,
    config: ResolverConfig,
}

impl<B: ChatBackend> TopicResolver<B> {
    pub fn new(backend: B, config: ResolverConfig) -> Self {
        Self { backend, config }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    pub async fn resolve(
        &self,
        store: &Mutex<ChatStore>,
        transcript: &[ChatMessage],
        model: &str,
    ) -> Result<ResolutionReport, ResolveError> {
        let known_topics = with_store(store, |db| db.topic_candidates())?;

        let mut messages = transcript.to_vec();
        messages.push(build_topic_summary_request(&candidate_texts(&known_topics)));
        debug!(
            prompt = TOPIC_PROMPT_VERSION,
            candidates = known_topics.len(),
            "requesting topic summary"
        );
        let raw = self.backend.chat(model, &messages).await?;
        let mut prompts_sent = vec![TOPIC_PROMPT_VERSION];
        let topic_summary = clean_summary(SummaryStage::Topic, &raw)?;

        let (topics, categories) =
            with_store(store, |db| Ok((db.topic_candidates()?, db.category_candidates()?)))?;

        let topic_score = score_summary(&topic_summary, &topics);
        let topic_ratio = topic_score.ratio();
        debug!(
            summary = %topic_summary,
            ratio = topic_ratio,
            significant_words = topic_score.significant_words,
            "topic summary scored"
        );

        if let Some(topic) = topic_score
            .selected(self.config.topic_threshold)
            .and_then(|id| topics.iter().find(|topic| topic.id == id))
        {
            let category = with_store(store, |db| {
                db.category(topic.category_id)?
                    .ok_or_else(|| StorageError::NotFound {
                        kind: "category",
                        key: topic.category_id.to_string(),
                    })
            })?;
            info!(topic_id = topic.id, topic = %topic.text, "matched existing topic");
            return Ok(ResolutionReport {
                topic: topic.clone(),
                category,
                topic_summary,
                category_summary: None,
                topic_outcome: TopicOutcome::Matched,
                category_outcome: CategoryOutcome::Implied,
                topic_ratio,
                prompts_sent,
            });
        }

        let mut category_summary = None;
        let (choice, mut category_outcome) = match score_summary(&topic_summary, &categories)
            .selected(self.config.category_threshold)
        {
            Some(id) => (CategoryChoice::Existing(id), CategoryOutcome::MatchedTopicSummary),
            None => {
                let messages = vec![
                    ChatMessage::system(CATEGORY_EDITOR_CONTEXT),
                    build_category_summary_request(&topic_summary, &candidate_texts(&categories)),
                ];
                debug!(prompt = CATEGORY_PROMPT_VERSION, "requesting category summary");
                let raw = self.backend.chat(model, &messages).await?;
                prompts_sent.push(CATEGORY_PROMPT_VERSION);
                let summary = clean_summary(SummaryStage::Category, &raw)?;

                let categories = with_store(store, |db| db.category_candidates())?;
                let matched = score_summary(&summary, &categories)
                    .selected(self.config.category_threshold);
                debug!(summary = %summary, matched = ?matched, "category summary scored");
                category_summary = Some(summary.clone());
                match matched {
                    Some(id) => (
                        CategoryChoice::Existing(id),
                        CategoryOutcome::MatchedCategorySummary,
                    ),
                    None => (CategoryChoice::Named(summary), CategoryOutcome::Created),
                }
            }
        };

        let selection = match &choice {
            CategoryChoice::Existing(id) => CategorySelection::Existing(*id),
            CategoryChoice::Named(text) => CategorySelection::Named(text),
        };
        let write = with_store(store, |db| db.create_topic_in_category(&topic_summary, selection))?;

        if category_outcome == CategoryOutcome::Created && !write.category_created {
            category_outcome = CategoryOutcome::MatchedCategorySummary;
        }
        let topic_outcome = if write.topic_created {
            TopicOutcome::Created
        } else {
            if write.topic.category_id != write.category.id {
                warn!(
                    topic_id = write.topic.id,
                    existing_category = write.topic.category_id,
                    resolved_category = write.category.id,
                    "topic already existed under another category"
                );
            }
            TopicOutcome::Matched
        };

        let category = if write.topic.category_id == write.category.id {
            write.category
        } else {
            let owner = write.topic.category_id;
            with_store(store, |db| {
                db.category(owner)?.ok_or_else(|| StorageError::NotFound {
                    kind: "category",
                    key: owner.to_string(),
                })
            })?
        };

        info!(
            topic_id = write.topic.id,
            category_id = category.id,
            topic_outcome = ?topic_outcome,
            category_outcome = ?category_outcome,
            "topic resolved"
        );

        Ok(ResolutionReport {
            topic: write.topic,
            category,
            topic_summary,
            category_summary,
            topic_outcome,
            category_outcome,
            topic_ratio,
            prompts_sent,
        })
    }

    pub async fn classify_conversation(
        &self,
        store: &Mutex<ChatStore>,
        transcript: &[ChatMessage],
        model: &str,
        chat_ids: &[i64],
    ) -> Result<ClassificationReport, ResolveError> {
        let resolution = self.resolve(store, transcript, model).await?;
        let topic_id = resolution.topic.id;
        let chats_repointed = with_store(store, |db| db.update_chat_topics(chat_ids, topic_id))?;
        info!(topic_id, chats_repointed, "conversation classified");
        Ok(ClassificationReport {
            resolution,
            chats_repointed,
        })
    }
}

fn clean_summary(stage: SummaryStage, raw: &str) -> Result<String, ResolveError> {
    let summary = sanitize_summary(raw);
    if summary.is_empty() {
        return Err(ResolveError::EmptySummary { stage });
    }
    if is_reserved_label(&summary) {
        return Err(ResolveError::ReservedLabel { stage, summary });
    }
    Ok(summary)
}

fn with_store<R>(
    store: &Mutex<ChatStore>,
    f: impl FnOnce(&mut ChatStore) -> Result<R, StorageError>,
) -> Result<R, ResolveError> {
    let mut guard = store.lock().map_err(|_| ResolveError::StoreLock)?;
    Ok(f(&mut guard)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_summary_rejects_empty_and_reserved_replies() {
        assert!(matches!(
            clean_summary(SummaryStage::Topic, " ** "),
            Err(ResolveError::EmptySummary {
                stage: SummaryStage::Topic
            })
        ));
        assert!(matches!(
            clean_summary(SummaryStage::Category, "\"Default.\""),
            Err(ResolveError::ReservedLabel {
                stage: SummaryStage::Category,
                ..
            })
        ));
        assert_eq!(
            clean_summary(SummaryStage::Topic, "Rust: Axum!").expect("clean"),
            "Rust Axum"
        );
    }

    #[test]
    fn default_config_uses_the_documented_thresholds() {
        let config = ResolverConfig::default();
        assert_eq!(config.topic_threshold, 0.5);
        assert_eq!(config.category_threshold, 0.25);
    }
}
