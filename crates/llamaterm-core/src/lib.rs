use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub mod backend;
pub mod prompts;

pub use backend::{extract_reply, BackendError, ChatBackend, ChatMessage, ConversationRole, ReplyKey};

pub const DEFAULT_SERVER_URL: &str = "http://localhost:11434";
pub const DEFAULT_LABEL: &str = "default";
pub const DEFAULT_CATEGORY_ID: i64 = 1;
pub const DEFAULT_TOPIC_ID: i64 = 1;
pub const DEFAULT_CONTEXT_ID: i64 = 1;
pub const PLACEHOLDER_MODEL_NAME: &str = "Temp_fake";

pub trait Labeled {
    fn id(&self) -> i64;
    fn text(&self) -> &str;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Category {
    pub id: i64,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

impl Category {
    pub fn is_default(&self) -> bool {
        self.id == DEFAULT_CATEGORY_ID
    }
}

impl Labeled for Category {
    fn id(&self) -> i64 {
        self.id
    }

    fn text(&self) -> &str {
        &self.text
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Topic {
    pub id: i64,
    pub text: String,
    pub category_id: i64,
    pub created_at: DateTime<Utc>,
}

impl Topic {
    pub fn is_default(&self) -> bool {
        self.id == DEFAULT_TOPIC_ID
    }
}

impl Labeled for Topic {
    fn id(&self) -> i64 {
        self.id
    }

    fn text(&self) -> &str {
        &self.text
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Context {
    pub id: i64,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

impl Context {
    pub fn as_message(&self) -> ChatMessage {
        ChatMessage::system(self.text.clone())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LlmModel {
    pub id: i64,
    pub name: String,
    pub size: i64,
    pub specialization: Specialization,
    pub modified_at: DateTime<Utc>,
    pub currently_available: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Specialization {
    #[default]
    General,
    Coding,
    Vision,
    Embedding,
    Thinking,
}

impl Specialization {
    pub fn as_str(&self) -> &'static str {
        match self {
            Specialization::General => "general",
            Specialization::Coding => "coding",
            Specialization::Vision => "vision",
            Specialization::Embedding => "embedding",
            Specialization::Thinking => "thinking",
        }
    }
}

impl fmt::Display for Specialization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Specialization {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        match normalized.as_str() {
            "general" | "completion" => Ok(Specialization::General),
            "coding" | "code" => Ok(Specialization::Coding),
            "vision" => Ok(Specialization::Vision),
            "embedding" | "embed" => Ok(Specialization::Embedding),
            "thinking" => Ok(Specialization::Thinking),
            other => Err(format!("Unknown specialization: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Chat {
    pub id: i64,
    pub question: String,
    pub answer: String,
    pub context_id: i64,
    pub topic_id: i64,
    pub llm_model_id: i64,
    pub created_at: DateTime<Utc>,
}

impl Chat {
    pub fn is_unclassified(&self) -> bool {
        self.topic_id == DEFAULT_TOPIC_ID
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatDraft {
    pub question: String,
    pub answer: String,
    pub context_id: i64,
    pub topic_id: i64,
    pub llm_model_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Settings {
    pub url: String,
    pub llm_model_id: Option<i64>,
    pub context_id: i64,
    pub topic_id: i64,
    pub updated_at: DateTime<Utc>,
}

pub fn candidate_texts<T: Labeled>(items: &[T]) -> Vec<String> {
    items
        .iter()
        .filter(|item| !is_reserved_label(item.text()))
        .map(|item| item.text().to_string())
        .collect()
}

pub fn is_reserved_label(text: &str) -> bool {
    text.trim().eq_ignore_ascii_case(DEFAULT_LABEL)
}

pub fn rebuild_transcript(context: Option<&Context>, chats: &[Chat]) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(chats.len() * 2 + 1);
    if let Some(context) = context {
        messages.push(context.as_message());
    }
    for chat in chats {
        messages.push(ChatMessage::user(chat.question.clone()));
        messages.push(ChatMessage::assistant(chat.answer.clone()));
    }
    messages
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0)
            .single()
            .expect("valid timestamp")
    }

    fn topic(id: i64, text: &str) -> Topic {
        Topic {
            id,
            text: text.to_string(),
            category_id: DEFAULT_CATEGORY_ID,
            created_at: ts(),
        }
    }

    #[test]
    fn candidate_texts_skip_the_default_sentinel() {
        let topics = vec![topic(1, "default"), topic(2, "Dad Jokes"), topic(3, "Rust Axum")];
        assert_eq!(
            candidate_texts(&topics),
            vec!["Dad Jokes".to_string(), "Rust Axum".to_string()]
        );
    }

    #[test]
    fn rebuilt_transcript_starts_with_context_and_alternates_turns() {
        let context = Context {
            id: 1,
            text: "be brief".to_string(),
            created_at: ts(),
        };
        let chats = vec![
            Chat {
                id: 10,
                question: "why?".to_string(),
                answer: "because".to_string(),
                context_id: 1,
                topic_id: DEFAULT_TOPIC_ID,
                llm_model_id: 1,
                created_at: ts(),
            },
            Chat {
                id: 11,
                question: "really?".to_string(),
                answer: "yes".to_string(),
                context_id: 1,
                topic_id: DEFAULT_TOPIC_ID,
                llm_model_id: 1,
                created_at: ts(),
            },
        ];

        let transcript = rebuild_transcript(Some(&context), &chats);
        let roles = transcript.iter().map(|m| m.role).collect::<Vec<_>>();
        assert_eq!(
            roles,
            vec![
                ConversationRole::System,
                ConversationRole::User,
                ConversationRole::Assistant,
                ConversationRole::User,
                ConversationRole::Assistant,
            ]
        );
        assert_eq!(transcript[3].content, "really?");
        assert_eq!(rebuild_transcript(None, &chats).len(), 4);
    }

    #[test]
    fn reserved_label_check_ignores_case_and_padding() {
        assert!(is_reserved_label("default"));
        assert!(is_reserved_label("  Default "));
        assert!(!is_reserved_label("defaults"));
    }

    #[test]
    fn specialization_parses_server_capability_names() {
        assert_eq!("vision".parse::<Specialization>(), Ok(Specialization::Vision));
        assert_eq!("embed".parse::<Specialization>(), Ok(Specialization::Embedding));
        assert_eq!("completion".parse::<Specialization>(), Ok(Specialization::General));
        assert!("insert".parse::<Specialization>().is_err());
        assert_eq!(Specialization::Coding.to_string(), "coding");
    }
}
