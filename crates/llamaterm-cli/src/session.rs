use anyhow::{anyhow, bail, Context as _, Result};
use llamaterm_core::{
    rebuild_transcript, Chat, ChatBackend, ChatDraft, ChatMessage, Context, LlmModel,
    DEFAULT_TOPIC_ID,
};
use llamaterm_storage::ChatStore;
use llamaterm_topics::{ClassificationReport, TopicResolver};
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

pub struct ChatSession {
    context: Context,
    model: LlmModel,
    topic_id: i64,
    transcript: Vec<ChatMessage>,
    chat_ids: Vec<i64>,
}

impl ChatSession {
    pub fn new(context: Context, model: LlmModel, topic_id: i64) -> Self {
        let transcript = vec![context.as_message()];
        Self {
            context,
            model,
            topic_id,
            transcript,
            chat_ids: Vec::new(),
        }
    }

    pub fn resume(store: &ChatStore, topic_id: i64, fallback_model: LlmModel) -> Result<Self> {
        if topic_id == DEFAULT_TOPIC_ID {
            bail!("unclassified chats come from separate conversations and cannot be resumed");
        }
        let chats = store.chats_for_topic(topic_id)?;
        let Some(context_id) = most_common(chats.iter().map(|chat| chat.context_id)) else {
            bail!("topic {topic_id} has no chats to resume");
        };
        let context = store
            .context(context_id)?
            .with_context(|| format!("context {context_id} not found"))?;

        let model = match most_common(chats.iter().map(|chat| chat.llm_model_id)) {
            Some(model_id) => store
                .model(model_id)?
                .filter(|model| model.currently_available)
                .unwrap_or(fallback_model),
            None => fallback_model,
        };

        info!(topic_id, chats = chats.len(), context_id, "session resumed");
        Ok(Self {
            transcript: rebuild_transcript(Some(&context), &chats),
            chat_ids: chats.iter().map(|chat| chat.id).collect(),
            context,
            model,
            topic_id,
        })
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn model(&self) -> &LlmModel {
        &self.model
    }

    pub fn topic_id(&self) -> i64 {
        self.topic_id
    }

    pub fn transcript(&self) -> &[ChatMessage] {
        &self.transcript
    }

    pub fn chat_ids(&self) -> &[i64] {
        &self.chat_ids
    }

    pub fn set_context(&mut self, context: Context) {
        if context.id == self.context.id {
            return;
        }
        self.transcript.push(context.as_message());
        self.context = context;
    }

    pub fn set_model(&mut self, model: LlmModel) {
        self.model = model;
    }

    // The transcript only changes once the answer is stored.
    pub async fn ask<B: ChatBackend>(
        &mut self,
        store: &Mutex<ChatStore>,
        backend: &B,
        question: String,
    ) -> Result<Chat> {
        let user = ChatMessage::user(question.clone());
        let mut request = self.transcript.clone();
        request.push(user.clone());

        let answer = backend
            .chat(&self.model.name, &request)
            .await
            .with_context(|| format!("{} request failed", backend.backend_name()))?;

        let chat = lock(store)?.save_chat(&ChatDraft {
            question,
            answer: answer.clone(),
            context_id: self.context.id,
            topic_id: self.topic_id,
            llm_model_id: self.model.id,
        })?;
        debug!(chat_id = chat.id, topic_id = self.topic_id, "turn saved");

        self.transcript.push(user);
        self.transcript.push(ChatMessage::assistant(answer));
        self.chat_ids.push(chat.id);
        Ok(chat)
    }

    pub fn needs_classification(&self) -> bool {
        self.topic_id == DEFAULT_TOPIC_ID && !self.chat_ids.is_empty()
    }

    pub async fn classify<B: ChatBackend>(
        &mut self,
        store: &Mutex<ChatStore>,
        resolver: &TopicResolver<B>,
    ) -> Result<Option<ClassificationReport>> {
        if !self.needs_classification() {
            return Ok(None);
        }
        let report = resolver
            .classify_conversation(store, &self.transcript, &self.model.name, &self.chat_ids)
            .await?;
        self.topic_id = report.resolution.topic.id;
        Ok(Some(report))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClassificationBatch {
    pub transcript: Vec<ChatMessage>,
    pub chat_ids: Vec<i64>,
}

pub fn plan_classification(
    store: &ChatStore,
    chat_ids: &[i64],
) -> Result<Vec<ClassificationBatch>> {
    let chats = if chat_ids.is_empty() {
        store.chats_for_topic(DEFAULT_TOPIC_ID)?
    } else {
        let mut chats = Vec::with_capacity(chat_ids.len());
        for id in chat_ids {
            let chat = store
                .chat(*id)?
                .with_context(|| format!("chat {id} not found"))?;
            if chat.is_unclassified() {
                chats.push(chat);
            } else {
                info!(
                    chat_id = chat.id,
                    topic_id = chat.topic_id,
                    "chat already classified, skipping"
                );
            }
        }
        chats
    };

    let groups = if chat_ids.is_empty() {
        chats.into_iter().map(|chat| vec![chat]).collect::<Vec<_>>()
    } else if chats.is_empty() {
        Vec::new()
    } else {
        vec![chats]
    };

    groups
        .into_iter()
        .map(|chats| -> Result<ClassificationBatch> {
            let context = match most_common(chats.iter().map(|chat| chat.context_id)) {
                Some(context_id) => store.context(context_id)?,
                None => None,
            };
            Ok(ClassificationBatch {
                transcript: rebuild_transcript(context.as_ref(), &chats),
                chat_ids: chats.iter().map(|chat| chat.id).collect(),
            })
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionInput {
    Question(String),
    AttachFile(PathBuf),
    Save(PathBuf),
    UseContext(i64),
    UseModel(i64),
    Quit,
    Help,
    Unknown(String),
}

pub fn parse_input(line: &str) -> Option<SessionInput> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let Some(command) = line.strip_prefix('/') else {
        return Some(SessionInput::Question(line.to_string()));
    };

    let (name, arg) = match command.split_once(char::is_whitespace) {
        Some((name, arg)) => (name, arg.trim()),
        None => (command, ""),
    };
    let input = match (name, arg) {
        ("quit" | "exit" | "q", _) => SessionInput::Quit,
        ("help", _) => SessionInput::Help,
        ("file", path) if !path.is_empty() => SessionInput::AttachFile(PathBuf::from(path)),
        ("save", path) if !path.is_empty() => SessionInput::Save(PathBuf::from(path)),
        ("context", id) => match id.parse() {
            Ok(id) => SessionInput::UseContext(id),
            Err(_) => SessionInput::Unknown(line.to_string()),
        },
        ("model", id) => match id.parse() {
            Ok(id) => SessionInput::UseModel(id),
            Err(_) => SessionInput::Unknown(line.to_string()),
        },
        _ => SessionInput::Unknown(line.to_string()),
    };
    Some(input)
}

pub fn most_common<I: IntoIterator<Item = i64>>(values: I) -> Option<i64> {
    let mut counts: Vec<(i64, usize)> = Vec::new();
    for value in values {
        match counts.iter_mut().find(|(seen, _)| *seen == value) {
            Some((_, count)) => *count += 1,
            None => counts.push((value, 1)),
        }
    }
    let mut best: Option<(i64, usize)> = None;
    for (value, count) in counts {
        if best.map_or(true, |(_, top)| count > top) {
            best = Some((value, count));
        }
    }
    best.map(|(value, _)| value)
}

pub fn lock(store: &Mutex<ChatStore>) -> Result<MutexGuard<'_, ChatStore>> {
    store.lock().map_err(|_| anyhow!("chat store lock poisoned"))
}
