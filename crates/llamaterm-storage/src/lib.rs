use chrono::{DateTime, Utc};
use llamaterm_core::{
    Category, Chat, ChatDraft, Context, LlmModel, Settings, Specialization, Topic,
    DEFAULT_CATEGORY_ID, DEFAULT_CONTEXT_ID, DEFAULT_SERVER_URL, DEFAULT_TOPIC_ID,
    PLACEHOLDER_MODEL_NAME,
};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

pub const CHAT_SCHEMA_VERSION: i64 = 1;

const DEFAULT_CONTEXTS: [&str; 2] = [
    "You are a friendly and helpful assistant, always aiming to provide informative and comprehensive answers.",
    "You are a friendly senior developer assisting a jounior developer by providing code examples and comprehensive explanations.",
];

const DEFAULT_CATEGORIES: [&str; 7] = [
    "default",
    "Jokes",
    "Python",
    "Ruby",
    "Software Design",
    "AWS",
    "Historical Figures",
];

const DEFAULT_TOPICS: [(&str, i64); 3] = [("default", 1), ("Dad Jokes", 2), ("Python Textual", 3)];

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("unsupported schema version {found}, max supported {supported}")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },
    #[error("{kind} text cannot be empty")]
    EmptyText { kind: &'static str },
    #[error("{kind} '{text}' already exists")]
    DuplicateText { kind: &'static str, text: String },
    #[error("{kind} {id} is reserved and cannot be modified")]
    ReservedRecord { kind: &'static str, id: i64 },
    #[error("{kind} not found: {key}")]
    NotFound { kind: &'static str, key: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetOrCreate<T> {
    pub record: T,
    pub created: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CategorySelection<'a> {
    Existing(i64),
    Named(&'a str),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaxonomyWrite {
    pub topic: Topic,
    pub topic_created: bool,
    pub category: Category,
    pub category_created: bool,
}

pub struct ChatStore {
    conn: Connection,
}

impl ChatStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self, StorageError> {
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    pub fn schema_version(&self) -> Result<i64, StorageError> {
        Ok(self
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    pub fn migrate(&self) -> Result<(), StorageError> {
        let current = self.schema_version()?;
        if current > CHAT_SCHEMA_VERSION {
            return Err(StorageError::UnsupportedSchemaVersion {
                found: current,
                supported: CHAT_SCHEMA_VERSION,
            });
        }

        if current < 1 {
            let sql = include_str!("../migrations/0001_chat_schema.sql");
            self.conn.execute_batch(sql)?;
            seed_defaults(&self.conn)?;
            self.conn
                .execute("PRAGMA user_version = 1", [])
                .map(|_| ())?;
            info!(version = 1, "chat schema created");
        }

        Ok(())
    }

    pub fn table_exists(&self, table: &str) -> Result<bool, StorageError> {
        let found = self
            .conn
            .query_row(
                "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
                params![table],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    // Taxonomy. Listing order is creation order, which is also the order the
    // matcher sees candidates in and therefore decides its tie-break.

    pub fn categories(&self) -> Result<Vec<Category>, StorageError> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, text, created_at FROM categories ORDER BY id ASC")?;
        let rows = stmt.query_map([], category_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn category_candidates(&self) -> Result<Vec<Category>, StorageError> {
        Ok(self
            .categories()?
            .into_iter()
            .filter(|category| !category.is_default())
            .collect())
    }

    pub fn category(&self, id: i64) -> Result<Option<Category>, StorageError> {
        category_by_id(&self.conn, id)
    }

    pub fn category_by_text(&self, text: &str) -> Result<Option<Category>, StorageError> {
        category_by_text(&self.conn, text.trim())
    }

    pub fn get_or_create_category(
        &self,
        text: &str,
    ) -> Result<GetOrCreate<Category>, StorageError> {
        get_or_create_category_on(&self.conn, text)
    }

    pub fn rename_category(&self, id: i64, text: &str) -> Result<Category, StorageError> {
        if id == DEFAULT_CATEGORY_ID {
            return Err(StorageError::ReservedRecord {
                kind: "category",
                id,
            });
        }
        let text = clean_text("category", text)?;
        let changes = self
            .conn
            .execute(
                "UPDATE categories SET text = ?1 WHERE id = ?2",
                params![text, id],
            )
            .map_err(|err| unique_violation("category", text, err))?;
        if changes == 0 {
            return Err(not_found("category", id));
        }
        category_by_id(&self.conn, id)?.ok_or_else(|| not_found("category", id))
    }

    pub fn topics(&self) -> Result<Vec<Topic>, StorageError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, text, category_id, created_at FROM topics ORDER BY id ASC",
        )?;
        let rows = stmt.query_map([], topic_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn topic_candidates(&self) -> Result<Vec<Topic>, StorageError> {
        Ok(self
            .topics()?
            .into_iter()
            .filter(|topic| !topic.is_default())
            .collect())
    }

    pub fn topics_for_category(&self, category_id: i64) -> Result<Vec<Topic>, StorageError> {
        let mut stmt = self.conn.prepare(
            "
            SELECT id, text, category_id, created_at
            FROM topics
            WHERE category_id = ?1
            ORDER BY id ASC
            ",
        )?;
        let rows = stmt.query_map(params![category_id], topic_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn topic(&self, id: i64) -> Result<Option<Topic>, StorageError> {
        topic_by_id(&self.conn, id)
    }

    pub fn topic_by_text(&self, text: &str) -> Result<Option<Topic>, StorageError> {
        topic_by_text(&self.conn, text.trim())
    }

    pub fn get_or_create_topic(
        &self,
        text: &str,
        category_id: i64,
    ) -> Result<GetOrCreate<Topic>, StorageError> {
        get_or_create_topic_on(&self.conn, text, category_id)
    }

    // Category and topic are written in one immediate transaction.
    pub fn create_topic_in_category(
        &mut self,
        topic_text: &str,
        category: CategorySelection<'_>,
    ) -> Result<TaxonomyWrite, StorageError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        let category = match category {
            CategorySelection::Existing(id) => GetOrCreate {
                record: category_by_id(&tx, id)?.ok_or_else(|| not_found("category", id))?,
                created: false,
            },
            CategorySelection::Named(text) => get_or_create_category_on(&tx, text)?,
        };
        let topic = get_or_create_topic_on(&tx, topic_text, category.record.id)?;
        tx.commit()?;

        Ok(TaxonomyWrite {
            topic: topic.record,
            topic_created: topic.created,
            category: category.record,
            category_created: category.created,
        })
    }

    pub fn rename_topic(&self, id: i64, text: &str) -> Result<Topic, StorageError> {
        if id == DEFAULT_TOPIC_ID {
            return Err(StorageError::ReservedRecord { kind: "topic", id });
        }
        let text = clean_text("topic", text)?;
        let changes = self
            .conn
            .execute("UPDATE topics SET text = ?1 WHERE id = ?2", params![text, id])
            .map_err(|err| unique_violation("topic", text, err))?;
        if changes == 0 {
            return Err(not_found("topic", id));
        }
        topic_by_id(&self.conn, id)?.ok_or_else(|| not_found("topic", id))
    }

    pub fn move_topic(&self, id: i64, category_id: i64) -> Result<Topic, StorageError> {
        if id == DEFAULT_TOPIC_ID {
            return Err(StorageError::ReservedRecord { kind: "topic", id });
        }
        if category_by_id(&self.conn, category_id)?.is_none() {
            return Err(not_found("category", category_id));
        }
        let changes = self.conn.execute(
            "UPDATE topics SET category_id = ?1 WHERE id = ?2",
            params![category_id, id],
        )?;
        if changes == 0 {
            return Err(not_found("topic", id));
        }
        topic_by_id(&self.conn, id)?.ok_or_else(|| not_found("topic", id))
    }

    pub fn contexts(&self) -> Result<Vec<Context>, StorageError> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, text, created_at FROM contexts ORDER BY id ASC")?;
        let rows = stmt.query_map([], context_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn context(&self, id: i64) -> Result<Option<Context>, StorageError> {
        Ok(self
            .conn
            .query_row(
                "SELECT id, text, created_at FROM contexts WHERE id = ?1",
                params![id],
                context_from_row,
            )
            .optional()?)
    }

    pub fn create_context(&self, text: &str) -> Result<Context, StorageError> {
        let text = clean_text("context", text)?;
        self.conn
            .execute(
                "INSERT INTO contexts (text, created_at) VALUES (?1, ?2)",
                params![text, Utc::now().to_rfc3339()],
            )
            .map_err(|err| unique_violation("context", text, err))?;
        let id = self.conn.last_insert_rowid();
        self.context(id)?.ok_or_else(|| not_found("context", id))
    }

    pub fn update_context(&self, id: i64, text: &str) -> Result<Context, StorageError> {
        let text = clean_text("context", text)?;
        let changes = self
            .conn
            .execute(
                "UPDATE contexts SET text = ?1 WHERE id = ?2",
                params![text, id],
            )
            .map_err(|err| unique_violation("context", text, err))?;
        if changes == 0 {
            return Err(not_found("context", id));
        }
        self.context(id)?.ok_or_else(|| not_found("context", id))
    }

    pub fn save_chat(&self, draft: &ChatDraft) -> Result<Chat, StorageError> {
        self.conn.execute(
            "
            INSERT INTO chats (
                question,
                answer,
                context_id,
                topic_id,
                llm_model_id,
                created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ",
            params![
                draft.question,
                draft.answer,
                draft.context_id,
                draft.topic_id,
                draft.llm_model_id,
                Utc::now().to_rfc3339(),
            ],
        )?;
        let id = self.conn.last_insert_rowid();
        debug!(chat_id = id, topic_id = draft.topic_id, "chat saved");
        self.chat(id)?.ok_or_else(|| not_found("chat", id))
    }

    pub fn chat(&self, id: i64) -> Result<Option<Chat>, StorageError> {
        Ok(self
            .conn
            .query_row(
                "
                SELECT id, question, answer, context_id, topic_id, llm_model_id, created_at
                FROM chats
                WHERE id = ?1
                ",
                params![id],
                chat_from_row,
            )
            .optional()?)
    }

    pub fn chats_for_topic(&self, topic_id: i64) -> Result<Vec<Chat>, StorageError> {
        self.chats_where("topic_id", topic_id)
    }

    pub fn chats_for_context(&self, context_id: i64) -> Result<Vec<Chat>, StorageError> {
        self.chats_where("context_id", context_id)
    }

    fn chats_where(&self, column: &'static str, value: i64) -> Result<Vec<Chat>, StorageError> {
        let sql = format!(
            "
            SELECT id, question, answer, context_id, topic_id, llm_model_id, created_at
            FROM chats
            WHERE {column} = ?1
            ORDER BY id ASC
            "
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![value], chat_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn update_chat_topic(&self, chat_id: i64, topic_id: i64) -> Result<bool, StorageError> {
        let changes = self.conn.execute(
            "UPDATE chats SET topic_id = ?1 WHERE id = ?2",
            params![topic_id, chat_id],
        )?;
        Ok(changes > 0)
    }

    pub fn update_chat_topics(
        &mut self,
        chat_ids: &[i64],
        topic_id: i64,
    ) -> Result<usize, StorageError> {
        if topic_by_id(&self.conn, topic_id)?.is_none() {
            return Err(not_found("topic", topic_id));
        }

        let tx = self.conn.transaction()?;
        let mut changed = 0usize;
        {
            let mut stmt = tx.prepare("UPDATE chats SET topic_id = ?1 WHERE id = ?2")?;
            for chat_id in chat_ids {
                changed += stmt.execute(params![topic_id, chat_id])?;
            }
        }
        tx.commit()?;
        Ok(changed)
    }

    pub fn models(&self) -> Result<Vec<LlmModel>, StorageError> {
        self.models_filtered(false)
    }

    pub fn available_models(&self) -> Result<Vec<LlmModel>, StorageError> {
        self.models_filtered(true)
    }

    fn models_filtered(&self, available_only: bool) -> Result<Vec<LlmModel>, StorageError> {
        let sql = if available_only {
            "
            SELECT id, name, size, specialization, modified_at, currently_available
            FROM llm_models
            WHERE currently_available = 1
            ORDER BY id ASC
            "
        } else {
            "
            SELECT id, name, size, specialization, modified_at, currently_available
            FROM llm_models
            ORDER BY id ASC
            "
        };
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map([], model_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn model(&self, id: i64) -> Result<Option<LlmModel>, StorageError> {
        Ok(self
            .conn
            .query_row(
                "
                SELECT id, name, size, specialization, modified_at, currently_available
                FROM llm_models
                WHERE id = ?1
                ",
                params![id],
                model_from_row,
            )
            .optional()?)
    }

    pub fn model_by_name(&self, name: &str) -> Result<Option<LlmModel>, StorageError> {
        Ok(self
            .conn
            .query_row(
                "
                SELECT id, name, size, specialization, modified_at, currently_available
                FROM llm_models
                WHERE name = ?1
                ",
                params![name],
                model_from_row,
            )
            .optional()?)
    }

    pub fn upsert_model(
        &self,
        name: &str,
        size: i64,
        specialization: Specialization,
    ) -> Result<LlmModel, StorageError> {
        let name = clean_text("model", name)?;
        self.conn.execute(
            "
            INSERT INTO llm_models (
                name,
                size,
                specialization,
                modified_at,
                currently_available
            ) VALUES (?1, ?2, ?3, ?4, 1)
            ON CONFLICT(name) DO UPDATE SET
                size=excluded.size,
                specialization=excluded.specialization,
                modified_at=excluded.modified_at,
                currently_available=1
            ",
            params![name, size, specialization.as_str(), Utc::now().to_rfc3339()],
        )?;
        self.model_by_name(name)?
            .ok_or_else(|| StorageError::NotFound {
                kind: "model",
                key: name.to_string(),
            })
    }

    pub fn set_model_availability(&self, id: i64, available: bool) -> Result<bool, StorageError> {
        let changes = self.conn.execute(
            "UPDATE llm_models SET currently_available = ?1 WHERE id = ?2",
            params![available, id],
        )?;
        Ok(changes > 0)
    }

    pub fn ensure_placeholder_model(&self) -> Result<LlmModel, StorageError> {
        if let Some(existing) = self.model_by_name(PLACEHOLDER_MODEL_NAME)? {
            return Ok(existing);
        }
        info!("no models found, registering placeholder model");
        self.upsert_model(PLACEHOLDER_MODEL_NAME, 0, Specialization::General)
    }

    pub fn settings(&self) -> Result<Settings, StorageError> {
        self.conn
            .query_row(
                "
                SELECT url, llm_model_id, context_id, topic_id, updated_at
                FROM settings
                WHERE id = 1
                ",
                [],
                |row| {
                    Ok(Settings {
                        url: row.get(0)?,
                        llm_model_id: row.get(1)?,
                        context_id: row.get(2)?,
                        topic_id: row.get(3)?,
                        updated_at: timestamp_column(row, 4)?,
                    })
                },
            )
            .optional()?
            .ok_or_else(|| StorageError::NotFound {
                kind: "settings",
                key: "1".to_string(),
            })
    }

    pub fn set_url(&self, url: &str) -> Result<Settings, StorageError> {
        let url = clean_text("url", url)?;
        self.update_settings("url", url)
    }

    pub fn set_current_model(&self, model_id: i64) -> Result<Settings, StorageError> {
        if self.model(model_id)?.is_none() {
            return Err(not_found("model", model_id));
        }
        self.update_settings("llm_model_id", model_id)
    }

    pub fn set_current_context(&self, context_id: i64) -> Result<Settings, StorageError> {
        if self.context(context_id)?.is_none() {
            return Err(not_found("context", context_id));
        }
        self.update_settings("context_id", context_id)
    }

    pub fn set_current_topic(&self, topic_id: i64) -> Result<Settings, StorageError> {
        if topic_by_id(&self.conn, topic_id)?.is_none() {
            return Err(not_found("topic", topic_id));
        }
        self.update_settings("topic_id", topic_id)
    }

    fn update_settings<V: rusqlite::ToSql>(
        &self,
        column: &'static str,
        value: V,
    ) -> Result<Settings, StorageError> {
        let sql = format!("UPDATE settings SET {column} = ?1, updated_at = ?2 WHERE id = 1");
        self.conn
            .execute(&sql, params![value, Utc::now().to_rfc3339()])?;
        self.settings()
    }
}

fn seed_defaults(conn: &Connection) -> Result<(), StorageError> {
    let now = Utc::now().to_rfc3339();

    for text in DEFAULT_CONTEXTS {
        conn.execute(
            "INSERT OR IGNORE INTO contexts (text, created_at) VALUES (?1, ?2)",
            params![text, now],
        )?;
    }
    for text in DEFAULT_CATEGORIES {
        conn.execute(
            "INSERT OR IGNORE INTO categories (text, created_at) VALUES (?1, ?2)",
            params![text, now],
        )?;
    }
    for (text, category_id) in DEFAULT_TOPICS {
        conn.execute(
            "INSERT OR IGNORE INTO topics (text, category_id, created_at) VALUES (?1, ?2, ?3)",
            params![text, category_id, now],
        )?;
    }
    conn.execute(
        "
        INSERT OR IGNORE INTO settings (id, url, llm_model_id, context_id, topic_id, updated_at)
        VALUES (1, ?1, NULL, ?2, ?3, ?4)
        ",
        params![DEFAULT_SERVER_URL, DEFAULT_CONTEXT_ID, DEFAULT_TOPIC_ID, now],
    )?;
    Ok(())
}

fn get_or_create_category_on(
    conn: &Connection,
    text: &str,
) -> Result<GetOrCreate<Category>, StorageError> {
    let text = clean_text("category", text)?;
    let changes = conn.execute(
        "INSERT INTO categories (text, created_at) VALUES (?1, ?2) ON CONFLICT(text) DO NOTHING",
        params![text, Utc::now().to_rfc3339()],
    )?;
    let record = category_by_text(conn, text)?.ok_or_else(|| StorageError::NotFound {
        kind: "category",
        key: text.to_string(),
    })?;
    if changes > 0 {
        info!(category_id = record.id, text = %record.text, "category created");
    }
    Ok(GetOrCreate {
        record,
        created: changes > 0,
    })
}

fn get_or_create_topic_on(
    conn: &Connection,
    text: &str,
    category_id: i64,
) -> Result<GetOrCreate<Topic>, StorageError> {
    let text = clean_text("topic", text)?;
    if category_by_id(conn, category_id)?.is_none() {
        return Err(not_found("category", category_id));
    }
    let changes = conn.execute(
        "
        INSERT INTO topics (text, category_id, created_at) VALUES (?1, ?2, ?3)
        ON CONFLICT(text) DO NOTHING
        ",
        params![text, category_id, Utc::now().to_rfc3339()],
    )?;
    let record = topic_by_text(conn, text)?.ok_or_else(|| StorageError::NotFound {
        kind: "topic",
        key: text.to_string(),
    })?;
    if changes > 0 {
        info!(topic_id = record.id, category_id, text = %record.text, "topic created");
    }
    Ok(GetOrCreate {
        record,
        created: changes > 0,
    })
}

fn category_by_id(conn: &Connection, id: i64) -> Result<Option<Category>, StorageError> {
    Ok(conn
        .query_row(
            "SELECT id, text, created_at FROM categories WHERE id = ?1",
            params![id],
            category_from_row,
        )
        .optional()?)
}

fn category_by_text(conn: &Connection, text: &str) -> Result<Option<Category>, StorageError> {
    Ok(conn
        .query_row(
            "SELECT id, text, created_at FROM categories WHERE text = ?1",
            params![text],
            category_from_row,
        )
        .optional()?)
}

fn topic_by_id(conn: &Connection, id: i64) -> Result<Option<Topic>, StorageError> {
    Ok(conn
        .query_row(
            "SELECT id, text, category_id, created_at FROM topics WHERE id = ?1",
            params![id],
            topic_from_row,
        )
        .optional()?)
}

fn topic_by_text(conn: &Connection, text: &str) -> Result<Option<Topic>, StorageError> {
    Ok(conn
        .query_row(
            "SELECT id, text, category_id, created_at FROM topics WHERE text = ?1",
            params![text],
            topic_from_row,
        )
        .optional()?)
}

fn category_from_row(row: &Row<'_>) -> rusqlite::Result<Category> {
    Ok(Category {
        id: row.get(0)?,
        text: row.get(1)?,
        created_at: timestamp_column(row, 2)?,
    })
}

fn topic_from_row(row: &Row<'_>) -> rusqlite::Result<Topic> {
    Ok(Topic {
        id: row.get(0)?,
        text: row.get(1)?,
        category_id: row.get(2)?,
        created_at: timestamp_column(row, 3)?,
    })
}

fn context_from_row(row: &Row<'_>) -> rusqlite::Result<Context> {
    Ok(Context {
        id: row.get(0)?,
        text: row.get(1)?,
        created_at: timestamp_column(row, 2)?,
    })
}

fn chat_from_row(row: &Row<'_>) -> rusqlite::Result<Chat> {
    Ok(Chat {
        id: row.get(0)?,
        question: row.get(1)?,
        answer: row.get(2)?,
        context_id: row.get(3)?,
        topic_id: row.get(4)?,
        llm_model_id: row.get(5)?,
        created_at: timestamp_column(row, 6)?,
    })
}

fn model_from_row(row: &Row<'_>) -> rusqlite::Result<LlmModel> {
    let specialization: String = row.get(3)?;
    Ok(LlmModel {
        id: row.get(0)?,
        name: row.get(1)?,
        size: row.get(2)?,
        specialization: specialization.parse().unwrap_or_default(),
        modified_at: timestamp_column(row, 4)?,
        currently_available: row.get(5)?,
    })
}

fn timestamp_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let value: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&value)
        .map(|timestamp| timestamp.with_timezone(&Utc))
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err)))
}

fn clean_text<'a>(kind: &'static str, text: &'a str) -> Result<&'a str, StorageError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(StorageError::EmptyText { kind });
    }
    Ok(trimmed)
}

fn unique_violation(kind: &'static str, text: &str, err: rusqlite::Error) -> StorageError {
    match &err {
        rusqlite::Error::SqliteFailure(failure, _)
            if failure.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE =>
        {
            StorageError::DuplicateText {
                kind,
                text: text.to_string(),
            }
        }
        _ => StorageError::Sqlite(err),
    }
}

fn not_found(kind: &'static str, id: i64) -> StorageError {
    StorageError::NotFound {
        kind,
        key: id.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn draft(question: &str, topic_id: i64, model_id: i64) -> ChatDraft {
        ChatDraft {
            question: question.to_string(),
            answer: format!("answer to {question}"),
            context_id: DEFAULT_CONTEXT_ID,
            topic_id,
            llm_model_id: model_id,
        }
    }

    #[test]
    fn migration_creates_tables_and_seeds_defaults() {
        let db = ChatStore::open_in_memory().expect("open db");

        for table in [
            "contexts",
            "categories",
            "topics",
            "llm_models",
            "chats",
            "settings",
        ] {
            assert!(db.table_exists(table).expect("table check"));
        }
        assert_eq!(
            db.schema_version().expect("schema version"),
            CHAT_SCHEMA_VERSION
        );

        let categories = db.categories().expect("categories");
        assert_eq!(categories.len(), DEFAULT_CATEGORIES.len());
        assert_eq!(categories[0].id, DEFAULT_CATEGORY_ID);
        assert_eq!(categories[0].text, "default");

        let topics = db.topics().expect("topics");
        let texts = topics.iter().map(|topic| topic.text.as_str()).collect::<Vec<_>>();
        assert_eq!(texts, vec!["default", "Dad Jokes", "Python Textual"]);
        assert_eq!(topics[1].category_id, 2);

        assert_eq!(db.contexts().expect("contexts").len(), 2);

        let settings = db.settings().expect("settings");
        assert_eq!(settings.url, DEFAULT_SERVER_URL);
        assert_eq!(settings.topic_id, DEFAULT_TOPIC_ID);
        assert_eq!(settings.llm_model_id, None);
    }

    #[test]
    fn reopening_a_file_store_keeps_rows_and_does_not_reseed() {
        let file = NamedTempFile::new().expect("temp db");
        {
            let db = ChatStore::open(file.path()).expect("open db");
            db.get_or_create_category("Elephants").expect("create");
        }
        let db = ChatStore::open(file.path()).expect("reopen db");
        assert!(db.category_by_text("Elephants").expect("lookup").is_some());
        assert_eq!(
            db.categories().expect("categories").len(),
            DEFAULT_CATEGORIES.len() + 1
        );
    }

    #[test]
    fn candidates_exclude_default_sentinels() {
        let db = ChatStore::open_in_memory().expect("open db");
        assert!(db
            .topic_candidates()
            .expect("topics")
            .iter()
            .all(|topic| topic.id != DEFAULT_TOPIC_ID));
        assert!(db
            .category_candidates()
            .expect("categories")
            .iter()
            .all(|category| category.id != DEFAULT_CATEGORY_ID));
    }

    #[test]
    fn get_or_create_category_is_idempotent_and_case_insensitive() {
        let db = ChatStore::open_in_memory().expect("open db");

        let first = db.get_or_create_category("Elephants").expect("create");
        assert!(first.created);

        let second = db.get_or_create_category("  elephants ").expect("reuse");
        assert!(!second.created);
        assert_eq!(second.record.id, first.record.id);
        assert_eq!(second.record.text, "Elephants");

        let err = db.get_or_create_category("   ").expect_err("empty text");
        assert!(matches!(err, StorageError::EmptyText { kind: "category" }));
    }

    #[test]
    fn get_or_create_topic_requires_an_existing_category() {
        let db = ChatStore::open_in_memory().expect("open db");
        let err = db
            .get_or_create_topic("Elephant Trunks", 999)
            .expect_err("missing category");
        assert!(matches!(err, StorageError::NotFound { kind: "category", .. }));
    }

    #[test]
    fn create_topic_in_category_links_new_rows() {
        let mut db = ChatStore::open_in_memory().expect("open db");

        let write = db
            .create_topic_in_category("Elephant Trunks", CategorySelection::Named("Elephants"))
            .expect("create");
        assert!(write.category_created);
        assert!(write.topic_created);
        assert_eq!(write.topic.category_id, write.category.id);

        let again = db
            .create_topic_in_category("Elephant Trunks", CategorySelection::Named("Elephants"))
            .expect("repeat");
        assert!(!again.category_created);
        assert!(!again.topic_created);
        assert_eq!(again.topic.id, write.topic.id);

        let existing = db
            .create_topic_in_category("Knock Knock", CategorySelection::Existing(2))
            .expect("existing category");
        assert_eq!(existing.category.text, "Jokes");
        assert_eq!(
            db.topics_for_category(2)
                .expect("topics")
                .iter()
                .map(|topic| topic.text.as_str())
                .collect::<Vec<_>>(),
            vec!["Dad Jokes", "Knock Knock"]
        );
    }

    #[test]
    fn failed_taxonomy_write_rolls_back_new_category() {
        let mut db = ChatStore::open_in_memory().expect("open db");
        let err = db
            .create_topic_in_category("  ", CategorySelection::Named("Orphans"))
            .expect_err("empty topic");
        assert!(matches!(err, StorageError::EmptyText { kind: "topic" }));
        assert!(db.category_by_text("Orphans").expect("lookup").is_none());
    }

    #[test]
    fn concurrent_connections_converge_on_one_new_topic() {
        let file = NamedTempFile::new().expect("temp db");
        let stores = (0..2)
            .map(|_| ChatStore::open(file.path()).expect("open db"))
            .collect::<Vec<_>>();
        let barrier = std::sync::Barrier::new(stores.len());

        let writes = std::thread::scope(|scope| {
            let handles = stores
                .into_iter()
                .map(|mut db| {
                    let barrier = &barrier;
                    scope.spawn(move || {
                        barrier.wait();
                        db.create_topic_in_category(
                            "Elephant Trunks",
                            CategorySelection::Named("Elephants"),
                        )
                        .expect("create on racing connection")
                    })
                })
                .collect::<Vec<_>>();
            handles
                .into_iter()
                .map(|handle| handle.join().expect("writer thread"))
                .collect::<Vec<_>>()
        });

        assert_eq!(writes[0].topic.id, writes[1].topic.id);
        assert_eq!(writes[0].category.id, writes[1].category.id);
        assert_eq!(writes.iter().filter(|write| write.topic_created).count(), 1);
        assert_eq!(
            writes.iter().filter(|write| write.category_created).count(),
            1
        );

        let db = ChatStore::open(file.path()).expect("reopen db");
        let elephants = db
            .category_by_text("Elephants")
            .expect("lookup")
            .expect("category exists");
        assert_eq!(
            db.topics_for_category(elephants.id).expect("topics").len(),
            1
        );
    }

    #[test]
    fn rename_rejects_duplicates_and_reserved_rows() {
        let db = ChatStore::open_in_memory().expect("open db");

        let err = db.rename_topic(2, "python textual").expect_err("duplicate");
        assert!(matches!(err, StorageError::DuplicateText { kind: "topic", .. }));

        let err = db.rename_category(DEFAULT_CATEGORY_ID, "misc").expect_err("reserved");
        assert!(matches!(err, StorageError::ReservedRecord { .. }));

        let renamed = db.rename_category(2, "Humor").expect("rename");
        assert_eq!(renamed.text, "Humor");

        let moved = db.move_topic(2, 3).expect("move");
        assert_eq!(moved.category_id, 3);
    }

    #[test]
    fn contexts_can_be_created_and_edited() {
        let db = ChatStore::open_in_memory().expect("open db");
        let context = db.create_context("You answer in haiku.").expect("create");
        let edited = db
            .update_context(context.id, "You answer in limericks.")
            .expect("edit");
        assert_eq!(edited.text, "You answer in limericks.");

        let err = db.create_context("You answer in limericks.").expect_err("duplicate");
        assert!(matches!(err, StorageError::DuplicateText { kind: "context", .. }));
    }

    #[test]
    fn chats_are_saved_under_default_topic_and_repointed_in_batch() {
        let mut db = ChatStore::open_in_memory().expect("open db");
        let model = db.ensure_placeholder_model().expect("model");

        let first = db.save_chat(&draft("why?", DEFAULT_TOPIC_ID, model.id)).expect("save");
        let second = db.save_chat(&draft("how?", DEFAULT_TOPIC_ID, model.id)).expect("save");
        assert!(first.is_unclassified());

        let changed = db
            .update_chat_topics(&[first.id, second.id], 2)
            .expect("repoint");
        assert_eq!(changed, 2);
        assert!(db.chats_for_topic(DEFAULT_TOPIC_ID).expect("default chats").is_empty());
        assert_eq!(db.chats_for_topic(2).expect("topic chats").len(), 2);
        assert_eq!(
            db.chats_for_context(DEFAULT_CONTEXT_ID).expect("context chats").len(),
            2
        );

        let err = db.update_chat_topics(&[first.id], 999).expect_err("missing topic");
        assert!(matches!(err, StorageError::NotFound { kind: "topic", .. }));
        assert!(db.update_chat_topic(second.id, 3).expect("single update"));
        assert_eq!(db.chat(second.id).expect("load").expect("exists").topic_id, 3);
    }

    #[test]
    fn chats_must_reference_existing_rows() {
        let db = ChatStore::open_in_memory().expect("open db");
        let model = db.ensure_placeholder_model().expect("model");
        let err = db.save_chat(&draft("orphan", 999, model.id)).expect_err("fk");
        assert!(matches!(err, StorageError::Sqlite(_)));
    }

    #[test]
    fn models_upsert_and_track_availability() {
        let db = ChatStore::open_in_memory().expect("open db");

        let model = db
            .upsert_model("llama3:latest", 4_000, Specialization::General)
            .expect("insert");
        assert!(model.currently_available);

        db.set_model_availability(model.id, false).expect("mark");
        assert!(db.available_models().expect("available").is_empty());

        let refreshed = db
            .upsert_model("llama3:latest", 4_100, Specialization::General)
            .expect("refresh");
        assert_eq!(refreshed.id, model.id);
        assert_eq!(refreshed.size, 4_100);
        assert!(refreshed.currently_available);

        let placeholder = db.ensure_placeholder_model().expect("placeholder");
        assert_eq!(
            db.ensure_placeholder_model().expect("placeholder again").id,
            placeholder.id
        );
        assert_eq!(db.models().expect("models").len(), 2);
    }

    #[test]
    fn settings_updates_validate_references() {
        let db = ChatStore::open_in_memory().expect("open db");
        let model = db
            .upsert_model("codellama", 7_000, Specialization::Coding)
            .expect("model");

        let settings = db.set_current_model(model.id).expect("set model");
        assert_eq!(settings.llm_model_id, Some(model.id));
        assert_eq!(db.set_current_context(2).expect("context").context_id, 2);
        assert_eq!(db.set_current_topic(3).expect("topic").topic_id, 3);
        assert_eq!(
            db.set_url("http://gpu-box:11434").expect("url").url,
            "http://gpu-box:11434"
        );

        assert!(db.set_current_model(999).is_err());
        assert!(db.set_current_context(999).is_err());
    }
}
