use async_trait::async_trait;
use llamaterm_core::{extract_reply, BackendError, ChatBackend, ChatMessage};
use llamaterm_storage::StorageError;
use serde::Deserialize;
use serde_json::{json, Value};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

pub mod capabilities;
pub mod registry;

pub use capabilities::infer_specialization;
pub use registry::{apply_model_list, sync_registry, RemoteModel, SyncReport};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(900);

#[derive(Debug, Error)]
pub enum OllamaError {
    #[error("invalid server url '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("failed to build http client: {0}")]
    ClientBuild(String),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("chat store lock poisoned")]
    StoreLock,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiAction {
    Tags,
    Pull,
    Show,
    Generate,
    Delete,
    Chat,
}

impl ApiAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApiAction::Tags => "tags",
            ApiAction::Pull => "pull",
            ApiAction::Show => "show",
            ApiAction::Generate => "generate",
            ApiAction::Delete => "delete",
            ApiAction::Chat => "chat",
        }
    }
}

impl fmt::Display for ApiAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ModelTag {
    pub name: String,
    #[serde(default)]
    pub size: i64,
    #[serde(default)]
    pub modified_at: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ModelList {
    #[serde(default)]
    models: Vec<ModelTag>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct ModelInfo {
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub details: Value,
}

pub struct OllamaClient {
    base_url: String,
    http: reqwest::Client,
}

impl OllamaClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, OllamaError> {
        let base_url = normalize_base_url(base_url)?;
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| OllamaError::ClientBuild(err.to_string()))?;
        Ok(Self { base_url, http })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn endpoint(&self, action: ApiAction) -> String {
        format!("{}/api/{}", self.base_url, action)
    }

    pub async fn chat_messages(
        &self,
        model: &str,
        messages: &[ChatMessage],
    ) -> Result<String, BackendError> {
        let body = json!({
            "model": model,
            "messages": messages,
            "stream": false,
        });
        let reply = self.post_json(ApiAction::Chat, &body).await?;
        let (key, answer) = extract_reply(&reply)?;
        debug!(model, reply_key = key.as_str(), chars = answer.len(), "chat reply received");
        Ok(answer)
    }

    pub async fn generate(&self, model: &str, prompt: &str) -> Result<String, BackendError> {
        let body = json!({
            "model": model,
            "prompt": prompt,
            "stream": false,
        });
        let reply = self.post_json(ApiAction::Generate, &body).await?;
        Ok(extract_reply(&reply)?.1)
    }

    pub async fn list_models(&self) -> Result<Vec<ModelTag>, BackendError> {
        let endpoint = self.endpoint(ApiAction::Tags);
        let response = self
            .http
            .get(&endpoint)
            .send()
            .await
            .map_err(|err| transport_error(&endpoint, err))?;
        let reply = read_json(&endpoint, response).await?;
        let list: ModelList = serde_json::from_value(reply)
            .map_err(|err| BackendError::MalformedReply(format!("model list: {err}")))?;
        Ok(list.models)
    }

    pub async fn show_model(&self, name: &str) -> Result<ModelInfo, BackendError> {
        let reply = self
            .post_json(ApiAction::Show, &json!({ "model": name }))
            .await?;
        serde_json::from_value(reply)
            .map_err(|err| BackendError::MalformedReply(format!("model info: {err}")))
    }

    pub async fn pull_model(&self, name: &str) -> Result<String, BackendError> {
        let reply = self
            .post_json(ApiAction::Pull, &json!({ "model": name, "stream": false }))
            .await?;
        Ok(reply
            .get("status")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string())
    }

    pub async fn delete_model(&self, name: &str) -> Result<(), BackendError> {
        let endpoint = self.endpoint(ApiAction::Delete);
        let response = self
            .http
            .delete(&endpoint)
            .json(&json!({ "model": name }))
            .send()
            .await
            .map_err(|err| transport_error(&endpoint, err))?;
        check_status(&endpoint, response).await.map(|_| ())
    }

    async fn post_json(&self, action: ApiAction, body: &Value) -> Result<Value, BackendError> {
        let endpoint = self.endpoint(action);
        let response = self
            .http
            .post(&endpoint)
            .json(body)
            .send()
            .await
            .map_err(|err| transport_error(&endpoint, err))?;
        read_json(&endpoint, response).await
    }
}

#[async_trait]
impl ChatBackend for OllamaClient {
    fn backend_name(&self) -> &'static str {
        "ollama"
    }

    async fn chat(&self, model: &str, messages: &[ChatMessage]) -> Result<String, BackendError> {
        self.chat_messages(model, messages).await
    }
}

pub fn normalize_base_url(raw: &str) -> Result<String, OllamaError> {
    let trimmed = raw.trim().trim_end_matches('/');
    let trimmed = trimmed.strip_suffix("/api").unwrap_or(trimmed);

    let parsed = url::Url::parse(trimmed).map_err(|err| OllamaError::InvalidUrl {
        url: raw.to_string(),
        reason: err.to_string(),
    })?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(OllamaError::InvalidUrl {
            url: raw.to_string(),
            reason: format!("unsupported scheme {}", parsed.scheme()),
        });
    }
    Ok(trimmed.to_string())
}

fn transport_error(endpoint: &str, err: reqwest::Error) -> BackendError {
    if err.is_timeout() {
        warn!(endpoint, "request timed out");
        BackendError::Timeout {
            endpoint: endpoint.to_string(),
        }
    } else {
        warn!(endpoint, error = %err, "request failed");
        BackendError::Transport {
            endpoint: endpoint.to_string(),
            message: err.to_string(),
        }
    }
}

async fn check_status(
    endpoint: &str,
    response: reqwest::Response,
) -> Result<reqwest::Response, BackendError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    warn!(endpoint, status = status.as_u16(), "server returned error status");
    Err(BackendError::Status {
        endpoint: endpoint.to_string(),
        status: status.as_u16(),
        body,
    })
}

async fn read_json(endpoint: &str, response: reqwest::Response) -> Result<Value, BackendError> {
    let response = check_status(endpoint, response).await?;
    response.json::<Value>().await.map_err(|err| {
        if err.is_timeout() {
            BackendError::Timeout {
                endpoint: endpoint.to_string(),
            }
        } else {
            BackendError::MalformedReply(format!("{endpoint}: {err}"))
        }
    })
}
