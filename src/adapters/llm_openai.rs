//! LLM adapter: an OpenAI-chat-compatible SSE streaming client with
//! per-session history (§4.4, §5), generalized from a single hand-rolled
//! SSE-over-`bytes_stream()` parser.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use crate::capability::{Capability, Llm};
use crate::error::ConversationError;
use crate::protocol::event::TextData;

pub const MAX_HISTORY_LENGTH: usize = 20;
pub const MAX_RETRIES: u32 = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

pub struct OpenAiLlm {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    system_prompt: Option<String>,
    history: Arc<RwLock<HashMap<String, Vec<ChatMessage>>>>,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
}

#[derive(Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
}
#[derive(Deserialize)]
struct StreamDelta {
    content: Option<String>,
}
#[derive(Deserialize)]
struct StreamResponse {
    choices: Vec<StreamChoice>,
}

impl OpenAiLlm {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, model: impl Into<String>, system_prompt: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            model: model.into(),
            system_prompt,
            history: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Evict the oldest user/assistant pair once history exceeds
    /// `MAX_HISTORY_LENGTH` turns (I5), never touching a preserved system
    /// message at index 0.
    fn trim(messages: &mut Vec<ChatMessage>, has_system: bool) {
        let floor = if has_system { 1 } else { 0 };
        while messages.len() > floor + MAX_HISTORY_LENGTH {
            messages.remove(floor);
        }
    }

    async fn connect_stream(&self, messages: Vec<ChatMessage>) -> Result<reqwest::Response> {
        let request = ChatRequest { model: &self.model, messages: &messages, stream: true };

        let mut last_err = None;
        for attempt in 0..MAX_RETRIES {
            if attempt > 0 {
                let delay = Duration::from_millis(300 * (attempt as u64 + 1));
                warn!("retrying LLM connection (attempt {}) after {:?}", attempt + 1, delay);
                tokio::time::sleep(delay).await;
            }

            let result = self
                .client
                .post(format!("{}/chat/completions", self.base_url))
                .header("Authorization", format!("Bearer {}", self.api_key))
                .json(&request)
                .send()
                .await;

            match result {
                Ok(response) if response.status().is_success() => return Ok(response),
                Ok(response) => {
                    let status = response.status();
                    let body = response.text().await.unwrap_or_default();
                    last_err = Some(anyhow::anyhow!("LLM API error ({status}): {body}"));
                }
                Err(e) => last_err = Some(anyhow::Error::new(e).context("failed to reach LLM provider")),
            }
        }

        let detail = last_err.map(|e| format!("{e:#}")).unwrap_or_else(|| "LLM connection failed".to_string());
        Err(ConversationError::processing(detail).into())
    }
}

#[async_trait]
impl Capability for OpenAiLlm {
    async fn setup(&self) -> Result<()> {
        reqwest::Url::parse(&format!("{}/chat/completions", self.base_url)).context("invalid LLM base_url")?;
        info!(base_url = %self.base_url, model = %self.model, "LLM adapter configured");
        Ok(())
    }

    /// Drops every session's history. Safe because a session that reconnects
    /// after a restart starts a fresh conversation anyway (sessions are not
    /// persisted, per the Non-goals).
    async fn close(&self) -> Result<()> {
        let mut history = self.history.write().await;
        let sessions = history.len();
        history.clear();
        info!(sessions, "cleared LLM session history on shutdown");
        Ok(())
    }
}

#[async_trait]
impl Llm for OpenAiLlm {
    async fn chat_stream(&self, input: TextData, session_id: &str) -> Result<BoxStream<'static, TextData>> {
        let has_system = self.system_prompt.is_some();
        let messages = {
            let mut history = self.history.write().await;
            let entry = history.entry(session_id.to_string()).or_insert_with(|| {
                let mut seed = Vec::new();
                if let Some(prompt) = &self.system_prompt {
                    seed.push(ChatMessage { role: "system".into(), content: prompt.clone() });
                }
                seed
            });
            entry.push(ChatMessage { role: "user".into(), content: input.text });
            Self::trim(entry, has_system);
            entry.clone()
        };

        let response = self.connect_stream(messages).await.context("LLM streaming call failed")?;

        let session_id = session_id.to_string();
        let history = self.history.clone();

        // Built as a real generator rather than a channel-plus-spawned-task: if the
        // consumer (the orchestrator, on barge-in) drops this stream without polling
        // it to completion, the future is dropped too, which drops `response` and
        // releases the upstream connection immediately instead of letting a detached
        // task keep draining it (§4.4's cancellation requirement).
        let stream = async_stream::stream! {
            let mut byte_stream = response.bytes_stream();
            let mut buffer = String::new();
            let mut full_content = String::new();

            loop {
                let chunk = match byte_stream.next().await {
                    Some(Ok(c)) => c,
                    Some(Err(e)) => {
                        error!(session_id = %session_id, error = %e, "LLM stream read error");
                        break;
                    }
                    None => break,
                };
                buffer.push_str(&String::from_utf8_lossy(&chunk));

                while let Some(pos) = buffer.find("\n\n") {
                    let event_str: String = buffer[..pos].to_string();
                    buffer = buffer[pos + 2..].to_string();

                    for line in event_str.lines() {
                        if let Some(data) = line.strip_prefix("data: ") {
                            if data == "[DONE]" {
                                continue;
                            }
                            if let Ok(parsed) = serde_json::from_str::<StreamResponse>(data) {
                                if let Some(choice) = parsed.choices.first() {
                                    if let Some(content) = &choice.delta.content {
                                        full_content.push_str(content);
                                        yield TextData::new(content.clone(), false);
                                    }
                                }
                            }
                        }
                    }
                }
            }

            yield TextData::new("", true);

            let mut history = history.write().await;
            if let Some(entry) = history.get_mut(&session_id) {
                entry.push(ChatMessage { role: "assistant".into(), content: full_content });
                Self::trim(entry, true);
            }
            info!(session_id = %session_id, "LLM turn complete");
        };

        Ok(Box::pin(stream))
    }

    async fn clear_history(&self, session_id: &str) {
        self.history.write().await.remove(session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trim_keeps_system_message_and_evicts_oldest_pair() {
        let mut messages = vec![ChatMessage { role: "system".into(), content: "sys".into() }];
        for i in 0..(MAX_HISTORY_LENGTH + 5) {
            messages.push(ChatMessage { role: "user".into(), content: format!("u{i}") });
        }
        OpenAiLlm::trim(&mut messages, true);
        assert_eq!(messages.len(), 1 + MAX_HISTORY_LENGTH);
        assert_eq!(messages[0].role, "system");
    }

    #[test]
    fn trim_without_system_prompt_evicts_from_the_front() {
        let mut messages: Vec<ChatMessage> = (0..(MAX_HISTORY_LENGTH + 3))
            .map(|i| ChatMessage { role: "user".into(), content: format!("u{i}") })
            .collect();
        OpenAiLlm::trim(&mut messages, false);
        assert_eq!(messages.len(), MAX_HISTORY_LENGTH);
        assert_eq!(messages[0].content, "u3");
    }
}
