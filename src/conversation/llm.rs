//! Response generation backends

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::ReplyRequest;
use crate::{Error, Result};

/// Produces the assistant's reply for a planned turn
#[async_trait]
pub trait ResponseGenerator: Send + Sync {
    /// Generate a reply
    ///
    /// # Errors
    ///
    /// Returns error if the backend is unreachable or answers badly
    async fn generate(&self, request: &ReplyRequest) -> Result<String>;
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: String,
}

/// Local Ollama chat backend
pub struct OllamaResponder {
    client: reqwest::Client,
    base_url: String,
    model: String,
}

impl OllamaResponder {
    /// Create a responder for `model` served at `base_url`
    #[must_use]
    pub fn new(base_url: &str, model: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
        }
    }
}

/// Flatten a reply request into chat messages
fn build_messages(request: &ReplyRequest) -> Vec<ChatMessage<'_>> {
    let mut messages = Vec::with_capacity(request.history.len() * 2 + 2);
    if let Some(system) = request.system_prompt.as_deref() {
        messages.push(ChatMessage {
            role: "system",
            content: system,
        });
    }
    for turn in &request.history {
        messages.push(ChatMessage {
            role: "user",
            content: &turn.user,
        });
        messages.push(ChatMessage {
            role: "assistant",
            content: &turn.assistant,
        });
    }
    messages.push(ChatMessage {
        role: "user",
        content: &request.prompt,
    });
    messages
}

#[async_trait]
impl ResponseGenerator for OllamaResponder {
    async fn generate(&self, request: &ReplyRequest) -> Result<String> {
        let url = format!("{}/api/chat", self.base_url);
        let body = ChatRequest {
            model: &self.model,
            messages: build_messages(request),
            stream: false,
        };

        tracing::debug!(model = %self.model, turns = request.history.len(), "requesting reply");

        let response = self.client.post(&url).json(&body).send().await.map_err(|e| {
            tracing::error!(error = %e, url = %url, "ollama request failed");
            e
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "ollama API error");
            return Err(Error::Llm(format!("ollama error {status}: {body}")));
        }

        let reply: ChatResponse = response.json().await?;
        let text = strip_reasoning(&reply.message.content);
        if text.is_empty() {
            return Err(Error::Llm("empty reply".to_string()));
        }
        Ok(text)
    }
}

/// Drop `<think>…</think>` blocks some local models emit before answering
fn strip_reasoning(content: &str) -> String {
    let mut out = String::with_capacity(content.len());
    let mut rest = content;
    while let Some(start) = rest.find("<think>") {
        out.push_str(&rest[..start]);
        match rest[start..].find("</think>") {
            Some(end) => rest = &rest[start + end + "</think>".len()..],
            None => {
                rest = "";
                break;
            }
        }
    }
    out.push_str(rest);
    out.trim().to_string()
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::conversation::Turn;

    #[test]
    fn test_build_messages_order() {
        let request = ReplyRequest {
            system_prompt: Some("sois bref".to_string()),
            history: vec![Turn {
                user: "bonjour".to_string(),
                assistant: "salut".to_string(),
                at: Utc::now(),
            }],
            prompt: "quelle heure est-il".to_string(),
            profile_id: "default".to_string(),
        };

        let roles: Vec<_> = build_messages(&request).iter().map(|m| m.role).collect();
        assert_eq!(roles, vec!["system", "user", "assistant", "user"]);
        assert_eq!(build_messages(&request)[3].content, "quelle heure est-il");
    }

    #[test]
    fn test_strip_reasoning() {
        assert_eq!(
            strip_reasoning("<think>calcul</think>\nIl est dix heures."),
            "Il est dix heures."
        );
        assert_eq!(strip_reasoning("Il est dix heures."), "Il est dix heures.");
        assert_eq!(strip_reasoning("ok <think>unterminated"), "ok");
    }

    #[test]
    fn test_parse_chat_response() {
        let body = r#"{"model":"qwen3-coder","message":{"role":"assistant","content":"Il est dix heures."},"done":true}"#;
        let parsed: ChatResponse = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.message.content, "Il est dix heures.");
    }
}
