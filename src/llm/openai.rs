//! OpenAI-compatible Chat Completions client with function tools.
//!
//! Works against api.openai.com and local servers that speak the same wire
//! format (Ollama, LM Studio). The API key is read from the configured
//! environment variable on each request; without one no Authorization
//! header is sent.

use super::{ChatMessage, Completion, LlmClient, ToolCall, ToolDefinition};
use crate::{LlmConfig, Result, ThreadmindError};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

/// Transport-level retry for this client only
const MAX_RETRY_ATTEMPTS: u32 = 3;
const RETRY_BASE_DELAY_MS: u64 = 200;

pub struct OpenAiClient {
    client: Client,
    base_url: String,
    model: String,
    api_key_env: String,
}

// ─── Chat Completions wire types ────────────────────────────────────

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<WireTool<'a>>>,
    max_tokens: u32,
    temperature: f32,
    stream: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireMessage {
    role: String,
    #[serde(default)]
    content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<WireToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireToolCall {
    id: String,
    #[serde(rename = "type", default = "function_type")]
    call_type: String,
    function: WireFunctionCall,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireFunctionCall {
    name: String,
    /// Normally a JSON string; some servers send an object
    #[serde(default)]
    arguments: Value,
}

#[derive(Debug, Serialize)]
struct WireTool<'a> {
    #[serde(rename = "type")]
    tool_type: &'static str,
    function: &'a ToolDefinition,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: WireMessage,
}

fn function_type() -> String {
    "function".to_string()
}

impl From<&ChatMessage> for WireMessage {
    fn from(message: &ChatMessage) -> Self {
        let role = message.role().to_string();
        match message {
            ChatMessage::System { content } | ChatMessage::User { content } => Self {
                role,
                content: Some(content.clone()),
                tool_calls: None,
                tool_call_id: None,
            },
            ChatMessage::Assistant {
                content,
                tool_calls,
            } => Self {
                role,
                content: content.clone(),
                tool_calls: if tool_calls.is_empty() {
                    None
                } else {
                    Some(
                        tool_calls
                            .iter()
                            .map(|call| WireToolCall {
                                id: call.id.clone(),
                                call_type: function_type(),
                                function: WireFunctionCall {
                                    name: call.name.clone(),
                                    arguments: Value::String(call.arguments_string()),
                                },
                            })
                            .collect(),
                    )
                },
                tool_call_id: None,
            },
            ChatMessage::Tool {
                tool_call_id,
                content,
            } => Self {
                role,
                content: Some(content.clone()),
                tool_calls: None,
                tool_call_id: Some(tool_call_id.clone()),
            },
        }
    }
}

impl From<WireMessage> for Completion {
    fn from(message: WireMessage) -> Self {
        let tool_calls = message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|call| ToolCall {
                id: call.id,
                name: call.function.name,
                arguments: call.function.arguments,
            })
            .collect();
        Self {
            content: message.content.filter(|c| !c.trim().is_empty()),
            tool_calls,
        }
    }
}

// ─── Implementation ─────────────────────────────────────────────────

impl OpenAiClient {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .connect_timeout(Duration::from_secs(15))
            .user_agent(concat!("threadmind/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ThreadmindError::Config(format!("HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key_env: config.api_key_env.clone(),
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Exponential backoff with a small deterministic jitter
    fn retry_backoff(attempt: u32) -> Duration {
        let exp = 2u64.saturating_pow(attempt.saturating_sub(1));
        let base_ms = RETRY_BASE_DELAY_MS.saturating_mul(exp);
        let jitter = 1.0 + ((attempt as f64 * 0.37).sin() * 0.1);
        Duration::from_millis((base_ms as f64 * jitter) as u64)
    }

    async fn send_request(&self, request: &ChatRequest<'_>) -> Result<Completion> {
        let url = format!("{}/chat/completions", self.base_url);

        let mut req_builder = self
            .client
            .post(&url)
            .header("Content-Type", "application/json");
        if let Ok(key) = std::env::var(&self.api_key_env) {
            let key = key.trim();
            if !key.is_empty() {
                req_builder = req_builder.header("Authorization", format!("Bearer {}", key));
            }
        }

        let response = req_builder
            .json(request)
            .send()
            .await
            .map_err(Self::map_reqwest_error)?;

        let response = Self::check_response_status(response).await?;

        let chat_response: ChatResponse = response
            .json()
            .await
            .map_err(|e| ThreadmindError::Provider(format!("malformed response: {}", e)))?;

        chat_response
            .choices
            .into_iter()
            .next()
            .map(|choice| Completion::from(choice.message))
            .ok_or_else(|| ThreadmindError::Provider("response contained no choices".to_string()))
    }

    async fn check_response_status(response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        let detail = Self::truncate_error_detail(&Self::extract_error_detail(&body), 500);
        let message = if detail.is_empty() {
            format!("API error {status}")
        } else {
            format!("API error {status}: {detail}")
        };
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            Err(ThreadmindError::ProviderUnavailable(message))
        } else {
            Err(ThreadmindError::Provider(message))
        }
    }

    /// Pull `error.message` out of a JSON error body, else return the body
    fn extract_error_detail(body: &str) -> String {
        let trimmed = body.trim();
        if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
            if let Some(message) = value
                .get("error")
                .and_then(|e| e.get("message").or(Some(e)))
                .and_then(|m| m.as_str())
            {
                return message.trim().to_string();
            }
        }
        trimmed.to_string()
    }

    fn truncate_error_detail(detail: &str, max_chars: usize) -> String {
        if detail.chars().count() <= max_chars {
            return detail.to_string();
        }
        let truncated: String = detail.chars().take(max_chars).collect();
        format!("{}...", truncated)
    }

    fn map_reqwest_error(e: reqwest::Error) -> ThreadmindError {
        if e.is_timeout() {
            ThreadmindError::ProviderUnavailable(format!("timeout: {e}"))
        } else if e.is_connect() {
            ThreadmindError::ProviderUnavailable(format!("network: {e}"))
        } else {
            ThreadmindError::Provider(e.to_string())
        }
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        tools: Option<&[ToolDefinition]>,
        temperature: f32,
        max_tokens: u32,
    ) -> Result<Completion> {
        let request = ChatRequest {
            model: &self.model,
            messages: messages.iter().map(WireMessage::from).collect(),
            tools: tools.filter(|t| !t.is_empty()).map(|t| {
                t.iter()
                    .map(|function| WireTool {
                        tool_type: "function",
                        function,
                    })
                    .collect()
            }),
            max_tokens,
            temperature,
            stream: false,
        };

        debug!(
            "Calling {} with {} messages, {} tools",
            self.model,
            messages.len(),
            tools.map(|t| t.len()).unwrap_or(0)
        );

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.send_request(&request).await {
                Ok(completion) => return Ok(completion),
                Err(ThreadmindError::ProviderUnavailable(msg)) if attempt < MAX_RETRY_ATTEMPTS => {
                    let delay = Self::retry_backoff(attempt);
                    warn!(
                        "LLM request failed (attempt {}/{}): {}; retrying in {:?}",
                        attempt, MAX_RETRY_ATTEMPTS, msg, delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_extract_error_detail() {
        let body = r#"{"error": {"message": "Invalid API key", "type": "auth"}}"#;
        assert_eq!(OpenAiClient::extract_error_detail(body), "Invalid API key");
        assert_eq!(OpenAiClient::extract_error_detail(r#"{"error": "busy"}"#), "busy");
        assert_eq!(OpenAiClient::extract_error_detail("  plain  "), "plain");
    }

    #[test]
    fn test_truncate_error_detail() {
        assert_eq!(OpenAiClient::truncate_error_detail("abcdef", 3), "abc...");
        assert_eq!(OpenAiClient::truncate_error_detail("abc", 3), "abc");
    }

    #[test]
    fn test_assistant_tool_calls_are_sent_as_strings() {
        let message = ChatMessage::assistant_tool_calls(
            None,
            vec![ToolCall::new("call_1", "delete_entity", json!({"id": "x"}))],
        );
        let wire = serde_json::to_value(WireMessage::from(&message)).unwrap();
        assert_eq!(wire["role"], "assistant");
        assert_eq!(wire["content"], Value::Null);
        assert_eq!(wire["tool_calls"][0]["type"], "function");
        assert_eq!(wire["tool_calls"][0]["function"]["arguments"], r#"{"id":"x"}"#);
    }

    #[test]
    fn test_response_parsing_keeps_raw_arguments() {
        let body = json!({
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": "",
                    "tool_calls": [{
                        "id": "call_1",
                        "type": "function",
                        "function": {"name": "create_entity", "arguments": "{\"id\":\"a\"}"}
                    }]
                }
            }]
        });
        let response: ChatResponse = serde_json::from_value(body).unwrap();
        let completion = Completion::from(response.choices.into_iter().next().unwrap().message);

        assert!(completion.content.is_none());
        assert_eq!(completion.tool_calls.len(), 1);
        assert_eq!(completion.tool_calls[0].arguments, json!("{\"id\":\"a\"}"));
    }

    #[test]
    fn test_retry_backoff_grows() {
        assert!(OpenAiClient::retry_backoff(2) > OpenAiClient::retry_backoff(1));
    }
}
