//! Provider abstractions and conversation types.
//!
//! Defines the [`Message`] / [`ToolCall`] types shared by the whole runtime,
//! the [`Provider`] trait every model backend implements, and
//! [`HttpProvider`] — the OpenAI-compatible chat-completions client that
//! provider specs under `scripts/providers/` materialise into.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::warn;

// ---------------------------------------------------------------------------
// Conversation types
// ---------------------------------------------------------------------------

/// A single tool invocation requested by the model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    /// Provider-assigned (or synthesised) call id; echoed on the result.
    pub id: String,
    /// Tool name.
    pub name: String,
    /// Parsed JSON arguments.
    pub args: Value,
}

/// One message in the persisted context.
///
/// A role-string struct rather than an enum so unknown roles survive a
/// round-trip through `memory/context.json` untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// `"system"`, `"user"`, `"assistant"`, or `"tool"`.
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// For assistant messages that invoke tools.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    /// For `role: "tool"` messages: the call this result answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn assistant(content: Option<String>, tool_calls: Option<Vec<ToolCall>>) -> Self {
        Self {
            role: "assistant".into(),
            content,
            tool_calls,
            tool_call_id: None,
        }
    }

    pub fn tool(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: "tool".into(),
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: Some(call_id.into()),
        }
    }

    /// Approximate size of this message for context budgeting (~4 chars/token).
    pub fn char_count(&self) -> usize {
        let mut n = self.content.as_deref().map(str::len).unwrap_or(0);
        if let Some(ref calls) = self.tool_calls {
            for c in calls {
                n += c.name.len() + c.args.to_string().len();
            }
        }
        n
    }
}

/// Token usage reported by a provider, when available.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

/// The provider's answer to one chat call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatOutcome {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
}

/// Metadata describing a callable tool, injected as a function definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDef {
    pub name: String,
    pub description: String,
    /// JSON Schema for the tool's arguments.
    pub parameters: Value,
}

// ---------------------------------------------------------------------------
// Provider trait
// ---------------------------------------------------------------------------

/// Trait implemented by every LLM backend.
#[async_trait]
pub trait Provider: Send + Sync + std::fmt::Debug {
    /// Send the conversation and tool definitions, returning the model's
    /// reply. Transport or API failures are errors.
    async fn chat(&self, messages: &[Message], tools: &[ToolDef]) -> anyhow::Result<ChatOutcome>;
}

/// Serialise messages into the OpenAI-compatible wire format.
pub fn serialize_messages(messages: &[Message]) -> Vec<Value> {
    messages
        .iter()
        .map(|m| {
            let mut msg = json!({ "role": m.role });
            if let Some(ref calls) = m.tool_calls {
                let wire: Vec<Value> = calls
                    .iter()
                    .map(|c| {
                        json!({
                            "id": c.id,
                            "type": "function",
                            "function": {
                                "name": c.name,
                                "arguments": c.args.to_string(),
                            }
                        })
                    })
                    .collect();
                msg["tool_calls"] = json!(wire);
                // Content must be null on assistant messages carrying calls
                // unless the model also produced text.
                msg["content"] = match m.content {
                    Some(ref c) if !c.is_empty() => json!(c),
                    _ => Value::Null,
                };
            } else {
                msg["content"] = json!(m.content.clone().unwrap_or_default());
            }
            if let Some(ref id) = m.tool_call_id {
                msg["tool_call_id"] = json!(id);
            }
            msg
        })
        .collect()
}

/// Extract token usage from an OpenAI-style response body.
pub fn parse_usage(body: &Value) -> Option<TokenUsage> {
    let usage = body.get("usage")?;
    Some(TokenUsage {
        prompt_tokens: usage["prompt_tokens"].as_u64().unwrap_or(0),
        completion_tokens: usage["completion_tokens"].as_u64().unwrap_or(0),
        total_tokens: usage["total_tokens"].as_u64().unwrap_or(0),
    })
}

/// Parse `choices[0].message.tool_calls` from an OpenAI-style response.
///
/// Call ids missing from the wire are synthesised so the pairing invariant
/// holds downstream.
pub fn parse_tool_calls(body: &Value) -> Option<Vec<ToolCall>> {
    let calls = body["choices"][0]["message"]["tool_calls"].as_array()?;
    if calls.is_empty() {
        return None;
    }
    let parsed: Vec<ToolCall> = calls
        .iter()
        .map(|c| {
            let id = match c["id"].as_str() {
                Some(s) if !s.is_empty() => s.to_string(),
                _ => crate::utils::call_id(),
            };
            let name = c["function"]["name"].as_str().unwrap_or_default().to_string();
            let raw_args = c["function"]["arguments"].as_str().unwrap_or("{}");
            let args = serde_json::from_str(raw_args).unwrap_or_else(|_| json!({}));
            ToolCall { id, name, args }
        })
        .collect();
    Some(parsed)
}

// ---------------------------------------------------------------------------
// HttpProvider — OpenAI-compatible chat completions
// ---------------------------------------------------------------------------

/// Provider that talks to any OpenAI-compatible chat completions API
/// (OpenAI, OpenRouter, Ollama, Groq, vLLM, …).
#[derive(Debug)]
pub struct HttpProvider {
    endpoint: String,
    api_key: String,
    model: Option<String>,
    extra_headers: Vec<(String, String)>,
    client: Client,
}

impl HttpProvider {
    /// Create a provider with explicit configuration.
    ///
    /// `api_key` may be empty for local servers that don't require auth.
    pub fn new(
        endpoint: String,
        api_key: String,
        model: Option<String>,
        extra_headers: Vec<(String, String)>,
    ) -> Self {
        Self {
            endpoint,
            api_key,
            model,
            extra_headers,
            client: Client::builder()
                .timeout(Duration::from_secs(300))
                .connect_timeout(Duration::from_secs(10))
                .build()
                .expect("failed to build HTTP client"),
        }
    }
}

#[async_trait]
impl Provider for HttpProvider {
    async fn chat(&self, messages: &[Message], tools: &[ToolDef]) -> anyhow::Result<ChatOutcome> {
        let mut body = json!({
            "messages": serialize_messages(messages),
        });
        if let Some(ref model) = self.model {
            body["model"] = json!(model);
        }
        if !tools.is_empty() {
            let defs: Vec<Value> = tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.parameters,
                        }
                    })
                })
                .collect();
            body["tools"] = json!(defs);
        }

        let mut req = self.client.post(&self.endpoint).json(&body);
        if !self.api_key.is_empty() {
            req = req.bearer_auth(&self.api_key);
        }
        for (k, v) in &self.extra_headers {
            req = req.header(k, v);
        }

        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!("provider returned {status}: {text}");
        }

        let parsed: Value = resp.json().await?;
        let content = parsed["choices"][0]["message"]["content"]
            .as_str()
            .filter(|s| !s.is_empty())
            .map(String::from);
        let tool_calls = parse_tool_calls(&parsed);
        let usage = parse_usage(&parsed);

        Ok(ChatOutcome {
            content,
            tool_calls,
            usage,
        })
    }
}

// ---------------------------------------------------------------------------
// Retry wrapper
// ---------------------------------------------------------------------------

/// Provider-call retry budget.
pub const CHAT_ATTEMPTS: usize = 3;

/// Call the provider, retrying transient failures with 2 s / 4 s backoff.
pub async fn chat_with_retry(
    provider: &dyn Provider,
    messages: &[Message],
    tools: &[ToolDef],
) -> anyhow::Result<ChatOutcome> {
    let mut last_err = None;
    for attempt in 0..CHAT_ATTEMPTS {
        if attempt > 0 {
            let backoff = Duration::from_secs(2u64 << (attempt - 1));
            warn!(attempt, backoff_secs = backoff.as_secs(), "retrying provider call");
            tokio::time::sleep(backoff).await;
        }
        match provider.chat(messages, tools).await {
            Ok(outcome) => return Ok(outcome),
            Err(e) => {
                warn!(attempt, error = %e, "provider call failed");
                last_err = Some(e);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("provider call failed")))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
