use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use tokio::time::{sleep, Duration};

use crate::core::config::{check_url, require_secret, resolve_secret, Config};
use crate::core::error::GenerationError;

const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const OLLAMA_BASE_URL: &str = "http://localhost:11434/v1";
const OPENAI_KEY_ENV: &str = "OPENAI_API_KEY";

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_provider")]
    pub provider: String, // "openai" or "ollama"
    #[serde(default = "default_model")]
    pub model: String,
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    #[serde(default)]
    pub retry_count: usize,
    #[serde(default = "default_retry_delay")]
    pub retry_delay_seconds: u64,
    #[serde(default = "default_max_tool_rounds")]
    pub max_tool_rounds: usize,
    pub temperature: Option<f32>,
}

fn default_provider() -> String {
    "openai".to_string()
}
fn default_model() -> String {
    "gpt-4-turbo".to_string()
}
fn default_retry_delay() -> u64 {
    10
}
fn default_max_tool_rounds() -> usize {
    16
}

impl LlmConfig {
    pub fn effective_base_url(&self) -> String {
        let fallback = match self.provider.as_str() {
            "ollama" => OLLAMA_BASE_URL,
            _ => OPENAI_BASE_URL,
        };
        self.base_url
            .as_deref()
            .unwrap_or(fallback)
            .trim_end_matches('/')
            .to_string()
    }

    pub fn validate(&self) -> Result<(), GenerationError> {
        match self.provider.as_str() {
            "openai" => {
                require_secret(self.api_key.as_deref(), OPENAI_KEY_ENV, "OpenAI")?;
            }
            "ollama" => {}
            other => {
                return Err(GenerationError::Configuration(format!(
                    "unknown LLM provider: {}",
                    other
                )))
            }
        }
        if self.model.trim().is_empty() {
            return Err(GenerationError::Configuration("llm.model must not be empty".to_string()));
        }
        if self.max_tool_rounds == 0 {
            return Err(GenerationError::Configuration(
                "llm.max_tool_rounds must be at least 1".to_string(),
            ));
        }
        check_url("llm.base_url", &self.effective_base_url())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    fn text(role: ChatRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: Some(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::text(ChatRole::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::text(ChatRole::User, content)
    }

    pub fn assistant(content: Option<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content,
            tool_calls,
            tool_call_id: None,
        }
    }

    pub fn tool(call_id: &str, content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Tool,
            content: Some(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: Some(call_id.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type", default = "default_tool_type")]
    pub kind: String,
    pub function: FunctionCall,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    /// JSON-encoded arguments, exactly as the model produced them.
    #[serde(default)]
    pub arguments: String,
}

fn default_tool_type() -> String {
    "function".to_string()
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolSpec {
    #[serde(rename = "type")]
    kind: &'static str,
    function: FunctionSpec,
}

#[derive(Debug, Clone, Serialize)]
struct FunctionSpec {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

impl ToolSpec {
    pub fn function(name: &str, description: &str, parameters: serde_json::Value) -> Self {
        Self {
            kind: "function",
            function: FunctionSpec {
                name: name.to_string(),
                description: description.to_string(),
                parameters,
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.function.name
    }
}

/// One chat-completion round trip. The reply either carries text or tool calls.
#[async_trait]
pub trait LlmClient: Send + Sync + Debug {
    async fn chat(&self, messages: &[ChatMessage], tools: &[ToolSpec]) -> Result<ChatMessage>;
}

pub fn create_llm(config: &Config) -> Result<Box<dyn LlmClient>> {
    let llm = &config.llm;
    llm.validate()?;
    let api_key = resolve_secret(llm.api_key.as_deref(), OPENAI_KEY_ENV);
    match llm.provider.as_str() {
        "openai" | "ollama" => Ok(Box::new(OpenAIClient::new(
            llm,
            api_key.as_deref(),
            &llm.effective_base_url(),
        ))),
        _ => Err(anyhow!("Unknown LLM provider: {}", llm.provider)),
    }
}

// --- OpenAI-compatible chat completions (OpenAI, Ollama /v1) ---

#[derive(Debug)]
pub struct OpenAIClient {
    api_key: Option<String>,
    model: String,
    base_url: String,
    temperature: Option<f32>,
    retry_count: usize,
    retry_delay: Duration,
    client: reqwest::Client,
}

impl OpenAIClient {
    pub fn new(config: &LlmConfig, api_key: Option<&str>, base_url: &str) -> Self {
        Self {
            api_key: api_key.map(str::to_string),
            model: config.model.clone(),
            base_url: base_url.trim_end_matches('/').to_string(),
            temperature: config.temperature,
            retry_count: config.retry_count,
            retry_delay: Duration::from_secs(config.retry_delay_seconds),
            client: reqwest::Client::new(),
        }
    }

    async fn send_once(&self, body: &OpenAIRequest<'_>) -> Result<Attempt> {
        let url = format!("{}/chat/completions", self.base_url);
        let mut request = self.client.post(&url).json(body);
        if let Some(key) = &self.api_key {
            request = request.header("Authorization", format!("Bearer {}", key));
        }

        let resp = match request.send().await {
            Ok(resp) => resp,
            Err(e) => return Ok(Attempt::Retryable(anyhow!(e).context("Failed to reach chat API"))),
        };

        let status = resp.status();
        let body_text = resp.text().await?;
        if status.is_success() {
            return Ok(Attempt::Done(body_text));
        }

        let err = anyhow!("Chat API error ({}): {}", status.as_u16(), body_text);
        if status.as_u16() == 429 || status.is_server_error() {
            Ok(Attempt::Retryable(err))
        } else {
            Err(err)
        }
    }
}

enum Attempt {
    Done(String),
    Retryable(anyhow::Error),
}

#[derive(Serialize)]
struct OpenAIRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "no_tools")]
    tools: &'a [ToolSpec],
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

fn no_tools(tools: &&[ToolSpec]) -> bool {
    tools.is_empty()
}

#[derive(Deserialize)]
struct OpenAIResponse {
    #[serde(default)]
    choices: Vec<OpenAIChoice>,
    error: Option<OpenAIError>,
}

#[derive(Deserialize)]
struct OpenAIChoice {
    message: OpenAIMessageResponse,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct OpenAIMessageResponse {
    content: Option<String>,
    tool_calls: Option<Vec<ToolCall>>,
}

#[derive(Deserialize, Debug)]
struct OpenAIError {
    message: String,
}

fn parse_reply(body: &str) -> Result<ChatMessage> {
    let result: OpenAIResponse = serde_json::from_str(body)
        .with_context(|| format!("Failed to parse chat response. Body: {}", body))?;

    if let Some(err) = result.error {
        return Err(anyhow!("Chat API returned error: {}", err.message));
    }

    let choice = result
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("Chat response has no choices. Body: {}", body))?;

    let tool_calls = choice.message.tool_calls.unwrap_or_default();
    let content = choice.message.content.filter(|c| !c.trim().is_empty());
    if content.is_none() && tool_calls.is_empty() {
        let reason = choice.finish_reason.as_deref().unwrap_or("UNKNOWN");
        return Err(anyhow!("Chat response empty. Finish reason: {}", reason));
    }

    Ok(ChatMessage::assistant(content, tool_calls))
}

#[async_trait]
impl LlmClient for OpenAIClient {
    async fn chat(&self, messages: &[ChatMessage], tools: &[ToolSpec]) -> Result<ChatMessage> {
        let body = OpenAIRequest {
            model: &self.model,
            messages,
            tools,
            temperature: self.temperature,
        };

        let mut last_error = anyhow!("Chat API was not called");
        for attempt in 0..=self.retry_count {
            if attempt > 0 {
                warn!(
                    "Chat request failed (attempt {}/{}), retrying in {:?}: {:#}",
                    attempt,
                    self.retry_count + 1,
                    self.retry_delay,
                    last_error
                );
                sleep(self.retry_delay).await;
            }

            debug!("Sending chat request with {} messages", messages.len());
            match self.send_once(&body).await? {
                Attempt::Done(text) => return parse_reply(&text),
                Attempt::Retryable(e) => last_error = e,
            }
        }

        Err(last_error)
    }
}
