use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use log::{debug, info};
use serde_json::Value;
use std::sync::Arc;

use crate::services::capability::Capability;
use crate::services::llm::{ChatMessage, LlmClient, ToolSpec};
use crate::services::pipeline::{CapabilityKind, Role};
use crate::services::workflow::EventSink;
use crate::utils::text::strip_code_blocks;

/// Text of an upstream step handed to a later one.
#[derive(Debug, Clone, PartialEq)]
pub struct ContextEntry {
    pub step_id: String,
    pub title: String,
    pub text: String,
}

/// Everything the reasoning service needs to produce one step's text.
pub struct DelegationRequest<'a> {
    pub step_id: &'a str,
    pub role: &'a Role,
    pub instruction: &'a str,
    pub expected_output: &'a str,
    pub context: &'a [ContextEntry],
    pub capabilities: &'a [Arc<dyn Capability>],
    /// Receives a line per capability call.
    pub events: &'a dyn EventSink,
}

/// Produces the final text for a step, possibly calling capabilities on the way.
#[async_trait]
pub trait ReasoningService: Send + Sync {
    async fn resolve(&self, request: DelegationRequest<'_>) -> Result<String>;
}

/// Tool-calling chat loop over an OpenAI-compatible model.
#[derive(Debug)]
pub struct AgentService {
    llm: Box<dyn LlmClient>,
    max_tool_rounds: usize,
}

impl AgentService {
    pub fn new(llm: Box<dyn LlmClient>, max_tool_rounds: usize) -> Self {
        Self {
            llm,
            max_tool_rounds,
        }
    }
}

fn persona_prompt(role: &Role) -> String {
    format!(
        "You are {}. {}\nYour personal goal is: {}",
        role.name, role.backstory, role.goal
    )
}

fn task_prompt(request: &DelegationRequest<'_>) -> String {
    let mut prompt = format!(
        "{}\n\nThis is the expected criteria for your final answer: {}\n\
         You MUST return the actual complete content as the final answer, not a summary.",
        request.instruction, request.expected_output
    );
    if !request.context.is_empty() {
        prompt.push_str("\n\nThis is the context you're working with:");
        for entry in request.context {
            prompt.push_str(&format!("\n\n## {} ({})\n{}", entry.title, entry.step_id, entry.text));
        }
    }
    prompt
}

fn parse_arguments(raw: &str) -> Result<Value> {
    if raw.trim().is_empty() {
        return Ok(Value::Object(Default::default()));
    }
    serde_json::from_str(raw).with_context(|| format!("Invalid tool arguments: {}", raw))
}

#[async_trait]
impl ReasoningService for AgentService {
    async fn resolve(&self, request: DelegationRequest<'_>) -> Result<String> {
        let tools: Vec<ToolSpec> = request.capabilities.iter().map(|c| c.spec()).collect();
        let mut messages = vec![
            ChatMessage::system(persona_prompt(request.role)),
            ChatMessage::user(task_prompt(&request)),
        ];

        let mut rounds = 0;
        loop {
            let reply = self.llm.chat(&messages, &tools).await?;

            if reply.tool_calls.is_empty() {
                let text = strip_code_blocks(reply.content.as_deref().unwrap_or_default());
                if text.is_empty() {
                    bail!("{} returned an empty answer", request.role.name);
                }
                return Ok(text);
            }

            rounds += 1;
            if rounds > self.max_tool_rounds {
                bail!(
                    "{} exceeded {} tool rounds without a final answer",
                    request.role.name,
                    self.max_tool_rounds
                );
            }

            let calls = reply.tool_calls.clone();
            messages.push(reply);
            for call in calls {
                let name = call.function.name.as_str();
                let capability = request
                    .capabilities
                    .iter()
                    .find(|c| c.kind().as_str() == name)
                    .ok_or_else(|| anyhow!("Model called unavailable tool '{}'", name))?;

                let line = format!("[{}] {} calls {}", request.step_id, request.role.name, name);
                info!("{}", line);
                request.events.log_line(&line);
                let arguments = parse_arguments(&call.function.arguments)?;
                let output = capability
                    .invoke(&arguments)
                    .await
                    .with_context(|| format!("Tool '{}' failed", name))?;
                debug!("[{}] {} returned {} chars", request.step_id, name, output.len());
                if capability.kind() == CapabilityKind::GenerateImage {
                    request.events.log_line(&format!("[{}] image {}", request.step_id, output));
                }
                messages.push(ChatMessage::tool(&call.id, output));
            }
        }
    }
}
