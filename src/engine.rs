use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::error::SwitchboardError;
use crate::tools::ToolCall;

/// What the engine produced for one turn: either dialogue to speak to the
/// caller, or a set of validated tool-call requests.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineTurn {
    Dialogue(String),
    ToolCalls(Vec<ToolCall>),
}

/// A dispatched tool's result, rendered for the engine.
#[derive(Debug, Clone)]
pub struct ToolResultMsg {
    pub tool: &'static str,
    pub output: String,
}

/// Conversational AI engine boundary. Internals (reasoning, speech models)
/// are out of scope; per call the orchestrator opens one conversation and
/// drives it turn by turn.
#[async_trait]
pub trait AiEngine: Send + Sync {
    async fn begin(
        &self,
        system_prompt: &str,
    ) -> Result<Box<dyn EngineConversation>, SwitchboardError>;
}

#[async_trait]
pub trait EngineConversation: Send {
    /// Out-of-band steering text (greeting prompts, status blurbs).
    async fn instruct(&mut self, instruction: &str) -> Result<EngineTurn, SwitchboardError>;

    /// One completed caller utterance.
    async fn user_turn(&mut self, transcript: &str) -> Result<EngineTurn, SwitchboardError>;

    /// Tool outcomes fed back for a follow-up turn.
    async fn tool_turn(
        &mut self,
        results: &[ToolResultMsg],
    ) -> Result<EngineTurn, SwitchboardError>;
}

/// Assemble the per-call system prompt around the route's persona blurb.
pub fn build_system_prompt(blurb: Option<&str>) -> String {
    let persona = blurb.unwrap_or("helpful phone assistant");
    format!(
        "You are a {persona} answering questions over the phone, strictly from \
         the knowledge base reachable through the search tool.\n\
         - Always search the knowledge base before answering a question.\n\
         - Search results arrive as entries tagged with a [source: ...] label \
         and separated by a line containing only ---; treat --- as the result \
         separator.\n\
         - If nothing relevant is found, politely say you don't know.\n\
         - Keep responses brief and clear; the caller is listening, not reading.\n\
         - Use send_sms when the caller asks for something in writing, \
         transfer_call when they ask for a human, and end_call only after the \
         caller confirms they are done.\n\
         - Never answer from general knowledge outside the search results."
    )
}

pub const GREETING_INSTRUCTION: &str =
    "Greet the caller with a quick cheery message asking how you can help them.";

/// JSON schemas for the four tools, advertised to the engine.
pub fn tool_schemas() -> Value {
    json!([
        {
            "type": "function",
            "function": {
                "name": "send_sms",
                "description": "Send the caller up to 3 SMS messages of at most 300 characters each.",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "messages": {
                            "type": "array",
                            "items": { "type": "string", "maxLength": 300 },
                            "minItems": 1,
                            "maxItems": 3
                        }
                    },
                    "required": ["messages"]
                }
            }
        },
        {
            "type": "function",
            "function": {
                "name": "search",
                "description": "Search the knowledge base for the caller's question.",
                "parameters": {
                    "type": "object",
                    "properties": { "query": { "type": "string" } },
                    "required": ["query"]
                }
            }
        },
        {
            "type": "function",
            "function": {
                "name": "end_call",
                "description": "Hang up after the caller confirms the conversation is over.",
                "parameters": {
                    "type": "object",
                    "properties": { "reason": { "type": "string" } },
                    "required": ["reason"]
                }
            }
        },
        {
            "type": "function",
            "function": {
                "name": "transfer_call",
                "description": "Transfer the caller to a human agent.",
                "parameters": { "type": "object", "properties": {} }
            }
        }
    ])
}

/// OpenAI-compatible chat-completions engine.
#[derive(Clone)]
pub struct ChatCompletionsEngine {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
}

impl ChatCompletionsEngine {
    pub fn new(
        client: reqwest::Client,
        base_url: String,
        api_key: Option<String>,
        model: String,
    ) -> Self {
        Self {
            client,
            base_url,
            api_key,
            model,
        }
    }
}

#[async_trait]
impl AiEngine for ChatCompletionsEngine {
    async fn begin(
        &self,
        system_prompt: &str,
    ) -> Result<Box<dyn EngineConversation>, SwitchboardError> {
        Ok(Box::new(ChatConversation {
            engine: self.clone(),
            messages: vec![json!({"role": "system", "content": system_prompt})],
            pending_call_ids: Vec::new(),
        }))
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<RawToolCall>,
}

#[derive(Debug, Deserialize)]
struct RawToolCall {
    id: String,
    function: RawFunction,
}

#[derive(Debug, Deserialize)]
struct RawFunction {
    name: String,
    arguments: String,
}

struct ChatConversation {
    engine: ChatCompletionsEngine,
    messages: Vec<Value>,
    /// Call ids from the last tool-call turn, in request order, so results
    /// can be threaded back.
    pending_call_ids: Vec<String>,
}

impl ChatConversation {
    async fn complete(&mut self) -> Result<EngineTurn, SwitchboardError> {
        let url = format!(
            "{}/chat/completions",
            self.engine.base_url.trim_end_matches('/')
        );
        let body = json!({
            "model": self.engine.model,
            "messages": self.messages,
            "tools": tool_schemas(),
        });
        let mut rb = self.engine.client.post(url).json(&body);
        if let Some(key) = &self.engine.api_key {
            rb = rb.bearer_auth(key);
        }
        let resp = rb
            .send()
            .await
            .map_err(|e| SwitchboardError::collaborator("engine", e))?;
        if !resp.status().is_success() {
            return Err(SwitchboardError::collaborator("engine", resp.status()));
        }
        let parsed: ChatResponse = resp
            .json()
            .await
            .map_err(|e| SwitchboardError::collaborator("engine", e))?;
        let message = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message)
            .ok_or_else(|| SwitchboardError::collaborator("engine", "empty choices"))?;

        if !message.tool_calls.is_empty() {
            let mut calls = Vec::with_capacity(message.tool_calls.len());
            let mut ids = Vec::with_capacity(message.tool_calls.len());
            let mut raw_calls = Vec::new();
            for raw in &message.tool_calls {
                let args: Value = serde_json::from_str(&raw.function.arguments)
                    .unwrap_or_else(|_| json!({}));
                calls.push(ToolCall::parse(&raw.function.name, &args)?);
                ids.push(raw.id.clone());
                raw_calls.push(json!({
                    "id": raw.id,
                    "type": "function",
                    "function": {
                        "name": raw.function.name,
                        "arguments": raw.function.arguments,
                    }
                }));
            }
            self.messages
                .push(json!({"role": "assistant", "content": null, "tool_calls": raw_calls}));
            self.pending_call_ids = ids;
            return Ok(EngineTurn::ToolCalls(calls));
        }

        let content = message.content.unwrap_or_default();
        self.messages
            .push(json!({"role": "assistant", "content": content}));
        Ok(EngineTurn::Dialogue(content))
    }
}

#[async_trait]
impl EngineConversation for ChatConversation {
    async fn instruct(&mut self, instruction: &str) -> Result<EngineTurn, SwitchboardError> {
        self.messages
            .push(json!({"role": "user", "content": instruction}));
        self.complete().await
    }

    async fn user_turn(&mut self, transcript: &str) -> Result<EngineTurn, SwitchboardError> {
        self.messages
            .push(json!({"role": "user", "content": transcript}));
        self.complete().await
    }

    async fn tool_turn(
        &mut self,
        results: &[ToolResultMsg],
    ) -> Result<EngineTurn, SwitchboardError> {
        let ids = std::mem::take(&mut self.pending_call_ids);
        for (i, result) in results.iter().enumerate() {
            let call_id = ids.get(i).cloned().unwrap_or_else(|| format!("call_{i}"));
            self.messages.push(json!({
                "role": "tool",
                "tool_call_id": call_id,
                "content": result.output,
            }));
        }
        self.complete().await
    }
}
