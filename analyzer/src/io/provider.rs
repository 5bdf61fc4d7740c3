//! Completion providers: the seam between the agent loop and model inference.
//!
//! [`resolve_provider`] maps a [`BackendConfig`] onto one of a closed set of
//! [`WireShape`]s. Encoding and decoding are pure functions on JSON values;
//! [`HttpProvider`] only adds the blocking HTTP round-trip.

use std::time::Duration;

use serde_json::{Value, json};
use tracing::{debug, instrument};

use crate::core::backend::BackendConfig;
use crate::core::errors::ProviderError;
use crate::core::messages::{Message, ProviderResponse, ToolCall, ToolCallKind, ToolResult};
use crate::core::types::{ApiMode, Provider, ToolShape};

/// Whole-request timeout for one provider call.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

const SHELL_TOOL_DESCRIPTION: &str = "Run shell commands in the repository checkout. \
Pass one command as `command` or several as `commands`; `timeout_ms` bounds each command.";

/// Anything that can answer one agent turn.
pub trait CompletionProvider {
    fn submit(&mut self, messages: &[Message]) -> Result<ProviderResponse, ProviderError>;
}

/// Builds a provider per run or stage.
pub trait ProviderFactory {
    fn provider(&self, config: &BackendConfig, model: &str) -> Box<dyn CompletionProvider>;
}

/// Production factory: one [`HttpProvider`] per request.
#[derive(Debug, Clone, Copy, Default)]
pub struct HttpProviderFactory;

impl ProviderFactory for HttpProviderFactory {
    fn provider(&self, config: &BackendConfig, model: &str) -> Box<dyn CompletionProvider> {
        Box::new(resolve_provider(config, model))
    }
}

/// Request/response encoding for one backend family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireShape {
    /// Responses API with the hosted `shell` tool.
    ResponsesHosted,
    /// Responses API with a `shell` function tool.
    ResponsesFunction,
    /// Chat Completions with a `shell` function tool.
    ChatCompletions,
}

impl WireShape {
    pub fn for_backend(config: &BackendConfig) -> Self {
        match (config.api_mode, config.tool_shape()) {
            (ApiMode::ChatCompletions, _) => WireShape::ChatCompletions,
            (ApiMode::Responses, ToolShape::Hosted) => WireShape::ResponsesHosted,
            (ApiMode::Responses, ToolShape::Function) => WireShape::ResponsesFunction,
        }
    }

    fn call_kind(self) -> ToolCallKind {
        match self {
            WireShape::ResponsesHosted => ToolCallKind::HostedShell,
            WireShape::ResponsesFunction | WireShape::ChatCompletions => {
                ToolCallKind::FunctionShell
            }
        }
    }

    /// Request body for `messages`.
    pub fn encode_request(self, model: &str, messages: &[Message]) -> Value {
        match self {
            WireShape::ChatCompletions => json!({
                "model": model,
                "messages": messages.iter().flat_map(encode_chat_message).collect::<Vec<_>>(),
                "tools": [{
                    "type": "function",
                    "function": {
                        "name": "shell",
                        "description": SHELL_TOOL_DESCRIPTION,
                        "parameters": shell_parameters_schema(),
                    },
                }],
            }),
            WireShape::ResponsesHosted | WireShape::ResponsesFunction => {
                let tools = if self == WireShape::ResponsesHosted {
                    json!([{ "type": "shell" }])
                } else {
                    json!([{
                        "type": "function",
                        "name": "shell",
                        "description": SHELL_TOOL_DESCRIPTION,
                        "parameters": shell_parameters_schema(),
                    }])
                };
                json!({
                    "model": model,
                    "input": messages.iter().flat_map(encode_responses_item).collect::<Vec<_>>(),
                    "tools": tools,
                })
            }
        }
    }

    /// Decode a provider response body.
    pub fn parse_response(self, body: &Value) -> Result<ProviderResponse, ProviderError> {
        match self {
            WireShape::ChatCompletions => parse_chat_response(body, self.call_kind()),
            WireShape::ResponsesHosted | WireShape::ResponsesFunction => {
                parse_responses_output(body)
            }
        }
    }
}

fn shell_parameters_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "command": { "type": "string" },
            "commands": { "type": "array", "items": { "type": "string" } },
            "timeout_ms": { "type": "integer", "minimum": 1 },
        },
    })
}

fn encode_chat_message(message: &Message) -> Vec<Value> {
    match message {
        Message::System(text) => vec![json!({ "role": "system", "content": text })],
        Message::User(text) => vec![json!({ "role": "user", "content": text })],
        Message::Assistant { text, tool_calls } => {
            let mut value = json!({ "role": "assistant", "content": text });
            if !tool_calls.is_empty() {
                value["tool_calls"] = tool_calls
                    .iter()
                    .map(|call| {
                        json!({
                            "id": call.id,
                            "type": "function",
                            "function": { "name": "shell", "arguments": call.arguments },
                        })
                    })
                    .collect();
            }
            vec![value]
        }
        Message::Tool(result) => vec![json!({
            "role": "tool",
            "tool_call_id": result.call_id,
            "content": result.render_text(),
        })],
    }
}

fn encode_responses_item(message: &Message) -> Vec<Value> {
    match message {
        Message::System(text) => vec![json!({ "role": "system", "content": text })],
        Message::User(text) => vec![json!({ "role": "user", "content": text })],
        Message::Assistant { text, tool_calls } => {
            let mut items = Vec::new();
            if let Some(text) = text.as_deref().filter(|t| !t.is_empty()) {
                items.push(json!({ "role": "assistant", "content": text }));
            }
            for call in tool_calls {
                items.push(match call.kind {
                    ToolCallKind::HostedShell => json!({
                        "type": "shell_call",
                        "call_id": call.id,
                        "status": "completed",
                        "action": {
                            "commands": call.commands,
                            "timeout_ms": call.timeout_ms,
                        },
                    }),
                    ToolCallKind::FunctionShell => json!({
                        "type": "function_call",
                        "call_id": call.id,
                        "name": "shell",
                        "arguments": call.arguments,
                    }),
                });
            }
            items
        }
        Message::Tool(result) => vec![encode_responses_tool_output(result)],
    }
}

fn encode_responses_tool_output(result: &ToolResult) -> Value {
    match result.kind {
        ToolCallKind::FunctionShell => json!({
            "type": "function_call_output",
            "call_id": result.call_id,
            "output": result.render_text(),
        }),
        ToolCallKind::HostedShell => {
            let output: Vec<Value> = result
                .outcomes
                .iter()
                .map(|outcome| {
                    let (stderr, outcome_value) = if let Some(reason) = outcome.blocked {
                        (
                            format!("command was not executed: {reason:?}"),
                            json!({ "type": "exit", "exit_code": 1 }),
                        )
                    } else if outcome.timed_out {
                        (outcome.stderr.clone(), json!({ "type": "timeout" }))
                    } else {
                        (
                            outcome.stderr.clone(),
                            json!({ "type": "exit", "exit_code": outcome.exit_code }),
                        )
                    };
                    json!({
                        "stdout": outcome.stdout,
                        "stderr": stderr,
                        "outcome": outcome_value,
                    })
                })
                .collect();
            json!({
                "type": "shell_call_output",
                "call_id": result.call_id,
                "output": output,
            })
        }
    }
}

/// `command` and/or `commands`, trimmed, empties dropped.
fn parse_shell_arguments(arguments: &str) -> (Vec<String>, Option<u64>) {
    let Ok(value) = serde_json::from_str::<Value>(arguments) else {
        return (Vec::new(), None);
    };
    let mut commands = Vec::new();
    if let Some(command) = value.get("command").and_then(Value::as_str) {
        commands.push(command.trim().to_string());
    }
    if let Some(list) = value.get("commands").and_then(Value::as_array) {
        commands.extend(list.iter().filter_map(Value::as_str).map(|c| c.trim().to_string()));
    }
    commands.retain(|c| !c.is_empty());
    let timeout_ms = value.get("timeout_ms").and_then(Value::as_u64);
    (commands, timeout_ms)
}

fn function_call(id: &str, arguments: &str, kind: ToolCallKind) -> ToolCall {
    let (commands, timeout_ms) = parse_shell_arguments(arguments);
    ToolCall {
        id: id.to_string(),
        kind,
        commands,
        timeout_ms,
        arguments: arguments.to_string(),
    }
}

fn finish(text: Option<String>, calls: Vec<ToolCall>) -> Result<ProviderResponse, ProviderError> {
    if !calls.is_empty() {
        return Ok(ProviderResponse::ToolCalls { text, calls });
    }
    match text {
        Some(text) if !text.trim().is_empty() => Ok(ProviderResponse::Final(text)),
        _ => Err(ProviderError::Malformed(
            "response has neither text nor tool calls".to_string(),
        )),
    }
}

fn parse_chat_response(body: &Value, kind: ToolCallKind) -> Result<ProviderResponse, ProviderError> {
    let message = body
        .pointer("/choices/0/message")
        .ok_or_else(|| ProviderError::Malformed("missing choices[0].message".to_string()))?;
    let text = message
        .get("content")
        .and_then(Value::as_str)
        .map(str::to_string);
    let calls = message
        .get("tool_calls")
        .and_then(Value::as_array)
        .map(|calls| {
            calls
                .iter()
                .filter(|call| call.pointer("/function/name").and_then(Value::as_str) == Some("shell"))
                .map(|call| {
                    let id = call.get("id").and_then(Value::as_str).unwrap_or_default();
                    let arguments = call
                        .pointer("/function/arguments")
                        .and_then(Value::as_str)
                        .unwrap_or("{}");
                    function_call(id, arguments, kind)
                })
                .collect()
        })
        .unwrap_or_default();
    finish(text, calls)
}

fn parse_responses_output(body: &Value) -> Result<ProviderResponse, ProviderError> {
    let items = body
        .get("output")
        .and_then(Value::as_array)
        .ok_or_else(|| ProviderError::Malformed("missing output array".to_string()))?;
    let mut texts = Vec::new();
    let mut calls = Vec::new();
    for item in items {
        match item.get("type").and_then(Value::as_str) {
            Some("message") => {
                let parts = item.get("content").and_then(Value::as_array);
                for part in parts.into_iter().flatten() {
                    if part.get("type").and_then(Value::as_str) == Some("output_text")
                        && let Some(text) = part.get("text").and_then(Value::as_str)
                    {
                        texts.push(text.to_string());
                    }
                }
            }
            Some("function_call")
                if item.get("name").and_then(Value::as_str) == Some("shell") =>
            {
                let id = item.get("call_id").and_then(Value::as_str).unwrap_or_default();
                let arguments = item
                    .get("arguments")
                    .and_then(Value::as_str)
                    .unwrap_or("{}");
                calls.push(function_call(id, arguments, ToolCallKind::FunctionShell));
            }
            Some("shell_call") => {
                let id = item.get("call_id").and_then(Value::as_str).unwrap_or_default();
                let action = item.get("action").cloned().unwrap_or(Value::Null);
                let commands = action
                    .get("commands")
                    .and_then(Value::as_array)
                    .map(|list| {
                        list.iter()
                            .filter_map(Value::as_str)
                            .map(|c| c.trim().to_string())
                            .filter(|c| !c.is_empty())
                            .collect()
                    })
                    .unwrap_or_default();
                calls.push(ToolCall {
                    id: id.to_string(),
                    kind: ToolCallKind::HostedShell,
                    commands,
                    timeout_ms: action.get("timeout_ms").and_then(Value::as_u64),
                    arguments: action.to_string(),
                });
            }
            _ => {}
        }
    }
    let text = (!texts.is_empty()).then(|| texts.join("\n"));
    finish(text, calls)
}

enum Auth {
    Bearer(String),
    AzureKey(String),
}

/// Blocking HTTP provider for OpenAI-compatible and Azure endpoints.
pub struct HttpProvider {
    shape: WireShape,
    url: String,
    auth: Auth,
    model: String,
    agent: ureq::Agent,
}

/// Build the provider for a resolved backend and effective model.
pub fn resolve_provider(config: &BackendConfig, model: &str) -> HttpProvider {
    let shape = WireShape::for_backend(config);
    let base = config.endpoint.trim_end_matches('/');
    let (url, auth) = match config.provider {
        Provider::Azure => {
            let version = config.api_version.as_deref().unwrap_or_default();
            let url = match shape {
                WireShape::ChatCompletions => format!(
                    "{base}/openai/deployments/{model}/chat/completions?api-version={version}"
                ),
                _ => format!("{base}/openai/responses?api-version={version}"),
            };
            (url, Auth::AzureKey(config.api_key.expose().to_string()))
        }
        Provider::OpenAi => {
            let url = match shape {
                WireShape::ChatCompletions => format!("{base}/chat/completions"),
                _ => format!("{base}/responses"),
            };
            (url, Auth::Bearer(config.api_key.expose().to_string()))
        }
    };
    debug!(?shape, url = %url, model, "resolved completion provider");
    HttpProvider {
        shape,
        url,
        auth,
        model: model.to_string(),
        agent: ureq::AgentBuilder::new().timeout(REQUEST_TIMEOUT).build(),
    }
}

impl HttpProvider {
    pub fn shape(&self) -> WireShape {
        self.shape
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

fn transport_error(err: &ureq::Transport) -> ProviderError {
    let message = err.to_string();
    if message.contains("timed out") {
        ProviderError::Timeout
    } else {
        ProviderError::Transport(message)
    }
}

impl CompletionProvider for HttpProvider {
    #[instrument(skip_all, fields(shape = ?self.shape, messages = messages.len()))]
    fn submit(&mut self, messages: &[Message]) -> Result<ProviderResponse, ProviderError> {
        let body = self.shape.encode_request(&self.model, messages);
        let request = self.agent.post(&self.url);
        let request = match &self.auth {
            Auth::Bearer(key) => request.set("Authorization", &format!("Bearer {key}")),
            Auth::AzureKey(key) => request.set("api-key", key),
        };
        let response = match request.send_json(body) {
            Ok(response) => response,
            Err(ureq::Error::Status(status, response)) => {
                let body = response.into_string().unwrap_or_default();
                return Err(ProviderError::Http { status, body });
            }
            Err(ureq::Error::Transport(err)) => return Err(transport_error(&err)),
        };
        let value: Value = response
            .into_json()
            .map_err(|e| ProviderError::Malformed(e.to_string()))?;
        self.shape.parse_response(&value)
    }
}
