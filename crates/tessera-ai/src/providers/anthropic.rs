use std::collections::BTreeMap;

use serde_json::{json, Map, Value};
use tracing::debug;

use super::common::{join_url, open_event_stream, shared_http_client, sse_json_stream};
use super::{ChatProvider, ProviderFuture, StreamRequest};
use crate::abort::AbortSignal;
use crate::error::ProviderError;
use crate::normalize::WireFormat;
use crate::types::{ChatMessage, Tool, ToolChoice};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4_096;

/// Anthropic Messages API streaming.
#[derive(Debug, Clone)]
pub struct AnthropicProvider {
    base_url: String,
    api_key: Option<String>,
    headers: BTreeMap<String, String>,
}

impl AnthropicProvider {
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        headers: BTreeMap<String, String>,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.filter(|key| !key.trim().is_empty()),
            headers,
        }
    }
}

impl ChatProvider for AnthropicProvider {
    fn id(&self) -> &str {
        "anthropic"
    }

    fn wire_format(&self) -> WireFormat {
        WireFormat::AnthropicMessages
    }

    fn begin_stream(&self, request: StreamRequest, abort: AbortSignal) -> ProviderFuture {
        let provider = self.clone();
        Box::pin(async move {
            let Some(api_key) = provider.api_key.clone() else {
                return Err(ProviderError::AuthMissing(
                    "provider 'anthropic' needs an api_key".to_string(),
                ));
            };

            let payload = build_payload(&request);
            let endpoint = join_url(&provider.base_url, "messages");
            debug!(endpoint = %endpoint, "opening anthropic messages stream");

            let mut http = shared_http_client(&provider.base_url)
                .post(endpoint.as_str())
                .header("Content-Type", "application/json")
                .header("Accept", "text/event-stream")
                .header("x-api-key", api_key)
                .header("anthropic-version", ANTHROPIC_VERSION);
            for (name, value) in &provider.headers {
                http = http.header(name, value);
            }

            let response = open_event_stream(http.json(&payload), &abort).await?;
            Ok(sse_json_stream(response.bytes_stream(), abort))
        })
    }
}

pub(super) fn build_payload(request: &StreamRequest) -> Value {
    let system = request
        .messages
        .iter()
        .filter(|message| message.role == "system")
        .filter_map(|message| message.content.as_deref())
        .collect::<Vec<_>>()
        .join("\n\n");

    let mut payload = json!({
        "model": request.model,
        "stream": true,
        "max_tokens": DEFAULT_MAX_TOKENS,
        "messages": convert_messages(&request.messages),
    });
    if !system.is_empty() {
        payload["system"] = Value::String(system);
    }
    if !request.tools.is_empty() {
        payload["tools"] = convert_tools(&request.tools);
    }
    if let Some(tool_choice) = &request.tool_choice {
        payload["tool_choice"] = convert_tool_choice(tool_choice);
    }
    payload
}

fn convert_messages(messages: &[ChatMessage]) -> Vec<Value> {
    let mut converted: Vec<Value> = Vec::new();

    for message in messages {
        match message.role.as_str() {
            "system" => {}
            "tool" => {
                let block = json!({
                    "type": "tool_result",
                    "tool_use_id": message.tool_call_id.clone().unwrap_or_default(),
                    "content": message.content.clone().unwrap_or_default(),
                });
                // Consecutive tool results share one user turn.
                if let Some(previous) = converted.last_mut().filter(|last| is_tool_result_turn(last))
                {
                    if let Some(blocks) = previous["content"].as_array_mut() {
                        blocks.push(block);
                        continue;
                    }
                }
                converted.push(json!({ "role": "user", "content": [block] }));
            }
            "assistant" => {
                let mut blocks = Vec::new();
                if let Some(text) = message.content.as_deref().filter(|text| !text.is_empty()) {
                    blocks.push(json!({ "type": "text", "text": text }));
                }
                for call in message.tool_calls.iter().flatten() {
                    let input = call
                        .parsed_arguments()
                        .unwrap_or_else(|_| Value::Object(Map::new()));
                    blocks.push(json!({
                        "type": "tool_use",
                        "id": call.id,
                        "name": call.function_name,
                        "input": input,
                    }));
                }
                converted.push(json!({ "role": "assistant", "content": blocks }));
            }
            _ => converted.push(json!({
                "role": "user",
                "content": message.content.clone().unwrap_or_default(),
            })),
        }
    }

    converted
}

fn is_tool_result_turn(message: &Value) -> bool {
    message["role"] == "user"
        && message["content"]
            .as_array()
            .is_some_and(|blocks| blocks.iter().all(|block| block["type"] == "tool_result"))
}

fn convert_tools(tools: &[Tool]) -> Value {
    Value::Array(
        tools
            .iter()
            .map(|tool| {
                json!({
                    "name": tool.name,
                    "description": tool.description,
                    "input_schema": tool.parameters,
                })
            })
            .collect(),
    )
}

fn convert_tool_choice(choice: &ToolChoice) -> Value {
    match choice {
        ToolChoice::Auto => json!({ "type": "auto" }),
        ToolChoice::None => json!({ "type": "none" }),
        ToolChoice::Function(name) => json!({ "type": "tool", "name": name }),
    }
}
