use std::collections::BTreeMap;

use serde_json::{json, Value};
use tracing::debug;

use super::common::{join_url, open_event_stream, shared_http_client, sse_json_stream};
use super::{ChatProvider, ProviderFuture, StreamRequest};
use crate::abort::AbortSignal;
use crate::error::ProviderError;
use crate::normalize::WireFormat;
use crate::types::{ChatMessage, Tool, ToolChoice};

/// Chat-completions streaming over any OpenAI-compatible endpoint.
#[derive(Debug, Clone)]
pub struct OpenAiCompatibleProvider {
    id: String,
    base_url: String,
    api_key: Option<String>,
    headers: BTreeMap<String, String>,
    requires_key: bool,
}

impl OpenAiCompatibleProvider {
    pub fn new(
        id: impl Into<String>,
        base_url: impl Into<String>,
        api_key: Option<String>,
        headers: BTreeMap<String, String>,
        requires_key: bool,
    ) -> Self {
        Self {
            id: id.into(),
            base_url: base_url.into(),
            api_key: api_key.filter(|key| !key.trim().is_empty()),
            headers,
            requires_key,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

impl ChatProvider for OpenAiCompatibleProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn wire_format(&self) -> WireFormat {
        WireFormat::OpenAiChat
    }

    fn begin_stream(&self, request: StreamRequest, abort: AbortSignal) -> ProviderFuture {
        let provider = self.clone();
        Box::pin(async move {
            if provider.requires_key && provider.api_key.is_none() {
                return Err(ProviderError::AuthMissing(format!(
                    "provider '{}' needs an api_key",
                    provider.id
                )));
            }

            let payload = build_payload(&request);
            let endpoint = join_url(&provider.base_url, "chat/completions");
            debug!(provider = %provider.id, endpoint = %endpoint, "opening chat completions stream");

            let mut http = shared_http_client(&provider.base_url)
                .post(endpoint.as_str())
                .header("Content-Type", "application/json")
                .header("Accept", "text/event-stream");
            if let Some(api_key) = &provider.api_key {
                http = http.header("Authorization", format!("Bearer {api_key}"));
            }
            for (name, value) in &provider.headers {
                http = http.header(name, value);
            }

            let response = open_event_stream(http.json(&payload), &abort).await?;
            Ok(sse_json_stream(response.bytes_stream(), abort))
        })
    }
}

pub(super) fn build_payload(request: &StreamRequest) -> Value {
    let mut payload = json!({
        "model": request.model,
        "stream": true,
        "stream_options": { "include_usage": true },
        "messages": request.messages.iter().map(convert_message).collect::<Vec<_>>(),
    });
    if !request.tools.is_empty() {
        payload["tools"] = convert_tools(&request.tools);
    }
    if let Some(tool_choice) = &request.tool_choice {
        payload["tool_choice"] = convert_tool_choice(tool_choice);
    }
    payload
}

fn convert_message(message: &ChatMessage) -> Value {
    let mut converted = json!({
        "role": message.role,
        "content": message.content,
    });
    if let Some(tool_calls) = message.tool_calls.as_ref().filter(|calls| !calls.is_empty()) {
        converted["tool_calls"] = Value::Array(
            tool_calls
                .iter()
                .map(|call| {
                    json!({
                        "id": call.id,
                        "type": "function",
                        "function": {
                            "name": call.function_name,
                            "arguments": call.arguments,
                        }
                    })
                })
                .collect(),
        );
    }
    if let Some(tool_call_id) = &message.tool_call_id {
        converted["tool_call_id"] = json!(tool_call_id);
    }
    if let Some(name) = &message.name {
        converted["name"] = json!(name);
    }
    converted
}

fn convert_tools(tools: &[Tool]) -> Value {
    Value::Array(
        tools
            .iter()
            .map(|tool| {
                json!({
                    "type": "function",
                    "function": {
                        "name": tool.name,
                        "description": tool.description,
                        "parameters": tool.parameters,
                    }
                })
            })
            .collect(),
    )
}

fn convert_tool_choice(choice: &ToolChoice) -> Value {
    match choice {
        ToolChoice::Auto => json!("auto"),
        ToolChoice::None => json!("none"),
        ToolChoice::Function(name) => json!({
            "type": "function",
            "function": { "name": name },
        }),
    }
}
