//! One-to-one adaptation of provider-native stream items into [`Chunk`]s.

use std::pin::Pin;

use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ProviderError;
use crate::types::{Chunk, ToolCallFragment, Usage};

/// Item yielded by a provider transport before normalization.
#[derive(Debug, Clone, PartialEq)]
pub enum NativeItem {
    Canonical(Chunk),
    Json(Value),
}

pub type NativeStream = Pin<Box<dyn Stream<Item = Result<NativeItem, ProviderError>> + Send>>;
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<Chunk, ProviderError>> + Send>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WireFormat {
    Canonical,
    OpenAiChat,
    AnthropicMessages,
}

/// Lazily map `native` into canonical chunks. Nothing is read ahead.
pub fn normalize(format: WireFormat, native: NativeStream) -> ChunkStream {
    Box::pin(native.map(move |item| item.and_then(|item| normalize_item(format, item))))
}

pub fn normalize_item(format: WireFormat, item: NativeItem) -> Result<Chunk, ProviderError> {
    match item {
        NativeItem::Canonical(chunk) => Ok(chunk),
        NativeItem::Json(value) => match format {
            WireFormat::Canonical => serde_json::from_value(value.clone()).map_err(|error| {
                malformed(format!("canonical chunk does not deserialize: {error}"), &value)
            }),
            WireFormat::OpenAiChat => openai_chat_chunk(&value),
            WireFormat::AnthropicMessages => anthropic_event_chunk(&value),
        },
    }
}

fn malformed(message: impl Into<String>, item: &Value) -> ProviderError {
    let mut rendered = item.to_string();
    if rendered.len() > 200 {
        let mut cut = 200;
        while !rendered.is_char_boundary(cut) {
            cut -= 1;
        }
        rendered.truncate(cut);
        rendered.push_str("...");
    }
    ProviderError::Protocol(format!("{}: {rendered}", message.into()))
}

fn remote_error(error: &Value) -> ProviderError {
    let kind = error
        .get("type")
        .or_else(|| error.get("code"))
        .and_then(Value::as_str)
        .map(ToString::to_string);
    let message = error
        .get("message")
        .and_then(Value::as_str)
        .map(ToString::to_string)
        .unwrap_or_else(|| error.to_string());
    ProviderError::Remote { kind, message }
}

fn non_empty_str(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .filter(|text| !text.is_empty())
        .map(ToString::to_string)
}

fn token_count(usage: &Map<String, Value>, key: &str) -> u64 {
    usage.get(key).and_then(Value::as_u64).unwrap_or(0)
}

fn openai_chat_chunk(value: &Value) -> Result<Chunk, ProviderError> {
    let object = value
        .as_object()
        .ok_or_else(|| malformed("OpenAI chunk is not an object", value))?;

    if let Some(error) = object.get("error").filter(|error| !error.is_null()) {
        return Err(remote_error(error));
    }

    let mut chunk = Chunk::default();
    if let Some(usage) = object.get("usage").and_then(Value::as_object) {
        chunk.usage = Some(Usage {
            input_tokens: token_count(usage, "prompt_tokens"),
            output_tokens: token_count(usage, "completion_tokens"),
        });
    }

    let choices = match object.get("choices") {
        Some(Value::Array(choices)) => choices,
        Some(_) => return Err(malformed("OpenAI chunk `choices` is not an array", value)),
        None if chunk.usage.is_some() => return Ok(chunk),
        None => return Err(malformed("OpenAI chunk missing `choices`", value)),
    };
    let Some(choice) = choices.first() else {
        return Ok(chunk);
    };

    chunk.finish_reason = non_empty_str(choice.get("finish_reason"));

    let Some(delta) = choice.get("delta").and_then(Value::as_object) else {
        return Ok(chunk);
    };
    chunk.content = non_empty_str(delta.get("content"));

    match delta.get("tool_calls") {
        None | Some(Value::Null) => {}
        Some(Value::Array(entries)) => {
            for (position, entry) in entries.iter().enumerate() {
                chunk.tool_calls.push(openai_tool_fragment(position, entry, value)?);
            }
        }
        Some(_) => return Err(malformed("OpenAI `tool_calls` is not an array", value)),
    }

    Ok(chunk)
}

fn openai_tool_fragment(
    position: usize,
    entry: &Value,
    chunk: &Value,
) -> Result<ToolCallFragment, ProviderError> {
    let entry = entry
        .as_object()
        .ok_or_else(|| malformed("OpenAI tool call entry is not an object", chunk))?;

    // Some compatible backends omit `index`; fall back to array position.
    let index = match entry.get("index") {
        None | Some(Value::Null) => u32::try_from(position).ok(),
        Some(index) => index.as_u64().and_then(|index| u32::try_from(index).ok()),
    }
    .ok_or_else(|| malformed("OpenAI tool call `index` is not a u32", chunk))?;

    let function = entry.get("function").and_then(Value::as_object);
    Ok(ToolCallFragment {
        index,
        id: non_empty_str(entry.get("id")),
        function_name: non_empty_str(function.and_then(|function| function.get("name"))),
        arguments_fragment: function
            .and_then(|function| function.get("arguments"))
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string(),
    })
}

fn anthropic_block_index(event: &Value) -> Result<u32, ProviderError> {
    event
        .get("index")
        .and_then(Value::as_u64)
        .and_then(|index| u32::try_from(index).ok())
        .ok_or_else(|| malformed("Anthropic event missing `index`", event))
}

fn anthropic_event_chunk(event: &Value) -> Result<Chunk, ProviderError> {
    let event_type = event
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| malformed("Anthropic event missing `type`", event))?;

    let mut chunk = Chunk::default();
    match event_type {
        "message_start" => {
            if let Some(usage) = event
                .get("message")
                .and_then(|message| message.get("usage"))
                .and_then(Value::as_object)
            {
                chunk.usage = Some(Usage {
                    input_tokens: token_count(usage, "input_tokens"),
                    output_tokens: token_count(usage, "output_tokens"),
                });
            }
        }
        "content_block_start" => {
            let index = anthropic_block_index(event)?;
            let block = event
                .get("content_block")
                .and_then(Value::as_object)
                .ok_or_else(|| malformed("content_block_start missing `content_block`", event))?;
            match block.get("type").and_then(Value::as_str) {
                Some("text") => chunk.content = non_empty_str(block.get("text")),
                Some("tool_use") => {
                    let arguments_fragment = match block.get("input") {
                        Some(Value::Object(input)) if !input.is_empty() => {
                            Value::Object(input.clone()).to_string()
                        }
                        _ => String::new(),
                    };
                    chunk.tool_calls.push(ToolCallFragment {
                        index,
                        id: non_empty_str(block.get("id")),
                        function_name: non_empty_str(block.get("name")),
                        arguments_fragment,
                    });
                }
                Some(_) => {}
                None => return Err(malformed("content block missing `type`", event)),
            }
        }
        "content_block_delta" => {
            let index = anthropic_block_index(event)?;
            let delta = event
                .get("delta")
                .and_then(Value::as_object)
                .ok_or_else(|| malformed("content_block_delta missing `delta`", event))?;
            match delta.get("type").and_then(Value::as_str) {
                Some("text_delta") => chunk.content = non_empty_str(delta.get("text")),
                Some("input_json_delta") => {
                    let partial = delta
                        .get("partial_json")
                        .and_then(Value::as_str)
                        .ok_or_else(|| malformed("input_json_delta missing `partial_json`", event))?;
                    chunk
                        .tool_calls
                        .push(ToolCallFragment::arguments(index, partial));
                }
                Some(_) => {}
                None => return Err(malformed("content_block_delta delta missing `type`", event)),
            }
        }
        "message_delta" => {
            chunk.finish_reason = non_empty_str(
                event
                    .get("delta")
                    .and_then(|delta| delta.get("stop_reason")),
            );
            if let Some(usage) = event.get("usage").and_then(Value::as_object) {
                chunk.usage = Some(Usage {
                    input_tokens: token_count(usage, "input_tokens"),
                    output_tokens: token_count(usage, "output_tokens"),
                });
            }
        }
        "error" => {
            let error = event.get("error").unwrap_or(event);
            return Err(remote_error(error));
        }
        _ => {}
    }
    Ok(chunk)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use serde_json::json;

    fn openai(value: Value) -> Result<Chunk, ProviderError> {
        normalize_item(WireFormat::OpenAiChat, NativeItem::Json(value))
    }

    fn anthropic(value: Value) -> Result<Chunk, ProviderError> {
        normalize_item(WireFormat::AnthropicMessages, NativeItem::Json(value))
    }

    #[test]
    fn canonical_items_pass_through_unchanged() {
        let chunk = Chunk::text("hi");
        for format in [
            WireFormat::Canonical,
            WireFormat::OpenAiChat,
            WireFormat::AnthropicMessages,
        ] {
            assert_eq!(
                normalize_item(format, NativeItem::Canonical(chunk.clone())),
                Ok(chunk.clone())
            );
        }
    }

    #[test]
    fn openai_delta_maps_content_and_tool_fragments() {
        let chunk = openai(json!({
            "choices": [{
                "delta": {
                    "content": "Hel",
                    "tool_calls": [{
                        "index": 2,
                        "id": "call_1",
                        "type": "function",
                        "function": {"name": "lookup", "arguments": "{\"q\":"}
                    }]
                },
                "finish_reason": null
            }]
        }))
        .expect("valid chunk");

        assert_eq!(chunk.content.as_deref(), Some("Hel"));
        assert_eq!(
            chunk.tool_calls,
            vec![ToolCallFragment::start(2, "call_1", "lookup").with_arguments("{\"q\":")]
        );
        assert_eq!(chunk.finish_reason, None);
    }

    #[test]
    fn openai_empty_content_and_missing_arguments_are_normalized() {
        let chunk = openai(json!({
            "choices": [{
                "delta": {
                    "role": "assistant",
                    "content": "",
                    "tool_calls": [{"function": {}}]
                },
                "finish_reason": "tool_calls"
            }]
        }))
        .expect("valid chunk");

        assert_eq!(chunk.content, None);
        assert_eq!(chunk.tool_calls, vec![ToolCallFragment::arguments(0, "")]);
        assert_eq!(chunk.finish_reason.as_deref(), Some("tool_calls"));
    }

    #[test]
    fn openai_usage_only_chunk_is_not_malformed() {
        let chunk = openai(json!({
            "choices": [],
            "usage": {"prompt_tokens": 12, "completion_tokens": 3}
        }))
        .expect("usage chunk");
        assert_eq!(
            chunk.usage,
            Some(Usage {
                input_tokens: 12,
                output_tokens: 3
            })
        );
    }

    #[test]
    fn openai_malformed_items_surface_as_protocol_errors() {
        for value in [
            json!("not an object"),
            json!({"id": "x"}),
            json!({"choices": {"delta": {}}}),
            json!({"choices": [{"delta": {"tool_calls": [{"index": "zero"}]}}]}),
            json!({"choices": [{"delta": {"tool_calls": ["oops"]}}]}),
        ] {
            assert!(
                matches!(openai(value.clone()), Err(ProviderError::Protocol(_))),
                "expected protocol error for {value}"
            );
        }
    }

    #[test]
    fn openai_inline_error_is_remote_error() {
        let error = openai(json!({
            "error": {"message": "Rate limit reached", "code": "rate_limit_exceeded"}
        }))
        .expect_err("inline error");
        assert_eq!(
            error,
            ProviderError::Remote {
                kind: Some("rate_limit_exceeded".to_string()),
                message: "Rate limit reached".to_string(),
            }
        );
    }

    #[test]
    fn anthropic_tool_use_block_introduces_fragment_at_block_index() {
        let start = anthropic(json!({
            "type": "content_block_start",
            "index": 1,
            "content_block": {"type": "tool_use", "id": "toolu_1", "name": "read", "input": {}}
        }))
        .expect("start");
        assert_eq!(
            start.tool_calls,
            vec![ToolCallFragment::start(1, "toolu_1", "read")]
        );

        let delta = anthropic(json!({
            "type": "content_block_delta",
            "index": 1,
            "delta": {"type": "input_json_delta", "partial_json": "{\"path\":"}
        }))
        .expect("delta");
        assert_eq!(
            delta.tool_calls,
            vec![ToolCallFragment::arguments(1, "{\"path\":")]
        );
    }

    #[test]
    fn anthropic_text_and_stop_reason_are_mapped() {
        let text = anthropic(json!({
            "type": "content_block_delta",
            "index": 0,
            "delta": {"type": "text_delta", "text": "Hello"}
        }))
        .expect("text");
        assert_eq!(text.content.as_deref(), Some("Hello"));

        let stop = anthropic(json!({
            "type": "message_delta",
            "delta": {"stop_reason": "tool_use"},
            "usage": {"output_tokens": 9}
        }))
        .expect("message delta");
        assert_eq!(stop.finish_reason.as_deref(), Some("tool_use"));
        assert_eq!(stop.usage.map(|usage| usage.output_tokens), Some(9));
    }

    #[test]
    fn anthropic_housekeeping_events_become_empty_chunks() {
        for event in [
            json!({"type": "ping"}),
            json!({"type": "content_block_stop", "index": 0}),
            json!({"type": "message_stop"}),
            json!({"type": "content_block_delta", "index": 0, "delta": {"type": "thinking_delta", "thinking": "hmm"}}),
        ] {
            assert!(anthropic(event).expect("housekeeping").is_empty());
        }
    }

    #[test]
    fn anthropic_error_event_and_missing_type() {
        let error = anthropic(json!({
            "type": "error",
            "error": {"type": "overloaded_error", "message": "Overloaded"}
        }))
        .expect_err("error event");
        assert!(matches!(error, ProviderError::Remote { kind: Some(ref kind), .. } if kind == "overloaded_error"));

        assert!(matches!(
            anthropic(json!({"index": 0})),
            Err(ProviderError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn normalize_preserves_order_and_surfaces_errors_in_place() {
        let native: NativeStream = Box::pin(stream::iter(vec![
            Ok(NativeItem::Json(json!({"choices": [{"delta": {"content": "a"}}]}))),
            Ok(NativeItem::Json(json!({"bogus": true}))),
            Ok(NativeItem::Json(json!({"choices": [{"delta": {"content": "b"}}]}))),
        ]));

        let items = normalize(WireFormat::OpenAiChat, native)
            .collect::<Vec<_>>()
            .await;

        assert_eq!(items.len(), 3);
        assert_eq!(items[0], Ok(Chunk::text("a")));
        assert!(matches!(items[1], Err(ProviderError::Protocol(_))));
        assert_eq!(items[2], Ok(Chunk::text("b")));
    }
}
