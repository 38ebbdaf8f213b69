//! Index-keyed reconstruction of content and tool calls from canonical chunks.

use std::collections::BTreeMap;

use futures_util::{Stream, StreamExt};
use tracing::warn;

use crate::classify::classify;
use crate::error::{ChatError, ChatErrorCode, ErrorCategory, ProviderError};
use crate::types::{AssembledResponse, Chunk, ToolCall, Usage};

pub type CallbackError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Live sink for content fragments, invoked once per fragment in arrival order.
pub type ContentCallback = Box<dyn FnMut(&str) -> Result<(), CallbackError> + Send>;

#[derive(Debug, Default, Clone)]
struct PendingToolCall {
    id: Option<String>,
    function_name: Option<String>,
    arguments: String,
}

impl PendingToolCall {
    fn to_tool_call(&self, index: u32) -> ToolCall {
        if self.id.is_none() || self.function_name.is_none() {
            warn!(
                index,
                has_id = self.id.is_some(),
                has_name = self.function_name.is_some(),
                "tool call finalized without id or function name"
            );
        }
        ToolCall {
            id: self.id.clone().unwrap_or_default(),
            function_name: self.function_name.clone().unwrap_or_default(),
            arguments: self.arguments.clone(),
        }
    }
}

#[derive(Debug, Default)]
pub struct ChunkAssembler {
    content: String,
    working: BTreeMap<u32, PendingToolCall>,
    finish_reason: Option<String>,
    usage: Option<Usage>,
    fragments: usize,
}

impl ChunkAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one chunk in. Tool-call fragments are applied before content; the
    /// callback sees the content fragment before this method returns.
    pub fn push(
        &mut self,
        chunk: Chunk,
        on_content: Option<&mut ContentCallback>,
    ) -> Result<(), ChatError> {
        for fragment in chunk.tool_calls {
            let pending = self.working.entry(fragment.index).or_default();
            if let Some(id) = fragment.id {
                pending.id = Some(id);
            }
            if let Some(function_name) = fragment.function_name {
                pending.function_name = Some(function_name);
            }
            pending.arguments.push_str(&fragment.arguments_fragment);
            self.fragments += 1;
        }

        if let Some(reason) = chunk.finish_reason {
            self.finish_reason = Some(reason);
        }
        if let Some(usage) = chunk.usage {
            // Later reports win per field; zero means "not reported".
            let previous = self.usage.unwrap_or_default();
            self.usage = Some(Usage {
                input_tokens: non_zero_or(usage.input_tokens, previous.input_tokens),
                output_tokens: non_zero_or(usage.output_tokens, previous.output_tokens),
            });
        }

        if let Some(fragment) = chunk.content.filter(|fragment| !fragment.is_empty()) {
            self.content.push_str(&fragment);
            self.fragments += 1;
            if let Some(callback) = on_content {
                callback(&fragment).map_err(callback_error)?;
            }
        }
        Ok(())
    }

    /// Whether any content or tool-call fragment has been accepted.
    pub fn has_delivered(&self) -> bool {
        self.fragments > 0
    }

    pub fn finish_reason(&self) -> Option<&str> {
        self.finish_reason.as_deref()
    }

    pub fn usage(&self) -> Option<Usage> {
        self.usage
    }

    /// The response as accumulated so far, without consuming the assembler.
    pub fn snapshot(&self) -> AssembledResponse {
        AssembledResponse {
            content: self.content.clone(),
            tool_calls: self
                .working
                .iter()
                .map(|(index, pending)| pending.to_tool_call(*index))
                .collect(),
            metadata: None,
        }
    }

    pub fn finish(self) -> AssembledResponse {
        let tool_calls = self
            .working
            .iter()
            .map(|(index, pending)| pending.to_tool_call(*index))
            .collect();
        AssembledResponse {
            content: self.content,
            tool_calls,
            metadata: None,
        }
    }
}

fn non_zero_or(value: u64, fallback: u64) -> u64 {
    if value == 0 {
        fallback
    } else {
        value
    }
}

fn callback_error(error: CallbackError) -> ChatError {
    ChatError::new(
        ErrorCategory::Client,
        ChatErrorCode::CallbackFailed,
        format!("content callback failed: {error}"),
    )
    .with_cause(CallbackFailure(error))
}

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
struct CallbackFailure(CallbackError);

/// Drain `chunks` into a single response. A stream error is returned with the
/// partial response attached; nothing is retried here.
pub async fn assemble<S>(
    chunks: S,
    mut on_content: Option<ContentCallback>,
) -> Result<AssembledResponse, ChatError>
where
    S: Stream<Item = Result<Chunk, ProviderError>>,
{
    let mut assembler = ChunkAssembler::new();
    futures_util::pin_mut!(chunks);
    while let Some(item) = chunks.next().await {
        match item {
            Ok(chunk) => assembler.push(chunk, on_content.as_mut())?,
            Err(error) => return Err(interrupted(error, &assembler)),
        }
    }
    Ok(assembler.finish())
}

/// Mid-stream failure, carrying whatever had been assembled. Malformed items
/// keep their protocol code; other failures after delivery become
/// `StreamInterrupted`.
pub(crate) fn interrupted(error: ProviderError, assembler: &ChunkAssembler) -> ChatError {
    let mut classified = classify(error);
    if assembler.has_delivered() && classified.code != ChatErrorCode::ProviderProtocol {
        classified.code = ChatErrorCode::StreamInterrupted;
    }
    classified
        .with_details(serde_json::json!({ "stage": "streaming", "delivered": assembler.has_delivered() }))
        .with_partial(assembler.snapshot())
}
