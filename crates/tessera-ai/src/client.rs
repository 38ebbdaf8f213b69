use std::fmt;
use std::sync::Arc;

use serde_json::{json, Map, Value};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::abort::{AbortController, AbortSignal, CallScope};
use crate::assembler::{interrupted, CallbackError, ChunkAssembler, ContentCallback};
use crate::config::ClientConfig;
use crate::error::{ChatError, ProviderError};
use crate::normalize::normalize;
use crate::providers::{resolve_provider, ChatProviderRef, ProviderSettings, StreamRequest};
use crate::retry::{RetryExecutor, RetryPolicy};
use crate::types::{AssembledResponse, ChatMessage, Chunk, Tool, ToolChoice};

/// Per-call options for [`ChatClient::send_chat`].
pub struct ChatOptions {
    pub model: String,
    pub tools: Vec<Tool>,
    pub tool_choice: Option<ToolChoice>,
    pub timeout_ms: Option<u64>,
    pub retry_policy: Option<RetryPolicy>,
    pub abort_signal: Option<AbortSignal>,
    pub on_content: Option<ContentCallback>,
}

impl ChatOptions {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            tools: Vec::new(),
            tool_choice: None,
            timeout_ms: None,
            retry_policy: None,
            abort_signal: None,
            on_content: None,
        }
    }

    pub fn with_tools(mut self, tools: Vec<Tool>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_tool_choice(mut self, tool_choice: ToolChoice) -> Self {
        self.tool_choice = Some(tool_choice);
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = Some(retry_policy);
        self
    }

    pub fn with_abort_signal(mut self, abort_signal: AbortSignal) -> Self {
        self.abort_signal = Some(abort_signal);
        self
    }

    pub fn on_content<F>(mut self, callback: F) -> Self
    where
        F: FnMut(&str) -> Result<(), CallbackError> + Send + 'static,
    {
        self.on_content = Some(Box::new(callback));
        self
    }
}

impl fmt::Debug for ChatOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChatOptions")
            .field("model", &self.model)
            .field("tools", &self.tools.len())
            .field("tool_choice", &self.tool_choice)
            .field("timeout_ms", &self.timeout_ms)
            .field("retry_policy", &self.retry_policy)
            .field("abort_signal", &self.abort_signal.is_some())
            .field("on_content", &self.on_content.is_some())
            .finish()
    }
}

/// Entry point for streamed chat calls against one resolved provider.
///
/// Cloning is cheap; clones share the provider handle and configuration and
/// may be used concurrently. Every call owns its own timer, abort controller
/// and accumulator.
#[derive(Clone)]
pub struct ChatClient {
    provider: ChatProviderRef,
    config: Arc<ClientConfig>,
}

impl fmt::Debug for ChatClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChatClient")
            .field("provider", &self.provider.id())
            .field("config", &self.config)
            .finish()
    }
}

enum Step {
    Item(Option<Result<Chunk, ProviderError>>),
    TimedOut,
    Cancelled,
}

impl ChatClient {
    pub fn from_settings(settings: ProviderSettings, config: ClientConfig) -> Result<Self, ChatError> {
        let provider = resolve_provider(&settings)?;
        Self::with_provider(provider, config)
    }

    pub fn with_provider(provider: ChatProviderRef, config: ClientConfig) -> Result<Self, ChatError> {
        config.validate()?;
        Ok(Self {
            provider,
            config: Arc::new(config),
        })
    }

    pub fn provider_id(&self) -> &str {
        self.provider.id()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Stream one completion and assemble it.
    ///
    /// Only stream establishment is retried. Content already handed to
    /// `on_content` is never replayed: a failure after the first chunk is
    /// returned with the partial response attached.
    pub async fn send_chat(
        &self,
        messages: &[ChatMessage],
        options: ChatOptions,
    ) -> Result<AssembledResponse, ChatError> {
        let ChatOptions {
            model,
            tools,
            tool_choice,
            timeout_ms,
            retry_policy,
            abort_signal,
            mut on_content,
        } = options;

        validate_request(messages, &model, &tools, tool_choice.as_ref())?;
        let timeout = self.config.timeout.resolve(timeout_ms)?;
        let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        let executor =
            RetryExecutor::new(retry_policy.unwrap_or_else(|| self.config.retry.clone()))?;
        if abort_signal.as_ref().is_some_and(AbortSignal::is_aborted) {
            return Err(ChatError::cancelled());
        }

        let provider = self.provider.clone();
        let deadline = Instant::now() + timeout;
        let mut scope = CallScope::new(AbortController::new());
        let transport_signal = scope.signal();
        let request = StreamRequest {
            model: model.clone(),
            messages: messages.to_vec(),
            tools,
            tool_choice,
        };
        debug!(
            provider = provider.id(),
            model = %model,
            timeout_ms,
            max_attempts = executor.policy().max_attempts,
            "starting chat request"
        );

        let establish = executor.run(provider.id(), |attempt| {
            debug!(provider = provider.id(), attempt, "opening provider stream");
            provider.begin_stream(request.clone(), transport_signal.clone())
        });
        let established = tokio::select! {
            biased;
            _ = wait_for_abort(abort_signal.as_ref()) => Err(ChatError::cancelled()),
            result = tokio::time::timeout_at(deadline, establish) => match result {
                Ok(result) => result,
                Err(_) => Err(ChatError::timeout(timeout_ms)),
            },
        };
        let (native, attempts) = match established {
            Ok(retried) => (retried.value, retried.attempts),
            Err(error) => {
                scope.release();
                warn!(provider = provider.id(), model = %model, code = ?error.code, "chat request failed before streaming: {}", error.message);
                return Err(error);
            }
        };

        scope.attach(normalize(provider.wire_format(), native));
        let mut assembler = ChunkAssembler::new();
        let expiry = tokio::time::sleep_until(deadline);
        tokio::pin!(expiry);

        loop {
            let step = tokio::select! {
                biased;
                _ = wait_for_abort(abort_signal.as_ref()) => Step::Cancelled,
                _ = &mut expiry => Step::TimedOut,
                item = scope.next_chunk() => Step::Item(item),
            };

            match step {
                Step::Item(Some(Ok(chunk))) => {
                    if let Err(error) = assembler.push(chunk, on_content.as_mut()) {
                        scope.release();
                        warn!(provider = provider.id(), "content callback failed: {}", error.message);
                        return Err(error
                            .with_attempts(attempts)
                            .with_partial(assembler.snapshot()));
                    }
                }
                Step::Item(Some(Err(error))) => {
                    scope.release();
                    let error = interrupted(error, &assembler).with_attempts(attempts);
                    warn!(
                        provider = provider.id(),
                        category = %error.category,
                        delivered = assembler.has_delivered(),
                        "stream failed: {}",
                        error.message
                    );
                    return Err(error);
                }
                Step::Item(None) => break,
                Step::TimedOut => {
                    let discarded = scope.abort_and_drain();
                    warn!(provider = provider.id(), timeout_ms, discarded, "chat request timed out while streaming");
                    return Err(ChatError::timeout(timeout_ms)
                        .with_attempts(attempts)
                        .with_partial(assembler.snapshot()));
                }
                Step::Cancelled => {
                    let discarded = scope.abort_and_drain();
                    debug!(provider = provider.id(), discarded, "chat request cancelled by caller");
                    return Err(ChatError::cancelled()
                        .with_attempts(attempts)
                        .with_partial(assembler.snapshot()));
                }
            }
        }
        scope.release();

        let finish_reason = assembler.finish_reason().map(ToString::to_string);
        let usage = assembler.usage();
        let mut response = assembler.finish();
        let mut metadata = Map::new();
        metadata.insert("provider".to_string(), json!(provider.id()));
        metadata.insert("model".to_string(), json!(model));
        metadata.insert("attempts".to_string(), json!(attempts));
        if let Some(finish_reason) = finish_reason {
            metadata.insert("finishReason".to_string(), Value::String(finish_reason));
        }
        if let Some(usage) = usage {
            metadata.insert(
                "usage".to_string(),
                json!({ "inputTokens": usage.input_tokens, "outputTokens": usage.output_tokens }),
            );
        }
        response.metadata = Some(metadata);

        info!(
            provider = provider.id(),
            model = %model,
            attempts,
            content_len = response.content.len(),
            tool_calls = response.tool_calls.len(),
            "chat request completed"
        );
        Ok(response)
    }
}

async fn wait_for_abort(signal: Option<&AbortSignal>) {
    match signal {
        Some(signal) => signal.cancelled().await,
        None => std::future::pending().await,
    }
}

fn validate_request(
    messages: &[ChatMessage],
    model: &str,
    tools: &[Tool],
    tool_choice: Option<&ToolChoice>,
) -> Result<(), ChatError> {
    if model.trim().is_empty() {
        return Err(ChatError::invalid_request("model must not be empty"));
    }
    if messages.is_empty() {
        return Err(ChatError::invalid_request("messages must not be empty"));
    }
    if let Some(position) = messages
        .iter()
        .position(|message| message.role.trim().is_empty())
    {
        return Err(ChatError::invalid_request(format!(
            "message {position} has an empty role"
        )));
    }
    if let Some(tool) = tools.iter().find(|tool| tool.name.trim().is_empty()) {
        return Err(ChatError::invalid_request(format!(
            "tool with description '{}' has an empty name",
            tool.description
        )));
    }
    if let Some(ToolChoice::Function(name)) = tool_choice {
        if !tools.iter().any(|tool| &tool.name == name) {
            return Err(ChatError::invalid_request(format!(
                "tool_choice names unknown tool '{name}'"
            )));
        }
    }
    Ok(())
}
