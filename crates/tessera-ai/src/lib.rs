//! Streaming-response assembly and resilience for provider-agnostic LLM chat.

mod abort;
mod assembler;
mod classify;
mod client;
mod config;
mod error;
mod normalize;
mod providers;
mod retry;
mod sse;
mod types;

pub use abort::{AbortController, AbortSignal, CallScope};
pub use assembler::{assemble, CallbackError, ChunkAssembler, ContentCallback};
pub use classify::{category_for_message, category_for_status, classify};
pub use client::{ChatClient, ChatOptions};
pub use config::{ClientConfig, TimeoutConfig, DEFAULT_TIMEOUT_MS, MAX_TIMEOUT_MS, MIN_TIMEOUT_MS};
pub use error::{ChatError, ChatErrorCode, ErrorCategory, ErrorCause, ProviderError};
pub use normalize::{normalize, normalize_item, ChunkStream, NativeItem, NativeStream, WireFormat};
pub use providers::{
    known_provider_ids, resolve_provider, AnthropicProvider, ChatProvider, ChatProviderRef,
    OpenAiCompatibleProvider, ProviderFuture, ProviderSettings, ScriptStep, ScriptedAttempt,
    ScriptedProvider, StreamRequest,
};
pub use retry::{Retried, RetryExecutor, RetryPolicy};
pub use sse::{SseDecoder, SseFrame};
pub use types::{
    AssembledResponse, ChatMessage, Chunk, Tool, ToolCall, ToolCallFragment, ToolChoice, Usage,
};
