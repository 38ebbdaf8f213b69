use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::abort::AbortSignal;
use crate::error::{ChatError, ChatErrorCode, ErrorCategory, ProviderError};
use crate::normalize::{NativeStream, WireFormat};
use crate::types::{ChatMessage, Tool, ToolChoice};

mod anthropic;
mod common;
mod openai_compat;
mod scripted;

pub use anthropic::AnthropicProvider;
pub use openai_compat::OpenAiCompatibleProvider;
pub use scripted::{ScriptStep, ScriptedAttempt, ScriptedProvider};

pub type ProviderFuture = Pin<Box<dyn Future<Output = Result<NativeStream, ProviderError>> + Send>>;

/// A backend capable of opening one streamed completion.
///
/// Implementations must return a lazy stream and must not retry or enforce
/// deadlines themselves; the caller owns both. The abort signal fires when the
/// caller gives up on the call, after which the stream is dropped.
pub trait ChatProvider: Send + Sync {
    fn id(&self) -> &str;
    fn wire_format(&self) -> WireFormat;
    fn begin_stream(&self, request: StreamRequest, abort: AbortSignal) -> ProviderFuture;
}

pub type ChatProviderRef = Arc<dyn ChatProvider>;

#[derive(Debug, Clone, PartialEq)]
pub struct StreamRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<Tool>,
    pub tool_choice: Option<ToolChoice>,
}

/// Opaque connection settings handed in by the host.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderSettings {
    pub provider: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl ProviderSettings {
    pub fn new(provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            ..Self::default()
        }
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

impl fmt::Debug for ProviderSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderSettings")
            .field("provider", &self.provider)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("base_url", &self.base_url)
            .field("headers", &self.headers.keys().collect::<Vec<_>>())
            .finish()
    }
}

struct KnownBackend {
    id: &'static str,
    base_url: Option<&'static str>,
    requires_key: bool,
}

const OPENAI_COMPATIBLE_BACKENDS: &[KnownBackend] = &[
    KnownBackend {
        id: "openai",
        base_url: Some("https://api.openai.com/v1"),
        requires_key: true,
    },
    KnownBackend {
        id: "deepseek",
        base_url: Some("https://api.deepseek.com/v1"),
        requires_key: true,
    },
    KnownBackend {
        id: "groq",
        base_url: Some("https://api.groq.com/openai/v1"),
        requires_key: true,
    },
    KnownBackend {
        id: "openrouter",
        base_url: Some("https://openrouter.ai/api/v1"),
        requires_key: true,
    },
    KnownBackend {
        id: "mistral",
        base_url: Some("https://api.mistral.ai/v1"),
        requires_key: true,
    },
    KnownBackend {
        id: "xai",
        base_url: Some("https://api.x.ai/v1"),
        requires_key: true,
    },
    KnownBackend {
        id: "together",
        base_url: Some("https://api.together.xyz/v1"),
        requires_key: true,
    },
    KnownBackend {
        id: "ollama",
        base_url: Some("http://localhost:11434/v1"),
        requires_key: false,
    },
    KnownBackend {
        id: "lmstudio",
        base_url: Some("http://localhost:1234/v1"),
        requires_key: false,
    },
    KnownBackend {
        id: "openai-compatible",
        base_url: None,
        requires_key: false,
    },
];

const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com/v1";

/// Identifiers accepted by [`resolve_provider`].
pub fn known_provider_ids() -> Vec<&'static str> {
    OPENAI_COMPATIBLE_BACKENDS
        .iter()
        .map(|backend| backend.id)
        .chain(std::iter::once("anthropic"))
        .collect()
}

/// Resolve a provider identifier into its variant.
pub fn resolve_provider(settings: &ProviderSettings) -> Result<ChatProviderRef, ChatError> {
    let id = settings.provider.trim().to_ascii_lowercase();
    if id == "anthropic" {
        let base_url = settings
            .base_url
            .clone()
            .unwrap_or_else(|| ANTHROPIC_BASE_URL.to_string());
        return Ok(Arc::new(AnthropicProvider::new(
            base_url,
            settings.api_key.clone(),
            settings.headers.clone(),
        )));
    }

    let Some(backend) = OPENAI_COMPATIBLE_BACKENDS
        .iter()
        .find(|backend| backend.id == id)
    else {
        return Err(ChatError::new(
            ErrorCategory::Client,
            ChatErrorCode::ProviderNotFound,
            format!(
                "unknown provider '{}'; expected one of: {}",
                settings.provider,
                known_provider_ids().join(", ")
            ),
        ));
    };

    let base_url = match (&settings.base_url, backend.base_url) {
        (Some(base_url), _) => base_url.clone(),
        (None, Some(default)) => default.to_string(),
        (None, None) => {
            return Err(ChatError::invalid_request(format!(
                "provider '{}' requires a base_url",
                backend.id
            )));
        }
    };

    Ok(Arc::new(OpenAiCompatibleProvider::new(
        backend.id,
        base_url,
        settings.api_key.clone(),
        settings.headers.clone(),
        backend.requires_key,
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_openai_compatible_backends_with_default_base_urls() {
        for id in ["openai", "deepseek", "groq", "ollama", "lmstudio"] {
            let provider = resolve_provider(&ProviderSettings::new(id)).expect("known backend");
            assert_eq!(provider.id(), id);
            assert_eq!(provider.wire_format(), WireFormat::OpenAiChat);
        }
    }

    #[test]
    fn resolves_anthropic_variant() {
        let provider = resolve_provider(&ProviderSettings::new("Anthropic")).expect("anthropic");
        assert_eq!(provider.id(), "anthropic");
        assert_eq!(provider.wire_format(), WireFormat::AnthropicMessages);
    }

    #[test]
    fn unknown_identifier_is_provider_not_found() {
        let error = resolve_provider(&ProviderSettings::new("carrier-pigeon"))
            .err()
            .expect("unknown provider");
        assert_eq!(error.code, ChatErrorCode::ProviderNotFound);
        assert!(!error.retryable);
        assert!(error.message.contains("carrier-pigeon"));
    }

    #[test]
    fn generic_openai_compatible_requires_base_url() {
        let missing = resolve_provider(&ProviderSettings::new("openai-compatible"))
            .err()
            .expect("base url required");
        assert_eq!(missing.code, ChatErrorCode::InvalidRequest);

        let provider = resolve_provider(
            &ProviderSettings::new("openai-compatible").with_base_url("http://127.0.0.1:9/v1"),
        )
        .expect("explicit base url");
        assert_eq!(provider.id(), "openai-compatible");
    }

    #[test]
    fn debug_output_redacts_api_key() {
        let settings = ProviderSettings::new("openai").with_api_key("sk-secret");
        let rendered = format!("{settings:?}");
        assert!(!rendered.contains("sk-secret"));
        assert!(rendered.contains("<redacted>"));
    }
}
