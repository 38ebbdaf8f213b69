use std::fmt::{Display, Formatter};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::AssembledResponse;

/// Retry-relevant failure category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCategory {
    Network,
    RateLimit,
    Authentication,
    Server,
    Client,
    Unknown,
}

impl ErrorCategory {
    pub fn is_retryable(self) -> bool {
        match self {
            ErrorCategory::Network
            | ErrorCategory::RateLimit
            | ErrorCategory::Server
            | ErrorCategory::Unknown => true,
            ErrorCategory::Authentication | ErrorCategory::Client => false,
        }
    }
}

impl Display for ErrorCategory {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ErrorCategory::Network => "NETWORK",
            ErrorCategory::RateLimit => "RATE_LIMIT",
            ErrorCategory::Authentication => "AUTHENTICATION",
            ErrorCategory::Server => "SERVER",
            ErrorCategory::Client => "CLIENT",
            ErrorCategory::Unknown => "UNKNOWN",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatErrorCode {
    InvalidRequest,
    ProviderNotFound,
    ProviderAuthMissing,
    ProviderHttp,
    ProviderTransport,
    ProviderProtocol,
    StreamInterrupted,
    Timeout,
    Cancelled,
    CallbackFailed,
}

/// Failure raised by a provider transport, before classification.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },
    #[error("transport failed: {0}")]
    Transport(String),
    #[error("malformed stream item: {0}")]
    Protocol(String),
    #[error("{}", remote_display(.kind, .message))]
    Remote {
        kind: Option<String>,
        message: String,
    },
    #[error("missing credential: {0}")]
    AuthMissing(String),
    #[error("request aborted")]
    Aborted,
}

fn remote_display(kind: &Option<String>, message: &str) -> String {
    match kind {
        Some(kind) => format!("provider error ({kind}): {message}"),
        None => format!("provider error: {message}"),
    }
}

pub type ErrorCause = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// Error surfaced to callers of [`crate::ChatClient::send_chat`].
#[derive(Debug, Clone, thiserror::Error)]
#[error("{category} ({code:?}): {message}")]
pub struct ChatError {
    pub category: ErrorCategory,
    pub code: ChatErrorCode,
    pub retryable: bool,
    pub message: String,
    pub attempts: Option<u32>,
    pub partial: Option<AssembledResponse>,
    pub details: Option<Value>,
    #[source]
    pub cause: Option<ErrorCause>,
}

impl ChatError {
    pub fn new(category: ErrorCategory, code: ChatErrorCode, message: impl Into<String>) -> Self {
        Self {
            category,
            code,
            retryable: category.is_retryable(),
            message: message.into(),
            attempts: None,
            partial: None,
            details: None,
            cause: None,
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Client, ChatErrorCode::InvalidRequest, message)
    }

    pub fn timeout(timeout_ms: u64) -> Self {
        Self::new(
            ErrorCategory::Network,
            ChatErrorCode::Timeout,
            format!("request timed out after {timeout_ms}ms"),
        )
    }

    pub fn cancelled() -> Self {
        Self::new(
            ErrorCategory::Client,
            ChatErrorCode::Cancelled,
            "request cancelled by caller",
        )
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts);
        self
    }

    pub fn with_partial(mut self, partial: AssembledResponse) -> Self {
        self.partial = Some(partial);
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn with_cause<E>(mut self, cause: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.cause = Some(Arc::new(cause));
        self
    }

    pub fn is_timeout(&self) -> bool {
        self.code == ChatErrorCode::Timeout
    }

    pub fn is_cancelled(&self) -> bool {
        self.code == ChatErrorCode::Cancelled
    }
}
