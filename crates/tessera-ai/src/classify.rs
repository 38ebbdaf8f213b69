use std::sync::OnceLock;

use regex::Regex;

use crate::error::{ChatError, ChatErrorCode, ErrorCategory, ProviderError};

struct Patterns {
    rate_limit: Regex,
    authentication: Regex,
    server: Regex,
    network: Regex,
    client: Regex,
}

fn patterns() -> &'static Patterns {
    static CACHED: OnceLock<Patterns> = OnceLock::new();
    CACHED.get_or_init(|| Patterns {
        rate_limit: compile(
            r"(?i)rate.?limit|too many requests|quota exceeded|HTTP 429|status(?: code)?:? 429",
        ),
        authentication: compile(
            r"(?i)unauthori[sz]ed|forbidden|invalid.?api.?key|incorrect api key|authentication|permission denied|HTTP 40[13]|status(?: code)?:? 40[13]",
        ),
        server: compile(
            r"(?i)internal server error|bad gateway|service.?unavailable|gateway timeout|overloaded|HTTP 5\d\d|status(?: code)?:? 5\d\d",
        ),
        network: compile(
            r"(?i)ECONNRESET|ECONNREFUSED|ECONNABORTED|ETIMEDOUT|ENOTFOUND|EAI_AGAIN|EPIPE|EHOSTUNREACH|socket hang up|connection (?:reset|refused|closed|aborted)|network|dns|timed? ?out",
        ),
        client: compile(
            r"(?i)bad request|invalid request|not found|unprocessable|HTTP 4\d\d|status(?: code)?:? 4\d\d",
        ),
    })
}

/// Patterns are string literals, so a compile failure is a build defect
/// rather than a runtime condition. `pattern_table_compiles` forces them.
fn compile(pattern: &'static str) -> Regex {
    Regex::new(pattern).expect("classification pattern must compile")
}

/// Category for an HTTP status code, if the status alone decides it.
pub fn category_for_status(status: u16) -> Option<ErrorCategory> {
    match status {
        401 | 403 => Some(ErrorCategory::Authentication),
        408 => Some(ErrorCategory::Network),
        429 => Some(ErrorCategory::RateLimit),
        400..=499 => Some(ErrorCategory::Client),
        500..=599 => Some(ErrorCategory::Server),
        _ => None,
    }
}

/// Category inferred from free-form error text.
pub fn category_for_message(message: &str) -> ErrorCategory {
    let patterns = patterns();
    if patterns.rate_limit.is_match(message) {
        ErrorCategory::RateLimit
    } else if patterns.authentication.is_match(message) {
        ErrorCategory::Authentication
    } else if patterns.server.is_match(message) {
        ErrorCategory::Server
    } else if patterns.network.is_match(message) {
        ErrorCategory::Network
    } else if patterns.client.is_match(message) {
        ErrorCategory::Client
    } else {
        ErrorCategory::Unknown
    }
}

fn category_for_remote_kind(kind: &str) -> Option<ErrorCategory> {
    match kind {
        "rate_limit_error" | "rate_limit_exceeded" | "insufficient_quota" => {
            Some(ErrorCategory::RateLimit)
        }
        "authentication_error" | "permission_error" | "invalid_api_key" => {
            Some(ErrorCategory::Authentication)
        }
        "overloaded_error" | "api_error" | "server_error" => Some(ErrorCategory::Server),
        "invalid_request_error" | "not_found_error" | "request_too_large" => {
            Some(ErrorCategory::Client)
        }
        _ => None,
    }
}

/// Classify a transport failure into a caller-facing [`ChatError`].
pub fn classify(error: ProviderError) -> ChatError {
    let (category, code) = match &error {
        ProviderError::Http { status, message } => (
            category_for_status(*status).unwrap_or_else(|| category_for_message(message)),
            ChatErrorCode::ProviderHttp,
        ),
        ProviderError::Transport(message) => {
            let category = match category_for_message(message) {
                ErrorCategory::Unknown => ErrorCategory::Network,
                category => category,
            };
            (category, ChatErrorCode::ProviderTransport)
        }
        ProviderError::Protocol(_) => (ErrorCategory::Server, ChatErrorCode::ProviderProtocol),
        ProviderError::Remote { kind, message } => (
            kind.as_deref()
                .and_then(category_for_remote_kind)
                .unwrap_or_else(|| category_for_message(message)),
            ChatErrorCode::ProviderHttp,
        ),
        ProviderError::AuthMissing(_) => (
            ErrorCategory::Authentication,
            ChatErrorCode::ProviderAuthMissing,
        ),
        ProviderError::Aborted => (ErrorCategory::Client, ChatErrorCode::Cancelled),
    };

    ChatError::new(category, code, error.to_string()).with_cause(error)
}
