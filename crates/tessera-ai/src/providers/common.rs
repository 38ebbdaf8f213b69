use std::collections::VecDeque;
use std::fmt::Display;
use std::sync::OnceLock;

use futures_util::stream::{self, BoxStream};
use futures_util::{Stream, StreamExt};
use reqwest::{Client, RequestBuilder, Response};
use serde_json::Value;
use tracing::debug;

use crate::abort::AbortSignal;
use crate::error::ProviderError;
use crate::normalize::{NativeItem, NativeStream};
use crate::sse::{SseDecoder, SseFrame};

const ERROR_BODY_LIMIT: usize = 500;

pub(super) fn join_url(base_url: &str, path: &str) -> String {
    if base_url.ends_with('/') {
        format!("{base_url}{path}")
    } else {
        format!("{base_url}/{path}")
    }
}

pub(super) fn shared_http_client(base_url: &str) -> &'static Client {
    static DEFAULT_CLIENT: OnceLock<Client> = OnceLock::new();
    static LOOPBACK_CLIENT: OnceLock<Client> = OnceLock::new();

    if is_loopback_base_url(base_url) {
        LOOPBACK_CLIENT.get_or_init(|| {
            Client::builder()
                .no_proxy()
                .build()
                .unwrap_or_else(|_| Client::new())
        })
    } else {
        DEFAULT_CLIENT.get_or_init(Client::new)
    }
}

pub(super) fn is_loopback_base_url(base_url: &str) -> bool {
    let Ok(url) = reqwest::Url::parse(base_url) else {
        return false;
    };
    let Some(host) = url.host_str() else {
        return false;
    };
    host.eq_ignore_ascii_case("localhost") || host == "127.0.0.1" || host == "::1" || host == "[::1]"
}

/// Send `request` and wait for response headers, giving up if `abort` fires.
/// Non-2xx responses are read to completion and returned as HTTP errors.
pub(super) async fn open_event_stream(
    request: RequestBuilder,
    abort: &AbortSignal,
) -> Result<Response, ProviderError> {
    let response = tokio::select! {
        biased;
        _ = abort.cancelled() => return Err(ProviderError::Aborted),
        response = request.send() => response.map_err(|error| transport_error(&error))?,
    };

    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = tokio::select! {
        biased;
        _ = abort.cancelled() => return Err(ProviderError::Aborted),
        body = response.text() => body.unwrap_or_else(|_| "unable to read error body".to_string()),
    };
    Err(ProviderError::Http {
        status: status.as_u16(),
        message: error_message_from_body(&body),
    })
}

fn transport_error(error: &reqwest::Error) -> ProviderError {
    let mut message = error.to_string();
    let mut source = std::error::Error::source(error);
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    if error.is_timeout() && !message.contains("timed out") {
        message.push_str(" (timed out)");
    }
    ProviderError::Transport(message)
}

/// Pull `error.message` out of a JSON error body, else the truncated body text.
pub(super) fn error_message_from_body(body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<Value>(body) {
        let error = value.get("error").unwrap_or(&value);
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .or_else(|| error.as_str());
        if let Some(message) = message {
            return match error.get("type").and_then(Value::as_str) {
                Some(kind) => format!("{kind}: {message}"),
                None => message.to_string(),
            };
        }
    }
    truncate(body.trim(), ERROR_BODY_LIMIT)
}

fn truncate(text: &str, limit: usize) -> String {
    if text.len() <= limit {
        return text.to_string();
    }
    let mut cut = limit;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}...", &text[..cut])
}

struct SseState<T, E> {
    body: BoxStream<'static, Result<T, E>>,
    decoder: SseDecoder,
    ready: VecDeque<Result<NativeItem, ProviderError>>,
    abort: AbortSignal,
    exhausted: bool,
}

impl<T, E> SseState<T, E> {
    fn enqueue(&mut self, frames: impl IntoIterator<Item = SseFrame>) {
        for frame in frames {
            match frame {
                SseFrame::Data(data) => {
                    let item = serde_json::from_str::<Value>(&data)
                        .map(NativeItem::Json)
                        .map_err(|error| {
                            ProviderError::Protocol(format!(
                                "invalid JSON event payload ({error}): {}",
                                truncate(&data, 200)
                            ))
                        });
                    self.ready.push_back(item);
                }
                SseFrame::Done => {
                    self.exhausted = true;
                }
            }
        }
    }
}

/// Adapt a response body into native JSON items, decoded as bytes arrive.
/// The stream ends on `[DONE]`, on end of body, or with `Aborted` once `abort` fires.
pub(super) fn sse_json_stream<B, T, E>(body: B, abort: AbortSignal) -> NativeStream
where
    B: Stream<Item = Result<T, E>> + Send + 'static,
    T: AsRef<[u8]> + Send + 'static,
    E: Display + Send + 'static,
{
    let state = SseState {
        body: body.boxed(),
        decoder: SseDecoder::new(),
        ready: VecDeque::new(),
        abort,
        exhausted: false,
    };

    Box::pin(stream::unfold(state, |mut state| async move {
        loop {
            if let Some(item) = state.ready.pop_front() {
                return Some((item, state));
            }
            if state.exhausted {
                return None;
            }

            let next = tokio::select! {
                biased;
                _ = state.abort.cancelled() => None,
                next = state.body.next() => Some(next),
            };
            let Some(next) = next else {
                debug!("event stream aborted");
                state.exhausted = true;
                return Some((Err(ProviderError::Aborted), state));
            };

            match next {
                Some(Ok(bytes)) => {
                    let frames = state.decoder.feed(bytes.as_ref());
                    state.enqueue(frames);
                }
                Some(Err(error)) => {
                    state.exhausted = true;
                    state.ready.push_back(Err(ProviderError::Transport(format!(
                        "stream read failed: {error}"
                    ))));
                }
                None => {
                    let tail = state.decoder.finish();
                    state.enqueue(tail);
                    state.exhausted = true;
                }
            }
        }
    }))
}
