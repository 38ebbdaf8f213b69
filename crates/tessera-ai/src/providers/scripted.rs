use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::stream;
use serde_json::Value;

use super::{ChatProvider, ProviderFuture, StreamRequest};
use crate::abort::AbortSignal;
use crate::error::ProviderError;
use crate::normalize::{NativeItem, NativeStream, WireFormat};
use crate::types::Chunk;

/// One step of a scripted stream.
#[derive(Debug, Clone)]
pub enum ScriptStep {
    Chunk(Chunk),
    Json(Value),
    Delay(Duration),
    Fail(ProviderError),
    /// Never yields again; only an abort ends the stream.
    Stall,
}

/// Outcome of one `begin_stream` call.
#[derive(Debug, Clone)]
pub enum ScriptedAttempt {
    Reject(ProviderError),
    Stream(Vec<ScriptStep>),
}

/// In-process provider that replays canned attempts, for offline runs and tests.
///
/// The n-th `begin_stream` call plays the n-th attempt; once the script is
/// exhausted the last attempt repeats.
pub struct ScriptedProvider {
    id: String,
    format: WireFormat,
    attempts: Vec<ScriptedAttempt>,
    establish_delay: Duration,
    calls: AtomicUsize,
    releases: Arc<AtomicUsize>,
    requests: Mutex<Vec<StreamRequest>>,
}

impl ScriptedProvider {
    pub fn new(attempts: Vec<ScriptedAttempt>) -> Self {
        Self {
            id: "scripted".to_string(),
            format: WireFormat::Canonical,
            attempts,
            establish_delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            releases: Arc::new(AtomicUsize::new(0)),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// A single successful attempt streaming `chunks`.
    pub fn from_chunks(chunks: Vec<Chunk>) -> Self {
        Self::new(vec![ScriptedAttempt::Stream(
            chunks.into_iter().map(ScriptStep::Chunk).collect(),
        )])
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Native items are JSON in `format` instead of canonical chunks.
    pub fn with_wire_format(mut self, format: WireFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_establish_delay(mut self, delay: Duration) -> Self {
        self.establish_delay = delay;
        self
    }

    /// Number of `begin_stream` calls so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Number of streams that have been dropped.
    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<StreamRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl ChatProvider for ScriptedProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn wire_format(&self) -> WireFormat {
        self.format
    }

    fn begin_stream(&self, request: StreamRequest, abort: AbortSignal) -> ProviderFuture {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request);
        let attempt = self
            .attempts
            .get(call)
            .or_else(|| self.attempts.last())
            .cloned();
        let establish_delay = self.establish_delay;
        let releases = self.releases.clone();

        Box::pin(async move {
            if !establish_delay.is_zero() {
                tokio::select! {
                    biased;
                    _ = abort.cancelled() => return Err(ProviderError::Aborted),
                    _ = tokio::time::sleep(establish_delay) => {}
                }
            }
            match attempt {
                None => Err(ProviderError::Protocol("script has no attempts".to_string())),
                Some(ScriptedAttempt::Reject(error)) => Err(error),
                Some(ScriptedAttempt::Stream(steps)) => {
                    Ok(scripted_stream(steps, abort, ReleaseCounter(releases)))
                }
            }
        })
    }
}

struct ReleaseCounter(Arc<AtomicUsize>);

impl Drop for ReleaseCounter {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

struct ScriptState {
    steps: std::vec::IntoIter<ScriptStep>,
    abort: AbortSignal,
    _release: ReleaseCounter,
    done: bool,
}

fn scripted_stream(steps: Vec<ScriptStep>, abort: AbortSignal, release: ReleaseCounter) -> NativeStream {
    let state = ScriptState {
        steps: steps.into_iter(),
        abort,
        _release: release,
        done: false,
    };

    Box::pin(stream::unfold(state, |mut state| async move {
        if state.done {
            return None;
        }
        loop {
            if state.abort.is_aborted() {
                state.done = true;
                return Some((Err(ProviderError::Aborted), state));
            }
            match state.steps.next()? {
                ScriptStep::Chunk(chunk) => {
                    return Some((Ok(NativeItem::Canonical(chunk)), state));
                }
                ScriptStep::Json(value) => return Some((Ok(NativeItem::Json(value)), state)),
                ScriptStep::Fail(error) => {
                    state.done = true;
                    return Some((Err(error), state));
                }
                ScriptStep::Delay(delay) => {
                    tokio::select! {
                        biased;
                        _ = state.abort.cancelled() => {}
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                ScriptStep::Stall => state.abort.cancelled().await,
            }
        }
    }))
}
