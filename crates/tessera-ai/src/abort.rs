use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::{FutureExt, StreamExt};
use tokio::sync::Notify;
use tracing::debug;

use crate::error::ProviderError;
use crate::normalize::ChunkStream;
use crate::types::Chunk;

#[derive(Clone, Debug)]
pub struct AbortSignal {
    inner: Arc<AbortInner>,
}

#[derive(Debug)]
struct AbortInner {
    aborted: AtomicBool,
    notify: Notify,
}

impl AbortSignal {
    pub fn is_aborted(&self) -> bool {
        self.inner.aborted.load(Ordering::SeqCst)
    }

    /// Resolves once the owning controller aborts; immediately if it already has.
    pub async fn cancelled(&self) {
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_aborted() {
            return;
        }
        notified.await;
    }
}

/// Cooperative cancellation handle. Aborting more than once is a no-op.
#[derive(Clone, Debug)]
pub struct AbortController {
    signal: AbortSignal,
}

impl AbortController {
    pub fn new() -> Self {
        Self {
            signal: AbortSignal {
                inner: Arc::new(AbortInner {
                    aborted: AtomicBool::new(false),
                    notify: Notify::new(),
                }),
            },
        }
    }

    pub fn signal(&self) -> AbortSignal {
        self.signal.clone()
    }

    /// Returns `true` only for the call that actually flipped the signal.
    pub fn abort(&self) -> bool {
        let first = !self.signal.inner.aborted.swap(true, Ordering::SeqCst);
        if first {
            self.signal.inner.notify.notify_waiters();
        }
        first
    }

    pub fn is_aborted(&self) -> bool {
        self.signal.is_aborted()
    }
}

impl Default for AbortController {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-call ownership of the abort controller and the live chunk stream.
///
/// Whatever path the call exits through, the stream is dropped and the
/// controller aborted exactly once, either by an explicit [`CallScope::release`]
/// or when the scope itself is dropped.
pub struct CallScope {
    controller: AbortController,
    stream: Option<ChunkStream>,
    released: bool,
}

impl CallScope {
    pub fn new(controller: AbortController) -> Self {
        Self {
            controller,
            stream: None,
            released: false,
        }
    }

    pub fn signal(&self) -> AbortSignal {
        self.controller.signal()
    }

    pub fn attach(&mut self, stream: ChunkStream) {
        self.stream = Some(stream);
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    pub async fn next_chunk(&mut self) -> Option<Result<Chunk, ProviderError>> {
        match self.stream.as_mut() {
            Some(stream) => stream.next().await,
            None => None,
        }
    }

    /// Abort the transport and discard anything it already buffered, without
    /// waiting for more. Returns the number of discarded items.
    pub fn abort_and_drain(&mut self) -> usize {
        self.controller.abort();
        let mut discarded = 0usize;
        if let Some(stream) = self.stream.as_mut() {
            while let Some(Some(_)) = stream.next().now_or_never() {
                discarded += 1;
            }
        }
        self.release();
        discarded
    }

    /// Release the transport handle. Returns `false` if already released.
    pub fn release(&mut self) -> bool {
        if self.released {
            return false;
        }
        self.released = true;
        self.controller.abort();
        let had_stream = self.stream.take().is_some();
        debug!(had_stream, "released call resources");
        true
    }
}

impl Drop for CallScope {
    fn drop(&mut self) {
        self.release();
    }
}
