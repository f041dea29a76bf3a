// ── Pending results ──
//
// `Pending<T>` is the caller's side of a submitted command: a future
// that resolves once the command (and everything it deferred) finished.
// `CommandSlot<T>` wraps a command that may be submitted at most once.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use super::Command;
use crate::error::CoreError;

/// Eventual result of a submitted command.
///
/// Resolves to [`CoreError::ShuttingDown`] if the gateway stops before
/// the command completes.
#[must_use = "a pending result does nothing unless awaited"]
pub struct Pending<T> {
    state: State<T>,
}

enum State<T> {
    Waiting(oneshot::Receiver<Result<T, CoreError>>),
    Failed(Option<CoreError>),
}

impl<T> Pending<T> {
    pub(crate) fn waiting(rx: oneshot::Receiver<Result<T, CoreError>>) -> Self {
        Self {
            state: State::Waiting(rx),
        }
    }

    /// A result that failed before reaching the queue.
    pub fn failed(error: CoreError) -> Self {
        Self {
            state: State::Failed(Some(error)),
        }
    }
}

impl<T> Future for Pending<T> {
    type Output = Result<T, CoreError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.get_mut().state {
            State::Waiting(rx) => Pin::new(rx)
                .poll(cx)
                .map(|received| received.unwrap_or(Err(CoreError::ShuttingDown))),
            State::Failed(error) => {
                Poll::Ready(Err(error.take().unwrap_or(CoreError::ShuttingDown)))
            }
        }
    }
}

impl<T> fmt::Debug for Pending<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.state {
            State::Waiting(_) => f.write_str("Pending::Waiting"),
            State::Failed(error) => f.debug_tuple("Pending::Failed").field(error).finish(),
        }
    }
}

// ── Submit-once slot ─────────────────────────────────────────────────

/// A command that can be submitted exactly once.
///
/// Clones share the same slot; whichever submission comes first runs the
/// command and every later one fails with [`CoreError::AlreadyExecuted`].
pub struct CommandSlot<T> {
    inner: Arc<Mutex<Option<Command<T>>>>,
}

impl<T> CommandSlot<T> {
    pub fn new(command: Command<T>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Some(command))),
        }
    }

    pub fn is_submitted(&self) -> bool {
        self.lock().is_none()
    }

    pub(crate) fn take(&self) -> Option<Command<T>> {
        self.lock().take()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Command<T>>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T> Clone for CommandSlot<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for CommandSlot<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandSlot")
            .field("submitted", &self.is_submitted())
            .finish()
    }
}
