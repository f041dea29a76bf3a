// ── Command queue ──
//
// Sender side of the writer task's channel. The queue is unbounded so
// submitting never blocks; depth is tracked for diagnostics only.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

use super::{Command, Pending};
use crate::engine::Engine;
use crate::error::CoreError;
use crate::notification::NotificationAccumulator;

/// A queued unit of work, type-erased so commands of any result type
/// share one channel.
pub(crate) trait Job: Send {
    fn run(self: Box<Self>, engine: &Engine, id: u64);
}

/// A command envelope sent through the command channel.
pub(crate) struct Envelope {
    pub(crate) id: u64,
    pub(crate) job: Box<dyn Job>,
}

struct Scheduled<T> {
    command: Command<T>,
    reply: oneshot::Sender<Result<T, CoreError>>,
    /// Set for continuations that write into an enclosing command's batch.
    inherited: Option<NotificationAccumulator>,
}

impl<T: Send + 'static> Job for Scheduled<T> {
    fn run(self: Box<Self>, engine: &Engine, id: u64) {
        let Self {
            command,
            reply,
            inherited,
        } = *self;
        engine.execute(id, command, inherited, reply);
    }
}

#[derive(Clone)]
pub(crate) struct CommandQueue {
    tx: mpsc::UnboundedSender<Envelope>,
    cancel: CancellationToken,
    next_id: Arc<AtomicU64>,
    depth: Arc<AtomicUsize>,
    warn_threshold: usize,
}

impl CommandQueue {
    pub(crate) fn new(
        warn_threshold: usize,
        cancel: CancellationToken,
    ) -> (Self, mpsc::UnboundedReceiver<Envelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                cancel,
                next_id: Arc::new(AtomicU64::new(1)),
                depth: Arc::new(AtomicUsize::new(0)),
                warn_threshold,
            },
            rx,
        )
    }

    pub(crate) fn submit<T: Send + 'static>(&self, command: Command<T>) -> Pending<T> {
        self.enqueue(command, None)
    }

    /// Queue a continuation that records into `accumulator` and leaves
    /// flushing to the command that owns it.
    pub(crate) fn submit_inherited<T: Send + 'static>(
        &self,
        command: Command<T>,
        accumulator: NotificationAccumulator,
    ) -> Pending<T> {
        self.enqueue(command, Some(accumulator))
    }

    pub(crate) fn depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    pub(crate) fn dequeued(&self) {
        self.depth.fetch_sub(1, Ordering::Relaxed);
    }

    fn enqueue<T: Send + 'static>(
        &self,
        command: Command<T>,
        inherited: Option<NotificationAccumulator>,
    ) -> Pending<T> {
        if self.cancel.is_cancelled() {
            return Pending::failed(CoreError::ShuttingDown);
        }

        let (reply, rx) = oneshot::channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let envelope = Envelope {
            id,
            job: Box::new(Scheduled {
                command,
                reply,
                inherited,
            }),
        };

        // Count before sending so the writer never decrements below zero.
        let depth = self.depth.fetch_add(1, Ordering::Relaxed) + 1;
        if self.tx.send(envelope).is_err() {
            self.depth.fetch_sub(1, Ordering::Relaxed);
            return Pending::failed(CoreError::ShuttingDown);
        }

        if depth >= self.warn_threshold {
            warn!(depth, "command queue is backing up");
        } else {
            trace!(command = id, depth, "command queued");
        }
        Pending::waiting(rx)
    }
}
