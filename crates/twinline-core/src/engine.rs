// ── Writer task ──
//
// The single consumer of the command queue. Command bodies run here one
// at a time; whatever a body leaves unfinished continues on its own
// task, so a slow action never holds up the next command.

use std::any::Any;
use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use futures::future::FutureExt;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, debug_span, trace};

use crate::command::queue::{CommandQueue, Envelope};
use crate::command::{Command, CommandFuture};
use crate::error::CoreError;
use crate::notification::{NotificationAccumulator, NotificationDispatcher};
use crate::store::TwinStore;
use crate::twin::{DigitalTwin, ModelManager};
use crate::whiteboard::Whiteboard;

thread_local! {
    static ON_GATEWAY: Cell<bool> = const { Cell::new(false) };
}

/// Whether the current thread is running a command body.
pub(crate) fn on_gateway() -> bool {
    ON_GATEWAY.with(Cell::get)
}

/// Marks the current thread as the gateway until dropped.
struct GatewayScope {
    previous: bool,
}

impl GatewayScope {
    fn enter() -> Self {
        Self {
            previous: ON_GATEWAY.with(|flag| flag.replace(true)),
        }
    }
}

impl Drop for GatewayScope {
    fn drop(&mut self) {
        ON_GATEWAY.with(|flag| flag.set(self.previous));
    }
}

enum Step<T> {
    Done(Result<T, CoreError>),
    Waiting(CommandFuture<T>),
}

/// Everything a running command can reach.
pub(crate) struct Engine {
    pub(crate) store: Arc<TwinStore>,
    pub(crate) whiteboard: Arc<Whiteboard>,
    pub(crate) dispatcher: Arc<NotificationDispatcher>,
    pub(crate) queue: CommandQueue,
}

impl Engine {
    pub(crate) fn execute<T: Send + 'static>(
        &self,
        id: u64,
        command: Command<T>,
        inherited: Option<NotificationAccumulator>,
        reply: oneshot::Sender<Result<T, CoreError>>,
    ) {
        let owns_flush = inherited.is_none();
        let accumulator = inherited
            .unwrap_or_else(|| NotificationAccumulator::new(Arc::clone(&self.dispatcher), id));

        let _scope = GatewayScope::enter();
        let step = panic::catch_unwind(AssertUnwindSafe(|| {
            let mut twin = DigitalTwin::new(self, &accumulator);
            let mut models = ModelManager::new(&self.store);
            let mut pending = command.run(&mut twin, &mut models);
            match (&mut pending).now_or_never() {
                Some(result) => Step::Done(result),
                None => Step::Waiting(pending),
            }
        }))
        .unwrap_or_else(|payload| Step::Done(Err(panicked(payload.as_ref()))));

        match step {
            Step::Done(result) => finish(result, reply, &accumulator, owns_flush),
            Step::Waiting(pending) => {
                trace!("command continues asynchronously");
                tokio::spawn(
                    async move {
                        let result = AssertUnwindSafe(pending)
                            .catch_unwind()
                            .await
                            .unwrap_or_else(|payload| Err(panicked(payload.as_ref())));
                        finish(result, reply, &accumulator, owns_flush);
                    }
                    .instrument(Span::current()),
                );
            }
        }
    }
}

/// Flush (if this command owns its batch) and reply. Notifications are
/// out before the caller observes the result.
fn finish<T>(
    result: Result<T, CoreError>,
    reply: oneshot::Sender<Result<T, CoreError>>,
    accumulator: &NotificationAccumulator,
    owns_flush: bool,
) {
    if let Err(error) = &result {
        debug!(%error, "command failed");
    }
    if owns_flush {
        accumulator.complete_and_send();
    }
    if reply.send(result).is_err() {
        trace!("command result dropped by caller");
    }
}

fn panicked(payload: &(dyn Any + Send)) -> CoreError {
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_owned())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".into());
    CoreError::CommandPanicked { message }
}

// ── Writer loop ──────────────────────────────────────────────────────

pub(crate) async fn writer_task(
    engine: Engine,
    mut rx: mpsc::UnboundedReceiver<Envelope>,
    cancel: CancellationToken,
) {
    debug!("gateway writer started");

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            envelope = rx.recv() => {
                let Some(envelope) = envelope else { break };
                engine.queue.dequeued();
                let Envelope { id, job } = envelope;
                debug_span!("command", id).in_scope(|| job.run(&engine, id));
            }
        }
    }

    // Anything still queued fails with `ShuttingDown` when dropped.
    rx.close();
    let mut abandoned = 0usize;
    while rx.try_recv().is_ok() {
        engine.queue.dequeued();
        abandoned += 1;
    }
    debug!(abandoned, "gateway writer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_restores_previous_flag() {
        assert!(!on_gateway());
        {
            let _outer = GatewayScope::enter();
            assert!(on_gateway());
            {
                let _inner = GatewayScope::enter();
                assert!(on_gateway());
            }
            assert!(on_gateway());
        }
        assert!(!on_gateway());
    }

    #[test]
    fn panic_payloads_become_messages() {
        let err = panicked(&"boom");
        assert_eq!(
            err,
            CoreError::CommandPanicked {
                message: "boom".into()
            }
        );
        let err = panicked(&String::from("owned"));
        assert!(matches!(err, CoreError::CommandPanicked { message } if message == "owned"));
    }
}
