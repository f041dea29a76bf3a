// ── Notification fan-out ──
//
// Batches reach consumers two ways: synchronous listeners called in
// registration order, and a `broadcast` channel for async subscribers.
// A listener that panics is logged and skipped; it never affects the
// command that produced the batch or the other listeners.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::sync::{broadcast, watch};
use tracing::{debug, warn};

use super::NotificationBatch;

/// Synchronous batch consumer.
pub trait NotificationListener: Send + Sync {
    fn notify(&self, batch: &NotificationBatch);
}

impl<F> NotificationListener for F
where
    F: Fn(&NotificationBatch) + Send + Sync,
{
    fn notify(&self, batch: &NotificationBatch) {
        self(batch);
    }
}

/// Handle returned by [`NotificationDispatcher::add_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

/// Delivers completed batches to listeners and subscribers.
pub struct NotificationDispatcher {
    listeners: DashMap<ListenerId, Arc<dyn NotificationListener>>,
    next_listener: AtomicU64,
    batches: broadcast::Sender<Arc<NotificationBatch>>,
    /// Bumped once per dispatched batch.
    version: watch::Sender<u64>,
}

impl NotificationDispatcher {
    pub fn new(capacity: usize) -> Self {
        let (batches, _) = broadcast::channel(capacity.max(1));
        let (version, _) = watch::channel(0u64);
        Self {
            listeners: DashMap::new(),
            next_listener: AtomicU64::new(0),
            batches,
            version,
        }
    }

    pub fn add_listener(&self, listener: impl NotificationListener + 'static) -> ListenerId {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed));
        self.listeners.insert(id, Arc::new(listener));
        id
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(&id).is_some()
    }

    /// Async subscription to every future batch.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<NotificationBatch>> {
        self.batches.subscribe()
    }

    /// Twin version: increments once per dispatched batch.
    pub fn watch_version(&self) -> watch::Receiver<u64> {
        self.version.subscribe()
    }

    pub fn version(&self) -> u64 {
        *self.version.borrow()
    }

    pub(crate) fn dispatch(&self, batch: NotificationBatch) {
        let batch = Arc::new(batch);

        // Snapshot the listener set so no map shard stays locked while
        // user code runs.
        let mut listeners: Vec<(ListenerId, Arc<dyn NotificationListener>)> = self
            .listeners
            .iter()
            .map(|entry| (*entry.key(), Arc::clone(entry.value())))
            .collect();
        listeners.sort_by_key(|(id, _)| *id);

        for (id, listener) in listeners {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| listener.notify(&batch)));
            if outcome.is_err() {
                warn!(
                    listener = id.0,
                    command = batch.command_id,
                    "notification listener panicked"
                );
            }
        }

        // No subscribers is fine.
        if self.batches.send(Arc::clone(&batch)).is_err() {
            debug!(command = batch.command_id, "no notification subscribers");
        }
        self.version.send_modify(|v| *v += 1);
    }
}

impl std::fmt::Debug for NotificationDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationDispatcher")
            .field("listeners", &self.listeners.len())
            .field("subscribers", &self.batches.receiver_count())
            .field("version", &self.version())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;

    use super::*;

    struct Faulty;

    impl NotificationListener for Faulty {
        fn notify(&self, _batch: &NotificationBatch) {
            panic!("listener bug");
        }
    }

    fn batch(id: u64) -> NotificationBatch {
        NotificationBatch {
            command_id: id,
            notifications: Vec::new(),
        }
    }

    #[test]
    fn panicking_listener_does_not_starve_the_rest() {
        let dispatcher = NotificationDispatcher::new(4);
        let delivered = Arc::new(AtomicUsize::new(0));

        dispatcher.add_listener(Faulty);
        let seen = Arc::clone(&delivered);
        dispatcher.add_listener(move |_: &NotificationBatch| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        dispatcher.dispatch(batch(1));
        dispatcher.dispatch(batch(2));
        assert_eq!(delivered.load(Ordering::SeqCst), 2);
        assert_eq!(dispatcher.version(), 2);
    }

    #[test]
    fn listeners_run_in_registration_order() {
        let dispatcher = NotificationDispatcher::new(4);
        let order = Arc::new(Mutex::new(Vec::new()));
        for tag in ["first", "second", "third"] {
            let order = Arc::clone(&order);
            dispatcher.add_listener(move |_: &NotificationBatch| {
                order.lock().unwrap().push(tag);
            });
        }
        dispatcher.dispatch(batch(1));
        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[test]
    fn removed_listener_is_not_called() {
        let dispatcher = NotificationDispatcher::new(4);
        let delivered = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&delivered);
        let id = dispatcher.add_listener(move |_: &NotificationBatch| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        assert!(dispatcher.remove_listener(id));
        dispatcher.dispatch(batch(1));
        assert_eq!(delivered.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn subscribers_receive_batches() {
        let dispatcher = NotificationDispatcher::new(4);
        let mut rx = dispatcher.subscribe();
        let mut version = dispatcher.watch_version();
        dispatcher.dispatch(batch(9));
        assert_eq!(rx.recv().await.unwrap().command_id, 9);
        version.changed().await.unwrap();
        assert_eq!(*version.borrow(), 1);
    }
}
