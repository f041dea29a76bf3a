// ── Per-command notification buffer ──
//
// One accumulator exists per top-level command. Mutations record into it
// in emission order; `complete_and_send` hands the whole batch to the
// dispatcher exactly once. Handles are cheap clones so a dependent
// continuation can keep writing into its parent's batch.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::trace;

use super::{
    LifecycleNotification, LifecycleStatus, Notification, NotificationBatch,
    NotificationDispatcher, ResourceActionNotification, ResourceDataNotification,
    ResourceMetadataNotification,
};
use crate::model::ResourcePath;

/// Buffer of notifications emitted by one command.
#[derive(Clone)]
pub struct NotificationAccumulator {
    inner: Arc<Inner>,
}

struct Inner {
    command_id: u64,
    pending: Mutex<Vec<Notification>>,
    dispatcher: Arc<NotificationDispatcher>,
}

impl NotificationAccumulator {
    pub fn new(dispatcher: Arc<NotificationDispatcher>, command_id: u64) -> Self {
        Self {
            inner: Arc::new(Inner {
                command_id,
                pending: Mutex::new(Vec::new()),
                dispatcher,
            }),
        }
    }

    pub fn command_id(&self) -> u64 {
        self.inner.command_id
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    pub fn add_provider(&self, model: &str, provider: &str) {
        self.lifecycle(LifecycleStatus::ProviderCreated, model, provider, None, None);
    }

    pub fn remove_provider(&self, model: &str, provider: &str) {
        self.lifecycle(LifecycleStatus::ProviderDeleted, model, provider, None, None);
    }

    pub fn add_service(&self, model: &str, provider: &str, service: &str) {
        self.lifecycle(
            LifecycleStatus::ServiceCreated,
            model,
            provider,
            Some(service),
            None,
        );
    }

    pub fn add_resource(&self, path: &ResourcePath) {
        self.lifecycle(
            LifecycleStatus::ResourceCreated,
            &path.model,
            &path.provider,
            Some(&path.service),
            Some(&path.resource),
        );
    }

    // ── Data ─────────────────────────────────────────────────────────

    pub fn resource_value_update(
        &self,
        path: &ResourcePath,
        old_value: Value,
        new_value: Value,
        timestamp: DateTime<Utc>,
    ) {
        self.push(Notification::ResourceData(ResourceDataNotification {
            path: path.clone(),
            old_value,
            new_value,
            timestamp,
        }));
    }

    pub fn metadata_update(
        &self,
        path: &ResourcePath,
        key: &str,
        old_value: Option<Value>,
        new_value: Value,
        timestamp: DateTime<Utc>,
    ) {
        self.push(Notification::ResourceMetadata(ResourceMetadataNotification {
            path: path.clone(),
            key: key.to_owned(),
            old_value,
            new_value,
            timestamp,
        }));
    }

    pub fn resource_action(&self, path: &ResourcePath, timestamp: DateTime<Utc>) {
        self.push(Notification::ResourceAction(ResourceActionNotification {
            path: path.clone(),
            timestamp,
        }));
    }

    // ── Flush ────────────────────────────────────────────────────────

    /// Number of notifications recorded and not yet sent.
    pub fn pending(&self) -> usize {
        self.lock().len()
    }

    /// Dispatch everything recorded so far as one batch.
    ///
    /// Returns the number of notifications sent. Calling it again with
    /// nothing new recorded sends nothing.
    pub fn complete_and_send(&self) -> usize {
        let notifications = std::mem::take(&mut *self.lock());
        let count = notifications.len();
        if count == 0 {
            return 0;
        }
        trace!(command = self.inner.command_id, count, "flushing notifications");
        self.inner.dispatcher.dispatch(NotificationBatch {
            command_id: self.inner.command_id,
            notifications,
        });
        count
    }

    fn lifecycle(
        &self,
        status: LifecycleStatus,
        model: &str,
        provider: &str,
        service: Option<&str>,
        resource: Option<&str>,
    ) {
        self.push(Notification::Lifecycle(LifecycleNotification {
            status,
            model: model.to_owned(),
            provider: provider.to_owned(),
            service: service.map(str::to_owned),
            resource: resource.map(str::to_owned),
        }));
    }

    fn push(&self, notification: Notification) {
        self.lock().push(notification);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Notification>> {
        self.inner
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for NotificationAccumulator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotificationAccumulator")
            .field("command_id", &self.inner.command_id)
            .field("pending", &self.pending())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use pretty_assertions::assert_eq;

    use super::*;

    fn counting_dispatcher() -> (Arc<NotificationDispatcher>, Arc<AtomicUsize>) {
        let dispatcher = Arc::new(NotificationDispatcher::new(16));
        let batches = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&batches);
        dispatcher.add_listener(move |_: &NotificationBatch| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        (dispatcher, batches)
    }

    #[test]
    fn second_flush_without_new_records_sends_nothing() {
        let (dispatcher, batches) = counting_dispatcher();
        let acc = NotificationAccumulator::new(dispatcher, 1);
        acc.add_provider("m", "p");
        acc.add_service("m", "p", "s");

        assert_eq!(acc.complete_and_send(), 2);
        assert_eq!(acc.complete_and_send(), 0);
        assert_eq!(batches.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn empty_accumulator_never_dispatches() {
        let (dispatcher, batches) = counting_dispatcher();
        let acc = NotificationAccumulator::new(dispatcher, 1);
        assert_eq!(acc.complete_and_send(), 0);
        assert_eq!(batches.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn clones_share_one_buffer_in_emission_order() {
        let dispatcher = Arc::new(NotificationDispatcher::new(16));
        let mut rx = dispatcher.subscribe();
        let acc = NotificationAccumulator::new(Arc::clone(&dispatcher), 7);
        let other = acc.clone();

        let path = ResourcePath::new("m", "p", "s", "r");
        acc.add_resource(&path);
        other.resource_value_update(&path, Value::Null, Value::from(1), Utc::now());
        assert_eq!(acc.pending(), 2);
        other.complete_and_send();

        let batch = rx.try_recv().unwrap();
        assert_eq!(batch.command_id, 7);
        let topics: Vec<String> = batch.iter().map(Notification::topic).collect();
        assert_eq!(topics, vec!["LIFECYCLE/p/s/r", "DATA/p/s/r"]);
    }
}
