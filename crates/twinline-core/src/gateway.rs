// ── Gateway ──
//
// Public facade over the twin: owns the store, the action registry and
// the notification dispatcher, and runs the writer task that executes
// commands one at a time.

use std::future::Future;
use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::sync::{Mutex, broadcast, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, WatchStream};
use tokio_stream::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::command::queue::CommandQueue;
use crate::command::{Command, CommandSlot, Pending};
use crate::config::GatewayConfig;
use crate::engine::{self, Engine};
use crate::error::CoreError;
use crate::notification::{NotificationBatch, NotificationDispatcher};
use crate::store::{ProviderFilter, ProviderSnapshot, TwinStore};
use crate::update::DataUpdate;
use crate::value::TimedValue;
use crate::whiteboard::Whiteboard;

/// Entry point for everything that reads or changes the twin.
///
/// Cheaply cloneable via `Arc<GatewayInner>`. Reads go straight to the
/// store; every change is a [`Command`] run on the writer task.
#[derive(Clone)]
pub struct Gateway {
    inner: Arc<GatewayInner>,
}

struct GatewayInner {
    config: GatewayConfig,
    store: Arc<TwinStore>,
    whiteboard: Arc<Whiteboard>,
    dispatcher: Arc<NotificationDispatcher>,
    queue: CommandQueue,
    cancel: CancellationToken,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for GatewayInner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl Gateway {
    /// Build the gateway and spawn its writer task. Must be called from
    /// within a Tokio runtime.
    pub fn start(config: GatewayConfig) -> Self {
        let cancel = CancellationToken::new();
        let (queue, rx) = CommandQueue::new(config.queue_warn_threshold, cancel.clone());
        let store = Arc::new(TwinStore::new(&config));
        let dispatcher = Arc::new(NotificationDispatcher::new(config.notification_capacity));
        let whiteboard = Arc::new(Whiteboard::new(queue.clone(), config.action_timeout));

        let engine = Engine {
            store: Arc::clone(&store),
            whiteboard: Arc::clone(&whiteboard),
            dispatcher: Arc::clone(&dispatcher),
            queue: queue.clone(),
        };
        let writer = tokio::spawn(engine::writer_task(engine, rx, cancel.clone()));
        debug!("gateway started");

        Self {
            inner: Arc::new(GatewayInner {
                config,
                store,
                whiteboard,
                dispatcher,
                queue,
                cancel,
                writer: Mutex::new(Some(writer)),
            }),
        }
    }

    /// Start a gateway, run `f` against it, then shut it down.
    pub async fn oneshot<F, Fut, T>(config: GatewayConfig, f: F) -> Result<T, CoreError>
    where
        F: FnOnce(Gateway) -> Fut,
        Fut: Future<Output = Result<T, CoreError>>,
    {
        let gateway = Self::start(config);
        let result = f(gateway.clone()).await;
        gateway.shutdown().await;
        result
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.inner.config
    }

    // ── Command execution ────────────────────────────────────────────

    /// Queue a command. The returned future resolves after the command
    /// finished and its notifications were dispatched.
    pub fn execute<T: Send + 'static>(&self, command: Command<T>) -> Pending<T> {
        self.inner.queue.submit(command)
    }

    /// Submit the command held by `slot`, unless someone already did.
    pub fn submit<T: Send + 'static>(&self, slot: &CommandSlot<T>) -> Pending<T> {
        match slot.take() {
            Some(command) => self.execute(command),
            None => Pending::failed(CoreError::AlreadyExecuted),
        }
    }

    /// Execute and wait on the calling thread.
    ///
    /// Calling this from inside a command body would wait on the writer
    /// that is running it, so that fails with `EngineMisuse`. Do not call
    /// it from an async context either: use `execute(..).await` there.
    pub fn execute_blocking<T: Send + 'static>(&self, command: Command<T>) -> Result<T, CoreError> {
        if engine::on_gateway() {
            return Err(CoreError::EngineMisuse {
                message: "blocking execution from inside a running command".into(),
            });
        }
        futures::executor::block_on(self.execute(command))
    }

    // ── Ingestion ────────────────────────────────────────────────────

    /// Queue one data update. Malformed updates are rejected before
    /// anything is queued.
    pub fn ingest(&self, update: DataUpdate) -> Result<Pending<bool>, CoreError> {
        update.validate()?;
        Ok(self.execute(Command::twin(move |twin| twin.update(&update))))
    }

    /// Queue several updates as one batch. Resolves to how many were
    /// applied (stale ones are not counted).
    pub fn ingest_all(&self, updates: Vec<DataUpdate>) -> Result<Pending<usize>, CoreError> {
        for update in &updates {
            update.validate()?;
        }
        let members = updates
            .into_iter()
            .map(|update| Command::twin(move |twin| twin.update(&update)))
            .collect();
        Ok(self.execute(
            Command::batch(members).map(|applied| applied.into_iter().filter(|a| *a).count()),
        ))
    }

    /// Invoke an action resource.
    pub fn act(
        &self,
        provider: impl Into<String>,
        service: impl Into<String>,
        resource: impl Into<String>,
        arguments: Map<String, Value>,
    ) -> Pending<Value> {
        let (provider, service, resource) = (provider.into(), service.into(), resource.into());
        self.execute(Command::future(move |twin, _| {
            twin.act(&provider, &service, &resource, arguments)
        }))
    }

    /// Refresh a resource through its get handler.
    pub fn pull_value(
        &self,
        provider: impl Into<String>,
        service: impl Into<String>,
        resource: impl Into<String>,
    ) -> Pending<Option<TimedValue>> {
        let (provider, service, resource) = (provider.into(), service.into(), resource.into());
        self.execute(Command::future(move |twin, _| {
            twin.pull_value(&provider, &service, &resource)
        }))
    }

    /// Write a resource through its set handler.
    pub fn push_value(
        &self,
        provider: impl Into<String>,
        service: impl Into<String>,
        resource: impl Into<String>,
        value: Value,
    ) -> Pending<Option<TimedValue>> {
        let (provider, service, resource) = (provider.into(), service.into(), resource.into());
        self.execute(Command::future(move |twin, _| {
            twin.push_value(&provider, &service, &resource, value)
        }))
    }

    // ── Reads ────────────────────────────────────────────────────────

    pub fn store(&self) -> &Arc<TwinStore> {
        &self.inner.store
    }

    pub fn whiteboard(&self) -> &Arc<Whiteboard> {
        &self.inner.whiteboard
    }

    /// Every provider, sorted by name.
    pub fn snapshot(&self) -> Vec<ProviderSnapshot> {
        self.inner.store.providers()
    }

    pub fn filtered(&self, filter: &ProviderFilter) -> Vec<ProviderSnapshot> {
        self.inner.store.filtered(filter)
    }

    // ── Notifications ────────────────────────────────────────────────

    /// Register listeners here; they run synchronously on every batch.
    pub fn notifications(&self) -> &Arc<NotificationDispatcher> {
        &self.inner.dispatcher
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<NotificationBatch>> {
        self.inner.dispatcher.subscribe()
    }

    /// Counter bumped after every dispatched batch.
    pub fn watch_version(&self) -> watch::Receiver<u64> {
        self.inner.dispatcher.watch_version()
    }

    /// Batches as a stream. Batches missed by a lagging consumer are
    /// skipped with a warning.
    pub fn notification_stream(&self) -> impl Stream<Item = Arc<NotificationBatch>> + use<> {
        BroadcastStream::new(self.subscribe()).filter_map(|received| match received {
            Ok(batch) => Some(batch),
            Err(error) => {
                warn!(%error, "notification stream lagged");
                None
            }
        })
    }

    pub fn version_stream(&self) -> WatchStream<u64> {
        WatchStream::new(self.watch_version())
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    pub fn queue_depth(&self) -> usize {
        self.inner.queue.depth()
    }

    pub fn is_running(&self) -> bool {
        !self.inner.cancel.is_cancelled()
    }

    /// Stop the writer after the command in progress. Queued and later
    /// submissions fail with `ShuttingDown`.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        let Some(writer) = self.inner.writer.lock().await.take() else {
            return;
        };

        match tokio::time::timeout(self.inner.config.shutdown_timeout, writer).await {
            Ok(Ok(())) => info!("gateway stopped"),
            Ok(Err(error)) => warn!(%error, "gateway writer ended abnormally"),
            Err(_) => warn!(
                timeout = ?self.inner.config.shutdown_timeout,
                "gateway writer did not stop in time"
            ),
        }
    }
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("running", &self.is_running())
            .field("providers", &self.inner.store.provider_count())
            .field("queue_depth", &self.queue_depth())
            .finish_non_exhaustive()
    }
}
