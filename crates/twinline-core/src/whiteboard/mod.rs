// ── Whiteboard ──
//
// Handlers contributed by external services, keyed by the resource they
// implement. Actions, value getters and value setters each have their
// own table; all three share the same ordering, conflict and removal
// rules.

mod handler;
mod table;

use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::future::{FutureExt, Shared};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, error, trace, warn};

use crate::command::queue::CommandQueue;
use crate::command::{Command, Pending};
use crate::error::CoreError;
use crate::model::{ResourcePath, ResourceSpec, ResourceType, ValueType};
use crate::value::{TimedValue, ValueKind};

pub use handler::{
    ActionCall, ActionFuture, ActionHandler, ActionOutput, ActionSignature, FnAction, GetHandler,
    ParameterSource, SetHandler, ValueFuture,
};

use handler::ParameterBinding;
use table::HandlerTable;

/// The resource a handler implements.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RegistryKey {
    pub model: String,
    pub service: String,
    pub resource: String,
}

impl RegistryKey {
    pub fn new(
        model: impl Into<String>,
        service: impl Into<String>,
        resource: impl Into<String>,
    ) -> Self {
        Self {
            model: model.into(),
            service: service.into(),
            resource: resource.into(),
        }
    }
}

impl fmt::Display for RegistryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.model, self.service, self.resource)
    }
}

impl From<&ResourcePath> for RegistryKey {
    fn from(path: &ResourcePath) -> Self {
        Self::new(&path.model, &path.service, &path.resource)
    }
}

/// Identity of a contributing service. Deregistering it removes every
/// handler it registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceId(pub u64);

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "service#{}", self.0)
    }
}

#[derive(Clone)]
struct ActionEntry {
    handler: Arc<dyn ActionHandler>,
    binding: Arc<ParameterBinding>,
    returns: ValueKind,
}

/// A registration that coexists with an earlier one for the same key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationConflict {
    DuplicateCatchAll {
        existing: ServiceId,
    },
    OverlappingProviders {
        existing: ServiceId,
        providers: BTreeSet<String>,
    },
}

/// Outcome of a whiteboard registration.
#[derive(Debug)]
pub struct Registration {
    pub key: RegistryKey,
    pub conflict: Option<RegistrationConflict>,
    /// Resolves once the resource exists in the model, or fails with
    /// `ModelConflict` if the key names a resource of the wrong type.
    pub model: Pending<()>,
}

pub struct Whiteboard {
    actions: HandlerTable<ActionEntry>,
    getters: HandlerTable<Arc<dyn GetHandler>>,
    setters: HandlerTable<Arc<dyn SetHandler>>,
    /// Pulls in flight, joined by concurrent callers for the same resource.
    pulls: Arc<DashMap<ResourcePath, Shared<ValueFuture>>>,
    queue: CommandQueue,
    action_timeout: Option<Duration>,
    next_service: AtomicU64,
}

impl Whiteboard {
    pub(crate) fn new(queue: CommandQueue, action_timeout: Option<Duration>) -> Self {
        Self {
            actions: HandlerTable::new(),
            getters: HandlerTable::new(),
            setters: HandlerTable::new(),
            pulls: Arc::new(DashMap::new()),
            queue,
            action_timeout,
            next_service: AtomicU64::new(1),
        }
    }

    /// A fresh id for a service about to register handlers.
    pub fn allocate_service_id(&self) -> ServiceId {
        ServiceId(self.next_service.fetch_add(1, Ordering::Relaxed))
    }

    // ── Registration ─────────────────────────────────────────────────

    /// Register an action `handler` for `key`, scoped to `providers`
    /// (empty for every provider). Conflicting registrations are kept
    /// and reported.
    pub fn register<I, S>(
        &self,
        service: ServiceId,
        key: RegistryKey,
        providers: I,
        handler: Arc<dyn ActionHandler>,
    ) -> Registration
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let signature = handler.signature();
        let entry = ActionEntry {
            binding: Arc::new(ParameterBinding::new(&signature)),
            returns: signature.returns,
            handler,
        };
        let conflict = self.actions.insert(service, &key, scope(providers), entry);
        announce("action", &key, service, conflict.as_ref());

        let spec = ResourceSpec::action(&key.resource, signature.returns, signature.declared());
        let model = self.declare(&key, spec);
        Registration {
            key,
            conflict,
            model,
        }
    }

    /// Register a handler that fetches the value of `key` on demand.
    pub fn register_get<I, S>(
        &self,
        service: ServiceId,
        key: RegistryKey,
        providers: I,
        kind: ValueKind,
        handler: Arc<dyn GetHandler>,
    ) -> Registration
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let conflict = self.getters.insert(service, &key, scope(providers), handler);
        announce("get", &key, service, conflict.as_ref());
        let model = self.declare(&key, value_spec(&key, kind));
        Registration {
            key,
            conflict,
            model,
        }
    }

    /// Register a handler that writes values of `key` through to the device.
    pub fn register_set<I, S>(
        &self,
        service: ServiceId,
        key: RegistryKey,
        providers: I,
        kind: ValueKind,
        handler: Arc<dyn SetHandler>,
    ) -> Registration
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let conflict = self.setters.insert(service, &key, scope(providers), handler);
        announce("set", &key, service, conflict.as_ref());
        let model = self.declare(&key, value_spec(&key, kind));
        Registration {
            key,
            conflict,
            model,
        }
    }

    /// Remove every handler `service` registered, whatever its role.
    /// Returns how many.
    pub fn deregister(&self, service: ServiceId) -> usize {
        let removed = self.actions.remove_service(service)
            + self.getters.remove_service(service)
            + self.setters.remove_service(service);
        debug!(%service, removed, "whiteboard handlers deregistered");
        removed
    }

    /// Services handling action `key`, in the order invocation tries them.
    pub fn handlers(&self, key: &RegistryKey) -> Vec<ServiceId> {
        self.actions.services(key)
    }

    pub fn getters(&self, key: &RegistryKey) -> Vec<ServiceId> {
        self.getters.services(key)
    }

    pub fn setters(&self, key: &RegistryKey) -> Vec<ServiceId> {
        self.setters.services(key)
    }

    /// Every key with at least one handler, of any role.
    pub fn keys(&self) -> Vec<RegistryKey> {
        let mut keys = self.actions.keys();
        keys.extend(self.getters.keys());
        keys.extend(self.setters.keys());
        keys.sort();
        keys.dedup();
        keys
    }

    /// Queue a model command creating the resource for `key`. An existing
    /// resource must agree on whether it is an action.
    fn declare(&self, key: &RegistryKey, spec: ResourceSpec) -> Pending<()> {
        let key = key.clone();
        let wants_action = spec.resource_type == ResourceType::Action;
        self.queue.submit(Command::models(move |models| {
            let ensured = models.ensure_resource(&key.model, &key.service, &spec)?;
            if ensured.created || ensured.descriptor.is_action() == wants_action {
                return Ok(());
            }
            let found = ensured.descriptor.resource_type;
            error!(%key, %found, "handler registered over an incompatible resource");
            Err(CoreError::conflict(
                key.to_string(),
                format!("updating resource of type {found} is not allowed"),
            ))
        }))
    }

    // ── Invocation ───────────────────────────────────────────────────

    /// Run the action handler selected for `path`. The handler itself
    /// runs on a blocking thread.
    pub(crate) fn invoke(&self, path: &ResourcePath, arguments: Map<String, Value>) -> ActionFuture {
        let selected = self.actions.select(&RegistryKey::from(path), &path.provider);
        let timeout = self.action_timeout;
        let path = path.clone();

        async move {
            let ActionEntry {
                handler,
                binding,
                returns,
            } = selected.ok_or_else(|| no_handler(&path))?;
            let call = ActionCall {
                arguments: binding.bind(&path, &arguments)?,
                path: path.clone(),
            };
            let target = path.to_string();
            let run = run_handler(handler, call, target.clone());
            let value = bounded(timeout, &target, run).await?;
            returns.coerce(value)
        }
        .boxed()
    }

    /// Fetch a fresh value for `path`. Concurrent pulls of the same
    /// resource share one handler call.
    pub(crate) fn pull(&self, path: &ResourcePath, cached: Option<TimedValue>) -> ValueFuture {
        let Some(handler) = self.getters.select(&RegistryKey::from(path), &path.provider) else {
            let error = no_handler(path);
            return async move { Err(error) }.boxed();
        };

        match self.pulls.entry(path.clone()) {
            Entry::Occupied(running) => {
                trace!(resource = %path, "joining pull in flight");
                running.get().clone().boxed()
            }
            Entry::Vacant(slot) => {
                let pulls = Arc::clone(&self.pulls);
                let timeout = self.action_timeout;
                let path = path.clone();
                let shared = async move {
                    let target = path.to_string();
                    let key = path.clone();
                    let call = move || handler.pull(&key, cached);
                    let result = bounded(timeout, &target, run_value(call, target.clone())).await;
                    pulls.remove(&path);
                    result
                }
                .boxed()
                .shared();
                slot.insert(shared.clone());
                shared.boxed()
            }
        }
    }

    /// Hand `value` to the set handler for `path`.
    pub(crate) fn push(
        &self,
        path: &ResourcePath,
        cached: Option<TimedValue>,
        value: TimedValue,
    ) -> ValueFuture {
        let selected = self.setters.select(&RegistryKey::from(path), &path.provider);
        let timeout = self.action_timeout;
        let path = path.clone();

        async move {
            let handler = selected.ok_or_else(|| no_handler(&path))?;
            let target = path.to_string();
            let call = move || handler.push(&path, cached, value);
            bounded(timeout, &target, run_value(call, target.clone())).await
        }
        .boxed()
    }
}

impl fmt::Debug for Whiteboard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Whiteboard")
            .field("actions", &self.actions.len())
            .field("getters", &self.getters.len())
            .field("setters", &self.setters.len())
            .field("services", &self.actions.service_count())
            .field("pulls", &self.pulls.len())
            .field("action_timeout", &self.action_timeout)
            .finish_non_exhaustive()
    }
}

fn scope<I, S>(providers: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    providers.into_iter().map(Into::into).collect()
}

fn value_spec(key: &RegistryKey, kind: ValueKind) -> ResourceSpec {
    ResourceSpec::new(&key.resource)
        .kind(kind)
        .resource_type(ResourceType::Property)
        .value_type(ValueType::Modifiable)
}

fn announce(
    role: &str,
    key: &RegistryKey,
    service: ServiceId,
    conflict: Option<&RegistrationConflict>,
) {
    match conflict {
        Some(RegistrationConflict::DuplicateCatchAll { existing }) => {
            warn!(role, %key, %service, %existing, "duplicate catch-all handler");
        }
        Some(RegistrationConflict::OverlappingProviders {
            existing,
            providers,
        }) => {
            warn!(
                role,
                %key,
                %service,
                %existing,
                ?providers,
                "handlers overlap on providers"
            );
        }
        None => debug!(role, %key, %service, "handler registered"),
    }
}

fn no_handler(path: &ResourcePath) -> CoreError {
    CoreError::NoSuitableHandler {
        path: path.to_string(),
    }
}

/// Apply the configured time limit to a handler call.
async fn bounded<T>(
    limit: Option<Duration>,
    target: &str,
    run: impl Future<Output = Result<T, CoreError>>,
) -> Result<T, CoreError> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, run)
            .await
            .map_err(|_| CoreError::Timeout {
                path: target.to_owned(),
                timeout_ms: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
            })?,
        None => run.await,
    }
}

async fn run_handler(
    handler: Arc<dyn ActionHandler>,
    call: ActionCall,
    target: String,
) -> Result<Value, CoreError> {
    let output = tokio::task::spawn_blocking(move || handler.act(call))
        .await
        .map_err(|error| CoreError::ActionFailed {
            path: target,
            message: error.to_string(),
        })??;
    match output {
        ActionOutput::Ready(value) => Ok(value),
        ActionOutput::Deferred(pending) => pending.await,
    }
}

async fn run_value<F>(call: F, target: String) -> Result<Option<TimedValue>, CoreError>
where
    F: FnOnce() -> ValueFuture + Send + 'static,
{
    let pending = tokio::task::spawn_blocking(call)
        .await
        .map_err(|error| CoreError::ActionFailed {
            path: target,
            message: error.to_string(),
        })?;
    pending.await
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use chrono::Utc;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::command::queue::Envelope;

    fn whiteboard(timeout: Option<Duration>) -> (Whiteboard, mpsc::UnboundedReceiver<Envelope>) {
        let (queue, rx) = CommandQueue::new(100, CancellationToken::new());
        (Whiteboard::new(queue, timeout), rx)
    }

    fn constant(value: Value) -> Arc<dyn ActionHandler> {
        Arc::new(FnAction::new(
            ActionSignature::returning(ValueKind::Any),
            move |_| Ok(ActionOutput::Ready(value.clone())),
        ))
    }

    fn key() -> RegistryKey {
        RegistryKey::new("lamp", "light", "toggle")
    }

    fn path(provider: &str) -> ResourcePath {
        ResourcePath::new("lamp", provider, "light", "toggle")
    }

    #[tokio::test]
    async fn scoped_handler_wins_over_catch_all() {
        let (board, _rx) = whiteboard(None);
        let all = board.allocate_service_id();
        let scoped = board.allocate_service_id();
        board.register(all, key(), Vec::<String>::new(), constant(json!("any")));
        board.register(scoped, key(), ["p1"], constant(json!("p1")));

        assert_eq!(board.handlers(&key()), vec![scoped, all]);
        assert_eq!(board.invoke(&path("p1"), Map::new()).await.unwrap(), json!("p1"));
        assert_eq!(board.invoke(&path("p2"), Map::new()).await.unwrap(), json!("any"));
    }

    #[tokio::test]
    async fn conflicts_are_reported_and_kept() {
        let (board, _rx) = whiteboard(None);
        let (a, b, c, d) = (
            board.allocate_service_id(),
            board.allocate_service_id(),
            board.allocate_service_id(),
            board.allocate_service_id(),
        );

        assert!(board.register(a, key(), Vec::<String>::new(), constant(json!(1))).conflict.is_none());
        let dup = board.register(b, key(), Vec::<String>::new(), constant(json!(2)));
        assert_eq!(dup.conflict, Some(RegistrationConflict::DuplicateCatchAll { existing: a }));

        board.register(c, key(), ["p1", "p2"], constant(json!(3)));
        let overlap = board.register(d, key(), ["p2", "p3"], constant(json!(4)));
        assert_eq!(
            overlap.conflict,
            Some(RegistrationConflict::OverlappingProviders {
                existing: c,
                providers: BTreeSet::from(["p2".to_owned()]),
            })
        );

        assert_eq!(board.handlers(&key()), vec![d, c, a, b]);
        assert_eq!(board.invoke(&path("p2"), Map::new()).await.unwrap(), json!(4));
        assert_eq!(board.invoke(&path("zz"), Map::new()).await.unwrap(), json!(1));
    }

    #[tokio::test]
    async fn deregister_prunes_only_that_service() {
        let (board, _rx) = whiteboard(None);
        let a = board.allocate_service_id();
        let b = board.allocate_service_id();
        board.register(a, key(), ["p1"], constant(json!("a")));
        board.register(b, key(), Vec::<String>::new(), constant(json!("b")));

        assert_eq!(board.deregister(a), 1);
        assert_eq!(board.deregister(a), 0);
        assert_eq!(board.handlers(&key()), vec![b]);
        assert_eq!(board.invoke(&path("p1"), Map::new()).await.unwrap(), json!("b"));

        board.deregister(b);
        assert!(board.keys().is_empty());
        let err = board.invoke(&path("p1"), Map::new()).await.unwrap_err();
        assert!(matches!(err, CoreError::NoSuitableHandler { .. }));
    }

    #[tokio::test]
    async fn scoped_only_key_rejects_other_providers() {
        let (board, _rx) = whiteboard(None);
        let a = board.allocate_service_id();
        board.register(a, key(), ["p1"], constant(json!(true)));
        let err = board.invoke(&path("p9"), Map::new()).await.unwrap_err();
        assert_eq!(
            err,
            CoreError::NoSuitableHandler {
                path: "lamp/p9/light/toggle".into()
            }
        );
    }

    #[tokio::test]
    async fn arguments_and_context_reach_the_handler() {
        let (board, _rx) = whiteboard(None);
        let signature = ActionSignature::returning(ValueKind::String)
            .context(ParameterSource::Provider)
            .argument("level", ValueKind::Integer);
        let handler = FnAction::new(signature, |call: ActionCall| {
            Ok(json!(format!("{}@{}", call.arguments[0], call.arguments[1])).into())
        });
        board.register(board.allocate_service_id(), key(), Vec::<String>::new(), Arc::new(handler));

        let mut args = Map::new();
        args.insert("level".into(), json!("7"));
        let out = board.invoke(&path("p1"), args).await.unwrap();
        assert_eq!(out, json!("\"p1\"@7"));
    }

    #[tokio::test]
    async fn deferred_output_is_awaited() {
        let (board, _rx) = whiteboard(None);
        let handler = FnAction::new(ActionSignature::returning(ValueKind::Integer), |_| {
            Ok(ActionOutput::Deferred(async { Ok(json!("42")) }.boxed()))
        });
        board.register(board.allocate_service_id(), key(), Vec::<String>::new(), Arc::new(handler));
        assert_eq!(board.invoke(&path("p1"), Map::new()).await.unwrap(), json!(42));
    }

    #[tokio::test]
    async fn panicking_handler_fails_the_call() {
        let (board, _rx) = whiteboard(None);
        let handler = FnAction::new(ActionSignature::returning(ValueKind::Any), |call: ActionCall| {
            if call.path.provider == "p1" {
                panic!("handler blew up");
            }
            Ok(Value::Null.into())
        });
        board.register(board.allocate_service_id(), key(), Vec::<String>::new(), Arc::new(handler));
        let err = board.invoke(&path("p1"), Map::new()).await.unwrap_err();
        assert!(matches!(err, CoreError::ActionFailed { .. }));
    }

    #[tokio::test]
    async fn slow_handler_times_out() {
        let (board, _rx) = whiteboard(Some(Duration::from_millis(20)));
        let handler = FnAction::new(ActionSignature::returning(ValueKind::Any), |_| {
            Ok(ActionOutput::Deferred(
                async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(Value::Null)
                }
                .boxed(),
            ))
        });
        board.register(board.allocate_service_id(), key(), Vec::<String>::new(), Arc::new(handler));
        let err = board.invoke(&path("p1"), Map::new()).await.unwrap_err();
        assert_eq!(
            err,
            CoreError::Timeout {
                path: "lamp/p1/light/toggle".into(),
                timeout_ms: 20,
            }
        );
    }

    // ── Get / set ────────────────────────────────────────────────────

    fn value_key() -> RegistryKey {
        RegistryKey::new("lamp", "light", "level")
    }

    fn value_path(provider: &str) -> ResourcePath {
        ResourcePath::new("lamp", provider, "light", "level")
    }

    #[tokio::test]
    async fn concurrent_pulls_share_one_call() {
        let (board, _rx) = whiteboard(None);
        let calls = Arc::new(AtomicUsize::new(0));
        let (release, gate) = tokio::sync::oneshot::channel::<()>();
        let gate = gate.shared();

        let counter = Arc::clone(&calls);
        let getter = move |_: &ResourcePath, _: Option<TimedValue>| -> ValueFuture {
            counter.fetch_add(1, Ordering::SeqCst);
            let gate = gate.clone();
            async move {
                let _ = gate.await;
                Ok(Some(TimedValue::new(json!(21), Utc::now())))
            }
            .boxed()
        };
        board.register_get(
            board.allocate_service_id(),
            value_key(),
            Vec::<String>::new(),
            ValueKind::Integer,
            Arc::new(getter),
        );

        let first = board.pull(&value_path("p1"), None);
        let second = board.pull(&value_path("p1"), None);
        let other = board.pull(&value_path("p2"), None);
        release.send(()).unwrap();
        let (first, second, other) = tokio::join!(first, second, other);

        assert_eq!(first.unwrap(), second.unwrap());
        assert_eq!(other.unwrap().unwrap().value, json!(21));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(board.pulls.is_empty());
    }

    #[tokio::test]
    async fn setter_receives_the_new_value() {
        let (board, _rx) = whiteboard(None);
        let setter = |path: &ResourcePath, cached: Option<TimedValue>, value: TimedValue| -> ValueFuture {
            let echoed = json!([path.provider, cached.map(|c| c.value), value.value]);
            async move { Ok(Some(TimedValue::new(echoed, Utc::now()))) }.boxed()
        };
        board.register_set(
            board.allocate_service_id(),
            value_key(),
            ["p1"],
            ValueKind::Any,
            Arc::new(setter),
        );

        let cached = TimedValue::new(json!(1), Utc::now());
        let out = board
            .push(&value_path("p1"), Some(cached), TimedValue::new(json!(2), Utc::now()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(out.value, json!(["p1", 1, 2]));

        let err = board
            .push(&value_path("p2"), None, TimedValue::new(json!(2), Utc::now()))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::NoSuitableHandler { .. }));
    }

    #[tokio::test]
    async fn deregister_covers_every_role() {
        let (board, _rx) = whiteboard(None);
        let svc = board.allocate_service_id();
        let getter = |_: &ResourcePath, cached: Option<TimedValue>| -> ValueFuture {
            async move { Ok(cached) }.boxed()
        };
        let setter = |_: &ResourcePath, _: Option<TimedValue>, value: TimedValue| -> ValueFuture {
            async move { Ok(Some(value)) }.boxed()
        };
        board.register_get(svc, value_key(), ["p1"], ValueKind::Any, Arc::new(getter));
        board.register_set(svc, value_key(), Vec::<String>::new(), ValueKind::Any, Arc::new(setter));
        board.register(svc, key(), Vec::<String>::new(), constant(json!(1)));

        assert_eq!(board.getters(&value_key()), vec![svc]);
        assert_eq!(board.setters(&value_key()), vec![svc]);
        assert_eq!(board.keys(), vec![value_key(), key()]);

        assert_eq!(board.deregister(svc), 3);
        assert!(board.keys().is_empty());
        let err = board.pull(&value_path("p1"), None).await.unwrap_err();
        assert!(matches!(err, CoreError::NoSuitableHandler { .. }));
    }
}
