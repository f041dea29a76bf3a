// ── Command-scoped handles ──
//
// `DigitalTwin` and `ModelManager` are the only way to change the twin.
// The gateway builds them for the duration of one command body and
// drops them when the body returns; their lifetime ties them to it.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::{self, BoxFuture, FutureExt};
use serde_json::{Map, Value};

use crate::command::{Command, CommandBody, CommandFuture, Pending};
use crate::engine::Engine;
use crate::error::CoreError;
use crate::model::{ProviderModel, ResourceDescriptor, ResourcePath, ResourceSpec};
use crate::notification::NotificationAccumulator;
use crate::store::{
    EnsuredResource, MetadataEntry, ProviderFilter, ProviderSnapshot, ResourceSnapshot,
    ServiceSnapshot, TwinStore,
};
use crate::update::DataUpdate;
use crate::value::TimedValue;
use crate::whiteboard::ValueFuture;

/// Read-write view of provider instances for the running command.
pub struct DigitalTwin<'a> {
    engine: &'a Engine,
    accumulator: &'a NotificationAccumulator,
}

impl<'a> DigitalTwin<'a> {
    pub(crate) fn new(engine: &'a Engine, accumulator: &'a NotificationAccumulator) -> Self {
        Self {
            engine,
            accumulator,
        }
    }

    /// Id of the command whose batch this twin records into.
    pub fn command_id(&self) -> u64 {
        self.accumulator.command_id()
    }

    // ── Providers ────────────────────────────────────────────────────

    /// Create an empty provider of an existing model.
    pub fn create_provider(&mut self, model: &str, name: &str) -> Result<ProviderSnapshot, CoreError> {
        self.engine
            .store
            .create_provider(model, name, Utc::now(), self.accumulator)
    }

    pub fn provider(&self, name: &str) -> Option<ProviderSnapshot> {
        self.engine.store.provider(name)
    }

    pub fn providers(&self) -> Vec<ProviderSnapshot> {
        self.engine.store.providers()
    }

    pub fn providers_of(&self, model: &str) -> Vec<ProviderSnapshot> {
        self.engine
            .store
            .filtered(&ProviderFilter::ByModel(model.to_owned()))
    }

    /// Remove a provider of `model`. Returns `false` if there was none.
    pub fn remove_provider(&mut self, model: &str, name: &str) -> bool {
        self.engine
            .store
            .remove_provider(model, name, self.accumulator)
    }

    pub fn service(&self, provider: &str, service: &str) -> Option<ServiceSnapshot> {
        self.engine.store.provider(provider)?.service(service).cloned()
    }

    pub fn resource(&self, provider: &str, service: &str, resource: &str) -> Option<ResourceSnapshot> {
        self.engine.store.resource(provider, service, resource)
    }

    // ── Values ───────────────────────────────────────────────────────

    /// Apply a data update, creating whatever it names.
    /// Returns `false` if the update was stale and ignored.
    pub fn update(&mut self, update: &DataUpdate) -> Result<bool, CoreError> {
        self.engine.store.apply(update, self.accumulator)
    }

    pub fn value(&self, provider: &str, service: &str, resource: &str) -> Option<TimedValue> {
        self.engine.store.value(provider, service, resource)
    }

    /// Set a declared resource's value, timestamped now.
    pub fn set_value(
        &mut self,
        provider: &str,
        service: &str,
        resource: &str,
        value: impl Into<Value>,
    ) -> Result<bool, CoreError> {
        self.set_value_at(provider, service, resource, value, Utc::now())
    }

    pub fn set_value_at(
        &mut self,
        provider: &str,
        service: &str,
        resource: &str,
        value: impl Into<Value>,
        timestamp: DateTime<Utc>,
    ) -> Result<bool, CoreError> {
        let path = self.path(provider, service, resource)?;
        self.engine
            .store
            .set_value(&path, value.into(), timestamp, self.accumulator)
    }

    pub fn metadata(
        &self,
        provider: &str,
        service: &str,
        resource: &str,
        key: &str,
    ) -> Option<MetadataEntry> {
        self.engine.store.metadata(provider, service, resource, key)
    }

    pub fn set_metadata(
        &mut self,
        provider: &str,
        service: &str,
        resource: &str,
        key: &str,
        value: impl Into<Value>,
    ) -> Result<(), CoreError> {
        let path = self.path(provider, service, resource)?;
        self.engine
            .store
            .set_metadata(&path, key, value.into(), Utc::now(), self.accumulator)
    }

    // ── Links ────────────────────────────────────────────────────────

    pub fn link_providers(&mut self, parent: &str, child: &str) -> Result<bool, CoreError> {
        self.engine.store.link(parent, child)
    }

    pub fn unlink_providers(&mut self, parent: &str, child: &str) -> Result<bool, CoreError> {
        self.engine.store.unlink(parent, child)
    }

    // ── Actions ──────────────────────────────────────────────────────

    /// Invoke an action resource. The handler runs off the writer; the
    /// returned future resolves with its result.
    pub fn act(
        &mut self,
        provider: &str,
        service: &str,
        resource: &str,
        arguments: Map<String, Value>,
    ) -> CommandFuture<Value> {
        let path = match self.declared(provider, service, resource) {
            Ok((path, descriptor)) if descriptor.is_action() => path,
            Ok((path, _)) => {
                return future::ready(Err(CoreError::conflict(
                    path.to_string(),
                    "resource is not an action",
                )))
                .boxed();
            }
            Err(error) => return future::ready(Err(error)).boxed(),
        };

        self.accumulator.resource_action(&path, Utc::now());
        self.engine.whiteboard.invoke(&path, arguments)
    }

    /// Ask the resource's get handler for a fresh value and store what
    /// it returns. Resolves to the stored value, or `None` if the handler
    /// had nothing to report.
    pub fn pull_value(
        &mut self,
        provider: &str,
        service: &str,
        resource: &str,
    ) -> CommandFuture<Option<TimedValue>> {
        let path = match self.value_resource(provider, service, resource) {
            Ok((path, _)) => path,
            Err(error) => return future::ready(Err(error)).boxed(),
        };
        let cached = self.engine.store.value(provider, service, resource);
        let pulled = self.engine.whiteboard.pull(&path, cached);
        self.store_result(path, pulled)
    }

    /// Write `value` through the resource's set handler, then store what
    /// the handler confirms.
    pub fn push_value(
        &mut self,
        provider: &str,
        service: &str,
        resource: &str,
        value: impl Into<Value>,
    ) -> CommandFuture<Option<TimedValue>> {
        let (path, value) = match self
            .value_resource(provider, service, resource)
            .and_then(|(path, descriptor)| Ok((path, descriptor.kind.coerce(value.into())?)))
        {
            Ok(resolved) => resolved,
            Err(error) => return future::ready(Err(error)).boxed(),
        };
        let cached = self.engine.store.value(provider, service, resource);
        let pushed = self
            .engine
            .whiteboard
            .push(&path, cached, TimedValue::new(value, Utc::now()));
        self.store_result(path, pushed)
    }

    // ── Follow-ups ───────────────────────────────────────────────────

    /// Queue a separate top-level command. It runs after the current one
    /// and flushes its own batch.
    pub fn execute<U: Send + 'static>(&self, command: Command<U>) -> Pending<U> {
        self.engine.queue.submit(command)
    }

    /// Finish a dependent command once its parent resolves, writing into
    /// this command's batch.
    pub(crate) fn continue_after<T: Send + 'static>(
        &self,
        parent: BoxFuture<'static, CommandBody<T>>,
    ) -> CommandFuture<T> {
        let queue = self.engine.queue.clone();
        let accumulator = self.accumulator.clone();
        async move {
            let body = parent.await;
            queue
                .submit_inherited(Command::from_body(body), accumulator)
                .await
        }
        .boxed()
    }

    /// Write a handler's result into this command's batch once it arrives.
    fn store_result(
        &self,
        path: ResourcePath,
        result: ValueFuture,
    ) -> CommandFuture<Option<TimedValue>> {
        let queue = self.engine.queue.clone();
        let accumulator = self.accumulator.clone();
        async move {
            let Some(timed) = result.await? else {
                return Ok(None);
            };
            let write = Command::twin(move |twin| {
                let timestamp = timed.timestamp.unwrap_or_else(Utc::now);
                let ResourcePath {
                    provider,
                    service,
                    resource,
                    ..
                } = &path;
                twin.set_value_at(provider, service, resource, timed.value, timestamp)?;
                Ok(twin.value(provider, service, resource))
            });
            queue.submit_inherited(write, accumulator).await
        }
        .boxed()
    }

    fn declared(
        &self,
        provider: &str,
        service: &str,
        resource: &str,
    ) -> Result<(ResourcePath, Arc<ResourceDescriptor>), CoreError> {
        let path = self.path(provider, service, resource)?;
        let descriptor = self
            .engine
            .store
            .model(&path.model)
            .and_then(|model| model.resource(service, resource).cloned())
            .ok_or_else(|| CoreError::not_found(path.to_string()))?;
        Ok((path, descriptor))
    }

    fn value_resource(
        &self,
        provider: &str,
        service: &str,
        resource: &str,
    ) -> Result<(ResourcePath, Arc<ResourceDescriptor>), CoreError> {
        let (path, descriptor) = self.declared(provider, service, resource)?;
        if descriptor.is_action() {
            return Err(CoreError::conflict(
                path.to_string(),
                "action resources hold no value",
            ));
        }
        Ok((path, descriptor))
    }

    fn path(&self, provider: &str, service: &str, resource: &str) -> Result<ResourcePath, CoreError> {
        let model = self
            .engine
            .store
            .model_of(provider)
            .ok_or_else(|| CoreError::not_found(provider))?;
        Ok(ResourcePath::new(model, provider, service, resource))
    }
}

/// Read-write view of the resource model for the running command.
pub struct ModelManager<'a> {
    store: &'a TwinStore,
}

impl<'a> ModelManager<'a> {
    pub(crate) fn new(store: &'a TwinStore) -> Self {
        Self { store }
    }

    pub fn model(&self, name: &str) -> Option<Arc<ProviderModel>> {
        self.store.model(name)
    }

    pub fn models(&self) -> Vec<Arc<ProviderModel>> {
        self.store.models()
    }

    /// Create an empty model. Fails if one with that name exists.
    pub fn create_model(
        &mut self,
        name: &str,
        package_uri: Option<&str>,
    ) -> Result<Arc<ProviderModel>, CoreError> {
        self.store.create_model(name, package_uri)
    }

    pub fn ensure_service(&mut self, model: &str, service: &str) -> Result<bool, CoreError> {
        self.store.ensure_service(model, service)
    }

    /// Declare a resource unless it already exists. An existing
    /// declaration is returned as-is, whatever its type.
    pub fn ensure_resource(
        &mut self,
        model: &str,
        service: &str,
        spec: &ResourceSpec,
    ) -> Result<EnsuredResource, CoreError> {
        self.store.ensure_resource(model, service, spec)
    }

    /// Declare a new resource. Fails if it already exists.
    pub fn declare_resource(
        &mut self,
        model: &str,
        service: &str,
        spec: &ResourceSpec,
    ) -> Result<Arc<ResourceDescriptor>, CoreError> {
        let ensured = self.store.ensure_resource(model, service, spec)?;
        if ensured.created {
            Ok(ensured.descriptor)
        } else {
            Err(CoreError::conflict(
                format!("{model}/{service}/{}", spec.name),
                "resource already exists",
            ))
        }
    }
}
