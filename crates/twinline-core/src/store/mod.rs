// ── Twin store ──
//
// Owns every model and provider instance. Each model sits behind its
// own `RwLock`; instances are `Arc`-shared so readers copy out a
// consistent instance while holding the read lock only briefly.
//
// Mutating methods are crate-private: they are reachable only through
// the `DigitalTwin` / `ModelManager` handles the gateway hands to a
// running command, so every write happens on the single writer task.

mod filter;
mod instance;
mod snapshot;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use indexmap::IndexMap;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::GatewayConfig;
use crate::error::CoreError;
use crate::model::{
    ADMIN_SERVICE, FRIENDLY_NAME, MODEL_URI, ProviderModel, ResourceDescriptor, ResourcePath,
    ResourceSpec, ServiceDescriptor,
};
use crate::notification::NotificationAccumulator;
use crate::update::DataUpdate;
use crate::value::TimedValue;

pub use filter::ProviderFilter;
pub use instance::MetadataEntry;
pub use snapshot::{ProviderSnapshot, ResourceSnapshot, ServiceSnapshot};

use instance::{ProviderState, ResourceState};

/// Outcome of [`ModelManager::ensure_resource`](crate::ModelManager::ensure_resource).
#[derive(Debug, Clone, PartialEq)]
pub struct EnsuredResource {
    pub descriptor: Arc<ResourceDescriptor>,
    /// `true` when this call added the resource to the model.
    pub created: bool,
}

struct ModelState {
    schema: Arc<ProviderModel>,
    providers: IndexMap<String, Arc<ProviderState>>,
}

struct ModelEntry {
    state: RwLock<ModelState>,
}

impl ModelEntry {
    fn new(schema: ProviderModel) -> Self {
        Self {
            state: RwLock::new(ModelState {
                schema: Arc::new(schema),
                providers: IndexMap::new(),
            }),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, ModelState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, ModelState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A write target resolved against one model version.
struct Target<'a> {
    path: &'a ResourcePath,
    service: &'a ServiceDescriptor,
    resource: &'a ResourceDescriptor,
}

/// Concurrent store of models and provider instances.
pub struct TwinStore {
    models: DashMap<String, Arc<ModelEntry>>,
    /// Provider name -> owning model name. Provider names are global.
    owners: DashMap<String, String>,
    config: GatewayConfig,
}

impl TwinStore {
    pub fn new(config: &GatewayConfig) -> Self {
        Self {
            models: DashMap::new(),
            owners: DashMap::new(),
            config: config.clone(),
        }
    }

    // ── Reads ────────────────────────────────────────────────────────

    pub fn model(&self, name: &str) -> Option<Arc<ProviderModel>> {
        let entry = self.entry(name)?;
        let schema = Arc::clone(&entry.read().schema);
        Some(schema)
    }

    /// All models, ordered by name.
    pub fn models(&self) -> Vec<Arc<ProviderModel>> {
        let mut models: Vec<Arc<ProviderModel>> = self
            .entries()
            .iter()
            .map(|entry| Arc::clone(&entry.read().schema))
            .collect();
        models.sort_by(|a, b| a.name().cmp(b.name()));
        models
    }

    /// Name of the model a provider belongs to.
    pub fn model_of(&self, provider: &str) -> Option<String> {
        self.owners.get(provider).map(|owner| owner.value().clone())
    }

    pub fn provider_count(&self) -> usize {
        self.owners.len()
    }

    pub fn provider(&self, name: &str) -> Option<ProviderSnapshot> {
        self.provider_state(name)
            .map(|state| ProviderSnapshot::capture(&state))
    }

    /// Snapshot of every provider, ordered by name.
    pub fn providers(&self) -> Vec<ProviderSnapshot> {
        self.filtered(&ProviderFilter::All)
    }

    pub fn filtered(&self, filter: &ProviderFilter) -> Vec<ProviderSnapshot> {
        let mut states: Vec<Arc<ProviderState>> = Vec::new();
        for entry in self.entries() {
            states.extend(entry.read().providers.values().cloned());
        }
        let mut snapshots: Vec<ProviderSnapshot> = states
            .iter()
            .map(|state| ProviderSnapshot::capture(state))
            .filter(|snapshot| filter.matches(snapshot))
            .collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }

    pub fn resource(
        &self,
        provider: &str,
        service: &str,
        resource: &str,
    ) -> Option<ResourceSnapshot> {
        self.provider(provider)?
            .resource(service, resource)
            .cloned()
    }

    /// Current value of a resource.
    ///
    /// `None` when the provider, service instance or resource does not exist.
    pub fn value(&self, provider: &str, service: &str, resource: &str) -> Option<TimedValue> {
        let state = self.provider_state(provider)?;
        let slot = Self::slot(&state, service, resource)?;
        Some(TimedValue {
            value: slot.value.clone(),
            timestamp: slot.timestamp,
        })
    }

    pub fn metadata(
        &self,
        provider: &str,
        service: &str,
        resource: &str,
        key: &str,
    ) -> Option<MetadataEntry> {
        let state = self.provider_state(provider)?;
        Self::slot(&state, service, resource)?.metadata.get(key).cloned()
    }

    // ── Model writes ─────────────────────────────────────────────────

    pub(crate) fn create_model(
        &self,
        name: &str,
        package_uri: Option<&str>,
    ) -> Result<Arc<ProviderModel>, CoreError> {
        require_name("model", name)?;
        match self.models.entry(name.to_owned()) {
            Entry::Occupied(_) => Err(CoreError::conflict(name, "model already exists")),
            Entry::Vacant(vacant) => {
                let entry = Arc::new(ModelEntry::new(self.fresh_model(name, package_uri)));
                let schema = Arc::clone(&entry.read().schema);
                vacant.insert(entry);
                debug!(model = name, "model created");
                Ok(schema)
            }
        }
    }

    /// Add a service to a model, creating the model when needed.
    /// Returns `true` if the service was new.
    pub(crate) fn ensure_service(&self, model: &str, service: &str) -> Result<bool, CoreError> {
        require_name("model", model)?;
        require_name("service", service)?;
        let entry = self.entry_or_create(model, None);
        let mut state = entry.write();
        Ok(Self::extend(&mut state, service, None))
    }

    /// Add a resource (and its service) to a model, creating the model
    /// when needed. Existing declarations are left untouched.
    pub(crate) fn ensure_resource(
        &self,
        model: &str,
        service: &str,
        spec: &ResourceSpec,
    ) -> Result<EnsuredResource, CoreError> {
        require_name("model", model)?;
        require_name("service", service)?;
        require_name("resource", &spec.name)?;

        let entry = self.entry_or_create(model, None);
        let mut state = entry.write();
        let created = Self::extend(&mut state, service, Some(spec));
        let descriptor = state
            .schema
            .resource(service, &spec.name)
            .cloned()
            .ok_or_else(|| CoreError::not_found(format!("{model}/{service}/{}", spec.name)))?;
        Ok(EnsuredResource {
            descriptor,
            created,
        })
    }

    // ── Instance writes ──────────────────────────────────────────────

    pub(crate) fn create_provider(
        &self,
        model: &str,
        name: &str,
        timestamp: DateTime<Utc>,
        acc: &NotificationAccumulator,
    ) -> Result<ProviderSnapshot, CoreError> {
        require_name("provider", name)?;
        if let Some(owner) = self.model_of(name) {
            return Err(CoreError::conflict(
                name,
                format!("provider already exists with model {owner}"),
            ));
        }
        let entry = self
            .entry(model)
            .ok_or_else(|| CoreError::not_found(model))?;

        let mut state = entry.write();
        let provider = self.insert_provider(&mut state, name, timestamp, acc);
        Ok(ProviderSnapshot::capture(&provider))
    }

    /// Apply one data update, creating whatever it names.
    ///
    /// Returns `false` when the update was older than the stored value
    /// and therefore ignored.
    pub(crate) fn apply(
        &self,
        update: &DataUpdate,
        acc: &NotificationAccumulator,
    ) -> Result<bool, CoreError> {
        update.validate()?;
        let path = update.path();
        self.check_owner(&path.provider, &path.model)?;
        let timestamp = update.timestamp.unwrap_or_else(Utc::now);

        // Everything that can fail is checked before anything changes,
        // including the creation of a model on first use.
        let declared = self
            .model(&path.model)
            .and_then(|schema| schema.resource(&path.service, &path.resource).cloned());
        let value = match declared {
            Some(existing) => {
                check_writable(&path, &existing)?;
                existing.kind.coerce(update.value.clone())?
            }
            None => update.effective_kind().coerce(update.value.clone())?,
        };

        let entry = self.entry_or_create(&path.model, update.model_package_uri.as_deref());
        let mut state = entry.write();

        let spec = ResourceSpec::new(&path.resource).kind(update.effective_kind());
        Self::extend(&mut state, &path.service, Some(&spec));

        if !state.providers.contains_key(&path.provider) {
            self.insert_provider(&mut state, &path.provider, timestamp, acc);
        }

        let schema = Arc::clone(&state.schema);
        let target = resolve(&schema, &path)?;
        let provider = state
            .providers
            .get_mut(&path.provider)
            .ok_or_else(|| CoreError::not_found(path.to_string()))?;
        Ok(write_value(
            Arc::make_mut(provider),
            &target,
            value,
            &update.metadata,
            timestamp,
            acc,
        ))
    }

    /// Set the value of an existing resource on an existing provider.
    pub(crate) fn set_value(
        &self,
        path: &ResourcePath,
        value: Value,
        timestamp: DateTime<Utc>,
        acc: &NotificationAccumulator,
    ) -> Result<bool, CoreError> {
        self.with_provider(path, |provider, target| {
            check_writable(path, target.resource)?;
            let value = target.resource.kind.coerce(value)?;
            Ok(write_value(
                provider,
                target,
                value,
                &BTreeMap::new(),
                timestamp,
                acc,
            ))
        })
    }

    pub(crate) fn set_metadata(
        &self,
        path: &ResourcePath,
        key: &str,
        value: Value,
        timestamp: DateTime<Utc>,
        acc: &NotificationAccumulator,
    ) -> Result<(), CoreError> {
        if key.trim().is_empty() {
            return Err(CoreError::invalid_input("metadata key must not be empty"));
        }
        self.with_provider(path, |provider, target| {
            let slot = open_slot(provider, target, acc);
            let old = slot.metadata.insert(
                key.to_owned(),
                MetadataEntry {
                    value: value.clone(),
                    timestamp,
                },
            );
            acc.metadata_update(path, key, old.map(|m| m.value), value, timestamp);
            Ok(())
        })
    }

    /// Remove a provider. Returns `false` when it does not exist or
    /// belongs to another model.
    pub(crate) fn remove_provider(
        &self,
        model: &str,
        name: &str,
        acc: &NotificationAccumulator,
    ) -> bool {
        match self.model_of(name) {
            None => {
                debug!(provider = name, "no provider to remove");
                false
            }
            Some(owner) if owner != model => {
                warn!(
                    provider = name,
                    requested = model,
                    actual = %owner,
                    "refusing to remove provider of a different model"
                );
                false
            }
            Some(_) => {
                let Some(entry) = self.entry(model) else {
                    return false;
                };
                let removed = entry.write().providers.shift_remove(name).is_some();
                if removed {
                    self.owners.remove(name);
                    self.drop_links_to(name);
                    acc.remove_provider(model, name);
                }
                removed
            }
        }
    }

    /// Record that `parent` links to `child`. Returns `false` if it already did.
    pub(crate) fn link(&self, parent: &str, child: &str) -> Result<bool, CoreError> {
        if self.model_of(child).is_none() {
            return Err(CoreError::not_found(child));
        }
        self.update_links(parent, |links| links.insert(child.to_owned()))
    }

    pub(crate) fn unlink(&self, parent: &str, child: &str) -> Result<bool, CoreError> {
        self.update_links(parent, |links| links.remove(child))
    }

    // ── Internals ────────────────────────────────────────────────────

    fn entry(&self, model: &str) -> Option<Arc<ModelEntry>> {
        self.models.get(model).map(|entry| Arc::clone(entry.value()))
    }

    fn entries(&self) -> Vec<Arc<ModelEntry>> {
        self.models
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    fn entry_or_create(&self, model: &str, package_uri: Option<&str>) -> Arc<ModelEntry> {
        let entry = self.models.entry(model.to_owned()).or_insert_with(|| {
            debug!(model, "model created on first use");
            Arc::new(ModelEntry::new(self.fresh_model(model, package_uri)))
        });
        Arc::clone(entry.value())
    }

    fn fresh_model(&self, name: &str, package_uri: Option<&str>) -> ProviderModel {
        let uri = package_uri
            .filter(|uri| !uri.trim().is_empty())
            .map_or_else(|| self.config.package_uri(name), str::to_owned);
        let model = ProviderModel::new(name, uri);
        if self.config.admin_service {
            model.with_admin()
        } else {
            model
        }
    }

    fn provider_state(&self, name: &str) -> Option<Arc<ProviderState>> {
        let model = self.model_of(name)?;
        let entry = self.entry(&model)?;
        let state = entry.read().providers.get(name).cloned();
        state
    }

    fn slot<'a>(
        state: &'a ProviderState,
        service: &str,
        resource: &str,
    ) -> Option<&'a ResourceState> {
        let descriptor = state.schema.service(service)?;
        let slot = descriptor.resource(resource)?.slot;
        state.service(descriptor.slot)?.resource(slot)
    }

    fn check_owner(&self, provider: &str, model: &str) -> Result<(), CoreError> {
        match self.model_of(provider) {
            Some(owner) if owner != model => Err(CoreError::conflict(
                provider,
                format!("provider already exists with model {owner}"),
            )),
            _ => Ok(()),
        }
    }

    /// Swap in the next model version and migrate every instance to it.
    /// Returns `true` if the model changed.
    fn extend(state: &mut ModelState, service: &str, spec: Option<&ResourceSpec>) -> bool {
        let Some(next) = state.schema.extend(service, spec) else {
            return false;
        };
        let next = Arc::new(next);
        debug!(
            model = next.name(),
            version = next.version(),
            service,
            instances = state.providers.len(),
            "model extended"
        );
        for provider in state.providers.values_mut() {
            *provider = Arc::new(provider.upgrade(&next));
        }
        state.schema = next;
        true
    }

    fn insert_provider(
        &self,
        state: &mut ModelState,
        name: &str,
        timestamp: DateTime<Utc>,
        acc: &NotificationAccumulator,
    ) -> Arc<ProviderState> {
        let schema = Arc::clone(&state.schema);
        let mut provider = ProviderState::new(name, Arc::clone(&schema));
        acc.add_provider(schema.name(), name);

        let admin = schema
            .service(ADMIN_SERVICE)
            .filter(|_| self.config.admin_service);
        if let Some(admin) = admin {
            let seeds = [
                (FRIENDLY_NAME, Value::from(name)),
                (MODEL_URI, Value::from(schema.model_uri())),
            ];
            for (resource, value) in seeds {
                if let Some(descriptor) = admin.resource(resource) {
                    let path = ResourcePath::new(schema.name(), name, ADMIN_SERVICE, resource);
                    let target = Target {
                        path: &path,
                        service: admin,
                        resource: descriptor,
                    };
                    write_value(
                        &mut provider,
                        &target,
                        value,
                        &BTreeMap::new(),
                        timestamp,
                        acc,
                    );
                }
            }
        }

        let provider = Arc::new(provider);
        state
            .providers
            .insert(name.to_owned(), Arc::clone(&provider));
        self.owners.insert(name.to_owned(), schema.name().to_owned());
        debug!(model = schema.name(), provider = name, "provider created");
        provider
    }

    /// Run `f` against a mutable provider instance resolved from `path`.
    fn with_provider<T>(
        &self,
        path: &ResourcePath,
        f: impl FnOnce(&mut ProviderState, &Target<'_>) -> Result<T, CoreError>,
    ) -> Result<T, CoreError> {
        match self.model_of(&path.provider) {
            Some(owner) if owner == path.model => {}
            Some(owner) => {
                return Err(CoreError::conflict(
                    &path.provider,
                    format!("provider belongs to model {owner}"),
                ));
            }
            None => return Err(CoreError::not_found(&path.provider)),
        }
        let entry = self
            .entry(&path.model)
            .ok_or_else(|| CoreError::not_found(&path.model))?;
        let mut state = entry.write();
        let schema = Arc::clone(&state.schema);
        let target = resolve(&schema, path)?;
        let provider = state
            .providers
            .get_mut(&path.provider)
            .ok_or_else(|| CoreError::not_found(&path.provider))?;
        f(Arc::make_mut(provider), &target)
    }

    fn update_links(
        &self,
        parent: &str,
        f: impl FnOnce(&mut BTreeSet<String>) -> bool,
    ) -> Result<bool, CoreError> {
        let model = self
            .model_of(parent)
            .ok_or_else(|| CoreError::not_found(parent))?;
        let entry = self
            .entry(&model)
            .ok_or_else(|| CoreError::not_found(&model))?;
        let mut state = entry.write();
        let provider = state
            .providers
            .get_mut(parent)
            .ok_or_else(|| CoreError::not_found(parent))?;
        Ok(f(&mut Arc::make_mut(provider).linked))
    }

    fn drop_links_to(&self, child: &str) {
        for entry in self.entries() {
            let mut state = entry.write();
            for provider in state.providers.values_mut() {
                if provider.linked.contains(child) {
                    Arc::make_mut(provider).linked.remove(child);
                }
            }
        }
    }
}

impl std::fmt::Debug for TwinStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TwinStore")
            .field("models", &self.models.len())
            .field("providers", &self.owners.len())
            .finish_non_exhaustive()
    }
}

fn require_name(what: &str, name: &str) -> Result<(), CoreError> {
    if name.trim().is_empty() {
        Err(CoreError::invalid_input(format!("{what} name must not be empty")))
    } else {
        Ok(())
    }
}

fn check_writable(path: &ResourcePath, resource: &ResourceDescriptor) -> Result<(), CoreError> {
    if resource.is_action() {
        Err(CoreError::conflict(
            path.to_string(),
            "action resources hold no value",
        ))
    } else {
        Ok(())
    }
}

fn resolve<'a>(schema: &'a ProviderModel, path: &'a ResourcePath) -> Result<Target<'a>, CoreError> {
    let service = schema
        .service(&path.service)
        .ok_or_else(|| CoreError::not_found(path.to_string()))?;
    let resource = service
        .resource(&path.resource)
        .ok_or_else(|| CoreError::not_found(path.to_string()))?;
    Ok(Target {
        path,
        service,
        resource,
    })
}

/// Resource slot for `target`, instantiating its service on first use.
fn open_slot<'p>(
    provider: &'p mut ProviderState,
    target: &Target<'_>,
    acc: &NotificationAccumulator,
) -> &'p mut ResourceState {
    let path = target.path;
    let (service, created) = provider.service_mut(target.service);
    if created {
        acc.add_service(&path.model, &path.provider, &path.service);
    }
    let slot = service.resource_mut(target.resource.slot);
    if slot.timestamp.is_none() && slot.metadata.is_empty() {
        acc.add_resource(path);
    }
    slot
}

/// Store an already-coerced value. Returns `false` for a stale update.
fn write_value(
    provider: &mut ProviderState,
    target: &Target<'_>,
    value: Value,
    metadata: &BTreeMap<String, Value>,
    timestamp: DateTime<Utc>,
    acc: &NotificationAccumulator,
) -> bool {
    let path = target.path;
    let slot = open_slot(provider, target, acc);
    if let Some(current) = slot.timestamp {
        if timestamp < current {
            debug!(
                resource = %path,
                %current,
                rejected = %timestamp,
                "ignoring stale update"
            );
            return false;
        }
    }

    let old = std::mem::replace(&mut slot.value, value.clone());
    slot.timestamp = Some(timestamp);
    acc.resource_value_update(path, old, value, timestamp);

    for (key, value) in metadata {
        let previous = slot.metadata.insert(
            key.clone(),
            MetadataEntry {
                value: value.clone(),
                timestamp,
            },
        );
        acc.metadata_update(path, key, previous.map(|m| m.value), value.clone(), timestamp);
    }
    true
}
