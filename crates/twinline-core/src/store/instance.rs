// ── Provider instances ──
//
// Data side of the twin. An instance is laid out by slot index against
// the model version it was built with; `upgrade` migrates it to a newer
// version by copying every slot the older version already knew about.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::{ProviderModel, ServiceDescriptor};

/// Timestamped metadata value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataEntry {
    pub value: Value,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct ResourceState {
    pub(crate) value: Value,
    pub(crate) timestamp: Option<DateTime<Utc>>,
    pub(crate) metadata: BTreeMap<String, MetadataEntry>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ServiceState {
    pub(crate) resources: Vec<ResourceState>,
}

impl ServiceState {
    pub(crate) fn new(descriptor: &ServiceDescriptor) -> Self {
        Self {
            resources: vec![ResourceState::default(); descriptor.resource_count()],
        }
    }

    pub(crate) fn resource(&self, slot: usize) -> Option<&ResourceState> {
        self.resources.get(slot)
    }

    pub(crate) fn resource_mut(&mut self, slot: usize) -> &mut ResourceState {
        if self.resources.len() <= slot {
            self.resources.resize_with(slot + 1, ResourceState::default);
        }
        &mut self.resources[slot]
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ProviderState {
    pub(crate) name: String,
    pub(crate) schema: Arc<ProviderModel>,
    /// Indexed by service slot; `None` until the service is first written.
    pub(crate) services: Vec<Option<ServiceState>>,
    pub(crate) linked: BTreeSet<String>,
}

impl ProviderState {
    pub(crate) fn new(name: impl Into<String>, schema: Arc<ProviderModel>) -> Self {
        Self {
            name: name.into(),
            services: vec![None; schema.service_count()],
            schema,
            linked: BTreeSet::new(),
        }
    }

    pub(crate) fn service(&self, slot: usize) -> Option<&ServiceState> {
        self.services.get(slot)?.as_ref()
    }

    /// Service instance for `descriptor`, created if missing.
    /// The flag is `true` when it was created by this call.
    pub(crate) fn service_mut(&mut self, descriptor: &ServiceDescriptor) -> (&mut ServiceState, bool) {
        if self.services.len() <= descriptor.slot {
            self.services.resize_with(descriptor.slot + 1, || None);
        }
        let entry = &mut self.services[descriptor.slot];
        let created = entry.is_none();
        (
            entry.get_or_insert_with(|| ServiceState::new(descriptor)),
            created,
        )
    }

    /// Rebuild this instance against a newer model version.
    ///
    /// Services and resources introduced after the instance's own version
    /// start empty; everything else is copied by slot.
    pub(crate) fn upgrade(&self, schema: &Arc<ProviderModel>) -> Self {
        let known = self.schema.version();
        let mut services = vec![None; schema.service_count()];

        for descriptor in schema.services() {
            if descriptor.since > known {
                continue;
            }
            let Some(old) = self.service(descriptor.slot) else {
                continue;
            };
            let resources = descriptor
                .resources()
                .map(|resource| {
                    if resource.since > known {
                        ResourceState::default()
                    } else {
                        old.resource(resource.slot).cloned().unwrap_or_default()
                    }
                })
                .collect();
            if let Some(slot) = services.get_mut(descriptor.slot) {
                *slot = Some(ServiceState { resources });
            }
        }

        Self {
            name: self.name.clone(),
            schema: Arc::clone(schema),
            services,
            linked: self.linked.clone(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;
    use crate::model::ResourceSpec;

    fn write(provider: &mut ProviderState, service: &str, resource: &str, value: Value) {
        let schema = Arc::clone(&provider.schema);
        let svc = schema.service(service).unwrap();
        let slot = svc.resource(resource).unwrap().slot;
        let (state, _) = provider.service_mut(svc);
        let res = state.resource_mut(slot);
        res.value = value;
        res.timestamp = Some(Utc::now());
    }

    fn read(provider: &ProviderState, service: &str, resource: &str) -> Option<Value> {
        let svc = provider.schema.service(service)?;
        let slot = svc.resource(resource)?.slot;
        provider
            .service(svc.slot)?
            .resource(slot)
            .map(|r| r.value.clone())
    }

    #[test]
    fn upgrade_preserves_existing_slots() {
        let v1 = Arc::new(
            ProviderModel::new("m", "urn:m")
                .extend("s1", Some(&ResourceSpec::new("a")))
                .unwrap(),
        );
        let mut provider = ProviderState::new("p", Arc::clone(&v1));
        write(&mut provider, "s1", "a", json!(42));

        let v2 = Arc::new(v1.extend("s2", Some(&ResourceSpec::new("b"))).unwrap());
        let v3 = Arc::new(v2.extend("s1", Some(&ResourceSpec::new("c"))).unwrap());
        let upgraded = provider.upgrade(&v3);

        assert_eq!(upgraded.schema.version(), 3);
        assert_eq!(read(&upgraded, "s1", "a"), Some(json!(42)));
        assert_eq!(read(&upgraded, "s1", "c"), Some(Value::Null));
        assert!(upgraded.service(v3.service("s2").unwrap().slot).is_none());

        // The original instance is untouched.
        assert_eq!(provider.schema.version(), 1);
        assert_eq!(read(&provider, "s1", "a"), Some(json!(42)));
    }

    #[test]
    fn service_mut_reports_creation_once() {
        let schema = Arc::new(
            ProviderModel::new("m", "urn:m")
                .extend("s", Some(&ResourceSpec::new("r")))
                .unwrap(),
        );
        let mut provider = ProviderState::new("p", Arc::clone(&schema));
        let svc = schema.service("s").unwrap();
        assert!(provider.service_mut(svc).1);
        assert!(!provider.service_mut(svc).1);
    }
}
