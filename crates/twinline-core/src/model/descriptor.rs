// ── Model descriptors ──
//
// Immutable, versioned schema nodes. Slot indices are assigned in
// creation order and never reused, so an instance built against an
// older version can be migrated by copying slots by index.

use std::sync::Arc;

use indexmap::IndexMap;

use super::{
    ADMIN_SERVICE, ActionParameter, FRIENDLY_NAME, MODEL_URI, ResourceSpec, ResourceType,
    ValueType,
};
use crate::value::ValueKind;

/// A resource declaration inside a service.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceDescriptor {
    pub name: String,
    pub resource_type: ResourceType,
    pub value_type: ValueType,
    pub kind: ValueKind,
    pub lower_bound: u32,
    pub upper_bound: Option<u32>,
    pub parameters: Vec<ActionParameter>,
    pub(crate) slot: usize,
    /// Model version that introduced this resource.
    pub(crate) since: u64,
}

impl ResourceDescriptor {
    fn from_spec(spec: &ResourceSpec, slot: usize, since: u64) -> Self {
        Self {
            name: spec.name.clone(),
            resource_type: spec.resource_type,
            value_type: spec.value_type,
            kind: spec.kind,
            lower_bound: spec.lower_bound,
            upper_bound: spec.upper_bound,
            parameters: spec.parameters.clone(),
            slot,
            since,
        }
    }

    pub fn is_action(&self) -> bool {
        self.resource_type == ResourceType::Action
    }
}

/// A service declaration: an ordered set of resources.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceDescriptor {
    pub name: String,
    resources: IndexMap<String, Arc<ResourceDescriptor>>,
    pub(crate) slot: usize,
    pub(crate) since: u64,
}

impl ServiceDescriptor {
    pub fn resource(&self, name: &str) -> Option<&Arc<ResourceDescriptor>> {
        self.resources.get(name)
    }

    pub fn resources(&self) -> impl Iterator<Item = &Arc<ResourceDescriptor>> {
        self.resources.values()
    }

    pub(crate) fn resource_count(&self) -> usize {
        self.resources.len()
    }
}

/// One version of a provider model.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderModel {
    name: String,
    package_uri: String,
    services: IndexMap<String, ServiceDescriptor>,
    version: u64,
}

impl ProviderModel {
    pub(crate) fn new(name: impl Into<String>, package_uri: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            package_uri: package_uri.into(),
            services: IndexMap::new(),
            version: 0,
        }
    }

    /// Seed the admin service. Only valid on a fresh version-0 model.
    pub(crate) fn with_admin(mut self) -> Self {
        self.insert_service(ADMIN_SERVICE);
        self.insert_resource(
            ADMIN_SERVICE,
            &ResourceSpec::new(FRIENDLY_NAME)
                .kind(ValueKind::String)
                .resource_type(ResourceType::Property)
                .value_type(ValueType::Modifiable),
        );
        self.insert_resource(
            ADMIN_SERVICE,
            &ResourceSpec::new(MODEL_URI)
                .kind(ValueKind::String)
                .resource_type(ResourceType::Property)
                .value_type(ValueType::Fixed),
        );
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn package_uri(&self) -> &str {
        &self.package_uri
    }

    /// Package URI qualified with the model name, e.g. `urn:pkg/thermo`.
    pub fn model_uri(&self) -> String {
        format!("{}/{}", self.package_uri.trim_end_matches('/'), self.name)
    }

    /// Bumped every time a service or resource is added.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn services(&self) -> impl Iterator<Item = &ServiceDescriptor> {
        self.services.values()
    }

    pub fn service(&self, name: &str) -> Option<&ServiceDescriptor> {
        self.services.get(name)
    }

    pub fn resource(&self, service: &str, resource: &str) -> Option<&Arc<ResourceDescriptor>> {
        self.services.get(service)?.resource(resource)
    }

    pub(crate) fn service_count(&self) -> usize {
        self.services.len()
    }

    /// Next model version containing `service` (and `spec`, if given).
    ///
    /// Returns `None` when everything asked for already exists, in which
    /// case the current version stays in place.
    pub(crate) fn extend(&self, service: &str, spec: Option<&ResourceSpec>) -> Option<Self> {
        let has_service = self.services.contains_key(service);
        let has_resource = spec.is_none_or(|s| self.resource(service, &s.name).is_some());
        if has_service && has_resource {
            return None;
        }

        let mut next = self.clone();
        next.version += 1;
        if !has_service {
            next.insert_service(service);
        }
        if let Some(spec) = spec.filter(|_| !has_resource) {
            next.insert_resource(service, spec);
        }
        Some(next)
    }

    fn insert_service(&mut self, name: &str) {
        let slot = self.services.len();
        self.services.insert(
            name.to_owned(),
            ServiceDescriptor {
                name: name.to_owned(),
                resources: IndexMap::new(),
                slot,
                since: self.version,
            },
        );
    }

    fn insert_resource(&mut self, service: &str, spec: &ResourceSpec) {
        let since = self.version;
        if let Some(svc) = self.services.get_mut(service) {
            let slot = svc.resources.len();
            svc.resources.insert(
                spec.name.clone(),
                Arc::new(ResourceDescriptor::from_spec(spec, slot, since)),
            );
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn extend_is_noop_when_everything_exists() {
        let model = ProviderModel::new("m", "urn:m")
            .extend("s", Some(&ResourceSpec::new("r")))
            .unwrap();
        assert!(model.extend("s", Some(&ResourceSpec::new("r"))).is_none());
        assert!(model.extend("s", None).is_none());
    }

    #[test]
    fn extension_bumps_version_and_keeps_slots_stable() {
        let v1 = ProviderModel::new("m", "urn:m")
            .extend("s1", Some(&ResourceSpec::new("a")))
            .unwrap();
        let v2 = v1.extend("s2", Some(&ResourceSpec::new("b"))).unwrap();
        let v3 = v2.extend("s1", Some(&ResourceSpec::new("c"))).unwrap();

        assert_eq!(v1.version(), 1);
        assert_eq!(v3.version(), 3);

        let s1 = v3.service("s1").unwrap();
        assert_eq!(s1.slot, 0);
        assert_eq!(s1.resource("a").unwrap().slot, 0);
        assert_eq!(s1.resource("c").unwrap().slot, 1);
        assert_eq!(s1.resource("c").unwrap().since, 3);
        assert_eq!(v3.service("s2").unwrap().slot, 1);

        // Older versions are untouched.
        assert!(v1.service("s2").is_none());
        assert!(v2.resource("s1", "c").is_none());
    }

    #[test]
    fn admin_service_is_seeded_at_version_zero() {
        let model = ProviderModel::new("m", "urn:m").with_admin();
        assert_eq!(model.version(), 0);
        let uri = model.resource(ADMIN_SERVICE, MODEL_URI).unwrap();
        assert_eq!(uri.kind, ValueKind::String);
        assert_eq!(uri.resource_type, ResourceType::Property);
        assert_eq!(model.model_uri(), "urn:m/m");
    }
}
