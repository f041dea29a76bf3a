// ── Snapshots ──
//
// Owned, immutable copies of twin state. These are the only thing that
// crosses out of the store to readers outside the writer task.

use std::collections::BTreeMap;

use serde::Serialize;

use super::instance::{MetadataEntry, ProviderState};
use crate::model::{ActionParameter, ResourceType, ValueType};
use crate::value::{TimedValue, ValueKind};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderSnapshot {
    pub model: String,
    pub package_uri: String,
    pub name: String,
    /// Model version the instance was read at.
    pub model_version: u64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub linked: Vec<String>,
    pub services: Vec<ServiceSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceSnapshot {
    pub provider: String,
    pub name: String,
    pub resources: Vec<ResourceSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceSnapshot {
    pub provider: String,
    pub service: String,
    pub name: String,
    pub resource_type: ResourceType,
    pub value_type: ValueType,
    pub kind: ValueKind,
    #[serde(flatten)]
    pub value: TimedValue,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, MetadataEntry>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<ActionParameter>,
}

impl ProviderSnapshot {
    pub(crate) fn capture(state: &ProviderState) -> Self {
        let schema = &state.schema;
        let services = schema
            .services()
            .filter_map(|descriptor| {
                let service = state.service(descriptor.slot)?;
                let resources = descriptor
                    .resources()
                    .map(|resource| {
                        let slot = service.resource(resource.slot).cloned().unwrap_or_default();
                        ResourceSnapshot {
                            provider: state.name.clone(),
                            service: descriptor.name.clone(),
                            name: resource.name.clone(),
                            resource_type: resource.resource_type,
                            value_type: resource.value_type,
                            kind: resource.kind,
                            value: TimedValue {
                                value: slot.value,
                                timestamp: slot.timestamp,
                            },
                            metadata: slot.metadata,
                            parameters: resource.parameters.clone(),
                        }
                    })
                    .collect();
                Some(ServiceSnapshot {
                    provider: state.name.clone(),
                    name: descriptor.name.clone(),
                    resources,
                })
            })
            .collect();

        Self {
            model: schema.name().to_owned(),
            package_uri: schema.package_uri().to_owned(),
            name: state.name.clone(),
            model_version: schema.version(),
            linked: state.linked.iter().cloned().collect(),
            services,
        }
    }

    pub fn service(&self, name: &str) -> Option<&ServiceSnapshot> {
        self.services.iter().find(|s| s.name == name)
    }

    pub fn resource(&self, service: &str, resource: &str) -> Option<&ResourceSnapshot> {
        self.service(service)?.resource(resource)
    }

    /// Value of a resource, if the service exists on this provider.
    pub fn value(&self, service: &str, resource: &str) -> Option<&TimedValue> {
        self.resource(service, resource).map(|r| &r.value)
    }
}

impl ServiceSnapshot {
    pub fn resource(&self, name: &str) -> Option<&ResourceSnapshot> {
        self.resources.iter().find(|r| r.name == name)
    }
}

impl ResourceSnapshot {
    pub fn is_set(&self) -> bool {
        self.value.is_set()
    }
}
