// ── Data updates ──
//
// A `DataUpdate` is the unit of ingestion: one value for one resource,
// with enough naming information to create the model, provider, service
// and resource on the fly if they do not exist yet.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CoreError;
use crate::model::ResourcePath;
use crate::value::ValueKind;

/// One observed value, as delivered by a device connector.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataUpdate {
    /// Model name. Defaults to the provider name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_package_uri: Option<String>,
    #[serde(default)]
    pub provider: String,
    #[serde(default)]
    pub service: String,
    #[serde(default)]
    pub resource: String,
    #[serde(default)]
    pub value: Value,
    /// Declared kind. Inferred from `value` when absent.
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<ValueKind>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,
    /// Observation time. Defaults to the time the update is applied.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl DataUpdate {
    pub fn new(
        provider: impl Into<String>,
        service: impl Into<String>,
        resource: impl Into<String>,
        value: impl Into<Value>,
    ) -> Self {
        Self {
            provider: provider.into(),
            service: service.into(),
            resource: resource.into(),
            value: value.into(),
            ..Self::default()
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_package_uri(mut self, uri: impl Into<String>) -> Self {
        self.model_package_uri = Some(uri.into());
        self
    }

    pub fn with_kind(mut self, kind: ValueKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Effective model name.
    pub fn model_name(&self) -> &str {
        self.model
            .as_deref()
            .filter(|m| !m.trim().is_empty())
            .unwrap_or(&self.provider)
    }

    /// Kind to declare if the resource has to be created.
    pub fn effective_kind(&self) -> ValueKind {
        self.kind.unwrap_or_else(|| ValueKind::infer(&self.value))
    }

    pub fn path(&self) -> ResourcePath {
        ResourcePath::new(
            self.model_name(),
            &self.provider,
            &self.service,
            &self.resource,
        )
    }

    /// Reject updates that cannot name a resource.
    pub fn validate(&self) -> Result<(), CoreError> {
        for (field, value) in [
            ("provider", &self.provider),
            ("service", &self.service),
            ("resource", &self.resource),
        ] {
            if value.trim().is_empty() {
                return Err(CoreError::invalid_input(format!(
                    "data update is missing a {field} name"
                )));
            }
        }
        if self.metadata.keys().any(|k| k.trim().is_empty()) {
            return Err(CoreError::invalid_input("metadata keys must not be empty"));
        }
        Ok(())
    }
}
